use anyhow::Result;
use clap::Parser;

mod advance;
mod args;
mod blob;
mod cli;
mod client;
mod db;
mod handlers;
mod metrics;
mod models;
mod reconcile;
mod server;
mod status;
mod stitch;
mod submit;

use args::{Cli, Commands};
use server::run_server;

#[tokio::main]
async fn main() -> Result<()> {
    panto_common::init();

    tracing_subscriber::fmt::init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Server(args) => run_server(args).await,
        Commands::Health(args) => cli::run_health(args).await,
        Commands::Status(args) => cli::run_status(args).await,
        Commands::Stitch(args) => cli::run_stitch(args).await,
        Commands::CheckAll(args) => cli::run_check_all(args).await,
    }
}
