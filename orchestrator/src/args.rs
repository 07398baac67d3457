use clap::{Parser, Subcommand};
use panto_common::args::{PostgresArgs, ProviderArgs, S3Args};

#[derive(Parser, Debug)]
#[command(name = "panto-orchestrator")]
#[command(about = "Multi-stage image upscale orchestration service")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the orchestrator server
    Server(ServerArgs),

    /// Check service health
    Health(EndpointArgs),

    /// Show a job's progress
    Status(JobArgs),

    /// Trigger stitching for a tiles-ready job
    Stitch(JobArgs),

    /// Trigger a reconciler sweep
    CheckAll(EndpointArgs),
}

#[derive(Parser, Debug, Clone)]
pub struct ServerArgs {
    /// Port to listen on
    #[arg(long, env = "PORT", default_value_t = 8080)]
    pub port: u16,

    /// Seconds between reconciler sweeps
    #[arg(long, env = "RECONCILE_INTERVAL_SECS", default_value_t = 10)]
    pub reconcile_interval_secs: u64,

    /// Allowed CORS origins, comma separated (empty mirrors the request
    /// origin, for development)
    #[arg(long, env = "CORS_ORIGINS", value_delimiter = ',')]
    pub cors_origins: Vec<String>,

    #[clap(flatten)]
    pub postgres: PostgresArgs,

    #[clap(flatten)]
    pub s3: S3Args,

    #[clap(flatten)]
    pub provider: ProviderArgs,
}

#[derive(Parser, Debug, Clone)]
pub struct EndpointArgs {
    /// Orchestrator endpoint
    #[arg(long, env = "PANTO_ENDPOINT", default_value = "http://localhost:8080")]
    pub endpoint: String,
}

#[derive(Parser, Debug, Clone)]
pub struct JobArgs {
    /// Orchestrator endpoint
    #[arg(long, env = "PANTO_ENDPOINT", default_value = "http://localhost:8080")]
    pub endpoint: String,

    /// Job UUID
    #[arg(long)]
    pub job_id: String,
}
