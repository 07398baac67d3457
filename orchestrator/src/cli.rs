use anyhow::{Context, Result};
use uuid::Uuid;

use crate::args::{EndpointArgs, JobArgs};
use crate::client::OrchestratorClient;

pub async fn run_health(args: EndpointArgs) -> Result<()> {
    let client = OrchestratorClient::new(args.endpoint);
    let body = client.health().await?;
    println!("{body}");
    Ok(())
}

pub async fn run_status(args: JobArgs) -> Result<()> {
    let job_id = Uuid::parse_str(&args.job_id).context("invalid job id")?;
    let client = OrchestratorClient::new(args.endpoint);
    let status = client.status(job_id).await?;
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}

pub async fn run_stitch(args: JobArgs) -> Result<()> {
    let job_id = Uuid::parse_str(&args.job_id).context("invalid job id")?;
    let client = OrchestratorClient::new(args.endpoint);
    let result = client.stitch(job_id).await?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

pub async fn run_check_all(args: EndpointArgs) -> Result<()> {
    let client = OrchestratorClient::new(args.endpoint);
    let result = client.check_all().await?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}
