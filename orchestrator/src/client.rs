use anyhow::{Context, Result};
use serde_json::json;
use uuid::Uuid;

/// Client for the orchestrator HTTP API, used by the ops subcommands.
#[derive(Clone)]
pub struct OrchestratorClient {
    client: reqwest::Client,
    base_url: String,
}

impl OrchestratorClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        let base_url: String = base_url.into();
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub async fn health(&self) -> Result<String> {
        let response = self
            .client
            .get(format!("{}/healthz", &self.base_url))
            .send()
            .await
            .context("failed to send health request")?;

        if !response.status().is_success() {
            anyhow::bail!("health check failed: {}", response.status());
        }
        response.text().await.context("failed to read health body")
    }

    pub async fn status(&self, job_id: Uuid) -> Result<serde_json::Value> {
        let response = self
            .client
            .get(format!("{}/status", &self.base_url))
            .query(&[("jobId", job_id.to_string())])
            .send()
            .await
            .context("failed to send status request")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("status request failed: {status} - {body}");
        }
        response
            .json()
            .await
            .context("failed to parse status response")
    }

    pub async fn stitch(&self, job_id: Uuid) -> Result<serde_json::Value> {
        let response = self
            .client
            .post(format!("{}/stitch", &self.base_url))
            .json(&json!({ "jobId": job_id }))
            .send()
            .await
            .context("failed to send stitch request")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("stitch request failed: {status} - {body}");
        }
        response
            .json()
            .await
            .context("failed to parse stitch response")
    }

    pub async fn check_all(&self) -> Result<serde_json::Value> {
        let response = self
            .client
            .post(format!("{}/check-all", &self.base_url))
            .send()
            .await
            .context("failed to send check-all request")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("check-all request failed: {status} - {body}");
        }
        response
            .json()
            .await
            .context("failed to parse check-all response")
    }
}
