//! Client for the remote prediction provider.
//!
//! The provider exposes two calls: submit a prediction with a completion
//! webhook, and fetch a prediction by id. Submission is where rate limits
//! bite, so the client retries HTTP 429 honouring the server-advised delay
//! and backs off on network errors; everything else is surfaced to the
//! caller for classification.

use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Attempts per submission before a rate limit becomes an error.
const MAX_SUBMIT_ATTEMPTS: u32 = 5;

/// Base delay for network-error backoff.
const BACKOFF_BASE: Duration = Duration::from_millis(500);

/// Fallback wait when a 429 arrives without a Retry-After header.
const DEFAULT_RATE_LIMIT_WAIT: Duration = Duration::from_secs(2);

/// Per-request deadline: every submit and poll must resolve within this,
/// so a hung provider connection cannot wedge a handler or the reconciler.
const REQUEST_DEADLINE: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PredictionStatus {
    Starting,
    Processing,
    Succeeded,
    Failed,
    Canceled,
}

impl PredictionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PredictionStatus::Succeeded | PredictionStatus::Failed | PredictionStatus::Canceled
        )
    }
}

/// Model output: some models return a single URL, others a list.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PredictionOutput {
    Url(String),
    Many(Vec<String>),
}

impl PredictionOutput {
    pub fn first_url(&self) -> Option<&str> {
        match self {
            PredictionOutput::Url(u) => Some(u.as_str()),
            PredictionOutput::Many(v) => v.first().map(|s| s.as_str()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Prediction {
    pub id: String,
    pub status: PredictionStatus,
    #[serde(default)]
    pub output: Option<PredictionOutput>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider rate limit persisted across {attempts} attempts")]
    RateLimited { attempts: u32 },

    #[error("provider returned {status}: {body}")]
    Http { status: u16, body: String },

    #[error("provider request failed: {0}")]
    Network(#[from] reqwest::Error),
}

/// Textual markers the provider emits when a model ran out of GPU memory.
/// These failures are permanent for the given input size; retrying the same
/// call cannot succeed.
pub fn is_memory_error(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("cuda out of memory")
        || lower.contains("out of memory")
        || lower.contains("cuda error")
        || lower.contains("oom")
        || lower.contains("memory limit")
}

#[async_trait]
pub trait ProviderApi: Send + Sync {
    /// Submit a prediction; the provider will POST a completion event to
    /// `webhook_url` when it reaches a terminal state.
    async fn submit(
        &self,
        model: &str,
        version: &str,
        input: serde_json::Value,
        webhook_url: &str,
    ) -> Result<Prediction, ProviderError>;

    /// Fetch the current state of a prediction.
    async fn get(&self, prediction_id: &str) -> Result<Prediction, ProviderError>;
}

#[derive(Serialize)]
struct SubmitBody<'a> {
    model: &'a str,
    version: &'a str,
    input: serde_json::Value,
    webhook: &'a str,
    webhook_events_filter: [&'a str; 1],
}

/// HTTP client against the provider's prediction API.
#[derive(Clone)]
pub struct ProviderClient {
    client: reqwest::Client,
    base_url: String,
    token: String,
}

impl ProviderClient {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        let base_url: String = base_url.into();
        Self {
            client: reqwest::Client::builder()
                .timeout(REQUEST_DEADLINE)
                .build()
                .expect("build provider http client"),
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.into(),
        }
    }
}

/// Delay before retrying a rate-limited submission: the server-advised
/// Retry-After when present, a fixed default otherwise.
fn rate_limit_wait(retry_after: Option<&str>) -> Duration {
    retry_after
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(DEFAULT_RATE_LIMIT_WAIT)
}

/// Exponential backoff with jitter for network errors.
fn backoff_delay(attempt: u32) -> Duration {
    let exp = BACKOFF_BASE * 2u32.saturating_pow(attempt);
    let jitter = rand::rng().random_range(0..=exp.as_millis() as u64 / 2);
    exp + Duration::from_millis(jitter)
}

#[async_trait]
impl ProviderApi for ProviderClient {
    async fn submit(
        &self,
        model: &str,
        version: &str,
        input: serde_json::Value,
        webhook_url: &str,
    ) -> Result<Prediction, ProviderError> {
        let url = format!("{}/v1/predictions", self.base_url);
        let mut last_network_error: Option<reqwest::Error> = None;

        for attempt in 0..MAX_SUBMIT_ATTEMPTS {
            let body = SubmitBody {
                model,
                version,
                input: input.clone(),
                webhook: webhook_url,
                webhook_events_filter: ["completed"],
            };
            let result = self
                .client
                .post(&url)
                .bearer_auth(&self.token)
                .json(&body)
                .send()
                .await;

            let response = match result {
                Ok(r) => r,
                Err(e) => {
                    let wait = backoff_delay(attempt);
                    tracing::warn!(
                        attempt,
                        wait_ms = wait.as_millis() as u64,
                        error = %e,
                        "provider submit failed on the wire, backing off"
                    );
                    last_network_error = Some(e);
                    tokio::time::sleep(wait).await;
                    continue;
                }
            };

            if response.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
                let wait = rate_limit_wait(
                    response
                        .headers()
                        .get(reqwest::header::RETRY_AFTER)
                        .and_then(|v| v.to_str().ok()),
                );
                tracing::warn!(
                    attempt,
                    wait_ms = wait.as_millis() as u64,
                    model,
                    "provider rate limited, honouring advised delay"
                );
                tokio::time::sleep(wait).await;
                continue;
            }

            if !response.status().is_success() {
                let status = response.status().as_u16();
                let body = response.text().await.unwrap_or_default();
                return Err(ProviderError::Http { status, body });
            }

            return Ok(response.json::<Prediction>().await?);
        }

        match last_network_error {
            Some(e) => Err(ProviderError::Network(e)),
            None => Err(ProviderError::RateLimited {
                attempts: MAX_SUBMIT_ATTEMPTS,
            }),
        }
    }

    async fn get(&self, prediction_id: &str) -> Result<Prediction, ProviderError> {
        let url = format!("{}/v1/predictions/{}", self.base_url, prediction_id);
        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.token)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Http { status, body });
        }

        Ok(response.json::<Prediction>().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_markers_are_detected_case_insensitively() {
        assert!(is_memory_error("CUDA out of memory. Tried to allocate 2.1 GiB"));
        assert!(is_memory_error("worker hit OOM killer"));
        assert!(is_memory_error("process exceeded memory limit"));
        assert!(!is_memory_error("connection reset by peer"));
        assert!(!is_memory_error("invalid input dimensions"));
    }

    #[test]
    fn output_deserializes_from_single_url_or_list() {
        let single: Prediction = serde_json::from_str(
            r#"{"id":"p1","status":"succeeded","output":"https://x/y.png"}"#,
        )
        .unwrap();
        assert_eq!(single.output.unwrap().first_url(), Some("https://x/y.png"));

        let many: Prediction = serde_json::from_str(
            r#"{"id":"p2","status":"succeeded","output":["https://x/a.png","https://x/b.png"]}"#,
        )
        .unwrap();
        assert_eq!(many.output.unwrap().first_url(), Some("https://x/a.png"));
    }

    #[test]
    fn terminal_statuses() {
        assert!(PredictionStatus::Succeeded.is_terminal());
        assert!(PredictionStatus::Failed.is_terminal());
        assert!(PredictionStatus::Canceled.is_terminal());
        assert!(!PredictionStatus::Starting.is_terminal());
        assert!(!PredictionStatus::Processing.is_terminal());
    }

    #[test]
    fn rate_limit_wait_prefers_server_advice() {
        assert_eq!(rate_limit_wait(Some("7")), Duration::from_secs(7));
        assert_eq!(rate_limit_wait(Some(" 3 ")), Duration::from_secs(3));
        assert_eq!(rate_limit_wait(Some("soon")), DEFAULT_RATE_LIMIT_WAIT);
        assert_eq!(rate_limit_wait(None), DEFAULT_RATE_LIMIT_WAIT);
    }

    #[test]
    fn backoff_grows_with_attempts() {
        for attempt in 0..3 {
            let d = backoff_delay(attempt);
            assert!(d >= BACKOFF_BASE * 2u32.pow(attempt));
        }
    }
}
