use anyhow::{Context, Result};
use aws_sdk_s3::Client as S3Client;
use aws_sdk_s3::config::Region;
use aws_sdk_s3::primitives::ByteStream;
use bytes::Bytes;
use uuid::Uuid;

use panto_common::args::S3Args;

/// Blob store over S3. Tile inputs and intermediate outputs live under the
/// staging prefix; finalized outputs are promoted to the permanent prefix.
/// Keys resolve to provider-fetchable URLs via the public base URL.
#[derive(Clone)]
pub struct BlobStore {
    client: S3Client,
    http: reqwest::Client,
    bucket: String,
    staging_prefix: String,
    permanent_prefix: String,
    public_base_url: String,
}

impl BlobStore {
    pub async fn new(args: &S3Args) -> Result<Self> {
        let mut config_loader = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(Region::new(args.region.clone()));

        if let Some(ref endpoint) = args.endpoint {
            config_loader = config_loader.endpoint_url(endpoint);
        }

        let config = config_loader.load().await;
        let client = S3Client::new(&config);

        Ok(Self {
            client,
            http: reqwest::Client::new(),
            bucket: args.bucket.clone(),
            staging_prefix: args.staging_prefix.trim_matches('/').to_string(),
            permanent_prefix: args.permanent_prefix.trim_matches('/').to_string(),
            public_base_url: args.public_base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn public_url(&self, key: &str) -> String {
        format!("{}/{}", self.public_base_url, key)
    }

    fn staging_key(&self, job_id: Uuid, name: &str) -> String {
        format!("{}/jobs/{}/{}", self.staging_prefix, job_id, name)
    }

    fn permanent_key(&self, job_id: Uuid, name: &str) -> String {
        format!("{}/{}/{}", self.permanent_prefix, job_id, name)
    }

    async fn put(&self, key: &str, bytes: Bytes, content_type: &str) -> Result<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type)
            .body(ByteStream::from(bytes))
            .send()
            .await
            .with_context(|| format!("failed to upload s3://{}/{}", self.bucket, key))?;
        Ok(())
    }

    /// Upload a staging blob for a job; returns its public URL.
    pub async fn put_staging(
        &self,
        job_id: Uuid,
        name: &str,
        bytes: Bytes,
        content_type: &str,
    ) -> Result<String> {
        let key = self.staging_key(job_id, name);
        self.put(&key, bytes, content_type).await?;
        Ok(self.public_url(&key))
    }

    /// Upload a permanent blob for a job; returns its public URL.
    pub async fn put_permanent(
        &self,
        job_id: Uuid,
        name: &str,
        bytes: Bytes,
        content_type: &str,
    ) -> Result<String> {
        let key = self.permanent_key(job_id, name);
        self.put(&key, bytes, content_type).await?;
        Ok(self.public_url(&key))
    }

    /// Download an arbitrary URL (provider CDN output or our own staging
    /// blob) into memory.
    pub async fn fetch(&self, url: &str) -> Result<Bytes> {
        let response = self
            .http
            .get(url)
            .send()
            .await
            .with_context(|| format!("failed to fetch {url}"))?;

        if !response.status().is_success() {
            anyhow::bail!("fetch of {} returned {}", url, response.status());
        }

        response
            .bytes()
            .await
            .with_context(|| format!("failed to read body of {url}"))
    }

    /// Pull a provider output down and re-upload it under the permanent
    /// prefix. Provider CDN URLs expire; finalized jobs must not depend on
    /// them.
    pub async fn promote(&self, job_id: Uuid, name: &str, source_url: &str) -> Result<String> {
        let bytes = self.fetch(source_url).await?;
        self.put_permanent(job_id, name, bytes, "image/png").await
    }
}
