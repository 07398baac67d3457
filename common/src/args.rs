use clap::Parser;

#[derive(Parser, Debug, Clone)]
pub struct PostgresArgs {
    /// Host of the database holding job and tile state
    #[arg(long, env = "POSTGRES_HOST", default_value = "localhost")]
    pub postgres_host: String,

    #[arg(long, env = "POSTGRES_PORT", default_value_t = 5432)]
    pub postgres_port: u16,

    /// Database name
    #[arg(long, env = "POSTGRES_DATABASE", default_value = "panto")]
    pub postgres_database: String,

    #[arg(long, env = "POSTGRES_USERNAME", default_value = "postgres")]
    pub postgres_username: String,

    /// Falls back to the POSTGRES_PASSWORD environment variable when unset
    #[arg(long, env = "POSTGRES_PASSWORD")]
    pub postgres_password: Option<String>,

    /// PEM bundle (or single DER cert) for verifying the server; plain TCP
    /// when unset
    #[arg(long, env = "POSTGRES_CA_CERT")]
    pub postgres_ca_cert: Option<String>,

    /// Maximum pooled connections
    #[arg(long, env = "POSTGRES_POOL_SIZE", default_value_t = 16)]
    pub postgres_pool_size: usize,
}

#[derive(Parser, Debug, Clone)]
pub struct S3Args {
    /// S3 bucket holding staged tile inputs and final outputs
    #[arg(long, env = "S3_BUCKET", required = true)]
    pub bucket: String,

    /// Key prefix for staging blobs (tile inputs, intermediate outputs)
    #[arg(long, env = "S3_STAGING_PREFIX", default_value = "staging")]
    pub staging_prefix: String,

    /// Key prefix for permanent blobs (final upscaled outputs)
    #[arg(long, env = "S3_PERMANENT_PREFIX", default_value = "outputs")]
    pub permanent_prefix: String,

    /// S3 endpoint URL (for S3-compatible storage)
    #[arg(long, env = "S3_ENDPOINT")]
    pub endpoint: Option<String>,

    /// S3 region
    #[arg(long, env = "S3_REGION", default_value = "us-east-1")]
    pub region: String,

    /// Public base URL under which bucket keys are reachable by the
    /// prediction provider (CDN or public bucket host, no trailing slash)
    #[arg(long, env = "S3_PUBLIC_BASE_URL", required = true)]
    pub public_base_url: String,
}

#[derive(Parser, Debug, Clone)]
pub struct ProviderArgs {
    /// Prediction provider API base URL
    #[arg(long, env = "PROVIDER_ENDPOINT", required = true)]
    pub provider_endpoint: String,

    /// Provider API token
    #[arg(long, env = "PROVIDER_TOKEN", required = true)]
    pub provider_token: String,

    /// Externally reachable base URL of this service; the provider delivers
    /// completion webhooks to `{base}/callback`
    #[arg(long, env = "CALLBACK_BASE_URL", required = true)]
    pub callback_base_url: String,
}
