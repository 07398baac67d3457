use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{
    Router, middleware,
    routing::{get, post},
};
use deadpool_postgres::Pool;
use panto_provider::{ProviderApi, ProviderClient};
use tokio_util::sync::CancellationToken;

use panto_common::{access_log, cors, shutdown::shutdown_signal};

use crate::{args::ServerArgs, blob::BlobStore, db, handlers, reconcile};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub pool: Pool,
    pub blob: Arc<BlobStore>,
    pub provider: Arc<dyn ProviderApi>,
    /// Where the provider delivers completion webhooks.
    pub webhook_url: String,
}

/// Run the orchestrator HTTP server and the reconciler loop.
pub async fn run_server(args: ServerArgs) -> Result<()> {
    let pool = panto_common::postgres::create_pool(args.postgres.clone())
        .context("failed to create postgres pool")?;
    db::init_schema(&pool)
        .await
        .context("failed to initialize database schema")?;

    let blob = Arc::new(BlobStore::new(&args.s3).await?);
    let provider: Arc<dyn ProviderApi> = Arc::new(ProviderClient::new(
        &args.provider.provider_endpoint,
        &args.provider.provider_token,
    ));
    let webhook_url = format!(
        "{}/callback",
        args.provider.callback_base_url.trim_end_matches('/')
    );
    let state = AppState {
        pool,
        blob,
        provider,
        webhook_url,
    };

    panto_common::metrics::maybe_spawn_metrics_server();

    let cancel = CancellationToken::new();
    {
        let state = state.clone();
        let cancel = cancel.clone();
        let interval = Duration::from_secs(args.reconcile_interval_secs);
        tokio::spawn(async move {
            reconcile::run_loop(state, interval, cancel).await;
        });
    }

    let cors = if args.cors_origins.is_empty() {
        cors::dev()
    } else {
        let origins: Vec<&str> = args.cors_origins.iter().map(String::as_str).collect();
        cors::prod(&origins)
    };

    let app = Router::new()
        .route("/healthz", get(handlers::health))
        .route("/readyz", get(handlers::health))
        .route("/submit", post(handlers::submit))
        .route("/callback", post(handlers::callback))
        .route("/status", get(handlers::status))
        .route("/resume", post(handlers::resume))
        .route("/check-all", post(handlers::check_all))
        .route("/stitch", post(handlers::stitch))
        .layer(middleware::from_fn(access_log::public))
        .layer(cors)
        .with_state(state);

    let addr: SocketAddr = format!("0.0.0.0:{}", args.port).parse()?;
    tracing::info!(%addr, "starting orchestrator HTTP server");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    panto_common::signal_ready();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            cancel.cancel();
        })
        .await?;
    tracing::info!("server stopped gracefully");
    Ok(())
}
