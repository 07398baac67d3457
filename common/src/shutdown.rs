/// Resolves once the process has been asked to stop. Servers pass this to
/// axum's graceful shutdown; the reconciler loop cancels off the same
/// future via its CancellationToken.
pub async fn shutdown_signal() {
    let signal = wait_for_termination().await;
    tracing::warn!(signal, "termination requested, shutting down");
}

#[cfg(unix)]
async fn wait_for_termination() -> &'static str {
    use tokio::signal::unix::{SignalKind, signal};

    // SIGTERM is what the container runtime sends; SIGINT covers local runs.
    let mut terminate = signal(SignalKind::terminate()).expect("install SIGTERM handler");
    let mut interrupt = signal(SignalKind::interrupt()).expect("install SIGINT handler");

    tokio::select! {
        _ = terminate.recv() => "SIGTERM",
        _ = interrupt.recv() => "SIGINT",
    }
}

#[cfg(not(unix))]
async fn wait_for_termination() -> &'static str {
    tokio::signal::ctrl_c()
        .await
        .expect("install Ctrl+C handler");
    "ctrl-c"
}
