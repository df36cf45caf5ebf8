//! Graceful shutdown handling
//!
//! A signal stops the accept loop through the broadcast channel; the server
//! task then closes every connection, finishes replication and drains the
//! responder. `main` bounds that drain with [`drain_with_timeout`].

use ps_core::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Default drain timeout (25s to leave 5s buffer for K8s SIGKILL at 30s)
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(25);

/// Global shutdown flag
pub static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

#[inline]
pub fn is_shutdown_requested() -> bool {
    SHUTDOWN_REQUESTED.load(Ordering::SeqCst)
}

/// Mark shutdown as requested and wake everything subscribed to `shutdown_tx`.
pub fn request_shutdown(shutdown_tx: &broadcast::Sender<()>) {
    SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
    let _ = shutdown_tx.send(());
}

#[cfg(unix)]
#[allow(clippy::expect_used)] // Signal handlers are startup-critical; abort is correct on failure
pub fn install_signal_handlers(
    shutdown_tx: broadcast::Sender<()>,
) -> impl std::future::Future<Output = ()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm = signal(SignalKind::terminate()).expect("Failed to install SIGTERM handler");
    let mut sigint = signal(SignalKind::interrupt()).expect("Failed to install SIGINT handler");

    async move {
        tokio::select! {
            _ = sigterm.recv() => {
                info!(target: "pageserver::shutdown", "SIGTERM received, initiating graceful shutdown");
            }
            _ = sigint.recv() => {
                info!(target: "pageserver::shutdown", "SIGINT received, initiating graceful shutdown");
            }
        }

        request_shutdown(&shutdown_tx);
    }
}

#[cfg(windows)]
pub async fn install_signal_handlers(shutdown_tx: broadcast::Sender<()>) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(target: "pageserver::shutdown", error = %e, "Failed to listen for Ctrl+C");
        return;
    }

    info!(target: "pageserver::shutdown", "Ctrl+C received, initiating graceful shutdown");
    request_shutdown(&shutdown_tx);
}

/// Wait for the server task to finish its shutdown sequence.
/// Returns `true` on a clean exit, `false` on error or timeout.
pub async fn drain_with_timeout(server: JoinHandle<Result<()>>, timeout: Duration) -> bool {
    info!(
        target: "pageserver::shutdown",
        timeout_secs = timeout.as_secs(),
        "Beginning drain sequence"
    );

    let start = std::time::Instant::now();

    match tokio::time::timeout(timeout, server).await {
        Ok(Ok(Ok(()))) => {
            info!(
                target: "pageserver::shutdown",
                elapsed_ms = start.elapsed().as_millis(),
                "Drain sequence complete"
            );
            true
        },
        Ok(Ok(Err(e))) => {
            error!(target: "pageserver::shutdown", error = %e, "Server failed during drain");
            false
        },
        Ok(Err(e)) => {
            error!(target: "pageserver::shutdown", error = %e, "Server task panicked during drain");
            false
        },
        Err(_) => {
            warn!(target: "pageserver::shutdown", "Drain timeout exceeded, forcing shutdown");
            false
        },
    }
}
