#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

use clap::Parser;
use pageserver::cli::Args;
use pageserver::config::Config;
use pageserver::{server, shutdown};
use std::path::Path;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // Handle --gen-config before initializing tracing
    if let Some(path) = &args.gen_config {
        if let Err(e) = generate_config(path) {
            eprintln!("Failed to generate config: {}", e);
            std::process::exit(1);
        }
        println!("Generated default config at: {}", path.display());
        return;
    }

    init_tracing();

    let config = match &args.config {
        Some(path) => match Config::from_file(path) {
            Ok(c) => c,
            Err(e) => {
                error!(
                    target: "pageserver",
                    error = %e,
                    path = %path.display(),
                    "Failed to load config file"
                );
                std::process::exit(1);
            },
        },
        None => Config::from_args(&args),
    };

    if let Err(e) = config.validate() {
        error!(target: "pageserver", error = %e, "Invalid configuration");
        std::process::exit(1);
    }

    info!(
        target: "pageserver",
        version = env!("CARGO_PKG_VERSION"),
        listen = %config.listen_addr,
        metrics = %config.metrics_addr,
        "Starting page server"
    );

    if let Err(e) = ps_metrics::init_prometheus_exporter(config.metrics_addr) {
        error!(
            target: "pageserver",
            error = %e,
            "Failed to initialize metrics exporter"
        );
        std::process::exit(1);
    }

    info!(
        target: "pageserver",
        addr = %config.metrics_addr,
        "Prometheus metrics exporter started"
    );

    let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);
    let shutdown_signal = shutdown::install_signal_handlers(shutdown_tx.clone());

    // Start periodic metrics export task
    let metrics_shutdown_rx = shutdown_tx.subscribe();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(1));
        let mut shutdown_rx = metrics_shutdown_rx;
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    ps_metrics::export_to_prometheus();
                }
                _ = shutdown_rx.recv() => {
                    break;
                }
            }
        }
    });

    let mut server_handle = tokio::spawn(server::run(config, shutdown_tx.subscribe()));

    tokio::select! {
        _ = shutdown_signal => {
            info!(target: "pageserver", "Shutdown signal received");
        }
        result = &mut server_handle => {
            match result {
                Ok(Ok(())) => info!(target: "pageserver", "Server exited cleanly"),
                Ok(Err(e)) => error!(target: "pageserver", error = %e, "Server error"),
                Err(e) => error!(target: "pageserver", error = %e, "Server task panicked"),
            }
            info!(target: "pageserver", "Page server shutdown complete");
            return;
        }
    }

    if shutdown::drain_with_timeout(server_handle, shutdown::DRAIN_TIMEOUT).await {
        info!(target: "pageserver", "Graceful drain complete");
    } else {
        warn!(target: "pageserver", "Drain timed out, some requests may be unanswered");
    }

    info!(target: "pageserver", "Page server shutdown complete");
}

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,pageserver=debug"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(filter)
        .init();
}

fn generate_config(path: &Path) -> std::io::Result<()> {
    let config = Config::default();

    let content = format!(
        r#"# Page Server Configuration File
# Generated by: pageserver --gen-config {}
#
# All values shown are defaults. Uncomment and modify as needed.

# =============================================================================
# Network Settings
# =============================================================================

# Address and port for transaction server connections
listen_addr = "{}"

# Address and port for Prometheus metrics endpoint
metrics_addr = "{}"

# Milliseconds a new connection has to send its CONNECT handshake
handshake_timeout_ms = {}

# Maximum payload size per frame in bytes (default: 16 MB)
# Transaction servers sending larger payloads will be disconnected
max_payload_size = {}

# =============================================================================
# Request Responder
# =============================================================================

[responder]
# Page fetches executing concurrently on the blocking pool
max_in_flight = {}

# Seconds shutdown waits for outstanding requests
drain_timeout_secs = {}

# =============================================================================
# Storage Settings
# =============================================================================

[storage]
# Number of permanent volumes reported in boot info
perm_volume_count = {}

# Data page size in bytes
page_size = {}

# =============================================================================
# Replication Settings
# =============================================================================

[replication]
# Parallel lanes applying log prior lists
parallel_count = {}
"#,
        path.display(),
        config.listen_addr,
        config.metrics_addr,
        config.handshake_timeout_ms,
        config.max_payload_size,
        config.responder.max_in_flight,
        config.responder.drain_timeout_secs,
        config.storage.perm_volume_count,
        config.storage.page_size,
        config.replication.parallel_count,
    );

    std::fs::write(path, content)
}
