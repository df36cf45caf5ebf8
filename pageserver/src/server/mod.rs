//! Server module - TCP listener and orchestration
//!
//! Accepts transaction server connections, reads the role handshake and
//! hands the channel to the [`PageServer`] coordinator.

mod channel;
mod coordinator;
mod handler;

pub use channel::ChannelSender;
pub use coordinator::PageServer;
pub use handler::{ConnectionHandler, DispatchTable, HandlerId};

use crate::config::Config;
use crate::fanout::SinkRegistry;
use crate::shutdown::is_shutdown_requested;
use crate::storage::{Collaborators, MemoryStore};
use bytes::Bytes;
use ps_core::{ConnectionRole, PageServerError, Result};
use ps_network::{Frame, MESSAGE_HEADER_SIZE, MessageHeader};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::{debug, error, info, trace, warn};

/// Handshake payload is a single role byte.
const MAX_HANDSHAKE_PAYLOAD: usize = 1;

/// Main server entry point
pub async fn run(config: Config, shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
    info!(
        target: "pageserver::server",
        listen = %config.listen_addr,
        perm_volumes = config.storage.perm_volume_count,
        replication_parallelism = config.replication.parallel_count,
        "Server starting"
    );

    let sinks = Arc::new(SinkRegistry::new());
    let store = Arc::new(MemoryStore::new(&config.storage, sinks));
    let server = PageServer::new(&config, Collaborators::memory(store));

    let listener = match TcpListener::bind(config.listen_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            server.shutdown().await;
            return Err(e.into());
        },
    };

    serve(listener, server, config.handshake_timeout(), shutdown_rx).await
}

/// Accept loop. Stops accepting on shutdown, then shuts the coordinator down.
pub async fn serve(
    listener: TcpListener,
    server: Arc<PageServer>,
    handshake_timeout: Duration,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<()> {
    info!(
        target: "pageserver::server",
        addr = %listener.local_addr()?,
        "Listening for transaction servers"
    );

    let mut handshakes = JoinSet::new();

    loop {
        tokio::select! {
            accept_result = listener.accept() => {
                match accept_result {
                    Ok((stream, addr)) => {
                        let _ = stream.set_nodelay(true);
                        trace!(target: "pageserver::server", peer = %addr, "Connection accepted");

                        let server = Arc::clone(&server);
                        handshakes.spawn(accept_connection(server, stream, addr, handshake_timeout));
                    }
                    Err(e) => {
                        error!(target: "pageserver::server", error = %e, "Accept failed");
                    }
                }
            }
            _ = shutdown_rx.recv() => {
                info!(target: "pageserver::server", "Shutdown signal received, stopping accept loop");
                break;
            }
        }

        while handshakes.try_join_next().is_some() {}
    }

    drop(listener);
    handshakes.shutdown().await;

    server.shutdown().await;

    info!(target: "pageserver::server", "Server shutdown complete");
    Ok(())
}

async fn accept_connection(
    server: Arc<PageServer>,
    mut stream: TcpStream,
    addr: SocketAddr,
    handshake_timeout: Duration,
) {
    let role = match read_handshake(&mut stream, handshake_timeout).await {
        Ok(role) => role,
        Err(e) => {
            ps_metrics::increment_protocol_errors();
            warn!(
                target: "pageserver::server",
                peer = %addr,
                error = %e,
                "Handshake failed, closing connection"
            );
            return;
        },
    };

    if is_shutdown_requested() {
        debug!(target: "pageserver::server", peer = %addr, "Shutting down, connection refused");
        return;
    }

    let peer = addr.to_string();
    match role {
        ConnectionRole::Active => {
            server.set_active_connection(stream, &peer).await;
            if server.ensure_replicator_started().await {
                info!(target: "pageserver::server", peer = %addr, "Replication started for active transaction server");
            }
        },
        ConnectionRole::Passive => {
            server.set_passive_connection(stream, &peer).await;
        },
    }
}

/// Read the `CONNECT` frame that opens every connection.
pub async fn read_handshake<S>(stream: &mut S, timeout: Duration) -> Result<ConnectionRole>
where
    S: AsyncRead + Unpin,
{
    match tokio::time::timeout(timeout, read_connect_frame(stream)).await {
        Ok(frame) => frame?.connect_role(),
        Err(_) => Err(PageServerError::Protocol(format!(
            "No handshake within {} ms",
            timeout.as_millis()
        ))),
    }
}

async fn read_connect_frame<S>(stream: &mut S) -> Result<Frame>
where
    S: AsyncRead + Unpin,
{
    let mut header_buf = [0u8; MESSAGE_HEADER_SIZE];
    stream.read_exact(&mut header_buf).await?;

    let header = MessageHeader::parse(&header_buf)?;
    let payload_len = header.payload_length as usize;
    if payload_len > MAX_HANDSHAKE_PAYLOAD {
        return Err(PageServerError::PayloadTooLarge(payload_len));
    }

    let mut payload = vec![0u8; payload_len];
    stream.read_exact(&mut payload).await?;
    header.validate_payload(&payload)?;

    Ok(Frame {
        header,
        payload: Bytes::from(payload),
    })
}
