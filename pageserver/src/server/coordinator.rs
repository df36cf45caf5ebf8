//! Page server coordinator
//!
//! Owns the connection handlers of the active and passive transaction
//! servers and the replicator. All transitions are serialized by one lock.
//! Handlers never destroy themselves; they post their id to the teardown
//! queue and the coordinator closes them. A handler is detached from the
//! set under the lock and its channel finishes closing on its own task, so
//! no transition waits on a peer.

use super::handler::{ConnectionHandler, HandlerContext, HandlerId};
use crate::config::Config;
use crate::responder::Responder;
use crate::storage::{Collaborators, Replication};
use bytes::Bytes;
use ps_core::{ConnectionRole, LogPosition, PageServerError, Result};
use ps_network::PageToTranRequest;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Default)]
struct ConnectionSet {
    active: Option<Arc<ConnectionHandler>>,
    passive: Vec<Arc<ConnectionHandler>>,
    replicator: Option<Box<dyn Replication>>,
}

impl ConnectionSet {
    fn take(&mut self, id: HandlerId) -> Option<Arc<ConnectionHandler>> {
        if self.active.as_ref().is_some_and(|h| h.id() == id) {
            return self.active.take();
        }
        let index = self.passive.iter().position(|h| h.id() == id)?;
        Some(self.passive.remove(index))
    }

    fn take_all(&mut self) -> Vec<Arc<ConnectionHandler>> {
        let mut handlers: Vec<_> = self.active.take().into_iter().collect();
        handlers.append(&mut self.passive);
        handlers
    }

    fn is_empty(&self) -> bool {
        self.active.is_none() && self.passive.is_empty() && self.replicator.is_none()
    }
}

pub struct PageServer {
    ctx: Arc<HandlerContext>,
    state: tokio::sync::Mutex<ConnectionSet>,
    replication_parallelism: usize,
    drain_timeout: Duration,
    teardown_task: Mutex<Option<JoinHandle<()>>>,
    closing: Mutex<Vec<JoinHandle<()>>>,
}

impl PageServer {
    /// Create the coordinator and start its teardown queue.
    /// Must be called within a Tokio runtime.
    pub fn new(config: &Config, collaborators: Collaborators) -> Arc<Self> {
        let (teardown_tx, teardown_rx) = mpsc::unbounded_channel();

        let ctx = Arc::new(HandlerContext {
            collaborators,
            responder: Responder::new(config.responder.max_in_flight),
            teardown_tx,
            max_payload_size: config.max_payload_size,
        });

        let server = Arc::new(Self {
            ctx,
            state: tokio::sync::Mutex::new(ConnectionSet::default()),
            replication_parallelism: config.replication.parallel_count,
            drain_timeout: config.drain_timeout(),
            teardown_task: Mutex::new(None),
            closing: Mutex::new(Vec::new()),
        });

        let task = tokio::spawn(run_teardown_queue(Arc::downgrade(&server), teardown_rx));
        *server
            .teardown_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(task);

        server
    }

    pub fn collaborators(&self) -> &Collaborators {
        &self.ctx.collaborators
    }

    /// Install the active transaction server's channel, closing the previous
    /// active connection first.
    pub async fn set_active_connection<S>(&self, stream: S, peer: &str) -> HandlerId
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let mut state = self.state.lock().await;

        if let Some(previous) = state.active.take() {
            info!(
                target: "pageserver::server",
                channel = previous.channel_id(),
                "Replacing active transaction server connection"
            );
            self.schedule_close(previous);
        }

        let handler =
            ConnectionHandler::spawn(stream, peer, ConnectionRole::Active, Arc::clone(&self.ctx));
        let id = handler.id();
        state.active = Some(handler);
        ps_metrics::increment_active_connects();

        id
    }

    pub async fn set_passive_connection<S>(&self, stream: S, peer: &str) -> HandlerId
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        // Locked before the reader starts, so a teardown posted by an early
        // disconnect finds the handler registered
        let mut state = self.state.lock().await;

        let handler =
            ConnectionHandler::spawn(stream, peer, ConnectionRole::Passive, Arc::clone(&self.ctx));
        let id = handler.id();
        state.passive.push(handler);
        ps_metrics::increment_passive_connects();

        debug!(
            target: "pageserver::server",
            handler_id = id,
            passive_count = state.passive.len(),
            "Passive transaction server registered"
        );

        id
    }

    /// Remove a handler from whichever collection holds it and close it.
    /// Returns once the handler is detached; its channel closes in the
    /// background. Unknown ids are ignored.
    pub async fn disconnect(&self, id: HandlerId) {
        let mut state = self.state.lock().await;

        match state.take(id) {
            Some(handler) => {
                let role = handler.role();
                self.schedule_close(handler);
                info!(
                    target: "pageserver::server",
                    handler_id = id,
                    role = %role,
                    "Transaction server removed"
                );
            },
            None => {
                debug!(
                    target: "pageserver::server",
                    handler_id = id,
                    "Disconnect for unknown handler ignored"
                );
            },
        }
    }

    pub async fn disconnect_all_tran_server(&self) {
        let mut state = self.state.lock().await;
        let handlers = state.take_all();

        if handlers.is_empty() {
            return;
        }

        info!(
            target: "pageserver::server",
            count = handlers.len(),
            "Disconnecting all transaction servers"
        );
        for handler in handlers {
            self.schedule_close(handler);
        }
    }

    pub async fn is_active_tran_server_connected(&self) -> bool {
        self.state.lock().await.active.is_some()
    }

    pub async fn passive_connection_count(&self) -> usize {
        self.state.lock().await.passive.len()
    }

    /// Registered handler with the given id.
    pub async fn connection(&self, id: HandlerId) -> Option<Arc<ConnectionHandler>> {
        let state = self.state.lock().await;
        state
            .active
            .iter()
            .chain(state.passive.iter())
            .find(|h| h.id() == id)
            .cloned()
    }

    pub async fn push_request_to_active_tran_server(
        &self,
        kind: PageToTranRequest,
        payload: Bytes,
    ) -> Result<()> {
        let state = self.state.lock().await;
        let Some(active) = state.active.as_ref() else {
            return Err(PageServerError::ChannelClosed(
                "no active transaction server connected".into(),
            ));
        };
        active.push(kind, payload)
    }

    /// Panics if a replicator is already running.
    pub async fn start_replicator(&self, position: LogPosition) {
        let mut state = self.state.lock().await;
        assert!(state.replicator.is_none(), "replicator is already running");
        state.replicator = Some(self.spawn_replicator(position));
    }

    /// Start the replicator at the store's start position unless one is
    /// already running. Returns whether it was started.
    pub async fn ensure_replicator_started(&self) -> bool {
        let mut state = self.state.lock().await;
        if state.replicator.is_some() {
            return false;
        }
        let position = self.ctx.collaborators.replicator.start_position();
        state.replicator = Some(self.spawn_replicator(position));
        true
    }

    /// Stop the replicator after it applied everything received so far.
    /// Panics if no replicator is running.
    pub async fn stop_replicator(&self) {
        let mut state = self.state.lock().await;
        let replicator = state.replicator.take();
        assert!(replicator.is_some(), "replicator is not running");

        if let Some(replicator) = replicator {
            replicator.wait_finish_during_shutdown().await;
        }
    }

    pub async fn is_replicator_running(&self) -> bool {
        self.state.lock().await.replicator.is_some()
    }

    pub fn responder_in_flight(&self) -> usize {
        self.ctx.responder.in_flight()
    }

    /// Close every connection, finish replication and drain the responder.
    pub async fn shutdown(&self) {
        info!(target: "pageserver::server", "Page server shutting down");

        self.disconnect_all_tran_server().await;
        self.wait_closed().await;

        let replicator = self.state.lock().await.replicator.take();
        if let Some(replicator) = replicator {
            replicator.wait_finish_during_shutdown().await;
        }

        if !self.ctx.responder.finalize(self.drain_timeout).await {
            warn!(
                target: "pageserver::server",
                in_flight = self.ctx.responder.in_flight(),
                "Responder did not drain before shutdown"
            );
        }

        let task = self
            .teardown_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            task.abort();
        }

        info!(target: "pageserver::server", "Page server shutdown complete");
    }

    /// Detach `handler` from its peer and finish closing its channel on a
    /// separate task.
    fn schedule_close(&self, handler: Arc<ConnectionHandler>) {
        let Some(tasks) = handler.begin_close() else {
            return;
        };

        let task = tokio::spawn(async move {
            handler.finish_close(tasks).await;
        });

        let mut closing = self.closing.lock().unwrap_or_else(PoisonError::into_inner);
        closing.retain(|task| !task.is_finished());
        closing.push(task);
    }

    /// Wait for every scheduled close to finish.
    async fn wait_closed(&self) {
        loop {
            let tasks = std::mem::take(
                &mut *self.closing.lock().unwrap_or_else(PoisonError::into_inner),
            );
            if tasks.is_empty() {
                return;
            }
            for task in tasks {
                if let Err(e) = task.await {
                    warn!(target: "pageserver::server", error = %e, "Connection close task failed");
                }
            }
        }
    }

    fn spawn_replicator(&self, position: LogPosition) -> Box<dyn Replication> {
        self.ctx
            .collaborators
            .replicator
            .start(position, self.replication_parallelism)
    }
}

impl Drop for PageServer {
    fn drop(&mut self) {
        if std::thread::panicking() {
            return;
        }
        debug_assert!(
            self.state.get_mut().is_empty(),
            "page server dropped with live connections or a running replicator"
        );
    }
}

async fn run_teardown_queue(server: Weak<PageServer>, mut rx: mpsc::UnboundedReceiver<HandlerId>) {
    while let Some(id) = rx.recv().await {
        let Some(server) = server.upgrade() else {
            break;
        };
        server.disconnect(id).await;
    }
    debug!(target: "pageserver::server", "Teardown queue stopped");
}
