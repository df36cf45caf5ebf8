//! Connection handler - one per transaction server channel
//!
//! Decodes incoming requests through a role-specific dispatch table, answers
//! them synchronously or through the async responder, and owns the optional
//! log-prior sink of a passive connection.

use super::channel::{ChannelSender, ChannelTasks, next_channel_id, spawn_channel_tasks};
use crate::fanout::{SinkFn, SinkHandle};
use crate::responder::Responder;
use crate::storage::Collaborators;
use bytes::Bytes;
use ps_core::{ConnectionRole, PageServerError, Result, SequencedPayload};
use ps_network::{PageToTranRequest, TranToPageRequest};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

pub type HandlerId = u64;

static NEXT_HANDLER_ID: AtomicU64 = AtomicU64::new(1);

/// State shared by every handler of one page server.
pub(crate) struct HandlerContext {
    pub collaborators: Collaborators,
    pub responder: Responder,
    pub teardown_tx: mpsc::UnboundedSender<HandlerId>,
    pub max_payload_size: usize,
}

type RequestFn = fn(&ConnectionHandler, SequencedPayload) -> Result<()>;

/// Request kinds a connection accepts, keyed by kind.
pub struct DispatchTable {
    entries: HashMap<TranToPageRequest, RequestFn>,
}

impl DispatchTable {
    pub fn for_role(role: ConnectionRole) -> Self {
        let mut entries: HashMap<TranToPageRequest, RequestFn> = HashMap::new();

        entries.insert(
            TranToPageRequest::GetBootInfo,
            ConnectionHandler::receive_boot_info_request,
        );
        entries.insert(
            TranToPageRequest::SendLogPageFetch,
            ConnectionHandler::receive_log_page_fetch,
        );
        entries.insert(
            TranToPageRequest::SendDataPageFetch,
            ConnectionHandler::receive_data_page_fetch,
        );
        entries.insert(
            TranToPageRequest::SendDisconnectMsg,
            ConnectionHandler::receive_disconnect_request,
        );

        match role {
            ConnectionRole::Active => {
                entries.insert(
                    TranToPageRequest::SendLogPriorList,
                    ConnectionHandler::receive_log_prior_list,
                );
            },
            ConnectionRole::Passive => {
                entries.insert(
                    TranToPageRequest::SendLogBootInfoFetch,
                    ConnectionHandler::receive_log_boot_info_fetch,
                );
                entries.insert(
                    TranToPageRequest::SendStopLogPriorDispatch,
                    ConnectionHandler::receive_stop_log_prior_dispatch,
                );
            },
        }

        Self { entries }
    }

    fn get(&self, request: TranToPageRequest) -> Option<RequestFn> {
        self.entries.get(&request).copied()
    }

    pub fn contains(&self, request: TranToPageRequest) -> bool {
        self.entries.contains_key(&request)
    }
}

pub struct ConnectionHandler {
    id: HandlerId,
    role: ConnectionRole,
    sender: ChannelSender,
    table: DispatchTable,
    ctx: Arc<HandlerContext>,
    sink: Mutex<Option<SinkHandle>>,
    disconnect_triggered: AtomicBool,
    tasks: Mutex<Option<ChannelTasks>>,
}

impl ConnectionHandler {
    pub(crate) fn spawn<S>(
        stream: S,
        peer: &str,
        role: ConnectionRole,
        ctx: Arc<HandlerContext>,
    ) -> Arc<Self>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let channel_id: Arc<str> = Arc::from(next_channel_id(role, peer));
        let (tx, rx) = mpsc::unbounded_channel();
        let max_payload_size = ctx.max_payload_size;

        let handler = Arc::new(Self {
            id: NEXT_HANDLER_ID.fetch_add(1, Ordering::Relaxed),
            role,
            sender: ChannelSender::new(channel_id, tx),
            table: DispatchTable::for_role(role),
            ctx,
            sink: Mutex::new(None),
            disconnect_triggered: AtomicBool::new(false),
            tasks: Mutex::new(None),
        });

        let tasks = spawn_channel_tasks(stream, rx, Arc::downgrade(&handler), max_payload_size);
        *handler
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(tasks);

        ps_metrics::increment_connections();
        info!(
            target: "pageserver::handler",
            handler_id = handler.id,
            channel = handler.channel_id(),
            role = %role,
            "Transaction server connected"
        );

        handler
    }

    #[inline]
    pub fn id(&self) -> HandlerId {
        self.id
    }

    #[inline]
    pub fn role(&self) -> ConnectionRole {
        self.role
    }

    pub fn channel_id(&self) -> &str {
        self.sender.channel_id()
    }

    pub fn has_sink(&self) -> bool {
        self.lock_sink().is_some()
    }

    pub fn is_disconnecting(&self) -> bool {
        self.disconnect_triggered.load(Ordering::Acquire)
    }

    pub fn push(&self, kind: PageToTranRequest, payload: Bytes) -> Result<()> {
        self.sender.push(kind, payload)
    }

    pub fn respond(&self, sp: SequencedPayload) -> Result<()> {
        self.sender.respond(sp)
    }

    /// Route one incoming request by kind.
    pub fn dispatch(&self, kind: u8, sp: SequencedPayload) -> Result<()> {
        let request = TranToPageRequest::try_from(kind)?;
        let Some(handle) = self.table.get(request) else {
            return Err(PageServerError::RoleMismatch {
                request: request.name(),
                role: self.role,
            });
        };

        ps_metrics::increment_requests_dispatched();
        trace!(
            target: "pageserver::handler",
            channel = self.channel_id(),
            request = request.name(),
            rid = sp.rid(),
            "Dispatching request"
        );

        handle(self, sp)
    }

    fn receive_boot_info_request(&self, mut sp: SequencedPayload) -> Result<()> {
        let count = self.ctx.collaborators.pages.perm_volume_count();
        sp.push_payload(Bytes::copy_from_slice(&count.to_le_bytes()));
        self.respond(sp)
    }

    fn receive_log_page_fetch(&self, sp: SequencedPayload) -> Result<()> {
        let pages = Arc::clone(&self.ctx.collaborators.pages);
        self.ctx
            .responder
            .async_execute(self.sender.clone(), sp, move |request| {
                pages.fetch_log_page(request)
            });
        Ok(())
    }

    fn receive_data_page_fetch(&self, sp: SequencedPayload) -> Result<()> {
        let pages = Arc::clone(&self.ctx.collaborators.pages);
        self.ctx
            .responder
            .async_execute(self.sender.clone(), sp, move |request| {
                pages.fetch_data_page(request)
            });
        Ok(())
    }

    fn receive_log_prior_list(&self, mut sp: SequencedPayload) -> Result<()> {
        let message = sp.pull_payload();
        if message.is_empty() {
            return Err(PageServerError::Protocol("Empty log prior list".into()));
        }

        ps_metrics::record_log_prior_received(message.len() as u64);
        self.ctx.collaborators.log_prior.push_message(message);
        Ok(())
    }

    fn receive_log_boot_info_fetch(&self, sp: SequencedPayload) -> Result<()> {
        let producer = Arc::clone(&self.ctx.collaborators.boot_info);

        let (handle, start) = {
            let mut sink = self.lock_sink();
            if sink.is_some() {
                return Err(PageServerError::Logic(format!(
                    "{} fetched log boot info while already receiving log prior lists",
                    self.channel_id()
                )));
            }
            if self.is_disconnecting() {
                return Err(PageServerError::ChannelClosed(self.channel_id().to_string()));
            }

            // Attached before the boot info is packed; `start` is the first
            // chunk this sink receives
            let (handle, start) = producer.attach_log_prior_sink(self.log_prior_sink());
            *sink = Some(handle);
            (handle, start)
        };

        debug!(
            target: "pageserver::handler",
            channel = self.channel_id(),
            sink_id = handle.id(),
            start = %start,
            "Log prior dispatch started"
        );

        self.ctx
            .responder
            .async_execute(self.sender.clone(), sp, move |request| {
                producer.pack_log_boot_info(request, start)
            });
        Ok(())
    }

    fn receive_stop_log_prior_dispatch(&self, mut sp: SequencedPayload) -> Result<()> {
        {
            let mut sink = self.lock_sink();
            let Some(handle) = sink.take() else {
                return Err(PageServerError::Logic(format!(
                    "{} stopped log prior dispatch that was never started",
                    self.channel_id()
                )));
            };
            self.ctx.collaborators.sinks.remove_sink(handle);
        }

        debug!(
            target: "pageserver::handler",
            channel = self.channel_id(),
            "Log prior dispatch stopped"
        );

        sp.push_payload(Bytes::new());
        self.respond(sp)
    }

    fn receive_disconnect_request(&self, _sp: SequencedPayload) -> Result<()> {
        if self.has_sink() {
            return Err(PageServerError::Logic(format!(
                "{} requested disconnect while receiving log prior lists",
                self.channel_id()
            )));
        }

        if self.trigger_disconnect() {
            ps_metrics::increment_graceful_disconnects();
            info!(
                target: "pageserver::handler",
                channel = self.channel_id(),
                "Transaction server requested disconnect"
            );
            self.post_teardown();
        }
        Ok(())
    }

    /// Transport or protocol failure on the channel.
    ///
    /// Always asks the caller to abort; only the first disconnect of this
    /// handler removes its sink and schedules the teardown.
    pub fn abnormal_tran_server_disconnect(&self, error: &PageServerError, abort: &mut bool) {
        *abort = true;

        if !self.trigger_disconnect() {
            debug!(
                target: "pageserver::handler",
                channel = self.channel_id(),
                error = %error,
                "Disconnect already in progress"
            );
            return;
        }

        ps_metrics::increment_abnormal_disconnects();
        warn!(
            target: "pageserver::handler",
            channel = self.channel_id(),
            role = %self.role,
            error = %error,
            "Transaction server disconnected abnormally"
        );

        self.remove_sink();
        self.post_teardown();
    }

    /// Mark the handler as disconnecting, drop its sink and stop reading.
    /// Called by the coordinator only; returns the channel tasks on the
    /// first call.
    pub(crate) fn begin_close(&self) -> Option<ChannelTasks> {
        self.disconnect_triggered.store(true, Ordering::Release);
        self.remove_sink();

        let tasks = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()?;
        tasks.stop_reading();
        Some(tasks)
    }

    /// Stop the channel tasks taken by [`begin_close`](Self::begin_close).
    pub(crate) async fn finish_close(&self, tasks: ChannelTasks) {
        tasks.shutdown().await;
        ps_metrics::decrement_connections();
        info!(
            target: "pageserver::handler",
            handler_id = self.id,
            channel = self.channel_id(),
            "Connection closed"
        );
    }

    fn log_prior_sink(&self) -> SinkFn {
        let sender = self.sender.clone();
        Box::new(move |chunk: Bytes| {
            if chunk.is_empty() {
                return Err(PageServerError::Logic(
                    "Empty log prior list reached a sink".into(),
                ));
            }
            sender.push(PageToTranRequest::SendToPtsLogPriorList, chunk)
        })
    }

    fn trigger_disconnect(&self) -> bool {
        self.disconnect_triggered
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn remove_sink(&self) {
        let mut sink = self.lock_sink();
        if let Some(handle) = sink.take() {
            self.ctx.collaborators.sinks.remove_sink(handle);
        }
    }

    fn post_teardown(&self) {
        if self.ctx.teardown_tx.send(self.id).is_err() {
            debug!(
                target: "pageserver::handler",
                channel = self.channel_id(),
                "Teardown queue closed"
            );
        }
    }

    fn lock_sink(&self) -> std::sync::MutexGuard<'_, Option<SinkHandle>> {
        self.sink.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
