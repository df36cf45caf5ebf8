//! Channel plumbing - framed reader and writer tasks for one connection
//!
//! Every outgoing frame (responses from any task, pushes from sinks) goes
//! through one unbounded queue drained by a single writer task, so frames
//! never interleave on the wire.

use super::handler::ConnectionHandler;
use bytes::Bytes;
use ps_core::{ConnectionRole, PageServerError, RequestId, Result, SequencedPayload};
use ps_network::{ConnectionBuffer, Frame, PageToTranRequest, encode_frame};
use std::sync::Arc;
use std::sync::Weak;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

const READ_CHUNK_SIZE: usize = 64 * 1024;

/// How long a closing writer may spend flushing before it is aborted.
const WRITER_CLOSE_GRACE: Duration = Duration::from_secs(1);

static CHANNEL_SEQ: AtomicU64 = AtomicU64::new(1);

/// Stable identifier `"<name>:<peer>#<seq>"` for a new channel.
pub fn next_channel_id(role: ConnectionRole, peer: &str) -> String {
    let seq = CHANNEL_SEQ.fetch_add(1, Ordering::Relaxed);
    format!("{}:{}#{}", role.channel_name(), peer, seq)
}

/// Cloneable handle for queueing frames on a channel.
#[derive(Clone)]
pub struct ChannelSender {
    channel_id: Arc<str>,
    tx: mpsc::UnboundedSender<Frame>,
}

impl ChannelSender {
    pub(crate) fn new(channel_id: Arc<str>, tx: mpsc::UnboundedSender<Frame>) -> Self {
        Self { channel_id, tx }
    }

    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    fn send(&self, frame: Frame) -> Result<()> {
        self.tx
            .send(frame)
            .map_err(|_| PageServerError::ChannelClosed(self.channel_id.to_string()))
    }

    pub fn push(&self, kind: PageToTranRequest, payload: Bytes) -> Result<()> {
        self.send(Frame::new_push(kind, payload))?;
        ps_metrics::increment_pushes_sent();
        Ok(())
    }

    pub fn respond(&self, sp: SequencedPayload) -> Result<()> {
        self.send(Frame::new_response(sp))?;
        ps_metrics::increment_responses_sent();
        Ok(())
    }

    pub fn respond_error(&self, rid: RequestId, message: &str) -> Result<()> {
        self.send(Frame::new_error_response(rid, message))?;
        ps_metrics::increment_responses_sent();
        Ok(())
    }
}

pub(crate) struct ChannelTasks {
    pub reader: JoinHandle<()>,
    pub writer: JoinHandle<()>,
    pub close_tx: oneshot::Sender<()>,
}

impl ChannelTasks {
    /// Stop dispatching frames from this channel. Queued output is kept.
    pub fn stop_reading(&self) {
        self.reader.abort();
    }

    /// Stop reading, flush frames already queued, and wait for both tasks.
    /// A writer stuck on a peer that stopped reading is aborted after
    /// [`WRITER_CLOSE_GRACE`].
    pub async fn shutdown(self) {
        let ChannelTasks {
            reader,
            mut writer,
            close_tx,
        } = self;

        reader.abort();
        let _ = close_tx.send(());

        if let Err(e) = reader.await {
            if !e.is_cancelled() {
                warn!(target: "pageserver::channel", error = %e, "Reader task failed");
            }
        }

        match tokio::time::timeout(WRITER_CLOSE_GRACE, &mut writer).await {
            Ok(Ok(())) => {},
            Ok(Err(e)) => {
                warn!(target: "pageserver::channel", error = %e, "Writer task failed");
            },
            Err(_) => {
                ps_metrics::increment_writer_aborts();
                warn!(
                    target: "pageserver::channel",
                    grace_ms = WRITER_CLOSE_GRACE.as_millis() as u64,
                    "Peer stopped reading, queued frames dropped"
                );
                writer.abort();
                let _ = writer.await;
            },
        }
    }
}

pub(crate) fn spawn_channel_tasks<S>(
    stream: S,
    rx: mpsc::UnboundedReceiver<Frame>,
    handler: Weak<ConnectionHandler>,
    max_payload_size: usize,
) -> ChannelTasks
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (read_half, write_half) = tokio::io::split(stream);
    let (close_tx, close_rx) = oneshot::channel();

    let writer = tokio::spawn(run_writer(write_half, rx, close_rx, Weak::clone(&handler)));
    let reader = tokio::spawn(run_reader(
        read_half,
        handler,
        ConnectionBuffer::new(max_payload_size),
    ));

    ChannelTasks {
        reader,
        writer,
        close_tx,
    }
}

async fn run_writer<S>(
    mut writer: WriteHalf<S>,
    mut rx: mpsc::UnboundedReceiver<Frame>,
    mut close_rx: oneshot::Receiver<()>,
    handler: Weak<ConnectionHandler>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    loop {
        tokio::select! {
            biased;
            frame = rx.recv() => {
                let Some(frame) = frame else {
                    break;
                };
                if let Err(e) = write_frame(&mut writer, &frame).await {
                    report_failure(&handler, e);
                    return;
                }
            }
            _ = &mut close_rx => {
                while let Ok(frame) = rx.try_recv() {
                    if let Err(e) = write_frame(&mut writer, &frame).await {
                        debug!(target: "pageserver::channel", error = %e, "Flush on close failed");
                        break;
                    }
                }
                break;
            }
        }
    }

    let _ = writer.shutdown().await;
}

async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &Frame) -> Result<()> {
    let encoded = encode_frame(frame);
    writer.write_all(&encoded).await?;
    writer.flush().await?;
    Ok(())
}

async fn run_reader<S>(
    mut reader: ReadHalf<S>,
    handler: Weak<ConnectionHandler>,
    mut buffer: ConnectionBuffer,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let mut chunk = vec![0u8; READ_CHUNK_SIZE];

    loop {
        let n = match reader.read(&mut chunk).await {
            Ok(0) => {
                report_failure(
                    &handler,
                    PageServerError::ChannelClosed("peer closed the connection".into()),
                );
                return;
            },
            Ok(n) => n,
            Err(e) => {
                report_failure(&handler, e.into());
                return;
            },
        };
        buffer.extend(&chunk[..n]);

        loop {
            let frame = match buffer.next_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(e) => {
                    ps_metrics::increment_protocol_errors();
                    report_failure(&handler, e);
                    return;
                },
            };

            let Some(h) = handler.upgrade() else {
                return;
            };

            trace!(
                target: "pageserver::channel",
                channel = h.channel_id(),
                kind = frame.kind(),
                rid = frame.rid(),
                "Frame received"
            );

            if let Err(e) = h.dispatch(frame.kind(), frame.into_sequenced()) {
                if e.is_connection_fatal() {
                    ps_metrics::increment_protocol_errors();
                    let mut abort = false;
                    h.abnormal_tran_server_disconnect(&e, &mut abort);
                    if abort {
                        return;
                    }
                } else {
                    warn!(
                        target: "pageserver::channel",
                        channel = h.channel_id(),
                        error = %e,
                        "Request failed"
                    );
                }
            }

            // Graceful disconnect requested; the coordinator closes the channel
            if h.is_disconnecting() {
                return;
            }
        }
    }
}

fn report_failure(handler: &Weak<ConnectionHandler>, error: PageServerError) {
    if let Some(h) = handler.upgrade() {
        let mut abort = false;
        h.abnormal_tran_server_disconnect(&error, &mut abort);
    }
}
