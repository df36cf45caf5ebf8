//! In-memory page and log store
//!
//! Log-prior chunks are kept in arrival order and numbered from
//! [`LogPosition::START`]. Data pages are synthesized from their address, so
//! any page of a permanent volume can be fetched.

use super::{
    FinishFuture, LogBootInfoProducer, LogPriorReceiver, PageStore, Replication, ReplicatorFactory,
};
use crate::config::StorageSettings;
use crate::fanout::{SinkFn, SinkHandle, SinkRegistry};
use bytes::Bytes;
use ps_core::{LogPosition, PageServerError, Result};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

struct LogState {
    chunks: Mutex<Vec<Bytes>>,
    /// Number of chunks appended so far
    tail: watch::Sender<u64>,
}

impl LogState {
    fn len(&self) -> u64 {
        self.chunks.lock().unwrap_or_else(PoisonError::into_inner).len() as u64
    }

    fn get(&self, position: u64) -> Option<Bytes> {
        let index = usize::try_from(position).ok()?;
        self.chunks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(index)
            .cloned()
    }
}

pub struct MemoryStore {
    perm_volume_count: i32,
    page_size: usize,
    log: Arc<LogState>,
    sinks: Arc<SinkRegistry>,
    applied: Arc<AtomicU64>,
}

impl MemoryStore {
    pub fn new(settings: &StorageSettings, sinks: Arc<SinkRegistry>) -> Self {
        let (tail, _) = watch::channel(0);
        Self {
            perm_volume_count: settings.perm_volume_count,
            page_size: settings.page_size,
            log: Arc::new(LogState {
                chunks: Mutex::new(Vec::new()),
                tail,
            }),
            sinks,
            applied: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn sinks(&self) -> Arc<SinkRegistry> {
        Arc::clone(&self.sinks)
    }

    /// Position the next log-prior chunk will be stored at.
    pub fn next_position(&self) -> LogPosition {
        LogPosition::new(self.log.len())
    }

    /// Total number of chunks applied by replicators started on this store.
    pub fn applied_count(&self) -> u64 {
        self.applied.load(Ordering::Acquire)
    }
}

impl PageStore for MemoryStore {
    fn fetch_log_page(&self, request: Bytes) -> Result<Bytes> {
        let position = LogPosition::from_le_slice(&request).ok_or_else(|| {
            PageServerError::Protocol("Log page request must carry a u64 page id".into())
        })?;

        self.log
            .get(position.as_u64())
            .ok_or_else(|| PageServerError::Upstream(format!("Log page {} not found", position)))
    }

    fn fetch_data_page(&self, request: Bytes) -> Result<Bytes> {
        let (Some(volume), Some(page)) = (read_i32(&request, 0), read_i32(&request, 4)) else {
            return Err(PageServerError::Protocol(
                "Data page request must carry volume and page ids".into(),
            ));
        };

        if volume < 0 || volume >= self.perm_volume_count {
            return Err(PageServerError::Upstream(format!(
                "Volume {} not found ({} permanent volumes)",
                volume, self.perm_volume_count
            )));
        }
        if page < 0 {
            return Err(PageServerError::Upstream(format!(
                "Invalid page id {} in volume {}",
                page, volume
            )));
        }

        Ok(synthesize_page(volume, page, self.page_size))
    }

    fn perm_volume_count(&self) -> i32 {
        self.perm_volume_count
    }
}

impl LogPriorReceiver for MemoryStore {
    fn push_message(&self, message: Bytes) {
        // Held across the broadcast so sinks see chunks in log order
        let mut chunks = self.log.chunks.lock().unwrap_or_else(PoisonError::into_inner);
        chunks.push(message.clone());
        let position = chunks.len() as u64 - 1;
        self.log.tail.send_replace(chunks.len() as u64);

        let report = self.sinks.broadcast(message);
        trace!(
            target: "pageserver::storage",
            position,
            delivered = report.delivered,
            failed = report.failed,
            "Log prior chunk stored"
        );
    }
}

impl LogBootInfoProducer for MemoryStore {
    fn attach_log_prior_sink(&self, sink: SinkFn) -> (SinkHandle, LogPosition) {
        // Same lock as push_message
        let chunks = self.log.chunks.lock().unwrap_or_else(PoisonError::into_inner);
        let handle = self.sinks.add_sink(sink);
        (handle, LogPosition::new(chunks.len() as u64))
    }

    /// Payload format: start_position(8) perm_volume_count(4)
    fn pack_log_boot_info(&self, request: Bytes, start: LogPosition) -> Result<Bytes> {
        debug!(
            target: "pageserver::storage",
            request_bytes = request.len(),
            start_position = %start,
            "Packed log boot info"
        );

        let mut payload = Vec::with_capacity(12);
        payload.extend_from_slice(&start.to_le_bytes());
        payload.extend_from_slice(&self.perm_volume_count.to_le_bytes());
        Ok(Bytes::from(payload))
    }
}

impl ReplicatorFactory for MemoryStore {
    fn start_position(&self) -> LogPosition {
        LogPosition::START
    }

    fn start(&self, position: LogPosition, parallelism: usize) -> Box<dyn Replication> {
        let parallelism = parallelism.max(1);
        let (stop_tx, stop_rx) = watch::channel(false);

        let workers = (0..parallelism as u64)
            .map(|lane| {
                tokio::spawn(apply_lane(
                    Arc::clone(&self.log),
                    position.as_u64() + lane,
                    parallelism as u64,
                    stop_rx.clone(),
                    Arc::clone(&self.applied),
                ))
            })
            .collect();

        info!(
            target: "pageserver::replication",
            position = %position,
            parallelism,
            "Replicator started"
        );

        Box::new(MemoryReplication {
            position,
            stop_tx,
            workers,
            applied: Arc::clone(&self.applied),
        })
    }
}

pub struct MemoryReplication {
    position: LogPosition,
    stop_tx: watch::Sender<bool>,
    workers: Vec<JoinHandle<()>>,
    applied: Arc<AtomicU64>,
}

impl Replication for MemoryReplication {
    fn wait_finish_during_shutdown(self: Box<Self>) -> FinishFuture {
        let MemoryReplication {
            position,
            stop_tx,
            workers,
            applied,
        } = *self;

        Box::pin(async move {
            let _ = stop_tx.send(true);

            for worker in workers {
                if let Err(e) = worker.await {
                    warn!(target: "pageserver::replication", error = %e, "Replication lane failed");
                }
            }

            info!(
                target: "pageserver::replication",
                start = %position,
                applied = applied.load(Ordering::Acquire),
                "Replicator finished"
            );
        })
    }
}

/// Apply every `stride`-th chunk starting at `next` until stopped, then
/// drain whatever has been appended by the time the stop is observed.
async fn apply_lane(
    log: Arc<LogState>,
    mut next: u64,
    stride: u64,
    mut stop_rx: watch::Receiver<bool>,
    applied: Arc<AtomicU64>,
) {
    let mut tail_rx = log.tail.subscribe();
    let mut stopping = false;

    loop {
        stopping |= *stop_rx.borrow_and_update();

        let tail = log.len();
        while next < tail {
            if let Some(chunk) = log.get(next) {
                trace!(
                    target: "pageserver::replication",
                    position = next,
                    bytes = chunk.len(),
                    "Applied log prior chunk"
                );
                applied.fetch_add(1, Ordering::AcqRel);
                ps_metrics::increment_replicated_entries(1);
            }
            next += stride;
        }

        if stopping {
            break;
        }

        tokio::select! {
            changed = tail_rx.changed() => {
                if changed.is_err() {
                    stopping = true;
                }
            }
            changed = stop_rx.changed() => {
                if changed.is_err() {
                    stopping = true;
                }
            }
        }
    }
}

fn read_i32(buf: &[u8], offset: usize) -> Option<i32> {
    let bytes: [u8; 4] = buf.get(offset..offset + 4)?.try_into().ok()?;
    Some(i32::from_le_bytes(bytes))
}

/// Page layout: volume(4) page(4) then a fill byte derived from the address.
fn synthesize_page(volume: i32, page: i32, page_size: usize) -> Bytes {
    let fill = (volume as u32).wrapping_mul(31).wrapping_add(page as u32) as u8;
    let mut buf = vec![fill; page_size];

    let mut header = [0u8; 8];
    header[0..4].copy_from_slice(&volume.to_le_bytes());
    header[4..8].copy_from_slice(&page.to_le_bytes());
    let n = header.len().min(buf.len());
    buf[..n].copy_from_slice(&header[..n]);

    Bytes::from(buf)
}
