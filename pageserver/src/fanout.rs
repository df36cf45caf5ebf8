//! Fan-out of log-prior chunks to subscribed passive transaction servers
//!
//! Each passive connection that fetched log boot info owns one sink in the
//! registry. The log-prior receiver broadcasts every chunk it accepts to all
//! registered sinks.

use bytes::Bytes;
use ps_core::Result;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tracing::{debug, trace, warn};

/// Callback invoked once per broadcast chunk.
pub type SinkFn = Box<dyn Fn(Bytes) -> Result<()> + Send + Sync>;

/// Opaque registration returned by [`SinkRegistry::add_sink`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SinkHandle(u64);

impl SinkHandle {
    #[inline]
    pub fn id(self) -> u64 {
        self.0
    }
}

/// Outcome of one [`SinkRegistry::broadcast`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub failed: usize,
}

struct SinkSlot {
    // Held for the whole invocation; removal takes it to clear the callback
    callback: Mutex<Option<SinkFn>>,
}

pub struct SinkRegistry {
    next_id: AtomicU64,
    sinks: RwLock<HashMap<u64, Arc<SinkSlot>>>,
    broadcast_lock: Mutex<()>,
}

impl SinkRegistry {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            sinks: RwLock::new(HashMap::new()),
            broadcast_lock: Mutex::new(()),
        }
    }

    pub fn add_sink(&self, callback: SinkFn) -> SinkHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let slot = Arc::new(SinkSlot {
            callback: Mutex::new(Some(callback)),
        });

        self.sinks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, slot);

        ps_metrics::increment_sinks_registered();
        debug!(target: "pageserver::fanout", sink_id = id, "Sink registered");

        SinkHandle(id)
    }

    /// Unregister a sink.
    ///
    /// Blocks while a broadcast is invoking this sink. Once it returns the
    /// callback has been dropped and is never invoked again. Returns `false`
    /// if the handle was not registered.
    pub fn remove_sink(&self, handle: SinkHandle) -> bool {
        let slot = self
            .sinks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&handle.0);

        let Some(slot) = slot else {
            return false;
        };

        let callback = slot
            .callback
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        drop(callback);

        ps_metrics::decrement_sinks_registered();
        debug!(target: "pageserver::fanout", sink_id = handle.0, "Sink removed");

        true
    }

    /// Deliver `payload` to every sink registered when the call starts.
    ///
    /// A failing sink is counted and logged; delivery to the others
    /// continues. Concurrent broadcasts are serialized so each sink sees
    /// chunks in the order they were broadcast.
    pub fn broadcast(&self, payload: Bytes) -> BroadcastReport {
        let _order = self
            .broadcast_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let snapshot: Vec<(u64, Arc<SinkSlot>)> = self
            .sinks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(id, slot)| (*id, Arc::clone(slot)))
            .collect();

        let mut report = BroadcastReport::default();
        for (id, slot) in snapshot {
            let callback = slot.callback.lock().unwrap_or_else(PoisonError::into_inner);
            // Removed after the snapshot was taken
            let Some(callback) = callback.as_ref() else {
                continue;
            };

            match callback(payload.clone()) {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    report.failed += 1;
                    warn!(
                        target: "pageserver::fanout",
                        sink_id = id,
                        error = %e,
                        "Sink delivery failed"
                    );
                },
            }
        }

        ps_metrics::record_broadcast(report.delivered as u64, report.failed as u64);
        trace!(
            target: "pageserver::fanout",
            bytes = payload.len(),
            delivered = report.delivered,
            failed = report.failed,
            "Broadcast complete"
        );

        report
    }

    pub fn sink_count(&self) -> usize {
        self.sinks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl Default for SinkRegistry {
    fn default() -> Self {
        Self::new()
    }
}
