//! Storage collaborators used by connection handlers
//!
//! The page server only coordinates; pages, the log and replication are
//! provided through these traits. [`MemoryStore`] implements all of them.

mod memory;

pub use memory::{MemoryReplication, MemoryStore};

use crate::fanout::{SinkFn, SinkHandle, SinkRegistry};
use bytes::Bytes;
use ps_core::{LogPosition, Result};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

pub type FinishFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

pub trait PageStore: Send + Sync {
    /// Request payload: log page id, `u64` little endian.
    fn fetch_log_page(&self, request: Bytes) -> Result<Bytes>;

    /// Request payload: volume id `i32` + page id `i32`, little endian.
    fn fetch_data_page(&self, request: Bytes) -> Result<Bytes>;

    fn perm_volume_count(&self) -> i32;
}

/// Accepts log-prior lists from the active transaction server.
pub trait LogPriorReceiver: Send + Sync {
    fn push_message(&self, message: Bytes);
}

pub trait LogBootInfoProducer: Send + Sync {
    /// Register `sink` in the shared [`SinkRegistry`] for every log-prior
    /// chunk stored from now on.
    ///
    /// Returns the registration and the log position of the first chunk the
    /// sink will receive. No chunk may be stored between taking that
    /// position and registering the sink.
    fn attach_log_prior_sink(&self, sink: SinkFn) -> (SinkHandle, LogPosition);

    /// Pack the boot info of a passive transaction server whose sink
    /// receives chunks from `start` on.
    fn pack_log_boot_info(&self, request: Bytes, start: LogPosition) -> Result<Bytes>;
}

pub trait ReplicatorFactory: Send + Sync {
    /// Position replication starts from when the first active transaction
    /// server connects.
    fn start_position(&self) -> LogPosition;

    fn start(&self, position: LogPosition, parallelism: usize) -> Box<dyn Replication>;
}

pub trait Replication: Send {
    /// Apply everything received so far, then stop.
    fn wait_finish_during_shutdown(self: Box<Self>) -> FinishFuture;
}

/// Collaborators shared by every connection handler.
#[derive(Clone)]
pub struct Collaborators {
    pub pages: Arc<dyn PageStore>,
    pub log_prior: Arc<dyn LogPriorReceiver>,
    pub boot_info: Arc<dyn LogBootInfoProducer>,
    pub replicator: Arc<dyn ReplicatorFactory>,
    pub sinks: Arc<SinkRegistry>,
}

impl Collaborators {
    /// Wire every collaborator to one in-memory store.
    pub fn memory(store: Arc<MemoryStore>) -> Self {
        let sinks = store.sinks();
        Self {
            pages: Arc::clone(&store) as Arc<dyn PageStore>,
            log_prior: Arc::clone(&store) as Arc<dyn LogPriorReceiver>,
            boot_info: Arc::clone(&store) as Arc<dyn LogBootInfoProducer>,
            replicator: store as Arc<dyn ReplicatorFactory>,
            sinks,
        }
    }
}
