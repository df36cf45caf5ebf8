#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

pub mod cli;
pub mod config;
pub mod fanout;
pub mod responder;
pub mod server;
pub mod shutdown;
pub mod storage;

pub use config::Config;
pub use fanout::{BroadcastReport, SinkFn, SinkHandle, SinkRegistry};
pub use responder::Responder;
pub use server::{ChannelSender, ConnectionHandler, DispatchTable, HandlerId, PageServer};
pub use storage::{
    Collaborators, LogBootInfoProducer, LogPriorReceiver, MemoryStore, PageStore, Replication,
    ReplicatorFactory,
};
