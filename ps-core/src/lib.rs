#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

mod checksum;
mod error;
mod position;
mod role;
mod sequenced;

pub use checksum::crc32;
pub use error::{ErrorClass, PageServerError, Result};
pub use position::LogPosition;
pub use role::ConnectionRole;
pub use sequenced::{RequestId, SequencedPayload};

pub const PAGE_SERVER_MAGIC: [u8; 4] = [0x50, 0x47, 0x53, 0x56]; // 'PGSV'

/// Size of a data page served by the page store.
pub const DATA_PAGE_SIZE: usize = 16 * 1024;
/// Size of a log page served by the page store.
pub const LOG_PAGE_SIZE: usize = 16 * 1024;
