#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![allow(clippy::module_name_repetitions)]

mod connection;
mod frame;
mod protocol;

pub use connection::ConnectionBuffer;
pub use frame::{Frame, encode_frame, parse_frame};
pub use protocol::{
    MessageFlags, MessageHeader, PROTOCOL_VERSION, PageToTranRequest, TranToPageRequest,
};

pub const MESSAGE_HEADER_SIZE: usize = 28;
pub const DEFAULT_MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;
