use crate::ConnectionRole;
use thiserror::Error;

/// Coarse classification of a [`PageServerError`], deciding how the
/// connection layer reacts to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Malformed, unknown or role-mismatched request. Connection-fatal.
    Protocol,
    /// Send or receive failure. Goes through the abnormal-disconnect path.
    Transport,
    /// Broken coordination invariant.
    Logic,
    /// Storage or log collaborator failure. Reported to the requester.
    Upstream,
    /// Invalid configuration.
    Config,
}

#[derive(Error, Debug)]
pub enum PageServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    #[error("Invalid magic bytes - expected PGSV")]
    InvalidMagic,

    #[error("CRC mismatch: expected {expected:#x}, got {actual:#x}")]
    CrcMismatch { expected: u32, actual: u32 },

    #[error("Payload too large: {0} bytes exceeds maximum")]
    PayloadTooLarge(usize),

    #[error("Unknown request kind: {0:#04x}")]
    UnknownRequest(u8),

    #[error("Request {request} is not valid for {role} connections")]
    RoleMismatch {
        request: &'static str,
        role: ConnectionRole,
    },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Logic error: {0}")]
    Logic(String),

    #[error("Upstream error: {0}")]
    Upstream(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl PageServerError {
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Io(_) | Self::ChannelClosed(_) => ErrorClass::Transport,
            Self::InvalidMagic
            | Self::CrcMismatch { .. }
            | Self::PayloadTooLarge(_)
            | Self::UnknownRequest(_)
            | Self::RoleMismatch { .. }
            | Self::Protocol(_) => ErrorClass::Protocol,
            Self::Logic(_) => ErrorClass::Logic,
            Self::Upstream(_) => ErrorClass::Upstream,
            Self::Config(_) => ErrorClass::Config,
        }
    }

    /// Whether the connection that produced this error must be torn down.
    #[must_use]
    pub fn is_connection_fatal(&self) -> bool {
        !matches!(self.class(), ErrorClass::Upstream)
    }
}

pub type Result<T> = std::result::Result<T, PageServerError>;
