use std::fmt;

/// Role of a transaction server connected to the page server.
///
/// Fixed when the connection is established and never changes afterwards.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionRole {
    /// The primary transaction server producing the authoritative log.
    Active = 0,
    /// A replica transaction server consuming the log-prior stream.
    Passive = 1,
}

impl ConnectionRole {
    /// Channel name used for logging, one per role.
    #[must_use]
    pub fn channel_name(self) -> &'static str {
        match self {
            Self::Active => "ATS_PS_comm",
            Self::Passive => "PTS_PS_comm",
        }
    }
}

impl TryFrom<u8> for ConnectionRole {
    type Error = u8;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Active),
            1 => Ok(Self::Passive),
            other => Err(other),
        }
    }
}

impl fmt::Display for ConnectionRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Passive => write!(f, "passive"),
        }
    }
}
