use std::fmt;

/// Position in the log-prior stream.
///
/// Positions only grow; the in-memory store numbers each log-prior chunk it
/// receives, starting at zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LogPosition(u64);

impl LogPosition {
    pub const START: Self = Self(0);

    #[inline]
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    #[inline]
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }

    #[must_use]
    pub fn to_le_bytes(self) -> [u8; 8] {
        self.0.to_le_bytes()
    }

    /// Decode a position from the first eight bytes of `buf`.
    #[must_use]
    pub fn from_le_slice(buf: &[u8]) -> Option<Self> {
        let bytes: [u8; 8] = buf.get(..8)?.try_into().ok()?;
        Some(Self(u64::from_le_bytes(bytes)))
    }
}

impl fmt::Display for LogPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "lp:{}", self.0)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_position_ordering() {
        let p = LogPosition::new(10);
        assert!(p.next() > p);
        assert_eq!(LogPosition::START.as_u64(), 0);
    }

    #[test]
    fn test_position_decode() {
        let p = LogPosition::new(0xDEAD_BEEF);
        let mut buf = p.to_le_bytes().to_vec();
        buf.extend_from_slice(b"trailing");
        assert_eq!(LogPosition::from_le_slice(&buf).unwrap(), p);
        assert!(LogPosition::from_le_slice(&buf[..4]).is_none());
    }
}
