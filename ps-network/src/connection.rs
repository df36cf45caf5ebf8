use crate::frame::{Frame, parse_frame};
use bytes::BytesMut;
use ps_core::Result;

const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;

/// Read side of one channel: accumulates socket reads and yields complete
/// frames in arrival order.
pub struct ConnectionBuffer {
    buffer: BytesMut,
    max_payload_size: usize,
}

impl ConnectionBuffer {
    pub fn new(max_payload_size: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(DEFAULT_BUFFER_SIZE),
            max_payload_size,
        }
    }

    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Next complete frame, or `Ok(None)` until more bytes arrive.
    ///
    /// A frame whose header announces more than `max_payload_size` bytes is
    /// rejected before its payload is buffered.
    pub fn next_frame(&mut self) -> Result<Option<Frame>> {
        let Some((frame, consumed)) = parse_frame(&self.buffer, self.max_payload_size)? else {
            return Ok(None);
        };

        let _ = self.buffer.split_to(consumed);
        if self.buffer.is_empty() && self.buffer.capacity() > DEFAULT_BUFFER_SIZE * 4 {
            self.buffer = BytesMut::with_capacity(DEFAULT_BUFFER_SIZE);
        }

        Ok(Some(frame))
    }

    /// Bytes received that do not yet form a complete frame.
    #[inline]
    #[must_use]
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}
