use crate::protocol::{MessageFlags, MessageHeader, PageToTranRequest, TranToPageRequest};
use crate::MESSAGE_HEADER_SIZE;
use bytes::Bytes;
use ps_core::{ConnectionRole, PageServerError, RequestId, Result, SequencedPayload};

/// One message on a page server channel: header plus payload.
#[derive(Debug, Clone)]
pub struct Frame {
    pub header: MessageHeader,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(kind: u8, flags: u8, rid: RequestId, payload: Bytes) -> Self {
        let header = MessageHeader::new(kind, flags, rid, &payload);
        Self { header, payload }
    }

    /// Request from a transaction server. `rid` is zero for requests that
    /// expect no answer.
    pub fn new_request(kind: TranToPageRequest, rid: RequestId, payload: Bytes) -> Self {
        Self::new(kind as u8, MessageFlags::None as u8, rid, payload)
    }

    /// Unsolicited message from the page server.
    pub fn new_push(kind: PageToTranRequest, payload: Bytes) -> Self {
        Self::new(kind as u8, MessageFlags::None as u8, 0, payload)
    }

    pub fn new_response(sp: SequencedPayload) -> Self {
        let (rid, payload) = sp.into_parts();
        Self::new(
            PageToTranRequest::Respond as u8,
            MessageFlags::Response as u8,
            rid,
            payload,
        )
    }

    pub fn new_error_response(rid: RequestId, message: &str) -> Self {
        Self::new(
            PageToTranRequest::Respond as u8,
            MessageFlags::Response as u8 | MessageFlags::Error as u8,
            rid,
            Bytes::copy_from_slice(message.as_bytes()),
        )
    }

    /// Handshake frame announcing the role of a new connection.
    /// Payload format: role(1)
    pub fn new_connect(role: ConnectionRole) -> Self {
        Self::new_request(
            TranToPageRequest::Connect,
            0,
            Bytes::copy_from_slice(&[role as u8]),
        )
    }

    /// Role announced by a handshake frame.
    pub fn connect_role(&self) -> Result<ConnectionRole> {
        if self.kind() != TranToPageRequest::Connect as u8 {
            return Err(PageServerError::Protocol(format!(
                "Expected CONNECT handshake, got kind {:#04x}",
                self.kind()
            )));
        }
        match self.payload.as_ref() {
            [role] => ConnectionRole::try_from(*role).map_err(|b| {
                PageServerError::Protocol(format!("Unknown connection role: {}", b))
            }),
            _ => Err(PageServerError::Protocol(
                "CONNECT payload must be a single role byte".into(),
            )),
        }
    }

    #[inline]
    #[must_use]
    pub fn kind(&self) -> u8 {
        self.header.kind
    }

    #[inline]
    #[must_use]
    pub fn rid(&self) -> RequestId {
        self.header.rid
    }

    #[inline]
    #[must_use]
    pub fn is_response(&self) -> bool {
        self.header.is_response()
    }

    #[inline]
    #[must_use]
    pub fn is_error(&self) -> bool {
        self.header.is_error()
    }

    #[must_use]
    pub fn into_sequenced(self) -> SequencedPayload {
        SequencedPayload::new(self.header.rid, self.payload)
    }
}

/// Parse one frame from the front of `buf`.
///
/// Returns `Ok(None)` while the frame is incomplete, and the frame together
/// with the number of bytes it occupied otherwise.
pub fn parse_frame(buf: &[u8], max_payload_size: usize) -> Result<Option<(Frame, usize)>> {
    if buf.len() < MESSAGE_HEADER_SIZE {
        return Ok(None);
    }

    let header = MessageHeader::parse(buf)?;

    let payload_len = header.payload_length as usize;
    if payload_len > max_payload_size {
        return Err(PageServerError::PayloadTooLarge(payload_len));
    }

    let total_len = MESSAGE_HEADER_SIZE + payload_len;
    if buf.len() < total_len {
        return Ok(None);
    }

    let payload_bytes = &buf[MESSAGE_HEADER_SIZE..total_len];
    header.validate_payload(payload_bytes)?;

    let frame = Frame {
        header,
        payload: Bytes::copy_from_slice(payload_bytes),
    };

    Ok(Some((frame, total_len)))
}

pub fn encode_frame(frame: &Frame) -> Vec<u8> {
    let header_bytes = frame.header.encode();

    let mut buf = Vec::with_capacity(MESSAGE_HEADER_SIZE + frame.payload.len());
    buf.extend_from_slice(&header_bytes);
    buf.extend_from_slice(&frame.payload);

    buf
}
