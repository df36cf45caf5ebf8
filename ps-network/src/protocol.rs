use ps_core::{PAGE_SERVER_MAGIC, PageServerError, RequestId, Result, crc32};

pub const PROTOCOL_VERSION: u8 = 1;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageFlags {
    None = 0x00,
    /// Frame answers an earlier request with the same rid.
    Response = 0x01,
    /// Response payload is an error message instead of a result.
    Error = 0x02,
}

/// Requests sent by a transaction server to the page server.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TranToPageRequest {
    // Common to both roles (0x01-0x04)
    GetBootInfo = 0x01,
    SendLogPageFetch = 0x02,
    SendDataPageFetch = 0x03,
    SendDisconnectMsg = 0x04,

    // Active transaction server only
    SendLogPriorList = 0x05,

    // Passive transaction server only
    SendLogBootInfoFetch = 0x06,
    SendStopLogPriorDispatch = 0x07,

    /// First frame on a new connection, carries the connection role.
    Connect = 0x10,

    /// Reply to a request the page server sent.
    Respond = 0x80,
}

impl TranToPageRequest {
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::GetBootInfo => "GET_BOOT_INFO",
            Self::SendLogPageFetch => "SEND_LOG_PAGE_FETCH",
            Self::SendDataPageFetch => "SEND_DATA_PAGE_FETCH",
            Self::SendDisconnectMsg => "SEND_DISCONNECT_MSG",
            Self::SendLogPriorList => "SEND_LOG_PRIOR_LIST",
            Self::SendLogBootInfoFetch => "SEND_LOG_BOOT_INFO_FETCH",
            Self::SendStopLogPriorDispatch => "SEND_STOP_LOG_PRIOR_DISPATCH",
            Self::Connect => "CONNECT",
            Self::Respond => "RESPOND",
        }
    }
}

impl TryFrom<u8> for TranToPageRequest {
    type Error = PageServerError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x01 => Ok(Self::GetBootInfo),
            0x02 => Ok(Self::SendLogPageFetch),
            0x03 => Ok(Self::SendDataPageFetch),
            0x04 => Ok(Self::SendDisconnectMsg),
            0x05 => Ok(Self::SendLogPriorList),
            0x06 => Ok(Self::SendLogBootInfoFetch),
            0x07 => Ok(Self::SendStopLogPriorDispatch),
            0x10 => Ok(Self::Connect),
            0x80 => Ok(Self::Respond),
            other => Err(PageServerError::UnknownRequest(other)),
        }
    }
}

/// Messages the page server sends to a transaction server.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PageToTranRequest {
    /// Tell the active transaction server how far the page server has saved.
    SendSavedLsa = 0x01,
    /// Forward a log-prior list to a passive transaction server.
    SendToPtsLogPriorList = 0x02,
    /// Reply to a transaction server request.
    Respond = 0x80,
}

impl PageToTranRequest {
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::SendSavedLsa => "SEND_SAVED_LSA",
            Self::SendToPtsLogPriorList => "SEND_TO_PTS_LOG_PRIOR_LIST",
            Self::Respond => "RESPOND",
        }
    }
}

impl TryFrom<u8> for PageToTranRequest {
    type Error = PageServerError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x01 => Ok(Self::SendSavedLsa),
            0x02 => Ok(Self::SendToPtsLogPriorList),
            0x80 => Ok(Self::Respond),
            other => Err(PageServerError::UnknownRequest(other)),
        }
    }
}

/// Fixed-size header preceding every frame.
///
/// Layout (little endian):
/// magic(4) version(1) flags(1) kind(1) reserved(1) header_crc(4)
/// rid(8) payload_length(4) payload_crc(4)
#[derive(Debug, Clone, Copy)]
pub struct MessageHeader {
    pub magic: [u8; 4],
    pub version: u8,
    pub flags: u8,
    pub kind: u8,
    pub reserved: u8,
    pub header_crc: u32,
    pub rid: RequestId,
    pub payload_length: u32,
    pub payload_crc: u32,
}

impl MessageHeader {
    pub const SIZE: usize = 28;

    pub fn new(kind: u8, flags: u8, rid: RequestId, payload: &[u8]) -> Self {
        let mut header = Self {
            magic: PAGE_SERVER_MAGIC,
            version: PROTOCOL_VERSION,
            flags,
            kind,
            reserved: 0,
            header_crc: 0,
            rid,
            payload_length: payload.len() as u32,
            payload_crc: if payload.is_empty() { 0 } else { crc32(payload) },
        };

        let mut crc_buf = [0u8; 8];
        crc_buf[0..4].copy_from_slice(&header.magic);
        crc_buf[4] = header.version;
        crc_buf[5] = header.flags;
        crc_buf[6] = header.kind;
        crc_buf[7] = header.reserved;
        header.header_crc = crc32(&crc_buf);

        header
    }

    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::SIZE {
            return Err(PageServerError::Protocol(
                "Buffer too small for message header".into(),
            ));
        }

        if buf[0..4] != PAGE_SERVER_MAGIC {
            return Err(PageServerError::InvalidMagic);
        }

        let version = buf[4];
        if version != PROTOCOL_VERSION {
            return Err(PageServerError::Protocol(format!(
                "Unsupported protocol version: {}",
                version
            )));
        }

        let stored_crc = u32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]);
        let computed_crc = crc32(&buf[0..8]);
        if stored_crc != computed_crc {
            ps_metrics::increment_crc_failures();
            return Err(PageServerError::CrcMismatch {
                expected: stored_crc,
                actual: computed_crc,
            });
        }

        let mut magic = [0u8; 4];
        magic.copy_from_slice(&buf[0..4]);

        Ok(Self {
            magic,
            version,
            flags: buf[5],
            kind: buf[6],
            reserved: buf[7],
            header_crc: stored_crc,
            rid: u64::from_le_bytes([
                buf[12], buf[13], buf[14], buf[15], buf[16], buf[17], buf[18], buf[19],
            ]),
            payload_length: u32::from_le_bytes([buf[20], buf[21], buf[22], buf[23]]),
            payload_crc: u32::from_le_bytes([buf[24], buf[25], buf[26], buf[27]]),
        })
    }

    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..4].copy_from_slice(&self.magic);
        buf[4] = self.version;
        buf[5] = self.flags;
        buf[6] = self.kind;
        buf[7] = self.reserved;
        buf[8..12].copy_from_slice(&self.header_crc.to_le_bytes());
        buf[12..20].copy_from_slice(&self.rid.to_le_bytes());
        buf[20..24].copy_from_slice(&self.payload_length.to_le_bytes());
        buf[24..28].copy_from_slice(&self.payload_crc.to_le_bytes());
        buf
    }

    #[inline]
    pub fn has_flag(&self, flag: MessageFlags) -> bool {
        self.flags & (flag as u8) != 0
    }

    #[inline]
    pub fn is_response(&self) -> bool {
        self.has_flag(MessageFlags::Response)
    }

    #[inline]
    pub fn is_error(&self) -> bool {
        self.has_flag(MessageFlags::Error)
    }

    pub fn validate_payload(&self, payload: &[u8]) -> Result<()> {
        if payload.len() != self.payload_length as usize {
            return Err(PageServerError::Protocol(format!(
                "Payload length mismatch: expected {}, got {}",
                self.payload_length,
                payload.len()
            )));
        }

        let actual_crc = if payload.is_empty() { 0 } else { crc32(payload) };
        if actual_crc != self.payload_crc {
            ps_metrics::increment_crc_failures();
            return Err(PageServerError::CrcMismatch {
                expected: self.payload_crc,
                actual: actual_crc,
            });
        }

        Ok(())
    }
}
