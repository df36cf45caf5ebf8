use bytes::Bytes;

/// Correlation id assigned by the requester and echoed in the response.
pub type RequestId = u64;

/// A payload tagged with the correlation id of the request it belongs to.
///
/// The page server answers a request by replacing the payload and sending the
/// same envelope back, so the response always carries the request's id no
/// matter when or from which task it is sent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SequencedPayload {
    rid: RequestId,
    payload: Bytes,
}

impl SequencedPayload {
    #[must_use]
    pub fn new(rid: RequestId, payload: Bytes) -> Self {
        Self { rid, payload }
    }

    #[inline]
    #[must_use]
    pub fn rid(&self) -> RequestId {
        self.rid
    }

    /// Borrow the payload without consuming it.
    #[inline]
    #[must_use]
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Move the payload out. A second pull returns an empty payload.
    pub fn pull_payload(&mut self) -> Bytes {
        std::mem::take(&mut self.payload)
    }

    /// Replace the payload, keeping the correlation id.
    pub fn push_payload(&mut self, payload: Bytes) {
        self.payload = payload;
    }

    #[must_use]
    pub fn into_parts(self) -> (RequestId, Bytes) {
        (self.rid, self.payload)
    }
}
