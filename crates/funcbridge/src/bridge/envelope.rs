//! Opaque message envelope.

use std::fmt;

use tokio_util::bytes::Bytes;

/// One serialized `StreamingMessage`, exactly as it was read or will be written.
///
/// Envelopes are immutable once built. Cloning shares the underlying buffer,
/// so forwarding never copies or re-encodes the payload.
#[derive(Clone, PartialEq, Eq, Hash, Default)]
pub struct Envelope(Bytes);

impl Envelope {
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Bytes {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Bytes> for Envelope {
    fn from(bytes: Bytes) -> Self {
        Self(bytes)
    }
}

impl From<Vec<u8>> for Envelope {
    fn from(bytes: Vec<u8>) -> Self {
        Self(Bytes::from(bytes))
    }
}

impl From<Envelope> for Bytes {
    fn from(envelope: Envelope) -> Self {
        envelope.0
    }
}

impl fmt::Debug for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Envelope").field("len", &self.0.len()).finish()
    }
}
