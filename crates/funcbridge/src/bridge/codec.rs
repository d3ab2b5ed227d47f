//! Framed codec for worker pipe communication.
//!
//! Uses LengthDelimitedCodec for framing; payloads are envelopes passed
//! through untouched. Works over any AsyncRead/AsyncWrite (pipes, sockets, etc).

use std::io;

use tokio_util::bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use super::envelope::Envelope;

/// Codec that frames envelopes with a 4-byte big-endian length prefix.
pub struct FrameCodec {
    inner: LengthDelimitedCodec,
}

impl FrameCodec {
    pub fn new(max_frame_length: usize) -> Self {
        Self {
            inner: LengthDelimitedCodec::builder()
                .length_field_length(4)
                .max_frame_length(max_frame_length)
                .new_codec(),
        }
    }
}

impl Decoder for FrameCodec {
    type Item = Envelope;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        Ok(self
            .inner
            .decode(src)?
            .map(|frame| Envelope::from(frame.freeze())))
    }
}

impl Encoder<Envelope> for FrameCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Envelope, dst: &mut BytesMut) -> Result<(), Self::Error> {
        tracing::trace!(frame_size_bytes = item.len(), "Encoding frame");
        self.inner.encode(item.into_bytes(), dst)
    }
}
