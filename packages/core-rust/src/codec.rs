//! Length-delimited `MsgPack` framing for operation event streams.
//!
//! Each frame is a 4-byte big-endian length followed by a named `MsgPack`
//! encoding of an [`OperationEvent`]. The server writes frames into a
//! streaming HTTP body; clients feed received chunks into a `BytesMut` and
//! decode complete frames as they arrive.

use bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use crate::messages::OperationEvent;

/// Upper bound for a single event frame. Log lines are short; anything
/// larger indicates a corrupt stream.
pub const DEFAULT_MAX_FRAME_LENGTH: usize = 1024 * 1024;

/// Errors produced while encoding or decoding event frames.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("frame I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to encode event: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
    #[error("failed to decode event: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
}

/// `tokio_util` codec for [`OperationEvent`] frames.
#[derive(Debug)]
pub struct EventCodec {
    frames: LengthDelimitedCodec,
}

impl EventCodec {
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_frame_length(DEFAULT_MAX_FRAME_LENGTH)
    }

    #[must_use]
    pub fn with_max_frame_length(max_frame_length: usize) -> Self {
        Self {
            frames: LengthDelimitedCodec::builder()
                .max_frame_length(max_frame_length)
                .new_codec(),
        }
    }

    /// Encodes a single event into a standalone frame.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError`] if the event cannot be serialized or exceeds
    /// the maximum frame length.
    pub fn encode_to_bytes(&mut self, event: OperationEvent) -> Result<Bytes, CodecError> {
        let mut buf = BytesMut::new();
        self.encode(event, &mut buf)?;
        Ok(buf.freeze())
    }
}

impl Default for EventCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Encoder<OperationEvent> for EventCodec {
    type Error = CodecError;

    fn encode(&mut self, event: OperationEvent, dst: &mut BytesMut) -> Result<(), CodecError> {
        let payload = rmp_serde::to_vec_named(&event)?;
        self.frames.encode(Bytes::from(payload), dst)?;
        Ok(())
    }
}

impl Decoder for EventCodec {
    type Item = OperationEvent;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<OperationEvent>, CodecError> {
        match self.frames.decode(src)? {
            Some(frame) => Ok(Some(rmp_serde::from_slice(&frame)?)),
            None => Ok(None),
        }
    }
}
