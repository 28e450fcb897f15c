//! Framed JSON codec for the broker/worker pipes.
//!
//! Each frame is a 4-byte big-endian length followed by one JSON document.
//! Works over any AsyncRead/AsyncWrite (child stdio, in-memory duplex pipes).

use std::io;
use std::marker::PhantomData;

use bytes::{Bytes, BytesMut};
use serde::{Serialize, de::DeserializeOwned};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

/// Largest frame accepted from either side. A full 255x255 step record stays well below this.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("pipe I/O failed: {0}")]
    Io(#[from] io::Error),
    #[error("malformed record: {0}")]
    Json(#[from] serde_json::Error),
}

/// Length-prefixed JSON codec, typed on the message it carries.
pub struct JsonCodec<T> {
    frames: LengthDelimitedCodec,
    _message: PhantomData<fn() -> T>,
}

impl<T> Default for JsonCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> JsonCodec<T> {
    pub fn new() -> Self {
        Self::with_max_frame_len(MAX_FRAME_LEN)
    }

    pub fn with_max_frame_len(max: usize) -> Self {
        Self {
            frames: LengthDelimitedCodec::builder()
                .big_endian()
                .length_field_length(4)
                .max_frame_length(max)
                .new_codec(),
            _message: PhantomData,
        }
    }
}

impl<T: DeserializeOwned> Decoder for JsonCodec<T> {
    type Item = T;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<T>, CodecError> {
        let Some(frame) = self.frames.decode(src)? else {
            return Ok(None);
        };
        Ok(Some(serde_json::from_slice(&frame)?))
    }
}

impl<T: Serialize> Encoder<T> for JsonCodec<T> {
    type Error = CodecError;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), CodecError> {
        let json = serde_json::to_vec(&item)?;
        tracing::trace!(frame_bytes = json.len(), "Encoding record");
        self.frames.encode(Bytes::from(json), dst)?;
        Ok(())
    }
}
