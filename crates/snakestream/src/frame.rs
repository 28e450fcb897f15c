//! Frames - the unit buffered by the flow broker - and the per-session pipeline producing them.

use bytes::Bytes;
use snakestream_bridge::{DataMode, InitRecord, StepRecord};

use crate::encoder::{EncoderError, FrameEncoder, PixelSettings};
use crate::transport::OutboundMessage;

#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Sent as a text message.
    Step(StepRecord),
    /// Sent as a binary message.
    Pixels(Bytes),
}

impl Frame {
    pub fn into_message(self) -> OutboundMessage {
        match self {
            Frame::Step(record) => OutboundMessage::Text(record.as_value().to_string()),
            Frame::Pixels(bytes) => OutboundMessage::Binary(bytes),
        }
    }
}

/// Step → frames transform, chosen once per session from its [`DataMode`].
#[derive(Debug)]
pub enum FramePipeline {
    Steps,
    Pixels(FrameEncoder),
}

impl FramePipeline {
    pub fn new(
        mode: DataMode,
        init: &InitRecord,
        pixels: &PixelSettings,
    ) -> Result<Self, EncoderError> {
        Ok(match mode {
            DataMode::Steps => Self::Steps,
            DataMode::PixelData => Self::Pixels(FrameEncoder::from_init(init, pixels)?),
        })
    }

    #[cfg(test)]
    fn mode(&self) -> DataMode {
        match self {
            Self::Steps => DataMode::Steps,
            Self::Pixels(_) => DataMode::PixelData,
        }
    }

    pub fn frames(&mut self, step: StepRecord) -> Vec<Frame> {
        match self {
            Self::Steps => vec![Frame::Step(step)],
            Self::Pixels(encoder) => encoder
                .encode(&step)
                .iter()
                .map(|batch| Frame::Pixels(batch.to_bytes()))
                .collect(),
        }
    }
}
