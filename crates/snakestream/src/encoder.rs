//! Frame encoder - turns step records into pixel-change batches for `pixel_data` sessions.
//!
//! Each grid cell maps to an `expand_factor × expand_factor` block of pixels, shifted
//! by a fixed offset. A batch is the concatenation of 5-byte `(x, y, r, g, b)` tuples.

use std::collections::HashMap;

use bytes::{BufMut, Bytes, BytesMut};
use serde_json::Value;
use snakestream_bridge::{InitRecord, StepRecord};

/// Broker-side rendering settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelSettings {
    pub expand_factor: u8,
    /// Pixel offset added to every coordinate, `(x, y)`.
    pub offset: (u8, u8),
}

impl Default for PixelSettings {
    fn default() -> Self {
        Self {
            expand_factor: 2,
            offset: (1, 1),
        }
    }
}

impl PixelSettings {
    pub fn with_expand_factor(mut self, factor: u8) -> Self {
        self.expand_factor = factor;
        self
    }

    pub fn with_offset(mut self, x: u8, y: u8) -> Self {
        self.offset = (x, y);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EncoderError {
    #[error("init record is missing `{0}`")]
    MissingField(&'static str),
    #[error("init record field `{field}` is invalid: {reason}")]
    InvalidField { field: &'static str, reason: String },
    #[error("expand factor must be non-zero")]
    ZeroExpandFactor,
    #[error("{width}x{height} grid does not fit one-byte pixel coordinates")]
    GridTooLarge { width: u64, height: u64 },
}

/// One pixel, 5 bytes on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelChange {
    pub x: u8,
    pub y: u8,
    pub rgb: [u8; 3],
}

impl PixelChange {
    pub const ENCODED_LEN: usize = 5;

    fn put(&self, buf: &mut BytesMut) {
        buf.put_u8(self.x);
        buf.put_u8(self.y);
        buf.put_slice(&self.rgb);
    }
}

/// Pixels of one changed cell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PixelBatch(Vec<PixelChange>);

impl PixelBatch {
    pub fn changes(&self) -> &[PixelChange] {
        &self.0
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.0.len() * PixelChange::ENCODED_LEN);
        for change in &self.0 {
            change.put(&mut buf);
        }
        buf.freeze()
    }
}

/// Stateful step → pixel transform, built once per session from the init record.
#[derive(Debug, Clone)]
pub struct FrameEncoder {
    width: u64,
    height: u64,
    expand_factor: u8,
    offset: (u8, u8),
    palette: HashMap<i64, [u8; 3]>,
    encoded_steps: u64,
}

impl FrameEncoder {
    pub fn from_init(init: &InitRecord, settings: &PixelSettings) -> Result<Self, EncoderError> {
        if settings.expand_factor == 0 {
            return Err(EncoderError::ZeroExpandFactor);
        }

        let meta = init.as_value();
        let width = dimension(meta, "width")?;
        let height = dimension(meta, "height")?;

        // one past the last pixel must not exceed 256
        let factor = u64::from(settings.expand_factor);
        let fits = |cells: u64, offset: u8| {
            cells
                .checked_mul(factor)
                .and_then(|span| span.checked_add(u64::from(offset)))
                .is_some_and(|end| end <= 256)
        };
        if !fits(width, settings.offset.0) || !fits(height, settings.offset.1) {
            return Err(EncoderError::GridTooLarge { width, height });
        }

        let palette = palette(meta)?;
        tracing::debug!(width, height, colors = palette.len(), "Frame encoder ready");

        Ok(Self {
            width,
            height,
            expand_factor: settings.expand_factor,
            offset: settings.offset,
            palette,
            encoded_steps: 0,
        })
    }

    /// One batch per changed cell, in record order.
    pub fn encode(&mut self, step: &StepRecord) -> Vec<PixelBatch> {
        self.encoded_steps += 1;
        let changes = match step.as_value().get("changes") {
            None | Some(Value::Null) => return Vec::new(),
            Some(Value::Array(changes)) => changes,
            Some(_) => {
                tracing::warn!(step = self.encoded_steps, "Step `changes` is not an array");
                return Vec::new();
            }
        };

        changes
            .iter()
            .filter_map(|change| self.encode_cell(change))
            .collect()
    }

    fn encode_cell(&self, change: &Value) -> Option<PixelBatch> {
        let field = |name: &str| change.get(name).and_then(Value::as_i64);
        let (Some(x), Some(y), Some(value)) = (field("x"), field("y"), field("value")) else {
            tracing::warn!(%change, "Skipping malformed cell change");
            return None;
        };

        let (Ok(x), Ok(y)) = (u64::try_from(x), u64::try_from(y)) else {
            tracing::warn!(x, y, "Skipping cell outside the grid");
            return None;
        };
        if x >= self.width || y >= self.height {
            tracing::warn!(x, y, "Skipping cell outside the grid");
            return None;
        }
        let Some(&rgb) = self.palette.get(&value) else {
            tracing::warn!(value, "Skipping cell with unknown value");
            return None;
        };

        // from_init guarantees every coordinate fits in a byte
        let factor = u64::from(self.expand_factor);
        let base_x = u64::from(self.offset.0) + x * factor;
        let base_y = u64::from(self.offset.1) + y * factor;
        let mut pixels = Vec::with_capacity(usize::from(self.expand_factor).pow(2));
        for dy in 0..factor {
            for dx in 0..factor {
                pixels.push(PixelChange {
                    x: (base_x + dx) as u8,
                    y: (base_y + dy) as u8,
                    rgb,
                });
            }
        }
        Some(PixelBatch(pixels))
    }
}

fn dimension(meta: &Value, field: &'static str) -> Result<u64, EncoderError> {
    let value = meta.get(field).ok_or(EncoderError::MissingField(field))?;
    match value.as_u64() {
        Some(0) | None => Err(EncoderError::InvalidField {
            field,
            reason: format!("expected a positive integer, got {value}"),
        }),
        Some(n) => Ok(n),
    }
}

fn palette(meta: &Value) -> Result<HashMap<i64, [u8; 3]>, EncoderError> {
    const FIELD: &str = "color_mapping";
    let invalid = |reason: String| EncoderError::InvalidField {
        field: FIELD,
        reason,
    };

    let mapping = meta
        .get(FIELD)
        .ok_or(EncoderError::MissingField(FIELD))?
        .as_object()
        .ok_or_else(|| invalid("expected an object".to_string()))?;

    let mut palette = HashMap::with_capacity(mapping.len());
    for (key, color) in mapping {
        let value: i64 = key
            .parse()
            .map_err(|_| invalid(format!("key {key:?} is not an integer")))?;
        let rgb: [u8; 3] = serde_json::from_value(color.clone())
            .map_err(|e| invalid(format!("colour for {key}: {e}")))?;
        palette.insert(value, rgb);
    }
    Ok(palette)
}
