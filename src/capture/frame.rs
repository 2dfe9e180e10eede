use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::time::Instant;

use crate::error::{RelayError, Result};

/// A single frame moving through the relay.
///
/// Pixel data is immutable once produced. A frame moves from one stage to
/// the next and is owned by exactly one of them at a time.
#[derive(Debug)]
pub struct Frame {
    /// Raw pixels or an encoded image, depending on `meta.format`
    pub data: Bytes,

    /// Frame metadata
    pub meta: FrameMetadata,

    /// When the frame was captured or received; the sender reports
    /// capture-to-send latency from it
    pub timestamp: Instant,
}

/// Frame metadata
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameMetadata {
    pub sequence: u64,
    /// Zero for encoded frames whose geometry is only known after decoding
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
}

/// Pixel formats the relay understands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelFormat {
    EncodedJpeg,
    Rgb24,
    Bgr24,
    /// BGRX / BGRA, four bytes per pixel
    Bgr32,
    /// Planar I420: full-resolution Y, then quarter-resolution U and V
    Yuv420,
}

impl PixelFormat {
    /// Byte length of a raw frame with the given geometry, `None` for encoded data.
    pub fn frame_len(self, width: u32, height: u32) -> Option<usize> {
        let (w, h) = (width as usize, height as usize);
        match self {
            PixelFormat::EncodedJpeg => None,
            PixelFormat::Rgb24 | PixelFormat::Bgr24 => Some(w * h * 3),
            PixelFormat::Bgr32 => Some(w * h * 4),
            PixelFormat::Yuv420 => Some(w * h + 2 * w.div_ceil(2) * h.div_ceil(2)),
        }
    }
}

impl Frame {
    pub fn new(data: impl Into<Bytes>, width: u32, height: u32, format: PixelFormat) -> Self {
        Self {
            data: data.into(),
            meta: FrameMetadata {
                sequence: 0,
                width,
                height,
                format,
            },
            timestamp: Instant::now(),
        }
    }

    /// Wraps an encoded JPEG payload received from the network.
    pub fn jpeg(data: impl Into<Bytes>) -> Self {
        Self::new(data, 0, 0, PixelFormat::EncodedJpeg)
    }

    pub fn with_sequence(mut self, sequence: u64) -> Self {
        self.meta.sequence = sequence;
        self
    }

    /// Checks that raw pixel data matches the declared geometry.
    pub fn validate(&self) -> Result<()> {
        if self.data.is_empty() {
            return Err(RelayError::Codec("empty frame".into()));
        }
        match self.meta.format.frame_len(self.meta.width, self.meta.height) {
            Some(expected) if expected != self.data.len() => Err(RelayError::Codec(format!(
                "{:?} frame {}x{} should be {} bytes, got {}",
                self.meta.format,
                self.meta.width,
                self.meta.height,
                expected,
                self.data.len()
            ))),
            _ => Ok(()),
        }
    }
}
