//! Lock-free single-slot frame channel.
//!
//! The writer copies the pixels, stores `data_size`, issues a release fence
//! and only then bumps `sequence` with a release store. A reader that
//! observes a new `sequence` with an acquire load is therefore guaranteed to
//! see the matching size and pixels, provided the writer has not already
//! started on the next frame. The reader re-checks `sequence` after copying
//! to catch the common case where it has.

use std::path::Path;
use std::ptr;
use std::sync::atomic::{fence, Ordering};
use std::sync::Arc;

use tracing::{instrument, trace};

use super::convert::{to_consumer_layout, TargetLayout};
use super::segment::SharedSegment;
use crate::capture::{Frame, ImageCodec, JpegCodec};
use crate::error::{ResourceError, Result};
use crate::PublisherConfig;

pub struct FramePublisher {
    segment: SharedSegment,
    width: u32,
    height: u32,
    codec: Arc<dyn ImageCodec>,
}

impl FramePublisher {
    /// Publishes `width`x`height` BGR24 frames into `segment`.
    pub fn new(segment: SharedSegment, width: u32, height: u32) -> Result<Self, ResourceError> {
        let slot_size = TargetLayout::Bgr24.frame_len(width, height);
        if segment.capacity() < slot_size {
            return Err(ResourceError::SegmentTooSmall {
                name: segment.name(),
                expected: slot_size,
                actual: segment.capacity(),
            });
        }
        Ok(Self {
            segment,
            width,
            height,
            codec: Arc::new(JpegCodec),
        })
    }

    pub fn with_codec(mut self, codec: Arc<dyn ImageCodec>) -> Self {
        self.codec = codec;
        self
    }

    /// Creates the well-known shm segment sized for the geometry.
    pub fn create_shm(name: &str, width: u32, height: u32) -> Result<Self, ResourceError> {
        let segment = SharedSegment::create_shm(name, TargetLayout::Bgr24.frame_len(width, height))?;
        Self::new(segment, width, height)
    }

    pub fn create_file(path: &Path, width: u32, height: u32) -> Result<Self, ResourceError> {
        let segment = SharedSegment::create_file(path, TargetLayout::Bgr24.frame_len(width, height))?;
        Self::new(segment, width, height)
    }

    /// Shm object or file, whichever the config names.
    pub fn from_config(config: &PublisherConfig) -> Result<Self, ResourceError> {
        match &config.segment_path {
            Some(path) => Self::create_file(path, config.width, config.height),
            None => Self::create_shm(&config.segment_name, config.width, config.height),
        }
    }

    pub fn slot_size(&self) -> usize {
        TargetLayout::Bgr24.frame_len(self.width, self.height)
    }

    pub fn geometry(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Decodes, converts and publishes one frame. Returns the new sequence.
    #[instrument(level = "trace", skip_all, fields(sequence = frame.meta.sequence))]
    pub fn publish(&mut self, frame: &Frame) -> Result<i32> {
        let image = self.codec.decode(frame)?;
        let pixels = to_consumer_layout(&image, self.width, self.height, TargetLayout::Bgr24);
        self.publish_converted(&pixels)
    }

    /// Publishes a buffer already in the consumer layout; it must fill the
    /// slot exactly.
    pub fn publish_converted(&mut self, pixels: &[u8]) -> Result<i32> {
        if pixels.len() != self.slot_size() {
            return Err(ResourceError::GeometryMismatch {
                expected: self.slot_size(),
                actual: pixels.len(),
            }
            .into());
        }
        Ok(self.write_slot(pixels))
    }

    /// Publishes any buffer that fits the slot, whatever its geometry.
    pub fn publish_raw(&mut self, pixels: &[u8]) -> Result<i32> {
        if pixels.len() > self.segment.capacity() {
            return Err(ResourceError::GeometryMismatch {
                expected: self.segment.capacity(),
                actual: pixels.len(),
            }
            .into());
        }
        Ok(self.write_slot(pixels))
    }

    fn write_slot(&mut self, pixels: &[u8]) -> i32 {
        let header = self.segment.header();

        // SAFETY: length checked against capacity by the callers; the pixel
        // area never overlaps `pixels`, which is process-local memory.
        unsafe {
            ptr::copy_nonoverlapping(pixels.as_ptr(), self.segment.pixels_ptr(), pixels.len());
        }
        header.data_size.store(pixels.len() as u32, Ordering::Relaxed);
        fence(Ordering::Release);

        let sequence = header.sequence.load(Ordering::Relaxed).wrapping_add(1);
        header.sequence.store(sequence, Ordering::Release);

        metrics::counter!("frames_published").increment(1);
        trace!(sequence, len = pixels.len(), "frame published");
        sequence
    }
}

/// Consumer side of the slot.
pub struct ChannelReader {
    segment: SharedSegment,
    last_seen: i32,
}

impl ChannelReader {
    pub fn new(segment: SharedSegment) -> Self {
        Self {
            segment,
            last_seen: 0,
        }
    }

    pub fn open_shm(name: &str) -> Result<Self, ResourceError> {
        Ok(Self::new(SharedSegment::open_shm(name)?))
    }

    pub fn open_file(path: &Path) -> Result<Self, ResourceError> {
        Ok(Self::new(SharedSegment::open_file(path)?))
    }

    pub fn last_seen(&self) -> i32 {
        self.last_seen
    }

    /// Copies the slot into `buf` if a frame newer than the last one seen
    /// has been published, returning its sequence.
    pub fn poll(&mut self, buf: &mut Vec<u8>) -> Option<i32> {
        let header = self.segment.header();
        loop {
            let sequence = header.sequence.load(Ordering::Acquire);
            if sequence == self.last_seen {
                return None;
            }

            let size = (header.data_size.load(Ordering::Relaxed) as usize).min(self.segment.capacity());
            buf.resize(size, 0);
            // SAFETY: size is clamped to the mapped pixel area
            unsafe {
                ptr::copy_nonoverlapping(self.segment.pixels_ptr(), buf.as_mut_ptr(), size);
            }
            fence(Ordering::Acquire);

            if header.sequence.load(Ordering::Relaxed) == sequence {
                self.last_seen = sequence;
                return Some(sequence);
            }
            // Writer published again mid-copy
            std::hint::spin_loop();
        }
    }
}
