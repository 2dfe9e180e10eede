//! Synthetic test pattern used in place of a camera.
//!
//! Each frame has a random muted background, a red circle moving along a
//! Lissajous path and three translucent rectangles, which is enough motion to
//! eyeball latency and dropped frames on the consumer side.

use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::frame::{Frame, PixelFormat};
use super::source::FrameSource;
use crate::error::Result;

pub struct TestPattern {
    width: u32,
    height: u32,
    interval: Duration,
    counter: u64,
    rng: StdRng,
}

impl TestPattern {
    pub fn new(width: u32, height: u32, fps: u32) -> Self {
        Self::with_rng(width, height, fps, StdRng::from_entropy())
    }

    pub fn seeded(width: u32, height: u32, fps: u32, seed: u64) -> Self {
        Self::with_rng(width, height, fps, StdRng::seed_from_u64(seed))
    }

    fn with_rng(width: u32, height: u32, fps: u32, rng: StdRng) -> Self {
        Self {
            width: width.max(1),
            height: height.max(1),
            interval: Duration::from_secs(1) / fps.max(1),
            counter: 0,
            rng,
        }
    }

    fn render(&mut self) -> Vec<u8> {
        let (w, h) = (self.width as usize, self.height as usize);
        let mut pixels = vec![0u8; w * h * 3];

        let background = [
            self.rng.gen_range(50..150u8),
            self.rng.gen_range(50..150u8),
            self.rng.gen_range(50..150u8),
        ];
        for px in pixels.chunks_exact_mut(3) {
            px.copy_from_slice(&background);
        }

        let t = self.counter as f64;
        let cx = w as f64 / 2.0 + (t * 0.1).sin() * w as f64 / 4.0;
        let cy = h as f64 / 2.0 + (t * 0.05).cos() * h as f64 / 4.0;
        let radius = 25.0 + (t * 0.2).sin() * 10.0;
        for y in 0..h {
            for x in 0..w {
                let (dx, dy) = (x as f64 - cx, y as f64 - cy);
                if dx * dx + dy * dy <= radius * radius {
                    let i = (y * w + x) * 3;
                    pixels[i..i + 3].copy_from_slice(&[255, 0, 0]);
                }
            }
        }

        for _ in 0..3 {
            let rx = self.rng.gen_range(0..w.saturating_sub(100).max(1));
            let ry = self.rng.gen_range(0..h.saturating_sub(100).max(1));
            let rw = self.rng.gen_range(50..100usize);
            let rh = self.rng.gen_range(50..100usize);
            let color = [
                self.rng.gen_range(100..=255u8),
                self.rng.gen_range(100..=255u8),
                self.rng.gen_range(100..=255u8),
            ];
            for y in ry..(ry + rh).min(h) {
                for x in rx..(rx + rw).min(w) {
                    let i = (y * w + x) * 3;
                    for c in 0..3 {
                        // 50% alpha
                        pixels[i + c] = ((u16::from(pixels[i + c]) + u16::from(color[c])) / 2) as u8;
                    }
                }
            }
        }

        pixels
    }
}

impl FrameSource for TestPattern {
    fn next_frame(&mut self) -> Result<Frame> {
        self.counter += 1;
        let pixels = self.render();
        Ok(Frame::new(pixels, self.width, self.height, PixelFormat::Rgb24).with_sequence(self.counter))
    }

    fn frame_interval(&self) -> Duration {
        self.interval
    }
}
