//! Conversion into the consumer's native pixel layout.
//!
//! Virtual camera consumers expect BGR(A) rows stored bottom-up with columns
//! mirrored, i.e. `dst(x, y) = src(W-1-x, H-1-y)`. Row-major that is simply
//! the source pixels in reverse order.

use image::imageops::{self, FilterType};
use image::RgbImage;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetLayout {
    Bgr24,
    /// Alpha is always 255
    Bgra32,
}

impl TargetLayout {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            TargetLayout::Bgr24 => 3,
            TargetLayout::Bgra32 => 4,
        }
    }

    pub fn frame_len(self, width: u32, height: u32) -> usize {
        width as usize * height as usize * self.bytes_per_pixel()
    }
}

/// Scales `image` to `width`x`height` if needed, then lays it out
/// bottom-up and mirrored in `layout`.
pub fn to_consumer_layout(image: &RgbImage, width: u32, height: u32, layout: TargetLayout) -> Vec<u8> {
    if image.dimensions() == (width, height) {
        reverse_into(image, layout)
    } else {
        // One full-frame scale, no cropping or letterboxing
        let scaled = imageops::resize(image, width, height, FilterType::Triangle);
        reverse_into(&scaled, layout)
    }
}

fn reverse_into(image: &RgbImage, layout: TargetLayout) -> Vec<u8> {
    let mut out = Vec::with_capacity(layout.frame_len(image.width(), image.height()));
    let pixels = image.as_raw().chunks_exact(3).rev();
    match layout {
        TargetLayout::Bgr24 => {
            for px in pixels {
                out.extend_from_slice(&[px[2], px[1], px[0]]);
            }
        }
        TargetLayout::Bgra32 => {
            for px in pixels {
                out.extend_from_slice(&[px[2], px[1], px[0], 255]);
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    // R, G, B chosen so every pixel and channel is distinguishable
    fn two_by_two() -> RgbImage {
        let mut img = RgbImage::new(2, 2);
        img.put_pixel(0, 0, Rgb([1, 2, 3]));
        img.put_pixel(1, 0, Rgb([4, 5, 6]));
        img.put_pixel(0, 1, Rgb([7, 8, 9]));
        img.put_pixel(1, 1, Rgb([10, 11, 12]));
        img
    }

    #[test]
    fn bottom_up_mirrored_permutation() {
        let out = to_consumer_layout(&two_by_two(), 2, 2, TargetLayout::Bgr24);
        #[rustfmt::skip]
        let expected = vec![
            12, 11, 10,   9, 8, 7,
             6,  5,  4,   3, 2, 1,
        ];
        assert_eq!(out, expected);

        // Top-left source pixel ends up bottom-right
        assert_eq!(&out[9..12], &[3, 2, 1]);
    }

    #[test]
    fn bgra_adds_opaque_alpha() {
        let out = to_consumer_layout(&two_by_two(), 2, 2, TargetLayout::Bgra32);
        assert_eq!(out.len(), 16);
        assert_eq!(&out[..4], &[12, 11, 10, 255]);
        assert!(out.chunks_exact(4).all(|px| px[3] == 255));
    }

    #[test]
    fn resizes_to_target_geometry() {
        let img = RgbImage::from_pixel(8, 6, Rgb([200, 100, 50]));
        let out = to_consumer_layout(&img, 4, 3, TargetLayout::Bgr24);
        assert_eq!(out.len(), TargetLayout::Bgr24.frame_len(4, 3));
        for px in out.chunks_exact(3) {
            for (got, want) in px.iter().zip([50u8, 100, 200]) {
                assert!(got.abs_diff(want) <= 1, "{px:?}");
            }
        }
    }
}
