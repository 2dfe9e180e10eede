//! Narrow image codec boundary.
//!
//! The relay never implements JPEG itself. Everything goes through
//! [`ImageCodec`], backed by `jpeg-decoder` for decoding and `image` for
//! encoding and scaling.

use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::{imageops, ExtendedColorType, RgbImage};
use jpeg_decoder::Decoder;

use super::frame::{Frame, PixelFormat};
use crate::error::{RelayError, Result};

pub trait ImageCodec: Send + Sync {
    /// Decodes any supported frame into packed RGB24.
    fn decode(&self, frame: &Frame) -> Result<RgbImage>;

    fn encode_jpeg(&self, image: &RgbImage, quality: u8) -> Result<Bytes>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct JpegCodec;

impl ImageCodec for JpegCodec {
    fn decode(&self, frame: &Frame) -> Result<RgbImage> {
        decode_frame(frame)
    }

    fn encode_jpeg(&self, image: &RgbImage, quality: u8) -> Result<Bytes> {
        let mut out = Vec::with_capacity(image.as_raw().len() / 8);
        let mut encoder = JpegEncoder::new_with_quality(&mut out, quality.clamp(1, 100));
        encoder.encode(
            image.as_raw(),
            image.width(),
            image.height(),
            ExtendedColorType::Rgb8,
        )?;
        Ok(Bytes::from(out))
    }
}

pub fn decode_frame(frame: &Frame) -> Result<RgbImage> {
    frame.validate()?;
    let (width, height) = (frame.meta.width, frame.meta.height);
    let data = &frame.data[..];

    let pixels = match frame.meta.format {
        PixelFormat::EncodedJpeg => return decode_jpeg(data),
        PixelFormat::Rgb24 => data.to_vec(),
        PixelFormat::Bgr24 => data
            .chunks_exact(3)
            .flat_map(|px| [px[2], px[1], px[0]])
            .collect(),
        PixelFormat::Bgr32 => data
            .chunks_exact(4)
            .flat_map(|px| [px[2], px[1], px[0]])
            .collect(),
        PixelFormat::Yuv420 => yuv420_to_rgb(data, width as usize, height as usize),
    };

    RgbImage::from_raw(width, height, pixels)
        .ok_or_else(|| RelayError::Codec(format!("{width}x{height} buffer size mismatch")))
}

/// Largest image a received JPEG may decode to. The frame header is
/// checked against it before any pixel buffer is allocated.
pub const MAX_DECODED_PIXELS: usize = 8192 * 8192;

fn decode_jpeg(data: &[u8]) -> Result<RgbImage> {
    let mut decoder = Decoder::new(data);
    decoder.read_info()?;
    let info = decoder
        .info()
        .ok_or_else(|| RelayError::Codec("jpeg stream without frame header".into()))?;
    let (width, height) = (u32::from(info.width), u32::from(info.height));
    if u64::from(width) * u64::from(height) > MAX_DECODED_PIXELS as u64 {
        return Err(RelayError::Codec(format!(
            "jpeg {width}x{height} exceeds {MAX_DECODED_PIXELS} pixels"
        )));
    }

    let pixels = decoder.decode()?;

    let rgb = match info.pixel_format {
        jpeg_decoder::PixelFormat::RGB24 => pixels,
        jpeg_decoder::PixelFormat::L8 => pixels.iter().flat_map(|&l| [l, l, l]).collect(),
        jpeg_decoder::PixelFormat::L16 => pixels
            .chunks_exact(2)
            .flat_map(|l| [l[0], l[0], l[0]])
            .collect(),
        // Adobe CMYK is stored inverted
        jpeg_decoder::PixelFormat::CMYK32 => pixels
            .chunks_exact(4)
            .flat_map(|p| {
                let k = u16::from(p[3]);
                let scale = |c: u8| ((u16::from(c) * k) / 255) as u8;
                [scale(p[0]), scale(p[1]), scale(p[2])]
            })
            .collect(),
        #[allow(unreachable_patterns)]
        other => {
            return Err(RelayError::Codec(format!(
                "unsupported jpeg pixel format {other:?}"
            )))
        }
    };

    RgbImage::from_raw(width, height, rgb)
        .ok_or_else(|| RelayError::Codec(format!("jpeg {width}x{height} decoded to wrong size")))
}

/// BT.601 limited-range I420 to packed RGB24.
fn yuv420_to_rgb(data: &[u8], width: usize, height: usize) -> Vec<u8> {
    let chroma_w = width.div_ceil(2);
    let chroma_h = height.div_ceil(2);
    let (y_plane, rest) = data.split_at(width * height);
    let (u_plane, v_plane) = rest.split_at(chroma_w * chroma_h);

    let mut rgb = Vec::with_capacity(width * height * 3);
    for y in 0..height {
        for x in 0..width {
            let c = i32::from(y_plane[y * width + x]) - 16;
            let chroma = (y / 2) * chroma_w + x / 2;
            let d = i32::from(u_plane[chroma]) - 128;
            let e = i32::from(v_plane[chroma]) - 128;

            let clamp = |v: i32| v.clamp(0, 255) as u8;
            rgb.push(clamp((298 * c + 409 * e + 128) >> 8));
            rgb.push(clamp((298 * c - 100 * d - 208 * e + 128) >> 8));
            rgb.push(clamp((298 * c + 516 * d + 128) >> 8));
        }
    }
    rgb
}

/// Clockwise rotation in multiples of 90 degrees.
pub fn rotate(image: RgbImage, degrees: u16) -> RgbImage {
    match degrees % 360 {
        90 => imageops::rotate90(&image),
        180 => imageops::rotate180(&image),
        270 => imageops::rotate270(&image),
        _ => image,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gradient(width: u32, height: u32) -> RgbImage {
        RgbImage::from_fn(width, height, |x, y| {
            image::Rgb([(x * 16) as u8, (y * 16) as u8, 128])
        })
    }

    #[test]
    fn bgr_variants_swap_channels() {
        let bgr = Frame::new(vec![1, 2, 3, 4, 5, 6], 2, 1, PixelFormat::Bgr24);
        assert_eq!(decode_frame(&bgr).unwrap().as_raw(), &vec![3, 2, 1, 6, 5, 4]);

        let bgrx = Frame::new(vec![1, 2, 3, 255, 4, 5, 6, 255], 2, 1, PixelFormat::Bgr32);
        assert_eq!(decode_frame(&bgrx).unwrap().as_raw(), &vec![3, 2, 1, 6, 5, 4]);
    }

    #[test]
    fn yuv_black_and_white() {
        // 2x2 luma, one chroma sample each for U and V
        let black = Frame::new(vec![16, 16, 16, 16, 128, 128], 2, 2, PixelFormat::Yuv420);
        assert!(decode_frame(&black).unwrap().as_raw().iter().all(|&c| c == 0));

        let white = Frame::new(vec![235, 235, 235, 235, 128, 128], 2, 2, PixelFormat::Yuv420);
        assert!(decode_frame(&white).unwrap().as_raw().iter().all(|&c| c == 255));
    }

    #[test]
    fn jpeg_encode_decode_keeps_geometry() {
        let codec = JpegCodec;
        let source = gradient(32, 16);
        let jpeg = codec.encode_jpeg(&source, 90).unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);

        let decoded = codec.decode(&Frame::jpeg(jpeg)).unwrap();
        assert_eq!(decoded.dimensions(), (32, 16));
    }

    #[test]
    fn garbage_jpeg_is_a_codec_error() {
        let err = JpegCodec.decode(&Frame::jpeg(vec![1, 2, 3, 4])).unwrap_err();
        assert!(matches!(err, RelayError::Codec(_)));
    }

    /// Rewrites the SOF0 dimensions of a baseline JPEG.
    fn with_declared_size(jpeg: &[u8], width: u16, height: u16) -> Vec<u8> {
        let mut patched = jpeg.to_vec();
        let sof = patched
            .windows(2)
            .position(|w| w == [0xFF, 0xC0])
            .expect("baseline frame header");
        patched[sof + 5..sof + 7].copy_from_slice(&height.to_be_bytes());
        patched[sof + 7..sof + 9].copy_from_slice(&width.to_be_bytes());
        patched
    }

    #[test]
    fn oversized_frame_header_is_refused_before_decoding() {
        let jpeg = JpegCodec.encode_jpeg(&gradient(16, 16), 80).unwrap();
        let inflated = with_declared_size(&jpeg, 0xFFFF, 0xFFFF);
        assert!(inflated.len() < 1024);

        let err = JpegCodec.decode(&Frame::jpeg(inflated)).unwrap_err();
        assert!(matches!(err, RelayError::Codec(_)));
        assert!(err.to_string().contains("65535x65535"), "{err}");
    }

    #[test]
    fn header_check_leaves_normal_images_alone() {
        let jpeg = JpegCodec.encode_jpeg(&gradient(16, 16), 80).unwrap();
        let same = with_declared_size(&jpeg, 16, 16);
        assert_eq!(same, jpeg.to_vec());
        assert_eq!(
            JpegCodec.decode(&Frame::jpeg(same)).unwrap().dimensions(),
            (16, 16)
        );
    }

    #[test]
    fn rotation_swaps_dimensions() {
        let image = gradient(4, 2);
        assert_eq!(rotate(image.clone(), 90).dimensions(), (2, 4));
        assert_eq!(rotate(image.clone(), 180).dimensions(), (4, 2));
        assert_eq!(rotate(image, 0).dimensions(), (4, 2));
    }
}
