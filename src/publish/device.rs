//! Stream transport to a virtual camera device process.
//!
//! ## Wire format
//!
//! **Handshake** (consumer → client, 11 bytes):
//! ```text
//! signature:        u8     0xFF
//! message type:     u8     0x02
//! width:            u32 BE
//! height:           u32 BE
//! bits per pixel:   u8
//! ```
//!
//! **Frame** (client → consumer, 5 byte header + payload):
//! ```text
//! signature:        u8     0xFF
//! message type:     u8     0x01
//! size:             u24 LE
//! payload:          [u8; size]  BGR24 or BGRA32, bottom-up mirrored
//! ```
//!
//! There is no acknowledgement; a successful write is the only liveness
//! signal.

use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use image::RgbImage;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::time::timeout;
use tracing::{debug, info};

use super::convert::{to_consumer_layout, TargetLayout};
use crate::capture::{Frame, ImageCodec};
use crate::error::{ProtocolError, RelayError, Result};
use crate::{utils, NetworkConfig};

const SIGNATURE: u8 = 0xFF;
const MSG_FRAME: u8 = 0x01;
const MSG_HANDSHAKE: u8 = 0x02;

/// Largest payload the 24-bit size field can describe.
pub const MAX_DEVICE_PAYLOAD: usize = 0xFF_FFFF;

// ── DeviceHandshake ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceHandshake {
    pub width: u32,
    pub height: u32,
    pub bits_per_pixel: u8,
    pub bytes_per_pixel: usize,
}

impl DeviceHandshake {
    pub const SIZE: usize = 11;

    pub fn new(width: u32, height: u32, bits_per_pixel: u8) -> Result<Self, ProtocolError> {
        if width == 0 || height == 0 {
            return Err(ProtocolError::EmptyGeometry { width, height });
        }
        let bytes_per_pixel = usize::from(bits_per_pixel).div_ceil(8);
        if !matches!(bytes_per_pixel, 3 | 4) {
            return Err(ProtocolError::UnsupportedDepth(bits_per_pixel));
        }
        // Every frame must fit the 24-bit size field
        let frame_len = (width as usize)
            .checked_mul(height as usize)
            .and_then(|px| px.checked_mul(bytes_per_pixel));
        if !matches!(frame_len, Some(len) if len <= MAX_DEVICE_PAYLOAD) {
            return Err(ProtocolError::GeometryTooLarge {
                width,
                height,
                bytes_per_pixel,
            });
        }
        Ok(Self {
            width,
            height,
            bits_per_pixel,
            bytes_per_pixel,
        })
    }

    pub fn decode(data: &[u8; Self::SIZE]) -> Result<Self, ProtocolError> {
        expect_byte("signature", SIGNATURE, data[0])?;
        expect_byte("message type", MSG_HANDSHAKE, data[1])?;
        let width = u32::from_be_bytes([data[2], data[3], data[4], data[5]]);
        let height = u32::from_be_bytes([data[6], data[7], data[8], data[9]]);
        Self::new(width, height, data[10])
    }

    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0] = SIGNATURE;
        buf[1] = MSG_HANDSHAKE;
        buf[2..6].copy_from_slice(&self.width.to_be_bytes());
        buf[6..10].copy_from_slice(&self.height.to_be_bytes());
        buf[10] = self.bits_per_pixel;
        buf
    }

    pub fn layout(&self) -> TargetLayout {
        if self.bytes_per_pixel == 4 {
            TargetLayout::Bgra32
        } else {
            TargetLayout::Bgr24
        }
    }

    pub fn frame_len(&self) -> usize {
        self.layout().frame_len(self.width, self.height)
    }

    /// Converts `image` to the negotiated geometry and frames it.
    pub fn prepare(&self, image: &RgbImage) -> Result<Bytes, ProtocolError> {
        let pixels = to_consumer_layout(image, self.width, self.height, self.layout());
        frame_message(&pixels)
    }
}

fn expect_byte(field: &'static str, expected: u8, actual: u8) -> Result<(), ProtocolError> {
    if actual != expected {
        return Err(ProtocolError::HandshakeMismatch {
            field,
            expected,
            actual,
        });
    }
    Ok(())
}

/// Prefixes `payload` with the 5-byte frame header.
pub fn frame_message(payload: &[u8]) -> Result<Bytes, ProtocolError> {
    if payload.len() > MAX_DEVICE_PAYLOAD {
        return Err(ProtocolError::DevicePayloadTooLarge(payload.len()));
    }
    let size = (payload.len() as u32).to_le_bytes();
    let mut buf = BytesMut::with_capacity(payload.len() + 5);
    buf.put_slice(&[SIGNATURE, MSG_FRAME, size[0], size[1], size[2]]);
    buf.put_slice(payload);
    Ok(buf.freeze())
}

// ── DeviceHandshakeClient ────────────────────────────────────────

pub struct DeviceHandshakeClient<S = TcpStream> {
    stream: S,
    handshake: DeviceHandshake,
    write_timeout: Duration,
    frames: u64,
}

impl DeviceHandshakeClient<TcpStream> {
    pub async fn connect(addr: impl ToSocketAddrs, config: &NetworkConfig) -> Result<Self> {
        let stream = utils::connect(addr, config).await?;
        Self::handshake(stream, config.read_timeout(), config.write_timeout()).await
    }
}

impl<S> DeviceHandshakeClient<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Reads the consumer's geometry announcement from an open stream.
    pub async fn handshake(mut stream: S, read_timeout: Duration, write_timeout: Duration) -> Result<Self> {
        let mut header = [0u8; DeviceHandshake::SIZE];
        timeout(read_timeout, stream.read_exact(&mut header))
            .await
            .map_err(|_| RelayError::Timeout {
                op: "handshake",
                after: read_timeout,
            })?
            .map_err(RelayError::from_read)?;

        let handshake = DeviceHandshake::decode(&header)?;
        info!(
            width = handshake.width,
            height = handshake.height,
            bpp = handshake.bits_per_pixel,
            "device handshake complete"
        );
        Ok(Self {
            stream,
            handshake,
            write_timeout,
            frames: 0,
        })
    }

    pub fn negotiated(&self) -> DeviceHandshake {
        self.handshake
    }

    pub fn frames_sent(&self) -> u64 {
        self.frames
    }

    /// Writes a message produced by [`DeviceHandshake::prepare`].
    pub async fn send_prepared(&mut self, message: &[u8]) -> Result<()> {
        timeout(self.write_timeout, self.stream.write_all(message))
            .await
            .map_err(|_| RelayError::Timeout {
                op: "write",
                after: self.write_timeout,
            })??;
        self.frames += 1;
        debug!(frames = self.frames, len = message.len(), "device frame sent");
        Ok(())
    }

    /// Decodes, converts and sends one frame.
    pub async fn send_frame(&mut self, frame: &Frame, codec: &dyn ImageCodec) -> Result<()> {
        let image = codec.decode(frame)?;
        let message = self.handshake.prepare(&image)?;
        self.send_prepared(&message).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{JpegCodec, PixelFormat};

    const HD_HEADER: [u8; 11] = [0xFF, 0x02, 0x00, 0x00, 0x05, 0x00, 0x00, 0x00, 0x02, 0xD0, 0x18];

    #[test]
    fn parses_reference_header() {
        let hs = DeviceHandshake::decode(&HD_HEADER).unwrap();
        assert_eq!((hs.width, hs.height), (1280, 720));
        assert_eq!(hs.bits_per_pixel, 24);
        assert_eq!(hs.bytes_per_pixel, 3);
        assert_eq!(hs.layout(), TargetLayout::Bgr24);
        assert_eq!(hs.encode(), HD_HEADER);
    }

    #[test]
    fn bits_round_up_to_bytes() {
        assert_eq!(DeviceHandshake::new(2, 2, 32).unwrap().bytes_per_pixel, 4);
        assert_eq!(DeviceHandshake::new(2, 2, 17).unwrap().bytes_per_pixel, 3);
        assert_eq!(
            DeviceHandshake::new(2, 2, 16),
            Err(ProtocolError::UnsupportedDepth(16))
        );
        assert_eq!(
            DeviceHandshake::new(2, 2, 33),
            Err(ProtocolError::UnsupportedDepth(33))
        );
    }

    #[test]
    fn rejects_bad_signature_and_type() {
        let mut bad = HD_HEADER;
        bad[0] = 0xFE;
        assert_eq!(
            DeviceHandshake::decode(&bad),
            Err(ProtocolError::HandshakeMismatch {
                field: "signature",
                expected: 0xFF,
                actual: 0xFE
            })
        );

        let mut bad = HD_HEADER;
        bad[1] = 0x01;
        assert!(matches!(
            DeviceHandshake::decode(&bad),
            Err(ProtocolError::HandshakeMismatch { field: "message type", .. })
        ));
    }

    #[test]
    fn geometry_beyond_u24_frames_is_refused() {
        // 4096x4096x3 is 48 MiB, far past the size field
        let big = [0xFF, 0x02, 0x00, 0x00, 0x10, 0x00, 0x00, 0x00, 0x10, 0x00, 0x18];
        assert_eq!(
            DeviceHandshake::decode(&big),
            Err(ProtocolError::GeometryTooLarge {
                width: 4096,
                height: 4096,
                bytes_per_pixel: 3
            })
        );

        let huge = [0xFF, 0x02, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0x20];
        assert!(matches!(
            DeviceHandshake::decode(&huge),
            Err(ProtocolError::GeometryTooLarge {
                width: u32::MAX,
                height: u32::MAX,
                ..
            })
        ));
    }

    #[test]
    fn largest_fitting_geometry_is_accepted() {
        // 2364 * 2364 * 3 = 16_765_488 <= 0xFF_FFFF
        let hs = DeviceHandshake::new(2364, 2364, 24).unwrap();
        assert!(hs.frame_len() <= MAX_DEVICE_PAYLOAD);
        assert!(DeviceHandshake::new(2365, 2365, 24).is_err());
        assert!(DeviceHandshake::new(1920, 1080, 32).is_ok());
    }

    #[tokio::test]
    async fn oversized_announcement_fails_handshake() {
        let big = [0xFF, 0x02, 0x00, 0x00, 0x10, 0x00, 0x00, 0x00, 0x10, 0x00, 0x18];
        let mock = tokio_test::io::Builder::new().read(&big).build();
        let timeout = Duration::from_secs(1);
        let err = DeviceHandshakeClient::handshake(mock, timeout, timeout)
            .await
            .err()
            .unwrap();
        assert!(matches!(
            err,
            RelayError::Protocol(ProtocolError::GeometryTooLarge { .. })
        ));
    }

    #[test]
    fn frame_header_is_u24_le() {
        let payload = vec![7u8; 0x01_0203];
        let msg = frame_message(&payload).unwrap();
        assert_eq!(&msg[..5], &[0xFF, 0x01, 0x03, 0x02, 0x01]);
        assert_eq!(msg.len(), payload.len() + 5);
    }

    #[test]
    fn oversize_payload_rejected() {
        let payload = vec![0u8; MAX_DEVICE_PAYLOAD + 1];
        assert_eq!(
            frame_message(&payload),
            Err(ProtocolError::DevicePayloadTooLarge(MAX_DEVICE_PAYLOAD + 1))
        );
        assert!(frame_message(&payload[..MAX_DEVICE_PAYLOAD]).is_ok());
    }

    #[tokio::test]
    async fn handshake_then_bgra_frame() {
        let header = DeviceHandshake::new(2, 1, 32).unwrap().encode();
        let expected = frame_message(&[6, 5, 4, 255, 3, 2, 1, 255]).unwrap();
        let mock = tokio_test::io::Builder::new()
            .read(&header)
            .write(&expected)
            .build();

        let timeout = Duration::from_secs(1);
        let mut client = DeviceHandshakeClient::handshake(mock, timeout, timeout)
            .await
            .unwrap();
        assert_eq!(client.negotiated().layout(), TargetLayout::Bgra32);

        let frame = Frame::new(vec![1, 2, 3, 4, 5, 6], 2, 1, PixelFormat::Rgb24);
        client.send_frame(&frame, &JpegCodec).await.unwrap();
        assert_eq!(client.frames_sent(), 1);
    }

    #[tokio::test]
    async fn silent_consumer_times_out() {
        let (stream, _peer) = tokio::io::duplex(64);
        let err = DeviceHandshakeClient::handshake(
            stream,
            Duration::from_millis(50),
            Duration::from_millis(50),
        )
        .await
        .err()
        .unwrap();
        assert!(matches!(err, RelayError::Timeout { op: "handshake", .. }));
    }

    #[tokio::test]
    async fn closed_consumer_is_connection_closed() {
        let mock = tokio_test::io::Builder::new().read(&HD_HEADER[..5]).build();
        let timeout = Duration::from_secs(1);
        let err = DeviceHandshakeClient::handshake(mock, timeout, timeout)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, RelayError::ConnectionClosed));
    }
}
