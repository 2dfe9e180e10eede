//! Marker-delimited envelope carrying one frame over a byte stream.
//!
//! ## Wire format
//!
//! ```text
//! start marker:   01 02 03 04      (4)
//! length:         u32 LE           (4)
//! payload:        [u8; length]     (1 ..= MAX_FRAME_BYTES)
//! end marker:     04 03 02 01      (4)
//! ```
//!
//! The payload is a JPEG image, except for the reserved ASCII
//! [`TEST_PACKET`] which a sender emits once after connecting.

use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::timeout;

use crate::error::{ProtocolError, RelayError, Result};

// ── Constants ────────────────────────────────────────────────────

pub const START_MARKER: [u8; 4] = [0x01, 0x02, 0x03, 0x04];
pub const END_MARKER: [u8; 4] = [0x04, 0x03, 0x02, 0x01];

/// Largest payload either side accepts (10 MiB).
pub const MAX_FRAME_BYTES: usize = 10 * 1024 * 1024;

/// Connection check payload, recognised by content.
pub const TEST_PACKET: &[u8] = b"CAMERA_TEST_PACKET";

/// Payloads below this size can never be a usable image.
pub const MIN_IMAGE_BYTES: usize = 100;

/// Framing bytes added around every payload.
pub const OVERHEAD: usize = START_MARKER.len() + 4 + END_MARKER.len();

// ── Encoding ─────────────────────────────────────────────────────

/// Validates a length read off the wire, returning it as a payload size.
pub fn check_length(length: u32) -> Result<usize, ProtocolError> {
    let len = length as usize;
    if len == 0 || len > MAX_FRAME_BYTES {
        return Err(ProtocolError::LengthOutOfRange(length));
    }
    Ok(len)
}

/// Appends one complete envelope for `payload` to `dst`.
pub fn encode_into(payload: &[u8], dst: &mut BytesMut) -> Result<(), ProtocolError> {
    if payload.is_empty() || payload.len() > MAX_FRAME_BYTES {
        return Err(ProtocolError::PayloadSize(payload.len()));
    }
    dst.reserve(payload.len() + OVERHEAD);
    dst.put_slice(&START_MARKER);
    dst.put_u32_le(payload.len() as u32);
    dst.put_slice(payload);
    dst.put_slice(&END_MARKER);
    Ok(())
}

pub fn encode(payload: &[u8]) -> Result<Bytes, ProtocolError> {
    let mut buf = BytesMut::with_capacity(payload.len() + OVERHEAD);
    encode_into(payload, &mut buf)?;
    Ok(buf.freeze())
}

// ── Payload classification ───────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadKind {
    TestPacket,
    /// Too small to be an image; logged and ignored.
    Short(usize),
    Image,
}

impl PayloadKind {
    pub fn classify(payload: &[u8]) -> Self {
        if payload.len() < MIN_IMAGE_BYTES {
            if payload == TEST_PACKET {
                PayloadKind::TestPacket
            } else {
                PayloadKind::Short(payload.len())
            }
        } else {
            PayloadKind::Image
        }
    }
}

// ── Strict reader ────────────────────────────────────────────────

/// Reads exactly one envelope, with no attempt to resynchronise.
///
/// Each underlying read is bounded by `read_timeout`. A start marker
/// mismatch means the stream is out of sync; callers that want to recover
/// should use [`StreamReceiver`](super::receiver::StreamReceiver) instead.
pub async fn read_envelope<R>(reader: &mut R, read_timeout: Duration) -> Result<Bytes>
where
    R: AsyncRead + Unpin,
{
    let mut marker = [0u8; 4];
    read_exact_timeout(reader, &mut marker, read_timeout).await?;
    if marker != START_MARKER {
        return Err(ProtocolError::BadStartMarker(marker).into());
    }

    let mut length = [0u8; 4];
    read_exact_timeout(reader, &mut length, read_timeout).await?;
    let len = check_length(u32::from_le_bytes(length))?;

    let mut payload = BytesMut::zeroed(len);
    read_exact_timeout(reader, &mut payload, read_timeout).await?;

    read_exact_timeout(reader, &mut marker, read_timeout).await?;
    if marker != END_MARKER {
        return Err(ProtocolError::BadEndMarker.into());
    }

    Ok(payload.freeze())
}

/// Fills `buf`, applying the timeout to every individual read so a slow
/// but live peer is not cut off in the middle of a large payload.
async fn read_exact_timeout<R>(reader: &mut R, buf: &mut [u8], read_timeout: Duration) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = timeout(read_timeout, reader.read(&mut buf[filled..]))
            .await
            .map_err(|_| RelayError::Timeout {
                op: "read",
                after: read_timeout,
            })?
            .map_err(RelayError::from_read)?;
        if n == 0 {
            return Err(RelayError::ConnectionClosed);
        }
        filled += n;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::io::Builder;

    const TIMEOUT: Duration = Duration::from_secs(1);

    #[test]
    fn encode_layout() {
        let wire = encode(b"abc").unwrap();
        assert_eq!(
            &wire[..],
            &[1, 2, 3, 4, 3, 0, 0, 0, b'a', b'b', b'c', 4, 3, 2, 1]
        );
        assert_eq!(wire.len(), 3 + OVERHEAD);
    }

    #[test]
    fn encode_rejects_empty_and_oversize() {
        assert_eq!(encode(&[]), Err(ProtocolError::PayloadSize(0)));
        let big = vec![0u8; MAX_FRAME_BYTES + 1];
        assert_eq!(
            encode(&big),
            Err(ProtocolError::PayloadSize(MAX_FRAME_BYTES + 1))
        );
    }

    #[test]
    fn length_bounds() {
        assert!(check_length(0).is_err());
        assert_eq!(check_length(1), Ok(1));
        assert_eq!(check_length(MAX_FRAME_BYTES as u32), Ok(MAX_FRAME_BYTES));
        assert_eq!(
            check_length(MAX_FRAME_BYTES as u32 + 1),
            Err(ProtocolError::LengthOutOfRange(MAX_FRAME_BYTES as u32 + 1))
        );
    }

    #[test]
    fn classify_payloads() {
        assert_eq!(PayloadKind::classify(TEST_PACKET), PayloadKind::TestPacket);
        assert_eq!(PayloadKind::classify(b"hello"), PayloadKind::Short(5));
        assert_eq!(PayloadKind::classify(&[0xAB; 100]), PayloadKind::Image);
        // Content only matters below the size threshold
        let mut padded = TEST_PACKET.to_vec();
        padded.resize(200, b' ');
        assert_eq!(PayloadKind::classify(&padded), PayloadKind::Image);
    }

    #[tokio::test]
    async fn strict_reader_handles_split_reads() {
        let wire = encode(b"payload").unwrap();
        let mut mock = Builder::new()
            .read(&wire[..3])
            .read(&wire[3..9])
            .read(&wire[9..])
            .build();
        let payload = read_envelope(&mut mock, TIMEOUT).await.unwrap();
        assert_eq!(&payload[..], b"payload");
    }

    #[tokio::test]
    async fn strict_reader_max_size_frame() {
        let payload = vec![0x5A; MAX_FRAME_BYTES];
        let wire = encode(&payload).unwrap();
        let mut reader = &wire[..];
        let decoded = read_envelope(&mut reader, TIMEOUT).await.unwrap();
        assert_eq!(decoded.len(), MAX_FRAME_BYTES);
        assert_eq!(&decoded[..], &payload[..]);
    }

    #[tokio::test]
    async fn strict_reader_rejects_garbage_prefix() {
        let mut wire = vec![0xEE];
        wire.extend_from_slice(&encode(b"x").unwrap());
        let mut reader = &wire[..];
        let err = read_envelope(&mut reader, TIMEOUT).await.unwrap_err();
        assert!(matches!(
            err,
            RelayError::Protocol(ProtocolError::BadStartMarker([0xEE, 1, 2, 3]))
        ));
    }

    #[tokio::test]
    async fn strict_reader_rejects_zero_length() {
        let wire = [1, 2, 3, 4, 0, 0, 0, 0];
        let mut reader = &wire[..];
        let err = read_envelope(&mut reader, TIMEOUT).await.unwrap_err();
        assert!(matches!(
            err,
            RelayError::Protocol(ProtocolError::LengthOutOfRange(0))
        ));
    }

    #[tokio::test]
    async fn strict_reader_bad_end_marker() {
        let mut wire = encode(b"abc").unwrap().to_vec();
        let last = wire.len() - 1;
        wire[last] = 0xFF;
        let mut reader = &wire[..];
        let err = read_envelope(&mut reader, TIMEOUT).await.unwrap_err();
        assert!(matches!(
            err,
            RelayError::Protocol(ProtocolError::BadEndMarker)
        ));
    }

    #[tokio::test]
    async fn strict_reader_eof_is_connection_closed() {
        let wire = encode(b"abcdef").unwrap();
        let mut reader = &wire[..10];
        let err = read_envelope(&mut reader, TIMEOUT).await.unwrap_err();
        assert!(matches!(err, RelayError::ConnectionClosed));

        let mut empty: &[u8] = &[];
        let err = read_envelope(&mut empty, TIMEOUT).await.unwrap_err();
        assert!(matches!(err, RelayError::ConnectionClosed));
    }

    #[tokio::test]
    async fn strict_reader_times_out_on_idle_peer() {
        let (mut client, _server) = tokio::io::duplex(64);
        let err = read_envelope(&mut client, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::Timeout { op: "read", .. }));
        assert!(err.is_retryable());
    }
}
