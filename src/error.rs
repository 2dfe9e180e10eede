//! Error taxonomy for the relay.
//!
//! Protocol errors are fatal to the connection they occur on, I/O errors
//! are reported and left to the caller's reconnection policy, and resource
//! errors disable the publishing path without touching the network path.
//! A full queue is not an error at all (see [`crate::pipeline::queue::Offer`]).

use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::net::envelope::MAX_FRAME_BYTES;

pub type Result<T, E = RelayError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// A read or write exceeded the connection timeout. Retryable at a
    /// higher level; the connection itself is torn down.
    #[error("{op} timed out after {after:?}")]
    Timeout { op: &'static str, after: Duration },

    #[error("connection closed")]
    ConnectionClosed,

    #[error("resource error: {0}")]
    Resource(#[from] ResourceError),

    /// Image decode/encode failure; affects a single frame only.
    #[error("codec error: {0}")]
    Codec(String),

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("start marker mismatch: got {0:02x?}")]
    BadStartMarker([u8; 4]),

    #[error("end marker mismatch after payload")]
    BadEndMarker,

    #[error("frame length {0} outside 1..={max}", max = MAX_FRAME_BYTES)]
    LengthOutOfRange(u32),

    #[error("payload of {0} bytes cannot be framed")]
    PayloadSize(usize),

    #[error("connection closed in the middle of a frame")]
    TruncatedFrame,

    #[error("handshake {field} mismatch: expected {expected:#04x}, got {actual:#04x}")]
    HandshakeMismatch {
        field: &'static str,
        expected: u8,
        actual: u8,
    },

    #[error("unsupported pixel depth: {0} bits per pixel")]
    UnsupportedDepth(u8),

    #[error("consumer announced empty geometry {width}x{height}")]
    EmptyGeometry { width: u32, height: u32 },

    #[error("consumer geometry {width}x{height} at {bytes_per_pixel} bytes per pixel does not fit a 24-bit frame size")]
    GeometryTooLarge {
        width: u32,
        height: u32,
        bytes_per_pixel: usize,
    },

    #[error("device payload of {0} bytes does not fit a 24-bit size field")]
    DevicePayloadTooLarge(usize),
}

#[derive(Debug, Error)]
pub enum ResourceError {
    #[error("failed to allocate shared segment {name}: {source}")]
    Allocation {
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("shared segment {name} holds {actual} bytes, expected at least {expected}")]
    SegmentTooSmall {
        name: String,
        expected: usize,
        actual: usize,
    },

    #[error("geometry mismatch: converted frame is {actual} bytes, slot holds {expected}")]
    GeometryMismatch { expected: usize, actual: usize },
}

impl RelayError {
    /// Whether the error ends the connection or session it occurred on.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, RelayError::Codec(_))
    }

    /// Whether a caller may reasonably retry (reconnect) after this error.
    pub fn is_retryable(&self) -> bool {
        match self {
            RelayError::Timeout { .. } | RelayError::ConnectionClosed => true,
            RelayError::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::TimedOut
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::Interrupted
            ),
            _ => false,
        }
    }

    /// Maps an error from an exact-length read, turning EOF into a close.
    pub(crate) fn from_read(err: io::Error) -> Self {
        if err.kind() == io::ErrorKind::UnexpectedEof {
            RelayError::ConnectionClosed
        } else {
            RelayError::Io(err)
        }
    }
}

impl From<jpeg_decoder::Error> for RelayError {
    fn from(e: jpeg_decoder::Error) -> Self {
        RelayError::Codec(e.to_string())
    }
}

impl From<image::ImageError> for RelayError {
    fn from(e: image::ImageError) -> Self {
        RelayError::Codec(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_is_retryable_protocol_is_not() {
        let timeout = RelayError::Timeout {
            op: "read",
            after: Duration::from_secs(10),
        };
        assert!(timeout.is_retryable());
        assert!(timeout.is_fatal());

        let protocol: RelayError = ProtocolError::BadEndMarker.into();
        assert!(!protocol.is_retryable());
        assert!(protocol.is_fatal());
    }

    #[test]
    fn eof_maps_to_connection_closed() {
        let err = RelayError::from_read(io::Error::new(io::ErrorKind::UnexpectedEof, "eof"));
        assert!(matches!(err, RelayError::ConnectionClosed));

        let err = RelayError::from_read(io::Error::new(io::ErrorKind::BrokenPipe, "pipe"));
        assert!(matches!(err, RelayError::Io(_)));
        assert!(err.is_retryable());
    }

    #[test]
    fn codec_errors_only_affect_one_frame() {
        let err = RelayError::Codec("bad huffman table".into());
        assert!(!err.is_fatal());
    }

    #[test]
    fn length_error_mentions_limit() {
        let msg = ProtocolError::LengthOutOfRange(0).to_string();
        assert!(msg.contains(&MAX_FRAME_BYTES.to_string()));
    }
}
