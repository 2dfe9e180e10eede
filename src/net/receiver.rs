//! Resynchronising envelope decoder.
//!
//! Unlike the strict reader in [`super::envelope`], [`StreamReceiver`]
//! scans for the start marker byte by byte, so garbage between frames or a
//! bogus length only costs the bytes involved rather than the connection.
//! A frame whose end marker is wrong is still fatal: at that point the
//! payload boundary itself is untrustworthy.

use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::timeout;
use tokio_util::codec::Decoder;
use tracing::{debug, warn};

use super::envelope::{check_length, END_MARKER, START_MARKER};
use crate::error::{ProtocolError, RelayError, Result};

const READ_CHUNK: usize = 64 * 1024;

/// Where the decoder is within the current envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Looking for the start marker; `matched` bytes of it seen so far.
    SeekStart { matched: usize },
    ReadLength,
    ReadPayload { len: usize },
    /// Payload complete; `matched` bytes of the end marker seen so far.
    SeekEnd { matched: usize },
    /// End marker mismatch. Terminal.
    Failed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReceiverStats {
    pub frames: u64,
    /// Length fields outside `1..=MAX_FRAME_BYTES`
    pub rejected_lengths: u64,
    /// Bytes discarded while hunting for a start marker
    pub skipped_bytes: u64,
}

#[derive(Debug)]
pub struct StreamReceiver {
    phase: Phase,
    payload: Option<Bytes>,
    stats: ReceiverStats,
}

impl Default for StreamReceiver {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamReceiver {
    pub fn new() -> Self {
        Self {
            phase: Phase::SeekStart { matched: 0 },
            payload: None,
            stats: ReceiverStats::default(),
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn stats(&self) -> ReceiverStats {
        self.stats
    }

    /// True when no part of an envelope has been consumed yet.
    pub fn is_between_frames(&self) -> bool {
        matches!(self.phase, Phase::SeekStart { .. })
    }
}

impl Decoder for StreamReceiver {
    type Item = Bytes;
    type Error = RelayError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>> {
        loop {
            match self.phase {
                Phase::SeekStart { mut matched } => {
                    while matched < START_MARKER.len() {
                        if !src.has_remaining() {
                            self.phase = Phase::SeekStart { matched };
                            return Ok(None);
                        }
                        let byte = src.get_u8();
                        if byte == START_MARKER[matched] {
                            matched += 1;
                        } else {
                            // Single-byte lookback: the mismatching byte may
                            // itself open a new marker
                            let restart = usize::from(byte == START_MARKER[0]);
                            self.stats.skipped_bytes += (matched + 1 - restart) as u64;
                            matched = restart;
                        }
                    }
                    self.phase = Phase::ReadLength;
                }

                Phase::ReadLength => {
                    if src.len() < 4 {
                        return Ok(None);
                    }
                    let length = src.get_u32_le();
                    match check_length(length) {
                        Ok(len) => {
                            src.reserve(len.saturating_sub(src.len()));
                            self.phase = Phase::ReadPayload { len };
                        }
                        Err(e) => {
                            warn!("{}, resynchronising", e);
                            self.stats.rejected_lengths += 1;
                            self.phase = Phase::SeekStart { matched: 0 };
                        }
                    }
                }

                Phase::ReadPayload { len } => {
                    if src.len() < len {
                        return Ok(None);
                    }
                    self.payload = Some(src.split_to(len).freeze());
                    self.phase = Phase::SeekEnd { matched: 0 };
                }

                Phase::SeekEnd { mut matched } => {
                    while matched < END_MARKER.len() {
                        if !src.has_remaining() {
                            self.phase = Phase::SeekEnd { matched };
                            return Ok(None);
                        }
                        if src.get_u8() != END_MARKER[matched] {
                            self.phase = Phase::Failed;
                            self.payload = None;
                            return Err(ProtocolError::BadEndMarker.into());
                        }
                        matched += 1;
                    }

                    self.phase = Phase::SeekStart { matched: 0 };
                    self.stats.frames += 1;
                    return Ok(self.payload.take());
                }

                Phase::Failed => return Err(ProtocolError::BadEndMarker.into()),
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>> {
        if let Some(frame) = self.decode(src)? {
            return Ok(Some(frame));
        }
        if self.is_between_frames() {
            // Any partial start marker left over is just trailing noise
            src.clear();
            Ok(None)
        } else {
            Err(ProtocolError::TruncatedFrame.into())
        }
    }
}

/// Pulls decoded payloads off an async byte stream.
///
/// Every read from the underlying stream is bounded by `read_timeout`; an
/// idle peer surfaces as [`RelayError::Timeout`] rather than a hang.
pub struct FrameReader<R> {
    reader: R,
    codec: StreamReceiver,
    buf: BytesMut,
    read_timeout: Duration,
    eof: bool,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R, read_timeout: Duration) -> Self {
        Self {
            reader,
            codec: StreamReceiver::new(),
            buf: BytesMut::with_capacity(READ_CHUNK),
            read_timeout,
            eof: false,
        }
    }

    pub fn stats(&self) -> ReceiverStats {
        self.codec.stats()
    }

    /// Next complete payload, or `None` once the peer closed cleanly
    /// between two frames.
    pub async fn next_frame(&mut self) -> Result<Option<Bytes>> {
        loop {
            if let Some(frame) = self.codec.decode(&mut self.buf)? {
                return Ok(Some(frame));
            }
            if self.eof {
                return self.codec.decode_eof(&mut self.buf);
            }

            self.buf.reserve(READ_CHUNK);
            let n = timeout(self.read_timeout, self.reader.read_buf(&mut self.buf))
                .await
                .map_err(|_| RelayError::Timeout {
                    op: "read",
                    after: self.read_timeout,
                })??;
            if n == 0 {
                debug!(phase = ?self.codec.phase(), "peer closed stream");
                self.eof = true;
            }
        }
    }
}
