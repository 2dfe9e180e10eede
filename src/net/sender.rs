//! Serialised envelope writer shared by the encode workers.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use super::envelope::{self, TEST_PACKET};
use crate::error::{RelayError, Result};
use crate::{utils, NetworkConfig};

/// Owns one live connection and writes whole envelopes onto it.
///
/// Envelopes are encoded outside the lock; only the write and flush happen
/// under it, so concurrent senders never interleave partial envelopes. The
/// first failed write poisons the sender and every later call fails fast
/// with [`RelayError::ConnectionClosed`]. There is no reconnect.
pub struct StreamSender<W = TcpStream> {
    writer: Mutex<W>,
    write_timeout: Duration,
    poisoned: AtomicBool,
    frames: AtomicU64,
    bytes: AtomicU64,
}

impl StreamSender<TcpStream> {
    /// Connects to a receiver and applies the configured socket options.
    pub async fn connect(addr: impl ToSocketAddrs, config: &NetworkConfig) -> Result<Self> {
        let stream = utils::connect(addr, config).await?;
        if let Ok(peer) = stream.peer_addr() {
            info!(%peer, "connected to receiver");
        }
        Ok(Self::new(stream, config.write_timeout()))
    }
}

impl<W> StreamSender<W>
where
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(writer: W, write_timeout: Duration) -> Self {
        Self {
            writer: Mutex::new(writer),
            write_timeout,
            poisoned: AtomicBool::new(false),
            frames: AtomicU64::new(0),
            bytes: AtomicU64::new(0),
        }
    }

    /// Frames one payload and writes it in full.
    #[instrument(level = "trace", skip_all, fields(len = payload.len()))]
    pub async fn send_frame(&self, payload: &[u8]) -> Result<()> {
        if self.is_poisoned() {
            return Err(RelayError::ConnectionClosed);
        }

        let wire = envelope::encode(payload)?;
        let started = Instant::now();
        self.write_envelope(&wire).await?;

        metrics::counter!("frames_sent").increment(1);
        metrics::histogram!("send_time_us").record(started.elapsed().as_micros() as f64);
        self.frames.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(wire.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    /// Sends the connection check payload.
    pub async fn send_test_packet(&self) -> Result<()> {
        debug!("sending test packet");
        self.send_frame(TEST_PACKET).await
    }

    async fn write_envelope(&self, wire: &Bytes) -> Result<()> {
        let mut writer = self.writer.lock().await;
        // Re-check under the lock: another worker may have failed meanwhile
        if self.is_poisoned() {
            return Err(RelayError::ConnectionClosed);
        }

        let result = tokio::time::timeout(self.write_timeout, async {
            writer.write_all(wire).await?;
            writer.flush().await
        })
        .await;

        match result {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                self.poison();
                warn!("write failed: {}", e);
                Err(e.into())
            }
            Err(_) => {
                self.poison();
                warn!("write timed out after {:?}", self.write_timeout);
                Err(RelayError::Timeout {
                    op: "write",
                    after: self.write_timeout,
                })
            }
        }
    }

    fn poison(&self) {
        self.poisoned.store(true, Ordering::Release);
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::Acquire)
    }

    pub fn frames_sent(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    /// Flushes and shuts down the write half.
    pub async fn shutdown(&self) -> Result<()> {
        let mut writer = self.writer.lock().await;
        writer.shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProtocolError;
    use crate::net::receiver::StreamReceiver;
    use bytes::BytesMut;
    use std::sync::Arc;
    use tokio::io::AsyncReadExt;
    use tokio_util::codec::Decoder;

    const TIMEOUT: Duration = Duration::from_secs(1);

    #[tokio::test]
    async fn writes_complete_envelope() {
        let expected = envelope::encode(b"hello").unwrap();
        let mock = tokio_test::io::Builder::new().write(&expected).build();
        let sender = StreamSender::new(mock, TIMEOUT);

        sender.send_frame(b"hello").await.unwrap();
        assert_eq!(sender.frames_sent(), 1);
        assert_eq!(sender.bytes_sent(), expected.len() as u64);
    }

    #[tokio::test]
    async fn rejects_empty_payload_without_poisoning() {
        let mock = tokio_test::io::Builder::new().build();
        let sender = StreamSender::new(mock, TIMEOUT);

        let err = sender.send_frame(&[]).await.unwrap_err();
        assert!(matches!(
            err,
            RelayError::Protocol(ProtocolError::PayloadSize(0))
        ));
        assert!(!sender.is_poisoned());
    }

    #[tokio::test]
    async fn write_error_poisons() {
        let mock = tokio_test::io::Builder::new()
            .write_error(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "peer gone",
            ))
            .build();
        let sender = StreamSender::new(mock, TIMEOUT);

        let err = sender.send_frame(b"frame").await.unwrap_err();
        assert!(matches!(err, RelayError::Io(_)));
        assert!(err.is_retryable());
        assert!(sender.is_poisoned());

        let err = sender.send_frame(b"frame").await.unwrap_err();
        assert!(matches!(err, RelayError::ConnectionClosed));
    }

    #[tokio::test]
    async fn stalled_peer_times_out() {
        // Nobody reads the other end, so the tiny pipe fills up
        let (client, _server) = tokio::io::duplex(16);
        let sender = StreamSender::new(client, Duration::from_millis(50));

        let err = sender.send_frame(&[0u8; 1024]).await.unwrap_err();
        assert!(matches!(err, RelayError::Timeout { op: "write", .. }));
        assert!(sender.is_poisoned());
    }

    #[tokio::test]
    async fn concurrent_sends_never_interleave() {
        let (client, mut server) = tokio::io::duplex(1024);
        let sender = Arc::new(StreamSender::new(client, Duration::from_secs(5)));

        let mut tasks = Vec::new();
        for worker in 0..4u8 {
            let sender = sender.clone();
            tasks.push(tokio::spawn(async move {
                for _ in 0..25 {
                    let payload = vec![worker; 700];
                    sender.send_frame(&payload).await.unwrap();
                }
            }));
        }

        let reader = tokio::spawn(async move {
            let mut buf = Vec::new();
            server.read_to_end(&mut buf).await.unwrap();
            buf
        });

        for task in tasks {
            task.await.unwrap();
        }
        sender.shutdown().await.unwrap();
        drop(sender);

        let wire = reader.await.unwrap();
        let mut codec = StreamReceiver::new();
        let mut buf = BytesMut::from(&wire[..]);
        let mut count = 0;
        while let Some(frame) = codec.decode(&mut buf).unwrap() {
            assert_eq!(frame.len(), 700);
            assert!(frame.iter().all(|&b| b == frame[0]));
            count += 1;
        }
        assert_eq!(count, 100);
        assert_eq!(codec.stats().skipped_bytes, 0);
    }

    #[tokio::test]
    async fn test_packet_payload() {
        let expected = envelope::encode(TEST_PACKET).unwrap();
        let mock = tokio_test::io::Builder::new().write(&expected).build();
        let sender = StreamSender::new(mock, TIMEOUT);
        sender.send_test_packet().await.unwrap();
    }
}
