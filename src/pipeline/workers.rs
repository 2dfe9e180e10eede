//! Encode/send worker pool.
//!
//! Each worker takes a frame, encodes it to JPEG on the blocking pool and
//! hands the result to the shared [`StreamSender`]. With several workers
//! frames can reach the wire out of capture order; the sender only
//! guarantees that envelopes never interleave.

use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use tokio::io::AsyncWrite;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::queue::BoundedFrameQueue;
use super::stats::PipelineStats;
use crate::capture::codec::{rotate, ImageCodec};
use crate::capture::{Frame, PixelFormat};
use crate::error::{ProtocolError, RelayError, Result};
use crate::net::sender::StreamSender;
use crate::status::{Component, StatusReporter};

#[derive(Debug, Clone, Copy)]
pub struct WorkerConfig {
    pub workers: usize,
    pub jpeg_quality: u8,
    /// Clockwise, multiple of 90
    pub rotation: u16,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            jpeg_quality: 40,
            rotation: 0,
        }
    }
}

/// Turns a captured frame into the JPEG payload that goes on the wire.
///
/// Already-encoded frames pass through untouched unless they need rotating.
pub fn prepare_payload(
    codec: &dyn ImageCodec,
    frame: Frame,
    quality: u8,
    rotation: u16,
) -> Result<Bytes> {
    if frame.meta.format == PixelFormat::EncodedJpeg && rotation % 360 == 0 {
        return Ok(frame.data);
    }
    let image = rotate(codec.decode(&frame)?, rotation);
    codec.encode_jpeg(&image, quality)
}

/// Starts `config.workers` tasks draining `queue` into `sender`.
///
/// A send failure is reported and cancels `cancel`, which stops the rest of
/// the pipeline. Encode failures and payloads too large to frame only skip
/// that frame.
pub fn spawn_workers<W>(
    queue: BoundedFrameQueue,
    sender: Arc<StreamSender<W>>,
    codec: Arc<dyn ImageCodec>,
    config: WorkerConfig,
    stats: Arc<PipelineStats>,
    status: StatusReporter,
    cancel: CancellationToken,
) -> Vec<JoinHandle<()>>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    (0..config.workers.max(1))
        .map(|id| {
            let worker = Worker {
                id,
                queue: queue.clone(),
                sender: sender.clone(),
                codec: codec.clone(),
                config,
                stats: stats.clone(),
                status: status.clone(),
                cancel: cancel.clone(),
            };
            tokio::spawn(worker.run())
        })
        .collect()
}

struct Worker<W> {
    id: usize,
    queue: BoundedFrameQueue,
    sender: Arc<StreamSender<W>>,
    codec: Arc<dyn ImageCodec>,
    config: WorkerConfig,
    stats: Arc<PipelineStats>,
    status: StatusReporter,
    cancel: CancellationToken,
}

impl<W> Worker<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    async fn run(self) {
        debug!(worker = self.id, "encode worker started");

        loop {
            let frame = tokio::select! {
                _ = self.cancel.cancelled() => break,
                frame = self.queue.take() => match frame {
                    Some(frame) => frame,
                    None => break,
                },
            };
            let sequence = frame.meta.sequence;
            let captured = frame.timestamp;

            let started = Instant::now();
            let codec = self.codec.clone();
            let (quality, rotation) = (self.config.jpeg_quality, self.config.rotation);
            let encoded = tokio::task::spawn_blocking(move || {
                prepare_payload(codec.as_ref(), frame, quality, rotation)
            })
            .await;

            let payload = match encoded {
                Ok(Ok(payload)) => payload,
                Ok(Err(e)) => {
                    warn!(worker = self.id, sequence, "encode failed: {}", e);
                    self.status.error(Component::Encoder, &e);
                    continue;
                }
                Err(e) => {
                    error!(worker = self.id, "encode task panicked: {}", e);
                    self.status.error(Component::Encoder, &e);
                    break;
                }
            };
            let processing = started.elapsed();
            metrics::histogram!("encode_time_us").record(processing.as_micros() as f64);

            // Not raced against cancellation: a started envelope always completes
            let net_started = Instant::now();
            match self.sender.send_frame(&payload).await {
                Ok(()) => {}
                Err(e @ RelayError::Protocol(ProtocolError::PayloadSize(_))) => {
                    warn!(worker = self.id, sequence, "frame skipped: {}", e);
                    self.status.error(Component::Sender, &e);
                    continue;
                }
                Err(e) => {
                    error!(worker = self.id, "send failed: {}", e);
                    self.status.error(Component::Sender, &e);
                    self.cancel.cancel();
                    break;
                }
            }
            let network = net_started.elapsed();
            let latency = captured.elapsed();
            metrics::histogram!("capture_to_send_us").record(latency.as_micros() as f64);
            self.stats.record(processing, network, latency);
        }

        info!(worker = self.id, "encode worker stopped");
    }
}
