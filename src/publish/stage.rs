//! Drains received frames into the configured sink.
//!
//! A sink failure disables publishing but never the network side: the
//! server keeps receiving, and frames offered to the (now undrained) queue
//! are simply dropped.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::device::DeviceHandshakeClient;
use super::publisher::FramePublisher;
use crate::capture::ImageCodec;
use crate::error::RelayError;
use crate::pipeline::BoundedFrameQueue;
use crate::status::{Component, StatusReporter};

const POLL: Duration = Duration::from_millis(100);

pub enum PublishSink<S = TcpStream> {
    Shared(FramePublisher),
    Device(DeviceHandshakeClient<S>),
    /// Frames are taken and dropped
    Discard,
}

pub fn spawn_publish_stage<S>(
    sink: PublishSink<S>,
    queue: BoundedFrameQueue,
    codec: Arc<dyn ImageCodec>,
    status: StatusReporter,
    cancel: CancellationToken,
) -> JoinHandle<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    match sink {
        PublishSink::Shared(publisher) => tokio::task::spawn_blocking(move || {
            run_shared(publisher, queue, status, cancel)
        }),
        PublishSink::Device(client) => {
            tokio::spawn(run_device(client, queue, codec, status, cancel))
        }
        PublishSink::Discard => tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    frame = queue.take() => {
                        if frame.is_none() {
                            break;
                        }
                    }
                }
            }
        }),
    }
}

/// Runs on a blocking thread: decode, convert and slot copy are all CPU
/// bound and the slot protocol has no await points.
fn run_shared(
    mut publisher: FramePublisher,
    queue: BoundedFrameQueue,
    status: StatusReporter,
    cancel: CancellationToken,
) {
    let (width, height) = publisher.geometry();
    info!(width, height, "publishing to shared segment");
    status.info(Component::Publisher, format!("publishing {width}x{height}"));

    while !cancel.is_cancelled() {
        let Some(frame) = queue.take_timeout(POLL) else {
            continue;
        };

        let started = Instant::now();
        match publisher.publish(&frame) {
            Ok(sequence) => {
                metrics::histogram!("publish_time_us").record(started.elapsed().as_micros() as f64);
                debug!(sequence, "published");
            }
            Err(RelayError::Codec(e)) => {
                warn!(sequence = frame.meta.sequence, "skipping undecodable frame: {}", e);
            }
            Err(e) => {
                error!("publishing disabled: {}", e);
                status.error(Component::Publisher, &e);
                return;
            }
        }
    }
    info!("publisher stopped");
}

async fn run_device<S>(
    mut client: DeviceHandshakeClient<S>,
    queue: BoundedFrameQueue,
    codec: Arc<dyn ImageCodec>,
    status: StatusReporter,
    cancel: CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let handshake = client.negotiated();
    status.info(
        Component::Device,
        format!("device negotiated {}x{}", handshake.width, handshake.height),
    );

    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = queue.take() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };

        let codec = codec.clone();
        let prepared = tokio::task::spawn_blocking(move || {
            let image = codec.decode(&frame)?;
            Ok::<_, RelayError>(handshake.prepare(&image)?)
        })
        .await;

        let message = match prepared {
            Ok(Ok(message)) => message,
            Ok(Err(e)) if !e.is_fatal() => {
                warn!("skipping frame: {}", e);
                continue;
            }
            Ok(Err(e)) => {
                error!("device output disabled: {}", e);
                status.error(Component::Device, &e);
                return;
            }
            Err(e) => {
                error!("device conversion panicked: {}", e);
                status.error(Component::Device, &e);
                return;
            }
        };

        if let Err(e) = client.send_prepared(&message).await {
            error!("device output disabled: {}", e);
            status.error(Component::Device, &e);
            return;
        }
    }
    info!(frames = client.frames_sent(), "device output stopped");
}
