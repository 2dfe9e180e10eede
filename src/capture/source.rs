//! Frame sources and the capture thread that drives them.

use std::io;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::capture::Frame;
use crate::error::Result;
use crate::pipeline::queue::{BoundedFrameQueue, Offer};
use crate::status::{Component, StatusReporter};

/// Anything that produces frames on its own clock: a camera, a file
/// sequence, or the built-in test pattern.
pub trait FrameSource: Send {
    fn next_frame(&mut self) -> Result<Frame>;

    /// Time between two frames at the source's nominal rate.
    fn frame_interval(&self) -> Duration;
}

/// Runs `source` on a dedicated OS thread, offering every frame to `queue`.
///
/// The thread only ever calls the non-blocking [`BoundedFrameQueue::offer`],
/// so network or publishing stalls can never hold up capture.
pub fn spawn_capture(
    mut source: Box<dyn FrameSource>,
    queue: BoundedFrameQueue,
    cancel: CancellationToken,
    status: StatusReporter,
) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("capture".into())
        .spawn(move || {
            let interval = source.frame_interval();
            info!(?interval, "capture thread started");

            let mut deadline = Instant::now();
            while !cancel.is_cancelled() {
                match source.next_frame() {
                    Ok(frame) => {
                        let sequence = frame.meta.sequence;
                        if queue.offer(frame) == Offer::Dropped {
                            debug!(sequence, "queue full, frame dropped");
                        }
                    }
                    Err(e) => {
                        warn!("capture error: {}", e);
                        status.error(Component::Capture, &e);
                    }
                }

                deadline += interval;
                let now = Instant::now();
                if deadline > now {
                    thread::sleep(deadline - now);
                } else {
                    // Running behind, do not try to catch up with a burst
                    deadline = now;
                }
            }

            info!("capture thread stopped");
        })
}
