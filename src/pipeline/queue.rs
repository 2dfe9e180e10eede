//! Bounded frame queue between a producer that cannot be stalled and a pool
//! of consumers.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam::utils::CachePadded;
use flume::{Receiver, RecvTimeoutError, Sender, TrySendError};

use crate::capture::Frame;

pub const DEFAULT_CAPACITY: usize = 3;

/// Outcome of [`BoundedFrameQueue::offer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Offer {
    Accepted,
    /// The queue was full and the offered (newest) frame was discarded.
    Dropped,
}

/// Fixed-capacity MPMC frame queue with a drop-newest policy.
///
/// `offer` never blocks. Consumers take frames in arrival order, but with
/// more than one consumer draining concurrently the order in which frames
/// *finish* processing is not guaranteed.
///
/// Cloning yields another handle onto the same queue.
#[derive(Clone)]
pub struct BoundedFrameQueue {
    tx: Sender<Frame>,
    rx: Receiver<Frame>,
    capacity: usize,
    stats: Arc<CachePadded<Stats>>,
}

#[derive(Default)]
struct Stats {
    offered: AtomicUsize,
    accepted: AtomicUsize,
    dropped: AtomicUsize,
    taken: AtomicUsize,
    high_water: AtomicUsize,
}

/// Point-in-time copy of the queue counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub offered: usize,
    pub accepted: usize,
    pub dropped: usize,
    pub taken: usize,
    pub len: usize,
    pub high_water: usize,
}

impl BoundedFrameQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = flume::bounded(capacity);
        Self {
            tx,
            rx,
            capacity,
            stats: Arc::new(CachePadded::new(Stats::default())),
        }
    }

    /// Producer: enqueue a frame, dropping it if the queue is full.
    pub fn offer(&self, frame: Frame) -> Offer {
        self.stats.offered.fetch_add(1, Ordering::Relaxed);

        match self.tx.try_send(frame) {
            Ok(()) => {
                self.stats.accepted.fetch_add(1, Ordering::Relaxed);
                self.stats.high_water.fetch_max(self.tx.len(), Ordering::Relaxed);
                Offer::Accepted
            }
            // We hold a receiver ourselves, so the channel cannot disconnect
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("frames_dropped").increment(1);
                Offer::Dropped
            }
        }
    }

    /// Consumer: wait for the oldest queued frame.
    pub async fn take(&self) -> Option<Frame> {
        let frame = self.rx.recv_async().await.ok()?;
        self.stats.taken.fetch_add(1, Ordering::Relaxed);
        Some(frame)
    }

    /// Blocking variant of [`take`](Self::take) for consumers on plain threads.
    pub fn take_timeout(&self, timeout: Duration) -> Option<Frame> {
        match self.rx.recv_timeout(timeout) {
            Ok(frame) => {
                self.stats.taken.fetch_add(1, Ordering::Relaxed);
                Some(frame)
            }
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    pub fn try_take(&self) -> Option<Frame> {
        let frame = self.rx.try_recv().ok()?;
        self.stats.taken.fetch_add(1, Ordering::Relaxed);
        Some(frame)
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            offered: self.stats.offered.load(Ordering::Relaxed),
            accepted: self.stats.accepted.load(Ordering::Relaxed),
            dropped: self.stats.dropped.load(Ordering::Relaxed),
            taken: self.stats.taken.load(Ordering::Relaxed),
            len: self.len(),
            high_water: self.stats.high_water.load(Ordering::Relaxed),
        }
    }

    /// Returns the high-water mark since the last call and resets it.
    pub fn reset_high_water(&self) -> usize {
        self.stats.high_water.swap(self.len(), Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::PixelFormat;

    fn frame(sequence: u64) -> Frame {
        Frame::new(vec![sequence as u8; 3], 1, 1, PixelFormat::Rgb24).with_sequence(sequence)
    }

    #[test]
    fn full_queue_drops_newest() {
        let queue = BoundedFrameQueue::new(3);
        let outcomes: Vec<Offer> = (1..=5).map(|i| queue.offer(frame(i))).collect();

        assert_eq!(
            outcomes,
            vec![
                Offer::Accepted,
                Offer::Accepted,
                Offer::Accepted,
                Offer::Dropped,
                Offer::Dropped
            ]
        );

        let stats = queue.stats();
        assert_eq!(stats.len, 3);
        assert_eq!(stats.dropped, 2);
        assert_eq!(stats.offered, 5);
        assert_eq!(stats.high_water, 3);

        // The retained frames are the oldest three, in arrival order
        let kept: Vec<u64> = std::iter::from_fn(|| queue.try_take())
            .map(|f| f.meta.sequence)
            .collect();
        assert_eq!(kept, vec![1, 2, 3]);
    }

    #[test]
    fn draining_makes_room_again() {
        let queue = BoundedFrameQueue::new(1);
        assert_eq!(queue.offer(frame(1)), Offer::Accepted);
        assert_eq!(queue.offer(frame(2)), Offer::Dropped);
        assert_eq!(queue.try_take().map(|f| f.meta.sequence), Some(1));
        assert_eq!(queue.offer(frame(3)), Offer::Accepted);
        assert_eq!(queue.stats().taken, 1);
    }

    #[test]
    fn zero_capacity_is_clamped() {
        let queue = BoundedFrameQueue::new(0);
        assert_eq!(queue.capacity(), 1);
        assert_eq!(queue.offer(frame(1)), Offer::Accepted);
    }

    #[test]
    fn take_timeout_returns_none_when_idle() {
        let queue = BoundedFrameQueue::new(2);
        assert!(queue.take_timeout(Duration::from_millis(10)).is_none());
    }

    #[test]
    fn reset_high_water_starts_from_current_len() {
        let queue = BoundedFrameQueue::new(3);
        queue.offer(frame(1));
        queue.offer(frame(2));
        queue.try_take();
        assert_eq!(queue.reset_high_water(), 2);
        assert_eq!(queue.stats().high_water, 1);
    }

    #[tokio::test]
    async fn clones_share_one_queue() {
        let producer = BoundedFrameQueue::new(3);
        let consumer = producer.clone();
        producer.offer(frame(9));
        let taken = consumer.take().await.unwrap();
        assert_eq!(taken.meta.sequence, 9);
        assert!(producer.is_empty());
    }
}
