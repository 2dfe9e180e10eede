//! Periodic throughput statistics for both ends of the relay.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam::utils::CachePadded;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::queue::BoundedFrameQueue;

/// Counters updated by the encode workers.
#[derive(Default)]
pub struct PipelineStats {
    inner: CachePadded<Counters>,
}

#[derive(Default)]
struct Counters {
    frames: AtomicU64,
    processing_us: AtomicU64,
    network_us: AtomicU64,
    latency_us: AtomicU64,
}

/// Averages over one reporting window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PipelineReport {
    pub frames: u64,
    pub fps: f64,
    pub avg_processing_ms: f64,
    pub avg_network_ms: f64,
    /// Capture to end of send
    pub avg_latency_ms: f64,
}

impl PipelineStats {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// `latency` runs from the frame's capture timestamp to the end of its send.
    pub fn record(&self, processing: Duration, network: Duration, latency: Duration) {
        self.inner.frames.fetch_add(1, Ordering::Relaxed);
        self.inner
            .processing_us
            .fetch_add(processing.as_micros() as u64, Ordering::Relaxed);
        self.inner
            .network_us
            .fetch_add(network.as_micros() as u64, Ordering::Relaxed);
        self.inner
            .latency_us
            .fetch_add(latency.as_micros() as u64, Ordering::Relaxed);
    }

    /// Drains the counters into a report covering `window`.
    pub fn take_report(&self, window: Duration) -> PipelineReport {
        let frames = self.inner.frames.swap(0, Ordering::Relaxed);
        let processing_us = self.inner.processing_us.swap(0, Ordering::Relaxed);
        let network_us = self.inner.network_us.swap(0, Ordering::Relaxed);
        let latency_us = self.inner.latency_us.swap(0, Ordering::Relaxed);

        let avg_ms = |total_us: u64| {
            if frames == 0 {
                0.0
            } else {
                total_us as f64 / frames as f64 / 1000.0
            }
        };
        let secs = window.as_secs_f64();

        PipelineReport {
            frames,
            fps: if secs > 0.0 { frames as f64 / secs } else { 0.0 },
            avg_processing_ms: avg_ms(processing_us),
            avg_network_ms: avg_ms(network_us),
            avg_latency_ms: avg_ms(latency_us),
        }
    }
}

/// Logs a [`PipelineReport`] plus queue pressure every `interval`.
pub fn spawn_stats_logger(
    stats: Arc<PipelineStats>,
    queue: BoundedFrameQueue,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // First tick completes immediately
        ticker.tick().await;
        let mut last = Instant::now();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let report = stats.take_report(last.elapsed());
            last = Instant::now();
            let queue_stats = queue.stats();
            info!(
                "fps: {:.1}, processing: {:.1}ms, network: {:.1}ms, latency: {:.1}ms, queue: {}/{} (peak {}), dropped: {}",
                report.fps,
                report.avg_processing_ms,
                report.avg_network_ms,
                report.avg_latency_ms,
                queue_stats.len,
                queue.capacity(),
                queue.reset_high_water(),
                queue_stats.dropped,
            );
        }
    })
}

/// Frame and byte rate of a single incoming connection.
pub struct ThroughputMeter {
    interval: Duration,
    window_start: Instant,
    frames: u64,
    bytes: u64,
    total_frames: u64,
    total_bytes: u64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Throughput {
    pub fps: f64,
    pub kib_per_sec: f64,
}

impl ThroughputMeter {
    pub fn new(interval: Duration) -> Self {
        Self::starting_at(interval, Instant::now())
    }

    fn starting_at(interval: Duration, now: Instant) -> Self {
        Self {
            interval,
            window_start: now,
            frames: 0,
            bytes: 0,
            total_frames: 0,
            total_bytes: 0,
        }
    }

    /// Records one frame; returns the window's rates once `interval` has passed.
    pub fn record(&mut self, bytes: usize) -> Option<Throughput> {
        self.record_at(bytes, Instant::now())
    }

    fn record_at(&mut self, bytes: usize, now: Instant) -> Option<Throughput> {
        self.frames += 1;
        self.bytes += bytes as u64;
        self.total_frames += 1;
        self.total_bytes += bytes as u64;

        let elapsed = now.saturating_duration_since(self.window_start);
        if elapsed < self.interval {
            return None;
        }

        let secs = elapsed.as_secs_f64();
        let rate = Throughput {
            fps: self.frames as f64 / secs,
            kib_per_sec: self.bytes as f64 / 1024.0 / secs,
        };
        self.window_start = now;
        self.frames = 0;
        self.bytes = 0;
        Some(rate)
    }

    pub fn total_frames(&self) -> u64 {
        self.total_frames
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_averages_and_resets() {
        let stats = PipelineStats::new();
        stats.record(
            Duration::from_millis(10),
            Duration::from_millis(2),
            Duration::from_millis(30),
        );
        stats.record(
            Duration::from_millis(20),
            Duration::from_millis(4),
            Duration::from_millis(50),
        );

        let report = stats.take_report(Duration::from_secs(2));
        assert_eq!(report.frames, 2);
        assert!((report.fps - 1.0).abs() < 1e-9);
        assert!((report.avg_processing_ms - 15.0).abs() < 1e-9);
        assert!((report.avg_network_ms - 3.0).abs() < 1e-9);
        assert!((report.avg_latency_ms - 40.0).abs() < 1e-9);

        let empty = stats.take_report(Duration::from_secs(1));
        assert_eq!(empty.frames, 0);
        assert_eq!(empty.avg_processing_ms, 0.0);
        assert_eq!(empty.avg_latency_ms, 0.0);
    }

    #[test]
    fn meter_reports_once_per_window() {
        let start = Instant::now();
        let mut meter = ThroughputMeter::starting_at(Duration::from_secs(1), start);

        assert!(meter.record_at(1024, start + Duration::from_millis(300)).is_none());
        assert!(meter.record_at(1024, start + Duration::from_millis(600)).is_none());
        let rate = meter
            .record_at(2048, start + Duration::from_secs(2))
            .unwrap();
        assert!((rate.fps - 1.5).abs() < 1e-9);
        assert!((rate.kib_per_sec - 2.0).abs() < 1e-9);

        // New window starts empty
        assert!(meter.record_at(1, start + Duration::from_millis(2500)).is_none());
        assert_eq!(meter.total_frames(), 4);
        assert_eq!(meter.total_bytes(), 4097);
    }
}
