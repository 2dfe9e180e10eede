pub mod queue;
pub mod stats;
pub mod workers;

pub use queue::{BoundedFrameQueue, Offer, QueueStats};
pub use stats::{PipelineStats, ThroughputMeter};
pub use workers::{spawn_workers, WorkerConfig};
