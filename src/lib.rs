pub mod capture;
pub mod error;
pub mod net;
pub mod pipeline;
pub mod publish;
pub mod status;
pub mod utils;

use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Environment, File};
use serde::{Deserialize, Serialize};

pub use error::{RelayError, Result};

/// Relay configuration
///
/// Every field has a default, so an empty file is valid.
/// Values can be overridden from the environment as
/// `CAMRELAY__<SECTION>__<KEY>`, e.g. `CAMRELAY__NETWORK__LISTEN=0.0.0.0:9000`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub network: NetworkConfig,
    pub sender: SenderConfig,
    pub receiver: ReceiverConfig,
    pub publisher: PublisherConfig,
    pub device: DeviceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub listen: String,
    pub read_timeout_ms: u64,
    pub write_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub nodelay: bool,
    pub keepalive: bool,
    pub send_buffer_bytes: usize,
    pub recv_buffer_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SenderConfig {
    pub queue_capacity: usize,
    pub workers: usize,
    pub jpeg_quality: u8,
    /// Clockwise degrees: 0, 90, 180 or 270
    pub rotation: u16,
    pub test_packet_pause_ms: u64,
    pub stats_interval_ms: u64,
    pub capture_width: u32,
    pub capture_height: u32,
    pub capture_fps: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReceiveMode {
    /// Scan for start markers and skip garbage
    Resync,
    /// Any framing error ends the connection
    Strict,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReceiverConfig {
    pub mode: ReceiveMode,
    pub stats_interval_ms: u64,
    /// Frames waiting for the publisher before new ones are dropped
    pub publish_queue: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PublisherConfig {
    pub segment_name: String,
    /// Map a regular file instead of a POSIX shm object
    pub segment_path: Option<PathBuf>,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub address: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8888".into(),
            read_timeout_ms: 10_000,
            write_timeout_ms: 5_000,
            connect_timeout_ms: 5_000,
            nodelay: true,
            keepalive: true,
            send_buffer_bytes: 2 * 1024 * 1024,
            recv_buffer_bytes: 1024 * 1024,
        }
    }
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            queue_capacity: pipeline::queue::DEFAULT_CAPACITY,
            workers: 2,
            jpeg_quality: 40,
            rotation: 0,
            test_packet_pause_ms: 500,
            stats_interval_ms: 5_000,
            capture_width: 640,
            capture_height: 480,
            capture_fps: 30,
        }
    }
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            mode: ReceiveMode::Resync,
            stats_interval_ms: 5_000,
            publish_queue: 2,
        }
    }
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            segment_name: publish::DEFAULT_SEGMENT.into(),
            segment_path: None,
            width: publish::FRAME_W,
            height: publish::FRAME_H,
        }
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:9090".into(),
        }
    }
}

impl NetworkConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

impl SenderConfig {
    pub fn test_packet_pause(&self) -> Duration {
        Duration::from_millis(self.test_packet_pause_ms)
    }

    pub fn stats_interval(&self) -> Duration {
        Duration::from_millis(self.stats_interval_ms)
    }

    pub fn worker_config(&self) -> pipeline::WorkerConfig {
        pipeline::WorkerConfig {
            workers: self.workers,
            jpeg_quality: self.jpeg_quality,
            rotation: self.rotation,
        }
    }
}

impl ReceiverConfig {
    pub fn stats_interval(&self) -> Duration {
        Duration::from_millis(self.stats_interval_ms)
    }
}

impl RelayConfig {
    /// Loads defaults, then `path` if given, then the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path));
        }
        let config: RelayConfig = builder
            .add_source(
                Environment::with_prefix("CAMRELAY")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| -> Result<()> { Err(RelayError::InvalidConfig(msg)) };

        let net = &self.network;
        if net.read_timeout_ms == 0 || net.write_timeout_ms == 0 || net.connect_timeout_ms == 0 {
            return invalid("network timeouts must be non-zero".into());
        }

        let sender = &self.sender;
        if sender.queue_capacity == 0 || sender.workers == 0 {
            return invalid("sender queue_capacity and workers must be at least 1".into());
        }
        if !(1..=100).contains(&sender.jpeg_quality) {
            return invalid(format!("jpeg_quality {} outside 1..=100", sender.jpeg_quality));
        }
        if sender.rotation % 90 != 0 || sender.rotation >= 360 {
            return invalid(format!("rotation {} is not one of 0/90/180/270", sender.rotation));
        }
        if sender.capture_width == 0 || sender.capture_height == 0 || sender.capture_fps == 0 {
            return invalid("capture geometry and fps must be non-zero".into());
        }

        if self.receiver.publish_queue == 0 {
            return invalid("receiver publish_queue must be at least 1".into());
        }

        let publisher = &self.publisher;
        if publisher.width == 0 || publisher.height == 0 {
            return invalid("publisher geometry must be non-zero".into());
        }
        if publisher.segment_path.is_none() && !publisher.segment_name.starts_with('/') {
            return invalid(format!(
                "segment_name {:?} must start with '/'",
                publisher.segment_name
            ));
        }

        Ok(())
    }
}
