//! Hand-off of received frames to a virtual camera consumer.

pub mod convert;
pub mod device;
pub mod publisher;
pub mod segment;
pub mod stage;

pub use convert::TargetLayout;
pub use device::{DeviceHandshake, DeviceHandshakeClient};
pub use publisher::{ChannelReader, FramePublisher};
pub use segment::SharedSegment;
pub use stage::{spawn_publish_stage, PublishSink};

/// Well-known shared memory object name.
pub const DEFAULT_SEGMENT: &str = "/vCamShm";
pub const FRAME_W: u32 = 1920;
pub const FRAME_H: u32 = 1080;
