pub mod codec;
pub mod frame;
pub mod pattern;
pub mod source;

pub use codec::{ImageCodec, JpegCodec};
pub use frame::{Frame, FrameMetadata, PixelFormat};
pub use pattern::TestPattern;
pub use source::{spawn_capture, FrameSource};
