//! Wire protocol and TCP endpoints.

pub mod envelope;
pub mod receiver;
pub mod sender;
pub mod server;

pub use envelope::{PayloadKind, MAX_FRAME_BYTES, TEST_PACKET};
pub use receiver::{FrameReader, StreamReceiver};
pub use sender::StreamSender;
pub use server::RelayServer;
