use std::io;

use socket2::SockRef;
use tokio::net::{TcpStream, ToSocketAddrs};
use tracing::{debug, warn};

use crate::error::{RelayError, Result};
use crate::NetworkConfig;

/// Applies the configured TCP options to a connected stream.
///
/// Buffer sizes are hints; the kernel may round or clamp them, so a
/// failure there is logged and otherwise ignored.
pub fn tune_socket(stream: &TcpStream, config: &NetworkConfig) -> io::Result<()> {
    stream.set_nodelay(config.nodelay)?;

    let sock = SockRef::from(stream);
    sock.set_keepalive(config.keepalive)?;
    if let Err(e) = sock.set_send_buffer_size(config.send_buffer_bytes) {
        warn!("could not set send buffer to {}: {}", config.send_buffer_bytes, e);
    }
    if let Err(e) = sock.set_recv_buffer_size(config.recv_buffer_bytes) {
        warn!("could not set receive buffer to {}: {}", config.recv_buffer_bytes, e);
    }

    debug!(
        nodelay = config.nodelay,
        keepalive = config.keepalive,
        send_buffer = sock.send_buffer_size().unwrap_or_default(),
        recv_buffer = sock.recv_buffer_size().unwrap_or_default(),
        "socket tuned"
    );
    Ok(())
}

/// Connects within `limit`, then tunes the socket.
pub async fn connect(addr: impl ToSocketAddrs, config: &NetworkConfig) -> Result<TcpStream> {
    let limit = config.connect_timeout();
    let stream = tokio::time::timeout(limit, TcpStream::connect(addr))
        .await
        .map_err(|_| RelayError::Timeout {
            op: "connect",
            after: limit,
        })??;
    tune_socket(&stream, config)?;
    Ok(stream)
}

/// Parses `WIDTHxHEIGHT`, e.g. `1920x1080`.
pub fn parse_resolution(s: &str) -> Option<(u32, u32)> {
    let (w, h) = s.trim().split_once(['x', 'X'])?;
    let (w, h) = (w.trim().parse::<u32>().ok()?, h.trim().parse::<u32>().ok()?);
    (w > 0 && h > 0).then_some((w, h))
}
