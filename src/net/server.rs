//! Receiving end: accept loop plus one task per connection.

use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::AsyncRead;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::envelope::{read_envelope, PayloadKind};
use super::receiver::FrameReader;
use crate::capture::Frame;
use crate::error::{RelayError, Result};
use crate::pipeline::{BoundedFrameQueue, Offer, ThroughputMeter};
use crate::status::{Component, StatusReporter};
use crate::{utils, NetworkConfig, ReceiveMode, ReceiverConfig};

/// Totals for one finished connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionSummary {
    pub images: u64,
    pub bytes: u64,
    pub test_packets: u64,
    pub ignored: u64,
    pub rejected_lengths: u64,
}

/// Either decoding strategy behind one interface.
enum Incoming<R> {
    Resync(FrameReader<R>),
    Strict { reader: R, read_timeout: Duration },
}

impl<R: AsyncRead + Unpin> Incoming<R> {
    fn new(reader: R, mode: ReceiveMode, read_timeout: Duration) -> Self {
        match mode {
            ReceiveMode::Resync => Incoming::Resync(FrameReader::new(reader, read_timeout)),
            ReceiveMode::Strict => Incoming::Strict {
                reader,
                read_timeout,
            },
        }
    }

    async fn next_payload(&mut self) -> Result<Option<Bytes>> {
        match self {
            Incoming::Resync(reader) => reader.next_frame().await,
            Incoming::Strict {
                reader,
                read_timeout,
            } => read_envelope(reader, *read_timeout).await.map(Some),
        }
    }

    fn rejected_lengths(&self) -> u64 {
        match self {
            Incoming::Resync(reader) => reader.stats().rejected_lengths,
            Incoming::Strict { .. } => 0,
        }
    }
}

pub struct RelayServer {
    listener: TcpListener,
    network: NetworkConfig,
    receiver: ReceiverConfig,
    sink: Option<BoundedFrameQueue>,
    status: StatusReporter,
    cancel: CancellationToken,
}

impl RelayServer {
    pub async fn bind(
        addr: impl ToSocketAddrs,
        network: NetworkConfig,
        receiver: ReceiverConfig,
        status: StatusReporter,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            network,
            receiver,
            sink: None,
            status,
            cancel,
        })
    }

    /// Received images are offered to `queue`; without a sink they are
    /// only counted.
    pub fn with_sink(mut self, queue: BoundedFrameQueue) -> Self {
        self.sink = Some(queue);
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accepts connections until cancelled, then waits for the
    /// per-connection tasks to wind down.
    pub async fn run(self) -> Result<()> {
        let addr = self.local_addr()?;
        info!(%addr, mode = ?self.receiver.mode, "listening");
        self.status
            .info(Component::Server, format!("listening on {addr}"));

        let mut connections = JoinSet::new();
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,

                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        self.status.info(Component::Server, format!("client connected: {peer}"));
                        let conn = Connection {
                            peer,
                            receiver: self.receiver.clone(),
                            read_timeout: self.network.read_timeout(),
                            sink: self.sink.clone(),
                            status: self.status.clone(),
                            cancel: self.cancel.child_token(),
                        };
                        if let Err(e) = utils::tune_socket(&stream, &self.network) {
                            warn!(%peer, "socket tuning failed: {}", e);
                        }
                        connections.spawn(conn.run(stream));
                    }
                    Err(e) => {
                        error!("accept failed: {}", e);
                        self.status.error(Component::Server, &e);
                        // Usually fd exhaustion; back off instead of spinning
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },

                Some(finished) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = finished {
                        error!("connection task panicked: {}", e);
                    }
                }
            }
        }

        info!(active = connections.len(), "server stopping");
        while connections.join_next().await.is_some() {}
        Ok(())
    }
}

struct Connection {
    peer: SocketAddr,
    receiver: ReceiverConfig,
    read_timeout: Duration,
    sink: Option<BoundedFrameQueue>,
    status: StatusReporter,
    cancel: CancellationToken,
}

impl Connection {
    async fn run(self, stream: TcpStream) {
        let peer = self.peer;
        let status = self.status.clone();
        match self.receive(stream).await {
            Ok(summary) => {
                info!(%peer, ?summary, "client disconnected");
                status.info(Component::Receiver, format!("client disconnected: {peer}"));
            }
            Err(RelayError::ConnectionClosed) => {
                info!(%peer, "client closed connection");
                status.info(Component::Receiver, format!("client disconnected: {peer}"));
            }
            Err(e) => {
                warn!(%peer, "connection dropped: {}", e);
                status.error(Component::Receiver, format!("{peer}: {e}"));
            }
        }
    }

    #[instrument(skip_all, fields(peer = %self.peer))]
    async fn receive<R: AsyncRead + Unpin>(&self, reader: R) -> Result<ConnectionSummary> {
        let mut incoming = Incoming::new(reader, self.receiver.mode, self.read_timeout);
        let mut meter = ThroughputMeter::new(self.receiver.stats_interval());
        let mut summary = ConnectionSummary::default();
        let mut sequence = 0u64;

        loop {
            let payload = tokio::select! {
                _ = self.cancel.cancelled() => break,
                next = incoming.next_payload() => match next? {
                    Some(payload) => payload,
                    None => break,
                },
            };

            match PayloadKind::classify(&payload) {
                PayloadKind::TestPacket => {
                    info!("test packet received");
                    summary.test_packets += 1;
                    self.status
                        .info(Component::Receiver, "connection test packet received");
                }
                PayloadKind::Short(len) => {
                    debug!(len, "ignoring short payload");
                    summary.ignored += 1;
                }
                PayloadKind::Image => {
                    sequence += 1;
                    summary.images += 1;
                    summary.bytes += payload.len() as u64;
                    metrics::counter!("frames_received").increment(1);

                    if let Some(rate) = meter.record(payload.len()) {
                        info!("fps: {:.1}, {:.1} KiB/s", rate.fps, rate.kib_per_sec);
                    }
                    if let Some(sink) = &self.sink {
                        let frame = Frame::jpeg(payload).with_sequence(sequence);
                        if sink.offer(frame) == Offer::Dropped {
                            debug!(sequence, "publisher busy, frame dropped");
                        }
                    }
                }
            }
        }

        summary.rejected_lengths = incoming.rejected_lengths();
        Ok(summary)
    }
}
