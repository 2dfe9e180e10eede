//! camrelay: relay camera frames over TCP into a virtual camera.
//!
//! ```text
//! camrelay serve                      Receive frames, publish to /vCamShm
//! camrelay serve --sink device        Receive frames, push to a device consumer
//! camrelay send <host:port>           Stream the test pattern to a receiver
//! camrelay probe [host:port]          Print a device consumer's geometry
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use color_eyre::{eyre::eyre, Result};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use camrelay::capture::{spawn_capture, JpegCodec, TestPattern};
use camrelay::net::{RelayServer, StreamSender};
use camrelay::pipeline::stats::spawn_stats_logger;
use camrelay::pipeline::{spawn_workers, BoundedFrameQueue, PipelineStats};
use camrelay::publish::{spawn_publish_stage, DeviceHandshakeClient, FramePublisher, PublishSink};
use camrelay::status::{self, Component, StatusReporter};
use camrelay::{utils, ReceiveMode, RelayConfig};

// ── CLI ──────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "camrelay", version, about = "Relay camera frames to a virtual camera")]
struct Cli {
    /// Configuration TOML file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Accept senders and publish the frames they stream.
    Serve {
        /// Listen address, overrides `network.listen`.
        #[arg(long)]
        listen: Option<String>,

        #[arg(long, value_enum, default_value_t = SinkKind::Shared)]
        sink: SinkKind,

        /// Drop the connection on any framing error instead of resyncing.
        #[arg(long)]
        strict: bool,
    },

    /// Stream the built-in test pattern to a receiver.
    Send {
        addr: String,

        /// Frame size as WIDTHxHEIGHT.
        #[arg(long, value_parser = parse_size)]
        size: Option<(u32, u32)>,

        #[arg(long)]
        fps: Option<u32>,
    },

    /// Connect to a device consumer and print the geometry it announces.
    Probe {
        /// Defaults to `device.address`.
        addr: Option<String>,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum SinkKind {
    /// Shared memory segment
    Shared,
    /// Device consumer over TCP
    Device,
    /// Receive only
    None,
}

fn parse_size(s: &str) -> std::result::Result<(u32, u32), String> {
    utils::parse_resolution(s).ok_or_else(|| format!("expected WIDTHxHEIGHT, got {s:?}"))
}

// ── Main ─────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("camrelay=info")),
        )
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    let cli = Cli::parse();
    let config = RelayConfig::load(cli.config.as_deref())?;

    let cancel = CancellationToken::new();
    let (status, events) = status::channel(64);
    tokio::spawn(status::log_events(events));

    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutdown requested");
                cancel.cancel();
            }
        }
    });

    match cli.command {
        Command::Serve {
            listen,
            sink,
            strict,
        } => {
            let mut config = config;
            if let Some(listen) = listen {
                config.network.listen = listen;
            }
            if strict {
                config.receiver.mode = ReceiveMode::Strict;
            }
            serve(config, sink, status, cancel).await
        }
        Command::Send { addr, size, fps } => {
            let mut config = config;
            if let Some((width, height)) = size {
                config.sender.capture_width = width;
                config.sender.capture_height = height;
            }
            if let Some(fps) = fps {
                config.sender.capture_fps = fps;
            }
            config.validate()?;
            send(&addr, config, status, cancel).await
        }
        Command::Probe { addr } => {
            let addr = addr.unwrap_or_else(|| config.device.address.clone());
            let client = DeviceHandshakeClient::connect(&addr, &config.network).await?;
            let hs = client.negotiated();
            println!(
                "{}x{} @ {} bpp ({} bytes/pixel)",
                hs.width, hs.height, hs.bits_per_pixel, hs.bytes_per_pixel
            );
            Ok(())
        }
    }
}

async fn serve(
    config: RelayConfig,
    sink: SinkKind,
    status: StatusReporter,
    cancel: CancellationToken,
) -> Result<()> {
    // Sink failures leave the receiver running with publishing disabled
    let sink: PublishSink = match sink {
        SinkKind::Shared => match FramePublisher::from_config(&config.publisher) {
            Ok(publisher) => PublishSink::Shared(publisher),
            Err(e) => {
                error!("shared segment unavailable: {}", e);
                status.error(Component::Publisher, &e);
                PublishSink::Discard
            }
        },
        SinkKind::Device => {
            match DeviceHandshakeClient::connect(&config.device.address, &config.network).await {
                Ok(client) => PublishSink::Device(client),
                Err(e) => {
                    error!("device consumer unavailable: {}", e);
                    status.error(Component::Device, &e);
                    PublishSink::Discard
                }
            }
        }
        SinkKind::None => PublishSink::Discard,
    };

    let mut server = RelayServer::bind(
        config.network.listen.as_str(),
        config.network.clone(),
        config.receiver.clone(),
        status.clone(),
        cancel.clone(),
    )
    .await?;

    let stage = if matches!(sink, PublishSink::Discard) {
        None
    } else {
        let queue = BoundedFrameQueue::new(config.receiver.publish_queue);
        server = server.with_sink(queue.clone());
        Some(spawn_publish_stage(
            sink,
            queue,
            Arc::new(JpegCodec),
            status,
            cancel.clone(),
        ))
    };

    server.run().await?;
    cancel.cancel();
    if let Some(stage) = stage {
        stage.await?;
    }
    info!("server stopped");
    Ok(())
}

async fn send(
    addr: &str,
    config: RelayConfig,
    status: StatusReporter,
    cancel: CancellationToken,
) -> Result<()> {
    let sender = Arc::new(StreamSender::connect(addr, &config.network).await?);
    status.info(Component::Sender, format!("connected to {addr}"));

    sender.send_test_packet().await?;
    tokio::time::sleep(config.sender.test_packet_pause()).await;

    let sc = &config.sender;
    let queue = BoundedFrameQueue::new(sc.queue_capacity);
    let stats = PipelineStats::new();

    let source = TestPattern::new(sc.capture_width, sc.capture_height, sc.capture_fps);
    let capture = spawn_capture(Box::new(source), queue.clone(), cancel.clone(), status.clone())?;

    let workers = spawn_workers(
        queue.clone(),
        sender.clone(),
        Arc::new(JpegCodec),
        sc.worker_config(),
        stats.clone(),
        status,
        cancel.clone(),
    );
    let logger = spawn_stats_logger(stats, queue, sc.stats_interval(), cancel.clone());

    // Workers run until Ctrl-C or the first send failure
    for worker in workers {
        worker.await?;
    }
    cancel.cancel();
    logger.await?;
    tokio::task::spawn_blocking(move || capture.join())
        .await?
        .map_err(|_| eyre!("capture thread panicked"))?;

    info!(
        frames = sender.frames_sent(),
        bytes = sender.bytes_sent(),
        "sender finished"
    );
    if !sender.is_poisoned() {
        sender.shutdown().await?;
    }
    Ok(())
}
