//! Status reporting as explicit values.
//!
//! Components never call back into listeners. They push a tagged
//! [`StatusEvent`] into a bounded channel and the orchestration layer decides
//! whether to log, retry or abort.

use std::fmt;

use flume::{Receiver, Sender, TrySendError};
use tracing::{error, info, trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusLevel {
    Info,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Component {
    Capture,
    Encoder,
    Sender,
    Server,
    Receiver,
    Publisher,
    Device,
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Component::Capture => "capture",
            Component::Encoder => "encoder",
            Component::Sender => "sender",
            Component::Server => "server",
            Component::Receiver => "receiver",
            Component::Publisher => "publisher",
            Component::Device => "device",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEvent {
    pub level: StatusLevel,
    pub component: Component,
    pub message: String,
}

/// Cloneable producer half of the status channel.
///
/// Reporting never blocks: when the channel is full the event is dropped.
#[derive(Debug, Clone)]
pub struct StatusReporter {
    tx: Sender<StatusEvent>,
}

pub fn channel(capacity: usize) -> (StatusReporter, Receiver<StatusEvent>) {
    let (tx, rx) = flume::bounded(capacity);
    (StatusReporter { tx }, rx)
}

impl StatusReporter {
    pub fn info(&self, component: Component, message: impl Into<String>) {
        self.emit(StatusLevel::Info, component, message.into());
    }

    pub fn error(&self, component: Component, err: impl fmt::Display) {
        self.emit(StatusLevel::Error, component, err.to_string());
    }

    fn emit(&self, level: StatusLevel, component: Component, message: String) {
        let event = StatusEvent {
            level,
            component,
            message,
        };
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                trace!(?event, "status channel full, event dropped");
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
    }
}

/// Drains the status channel into the log until every reporter is gone.
pub async fn log_events(rx: Receiver<StatusEvent>) {
    while let Ok(event) = rx.recv_async().await {
        match event.level {
            StatusLevel::Info => info!(component = %event.component, "{}", event.message),
            StatusLevel::Error => error!(component = %event.component, "{}", event.message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_are_tagged() {
        let (status, rx) = channel(8);
        status.info(Component::Server, "listening");
        status.error(Component::Receiver, "end marker mismatch");

        let first = rx.try_recv().unwrap();
        assert_eq!(first.level, StatusLevel::Info);
        assert_eq!(first.component, Component::Server);
        assert_eq!(first.message, "listening");

        let second = rx.try_recv().unwrap();
        assert_eq!(second.level, StatusLevel::Error);
        assert_eq!(second.component, Component::Receiver);
    }

    #[test]
    fn full_channel_drops_instead_of_blocking() {
        let (status, rx) = channel(1);
        status.info(Component::Sender, "one");
        status.info(Component::Sender, "two");
        assert_eq!(rx.len(), 1);
        assert_eq!(rx.try_recv().unwrap().message, "one");
    }

    #[test]
    fn reporting_after_receiver_drop_is_silent() {
        let (status, rx) = channel(1);
        drop(rx);
        status.error(Component::Device, "gone");
    }
}
