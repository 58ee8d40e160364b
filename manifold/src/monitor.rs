//! Channel event monitoring.
//!
//! Provides event streams for tracking channel lifecycle events like
//! connections, accepted peers, and closures. Monitoring is optional:
//! builders attach a sender, consumers read the paired receiver.

use std::fmt;
use std::net::SocketAddr;

use crate::error::Cause;

/// Channel lifecycle events.
#[derive(Debug, Clone)]
pub enum SocketEvent {
    /// Outbound channel finished connecting (TCP established, or TLS
    /// handshake complete on secure channels).
    Connected(SocketAddr),

    /// Server accepted an inbound connection.
    Accepted(SocketAddr),

    /// Server socket bound and registered for accepts.
    Bound(SocketAddr),

    /// Channel closed, with the failure cause if it did not close
    /// cleanly.
    Closed {
        peer: Option<SocketAddr>,
        cause: Option<Cause>,
    },
}

impl fmt::Display for SocketEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connected(addr) => write!(f, "Connected to {addr}"),
            Self::Accepted(addr) => write!(f, "Accepted connection from {addr}"),
            Self::Bound(addr) => write!(f, "Bound to {addr}"),
            Self::Closed { peer: Some(addr), cause: None } => write!(f, "Closed {addr}"),
            Self::Closed { peer: Some(addr), cause: Some(cause) } => {
                write!(f, "Closed {addr}: {cause}")
            }
            Self::Closed { peer: None, cause: None } => write!(f, "Closed"),
            Self::Closed { peer: None, cause: Some(cause) } => write!(f, "Closed: {cause}"),
        }
    }
}

/// Handle for receiving channel events.
pub type SocketMonitor = flume::Receiver<SocketEvent>;

/// Sender half attached to a builder.
pub type SocketEventSender = flume::Sender<SocketEvent>;

/// Creates a new monitoring channel pair.
#[must_use]
pub fn create_monitor() -> (SocketEventSender, SocketMonitor) {
    flume::unbounded()
}

pub(crate) fn emit(sender: &Option<SocketEventSender>, event: SocketEvent) {
    if let Some(sender) = sender {
        let _ = sender.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_display() {
        let addr: SocketAddr = "127.0.0.1:5555".parse().unwrap();
        assert_eq!(
            SocketEvent::Connected(addr).to_string(),
            "Connected to 127.0.0.1:5555"
        );
        assert_eq!(
            SocketEvent::Closed { peer: Some(addr), cause: None }.to_string(),
            "Closed 127.0.0.1:5555"
        );
    }

    #[test]
    fn monitor_channel_delivers() {
        let (sender, receiver) = create_monitor();
        let addr: SocketAddr = "127.0.0.1:5555".parse().unwrap();
        sender.send(SocketEvent::Accepted(addr)).unwrap();
        assert!(matches!(receiver.recv().unwrap(), SocketEvent::Accepted(_)));
    }
}
