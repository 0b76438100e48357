//! Duplex transport abstraction.
//!
//! A [`Transport`] opens sessions. Each [`TransportSession`] is a pair of
//! channels: [`Outbound`] messages from the client and [`Inbound`]
//! notifications from the peer. The connection actor owns at most one
//! session at a time and closes the old one before opening another.
//!
//! Dropping a session is the same as closing it.

mod websocket;

pub use websocket::WebSocketTransport;

use std::fmt;
use thiserror::Error;
use tokio::sync::mpsc;

/// Opens sessions to the cache service.
pub trait Transport: Send + Sync + 'static {
    /// Start connecting to `url`. The outcome arrives on the session as
    /// `Inbound::Connect` or `Inbound::ConnectError`.
    fn open(&self, url: &str) -> TransportSession;
}

/// Messages from the client to the peer.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Emit {
        event: String,
        args: Vec<serde_json::Value>,
    },
    Request {
        id: u64,
        event: String,
        payload: serde_json::Value,
    },
    Close,
}

/// Notifications from the peer to the client.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Connect,
    ConnectError(TransportError),
    Event {
        event: String,
        args: Vec<serde_json::Value>,
    },
    Ack {
        id: u64,
        error: Option<serde_json::Value>,
        response: Option<serde_json::Value>,
    },
    Disconnect {
        reason: DisconnectReason,
        message: Option<String>,
    },
}

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The service closed the session on purpose. Never retried.
    ServerDisconnect,
    ClientDisconnect,
    TransportClose,
    TransportError,
    PingTimeout,
    /// Credentials were rejected.
    Unauthorized,
    Other(String),
}

impl DisconnectReason {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "io server disconnect" => DisconnectReason::ServerDisconnect,
            "io client disconnect" => DisconnectReason::ClientDisconnect,
            "transport close" => DisconnectReason::TransportClose,
            "transport error" => DisconnectReason::TransportError,
            "ping timeout" => DisconnectReason::PingTimeout,
            "unauthorized" => DisconnectReason::Unauthorized,
            other => DisconnectReason::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            DisconnectReason::ServerDisconnect => "io server disconnect",
            DisconnectReason::ClientDisconnect => "io client disconnect",
            DisconnectReason::TransportClose => "transport close",
            DisconnectReason::TransportError => "transport error",
            DisconnectReason::PingTimeout => "ping timeout",
            DisconnectReason::Unauthorized => "unauthorized",
            DisconnectReason::Other(other) => other,
        }
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classification of transport failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    TimedOut,
    NotFound,
    ConnectionRefused,
    Closed,
    Other,
}

impl TransportErrorKind {
    /// Conventional error code for this kind.
    pub fn code(self) -> &'static str {
        match self {
            TransportErrorKind::TimedOut => "ETIMEDOUT",
            TransportErrorKind::NotFound => "ENOTFOUND",
            TransportErrorKind::ConnectionRefused => "ECONNREFUSED",
            TransportErrorKind::Closed => "EPIPE",
            TransportErrorKind::Other => "ETRANSPORT",
        }
    }
}

/// A classified transport failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message} ({})", .kind.code())]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn closed() -> Self {
        Self::new(TransportErrorKind::Closed, "session is closed")
    }

    pub fn code(&self) -> &'static str {
        self.kind.code()
    }

    /// Classify an I/O error. Resolver failures surface as generic I/O
    /// errors, so the message is inspected as well.
    pub fn from_io(err: &std::io::Error) -> Self {
        use std::io::ErrorKind;
        let message = err.to_string();
        let kind = match err.kind() {
            ErrorKind::TimedOut | ErrorKind::WouldBlock => TransportErrorKind::TimedOut,
            ErrorKind::ConnectionRefused => TransportErrorKind::ConnectionRefused,
            ErrorKind::NotFound => TransportErrorKind::NotFound,
            _ if is_resolver_failure(&message) => TransportErrorKind::NotFound,
            _ => TransportErrorKind::Other,
        };
        Self::new(kind, message)
    }
}

fn is_resolver_failure(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    lower.contains("failed to lookup address")
        || lower.contains("name or service not known")
        || lower.contains("nodename nor servname")
        || lower.contains("no such host")
}

/// The client side of one connection attempt.
#[derive(Debug)]
pub struct TransportSession {
    outbound: mpsc::UnboundedSender<Outbound>,
    inbound: mpsc::UnboundedReceiver<Inbound>,
}

/// The transport side of a session, handed to whatever drives the wire.
#[derive(Debug)]
pub struct SessionPeer {
    pub outbound: mpsc::UnboundedReceiver<Outbound>,
    pub inbound: mpsc::UnboundedSender<Inbound>,
}

impl TransportSession {
    /// Create a connected session/peer pair.
    pub fn pair() -> (TransportSession, SessionPeer) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        (
            TransportSession {
                outbound: outbound_tx,
                inbound: inbound_rx,
            },
            SessionPeer {
                outbound: outbound_rx,
                inbound: inbound_tx,
            },
        )
    }

    /// Send a fire-and-forget event.
    pub fn emit(&self, event: &str, args: Vec<serde_json::Value>) -> Result<(), TransportError> {
        self.send(Outbound::Emit {
            event: event.to_string(),
            args,
        })
    }

    /// Send an event that expects an `Inbound::Ack` with the same id.
    pub fn request(
        &self,
        id: u64,
        event: &str,
        payload: serde_json::Value,
    ) -> Result<(), TransportError> {
        self.send(Outbound::Request {
            id,
            event: event.to_string(),
            payload,
        })
    }

    /// Ask the peer to close. Consumes the session.
    pub fn close(self) {
        let _ = self.outbound.send(Outbound::Close);
    }

    /// Next notification, or `None` once the peer is gone.
    pub async fn recv(&mut self) -> Option<Inbound> {
        self.inbound.recv().await
    }

    fn send(&self, message: Outbound) -> Result<(), TransportError> {
        self.outbound
            .send(message)
            .map_err(|_| TransportError::closed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disconnect_reason_round_trip() {
        for raw in [
            "io server disconnect",
            "io client disconnect",
            "transport close",
            "transport error",
            "ping timeout",
            "unauthorized",
            "custom",
        ] {
            assert_eq!(DisconnectReason::parse(raw).as_str(), raw);
        }
        assert_eq!(
            DisconnectReason::parse("io server disconnect"),
            DisconnectReason::ServerDisconnect
        );
    }

    #[test]
    fn test_io_error_classification() {
        let refused = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        assert_eq!(TransportError::from_io(&refused).code(), "ECONNREFUSED");

        let timed_out = std::io::Error::new(std::io::ErrorKind::TimedOut, "slow");
        assert_eq!(TransportError::from_io(&timed_out).code(), "ETIMEDOUT");

        let dns = std::io::Error::new(
            std::io::ErrorKind::Other,
            "failed to lookup address information: Name or service not known",
        );
        assert_eq!(TransportError::from_io(&dns).code(), "ENOTFOUND");

        let other = std::io::Error::new(std::io::ErrorKind::Other, "boom");
        assert_eq!(TransportError::from_io(&other).kind, TransportErrorKind::Other);
    }

    #[test]
    fn test_transport_error_display_includes_code() {
        let err = TransportError::new(TransportErrorKind::TimedOut, "connect timed out");
        assert_eq!(err.to_string(), "connect timed out (ETIMEDOUT)");
    }

    #[tokio::test]
    async fn test_session_pair_delivers_both_ways() {
        let (mut session, mut peer) = TransportSession::pair();

        session.emit("ping", vec![]).unwrap();
        assert_eq!(
            peer.outbound.recv().await,
            Some(Outbound::Emit {
                event: "ping".into(),
                args: vec![]
            })
        );

        peer.inbound.send(Inbound::Connect).unwrap();
        assert_eq!(session.recv().await, Some(Inbound::Connect));

        drop(peer);
        assert_eq!(session.recv().await, None);
        assert!(session.emit("pong", vec![]).is_err());
    }
}
