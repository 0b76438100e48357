//! Cache client error types.

use crate::transport::TransportError;
use regex::Regex;
use std::sync::OnceLock;
use thiserror::Error;

/// Cache client error type.
#[derive(Error, Debug)]
pub enum CacheError {
    /// Client constructed without a key
    #[error("missing key")]
    MissingKey,

    /// Client constructed without a secret
    #[error("missing secret")]
    MissingSecret,

    /// API misuse detected at call time
    #[error("invalid usage: {0}")]
    InvalidUsage(String),

    /// Command not in the allow-listed catalog
    #[error("unknown or disallowed command: {0}")]
    UnknownCommand(String),

    /// Failure reported by the service, message verbatim
    #[error("{0}")]
    Command(String),

    /// Transport-level failure
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// The service dropped the connection with a reason code
    #[error("Disconnected ({code}): {message}")]
    Disconnected { code: String, message: String },

    /// The service rejected our credentials
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// The connection went away while the command was in flight
    #[error("Connection lost before a reply arrived")]
    ConnectionLost,

    /// The client is closed
    #[error("Client is closed")]
    Closed,

    /// The client was configured as disabled
    #[error("Client is disabled")]
    Disabled,

    /// Operation on a lock whose TTL has elapsed
    #[error("Lock on \"{key}\" has expired")]
    LockExpired { key: String },

    /// Operation on a lock that was already released
    #[error("Lock on \"{key}\" was already released")]
    LockReleased { key: String },

    /// The whole batch failed, so this entry has no individual outcome
    #[error("Batch failed: {0}")]
    Batch(String),

    /// Close did not complete before the fallback timer
    #[error("Timed out waiting for the connection to close")]
    CloseTimeout,

    /// Device identity could not be resolved
    #[error("Identity error: {0}")]
    Identity(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Reply did not have the expected shape
    #[error("Unexpected reply: {0}")]
    UnexpectedReply(String),

    /// Payload could not be decoded
    #[error("Marshal error: {0}")]
    Marshal(#[from] cache_protocol_types::MarshalError),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// URL parsing error
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
}

fn lock_contention_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"Exceeded \d+ attempts to lock the resource").ok())
        .as_ref()
}

impl CacheError {
    /// Short machine-readable code, where one exists.
    pub fn code(&self) -> Option<&str> {
        match self {
            CacheError::Transport(e) => Some(e.code()),
            CacheError::Disconnected { code, .. } => Some(code),
            CacheError::Authentication(_) => Some("unauthorized"),
            CacheError::CloseTimeout => Some("ECLOSETIMEOUT"),
            CacheError::ConnectionLost => Some("ECONNRESET"),
            _ => None,
        }
    }

    /// Whether the service refused a lock because it is held elsewhere.
    pub fn is_lock_contention(&self) -> bool {
        match self {
            CacheError::Command(message) => {
                lock_contention_pattern().is_some_and(|re| re.is_match(message))
            }
            _ => false,
        }
    }

    /// Whether retrying the same call later could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CacheError::Transport(_) | CacheError::ConnectionLost | CacheError::Disconnected { .. }
        ) || self.is_lock_contention()
    }
}

/// Result type alias using CacheError.
pub type CacheResult<T> = Result<T, CacheError>;
