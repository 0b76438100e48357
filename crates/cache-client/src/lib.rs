//! Cache client: Redis-style commands over one authenticated duplex
//! connection to the remote cache service.
//!
//! Every command travels over a single persistent session that connects,
//! authenticates and reconnects on its own. Callers never see the session;
//! they submit commands and await replies.
//!
//! # Core Invariants
//!
//! 1. **One In-Flight**: at most one command is on the wire at a time
//! 2. **FIFO**: commands run in submission order
//! 3. **No Replay**: a command interrupted by a lost connection fails
//!    with `ConnectionLost` instead of being sent again
//! 4. **Terminating Close**: close always reaches the closed state, by
//!    acknowledgement, watchdog, or forced fallback
//!
//! # Architecture
//!
//! ```text
//! CacheClient --control--> Connection actor --Transport--> service
//!      ^                     |  executor, timers, flags
//!      |_____ replies _______|  events -> listeners / streams
//! ```
//!
//! ```ignore
//! let client = CacheClient::new(CacheConfig::with_credentials(key, secret))?;
//! client.set("greeting", "hello").await?;
//! let value = client.get("greeting").await?;
//! client.close().await;
//! ```

mod catalog;
mod client;
mod config;
mod connection;
mod error;
mod events;
mod executor;
pub mod exit_guard;
mod identity;
mod lock;
mod logging;
mod multi;
mod pubsub;
pub mod transport;

pub use cache_protocol_types::Value;
pub use catalog::{CommandKind, CommandTable, BUILTIN_COMMANDS, DENY_LIST};
pub use client::{format_reply, print, CacheClient, CacheClientBuilder, PendingReply};
pub use config::{
    CacheConfig, Environment, ShutdownPolicy, DEFAULT_LOG_LEVEL, PREPRODUCTION_URL, PRODUCTION_URL,
};
pub use connection::ConnectionState;
pub use error::{CacheError, CacheResult};
pub use events::{ClientEvent, ErrorEvent, EventKind, ListenerId, Listener, Observable};
pub use identity::{
    cached_identity, fingerprint_for, process_identity, sign_key, HostIdentityProvider, Identity,
    IdentityFuture, IdentityProvider, StaticIdentityProvider,
};
pub use lock::{LockHandle, UnlockOutcome};
pub use logging::{init_logging, parse_level, LogConfig, LogFormat};
pub use multi::{EntryCallback, Multi};
pub use pubsub::{PubSubMessage, Subscription};
pub use transport::{
    DisconnectReason, Inbound, Outbound, SessionPeer, Transport, TransportError,
    TransportErrorKind, TransportSession, WebSocketTransport,
};
