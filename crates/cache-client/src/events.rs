//! Client events and the observable contract.

use crate::CacheError;
use cache_protocol_types::Value;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Error payload carried by `Error` and `ConnectError` events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorEvent {
    pub code: Option<String>,
    pub message: String,
}

impl From<&CacheError> for ErrorEvent {
    fn from(err: &CacheError) -> Self {
        Self {
            code: err.code().map(str::to_string),
            message: err.to_string(),
        }
    }
}

/// Events emitted by a client.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// A transport session connected.
    Connect,
    /// A connection attempt failed.
    ConnectError(ErrorEvent),
    Error(ErrorEvent),
    /// Pub/sub message on a subscribed channel.
    Message { channel: String, data: Value },
    /// Pub/sub message matched by a pattern subscription.
    PMessage {
        pattern: String,
        channel: String,
        data: Value,
    },
    /// Authenticated; commands flow.
    Ready,
    /// The last queued command completed.
    Idle,
    /// Registration was sent to the service.
    Register,
    /// A deferred disconnect is being processed.
    Disconnecting,
    Close,
    /// Always follows `Close`.
    End,
}

/// Discriminant of [`ClientEvent`], used to filter listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Connect,
    ConnectError,
    Error,
    Message,
    PMessage,
    Ready,
    Idle,
    Register,
    Disconnecting,
    Close,
    End,
}

impl ClientEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            ClientEvent::Connect => EventKind::Connect,
            ClientEvent::ConnectError(_) => EventKind::ConnectError,
            ClientEvent::Error(_) => EventKind::Error,
            ClientEvent::Message { .. } => EventKind::Message,
            ClientEvent::PMessage { .. } => EventKind::PMessage,
            ClientEvent::Ready => EventKind::Ready,
            ClientEvent::Idle => EventKind::Idle,
            ClientEvent::Register => EventKind::Register,
            ClientEvent::Disconnecting => EventKind::Disconnecting,
            ClientEvent::Close => EventKind::Close,
            ClientEvent::End => EventKind::End,
        }
    }
}

impl EventKind {
    /// Wire-style event name.
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Connect => "connect",
            EventKind::ConnectError => "connect_error",
            EventKind::Error => "error",
            EventKind::Message => "message",
            EventKind::PMessage => "pmessage",
            EventKind::Ready => "ready",
            EventKind::Idle => "idle",
            EventKind::Register => "register",
            EventKind::Disconnecting => "disconnecting",
            EventKind::Close => "close",
            EventKind::End => "end",
        }
    }
}

/// Handle returned by [`Observable::on`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Listener callback. Runs on the connection task, so it must not block.
pub type Listener = Arc<dyn Fn(&ClientEvent) + Send + Sync>;

/// Subscribe to client events by kind, or as a stream.
pub trait Observable {
    /// Register `listener` for events of `kind`.
    fn on<F>(&self, kind: EventKind, listener: F) -> ListenerId
    where
        F: Fn(&ClientEvent) + Send + Sync + 'static;

    /// Remove a listener. Returns whether it was registered.
    fn off(&self, id: ListenerId) -> bool;

    /// Stream of every event emitted after this call.
    fn events(&self) -> broadcast::Receiver<ClientEvent>;
}

const EVENT_CHANNEL_CAPACITY: usize = 256;

struct Registered {
    id: ListenerId,
    kind: EventKind,
    listener: Listener,
}

struct BusInner {
    listeners: Mutex<Vec<Registered>>,
    next_id: AtomicU64,
    tx: broadcast::Sender<ClientEvent>,
}

/// Fan-out of client events to listeners and stream subscribers.
#[derive(Clone)]
pub(crate) struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    pub(crate) fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(BusInner {
                listeners: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
                tx,
            }),
        }
    }

    pub(crate) fn on(&self, kind: EventKind, listener: Listener) -> ListenerId {
        let id = ListenerId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        self.inner.listeners.lock().push(Registered { id, kind, listener });
        id
    }

    pub(crate) fn off(&self, id: ListenerId) -> bool {
        let mut listeners = self.inner.listeners.lock();
        let before = listeners.len();
        listeners.retain(|r| r.id != id);
        listeners.len() != before
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.inner.tx.subscribe()
    }

    /// Deliver to matching listeners, then to stream subscribers.
    /// Listeners are invoked outside the lock so they may call `off`.
    pub(crate) fn emit(&self, event: ClientEvent) {
        let kind = event.kind();
        let targets: Vec<Listener> = self
            .inner
            .listeners
            .lock()
            .iter()
            .filter(|r| r.kind == kind)
            .map(|r| r.listener.clone())
            .collect();
        for listener in targets {
            listener(&event);
        }
        let _ = self.inner.tx.send(event);
    }

    pub(crate) fn remove_all(&self) {
        self.inner.listeners.lock().clear();
    }
}
