//! Public client handle.

use crate::catalog::{CommandKind, CommandTable};
use crate::connection::{Connection, ConnectionState, Control};
use crate::events::{ClientEvent, EventBus, EventKind, ListenerId, Observable};
use crate::executor::{Completion, Invocation};
use crate::identity::{cached_identity, process_identity, HostIdentityProvider, IdentityProvider};
use crate::transport::{Transport, WebSocketTransport};
use crate::{CacheConfig, CacheError, CacheResult};
use cache_protocol_types::Value;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, info};

/// Reply to a submitted command.
///
/// The command is queued when the reply is created; dropping the reply does
/// not cancel it.
#[must_use = "the command runs regardless; await the reply to observe its outcome"]
pub struct PendingReply<T> {
    state: ReplyState<T>,
}

enum ReplyState<T> {
    Ready(Option<CacheResult<T>>),
    Waiting(oneshot::Receiver<CacheResult<T>>),
}

impl<T> PendingReply<T> {
    pub(crate) fn ready(result: CacheResult<T>) -> Self {
        Self {
            state: ReplyState::Ready(Some(result)),
        }
    }

    pub(crate) fn waiting(rx: oneshot::Receiver<CacheResult<T>>) -> Self {
        Self {
            state: ReplyState::Waiting(rx),
        }
    }
}

impl<T> Unpin for PendingReply<T> {}

impl<T> Future for PendingReply<T> {
    type Output = CacheResult<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.state {
            ReplyState::Ready(result) => Poll::Ready(result.take().unwrap_or(Err(CacheError::Closed))),
            // A dropped sender means the connection task is gone.
            ReplyState::Waiting(rx) => Pin::new(rx)
                .poll(cx)
                .map(|received| received.unwrap_or(Err(CacheError::Closed))),
        }
    }
}

struct ClientInner {
    control: mpsc::UnboundedSender<Control>,
    table: CommandTable,
    bus: EventBus,
    status: watch::Receiver<ConnectionState>,
    namespace: AtomicI64,
    config: Arc<CacheConfig>,
    identity: Arc<dyn IdentityProvider>,
}

/// Handle to one cache connection. Cheap to clone; the connection closes
/// when the last handle is dropped or [`CacheClient::close`] is called.
#[derive(Clone)]
pub struct CacheClient {
    inner: Arc<ClientInner>,
}

/// Builder for [`CacheClient`] with replaceable collaborators.
pub struct CacheClientBuilder {
    config: CacheConfig,
    transport: Option<Arc<dyn Transport>>,
    identity: Option<Arc<dyn IdentityProvider>>,
    table: Option<CommandTable>,
}

impl CacheClientBuilder {
    /// Use a custom transport instead of WebSocket.
    pub fn transport(mut self, transport: impl Transport) -> Self {
        self.transport = Some(Arc::new(transport));
        self
    }

    pub fn identity_provider(mut self, provider: impl IdentityProvider) -> Self {
        self.identity = Some(Arc::new(provider));
        self
    }

    /// Build the dispatch table from an external command catalog.
    pub fn catalog<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.table = Some(CommandTable::from_catalog(names));
        self
    }

    /// Validate the configuration and start the connection task.
    ///
    /// Must be called inside a Tokio runtime.
    pub fn build(self) -> CacheResult<CacheClient> {
        self.config.validate()?;
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
            CacheError::InvalidUsage("CacheClient must be built inside a Tokio runtime".to_string())
        })?;

        let config = Arc::new(self.config);
        let transport = self.transport.unwrap_or_else(|| {
            Arc::new(WebSocketTransport::new(config.timeout())) as Arc<dyn Transport>
        });
        let identity = self
            .identity
            .unwrap_or_else(|| Arc::new(HostIdentityProvider) as Arc<dyn IdentityProvider>);
        let table = self.table.unwrap_or_default();

        let bus = EventBus::new();
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(ConnectionState::Idle);
        let connection = Connection::new(
            config.clone(),
            transport,
            identity.clone(),
            bus.clone(),
            status_tx,
            control_rx,
        );
        runtime.spawn(connection.run());

        info!(
            url = %config.url,
            namespace = config.namespace,
            disabled = config.disabled,
            commands = table.len(),
            "Cache client created"
        );

        Ok(CacheClient {
            inner: Arc::new(ClientInner {
                control: control_tx,
                table,
                bus,
                status: status_rx,
                namespace: AtomicI64::new(config.namespace),
                config,
                identity,
            }),
        })
    }
}

impl CacheClient {
    pub fn builder(config: CacheConfig) -> CacheClientBuilder {
        CacheClientBuilder {
            config,
            transport: None,
            identity: None,
            table: None,
        }
    }

    /// Client over WebSocket with the host identity and built-in catalog.
    pub fn new(config: CacheConfig) -> CacheResult<Self> {
        Self::builder(config).build()
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    pub fn catalog(&self) -> &CommandTable {
        &self.inner.table
    }

    /// Issue any allow-listed command by name. Names are case-insensitive.
    ///
    /// Lock, batch and pub/sub commands have dedicated APIs and are refused
    /// here.
    pub fn command(&self, name: &str, args: Vec<Value>) -> PendingReply<Value> {
        match self.inner.table.resolve(name, &args) {
            Ok((action, CommandKind::Generic)) => self.submit_resolved(action, args, Ok),
            Ok((action, kind)) => PendingReply::ready(Err(CacheError::InvalidUsage(format!(
                "{} is a {:?} command; use its dedicated method",
                action, kind
            )))),
            Err(e) => PendingReply::ready(Err(e)),
        }
    }

    pub(crate) fn submit(&self, name: &str, args: Vec<Value>) -> PendingReply<Value> {
        self.submit_map(name, args, Ok)
    }

    /// Submit `name` after checking it against the catalog, converting the
    /// successful reply with `map` on the connection task. Refused names
    /// fail without a round trip.
    pub(crate) fn submit_map<T, F>(&self, name: &str, args: Vec<Value>, map: F) -> PendingReply<T>
    where
        T: Send + 'static,
        F: FnOnce(Value) -> CacheResult<T> + Send + 'static,
    {
        match self.inner.table.resolve(name, &args) {
            Ok((action, _)) => self.submit_resolved(action, args, map),
            Err(e) => {
                debug!(command = name, error = %e, "Command refused by catalog");
                PendingReply::ready(Err(e))
            }
        }
    }

    fn submit_resolved<T, F>(&self, action: String, args: Vec<Value>, map: F) -> PendingReply<T>
    where
        T: Send + 'static,
        F: FnOnce(Value) -> CacheResult<T> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.dispatch(
            action,
            args,
            Box::new(move |result| {
                let _ = tx.send(result.and_then(map));
            }),
        );
        PendingReply::waiting(rx)
    }

    /// Queue an already-resolved action.
    pub(crate) fn dispatch(&self, action: String, args: Vec<Value>, on_complete: Completion) {
        let invocation = Invocation::new(action, args, self.namespace(), on_complete);
        if let Err(mpsc::error::SendError(Control::Command(invocation))) =
            self.inner.control.send(Control::Command(invocation))
        {
            invocation.fail(CacheError::Closed);
        }
    }

    pub(crate) fn bus(&self) -> &EventBus {
        &self.inner.bus
    }

    pub fn get(&self, key: &str) -> PendingReply<Value> {
        self.submit("get", vec![key.into()])
    }

    pub fn set(&self, key: &str, value: impl Into<Value>) -> PendingReply<Value> {
        self.submit("set", vec![key.into(), value.into()])
    }

    pub fn setex(&self, key: &str, seconds: u64, value: impl Into<Value>) -> PendingReply<Value> {
        self.submit("setex", vec![key.into(), seconds.into(), value.into()])
    }

    /// Returns the number of keys removed.
    pub fn del(&self, keys: &[&str]) -> PendingReply<i64> {
        let args = keys.iter().map(|k| Value::from(*k)).collect();
        self.submit_map("del", args, expect_int)
    }

    pub fn exists(&self, key: &str) -> PendingReply<bool> {
        self.submit_map("exists", vec![key.into()], expect_flag)
    }

    pub fn expire(&self, key: &str, seconds: u64) -> PendingReply<bool> {
        self.submit_map("expire", vec![key.into(), seconds.into()], expect_flag)
    }

    pub fn ttl(&self, key: &str) -> PendingReply<i64> {
        self.submit_map("ttl", vec![key.into()], expect_int)
    }

    pub fn incr(&self, key: &str) -> PendingReply<i64> {
        self.submit_map("incr", vec![key.into()], expect_int)
    }

    pub fn decr(&self, key: &str) -> PendingReply<i64> {
        self.submit_map("decr", vec![key.into()], expect_int)
    }

    pub fn echo(&self, message: impl Into<Value>) -> PendingReply<Value> {
        self.submit("echo", vec![message.into()])
    }

    pub fn keys(&self, pattern: &str) -> PendingReply<Vec<String>> {
        self.submit_map("keys", vec![pattern.into()], expect_strings)
    }

    pub fn flushdb(&self) -> PendingReply<Value> {
        self.submit("flushdb", vec![])
    }

    pub fn hget(&self, key: &str, field: &str) -> PendingReply<Value> {
        self.submit("hget", vec![key.into(), field.into()])
    }

    pub fn hset(&self, key: &str, field: &str, value: impl Into<Value>) -> PendingReply<i64> {
        self.submit_map("hset", vec![key.into(), field.into(), value.into()], expect_int)
    }

    pub fn hgetall(&self, key: &str) -> PendingReply<Value> {
        self.submit("hgetall", vec![key.into()])
    }

    pub fn lpush(&self, key: &str, values: Vec<Value>) -> PendingReply<i64> {
        let mut args = vec![Value::from(key)];
        args.extend(values);
        self.submit_map("lpush", args, expect_int)
    }

    pub fn lrange(&self, key: &str, start: i64, stop: i64) -> PendingReply<Vec<Value>> {
        self.submit_map(
            "lrange",
            vec![key.into(), start.into(), stop.into()],
            expect_list,
        )
    }

    pub fn sadd(&self, key: &str, members: Vec<Value>) -> PendingReply<i64> {
        let mut args = vec![Value::from(key)];
        args.extend(members);
        self.submit_map("sadd", args, expect_int)
    }

    pub fn smembers(&self, key: &str) -> PendingReply<Vec<Value>> {
        self.submit_map("smembers", vec![key.into()], expect_list)
    }

    /// Returns the number of subscribers that received the message.
    pub fn publish(&self, channel: &str, message: impl Into<Value>) -> PendingReply<i64> {
        self.submit_map("publish", vec![channel.into(), message.into()], expect_int)
    }

    /// Run a server-side script: `EVAL script numkeys key... arg...`.
    pub fn eval(&self, script: &str, keys: &[&str], args: Vec<Value>) -> PendingReply<Value> {
        let mut call = vec![Value::from(script), Value::from(keys.len())];
        call.extend(keys.iter().map(|k| Value::from(*k)));
        call.extend(args);
        self.submit("eval", call)
    }

    /// Logical namespace for commands submitted from now on.
    pub fn set_namespace(&self, namespace: i64) {
        debug!(namespace, "Namespace changed");
        self.inner.namespace.store(namespace, Ordering::Relaxed);
    }

    pub fn namespace(&self) -> i64 {
        self.inner.namespace.load(Ordering::Relaxed)
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.status.borrow()
    }

    pub fn is_connected(&self) -> bool {
        matches!(
            self.state(),
            ConnectionState::Connected | ConnectionState::Authenticated
        )
    }

    pub fn is_authenticated(&self) -> bool {
        self.state() == ConnectionState::Authenticated
    }

    /// Wait until the client is authenticated. Fails if the client is
    /// disabled or closes first.
    pub async fn wait_ready(&self) -> CacheResult<()> {
        if self.inner.config.disabled {
            return Err(CacheError::Disabled);
        }
        let mut status = self.inner.status.clone();
        let state = *status
            .wait_for(|state| {
                matches!(
                    state,
                    ConnectionState::Authenticated
                        | ConnectionState::Disconnecting
                        | ConnectionState::Closed
                )
            })
            .await
            .map_err(|_| CacheError::Closed)?;
        match state {
            ConnectionState::Authenticated => Ok(()),
            _ => Err(CacheError::Closed),
        }
    }

    /// The device fingerprint sent with `authenticate`.
    pub async fn fingerprint(&self) -> String {
        process_identity(self.inner.identity.as_ref()).await.fingerprint
    }

    /// The fingerprint if it has already been resolved.
    pub fn cached_fingerprint(&self) -> Option<String> {
        cached_identity().map(|identity| identity.fingerprint)
    }

    /// Re-send registration, reconnecting first if needed.
    pub fn register(&self) {
        let _ = self.inner.control.send(Control::Register);
    }

    /// Close the connection and wait for teardown. Commands still queued
    /// when the close starts drain first if the client is authenticated.
    /// Calling this more than once is harmless.
    pub async fn close(&self) {
        let (done, rx) = oneshot::channel();
        if self.inner.control.send(Control::Close { done: Some(done) }).is_err() {
            return;
        }
        let _ = rx.await;
    }

    /// Alias for [`CacheClient::close`].
    pub async fn quit(&self) {
        self.close().await
    }

    /// Alias for [`CacheClient::close`].
    pub async fn end(&self) {
        self.close().await
    }

    /// Close gracefully, then terminate the process with `code` through
    /// [`crate::exit_guard::exit`].
    pub fn shutdown(&self, code: i32) {
        let _ = self.inner.control.send(Control::Shutdown { code });
    }
}

impl Observable for CacheClient {
    fn on<F>(&self, kind: EventKind, listener: F) -> ListenerId
    where
        F: Fn(&ClientEvent) + Send + Sync + 'static,
    {
        self.inner.bus.on(kind, Arc::new(listener))
    }

    fn off(&self, id: ListenerId) -> bool {
        self.inner.bus.off(id)
    }

    fn events(&self) -> broadcast::Receiver<ClientEvent> {
        self.inner.bus.subscribe()
    }
}

/// `Reply: <value>` or `Error: <message>`.
pub fn format_reply(result: &CacheResult<Value>) -> String {
    match result {
        Ok(value) => format!("Reply: {}", value),
        Err(e) => format!("Error: {}", e),
    }
}

/// Print a reply to stdout in the classic console format.
pub fn print(result: &CacheResult<Value>) {
    println!("{}", format_reply(result));
}

pub(crate) fn expect_int(value: Value) -> CacheResult<i64> {
    value
        .as_i64()
        .ok_or_else(|| CacheError::UnexpectedReply(format!("expected an integer, got {}", value)))
}

pub(crate) fn expect_flag(value: Value) -> CacheResult<bool> {
    if let Some(flag) = value.as_bool() {
        return Ok(flag);
    }
    expect_int(value).map(|n| n != 0)
}

pub(crate) fn expect_list(value: Value) -> CacheResult<Vec<Value>> {
    match value {
        Value::Array(items) => Ok(items),
        Value::Nil => Ok(Vec::new()),
        other => Err(CacheError::UnexpectedReply(format!(
            "expected a list, got {}",
            other
        ))),
    }
}

fn expect_strings(value: Value) -> CacheResult<Vec<String>> {
    expect_list(value)?
        .into_iter()
        .map(|item| {
            let shown = item.to_string();
            item.into_string()
                .ok_or_else(|| CacheError::UnexpectedReply(format!("expected a string, got {}", shown)))
        })
        .collect()
}
