//! Test harness for cache client integration tests.
//!
//! Provides:
//! - FakeServer: an in-memory cache service speaking the session protocol
//! - MemoryTransport: a `Transport` whose sessions are served by FakeServer
//!
//! All timing uses `tokio::time`, so tests run with a paused clock.

#![allow(dead_code)]

use cache_client::{
    CacheClient, CacheClientBuilder, CacheConfig, DisconnectReason, Identity, Inbound, Outbound,
    SessionPeer, StaticIdentityProvider, Transport, TransportError, TransportErrorKind,
    TransportSession, Value,
};
use cache_protocol_types::{
    actions, events, marshal, AuthRequest, BatchEntry, BatchReply, CommandRequest,
    CommandResponse, NetworkAddresses,
};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

pub const TEST_KEY: &str = "test-key";
pub const TEST_SECRET: &str = "test-secret";
pub const TEST_FINGERPRINT: &str = "fingerprint-under-test";

/// One command as the server saw it.
#[derive(Debug, Clone, PartialEq)]
pub struct ReceivedCommand {
    pub action: String,
    pub args: Vec<Value>,
    pub namespace: i64,
}

#[derive(Default)]
struct ServerState {
    refuse_first: usize,
    connect_delay: Duration,
    reply_delay: Duration,
    ack_delay: Duration,
    duplicate_connect: bool,
    reject_auth: bool,
    ignore_disconnecting: bool,

    connections: usize,
    next_session: u64,
    sessions: HashMap<u64, mpsc::UnboundedSender<Inbound>>,
    commands: Vec<ReceivedCommand>,
    auth_requests: Vec<AuthRequest>,
    registers: usize,
    pongs: usize,
    disconnect_notices: usize,

    store: HashMap<String, Value>,
    expiries: HashMap<String, Instant>,
    locks: HashMap<String, (String, Instant)>,
    next_token: u64,
    channels: HashSet<String>,
    patterns: HashSet<String>,
}

/// In-memory cache service.
#[derive(Clone, Default)]
pub struct FakeServer {
    state: Arc<Mutex<ServerState>>,
}

impl FakeServer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the first `n` connection attempts with ECONNREFUSED.
    pub fn refuse_first(self, n: usize) -> Self {
        self.state.lock().refuse_first = n;
        self
    }

    /// Delay every connection outcome.
    pub fn connect_delay(self, delay: Duration) -> Self {
        self.state.lock().connect_delay = delay;
        self
    }

    /// Delay every command reply.
    pub fn reply_delay(self, delay: Duration) -> Self {
        self.state.lock().reply_delay = delay;
        self
    }

    /// Delay every acknowledgement after the command has run.
    pub fn ack_delay(self, delay: Duration) -> Self {
        self.state.lock().ack_delay = delay;
        self
    }

    /// Announce every accepted session twice.
    pub fn duplicate_connect(self) -> Self {
        self.state.lock().duplicate_connect = true;
        self
    }

    /// Answer `authenticate` with an unauthorized disconnect.
    pub fn reject_auth(self) -> Self {
        self.state.lock().reject_auth = true;
        self
    }

    /// Never answer a client's `disconnecting` notice.
    pub fn ignore_disconnecting(self) -> Self {
        self.state.lock().ignore_disconnecting = true;
        self
    }

    pub fn set_reject_auth(&self, reject: bool) {
        self.state.lock().reject_auth = reject;
    }

    pub fn transport(&self) -> MemoryTransport {
        MemoryTransport {
            server: self.clone(),
        }
    }

    pub fn config(&self) -> CacheConfig {
        CacheConfig {
            url: "http://cache.test".to_string(),
            ..CacheConfig::with_credentials(TEST_KEY, TEST_SECRET)
        }
    }

    /// Client wired to this server with a fixed identity.
    pub fn client(&self) -> CacheClient {
        self.client_with(self.config())
    }

    pub fn client_with(&self, config: CacheConfig) -> CacheClient {
        self.builder(config).build().unwrap()
    }

    /// Client whose dispatch table only knows `names`.
    pub fn client_with_catalog(&self, names: &[&str]) -> CacheClient {
        self.builder(self.config())
            .catalog(names.iter().copied())
            .build()
            .unwrap()
    }

    /// Builder wired to this server with a fixed identity.
    pub fn builder(&self, config: CacheConfig) -> CacheClientBuilder {
        CacheClient::builder(config)
            .transport(self.transport())
            .identity_provider(StaticIdentityProvider::new(Identity {
                fingerprint: TEST_FINGERPRINT.to_string(),
                addresses: NetworkAddresses::loopback(),
            }))
    }

    pub fn connections(&self) -> usize {
        self.state.lock().connections
    }

    pub fn live_sessions(&self) -> usize {
        self.state.lock().sessions.len()
    }

    pub fn commands(&self) -> Vec<ReceivedCommand> {
        self.state.lock().commands.clone()
    }

    pub fn actions(&self) -> Vec<String> {
        self.state
            .lock()
            .commands
            .iter()
            .map(|c| c.action.clone())
            .collect()
    }

    pub fn auth_requests(&self) -> Vec<AuthRequest> {
        self.state.lock().auth_requests.clone()
    }

    pub fn registers(&self) -> usize {
        self.state.lock().registers
    }

    pub fn pongs(&self) -> usize {
        self.state.lock().pongs
    }

    pub fn disconnect_notices(&self) -> usize {
        self.state.lock().disconnect_notices
    }

    pub fn stored(&self, key: &str) -> Option<Value> {
        self.state.lock().store.get(key).cloned()
    }

    /// Drop every live session with `reason`.
    pub fn kick(&self, reason: DisconnectReason) {
        let sessions: Vec<_> = self.state.lock().sessions.drain().collect();
        for (_, inbound) in sessions {
            let _ = inbound.send(Inbound::Disconnect {
                reason: reason.clone(),
                message: None,
            });
        }
    }

    /// Send `ping` to every live session.
    pub fn ping(&self) {
        self.broadcast(events::PING, vec![]);
    }

    /// Ask every live session to disconnect with `reason`.
    pub fn request_disconnect(&self, reason: &str) {
        self.broadcast(events::DISCONNECTING, vec![serde_json::json!(reason)]);
    }

    fn broadcast(&self, event: &str, args: Vec<serde_json::Value>) {
        let senders: Vec<_> = self.state.lock().sessions.values().cloned().collect();
        for inbound in senders {
            let _ = inbound.send(Inbound::Event {
                event: event.to_string(),
                args: args.clone(),
            });
        }
    }

    async fn serve(self, mut peer: SessionPeer) {
        let (refuse, delay) = {
            let mut state = self.state.lock();
            state.connections += 1;
            (state.connections <= state.refuse_first, state.connect_delay)
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if refuse {
            let _ = peer.inbound.send(Inbound::ConnectError(TransportError::new(
                TransportErrorKind::ConnectionRefused,
                "connection refused",
            )));
            return;
        }
        if peer.inbound.send(Inbound::Connect).is_err() {
            return;
        }
        if self.state.lock().duplicate_connect {
            let _ = peer.inbound.send(Inbound::Connect);
        }

        let session_id = {
            let mut state = self.state.lock();
            state.next_session += 1;
            let id = state.next_session;
            state.sessions.insert(id, peer.inbound.clone());
            id
        };

        while let Some(message) = peer.outbound.recv().await {
            match message {
                Outbound::Close => break,
                Outbound::Emit { event, args } => {
                    if !self.on_event(session_id, &peer.inbound, &event, args) {
                        break;
                    }
                }
                Outbound::Request { id, event, payload } => {
                    let delay = self.state.lock().reply_delay;
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    // A kicked session never reaches the command.
                    if !self.state.lock().sessions.contains_key(&session_id) {
                        break;
                    }
                    let response = if event == events::COMMAND {
                        self.on_command(payload)
                    } else {
                        CommandResponse::failure(format!("unsupported request {}", event))
                    };
                    let delay = self.state.lock().ack_delay;
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    let _ = peer.inbound.send(Inbound::Ack {
                        id,
                        error: None,
                        response: response.to_json().ok(),
                    });
                }
            }
        }

        self.state.lock().sessions.remove(&session_id);
    }

    /// Returns false when the session should end.
    fn on_event(
        &self,
        session_id: u64,
        inbound: &mpsc::UnboundedSender<Inbound>,
        event: &str,
        args: Vec<serde_json::Value>,
    ) -> bool {
        match event {
            events::AUTHENTICATE => {
                let request = args
                    .into_iter()
                    .next()
                    .and_then(|json| AuthRequest::from_json(json).ok());
                let reject = {
                    let mut state = self.state.lock();
                    if let Some(request) = request {
                        state.auth_requests.push(request);
                    }
                    state.reject_auth
                };
                if reject {
                    self.state.lock().sessions.remove(&session_id);
                    let _ = inbound.send(Inbound::Disconnect {
                        reason: DisconnectReason::Unauthorized,
                        message: Some("invalid signature".to_string()),
                    });
                    return false;
                }
                let _ = inbound.send(Inbound::Event {
                    event: events::AUTHENTICATED.to_string(),
                    args: vec![],
                });
            }
            events::REGISTER => self.state.lock().registers += 1,
            events::PONG => self.state.lock().pongs += 1,
            events::DISCONNECTING => {
                let ignore = {
                    let mut state = self.state.lock();
                    state.disconnect_notices += 1;
                    state.ignore_disconnecting
                };
                if !ignore {
                    self.state.lock().sessions.remove(&session_id);
                    let _ = inbound.send(Inbound::Disconnect {
                        reason: DisconnectReason::ServerDisconnect,
                        message: None,
                    });
                    return false;
                }
            }
            _ => {}
        }
        true
    }

    fn on_command(&self, payload: serde_json::Value) -> CommandResponse {
        let request = match CommandRequest::from_json(payload) {
            Ok(request) => request,
            Err(e) => return CommandResponse::failure(e.to_string()),
        };
        let args = match request.decode_args() {
            Ok(args) => args,
            Err(e) => return CommandResponse::failure(e.to_string()),
        };
        self.state.lock().commands.push(ReceivedCommand {
            action: request.action.clone(),
            args: args.clone(),
            namespace: request.namespace,
        });
        match self.execute(&request.action, &args) {
            Ok(value) => CommandResponse::ok(&value),
            Err(message) => CommandResponse::failure(message),
        }
    }

    fn execute(&self, action: &str, args: &[Value]) -> Result<Value, String> {
        let now = Instant::now();
        let arg_str = |i: usize| -> Result<String, String> {
            args.get(i)
                .cloned()
                .and_then(Value::into_string)
                .ok_or_else(|| format!("ERR wrong number of arguments for '{}'", action))
        };
        let arg_int = |i: usize| -> Result<i64, String> {
            args.get(i)
                .and_then(Value::as_i64)
                .ok_or_else(|| "ERR value is not an integer".to_string())
        };

        match action {
            "echo" => Ok(args.first().cloned().unwrap_or_default()),
            "set" => {
                let key = arg_str(0)?;
                let mut state = self.state.lock();
                state.expiries.remove(&key);
                state.store.insert(key, args.get(1).cloned().unwrap_or_default());
                Ok(Value::from("OK"))
            }
            "setex" => {
                let key = arg_str(0)?;
                let seconds = arg_int(1)?;
                let mut state = self.state.lock();
                state
                    .expiries
                    .insert(key.clone(), now + Duration::from_secs(seconds as u64));
                state.store.insert(key, args.get(2).cloned().unwrap_or_default());
                Ok(Value::from("OK"))
            }
            "get" => {
                let key = arg_str(0)?;
                let mut state = self.state.lock();
                state.evict_expired(&key, now);
                Ok(state.store.get(&key).cloned().unwrap_or_default())
            }
            "del" => {
                let mut state = self.state.lock();
                let removed = args
                    .iter()
                    .filter_map(|a| a.clone().into_string())
                    .filter(|key| state.store.remove(key).is_some())
                    .count();
                Ok(Value::from(removed))
            }
            "exists" => {
                let key = arg_str(0)?;
                let mut state = self.state.lock();
                state.evict_expired(&key, now);
                Ok(Value::Int(state.store.contains_key(&key) as i64))
            }
            "incr" | "decr" => {
                let key = arg_str(0)?;
                let delta = if action == "incr" { 1 } else { -1 };
                let mut state = self.state.lock();
                let current = match state.store.get(&key) {
                    None => 0,
                    Some(value) => value
                        .as_i64()
                        .ok_or_else(|| "ERR value is not an integer".to_string())?,
                };
                state.store.insert(key, Value::Int(current + delta));
                Ok(Value::Int(current + delta))
            }
            "expire" => {
                let key = arg_str(0)?;
                let seconds = arg_int(1)?;
                let mut state = self.state.lock();
                if !state.store.contains_key(&key) {
                    return Ok(Value::Int(0));
                }
                state
                    .expiries
                    .insert(key, now + Duration::from_secs(seconds as u64));
                Ok(Value::Int(1))
            }
            "ttl" => {
                let key = arg_str(0)?;
                let mut state = self.state.lock();
                state.evict_expired(&key, now);
                let ttl = match (state.store.contains_key(&key), state.expiries.get(&key)) {
                    (false, _) => -2,
                    (true, None) => -1,
                    (true, Some(at)) => at.saturating_duration_since(now).as_secs() as i64,
                };
                Ok(Value::Int(ttl))
            }
            "flushdb" => {
                let mut state = self.state.lock();
                state.store.clear();
                state.expiries.clear();
                Ok(Value::from("OK"))
            }
            "subscribe" | "psubscribe" => {
                let mut state = self.state.lock();
                for target in args.iter().filter_map(|a| a.clone().into_string()) {
                    if action == "subscribe" {
                        state.channels.insert(target);
                    } else {
                        state.patterns.insert(target);
                    }
                }
                Ok(Value::Int((state.channels.len() + state.patterns.len()) as i64))
            }
            "unsubscribe" | "punsubscribe" => {
                let mut state = self.state.lock();
                let set = if action == "unsubscribe" {
                    &mut state.channels
                } else {
                    &mut state.patterns
                };
                if args.is_empty() {
                    set.clear();
                }
                for target in args.iter().filter_map(|a| a.clone().into_string()) {
                    set.remove(&target);
                }
                Ok(Value::Nil)
            }
            "publish" => {
                let channel = arg_str(0)?;
                let message = args.get(1).cloned().unwrap_or_default();
                Ok(Value::from(self.deliver(&channel, &message)))
            }
            actions::LOCK => {
                let key = arg_str(0)?;
                let ttl = arg_int(1)?;
                let mut state = self.state.lock();
                if let Some((_, expires_at)) = state.locks.get(&key) {
                    if *expires_at > now {
                        return Err(format!(
                            "Exceeded 10 attempts to lock the resource \"{}\".",
                            key
                        ));
                    }
                }
                state.next_token += 1;
                let token = format!("tok-{}", state.next_token);
                state.locks.insert(
                    key,
                    (token.clone(), now + Duration::from_millis(ttl as u64)),
                );
                Ok(Value::from(token))
            }
            actions::UNLOCK => {
                let token = arg_str(0)?;
                let mut state = self.state.lock();
                let before = state.locks.len();
                state.locks.retain(|_, (held, _)| *held != token);
                Ok(Value::Int((before - state.locks.len()) as i64))
            }
            actions::EXTEND => {
                let token = arg_str(0)?;
                let ttl = arg_int(1)?;
                let mut state = self.state.lock();
                match state
                    .locks
                    .values_mut()
                    .find(|(held, expires_at)| *held == token && *expires_at > now)
                {
                    Some((_, expires_at)) => {
                        *expires_at = now + Duration::from_millis(ttl as u64);
                        Ok(Value::Int(1))
                    }
                    None => Err("Lock not held".to_string()),
                }
            }
            actions::MULTI => {
                let entries = match args.first() {
                    Some(Value::Array(entries)) => entries.clone(),
                    _ => return Err("ERR multi expects a list of commands".to_string()),
                };
                let replies = entries
                    .iter()
                    .map(|entry| match BatchEntry::from_value(entry) {
                        Some(entry) => match self.execute(&entry.command, &entry.args) {
                            Ok(result) => BatchReply::ok(result),
                            Err(message) => BatchReply::failed(message),
                        },
                        None => BatchReply::failed("ERR malformed entry"),
                    })
                    .map(BatchReply::into_value)
                    .collect();
                Ok(Value::Array(replies))
            }
            other => Err(format!("ERR unknown command '{}'", other)),
        }
    }

    /// Push a message to subscribed sessions. Returns the delivery count.
    fn deliver(&self, channel: &str, message: &Value) -> usize {
        let (senders, channel_hit, patterns) = {
            let state = self.state.lock();
            let patterns: Vec<String> = state
                .patterns
                .iter()
                .filter(|p| glob_match(p, channel))
                .cloned()
                .collect();
            (
                state.sessions.values().cloned().collect::<Vec<_>>(),
                state.channels.contains(channel),
                patterns,
            )
        };
        let mut delivered = 0;
        for inbound in &senders {
            if channel_hit {
                let _ = inbound.send(Inbound::Event {
                    event: events::MESSAGE.to_string(),
                    args: vec![serde_json::json!(channel), marshal(message)],
                });
                delivered += 1;
            }
            for pattern in &patterns {
                let _ = inbound.send(Inbound::Event {
                    event: events::PMESSAGE.to_string(),
                    args: vec![
                        serde_json::json!(pattern),
                        serde_json::json!(channel),
                        marshal(message),
                    ],
                });
                delivered += 1;
            }
        }
        delivered
    }
}

impl ServerState {
    fn evict_expired(&mut self, key: &str, now: Instant) {
        if self.expiries.get(key).is_some_and(|at| *at <= now) {
            self.expiries.remove(key);
            self.store.remove(key);
        }
    }
}

/// Only a trailing `*` wildcard is supported.
fn glob_match(pattern: &str, channel: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => channel.starts_with(prefix),
        None => pattern == channel,
    }
}

/// Transport whose sessions are served in-process by a [`FakeServer`].
pub struct MemoryTransport {
    server: FakeServer,
}

impl Transport for MemoryTransport {
    fn open(&self, _url: &str) -> TransportSession {
        let (session, peer) = TransportSession::pair();
        tokio::spawn(self.server.clone().serve(peer));
        session
    }
}

/// Collect events of the given kinds into a shared list.
pub fn record_events(
    client: &CacheClient,
    kinds: &[cache_client::EventKind],
) -> Arc<Mutex<Vec<cache_client::ClientEvent>>> {
    use cache_client::Observable;
    let seen = Arc::new(Mutex::new(Vec::new()));
    for kind in kinds {
        let sink = seen.clone();
        client.on(*kind, move |event| sink.lock().push(event.clone()));
    }
    seen
}

/// Let spawned tasks run until the runtime is idle.
pub async fn settle() {
    for _ in 0..50 {
        tokio::task::yield_now().await;
    }
}
