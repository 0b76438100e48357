//! Connection lifecycle actor.
//!
//! One task per client owns the transport session, the executor, every
//! lifecycle flag and every timer. Client handles talk to it over an
//! unbounded control channel. After each wake-up (control message, inbound
//! notification, identity result or timer) the actor re-evaluates pending
//! work: it dispatches the next command when authenticated and advances an
//! in-progress close. Nothing polls.

use crate::config::ShutdownPolicy;
use crate::events::{ClientEvent, ErrorEvent, EventBus};
use crate::executor::{Executor, Invocation};
use crate::exit_guard::{self, ExitInterception};
use crate::identity::{process_identity, sign_key, Identity, IdentityProvider};
use crate::transport::{DisconnectReason, Inbound, Transport, TransportError, TransportSession};
use crate::{CacheConfig, CacheError};
use cache_protocol_types::{events, unmarshal, AuthRequest, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Delay before re-running a deferred disconnect.
const DEFER_DISCONNECT: Duration = Duration::from_millis(1_000);

/// Deferral used while a command is on the wire.
const DEFER_DISCONNECT_WHILE_SENDING: Duration = Duration::from_millis(3_000);

/// Exit code used after SIGINT.
pub(crate) const SIGINT_EXIT_CODE: i32 = 130;

/// Exit code used after SIGTERM.
pub(crate) const SIGTERM_EXIT_CODE: i32 = 143;

/// Observable lifecycle state of a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No session (disabled, or waiting to reconnect).
    Idle,
    Connecting,
    /// Connected, authentication pending.
    Connected,
    Authenticated,
    /// Close in progress.
    Disconnecting,
    Closed,
}

/// Requests from client handles.
pub(crate) enum Control {
    Command(Invocation),
    Register,
    Close { done: Option<oneshot::Sender<()>> },
    /// Graceful shutdown followed by an exit with `code`.
    Shutdown { code: i32 },
}

enum Internal {
    Identity { generation: u64, identity: Identity },
    Signal { code: i32 },
}

#[derive(Debug, Default)]
struct Flags {
    connecting: bool,
    connected: bool,
    authed: bool,
    closing: bool,
    closed: bool,
    shutdown: bool,
    pending_start: bool,
    pending_exit: bool,
    disconnect_sent: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerKind {
    KeepAlive,
    Reconnect,
    DeferredDisconnect,
    CloseWatchdog,
    CloseFallback,
    StartDeadline,
}

struct DeferredDisconnect {
    reason: Option<DisconnectReason>,
    message: Option<String>,
    reconnect: bool,
}

#[derive(Default)]
struct Timers {
    keep_alive: Option<Instant>,
    reconnect: Option<Instant>,
    deferred_disconnect: Option<(Instant, DeferredDisconnect)>,
    close_watchdog: Option<Instant>,
    close_fallback: Option<Instant>,
    start_deadline: Option<Instant>,
}

impl Timers {
    fn next_deadline(&self) -> Option<(Instant, TimerKind)> {
        [
            (self.keep_alive, TimerKind::KeepAlive),
            (self.reconnect, TimerKind::Reconnect),
            (
                self.deferred_disconnect.as_ref().map(|(at, _)| *at),
                TimerKind::DeferredDisconnect,
            ),
            (self.close_watchdog, TimerKind::CloseWatchdog),
            (self.close_fallback, TimerKind::CloseFallback),
            (self.start_deadline, TimerKind::StartDeadline),
        ]
        .into_iter()
        .filter_map(|(at, kind)| at.map(|at| (at, kind)))
        .min_by_key(|(at, _)| *at)
    }

    fn clear(&mut self) {
        *self = Self::default();
    }
}

enum Wake {
    Control(Option<Control>),
    Internal(Option<Internal>),
    Inbound(Option<Inbound>),
    Timer(TimerKind),
}

/// The connection actor.
pub(crate) struct Connection {
    config: Arc<CacheConfig>,
    transport: Arc<dyn Transport>,
    identity: Arc<dyn IdentityProvider>,
    bus: EventBus,
    status: watch::Sender<ConnectionState>,
    control_rx: mpsc::UnboundedReceiver<Control>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    internal_rx: mpsc::UnboundedReceiver<Internal>,
    session: Option<TransportSession>,
    executor: Executor,
    flags: Flags,
    timers: Timers,
    /// Bumped whenever the session is replaced, to discard stale results.
    generation: u64,
    reconnect_attempts: u32,
    exit_code: Option<i32>,
    interception: Option<ExitInterception>,
    close_waiters: Vec<oneshot::Sender<()>>,
    signal_task: Option<JoinHandle<()>>,
    handles_dropped: bool,
    finished: bool,
}

impl Connection {
    pub(crate) fn new(
        config: Arc<CacheConfig>,
        transport: Arc<dyn Transport>,
        identity: Arc<dyn IdentityProvider>,
        bus: EventBus,
        status: watch::Sender<ConnectionState>,
        control_rx: mpsc::UnboundedReceiver<Control>,
    ) -> Self {
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        Self {
            config,
            transport,
            identity,
            bus,
            status,
            control_rx,
            internal_tx,
            internal_rx,
            session: None,
            executor: Executor::default(),
            flags: Flags::default(),
            timers: Timers::default(),
            generation: 0,
            reconnect_attempts: 0,
            exit_code: None,
            interception: None,
            close_waiters: Vec::new(),
            signal_task: None,
            handles_dropped: false,
            finished: false,
        }
    }

    pub(crate) async fn run(mut self) {
        self.start();
        self.publish_state();
        while !self.finished {
            let wake = self.next_wake().await;
            self.handle_wake(wake);
            self.pump();
            self.publish_state();
        }
        debug!("Connection task finished");
    }

    async fn next_wake(&mut self) -> Wake {
        let deadline = self.timers.next_deadline();
        let accept_control = !self.handles_dropped;
        tokio::select! {
            biased;
            internal = self.internal_rx.recv() => Wake::Internal(internal),
            inbound = next_inbound(self.session.as_mut()) => Wake::Inbound(inbound),
            control = self.control_rx.recv(), if accept_control => Wake::Control(control),
            kind = sleep_until(deadline) => Wake::Timer(kind),
        }
    }

    fn start(&mut self) {
        if self.config.disabled {
            info!("Cache client disabled, not connecting");
            return;
        }
        self.flags.pending_start = true;
        self.interception = Some(ExitInterception::install());
        self.timers.start_deadline = Some(Instant::now() + self.config.timeout());
        if self.config.intercept_signals {
            self.signal_task = Some(spawn_signal_listener(self.internal_tx.clone()));
        }
        self.reconnect();
    }

    fn handle_wake(&mut self, wake: Wake) {
        match wake {
            Wake::Control(Some(control)) => self.handle_control(control),
            Wake::Control(None) => {
                debug!("All client handles dropped, closing");
                self.handles_dropped = true;
                self.begin_close();
            }
            Wake::Internal(Some(Internal::Identity {
                generation,
                identity,
            })) => self.authenticate(generation, identity),
            Wake::Internal(Some(Internal::Signal { code })) => self.shutdown(code),
            Wake::Internal(None) => {}
            Wake::Inbound(Some(inbound)) => self.handle_inbound(inbound),
            Wake::Inbound(None) => {
                debug!("Transport session ended");
                self.drop_session();
                self.handle_disconnect(Some(DisconnectReason::TransportClose), None, true);
            }
            Wake::Timer(kind) => self.handle_timer(kind),
        }
    }

    fn handle_control(&mut self, control: Control) {
        match control {
            Control::Command(invocation) => {
                if self.config.disabled {
                    invocation.fail(CacheError::Disabled);
                } else if self.flags.closing || self.flags.closed {
                    invocation.fail(CacheError::Closed);
                } else {
                    self.executor.submit(invocation);
                }
            }
            Control::Register => self.register(),
            Control::Close { done } => {
                if let Some(done) = done {
                    self.close_waiters.push(done);
                }
                self.begin_close();
            }
            Control::Shutdown { code } => self.shutdown(code),
        }
    }

    fn handle_inbound(&mut self, inbound: Inbound) {
        match inbound {
            Inbound::Connect => self.on_connect(),
            Inbound::ConnectError(err) => self.on_connect_error(err),
            Inbound::Event { event, args } => self.on_event(&event, args),
            Inbound::Ack {
                id,
                error,
                response,
            } => {
                if self.executor.complete(id, error, response) && self.executor.is_idle() {
                    self.bus.emit(ClientEvent::Idle);
                }
            }
            Inbound::Disconnect { reason, message } => {
                self.drop_session();
                self.handle_disconnect(Some(reason), message, true);
            }
        }
    }

    fn handle_timer(&mut self, kind: TimerKind) {
        match kind {
            TimerKind::KeepAlive => {
                self.timers.keep_alive = Some(Instant::now() + self.config.keep_alive_interval());
                let idle = self.session.is_none()
                    && self.timers.reconnect.is_none()
                    && !self.flags.closing
                    && !self.flags.closed;
                if idle {
                    debug!("Keep-alive found no session, reconnecting");
                    self.reconnect();
                }
            }
            TimerKind::Reconnect => {
                self.timers.reconnect = None;
                self.reconnect();
            }
            TimerKind::DeferredDisconnect => {
                if let Some((_, deferred)) = self.timers.deferred_disconnect.take() {
                    self.bus.emit(ClientEvent::Disconnecting);
                    self.handle_disconnect(deferred.reason, deferred.message, deferred.reconnect);
                }
            }
            TimerKind::CloseWatchdog => {
                self.timers.close_watchdog = None;
                warn!("Service did not acknowledge disconnect, closing");
                self.finalize(false);
            }
            TimerKind::CloseFallback => {
                self.timers.close_fallback = None;
                self.finalize(true);
            }
            TimerKind::StartDeadline => {
                self.timers.start_deadline = None;
                warn!(
                    timeout_ms = self.config.timeout_ms,
                    "First connection attempt did not resolve in time"
                );
                self.finish_pending_start();
            }
        }
    }

    /// Dispatch queued work and advance a pending close.
    fn pump(&mut self) {
        if self.flags.authed && !self.flags.closed {
            if let Some(session) = &self.session {
                self.executor.dispatch_next(session);
            }
        }
        self.advance_close();
    }

    /// Replace the session with a fresh one.
    fn reconnect(&mut self) {
        if self.config.disabled {
            return;
        }
        if self.flags.connecting || self.flags.closed || self.flags.closing {
            debug!(
                connecting = self.flags.connecting,
                closed = self.flags.closed,
                closing = self.flags.closing,
                "Reconnect skipped"
            );
            return;
        }
        self.drop_session();
        self.flags.connecting = true;
        self.timers.reconnect = None;
        self.timers.keep_alive = Some(Instant::now() + self.config.keep_alive_interval());
        debug!(url = %self.config.url, "Opening transport session");
        self.session = Some(self.transport.open(&self.config.url));
    }

    /// Close and forget the current session. A command on the wire cannot
    /// be confirmed any more, so it fails instead of being replayed.
    fn drop_session(&mut self) {
        if let Some(session) = self.session.take() {
            session.close();
        }
        self.flags.connecting = false;
        self.flags.connected = false;
        self.flags.authed = false;
        self.flags.disconnect_sent = false;
        self.generation += 1;
        self.executor.abort_in_flight(|| CacheError::ConnectionLost);
    }

    fn on_connect(&mut self) {
        if self.flags.connected {
            debug!("Duplicate connect notification ignored");
            return;
        }
        self.flags.connected = true;
        self.flags.connecting = false;
        self.flags.shutdown = false;
        info!(url = %self.config.url, "Connected to cache service");
        self.finish_pending_start();
        self.bus.emit(ClientEvent::Connect);

        let provider = self.identity.clone();
        let tx = self.internal_tx.clone();
        let generation = self.generation;
        tokio::spawn(async move {
            let identity = process_identity(provider.as_ref()).await;
            let _ = tx.send(Internal::Identity {
                generation,
                identity,
            });
        });
    }

    fn on_connect_error(&mut self, err: TransportError) {
        warn!(code = err.code(), error = %err, "Connection attempt failed");
        self.drop_session();
        self.finish_pending_start();

        let event = ErrorEvent::from(&CacheError::Transport(err));
        self.bus.emit(ClientEvent::ConnectError(event.clone()));
        self.bus.emit(ClientEvent::Error(event));

        if !self.flags.closing && !self.flags.closed {
            self.reconnect_attempts += 1;
            let delay = self.config.reconnect_delay(self.reconnect_attempts);
            info!(
                attempt = self.reconnect_attempts,
                delay_ms = delay.as_millis() as u64,
                "Scheduling reconnect"
            );
            self.timers.reconnect = Some(Instant::now() + delay);
        }
    }

    fn authenticate(&mut self, generation: u64, identity: Identity) {
        if generation != self.generation || !self.flags.connected || self.flags.closed {
            debug!("Discarding identity resolved for a replaced session");
            return;
        }
        let signature = match sign_key(&self.config.key, &self.config.secret) {
            Ok(signature) => signature,
            Err(e) => {
                self.emit_error(&e);
                return;
            }
        };
        let request = AuthRequest {
            uuid: identity.fingerprint,
            key: self.config.key.clone(),
            signature,
            address: identity.addresses,
        };
        let payload = match request.to_json() {
            Ok(payload) => payload,
            Err(e) => {
                self.emit_error(&CacheError::from(e));
                return;
            }
        };
        if let Some(session) = &self.session {
            match session.emit(events::AUTHENTICATE, vec![payload]) {
                Ok(()) => debug!("Sent authenticate"),
                Err(e) => warn!(error = %e, "Failed to send authenticate"),
            }
        }
    }

    fn on_event(&mut self, event: &str, args: Vec<serde_json::Value>) {
        match event {
            events::AUTHENTICATED => self.on_authenticated(),
            events::PING => {
                debug!("Received ping, sending pong");
                if let Some(session) = &self.session {
                    let _ = session.emit(events::PONG, vec![]);
                }
            }
            events::MESSAGE => {
                let mut args = args.into_iter();
                match (args.next().and_then(json_string), decode_data(args.next())) {
                    (Some(channel), Some(data)) => {
                        self.bus.emit(ClientEvent::Message { channel, data })
                    }
                    _ => warn!("Malformed message event"),
                }
            }
            events::PMESSAGE => {
                let mut args = args.into_iter();
                let pattern = args.next().and_then(json_string);
                let channel = args.next().and_then(json_string);
                match (pattern, channel, decode_data(args.next())) {
                    (Some(pattern), Some(channel), Some(data)) => {
                        self.bus.emit(ClientEvent::PMessage {
                            pattern,
                            channel,
                            data,
                        })
                    }
                    _ => warn!("Malformed pmessage event"),
                }
            }
            events::DISCONNECTING => {
                let mut args = args.into_iter();
                let reason = args
                    .next()
                    .and_then(json_string)
                    .map(|raw| DisconnectReason::parse(&raw));
                let message = args.next().and_then(json_string);
                self.handle_disconnect(reason, message, true);
            }
            other => debug!(event = other, "Unhandled event"),
        }
    }

    fn on_authenticated(&mut self) {
        if self.flags.authed || self.flags.closed {
            return;
        }
        self.flags.authed = true;
        self.reconnect_attempts = 0;
        info!(queued = self.executor.queued(), "Authenticated with cache service");
        if let Some(session) = &self.session {
            let _ = session.emit(events::REGISTER, vec![]);
        }
        self.bus.emit(ClientEvent::Ready);
        self.bus.emit(ClientEvent::Register);
    }

    fn register(&mut self) {
        if self.config.disabled || self.flags.closing || self.flags.closed {
            return;
        }
        if !self.flags.connected {
            self.reconnect();
        } else if self.flags.authed {
            let sent = self
                .session
                .as_ref()
                .is_some_and(|s| s.emit(events::REGISTER, vec![]).is_ok());
            if sent {
                self.bus.emit(ClientEvent::Register);
            }
        }
    }

    /// Non-reconnect shutdown that exits the process once closed.
    fn shutdown(&mut self, code: i32) {
        info!(code, "Shutdown requested");
        self.exit_code = Some(code);
        self.handle_disconnect(None, None, false);
    }

    /// Reconcile a disconnect notification, a shutdown request, or a
    /// deferred re-run of either.
    ///
    /// A server-initiated disconnect closes without retry. During pending
    /// start everything else is deferred. A non-reconnect shutdown first
    /// sends `disconnecting` and re-runs after a delay. Other reasons
    /// reconnect, except `unauthorized`, which is reported as an error.
    fn handle_disconnect(
        &mut self,
        reason: Option<DisconnectReason>,
        message: Option<String>,
        reconnect: bool,
    ) {
        debug!(
            reason = ?reason,
            message = ?message,
            reconnect,
            pending_exit = self.flags.pending_exit,
            "Handling disconnect"
        );
        if self.flags.closing || self.flags.closed {
            debug!("Already closing, disconnect left to close");
            return;
        }

        let server_disconnect = reason == Some(DisconnectReason::ServerDisconnect);
        if self.flags.pending_start && !server_disconnect {
            debug!("Pending start, deferring disconnect");
            self.defer_disconnect(reason, message, reconnect);
            return;
        }

        if !reconnect && !self.flags.pending_exit && !server_disconnect {
            self.flags.pending_exit = true;
            self.flags.shutdown = true;
            if reason.is_none() && self.session.is_some() {
                if !self.is_sending() {
                    self.send_disconnecting();
                }
                self.defer_disconnect(reason, message, reconnect);
                return;
            }
        }

        if (reason.is_none() && !reconnect) || server_disconnect {
            self.begin_close();
        }

        match reason {
            None | Some(DisconnectReason::ServerDisconnect) => {}
            Some(DisconnectReason::Unauthorized) => {
                let err = CacheError::Authentication(
                    message.unwrap_or_else(|| "credentials rejected".to_string()),
                );
                warn!(error = %err, "Authentication rejected, waiting for keep-alive to retry");
                self.emit_error(&err);
            }
            Some(other) => {
                if !self.flags.connecting && reconnect && !self.flags.shutdown {
                    info!(reason = %other, "Connection lost, reconnecting");
                    self.reconnect();
                }
            }
        }
    }

    fn defer_disconnect(
        &mut self,
        reason: Option<DisconnectReason>,
        message: Option<String>,
        reconnect: bool,
    ) {
        let delay = if self.is_sending() {
            DEFER_DISCONNECT_WHILE_SENDING
        } else {
            DEFER_DISCONNECT
        };
        self.timers.deferred_disconnect = Some((
            Instant::now() + delay,
            DeferredDisconnect {
                reason,
                message,
                reconnect,
            },
        ));
    }

    fn is_sending(&self) -> bool {
        self.executor.has_in_flight() || (self.flags.authed && self.executor.queued() > 0)
    }

    fn begin_close(&mut self) {
        if self.flags.closing || self.flags.closed {
            return;
        }
        if self.config.disabled {
            self.finish_disabled();
            return;
        }
        info!("Closing cache client");
        self.flags.closing = true;
        self.timers.reconnect = None;
        self.timers.keep_alive = None;
        self.timers.deferred_disconnect = None;
        self.timers.close_fallback = Some(Instant::now() + self.config.close_fallback());
    }

    /// Move a requested close forward: wait out connects and sends, then
    /// send `disconnecting` and wait for the service to drop the session.
    fn advance_close(&mut self) {
        if !self.flags.closing || self.flags.closed {
            return;
        }
        if self.flags.connecting || self.is_sending() {
            return;
        }
        if self.session.is_none() {
            self.finalize(false);
            return;
        }
        if !self.flags.disconnect_sent && !self.send_disconnecting() {
            self.finalize(false);
            return;
        }
        if self.timers.close_watchdog.is_none() {
            self.timers.close_watchdog = Some(Instant::now() + self.config.close_watchdog());
        }
    }

    /// Tell the service this session is going away. Sent at most once per
    /// session.
    fn send_disconnecting(&mut self) -> bool {
        if self.flags.disconnect_sent {
            return true;
        }
        let sent = self
            .session
            .as_ref()
            .is_some_and(|s| s.emit(events::DISCONNECTING, vec![]).is_ok());
        if sent {
            debug!("Sent disconnecting notice");
            self.flags.disconnect_sent = true;
        }
        sent
    }

    /// Final teardown. Runs once.
    fn finalize(&mut self, forced: bool) {
        if self.flags.closed {
            return;
        }
        if let Some(session) = self.session.take() {
            session.close();
        }
        self.executor.abort_in_flight(|| CacheError::Closed);
        self.executor.fail_queued(|| CacheError::Closed);

        let pending_exit = self.flags.pending_exit;
        self.flags = Flags {
            closed: true,
            ..Flags::default()
        };
        self.timers.clear();

        if forced {
            error!(
                fallback_ms = self.config.close_fallback_ms,
                "Close did not complete in time, forcing closed state"
            );
            self.emit_error(&CacheError::CloseTimeout);
        }
        info!("Cache client closed");
        self.bus.emit(ClientEvent::Close);
        self.bus.emit(ClientEvent::End);
        self.bus.remove_all();
        self.publish_state();

        if let Some(task) = self.signal_task.take() {
            task.abort();
        }
        if let Some(interception) = self.interception.take() {
            interception.release();
        }
        for waiter in self.close_waiters.drain(..) {
            let _ = waiter.send(());
        }
        self.finished = true;

        if forced && self.config.shutdown_policy == ShutdownPolicy::Exit {
            exit_guard::exit(1);
        } else if pending_exit {
            if let Some(code) = self.exit_code {
                exit_guard::exit(code);
            }
        }
    }

    fn finish_disabled(&mut self) {
        self.flags.closed = true;
        for waiter in self.close_waiters.drain(..) {
            let _ = waiter.send(());
        }
        self.finished = true;
    }

    fn finish_pending_start(&mut self) {
        if !self.flags.pending_start {
            return;
        }
        self.flags.pending_start = false;
        self.timers.start_deadline = None;
        if let Some(interception) = self.interception.take() {
            debug!("First connection attempt resolved, restoring exit");
            interception.release();
        }
    }

    fn emit_error(&self, err: &CacheError) {
        self.bus.emit(ClientEvent::Error(ErrorEvent::from(err)));
    }

    fn current_state(&self) -> ConnectionState {
        if self.flags.closed {
            ConnectionState::Closed
        } else if self.flags.closing {
            ConnectionState::Disconnecting
        } else if self.flags.authed {
            ConnectionState::Authenticated
        } else if self.flags.connected {
            ConnectionState::Connected
        } else if self.flags.connecting {
            ConnectionState::Connecting
        } else {
            ConnectionState::Idle
        }
    }

    fn publish_state(&self) {
        let next = self.current_state();
        self.status.send_if_modified(|state| {
            if *state == next {
                return false;
            }
            debug!(from = ?*state, to = ?next, "Connection state changed");
            *state = next;
            true
        });
    }
}

async fn next_inbound(session: Option<&mut TransportSession>) -> Option<Inbound> {
    match session {
        Some(session) => session.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<(Instant, TimerKind)>) -> TimerKind {
    match deadline {
        Some((at, kind)) => {
            tokio::time::sleep_until(at).await;
            kind
        }
        None => std::future::pending().await,
    }
}

fn json_string(value: serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) => Some(s),
        _ => None,
    }
}

fn decode_data(value: Option<serde_json::Value>) -> Option<Value> {
    match value {
        None => Some(Value::Nil),
        Some(json) => match unmarshal(json) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(error = %e, "Failed to decode message payload");
                None
            }
        },
    }
}

fn spawn_signal_listener(tx: mpsc::UnboundedSender<Internal>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let code = wait_for_shutdown_signal().await;
        let _ = tx.send(Internal::Signal { code });
    })
}

async fn wait_for_shutdown_signal() -> i32 {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                return tokio::select! {
                    Ok(()) = tokio::signal::ctrl_c() => SIGINT_EXIT_CODE,
                    Some(()) = terminate.recv() => SIGTERM_EXIT_CODE,
                    else => std::future::pending().await,
                };
            }
            Err(e) => warn!(error = %e, "Failed to install SIGTERM handler"),
        }
    }
    if tokio::signal::ctrl_c().await.is_err() {
        warn!("Failed to install SIGINT handler");
        std::future::pending::<()>().await;
    }
    SIGINT_EXIT_CODE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_deadline_picks_earliest() {
        let now = Instant::now();
        let timers = Timers {
            keep_alive: Some(now + Duration::from_secs(60)),
            close_fallback: Some(now + Duration::from_secs(5)),
            deferred_disconnect: Some((
                now + Duration::from_secs(1),
                DeferredDisconnect {
                    reason: None,
                    message: None,
                    reconnect: false,
                },
            )),
            ..Timers::default()
        };
        let (at, kind) = timers.next_deadline().unwrap();
        assert_eq!(kind, TimerKind::DeferredDisconnect);
        assert_eq!(at, now + Duration::from_secs(1));
        assert!(Timers::default().next_deadline().is_none());
    }

    #[test]
    fn test_decode_data_defaults_to_nil() {
        assert_eq!(decode_data(None), Some(Value::Nil));
        assert_eq!(
            decode_data(Some(serde_json::json!("hello"))),
            Some(Value::from("hello"))
        );
        assert_eq!(
            decode_data(Some(serde_json::json!({"flavor": "buffer", "base64": "!"}))),
            None
        );
    }
}
