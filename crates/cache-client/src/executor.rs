//! Single in-flight command executor.
//!
//! Invocations are queued FIFO. At most one is on the wire at a time; the
//! next is dispatched only after the previous reply has been delivered.

use crate::transport::TransportSession;
use crate::{CacheError, CacheResult};
use cache_protocol_types::{events, unmarshal, CommandRequest, CommandResponse, Value};
use std::collections::VecDeque;
use tracing::{debug, trace, warn};

/// Receives the outcome of one invocation. Runs on the connection task.
pub(crate) type Completion = Box<dyn FnOnce(CacheResult<Value>) + Send>;

/// One queued command call.
pub(crate) struct Invocation {
    pub(crate) action: String,
    pub(crate) args: Vec<Value>,
    pub(crate) namespace: i64,
    pub(crate) on_complete: Completion,
}

impl Invocation {
    pub(crate) fn new(action: String, args: Vec<Value>, namespace: i64, on_complete: Completion) -> Self {
        Self {
            action,
            args,
            namespace,
            on_complete,
        }
    }

    pub(crate) fn fail(self, err: CacheError) {
        (self.on_complete)(Err(err));
    }
}

struct InFlight {
    id: u64,
    action: String,
    on_complete: Completion,
}

#[derive(Default)]
pub(crate) struct Executor {
    queue: VecDeque<Invocation>,
    in_flight: Option<InFlight>,
    next_id: u64,
}

impl Executor {
    pub(crate) fn submit(&mut self, invocation: Invocation) {
        trace!(action = %invocation.action, queued = self.queue.len(), "Queued command");
        self.queue.push_back(invocation);
    }

    pub(crate) fn has_in_flight(&self) -> bool {
        self.in_flight.is_some()
    }

    pub(crate) fn queued(&self) -> usize {
        self.queue.len()
    }

    pub(crate) fn is_idle(&self) -> bool {
        self.in_flight.is_none() && self.queue.is_empty()
    }

    /// Put the next queued invocation on the wire, if nothing is in flight.
    /// A send failure leaves the invocation at the head of the queue.
    pub(crate) fn dispatch_next(&mut self, session: &TransportSession) -> bool {
        if self.in_flight.is_some() {
            return false;
        }
        let Some(invocation) = self.queue.pop_front() else {
            return false;
        };

        let encoded = CommandRequest::new(&invocation.action, &invocation.args, invocation.namespace)
            .map_err(CacheError::from)
            .and_then(|request| request.to_json().map_err(CacheError::from));
        let payload = match encoded {
            Ok(payload) => payload,
            Err(e) => {
                warn!(action = %invocation.action, error = %e, "Command arguments cannot be encoded");
                invocation.fail(e);
                return false;
            }
        };

        self.next_id += 1;
        let id = self.next_id;
        if let Err(e) = session.request(id, events::COMMAND, payload) {
            warn!(action = %invocation.action, error = %e, "Send failed, keeping command queued");
            self.queue.push_front(invocation);
            return false;
        }

        debug!(id, action = %invocation.action, "Dispatched command");
        self.in_flight = Some(InFlight {
            id,
            action: invocation.action,
            on_complete: invocation.on_complete,
        });
        true
    }

    /// Deliver the reply for `id`. Returns false for replies that do not
    /// match the in-flight command.
    pub(crate) fn complete(
        &mut self,
        id: u64,
        error: Option<serde_json::Value>,
        response: Option<serde_json::Value>,
    ) -> bool {
        match &self.in_flight {
            Some(in_flight) if in_flight.id == id => {}
            _ => {
                debug!(id, "Ignoring reply with no matching command");
                return false;
            }
        }
        let Some(in_flight) = self.in_flight.take() else {
            return false;
        };
        trace!(id, action = %in_flight.action, "Command completed");
        (in_flight.on_complete)(decode_reply(error, response));
        true
    }

    /// Fail the in-flight command, if any.
    pub(crate) fn abort_in_flight(&mut self, err: impl FnOnce() -> CacheError) {
        if let Some(in_flight) = self.in_flight.take() {
            debug!(id = in_flight.id, action = %in_flight.action, "Aborting in-flight command");
            (in_flight.on_complete)(Err(err()));
        }
    }

    /// Fail every queued command.
    pub(crate) fn fail_queued(&mut self, err: impl Fn() -> CacheError) {
        for invocation in self.queue.drain(..) {
            invocation.fail(err());
        }
    }
}

/// Turn a raw acknowledgement into the caller's outcome.
///
/// - a transport error object is surfaced with its message
/// - `{success: false, message}` becomes `Command(message)`
/// - otherwise the unmarshaled `data` is the result
pub(crate) fn decode_reply(
    error: Option<serde_json::Value>,
    response: Option<serde_json::Value>,
) -> CacheResult<Value> {
    if let Some(error) = error.filter(|e| !e.is_null()) {
        return Err(CacheError::Command(error_message(&error)));
    }
    let Some(response) = response.filter(|r| !r.is_null()) else {
        return Ok(Value::Nil);
    };
    let response = CommandResponse::from_json(response)
        .map_err(|e| CacheError::UnexpectedReply(e.to_string()))?;
    if !response.success {
        return Err(CacheError::Command(
            response.message.unwrap_or_else(|| "command failed".to_string()),
        ));
    }
    match response.data {
        Some(data) => Ok(unmarshal(data)?),
        None => Ok(Value::Nil),
    }
}

fn error_message(error: &serde_json::Value) -> String {
    match error {
        serde_json::Value::String(message) => message.clone(),
        serde_json::Value::Object(object) => object
            .get("message")
            .and_then(|m| m.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| error.to_string()),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::Outbound;
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    type Outcomes = Arc<Mutex<Vec<(String, CacheResult<Value>)>>>;

    fn recording(action: &str, outcomes: &Outcomes) -> Invocation {
        let sink = outcomes.clone();
        let name = action.to_string();
        Invocation::new(
            action.to_string(),
            vec![Value::from(action)],
            0,
            Box::new(move |result| sink.lock().unwrap().push((name, result))),
        )
    }

    fn ok_reply(data: serde_json::Value) -> Option<serde_json::Value> {
        Some(json!({"success": true, "data": data}))
    }

    #[tokio::test]
    async fn test_single_in_flight_fifo() {
        let (session, mut peer) = TransportSession::pair();
        let outcomes: Outcomes = Arc::default();
        let mut executor = Executor::default();

        executor.submit(recording("first", &outcomes));
        executor.submit(recording("second", &outcomes));

        assert!(executor.dispatch_next(&session));
        assert!(!executor.dispatch_next(&session));
        assert_eq!(executor.queued(), 1);

        let Some(Outbound::Request { id, payload, .. }) = peer.outbound.recv().await else {
            panic!("expected a request");
        };
        assert_eq!(payload["action"], "first");

        assert!(executor.complete(id, None, ok_reply(json!("a"))));
        assert!(executor.dispatch_next(&session));
        let Some(Outbound::Request { id, payload, .. }) = peer.outbound.recv().await else {
            panic!("expected a request");
        };
        assert_eq!(payload["action"], "second");
        assert!(executor.complete(id, None, ok_reply(json!("b"))));
        assert!(executor.is_idle());

        let outcomes = outcomes.lock().unwrap();
        assert_eq!(outcomes[0].0, "first");
        assert_eq!(outcomes[0].1.as_ref().unwrap(), &Value::from("a"));
        assert_eq!(outcomes[1].0, "second");
    }

    #[test]
    fn test_stale_reply_is_ignored() {
        let (session, _peer) = TransportSession::pair();
        let outcomes: Outcomes = Arc::default();
        let mut executor = Executor::default();
        executor.submit(recording("get", &outcomes));
        executor.dispatch_next(&session);

        assert!(!executor.complete(999, None, ok_reply(json!(1))));
        assert!(executor.has_in_flight());
        assert!(outcomes.lock().unwrap().is_empty());
    }

    #[test]
    fn test_send_failure_keeps_command_queued() {
        let (session, peer) = TransportSession::pair();
        drop(peer);
        let outcomes: Outcomes = Arc::default();
        let mut executor = Executor::default();
        executor.submit(recording("get", &outcomes));

        assert!(!executor.dispatch_next(&session));
        assert_eq!(executor.queued(), 1);
        assert!(!executor.has_in_flight());
    }

    #[test]
    fn test_unencodable_args_fail_without_sending() {
        let (session, mut peer) = TransportSession::pair();
        let outcomes: Outcomes = Arc::default();
        let mut executor = Executor::default();
        let sink = outcomes.clone();
        executor.submit(Invocation::new(
            "set".to_string(),
            vec![Value::from("k"), Value::Float(f64::NAN)],
            0,
            Box::new(move |result| sink.lock().unwrap().push(("set".to_string(), result))),
        ));

        assert!(!executor.dispatch_next(&session));
        assert!(executor.is_idle());
        assert!(peer.outbound.try_recv().is_err());
        assert!(matches!(
            outcomes.lock().unwrap()[0].1,
            Err(CacheError::Marshal(_))
        ));
    }

    #[test]
    fn test_abort_and_fail_queued() {
        let (session, _peer) = TransportSession::pair();
        let outcomes: Outcomes = Arc::default();
        let mut executor = Executor::default();
        executor.submit(recording("a", &outcomes));
        executor.submit(recording("b", &outcomes));
        executor.dispatch_next(&session);

        executor.abort_in_flight(|| CacheError::ConnectionLost);
        executor.fail_queued(|| CacheError::Closed);

        let outcomes = outcomes.lock().unwrap();
        assert!(matches!(outcomes[0].1, Err(CacheError::ConnectionLost)));
        assert!(matches!(outcomes[1].1, Err(CacheError::Closed)));
        assert!(executor.is_idle());
    }

    #[test]
    fn test_decode_reply_variants() {
        assert_eq!(
            decode_reply(None, ok_reply(json!({"flavor": "buffer", "base64": "T0s="}))).unwrap(),
            Value::Bytes(b"OK".to_vec())
        );

        let failure = decode_reply(None, Some(json!({"success": false, "message": "nope"})));
        assert!(matches!(failure, Err(CacheError::Command(ref m)) if m == "nope"));

        let transport = decode_reply(Some(json!({"success": false, "message": "denied"})), None);
        assert!(matches!(transport, Err(CacheError::Command(ref m)) if m == "denied"));

        let raw = decode_reply(Some(json!("socket hang up")), None);
        assert!(matches!(raw, Err(CacheError::Command(ref m)) if m == "socket hang up"));

        assert_eq!(decode_reply(None, None).unwrap(), Value::Nil);
        assert_eq!(decode_reply(Some(json!(null)), ok_reply(json!(3))).unwrap(), Value::Int(3));
    }
}
