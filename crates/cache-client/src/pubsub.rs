//! Pub/sub on top of the command channel.
//!
//! Subscribing is a regular command; deliveries arrive as `message` and
//! `pmessage` events on the shared connection. A [`Subscription`] is a
//! filtered view of the client's event stream.

use crate::client::{CacheClient, PendingReply};
use crate::events::{ClientEvent, ErrorEvent};
use crate::{CacheError, CacheResult};
use cache_protocol_types::Value;
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// One delivered message.
#[derive(Debug, Clone, PartialEq)]
pub struct PubSubMessage {
    /// Set for pattern subscriptions.
    pub pattern: Option<String>,
    pub channel: String,
    pub data: Value,
}

/// Messages for a set of channels or patterns.
pub struct Subscription {
    client: CacheClient,
    targets: Vec<String>,
    patterns: bool,
    events: broadcast::Receiver<ClientEvent>,
}

impl Subscription {
    pub fn targets(&self) -> &[String] {
        &self.targets
    }

    pub fn is_pattern(&self) -> bool {
        self.patterns
    }

    /// Next message for this subscription. `None` once the client closes.
    pub async fn recv(&mut self) -> Option<PubSubMessage> {
        loop {
            match self.events.recv().await {
                Ok(ClientEvent::Message { channel, data })
                    if !self.patterns && self.targets.contains(&channel) =>
                {
                    return Some(PubSubMessage {
                        pattern: None,
                        channel,
                        data,
                    });
                }
                Ok(ClientEvent::PMessage {
                    pattern,
                    channel,
                    data,
                }) if self.patterns && self.targets.contains(&pattern) => {
                    return Some(PubSubMessage {
                        pattern: Some(pattern),
                        channel,
                        data,
                    });
                }
                Ok(ClientEvent::Close) | Ok(ClientEvent::End) => return None,
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Subscription fell behind, messages dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Unsubscribe from every target of this subscription.
    pub fn unsubscribe(self) -> PendingReply<Value> {
        let targets: Vec<&str> = self.targets.iter().map(String::as_str).collect();
        if self.patterns {
            self.client.punsubscribe(&targets)
        } else {
            self.client.unsubscribe(&targets)
        }
    }
}

impl CacheClient {
    /// Subscribe to `channels`. An empty list is rejected at call time.
    pub fn subscribe(&self, channels: &[&str]) -> CacheResult<Subscription> {
        self.start_subscription("subscribe", channels, false)
    }

    /// Subscribe to channel `patterns`. An empty list is rejected at call
    /// time.
    pub fn psubscribe(&self, patterns: &[&str]) -> CacheResult<Subscription> {
        self.start_subscription("psubscribe", patterns, true)
    }

    /// Unsubscribe from `channels`, or from all channels when empty.
    pub fn unsubscribe(&self, channels: &[&str]) -> PendingReply<Value> {
        self.submit("unsubscribe", to_args(channels))
    }

    /// Unsubscribe from `patterns`, or from all patterns when empty.
    pub fn punsubscribe(&self, patterns: &[&str]) -> PendingReply<Value> {
        self.submit("punsubscribe", to_args(patterns))
    }

    fn start_subscription(
        &self,
        action: &str,
        targets: &[&str],
        patterns: bool,
    ) -> CacheResult<Subscription> {
        if targets.is_empty() {
            return Err(CacheError::InvalidUsage(format!(
                "{} requires at least one target",
                action
            )));
        }
        let args = to_args(targets);
        let (action, _) = self.catalog().resolve(action, &args)?;
        // Take the receiver first so no delivery can slip past.
        let events = self.bus().subscribe();
        let bus = self.bus().clone();
        let label = action.clone();
        self.dispatch(
            action,
            args,
            Box::new(move |result| match result {
                Ok(_) => debug!(action = %label, "Subscription confirmed"),
                Err(e) => {
                    warn!(action = %label, error = %e, "Subscription failed");
                    bus.emit(ClientEvent::Error(ErrorEvent::from(&e)));
                }
            }),
        );
        Ok(Subscription {
            client: self.clone(),
            targets: targets.iter().map(|t| t.to_string()).collect(),
            patterns,
            events,
        })
    }
}

fn to_args(targets: &[&str]) -> Vec<Value> {
    targets.iter().map(|t| Value::from(*t)).collect()
}
