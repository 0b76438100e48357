//! Batched command submission.
//!
//! A [`Multi`] collects commands locally and submits them as one `multi`
//! action. The service runs them in order and replies with one
//! `{err, result}` entry per command. Per-entry callbacks fire when the
//! batch completes, whether or not anyone awaits the aggregate reply.

use crate::catalog::CommandKind;
use crate::client::{CacheClient, PendingReply};
use crate::{CacheError, CacheResult};
use cache_protocol_types::{actions, BatchEntry, BatchReply, Value};
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Callback receiving one entry's outcome.
pub type EntryCallback = Box<dyn FnOnce(CacheResult<Value>) + Send>;

/// Builder for a command batch.
pub struct Multi {
    client: CacheClient,
    entries: Vec<BatchEntry>,
    callbacks: Vec<Option<EntryCallback>>,
    invalid: Option<CacheError>,
}

impl CacheClient {
    /// Start a batch.
    pub fn multi(&self) -> Multi {
        Multi {
            client: self.clone(),
            entries: Vec::new(),
            callbacks: Vec::new(),
            invalid: None,
        }
    }
}

impl Multi {
    /// Append a command.
    pub fn cmd(mut self, name: &str, args: Vec<Value>) -> Self {
        self.push_entry(name, args, None);
        self
    }

    /// Append a command whose own outcome is delivered to `callback`.
    pub fn cmd_with<F>(mut self, name: &str, args: Vec<Value>, callback: F) -> Self
    where
        F: FnOnce(CacheResult<Value>) + Send + 'static,
    {
        self.push_entry(name, args, Some(Box::new(callback)));
        self
    }

    /// Append a command through a mutable reference, for loops.
    pub fn push(&mut self, name: &str, args: Vec<Value>) -> &mut Self {
        self.push_entry(name, args, None);
        self
    }

    pub fn get(self, key: &str) -> Self {
        self.cmd("get", vec![key.into()])
    }

    pub fn set(self, key: &str, value: impl Into<Value>) -> Self {
        self.cmd("set", vec![key.into(), value.into()])
    }

    pub fn echo(self, message: impl Into<Value>) -> Self {
        self.cmd("echo", vec![message.into()])
    }

    pub fn incr(self, key: &str) -> Self {
        self.cmd("incr", vec![key.into()])
    }

    pub fn del(self, key: &str) -> Self {
        self.cmd("del", vec![key.into()])
    }

    pub fn expire(self, key: &str, seconds: u64) -> Self {
        self.cmd("expire", vec![key.into(), seconds.into()])
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn push_entry(&mut self, name: &str, args: Vec<Value>, callback: Option<EntryCallback>) {
        let resolved = match self.client.catalog().resolve(name, &args) {
            Ok((action, CommandKind::Generic)) => Ok(action),
            Ok((action, _)) => Err(CacheError::InvalidUsage(format!(
                "{} cannot be batched",
                action
            ))),
            Err(e) => Err(e),
        };
        match resolved {
            Ok(action) => {
                self.entries.push(BatchEntry::new(action, args));
                self.callbacks.push(callback);
            }
            Err(e) => {
                warn!(command = name, error = %e, "Rejected batch entry");
                if let Some(callback) = callback {
                    callback(Err(CacheError::InvalidUsage(e.to_string())));
                }
                self.invalid.get_or_insert(e);
            }
        }
    }

    /// Submit the batch. Resolves to one outcome per entry, in order.
    ///
    /// If any entry was rejected while building, nothing is sent and the
    /// first rejection is returned.
    pub fn exec(self) -> PendingReply<Vec<CacheResult<Value>>> {
        let Multi {
            client,
            entries,
            callbacks,
            invalid,
        } = self;

        if let Some(err) = invalid {
            let message = err.to_string();
            for callback in callbacks.into_iter().flatten() {
                callback(Err(CacheError::Batch(message.clone())));
            }
            return PendingReply::ready(Err(err));
        }
        if entries.is_empty() {
            return PendingReply::ready(Ok(Vec::new()));
        }

        let expected = entries.len();
        debug!(entries = expected, "Submitting batch");
        let batch = Value::Array(entries.into_iter().map(BatchEntry::into_value).collect());
        let (tx, rx) = oneshot::channel();
        client.dispatch(
            actions::MULTI.to_string(),
            vec![batch],
            Box::new(move |result| {
                let aggregate = match result.and_then(|value| decode_entries(value, expected)) {
                    Ok(replies) => {
                        for (reply, callback) in replies.iter().zip(callbacks) {
                            if let Some(callback) = callback {
                                callback(entry_outcome(reply));
                            }
                        }
                        Ok(replies.iter().map(entry_outcome).collect())
                    }
                    Err(e) => {
                        let message = e.to_string();
                        for callback in callbacks.into_iter().flatten() {
                            callback(Err(CacheError::Batch(message.clone())));
                        }
                        Err(e)
                    }
                };
                let _ = tx.send(aggregate);
            }),
        );
        PendingReply::waiting(rx)
    }
}

fn entry_outcome(reply: &BatchReply) -> CacheResult<Value> {
    match &reply.err {
        Some(message) => Err(CacheError::Command(message.clone())),
        None => Ok(reply.result.clone()),
    }
}

fn decode_entries(value: Value, expected: usize) -> CacheResult<Vec<BatchReply>> {
    let items = match value {
        Value::Array(items) => items,
        other => {
            return Err(CacheError::UnexpectedReply(format!(
                "batch reply is not a list: {}",
                other
            )))
        }
    };
    if items.len() != expected {
        return Err(CacheError::UnexpectedReply(format!(
            "batch of {} returned {} replies",
            expected,
            items.len()
        )));
    }
    items
        .iter()
        .map(|item| {
            BatchReply::from_value(item).ok_or_else(|| {
                CacheError::UnexpectedReply(format!("malformed batch entry: {}", item))
            })
        })
        .collect()
}
