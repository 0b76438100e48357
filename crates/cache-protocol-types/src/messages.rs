//! Cache service protocol messages.

use crate::marshal::{try_marshal_args, unmarshal, MarshalResult};
use crate::Value;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Event names exchanged with the service.
pub mod events {
    pub const COMMAND: &str = "command";
    pub const AUTHENTICATE: &str = "authenticate";
    pub const AUTHENTICATED: &str = "authenticated";
    pub const REGISTER: &str = "register";
    pub const PING: &str = "ping";
    pub const PONG: &str = "pong";
    pub const DISCONNECTING: &str = "disconnecting";
    pub const MESSAGE: &str = "message";
    pub const PMESSAGE: &str = "pmessage";
}

/// Actions that are not part of the public command catalog.
pub mod actions {
    pub const MULTI: &str = "multi";
    pub const LOCK: &str = "lock";
    pub const UNLOCK: &str = "unlock";
    pub const EXTEND: &str = "extend";
}

/// Payload of a `command` request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandRequest {
    pub action: String,
    pub args: Vec<serde_json::Value>,
    pub namespace: i64,
}

impl CommandRequest {
    /// Build a request, marshaling `args` for the wire. Fails on values
    /// JSON cannot carry, such as NaN.
    pub fn new(action: &str, args: &[Value], namespace: i64) -> MarshalResult<Self> {
        Ok(Self {
            action: action.to_string(),
            args: try_marshal_args(args)?,
            namespace,
        })
    }

    /// Decode the arguments back into native values.
    pub fn decode_args(&self) -> MarshalResult<Vec<Value>> {
        self.args.iter().cloned().map(unmarshal).collect()
    }

    pub fn to_json(&self) -> serde_json::Result<serde_json::Value> {
        serde_json::to_value(self)
    }

    pub fn from_json(json: serde_json::Value) -> serde_json::Result<Self> {
        serde_json::from_value(json)
    }
}

/// Structured reply to a `command` request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl CommandResponse {
    /// A successful reply carrying `data`.
    pub fn ok(data: &Value) -> Self {
        Self {
            success: true,
            message: None,
            data: Some(crate::marshal(data)),
        }
    }

    /// A failed reply carrying `message`.
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: Some(message.into()),
            data: None,
        }
    }

    pub fn to_json(&self) -> serde_json::Result<serde_json::Value> {
        serde_json::to_value(self)
    }

    pub fn from_json(json: serde_json::Value) -> serde_json::Result<Self> {
        serde_json::from_value(json)
    }
}

/// Client network addresses sent during authentication.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkAddresses {
    pub public_address: String,
    pub private_address: String,
}

impl NetworkAddresses {
    pub fn loopback() -> Self {
        Self {
            public_address: "127.0.0.1".to_string(),
            private_address: "127.0.0.1".to_string(),
        }
    }
}

/// Payload of the `authenticate` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthRequest {
    /// Device fingerprint.
    pub uuid: String,
    pub key: String,
    /// base64(HMAC-SHA256(secret, key))
    pub signature: String,
    pub address: NetworkAddresses,
}

impl AuthRequest {
    pub fn to_json(&self) -> serde_json::Result<serde_json::Value> {
        serde_json::to_value(self)
    }

    pub fn from_json(json: serde_json::Value) -> serde_json::Result<Self> {
        serde_json::from_value(json)
    }
}

/// One entry of a batch submitted under the `multi` action.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchEntry {
    pub command: String,
    pub args: Vec<Value>,
}

impl BatchEntry {
    pub fn new(command: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            command: command.into(),
            args,
        }
    }

    pub fn into_value(self) -> Value {
        let mut map = BTreeMap::new();
        map.insert("command".to_string(), Value::Str(self.command));
        map.insert("args".to_string(), Value::Array(self.args));
        Value::Map(map)
    }

    pub fn from_value(value: &Value) -> Option<Self> {
        let command = value.get("command")?.as_str()?.to_string();
        let args = match value.get("args") {
            Some(Value::Array(items)) => items.clone(),
            Some(Value::Nil) | None => Vec::new(),
            Some(_) => return None,
        };
        Some(Self { command, args })
    }
}

/// Per-entry outcome of a batch.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchReply {
    pub err: Option<String>,
    pub result: Value,
}

impl BatchReply {
    pub fn ok(result: Value) -> Self {
        Self { err: None, result }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            err: Some(message.into()),
            result: Value::Nil,
        }
    }

    pub fn into_value(self) -> Value {
        let mut map = BTreeMap::new();
        map.insert("err".to_string(), self.err.map(Value::Str).unwrap_or(Value::Nil));
        map.insert("result".to_string(), self.result);
        Value::Map(map)
    }

    /// Decode a reply entry. An `err` field may be a string or an error
    /// object with a `message`.
    pub fn from_value(value: &Value) -> Option<Self> {
        let map = value.as_map()?;
        let err = match map.get("err") {
            None | Some(Value::Nil) => None,
            Some(Value::Str(s)) => Some(s.clone()),
            Some(other) => Some(
                other
                    .get("message")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| other.to_string()),
            ),
        };
        let result = map.get("result").cloned().unwrap_or_default();
        Some(Self { err, result })
    }
}

/// Envelope for every message on the WebSocket wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransportFrame {
    /// Fire-and-forget event.
    Event {
        event: String,
        #[serde(default)]
        args: Vec<serde_json::Value>,
    },
    /// Event expecting an `Ack` with the same id.
    Request {
        id: u64,
        event: String,
        payload: serde_json::Value,
    },
    /// Reply to a `Request`.
    Ack {
        id: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<serde_json::Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        response: Option<serde_json::Value>,
    },
    /// The peer is dropping the connection.
    Disconnect {
        reason: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
}

impl TransportFrame {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }
}
