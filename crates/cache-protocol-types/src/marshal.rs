//! Buffer-aware conversion between [`Value`] and JSON.
//!
//! Binary payloads travel as `{"flavor":"buffer","base64":"..."}`. Inbound,
//! the legacy `{"type":"Buffer","data":[...]}` shape is accepted as well.
//! Everything else maps onto the obvious JSON type, recursively.

use crate::Value;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde_json::{Map, Number};
use std::collections::BTreeMap;
use thiserror::Error;

/// Errors produced while decoding a marshaled payload.
#[derive(Error, Debug)]
pub enum MarshalError {
    /// `base64` field of a buffer envelope did not decode
    #[error("Invalid base64 buffer: {0}")]
    Base64(#[from] base64::DecodeError),

    /// Legacy buffer envelope with non-byte entries
    #[error("Invalid buffer payload: {0}")]
    Buffer(String),

    /// NaN and infinities have no JSON representation
    #[error("Cannot encode non-finite number: {0}")]
    NonFinite(f64),
}

/// Result type alias using MarshalError.
pub type MarshalResult<T> = Result<T, MarshalError>;

const FLAVOR_KEY: &str = "flavor";
const FLAVOR_BUFFER: &str = "buffer";
const BASE64_KEY: &str = "base64";

/// Encode a value for the wire.
///
/// Non-finite floats encode as `null`; use [`try_marshal_args`] where that
/// loss must be refused.
pub fn marshal(value: &Value) -> serde_json::Value {
    match value {
        Value::Nil => serde_json::Value::Null,
        Value::Bool(b) => serde_json::Value::Bool(*b),
        Value::Int(n) => serde_json::Value::Number((*n).into()),
        Value::Float(x) => Number::from_f64(*x)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        Value::Str(s) => serde_json::Value::String(s.clone()),
        Value::Bytes(bytes) => {
            let mut envelope = Map::new();
            envelope.insert(FLAVOR_KEY.into(), FLAVOR_BUFFER.into());
            envelope.insert(BASE64_KEY.into(), STANDARD.encode(bytes).into());
            serde_json::Value::Object(envelope)
        }
        Value::Array(items) => serde_json::Value::Array(items.iter().map(marshal).collect()),
        Value::Map(map) => serde_json::Value::Object(
            map.iter()
                .map(|(key, item)| (key.clone(), marshal(item)))
                .collect(),
        ),
    }
}

/// Encode an argument list.
pub fn marshal_args(args: &[Value]) -> Vec<serde_json::Value> {
    args.iter().map(marshal).collect()
}

/// Encode an argument list, refusing values JSON cannot carry.
pub fn try_marshal_args(args: &[Value]) -> MarshalResult<Vec<serde_json::Value>> {
    args.iter().try_for_each(ensure_encodable)?;
    Ok(marshal_args(args))
}

fn ensure_encodable(value: &Value) -> MarshalResult<()> {
    match value {
        Value::Float(x) if !x.is_finite() => Err(MarshalError::NonFinite(*x)),
        Value::Array(items) => items.iter().try_for_each(ensure_encodable),
        Value::Map(map) => map.values().try_for_each(ensure_encodable),
        _ => Ok(()),
    }
}

/// Decode a wire payload.
pub fn unmarshal(json: serde_json::Value) -> MarshalResult<Value> {
    Ok(match json {
        serde_json::Value::Null => Value::Nil,
        serde_json::Value::Bool(b) => Value::Bool(b),
        serde_json::Value::Number(n) => match n.as_i64() {
            Some(i) => Value::Int(i),
            None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
        },
        serde_json::Value::String(s) => Value::Str(s),
        serde_json::Value::Array(items) => Value::Array(
            items
                .into_iter()
                .map(unmarshal)
                .collect::<MarshalResult<Vec<_>>>()?,
        ),
        serde_json::Value::Object(object) => unmarshal_object(object)?,
    })
}

fn unmarshal_object(object: Map<String, serde_json::Value>) -> MarshalResult<Value> {
    if object.get(FLAVOR_KEY).and_then(|v| v.as_str()) == Some(FLAVOR_BUFFER) {
        if let Some(encoded) = object.get(BASE64_KEY).and_then(|v| v.as_str()) {
            return Ok(Value::Bytes(STANDARD.decode(encoded)?));
        }
    }

    if object.get("type").and_then(|v| v.as_str()) == Some("Buffer") {
        if let Some(data) = object.get("data").and_then(|v| v.as_array()) {
            let bytes = data
                .iter()
                .map(|b| {
                    b.as_u64()
                        .and_then(|n| u8::try_from(n).ok())
                        .ok_or_else(|| MarshalError::Buffer(format!("not a byte: {}", b)))
                })
                .collect::<MarshalResult<Vec<u8>>>()?;
            return Ok(Value::Bytes(bytes));
        }
    }

    let mut map = BTreeMap::new();
    for (key, item) in object {
        map.insert(key, unmarshal(item)?);
    }
    Ok(Value::Map(map))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_bytes_use_buffer_envelope() {
        let encoded = marshal(&Value::Bytes(b"OK".to_vec()));
        assert_eq!(encoded, json!({"flavor": "buffer", "base64": "T0s="}));
    }

    #[test]
    fn test_nested_buffers_survive_round_trip() {
        let original = Value::Array(vec![
            Value::from("plain"),
            Value::Array(vec![
                Value::Bytes(vec![0, 1, 2, 255]),
                Value::Array(vec![Value::Bytes(b"deep".to_vec())]),
            ]),
        ]);
        let decoded = unmarshal(marshal(&original)).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn test_legacy_buffer_shape() {
        let decoded = unmarshal(json!({"type": "Buffer", "data": [79, 75]})).unwrap();
        assert_eq!(decoded, Value::Bytes(b"OK".to_vec()));
    }

    #[test]
    fn test_legacy_buffer_rejects_non_bytes() {
        let result = unmarshal(json!({"type": "Buffer", "data": [79, 300]}));
        assert!(matches!(result, Err(MarshalError::Buffer(_))));
    }

    #[test]
    fn test_invalid_base64_is_an_error() {
        let result = unmarshal(json!({"flavor": "buffer", "base64": "!!!"}));
        assert!(matches!(result, Err(MarshalError::Base64(_))));
    }

    #[test]
    fn test_plain_objects_pass_through() {
        let decoded = unmarshal(json!({"flavor": "vanilla", "n": 1})).unwrap();
        assert_eq!(decoded.get("flavor"), Some(&Value::from("vanilla")));
        assert_eq!(decoded.get("n"), Some(&Value::Int(1)));
    }

    #[test]
    fn test_scalars() {
        assert_eq!(unmarshal(json!(null)).unwrap(), Value::Nil);
        assert_eq!(unmarshal(json!(1.5)).unwrap(), Value::Float(1.5));
        assert_eq!(unmarshal(json!(-7)).unwrap(), Value::Int(-7));
        assert_eq!(marshal(&Value::Float(f64::NAN)), json!(null));
    }

    #[test]
    fn test_non_finite_floats_are_refused() {
        let nested = vec![
            Value::from("k"),
            Value::Array(vec![Value::Float(f64::INFINITY)]),
        ];
        assert!(matches!(
            try_marshal_args(&nested),
            Err(MarshalError::NonFinite(x)) if x.is_infinite()
        ));
        assert_eq!(
            try_marshal_args(&[Value::Float(1.5)]).unwrap(),
            vec![json!(1.5)]
        );
    }
}
