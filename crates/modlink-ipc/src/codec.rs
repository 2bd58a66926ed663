//! Payload encoding.
//!
//! Payloads are JSON text. Values JSON has no type for are wrapped in a
//! single-key object: `{"$date": "<rfc3339>"}` for timestamps and
//! `{"$error": {"message": ..., "stack": ...}}` for errors.

use chrono::{DateTime, Utc};
use modlink_core::{RemoteError, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireDate {
    #[serde(rename = "$date")]
    pub date: DateTime<Utc>,
}

impl From<DateTime<Utc>> for WireDate {
    fn from(date: DateTime<Utc>) -> Self {
        WireDate { date }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireError {
    #[serde(rename = "$error")]
    pub error: RemoteError,
}

pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    Ok(serde_json::to_string(value)?)
}

/// Decode a payload into any deserializable type. An empty payload decodes
/// as `null`.
pub fn decode<T: DeserializeOwned>(text: &str) -> Result<T> {
    let value = decode_value(text)?;
    Ok(serde_json::from_value(value)?)
}

pub fn decode_value(text: &str) -> Result<Value> {
    if text.trim().is_empty() {
        return Ok(Value::Null);
    }
    Ok(serde_json::from_str(text)?)
}

pub fn encode_error(err: &RemoteError) -> String {
    let wire = WireError { error: err.clone() };
    // two strings; serialization cannot fail
    serde_json::to_string(&wire).unwrap_or_default()
}

/// Rebuild an error from a failure payload, accepting a bare string or a
/// plain `{message, stack}` object as well as the wrapped form.
pub fn decode_error(text: &str) -> RemoteError {
    let value = match decode_value(text) {
        Ok(v) => v,
        Err(_) => return RemoteError::new(text.to_string()),
    };
    if let Ok(wire) = serde_json::from_value::<WireError>(value.clone()) {
        return wire.error;
    }
    if let Ok(plain) = serde_json::from_value::<RemoteError>(value.clone()) {
        return plain;
    }
    match value {
        Value::String(message) => RemoteError::new(message),
        Value::Null => RemoteError::new("unknown error"),
        other => RemoteError::new(other.to_string()),
    }
}

/// Decode a payload that is expected to be a specific type, mapping failures
/// to a message fit for the remote side.
pub fn decode_for_call<T: DeserializeOwned>(
    name: &str,
    value: Value,
) -> std::result::Result<T, RemoteError> {
    serde_json::from_value(value)
        .map_err(|e| RemoteError::new(format!("invalid payload for '{name}': {e}")))
}
