//! Payload encoding between application values and raw frames.
//!
//! The client treats payloads as opaque [`Value`]s; a [`PayloadCodec`]
//! turns them into text frames and back.

// ============================================================================
// Imports
// ============================================================================

use serde_json::{Value, from_str, to_string};

use crate::error::Result;

// ============================================================================
// PayloadCodec
// ============================================================================

/// Converts payloads to and from raw frames.
pub trait PayloadCodec: Send + Sync + 'static {
    /// Encodes an outbound payload.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload cannot be represented.
    fn encode(&self, payload: &Value) -> Result<String>;

    /// Decodes an inbound frame. Never fails; undecodable input is passed
    /// through in whatever form the codec chooses.
    fn decode(&self, raw: &str) -> Value;
}

// ============================================================================
// JsonCodec
// ============================================================================

/// JSON text frames.
///
/// Inbound frames that are not valid JSON decode to a string value, so a
/// bare `ping` frame arrives as `"ping"`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl PayloadCodec for JsonCodec {
    fn encode(&self, payload: &Value) -> Result<String> {
        Ok(to_string(payload)?)
    }

    fn decode(&self, raw: &str) -> Value {
        from_str(raw).unwrap_or_else(|_| Value::String(raw.to_owned()))
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;

    #[test]
    fn test_encode_object() {
        let raw = JsonCodec
            .encode(&json!({ "type": "test", "payload": "hello" }))
            .unwrap();
        assert_eq!(raw, r#"{"payload":"hello","type":"test"}"#);
    }

    #[test]
    fn test_encode_string_is_quoted() {
        assert_eq!(JsonCodec.encode(&json!("pong")).unwrap(), r#""pong""#);
    }

    #[test]
    fn test_decode_json() {
        assert_eq!(
            JsonCodec.decode(r#"{"data":"test message"}"#),
            json!({ "data": "test message" })
        );
    }

    #[test]
    fn test_decode_falls_back_to_string() {
        assert_eq!(JsonCodec.decode("ping"), json!("ping"));
        assert_eq!(JsonCodec.decode("{broken"), json!("{broken"));
    }
}
