//! Close status codes and closure details.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;

use serde::{Deserialize, Serialize};

// ============================================================================
// Close Codes
// ============================================================================

/// WebSocket close status codes used by the client (RFC 6455 §7.4.1).
pub mod codes {
    /// Intentional shutdown. The only code that counts as a clean closure.
    pub const NORMAL_CLOSURE: u16 = 1000;
    /// Endpoint going away.
    pub const GOING_AWAY: u16 = 1001;
    /// Close frame without a status code.
    pub const NO_STATUS: u16 = 1005;
    /// Connection dropped without a close frame.
    pub const ABNORMAL_CLOSURE: u16 = 1006;
}

// ============================================================================
// CloseInfo
// ============================================================================

/// Details of a transport closure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloseInfo {
    /// Close status code.
    pub code: u16,
    /// Human-readable reason.
    pub reason: String,
    /// Whether a closing handshake completed.
    pub was_clean: bool,
}

impl CloseInfo {
    /// Creates closure details.
    #[inline]
    #[must_use]
    pub fn new(code: u16, reason: impl Into<String>, was_clean: bool) -> Self {
        Self {
            code,
            reason: reason.into(),
            was_clean,
        }
    }

    /// A clean, normal closure.
    #[inline]
    #[must_use]
    pub fn normal(reason: impl Into<String>) -> Self {
        Self::new(codes::NORMAL_CLOSURE, reason, true)
    }

    /// An abnormal closure (1006), as reported for dropped connections and
    /// failed opens.
    #[inline]
    #[must_use]
    pub fn abnormal(reason: impl Into<String>) -> Self {
        Self::new(codes::ABNORMAL_CLOSURE, reason, false)
    }

    /// Returns `true` for the normal closure code.
    ///
    /// Only a normal closure suppresses reconnection.
    #[inline]
    #[must_use]
    pub fn is_normal(&self) -> bool {
        self.code == codes::NORMAL_CLOSURE
    }
}

impl fmt::Display for CloseInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.reason.is_empty() {
            write!(f, "code {}", self.code)
        } else {
            write!(f, "code {}: {}", self.code, self.reason)
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normal_is_clean() {
        let close = CloseInfo::normal("bye");
        assert!(close.is_normal());
        assert!(close.was_clean);
    }

    #[test]
    fn test_only_1000_is_normal() {
        for code in [codes::GOING_AWAY, codes::NO_STATUS, codes::ABNORMAL_CLOSURE] {
            assert!(!CloseInfo::new(code, "", true).is_normal());
        }
    }

    #[test]
    fn test_serializes_camel_case() {
        let value = serde_json::to_value(CloseInfo::abnormal("reset")).unwrap();
        assert_eq!(
            value,
            serde_json::json!({ "code": 1006, "reason": "reset", "wasClean": false })
        );
    }

    #[test]
    fn test_display() {
        assert_eq!(CloseInfo::new(1006, "", false).to_string(), "code 1006");
        assert_eq!(CloseInfo::normal("bye").to_string(), "code 1000: bye");
    }
}
