//! The decrypted logical message

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Message envelope exchanged between pipeline steps.
///
/// Headers travel inside the encrypted content; the transport-level copy
/// of routing metadata lives in the broker message properties.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Free-form string headers
    #[serde(default)]
    pub headers: HashMap<String, String>,

    /// Payload (arbitrary JSON)
    #[serde(default)]
    pub body: serde_json::Value,
}

impl Envelope {
    /// Create an envelope with the given body and no headers
    pub fn new(body: serde_json::Value) -> Self {
        Self {
            headers: HashMap::new(),
            body,
        }
    }

    /// Add a header
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }
}

/// Error object published on the error path.
///
/// Mirrors the wire shape consumers of the error queue expect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorReport {
    /// Error class name
    pub name: String,

    /// Human-readable message
    pub message: String,

    /// Optional backtrace text
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl ErrorReport {
    /// Create a report with the given name and message
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            stack: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_envelope_builder() {
        let envelope = Envelope::new(json!({"value": 42})).with_header("source", "step-1");

        assert_eq!(envelope.body["value"], 42);
        assert_eq!(envelope.headers["source"], "step-1");
    }

    #[test]
    fn test_envelope_missing_fields_default() {
        let envelope: Envelope = serde_json::from_str("{}").unwrap();
        assert!(envelope.headers.is_empty());
        assert!(envelope.body.is_null());
    }

    #[test]
    fn test_error_report_omits_absent_stack() {
        let report = ErrorReport::new("Error", "boom");
        let value = serde_json::to_value(&report).unwrap();

        assert_eq!(value["name"], "Error");
        assert!(value.get("stack").is_none());
    }
}
