//! Wire envelope and reply forms.
//!
//! Every broker message carries a JSON envelope: the payload, the
//! correlation ID of the logical request, and an optional schema tag.
//! Replies come in two forms, discriminated by the presence of the
//! `error` field.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::correlation;
use crate::errors::ErrorKind;

/// Result type for envelope encode/decode.
pub type Result<T> = std::result::Result<T, EnvelopeError>;

/// Errors raised while encoding or decoding wire messages.
#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("malformed envelope: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Request envelope: payload plus correlation and optional schema tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Logical request ID; minted by the dispatcher when empty.
    #[serde(default)]
    pub correlation_id: String,
    /// Structured payload.
    pub payload: Value,
    /// Optional schema tag identifying the payload encoding.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,
}

impl Envelope {
    /// Wrap a payload with the ambient correlation ID (minted if absent).
    pub fn new(payload: Value) -> Self {
        Self {
            correlation_id: correlation::current_or_mint(),
            payload,
            schema: None,
        }
    }

    /// Wrap a payload with an explicit correlation ID.
    pub fn with_correlation(correlation_id: impl Into<String>, payload: Value) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            payload,
            schema: None,
        }
    }

    /// Attach a schema tag.
    pub fn with_schema(mut self, tag: impl Into<String>) -> Self {
        self.schema = Some(tag.into());
        self
    }

    /// Correlation ID, minting a fresh one when the inbound was empty.
    pub fn correlation_or_mint(&self) -> String {
        if self.correlation_id.is_empty() {
            correlation::mint()
        } else {
            self.correlation_id.clone()
        }
    }

    /// Serialize to wire bytes.
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Deserialize from wire bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// A remote failure decoded from an error reply.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteError {
    pub kind: ErrorKind,
    pub message: String,
    pub details: Value,
}

impl std::fmt::Display for RemoteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Reply envelope: either a result or a taxonomy-tagged error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Reply {
    Err {
        correlation_id: String,
        error: ErrorKind,
        message: String,
        #[serde(default)]
        details: Value,
    },
    Ok {
        correlation_id: String,
        result: Value,
    },
}

impl Reply {
    /// Successful reply carrying the ambient correlation ID.
    pub fn ok(result: Value) -> Self {
        Reply::Ok {
            correlation_id: correlation::current_or_mint(),
            result,
        }
    }

    /// Error reply carrying the ambient correlation ID.
    pub fn error(kind: ErrorKind, message: impl Into<String>) -> Self {
        Reply::Err {
            correlation_id: correlation::current_or_mint(),
            error: kind,
            message: message.into(),
            details: Value::Null,
        }
    }

    /// Error reply with structured details.
    pub fn error_with_details(kind: ErrorKind, message: impl Into<String>, details: Value) -> Self {
        Reply::Err {
            correlation_id: correlation::current_or_mint(),
            error: kind,
            message: message.into(),
            details,
        }
    }

    /// Correlation ID carried by this reply.
    pub fn correlation_id(&self) -> &str {
        match self {
            Reply::Ok { correlation_id, .. } | Reply::Err { correlation_id, .. } => correlation_id,
        }
    }

    /// Serialize to wire bytes.
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Deserialize from wire bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Collapse into the caller-facing result.
    pub fn into_result(self) -> std::result::Result<Value, RemoteError> {
        match self {
            Reply::Ok { result, .. } => Ok(result),
            Reply::Err {
                error,
                message,
                details,
                ..
            } => Err(RemoteError {
                kind: error,
                message,
                details,
            }),
        }
    }
}

/// A typed broadcast message.
///
/// The subject is derived from the message type name, so every
/// subscriber of the type receives a copy without agreeing on a subject
/// string out of band.
pub trait Broadcast: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Type name used for subject derivation (e.g. `"OrderShipped"`).
    fn message_type() -> &'static str;

    /// Subject this type is broadcast on.
    fn subject() -> String {
        broadcast_subject(Self::message_type())
    }
}

/// Subject for a broadcast message type name.
pub fn broadcast_subject(type_name: &str) -> String {
    format!("broadcast.{}", type_name.to_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_envelope_round_trip() {
        let envelope = Envelope::with_correlation("abc123", json!({"a": 2, "b": [1, 2, 3]}))
            .with_schema("calc.add.v1");
        let decoded = Envelope::decode(&envelope.encode().unwrap()).unwrap();
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn test_envelope_decode_without_correlation() {
        let decoded = Envelope::decode(br#"{"payload": {"x": 1}}"#).unwrap();
        assert!(decoded.correlation_id.is_empty());
        assert_eq!(decoded.correlation_or_mint().len(), 32);
    }

    #[test]
    fn test_envelope_decode_rejects_garbage() {
        assert!(Envelope::decode(b"not json").is_err());
        assert!(Envelope::decode(br#"{"no_payload": true}"#).is_err());
    }

    #[test]
    fn test_reply_ok_round_trip() {
        let reply = Reply::Ok {
            correlation_id: "abc".to_string(),
            result: json!(5),
        };
        let decoded = Reply::decode(&reply.encode().unwrap()).unwrap();
        assert_eq!(decoded.into_result().unwrap(), json!(5));
    }

    #[test]
    fn test_reply_err_round_trip() {
        let reply = Reply::Err {
            correlation_id: "abc".to_string(),
            error: ErrorKind::ValidationError,
            message: "username too short".to_string(),
            details: json!({"field": "username"}),
        };
        let decoded = Reply::decode(&reply.encode().unwrap()).unwrap();
        let err = decoded.into_result().unwrap_err();
        assert_eq!(err.kind, ErrorKind::ValidationError);
        assert!(err.message.contains("username"));
        assert_eq!(err.details, json!({"field": "username"}));
    }

    #[test]
    fn test_reply_discrimination_on_error_field() {
        // A result payload containing an "error"-looking value must still
        // decode as Ok because it sits under "result".
        let wire = br#"{"correlation_id": "c", "result": {"error": "nope"}}"#;
        let decoded = Reply::decode(wire).unwrap();
        assert!(decoded.into_result().is_ok());
    }

    #[test]
    fn test_broadcast_subject_lowercases_type_name() {
        assert_eq!(broadcast_subject("OrderShipped"), "broadcast.ordershipped");
    }
}
