//! Wire-level error taxonomy.
//!
//! Every error crossing the broker is tagged with one of these kinds so
//! callers can react without parsing human-readable messages. The kinds
//! mirror the service-side error enums; `ServiceError::kind()` performs
//! the mapping when a reply envelope is built.

use serde::{Deserialize, Serialize};

/// Taxonomy of error kinds carried in reply envelopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Broker or database unreachable.
    ConnectionError,
    /// Duplicate subjects, invalid interval, missing required field.
    ConfigurationError,
    /// Payload does not satisfy the declared schema.
    ValidationError,
    /// Reply not received within the timeout.
    RpcTimeout,
    /// Remote handler raised; message preserved.
    RpcError,
    /// Local handler raised unexpectedly.
    HandlerError,
    /// Access policy refused the credentials.
    AuthenticationError,
    /// Access policy refused the operation.
    AuthorizationError,
    /// Timer body raised; the timer continues.
    TimerExecutionError,
    /// Compensation itself failed; terminal.
    SagaCompensationError,
    /// Requested entity or target does not exist.
    NotFound,
}

impl ErrorKind {
    /// Stable wire tag for this kind (the serde snake_case name).
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ConnectionError => "connection_error",
            ErrorKind::ConfigurationError => "configuration_error",
            ErrorKind::ValidationError => "validation_error",
            ErrorKind::RpcTimeout => "rpc_timeout",
            ErrorKind::RpcError => "rpc_error",
            ErrorKind::HandlerError => "handler_error",
            ErrorKind::AuthenticationError => "authentication_error",
            ErrorKind::AuthorizationError => "authorization_error",
            ErrorKind::TimerExecutionError => "timer_execution_error",
            ErrorKind::SagaCompensationError => "saga_compensation_error",
            ErrorKind::NotFound => "not_found",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
