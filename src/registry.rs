//! Handler registry.
//!
//! Handlers are registered explicitly against their subjects (no runtime
//! reflection); the registry derives subjects from the service name and
//! method name, enforces per-service subject uniqueness, and is frozen
//! once the service starts.
//!
//! Subject derivation:
//! - RPC: `<service>.rpc.<method>`
//! - Async RPC: `<service>.async.<method>`
//! - Event listener: explicit pattern (`*` one token, `>` tail)
//! - Broadcast: `broadcast.<lowercased-type-name>`

use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::Value;

use crate::broker::subject::{validate_pattern, validate_subject};
use crate::schema::Schema;
use crate::service::ServiceError;

/// Decoded inbound message handed to a handler.
///
/// Carries the concrete subject so wildcard listeners can tell which
/// subject actually matched their pattern.
#[derive(Debug, Clone)]
pub struct InboundRequest {
    pub subject: String,
    pub payload: Value,
}

/// Future returned by a handler invocation.
pub type HandlerFuture = BoxFuture<'static, Result<Value, ServiceError>>;

/// Type-erased handler: JSON payload in, JSON result (or error) out.
pub type HandlerFn = Arc<dyn Fn(InboundRequest) -> HandlerFuture + Send + Sync>;

/// Classification of a registered handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerKind {
    /// Request/reply on `<service>.rpc.<method>`.
    Rpc,
    /// Fire-and-forget on `<service>.async.<method>`.
    AsyncRpc,
    /// Pattern subscription to arbitrary subjects.
    Event,
    /// Typed fanout on `broadcast.<type>`.
    Broadcast,
}

/// A handler bound to its subject.
#[derive(Clone)]
pub struct HandlerDescriptor {
    pub kind: HandlerKind,
    pub subject: String,
    /// Whether the dispatcher answers on the reply inbox.
    pub expects_reply: bool,
    /// Value-level constraints checked before the handler runs.
    pub request_schema: Option<Schema>,
    /// Schema tag stamped on replies.
    pub response_schema: Option<String>,
    pub handler: HandlerFn,
}

impl std::fmt::Debug for HandlerDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerDescriptor")
            .field("kind", &self.kind)
            .field("subject", &self.subject)
            .field("expects_reply", &self.expects_reply)
            .finish()
    }
}

/// Subject for an RPC method.
pub fn rpc_subject(service: &str, method: &str) -> String {
    format!("{}.rpc.{}", service, method)
}

/// Subject for an async (no-reply) method.
pub fn async_subject(service: &str, method: &str) -> String {
    format!("{}.async.{}", service, method)
}

/// Handler table of one service; read-only after start.
#[derive(Default)]
pub struct HandlerRegistry {
    descriptors: Vec<HandlerDescriptor>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, refusing duplicate subjects.
    ///
    /// Event patterns are validated as patterns; every other kind must
    /// carry a concrete subject. Method names are case-sensitive, so
    /// `Add` and `add` are distinct subjects.
    pub fn register(&mut self, descriptor: HandlerDescriptor) -> Result<(), ServiceError> {
        match descriptor.kind {
            HandlerKind::Event => validate_pattern(&descriptor.subject)
                .map_err(|e| ServiceError::Configuration(e.to_string()))?,
            _ => validate_subject(&descriptor.subject)
                .map_err(|e| ServiceError::Configuration(e.to_string()))?,
        }

        if self.descriptors.iter().any(|d| d.subject == descriptor.subject) {
            return Err(ServiceError::Configuration(format!(
                "duplicate subject '{}'",
                descriptor.subject
            )));
        }

        self.descriptors.push(descriptor);
        Ok(())
    }

    /// Registered descriptors in registration order.
    pub fn descriptors(&self) -> &[HandlerDescriptor] {
        &self.descriptors
    }

    /// Registered subjects in registration order.
    pub fn subjects(&self) -> impl Iterator<Item = &str> {
        self.descriptors.iter().map(|d| d.subject.as_str())
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_handler() -> HandlerFn {
        Arc::new(|_request| Box::pin(async { Ok(Value::Null) }))
    }

    fn descriptor(kind: HandlerKind, subject: &str) -> HandlerDescriptor {
        HandlerDescriptor {
            kind,
            subject: subject.to_string(),
            expects_reply: matches!(kind, HandlerKind::Rpc),
            request_schema: None,
            response_schema: None,
            handler: noop_handler(),
        }
    }

    #[test]
    fn test_subject_derivation() {
        assert_eq!(rpc_subject("calc", "add"), "calc.rpc.add");
        assert_eq!(async_subject("audit", "log_event"), "audit.async.log_event");
    }

    #[test]
    fn test_duplicate_subject_refused() {
        let mut registry = HandlerRegistry::new();
        registry
            .register(descriptor(HandlerKind::Rpc, "calc.rpc.add"))
            .unwrap();
        let err = registry
            .register(descriptor(HandlerKind::Rpc, "calc.rpc.add"))
            .unwrap_err();
        assert!(matches!(err, ServiceError::Configuration(_)));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_method_names_case_sensitive() {
        let mut registry = HandlerRegistry::new();
        registry
            .register(descriptor(HandlerKind::Rpc, rpc_subject("calc", "add").as_str()))
            .unwrap();
        registry
            .register(descriptor(HandlerKind::Rpc, rpc_subject("calc", "Add").as_str()))
            .unwrap();
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_same_handler_multiple_patterns() {
        let mut registry = HandlerRegistry::new();
        let handler = noop_handler();
        for pattern in ["orders.>", "inventory.*.changed"] {
            registry
                .register(HandlerDescriptor {
                    kind: HandlerKind::Event,
                    subject: pattern.to_string(),
                    expects_reply: false,
                    request_schema: None,
                    response_schema: None,
                    handler: handler.clone(),
                })
                .unwrap();
        }
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_event_pattern_validated() {
        let mut registry = HandlerRegistry::new();
        assert!(registry
            .register(descriptor(HandlerKind::Event, "orders.>.bad"))
            .is_err());
    }

    #[test]
    fn test_rpc_subject_must_be_concrete() {
        let mut registry = HandlerRegistry::new();
        assert!(registry
            .register(descriptor(HandlerKind::Rpc, "calc.rpc.*"))
            .is_err());
    }
}
