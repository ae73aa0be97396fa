//! OTel-native metrics instruments.
//!
//! Centralized metric definitions using OpenTelemetry meters.
//! All instruments are lazily initialized and feature-gated behind `otel`.
//!
//! Naming follows OTel semantic conventions (dot-separated).
//! The OTel Collector / Prometheus exporter converts dots to underscores.

use std::sync::LazyLock;

use opentelemetry::metrics::{Counter, Histogram, Meter};
use opentelemetry::{global, KeyValue};

static METER: LazyLock<Meter> = LazyLock::new(|| global::meter("courier"));

// ============================================================================
// Dispatch
// ============================================================================

/// Total inbound messages dispatched to handlers.
pub static DISPATCH_TOTAL: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("courier.dispatch.total")
        .with_description("Total inbound messages dispatched")
        .build()
});

/// Duration of handler execution.
pub static DISPATCH_DURATION: LazyLock<Histogram<f64>> = LazyLock::new(|| {
    METER
        .f64_histogram("courier.dispatch.duration")
        .with_description("Handler execution duration")
        .with_unit("s")
        .build()
});

// ============================================================================
// Outbound
// ============================================================================

/// Total publishes (events, broadcasts, async calls).
pub static PUBLISH_TOTAL: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("courier.publish.total")
        .with_description("Total outbound publishes")
        .build()
});

/// Duration of outbound RPC calls, reply included.
pub static RPC_DURATION: LazyLock<Histogram<f64>> = LazyLock::new(|| {
    METER
        .f64_histogram("courier.rpc.duration")
        .with_description("Outbound RPC duration")
        .with_unit("s")
        .build()
});

// ============================================================================
// Timers
// ============================================================================

/// Total timer firings.
pub static TIMER_EXECUTION_TOTAL: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("courier.timer.execution.total")
        .with_description("Total timer executions")
        .build()
});

// ============================================================================
// Saga
// ============================================================================

/// Total saga retry attempts.
pub static SAGA_RETRY_TOTAL: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("courier.saga.retry.total")
        .with_description("Total saga retry attempts")
        .build()
});

/// Total saga compensations triggered.
pub static SAGA_COMPENSATION_TOTAL: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("courier.saga.compensation.total")
        .with_description("Total saga compensations triggered")
        .build()
});

// ============================================================================
// Helper
// ============================================================================

/// Create a service label.
pub fn service_attr(service: &str) -> KeyValue {
    KeyValue::new("service", service.to_string())
}

/// Create a subject label.
pub fn subject_attr(subject: &str) -> KeyValue {
    KeyValue::new("subject", subject.to_string())
}

/// Create a saga_type label.
pub fn saga_type_attr(saga_type: &str) -> KeyValue {
    KeyValue::new("saga_type", saga_type.to_string())
}

/// Create an outcome label.
pub fn outcome_attr(outcome: &str) -> KeyValue {
    KeyValue::new("outcome", outcome.to_string())
}
