//! Courier - Microservice framework over subject-based messaging
//!
//! Services declare RPC, event, broadcast and timer handlers against a
//! NATS-style broker; a runner supervises many services in one process,
//! and a saga coordinator drives distributed transactions with
//! reverse-order compensation. A correlation ID follows every logical
//! request across RPC calls, events, timers, HTTP and WebSockets.

pub mod broker;
pub mod config;
pub mod correlation;
pub mod errors;
#[cfg(feature = "http")]
pub mod http;
pub mod logging;
pub mod message;
#[cfg(feature = "otel")]
pub mod metrics;
pub mod registry;
#[cfg(feature = "postgres")]
pub mod repository;
pub mod retry;
pub mod runner;
pub mod saga;
pub mod schema;
pub mod service;
pub mod timer;

pub use broker::{Broker, BrokerError, ChannelBroker, Delivery, Subscription};
#[cfg(feature = "nats")]
pub use broker::NatsBroker;
pub use config::{RunnerConfig, ServiceConfig};
pub use errors::ErrorKind;
pub use message::{Broadcast, Envelope, Reply};
pub use retry::{retry, RetryConfig};
pub use runner::{ServiceRunner, ShutdownHandle};
pub use saga::{
    ChoreographySaga, MemorySagaStore, SagaContext, SagaCoordinator, SagaDefinition, SagaState,
    SagaStep, SagaStore, StepState,
};
pub use schema::{FieldRule, Schema};
pub use service::{
    AllowAll, AuthPolicy, Lifecycle, RpcCaller, Service, ServiceBuilder, ServiceError,
};
pub use timer::{TimerSnapshot, TimerSpec};
