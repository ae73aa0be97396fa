//! Service kernel.
//!
//! This module contains:
//! - `ServiceError`: service-level error enum mapped onto the wire taxonomy
//! - `ServiceBuilder`: explicit handler/timer registration
//! - `Service`: lifecycle, subscription wiring, inbound dispatch, outbound calls
//! - `AuthPolicy`: access policy hook run before validation and dispatch
//!
//! A service binds its handler table to the broker at `start()`:
//! subscriptions are established all-or-nothing, timers spin up, and each
//! inbound message is dispatched on its own task with the envelope's
//! correlation ID installed for the handler's duration.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::{Serialize, Serializer};
use serde_json::Value;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::broker::{Broker, BrokerError};
use crate::config::ServiceConfig;
use crate::errors::ErrorKind;
use crate::message::{Broadcast, Envelope, EnvelopeError, RemoteError, Reply};
use crate::registry::{
    async_subject, rpc_subject, HandlerDescriptor, HandlerFn, HandlerKind, HandlerRegistry,
    InboundRequest,
};
use crate::schema::{Schema, ValidationFailure};
use crate::timer::{blocking_body, run_timer, TimerBody, TimerBodyError, TimerSnapshot, TimerSpec, TimerStats};

mod dispatch;

use dispatch::DispatchContext;

/// Result type for service operations.
pub type Result<T> = std::result::Result<T, ServiceError>;

/// Errors raised by the service kernel and its handlers.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("connection error: {0}")]
    Connection(#[from] BrokerError),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("validation failed: {0}")]
    Validation(#[from] ValidationFailure),

    #[error("envelope error: {0}")]
    Envelope(#[from] EnvelopeError),

    #[error("rpc timed out after {0:?}")]
    RpcTimeout(Duration),

    #[error("remote error ({kind}): {message}")]
    Rpc {
        kind: ErrorKind,
        message: String,
        details: Value,
    },

    #[error("handler failed: {0}")]
    Handler(String),

    #[error("authentication refused: {0}")]
    Authentication(String),

    #[error("authorization refused: {0}")]
    Authorization(String),

    #[error("not found: {0}")]
    NotFound(String),
}

impl ServiceError {
    /// Wire taxonomy kind for reply envelopes.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ServiceError::Connection(_) => ErrorKind::ConnectionError,
            ServiceError::Configuration(_) => ErrorKind::ConfigurationError,
            ServiceError::Validation(_) | ServiceError::Envelope(_) => ErrorKind::ValidationError,
            ServiceError::RpcTimeout(_) => ErrorKind::RpcTimeout,
            ServiceError::Rpc { kind, .. } => *kind,
            ServiceError::Handler(_) => ErrorKind::HandlerError,
            ServiceError::Authentication(_) => ErrorKind::AuthenticationError,
            ServiceError::Authorization(_) => ErrorKind::AuthorizationError,
            ServiceError::NotFound(_) => ErrorKind::NotFound,
        }
    }

    /// Lift a decoded remote failure into the caller's error.
    pub fn from_remote(remote: RemoteError) -> Self {
        ServiceError::Rpc {
            kind: remote.kind,
            message: remote.message,
            details: remote.details,
        }
    }
}

/// Access policy hook, consulted before validation and dispatch.
#[async_trait]
pub trait AuthPolicy: Send + Sync {
    /// Refuse with `Authentication`/`Authorization` errors to reject.
    async fn authorize(&self, subject: &str, envelope: &Envelope) -> Result<()>;
}

/// Policy that admits every request; the default when none is set.
pub struct AllowAll;

#[async_trait]
impl AuthPolicy for AllowAll {
    async fn authorize(&self, _subject: &str, _envelope: &Envelope) -> Result<()> {
        Ok(())
    }
}

/// Lifecycle of a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Created,
    Started,
    Running,
    Draining,
    Stopped,
    /// Broker connection lost or startup hook failed; runner may restart.
    Failed,
}

impl Serialize for Lifecycle {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let name = match self {
            Lifecycle::Created => "created",
            Lifecycle::Started => "started",
            Lifecycle::Running => "running",
            Lifecycle::Draining => "draining",
            Lifecycle::Stopped => "stopped",
            Lifecycle::Failed => "failed",
        };
        serializer.serialize_str(name)
    }
}

type LifecycleHook = Arc<dyn Fn() -> BoxFuture<'static, Result<()>> + Send + Sync>;

struct TimerEntry {
    name: String,
    spec: TimerSpec,
    body: TimerBody,
    stats: Arc<TimerStats>,
}

/// Serializable description of a running service.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceInfo {
    pub name: String,
    pub lifecycle: Lifecycle,
    pub subjects: Vec<String>,
    pub timers: Vec<String>,
}

// ============================================================================
// Builder
// ============================================================================

/// Assembles a service: configuration, handlers, timers, hooks.
///
/// Registration errors (duplicate subjects, invalid intervals) are
/// deferred and surfaced by `build()`, keeping the chain ergonomic.
pub struct ServiceBuilder {
    config: ServiceConfig,
    registry: HandlerRegistry,
    timers: Vec<TimerEntry>,
    broker: Option<Arc<dyn Broker>>,
    auth: Option<Arc<dyn AuthPolicy>>,
    on_startup: Option<LifecycleHook>,
    on_shutdown: Option<LifecycleHook>,
    serialize_dispatch: bool,
    deferred_error: Option<ServiceError>,
}

impl ServiceBuilder {
    pub fn new(config: ServiceConfig) -> Self {
        Self {
            config,
            registry: HandlerRegistry::new(),
            timers: Vec::new(),
            broker: None,
            auth: None,
            on_startup: None,
            on_shutdown: None,
            serialize_dispatch: false,
            deferred_error: None,
        }
    }

    /// Use an existing broker connection instead of connecting at start.
    ///
    /// The connection is treated as shared: `stop()` drains the service's
    /// subscriptions but does not close it.
    pub fn with_broker(mut self, broker: Arc<dyn Broker>) -> Self {
        self.broker = Some(broker);
        self
    }

    /// Install an access policy consulted before dispatch.
    pub fn with_auth_policy(mut self, policy: Arc<dyn AuthPolicy>) -> Self {
        self.auth = Some(policy);
        self
    }

    /// Dispatch inbound messages one at a time instead of concurrently.
    pub fn single_flight_dispatch(mut self) -> Self {
        self.serialize_dispatch = true;
        self
    }

    /// Hook run after subscriptions and timers are up.
    pub fn on_startup<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.on_startup = Some(Arc::new(move || Box::pin(hook())));
        self
    }

    /// Hook run during stop, after draining.
    pub fn on_shutdown<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.on_shutdown = Some(Arc::new(move || Box::pin(hook())));
        self
    }

    fn register(&mut self, descriptor: HandlerDescriptor) {
        if self.deferred_error.is_none() {
            if let Err(e) = self.registry.register(descriptor) {
                self.deferred_error = Some(e);
            }
        }
    }

    /// Register a typed RPC handler on `<service>.rpc.<method>`.
    pub fn rpc<Req, Res, F, Fut>(mut self, method: &str, handler: F) -> Self
    where
        Req: DeserializeOwned + Send + 'static,
        Res: Serialize + Send + 'static,
        F: Fn(Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Res>> + Send + 'static,
    {
        let subject = rpc_subject(&self.config.name, method);
        self.register(HandlerDescriptor {
            kind: HandlerKind::Rpc,
            subject,
            expects_reply: true,
            request_schema: None,
            response_schema: None,
            handler: typed_handler(handler),
        });
        self
    }

    /// Register a schema-validated RPC handler over raw JSON payloads.
    ///
    /// The schema runs before the handler; violations are answered with a
    /// validation-error reply and the handler never sees the payload.
    pub fn rpc_validated<F, Fut>(mut self, method: &str, schema: Schema, handler: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        let subject = rpc_subject(&self.config.name, method);
        let tag = schema.tag().to_string();
        self.register(HandlerDescriptor {
            kind: HandlerKind::Rpc,
            subject,
            expects_reply: true,
            request_schema: Some(schema),
            response_schema: Some(tag),
            handler: value_handler(handler),
        });
        self
    }

    /// Register a fire-and-forget handler on `<service>.async.<method>`.
    pub fn async_rpc<Req, F, Fut>(mut self, method: &str, handler: F) -> Self
    where
        Req: DeserializeOwned + Send + 'static,
        F: Fn(Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let subject = async_subject(&self.config.name, method);
        let handler = Arc::new(handler);
        let erased: HandlerFn = Arc::new(move |request: InboundRequest| {
            let handler = handler.clone();
            Box::pin(async move {
                let typed: Req = decode_payload(request.payload)?;
                handler(typed).await?;
                Ok(Value::Null)
            })
        });
        self.register(HandlerDescriptor {
            kind: HandlerKind::AsyncRpc,
            subject,
            expects_reply: false,
            request_schema: None,
            response_schema: None,
            handler: erased,
        });
        self
    }

    /// Register an event listener on an explicit subject pattern.
    ///
    /// The handler receives the concrete subject alongside the payload so
    /// wildcard listeners can tell what matched.
    pub fn listen<F, Fut>(mut self, pattern: &str, handler: F) -> Self
    where
        F: Fn(String, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let erased: HandlerFn = Arc::new(move |request: InboundRequest| {
            let handler = handler.clone();
            Box::pin(async move {
                handler(request.subject, request.payload).await?;
                Ok(Value::Null)
            })
        });
        self.register(HandlerDescriptor {
            kind: HandlerKind::Event,
            subject: pattern.to_string(),
            expects_reply: false,
            request_schema: None,
            response_schema: None,
            handler: erased,
        });
        self
    }

    /// Register a typed broadcast listener on `broadcast.<type>`.
    ///
    /// The payload is decoded into the message type before the handler
    /// runs; undecodable broadcasts are logged and dropped.
    pub fn broadcast_listener<M, F, Fut>(mut self, handler: F) -> Self
    where
        M: Broadcast,
        F: Fn(M) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let erased: HandlerFn = Arc::new(move |request: InboundRequest| {
            let handler = handler.clone();
            Box::pin(async move {
                let message: M = decode_payload(request.payload)?;
                handler(message).await?;
                Ok(Value::Null)
            })
        });
        self.register(HandlerDescriptor {
            kind: HandlerKind::Broadcast,
            subject: M::subject(),
            expects_reply: false,
            request_schema: None,
            response_schema: None,
            handler: erased,
        });
        self
    }

    /// Register a periodic timer with an async body.
    pub fn timer<F, Fut>(mut self, name: &str, spec: TimerSpec, body: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), TimerBodyError>> + Send + 'static,
    {
        let erased: TimerBody = Arc::new(move || Box::pin(body()));
        self.add_timer(name, spec, erased);
        self
    }

    /// Register a periodic timer with a blocking body, run on a worker.
    pub fn timer_blocking<F>(mut self, name: &str, spec: TimerSpec, body: F) -> Self
    where
        F: Fn() -> std::result::Result<(), TimerBodyError> + Send + Sync + Clone + 'static,
    {
        self.add_timer(name, spec, blocking_body(body));
        self
    }

    fn add_timer(&mut self, name: &str, spec: TimerSpec, body: TimerBody) {
        if self.deferred_error.is_some() {
            return;
        }
        if spec.interval.is_zero() {
            self.deferred_error = Some(ServiceError::Configuration(format!(
                "timer '{}' has a zero interval",
                name
            )));
            return;
        }
        if self.timers.iter().any(|t| t.name == name) {
            self.deferred_error = Some(ServiceError::Configuration(format!(
                "duplicate timer '{}'",
                name
            )));
            return;
        }
        self.timers.push(TimerEntry {
            name: name.to_string(),
            spec,
            body,
            stats: Arc::new(TimerStats::default()),
        });
    }

    /// Finish assembly, surfacing deferred registration errors.
    pub fn build(self) -> Result<Service> {
        self.config
            .validate()
            .map_err(|e| ServiceError::Configuration(e.to_string()))?;
        if let Some(e) = self.deferred_error {
            return Err(e);
        }

        let (lifecycle_tx, _) = watch::channel(Lifecycle::Created);
        Ok(Service {
            config: self.config,
            registry: self.registry,
            timers: self.timers,
            injected_broker: self.broker,
            auth: self.auth,
            on_startup: self.on_startup,
            on_shutdown: self.on_shutdown,
            serialize_dispatch: self.serialize_dispatch,
            lifecycle: Arc::new(lifecycle_tx),
            runtime: Mutex::new(Runtime::default()),
        })
    }
}

fn decode_payload<T: DeserializeOwned>(payload: Value) -> Result<T> {
    serde_json::from_value(payload).map_err(|e| {
        ServiceError::Validation(ValidationFailure {
            violations: vec![format!("payload: {}", e)],
        })
    })
}

fn typed_handler<Req, Res, F, Fut>(handler: F) -> HandlerFn
where
    Req: DeserializeOwned + Send + 'static,
    Res: Serialize + Send + 'static,
    F: Fn(Req) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Res>> + Send + 'static,
{
    let handler = Arc::new(handler);
    Arc::new(move |request: InboundRequest| {
        let handler = handler.clone();
        Box::pin(async move {
            let typed: Req = decode_payload(request.payload)?;
            let result = handler(typed).await?;
            serde_json::to_value(result).map_err(|e| ServiceError::Handler(e.to_string()))
        })
    })
}

fn value_handler<F, Fut>(handler: F) -> HandlerFn
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    let handler = Arc::new(handler);
    Arc::new(move |request: InboundRequest| {
        let handler = handler.clone();
        Box::pin(async move { handler(request.payload).await })
    })
}

// ============================================================================
// Service
// ============================================================================

/// Per-start mutable state; replaced wholesale on restart.
#[derive(Default)]
struct Runtime {
    broker: Option<Arc<dyn Broker>>,
    owns_broker: bool,
    shutdown: Option<watch::Sender<bool>>,
    tasks: Vec<JoinHandle<()>>,
    in_flight: Option<Arc<AtomicUsize>>,
}

/// A configured service bound to the broker while running.
pub struct Service {
    config: ServiceConfig,
    registry: HandlerRegistry,
    timers: Vec<TimerEntry>,
    injected_broker: Option<Arc<dyn Broker>>,
    auth: Option<Arc<dyn AuthPolicy>>,
    on_startup: Option<LifecycleHook>,
    on_shutdown: Option<LifecycleHook>,
    serialize_dispatch: bool,
    lifecycle: Arc<watch::Sender<Lifecycle>>,
    runtime: Mutex<Runtime>,
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Service {
    /// Start building a service.
    pub fn builder(config: ServiceConfig) -> ServiceBuilder {
        ServiceBuilder::new(config)
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// Current lifecycle state.
    pub fn lifecycle(&self) -> Lifecycle {
        *self.lifecycle.borrow()
    }

    /// Watch lifecycle transitions (used by the runner).
    pub fn watch_lifecycle(&self) -> watch::Receiver<Lifecycle> {
        self.lifecycle.subscribe()
    }

    /// Snapshot of per-timer statistics.
    pub fn timer_stats(&self) -> Vec<TimerSnapshot> {
        self.timers
            .iter()
            .map(|t| t.stats.snapshot(&t.name, &t.spec))
            .collect()
    }

    /// Description of the service: name, state, subjects, timers.
    pub fn info(&self) -> ServiceInfo {
        ServiceInfo {
            name: self.config.name.clone(),
            lifecycle: self.lifecycle(),
            subjects: self.registry.subjects().map(String::from).collect(),
            timers: self.timers.iter().map(|t| t.name.clone()).collect(),
        }
    }

    fn set_lifecycle(&self, state: Lifecycle) {
        let _ = self.lifecycle.send(state);
    }

    /// Connect, subscribe every handler, start timers, run the startup
    /// hook. Subscriptions are all-or-nothing: a failure rolls back the
    /// ones already established before returning the error.
    ///
    /// Calling `start()` on a running service is a no-op with a warning.
    pub async fn start(&self) -> Result<()> {
        let mut runtime = self.runtime.lock().await;
        if matches!(self.lifecycle(), Lifecycle::Started | Lifecycle::Running) {
            warn!(service = %self.config.name, "start() called on a running service, ignoring");
            return Ok(());
        }

        let (broker, owns_broker) = self.acquire_broker().await?;
        self.set_lifecycle(Lifecycle::Started);

        if self.config.jetstream_enabled {
            info!(
                service = %self.config.name,
                "jetstream_enabled is set; durable streams are not implemented, using core subjects"
            );
        }

        // Subscribe all-or-nothing. Dropping a subscription unsubscribes,
        // so bailing out here rolls back the ones already made.
        let mut subscriptions = Vec::with_capacity(self.registry.len());
        for descriptor in self.registry.descriptors() {
            match broker.subscribe(&descriptor.subject).await {
                Ok(sub) => subscriptions.push((sub, descriptor.clone())),
                Err(e) => {
                    drop(subscriptions);
                    if owns_broker {
                        let _ = broker.close().await;
                    }
                    self.set_lifecycle(Lifecycle::Stopped);
                    return Err(e.into());
                }
            }
        }

        let (shutdown_tx, _) = watch::channel(false);
        let in_flight = Arc::new(AtomicUsize::new(0));
        let mut tasks = Vec::new();

        for (sub, descriptor) in subscriptions {
            let ctx = DispatchContext {
                service_name: self.config.name.clone(),
                broker: broker.clone(),
                descriptor,
                auth: self.auth.clone(),
                in_flight: in_flight.clone(),
                serialized: self.serialize_dispatch,
            };
            tasks.push(tokio::spawn(dispatch::subscription_loop(
                ctx,
                sub,
                shutdown_tx.subscribe(),
                self.lifecycle.clone(),
            )));
        }

        for timer in &self.timers {
            tasks.push(tokio::spawn(run_timer(
                timer.name.clone(),
                timer.spec,
                timer.body.clone(),
                timer.stats.clone(),
                shutdown_tx.subscribe(),
            )));
        }

        if let Some(hook) = &self.on_startup {
            if let Err(e) = hook().await {
                for task in &tasks {
                    task.abort();
                }
                if owns_broker {
                    let _ = broker.close().await;
                }
                self.set_lifecycle(Lifecycle::Stopped);
                return Err(e);
            }
        }

        info!(
            service = %self.config.name,
            handlers = self.registry.len(),
            timers = self.timers.len(),
            "Service started"
        );

        *runtime = Runtime {
            broker: Some(broker),
            owns_broker,
            shutdown: Some(shutdown_tx),
            tasks,
            in_flight: Some(in_flight),
        };
        self.set_lifecycle(Lifecycle::Running);
        Ok(())
    }

    async fn acquire_broker(&self) -> Result<(Arc<dyn Broker>, bool)> {
        if let Some(broker) = &self.injected_broker {
            return Ok((broker.clone(), false));
        }
        self.connect_broker().await
    }

    #[cfg(feature = "nats")]
    async fn connect_broker(&self) -> Result<(Arc<dyn Broker>, bool)> {
        let broker = crate::broker::NatsBroker::connect(
            &self.config.broker_url,
            self.config.max_reconnect_attempts,
            self.config.reconnect_wait(),
        )
        .await?;
        Ok((Arc::new(broker), true))
    }

    #[cfg(not(feature = "nats"))]
    async fn connect_broker(&self) -> Result<(Arc<dyn Broker>, bool)> {
        Err(ServiceError::Configuration(
            "no broker available: inject one with with_broker() or enable the 'nats' feature"
                .to_string(),
        ))
    }

    /// Cancel timers, drain the broker, close the connection (when owned)
    /// and run the shutdown hook. In-flight handlers get a bounded grace
    /// period, then are forcibly cancelled. Idempotent.
    pub async fn stop(&self) -> Result<()> {
        let mut runtime = self.runtime.lock().await;
        // Failed services still hold tasks and a connection; stop() is
        // how the runner cleans them up before a restart.
        if !matches!(
            self.lifecycle(),
            Lifecycle::Started | Lifecycle::Running | Lifecycle::Failed
        ) {
            warn!(service = %self.config.name, "stop() called on a stopped service, ignoring");
            return Ok(());
        }
        self.set_lifecycle(Lifecycle::Draining);

        // Signal subscription loops and timers to wind down.
        if let Some(shutdown) = runtime.shutdown.take() {
            let _ = shutdown.send(true);
        }

        // Bounded grace for in-flight handlers.
        if let Some(in_flight) = runtime.in_flight.take() {
            let deadline = tokio::time::Instant::now() + self.config.stop_grace();
            while in_flight.load(Ordering::SeqCst) > 0 && tokio::time::Instant::now() < deadline {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            let leftover = in_flight.load(Ordering::SeqCst);
            if leftover > 0 {
                warn!(
                    service = %self.config.name,
                    leftover,
                    "Grace period elapsed, cancelling in-flight handlers"
                );
            }
        }

        // Aborting the loops drops their task sets, cancelling whatever
        // is still in flight.
        for task in runtime.tasks.drain(..) {
            task.abort();
        }

        // Only drain and close a connection this service owns; a shared
        // connection stays up for its other users.
        if let Some(broker) = runtime.broker.take() {
            if runtime.owns_broker {
                let _ = broker.drain().await;
                let _ = broker.close().await;
            }
        }

        if let Some(hook) = &self.on_shutdown {
            if let Err(e) = hook().await {
                warn!(service = %self.config.name, error = %e, "Shutdown hook failed");
            }
        }

        self.set_lifecycle(Lifecycle::Stopped);
        info!(service = %self.config.name, "Service stopped");
        Ok(())
    }

    async fn broker(&self) -> Result<Arc<dyn Broker>> {
        let runtime = self.runtime.lock().await;
        runtime
            .broker
            .clone()
            .ok_or(ServiceError::Connection(BrokerError::Closed))
    }

    /// Issue a request to `<service>.rpc.<method>` and await the reply.
    ///
    /// The ambient correlation ID rides in the envelope; the configured
    /// request timeout bounds the wait.
    pub async fn call_rpc(
        &self,
        service: &str,
        method: &str,
        args: impl Serialize,
    ) -> Result<Value> {
        let broker = self.broker().await?;
        let payload =
            serde_json::to_value(args).map_err(|e| ServiceError::Handler(e.to_string()))?;
        let bytes = Envelope::new(payload).encode()?;
        let subject = rpc_subject(service, method);
        let timeout = self.config.request_timeout();

        #[cfg(feature = "otel")]
        let started = std::time::Instant::now();

        let reply_bytes = match broker.request(&subject, bytes, timeout).await {
            Ok(bytes) => bytes,
            Err(BrokerError::RequestTimeout(d)) => return Err(ServiceError::RpcTimeout(d)),
            Err(BrokerError::NoResponders(s)) => {
                return Err(ServiceError::Rpc {
                    kind: ErrorKind::RpcError,
                    message: format!("no responders on '{}'", s),
                    details: Value::Null,
                })
            }
            Err(e) => return Err(e.into()),
        };

        #[cfg(feature = "otel")]
        crate::metrics::RPC_DURATION.record(
            started.elapsed().as_secs_f64(),
            &[crate::metrics::subject_attr(&subject)],
        );

        let reply = Reply::decode(&reply_bytes)?;
        reply.into_result().map_err(ServiceError::from_remote)
    }

    /// Publish to `<service>.async.<method>` without awaiting a reply.
    ///
    /// Returns as soon as the publish is flushed to the broker.
    pub async fn call_async(
        &self,
        service: &str,
        method: &str,
        args: impl Serialize,
    ) -> Result<()> {
        let broker = self.broker().await?;
        let payload =
            serde_json::to_value(args).map_err(|e| ServiceError::Handler(e.to_string()))?;
        let bytes = Envelope::new(payload).encode()?;
        broker.publish(&async_subject(service, method), bytes).await?;
        broker.flush().await?;
        Ok(())
    }

    /// Publish to an arbitrary subject without expecting a reply.
    pub async fn publish_event(&self, subject: &str, payload: impl Serialize) -> Result<()> {
        let broker = self.broker().await?;
        let payload =
            serde_json::to_value(payload).map_err(|e| ServiceError::Handler(e.to_string()))?;
        let bytes = Envelope::new(payload).encode()?;
        broker.publish(subject, bytes).await?;

        #[cfg(feature = "otel")]
        crate::metrics::PUBLISH_TOTAL.add(1, &[crate::metrics::subject_attr(subject)]);

        Ok(())
    }

    /// Publish a typed broadcast on the subject derived from its type.
    pub async fn broadcast<M: Broadcast>(&self, message: &M) -> Result<()> {
        let payload =
            serde_json::to_value(message).map_err(|e| ServiceError::Handler(e.to_string()))?;
        self.publish_event(&M::subject(), payload).await
    }
}

/// Outbound RPC capability, implemented by `Service` and by test fakes.
#[async_trait]
pub trait RpcCaller: Send + Sync {
    async fn call(&self, service: &str, method: &str, args: Value) -> Result<Value>;
}

#[async_trait]
impl RpcCaller for Service {
    async fn call(&self, service: &str, method: &str, args: Value) -> Result<Value> {
        self.call_rpc(service, method, args).await
    }
}

#[cfg(test)]
mod tests;
