use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::*;
use crate::broker::{Broker, ChannelBroker, Result as BrokerResult, Subscription};
use crate::correlation;
use crate::schema::{FieldRule, Schema};

fn config(name: &str) -> ServiceConfig {
    ServiceConfig {
        request_timeout_ms: 500,
        stop_grace_ms: 100,
        ..ServiceConfig::new(name)
    }
}

fn shared_broker() -> Arc<ChannelBroker> {
    Arc::new(ChannelBroker::new())
}

async fn started_caller(broker: &Arc<ChannelBroker>) -> Service {
    let service = Service::builder(config("caller"))
        .with_broker(broker.clone() as Arc<dyn Broker>)
        .build()
        .unwrap();
    service.start().await.unwrap();
    service
}

#[derive(Debug, Deserialize)]
struct AddArgs {
    a: i64,
    b: i64,
}

#[tokio::test]
async fn test_echo_rpc_round_trip() {
    let broker = shared_broker();
    let calc = Service::builder(config("calc"))
        .with_broker(broker.clone() as Arc<dyn Broker>)
        .rpc("add", |args: AddArgs| async move { Ok(args.a + args.b) })
        .build()
        .unwrap();
    calc.start().await.unwrap();

    let caller = started_caller(&broker).await;
    let result = caller
        .call_rpc("calc", "add", json!({"a": 2, "b": 3}))
        .await
        .unwrap();
    assert_eq!(result, json!(5));

    calc.stop().await.unwrap();
    caller.stop().await.unwrap();
}

#[tokio::test]
async fn test_validated_rpc_rejects_bad_payload_without_side_effects() {
    let broker = shared_broker();
    let invocations = Arc::new(AtomicUsize::new(0));
    let handler_invocations = invocations.clone();

    let schema = Schema::new("user.create.v1")
        .field(FieldRule::string("username").required().min_len(3))
        .field(FieldRule::string("email").required());

    let users = Service::builder(config("users"))
        .with_broker(broker.clone() as Arc<dyn Broker>)
        .rpc_validated("create", schema, move |payload: Value| {
            let invocations = handler_invocations.clone();
            async move {
                invocations.fetch_add(1, Ordering::SeqCst);
                Ok(payload)
            }
        })
        .build()
        .unwrap();
    users.start().await.unwrap();

    let caller = started_caller(&broker).await;
    let err = caller
        .call_rpc(
            "users",
            "create",
            json!({"username": "ab", "email": "x@y", "age": 25}),
        )
        .await
        .unwrap_err();

    match err {
        ServiceError::Rpc { kind, message, .. } => {
            assert_eq!(kind, ErrorKind::ValidationError);
            assert!(message.contains("username"));
        }
        other => panic!("expected validation error, got {:?}", other),
    }
    assert_eq!(invocations.load(Ordering::SeqCst), 0);

    // A valid payload still goes through.
    caller
        .call_rpc(
            "users",
            "create",
            json!({"username": "alice", "email": "a@b.c"}),
        )
        .await
        .unwrap();
    assert_eq!(invocations.load(Ordering::SeqCst), 1);
}

#[derive(Debug, Deserialize)]
struct AuditEvent {
    event: String,
}

#[tokio::test]
async fn test_async_rpc_fire_and_forget() {
    let broker = shared_broker();
    let (tx, mut rx) = tokio::sync::mpsc::channel::<String>(8);

    let audit = Service::builder(config("audit"))
        .with_broker(broker.clone() as Arc<dyn Broker>)
        .async_rpc("log_event", move |event: AuditEvent| {
            let tx = tx.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                let _ = tx.send(event.event).await;
                Ok(())
            }
        })
        .build()
        .unwrap();
    audit.start().await.unwrap();

    let caller = started_caller(&broker).await;
    let started = std::time::Instant::now();
    caller
        .call_async("audit", "log_event", json!({"event": "login"}))
        .await
        .unwrap();
    // Caller returns well before the handler's 100ms body completes.
    assert!(started.elapsed() < Duration::from_millis(50));

    let received = tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received, "login");
    // Exactly once under normal broker conditions.
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_correlation_preserved_across_chain() {
    let broker = shared_broker();
    let observed: Arc<std::sync::Mutex<Vec<String>>> = Arc::new(std::sync::Mutex::new(Vec::new()));

    let observed_c = observed.clone();
    let svc_c = Service::builder(config("svc-c"))
        .with_broker(broker.clone() as Arc<dyn Broker>)
        .rpc("step", move |_: Value| {
            let observed = observed_c.clone();
            async move {
                observed.lock().unwrap().push(correlation::current().unwrap());
                Ok(Value::Null)
            }
        })
        .build()
        .unwrap();
    svc_c.start().await.unwrap();

    // svc-b's handler makes an outbound call through a gateway handle
    // bound to the same broker.
    let gateway = Arc::new(
        Service::builder(config("gateway"))
            .with_broker(broker.clone() as Arc<dyn Broker>)
            .build()
            .unwrap(),
    );
    gateway.start().await.unwrap();

    let observed_b = observed.clone();
    let gateway_b = gateway.clone();
    let svc_b = Service::builder(config("svc-b"))
        .with_broker(broker.clone() as Arc<dyn Broker>)
        .rpc("step", move |_: Value| {
            let observed = observed_b.clone();
            let gateway = gateway_b.clone();
            async move {
                observed.lock().unwrap().push(correlation::current().unwrap());
                gateway.call_rpc("svc-c", "step", Value::Null).await?;
                Ok(Value::Null)
            }
        })
        .build()
        .unwrap();
    svc_b.start().await.unwrap();

    let caller = started_caller(&broker).await;
    let origin = correlation::mint();
    correlation::with_correlation(origin.clone(), async {
        caller.call_rpc("svc-b", "step", Value::Null).await.unwrap();
    })
    .await;

    let seen = observed.lock().unwrap().clone();
    assert_eq!(seen, vec![origin.clone(), origin]);
}

#[tokio::test]
async fn test_rpc_timeout_when_handler_never_replies() {
    let broker = shared_broker();
    let slow = Service::builder(config("slow"))
        .with_broker(broker.clone() as Arc<dyn Broker>)
        .rpc("hang", |_: Value| async move {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(Value::Null)
        })
        .build()
        .unwrap();
    slow.start().await.unwrap();

    let caller = started_caller(&broker).await;
    let err = caller.call_rpc("slow", "hang", Value::Null).await.unwrap_err();
    assert!(matches!(err, ServiceError::RpcTimeout(_)));
}

#[tokio::test]
async fn test_rpc_error_preserves_remote_message() {
    let broker = shared_broker();
    let failing = Service::builder(config("failing"))
        .with_broker(broker.clone() as Arc<dyn Broker>)
        .rpc("boom", |_: Value| async move {
            Err::<Value, _>(ServiceError::Handler("the disk is on fire".to_string()))
        })
        .build()
        .unwrap();
    failing.start().await.unwrap();

    let caller = started_caller(&broker).await;
    let err = caller.call_rpc("failing", "boom", Value::Null).await.unwrap_err();
    match err {
        ServiceError::Rpc { kind, message, .. } => {
            assert_eq!(kind, ErrorKind::HandlerError);
            assert!(message.contains("the disk is on fire"));
        }
        other => panic!("expected rpc error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_rpc_to_absent_service_fails_fast() {
    let broker = shared_broker();
    let caller = started_caller(&broker).await;
    let err = caller
        .call_rpc("ghost", "noop", Value::Null)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ServiceError::Rpc {
            kind: ErrorKind::RpcError,
            ..
        }
    ));
}

#[derive(Debug, Serialize, Deserialize)]
struct OrderShipped {
    order_id: u64,
}

impl Broadcast for OrderShipped {
    fn message_type() -> &'static str {
        "OrderShipped"
    }
}

#[tokio::test]
async fn test_broadcast_fans_out_to_all_subscribers() {
    let broker = shared_broker();
    let count = Arc::new(AtomicUsize::new(0));

    let mut services = Vec::new();
    for name in ["shipping", "billing"] {
        let count = count.clone();
        let service = Service::builder(config(name))
            .with_broker(broker.clone() as Arc<dyn Broker>)
            .broadcast_listener(move |message: OrderShipped| {
                let count = count.clone();
                async move {
                    assert_eq!(message.order_id, 42);
                    count.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .build()
            .unwrap();
        service.start().await.unwrap();
        services.push(service);
    }

    let caller = started_caller(&broker).await;
    caller.broadcast(&OrderShipped { order_id: 42 }).await.unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(count.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_wildcard_listener_sees_concrete_subject() {
    let broker = shared_broker();
    let seen: Arc<std::sync::Mutex<Vec<String>>> = Arc::new(std::sync::Mutex::new(Vec::new()));
    let handler_seen = seen.clone();

    let watcher = Service::builder(config("watcher"))
        .with_broker(broker.clone() as Arc<dyn Broker>)
        .listen("orders.>", move |subject, _payload| {
            let seen = handler_seen.clone();
            async move {
                seen.lock().unwrap().push(subject);
                Ok(())
            }
        })
        .build()
        .unwrap();
    watcher.start().await.unwrap();

    let caller = started_caller(&broker).await;
    caller.publish_event("orders.created", json!({"id": 1})).await.unwrap();
    caller.publish_event("orders.shipped.eu", json!({"id": 1})).await.unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    let seen = seen.lock().unwrap().clone();
    assert_eq!(seen, vec!["orders.created", "orders.shipped.eu"]);
}

#[tokio::test]
async fn test_duplicate_subject_fails_build() {
    let err = Service::builder(config("dup"))
        .rpc("add", |_: Value| async { Ok(Value::Null) })
        .rpc("add", |_: Value| async { Ok(Value::Null) })
        .build()
        .unwrap_err();
    assert!(matches!(err, ServiceError::Configuration(_)));
}

#[tokio::test]
async fn test_zero_interval_timer_fails_build() {
    let err = Service::builder(config("timers"))
        .timer("bad", crate::timer::TimerSpec::new(Duration::ZERO), || async { Ok(()) })
        .build()
        .unwrap_err();
    assert!(matches!(err, ServiceError::Configuration(_)));
}

#[tokio::test]
async fn test_start_is_idempotent() {
    let broker = shared_broker();
    let service = Service::builder(config("idem"))
        .with_broker(broker.clone() as Arc<dyn Broker>)
        .build()
        .unwrap();
    service.start().await.unwrap();
    service.start().await.unwrap();
    assert_eq!(service.lifecycle(), Lifecycle::Running);
}

#[tokio::test]
async fn test_stop_is_idempotent_and_restartable() {
    let broker = shared_broker();
    let service = Service::builder(config("restart"))
        .with_broker(broker.clone() as Arc<dyn Broker>)
        .rpc("ping", |_: Value| async { Ok(json!("pong")) })
        .build()
        .unwrap();

    service.start().await.unwrap();
    service.stop().await.unwrap();
    service.stop().await.unwrap();
    assert_eq!(service.lifecycle(), Lifecycle::Stopped);

    // A stopped service can start again with the same handler table.
    service.start().await.unwrap();
    let caller = started_caller(&broker).await;
    let result = caller.call_rpc("restart", "ping", Value::Null).await.unwrap();
    assert_eq!(result, json!("pong"));
}

#[tokio::test]
async fn test_stopped_service_no_longer_answers() {
    let broker = shared_broker();
    let service = Service::builder(config("gone"))
        .with_broker(broker.clone() as Arc<dyn Broker>)
        .rpc("ping", |_: Value| async { Ok(Value::Null) })
        .build()
        .unwrap();
    service.start().await.unwrap();
    service.stop().await.unwrap();

    let caller = started_caller(&broker).await;
    assert!(caller.call_rpc("gone", "ping", Value::Null).await.is_err());
}

#[tokio::test]
async fn test_stop_bounded_by_grace_period() {
    let broker = shared_broker();
    let service = Service::builder(config("graceful"))
        .with_broker(broker.clone() as Arc<dyn Broker>)
        .rpc("hang", |_: Value| async move {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(Value::Null)
        })
        .build()
        .unwrap();
    service.start().await.unwrap();

    // Kick off a request that will still be in flight at stop time.
    let caller = started_caller(&broker).await;
    let pending = tokio::spawn(async move { caller.call_rpc("graceful", "hang", Value::Null).await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let started = std::time::Instant::now();
    service.stop().await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(2));

    // The caller observes a timeout, not a hang.
    let result = pending.await.unwrap();
    assert!(result.is_err());
}

// ============================================================================
// Startup atomicity
// ============================================================================

/// Broker wrapper that fails the Nth subscribe call.
struct FailingBroker {
    inner: ChannelBroker,
    fail_at: usize,
    calls: AtomicUsize,
}

#[async_trait]
impl Broker for FailingBroker {
    async fn subscribe(&self, pattern: &str) -> BrokerResult<Subscription> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if n == self.fail_at {
            return Err(crate::broker::BrokerError::Subscribe("injected".to_string()));
        }
        self.inner.subscribe(pattern).await
    }

    async fn publish(&self, subject: &str, payload: Vec<u8>) -> BrokerResult<()> {
        self.inner.publish(subject, payload).await
    }

    async fn request(
        &self,
        subject: &str,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> BrokerResult<Vec<u8>> {
        self.inner.request(subject, payload, timeout).await
    }

    async fn flush(&self) -> BrokerResult<()> {
        self.inner.flush().await
    }

    async fn drain(&self) -> BrokerResult<()> {
        self.inner.drain().await
    }

    async fn close(&self) -> BrokerResult<()> {
        self.inner.close().await
    }
}

#[tokio::test]
async fn test_start_subscribes_all_or_nothing() {
    let channel = ChannelBroker::new();
    let broker = Arc::new(FailingBroker {
        inner: channel.clone(),
        fail_at: 1,
        calls: AtomicUsize::new(0),
    });

    let service = Service::builder(config("atomic"))
        .with_broker(broker as Arc<dyn Broker>)
        .rpc("first", |_: Value| async { Ok(Value::Null) })
        .rpc("second", |_: Value| async { Ok(Value::Null) })
        .build()
        .unwrap();

    assert!(service.start().await.is_err());
    assert_eq!(service.lifecycle(), Lifecycle::Stopped);

    // The first subscription was rolled back: a request on its subject
    // finds no responders.
    let err = channel
        .request("atomic.rpc.first", b"{}".to_vec(), Duration::from_millis(100))
        .await
        .unwrap_err();
    assert!(matches!(err, crate::broker::BrokerError::NoResponders(_)));
}

#[tokio::test]
async fn test_startup_hook_failure_aborts_start() {
    let broker = shared_broker();
    let service = Service::builder(config("hooked"))
        .with_broker(broker.clone() as Arc<dyn Broker>)
        .rpc("ping", |_: Value| async { Ok(Value::Null) })
        .on_startup(|| async { Err(ServiceError::Configuration("not ready".to_string())) })
        .build()
        .unwrap();

    assert!(service.start().await.is_err());
    assert_eq!(service.lifecycle(), Lifecycle::Stopped);
}

// ============================================================================
// Auth policy
// ============================================================================

struct DenyWrites;

#[async_trait]
impl AuthPolicy for DenyWrites {
    async fn authorize(&self, subject: &str, _envelope: &Envelope) -> Result<()> {
        if subject.ends_with(".write") {
            Err(ServiceError::Authorization("writes are read-only today".to_string()))
        } else {
            Ok(())
        }
    }
}

#[tokio::test]
async fn test_auth_policy_refuses_before_handler() {
    let broker = shared_broker();
    let invocations = Arc::new(AtomicUsize::new(0));
    let handler_invocations = invocations.clone();

    let service = Service::builder(config("guarded"))
        .with_broker(broker.clone() as Arc<dyn Broker>)
        .with_auth_policy(Arc::new(DenyWrites))
        .rpc("write", move |_: Value| {
            let invocations = handler_invocations.clone();
            async move {
                invocations.fetch_add(1, Ordering::SeqCst);
                Ok(Value::Null)
            }
        })
        .build()
        .unwrap();
    service.start().await.unwrap();

    let caller = started_caller(&broker).await;
    let err = caller.call_rpc("guarded", "write", Value::Null).await.unwrap_err();
    match err {
        ServiceError::Rpc { kind, .. } => assert_eq!(kind, ErrorKind::AuthorizationError),
        other => panic!("expected authorization error, got {:?}", other),
    }
    assert_eq!(invocations.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_service_info_surfaces_handlers_and_timers() {
    let service = Service::builder(config("inspect"))
        .rpc("add", |_: Value| async { Ok(Value::Null) })
        .listen("orders.>", |_, _| async { Ok(()) })
        .timer(
            "heartbeat",
            crate::timer::TimerSpec::new(Duration::from_secs(30)),
            || async { Ok(()) },
        )
        .build()
        .unwrap();

    let info = service.info();
    assert_eq!(info.name, "inspect");
    assert_eq!(info.lifecycle, Lifecycle::Created);
    assert!(info.subjects.contains(&"inspect.rpc.add".to_string()));
    assert!(info.subjects.contains(&"orders.>".to_string()));
    assert_eq!(info.timers, vec!["heartbeat"]);

    let stats = service.timer_stats();
    assert_eq!(stats.len(), 1);
    assert_eq!(stats[0].execution_count, 0);
}

#[tokio::test]
async fn test_oversize_publish_surfaces_to_caller() {
    let broker = Arc::new(ChannelBroker::with_max_payload(64));
    let service = Service::builder(config("tiny"))
        .with_broker(broker.clone() as Arc<dyn Broker>)
        .build()
        .unwrap();
    service.start().await.unwrap();

    let err = service
        .publish_event("bulk.data", json!({"blob": "x".repeat(256)}))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ServiceError::Connection(crate::broker::BrokerError::PayloadTooLarge { .. })
    ));
}
