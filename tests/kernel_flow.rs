//! End-to-end kernel scenarios over the in-process channel broker.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};

use courier::broker::ChannelBroker;
use courier::schema::{FieldRule, Schema};
use courier::timer::TimerSpec;
use courier::{correlation, Broker, ErrorKind, Service, ServiceConfig, ServiceError};

fn config(name: &str) -> ServiceConfig {
    ServiceConfig {
        request_timeout_ms: 1_000,
        stop_grace_ms: 500,
        ..ServiceConfig::new(name)
    }
}

#[tokio::test]
async fn echo_rpc_with_shared_correlation() {
    let broker = Arc::new(ChannelBroker::new());
    let callee_correlation: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));

    let handler_correlation = callee_correlation.clone();
    let calc = Service::builder(config("calc"))
        .with_broker(broker.clone() as Arc<dyn Broker>)
        .rpc("add", move |args: Value| {
            let seen = handler_correlation.clone();
            async move {
                *seen.lock().unwrap() = correlation::current();
                let a = args["a"].as_i64().unwrap_or(0);
                let b = args["b"].as_i64().unwrap_or(0);
                Ok(json!(a + b))
            }
        })
        .build()
        .unwrap();
    calc.start().await.unwrap();

    let caller = Service::builder(config("caller"))
        .with_broker(broker.clone() as Arc<dyn Broker>)
        .build()
        .unwrap();
    caller.start().await.unwrap();

    let caller_correlation = correlation::mint();
    let result = correlation::with_correlation(caller_correlation.clone(), async {
        caller.call_rpc("calc", "add", json!({"a": 2, "b": 3})).await
    })
    .await
    .unwrap();

    assert_eq!(result, json!(5));
    // The callee observed the exact ID the caller sent.
    assert_eq!(
        callee_correlation.lock().unwrap().as_deref(),
        Some(caller_correlation.as_str())
    );

    calc.stop().await.unwrap();
    caller.stop().await.unwrap();
}

#[tokio::test]
async fn validated_rpc_round_trips_valid_instances() {
    let broker = Arc::new(ChannelBroker::new());

    let schema = Schema::new("user.create.v1")
        .field(FieldRule::string("username").required().min_len(3))
        .field(FieldRule::string("email").required())
        .field(FieldRule::integer("age").min(0.0));

    let users = Service::builder(config("users"))
        .with_broker(broker.clone() as Arc<dyn Broker>)
        .rpc_validated("create", schema, |payload: Value| async move {
            // Echo the validated payload back untouched.
            Ok(payload)
        })
        .build()
        .unwrap();
    users.start().await.unwrap();

    let caller = Service::builder(config("caller"))
        .with_broker(broker.clone() as Arc<dyn Broker>)
        .build()
        .unwrap();
    caller.start().await.unwrap();

    // A valid instance survives encode -> broker -> decode -> handler
    // without loss.
    let instance = json!({"username": "alice", "email": "a@b.c", "age": 30});
    let result = caller
        .call_rpc("users", "create", instance.clone())
        .await
        .unwrap();
    assert_eq!(result, instance);

    // An invalid instance is refused with the field named, and the
    // violations ride in the details.
    let err = caller
        .call_rpc(
            "users",
            "create",
            json!({"username": "ab", "email": "x@y", "age": 25}),
        )
        .await
        .unwrap_err();
    match err {
        ServiceError::Rpc {
            kind,
            message,
            details,
        } => {
            assert_eq!(kind, ErrorKind::ValidationError);
            assert!(message.contains("username"));
            assert!(details["violations"].is_array());
        }
        other => panic!("expected validation error, got {:?}", other),
    }
}

#[tokio::test]
async fn timer_under_load_records_missed_ticks_without_overlap() {
    let broker = Arc::new(ChannelBroker::new());
    let in_flight = Arc::new(AtomicUsize::new(0));
    let overlap_seen = Arc::new(AtomicUsize::new(0));

    let body_in_flight = in_flight.clone();
    let body_overlap = overlap_seen.clone();
    let service = Service::builder(config("ticker"))
        .with_broker(broker.clone() as Arc<dyn Broker>)
        .timer(
            "busy",
            TimerSpec::new(Duration::from_millis(50)).max_drift(Duration::from_millis(500)),
            move || {
                let in_flight = body_in_flight.clone();
                let overlap = body_overlap.clone();
                async move {
                    if in_flight.fetch_add(1, Ordering::SeqCst) > 0 {
                        overlap.fetch_add(1, Ordering::SeqCst);
                    }
                    tokio::time::sleep(Duration::from_millis(120)).await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                }
            },
        )
        .build()
        .unwrap();

    service.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;
    service.stop().await.unwrap();

    let stats = &service.timer_stats()[0];
    assert!(
        (3..=5).contains(&stats.execution_count),
        "executions = {}",
        stats.execution_count
    );
    assert!(stats.missed_ticks > 0, "expected missed ticks");
    assert_eq!(overlap_seen.load(Ordering::SeqCst), 0, "timer overlapped");
}

#[tokio::test]
async fn async_call_reaches_handler_exactly_once() {
    let broker = Arc::new(ChannelBroker::new());
    let received = Arc::new(AtomicUsize::new(0));

    let handler_received = received.clone();
    let audit = Service::builder(config("audit"))
        .with_broker(broker.clone() as Arc<dyn Broker>)
        .async_rpc("log_event", move |payload: Value| {
            let received = handler_received.clone();
            async move {
                assert_eq!(payload["event"], "login");
                received.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .build()
        .unwrap();
    audit.start().await.unwrap();

    let caller = Service::builder(config("caller"))
        .with_broker(broker.clone() as Arc<dyn Broker>)
        .build()
        .unwrap();
    caller.start().await.unwrap();

    caller
        .call_async("audit", "log_event", json!({"event": "login"}))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(received.load(Ordering::SeqCst), 1);
}
