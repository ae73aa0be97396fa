//! Inbound message dispatch.
//!
//! One loop per subscription pulls deliveries and hands each to its own
//! task, so handler duration never blocks the loop. Dispatch stages run
//! in a fixed order: decode, authenticate, validate, then the handler,
//! with the envelope's correlation ID installed for the duration and a
//! tracing span carrying it into every log line.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, warn, Instrument};

use crate::broker::{Broker, Delivery, Subscription};
use crate::correlation;
use crate::errors::ErrorKind;
use crate::message::{Envelope, Reply};
use crate::registry::{HandlerDescriptor, InboundRequest};
use crate::service::{AuthPolicy, Lifecycle, ServiceError};

/// Everything one subscription loop needs to dispatch a delivery.
#[derive(Clone)]
pub(crate) struct DispatchContext {
    pub service_name: String,
    pub broker: Arc<dyn Broker>,
    pub descriptor: HandlerDescriptor,
    pub auth: Option<Arc<dyn AuthPolicy>>,
    pub in_flight: Arc<AtomicUsize>,
    /// Dispatch inline instead of spawning (cooperative mode).
    pub serialized: bool,
}

/// Pull deliveries until shutdown; spawn a task per message.
///
/// In-flight handler tasks live in a `JoinSet` owned by this loop, so
/// aborting the loop cancels whatever is still running.
pub(crate) async fn subscription_loop(
    ctx: DispatchContext,
    mut subscription: Subscription,
    mut shutdown: watch::Receiver<bool>,
    lifecycle: Arc<watch::Sender<Lifecycle>>,
) {
    let mut handlers: JoinSet<()> = JoinSet::new();

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            // Reap finished handler tasks so the set does not grow.
            Some(_) = handlers.join_next(), if !handlers.is_empty() => {}
            delivery = subscription.next() => match delivery {
                Some(delivery) => {
                    ctx.in_flight.fetch_add(1, Ordering::SeqCst);
                    if ctx.serialized {
                        dispatch_delivery(&ctx, delivery).await;
                        ctx.in_flight.fetch_sub(1, Ordering::SeqCst);
                    } else {
                        let task_ctx = ctx.clone();
                        handlers.spawn(async move {
                            dispatch_delivery(&task_ctx, delivery).await;
                            task_ctx.in_flight.fetch_sub(1, Ordering::SeqCst);
                        });
                    }
                }
                None => {
                    if !*shutdown.borrow() {
                        warn!(
                            service = %ctx.service_name,
                            subject = %subscription.pattern(),
                            "Subscription closed unexpectedly"
                        );
                        let _ = lifecycle.send(Lifecycle::Failed);
                    }
                    break;
                }
            }
        }
    }

    debug!(
        service = %ctx.service_name,
        subject = %subscription.pattern(),
        "Subscription loop ended"
    );
}

/// Dispatch one delivery: decode, authenticate, validate, invoke, reply.
pub(crate) async fn dispatch_delivery(ctx: &DispatchContext, delivery: Delivery) {
    let expects_reply = ctx.descriptor.expects_reply;
    let reply_inbox = delivery.reply.clone();

    let envelope = match Envelope::decode(&delivery.payload) {
        Ok(envelope) => envelope,
        Err(e) => {
            if expects_reply {
                if let Some(inbox) = reply_inbox {
                    let reply =
                        Reply::error(ErrorKind::ValidationError, format!("malformed envelope: {}", e));
                    send_reply(ctx, &inbox, reply).await;
                    return;
                }
            }
            warn!(
                service = %ctx.service_name,
                subject = %delivery.subject,
                error = %e,
                "Dropping undecodable message"
            );
            return;
        }
    };

    let correlation_id = envelope.correlation_or_mint();
    let span = tracing::info_span!(
        "dispatch",
        service = %ctx.service_name,
        subject = %delivery.subject,
        correlation_id = %correlation_id,
    );

    correlation::with_correlation(
        correlation_id,
        dispatch_stages(ctx, delivery.subject, envelope, expects_reply, reply_inbox)
            .instrument(span),
    )
    .await;
}

async fn dispatch_stages(
    ctx: &DispatchContext,
    subject: String,
    envelope: Envelope,
    expects_reply: bool,
    reply_inbox: Option<String>,
) {
    // Authenticate before the payload is even validated.
    if let Some(policy) = &ctx.auth {
        if let Err(e) = policy.authorize(&subject, &envelope).await {
            warn!(error = %e, "Request refused by access policy");
            if expects_reply {
                if let Some(inbox) = reply_inbox {
                    send_reply(ctx, &inbox, Reply::error(e.kind(), e.to_string())).await;
                }
            }
            return;
        }
    }

    // Value-level schema validation; the handler never sees bad input.
    if let Some(schema) = &ctx.descriptor.request_schema {
        if let Err(failure) = schema.validate(&envelope.payload) {
            debug!(schema = schema.tag(), error = %failure, "Payload failed validation");
            if expects_reply {
                if let Some(inbox) = reply_inbox {
                    let details = serde_json::json!({ "violations": failure.violations });
                    let reply = Reply::error_with_details(
                        ErrorKind::ValidationError,
                        failure.to_string(),
                        details,
                    );
                    send_reply(ctx, &inbox, reply).await;
                }
            }
            return;
        }
    }

    #[cfg(feature = "otel")]
    let started = std::time::Instant::now();

    let request = InboundRequest {
        subject,
        payload: envelope.payload,
    };
    let result = (ctx.descriptor.handler)(request).await;

    #[cfg(feature = "otel")]
    {
        use crate::metrics;
        use opentelemetry::KeyValue;
        let outcome = if result.is_ok() { "ok" } else { "error" };
        let attrs = [
            metrics::service_attr(&ctx.service_name),
            KeyValue::new("outcome", outcome),
        ];
        metrics::DISPATCH_TOTAL.add(1, &attrs);
        metrics::DISPATCH_DURATION.record(started.elapsed().as_secs_f64(), &attrs);
    }

    match (expects_reply, reply_inbox) {
        (true, Some(inbox)) => {
            let reply = match result {
                Ok(value) => Reply::ok(value),
                Err(e) => {
                    warn!(error = %e, "Handler failed, answering with error reply");
                    Reply::error_with_details(e.kind(), e.to_string(), error_details(&e))
                }
            };
            send_reply(ctx, &inbox, reply).await;
        }
        _ => {
            if let Err(e) = result {
                error!(error = %e, "Handler failed");
            }
        }
    }
}

fn error_details(error: &ServiceError) -> serde_json::Value {
    match error {
        ServiceError::Validation(failure) => {
            serde_json::json!({ "violations": failure.violations })
        }
        ServiceError::Rpc { details, .. } => details.clone(),
        _ => serde_json::Value::Null,
    }
}

async fn send_reply(ctx: &DispatchContext, inbox: &str, reply: Reply) {
    let bytes = match reply.encode() {
        Ok(bytes) => bytes,
        Err(e) => {
            error!(error = %e, "Failed to encode reply");
            return;
        }
    };
    if let Err(e) = ctx.broker.publish(inbox, bytes).await {
        warn!(inbox = %inbox, error = %e, "Failed to publish reply");
    }
}
