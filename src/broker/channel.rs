//! In-memory channel-based broker for standalone mode and tests.
//!
//! Uses tokio mpsc channels for pub/sub within a single process. The
//! full subject grammar is honored on the subscriber side, including
//! request/reply over private inboxes. Ideal for local development and
//! testing without external dependencies.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, RwLock};
use tracing::debug;
use uuid::Uuid;

use super::{
    subject_matches, validate_pattern, validate_subject, Broker, BrokerError, Delivery, Result,
    Subscription,
};

/// Per-subscription queue depth; a slow subscriber backpressures publishers.
const SUBSCRIPTION_CAPACITY: usize = 1024;

/// Default payload limit, matching the NATS server default.
const DEFAULT_MAX_PAYLOAD: usize = 1024 * 1024;

const STATE_OPEN: u8 = 0;
const STATE_DRAINING: u8 = 1;
const STATE_CLOSED: u8 = 2;

struct SubEntry {
    id: u64,
    pattern: String,
    tx: mpsc::Sender<Delivery>,
}

struct Inner {
    subs: RwLock<Vec<SubEntry>>,
    next_id: AtomicU64,
    state: AtomicU8,
    max_payload: usize,
}

/// In-process broker sharing one subject space between all clones.
#[derive(Clone)]
pub struct ChannelBroker {
    inner: Arc<Inner>,
}

impl Default for ChannelBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelBroker {
    /// Create a broker with the default payload limit.
    pub fn new() -> Self {
        Self::with_max_payload(DEFAULT_MAX_PAYLOAD)
    }

    /// Create a broker with a specific payload limit.
    pub fn with_max_payload(max_payload: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                subs: RwLock::new(Vec::new()),
                next_id: AtomicU64::new(0),
                state: AtomicU8::new(STATE_OPEN),
                max_payload,
            }),
        }
    }

    fn ensure_open(&self) -> Result<()> {
        match self.inner.state.load(Ordering::SeqCst) {
            STATE_OPEN => Ok(()),
            _ => Err(BrokerError::Closed),
        }
    }

    async fn subscribe_inner(&self, pattern: &str) -> Result<Subscription> {
        self.ensure_open()?;
        validate_pattern(pattern)?;

        let (tx, rx) = mpsc::channel(SUBSCRIPTION_CAPACITY);
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);

        let mut subs = self.inner.subs.write().await;
        subs.push(SubEntry {
            id,
            pattern: pattern.to_string(),
            tx,
        });

        debug!(pattern = %pattern, id, "Channel subscription created");
        Ok(Subscription::new(pattern.to_string(), rx))
    }

    /// Deliver to every matching subscription; returns the delivery count.
    async fn publish_inner(
        &self,
        subject: &str,
        payload: Vec<u8>,
        reply: Option<String>,
    ) -> Result<usize> {
        self.ensure_open()?;
        validate_subject(subject)?;

        if payload.len() > self.inner.max_payload {
            return Err(BrokerError::PayloadTooLarge {
                size: payload.len(),
                limit: self.inner.max_payload,
            });
        }

        let mut delivered = 0usize;
        let mut dead: Vec<u64> = Vec::new();
        {
            let subs = self.inner.subs.read().await;
            for entry in subs.iter() {
                if !subject_matches(&entry.pattern, subject) {
                    continue;
                }
                let delivery = Delivery {
                    subject: subject.to_string(),
                    payload: payload.clone(),
                    reply: reply.clone(),
                };
                // Awaiting here is the broker's flow control: a full
                // subscriber queue blocks the publisher.
                match entry.tx.send(delivery).await {
                    Ok(()) => delivered += 1,
                    Err(_) => dead.push(entry.id),
                }
            }
        }

        if !dead.is_empty() {
            let mut subs = self.inner.subs.write().await;
            subs.retain(|entry| !dead.contains(&entry.id));
        }

        debug!(subject = %subject, delivered, "Published to channel broker");
        Ok(delivered)
    }
}

#[async_trait]
impl Broker for ChannelBroker {
    async fn subscribe(&self, pattern: &str) -> Result<Subscription> {
        self.subscribe_inner(pattern).await
    }

    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<()> {
        self.publish_inner(subject, payload, None).await?;
        Ok(())
    }

    async fn request(&self, subject: &str, payload: Vec<u8>, timeout: Duration) -> Result<Vec<u8>> {
        let inbox = format!("_INBOX.{}", Uuid::new_v4().simple());
        let mut reply_sub = self.subscribe_inner(&inbox).await?;

        let delivered = self
            .publish_inner(subject, payload, Some(inbox.clone()))
            .await?;
        if delivered == 0 {
            return Err(BrokerError::NoResponders(subject.to_string()));
        }

        match tokio::time::timeout(timeout, reply_sub.next()).await {
            Ok(Some(delivery)) => Ok(delivery.payload),
            Ok(None) => Err(BrokerError::Closed),
            Err(_) => Err(BrokerError::RequestTimeout(timeout)),
        }
    }

    async fn flush(&self) -> Result<()> {
        // Deliveries are pushed synchronously; nothing is buffered.
        Ok(())
    }

    async fn drain(&self) -> Result<()> {
        self.inner
            .state
            .compare_exchange(
                STATE_OPEN,
                STATE_DRAINING,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .ok();
        // Give in-flight deliveries a chance to be consumed.
        tokio::task::yield_now().await;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.inner.state.store(STATE_CLOSED, Ordering::SeqCst);
        let mut subs = self.inner.subs.write().await;
        subs.clear();
        Ok(())
    }
}
