//! NATS broker backend.
//!
//! Thin adapter from the `Broker` trait onto an async-nats core client.
//! Request/reply uses the client's per-request reply inbox; the caller's
//! timeout is enforced locally so it is honored even while the client is
//! buffering or reconnecting.
//!
//! JetStream durable streams are intentionally not used here; the
//! `jetstream_enabled` config flag is accepted and logged by the service
//! kernel but plain core subjects carry all traffic.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{Broker, BrokerError, Delivery, Result, Subscription};

/// Forwarding queue depth between the NATS subscriber and the service.
const SUBSCRIPTION_CAPACITY: usize = 1024;

/// Broker backed by a core NATS connection.
#[derive(Clone)]
pub struct NatsBroker {
    client: async_nats::Client,
}

impl NatsBroker {
    /// Connect to a NATS server, retrying with exponential backoff.
    ///
    /// `max_attempts` bounds the initial connection attempts; once
    /// connected, the client reconnects on its own.
    pub async fn connect(
        url: &str,
        max_attempts: u32,
        reconnect_wait: Duration,
    ) -> Result<Self> {
        let mut delay = Duration::from_millis(100);
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let options = async_nats::ConnectOptions::new().event_callback(|event| async move {
                warn!(?event, "NATS client event");
            });

            match options.connect(url).await {
                Ok(client) => {
                    info!(url = %url, "Connected to NATS");
                    return Ok(Self { client });
                }
                Err(e) if attempt < max_attempts => {
                    warn!(
                        url = %url,
                        attempt,
                        max_attempts,
                        error = %e,
                        "NATS connect failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    delay = std::cmp::min(delay * 2, reconnect_wait);
                }
                Err(e) => {
                    return Err(BrokerError::Connection(format!(
                        "failed to connect to {} after {} attempts: {}",
                        url, max_attempts, e
                    )));
                }
            }
        }
    }

    /// Wrap an already-connected client.
    pub fn from_client(client: async_nats::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Broker for NatsBroker {
    async fn subscribe(&self, pattern: &str) -> Result<Subscription> {
        super::validate_pattern(pattern)?;

        let mut subscriber = self
            .client
            .subscribe(pattern.to_string())
            .await
            .map_err(|e| BrokerError::Subscribe(e.to_string()))?;

        let (tx, rx) = mpsc::channel(SUBSCRIPTION_CAPACITY);
        let forwarded_pattern = pattern.to_string();

        tokio::spawn(async move {
            loop {
                match subscriber.next().await {
                    Some(msg) => {
                        let delivery = Delivery {
                            subject: msg.subject.to_string(),
                            payload: msg.payload.to_vec(),
                            reply: msg.reply.map(|r| r.to_string()),
                        };
                        // Subscription handle dropped means stop forwarding.
                        if tx.send(delivery).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            let _ = subscriber.unsubscribe().await;
            debug!(pattern = %forwarded_pattern, "NATS subscription ended");
        });

        Ok(Subscription::new(pattern.to_string(), rx))
    }

    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<()> {
        super::validate_subject(subject)?;
        self.client
            .publish(subject.to_string(), payload.into())
            .await
            .map_err(|e| BrokerError::Publish(e.to_string()))
    }

    async fn request(&self, subject: &str, payload: Vec<u8>, timeout: Duration) -> Result<Vec<u8>> {
        super::validate_subject(subject)?;

        match tokio::time::timeout(
            timeout,
            self.client.request(subject.to_string(), payload.into()),
        )
        .await
        {
            Ok(Ok(msg)) => Ok(msg.payload.to_vec()),
            Ok(Err(e)) => match e.kind() {
                async_nats::RequestErrorKind::NoResponders => {
                    Err(BrokerError::NoResponders(subject.to_string()))
                }
                async_nats::RequestErrorKind::TimedOut => {
                    Err(BrokerError::RequestTimeout(timeout))
                }
                async_nats::RequestErrorKind::Other => {
                    Err(BrokerError::Connection(e.to_string()))
                }
            },
            Err(_) => Err(BrokerError::RequestTimeout(timeout)),
        }
    }

    async fn flush(&self) -> Result<()> {
        self.client
            .flush()
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))
    }

    async fn drain(&self) -> Result<()> {
        self.client
            .drain()
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))
    }

    async fn close(&self) -> Result<()> {
        // async-nats closes the connection once drained.
        self.drain().await
    }
}
