//! Broker client abstraction.
//!
//! This module contains:
//! - `Broker` trait: subject-based pub/sub plus request/reply
//! - `Subscription` / `Delivery`: inbound message stream
//! - Subject grammar helpers
//! - Implementations: NATS (feature `nats`), in-memory channel
//!
//! The broker itself is an external collaborator; only its pub/sub and
//! request/reply semantics are assumed. Request/reply is at-most-once,
//! pub/sub fanout is at-least-once per the backing broker.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

pub mod channel;
#[cfg(feature = "nats")]
pub mod nats;
pub mod subject;

pub use channel::ChannelBroker;
#[cfg(feature = "nats")]
pub use nats::NatsBroker;
pub use subject::{subject_matches, validate_pattern, validate_subject, SubjectError};

/// Result type for broker operations.
pub type Result<T> = std::result::Result<T, BrokerError>;

/// Errors that can occur during broker operations.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("connection failed: {0}")]
    Connection(String),

    #[error("publish failed: {0}")]
    Publish(String),

    #[error("subscribe failed: {0}")]
    Subscribe(String),

    #[error("invalid subject: {0}")]
    Subject(#[from] SubjectError),

    #[error("no responders on subject '{0}'")]
    NoResponders(String),

    #[error("request timed out after {0:?}")]
    RequestTimeout(Duration),

    #[error("payload of {size} bytes exceeds broker limit of {limit} bytes")]
    PayloadTooLarge { size: usize, limit: usize },

    #[error("broker connection is closed")]
    Closed,
}

/// A single message delivered to a subscription.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Concrete subject the message was published on.
    pub subject: String,
    /// Raw payload bytes.
    pub payload: Vec<u8>,
    /// Reply inbox if the publisher awaits a response.
    pub reply: Option<String>,
}

/// A live subscription to a subject pattern.
///
/// Dropping the subscription unsubscribes; the backend stops forwarding
/// once it observes the closed channel.
#[derive(Debug)]
pub struct Subscription {
    pattern: String,
    rx: mpsc::Receiver<Delivery>,
}

impl Subscription {
    pub(crate) fn new(pattern: String, rx: mpsc::Receiver<Delivery>) -> Self {
        Self { pattern, rx }
    }

    /// Pattern this subscription was created with.
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Receive the next delivery; `None` once the connection is gone.
    pub async fn next(&mut self) -> Option<Delivery> {
        self.rx.recv().await
    }
}

/// Interface to a NATS-like broker.
///
/// Implementations:
/// - `NatsBroker`: real broker via async-nats (feature `nats`)
/// - `ChannelBroker`: in-process broker for tests and standalone mode
#[async_trait]
pub trait Broker: Send + Sync {
    /// Subscribe to a subject pattern (`*` one token, `>` tail).
    async fn subscribe(&self, pattern: &str) -> Result<Subscription>;

    /// Publish raw bytes to a concrete subject. Fire-and-forget.
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<()>;

    /// Publish and await a single reply on a private inbox.
    async fn request(&self, subject: &str, payload: Vec<u8>, timeout: Duration) -> Result<Vec<u8>>;

    /// Flush buffered publishes to the wire.
    async fn flush(&self) -> Result<()>;

    /// Stop accepting new work and let in-flight deliveries finish.
    async fn drain(&self) -> Result<()>;

    /// Close the connection. Further operations fail with `Closed`.
    async fn close(&self) -> Result<()>;
}
