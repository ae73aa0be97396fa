//! Saga persistence interface.
//!
//! Every state transition is written through the store so sagas survive
//! a coordinator crash. Without a configured store, contexts live in
//! memory only and are lost on restart; that is explicitly allowed for
//! non-critical use.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::SagaContext;

/// Errors raised by saga store backends.
#[derive(Debug, thiserror::Error)]
pub enum SagaStoreError {
    #[error("saga store backend failure: {0}")]
    Backend(String),
}

/// Pluggable persistence for saga contexts.
#[async_trait]
pub trait SagaStore: Send + Sync {
    /// Persist a context snapshot; called on every transition.
    async fn save(&self, context: &SagaContext) -> Result<(), SagaStoreError>;

    /// Load a context by saga ID.
    async fn load(&self, saga_id: &str) -> Result<Option<SagaContext>, SagaStoreError>;

    /// IDs of sagas not yet in a terminal state.
    async fn list_active(&self) -> Result<Vec<String>, SagaStoreError>;
}

/// In-memory store; the default when none is configured.
#[derive(Default)]
pub struct MemorySagaStore {
    contexts: RwLock<HashMap<String, SagaContext>>,
}

impl MemorySagaStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SagaStore for MemorySagaStore {
    async fn save(&self, context: &SagaContext) -> Result<(), SagaStoreError> {
        let mut contexts = self.contexts.write().await;
        contexts.insert(context.saga_id.clone(), context.clone());
        Ok(())
    }

    async fn load(&self, saga_id: &str) -> Result<Option<SagaContext>, SagaStoreError> {
        let contexts = self.contexts.read().await;
        Ok(contexts.get(saga_id).cloned())
    }

    async fn list_active(&self) -> Result<Vec<String>, SagaStoreError> {
        let contexts = self.contexts.read().await;
        Ok(contexts
            .values()
            .filter(|c| !c.state.is_terminal())
            .map(|c| c.saga_id.clone())
            .collect())
    }
}
