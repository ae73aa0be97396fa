//! Distributed transactions (sagas).
//!
//! This module contains:
//! - `SagaStep` / `SagaContext`: definition and runtime state of a saga
//! - `SagaCoordinator`: orchestrated execution with per-step retry and
//!   strict reverse-order compensation
//! - `SagaStore`: pluggable persistence for saga contexts
//! - `choreography`: the event-driven variant without a coordinator
//!
//! A participant service exposes two RPC methods per step, one for the
//! forward action and one for the compensation; both receive the saga
//! and correlation IDs so sub-calls inside a step stay traceable.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub mod choreography;
mod coordinator;
mod store;

pub use choreography::ChoreographySaga;
pub use coordinator::{SagaCoordinator, StartedSaga};
pub use store::{MemorySagaStore, SagaStore, SagaStoreError};

/// Result type for saga operations.
pub type Result<T> = std::result::Result<T, SagaError>;

/// Errors raised by the saga coordinator.
#[derive(Debug, thiserror::Error)]
pub enum SagaError {
    #[error("unknown saga type '{0}'")]
    UnknownType(String),

    #[error("invalid saga definition: {0}")]
    Definition(String),

    #[error("saga store error: {0}")]
    Store(#[from] SagaStoreError),
}

/// Overall state of a saga.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SagaState {
    Pending,
    Running,
    Completed,
    Failed,
    Compensating,
    Compensated,
    /// A compensation exhausted its retries; terminal, requires operator
    /// attention.
    CompensationFailed,
}

impl SagaState {
    /// Terminal states are never left.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SagaState::Completed | SagaState::Compensated | SagaState::CompensationFailed
        )
    }
}

/// State of one step within a saga.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepState {
    Pending,
    Running,
    Completed,
    Failed,
    Compensating,
    Compensated,
}

/// Definition of one saga step.
#[derive(Debug, Clone)]
pub struct SagaStep {
    /// Step name, unique within the saga.
    pub name: String,
    /// Target service.
    pub service: String,
    /// Forward RPC method on the target service.
    pub action: String,
    /// Compensation RPC method; a step without one has nothing to undo.
    pub compensation: Option<String>,
    /// Per-attempt timeout of the forward call.
    pub timeout: Duration,
    /// Retries after the initial attempt.
    pub retry_count: u32,
}

impl SagaStep {
    pub fn new(
        name: impl Into<String>,
        service: impl Into<String>,
        action: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            service: service.into(),
            action: action.into(),
            compensation: None,
            timeout: Duration::from_secs(5),
            retry_count: 2,
        }
    }

    pub fn with_compensation(mut self, method: impl Into<String>) -> Self {
        self.compensation = Some(method.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retries(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }
}

/// Ordered steps plus the saga-wide time budget that bounds retries.
#[derive(Debug, Clone)]
pub struct SagaDefinition {
    pub steps: Vec<SagaStep>,
    pub total_budget: Duration,
}

impl SagaDefinition {
    pub fn new(steps: Vec<SagaStep>) -> Self {
        Self {
            steps,
            total_budget: Duration::from_secs(60),
        }
    }

    pub fn with_total_budget(mut self, budget: Duration) -> Self {
        self.total_budget = budget;
        self
    }
}

/// Runtime record of one step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    pub name: String,
    pub service: String,
    pub action: String,
    pub compensation: Option<String>,
    pub timeout_ms: u64,
    pub retry_count: u32,
    pub state: StepState,
    pub attempts: u32,
    pub result: Option<Value>,
    pub error: Option<String>,
}

impl StepRecord {
    fn from_step(step: &SagaStep) -> Self {
        Self {
            name: step.name.clone(),
            service: step.service.clone(),
            action: step.action.clone(),
            compensation: step.compensation.clone(),
            timeout_ms: step.timeout.as_millis() as u64,
            retry_count: step.retry_count,
            state: StepState::Pending,
            attempts: 0,
            result: None,
            error: None,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Full runtime state of one saga instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SagaContext {
    pub saga_id: String,
    pub correlation_id: String,
    pub saga_type: String,
    pub data: Value,
    pub steps: Vec<StepRecord>,
    pub current_step: usize,
    pub state: SagaState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SagaContext {
    pub(crate) fn new(
        saga_id: String,
        correlation_id: String,
        saga_type: String,
        data: Value,
        definition: &SagaDefinition,
    ) -> Self {
        let now = Utc::now();
        Self {
            saga_id,
            correlation_id,
            saga_type,
            data,
            steps: definition.steps.iter().map(StepRecord::from_step).collect(),
            current_step: 0,
            state: SagaState::Pending,
            created_at: now,
            updated_at: now,
        }
    }

    pub(crate) fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}
