//! Orchestrated saga execution.
//!
//! The coordinator drives each saga forward one step at a time. A step
//! is retried with exponential backoff, bounded by both its own retry
//! count and the remaining saga budget. Once a step fails for good, the
//! previously completed steps are compensated in strict reverse order;
//! the coordinator never advances forward again after a compensation
//! attempt. A compensation that exhausts its own small retry budget
//! leaves the saga in the terminal `CompensationFailed` state and
//! escalates through the log.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::correlation;
use crate::retry::RetryConfig;
use crate::service::{RpcCaller, ServiceError};

use super::{
    MemorySagaStore, Result, SagaContext, SagaDefinition, SagaError, SagaState, SagaStore,
    StepState,
};

/// Handle returned by `start_saga`; poll `get_saga_status` with it.
#[derive(Debug, Clone)]
pub struct StartedSaga {
    pub saga_id: String,
    pub correlation_id: String,
}

/// Defines and executes sagas against participant services.
pub struct SagaCoordinator {
    caller: Arc<dyn RpcCaller>,
    store: Arc<dyn SagaStore>,
    retry: RetryConfig,
    compensation_retry: RetryConfig,
    definitions: RwLock<HashMap<String, SagaDefinition>>,
}

impl SagaCoordinator {
    /// Coordinator with in-memory persistence.
    pub fn new(caller: Arc<dyn RpcCaller>) -> Self {
        Self {
            caller,
            store: Arc::new(MemorySagaStore::new()),
            retry: RetryConfig::default(),
            compensation_retry: RetryConfig::for_compensation(),
            definitions: RwLock::new(HashMap::new()),
        }
    }

    /// Write contexts through the given store on every transition.
    pub fn with_store(mut self, store: Arc<dyn SagaStore>) -> Self {
        self.store = store;
        self
    }

    /// Backoff configuration for forward-step retries.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Register a saga type with its ordered steps.
    pub async fn define_saga(&self, saga_type: &str, definition: SagaDefinition) -> Result<()> {
        if definition.steps.is_empty() {
            return Err(SagaError::Definition(format!(
                "saga '{}' has no steps",
                saga_type
            )));
        }
        let mut names = std::collections::HashSet::new();
        for step in &definition.steps {
            if !names.insert(step.name.as_str()) {
                return Err(SagaError::Definition(format!(
                    "saga '{}' has duplicate step '{}'",
                    saga_type, step.name
                )));
            }
        }

        let mut definitions = self.definitions.write().await;
        definitions.insert(saga_type.to_string(), definition);
        info!(saga_type = %saga_type, "Saga defined");
        Ok(())
    }

    /// Start a saga instance; it runs asynchronously.
    pub async fn start_saga(self: &Arc<Self>, saga_type: &str, data: Value) -> Result<StartedSaga> {
        let definition = {
            let definitions = self.definitions.read().await;
            definitions
                .get(saga_type)
                .cloned()
                .ok_or_else(|| SagaError::UnknownType(saga_type.to_string()))?
        };

        let saga_id = Uuid::new_v4().simple().to_string();
        let correlation_id = correlation::current_or_mint();
        let context = SagaContext::new(
            saga_id.clone(),
            correlation_id.clone(),
            saga_type.to_string(),
            data,
            &definition,
        );
        self.persist(&context).await;

        info!(
            saga_id = %saga_id,
            saga_type = %saga_type,
            correlation_id = %correlation_id,
            steps = context.steps.len(),
            "Saga started"
        );

        let coordinator = self.clone();
        tokio::spawn(async move {
            coordinator.run_saga(definition, context).await;
        });

        Ok(StartedSaga {
            saga_id,
            correlation_id,
        })
    }

    /// Current context of a saga, if known to the store.
    pub async fn get_saga_status(&self, saga_id: &str) -> Result<Option<SagaContext>> {
        Ok(self.store.load(saga_id).await?)
    }

    /// IDs of sagas still in flight.
    pub async fn list_active(&self) -> Result<Vec<String>> {
        Ok(self.store.list_active().await?)
    }

    async fn persist(&self, context: &SagaContext) {
        if let Err(e) = self.store.save(context).await {
            warn!(saga_id = %context.saga_id, error = %e, "Saga store save failed");
        }
    }

    async fn run_saga(&self, definition: SagaDefinition, mut context: SagaContext) {
        context.state = SagaState::Running;
        context.touch();
        self.persist(&context).await;

        let deadline = Instant::now() + definition.total_budget;

        for index in 0..context.steps.len() {
            context.current_step = index;
            if !self.execute_step(&mut context, index, deadline).await {
                self.compensate(&mut context, index).await;
                return;
            }
        }

        context.state = SagaState::Completed;
        context.touch();
        self.persist(&context).await;
        info!(
            saga_id = %context.saga_id,
            saga_type = %context.saga_type,
            "Saga completed"
        );
    }

    /// Run one forward step with retries. Returns false once the step
    /// has failed for good.
    async fn execute_step(
        &self,
        context: &mut SagaContext,
        index: usize,
        deadline: Instant,
    ) -> bool {
        let (service, action, step_name, timeout, retry_count) = {
            let step = &mut context.steps[index];
            step.state = StepState::Running;
            (
                step.service.clone(),
                step.action.clone(),
                step.name.clone(),
                step.timeout(),
                step.retry_count,
            )
        };
        context.touch();
        self.persist(context).await;

        let args = json!({
            "saga_id": context.saga_id,
            "correlation_id": context.correlation_id,
            "step": step_name,
            "data": context.data,
        });

        let mut attempt = 0u32;
        loop {
            let outcome = self
                .call_with_timeout(&service, &action, args.clone(), timeout, &context.correlation_id)
                .await;
            context.steps[index].attempts = attempt + 1;

            match outcome {
                Ok(result) => {
                    let step = &mut context.steps[index];
                    step.state = StepState::Completed;
                    step.result = Some(result);
                    context.touch();
                    self.persist(context).await;
                    debug!(
                        saga_id = %context.saga_id,
                        step = %step_name,
                        "Saga step completed"
                    );
                    return true;
                }
                Err(e) => {
                    let out_of_budget = Instant::now() >= deadline;
                    if attempt >= retry_count || out_of_budget {
                        let step = &mut context.steps[index];
                        step.state = StepState::Failed;
                        step.error = Some(e.to_string());
                        context.touch();
                        self.persist(context).await;
                        warn!(
                            saga_id = %context.saga_id,
                            step = %step_name,
                            attempts = attempt + 1,
                            out_of_budget,
                            error = %e,
                            "Saga step failed, compensating"
                        );
                        return false;
                    }

                    #[cfg(feature = "otel")]
                    crate::metrics::SAGA_RETRY_TOTAL.add(
                        1,
                        &[crate::metrics::saga_type_attr(&context.saga_type)],
                    );

                    // A retried step stays Running until retries are
                    // exhausted; back off within the remaining budget.
                    let mut delay = self.retry.delay_for_attempt(attempt);
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if delay > remaining {
                        delay = remaining;
                    }
                    debug!(
                        saga_id = %context.saga_id,
                        step = %step_name,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Saga step failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Compensate previously completed steps in strict reverse order.
    /// `failed_index` itself never completed, so it is not compensated.
    async fn compensate(&self, context: &mut SagaContext, failed_index: usize) {
        context.state = SagaState::Compensating;
        context.touch();
        self.persist(context).await;

        #[cfg(feature = "otel")]
        crate::metrics::SAGA_COMPENSATION_TOTAL.add(
            1,
            &[crate::metrics::saga_type_attr(&context.saga_type)],
        );

        for index in (0..failed_index).rev() {
            if context.steps[index].state != StepState::Completed {
                continue;
            }

            let (service, step_name, compensation, original_result) = {
                let step = &context.steps[index];
                (
                    step.service.clone(),
                    step.name.clone(),
                    step.compensation.clone(),
                    step.result.clone().unwrap_or(Value::Null),
                )
            };

            let Some(compensation) = compensation else {
                // Nothing to undo for this step.
                context.steps[index].state = StepState::Compensated;
                context.touch();
                self.persist(context).await;
                continue;
            };

            context.steps[index].state = StepState::Compensating;
            context.touch();
            self.persist(context).await;

            let args = json!({
                "saga_id": context.saga_id,
                "correlation_id": context.correlation_id,
                "step": step_name,
                "data": context.data,
                "original_result": original_result,
            });
            let timeout = context.steps[index].timeout();

            let mut attempt = 0u32;
            loop {
                match self
                    .call_with_timeout(&service, &compensation, args.clone(), timeout, &context.correlation_id)
                    .await
                {
                    Ok(_) => {
                        context.steps[index].state = StepState::Compensated;
                        context.touch();
                        self.persist(context).await;
                        info!(
                            saga_id = %context.saga_id,
                            step = %step_name,
                            "Saga step compensated"
                        );
                        break;
                    }
                    Err(e) if self.compensation_retry.should_retry(attempt) => {
                        let delay = self.compensation_retry.delay_for_attempt(attempt);
                        warn!(
                            saga_id = %context.saga_id,
                            step = %step_name,
                            attempt = attempt + 1,
                            error = %e,
                            "Compensation failed, retrying"
                        );
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                    }
                    Err(e) => {
                        context.steps[index].error = Some(e.to_string());
                        context.state = SagaState::CompensationFailed;
                        context.touch();
                        self.persist(context).await;
                        error!(
                            saga_id = %context.saga_id,
                            saga_type = %context.saga_type,
                            step = %step_name,
                            correlation_id = %context.correlation_id,
                            error = %e,
                            "ESCALATION: saga compensation failed, manual intervention required"
                        );
                        return;
                    }
                }
            }
        }

        context.state = SagaState::Compensated;
        context.touch();
        self.persist(context).await;
        info!(
            saga_id = %context.saga_id,
            saga_type = %context.saga_type,
            "Saga compensated"
        );
    }

    async fn call_with_timeout(
        &self,
        service: &str,
        method: &str,
        args: Value,
        timeout: std::time::Duration,
        correlation_id: &str,
    ) -> std::result::Result<Value, ServiceError> {
        let call = self.caller.call(service, method, args);
        match tokio::time::timeout(
            timeout,
            correlation::with_correlation(correlation_id.to_string(), call),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(ServiceError::RpcTimeout(timeout)),
        }
    }
}
