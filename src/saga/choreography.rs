//! Choreography-based sagas.
//!
//! Instead of a coordinator issuing RPCs, each participant subscribes to
//! an event and emits a success or failure event after handling it; the
//! broker's fanout replaces central orchestration. There is no
//! centralized compensation ordering in this mode: participants listen
//! for failure events and issue their own rollback events.
//!
//! Subjects: a step named `reserve` in saga `travel` emits
//! `travel.completed.reserve` on success and `travel.failed.reserve` on
//! failure, carrying the original payload (plus the error on failure).

use std::future::Future;
use std::sync::Arc;

use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::broker::Broker;
use crate::message::Envelope;
use crate::service::ServiceBuilder;

/// Names the event subjects of one choreographed saga.
#[derive(Debug, Clone)]
pub struct ChoreographySaga {
    name: String,
}

impl ChoreographySaga {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Subject a step's success event is published on.
    pub fn completed_subject(&self, step: &str) -> String {
        format!("{}.completed.{}", self.name, step)
    }

    /// Subject a step's failure event is published on.
    pub fn failed_subject(&self, step: &str) -> String {
        format!("{}.failed.{}", self.name, step)
    }

    /// Register a step on a service: listen on `trigger`, run the
    /// handler, then emit the step's success or failure event through
    /// the given broker handle. The success event carries the handler's
    /// output; the failure event carries the original payload and the
    /// error text so downstream participants can roll back.
    pub fn step<F, Fut>(
        &self,
        builder: ServiceBuilder,
        broker: Arc<dyn Broker>,
        step_name: &str,
        trigger: &str,
        handler: F,
    ) -> ServiceBuilder
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, String>> + Send + 'static,
    {
        let completed = self.completed_subject(step_name);
        let failed = self.failed_subject(step_name);
        let saga_name = self.name.clone();
        let step = step_name.to_string();
        let handler = Arc::new(handler);

        builder.listen(trigger, move |_subject, payload| {
            let broker = broker.clone();
            let completed = completed.clone();
            let failed = failed.clone();
            let saga_name = saga_name.clone();
            let step = step.clone();
            let handler = handler.clone();
            async move {
                let (subject, outcome) = match handler(payload.clone()).await {
                    Ok(result) => {
                        debug!(saga = %saga_name, step = %step, "Choreography step completed");
                        (completed, result)
                    }
                    Err(error) => {
                        warn!(saga = %saga_name, step = %step, error = %error, "Choreography step failed");
                        (failed, json!({ "payload": payload, "error": error }))
                    }
                };

                let bytes = Envelope::new(outcome)
                    .encode()
                    .map_err(crate::service::ServiceError::from)?;
                broker.publish(&subject, bytes).await?;
                Ok(())
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subject_derivation() {
        let saga = ChoreographySaga::new("travel");
        assert_eq!(saga.completed_subject("book_flight"), "travel.completed.book_flight");
        assert_eq!(saga.failed_subject("book_hotel"), "travel.failed.book_hotel");
    }
}
