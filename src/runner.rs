//! Service runner.
//!
//! Supervises a collection of services in one process: starts them,
//! restarts failed ones under their configured restart policy, and
//! coordinates a parallel graceful shutdown on signal. Services never
//! hold a reference back to the runner; supervision is one-way through
//! each service's lifecycle watch.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::broker::Broker;
use crate::config::RunnerConfig;
use crate::service::{Lifecycle, Service, ServiceError};

/// Handle for requesting a runner shutdown from elsewhere.
#[derive(Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    /// Ask the runner to stop every service and return.
    pub fn shutdown(&self) {
        let _ = self.tx.send(true);
    }
}

/// Supervises services with restart-on-failure and coordinated shutdown.
pub struct ServiceRunner {
    config: RunnerConfig,
    services: Vec<Arc<Service>>,
    shutdown: Arc<watch::Sender<bool>>,
    #[allow(dead_code)] // only populated with the nats feature
    shared_brokers: HashMap<String, Arc<dyn Broker>>,
}

impl Default for ServiceRunner {
    fn default() -> Self {
        Self::new(RunnerConfig::default())
    }
}

impl ServiceRunner {
    pub fn new(config: RunnerConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            config,
            services: Vec::new(),
            shutdown: Arc::new(shutdown),
            shared_brokers: HashMap::new(),
        }
    }

    /// Register a built service; returns a handle for direct access.
    pub fn add_service(&mut self, service: Service) -> Arc<Service> {
        let service = Arc::new(service);
        self.services.push(service.clone());
        service
    }

    /// Handle that triggers a graceful shutdown of `run_forever`.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: self.shutdown.clone(),
        }
    }

    /// One broker connection per URL, for services that opt into
    /// sharing. Requires `share_connections` in the runner config.
    #[cfg(feature = "nats")]
    pub async fn shared_broker(&mut self, url: &str) -> Result<Arc<dyn Broker>, ServiceError> {
        if !self.config.share_connections {
            return Err(ServiceError::Configuration(
                "share_connections is disabled in the runner config".to_string(),
            ));
        }
        if let Some(broker) = self.shared_brokers.get(url) {
            return Ok(broker.clone());
        }
        let broker: Arc<dyn Broker> = Arc::new(
            crate::broker::NatsBroker::connect(url, 10, std::time::Duration::from_secs(2)).await?,
        );
        self.shared_brokers.insert(url.to_string(), broker.clone());
        Ok(broker)
    }

    /// Start every service and supervise until shutdown.
    ///
    /// A failed service is restarted after its `restart_delay`, up to
    /// `max_restart_attempts`; past the budget (or with `auto_restart`
    /// off) it is marked degraded and left stopped. Returns once every
    /// supervisor has ended: after a shutdown signal, or when all
    /// services are degraded.
    pub async fn run_forever(&self) -> Result<(), ServiceError> {
        if self.services.is_empty() {
            return Err(ServiceError::Configuration(
                "runner has no services".to_string(),
            ));
        }

        info!(services = self.services.len(), "Runner starting");

        let mut supervisors = Vec::new();
        for service in &self.services {
            supervisors.push(tokio::spawn(supervise(
                service.clone(),
                self.shutdown.subscribe(),
            )));
        }

        // Relay ctrl-c into the shutdown channel; programmatic shutdown
        // comes through the same channel.
        let shutdown = self.shutdown.clone();
        let signal_task = tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Interrupt received, shutting down");
                let _ = shutdown.send(true);
            }
        });

        join_all(supervisors).await;
        signal_task.abort();

        info!("Runner stopped");
        Ok(())
    }
}

/// Supervision loop of one service.
async fn supervise(service: Arc<Service>, mut shutdown: watch::Receiver<bool>) {
    let config = service.config().clone();
    let mut restart_attempts = 0u32;

    loop {
        if *shutdown.borrow() {
            return;
        }

        match service.start().await {
            Ok(()) => {
                let mut lifecycle = service.watch_lifecycle();
                let failed = loop {
                    let state = *lifecycle.borrow_and_update();
                    match state {
                        Lifecycle::Failed => break true,
                        Lifecycle::Stopped => break false,
                        _ => {}
                    }
                    tokio::select! {
                        _ = shutdown.changed() => {
                            if let Err(e) = service.stop().await {
                                warn!(service = %config.name, error = %e, "Stop failed during shutdown");
                            }
                            return;
                        }
                        changed = lifecycle.changed() => {
                            if changed.is_err() {
                                return;
                            }
                        }
                    }
                };

                if !failed {
                    // Stopped externally; supervision ends.
                    return;
                }
                warn!(service = %config.name, "Service failed");
            }
            Err(e) => {
                error!(service = %config.name, error = %e, "Service start failed");
            }
        }

        // Clean up whatever the failed start left behind.
        let _ = service.stop().await;

        if !config.auto_restart {
            error!(service = %config.name, "auto_restart disabled, marking degraded");
            return;
        }
        if restart_attempts >= config.max_restart_attempts {
            error!(
                service = %config.name,
                attempts = restart_attempts,
                "Restart budget exhausted, marking degraded"
            );
            return;
        }

        restart_attempts += 1;
        warn!(
            service = %config.name,
            attempt = restart_attempts,
            max = config.max_restart_attempts,
            "Restarting service"
        );

        tokio::select! {
            _ = shutdown.changed() => return,
            _ = tokio::time::sleep(config.restart_delay()) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::ChannelBroker;
    use crate::config::ServiceConfig;
    use serde_json::{json, Value};
    use std::time::Duration;

    fn config(name: &str) -> ServiceConfig {
        ServiceConfig {
            request_timeout_ms: 500,
            stop_grace_ms: 100,
            restart_delay_ms: 10,
            max_restart_attempts: 2,
            ..ServiceConfig::new(name)
        }
    }

    #[tokio::test]
    async fn test_run_and_shutdown_stops_all_services() {
        let broker = Arc::new(ChannelBroker::new());
        let mut runner = ServiceRunner::default();

        let mut handles = Vec::new();
        for name in ["alpha", "beta"] {
            let service = Service::builder(config(name))
                .with_broker(broker.clone() as Arc<dyn Broker>)
                .rpc("ping", |_: Value| async { Ok(json!("pong")) })
                .build()
                .unwrap();
            handles.push(runner.add_service(service));
        }

        let shutdown = runner.shutdown_handle();
        let run = tokio::spawn(async move { runner.run_forever().await });

        // Let both services come up and answer.
        tokio::time::sleep(Duration::from_millis(100)).await;
        for handle in &handles {
            assert_eq!(handle.lifecycle(), Lifecycle::Running);
        }

        shutdown.shutdown();
        tokio::time::timeout(Duration::from_secs(2), run)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        for handle in &handles {
            assert_eq!(handle.lifecycle(), Lifecycle::Stopped);
        }
    }

    #[tokio::test]
    async fn test_degraded_after_restart_budget() {
        // Closing the broker makes every subscription loop fail and
        // every restart attempt fail to subscribe.
        let broker = Arc::new(ChannelBroker::new());
        let mut runner = ServiceRunner::default();
        let service = Service::builder(config("fragile"))
            .with_broker(broker.clone() as Arc<dyn Broker>)
            .rpc("ping", |_: Value| async { Ok(Value::Null) })
            .build()
            .unwrap();
        let handle = runner.add_service(service);

        let run = tokio::spawn(async move { runner.run_forever().await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(handle.lifecycle(), Lifecycle::Running);

        broker.close().await.unwrap();

        // Supervisor burns its restart budget, then run_forever returns.
        tokio::time::timeout(Duration::from_secs(2), run)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(handle.lifecycle(), Lifecycle::Stopped);
    }

    #[tokio::test]
    async fn test_no_auto_restart_degrades_immediately() {
        let broker = Arc::new(ChannelBroker::new());
        let mut runner = ServiceRunner::default();
        let service = Service::builder(ServiceConfig {
            auto_restart: false,
            ..config("static")
        })
        .with_broker(broker.clone() as Arc<dyn Broker>)
        .rpc("ping", |_: Value| async { Ok(Value::Null) })
        .build()
        .unwrap();
        runner.add_service(service);

        let run = tokio::spawn(async move { runner.run_forever().await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        broker.close().await.unwrap();

        tokio::time::timeout(Duration::from_secs(2), run)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_empty_runner_refused() {
        let runner = ServiceRunner::default();
        assert!(matches!(
            runner.run_forever().await,
            Err(ServiceError::Configuration(_))
        ));
    }
}
