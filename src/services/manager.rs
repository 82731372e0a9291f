use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::services::{Service, ServiceResult, run_service};

/// Owns every registered service and its lifecycle: spawn, supervise,
/// shut down with a shared deadline.
pub struct ServiceManager {
    registered: HashMap<String, Box<dyn Service>>,
    running: HashMap<String, JoinHandle<ServiceResult>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl ServiceManager {
    pub fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            registered: HashMap::new(),
            running: HashMap::new(),
            shutdown_tx,
        }
    }

    /// Register a service to be managed (not yet spawned)
    pub fn register_service(&mut self, name: &str, service: Box<dyn Service>) {
        self.registered.insert(name.to_string(), service);
    }

    pub fn has_services(&self) -> bool {
        !self.registered.is_empty() || !self.running.is_empty()
    }

    /// Spawn all registered services
    pub fn spawn_all(&mut self) {
        let names: Vec<_> = self.registered.keys().cloned().collect();

        for (name, service) in self.registered.drain() {
            let shutdown_rx = self.shutdown_tx.subscribe();
            let handle = tokio::spawn(run_service(service, shutdown_rx));
            self.running.insert(name, handle);
        }

        info!(services = ?names, "spawned {} services", names.len());
    }

    /// Wait until any service completes, returning its name and result.
    pub async fn run(&mut self) -> (String, ServiceResult) {
        if self.running.is_empty() {
            return (
                "none".to_string(),
                ServiceResult::Error(anyhow::anyhow!("no services to run")),
            );
        }

        loop {
            let finished = self
                .running
                .iter()
                .find(|(_, handle)| handle.is_finished())
                .map(|(name, _)| name.clone());

            if let Some(name) = finished {
                let handle = self.running.remove(&name).expect("finished service handle");
                return match handle.await {
                    Ok(result) => (name, result),
                    Err(e) => {
                        error!(service = name.as_str(), "service task panicked: {e}");
                        (name, ServiceResult::Error(anyhow::anyhow!("task panic: {e}")))
                    }
                };
            }

            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Shutdown all services gracefully within `timeout`.
    ///
    /// Returns the elapsed time, or the names of services that failed to
    /// stop in time.
    pub async fn shutdown(&mut self, timeout: Duration) -> Result<Duration, Vec<String>> {
        let names: Vec<_> = self.running.keys().cloned().collect();
        info!(
            services = ?names,
            timeout = format!("{timeout:.2?}"),
            "shutting down {} services",
            names.len()
        );

        let _ = self.shutdown_tx.send(());

        let start_time = std::time::Instant::now();
        let mut pending = Vec::new();

        for (name, handle) in self.running.drain() {
            match tokio::time::timeout(timeout, handle).await {
                Ok(Ok(_)) => debug!(service = name.as_str(), "service shutdown completed"),
                Ok(Err(e)) => {
                    warn!(service = name.as_str(), error = ?e, "service shutdown failed");
                    pending.push(name);
                }
                Err(_) => {
                    warn!(service = name.as_str(), "service shutdown timed out");
                    pending.push(name);
                }
            }
        }

        let elapsed = start_time.elapsed();
        if pending.is_empty() {
            info!(elapsed = format!("{elapsed:.2?}"), "services shutdown completed");
            Ok(elapsed)
        } else {
            warn!(
                pending = ?pending,
                elapsed = format!("{elapsed:.2?}"),
                "services shutdown completed with {} pending",
                pending.len()
            );
            Err(pending)
        }
    }
}

impl Default for ServiceManager {
    fn default() -> Self {
        Self::new()
    }
}
