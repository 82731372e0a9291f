//! Moves due `scheduled` and `retryable` jobs to `available`.
//!
//! Runs on every node. Staging in bulk on a short interval obviates
//! per-insert notifications for future-dated jobs: producers learn about
//! newly runnable work from the coalesced per-queue announcements emitted
//! here.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tokio::sync::{Mutex, broadcast};
use tracing::{debug, info, warn};

use crate::engine::Engine;
use crate::notifier::Channel;

pub struct Stager {
    engine: Arc<dyn Engine>,
    interval: Duration,
    // Node-local guard: two staging passes must not interleave
    pass: Mutex<()>,
}

impl Stager {
    pub fn new(engine: Arc<dyn Engine>, interval: Duration) -> Self {
        Self {
            engine,
            interval,
            pass: Mutex::new(()),
        }
    }

    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) {
        info!(interval = ?self.interval, "stager started");

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.stage_once().await {
                        warn!(error = %e, "staging pass failed");
                    }
                }
                _ = shutdown_rx.recv() => break,
            }
        }

        info!("stager stopped");
    }

    async fn stage_once(&self) -> crate::error::Result<()> {
        let _guard = self.pass.lock().await;

        let staged = self.engine.stage_scheduled(Utc::now()).await?;

        if staged.is_empty() {
            return Ok(());
        }

        let total: i64 = staged.values().sum();
        debug!(total, queues = staged.len(), "staged scheduled jobs");

        // One notification per affected queue, not per job
        for queue in staged.keys() {
            if let Err(e) = self
                .engine
                .notify(Channel::Insert, json!({"queue": queue}))
                .await
            {
                warn!(queue = queue.as_str(), error = %e, "failed to announce staged jobs");
            }
        }

        Ok(())
    }
}
