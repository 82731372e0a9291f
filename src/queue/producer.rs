//! The dispatch loop for one queue on one node.
//!
//! Three input sources funnel into one coalesced action: the refresh
//! timer, matching `insert` notifications, and completions of running
//! jobs all mark a dispatch as pending, and pending dispatches fire at
//! most once per cooldown. The producer never holds more than `limit`
//! executions and never fetches while full or paused.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::engine::Engine;
use crate::error::Result;
use crate::executor::Executor;
use crate::notifier::{Channel, GossipPayload, InsertPayload, SignalPayload, decode};

/// Tuning for one producer, derived from configuration.
#[derive(Debug, Clone)]
pub struct ProducerOptions {
    pub limit: usize,
    pub paused: bool,
    pub refresh_interval: Duration,
    pub dispatch_cooldown: Duration,
    pub shutdown_grace: Duration,
}

/// Delay between a fetch error and the next dispatch attempt.
const FETCH_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// How long cancelled stragglers get to acknowledge before their tasks are
/// abandoned at shutdown.
const CANCEL_GRACE: Duration = Duration::from_secs(2);

struct RunningJob {
    handle: tokio::task::JoinHandle<()>,
    cancel: CancellationToken,
}

pub struct Producer {
    queue: String,
    engine: Arc<dyn Engine>,
    executor: Executor,
    limit: usize,
    paused: bool,
    opts: ProducerOptions,
    running: HashMap<i64, RunningJob>,
    completion_tx: mpsc::UnboundedSender<i64>,
    completion_rx: mpsc::UnboundedReceiver<i64>,
    started_at: DateTime<Utc>,
}

impl Producer {
    pub fn new(
        queue: impl Into<String>,
        engine: Arc<dyn Engine>,
        executor: Executor,
        opts: ProducerOptions,
    ) -> Self {
        let (completion_tx, completion_rx) = mpsc::unbounded_channel();

        Self {
            queue: queue.into(),
            engine,
            executor,
            limit: opts.limit,
            paused: opts.paused,
            opts,
            running: HashMap::new(),
            completion_tx,
            completion_rx,
            started_at: Utc::now(),
        }
    }

    /// Run the dispatch loop until a shutdown signal arrives, then drain.
    pub async fn run(mut self, mut shutdown_rx: broadcast::Receiver<()>) {
        info!(
            queue = self.queue.as_str(),
            limit = self.limit,
            paused = self.paused,
            "producer started"
        );

        let mut insert_rx = self.engine.subscribe(Channel::Insert);
        let mut signal_rx = self.engine.subscribe(Channel::Signal);
        let mut refresh = tokio::time::interval(self.opts.refresh_interval);
        refresh.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        // Dispatch immediately on start
        let mut pending = true;
        let mut last_dispatch = Instant::now() - self.opts.dispatch_cooldown;

        loop {
            // Fire a pending dispatch once the cooldown window has passed
            if pending && last_dispatch.elapsed() >= self.opts.dispatch_cooldown {
                pending = false;
                last_dispatch = Instant::now();
                if let Err(e) = self.dispatch().await {
                    warn!(queue = self.queue.as_str(), error = %e, "dispatch failed");
                    tokio::time::sleep(FETCH_ERROR_BACKOFF).await;
                    pending = true;
                }
                continue;
            }

            let cooldown_over = last_dispatch + self.opts.dispatch_cooldown;

            tokio::select! {
                _ = refresh.tick() => {
                    pending = true;
                    self.gossip().await;
                }
                received = insert_rx.recv() => {
                    if let Ok(notification) = received
                        && let Ok(InsertPayload { queue }) = decode::<InsertPayload>(&notification)
                        && queue == self.queue
                    {
                        trace!(queue = queue.as_str(), "insert notification");
                        pending = true;
                    }
                }
                Some(id) = self.completion_rx.recv() => {
                    self.running.remove(&id);
                    pending = true;
                }
                received = signal_rx.recv() => {
                    if let Ok(notification) = received
                        && let Ok(signal) = decode::<SignalPayload>(&notification)
                    {
                        pending |= self.handle_signal(signal).await;
                    }
                }
                _ = tokio::time::sleep_until(cooldown_over), if pending => {}
                _ = shutdown_rx.recv() => break,
            }
        }

        self.drain().await;
    }

    /// One dispatch round: lease up to the open capacity and spawn an
    /// executor per leased job.
    async fn dispatch(&mut self) -> Result<()> {
        if self.paused || self.running.len() >= self.limit {
            return Ok(());
        }

        let demand = self.limit - self.running.len();
        let jobs = self.engine.fetch(&self.queue, demand).await?;

        if jobs.is_empty() {
            trace!(queue = self.queue.as_str(), "queue empty");
            return Ok(());
        }

        debug!(
            queue = self.queue.as_str(),
            count = jobs.len(),
            demand,
            "dispatching leased jobs"
        );

        for job in jobs {
            let id = job.id;
            let cancel = CancellationToken::new();
            let executor = self.executor.clone();
            let completion_tx = self.completion_tx.clone();
            let task_cancel = cancel.clone();

            let handle = tokio::spawn(async move {
                executor.run(job, task_cancel).await;
                let _ = completion_tx.send(id);
            });

            self.running.insert(id, RunningJob { handle, cancel });
        }

        Ok(())
    }

    /// Apply one signal; returns whether a dispatch became warranted.
    async fn handle_signal(&mut self, signal: SignalPayload) -> bool {
        match signal {
            SignalPayload::Scale { queue, limit } if queue == self.queue => {
                info!(queue = queue.as_str(), limit, "scaling queue");
                let grew = limit > self.limit;
                self.limit = limit;
                grew
            }
            SignalPayload::Pause { queue } if queue == self.queue => {
                info!(queue = queue.as_str(), "pausing queue");
                self.paused = true;
                false
            }
            SignalPayload::Resume { queue } if queue == self.queue => {
                info!(queue = queue.as_str(), "resuming queue");
                self.paused = false;
                true
            }
            SignalPayload::Cancel { id } => {
                // The store already moved the row; we only abort a local run
                if let Some(running) = self.running.get(&id) {
                    info!(job_id = id, "cancelling running job");
                    running.cancel.cancel();
                }
                false
            }
            SignalPayload::Pkill { id } => {
                if let Some(running) = self.running.get(&id) {
                    info!(job_id = id, "killing running job");
                    running.cancel.cancel();
                    if let Err(e) = self.engine.cancel(id).await {
                        warn!(job_id = id, error = %e, "failed to cancel killed job");
                    }
                }
                false
            }
            _ => false,
        }
    }

    /// Publish this producer's heartbeat.
    async fn gossip(&self) {
        let payload = GossipPayload {
            node: self.engine.node().to_owned(),
            queue: self.queue.clone(),
            limit: self.limit,
            running: self.running.keys().copied().collect(),
            paused: self.paused,
            started_at: self.started_at,
        };

        if let Ok(payload) = serde_json::to_value(&payload) {
            let _ = self.engine.notify(Channel::Gossip, payload).await;
        }
    }

    /// Wait out running jobs, then cancel and finally abandon stragglers.
    /// Rows left `executing` are rescued by the lifeline.
    async fn drain(mut self) {
        info!(
            queue = self.queue.as_str(),
            running = self.running.len(),
            "producer draining"
        );

        let deadline = Instant::now() + self.opts.shutdown_grace;
        self.await_completions(deadline).await;

        if !self.running.is_empty() {
            warn!(
                queue = self.queue.as_str(),
                remaining = self.running.len(),
                "grace elapsed, cancelling running jobs"
            );

            for running in self.running.values() {
                running.cancel.cancel();
            }

            self.await_completions(Instant::now() + CANCEL_GRACE).await;

            for (id, running) in self.running.drain() {
                warn!(job_id = id, "abandoning unresponsive job task");
                running.handle.abort();
            }
        }

        info!(queue = self.queue.as_str(), "producer stopped");
    }

    async fn await_completions(&mut self, deadline: Instant) {
        while !self.running.is_empty() {
            match tokio::time::timeout_at(deadline, self.completion_rx.recv()).await {
                Ok(Some(id)) => {
                    self.running.remove(&id);
                }
                Ok(None) | Err(_) => break,
            }
        }
    }
}
