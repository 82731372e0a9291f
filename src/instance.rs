//! The client-facing handle for one conveyor instance.

use std::sync::Arc;

use serde_json::to_value;
use tracing::warn;

use crate::engine::Engine;
use crate::error::Result;
use crate::events::Hooks;
use crate::job::{Job, NewJob};
use crate::notifier::{Channel, SignalPayload};
use crate::worker::{Worker, WorkerRegistry};

/// A named conveyor instance: the entry point applications hold to submit
/// and steer jobs. Clones are cheap and share the same engine.
#[derive(Clone)]
pub struct Conveyor {
    name: String,
    engine: Arc<dyn Engine>,
    workers: WorkerRegistry,
    hooks: Hooks,
}

impl Conveyor {
    pub fn new(name: impl Into<String>, engine: Arc<dyn Engine>) -> Self {
        Self {
            name: name.into(),
            engine,
            workers: WorkerRegistry::new(),
            hooks: Hooks::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn engine(&self) -> &Arc<dyn Engine> {
        &self.engine
    }

    pub fn workers(&self) -> &WorkerRegistry {
        &self.workers
    }

    pub fn hooks(&self) -> &Hooks {
        &self.hooks
    }

    /// Register a worker under its string identifier.
    pub fn register_worker(&self, name: impl Into<String>, worker: Arc<dyn Worker>) {
        self.workers.register(name, worker);
    }

    /// Submit one job.
    pub async fn insert(&self, new: NewJob) -> Result<Job> {
        self.engine.insert(&new).await
    }

    /// Submit a batch of jobs in one transaction.
    pub async fn insert_all(&self, batch: Vec<NewJob>) -> Result<Vec<Job>> {
        self.engine.insert_all(&batch).await
    }

    /// Fetch a job snapshot by id.
    pub async fn fetch_job(&self, id: i64) -> Result<Option<Job>> {
        self.engine.get(id).await
    }

    /// Cancel a job wherever it is: the row moves terminal immediately and
    /// a best-effort signal tells whichever producer is running it to stop.
    pub async fn cancel_job(&self, id: i64) -> Result<Option<Job>> {
        let job = self.engine.cancel(id).await?;
        self.signal(SignalPayload::Cancel { id }).await;
        Ok(job)
    }

    /// Cancel a whole set of jobs, returning those that were affected.
    ///
    /// Rows move terminal in one statement; a cancel signal follows for
    /// each job that was in flight so its executor stops too.
    pub async fn cancel_jobs(&self, ids: &[i64]) -> Result<Vec<Job>> {
        let jobs = self.engine.cancel_many(ids).await?;

        // Producers ignore ids they are not running, so signalling every
        // affected job is cheap and catches the in-flight ones.
        for job in &jobs {
            self.signal(SignalPayload::Cancel { id: job.id }).await;
        }

        Ok(jobs)
    }

    /// Kill one running job: the producer holding it aborts the execution
    /// and records the cancellation. A no-op if the job is not running
    /// anywhere.
    pub async fn pkill_job(&self, id: i64) {
        self.signal(SignalPayload::Pkill { id }).await;
    }

    /// Return a finished or failed job to `available`.
    pub async fn retry_job(&self, id: i64) -> Result<Option<Job>> {
        self.engine.retry(id).await
    }

    /// Retry a whole set of jobs, returning those that were affected.
    pub async fn retry_jobs(&self, ids: &[i64]) -> Result<Vec<Job>> {
        self.engine.retry_many(ids).await
    }

    /// Adjust a queue's concurrency limit cluster-wide.
    pub async fn scale_queue(&self, queue: impl Into<String>, limit: usize) {
        self.signal(SignalPayload::Scale {
            queue: queue.into(),
            limit,
        })
        .await;
    }

    /// Stop dispatch on a queue; running jobs finish out.
    pub async fn pause_queue(&self, queue: impl Into<String>) {
        self.signal(SignalPayload::Pause {
            queue: queue.into(),
        })
        .await;
    }

    /// Resume dispatch on a paused queue.
    pub async fn resume_queue(&self, queue: impl Into<String>) {
        self.signal(SignalPayload::Resume {
            queue: queue.into(),
        })
        .await;
    }

    async fn signal(&self, signal: SignalPayload) {
        match to_value(&signal) {
            Ok(payload) => {
                if let Err(e) = self.engine.notify(Channel::Signal, payload).await {
                    warn!(instance = self.name.as_str(), error = %e, "failed to send signal");
                }
            }
            Err(e) => warn!(error = %e, "failed to encode signal"),
        }
    }
}
