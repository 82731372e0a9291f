//! The canonical backend: a `JobStore` over Postgres plus a notifier.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::warn;

use crate::engine::Engine;
use crate::error::Result;
use crate::job::{Job, JobState, NewJob};
use crate::notifier::{Channel, InsertPayload, Notification, Notifier};
use crate::store::{JobStore, RescueReport};

pub struct PostgresEngine {
    store: JobStore,
    notifier: Arc<dyn Notifier>,
}

impl PostgresEngine {
    pub fn new(store: JobStore, notifier: Arc<dyn Notifier>) -> Self {
        Self { store, notifier }
    }

    pub fn store(&self) -> &JobStore {
        &self.store
    }

    /// Announce an immediately-runnable insert so idle producers can skip
    /// their next poll delay. Failure to announce is harmless: the refresh
    /// timer picks the job up anyway.
    async fn announce_insert(&self, queue: &str) {
        let payload = InsertPayload {
            queue: queue.to_owned(),
        };

        match serde_json::to_value(&payload) {
            Ok(payload) => {
                if let Err(e) = self.notifier.notify(Channel::Insert, payload).await {
                    warn!(queue, error = %e, "failed to announce insert");
                }
            }
            Err(e) => warn!(queue, error = %e, "failed to encode insert payload"),
        }
    }
}

#[async_trait::async_trait]
impl Engine for PostgresEngine {
    async fn insert(&self, new: &NewJob) -> Result<Job> {
        let job = self.store.insert(new).await?;

        if job.state == JobState::Available && !job.conflict {
            self.announce_insert(&job.queue).await;
        }

        Ok(job)
    }

    async fn insert_all(&self, batch: &[NewJob]) -> Result<Vec<Job>> {
        let jobs = self.store.insert_all(batch).await?;

        let queues: BTreeSet<&str> = jobs
            .iter()
            .filter(|job| job.state == JobState::Available)
            .map(|job| job.queue.as_str())
            .collect();

        for queue in queues {
            self.announce_insert(queue).await;
        }

        Ok(jobs)
    }

    async fn fetch(&self, queue: &str, demand: usize) -> Result<Vec<Job>> {
        self.store.fetch(queue, demand).await
    }

    async fn complete(&self, id: i64) -> Result<Job> {
        self.store.complete(id).await
    }

    async fn error(&self, id: i64, attempt: i32, error: &str, backoff: i64) -> Result<Job> {
        self.store.error(id, attempt, error, backoff).await
    }

    async fn discard(&self, id: i64, attempt: i32, error: &str) -> Result<Job> {
        self.store.discard(id, attempt, error).await
    }

    async fn snooze(&self, id: i64, seconds: i64) -> Result<Job> {
        self.store.snooze(id, seconds).await
    }

    async fn cancel(&self, id: i64) -> Result<Option<Job>> {
        self.store.cancel(id).await
    }

    async fn cancel_many(&self, ids: &[i64]) -> Result<Vec<Job>> {
        self.store.cancel_many(ids).await
    }

    async fn cancel_executing(&self, id: i64, attempt: i32, reason: &str) -> Result<Job> {
        self.store.cancel_executing(id, attempt, reason).await
    }

    async fn retry(&self, id: i64) -> Result<Option<Job>> {
        self.store.retry(id).await
    }

    async fn retry_many(&self, ids: &[i64]) -> Result<Vec<Job>> {
        self.store.retry_many(ids).await
    }

    async fn stage_scheduled(&self, now: DateTime<Utc>) -> Result<BTreeMap<String, i64>> {
        self.store.stage_scheduled(now).await
    }

    async fn rescue_orphans(&self, threshold: Duration) -> Result<RescueReport> {
        self.store.rescue_orphans(threshold).await
    }

    async fn prune(
        &self,
        completed_retention: Duration,
        failed_retention: Duration,
        limit: i64,
    ) -> Result<u64> {
        self.store
            .prune(completed_retention, failed_retention, limit)
            .await
    }

    async fn notify(&self, channel: Channel, payload: Value) -> Result<()> {
        self.notifier.notify(channel, payload).await
    }

    fn subscribe(&self, channel: Channel) -> broadcast::Receiver<Notification> {
        self.notifier.subscribe(channel)
    }

    fn node(&self) -> &str {
        self.store.node()
    }

    async fn get(&self, id: i64) -> Result<Option<Job>> {
        self.store.get(id).await
    }
}
