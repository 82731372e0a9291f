//! The engine facade: one contract binding store and notifier operations
//! to a configured backend.
//!
//! Producers, the executor, and the plugins only ever see `Arc<dyn Engine>`,
//! so swapping Postgres for the inline test backend is a configuration
//! change, not a code path.

mod inline;
mod postgres;

pub use inline::InlineEngine;
pub use postgres::PostgresEngine;

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::broadcast;

use crate::error::Result;
use crate::job::{Job, NewJob};
use crate::notifier::{Channel, Notification};
use crate::store::RescueReport;

/// Uniform interface over a storage + notification backend.
#[async_trait::async_trait]
pub trait Engine: Send + Sync {
    /// Insert one job, enforcing its uniqueness options, and announce it
    /// when it lands `available`.
    async fn insert(&self, new: &NewJob) -> Result<Job>;

    /// Insert a batch, announcing affected queues once each.
    async fn insert_all(&self, batch: &[NewJob]) -> Result<Vec<Job>>;

    /// Lease up to `demand` jobs from `queue` for this node.
    async fn fetch(&self, queue: &str, demand: usize) -> Result<Vec<Job>>;

    async fn complete(&self, id: i64) -> Result<Job>;

    async fn error(&self, id: i64, attempt: i32, error: &str, backoff: i64) -> Result<Job>;

    async fn discard(&self, id: i64, attempt: i32, error: &str) -> Result<Job>;

    async fn snooze(&self, id: i64, seconds: i64) -> Result<Job>;

    /// Cancel from the outside, whatever state the job is in.
    async fn cancel(&self, id: i64) -> Result<Option<Job>>;

    /// Cancel every non-terminal job in the id set, returning those affected.
    async fn cancel_many(&self, ids: &[i64]) -> Result<Vec<Job>>;

    /// Cancel an in-flight attempt with the worker-supplied reason.
    async fn cancel_executing(&self, id: i64, attempt: i32, reason: &str) -> Result<Job>;

    async fn retry(&self, id: i64) -> Result<Option<Job>>;

    /// Retry every finished or failed job in the id set, returning those
    /// affected.
    async fn retry_many(&self, ids: &[i64]) -> Result<Vec<Job>>;

    async fn stage_scheduled(&self, now: DateTime<Utc>) -> Result<BTreeMap<String, i64>>;

    async fn rescue_orphans(&self, threshold: Duration) -> Result<RescueReport>;

    async fn prune(
        &self,
        completed_retention: Duration,
        failed_retention: Duration,
        limit: i64,
    ) -> Result<u64>;

    async fn notify(&self, channel: Channel, payload: Value) -> Result<()>;

    fn subscribe(&self, channel: Channel) -> broadcast::Receiver<Notification>;

    /// This node's identity, as recorded on leased jobs.
    fn node(&self) -> &str;

    /// Fetch one job by id, mainly for tests and introspection.
    async fn get(&self, id: i64) -> Result<Option<Job>>;
}
