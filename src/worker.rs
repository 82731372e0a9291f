//! The worker contract: user code addressed by string identifier.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use rand::Rng;

use crate::job::Job;

/// What a worker's `perform` resolved to.
///
/// Snooze and the terminal variants are ordinary return values rather than
/// errors; the executor pattern-matches and applies the matching state
/// transition.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// The attempt succeeded; the job completes.
    Ok,
    /// The attempt failed; retry with backoff or discard on the last attempt.
    Error(String),
    /// Stop permanently regardless of remaining attempts.
    Discard(String),
    /// Terminal cancellation requested by the worker itself.
    Cancel(String),
    /// Reschedule `seconds` from now without consuming an attempt.
    Snooze(i64),
}

/// User-supplied executor code, resolved from a job's `worker` string.
///
/// Implementations run on the engine's runtime; long blocking sections
/// should use `spawn_blocking` themselves.
#[async_trait::async_trait]
pub trait Worker: Send + Sync {
    /// Execute one attempt of `job`.
    async fn perform(&self, job: &Job) -> Outcome;

    /// Per-attempt timeout. Elapsing counts as an execution error.
    fn timeout(&self, _job: &Job) -> Duration {
        Duration::from_secs(60)
    }

    /// Seconds to wait before retrying after the given failed attempt.
    fn backoff(&self, attempt: i32) -> i64 {
        default_backoff(attempt)
    }
}

/// Default retry backoff: `2^attempt` seconds plus a bounded jitter, so
/// simultaneous failures from one batch do not retry in lockstep.
pub fn default_backoff(attempt: i32) -> i64 {
    let exponent = attempt.clamp(1, 32) as u32;
    let base = 2_i64.saturating_pow(exponent);
    let jitter = rand::rng().random_range(0..=10);
    base + jitter
}

/// Process-wide mapping from worker name to implementation.
///
/// Populated once at startup; a job naming an unregistered worker is a
/// permanent failure (the executor discards it).
#[derive(Clone, Default)]
pub struct WorkerRegistry {
    workers: Arc<DashMap<String, Arc<dyn Worker>>>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `worker` under `name`, replacing any previous registration.
    pub fn register(&self, name: impl Into<String>, worker: Arc<dyn Worker>) {
        self.workers.insert(name.into(), worker);
    }

    pub fn resolve(&self, name: &str) -> Option<Arc<dyn Worker>> {
        self.workers.get(name).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.workers.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }
}
