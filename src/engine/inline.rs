//! In-memory engine for test modes.
//!
//! With a runtime attached (`testing = inline`), inserts execute their
//! worker synchronously before returning, so a test can insert a job and
//! immediately assert on its terminal snapshot. Nothing is persisted; ids
//! are assigned from a process-local counter.

use std::collections::BTreeMap;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::{Value, json};
use sqlx::types::Json;
use tokio::sync::broadcast;

use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::events::Hooks;
use crate::job::{ExecutionError, Job, JobState, NewJob};
use crate::notifier::{Channel, LocalNotifier, Notification, Notifier};
use crate::store::{RescueReport, fingerprint};
use crate::worker::{Outcome, WorkerRegistry};

struct InlineRuntime {
    registry: WorkerRegistry,
    hooks: Hooks,
}

pub struct InlineEngine {
    node: String,
    counter: AtomicI64,
    jobs: DashMap<i64, Job>,
    notifier: LocalNotifier,
    runtime: OnceLock<InlineRuntime>,
}

impl InlineEngine {
    pub fn new(node: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            counter: AtomicI64::new(0),
            jobs: DashMap::new(),
            notifier: LocalNotifier::default(),
            runtime: OnceLock::new(),
        }
    }

    /// Attach the worker registry and hook bus, enabling synchronous
    /// execution on insert.
    pub fn attach_runtime(&self, registry: WorkerRegistry, hooks: Hooks) {
        let _ = self.runtime.set(InlineRuntime { registry, hooks });
    }

    fn build_job(&self, new: &NewJob, now: DateTime<Utc>, fp: Option<i64>) -> Job {
        let id = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        Job {
            id,
            queue: new.queue.clone(),
            worker: new.worker.clone(),
            args: new.args.clone(),
            meta: new.meta.clone(),
            tags: new.tags.clone(),
            state: new.initial_state(now),
            priority: new.priority,
            max_attempts: new.max_attempts,
            attempt: 0,
            errors: Json(Vec::new()),
            fingerprint: fp,
            inserted_at: now,
            scheduled_at: new.scheduled_at.unwrap_or(now),
            attempted_at: None,
            completed_at: None,
            cancelled_at: None,
            discarded_at: None,
            conflict: false,
        }
    }

    /// Insert a job already leased into `executing`, without running it.
    ///
    /// Test support: lets executor tests drive acknowledgement paths
    /// directly.
    pub fn insert_leased(&self, new: &NewJob) -> Job {
        let now = Utc::now();
        let mut job = self.build_job(new, now, None);
        job.state = JobState::Executing;
        job.attempt = 1;
        job.attempted_at = Some(now);
        job.meta["attempted_by"] = json!(self.node.clone());

        self.jobs.insert(job.id, job.clone());
        job
    }

    fn mutate<F>(&self, id: i64, expected: JobState, f: F) -> Result<Job>
    where
        F: FnOnce(&mut Job),
    {
        let Some(mut entry) = self.jobs.get_mut(&id) else {
            return Err(Error::Database(sqlx::Error::RowNotFound));
        };

        if entry.state != JobState::Executing {
            if entry.state == expected {
                return Ok(entry.clone());
            }
            return Err(Error::NotExecuting {
                id,
                state: entry.state.to_string(),
            });
        }

        f(&mut entry);
        Ok(entry.clone())
    }

    fn push_error(job: &mut Job, attempt: i32, error: &str) {
        job.errors.0.push(ExecutionError {
            at: Utc::now(),
            attempt,
            error: error.to_owned(),
        });
    }

    /// Execute a freshly inserted job synchronously on the current task.
    async fn run_inline(&self, job: Job) {
        let started = std::time::Instant::now();
        let Some(runtime) = self.runtime.get() else {
            return;
        };

        let Some(worker) = runtime.registry.resolve(&job.worker) else {
            let reason = format!("unknown worker: {}", job.worker);
            let _ = self.discard(job.id, job.attempt, &reason).await;
            return;
        };

        let outcome = match tokio::time::timeout(worker.timeout(&job), worker.perform(&job)).await
        {
            Ok(outcome) => outcome,
            Err(_) => Outcome::Error("execution timed out".to_owned()),
        };

        let result = match outcome {
            Outcome::Ok => self.complete(job.id).await,
            Outcome::Error(reason) if job.attempt >= job.max_attempts => {
                self.discard(job.id, job.attempt, &reason).await
            }
            Outcome::Error(reason) => {
                self.error(job.id, job.attempt, &reason, worker.backoff(job.attempt))
                    .await
            }
            Outcome::Discard(reason) => self.discard(job.id, job.attempt, &reason).await,
            Outcome::Cancel(reason) => {
                self.cancel_executing(job.id, job.attempt, &reason).await
            }
            Outcome::Snooze(seconds) => self.snooze(job.id, seconds.max(0)).await,
        };

        if let Err(e) = result {
            tracing::error!(job_id = job.id, error = %e, "inline acknowledgement failed");
        }

        if let Ok(Some(updated)) = self.get(job.id).await {
            runtime.hooks.emit(crate::events::JobHookEvent::Stopped {
                job_id: updated.id,
                queue: updated.queue.clone(),
                worker: updated.worker.clone(),
                attempt: updated.attempt,
                kind: match updated.state {
                    JobState::Completed => crate::events::ExecutionKind::Completed,
                    JobState::Retryable => crate::events::ExecutionKind::Errored,
                    JobState::Cancelled => crate::events::ExecutionKind::Cancelled,
                    JobState::Scheduled => crate::events::ExecutionKind::Snoozed,
                    _ => crate::events::ExecutionKind::Discarded,
                },
                duration: started.elapsed(),
            });
        }
    }
}

#[async_trait::async_trait]
impl Engine for InlineEngine {
    async fn insert(&self, new: &NewJob) -> Result<Job> {
        new.validate()?;
        let now = Utc::now();

        let fp = new.unique.as_ref().map(|opts| fingerprint(new, opts));

        if let (Some(opts), Some(fp)) = (&new.unique, fp) {
            let window = chrono::Duration::seconds(opts.period);
            let existing = self
                .jobs
                .iter()
                .filter(|entry| entry.fingerprint == Some(fp))
                .filter(|entry| opts.states.contains(&entry.state))
                .filter(|entry| now - entry.inserted_at < window)
                .map(|entry| entry.clone())
                .min_by_key(|job| job.id);

            if let Some(mut job) = existing {
                job.conflict = true;
                return Ok(job);
            }
        }

        let mut job = self.build_job(new, now, fp);

        if self.runtime.get().is_some() && job.state == JobState::Available {
            // Inline mode: lease and execute before returning
            job.state = JobState::Executing;
            job.attempt = 1;
            job.attempted_at = Some(now);
            job.meta["attempted_by"] = json!(self.node.clone());
            self.jobs.insert(job.id, job.clone());

            self.run_inline(job.clone()).await;
            return Ok(self.jobs.get(&job.id).map(|j| j.clone()).unwrap_or(job));
        }

        self.jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn insert_all(&self, batch: &[NewJob]) -> Result<Vec<Job>> {
        let mut jobs = Vec::with_capacity(batch.len());
        for new in batch {
            jobs.push(self.insert(new).await?);
        }
        Ok(jobs)
    }

    async fn fetch(&self, queue: &str, demand: usize) -> Result<Vec<Job>> {
        let now = Utc::now();

        let mut due: Vec<Job> = self
            .jobs
            .iter()
            .filter(|entry| {
                entry.state == JobState::Available
                    && entry.queue == queue
                    && entry.scheduled_at <= now
            })
            .map(|entry| entry.clone())
            .collect();

        due.sort_by(|a, b| {
            (a.priority, a.scheduled_at, a.id).cmp(&(b.priority, b.scheduled_at, b.id))
        });
        due.truncate(demand);

        let mut leased = Vec::with_capacity(due.len());
        for job in due {
            if let Some(mut entry) = self.jobs.get_mut(&job.id) {
                entry.state = JobState::Executing;
                entry.attempt += 1;
                entry.attempted_at = Some(now);
                entry.meta["attempted_by"] = json!(self.node.clone());
                leased.push(entry.clone());
            }
        }

        Ok(leased)
    }

    async fn complete(&self, id: i64) -> Result<Job> {
        self.mutate(id, JobState::Completed, |job| {
            job.state = JobState::Completed;
            job.completed_at = Some(Utc::now());
        })
    }

    async fn error(&self, id: i64, attempt: i32, error: &str, backoff: i64) -> Result<Job> {
        self.mutate(id, JobState::Retryable, |job| {
            job.state = JobState::Retryable;
            job.scheduled_at = Utc::now() + chrono::Duration::seconds(backoff);
            Self::push_error(job, attempt, error);
        })
    }

    async fn discard(&self, id: i64, attempt: i32, error: &str) -> Result<Job> {
        self.mutate(id, JobState::Discarded, |job| {
            job.state = JobState::Discarded;
            job.discarded_at = Some(Utc::now());
            Self::push_error(job, attempt, error);
        })
    }

    async fn snooze(&self, id: i64, seconds: i64) -> Result<Job> {
        self.mutate(id, JobState::Scheduled, |job| {
            job.state = JobState::Scheduled;
            job.scheduled_at = Utc::now() + chrono::Duration::seconds(seconds);
            job.max_attempts += 1;
        })
    }

    async fn cancel(&self, id: i64) -> Result<Option<Job>> {
        let Some(mut entry) = self.jobs.get_mut(&id) else {
            return Ok(None);
        };

        if !entry.state.is_terminal() {
            if entry.state == JobState::Executing {
                let attempt = entry.attempt;
                Self::push_error(&mut entry, attempt, "job cancelled during execution");
            }
            entry.state = JobState::Cancelled;
            entry.cancelled_at = Some(Utc::now());
        }

        Ok(Some(entry.clone()))
    }

    async fn cancel_executing(&self, id: i64, attempt: i32, reason: &str) -> Result<Job> {
        self.mutate(id, JobState::Cancelled, |job| {
            job.state = JobState::Cancelled;
            job.cancelled_at = Some(Utc::now());
            Self::push_error(job, attempt, reason);
        })
    }

    async fn retry(&self, id: i64) -> Result<Option<Job>> {
        let Some(mut entry) = self.jobs.get_mut(&id) else {
            return Ok(None);
        };

        if entry.state != JobState::Executing && entry.state != JobState::Available {
            entry.state = JobState::Available;
            entry.scheduled_at = Utc::now();
            entry.max_attempts = entry.max_attempts.max(entry.attempt + 1);
            entry.attempt = 0;
            entry.completed_at = None;
            entry.cancelled_at = None;
            entry.discarded_at = None;
        }

        Ok(Some(entry.clone()))
    }

    async fn cancel_many(&self, ids: &[i64]) -> Result<Vec<Job>> {
        let mut affected = Vec::new();

        for id in ids {
            let Some(entry) = self.jobs.get(id) else {
                continue;
            };
            let was_terminal = entry.state.is_terminal();
            drop(entry);

            if !was_terminal
                && let Some(job) = self.cancel(*id).await?
            {
                affected.push(job);
            }
        }

        Ok(affected)
    }

    async fn retry_many(&self, ids: &[i64]) -> Result<Vec<Job>> {
        let mut affected = Vec::new();

        for id in ids {
            let Some(entry) = self.jobs.get(id) else {
                continue;
            };
            let skip = matches!(entry.state, JobState::Executing | JobState::Available);
            drop(entry);

            if !skip
                && let Some(job) = self.retry(*id).await?
            {
                affected.push(job);
            }
        }

        Ok(affected)
    }

    async fn stage_scheduled(&self, now: DateTime<Utc>) -> Result<BTreeMap<String, i64>> {
        let mut staged = BTreeMap::new();

        for mut entry in self.jobs.iter_mut() {
            if matches!(entry.state, JobState::Scheduled | JobState::Retryable)
                && entry.scheduled_at <= now
            {
                entry.state = JobState::Available;
                *staged.entry(entry.queue.clone()).or_insert(0) += 1;
            }
        }

        Ok(staged)
    }

    async fn rescue_orphans(&self, threshold: Duration) -> Result<RescueReport> {
        let cutoff = Utc::now() - chrono::Duration::from_std(threshold).unwrap_or_else(|_| chrono::Duration::zero());
        let mut report = RescueReport::default();

        for mut entry in self.jobs.iter_mut() {
            if entry.state != JobState::Executing {
                continue;
            }
            let Some(attempted_at) = entry.attempted_at else {
                continue;
            };
            if attempted_at >= cutoff {
                continue;
            }

            let attempt = entry.attempt;
            Self::push_error(
                &mut entry,
                attempt,
                "job orphaned: execution abandoned by its node",
            );

            if entry.attempt < entry.max_attempts {
                entry.state = JobState::Available;
                report.rescued += 1;
            } else {
                entry.state = JobState::Discarded;
                entry.discarded_at = Some(Utc::now());
                report.discarded += 1;
            }
        }

        Ok(report)
    }

    async fn prune(
        &self,
        completed_retention: Duration,
        failed_retention: Duration,
        limit: i64,
    ) -> Result<u64> {
        let now = Utc::now();
        let completed_cutoff =
            now - chrono::Duration::from_std(completed_retention).unwrap_or_else(|_| chrono::Duration::zero());
        let failed_cutoff = now - chrono::Duration::from_std(failed_retention).unwrap_or_else(|_| chrono::Duration::zero());

        let doomed: Vec<i64> = self
            .jobs
            .iter()
            .filter(|entry| match entry.state {
                JobState::Completed => entry.completed_at.is_some_and(|at| at < completed_cutoff),
                JobState::Cancelled => entry.cancelled_at.is_some_and(|at| at < failed_cutoff),
                JobState::Discarded => entry.discarded_at.is_some_and(|at| at < failed_cutoff),
                _ => false,
            })
            .map(|entry| entry.id)
            .take(limit.max(0) as usize)
            .collect();

        for id in &doomed {
            self.jobs.remove(id);
        }

        Ok(doomed.len() as u64)
    }

    async fn notify(&self, channel: Channel, payload: Value) -> Result<()> {
        self.notifier.notify(channel, payload).await
    }

    fn subscribe(&self, channel: Channel) -> broadcast::Receiver<Notification> {
        self.notifier.subscribe(channel)
    }

    fn node(&self) -> &str {
        &self.node
    }

    async fn get(&self, id: i64) -> Result<Option<Job>> {
        Ok(self.jobs.get(&id).map(|entry| entry.clone()))
    }
}
