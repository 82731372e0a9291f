//! Runs exactly one leased job in isolation.
//!
//! The executor owns the only reference to the running worker task:
//! cancellation (user-initiated or shutdown) and timeouts reach the worker
//! by aborting that task. Worker outcomes, panics, and timeouts are all
//! funneled into store acknowledgements; nothing a worker does can
//! propagate an error into the producer.

use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::engine::Engine;
use crate::error::Error;
use crate::events::{ExecutionKind, Hooks, JobHookEvent};
use crate::job::Job;
use crate::worker::{Outcome, Worker, WorkerRegistry};

/// How a single attempt resolved before acknowledgement.
enum RawOutcome {
    Finished(Outcome),
    Panicked(String),
    TimedOut,
    Cancelled,
}

#[derive(Clone)]
pub struct Executor {
    engine: Arc<dyn Engine>,
    registry: WorkerRegistry,
    hooks: Hooks,
}

impl Executor {
    pub fn new(engine: Arc<dyn Engine>, registry: WorkerRegistry, hooks: Hooks) -> Self {
        Self {
            engine,
            registry,
            hooks,
        }
    }

    /// Run one attempt of `job` to acknowledgement.
    ///
    /// `cancel` aborts the in-flight worker: on user cancellation the row
    /// was already moved terminal by the store, on shutdown the row stays
    /// `executing` for the lifeline to rescue. Either way no outcome is
    /// persisted from here.
    pub async fn run(&self, job: Job, cancel: CancellationToken) {
        let started = Instant::now();

        self.hooks.emit(JobHookEvent::Started {
            job_id: job.id,
            queue: job.queue.clone(),
            worker: job.worker.clone(),
            attempt: job.attempt,
        });

        let Some(worker) = self.registry.resolve(&job.worker) else {
            // Permanent failure: registration is static, a retry can't help
            let reason = format!("unknown worker: {}", job.worker);
            self.emit_exception(&job, &reason);
            self.ack_discard(&job, &reason, started, ExecutionKind::Discarded)
                .await;
            return;
        };

        let timeout = worker.timeout(&job);
        let task_job = job.clone();
        let task_worker = worker.clone();
        let handle = tokio::spawn(async move { task_worker.perform(&task_job).await });
        let abort = handle.abort_handle();

        let raw = tokio::select! {
            joined = handle => match joined {
                Ok(outcome) => RawOutcome::Finished(outcome),
                Err(e) if e.is_panic() => RawOutcome::Panicked(panic_message(e)),
                Err(_) => RawOutcome::Cancelled,
            },
            _ = tokio::time::sleep(timeout) => {
                abort.abort();
                RawOutcome::TimedOut
            }
            _ = cancel.cancelled() => {
                abort.abort();
                RawOutcome::Cancelled
            }
        };

        match raw {
            RawOutcome::Finished(Outcome::Ok) => {
                match self.engine.complete(job.id).await {
                    Ok(_) => self.emit_stopped(&job, ExecutionKind::Completed, started),
                    Err(e) => self.report_ack_failure(&job, e),
                }
            }
            RawOutcome::Finished(Outcome::Error(reason)) => {
                self.fail(&job, worker.as_ref(), &reason, started, ExecutionKind::Errored)
                    .await;
            }
            RawOutcome::Finished(Outcome::Discard(reason)) => {
                self.emit_exception(&job, &reason);
                self.ack_discard(&job, &reason, started, ExecutionKind::Discarded)
                    .await;
            }
            RawOutcome::Finished(Outcome::Cancel(reason)) => {
                match self.engine.cancel_executing(job.id, job.attempt, &reason).await {
                    Ok(_) => self.emit_stopped(&job, ExecutionKind::Cancelled, started),
                    Err(e) => self.report_ack_failure(&job, e),
                }
            }
            RawOutcome::Finished(Outcome::Snooze(seconds)) => {
                match self.engine.snooze(job.id, seconds.max(0)).await {
                    Ok(_) => {
                        debug!(job_id = job.id, seconds, "job snoozed");
                        self.emit_stopped(&job, ExecutionKind::Snoozed, started);
                    }
                    Err(e) => self.report_ack_failure(&job, e),
                }
            }
            RawOutcome::Panicked(message) => {
                self.fail(&job, worker.as_ref(), &message, started, ExecutionKind::Panicked)
                    .await;
            }
            RawOutcome::TimedOut => {
                let reason = format!("execution timed out after {timeout:.2?}");
                self.fail(&job, worker.as_ref(), &reason, started, ExecutionKind::Timeout)
                    .await;
            }
            RawOutcome::Cancelled => {
                // The row was either moved terminal by an external cancel
                // or stays executing for the lifeline; persist nothing.
                info!(job_id = job.id, "execution cancelled");
                self.emit_stopped(&job, ExecutionKind::Cancelled, started);
            }
        }
    }

    /// Record a failed attempt: retry with backoff while attempts remain,
    /// discard otherwise.
    async fn fail(
        &self,
        job: &Job,
        worker: &dyn Worker,
        reason: &str,
        started: Instant,
        kind: ExecutionKind,
    ) {
        self.emit_exception(job, reason);

        if job.attempt >= job.max_attempts {
            self.ack_discard(job, reason, started, kind).await;
            return;
        }

        let backoff = worker.backoff(job.attempt);
        match self.engine.error(job.id, job.attempt, reason, backoff).await {
            Ok(_) => {
                debug!(
                    job_id = job.id,
                    attempt = job.attempt,
                    backoff,
                    "job failed, retrying"
                );
                self.emit_stopped(job, kind, started);
            }
            Err(e) => self.report_ack_failure(job, e),
        }
    }

    async fn ack_discard(&self, job: &Job, reason: &str, started: Instant, kind: ExecutionKind) {
        match self.engine.discard(job.id, job.attempt, reason).await {
            Ok(_) => {
                warn!(job_id = job.id, attempt = job.attempt, reason, "job discarded");
                self.emit_stopped(job, kind, started);
            }
            Err(e) => self.report_ack_failure(job, e),
        }
    }

    fn emit_stopped(&self, job: &Job, kind: ExecutionKind, started: Instant) {
        self.hooks.emit(JobHookEvent::Stopped {
            job_id: job.id,
            queue: job.queue.clone(),
            worker: job.worker.clone(),
            attempt: job.attempt,
            kind,
            duration: started.elapsed(),
        });
    }

    fn emit_exception(&self, job: &Job, error: &str) {
        self.hooks.emit(JobHookEvent::Exception {
            job_id: job.id,
            queue: job.queue.clone(),
            worker: job.worker.clone(),
            attempt: job.attempt,
            error: error.to_owned(),
        });
    }

    fn report_ack_failure(&self, job: &Job, e: Error) {
        match e {
            // The row left `executing` underneath us (external cancel or a
            // concurrent rescue); the other transition wins.
            Error::NotExecuting { id, ref state } => {
                debug!(
                    job_id = id,
                    state = state.as_str(),
                    "acknowledgement suppressed by state change"
                );
            }
            other => {
                error!(job_id = job.id, error = %other, "failed to persist job outcome");
            }
        }
    }
}

/// Extract a printable message from a panicking worker task.
fn panic_message(error: tokio::task::JoinError) -> String {
    let payload = error.into_panic();

    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("worker panicked: {message}")
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("worker panicked: {message}")
    } else {
        "worker panicked".to_owned()
    }
}
