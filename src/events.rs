//! Lifecycle hook events emitted around job execution.
//!
//! Hooks are observational only: delivery is best-effort over a broadcast
//! channel, and a full or closed channel never affects the job outcome.

use std::time::Duration;

use tokio::sync::broadcast;

/// How a finished execution resolved, for hook consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionKind {
    Completed,
    Errored,
    Discarded,
    Cancelled,
    Snoozed,
    Timeout,
    Panicked,
}

/// One lifecycle hook event.
#[derive(Debug, Clone)]
pub enum JobHookEvent {
    /// Emitted after a job is leased, immediately before `perform`.
    Started {
        job_id: i64,
        queue: String,
        worker: String,
        attempt: i32,
    },
    /// Emitted after the outcome is persisted, with measurements.
    Stopped {
        job_id: i64,
        queue: String,
        worker: String,
        attempt: i32,
        kind: ExecutionKind,
        duration: Duration,
    },
    /// Emitted when an attempt raises, times out, or panics.
    Exception {
        job_id: i64,
        queue: String,
        worker: String,
        attempt: i32,
        error: String,
    },
}

/// Broadcast fan-out for hook events.
#[derive(Clone)]
pub struct Hooks {
    tx: broadcast::Sender<JobHookEvent>,
}

impl Hooks {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish an event. Lagging or absent subscribers are ignored.
    pub fn emit(&self, event: JobHookEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobHookEvent> {
        self.tx.subscribe()
    }
}

impl Default for Hooks {
    fn default() -> Self {
        Self::new(256)
    }
}
