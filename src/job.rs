//! The persisted job model and its insertion changeset.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use sqlx::types::Json;

use crate::error::{Error, Result};

/// Lifecycle state of a job row.
///
/// Terminal states (`Completed`, `Discarded`, `Cancelled`) are only ever
/// left through an explicit `retry`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "conveyor_job_state", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Scheduled,
    Available,
    Executing,
    Retryable,
    Completed,
    Discarded,
    Cancelled,
}

impl JobState {
    /// States a job can never transition out of (absent an explicit retry).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Discarded | JobState::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Scheduled => "scheduled",
            JobState::Available => "available",
            JobState::Executing => "executing",
            JobState::Retryable => "retryable",
            JobState::Completed => "completed",
            JobState::Discarded => "discarded",
            JobState::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One recorded failure, appended to `errors` after each failed attempt
/// (execution errors, timeouts, panics, and orphan rescues alike).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionError {
    pub at: DateTime<Utc>,
    pub attempt: i32,
    pub error: String,
}

/// A job row as read back from the database.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Job {
    pub id: i64,
    pub queue: String,
    pub worker: String,
    pub args: Value,
    pub meta: Value,
    pub tags: Vec<String>,
    pub state: JobState,
    pub priority: i16,
    pub max_attempts: i32,
    pub attempt: i32,
    pub errors: Json<Vec<ExecutionError>>,
    pub fingerprint: Option<i64>,
    pub inserted_at: DateTime<Utc>,
    pub scheduled_at: DateTime<Utc>,
    pub attempted_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub discarded_at: Option<DateTime<Utc>>,
    /// Set when an insert with uniqueness options returned an existing row
    /// instead of creating a new one. Never persisted.
    #[sqlx(default)]
    pub conflict: bool,
}

impl Job {
    /// The node that leased the current attempt, recorded at fetch time.
    pub fn attempted_by(&self) -> Option<&str> {
        self.meta.get("attempted_by").and_then(Value::as_str)
    }
}

/// States that participate in uniqueness checks by default: everything
/// except `discarded` and `cancelled`, mirroring the insert-path rule that
/// a dead job should not block a fresh one.
pub const DEFAULT_UNIQUE_STATES: &[JobState] = &[
    JobState::Scheduled,
    JobState::Available,
    JobState::Executing,
    JobState::Retryable,
    JobState::Completed,
];

/// Per-insert uniqueness options.
///
/// While a job whose fingerprint matches exists within `period` seconds in
/// one of `states`, further inserts return that job flagged `conflict`.
#[derive(Debug, Clone)]
pub struct UniqueOpts {
    /// Window, in seconds, measured against `inserted_at`.
    pub period: i64,
    /// Which meta keys participate in the fingerprint (sorted at hash time).
    pub meta_keys: Vec<String>,
    /// States in which an existing job blocks a duplicate.
    pub states: Vec<JobState>,
    /// Whether `args` participates in the fingerprint.
    pub include_args: bool,
}

impl Default for UniqueOpts {
    fn default() -> Self {
        Self {
            period: 60,
            meta_keys: Vec::new(),
            states: DEFAULT_UNIQUE_STATES.to_vec(),
            include_args: true,
        }
    }
}

impl UniqueOpts {
    pub fn period(period: i64) -> Self {
        Self {
            period,
            ..Self::default()
        }
    }
}

/// A validated changeset for inserting a new job.
///
/// Build one with [`NewJob::new`] and the chained setters, then hand it to
/// the store. Validation happens in [`NewJob::validate`], which the store
/// calls before touching the database.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub worker: String,
    pub queue: String,
    pub args: Value,
    pub meta: Value,
    pub tags: Vec<String>,
    pub priority: i16,
    pub max_attempts: i32,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub unique: Option<UniqueOpts>,
}

impl NewJob {
    pub fn new(worker: impl Into<String>) -> Self {
        Self {
            worker: worker.into(),
            queue: "default".to_owned(),
            args: json!({}),
            meta: json!({}),
            tags: Vec::new(),
            priority: 0,
            max_attempts: 20,
            scheduled_at: None,
            unique: None,
        }
    }

    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    pub fn args(mut self, args: Value) -> Self {
        self.args = args;
        self
    }

    pub fn meta(mut self, meta: Value) -> Self {
        self.meta = meta;
        self
    }

    pub fn tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    pub fn priority(mut self, priority: i16) -> Self {
        self.priority = priority;
        self
    }

    pub fn max_attempts(mut self, max_attempts: i32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Schedule the job for a future instant instead of immediate execution.
    pub fn scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(at);
        self
    }

    /// Schedule the job `secs` seconds from now.
    pub fn schedule_in(self, secs: i64) -> Self {
        let at = Utc::now() + chrono::Duration::seconds(secs);
        self.scheduled_at(at)
    }

    pub fn unique(mut self, opts: UniqueOpts) -> Self {
        self.unique = Some(opts);
        self
    }

    /// The state the row starts in, derived from `scheduled_at`.
    pub fn initial_state(&self, now: DateTime<Utc>) -> JobState {
        match self.scheduled_at {
            Some(at) if at > now => JobState::Scheduled,
            _ => JobState::Available,
        }
    }

    /// Reject malformed changesets before they reach the database.
    pub fn validate(&self) -> Result<()> {
        if self.worker.trim().is_empty() {
            return Err(Error::Validation("worker must not be blank".into()));
        }
        if self.queue.trim().is_empty() {
            return Err(Error::Validation("queue must not be blank".into()));
        }
        if self.queue.len() > 128 {
            return Err(Error::Validation(
                "queue must be at most 128 characters".into(),
            ));
        }
        if !(0..=9).contains(&self.priority) {
            return Err(Error::Validation(format!(
                "priority must be between 0 and 9, got {}",
                self.priority
            )));
        }
        if self.max_attempts < 1 {
            return Err(Error::Validation(format!(
                "max_attempts must be positive, got {}",
                self.max_attempts
            )));
        }
        if !self.args.is_object() {
            return Err(Error::Validation("args must be a JSON object".into()));
        }
        if !self.meta.is_object() {
            return Err(Error::Validation("meta must be a JSON object".into()));
        }
        if let Some(unique) = &self.unique {
            if unique.period < 1 {
                return Err(Error::Validation(format!(
                    "unique period must be positive, got {}",
                    unique.period
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let new = NewJob::new("reports.daily");
        assert!(new.validate().is_ok());
        assert_eq!(new.queue, "default");
        assert_eq!(new.max_attempts, 20);
        assert_eq!(new.priority, 0);
    }

    #[test]
    fn blank_worker_rejected() {
        let new = NewJob::new("  ");
        assert!(matches!(new.validate(), Err(Error::Validation(_))));
    }

    #[test]
    fn priority_out_of_range_rejected() {
        let new = NewJob::new("w").priority(10);
        assert!(matches!(new.validate(), Err(Error::Validation(_))));
    }

    #[test]
    fn zero_max_attempts_rejected() {
        let new = NewJob::new("w").max_attempts(0);
        assert!(matches!(new.validate(), Err(Error::Validation(_))));
    }

    #[test]
    fn non_object_args_rejected() {
        let new = NewJob::new("w").args(json!([1, 2, 3]));
        assert!(matches!(new.validate(), Err(Error::Validation(_))));
    }

    #[test]
    fn initial_state_tracks_schedule() {
        let now = Utc::now();
        let immediate = NewJob::new("w");
        assert_eq!(immediate.initial_state(now), JobState::Available);

        let future = NewJob::new("w").scheduled_at(now + chrono::Duration::seconds(30));
        assert_eq!(future.initial_state(now), JobState::Scheduled);

        let past = NewJob::new("w").scheduled_at(now - chrono::Duration::seconds(30));
        assert_eq!(past.initial_state(now), JobState::Available);
    }

    #[test]
    fn terminal_states() {
        assert!(JobState::Completed.is_terminal());
        assert!(JobState::Discarded.is_terminal());
        assert!(JobState::Cancelled.is_terminal());
        assert!(!JobState::Executing.is_terminal());
        assert!(!JobState::Retryable.is_terminal());
    }
}
