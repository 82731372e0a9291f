//! Atomic operations over the persisted job collection.
//!
//! Every state transition in the job lifecycle goes through this module;
//! no other component edits rows directly. All operations are safe under
//! concurrent use from multiple nodes: leasing relies on
//! `FOR UPDATE SKIP LOCKED`, uniqueness serializes on a fingerprint-keyed
//! advisory lock, and transient backend failures are retried internally.

mod fingerprint;

pub use fingerprint::fingerprint;

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::json;
use sqlx::PgPool;
use sqlx::postgres::PgQueryResult;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::job::{Job, JobState, NewJob};

/// Attempts made against the backend before a transient error surfaces.
const TRANSIENT_RETRIES: u32 = 3;

/// Base delay between transient retries, doubled each attempt.
const TRANSIENT_BACKOFF: Duration = Duration::from_millis(50);

/// Handle for all job-row operations, bound to a pool, schema prefix, and
/// node identity.
#[derive(Clone)]
pub struct JobStore {
    pool: PgPool,
    table: String,
    node: String,
}

/// Outcome of one orphan-rescue sweep.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RescueReport {
    /// Jobs returned to `available` for another attempt.
    pub rescued: u64,
    /// Jobs out of attempts, moved to `discarded`.
    pub discarded: u64,
}

impl JobStore {
    pub fn new(pool: PgPool, prefix: &str, node: impl Into<String>) -> Self {
        Self {
            pool,
            table: format!("\"{prefix}\".conveyor_jobs"),
            node: node.into(),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    /// Insert a single job, honoring its uniqueness options.
    ///
    /// With uniqueness set, the insert serializes on an advisory lock keyed
    /// by the fingerprint: while a matching job exists within the period
    /// window in one of the allowed states, the existing row is returned
    /// flagged `conflict` instead of creating a duplicate.
    pub async fn insert(&self, new: &NewJob) -> Result<Job> {
        new.validate()?;

        let Some(unique) = &new.unique else {
            return self.retrying(|| self.insert_plain(new, None)).await;
        };

        let fp = fingerprint(new, unique);

        self.retrying(|| async {
            let mut tx = self.pool.begin().await.map_err(Error::from)?;

            // Serializes concurrent inserts of the same fingerprint across
            // all nodes for the duration of the transaction.
            sqlx::query("SELECT pg_advisory_xact_lock($1)")
                .bind(fp)
                .execute(&mut *tx)
                .await?;

            let states: Vec<String> = unique
                .states
                .iter()
                .map(|s| s.as_str().to_owned())
                .collect();

            let existing = sqlx::query_as::<_, Job>(&format!(
                "SELECT * FROM {} \
                 WHERE fingerprint = $1 \
                 AND state = ANY($2::conveyor_job_state[]) \
                 AND inserted_at > now() - make_interval(secs => $3::double precision) \
                 ORDER BY id LIMIT 1",
                self.table
            ))
            .bind(fp)
            .bind(&states)
            .bind(unique.period as f64)
            .fetch_optional(&mut *tx)
            .await?;

            if let Some(mut job) = existing {
                tx.commit().await.map_err(Error::from)?;
                debug!(job_id = job.id, fingerprint = fp, "unique insert conflicted");
                job.conflict = true;
                return Ok(job);
            }

            let job = self.insert_in(&mut tx, new, Some(fp)).await?;
            tx.commit().await.map_err(Error::from)?;
            Ok(job)
        })
        .await
    }

    /// Insert a batch of jobs in one transaction.
    ///
    /// Validation covers the whole batch before any row is written;
    /// uniqueness options are ignored on the batch path.
    pub async fn insert_all(&self, batch: &[NewJob]) -> Result<Vec<Job>> {
        for new in batch {
            new.validate()?;
        }

        if batch.is_empty() {
            return Ok(Vec::new());
        }

        self.retrying(|| async {
            let mut tx = self.pool.begin().await.map_err(Error::from)?;
            let mut jobs = Vec::with_capacity(batch.len());
            for new in batch {
                jobs.push(self.insert_in(&mut tx, new, None).await?);
            }
            tx.commit().await.map_err(Error::from)?;
            Ok(jobs)
        })
        .await
    }

    async fn insert_plain(&self, new: &NewJob, fp: Option<i64>) -> Result<Job> {
        let mut tx = self.pool.begin().await.map_err(Error::from)?;
        let job = self.insert_in(&mut tx, new, fp).await?;
        tx.commit().await.map_err(Error::from)?;
        Ok(job)
    }

    async fn insert_in(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        new: &NewJob,
        fp: Option<i64>,
    ) -> Result<Job> {
        let now = Utc::now();
        let state = new.initial_state(now);
        let scheduled_at = new.scheduled_at.unwrap_or(now);

        let job = sqlx::query_as::<_, Job>(&format!(
            "INSERT INTO {} \
             (queue, worker, args, meta, tags, state, priority, max_attempts, scheduled_at, fingerprint) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) \
             RETURNING *",
            self.table
        ))
        .bind(&new.queue)
        .bind(&new.worker)
        .bind(&new.args)
        .bind(&new.meta)
        .bind(&new.tags)
        .bind(state)
        .bind(new.priority)
        .bind(new.max_attempts)
        .bind(scheduled_at)
        .bind(fp)
        .fetch_one(&mut **tx)
        .await?;

        Ok(job)
    }

    /// Lease up to `demand` available jobs from `queue`, transitioning them
    /// to `executing` in a single atomic statement.
    ///
    /// Safe under concurrent fetches from any number of nodes: the selecting
    /// subquery uses `FOR UPDATE SKIP LOCKED`, so two nodes never lease the
    /// same row. Returned jobs are ordered by priority, then schedule time,
    /// then id.
    pub async fn fetch(&self, queue: &str, demand: usize) -> Result<Vec<Job>> {
        if demand == 0 {
            return Ok(Vec::new());
        }

        let mut jobs = self
            .retrying(|| async {
                sqlx::query_as::<_, Job>(&format!(
                    "WITH leased AS ( \
                       SELECT id FROM {table} \
                       WHERE state = 'available' AND queue = $1 AND scheduled_at <= now() \
                       ORDER BY priority ASC, scheduled_at ASC, id ASC \
                       LIMIT $2 \
                       FOR UPDATE SKIP LOCKED \
                     ) \
                     UPDATE {table} job \
                     SET state = 'executing', \
                         attempt = job.attempt + 1, \
                         attempted_at = now(), \
                         meta = jsonb_set(job.meta, '{{attempted_by}}', to_jsonb($3::text)) \
                     FROM leased \
                     WHERE job.id = leased.id \
                     RETURNING job.*",
                    table = self.table
                ))
                .bind(queue)
                .bind(demand as i64)
                .bind(&self.node)
                .fetch_all(&self.pool)
                .await
                .map_err(Error::from)
            })
            .await?;

        // UPDATE ... RETURNING does not guarantee subquery order
        jobs.sort_by(|a, b| {
            (a.priority, a.scheduled_at, a.id).cmp(&(b.priority, b.scheduled_at, b.id))
        });

        Ok(jobs)
    }

    /// Mark an executing job `completed`.
    ///
    /// Idempotent on already-completed jobs; any other non-executing state
    /// is reported as [`Error::NotExecuting`].
    pub async fn complete(&self, id: i64) -> Result<Job> {
        let updated = sqlx::query_as::<_, Job>(&format!(
            "UPDATE {} SET state = 'completed', completed_at = now() \
             WHERE id = $1 AND state = 'executing' \
             RETURNING *",
            self.table
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        match updated {
            Some(job) => Ok(job),
            None => self.reject_unless(id, JobState::Completed).await,
        }
    }

    /// Record a failure and move the job to `retryable`, scheduled
    /// `backoff` seconds out.
    pub async fn error(&self, id: i64, attempt: i32, error: &str, backoff: i64) -> Result<Job> {
        let entry = error_entry(attempt, error);

        let updated = sqlx::query_as::<_, Job>(&format!(
            "UPDATE {} \
             SET state = 'retryable', \
                 scheduled_at = now() + make_interval(secs => $2::double precision), \
                 errors = errors || $3::jsonb \
             WHERE id = $1 AND state = 'executing' \
             RETURNING *",
            self.table
        ))
        .bind(id)
        .bind(backoff as f64)
        .bind(&entry)
        .fetch_optional(&self.pool)
        .await?;

        match updated {
            Some(job) => Ok(job),
            None => self.reject_unless(id, JobState::Retryable).await,
        }
    }

    /// Record a final failure and move the job to `discarded`.
    pub async fn discard(&self, id: i64, attempt: i32, error: &str) -> Result<Job> {
        let entry = error_entry(attempt, error);

        let updated = sqlx::query_as::<_, Job>(&format!(
            "UPDATE {} \
             SET state = 'discarded', discarded_at = now(), errors = errors || $2::jsonb \
             WHERE id = $1 AND state = 'executing' \
             RETURNING *",
            self.table
        ))
        .bind(id)
        .bind(&entry)
        .fetch_optional(&self.pool)
        .await?;

        match updated {
            Some(job) => Ok(job),
            None => self.reject_unless(id, JobState::Discarded).await,
        }
    }

    /// Reschedule an executing job `seconds` out without consuming an
    /// attempt: `max_attempts` grows by one to compensate for the attempt
    /// charged at lease time.
    pub async fn snooze(&self, id: i64, seconds: i64) -> Result<Job> {
        let updated = sqlx::query_as::<_, Job>(&format!(
            "UPDATE {} \
             SET state = 'scheduled', \
                 scheduled_at = now() + make_interval(secs => $2::double precision), \
                 max_attempts = max_attempts + 1 \
             WHERE id = $1 AND state = 'executing' \
             RETURNING *",
            self.table
        ))
        .bind(id)
        .bind(seconds as f64)
        .fetch_optional(&self.pool)
        .await?;

        match updated {
            Some(job) => Ok(job),
            None => self.reject_unless(id, JobState::Scheduled).await,
        }
    }

    /// Cancel a job in any non-terminal state.
    ///
    /// An in-flight attempt counts as a failure, so cancelling an
    /// `executing` job appends an error entry. Idempotent once terminal.
    /// Returns `None` when no such job exists.
    pub async fn cancel(&self, id: i64) -> Result<Option<Job>> {
        let entry = error_entry_sql("job cancelled during execution");

        let updated = sqlx::query_as::<_, Job>(&format!(
            "UPDATE {table} \
             SET state = 'cancelled', \
                 cancelled_at = now(), \
                 errors = CASE WHEN state = 'executing' THEN errors || {entry} ELSE errors END \
             WHERE id = $1 AND state NOT IN ('completed', 'discarded', 'cancelled') \
             RETURNING *",
            table = self.table,
            entry = entry
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        match updated {
            Some(job) => Ok(Some(job)),
            // Terminal already, or gone entirely
            None => self.get(id).await,
        }
    }

    /// Cancel an in-flight attempt, recording the worker-supplied reason.
    ///
    /// Used by the executor when a worker returns a cancel outcome; jobs
    /// not in `executing` are handled like any other acknowledgement race.
    pub async fn cancel_executing(&self, id: i64, attempt: i32, reason: &str) -> Result<Job> {
        let entry = error_entry(attempt, reason);

        let updated = sqlx::query_as::<_, Job>(&format!(
            "UPDATE {} \
             SET state = 'cancelled', cancelled_at = now(), errors = errors || $2::jsonb \
             WHERE id = $1 AND state = 'executing' \
             RETURNING *",
            self.table
        ))
        .bind(id)
        .bind(&entry)
        .fetch_optional(&self.pool)
        .await?;

        match updated {
            Some(job) => Ok(job),
            None => self.reject_unless(id, JobState::Cancelled).await,
        }
    }

    /// Cancel every job in the given set of ids, returning those affected.
    pub async fn cancel_many(&self, ids: &[i64]) -> Result<Vec<Job>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let entry = error_entry_sql("job cancelled during execution");

        let jobs = sqlx::query_as::<_, Job>(&format!(
            "UPDATE {table} \
             SET state = 'cancelled', \
                 cancelled_at = now(), \
                 errors = CASE WHEN state = 'executing' THEN errors || {entry} ELSE errors END \
             WHERE id = ANY($1) AND state NOT IN ('completed', 'discarded', 'cancelled') \
             RETURNING *",
            table = self.table,
            entry = entry
        ))
        .bind(ids)
        .fetch_all(&self.pool)
        .await?;

        Ok(jobs)
    }

    /// Return a job to `available` with its attempt counter reset,
    /// regardless of terminal state. No-op on `executing` jobs.
    ///
    /// `max_attempts` grows to cover the attempts already spent, so an
    /// exhausted job always gets at least one more try.
    pub async fn retry(&self, id: i64) -> Result<Option<Job>> {
        let updated = sqlx::query_as::<_, Job>(&format!(
            "UPDATE {} \
             SET state = 'available', \
                 scheduled_at = now(), \
                 max_attempts = GREATEST(max_attempts, attempt + 1), \
                 attempt = 0, \
                 completed_at = NULL, \
                 cancelled_at = NULL, \
                 discarded_at = NULL \
             WHERE id = $1 AND state <> 'executing' AND state <> 'available' \
             RETURNING *",
            self.table
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        match updated {
            Some(job) => Ok(Some(job)),
            None => self.get(id).await,
        }
    }

    /// Retry every job in the given set of ids, returning those affected.
    pub async fn retry_many(&self, ids: &[i64]) -> Result<Vec<Job>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let jobs = sqlx::query_as::<_, Job>(&format!(
            "UPDATE {} \
             SET state = 'available', \
                 scheduled_at = now(), \
                 max_attempts = GREATEST(max_attempts, attempt + 1), \
                 attempt = 0, \
                 completed_at = NULL, \
                 cancelled_at = NULL, \
                 discarded_at = NULL \
             WHERE id = ANY($1) AND state <> 'executing' AND state <> 'available' \
             RETURNING *",
            self.table
        ))
        .bind(ids)
        .fetch_all(&self.pool)
        .await?;

        Ok(jobs)
    }

    /// Transition all due `scheduled` and `retryable` jobs to `available`.
    ///
    /// Returns the number of staged jobs per queue so the caller can emit
    /// one coalesced insert notification per queue.
    pub async fn stage_scheduled(&self, now: DateTime<Utc>) -> Result<BTreeMap<String, i64>> {
        let rows: Vec<(String, i64)> = self
            .retrying(|| async {
                sqlx::query_as(&format!(
                    "WITH staged AS ( \
                       UPDATE {} SET state = 'available' \
                       WHERE state IN ('scheduled', 'retryable') AND scheduled_at <= $1 \
                       RETURNING queue \
                     ) \
                     SELECT queue, count(*) FROM staged GROUP BY queue",
                    self.table
                ))
                .bind(now)
                .fetch_all(&self.pool)
                .await
                .map_err(Error::from)
            })
            .await?;

        Ok(rows.into_iter().collect())
    }

    /// Recover jobs stuck in `executing` past `threshold`.
    ///
    /// Jobs with attempts remaining return to `available`; exhausted jobs
    /// are discarded. Both carry a synthetic error entry marking the orphan
    /// recovery.
    pub async fn rescue_orphans(&self, threshold: Duration) -> Result<RescueReport> {
        let reason = "job orphaned: execution abandoned by its node";
        let secs = threshold.as_secs_f64();

        let mut tx = self.pool.begin().await?;

        let rescued = sqlx::query(&format!(
            "UPDATE {table} \
             SET state = 'available', \
                 errors = errors || jsonb_build_array(jsonb_build_object( \
                     'at', now(), 'attempt', attempt, 'error', $2::text)) \
             WHERE state = 'executing' \
               AND attempted_at < now() - make_interval(secs => $1::double precision) \
               AND attempt < max_attempts",
            table = self.table
        ))
        .bind(secs)
        .bind(reason)
        .execute(&mut *tx)
        .await?;

        let discarded = sqlx::query(&format!(
            "UPDATE {table} \
             SET state = 'discarded', \
                 discarded_at = now(), \
                 errors = errors || jsonb_build_array(jsonb_build_object( \
                     'at', now(), 'attempt', attempt, 'error', $2::text)) \
             WHERE state = 'executing' \
               AND attempted_at < now() - make_interval(secs => $1::double precision) \
               AND attempt >= max_attempts",
            table = self.table
        ))
        .bind(secs)
        .bind(reason)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        let report = RescueReport {
            rescued: rescued.rows_affected(),
            discarded: discarded.rows_affected(),
        };

        if report.rescued > 0 || report.discarded > 0 {
            warn!(
                rescued = report.rescued,
                discarded = report.discarded,
                "recovered orphaned jobs"
            );
        }

        Ok(report)
    }

    /// Delete terminal jobs past their retention window, at most `limit`
    /// rows per call to bound lock pressure. Returns the deleted count;
    /// callers repeat across sweeps until drained.
    pub async fn prune(
        &self,
        completed_retention: Duration,
        failed_retention: Duration,
        limit: i64,
    ) -> Result<u64> {
        let result: PgQueryResult = sqlx::query(&format!(
            "DELETE FROM {table} WHERE id IN ( \
               SELECT id FROM {table} \
               WHERE (state = 'completed' AND completed_at < now() - make_interval(secs => $1::double precision)) \
                  OR (state = 'cancelled' AND cancelled_at < now() - make_interval(secs => $2::double precision)) \
                  OR (state = 'discarded' AND discarded_at < now() - make_interval(secs => $2::double precision)) \
               LIMIT $3 \
             )",
            table = self.table
        ))
        .bind(completed_retention.as_secs_f64())
        .bind(failed_retention.as_secs_f64())
        .bind(limit)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Fetch a single job by id.
    pub async fn get(&self, id: i64) -> Result<Option<Job>> {
        let job = sqlx::query_as::<_, Job>(&format!(
            "SELECT * FROM {} WHERE id = $1",
            self.table
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(job)
    }

    /// Resolve an acknowledgement race: the row is no longer `executing`.
    ///
    /// If it already sits in `expected` the operation was a duplicate and
    /// the row is returned as-is; any other state is an error.
    async fn reject_unless(&self, id: i64, expected: JobState) -> Result<Job> {
        match self.get(id).await? {
            Some(job) if job.state == expected => Ok(job),
            Some(job) => Err(Error::NotExecuting {
                id,
                state: job.state.to_string(),
            }),
            None => Err(Error::Database(sqlx::Error::RowNotFound)),
        }
    }

    /// Run `op`, retrying transient backend failures with doubling delay.
    async fn retrying<T, Fut>(&self, op: impl Fn() -> Fut) -> Result<T>
    where
        Fut: Future<Output = Result<T>>,
    {
        let mut delay = TRANSIENT_BACKOFF;

        for attempt in 0..TRANSIENT_RETRIES {
            match op().await {
                Err(err) if err.is_transient() && attempt + 1 < TRANSIENT_RETRIES => {
                    debug!(error = %err, attempt, "transient backend error, retrying");
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
                other => return other,
            }
        }

        unreachable!("retry loop returns on final attempt")
    }
}

/// A one-entry errors fragment bound as jsonb.
fn error_entry(attempt: i32, error: &str) -> serde_json::Value {
    json!([{ "at": Utc::now(), "attempt": attempt, "error": error }])
}

/// SQL fragment appending an error entry stamped with the row's own attempt.
fn error_entry_sql(reason: &str) -> String {
    format!(
        "jsonb_build_array(jsonb_build_object('at', now(), 'attempt', attempt, 'error', '{reason}'))"
    )
}
