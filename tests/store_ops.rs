#[allow(dead_code)]
mod helpers;

use std::time::Duration;

use chrono::Utc;
use serde_json::json;

use conveyor::error::Error;
use conveyor::job::{JobState, NewJob, UniqueOpts};

// ── insert ──────────────────────────────────────────────────────────

#[sqlx::test]
async fn insert_defaults_to_available(pool: sqlx::PgPool) {
    let store = helpers::store(&pool);

    let job = store.insert(&helpers::new_job("w", 1)).await.unwrap();

    assert_eq!(job.state, JobState::Available);
    assert_eq!(job.queue, "default");
    assert_eq!(job.attempt, 0);
    assert_eq!(job.args, json!({"marker": 1}));
    assert!(job.errors.0.is_empty());
    assert!(!job.conflict);
}

#[sqlx::test]
async fn future_insert_lands_scheduled(pool: sqlx::PgPool) {
    let store = helpers::store(&pool);

    let job = store
        .insert(&helpers::new_job("w", 1).schedule_in(3600))
        .await
        .unwrap();

    assert_eq!(job.state, JobState::Scheduled);
    assert!(job.scheduled_at > Utc::now());
}

#[sqlx::test]
async fn invalid_changeset_is_rejected_synchronously(pool: sqlx::PgPool) {
    let store = helpers::store(&pool);

    let result = store.insert(&NewJob::new("w").priority(11)).await;
    assert!(matches!(result, Err(Error::Validation(_))));

    let result = store.insert(&NewJob::new("").max_attempts(3)).await;
    assert!(matches!(result, Err(Error::Validation(_))));

    assert_eq!(helpers::count_in_state(&pool, "available").await, 0);
}

#[sqlx::test]
async fn insert_all_creates_every_row(pool: sqlx::PgPool) {
    let store = helpers::store(&pool);

    let batch: Vec<_> = (0..5).map(|n| helpers::new_job("w", n)).collect();
    let jobs = store.insert_all(&batch).await.unwrap();

    assert_eq!(jobs.len(), 5);
    assert_eq!(helpers::count_in_state(&pool, "available").await, 5);
}

// ── fetch ───────────────────────────────────────────────────────────

#[sqlx::test]
async fn fetch_on_empty_queue_returns_empty(pool: sqlx::PgPool) {
    let store = helpers::store(&pool);
    let jobs = store.fetch("default", 5).await.unwrap();
    assert!(jobs.is_empty());
}

#[sqlx::test]
async fn fetch_leases_and_records_the_node(pool: sqlx::PgPool) {
    let store = helpers::store(&pool);
    let inserted = store.insert(&helpers::new_job("w", 1)).await.unwrap();

    let leased = store.fetch("default", 1).await.unwrap();

    assert_eq!(leased.len(), 1);
    let job = &leased[0];
    assert_eq!(job.id, inserted.id);
    assert_eq!(job.state, JobState::Executing);
    assert_eq!(job.attempt, 1);
    assert!(job.attempted_at.is_some());
    assert_eq!(job.attempted_by(), Some(helpers::NODE));
}

#[sqlx::test]
async fn fetch_orders_by_priority_then_schedule_then_id(pool: sqlx::PgPool) {
    let store = helpers::store(&pool);

    let low = store
        .insert(&helpers::new_job("w", 1).priority(9))
        .await
        .unwrap();
    let high_late = store
        .insert(&helpers::new_job("w", 2).priority(0))
        .await
        .unwrap();
    let high_early = store
        .insert(&helpers::new_job("w", 3).priority(0).schedule_in(-60))
        .await
        .unwrap();

    let leased = store.fetch("default", 3).await.unwrap();
    let ids: Vec<i64> = leased.iter().map(|j| j.id).collect();

    assert_eq!(ids, vec![high_early.id, high_late.id, low.id]);
}

#[sqlx::test]
async fn fetch_respects_demand_and_skips_unready_jobs(pool: sqlx::PgPool) {
    let store = helpers::store(&pool);

    for n in 0..3 {
        store.insert(&helpers::new_job("w", n)).await.unwrap();
    }
    store
        .insert(&helpers::new_job("w", 99).schedule_in(3600))
        .await
        .unwrap();

    let first = store.fetch("default", 2).await.unwrap();
    assert_eq!(first.len(), 2);

    let rest = store.fetch("default", 10).await.unwrap();
    assert_eq!(rest.len(), 1, "scheduled job must not be leased");
}

#[sqlx::test]
async fn fetch_ignores_other_queues(pool: sqlx::PgPool) {
    let store = helpers::store(&pool);
    store
        .insert(&helpers::new_job("w", 1).queue("media"))
        .await
        .unwrap();

    let jobs = store.fetch("default", 5).await.unwrap();
    assert!(jobs.is_empty());
}

// ── acknowledgements ────────────────────────────────────────────────

#[sqlx::test]
async fn complete_marks_terminal(pool: sqlx::PgPool) {
    let store = helpers::store(&pool);
    store.insert(&helpers::new_job("w", 1)).await.unwrap();
    let job = store.fetch("default", 1).await.unwrap().remove(0);

    let done = store.complete(job.id).await.unwrap();
    assert_eq!(done.state, JobState::Completed);
    assert!(done.completed_at.is_some());
}

#[sqlx::test]
async fn complete_is_idempotent(pool: sqlx::PgPool) {
    let store = helpers::store(&pool);
    store.insert(&helpers::new_job("w", 1)).await.unwrap();
    let job = store.fetch("default", 1).await.unwrap().remove(0);

    store.complete(job.id).await.unwrap();
    let again = store.complete(job.id).await.unwrap();
    assert_eq!(again.state, JobState::Completed);
}

#[sqlx::test]
async fn complete_rejects_non_executing(pool: sqlx::PgPool) {
    let store = helpers::store(&pool);
    let job = store.insert(&helpers::new_job("w", 1)).await.unwrap();

    let result = store.complete(job.id).await;
    assert!(matches!(result, Err(Error::NotExecuting { .. })));
}

#[sqlx::test]
async fn error_schedules_retry_with_backoff(pool: sqlx::PgPool) {
    let store = helpers::store(&pool);
    store.insert(&helpers::new_job("w", 1)).await.unwrap();
    let job = store.fetch("default", 1).await.unwrap().remove(0);

    let failed = store.error(job.id, job.attempt, "boom", 30).await.unwrap();

    assert_eq!(failed.state, JobState::Retryable);
    assert_eq!(failed.errors.0.len(), 1);
    assert_eq!(failed.errors.0[0].error, "boom");
    assert_eq!(failed.errors.0[0].attempt, 1);
    assert!(failed.scheduled_at > Utc::now() + chrono::Duration::seconds(20));
}

#[sqlx::test]
async fn snooze_reschedules_without_consuming_an_attempt(pool: sqlx::PgPool) {
    let store = helpers::store(&pool);
    store
        .insert(&helpers::new_job("w", 1).max_attempts(5))
        .await
        .unwrap();
    let job = store.fetch("default", 1).await.unwrap().remove(0);

    let snoozed = store.snooze(job.id, 90).await.unwrap();

    assert_eq!(snoozed.state, JobState::Scheduled);
    assert_eq!(snoozed.attempt, 1, "snooze leaves attempt untouched");
    assert_eq!(snoozed.max_attempts, 6, "snooze grants the attempt back");
    assert!(snoozed.errors.0.is_empty());
    assert!(snoozed.scheduled_at > Utc::now() + chrono::Duration::seconds(60));
}

#[sqlx::test]
async fn discard_is_terminal_with_error(pool: sqlx::PgPool) {
    let store = helpers::store(&pool);
    store.insert(&helpers::new_job("w", 1)).await.unwrap();
    let job = store.fetch("default", 1).await.unwrap().remove(0);

    let dead = store.discard(job.id, job.attempt, "no such account").await.unwrap();

    assert_eq!(dead.state, JobState::Discarded);
    assert!(dead.discarded_at.is_some());
    assert_eq!(dead.errors.0[0].error, "no such account");
}

// ── cancel / retry ──────────────────────────────────────────────────

#[sqlx::test]
async fn cancel_available_job_is_terminal_without_error(pool: sqlx::PgPool) {
    let store = helpers::store(&pool);
    let job = store.insert(&helpers::new_job("w", 1)).await.unwrap();

    let cancelled = store.cancel(job.id).await.unwrap().unwrap();

    assert_eq!(cancelled.state, JobState::Cancelled);
    assert!(cancelled.cancelled_at.is_some());
    // No attempt was in flight, so no failure is recorded
    assert!(cancelled.errors.0.is_empty());
}

#[sqlx::test]
async fn cancel_executing_job_records_the_aborted_attempt(pool: sqlx::PgPool) {
    let store = helpers::store(&pool);
    store.insert(&helpers::new_job("w", 1)).await.unwrap();
    let job = store.fetch("default", 1).await.unwrap().remove(0);

    let cancelled = store.cancel(job.id).await.unwrap().unwrap();

    assert_eq!(cancelled.state, JobState::Cancelled);
    assert_eq!(cancelled.errors.0.len(), 1);
    assert_eq!(cancelled.errors.0[0].attempt, 1);
}

#[sqlx::test]
async fn cancel_is_idempotent_once_terminal(pool: sqlx::PgPool) {
    let store = helpers::store(&pool);
    store.insert(&helpers::new_job("w", 1)).await.unwrap();
    let job = store.fetch("default", 1).await.unwrap().remove(0);
    store.complete(job.id).await.unwrap();

    let after = store.cancel(job.id).await.unwrap().unwrap();
    assert_eq!(after.state, JobState::Completed, "terminal state is preserved");

    let missing = store.cancel(987654).await.unwrap();
    assert!(missing.is_none());
}

#[sqlx::test]
async fn retry_resets_a_discarded_job(pool: sqlx::PgPool) {
    let store = helpers::store(&pool);
    store
        .insert(&helpers::new_job("w", 1).max_attempts(1))
        .await
        .unwrap();
    let job = store.fetch("default", 1).await.unwrap().remove(0);
    store.discard(job.id, job.attempt, "nope").await.unwrap();

    let retried = store.retry(job.id).await.unwrap().unwrap();

    assert_eq!(retried.state, JobState::Available);
    assert_eq!(retried.attempt, 0);
    // The spent attempt is covered so the job gets at least one more try
    assert_eq!(retried.max_attempts, 2);
    assert!(retried.discarded_at.is_none());
    // History is preserved
    assert_eq!(retried.errors.0.len(), 1);

    let leased = store.fetch("default", 1).await.unwrap();
    assert_eq!(leased.len(), 1, "retried job is leasable again");
}

#[sqlx::test]
async fn retry_many_restores_attempt_budgets(pool: sqlx::PgPool) {
    let store = helpers::store(&pool);

    let exhausted = store
        .insert(&helpers::new_job("w", 1).max_attempts(1))
        .await
        .unwrap();
    let done = store
        .insert(&helpers::new_job("w", 2).max_attempts(5))
        .await
        .unwrap();

    store.fetch("default", 2).await.unwrap();
    store.discard(exhausted.id, 1, "nope").await.unwrap();
    store.complete(done.id).await.unwrap();

    let retried = store.retry_many(&[exhausted.id, done.id]).await.unwrap();
    assert_eq!(retried.len(), 2);

    let exhausted = helpers::reload(&pool, exhausted.id).await;
    assert_eq!(exhausted.state, JobState::Available);
    assert_eq!(exhausted.max_attempts, 2);

    let done = helpers::reload(&pool, done.id).await;
    assert_eq!(done.state, JobState::Available);
    assert_eq!(done.max_attempts, 5, "an unspent budget is left alone");
}

#[sqlx::test]
async fn cancel_many_skips_terminal_rows(pool: sqlx::PgPool) {
    let store = helpers::store(&pool);

    let a = store.insert(&helpers::new_job("w", 1)).await.unwrap();
    let b = store.insert(&helpers::new_job("w", 2)).await.unwrap();
    let done = store.insert(&helpers::new_job("w", 3)).await.unwrap();

    // Drive one job to completed first
    store.fetch("default", 3).await.unwrap();
    store.complete(done.id).await.unwrap();

    let affected = store.cancel_many(&[a.id, b.id, done.id]).await.unwrap();
    let mut ids: Vec<i64> = affected.iter().map(|j| j.id).collect();
    ids.sort();

    assert_eq!(ids, vec![a.id, b.id]);
    assert_eq!(helpers::reload(&pool, done.id).await.state, JobState::Completed);
}

// ── staging ─────────────────────────────────────────────────────────

#[sqlx::test]
async fn stage_scheduled_promotes_due_jobs_per_queue(pool: sqlx::PgPool) {
    let store = helpers::store(&pool);

    store
        .insert(&helpers::new_job("w", 1).schedule_in(3600))
        .await
        .unwrap();

    // A retryable job whose backoff has elapsed
    store
        .insert(&helpers::new_job("w", 2).queue("media"))
        .await
        .unwrap();
    let job = store.fetch("media", 1).await.unwrap().remove(0);
    store.error(job.id, job.attempt, "boom", -5).await.unwrap();

    let staged = store.stage_scheduled(Utc::now()).await.unwrap();

    assert_eq!(staged.len(), 1);
    assert_eq!(staged["media"], 1);
    assert_eq!(helpers::reload(&pool, job.id).await.state, JobState::Available);
}

// ── rescue ──────────────────────────────────────────────────────────

#[sqlx::test]
async fn rescue_returns_stale_executing_jobs_to_available(pool: sqlx::PgPool) {
    let store = helpers::store(&pool);
    store
        .insert(&helpers::new_job("w", 1).max_attempts(3))
        .await
        .unwrap();
    let job = store.fetch("default", 1).await.unwrap().remove(0);

    helpers::age_attempt(&pool, job.id, 90).await;

    let report = store
        .rescue_orphans(Duration::from_secs(60 * 60))
        .await
        .unwrap();

    assert_eq!(report.rescued, 1);
    assert_eq!(report.discarded, 0);

    let rescued = helpers::reload(&pool, job.id).await;
    assert_eq!(rescued.state, JobState::Available);
    assert_eq!(rescued.attempt, 1, "rescue does not touch the attempt counter");
    assert_eq!(rescued.errors.0.len(), 1);
    assert!(rescued.errors.0[0].error.contains("orphaned"));

    // On the next fetch it reattempts
    let again = store.fetch("default", 1).await.unwrap();
    assert_eq!(again[0].id, job.id);
    assert_eq!(again[0].attempt, 2);
}

#[sqlx::test]
async fn rescue_discards_exhausted_orphans(pool: sqlx::PgPool) {
    let store = helpers::store(&pool);
    store
        .insert(&helpers::new_job("w", 1).max_attempts(1))
        .await
        .unwrap();
    let job = store.fetch("default", 1).await.unwrap().remove(0);

    helpers::age_attempt(&pool, job.id, 90).await;

    let report = store
        .rescue_orphans(Duration::from_secs(60 * 60))
        .await
        .unwrap();

    assert_eq!(report.rescued, 0);
    assert_eq!(report.discarded, 1);
    assert_eq!(helpers::reload(&pool, job.id).await.state, JobState::Discarded);
}

#[sqlx::test]
async fn rescue_leaves_fresh_executions_alone(pool: sqlx::PgPool) {
    let store = helpers::store(&pool);
    store.insert(&helpers::new_job("w", 1)).await.unwrap();
    let job = store.fetch("default", 1).await.unwrap().remove(0);

    let report = store
        .rescue_orphans(Duration::from_secs(60 * 60))
        .await
        .unwrap();

    assert_eq!(report.rescued + report.discarded, 0);
    assert_eq!(helpers::reload(&pool, job.id).await.state, JobState::Executing);
}

// ── prune ───────────────────────────────────────────────────────────

#[sqlx::test]
async fn prune_deletes_only_expired_terminal_rows(pool: sqlx::PgPool) {
    let store = helpers::store(&pool);

    let old_done = store.insert(&helpers::new_job("w", 1)).await.unwrap();
    let fresh_done = store.insert(&helpers::new_job("w", 2)).await.unwrap();
    let live = store.insert(&helpers::new_job("w", 3)).await.unwrap();

    store.fetch("default", 2).await.unwrap();
    store.complete(old_done.id).await.unwrap();
    store.complete(fresh_done.id).await.unwrap();

    helpers::age_terminal(&pool, old_done.id, "completed_at", 120).await;

    let deleted = store
        .prune(
            Duration::from_secs(60),
            Duration::from_secs(24 * 60 * 60),
            1000,
        )
        .await
        .unwrap();

    assert_eq!(deleted, 1);
    assert_eq!(helpers::count_in_state(&pool, "completed").await, 1);
    assert_eq!(helpers::reload(&pool, live.id).await.id, live.id);
}

#[sqlx::test]
async fn prune_bounds_deletions_per_sweep(pool: sqlx::PgPool) {
    let store = helpers::store(&pool);

    for n in 0..5 {
        let job = store.insert(&helpers::new_job("w", n)).await.unwrap();
        store.fetch("default", 1).await.unwrap();
        store.complete(job.id).await.unwrap();
        helpers::age_terminal(&pool, job.id, "completed_at", 120).await;
    }

    let first = store
        .prune(Duration::from_secs(60), Duration::from_secs(60), 2)
        .await
        .unwrap();
    assert_eq!(first, 2);

    // Draining continues across sweeps
    let mut total = first;
    while total < 5 {
        let deleted = store
            .prune(Duration::from_secs(60), Duration::from_secs(60), 2)
            .await
            .unwrap();
        assert!(deleted > 0, "sweeps must make progress until drained");
        total += deleted;
    }
    assert_eq!(helpers::count_in_state(&pool, "completed").await, 0);
}

// ── uniqueness (S4) ─────────────────────────────────────────────────

#[sqlx::test]
async fn unique_insert_within_period_returns_existing(pool: sqlx::PgPool) {
    let store = helpers::store(&pool);

    let new = NewJob::new("W")
        .args(json!({"k": 1}))
        .unique(UniqueOpts::period(60));

    let first = store.insert(&new).await.unwrap();
    let second = store.insert(&new).await.unwrap();

    assert_eq!(first.id, second.id);
    assert!(!first.conflict);
    assert!(second.conflict);

    let rows: i64 = sqlx::query_scalar("SELECT count(*) FROM conveyor_jobs")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(rows, 1);
}

#[sqlx::test]
async fn unique_insert_differs_by_args(pool: sqlx::PgPool) {
    let store = helpers::store(&pool);

    let first = store
        .insert(&NewJob::new("W").args(json!({"k": 1})).unique(UniqueOpts::period(60)))
        .await
        .unwrap();
    let second = store
        .insert(&NewJob::new("W").args(json!({"k": 2})).unique(UniqueOpts::period(60)))
        .await
        .unwrap();

    assert_ne!(first.id, second.id);
    assert!(!second.conflict);
}

#[sqlx::test]
async fn unique_insert_outside_states_creates_new_row(pool: sqlx::PgPool) {
    let store = helpers::store(&pool);

    let unique = UniqueOpts {
        period: 3600,
        states: vec![JobState::Available, JobState::Executing],
        ..UniqueOpts::default()
    };

    let new = NewJob::new("W").unique(unique);
    let first = store.insert(&new).await.unwrap();

    // Drive the first job terminal; it then stops blocking duplicates
    store.fetch("default", 1).await.unwrap();
    store.complete(first.id).await.unwrap();

    let second = store.insert(&new).await.unwrap();
    assert_ne!(first.id, second.id);
    assert!(!second.conflict);
}

#[sqlx::test]
async fn concurrent_unique_inserts_collapse_to_one_row(pool: sqlx::PgPool) {
    let store = helpers::store(&pool);

    let new = NewJob::new("W")
        .args(json!({"k": 9}))
        .unique(UniqueOpts::period(120));

    let mut handles = Vec::new();
    for _ in 0..8 {
        let store = store.clone();
        let new = new.clone();
        handles.push(tokio::spawn(async move { store.insert(&new).await }));
    }

    let mut ids = std::collections::BTreeSet::new();
    for handle in handles {
        let job = handle.await.unwrap().unwrap();
        ids.insert(job.id);
    }

    assert_eq!(ids.len(), 1, "all concurrent inserts observed the same row");
    let rows: i64 = sqlx::query_scalar("SELECT count(*) FROM conveyor_jobs")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(rows, 1);
}

// ── concurrent fetch (leasing) ──────────────────────────────────────

#[sqlx::test]
async fn concurrent_fetches_never_double_lease(pool: sqlx::PgPool) {
    let store = helpers::store(&pool);

    for n in 0..20 {
        store.insert(&helpers::new_job("w", n)).await.unwrap();
    }

    let mut handles = Vec::new();
    for _ in 0..4 {
        let store = store.clone();
        handles.push(tokio::spawn(async move { store.fetch("default", 10).await }));
    }

    let mut seen = std::collections::BTreeSet::new();
    let mut total = 0;
    for handle in handles {
        for job in handle.await.unwrap().unwrap() {
            assert!(seen.insert(job.id), "job {} leased twice", job.id);
            total += 1;
        }
    }

    assert_eq!(total, 20);
    assert_eq!(helpers::count_in_state(&pool, "executing").await, 20);
}
