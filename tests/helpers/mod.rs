use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::json;
use sqlx::PgPool;

use conveyor::engine::PostgresEngine;
use conveyor::job::{Job, NewJob};
use conveyor::notifier::LocalNotifier;
use conveyor::store::JobStore;

pub const NODE: &str = "test-node";

/// A store bound to the test pool under the default schema.
pub fn store(pool: &PgPool) -> JobStore {
    JobStore::new(pool.clone(), "public", NODE)
}

/// A full Postgres engine with an in-process notifier.
pub fn engine(pool: &PgPool) -> Arc<PostgresEngine> {
    Arc::new(PostgresEngine::new(store(pool), Arc::new(LocalNotifier::default())))
}

/// A minimal valid changeset for `worker` with a payload marker.
pub fn new_job(worker: &str, marker: i64) -> NewJob {
    NewJob::new(worker).args(json!({ "marker": marker }))
}

/// Backdate a job's `attempted_at`, simulating an execution abandoned
/// long ago.
pub async fn age_attempt(pool: &PgPool, id: i64, minutes: i64) {
    sqlx::query(
        "UPDATE conveyor_jobs \
         SET attempted_at = now() - make_interval(mins => $2::double precision) \
         WHERE id = $1",
    )
    .bind(id)
    .bind(minutes as f64)
    .execute(pool)
    .await
    .expect("backdating attempted_at");
}

/// Backdate a terminal timestamp so pruning sees an old row.
pub async fn age_terminal(pool: &PgPool, id: i64, column: &str, seconds: i64) {
    sqlx::query(&format!(
        "UPDATE conveyor_jobs \
         SET {column} = now() - make_interval(secs => $2::double precision) \
         WHERE id = $1",
    ))
    .bind(id)
    .bind(seconds as f64)
    .execute(pool)
    .await
    .expect("backdating terminal timestamp");
}

/// Count rows currently in `state`.
pub async fn count_in_state(pool: &PgPool, state: &str) -> i64 {
    sqlx::query_scalar("SELECT count(*) FROM conveyor_jobs WHERE state = $1::conveyor_job_state")
        .bind(state)
        .fetch_one(pool)
        .await
        .expect("counting jobs by state")
}

/// Read one job straight from the table.
pub async fn reload(pool: &PgPool, id: i64) -> Job {
    sqlx::query_as::<_, Job>("SELECT * FROM conveyor_jobs WHERE id = $1")
        .bind(id)
        .fetch_one(pool)
        .await
        .expect("reloading job")
}

/// The most recent attempt timestamp, for assertions on lease bookkeeping.
pub async fn attempted_at(pool: &PgPool, id: i64) -> Option<DateTime<Utc>> {
    sqlx::query_scalar("SELECT attempted_at FROM conveyor_jobs WHERE id = $1")
        .bind(id)
        .fetch_one(pool)
        .await
        .expect("reading attempted_at")
}
