#[allow(dead_code)]
mod helpers;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serde_json::json;
use tokio::sync::broadcast;
use tokio::time::Instant;

use conveyor::engine::Engine;
use conveyor::events::Hooks;
use conveyor::executor::Executor;
use conveyor::job::{Job, JobState, NewJob};
use conveyor::plugins::Stager;
use conveyor::queue::{Producer, ProducerOptions};
use conveyor::worker::{Outcome, Worker, WorkerRegistry};

struct OkWorker;

#[async_trait::async_trait]
impl Worker for OkWorker {
    async fn perform(&self, _job: &Job) -> Outcome {
        Outcome::Ok
    }
}

/// Fails on the first attempt, succeeds afterwards. Zero backoff keeps the
/// retry immediately stageable.
struct FlakyWorker {
    calls: AtomicUsize,
}

#[async_trait::async_trait]
impl Worker for FlakyWorker {
    async fn perform(&self, _job: &Job) -> Outcome {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            Outcome::Error("first attempt fails".into())
        } else {
            Outcome::Ok
        }
    }

    fn backoff(&self, _attempt: i32) -> i64 {
        0
    }
}

struct AlwaysFailing;

#[async_trait::async_trait]
impl Worker for AlwaysFailing {
    async fn perform(&self, _job: &Job) -> Outcome {
        Outcome::Error("nope".into())
    }

    fn backoff(&self, _attempt: i32) -> i64 {
        0
    }
}

struct Rig {
    shutdown_tx: broadcast::Sender<()>,
    handles: Vec<tokio::task::JoinHandle<()>>,
}

/// Spawn a producer plus a fast stager over the given engine.
fn spawn_rig(engine: Arc<dyn Engine>, registry: WorkerRegistry) -> Rig {
    let (shutdown_tx, _) = broadcast::channel(1);

    let executor = Executor::new(engine.clone(), registry, Hooks::default());
    let producer = Producer::new(
        "default",
        engine.clone(),
        executor,
        ProducerOptions {
            limit: 5,
            paused: false,
            refresh_interval: Duration::from_millis(25),
            dispatch_cooldown: Duration::from_millis(1),
            shutdown_grace: Duration::from_secs(2),
        },
    );
    let stager = Stager::new(engine, Duration::from_millis(25));

    let handles = vec![
        tokio::spawn({
            let shutdown_rx = shutdown_tx.subscribe();
            async move { producer.run(shutdown_rx).await }
        }),
        tokio::spawn({
            let shutdown_rx = shutdown_tx.subscribe();
            async move { stager.run(shutdown_rx).await }
        }),
    ];

    Rig {
        shutdown_tx,
        handles,
    }
}

impl Rig {
    async fn stop(self) {
        let _ = self.shutdown_tx.send(());
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}

async fn await_state(pool: &sqlx::PgPool, id: i64, state: JobState) -> Job {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let job = helpers::reload(pool, id).await;
        if job.state == state {
            return job;
        }
        assert!(
            Instant::now() < deadline,
            "job {id} stuck in {} while waiting for {state:?}",
            job.state
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

// S1: a job that succeeds on the first attempt
#[sqlx::test]
async fn success_path(pool: sqlx::PgPool) {
    let engine = helpers::engine(&pool);
    let registry = WorkerRegistry::new();
    registry.register("ok", Arc::new(OkWorker));
    let rig = spawn_rig(engine.clone(), registry);

    let inserted = engine
        .insert(&NewJob::new("ok").args(json!({"n": 1})).max_attempts(3))
        .await
        .unwrap();

    let job = await_state(&pool, inserted.id, JobState::Completed).await;
    assert_eq!(job.attempt, 1);
    assert!(job.errors.0.is_empty());
    assert!(job.completed_at.is_some());

    rig.stop().await;
}

// S2: fails once, succeeds on the retry
#[sqlx::test]
async fn retry_path(pool: sqlx::PgPool) {
    let engine = helpers::engine(&pool);
    let registry = WorkerRegistry::new();
    registry.register(
        "flaky",
        Arc::new(FlakyWorker {
            calls: AtomicUsize::new(0),
        }),
    );
    let rig = spawn_rig(engine.clone(), registry);

    let inserted = engine
        .insert(&NewJob::new("flaky").max_attempts(2))
        .await
        .unwrap();

    let job = await_state(&pool, inserted.id, JobState::Completed).await;
    assert_eq!(job.attempt, 2);
    assert_eq!(job.errors.0.len(), 1);
    assert_eq!(job.errors.0[0].error, "first attempt fails");
    assert!(job.completed_at.is_some());

    rig.stop().await;
}

// S3: a single allowed attempt goes straight to discarded
#[sqlx::test]
async fn discard_on_exhaustion(pool: sqlx::PgPool) {
    let engine = helpers::engine(&pool);
    let registry = WorkerRegistry::new();
    registry.register("fail", Arc::new(AlwaysFailing));
    let rig = spawn_rig(engine.clone(), registry);

    let inserted = engine
        .insert(&NewJob::new("fail").max_attempts(1))
        .await
        .unwrap();

    let job = await_state(&pool, inserted.id, JobState::Discarded).await;
    assert_eq!(job.attempt, 1);
    assert_eq!(job.errors.0.len(), 1);
    assert_eq!(job.errors.0[0].error, "nope");
    assert_eq!(job.errors.0[0].attempt, 1);

    rig.stop().await;
}

// A worker that discards itself skips its remaining attempts
#[sqlx::test]
async fn worker_discard_outcome_is_terminal(pool: sqlx::PgPool) {
    struct SelfDiscarding;

    #[async_trait::async_trait]
    impl Worker for SelfDiscarding {
        async fn perform(&self, _job: &Job) -> Outcome {
            Outcome::Discard("account deleted".into())
        }
    }

    let engine = helpers::engine(&pool);
    let registry = WorkerRegistry::new();
    registry.register("self-discard", Arc::new(SelfDiscarding));
    let rig = spawn_rig(engine.clone(), registry);

    let inserted = engine
        .insert(&NewJob::new("self-discard").max_attempts(10))
        .await
        .unwrap();

    let job = await_state(&pool, inserted.id, JobState::Discarded).await;
    assert_eq!(job.attempt, 1, "no further attempts after discard");
    assert_eq!(job.errors.0[0].error, "account deleted");

    rig.stop().await;
}

// Snooze then clock advance: the job comes back and completes
#[sqlx::test]
async fn snooze_eventually_completes(pool: sqlx::PgPool) {
    struct SnoozeOnce {
        calls: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl Worker for SnoozeOnce {
        async fn perform(&self, _job: &Job) -> Outcome {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Outcome::Snooze(0)
            } else {
                Outcome::Ok
            }
        }
    }

    let engine = helpers::engine(&pool);
    let registry = WorkerRegistry::new();
    registry.register(
        "snoozer",
        Arc::new(SnoozeOnce {
            calls: AtomicUsize::new(0),
        }),
    );
    let rig = spawn_rig(engine.clone(), registry);

    let inserted = engine
        .insert(&NewJob::new("snoozer").max_attempts(3))
        .await
        .unwrap();

    let job = await_state(&pool, inserted.id, JobState::Completed).await;
    // The snoozed attempt was granted back
    assert_eq!(job.max_attempts, 4);
    assert_eq!(job.attempt, 2);
    assert!(job.errors.0.is_empty());

    rig.stop().await;
}

// Cancelling mid-flight suppresses the attempt's outcome
#[sqlx::test]
async fn cancel_mid_flight(pool: sqlx::PgPool) {
    struct Sleeper;

    #[async_trait::async_trait]
    impl Worker for Sleeper {
        async fn perform(&self, _job: &Job) -> Outcome {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Outcome::Ok
        }
    }

    let engine = helpers::engine(&pool);
    let registry = WorkerRegistry::new();
    registry.register("sleeper", Arc::new(Sleeper));
    let rig = spawn_rig(engine.clone(), registry);

    let inserted = engine.insert(&NewJob::new("sleeper")).await.unwrap();
    await_state(&pool, inserted.id, JobState::Executing).await;

    // External cancel: mark the row terminal, then signal the producer
    engine.cancel(inserted.id).await.unwrap();
    engine
        .notify(
            conveyor::notifier::Channel::Signal,
            json!({"action": "cancel", "id": inserted.id}),
        )
        .await
        .unwrap();

    let job = await_state(&pool, inserted.id, JobState::Cancelled).await;
    assert!(job.cancelled_at.is_some());
    assert_eq!(job.errors.0.len(), 1, "the aborted attempt is recorded");

    rig.stop().await;
}
