//! Orphan rescue and terminal-job pruning.
//!
//! Both sweeps are leader-gated and periodic. Rescue returns abandoned
//! `executing` rows to circulation (or discards them when out of
//! attempts); prune deletes terminal rows past retention, bounded per
//! sweep to keep lock pressure flat.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::engine::Engine;
use crate::peer::Peer;

#[derive(Debug, Clone)]
pub struct LifelineOptions {
    pub interval: Duration,
    pub rescue_after: Duration,
    pub completed_retention: Duration,
    pub failed_retention: Duration,
    pub prune_limit: i64,
}

pub struct Lifeline {
    engine: Arc<dyn Engine>,
    peer: Peer,
    opts: LifelineOptions,
}

impl Lifeline {
    pub fn new(engine: Arc<dyn Engine>, peer: Peer, opts: LifelineOptions) -> Self {
        Self { engine, peer, opts }
    }

    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) {
        info!(
            interval = ?self.opts.interval,
            rescue_after = ?self.opts.rescue_after,
            "lifeline started"
        );

        let mut ticker = tokio::time::interval(self.opts.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if self.peer.is_leader() {
                        self.sweep().await;
                    }
                }
                _ = shutdown_rx.recv() => break,
            }
        }

        info!("lifeline stopped");
    }

    pub async fn sweep(&self) {
        match self.engine.rescue_orphans(self.opts.rescue_after).await {
            Ok(report) if report.rescued > 0 || report.discarded > 0 => {
                info!(
                    rescued = report.rescued,
                    discarded = report.discarded,
                    "orphan sweep complete"
                );
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "orphan rescue failed"),
        }

        match self
            .engine
            .prune(
                self.opts.completed_retention,
                self.opts.failed_retention,
                self.opts.prune_limit,
            )
            .await
        {
            Ok(0) => {}
            Ok(deleted) => debug!(deleted, "pruned terminal jobs"),
            Err(e) => warn!(error = %e, "prune failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::InlineEngine;
    use crate::job::{JobState, NewJob};

    fn opts() -> LifelineOptions {
        LifelineOptions {
            interval: Duration::from_millis(10),
            rescue_after: Duration::from_secs(3600),
            completed_retention: Duration::from_secs(60),
            failed_retention: Duration::from_secs(3600),
            prune_limit: 100,
        }
    }

    #[tokio::test]
    async fn sweep_rescues_stale_executing_jobs() {
        let engine: Arc<InlineEngine> = Arc::new(InlineEngine::new("n1"));

        // Lease a job, then age its attempt far past the threshold
        let inserted = engine
            .insert(&NewJob::new("w").max_attempts(3))
            .await
            .unwrap();
        engine.fetch("default", 1).await.unwrap();
        {
            let job = engine.get(inserted.id).await.unwrap().unwrap();
            assert_eq!(job.state, JobState::Executing);
        }

        // A 90-minute-old attempt against a 60-minute threshold
        let mut short = opts();
        short.rescue_after = Duration::ZERO;
        tokio::time::sleep(Duration::from_millis(5)).await;

        let lifeline = Lifeline::new(engine.clone(), Peer::global(), short);
        lifeline.sweep().await;

        let job = engine.get(inserted.id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Available);
        assert_eq!(job.attempt, 1, "rescue leaves the attempt counter alone");
        assert_eq!(job.errors.0.len(), 1);
        assert!(job.errors.0[0].error.contains("orphaned"));
    }

    #[tokio::test]
    async fn sweep_discards_exhausted_orphans() {
        let engine: Arc<InlineEngine> = Arc::new(InlineEngine::new("n1"));

        let inserted = engine
            .insert(&NewJob::new("w").max_attempts(1))
            .await
            .unwrap();
        engine.fetch("default", 1).await.unwrap();

        let mut short = opts();
        short.rescue_after = Duration::ZERO;
        tokio::time::sleep(Duration::from_millis(5)).await;

        let lifeline = Lifeline::new(engine.clone(), Peer::global(), short);
        lifeline.sweep().await;

        let job = engine.get(inserted.id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Discarded);
        assert!(job.discarded_at.is_some());
        assert!(job.errors.0[0].error.contains("orphaned"));
    }
}
