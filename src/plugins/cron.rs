//! Inserts jobs on a crontab schedule.
//!
//! Leader-gated: only the cluster leader inserts, and every insert carries
//! a 59-second uniqueness window keyed on the entry's identity, so a
//! leadership handover inside a minute cannot double-enqueue. `@reboot`
//! entries fire once, the first time this plugin holds leadership after
//! process start.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DurationRound, Utc};
use serde_json::json;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::config::CronEntry;
use crate::engine::Engine;
use crate::job::{NewJob, UniqueOpts};
use crate::peer::Peer;

/// Offset past the minute boundary at which ticks fire, keeping the tick's
/// minute unambiguous under small clock skews.
const BOUNDARY_OFFSET: Duration = Duration::from_secs(1);

/// Uniqueness window for cron inserts: under one minute, so the next
/// legitimate firing is never blocked.
const UNIQUE_PERIOD: i64 = 59;

pub struct CronPlugin {
    engine: Arc<dyn Engine>,
    peer: Peer,
    entries: Vec<CronEntry>,
    reboot_pending: bool,
}

impl CronPlugin {
    pub fn new(engine: Arc<dyn Engine>, peer: Peer, entries: Vec<CronEntry>) -> Self {
        let reboot_pending = entries.iter().any(|entry| entry.cron.is_reboot());
        Self {
            engine,
            peer,
            entries,
            reboot_pending,
        }
    }

    pub async fn run(mut self, mut shutdown_rx: broadcast::Receiver<()>) {
        info!(entries = self.entries.len(), "cron plugin started");

        loop {
            let wait = until_next_tick();

            tokio::select! {
                _ = tokio::time::sleep(wait) => self.tick().await,
                _ = shutdown_rx.recv() => break,
            }
        }

        info!("cron plugin stopped");
    }

    async fn tick(&mut self) {
        if !self.peer.is_leader() {
            return;
        }

        if self.reboot_pending {
            self.reboot_pending = false;
            self.fire_reboot_entries().await;
        }

        let now = Utc::now();

        for entry in &self.entries {
            if !entry.cron.matches(now) {
                continue;
            }

            match self.engine.insert(&cron_job(entry)).await {
                Ok(job) if job.conflict => {
                    debug!(
                        worker = entry.worker.as_str(),
                        job_id = job.id,
                        "cron insert deduplicated"
                    );
                }
                Ok(job) => {
                    debug!(
                        worker = entry.worker.as_str(),
                        job_id = job.id,
                        expression = entry.cron.expression(),
                        "cron job inserted"
                    );
                }
                Err(e) => {
                    warn!(worker = entry.worker.as_str(), error = %e, "cron insert failed");
                }
            }
        }
    }

    async fn fire_reboot_entries(&self) {
        for entry in self.entries.iter().filter(|e| e.cron.is_reboot()) {
            match self.engine.insert(&cron_job(entry)).await {
                Ok(job) => {
                    info!(
                        worker = entry.worker.as_str(),
                        job_id = job.id,
                        conflict = job.conflict,
                        "reboot entry fired"
                    );
                }
                Err(e) => {
                    warn!(worker = entry.worker.as_str(), error = %e, "reboot insert failed");
                }
            }
        }
    }
}

/// Build the changeset for one cron firing.
///
/// The expression rides along in `meta` and participates in the
/// fingerprint, so distinct entries for the same worker stay independent
/// while two leaders firing the same entry in the same minute collapse to
/// one row.
fn cron_job(entry: &CronEntry) -> NewJob {
    NewJob::new(&entry.worker)
        .queue(&entry.queue)
        .args(entry.args.clone())
        .meta(json!({"cron": true, "cron_expr": entry.cron.expression()}))
        .unique(UniqueOpts {
            period: UNIQUE_PERIOD,
            meta_keys: vec!["cron_expr".to_owned()],
            ..UniqueOpts::default()
        })
}

/// Time until the next minute boundary plus the tick offset.
fn until_next_tick() -> Duration {
    let now = Utc::now();
    let minute = now
        .duration_trunc(chrono::Duration::minutes(1))
        .unwrap_or(now);
    let next = minute
        + chrono::Duration::minutes(1)
        + chrono::Duration::seconds(BOUNDARY_OFFSET.as_secs() as i64);

    (next - now).to_std().unwrap_or(Duration::from_secs(1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cron::Cron;
    use crate::engine::InlineEngine;
    use crate::job::JobState;

    fn entry(expression: &str, worker: &str) -> CronEntry {
        CronEntry::new(Cron::parse(expression).unwrap(), worker)
    }

    #[tokio::test]
    async fn tick_inserts_matching_entries_once() {
        let engine: Arc<InlineEngine> = Arc::new(InlineEngine::new("n1"));
        let mut plugin = CronPlugin::new(
            engine.clone(),
            Peer::global(),
            vec![entry("* * * * *", "tick")],
        );

        plugin.tick().await;
        // Same minute, second leader tick: deduplicated by the fingerprint
        plugin.tick().await;

        let first = engine.get(1).await.unwrap();
        let second = engine.get(2).await.unwrap();
        assert!(first.is_some());
        assert!(second.is_none(), "duplicate insert within the minute");
    }

    #[tokio::test]
    async fn follower_tick_is_a_noop() {
        let engine: Arc<InlineEngine> = Arc::new(InlineEngine::new("n1"));
        let mut plugin = CronPlugin::new(
            engine.clone(),
            Peer::disabled(),
            vec![entry("* * * * *", "tick")],
        );

        plugin.tick().await;
        assert!(engine.get(1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn two_alternating_leaders_insert_once_per_minute() {
        // Shared "database": both plugins insert through the same engine
        let engine: Arc<InlineEngine> = Arc::new(InlineEngine::new("n1"));

        let mut a = CronPlugin::new(
            engine.clone(),
            Peer::global(),
            vec![entry("* * * * *", "tick")],
        );
        let mut b = CronPlugin::new(
            engine.clone(),
            Peer::global(),
            vec![entry("* * * * *", "tick")],
        );

        // Handover inside one minute: both believe they lead
        a.tick().await;
        b.tick().await;

        assert!(engine.get(1).await.unwrap().is_some());
        assert!(
            engine.get(2).await.unwrap().is_none(),
            "only one insert per minute across leaders"
        );
    }

    #[tokio::test]
    async fn reboot_fires_once_on_first_leader_tick() {
        let engine: Arc<InlineEngine> = Arc::new(InlineEngine::new("n1"));
        let mut plugin = CronPlugin::new(
            engine.clone(),
            Peer::global(),
            vec![entry("@reboot", "warmup")],
        );

        plugin.tick().await;
        let job = engine.get(1).await.unwrap().expect("reboot entry inserted");
        assert_eq!(job.worker, "warmup");
        assert_eq!(job.state, JobState::Available);

        // Later ticks never refire @reboot
        plugin.tick().await;
        assert!(engine.get(2).await.unwrap().is_none());
    }

    #[test]
    fn next_tick_lands_just_past_a_minute_boundary() {
        let wait = until_next_tick();
        assert!(wait <= Duration::from_secs(61));
        assert!(wait > Duration::ZERO);
    }
}
