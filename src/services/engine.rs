//! The engine service: one producer task per queue plus the configured
//! plugins, sharing a single shutdown channel.

use std::collections::BTreeMap;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::{Config, CronEntry, PluginKind, QueueConfig};
use crate::executor::Executor;
use crate::instance::Conveyor;
use crate::peer::Peer;
use crate::plugins::{CronPlugin, Lifeline, LifelineOptions, Stager};
use crate::queue::{Producer, ProducerOptions};
use crate::services::Service;

pub struct EngineService {
    conveyor: Conveyor,
    peer: Peer,
    queues: BTreeMap<String, QueueConfig>,
    plugins: Vec<PluginKind>,
    crontab: Vec<CronEntry>,
    producer_opts: ProducerOptions,
    stage_interval: std::time::Duration,
    lifeline_opts: LifelineOptions,
    handles: Vec<JoinHandle<()>>,
    shutdown_tx: Option<broadcast::Sender<()>>,
}

impl EngineService {
    pub fn new(conveyor: Conveyor, peer: Peer, config: &Config) -> Self {
        Self {
            conveyor,
            peer,
            queues: config.queues.clone(),
            plugins: config.plugins.clone(),
            crontab: config.crontab.clone(),
            producer_opts: ProducerOptions {
                limit: 0,
                paused: false,
                refresh_interval: config.refresh_interval,
                dispatch_cooldown: config.dispatch_cooldown,
                shutdown_grace: config.shutdown_grace_period,
            },
            stage_interval: config.stage_interval,
            lifeline_opts: LifelineOptions {
                interval: config.lifeline_interval,
                rescue_after: config.rescue_after,
                completed_retention: config.completed_retention,
                failed_retention: config.failed_retention,
                prune_limit: config.prune_limit,
            },
            handles: Vec::new(),
            shutdown_tx: None,
        }
    }

    async fn start(&mut self) {
        let engine = self.conveyor.engine().clone();

        // Recover jobs this cluster left executing through a previous
        // outage before producers start competing for fresh work
        match engine.rescue_orphans(self.lifeline_opts.rescue_after).await {
            Ok(report) if report.rescued > 0 || report.discarded > 0 => {
                warn!(
                    rescued = report.rescued,
                    discarded = report.discarded,
                    "recovered orphans from previous run"
                );
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "startup orphan rescue failed"),
        }

        let (shutdown_tx, _) = broadcast::channel(1);
        self.shutdown_tx = Some(shutdown_tx.clone());

        for (queue, queue_config) in &self.queues {
            let opts = ProducerOptions {
                limit: queue_config.limit,
                paused: queue_config.paused,
                dispatch_cooldown: queue_config
                    .dispatch_cooldown
                    .unwrap_or(self.producer_opts.dispatch_cooldown),
                ..self.producer_opts.clone()
            };

            let executor = Executor::new(
                engine.clone(),
                self.conveyor.workers().clone(),
                self.conveyor.hooks().clone(),
            );
            let producer = Producer::new(queue.clone(), engine.clone(), executor, opts);
            let shutdown_rx = shutdown_tx.subscribe();
            self.handles
                .push(tokio::spawn(async move { producer.run(shutdown_rx).await }));
        }

        info!(queue_count = self.queues.len(), "spawned queue producers");

        for plugin in &self.plugins {
            let shutdown_rx = shutdown_tx.subscribe();
            let handle = match plugin {
                PluginKind::Stager => {
                    let stager = Stager::new(engine.clone(), self.stage_interval);
                    tokio::spawn(async move { stager.run(shutdown_rx).await })
                }
                PluginKind::Cron => {
                    let cron = CronPlugin::new(
                        engine.clone(),
                        self.peer.clone(),
                        self.crontab.clone(),
                    );
                    tokio::spawn(async move { cron.run(shutdown_rx).await })
                }
                PluginKind::Lifeline => {
                    let lifeline = Lifeline::new(
                        engine.clone(),
                        self.peer.clone(),
                        self.lifeline_opts.clone(),
                    );
                    tokio::spawn(async move { lifeline.run(shutdown_rx).await })
                }
            };
            self.handles.push(handle);
        }

        info!(plugin_count = self.plugins.len(), "spawned plugins");
    }
}

#[async_trait::async_trait]
impl Service for EngineService {
    fn name(&self) -> &'static str {
        "engine"
    }

    async fn run(&mut self) -> Result<(), anyhow::Error> {
        self.start().await;
        std::future::pending::<()>().await;
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<(), anyhow::Error> {
        info!("shutting down engine service");

        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(());
        } else {
            warn!("no shutdown channel found for engine service");
            return Err(anyhow::anyhow!("no shutdown channel available"));
        }

        let results = futures::future::join_all(self.handles.drain(..)).await;
        let failed = results.iter().filter(|r| r.is_err()).count();
        if failed > 0 {
            warn!(failed_count = failed, "some engine tasks panicked during shutdown");
            return Err(anyhow::anyhow!("{failed} task(s) panicked"));
        }

        self.peer.shutdown();

        info!("all engine tasks shutdown gracefully");
        Ok(())
    }
}
