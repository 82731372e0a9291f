use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;
use tracing::info;

use crate::config::{Config, EngineKind, NotifierKind, PeerKind, TestingMode};
use crate::engine::{Engine, InlineEngine, PostgresEngine};
use crate::instance::Conveyor;
use crate::notifier::{LocalNotifier, Notifier, PostgresNotifier};
use crate::peer::Peer;
use crate::registry;
use crate::services::engine::EngineService;
use crate::services::manager::ServiceManager;
use crate::store::JobStore;

/// Main application struct containing all necessary components
pub struct App {
    config: Config,
    conveyor: Conveyor,
    peer: Peer,
    service_manager: ServiceManager,
}

impl App {
    /// Create a new App instance with all backends resolved from config.
    pub async fn new(config: Config) -> Result<Self, anyhow::Error> {
        // Create database connection pool
        let db_pool = PgPoolOptions::new()
            .min_connections(0)
            .max_connections(10)
            .acquire_timeout(Duration::from_secs(4))
            .idle_timeout(Duration::from_secs(60 * 2))
            .max_lifetime(Duration::from_secs(60 * 30))
            .connect(&config.database_url)
            .await
            .context("Failed to create database pool")?;

        info!("database pool established");

        sqlx::migrate!("./migrations")
            .run(&db_pool)
            .await
            .context("Failed to run database migrations")?;

        let notifier: Arc<dyn Notifier> = match config.notifier {
            NotifierKind::Postgres => Arc::new(PostgresNotifier::new(
                db_pool.clone(),
                config.instance.clone(),
            )),
            NotifierKind::Local => Arc::new(LocalNotifier::default()),
        };

        let (engine, inline): (Arc<dyn Engine>, Option<Arc<InlineEngine>>) =
            match (config.engine, config.testing) {
                (EngineKind::Inline, _) | (_, TestingMode::Inline) => {
                    let inline = Arc::new(InlineEngine::new(config.node.clone()));
                    (inline.clone(), Some(inline))
                }
                (EngineKind::Postgres, _) => {
                    let store =
                        JobStore::new(db_pool.clone(), &config.prefix, config.node.clone());
                    (
                        Arc::new(PostgresEngine::new(store, notifier.clone())),
                        None,
                    )
                }
            };

        let peer = match config.peer {
            PeerKind::Postgres => Peer::postgres(
                db_pool.clone(),
                &config.prefix,
                &config.instance,
                &config.node,
                config.leader_ttl,
                notifier.clone(),
            ),
            PeerKind::Global => Peer::global(),
            PeerKind::Disabled => Peer::disabled(),
        };

        let conveyor = Conveyor::new(config.instance.clone(), engine);

        if let Some(inline) = inline {
            // Inline execution resolves workers through this instance's registry
            inline.attach_runtime(conveyor.workers().clone(), conveyor.hooks().clone());
        }

        registry::register(conveyor.clone());

        info!(
            instance = config.instance.as_str(),
            node = config.node.as_str(),
            queues = config.queues.len(),
            "conveyor instance registered"
        );

        Ok(App {
            config,
            conveyor,
            peer,
            service_manager: ServiceManager::new(),
        })
    }

    /// The instance handle, for registering workers before startup.
    pub fn conveyor(&self) -> &Conveyor {
        &self.conveyor
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Register services according to the configured testing mode.
    pub fn setup_services(&mut self) {
        match self.config.testing {
            TestingMode::Disabled => {
                let engine_service = Box::new(EngineService::new(
                    self.conveyor.clone(),
                    self.peer.clone(),
                    &self.config,
                ));
                self.service_manager.register_service("engine", engine_service);
            }
            mode => {
                // Manual and inline test modes run no background machinery
                info!(mode = ?mode, "testing mode active, engine service disabled");
            }
        }
    }

    /// Start all registered services
    pub fn start_services(&mut self) {
        self.service_manager.spawn_all();
    }

    /// Run the application and handle shutdown signals
    pub async fn run(self) -> ExitCode {
        use crate::signals::handle_shutdown_signals;

        let exit = handle_shutdown_signals(
            self.service_manager,
            self.config.shutdown_grace_period,
            &self.config.instance,
        )
        .await;

        registry::unregister(&self.config.instance);
        exit
    }
}
