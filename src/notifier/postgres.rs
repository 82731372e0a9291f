//! Postgres LISTEN/NOTIFY notifier backend.
//!
//! Publishes through `pg_notify` and fans incoming notifications out to
//! in-process broadcast subscribers. A dedicated listener task holds the
//! LISTEN connection and reconnects with backoff when it drops; messages
//! arriving while disconnected are lost, which the at-most-once contract
//! allows.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use sqlx::PgPool;
use sqlx::postgres::PgListener;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::Result;
use crate::notifier::{Channel, Notification, Notifier, within_size_limit};

/// Delay before re-establishing a dropped LISTEN connection.
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

pub struct PostgresNotifier {
    pool: PgPool,
    instance: String,
    channels: Arc<[broadcast::Sender<Notification>; 4]>,
    shutdown: CancellationToken,
}

impl PostgresNotifier {
    /// Create the notifier and spawn its listener task.
    pub fn new(pool: PgPool, instance: impl Into<String>) -> Self {
        let instance = instance.into();
        let channels: Arc<[broadcast::Sender<Notification>; 4]> =
            Arc::new(std::array::from_fn(|_| broadcast::channel(1024).0));
        let shutdown = CancellationToken::new();

        tokio::spawn(listen_loop(
            pool.clone(),
            instance.clone(),
            channels.clone(),
            shutdown.clone(),
        ));

        Self {
            pool,
            instance,
            channels,
            shutdown,
        }
    }

    /// Stop the listener task. Subsequent notifications are not received.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    fn sender(channels: &[broadcast::Sender<Notification>; 4], channel: Channel) -> &broadcast::Sender<Notification> {
        let index = Channel::ALL
            .iter()
            .position(|c| *c == channel)
            .expect("channel present in ALL");
        &channels[index]
    }
}

#[async_trait::async_trait]
impl Notifier for PostgresNotifier {
    async fn notify(&self, channel: Channel, payload: Value) -> Result<()> {
        let encoded = payload.to_string();
        if !within_size_limit(channel, &encoded) {
            return Ok(());
        }

        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(channel.full_name(&self.instance))
            .bind(&encoded)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    fn subscribe(&self, channel: Channel) -> broadcast::Receiver<Notification> {
        Self::sender(&self.channels, channel).subscribe()
    }
}

/// Hold the LISTEN connection and forward notifications to subscribers.
async fn listen_loop(
    pool: PgPool,
    instance: String,
    channels: Arc<[broadcast::Sender<Notification>; 4]>,
    shutdown: CancellationToken,
) {
    let names: Vec<String> = Channel::ALL
        .iter()
        .map(|c| c.full_name(&instance))
        .collect();
    let name_refs: Vec<&str> = names.iter().map(String::as_str).collect();

    loop {
        if shutdown.is_cancelled() {
            return;
        }

        let mut listener = match PgListener::connect_with(&pool).await {
            Ok(listener) => listener,
            Err(e) => {
                warn!(error = %e, "notifier failed to connect, retrying");
                tokio::select! {
                    _ = tokio::time::sleep(RECONNECT_DELAY) => continue,
                    _ = shutdown.cancelled() => return,
                }
            }
        };

        if let Err(e) = listener.listen_all(name_refs.iter().copied()).await {
            warn!(error = %e, "notifier failed to LISTEN, retrying");
            tokio::select! {
                _ = tokio::time::sleep(RECONNECT_DELAY) => continue,
                _ = shutdown.cancelled() => return,
            }
        }

        debug!(channels = ?names, "notifier listening");

        loop {
            let received = tokio::select! {
                received = listener.recv() => received,
                _ = shutdown.cancelled() => return,
            };

            match received {
                Ok(message) => {
                    let Some(channel) = Channel::from_full_name(message.channel(), &instance)
                    else {
                        continue;
                    };

                    let payload: Value = match serde_json::from_str(message.payload()) {
                        Ok(payload) => payload,
                        Err(e) => {
                            warn!(
                                channel = %channel,
                                error = %e,
                                "discarding malformed notification payload"
                            );
                            continue;
                        }
                    };

                    let _ = PostgresNotifier::sender(&channels, channel)
                        .send(Notification { channel, payload });
                }
                Err(e) => {
                    warn!(error = %e, "notifier connection lost, reconnecting");
                    tokio::select! {
                        _ = tokio::time::sleep(RECONNECT_DELAY) => break,
                        _ = shutdown.cancelled() => return,
                    }
                }
            }
        }
    }
}
