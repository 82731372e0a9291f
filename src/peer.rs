//! Single-leader election per named instance.
//!
//! Leadership is a row in `conveyor_peers` holding a lease with a TTL. The
//! holder refreshes at half the TTL; everyone else polls at the same
//! cadence and claims the lease once it expires. Exactly one live node per
//! instance reports leadership at any instant, modulo failover latency.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::json;
use sqlx::PgPool;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::notifier::{Channel, LeaderPayload, Notifier};

/// A handle onto this node's leadership state.
///
/// Clones share the same underlying election task. Leader-gated work
/// checks [`Peer::is_leader`] each cycle; reactive consumers watch
/// [`Peer::watch`] for changes.
#[derive(Clone)]
pub struct Peer {
    leader_rx: watch::Receiver<bool>,
    shutdown: CancellationToken,
}

impl Peer {
    /// Lease-based election through the database.
    pub fn postgres(
        pool: PgPool,
        prefix: &str,
        instance: &str,
        node: &str,
        ttl: Duration,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let (leader_tx, leader_rx) = watch::channel(false);
        let shutdown = CancellationToken::new();

        tokio::spawn(election_loop(
            pool,
            format!("\"{prefix}\".conveyor_peers"),
            instance.to_owned(),
            node.to_owned(),
            ttl,
            notifier,
            leader_tx,
            shutdown.clone(),
        ));

        Self {
            leader_rx,
            shutdown,
        }
    }

    /// Single-node mode: this node is always the leader.
    pub fn global() -> Self {
        let (_, leader_rx) = watch::channel(true);
        Self {
            leader_rx,
            shutdown: CancellationToken::new(),
        }
    }

    /// Never the leader; leader-gated plugins become no-ops on this node.
    pub fn disabled() -> Self {
        let (_, leader_rx) = watch::channel(false);
        Self {
            leader_rx,
            shutdown: CancellationToken::new(),
        }
    }

    /// Whether this node currently holds leadership.
    pub fn is_leader(&self) -> bool {
        *self.leader_rx.borrow()
    }

    /// Watch local leadership changes.
    pub fn watch(&self) -> watch::Receiver<bool> {
        self.leader_rx.clone()
    }

    /// Stop the election task, abdicating a held lease.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

#[allow(clippy::too_many_arguments)]
async fn election_loop(
    pool: PgPool,
    table: String,
    instance: String,
    node: String,
    ttl: Duration,
    notifier: Arc<dyn Notifier>,
    leader_tx: watch::Sender<bool>,
    shutdown: CancellationToken,
) {
    // Refresh well before expiry; followers poll at the same rate so
    // failover latency stays below one TTL.
    let interval = ttl / 2;
    let mut was_leader = false;

    loop {
        match claim_or_refresh(&pool, &table, &instance, &node, ttl).await {
            Ok(outcome) => {
                let is_leader = matches!(outcome, ClaimOutcome::Held { .. });

                if is_leader != was_leader {
                    if is_leader {
                        info!(instance = instance.as_str(), "assumed leadership");
                    } else {
                        info!(instance = instance.as_str(), "lost leadership");
                    }

                    was_leader = is_leader;
                    let _ = leader_tx.send(is_leader);

                    if let ClaimOutcome::Held { expires_at } = outcome {
                        let payload = LeaderPayload {
                            leader: node.clone(),
                            expires_at,
                        };
                        if let Ok(payload) = serde_json::to_value(&payload)
                            && let Err(e) = notifier.notify(Channel::Leader, payload).await
                        {
                            warn!(error = %e, "failed to announce leadership");
                        }
                    }
                } else if is_leader {
                    debug!(instance = instance.as_str(), "refreshed leadership lease");
                }
            }
            Err(e) => {
                // Treat a failed refresh as lost leadership: the lease may
                // expire before the next successful round trip.
                warn!(error = %e, "leadership check failed");
                if was_leader {
                    was_leader = false;
                    let _ = leader_tx.send(false);
                }
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown.cancelled() => break,
        }
    }

    if was_leader {
        let _ = leader_tx.send(false);
        if let Err(e) = abdicate(&pool, &table, &instance, &node).await {
            warn!(error = %e, "failed to release leadership lease");
        } else {
            info!(instance = instance.as_str(), "released leadership lease");
            let _ = notifier
                .notify(Channel::Leader, json!({"leader": null, "expires_at": null}))
                .await;
        }
    }
}

enum ClaimOutcome {
    Held { expires_at: DateTime<Utc> },
    Follower,
}

/// Claim the lease if free or already ours; refresh it if held by us.
async fn claim_or_refresh(
    pool: &PgPool,
    table: &str,
    instance: &str,
    node: &str,
    ttl: Duration,
) -> sqlx::Result<ClaimOutcome> {
    let row: Option<(String, DateTime<Utc>)> = sqlx::query_as(&format!(
        "INSERT INTO {table} AS peer (name, node, started_at, expires_at) \
         VALUES ($1, $2, now(), now() + make_interval(secs => $3::double precision)) \
         ON CONFLICT (name) DO UPDATE \
         SET node = EXCLUDED.node, expires_at = EXCLUDED.expires_at \
         WHERE peer.expires_at < now() OR peer.node = EXCLUDED.node \
         RETURNING node, expires_at"
    ))
    .bind(instance)
    .bind(node)
    .bind(ttl.as_secs_f64())
    .fetch_optional(pool)
    .await?;

    match row {
        Some((holder, expires_at)) if holder == node => Ok(ClaimOutcome::Held { expires_at }),
        _ => Ok(ClaimOutcome::Follower),
    }
}

/// Drop the lease on graceful shutdown so a peer can claim immediately.
async fn abdicate(pool: &PgPool, table: &str, instance: &str, node: &str) -> sqlx::Result<()> {
    sqlx::query(&format!(
        "DELETE FROM {table} WHERE name = $1 AND node = $2"
    ))
    .bind(instance)
    .bind(node)
    .execute(pool)
    .await?;

    Ok(())
}
