//! Cluster-wide pub/sub for events and signals.
//!
//! Delivery is best-effort and at-most-once: producers must keep working
//! from database state alone, notifications only shorten the latency.
//! Ordering holds within a single channel from a single publisher and
//! nowhere else.

mod local;
mod postgres;

pub use local::LocalNotifier;
pub use postgres::PostgresNotifier;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

use crate::error::{Error, Result};

/// Payloads above this size are dropped instead of fragmented. Bounded by
/// the Postgres NOTIFY limit of 8000 bytes, with headroom for the envelope.
pub const MAX_PAYLOAD_BYTES: usize = 7500;

/// The four pub/sub channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    /// Announces newly available jobs, keyed by queue.
    Insert,
    /// Out-of-band commands: scale, pause, resume, cancel, pkill.
    Signal,
    /// Leadership change announcements.
    Leader,
    /// Producer-state heartbeats.
    Gossip,
}

impl Channel {
    pub const ALL: [Channel; 4] = [
        Channel::Insert,
        Channel::Signal,
        Channel::Leader,
        Channel::Gossip,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Insert => "insert",
            Channel::Signal => "signal",
            Channel::Leader => "leader",
            Channel::Gossip => "gossip",
        }
    }

    /// The transport-level channel name, namespaced per instance.
    pub fn full_name(&self, instance: &str) -> String {
        format!("{}_{}", instance, self.as_str())
    }

    pub fn from_full_name(name: &str, instance: &str) -> Option<Channel> {
        let suffix = name.strip_prefix(instance)?.strip_prefix('_')?;
        Channel::ALL.iter().copied().find(|c| c.as_str() == suffix)
    }
}

/// A received message: the channel it arrived on plus its payload document.
#[derive(Debug, Clone)]
pub struct Notification {
    pub channel: Channel,
    pub payload: Value,
}

/// `insert` channel payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InsertPayload {
    pub queue: String,
}

/// `signal` channel payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum SignalPayload {
    Scale { queue: String, limit: usize },
    Pause { queue: String },
    Resume { queue: String },
    Cancel { id: i64 },
    Pkill { id: i64 },
}

/// `leader` channel payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LeaderPayload {
    pub leader: String,
    pub expires_at: DateTime<Utc>,
}

/// `gossip` channel payload: one producer's heartbeat.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GossipPayload {
    pub node: String,
    pub queue: String,
    pub limit: usize,
    pub running: Vec<i64>,
    pub paused: bool,
    pub started_at: DateTime<Utc>,
}

/// A pub/sub backend.
#[async_trait::async_trait]
pub trait Notifier: Send + Sync {
    /// Publish `payload` on `channel`. Oversized payloads are dropped with
    /// a warning; publication is otherwise best-effort.
    async fn notify(&self, channel: Channel, payload: Value) -> Result<()>;

    /// Subscribe to one channel. Receivers that lag simply miss messages.
    fn subscribe(&self, channel: Channel) -> broadcast::Receiver<Notification>;
}

/// Shared size guard for both backends. Returns false when the payload
/// must be dropped.
pub(crate) fn within_size_limit(channel: Channel, encoded: &str) -> bool {
    if encoded.len() > MAX_PAYLOAD_BYTES {
        tracing::warn!(
            channel = channel.as_str(),
            size = encoded.len(),
            limit = MAX_PAYLOAD_BYTES,
            "dropping oversized notification payload"
        );
        return false;
    }
    true
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decode a typed payload out of a notification document.
pub fn decode<T: serde::de::DeserializeOwned>(notification: &Notification) -> Result<T> {
    serde_json::from_value(notification.payload.clone()).map_err(Error::from)
}
