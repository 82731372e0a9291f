//! In-process notifier backend.
//!
//! Used in single-node deployments and tests, where cluster fan-out is
//! unnecessary. Semantics match the database backend: best-effort,
//! per-channel FIFO, oversized payloads dropped.

use serde_json::Value;
use tokio::sync::broadcast;

use crate::error::Result;
use crate::notifier::{Channel, Notification, Notifier, within_size_limit};

pub struct LocalNotifier {
    channels: [broadcast::Sender<Notification>; 4],
}

impl LocalNotifier {
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: std::array::from_fn(|_| broadcast::channel(capacity).0),
        }
    }

    fn sender(&self, channel: Channel) -> &broadcast::Sender<Notification> {
        let index = Channel::ALL
            .iter()
            .position(|c| *c == channel)
            .expect("channel present in ALL");
        &self.channels[index]
    }
}

impl Default for LocalNotifier {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait::async_trait]
impl Notifier for LocalNotifier {
    async fn notify(&self, channel: Channel, payload: Value) -> Result<()> {
        let encoded = payload.to_string();
        if !within_size_limit(channel, &encoded) {
            return Ok(());
        }

        // No subscribers is not an error
        let _ = self.sender(channel).send(Notification { channel, payload });
        Ok(())
    }

    fn subscribe(&self, channel: Channel) -> broadcast::Receiver<Notification> {
        self.sender(channel).subscribe()
    }
}
