//! Broadcast channel between contexts (tabs, windows, workers) of a device.

use converge_engine::{CollectionName, DeltaEnvelope};
use tokio::sync::broadcast;

const BUS_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq)]
pub enum TabMessage {
    /// Deltas were merged into a collection; other contexts should merge them too.
    Changed {
        collection: CollectionName,
        deltas: Vec<DeltaEnvelope>,
    },
    /// A context wrote locally and the leader should push.
    LocalChange { collection: CollectionName },
}

/// A message with the id of the context that sent it.
#[derive(Debug, Clone, PartialEq)]
pub struct TabEnvelope {
    pub from: String,
    pub message: TabMessage,
}

#[derive(Debug, Clone)]
pub struct TabBus {
    sender: broadcast::Sender<TabEnvelope>,
}

impl TabBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(BUS_CAPACITY);
        Self { sender }
    }

    pub fn publish(&self, from: &str, message: TabMessage) {
        // No subscribers is fine
        let _ = self.sender.send(TabEnvelope {
            from: from.to_string(),
            message,
        });
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TabEnvelope> {
        self.sender.subscribe()
    }
}

impl Default for TabBus {
    fn default() -> Self {
        Self::new()
    }
}
