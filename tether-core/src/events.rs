#![forbid(unsafe_code)]

//! Typed event bus. The core publishes, interested parties (a UI, tests,
//! the log) subscribe; the core never knows who is listening.

use std::net::SocketAddr;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::types::{DirectoryId, NatClass};

/// Events published by the connectivity and transfer cores.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    /// A friend's encrypted connection completed.
    PeerConnected { friend: DirectoryId },
    /// A friend's connection closed or timed out.
    PeerDisconnected { friend: DirectoryId },
    /// Own connectivity settled; external endpoint may be absent when
    /// the network is unreachable.
    ConnectivityReady {
        nat: NatClass,
        external: Option<SocketAddr>,
    },
    /// A transfer group started downloading.
    TransferStarted { group_id: u32, title: String },
    /// Every file in the group finished and was moved into place.
    TransferCompleted { group_id: u32 },
    /// The group failed and will not make further progress.
    TransferFailed { group_id: u32, reason: String },
    /// A transfer has made no progress past the stall budget.
    TransferStalled { group_id: u32 },
    /// An item request got an answer that needs user attention
    /// (lend offer, chat invitation, plain message).
    RequestAnswered { friend: DirectoryId, item_id: u32 },
    /// A friend recommended a file set.
    SuggestionReceived { friend: DirectoryId, title: String },
    /// Free-form warning surfaced to the user (bad firewall, disk full).
    SystemWarning { title: String, detail: String },
}

/// Broadcast-backed pub/sub for [`Event`]s.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new(buffer: usize) -> Self {
        let (tx, _rx) = broadcast::channel(buffer);
        Self { tx }
    }

    /// Publish, ignoring the no-subscriber case.
    pub fn publish(&self, event: Event) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_reaches_subscriber() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        bus.publish(Event::TransferCompleted { group_id: 7 });
        match rx.recv().await {
            Ok(Event::TransferCompleted { group_id }) => assert_eq!(group_id, 7),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn publish_without_subscribers_is_fine() {
        let bus = EventBus::default();
        bus.publish(Event::SystemWarning {
            title: "t".into(),
            detail: "d".into(),
        });
    }
}
