//! Process event bus.
//!
//! Fans typed fabric events out to any interested task (adapter
//! reconfiguration, coordinator role logging, REST observers). Backed by a
//! broadcast channel; lagging subscribers lose oldest events, which is
//! acceptable for notifications.

use serde_json::Value;
use tokio::sync::broadcast;

/// Events published on the bus.
#[derive(Debug, Clone)]
pub enum FabricEvent {
    SessionConnected {
        session_id: String,
        user_id: String,
    },
    SessionDisconnected {
        session_id: String,
    },
    ConfigUpdated {
        section: String,
        parameter: String,
        old_value: Value,
        new_value: Value,
        origin_node: String,
    },
    CoordinatorChanged {
        node_id: String,
        is_coordinator: bool,
    },
    /// The shared tool-call counter crossed its quota.
    RecoveryNeeded {
        tool: String,
    },
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<FabricEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1024);
        Self { tx }
    }

    /// Publish an event. No subscribers is fine.
    pub fn publish(&self, event: FabricEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FabricEvent> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delivers_to_all_subscribers() {
        let bus = EventBus::new();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();
        bus.publish(FabricEvent::SessionDisconnected {
            session_id: "s1".into(),
        });
        assert!(matches!(
            a.recv().await.unwrap(),
            FabricEvent::SessionDisconnected { .. }
        ));
        assert!(matches!(
            b.recv().await.unwrap(),
            FabricEvent::SessionDisconnected { .. }
        ));
    }

    #[test]
    fn publish_without_subscribers_does_not_panic() {
        EventBus::new().publish(FabricEvent::RecoveryNeeded {
            tool: "search".into(),
        });
    }
}
