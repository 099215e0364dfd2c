//! Broadcast bus distributing `EngineEvent`s to observers.
//!
//! Built on `tokio::sync::broadcast`. Publishing with no subscribers is a
//! no-op, so the executor publishes unconditionally.

use stepwise_types::event::EngineEvent;
use tokio::sync::broadcast;

/// Multi-consumer bus for job and recovery events.
///
/// Cloning the bus clones the sender; every clone feeds the same channel.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }

    /// Publish to all current subscribers; dropped when nobody listens.
    pub fn publish(&self, event: EngineEvent) {
        let _ = self.sender.send(event);
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("receiver_count", &self.sender.receiver_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pass_started() -> EngineEvent {
        EngineEvent::RecoveryPassStarted {
            instance_id: "node-a".to_string(),
        }
    }

    #[tokio::test]
    async fn every_subscriber_receives_event() {
        let bus = EventBus::new(16);
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        bus.publish(pass_started());

        assert!(matches!(rx1.recv().await.unwrap(), EngineEvent::RecoveryPassStarted { .. }));
        assert!(matches!(rx2.recv().await.unwrap(), EngineEvent::RecoveryPassStarted { .. }));
    }

    #[test]
    fn publish_without_subscribers_is_noop() {
        let bus = EventBus::new(4);
        bus.publish(pass_started());
        assert_eq!(bus.receiver_count(), 0);
    }

    #[test]
    fn lagged_receiver_reports_lag() {
        let bus = EventBus::new(2);
        let mut rx = bus.subscribe();
        for i in 0..5 {
            bus.publish(EngineEvent::TaskRecoverySkipped {
                task_id: format!("exec-{i}"),
                reason: "claimed elsewhere".to_string(),
            });
        }
        match rx.try_recv() {
            Ok(_) | Err(broadcast::error::TryRecvError::Lagged(_)) => {}
            Err(other) => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn clone_shares_channel() {
        let bus = EventBus::new(16);
        let publisher = bus.clone();
        let mut rx = bus.subscribe();
        publisher.publish(pass_started());
        assert!(rx.try_recv().is_ok());
    }
}
