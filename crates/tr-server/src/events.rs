//! Observer notifications
//!
//! The GUI (or any other observer) subscribes to an [`EventSink`] handed to
//! the service at construction time. Publishing never blocks; observers that
//! fall behind lose the oldest events and are told how many they missed.

use tokio::sync::broadcast;
use tr_core::{ContainersState, Flow};

/// Events published for observers of the agent session
#[derive(Debug, Clone)]
pub enum ObserverEvent {
    /// Flows appended or updated by one report batch
    FlowsChanged(Vec<Flow>),
    /// Latest container snapshot from the agent
    ContainersObserved(ContainersState),
    /// Agent liveness flipped
    AgentRunningChanged(bool),
}

/// Broadcast endpoint for observer events
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: broadcast::Sender<ObserverEvent>,
}

impl EventSink {
    /// Create a sink buffering up to `capacity` events per observer
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish an event to every current observer
    pub fn publish(&self, event: ObserverEvent) {
        if self.tx.send(event).is_err() {
            tracing::trace!("No observers subscribed; event discarded");
        }
    }

    /// Register a new observer
    pub fn subscribe(&self) -> broadcast::Receiver<ObserverEvent> {
        self.tx.subscribe()
    }

    /// Number of registered observers
    pub fn observer_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventSink {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_all_observers() {
        let sink = EventSink::new(8);
        let mut a = sink.subscribe();
        let mut b = sink.subscribe();
        assert_eq!(sink.observer_count(), 2);

        sink.publish(ObserverEvent::AgentRunningChanged(true));

        assert!(matches!(a.recv().await, Ok(ObserverEvent::AgentRunningChanged(true))));
        assert!(matches!(b.recv().await, Ok(ObserverEvent::AgentRunningChanged(true))));
    }

    #[test]
    fn test_publish_without_observers_is_harmless() {
        let sink = EventSink::new(8);
        sink.publish(ObserverEvent::AgentRunningChanged(false));
    }
}
