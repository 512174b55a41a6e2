//! Lifecycle event fan-out.
//!
//! Emission never blocks a lifecycle transition: the hub is a broadcast
//! channel with a fixed capacity and drop-oldest overflow, and sending
//! to zero subscribers is not an error.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::constants::EVENT_CHANNEL_CAPACITY;
use crate::container::Container;

/// A lifecycle event carrying a deep copy of the container view at the
/// moment of the transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum LifecycleEvent {
    /// Capacity was reserved for the container.
    Reserved(Container),
    /// The supervised group signalled ready.
    Running(Container),
    /// The container reached its terminal state.
    Completed(Container),
}

impl LifecycleEvent {
    /// GUID of the container the event concerns.
    #[must_use]
    pub fn guid(&self) -> &str {
        match self {
            Self::Reserved(c) | Self::Running(c) | Self::Completed(c) => &c.guid,
        }
    }
}

/// Broadcast hub for lifecycle events.
#[derive(Clone)]
pub struct EventHub {
    tx: broadcast::Sender<LifecycleEvent>,
}

impl EventHub {
    /// Creates a hub.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Publishes an event. Fire-and-forget: subscribers that lag past
    /// the channel capacity lose the oldest events.
    pub fn emit(&self, event: LifecycleEvent) {
        let _ = self.tx.send(event);
    }

    /// Subscribes to all future events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::AllocationRequest;
    use chrono::Utc;

    #[tokio::test]
    async fn test_emit_without_subscribers_is_silent() {
        let hub = EventHub::new();
        let container = Container::reserve("g", &AllocationRequest::default(), Utc::now());
        hub.emit(LifecycleEvent::Reserved(container));
    }

    #[tokio::test]
    async fn test_subscriber_receives_events_in_order() {
        let hub = EventHub::new();
        let mut rx = hub.subscribe();
        let container = Container::reserve("g", &AllocationRequest::default(), Utc::now());

        hub.emit(LifecycleEvent::Running(container.clone()));
        hub.emit(LifecycleEvent::Completed(container));

        assert!(matches!(rx.recv().await, Ok(LifecycleEvent::Running(_))));
        assert!(matches!(rx.recv().await, Ok(LifecycleEvent::Completed(_))));
    }
}
