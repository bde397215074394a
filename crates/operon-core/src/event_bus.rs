//! In-process event bus for [`OperationEvent`]s, broadcast to every
//! subscriber. At-least-once delivery within the process; publishing
//! with no subscribers is a no-op rather than an error, since the engine
//! can run perfectly well with nobody listening.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use operon_types::OperationEvent;
use tokio::sync::broadcast;

const DEFAULT_CAPACITY: usize = 1024;

/// A `tokio::sync::broadcast` wrapper scoped to [`OperationEvent`].
/// Cloning an `EventBus` clones the sender handle and sequence counter,
/// not the channel -- every clone publishes onto the same underlying
/// broadcast and shares the same monotonic sequence numbering.
pub struct EventBus {
    sender: broadcast::Sender<OperationEvent>,
    next_sequence: Arc<AtomicU64>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _receiver) = broadcast::channel(capacity);
        Self { sender, next_sequence: Arc::new(AtomicU64::new(1)) }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OperationEvent> {
        self.sender.subscribe()
    }

    /// Publish `event` to every current subscriber, stamping it with the
    /// next sequence number first. Returns the number of receivers the
    /// event was delivered to.
    pub fn publish(&self, mut event: OperationEvent) -> usize {
        event.sequence_number = self.next_sequence.fetch_add(1, Ordering::SeqCst);
        self.sender.send(event).unwrap_or(0)
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl Clone for EventBus {
    fn clone(&self) -> Self {
        Self { sender: self.sender.clone(), next_sequence: self.next_sequence.clone() }
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus").field("receiver_count", &self.sender.receiver_count()).finish()
    }
}

#[cfg(test)]
mod tests {
    use operon_types::event::OperationEventType;
    use operon_types::OperationId;

    use super::*;

    fn event() -> OperationEvent {
        OperationEvent::new(OperationId::new(), OperationEventType::OperationStarted, "orchestrator")
    }

    #[test]
    fn publish_with_no_subscribers_is_a_no_op() {
        let bus = EventBus::new(16);
        assert_eq!(bus.publish(event()), 0);
    }

    #[tokio::test]
    async fn subscriber_receives_published_event() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();
        assert_eq!(bus.publish(event()), 1);
        let received = rx.recv().await.unwrap();
        assert_eq!(received.event_type, OperationEventType::OperationStarted);
    }

    #[tokio::test]
    async fn every_subscriber_gets_its_own_copy() {
        let bus = EventBus::new(16);
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();
        bus.publish(event());
        assert!(rx1.recv().await.is_ok());
        assert!(rx2.recv().await.is_ok());
    }

    #[test]
    fn clone_shares_the_same_channel() {
        let bus = EventBus::new(16);
        let clone = bus.clone();
        let mut rx = bus.subscribe();
        clone.publish(event());
        assert_eq!(bus.subscriber_count(), 1);
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn subscriber_count_reflects_active_receivers() {
        let bus = EventBus::new(16);
        assert_eq!(bus.subscriber_count(), 0);
        let rx = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 1);
        drop(rx);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn sequence_numbers_are_monotonic_and_shared_across_clones() {
        let bus = EventBus::new(16);
        let clone = bus.clone();
        let mut rx = bus.subscribe();

        bus.publish(event());
        clone.publish(event());
        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert!(second.sequence_number > first.sequence_number);
    }

    #[test]
    fn debug_impl_does_not_panic() {
        let bus = EventBus::new(16);
        let text = format!("{bus:?}");
        assert!(text.contains("receiver_count"));
    }
}
