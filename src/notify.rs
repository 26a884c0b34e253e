use dashmap::DashMap;
use tokio::sync::broadcast;

use crate::model::{Event, PropertyId};

const CHANNEL_CAPACITY: usize = 256;

/// Post-commit broadcast hub, one channel per property.
///
/// Mutations publish here only after the journal append succeeds; subscribers
/// (notification dispatch, cache invalidation) never observe a rejected write.
pub struct NotifyHub {
    channels: DashMap<PropertyId, broadcast::Sender<Event>>,
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to committed events for a property. Creates the channel if needed.
    pub fn subscribe(&self, property_id: PropertyId) -> broadcast::Receiver<Event> {
        self.channels
            .entry(property_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Publish a committed event. No-op if nobody is listening.
    pub fn send(&self, property_id: PropertyId, event: &Event) {
        if let Some(sender) = self.channels.get(&property_id) {
            let _ = sender.send(event.clone());
        }
    }
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    #[tokio::test]
    async fn subscribe_and_receive() {
        let hub = NotifyHub::new();
        let pid = Ulid::new();
        let mut rx = hub.subscribe(pid);

        let event = Event::ReservationCancelled {
            id: Ulid::new(),
            property_id: pid,
        };
        hub.send(pid, &event);

        assert_eq!(rx.recv().await.unwrap(), event);
    }

    #[tokio::test]
    async fn send_without_subscribers_is_noop() {
        let hub = NotifyHub::new();
        let pid = Ulid::new();
        hub.send(
            pid,
            &Event::HoldExpired {
                id: Ulid::new(),
                property_id: pid,
            },
        );
    }
}
