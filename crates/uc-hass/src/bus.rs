//! Broadcast event bus

use dashmap::DashMap;
use std::marker::PhantomData;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, trace};
use uc_core::{Context, Event, EventData};

const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Event bus keyed by event type
///
/// Each event type gets its own broadcast channel, created on first
/// subscription. Firing an event nobody listens to is a no-op.
pub struct EventBus {
    channels: DashMap<String, broadcast::Sender<Event>>,
    capacity: usize,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            channels: DashMap::new(),
            capacity,
        }
    }

    /// Subscribe to every event fired under `event_type`
    pub fn subscribe(&self, event_type: &str) -> broadcast::Receiver<Event> {
        trace!(event_type, "Subscribing to event type");
        self.channels
            .entry(event_type.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// Subscribe to events whose payload deserializes into `T`
    pub fn subscribe_typed<T>(&self) -> TypedEventReceiver<T>
    where
        T: EventData + serde::de::DeserializeOwned,
    {
        TypedEventReceiver {
            rx: self.subscribe(T::event_type()),
            _phantom: PhantomData,
        }
    }

    pub fn fire(&self, event: Event) {
        debug!(event_type = %event.event_type, "Firing event");
        if let Some(sender) = self.channels.get(&event.event_type) {
            // A send error only means there is no receiver right now
            let _ = sender.send(event);
        }
    }

    pub fn fire_typed<T: EventData + serde::Serialize>(&self, data: T, context: Context) {
        let event = Event::typed(data, context)
            .map(|data| serde_json::to_value(data).unwrap_or_default());
        self.fire(event);
    }

    /// Number of live receivers for an event type
    pub fn receiver_count(&self, event_type: &str) -> usize {
        self.channels
            .get(event_type)
            .map(|sender| sender.receiver_count())
            .unwrap_or(0)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiver that decodes event payloads into `T`
pub struct TypedEventReceiver<T> {
    rx: broadcast::Receiver<Event>,
    _phantom: PhantomData<T>,
}

impl<T: EventData + serde::de::DeserializeOwned> TypedEventReceiver<T> {
    /// Receive the next event whose payload decodes into `T`
    ///
    /// Payloads that fail to decode are skipped.
    pub async fn recv(&mut self) -> Result<Event<T>, broadcast::error::RecvError> {
        loop {
            let event = self.rx.recv().await?;
            if let Ok(data) = serde_json::from_value::<T>(event.data.clone()) {
                return Ok(event.map(|_| data));
            }
        }
    }
}

pub type SharedEventBus = Arc<EventBus>;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;
    use uc_core::events::StateChangedData;
    use uc_core::{EntityId, State};

    #[tokio::test]
    async fn test_fire_reaches_subscriber() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe("remote_event");

        bus.fire(Event::new("remote_event", json!({"k": 1}), Context::new()));

        let received = rx.recv().await.unwrap();
        assert_eq!(received.event_type, "remote_event");
        assert_eq!(received.data["k"], 1);
    }

    #[tokio::test]
    async fn test_typed_receiver_decodes_state_changes() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe_typed::<StateChangedData>();

        let entity_id: EntityId = "switch.amp".parse().unwrap();
        let data = StateChangedData {
            entity_id: entity_id.clone(),
            old_state: None,
            new_state: Some(State::new(entity_id, "on", HashMap::new(), Context::new())),
        };
        bus.fire_typed(data, Context::new());

        let received = rx.recv().await.unwrap();
        assert_eq!(received.data.entity_id.to_string(), "switch.amp");
        assert!(received.data.old_state.is_none());
    }

    #[tokio::test]
    async fn test_event_types_are_isolated() {
        let bus = EventBus::new();
        let mut rx_a = bus.subscribe("a");
        let mut rx_b = bus.subscribe("b");

        bus.fire(Event::new("a", json!({}), Context::new()));

        assert!(rx_a.recv().await.is_ok());
        assert!(rx_b.try_recv().is_err());
    }

    #[test]
    fn test_fire_without_receivers_is_noop() {
        let bus = EventBus::new();
        bus.fire(Event::new("nobody", json!(null), Context::new()));
        assert_eq!(bus.receiver_count("nobody"), 0);
    }
}
