//! Entity state store
//!
//! Holds the latest state of each entity and announces every write on the
//! event bus so that trackers can forward it to remotes.

use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, instrument};
use uc_core::events::StateChangedData;
use uc_core::{Context, EntityId, State};

use crate::EventBus;

pub struct StateStore {
    /// Latest state keyed by entity_id string
    states: DashMap<String, State>,
    event_bus: Arc<EventBus>,
}

impl StateStore {
    pub fn new(event_bus: Arc<EventBus>) -> Self {
        Self {
            states: DashMap::new(),
            event_bus,
        }
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    /// Write the state of an entity and fire `state_changed`
    #[instrument(skip(self, state, attributes, context), fields(entity_id = %entity_id))]
    pub fn set(
        &self,
        entity_id: EntityId,
        state: impl Into<String>,
        attributes: HashMap<String, serde_json::Value>,
        context: Context,
    ) -> State {
        let key = entity_id.to_string();
        let old_state = self.states.get(&key).map(|s| s.clone());

        let new_state = match &old_state {
            Some(previous) => previous.successor(state, attributes, context.clone()),
            None => State::new(entity_id.clone(), state, attributes, context.clone()),
        };
        debug!(state = %new_state.state, created = old_state.is_none(), "Writing entity state");

        self.states.insert(key, new_state.clone());
        self.event_bus.fire_typed(
            StateChangedData {
                entity_id,
                old_state,
                new_state: Some(new_state.clone()),
            },
            context,
        );

        new_state
    }

    pub fn get(&self, entity_id: &str) -> Option<State> {
        self.states.get(entity_id).map(|s| s.clone())
    }

    /// Snapshot the states of the given IDs, skipping unknown entities
    pub fn get_many<'a, I>(&self, entity_ids: I) -> Vec<State>
    where
        I: IntoIterator<Item = &'a str>,
    {
        entity_ids
            .into_iter()
            .filter_map(|entity_id| self.get(entity_id))
            .collect()
    }

    pub fn all(&self) -> Vec<State> {
        self.states.iter().map(|r| r.value().clone()).collect()
    }

    pub fn all_entity_ids(&self) -> Vec<String> {
        self.states.iter().map(|r| r.key().clone()).collect()
    }

    pub fn domain_states(&self, domain: &str) -> Vec<State> {
        self.states
            .iter()
            .filter(|r| r.value().domain() == domain)
            .map(|r| r.value().clone())
            .collect()
    }

    /// Remove an entity and fire `state_changed` with no new state
    #[instrument(skip(self, context), fields(entity_id = %entity_id))]
    pub fn remove(&self, entity_id: &EntityId, context: Context) -> Option<State> {
        let (_, old_state) = self.states.remove(&entity_id.to_string())?;
        self.event_bus.fire_typed(
            StateChangedData {
                entity_id: entity_id.clone(),
                old_state: Some(old_state.clone()),
                new_state: None,
            },
            context,
        );
        Some(old_state)
    }

    pub fn entity_count(&self) -> usize {
        self.states.len()
    }
}

pub type SharedStateStore = Arc<StateStore>;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store() -> (Arc<EventBus>, StateStore) {
        let bus = Arc::new(EventBus::new());
        let store = StateStore::new(bus.clone());
        (bus, store)
    }

    fn id(s: &str) -> EntityId {
        s.parse().unwrap()
    }

    #[test]
    fn test_set_and_get() {
        let (_, store) = store();
        let attrs = HashMap::from([("volume_level".to_string(), json!(0.4))]);
        store.set(id("media_player.tv"), "playing", attrs.clone(), Context::new());

        let state = store.get("media_player.tv").unwrap();
        assert_eq!(state.state, "playing");
        assert_eq!(state.attributes, attrs);
        assert!(store.get("media_player.radio").is_none());
    }

    #[test]
    fn test_get_many_skips_unknown() {
        let (_, store) = store();
        store.set(id("light.a"), "on", HashMap::new(), Context::new());
        store.set(id("switch.b"), "off", HashMap::new(), Context::new());

        let states = store.get_many(["light.a", "light.missing", "switch.b"]);
        assert_eq!(states.len(), 2);
    }

    #[test]
    fn test_domain_states() {
        let (_, store) = store();
        store.set(id("light.a"), "on", HashMap::new(), Context::new());
        store.set(id("light.b"), "off", HashMap::new(), Context::new());
        store.set(id("switch.c"), "off", HashMap::new(), Context::new());

        assert_eq!(store.domain_states("light").len(), 2);
        assert_eq!(store.domain_states("cover").len(), 0);
        assert_eq!(store.entity_count(), 3);
    }

    #[tokio::test]
    async fn test_writes_fire_state_changed() {
        let (bus, store) = store();
        let mut rx = bus.subscribe_typed::<StateChangedData>();

        store.set(id("light.a"), "on", HashMap::new(), Context::new());
        store.set(id("light.a"), "off", HashMap::new(), Context::new());

        let first = rx.recv().await.unwrap();
        assert!(first.data.old_state.is_none());

        let second = rx.recv().await.unwrap();
        assert_eq!(second.data.old_state.unwrap().state, "on");
        assert_eq!(second.data.new_state.unwrap().state, "off");
    }

    #[tokio::test]
    async fn test_remove_fires_with_empty_new_state() {
        let (bus, store) = store();
        store.set(id("light.a"), "on", HashMap::new(), Context::new());
        let mut rx = bus.subscribe_typed::<StateChangedData>();

        assert!(store.remove(&id("light.a"), Context::new()).is_some());
        assert!(store.remove(&id("light.a"), Context::new()).is_none());

        let event = rx.recv().await.unwrap();
        assert!(event.data.new_state.is_none());
    }
}
