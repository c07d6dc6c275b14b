//! Entity state snapshots

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Context, EntityId};

/// The state of one entity at a point in time
///
/// This is also the snapshot format pushed to a remote, both for state
/// change notifications and for configuration pushes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct State {
    pub entity_id: EntityId,

    /// The state value (e.g. "on", "playing", "unavailable")
    pub state: String,

    #[serde(default)]
    pub attributes: HashMap<String, serde_json::Value>,

    /// When the state value last changed
    pub last_changed: DateTime<Utc>,

    /// When the state or its attributes were last written
    pub last_updated: DateTime<Utc>,

    pub context: Context,
}

impl State {
    pub fn new(
        entity_id: EntityId,
        state: impl Into<String>,
        attributes: HashMap<String, serde_json::Value>,
        context: Context,
    ) -> Self {
        let now = Utc::now();
        Self {
            entity_id,
            state: state.into(),
            attributes,
            last_changed: now,
            last_updated: now,
            context,
        }
    }

    /// Build the successor of this state, keeping `last_changed` when only
    /// the attributes moved
    pub fn successor(
        &self,
        state: impl Into<String>,
        attributes: HashMap<String, serde_json::Value>,
        context: Context,
    ) -> Self {
        let now = Utc::now();
        let state = state.into();
        let last_changed = if state == self.state {
            self.last_changed
        } else {
            now
        };

        Self {
            entity_id: self.entity_id.clone(),
            state,
            attributes,
            last_changed,
            last_updated: now,
            context,
        }
    }

    pub fn domain(&self) -> &str {
        self.entity_id.domain()
    }

    pub fn is_unavailable(&self) -> bool {
        self.state == "unavailable"
    }
}

impl PartialEq for State {
    fn eq(&self, other: &Self) -> bool {
        // Timestamps and context are bookkeeping, not part of the value
        self.entity_id == other.entity_id
            && self.state == other.state
            && self.attributes == other.attributes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn lamp() -> EntityId {
        "light.lamp".parse().unwrap()
    }

    #[test]
    fn test_successor_keeps_last_changed_for_attribute_updates() {
        let first = State::new(lamp(), "on", HashMap::new(), Context::new());
        let attrs = HashMap::from([("brightness".to_string(), json!(120))]);
        let second = first.successor("on", attrs, Context::new());

        assert_eq!(second.last_changed, first.last_changed);
        assert!(second.last_updated >= first.last_updated);
        assert_ne!(first, second);
    }

    #[test]
    fn test_successor_moves_last_changed_on_new_value() {
        let first = State::new(lamp(), "on", HashMap::new(), Context::new());
        let second = first.successor("off", HashMap::new(), Context::new());
        assert!(second.last_changed >= first.last_changed);
        assert_eq!(second.state, "off");
    }

    #[test]
    fn test_snapshot_json_shape() {
        let state = State::new(lamp(), "off", HashMap::new(), Context::new());
        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["entity_id"], "light.lamp");
        assert_eq!(json["state"], "off");
        assert!(json["attributes"].is_object());
        assert!(json["context"]["id"].is_string());
    }
}
