//! Host types for the Unfolded Circle bridge
//!
//! The bridge speaks Home Assistant's vocabulary: entities are addressed by
//! `domain.object_id`, carry a string state plus attributes, and every change
//! is announced as a `state_changed` event. This crate holds those types so
//! that the state store, the device side and the bridge agree on one shape.

mod context;
mod domains;
mod entity_id;
mod event;
mod state;

pub use context::Context;
pub use domains::{is_remote_control_domain, REMOTE_CONTROL_DOMAINS};
pub use entity_id::{EntityId, EntityIdError};
pub use event::{Event, EventData};
pub use state::State;

/// Integration domain used to namespace control-channel commands
pub const DOMAIN: &str = "unfoldedcircle";

/// Standard event types understood by the bridge
pub mod events {
    use super::*;

    /// Event type for state changes
    pub const STATE_CHANGED: &str = "state_changed";

    /// Data for STATE_CHANGED events
    ///
    /// `old_state` is `None` for a freshly created entity and `new_state` is
    /// `None` when the entity was removed.
    #[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
    pub struct StateChangedData {
        pub entity_id: EntityId,
        pub old_state: Option<State>,
        pub new_state: Option<State>,
    }

    impl EventData for StateChangedData {
        fn event_type() -> &'static str {
            STATE_CHANGED
        }
    }
}
