//! Event bus and state store for the remote bridge
//!
//! The bridge forwards entity state changes to remotes. This crate owns the
//! two pieces those changes flow through:
//!
//! - [`EventBus`] broadcasts events to any number of receivers
//! - [`StateStore`] keeps the current state of every entity and fires a
//!   `state_changed` event for each write
//!
//! On top of them, [`StateChangeTracker`] attaches a listener scoped to a
//! fixed set of entity IDs and hands back a [`ListenerHandle`] that detaches
//! it again.

mod bus;
mod store;
mod tracker;

pub use bus::{EventBus, SharedEventBus, TypedEventReceiver};
pub use store::{SharedStateStore, StateStore};
pub use tracker::{ListenerError, ListenerHandle, ListenerId, StateChangeCallback, StateChangeTracker};
