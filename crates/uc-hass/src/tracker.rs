//! Scoped state-change listeners
//!
//! A tracker attaches a callback to `state_changed` events for a fixed set
//! of entity IDs. The returned [`ListenerHandle`] is the only way to detach
//! it; dropping the handle detaches as well.

use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, warn};
use uc_core::events::StateChangedData;

use crate::StateStore;

static NEXT_LISTENER_ID: AtomicU64 = AtomicU64::new(1);

/// Unique identifier of an attached listener
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

impl ListenerId {
    pub fn next() -> Self {
        Self(NEXT_LISTENER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ListenerError {
    #[error("listener {0} was already cancelled")]
    AlreadyCancelled(ListenerId),

    #[error("listener {0} had already stopped")]
    Detached(ListenerId),

    #[error("listener {id} failed to cancel: {reason}")]
    Failed { id: ListenerId, reason: String },
}

type CancelFn = Box<dyn FnOnce() -> Result<(), ListenerError> + Send>;

/// Capability to detach one listener
pub struct ListenerHandle {
    id: ListenerId,
    cancel: Mutex<Option<CancelFn>>,
}

impl ListenerHandle {
    /// Wrap a cancel function; it runs at most once
    pub fn new(
        id: ListenerId,
        cancel: impl FnOnce() -> Result<(), ListenerError> + Send + 'static,
    ) -> Self {
        Self {
            id,
            cancel: Mutex::new(Some(Box::new(cancel))),
        }
    }

    pub fn id(&self) -> ListenerId {
        self.id
    }

    /// Detach the listener
    ///
    /// The first call runs the cancel function and returns its result;
    /// later calls return [`ListenerError::AlreadyCancelled`].
    pub fn cancel(&self) -> Result<(), ListenerError> {
        let cancel = self.cancel.lock().take();
        match cancel {
            Some(cancel) => cancel(),
            None => Err(ListenerError::AlreadyCancelled(self.id)),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.lock().is_none()
    }
}

impl fmt::Debug for ListenerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerHandle")
            .field("id", &self.id)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Callback invoked for each matching state change
pub type StateChangeCallback = Arc<dyn Fn(&StateChangedData) + Send + Sync>;

/// Something that can attach scoped state-change listeners
pub trait StateChangeTracker: Send + Sync {
    /// Call `action` for every state change of an entity in `entity_ids`
    fn track_state_change(
        &self,
        entity_ids: &BTreeSet<String>,
        action: StateChangeCallback,
    ) -> ListenerHandle;
}

impl StateChangeTracker for StateStore {
    fn track_state_change(
        &self,
        entity_ids: &BTreeSet<String>,
        action: StateChangeCallback,
    ) -> ListenerHandle {
        let id = ListenerId::next();
        let entity_ids = entity_ids.clone();
        // Subscribe before spawning so writes right after registration are seen
        let mut events = self.event_bus().subscribe_typed::<StateChangedData>();
        let (cancel_tx, mut cancel_rx) = oneshot::channel::<()>();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = &mut cancel_rx => {
                        debug!(listener = %id, "State change listener detached");
                        break;
                    }
                    result = events.recv() => match result {
                        Ok(event) => {
                            if entity_ids.contains(&event.data.entity_id.to_string()) {
                                action(&event.data);
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            warn!(listener = %id, missed, "State change listener lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        });

        ListenerHandle::new(id, move || {
            cancel_tx.send(()).map_err(|_| ListenerError::Detached(id))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::EventBus;
    use std::collections::HashMap;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use uc_core::{Context, EntityId};

    fn id(s: &str) -> EntityId {
        s.parse().unwrap()
    }

    fn tracked(ids: &[&str]) -> BTreeSet<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    fn recording_callback() -> (StateChangeCallback, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let callback: StateChangeCallback = Arc::new(move |data: &StateChangedData| {
            let _ = tx.send(data.entity_id.to_string());
        });
        (callback, rx)
    }

    #[tokio::test]
    async fn test_only_tracked_entities_reach_callback() {
        let store = StateStore::new(Arc::new(EventBus::new()));
        let (callback, mut rx) = recording_callback();
        let _handle = store.track_state_change(&tracked(&["light.x"]), callback);

        store.set(id("switch.y"), "on", HashMap::new(), Context::new());
        store.set(id("light.x"), "on", HashMap::new(), Context::new());

        let seen = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(seen, "light.x");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_cancel_stops_delivery_and_is_single_shot() {
        let store = StateStore::new(Arc::new(EventBus::new()));
        let (callback, mut rx) = recording_callback();
        let handle = store.track_state_change(&tracked(&["light.x"]), callback);

        tokio_test::assert_ok!(handle.cancel());
        assert!(handle.is_cancelled());
        assert!(matches!(
            handle.cancel(),
            Err(ListenerError::AlreadyCancelled(_))
        ));

        // Give the listener task a chance to observe the cancellation
        tokio::task::yield_now().await;
        store.set(id("light.x"), "off", HashMap::new(), Context::new());
        let outcome = tokio::time::timeout(Duration::from_millis(100), rx.recv()).await;
        assert!(!matches!(outcome, Ok(Some(_))));
    }

    #[test]
    fn test_handle_runs_custom_cancel_once() {
        let handle = ListenerHandle::new(ListenerId::next(), || {
            Err(ListenerError::Failed {
                id: ListenerId(0),
                reason: "boom".into(),
            })
        });
        assert!(matches!(handle.cancel(), Err(ListenerError::Failed { .. })));
        assert!(matches!(
            handle.cancel(),
            Err(ListenerError::AlreadyCancelled(_))
        ));
    }
}
