//! Subscription registry
//!
//! Remotes open two kinds of subscriptions over the control channel: one
//! for state changes of the entities they show, and one through which the
//! bridge pushes a new entity configuration. Both live in this registry,
//! in separate tables of the same generic [`Subscription`] type.
//!
//! Several entries may exist for one client, for example while a remote
//! re-subscribes during reconfiguration. Entity lookups therefore prefer the
//! entry that actually carries entities; configuration lookups take the
//! first match.

use std::collections::BTreeSet;
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, warn};
use uc_core::events::StateChangedData;
use uc_hass::{ListenerError, ListenerHandle, ListenerId, StateChangeCallback, StateChangeTracker};

use crate::BridgeError;

/// Marker for what a subscription table is used for
pub trait Purpose: Send + Sync + 'static {
    const NAME: &'static str;
}

/// State-change forwarding subscriptions
#[derive(Debug)]
pub enum EntityEvents {}

impl Purpose for EntityEvents {
    const NAME: &'static str = "entities";
}

/// Configuration push subscriptions
#[derive(Debug)]
pub enum Configuration {}

impl Purpose for Configuration {
    const NAME: &'static str = "configuration";
}

/// Registry-wide subscription identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubscriptionId(u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Pushes an event to the client that owns a subscription
pub trait Notify: Send + Sync {
    fn notify(&self, payload: Value) -> Result<(), BridgeError>;
}

impl<F> Notify for F
where
    F: Fn(Value) -> Result<(), BridgeError> + Send + Sync,
{
    fn notify(&self, payload: Value) -> Result<(), BridgeError> {
        self(payload)
    }
}

/// What a client announced when subscribing
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionRequest {
    pub client_id: String,
    pub driver_id: String,
    pub protocol_version: String,
    pub entity_ids: BTreeSet<String>,
}

impl SubscriptionRequest {
    pub fn new(client_id: impl Into<String>, driver_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            driver_id: driver_id.into(),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.protocol_version = version.into();
        self
    }

    #[must_use]
    pub fn with_entities<I, S>(mut self, entity_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.entity_ids = entity_ids.into_iter().map(Into::into).collect();
        self
    }
}

/// One client's subscription
///
/// Entries are never mutated after registration; a re-subscribe creates a
/// new entry.
pub struct Subscription<P: Purpose> {
    pub id: SubscriptionId,
    pub client_id: String,
    pub driver_id: String,
    pub protocol_version: String,
    pub entity_ids: BTreeSet<String>,
    notify: Arc<dyn Notify>,
    cancel: ListenerHandle,
    _purpose: PhantomData<fn() -> P>,
}

impl<P: Purpose> Subscription<P> {
    fn new(
        id: SubscriptionId,
        request: SubscriptionRequest,
        notify: Arc<dyn Notify>,
        cancel: ListenerHandle,
    ) -> Self {
        Self {
            id,
            client_id: request.client_id,
            driver_id: request.driver_id,
            protocol_version: request.protocol_version,
            entity_ids: request.entity_ids,
            notify,
            cancel,
            _purpose: PhantomData,
        }
    }

    /// Push an event to the owning client
    pub fn notify(&self, payload: Value) -> Result<(), BridgeError> {
        self.notify.notify(payload)
    }

    pub fn is_unidentified(&self) -> bool {
        self.client_id.is_empty()
    }

    fn cancel(&self) -> Result<(), ListenerError> {
        self.cancel.cancel()
    }
}

impl<P: Purpose> fmt::Debug for Subscription<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("purpose", &P::NAME)
            .field("id", &self.id)
            .field("client_id", &self.client_id)
            .field("driver_id", &self.driver_id)
            .field("protocol_version", &self.protocol_version)
            .field("entity_ids", &self.entity_ids)
            .finish()
    }
}

/// Host part of a client identifier
///
/// `"192.168.1.20:41234"` and `"192.168.1.20"` share the host
/// `"192.168.1.20"`; `"[fe80::1]:80"` has host `"fe80::1"`. A bare IPv6
/// literal is its own host.
pub fn client_host(client_id: &str) -> &str {
    let client_id = client_id.trim();
    if let Some(rest) = client_id.strip_prefix('[') {
        return rest.split(']').next().unwrap_or(rest);
    }
    match client_id.split_once(':') {
        Some((host, port)) if !port.contains(':') => host,
        _ => client_id,
    }
}

/// Whether two client identifiers name the same remote
pub fn same_client(a: &str, b: &str) -> bool {
    let (a, b) = (client_host(a), client_host(b));
    !a.is_empty() && a.eq_ignore_ascii_case(b)
}

type Table<P> = Mutex<Vec<Arc<Subscription<P>>>>;

/// Both subscription tables plus the tracker used to attach listeners
pub struct SubscriptionRegistry {
    tracker: Arc<dyn StateChangeTracker>,
    entities: Table<EntityEvents>,
    configurations: Table<Configuration>,
    next_id: AtomicU64,
}

impl SubscriptionRegistry {
    pub fn new(tracker: Arc<dyn StateChangeTracker>) -> Self {
        Self {
            tracker,
            entities: Mutex::new(Vec::new()),
            configurations: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    fn next_id(&self) -> SubscriptionId {
        SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Store an entity subscription and start forwarding its state changes
    ///
    /// Each change of a tracked entity is pushed as
    /// `{"data": {"entity_id", "new_state", "old_state"}}`. An existing
    /// subscription for the same client is kept.
    pub fn register_entities_subscription(
        &self,
        request: SubscriptionRequest,
        notify: Arc<dyn Notify>,
    ) -> SubscriptionId {
        let id = self.next_id();

        let forward = Arc::clone(&notify);
        let client_id = request.client_id.clone();
        let action: StateChangeCallback = Arc::new(move |change: &StateChangedData| {
            let payload = json!({
                "data": {
                    "entity_id": change.entity_id,
                    "new_state": change.new_state,
                    "old_state": change.old_state,
                }
            });
            if let Err(e) = forward.notify(payload) {
                warn!(
                    subscription = %id,
                    client_id = %client_id,
                    entity_id = %change.entity_id,
                    error = %e,
                    "Failed to forward state change"
                );
            }
        });
        let handle = self.tracker.track_state_change(&request.entity_ids, action);

        info!(
            subscription = %id,
            client_id = %request.client_id,
            driver_id = %request.driver_id,
            entities = request.entity_ids.len(),
            "Registered entity subscription"
        );
        let subscription = Arc::new(Subscription::new(id, request, notify, handle));
        self.entities.lock().push(subscription);
        id
    }

    /// The authoritative entity subscription of a client
    ///
    /// Among the client's entries, the first one with entities wins, then
    /// the first one at all. `None` and empty identifiers never match; use
    /// [`get_unidentified_subscription`](Self::get_unidentified_subscription)
    /// for clients that did not announce themselves.
    pub fn get_subscribed_entities(
        &self,
        client_id: Option<&str>,
    ) -> Option<Arc<Subscription<EntityEvents>>> {
        let client_id = client_id.filter(|c| !c.trim().is_empty())?;
        let table = self.entities.lock();
        prefer_non_empty(table.iter().filter(|s| same_client(&s.client_id, client_id)))
    }

    /// Authoritative entity subscription among unidentified clients
    pub fn get_unidentified_subscription(&self) -> Option<Arc<Subscription<EntityEvents>>> {
        let table = self.entities.lock();
        prefer_non_empty(table.iter().filter(|s| s.is_unidentified()))
    }

    pub fn register_configuration_subscription(
        &self,
        request: SubscriptionRequest,
        notify: Arc<dyn Notify>,
    ) -> SubscriptionId {
        let id = self.next_id();
        // No listener is attached to a configuration subscription
        let handle = ListenerHandle::new(ListenerId::next(), || Ok(()));

        info!(
            subscription = %id,
            client_id = %request.client_id,
            driver_id = %request.driver_id,
            "Registered configuration subscription"
        );
        let subscription = Arc::new(Subscription::new(id, request, notify, handle));
        self.configurations.lock().push(subscription);
        id
    }

    /// First configuration subscription of a client
    pub fn get_driver_subscription(
        &self,
        client_id: Option<&str>,
    ) -> Option<Arc<Subscription<Configuration>>> {
        let client_id = client_id.filter(|c| !c.trim().is_empty())?;
        self.configurations
            .lock()
            .iter()
            .find(|s| same_client(&s.client_id, client_id))
            .cloned()
    }

    pub fn get_unidentified_driver_subscription(
        &self,
    ) -> Option<Arc<Subscription<Configuration>>> {
        self.configurations
            .lock()
            .iter()
            .find(|s| s.is_unidentified())
            .cloned()
    }

    /// Remove a subscription from whichever table holds it and cancel it
    ///
    /// Returns whether an entry was removed; unknown or already removed ids
    /// are a no-op. Cancel failures are logged.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let removed = self.unsubscribe_entities(id) || self.unsubscribe_configuration(id);
        if !removed {
            debug!(subscription = %id, "Unsubscribe for unknown subscription");
        }
        removed
    }

    /// Remove and cancel an entity subscription; the configuration table is
    /// left alone
    pub fn unsubscribe_entities(&self, id: SubscriptionId) -> bool {
        take(&self.entities, id)
            .map(|subscription| finish(&*subscription))
            .is_some()
    }

    /// Remove and cancel a configuration subscription; the entity table is
    /// left alone
    pub fn unsubscribe_configuration(&self, id: SubscriptionId) -> bool {
        take(&self.configurations, id)
            .map(|subscription| finish(&*subscription))
            .is_some()
    }

    /// Drain both tables and cancel everything, best-effort
    ///
    /// Returns the number of subscriptions removed.
    pub fn close_all(&self) -> usize {
        let entities: Vec<_> = std::mem::take(&mut *self.entities.lock());
        let configurations: Vec<_> = std::mem::take(&mut *self.configurations.lock());
        let count = entities.len() + configurations.len();

        for subscription in &entities {
            finish(&**subscription);
        }
        for subscription in &configurations {
            finish(&**subscription);
        }
        info!(count, "Closed all subscriptions");
        count
    }

    pub fn entity_subscription_count(&self) -> usize {
        self.entities.lock().len()
    }

    pub fn configuration_subscription_count(&self) -> usize {
        self.configurations.lock().len()
    }
}

fn prefer_non_empty<'a, P, I>(matches: I) -> Option<Arc<Subscription<P>>>
where
    P: Purpose,
    I: Iterator<Item = &'a Arc<Subscription<P>>>,
{
    let mut fallback = None;
    for subscription in matches {
        if !subscription.entity_ids.is_empty() {
            return Some(Arc::clone(subscription));
        }
        fallback.get_or_insert_with(|| Arc::clone(subscription));
    }
    fallback
}

fn take<P: Purpose>(table: &Table<P>, id: SubscriptionId) -> Option<Arc<Subscription<P>>> {
    let mut table = table.lock();
    let index = table.iter().position(|s| s.id == id)?;
    Some(table.remove(index))
}

/// Cancel outside of the table lock
fn finish<P: Purpose>(subscription: &Subscription<P>) {
    match subscription.cancel() {
        Ok(()) => debug!(
            purpose = P::NAME,
            subscription = %subscription.id,
            client_id = %subscription.client_id,
            "Subscription cancelled"
        ),
        Err(e) => warn!(
            purpose = P::NAME,
            subscription = %subscription.id,
            client_id = %subscription.client_id,
            error = %e,
            "Subscription cancel failed"
        ),
    }
}
