//! Entity reconciliation
//!
//! The remote and the bridge each keep a view of which entities the remote
//! may see. [`compute_delta`] derives the change a user selection implies;
//! [`ClientEntityRegistry`] keeps the bridge's side of the grant.

use std::collections::BTreeSet;

use dashmap::DashMap;
use tracing::{debug, info};

use crate::registry::client_host;

/// Change between the current and the requested entity set
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntityDelta {
    /// Entities to grant that are not granted yet
    pub add: BTreeSet<String>,
    /// Entities to revoke
    pub remove: BTreeSet<String>,
    /// Entity set after the change
    pub final_set: BTreeSet<String>,
}

impl EntityDelta {
    pub fn is_empty(&self) -> bool {
        self.add.is_empty() && self.remove.is_empty()
    }
}

/// `final = (current - removes) ∪ adds`
///
/// An entity named in both `adds` and `removes` stays.
pub fn compute_delta(
    current: &BTreeSet<String>,
    adds: &BTreeSet<String>,
    removes: &BTreeSet<String>,
) -> EntityDelta {
    let final_set: BTreeSet<String> = current
        .difference(removes)
        .cloned()
        .chain(adds.iter().cloned())
        .collect();
    let add = final_set.difference(current).cloned().collect();
    let remove = current.difference(&final_set).cloned().collect();

    EntityDelta {
        add,
        remove,
        final_set,
    }
}

/// Entities granted to each client, keyed by client host
#[derive(Debug, Default)]
pub struct ClientEntityRegistry {
    grants: DashMap<String, BTreeSet<String>>,
}

impl ClientEntityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(client_id: &str) -> String {
        client_host(client_id).to_ascii_lowercase()
    }

    /// Grant `entity_ids` to a client in addition to what it already has
    ///
    /// Returns the entities that were not granted before. Never revokes.
    pub fn reconcile<'a, I>(&self, client_id: &str, entity_ids: I) -> BTreeSet<String>
    where
        I: IntoIterator<Item = &'a String>,
    {
        let mut grant = self.grants.entry(Self::key(client_id)).or_default();
        let added: BTreeSet<String> = entity_ids
            .into_iter()
            .filter(|id| grant.insert((*id).clone()))
            .cloned()
            .collect();
        if !added.is_empty() {
            debug!(client_id, added = added.len(), "Reconciled client entities");
        }
        added
    }

    /// Apply a selection result
    pub fn apply_delta(&self, client_id: &str, delta: &EntityDelta) {
        let mut grant = self.grants.entry(Self::key(client_id)).or_default();
        for entity_id in &delta.remove {
            grant.remove(entity_id);
        }
        grant.extend(delta.add.iter().cloned());
        info!(
            client_id,
            added = delta.add.len(),
            removed = delta.remove.len(),
            total = grant.len(),
            "Applied entity selection"
        );
    }

    pub fn granted(&self, client_id: &str) -> BTreeSet<String> {
        self.grants
            .get(&Self::key(client_id))
            .map(|grant| grant.clone())
            .unwrap_or_default()
    }

    pub fn client_count(&self) -> usize {
        self.grants.len()
    }
}
