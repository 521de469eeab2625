use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use crate::entity::{EntityId, EntityState};

/// Last-known state per entity, as seen on the delivery path.
///
/// Only the fan-out thread writes. Readers (the dispatcher resolving toggle
/// targets, callers asking for `cached_state`) take a short read lock.
#[derive(Debug, Default)]
pub struct StateCache {
    states: RwLock<HashMap<EntityId, EntityState>>,
}

impl StateCache {
    /// Creates an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Last-known state of one entity.
    #[must_use]
    pub fn get(&self, entity_id: &EntityId) -> Option<EntityState> {
        self.states
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(entity_id)
            .cloned()
    }

    /// Last-known states of several entities; unknown ids are skipped.
    pub fn snapshot<'a>(&self, ids: impl IntoIterator<Item = &'a EntityId>) -> Vec<(EntityId, EntityState)> {
        let states = self.states.read().unwrap_or_else(PoisonError::into_inner);
        ids.into_iter()
            .filter_map(|id| states.get(id).map(|s| (id.clone(), s.clone())))
            .collect()
    }

    pub(crate) fn put(&self, entity_id: &EntityId, state: &EntityState) {
        self.states
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(entity_id.clone(), state.clone());
    }

    /// Number of cached entities.
    #[must_use]
    pub fn len(&self) -> usize {
        self.states.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Returns true if nothing has been observed yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_get_snapshot() {
        let cache = StateCache::new();
        let a = EntityId::parse("light.a").unwrap();
        let b = EntityId::parse("light.b").unwrap();
        assert!(cache.is_empty());

        cache.put(&a, &EntityState::new("on"));
        assert_eq!(cache.get(&a).unwrap().state, "on");
        assert!(cache.get(&b).is_none());

        let snap = cache.snapshot([&a, &b]);
        assert_eq!(snap.len(), 1);
        assert_eq!(snap[0].0, a);
    }
}
