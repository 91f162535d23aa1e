//! Dependency index: the bidirectional map between entities and the
//! callers whose denormalized responses render them.
//!
//! The two directions are kept as consistent inverses — an entity is in
//! a caller's edge set exactly when the caller is listed under the
//! entity. Invalidation walks the denormalized direction.

use std::collections::{BTreeMap, BTreeSet};

use crate::walk::{CallerKey, EntityKey, EntityMap, entity_keys};

#[derive(Debug, Default)]
pub struct DependencyIndex {
    /// caller → entities its current response touches.
    normalized: BTreeMap<CallerKey, BTreeSet<EntityKey>>,
    /// entity → caller id → instances.
    denormalized: BTreeMap<EntityKey, BTreeMap<String, BTreeSet<Option<String>>>>,
}

impl DependencyIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Re-point a caller at the entity set of a fresh normalized
    /// response: new edges are added, obsolete edges removed, in both
    /// directions.
    pub fn add_deps(&mut self, entities: &EntityMap, caller: &CallerKey) {
        let next: BTreeSet<EntityKey> = entity_keys(entities).into_iter().collect();
        let previous = self.normalized.get(caller).cloned().unwrap_or_default();

        for gone in previous.difference(&next) {
            self.unlink(gone, caller);
        }
        for added in next.difference(&previous) {
            self.denormalized
                .entry(added.clone())
                .or_default()
                .entry(caller.id.clone())
                .or_default()
                .insert(caller.instance.clone());
        }

        if next.is_empty() {
            self.normalized.remove(caller);
        } else {
            self.normalized.insert(caller.clone(), next);
        }
    }

    /// Every caller depending on one of `changed`, except the origins
    /// of the change (their responses are replaced in the same pass).
    pub fn dependents(
        &self,
        changed: &EntityMap,
        origins: &[CallerKey],
    ) -> Vec<CallerKey> {
        let mut out = BTreeSet::new();
        for key in entity_keys(changed) {
            let Some(callers) = self.denormalized.get(&key) else {
                continue;
            };
            for (id, instances) in callers {
                for instance in instances {
                    let caller = CallerKey {
                        id: id.clone(),
                        instance: instance.clone(),
                    };
                    if !origins.contains(&caller) {
                        out.insert(caller);
                    }
                }
            }
        }
        out.into_iter().collect()
    }

    /// Drop every edge of a caller (unsubscribe).
    pub fn remove_caller(&mut self, caller: &CallerKey) {
        if let Some(edges) = self.normalized.remove(caller) {
            for key in &edges {
                self.unlink(key, caller);
            }
        }
    }

    pub fn entities_of(&self, caller: &CallerKey) -> Option<&BTreeSet<EntityKey>> {
        self.normalized.get(caller)
    }

    fn unlink(&mut self, key: &EntityKey, caller: &CallerKey) {
        let Some(callers) = self.denormalized.get_mut(key) else {
            return;
        };
        if let Some(instances) = callers.get_mut(&caller.id) {
            instances.remove(&caller.instance);
            if instances.is_empty() {
                callers.remove(&caller.id);
            }
        }
        if callers.is_empty() {
            self.denormalized.remove(key);
        }
    }

    /// The two maps are consistent inverses. Debug aid and test hook.
    #[cfg(test)]
    fn check_symmetry(&self) {
        for (caller, edges) in &self.normalized {
            for key in edges {
                let listed = self
                    .denormalized
                    .get(key)
                    .and_then(|callers| callers.get(&caller.id))
                    .is_some_and(|instances| instances.contains(&caller.instance));
                assert!(listed, "normalized edge {key} of {caller:?} missing inverse");
            }
        }
        for (key, callers) in &self.denormalized {
            for (id, instances) in callers {
                for instance in instances {
                    let caller = CallerKey {
                        id: id.clone(),
                        instance: instance.clone(),
                    };
                    let listed = self
                        .normalized
                        .get(&caller)
                        .is_some_and(|edges| edges.contains(key));
                    assert!(listed, "denormalized edge {key} of {caller:?} missing inverse");
                }
            }
        }
    }
}
