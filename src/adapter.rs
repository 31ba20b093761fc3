//! Mutation primitives over an [`EntityCollection`], with optional change
//! tracking.
//!
//! Every primitive works on a collection the caller already owns and
//! returns `true` if it changed anything. The reducer clones the shared
//! collection, applies a primitive, and keeps the original `Arc` when the
//! primitive reports no change.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use serde_json::Value;

use crate::collection::EntityCollection;
use crate::entity::{EntityKey, KeySelector, SortComparer, Update, merge_changes};

/// How a mutation records pre-change snapshots in `original_values`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tracking {
    /// Record nothing.
    Off,
    /// Record the value before the first unsaved change; later changes to
    /// the same key leave the snapshot alone.
    KeepFirst,
    /// Record the value immediately before this change, replacing any
    /// earlier snapshot.
    Replace,
}

/// Key extraction and ordering for one entity type.
#[derive(Clone)]
pub struct EntityAdapter {
    select_id: KeySelector,
    sort_comparer: Option<SortComparer>,
}

impl std::fmt::Debug for EntityAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityAdapter")
            .field("sorted", &self.sort_comparer.is_some())
            .finish_non_exhaustive()
    }
}

impl EntityAdapter {
    /// Create an adapter from a key selector and an optional comparer.
    pub fn new(select_id: KeySelector, sort_comparer: Option<SortComparer>) -> Self {
        Self {
            select_id,
            sort_comparer,
        }
    }

    /// Extract the key of `entity`.
    pub fn select_id(&self, entity: &Value) -> Option<EntityKey> {
        (self.select_id)(entity)
    }

    /// `true` if this adapter keeps `ids` sorted.
    pub fn is_sorted(&self) -> bool {
        self.sort_comparer.is_some()
    }

    /// Replace the whole collection contents. Clears snapshots; leaves the
    /// flags alone.
    pub fn set_all(&self, c: &mut EntityCollection, entities: &[Value]) -> bool {
        c.ids.clear();
        c.entities.clear();
        c.original_values.clear();
        c.rekeyed.clear();
        for entity in entities {
            let Some(key) = self.select_id(entity) else {
                continue;
            };
            if c.entities.insert(key.clone(), Arc::new(entity.clone())).is_none() {
                c.ids.push(key);
            }
        }
        self.sort(c);
        true
    }

    /// Add one entity unless its key is already present.
    pub fn add_one(&self, c: &mut EntityCollection, entity: &Value, track: Tracking) -> bool {
        self.add_many(c, std::slice::from_ref(entity), track)
    }

    /// Add entities whose keys are not yet present, in payload order.
    pub fn add_many(&self, c: &mut EntityCollection, entities: &[Value], track: Tracking) -> bool {
        let mut changed = false;
        for entity in entities {
            let Some(key) = self.select_id(entity) else {
                continue;
            };
            if c.entities.contains_key(&key) {
                continue;
            }
            snapshot(c, &key, track);
            c.entities.insert(key.clone(), Arc::new(entity.clone()));
            c.ids.push(key);
            changed = true;
        }
        if changed {
            self.sort(c);
        }
        changed
    }

    /// Remove every entity. Clears snapshots.
    pub fn remove_all(&self, c: &mut EntityCollection) -> bool {
        let changed = !c.ids.is_empty() || !c.original_values.is_empty();
        c.ids.clear();
        c.entities.clear();
        c.original_values.clear();
        c.rekeyed.clear();
        changed
    }

    /// Remove one entity if present.
    pub fn remove_one(&self, c: &mut EntityCollection, key: &EntityKey, track: Tracking) -> bool {
        self.remove_many(c, std::slice::from_ref(key), track)
    }

    /// Remove the entities under `keys`; absent keys are ignored.
    pub fn remove_many(&self, c: &mut EntityCollection, keys: &[EntityKey], track: Tracking) -> bool {
        let mut removed = HashSet::new();
        for key in keys {
            if !c.entities.contains_key(key) {
                continue;
            }
            snapshot(c, key, track);
            c.entities.remove(key);
            removed.insert(key.clone());
        }
        if removed.is_empty() {
            return false;
        }
        c.ids.retain(|id| !removed.contains(id));
        true
    }

    /// Apply one update if its key is present.
    pub fn update_one(&self, c: &mut EntityCollection, update: &Update, track: Tracking) -> bool {
        self.update_many(c, std::slice::from_ref(update), track)
    }

    /// Shallow-merge each update into the entity it names.
    ///
    /// Updates for absent keys are ignored. When the merged entity's key
    /// differs from `update.id`, the entity moves to the new key: in place
    /// within `ids` when unsorted, and if another entity already holds the
    /// new key the moved entity replaces it and the old slot is dropped.
    /// A tracked move is recorded in `rekeyed`.
    pub fn update_many(&self, c: &mut EntityCollection, updates: &[Update], track: Tracking) -> bool {
        let mut changed = false;
        for update in updates {
            let Some(existing) = c.entities.get(&update.id) else {
                continue;
            };
            let merged = merge_changes(existing, &update.changes);
            if merged == **existing {
                continue;
            }
            let new_key = self.select_id(&merged).unwrap_or_else(|| update.id.clone());
            snapshot(c, &update.id, track);
            if new_key == update.id {
                c.entities.insert(new_key, Arc::new(merged));
            } else {
                snapshot(c, &new_key, track);
                if track != Tracking::Off {
                    record_rekey(c, &update.id, &new_key);
                }
                c.entities.remove(&update.id);
                let collides = c
                    .entities
                    .insert(new_key.clone(), Arc::new(merged))
                    .is_some();
                if collides {
                    c.ids.retain(|id| id != &update.id);
                } else if let Some(slot) = c.ids.iter_mut().find(|id| **id == update.id) {
                    *slot = new_key;
                }
            }
            changed = true;
        }
        if changed {
            self.sort(c);
        }
        changed
    }

    /// Insert or merge one entity.
    pub fn upsert_one(&self, c: &mut EntityCollection, entity: &Value, track: Tracking) -> bool {
        self.upsert_many(c, std::slice::from_ref(entity), track)
    }

    /// Merge entities whose keys exist; append the rest in payload order.
    pub fn upsert_many(&self, c: &mut EntityCollection, entities: &[Value], track: Tracking) -> bool {
        let mut changed = false;
        for entity in entities {
            let Some(key) = self.select_id(entity) else {
                continue;
            };
            match c.entities.get(&key) {
                Some(existing) => {
                    let merged = merge_changes(existing, entity);
                    if merged == **existing {
                        continue;
                    }
                    snapshot(c, &key, track);
                    c.entities.insert(key, Arc::new(merged));
                }
                None => {
                    snapshot(c, &key, track);
                    c.entities.insert(key.clone(), Arc::new(entity.clone()));
                    c.ids.push(key);
                }
            }
            changed = true;
        }
        if changed {
            self.sort(c);
        }
        changed
    }

    /// Drop the snapshots for `keys`, accepting the current values.
    ///
    /// Settling either end of a recorded key change settles the other end
    /// too.
    pub fn commit_many(&self, c: &mut EntityCollection, keys: &[EntityKey]) -> bool {
        let mut changed = false;
        for key in keys {
            let current = c.rekeyed.get(key).cloned().unwrap_or_else(|| key.clone());
            let moved: Vec<EntityKey> = c
                .rekeyed
                .iter()
                .filter(|(_, to)| **to == current)
                .map(|(from, _)| from.clone())
                .collect();
            for from in &moved {
                c.rekeyed.remove(from);
                c.original_values.remove(from);
            }
            if !moved.is_empty() {
                c.original_values.remove(&current);
                changed = true;
            }
            changed |= c.original_values.remove(key).is_some();
        }
        changed
    }

    /// Drop every snapshot.
    pub fn commit_all(&self, c: &mut EntityCollection) -> bool {
        if c.original_values.is_empty() && c.rekeyed.is_empty() {
            return false;
        }
        c.original_values.clear();
        c.rekeyed.clear();
        true
    }

    /// Restore the snapshots for `keys` and drop them.
    ///
    /// A `Some` snapshot puts the old value back under its key; a `None`
    /// snapshot removes the key. A restored key that is no longer in `ids`
    /// takes the slot of a removed key when one is free (this puts a
    /// re-keyed entity back where it was), otherwise it is appended.
    pub fn undo_many(&self, c: &mut EntityCollection, keys: &[EntityKey]) -> bool {
        let mut restores = Vec::new();
        let mut removals = Vec::new();
        for key in keys {
            match c.original_values.remove(key) {
                Some(Some(value)) => restores.push((key.clone(), value)),
                Some(None) => removals.push(key.clone()),
                None => {}
            }
        }
        if restores.is_empty() && removals.is_empty() {
            return false;
        }
        c.rekeyed.retain(|from, to| !keys.contains(from) && !keys.contains(to));

        let mut free: VecDeque<usize> = removals
            .iter()
            .filter(|key| c.entities.remove(*key).is_some())
            .filter_map(|key| c.ids.iter().position(|id| id == key))
            .collect();
        for (key, value) in restores {
            if c.entities.insert(key.clone(), value).is_none() {
                match free.pop_front() {
                    Some(slot) => c.ids[slot] = key,
                    None => c.ids.push(key),
                }
            }
        }
        let entities = &c.entities;
        c.ids.retain(|id| entities.contains_key(id));
        self.sort(c);
        true
    }

    /// Restore every snapshot.
    pub fn undo_all(&self, c: &mut EntityCollection) -> bool {
        let keys: Vec<EntityKey> = c.original_values.keys().cloned().collect();
        self.undo_many(c, &keys)
    }

    fn sort(&self, c: &mut EntityCollection) {
        let Some(cmp) = &self.sort_comparer else {
            return;
        };
        let entities = &c.entities;
        c.ids.sort_by(|a, b| match (entities.get(a), entities.get(b)) {
            (Some(x), Some(y)) => cmp(x, y),
            _ => std::cmp::Ordering::Equal,
        });
    }
}

// Old keys already moved onto `from` follow it to `to`.
fn record_rekey(c: &mut EntityCollection, from: &EntityKey, to: &EntityKey) {
    for current in c.rekeyed.values_mut() {
        if current == from {
            *current = to.clone();
        }
    }
    c.rekeyed.insert(from.clone(), to.clone());
}

fn snapshot(c: &mut EntityCollection, key: &EntityKey, track: Tracking) {
    let current = c.entities.get(key).cloned();
    match track {
        Tracking::Off => {}
        Tracking::KeepFirst => {
            c.original_values.entry(key.clone()).or_insert(current);
        }
        Tracking::Replace => {
            c.original_values.insert(key.clone(), current);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{default_select_id, sort_by_field};
    use serde_json::json;

    fn unsorted() -> EntityAdapter {
        EntityAdapter::new(default_select_id(), None)
    }

    fn heroes(adapter: &EntityAdapter) -> EntityCollection {
        let mut c = EntityCollection::new("Hero");
        adapter.set_all(
            &mut c,
            &[
                json!({"id": 2, "name": "B", "power": "Fast"}),
                json!({"id": 1, "name": "A", "power": "Strong"}),
            ],
        );
        c
    }

    fn ids(c: &EntityCollection) -> Vec<EntityKey> {
        c.ids.clone()
    }

    fn keys(ns: &[i64]) -> Vec<EntityKey> {
        ns.iter().copied().map(EntityKey::Int).collect()
    }

    #[test]
    fn add_ignores_existing_keys_and_appends_in_order() {
        let a = unsorted();
        let mut c = heroes(&a);
        assert!(!a.add_one(&mut c, &json!({"id": 1, "name": "dup"}), Tracking::Off));
        assert_eq!(c.get(&1.into()).unwrap()["name"], "A");

        assert!(a.add_many(
            &mut c,
            &[json!({"id": 5}), json!({"id": 3})],
            Tracking::Off
        ));
        assert_eq!(ids(&c), keys(&[2, 1, 5, 3]));
    }

    #[test]
    fn sorted_adapter_reorders_after_add() {
        let a = EntityAdapter::new(default_select_id(), Some(sort_by_field("name")));
        let mut c = heroes(&a);
        assert_eq!(ids(&c), keys(&[1, 2]));
        a.add_one(&mut c, &json!({"id": 9, "name": "AA"}), Tracking::Off);
        assert_eq!(ids(&c), keys(&[1, 9, 2]));
    }

    #[test]
    fn update_with_key_change_keeps_position() {
        let a = unsorted();
        let mut c = heroes(&a);
        let update = Update::new(2, json!({"id": 42, "name": "Super"}));
        assert!(a.update_one(&mut c, &update, Tracking::Off));
        assert_eq!(ids(&c), keys(&[42, 1]));
        assert!(!c.contains(&2.into()));
        assert_eq!(
            **c.get(&42.into()).unwrap(),
            json!({"id": 42, "name": "Super", "power": "Fast"})
        );
    }

    #[test]
    fn update_into_existing_key_replaces_target() {
        let a = unsorted();
        let mut c = heroes(&a);
        a.update_one(&mut c, &Update::new(2, json!({"id": 1})), Tracking::Off);
        assert_eq!(ids(&c), keys(&[1]));
        assert_eq!(c.get(&1.into()).unwrap()["name"], "B");
    }

    #[test]
    fn update_of_missing_key_or_no_op_reports_no_change() {
        let a = unsorted();
        let mut c = heroes(&a);
        assert!(!a.update_one(&mut c, &Update::new(99, json!({"name": "x"})), Tracking::Off));
        assert!(!a.update_one(&mut c, &Update::new(1, json!({"name": "A"})), Tracking::Off));
    }

    #[test]
    fn upsert_merges_existing_and_appends_new() {
        let a = unsorted();
        let mut c = heroes(&a);
        assert!(a.upsert_many(
            &mut c,
            &[json!({"id": 1, "name": "A2"}), json!({"id": 13, "name": "N"})],
            Tracking::Off
        ));
        assert_eq!(ids(&c), keys(&[2, 1, 13]));
        assert_eq!(
            **c.get(&1.into()).unwrap(),
            json!({"id": 1, "name": "A2", "power": "Strong"})
        );
    }

    #[test]
    fn remove_ignores_missing_keys() {
        let a = unsorted();
        let mut c = heroes(&a);
        assert!(!a.remove_one(&mut c, &7.into(), Tracking::Off));
        assert!(a.remove_many(&mut c, &[7.into(), 2.into()], Tracking::Off));
        assert_eq!(ids(&c), keys(&[1]));
    }

    #[test]
    fn keep_first_tracking_preserves_the_earliest_snapshot() {
        let a = unsorted();
        let mut c = heroes(&a);
        let original = c.get(&1.into()).cloned();
        a.update_one(&mut c, &Update::new(1, json!({"name": "X"})), Tracking::KeepFirst);
        a.update_one(&mut c, &Update::new(1, json!({"name": "Y"})), Tracking::KeepFirst);
        assert_eq!(c.original_values.get(&1.into()), Some(&original));

        a.update_one(&mut c, &Update::new(1, json!({"name": "Z"})), Tracking::Replace);
        assert_eq!(
            c.original_values.get(&1.into()).cloned().flatten().map(|e| e["name"].clone()),
            Some(json!("Y"))
        );
    }

    #[test]
    fn undo_restores_removed_and_drops_added() {
        let a = unsorted();
        let mut c = heroes(&a);
        a.remove_one(&mut c, &2.into(), Tracking::KeepFirst);
        a.add_one(&mut c, &json!({"id": 7}), Tracking::KeepFirst);
        assert!(a.undo_all(&mut c));
        assert!(c.contains(&2.into()));
        assert!(!c.contains(&7.into()));
        assert_eq!(c.len(), 2);
        assert!(c.original_values.is_empty());
    }

    #[test]
    fn undo_of_key_change_puts_entity_back_in_its_slot() {
        let a = unsorted();
        let mut c = heroes(&a);
        let before = c.clone();
        a.update_one(&mut c, &Update::new(2, json!({"id": 42})), Tracking::Replace);
        assert!(a.undo_many(&mut c, &[2.into(), 42.into()]));
        assert_eq!(c, before);
    }

    #[test]
    fn chained_key_changes_settle_together() {
        let a = unsorted();
        let mut c = heroes(&a);
        a.update_one(&mut c, &Update::new(2, json!({"id": 20})), Tracking::KeepFirst);
        a.update_one(&mut c, &Update::new(20, json!({"id": 200})), Tracking::KeepFirst);
        assert_eq!(c.rekeyed.get(&EntityKey::Int(2)), Some(&EntityKey::Int(200)));
        assert_eq!(c.original_values.len(), 3);

        assert!(a.commit_many(&mut c, &[EntityKey::Int(2)]));
        assert!(c.original_values.is_empty());
        assert!(c.rekeyed.is_empty());
        assert_eq!(c.ids, vec![EntityKey::Int(200), EntityKey::Int(1)]);
    }

    #[test]
    fn untracked_key_change_is_not_recorded() {
        let a = unsorted();
        let mut c = heroes(&a);
        a.update_one(&mut c, &Update::new(2, json!({"id": 20})), Tracking::Off);
        assert!(c.rekeyed.is_empty());
    }

    #[test]
    fn commit_drops_snapshots_only() {
        let a = unsorted();
        let mut c = heroes(&a);
        a.remove_one(&mut c, &2.into(), Tracking::KeepFirst);
        assert!(a.commit_many(&mut c, &[2.into()]));
        assert!(!a.commit_all(&mut c));
        assert!(!c.contains(&2.into()));
    }

    #[test]
    fn remove_all_reports_change_only_when_non_empty() {
        let a = unsorted();
        let mut c = EntityCollection::new("Hero");
        assert!(!a.remove_all(&mut c));
        let mut c = heroes(&a);
        assert!(a.remove_all(&mut c));
        assert!(c.is_empty());
    }
}
