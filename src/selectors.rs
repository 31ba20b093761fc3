//! Synchronous, pure derivations over an entity collection.
//!
//! The free functions work on any [`EntityCollection`]; [`EntitySelectors`]
//! binds them to one entity type in a store and reads the current state on
//! every call.

use std::collections::HashMap;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::collection::EntityCollection;
use crate::entity::{EntityKey, FilterFn};
use crate::error::EntityCacheError;
use crate::metadata::EntityDefinition;
use crate::store::{EntityStore, collection_or_initial};

/// Kind of unsaved change recorded for a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeType {
    /// The key did not exist before the change.
    Added,
    /// The entity was removed.
    Deleted,
    /// The entity exists and was modified.
    Updated,
}

/// One unsaved change, derived from the collection's snapshots.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeState {
    /// What kind of change is pending.
    pub change_type: ChangeType,
    /// The value before the change; `None` for additions.
    pub original_value: Option<Arc<Value>>,
}

/// Entities in `ids` order.
pub fn select_entities(c: &EntityCollection) -> Vec<Arc<Value>> {
    c.all()
}

/// Entities that pass `filter_fn` for the collection's filter pattern.
pub fn select_filtered_entities(c: &EntityCollection, filter_fn: &FilterFn) -> Vec<Arc<Value>> {
    filter_fn(&c.all(), &c.filter)
}

/// Number of cached entities.
pub fn select_count(c: &EntityCollection) -> usize {
    c.len()
}

/// Keys in `ids` order.
pub fn select_keys(c: &EntityCollection) -> Vec<EntityKey> {
    c.ids.clone()
}

/// Entities by key.
pub fn select_entity_map(c: &EntityCollection) -> HashMap<EntityKey, Arc<Value>> {
    c.entities.clone()
}

/// The filter pattern.
pub fn select_filter(c: &EntityCollection) -> &str {
    &c.filter
}

/// `true` while a query is in flight.
pub fn select_loading(c: &EntityCollection) -> bool {
    c.loading
}

/// `true` once a full query has loaded the collection.
pub fn select_loaded(c: &EntityCollection) -> bool {
    c.loaded
}

/// The pending change for every key with a snapshot.
///
/// A `None` snapshot is an addition; a `Some` snapshot is an update if the
/// key is still cached and a deletion otherwise.
pub fn select_change_state(c: &EntityCollection) -> HashMap<EntityKey, ChangeState> {
    c.original_values
        .iter()
        .map(|(key, original)| {
            let change_type = match (original, c.contains(key)) {
                (None, _) => ChangeType::Added,
                (Some(_), true) => ChangeType::Updated,
                (Some(_), false) => ChangeType::Deleted,
            };
            let state = ChangeState {
                change_type,
                original_value: original.clone(),
            };
            (key.clone(), state)
        })
        .collect()
}

/// Entities deserialized into `T`, in `ids` order.
///
/// # Errors
///
/// Returns [`EntityCacheError::Serialization`] for the first entity that
/// does not deserialize.
pub fn select_entities_as<T: DeserializeOwned>(
    c: &EntityCollection,
) -> Result<Vec<T>, EntityCacheError> {
    c.all()
        .iter()
        .map(|e| T::deserialize(e.as_ref()).map_err(EntityCacheError::from))
        .collect()
}

/// Selectors bound to one entity type in a store.
///
/// Each call reads the store's current state; before the type has been
/// touched it reads the type's initial collection.
#[derive(Clone)]
pub struct EntitySelectors {
    store: EntityStore,
    definition: Arc<EntityDefinition>,
}

impl std::fmt::Debug for EntitySelectors {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntitySelectors")
            .field("entity_name", &self.definition.entity_name())
            .finish()
    }
}

impl EntitySelectors {
    pub(crate) fn new(store: EntityStore, definition: Arc<EntityDefinition>) -> Self {
        Self { store, definition }
    }

    /// The current collection.
    pub fn collection(&self) -> Arc<EntityCollection> {
        collection_or_initial(&self.store.state(), &self.definition)
    }

    pub fn entities(&self) -> Vec<Arc<Value>> {
        select_entities(&self.collection())
    }

    /// Entities passing the type's filter function.
    pub fn filtered_entities(&self) -> Vec<Arc<Value>> {
        select_filtered_entities(&self.collection(), &self.definition.filter_fn)
    }

    pub fn count(&self) -> usize {
        select_count(&self.collection())
    }

    pub fn keys(&self) -> Vec<EntityKey> {
        select_keys(&self.collection())
    }

    pub fn entity_map(&self) -> HashMap<EntityKey, Arc<Value>> {
        select_entity_map(&self.collection())
    }

    pub fn filter(&self) -> String {
        select_filter(&self.collection()).to_owned()
    }

    pub fn loading(&self) -> bool {
        select_loading(&self.collection())
    }

    pub fn loaded(&self) -> bool {
        select_loaded(&self.collection())
    }

    pub fn change_state(&self) -> HashMap<EntityKey, ChangeState> {
        select_change_state(&self.collection())
    }

    /// The entity under `key`.
    pub fn entity_by_key(&self, key: &EntityKey) -> Option<Arc<Value>> {
        self.collection().get(key).cloned()
    }

    /// Entities deserialized into `T`.
    ///
    /// # Errors
    ///
    /// Returns [`EntityCacheError::Serialization`] if an entity does not fit
    /// `T`.
    pub fn entities_as<T: DeserializeOwned>(&self) -> Result<Vec<T>, EntityCacheError> {
        select_entities_as(&self.collection())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::Tracking;
    use crate::metadata::EntityMetadata;
    use crate::store::EntityStoreBuilder;
    use crate::test_fixtures::{hero_metadata, initial_heroes};
    use serde::Deserialize;
    use serde_json::json;

    fn loaded_collection() -> EntityCollection {
        let definition = EntityDefinition::from_metadata(hero_metadata()).unwrap();
        let mut c = EntityCollection::new("Hero");
        definition.adapter.set_all(&mut c, &initial_heroes());
        c
    }

    #[test]
    fn filtered_entities_use_pattern_case_insensitively() {
        let mut c = loaded_collection();
        let filter = crate::entity::default_filter();
        assert_eq!(select_filtered_entities(&c, &filter).len(), 2);

        c.filter = "FAST".into();
        let filtered = select_filtered_entities(&c, &filter);
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0]["name"], "B");
    }

    #[test]
    fn change_state_classifies_snapshots() {
        let definition = EntityDefinition::from_metadata(hero_metadata()).unwrap();
        let a = &definition.adapter;
        let mut c = loaded_collection();
        a.add_one(&mut c, &json!({"id": 3, "name": "C"}), Tracking::KeepFirst);
        a.remove_one(&mut c, &EntityKey::Int(2), Tracking::KeepFirst);
        a.update_one(
            &mut c,
            &crate::entity::Update::new(1, json!({"name": "A2"})),
            Tracking::KeepFirst,
        );

        let changes = select_change_state(&c);
        assert_eq!(changes.len(), 3);
        assert_eq!(changes[&EntityKey::Int(3)].change_type, ChangeType::Added);
        assert_eq!(changes[&EntityKey::Int(2)].change_type, ChangeType::Deleted);
        let updated = &changes[&EntityKey::Int(1)];
        assert_eq!(updated.change_type, ChangeType::Updated);
        assert_eq!(
            updated.original_value.as_deref(),
            Some(&json!({"id": 1, "name": "A", "power": "invisible"}))
        );
    }

    #[test]
    fn typed_entities() {
        #[derive(Debug, Deserialize, PartialEq)]
        struct Hero {
            id: i64,
            name: String,
        }

        let heroes: Vec<Hero> = select_entities_as(&loaded_collection()).unwrap();
        assert_eq!(
            heroes,
            vec![
                Hero { id: 2, name: "B".into() },
                Hero { id: 1, name: "A".into() },
            ]
        );

        #[derive(Debug, Deserialize)]
        #[allow(dead_code)]
        struct Strict {
            missing: String,
        }
        assert!(matches!(
            select_entities_as::<Strict>(&loaded_collection()),
            Err(EntityCacheError::Serialization(_))
        ));
    }

    #[test]
    fn bound_selectors_read_current_state_and_initial_state() {
        let mut extra = serde_json::Map::new();
        extra.insert("page".into(), json!(1));
        let store = EntityStoreBuilder::new()
            .entity(EntityMetadata::new("Hero").with_additional_collection_state(extra))
            .build()
            .unwrap();
        let selectors = store.selectors("Hero").unwrap();
        assert_eq!(selectors.count(), 0);
        assert!(!selectors.loaded());
        assert_eq!(selectors.collection().extra["page"], 1);

        let heroes = store.dispatcher("Hero").unwrap();
        heroes.add_all_to_cache(&initial_heroes()).unwrap();
        heroes.set_loading(true).unwrap();
        assert_eq!(selectors.keys(), vec![EntityKey::Int(2), EntityKey::Int(1)]);
        assert!(selectors.loading());
        assert_eq!(
            selectors.entity_by_key(&EntityKey::Int(1)).unwrap()["name"],
            "A"
        );
        assert_eq!(selectors.entity_map().len(), 2);
        assert_eq!(selectors.collection().extra["page"], 1);
    }
}
