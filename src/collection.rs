//! Collection state and the cache that holds one collection per entity type.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{Map, Value};

use crate::entity::EntityKey;

/// The cached state of one entity type.
///
/// `ids` gives the iteration order and holds exactly the keys of
/// `entities`, each once. `original_values` records the pre-change value of
/// every entity touched by a tracked or optimistic change: `Some` for an
/// entity that existed, `None` for a key that was absent (so reverting it
/// removes the entity). `rekeyed` maps the old key of every entity that a
/// tracked update moved to a new key onto the key it lives under now, so
/// settling either key settles both.
///
/// Collections are shared as `Arc<EntityCollection>`. A reducer that makes
/// no change hands back the same `Arc`, so callers can detect "no change"
/// with [`Arc::ptr_eq`].
#[derive(Debug, Clone, PartialEq)]
pub struct EntityCollection {
    /// Name of the entity type this collection holds.
    pub entity_name: String,
    /// Entity keys in iteration order.
    pub ids: Vec<EntityKey>,
    /// Entities by key.
    pub entities: HashMap<EntityKey, Arc<Value>>,
    /// Client-side filter pattern.
    pub filter: String,
    /// Set once a full query has replaced the collection.
    pub loaded: bool,
    /// Set while a query is in flight.
    pub loading: bool,
    /// Pre-change snapshots of unsaved entities.
    pub original_values: HashMap<EntityKey, Option<Arc<Value>>>,
    /// Unsettled key changes, old key to current key.
    pub rekeyed: HashMap<EntityKey, EntityKey>,
    /// Application-defined extra state seeded from metadata.
    pub extra: Map<String, Value>,
}

impl EntityCollection {
    /// An empty collection for `entity_name`.
    pub fn new(entity_name: impl Into<String>) -> Self {
        Self {
            entity_name: entity_name.into(),
            ids: Vec::new(),
            entities: HashMap::new(),
            filter: String::new(),
            loaded: false,
            loading: false,
            original_values: HashMap::new(),
            rekeyed: HashMap::new(),
            extra: Map::new(),
        }
    }

    /// Seed the application-defined extra state.
    pub fn with_extra(mut self, extra: Map<String, Value>) -> Self {
        self.extra = extra;
        self
    }

    /// Number of cached entities.
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// `true` if the collection holds no entities.
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// The entity stored under `key`.
    pub fn get(&self, key: &EntityKey) -> Option<&Arc<Value>> {
        self.entities.get(key)
    }

    /// `true` if an entity is stored under `key`.
    pub fn contains(&self, key: &EntityKey) -> bool {
        self.entities.contains_key(key)
    }

    /// All entities in `ids` order.
    pub fn all(&self) -> Vec<Arc<Value>> {
        self.ids
            .iter()
            .filter_map(|id| self.entities.get(id).cloned())
            .collect()
    }

    /// `true` if any entity has an unsaved change.
    pub fn has_changes(&self) -> bool {
        !self.original_values.is_empty()
    }
}

/// The root cache: one collection per registered entity type.
///
/// Updated by value. Replacing a collection yields a new cache that shares
/// every untouched collection with the old one.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EntityCache {
    collections: HashMap<String, Arc<EntityCollection>>,
}

impl EntityCache {
    /// An empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// The collection for `entity_name`, if it has been created.
    pub fn collection(&self, entity_name: &str) -> Option<&Arc<EntityCollection>> {
        self.collections.get(entity_name)
    }

    /// Names of all collections currently in the cache.
    pub fn entity_names(&self) -> impl Iterator<Item = &str> {
        self.collections.keys().map(String::as_str)
    }

    /// Number of collections.
    pub fn len(&self) -> usize {
        self.collections.len()
    }

    /// `true` if no collection has been created yet.
    pub fn is_empty(&self) -> bool {
        self.collections.is_empty()
    }

    /// A copy of this cache with `collection` stored under its entity name.
    pub fn with_collection(&self, collection: Arc<EntityCollection>) -> Self {
        let mut collections = self.collections.clone();
        collections.insert(collection.entity_name.clone(), collection);
        Self { collections }
    }
}
