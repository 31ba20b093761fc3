//! Reducer registry and the cache-level reducer that routes each action to
//! its entity type's collection reducer.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

use crate::action::EntityAction;
use crate::collection::{EntityCache, EntityCollection};
use crate::error::EntityCacheError;
use crate::metadata::EntityDefinitionService;
use crate::reducer::{CollectionReducer, DefaultCollectionReducer};

/// Type-erased reducer map keyed by entity name.
type ReducerMap = HashMap<String, Arc<dyn CollectionReducer>>;

/// Looks up, or lazily builds, the collection reducer for each entity type.
///
/// Default reducers are built on first use from the type's definition and
/// cached. Custom reducers registered with
/// [`register_reducer`](EntityCollectionReducerRegistry::register_reducer)
/// replace the default for their type.
pub struct EntityCollectionReducerRegistry {
    definitions: EntityDefinitionService,
    custom: RwLock<ReducerMap>,
    built: RwLock<ReducerMap>,
}

impl fmt::Debug for EntityCollectionReducerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let custom: Vec<String> = self
            .custom
            .read()
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default();
        f.debug_struct("EntityCollectionReducerRegistry")
            .field("definitions", &self.definitions)
            .field("custom", &custom)
            .finish_non_exhaustive()
    }
}

impl EntityCollectionReducerRegistry {
    /// A registry that builds default reducers from `definitions`.
    pub fn new(definitions: EntityDefinitionService) -> Self {
        Self {
            definitions,
            custom: RwLock::new(HashMap::new()),
            built: RwLock::new(HashMap::new()),
        }
    }

    /// Replace the reducer for `entity_name` with a custom one.
    pub fn register_reducer(&self, entity_name: impl Into<String>, reducer: Arc<dyn CollectionReducer>) {
        let entity_name = entity_name.into();
        tracing::debug!(entity_name = %entity_name, "registered custom collection reducer");
        if let Ok(mut custom) = self.custom.write() {
            custom.insert(entity_name, reducer);
        }
    }

    /// Drop the cached default reducer for `entity_name` so the next action
    /// rebuilds it from the current definition.
    pub fn invalidate(&self, entity_name: &str) {
        if let Ok(mut built) = self.built.write() {
            built.remove(entity_name);
        }
    }

    /// The reducer for `entity_name`, building the default one if needed.
    ///
    /// # Errors
    ///
    /// Returns [`EntityCacheError::NoDefinition`] if the type has neither a
    /// custom reducer nor registered metadata.
    pub fn get_or_create_reducer(
        &self,
        entity_name: &str,
    ) -> Result<Arc<dyn CollectionReducer>, EntityCacheError> {
        if let Some(reducer) = lookup(&self.custom, entity_name) {
            return Ok(reducer);
        }
        if let Some(reducer) = lookup(&self.built, entity_name) {
            return Ok(reducer);
        }
        let definition = self.definitions.definition(entity_name)?;
        let reducer: Arc<dyn CollectionReducer> =
            Arc::new(DefaultCollectionReducer::new(&definition));
        if let Ok(mut built) = self.built.write() {
            built.insert(entity_name.to_owned(), reducer.clone());
        }
        Ok(reducer)
    }

    /// Apply `action` to the whole cache.
    ///
    /// Actions without an entity name leave the cache untouched. Otherwise
    /// the target collection is fetched (or created from the type's initial
    /// state), reduced, and spliced back. If the collection comes back as
    /// the same `Arc`, the same cache `Arc` is returned.
    ///
    /// # Arguments
    ///
    /// * `cache` - The current cache.
    /// * `action` - The action to apply.
    ///
    /// # Returns
    ///
    /// The next cache, or `cache` itself if nothing changed.
    ///
    /// # Errors
    ///
    /// Returns [`EntityCacheError::NoDefinition`] for an unregistered entity
    /// type, or whatever a custom reducer reports.
    pub fn reduce(
        &self,
        cache: &Arc<EntityCache>,
        action: &EntityAction,
    ) -> Result<Arc<EntityCache>, EntityCacheError> {
        let entity_name = action.entity_name.as_str();
        if entity_name.trim().is_empty() {
            return Ok(cache.clone());
        }
        let reducer = self.get_or_create_reducer(entity_name)?;

        let existing = cache.collection(entity_name).cloned();
        let current = match &existing {
            Some(collection) => collection.clone(),
            None => self.initial_collection(entity_name),
        };
        let next = reducer.reduce(&current, action)?;

        let unchanged = existing
            .as_ref()
            .is_some_and(|collection| Arc::ptr_eq(collection, &next));
        if unchanged {
            return Ok(cache.clone());
        }
        Ok(Arc::new(cache.with_collection(next)))
    }

    fn initial_collection(&self, entity_name: &str) -> Arc<EntityCollection> {
        self.definitions
            .definition(entity_name)
            .map(|definition| definition.initial_state.clone())
            .unwrap_or_else(|_| Arc::new(EntityCollection::new(entity_name)))
    }
}

fn lookup(map: &RwLock<ReducerMap>, entity_name: &str) -> Option<Arc<dyn CollectionReducer>> {
    map.read().ok().and_then(|m| m.get(entity_name).cloned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{ActionPayload, EntityActionFactory, EntityActionOptions};
    use crate::op::EntityOp;
    use crate::test_fixtures::{hero_metadata, villain_metadata};
    use serde_json::json;

    fn registry() -> EntityCollectionReducerRegistry {
        let defs = EntityDefinitionService::new();
        defs.register_metadata(hero_metadata()).unwrap();
        defs.register_metadata(villain_metadata()).unwrap();
        EntityCollectionReducerRegistry::new(defs)
    }

    fn act(entity_name: &str, op: EntityOp, payload: ActionPayload) -> EntityAction {
        EntityActionFactory::new()
            .create(entity_name, op, payload, EntityActionOptions::default())
            .unwrap()
    }

    #[test]
    fn unknown_entity_name_is_a_configuration_error() {
        let reg = registry();
        let cache = Arc::new(EntityCache::new());
        let err = reg
            .reduce(&cache, &act("Sidekick", EntityOp::QueryAll, ActionPayload::None))
            .unwrap_err();
        assert_eq!(err.to_string(), "no EntityDefinition for entity type \"Sidekick\"");
    }

    #[test]
    fn action_without_entity_name_leaves_cache_untouched() {
        let reg = registry();
        let cache = Arc::new(EntityCache::new());
        let mut action = act("Hero", EntityOp::QueryAll, ActionPayload::None);
        action.entity_name = String::new();
        let next = reg.reduce(&cache, &action).unwrap();
        assert!(Arc::ptr_eq(&cache, &next));
    }

    #[test]
    fn first_action_creates_the_collection() {
        let reg = registry();
        let cache = Arc::new(EntityCache::new());
        let next = reg
            .reduce(&cache, &act("Hero", EntityOp::QueryAll, ActionPayload::None))
            .unwrap();
        let heroes = next.collection("Hero").unwrap();
        assert!(heroes.loading);
        assert!(next.collection("Villain").is_none());
    }

    #[test]
    fn unchanged_collection_keeps_cache_identity() {
        let reg = registry();
        let cache = Arc::new(EntityCache::new());
        let once = reg
            .reduce(&cache, &act("Hero", EntityOp::QueryAll, ActionPayload::None))
            .unwrap();
        let twice = reg
            .reduce(&once, &act("Hero", EntityOp::QueryAll, ActionPayload::None))
            .unwrap();
        assert!(Arc::ptr_eq(&once, &twice));
    }

    #[test]
    fn other_collections_are_shared() {
        let reg = registry();
        let cache = Arc::new(EntityCache::new());
        let cache = reg
            .reduce(
                &cache,
                &act("Villain", EntityOp::AddOne, ActionPayload::Entity(json!({"id": 1}))),
            )
            .unwrap();
        let villains = cache.collection("Villain").unwrap().clone();
        let cache = reg
            .reduce(
                &cache,
                &act("Hero", EntityOp::AddOne, ActionPayload::Entity(json!({"id": 1}))),
            )
            .unwrap();
        assert!(Arc::ptr_eq(cache.collection("Villain").unwrap(), &villains));
    }

    #[test]
    fn custom_reducer_replaces_default() {
        let reg = registry();
        reg.register_reducer(
            "Hero",
            Arc::new(|c: &Arc<EntityCollection>, action: &EntityAction| {
                if action.op == EntityOp::RemoveAll {
                    return Err(EntityCacheError::Reducer {
                        entity_name: action.entity_name.clone(),
                        op: action.op.to_string(),
                        reason: "not allowed".into(),
                    });
                }
                Ok(c.clone())
            }),
        );
        let cache = Arc::new(EntityCache::new());
        let err = reg
            .reduce(&cache, &act("Hero", EntityOp::RemoveAll, ActionPayload::None))
            .unwrap_err();
        assert!(err.to_string().contains("not allowed"));
    }

    #[test]
    fn custom_reducer_needs_no_metadata() {
        let reg = EntityCollectionReducerRegistry::new(EntityDefinitionService::new());
        reg.register_reducer(
            "Log",
            Arc::new(|c: &Arc<EntityCollection>, _: &EntityAction| {
                Ok::<_, EntityCacheError>(c.clone())
            }),
        );
        let cache = Arc::new(EntityCache::new());
        let next = reg
            .reduce(&cache, &act("Log", EntityOp::QueryAll, ActionPayload::None))
            .unwrap();
        assert_eq!(next.collection("Log").unwrap().entity_name, "Log");
    }
}
