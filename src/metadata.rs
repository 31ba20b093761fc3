//! Per-type entity metadata and the definitions built from it.
//!
//! An [`EntityMetadata`] is what the application registers: the key
//! selector, sort order, filter and save policy for one entity type. The
//! [`EntityDefinitionService`] turns each one into an [`EntityDefinition`]
//! (metadata plus its adapter and initial collection) and answers lookups by
//! entity name.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

use serde_json::{Map, Value};

use crate::adapter::{EntityAdapter, Tracking};
use crate::collection::EntityCollection;
use crate::entity::{FilterFn, KeySelector, SortComparer, default_filter, default_select_id};
use crate::error::EntityCacheError;

/// Save-optimism defaults for a dispatcher.
///
/// The built-in default is pessimistic add and update, optimistic delete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatcherOptions {
    /// Apply `add` locally before the server confirms.
    pub optimistic_add: bool,
    /// Apply `delete` locally before the server confirms.
    pub optimistic_delete: bool,
    /// Apply `update` locally before the server confirms.
    pub optimistic_update: bool,
}

impl Default for DispatcherOptions {
    fn default() -> Self {
        Self {
            optimistic_add: false,
            optimistic_delete: true,
            optimistic_update: false,
        }
    }
}

/// What the application registers for one entity type.
///
/// # Examples
///
/// ```
/// use entity_cache::{EntityMetadata, sort_by_field};
///
/// let hero = EntityMetadata::new("Hero")
///     .with_sort_comparer(sort_by_field("name"))
///     .with_no_change_tracking(true);
/// assert_eq!(hero.entity_name(), "Hero");
/// ```
#[derive(Clone)]
pub struct EntityMetadata {
    entity_name: String,
    select_id: KeySelector,
    sort_comparer: Option<SortComparer>,
    filter_fn: Option<FilterFn>,
    additional_collection_state: Map<String, Value>,
    dispatcher_options: Option<DispatcherOptions>,
    no_change_tracking: bool,
}

impl fmt::Debug for EntityMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityMetadata")
            .field("entity_name", &self.entity_name)
            .field("sorted", &self.sort_comparer.is_some())
            .field("custom_filter", &self.filter_fn.is_some())
            .field("dispatcher_options", &self.dispatcher_options)
            .field("no_change_tracking", &self.no_change_tracking)
            .finish_non_exhaustive()
    }
}

impl EntityMetadata {
    /// Metadata for `entity_name` with the default `"id"` key selector, no
    /// sort order and the default filter. The name is trimmed.
    pub fn new(entity_name: impl Into<String>) -> Self {
        Self {
            entity_name: entity_name.into().trim().to_owned(),
            select_id: default_select_id(),
            sort_comparer: None,
            filter_fn: None,
            additional_collection_state: Map::new(),
            dispatcher_options: None,
            no_change_tracking: false,
        }
    }

    /// Use a custom key selector.
    pub fn with_select_id(mut self, select_id: KeySelector) -> Self {
        self.select_id = select_id;
        self
    }

    /// Keep the collection sorted by `comparer`.
    pub fn with_sort_comparer(mut self, comparer: SortComparer) -> Self {
        self.sort_comparer = Some(comparer);
        self
    }

    /// Use a custom filter function.
    pub fn with_filter_fn(mut self, filter_fn: FilterFn) -> Self {
        self.filter_fn = Some(filter_fn);
        self
    }

    /// Seed every new collection of this type with extra state.
    pub fn with_additional_collection_state(mut self, state: Map<String, Value>) -> Self {
        self.additional_collection_state = state;
        self
    }

    /// Per-type save-optimism defaults.
    pub fn with_dispatcher_options(mut self, options: DispatcherOptions) -> Self {
        self.dispatcher_options = Some(options);
        self
    }

    /// Turn tracked cache ops into their no-track equivalents.
    pub fn with_no_change_tracking(mut self, no_change_tracking: bool) -> Self {
        self.no_change_tracking = no_change_tracking;
        self
    }

    /// The trimmed entity name.
    pub fn entity_name(&self) -> &str {
        &self.entity_name
    }

    /// The key selector.
    pub fn select_id(&self) -> &KeySelector {
        &self.select_id
    }

    /// Per-type save-optimism defaults, if set.
    pub fn dispatcher_options(&self) -> Option<DispatcherOptions> {
        self.dispatcher_options
    }

    /// `true` if change tracking is disabled for this type.
    pub fn no_change_tracking(&self) -> bool {
        self.no_change_tracking
    }
}

/// Metadata plus everything derived from it.
#[derive(Clone)]
pub struct EntityDefinition {
    /// The registered metadata.
    pub metadata: EntityMetadata,
    /// Key extraction and ordering.
    pub adapter: EntityAdapter,
    /// Filter used by the filtered selectors.
    pub filter_fn: FilterFn,
    /// The collection a new cache entry starts from.
    pub initial_state: Arc<EntityCollection>,
}

impl fmt::Debug for EntityDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityDefinition")
            .field("metadata", &self.metadata)
            .finish_non_exhaustive()
    }
}

impl EntityDefinition {
    /// Build a definition from `metadata`.
    ///
    /// # Errors
    ///
    /// Returns [`EntityCacheError::InvalidEntityName`] if the metadata name
    /// is empty.
    pub fn from_metadata(metadata: EntityMetadata) -> Result<Self, EntityCacheError> {
        if metadata.entity_name.is_empty() {
            return Err(EntityCacheError::InvalidEntityName);
        }
        let adapter = EntityAdapter::new(
            metadata.select_id.clone(),
            metadata.sort_comparer.clone(),
        );
        let filter_fn = metadata.filter_fn.clone().unwrap_or_else(default_filter);
        let initial_state = Arc::new(
            EntityCollection::new(metadata.entity_name.clone())
                .with_extra(metadata.additional_collection_state.clone()),
        );
        Ok(Self {
            metadata,
            adapter,
            filter_fn,
            initial_state,
        })
    }

    /// The entity name.
    pub fn entity_name(&self) -> &str {
        self.metadata.entity_name()
    }

    /// Tracking mode for tracked cache ops.
    pub fn cache_tracking(&self) -> Tracking {
        if self.metadata.no_change_tracking {
            Tracking::Off
        } else {
            Tracking::KeepFirst
        }
    }
}

/// Registry of entity definitions keyed by entity name.
///
/// Cheap to clone; clones share the same registry.
#[derive(Clone, Default)]
pub struct EntityDefinitionService {
    definitions: Arc<RwLock<HashMap<String, Arc<EntityDefinition>>>>,
}

impl fmt::Debug for EntityDefinitionService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityDefinitionService")
            .field("entity_names", &self.entity_names())
            .finish()
    }
}

impl EntityDefinitionService {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or re-register) one entity type.
    ///
    /// # Errors
    ///
    /// Returns [`EntityCacheError::InvalidEntityName`] if the name is empty.
    pub fn register_metadata(
        &self,
        metadata: EntityMetadata,
    ) -> Result<Arc<EntityDefinition>, EntityCacheError> {
        let definition = Arc::new(EntityDefinition::from_metadata(metadata)?);
        if let Ok(mut definitions) = self.definitions.write() {
            definitions.insert(definition.entity_name().to_owned(), definition.clone());
        }
        tracing::debug!(entity_name = %definition.entity_name(), "registered entity metadata");
        Ok(definition)
    }

    /// Register several entity types. Stops at the first invalid one.
    ///
    /// # Errors
    ///
    /// Returns [`EntityCacheError::InvalidEntityName`] for an empty name.
    pub fn register_metadata_map(
        &self,
        metadata: impl IntoIterator<Item = EntityMetadata>,
    ) -> Result<(), EntityCacheError> {
        for m in metadata {
            self.register_metadata(m)?;
        }
        Ok(())
    }

    /// The definition for `entity_name`.
    ///
    /// # Errors
    ///
    /// Returns [`EntityCacheError::NoDefinition`] if the type was never
    /// registered.
    pub fn definition(&self, entity_name: &str) -> Result<Arc<EntityDefinition>, EntityCacheError> {
        self.definitions
            .read()
            .ok()
            .and_then(|definitions| definitions.get(entity_name).cloned())
            .ok_or_else(|| EntityCacheError::NoDefinition(entity_name.to_owned()))
    }

    /// `true` if `entity_name` is registered.
    pub fn contains(&self, entity_name: &str) -> bool {
        self.definitions
            .read()
            .map(|definitions| definitions.contains_key(entity_name))
            .unwrap_or(false)
    }

    /// Names of all registered types, sorted.
    pub fn entity_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .definitions
            .read()
            .map(|definitions| definitions.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }
}
