//! Metadata-driven normalized entity cache.
//!
//! Register [`EntityMetadata`] per domain type and the store derives a
//! normalized collection, the action vocabulary, the reducer, and typed
//! dispatchers, selectors and change streams for it.

mod action;
pub use action::{
    ActionPayload, EntityAction, EntityActionError, EntityActionFactory, EntityActionOptions,
    QueryParams, TypeFormatter,
};
mod adapter;
pub use adapter::{EntityAdapter, Tracking};
mod collection;
pub use collection::{EntityCache, EntityCollection};
mod correlation;
mod data_service;
mod dispatcher;
mod effects;
mod entity;
pub use entity::{
    EntityKey, FilterFn, KeySelector, SortComparer, Update, default_filter, default_select_id,
    merge_changes, select_id_by_field, sort_by_field,
};
mod error;
mod guard;
mod metadata;
mod observe;
mod op;
mod reducer;
mod registry;
mod selectors;
mod store;
mod urls;

#[cfg(test)]
mod test_fixtures;

pub use correlation::CorrelationIdGenerator;
pub use data_service::{
    DataServiceConfig, DataServiceError, DataServiceRegistry, EntityCollectionDataService,
    HttpMethod, InMemoryDataService, RequestData,
};
pub use dispatcher::{Completion, EntityDispatcher};
pub use effects::EffectsHandle;
pub use error::{EffectsError, EntityCacheError, PersistError};
pub use guard::EntityActionGuard;
pub use metadata::{DispatcherOptions, EntityDefinition, EntityDefinitionService, EntityMetadata};
pub use observe::EntityObservables;
pub use op::{EntityOp, OP_ERROR, OP_SUCCESS, UnknownOp};
pub use reducer::{CollectionReducer, DefaultCollectionReducer};
pub use registry::EntityCollectionReducerRegistry;
pub use selectors::{
    ChangeState, ChangeType, EntitySelectors, select_change_state, select_count, select_entities,
    select_entities_as, select_entity_map, select_filter, select_filtered_entities, select_keys,
    select_loaded, select_loading,
};
pub use store::{EntityStore, EntityStoreBuilder};
pub use urls::{EntityHttpResourceUrls, HttpUrlGenerator, Pluralizer};
