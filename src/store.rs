//! Top-level entry point that owns the entity cache, the action bus, and
//! the registries, composed into a single [`EntityStore`] type.
//!
//! The store is built via [`EntityStoreBuilder`], which registers entity
//! metadata, custom reducers, data services and the knobs the effect runner
//! reads.

use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{broadcast, mpsc, watch};

use crate::action::{EntityAction, EntityActionFactory};
use crate::collection::{EntityCache, EntityCollection};
use crate::correlation::CorrelationIdGenerator;
use crate::data_service::{
    DataServiceConfig, DataServiceRegistry, EntityCollectionDataService, InMemoryDataService,
};
use crate::dispatcher::{EntityDispatcher, PendingCompletions};
use crate::effects::{EffectsHandle, run_effects};
use crate::error::{EffectsError, EntityCacheError};
use crate::metadata::{DispatcherOptions, EntityDefinition, EntityDefinitionService, EntityMetadata};
use crate::observe::EntityObservables;
use crate::reducer::CollectionReducer;
use crate::registry::EntityCollectionReducerRegistry;
use crate::selectors::EntitySelectors;
use crate::urls::{HttpUrlGenerator, Pluralizer};

/// Default capacity of the action bus.
const DEFAULT_ACTION_CAPACITY: usize = 256;

pub(crate) struct StoreInner {
    pub(crate) state: watch::Sender<Arc<EntityCache>>,
    pub(crate) actions: broadcast::Sender<Arc<EntityAction>>,
    pub(crate) definitions: EntityDefinitionService,
    pub(crate) reducers: EntityCollectionReducerRegistry,
    pub(crate) factory: EntityActionFactory,
    pub(crate) correlation_ids: CorrelationIdGenerator,
    pub(crate) dispatcher_defaults: DispatcherOptions,
    pub(crate) data_services: DataServiceRegistry,
    pub(crate) data_service_config: DataServiceConfig,
    pub(crate) urls: HttpUrlGenerator,
    pub(crate) effects: tokio::sync::Mutex<Option<EffectsHandle>>,
    /// Feeds persistence actions to the running effect runner.
    pub(crate) persist_tx: Mutex<Option<mpsc::UnboundedSender<Arc<EntityAction>>>>,
    pub(crate) completions: PendingCompletions,
}

/// The entity cache together with its dispatch path.
///
/// All state changes go through [`dispatch`](EntityStore::dispatch): the
/// action is reduced into a new cache, the new cache is published to state
/// subscribers if it changed, and the action is broadcast on the action bus
/// for observables. Persistence actions are also queued to the effect
/// runner, and terminal actions settle the dispatcher completions waiting
/// on them; neither path goes through the bounded bus, so a lagging bus
/// subscriber never loses a request or a reply.
///
/// `Clone` is cheap -- all internal state is `Arc`-wrapped.
///
/// # Examples
///
/// ```
/// use entity_cache::{EntityMetadata, EntityStoreBuilder};
///
/// let store = EntityStoreBuilder::new()
///     .entity(EntityMetadata::new("Hero"))
///     .build()
///     .unwrap();
/// let heroes = store.dispatcher("Hero").unwrap();
/// heroes.add_one_to_cache(&serde_json::json!({"id": 1, "name": "A"})).unwrap();
/// assert_eq!(store.selectors("Hero").unwrap().count(), 1);
/// ```
#[derive(Clone)]
pub struct EntityStore {
    pub(crate) inner: Arc<StoreInner>,
}

impl std::fmt::Debug for EntityStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityStore")
            .field("entity_names", &self.inner.definitions.entity_names())
            .finish()
    }
}

impl EntityStore {
    /// Reduce `action` into the cache and broadcast it.
    ///
    /// The reduction, the broadcast, the hand-off to the effect runner and
    /// the settling of completions happen under the state lock, so every
    /// consumer sees actions in the order they were applied.
    ///
    /// # Arguments
    ///
    /// * `action` - The action to apply.
    ///
    /// # Returns
    ///
    /// The dispatched action, shared with bus subscribers.
    ///
    /// # Errors
    ///
    /// Returns [`EntityCacheError::NoDefinition`] if the action names an
    /// unregistered entity type, or the error of a custom reducer. Nothing
    /// is published or broadcast in that case.
    pub fn dispatch(&self, action: EntityAction) -> Result<Arc<EntityAction>, EntityCacheError> {
        let action = Arc::new(action);
        let mut outcome = Ok(());
        let mut changed = false;
        self.inner.state.send_if_modified(|cache| {
            match self.inner.reducers.reduce(cache, &action) {
                Ok(next) => {
                    changed = !Arc::ptr_eq(cache, &next);
                    *cache = next;
                    // No subscribers is fine.
                    let _ = self.inner.actions.send(action.clone());
                    if action.op.is_persist() {
                        self.queue_persist(&action);
                    }
                    self.inner.completions.resolve(&action);
                }
                Err(e) => outcome = Err(e),
            }
            changed
        });
        outcome?;

        tracing::debug!(
            entity_name = %action.entity_name,
            op = %action.op,
            correlation_id = ?action.correlation_id,
            changed,
            "reduced entity action"
        );
        Ok(action)
    }

    fn queue_persist(&self, action: &Arc<EntityAction>) {
        let persist_tx = self
            .inner
            .persist_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let Some(tx) = persist_tx.as_ref() else {
            return;
        };
        if tx.send(action.clone()).is_err() {
            tracing::debug!(
                entity_name = %action.entity_name,
                op = %action.op,
                "effect runner stopped; persistence action not handled"
            );
        }
    }

    /// The current cache.
    pub fn state(&self) -> Arc<EntityCache> {
        self.inner.state.borrow().clone()
    }

    /// The current collection for `entity_name`.
    ///
    /// Before any action has touched the type this is its initial
    /// collection.
    ///
    /// # Errors
    ///
    /// Returns [`EntityCacheError::NoDefinition`] for an unregistered type.
    pub fn collection(&self, entity_name: &str) -> Result<Arc<EntityCollection>, EntityCacheError> {
        let definition = self.inner.definitions.definition(entity_name)?;
        Ok(collection_or_initial(&self.state(), &definition))
    }

    /// Subscribe to cache changes.
    pub fn subscribe_state(&self) -> watch::Receiver<Arc<EntityCache>> {
        self.inner.state.subscribe()
    }

    /// Subscribe to every dispatched action.
    pub fn subscribe_actions(&self) -> broadcast::Receiver<Arc<EntityAction>> {
        self.inner.actions.subscribe()
    }

    /// Register (or override) an entity type at runtime.
    ///
    /// # Errors
    ///
    /// Returns [`EntityCacheError::InvalidEntityName`] for an empty name.
    pub fn register_metadata(&self, metadata: EntityMetadata) -> Result<(), EntityCacheError> {
        let definition = self.inner.definitions.register_metadata(metadata)?;
        self.inner.reducers.invalidate(definition.entity_name());
        Ok(())
    }

    /// Replace the collection reducer for `entity_name`.
    pub fn register_reducer(&self, entity_name: impl Into<String>, reducer: Arc<dyn CollectionReducer>) {
        self.inner.reducers.register_reducer(entity_name, reducer);
    }

    /// The definition registered for `entity_name`.
    ///
    /// # Errors
    ///
    /// Returns [`EntityCacheError::NoDefinition`] for an unregistered type.
    pub fn definition(&self, entity_name: &str) -> Result<Arc<EntityDefinition>, EntityCacheError> {
        self.inner.definitions.definition(entity_name)
    }

    /// The action factory used by every dispatcher of this store.
    pub fn action_factory(&self) -> &EntityActionFactory {
        &self.inner.factory
    }

    /// A dispatcher for `entity_name`.
    ///
    /// # Errors
    ///
    /// Returns [`EntityCacheError::NoDefinition`] for an unregistered type.
    pub fn dispatcher(&self, entity_name: &str) -> Result<EntityDispatcher, EntityCacheError> {
        let definition = self.definition(entity_name)?;
        Ok(EntityDispatcher::new(self.clone(), definition))
    }

    /// Synchronous selectors for `entity_name`.
    ///
    /// # Errors
    ///
    /// Returns [`EntityCacheError::NoDefinition`] for an unregistered type.
    pub fn selectors(&self, entity_name: &str) -> Result<EntitySelectors, EntityCacheError> {
        let definition = self.definition(entity_name)?;
        Ok(EntitySelectors::new(self.clone(), definition))
    }

    /// Change streams for `entity_name`.
    ///
    /// # Errors
    ///
    /// Returns [`EntityCacheError::NoDefinition`] for an unregistered type.
    pub fn observables(&self, entity_name: &str) -> Result<EntityObservables, EntityCacheError> {
        let definition = self.definition(entity_name)?;
        Ok(EntityObservables::new(self.clone(), definition))
    }

    /// Start the effect runner that calls data services for query and save
    /// actions.
    ///
    /// The runner's queue is installed before this returns, so every
    /// persistence action dispatched afterwards is handled. Only one runner may be
    /// active per store; after [`EffectsHandle::shutdown`] a new one may be
    /// started.
    ///
    /// # Returns
    ///
    /// An [`EffectsHandle`] for shutting the runner down.
    ///
    /// # Errors
    ///
    /// Returns [`EffectsError::AlreadyRunning`] if a runner is active.
    pub async fn start_effects(&self) -> Result<EffectsHandle, EffectsError> {
        let mut guard = self.inner.effects.lock().await;
        if guard.as_ref().is_some_and(EffectsHandle::is_running) {
            return Err(EffectsError::AlreadyRunning);
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (persist_tx, requests) = mpsc::unbounded_channel();
        *self
            .inner
            .persist_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(persist_tx);
        let store = self.clone();
        let task = tokio::spawn(async move { run_effects(store, requests, shutdown_rx).await });

        let handle = EffectsHandle::new(shutdown_tx, task);
        *guard = Some(handle.clone());
        tracing::info!("entity effects started");
        Ok(handle)
    }
}

/// The collection for `definition` in `cache`, or its initial state.
pub(crate) fn collection_or_initial(
    cache: &EntityCache,
    definition: &EntityDefinition,
) -> Arc<EntityCollection> {
    cache
        .collection(definition.entity_name())
        .cloned()
        .unwrap_or_else(|| definition.initial_state.clone())
}

/// Builder for configuring and constructing an [`EntityStore`].
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use entity_cache::{DataServiceConfig, DispatcherOptions, EntityMetadata, EntityStoreBuilder};
///
/// let store = EntityStoreBuilder::new()
///     .entity(EntityMetadata::new("Hero"))
///     .entity(EntityMetadata::new("Villain"))
///     .plural_names([("Hero", "Heroes")])
///     .dispatcher_options(DispatcherOptions { optimistic_add: true, ..Default::default() })
///     .data_service_config(DataServiceConfig {
///         timeout: Some(Duration::from_secs(5)),
///         ..Default::default()
///     })
///     .in_memory_data_services()
///     .build()
///     .unwrap();
/// assert!(store.definition("Villain").is_ok());
/// ```
pub struct EntityStoreBuilder {
    metadata: Vec<EntityMetadata>,
    plural_names: Vec<(String, String)>,
    dispatcher_options: DispatcherOptions,
    reducers: Vec<(String, Arc<dyn CollectionReducer>)>,
    data_services: Vec<(String, Arc<dyn EntityCollectionDataService>)>,
    in_memory_data_services: bool,
    data_service_config: DataServiceConfig,
    action_capacity: usize,
    factory: EntityActionFactory,
}

impl EntityStoreBuilder {
    /// Create a builder with no entity types and default settings.
    pub fn new() -> Self {
        Self {
            metadata: Vec::new(),
            plural_names: Vec::new(),
            dispatcher_options: DispatcherOptions::default(),
            reducers: Vec::new(),
            data_services: Vec::new(),
            in_memory_data_services: false,
            data_service_config: DataServiceConfig::default(),
            action_capacity: DEFAULT_ACTION_CAPACITY,
            factory: EntityActionFactory::default(),
        }
    }

    /// Register an entity type. A later registration for the same name
    /// overrides an earlier one.
    ///
    /// # Returns
    ///
    /// `self` for method chaining.
    pub fn entity(mut self, metadata: EntityMetadata) -> Self {
        self.metadata.push(metadata);
        self
    }

    /// Register several entity types.
    ///
    /// # Returns
    ///
    /// `self` for method chaining.
    pub fn entities(mut self, metadata: impl IntoIterator<Item = EntityMetadata>) -> Self {
        self.metadata.extend(metadata);
        self
    }

    /// Override plural names used in collection URLs.
    ///
    /// # Returns
    ///
    /// `self` for method chaining.
    pub fn plural_names<K, V>(mut self, names: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.plural_names
            .extend(names.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    /// Global save-optimism defaults, used for types whose metadata sets
    /// none.
    ///
    /// # Returns
    ///
    /// `self` for method chaining.
    pub fn dispatcher_options(mut self, options: DispatcherOptions) -> Self {
        self.dispatcher_options = options;
        self
    }

    /// Replace the default collection reducer for `entity_name`.
    ///
    /// # Returns
    ///
    /// `self` for method chaining.
    pub fn collection_reducer(
        mut self,
        entity_name: impl Into<String>,
        reducer: Arc<dyn CollectionReducer>,
    ) -> Self {
        self.reducers.push((entity_name.into(), reducer));
        self
    }

    /// Register the data service the effect runner calls for
    /// `entity_name`.
    ///
    /// # Returns
    ///
    /// `self` for method chaining.
    pub fn data_service(
        mut self,
        entity_name: impl Into<String>,
        service: Arc<dyn EntityCollectionDataService>,
    ) -> Self {
        self.data_services.push((entity_name.into(), service));
        self
    }

    /// Give every registered type without an explicit data service an
    /// [`InMemoryDataService`].
    ///
    /// # Returns
    ///
    /// `self` for method chaining.
    pub fn in_memory_data_services(mut self) -> Self {
        self.in_memory_data_services = true;
        self
    }

    /// Root URL, timeout and delays for data-service calls.
    ///
    /// # Returns
    ///
    /// `self` for method chaining.
    pub fn data_service_config(mut self, config: DataServiceConfig) -> Self {
        self.data_service_config = config;
        self
    }

    /// Capacity of the action bus. Observers that fall further behind
    /// than this skip the missed actions; the effect runner and dispatcher
    /// completions do not read the bus.
    ///
    /// # Returns
    ///
    /// `self` for method chaining.
    pub fn action_channel_capacity(mut self, capacity: usize) -> Self {
        self.action_capacity = capacity.max(1);
        self
    }

    /// Use a custom action factory (for example one with a different type
    /// formatter).
    ///
    /// # Returns
    ///
    /// `self` for method chaining.
    pub fn action_factory(mut self, factory: EntityActionFactory) -> Self {
        self.factory = factory;
        self
    }

    /// Build the [`EntityStore`].
    ///
    /// # Returns
    ///
    /// A store with an empty cache.
    ///
    /// # Errors
    ///
    /// Returns [`EntityCacheError::InvalidEntityName`] if any metadata has
    /// an empty name.
    pub fn build(self) -> Result<EntityStore, EntityCacheError> {
        let definitions = EntityDefinitionService::new();
        definitions.register_metadata_map(self.metadata)?;

        let reducers = EntityCollectionReducerRegistry::new(definitions.clone());
        for (name, reducer) in self.reducers {
            reducers.register_reducer(name, reducer);
        }

        let urls = HttpUrlGenerator::new(Pluralizer::new().with_overrides(self.plural_names));

        let mut data_services = DataServiceRegistry::new();
        if self.in_memory_data_services {
            for name in definitions.entity_names() {
                let service =
                    InMemoryDataService::with_urls(&name, &urls, &self.data_service_config.root);
                data_services.register(name, Arc::new(service));
            }
        }
        for (name, service) in self.data_services {
            data_services.register(name, service);
        }

        let (state, _) = watch::channel(Arc::new(EntityCache::new()));
        let (actions, _) = broadcast::channel(self.action_capacity);

        tracing::debug!(
            entity_names = ?definitions.entity_names(),
            "entity store built"
        );

        Ok(EntityStore {
            inner: Arc::new(StoreInner {
                state,
                actions,
                definitions,
                reducers,
                factory: self.factory,
                correlation_ids: CorrelationIdGenerator::new(),
                dispatcher_defaults: self.dispatcher_options,
                data_services,
                data_service_config: self.data_service_config,
                urls,
                effects: tokio::sync::Mutex::new(None),
                persist_tx: Mutex::new(None),
                completions: PendingCompletions::default(),
            }),
        })
    }
}

impl Default for EntityStoreBuilder {
    fn default() -> Self {
        Self::new()
    }
}
