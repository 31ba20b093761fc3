//! Per-type command surface: builds, guards and dispatches entity actions.
//!
//! Server-affecting commands return a [`Completion`] that resolves with the
//! outcome of the persistence request; cache-only commands apply
//! synchronously.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};

use serde::Serialize;
use serde_json::Value;
use tokio::sync::oneshot;

use crate::action::{ActionPayload, EntityAction, EntityActionOptions, QueryParams};
use crate::entity::{EntityKey, Update};
use crate::error::{EntityCacheError, PersistError};
use crate::guard::EntityActionGuard;
use crate::metadata::{DispatcherOptions, EntityDefinition};
use crate::op::EntityOp;
use crate::store::EntityStore;

type CompletionFuture<T> = Pin<Box<dyn Future<Output = Result<T, PersistError>> + Send>>;

/// Outcome of one persistence request.
///
/// Resolves exactly once: with the success payload when the matching
/// `_SUCCESS` action arrives, or with [`PersistError::Service`] when the
/// matching `_ERROR` action arrives. Matching means same entity name, same
/// correlation id, and the success or error op of the initiating action.
///
/// The action has already been dispatched when the `Completion` is
/// returned; dropping it does not cancel the request.
pub struct Completion<T> {
    correlation_id: String,
    fut: CompletionFuture<T>,
}

impl<T> Completion<T> {
    /// Correlation id of the request this completion waits for.
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }
}

impl<T> std::fmt::Debug for Completion<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Completion")
            .field("correlation_id", &self.correlation_id)
            .finish_non_exhaustive()
    }
}

impl<T> Future for Completion<T> {
    type Output = Result<T, PersistError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.fut.as_mut().poll(cx)
    }
}

/// Commands for one entity type.
///
/// Obtained from [`EntityStore::dispatcher`]. `Clone` is cheap.
///
/// # Examples
///
/// ```
/// use entity_cache::{EntityActionOptions, EntityMetadata, EntityStoreBuilder};
/// use serde_json::json;
///
/// # tokio_test_block_on(async {
/// let store = EntityStoreBuilder::new()
///     .entity(EntityMetadata::new("Hero"))
///     .in_memory_data_services()
///     .build()
///     .unwrap();
/// let effects = store.start_effects().await.unwrap();
///
/// let heroes = store.dispatcher("Hero").unwrap();
/// let saved = heroes
///     .add(&json!({"name": "Sky"}), EntityActionOptions::default())
///     .unwrap()
///     .await
///     .unwrap();
/// assert_eq!(saved["id"], 1);
///
/// effects.shutdown().await.unwrap();
/// # });
/// # fn tokio_test_block_on<F: std::future::Future>(f: F) -> F::Output {
/// #     tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(f)
/// # }
/// ```
#[derive(Clone)]
pub struct EntityDispatcher {
    store: EntityStore,
    definition: Arc<EntityDefinition>,
    guard: EntityActionGuard,
}

impl std::fmt::Debug for EntityDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityDispatcher")
            .field("entity_name", &self.entity_name())
            .finish()
    }
}

impl EntityDispatcher {
    pub(crate) fn new(store: EntityStore, definition: Arc<EntityDefinition>) -> Self {
        let guard = EntityActionGuard::new(definition.metadata.select_id().clone());
        Self {
            store,
            definition,
            guard,
        }
    }

    /// Name of the entity type this dispatcher targets.
    pub fn entity_name(&self) -> &str {
        self.definition.entity_name()
    }

    /// The guard used to validate payloads.
    pub fn guard(&self) -> &EntityActionGuard {
        &self.guard
    }

    /// The key of `entity` under this type's key selector.
    pub fn select_id(&self, entity: &Value) -> Option<EntityKey> {
        (self.definition.metadata.select_id())(entity)
    }

    fn options(&self) -> DispatcherOptions {
        self.definition
            .metadata
            .dispatcher_options()
            .unwrap_or(self.store.inner.dispatcher_defaults)
    }

    /// Build an action for this type.
    ///
    /// # Errors
    ///
    /// Propagates [`EntityCacheError::MissingEntityName`] from the factory.
    pub fn create_action(
        &self,
        op: EntityOp,
        payload: ActionPayload,
        options: EntityActionOptions,
    ) -> Result<EntityAction, EntityCacheError> {
        self.store
            .action_factory()
            .create(self.entity_name(), op, payload, options)
    }

    /// Build and dispatch an action for this type.
    ///
    /// # Errors
    ///
    /// Returns any error from building or reducing the action.
    pub fn create_and_dispatch(
        &self,
        op: EntityOp,
        payload: ActionPayload,
        options: EntityActionOptions,
    ) -> Result<Arc<EntityAction>, EntityCacheError> {
        let action = self.create_action(op, payload, options)?;
        self.store.dispatch(action)
    }

    // ---- server-affecting commands ----

    /// Save a new entity.
    ///
    /// Optimistic when `options.is_optimistic` says so, otherwise per the
    /// type's `optimistic_add` setting. An optimistic add needs the entity's
    /// key up front; a pessimistic add lets the service assign it.
    ///
    /// # Returns
    ///
    /// A [`Completion`] resolving with the entity as saved.
    ///
    /// # Errors
    ///
    /// Returns [`EntityCacheError::Serialization`] if `entity` does not
    /// serialize, or [`EntityCacheError::InvalidPayload`] if an optimistic
    /// add has no key.
    pub fn add<T: Serialize + ?Sized>(
        &self,
        entity: &T,
        options: EntityActionOptions,
    ) -> Result<Completion<Value>, EntityCacheError> {
        let entity = serde_json::to_value(entity)?;
        let optimistic = options.is_optimistic.unwrap_or(self.options().optimistic_add);
        let op = if optimistic {
            EntityOp::SaveAddOneOptimistic
        } else {
            EntityOp::SaveAddOne
        };
        let action = self.persist_action(op, ActionPayload::Entity(entity), options, optimistic)?;
        if optimistic {
            self.guard.must_be_entity(&action)?;
        }
        self.submit(action, "an entity", |payload| payload.as_entity().cloned())
    }

    /// Delete the entity under `key` on the server.
    ///
    /// Optimistic per `options.is_optimistic` or the type's
    /// `optimistic_delete` setting.
    ///
    /// # Returns
    ///
    /// A [`Completion`] resolving with the deleted key.
    ///
    /// # Errors
    ///
    /// Returns an error only if the action cannot be built or reduced.
    pub fn delete(
        &self,
        key: impl Into<EntityKey>,
        options: EntityActionOptions,
    ) -> Result<Completion<EntityKey>, EntityCacheError> {
        let optimistic = options
            .is_optimistic
            .unwrap_or(self.options().optimistic_delete);
        let op = if optimistic {
            EntityOp::SaveDeleteOneOptimistic
        } else {
            EntityOp::SaveDeleteOne
        };
        let action = self.persist_action(op, ActionPayload::Key(key.into()), options, optimistic)?;
        self.submit(action, "a key", |payload| payload.as_key().cloned())
    }

    /// Delete `entity` on the server, resolving its key with the type's
    /// key selector.
    ///
    /// # Errors
    ///
    /// Returns [`EntityCacheError::InvalidPayload`] if the entity has no
    /// key.
    pub fn delete_entity<T: Serialize + ?Sized>(
        &self,
        entity: &T,
        options: EntityActionOptions,
    ) -> Result<Completion<EntityKey>, EntityCacheError> {
        let entity = serde_json::to_value(entity)?;
        let key = self
            .select_id(&entity)
            .ok_or_else(|| self.missing_key(EntityOp::SaveDeleteOne, &options))?;
        self.delete(key, options)
    }

    /// Load every entity from the server, replacing the collection.
    ///
    /// # Returns
    ///
    /// A [`Completion`] resolving with the loaded entities.
    pub fn get_all(
        &self,
        options: EntityActionOptions,
    ) -> Result<Completion<Vec<Value>>, EntityCacheError> {
        let action = self.persist_action(EntityOp::QueryAll, ActionPayload::None, options, false)?;
        self.submit(action, "an entity list", entities_or_empty)
    }

    /// Load one entity from the server and merge it into the collection.
    ///
    /// # Returns
    ///
    /// A [`Completion`] resolving with the entity, or `None` if the server
    /// does not know the key.
    pub fn get_by_key(
        &self,
        key: impl Into<EntityKey>,
        options: EntityActionOptions,
    ) -> Result<Completion<Option<Value>>, EntityCacheError> {
        let action =
            self.persist_action(EntityOp::QueryByKey, ActionPayload::Key(key.into()), options, false)?;
        self.submit(action, "an entity", |payload| match payload {
            ActionPayload::Entity(entity) => Some(Some(entity.clone())),
            ActionPayload::None => Some(None),
            _ => None,
        })
    }

    /// Load the entities matching `params` and merge them into the
    /// collection.
    ///
    /// # Returns
    ///
    /// A [`Completion`] resolving with the matching entities.
    pub fn get_with_query(
        &self,
        params: QueryParams,
        options: EntityActionOptions,
    ) -> Result<Completion<Vec<Value>>, EntityCacheError> {
        let action =
            self.persist_action(EntityOp::QueryMany, ActionPayload::Query(params), options, false)?;
        self.submit(action, "an entity list", entities_or_empty)
    }

    /// Save changes to an existing entity. The whole entity is sent as the
    /// change set; its key comes from the type's key selector.
    ///
    /// # Errors
    ///
    /// Returns [`EntityCacheError::InvalidPayload`] if the entity has no
    /// key.
    pub fn update<T: Serialize + ?Sized>(
        &self,
        entity: &T,
        options: EntityActionOptions,
    ) -> Result<Completion<Update>, EntityCacheError> {
        let changes = serde_json::to_value(entity)?;
        let key = self
            .select_id(&changes)
            .ok_or_else(|| self.missing_key(EntityOp::SaveUpdateOne, &options))?;
        self.update_with(Update::new(key, changes), options)
    }

    /// Save an explicit [`Update`].
    ///
    /// Optimistic per `options.is_optimistic` or the type's
    /// `optimistic_update` setting. The `changes` must resolve a key.
    ///
    /// # Returns
    ///
    /// A [`Completion`] resolving with the update as persisted.
    ///
    /// # Errors
    ///
    /// Returns [`EntityCacheError::InvalidPayload`] if `changes` has no key.
    pub fn update_with(
        &self,
        update: Update,
        options: EntityActionOptions,
    ) -> Result<Completion<Update>, EntityCacheError> {
        let optimistic = options
            .is_optimistic
            .unwrap_or(self.options().optimistic_update);
        let op = if optimistic {
            EntityOp::SaveUpdateOneOptimistic
        } else {
            EntityOp::SaveUpdateOne
        };
        let action = self.persist_action(op, ActionPayload::Update(update), options, optimistic)?;
        self.guard.must_be_update(&action)?;
        self.submit(action, "an update", |payload| payload.as_update().cloned())
    }

    // ---- cache-only commands ----

    /// Replace the collection contents with `entities`.
    pub fn add_all_to_cache<T: Serialize>(&self, entities: &[T]) -> Result<(), EntityCacheError> {
        self.checked_cache(EntityOp::AddAll, ActionPayload::Entities(to_values(entities)?))
    }

    /// Add one entity unless its key is already present.
    pub fn add_one_to_cache<T: Serialize + ?Sized>(&self, entity: &T) -> Result<(), EntityCacheError> {
        self.checked_cache(EntityOp::AddOne, ActionPayload::Entity(serde_json::to_value(entity)?))
    }

    /// Add entities whose keys are not already present.
    ///
    /// # Errors
    ///
    /// Returns [`EntityCacheError::InvalidPayload`] naming the first entity
    /// without a key; nothing is added in that case.
    pub fn add_many_to_cache<T: Serialize>(&self, entities: &[T]) -> Result<(), EntityCacheError> {
        self.checked_cache(EntityOp::AddMany, ActionPayload::Entities(to_values(entities)?))
    }

    /// Remove every entity and reset the `loaded`/`loading` flags.
    pub fn clear_cache(&self) -> Result<(), EntityCacheError> {
        self.cache(EntityOp::RemoveAll, ActionPayload::None)
    }

    /// Remove the entity under `key`.
    pub fn remove_one_from_cache(&self, key: impl Into<EntityKey>) -> Result<(), EntityCacheError> {
        self.cache(EntityOp::RemoveOne, ActionPayload::Key(key.into()))
    }

    /// Remove the entities under `keys`.
    pub fn remove_many_from_cache(&self, keys: Vec<EntityKey>) -> Result<(), EntityCacheError> {
        self.checked_cache(EntityOp::RemoveMany, ActionPayload::Keys(keys))
    }

    /// Patch one cached entity; the key comes from `entity`.
    ///
    /// # Errors
    ///
    /// Returns [`EntityCacheError::InvalidPayload`] if `entity` has no key.
    pub fn update_one_in_cache<T: Serialize + ?Sized>(&self, entity: &T) -> Result<(), EntityCacheError> {
        let update = self.to_update(entity, EntityOp::UpdateOne)?;
        self.cache(EntityOp::UpdateOne, ActionPayload::Update(update))
    }

    /// Patch several cached entities.
    ///
    /// # Errors
    ///
    /// Returns [`EntityCacheError::InvalidPayload`] if any entity has no
    /// key.
    pub fn update_many_in_cache<T: Serialize>(&self, entities: &[T]) -> Result<(), EntityCacheError> {
        let updates = entities
            .iter()
            .map(|e| self.to_update(e, EntityOp::UpdateMany))
            .collect::<Result<Vec<_>, _>>()?;
        self.cache(EntityOp::UpdateMany, ActionPayload::Updates(updates))
    }

    /// Merge into an existing entity or add a new one.
    pub fn upsert_one_in_cache<T: Serialize + ?Sized>(&self, entity: &T) -> Result<(), EntityCacheError> {
        self.checked_cache(EntityOp::UpsertOne, ActionPayload::Entity(serde_json::to_value(entity)?))
    }

    /// Upsert several entities.
    pub fn upsert_many_in_cache<T: Serialize>(&self, entities: &[T]) -> Result<(), EntityCacheError> {
        self.checked_cache(EntityOp::UpsertMany, ActionPayload::Entities(to_values(entities)?))
    }

    /// Set the filter pattern read by the filtered selectors.
    pub fn set_filter(&self, pattern: impl Into<String>) -> Result<(), EntityCacheError> {
        self.cache(EntityOp::SetFilter, ActionPayload::Filter(pattern.into()))
    }

    /// Set the `loaded` flag.
    pub fn set_loaded(&self, loaded: bool) -> Result<(), EntityCacheError> {
        self.cache(EntityOp::SetLoaded, ActionPayload::Flag(loaded))
    }

    /// Set the `loading` flag.
    pub fn set_loading(&self, loading: bool) -> Result<(), EntityCacheError> {
        self.cache(EntityOp::SetLoading, ActionPayload::Flag(loading))
    }

    /// Accept every unsaved change.
    pub fn commit_all(&self) -> Result<(), EntityCacheError> {
        self.cache(EntityOp::CommitAll, ActionPayload::None)
    }

    /// Accept the unsaved change to `key`.
    pub fn commit_one(&self, key: impl Into<EntityKey>) -> Result<(), EntityCacheError> {
        self.cache(EntityOp::CommitOne, ActionPayload::Key(key.into()))
    }

    /// Accept the unsaved changes to `keys`.
    pub fn commit_many(&self, keys: Vec<EntityKey>) -> Result<(), EntityCacheError> {
        self.cache(EntityOp::CommitMany, ActionPayload::Keys(keys))
    }

    /// Revert every unsaved change.
    pub fn undo_all(&self) -> Result<(), EntityCacheError> {
        self.cache(EntityOp::UndoAll, ActionPayload::None)
    }

    /// Revert the unsaved change to `key`.
    pub fn undo_one(&self, key: impl Into<EntityKey>) -> Result<(), EntityCacheError> {
        self.cache(EntityOp::UndoOne, ActionPayload::Key(key.into()))
    }

    /// Revert the unsaved changes to `keys`.
    pub fn undo_many(&self, keys: Vec<EntityKey>) -> Result<(), EntityCacheError> {
        self.cache(EntityOp::UndoMany, ActionPayload::Keys(keys))
    }

    // ---- internals ----

    fn cache(&self, op: EntityOp, payload: ActionPayload) -> Result<(), EntityCacheError> {
        self.create_and_dispatch(op, payload, EntityActionOptions::default())
            .map(|_| ())
    }

    /// Like `cache`, but every entity must carry a key.
    fn checked_cache(&self, op: EntityOp, payload: ActionPayload) -> Result<(), EntityCacheError> {
        let action = self.create_action(op, payload, EntityActionOptions::default())?;
        self.guard.check(&action)?;
        self.store.dispatch(action).map(|_| ())
    }

    fn persist_action(
        &self,
        op: EntityOp,
        payload: ActionPayload,
        mut options: EntityActionOptions,
        optimistic: bool,
    ) -> Result<EntityAction, EntityCacheError> {
        if options.correlation_id.is_none() {
            options.correlation_id = Some(self.store.inner.correlation_ids.next());
        }
        options.is_optimistic = Some(optimistic);
        self.create_action(op, payload, options)
    }

    fn to_update<T: Serialize + ?Sized>(&self, entity: &T, op: EntityOp) -> Result<Update, EntityCacheError> {
        let changes = serde_json::to_value(entity)?;
        let key = self
            .select_id(&changes)
            .ok_or_else(|| self.missing_key(op, &EntityActionOptions::default()))?;
        Ok(Update::new(key, changes))
    }

    fn missing_key(&self, op: EntityOp, options: &EntityActionOptions) -> EntityCacheError {
        let tag = options.tag.as_deref().unwrap_or(self.entity_name());
        EntityCacheError::InvalidPayload {
            action_type: self.store.action_factory().format_action_type(tag, op),
            reason: "payload has a missing or invalid entity key (id)".to_owned(),
        }
    }

    /// Register for the outcome, then dispatch `action`.
    fn submit<T, F>(
        &self,
        action: EntityAction,
        expected: &'static str,
        extract: F,
    ) -> Result<Completion<T>, EntityCacheError>
    where
        T: Send + 'static,
        F: Fn(&ActionPayload) -> Option<T> + Send + 'static,
    {
        let correlation_id = action.correlation_id.clone().unwrap_or_default();
        let rx = self.store.inner.completions.register(&action, &correlation_id);
        // A rejected dispatch drops `rx`; the next registration prunes it.
        self.store.dispatch(action)?;

        Ok(Completion {
            correlation_id,
            fut: Box::pin(settle(rx, expected, extract)),
        })
    }
}

async fn settle<T, F>(
    rx: oneshot::Receiver<Arc<EntityAction>>,
    expected: &'static str,
    extract: F,
) -> Result<T, PersistError>
where
    F: Fn(&ActionPayload) -> Option<T>,
{
    let action = rx.await.map_err(|_| PersistError::Closed)?;
    if action.op.is_success() {
        return extract(&action.payload).ok_or(PersistError::UnexpectedPayload { expected });
    }
    match &action.payload {
        ActionPayload::Error(e) => Err(PersistError::Service(e.error.clone())),
        _ => Err(PersistError::UnexpectedPayload {
            expected: "an error payload",
        }),
    }
}

/// Completions waiting for the terminal action of their request.
///
/// Filled by [`EntityDispatcher`] before it dispatches a persistence action
/// and drained by the store's dispatch path when the matching `_SUCCESS` or
/// `_ERROR` action has been reduced. Matching means same entity name, same
/// correlation id, and the success or error op of the initiating action.
#[derive(Default)]
pub(crate) struct PendingCompletions {
    waiting: Mutex<HashMap<(String, String), Vec<Waiter>>>,
}

struct Waiter {
    success: Option<EntityOp>,
    error: Option<EntityOp>,
    tx: oneshot::Sender<Arc<EntityAction>>,
}

impl PendingCompletions {
    fn register(
        &self,
        action: &EntityAction,
        correlation_id: &str,
    ) -> oneshot::Receiver<Arc<EntityAction>> {
        let (tx, rx) = oneshot::channel();
        let mut waiting = self.lock();
        // Dropped completions.
        waiting.retain(|_, waiters| {
            waiters.retain(|w| !w.tx.is_closed());
            !waiters.is_empty()
        });
        waiting
            .entry((action.entity_name.clone(), correlation_id.to_owned()))
            .or_default()
            .push(Waiter {
                success: action.op.success(),
                error: action.op.error(),
                tx,
            });
        rx
    }

    /// Hand a reduced terminal action to the completions it settles.
    pub(crate) fn resolve(&self, action: &Arc<EntityAction>) {
        if !action.op.is_terminal() {
            return;
        }
        let Some(correlation_id) = action.correlation_id.as_deref() else {
            return;
        };
        let key = (action.entity_name.clone(), correlation_id.to_owned());
        let settled = {
            let mut waiting = self.lock();
            let Some(waiters) = waiting.get_mut(&key) else {
                return;
            };
            let (settled, rest): (Vec<Waiter>, Vec<Waiter>) = std::mem::take(waiters)
                .into_iter()
                .partition(|w| w.success == Some(action.op) || w.error == Some(action.op));
            if rest.is_empty() {
                waiting.remove(&key);
            } else {
                *waiters = rest;
            }
            settled
        };
        for waiter in settled {
            // The caller may have dropped its completion.
            let _ = waiter.tx.send(action.clone());
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<(String, String), Vec<Waiter>>> {
        self.waiting.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn entities_or_empty(payload: &ActionPayload) -> Option<Vec<Value>> {
    match payload {
        ActionPayload::Entities(entities) => Some(entities.clone()),
        ActionPayload::None => Some(Vec::new()),
        _ => None,
    }
}

fn to_values<T: Serialize>(entities: &[T]) -> Result<Vec<Value>, EntityCacheError> {
    entities
        .iter()
        .map(|e| serde_json::to_value(e).map_err(EntityCacheError::from))
        .collect()
}
