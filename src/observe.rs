//! Change streams over one entity type.
//!
//! State streams start with the current value and then emit whenever the
//! type's collection is replaced; a dispatch that leaves the collection
//! `Arc` untouched (including changes to other entity types) emits nothing.
//! Derived scalar streams additionally skip values equal to the previous
//! one. Streams built on the state channel coalesce: a slow consumer sees
//! the latest collection, not every intermediate one.

use std::sync::Arc;

use serde_json::Value;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::{BroadcastStream, WatchStream};
use tokio_stream::{Stream, StreamExt};

use crate::action::{EntityAction, EntityActionError};
use crate::collection::EntityCollection;
use crate::entity::EntityKey;
use crate::metadata::EntityDefinition;
use crate::store::{EntityStore, collection_or_initial};

/// Stream factories bound to one entity type in a store.
///
/// Obtained from [`EntityStore::observables`].
///
/// # Examples
///
/// ```
/// use entity_cache::{EntityMetadata, EntityStoreBuilder};
/// use tokio_stream::StreamExt;
///
/// # tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(async {
/// let store = EntityStoreBuilder::new()
///     .entity(EntityMetadata::new("Hero"))
///     .build()
///     .unwrap();
/// let mut counts = Box::pin(store.observables("Hero").unwrap().count());
/// assert_eq!(counts.next().await, Some(0));
///
/// store.dispatcher("Hero").unwrap()
///     .add_one_to_cache(&serde_json::json!({"id": 1}))
///     .unwrap();
/// assert_eq!(counts.next().await, Some(1));
/// # });
/// ```
#[derive(Clone)]
pub struct EntityObservables {
    store: EntityStore,
    definition: Arc<EntityDefinition>,
}

impl std::fmt::Debug for EntityObservables {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityObservables")
            .field("entity_name", &self.definition.entity_name())
            .finish()
    }
}

impl EntityObservables {
    pub(crate) fn new(store: EntityStore, definition: Arc<EntityDefinition>) -> Self {
        Self { store, definition }
    }

    /// The collection, re-emitted each time its `Arc` changes.
    pub fn collection(&self) -> impl Stream<Item = Arc<EntityCollection>> + Send + 'static {
        let definition = self.definition.clone();
        let mut last: Option<Arc<EntityCollection>> = None;
        WatchStream::new(self.store.subscribe_state()).filter_map(move |cache| {
            let current = collection_or_initial(&cache, &definition);
            if last.as_ref().is_some_and(|prev| Arc::ptr_eq(prev, &current)) {
                return None;
            }
            last = Some(current.clone());
            Some(current)
        })
    }

    /// Entities in `ids` order.
    pub fn entities(&self) -> impl Stream<Item = Vec<Arc<Value>>> + Send + 'static {
        self.collection().map(|c| c.all())
    }

    /// Entities passing the type's filter function.
    pub fn filtered_entities(&self) -> impl Stream<Item = Vec<Arc<Value>>> + Send + 'static {
        let filter_fn = self.definition.filter_fn.clone();
        distinct(self.collection().map(move |c| filter_fn(&c.all(), &c.filter)))
    }

    pub fn count(&self) -> impl Stream<Item = usize> + Send + 'static {
        distinct(self.collection().map(|c| c.len()))
    }

    pub fn keys(&self) -> impl Stream<Item = Vec<EntityKey>> + Send + 'static {
        distinct(self.collection().map(|c| c.ids.clone()))
    }

    pub fn loading(&self) -> impl Stream<Item = bool> + Send + 'static {
        distinct(self.collection().map(|c| c.loading))
    }

    pub fn loaded(&self) -> impl Stream<Item = bool> + Send + 'static {
        distinct(self.collection().map(|c| c.loaded))
    }

    pub fn filter(&self) -> impl Stream<Item = String> + Send + 'static {
        distinct(self.collection().map(|c| c.filter.clone()))
    }

    /// Every action dispatched for this type from now on.
    ///
    /// Actions missed because the subscriber lagged are skipped with a
    /// warning.
    pub fn entity_actions(&self) -> impl Stream<Item = Arc<EntityAction>> + Send + 'static {
        let entity_name = self.definition.entity_name().to_owned();
        BroadcastStream::new(self.store.subscribe_actions()).filter_map(move |received| {
            match received {
                Ok(action) if action.entity_name == entity_name => Some(action),
                Ok(_) => None,
                Err(BroadcastStreamRecvError::Lagged(missed)) => {
                    tracing::warn!(
                        entity_name = %entity_name,
                        missed,
                        "entity action stream lagged"
                    );
                    None
                }
            }
        })
    }

    /// Persistence failures for this type, as carried by `*_ERROR` actions.
    pub fn errors(&self) -> impl Stream<Item = EntityActionError> + Send + 'static {
        self.entity_actions().filter_map(|action| {
            if !action.op.is_error() {
                return None;
            }
            action.payload.as_error().cloned()
        })
    }
}

/// Drop items equal to the one before.
fn distinct<S, T>(stream: S) -> impl Stream<Item = T> + Send + 'static
where
    S: Stream<Item = T> + Send + 'static,
    T: PartialEq + Clone + Send + 'static,
{
    let mut last: Option<T> = None;
    stream.filter_map(move |item| {
        if last.as_ref() == Some(&item) {
            return None;
        }
        last = Some(item.clone());
        Some(item)
    })
}
