//! The per-type collection reducer: the state machine that applies one
//! [`EntityAction`] to one [`EntityCollection`].

use std::sync::Arc;

use crate::action::{ActionPayload, EntityAction};
use crate::adapter::{EntityAdapter, Tracking};
use crate::collection::EntityCollection;
use crate::entity::EntityKey;
use crate::error::EntityCacheError;
use crate::metadata::EntityDefinition;
use crate::op::EntityOp;

/// Applies actions to the collection of one entity type.
///
/// # Contract
///
/// - `reduce` must be pure: no I/O, no side effects.
/// - When an action would not change the collection, return the same `Arc`
///   that was passed in, so subscribers can skip work with [`Arc::ptr_eq`].
/// - The default reducer never fails. Custom reducers may return
///   [`EntityCacheError::Reducer`] for ops that are illegal for their type;
///   the error reaches the caller of `dispatch` and the state is left
///   unchanged.
pub trait CollectionReducer: Send + Sync + 'static {
    /// Compute the next collection.
    ///
    /// # Arguments
    ///
    /// * `collection` - The current collection of `action.entity_name`.
    /// * `action` - The action to apply.
    ///
    /// # Returns
    ///
    /// The next collection, or the same `Arc` if nothing changed.
    ///
    /// # Errors
    ///
    /// Caller-defined; see the trait contract.
    fn reduce(
        &self,
        collection: &Arc<EntityCollection>,
        action: &EntityAction,
    ) -> Result<Arc<EntityCollection>, EntityCacheError>;
}

impl<F> CollectionReducer for F
where
    F: Fn(&Arc<EntityCollection>, &EntityAction) -> Result<Arc<EntityCollection>, EntityCacheError>
        + Send
        + Sync
        + 'static,
{
    fn reduce(
        &self,
        collection: &Arc<EntityCollection>,
        action: &EntityAction,
    ) -> Result<Arc<EntityCollection>, EntityCacheError> {
        self(collection, action)
    }
}

/// The standard reducer, parameterized by one type's key selector, sort
/// order and tracking policy.
#[derive(Debug, Clone)]
pub struct DefaultCollectionReducer {
    adapter: EntityAdapter,
    tracking: Tracking,
}

impl DefaultCollectionReducer {
    /// Build the reducer for `definition`.
    pub fn new(definition: &EntityDefinition) -> Self {
        Self {
            adapter: definition.adapter.clone(),
            tracking: definition.cache_tracking(),
        }
    }

    /// Apply `action` to `c`. Total: unknown ops and mismatched payloads
    /// leave the collection unchanged.
    pub fn apply(&self, c: &Arc<EntityCollection>, action: &EntityAction) -> Arc<EntityCollection> {
        use ActionPayload as P;
        use EntityOp::*;

        let a = &self.adapter;
        let track = self.tracking;
        match (action.op, &action.payload) {
            // Query life cycle
            (QueryAll | QueryByKey | QueryMany, _) => mutate(c, |n| set_flag(&mut n.loading, true)),
            (QueryAllSuccess, P::Entities(es)) => mutate(c, |n| {
                a.set_all(n, es);
                n.loaded = true;
                n.loading = false;
                true
            }),
            (QueryByKeySuccess, P::Entity(e)) => mutate(c, |n| {
                let upserted = a.upsert_one(n, e, Tracking::Off);
                set_flag(&mut n.loading, false) | upserted
            }),
            // A skipped query reports success with no data.
            (QueryAllSuccess | QueryByKeySuccess | QueryManySuccess, P::None) => {
                mutate(c, |n| set_flag(&mut n.loading, false))
            }
            (QueryManySuccess, P::Entities(es)) => mutate(c, |n| {
                let upserted = a.upsert_many(n, es, Tracking::Off);
                set_flag(&mut n.loading, false) | upserted
            }),
            (QueryAllError | QueryByKeyError | QueryManyError, _) => {
                mutate(c, |n| set_flag(&mut n.loading, false))
            }

            // Pessimistic saves change the collection only on success.
            (SaveAddOne | SaveDeleteOne | SaveUpdateOne, _) => c.clone(),
            (SaveAddOneError | SaveDeleteOneError | SaveUpdateOneError, _) => c.clone(),
            (SaveAddOneSuccess, P::Entity(e)) => mutate(c, |n| a.upsert_one(n, e, Tracking::Off)),
            (SaveDeleteOneSuccess, P::Key(k)) => mutate(c, |n| {
                let committed = a.commit_many(n, std::slice::from_ref(k));
                a.remove_one(n, k, Tracking::Off) | committed
            }),
            (SaveUpdateOneSuccess, P::Update(u)) => mutate(c, |n| {
                let new_key = a.select_id(&u.changes);
                let updated = a.update_one(n, u, Tracking::Off);
                let mut stale = vec![u.id.clone()];
                stale.extend(new_key);
                a.commit_many(n, &stale) | updated
            }),

            // Optimistic saves apply on the initiating action.
            (SaveAddOneOptimistic, P::Entity(e)) => mutate(c, |n| a.add_one(n, e, Tracking::Replace)),
            (SaveDeleteOneOptimistic, P::Key(k)) => {
                mutate(c, |n| a.remove_one(n, k, Tracking::Replace))
            }
            (SaveUpdateOneOptimistic, P::Update(u)) => {
                mutate(c, |n| a.update_one(n, u, Tracking::Replace))
            }
            (SaveAddOneOptimisticSuccess, P::Entity(e)) => mutate(c, |n| {
                let committed = match a.select_id(e) {
                    Some(k) => a.commit_many(n, &[k]),
                    None => false,
                };
                a.upsert_one(n, e, Tracking::Off) | committed
            }),
            (SaveDeleteOneOptimisticSuccess, P::Key(k)) => {
                mutate(c, |n| a.commit_many(n, std::slice::from_ref(k)))
            }
            (SaveUpdateOneOptimisticSuccess, P::Update(u)) => mutate(c, |n| {
                let new_key = a.select_id(&u.changes);
                // The optimistic update may already have moved the entity.
                let target = if n.contains(&u.id) {
                    u.id.clone()
                } else {
                    new_key
                        .clone()
                        .or_else(|| n.rekeyed.get(&u.id).cloned())
                        .unwrap_or_else(|| u.id.clone())
                };
                let mut settled = vec![u.id.clone(), target.clone()];
                settled.extend(new_key);
                let committed = a.commit_many(n, &settled);
                let mut server = u.clone();
                server.id = target;
                a.update_one(n, &server, Tracking::Off) | committed
            }),
            (
                SaveAddOneOptimisticError | SaveDeleteOneOptimisticError
                | SaveUpdateOneOptimisticError,
                P::Error(err),
            ) => {
                let keys = self.keys_to_revert(&err.original_action.payload);
                mutate(c, |n| a.undo_many(n, &keys))
            }

            // Cache-only ops
            (AddAll, P::Entities(es)) => mutate(c, |n| a.set_all(n, es)),
            (AddMany, P::Entities(es)) => mutate(c, |n| a.add_many(n, es, track)),
            (AddManyNoTrack, P::Entities(es)) => mutate(c, |n| a.add_many(n, es, Tracking::Off)),
            (AddOne, P::Entity(e)) => mutate(c, |n| a.add_one(n, e, track)),
            (AddOneNoTrack, P::Entity(e)) => mutate(c, |n| a.add_one(n, e, Tracking::Off)),
            (RemoveAll, _) => mutate(c, |n| {
                let removed = a.remove_all(n);
                let loaded = set_flag(&mut n.loaded, false);
                set_flag(&mut n.loading, false) | loaded | removed
            }),
            (RemoveMany, P::Keys(ks)) => mutate(c, |n| a.remove_many(n, ks, track)),
            (RemoveManyNoTrack, P::Keys(ks)) => mutate(c, |n| a.remove_many(n, ks, Tracking::Off)),
            (RemoveOne, P::Key(k)) => mutate(c, |n| a.remove_one(n, k, track)),
            (RemoveOneNoTrack, P::Key(k)) => mutate(c, |n| a.remove_one(n, k, Tracking::Off)),
            (UpdateMany, P::Updates(us)) => mutate(c, |n| a.update_many(n, us, track)),
            (UpdateManyNoTrack, P::Updates(us)) => {
                mutate(c, |n| a.update_many(n, us, Tracking::Off))
            }
            (UpdateOne, P::Update(u)) => mutate(c, |n| a.update_one(n, u, track)),
            (UpdateOneNoTrack, P::Update(u)) => mutate(c, |n| a.update_one(n, u, Tracking::Off)),
            (UpsertMany, P::Entities(es)) => mutate(c, |n| a.upsert_many(n, es, track)),
            (UpsertManyNoTrack, P::Entities(es)) => {
                mutate(c, |n| a.upsert_many(n, es, Tracking::Off))
            }
            (UpsertOne, P::Entity(e)) => mutate(c, |n| a.upsert_one(n, e, track)),
            (UpsertOneNoTrack, P::Entity(e)) => mutate(c, |n| a.upsert_one(n, e, Tracking::Off)),

            // Change-tracking settlement
            (CommitAll, _) => mutate(c, |n| a.commit_all(n)),
            (CommitMany, P::Keys(ks)) => mutate(c, |n| a.commit_many(n, ks)),
            (CommitOne, P::Key(k)) => mutate(c, |n| a.commit_many(n, std::slice::from_ref(k))),
            (UndoAll, _) => mutate(c, |n| a.undo_all(n)),
            (UndoMany, P::Keys(ks)) => mutate(c, |n| a.undo_many(n, ks)),
            (UndoOne, P::Key(k)) => mutate(c, |n| a.undo_many(n, std::slice::from_ref(k))),

            (SetFilter, P::Filter(pattern)) => mutate(c, |n| {
                if n.filter == *pattern {
                    return false;
                }
                n.filter = pattern.clone();
                true
            }),
            (SetLoaded, P::Flag(v)) => mutate(c, |n| set_flag(&mut n.loaded, *v)),
            (SetLoading, P::Flag(v)) => mutate(c, |n| set_flag(&mut n.loading, *v)),

            (op, _) => {
                tracing::warn!(
                    entity_name = %action.entity_name,
                    op = %op,
                    "ignoring action with unexpected payload"
                );
                c.clone()
            }
        }
    }

    // Keys whose snapshots an optimistic error must restore, read from the
    // payload of the failed request.
    fn keys_to_revert(&self, payload: &ActionPayload) -> Vec<EntityKey> {
        match payload {
            ActionPayload::Entity(e) => self.adapter.select_id(e).into_iter().collect(),
            ActionPayload::Key(k) => vec![k.clone()],
            ActionPayload::Update(u) => {
                let mut keys = vec![u.id.clone()];
                if let Some(k) = self.adapter.select_id(&u.changes)
                    && k != u.id
                {
                    keys.push(k);
                }
                keys
            }
            _ => Vec::new(),
        }
    }
}

impl CollectionReducer for DefaultCollectionReducer {
    fn reduce(
        &self,
        collection: &Arc<EntityCollection>,
        action: &EntityAction,
    ) -> Result<Arc<EntityCollection>, EntityCacheError> {
        Ok(self.apply(collection, action))
    }
}

/// Apply `f` to a copy of `c`; keep the original `Arc` unless `f` reports a
/// change.
fn mutate(
    c: &Arc<EntityCollection>,
    f: impl FnOnce(&mut EntityCollection) -> bool,
) -> Arc<EntityCollection> {
    let mut next = EntityCollection::clone(c);
    if f(&mut next) {
        Arc::new(next)
    } else {
        c.clone()
    }
}

fn set_flag(flag: &mut bool, value: bool) -> bool {
    let changed = *flag != value;
    *flag = value;
    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{EntityActionError, EntityActionFactory, EntityActionOptions};
    use crate::data_service::DataServiceError;
    use crate::entity::{Update, sort_by_field};
    use crate::metadata::EntityMetadata;
    use crate::test_fixtures::{hero_metadata, initial_heroes};
    use serde_json::json;

    fn reducer_for(metadata: EntityMetadata) -> (DefaultCollectionReducer, Arc<EntityCollection>) {
        let def = EntityDefinition::from_metadata(metadata).unwrap();
        (DefaultCollectionReducer::new(&def), def.initial_state.clone())
    }

    fn act(op: EntityOp, payload: ActionPayload) -> EntityAction {
        EntityActionFactory::new()
            .create("Hero", op, payload, EntityActionOptions::default())
            .unwrap()
    }

    fn loaded() -> (DefaultCollectionReducer, Arc<EntityCollection>) {
        let (r, c) = reducer_for(hero_metadata());
        let c = r.apply(
            &c,
            &act(EntityOp::QueryAllSuccess, ActionPayload::Entities(initial_heroes())),
        );
        (r, c)
    }

    fn keys(ns: &[i64]) -> Vec<EntityKey> {
        ns.iter().copied().map(EntityKey::Int).collect()
    }

    fn error_for(original: EntityAction) -> EntityAction {
        let factory = EntityActionFactory::new();
        let op = original.op.error().unwrap();
        factory.create_from_action(
            &original,
            op,
            ActionPayload::Error(EntityActionError {
                error: DataServiceError::new("server down"),
                original_action: Box::new(original.clone()),
            }),
            EntityActionOptions::default(),
        )
    }

    #[test]
    fn query_sets_loading_once() {
        let (r, c) = reducer_for(hero_metadata());
        let first = r.apply(&c, &act(EntityOp::QueryAll, ActionPayload::None));
        assert!(first.loading);
        let second = r.apply(&first, &act(EntityOp::QueryAll, ActionPayload::None));
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn query_all_success_replaces_everything() {
        let (r, c) = loaded();
        assert!(c.loaded && !c.loading);
        assert_eq!(c.ids, keys(&[2, 1]));

        let c = r.apply(
            &c,
            &act(
                EntityOp::QueryAllSuccess,
                ActionPayload::Entities(vec![json!({"id": 7, "name": "Q"})]),
            ),
        );
        assert_eq!(c.ids, keys(&[7]));
    }

    #[test]
    fn query_many_success_merges_and_keeps_loaded() {
        let (r, c) = reducer_for(hero_metadata());
        let c = r.apply(&c, &act(EntityOp::AddOne, ActionPayload::Entity(json!({"id": 9}))));
        let c = r.apply(&c, &act(EntityOp::QueryMany, ActionPayload::None));
        let c = r.apply(
            &c,
            &act(
                EntityOp::QueryManySuccess,
                ActionPayload::Entities(vec![json!({"id": 3})]),
            ),
        );
        assert_eq!(c.ids, keys(&[9, 3]));
        assert!(!c.loading && !c.loaded);
    }

    #[test]
    fn empty_query_many_success_on_idle_collection_is_identity() {
        let (r, c) = loaded();
        let next = r.apply(&c, &act(EntityOp::QueryManySuccess, ActionPayload::Entities(vec![])));
        assert!(Arc::ptr_eq(&c, &next));
    }

    #[test]
    fn query_by_key_success_without_entity_clears_loading_only_when_set() {
        let (r, c) = loaded();
        let same = r.apply(&c, &act(EntityOp::QueryByKeySuccess, ActionPayload::None));
        assert!(Arc::ptr_eq(&c, &same));

        let busy = r.apply(&c, &act(EntityOp::QueryByKey, ActionPayload::Key(1.into())));
        let idle = r.apply(&busy, &act(EntityOp::QueryByKeySuccess, ActionPayload::None));
        assert!(!idle.loading);
        assert_eq!(idle.ids, c.ids);
    }

    #[test]
    fn query_error_clears_loading_and_leaves_loaded() {
        let (r, c) = reducer_for(hero_metadata());
        let busy = r.apply(&c, &act(EntityOp::QueryAll, ActionPayload::None));
        let failed = r.apply(&busy, &act(EntityOp::QueryAllError, ActionPayload::None));
        assert!(!failed.loading && !failed.loaded);
    }

    #[test]
    fn add_ignores_existing_entity_and_keeps_its_arc() {
        let (r, c) = loaded();
        let before = c.get(&1.into()).unwrap().clone();
        let next = r.apply(
            &c,
            &act(EntityOp::AddOne, ActionPayload::Entity(json!({"id": 1, "name": "X"}))),
        );
        assert!(Arc::ptr_eq(&c, &next));
        assert!(Arc::ptr_eq(next.get(&1.into()).unwrap(), &before));
    }

    #[test]
    fn untouched_entities_keep_their_arcs() {
        let (r, c) = loaded();
        let one = c.get(&1.into()).unwrap().clone();
        let next = r.apply(
            &c,
            &act(EntityOp::UpdateOne, ActionPayload::Update(Update::new(2, json!({"name": "Z"})))),
        );
        assert!(!Arc::ptr_eq(&c, &next));
        assert!(Arc::ptr_eq(next.get(&1.into()).unwrap(), &one));
    }

    #[test]
    fn key_change_update_moves_entity_in_place() {
        let (r, c) = loaded();
        let next = r.apply(
            &c,
            &act(
                EntityOp::UpdateOne,
                ActionPayload::Update(Update::new(2, json!({"id": 42, "name": "Super"}))),
            ),
        );
        assert_eq!(next.ids, keys(&[42, 1]));
        assert_eq!(
            **next.get(&42.into()).unwrap(),
            json!({"id": 42, "name": "Super", "power": "Fast"})
        );
    }

    #[test]
    fn update_of_missing_key_is_identity() {
        let (r, c) = loaded();
        let next = r.apply(
            &c,
            &act(EntityOp::UpdateOne, ActionPayload::Update(Update::new(99, json!({"id": 99})))),
        );
        assert!(Arc::ptr_eq(&c, &next));
    }

    #[test]
    fn upsert_many_appends_new_keys() {
        let (r, c) = loaded();
        let next = r.apply(
            &c,
            &act(
                EntityOp::UpsertMany,
                ActionPayload::Entities(vec![json!({"id": 13, "name": "New One", "power": "Strong"})]),
            ),
        );
        assert_eq!(next.ids, keys(&[2, 1, 13]));
    }

    #[test]
    fn sort_invariant_holds_across_mutations() {
        let (r, c) = reducer_for(hero_metadata().with_sort_comparer(sort_by_field("name")));
        let c = r.apply(
            &c,
            &act(EntityOp::QueryAllSuccess, ActionPayload::Entities(initial_heroes())),
        );
        assert_eq!(c.ids, keys(&[1, 2]));
        let c = r.apply(
            &c,
            &act(EntityOp::UpsertOne, ActionPayload::Entity(json!({"id": 5, "name": "AB"}))),
        );
        let c = r.apply(
            &c,
            &act(EntityOp::UpdateOne, ActionPayload::Update(Update::new(1, json!({"id": 1, "name": "Z"})))),
        );
        assert_eq!(c.ids, keys(&[5, 2, 1]));
    }

    #[test]
    fn remove_all_empties_and_resets_flags() {
        let (r, c) = loaded();
        let next = r.apply(&c, &act(EntityOp::RemoveAll, ActionPayload::None));
        assert!(next.is_empty());
        assert!(!next.loaded && !next.loading);
        assert_eq!(next.entity_name, "Hero");
    }

    #[test]
    fn pessimistic_delete_removes_only_on_success() {
        let (r, c) = loaded();
        let next = r.apply(&c, &act(EntityOp::SaveDeleteOne, ActionPayload::Key(2.into())));
        assert!(Arc::ptr_eq(&c, &next));
        let next = r.apply(&next, &act(EntityOp::SaveDeleteOneSuccess, ActionPayload::Key(2.into())));
        assert_eq!(next.ids, keys(&[1]));
    }

    #[test]
    fn optimistic_delete_error_restores_exact_entity() {
        let (r, c) = loaded();
        let before = c.get(&2.into()).unwrap().clone();
        let delete = act(EntityOp::SaveDeleteOneOptimistic, ActionPayload::Key(2.into()));
        let removed = r.apply(&c, &delete);
        assert_eq!(removed.ids, keys(&[1]));
        assert!(removed.original_values.contains_key(&2.into()));

        let restored = r.apply(&removed, &error_for(delete));
        assert!(Arc::ptr_eq(restored.get(&2.into()).unwrap(), &before));
        assert!(restored.original_values.is_empty());
    }

    #[test]
    fn optimistic_add_error_removes_speculative_entity() {
        let (r, c) = loaded();
        let add = act(
            EntityOp::SaveAddOneOptimistic,
            ActionPayload::Entity(json!({"id": 3, "name": "C"})),
        );
        let added = r.apply(&c, &add);
        assert_eq!(added.ids, keys(&[2, 1, 3]));
        let reverted = r.apply(&added, &error_for(add));
        assert_eq!(reverted.ids, keys(&[2, 1]));
        assert!(!reverted.has_changes());
    }

    #[test]
    fn optimistic_update_error_undoes_key_change() {
        let (r, c) = loaded();
        let update = act(
            EntityOp::SaveUpdateOneOptimistic,
            ActionPayload::Update(Update::new(2, json!({"id": 42, "name": "Super"}))),
        );
        let changed = r.apply(&c, &update);
        assert_eq!(changed.ids, keys(&[42, 1]));
        let reverted = r.apply(&changed, &error_for(update));
        assert_eq!(*reverted, *c);
    }

    #[test]
    fn optimistic_success_clears_snapshot() {
        let (r, c) = loaded();
        let update = Update::new(1, json!({"id": 1, "name": "Q"}));
        let changed = r.apply(
            &c,
            &act(EntityOp::SaveUpdateOneOptimistic, ActionPayload::Update(update.clone())),
        );
        assert!(changed.has_changes());
        let settled = r.apply(
            &changed,
            &act(EntityOp::SaveUpdateOneOptimisticSuccess, ActionPayload::Update(update)),
        );
        assert!(!settled.has_changes());
        assert_eq!(settled.get(&1.into()).unwrap()["name"], "Q");
    }

    #[test]
    fn optimistic_key_change_settles_both_keys_on_bare_success() {
        let (r, c) = loaded();
        let changed = r.apply(
            &c,
            &act(
                EntityOp::SaveUpdateOneOptimistic,
                ActionPayload::Update(Update::new(2, json!({"id": 42}))),
            ),
        );
        assert_eq!(changed.rekeyed.get(&EntityKey::Int(2)), Some(&EntityKey::Int(42)));

        // The server echoes the request key with no changes.
        let settled = r.apply(
            &changed,
            &act(
                EntityOp::SaveUpdateOneOptimisticSuccess,
                ActionPayload::Update(Update::new(2, json!({}))),
            ),
        );
        assert_eq!(settled.ids, keys(&[42, 1]));
        assert!(settled.original_values.is_empty());
        assert!(settled.rekeyed.is_empty());
    }

    #[test]
    fn optimistic_key_change_success_applies_server_changes_at_new_key() {
        let (r, c) = loaded();
        let changed = r.apply(
            &c,
            &act(
                EntityOp::SaveUpdateOneOptimistic,
                ActionPayload::Update(Update::new(2, json!({"id": 42}))),
            ),
        );
        let settled = r.apply(
            &changed,
            &act(
                EntityOp::SaveUpdateOneOptimisticSuccess,
                ActionPayload::Update(Update::new(2, json!({"name": "Server"}))),
            ),
        );
        assert_eq!(settled.get(&42.into()).unwrap()["name"], "Server");
        assert!(!settled.has_changes());
    }

    #[test]
    fn committing_new_key_settles_the_old_one() {
        let (r, c) = loaded();
        let c = r.apply(
            &c,
            &act(EntityOp::UpdateOne, ActionPayload::Update(Update::new(2, json!({"id": 7})))),
        );
        assert_eq!(c.original_values.len(), 2);
        let c = r.apply(&c, &act(EntityOp::CommitOne, ActionPayload::Key(7.into())));
        assert!(!c.has_changes());
        assert!(c.rekeyed.is_empty());
        assert_eq!(c.ids, keys(&[7, 1]));
    }

    #[test]
    fn save_update_success_discards_snapshot_under_old_key() {
        let (r, c) = loaded();
        let c = r.apply(&c, &act(EntityOp::UpdateOne, ActionPayload::Update(Update::new(2, json!({"name": "T"})))));
        assert!(c.has_changes());
        let c = r.apply(
            &c,
            &act(
                EntityOp::SaveUpdateOneSuccess,
                ActionPayload::Update(Update::new(2, json!({"id": 20}))),
            ),
        );
        assert_eq!(c.ids, keys(&[20, 1]));
        assert!(!c.has_changes());
    }

    #[test]
    fn tracked_ops_can_be_undone_and_committed() {
        let (r, c) = loaded();
        let c1 = r.apply(&c, &act(EntityOp::RemoveOne, ActionPayload::Key(1.into())));
        let c2 = r.apply(&c1, &act(EntityOp::UndoOne, ActionPayload::Key(1.into())));
        assert_eq!(*c2, *c);

        let c3 = r.apply(&c, &act(EntityOp::RemoveOne, ActionPayload::Key(1.into())));
        let c4 = r.apply(&c3, &act(EntityOp::CommitAll, ActionPayload::None));
        assert_eq!(c4.ids, keys(&[2]));
        assert!(!c4.has_changes());
    }

    #[test]
    fn no_track_ops_record_nothing() {
        let (r, c) = loaded();
        let next = r.apply(&c, &act(EntityOp::RemoveOneNoTrack, ActionPayload::Key(1.into())));
        assert!(!next.has_changes());

        let (r, c) = reducer_for(hero_metadata().with_no_change_tracking(true));
        let next = r.apply(&c, &act(EntityOp::AddOne, ActionPayload::Entity(json!({"id": 1}))));
        assert!(!next.has_changes());
    }

    #[test]
    fn flags_and_filter_are_set_directly() {
        let (r, c) = reducer_for(hero_metadata());
        let c = r.apply(&c, &act(EntityOp::SetLoaded, ActionPayload::Flag(true)));
        assert!(c.loaded);
        let c = r.apply(&c, &act(EntityOp::SetLoading, ActionPayload::Flag(true)));
        assert!(c.loading);
        let c = r.apply(&c, &act(EntityOp::SetFilter, ActionPayload::Filter("wind".into())));
        assert_eq!(c.filter, "wind");
        let same = r.apply(&c, &act(EntityOp::SetFilter, ActionPayload::Filter("wind".into())));
        assert!(Arc::ptr_eq(&c, &same));
    }

    #[test]
    fn mismatched_payload_is_identity() {
        let (r, c) = loaded();
        let next = r.apply(&c, &act(EntityOp::RemoveOne, ActionPayload::Filter("x".into())));
        assert!(Arc::ptr_eq(&c, &next));
    }

    #[test]
    fn closures_are_collection_reducers() {
        let custom = |c: &Arc<EntityCollection>, action: &EntityAction| {
            if action.op == EntityOp::RemoveAll {
                return Err(EntityCacheError::Reducer {
                    entity_name: action.entity_name.clone(),
                    op: action.op.to_string(),
                    reason: "heroes are forever".into(),
                });
            }
            Ok(c.clone())
        };
        let c = Arc::new(EntityCollection::new("Hero"));
        assert!(custom.reduce(&c, &act(EntityOp::RemoveAll, ActionPayload::None)).is_err());
        let same = custom.reduce(&c, &act(EntityOp::QueryAll, ActionPayload::None)).unwrap();
        assert!(Arc::ptr_eq(&c, &same));
    }
}
