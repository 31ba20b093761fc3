//! Payload-shape checks run before an action is dispatched.

use serde_json::Value;

use crate::action::{ActionPayload, EntityAction};
use crate::entity::{EntityKey, KeySelector, Update};
use crate::error::EntityCacheError;

/// Validates that an action's payload has the shape its op needs.
///
/// Every check returns the payload on success and an
/// [`EntityCacheError::InvalidPayload`] naming the action type and the
/// defect otherwise. A failed check is a caller bug; nothing is dispatched.
#[derive(Clone)]
pub struct EntityActionGuard {
    select_id: KeySelector,
}

impl std::fmt::Debug for EntityActionGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityActionGuard").finish_non_exhaustive()
    }
}

impl EntityActionGuard {
    /// A guard that resolves keys with `select_id`.
    pub fn new(select_id: KeySelector) -> Self {
        Self { select_id }
    }

    /// The payload must be one entity with a resolvable key.
    pub fn must_be_entity<'a>(&self, action: &'a EntityAction) -> Result<&'a Value, EntityCacheError> {
        let Some(entity) = action.payload.as_entity() else {
            return Err(invalid(action, "payload should have a single entity"));
        };
        if (self.select_id)(entity).is_none() {
            return Err(invalid(
                action,
                "payload has a missing or invalid entity key (id)",
            ));
        }
        Ok(entity)
    }

    /// The payload must be a list of entities, each with a resolvable key.
    ///
    /// The error names the 1-based index of the first bad item.
    pub fn must_be_entities<'a>(
        &self,
        action: &'a EntityAction,
    ) -> Result<&'a [Value], EntityCacheError> {
        let Some(entities) = action.payload.as_entities() else {
            return Err(invalid(action, "payload should be an array of entities"));
        };
        if let Some(index) = entities.iter().position(|e| (self.select_id)(e).is_none()) {
            return Err(invalid(
                action,
                &format!(
                    "payload, item {}, does not have a valid entity key (id)",
                    index + 1
                ),
            ));
        }
        Ok(entities)
    }

    /// The payload must be a single key.
    pub fn must_be_key<'a>(&self, action: &'a EntityAction) -> Result<&'a EntityKey, EntityCacheError> {
        action
            .payload
            .as_key()
            .ok_or_else(|| invalid(action, "payload should be a key"))
    }

    /// The payload must be a list of keys.
    pub fn must_be_keys<'a>(
        &self,
        action: &'a EntityAction,
    ) -> Result<&'a [EntityKey], EntityCacheError> {
        action
            .payload
            .as_keys()
            .ok_or_else(|| invalid(action, "payload should be an array of keys"))
    }

    /// The payload must be one update whose `changes` resolve a key.
    pub fn must_be_update<'a>(&self, action: &'a EntityAction) -> Result<&'a Update, EntityCacheError> {
        let Some(update) = action.payload.as_update() else {
            return Err(invalid(action, "payload should be a single entity update"));
        };
        if (self.select_id)(&update.changes).is_none() {
            return Err(invalid(
                action,
                "payload has a missing or invalid entity key (id)",
            ));
        }
        Ok(update)
    }

    /// The payload must be a list of updates whose `changes` resolve keys.
    pub fn must_be_updates<'a>(
        &self,
        action: &'a EntityAction,
    ) -> Result<&'a [Update], EntityCacheError> {
        let Some(updates) = action.payload.as_updates() else {
            return Err(invalid(action, "payload should be an array of entity updates"));
        };
        if let Some(index) = updates
            .iter()
            .position(|u| (self.select_id)(&u.changes).is_none())
        {
            return Err(invalid(
                action,
                &format!(
                    "payload, item {}, does not have a valid entity key (id)",
                    index + 1
                ),
            ));
        }
        Ok(updates)
    }

    /// Run the check that matches the action's payload variant.
    ///
    /// Payloads that carry no entity or key (filters, flags, queries) pass.
    pub fn check(&self, action: &EntityAction) -> Result<(), EntityCacheError> {
        match &action.payload {
            ActionPayload::Entity(_) => self.must_be_entity(action).map(|_| ()),
            ActionPayload::Entities(_) => self.must_be_entities(action).map(|_| ()),
            ActionPayload::Key(_) => self.must_be_key(action).map(|_| ()),
            ActionPayload::Keys(_) => self.must_be_keys(action).map(|_| ()),
            ActionPayload::Update(_) => self.must_be_update(action).map(|_| ()),
            ActionPayload::Updates(_) => self.must_be_updates(action).map(|_| ()),
            _ => Ok(()),
        }
    }
}

fn invalid(action: &EntityAction, reason: &str) -> EntityCacheError {
    EntityCacheError::InvalidPayload {
        action_type: action.type_name.clone(),
        reason: reason.to_owned(),
    }
}
