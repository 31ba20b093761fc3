//! Entity actions, their payloads, and the factory that builds them.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::data_service::DataServiceError;
use crate::entity::{EntityKey, Update};
use crate::error::EntityCacheError;
use crate::op::EntityOp;

/// Query parameters for a `QUERY_MANY` request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum QueryParams {
    /// A raw, already-encoded query string such as `"name=Sky&age=3"`.
    Raw(String),
    /// Ordered name/value pairs.
    Pairs(Vec<(String, String)>),
}

impl QueryParams {
    /// Build a pair list from anything iterable.
    pub fn pairs<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        QueryParams::Pairs(
            pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    /// Render as a query string (without the leading `?`).
    pub fn to_query_string(&self) -> String {
        match self {
            QueryParams::Raw(s) => s.clone(),
            QueryParams::Pairs(pairs) => pairs
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect::<Vec<_>>()
                .join("&"),
        }
    }
}

impl fmt::Display for QueryParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_query_string())
    }
}

/// Payload of an error action: the structured service error plus the action
/// that triggered the failed request.
///
/// Optimistic reversal reads the entity, key or update it must undo from
/// `original_action.payload`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityActionError {
    /// The normalized data-service failure.
    pub error: DataServiceError,
    /// The persistence action whose request failed.
    pub original_action: Box<EntityAction>,
}

/// The payload carried by an [`EntityAction`].
///
/// Each op expects one specific variant; the guard checks the shape before
/// dispatch and the reducer ignores mismatches.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub enum ActionPayload {
    /// No payload.
    #[default]
    None,
    /// A single entity.
    Entity(Value),
    /// A list of entities.
    Entities(Vec<Value>),
    /// A single key.
    Key(EntityKey),
    /// A list of keys.
    Keys(Vec<EntityKey>),
    /// A single-entity patch.
    Update(Update),
    /// A list of patches.
    Updates(Vec<Update>),
    /// Query parameters for `QUERY_MANY`.
    Query(QueryParams),
    /// A filter pattern for `SET_FILTER`.
    Filter(String),
    /// A flag value for `SET_LOADED` / `SET_LOADING`.
    Flag(bool),
    /// A failed persistence request.
    Error(EntityActionError),
}

impl ActionPayload {
    /// The entity, if this payload carries exactly one.
    pub fn as_entity(&self) -> Option<&Value> {
        match self {
            ActionPayload::Entity(e) => Some(e),
            _ => None,
        }
    }

    /// The entity list, if this payload carries one.
    pub fn as_entities(&self) -> Option<&[Value]> {
        match self {
            ActionPayload::Entities(e) => Some(e),
            _ => None,
        }
    }

    /// The key, if this payload carries exactly one.
    pub fn as_key(&self) -> Option<&EntityKey> {
        match self {
            ActionPayload::Key(k) => Some(k),
            _ => None,
        }
    }

    /// The key list, if this payload carries one.
    pub fn as_keys(&self) -> Option<&[EntityKey]> {
        match self {
            ActionPayload::Keys(k) => Some(k),
            _ => None,
        }
    }

    /// The update, if this payload carries exactly one.
    pub fn as_update(&self) -> Option<&Update> {
        match self {
            ActionPayload::Update(u) => Some(u),
            _ => None,
        }
    }

    /// The update list, if this payload carries one.
    pub fn as_updates(&self) -> Option<&[Update]> {
        match self {
            ActionPayload::Updates(u) => Some(u),
            _ => None,
        }
    }

    /// The error, if this payload reports a failed request.
    pub fn as_error(&self) -> Option<&EntityActionError> {
        match self {
            ActionPayload::Error(e) => Some(e),
            _ => None,
        }
    }

    /// `true` for [`ActionPayload::None`].
    pub fn is_none(&self) -> bool {
        matches!(self, ActionPayload::None)
    }
}

/// An action addressed to one entity collection.
///
/// Built once by [`EntityActionFactory`] and never mutated afterwards. The
/// reducer dispatches on [`op`](EntityAction::op); `type_name` is purely
/// descriptive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityAction {
    /// Human-readable type, e.g. `"[Hero] QUERY_ALL"`.
    #[serde(rename = "type")]
    pub type_name: String,
    /// Name of the target entity type.
    pub entity_name: String,
    /// Operation code.
    pub op: EntityOp,
    /// Operation payload.
    #[serde(default)]
    pub payload: ActionPayload,
    /// Links a persistence request to its success or error action.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    /// Label used in the type string; defaults to the entity name.
    pub tag: String,
    /// Whether the originating save was applied optimistically.
    #[serde(default)]
    pub is_optimistic: bool,
    /// Tells the effect runner to report success without calling the
    /// data service.
    #[serde(default)]
    pub skip: bool,
}

/// Optional fields for building an action.
///
/// # Examples
///
/// ```
/// use entity_cache::EntityActionOptions;
///
/// let opts = EntityActionOptions::default()
///     .with_correlation_id("crid-1")
///     .with_optimistic(true);
/// assert_eq!(opts.correlation_id.as_deref(), Some("crid-1"));
/// assert_eq!(opts.is_optimistic, Some(true));
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EntityActionOptions {
    /// Overrides the entity name when building from a prior action.
    pub entity_name: Option<String>,
    /// Correlation id to stamp on the action.
    pub correlation_id: Option<String>,
    /// Tag for the type string.
    pub tag: Option<String>,
    /// Optimistic flag.
    pub is_optimistic: Option<bool>,
    /// Skip flag.
    pub skip: Option<bool>,
}

impl EntityActionOptions {
    /// Override the entity name.
    pub fn with_entity_name(mut self, name: impl Into<String>) -> Self {
        self.entity_name = Some(name.into());
        self
    }

    /// Set the correlation id.
    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    /// Set the tag.
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    /// Set the optimistic flag.
    pub fn with_optimistic(mut self, optimistic: bool) -> Self {
        self.is_optimistic = Some(optimistic);
        self
    }

    /// Set the skip flag.
    pub fn with_skip(mut self, skip: bool) -> Self {
        self.skip = Some(skip);
        self
    }
}

/// Formats an action type string from its tag and op.
pub type TypeFormatter = Arc<dyn Fn(&str, EntityOp) -> String + Send + Sync>;

/// Builds well-formed [`EntityAction`]s.
///
/// The type string defaults to `"[{tag}] {op}"` and can be replaced with
/// [`with_formatter`](EntityActionFactory::with_formatter).
#[derive(Clone)]
pub struct EntityActionFactory {
    formatter: TypeFormatter,
}

impl fmt::Debug for EntityActionFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityActionFactory").finish_non_exhaustive()
    }
}

impl Default for EntityActionFactory {
    fn default() -> Self {
        Self {
            formatter: Arc::new(|tag: &str, op: EntityOp| format!("[{tag}] {op}")),
        }
    }
}

impl EntityActionFactory {
    /// Factory with the default type format.
    pub fn new() -> Self {
        Self::default()
    }

    /// Factory with a custom type formatter.
    pub fn with_formatter(
        formatter: impl Fn(&str, EntityOp) -> String + Send + Sync + 'static,
    ) -> Self {
        Self {
            formatter: Arc::new(formatter),
        }
    }

    /// Format the type string for `op` under `tag`.
    pub fn format_action_type(&self, tag: &str, op: EntityOp) -> String {
        (self.formatter)(tag, op)
    }

    /// Create an action from scratch.
    ///
    /// # Arguments
    ///
    /// * `entity_name` - Target entity type. Surrounding whitespace is
    ///   trimmed.
    /// * `op` - Operation code.
    /// * `payload` - Operation payload.
    /// * `options` - Correlation id, tag, optimistic and skip flags.
    ///
    /// # Errors
    ///
    /// Returns [`EntityCacheError::MissingEntityName`] if `entity_name` is
    /// empty after trimming.
    pub fn create(
        &self,
        entity_name: &str,
        op: EntityOp,
        payload: ActionPayload,
        options: EntityActionOptions,
    ) -> Result<EntityAction, EntityCacheError> {
        let entity_name = entity_name.trim();
        if entity_name.is_empty() {
            return Err(EntityCacheError::MissingEntityName);
        }
        let tag = options.tag.unwrap_or_else(|| entity_name.to_owned());
        Ok(EntityAction {
            type_name: self.format_action_type(&tag, op),
            entity_name: entity_name.to_owned(),
            op,
            payload,
            correlation_id: options.correlation_id,
            tag,
            is_optimistic: options.is_optimistic.unwrap_or(false),
            skip: options.skip.unwrap_or(false),
        })
    }

    /// Create an action that follows from `prior`.
    ///
    /// Entity name, tag, correlation id and the optimistic flag are carried
    /// forward unless `options` overrides them. The skip flag is not
    /// carried.
    pub fn create_from_action(
        &self,
        prior: &EntityAction,
        op: EntityOp,
        payload: ActionPayload,
        options: EntityActionOptions,
    ) -> EntityAction {
        let entity_name = options
            .entity_name
            .unwrap_or_else(|| prior.entity_name.clone());
        let tag = options.tag.unwrap_or_else(|| prior.tag.clone());
        EntityAction {
            type_name: self.format_action_type(&tag, op),
            entity_name,
            op,
            payload,
            correlation_id: options
                .correlation_id
                .or_else(|| prior.correlation_id.clone()),
            tag,
            is_optimistic: options.is_optimistic.unwrap_or(prior.is_optimistic),
            skip: options.skip.unwrap_or(false),
        }
    }
}
