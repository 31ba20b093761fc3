//! Crate-level error types for configuration, payload validation, and
//! persistence completion.

use crate::data_service::DataServiceError;

/// Error raised when the cache is misconfigured or an action is malformed.
///
/// Every variant describes a programming mistake rather than a runtime
/// condition: an entity type that was never registered, an action built
/// without an entity name, or a payload that cannot resolve a key. They are
/// returned synchronously, before any state changes.
#[derive(Debug, thiserror::Error)]
pub enum EntityCacheError {
    /// No metadata was registered for the entity type.
    #[error("no EntityDefinition for entity type \"{0}\"")]
    NoDefinition(String),

    /// An action was constructed without an entity name.
    #[error("missing entity name for new action")]
    MissingEntityName,

    /// Metadata was registered with an empty (or whitespace-only) name.
    #[error("entity metadata must have a non-empty entity name")]
    InvalidEntityName,

    /// The action payload does not have the shape its op requires.
    ///
    /// `action_type` is the human-readable action type (e.g.
    /// `"[Hero] SAVE_ADD_ONE"`); `reason` names the specific defect.
    #[error("\"{action_type}\" {reason}")]
    InvalidPayload {
        /// Human-readable type of the rejected action.
        action_type: String,
        /// What is wrong with the payload.
        reason: String,
    },

    /// A typed value could not be converted to or from its JSON form.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A custom collection reducer rejected an action.
    #[error("reducer for \"{entity_name}\" rejected {op}: {reason}")]
    Reducer {
        /// Entity type whose reducer failed.
        entity_name: String,
        /// Canonical op string of the rejected action.
        op: String,
        /// Reason supplied by the reducer.
        reason: String,
    },
}

/// Error delivered by a dispatcher [`Completion`](crate::Completion).
#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    /// The data service reported a failure for this request.
    #[error(transparent)]
    Service(DataServiceError),

    /// The store was dropped before a terminal action arrived.
    #[error("store closed before the request completed")]
    Closed,

    /// The success action carried a payload of the wrong shape.
    #[error("unexpected success payload, expected {expected}")]
    UnexpectedPayload {
        /// Description of the payload shape the caller expected.
        expected: &'static str,
    },
}

/// Error returned by the effect runner lifecycle.
#[derive(Debug, thiserror::Error)]
pub enum EffectsError {
    /// [`EntityStore::start_effects`](crate::EntityStore::start_effects) was
    /// called while a runner is already active.
    #[error("entity effects are already running")]
    AlreadyRunning,

    /// The runner task panicked or was cancelled.
    #[error("entity effects task failed: {0}")]
    Join(String),
}
