//! The entity operation vocabulary: the alphabet of the collection state
//! machine.
//!
//! Ops fall into three families. Query ops (`QUERY_*`) and save ops
//! (`SAVE_*`) imply a round trip to a data service and come with `_SUCCESS`
//! and `_ERROR` variants; cache-only ops touch nothing but the local
//! collection. The suffixed variants are derived by plain string
//! concatenation with [`OP_SUCCESS`] / [`OP_ERROR`], so any op can be
//! classified with `ends_with` and no lookup table.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Suffix appended to an op to form its success op.
pub const OP_SUCCESS: &str = "_SUCCESS";

/// Suffix appended to an op to form its error op.
pub const OP_ERROR: &str = "_ERROR";

macro_rules! entity_ops {
    ($($variant:ident => $name:literal,)+) => {
        /// Operation code carried by every [`EntityAction`](crate::EntityAction).
        ///
        /// The reducer switches on this value, never on the human-readable
        /// action type string.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum EntityOp {
            $(
                #[doc = concat!("`", $name, "`")]
                $variant,
            )+
        }

        impl EntityOp {
            /// Every op, in declaration order.
            pub const ALL: &'static [EntityOp] = &[$(EntityOp::$variant,)+];

            /// Canonical string form, e.g. `"SAVE_ADD_ONE_OPTIMISTIC"`.
            pub const fn as_str(self) -> &'static str {
                match self {
                    $(EntityOp::$variant => $name,)+
                }
            }
        }

        impl FromStr for EntityOp {
            type Err = UnknownOp;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($name => Ok(EntityOp::$variant),)+
                    other => Err(UnknownOp(other.to_owned())),
                }
            }
        }
    };
}

entity_ops! {
    QueryAll => "QUERY_ALL",
    QueryAllSuccess => "QUERY_ALL_SUCCESS",
    QueryAllError => "QUERY_ALL_ERROR",
    QueryByKey => "QUERY_BY_KEY",
    QueryByKeySuccess => "QUERY_BY_KEY_SUCCESS",
    QueryByKeyError => "QUERY_BY_KEY_ERROR",
    QueryMany => "QUERY_MANY",
    QueryManySuccess => "QUERY_MANY_SUCCESS",
    QueryManyError => "QUERY_MANY_ERROR",

    SaveAddOne => "SAVE_ADD_ONE",
    SaveAddOneSuccess => "SAVE_ADD_ONE_SUCCESS",
    SaveAddOneError => "SAVE_ADD_ONE_ERROR",
    SaveAddOneOptimistic => "SAVE_ADD_ONE_OPTIMISTIC",
    SaveAddOneOptimisticSuccess => "SAVE_ADD_ONE_OPTIMISTIC_SUCCESS",
    SaveAddOneOptimisticError => "SAVE_ADD_ONE_OPTIMISTIC_ERROR",
    SaveDeleteOne => "SAVE_DELETE_ONE",
    SaveDeleteOneSuccess => "SAVE_DELETE_ONE_SUCCESS",
    SaveDeleteOneError => "SAVE_DELETE_ONE_ERROR",
    SaveDeleteOneOptimistic => "SAVE_DELETE_ONE_OPTIMISTIC",
    SaveDeleteOneOptimisticSuccess => "SAVE_DELETE_ONE_OPTIMISTIC_SUCCESS",
    SaveDeleteOneOptimisticError => "SAVE_DELETE_ONE_OPTIMISTIC_ERROR",
    SaveUpdateOne => "SAVE_UPDATE_ONE",
    SaveUpdateOneSuccess => "SAVE_UPDATE_ONE_SUCCESS",
    SaveUpdateOneError => "SAVE_UPDATE_ONE_ERROR",
    SaveUpdateOneOptimistic => "SAVE_UPDATE_ONE_OPTIMISTIC",
    SaveUpdateOneOptimisticSuccess => "SAVE_UPDATE_ONE_OPTIMISTIC_SUCCESS",
    SaveUpdateOneOptimisticError => "SAVE_UPDATE_ONE_OPTIMISTIC_ERROR",

    AddAll => "ADD_ALL",
    AddMany => "ADD_MANY",
    AddManyNoTrack => "ADD_MANY_NO_TRACK",
    AddOne => "ADD_ONE",
    AddOneNoTrack => "ADD_ONE_NO_TRACK",
    RemoveAll => "REMOVE_ALL",
    RemoveMany => "REMOVE_MANY",
    RemoveManyNoTrack => "REMOVE_MANY_NO_TRACK",
    RemoveOne => "REMOVE_ONE",
    RemoveOneNoTrack => "REMOVE_ONE_NO_TRACK",
    UpdateMany => "UPDATE_MANY",
    UpdateManyNoTrack => "UPDATE_MANY_NO_TRACK",
    UpdateOne => "UPDATE_ONE",
    UpdateOneNoTrack => "UPDATE_ONE_NO_TRACK",
    UpsertMany => "UPSERT_MANY",
    UpsertManyNoTrack => "UPSERT_MANY_NO_TRACK",
    UpsertOne => "UPSERT_ONE",
    UpsertOneNoTrack => "UPSERT_ONE_NO_TRACK",

    CommitAll => "COMMIT_ALL",
    CommitMany => "COMMIT_MANY",
    CommitOne => "COMMIT_ONE",
    UndoAll => "UNDO_ALL",
    UndoMany => "UNDO_MANY",
    UndoOne => "UNDO_ONE",

    SetFilter => "SET_FILTER",
    SetLoaded => "SET_LOADED",
    SetLoading => "SET_LOADING",
}

/// A string that names no [`EntityOp`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown entity op \"{0}\"")]
pub struct UnknownOp(pub String);

impl EntityOp {
    /// `true` if this op reports a successful persistence call.
    pub fn is_success(self) -> bool {
        self.as_str().ends_with(OP_SUCCESS)
    }

    /// `true` if this op reports a failed persistence call.
    pub fn is_error(self) -> bool {
        self.as_str().ends_with(OP_ERROR)
    }

    /// `true` for success or error ops.
    pub fn is_terminal(self) -> bool {
        self.is_success() || self.is_error()
    }

    /// The success op for this op, e.g. `QUERY_ALL` -> `QUERY_ALL_SUCCESS`.
    ///
    /// Returns `None` for ops that have no success variant (cache-only ops
    /// and ops that are already terminal).
    pub fn success(self) -> Option<EntityOp> {
        format!("{}{OP_SUCCESS}", self.as_str()).parse().ok()
    }

    /// The error op for this op, e.g. `SAVE_ADD_ONE` -> `SAVE_ADD_ONE_ERROR`.
    pub fn error(self) -> Option<EntityOp> {
        format!("{}{OP_ERROR}", self.as_str()).parse().ok()
    }

    /// `true` for the ops that trigger a data-service call.
    pub fn is_persist(self) -> bool {
        matches!(
            self,
            EntityOp::QueryAll
                | EntityOp::QueryByKey
                | EntityOp::QueryMany
                | EntityOp::SaveAddOne
                | EntityOp::SaveAddOneOptimistic
                | EntityOp::SaveDeleteOne
                | EntityOp::SaveDeleteOneOptimistic
                | EntityOp::SaveUpdateOne
                | EntityOp::SaveUpdateOneOptimistic
        )
    }

    /// `true` for the optimistic save ops and their outcomes.
    pub fn is_optimistic(self) -> bool {
        self.as_str().contains("_OPTIMISTIC")
    }
}

impl fmt::Display for EntityOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// Serialized as the canonical string so logs and devtools read naturally.
impl Serialize for EntityOp {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for EntityOp {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_and_error_are_built_by_concatenation() {
        assert_eq!(EntityOp::QueryAll.success(), Some(EntityOp::QueryAllSuccess));
        assert_eq!(EntityOp::QueryMany.error(), Some(EntityOp::QueryManyError));
        assert_eq!(
            EntityOp::SaveUpdateOneOptimistic.error(),
            Some(EntityOp::SaveUpdateOneOptimisticError)
        );
    }

    #[test]
    fn cache_ops_have_no_terminal_variants() {
        assert_eq!(EntityOp::AddOne.success(), None);
        assert_eq!(EntityOp::SetFilter.error(), None);
        assert_eq!(EntityOp::QueryAllSuccess.success(), None);
    }

    #[test]
    fn every_persist_op_has_both_outcomes() {
        for op in EntityOp::ALL.iter().filter(|op| op.is_persist()) {
            let ok = op.success().expect("persist op must have success");
            let err = op.error().expect("persist op must have error");
            assert!(ok.is_success() && !ok.is_error(), "{ok}");
            assert!(err.is_error() && !err.is_success(), "{err}");
        }
    }

    #[test]
    fn classification_by_suffix() {
        assert!(EntityOp::SaveDeleteOneOptimisticSuccess.is_success());
        assert!(EntityOp::QueryByKeyError.is_error());
        assert!(!EntityOp::UpsertMany.is_terminal());
        assert!(EntityOp::SaveAddOneOptimistic.is_optimistic());
        assert!(!EntityOp::SaveAddOne.is_optimistic());
    }

    #[test]
    fn string_round_trip_covers_every_op() {
        for op in EntityOp::ALL {
            assert_eq!(op.as_str().parse::<EntityOp>(), Ok(*op));
        }
        assert_eq!(
            "NOPE".parse::<EntityOp>(),
            Err(UnknownOp("NOPE".to_string()))
        );
    }

    #[test]
    fn serializes_as_canonical_string() {
        let json = serde_json::to_value(EntityOp::UpsertOneNoTrack).unwrap();
        assert_eq!(json, serde_json::json!("UPSERT_ONE_NO_TRACK"));
    }
}
