//! Entity keys, partial updates, and the pluggable strategy types that
//! entity metadata closes over.

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// An entity's primary key: a string or an integer.
///
/// Serialized untagged, so `42` and `"abc"` round-trip as plain JSON
/// scalars.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EntityKey {
    /// Integer key.
    Int(i64),
    /// String key.
    Str(String),
}

impl EntityKey {
    /// Interpret a JSON value as a key.
    ///
    /// Only integers and strings qualify. Floats, booleans, `null`, arrays
    /// and objects return `None`.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => n.as_i64().map(EntityKey::Int),
            Value::String(s) => Some(EntityKey::Str(s.clone())),
            _ => None,
        }
    }

    /// The JSON form of this key.
    pub fn to_value(&self) -> Value {
        match self {
            EntityKey::Int(n) => Value::from(*n),
            EntityKey::Str(s) => Value::String(s.clone()),
        }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityKey::Int(n) => write!(f, "{n}"),
            EntityKey::Str(s) => f.write_str(s),
        }
    }
}

impl From<i64> for EntityKey {
    fn from(n: i64) -> Self {
        EntityKey::Int(n)
    }
}

impl From<i32> for EntityKey {
    fn from(n: i32) -> Self {
        EntityKey::Int(n.into())
    }
}

impl From<&str> for EntityKey {
    fn from(s: &str) -> Self {
        EntityKey::Str(s.to_owned())
    }
}

impl From<String> for EntityKey {
    fn from(s: String) -> Self {
        EntityKey::Str(s)
    }
}

/// A single-entity patch: the key of the entity to change and the fields
/// to change on it.
///
/// `changes` is a partial JSON object. When the key selector applied to
/// `changes` yields a key different from `id`, the update moves the entity
/// to that new key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Update {
    /// Key of the entity as currently stored.
    pub id: EntityKey,
    /// Fields to merge into the stored entity.
    pub changes: Value,
}

impl Update {
    /// Build an update from a key and a partial object.
    pub fn new(id: impl Into<EntityKey>, changes: Value) -> Self {
        Self {
            id: id.into(),
            changes,
        }
    }
}

/// Extracts the primary key from an entity.
pub type KeySelector = Arc<dyn Fn(&Value) -> Option<EntityKey> + Send + Sync>;

/// Orders two entities; used to keep a collection's `ids` sorted.
pub type SortComparer = Arc<dyn Fn(&Value, &Value) -> Ordering + Send + Sync>;

/// Narrows a list of entities by a filter pattern.
pub type FilterFn = Arc<dyn Fn(&[Arc<Value>], &str) -> Vec<Arc<Value>> + Send + Sync>;

/// Key selector reading the `"id"` field.
pub fn default_select_id() -> KeySelector {
    select_id_by_field("id")
}

/// Key selector reading an arbitrary top-level field.
pub fn select_id_by_field(field: &'static str) -> KeySelector {
    Arc::new(move |entity: &Value| entity.get(field).and_then(EntityKey::from_value))
}

/// Comparer ordering entities by a top-level field.
///
/// Numbers compare numerically, strings lexically; entities missing the
/// field sort first.
pub fn sort_by_field(field: &'static str) -> SortComparer {
    Arc::new(move |a: &Value, b: &Value| compare_json(a.get(field), b.get(field)))
}

fn compare_json(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (Some(Value::Number(x)), Some(Value::Number(y))) => {
            let x = x.as_f64().unwrap_or(f64::NAN);
            let y = y.as_f64().unwrap_or(f64::NAN);
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        _ => Ordering::Equal,
    }
}

/// Default filter: keeps entities where any string field contains the
/// pattern, ignoring case. An empty pattern keeps everything.
pub fn default_filter() -> FilterFn {
    Arc::new(|entities: &[Arc<Value>], pattern: &str| {
        let pattern = pattern.trim().to_lowercase();
        if pattern.is_empty() {
            return entities.to_vec();
        }
        entities
            .iter()
            .filter(|e| match e.as_ref() {
                Value::Object(fields) => fields.values().any(|v| {
                    v.as_str()
                        .is_some_and(|s| s.to_lowercase().contains(&pattern))
                }),
                _ => false,
            })
            .cloned()
            .collect()
    })
}

/// Shallow-merge `changes` into `base`, returning the merged entity.
///
/// Fields named in `changes` overwrite those in `base`; all other fields
/// are kept. A non-object `changes` replaces `base` entirely.
pub fn merge_changes(base: &Value, changes: &Value) -> Value {
    match (base, changes) {
        (Value::Object(base_fields), Value::Object(change_fields)) => {
            let mut merged: Map<String, Value> = base_fields.clone();
            for (k, v) in change_fields {
                merged.insert(k.clone(), v.clone());
            }
            Value::Object(merged)
        }
        _ => changes.clone(),
    }
}
