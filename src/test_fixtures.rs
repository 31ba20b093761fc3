//! Shared hero and villain fixtures for unit tests.

use serde_json::{Value, json};

use crate::metadata::EntityMetadata;

pub(crate) fn hero_metadata() -> EntityMetadata {
    EntityMetadata::new("Hero")
}

pub(crate) fn villain_metadata() -> EntityMetadata {
    EntityMetadata::new("Villain")
}

pub(crate) fn initial_heroes() -> Vec<Value> {
    vec![
        json!({"id": 2, "name": "B", "power": "Fast"}),
        json!({"id": 1, "name": "A", "power": "invisible"}),
    ]
}
