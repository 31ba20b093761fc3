//! The persistence boundary: the per-type data-service trait, its error
//! type, and an in-memory reference implementation.
//!
//! The cache never talks to a server itself. The effect runner calls an
//! [`EntityCollectionDataService`] for every query or save op and turns the
//! result into a success or error action.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;

use crate::action::QueryParams;
use crate::entity::{EntityKey, Update, merge_changes};
use crate::urls::HttpUrlGenerator;

/// HTTP verb of a data-service request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    /// `GET`
    Get,
    /// `POST`
    Post,
    /// `PUT`
    Put,
    /// `DELETE`
    Delete,
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Delete => "DELETE",
        })
    }
}

/// Description of the request that failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestData {
    /// HTTP verb.
    pub method: HttpMethod,
    /// Full request URL.
    pub url: String,
    /// Request body or query, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RequestData {
    /// Describe a request.
    pub fn new(method: HttpMethod, url: impl Into<String>, data: Option<Value>) -> Self {
        Self {
            method,
            url: url.into(),
            data,
        }
    }
}

/// A normalized, recoverable persistence failure.
///
/// Carried in the payload of every `*_ERROR` action and delivered to the
/// dispatcher's completion future.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{message}")]
pub struct DataServiceError {
    /// Human-readable cause.
    pub message: String,
    /// The request that failed, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<RequestData>,
}

impl DataServiceError {
    /// An error with no request description.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            request: None,
        }
    }

    /// Attach the failed request.
    pub fn with_request(mut self, request: RequestData) -> Self {
        self.request = Some(request);
        self
    }
}

/// Async persistence operations for one entity type.
///
/// Implementations must be `Send + Sync`: the effect runner shares one
/// instance across concurrently running request tasks.
#[async_trait]
pub trait EntityCollectionDataService: Send + Sync {
    /// Name of the service, used in logs.
    fn name(&self) -> &str;

    /// Persist a new entity and return it as stored (the server may assign
    /// the key).
    async fn add(&self, entity: Value) -> Result<Value, DataServiceError>;

    /// Delete the entity under `key` and return that key.
    async fn delete(&self, key: EntityKey) -> Result<EntityKey, DataServiceError>;

    /// Fetch every entity.
    async fn get_all(&self) -> Result<Vec<Value>, DataServiceError>;

    /// Fetch one entity; `Ok(None)` when the key is unknown.
    async fn get_by_id(&self, key: EntityKey) -> Result<Option<Value>, DataServiceError>;

    /// Fetch the entities matching `params`.
    async fn get_with_query(&self, params: QueryParams) -> Result<Vec<Value>, DataServiceError>;

    /// Apply `update` and return the update as persisted.
    async fn update(&self, update: Update) -> Result<Update, DataServiceError>;
}

/// Knobs for talking to data services.
///
/// The delays and timeout only affect the effect runner; the reducer never
/// sees them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataServiceConfig {
    /// URL root prepended to every resource URL.
    pub root: String,
    /// Upper bound on one service call. `None` waits forever.
    pub timeout: Option<Duration>,
    /// Delay before each query call.
    pub get_delay: Duration,
    /// Delay before each save call.
    pub save_delay: Duration,
}

impl Default for DataServiceConfig {
    fn default() -> Self {
        Self {
            root: "api".to_owned(),
            timeout: None,
            get_delay: Duration::ZERO,
            save_delay: Duration::ZERO,
        }
    }
}

/// Data services keyed by entity name.
#[derive(Clone, Default)]
pub struct DataServiceRegistry {
    services: HashMap<String, Arc<dyn EntityCollectionDataService>>,
}

impl fmt::Debug for DataServiceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataServiceRegistry")
            .field("entity_names", &self.services.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl DataServiceRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the service for `entity_name`, replacing any earlier one.
    pub fn register(
        &mut self,
        entity_name: impl Into<String>,
        service: Arc<dyn EntityCollectionDataService>,
    ) {
        self.services.insert(entity_name.into(), service);
    }

    /// The service for `entity_name`.
    pub fn get(&self, entity_name: &str) -> Option<Arc<dyn EntityCollectionDataService>> {
        self.services.get(entity_name).cloned()
    }
}

#[derive(Debug, Default)]
struct InMemoryState {
    rows: Vec<Value>,
    failure: Option<String>,
}

/// An [`EntityCollectionDataService`] backed by a list in memory.
///
/// Entities are keyed by one top-level field (`"id"` by default). `add`
/// assigns the next integer key when the entity has none. A failure message
/// set with [`fail_with`](InMemoryDataService::fail_with) makes every call
/// fail until cleared, which is how tests drive the error paths.
#[derive(Clone)]
pub struct InMemoryDataService {
    name: String,
    key_field: String,
    entity_url: String,
    collection_url: String,
    state: Arc<Mutex<InMemoryState>>,
}

impl fmt::Debug for InMemoryDataService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryDataService")
            .field("name", &self.name)
            .field("key_field", &self.key_field)
            .finish_non_exhaustive()
    }
}

impl InMemoryDataService {
    /// An empty service for `entity_name`, with URLs under the default root.
    pub fn new(entity_name: &str) -> Self {
        Self::with_urls(
            entity_name,
            &HttpUrlGenerator::default(),
            &DataServiceConfig::default().root,
        )
    }

    /// An empty service whose error descriptions use `urls` under `root`.
    pub fn with_urls(entity_name: &str, urls: &HttpUrlGenerator, root: &str) -> Self {
        let resource = urls.resource_urls(entity_name, root);
        Self {
            name: format!("InMemoryDataService<{entity_name}>"),
            key_field: "id".to_owned(),
            entity_url: resource.entity_resource_url,
            collection_url: resource.collection_resource_url,
            state: Arc::new(Mutex::new(InMemoryState::default())),
        }
    }

    /// Use `field` as the key field instead of `"id"`.
    pub fn with_key_field(mut self, field: impl Into<String>) -> Self {
        self.key_field = field.into();
        self
    }

    /// Seed the stored entities, replacing any existing ones.
    pub async fn seed(&self, rows: impl IntoIterator<Item = Value>) {
        self.state.lock().await.rows = rows.into_iter().collect();
    }

    /// Make every call fail with `message`, or succeed again with `None`.
    pub async fn fail_with(&self, message: Option<&str>) {
        self.state.lock().await.failure = message.map(str::to_owned);
    }

    /// Snapshot of the stored entities.
    pub async fn rows(&self) -> Vec<Value> {
        self.state.lock().await.rows.clone()
    }

    fn key_of(&self, row: &Value) -> Option<EntityKey> {
        row.get(&self.key_field).and_then(EntityKey::from_value)
    }

    fn check(
        &self,
        state: &InMemoryState,
        method: HttpMethod,
        url: String,
        data: Option<Value>,
    ) -> Result<(), DataServiceError> {
        match &state.failure {
            Some(message) => Err(DataServiceError::new(message.clone())
                .with_request(RequestData::new(method, url, data))),
            None => Ok(()),
        }
    }

    fn next_key(&self, rows: &[Value]) -> Result<i64, DataServiceError> {
        rows.iter()
            .filter_map(|row| match self.key_of(row) {
                Some(EntityKey::Int(n)) => Some(n),
                _ => None,
            })
            .max()
            .unwrap_or(0)
            .checked_add(1)
            .ok_or_else(|| DataServiceError::new("no integer key left to assign"))
    }
}

fn matches_query(row: &Value, params: &QueryParams) -> bool {
    let pairs: Vec<(String, String)> = match params {
        QueryParams::Pairs(pairs) => pairs.clone(),
        QueryParams::Raw(raw) => raw
            .split('&')
            .filter(|part| !part.is_empty())
            .map(|part| match part.split_once('=') {
                Some((k, v)) => (k.to_owned(), v.to_owned()),
                None => (part.to_owned(), String::new()),
            })
            .collect(),
    };
    pairs.iter().all(|(field, pattern)| {
        let pattern = pattern.to_lowercase();
        match row.get(field) {
            Some(Value::String(s)) => s.to_lowercase().contains(&pattern),
            Some(other) => other.to_string() == pattern,
            None => false,
        }
    })
}

#[async_trait]
impl EntityCollectionDataService for InMemoryDataService {
    fn name(&self) -> &str {
        &self.name
    }

    async fn add(&self, entity: Value) -> Result<Value, DataServiceError> {
        let mut state = self.state.lock().await;
        self.check(
            &state,
            HttpMethod::Post,
            self.entity_url.clone(),
            Some(entity.clone()),
        )?;
        if !entity.is_object() {
            return Err(DataServiceError::new("entity must be a JSON object").with_request(
                RequestData::new(HttpMethod::Post, self.entity_url.clone(), Some(entity)),
            ));
        }
        let mut entity = entity;
        let key = match self.key_of(&entity) {
            Some(key) => key,
            None => {
                let next = self.next_key(&state.rows).map_err(|e| {
                    e.with_request(RequestData::new(
                        HttpMethod::Post,
                        self.entity_url.clone(),
                        Some(entity.clone()),
                    ))
                })?;
                let key = EntityKey::Int(next);
                if let Some(fields) = entity.as_object_mut() {
                    fields.insert(self.key_field.clone(), key.to_value());
                }
                key
            }
        };
        if state.rows.iter().any(|row| self.key_of(row).as_ref() == Some(&key)) {
            return Err(
                DataServiceError::new(format!("entity with key {key} already exists"))
                    .with_request(RequestData::new(
                        HttpMethod::Post,
                        self.entity_url.clone(),
                        Some(entity),
                    )),
            );
        }
        state.rows.push(entity.clone());
        Ok(entity)
    }

    async fn delete(&self, key: EntityKey) -> Result<EntityKey, DataServiceError> {
        let mut state = self.state.lock().await;
        self.check(
            &state,
            HttpMethod::Delete,
            format!("{}{key}", self.entity_url),
            None,
        )?;
        state
            .rows
            .retain(|row| self.key_of(row).as_ref() != Some(&key));
        Ok(key)
    }

    async fn get_all(&self) -> Result<Vec<Value>, DataServiceError> {
        let state = self.state.lock().await;
        self.check(&state, HttpMethod::Get, self.collection_url.clone(), None)?;
        Ok(state.rows.clone())
    }

    async fn get_by_id(&self, key: EntityKey) -> Result<Option<Value>, DataServiceError> {
        let state = self.state.lock().await;
        self.check(
            &state,
            HttpMethod::Get,
            format!("{}{key}", self.entity_url),
            None,
        )?;
        Ok(state
            .rows
            .iter()
            .find(|row| self.key_of(row).as_ref() == Some(&key))
            .cloned())
    }

    async fn get_with_query(&self, params: QueryParams) -> Result<Vec<Value>, DataServiceError> {
        let state = self.state.lock().await;
        self.check(
            &state,
            HttpMethod::Get,
            format!("{}?{params}", self.collection_url),
            None,
        )?;
        Ok(state
            .rows
            .iter()
            .filter(|row| matches_query(row, &params))
            .cloned()
            .collect())
    }

    async fn update(&self, update: Update) -> Result<Update, DataServiceError> {
        let mut state = self.state.lock().await;
        let url = format!("{}{}", self.entity_url, update.id);
        self.check(
            &state,
            HttpMethod::Put,
            url.clone(),
            Some(update.changes.clone()),
        )?;
        let position = state
            .rows
            .iter()
            .position(|row| self.key_of(row).as_ref() == Some(&update.id));
        match position {
            Some(index) => {
                let merged = merge_changes(&state.rows[index], &update.changes);
                state.rows[index] = merged.clone();
                Ok(Update {
                    id: update.id,
                    changes: merged,
                })
            }
            None => Err(
                DataServiceError::new(format!("no entity with key {}", update.id))
                    .with_request(RequestData::new(HttpMethod::Put, url, Some(update.changes))),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn add_assigns_next_integer_key() {
        let svc = InMemoryDataService::new("Hero");
        svc.seed([json!({"id": 4, "name": "A"})]).await;
        let added = svc.add(json!({"name": "B"})).await.unwrap();
        assert_eq!(added, json!({"id": 5, "name": "B"}));
        assert_eq!(svc.rows().await.len(), 2);
    }

    #[tokio::test]
    async fn add_fails_when_integer_keys_are_exhausted() {
        let svc = InMemoryDataService::new("Hero");
        svc.seed([json!({"id": i64::MAX})]).await;
        let err = svc.add(json!({"name": "Overflow"})).await.unwrap_err();
        assert_eq!(err.message, "no integer key left to assign");
        assert_eq!(err.request.unwrap().method, HttpMethod::Post);
        assert_eq!(svc.rows().await.len(), 1);
    }

    #[tokio::test]
    async fn add_rejects_duplicate_key() {
        let svc = InMemoryDataService::new("Hero");
        svc.seed([json!({"id": 1})]).await;
        let err = svc.add(json!({"id": 1})).await.unwrap_err();
        let request = err.request.expect("request data");
        assert_eq!(request.method, HttpMethod::Post);
        assert_eq!(request.url, "api/hero/");
    }

    #[tokio::test]
    async fn get_by_id_returns_none_for_unknown_key() {
        let svc = InMemoryDataService::new("Hero");
        svc.seed([json!({"id": 1, "name": "A"})]).await;
        assert_eq!(
            svc.get_by_id(1.into()).await.unwrap(),
            Some(json!({"id": 1, "name": "A"}))
        );
        assert_eq!(svc.get_by_id(9.into()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn query_matches_substrings_case_insensitively() {
        let svc = InMemoryDataService::new("Hero");
        svc.seed([
            json!({"id": 1, "name": "Windstorm"}),
            json!({"id": 2, "name": "Bombasto"}),
        ])
        .await;
        let hits = svc
            .get_with_query(QueryParams::Raw("name=STORM".into()))
            .await
            .unwrap();
        assert_eq!(hits, vec![json!({"id": 1, "name": "Windstorm"})]);
    }

    #[tokio::test]
    async fn update_merges_and_reports_missing_key() {
        let svc = InMemoryDataService::new("Hero");
        svc.seed([json!({"id": 1, "name": "A", "power": "Fly"})]).await;
        let updated = svc
            .update(Update::new(1, json!({"name": "Z"})))
            .await
            .unwrap();
        assert_eq!(updated.changes, json!({"id": 1, "name": "Z", "power": "Fly"}));

        let err = svc
            .update(Update::new(7, json!({"name": "Z"})))
            .await
            .unwrap_err();
        assert_eq!(err.request.map(|r| r.url), Some("api/hero/7".to_string()));
    }

    #[tokio::test]
    async fn fail_with_makes_calls_fail_until_cleared() {
        let svc = InMemoryDataService::new("Hero");
        svc.fail_with(Some("offline")).await;
        let err = svc.get_all().await.unwrap_err();
        assert_eq!(err.to_string(), "offline");
        assert_eq!(err.request.map(|r| r.url), Some("api/heros/".to_string()));

        svc.fail_with(None).await;
        assert!(svc.get_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let svc = InMemoryDataService::new("Hero");
        svc.seed([json!({"id": 1})]).await;
        assert_eq!(svc.delete(1.into()).await.unwrap(), EntityKey::Int(1));
        assert_eq!(svc.delete(1.into()).await.unwrap(), EntityKey::Int(1));
        assert!(svc.rows().await.is_empty());
    }

    #[test]
    fn error_serializes_with_request() {
        let err = DataServiceError::new("boom").with_request(RequestData::new(
            HttpMethod::Delete,
            "api/hero/1",
            None,
        ));
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(
            json,
            json!({"message": "boom", "request": {"method": "DELETE", "url": "api/hero/1"}})
        );
    }
}
