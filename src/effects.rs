//! Background effect runner that turns query and save actions into
//! data-service calls.
//!
//! The runner reads a lossless queue the store feeds from its dispatch
//! path. Every persistence action
//! (`QUERY_*` and `SAVE_*` initiators) is handled in its own task: after the
//! configured delay it calls the entity type's
//! [`EntityCollectionDataService`], then dispatches the matching `_SUCCESS`
//! or `_ERROR` action carrying the original correlation id. Requests for
//! different actions run concurrently and may finish in any order.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;

use crate::action::{ActionPayload, EntityAction, EntityActionError, EntityActionOptions, QueryParams};
use crate::data_service::{DataServiceError, EntityCollectionDataService, HttpMethod, RequestData};
use crate::error::EffectsError;
use crate::op::EntityOp;
use crate::store::EntityStore;

/// Handle for controlling a running effect runner.
///
/// Dropping the handle does **not** stop the runner -- call
/// [`shutdown`](EffectsHandle::shutdown) to stop it after in-flight
/// requests finish.
///
/// `Clone` is cheap: all fields are `Arc`-wrapped.
#[derive(Clone)]
pub struct EffectsHandle {
    /// Sends `true` to signal the runner to stop.
    shutdown_tx: watch::Sender<bool>,
    /// The spawned runner task, taken and awaited once by `shutdown`.
    task: Arc<tokio::sync::Mutex<Option<tokio::task::JoinHandle<()>>>>,
}

impl std::fmt::Debug for EffectsHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EffectsHandle")
            .field("running", &self.is_running())
            .finish()
    }
}

impl EffectsHandle {
    pub(crate) fn new(
        shutdown_tx: watch::Sender<bool>,
        task: tokio::task::JoinHandle<()>,
    ) -> Self {
        Self {
            shutdown_tx,
            task: Arc::new(tokio::sync::Mutex::new(Some(task))),
        }
    }

    /// Returns `true` until [`shutdown`](EffectsHandle::shutdown) has been
    /// requested.
    pub fn is_running(&self) -> bool {
        !*self.shutdown_tx.borrow()
    }

    /// Signal the runner to stop and wait for it to exit.
    ///
    /// Requests already queued or in flight are allowed to finish and
    /// dispatch their outcome actions; persistence actions dispatched once
    /// the runner has stopped are not handled. Calling `shutdown` more than once is safe -- subsequent
    /// calls return `Ok(())` immediately.
    ///
    /// # Errors
    ///
    /// Returns [`EffectsError::Join`] if the runner task panicked.
    pub async fn shutdown(&self) -> Result<(), EffectsError> {
        // The runner may already have exited and dropped its receiver.
        let _ = self.shutdown_tx.send(true);

        let task = self.task.lock().await.take();
        match task {
            Some(join_handle) => join_handle
                .await
                .map_err(|e| EffectsError::Join(e.to_string())),
            None => Ok(()),
        }
    }
}

/// Run the effect loop until shutdown or until the request queue closes.
///
/// # Arguments
///
/// * `store` - The store whose data services, config and dispatch path the
///   runner uses.
/// * `requests` - Persistence actions queued by the store's dispatch path.
/// * `shutdown_rx` - Watch receiver that signals the loop to stop.
pub(crate) async fn run_effects(
    store: EntityStore,
    mut requests: mpsc::UnboundedReceiver<Arc<EntityAction>>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut in_flight: JoinSet<()> = JoinSet::new();

    loop {
        tokio::select! {
            received = requests.recv() => match received {
                Some(action) => {
                    let store = store.clone();
                    in_flight.spawn(async move { persist(store, action).await });
                }
                None => break,
            },
            Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                log_join(joined);
            }
            _ = shutdown_rx.changed() => break,
        }
    }

    // Requests queued before the stop are still handled.
    requests.close();
    while let Ok(action) = requests.try_recv() {
        let store = store.clone();
        in_flight.spawn(async move { persist(store, action).await });
    }

    let pending = in_flight.len();
    if pending > 0 {
        tracing::info!(pending, "entity effects: waiting for in-flight requests");
    }
    while let Some(joined) = in_flight.join_next().await {
        log_join(joined);
    }
    tracing::info!("entity effects stopped");
}

fn log_join(joined: Result<(), tokio::task::JoinError>) {
    if let Err(e) = joined {
        tracing::error!(error = %e, "entity effects: request task failed");
    }
}

/// Handle one persistence action and dispatch its outcome.
async fn persist(store: EntityStore, action: Arc<EntityAction>) {
    let outcome = if action.skip {
        Ok(skipped_payload(&action))
    } else {
        call_with_policy(&store, &action).await
    };

    let (op, payload) = match outcome {
        Ok(payload) => (action.op.success(), payload),
        Err(error) => {
            tracing::error!(
                entity_name = %action.entity_name,
                op = %action.op,
                correlation_id = ?action.correlation_id,
                error = %error,
                "data service request failed"
            );
            let payload = ActionPayload::Error(EntityActionError {
                error,
                original_action: Box::new(action.as_ref().clone()),
            });
            (action.op.error(), payload)
        }
    };
    let Some(op) = op else {
        return;
    };

    let reply =
        store
            .action_factory()
            .create_from_action(&action, op, payload, EntityActionOptions::default());
    if let Err(e) = store.dispatch(reply) {
        tracing::error!(
            entity_name = %action.entity_name,
            op = %op,
            error = %e,
            "failed to dispatch request outcome"
        );
    }
}

/// Success payload for an action that asked to skip the service call.
///
/// Queries report no data; saves echo their own payload.
fn skipped_payload(action: &EntityAction) -> ActionPayload {
    match action.op {
        EntityOp::QueryAll | EntityOp::QueryByKey | EntityOp::QueryMany => ActionPayload::None,
        _ => action.payload.clone(),
    }
}

/// Apply the configured delay and timeout around the service call.
async fn call_with_policy(
    store: &EntityStore,
    action: &EntityAction,
) -> Result<ActionPayload, DataServiceError> {
    let config = &store.inner.data_service_config;
    let delay = if is_query(action.op) {
        config.get_delay
    } else {
        config.save_delay
    };
    if delay > Duration::ZERO {
        tokio::time::sleep(delay).await;
    }

    let Some(service) = store.inner.data_services.get(&action.entity_name) else {
        return Err(DataServiceError::new(format!(
            "no data service registered for entity type \"{}\"",
            action.entity_name
        )));
    };

    match config.timeout {
        Some(limit) => match tokio::time::timeout(limit, call_service(service.as_ref(), action)).await
        {
            Ok(result) => result,
            Err(_) => Err(DataServiceError::new(format!(
                "request timed out after {}ms",
                limit.as_millis()
            ))
            .with_request(describe_request(store, action))),
        },
        None => call_service(service.as_ref(), action).await,
    }
}

fn is_query(op: EntityOp) -> bool {
    matches!(
        op,
        EntityOp::QueryAll | EntityOp::QueryByKey | EntityOp::QueryMany
    )
}

/// Call the service method matching the action's op.
async fn call_service(
    service: &dyn EntityCollectionDataService,
    action: &EntityAction,
) -> Result<ActionPayload, DataServiceError> {
    use EntityOp::*;

    let payload = &action.payload;
    match action.op {
        QueryAll => Ok(ActionPayload::Entities(service.get_all().await?)),
        QueryByKey => {
            let key = payload
                .as_key()
                .cloned()
                .ok_or_else(|| invalid(action, "a key"))?;
            Ok(match service.get_by_id(key).await? {
                Some(entity) => ActionPayload::Entity(entity),
                None => ActionPayload::None,
            })
        }
        QueryMany => {
            let params = match payload {
                ActionPayload::Query(params) => params.clone(),
                _ => QueryParams::Raw(String::new()),
            };
            Ok(ActionPayload::Entities(service.get_with_query(params).await?))
        }
        SaveAddOne | SaveAddOneOptimistic => {
            let entity = payload
                .as_entity()
                .cloned()
                .ok_or_else(|| invalid(action, "an entity"))?;
            Ok(ActionPayload::Entity(service.add(entity).await?))
        }
        SaveDeleteOne | SaveDeleteOneOptimistic => {
            let key = payload
                .as_key()
                .cloned()
                .ok_or_else(|| invalid(action, "a key"))?;
            Ok(ActionPayload::Key(service.delete(key).await?))
        }
        SaveUpdateOne | SaveUpdateOneOptimistic => {
            let update = payload
                .as_update()
                .cloned()
                .ok_or_else(|| invalid(action, "an update"))?;
            Ok(ActionPayload::Update(service.update(update).await?))
        }
        other => Err(DataServiceError::new(format!(
            "{other} is not a persistence operation"
        ))),
    }
}

fn invalid(action: &EntityAction, expected: &str) -> DataServiceError {
    DataServiceError::new(format!(
        "\"{}\" payload must be {expected}",
        action.type_name
    ))
}

/// Describe the HTTP request an action maps to, for error reports.
fn describe_request(store: &EntityStore, action: &EntityAction) -> RequestData {
    let inner = &store.inner;
    let urls = inner
        .urls
        .resource_urls(&action.entity_name, &inner.data_service_config.root);
    let payload = &action.payload;
    match action.op {
        EntityOp::QueryByKey => RequestData::new(
            HttpMethod::Get,
            format!(
                "{}{}",
                urls.entity_resource_url,
                payload.as_key().map(ToString::to_string).unwrap_or_default()
            ),
            None,
        ),
        EntityOp::QueryMany => {
            let query = match payload {
                ActionPayload::Query(params) => params.to_query_string(),
                _ => String::new(),
            };
            RequestData::new(
                HttpMethod::Get,
                format!("{}?{query}", urls.collection_resource_url),
                None,
            )
        }
        EntityOp::SaveAddOne | EntityOp::SaveAddOneOptimistic => RequestData::new(
            HttpMethod::Post,
            urls.entity_resource_url,
            payload.as_entity().cloned(),
        ),
        EntityOp::SaveDeleteOne | EntityOp::SaveDeleteOneOptimistic => RequestData::new(
            HttpMethod::Delete,
            format!(
                "{}{}",
                urls.entity_resource_url,
                payload.as_key().map(ToString::to_string).unwrap_or_default()
            ),
            None,
        ),
        EntityOp::SaveUpdateOne | EntityOp::SaveUpdateOneOptimistic => {
            let update = payload.as_update();
            RequestData::new(
                HttpMethod::Put,
                format!(
                    "{}{}",
                    urls.entity_resource_url,
                    update.map(|u| u.id.to_string()).unwrap_or_default()
                ),
                update.map(|u| u.changes.clone()),
            )
        }
        _ => RequestData::new(HttpMethod::Get, urls.collection_resource_url, None),
    }
}
