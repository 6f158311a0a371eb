//! Instance handlers

use axum::{
    extract::{Host, Path, Query, State},
    Json,
};
use serde_json::{json, Value};

use super::super::{AppState, InstanceView};
use super::allocations::ShowQuery;
use super::{base_url, hostname};
use crate::error::{DaemonError, Result};

/// List instances, live ones by default
pub async fn list_instances(
    State(state): State<AppState>,
    host: Host,
    Query(query): Query<ShowQuery>,
) -> Result<Json<Value>> {
    let instances = match query.show.as_deref() {
        None | Some("running") => state.db.instances_active().await?,
        Some("all") => state.db.instances_all().await?,
        Some("starting") => state.db.instances_starting().await?,
        Some("deallocated") => state.db.instances_deallocated().await?,
        Some("allocated") => state.db.instances_allocated().await?,
        Some("finished") => state.db.instances_finished().await?,
        Some("error") => state.db.instances_erroneous().await?,
        Some(other) => {
            return Err(DaemonError::BadRequest(format!(
                "The 'show' parameter must be one of: all, starting, deallocated, allocated, running, finished or error (got '{}').",
                other
            )))
        }
    };

    let base = base_url(&host);
    let name = hostname(&host);
    let views: Vec<InstanceView> = instances
        .iter()
        .map(|instance| InstanceView::new(instance, &base, &name))
        .collect();
    Ok(Json(json!({ "instances": views })))
}

/// Create a fresh pool instance
pub async fn create_instance(
    State(state): State<AppState>,
    host: Host,
) -> Result<Json<InstanceView>> {
    let instance = state.coordinator.create_instance().await?;
    Ok(Json(InstanceView::new(
        &instance,
        &base_url(&host),
        &hostname(&host),
    )))
}

/// Instance detail
pub async fn get_instance(
    State(state): State<AppState>,
    host: Host,
    Path(instance_id): Path<i64>,
) -> Result<Json<InstanceView>> {
    let instance = state
        .db
        .instance(instance_id)
        .await?
        .ok_or_else(|| DaemonError::NotFound("The instance does not exist.".into()))?;
    Ok(Json(InstanceView::new(
        &instance,
        &base_url(&host),
        &hostname(&host),
    )))
}

/// Destroy an instance and its container
pub async fn delete_instance(
    State(state): State<AppState>,
    host: Host,
    Path(instance_id): Path<i64>,
) -> Result<Json<InstanceView>> {
    let instance = state.coordinator.delete_instance(instance_id).await?;
    Ok(Json(InstanceView::new(
        &instance,
        &base_url(&host),
        &hostname(&host),
    )))
}
