//! Allocation (lease) handlers

use std::time::Duration;

use axum::{
    extract::{Host, Path, Query, State},
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};

use super::super::{AllocationView, AppState};
use super::{base_url, hostname};
use crate::database::Allocation;
use crate::error::{DaemonError, Result};

#[derive(Debug, Deserialize)]
pub struct ShowQuery {
    pub show: Option<String>,
}

/// List allocations, current ones by default
pub async fn list_allocations(
    State(state): State<AppState>,
    host: Host,
    Query(query): Query<ShowQuery>,
) -> Result<Json<Value>> {
    let allocations = match query.show.as_deref() {
        None | Some("current") => state.db.allocations_current().await?,
        Some("all") => state.db.allocations_all().await?,
        Some("finished") => state.db.allocations_finished().await?,
        Some(other) => {
            return Err(DaemonError::BadRequest(format!(
                "The 'show' parameter must be one of: all, current or finished (got '{}').",
                other
            )))
        }
    };

    let mut views = Vec::with_capacity(allocations.len());
    for allocation in &allocations {
        views.push(view(&state, allocation, &host).await?);
    }
    Ok(Json(json!({ "allocations": views })))
}

/// Lease a warm instance, creating a cold one when the pool is empty
pub async fn create_allocation(
    State(state): State<AppState>,
    host: Host,
) -> Result<Json<AllocationView>> {
    let deadline = Duration::from_secs(state.config.tasks.allocate_timeout_secs);

    let (allocation, instance) =
        tokio::time::timeout(deadline, state.coordinator.allocate_instance())
            .await
            .map_err(|_| {
                DaemonError::Timeout("Allocation did not complete in time. Please retry.".into())
            })??;

    Ok(Json(AllocationView::new(
        &allocation,
        Some(&instance),
        &base_url(&host),
        &hostname(&host),
    )))
}

/// Allocation detail
pub async fn get_allocation(
    State(state): State<AppState>,
    host: Host,
    Path(allocation_id): Path<i64>,
) -> Result<Json<AllocationView>> {
    let allocation = state
        .db
        .allocation(allocation_id)
        .await?
        .ok_or_else(|| DaemonError::NotFound("The allocation does not exist.".into()))?;
    Ok(Json(view(&state, &allocation, &host).await?))
}

/// Return the lease to the pool
pub async fn delete_allocation(
    State(state): State<AppState>,
    host: Host,
    Path(allocation_id): Path<i64>,
) -> Result<Json<AllocationView>> {
    let allocation = state
        .db
        .allocation(allocation_id)
        .await?
        .ok_or_else(|| DaemonError::NotFound("The allocation does not exist.".into()))?;

    if allocation.is_current() {
        match state.db.instance_for_allocation(allocation_id).await? {
            Some(instance) => {
                state.coordinator.deallocate_instance(instance.id).await?;
            }
            None => {
                // Orphaned lease; just close it
                state.db.close_allocation(allocation_id).await?;
            }
        }
    }

    let allocation = state
        .db
        .allocation(allocation_id)
        .await?
        .ok_or_else(|| DaemonError::NotFound("The allocation does not exist.".into()))?;
    Ok(Json(view(&state, &allocation, &host).await?))
}

async fn view(state: &AppState, allocation: &Allocation, host: &Host) -> Result<AllocationView> {
    let instance = state.db.instance_for_allocation(allocation.id).await?;
    Ok(AllocationView::new(
        allocation,
        instance.as_ref(),
        &base_url(host),
        &hostname(host),
    ))
}
