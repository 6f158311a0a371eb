//! Port registry handlers

use axum::{
    extract::{Query, State},
    Json,
};
use serde_json::{json, Value};

use super::super::{AppState, PortView};
use super::allocations::ShowQuery;
use crate::error::{DaemonError, Result};

/// List ports and their assignments
pub async fn list_ports(
    State(state): State<AppState>,
    Query(query): Query<ShowQuery>,
) -> Result<Json<Value>> {
    let ports = match query.show.as_deref() {
        None | Some("all") => state.db.ports_all().await?,
        Some("available") => state.db.ports_available().await?,
        Some("unavailable") => state.db.ports_unavailable().await?,
        Some(other) => {
            return Err(DaemonError::BadRequest(format!(
                "The 'show' parameter must be one of: all, available or unavailable (got '{}').",
                other
            )))
        }
    };

    let views: Vec<PortView> = ports.iter().map(PortView::from).collect();
    Ok(Json(json!({ "ports": views })))
}
