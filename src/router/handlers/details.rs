//! API capability handler

use axum::{extract::State, Json};

use super::super::{AppState, DetailsView};

/// Port range and admission thresholds
pub async fn get_details(State(state): State<AppState>) -> Json<DetailsView> {
    Json(DetailsView {
        lowest_port: state.config.ports.lowest,
        highest_port: state.config.ports.highest,
        cpu_threshold: state.config.thresholds.cpu,
        memory_threshold: state.config.thresholds.memory,
    })
}
