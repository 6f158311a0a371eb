//! Cached file handlers

use axum::{
    extract::{Path, State},
    Json,
};
use serde_json::{json, Value};

use super::super::{AppState, CachedFileView};
use crate::database::CachedFile;
use crate::error::{DaemonError, Result};

fn view(state: &AppState, cached: &CachedFile) -> CachedFileView {
    CachedFileView::new(cached, state.cache.container_path(cached))
}

/// List cached files
pub async fn list_files(State(state): State<AppState>) -> Result<Json<Value>> {
    let files: Vec<CachedFileView> = state
        .cache
        .all()
        .await?
        .iter()
        .map(|cached| view(&state, cached))
        .collect();
    Ok(Json(json!({ "files": files })))
}

/// Cache the URL given as the request body
pub async fn cache_file(
    State(state): State<AppState>,
    body: String,
) -> Result<Json<CachedFileView>> {
    let url = body.trim();
    if url.is_empty() {
        return Err(DaemonError::BadRequest(
            "The request body must contain the URL to cache.".into(),
        ));
    }
    let cached = state.cache.fetch(url).await?;
    Ok(Json(view(&state, &cached)))
}

/// Clear the cache of files
pub async fn clear_cache(State(state): State<AppState>) -> Result<Json<Value>> {
    let deleted: Vec<CachedFileView> = state
        .cache
        .clear()
        .await?
        .iter()
        .map(|cached| view(&state, cached))
        .collect();
    Ok(Json(json!({ "files": deleted })))
}

/// Details of one cached file
pub async fn get_cached_file(
    State(state): State<AppState>,
    Path(file_url): Path<String>,
) -> Result<Json<CachedFileView>> {
    let cached = state
        .cache
        .lookup(&file_url)
        .await?
        .ok_or_else(|| DaemonError::NotFound("The URL is not cached.".into()))?;
    Ok(Json(view(&state, &cached)))
}

/// Drop one file from the cache
pub async fn delete_cached_file(
    State(state): State<AppState>,
    Path(file_url): Path<String>,
) -> Result<Json<CachedFileView>> {
    let cached = state
        .cache
        .remove(&file_url)
        .await?
        .ok_or_else(|| DaemonError::NotFound("The URL is not cached.".into()))?;
    Ok(Json(view(&state, &cached)))
}
