use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::database::DatabaseError;
use crate::runtime::RuntimeError;

#[derive(Error, Debug)]
pub enum DaemonError {
    #[error("Insufficient resources: {0}")]
    InsufficientResources(String),

    #[error("Runtime error: {0}")]
    Runtime(#[from] RuntimeError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl IntoResponse for DaemonError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            DaemonError::InsufficientResources(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg.clone()),
            DaemonError::Runtime(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
            DaemonError::Database(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
            DaemonError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            DaemonError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            DaemonError::Timeout(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg.clone()),
            DaemonError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone()),
        };

        let body = Json(json!({
            "status": status.as_u16(),
            "message": message,
        }));

        (status, body).into_response()
    }
}

pub type Result<T> = std::result::Result<T, DaemonError>;
