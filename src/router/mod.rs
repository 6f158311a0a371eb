//! HTTP router module
//!
//! REST/JSON façade over allocations, instances, ports and cached files.

mod handlers;
mod views;

pub use views::{AllocationView, CachedFileView, DetailsView, InstanceView, PortView};

use std::sync::Arc;

use axum::{
    extract::Request,
    http::{header::LINK, HeaderValue},
    middleware::Next,
    response::Response,
    routing::get,
    Router,
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::cache::FileCache;
use crate::config::Configuration;
use crate::database::Database;
use crate::lifecycle::Coordinator;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    /// Lifecycle coordinator
    pub coordinator: Arc<Coordinator>,

    /// Shared stores
    pub db: Arc<Database>,

    /// File-URL cache
    pub cache: Arc<FileCache>,

    /// Global configuration
    pub config: Arc<Configuration>,
}

/// Build the HTTP router with all routes
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/details", get(handlers::details::get_details))
        .route(
            "/allocations",
            get(handlers::allocations::list_allocations)
                .post(handlers::allocations::create_allocation),
        )
        .route(
            "/allocations/:allocation_id",
            get(handlers::allocations::get_allocation)
                .delete(handlers::allocations::delete_allocation),
        )
        .route(
            "/instances",
            get(handlers::instances::list_instances).post(handlers::instances::create_instance),
        )
        .route(
            "/instances/:instance_id",
            get(handlers::instances::get_instance).delete(handlers::instances::delete_instance),
        )
        .route("/ports", get(handlers::ports::list_ports))
        .route(
            "/files",
            get(handlers::files::list_files)
                .post(handlers::files::cache_file)
                .delete(handlers::files::clear_cache),
        )
        .route(
            "/files/:file_url",
            get(handlers::files::get_cached_file).delete(handlers::files::delete_cached_file),
        )
        .layer(axum::middleware::from_fn(link_headers))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

/// Advertise sibling collections on every response
async fn link_headers(request: Request, next: Next) -> Response {
    let path = request.uri().path().to_string();
    let mut response = next.run(request).await;

    let links: Vec<String> = [
        ("/details", "details", "Details of API"),
        ("/allocations", "allocations", "Leases on warm instances"),
        ("/instances", "instances", "Packet Tracer instances' management"),
        ("/ports", "ports", "Ports that can be allocated"),
        ("/files", "files", "Cache for Packet Tracer files"),
    ]
    .iter()
    .filter(|(target, _, _)| path != *target)
    .map(|(target, rel, title)| format!("<{}>; rel=\"{}\"; title=\"{}\"", target, rel, title))
    .collect();

    if let Ok(value) = HeaderValue::from_str(&links.join(", ")) {
        response.headers_mut().insert(LINK, value);
    }
    response
}
