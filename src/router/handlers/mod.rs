pub mod allocations;
pub mod details;
pub mod files;
pub mod instances;
pub mod ports;

use axum::extract::Host;

/// Base URL clients reached us under
pub(super) fn base_url(host: &Host) -> String {
    format!("http://{}", host.0)
}

/// Hostname alone, for endpoint strings like `host:port`
pub(super) fn hostname(host: &Host) -> String {
    host.0.split(':').next().unwrap_or_default().to_string()
}
