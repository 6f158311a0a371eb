//! JSON views over the store records

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::database::{Allocation, CachedFile, Instance, Port};

fn iso(timestamp: i64) -> String {
    DateTime::<Utc>::from_timestamp(timestamp, 0)
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_default()
}

/// Port range and admission thresholds, for `GET /details`
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DetailsView {
    pub lowest_port: u16,
    pub highest_port: u16,
    pub cpu_threshold: f32,
    pub memory_threshold: f32,
}

/// Client-facing allocation shape
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AllocationView {
    pub id: i64,
    pub url: String,
    pub packet_tracer: Option<String>,
    pub created_at: String,
    pub deleted_at: Option<String>,
}

impl AllocationView {
    /// `instance` is the one currently holding the allocation, when any
    pub fn new(allocation: &Allocation, instance: Option<&Instance>, base: &str, host: &str) -> Self {
        let packet_tracer = instance
            .filter(|_| allocation.is_current())
            .map(|i| format!("{}:{}", host, i.pt_port));

        Self {
            id: allocation.id,
            url: format!("{}/allocations/{}", base, allocation.id),
            packet_tracer,
            created_at: iso(allocation.created_at),
            deleted_at: allocation.deleted_at.map(iso),
        }
    }
}

/// Client-facing instance shape
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceView {
    pub id: i64,
    pub url: String,
    pub docker_id: String,
    pub packet_tracer: Option<String>,
    pub vnc: Option<String>,
    pub created_at: String,
    pub deleted_at: Option<String>,
    pub status: String,
}

impl InstanceView {
    pub fn new(instance: &Instance, base: &str, host: &str) -> Self {
        let endpoints_live = instance.is_active();
        Self {
            id: instance.id,
            url: format!("{}/instances/{}", base, instance.id),
            docker_id: instance.docker_id.clone(),
            packet_tracer: endpoints_live.then(|| format!("{}:{}", host, instance.pt_port)),
            vnc: endpoints_live.then(|| format!("vnc://{}:{}", host, instance.vnc_port)),
            created_at: iso(instance.created_at),
            deleted_at: instance.deleted_at.map(iso),
            status: instance.status.to_string(),
        }
    }
}

/// Client-facing port shape
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PortView {
    pub number: u16,
    pub used_by: i64,
}

impl From<&Port> for PortView {
    fn from(port: &Port) -> Self {
        Self {
            number: port.number,
            used_by: port.instance_id,
        }
    }
}

/// Client-facing cached file shape
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedFileView {
    pub url: String,
    pub filename: String,
}

impl CachedFileView {
    /// `filename` is rendered as instances see it on the cache volume
    pub fn new(cached: &CachedFile, container_path: String) -> Self {
        Self {
            url: cached.url.clone(),
            filename: container_path,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::InstanceStatus;

    fn instance() -> Instance {
        Instance {
            id: 7,
            docker_id: "abc".into(),
            pt_port: 50001,
            vnc_port: 60001,
            status: InstanceStatus::Ready,
            allocated_by: Some(3),
            created_at: 1_700_000_000,
            deleted_at: None,
        }
    }

    #[test]
    fn test_instance_view_endpoints() {
        let view = InstanceView::new(&instance(), "http://pool:5000", "pool");
        assert_eq!(view.url, "http://pool:5000/instances/7");
        assert_eq!(view.packet_tracer.as_deref(), Some("pool:50001"));
        assert_eq!(view.vnc.as_deref(), Some("vnc://pool:60001"));
        assert_eq!(view.status, "ready");
    }

    #[test]
    fn test_finished_instance_hides_endpoints() {
        let mut finished = instance();
        finished.deleted_at = Some(1_700_000_100);

        let view = InstanceView::new(&finished, "http://pool:5000", "pool");
        assert!(view.packet_tracer.is_none());
        assert!(view.vnc.is_none());
        assert!(view.deleted_at.is_some());
    }

    #[test]
    fn test_allocation_view_endpoint_follows_lease() {
        let open = Allocation {
            id: 3,
            created_at: 1_700_000_000,
            deleted_at: None,
        };
        let view = AllocationView::new(&open, Some(&instance()), "http://pool:5000", "pool");
        assert_eq!(view.packet_tracer.as_deref(), Some("pool:50001"));

        let closed = Allocation {
            deleted_at: Some(1_700_000_100),
            ..open
        };
        let view = AllocationView::new(&closed, Some(&instance()), "http://pool:5000", "pool");
        assert!(view.packet_tracer.is_none());
    }
}
