//! Instance lifecycle module
//!
//! The coordinator connecting the stores, the container runtime, the
//! readiness prober and the admission controller.

mod coordinator;

pub use coordinator::{Coordinator, LifecycleSettings};
