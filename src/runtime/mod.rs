//! Container runtime module
//!
//! Capability-level interface over the container runtime, plus the Docker
//! implementation used in production.

mod docker;
mod traits;

#[cfg(test)]
pub mod fake;

pub use docker::DockerRuntime;
pub use traits::{
    ContainerRuntime, ContainerSpec, ContainerState, CreatedContainer, ExitedContainer,
    RuntimeError, RuntimeResult, VolumeBind,
};
