//! Container runtime trait definitions

use std::collections::HashMap;

use async_trait::async_trait;

/// Error type for runtime operations
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("Docker error: {0}")]
    Docker(#[from] bollard::errors::Error),

    #[error("Container not found: {0}")]
    ContainerNotFound(String),

    #[error("Container creation rejected: {0}")]
    Rejected(String),

    #[error("{0}")]
    Other(String),
}

pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// Request to create one instance container
#[derive(Debug, Clone, Default)]
pub struct ContainerSpec {
    /// Image to create the container from
    pub image: String,

    /// Port mappings (container port -> host port)
    pub port_bindings: HashMap<u16, u16>,

    /// Host directories mounted into the container
    pub volume_binds: Vec<VolumeBind>,

    /// Containers whose volumes are attached
    pub volumes_from: Vec<String>,
}

/// One host directory mounted into the container
#[derive(Debug, Clone)]
pub struct VolumeBind {
    pub host_path: String,
    pub container_path: String,
    pub read_only: bool,
}

impl VolumeBind {
    /// Format as a Docker bind string
    pub fn to_bind(&self) -> String {
        let mode = if self.read_only { "ro" } else { "rw" };
        format!("{}:{}:{}", self.host_path, self.container_path, mode)
    }
}

/// Result of a container creation
#[derive(Debug, Clone)]
pub struct CreatedContainer {
    pub id: String,
    pub warnings: Vec<String>,
}

/// Snapshot of a container's runtime state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ContainerState {
    pub running: bool,
    pub paused: bool,
}

/// A container the runtime reports as exited
#[derive(Debug, Clone)]
pub struct ExitedContainer {
    pub id: String,
    pub image: String,
    /// Human-readable status line, e.g. "Exited (0) 5 minutes ago"
    pub status: String,
}

/// Trait abstracting the container runtime.
///
/// The lifecycle and reconciliation code is written against this interface,
/// so the whole state machine runs under test with a fake runtime.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Create a container (but don't start it)
    async fn create(&self, spec: &ContainerSpec) -> RuntimeResult<CreatedContainer>;

    /// Start the container
    async fn start(&self, id: &str) -> RuntimeResult<()>;

    /// Stop the container
    async fn stop(&self, id: &str) -> RuntimeResult<()>;

    /// Freeze the container's processes
    async fn pause(&self, id: &str) -> RuntimeResult<()>;

    /// Thaw a paused container
    async fn unpause(&self, id: &str) -> RuntimeResult<()>;

    /// Remove the container
    async fn remove(&self, id: &str, force: bool) -> RuntimeResult<()>;

    /// Get the container's current state
    async fn inspect(&self, id: &str) -> RuntimeResult<ContainerState>;

    /// List containers whose status is "exited"
    async fn list_exited(&self) -> RuntimeResult<Vec<ExitedContainer>>;
}
