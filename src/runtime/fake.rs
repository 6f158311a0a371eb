//! In-memory runtime double for exercising the state machine without Docker

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::traits::{
    ContainerRuntime, ContainerSpec, ContainerState, CreatedContainer, ExitedContainer,
    RuntimeError, RuntimeResult,
};

#[derive(Debug, Clone, Default)]
pub struct FakeContainer {
    pub image: String,
    pub state: ContainerState,
    pub exit_code: Option<i64>,
}

#[derive(Default)]
pub struct FakeRuntime {
    containers: Mutex<HashMap<String, FakeContainer>>,
    next_id: AtomicU64,
    pub fail_create: AtomicBool,
    pub fail_start: AtomicBool,
    pub fail_pause: AtomicBool,
    pub fail_unpause: AtomicBool,
    pub create_warnings: Mutex<Vec<String>>,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn container(&self, id: &str) -> Option<FakeContainer> {
        self.containers.lock().get(id).cloned()
    }

    pub fn container_count(&self) -> usize {
        self.containers.lock().len()
    }

    /// Simulate the container's process exiting with the given code
    pub fn mark_exited(&self, id: &str, code: i64) {
        if let Some(container) = self.containers.lock().get_mut(id) {
            container.state = ContainerState::default();
            container.exit_code = Some(code);
        }
    }
}

fn missing(id: &str) -> RuntimeError {
    RuntimeError::ContainerNotFound(id.to_string())
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn create(&self, spec: &ContainerSpec) -> RuntimeResult<CreatedContainer> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(RuntimeError::Other("create failed".into()));
        }
        let id = format!("fake-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        self.containers.lock().insert(
            id.clone(),
            FakeContainer {
                image: spec.image.clone(),
                ..Default::default()
            },
        );
        Ok(CreatedContainer {
            id,
            warnings: self.create_warnings.lock().clone(),
        })
    }

    async fn start(&self, id: &str) -> RuntimeResult<()> {
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(RuntimeError::Other("start failed".into()));
        }
        let mut containers = self.containers.lock();
        let container = containers.get_mut(id).ok_or_else(|| missing(id))?;
        container.state = ContainerState {
            running: true,
            paused: false,
        };
        container.exit_code = None;
        Ok(())
    }

    async fn stop(&self, id: &str) -> RuntimeResult<()> {
        let mut containers = self.containers.lock();
        let container = containers.get_mut(id).ok_or_else(|| missing(id))?;
        container.state = ContainerState::default();
        container.exit_code = Some(0);
        Ok(())
    }

    async fn pause(&self, id: &str) -> RuntimeResult<()> {
        if self.fail_pause.load(Ordering::SeqCst) {
            return Err(RuntimeError::Other("pause failed".into()));
        }
        let mut containers = self.containers.lock();
        let container = containers.get_mut(id).ok_or_else(|| missing(id))?;
        if !container.state.running || container.state.paused {
            return Err(RuntimeError::Other(format!("container {} is not running", id)));
        }
        container.state.paused = true;
        Ok(())
    }

    async fn unpause(&self, id: &str) -> RuntimeResult<()> {
        if self.fail_unpause.load(Ordering::SeqCst) {
            return Err(RuntimeError::Other("unpause failed".into()));
        }
        let mut containers = self.containers.lock();
        let container = containers.get_mut(id).ok_or_else(|| missing(id))?;
        if !container.state.paused {
            return Err(RuntimeError::Other(format!("container {} is not paused", id)));
        }
        container.state.paused = false;
        Ok(())
    }

    async fn remove(&self, id: &str, _force: bool) -> RuntimeResult<()> {
        self.containers
            .lock()
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| missing(id))
    }

    async fn inspect(&self, id: &str) -> RuntimeResult<ContainerState> {
        self.containers
            .lock()
            .get(id)
            .map(|c| c.state)
            .ok_or_else(|| missing(id))
    }

    async fn list_exited(&self) -> RuntimeResult<Vec<ExitedContainer>> {
        Ok(self
            .containers
            .lock()
            .iter()
            .filter(|(_, c)| !c.state.running && c.exit_code.is_some())
            .map(|(id, c)| ExitedContainer {
                id: id.clone(),
                image: c.image.clone(),
                status: format!("Exited ({}) 2 minutes ago", c.exit_code.unwrap_or(0)),
            })
            .collect())
    }
}
