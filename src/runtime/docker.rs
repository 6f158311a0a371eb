//! Docker implementation of the container runtime

use std::collections::HashMap;

use async_trait::async_trait;
use bollard::container::{
    Config, ListContainersOptions, RemoveContainerOptions, StopContainerOptions,
};
use bollard::models::{HostConfig, PortBinding};
use bollard::Docker;
use tracing::{debug, info};

use super::traits::{
    ContainerRuntime, ContainerSpec, ContainerState, CreatedContainer, ExitedContainer,
    RuntimeError, RuntimeResult,
};

/// Docker-backed container runtime
#[derive(Clone)]
pub struct DockerRuntime {
    client: Docker,
}

impl DockerRuntime {
    /// Connect using the platform defaults (DOCKER_HOST or the local socket)
    pub fn new() -> RuntimeResult<Self> {
        let client = Docker::connect_with_local_defaults().map_err(RuntimeError::Docker)?;
        Ok(Self { client })
    }

    /// Connect to an explicit endpoint: an http(s) URL or a unix socket path
    pub fn connect(url: &str) -> RuntimeResult<Self> {
        let client = if url.starts_with("http://") || url.starts_with("https://") {
            Docker::connect_with_http(url, 120, bollard::API_DEFAULT_VERSION)
        } else {
            Docker::connect_with_socket(url, 120, bollard::API_DEFAULT_VERSION)
        }
        .map_err(RuntimeError::Docker)?;
        Ok(Self { client })
    }

    fn map_not_found(id: &str, e: bollard::errors::Error) -> RuntimeError {
        match e {
            bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            } => RuntimeError::ContainerNotFound(id.to_string()),
            _ => RuntimeError::Docker(e),
        }
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn create(&self, spec: &ContainerSpec) -> RuntimeResult<CreatedContainer> {
        let mut port_bindings: HashMap<String, Option<Vec<PortBinding>>> = HashMap::new();
        let mut exposed_ports: HashMap<String, HashMap<(), ()>> = HashMap::new();

        for (container_port, host_port) in &spec.port_bindings {
            let key = format!("{}/tcp", container_port);
            port_bindings.insert(
                key.clone(),
                Some(vec![PortBinding {
                    host_ip: None,
                    host_port: Some(host_port.to_string()),
                }]),
            );
            exposed_ports.insert(key, HashMap::new());
        }

        let binds: Vec<String> = spec.volume_binds.iter().map(|b| b.to_bind()).collect();

        let host_config = HostConfig {
            port_bindings: Some(port_bindings),
            binds: if binds.is_empty() { None } else { Some(binds) },
            volumes_from: if spec.volumes_from.is_empty() {
                None
            } else {
                Some(spec.volumes_from.clone())
            },
            ..Default::default()
        };

        let config = Config {
            image: Some(spec.image.clone()),
            exposed_ports: Some(exposed_ports),
            host_config: Some(host_config),
            ..Default::default()
        };

        let response = self
            .client
            .create_container::<String, String>(None, config)
            .await
            .map_err(RuntimeError::Docker)?;

        info!("Created container {}", response.id);

        Ok(CreatedContainer {
            id: response.id,
            warnings: response.warnings,
        })
    }

    async fn start(&self, id: &str) -> RuntimeResult<()> {
        self.client
            .start_container::<String>(id, None)
            .await
            .map_err(|e| Self::map_not_found(id, e))?;
        debug!("Started container {}", id);
        Ok(())
    }

    async fn stop(&self, id: &str) -> RuntimeResult<()> {
        let options = Some(StopContainerOptions { t: 10 });
        self.client
            .stop_container(id, options)
            .await
            .map_err(|e| Self::map_not_found(id, e))?;
        debug!("Stopped container {}", id);
        Ok(())
    }

    async fn pause(&self, id: &str) -> RuntimeResult<()> {
        self.client
            .pause_container(id)
            .await
            .map_err(|e| Self::map_not_found(id, e))?;
        debug!("Paused container {}", id);
        Ok(())
    }

    async fn unpause(&self, id: &str) -> RuntimeResult<()> {
        self.client
            .unpause_container(id)
            .await
            .map_err(|e| Self::map_not_found(id, e))?;
        debug!("Unpaused container {}", id);
        Ok(())
    }

    async fn remove(&self, id: &str, force: bool) -> RuntimeResult<()> {
        let options = Some(RemoveContainerOptions {
            force,
            v: true,
            ..Default::default()
        });
        self.client
            .remove_container(id, options)
            .await
            .map_err(|e| Self::map_not_found(id, e))?;
        debug!("Removed container {}", id);
        Ok(())
    }

    async fn inspect(&self, id: &str) -> RuntimeResult<ContainerState> {
        let inspect = self
            .client
            .inspect_container(id, None)
            .await
            .map_err(|e| Self::map_not_found(id, e))?;

        let state = inspect.state.unwrap_or_default();
        Ok(ContainerState {
            running: state.running.unwrap_or(false),
            paused: state.paused.unwrap_or(false),
        })
    }

    async fn list_exited(&self) -> RuntimeResult<Vec<ExitedContainer>> {
        let mut filters = HashMap::new();
        filters.insert("status".to_string(), vec!["exited".to_string()]);

        let options = Some(ListContainersOptions::<String> {
            all: true,
            filters,
            ..Default::default()
        });

        let containers = self
            .client
            .list_containers(options)
            .await
            .map_err(RuntimeError::Docker)?;

        Ok(containers
            .into_iter()
            .map(|c| ExitedContainer {
                id: c.id.unwrap_or_default(),
                image: c.image.unwrap_or_default(),
                status: c.status.unwrap_or_default(),
            })
            .collect())
    }
}
