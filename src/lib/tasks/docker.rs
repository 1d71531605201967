use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use bollard::{
    Docker,
    auth::DockerCredentials,
    container::{
        Config, CreateContainerOptions, InspectContainerOptions, KillContainerOptions,
        ListContainersOptions, RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
        WaitContainerOptions,
    },
    image::CreateImageOptions,
    models::{HostConfig, PortBinding},
};
use futures_util::stream::StreamExt;
use tracing::{debug, info, warn};

use super::executor::LaunchSpec;
use super::types::{
    ContainerSummary, Engine, EngineError, EngineResult, EngineVersion, ObservedContainer,
    RegistryAuth,
};

pub const DOCKER_ENGINE: &str = "docker";

/// Seconds the daemon waits after SIGTERM before killing a stopped container.
pub const STOP_TIMEOUT_SECS: i64 = 10;

/// Maps daemon status codes the agent reacts to onto engine errors.
fn classify(runtime_id: &str, e: bollard::errors::Error) -> EngineError {
    match e {
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404, ..
        } => EngineError::NotFound(runtime_id.to_string()),
        bollard::errors::Error::DockerResponseServerError {
            status_code: 409,
            message,
        } => EngineError::Conflict(message),
        e => e.into(),
    }
}

/// Engine adapter over the local Docker daemon.
#[derive(Debug, Clone)]
pub struct DockerEngine {
    client: Docker,
}

impl DockerEngine {
    pub fn connect() -> EngineResult<Self> {
        let client = Docker::connect_with_unix_defaults()?;
        Ok(DockerEngine { client })
    }

    /// Creates and starts a container from executor arguments, returning its
    /// runtime id.
    pub async fn launch(&self, spec: &LaunchSpec) -> EngineResult<String> {
        let mut port_bindings = HashMap::new();
        let mut exposed_ports = HashMap::new();
        if spec.network_mode == "bridge" {
            if let (Some(container_port), Some(host_port)) = (spec.container_port, spec.host_port) {
                let key = format!("{}/tcp", container_port);
                exposed_ports.insert(key.clone(), HashMap::new());
                port_bindings.insert(
                    key,
                    Some(vec![PortBinding {
                        host_ip: None,
                        host_port: Some(host_port.to_string()),
                    }]),
                );
            }
        }

        let host_config = HostConfig {
            cpu_shares: Some(spec.cpu_shares),
            memory: (spec.memory > 0).then(|| (spec.memory * 1024 * 1024) as i64),
            network_mode: Some(spec.network_mode.clone()),
            privileged: Some(spec.privileged),
            binds: (!spec.binds.is_empty()).then(|| spec.binds.clone()),
            port_bindings: (!port_bindings.is_empty()).then_some(port_bindings),
            ..Default::default()
        };

        let container_config = Config {
            image: Some(spec.image.clone()),
            env: Some(spec.env.clone()),
            cmd: spec
                .command
                .as_ref()
                .map(|cmd| vec!["/bin/sh".to_string(), "-c".to_string(), cmd.clone()]),
            exposed_ports: (!exposed_ports.is_empty()).then_some(exposed_ports),
            host_config: Some(host_config),
            ..Default::default()
        };

        self.remove_stale(&spec.name).await?;

        let options = Some(CreateContainerOptions {
            name: spec.name.clone(),
            ..Default::default()
        });

        let created = self
            .client
            .create_container(options, container_config)
            .await?;
        debug!("Container created: {} ({})", spec.name, created.id);

        self.client
            .start_container(&created.id, None::<StartContainerOptions<String>>)
            .await?;
        info!("Container {} started", spec.name);

        Ok(created.id)
    }

    /// Removes a dead container left under `name` by an interrupted stop so
    /// the name can be reused. A live one is left for create to reject.
    async fn remove_stale(&self, name: &str) -> EngineResult<()> {
        match self.inspect(name).await {
            Ok(stale) if !stale.running && !stale.restarting => {
                info!("Removing stale container {}", name);
                self.remove(&stale.runtime_id, true).await
            }
            Ok(_) | Err(EngineError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Blocks until the container exits and returns its exit code.
    pub async fn wait(&self, runtime_id: &str) -> EngineResult<i64> {
        let mut stream = self
            .client
            .wait_container(runtime_id, None::<WaitContainerOptions<String>>);

        let mut code = 0;
        while let Some(msg) = stream.next().await {
            match msg {
                Ok(response) => code = response.status_code,
                Err(bollard::errors::Error::DockerContainerWaitError { code: exit, .. }) => {
                    code = exit
                }
                Err(e) => return Err(e.into()),
            }
        }

        Ok(code)
    }

    pub async fn stop_and_remove(&self, runtime_id: &str) -> EngineResult<()> {
        if let Err(e) = self
            .client
            .stop_container(runtime_id, Some(StopContainerOptions { t: STOP_TIMEOUT_SECS }))
            .await
        {
            warn!("Failed to stop container {}: {}", runtime_id, e);
        }

        self.remove(runtime_id, true).await
    }
}

impl From<&RegistryAuth> for Option<DockerCredentials> {
    fn from(auth: &RegistryAuth) -> Self {
        if auth == &RegistryAuth::default() {
            return None;
        }

        Some(DockerCredentials {
            username: auth.username.clone(),
            password: auth.password.clone(),
            email: auth.email.clone(),
            serveraddress: auth.serveraddress.clone(),
            ..Default::default()
        })
    }
}

#[async_trait]
impl Engine for DockerEngine {
    fn name(&self) -> &str {
        DOCKER_ENGINE
    }

    async fn version(&self) -> EngineResult<EngineVersion> {
        let version = self.client.version().await?;
        Ok(EngineVersion {
            client_version: version.version,
            api_version: version.api_version,
            go_version: version.go_version,
        })
    }

    async fn list_containers(&self, all: bool) -> EngineResult<Vec<ContainerSummary>> {
        let containers = self
            .client
            .list_containers(Some(ListContainersOptions::<String> {
                all,
                ..Default::default()
            }))
            .await?;

        Ok(containers
            .into_iter()
            .filter_map(|container| {
                let runtime_id = container.id?;
                let name = container.names?.into_iter().next()?;
                Some(ContainerSummary {
                    runtime_id,
                    name: name.trim_start_matches('/').to_string(),
                })
            })
            .collect())
    }

    async fn inspect(&self, runtime_id: &str) -> EngineResult<ObservedContainer> {
        let info = self
            .client
            .inspect_container(runtime_id, None::<InspectContainerOptions>)
            .await
            .map_err(|e| classify(runtime_id, e))?;

        let state = info.state.unwrap_or_default();
        let host_config = info.host_config.unwrap_or_default();

        let port_bindings: BTreeMap<String, Vec<String>> = host_config
            .port_bindings
            .unwrap_or_default()
            .into_iter()
            .map(|(port, bindings)| {
                let hosts = bindings
                    .unwrap_or_default()
                    .into_iter()
                    .filter_map(|binding| binding.host_port)
                    .collect();
                (port, hosts)
            })
            .collect();

        let created = info
            .created
            .as_deref()
            .and_then(|created| chrono::DateTime::parse_from_rfc3339(created).ok())
            .map(|created| created.timestamp_millis());

        Ok(ObservedContainer {
            runtime_id: info.id.unwrap_or_else(|| runtime_id.to_string()),
            name: info
                .name
                .unwrap_or_default()
                .trim_start_matches('/')
                .to_string(),
            running: state.running.unwrap_or(false),
            restarting: state.restarting.unwrap_or(false),
            created,
            network_mode: host_config.network_mode,
            port_bindings,
            env: info.config.and_then(|config| config.env).unwrap_or_default(),
        })
    }

    async fn pull(&self, image: &str, auth: &RegistryAuth) -> EngineResult<()> {
        debug!("Pulling image: {}", image);

        let mut stream = self.client.create_image(
            Some(CreateImageOptions {
                from_image: image,
                ..Default::default()
            }),
            None,
            auth.into(),
        );

        while let Some(msg) = stream.next().await {
            if let Err(e) = msg {
                return Err(EngineError::Pull {
                    image: image.to_string(),
                    reason: e.to_string(),
                });
            }
        }

        debug!("Image pulled: {}", image);
        Ok(())
    }

    async fn kill(&self, runtime_id: &str) -> EngineResult<()> {
        self.client
            .kill_container(runtime_id, None::<KillContainerOptions<String>>)
            .await
            .map_err(|e| classify(runtime_id, e))?;
        Ok(())
    }

    async fn remove(&self, runtime_id: &str, force: bool) -> EngineResult<()> {
        self.client
            .remove_container(
                runtime_id,
                Some(RemoveContainerOptions {
                    force,
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| classify(runtime_id, e))?;
        Ok(())
    }
}
