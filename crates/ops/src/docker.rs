//! Docker engine over the local socket (bollard).

use std::collections::HashMap;

use anyhow::{anyhow, Context, Result};
use bollard::container::{Config, CreateContainerOptions, InspectContainerOptions, LogsOptions, RemoveContainerOptions};
use bollard::image::CreateImageOptions;
use bollard::models::{ContainerInspectResponse, ContainerStateStatusEnum, HostConfig, PortBinding};
use bollard::Docker;
use futures::StreamExt;
use lmesh_component::RuntimeParams;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{ByteStream, ContainerEngine, ContainerStatus, LABEL_COMPONENT, LABEL_MANAGED};

fn is_not_found(e: &bollard::errors::Error) -> bool {
    matches!(e, bollard::errors::Error::DockerResponseServerError { status_code: 404, .. })
}

pub struct DockerEngine {
    docker: Docker,
}

impl DockerEngine {
    /// Connect using the platform default socket (or `DOCKER_HOST`).
    pub fn connect() -> Result<Self> {
        let docker = Docker::connect_with_local_defaults().context("connecting to the local Docker engine")?;
        Ok(Self { docker })
    }

    async fn inspect(&self, name: &str) -> Result<Option<ContainerInspectResponse>> {
        match self.docker.inspect_container(name, None::<InspectContainerOptions>).await {
            Ok(r) => Ok(Some(r)),
            Err(e) if is_not_found(&e) => Ok(None),
            Err(e) => Err(anyhow::Error::new(e).context(format!("inspecting container {}", name))),
        }
    }
}

#[async_trait::async_trait]
impl ContainerEngine for DockerEngine {
    async fn status(&self, name: &str) -> Result<ContainerStatus> {
        let Some(r) = self.inspect(name).await? else { return Ok(ContainerStatus::NotFound) };
        let status = r.state.and_then(|s| s.status);
        Ok(match status {
            Some(ContainerStateStatusEnum::RUNNING) => ContainerStatus::Running,
            Some(ContainerStateStatusEnum::CREATED) => ContainerStatus::Created,
            Some(ContainerStateStatusEnum::PAUSED) => ContainerStatus::Paused,
            Some(ContainerStateStatusEnum::RESTARTING) => ContainerStatus::Restarting,
            Some(ContainerStateStatusEnum::EXITED) => ContainerStatus::Exited,
            // Removing or unknown: treat as gone for good
            _ => ContainerStatus::Dead,
        })
    }

    async fn pull(&self, image: &str, cancel: &CancellationToken) -> Result<()> {
        let opts = CreateImageOptions { from_image: image.to_string(), ..Default::default() };
        let stream = self.docker.create_image(Some(opts), None, None);
        futures::pin_mut!(stream);
        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => return Err(anyhow!("pull of {} cancelled", image)),
                n = stream.next() => n,
            };
            match next {
                Some(Ok(info)) => {
                    if let Some(status) = info.status.as_deref() {
                        debug!(image = %image, status = %status, progress = ?info.progress, "pull");
                    }
                }
                Some(Err(e)) if is_not_found(&e) => {
                    // May still exist locally; creation reports it if not
                    warn!(image = %image, error = %e, "image not found in registry");
                    return Ok(());
                }
                Some(Err(e)) => return Err(anyhow::Error::new(e).context(format!("pulling image {}", image))),
                None => break,
            }
        }
        info!(image = %image, "image pulled");
        Ok(())
    }

    async fn create_and_start(&self, name: &str, params: &RuntimeParams, host_port: u16) -> Result<()> {
        let port_key = format!("{}/tcp", params.exposed_port);
        let bindings: HashMap<String, Option<Vec<PortBinding>>> = HashMap::from([(
            port_key.clone(),
            Some(vec![PortBinding { host_ip: Some("0.0.0.0".into()), host_port: Some(host_port.to_string()) }]),
        )]);
        let host_config = HostConfig {
            binds: if params.volumes.is_empty() { None } else { Some(params.volumes.clone()) },
            port_bindings: Some(bindings),
            extra_hosts: Some(vec!["host.docker.internal:host-gateway".to_string()]),
            ..Default::default()
        };
        let labels = HashMap::from([
            (LABEL_MANAGED.to_string(), "true".to_string()),
            (LABEL_COMPONENT.to_string(), name.to_string()),
        ]);
        let config = Config {
            image: Some(params.image.clone()),
            env: Some(params.env.clone()),
            exposed_ports: Some(HashMap::from([(port_key, HashMap::new())])),
            entrypoint: params.entrypoint.clone(),
            labels: Some(labels),
            host_config: Some(host_config),
            ..Default::default()
        };
        let options = CreateContainerOptions { name: name.to_string(), ..Default::default() };
        self.docker
            .create_container(Some(options), config)
            .await
            .with_context(|| format!("creating container {} from {}", name, params.image))?;
        self.docker
            .start_container::<String>(name, None)
            .await
            .with_context(|| format!("starting container {}", name))?;
        info!(container = %name, image = %params.image, host_port, "container started");
        Ok(())
    }

    async fn remove(&self, name: &str) -> Result<bool> {
        let opts = RemoveContainerOptions { force: true, ..Default::default() };
        match self.docker.remove_container(name, Some(opts)).await {
            Ok(()) => Ok(true),
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => Err(anyhow::Error::new(e).context(format!("removing container {}", name))),
        }
    }

    async fn logs(&self, name: &str, follow: bool, since: i64) -> Result<ByteStream> {
        if self.inspect(name).await?.is_none() {
            return Err(anyhow!("container {} not found", name));
        }
        let opts = LogsOptions::<String> { follow, stdout: true, stderr: true, since, tail: "all".to_string(), ..Default::default() };
        let stream = self
            .docker
            .logs(name, Some(opts))
            .map(|r| r.map(|out| out.into_bytes()).map_err(anyhow::Error::from));
        Ok(stream.boxed())
    }

    async fn host_port(&self, name: &str) -> Result<Option<u16>> {
        let Some(r) = self.inspect(name).await? else { return Ok(None) };
        let ports = r.network_settings.and_then(|n| n.ports).unwrap_or_default();
        let mut keys: Vec<&String> = ports.keys().collect();
        keys.sort();
        let port = keys
            .into_iter()
            .filter_map(|k| ports.get(k).cloned().flatten())
            .flatten()
            .find_map(|b| b.host_port.and_then(|p| p.parse::<u16>().ok()));
        Ok(port)
    }
}
