//! Idempotent start/stop/info/logs over a container engine.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use lmesh_component::RuntimeParams;
use metrics::{counter, histogram};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{free_port, logs_since, spawn_line_stream, wait_ready, ContainerEngine, ContainerHandle, ContainerInfo, ContainerStatus, LogChunk, StreamHandle};

/// Readiness polling budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadyOptions {
    pub poll: Duration,
    pub timeout: Duration,
}

impl Default for ReadyOptions {
    fn default() -> Self { Self { poll: Duration::from_millis(250), timeout: Duration::from_secs(30) } }
}

impl ReadyOptions {
    /// `LMESH_READY_POLL_MS` and `LMESH_READY_TIMEOUT_SECS` override the defaults.
    pub fn from_env() -> Self {
        let d = Self::default();
        let poll = std::env::var("LMESH_READY_POLL_MS").ok().and_then(|s| s.parse::<u64>().ok()).map(Duration::from_millis).unwrap_or(d.poll);
        let timeout = std::env::var("LMESH_READY_TIMEOUT_SECS").ok().and_then(|s| s.parse::<u64>().ok()).map(Duration::from_secs).unwrap_or(d.timeout);
        Self { poll, timeout }
    }
}

/// Keeps exactly one container per component name in the requested state.
/// Container state is read from the engine on every call.
#[derive(Clone)]
pub struct Supervisor {
    engine: Arc<dyn ContainerEngine>,
    ready: ReadyOptions,
}

impl Supervisor {
    pub fn new(engine: Arc<dyn ContainerEngine>) -> Self {
        Self { engine, ready: ReadyOptions::from_env() }
    }

    pub fn with_ready_options(mut self, ready: ReadyOptions) -> Self {
        self.ready = ready;
        self
    }

    pub fn engine(&self) -> &Arc<dyn ContainerEngine> { &self.engine }

    /// Ensure `name` runs `params`.
    ///
    /// A running container is reused unless `restart` is set; stopped or dead
    /// ones are removed and recreated. New containers must accept TCP
    /// connections on their host port before this returns.
    pub async fn start(&self, params: &RuntimeParams, name: &str, restart: bool, cancel: &CancellationToken) -> Result<ContainerHandle> {
        let status = self.engine.status(name).await?;
        debug!(container = %name, status = %status, restart, "start requested");
        match status {
            ContainerStatus::Running if !restart => {
                let host_port = self
                    .engine
                    .host_port(name)
                    .await?
                    .ok_or_else(|| anyhow!("container {} is running without a published port", name))?;
                counter!("supervisor_reuse_total", 1u64);
                return Ok(ContainerHandle { name: name.to_string(), host_port, created: false });
            }
            ContainerStatus::NotFound => {
                self.engine.pull(&params.image, cancel).await?;
            }
            _ => {
                // Best effort: creation fails loudly if the old one is still there
                match self.engine.remove(name).await {
                    Ok(_) => debug!(container = %name, "removed before recreate"),
                    Err(e) => warn!(container = %name, error = %e, "remove before recreate failed"),
                }
                counter!("supervisor_recreate_total", 1u64);
            }
        }

        let host_port = match params.host_port {
            Some(p) => p,
            None => free_port()?,
        };
        self.engine
            .create_and_start(name, params, host_port)
            .await
            .with_context(|| format!("starting {}", name))?;
        counter!("supervisor_start_total", 1u64);

        let started = Instant::now();
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, host_port));
        wait_ready(addr, self.ready.poll, self.ready.timeout, cancel)
            .await
            .with_context(|| format!("waiting for {} to become ready", name))?;
        histogram!("supervisor_ready_ms", started.elapsed().as_secs_f64() * 1000.0);
        info!(container = %name, host_port, "container ready");
        Ok(ContainerHandle { name: name.to_string(), host_port, created: true })
    }

    /// Remove `name`; an absent container is not an error. Returns true if removed.
    pub async fn stop(&self, name: &str) -> Result<bool> {
        let removed = self.engine.remove(name).await?;
        if removed {
            counter!("supervisor_stop_total", 1u64);
            info!(container = %name, "container removed");
        }
        Ok(removed)
    }

    pub async fn info(&self, name: &str) -> Result<ContainerInfo> {
        let status = self.engine.status(name).await?;
        let host_port = if status == ContainerStatus::NotFound { None } else { self.engine.host_port(name).await? };
        Ok(ContainerInfo { name: name.to_string(), status, host_port })
    }

    /// Stream container output line by line; the last 24 hours unless following.
    pub async fn logs(&self, name: &str, follow: bool) -> Result<StreamHandle<LogChunk>> {
        let stream = self.engine.logs(name, follow, logs_since(follow)).await?;
        info!(container = %name, follow, "logs stream starting");
        Ok(spawn_line_stream(stream, name.to_string()))
    }
}
