//! lmesh ops: keeps one container per runnable component in the declared state.
//!
//! The container engine is a trait so the supervisor can run against Docker
//! (via bollard) or the in-memory engine used in tests.

#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use futures::stream::BoxStream;
use futures::StreamExt;
use lmesh_component::RuntimeParams;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

mod docker;
pub mod memory;
mod supervisor;

pub use docker::DockerEngine;
pub use supervisor::{ReadyOptions, Supervisor};

/// Label set on every container this tool creates.
pub const LABEL_MANAGED: &str = "lmesh.io/managed";
/// Label carrying the name a container was created under.
pub const LABEL_COMPONENT: &str = "lmesh.io/component";

/// A single line of container output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogChunk {
    pub line: String,
}

/// Engine-reported container state; never cached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    NotFound,
    Created,
    Running,
    Paused,
    Restarting,
    Exited,
    Dead,
}

impl ContainerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotFound => "not found",
            Self::Created => "created",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Restarting => "restarting",
            Self::Exited => "exited",
            Self::Dead => "dead",
        }
    }
}

impl std::fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { f.write_str(self.as_str()) }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerInfo {
    pub name: String,
    pub status: ContainerStatus,
    pub host_port: Option<u16>,
}

/// A container known to be running and reachable on `host_port`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerHandle {
    pub name: String,
    pub host_port: u16,
    /// False when an already running container was reused.
    pub created: bool,
}

pub type ByteStream = BoxStream<'static, Result<bytes::Bytes>>;

/// The operations the supervisor needs from a local container engine.
#[async_trait::async_trait]
pub trait ContainerEngine: Send + Sync {
    async fn status(&self, name: &str) -> Result<ContainerStatus>;

    /// Make `image` available locally. Only failures other than "not found" are errors.
    async fn pull(&self, image: &str, cancel: &CancellationToken) -> Result<()>;

    /// Create and start `name`, publishing the exposed port on `host_port`.
    async fn create_and_start(&self, name: &str, params: &RuntimeParams, host_port: u16) -> Result<()>;

    /// Force-remove `name`. Returns false if it did not exist.
    async fn remove(&self, name: &str) -> Result<bool>;

    /// Combined stdout/stderr; `since` is a unix timestamp, 0 for everything.
    async fn logs(&self, name: &str, follow: bool, since: i64) -> Result<ByteStream>;

    async fn host_port(&self, name: &str) -> Result<Option<u16>>;
}

/// Cancellation handle for an in-flight stream.
#[derive(Debug)]
pub struct CancelHandle {
    tx: Option<oneshot::Sender<()>>,
}

impl CancelHandle {
    pub fn cancel(mut self) {
        if let Some(tx) = self.tx.take() { let _ = tx.send(()); }
    }
}

/// Result of starting a streaming operation.
pub struct StreamHandle<T> {
    pub rx: mpsc::Receiver<T>,
    pub cancel: CancelHandle,
}

fn queue_cap() -> usize {
    std::env::var("LMESH_OPS_QUEUE_CAP").ok().and_then(|s| s.parse().ok()).unwrap_or(1024)
}

/// Spawn a pump turning `stream` into a bounded channel of lines.
pub fn spawn_line_stream(stream: ByteStream, ctx: String) -> StreamHandle<LogChunk> {
    let (tx, rx) = mpsc::channel::<LogChunk>(queue_cap());
    let (cancel_tx, cancel_rx) = oneshot::channel::<()>();
    tokio::spawn(async move {
        pump_bytes_to_lines(stream, tx, cancel_rx, Some(&ctx)).await;
    });
    StreamHandle { rx, cancel: CancelHandle { tx: Some(cancel_tx) } }
}

async fn pump_bytes_to_lines<S, E>(stream: S, tx: mpsc::Sender<LogChunk>, mut cancel_rx: oneshot::Receiver<()>, ctx: Option<&str>)
where
    S: futures::Stream<Item = Result<bytes::Bytes, E>>,
    E: std::fmt::Display,
{
    let stream = stream.fuse();
    futures::pin_mut!(stream);
    let mut buf = bytes::BytesMut::new();
    loop {
        let next = tokio::select! {
            _ = &mut cancel_rx => { if let Some(c) = ctx { debug!(ctx = %c, "log pump cancelled"); } return; }
            next = stream.next() => next,
        };
        match next {
            Some(Ok(chunk)) => {
                buf.extend_from_slice(&chunk);
                while let Some(pos) = buf.iter().position(|&b| b == b'\n') {
                    let line = buf.split_to(pos);
                    let _ = buf.split_to(1); // drop '\n'
                    let line = String::from_utf8_lossy(&line).trim_end_matches('\r').to_string();
                    if !send_line(&tx, LogChunk { line }, &mut cancel_rx).await { return; }
                }
            }
            Some(Err(e)) => { warn!(ctx = ?ctx, error = %e, "log stream error"); break; }
            None => break,
        }
    }
    if !buf.is_empty() {
        let line = String::from_utf8_lossy(&buf).to_string();
        if !send_line(&tx, LogChunk { line }, &mut cancel_rx).await { return; }
    }
    debug!(ctx = ?ctx, "log pump ended");
}

/// Wait for room in the channel. False once the reader is gone or the stream is cancelled.
async fn send_line(tx: &mpsc::Sender<LogChunk>, chunk: LogChunk, cancel_rx: &mut oneshot::Receiver<()>) -> bool {
    tokio::select! {
        _ = cancel_rx => false,
        sent = tx.send(chunk) => sent.is_ok(),
    }
}

/// Ask the OS for a currently free TCP port. Nothing is reserved.
pub fn free_port() -> Result<u16> {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").context("binding ephemeral port")?;
    Ok(listener.local_addr()?.port())
}

/// Poll a TCP connect to `addr` until it succeeds, `timeout` elapses, or `cancel` fires.
pub async fn wait_ready(addr: SocketAddr, poll: Duration, timeout: Duration, cancel: &CancellationToken) -> Result<Duration> {
    let started = Instant::now();
    let mut attempts = 0u32;
    loop {
        attempts += 1;
        let attempt = tokio::time::timeout(poll, tokio::net::TcpStream::connect(addr));
        let connected = tokio::select! {
            _ = cancel.cancelled() => return Err(anyhow!("readiness wait for {} cancelled", addr)),
            r = attempt => matches!(r, Ok(Ok(_))),
        };
        if connected {
            let waited = started.elapsed();
            debug!(addr = %addr, attempts, waited_ms = waited.as_millis() as u64, "port ready");
            return Ok(waited);
        }
        if started.elapsed() >= timeout {
            return Err(anyhow!("{} did not accept connections within {:?} ({} attempts)", addr, timeout, attempts));
        }
        tokio::select! {
            _ = cancel.cancelled() => return Err(anyhow!("readiness wait for {} cancelled", addr)),
            _ = tokio::time::sleep(poll) => {}
        }
    }
}

/// Host address under which containers reach services published on the host.
pub fn host_gateway() -> &'static str {
    if cfg!(target_os = "linux") { "172.17.0.1" } else { "host.docker.internal" }
}

/// Start time for non-following log reads: the last 24 hours.
pub fn logs_since(follow: bool) -> i64 {
    if follow { 0 } else { (chrono::Utc::now() - chrono::Duration::hours(24)).timestamp() }
}
