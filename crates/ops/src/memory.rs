//! In-memory container engine.
//!
//! "Running" containers hold a real listener on their host port so readiness
//! checks behave as with a real engine.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

use anyhow::{anyhow, Result};
use futures::StreamExt;
use lmesh_component::RuntimeParams;
use tokio_util::sync::CancellationToken;

use crate::{ByteStream, ContainerEngine, ContainerStatus};

#[derive(Debug)]
pub struct MemoryContainer {
    pub params: RuntimeParams,
    pub status: ContainerStatus,
    pub host_port: u16,
    pub logs: Vec<String>,
    listener: Option<std::net::TcpListener>,
}

#[derive(Debug, Default)]
struct State {
    containers: BTreeMap<String, MemoryContainer>,
    never_ready: BTreeSet<String>,
    pulls: Vec<String>,
    creates: usize,
    removes: usize,
}

/// Engine double. Set `listen` to false to simulate containers that never become ready.
#[derive(Debug)]
pub struct MemoryEngine {
    state: Mutex<State>,
    listen: bool,
}

impl Default for MemoryEngine {
    fn default() -> Self { Self::new() }
}

impl MemoryEngine {
    pub fn new() -> Self { Self { state: Mutex::new(State::default()), listen: true } }

    pub fn without_listeners() -> Self { Self { state: Mutex::new(State::default()), listen: false } }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn creates(&self) -> usize { self.lock().creates }

    pub fn removes(&self) -> usize { self.lock().removes }

    pub fn pulls(&self) -> Vec<String> { self.lock().pulls.clone() }

    pub fn names(&self) -> Vec<String> { self.lock().containers.keys().cloned().collect() }

    pub fn params(&self, name: &str) -> Option<RuntimeParams> { self.lock().containers.get(name).map(|c| c.params.clone()) }

    /// Force a container into `status`, closing its listener unless running.
    pub fn set_status(&self, name: &str, status: ContainerStatus) {
        if let Some(c) = self.lock().containers.get_mut(name) {
            c.status = status;
            if status != ContainerStatus::Running { c.listener = None; }
        }
    }

    /// Containers created under `name` from now on never accept connections.
    pub fn never_ready(&self, name: &str) {
        self.lock().never_ready.insert(name.to_string());
    }

    pub fn push_log(&self, name: &str, line: &str) {
        if let Some(c) = self.lock().containers.get_mut(name) { c.logs.push(line.to_string()); }
    }
}

#[async_trait::async_trait]
impl ContainerEngine for MemoryEngine {
    async fn status(&self, name: &str) -> Result<ContainerStatus> {
        Ok(self.lock().containers.get(name).map(|c| c.status).unwrap_or(ContainerStatus::NotFound))
    }

    async fn pull(&self, image: &str, cancel: &CancellationToken) -> Result<()> {
        if cancel.is_cancelled() { return Err(anyhow!("pull of {} cancelled", image)); }
        self.lock().pulls.push(image.to_string());
        Ok(())
    }

    async fn create_and_start(&self, name: &str, params: &RuntimeParams, host_port: u16) -> Result<()> {
        let mut st = self.lock();
        if st.containers.contains_key(name) {
            return Err(anyhow!("container name {:?} is already in use", name));
        }
        let listen = self.listen && !st.never_ready.contains(name);
        let listener = if listen { Some(std::net::TcpListener::bind(("127.0.0.1", host_port))?) } else { None };
        st.containers.insert(
            name.to_string(),
            MemoryContainer { params: params.clone(), status: ContainerStatus::Running, host_port, logs: Vec::new(), listener },
        );
        st.creates += 1;
        Ok(())
    }

    async fn remove(&self, name: &str) -> Result<bool> {
        let mut st = self.lock();
        let removed = st.containers.remove(name).is_some();
        if removed { st.removes += 1; }
        Ok(removed)
    }

    async fn logs(&self, name: &str, _follow: bool, _since: i64) -> Result<ByteStream> {
        let st = self.lock();
        let c = st.containers.get(name).ok_or_else(|| anyhow!("container {} not found", name))?;
        let chunks: Vec<Result<bytes::Bytes>> = c.logs.iter().map(|l| Ok(bytes::Bytes::from(format!("{}\n", l)))).collect();
        Ok(futures::stream::iter(chunks).boxed())
    }

    async fn host_port(&self, name: &str) -> Result<Option<u16>> {
        Ok(self.lock().containers.get(name).map(|c| c.host_port))
    }
}
