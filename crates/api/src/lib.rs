//! lmesh public API façade (in-process).
//!
//! Frontends depend on the [`LmeshApi`] trait and the plain data types below.
//! [`InProcApi`] drives the manifest, the routing config and the container
//! supervisor of one broker directly.

#![forbid(unsafe_code)]

use async_trait::async_trait;
use lmesh_core::{Map, Value};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

mod config;
mod inproc;

pub use config::Config;
pub use inproc::{container_name, InProcApi};
pub use lmesh_ops::{ContainerHandle, ContainerStatus, LogChunk, StreamHandle};
pub use lmesh_routing::Filter;

/// API errors, serializable for JSON output.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum LmeshError {
    #[error("validation: {0}")]
    Validation(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("engine: {0}")]
    Engine(String),
    #[error("internal: {0}")]
    Internal(String),
}

pub type LmeshResult<T> = Result<T, LmeshError>;

/// Which events a consumer receives: everything produced by `sources` plus `event_types`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Subscription {
    pub sources: Vec<String>,
    pub event_types: Vec<String>,
}

impl Subscription {
    pub fn is_empty(&self) -> bool { self.sources.is_empty() && self.event_types.is_empty() }
}

/// Input for creating a catalog component (source, target or transformation).
#[derive(Debug, Clone, Default)]
pub struct CreateRequest {
    pub kind: String,
    /// Defaults to `<broker>-<kind>`.
    pub name: Option<String>,
    pub spec: Map,
    /// Overrides the event types the component is declared to produce.
    pub event_types: Vec<String>,
    pub subscribe: Subscription,
}

/// Input for wiring a user supplied image into the broker.
#[derive(Debug, Clone, Default)]
pub struct ServiceRequest {
    pub name: String,
    pub image: String,
    pub env: Map,
    pub command: Option<Vec<String>>,
    /// Event types the service replies with.
    pub event_types: Vec<String>,
    pub subscribe: Subscription,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Created {
    pub name: String,
    pub kind: String,
    pub secret: Option<String>,
    pub container: ContainerHandle,
    pub trigger: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KindInfo {
    pub kind: String,
    pub api_version: String,
    pub category: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentStatus {
    pub name: String,
    pub kind: String,
    pub status: ContainerStatus,
    pub host_port: Option<u16>,
    pub produces: Vec<String>,
    pub accepts: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerStatus {
    pub name: String,
    pub target: String,
    pub url: String,
    pub filters: Vec<Filter>,
}

impl From<&lmesh_routing::Trigger> for TriggerStatus {
    fn from(t: &lmesh_routing::Trigger) -> Self {
        Self { name: t.name.clone(), target: t.target.component.clone(), url: t.target.url.clone(), filters: t.filters.clone() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerDescription {
    pub broker: String,
    pub components: Vec<ComponentStatus>,
    pub triggers: Vec<TriggerStatus>,
}

/// Operations over the broker selected in [`Config`].
#[async_trait]
pub trait LmeshApi: Send + Sync {
    fn config(&self) -> &Config;

    /// Component kinds of the loaded catalog.
    async fn kinds(&self) -> LmeshResult<Vec<KindInfo>>;

    /// Brokers with state under the home directory.
    async fn brokers(&self) -> LmeshResult<Vec<String>>;

    /// Record the broker, write an empty routing config and run the broker container.
    async fn create_broker(&self, cancel: &CancellationToken) -> LmeshResult<ContainerHandle>;

    async fn create_source(&self, req: CreateRequest, cancel: &CancellationToken) -> LmeshResult<Created>;

    async fn create_target(&self, req: CreateRequest, cancel: &CancellationToken) -> LmeshResult<Created>;

    async fn create_transformation(&self, req: CreateRequest, cancel: &CancellationToken) -> LmeshResult<Created>;

    async fn create_service(&self, req: ServiceRequest, cancel: &CancellationToken) -> LmeshResult<Created>;

    /// Route events to a running consumer. An empty subscription routes everything.
    async fn create_trigger(&self, name: Option<String>, target: &str, subscribe: Subscription) -> LmeshResult<TriggerStatus>;

    /// Delete a trigger, a component (with its triggers, secrets and container)
    /// or, given the broker's own name, the whole broker. Returns removed object names.
    async fn delete(&self, name: &str) -> LmeshResult<Vec<String>>;

    async fn describe(&self) -> LmeshResult<BrokerDescription>;

    /// Start one component, or every runnable component when `name` is None.
    async fn start(&self, name: Option<&str>, restart: bool, cancel: &CancellationToken) -> LmeshResult<Vec<ContainerHandle>>;

    /// Remove containers; returns the names that were running.
    async fn stop(&self, name: Option<&str>) -> LmeshResult<Vec<String>>;

    async fn logs(&self, name: &str, follow: bool) -> LmeshResult<StreamHandle<LogChunk>>;

    /// The broker manifest as `---`-separated YAML.
    async fn dump(&self) -> LmeshResult<String>;
}

/// Parse `a.b=c` pairs into a nested spec map. Values stay strings; the
/// schema engine coerces them.
pub fn spec_from_pairs(pairs: &[String]) -> LmeshResult<Map> {
    let mut root = Map::new();
    extend_spec(&mut root, pairs)?;
    Ok(root)
}

/// Apply `a.b=c` pairs on top of an existing spec, e.g. one read from a file.
pub fn extend_spec(root: &mut Map, pairs: &[String]) -> LmeshResult<()> {
    for pair in pairs.iter() {
        let (path, value) = pair
            .split_once('=')
            .ok_or_else(|| LmeshError::Validation(format!("expected key=value, got {:?}", pair)))?;
        let segments: Vec<&str> = path.split('.').map(str::trim).collect();
        if segments.iter().any(|s| s.is_empty()) {
            return Err(LmeshError::Validation(format!("invalid property path {:?}", path)));
        }
        insert_path(root, &segments, Value::from(value), path)?;
    }
    Ok(())
}

fn insert_path(map: &mut Map, segments: &[&str], value: Value, full: &str) -> LmeshResult<()> {
    match segments {
        [] => Ok(()),
        [last] => {
            if map.get(*last).map(|v| v.as_map().is_some()).unwrap_or(false) {
                return Err(LmeshError::Validation(format!("{:?} is an object and cannot take a value", full)));
            }
            map.insert(last.to_string(), value);
            Ok(())
        }
        [head, rest @ ..] => {
            let child = map.entry(head.to_string()).or_insert_with(|| Value::Map(Map::new()));
            match child.as_map_mut() {
                Some(m) => insert_path(m, rest, value, full),
                None => Err(LmeshError::Validation(format!("{:?} sets a property below the scalar {:?}", full, head))),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pairs(v: &[&str]) -> Vec<String> { v.iter().map(|s| s.to_string()).collect() }

    #[test]
    fn pairs_nest_on_dots() {
        let m = spec_from_pairs(&pairs(&["schedule=*/1 * * * *", "auth.credentials.key=abc", "auth.region=eu", "q=a=b"])).unwrap();
        let v = Value::Map(m);
        assert_eq!(v.pointer("schedule").and_then(Value::as_str), Some("*/1 * * * *"));
        assert_eq!(v.pointer("auth.credentials.key").and_then(Value::as_str), Some("abc"));
        assert_eq!(v.pointer("auth.region").and_then(Value::as_str), Some("eu"));
        assert_eq!(v.pointer("q").and_then(Value::as_str), Some("a=b"));
    }

    #[test]
    fn pairs_extend_a_file_spec() {
        let mut base = match lmesh_core::map! { "auth" => lmesh_core::map! { "region" => "us" }, "arn" => "x" } {
            Value::Map(m) => m,
            _ => unreachable!(),
        };
        extend_spec(&mut base, &pairs(&["auth.region=eu", "auth.key=k"])).unwrap();
        let v = Value::Map(base);
        assert_eq!(v.pointer("auth.region").and_then(Value::as_str), Some("eu"));
        assert_eq!(v.pointer("auth.key").and_then(Value::as_str), Some("k"));
        assert_eq!(v.pointer("arn").and_then(Value::as_str), Some("x"));
    }

    #[test]
    fn conflicting_pairs_are_rejected() {
        assert!(matches!(spec_from_pairs(&pairs(&["a=1", "a.b=2"])), Err(LmeshError::Validation(_))));
        assert!(matches!(spec_from_pairs(&pairs(&["a.b=2", "a=1"])), Err(LmeshError::Validation(_))));
        assert!(matches!(spec_from_pairs(&pairs(&["novalue"])), Err(LmeshError::Validation(_))));
        assert!(matches!(spec_from_pairs(&pairs(&["a..b=1"])), Err(LmeshError::Validation(_))));
    }

    #[test]
    fn errors_render_with_their_class() {
        assert_eq!(LmeshError::NotFound("component x".into()).to_string(), "not found: component x");
        let json = serde_json::to_string(&LmeshError::Conflict("c".into())).unwrap();
        assert_eq!(json, r#"{"Conflict":"c"}"#);
    }
}
