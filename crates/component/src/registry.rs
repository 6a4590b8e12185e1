//! Kind dispatch: catalog kinds get the generic handler, a few kinds override it.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use lmesh_core::{Map, Object, Value};
use lmesh_schema::Catalog;
use serde::{Deserialize, Serialize};
use smallvec::smallvec;
use tracing::debug;

use crate::{env_name, EventTypes};

/// Event types a kind emits and accepts by default.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventAttributes {
    pub produces: EventTypes,
    pub accepts: EventTypes,
}

/// Kind specific knowledge needed to run and wire a component.
pub trait KindHandler: Send + Sync {
    /// Environment derived from the declarative object, `KEY=VALUE` entries.
    fn build_env(&self, object: &Object) -> Result<Vec<String>>;

    fn event_attributes(&self, object: &Object) -> EventAttributes;
}

/// Flattens the spec into upper snake env names; secret references are skipped.
#[derive(Debug, Clone, Default)]
pub struct GenericHandler {
    pub defaults: EventAttributes,
}

impl GenericHandler {
    pub fn producing(event_type: impl Into<String>) -> Self {
        Self { defaults: EventAttributes { produces: smallvec![event_type.into()], accepts: EventTypes::new() } }
    }
}

impl KindHandler for GenericHandler {
    fn build_env(&self, object: &Object) -> Result<Vec<String>> {
        let mut out = Vec::new();
        flatten_env(&object.spec, "", &mut out);
        Ok(out)
    }

    fn event_attributes(&self, _object: &Object) -> EventAttributes { self.defaults.clone() }
}

fn flatten_env(m: &Map, prefix: &str, out: &mut Vec<String>) {
    for (k, v) in m.iter() {
        let name = if prefix.is_empty() { env_name(k) } else { format!("{}_{}", prefix, env_name(k)) };
        match v {
            Value::Null => {}
            Value::Map(inner) if inner.contains_key("valueFromSecret") => {}
            // `{value: x}` half of a value-or-secret property
            Value::Map(inner) if inner.len() == 1 && inner.contains_key("value") => {
                out.push(format!("{}={}", name, inner["value"].render()));
            }
            Value::Map(inner) => flatten_env(inner, &name, out),
            Value::List(items) if items.iter().all(|i| !matches!(i, Value::Map(_) | Value::List(_))) => {
                let joined: Vec<String> = items.iter().map(Value::render).collect();
                out.push(format!("{}={}", name, joined.join(",")));
            }
            other => out.push(format!("{}={}", name, other.render())),
        }
    }
}

pub const PING_EVENT_TYPE: &str = "dev.lmesh.sources.ping";

/// PingSource emits a fixed type and reads its schedule from dedicated variables.
#[derive(Debug, Clone, Default)]
pub struct PingSourceHandler;

impl KindHandler for PingSourceHandler {
    fn build_env(&self, object: &Object) -> Result<Vec<String>> {
        let schedule = object
            .spec
            .get("schedule")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("{} has no spec.schedule", object.name()))?;
        let data = object.spec.get("data").map(Value::render).unwrap_or_default();
        let content_type = object.spec.get("contentType").and_then(Value::as_str).unwrap_or("application/json");
        Ok(vec![format!("SCHEDULE={}", schedule), format!("DATA={}", data), format!("CONTENT_TYPE={}", content_type)])
    }

    fn event_attributes(&self, _object: &Object) -> EventAttributes {
        EventAttributes { produces: smallvec![PING_EVENT_TYPE.to_string()], accepts: EventTypes::new() }
    }
}

/// Transformations pass their operation lists as JSON; the produced type is
/// whatever the context operations set `type` to.
#[derive(Debug, Clone, Default)]
pub struct TransformationHandler;

impl KindHandler for TransformationHandler {
    fn build_env(&self, object: &Object) -> Result<Vec<String>> {
        let ops = |k: &str| object.spec.get(k).cloned().unwrap_or_else(|| Value::List(Vec::new())).render();
        Ok(vec![format!("TRANSFORMATION_CONTEXT={}", ops("context")), format!("TRANSFORMATION_DATA={}", ops("data"))])
    }

    fn event_attributes(&self, object: &Object) -> EventAttributes {
        let mut produces = EventTypes::new();
        let ops = object.spec.get("context").and_then(Value::as_list).unwrap_or(&[]);
        for op in ops.iter() {
            if !matches!(op.pointer("operation").and_then(Value::as_str), Some("add") | Some("store")) { continue; }
            for path in op.pointer("paths").and_then(Value::as_list).unwrap_or(&[]) {
                if path.pointer("key").and_then(Value::as_str) == Some("type") {
                    if let Some(t) = path.pointer("value").and_then(Value::as_str) {
                        if !produces.iter().any(|p| p == t) { produces.push(t.to_string()); }
                    }
                }
            }
        }
        EventAttributes { produces, accepts: EventTypes::new() }
    }
}

/// Kind name (case-insensitive) to handler.
#[derive(Clone)]
pub struct KindRegistry {
    handlers: BTreeMap<String, Arc<dyn KindHandler>>,
    fallback: Arc<dyn KindHandler>,
}

impl Default for KindRegistry {
    fn default() -> Self { Self::new() }
}

impl KindRegistry {
    /// Registry holding only the override handlers.
    pub fn new() -> Self {
        let mut r = Self { handlers: BTreeMap::new(), fallback: Arc::new(GenericHandler::default()) };
        r.register("PingSource", Arc::new(PingSourceHandler));
        r.register("Transformation", Arc::new(TransformationHandler));
        r
    }

    /// Every catalog kind gets the generic handler, then overrides are applied.
    pub fn from_catalog(catalog: &Catalog) -> Self {
        let mut r = Self { handlers: BTreeMap::new(), fallback: Arc::new(GenericHandler::default()) };
        for entry in catalog.kinds() {
            let handler = match entry.category() {
                "sources" => GenericHandler::producing(format!("io.lmesh.{}.event", entry.kind.to_lowercase())),
                _ => GenericHandler::default(),
            };
            r.handlers.insert(entry.kind.to_lowercase(), Arc::new(handler));
        }
        let generic = r.handlers.len();
        r.register("PingSource", Arc::new(PingSourceHandler));
        r.register("Transformation", Arc::new(TransformationHandler));
        debug!(catalog = %catalog.version(), generic, total = r.handlers.len(), "kind registry built");
        r
    }

    pub fn register(&mut self, kind: &str, handler: Arc<dyn KindHandler>) {
        self.handlers.insert(kind.to_lowercase(), handler);
    }

    pub fn contains(&self, kind: &str) -> bool { self.handlers.contains_key(&kind.to_lowercase()) }

    /// Handler for `kind`, falling back to the generic one.
    pub fn handler(&self, kind: &str) -> Arc<dyn KindHandler> {
        self.handlers.get(&kind.to_lowercase()).cloned().unwrap_or_else(|| Arc::clone(&self.fallback))
    }

    pub fn kinds(&self) -> impl Iterator<Item = &str> { self.handlers.keys().map(String::as_str) }
}
