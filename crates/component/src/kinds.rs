//! Concrete component kinds.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use lmesh_core::{Map, Object, ObjectKey, Value, ANNOTATION_EVENT_TYPES, EVENTING_API_VERSION, KIND_BROKER, KIND_SERVICE, LABEL_BROKER, SERVICE_API_VERSION};

use crate::registry::KindHandler;
use crate::{event_types_override, referenced_secrets, resolve_event_types, Component, Consumer, EventTypes, Parent, Producer, RuntimeParams, Runnable};

/// Directory inside the broker container holding its routing file.
pub const BROKER_CONFIG_DIR: &str = "/etc/lmesh";
/// Where the broker image expects its routing file.
pub const BROKER_CONFIG_MOUNT: &str = "/etc/lmesh/broker.conf";

fn params(image: &str, mut env: Vec<String>, additional_envs: &[String]) -> RuntimeParams {
    env.extend(additional_envs.iter().cloned());
    RuntimeParams { env, ..RuntimeParams::new(image) }
}

/// The per-broker event router.
///
/// The directory holding the routing file is bind-mounted, not the file: routing
/// updates replace the file by rename, and a file mount would keep the old inode.
#[derive(Debug, Clone)]
pub struct Broker {
    object: Object,
    config_path: PathBuf,
}

impl Broker {
    pub fn new(name: &str, config_path: impl Into<PathBuf>) -> Self {
        let object = Object::new(EVENTING_API_VERSION, KIND_BROKER, name).with_label(LABEL_BROKER, name);
        Self { object, config_path: config_path.into() }
    }

    pub fn from_object(object: Object, config_path: impl Into<PathBuf>) -> Self {
        Self { object, config_path: config_path.into() }
    }

    pub fn config_path(&self) -> &Path { &self.config_path }
}

impl Component for Broker {
    fn object(&self) -> &Object { &self.object }
    fn as_runnable(&self) -> Option<&dyn Runnable> { Some(self) }
    fn as_consumer(&self) -> Option<&dyn Consumer> { Some(self) }
}

impl Runnable for Broker {
    fn runtime_params(&self, image: &str, additional_envs: &[String]) -> Result<RuntimeParams> {
        let dir = self
            .config_path
            .parent()
            .filter(|d| !d.as_os_str().is_empty())
            .ok_or_else(|| anyhow!("routing config {} has no parent directory", self.config_path.display()))?;
        let file = self
            .config_path
            .file_name()
            .ok_or_else(|| anyhow!("routing config {} has no file name", self.config_path.display()))?;
        let inside = format!("{}/{}", BROKER_CONFIG_DIR, file.to_string_lossy());
        let mut p = params(image, vec![format!("BROKER_CONFIG_PATH={}", inside)], additional_envs);
        p.volumes.push(format!("{}:{}", dir.display(), BROKER_CONFIG_DIR));
        Ok(p)
    }
}

impl Consumer for Broker {
    fn accepted_event_types(&self) -> EventTypes { EventTypes::new() }
}

macro_rules! catalog_kind {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Clone)]
        pub struct $name {
            object: Object,
            handler: Arc<dyn KindHandler>,
        }

        impl $name {
            pub fn new(object: Object, handler: Arc<dyn KindHandler>) -> Self { Self { object, handler } }
        }

        impl std::fmt::Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.debug_struct(stringify!($name)).field("object", &self.object.key()).finish()
            }
        }

        impl Runnable for $name {
            fn runtime_params(&self, image: &str, additional_envs: &[String]) -> Result<RuntimeParams> {
                Ok(params(image, self.handler.build_env(&self.object)?, additional_envs))
            }
        }
    };
}

catalog_kind!(
    /// Event producer adapter. Its sink (the broker) is injected at start time.
    Source
);
catalog_kind!(
    /// Event consumer adapter; may reply with events of declared types.
    Target
);
catalog_kind!(
    /// Context/data operations applied to events routed through it.
    Transformation
);

impl Component for Source {
    fn object(&self) -> &Object { &self.object }
    fn as_runnable(&self) -> Option<&dyn Runnable> { Some(self) }
    fn as_producer(&self) -> Option<&dyn Producer> { Some(self) }
    fn as_parent(&self) -> Option<&dyn Parent> { Some(self) }
}

impl Producer for Source {
    fn event_types(&self) -> EventTypes {
        resolve_event_types(&self.object, self.handler.event_attributes(&self.object).produces)
    }
}

impl Parent for Source {
    fn children(&self) -> Vec<ObjectKey> { referenced_secrets(&self.object) }
}

impl Component for Target {
    fn object(&self) -> &Object { &self.object }
    fn as_runnable(&self) -> Option<&dyn Runnable> { Some(self) }
    fn as_producer(&self) -> Option<&dyn Producer> { Some(self) }
    fn as_consumer(&self) -> Option<&dyn Consumer> { Some(self) }
    fn as_parent(&self) -> Option<&dyn Parent> { Some(self) }
}

impl Producer for Target {
    fn event_types(&self) -> EventTypes {
        resolve_event_types(&self.object, self.handler.event_attributes(&self.object).produces)
    }
}

impl Consumer for Target {
    fn accepted_event_types(&self) -> EventTypes { self.handler.event_attributes(&self.object).accepts }
}

impl Parent for Target {
    fn children(&self) -> Vec<ObjectKey> { referenced_secrets(&self.object) }
}

impl Component for Transformation {
    fn object(&self) -> &Object { &self.object }
    fn as_runnable(&self) -> Option<&dyn Runnable> { Some(self) }
    fn as_producer(&self) -> Option<&dyn Producer> { Some(self) }
    fn as_consumer(&self) -> Option<&dyn Consumer> { Some(self) }
}

impl Producer for Transformation {
    fn event_types(&self) -> EventTypes {
        event_types_override(&self.object).unwrap_or_else(|| self.handler.event_attributes(&self.object).produces)
    }
}

impl Consumer for Transformation {
    fn accepted_event_types(&self) -> EventTypes { self.handler.event_attributes(&self.object).accepts }
}

/// User supplied container image wired into the broker like any other consumer.
#[derive(Debug, Clone)]
pub struct Service {
    object: Object,
}

impl Service {
    pub fn new(broker: &str, name: &str, image: &str) -> Self {
        let mut object = Object::new(SERVICE_API_VERSION, KIND_SERVICE, name).with_label(LABEL_BROKER, broker);
        object.spec.insert("image".into(), Value::from(image));
        Self { object }
    }

    pub fn from_object(object: Object) -> Result<Self> {
        if object.spec.get("image").and_then(Value::as_str).is_none() {
            return Err(anyhow!("service {} has no spec.image", object.name()));
        }
        Ok(Self { object })
    }

    pub fn with_env(mut self, env: Map) -> Self {
        self.object.spec.insert("env".into(), Value::Map(env));
        self
    }

    /// Declare the event types the service replies with; makes it a producer.
    pub fn with_event_types(mut self, types: &[String]) -> Self {
        if !types.is_empty() {
            self.object = self.object.with_annotation(ANNOTATION_EVENT_TYPES, types.join(","));
        }
        self
    }

    pub fn with_entrypoint(mut self, command: Vec<String>) -> Self {
        self.object.spec.insert("command".into(), Value::from(command));
        self
    }

    pub fn image(&self) -> &str { self.object.spec.get("image").and_then(Value::as_str).unwrap_or_default() }
}

impl Component for Service {
    fn object(&self) -> &Object { &self.object }
    fn as_runnable(&self) -> Option<&dyn Runnable> { Some(self) }
    fn as_consumer(&self) -> Option<&dyn Consumer> { Some(self) }
    fn as_producer(&self) -> Option<&dyn Producer> {
        event_types_override(&self.object).map(|_| self as &dyn Producer)
    }
}

impl Runnable for Service {
    fn runtime_params(&self, image: &str, additional_envs: &[String]) -> Result<RuntimeParams> {
        let env = self
            .object
            .spec
            .get("env")
            .and_then(Value::as_map)
            .map(|m| m.iter().map(|(k, v)| format!("{}={}", k, v.render())).collect())
            .unwrap_or_default();
        let mut p = params(image, env, additional_envs);
        p.entrypoint = self
            .object
            .spec
            .get("command")
            .and_then(Value::as_list)
            .map(|l| l.iter().map(Value::render).collect())
            .filter(|c: &Vec<String>| !c.is_empty());
        Ok(p)
    }
}

impl Producer for Service {
    fn event_types(&self) -> EventTypes { event_types_override(&self.object).unwrap_or_default() }
}

impl Consumer for Service {
    fn accepted_event_types(&self) -> EventTypes { EventTypes::new() }
}

/// Detached secret payload; no capabilities.
#[derive(Debug, Clone)]
pub struct SecretComponent {
    object: Object,
}

impl SecretComponent {
    pub fn new(object: Object) -> Self { Self { object } }
}

impl Component for SecretComponent {
    fn object(&self) -> &Object { &self.object }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::GenericHandler;
    use lmesh_core::{map, ANNOTATION_EVENT_TYPES};

    #[test]
    fn broker_mounts_routing_directory() {
        let b = Broker::new("demo", "/home/u/.lmesh/demo/broker.conf");
        let p = b.as_runnable().unwrap().runtime_params("lmesh/broker:v1", &["LOG=debug".into()]).unwrap();
        assert_eq!(p.image, "lmesh/broker:v1");
        assert_eq!(p.exposed_port, 8080);
        assert_eq!(p.volumes, vec!["/home/u/.lmesh/demo:/etc/lmesh".to_string()]);
        assert_eq!(p.env_value("BROKER_CONFIG_PATH"), Some(BROKER_CONFIG_MOUNT));
        assert_eq!(p.env_value("LOG"), Some("debug"));
        assert!(b.as_producer().is_none() && b.as_parent().is_none());
        assert_eq!(b.object().label(LABEL_BROKER), Some("demo"));

        let custom = Broker::new("demo", "/srv/mesh/routes.yaml");
        let p = custom.as_runnable().unwrap().runtime_params("lmesh/broker:v1", &[]).unwrap();
        assert_eq!(p.volumes, vec!["/srv/mesh:/etc/lmesh".to_string()]);
        assert_eq!(p.env_value("BROKER_CONFIG_PATH"), Some("/etc/lmesh/routes.yaml"));

        let bare = Broker::new("demo", "broker.conf");
        assert!(bare.as_runnable().unwrap().runtime_params("lmesh/broker:v1", &[]).is_err());
    }

    #[test]
    fn runtime_params_are_deterministic() {
        let mut o = Object::new("targets.lmesh.io/v1alpha1", "HTTPTarget", "web");
        o.spec.insert("endpoint".into(), Value::from("http://example.com"));
        let t = Target::new(o, Arc::new(GenericHandler::default()));
        let a = t.runtime_params("img", &["K_SINK=http://b".into()]).unwrap();
        let b = t.runtime_params("img", &["K_SINK=http://b".into()]).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.env, vec!["ENDPOINT=http://example.com".to_string(), "K_SINK=http://b".to_string()]);
    }

    #[test]
    fn service_producer_only_with_override() {
        let env = match map! { "MODE" => "fast" } { Value::Map(m) => m, _ => unreachable!() };
        let s = Service::new("demo", "svc", "nginx:1").with_env(env).with_entrypoint(vec!["/bin/app".into(), "--x".into()]);
        assert!(s.as_producer().is_none());
        let p = s.runtime_params(s.image(), &[]).unwrap();
        assert_eq!(p.image, "nginx:1");
        assert_eq!(p.env, vec!["MODE=fast".to_string()]);
        assert_eq!(p.entrypoint, Some(vec!["/bin/app".to_string(), "--x".to_string()]));

        let s = Service::from_object(s.object().clone().with_annotation(ANNOTATION_EVENT_TYPES, "a.b")).unwrap();
        assert_eq!(s.as_producer().unwrap().event_types().as_slice(), ["a.b"]);
        assert!(Service::from_object(Object::new(SERVICE_API_VERSION, KIND_SERVICE, "x")).is_err());
        let s = Service::new("demo", "svc", "nginx:1").with_event_types(&["a.b".into(), "a.c".into()]);
        assert_eq!(s.as_producer().unwrap().event_types().as_slice(), ["a.b", "a.c"]);
    }
}
