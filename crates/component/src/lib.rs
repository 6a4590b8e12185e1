//! lmesh components.
//!
//! A component is one node of the event-driven application graph. Every kind
//! renders a declarative [`Object`] and exposes a subset of the capabilities
//! below; runnable kinds also render [`RuntimeParams`] for the supervisor.

#![forbid(unsafe_code)]

use anyhow::{anyhow, Context, Result};
use base64::Engine as _;
use lmesh_core::{Object, ObjectKey, Value, ANNOTATION_EVENT_TYPES, KIND_SECRET, SECRET_API_VERSION};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

mod builder;
mod kinds;
mod registry;

pub use builder::{Built, ComponentBuilder};
pub use kinds::{Broker, SecretComponent, Service, Source, Target, Transformation, BROKER_CONFIG_DIR, BROKER_CONFIG_MOUNT};
pub use registry::{EventAttributes, GenericHandler, KindHandler, KindRegistry, PingSourceHandler, TransformationHandler};

/// Port every adapter, transformation and broker image listens on.
pub const DEFAULT_PORT: u16 = 8080;

pub type EventTypes = SmallVec<[String; 2]>;

/// Settings needed to run a component as a container. Never persisted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeParams {
    pub image: String,
    pub exposed_port: u16,
    /// `KEY=VALUE` entries.
    pub env: Vec<String>,
    /// `host:container` bind mounts.
    pub volumes: Vec<String>,
    pub host_port: Option<u16>,
    pub entrypoint: Option<Vec<String>>,
}

impl RuntimeParams {
    pub fn new(image: impl Into<String>) -> Self {
        Self { image: image.into(), exposed_port: DEFAULT_PORT, ..Default::default() }
    }

    /// Value of an environment entry, last one wins.
    pub fn env_value(&self, key: &str) -> Option<&str> {
        self.env.iter().rev().find_map(|e| e.split_once('=').filter(|(k, _)| *k == key).map(|(_, v)| v))
    }
}

pub trait Component: Send + Sync {
    fn object(&self) -> &Object;

    fn name(&self) -> &str { self.object().name() }

    fn kind(&self) -> &str { &self.object().kind }

    fn as_runnable(&self) -> Option<&dyn Runnable> { None }
    fn as_producer(&self) -> Option<&dyn Producer> { None }
    fn as_consumer(&self) -> Option<&dyn Consumer> { None }
    fn as_parent(&self) -> Option<&dyn Parent> { None }
}

pub trait Runnable {
    /// Render runtime parameters; `additional_envs` carry resolved secrets
    /// and upstream endpoints injected at start time.
    fn runtime_params(&self, image: &str, additional_envs: &[String]) -> Result<RuntimeParams>;
}

pub trait Producer {
    fn event_types(&self) -> EventTypes;
}

pub trait Consumer {
    fn port(&self) -> u16 { DEFAULT_PORT }

    /// Empty means every event type is accepted.
    fn accepted_event_types(&self) -> EventTypes;
}

pub trait Parent {
    /// Objects owned by this component, currently the Secrets its spec references.
    fn children(&self) -> Vec<ObjectKey>;
}

/// Event types declared through the `lmesh.io/event-types` annotation, if any.
pub fn event_types_override(object: &Object) -> Option<EventTypes> {
    let raw = object.annotation(ANNOTATION_EVENT_TYPES)?;
    let types: EventTypes = raw.split(',').map(str::trim).filter(|t| !t.is_empty()).map(String::from).collect();
    (!types.is_empty()).then_some(types)
}

/// Producer resolution order: annotation override, fixed `spec.eventType`, then `defaults`.
pub fn resolve_event_types(object: &Object, defaults: EventTypes) -> EventTypes {
    if let Some(t) = event_types_override(object) { return t; }
    if let Some(t) = object.spec.get("eventType").and_then(Value::as_str).filter(|t| !t.is_empty()) {
        return smallvec::smallvec![t.to_string()];
    }
    defaults
}

/// Adapter image for a catalog kind.
pub fn image_for(kind: &str, version: &str, registry_prefix: &str) -> String {
    let prefix = registry_prefix.trim_end_matches('/');
    if prefix.is_empty() {
        format!("{}-adapter:{}", kind.to_lowercase(), version)
    } else {
        format!("{}/{}-adapter:{}", prefix, kind.to_lowercase(), version)
    }
}

/// Upper snake case environment name for a camelCase property key.
///
/// `accessKeyID` becomes `ACCESS_KEY_ID`, `AWSRegion` becomes `AWS_REGION`.
pub fn env_name(key: &str) -> String {
    let chars: Vec<char> = key.chars().collect();
    let mut out = String::with_capacity(key.len() + 4);
    for (i, &c) in chars.iter().enumerate() {
        if !c.is_ascii_alphanumeric() {
            if !out.is_empty() && !out.ends_with('_') { out.push('_'); }
            continue;
        }
        if c.is_ascii_uppercase() && i > 0 && !out.ends_with('_') {
            let prev = chars[i - 1];
            let next_lower = chars.get(i + 1).map(|n| n.is_ascii_lowercase()).unwrap_or(false);
            if prev.is_ascii_lowercase() || prev.is_ascii_digit() || (prev.is_ascii_uppercase() && next_lower) {
                out.push('_');
            }
        }
        out.push(c.to_ascii_uppercase());
    }
    out.trim_end_matches('_').to_string()
}

/// Decode a Secret object into `KEY=VALUE` env entries.
pub fn secret_envs(secret: &Object) -> Result<Vec<String>> {
    if secret.kind != KIND_SECRET {
        return Err(anyhow!("{} is a {}, not a Secret", secret.name(), secret.kind));
    }
    secret
        .data
        .iter()
        .map(|(k, v)| {
            let raw = base64::engine::general_purpose::STANDARD
                .decode(v.as_bytes())
                .with_context(|| format!("decoding key {:?} of secret {}", k, secret.name()))?;
            let decoded = String::from_utf8(raw).with_context(|| format!("key {:?} of secret {} is not UTF-8", k, secret.name()))?;
            Ok(format!("{}={}", env_name(k), decoded))
        })
        .collect()
}

/// Keys of the Secrets referenced anywhere in `object`'s spec, deduplicated in order.
pub fn referenced_secrets(object: &Object) -> Vec<ObjectKey> {
    fn walk(v: &Value, out: &mut Vec<ObjectKey>) {
        match v {
            Value::Map(m) => {
                if let Some(name) = m.get("valueFromSecret").and_then(|r| r.pointer("name")).and_then(Value::as_str) {
                    let key = ObjectKey { api_version: SECRET_API_VERSION.into(), kind: KIND_SECRET.into(), name: name.to_string() };
                    if !out.contains(&key) { out.push(key); }
                    return;
                }
                m.values().for_each(|x| walk(x, out));
            }
            Value::List(l) => l.iter().for_each(|x| walk(x, out)),
            _ => {}
        }
    }
    let mut out = Vec::new();
    object.spec.values().for_each(|v| walk(v, &mut out));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use lmesh_core::map;

    #[test]
    fn env_names_split_camel_case_and_acronyms() {
        assert_eq!(env_name("schedule"), "SCHEDULE");
        assert_eq!(env_name("accessKeyID"), "ACCESS_KEY_ID");
        assert_eq!(env_name("AWSRegion"), "AWS_REGION");
        assert_eq!(env_name("sink2Url"), "SINK2_URL");
        assert_eq!(env_name("dead-letter.url"), "DEAD_LETTER_URL");
    }

    #[test]
    fn image_names_follow_kind_and_version() {
        assert_eq!(image_for("PingSource", "v1.2.0", "registry.example.com/lmesh/"), "registry.example.com/lmesh/pingsource-adapter:v1.2.0");
        assert_eq!(image_for("HTTPTarget", "latest", ""), "httptarget-adapter:latest");
    }

    #[test]
    fn secret_envs_decode_data() {
        let mut s = Object::new(SECRET_API_VERSION, KIND_SECRET, "demo-sqs-secret");
        s.data.insert("secretAccessKey".into(), "Zm9v".into());
        assert_eq!(secret_envs(&s).unwrap(), vec!["SECRET_ACCESS_KEY=foo".to_string()]);
        s.data.insert("broken".into(), "%%%".into());
        assert!(secret_envs(&s).is_err());
        assert!(secret_envs(&Object::new("v1", "ConfigMap", "x")).is_err());
    }

    #[test]
    fn event_type_resolution_order() {
        let o = Object::new("sources.lmesh.io/v1alpha1", "WebhookSource", "w");
        let defaults: EventTypes = smallvec::smallvec!["default.type".to_string()];
        assert_eq!(resolve_event_types(&o, defaults.clone()).as_slice(), ["default.type"]);

        let o = o.with_spec(match map! { "eventType" => "fixed.type" } { Value::Map(m) => m, _ => unreachable!() });
        assert_eq!(resolve_event_types(&o, defaults.clone()).as_slice(), ["fixed.type"]);

        let o = o.with_annotation(ANNOTATION_EVENT_TYPES, "a.type, b.type,");
        assert_eq!(resolve_event_types(&o, defaults).as_slice(), ["a.type", "b.type"]);
    }

    #[test]
    fn referenced_secrets_are_collected_once() {
        let spec = map! {
            "auth" => map! {
                "a" => map! { "valueFromSecret" => map! { "name" => "x-secret", "key" => "a" } },
                "b" => map! { "valueFromSecret" => map! { "name" => "x-secret", "key" => "b" } },
            },
            "list" => vec![map! { "valueFromSecret" => map! { "name" => "y-secret", "key" => "c" } }],
        };
        let o = Object::new("targets.lmesh.io/v1alpha1", "HTTPTarget", "x").with_spec(match spec { Value::Map(m) => m, _ => unreachable!() });
        let names: Vec<String> = referenced_secrets(&o).into_iter().map(|k| k.name).collect();
        assert_eq!(names, vec!["x-secret".to_string(), "y-secret".to_string()]);
    }
}
