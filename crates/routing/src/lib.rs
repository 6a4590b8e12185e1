//! lmesh routing: triggers and the broker-local routing config.
//!
//! Every trigger lives twice: as an entry of the routing file the running
//! broker reads, and as a `Trigger` object in the manifest. Changes go through
//! [`apply_trigger_change`] so both files are committed together.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use lmesh_core::{Map, Object, StagedFile, Value, EVENTING_API_VERSION, KIND_TRIGGER, LABEL_BROKER};
use lmesh_manifest::Manifest;
use metrics::counter;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::{debug, error, info};

mod filter;

pub use filter::Filter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffPolicy {
    Linear,
    Exponential,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<u32>,
    /// ISO-8601 duration, e.g. `PT0.5S`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff_delay: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff_policy: Option<BackoffPolicy>,
    #[serde(default, rename = "deadLetterURL", skip_serializing_if = "Option::is_none")]
    pub dead_letter_url: Option<String>,
}

/// Where matching events are delivered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Target {
    pub component: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivery_options: Option<DeliveryOptions>,
}

impl Target {
    pub fn new(component: impl Into<String>, url: impl Into<String>) -> Self {
        Self { component: component.into(), url: url.into(), delivery_options: None }
    }
}

/// Routing file entry: everything but the name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerSpec {
    #[serde(default)]
    pub filters: Vec<Filter>,
    pub target: Target,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Trigger {
    pub name: String,
    pub filters: Vec<Filter>,
    pub target: Target,
}

fn to_value<T: Serialize>(t: &T) -> Result<Value> {
    Ok(Value::from(serde_json::to_value(t)?))
}

fn from_value<T: DeserializeOwned>(v: &Value) -> Result<T> {
    Ok(serde_json::from_value(serde_json::to_value(v)?)?)
}

impl Trigger {
    pub fn new(name: impl Into<String>, filters: Vec<Filter>, target: Target) -> Self {
        Self { name: name.into(), filters, target }
    }

    /// Route every event whose type is one of `types`; no types routes everything.
    pub fn for_event_types(name: impl Into<String>, types: &[String], target: Target) -> Self {
        let filters = match types {
            [] => Vec::new(),
            [one] => vec![Filter::exact("type", one)],
            many => vec![Filter::any(many.iter().map(|t| Filter::exact("type", t)).collect())],
        };
        Self::new(name, filters, target)
    }

    /// Filters are ANDed; an empty list matches every event.
    pub fn matches(&self, attributes: &BTreeMap<String, String>) -> Result<bool> {
        for f in self.filters.iter() {
            if !f.matches(attributes)? { return Ok(false); }
        }
        Ok(true)
    }

    /// Manifest form, labelled with its broker.
    pub fn to_object(&self, broker: &str) -> Result<Object> {
        let mut spec = Map::new();
        spec.insert("broker".into(), Value::from(broker));
        if !self.filters.is_empty() {
            spec.insert("filters".into(), to_value(&self.filters)?);
        }
        spec.insert("target".into(), to_value(&self.target)?);
        Ok(Object::new(EVENTING_API_VERSION, KIND_TRIGGER, &self.name).with_label(LABEL_BROKER, broker).with_spec(spec))
    }

    pub fn from_object(object: &Object) -> Result<Self> {
        if object.kind != KIND_TRIGGER {
            return Err(anyhow!("{} is a {}, not a Trigger", object.name(), object.kind));
        }
        let filters = match object.spec.get("filters") {
            Some(v) => from_value(v).with_context(|| format!("trigger {} filters", object.name()))?,
            None => Vec::new(),
        };
        let target = object.spec.get("target").ok_or_else(|| anyhow!("trigger {} has no target", object.name()))?;
        let target = from_value(target).with_context(|| format!("trigger {} target", object.name()))?;
        Ok(Self { name: object.name().to_string(), filters, target })
    }

    fn spec(&self) -> TriggerSpec {
        TriggerSpec { filters: self.filters.clone(), target: self.target.clone() }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct RoutingFile {
    #[serde(default)]
    triggers: BTreeMap<String, TriggerSpec>,
}

/// The broker-local routing file.
#[derive(Debug, Clone)]
pub struct RoutingConfig {
    path: PathBuf,
    triggers: BTreeMap<String, TriggerSpec>,
}

impl RoutingConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), triggers: BTreeMap::new() }
    }

    /// Read `path`; a missing file is an empty config.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if !path.exists() {
            debug!(path = %path.display(), "routing config absent; starting empty");
            return Ok(Self::new(path));
        }
        let raw = std::fs::read_to_string(&path).with_context(|| format!("reading routing config {}", path.display()))?;
        let file: RoutingFile = if raw.trim().is_empty() {
            RoutingFile::default()
        } else {
            serde_yaml::from_str(&raw).with_context(|| format!("parsing routing config {}", path.display()))?
        };
        Ok(Self { path, triggers: file.triggers })
    }

    pub fn path(&self) -> &Path { &self.path }

    pub fn len(&self) -> usize { self.triggers.len() }

    pub fn is_empty(&self) -> bool { self.triggers.is_empty() }

    /// Insert or fully replace an entry. Returns true if the config changed.
    pub fn upsert(&mut self, trigger: Trigger) -> bool {
        let spec = trigger.spec();
        match self.triggers.get(&trigger.name) {
            Some(existing) if *existing == spec => false,
            _ => {
                self.triggers.insert(trigger.name, spec);
                true
            }
        }
    }

    pub fn remove(&mut self, name: &str) -> Option<Trigger> {
        self.triggers
            .remove(name)
            .map(|s| Trigger { name: name.to_string(), filters: s.filters, target: s.target })
    }

    pub fn lookup(&self, name: &str) -> Option<Trigger> {
        self.triggers
            .get(name)
            .map(|s| Trigger { name: name.to_string(), filters: s.filters.clone(), target: s.target.clone() })
    }

    pub fn triggers(&self) -> impl Iterator<Item = Trigger> + '_ {
        self.triggers
            .iter()
            .map(|(n, s)| Trigger { name: n.clone(), filters: s.filters.clone(), target: s.target.clone() })
    }

    /// Names of the triggers delivering to `component`.
    pub fn triggers_for_target(&self, component: &str) -> Vec<String> {
        self.triggers.iter().filter(|(_, s)| s.target.component == component).map(|(n, _)| n.clone()).collect()
    }

    pub fn render(&self) -> Result<String> {
        serde_yaml::to_string(&RoutingFile { triggers: self.triggers.clone() }).context("serializing routing config")
    }

    pub fn stage(&self) -> Result<StagedFile> {
        StagedFile::write(&self.path, self.render()?.as_bytes())
    }

    pub fn save(&self) -> Result<()> {
        self.stage()?.commit().with_context(|| format!("writing routing config {}", self.path.display()))
    }
}

#[derive(Debug, Clone)]
pub enum TriggerChange {
    Upsert(Trigger),
    Delete(String),
}

/// Apply one trigger change to both files.
///
/// Both files are staged first and renamed into place only when both staged
/// writes succeeded. On failure the in-memory state is restored too.
pub fn apply_trigger_change(routing: &mut RoutingConfig, manifest: &mut Manifest, broker: &str, change: TriggerChange) -> Result<bool> {
    let before = (routing.clone(), manifest.clone());
    let changed = match &change {
        TriggerChange::Upsert(t) => {
            let object = t.to_object(broker)?;
            let a = routing.upsert(t.clone());
            let b = manifest.add(object);
            a || b
        }
        TriggerChange::Delete(name) => {
            let a = routing.remove(name).is_some();
            let b = manifest.remove(name, KIND_TRIGGER);
            a || b
        }
    };
    if !changed {
        return Ok(false);
    }
    if let Err(e) = commit_both(routing, manifest) {
        *routing = before.0;
        *manifest = before.1;
        return Err(e);
    }
    counter!("routing_change_total", 1u64);
    match &change {
        TriggerChange::Upsert(t) => info!(broker = %broker, trigger = %t.name, target = %t.target.component, "trigger configured"),
        TriggerChange::Delete(name) => info!(broker = %broker, trigger = %name, "trigger deleted"),
    }
    Ok(true)
}

/// Remove every trigger delivering to `component` in one staged change.
pub fn delete_for_target(routing: &mut RoutingConfig, manifest: &mut Manifest, broker: &str, component: &str) -> Result<Vec<String>> {
    let names = routing.triggers_for_target(component);
    // Manifest-only leftovers pointing at the component go too
    let stray: Vec<String> = manifest
        .find_by_kind(KIND_TRIGGER)
        .filter(|o| o.spec.get("target").and_then(|t| t.pointer("component")).and_then(Value::as_str) == Some(component))
        .map(|o| o.name().to_string())
        .filter(|n| !names.contains(n))
        .collect();
    let names: Vec<String> = names.into_iter().chain(stray).collect();
    if names.is_empty() {
        return Ok(names);
    }
    let before = (routing.clone(), manifest.clone());
    for n in names.iter() {
        routing.remove(n);
        manifest.remove(n, KIND_TRIGGER);
    }
    if let Err(e) = commit_both(routing, manifest) {
        *routing = before.0;
        *manifest = before.1;
        return Err(e);
    }
    counter!("routing_change_total", names.len() as u64);
    info!(broker = %broker, component = %component, triggers = ?names, "triggers removed with target");
    Ok(names)
}

fn commit_both(routing: &RoutingConfig, manifest: &Manifest) -> Result<()> {
    let staged_routing = routing.stage()?;
    let staged_manifest = match manifest.stage() {
        Ok(s) => s,
        Err(e) => {
            staged_routing.discard();
            return Err(e.context("staging manifest; routing config left untouched"));
        }
    };
    staged_routing.commit()?;
    if let Err(e) = staged_manifest.commit() {
        error!(routing = %routing.path().display(), manifest = %manifest.path().display(), error = %e, "routing config committed but manifest commit failed; files are inconsistent");
        return Err(e);
    }
    Ok(())
}
