//! lmesh core types: spec values, declarative objects and staged file writes.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

mod value;

pub use value::{Map, Value};

/// Label carrying the broker an object belongs to.
pub const LABEL_BROKER: &str = "lmesh.io/broker";
/// Label carrying the owning component of a child object (e.g. a Secret).
pub const LABEL_OWNER: &str = "lmesh.io/owner";
/// Annotation overriding the event types a component produces (comma separated).
pub const ANNOTATION_EVENT_TYPES: &str = "lmesh.io/event-types";

pub const KIND_BROKER: &str = "Broker";
pub const KIND_TRIGGER: &str = "Trigger";
pub const KIND_SECRET: &str = "Secret";
pub const KIND_SERVICE: &str = "Service";
pub const KIND_TRANSFORMATION: &str = "Transformation";

pub const EVENTING_API_VERSION: &str = "eventing.lmesh.io/v1alpha1";
pub const SERVICE_API_VERSION: &str = "serving.lmesh.io/v1alpha1";
pub const SECRET_API_VERSION: &str = "v1";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

/// Canonical declarative form of a component instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Object {
    pub api_version: String,
    pub kind: String,
    pub metadata: Metadata,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub spec: Map,
    /// Secret payload: key -> base64 value.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub data: BTreeMap<String, String>,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub type_: Option<String>,
}

/// Object identity: `(apiVersion, kind, name)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub api_version: String,
    pub kind: String,
    pub name: String,
}

impl std::fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.api_version, self.kind, self.name)
    }
}

impl Object {
    pub fn new(api_version: impl Into<String>, kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            api_version: api_version.into(),
            kind: kind.into(),
            metadata: Metadata { name: name.into(), ..Default::default() },
            spec: Map::new(),
            data: BTreeMap::new(),
            type_: None,
        }
    }

    pub fn name(&self) -> &str { &self.metadata.name }

    pub fn key(&self) -> ObjectKey {
        ObjectKey { api_version: self.api_version.clone(), kind: self.kind.clone(), name: self.metadata.name.clone() }
    }

    pub fn with_label(mut self, k: impl Into<String>, v: impl Into<String>) -> Self {
        self.metadata.labels.insert(k.into(), v.into());
        self
    }

    pub fn with_annotation(mut self, k: impl Into<String>, v: impl Into<String>) -> Self {
        self.metadata.annotations.insert(k.into(), v.into());
        self
    }

    pub fn with_spec(mut self, spec: Map) -> Self {
        self.spec = spec;
        self
    }

    pub fn label(&self, k: &str) -> Option<&str> { self.metadata.labels.get(k).map(|s| s.as_str()) }

    pub fn annotation(&self, k: &str) -> Option<&str> { self.metadata.annotations.get(k).map(|s| s.as_str()) }

    /// API group portion of `apiVersion` (empty for core kinds like `v1`).
    pub fn group(&self) -> &str {
        self.api_version.split_once('/').map(|(g, _)| g).unwrap_or("")
    }
}

static DNS_LABEL: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?$").expect("static regex"));

/// Component names end up as container names and hostnames: DNS-1123 labels only.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() { return Err(anyhow!("name must not be empty")); }
    if name.len() > 63 { return Err(anyhow!("name {:?} is longer than 63 characters", name)); }
    if !DNS_LABEL.is_match(name) {
        return Err(anyhow!("name {:?} must consist of lower case alphanumerics or '-', and start and end with an alphanumeric", name));
    }
    Ok(())
}

/// Derive a default component name: `<broker>-<kind>` lower-cased.
pub fn default_name(broker: &str, kind: &str) -> String {
    format!("{}-{}", broker, kind).to_lowercase()
}

/// A file written next to its destination and moved into place on `commit`.
#[derive(Debug)]
pub struct StagedFile {
    staged: PathBuf,
    dest: PathBuf,
}

impl StagedFile {
    /// Write `bytes` to a hidden sibling of `dest`.
    pub fn write(dest: &Path, bytes: &[u8]) -> Result<Self> {
        let dir = dest.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(dir).with_context(|| format!("creating directory {}", dir.display()))?;
        let file_name = dest.file_name().ok_or_else(|| anyhow!("invalid destination path {}", dest.display()))?;
        let staged = dir.join(format!(".{}.staged", file_name.to_string_lossy()));
        std::fs::write(&staged, bytes).with_context(|| format!("writing staged file {}", staged.display()))?;
        debug!(staged = %staged.display(), dest = %dest.display(), "staged write");
        Ok(Self { staged, dest: dest.to_path_buf() })
    }

    pub fn dest(&self) -> &Path { &self.dest }

    /// Atomically replace the destination with the staged content.
    pub fn commit(self) -> Result<()> {
        std::fs::rename(&self.staged, &self.dest)
            .with_context(|| format!("renaming {} into {}", self.staged.display(), self.dest.display()))
    }

    /// Drop the staged content, leaving the destination untouched.
    pub fn discard(self) {
        let _ = std::fs::remove_file(&self.staged);
    }
}

/// Write a file through a staged sibling so readers never observe a partial file.
pub fn write_atomic(dest: &Path, bytes: &[u8]) -> Result<()> {
    StagedFile::write(dest, bytes)?.commit()
}

pub mod prelude {
    pub use super::{Map, Metadata, Object, ObjectKey, StagedFile, Value};
}
