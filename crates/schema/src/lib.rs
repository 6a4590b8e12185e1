//! lmesh schema engine: component kind schemas parsed from the CRD catalog,
//! spec coercion/validation, and secret extraction.

#![forbid(unsafe_code)]

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_yaml::Value as Yaml;
use tracing::{debug, info};

mod engine;

pub use engine::{extract_secrets, process, secret_name, secret_object, secret_reference, validate, SchemaError};

/// Primitive property types understood by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PropertyType {
    String,
    Integer,
    Number,
    Boolean,
    Object,
    Array,
}

impl PropertyType {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "string" => Some(Self::String),
            "integer" => Some(Self::Integer),
            "number" => Some(Self::Number),
            "boolean" => Some(Self::Boolean),
            "object" => Some(Self::Object),
            "array" => Some(Self::Array),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Integer => "integer",
            Self::Number => "number",
            Self::Boolean => "boolean",
            Self::Object => "object",
            Self::Array => "array",
        }
    }
}

/// One node of a kind's schema tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Property {
    pub ty: PropertyType,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, Property>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items: Option<Box<Property>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub enum_values: Vec<String>,
    /// Value must be detached into a Secret and referenced.
    #[serde(default)]
    pub secret: bool,
    /// Free-form subtree (`x-kubernetes-preserve-unknown-fields` or untyped).
    #[serde(default)]
    pub free_form: bool,
}

impl Property {
    pub fn new(ty: PropertyType) -> Self {
        Self { ty, properties: BTreeMap::new(), items: None, required: Vec::new(), enum_values: Vec::new(), secret: false, free_form: false }
    }

    pub fn object(props: impl IntoIterator<Item = (&'static str, Property)>) -> Self {
        let mut p = Self::new(PropertyType::Object);
        p.properties = props.into_iter().map(|(k, v)| (k.to_string(), v)).collect();
        p
    }

    pub fn array(items: Property) -> Self {
        let mut p = Self::new(PropertyType::Array);
        p.items = Some(Box::new(items));
        p
    }

    /// A secret-bearing leaf in the `{value | valueFromSecret{name,key}}` shape.
    pub fn secret_ref() -> Self {
        let mut p = Self::object([
            ("value", Property::new(PropertyType::String)),
            ("valueFromSecret", Property::object([
                ("name", Property::new(PropertyType::String)),
                ("key", Property::new(PropertyType::String)),
            ])),
        ]);
        p.secret = true;
        p
    }

    pub fn required(mut self, keys: &[&str]) -> Self {
        self.required = keys.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn is_free_form(&self) -> bool { self.free_form && self.properties.is_empty() }

    /// Sorted property names; used in "unknown property" messages.
    pub fn property_names(&self) -> Vec<String> { self.properties.keys().cloned().collect() }

    /// Parse an OpenAPI v3 schema node (CRD `openAPIV3Schema` subset).
    pub fn from_openapi(node: &Yaml) -> Self {
        let props: BTreeMap<String, Property> = node
            .get("properties")
            .and_then(|p| p.as_mapping())
            .map(|m| {
                m.iter()
                    .filter_map(|(k, v)| k.as_str().map(|k| (k.to_string(), Property::from_openapi(v))))
                    .collect()
            })
            .unwrap_or_default();
        let declared = node.get("type").and_then(|t| t.as_str()).and_then(PropertyType::parse);
        let preserve = node.get("x-kubernetes-preserve-unknown-fields").and_then(|b| b.as_bool()).unwrap_or(false);
        let int_or_string = node.get("x-kubernetes-int-or-string").and_then(|b| b.as_bool()).unwrap_or(false);
        let ty = match declared {
            Some(t) => t,
            None if int_or_string => PropertyType::String,
            None => PropertyType::Object,
        };
        let items = node.get("items").map(|i| Box::new(Property::from_openapi(i)));
        let required = node
            .get("required")
            .and_then(|r| r.as_sequence())
            .map(|seq| seq.iter().filter_map(|s| s.as_str().map(|s| s.to_string())).collect())
            .unwrap_or_default();
        let enum_values = node
            .get("enum")
            .and_then(|e| e.as_sequence())
            .map(|seq| seq.iter().filter_map(|s| s.as_str().map(|s| s.to_string())).collect())
            .unwrap_or_default();
        let marked = node.get("x-lmesh-secret").and_then(|b| b.as_bool()).unwrap_or(false);
        let secret = marked || (ty == PropertyType::Object && props.contains_key("valueFromSecret"));
        let free_form = preserve || int_or_string || (declared.is_none() && props.is_empty());
        Self { ty, properties: props, items, required, enum_values, secret, free_form }
    }
}

/// Schema of a component kind's `spec`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    pub group: String,
    pub version: String,
    pub kind: String,
    pub root: Property,
}

impl Schema {
    pub fn new(group: impl Into<String>, version: impl Into<String>, kind: impl Into<String>, root: Property) -> Self {
        Self { group: group.into(), version: version.into(), kind: kind.into(), root }
    }

    pub fn api_version(&self) -> String {
        if self.group.is_empty() { self.version.clone() } else { format!("{}/{}", self.group, self.version) }
    }

    /// Dotted paths of every secret-marked property.
    pub fn secret_paths(&self) -> Vec<String> {
        fn walk(p: &Property, base: &str, out: &mut Vec<String>) {
            for (k, v) in p.properties.iter() {
                let path = if base.is_empty() { k.clone() } else { format!("{}.{}", base, k) };
                if v.secret { out.push(path); } else { walk(v, &path, out); }
            }
        }
        let mut out = Vec::new();
        walk(&self.root, "", &mut out);
        out
    }
}

/// Kind entry as listed by the CRD bundle.
#[derive(Debug, Clone)]
pub struct CatalogEntry {
    pub group: String,
    pub kind: String,
    pub version: String,
    spec_schema: Option<Yaml>,
}

impl CatalogEntry {
    pub fn api_version(&self) -> String { format!("{}/{}", self.group, self.version) }

    /// Category derived from the API group: `sources`, `targets`, `flow`, ...
    pub fn category(&self) -> &str { self.group.split('.').next().unwrap_or("") }
}

/// Versioned, read-only set of component kind definitions with a parse cache.
pub struct Catalog {
    version: String,
    entries: BTreeMap<String, CatalogEntry>,
    cache: RwLock<HashMap<(String, String), Arc<Schema>>>,
}

impl Catalog {
    /// Location of the cached bundle for a catalog version.
    pub fn bundle_path(dir: &Path, version: &str) -> PathBuf {
        dir.join(version).join("crds.yaml")
    }

    /// Open the cached bundle for `version` under `dir`.
    pub fn open(dir: &Path, version: &str) -> Result<Self> {
        let path = Self::bundle_path(dir, version);
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("reading CRD catalog {} (version {})", path.display(), version))?;
        Self::from_yaml(version, &raw)
    }

    /// Parse a multi-document CRD bundle.
    pub fn from_yaml(version: &str, bundle: &str) -> Result<Self> {
        let mut entries = BTreeMap::new();
        for doc in serde_yaml::Deserializer::from_str(bundle) {
            let v = Yaml::deserialize(doc).context("parsing CRD bundle document")?;
            if v.is_null() { continue; }
            if v.get("kind").and_then(|k| k.as_str()) != Some("CustomResourceDefinition") { continue; }
            let entry = parse_crd(&v)?;
            debug!(kind = %entry.kind, group = %entry.group, version = %entry.version, "catalog entry");
            entries.insert(entry.kind.to_lowercase(), entry);
        }
        info!(version = %version, kinds = entries.len(), "CRD catalog loaded");
        Ok(Self { version: version.to_string(), entries, cache: RwLock::new(HashMap::new()) })
    }

    pub fn version(&self) -> &str { &self.version }

    pub fn kinds(&self) -> impl Iterator<Item = &CatalogEntry> { self.entries.values() }

    /// Case-insensitive kind lookup.
    pub fn entry(&self, kind: &str) -> Option<&CatalogEntry> { self.entries.get(&kind.to_lowercase()) }

    /// Schema for `kind`, parsed once per (kind, catalog version).
    pub fn schema(&self, kind: &str) -> Result<Arc<Schema>> {
        let entry = self.entry(kind).ok_or_else(|| {
            let known: Vec<&str> = self.entries.values().map(|e| e.kind.as_str()).collect();
            anyhow!("unknown component kind {:?}; catalog {} knows: {}", kind, self.version, known.join(", "))
        })?;
        let key = (entry.kind.clone(), self.version.clone());
        if let Some(s) = self.cache.read().unwrap_or_else(|e| e.into_inner()).get(&key) {
            return Ok(Arc::clone(s));
        }
        let root = entry
            .spec_schema
            .as_ref()
            .map(Property::from_openapi)
            .unwrap_or_else(|| Property::new(PropertyType::Object));
        let schema = Arc::new(Schema::new(&entry.group, &entry.version, &entry.kind, root));
        self.cache.write().unwrap_or_else(|e| e.into_inner()).insert(key, Arc::clone(&schema));
        Ok(schema)
    }
}

fn parse_crd(v: &Yaml) -> Result<CatalogEntry> {
    let spec = v.get("spec").ok_or_else(|| anyhow!("CRD missing spec"))?;
    let group = spec.get("group").and_then(|s| s.as_str()).ok_or_else(|| anyhow!("CRD missing spec.group"))?.to_string();
    let kind = spec
        .get("names")
        .and_then(|n| n.get("kind"))
        .and_then(|s| s.as_str())
        .ok_or_else(|| anyhow!("CRD {} missing spec.names.kind", group))?
        .to_string();
    let versions = spec.get("versions").and_then(|vv| vv.as_sequence()).cloned().unwrap_or_default();

    // Prefer the storage version, else the first served one, else the first listed
    let name_of = |ver: &Yaml| ver.get("name").and_then(|s| s.as_str()).map(|s| s.to_string());
    let flag = |ver: &Yaml, f: &str| ver.get(f).and_then(|b| b.as_bool()).unwrap_or(false);
    let chosen = versions
        .iter()
        .find(|ver| flag(ver, "storage"))
        .or_else(|| versions.iter().find(|ver| flag(ver, "served")))
        .or_else(|| versions.first());
    let version = chosen.and_then(name_of).ok_or_else(|| anyhow!("CRD {}/{} declares no versions", group, kind))?;
    let spec_schema = chosen
        .and_then(|ver| ver.get("schema"))
        .and_then(|s| s.get("openAPIV3Schema"))
        .and_then(|s| s.get("properties"))
        .and_then(|p| p.get("spec"))
        .cloned();
    Ok(CatalogEntry { group, kind, version, spec_schema })
}
