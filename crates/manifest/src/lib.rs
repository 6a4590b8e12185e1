//! lmesh manifest: the ordered, file-backed list of declarative objects of one broker.

#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use lmesh_core::{Object, StagedFile, Value};
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

fn max_yaml_bytes() -> usize {
    std::env::var("LMESH_MAX_YAML_BYTES")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(1_000_000) // 1 MiB default
}

fn max_yaml_nodes() -> usize {
    std::env::var("LMESH_MAX_YAML_NODES")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(100_000)
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffSummary { pub adds: usize, pub updates: usize, pub removes: usize }

impl DiffSummary {
    pub fn is_empty(&self) -> bool { self.adds == 0 && self.updates == 0 && self.removes == 0 }
}

/// Declarative objects of one broker, in insertion order.
#[derive(Debug, Clone)]
pub struct Manifest {
    path: PathBuf,
    pub objects: Vec<Object>,
}

impl Manifest {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), objects: Vec::new() }
    }

    /// Read `path`, treating a missing file as an empty manifest.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let mut m = Self::new(path);
        if m.path.exists() { m.read()?; }
        Ok(m)
    }

    pub fn path(&self) -> &Path { &self.path }

    /// Replace the in-memory objects with the content of the backing path.
    ///
    /// A directory path reads every regular file directly inside it, sorted by
    /// file name; subdirectories and dotfiles are skipped.
    pub fn read(&mut self) -> Result<()> {
        let started = std::time::Instant::now();
        let files = if self.path.is_dir() {
            let mut files: Vec<PathBuf> = std::fs::read_dir(&self.path)
                .with_context(|| format!("listing manifest directory {}", self.path.display()))?
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
                .filter(|e| !e.file_name().to_string_lossy().starts_with('.'))
                .map(|e| e.path())
                .collect();
            files.sort();
            files
        } else {
            vec![self.path.clone()]
        };
        let mut objects: Vec<Object> = Vec::new();
        for f in files.iter() {
            let raw = std::fs::read_to_string(f).with_context(|| format!("reading manifest {}", f.display()))?;
            let parsed = parse_documents(&raw).with_context(|| format!("parsing manifest {}", f.display()))?;
            objects.extend(parsed);
        }
        self.objects.clear();
        for o in objects { self.add(o); }
        histogram!("manifest_read_ms", started.elapsed().as_secs_f64() * 1000.0);
        debug!(path = %self.path.display(), files = files.len(), objects = self.objects.len(), "manifest read");
        Ok(())
    }

    /// Insert or replace by identity. Returns true if the manifest changed.
    pub fn add(&mut self, object: Object) -> bool {
        let key = object.key();
        match self.objects.iter().position(|o| o.key() == key) {
            Some(idx) if self.objects[idx] == object => false,
            Some(idx) => {
                let diff = diff_objects(&object, &self.objects[idx]);
                debug!(object = %key, adds = diff.adds, updates = diff.updates, removes = diff.removes, "manifest object replaced");
                self.objects[idx] = object;
                true
            }
            None => {
                self.objects.push(object);
                true
            }
        }
    }

    /// Remove by `(name, kind)`; absent objects are a no-op. Returns true if removed.
    pub fn remove(&mut self, name: &str, kind: &str) -> bool {
        let before = self.objects.len();
        self.objects.retain(|o| !(o.metadata.name == name && o.kind == kind));
        before != self.objects.len()
    }

    pub fn get(&self, name: &str, kind: &str) -> Option<&Object> {
        self.objects.iter().find(|o| o.metadata.name == name && o.kind == kind)
    }

    /// Look up by name alone; names are unique per broker in practice.
    pub fn get_by_name(&self, name: &str) -> Option<&Object> {
        self.objects.iter().find(|o| o.metadata.name == name)
    }

    pub fn find_by_kind<'a>(&'a self, kind: &'a str) -> impl Iterator<Item = &'a Object> + 'a {
        self.objects.iter().filter(move |o| o.kind == kind)
    }

    pub fn find_by_label<'a>(&'a self, key: &'a str, value: &'a str) -> impl Iterator<Item = &'a Object> + 'a {
        self.objects.iter().filter(move |o| o.label(key) == Some(value))
    }

    /// Serialize as `---`-delimited documents in slice order.
    pub fn render(&self) -> Result<String> {
        let mut out = String::new();
        for o in self.objects.iter() {
            out.push_str("---\n");
            out.push_str(&serde_yaml::to_string(o).with_context(|| format!("serializing {}", o.key()))?);
        }
        Ok(out)
    }

    fn ensure_file_backed(&self) -> Result<()> {
        if self.path.is_dir() {
            return Err(anyhow!("manifest {} is a directory and cannot be written", self.path.display()));
        }
        Ok(())
    }

    /// Stage the rendered manifest next to the backing file; commit to publish.
    pub fn stage(&self) -> Result<StagedFile> {
        self.ensure_file_backed()?;
        StagedFile::write(&self.path, self.render()?.as_bytes())
    }

    pub fn write(&self) -> Result<()> {
        let started = std::time::Instant::now();
        self.stage()?.commit().with_context(|| format!("writing manifest {}", self.path.display()))?;
        counter!("manifest_write_total", 1u64);
        histogram!("manifest_write_ms", started.elapsed().as_secs_f64() * 1000.0);
        info!(path = %self.path.display(), objects = self.objects.len(), "manifest written");
        Ok(())
    }
}

/// Parse every non-empty YAML document of `raw` into objects.
pub fn parse_documents(raw: &str) -> Result<Vec<Object>> {
    if raw.len() > max_yaml_bytes() {
        return Err(anyhow!("YAML payload too large (>{} bytes)", max_yaml_bytes()));
    }
    let mut out = Vec::new();
    for (i, doc) in serde_yaml::Deserializer::from_str(raw).enumerate() {
        let v = Value::deserialize(doc).with_context(|| format!("parsing YAML document {}", i))?;
        if v.is_null() { continue; }
        if v.node_count() > max_yaml_nodes() {
            return Err(anyhow!("YAML document {} too complex (>{} nodes)", i, max_yaml_nodes()));
        }
        let map = v.as_map().ok_or_else(|| anyhow!("YAML document {} is not a mapping", i))?;
        if !map.contains_key("apiVersion") { return Err(anyhow!("YAML document {} missing apiVersion", i)); }
        if !map.contains_key("kind") { return Err(anyhow!("YAML document {} missing kind", i)); }
        if v.pointer("metadata.name").and_then(Value::as_str).is_none() {
            return Err(anyhow!("YAML document {} missing metadata.name", i));
        }
        let obj: Object = serde_yaml::from_value(serde_yaml::to_value(&v)?).with_context(|| format!("decoding YAML document {}", i))?;
        out.push(obj);
    }
    Ok(out)
}

fn object_value(o: &Object) -> Value {
    serde_yaml::to_value(o).ok().and_then(|y| serde_yaml::from_value(y).ok()).unwrap_or_default()
}

/// Count field-level differences between two objects.
pub fn diff_objects(target: &Object, base: &Object) -> DiffSummary {
    diff_summary(&object_value(target), &object_value(base))
}

pub fn diff_summary(target: &Value, base: &Value) -> DiffSummary {
    fn walk(a: &Value, b: &Value, s: &mut DiffSummary) {
        match (a, b) {
            (Value::Map(am), Value::Map(bm)) => {
                for (k, av) in am.iter() {
                    match bm.get(k) {
                        Some(bv) if av == bv => {}
                        Some(bv) => walk(av, bv, s),
                        None => s.adds += 1,
                    }
                }
                s.removes += bm.keys().filter(|k| !am.contains_key(*k)).count();
            }
            (Value::List(al), Value::List(bl)) => {
                s.updates += al.iter().zip(bl.iter()).filter(|(x, y)| x != y).count();
                s.adds += al.len().saturating_sub(bl.len());
                s.removes += bl.len().saturating_sub(al.len());
            }
            // Scalars differ or type differs
            (av, bv) => { if av != bv { s.updates += 1; } }
        }
    }
    let mut s = DiffSummary::default();
    walk(target, base, &mut s);
    s
}

#[cfg(test)]
mod tests {
    use super::*;
    use lmesh_core::map;

    #[test]
    fn diff_summary_counts_adds_updates_removes() {
        let base = map! { "a" => 1i64, "b" => map! { "x" => 1i64 }, "c" => vec![1i64, 2, 3] };
        let target = map! { "a" => 2i64, "b" => map! { "x" => 1i64, "y" => 2i64 }, "c" => vec![1i64, 9], "d" => true };
        let s = diff_summary(&target, &base);
        assert_eq!(s, DiffSummary { adds: 2, updates: 2, removes: 1 });
        assert!(diff_summary(&base, &base).is_empty());
    }

    #[test]
    fn parse_errors_are_friendly() {
        let e1 = parse_documents("kind: Foo\nmetadata:\n  name: x\n").unwrap_err().to_string();
        assert!(e1.contains("missing apiVersion"), "e1={}", e1);
        let e2 = parse_documents("apiVersion: v1\nmetadata:\n  name: x\n").unwrap_err().to_string();
        assert!(e2.contains("missing kind"), "e2={}", e2);
        let e3 = parse_documents("apiVersion: v1\nkind: Secret\nmetadata: {}\n").unwrap_err().to_string();
        assert!(e3.contains("missing metadata.name"), "e3={}", e3);
        let e4 = parse_documents("- a\n- b\n").unwrap_err().to_string();
        assert!(e4.contains("not a mapping"), "e4={}", e4);
    }

    #[test]
    fn empty_documents_are_skipped() {
        let objs = parse_documents("---\n---\napiVersion: v1\nkind: Secret\nmetadata:\n  name: s\n---\n").unwrap();
        assert_eq!(objs.len(), 1);
        assert_eq!(objs[0].name(), "s");
    }

    #[test]
    fn add_replace_and_remove() {
        let mut m = Manifest::new("unused.yaml");
        let a = Object::new("v1", "Secret", "a");
        let b = Object::new("v1", "Secret", "b");
        assert!(m.add(a.clone()));
        assert!(m.add(b.clone()));
        let a2 = a.clone().with_label("x", "y");
        assert!(m.add(a2.clone()));
        assert_eq!(m.objects, vec![a2, b.clone()]);
        assert!(m.remove("a", "Secret"));
        assert!(!m.remove("a", "Secret"));
        assert!(!m.remove("b", "Broker"));
        assert_eq!(m.objects, vec![b]);
    }
}
