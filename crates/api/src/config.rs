//! Explicit configuration, resolved once from the environment and CLI flags.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

pub const DEFAULT_REGISTRY: &str = "ghcr.io/lmesh";
pub const DEFAULT_CATALOG_VERSION: &str = "latest";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Root of all per-broker state and the CRD cache.
    pub home: PathBuf,
    /// Broker every command operates on.
    pub broker: Option<String>,
    pub catalog_version: String,
    pub image_registry: String,
    pub broker_image: String,
}

impl Config {
    /// `LMESH_HOME` (default `~/.lmesh`), `LMESH_BROKER`, `LMESH_CATALOG_VERSION`,
    /// `LMESH_IMAGE_REGISTRY`, `LMESH_BROKER_IMAGE`.
    pub fn from_env() -> Self {
        let var = |k: &str| std::env::var(k).ok().filter(|v| !v.trim().is_empty());
        let home = var("LMESH_HOME").map(PathBuf::from).unwrap_or_else(|| {
            var("HOME").map(|h| Path::new(&h).join(".lmesh")).unwrap_or_else(|| PathBuf::from(".lmesh"))
        });
        let catalog_version = var("LMESH_CATALOG_VERSION").unwrap_or_else(|| DEFAULT_CATALOG_VERSION.to_string());
        let image_registry = var("LMESH_IMAGE_REGISTRY").unwrap_or_else(|| DEFAULT_REGISTRY.to_string());
        let broker_image = var("LMESH_BROKER_IMAGE").unwrap_or_else(|| default_broker_image(&image_registry, &catalog_version));
        Self { home, broker: var("LMESH_BROKER"), catalog_version, image_registry, broker_image }
    }

    pub fn with_home(home: impl Into<PathBuf>) -> Self {
        Self {
            home: home.into(),
            broker: None,
            catalog_version: DEFAULT_CATALOG_VERSION.to_string(),
            image_registry: DEFAULT_REGISTRY.to_string(),
            broker_image: default_broker_image(DEFAULT_REGISTRY, DEFAULT_CATALOG_VERSION),
        }
    }

    pub fn with_broker(mut self, broker: impl Into<String>) -> Self {
        self.broker = Some(broker.into());
        self
    }

    pub fn broker_dir(&self, broker: &str) -> PathBuf { self.home.join(broker) }

    pub fn manifest_path(&self, broker: &str) -> PathBuf { self.broker_dir(broker).join("manifest.yaml") }

    pub fn routing_path(&self, broker: &str) -> PathBuf { self.broker_dir(broker).join("broker.conf") }

    /// Directory holding `<version>/crds.yaml`.
    pub fn crds_dir(&self) -> PathBuf { self.home.join("crds") }
}

fn default_broker_image(registry: &str, version: &str) -> String {
    format!("{}/broker:{}", registry.trim_end_matches('/'), version)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_hang_off_home_and_broker() {
        let c = Config::with_home("/h").with_broker("demo");
        assert_eq!(c.manifest_path("demo"), PathBuf::from("/h/demo/manifest.yaml"));
        assert_eq!(c.routing_path("demo"), PathBuf::from("/h/demo/broker.conf"));
        assert_eq!(c.crds_dir(), PathBuf::from("/h/crds"));
        assert_eq!(c.broker_image, "ghcr.io/lmesh/broker:latest");
        assert_eq!(c.broker.as_deref(), Some("demo"));
    }
}
