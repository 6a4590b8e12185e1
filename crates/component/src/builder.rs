//! Turning user input or manifest objects into components.

use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use lmesh_core::{default_name, validate_name, Map, Object, ANNOTATION_EVENT_TYPES, KIND_BROKER, KIND_SECRET, KIND_SERVICE, KIND_TRANSFORMATION, LABEL_BROKER};
use lmesh_schema::{extract_secrets, process, secret_object, validate, Catalog};
use tracing::debug;

use crate::kinds::{Broker, SecretComponent, Service, Source, Target, Transformation};
use crate::registry::KindRegistry;
use crate::Component;

/// A freshly built component and the Secret detached from its spec, if any.
pub struct Built {
    pub component: Box<dyn Component>,
    pub secret: Option<Object>,
}

impl std::fmt::Debug for Built {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Built").field("object", self.component.object()).field("secret", &self.secret).finish()
    }
}

pub struct ComponentBuilder<'a> {
    catalog: &'a Catalog,
    registry: &'a KindRegistry,
    broker_config: Option<PathBuf>,
}

impl<'a> ComponentBuilder<'a> {
    pub fn new(catalog: &'a Catalog, registry: &'a KindRegistry) -> Self {
        Self { catalog, registry, broker_config: None }
    }

    /// Routing file mounted into Broker components rebuilt from the manifest.
    pub fn broker_config(mut self, path: impl Into<PathBuf>) -> Self {
        self.broker_config = Some(path.into());
        self
    }

    /// Build a catalog component from raw input.
    ///
    /// Runs coercion and validation, then detaches secrets. Nothing is
    /// returned on failure.
    pub fn build(&self, broker: &str, kind: &str, name: Option<&str>, raw: Map, event_types: &[String]) -> Result<Built> {
        let schema = self.catalog.schema(kind)?;
        let name = name.map(str::to_string).unwrap_or_else(|| default_name(broker, &schema.kind));
        validate_name(&name)?;
        let mut spec = process(&schema, raw).with_context(|| format!("invalid spec for {} {}", schema.kind, name))?;
        let data = extract_secrets(&name, &schema, &mut spec).with_context(|| format!("extracting secrets of {} {}", schema.kind, name))?;

        let mut object = Object::new(schema.api_version(), &schema.kind, &name).with_label(LABEL_BROKER, broker).with_spec(spec);
        if !event_types.is_empty() {
            object = object.with_annotation(ANNOTATION_EVENT_TYPES, event_types.join(","));
        }
        let secret = (!data.is_empty()).then(|| secret_object(&name, data).with_label(LABEL_BROKER, broker));
        debug!(kind = %schema.kind, name = %name, secret = secret.is_some(), "component built");
        Ok(Built { component: self.wrap(object)?, secret })
    }

    /// Rehydrate a component from its declarative form.
    pub fn from_object(&self, object: Object) -> Result<Box<dyn Component>> {
        match object.kind.as_str() {
            KIND_BROKER => {
                let path = self.broker_config.clone().ok_or_else(|| anyhow!("broker {} needs a routing config path", object.name()))?;
                Ok(Box::new(Broker::from_object(object, path)))
            }
            KIND_SERVICE => Ok(Box::new(Service::from_object(object)?)),
            KIND_SECRET => Ok(Box::new(SecretComponent::new(object))),
            _ => {
                let schema = self.catalog.schema(&object.kind)?;
                validate(&schema, &object.spec).with_context(|| format!("{} {} in manifest", object.kind, object.name()))?;
                self.wrap(object)
            }
        }
    }

    fn wrap(&self, object: Object) -> Result<Box<dyn Component>> {
        let entry = self.catalog.entry(&object.kind).ok_or_else(|| anyhow!("unknown component kind {:?}", object.kind))?;
        let handler = self.registry.handler(&object.kind);
        let component: Box<dyn Component> = if entry.kind == KIND_TRANSFORMATION {
            Box::new(Transformation::new(object, handler))
        } else if entry.category() == "sources" {
            Box::new(Source::new(object, handler))
        } else {
            Box::new(Target::new(object, handler))
        };
        Ok(component)
    }
}
