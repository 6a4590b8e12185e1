use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::future::try_join_all;
use lmesh_component::{image_for, referenced_secrets, secret_envs, Broker, Component, ComponentBuilder, KindRegistry, RuntimeParams, Service};
use lmesh_core::{validate_name, Object, Value, KIND_BROKER, KIND_SECRET, KIND_SERVICE, KIND_TRANSFORMATION, KIND_TRIGGER};
use lmesh_manifest::Manifest;
use lmesh_ops::{host_gateway, ContainerEngine, ContainerHandle, ContainerStatus, DockerEngine, LogChunk, ReadyOptions, StreamHandle, Supervisor};
use lmesh_routing::{apply_trigger_change, delete_for_target, RoutingConfig, Target, Trigger, TriggerChange};
use lmesh_schema::{Catalog, SchemaError};
use metrics::counter;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    BrokerDescription, ComponentStatus, Config, CreateRequest, Created, KindInfo, LmeshApi, LmeshError, LmeshResult, ServiceRequest,
    Subscription, TriggerStatus,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Source,
    Target,
    Transformation,
}

impl Role {
    fn admits(&self, kind: &str, category: &str) -> bool {
        match self {
            Role::Source => category == "sources",
            Role::Target => category != "sources" && kind != KIND_TRANSFORMATION,
            Role::Transformation => kind == KIND_TRANSFORMATION,
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            Role::Source => "source",
            Role::Target => "target",
            Role::Transformation => "transformation",
        }
    }
}

/// URL under which containers reach a port published on the host.
fn host_url(port: u16) -> String { format!("http://{}:{}", host_gateway(), port) }

fn default_trigger_name(target: &str) -> String { format!("{}-trigger", target) }

/// Engine-side name of a component's container. Component names are only
/// unique within a broker, so everything but the broker itself is prefixed.
pub fn container_name(broker: &str, component: &str) -> String {
    if component == broker { broker.to_string() } else { format!("{}.{}", broker, component) }
}

fn validation(e: anyhow::Error) -> LmeshError { LmeshError::Validation(format!("{:#}", e)) }

/// Implementation that runs everything in this process against a local engine.
pub struct InProcApi {
    config: Config,
    catalog: Arc<Catalog>,
    registry: KindRegistry,
    supervisor: Supervisor,
}

impl InProcApi {
    pub fn new(config: Config, catalog: Arc<Catalog>, engine: Arc<dyn ContainerEngine>) -> Self {
        let registry = KindRegistry::from_catalog(&catalog);
        Self { config, catalog, registry, supervisor: Supervisor::new(engine) }
    }

    /// Open the cached catalog and connect to the local Docker engine.
    pub fn connect(config: Config) -> LmeshResult<Self> {
        let catalog = Catalog::open(&config.crds_dir(), &config.catalog_version).map_err(Self::map_err)?;
        let engine = DockerEngine::connect().map_err(Self::engine_err)?;
        Ok(Self::new(config, Arc::new(catalog), Arc::new(engine)))
    }

    pub fn with_ready_options(mut self, ready: ReadyOptions) -> Self {
        self.supervisor = self.supervisor.with_ready_options(ready);
        self
    }

    fn map_err(e: anyhow::Error) -> LmeshError {
        if e.chain().any(|c| c.downcast_ref::<SchemaError>().is_some()) {
            return LmeshError::Validation(format!("{:#}", e));
        }
        LmeshError::Internal(format!("{:#}", e))
    }

    fn engine_err(e: anyhow::Error) -> LmeshError { LmeshError::Engine(format!("{:#}", e)) }

    fn broker(&self) -> LmeshResult<&str> {
        self.config
            .broker
            .as_deref()
            .ok_or_else(|| LmeshError::Validation("no broker selected; pass --broker or set LMESH_BROKER".into()))
    }

    fn builder(&self, broker: &str) -> ComponentBuilder<'_> {
        ComponentBuilder::new(&self.catalog, &self.registry).broker_config(self.config.routing_path(broker))
    }

    /// Manifest and routing config of an existing broker.
    fn load(&self, broker: &str) -> LmeshResult<(Manifest, RoutingConfig)> {
        let manifest = Manifest::open(self.config.manifest_path(broker)).map_err(Self::map_err)?;
        if manifest.get(broker, KIND_BROKER).is_none() {
            return Err(LmeshError::NotFound(format!("broker {}", broker)));
        }
        let routing = RoutingConfig::load(self.config.routing_path(broker)).map_err(Self::map_err)?;
        Ok((manifest, routing))
    }

    fn component(&self, broker: &str, manifest: &Manifest, name: &str) -> LmeshResult<Box<dyn Component>> {
        let object = manifest.get_by_name(name).ok_or_else(|| LmeshError::NotFound(format!("component {}", name)))?;
        if object.kind == KIND_TRIGGER {
            return Err(LmeshError::Validation(format!("{} is a trigger, not a component", name)));
        }
        self.builder(broker).from_object(object.clone()).map_err(Self::map_err)
    }

    /// Every component of the manifest except triggers, in manifest order.
    fn components(&self, broker: &str, manifest: &Manifest) -> LmeshResult<Vec<Box<dyn Component>>> {
        let builder = self.builder(broker);
        manifest
            .objects
            .iter()
            .filter(|o| o.kind != KIND_TRIGGER)
            .map(|o| builder.from_object(o.clone()).map_err(Self::map_err))
            .collect()
    }

    fn image(&self, object: &Object) -> String {
        match object.kind.as_str() {
            KIND_BROKER => self.config.broker_image.clone(),
            KIND_SERVICE => object.spec.get("image").and_then(Value::as_str).unwrap_or_default().to_string(),
            kind => image_for(kind, &self.config.catalog_version, &self.config.image_registry),
        }
    }

    /// Broker URL handed to producers as `K_SINK`; the broker must be running.
    async fn sink(&self, broker: &str) -> LmeshResult<String> {
        let info = self.supervisor.info(&container_name(broker, broker)).await.map_err(Self::engine_err)?;
        match (info.status, info.host_port) {
            (ContainerStatus::Running, Some(port)) => Ok(host_url(port)),
            _ => Err(LmeshError::Conflict(format!("broker {} is {}; start it first", broker, info.status))),
        }
    }

    /// The sink `component` needs, if it produces events into the broker.
    async fn sink_for(&self, broker: &str, component: &dyn Component) -> LmeshResult<Option<String>> {
        if component.kind() != KIND_BROKER && component.as_producer().is_some() {
            return Ok(Some(self.sink(broker).await?));
        }
        Ok(None)
    }

    /// Runtime parameters with secret values and, for producers, the broker sink.
    fn params(&self, manifest: &Manifest, component: &dyn Component, sink: Option<&str>) -> LmeshResult<RuntimeParams> {
        let runnable = component
            .as_runnable()
            .ok_or_else(|| LmeshError::Validation(format!("{} {} is not runnable", component.kind(), component.name())))?;
        let mut envs = Vec::new();
        if let Some(parent) = component.as_parent() {
            for key in parent.children() {
                let secret = manifest
                    .get(&key.name, &key.kind)
                    .ok_or_else(|| LmeshError::NotFound(format!("secret {} referenced by {}", key.name, component.name())))?;
                envs.extend(secret_envs(secret).map_err(Self::map_err)?);
            }
        }
        if component.kind() != KIND_BROKER && component.as_producer().is_some() {
            let sink = sink.ok_or_else(|| LmeshError::Internal(format!("no broker sink for producer {}", component.name())))?;
            envs.push(format!("K_SINK={}", sink));
        }
        runnable.runtime_params(&self.image(component.object()), &envs).map_err(Self::map_err)
    }

    async fn run(
        &self,
        broker: &str,
        manifest: &Manifest,
        component: &dyn Component,
        sink: Option<&str>,
        restart: bool,
        cancel: &CancellationToken,
    ) -> LmeshResult<ContainerHandle> {
        let params = self.params(manifest, component, sink)?;
        let mut handle = self
            .supervisor
            .start(&params, &container_name(broker, component.name()), restart, cancel)
            .await
            .map_err(Self::engine_err)?;
        handle.name = component.name().to_string();
        Ok(handle)
    }

    /// Event types a subscription resolves to; None when it is empty.
    fn subscription_types(&self, broker: &str, manifest: &Manifest, sub: &Subscription) -> LmeshResult<Option<Vec<String>>> {
        if sub.is_empty() {
            return Ok(None);
        }
        let mut types = sub.event_types.clone();
        for source in sub.sources.iter() {
            let component = self.component(broker, manifest, source)?;
            let produced = component.as_producer().map(|p| p.event_types()).unwrap_or_default();
            if produced.is_empty() {
                return Err(LmeshError::Validation(format!("{} does not declare the event types it produces", source)));
            }
            types.extend(produced);
        }
        types.sort();
        types.dedup();
        Ok(Some(types))
    }

    /// Point triggers at the current host ports of restarted consumers.
    fn refresh_routes(&self, broker: &str, routing: &mut RoutingConfig, manifest: &mut Manifest, handles: &[ContainerHandle]) -> LmeshResult<usize> {
        let mut changed = 0;
        for h in handles.iter() {
            let url = host_url(h.host_port);
            for name in routing.triggers_for_target(&h.name) {
                let Some(mut trigger) = routing.lookup(&name) else { continue };
                if trigger.target.url == url {
                    continue;
                }
                debug!(trigger = %name, from = %trigger.target.url, to = %url, "retargeting trigger");
                trigger.target.url = url.clone();
                apply_trigger_change(routing, manifest, broker, TriggerChange::Upsert(trigger)).map_err(Self::map_err)?;
                changed += 1;
            }
        }
        Ok(changed)
    }

    /// Persist a built component, run it and wire its subscription.
    async fn install(
        &self,
        broker: &str,
        component: Box<dyn Component>,
        secret: Option<Object>,
        subscribe: &Subscription,
        cancel: &CancellationToken,
    ) -> LmeshResult<Created> {
        let t0 = Instant::now();
        let (mut manifest, mut routing) = self.load(broker)?;
        let name = component.name().to_string();
        let kind = component.kind().to_string();
        if let Some(existing) = manifest.get_by_name(&name) {
            if existing.kind != kind {
                return Err(LmeshError::Conflict(format!("{} already exists as a {}", name, existing.kind)));
            }
        }
        if !subscribe.is_empty() && component.as_consumer().is_none() {
            return Err(LmeshError::Validation(format!("{} {} does not accept events", kind, name)));
        }
        let types = self.subscription_types(broker, &manifest, subscribe)?;
        // Producers need a running broker before anything is recorded
        let sink = self.sink_for(broker, component.as_ref()).await?;

        let secret_name = secret.as_ref().map(|s| s.name().to_string());
        let mut changed = false;
        if let Some(s) = secret {
            changed |= manifest.add(s);
        }
        changed |= manifest.add(component.object().clone());
        if changed {
            manifest.write().map_err(Self::map_err)?;
        }

        // A changed definition must not keep running in the old container
        let container = self.run(broker, &manifest, component.as_ref(), sink.as_deref(), changed, cancel).await?;
        if container.created {
            self.refresh_routes(broker, &mut routing, &mut manifest, std::slice::from_ref(&container))?;
        }
        let trigger = match types {
            Some(types) => {
                let trigger = Trigger::for_event_types(default_trigger_name(&name), &types, Target::new(&name, host_url(container.host_port)));
                let trigger_name = trigger.name.clone();
                apply_trigger_change(&mut routing, &mut manifest, broker, TriggerChange::Upsert(trigger)).map_err(Self::map_err)?;
                Some(trigger_name)
            }
            None => None,
        };
        counter!("api_create_total", 1u64);
        info!(broker = %broker, kind = %kind, name = %name, changed, host_port = container.host_port, took_ms = %t0.elapsed().as_millis(), "api: create ok");
        Ok(Created { name, kind, secret: secret_name, container, trigger })
    }

    async fn create_catalog_component(&self, role: Role, req: CreateRequest, cancel: &CancellationToken) -> LmeshResult<Created> {
        let broker = self.broker()?;
        let entry = self.catalog.entry(&req.kind).ok_or_else(|| LmeshError::Validation(format!("unknown component kind {:?}", req.kind)))?;
        if !role.admits(&entry.kind, entry.category()) {
            return Err(LmeshError::Validation(format!("{} is not a {} kind", entry.kind, role.as_str())));
        }
        if let Some(name) = req.name.as_deref() {
            validate_name(name).map_err(validation)?;
        }
        let built = self.builder(broker).build(broker, &entry.kind, req.name.as_deref(), req.spec, &req.event_types).map_err(Self::map_err)?;
        self.install(broker, built.component, built.secret, &req.subscribe, cancel).await
    }

    async fn delete_broker(&self, broker: &str) -> LmeshResult<Vec<String>> {
        let t0 = Instant::now();
        let (manifest, _) = self.load(broker)?;
        for object in manifest.objects.iter().filter(|o| o.kind != KIND_TRIGGER && o.kind != KIND_SECRET) {
            let container = container_name(broker, object.name());
            if let Err(e) = self.supervisor.stop(&container).await {
                warn!(container = %container, error = %e, "container removal failed; continuing");
            }
        }
        let dir = self.config.broker_dir(broker);
        std::fs::remove_dir_all(&dir).map_err(|e| LmeshError::Internal(format!("removing {}: {}", dir.display(), e)))?;
        info!(broker = %broker, objects = manifest.objects.len(), took_ms = %t0.elapsed().as_millis(), "api: broker deleted");
        Ok(manifest.objects.iter().map(|o| o.name().to_string()).collect())
    }
}

#[async_trait]
impl LmeshApi for InProcApi {
    fn config(&self) -> &Config { &self.config }

    async fn kinds(&self) -> LmeshResult<Vec<KindInfo>> {
        let mut kinds: Vec<KindInfo> = self
            .catalog
            .kinds()
            .map(|e| KindInfo { kind: e.kind.clone(), api_version: e.api_version(), category: e.category().to_string() })
            .collect();
        kinds.sort_by(|a, b| (a.category.as_str(), a.kind.as_str()).cmp(&(b.category.as_str(), b.kind.as_str())));
        Ok(kinds)
    }

    async fn brokers(&self) -> LmeshResult<Vec<String>> {
        let entries = match std::fs::read_dir(&self.config.home) {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(LmeshError::Internal(format!("listing {}: {}", self.config.home.display(), e))),
        };
        let mut brokers: Vec<String> = entries
            .filter_map(|e| e.ok())
            .filter(|e| e.path().join("manifest.yaml").is_file())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        brokers.sort();
        Ok(brokers)
    }

    async fn create_broker(&self, cancel: &CancellationToken) -> LmeshResult<ContainerHandle> {
        let t0 = Instant::now();
        let broker = self.broker()?;
        validate_name(broker).map_err(validation)?;
        let mut manifest = Manifest::open(self.config.manifest_path(broker)).map_err(Self::map_err)?;
        if let Some(existing) = manifest.get_by_name(broker) {
            if existing.kind != KIND_BROKER {
                return Err(LmeshError::Conflict(format!("{} already exists as a {}", broker, existing.kind)));
            }
        }
        let routing_path = self.config.routing_path(broker);
        let component = Broker::new(broker, routing_path.clone());
        if manifest.add(component.object().clone()) {
            manifest.write().map_err(Self::map_err)?;
        }
        // The engine bind-mounts the routing file's directory; the file has to exist first
        if !routing_path.exists() {
            RoutingConfig::new(routing_path.clone()).save().map_err(Self::map_err)?;
        }
        let handle = self.run(broker, &manifest, &component, None, false, cancel).await?;
        info!(broker = %broker, host_port = handle.host_port, took_ms = %t0.elapsed().as_millis(), "api: create broker ok");
        Ok(handle)
    }

    async fn create_source(&self, req: CreateRequest, cancel: &CancellationToken) -> LmeshResult<Created> {
        if !req.subscribe.is_empty() {
            return Err(LmeshError::Validation("sources do not subscribe to events".into()));
        }
        self.create_catalog_component(Role::Source, req, cancel).await
    }

    async fn create_target(&self, req: CreateRequest, cancel: &CancellationToken) -> LmeshResult<Created> {
        self.create_catalog_component(Role::Target, req, cancel).await
    }

    async fn create_transformation(&self, req: CreateRequest, cancel: &CancellationToken) -> LmeshResult<Created> {
        self.create_catalog_component(Role::Transformation, req, cancel).await
    }

    async fn create_service(&self, req: ServiceRequest, cancel: &CancellationToken) -> LmeshResult<Created> {
        let broker = self.broker()?;
        validate_name(&req.name).map_err(validation)?;
        if req.image.trim().is_empty() {
            return Err(LmeshError::Validation(format!("service {} needs an image", req.name)));
        }
        let mut service = Service::new(broker, &req.name, &req.image).with_event_types(&req.event_types);
        if !req.env.is_empty() {
            service = service.with_env(req.env);
        }
        if let Some(command) = req.command {
            service = service.with_entrypoint(command);
        }
        self.install(broker, Box::new(service), None, &req.subscribe, cancel).await
    }

    async fn create_trigger(&self, name: Option<String>, target: &str, subscribe: Subscription) -> LmeshResult<TriggerStatus> {
        let broker = self.broker()?;
        let (mut manifest, mut routing) = self.load(broker)?;
        let component = self.component(broker, &manifest, target)?;
        if component.as_consumer().is_none() || component.kind() == KIND_BROKER {
            return Err(LmeshError::Validation(format!("{} {} does not accept events", component.kind(), target)));
        }
        let info = self.supervisor.info(&container_name(broker, target)).await.map_err(Self::engine_err)?;
        let port = match (info.status, info.host_port) {
            (ContainerStatus::Running, Some(p)) => p,
            _ => return Err(LmeshError::Conflict(format!("target {} is {}; start it first", target, info.status))),
        };
        let name = name.unwrap_or_else(|| default_trigger_name(target));
        validate_name(&name).map_err(validation)?;
        if let Some(existing) = manifest.get_by_name(&name) {
            if existing.kind != KIND_TRIGGER {
                return Err(LmeshError::Conflict(format!("{} already exists as a {}", name, existing.kind)));
            }
        }
        let types = self.subscription_types(broker, &manifest, &subscribe)?.unwrap_or_default();
        let trigger = Trigger::for_event_types(&name, &types, Target::new(target, host_url(port)));
        let status = TriggerStatus::from(&trigger);
        apply_trigger_change(&mut routing, &mut manifest, broker, TriggerChange::Upsert(trigger)).map_err(Self::map_err)?;
        info!(broker = %broker, trigger = %name, target = %target, types = types.len(), "api: create trigger ok");
        Ok(status)
    }

    async fn delete(&self, name: &str) -> LmeshResult<Vec<String>> {
        let t0 = Instant::now();
        let broker = self.broker()?;
        if name == broker {
            return self.delete_broker(broker).await;
        }
        let (mut manifest, mut routing) = self.load(broker)?;
        let object = manifest.get_by_name(name).cloned().ok_or_else(|| LmeshError::NotFound(format!("component {}", name)))?;
        let mut removed = Vec::new();
        match object.kind.as_str() {
            KIND_TRIGGER => {
                apply_trigger_change(&mut routing, &mut manifest, broker, TriggerChange::Delete(name.to_string())).map_err(Self::map_err)?;
                removed.push(name.to_string());
            }
            KIND_SECRET => {
                return Err(LmeshError::Validation(format!("secret {} is removed together with the component owning it", name)));
            }
            _ => {
                let children = match self.builder(broker).from_object(object.clone()) {
                    Ok(c) => c.as_parent().map(|p| p.children()).unwrap_or_default(),
                    Err(e) => {
                        warn!(component = %name, error = %e, "manifest object no longer validates; deleting anyway");
                        referenced_secrets(&object)
                    }
                };
                let container = container_name(broker, name);
                if let Err(e) = self.supervisor.stop(&container).await {
                    warn!(container = %container, error = %e, "container removal failed; continuing");
                }
                removed.extend(delete_for_target(&mut routing, &mut manifest, broker, name).map_err(Self::map_err)?);
                for child in children.iter() {
                    if manifest.remove(&child.name, &child.kind) {
                        removed.push(child.name.clone());
                    } else {
                        warn!(secret = %child.name, owner = %name, "referenced secret already gone");
                    }
                }
                manifest.remove(name, &object.kind);
                manifest.write().map_err(Self::map_err)?;
                removed.push(name.to_string());
            }
        }
        counter!("api_delete_total", 1u64);
        info!(broker = %broker, name = %name, removed = removed.len(), took_ms = %t0.elapsed().as_millis(), "api: delete ok");
        Ok(removed)
    }

    async fn describe(&self) -> LmeshResult<BrokerDescription> {
        let broker = self.broker()?;
        let (manifest, routing) = self.load(broker)?;
        let mut components = Vec::new();
        for component in self.components(broker, &manifest)? {
            if component.as_runnable().is_none() {
                continue;
            }
            let info = self.supervisor.info(&container_name(broker, component.name())).await.map_err(Self::engine_err)?;
            components.push(ComponentStatus {
                name: component.name().to_string(),
                kind: component.kind().to_string(),
                status: info.status,
                host_port: info.host_port,
                produces: component.as_producer().map(|p| p.event_types().into_vec()).unwrap_or_default(),
                accepts: component.as_consumer().map(|c| c.accepted_event_types().into_vec()).unwrap_or_default(),
            });
        }
        let triggers = routing.triggers().map(|t| TriggerStatus::from(&t)).collect();
        Ok(BrokerDescription { broker: broker.to_string(), components, triggers })
    }

    async fn start(&self, name: Option<&str>, restart: bool, cancel: &CancellationToken) -> LmeshResult<Vec<ContainerHandle>> {
        let t0 = Instant::now();
        let broker = self.broker()?;
        let (mut manifest, mut routing) = self.load(broker)?;

        if let Some(name) = name {
            let component = self.component(broker, &manifest, name)?;
            let sink = self.sink_for(broker, component.as_ref()).await?;
            let handle = self.run(broker, &manifest, component.as_ref(), sink.as_deref(), restart, cancel).await?;
            self.refresh_routes(broker, &mut routing, &mut manifest, std::slice::from_ref(&handle))?;
            info!(broker = %broker, name = %name, created = handle.created, took_ms = %t0.elapsed().as_millis(), "api: start ok");
            return Ok(vec![handle]);
        }

        // The broker goes first: producers need its URL
        let components = self.components(broker, &manifest)?;
        let broker_component = components
            .iter()
            .find(|c| c.kind() == KIND_BROKER)
            .ok_or_else(|| LmeshError::NotFound(format!("broker {}", broker)))?;
        let broker_handle = self.run(broker, &manifest, broker_component.as_ref(), None, restart, cancel).await?;
        let sink = host_url(broker_handle.host_port);

        let jobs_cancel = cancel.child_token();
        let mut jobs = Vec::new();
        for component in components.iter().filter(|c| c.kind() != KIND_BROKER && c.as_runnable().is_some()) {
            let params = self.params(&manifest, component.as_ref(), Some(&sink))?;
            // A recreated broker has a new port, so producers must pick up the new sink
            let restart = restart || (broker_handle.created && component.as_producer().is_some());
            let supervisor = self.supervisor.clone();
            let name = component.name().to_string();
            let container = container_name(broker, &name);
            let cancel = jobs_cancel.clone();
            let task = tokio::spawn(async move { supervisor.start(&params, &container, restart, &cancel).await });
            jobs.push(async move {
                match task.await {
                    Ok(result) => result.map(|h| ContainerHandle { name, ..h }).map_err(Self::engine_err),
                    Err(e) => Err(LmeshError::Internal(format!("start task failed: {}", e))),
                }
            });
        }
        let handles = match try_join_all(jobs).await {
            Ok(h) => h,
            Err(e) => {
                jobs_cancel.cancel();
                return Err(e);
            }
        };

        let mut all = Vec::with_capacity(handles.len() + 1);
        all.push(broker_handle);
        all.extend(handles);
        let retargeted = self.refresh_routes(broker, &mut routing, &mut manifest, &all)?;
        counter!("api_start_all_total", 1u64);
        info!(broker = %broker, containers = all.len(), retargeted, took_ms = %t0.elapsed().as_millis(), "api: start all ok");
        Ok(all)
    }

    async fn stop(&self, name: Option<&str>) -> LmeshResult<Vec<String>> {
        let broker = self.broker()?;
        let (manifest, _) = self.load(broker)?;
        let names: Vec<String> = match name {
            Some(n) => vec![self.component(broker, &manifest, n)?.name().to_string()],
            None => manifest.objects.iter().filter(|o| o.kind != KIND_TRIGGER && o.kind != KIND_SECRET).map(|o| o.name().to_string()).collect(),
        };
        let mut stopped = Vec::new();
        for n in names {
            if self.supervisor.stop(&container_name(broker, &n)).await.map_err(Self::engine_err)? {
                stopped.push(n);
            }
        }
        info!(broker = %broker, stopped = stopped.len(), "api: stop ok");
        Ok(stopped)
    }

    async fn logs(&self, name: &str, follow: bool) -> LmeshResult<StreamHandle<LogChunk>> {
        let broker = self.broker()?;
        let (manifest, _) = self.load(broker)?;
        let component = self.component(broker, &manifest, name)?;
        let container = container_name(broker, component.name());
        let info = self.supervisor.info(&container).await.map_err(Self::engine_err)?;
        if info.status == ContainerStatus::NotFound {
            return Err(LmeshError::NotFound(format!("container {}", container)));
        }
        self.supervisor.logs(&container, follow).await.map_err(Self::engine_err)
    }

    async fn dump(&self) -> LmeshResult<String> {
        let broker = self.broker()?;
        let (manifest, _) = self.load(broker)?;
        manifest.render().map_err(Self::map_err)
    }
}
