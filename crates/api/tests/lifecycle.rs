#![forbid(unsafe_code)]

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use lmesh_api::{container_name, Config, ContainerStatus, CreateRequest, Filter, InProcApi, LmeshApi, LmeshError, ServiceRequest, Subscription};
use lmesh_core::{map, Map, Value, KIND_SECRET, KIND_TRIGGER};
use lmesh_manifest::Manifest;
use lmesh_ops::memory::MemoryEngine;
use lmesh_ops::{host_gateway, ReadyOptions};
use lmesh_routing::RoutingConfig;
use lmesh_schema::Catalog;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

const BUNDLE: &str = r#"
apiVersion: apiextensions.k8s.io/v1
kind: CustomResourceDefinition
metadata:
  name: pingsources.sources.lmesh.io
spec:
  group: sources.lmesh.io
  names: { kind: PingSource }
  versions:
  - name: v1alpha1
    served: true
    storage: true
    schema:
      openAPIV3Schema:
        properties:
          spec:
            type: object
            required: [schedule]
            properties:
              schedule: { type: string }
              data: { type: string }
---
apiVersion: apiextensions.k8s.io/v1
kind: CustomResourceDefinition
metadata:
  name: awssqssources.sources.lmesh.io
spec:
  group: sources.lmesh.io
  names: { kind: AWSSQSSource }
  versions:
  - name: v1alpha1
    served: true
    storage: true
    schema:
      openAPIV3Schema:
        properties:
          spec:
            type: object
            properties:
              arn: { type: string }
              auth:
                type: object
                properties:
                  credentials:
                    type: object
                    properties:
                      secretAccessKey:
                        type: object
                        properties:
                          value: { type: string }
                          valueFromSecret:
                            type: object
                            properties:
                              name: { type: string }
                              key: { type: string }
---
apiVersion: apiextensions.k8s.io/v1
kind: CustomResourceDefinition
metadata:
  name: httptargets.targets.lmesh.io
spec:
  group: targets.lmesh.io
  names: { kind: HTTPTarget }
  versions:
  - name: v1alpha1
    served: true
    storage: true
    schema:
      openAPIV3Schema:
        properties:
          spec:
            type: object
            properties:
              endpoint: { type: string }
"#;

struct Fixture {
    _home: TempDir,
    config: Config,
    engine: Arc<MemoryEngine>,
    api: InProcApi,
}

fn fixture() -> Fixture {
    let home = tempfile::tempdir().unwrap();
    let config = Config::with_home(home.path()).with_broker("demo");
    let bundle = Catalog::bundle_path(&config.crds_dir(), &config.catalog_version);
    std::fs::create_dir_all(bundle.parent().unwrap()).unwrap();
    std::fs::write(&bundle, BUNDLE).unwrap();
    let catalog = Catalog::open(&config.crds_dir(), &config.catalog_version).unwrap();
    let engine = Arc::new(MemoryEngine::new());
    let api = InProcApi::new(config.clone(), Arc::new(catalog), engine.clone()).with_ready_options(ready());
    Fixture { _home: home, config, engine, api }
}

fn ready() -> ReadyOptions {
    ReadyOptions { poll: Duration::from_millis(10), timeout: Duration::from_millis(500) }
}

/// A second API over the same home and engine, selecting another broker.
fn api_for(f: &Fixture, broker: &str) -> InProcApi {
    let config = Config::with_home(f.config.home.clone()).with_broker(broker);
    let catalog = Catalog::open(&config.crds_dir(), &config.catalog_version).unwrap();
    InProcApi::new(config, Arc::new(catalog), f.engine.clone()).with_ready_options(ready())
}

fn spec(v: Value) -> Map {
    match v { Value::Map(m) => m, _ => Map::new() }
}

fn url(port: u16) -> String { format!("http://{}:{}", host_gateway(), port) }

fn ctr(component: &str) -> String { container_name("demo", component) }

fn ping() -> CreateRequest {
    CreateRequest { kind: "PingSource".into(), spec: spec(map! { "schedule" => "@hourly" }), ..Default::default() }
}

fn web(sources: &[&str]) -> CreateRequest {
    CreateRequest {
        kind: "HTTPTarget".into(),
        spec: spec(map! { "endpoint" => "http://example.com" }),
        subscribe: Subscription { sources: sources.iter().map(|s| s.to_string()).collect(), event_types: Vec::new() },
        ..Default::default()
    }
}

#[tokio::test]
async fn create_wire_describe_delete() {
    let f = fixture();
    let cancel = CancellationToken::new();

    let broker = f.api.create_broker(&cancel).await.unwrap();
    assert!(broker.created);
    assert!(f.config.routing_path("demo").is_file());

    let source = f.api.create_source(ping(), &cancel).await.unwrap();
    assert_eq!(source.name, "demo-pingsource");
    let params = f.engine.params(&ctr("demo-pingsource")).unwrap();
    assert_eq!(params.env_value("SCHEDULE"), Some("@hourly"));
    assert_eq!(params.env_value("K_SINK"), Some(url(broker.host_port).as_str()));
    assert_eq!(params.image, "ghcr.io/lmesh/pingsource-adapter:latest");

    let target = f.api.create_target(web(&["demo-pingsource"]), &cancel).await.unwrap();
    assert_eq!(target.trigger.as_deref(), Some("demo-httptarget-trigger"));

    let routing = RoutingConfig::load(f.config.routing_path("demo")).unwrap();
    let trigger = routing.lookup("demo-httptarget-trigger").unwrap();
    assert_eq!(trigger.target.component, "demo-httptarget");
    assert_eq!(trigger.target.url, url(target.container.host_port));
    assert_eq!(trigger.filters, vec![Filter::exact("type", "dev.lmesh.sources.ping")]);

    // The broker sees the rewritten file through its directory mount
    let broker_params = f.engine.params("demo").unwrap();
    let (host_dir, mounted_dir) = broker_params.volumes[0].split_once(':').unwrap();
    assert!(Path::new(host_dir).is_dir());
    let inside = broker_params.env_value("BROKER_CONFIG_PATH").unwrap();
    let relative = Path::new(inside).strip_prefix(mounted_dir).unwrap();
    let seen = RoutingConfig::load(Path::new(host_dir).join(relative)).unwrap();
    assert!(seen.lookup("demo-httptarget-trigger").is_some());

    let manifest = Manifest::open(f.config.manifest_path("demo")).unwrap();
    assert!(manifest.get("demo-httptarget-trigger", KIND_TRIGGER).is_some());

    let d = f.api.describe().await.unwrap();
    let names: Vec<&str> = d.components.iter().map(|c| c.name.as_str()).collect();
    assert_eq!(names, vec!["demo", "demo-pingsource", "demo-httptarget"]);
    assert!(d.components.iter().all(|c| c.status == ContainerStatus::Running));
    assert_eq!(d.components[1].produces, vec!["dev.lmesh.sources.ping".to_string()]);
    assert_eq!(d.triggers.len(), 1);

    let removed = f.api.delete("demo-httptarget").await.unwrap();
    assert_eq!(removed, vec!["demo-httptarget-trigger".to_string(), "demo-httptarget".to_string()]);
    assert!(RoutingConfig::load(f.config.routing_path("demo")).unwrap().is_empty());
    let manifest = Manifest::open(f.config.manifest_path("demo")).unwrap();
    assert!(manifest.get_by_name("demo-httptarget").is_none());
    assert!(manifest.find_by_kind(KIND_TRIGGER).next().is_none());
    assert!(!f.engine.names().contains(&ctr("demo-httptarget")));
}

#[tokio::test]
async fn secrets_reach_the_container_and_leave_with_their_owner() {
    let f = fixture();
    let cancel = CancellationToken::new();
    f.api.create_broker(&cancel).await.unwrap();

    let req = CreateRequest {
        kind: "AWSSQSSource".into(),
        name: Some("queue".into()),
        spec: spec(map! { "arn" => "arn:aws:sqs:eu-1:1:q", "auth" => map! { "credentials" => map! { "secretAccessKey" => "foo" } } }),
        ..Default::default()
    };
    let created = f.api.create_source(req, &cancel).await.unwrap();
    assert_eq!(created.secret.as_deref(), Some("queue-secret"));
    let params = f.engine.params(&ctr("queue")).unwrap();
    assert_eq!(params.env_value("SECRET_ACCESS_KEY"), Some("foo"));

    let raw = std::fs::read_to_string(f.config.manifest_path("demo")).unwrap();
    assert!(!raw.contains("foo\n"), "plaintext secret in manifest:\n{}", raw);

    let removed = f.api.delete("queue").await.unwrap();
    assert!(removed.contains(&"queue-secret".to_string()));
    let manifest = Manifest::open(f.config.manifest_path("demo")).unwrap();
    assert!(manifest.find_by_kind(KIND_SECRET).next().is_none());
    assert!(matches!(f.api.delete("queue").await, Err(LmeshError::NotFound(_))));
}

#[tokio::test]
async fn invalid_input_is_rejected_before_anything_is_written() {
    let f = fixture();
    let cancel = CancellationToken::new();
    assert!(matches!(f.api.create_source(ping(), &cancel).await, Err(LmeshError::NotFound(_))));

    f.api.create_broker(&cancel).await.unwrap();
    let before = std::fs::read_to_string(f.config.manifest_path("demo")).unwrap();

    let bad = CreateRequest { kind: "HTTPTarget".into(), spec: spec(map! { "nonexistentKey" => "v" }), ..Default::default() };
    match f.api.create_target(bad, &cancel).await {
        Err(LmeshError::Validation(msg)) => assert!(msg.contains("nonexistentKey"), "{}", msg),
        other => panic!("expected validation error, got {:?}", other),
    }
    let wrong_role = CreateRequest { kind: "HTTPTarget".into(), ..Default::default() };
    assert!(matches!(f.api.create_source(wrong_role, &cancel).await, Err(LmeshError::Validation(_))));
    let unknown = CreateRequest { kind: "NoSuchKind".into(), ..Default::default() };
    assert!(matches!(f.api.create_target(unknown, &cancel).await, Err(LmeshError::Validation(_))));
    let bad_name = CreateRequest { name: Some("Bad_Name".into()), ..ping() };
    assert!(matches!(f.api.create_source(bad_name, &cancel).await, Err(LmeshError::Validation(_))));
    assert!(matches!(f.api.create_target(web(&["missing"]), &cancel).await, Err(LmeshError::NotFound(_))));

    assert_eq!(std::fs::read_to_string(f.config.manifest_path("demo")).unwrap(), before);
    assert_eq!(f.engine.names(), vec!["demo".to_string()]);
}

#[tokio::test]
async fn start_all_reuses_running_containers_and_retargets_triggers() {
    let f = fixture();
    let cancel = CancellationToken::new();
    f.api.create_broker(&cancel).await.unwrap();
    f.api.create_source(ping(), &cancel).await.unwrap();
    f.api.create_target(web(&["demo-pingsource"]), &cancel).await.unwrap();
    assert_eq!(f.engine.creates(), 3);

    let handles = f.api.start(None, false, &cancel).await.unwrap();
    assert_eq!(handles.len(), 3);
    assert!(handles.iter().all(|h| !h.created));
    assert_eq!(f.engine.creates(), 3);

    f.engine.set_status(&ctr("demo-pingsource"), ContainerStatus::Exited);
    f.api.start(None, false, &cancel).await.unwrap();
    assert_eq!(f.engine.creates(), 4);

    let handles = f.api.start(None, true, &cancel).await.unwrap();
    assert!(handles.iter().all(|h| h.created));
    assert_eq!(f.engine.creates(), 7);
    let target = handles.iter().find(|h| h.name == "demo-httptarget").unwrap();
    let routing = RoutingConfig::load(f.config.routing_path("demo")).unwrap();
    assert_eq!(routing.lookup("demo-httptarget-trigger").unwrap().target.url, url(target.host_port));
    let broker = handles.iter().find(|h| h.name == "demo").unwrap();
    assert_eq!(f.engine.params(&ctr("demo-pingsource")).unwrap().env_value("K_SINK"), Some(url(broker.host_port).as_str()));
}

#[tokio::test]
async fn stop_logs_and_triggers_need_running_containers() {
    let f = fixture();
    let cancel = CancellationToken::new();
    f.api.create_broker(&cancel).await.unwrap();
    f.api.create_source(ping(), &cancel).await.unwrap();
    f.api.create_target(web(&[]), &cancel).await.unwrap();

    f.engine.push_log(&ctr("demo-pingsource"), "tick");
    let mut logs = f.api.logs("demo-pingsource", false).await.unwrap();
    let mut lines = Vec::new();
    while let Some(c) = logs.rx.recv().await { lines.push(c.line); }
    assert_eq!(lines, vec!["tick".to_string()]);

    assert_eq!(f.api.stop(Some("demo-httptarget")).await.unwrap(), vec!["demo-httptarget".to_string()]);
    let sub = Subscription { sources: vec!["demo-pingsource".into()], event_types: Vec::new() };
    assert!(matches!(f.api.create_trigger(None, "demo-httptarget", sub.clone()).await, Err(LmeshError::Conflict(_))));
    assert!(matches!(f.api.create_trigger(None, "demo-pingsource", sub.clone()).await, Err(LmeshError::Validation(_))));

    f.api.start(Some("demo-httptarget"), false, &cancel).await.unwrap();
    let t = f.api.create_trigger(Some("all-pings".into()), "demo-httptarget", sub).await.unwrap();
    assert_eq!(t.target, "demo-httptarget");
    assert_eq!(t.filters, vec![Filter::exact("type", "dev.lmesh.sources.ping")]);
    assert!(f.api.dump().await.unwrap().contains("name: all-pings"));

    let stopped = f.api.stop(None).await.unwrap();
    assert_eq!(stopped.len(), 3);
    assert!(f.engine.names().is_empty());
    let d = f.api.describe().await.unwrap();
    assert!(d.components.iter().all(|c| c.status == ContainerStatus::NotFound && c.host_port.is_none()));
    assert!(matches!(f.api.logs("demo-pingsource", false).await, Err(LmeshError::NotFound(_))));
}

#[tokio::test]
async fn services_and_broker_removal() {
    let f = fixture();
    let cancel = CancellationToken::new();
    f.api.create_broker(&cancel).await.unwrap();
    f.api.create_source(ping(), &cancel).await.unwrap();

    let req = ServiceRequest {
        name: "echo".into(),
        image: "docker.io/library/echo:1".into(),
        env: spec(map! { "MODE" => "loud" }),
        event_types: vec!["io.echo.reply".into()],
        subscribe: Subscription { sources: Vec::new(), event_types: vec!["dev.lmesh.sources.ping".into()] },
        ..Default::default()
    };
    let created = f.api.create_service(req, &cancel).await.unwrap();
    assert_eq!(created.kind, "Service");
    let params = f.engine.params(&ctr("echo")).unwrap();
    assert_eq!(params.image, "docker.io/library/echo:1");
    assert_eq!(params.env_value("MODE"), Some("loud"));
    assert!(params.env_value("K_SINK").is_some());

    assert_eq!(f.api.brokers().await.unwrap(), vec!["demo".to_string()]);
    let removed = f.api.delete("demo").await.unwrap();
    assert!(removed.contains(&"echo".to_string()));
    assert!(f.engine.names().is_empty());
    assert!(!f.config.broker_dir("demo").exists());
    assert!(f.api.brokers().await.unwrap().is_empty());
    assert!(matches!(f.api.describe().await, Err(LmeshError::NotFound(_))));
}

#[tokio::test]
async fn recreating_with_a_changed_spec_replaces_the_container() {
    let f = fixture();
    let cancel = CancellationToken::new();
    f.api.create_broker(&cancel).await.unwrap();
    f.api.create_source(ping(), &cancel).await.unwrap();
    f.api.create_target(web(&["demo-pingsource"]), &cancel).await.unwrap();
    let sub = Subscription { sources: Vec::new(), event_types: vec!["dev.lmesh.sources.ping".into()] };
    f.api.create_trigger(Some("extra".into()), "demo-httptarget", sub).await.unwrap();
    assert_eq!(f.engine.creates(), 3);

    let same = f.api.create_source(ping(), &cancel).await.unwrap();
    assert!(!same.container.created);
    assert_eq!(f.engine.creates(), 3);

    let daily = CreateRequest { spec: spec(map! { "schedule" => "@daily" }), ..ping() };
    let again = f.api.create_source(daily, &cancel).await.unwrap();
    assert!(again.container.created);
    assert_eq!(f.engine.creates(), 4);
    let manifest = Manifest::open(f.config.manifest_path("demo")).unwrap();
    let object = manifest.get_by_name("demo-pingsource").unwrap();
    assert_eq!(object.spec.get("schedule").and_then(Value::as_str), Some("@daily"));
    assert_eq!(f.engine.params(&ctr("demo-pingsource")).unwrap().env_value("SCHEDULE"), Some("@daily"));

    let moved = CreateRequest { spec: spec(map! { "endpoint" => "http://example.org" }), ..web(&["demo-pingsource"]) };
    let target = f.api.create_target(moved, &cancel).await.unwrap();
    assert!(target.container.created);
    let routing = RoutingConfig::load(f.config.routing_path("demo")).unwrap();
    for name in ["demo-httptarget-trigger", "extra"] {
        assert_eq!(routing.lookup(name).unwrap().target.url, url(target.container.host_port), "{}", name);
    }
}

#[tokio::test]
async fn producers_need_a_running_broker_before_anything_is_recorded() {
    let f = fixture();
    let cancel = CancellationToken::new();
    f.api.create_broker(&cancel).await.unwrap();
    assert_eq!(f.api.stop(Some("demo")).await.unwrap(), vec!["demo".to_string()]);
    let before = std::fs::read_to_string(f.config.manifest_path("demo")).unwrap();

    assert!(matches!(f.api.create_source(ping(), &cancel).await, Err(LmeshError::Conflict(_))));
    assert_eq!(std::fs::read_to_string(f.config.manifest_path("demo")).unwrap(), before);
    assert!(f.engine.names().is_empty());

    f.api.start(Some("demo"), false, &cancel).await.unwrap();
    assert!(f.api.create_source(ping(), &cancel).await.is_ok());
}

#[tokio::test]
async fn start_all_fails_when_one_component_never_becomes_ready() {
    let f = fixture();
    let cancel = CancellationToken::new();
    f.api.create_broker(&cancel).await.unwrap();
    f.api.create_source(ping(), &cancel).await.unwrap();
    f.api.create_target(web(&["demo-pingsource"]), &cancel).await.unwrap();
    f.api.stop(Some("demo-pingsource")).await.unwrap();
    f.api.stop(Some("demo-httptarget")).await.unwrap();

    f.engine.never_ready(&ctr("demo-httptarget"));
    match f.api.start(None, false, &cancel).await {
        Err(LmeshError::Engine(msg)) => assert!(msg.contains(&ctr("demo-httptarget")), "{}", msg),
        other => panic!("expected engine error, got {:?}", other),
    }
    // The caller's token is untouched; only the fan-out was aborted
    assert!(!cancel.is_cancelled());
}

#[tokio::test]
async fn brokers_keep_their_containers_apart() {
    let f = fixture();
    let other = api_for(&f, "other");
    let cancel = CancellationToken::new();
    f.api.create_broker(&cancel).await.unwrap();
    other.create_broker(&cancel).await.unwrap();
    let ticker = || CreateRequest { name: Some("ticker".into()), ..ping() };
    f.api.create_source(ticker(), &cancel).await.unwrap();
    let theirs = other.create_source(ticker(), &cancel).await.unwrap();
    assert!(theirs.container.created);
    assert_eq!(f.engine.names(), vec!["demo".to_string(), "demo.ticker".to_string(), "other".to_string(), "other.ticker".to_string()]);

    f.api.delete("demo").await.unwrap();
    assert_eq!(f.engine.names(), vec!["other".to_string(), "other.ticker".to_string()]);
    let d = other.describe().await.unwrap();
    assert!(d.components.iter().all(|c| c.status == ContainerStatus::Running), "{:?}", d.components);
}
