use std::path::PathBuf;
use std::str::FromStr;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use lmesh_api::{
    extend_spec, BrokerDescription, Config, CreateRequest, Created, InProcApi, LmeshApi, ServiceRequest, StreamHandle, Subscription,
};
use lmesh_core::Map;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "lmeshctl", version, about = "Run an event-driven application on the local container engine")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Broker to operate on (default: LMESH_BROKER)
    #[arg(long = "broker", global = true)]
    broker: Option<String>,

    /// State directory (default: LMESH_HOME or ~/.lmesh)
    #[arg(long = "home", global = true)]
    home: Option<PathBuf>,

    /// CRD catalog version to use (default: LMESH_CATALOG_VERSION or latest)
    #[arg(long = "catalog-version", global = true)]
    catalog_version: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// List component kinds of the catalog
    Kinds,
    /// List brokers with local state
    Brokers,
    /// Create a component and start it
    #[command(subcommand)]
    Create(Create),
    /// Delete a component, a trigger, or the whole broker
    Delete { name: String },
    /// Show components, container status and triggers
    Describe,
    /// Start one component, or all of them
    Start {
        name: Option<String>,
        /// Recreate containers that are already running
        #[arg(long = "restart", action = ArgAction::SetTrue)]
        restart: bool,
    },
    /// Stop one component, or all of them
    Stop { name: Option<String> },
    /// Print container output; all components when no name is given
    Logs {
        name: Option<String>,
        #[arg(short = 'f', long = "follow", action = ArgAction::SetTrue)]
        follow: bool,
    },
    /// Print the broker manifest
    Dump,
}

#[derive(Subcommand, Debug)]
enum Create {
    /// Create the broker selected with --broker
    Broker,
    /// Create an event source, e.g. `create source PingSource schedule='@hourly'`
    Source {
        kind: String,
        #[command(flatten)]
        common: CommonArgs,
    },
    /// Create an event target
    Target {
        kind: String,
        #[command(flatten)]
        common: CommonArgs,
        #[command(flatten)]
        subscribe: SubscribeArgs,
    },
    /// Create a transformation
    Transformation {
        #[command(flatten)]
        common: CommonArgs,
        #[command(flatten)]
        subscribe: SubscribeArgs,
    },
    /// Wire a container image into the broker
    Service {
        name: String,
        #[arg(long = "image")]
        image: String,
        /// KEY=VALUE environment entries
        #[arg(long = "env")]
        env: Vec<String>,
        /// Entrypoint override
        #[arg(long = "command", num_args = 1.., allow_hyphen_values = true)]
        command: Option<Vec<String>>,
        /// Event types the service replies with
        #[arg(long = "event-types", value_delimiter = ',')]
        event_types: Vec<String>,
        #[command(flatten)]
        subscribe: SubscribeArgs,
    },
    /// Route events to a running consumer
    Trigger {
        #[arg(long = "target")]
        target: String,
        #[arg(long = "name")]
        name: Option<String>,
        #[command(flatten)]
        subscribe: SubscribeArgs,
    },
}

#[derive(Args, Debug)]
struct CommonArgs {
    #[arg(long = "name")]
    name: Option<String>,
    /// YAML file holding the component spec; key=value pairs are applied on top
    #[arg(long = "spec-file")]
    spec_file: Option<PathBuf>,
    /// Override the event types the component produces
    #[arg(long = "event-types", value_delimiter = ',')]
    event_types: Vec<String>,
    /// Spec properties as path=value, e.g. auth.credentials.key=abc
    properties: Vec<String>,
}

#[derive(Args, Debug)]
struct SubscribeArgs {
    /// Receive everything these components produce
    #[arg(long = "source")]
    sources: Vec<String>,
    /// Receive events of these types
    #[arg(long = "event-type")]
    event_type: Vec<String>,
}

impl From<SubscribeArgs> for Subscription {
    fn from(a: SubscribeArgs) -> Self { Subscription { sources: a.sources, event_types: a.event_type } }
}

fn init_tracing() {
    let env = std::env::var("LMESH_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("LMESH_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid LMESH_METRICS_ADDR; expected host:port");
        }
    }
}

fn config(cli: &Cli) -> Config {
    let mut config = Config::from_env();
    if let Some(home) = cli.home.clone() { config.home = home; }
    if let Some(broker) = cli.broker.clone() { config.broker = Some(broker); }
    if let Some(version) = cli.catalog_version.clone() { config.catalog_version = version; }
    config
}

fn load_spec(common: &CommonArgs) -> Result<Map> {
    let mut spec = match common.spec_file.as_ref() {
        Some(path) => {
            let raw = std::fs::read_to_string(path).with_context(|| format!("reading spec file {}", path.display()))?;
            serde_yaml::from_str::<Map>(&raw).with_context(|| format!("parsing spec file {}", path.display()))?
        }
        None => Map::new(),
    };
    extend_spec(&mut spec, &common.properties)?;
    Ok(spec)
}

fn request(kind: String, common: CommonArgs, subscribe: Option<SubscribeArgs>) -> Result<CreateRequest> {
    let spec = load_spec(&common)?;
    Ok(CreateRequest {
        kind,
        name: common.name,
        spec,
        event_types: common.event_types,
        subscribe: subscribe.map(Subscription::from).unwrap_or_default(),
    })
}

/// Token cancelled on Ctrl-C so pulls and readiness waits stop early.
fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            info!("Ctrl-C received; cancelling");
            token.cancel();
        }
    });
    cancel
}

fn print<T: serde::Serialize>(output: Output, value: &T, human: impl FnOnce(&T)) -> Result<()> {
    match output {
        Output::Human => human(value),
        Output::Json => println!("{}", serde_json::to_string_pretty(value)?),
    }
    Ok(())
}

fn print_created(output: Output, created: &Created) -> Result<()> {
    print(output, created, |c| {
        println!("{} {} running on port {}", c.kind, c.name, c.container.host_port);
        if let Some(secret) = c.secret.as_deref() { println!("secret {} created", secret); }
        if let Some(trigger) = c.trigger.as_deref() { println!("trigger {} created", trigger); }
    })
}

fn print_description(d: &BrokerDescription) {
    println!("broker {}", d.broker);
    for c in d.components.iter() {
        let port = c.host_port.map(|p| p.to_string()).unwrap_or_else(|| "-".into());
        let produces = if c.produces.is_empty() { String::new() } else { format!(" produces={}", c.produces.join(",")) };
        println!("  {} • {} • {} • port {}{}", c.name, c.kind, c.status, port, produces);
    }
    for t in d.triggers.iter() {
        println!("  trigger {} → {} ({} filters) {}", t.name, t.target, t.filters.len(), t.url);
    }
}

/// Print every stream until all end or Ctrl-C arrives, then cancel them.
async fn follow_logs(streams: Vec<(String, StreamHandle<lmesh_api::LogChunk>)>, prefix: bool) {
    let mut cancels = Vec::new();
    let mut printers = Vec::new();
    for (name, handle) in streams {
        let StreamHandle { mut rx, cancel } = handle;
        cancels.push(cancel);
        printers.push(tokio::spawn(async move {
            while let Some(chunk) = rx.recv().await {
                if prefix { println!("[{}] {}", name, chunk.line); } else { println!("{}", chunk.line); }
            }
        }));
    }
    tokio::select! {
        _ = futures::future::join_all(printers.iter_mut()) => {}
        _ = signal::ctrl_c() => info!("Ctrl-C received; stopping log streams"),
    }
    for c in cancels { c.cancel(); }
    for p in printers { p.abort(); }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let output = cli.output;
    let config = config(&cli);
    let t0 = Instant::now();
    let api = InProcApi::connect(config)?;

    match cli.command {
        Commands::Kinds => {
            let kinds = api.kinds().await?;
            print(output, &kinds, |ks| {
                for k in ks.iter() { println!("{} • {} • {}", k.category, k.kind, k.api_version); }
            })?;
        }
        Commands::Brokers => {
            let brokers = api.brokers().await?;
            let current = api.config().broker.clone();
            print(output, &brokers, |bs| {
                for b in bs.iter() {
                    let mark = if current.as_deref() == Some(b.as_str()) { "*" } else { " " };
                    println!("{} {}", mark, b);
                }
            })?;
        }
        Commands::Create(create) => {
            let cancel = cancel_on_ctrl_c();
            match create {
                Create::Broker => {
                    let handle = api.create_broker(&cancel).await?;
                    print(output, &handle, |h| println!("broker {} running on port {}", h.name, h.host_port))?;
                }
                Create::Source { kind, common } => {
                    let created = api.create_source(request(kind, common, None)?, &cancel).await?;
                    print_created(output, &created)?;
                }
                Create::Target { kind, common, subscribe } => {
                    let created = api.create_target(request(kind, common, Some(subscribe))?, &cancel).await?;
                    print_created(output, &created)?;
                }
                Create::Transformation { common, subscribe } => {
                    let created = api.create_transformation(request("Transformation".into(), common, Some(subscribe))?, &cancel).await?;
                    print_created(output, &created)?;
                }
                Create::Service { name, image, env, command, event_types, subscribe } => {
                    let mut vars = Map::new();
                    extend_spec(&mut vars, &env)?;
                    let req = ServiceRequest { name, image, env: vars, command, event_types, subscribe: subscribe.into() };
                    let created = api.create_service(req, &cancel).await?;
                    print_created(output, &created)?;
                }
                Create::Trigger { target, name, subscribe } => {
                    let trigger = api.create_trigger(name, &target, subscribe.into()).await?;
                    print(output, &trigger, |t| println!("trigger {} → {} ({})", t.name, t.target, t.url))?;
                }
            }
        }
        Commands::Delete { name } => {
            let removed = api.delete(&name).await?;
            print(output, &removed, |r| {
                for n in r.iter() { println!("deleted {}", n); }
            })?;
        }
        Commands::Describe => {
            let d = api.describe().await?;
            print(output, &d, print_description)?;
        }
        Commands::Start { name, restart } => {
            let cancel = cancel_on_ctrl_c();
            let handles = api.start(name.as_deref(), restart, &cancel).await?;
            print(output, &handles, |hs| {
                for h in hs.iter() {
                    let state = if h.created { "started" } else { "already running" };
                    println!("{} {} on port {}", h.name, state, h.host_port);
                }
            })?;
        }
        Commands::Stop { name } => {
            let stopped = api.stop(name.as_deref()).await?;
            print(output, &stopped, |s| {
                for n in s.iter() { println!("stopped {}", n); }
            })?;
        }
        Commands::Logs { name, follow } => {
            let names = match name {
                Some(n) => vec![n],
                None => api.describe().await?.components.into_iter().filter(|c| c.host_port.is_some()).map(|c| c.name).collect(),
            };
            let prefix = names.len() > 1;
            let mut streams = Vec::new();
            for n in names {
                match api.logs(&n, follow).await {
                    Ok(h) => streams.push((n, h)),
                    Err(e) => warn!(component = %n, error = %e, "logs unavailable"),
                }
            }
            follow_logs(streams, prefix).await;
        }
        Commands::Dump => {
            print!("{}", api.dump().await?);
        }
    }
    info!(took_ms = %t0.elapsed().as_millis(), "done");
    Ok(())
}
