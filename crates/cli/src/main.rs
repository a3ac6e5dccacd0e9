use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use defrev_controller::{
    run_controller, ControllerConfig, ConvertedWorkloadMaterializer, HashRevisionGenerator, Reconciler, RevisionCollector,
};
use defrev_core::{ComponentDefinition, DefinitionRevision, EventRecorder, ObjectKey, ResourceClient};
use defrev_kubehub::{get_kube_client, watch_definitions, KubeClient, KubeDiscovery, KubeRecorder};
use defrev_schema::ConfigMapSchemaStore;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const CONTROLLER_NAME: &str = "defrev-controller";
const DEFAULT_NAMESPACE: &str = "vela-system";

#[derive(Parser, Debug)]
#[command(name = "defrevctl", version, about = "ComponentDefinition revision controller")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Namespace of the definitions (run: all namespaces when unset)
    #[arg(long = "ns", global = true, env = "DEFREV_NAMESPACE")]
    namespace: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json, Yaml }

#[derive(Args, Debug)]
struct RunArgs {
    /// Revisions kept per definition (0 keeps all)
    #[arg(long = "revision-limit", env = "DEFREV_REVISION_LIMIT")]
    revision_limit: Option<usize>,
    /// Parallel reconcile workers
    #[arg(long = "concurrent-reconciles", env = "DEFREV_CONCURRENT_RECONCILES")]
    concurrent_reconciles: Option<usize>,
    /// Seconds between full resyncs
    #[arg(long = "resync-secs", env = "DEFREV_RESYNC_SECS")]
    resync_secs: Option<u64>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Watch ComponentDefinitions and reconcile them until interrupted
    Run(RunArgs),
    /// Run a single reconcile pass for one definition
    Reconcile { name: String },
    /// List the revisions of a definition, oldest first
    Revisions { name: String },
    /// Prune the oldest revisions of a definition
    Gc {
        name: String,
        #[arg(long = "limit")]
        limit: Option<usize>,
    },
}

fn init_tracing() {
    let env = std::env::var("DEFREV_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("DEFREV_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid DEFREV_METRICS_ADDR; expected host:port");
        }
    }
}

fn config_from(args: &RunArgs, namespace: Option<String>) -> ControllerConfig {
    let mut cfg = ControllerConfig::from_env();
    if let Some(v) = args.revision_limit { cfg.def_revision_limit = v; }
    if let Some(v) = args.concurrent_reconciles { cfg.concurrent_reconciles = v.max(1); }
    if let Some(v) = args.resync_secs { cfg.resync = Duration::from_secs(v); }
    cfg.namespace = namespace;
    cfg
}

/// Everything a reconciler needs, wired against the live cluster.
struct Wiring {
    kube: kube::Client,
    client: Arc<dyn ResourceClient>,
    recorder: Arc<dyn EventRecorder>,
    reconciler: Arc<Reconciler>,
}

async fn wire(cfg: &ControllerConfig) -> Result<Wiring> {
    let kube = get_kube_client().await?;
    let client: Arc<dyn ResourceClient> = Arc::new(KubeClient::new(kube.clone()));
    let discovery = Arc::new(KubeDiscovery::new(kube.clone()));
    let recorder: Arc<dyn EventRecorder> = Arc::new(KubeRecorder::new(kube.clone(), CONTROLLER_NAME));
    let reconciler = Reconciler::new(
        client.clone(),
        Arc::new(HashRevisionGenerator::new(client.clone())),
        discovery.clone(),
        Arc::new(ConvertedWorkloadMaterializer::new(client.clone(), discovery)),
        Arc::new(ConfigMapSchemaStore::new(client.clone())),
        recorder.clone(),
        cfg,
    );
    Ok(Wiring { kube, client, recorder, reconciler: Arc::new(reconciler) })
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RevisionRow {
    name: String,
    revision: i64,
    revision_hash: String,
    published: bool,
    created: Option<String>,
}

fn print<T: Serialize>(output: Output, rows: &T, human: impl FnOnce()) -> Result<()> {
    match output {
        Output::Human => human(),
        Output::Json => println!("{}", serde_json::to_string_pretty(rows)?),
        Output::Yaml => print!("{}", serde_yaml::to_string(rows)?),
    }
    Ok(())
}

async fn revisions(client: &Arc<dyn ResourceClient>, key: &ObjectKey) -> Result<(ComponentDefinition, Vec<DefinitionRevision>)> {
    let def = client.get_obj::<ComponentDefinition>(key).await.with_context(|| format!("fetching definition {}", key))?;
    let mut revs = client
        .list_obj::<DefinitionRevision>(Some(def.namespace()), &def.revision_selector())
        .await
        .with_context(|| format!("listing revisions of {}", key))?;
    revs.sort_by_key(DefinitionRevision::revision);
    Ok((def, revs))
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let namespace = cli.namespace.clone().unwrap_or_else(|| DEFAULT_NAMESPACE.to_string());

    match cli.command {
        Commands::Run(args) => {
            let cfg = config_from(&args, cli.namespace.clone());
            let wiring = wire(&cfg).await?;
            let token = CancellationToken::new();
            let (tx, rx) = mpsc::channel(1024);

            let watch_kube = wiring.kube.clone();
            let watch_ns = cfg.namespace.clone();
            let watcher = tokio::spawn(async move { watch_definitions(watch_kube, watch_ns.as_deref(), tx).await });

            let stop = token.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("interrupt received");
                }
                stop.cancel();
            });

            run_controller(wiring.reconciler, wiring.client, cfg, rx, token).await?;
            watcher.abort();
        }
        Commands::Reconcile { name } => {
            let cfg = ControllerConfig::from_env();
            let wiring = wire(&cfg).await?;
            let key = ObjectKey::namespaced(namespace, name);
            match wiring.reconciler.reconcile(&key).await {
                Ok(_) => {
                    let def = wiring.client.get_obj_opt::<ComponentDefinition>(&key).await?;
                    let latest = def.and_then(|d| d.status.latest_revision);
                    print(cli.output, &latest, || match &latest {
                        Some(r) => println!("{} reconciled • latest {} (#{}, {})", key, r.name, r.revision, r.revision_hash),
                        None => println!("{} reconciled • no revision published", key),
                    })?;
                }
                Err(e) => {
                    error!(definition = %key, error = %e, "reconcile failed");
                    return Err(e.into());
                }
            }
        }
        Commands::Revisions { name } => {
            let kube = get_kube_client().await?;
            let client: Arc<dyn ResourceClient> = Arc::new(KubeClient::new(kube));
            let key = ObjectKey::namespaced(namespace, name);
            let (def, revs) = revisions(&client, &key).await?;
            let rows: Vec<RevisionRow> = revs
                .iter()
                .map(|r| RevisionRow {
                    name: r.name().to_string(),
                    revision: r.revision(),
                    revision_hash: r.spec.revision_hash.clone(),
                    published: r.is_published_on(&def),
                    created: r.metadata.creation_timestamp.as_ref().map(|t| t.0.to_rfc3339()),
                })
                .collect();
            print(cli.output, &rows, || {
                for row in &rows {
                    let mark = if row.published { "*" } else { " " };
                    println!("{} {} • #{} • {} • {}", mark, row.name, row.revision, row.revision_hash, row.created.as_deref().unwrap_or("-"));
                }
            })?;
        }
        Commands::Gc { name, limit } => {
            let cfg = ControllerConfig::from_env();
            let wiring = wire(&cfg).await?;
            let key = ObjectKey::namespaced(namespace, name);
            let def = wiring.client.get_obj::<ComponentDefinition>(&key).await.with_context(|| format!("fetching definition {}", key))?;
            let collector = RevisionCollector::new(wiring.client.clone(), wiring.recorder.clone());
            let report = collector.collect(&def, limit.unwrap_or(cfg.def_revision_limit)).await?;
            print(cli.output, &serde_json::json!({ "deleted": report.deleted, "failed": report.failed }), || {
                for n in &report.deleted { println!("deleted {}", n); }
                for n in &report.failed { println!("failed  {}", n); }
                if report.deleted.is_empty() && report.failed.is_empty() { println!("{} • nothing to collect", key); }
            })?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use defrev_controller::WorkQueue;

    #[test]
    fn controller_metrics_reach_the_prometheus_exporter() {
        let handle = metrics_exporter_prometheus::PrometheusBuilder::new().install_recorder().unwrap();
        let queue = WorkQueue::new();
        queue.add(ObjectKey::namespaced(DEFAULT_NAMESPACE, "webservice"));
        assert!(handle.render().contains("queue_depth 1"), "{}", handle.render());
    }
}
