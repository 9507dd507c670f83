#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use metrics_exporter_prometheus::PrometheusBuilder;
use regent_catalog::nodehealth::STATUS_KEY;
use regent_catalog::{node_health_controller, node_type, register_types};
use regent_controller::{ControllerOptions, Manager};
use regent_core::{ReadConsistency, Resource, Tenancy};
use regent_registry::Registry;
use regent_service::{
    Context, ListRequest, ResourceClient, ResourceService, StaticAclResolver, StaticTenancyBridge, TenancyBridge,
};
use regent_store::{Backend, MemBackend};
use serde::Serialize;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod seed;

use seed::Seed;

#[derive(Parser, Debug)]
#[command(name = "regentctl", version, about = "Regent in-memory control plane")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output {
    Human,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List registered resource types and their scopes
    Types,
    /// Seed the store and run the controllers until Ctrl-C
    Run {
        /// YAML file with tenancies and resources to write at start-up
        #[arg(long = "seed")]
        seed: Option<PathBuf>,
        /// Workers per controller
        #[arg(long = "workers", env = "REGENT_WORKERS", default_value_t = 4)]
        workers: usize,
        #[arg(long = "base-backoff-ms", env = "REGENT_BASE_BACKOFF_MS", default_value_t = 5)]
        base_backoff_ms: u64,
        #[arg(long = "max-backoff-ms", env = "REGENT_MAX_BACKOFF_MS", default_value_t = 1_000_000)]
        max_backoff_ms: u64,
        /// Start as leader; followers only watch
        #[arg(long = "leader", env = "REGENT_LEADER", action = ArgAction::Set, default_value_t = true)]
        leader: bool,
        /// Exit once every node's health status is current instead of waiting for Ctrl-C
        #[arg(long = "once", action = ArgAction::SetTrue)]
        once: bool,
        /// How long --once waits before giving up
        #[arg(long = "wait-secs", default_value_t = 10)]
        wait_secs: u64,
    },
}

fn init_tracing() {
    let directives = std::env::var("REGENT_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = EnvFilter::from_str(&directives).unwrap_or_else(|e| {
        eprintln!("ignoring REGENT_LOG={directives:?}: {e}");
        EnvFilter::new("info")
    });
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

/// Serve Prometheus metrics when `REGENT_METRICS_ADDR` is set.
fn init_metrics() {
    let Ok(addr) = std::env::var("REGENT_METRICS_ADDR") else { return };
    let sock = match addr.parse::<SocketAddr>() {
        Ok(sock) => sock,
        Err(e) => {
            warn!(addr = %addr, error = %e, "REGENT_METRICS_ADDR is not a socket address; metrics disabled");
            return;
        }
    };
    match PrometheusBuilder::new().with_http_listener(sock).install() {
        Ok(()) => info!(%sock, "serving metrics"),
        Err(e) => warn!(%sock, error = %e, "could not start metrics listener"),
    }
}

fn registry() -> Result<Registry> {
    let mut reg = Registry::new();
    register_types(&mut reg)?;
    Ok(reg)
}

#[derive(Serialize)]
struct TypeRow {
    #[serde(rename = "type")]
    ty: String,
    scope: String,
}

#[derive(Serialize)]
struct NodeRow {
    node: String,
    tenancy: String,
    generation: u64,
    observed_generation: Option<u64>,
    reason: Option<String>,
}

impl NodeRow {
    fn of(node: &Resource) -> Self {
        let status = node.status.get(STATUS_KEY);
        Self {
            node: node.id.name.clone(),
            tenancy: node.id.tenancy.to_string(),
            generation: node.generation,
            observed_generation: status.map(|s| s.observed_generation),
            reason: status.and_then(|s| s.conditions.first()).map(|c| c.reason.clone()),
        }
    }

    fn is_current(&self) -> bool {
        self.observed_generation == Some(self.generation)
    }
}

async fn node_rows(client: &dyn ResourceClient) -> Result<Vec<NodeRow>> {
    let ctx = Context::background().with_consistency(ReadConsistency::Strong);
    let nodes = client.list(&ctx, ListRequest::new(node_type(), Tenancy::wildcard())).await?;
    Ok(nodes.iter().map(NodeRow::of).collect())
}

fn print_nodes(output: Output, rows: &[NodeRow]) -> Result<()> {
    match output {
        Output::Human => {
            for r in rows {
                let observed = r.observed_generation.map_or_else(|| "-".to_string(), |g| g.to_string());
                let reason = r.reason.as_deref().unwrap_or("(pending)");
                println!("{} • {} • gen {} • observed {} • {}", r.tenancy, r.node, r.generation, observed, reason);
            }
        }
        Output::Json => println!("{}", serde_json::to_string_pretty(rows)?),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match cli.command {
        Commands::Types => {
            let reg = registry()?;
            let rows: Vec<TypeRow> =
                reg.types().iter().map(|r| TypeRow { ty: r.ty.to_string(), scope: r.scope.to_string() }).collect();
            match cli.output {
                Output::Human => {
                    for r in &rows {
                        println!("{} • {}", r.ty, r.scope);
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&rows)?),
            }
        }
        Commands::Run { seed, workers, base_backoff_ms, max_backoff_ms, leader, once, wait_secs } => {
            let seed = match seed {
                Some(path) => Seed::load(&path)?,
                None => Seed::default(),
            };
            let tenancy = Arc::new(StaticTenancyBridge::with_default());
            seed.install_tenancies(&tenancy);

            let service = Arc::new(ResourceService::new(
                Arc::new(registry()?),
                Arc::new(MemBackend::new()) as Arc<dyn Backend>,
                Arc::clone(&tenancy) as Arc<dyn TenancyBridge>,
                Arc::new(StaticAclResolver::allow_all()),
            ));
            let client = Arc::clone(&service) as Arc<dyn ResourceClient>;
            seed.apply(&Context::background(), &*client).await?;

            let options = ControllerOptions {
                workers,
                base_backoff: Duration::from_millis(base_backoff_ms),
                max_backoff: Duration::from_millis(max_backoff_ms),
                ..Default::default()
            };
            let mut mgr = Manager::new(Arc::clone(&client));
            mgr.register(node_health_controller().with_options(options))?;
            mgr.set_leader(leader);
            let mgr = Arc::new(mgr);

            let cancel = CancellationToken::new();
            let runner = {
                let mgr = Arc::clone(&mgr);
                let cancel = cancel.clone();
                tokio::spawn(async move { mgr.run(cancel).await })
            };
            info!(workers, leader, "control plane running");

            if once {
                let deadline = tokio::time::Instant::now() + Duration::from_secs(wait_secs);
                loop {
                    let rows = node_rows(&*client).await?;
                    if rows.iter().all(NodeRow::is_current) {
                        break;
                    }
                    if tokio::time::Instant::now() >= deadline {
                        warn!(wait_secs, "node health did not settle in time");
                        break;
                    }
                    tokio::select! {
                        _ = signal::ctrl_c() => break,
                        _ = tokio::time::sleep(Duration::from_millis(50)) => {}
                    }
                }
            } else {
                signal::ctrl_c().await?;
                info!("Ctrl-C received; shutting down");
            }

            cancel.cancel();
            if let Err(e) = runner.await {
                warn!(error = %e, "manager task ended abnormally");
            }
            print_nodes(cli.output, &node_rows(&*client).await?)?;
        }
    }
    Ok(())
}
