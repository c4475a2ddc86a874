use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use meshwire_bridge::{spawn_dispatch, BridgeConfig, DeletePolicy, PredicateRegistry, SelectiveBridge};
use meshwire_core::{DependencyKind, LifecycleEvent, ObjectKey};
use meshwire_index::{apply_event, spawn_indexer, MemoryIndex, VirtualServiceReferences};
use meshwire_kubehub::{list_states, start_watcher, VIRTUAL_NODE_GVK, VIRTUAL_SERVICE_GVK};
use meshwire_queue::WorkQueue;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "meshwirectl", version, about = "Dependency-triggered reconcile enqueueing for App Mesh objects")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Kubernetes namespace (default: all namespaces)
    #[arg(long = "ns", global = true, env = "MESHWIRE_NAMESPACE")]
    namespace: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum DeleteMode { Ignore, EnqueueDependents }

impl From<DeleteMode> for DeletePolicy {
    fn from(m: DeleteMode) -> Self {
        match m {
            DeleteMode::Ignore => DeletePolicy::Ignore,
            DeleteMode::EnqueueDependents => DeletePolicy::EnqueueDependents,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Index VirtualServices and enqueue them when a referenced VirtualNode flips activity
    Run {
        /// Concurrent event handler calls
        #[arg(long, default_value_t = 4, env = "MESHWIRE_CONCURRENCY")]
        concurrency: usize,
        /// Deadline for one index lookup in milliseconds (0 = none)
        #[arg(long = "fetch-timeout-ms", default_value_t = 2000, env = "MESHWIRE_FETCH_TIMEOUT_MS")]
        fetch_timeout_ms: u64,
        /// Emit resync markers every N seconds (0 = off)
        #[arg(long = "resync-secs", default_value_t = 0, env = "MESHWIRE_RESYNC_SECS")]
        resync_secs: u64,
        /// What a VirtualNode deletion does to its dependents
        #[arg(long = "delete-policy", value_enum, default_value_t = DeleteMode::Ignore, env = "MESHWIRE_DELETE_POLICY")]
        delete_policy: DeleteMode,
    },
    /// Print the VirtualServices that reference a dependency
    Refs {
        /// Dependency kind: virtualNode, virtualRouter or virtualGateway
        kind: String,
        /// Dependency identity as ns/name
        target: String,
    },
}

fn init_tracing() {
    let env = std::env::var("MESHWIRE_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("MESHWIRE_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid MESHWIRE_METRICS_ADDR; expected host:port");
        }
    }
}

fn non_zero_secs(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

async fn run(namespace: Option<String>, concurrency: usize, cfg: BridgeConfig, resync: Option<Duration>) -> Result<()> {
    let cancel = CancellationToken::new();
    let index = Arc::new(MemoryIndex::new());
    let queue = Arc::new(WorkQueue::new("virtualservice"));
    let bridge = SelectiveBridge::from_registry(
        &PredicateRegistry::with_defaults(),
        DependencyKind::VirtualNode,
        index.clone(),
        queue.clone(),
    )?
    .with_config(cfg);

    let (vs_tx, vs_rx) = mpsc::channel::<LifecycleEvent>(1024);
    let (vn_tx, vn_rx) = mpsc::channel::<LifecycleEvent>(1024);
    let indexer = spawn_indexer(index.clone(), VirtualServiceReferences, vs_rx);
    let dispatch = spawn_dispatch(Arc::new(bridge), vn_rx, concurrency, cancel.clone());

    let mut watchers = JoinSet::new();
    {
        let (ns, cancel) = (namespace.clone(), cancel.clone());
        watchers.spawn(async move {
            ("virtualservice watcher", start_watcher(VIRTUAL_SERVICE_GVK, ns.as_deref(), None, vs_tx, cancel).await)
        });
    }
    {
        let (ns, cancel) = (namespace.clone(), cancel.clone());
        watchers.spawn(async move {
            ("virtualnode watcher", start_watcher(VIRTUAL_NODE_GVK, ns.as_deref(), resync, vn_tx, cancel).await)
        });
    }

    // Stand-in reconciler: log and mark done.
    let worker = {
        let queue = queue.clone();
        tokio::spawn(async move {
            while let Some(req) = queue.get().await {
                info!(virtual_service = %req.key, "reconcile requested");
                queue.forget(&req);
                queue.done(&req);
            }
        })
    };

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "waiting for ctrl-c failed");
        }
    };
    let early_exit = supervise(watchers, shutdown, &cancel).await;
    let _ = dispatch.await;
    let _ = indexer.await;
    queue.shut_down();
    let _ = worker.await;
    if early_exit {
        anyhow::bail!("a watcher exited before shutdown was requested");
    }
    Ok(())
}

type WatcherResult = (&'static str, Result<()>);

fn report_watcher(joined: Result<WatcherResult, JoinError>) {
    match joined {
        Ok((name, Ok(()))) => info!(watcher = name, "watcher stopped"),
        Ok((name, Err(e))) => error!(watcher = name, error = ?e, "watcher failed"),
        Err(e) => error!(error = %e, "watcher task panicked"),
    }
}

/// Wait for `shutdown` or for any watcher to end, whichever comes first, then cancel
/// everything and collect the remaining watchers. Returns true when a watcher ended first.
async fn supervise(
    mut watchers: JoinSet<WatcherResult>,
    shutdown: impl std::future::Future<Output = ()>,
    cancel: &CancellationToken,
) -> bool {
    let early_exit = tokio::select! {
        _ = shutdown => {
            info!("shutting down");
            false
        }
        Some(joined) = watchers.join_next() => {
            report_watcher(joined);
            error!("watcher exited early; shutting down");
            true
        }
    };
    cancel.cancel();
    while let Some(joined) = watchers.join_next().await {
        report_watcher(joined);
    }
    early_exit
}

async fn refs(namespace: Option<String>, kind: DependencyKind, target: ObjectKey, output: Output) -> Result<()> {
    let index = MemoryIndex::new();
    for state in list_states(VIRTUAL_SERVICE_GVK, namespace.as_deref()).await? {
        apply_event(&index, &VirtualServiceReferences, LifecycleEvent::Created(state));
    }
    let dependents = index.referrers_of(kind, &target);
    match output {
        Output::Human => {
            if dependents.is_empty() {
                println!("no VirtualService references {} {}", kind, target);
            }
            for key in dependents {
                println!("{}", key);
            }
        }
        Output::Json => println!("{}", serde_json::to_string_pretty(&dependents)?),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { concurrency, fetch_timeout_ms, resync_secs, delete_policy } => {
            let cfg = BridgeConfig {
                fetch_timeout: (fetch_timeout_ms > 0).then(|| Duration::from_millis(fetch_timeout_ms)),
                delete_policy: delete_policy.into(),
            };
            info!(ns = ?cli.namespace, concurrency, ?cfg, "run invoked");
            run(cli.namespace, concurrency, cfg, non_zero_secs(resync_secs)).await
        }
        Commands::Refs { kind, target } => {
            let kind: DependencyKind = kind.parse()?;
            let target: ObjectKey = target.parse()?;
            refs(cli.namespace, kind, target, cli.output).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn failed_watcher_cancels_everything_without_shutdown_signal() {
        let cancel = CancellationToken::new();
        let mut watchers = JoinSet::new();
        watchers.spawn(async { ("virtualnode watcher", Err(anyhow::anyhow!("discovery failed"))) });
        {
            let cancel = cancel.clone();
            watchers.spawn(async move {
                cancel.cancelled().await;
                ("virtualservice watcher", Ok(()))
            });
        }
        let never = std::future::pending::<()>();
        let early = tokio::time::timeout(Duration::from_secs(1), supervise(watchers, never, &cancel))
            .await
            .unwrap();
        assert!(early);
        assert!(cancel.is_cancelled());
    }

    #[tokio::test]
    async fn shutdown_signal_cancels_running_watchers() {
        let cancel = CancellationToken::new();
        let mut watchers = JoinSet::new();
        {
            let cancel = cancel.clone();
            watchers.spawn(async move {
                cancel.cancelled().await;
                ("virtualnode watcher", Ok(()))
            });
        }
        let early = supervise(watchers, async {}, &cancel).await;
        assert!(!early);
        assert!(cancel.is_cancelled());
    }
}
