//! errlens server
//!
//! HTTP front end for the error message detection engine. Rules come from a
//! YAML file or a PostgreSQL table and are reloaded whenever the file
//! changes or a PostgreSQL notification arrives.

use anyhow::Result;
use clap::Parser;
use errlens_core::{RuleEventBus, RuleStore};
use errlens_detector::{DetectionEngine, ReloadOutcome};
use errlens_store::{PgRuleListener, PgRuleStore, YamlRuleStore, YamlRuleWatcher};
use metrics_exporter_prometheus::PrometheusHandle;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::{info, warn};

mod config;
mod routes;
mod state;

use config::{ServerConfig, StoreConfig};
use state::AppState;

#[derive(Parser, Debug)]
#[command(name = "errlens-server")]
#[command(about = "errlens error message detection service", long_about = None)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "errlens.yaml")]
    config: String,

    /// YAML rule file (overrides the configured store)
    #[arg(short, long)]
    rules: Option<PathBuf>,

    /// PostgreSQL URL for the rule table
    #[arg(long, env = "ERRLENS_DATABASE_URL")]
    database_url: Option<String>,

    /// Listen address
    #[arg(short = 'l', long)]
    listen: Option<String>,

    /// Listen port
    #[arg(short = 'P', long)]
    port: Option<u16>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_tracing(cli.verbose);

    info!("Starting errlens server");

    let config = ServerConfig::load(&cli.config, &cli)?;
    info!("Configuration loaded successfully");
    info!("Rule store: {}", config.store.describe());

    let metrics_handle = init_metrics()?;

    // Rule store, plus whatever publishes its change notifications
    let bus = RuleEventBus::default();
    let (store, change_source): (Arc<dyn RuleStore>, ChangeSource) = match &config.store {
        StoreConfig::Yaml { path } => {
            let source = match YamlRuleWatcher::spawn(path.clone(), bus.clone()) {
                Ok(watcher) => ChangeSource::File(watcher),
                Err(e) => {
                    warn!("Rule file changes will need a manual reload: {}", e);
                    ChangeSource::None
                }
            };
            (Arc::new(YamlRuleStore::new(path.clone())), source)
        }
        StoreConfig::Postgres(pg) => {
            let store = PgRuleStore::connect_lazy(pg)?;
            let listener =
                PgRuleListener::spawn(store.pool().clone(), pg.notify_channel.clone(), bus.clone())?;
            info!("Listening for rule changes on '{}'", pg.notify_channel);
            (Arc::new(store), ChangeSource::Postgres(listener))
        }
    };

    let engine = Arc::new(DetectionEngine::with_config(store, config.detector.clone()));
    let subscription = engine.subscribe(&bus);

    if config.warm_start {
        match engine.reload().await {
            Ok(ReloadOutcome::Completed(report)) => {
                info!("Warm start loaded {} rules", report.total())
            }
            Ok(ReloadOutcome::Skipped) => {}
            Err(e) => warn!("Warm start failed, rules will load on demand: {}", e),
        }
    }

    let state = AppState::new(engine, metrics_handle);
    let app = routes::create_router(state);

    let addr: SocketAddr = config.bind_address().parse()?;
    let tcp = tokio::net::TcpListener::bind(addr).await?;
    info!("errlens listening on http://{}", addr);

    let shutdown = async {
        shutdown_signal().await;
        warn!("Shutdown signal received, stopping server...");
    };

    axum::serve(tcp, app).with_graceful_shutdown(shutdown).await?;

    subscription.shutdown();
    change_source.shutdown();

    info!("Server shutdown complete");
    Ok(())
}

/// Publisher of rule-change events for the configured store
enum ChangeSource {
    File(YamlRuleWatcher),
    Postgres(PgRuleListener),
    None,
}

impl ChangeSource {
    fn shutdown(self) {
        match self {
            ChangeSource::File(watcher) => watcher.shutdown(),
            ChangeSource::Postgres(listener) => listener.shutdown(),
            ChangeSource::None => {}
        }
    }
}

/// Listen for shutdown signals (SIGTERM, SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// Initialize tracing/logging
fn init_tracing(verbose: bool) {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = if verbose {
        EnvFilter::new("errlens=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("errlens=info"))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Initialize metrics exporter and return handle for rendering
fn init_metrics() -> Result<PrometheusHandle> {
    use metrics_exporter_prometheus::PrometheusBuilder;

    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| anyhow::anyhow!("Failed to install metrics: {}", e))?;

    metrics::describe_counter!(
        "errlens_requests_total",
        "Total number of HTTP requests by route"
    );
    metrics::describe_counter!(
        "errlens_detections_total",
        "Detections by result and winning match type"
    );
    metrics::describe_counter!("errlens_reloads_total", "Rule reloads by outcome");
    metrics::describe_counter!(
        "errlens_rules_rejected_total",
        "Rules skipped while building a snapshot, by reason"
    );
    metrics::describe_histogram!(
        "errlens_reload_duration_us",
        metrics::Unit::Microseconds,
        "Fetch and compile time of a rule reload in microseconds"
    );
    metrics::describe_gauge!("errlens_rules_loaded", "Rules installed per tier");

    info!("Metrics exporter initialized");
    Ok(handle)
}
