//! Campaign Sweeper: drives customer-success campaigns forward.
//!
//! Wires the enrollment engine to its in-process collaborators and runs the
//! step scheduler on a fixed interval until interrupted.

use std::net::SocketAddr;
use std::sync::Arc;

use campaign_core::config::AppConfig;
use campaign_core::event_bus::{EventSink, TracingSink};
use campaign_enrollment::{
    demo, CampaignLifecycle, EnrollmentManager, InMemoryStore, OutboxDispatcher, RuleEvaluator,
    StaticAccountDirectory, StepScheduler,
};
use clap::Parser;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "campaign-sweeper")]
#[command(about = "Customer-success campaign enrollment and step scheduler")]
#[command(version)]
struct Cli {
    /// Node identifier (overrides config)
    #[arg(long, env = "CAMPAIGN_SWEEPER__NODE_ID")]
    node_id: Option<String>,

    /// Sweep period in milliseconds (overrides config)
    #[arg(long, env = "CAMPAIGN_SWEEPER__SCHEDULER__SWEEP_INTERVAL_MS")]
    sweep_interval_ms: Option<u64>,

    /// Run a single sweep and exit
    #[arg(long, default_value_t = false)]
    once: bool,

    /// Create the win-back demo campaign and enroll demo accounts
    #[arg(long, default_value_t = false)]
    seed_demo: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "campaign_sweeper=info,campaign_enrollment=info".into()),
        )
        .json()
        .init();

    let cli = Cli::parse();

    info!("Campaign Sweeper starting up");

    let mut config = AppConfig::load().unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        AppConfig::default()
    });

    if let Some(node_id) = cli.node_id {
        config.node_id = node_id;
    }
    if let Some(interval) = cli.sweep_interval_ms {
        config.scheduler.sweep_interval_ms = interval;
    }

    info!(
        node_id = %config.node_id,
        sweep_interval_ms = config.scheduler.sweep_interval_ms,
        dispatch_timeout_ms = config.scheduler.dispatch_timeout_ms,
        batch_size = config.scheduler.batch_size,
        max_concurrency = config.scheduler.max_concurrency,
        "Configuration loaded"
    );

    if config.metrics.enabled {
        if let Err(e) = start_metrics(&config) {
            error!(error = %e, "Failed to start metrics exporter");
        }
    }

    let store = Arc::new(InMemoryStore::new());
    let directory = Arc::new(StaticAccountDirectory::new());
    let outbox = Arc::new(OutboxDispatcher::new());
    let sink: Arc<dyn EventSink> = Arc::new(TracingSink);

    let lifecycle = CampaignLifecycle::new(store.clone())
        .with_event_sink(sink.clone())
        .with_status_transitions(config.lifecycle.enforce_status_transitions);
    let manager = EnrollmentManager::new(store.clone(), directory.clone())
        .with_event_sink(sink.clone())
        .with_complete_empty_enrollments(config.lifecycle.complete_empty_enrollments);
    let scheduler = StepScheduler::new(
        store,
        directory.clone(),
        outbox.clone(),
        outbox,
        Arc::new(RuleEvaluator::new()),
        config.scheduler.clone(),
    )
    .with_event_sink(sink);

    if cli.seed_demo {
        demo::seed(&lifecycle, &manager, &directory).await?;
    }

    if cli.once {
        let report = scheduler.sweep().await?;
        info!(?report, "Single sweep finished");
        return Ok(());
    }

    let mut interval = tokio::time::interval(config.scheduler.sweep_interval());
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    info!("Campaign Sweeper is running");

    loop {
        tokio::select! {
            _ = interval.tick() => {
                if let Err(e) = scheduler.sweep().await {
                    error!(error = %e, "Sweep aborted, remaining enrollments wait for the next tick");
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    info!("Campaign Sweeper stopped");
    Ok(())
}

fn start_metrics(config: &AppConfig) -> anyhow::Result<()> {
    let addr = SocketAddr::new(config.metrics.host.parse()?, config.metrics.port);
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    info!(port = config.metrics.port, "Metrics exporter started");
    Ok(())
}
