//! inspection-worker: runs scheduled cluster inspections.
//!
//! `serve` installs a cron trigger for every enabled schedule and runs until
//! Ctrl-C. `run` performs a single manual inspection and prints the run as
//! JSON.

use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use kinspect_core::clusters::ClusterRegistry;
use kinspect_core::{ClusterRef, Config, ScheduleId, TriggerType};
use kinspect_inspection::{Orchestrator, ScheduleManager, TokioCronDriver};
use kinspect_notify::llm::create_provider;
use kinspect_notify::{DisabledSummarizer, LlmSummarizer, Summarizer, WebhookPusher};
use kinspect_sandbox::KubeApiBackend;
use kinspect_store::{InspectionStore, MemoryStore, PgStore};

// ── CLI ───────────────────────────────────────────────────────

/// Periodic Kubernetes inspection worker.
#[derive(Parser, Debug)]
#[command(name = "inspection-worker", version, about)]
struct Cli {
    /// Path to the cluster registry YAML (overrides CLUSTERS_FILE).
    #[arg(long, env = "KINSPECT_CLUSTERS_FILE")]
    clusters: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Reconcile schedules and keep firing them until interrupted.
    Serve,
    /// Run every applicable script against one cluster once.
    Run {
        #[arg(long)]
        cluster: String,
        /// Schedule whose script selection and receivers to use.
        #[arg(long)]
        schedule: Option<ScheduleId>,
    },
}

// ── Wiring ────────────────────────────────────────────────────

async fn open_store(config: &Config) -> anyhow::Result<Arc<dyn InspectionStore>> {
    if config.postgres.is_configured() {
        let store = PgStore::connect(&config.postgres)
            .await
            .context("failed to connect to PostgreSQL")?;
        info!(host = %config.postgres.host, db = %config.postgres.database, "using PostgreSQL store");
        Ok(Arc::new(store))
    } else {
        warn!("PostgreSQL not configured, run history is kept in memory only");
        Ok(Arc::new(MemoryStore::new()))
    }
}

fn summarizer(config: &Config) -> Arc<dyn Summarizer> {
    if !config.llm.enabled {
        return Arc::new(DisabledSummarizer);
    }
    match create_provider(&config.llm, &config.ollama) {
        Ok(provider) => Arc::new(LlmSummarizer::new(provider, &config.llm)),
        Err(e) => {
            warn!(error = %e, "LLM provider unavailable, AI summaries disabled");
            Arc::new(DisabledSummarizer)
        }
    }
}

// ── main ──────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    kinspect_core::config::load_dotenv();
    let mut config = Config::from_env().context("invalid configuration")?;
    if let Some(path) = cli.clusters {
        config.clusters.file = path.into();
    }
    config.log_summary();

    let registry = ClusterRegistry::from_file(&config.clusters.file)
        .with_context(|| format!("failed to load {}", config.clusters.file.display()))?;
    info!(clusters = ?registry.names(), "cluster registry loaded");
    let backend = Arc::new(KubeApiBackend::from_registry(&registry)?);

    let store = open_store(&config).await?;
    let orchestrator = Arc::new(
        Orchestrator::new(store, backend, config.inspection.clone())
            .with_summarizer(summarizer(&config)),
    );
    let manager = ScheduleManager::new(
        orchestrator,
        Arc::new(TokioCronDriver::new()),
        Arc::new(WebhookPusher::new()),
    );

    match cli.command {
        Command::Serve => {
            let report = manager.update_config().await?;
            for (id, error) in &report.failed {
                warn!(schedule_id = id, %error, "schedule not installed");
            }
            info!(
                triggers = manager.live_trigger_count(),
                "inspection-worker running, press Ctrl-C to stop"
            );
            tokio::signal::ctrl_c().await?;
            manager.shutdown();
            manager.flush_deliveries().await;
            info!("inspection-worker exited cleanly");
        }
        Command::Run { cluster, schedule } => {
            let run = manager
                .run_by_cluster(schedule, &ClusterRef::new(cluster), TriggerType::Manual)
                .await?;
            manager.flush_deliveries().await;
            println!("{}", serde_json::to_string_pretty(&run)?);
        }
    }

    Ok(())
}
