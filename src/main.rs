//! Bundle Engine
//!
//! Command line entry point. Simulation mode runs one bundle end to end
//! against the in-memory persistence and the simulated ledger, printing
//! progress until the bundle finishes.

use anyhow::{Context, Result};
use bundle_engine::config::EngineConfig;
use bundle_engine::metrics::metrics;
use bundle_engine::simulation::{InMemoryPersistence, LogNotificationSink, SimulatedLedger};
use bundle_engine::{
    Account, BundleOrchestrator, EngineEvent, LaunchRequest, ProcessorKind, TransactionKind,
    TransactionTemplate,
};
use clap::{Parser, ValueEnum};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    /// Run one bundle against simulated collaborators
    Simulation,
}

/// Command line arguments
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml", env = "BUNDLE_ENGINE_CONFIG")]
    config: PathBuf,

    /// Operating mode
    #[arg(short, long, value_enum, default_value_t = Mode::Simulation)]
    mode: Mode,

    /// Number of simulated accounts
    #[arg(short, long, default_value_t = 12)]
    accounts: usize,

    /// Planner seed, overrides the configuration
    #[arg(long)]
    seed: Option<u64>,

    /// Run tasks on the sequential processor
    #[arg(long)]
    sequential: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = load_config(&args.config)?;
    if let Some(seed) = args.seed {
        config.seed = Some(seed);
    }
    init_logging(
        &config.monitoring.log_level,
        args.verbose,
        args.json_logs || config.monitoring.json_logs,
    )?;

    info!("Starting bundle engine v{}", env!("CARGO_PKG_VERSION"));
    info!(config = %args.config.display(), mode = ?args.mode, "Configuration loaded");
    config.validate().context("Invalid configuration")?;

    match args.mode {
        Mode::Simulation => run_simulation(config, &args).await,
    }
}

/// Initialize logging subsystem
fn init_logging(level: &str, verbose: bool, json: bool) -> Result<()> {
    let default_filter = if verbose {
        "bundle_engine=debug,info".to_string()
    } else {
        format!("bundle_engine={level},warn")
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let registry = tracing_subscriber::registry().with(filter);
    let result = if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_target(true))
            .try_init()
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .try_init()
    };
    result.context("Failed to initialize logging")?;

    Ok(())
}

/// Load configuration from file with fallback to defaults
fn load_config(path: &Path) -> Result<EngineConfig> {
    if path.exists() {
        EngineConfig::from_file_with_env(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))
    } else {
        dotenvy::dotenv().ok();
        let mut config = EngineConfig::default();
        config.apply_env_overrides(|key| {
            std::env::var(format!("{}{key}", bundle_engine::config::ENV_PREFIX)).ok()
        })?;
        Ok(config)
    }
}

async fn run_simulation(config: EngineConfig, args: &Args) -> Result<()> {
    let sim = &config.ledger.simulated;
    let ledger = Arc::new(
        SimulatedLedger::new(config.ledger.endpoint.clone())
            .with_latency(Duration::from_millis(sim.latency_ms))
            .with_failure_rate(sim.failure_rate, config.seed)
            .with_fee_rate(sim.fee_rate),
    );

    let funding = config.accounts.min_account_balance.saturating_mul(10).max(1);
    let accounts: Vec<Account> = (0..args.accounts)
        .map(|i| Account::new(format!("sim-{i:03}"), format!("0x{:040x}", i + 1), funding))
        .collect();
    let persistence = Arc::new(InMemoryPersistence::with_accounts(accounts));

    let orchestrator = BundleOrchestrator::start(
        config.clone(),
        persistence,
        ledger,
        Arc::new(LogNotificationSink),
    )
    .await
    .context("Failed to start orchestrator")?;

    let mut events = orchestrator.subscribe();
    let processor = if args.sequential {
        ProcessorKind::Sequential
    } else {
        config.scheduler.default_processor
    };
    let request = LaunchRequest::new(
        "simulation",
        TransactionTemplate {
            kind: TransactionKind::Transfer {
                recipient: Some("0x000000000000000000000000000000000000dead".to_string()),
                amount: 1_000,
            },
            base_fee: 5_000,
            gas_limit: Some(21_000),
        },
    )
    .with_processor(processor);

    let bundle_id = orchestrator.launch(request).await?;
    info!(bundle_id = %bundle_id, "Bundle launched");

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(EngineEvent::BundleCompleted { bundle_id: id, .. }) if id == bundle_id => break,
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Progress display lagged"),
                Err(RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal, cancelling bundle");
                if let Err(e) = orchestrator.cancel(bundle_id).await {
                    warn!(error = %e, "Cancel failed");
                }
                break;
            }
        }
    }

    if let Some(progress) = orchestrator.get_progress(bundle_id).await? {
        info!(
            status = %progress.status,
            completed = progress.completed,
            failed = progress.failed,
            total = progress.total,
            elapsed_ms = progress.elapsed_ms,
            "Final progress"
        );
    }
    for bundle in orchestrator.get_history(Some(1)).await? {
        println!("{}", serde_json::to_string_pretty(&bundle)?);
    }
    if config.monitoring.enable_metrics {
        println!("{}", metrics().render());
    }

    orchestrator.shutdown();
    info!("Shutting down gracefully...");
    Ok(())
}
