use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

use aggregoor::config::Config;
use aggregoor::coordinator::Coordinator;
use aggregoor::globals::Globals;
use aggregoor::health::HealthMetrics;
use aggregoor::report::traffic::TrafficReport;
use aggregoor::report::ReportInfo;

/// Request-telemetry statistics aggregation service.
#[derive(Parser)]
#[command(name = "aggregoor", about)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Print version information and exit.
    Version,
}

/// Build-time version info.
mod version {
    /// Release version string (set at build time).
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Git commit hash (set at build time via env, or "unknown").
    pub fn git_commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }

    /// Full version string with platform info.
    pub fn full() -> String {
        format!(
            "{} (commit: {}, {}/{})",
            RELEASE,
            git_commit(),
            std::env::consts::OS,
            std::env::consts::ARCH,
        )
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Handle version subcommand before anything else.
    if let Some(Command::Version) = &cli.command {
        println!("aggregoor {}", version::full());
        return Ok(());
    }

    // Initialize tracing.
    let filter = EnvFilter::try_new(&cli.log_level)
        .with_context(|| format!("invalid log level: {}", cli.log_level))?;

    fmt().with_env_filter(filter).with_target(true).init();

    // Config is required for the main service run.
    let config_path = cli
        .config
        .context("--config is required (use --help for usage)")?;

    let cfg = Config::load(&config_path)
        .with_context(|| format!("loading config from {}", config_path.display()))?;

    tracing::info!(version = version::RELEASE, "starting aggregoor");

    // Build and run the tokio runtime.
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    rt.block_on(async { run(cfg).await })
}

async fn run(cfg: Config) -> Result<()> {
    // Set up signal handling.
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to register SIGTERM handler");

        tokio::select! {
            _ = ctrl_c => {
                tracing::info!("received SIGINT, shutting down");
            }
            _ = sigterm.recv() => {
                tracing::info!("received SIGTERM, shutting down");
            }
        }

        let _ = shutdown_tx.send(());
    });

    // Start the stats surface.
    let health = Arc::new(HealthMetrics::new(&cfg.health.addr).context("creating health metrics")?);
    health
        .start()
        .await
        .context("starting health metrics server")?;

    let globals = Globals::new(Arc::clone(&health));

    // Start the coordinator and the configured reports.
    let mut coordinator = Coordinator::new(Arc::clone(&globals), cfg.coordinator.clone());
    coordinator.startup().context("starting coordinator")?;

    for report_cfg in &cfg.reports {
        let report = TrafficReport::new(
            report_cfg.name.clone(),
            report_cfg.key,
            ReportInfo {
                time_window: report_cfg.time_window,
                tick_count: report_cfg.tick_count,
            },
        );

        let response = coordinator
            .add_report(Box::new(report))
            .await
            .with_context(|| format!("adding report {}", report_cfg.name))?;
        if !response.is_ok() {
            bail!(
                "adding report {} refused: {}",
                report_cfg.name,
                response.message(),
            );
        }

        tracing::info!(
            report = %report_cfg.name,
            time_window = ?report_cfg.time_window,
            tick_count = report_cfg.tick_count,
            "report started",
        );
    }

    tracing::info!(reports = cfg.reports.len(), "aggregoor started");

    // Wait for shutdown signal.
    let _ = shutdown_rx.await;

    // Graceful shutdown.
    coordinator
        .shutdown()
        .await
        .context("shutting down coordinator")?;
    health.stop().await?;

    tracing::info!("aggregoor stopped");

    Ok(())
}
