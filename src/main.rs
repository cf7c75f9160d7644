use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

use rollupd::config::Config;
use rollupd::health::HealthMetrics;
use rollupd::ingest::IngestServer;
use rollupd::rollup::store::SampleStore;
use rollupd::schedule::ScheduleContext;
use rollupd::service::{unix_millis, RollupService};
use rollupd::writer::clickhouse::ClickHouseRollupWriter;

/// Time-windowed metric rollup scheduling daemon.
#[derive(Parser)]
#[command(name = "rollupd", about)]
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

/// Build-time version info, injected via RUSTFLAGS or build.rs.
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
        println!("rollupd {}", version::full());
        return Ok(());
    }

    // Initialize tracing.
    let filter = EnvFilter::try_new(&cli.log_level)
        .with_context(|| format!("invalid log level: {}", cli.log_level))?;

    fmt().with_env_filter(filter).with_target(true).init();

    // Config is required for the main daemon run.
    let config_path = cli
        .config
        .context("--config is required (use --help for usage)")?;

    let cfg = Config::load(&config_path)
        .with_context(|| format!("loading config from {}", config_path.display()))?;

    tracing::info!(
        version = version::RELEASE,
        commit = version::git_commit(),
        "starting rollupd",
    );

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

    // Wire the collaborators; everything is injected, nothing is global.
    let health = Arc::new(HealthMetrics::new(&cfg.health.addr)?);
    if cfg.health.enabled {
        health.start().await?;
    }

    let mut writer = ClickHouseRollupWriter::new(cfg.clickhouse.clone());
    writer.start().await.context("starting ClickHouse writer")?;
    let writer = Arc::new(writer);

    let store = Arc::new(SampleStore::new(cfg.shards.count));
    let schedule = Arc::new(ScheduleContext::new(
        unix_millis(),
        &cfg.shards.managed_shards(),
    ));

    let ingest = IngestServer::new(&cfg.ingest.addr, Arc::clone(&store), Arc::clone(&schedule));
    if cfg.ingest.enabled {
        ingest.start().await?;
    }

    let service = RollupService::new(
        cfg.rollup.clone(),
        schedule,
        store,
        writer,
        Arc::clone(&health),
    );
    service.start();

    // Wait for shutdown signal.
    let _ = shutdown_rx.await;

    // Graceful shutdown.
    service.stop().await;
    ingest.stop().await?;
    health.stop().await?;

    tracing::info!("rollupd stopped");

    Ok(())
}
