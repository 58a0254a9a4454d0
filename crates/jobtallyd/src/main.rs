//! jobtallyd — the jobtally exporter daemon.
//!
//! Assembles the exporter in one process:
//! - Record source (file)
//! - Collector (periodic aggregation)
//! - Snapshot store + scrape gate
//! - HTTP API (`/metrics`, `/status`, `/healthz`)
//!
//! # Usage
//!
//! ```text
//! jobtallyd --config /etc/jobtally.toml serve
//! jobtallyd serve --source logs/data_collect.csv --interval 80 --truncate
//! jobtallyd check --source logs/data_collect.csv
//! ```

use std::io::BufRead;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{error, info};

use jobtally_api::{build_router, ApiState};
use jobtally_core::{Aggregator, DrainMode, FileSource, MemorySource, RecordSource, TallyConfig};
use jobtally_metrics::{render, render_text, Collector, ExpositionOptions, SnapshotStore};

#[derive(Parser)]
#[command(name = "jobtallyd", about = "Host/job occurrence exporter")]
struct Cli {
    /// Path to a jobtally.toml config file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the exporter: aggregate periodically and serve /metrics.
    Serve {
        /// Address to listen on.
        #[arg(long)]
        listen: Option<SocketAddr>,

        /// Record log file.
        #[arg(long)]
        source: Option<PathBuf>,

        /// Aggregation interval in seconds.
        #[arg(long)]
        interval: Option<u64>,

        /// Consume lines from the log file instead of re-reading it each cycle.
        #[arg(long)]
        truncate: bool,
    },

    /// Aggregate once and print the exposition text. Never modifies the file.
    Check {
        /// Record log file, or `-` for stdin.
        #[arg(long)]
        source: Option<PathBuf>,
    },

    /// Print the effective configuration as TOML.
    PrintConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let mut config = load_config(cli.config.as_deref())?;

    match cli.command {
        Command::Serve {
            listen,
            source,
            interval,
            truncate,
        } => {
            if let Some(listen) = listen {
                config.server.listen = listen;
            }
            if let Some(source) = source {
                config.source.path = source;
            }
            if let Some(interval) = interval {
                config.aggregation.interval_secs = interval;
            }
            if truncate {
                config.source.mode = DrainMode::Truncate;
            }
            run_serve(config).await
        }
        Command::Check { source } => run_check(&config, source),
        Command::PrintConfig => {
            print!("{}", config.to_toml_string()?);
            Ok(())
        }
    }
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new("info,jobtallyd=debug,jobtally_metrics=debug")
    });
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<TallyConfig> {
    match path {
        Some(path) => TallyConfig::from_file(path)
            .with_context(|| format!("failed to load config {}", path.display())),
        None => Ok(TallyConfig::default()),
    }
}

async fn run_serve(config: TallyConfig) -> anyhow::Result<()> {
    config.validate()?;
    info!("jobtally exporter starting");

    // ── Initialize subsystems ──────────────────────────────────

    let store = Arc::new(SnapshotStore::new());

    let source = FileSource::new(&config.source.path, config.source.mode);
    info!(source = %source.describe(), mode = ?config.source.mode, "record source configured");

    let collector = Collector::new(
        source,
        store.clone(),
        Duration::from_secs(config.aggregation.interval_secs),
    );

    let state = ApiState::from_config(store, &config)?;

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ── Start background tasks ─────────────────────────────────

    let collector_handle = tokio::spawn(collector.run(shutdown_rx));

    // ── Start API server ───────────────────────────────────────

    let router = build_router(state);
    let addr = config.server.listen;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "metrics endpoint listening");

    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to install CTRL+C handler");
            std::future::pending::<()>().await;
        }
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    })
    .await?;

    // Let an in-flight cycle finish.
    let _ = collector_handle.await;

    info!("jobtally exporter stopped");
    Ok(())
}

fn run_check(config: &TallyConfig, source: Option<PathBuf>) -> anyhow::Result<()> {
    let path = source.unwrap_or_else(|| config.source.path.clone());

    let mut source: Box<dyn RecordSource> = if path == Path::new("-") {
        let lines = std::io::stdin()
            .lock()
            .lines()
            .collect::<Result<Vec<_>, _>>()?;
        Box::new(MemorySource::new(lines))
    } else {
        Box::new(FileSource::new(path, DrainMode::Retain))
    };

    let snapshot = Aggregator::new()
        .collect(source.as_mut())
        .with_context(|| format!("failed to read {}", source.describe()))?;

    let families = render(&snapshot, &ExpositionOptions::from_config(&config.aggregation));
    print!("{}", render_text(&families));

    let stats = snapshot.stats();
    eprintln!(
        "{} lines, {} records, {} dropped lines, {} dropped fragments, {} keys in {} shapes",
        stats.lines,
        stats.records,
        stats.dropped_lines,
        stats.dropped_fragments,
        snapshot.len(),
        snapshot.shapes().len()
    );
    Ok(())
}
