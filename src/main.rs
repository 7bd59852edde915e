//! CLI entry point for the GTFS-RT reliability harvester.
//!
//! Provides subcommands for running the periodic harvest loop and for
//! executing a single cycle against a feed (useful for smoke-testing a feed
//! URL before deploying the loop).

use std::ffi::OsStr;
use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use gtfs_rt_harvester::{
    config::HarvestConfig,
    feed::FeedReader,
    fetch::BasicClient,
    harvester::Harvester,
    ledger::InMemoryLedger,
    store::InMemoryStore,
};
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::{
    EnvFilter, Layer,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

#[derive(Parser)]
#[command(name = "gtfs_rt_harvester")]
#[command(about = "Harvests GTFS-RT trip updates into per-stop reliability statistics", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the periodic harvest loop until interrupted
    Run {
        #[command(flatten)]
        config: HarvestConfig,
    },
    /// Run a single harvest cycle and print the resulting rows as JSON
    Once {
        #[command(flatten)]
        config: HarvestConfig,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok(); // Load .env file

    // Logging setup: colored stderr + JSON rolling log file
    let log_file_path =
        std::env::var("LOG_FILE_PATH").unwrap_or_else(|_| "logs/gtfs_rt_harvester.log".to_string());
    let log_dir = Path::new(&log_file_path)
        .parent()
        .unwrap_or(Path::new("logs"));
    let log_file_name = Path::new(&log_file_path)
        .file_name()
        .unwrap_or(OsStr::new("gtfs_rt_harvester.log"));

    let file_appender = tracing_appender::rolling::daily(log_dir, log_file_name);
    let (non_blocking_file, _file_guard) = tracing_appender::non_blocking(file_appender);

    let stderr_layer = fmt::layer()
        .with_target(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(true)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::from_env("RUST_LOG").add_directive("info".parse().unwrap()));

    let json_layer = fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(true)
        .with_writer(non_blocking_file)
        .with_filter(EnvFilter::from_env("RUST_LOG_JSON").add_directive("debug".parse().unwrap()));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config } => run_loop(config).await?,
        Commands::Once { config } => run_once(config).await?,
    }

    Ok(())
}

fn build_harvester(
    config: HarvestConfig,
) -> Harvester<FeedReader<BasicClient>, InMemoryLedger, InMemoryStore> {
    let reader = FeedReader::new(BasicClient::new(), config.feed_url.clone());
    Harvester::new(
        reader,
        Arc::new(InMemoryLedger::new()),
        Arc::new(InMemoryStore::new()),
        config,
    )
}

/// Runs the harvest and retention loops until ctrl-c, then lets any in-flight
/// cycle unwind before exiting.
async fn run_loop(config: HarvestConfig) -> Result<()> {
    let harvester = Arc::new(build_harvester(config));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let harvest_task = {
        let harvester = harvester.clone();
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move { harvester.run(shutdown).await })
    };
    let retention_task = {
        let harvester = harvester.clone();
        tokio::spawn(async move { harvester.run_retention(shutdown_rx).await })
    };

    tokio::signal::ctrl_c().await?;
    info!("interrupt received, shutting down");
    shutdown_tx.send(true)?;

    harvest_task.await?;
    retention_task.await?;
    Ok(())
}

/// Runs one cycle and prints the merged rows, for feed smoke tests.
async fn run_once(config: HarvestConfig) -> Result<()> {
    let harvester = build_harvester(config);

    let report = harvester.run_cycle().await?;
    info!(
        entities = report.entity_count,
        observations = report.observations,
        skipped = report.skipped,
        pairs = report.resolved_pairs,
        rows = report.rows_affected,
        "cycle complete"
    );

    let rows = harvester.store().snapshot().await;
    println!("{}", serde_json::to_string_pretty(&rows)?);
    Ok(())
}
