use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use harvest_client::{FetcherConfig, ReqwestMarketDataFetcher};
use harvest_core::{
    BoundedDataCache, CacheConfig, CircuitBreakerConfig, EndpointCircuitBreaker, ExportConfig,
    PassthroughPipeline, RateLimitedScheduler, SchedulerConfig, SchedulerRunner,
    SnapshotExporter, SnapshotReader, TracingSchedulerReporter, system_clock,
};
use harvest_db::{Database, DatabaseConfig, PgStateStore, RecordRepository};

const DATASET: &str = "quotes";

type Scheduler = RateLimitedScheduler<
    ReqwestMarketDataFetcher,
    PassthroughPipeline,
    RecordRepository,
    PgStateStore,
>;

#[derive(Parser)]
#[command(name = "harvest", version, about = "Rate-limited market data collector")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduler until interrupted (CTRL+C)
    Run,

    /// Recover persisted state and run a single collection now
    Collect,

    /// Print the persisted scheduler state
    Status,

    /// Clear ERROR/WAITING and schedule a collection now.
    /// Refused while another process holds the writer lease; use the
    /// server API while it runs.
    Reset,

    /// Show recent collection cycles
    History {
        /// Number of cycles to show
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },

    /// Print the latest exported snapshot of a dataset
    Snapshot {
        /// Dataset name; lists available datasets when omitted
        #[arg(short, long)]
        dataset: Option<String>,

        /// Export directory
        #[arg(long, env = "HARVEST_EXPORT_DIR", default_value = "./exports")]
        dir: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("harvest=info".parse()?))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run => cmd_run().await?,
        Commands::Collect => cmd_collect().await?,
        Commands::Status => cmd_status().await?,
        Commands::Reset => cmd_reset().await?,
        Commands::History { limit } => cmd_history(limit).await?,
        Commands::Snapshot { dataset, dir } => cmd_snapshot(dataset.as_deref(), dir)?,
    }

    Ok(())
}

/// Connect to PostgreSQL using DATABASE_URL and apply migrations.
async fn connect_db() -> Result<Database> {
    let config = DatabaseConfig::from_env()?;
    let db = Database::connect(&config)
        .await
        .context("Failed to connect to database")?;
    db.migrate().await?;
    Ok(db)
}

/// Wire the scheduler from environment configuration.
fn build_scheduler(db: &Database) -> Result<Scheduler> {
    let config = SchedulerConfig::from_env()?;
    let mut fetcher_config = FetcherConfig::from_env()?;
    fetcher_config.timeout = config.fetch_timeout;

    let clock = system_clock();
    let scheduler = RateLimitedScheduler::new(
        config,
        ReqwestMarketDataFetcher::new(fetcher_config)?,
        PassthroughPipeline::new(DATASET),
        db.record_repo(),
        db.state_store(),
        clock.clone(),
    )
    .with_breaker(EndpointCircuitBreaker::new(
        CircuitBreakerConfig::from_env()?,
        clock.clone(),
    ))
    .with_cache(BoundedDataCache::new(CacheConfig::from_env()?, clock))
    .with_exporter(SnapshotExporter::new(ExportConfig::from_env()?));

    Ok(scheduler)
}

async fn cmd_run() -> Result<()> {
    let db = connect_db().await?;
    let lease = db.try_writer_lease().await?;
    let (runner, _handle) = SchedulerRunner::new(build_scheduler(&db)?);

    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutdown signal received");
        }
        token.cancel();
    });

    runner.run(cancel, &TracingSchedulerReporter).await?;
    lease.release().await?;
    Ok(())
}

async fn cmd_collect() -> Result<()> {
    let db = connect_db().await?;
    let lease = db.try_writer_lease().await?;
    let mut scheduler = build_scheduler(&db)?;

    scheduler.recover().await?;
    let outcome = scheduler.trigger().await?;
    lease.release().await?;

    println!("{}", serde_json::to_string_pretty(&outcome)?);
    Ok(())
}

async fn cmd_status() -> Result<()> {
    let db = connect_db().await?;
    let state = db.state_store().read().await?;

    println!("{}", serde_json::to_string_pretty(&state)?);
    Ok(())
}

async fn cmd_reset() -> Result<()> {
    let db = connect_db().await?;
    let lease = db
        .try_writer_lease()
        .await
        .context("Stop the running scheduler or use the server API to reset")?;
    let mut scheduler = build_scheduler(&db)?;

    scheduler.recover().await?;
    let status = scheduler.reset().await?;
    lease.release().await?;

    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}

async fn cmd_history(limit: usize) -> Result<()> {
    let db = connect_db().await?;
    let scans = db.record_repo().recent_scans(limit).await?;

    if scans.is_empty() {
        println!("No collection cycles recorded yet");
        return Ok(());
    }

    println!("Recent collection cycles:\n");
    for scan in &scans {
        let duration = (scan.finished_at - scan.started_at).num_milliseconds();
        println!(
            "  [{:<9}] {} ok={} failed={} calls={} ({duration} ms){}",
            scan.outcome.as_str(),
            scan.started_at.format("%Y-%m-%d %H:%M:%S UTC"),
            scan.tickers_ok,
            scan.tickers_failed,
            scan.api_calls,
            scan.error
                .as_deref()
                .map(|e| format!(" error: {e}"))
                .unwrap_or_default(),
        );
    }

    println!("\nTotal: {} cycles", scans.len());
    Ok(())
}

fn cmd_snapshot(dataset: Option<&str>, dir: PathBuf) -> Result<()> {
    let reader = SnapshotReader::new(dir);

    let Some(dataset) = dataset else {
        let datasets = reader.datasets()?;
        if datasets.is_empty() {
            println!("No datasets exported yet");
        }
        for name in datasets {
            let archived = reader.archive(&name)?.len();
            println!("  {name} ({archived} archived)");
        }
        return Ok(());
    };

    match reader.read_latest(dataset)? {
        Some(snapshot) => println!("{}", serde_json::to_string_pretty(&snapshot)?),
        None => println!("No readable snapshot for dataset '{dataset}'"),
    }
    Ok(())
}
