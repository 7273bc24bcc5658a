use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use harvest_client::{FetcherConfig, ReqwestMarketDataFetcher};
use harvest_core::{
    BoundedDataCache, CacheConfig, CircuitBreakerConfig, EndpointCircuitBreaker, ExportConfig,
    PassthroughPipeline, RateLimitedScheduler, SchedulerConfig, SchedulerRunner,
    SnapshotExporter, TracingSchedulerReporter, system_clock,
};
use harvest_db::{Database, DatabaseConfig};
use harvest_server::routes;
use harvest_server::state::AppState;

const DATASET: &str = "quotes";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("harvest=info".parse()?))
        .with_target(false)
        .init();

    let admin_token = std::env::var("HARVEST_ADMIN_TOKEN")
        .ok()
        .filter(|t| !t.is_empty());
    if admin_token.is_none() {
        tracing::warn!("HARVEST_ADMIN_TOKEN not set, control endpoints are disabled");
    }
    let port = std::env::var("HARVEST_SERVER_PORT").unwrap_or_else(|_| "3000".to_string());
    let addr = format!("0.0.0.0:{port}");

    let scheduler_config = SchedulerConfig::from_env()?;
    let mut fetcher_config = FetcherConfig::from_env()?;
    fetcher_config.timeout = scheduler_config.fetch_timeout;

    let db = Database::connect(&DatabaseConfig::from_env()?).await?;
    db.migrate().await?;
    let lease = db.try_writer_lease().await?;

    let clock = system_clock();
    let scheduler = RateLimitedScheduler::new(
        scheduler_config,
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

    let (runner, handle) = SchedulerRunner::new(scheduler);
    let cancel = CancellationToken::new();
    let runner_token = cancel.clone();
    let runner_task = tokio::spawn(async move {
        runner
            .run(runner_token, &TracingSchedulerReporter)
            .await
    });

    let state = Arc::new(AppState {
        scheduler: handle,
        db: Some(db),
        admin_token,
    });

    let app = routes::router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    tracing::info!("Starting server on {addr}");
    let listener = TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(cancel.clone()))
        .await?;

    cancel.cancel();
    runner_task.await??;
    lease.release().await?;

    Ok(())
}

async fn shutdown_signal(cancel: CancellationToken) {
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                tracing::error!(error = %e, "Failed to listen for CTRL+C");
            }
            tracing::info!("Shutdown signal received");
        }
        () = cancel.cancelled() => {}
    }
    cancel.cancel();
}
