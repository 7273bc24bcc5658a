use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use chrono::TimeDelta;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use testcontainers::core::{ContainerPort, WaitFor};
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, GenericImage, ImageExt};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use harvest_core::testutil::{
    ManualClock, MemoryRecordStore, MemoryStateStore, MockFetcher, MockPipeline,
};
use harvest_core::{
    AppError, Clock, RateLimitedScheduler, SchedulerConfig, SchedulerHandle, SchedulerRunner,
    SchedulerState, TracingSchedulerReporter,
};
use harvest_db::Database;
use harvest_server::routes;
use harvest_server::state::AppState;

pub const TEST_ADMIN_TOKEN: &str = "test-admin-token";

pub struct TestApp {
    pub router: Router,
    pub handle: SchedulerHandle,
    pub fetcher: MockFetcher,
    pub clock: ManualClock,
    pub cancel: CancellationToken,
    pub runner: JoinHandle<Result<(), AppError>>,
}

impl TestApp {
    /// Cancel the runner and wait for it to stop.
    pub async fn stop_scheduler(&mut self) {
        self.cancel.cancel();
        (&mut self.runner).await.unwrap().unwrap();
    }
}

/// State whose next collection is an hour away, so the runner's first tick
/// does not race the requests under test.
pub fn quiet_state(clock: &ManualClock) -> SchedulerState {
    let now = clock.now();
    SchedulerState {
        next_collection_ts: Some(now + TimeDelta::hours(1)),
        hour_window_start: Some(now),
        updated_at: Some(now),
        ..SchedulerState::default()
    }
}

fn test_config() -> SchedulerConfig {
    let mut config = SchedulerConfig::default()
        .with_tickers(["SPY"])
        .with_budget(100, 1000);
    config.tick_interval = Duration::from_secs(60);
    config
}

/// In-memory app with an admin token and a healthy fetcher.
pub async fn setup_test_app() -> TestApp {
    let clock = ManualClock::default();
    let state = quiet_state(&clock);
    setup_test_app_with(MockFetcher::ok(), clock, state, Some(TEST_ADMIN_TOKEN)).await
}

/// In-memory app with control endpoints disabled.
pub async fn setup_test_app_no_auth() -> TestApp {
    let clock = ManualClock::default();
    let state = quiet_state(&clock);
    setup_test_app_with(MockFetcher::ok(), clock, state, None).await
}

pub async fn setup_test_app_with(
    fetcher: MockFetcher,
    clock: ManualClock,
    initial: SchedulerState,
    admin_token: Option<&str>,
) -> TestApp {
    let scheduler = RateLimitedScheduler::new(
        test_config(),
        fetcher.clone(),
        MockPipeline::passthrough(),
        MemoryRecordStore::empty(),
        MemoryStateStore::with_state(initial),
        clock.shared(),
    );

    let (runner, handle) = SchedulerRunner::new(scheduler);
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    let runner = tokio::spawn(async move { runner.run(token, &TracingSchedulerReporter).await });

    let state = Arc::new(AppState {
        scheduler: handle.clone(),
        db: None,
        admin_token: admin_token.map(str::to_string),
    });

    TestApp {
        router: routes::router(state),
        handle,
        fetcher,
        clock,
        cancel,
        runner,
    }
}

/// App backed by a PostgreSQL container. The container must stay in scope
/// for the duration of the test.
pub async fn setup_test_app_with_db() -> (Router, Database, ContainerAsync<GenericImage>) {
    let container = GenericImage::new("postgres", "16")
        .with_exposed_port(ContainerPort::Tcp(5432))
        .with_wait_for(WaitFor::message_on_stderr(
            "database system is ready to accept connections",
        ))
        .with_env_var("POSTGRES_PASSWORD", "postgres")
        .with_env_var("POSTGRES_DB", "harvest_test")
        .start()
        .await
        .expect("Failed to start PostgreSQL container");

    let host = container.get_host().await.expect("Failed to get host");
    let port = container
        .get_host_port_ipv4(5432)
        .await
        .expect("Failed to get port");

    let url = format!("postgresql://postgres:postgres@{host}:{port}/harvest_test");

    let pool = retry_connect(&url).await;

    for migration in MIGRATIONS {
        sqlx::query(migration)
            .execute(&pool)
            .await
            .expect("Failed to run migration");
    }

    let db = Database::from_pool(pool);
    let clock = ManualClock::default();
    let scheduler = RateLimitedScheduler::new(
        test_config(),
        MockFetcher::ok(),
        MockPipeline::passthrough(),
        db.record_repo(),
        db.state_store(),
        clock.shared(),
    );
    let (runner, handle) = SchedulerRunner::new(scheduler);
    // Runs until the test's runtime shuts down.
    tokio::spawn(async move {
        runner
            .run(CancellationToken::new(), &TracingSchedulerReporter)
            .await
    });

    let state = Arc::new(AppState {
        scheduler: handle,
        db: Some(db.clone()),
        admin_token: Some(TEST_ADMIN_TOKEN.to_string()),
    });

    (routes::router(state), db, container)
}

const MIGRATIONS: &[&str] = &[
    r#"CREATE TABLE IF NOT EXISTS scheduler_state (
        id SMALLINT PRIMARY KEY DEFAULT 1,
        current_state VARCHAR(20) NOT NULL DEFAULT 'IDLE',
        last_collection_ts TIMESTAMPTZ,
        next_collection_ts TIMESTAMPTZ,
        api_calls_today INTEGER NOT NULL DEFAULT 0,
        api_calls_this_hour INTEGER NOT NULL DEFAULT 0,
        hour_window_start TIMESTAMPTZ,
        consecutive_failures INTEGER NOT NULL DEFAULT 0,
        backoff_until TIMESTAMPTZ,
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        CONSTRAINT chk_scheduler_state_singleton CHECK (id = 1)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS derived_records (
        id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
        dataset VARCHAR(100) NOT NULL,
        ticker VARCHAR(32) NOT NULL,
        payload JSONB NOT NULL,
        computed_at TIMESTAMPTZ NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )"#,
    r#"CREATE TABLE IF NOT EXISTS scan_history (
        id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
        started_at TIMESTAMPTZ NOT NULL,
        finished_at TIMESTAMPTZ NOT NULL,
        outcome VARCHAR(20) NOT NULL,
        tickers_ok INTEGER NOT NULL DEFAULT 0,
        tickers_failed INTEGER NOT NULL DEFAULT 0,
        api_calls INTEGER NOT NULL DEFAULT 0,
        error TEXT,
        CONSTRAINT chk_scan_history_outcome CHECK (
            outcome IN ('completed', 'failed', 'abandoned')
        )
    )"#,
];

async fn retry_connect(url: &str) -> PgPool {
    for _ in 0..30 {
        if let Ok(pool) = PgPoolOptions::new().max_connections(5).connect(url).await {
            return pool;
        }
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    }
    panic!("Failed to connect to test database");
}
