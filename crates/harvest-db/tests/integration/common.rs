use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use testcontainers::core::{ContainerPort, WaitFor};
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, GenericImage, ImageExt};

/// SQL migration statements, executed one at a time.
const MIGRATIONS: &[&str] = &[
    // 001_init.sql
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
    r#"CREATE INDEX IF NOT EXISTS idx_derived_records_dataset
        ON derived_records(dataset, ticker, computed_at DESC)"#,
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
    r#"CREATE INDEX IF NOT EXISTS idx_scan_history_started
        ON scan_history(started_at DESC)"#,
];

/// Spins up a PostgreSQL container and returns a connected pool.
///
/// The `ContainerAsync` must be kept in scope for the test duration;
/// dropping it will stop the container.
pub async fn setup_test_db() -> (PgPool, ContainerAsync<GenericImage>) {
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

    let connection_string = format!("postgresql://postgres:postgres@{host}:{port}/harvest_test");

    // Retry connection until container is fully ready
    const MAX_RETRIES: u32 = 30;
    let mut retries = 0;
    let pool = loop {
        match PgPoolOptions::new()
            .max_connections(5)
            .connect(&connection_string)
            .await
        {
            Ok(pool) => break pool,
            Err(e) => {
                retries += 1;
                if retries >= MAX_RETRIES {
                    panic!("Failed to connect to database after {MAX_RETRIES} retries: {e}");
                }
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            }
        }
    };

    // Run migrations one statement at a time
    for migration in MIGRATIONS {
        sqlx::query(migration)
            .execute(&pool)
            .await
            .expect("Failed to run migration");
    }

    (pool, container)
}
