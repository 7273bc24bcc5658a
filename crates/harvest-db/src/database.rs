use harvest_core::AppError;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

use crate::config::DatabaseConfig;
use crate::lease::WriterLease;
use crate::record_repository::RecordRepository;
use crate::state_store::PgStateStore;

/// Central database facade. Owns the connection pool, runs migrations,
/// and vends the state store and record repository.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Connect to PostgreSQL with the given configuration.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, AppError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.acquire_timeout)
            .connect(&config.url)
            .await
            .map_err(|e| AppError::DatabaseError(format!("Failed to connect: {e}")))?;

        Ok(Self { pool })
    }

    /// Create a `Database` from an existing pool (useful for testing).
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run all pending migrations.
    pub async fn migrate(&self) -> Result<(), AppError> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(format!("Migration failed: {e}")))?;
        Ok(())
    }

    /// The singleton scheduler checkpoint.
    pub fn state_store(&self) -> PgStateStore {
        PgStateStore::new(self.pool.clone())
    }

    /// Derived records and scan history.
    pub fn record_repo(&self) -> RecordRepository {
        RecordRepository::new(self.pool.clone())
    }

    /// Take the single-writer lease. Hold it for as long as a scheduler
    /// runs against this database.
    pub async fn try_writer_lease(&self) -> Result<WriterLease, AppError> {
        WriterLease::try_acquire(&self.pool).await
    }

    /// Check database connectivity.
    pub async fn health_check(&self) -> Result<(), AppError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(e.to_string()))?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}
