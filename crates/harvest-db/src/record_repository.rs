use chrono::{DateTime, Utc};
use harvest_core::error::AppError;
use harvest_core::models::{DerivedRecord, NewScan, ScanOutcome, ScanRecord};
use harvest_core::traits::RecordStore;
use sqlx::{PgPool, Pool, Postgres};
use uuid::Uuid;

/// Repository for derived records and scan history in PostgreSQL.
#[derive(Clone)]
pub struct RecordRepository {
    pool: Pool<Postgres>,
}

impl RecordRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Insert derived records in one transaction. Returns the number written.
    pub async fn save_records(&self, records: &[DerivedRecord]) -> Result<u64, AppError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        let mut written = 0u64;
        for record in records {
            let result = sqlx::query(
                r#"
                INSERT INTO derived_records (dataset, ticker, payload, computed_at)
                VALUES ($1, $2, $3, $4)
                "#,
            )
            .bind(&record.dataset)
            .bind(&record.ticker)
            .bind(&record.payload)
            .bind(record.computed_at)
            .execute(&mut *tx)
            .await
            .map_err(|e| AppError::DatabaseError(e.to_string()))?;
            written += result.rows_affected();
        }

        tx.commit()
            .await
            .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        Ok(written)
    }

    /// Most recent record per ticker for a dataset.
    pub async fn latest_records(&self, dataset: &str) -> Result<Vec<DerivedRecord>, AppError> {
        let rows = sqlx::query_as::<_, DerivedRecordRow>(
            r#"
            SELECT DISTINCT ON (ticker) dataset, ticker, payload, computed_at
            FROM derived_records
            WHERE dataset = $1
            ORDER BY ticker, computed_at DESC
            "#,
        )
        .bind(dataset)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    /// Append one scan-history row. Returns the generated UUID.
    pub async fn record_scan(&self, scan: &NewScan) -> Result<Uuid, AppError> {
        let row: (Uuid,) = sqlx::query_as(
            r#"
            INSERT INTO scan_history (started_at, finished_at, outcome, tickers_ok, tickers_failed, api_calls, error)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING id
            "#,
        )
        .bind(scan.started_at)
        .bind(scan.finished_at)
        .bind(scan.outcome.as_str())
        .bind(scan.tickers_ok as i32)
        .bind(scan.tickers_failed as i32)
        .bind(scan.api_calls as i32)
        .bind(&scan.error)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        Ok(row.0)
    }

    /// Scan history, newest first.
    pub async fn recent_scans(&self, limit: usize) -> Result<Vec<ScanRecord>, AppError> {
        let rows = sqlx::query_as::<_, ScanRow>(
            r#"
            SELECT id, started_at, finished_at, outcome, tickers_ok, tickers_failed, api_calls, error
            FROM scan_history
            ORDER BY started_at DESC
            LIMIT $1
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        Ok(rows.into_iter().map(Into::into).collect())
    }
}

// -- Internal row types for sqlx deserialization --

#[derive(sqlx::FromRow)]
struct DerivedRecordRow {
    dataset: String,
    ticker: String,
    payload: serde_json::Value,
    computed_at: DateTime<Utc>,
}

impl From<DerivedRecordRow> for DerivedRecord {
    fn from(row: DerivedRecordRow) -> Self {
        DerivedRecord {
            dataset: row.dataset,
            ticker: row.ticker,
            payload: row.payload,
            computed_at: row.computed_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct ScanRow {
    id: Uuid,
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
    outcome: String,
    tickers_ok: i32,
    tickers_failed: i32,
    api_calls: i32,
    error: Option<String>,
}

impl From<ScanRow> for ScanRecord {
    fn from(row: ScanRow) -> Self {
        ScanRecord {
            id: row.id,
            started_at: row.started_at,
            finished_at: row.finished_at,
            outcome: row.outcome.parse().unwrap_or(ScanOutcome::Failed),
            tickers_ok: row.tickers_ok.max(0) as u32,
            tickers_failed: row.tickers_failed.max(0) as u32,
            api_calls: row.api_calls.max(0) as u32,
            error: row.error,
        }
    }
}

// -- Trait implementation --

impl RecordStore for RecordRepository {
    async fn save_records(&self, records: &[DerivedRecord]) -> Result<u64, AppError> {
        RecordRepository::save_records(self, records).await
    }

    async fn record_scan(&self, scan: &NewScan) -> Result<Uuid, AppError> {
        RecordRepository::record_scan(self, scan).await
    }

    async fn recent_scans(&self, limit: usize) -> Result<Vec<ScanRecord>, AppError> {
        RecordRepository::recent_scans(self, limit).await
    }
}
