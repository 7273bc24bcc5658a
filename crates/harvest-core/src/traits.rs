use std::future::Future;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::AppError;
use crate::models::{DerivedRecord, MarketData, NewScan, ScanRecord, SchedulerState};

/// Fetches raw market data for a ticker from an upstream endpoint.
///
/// Implementations must bound every call with a timeout. Errors are
/// classified through [`AppError::is_retryable`] and [`AppError::is_permanent`].
pub trait MarketDataFetcher: Send + Sync + Clone {
    /// Logical upstream endpoint name, used as the circuit breaker key.
    fn endpoint(&self) -> &str;

    fn fetch(&self, ticker: &str) -> impl Future<Output = Result<MarketData, AppError>> + Send;
}

/// Transforms fetched market data into derived records to persist.
pub trait ComputePipeline: Send + Sync + Clone {
    /// `computed_at` comes from the scheduler's clock.
    fn compute(
        &self,
        data: &[MarketData],
        computed_at: DateTime<Utc>,
    ) -> Result<Vec<DerivedRecord>, AppError>;
}

/// Durable storage for derived records and scan history.
///
/// The scheduler is the only writer during normal operation.
pub trait RecordStore: Send + Sync + Clone {
    /// Persist derived records. Returns the number of rows written.
    fn save_records(
        &self,
        records: &[DerivedRecord],
    ) -> impl Future<Output = Result<u64, AppError>> + Send;

    /// Append one scan-history row.
    fn record_scan(&self, scan: &NewScan) -> impl Future<Output = Result<Uuid, AppError>> + Send;

    /// Most recent scans, newest first.
    fn recent_scans(
        &self,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<ScanRecord>, AppError>> + Send;
}

/// Durable single-row checkpoint of [`SchedulerState`].
pub trait StateStore: Send + Sync + Clone {
    /// Last committed state. Missing or unparseable rows yield
    /// `SchedulerState::default()`; only I/O failures are errors.
    fn read(&self) -> impl Future<Output = Result<SchedulerState, AppError>> + Send;

    /// Atomic upsert of the singleton row.
    fn write(&self, state: &SchedulerState) -> impl Future<Output = Result<(), AppError>> + Send;
}

/// Pipeline that wraps each raw payload as one record of a single dataset.
#[derive(Debug, Clone)]
pub struct PassthroughPipeline {
    dataset: String,
}

impl PassthroughPipeline {
    pub fn new(dataset: impl Into<String>) -> Self {
        Self {
            dataset: dataset.into(),
        }
    }
}

impl ComputePipeline for PassthroughPipeline {
    fn compute(
        &self,
        data: &[MarketData],
        computed_at: DateTime<Utc>,
    ) -> Result<Vec<DerivedRecord>, AppError> {
        Ok(data
            .iter()
            .map(|d| DerivedRecord {
                dataset: self.dataset.clone(),
                ticker: d.ticker.clone(),
                payload: d.payload.clone(),
                computed_at,
            })
            .collect())
    }
}
