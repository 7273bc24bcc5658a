//! Test utilities: mock implementations of all core traits.
//!
//! Handwritten mocks for dependency injection in unit tests.
//! All mocks use `Arc<Mutex<_>>` for interior mutability, allowing
//! test assertions on recorded calls.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, TimeZone, Utc};
use uuid::Uuid;

use crate::clock::{Clock, SharedClock};
use crate::error::AppError;
use crate::models::{DerivedRecord, MarketData, NewScan, ScanRecord, SchedulerState};
use crate::runner::{SchedulerEvent, SchedulerReporter};
use crate::traits::{
    ComputePipeline, MarketDataFetcher, PassthroughPipeline, RecordStore, StateStore,
};

// ---------------------------------------------------------------------------
// ManualClock
// ---------------------------------------------------------------------------

/// Clock that only moves when a test moves it.
#[derive(Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl Default for ManualClock {
    /// Starts at 2026-01-05 12:00:00 UTC.
    fn default() -> Self {
        Self::at(Utc.with_ymd_and_hms(2026, 1, 5, 12, 0, 0).unwrap())
    }
}

impl ManualClock {
    pub fn at(now: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(now)),
        }
    }

    /// Shared handle observing this clock.
    pub fn shared(&self) -> SharedClock {
        Arc::new(self.clone())
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock().unwrap() = now;
    }

    pub fn advance(&self, delta: TimeDelta) {
        *self.now.lock().unwrap() += delta;
    }

    pub fn advance_secs(&self, secs: i64) {
        self.advance(TimeDelta::seconds(secs));
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}

// ---------------------------------------------------------------------------
// MockFetcher
// ---------------------------------------------------------------------------

/// Mock fetcher with queued responses and a call log.
///
/// `fetched_at` comes from its own [`ManualClock`]; share the scheduler's
/// clock with [`with_clock`](Self::with_clock) and simulate upstream latency
/// with [`advancing`](Self::advancing).
#[derive(Clone)]
pub struct MockFetcher {
    endpoint: String,
    clock: ManualClock,
    step: TimeDelta,
    /// Queue of responses. Each call pops the first element.
    /// If empty, falls back to `failure` or a default payload.
    responses: Arc<Mutex<Vec<Result<serde_json::Value, AppError>>>>,
    failure: Arc<Mutex<Option<fn() -> AppError>>>,
    delay: Option<Duration>,
    pub calls: Arc<Mutex<Vec<String>>>,
}

impl MockFetcher {
    /// Fetcher that always succeeds with `{"ticker": ..., "last": 100.0}`.
    pub fn ok() -> Self {
        Self {
            endpoint: "market-data".to_string(),
            clock: ManualClock::default(),
            step: TimeDelta::zero(),
            responses: Arc::new(Mutex::new(Vec::new())),
            failure: Arc::new(Mutex::new(None)),
            delay: None,
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Fetcher whose every call fails with `make()`.
    pub fn failing(make: fn() -> AppError) -> Self {
        let fetcher = Self::ok();
        fetcher.set_failure(Some(make));
        fetcher
    }

    pub fn with_responses(responses: Vec<Result<serde_json::Value, AppError>>) -> Self {
        let fetcher = Self::ok();
        *fetcher.responses.lock().unwrap() = responses;
        fetcher
    }

    pub fn with_endpoint(mut self, endpoint: &str) -> Self {
        self.endpoint = endpoint.to_string();
        self
    }

    pub fn with_clock(mut self, clock: ManualClock) -> Self {
        self.clock = clock;
        self
    }

    /// Move the clock forward by `step` on every call.
    pub fn advancing(mut self, step: TimeDelta) -> Self {
        self.step = step;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Switch the fallback behaviour once the response queue is drained.
    pub fn set_failure(&self, make: Option<fn() -> AppError>) {
        *self.failure.lock().unwrap() = make;
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

impl MarketDataFetcher for MockFetcher {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn fetch(&self, ticker: &str) -> Result<MarketData, AppError> {
        self.calls.lock().unwrap().push(ticker.to_string());
        self.clock.advance(self.step);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let next = {
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                None
            } else {
                Some(responses.remove(0))
            }
        };

        let payload = match next {
            Some(result) => result?,
            None => match *self.failure.lock().unwrap() {
                Some(make) => return Err(make()),
                None => serde_json::json!({"ticker": ticker, "last": 100.0}),
            },
        };

        Ok(MarketData {
            ticker: ticker.to_string(),
            payload,
            fetched_at: self.clock.now(),
        })
    }
}

// ---------------------------------------------------------------------------
// MockPipeline
// ---------------------------------------------------------------------------

/// Passthrough pipeline for the `quotes` dataset that can be told to fail.
#[derive(Clone)]
pub struct MockPipeline {
    inner: PassthroughPipeline,
    error: Arc<Mutex<Option<AppError>>>,
    pub inputs: Arc<Mutex<Vec<usize>>>,
}

impl MockPipeline {
    pub fn passthrough() -> Self {
        Self {
            inner: PassthroughPipeline::new("quotes"),
            error: Arc::new(Mutex::new(None)),
            inputs: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Creates a pipeline whose next compute returns an error.
    pub fn with_error(error: AppError) -> Self {
        let pipeline = Self::passthrough();
        *pipeline.error.lock().unwrap() = Some(error);
        pipeline
    }
}

impl ComputePipeline for MockPipeline {
    fn compute(
        &self,
        data: &[MarketData],
        computed_at: DateTime<Utc>,
    ) -> Result<Vec<DerivedRecord>, AppError> {
        self.inputs.lock().unwrap().push(data.len());
        if let Some(e) = self.error.lock().unwrap().take() {
            return Err(e);
        }
        self.inner.compute(data, computed_at)
    }
}

// ---------------------------------------------------------------------------
// MemoryStateStore
// ---------------------------------------------------------------------------

/// In-memory singleton state row with a write log.
#[derive(Clone, Default)]
pub struct MemoryStateStore {
    row: Arc<Mutex<Option<SchedulerState>>>,
    pub writes: Arc<Mutex<Vec<SchedulerState>>>,
    write_error: Arc<Mutex<Option<AppError>>>,
}

impl MemoryStateStore {
    /// Empty store: no row committed yet.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Store with a previously committed row (for recovery tests).
    pub fn with_state(state: SchedulerState) -> Self {
        let store = Self::default();
        *store.row.lock().unwrap() = Some(state);
        store
    }

    /// Make the next write fail with `error`.
    pub fn fail_next_write(&self, error: AppError) {
        *self.write_error.lock().unwrap() = Some(error);
    }

    /// The committed row, if any.
    pub fn current(&self) -> Option<SchedulerState> {
        self.row.lock().unwrap().clone()
    }

    pub fn write_count(&self) -> usize {
        self.writes.lock().unwrap().len()
    }
}

impl StateStore for MemoryStateStore {
    async fn read(&self) -> Result<SchedulerState, AppError> {
        Ok(self.row.lock().unwrap().clone().unwrap_or_default())
    }

    async fn write(&self, state: &SchedulerState) -> Result<(), AppError> {
        if let Some(e) = self.write_error.lock().unwrap().take() {
            return Err(e);
        }
        *self.row.lock().unwrap() = Some(state.clone());
        self.writes.lock().unwrap().push(state.clone());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MemoryRecordStore
// ---------------------------------------------------------------------------

/// Record store that keeps derived records and scans in memory.
#[derive(Clone, Default)]
pub struct MemoryRecordStore {
    pub records: Arc<Mutex<Vec<DerivedRecord>>>,
    pub scans: Arc<Mutex<Vec<ScanRecord>>>,
    save_error: Arc<Mutex<Option<AppError>>>,
}

impl MemoryRecordStore {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Store that returns an error on the next save.
    pub fn with_save_error(error: AppError) -> Self {
        let store = Self::default();
        *store.save_error.lock().unwrap() = Some(error);
        store
    }

    pub fn scans(&self) -> Vec<ScanRecord> {
        self.scans.lock().unwrap().clone()
    }
}

impl RecordStore for MemoryRecordStore {
    async fn save_records(&self, records: &[DerivedRecord]) -> Result<u64, AppError> {
        if let Some(e) = self.save_error.lock().unwrap().take() {
            return Err(e);
        }
        self.records.lock().unwrap().extend_from_slice(records);
        Ok(records.len() as u64)
    }

    async fn record_scan(&self, scan: &NewScan) -> Result<Uuid, AppError> {
        let id = Uuid::new_v4();
        self.scans.lock().unwrap().push(ScanRecord {
            id,
            started_at: scan.started_at,
            finished_at: scan.finished_at,
            outcome: scan.outcome,
            tickers_ok: scan.tickers_ok,
            tickers_failed: scan.tickers_failed,
            api_calls: scan.api_calls,
            error: scan.error.clone(),
        });
        Ok(id)
    }

    async fn recent_scans(&self, limit: usize) -> Result<Vec<ScanRecord>, AppError> {
        let scans = self.scans.lock().unwrap();
        Ok(scans.iter().rev().take(limit).cloned().collect())
    }
}

// ---------------------------------------------------------------------------
// MockReporter
// ---------------------------------------------------------------------------

/// Mock scheduler reporter that records event labels.
#[derive(Default)]
pub struct MockReporter {
    pub events: Arc<Mutex<Vec<String>>>,
}

impl MockReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn labels(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }
}

impl SchedulerReporter for MockReporter {
    fn report(&self, event: SchedulerEvent<'_>) {
        let label = match &event {
            SchedulerEvent::Started => "Started",
            SchedulerEvent::Recovered { .. } => "Recovered",
            SchedulerEvent::Ticked { .. } => "Ticked",
            SchedulerEvent::TickFailed { .. } => "TickFailed",
            SchedulerEvent::Triggered { .. } => "Triggered",
            SchedulerEvent::Reset { .. } => "Reset",
            SchedulerEvent::StepAbandoned => "StepAbandoned",
            SchedulerEvent::ShuttingDown { .. } => "ShuttingDown",
            SchedulerEvent::Stopped => "Stopped",
        };
        self.events.lock().unwrap().push(label.to_string());
    }
}

// ---------------------------------------------------------------------------
// Test helpers
// ---------------------------------------------------------------------------

pub fn network_error() -> AppError {
    AppError::NetworkError("connection refused".to_string())
}

pub fn malformed_error() -> AppError {
    AppError::MalformedResponse("missing field `last`".to_string())
}
