//! Rate-limited collection scheduler.
//!
//! # States
//!
//! ```text
//! IDLE --[due + budget ok]--> COLLECTING --[fetch + compute ok]--> FLUSHING --[persist ok]--> IDLE
//!   |                             |                                   |
//!   +--[budget exhausted]--+      +------------[step failed]----------+
//!                          v                        v
//!                       WAITING <------------- WAITING (backoff) --[failures >= ceiling]--> ERROR
//!                          |
//!                          +--[now >= backoff_until]--> IDLE
//! ```
//!
//! Every transition is written through the [`StateStore`] before the
//! scheduler reports it. A state loaded as COLLECTING or FLUSHING means the
//! previous process died mid-cycle and is counted as a failed attempt.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::budget::{BudgetExhausted, RateBudget};
use crate::cache::{BoundedDataCache, CacheConfig};
use crate::circuit_breaker::{CircuitBreakerConfig, EndpointCircuitBreaker};
use crate::clock::SharedClock;
use crate::config::SchedulerConfig;
use crate::error::AppError;
use crate::export::SnapshotExporter;
use crate::models::{
    CollectorState, DerivedRecord, MarketData, NewScan, ScanOutcome, SchedulerState,
    SchedulerStatus, request_fingerprint,
};
use crate::traits::{ComputePipeline, MarketDataFetcher, RecordStore, StateStore};

/// Summary of a completed collection cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub tickers_ok: u32,
    pub tickers_failed: u32,
    pub cache_hits: u32,
    /// Real upstream attempts made by this cycle.
    pub api_calls: u32,
    pub records_written: u64,
    pub snapshots_exported: usize,
}

/// What a single tick did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// IDLE and the next collection is not due yet.
    NotDue { next_collection_ts: DateTime<Utc> },
    /// WAITING until the backoff deadline.
    BackingOff { until: DateTime<Utc> },
    /// A due cycle did not start because it would exceed a budget.
    Deferred { reason: String, until: DateTime<Utc> },
    Collected(CycleReport),
    /// The cycle failed; `state` is WAITING or ERROR.
    Failed { error: String, state: CollectorState },
    /// ERROR; only an operator reset moves on.
    Halted,
}

/// Result of a manual trigger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TriggerOutcome {
    Completed(CycleReport),
    Failed { error: String, state: CollectorState },
    /// No cycle was attempted and the fetcher was not called.
    Rejected { state: CollectorState, reason: String },
}

/// Why a cycle failed, and whether every cause was permanent.
struct CycleFailure {
    error: AppError,
    permanent_only: bool,
    tickers_ok: u32,
    tickers_failed: u32,
    api_calls: u32,
}

impl CycleFailure {
    fn step(error: AppError, progress: &Progress) -> Self {
        Self {
            error,
            permanent_only: false,
            tickers_ok: progress.tickers_ok,
            tickers_failed: progress.tickers_failed,
            api_calls: progress.api_calls,
        }
    }
}

/// Responses already fresh in the cache when the budget gate passed.
///
/// The cycle uses these instead of re-reading the cache, so an entry that
/// expires mid-cycle cannot add upstream calls the gate never counted.
struct CyclePlan {
    cached: HashMap<String, MarketData>,
    upstream_calls: u32,
}

#[derive(Default)]
struct Progress {
    tickers_ok: u32,
    tickers_failed: u32,
    cache_hits: u32,
    api_calls: u32,
}

/// Single-writer state machine driving collect, persist and export cycles.
pub struct RateLimitedScheduler<F, P, R, S>
where
    F: MarketDataFetcher,
    P: ComputePipeline,
    R: RecordStore,
    S: StateStore,
{
    config: SchedulerConfig,
    fetcher: F,
    pipeline: P,
    records: R,
    store: S,
    breaker: EndpointCircuitBreaker,
    cache: BoundedDataCache<MarketData>,
    exporter: Option<SnapshotExporter>,
    budget: RateBudget,
    clock: SharedClock,
    state: SchedulerState,
}

impl<F, P, R, S> RateLimitedScheduler<F, P, R, S>
where
    F: MarketDataFetcher,
    P: ComputePipeline,
    R: RecordStore,
    S: StateStore,
{
    /// Build a scheduler with a default breaker and cache on `clock`.
    ///
    /// The in-memory state is a default placeholder until
    /// [`recover`](Self::recover) loads the persisted row.
    pub fn new(
        config: SchedulerConfig,
        fetcher: F,
        pipeline: P,
        records: R,
        store: S,
        clock: SharedClock,
    ) -> Self {
        let budget = RateBudget::new(config.budget);
        Self {
            breaker: EndpointCircuitBreaker::new(CircuitBreakerConfig::default(), clock.clone()),
            cache: BoundedDataCache::new(CacheConfig::default(), clock.clone()),
            exporter: None,
            budget,
            config,
            fetcher,
            pipeline,
            records,
            store,
            clock,
            state: SchedulerState::default(),
        }
    }

    pub fn with_breaker(mut self, breaker: EndpointCircuitBreaker) -> Self {
        self.breaker = breaker;
        self
    }

    pub fn with_cache(mut self, cache: BoundedDataCache<MarketData>) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_exporter(mut self, exporter: SnapshotExporter) -> Self {
        self.exporter = Some(exporter);
        self
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn state(&self) -> &SchedulerState {
        &self.state
    }

    pub fn breaker(&self) -> &EndpointCircuitBreaker {
        &self.breaker
    }

    pub fn cache(&self) -> &BoundedDataCache<MarketData> {
        &self.cache
    }

    /// Read-only view for monitoring.
    pub fn status(&self) -> SchedulerStatus {
        SchedulerStatus {
            current_state: self.state.current_state,
            last_collection_ts: self.state.last_collection_ts,
            next_collection_ts: self.state.next_collection_ts,
            api_calls_today: self.state.api_calls_today,
            api_calls_this_hour: self.state.api_calls_this_hour,
            hourly_budget: self.budget.hourly_limit(),
            daily_budget: self.budget.daily_limit(),
            consecutive_failures: self.state.consecutive_failures,
            backoff_until: self.state.backoff_until,
        }
    }

    /// Load the last committed state and settle an interrupted cycle.
    ///
    /// Must run once before the first [`tick`](Self::tick).
    pub async fn recover(&mut self) -> Result<SchedulerStatus, AppError> {
        self.state = self.store.read().await?;
        self.budget.anchor_day(&self.state);
        let now = self.clock.now();
        self.budget.roll_windows(&mut self.state, now);

        if self.state.current_state.is_mid_cycle() {
            let interrupted = self.state.current_state;
            tracing::warn!(
                state = %interrupted,
                consecutive_failures = self.state.consecutive_failures,
                "Previous run stopped mid-cycle, counting it as a failed attempt"
            );
            let error = AppError::InvalidState(format!("cycle interrupted while {interrupted}"));
            self.enter_failure(now, false);
            self.persist().await?;
            self.log_scan(NewScan {
                started_at: self.state.last_collection_ts.unwrap_or(now),
                finished_at: now,
                outcome: ScanOutcome::Abandoned,
                tickers_ok: 0,
                tickers_failed: 0,
                api_calls: 0,
                error: Some(error.to_string()),
            })
            .await;
        } else {
            self.persist().await?;
        }

        tracing::info!(
            state = %self.state.current_state,
            consecutive_failures = self.state.consecutive_failures,
            next_collection_ts = ?self.state.next_collection_ts,
            "Scheduler state recovered"
        );
        Ok(self.status())
    }

    /// Evaluate the state machine once.
    ///
    /// Returns `Err` only when the state store itself cannot be written;
    /// collaborator failures are folded into the returned outcome.
    pub async fn tick(&mut self) -> Result<TickOutcome, AppError> {
        let now = self.clock.now();
        let mut dirty = self.budget.roll_windows(&mut self.state, now);

        match self.state.current_state {
            CollectorState::Error => {
                if dirty {
                    self.persist().await?;
                }
                return Ok(TickOutcome::Halted);
            }
            CollectorState::Collecting | CollectorState::Flushing => {
                // Only reachable if a previous step was abandoned in-process.
                tracing::warn!(state = %self.state.current_state, "Found unfinished cycle on tick");
                self.enter_failure(now, false);
                self.persist().await?;
                return Ok(TickOutcome::Failed {
                    error: "cycle abandoned".to_string(),
                    state: self.state.current_state,
                });
            }
            CollectorState::Waiting => {
                if let Some(until) = self.state.backoff_until
                    && now < until
                {
                    if dirty {
                        self.persist().await?;
                    }
                    return Ok(TickOutcome::BackingOff { until });
                }
                tracing::info!("Backoff elapsed, scheduler idle");
                self.state.current_state = CollectorState::Idle;
                self.state.backoff_until = None;
                dirty = true;
            }
            CollectorState::Idle => {}
        }

        if let Some(next) = self.state.next_collection_ts
            && now < next
        {
            if dirty {
                self.persist().await?;
            }
            return Ok(TickOutcome::NotDue {
                next_collection_ts: next,
            });
        }

        match self.try_cycle(now).await? {
            Ok(report) => Ok(TickOutcome::Collected(report)),
            Err(CycleRefusal::Budget(exhausted)) => Ok(TickOutcome::Deferred {
                reason: exhausted.to_string(),
                until: exhausted.resets_at,
            }),
            Err(CycleRefusal::Failed(error)) => Ok(TickOutcome::Failed {
                error,
                state: self.state.current_state,
            }),
        }
    }

    /// Force an immediate collection attempt.
    ///
    /// Ignores `next_collection_ts` and any failure backoff, but never the
    /// rate budget.
    pub async fn trigger(&mut self) -> Result<TriggerOutcome, AppError> {
        let now = self.clock.now();
        if self.budget.roll_windows(&mut self.state, now) {
            self.persist().await?;
        }

        match self.state.current_state {
            CollectorState::Error => {
                return Ok(TriggerOutcome::Rejected {
                    state: CollectorState::Error,
                    reason: "scheduler is in ERROR, an operator reset is required".to_string(),
                });
            }
            state @ (CollectorState::Collecting | CollectorState::Flushing) => {
                return Ok(TriggerOutcome::Rejected {
                    state,
                    reason: "a collection cycle is already in progress".to_string(),
                });
            }
            CollectorState::Idle | CollectorState::Waiting => {}
        }

        tracing::info!(state = %self.state.current_state, "Manual collection triggered");

        match self.try_cycle(now).await? {
            Ok(report) => Ok(TriggerOutcome::Completed(report)),
            Err(CycleRefusal::Budget(exhausted)) => Ok(TriggerOutcome::Rejected {
                state: CollectorState::Waiting,
                reason: exhausted.to_string(),
            }),
            Err(CycleRefusal::Failed(error)) => Ok(TriggerOutcome::Failed {
                error,
                state: self.state.current_state,
            }),
        }
    }

    /// Operator reset: back to IDLE with a clean failure record.
    ///
    /// The next collection becomes due now, unless one is already scheduled
    /// later; timestamps never move backwards.
    pub async fn reset(&mut self) -> Result<SchedulerStatus, AppError> {
        let now = self.clock.now();
        let previous = self.state.current_state;
        self.budget.roll_windows(&mut self.state, now);
        self.state.current_state = CollectorState::Idle;
        self.state.consecutive_failures = 0;
        self.state.backoff_until = None;
        let due = self.state.next_collection_ts.map_or(now, |t| t.max(now));
        self.state.next_collection_ts = Some(due);
        self.persist().await?;

        tracing::info!(previous = %previous, "Scheduler reset by operator");
        Ok(self.status())
    }

    /// Persist the in-memory state as-is, e.g. on shutdown.
    ///
    /// If a step was abandoned mid-cycle the stored state stays
    /// COLLECTING/FLUSHING, and the next [`recover`](Self::recover) counts
    /// it as a failure.
    pub async fn checkpoint(&mut self) -> Result<(), AppError> {
        self.persist().await
    }

    /// Write the state through, rolling budget windows first so the
    /// `updated_at` stamp always matches the day the counters describe.
    async fn persist(&mut self) -> Result<(), AppError> {
        let now = self.clock.now();
        self.budget.roll_windows(&mut self.state, now);
        self.state.updated_at = Some(now);
        self.store.write(&self.state).await
    }

    /// Budget gate followed by a full cycle.
    ///
    /// The outer `Result` carries state store failures; the inner one says
    /// whether the cycle ran and succeeded.
    async fn try_cycle(
        &mut self,
        now: DateTime<Utc>,
    ) -> Result<Result<CycleReport, CycleRefusal>, AppError> {
        let plan = self.plan_cycle();
        let projected = plan.upstream_calls;
        if let Err(exhausted) = self.budget.check(&self.state, projected, now) {
            tracing::warn!(
                window = %exhausted.window,
                used = exhausted.used,
                projected,
                limit = exhausted.limit,
                resets_at = %exhausted.resets_at,
                "Collection deferred, rate budget exhausted"
            );
            self.state.current_state = CollectorState::Waiting;
            // A pending failure backoff may already reach past the window reset.
            self.state.backoff_until = Some(
                self.state
                    .backoff_until
                    .map_or(exhausted.resets_at, |t| t.max(exhausted.resets_at)),
            );
            self.persist().await?;
            return Ok(Err(CycleRefusal::Budget(exhausted)));
        }

        match self.run_cycle(now, plan).await? {
            Ok(report) => Ok(Ok(report)),
            Err(failure) => {
                let message = failure.error.to_string();
                self.fail_cycle(now, failure).await?;
                Ok(Err(CycleRefusal::Failed(message)))
            }
        }
    }

    /// Take fresh cached responses now; every other ticker needs one
    /// upstream call.
    fn plan_cycle(&self) -> CyclePlan {
        let endpoint = self.fetcher.endpoint();
        let mut cached = HashMap::new();
        let mut upstream_calls = 0;
        for ticker in &self.config.tickers {
            match self.cache.get(&request_fingerprint(endpoint, ticker)) {
                Some(data) => {
                    cached.insert(ticker.clone(), data);
                }
                None => upstream_calls += 1,
            }
        }
        CyclePlan {
            cached,
            upstream_calls,
        }
    }

    async fn run_cycle(
        &mut self,
        started_at: DateTime<Utc>,
        plan: CyclePlan,
    ) -> Result<Result<CycleReport, CycleFailure>, AppError> {
        let previous = self.state.current_state;
        self.state.current_state = CollectorState::Collecting;
        if let Err(e) = self.persist().await {
            self.state.current_state = previous;
            return Err(e);
        }
        tracing::info!(tickers = self.config.tickers.len(), "Collection cycle started");

        let mut progress = Progress::default();
        let mut collected = Vec::with_capacity(self.config.tickers.len());
        let mut errors = Vec::new();

        for ticker in self.config.tickers.clone() {
            if let Some(data) = plan.cached.get(&ticker).cloned() {
                progress.cache_hits += 1;
                progress.tickers_ok += 1;
                tracing::debug!(ticker = %ticker, "Cache hit, skipping upstream call");
                collected.push(data);
                continue;
            }
            match self.fetch_one(&ticker, &mut progress).await {
                Ok(data) => {
                    progress.tickers_ok += 1;
                    collected.push(data);
                }
                Err(e) => {
                    progress.tickers_failed += 1;
                    tracing::warn!(ticker = %ticker, error = %e, "Ticker fetch failed");
                    errors.push(e);
                }
            }
        }

        if collected.is_empty() {
            let permanent_only = !errors.is_empty() && errors.iter().all(AppError::is_permanent);
            let error = errors
                .into_iter()
                .next()
                .unwrap_or_else(|| AppError::Generic("no tickers collected".to_string()));
            return Ok(Err(CycleFailure {
                permanent_only,
                ..CycleFailure::step(error, &progress)
            }));
        }

        let derived = match self.pipeline.compute(&collected, self.clock.now()) {
            Ok(derived) => derived,
            Err(e) => return Ok(Err(CycleFailure::step(e, &progress))),
        };

        self.state.current_state = CollectorState::Flushing;
        if let Err(e) = self.persist().await {
            return Ok(Err(CycleFailure::step(e, &progress)));
        }

        let records_written = match self.records.save_records(&derived).await {
            Ok(n) => n,
            Err(e) => return Ok(Err(CycleFailure::step(e, &progress))),
        };

        let finished_at = self.clock.now();
        self.log_scan(NewScan {
            started_at,
            finished_at,
            outcome: ScanOutcome::Completed,
            tickers_ok: progress.tickers_ok,
            tickers_failed: progress.tickers_failed,
            api_calls: progress.api_calls,
            error: None,
        })
        .await;

        let snapshots_exported = self.export(derived, finished_at).await;

        self.state.current_state = CollectorState::Idle;
        self.state.last_collection_ts = Some(finished_at);
        self.state.consecutive_failures = 0;
        self.state.backoff_until = None;
        self.state.next_collection_ts = Some(self.next_due(finished_at));
        if let Err(e) = self.persist().await {
            return Ok(Err(CycleFailure::step(e, &progress)));
        }

        let report = CycleReport {
            started_at,
            finished_at,
            tickers_ok: progress.tickers_ok,
            tickers_failed: progress.tickers_failed,
            cache_hits: progress.cache_hits,
            api_calls: progress.api_calls,
            records_written,
            snapshots_exported,
        };
        tracing::info!(
            tickers_ok = report.tickers_ok,
            tickers_failed = report.tickers_failed,
            cache_hits = report.cache_hits,
            api_calls = report.api_calls,
            records = report.records_written,
            next_collection_ts = ?self.state.next_collection_ts,
            "Collection cycle completed"
        );
        Ok(Ok(report))
    }

    /// Breaker-guarded, time-bounded upstream call; successes refill the cache.
    async fn fetch_one(
        &mut self,
        ticker: &str,
        progress: &mut Progress,
    ) -> Result<MarketData, AppError> {
        let endpoint = self.fetcher.endpoint().to_string();
        let key = request_fingerprint(&endpoint, ticker);

        let timeout = self.config.fetch_timeout;
        let fetcher = &self.fetcher;
        let mut attempted = false;
        let result = self
            .breaker
            .call(&endpoint, || {
                attempted = true;
                fetch_with_timeout(fetcher, ticker, timeout)
            })
            .await;

        if attempted {
            progress.api_calls += 1;
            self.budget.record_calls(&mut self.state, 1, self.clock.now());
        }

        let data = result?;
        self.cache.put(key, data.clone());
        Ok(data)
    }

    /// Best effort: failures are logged and never undo the committed write.
    async fn export(&self, records: Vec<DerivedRecord>, generated_at: DateTime<Utc>) -> usize {
        let Some(exporter) = self.exporter.clone() else {
            return 0;
        };

        let joined = tokio::task::spawn_blocking(move || {
            exporter.export_records(&records, generated_at)
        })
        .await;

        match joined {
            Ok(Ok(paths)) => paths.len(),
            Ok(Err(e)) => {
                tracing::error!(error = %e, "Snapshot export failed");
                0
            }
            Err(e) => {
                tracing::error!(error = %e, "Snapshot export task panicked");
                0
            }
        }
    }

    async fn fail_cycle(&mut self, now: DateTime<Utc>, failure: CycleFailure) -> Result<(), AppError> {
        self.enter_failure(now, failure.permanent_only);
        tracing::warn!(
            error = %failure.error,
            state = %self.state.current_state,
            consecutive_failures = self.state.consecutive_failures,
            backoff_until = ?self.state.backoff_until,
            "Collection cycle failed"
        );
        self.persist().await?;

        self.log_scan(NewScan {
            started_at: now,
            finished_at: self.clock.now(),
            outcome: ScanOutcome::Failed,
            tickers_ok: failure.tickers_ok,
            tickers_failed: failure.tickers_failed,
            api_calls: failure.api_calls,
            error: Some(failure.error.to_string()),
        })
        .await;
        Ok(())
    }

    /// Count one failure and move to WAITING, or ERROR at the ceiling.
    fn enter_failure(&mut self, now: DateTime<Utc>, permanent_only: bool) {
        self.state.consecutive_failures = self.state.consecutive_failures.saturating_add(1);

        let fail_fast = permanent_only && self.config.fail_fast_on_permanent;
        if fail_fast || self.state.consecutive_failures >= self.config.failure_ceiling {
            self.state.current_state = CollectorState::Error;
            self.state.backoff_until = None;
            tracing::error!(
                consecutive_failures = self.state.consecutive_failures,
                ceiling = self.config.failure_ceiling,
                fail_fast,
                "Scheduler entered ERROR, operator reset required"
            );
        } else {
            self.state.current_state = CollectorState::Waiting;
            self.state.backoff_until =
                Some(now + self.config.backoff.delay_for(self.state.consecutive_failures));
        }
    }

    /// Advance by one interval from the previous slot, never into the past.
    fn next_due(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let interval = chrono::TimeDelta::from_std(self.config.interval)
            .unwrap_or(chrono::TimeDelta::MAX);
        match self.state.next_collection_ts {
            Some(previous) if previous + interval > now => previous + interval,
            _ => now + interval,
        }
    }

    async fn log_scan(&self, scan: NewScan) {
        if let Err(e) = self.records.record_scan(&scan).await {
            tracing::warn!(error = %e, outcome = %scan.outcome, "Failed to record scan history");
        }
    }
}

enum CycleRefusal {
    Budget(BudgetExhausted),
    Failed(String),
}

async fn fetch_with_timeout<F: MarketDataFetcher>(
    fetcher: &F,
    ticker: &str,
    timeout: Duration,
) -> Result<MarketData, AppError> {
    tokio::time::timeout(timeout, fetcher.fetch(ticker))
        .await
        .map_err(|_| AppError::Timeout(timeout.as_secs().max(1)))?
}
