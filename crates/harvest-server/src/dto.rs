use chrono::{DateTime, Utc};
use serde::Serialize;

use harvest_core::{CircuitBreakerStats, CycleReport, SchedulerStatus, TriggerOutcome};

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct SchedulerStatusResponse {
    /// One of IDLE, COLLECTING, FLUSHING, WAITING, ERROR
    pub current_state: String,
    pub last_collection_ts: Option<DateTime<Utc>>,
    pub next_collection_ts: Option<DateTime<Utc>>,
    pub api_calls_today: u32,
    pub api_calls_this_hour: u32,
    pub hourly_budget: u32,
    pub daily_budget: u32,
    pub consecutive_failures: u32,
    pub backoff_until: Option<DateTime<Utc>>,
}

impl From<SchedulerStatus> for SchedulerStatusResponse {
    fn from(s: SchedulerStatus) -> Self {
        Self {
            current_state: s.current_state.to_string(),
            last_collection_ts: s.last_collection_ts,
            next_collection_ts: s.next_collection_ts,
            api_calls_today: s.api_calls_today,
            api_calls_this_hour: s.api_calls_this_hour,
            hourly_budget: s.hourly_budget,
            daily_budget: s.daily_budget,
            consecutive_failures: s.consecutive_failures,
            backoff_until: s.backoff_until,
        }
    }
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct CycleReportResponse {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub tickers_ok: u32,
    pub tickers_failed: u32,
    pub cache_hits: u32,
    pub api_calls: u32,
    pub records_written: u64,
    pub snapshots_exported: usize,
}

impl From<CycleReport> for CycleReportResponse {
    fn from(r: CycleReport) -> Self {
        Self {
            started_at: r.started_at,
            finished_at: r.finished_at,
            tickers_ok: r.tickers_ok,
            tickers_failed: r.tickers_failed,
            cache_hits: r.cache_hits,
            api_calls: r.api_calls,
            records_written: r.records_written,
            snapshots_exported: r.snapshots_exported,
        }
    }
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct TriggerResponse {
    /// completed, failed or rejected
    pub outcome: String,
    /// Scheduler state after the trigger was handled
    pub state: String,
    pub report: Option<CycleReportResponse>,
    /// Failure cause or rejection reason
    pub message: Option<String>,
}

impl TriggerResponse {
    pub fn from_outcome(outcome: TriggerOutcome, status: &SchedulerStatus) -> Self {
        match outcome {
            TriggerOutcome::Completed(report) => Self {
                outcome: "completed".to_string(),
                state: status.current_state.to_string(),
                report: Some(report.into()),
                message: None,
            },
            TriggerOutcome::Failed { error, state } => Self {
                outcome: "failed".to_string(),
                state: state.to_string(),
                report: None,
                message: Some(error),
            },
            TriggerOutcome::Rejected { state, reason } => Self {
                outcome: "rejected".to_string(),
                state: state.to_string(),
                report: None,
                message: Some(reason),
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Circuit breakers
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct BreakerResponse {
    pub endpoint: String,
    /// closed, open or half-open
    pub state: String,
    pub consecutive_failures: u32,
    pub opened_at: Option<DateTime<Utc>>,
    pub next_probe_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl From<CircuitBreakerStats> for BreakerResponse {
    fn from(s: CircuitBreakerStats) -> Self {
        Self {
            endpoint: s.endpoint,
            state: s.state.to_string(),
            consecutive_failures: s.consecutive_failures,
            opened_at: s.opened_at,
            next_probe_at: s.next_probe_at,
            last_error: s.last_error,
        }
    }
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct BreakerListResponse {
    pub breakers: Vec<BreakerResponse>,
    pub total: usize,
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct HealthResponse {
    pub status: &'static str,
    /// ok, error or disabled
    pub database: &'static str,
    pub scheduler: String,
    pub api_calls_this_hour: u32,
    pub api_calls_today: u32,
    pub consecutive_failures: u32,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}
