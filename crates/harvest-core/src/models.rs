use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Lifecycle state of the collection scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CollectorState {
    #[default]
    Idle,
    Collecting,
    Flushing,
    Waiting,
    /// Terminal until an operator reset.
    Error,
}

impl CollectorState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CollectorState::Idle => "IDLE",
            CollectorState::Collecting => "COLLECTING",
            CollectorState::Flushing => "FLUSHING",
            CollectorState::Waiting => "WAITING",
            CollectorState::Error => "ERROR",
        }
    }

    /// True while a cycle is in flight. Seeing this on startup means the
    /// previous process died mid-cycle.
    pub fn is_mid_cycle(&self) -> bool {
        matches!(self, CollectorState::Collecting | CollectorState::Flushing)
    }
}

impl fmt::Display for CollectorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for CollectorState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "IDLE" => Ok(CollectorState::Idle),
            "COLLECTING" => Ok(CollectorState::Collecting),
            "FLUSHING" => Ok(CollectorState::Flushing),
            "WAITING" => Ok(CollectorState::Waiting),
            "ERROR" => Ok(CollectorState::Error),
            _ => Err(format!("Unknown collector state: {}", s)),
        }
    }
}

/// Durable checkpoint of the scheduler. Exactly one logical row exists.
///
/// The field set is a stable contract shared with the state table and any
/// monitoring that reads it.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SchedulerState {
    pub current_state: CollectorState,
    pub last_collection_ts: Option<DateTime<Utc>>,
    /// `None` means a collection is due immediately.
    pub next_collection_ts: Option<DateTime<Utc>>,
    pub api_calls_today: u32,
    pub api_calls_this_hour: u32,
    pub hour_window_start: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub backoff_until: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Read-only view of the scheduler for health and monitoring endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SchedulerStatus {
    pub current_state: CollectorState,
    pub last_collection_ts: Option<DateTime<Utc>>,
    pub next_collection_ts: Option<DateTime<Utc>>,
    pub api_calls_today: u32,
    pub api_calls_this_hour: u32,
    pub hourly_budget: u32,
    pub daily_budget: u32,
    pub consecutive_failures: u32,
    pub backoff_until: Option<DateTime<Utc>>,
}

/// Raw payload returned by the market data fetcher for one ticker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketData {
    pub ticker: String,
    pub payload: serde_json::Value,
    pub fetched_at: DateTime<Utc>,
}

/// A record produced by the compute pipeline, persisted and exported per dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DerivedRecord {
    pub dataset: String,
    pub ticker: String,
    pub payload: serde_json::Value,
    pub computed_at: DateTime<Utc>,
}

/// How a collection cycle ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanOutcome {
    Completed,
    Failed,
    /// Interrupted by a crash or shutdown; counted as a failure on restart.
    Abandoned,
}

impl ScanOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScanOutcome::Completed => "completed",
            ScanOutcome::Failed => "failed",
            ScanOutcome::Abandoned => "abandoned",
        }
    }
}

impl fmt::Display for ScanOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ScanOutcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "completed" => Ok(ScanOutcome::Completed),
            "failed" => Ok(ScanOutcome::Failed),
            "abandoned" => Ok(ScanOutcome::Abandoned),
            _ => Err(format!("Unknown scan outcome: {}", s)),
        }
    }
}

/// DTO for inserting a scan-history row.
#[derive(Debug, Clone, Serialize)]
pub struct NewScan {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: ScanOutcome,
    pub tickers_ok: u32,
    pub tickers_failed: u32,
    pub api_calls: u32,
    pub error: Option<String>,
}

/// A persisted scan-history row.
#[derive(Debug, Clone, Serialize)]
pub struct ScanRecord {
    pub id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: ScanOutcome,
    pub tickers_ok: u32,
    pub tickers_failed: u32,
    pub api_calls: u32,
    pub error: Option<String>,
}

/// Published snapshot document. Readers see either the previous complete
/// document or the new one, never a partial write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportSnapshot {
    pub dataset_name: String,
    pub generated_at: DateTime<Utc>,
    pub payload: serde_json::Value,
}

/// Compute a SHA-256 hash of a string, returned as 64-char hex.
pub fn compute_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Cache key for an upstream request: endpoint + normalised ticker.
pub fn request_fingerprint(endpoint: &str, ticker: &str) -> String {
    compute_hash(&format!("{}|{}", endpoint, ticker.trim().to_uppercase()))
}
