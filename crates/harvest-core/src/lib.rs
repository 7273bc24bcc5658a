pub mod budget;
pub mod cache;
pub mod circuit_breaker;
pub mod clock;
pub mod config;
pub mod error;
pub mod export;
pub mod models;
pub mod runner;
pub mod scheduler;
pub mod traits;

#[cfg(any(test, feature = "testutil"))]
pub mod testutil;

pub use budget::{BudgetExhausted, BudgetWindow, RateBudget};
pub use cache::{BoundedDataCache, CacheConfig};
pub use circuit_breaker::{
    CircuitBreakerConfig, CircuitBreakerStats, CircuitState, EndpointCircuitBreaker,
};
pub use clock::{Clock, SharedClock, SystemClock, system_clock};
pub use config::{BackoffConfig, BudgetConfig, SchedulerConfig, parse_tickers};
pub use error::AppError;
pub use export::{ExportConfig, SnapshotExporter, SnapshotReader};
pub use models::{
    CollectorState, DerivedRecord, ExportSnapshot, MarketData, NewScan, ScanOutcome, ScanRecord,
    SchedulerState, SchedulerStatus, compute_hash, request_fingerprint,
};
pub use runner::{
    SchedulerEvent, SchedulerHandle, SchedulerReporter, SchedulerRunner, TracingSchedulerReporter,
};
pub use scheduler::{CycleReport, RateLimitedScheduler, TickOutcome, TriggerOutcome};
pub use traits::{ComputePipeline, MarketDataFetcher, PassthroughPipeline, RecordStore, StateStore};
