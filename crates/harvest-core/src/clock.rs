//! Time source shared by every deadline-driven component.
//!
//! The scheduler, circuit breaker and cache never sleep on their own
//! deadlines. They compare stored timestamps against [`Clock::now`] on each
//! call, so tests drive them by advancing a manual clock.

use std::sync::Arc;

use chrono::{DateTime, Utc};

/// Source of the current wall-clock time.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Clock backed by the system time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Shared handle to a clock implementation.
pub type SharedClock = Arc<dyn Clock>;

/// Returns a shared [`SystemClock`].
pub fn system_clock() -> SharedClock {
    Arc::new(SystemClock)
}
