//! Upstream call budget: a rolling hour window and a UTC-day window.
//!
//! Counters live in [`SchedulerState`] so they survive restarts. The hour
//! window starts at `hour_window_start` and resets once it is an hour old.
//! The day window is anchored in memory to the UTC date the daily counter
//! belongs to. It is seeded from `updated_at` when state is loaded and
//! resets once the clock reaches a later date, so writes stamped after
//! midnight never carry yesterday's count into the new day.

use std::fmt;

use chrono::{DateTime, Days, NaiveDate, TimeDelta, Utc};

use crate::config::BudgetConfig;
use crate::models::SchedulerState;

/// Which budget window blocked a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetWindow {
    Hourly,
    Daily,
}

impl fmt::Display for BudgetWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BudgetWindow::Hourly => write!(f, "hourly"),
            BudgetWindow::Daily => write!(f, "daily"),
        }
    }
}

/// A cycle was refused because it would exceed a budget.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BudgetExhausted {
    pub window: BudgetWindow,
    pub used: u32,
    pub projected: u32,
    pub limit: u32,
    /// Earliest moment every blocking window has reset.
    pub resets_at: DateTime<Utc>,
}

impl fmt::Display for BudgetExhausted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} budget exhausted: {} used + {} projected > {} (resets at {})",
            self.window,
            self.used,
            self.projected,
            self.limit,
            self.resets_at.to_rfc3339()
        )
    }
}

/// Budget rules applied to a [`SchedulerState`].
#[derive(Debug, Clone)]
pub struct RateBudget {
    config: BudgetConfig,
    /// UTC date that `api_calls_today` counts.
    counted_day: Option<NaiveDate>,
}

impl RateBudget {
    pub fn new(config: BudgetConfig) -> Self {
        Self {
            config,
            counted_day: None,
        }
    }

    /// Re-seed the day anchor from freshly loaded state.
    pub fn anchor_day(&mut self, state: &SchedulerState) {
        self.counted_day = state.updated_at.map(|t| t.date_naive());
    }

    pub fn counted_day(&self) -> Option<NaiveDate> {
        self.counted_day
    }

    pub fn hourly_limit(&self) -> u32 {
        self.config.hourly
    }

    pub fn daily_limit(&self) -> u32 {
        self.config.daily
    }

    /// Reset counters whose window has elapsed. Returns true if the state changed.
    pub fn roll_windows(&mut self, state: &mut SchedulerState, now: DateTime<Utc>) -> bool {
        let mut changed = false;

        match state.hour_window_start {
            Some(start) if now - start < TimeDelta::hours(1) => {}
            Some(_) => {
                state.api_calls_this_hour = 0;
                state.hour_window_start = Some(now);
                changed = true;
            }
            None => {
                state.hour_window_start = Some(now);
                changed = true;
            }
        }

        let today = now.date_naive();
        let counted = *self
            .counted_day
            .get_or_insert_with(|| state.updated_at.map_or(today, |t| t.date_naive()));
        if counted < today {
            self.counted_day = Some(today);
            if state.api_calls_today != 0 {
                state.api_calls_today = 0;
                changed = true;
            }
        }

        changed
    }

    /// Check whether `projected` more calls fit both windows.
    ///
    /// Call [`roll_windows`](Self::roll_windows) first so stale counters do
    /// not block a cycle.
    pub fn check(
        &self,
        state: &SchedulerState,
        projected: u32,
        now: DateTime<Utc>,
    ) -> Result<(), BudgetExhausted> {
        let hourly_over = state.api_calls_this_hour.saturating_add(projected) > self.config.hourly;
        let daily_over = state.api_calls_today.saturating_add(projected) > self.config.daily;

        let hour_reset = hour_window_end(state, now);
        let day_reset = next_utc_midnight(now);

        match (hourly_over, daily_over) {
            (false, false) => Ok(()),
            (true, false) => Err(BudgetExhausted {
                window: BudgetWindow::Hourly,
                used: state.api_calls_this_hour,
                projected,
                limit: self.config.hourly,
                resets_at: hour_reset,
            }),
            (_, true) => Err(BudgetExhausted {
                window: BudgetWindow::Daily,
                used: state.api_calls_today,
                projected,
                limit: self.config.daily,
                resets_at: if hourly_over {
                    day_reset.max(hour_reset)
                } else {
                    day_reset
                },
            }),
        }
    }

    /// Count `calls` real upstream attempts against both windows, rolling
    /// them first so calls made after a boundary land in the new window.
    pub fn record_calls(&mut self, state: &mut SchedulerState, calls: u32, now: DateTime<Utc>) {
        self.roll_windows(state, now);
        state.api_calls_this_hour = state.api_calls_this_hour.saturating_add(calls);
        state.api_calls_today = state.api_calls_today.saturating_add(calls);
    }
}

/// End of the current hour window.
pub fn hour_window_end(state: &SchedulerState, now: DateTime<Utc>) -> DateTime<Utc> {
    state.hour_window_start.unwrap_or(now) + TimeDelta::hours(1)
}

/// The next UTC midnight strictly after `now`.
pub fn next_utc_midnight(now: DateTime<Utc>) -> DateTime<Utc> {
    now.date_naive()
        .checked_add_days(Days::new(1))
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
        .unwrap_or(now + TimeDelta::days(1))
}
