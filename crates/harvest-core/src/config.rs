use std::str::FromStr;
use std::time::Duration;

use chrono::TimeDelta;

use crate::error::AppError;

/// Parse an optional environment variable, falling back to `default` when unset.
pub(crate) fn env_parse<T: FromStr>(key: &str, default: T) -> Result<T, AppError> {
    match std::env::var(key) {
        Err(_) => Ok(default),
        Ok(raw) => raw.trim().parse().map_err(|_| {
            AppError::ConfigError(format!("Invalid {key} '{raw}': could not parse value"))
        }),
    }
}

/// Exponential backoff applied after failed cycles.
///
/// Delay for the n-th consecutive failure is `base * 2^(n-1)`, capped at `max`.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    pub base: Duration,
    pub max: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(30),
            max: Duration::from_secs(30 * 60),
        }
    }
}

impl BackoffConfig {
    /// Delay after `consecutive_failures` failures. Never zero once a failure
    /// has been recorded, non-decreasing in its argument, capped at `max`.
    pub fn delay_for(&self, consecutive_failures: u32) -> TimeDelta {
        let exponent = consecutive_failures.saturating_sub(1).min(31);
        let factor = 1u32 << exponent;
        let delay = self
            .base
            .checked_mul(factor)
            .unwrap_or(self.max)
            .min(self.max)
            .max(Duration::from_secs(1));
        TimeDelta::from_std(delay).unwrap_or(TimeDelta::MAX)
    }
}

/// Upstream call budget per rolling hour window and per UTC day.
#[derive(Debug, Clone, Copy)]
pub struct BudgetConfig {
    pub hourly: u32,
    pub daily: u32,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            hourly: 100,
            daily: 1000,
        }
    }
}

/// Configuration for the collection scheduler.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Tickers collected on every cycle.
    pub tickers: Vec<String>,
    /// Spacing between successful collections.
    pub interval: Duration,
    /// How often the control loop evaluates the state machine.
    pub tick_interval: Duration,
    pub budget: BudgetConfig,
    pub backoff: BackoffConfig,
    /// Consecutive failures that move the scheduler to ERROR.
    pub failure_ceiling: u32,
    /// Go straight to ERROR when a cycle fails only with permanent errors.
    pub fail_fast_on_permanent: bool,
    /// Upper bound for a single upstream call.
    pub fetch_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tickers: Vec::new(),
            interval: Duration::from_secs(300),
            tick_interval: Duration::from_secs(5),
            budget: BudgetConfig::default(),
            backoff: BackoffConfig::default(),
            failure_ceiling: 5,
            fail_fast_on_permanent: false,
            fetch_timeout: Duration::from_secs(15),
        }
    }
}

impl SchedulerConfig {
    /// Read configuration from environment variables.
    ///
    /// - `HARVEST_TICKERS` (required, comma separated)
    /// - `HARVEST_INTERVAL_SECS`, `HARVEST_TICK_SECS`
    /// - `HARVEST_HOURLY_BUDGET`, `HARVEST_DAILY_BUDGET`
    /// - `HARVEST_FAILURE_CEILING`, `HARVEST_FAIL_FAST_PERMANENT`
    /// - `HARVEST_BACKOFF_BASE_SECS`, `HARVEST_BACKOFF_MAX_SECS`
    /// - `HARVEST_FETCH_TIMEOUT_SECS`
    pub fn from_env() -> Result<Self, AppError> {
        let raw_tickers = std::env::var("HARVEST_TICKERS").map_err(|_| {
            AppError::ConfigError("HARVEST_TICKERS not set. Required for collection.".into())
        })?;
        let defaults = Self::default();

        let config = Self {
            tickers: parse_tickers(&raw_tickers),
            interval: secs(env_parse(
                "HARVEST_INTERVAL_SECS",
                defaults.interval.as_secs(),
            )?),
            tick_interval: secs(env_parse(
                "HARVEST_TICK_SECS",
                defaults.tick_interval.as_secs(),
            )?),
            budget: BudgetConfig {
                hourly: env_parse("HARVEST_HOURLY_BUDGET", defaults.budget.hourly)?,
                daily: env_parse("HARVEST_DAILY_BUDGET", defaults.budget.daily)?,
            },
            backoff: BackoffConfig {
                base: secs(env_parse(
                    "HARVEST_BACKOFF_BASE_SECS",
                    defaults.backoff.base.as_secs(),
                )?),
                max: secs(env_parse(
                    "HARVEST_BACKOFF_MAX_SECS",
                    defaults.backoff.max.as_secs(),
                )?),
            },
            failure_ceiling: env_parse("HARVEST_FAILURE_CEILING", defaults.failure_ceiling)?,
            fail_fast_on_permanent: env_parse(
                "HARVEST_FAIL_FAST_PERMANENT",
                defaults.fail_fast_on_permanent,
            )?,
            fetch_timeout: secs(env_parse(
                "HARVEST_FETCH_TIMEOUT_SECS",
                defaults.fetch_timeout.as_secs(),
            )?),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn with_tickers<I, S>(mut self, tickers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tickers = tickers.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_budget(mut self, hourly: u32, daily: u32) -> Self {
        self.budget = BudgetConfig { hourly, daily };
        self
    }

    pub fn with_failure_ceiling(mut self, ceiling: u32) -> Self {
        self.failure_ceiling = ceiling;
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Reject settings the state machine cannot honour.
    pub fn validate(&self) -> Result<(), AppError> {
        if self.tickers.is_empty() {
            return Err(AppError::ConfigError(
                "At least one ticker must be configured".into(),
            ));
        }
        if self.interval.is_zero() || self.tick_interval.is_zero() {
            return Err(AppError::ConfigError(
                "Collection and tick intervals must be greater than zero".into(),
            ));
        }
        if self.backoff.base.is_zero() || self.backoff.max < self.backoff.base {
            return Err(AppError::ConfigError(
                "Backoff base must be positive and not exceed the backoff ceiling".into(),
            ));
        }
        if self.failure_ceiling == 0 {
            return Err(AppError::ConfigError(
                "HARVEST_FAILURE_CEILING must be at least 1".into(),
            ));
        }
        if self.budget.hourly == 0 || self.budget.daily == 0 {
            return Err(AppError::ConfigError(
                "Hourly and daily budgets must be at least 1".into(),
            ));
        }
        let per_cycle = self.tickers.len() as u64;
        if per_cycle > u64::from(self.budget.hourly) || per_cycle > u64::from(self.budget.daily) {
            return Err(AppError::ConfigError(format!(
                "{per_cycle} tickers per cycle can never fit the hourly ({}) or daily ({}) budget",
                self.budget.hourly, self.budget.daily
            )));
        }
        if self.fetch_timeout.is_zero() {
            return Err(AppError::ConfigError(
                "HARVEST_FETCH_TIMEOUT_SECS must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

fn secs(n: u64) -> Duration {
    Duration::from_secs(n)
}

/// Split a comma separated ticker list, normalising case and dropping blanks
/// and duplicates while keeping order.
pub fn parse_tickers(raw: &str) -> Vec<String> {
    let mut tickers: Vec<String> = Vec::new();
    for ticker in raw.split(',').map(|t| t.trim().to_uppercase()) {
        if !ticker.is_empty() && !tickers.contains(&ticker) {
            tickers.push(ticker);
        }
    }
    tickers
}
