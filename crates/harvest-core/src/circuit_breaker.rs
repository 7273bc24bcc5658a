//! Per-endpoint circuit breaker for upstream fetches.
//!
//! Stops a failing upstream from being retried at full rate while still
//! allowing periodic recovery probes.
//!
//! # Circuit States
//!
//! ```text
//! CLOSED (healthy) --[N failures in window]--> OPEN (short-circuit) --[cool-down]--> HALF_OPEN (one probe)
//!                                                                                        |
//!                                      <--[probe failure, longer cool-down]--            |
//!                                                                                        |
//! CLOSED <----------------------------------[probe success]------------------------------+
//! ```
//!
//! Cool-downs are deadlines (`next_probe_at`) checked against the injected
//! clock on every call; nothing sleeps.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;

use crate::clock::SharedClock;
use crate::error::AppError;

/// Current state of an endpoint circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Calls pass through normally.
    Closed,
    /// Calls short-circuit without a network attempt.
    Open,
    /// Exactly one trial call is allowed.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Configuration for circuit breaker behavior.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures within `failure_window` that open the circuit.
    pub failure_threshold: u32,

    /// Failures older than this no longer count toward the threshold.
    pub failure_window: Duration,

    /// Cool-down before the first probe after opening.
    pub cooldown: Duration,

    /// Each failed probe multiplies the cool-down by this factor.
    pub cooldown_multiplier: f64,

    /// Upper bound for the cool-down.
    pub max_cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            failure_window: Duration::from_secs(300),
            cooldown: Duration::from_secs(30),
            cooldown_multiplier: 2.0,
            max_cooldown: Duration::from_secs(600),
        }
    }
}

impl CircuitBreakerConfig {
    /// Read configuration from environment variables.
    ///
    /// - `HARVEST_BREAKER_THRESHOLD` (defaults to 5)
    /// - `HARVEST_BREAKER_WINDOW_SECS` (defaults to 300)
    /// - `HARVEST_BREAKER_COOLDOWN_SECS` (defaults to 30)
    /// - `HARVEST_BREAKER_MAX_COOLDOWN_SECS` (defaults to 600)
    pub fn from_env() -> Result<Self, AppError> {
        use crate::config::env_parse;

        let defaults = Self::default();
        let config = Self {
            failure_threshold: env_parse("HARVEST_BREAKER_THRESHOLD", defaults.failure_threshold)?,
            failure_window: Duration::from_secs(env_parse(
                "HARVEST_BREAKER_WINDOW_SECS",
                defaults.failure_window.as_secs(),
            )?),
            cooldown: Duration::from_secs(env_parse(
                "HARVEST_BREAKER_COOLDOWN_SECS",
                defaults.cooldown.as_secs(),
            )?),
            cooldown_multiplier: defaults.cooldown_multiplier,
            max_cooldown: Duration::from_secs(env_parse(
                "HARVEST_BREAKER_MAX_COOLDOWN_SECS",
                defaults.max_cooldown.as_secs(),
            )?),
        };

        if config.failure_threshold == 0 {
            return Err(AppError::ConfigError(
                "HARVEST_BREAKER_THRESHOLD must be at least 1".into(),
            ));
        }
        if config.cooldown.is_zero() || config.max_cooldown < config.cooldown {
            return Err(AppError::ConfigError(
                "Breaker cool-down must be positive and not exceed its maximum".into(),
            ));
        }
        Ok(config)
    }

    /// Cool-down after the `trips`-th consecutive opening.
    fn cooldown_for(&self, trips: u32) -> TimeDelta {
        let exponent = trips.saturating_sub(1).min(32) as i32;
        let secs = (self.cooldown.as_secs_f64() * self.cooldown_multiplier.powi(exponent))
            .min(self.max_cooldown.as_secs_f64());
        TimeDelta::from_std(Duration::from_secs_f64(secs)).unwrap_or(TimeDelta::MAX)
    }
}

/// Health record of one logical upstream endpoint.
///
/// Created lazily on the first call to the endpoint and mutated only by the
/// breaker's own transitions.
#[derive(Debug, Clone)]
struct EndpointHealth {
    state: CircuitState,
    consecutive_failures: u32,
    first_failure_at: Option<DateTime<Utc>>,
    opened_at: Option<DateTime<Utc>>,
    next_probe_at: Option<DateTime<Utc>>,
    /// Consecutive openings without a successful probe; drives the cool-down.
    trips: u32,
    probe_started_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
}

impl EndpointHealth {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            first_failure_at: None,
            opened_at: None,
            next_probe_at: None,
            trips: 0,
            probe_started_at: None,
            last_error: None,
        }
    }
}

/// Statistics about one endpoint circuit for monitoring.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerStats {
    pub endpoint: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub opened_at: Option<DateTime<Utc>>,
    pub next_probe_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// What an admitted call is allowed to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Circuit closed, normal call.
    Normal,
    /// The single half-open trial call.
    Probe,
}

/// Thread-safe registry of per-endpoint circuits.
#[derive(Clone)]
pub struct EndpointCircuitBreaker {
    config: CircuitBreakerConfig,
    clock: SharedClock,
    endpoints: Arc<Mutex<HashMap<String, EndpointHealth>>>,
}

impl EndpointCircuitBreaker {
    pub fn new(config: CircuitBreakerConfig, clock: SharedClock) -> Self {
        Self {
            config,
            clock,
            endpoints: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Acquires the registry lock, recovering from poison if necessary.
    fn lock_endpoints(&self) -> MutexGuard<'_, HashMap<String, EndpointHealth>> {
        self.endpoints.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned circuit breaker mutex");
            poisoned.into_inner()
        })
    }

    /// Current state of an endpoint. Unknown endpoints are closed.
    ///
    /// Reports `HalfOpen` once the cool-down has elapsed, without consuming
    /// the probe.
    pub fn state(&self, endpoint: &str) -> CircuitState {
        let now = self.clock.now();
        let endpoints = self.lock_endpoints();
        match endpoints.get(endpoint) {
            None => CircuitState::Closed,
            Some(h) if h.state == CircuitState::Open && probe_due(h, now) => {
                CircuitState::HalfOpen
            }
            Some(h) => h.state,
        }
    }

    /// Ask permission for one call to `endpoint`.
    ///
    /// Returns `AppError::CircuitOpen` when the call must short-circuit.
    pub fn try_acquire(&self, endpoint: &str) -> Result<Admission, AppError> {
        let now = self.clock.now();
        let mut endpoints = self.lock_endpoints();
        let health = endpoints
            .entry(endpoint.to_string())
            .or_insert_with(EndpointHealth::new);

        match health.state {
            CircuitState::Closed => Ok(Admission::Normal),
            CircuitState::Open if probe_due(health, now) => {
                tracing::info!(endpoint = %endpoint, "Circuit transitioning to half-open, admitting probe");
                health.state = CircuitState::HalfOpen;
                health.probe_started_at = Some(now);
                Ok(Admission::Probe)
            }
            CircuitState::Open => Err(open_error(endpoint, health, now)),
            CircuitState::HalfOpen => {
                // A probe abandoned mid-flight (cancelled future) must not wedge
                // the circuit; after one cool-down another probe is admitted.
                let stale = health
                    .probe_started_at
                    .is_none_or(|started| now - started >= self.config.cooldown_for(health.trips));
                if stale {
                    health.probe_started_at = Some(now);
                    Ok(Admission::Probe)
                } else {
                    Err(AppError::CircuitOpen {
                        endpoint: endpoint.to_string(),
                        retry_after_secs: 0,
                    })
                }
            }
        }
    }

    /// Executes the operation through the endpoint circuit.
    ///
    /// - Closed: executes operation, tracks success/failure
    /// - Open: returns `AppError::CircuitOpen` without calling `operation`
    /// - HalfOpen: executes the single probe, its outcome decides the next state
    pub async fn call<F, T, Fut>(&self, endpoint: &str, operation: F) -> Result<T, AppError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, AppError>>,
    {
        self.try_acquire(endpoint)?;

        let result = operation().await;

        match &result {
            Ok(_) => self.record_success(endpoint),
            Err(e) if e.should_trip_circuit() => self.record_failure(endpoint, e),
            // The upstream answered; a bad payload says nothing about its health.
            Err(_) => self.record_success(endpoint),
        }

        result
    }

    pub fn record_success(&self, endpoint: &str) {
        let mut endpoints = self.lock_endpoints();
        let health = endpoints
            .entry(endpoint.to_string())
            .or_insert_with(EndpointHealth::new);

        match health.state {
            CircuitState::HalfOpen => {
                tracing::info!(endpoint = %endpoint, "Circuit closing after successful probe");
                *health = EndpointHealth::new();
            }
            CircuitState::Closed => {
                health.consecutive_failures = 0;
                health.first_failure_at = None;
            }
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self, endpoint: &str, error: &AppError) {
        let now = self.clock.now();
        let mut endpoints = self.lock_endpoints();
        let health = endpoints
            .entry(endpoint.to_string())
            .or_insert_with(EndpointHealth::new);

        health.last_error = Some(error.to_string());

        match health.state {
            CircuitState::Closed => {
                let window = TimeDelta::from_std(self.config.failure_window).unwrap_or(TimeDelta::MAX);
                if health.first_failure_at.is_some_and(|first| now - first > window) {
                    health.consecutive_failures = 0;
                    health.first_failure_at = None;
                }
                if health.first_failure_at.is_none() {
                    health.first_failure_at = Some(now);
                }
                health.consecutive_failures += 1;

                if health.consecutive_failures >= self.config.failure_threshold {
                    self.open(endpoint, health, now);
                    tracing::warn!(
                        endpoint = %endpoint,
                        failures = health.consecutive_failures,
                        error = %error,
                        next_probe_at = ?health.next_probe_at,
                        "Circuit opening after consecutive failures"
                    );
                }
            }
            CircuitState::HalfOpen => {
                self.open(endpoint, health, now);
                tracing::warn!(
                    endpoint = %endpoint,
                    error = %error,
                    next_probe_at = ?health.next_probe_at,
                    "Probe failed, circuit returning to open state"
                );
            }
            CircuitState::Open => {}
        }
    }

    fn open(&self, endpoint: &str, health: &mut EndpointHealth, now: DateTime<Utc>) {
        health.trips = health.trips.saturating_add(1);
        health.state = CircuitState::Open;
        health.opened_at = Some(now);
        health.next_probe_at = Some(now + self.config.cooldown_for(health.trips));
        health.probe_started_at = None;
        tracing::debug!(endpoint = %endpoint, trips = health.trips, "Circuit opened");
    }

    pub fn stats(&self, endpoint: &str) -> Option<CircuitBreakerStats> {
        let now = self.clock.now();
        let endpoints = self.lock_endpoints();
        endpoints.get(endpoint).map(|h| to_stats(endpoint, h, now))
    }

    /// Stats for every known endpoint, sorted by name.
    pub fn all_stats(&self) -> Vec<CircuitBreakerStats> {
        let now = self.clock.now();
        let endpoints = self.lock_endpoints();
        let mut stats: Vec<_> = endpoints
            .iter()
            .map(|(name, h)| to_stats(name, h, now))
            .collect();
        stats.sort_by(|a, b| a.endpoint.cmp(&b.endpoint));
        stats
    }

    /// Manually close one endpoint circuit. Returns false for unknown endpoints.
    pub fn reset(&self, endpoint: &str) -> bool {
        let mut endpoints = self.lock_endpoints();
        match endpoints.get_mut(endpoint) {
            Some(health) => {
                tracing::info!(endpoint = %endpoint, "Circuit manually reset");
                *health = EndpointHealth::new();
                true
            }
            None => false,
        }
    }
}

fn probe_due(health: &EndpointHealth, now: DateTime<Utc>) -> bool {
    health.next_probe_at.is_some_and(|at| now >= at)
}

fn open_error(endpoint: &str, health: &EndpointHealth, now: DateTime<Utc>) -> AppError {
    let retry_after_secs = health
        .next_probe_at
        .map(|at| (at - now).num_seconds().max(0) as u64)
        .unwrap_or(0);
    AppError::CircuitOpen {
        endpoint: endpoint.to_string(),
        retry_after_secs,
    }
}

fn to_stats(endpoint: &str, health: &EndpointHealth, now: DateTime<Utc>) -> CircuitBreakerStats {
    let state = if health.state == CircuitState::Open && probe_due(health, now) {
        CircuitState::HalfOpen
    } else {
        health.state
    };
    CircuitBreakerStats {
        endpoint: endpoint.to_string(),
        state,
        consecutive_failures: health.consecutive_failures,
        opened_at: health.opened_at,
        next_probe_at: health.next_probe_at,
        last_error: health.last_error.clone(),
    }
}
