use std::time::Duration;

use harvest_core::AppError;

/// Configuration for the database connection pool.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    /// Upper bound for waiting on a pooled connection. Keeps state writes
    /// and health probes from blocking a tick indefinitely.
    pub acquire_timeout: Duration,
}

impl DatabaseConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            max_connections: 5,
            acquire_timeout: Duration::from_secs(5),
        }
    }

    /// Read configuration from environment variables.
    ///
    /// - `DATABASE_URL` (required)
    /// - `DATABASE_MAX_CONNECTIONS` (optional, defaults to 5)
    /// - `DATABASE_ACQUIRE_TIMEOUT_SECS` (optional, defaults to 5)
    pub fn from_env() -> Result<Self, AppError> {
        let url = std::env::var("DATABASE_URL").map_err(|_| {
            AppError::ConfigError("DATABASE_URL not set. Required for database operations.".into())
        })?;
        let mut config = Self::new(url);

        if let Ok(raw) = std::env::var("DATABASE_MAX_CONNECTIONS") {
            config.max_connections = positive(&raw, "DATABASE_MAX_CONNECTIONS")?;
        }
        if let Ok(raw) = std::env::var("DATABASE_ACQUIRE_TIMEOUT_SECS") {
            config.acquire_timeout =
                Duration::from_secs(positive(&raw, "DATABASE_ACQUIRE_TIMEOUT_SECS")?.into());
        }

        Ok(config)
    }
}

fn positive(raw: &str, key: &str) -> Result<u32, AppError> {
    let parsed: u32 = raw.trim().parse().map_err(|_| {
        AppError::ConfigError(format!("Invalid {key} '{raw}': must be a positive integer"))
    })?;
    if parsed == 0 {
        return Err(AppError::ConfigError(format!("{key} must be at least 1")));
    }
    Ok(parsed)
}
