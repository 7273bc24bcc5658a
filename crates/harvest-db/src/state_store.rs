use chrono::{DateTime, Utc};
use harvest_core::error::AppError;
use harvest_core::models::{CollectorState, SchedulerState};
use harvest_core::traits::StateStore;
use sqlx::{PgPool, Pool, Postgres};

/// Singleton `scheduler_state` row (id = 1) in PostgreSQL.
#[derive(Clone)]
pub struct PgStateStore {
    pool: Pool<Postgres>,
}

impl PgStateStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Last committed state, or the default when the row is missing or
    /// holds values the scheduler cannot interpret.
    pub async fn read(&self) -> Result<SchedulerState, AppError> {
        let result = sqlx::query_as::<_, StateRow>(
            r#"
            SELECT current_state, last_collection_ts, next_collection_ts,
                   api_calls_today, api_calls_this_hour, hour_window_start,
                   consecutive_failures, backoff_until, updated_at
            FROM scheduler_state
            WHERE id = 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await;

        let row = match result {
            Ok(Some(row)) => row,
            Ok(None) => {
                tracing::info!("No scheduler state persisted yet, starting from defaults");
                return Ok(SchedulerState::default());
            }
            Err(e @ (sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_))) => {
                tracing::warn!(error = %e, "Persisted scheduler state unreadable, starting from defaults");
                return Ok(SchedulerState::default());
            }
            Err(e) => return Err(AppError::DatabaseError(e.to_string())),
        };

        match SchedulerState::try_from(row) {
            Ok(state) => Ok(state),
            Err(reason) => {
                tracing::warn!(%reason, "Persisted scheduler state corrupt, starting from defaults");
                Ok(SchedulerState::default())
            }
        }
    }

    /// Atomic upsert of the singleton row.
    pub async fn write(&self, state: &SchedulerState) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO scheduler_state (
                id, current_state, last_collection_ts, next_collection_ts,
                api_calls_today, api_calls_this_hour, hour_window_start,
                consecutive_failures, backoff_until, updated_at
            )
            VALUES (1, $1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (id) DO UPDATE SET
                current_state = EXCLUDED.current_state,
                last_collection_ts = EXCLUDED.last_collection_ts,
                next_collection_ts = EXCLUDED.next_collection_ts,
                api_calls_today = EXCLUDED.api_calls_today,
                api_calls_this_hour = EXCLUDED.api_calls_this_hour,
                hour_window_start = EXCLUDED.hour_window_start,
                consecutive_failures = EXCLUDED.consecutive_failures,
                backoff_until = EXCLUDED.backoff_until,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(state.current_state.as_str())
        .bind(state.last_collection_ts)
        .bind(state.next_collection_ts)
        .bind(to_db_count(state.api_calls_today))
        .bind(to_db_count(state.api_calls_this_hour))
        .bind(state.hour_window_start)
        .bind(to_db_count(state.consecutive_failures))
        .bind(state.backoff_until)
        .bind(state.updated_at.unwrap_or_else(Utc::now))
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        Ok(())
    }
}

fn to_db_count(n: u32) -> i32 {
    i32::try_from(n).unwrap_or(i32::MAX)
}

// -- Internal row type for sqlx deserialization --

#[derive(sqlx::FromRow)]
struct StateRow {
    current_state: String,
    last_collection_ts: Option<DateTime<Utc>>,
    next_collection_ts: Option<DateTime<Utc>>,
    api_calls_today: i32,
    api_calls_this_hour: i32,
    hour_window_start: Option<DateTime<Utc>>,
    consecutive_failures: i32,
    backoff_until: Option<DateTime<Utc>>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<StateRow> for SchedulerState {
    type Error = String;

    fn try_from(row: StateRow) -> Result<Self, Self::Error> {
        let count = |name: &str, n: i32| {
            u32::try_from(n).map_err(|_| format!("negative {name}: {n}"))
        };
        Ok(SchedulerState {
            current_state: row.current_state.parse::<CollectorState>()?,
            last_collection_ts: row.last_collection_ts,
            next_collection_ts: row.next_collection_ts,
            api_calls_today: count("api_calls_today", row.api_calls_today)?,
            api_calls_this_hour: count("api_calls_this_hour", row.api_calls_this_hour)?,
            hour_window_start: row.hour_window_start,
            consecutive_failures: count("consecutive_failures", row.consecutive_failures)?,
            backoff_until: row.backoff_until,
            updated_at: Some(row.updated_at),
        })
    }
}

// -- Trait implementation --

impl StateStore for PgStateStore {
    async fn read(&self) -> Result<SchedulerState, AppError> {
        PgStateStore::read(self).await
    }

    async fn write(&self, state: &SchedulerState) -> Result<(), AppError> {
        PgStateStore::write(self, state).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(current_state: &str) -> StateRow {
        StateRow {
            current_state: current_state.to_string(),
            last_collection_ts: None,
            next_collection_ts: None,
            api_calls_today: 12,
            api_calls_this_hour: 3,
            hour_window_start: None,
            consecutive_failures: 1,
            backoff_until: None,
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_row_conversion() {
        let state = SchedulerState::try_from(row("WAITING")).unwrap();
        assert_eq!(state.current_state, CollectorState::Waiting);
        assert_eq!(state.api_calls_today, 12);
        assert_eq!(state.consecutive_failures, 1);
    }

    #[test]
    fn test_unknown_state_is_rejected() {
        assert!(SchedulerState::try_from(row("SLEEPING")).is_err());
    }

    #[test]
    fn test_negative_counter_is_rejected() {
        let mut bad = row("IDLE");
        bad.api_calls_this_hour = -4;
        assert!(SchedulerState::try_from(bad).is_err());
    }

    #[test]
    fn test_counter_clamped_for_storage() {
        assert_eq!(to_db_count(7), 7);
        assert_eq!(to_db_count(u32::MAX), i32::MAX);
    }
}
