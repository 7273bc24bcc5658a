use harvest_core::error::AppError;
use sqlx::{Connection, PgConnection, PgPool};

/// Advisory lock key shared by every scheduler writer ("HRVS").
pub const WRITER_LOCK_KEY: i64 = 0x4852_5653;

/// Exclusive right to drive the scheduler against this database.
///
/// Backed by a session-level `pg_advisory_lock` on a connection detached
/// from the pool. Dropping the lease closes that connection, and PostgreSQL
/// releases the lock with the session.
pub struct WriterLease {
    conn: PgConnection,
}

impl WriterLease {
    /// Take the lease, or fail with `InvalidState` if another process
    /// holds it.
    pub async fn try_acquire(pool: &PgPool) -> Result<Self, AppError> {
        let mut conn = pool
            .acquire()
            .await
            .map_err(|e| AppError::DatabaseError(format!("Failed to acquire connection: {e}")))?
            .detach();

        let acquired: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock($1)")
            .bind(WRITER_LOCK_KEY)
            .fetch_one(&mut conn)
            .await
            .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        if !acquired {
            let _ = conn.close().await;
            return Err(AppError::InvalidState(
                "another scheduler process holds the writer lease".to_string(),
            ));
        }

        tracing::info!(key = WRITER_LOCK_KEY, "Writer lease acquired");
        Ok(Self { conn })
    }

    /// Unlock and close the lease connection.
    pub async fn release(mut self) -> Result<(), AppError> {
        sqlx::query("SELECT pg_advisory_unlock($1)")
            .bind(WRITER_LOCK_KEY)
            .execute(&mut self.conn)
            .await
            .map_err(|e| AppError::DatabaseError(e.to_string()))?;
        self.conn
            .close()
            .await
            .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        tracing::info!("Writer lease released");
        Ok(())
    }
}
