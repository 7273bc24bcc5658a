use harvest_core::SchedulerHandle;
use harvest_db::Database;

/// Shared application state, available to all route handlers via `State<Arc<AppState>>`.
pub struct AppState {
    /// Control channel into the running scheduler.
    pub scheduler: SchedulerHandle,
    /// Probed by `/health`; `None` when running without a database.
    pub db: Option<Database>,
    /// Admin token for the control endpoints (None = control endpoints disabled).
    pub admin_token: Option<String>,
}
