pub mod config;
pub mod database;
pub mod lease;
pub mod record_repository;
pub mod state_store;

pub use config::DatabaseConfig;
pub use database::Database;
pub use lease::WriterLease;
pub use record_repository::RecordRepository;
pub use state_store::PgStateStore;
