pub mod common;
mod lease_tests;
mod record_tests;
mod state_store_tests;
