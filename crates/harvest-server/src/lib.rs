//! HTTP control surface: health, scheduler status and operator commands.

pub mod auth;
pub mod dto;
pub mod error;
pub mod openapi;
pub mod routes;
pub mod state;
