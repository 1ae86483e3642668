//! Database layer: error categorisation, row models and PostgreSQL repositories.

pub mod errors;
pub mod handlers;
pub mod models;
