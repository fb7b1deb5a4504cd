//! Persistence layer for conductor.
//!
//! Models, connection pool helpers, and one query module per table group.
//! Migrations live in `migrations/` and are applied at runtime via
//! [`pool::run_migrations`].

pub mod config;
pub mod models;
pub mod pool;
pub mod queries;
