//! Database layer.
//!
//! Provides the connection pool, migrations, typed row models, and a thin
//! retry wrapper for transient SQLite busy/locked errors.

mod database;
pub mod models;
mod retry;

pub use database::Database;
pub use models::*;
pub use retry::{DbRetryConfig, interact_with_retry, retry_db};
