//! Retry wrapper for transient SQLite contention (`SQLITE_BUSY`/`SQLITE_LOCKED`).
//!
//! The memory store's per-thread writer discipline (spec §5) keeps write
//! contention rare, but a busy-file retry is still cheap insurance for the
//! deadpool-sqlite worker threads racing each other under load.

use crate::db::Database;
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy)]
pub struct DbRetryConfig {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for DbRetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(20),
        }
    }
}

pub(crate) fn is_retryable(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if matches!(
                e.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            )
    )
}

/// Retry an async database operation up to `cfg.max_attempts` times, with
/// linear backoff, when it fails with a busy/locked SQLite error.
pub async fn retry_db<F, Fut, T>(cfg: DbRetryConfig, mut op: F) -> Result<T, rusqlite::Error>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, rusqlite::Error>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if attempt + 1 < cfg.max_attempts && is_retryable(&e) => {
                attempt += 1;
                tracing::warn!(attempt, error = %e, "retrying db operation after busy/locked error");
                tokio::time::sleep(cfg.base_delay * attempt).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Acquire a pooled connection and run `f` against it, retrying the whole
/// operation up to `cfg.max_attempts` times on `SQLITE_BUSY`/`SQLITE_LOCKED`.
/// `f` must be a plain `Fn` (not `FnMut`/`FnOnce`) since a retry re-invokes it
/// against a fresh connection borrow; clone data out of captured state
/// instead of moving it when building the return value.
pub async fn interact_with_retry<F, T>(db: &Database, cfg: DbRetryConfig, f: F) -> Result<T>
where
    F: Fn(&mut rusqlite::Connection) -> rusqlite::Result<T> + Send + Sync + 'static,
    T: Send + 'static,
{
    let conn = db.pool().get().await.context("failed to get db connection")?;
    let f = Arc::new(f);
    let mut attempt = 0;
    loop {
        let f = f.clone();
        match conn.interact(move |c| f(c)).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(e)) if attempt + 1 < cfg.max_attempts && is_retryable(&e) => {
                attempt += 1;
                tracing::warn!(attempt, error = %e, "retrying db operation after busy/locked error");
                tokio::time::sleep(cfg.base_delay * attempt).await;
            }
            Ok(Err(e)) => return Err(e).context("db operation failed"),
            Err(e) => return Err(anyhow::anyhow!("db task panicked: {e}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn retries_until_success() {
        let calls = AtomicU32::new(0);
        let result = retry_db(DbRetryConfig::default(), || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(rusqlite::Error::SqliteFailure(
                        rusqlite::ffi::Error::new(5),
                        Some("database is locked".into()),
                    ))
                } else {
                    Ok(42)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn interact_with_retry_recovers_from_contention() {
        let db = Database::connect_in_memory().await.unwrap();
        let calls = Arc::new(AtomicU32::new(0));
        let calls_for_closure = calls.clone();
        let result = interact_with_retry(&db, DbRetryConfig::default(), move |conn| {
            let n = calls_for_closure.fetch_add(1, Ordering::SeqCst);
            if n < 1 {
                Err(rusqlite::Error::SqliteFailure(
                    rusqlite::ffi::Error::new(5),
                    Some("database is locked".into()),
                ))
            } else {
                conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
            }
        })
        .await
        .unwrap();
        assert_eq!(result, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
