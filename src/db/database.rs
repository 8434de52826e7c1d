//! Connection pool management and schema migrations.

use anyhow::{Context, Result};
use deadpool_sqlite::{Config as PoolConfig, Hook, HookError, Pool, Runtime};
use rusqlite_migration::{M, Migrations};
use std::path::Path;

/// `foreign_keys` and `busy_timeout` are per-connection pragmas in SQLite —
/// setting them once on the migration connection leaves every other
/// connection the pool hands out with `foreign_keys` OFF, silently
/// disabling the `ON DELETE CASCADE` the schema relies on. Apply them on
/// every pooled connection via a post-create hook instead.
fn file_post_create_hook() -> Hook {
    Hook::async_fn(move |conn, _metrics| {
        Box::pin(async move {
            conn.interact(|conn| {
                conn.pragma_update(None, "foreign_keys", "ON")?;
                conn.pragma_update(None, "busy_timeout", 5000)?;
                conn.pragma_update(None, "journal_mode", "WAL")?;
                Ok::<_, rusqlite::Error>(())
            })
            .await
            .map_err(|e| HookError::Message(format!("interact failed: {e}").into()))?
            .map_err(|e| HookError::Message(format!("connection setup failed: {e}").into()))
        })
    })
}

fn memory_post_create_hook() -> Hook {
    Hook::async_fn(move |conn, _metrics| {
        Box::pin(async move {
            conn.interact(|conn| {
                conn.pragma_update(None, "foreign_keys", "ON")?;
                conn.pragma_update(None, "busy_timeout", 5000)?;
                Ok::<_, rusqlite::Error>(())
            })
            .await
            .map_err(|e| HookError::Message(format!("interact failed: {e}").into()))?
            .map_err(|e| HookError::Message(format!("connection setup failed: {e}").into()))
        })
    })
}

fn migrations() -> Migrations<'static> {
    Migrations::new(vec![M::up(
        r#"
        CREATE TABLE threads (
            id          TEXT PRIMARY KEY,
            title       TEXT,
            created_at  TEXT NOT NULL
        );

        CREATE TABLE messages (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            thread_id   TEXT NOT NULL REFERENCES threads(id) ON DELETE CASCADE,
            role        TEXT NOT NULL CHECK (role IN ('user','assistant','tool','system')),
            content     TEXT NOT NULL,
            created_at  TEXT NOT NULL,
            input_tokens  INTEGER,
            output_tokens INTEGER,
            total_tokens  INTEGER
        );
        CREATE INDEX idx_messages_thread ON messages(thread_id, created_at);

        CREATE TABLE l2_summaries (
            id               INTEGER PRIMARY KEY AUTOINCREMENT,
            thread_id        TEXT NOT NULL REFERENCES threads(id) ON DELETE CASCADE,
            start_message_id INTEGER NOT NULL,
            end_message_id   INTEGER NOT NULL,
            text             TEXT NOT NULL,
            tokens           INTEGER NOT NULL,
            created_at       TEXT NOT NULL
        );
        CREATE UNIQUE INDEX idx_l2_pair ON l2_summaries(thread_id, start_message_id, end_message_id);
        CREATE INDEX idx_l2_thread ON l2_summaries(thread_id, id);

        CREATE TABLE l3_microsummaries (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            thread_id   TEXT NOT NULL REFERENCES threads(id) ON DELETE CASCADE,
            start_l2_id INTEGER NOT NULL,
            end_l2_id   INTEGER NOT NULL,
            text        TEXT NOT NULL,
            tokens      INTEGER NOT NULL,
            created_at  TEXT NOT NULL
        );
        CREATE INDEX idx_l3_thread ON l3_microsummaries(thread_id, id);

        CREATE TABLE memory_state (
            thread_id               TEXT PRIMARY KEY REFERENCES threads(id) ON DELETE CASCADE,
            l1_pairs_count          INTEGER NOT NULL DEFAULT 0,
            last_compacted_message_id INTEGER,
            last_compacted_at      TEXT
        );

        CREATE TABLE profile (
            id                   INTEGER PRIMARY KEY CHECK (id = 1),
            display_name         TEXT,
            preferred_language   TEXT,
            tone                 TEXT,
            timezone             TEXT,
            region_coarse        TEXT,
            work_hours           TEXT,
            ui_format_prefs      TEXT,
            goals_mood           TEXT,
            decisions_tasks      TEXT,
            brevity              TEXT,
            format_defaults      TEXT,
            interests_topics     TEXT,
            workflow_tools       TEXT,
            os                   TEXT,
            runtime              TEXT,
            hardware_hint        TEXT,
            updated_at           TEXT,
            source               TEXT,
            confidence           REAL
        );

        CREATE TABLE responses (
            id              INTEGER PRIMARY KEY AUTOINCREMENT,
            thread_id       TEXT NOT NULL REFERENCES threads(id) ON DELETE CASCADE,
            status          TEXT NOT NULL CHECK (status IN ('ok','cancelled','error')),
            model           TEXT,
            prompt_tokens   INTEGER,
            completion_tokens INTEGER,
            diagnostics_json TEXT,
            created_at      TEXT NOT NULL
        );
        CREATE INDEX idx_responses_thread ON responses(thread_id, created_at);

        CREATE TABLE tool_runs (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            thread_id   TEXT NOT NULL REFERENCES threads(id) ON DELETE CASCADE,
            tool_name   TEXT NOT NULL,
            arguments   TEXT,
            result      TEXT,
            created_at  TEXT NOT NULL
        );
        CREATE INDEX idx_tool_runs_thread ON tool_runs(thread_id, created_at);
        "#,
    )])
}

/// Pooled SQLite connection, with the schema migrated to the latest version.
#[derive(Clone)]
pub struct Database {
    pool: Pool,
}

impl Database {
    /// Open (creating if needed) the database file at `path` and run migrations.
    pub async fn connect(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create db directory: {:?}", parent))?;
        }
        let cfg = PoolConfig::new(path.to_path_buf());
        let pool = cfg
            .builder(Runtime::Tokio1)
            .context("failed to create sqlite connection pool builder")?
            .max_size(8)
            .post_create(file_post_create_hook())
            .build()
            .context("failed to build sqlite connection pool")?;
        let db = Self { pool };
        db.run_migrations().await?;
        Ok(db)
    }

    /// Open an in-memory database. Intended for tests.
    ///
    /// Pool size is pinned to 1: each `:memory:` connection is its own
    /// independent database, so a pool of more than one would silently
    /// split reads and writes across unrelated databases.
    pub async fn connect_in_memory() -> Result<Self> {
        let cfg = PoolConfig::new(":memory:");
        let pool = cfg
            .builder(Runtime::Tokio1)
            .context("failed to create in-memory sqlite pool builder")?
            .max_size(1)
            .post_create(memory_post_create_hook())
            .build()
            .context("failed to build in-memory sqlite pool")?;
        let db = Self { pool };
        db.run_migrations().await?;
        Ok(db)
    }

    pub async fn run_migrations(&self) -> Result<()> {
        let conn = self.pool.get().await.context("failed to get db connection")?;
        conn.interact(|conn| migrations().to_latest(conn))
            .await
            .map_err(|e| anyhow::anyhow!("migration task panicked: {e}"))?
            .context("failed to run migrations")?;
        Ok(())
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn migrates_in_memory_database() {
        let db = Database::connect_in_memory().await.unwrap();
        let conn = db.pool().get().await.unwrap();
        let count: i64 = conn
            .interact(|conn| {
                conn.query_row(
                    "SELECT count(*) FROM sqlite_master WHERE type='table' AND name='threads'",
                    [],
                    |row| row.get(0),
                )
            })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(count, 1);
    }
}
