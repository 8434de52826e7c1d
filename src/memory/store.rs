//! Memory Store (C4).
//!
//! Persists and queries pair summaries (L2), micro-summaries (L3), memory
//! state, and raw messages, with deterministic ordering. Every operation
//! here is a single unit of work; L3 insertion and the L2 rows it consumes
//! happen in the same SQLite transaction (spec §4.4, §8 property 6).

use crate::db::{
    Database, DbRetryConfig, L2Summary, L3MicroSummary, MemoryState, Message, Profile, Role,
    interact_with_retry,
};
use crate::memory::sanitize::sanitize_for_memory;
use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{OptionalExtension, params};
use uuid::Uuid;

#[derive(Clone)]
pub struct MemoryStore {
    db: Database,
}

impl MemoryStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    async fn interact<F, T>(&self, f: F) -> Result<T>
    where
        F: Fn(&mut rusqlite::Connection) -> rusqlite::Result<T> + Send + Sync + 'static,
        T: Send + 'static,
    {
        interact_with_retry(&self.db, DbRetryConfig::default(), f).await
    }

    pub async fn create_thread(&self, title: Option<String>) -> Result<crate::db::Thread> {
        let id = Uuid::new_v4().to_string();
        let created_at = Utc::now();
        self.interact(move |conn| {
            conn.execute(
                "INSERT INTO threads (id, title, created_at) VALUES (?1, ?2, ?3)",
                params![id, title, created_at],
            )?;
            conn.execute(
                "INSERT INTO memory_state (thread_id, l1_pairs_count) VALUES (?1, 0)",
                params![id],
            )?;
            Ok::<_, rusqlite::Error>(crate::db::Thread {
                id: id.clone(),
                title: title.clone(),
                created_at,
            })
        })
        .await
        .context("failed to create thread")
    }

    pub async fn get_thread(&self, thread_id: &str) -> Result<Option<crate::db::Thread>> {
        let thread_id = thread_id.to_string();
        self.interact(move |conn| {
            conn.query_row(
                "SELECT id, title, created_at FROM threads WHERE id = ?1",
                params![thread_id],
                |row| crate::db::Thread::from_row(row),
            )
            .optional()
        })
        .await
        .context("failed to fetch thread")
    }

    pub async fn ensure_thread(&self, thread_id: &str) -> Result<crate::db::Thread> {
        if let Some(thread) = self.get_thread(thread_id).await? {
            return Ok(thread);
        }
        let id = thread_id.to_string();
        let created_at = Utc::now();
        self.interact(move |conn| {
            conn.execute(
                "INSERT INTO threads (id, title, created_at) VALUES (?1, NULL, ?2)",
                params![id, created_at],
            )?;
            conn.execute(
                "INSERT OR IGNORE INTO memory_state (thread_id, l1_pairs_count) VALUES (?1, 0)",
                params![id],
            )?;
            Ok::<_, rusqlite::Error>(crate::db::Thread {
                id: id.clone(),
                title: None,
                created_at,
            })
        })
        .await
        .context("failed to ensure thread")
    }

    pub async fn append_message(
        &self,
        thread_id: &str,
        role: Role,
        content: &str,
        tokens: Option<(i64, i64, i64)>,
    ) -> Result<Message> {
        let thread_id = thread_id.to_string();
        let content = content.to_string();
        let created_at = Utc::now();
        self.interact(move |conn| {
            conn.execute(
                "INSERT INTO messages (thread_id, role, content, created_at, input_tokens, output_tokens, total_tokens)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    thread_id,
                    role,
                    content,
                    created_at,
                    tokens.map(|t| t.0),
                    tokens.map(|t| t.1),
                    tokens.map(|t| t.2),
                ],
            )?;
            let id = conn.last_insert_rowid();
            Ok::<_, rusqlite::Error>(Message {
                id,
                thread_id: thread_id.clone(),
                role,
                content: content.clone(),
                created_at,
                input_tokens: tokens.map(|t| t.0),
                output_tokens: tokens.map(|t| t.1),
                total_tokens: tokens.map(|t| t.2),
            })
        })
        .await
        .context("failed to append message")
    }

    /// User/assistant messages in chronological order, sanitized on the way
    /// out, optionally excluding one message id (the in-flight user turn).
    pub async fn get_messages_asc(
        &self,
        thread_id: &str,
        exclude_message_id: Option<i64>,
        max_items: usize,
    ) -> Result<Vec<Message>> {
        let thread_id = thread_id.to_string();
        let mut messages: Vec<Message> = self
            .interact(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, thread_id, role, content, created_at, input_tokens, output_tokens, total_tokens
                     FROM messages
                     WHERE thread_id = ?1 AND role IN ('user','assistant')
                     ORDER BY id ASC",
                )?;
                let rows = stmt.query_map(params![thread_id], |row| Message::from_row(row))?;
                rows.collect::<rusqlite::Result<Vec<_>>>()
            })
            .await
            .context("failed to fetch messages")?;

        if let Some(exclude) = exclude_message_id {
            messages.retain(|m| m.id != exclude);
        }
        if messages.len() > max_items {
            let start = messages.len() - max_items;
            messages.drain(..start);
        }
        for m in &mut messages {
            m.content = sanitize_for_memory(&m.content);
        }
        Ok(messages)
    }

    pub async fn get_l2_asc(&self, thread_id: &str, limit: usize) -> Result<Vec<L2Summary>> {
        let thread_id = thread_id.to_string();
        self.interact(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, thread_id, start_message_id, end_message_id, text, tokens, created_at
                 FROM l2_summaries WHERE thread_id = ?1 ORDER BY id ASC LIMIT ?2",
            )?;
            let limit = limit.min(i64::MAX as usize) as i64;
            let rows = stmt.query_map(params![thread_id, limit], |row| {
                L2Summary::from_row(row)
            })?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
        })
        .await
        .context("failed to fetch l2 summaries")
    }

    pub async fn get_l3_asc(&self, thread_id: &str, limit: usize) -> Result<Vec<L3MicroSummary>> {
        let thread_id = thread_id.to_string();
        self.interact(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, thread_id, start_l2_id, end_l2_id, text, tokens, created_at
                 FROM l3_microsummaries WHERE thread_id = ?1 ORDER BY id ASC LIMIT ?2",
            )?;
            let limit = limit.min(i64::MAX as usize) as i64;
            let rows = stmt.query_map(params![thread_id, limit], |row| {
                L3MicroSummary::from_row(row)
            })?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
        })
        .await
        .context("failed to fetch l3 microsummaries")
    }

    /// Insert an L2 record, skipping silently (pair-level idempotence) if
    /// one already exists for `(thread_id, start, end)`.
    pub async fn insert_l2(
        &self,
        thread_id: &str,
        start_message_id: i64,
        end_message_id: i64,
        text: &str,
        tokens: i64,
    ) -> Result<Option<L2Summary>> {
        let thread_id = thread_id.to_string();
        let text = text.to_string();
        let created_at = Utc::now();
        self.interact(move |conn| {
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO l2_summaries
                 (thread_id, start_message_id, end_message_id, text, tokens, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![thread_id, start_message_id, end_message_id, text, tokens, created_at],
            )?;
            if inserted == 0 {
                return Ok(None);
            }
            let id = conn.last_insert_rowid();
            Ok(Some(L2Summary {
                id,
                thread_id: thread_id.clone(),
                start_message_id,
                end_message_id,
                text: text.clone(),
                tokens,
                created_at,
            }))
        })
        .await
        .context("failed to insert l2 summary")
    }

    /// Atomically insert an L3 covering `l2_ids` and delete those L2 rows.
    pub async fn insert_l3(
        &self,
        thread_id: &str,
        l2_ids: &[i64],
        text: &str,
        tokens: i64,
    ) -> Result<L3MicroSummary> {
        anyhow::ensure!(!l2_ids.is_empty(), "insert_l3 requires at least one l2 id");
        let thread_id = thread_id.to_string();
        let text = text.to_string();
        let start_l2_id = *l2_ids.iter().min().unwrap();
        let end_l2_id = *l2_ids.iter().max().unwrap();
        let created_at = Utc::now();
        let l2_ids = l2_ids.to_vec();

        self.interact(move |conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO l3_microsummaries (thread_id, start_l2_id, end_l2_id, text, tokens, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![thread_id, start_l2_id, end_l2_id, text, tokens, created_at],
            )?;
            let id = tx.last_insert_rowid();
            for l2_id in &l2_ids {
                tx.execute("DELETE FROM l2_summaries WHERE id = ?1", params![l2_id])?;
            }
            tx.commit()?;
            Ok::<_, rusqlite::Error>(L3MicroSummary {
                id,
                thread_id: thread_id.clone(),
                start_l2_id,
                end_l2_id,
                text: text.clone(),
                tokens,
                created_at,
            })
        })
        .await
        .context("failed to insert l3 microsummary")
    }

    pub async fn pick_oldest_l2_block(&self, thread_id: &str, max_items: usize) -> Result<Vec<L2Summary>> {
        self.get_l2_asc(thread_id, max_items).await
    }

    pub async fn evict_l3_oldest(&self, thread_id: &str, count: usize) -> Result<usize> {
        let thread_id = thread_id.to_string();
        self.interact(move |conn| {
            conn.execute(
                "DELETE FROM l3_microsummaries WHERE id IN (
                    SELECT id FROM l3_microsummaries WHERE thread_id = ?1 ORDER BY id ASC LIMIT ?2
                 )",
                params![thread_id, count as i64],
            )
        })
        .await
        .context("failed to evict l3 microsummaries")
    }

    pub async fn memory_state_read(&self, thread_id: &str) -> Result<MemoryState> {
        let thread_id_owned = thread_id.to_string();
        let existing = self
            .interact(move |conn| {
                conn.query_row(
                    "SELECT thread_id, l1_pairs_count, last_compacted_message_id, last_compacted_at
                     FROM memory_state WHERE thread_id = ?1",
                    params![thread_id_owned],
                    |row| MemoryState::from_row(row),
                )
                .optional()
            })
            .await
            .context("failed to read memory state")?;

        Ok(existing.unwrap_or(MemoryState {
            thread_id: thread_id.to_string(),
            l1_pairs_count: 0,
            last_compacted_message_id: None,
            last_compacted_at: None,
        }))
    }

    pub async fn memory_state_update(&self, thread_id: &str, l1_pairs_count: i64) -> Result<()> {
        let thread_id = thread_id.to_string();
        let updated_at = Utc::now();
        self.interact(move |conn| {
            conn.execute(
                "INSERT INTO memory_state (thread_id, l1_pairs_count, last_compacted_at)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(thread_id) DO UPDATE SET l1_pairs_count = excluded.l1_pairs_count,
                                                       last_compacted_at = excluded.last_compacted_at",
                params![thread_id, l1_pairs_count, updated_at],
            )
        })
        .await
        .context("failed to update memory state")?;
        Ok(())
    }

    /// Raise the L1 exclusion floor to `message_id` (never lowers it): once a
    /// message has been folded into an L2 group, it must not reappear in a
    /// future L1 fill even after that L2 row is later consumed into an L3.
    pub async fn raise_l1_floor(&self, thread_id: &str, message_id: i64) -> Result<()> {
        let thread_id = thread_id.to_string();
        let updated_at = Utc::now();
        self.interact(move |conn| {
            conn.execute(
                "INSERT INTO memory_state (thread_id, last_compacted_message_id, last_compacted_at)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(thread_id) DO UPDATE SET
                     last_compacted_message_id = MAX(COALESCE(last_compacted_message_id, 0), excluded.last_compacted_message_id),
                     last_compacted_at = excluded.last_compacted_at",
                params![thread_id, message_id, updated_at],
            )
        })
        .await
        .context("failed to raise l1 floor")?;
        Ok(())
    }

    /// Read-only; the core never writes `profile` rows (external CRUD collaborator).
    pub async fn get_profile(&self) -> Result<Profile> {
        let existing = self
            .interact(|conn| {
                conn.query_row(
                    "SELECT display_name, preferred_language, tone, timezone, region_coarse, work_hours,
                            ui_format_prefs, goals_mood, decisions_tasks, brevity, format_defaults,
                            interests_topics, workflow_tools, os, runtime, hardware_hint
                     FROM profile WHERE id = 1",
                    [],
                    |row| Profile::from_row(row),
                )
                .optional()
            })
            .await
            .context("failed to read profile")?;
        Ok(existing.unwrap_or_default())
    }

    pub async fn insert_response_record(
        &self,
        thread_id: &str,
        status: crate::db::ResponseStatus,
        model: Option<&str>,
        prompt_tokens: Option<i64>,
        completion_tokens: Option<i64>,
        diagnostics_json: Option<&str>,
    ) -> Result<()> {
        let thread_id = thread_id.to_string();
        let model = model.map(str::to_string);
        let diagnostics_json = diagnostics_json.map(str::to_string);
        let created_at = Utc::now();
        self.interact(move |conn| {
            conn.execute(
                "INSERT INTO responses (thread_id, status, model, prompt_tokens, completion_tokens, diagnostics_json, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![thread_id, status, model, prompt_tokens, completion_tokens, diagnostics_json, created_at],
            )
        })
        .await
        .context("failed to insert response record")?;
        Ok(())
    }

    /// Aggregate token count recorded against `tool_runs` for this thread.
    /// The core only ever reads this table; tool-call parsing (which writes
    /// it) is out of scope.
    pub async fn sum_tool_run_tokens(&self, thread_id: &str) -> Result<i64> {
        let thread_id = thread_id.to_string();
        self.interact(move |conn| {
            conn.query_row(
                "SELECT COALESCE(SUM(length(result) / 4), 0) FROM tool_runs WHERE thread_id = ?1",
                params![thread_id],
                |row| row.get::<_, i64>(0),
            )
        })
        .await
        .context("failed to sum tool run tokens")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    async fn store() -> MemoryStore {
        let db = Database::connect_in_memory().await.unwrap();
        MemoryStore::new(db)
    }

    #[tokio::test]
    async fn l2_pair_insertion_is_idempotent() {
        let store = store().await;
        let thread = store.create_thread(None).await.unwrap();
        let first = store.insert_l2(&thread.id, 1, 2, "summary", 10).await.unwrap();
        assert!(first.is_some());
        let second = store.insert_l2(&thread.id, 1, 2, "different text", 20).await.unwrap();
        assert!(second.is_none(), "duplicate (start,end) must be a no-op");
        let all = store.get_l2_asc(&thread.id, 100).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].text, "summary");
    }

    #[tokio::test]
    async fn l3_insertion_deletes_source_l2_atomically() {
        let store = store().await;
        let thread = store.create_thread(None).await.unwrap();
        let l2a = store.insert_l2(&thread.id, 1, 2, "a", 10).await.unwrap().unwrap();
        let l2b = store.insert_l2(&thread.id, 3, 4, "b", 10).await.unwrap().unwrap();

        store
            .insert_l3(&thread.id, &[l2a.id, l2b.id], "condensed", 8)
            .await
            .unwrap();

        let remaining_l2 = store.get_l2_asc(&thread.id, 100).await.unwrap();
        assert!(remaining_l2.is_empty());
        let l3 = store.get_l3_asc(&thread.id, 100).await.unwrap();
        assert_eq!(l3.len(), 1);
        assert_eq!(l3[0].start_l2_id, l2a.id.min(l2b.id));
        assert_eq!(l3[0].end_l2_id, l2a.id.max(l2b.id));
    }

    #[tokio::test]
    async fn messages_are_sanitized_and_chronological() {
        let store = store().await;
        let thread = store.create_thread(None).await.unwrap();
        store
            .append_message(&thread.id, Role::User, "hi", None)
            .await
            .unwrap();
        store
            .append_message(
                &thread.id,
                Role::Assistant,
                "<think>plan</think>hello there",
                None,
            )
            .await
            .unwrap();

        let messages = store.get_messages_asc(&thread.id, None, 100).await.unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, Role::User);
        assert_eq!(messages[1].content, "hello there");
    }

    #[tokio::test]
    async fn cascade_delete_removes_everything_on_thread_deletion() {
        let store = store().await;
        let thread = store.create_thread(None).await.unwrap();
        store
            .append_message(&thread.id, Role::User, "hi", None)
            .await
            .unwrap();
        store.insert_l2(&thread.id, 1, 2, "a", 5).await.unwrap();

        let conn = store.db.pool().get().await.unwrap();
        let thread_id = thread.id.clone();
        conn.interact(move |conn| conn.execute("DELETE FROM threads WHERE id = ?1", params![thread_id]))
            .await
            .unwrap()
            .unwrap();

        assert!(store.get_messages_asc(&thread.id, None, 100).await.unwrap().is_empty());
        assert!(store.get_l2_asc(&thread.id, 100).await.unwrap().is_empty());
    }
}
