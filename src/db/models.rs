//! Typed row models for the persistence layer (spec §3 / §6).

use chrono::{DateTime, Utc};
use rusqlite::Row;
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};

/// A conversation thread. Carries no summary field of its own in this crate —
/// thread-level auto-summary is out of scope (spec.md Non-goals).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Thread {
    pub id: String,
    pub title: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Thread {
    pub(crate) fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            title: row.get("title")?,
            created_at: row.get("created_at")?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    Tool,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
            Role::System => "system",
        }
    }
}

impl ToSql for Role {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for Role {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        match value.as_str()? {
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            "tool" => Ok(Role::Tool),
            "system" => Ok(Role::System),
            other => Err(FromSqlError::Other(
                format!("unknown role: {other}").into(),
            )),
        }
    }
}

/// A single L1 message — one row per user/assistant/tool/system turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: i64,
    pub thread_id: String,
    pub role: Role,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub input_tokens: Option<i64>,
    pub output_tokens: Option<i64>,
    pub total_tokens: Option<i64>,
}

impl Message {
    pub(crate) fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            thread_id: row.get("thread_id")?,
            role: row.get("role")?,
            content: row.get("content")?,
            created_at: row.get("created_at")?,
            input_tokens: row.get("input_tokens")?,
            output_tokens: row.get("output_tokens")?,
            total_tokens: row.get("total_tokens")?,
        })
    }
}

/// A pair summary (spec §3). May cover a single (user, assistant) pair or a
/// contiguous group of up to `L2_GROUP_SIZE` pairs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct L2Summary {
    pub id: i64,
    pub thread_id: String,
    pub start_message_id: i64,
    pub end_message_id: i64,
    pub text: String,
    pub tokens: i64,
    pub created_at: DateTime<Utc>,
}

impl L2Summary {
    pub(crate) fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            thread_id: row.get("thread_id")?,
            start_message_id: row.get("start_message_id")?,
            end_message_id: row.get("end_message_id")?,
            text: row.get("text")?,
            tokens: row.get("tokens")?,
            created_at: row.get("created_at")?,
        })
    }
}

/// A block micro-summary condensing 4-5 L2 rows into one line (spec §3/§4.5).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct L3MicroSummary {
    pub id: i64,
    pub thread_id: String,
    pub start_l2_id: i64,
    pub end_l2_id: i64,
    pub text: String,
    pub tokens: i64,
    pub created_at: DateTime<Utc>,
}

impl L3MicroSummary {
    pub(crate) fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            thread_id: row.get("thread_id")?,
            start_l2_id: row.get("start_l2_id")?,
            end_l2_id: row.get("end_l2_id")?,
            text: row.get("text")?,
            tokens: row.get("tokens")?,
            created_at: row.get("created_at")?,
        })
    }
}

/// Per-thread bookkeeping for the memory store. `last_compacted_message_id`
/// is the L1 exclusion floor: messages at or below it have already been
/// folded into an L2/L3 summary and must not reappear in a future L1 fill,
/// even after their L2 row is later consumed into an L3 (spec §3 MemoryState).
/// This is a diagnostic cache only; it is never the source of truth for
/// *whether* to compact (the live token breakdown from C1+C6 is).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryState {
    pub thread_id: String,
    pub l1_pairs_count: i64,
    pub last_compacted_message_id: Option<i64>,
    pub last_compacted_at: Option<DateTime<Utc>>,
}

impl MemoryState {
    pub(crate) fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            thread_id: row.get("thread_id")?,
            l1_pairs_count: row.get("l1_pairs_count")?,
            last_compacted_message_id: row.get("last_compacted_message_id")?,
            last_compacted_at: row.get("last_compacted_at")?,
        })
    }
}

/// The singleton user profile rendered into the system message (spec §4.6 step 2).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Profile {
    pub display_name: Option<String>,
    pub preferred_language: Option<String>,
    pub tone: Option<String>,
    pub timezone: Option<String>,
    pub region_coarse: Option<String>,
    pub work_hours: Option<String>,
    pub ui_format_prefs: Option<String>,
    pub goals_mood: Option<String>,
    pub decisions_tasks: Option<String>,
    pub brevity: Option<String>,
    pub format_defaults: Option<String>,
    pub interests_topics: Option<String>,
    pub workflow_tools: Option<String>,
    pub os: Option<String>,
    pub runtime: Option<String>,
    pub hardware_hint: Option<String>,
}

impl Profile {
    pub(crate) fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            display_name: row.get("display_name")?,
            preferred_language: row.get("preferred_language")?,
            tone: row.get("tone")?,
            timezone: row.get("timezone")?,
            region_coarse: row.get("region_coarse")?,
            work_hours: row.get("work_hours")?,
            ui_format_prefs: row.get("ui_format_prefs")?,
            goals_mood: row.get("goals_mood")?,
            decisions_tasks: row.get("decisions_tasks")?,
            brevity: row.get("brevity")?,
            format_defaults: row.get("format_defaults")?,
            interests_topics: row.get("interests_topics")?,
            workflow_tools: row.get("workflow_tools")?,
            os: row.get("os")?,
            runtime: row.get("runtime")?,
            hardware_hint: row.get("hardware_hint")?,
        })
    }

    /// Render the non-empty fields as a compact block of `key: value` lines,
    /// in declaration order, for inclusion in the system message.
    pub fn render(&self) -> Option<String> {
        let fields: [(&str, &Option<String>); 16] = [
            ("display_name", &self.display_name),
            ("preferred_language", &self.preferred_language),
            ("tone", &self.tone),
            ("timezone", &self.timezone),
            ("region", &self.region_coarse),
            ("work_hours", &self.work_hours),
            ("ui_format_prefs", &self.ui_format_prefs),
            ("goals_mood", &self.goals_mood),
            ("decisions_tasks", &self.decisions_tasks),
            ("brevity", &self.brevity),
            ("format_defaults", &self.format_defaults),
            ("interests_topics", &self.interests_topics),
            ("workflow_tools", &self.workflow_tools),
            ("os", &self.os),
            ("runtime", &self.runtime),
            ("hardware_hint", &self.hardware_hint),
        ];
        let lines: Vec<String> = fields
            .into_iter()
            .filter_map(|(k, v)| v.as_ref().map(|v| format!("{k}: {v}")))
            .collect();
        if lines.is_empty() {
            None
        } else {
            Some(lines.join("\n"))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStatus {
    Ok,
    Cancelled,
    Error,
}

impl ResponseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResponseStatus::Ok => "ok",
            ResponseStatus::Cancelled => "cancelled",
            ResponseStatus::Error => "error",
        }
    }
}

impl ToSql for ResponseStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for ResponseStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        match value.as_str()? {
            "ok" => Ok(ResponseStatus::Ok),
            "cancelled" => Ok(ResponseStatus::Cancelled),
            "error" => Ok(ResponseStatus::Error),
            other => Err(FromSqlError::Other(
                format!("unknown response status: {other}").into(),
            )),
        }
    }
}

/// One row per completed (or cancelled) generation (SPEC_FULL.md §11).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseRecord {
    pub id: i64,
    pub thread_id: String,
    pub status: ResponseStatus,
    pub model: Option<String>,
    pub prompt_tokens: Option<i64>,
    pub completion_tokens: Option<i64>,
    pub diagnostics_json: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl ResponseRecord {
    pub(crate) fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            thread_id: row.get("thread_id")?,
            status: row.get("status")?,
            model: row.get("model")?,
            prompt_tokens: row.get("prompt_tokens")?,
            completion_tokens: row.get("completion_tokens")?,
            diagnostics_json: row.get("diagnostics_json")?,
            created_at: row.get("created_at")?,
        })
    }
}

/// One row per tool invocation observed while streaming a reply
/// (SPEC_FULL.md §11). The core subsystem only reads aggregate token counts
/// from this table; it never writes rows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolRun {
    pub id: i64,
    pub thread_id: String,
    pub tool_name: String,
    pub arguments: Option<String>,
    pub result: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl ToolRun {
    pub(crate) fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            thread_id: row.get("thread_id")?,
            tool_name: row.get("tool_name")?,
            arguments: row.get("arguments")?,
            result: row.get("result")?,
            created_at: row.get("created_at")?,
        })
    }
}
