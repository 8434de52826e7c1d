//! Wire types for the OpenAI-compatible chat completions and model-info
//! endpoints. Only the fields the core subsystem actually consumes (spec
//! §6) are modeled; everything else is accepted and ignored.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    pub stream: bool,
}

impl ChatRequest {
    pub fn new(model: impl Into<String>, messages: Vec<ChatMessage>) -> Self {
        Self {
            model: model.into(),
            messages,
            max_tokens: None,
            temperature: None,
            stream: false,
        }
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn streaming(mut self) -> Self {
        self.stream = true;
        self
    }

    /// A probe request with `max_tokens=1`, used by the token counter (C1) to
    /// recover `usage.prompt_tokens` without paying for a real completion.
    pub fn probe(model: impl Into<String>, messages: Vec<ChatMessage>) -> Self {
        Self::new(model, messages).with_max_tokens(1)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatResponse {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub model: String,
    pub choices: Vec<ChatChoice>,
    #[serde(default)]
    pub usage: Option<Usage>,
}

impl ChatResponse {
    pub fn first_content(&self) -> &str {
        self.choices
            .first()
            .map(|c| c.message.content.as_str())
            .unwrap_or("")
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatChoice {
    #[serde(default)]
    pub index: u32,
    pub message: ChatResponseMessage,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatResponseMessage {
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub content: String,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u32,
    #[serde(default)]
    pub completion_tokens: u32,
    #[serde(default)]
    pub total_tokens: u32,
}

/// SSE delta chunk shape (`choices[0].delta.content`).
#[derive(Debug, Clone, Deserialize)]
pub struct ChatStreamChunk {
    pub choices: Vec<ChatStreamChoice>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatStreamChoice {
    #[serde(default)]
    pub delta: ChatStreamDelta,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChatStreamDelta {
    #[serde(default)]
    pub content: Option<String>,
}

/// Normalized model-info result. `source` tags where the window came from,
/// mirroring the three-tier fallback in spec §4.2 / §7.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    pub model_id: String,
    pub loaded_context_length: Option<u32>,
    pub max_context_length: Option<u32>,
    pub state: Option<String>,
    pub source: ModelInfoSource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelInfoSource {
    /// `loaded_context_length` was present — the model is actually loaded.
    LoadedContextLength,
    /// Only `max_context_length` (the model's ceiling) was available.
    MaxContextLength,
    /// Probe failed entirely; using `CTX_DEFAULT_CONTEXT_LENGTH`.
    Default,
}

/// Raw shape of `GET /api/v0/models/{id}` and each element of
/// `GET /api/v0/models`. Alternate key names are normalized by the caller
/// (spec §7: `context_length`, `context_window`, `ctx_window`, `max_ctx`,
/// `n_ctx`, `max_position_embeddings`).
#[derive(Debug, Clone, Deserialize)]
pub struct RawModelInfo {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub loaded_context_length: Option<u32>,
    #[serde(default)]
    pub max_context_length: Option<u32>,
    #[serde(default)]
    pub context_length: Option<u32>,
    #[serde(default)]
    pub context_window: Option<u32>,
    #[serde(default)]
    pub ctx_window: Option<u32>,
    #[serde(default)]
    pub max_ctx: Option<u32>,
    #[serde(default)]
    pub n_ctx: Option<u32>,
    #[serde(default)]
    pub max_position_embeddings: Option<u32>,
}

impl RawModelInfo {
    pub fn matches(&self, model_id: &str) -> bool {
        self.id.as_deref() == Some(model_id)
            || self.model.as_deref() == Some(model_id)
            || self.name.as_deref() == Some(model_id)
    }

    /// Best-effort maximum context length, trying every alternate key name
    /// lmstudio_model_info.py's `pick()` helper checked.
    pub fn pick_max_context_length(&self) -> Option<u32> {
        self.max_context_length
            .or(self.context_length)
            .or(self.context_window)
            .or(self.ctx_window)
            .or(self.max_ctx)
            .or(self.n_ctx)
            .or(self.max_position_embeddings)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawModelList {
    #[serde(default)]
    pub data: Vec<RawModelInfo>,
}
