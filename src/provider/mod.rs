//! Upstream OpenAI-compatible backend client (spec §6 collaborator).
//!
//! The gateway talks to exactly one upstream: `POST /v1/chat/completions`
//! (non-streaming for token probes and summarization, streaming SSE for
//! generation) and `GET /api/v0/models/{id}` / `GET /api/v0/models` for
//! model info.

mod error;
mod openai_compatible;
pub mod types;

#[cfg(test)]
pub mod mock;

pub use error::{ProviderError, Result};
pub use openai_compatible::OpenAiCompatibleProvider;
pub use types::*;

use async_trait::async_trait;
use futures::stream::BoxStream;

/// The single upstream backend the gateway is configured against.
///
/// All three spec collaborators that talk to the upstream — the token
/// counter (C1), the model-info cache (C2), and generation/summarization —
/// go through this trait so tests can swap in a scripted mock.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Non-streaming chat completion. Used directly for summarization, and
    /// as the underlying call for the token-counting probe (`max_tokens=1`).
    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse>;

    /// Streaming chat completion for generation. Yields content deltas.
    async fn chat_stream(&self, request: ChatRequest) -> Result<BoxStream<'static, Result<String>>>;

    /// Fetch model info for `model_id`, falling back from the single-model
    /// endpoint to the list endpoint per spec §7's incomplete-info handling.
    async fn model_info(&self, model_id: &str) -> Result<ModelInfo>;
}
