//! Scripted mock provider for tests, mirroring the teacher's
//! `MockProvider`/`MockProviderWithTools` pattern: no network calls,
//! deterministic, script-driven responses.

use super::*;
use std::sync::Mutex;

/// Replies with a fixed script of texts in order, cycling the last entry
/// once exhausted. Useful for scripting "empty then meaningful" summaries
/// for the L3 quality-retry tests.
pub struct MockProvider {
    script: Mutex<Vec<String>>,
    model_info: ModelInfo,
    prompt_tokens_per_call: u32,
    fail_stream: bool,
}

impl MockProvider {
    pub fn new(script: Vec<&str>) -> Self {
        Self {
            script: Mutex::new(script.into_iter().map(String::from).collect()),
            model_info: ModelInfo {
                model_id: "mock-model".to_string(),
                loaded_context_length: Some(8192),
                max_context_length: Some(8192),
                state: Some("loaded".to_string()),
                source: ModelInfoSource::LoadedContextLength,
            },
            prompt_tokens_per_call: 10,
            fail_stream: false,
        }
    }

    pub fn with_model_info(mut self, info: ModelInfo) -> Self {
        self.model_info = info;
        self
    }

    /// Make `chat_stream` fail to start, as if the upstream were unreachable.
    pub fn with_stream_failure(mut self) -> Self {
        self.fail_stream = true;
        self
    }

    fn next_text(&self) -> String {
        let mut script = self.script.lock().unwrap();
        if script.len() > 1 {
            script.remove(0)
        } else {
            script.first().cloned().unwrap_or_default()
        }
    }
}

#[async_trait]
impl Provider for MockProvider {
    async fn chat(&self, _request: ChatRequest) -> Result<ChatResponse> {
        let text = self.next_text();
        Ok(ChatResponse {
            id: "mock-response".to_string(),
            model: self.model_info.model_id.clone(),
            choices: vec![ChatChoice {
                index: 0,
                message: ChatResponseMessage {
                    role: "assistant".to_string(),
                    content: text,
                },
                finish_reason: Some("stop".to_string()),
            }],
            usage: Some(Usage {
                prompt_tokens: self.prompt_tokens_per_call,
                completion_tokens: 5,
                total_tokens: self.prompt_tokens_per_call + 5,
            }),
        })
    }

    async fn chat_stream(&self, request: ChatRequest) -> Result<BoxStream<'static, Result<String>>> {
        if self.fail_stream {
            return Err(ProviderError::ModelNotLoaded);
        }
        let response = self.chat(request).await?;
        let text = response.first_content().to_string();
        let chunks: Vec<Result<String>> = text
            .split_inclusive(' ')
            .map(|s| Ok(s.to_string()))
            .collect();
        Ok(Box::pin(futures::stream::iter(chunks)))
    }

    async fn model_info(&self, _model_id: &str) -> Result<ModelInfo> {
        Ok(self.model_info.clone())
    }
}
