//! OpenAI-compatible HTTP client for the single configured upstream (e.g.
//! LM Studio, Ollama, or any server that speaks the chat-completions
//! protocol).

use super::error::{ProviderError, Result};
use super::types::*;
use super::Provider;
use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use reqwest::Client;
use reqwest_eventsource::{Event, EventSource};
use std::time::Duration;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone)]
pub struct OpenAiCompatibleProvider {
    base_url: String,
    api_key: Option<String>,
    client: Client,
}

impl OpenAiCompatibleProvider {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Self {
        let client = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .connect_timeout(DEFAULT_CONNECT_TIMEOUT)
            .pool_max_idle_per_host(4)
            .build()
            .expect("failed to build upstream http client");

        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            client,
        }
    }

    fn headers(&self) -> reqwest::header::HeaderMap {
        let mut headers = reqwest::header::HeaderMap::new();
        if let Some(key) = self.api_key.as_deref().filter(|k| !k.is_empty()) {
            let clean_key = key.trim();
            if let Ok(value) = format!("Bearer {clean_key}").parse() {
                headers.insert(reqwest::header::AUTHORIZATION, value);
            }
        }
        headers.insert(
            reqwest::header::CONTENT_TYPE,
            "application/json".parse().expect("valid content-type"),
        );
        headers
    }

    async fn handle_error(response: reqwest::Response) -> ProviderError {
        let status = response.status().as_u16();
        if status == 404 {
            return ProviderError::ModelNotLoaded;
        }
        let message = response
            .text()
            .await
            .unwrap_or_else(|_| "<no body>".to_string());
        ProviderError::Api { status, message }
    }
}

#[async_trait]
impl Provider for OpenAiCompatibleProvider {
    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse> {
        let url = format!("{}/v1/chat/completions", self.base_url);
        let response = self
            .client
            .post(&url)
            .headers(self.headers())
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Self::handle_error(response).await);
        }

        let body: ChatResponse = response.json().await?;
        Ok(body)
    }

    async fn chat_stream(&self, request: ChatRequest) -> Result<BoxStream<'static, Result<String>>> {
        let url = format!("{}/v1/chat/completions", self.base_url);
        let request = ChatRequest {
            stream: true,
            ..request
        };

        let builder = self.client.post(&url).headers(self.headers()).json(&request);
        let mut source = EventSource::new(builder)
            .map_err(|e| ProviderError::Stream(e.to_string()))?;

        let stream = async_stream::stream! {
            while let Some(event) = source.next().await {
                match event {
                    Ok(Event::Open) => continue,
                    Ok(Event::Message(msg)) => {
                        if msg.data == "[DONE]" {
                            break;
                        }
                        match serde_json::from_str::<ChatStreamChunk>(&msg.data) {
                            Ok(chunk) => {
                                if let Some(choice) = chunk.choices.first()
                                    && let Some(content) = &choice.delta.content
                                    && !content.is_empty()
                                {
                                    yield Ok(content.clone());
                                }
                            }
                            Err(e) => {
                                tracing::warn!(error = %e, "failed to decode stream chunk");
                            }
                        }
                    }
                    Err(e) => {
                        yield Err(ProviderError::Stream(e.to_string()));
                        break;
                    }
                }
            }
            source.close();
        };

        Ok(Box::pin(stream))
    }

    async fn model_info(&self, model_id: &str) -> Result<ModelInfo> {
        let direct_url = format!("{}/api/v0/models/{model_id}", self.base_url);
        let direct = self
            .client
            .get(&direct_url)
            .headers(self.headers())
            .send()
            .await?;

        if direct.status().is_success() {
            let raw: RawModelInfo = direct.json().await?;
            return Ok(normalize_model_info(model_id, raw));
        }

        // Single-model endpoint missed; fall back to the list endpoint and
        // search by id/model/name (spec §7 "model-info incomplete" path).
        let list_url = format!("{}/api/v0/models", self.base_url);
        let list = self
            .client
            .get(&list_url)
            .headers(self.headers())
            .send()
            .await?;

        if !list.status().is_success() {
            return Err(Self::handle_error(list).await);
        }

        let list: RawModelList = list.json().await?;
        let found = list.data.into_iter().find(|m| m.matches(model_id));
        match found {
            Some(raw) => Ok(normalize_model_info(model_id, raw)),
            None => Ok(ModelInfo {
                model_id: model_id.to_string(),
                loaded_context_length: None,
                max_context_length: None,
                state: None,
                source: ModelInfoSource::Default,
            }),
        }
    }
}

fn normalize_model_info(model_id: &str, raw: RawModelInfo) -> ModelInfo {
    let max = raw.pick_max_context_length();
    let source = if raw.loaded_context_length.is_some() {
        ModelInfoSource::LoadedContextLength
    } else if max.is_some() {
        ModelInfoSource::MaxContextLength
    } else {
        ModelInfoSource::Default
    };
    ModelInfo {
        model_id: model_id.to_string(),
        loaded_context_length: raw.loaded_context_length,
        max_context_length: max,
        state: raw.state,
        source,
    }
}
