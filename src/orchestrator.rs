//! Orchestrator (C9).
//!
//! Per-request glue: ensure the thread, persist the user turn, assemble
//! context (which runs the preflight cascade internally), stream the reply
//! from upstream, persist the outcome, then run the post-reply normalizer
//! (spec §4.9). A per-thread async mutex serializes "assemble → call
//! upstream → persist → normalize" on one thread while leaving other
//! threads free to run concurrently (spec §5).

use crate::budget::{BudgetVector, effective_max_output_tokens};
use crate::config::{ContextConfig, MemoryConfig};
use crate::db::{ResponseStatus, Role};
use crate::memory::{self, AssembleInput, AssemblyDiagnostics, MemoryStore, Summarizer};
use crate::model_info::ModelInfoCache;
use crate::provider::{ChatRequest, Provider};
use anyhow::Result;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{mpsc, Mutex as AsyncMutex};

pub struct TurnRequest {
    /// Existing thread to continue, or `None` to start a new one.
    pub thread_id: Option<String>,
    pub model_id: String,
    pub user_text: String,
    pub requested_max_output_tokens: Option<u32>,
    pub tool_results_text: Option<String>,
    pub tool_results_tokens: Option<u32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TurnDiagnostics {
    pub thread_id: String,
    pub effective_max_output_tokens: u32,
    pub context_budget: BudgetVector,
    pub context_assembly: AssemblyDiagnostics,
    pub compaction_steps: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct TurnOutcome {
    pub thread_id: String,
    pub content: String,
    pub status: ResponseStatus,
    pub diagnostics: TurnDiagnostics,
}

/// One event of a streamed turn, surfaced to the API layer (spec §6
/// diagnostic surface, delivered as a trailing event per §4.9 step 5).
pub enum TurnEvent {
    Delta(String),
    Done(TurnOutcome),
    Error(String),
}

#[derive(Clone)]
pub struct Orchestrator {
    store: MemoryStore,
    provider: Arc<dyn Provider>,
    summarizer: Arc<dyn Summarizer>,
    model_info_cache: Arc<ModelInfoCache>,
    ctx: ContextConfig,
    mem: MemoryConfig,
    thread_locks: Arc<StdMutex<HashMap<String, Arc<AsyncMutex<()>>>>>,
}

impl Orchestrator {
    pub fn new(
        store: MemoryStore,
        provider: Arc<dyn Provider>,
        summarizer: Arc<dyn Summarizer>,
        model_info_cache: Arc<ModelInfoCache>,
        ctx: ContextConfig,
        mem: MemoryConfig,
    ) -> Self {
        Self {
            store,
            provider,
            summarizer,
            model_info_cache,
            ctx,
            mem,
            thread_locks: Arc::new(StdMutex::new(HashMap::new())),
        }
    }

    fn lock_for(&self, thread_id: &str) -> Arc<AsyncMutex<()>> {
        self.thread_locks
            .lock()
            .unwrap()
            .entry(thread_id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// The `ctx` copy with `ctx_default_context_length` resolved through the
    /// model-info cache, the contract `run_post_reply` documents.
    async fn resolve_ctx(&self, model_id: &str) -> ContextConfig {
        let info = self.model_info_cache.fetch_with_busy_poll(self.provider.as_ref(), model_id).await;
        let mut resolved = self.ctx.clone();
        resolved.ctx_default_context_length = self.model_info_cache.window(&info);
        resolved
    }

    /// Run one turn to completion, aggregating the streamed reply. Handy for
    /// tests and any non-streaming caller; `stream_turn` is what the HTTP/SSE
    /// layer drives.
    pub async fn run_turn(&self, request: TurnRequest) -> Result<TurnOutcome> {
        // Call `run_inner` directly rather than going through `stream_turn`/
        // `execute`: that path stringifies a hard failure into
        // `TurnEvent::Error(String)`, which would lose the underlying
        // `ProviderError` the HTTP layer needs to map to 502 (spec §7/S6).
        let (tx, mut rx) = mpsc::channel(128);
        let drain = tokio::spawn(async move { while rx.recv().await.is_some() {} });
        let result = self.run_inner(request, &tx).await;
        drop(tx);
        let _ = drain.await;
        result
    }

    /// Stream one turn: text deltas as they arrive from upstream, followed
    /// by exactly one terminal `Done`/`Error` event.
    pub async fn stream_turn(&self, request: TurnRequest) -> BoxStream<'static, TurnEvent> {
        let (tx, mut rx) = mpsc::channel(128);
        let this = self.clone();
        tokio::spawn(async move {
            this.execute(request, tx).await;
        });

        let stream = async_stream::stream! {
            while let Some(event) = rx.recv().await {
                yield event;
            }
        };
        Box::pin(stream)
    }

    async fn execute(&self, request: TurnRequest, tx: mpsc::Sender<TurnEvent>) {
        match self.run_inner(request, &tx).await {
            Ok(outcome) => {
                let _ = tx.send(TurnEvent::Done(outcome)).await;
            }
            Err(e) => {
                tracing::error!(error = %e, "turn failed");
                let _ = tx.send(TurnEvent::Error(e.to_string())).await;
            }
        }
    }

    async fn run_inner(&self, request: TurnRequest, tx: &mpsc::Sender<TurnEvent>) -> Result<TurnOutcome> {
        let thread = match &request.thread_id {
            Some(id) => self.store.ensure_thread(id).await?,
            None => self.store.create_thread(None).await?,
        };

        let lock = self.lock_for(&thread.id);
        let _guard = lock.lock().await;

        let user_message = self
            .store
            .append_message(&thread.id, Role::User, &request.user_text, None)
            .await?;

        let assemble_input = AssembleInput {
            thread_id: &thread.id,
            model_id: &request.model_id,
            max_output_tokens: request.requested_max_output_tokens,
            tool_results_text: request.tool_results_text.clone(),
            tool_results_tokens: request.tool_results_tokens,
            last_user_lang: Some(request.user_text.clone()),
            current_user_text: &request.user_text,
            current_user_id: user_message.id,
        };

        let assembled = memory::assemble_context(
            &self.store,
            self.provider.as_ref(),
            self.summarizer.as_ref(),
            &self.model_info_cache,
            &self.ctx,
            &self.mem,
            assemble_input,
        )
        .await?;

        let effective_max_output_tokens = effective_max_output_tokens(
            request.requested_max_output_tokens.unwrap_or(self.ctx.ctx_rout_default),
            self.ctx.r_out_floor,
            assembled.diagnostics.free_out_cap,
        );

        let chat_request = ChatRequest::new(request.model_id.clone(), assembled.messages.clone())
            .with_max_tokens(effective_max_output_tokens)
            .streaming();

        let mut content = String::new();
        let mut status = ResponseStatus::Ok;
        match self.provider.chat_stream(chat_request).await {
            Ok(mut deltas) => {
                while let Some(chunk) = deltas.next().await {
                    match chunk {
                        Ok(text) => {
                            content.push_str(&text);
                            if tx.send(TurnEvent::Delta(text)).await.is_err() {
                                // receiver gone: caller disconnected mid-stream.
                                status = ResponseStatus::Cancelled;
                                break;
                            }
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, thread_id = %thread.id, "generation stream errored");
                            status = ResponseStatus::Error;
                            break;
                        }
                    }
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, thread_id = %thread.id, "failed to start generation stream");
                // Nothing was generated: surface this as a hard failure
                // (spec §7/S6 — upstream down) instead of a fake 200 with an
                // empty assistant message and `status: error`.
                return Err(anyhow::Error::new(e));
            }
        }

        self.store.append_message(&thread.id, Role::Assistant, &content, None).await?;

        let diagnostics = TurnDiagnostics {
            thread_id: thread.id.clone(),
            effective_max_output_tokens,
            context_budget: assembled.budget.clone(),
            context_assembly: assembled.diagnostics.clone(),
            compaction_steps: assembled.diagnostics.preflight_steps.clone(),
        };
        let diagnostics_json = serde_json::to_string(&diagnostics).ok();

        self.store
            .insert_response_record(
                &thread.id,
                status,
                Some(&request.model_id),
                Some(assembled.diagnostics.fill_pct as i64),
                Some(content.len() as i64 / 4),
                diagnostics_json.as_deref(),
            )
            .await?;

        let ctx_resolved = self.resolve_ctx(&request.model_id).await;
        let post_reply = memory::run_post_reply(
            &self.store,
            self.provider.as_ref(),
            self.summarizer.as_ref(),
            &ctx_resolved,
            &self.mem,
            &thread.id,
            &request.model_id,
        )
        .await?;

        let mut diagnostics = diagnostics;
        diagnostics.compaction_steps.extend(post_reply.steps);

        Ok(TurnOutcome {
            thread_id: thread.id,
            content,
            status,
            diagnostics,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::db::Database;
    use crate::memory::DefaultSummarizer;
    use crate::provider::mock::MockProvider;

    async fn setup() -> (Orchestrator, Arc<MockProvider>) {
        let db = Database::connect_in_memory().await.unwrap();
        let store = MemoryStore::new(db);
        let provider: Arc<MockProvider> = Arc::new(MockProvider::new(vec!["hello there", "general kenobi"]));
        let cfg = Config::default();
        let summarizer = Arc::new(DefaultSummarizer::new(provider.clone(), "mock-model", cfg.memory.clone()));
        let cache = Arc::new(ModelInfoCache::new(cfg.context.ctx_model_info_ttl_sec, cfg.context.ctx_default_context_length));
        let orchestrator = Orchestrator::new(
            store,
            provider.clone() as Arc<dyn Provider>,
            summarizer as Arc<dyn Summarizer>,
            cache,
            cfg.context.clone(),
            cfg.memory.clone(),
        );
        (orchestrator, provider)
    }

    #[tokio::test]
    async fn completes_a_turn_and_persists_both_messages() {
        let (orchestrator, _provider) = setup().await;
        let request = TurnRequest {
            thread_id: None,
            model_id: "mock-model".to_string(),
            user_text: "hello".to_string(),
            requested_max_output_tokens: Some(128),
            tool_results_text: None,
            tool_results_tokens: None,
        };

        let outcome = orchestrator.run_turn(request).await.unwrap();
        assert_eq!(outcome.status, ResponseStatus::Ok);
        assert!(!outcome.content.is_empty());
        assert!(outcome.diagnostics.effective_max_output_tokens > 0);
    }

    #[tokio::test]
    async fn continuing_an_existing_thread_keeps_the_same_id() {
        let (orchestrator, _provider) = setup().await;
        let first = orchestrator
            .run_turn(TurnRequest {
                thread_id: None,
                model_id: "mock-model".to_string(),
                user_text: "first".to_string(),
                requested_max_output_tokens: None,
                tool_results_text: None,
                tool_results_tokens: None,
            })
            .await
            .unwrap();

        let second = orchestrator
            .run_turn(TurnRequest {
                thread_id: Some(first.thread_id.clone()),
                model_id: "mock-model".to_string(),
                user_text: "second".to_string(),
                requested_max_output_tokens: None,
                tool_results_text: None,
                tool_results_tokens: None,
            })
            .await
            .unwrap();

        assert_eq!(first.thread_id, second.thread_id);
    }

    #[tokio::test]
    async fn a_stream_that_fails_to_start_surfaces_as_an_error_not_an_empty_ok() {
        let db = Database::connect_in_memory().await.unwrap();
        let store = MemoryStore::new(db);
        let provider: Arc<MockProvider> = Arc::new(MockProvider::new(vec!["ok"]).with_stream_failure());
        let cfg = Config::default();
        let summarizer = Arc::new(DefaultSummarizer::new(provider.clone(), "mock-model", cfg.memory.clone()));
        let cache = Arc::new(ModelInfoCache::new(cfg.context.ctx_model_info_ttl_sec, cfg.context.ctx_default_context_length));
        let orchestrator = Orchestrator::new(
            store,
            provider.clone() as Arc<dyn Provider>,
            summarizer as Arc<dyn Summarizer>,
            cache,
            cfg.context.clone(),
            cfg.memory.clone(),
        );

        let request = TurnRequest {
            thread_id: None,
            model_id: "mock-model".to_string(),
            user_text: "hello".to_string(),
            requested_max_output_tokens: Some(128),
            tool_results_text: None,
            tool_results_tokens: None,
        };

        let err = orchestrator.run_turn(request).await.unwrap_err();
        assert!(err.downcast_ref::<crate::provider::ProviderError>().is_some());
    }
}
