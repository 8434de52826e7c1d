//! Context Assembler (C6).
//!
//! Builds the provider message list in the fixed order system → L3 → L2 →
//! L1 → current user turn, filling L1 newest-to-oldest under the per-layer
//! caps and the `C_base` invariant (spec §4.6). Internally runs the
//! preflight cascade (C7) before producing the final list, rebuilding the
//! snapshot after each compaction step.

use crate::budget::{BudgetVector, compute_budget};
use crate::config::{ContextConfig, MemoryConfig};
use crate::db::{L2Summary, L3MicroSummary, Message, Role};
use crate::memory::compactor;
use crate::memory::store::MemoryStore;
use crate::memory::summarizer::Summarizer;
use crate::model_info::ModelInfoCache;
use crate::provider::{ChatMessage, Provider};
use crate::tokenizer::{self, TokenCountMode};
use anyhow::Result;
use serde::Serialize;

pub struct AssembleInput<'a> {
    pub thread_id: &'a str,
    pub model_id: &'a str,
    pub max_output_tokens: Option<u32>,
    pub tool_results_text: Option<String>,
    pub tool_results_tokens: Option<u32>,
    pub last_user_lang: Option<String>,
    pub current_user_text: &'a str,
    pub current_user_id: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Includes {
    pub l3_ids: Vec<i64>,
    pub l2_pairs: Vec<(i64, i64)>,
    pub l1_pairs: Vec<(i64, i64)>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AssemblyDiagnostics {
    pub l1_pairs_count: usize,
    pub free_out_cap: i64,
    pub fill_pct: f64,
    pub free_pct: f64,
    pub includes: Includes,
    pub l1_order_preview: Vec<i64>,
    pub token_count_mode: &'static str,
    pub preflight_steps: Vec<String>,
}

pub struct AssembledContext {
    pub messages: Vec<ChatMessage>,
    pub budget: BudgetVector,
    pub diagnostics: AssemblyDiagnostics,
}

/// Everything the cascade needs to decide whether another compaction step
/// is warranted, plus what C6 needs to render the final message list.
pub(crate) struct Snapshot {
    pub l1_pairs: Vec<(Message, Message)>,
    pub l1_tokens: u32,
    pub l2: Vec<L2Summary>,
    pub l2_tokens: u32,
    pub l3: Vec<L3MicroSummary>,
    pub l3_tokens: u32,
    pub core_tokens: u32,
    pub tools_used: u32,
    pub tools_text: Option<String>,
    pub current_user_tokens: u32,
    pub budget: BudgetVector,
    /// `Approx` if any sub-count that went into this snapshot fell back to
    /// the heuristic (upstream down, or `token_count_mode = "approx"`).
    pub token_count_mode: TokenCountMode,
}

impl Snapshot {
    pub fn total_prompt_tokens(&self) -> u32 {
        self.core_tokens + self.tools_used + self.l3_tokens + self.l2_tokens + self.l1_tokens + self.current_user_tokens
    }

    pub fn free_out_cap(&self) -> i64 {
        self.budget.free_out_cap(self.total_prompt_tokens())
    }
}

fn resolve_lang(profile_lang: Option<&str>, last_user_text: Option<&str>) -> String {
    if let Some(text) = last_user_text
        && text.chars().any(|c| ('\u{0400}'..='\u{04FF}').contains(&c))
    {
        return "ru".to_string();
    }
    profile_lang.map(str::to_string).unwrap_or_else(|| "en".to_string())
}

/// `lang` (resolved via [`resolve_lang`]) is the one authoritative language
/// line; `Profile::render()` also emits a raw `preferred_language: …` line
/// when the profile has one set, so that line is dropped here to avoid
/// showing the same fact twice under two different names.
fn render_core_text(profile: &crate::db::Profile, lang: &str) -> String {
    let mut lines = vec![format!("Language: {lang}")];
    if let Some(rendered) = profile.render() {
        lines.extend(
            rendered
                .lines()
                .filter(|line| !line.starts_with("preferred_language:"))
                .map(str::to_string),
        );
    }
    lines.join("\n")
}

fn pair_messages(messages: &[Message]) -> Vec<(Message, Message)> {
    let mut pairs = Vec::new();
    let mut pending_user: Option<Message> = None;
    for m in messages {
        match m.role {
            Role::User => pending_user = Some(m.clone()),
            Role::Assistant => {
                if let Some(u) = pending_user.take() {
                    pairs.push((u, m.clone()));
                }
            }
            _ => {}
        }
    }
    pairs
}

async fn pair_tokens(
    provider: &dyn Provider,
    model_id: &str,
    pair: &(Message, Message),
    ctx: &ContextConfig,
) -> (u32, TokenCountMode) {
    let messages = [
        ChatMessage::user(pair.0.content.clone()),
        ChatMessage::assistant(pair.1.content.clone()),
    ];
    let count = tokenizer::count_chat(provider, model_id, &messages, ctx).await;
    (count.tokens, count.mode)
}

/// Fill L1 newest-to-oldest under `budget.l1_cap`, then guarantee
/// `mem.l1_min_pairs` regardless of the cap (spec §4.6 steps 7-8).
async fn fill_l1(
    provider: &dyn Provider,
    model_id: &str,
    all_pairs: &[(Message, Message)],
    budget: &BudgetVector,
    mem: &MemoryConfig,
    fixed_tokens: u32,
    ctx: &ContextConfig,
) -> (Vec<(Message, Message)>, u32, TokenCountMode) {
    let mut chosen: Vec<(Message, Message)> = Vec::new();
    let mut l1_tokens: u32 = 0;
    let mut mode = TokenCountMode::ProxyHttp;

    for pair in all_pairs.iter().rev() {
        let (tokens, pair_mode) = pair_tokens(provider, model_id, pair, ctx).await;
        let trial_l1_tokens = l1_tokens + tokens;
        let trial_total = fixed_tokens + trial_l1_tokens;
        let remaining = budget.c_base as i64 - trial_total as i64 - budget.r_sys as i64 - budget.safety as i64;
        if trial_l1_tokens <= budget.l1_cap && remaining >= 0 {
            chosen.insert(0, pair.clone());
            l1_tokens = trial_l1_tokens;
            if pair_mode == TokenCountMode::Approx {
                mode = TokenCountMode::Approx;
            }
        } else {
            break;
        }
    }

    let mut start_idx = all_pairs.len() - chosen.len();
    while chosen.len() < mem.l1_min_pairs && start_idx > 0 {
        start_idx -= 1;
        let pair = all_pairs[start_idx].clone();
        let (tokens, pair_mode) = pair_tokens(provider, model_id, &pair, ctx).await;
        l1_tokens += tokens;
        if pair_mode == TokenCountMode::Approx {
            mode = TokenCountMode::Approx;
        }
        chosen.insert(0, pair);
    }

    (chosen, l1_tokens, mode)
}

/// Build a fresh snapshot of all four layers against the live store state.
pub(crate) async fn build_snapshot(
    store: &MemoryStore,
    provider: &dyn Provider,
    ctx: &ContextConfig,
    mem: &MemoryConfig,
    input: &AssembleInput<'_>,
) -> Result<Snapshot> {
    let profile = store.get_profile().await?;
    let lang = resolve_lang(profile.preferred_language.as_deref(), input.last_user_lang.as_deref());
    let core_text = render_core_text(&profile, &lang);
    let core_tokens = tokenizer::approx_tokens_text(&core_text);
    let core_cap = (1.10 * core_tokens as f64).ceil() as u32;

    // `assemble_context` resolves the model window through the model-info
    // cache and writes it here before calling this function; `run_post_reply`
    // is responsible for doing the same for its own `ctx` copy.
    let c_base = ctx.ctx_default_context_length;

    let l2 = store.get_l2_asc(input.thread_id, usize::MAX).await?;
    let l3 = store.get_l3_asc(input.thread_id, usize::MAX).await?;
    let l2_tokens: u32 = l2.iter().map(|s| s.tokens as u32).sum();
    let l3_tokens: u32 = l3.iter().map(|s| s.tokens as u32).sum();

    let tools_raw = input
        .tool_results_tokens
        .unwrap_or_else(|| input.tool_results_text.as_deref().map(tokenizer::approx_tokens_text).unwrap_or(0));

    let budget = compute_budget(c_base, input.max_output_tokens, core_tokens, core_cap, tools_raw, ctx, mem);

    let tools_text = input.tool_results_text.as_ref().map(|text| {
        let max_chars = (budget.tools_cap as usize) * 4;
        text.chars().take(max_chars).collect::<String>()
    });

    let current_user_count = tokenizer::count_text(provider, input.model_id, input.current_user_text, ctx).await;
    let current_user_tokens = current_user_count.tokens;
    let mut mode = current_user_count.mode;

    let history = store
        .get_messages_asc(input.thread_id, Some(input.current_user_id), usize::MAX)
        .await?;
    let l1_floor = store
        .memory_state_read(input.thread_id)
        .await?
        .last_compacted_message_id
        .unwrap_or(0);
    let all_pairs: Vec<_> = pair_messages(&history)
        .into_iter()
        .filter(|(_, assistant)| assistant.id > l1_floor)
        .collect();

    let fixed_tokens = core_tokens + budget.tools_cap + l3_tokens + l2_tokens + current_user_tokens;
    let (l1_pairs, l1_tokens, l1_mode) =
        fill_l1(provider, input.model_id, &all_pairs, &budget, mem, fixed_tokens, ctx).await;
    if l1_mode == TokenCountMode::Approx {
        mode = TokenCountMode::Approx;
    }

    Ok(Snapshot {
        l1_pairs,
        l1_tokens,
        l2,
        l2_tokens,
        l3,
        l3_tokens,
        core_tokens,
        tools_used: budget.tools_cap,
        tools_text,
        current_user_tokens,
        budget,
        token_count_mode: mode,
    })
}

fn render_prelude(core_text: &str, tools_text: Option<&str>) -> String {
    let mut out = String::from(
        "You are a helpful assistant. Use the conversation recap and tool results below as ground truth.",
    );
    out.push_str("\n\n─── CORE PROFILE ───\n");
    out.push_str(core_text);
    if let Some(tools) = tools_text
        && !tools.is_empty()
    {
        out.push_str("\n\n─── TOOL RESULTS ───\n");
        out.push_str(tools);
    }
    out
}

pub async fn assemble_context(
    store: &MemoryStore,
    provider: &dyn Provider,
    summarizer: &dyn Summarizer,
    model_info_cache: &ModelInfoCache,
    ctx: &ContextConfig,
    mem: &MemoryConfig,
    input: AssembleInput<'_>,
) -> Result<AssembledContext> {
    let window = model_info_cache.fetch_with_busy_poll(provider, input.model_id).await;
    let mut ctx_resolved = ctx.clone();
    ctx_resolved.ctx_default_context_length = model_info_cache.window(&window);

    let mut preflight_steps = Vec::new();
    for _ in 0..mem.compaction_iteration_cap {
        let snapshot = build_snapshot(store, provider, &ctx_resolved, mem, &input).await?;
        if !compactor::needs_compaction(&snapshot, mem, &ctx_resolved) {
            break;
        }
        match compactor::perform_one_step(store, summarizer, &snapshot, mem, &ctx_resolved).await? {
            Some(tag) => preflight_steps.push(tag),
            None => break,
        }
    }

    let profile = store.get_profile().await?;
    let lang = resolve_lang(profile.preferred_language.as_deref(), input.last_user_lang.as_deref());
    let core_text = render_core_text(&profile, &lang);

    let snapshot = build_snapshot(store, provider, &ctx_resolved, mem, &input).await?;

    let mut messages = Vec::new();
    messages.push(ChatMessage::system(render_prelude(&core_text, snapshot.tools_text.as_deref())));
    for l3 in &snapshot.l3 {
        messages.push(ChatMessage::assistant(format!("[L3 {}] {}", l3.id, l3.text)));
    }
    for l2 in &snapshot.l2 {
        messages.push(ChatMessage::assistant(format!(
            "[L2 {}-{}] {}",
            l2.start_message_id, l2.end_message_id, l2.text
        )));
    }
    for (user, assistant) in &snapshot.l1_pairs {
        messages.push(ChatMessage::user(user.content.clone()));
        messages.push(ChatMessage::assistant(assistant.content.clone()));
    }
    messages.push(ChatMessage::user(input.current_user_text.to_string()));

    let total = snapshot.total_prompt_tokens();
    let fill_pct = if snapshot.budget.c_base > 0 {
        (total as f64 / snapshot.budget.c_base as f64) * 100.0
    } else {
        0.0
    };

    let diagnostics = AssemblyDiagnostics {
        l1_pairs_count: snapshot.l1_pairs.len(),
        free_out_cap: snapshot.free_out_cap(),
        fill_pct,
        free_pct: 100.0 - fill_pct,
        includes: Includes {
            l3_ids: snapshot.l3.iter().map(|s| s.id).collect(),
            l2_pairs: snapshot.l2.iter().map(|s| (s.start_message_id, s.end_message_id)).collect(),
            l1_pairs: snapshot.l1_pairs.iter().map(|(u, a)| (u.id, a.id)).collect(),
        },
        l1_order_preview: snapshot.l1_pairs.iter().flat_map(|(u, a)| [u.id, a.id]).collect(),
        token_count_mode: snapshot.token_count_mode.as_str(),
        preflight_steps,
    };

    Ok(AssembledContext {
        messages,
        budget: snapshot.budget.clone(),
        diagnostics,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::db::{Database, Role};
    use crate::memory::summarizer::DefaultSummarizer;
    use crate::provider::mock::MockProvider;
    use std::sync::Arc;

    async fn setup() -> (MemoryStore, Arc<MockProvider>) {
        let db = Database::connect_in_memory().await.unwrap();
        (MemoryStore::new(db), Arc::new(MockProvider::new(vec!["ok"])))
    }

    #[tokio::test]
    async fn assembles_empty_thread_with_min_pairs_guarantee() {
        let (store, provider) = setup().await;
        let cfg = Config::default();
        let summarizer = DefaultSummarizer::new(provider.clone(), "mock-model", cfg.memory.clone());
        let cache = ModelInfoCache::new(300, 4096);

        let thread = store.create_thread(None).await.unwrap();
        for i in 0..3 {
            store
                .append_message(&thread.id, Role::User, &format!("question {i}"), None)
                .await
                .unwrap();
            store
                .append_message(&thread.id, Role::Assistant, &format!("answer {i}"), None)
                .await
                .unwrap();
        }
        let current = store.append_message(&thread.id, Role::User, "final question", None).await.unwrap();

        let input = AssembleInput {
            thread_id: &thread.id,
            model_id: "mock-model",
            max_output_tokens: Some(256),
            tool_results_text: None,
            tool_results_tokens: None,
            last_user_lang: None,
            current_user_text: "final question",
            current_user_id: current.id,
        };

        let assembled = assemble_context(
            &store,
            provider.as_ref(),
            &summarizer,
            &cache,
            &cfg.context,
            &cfg.memory,
            input,
        )
        .await
        .unwrap();

        assert!(assembled.diagnostics.l1_pairs_count >= cfg.memory.l1_min_pairs);
        assert_eq!(assembled.messages.last().unwrap().content, "final question");
    }
}
