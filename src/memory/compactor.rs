//! Preflight Compactor (C7) and Post-Reply Normalizer (C8).
//!
//! Both run the same fixed-priority cascade - L2→L3, then L1→L2, then
//! L3-evict - over a live snapshot of the store, one step per iteration,
//! capped at `mem.compaction_iteration_cap` (spec §4.7/§4.8).

use crate::config::{ContextConfig, MemoryConfig};
use crate::memory::assembler::{self, AssembleInput, Snapshot};
use crate::memory::store::MemoryStore;
use crate::memory::summarizer::Summarizer;
use crate::provider::Provider;
use anyhow::Result;

#[derive(Debug, Clone, Default)]
pub struct CompactionReport {
    pub steps: Vec<String>,
    pub stalled: bool,
}

enum StepOutcome {
    Performed(String),
    NotApplicable,
    Failed,
}

fn pct_exceeds(tokens: u32, cap: u32, high: u8) -> bool {
    if cap == 0 {
        return tokens > 0;
    }
    (tokens as u64 * 100) / (cap as u64) > high as u64
}

pub(crate) fn needs_compaction(snapshot: &Snapshot, mem: &MemoryConfig, ctx: &ContextConfig) -> bool {
    let need_more_room = snapshot.free_out_cap() < ctx.r_out_min as i64;
    need_more_room
        || pct_exceeds(snapshot.l1_tokens, snapshot.budget.l1_cap, mem.l1_high)
        || pct_exceeds(snapshot.l2_tokens, snapshot.budget.l2_cap, mem.l2_high)
        || pct_exceeds(snapshot.l3_tokens, snapshot.budget.l3_cap, mem.l3_high)
}

fn below_low_and_satisfied(snapshot: &Snapshot, mem: &MemoryConfig, ctx: &ContextConfig) -> bool {
    let free_ok = snapshot.free_out_cap() >= ctx.r_out_min as i64;
    let l1_ok = !pct_exceeds(snapshot.l1_tokens, snapshot.budget.l1_cap, mem.l1_low);
    let l2_ok = !pct_exceeds(snapshot.l2_tokens, snapshot.budget.l2_cap, mem.l2_low);
    let l3_ok = !pct_exceeds(snapshot.l3_tokens, snapshot.budget.l3_cap, mem.l3_low);
    free_ok && l1_ok && l2_ok && l3_ok
}

async fn attempt_l2_to_l3(
    store: &MemoryStore,
    summarizer: &dyn Summarizer,
    snapshot: &Snapshot,
    mem: &MemoryConfig,
    need_more_room: bool,
) -> Result<StepOutcome> {
    let over_high = pct_exceeds(snapshot.l2_tokens, snapshot.budget.l2_cap, mem.l2_high);
    let applicable = over_high || (need_more_room && !snapshot.l2.is_empty());
    if !applicable || snapshot.l2.is_empty() {
        return Ok(StepOutcome::NotApplicable);
    }

    let block: Vec<_> = snapshot.l2.iter().take(mem.l3_group_size).cloned().collect();
    match summarizer.summarize_l2_block_to_l3(&block).await {
        Some((text, tokens)) => {
            let ids: Vec<i64> = block.iter().map(|s| s.id).collect();
            store.insert_l3(&block[0].thread_id, &ids, &text, tokens as i64).await?;
            Ok(StepOutcome::Performed(format!("l2_to_l3_group:{}->1", block.len())))
        }
        None => {
            tracing::debug!(thread_id = %block[0].thread_id, "l2->l3 summary was not meaningful, leaving rows intact");
            Ok(StepOutcome::Failed)
        }
    }
}

async fn attempt_l1_to_l2(
    store: &MemoryStore,
    summarizer: &dyn Summarizer,
    snapshot: &Snapshot,
    mem: &MemoryConfig,
    need_more_room: bool,
) -> Result<StepOutcome> {
    let over_high = pct_exceeds(snapshot.l1_tokens, snapshot.budget.l1_cap, mem.l1_high);
    let applicable = over_high || (need_more_room && snapshot.l1_pairs.len() >= 2 * mem.l1_min_pairs);
    if !applicable {
        return Ok(StepOutcome::NotApplicable);
    }

    let available = snapshot.l1_pairs.len().saturating_sub(mem.l1_min_pairs);
    let k = mem.l2_group_size.min(available);
    if k == 0 {
        return Ok(StepOutcome::NotApplicable);
    }

    let group = &snapshot.l1_pairs[..k];
    let (text, tokens) = summarizer.summarize_pairs_group_to_l2(group).await;
    let start = group.first().unwrap().0.id;
    let end = group.last().unwrap().1.id;
    let thread_id = group[0].0.thread_id.clone();

    store.insert_l2(&thread_id, start, end, &text, tokens as i64).await?;
    store.raise_l1_floor(&thread_id, end).await?;

    Ok(StepOutcome::Performed(format!("l1_to_l2_group:{k}->1")))
}

async fn attempt_l3_evict(snapshot: &Snapshot, store: &MemoryStore, mem: &MemoryConfig, need_more_room: bool) -> Result<StepOutcome> {
    let over_high = pct_exceeds(snapshot.l3_tokens, snapshot.budget.l3_cap, mem.l3_high);
    let applicable = over_high || (need_more_room && !snapshot.l3.is_empty());
    if !applicable || snapshot.l3.is_empty() {
        return Ok(StepOutcome::NotApplicable);
    }
    let thread_id = &snapshot.l3[0].thread_id;
    let evicted = store.evict_l3_oldest(thread_id, 3).await?;
    Ok(StepOutcome::Performed(format!("l3_evict:{evicted}")))
}

/// Perform exactly one compaction step (first applicable wins), or `None` if
/// the cascade has stalled - nothing was applicable, or the only applicable
/// step (L2→L3) failed its meaningfulness check.
pub(crate) async fn perform_one_step(
    store: &MemoryStore,
    summarizer: &dyn Summarizer,
    snapshot: &Snapshot,
    mem: &MemoryConfig,
    ctx: &ContextConfig,
) -> Result<Option<String>> {
    let need_more_room = snapshot.free_out_cap() < ctx.r_out_min as i64;

    if let StepOutcome::Performed(tag) = attempt_l2_to_l3(store, summarizer, snapshot, mem, need_more_room).await? {
        return Ok(Some(tag));
    }
    if let StepOutcome::Performed(tag) = attempt_l1_to_l2(store, summarizer, snapshot, mem, need_more_room).await? {
        return Ok(Some(tag));
    }
    if let StepOutcome::Performed(tag) = attempt_l3_evict(snapshot, store, mem, need_more_room).await? {
        return Ok(Some(tag));
    }
    Ok(None)
}

/// Run the cascade to exhaustion (exit condition, iteration cap, or stall),
/// rebuilding the snapshot fresh after every step. Used standalone by C8; C6
/// runs an equivalent loop inline so it can reuse the final snapshot.
async fn run_cascade(
    store: &MemoryStore,
    provider: &dyn Provider,
    summarizer: &dyn Summarizer,
    ctx: &ContextConfig,
    mem: &MemoryConfig,
    input: AssembleInput<'_>,
) -> Result<CompactionReport> {
    let mut report = CompactionReport::default();
    for _ in 0..mem.compaction_iteration_cap {
        let snapshot = assembler::build_snapshot(store, provider, ctx, mem, &input).await?;
        if below_low_and_satisfied(&snapshot, mem, ctx) {
            return Ok(report);
        }
        match perform_one_step(store, summarizer, &snapshot, mem, ctx).await? {
            Some(tag) => report.steps.push(tag),
            None => {
                report.stalled = true;
                return Ok(report);
            }
        }
    }
    report
        .steps
        .push(format!("iteration_cap_reached:{}", mem.compaction_iteration_cap));
    Ok(report)
}

/// C7: runs as part of context assembly. Exposed for callers (the
/// orchestrator's diagnostics) that want to trigger it independently of a
/// full `assemble_context` call.
pub async fn run_preflight(
    store: &MemoryStore,
    provider: &dyn Provider,
    summarizer: &dyn Summarizer,
    ctx: &ContextConfig,
    mem: &MemoryConfig,
    input: AssembleInput<'_>,
) -> Result<CompactionReport> {
    run_cascade(store, provider, summarizer, ctx, mem, input).await
}

/// C8: runs after the assistant reply has been persisted, on a thread with
/// no in-flight "current user" message to exclude. `ctx.ctx_default_context_length`
/// must already carry the resolved model window (the caller is expected to
/// have gone through the model-info cache, same as `assemble_context` does).
pub async fn run_post_reply(
    store: &MemoryStore,
    provider: &dyn Provider,
    summarizer: &dyn Summarizer,
    ctx: &ContextConfig,
    mem: &MemoryConfig,
    thread_id: &str,
    model_id: &str,
) -> Result<CompactionReport> {
    let input = AssembleInput {
        thread_id,
        model_id,
        max_output_tokens: None,
        tool_results_text: None,
        tool_results_tokens: None,
        last_user_lang: None,
        current_user_text: "",
        current_user_id: i64::MAX,
    };
    run_cascade(store, provider, summarizer, ctx, mem, input).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::db::{Database, Role};
    use crate::memory::summarizer::DefaultSummarizer;
    use crate::model_info::ModelInfoCache;
    use crate::provider::mock::MockProvider;
    use std::sync::Arc;

    fn msg(id: i64, thread_id: &str, role: Role, content: &str) -> crate::db::Message {
        crate::db::Message {
            id,
            thread_id: thread_id.to_string(),
            role,
            content: content.to_string(),
            created_at: chrono::Utc::now(),
            input_tokens: None,
            output_tokens: None,
            total_tokens: None,
        }
    }

    fn budget_with_l1_cap(l1_cap: u32) -> crate::budget::BudgetVector {
        crate::budget::BudgetVector {
            c_eff: 4096,
            c_base: 4096,
            r_out: 256,
            r_sys: 256,
            safety: 410,
            b_total_in: 3174,
            core_reserved: 100,
            b_work: 3074,
            l1_cap,
            l2_cap: 900,
            l3_cap: 900,
            tools_cap: 0,
        }
    }

    #[tokio::test]
    async fn l1_to_l2_promotes_oldest_pairs_when_over_high_watermark() {
        let db = Database::connect_in_memory().await.unwrap();
        let store = MemoryStore::new(db);
        let provider = Arc::new(MockProvider::new(vec!["a tidy summary of the exchange"]));
        let cfg = Config::default();
        let summarizer = DefaultSummarizer::new(provider.clone(), "mock-model", cfg.memory.clone());

        let thread = store.create_thread(None).await.unwrap();
        let mut l1_pairs = Vec::new();
        for i in 0..6i64 {
            let u = msg(i * 2, &thread.id, Role::User, &format!("question {i}"));
            let a = msg(i * 2 + 1, &thread.id, Role::Assistant, &format!("answer {i}"));
            store.append_message(&thread.id, Role::User, &u.content, None).await.unwrap();
            store.append_message(&thread.id, Role::Assistant, &a.content, None).await.unwrap();
            l1_pairs.push((u, a));
        }

        // l1_cap deliberately tiny so l1_tokens/l1_cap trips well past l1_high.
        let snapshot = Snapshot {
            l1_pairs,
            l1_tokens: 500,
            l2: Vec::new(),
            l2_tokens: 0,
            l3: Vec::new(),
            l3_tokens: 0,
            core_tokens: 10,
            tools_used: 0,
            tools_text: None,
            current_user_tokens: 5,
            budget: budget_with_l1_cap(10),
            token_count_mode: crate::tokenizer::TokenCountMode::ProxyHttp,
        };

        let tag = perform_one_step(&store, &summarizer, &snapshot, &cfg.memory, &cfg.context)
            .await
            .unwrap()
            .expect("expected a compaction step to run");
        assert!(tag.starts_with("l1_to_l2_group:"), "unexpected step: {tag}");

        let l2 = store.get_l2_asc(&thread.id, 100).await.unwrap();
        assert_eq!(l2.len(), 1);
        assert_eq!(l2[0].start_message_id, 0);

        let state = store.memory_state_read(&thread.id).await.unwrap();
        assert_eq!(state.last_compacted_message_id, Some(l2[0].end_message_id));
    }

    #[tokio::test]
    async fn post_reply_cascade_is_idle_on_a_small_fresh_thread() {
        let db = Database::connect_in_memory().await.unwrap();
        let store = MemoryStore::new(db);
        let provider = Arc::new(MockProvider::new(vec!["a tidy summary of the exchange"]));
        let cfg = Config::default();
        let summarizer = DefaultSummarizer::new(provider.clone(), "mock-model", cfg.memory.clone());
        let _cache = ModelInfoCache::new(300, 4096);

        let thread = store.create_thread(None).await.unwrap();
        store.append_message(&thread.id, Role::User, "hello", None).await.unwrap();
        store.append_message(&thread.id, Role::Assistant, "hi there", None).await.unwrap();

        let report = run_post_reply(&store, provider.as_ref(), &summarizer, &cfg.context, &cfg.memory, &thread.id, "mock-model")
            .await
            .unwrap();

        assert!(report.steps.is_empty());
        assert!(!report.stalled);
    }
}
