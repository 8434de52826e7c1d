//! Summarizer (C5).
//!
//! Three entry points - pair to L2, pair-group to L2, L2-block to L3 - all
//! built on the same generate/check/retry/fallback shape. The summarizer
//! never returns an error to its caller: a failed or low-quality generation
//! falls back to a heuristic extract, and `summarize_l2_block_to_l3` signals
//! "nothing worth keeping" with `None` rather than propagating a failure
//! (spec §4.5).

use crate::config::MemoryConfig;
use crate::db::{L2Summary, Message};
use crate::provider::{ChatMessage, ChatRequest, Provider};
use crate::tokenizer;
use async_trait::async_trait;
use std::sync::Arc;

#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize_pair_to_l2(&self, user: &Message, assistant: &Message) -> (String, u32);

    async fn summarize_pairs_group_to_l2(&self, pairs: &[(Message, Message)]) -> (String, u32);

    /// `None` means the block produced nothing meaningful and should not be
    /// promoted to L3 at all (spec §4.5 step 5).
    async fn summarize_l2_block_to_l3(&self, block: &[L2Summary]) -> Option<(String, u32)>;
}

pub struct DefaultSummarizer {
    provider: Arc<dyn Provider>,
    model_id: String,
    mem: MemoryConfig,
}

impl DefaultSummarizer {
    pub fn new(provider: Arc<dyn Provider>, model_id: impl Into<String>, mem: MemoryConfig) -> Self {
        Self {
            provider,
            model_id: model_id.into(),
            mem,
        }
    }

    async fn generate(&self, prompt: &str, cap_tokens: u32) -> Option<String> {
        let request = ChatRequest::new(
            self.model_id.clone(),
            vec![
                ChatMessage::system(
                    "You condense conversation turns into a single short factual line. \
                     No preamble, no meta-commentary, just the content.",
                ),
                ChatMessage::user(prompt),
            ],
        )
        .with_max_tokens(cap_tokens)
        .with_temperature(0.2);

        match self.provider.chat(request).await {
            Ok(response) => {
                let content = response.first_content().trim();
                (!content.is_empty()).then(|| content.to_string())
            }
            Err(e) => {
                tracing::warn!(error = %e, "summarizer call failed");
                None
            }
        }
    }

    async fn generate_with_retry(&self, prompt: &str, stricter_prompt: &str, cap_tokens: u32) -> Option<String> {
        if let Some(text) = self.generate(prompt, cap_tokens).await
            && is_meaningful(&text, self.mem.l3_min_nonempty_chars)
        {
            return Some(text);
        }

        for _ in 1..self.mem.l3_retry_attempts {
            if let Some(text) = self.generate(stricter_prompt, cap_tokens).await
                && is_meaningful(&text, self.mem.l3_min_nonempty_chars)
            {
                return Some(text);
            }
        }
        None
    }

    async fn tokens_of(&self, text: &str) -> u32 {
        tokenizer::count_text(self.provider.as_ref(), &self.model_id, text)
            .await
            .tokens
    }
}

/// A block is "meaningful" if, after trimming bullet punctuation and
/// whitespace, it has at least one alphanumeric character and meets the
/// minimum length (spec §4.5 step 4).
fn is_meaningful(text: &str, min_chars: usize) -> bool {
    let stripped = text.trim().trim_start_matches(['-', '*', '\u{2022}', ' ']).trim();
    if stripped.is_empty() {
        return false;
    }
    if !stripped.chars().any(|c| c.is_alphanumeric()) {
        return false;
    }
    stripped.chars().count() >= min_chars
}

/// First two sentences (split on `. `/`!`/`?`), or the whole text if shorter.
fn heuristic_extract(text: &str) -> String {
    let mut sentences = Vec::new();
    let mut current = String::new();
    for ch in text.chars() {
        current.push(ch);
        if matches!(ch, '.' | '!' | '?') {
            sentences.push(current.trim().to_string());
            current.clear();
            if sentences.len() == 2 {
                break;
            }
        }
    }
    if sentences.is_empty() {
        return text.trim().to_string();
    }
    sentences.join(" ")
}

#[async_trait]
impl Summarizer for DefaultSummarizer {
    async fn summarize_pair_to_l2(&self, user: &Message, assistant: &Message) -> (String, u32) {
        let prompt = format!(
            "User said: {}\nAssistant replied: {}\n\nSummarize this exchange in one short line.",
            user.content, assistant.content
        );
        let stricter = format!(
            "User said: {}\nAssistant replied: {}\n\nWrite exactly one factual sentence capturing what was \
             decided or learned. Do not say you cannot summarize.",
            user.content, assistant.content
        );
        let cap = self.mem.cap_tok_user + self.mem.cap_tok_assistant;

        let text = match self.generate_with_retry(&prompt, &stricter, cap).await {
            Some(text) => text,
            None => heuristic_extract(&assistant.content),
        };
        let tokens = self.tokens_of(&text).await;
        (text, tokens)
    }

    async fn summarize_pairs_group_to_l2(&self, pairs: &[(Message, Message)]) -> (String, u32) {
        let joined = pairs
            .iter()
            .map(|(u, a)| format!("User: {}\nAssistant: {}", u.content, a.content))
            .collect::<Vec<_>>()
            .join("\n\n");
        let prompt = format!("Summarize this exchange in one short line:\n\n{joined}");
        let stricter = format!(
            "Write exactly one factual sentence capturing the net outcome of this exchange:\n\n{joined}"
        );

        let text = match self
            .generate_with_retry(&prompt, &stricter, self.mem.l2_group_max_tokens)
            .await
        {
            Some(text) => text,
            None => heuristic_extract(&joined),
        };
        let tokens = self.tokens_of(&text).await;
        (text, tokens)
    }

    async fn summarize_l2_block_to_l3(&self, block: &[L2Summary]) -> Option<(String, u32)> {
        let joined = block
            .iter()
            .map(|s| s.text.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        let style = &self.mem.l3_style;
        let prompt = format!("Condense these {} summaries into one {style} line:\n\n{joined}", block.len());
        let stricter = format!(
            "Write exactly one {style} line of factual content from these summaries. \
             Do not explain, do not apologize, do not say there is nothing to summarize:\n\n{joined}"
        );

        let text = self
            .generate_with_retry(&prompt, &stricter, self.mem.l3_group_max_tokens)
            .await
            .or_else(|| {
                let fallback = heuristic_extract(&joined);
                is_meaningful(&fallback, self.mem.l3_min_nonempty_chars).then_some(fallback)
            })?;

        let tokens = self.tokens_of(&text).await;
        Some((text, tokens))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::provider::mock::MockProvider;
    use chrono::Utc;

    fn msg(id: i64, role: crate::db::Role, content: &str) -> Message {
        Message {
            id,
            thread_id: "t".into(),
            role,
            content: content.to_string(),
            created_at: Utc::now(),
            input_tokens: None,
            output_tokens: None,
            total_tokens: None,
        }
    }

    fn l2(id: i64, text: &str) -> L2Summary {
        L2Summary {
            id,
            thread_id: "t".into(),
            start_message_id: id,
            end_message_id: id,
            text: text.to_string(),
            tokens: 5,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn pair_summary_falls_back_to_heuristic_on_empty_response() {
        let provider = Arc::new(MockProvider::new(vec![""]));
        let summarizer = DefaultSummarizer::new(provider, "mock-model", Config::default().memory);

        let user = msg(1, crate::db::Role::User, "What's the weather?");
        let assistant = msg(2, crate::db::Role::Assistant, "It is sunny today. Expect highs near 75.");
        let (text, _tokens) = summarizer.summarize_pair_to_l2(&user, &assistant).await;
        assert!(text.contains("sunny"));
    }

    #[tokio::test]
    async fn l3_block_skipped_when_summary_never_becomes_meaningful() {
        let provider = Arc::new(MockProvider::new(vec!["   "]));
        let summarizer = DefaultSummarizer::new(provider, "mock-model", Config::default().memory);
        let block = vec![l2(1, "-"), l2(2, "*")];
        let result = summarizer.summarize_l2_block_to_l3(&block).await;
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn l3_block_uses_generated_summary_when_meaningful() {
        let provider = Arc::new(MockProvider::new(vec!["User asked about deployment steps and got them."]));
        let summarizer = DefaultSummarizer::new(provider, "mock-model", Config::default().memory);
        let block = vec![l2(1, "discussed deploy"), l2(2, "confirmed steps")];
        let result = summarizer.summarize_l2_block_to_l3(&block).await;
        assert!(result.is_some());
        assert!(result.unwrap().0.contains("deployment"));
    }

    #[test]
    fn meaningfulness_rejects_bare_punctuation() {
        assert!(!is_meaningful("- ", 5));
        assert!(!is_meaningful("", 5));
        assert!(is_meaningful("Discussed the rollout plan.", 5));
    }
}
