//! Token Counter (C1).
//!
//! `count_chat`/`count_text` fingerprint a (model, message-list) pair, check
//! a short-TTL cache, and on miss post a `max_tokens=1` probe to the
//! upstream to read back `usage.prompt_tokens`. Any transport or decode
//! failure falls back to a 4-chars/token heuristic. Never returns an error
//! to the caller; the returned `mode` tells the caller which path was used
//! (mirrors `lmstudio_tokens.py`'s cache-then-probe-then-approximate shape).

use crate::config::ContextConfig;
use crate::provider::{ChatMessage, ChatRequest, Provider};
use once_cell::sync::Lazy;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TokenCountMode {
    ProxyHttp,
    Approx,
}

impl TokenCountMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenCountMode::ProxyHttp => "proxy-http",
            TokenCountMode::Approx => "approx",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TokenCount {
    pub tokens: u32,
    pub mode: TokenCountMode,
}

struct CacheEntry {
    tokens: u32,
    mode: TokenCountMode,
    expires_at: Instant,
}

static CACHE: Lazy<Mutex<HashMap<String, CacheEntry>>> = Lazy::new(|| Mutex::new(HashMap::new()));

fn fingerprint(model_id: &str, messages: &[ChatMessage]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(model_id.as_bytes());
    for m in messages {
        hasher.update([0u8]);
        hasher.update(format!("{:?}", m.role).as_bytes());
        hasher.update([0u8]);
        hasher.update(m.content.as_bytes());
    }
    format!("{:x}", hasher.finalize())
}

/// 4 characters ≈ 1 token, ceil, minimum 1 per non-empty message.
fn approx_tokens_messages(messages: &[ChatMessage]) -> u32 {
    messages
        .iter()
        .map(|m| approx_tokens_text(&m.content))
        .sum()
}

pub fn approx_tokens_text(text: &str) -> u32 {
    if text.is_empty() {
        return 0;
    }
    (text.chars().count() as u32).div_ceil(4).max(1)
}

/// Count tokens for `messages` against `model_id`. Caches by fingerprint
/// with `ctx.token_cache_ttl_sec` TTL. When `ctx.token_count_mode` is
/// `"approx"` the upstream probe is skipped entirely (spec §6); otherwise
/// posts a `max_tokens=1` probe and falls back to `approx` on failure.
pub async fn count_chat(
    provider: &dyn Provider,
    model_id: &str,
    messages: &[ChatMessage],
    ctx: &ContextConfig,
) -> TokenCount {
    let key = fingerprint(model_id, messages);
    let ttl = Duration::from_secs(ctx.token_cache_ttl_sec);

    if let Some(entry) = CACHE.lock().unwrap().get(&key)
        && entry.expires_at > Instant::now()
    {
        return TokenCount {
            tokens: entry.tokens,
            mode: entry.mode,
        };
    }

    let result = if ctx.token_count_mode == "approx" {
        TokenCount {
            tokens: approx_tokens_messages(messages),
            mode: TokenCountMode::Approx,
        }
    } else {
        let probe = ChatRequest::probe(model_id, messages.to_vec());
        match provider.chat(probe).await {
            Ok(response) => match response.usage {
                Some(usage) if usage.prompt_tokens > 0 => TokenCount {
                    tokens: usage.prompt_tokens,
                    mode: TokenCountMode::ProxyHttp,
                },
                _ => {
                    tracing::warn!(model_id, "upstream returned no usage.prompt_tokens, falling back to approx");
                    TokenCount {
                        tokens: approx_tokens_messages(messages),
                        mode: TokenCountMode::Approx,
                    }
                }
            },
            Err(e) => {
                tracing::warn!(model_id, error = %e, "token probe failed, falling back to approx");
                TokenCount {
                    tokens: approx_tokens_messages(messages),
                    mode: TokenCountMode::Approx,
                }
            }
        }
    };

    CACHE.lock().unwrap().insert(
        key,
        CacheEntry {
            tokens: result.tokens,
            mode: result.mode,
            expires_at: Instant::now() + ttl,
        },
    );

    result
}

pub async fn count_text(provider: &dyn Provider, model_id: &str, text: &str, ctx: &ContextConfig) -> TokenCount {
    count_chat(provider, model_id, &[ChatMessage::user(text)], ctx).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::mock::MockProvider;

    #[tokio::test]
    async fn proxy_mode_on_success() {
        let provider = MockProvider::new(vec!["ok"]);
        let ctx = ContextConfig::default();
        let result = count_text(&provider, "mock-model", "hello world", &ctx).await;
        assert_eq!(result.mode, TokenCountMode::ProxyHttp);
        assert_eq!(result.tokens, 10);
    }

    #[tokio::test]
    async fn approx_mode_skips_the_probe() {
        let provider = MockProvider::new(vec!["ok"]);
        let mut ctx = ContextConfig::default();
        ctx.token_count_mode = "approx".to_string();
        let text = "approx mode must never hit the upstream probe";
        let result = count_text(&provider, "approx-mode-test-model", text, &ctx).await;
        assert_eq!(result.mode, TokenCountMode::Approx);
        assert_eq!(result.tokens, approx_tokens_text(text));
    }

    #[test]
    fn approx_heuristic_ceils_and_has_floor() {
        assert_eq!(approx_tokens_text(""), 0);
        assert_eq!(approx_tokens_text("a"), 1);
        assert_eq!(approx_tokens_text("abcd"), 1);
        assert_eq!(approx_tokens_text("abcde"), 2);
    }
}
