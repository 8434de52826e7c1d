//! Model-Info Cache (C2).
//!
//! Resolves a model id to its context window, TTL-cached, with a per-key
//! async mutex so concurrent callers for the same model don't thunder the
//! herd against the upstream (mirrors `budget.py`'s `_get_model_info_cached`
//! / `_get_lock`).

use crate::provider::{ModelInfo, ModelInfoSource, Provider};
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use tokio::sync::Mutex as AsyncMutex;

const PROVISIONAL_TTL: Duration = Duration::from_secs(2);

struct CacheEntry {
    info: ModelInfo,
    expires_at: Instant,
}

fn is_provisional(info: &ModelInfo) -> bool {
    info.source == ModelInfoSource::Default
        || info.loaded_context_length.is_none()
        || info.state.as_deref() != Some("loaded")
}

/// Process-wide model-info cache. Construct one per process and share it
/// via `Arc`.
pub struct ModelInfoCache {
    entries: StdMutex<HashMap<String, CacheEntry>>,
    locks: StdMutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    stable_ttl: Duration,
    default_context_length: u32,
}

impl ModelInfoCache {
    pub fn new(stable_ttl_sec: u64, default_context_length: u32) -> Self {
        Self {
            entries: StdMutex::new(HashMap::new()),
            locks: StdMutex::new(HashMap::new()),
            stable_ttl: Duration::from_secs(stable_ttl_sec),
            default_context_length,
        }
    }

    fn lock_for(&self, model_id: &str) -> Arc<AsyncMutex<()>> {
        self.locks
            .lock()
            .unwrap()
            .entry(model_id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    fn cached(&self, model_id: &str) -> Option<ModelInfo> {
        let entries = self.entries.lock().unwrap();
        entries.get(model_id).and_then(|e| {
            if e.expires_at > Instant::now() {
                Some(e.info.clone())
            } else {
                None
            }
        })
    }

    /// Fetch model info for `model_id`, using the cache when fresh. On
    /// upstream failure, returns a provisional `source: default` record
    /// rather than propagating an error (spec §7).
    pub async fn fetch(&self, provider: &dyn Provider, model_id: &str) -> ModelInfo {
        if let Some(info) = self.cached(model_id) {
            return info;
        }

        let key_lock = self.lock_for(model_id);
        let _guard = key_lock.lock().await;

        // Re-check after acquiring the lock: another caller may have just refreshed.
        if let Some(info) = self.cached(model_id) {
            return info;
        }

        let info = match provider.model_info(model_id).await {
            Ok(info) => info,
            Err(e) => {
                tracing::warn!(model_id, error = %e, "model-info probe failed, using default window");
                ModelInfo {
                    model_id: model_id.to_string(),
                    loaded_context_length: None,
                    max_context_length: Some(self.default_context_length),
                    state: None,
                    source: ModelInfoSource::Default,
                }
            }
        };

        let ttl = if is_provisional(&info) {
            PROVISIONAL_TTL
        } else {
            self.stable_ttl
        };

        self.entries.lock().unwrap().insert(
            model_id.to_string(),
            CacheEntry {
                info: info.clone(),
                expires_at: Instant::now() + ttl,
            },
        );

        info
    }

    /// Busy-poll for up to ~6s (10 * 600ms) while the backend reports the
    /// model as still loading (spec §4.3 step 1). A backend that only ever
    /// exposes `max_context_length` (never `loaded`) has nothing to wait
    /// for, so the gate is the `state` field, not `loaded_context_length`'s
    /// mere absence.
    pub async fn fetch_with_busy_poll(&self, provider: &dyn Provider, model_id: &str) -> ModelInfo {
        let mut info = self.fetch(provider, model_id).await;
        let mut attempts = 0;
        while info.state.as_deref() == Some("loading") && attempts < 10 {
            tokio::time::sleep(Duration::from_millis(600)).await;
            self.entries.lock().unwrap().remove(model_id);
            info = self.fetch(provider, model_id).await;
            attempts += 1;
        }
        info
    }

    /// The effective context window per spec §4.3 step 1's resolution order.
    pub fn window(&self, info: &ModelInfo) -> u32 {
        info.loaded_context_length
            .or(info.max_context_length)
            .unwrap_or(self.default_context_length)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::mock::MockProvider;

    #[tokio::test]
    async fn caches_stable_result() {
        let cache = ModelInfoCache::new(300, 4096);
        let provider = MockProvider::new(vec!["ok"]);
        let first = cache.fetch(&provider, "mock-model").await;
        assert_eq!(first.source, ModelInfoSource::LoadedContextLength);
        let second = cache.fetch(&provider, "mock-model").await;
        assert_eq!(second.loaded_context_length, first.loaded_context_length);
    }

    #[tokio::test]
    async fn busy_poll_does_not_stall_on_a_max_context_length_only_backend() {
        let cache = ModelInfoCache::new(300, 4096);
        let provider = MockProvider::new(vec!["ok"]).with_model_info(ModelInfo {
            model_id: "mock-model".to_string(),
            loaded_context_length: None,
            max_context_length: Some(32768),
            state: Some("not-loaded".to_string()),
            source: ModelInfoSource::MaxContextLength,
        });
        let info = cache.fetch_with_busy_poll(&provider, "mock-model").await;
        assert_eq!(info.max_context_length, Some(32768));
        assert_eq!(cache.window(&info), 32768);
    }

    #[test]
    fn window_prefers_loaded_then_max_then_default() {
        let cache = ModelInfoCache::new(300, 4096);
        let loaded = ModelInfo {
            model_id: "m".into(),
            loaded_context_length: Some(8192),
            max_context_length: Some(32768),
            state: Some("loaded".into()),
            source: ModelInfoSource::LoadedContextLength,
        };
        assert_eq!(cache.window(&loaded), 8192);

        let max_only = ModelInfo {
            loaded_context_length: None,
            ..loaded.clone()
        };
        assert_eq!(cache.window(&max_only), 32768);

        let none = ModelInfo {
            loaded_context_length: None,
            max_context_length: None,
            ..loaded
        };
        assert_eq!(cache.window(&none), 4096);
    }
}
