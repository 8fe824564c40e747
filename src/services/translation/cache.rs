use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::Arc;
use tracing::debug;
use xxhash_rust::xxh3::Xxh3;

use crate::core::types::TranslationProviderKind;
use crate::utils::Metrics;

#[derive(Debug, Clone)]
struct CacheEntry {
    original_text: String,
    translated_text: String,
}

/// In-memory translation cache with LRU eviction.
///
/// Keys are xxHash3 digests of (provider, source, target, text). The original
/// text is stored alongside the translation and compared on lookup, so a
/// digest collision reads as a miss instead of a wrong translation.
#[derive(Clone)]
pub struct TranslationCache {
    inner: Arc<CacheInner>,
}

struct CacheInner {
    cache: Mutex<LruCache<u64, CacheEntry>>,
    metrics: Option<Metrics>,
}

impl TranslationCache {
    pub fn new(max_entries: usize, metrics: Option<Metrics>) -> Self {
        let max = NonZeroUsize::new(max_entries).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Arc::new(CacheInner {
                cache: Mutex::new(LruCache::new(max)),
                metrics,
            }),
        }
    }

    /// Hash a lookup key; fields are length-prefixed so boundaries can't shift
    pub fn generate_key(
        provider: TranslationProviderKind,
        source: &str,
        target: &str,
        text: &str,
    ) -> u64 {
        let mut hasher = Xxh3::new();
        for part in [provider.as_str(), source, target, text] {
            hasher.update(&(part.len() as u64).to_le_bytes());
            hasher.update(part.as_bytes());
        }
        hasher.digest()
    }

    pub fn get(
        &self,
        provider: TranslationProviderKind,
        source: &str,
        target: &str,
        text: &str,
    ) -> Option<String> {
        let key = Self::generate_key(provider, source, target, text);
        let hit = {
            let mut cache = self.inner.cache.lock();
            cache
                .get(&key)
                .filter(|entry| entry.original_text == text)
                .map(|entry| entry.translated_text.clone())
        };

        if let Some(ref m) = self.inner.metrics {
            if hit.is_some() {
                m.record_cache_hit();
            } else {
                m.record_cache_miss();
            }
        }
        hit
    }

    pub fn put(
        &self,
        provider: TranslationProviderKind,
        source: &str,
        target: &str,
        text: &str,
        translated: &str,
    ) {
        let key = Self::generate_key(provider, source, target, text);
        let mut cache = self.inner.cache.lock();
        if let Some((evicted, _)) = cache.push(
            key,
            CacheEntry {
                original_text: text.to_string(),
                translated_text: translated.to_string(),
            },
        ) {
            if evicted != key {
                debug!("Translation cache full, evicted {:016x}", evicted);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner.cache.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.inner.cache.lock().clear();
    }
}
