// Translation stage
//
// Skip rules, then cache, circuit breaker and the translation limiter in
// front of the selected provider. Each attempt takes its own limiter slot;
// retry backoff sleeps outside it. Every failure path hands back the input
// text unchanged.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, trace, warn};

use super::cache::TranslationCache;
use super::deepl::DeepLTranslator;
use super::google::GoogleTranslator;
use super::provider::{
    retry_delay, TranslationCall, TranslationProvider, INITIAL_RETRY_DELAY_MS, MAX_RETRIES,
};
use crate::core::config::TranslationConfig;
use crate::core::errors::TranslationResult;
use crate::core::types::{Credentials, TranslationProviderKind, AUTO_LANGUAGE};
use crate::middleware::{CircuitBreaker, CircuitBreakerStats, ConcurrencyLimiter};
use crate::utils::Metrics;

/// Why a translation was not attempted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    BlankText,
    MissingCredentials,
    SameLanguage,
    UnknownProvider,
}

/// Decide whether `text` needs a provider call at all
pub fn skip_reason(
    text: &str,
    source: &str,
    target: &str,
    provider: TranslationProviderKind,
    credentials: &Credentials,
) -> Option<SkipReason> {
    if text.trim().is_empty() {
        return Some(SkipReason::BlankText);
    }
    if credentials.translation_key(provider).is_none() {
        return Some(SkipReason::MissingCredentials);
    }
    if source != AUTO_LANGUAGE && source.eq_ignore_ascii_case(target) {
        return Some(SkipReason::SameLanguage);
    }
    None
}

pub struct TranslationStage {
    providers: HashMap<TranslationProviderKind, Arc<dyn TranslationProvider>>,
    breakers: HashMap<TranslationProviderKind, CircuitBreaker>,
    cache: TranslationCache,
    limiter: ConcurrencyLimiter,
    metrics: Metrics,
    retry_delay: Duration,
}

impl TranslationStage {
    pub fn new(
        providers: Vec<Arc<dyn TranslationProvider>>,
        cache: TranslationCache,
        limiter: ConcurrencyLimiter,
        metrics: Metrics,
    ) -> Self {
        let mut by_kind = HashMap::new();
        let mut breakers = HashMap::new();
        for provider in providers {
            let kind = provider.kind();
            breakers.insert(kind, CircuitBreaker::new(kind.as_str()));
            by_kind.insert(kind, provider);
        }

        Self {
            providers: by_kind,
            breakers,
            cache,
            limiter,
            metrics,
            retry_delay: Duration::from_millis(INITIAL_RETRY_DELAY_MS),
        }
    }

    /// Override the initial retry backoff
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Google and DeepL clients, an LRU cache and the translation limiter
    pub fn from_config(config: &TranslationConfig, metrics: Metrics) -> TranslationResult<Self> {
        let timeout = Duration::from_secs(config.timeout_seconds);
        let providers: Vec<Arc<dyn TranslationProvider>> = vec![
            Arc::new(GoogleTranslator::new(&config.google_endpoint, timeout)?),
            Arc::new(DeepLTranslator::new(&config.deepl_endpoint, timeout)?),
        ];

        info!(
            "Translation stage: {} providers, {} cache entries, {} concurrent",
            providers.len(),
            config.cache_entries,
            config.max_concurrent
        );

        Ok(Self::new(
            providers,
            TranslationCache::new(config.cache_entries, Some(metrics.clone())),
            ConcurrencyLimiter::new("translation", config.max_concurrent),
            metrics,
        ))
    }

    pub fn limiter(&self) -> &ConcurrencyLimiter {
        &self.limiter
    }

    pub fn cache(&self) -> &TranslationCache {
        &self.cache
    }

    pub fn breaker_stats(&self) -> Vec<CircuitBreakerStats> {
        let mut stats: Vec<_> = self.breakers.values().map(|b| b.stats()).collect();
        stats.sort_by_key(|s| s.name);
        stats
    }

    /// Translate `text`, or return it unchanged when translation is skipped or fails
    #[instrument(skip_all, fields(provider = provider.as_str(), source = source, target = target))]
    pub async fn translate(
        &self,
        text: &str,
        source: &str,
        target: &str,
        provider: TranslationProviderKind,
        credentials: &Credentials,
    ) -> String {
        let reason = skip_reason(text, source, target, provider, credentials).or_else(|| {
            (!self.providers.contains_key(&provider)).then_some(SkipReason::UnknownProvider)
        });
        if let Some(reason) = reason {
            trace!("Translation skipped: {:?}", reason);
            self.metrics.record_translation_skipped();
            return text.to_string();
        }

        if let Some(hit) = self.cache.get(provider, source, target, text) {
            trace!("Translation cache hit");
            return hit;
        }

        let (Some(backend), Some(breaker), Some(api_key)) = (
            self.providers.get(&provider),
            self.breakers.get(&provider),
            credentials.translation_key(provider),
        ) else {
            return text.to_string();
        };

        if !breaker.allow_request() {
            debug!("Circuit open for {}, returning original text", provider.as_str());
            self.metrics.record_circuit_breaker_rejection();
            return text.to_string();
        }

        let call = TranslationCall {
            text,
            source,
            target,
            api_key,
        };

        let start = Instant::now();
        let result = self.call_with_retry(backend.as_ref(), call).await;
        let elapsed = start.elapsed();

        match result {
            Ok(translated) => {
                breaker.record_success();
                self.metrics.record_translation(true, elapsed);
                self.cache.put(provider, source, target, text, &translated);
                translated
            }
            Err(e) => {
                if e.is_provider_fault() {
                    breaker.record_failure();
                } else {
                    // The provider answered; the rejection is about this caller's request
                    breaker.record_success();
                }
                self.metrics.record_translation(false, elapsed);
                warn!(
                    "Translation via {} failed, keeping original text: {}",
                    provider.as_str(),
                    e
                );
                text.to_string()
            }
        }
    }

    async fn call_with_retry(
        &self,
        backend: &dyn TranslationProvider,
        call: TranslationCall<'_>,
    ) -> TranslationResult<String> {
        let mut attempt = 0;
        loop {
            match self.limiter.run(|| backend.translate(call)).await {
                Err(e) if e.is_retryable() && attempt < MAX_RETRIES => {
                    attempt += 1;
                    let delay = retry_delay(self.retry_delay, attempt);
                    warn!(
                        "{}: Retry attempt {} after {}ms delay ({})",
                        backend.kind().as_str(),
                        attempt,
                        delay.as_millis(),
                        e
                    );
                    tokio::time::sleep(delay).await;
                }
                result => return result,
            }
        }
    }
}
