// Lazily-built recognition engines, one per (provider, language)
//
// Each key owns a `OnceCell` slot. The first acquire for a key builds the
// engine while concurrent acquires for the same key wait on the same slot,
// so an engine is constructed at most once. A failed build leaves the slot
// empty and the next acquire retries.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use super::engine::{EngineFactory, RecognitionEngine};
use crate::core::errors::RecognitionResult;
use crate::core::types::OcrProvider;

type EngineSlot = Arc<OnceCell<Arc<dyn RecognitionEngine>>>;
type EngineKey = (OcrProvider, String);

pub struct RecognitionEnginePool {
    factory: Arc<dyn EngineFactory>,
    slots: Mutex<HashMap<EngineKey, EngineSlot>>,
}

impl RecognitionEnginePool {
    pub fn new(factory: Arc<dyn EngineFactory>) -> Self {
        Self {
            factory,
            slots: Mutex::new(HashMap::new()),
        }
    }

    fn slot(&self, provider: OcrProvider, language: &str) -> EngineSlot {
        let mut slots = self.slots.lock();
        Arc::clone(
            slots
                .entry((provider, language.to_string()))
                .or_insert_with(|| Arc::new(OnceCell::new())),
        )
    }

    /// Return the engine for `language`, building it on first use
    pub async fn acquire(
        &self,
        provider: OcrProvider,
        language: &str,
    ) -> RecognitionResult<Arc<dyn RecognitionEngine>> {
        let slot = self.slot(provider, language);

        if let Some(engine) = slot.get() {
            return Ok(Arc::clone(engine));
        }

        let engine = slot
            .get_or_try_init(|| async {
                let start = Instant::now();
                debug!("Creating {} engine for '{}'", provider.as_str(), language);
                let result = self.factory.create(provider, language).await;
                match &result {
                    Ok(_) => info!(
                        "✓ {} engine for '{}' ready in {:.2}ms",
                        provider.as_str(),
                        language,
                        start.elapsed().as_secs_f64() * 1000.0
                    ),
                    Err(e) => warn!(
                        "Failed to create {} engine for '{}': {}",
                        provider.as_str(),
                        language,
                        e
                    ),
                }
                result
            })
            .await?;

        Ok(Arc::clone(engine))
    }

    /// Drop the engine for `language`; the next acquire builds a fresh one
    pub fn evict(&self, provider: OcrProvider, language: &str) -> bool {
        let removed = self
            .slots
            .lock()
            .remove(&(provider, language.to_string()))
            .is_some();
        if removed {
            info!("Evicted {} engine for '{}'", provider.as_str(), language);
        }
        removed
    }

    /// Keys with a live engine
    pub fn languages(&self) -> Vec<(OcrProvider, String)> {
        let mut live: Vec<_> = self
            .slots
            .lock()
            .iter()
            .filter(|(_, slot)| slot.initialized())
            .map(|(key, _)| key.clone())
            .collect();
        live.sort_by(|a, b| a.1.cmp(&b.1).then(a.0.as_str().cmp(b.0.as_str())));
        live
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::errors::RecognitionError;
    use crate::core::types::Credentials;
    use crate::services::ocr::engine::RecognizedPage;
    use async_trait::async_trait;
    use image::GrayImage;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct StubEngine {
        language: String,
    }

    #[async_trait]
    impl RecognitionEngine for StubEngine {
        fn provider(&self) -> OcrProvider {
            OcrProvider::LocalEngine
        }

        fn language(&self) -> &str {
            &self.language
        }

        async fn recognize(
            &self,
            _image: &GrayImage,
            _credentials: &Credentials,
        ) -> RecognitionResult<RecognizedPage> {
            Ok(RecognizedPage::default())
        }
    }

    #[derive(Default)]
    struct CountingFactory {
        created: AtomicUsize,
        failures_left: AtomicUsize,
    }

    #[async_trait]
    impl EngineFactory for CountingFactory {
        async fn create(
            &self,
            _provider: OcrProvider,
            language: &str,
        ) -> RecognitionResult<Arc<dyn RecognitionEngine>> {
            tokio::time::sleep(Duration::from_millis(5)).await;
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(RecognitionError::EngineUnavailable {
                    language: language.to_string(),
                    reason: "not installed".to_string(),
                });
            }
            self.created.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(StubEngine {
                language: language.to_string(),
            }))
        }
    }

    #[tokio::test]
    async fn test_concurrent_first_acquires_build_once() {
        let factory = Arc::new(CountingFactory::default());
        let pool = RecognitionEnginePool::new(factory.clone());

        let (a, b, c) = tokio::join!(
            pool.acquire(OcrProvider::LocalEngine, "jpn"),
            pool.acquire(OcrProvider::LocalEngine, "jpn"),
            pool.acquire(OcrProvider::LocalEngine, "jpn"),
        );

        let a = a.unwrap();
        assert!(Arc::ptr_eq(&a, &b.unwrap()));
        assert!(Arc::ptr_eq(&a, &c.unwrap()));
        assert_eq!(factory.created.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_languages_coexist() {
        let factory = Arc::new(CountingFactory::default());
        let pool = RecognitionEnginePool::new(factory.clone());

        let jpn = pool.acquire(OcrProvider::LocalEngine, "jpn").await.unwrap();
        let eng = pool.acquire(OcrProvider::LocalEngine, "eng").await.unwrap();

        assert_eq!(jpn.language(), "jpn");
        assert_eq!(eng.language(), "eng");
        assert_eq!(factory.created.load(Ordering::SeqCst), 2);
        assert_eq!(pool.languages().len(), 2);
    }

    #[tokio::test]
    async fn test_failed_build_is_retried() {
        let factory = Arc::new(CountingFactory {
            created: AtomicUsize::new(0),
            failures_left: AtomicUsize::new(1),
        });
        let pool = RecognitionEnginePool::new(factory.clone());

        assert!(pool.acquire(OcrProvider::LocalEngine, "kor").await.is_err());
        assert!(pool.languages().is_empty());

        assert!(pool.acquire(OcrProvider::LocalEngine, "kor").await.is_ok());
        assert_eq!(factory.created.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_evict_forces_rebuild() {
        let factory = Arc::new(CountingFactory::default());
        let pool = RecognitionEnginePool::new(factory.clone());

        let first = pool.acquire(OcrProvider::LocalEngine, "jpn").await.unwrap();
        assert!(pool.evict(OcrProvider::LocalEngine, "jpn"));
        assert!(!pool.evict(OcrProvider::LocalEngine, "jpn"));

        let second = pool.acquire(OcrProvider::LocalEngine, "jpn").await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(factory.created.load(Ordering::SeqCst), 2);
    }
}
