// Text recognition engines
//
// `engine` defines the seam, `pool` caches one engine per language, and the
// provider modules implement it for tesseract and the cloud Vision API.

pub mod cloud_vision;
pub mod engine;
pub mod pool;
pub mod tesseract;

use async_trait::async_trait;
use std::sync::Arc;

use crate::core::config::RecognitionConfig;
use crate::core::errors::RecognitionResult;
use crate::core::types::OcrProvider;

pub use cloud_vision::CloudVisionEngine;
pub use engine::{
    EngineFactory, RecognitionEngine, RecognizedBlock, RecognizedLine, RecognizedPage,
    RecognizedWord,
};
pub use pool::RecognitionEnginePool;
pub use tesseract::{TesseractEngine, TesseractFactory};

/// Builds the engine matching the requested provider
pub struct DefaultEngineFactory {
    tesseract: TesseractFactory,
    vision_endpoint: String,
}

impl DefaultEngineFactory {
    pub fn new(config: &RecognitionConfig) -> Self {
        Self {
            tesseract: TesseractFactory::new(config.tesseract_path.clone(), config.auto_language.clone()),
            vision_endpoint: config.vision_endpoint.clone(),
        }
    }
}

#[async_trait]
impl EngineFactory for DefaultEngineFactory {
    async fn create(
        &self,
        provider: OcrProvider,
        language: &str,
    ) -> RecognitionResult<Arc<dyn RecognitionEngine>> {
        match provider {
            OcrProvider::LocalEngine => {
                let engine: Arc<dyn RecognitionEngine> = self.tesseract.create(language).await?;
                Ok(engine)
            }
            OcrProvider::CloudVision => Ok(Arc::new(CloudVisionEngine::new(
                &self.vision_endpoint,
                language,
            )?)),
        }
    }
}
