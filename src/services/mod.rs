pub mod detection;
pub mod ocr;
pub mod recognition;
pub mod segmentation;
pub mod translation;

// Re-export commonly used services
pub use detection::{DetectionModel, ModelLoader, OnnxDetectionModel, OnnxModelLoader};
pub use ocr::{DefaultEngineFactory, RecognitionEngine, RecognitionEnginePool};
pub use recognition::{RecognitionParams, RegionRecognitionStage, RegionText};
pub use translation::{TranslationCache, TranslationProvider, TranslationStage};
