pub mod config;
pub mod errors;
pub mod types;

// Re-export commonly used items for convenience
pub use config::Config;
pub use errors::{
    ConfigError, DetectionError, MaskError, PipelineError, RecognitionError, RouterError,
    TranslationError,
};
pub use types::{
    BoundingBox, Detection, DetectionRequest, DetectionResults, DetectionWire, RawImage,
    RequestId, Settings, WorkerMessage,
};
