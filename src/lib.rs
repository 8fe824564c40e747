// Library exports for the bubble detection, recognition and translation pipeline

pub mod core;
pub mod middleware;
pub mod orchestration;
pub mod services;
pub mod utils;

// Re-export commonly used types and functions
pub use core::{
    config::Config,
    errors::{
        ConfigError, DetectionError, MaskError, PipelineError, RecognitionError, RouterError,
        TranslationError,
    },
    types::{
        BoundingBox, Detection, DetectionRequest, DetectionResults, DetectionWire, RawImage,
        RequestId, Settings, WorkerMessage,
    },
};

pub use middleware::{CircuitBreaker, CircuitBreakerConfig, CircuitState, ConcurrencyLimiter};

pub use orchestration::{PipelineOrchestrator, PipelineOutcome, PipelineState, RequestRouter};

pub use services::{RecognitionEnginePool, RegionRecognitionStage, TranslationStage};

pub use utils::{Metrics, MetricsSnapshot};
