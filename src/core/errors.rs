// Error types for the detection / recognition / translation pipeline
//
// Using thiserror for ergonomic error definitions with:
// - Type-safe error matching
// - Source error chaining
// - A clear split between fatal (whole request) and per-detection errors

use thiserror::Error;

/// Detection model errors (fatal for a request)
#[derive(Debug, Error)]
pub enum DetectionError {
    #[error("ONNX inference failed: {0}")]
    InferenceFailed(#[from] ort::Error),

    #[error("Model loading failed: {0}")]
    ModelLoadFailed(String),

    #[error("Model output '{name}' is missing or malformed: {reason}")]
    MalformedOutput { name: String, reason: String },

    #[error("Image preprocessing failed: {0}")]
    PreprocessingFailed(String),

    #[error("Invalid image dimensions: {width}x{height}")]
    InvalidImageSize { width: u32, height: u32 },

    #[error("Tensor shape mismatch: {0}")]
    Shape(#[from] ndarray::ShapeError),

    #[error("Inference task join failed: {0}")]
    TaskJoinFailed(String),
}

/// Mask reconstruction errors
#[derive(Debug, Error)]
pub enum MaskError {
    #[error("Coefficient length {coeffs} does not match prototype channels {channels}")]
    ChannelMismatch { coeffs: usize, channels: usize },

    #[error("Empty prototype grid ({height}x{width})")]
    EmptyPrototypes { height: usize, width: usize },

    #[error("Mask threshold must be in (0.0, 1.0), got {0}")]
    InvalidThreshold(f32),

    #[error("Tensor shape mismatch: {0}")]
    Shape(#[from] ndarray::ShapeError),
}

/// Text recognition errors (recoverable per detection)
#[derive(Debug, Error)]
pub enum RecognitionError {
    #[error("Recognition engine for '{language}' could not be created: {reason}")]
    EngineUnavailable { language: String, reason: String },

    #[error("Recognition failed: {0}")]
    EngineFailed(String),

    #[error("Region {x}x{y}+{width}x{height} is empty after clamping")]
    EmptyRegion {
        x: u32,
        y: u32,
        width: u32,
        height: u32,
    },

    #[error("Engine I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Image encoding failed: {0}")]
    ImageError(#[from] image::ImageError),

    #[error("Cloud OCR request failed: {0}")]
    RequestFailed(#[from] reqwest::Error),

    #[error("Cloud OCR returned {status}: {body}")]
    BadStatus { status: u16, body: String },

    #[error("Malformed recognition output: {0}")]
    MalformedOutput(String),

    #[error("Recognition task join failed: {0}")]
    TaskJoinFailed(String),
}

/// Translation provider errors (recoverable per detection)
#[derive(Debug, Error)]
pub enum TranslationError {
    #[error("API request failed: {0}")]
    ApiRequestFailed(#[from] reqwest::Error),

    #[error("Provider {provider} returned {status}: {body}")]
    BadStatus {
        provider: &'static str,
        status: u16,
        body: String,
    },

    #[error("Invalid response format: {0}")]
    InvalidResponse(String),

    #[error("Circuit breaker open for provider {0}")]
    CircuitOpen(&'static str),

    #[error("Translation task join failed: {0}")]
    TaskJoinFailed(String),
}

impl TranslationError {
    /// Timeouts, connect errors, 5xx and 429 are worth another attempt
    pub fn is_retryable(&self) -> bool {
        match self {
            TranslationError::ApiRequestFailed(e) => e.is_timeout() || e.is_connect(),
            TranslationError::BadStatus { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }

    /// Whether the error says the provider itself is unhealthy.
    ///
    /// Client-side rejections (bad key, bad request) depend on the caller's
    /// credentials and must not trip a breaker shared by every caller.
    pub fn is_provider_fault(&self) -> bool {
        match self {
            TranslationError::ApiRequestFailed(_) | TranslationError::InvalidResponse(_) => true,
            TranslationError::BadStatus { status, .. } => *status >= 500 || *status == 429,
            TranslationError::CircuitOpen(_) | TranslationError::TaskJoinFailed(_) => false,
        }
    }
}

/// Pipeline orchestration errors (always fatal for the request)
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Model loading failed: {0}")]
    ModelLoading(#[source] DetectionError),

    #[error("Inference failed: {0}")]
    Inference(#[source] DetectionError),

    #[error("Invalid request image: {0}")]
    InvalidImage(String),
}

/// Request routing errors
#[derive(Debug, Error)]
pub enum RouterError {
    #[error("Request id '{0}' is already in flight")]
    DuplicateRequestId(String),

    #[error("Worker is unavailable: {0}")]
    WorkerUnavailable(String),

    #[error("Response channel for '{0}' closed before a result arrived")]
    ResponseDropped(String),
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Confidence threshold must be in [0.0, 1.0], got {0}")]
    InvalidConfidenceThreshold(f32),

    #[error("IoU threshold must be in [0.0, 1.0], got {0}")]
    InvalidIoUThreshold(f32),

    #[error("Mask threshold must be in (0.0, 1.0), got {0}")]
    InvalidMaskThreshold(f32),

    #[error("Concurrency limit for {name} must be >= 1, got {value}")]
    InvalidConcurrency { name: &'static str, value: usize },

    #[error("Invalid detection config: {0}")]
    InvalidDetectionConfig(String),

    #[error("Invalid recognition config: {0}")]
    InvalidRecognitionConfig(String),

    #[error("Unknown provider '{0}'")]
    UnknownProvider(String),
}

pub type DetectionResult<T> = Result<T, DetectionError>;
pub type MaskResult<T> = Result<T, MaskError>;
pub type RecognitionResult<T> = Result<T, RecognitionError>;
pub type TranslationResult<T> = Result<T, TranslationError>;
pub type PipelineResult<T> = Result<T, PipelineError>;
pub type RouterResult<T> = Result<T, RouterError>;
pub type ConfigResult<T> = Result<T, ConfigError>;
