use crate::core::errors::ConfigError;
use crate::core::types::{Credentials, OcrProvider, Settings, TranslationProviderKind};
use std::env;
use std::str::FromStr;
use tracing::Level;

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub host: String,
    pub log_level: Level,
}

/// Output head family of the exported detector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectorHead {
    /// Packed `[x1, y1, x2, y2, score, class]` rows in input pixels
    Yolo,
    /// Per-query class logits plus normalized center-size boxes
    Detr,
}

impl FromStr for DetectorHead {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "yolo" => Ok(DetectorHead::Yolo),
            "detr" => Ok(DetectorHead::Detr),
            other => Err(ConfigError::InvalidDetectionConfig(format!(
                "unknown detector head '{}'",
                other
            ))),
        }
    }
}

/// Detection model and decoder configuration
#[derive(Debug, Clone)]
pub struct DetectionConfig {
    pub detector_model_path: String,
    pub head: DetectorHead,
    pub confidence_threshold: f32,
    pub iou_threshold: f32,
    /// Square model input size
    pub target_size: u32,
    /// Scope NMS to a single class instead of suppressing across classes
    pub nms_per_class: bool,
    /// Class labels indexed by class id; index 0 is the background sentinel
    pub class_labels: Vec<String>,
    pub inference_backend: Option<String>,
}

/// Mask reconstruction configuration
#[derive(Debug, Clone)]
pub struct MaskConfig {
    pub enabled: bool,
    pub threshold: f32,
    pub inverted: bool,
}

/// Text recognition configuration
#[derive(Debug, Clone)]
pub struct RecognitionConfig {
    pub max_concurrent: usize,
    pub upscale_factor: u32,
    pub line_min_confidence: f32,
    pub word_min_confidence: f32,
    pub block_min_confidence: f32,
    pub tesseract_path: String,
    pub vision_endpoint: String,
    /// Local-engine language used when the source language is `auto`
    pub auto_language: String,
}

/// Translation configuration
#[derive(Debug, Clone)]
pub struct TranslationConfig {
    pub max_concurrent: usize,
    pub timeout_seconds: u64,
    pub cache_entries: usize,
    pub google_endpoint: String,
    pub deepl_endpoint: String,
}

/// Main application configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub detection: DetectionConfig,
    pub mask: MaskConfig,
    pub recognition: RecognitionConfig,
    pub translation: TranslationConfig,
    /// Settings used by requests that carry none (until an updateSettings arrives)
    pub default_settings: Settings,
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

fn env_string(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn default_class_labels() -> Vec<String> {
    ["background", "bubble", "text_bubble", "text_free"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                port: 1420,
                host: "127.0.0.1".to_string(),
                log_level: Level::INFO,
            },
            detection: DetectionConfig {
                detector_model_path: "models/comic-bubble-detector.onnx".to_string(),
                head: DetectorHead::Yolo,
                confidence_threshold: 0.5,
                iou_threshold: 0.45,
                target_size: 1024,
                nms_per_class: false,
                class_labels: default_class_labels(),
                inference_backend: None,
            },
            mask: MaskConfig {
                enabled: false,
                threshold: 0.5,
                inverted: false,
            },
            recognition: RecognitionConfig {
                max_concurrent: 3,
                upscale_factor: 3,
                line_min_confidence: 60.0,
                word_min_confidence: 20.0,
                block_min_confidence: 40.0,
                tesseract_path: "tesseract".to_string(),
                vision_endpoint: "https://vision.googleapis.com/v1/images:annotate".to_string(),
                auto_language: "jpn".to_string(),
            },
            translation: TranslationConfig {
                max_concurrent: 5,
                timeout_seconds: 30,
                cache_entries: 2048,
                google_endpoint: "https://translation.googleapis.com/language/translate/v2"
                    .to_string(),
                deepl_endpoint: "https://api-free.deepl.com/v2/translate".to_string(),
            },
            default_settings: Settings::default(),
        }
    }
}

impl Config {
    pub fn new() -> Result<Self, ConfigError> {
        // Load .env file if it exists
        let _ = dotenvy::dotenv();

        let config = Self::load_from_env()?;
        config.validate()?;
        Ok(config)
    }

    fn load_from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let log_level = env::var("LOG_LEVEL")
            .ok()
            .and_then(|s| match s.to_lowercase().as_str() {
                "trace" => Some(Level::TRACE),
                "debug" => Some(Level::DEBUG),
                "info" => Some(Level::INFO),
                "warn" | "warning" => Some(Level::WARN),
                "error" => Some(Level::ERROR),
                _ => None,
            })
            .unwrap_or(defaults.server.log_level);

        let class_labels = env::var("CLASS_LABELS")
            .ok()
            .map(|labels| {
                labels
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect::<Vec<_>>()
            })
            .filter(|labels| !labels.is_empty())
            .unwrap_or(defaults.detection.class_labels);

        let head = match env::var("DETECTOR_HEAD") {
            Ok(s) => DetectorHead::from_str(&s)?,
            Err(_) => defaults.detection.head,
        };

        let ocr_provider = match env::var("DEFAULT_OCR_PROVIDER") {
            Ok(s) => OcrProvider::from_str(&s)?,
            Err(_) => defaults.default_settings.ocr_provider,
        };
        let translation_provider = match env::var("DEFAULT_TRANSLATION_PROVIDER") {
            Ok(s) => TranslationProviderKind::from_str(&s)?,
            Err(_) => defaults.default_settings.translation_provider,
        };

        Ok(Self {
            server: ServerConfig {
                port: env_or("SERVER_PORT", defaults.server.port),
                host: env_string("SERVER_HOST", &defaults.server.host),
                log_level,
            },
            detection: DetectionConfig {
                detector_model_path: env_string(
                    "DETECTOR_MODEL_PATH",
                    &defaults.detection.detector_model_path,
                ),
                head,
                confidence_threshold: env_or(
                    "CONFIDENCE_THRESHOLD",
                    defaults.detection.confidence_threshold,
                ),
                iou_threshold: env_or("IOU_THRESHOLD", defaults.detection.iou_threshold),
                target_size: env_or("TARGET_SIZE", defaults.detection.target_size),
                nms_per_class: env_or("NMS_PER_CLASS", defaults.detection.nms_per_class),
                class_labels,
                inference_backend: env::var("INFERENCE_BACKEND")
                    .ok()
                    .map(|s| s.trim().to_uppercase())
                    .filter(|s| !s.is_empty()),
            },
            mask: MaskConfig {
                enabled: env_or("MASK_ENABLED", defaults.mask.enabled),
                threshold: env_or("MASK_THRESHOLD", defaults.mask.threshold),
                inverted: env_or("MASK_INVERTED", defaults.mask.inverted),
            },
            recognition: RecognitionConfig {
                max_concurrent: env_or("OCR_MAX_CONCURRENT", defaults.recognition.max_concurrent),
                upscale_factor: env_or("OCR_UPSCALE_FACTOR", defaults.recognition.upscale_factor),
                line_min_confidence: env_or(
                    "OCR_LINE_MIN_CONFIDENCE",
                    defaults.recognition.line_min_confidence,
                ),
                word_min_confidence: env_or(
                    "OCR_WORD_MIN_CONFIDENCE",
                    defaults.recognition.word_min_confidence,
                ),
                block_min_confidence: env_or(
                    "OCR_BLOCK_MIN_CONFIDENCE",
                    defaults.recognition.block_min_confidence,
                ),
                tesseract_path: env_string("TESSERACT_PATH", &defaults.recognition.tesseract_path),
                vision_endpoint: env_string(
                    "VISION_ENDPOINT",
                    &defaults.recognition.vision_endpoint,
                ),
                auto_language: env_string(
                    "OCR_AUTO_LANGUAGE",
                    &defaults.recognition.auto_language,
                ),
            },
            translation: TranslationConfig {
                max_concurrent: env_or(
                    "TRANSLATION_MAX_CONCURRENT",
                    defaults.translation.max_concurrent,
                ),
                timeout_seconds: env_or(
                    "TRANSLATION_TIMEOUT_SECONDS",
                    defaults.translation.timeout_seconds,
                ),
                cache_entries: env_or(
                    "TRANSLATION_CACHE_ENTRIES",
                    defaults.translation.cache_entries,
                ),
                google_endpoint: env_string(
                    "GOOGLE_TRANSLATE_ENDPOINT",
                    &defaults.translation.google_endpoint,
                ),
                deepl_endpoint: env_string("DEEPL_ENDPOINT", &defaults.translation.deepl_endpoint),
            },
            default_settings: Settings {
                ocr_provider,
                translation_provider,
                source_language: env_string(
                    "DEFAULT_SOURCE_LANGUAGE",
                    &defaults.default_settings.source_language,
                ),
                target_language: env_string(
                    "DEFAULT_TARGET_LANGUAGE",
                    &defaults.default_settings.target_language,
                ),
                credentials: Credentials {
                    api_key: env::var("GOOGLE_API_KEY").ok(),
                    deepl_key: env::var("DEEPL_API_KEY").ok(),
                },
            },
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.detection.confidence_threshold) {
            return Err(ConfigError::InvalidConfidenceThreshold(
                self.detection.confidence_threshold,
            ));
        }

        if !(0.0..=1.0).contains(&self.detection.iou_threshold) {
            return Err(ConfigError::InvalidIoUThreshold(self.detection.iou_threshold));
        }

        if !(self.mask.threshold > 0.0 && self.mask.threshold < 1.0) {
            return Err(ConfigError::InvalidMaskThreshold(self.mask.threshold));
        }

        if !(32..=2048).contains(&self.detection.target_size) {
            return Err(ConfigError::InvalidDetectionConfig(format!(
                "target_size must be between 32 and 2048, got {}",
                self.detection.target_size
            )));
        }

        if self.detection.class_labels.len() < 2 {
            return Err(ConfigError::InvalidDetectionConfig(
                "class_labels needs a background entry and at least one class".to_string(),
            ));
        }

        if self.recognition.max_concurrent == 0 {
            return Err(ConfigError::InvalidConcurrency {
                name: "recognition",
                value: self.recognition.max_concurrent,
            });
        }

        if self.translation.max_concurrent == 0 {
            return Err(ConfigError::InvalidConcurrency {
                name: "translation",
                value: self.translation.max_concurrent,
            });
        }

        if !(1..=8).contains(&self.recognition.upscale_factor) {
            return Err(ConfigError::InvalidRecognitionConfig(format!(
                "upscale_factor must be between 1 and 8, got {}",
                self.recognition.upscale_factor
            )));
        }

        for (name, value) in [
            ("line", self.recognition.line_min_confidence),
            ("word", self.recognition.word_min_confidence),
            ("block", self.recognition.block_min_confidence),
        ] {
            if !(0.0..=100.0).contains(&value) {
                return Err(ConfigError::InvalidRecognitionConfig(format!(
                    "{} confidence cutoff must be between 0 and 100, got {}",
                    name, value
                )));
            }
        }

        if self.translation.cache_entries == 0 {
            return Err(ConfigError::InvalidDetectionConfig(
                "translation cache needs at least one entry".to_string(),
            ));
        }

        Ok(())
    }

    pub fn server_port(&self) -> u16 {
        self.server.port
    }

    pub fn server_host(&self) -> &str {
        &self.server.host
    }

    pub fn log_level(&self) -> Level {
        self.server.log_level
    }

    pub fn confidence_threshold(&self) -> f32 {
        self.detection.confidence_threshold
    }

    pub fn iou_threshold(&self) -> f32 {
        self.detection.iou_threshold
    }

    pub fn target_size(&self) -> u32 {
        self.detection.target_size
    }

    pub fn upscale_factor(&self) -> u32 {
        self.recognition.upscale_factor
    }

    pub fn ocr_max_concurrent(&self) -> usize {
        self.recognition.max_concurrent
    }

    pub fn translation_max_concurrent(&self) -> usize {
        self.translation.max_concurrent
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.ocr_max_concurrent(), 3);
        assert_eq!(config.translation_max_concurrent(), 5);
        assert_eq!(config.detection.class_labels[0], "background");
        assert_eq!(config.recognition.auto_language, "jpn");
    }

    #[test]
    fn test_rejects_zero_concurrency() {
        let mut config = Config::default();
        config.translation.max_concurrent = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidConcurrency { name: "translation", .. })
        ));
    }

    #[test]
    fn test_rejects_out_of_range_thresholds() {
        let mut config = Config::default();
        config.detection.iou_threshold = 1.5;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidIoUThreshold(_))
        ));

        let mut config = Config::default();
        config.mask.threshold = 1.0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidMaskThreshold(_))
        ));
    }
}
