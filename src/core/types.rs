// Data model and message protocol shared by the router, the worker and the pipeline

use base64::{engine::general_purpose, Engine};
use image::{DynamicImage, GrayImage, RgbaImage};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::warn;

use crate::core::errors::{ConfigError, PipelineError};
use crate::utils::image_ops::encode_png_data_url;

/// Axis-aligned box in source-image pixel coordinates
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BoundingBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    /// Build from center-size form `(cx, cy, w, h)`
    pub fn from_center(cx: f32, cy: f32, w: f32, h: f32) -> Self {
        Self {
            x1: cx - w / 2.0,
            y1: cy - h / 2.0,
            x2: cx + w / 2.0,
            y2: cy + h / 2.0,
        }
    }

    pub fn width(&self) -> f32 {
        (self.x2 - self.x1).max(0.0)
    }

    pub fn height(&self) -> f32 {
        (self.y2 - self.y1).max(0.0)
    }

    pub fn area(&self) -> f32 {
        self.width() * self.height()
    }

    pub fn is_degenerate(&self) -> bool {
        !(self.x2 > self.x1 && self.y2 > self.y1)
    }

    /// Intersection over union, 0 when the boxes are disjoint
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let x1 = self.x1.max(other.x1);
        let y1 = self.y1.max(other.y1);
        let x2 = self.x2.min(other.x2);
        let y2 = self.y2.min(other.y2);

        if x2 <= x1 || y2 <= y1 {
            return 0.0;
        }

        let intersection = (x2 - x1) * (y2 - y1);
        let union = self.area() + other.area() - intersection;

        if union > 0.0 {
            (intersection / union).clamp(0.0, 1.0)
        } else {
            0.0
        }
    }

    /// Clamp to `[0, width] x [0, height]`
    pub fn clamp_to(&self, width: u32, height: u32) -> Self {
        let (w, h) = (width as f32, height as f32);
        Self {
            x1: self.x1.clamp(0.0, w),
            y1: self.y1.clamp(0.0, h),
            x2: self.x2.clamp(0.0, w),
            y2: self.y2.clamp(0.0, h),
        }
    }

    /// Integer pixel rectangle `(x, y, w, h)` inside an image, or None if empty
    pub fn pixel_rect(&self, width: u32, height: u32) -> Option<(u32, u32, u32, u32)> {
        let clamped = self.clamp_to(width, height);
        let x = clamped.x1.floor() as u32;
        let y = clamped.y1.floor() as u32;
        let x2 = (clamped.x2.ceil() as u32).min(width);
        let y2 = (clamped.y2.ceil() as u32).min(height);
        if x2 <= x || y2 <= y {
            return None;
        }
        Some((x, y, x2 - x, y2 - y))
    }
}

/// One recognized region of interest
#[derive(Debug, Clone)]
pub struct Detection {
    pub bbox: BoundingBox,
    pub confidence: f32,
    pub class_index: usize,
    pub class_label: Option<String>,
    /// Luma mask aligned to `bbox` (255 = foreground)
    pub mask: Option<GrayImage>,
    pub recognized_text: String,
    pub translated_text: String,
    pub font_size: Option<f32>,
    pub line_boxes: Vec<BoundingBox>,
}

impl Detection {
    pub fn new(bbox: BoundingBox, confidence: f32, class_index: usize) -> Self {
        Self {
            bbox,
            confidence,
            class_index,
            class_label: None,
            mask: None,
            recognized_text: String::new(),
            translated_text: String::new(),
            font_size: None,
            line_boxes: Vec::new(),
        }
    }

    /// Convert to the wire shape; masks are sent as PNG data URLs
    pub fn to_wire(&self) -> DetectionWire {
        let mask = self.mask.as_ref().and_then(|mask| {
            match encode_png_data_url(&DynamicImage::ImageLuma8(mask.clone())) {
                Ok(url) => Some(url),
                Err(e) => {
                    warn!("Dropping mask that failed to encode: {}", e);
                    None
                }
            }
        });

        DetectionWire {
            x1: self.bbox.x1,
            y1: self.bbox.y1,
            x2: self.bbox.x2,
            y2: self.bbox.y2,
            confidence: self.confidence,
            class_index: self.class_index,
            class_label: self.class_label.clone(),
            text: self.recognized_text.clone(),
            translated_text: self.translated_text.clone(),
            font_size: self.font_size,
            mask,
            boxes: if self.line_boxes.is_empty() {
                None
            } else {
                Some(self.line_boxes.clone())
            },
        }
    }
}

/// Detection as it crosses the message boundary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectionWire {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
    pub confidence: f32,
    pub class_index: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class_label: Option<String>,
    pub text: String,
    pub translated_text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub font_size: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mask: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub boxes: Option<Vec<BoundingBox>>,
}

/// Raw RGBA pixel buffer
#[derive(Clone)]
pub struct RawImage {
    pub width: u32,
    pub height: u32,
    pub data: Arc<Vec<u8>>,
}

impl fmt::Debug for RawImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawImage")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("bytes", &self.data.len())
            .finish()
    }
}

impl RawImage {
    pub fn new(width: u32, height: u32, data: Vec<u8>) -> Result<Self, PipelineError> {
        let expected = width as usize * height as usize * 4;
        if width == 0 || height == 0 || data.len() != expected {
            return Err(PipelineError::InvalidImage(format!(
                "{}x{} RGBA needs {} bytes, got {}",
                width,
                height,
                expected,
                data.len()
            )));
        }
        Ok(Self {
            width,
            height,
            data: Arc::new(data),
        })
    }

    pub fn from_dynamic(img: &DynamicImage) -> Self {
        let rgba = img.to_rgba8();
        Self {
            width: rgba.width(),
            height: rgba.height(),
            data: Arc::new(rgba.into_raw()),
        }
    }

    pub fn to_dynamic(&self) -> Result<DynamicImage, PipelineError> {
        RgbaImage::from_raw(self.width, self.height, self.data.as_ref().clone())
            .map(DynamicImage::ImageRgba8)
            .ok_or_else(|| {
                PipelineError::InvalidImage(format!(
                    "buffer does not match {}x{}",
                    self.width, self.height
                ))
            })
    }
}

/// `imageData` as sent by callers: a raw base64 RGBA buffer or an encoded data URL
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ImagePayload {
    Raw { width: u32, height: u32, data: String },
    DataUrl(String),
}

impl ImagePayload {
    pub fn decode(&self) -> Result<RawImage, PipelineError> {
        match self {
            ImagePayload::Raw { width, height, data } => {
                let bytes = general_purpose::STANDARD
                    .decode(data)
                    .map_err(|e| PipelineError::InvalidImage(format!("bad base64: {}", e)))?;
                RawImage::new(*width, *height, bytes)
            }
            ImagePayload::DataUrl(url) => {
                let encoded = url
                    .split_once(";base64,")
                    .map(|(_, payload)| payload)
                    .unwrap_or(url.as_str());
                let bytes = general_purpose::STANDARD
                    .decode(encoded.trim())
                    .map_err(|e| PipelineError::InvalidImage(format!("bad base64: {}", e)))?;
                let img = image::load_from_memory(&bytes)
                    .map_err(|e| PipelineError::InvalidImage(e.to_string()))?;
                Ok(RawImage::from_dynamic(&img))
            }
        }
    }

    /// Decode on the blocking pool; base64 plus image decoding of large
    /// bodies must not stall the async runtime
    pub async fn decode_async(self) -> Result<RawImage, PipelineError> {
        tokio::task::spawn_blocking(move || self.decode())
            .await
            .map_err(|e| PipelineError::InvalidImage(format!("decode task failed: {}", e)))?
    }
}

/// Which recognition engine family handles a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum OcrProvider {
    #[default]
    #[serde(rename = "local-engine", alias = "tesseract")]
    LocalEngine,
    #[serde(rename = "cloud-vision-api", alias = "googleVision")]
    CloudVision,
}

impl OcrProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            OcrProvider::LocalEngine => "local-engine",
            OcrProvider::CloudVision => "cloud-vision-api",
        }
    }
}

impl FromStr for OcrProvider {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "local-engine" | "tesseract" | "local" => Ok(OcrProvider::LocalEngine),
            "cloud-vision-api" | "googlevision" | "cloud" => Ok(OcrProvider::CloudVision),
            other => Err(ConfigError::UnknownProvider(other.to_string())),
        }
    }
}

/// Which translation backend handles a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum TranslationProviderKind {
    #[default]
    #[serde(rename = "provider-A", alias = "google")]
    Google,
    #[serde(rename = "provider-B", alias = "deepl")]
    DeepL,
}

impl TranslationProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TranslationProviderKind::Google => "google",
            TranslationProviderKind::DeepL => "deepl",
        }
    }
}

impl FromStr for TranslationProviderKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "provider-a" | "google" => Ok(TranslationProviderKind::Google),
            "provider-b" | "deepl" => Ok(TranslationProviderKind::DeepL),
            other => Err(ConfigError::UnknownProvider(other.to_string())),
        }
    }
}

/// Opaque provider credentials
#[derive(Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credentials {
    /// Shared key (Google Cloud Translation and Vision)
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub deepl_key: Option<String>,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &self.api_key.as_ref().map(|_| "***"))
            .field("deepl_key", &self.deepl_key.as_ref().map(|_| "***"))
            .finish()
    }
}

fn non_blank(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

impl Credentials {
    pub fn translation_key(&self, provider: TranslationProviderKind) -> Option<&str> {
        match provider {
            TranslationProviderKind::Google => non_blank(&self.api_key),
            TranslationProviderKind::DeepL => non_blank(&self.deepl_key),
        }
    }

    pub fn vision_key(&self) -> Option<&str> {
        non_blank(&self.api_key)
    }
}

pub const AUTO_LANGUAGE: &str = "auto";

fn default_source_language() -> String {
    AUTO_LANGUAGE.to_string()
}

fn default_target_language() -> String {
    "en".to_string()
}

/// Per-request settings; travels with each request as an immutable snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    #[serde(default, alias = "ocrService")]
    pub ocr_provider: OcrProvider,
    #[serde(default, alias = "translationService")]
    pub translation_provider: TranslationProviderKind,
    #[serde(default = "default_source_language")]
    pub source_language: String,
    #[serde(default = "default_target_language")]
    pub target_language: String,
    #[serde(default)]
    pub credentials: Credentials,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            ocr_provider: OcrProvider::default(),
            translation_provider: TranslationProviderKind::default(),
            source_language: default_source_language(),
            target_language: default_target_language(),
            credentials: Credentials::default(),
        }
    }
}

/// Correlation id linking a request to its eventual response
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

static REQUEST_COUNTER: AtomicU64 = AtomicU64::new(0);

impl RequestId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Router-assigned id: `req_<unix millis>_<sequence>`
    pub fn generate() -> Self {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or_default();
        let seq = REQUEST_COUNTER.fetch_add(1, Ordering::Relaxed);
        Self(format!("req_{}_{}", millis, seq))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A request as consumed by the orchestrator
#[derive(Debug, Clone)]
pub struct DetectionRequest {
    pub image: RawImage,
    pub request_id: RequestId,
    pub settings: Arc<Settings>,
}

/// Inbound messages for the worker that hosts the pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action")]
pub enum WorkerMessage {
    #[serde(rename = "detectObjects")]
    DetectObjects {
        #[serde(rename = "imageData")]
        image_data: ImagePayload,
        #[serde(rename = "requestId", default)]
        request_id: Option<RequestId>,
        #[serde(default)]
        settings: Option<Settings>,
    },
    #[serde(rename = "updateSettings")]
    UpdateSettings { settings: Settings },
}

/// Completion message; exactly one of `results` / `error` is set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectionResults {
    pub request_id: RequestId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub results: Option<Vec<DetectionWire>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DetectionResults {
    pub fn success(request_id: RequestId, results: Vec<DetectionWire>) -> Self {
        Self {
            request_id,
            results: Some(results),
            error: None,
        }
    }

    pub fn failure(request_id: RequestId, error: impl Into<String>) -> Self {
        Self {
            request_id,
            results: None,
            error: Some(error.into()),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// Outbound messages from the worker
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action")]
pub enum OutboundMessage {
    #[serde(rename = "detectionResults")]
    DetectionResults(DetectionResults),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_iou_identity_and_symmetry() {
        let a = BoundingBox::new(10.0, 10.0, 50.0, 40.0);
        let b = BoundingBox::new(30.0, 20.0, 70.0, 60.0);
        assert!((a.iou(&a) - 1.0).abs() < 1e-6);
        assert!((a.iou(&b) - b.iou(&a)).abs() < 1e-6);
        let iou = a.iou(&b);
        assert!((0.0..=1.0).contains(&iou));
    }

    #[test]
    fn test_iou_disjoint_is_zero() {
        let a = BoundingBox::new(0.0, 0.0, 10.0, 10.0);
        let b = BoundingBox::new(20.0, 20.0, 30.0, 30.0);
        assert_eq!(a.iou(&b), 0.0);
        // Touching edges do not overlap
        let c = BoundingBox::new(10.0, 0.0, 20.0, 10.0);
        assert_eq!(a.iou(&c), 0.0);
    }

    #[test]
    fn test_pixel_rect_clamps() {
        let b = BoundingBox::new(-5.0, 2.5, 120.0, 30.2);
        assert_eq!(b.pixel_rect(100, 100), Some((0, 2, 100, 29)));
        let outside = BoundingBox::new(150.0, 150.0, 160.0, 160.0);
        assert_eq!(outside.pixel_rect(100, 100), None);
    }

    #[test]
    fn test_settings_defaults_and_aliases() {
        let json = r#"{"ocrService":"cloud-vision-api","translationService":"deepl","targetLanguage":"fr"}"#;
        let settings: Settings = serde_json::from_str(json).unwrap();
        assert_eq!(settings.ocr_provider, OcrProvider::CloudVision);
        assert_eq!(settings.translation_provider, TranslationProviderKind::DeepL);
        assert_eq!(settings.source_language, "auto");
        assert_eq!(settings.target_language, "fr");
        assert!(settings.credentials.translation_key(TranslationProviderKind::DeepL).is_none());
    }

    #[test]
    fn test_blank_credentials_are_absent() {
        let creds = Credentials {
            api_key: Some("   ".to_string()),
            deepl_key: None,
        };
        assert!(creds.translation_key(TranslationProviderKind::Google).is_none());
        assert!(creds.vision_key().is_none());
        assert!(!format!("{:?}", creds).contains("   "));
    }

    #[test]
    fn test_detect_objects_message_parsing() {
        let json = r#"{
            "action": "detectObjects",
            "imageData": {"width": 1, "height": 1, "data": "AAAA/w=="},
            "requestId": "img_1"
        }"#;
        let message: WorkerMessage = serde_json::from_str(json).unwrap();
        match message {
            WorkerMessage::DetectObjects {
                image_data,
                request_id,
                settings,
            } => {
                assert_eq!(request_id, Some(RequestId::new("img_1")));
                assert!(settings.is_none());
                let raw = image_data.decode().unwrap();
                assert_eq!((raw.width, raw.height), (1, 1));
                assert_eq!(raw.data.as_slice(), &[0, 0, 0, 255]);
            }
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[test]
    fn test_raw_image_rejects_wrong_length() {
        assert!(RawImage::new(2, 2, vec![0; 15]).is_err());
        assert!(RawImage::new(0, 2, vec![]).is_err());
    }

    #[test]
    fn test_detection_results_wire_shape() {
        let mut detection = Detection::new(BoundingBox::new(1.0, 2.0, 3.0, 4.0), 0.9, 1);
        detection.recognized_text = "こんにちは".to_string();
        detection.translated_text = "Hello".to_string();
        let message = OutboundMessage::DetectionResults(DetectionResults::success(
            RequestId::new("r1"),
            vec![detection.to_wire()],
        ));
        let value = serde_json::to_value(&message).unwrap();
        assert_eq!(value["action"], "detectionResults");
        assert_eq!(value["requestId"], "r1");
        assert_eq!(value["results"][0]["text"], "こんにちは");
        assert_eq!(value["results"][0]["translatedText"], "Hello");
        assert_eq!(value["results"][0]["classIndex"], 1);
        assert!(value.get("error").is_none());
        assert!(value["results"][0].get("mask").is_none());
    }

    #[tokio::test]
    async fn test_payload_decodes_off_the_runtime() {
        let raw = ImagePayload::Raw {
            width: 1,
            height: 1,
            data: general_purpose::STANDARD.encode([10u8, 20, 30, 255]),
        };
        let image = raw.decode_async().await.unwrap();
        assert_eq!((image.width, image.height), (1, 1));

        let broken = ImagePayload::DataUrl("data:image/png;base64,@@@".to_string());
        assert!(matches!(
            broken.decode_async().await,
            Err(PipelineError::InvalidImage(_))
        ));
    }

    #[test]
    fn test_generated_request_ids_are_unique() {
        let a = RequestId::generate();
        let b = RequestId::generate();
        assert_ne!(a, b);
        assert!(a.as_str().starts_with("req_"));
    }
}
