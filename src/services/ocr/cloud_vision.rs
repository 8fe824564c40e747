// Cloud recognition through the Vision `images:annotate` endpoint
// Uses DOCUMENT_TEXT_DETECTION, which returns blocks → paragraphs → words → symbols

use async_trait::async_trait;
use base64::{engine::general_purpose, Engine};
use image::{DynamicImage, GrayImage};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{debug, instrument};

use super::engine::{
    mean, union_box, RecognitionEngine, RecognizedBlock, RecognizedLine, RecognizedPage,
    RecognizedWord,
};
use crate::core::errors::{RecognitionError, RecognitionResult};
use crate::core::types::{BoundingBox, Credentials, OcrProvider, AUTO_LANGUAGE};
use crate::utils::image_ops::encode_png;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AnnotateRequest {
    requests: Vec<AnnotateImageRequest>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AnnotateImageRequest {
    image: ImageContent,
    features: Vec<Feature>,
    #[serde(skip_serializing_if = "Option::is_none")]
    image_context: Option<ImageContext>,
}

#[derive(Debug, Serialize)]
struct ImageContent {
    content: String,
}

#[derive(Debug, Serialize)]
struct Feature {
    #[serde(rename = "type")]
    feature_type: &'static str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ImageContext {
    language_hints: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct AnnotateResponse {
    #[serde(default)]
    responses: Vec<AnnotateImageResponse>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AnnotateImageResponse {
    full_text_annotation: Option<TextAnnotation>,
    error: Option<ApiStatus>,
}

#[derive(Debug, Deserialize)]
struct ApiStatus {
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct TextAnnotation {
    #[serde(default)]
    pages: Vec<VisionPage>,
}

#[derive(Debug, Deserialize)]
struct VisionPage {
    #[serde(default)]
    blocks: Vec<VisionBlock>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VisionBlock {
    bounding_box: Option<BoundingPoly>,
    #[serde(default)]
    paragraphs: Vec<VisionParagraph>,
    #[serde(default)]
    confidence: f32,
}

#[derive(Debug, Deserialize)]
struct VisionParagraph {
    #[serde(default)]
    words: Vec<VisionWord>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VisionWord {
    bounding_box: Option<BoundingPoly>,
    #[serde(default)]
    symbols: Vec<VisionSymbol>,
    #[serde(default)]
    confidence: f32,
}

#[derive(Debug, Deserialize)]
struct VisionSymbol {
    #[serde(default)]
    text: String,
    property: Option<TextProperty>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TextProperty {
    detected_break: Option<DetectedBreak>,
}

#[derive(Debug, Deserialize)]
struct DetectedBreak {
    #[serde(rename = "type", default)]
    kind: String,
}

#[derive(Debug, Deserialize)]
struct BoundingPoly {
    #[serde(default)]
    vertices: Vec<Vertex>,
}

/// Vision omits zero coordinates
#[derive(Debug, Deserialize)]
struct Vertex {
    #[serde(default)]
    x: f32,
    #[serde(default)]
    y: f32,
}

impl BoundingPoly {
    fn to_box(&self) -> Option<BoundingBox> {
        let first = self.vertices.first()?;
        let init = BoundingBox::new(first.x, first.y, first.x, first.y);
        Some(self.vertices.iter().fold(init, |b, v| {
            BoundingBox::new(b.x1.min(v.x), b.y1.min(v.y), b.x2.max(v.x), b.y2.max(v.y))
        }))
    }
}

/// Convert the annotation into our hierarchy.
///
/// Vision has no line level; a line ends at a word whose last symbol carries
/// a line break. Confidences are rescaled from 0-1 to 0-100.
fn page_from_annotation(annotation: TextAnnotation) -> RecognizedPage {
    let mut blocks = Vec::new();

    for block in annotation.pages.into_iter().flat_map(|p| p.blocks) {
        let mut lines: Vec<RecognizedLine> = Vec::new();

        for paragraph in block.paragraphs {
            let mut current: Vec<RecognizedWord> = Vec::new();

            for word in paragraph.words {
                let mut text: String = word.symbols.iter().map(|s| s.text.as_str()).collect();
                let line_break = word
                    .symbols
                    .last()
                    .and_then(|s| s.property.as_ref())
                    .and_then(|p| p.detected_break.as_ref())
                    .map(|b| b.kind.as_str());

                if line_break == Some("HYPHEN") {
                    text.push('-');
                }

                if let Some(bbox) = word.bounding_box.as_ref().and_then(BoundingPoly::to_box) {
                    current.push(RecognizedWord {
                        text,
                        confidence: word.confidence * 100.0,
                        bbox,
                    });
                }

                if matches!(line_break, Some("LINE_BREAK" | "EOL_SURE_SPACE" | "HYPHEN")) {
                    close_line(&mut lines, &mut current);
                }
            }
            close_line(&mut lines, &mut current);
        }

        let bbox = block
            .bounding_box
            .as_ref()
            .and_then(BoundingPoly::to_box)
            .or_else(|| union_box(lines.iter().map(|l| &l.bbox)));

        if let Some(bbox) = bbox {
            blocks.push(RecognizedBlock {
                confidence: block.confidence * 100.0,
                bbox,
                lines,
            });
        }
    }

    RecognizedPage { blocks }
}

fn close_line(lines: &mut Vec<RecognizedLine>, words: &mut Vec<RecognizedWord>) {
    if words.is_empty() {
        return;
    }
    let words = std::mem::take(words);
    let (Some(confidence), Some(bbox)) = (
        mean(words.iter().map(|w| w.confidence)),
        union_box(words.iter().map(|w| &w.bbox)),
    ) else {
        return;
    };
    lines.push(RecognizedLine {
        confidence,
        bbox,
        words,
    });
}

pub struct CloudVisionEngine {
    http_client: reqwest::Client,
    endpoint: String,
    language: String,
}

impl CloudVisionEngine {
    pub fn new(endpoint: &str, language: &str) -> RecognitionResult<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .pool_max_idle_per_host(5)
            .connect_timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self {
            http_client,
            endpoint: endpoint.to_string(),
            language: language.to_string(),
        })
    }

    fn build_request(&self, png: &[u8]) -> AnnotateRequest {
        let image_context = (self.language != AUTO_LANGUAGE).then(|| ImageContext {
            language_hints: vec![self.language.clone()],
        });

        AnnotateRequest {
            requests: vec![AnnotateImageRequest {
                image: ImageContent {
                    content: general_purpose::STANDARD.encode(png),
                },
                features: vec![Feature {
                    feature_type: "DOCUMENT_TEXT_DETECTION",
                }],
                image_context,
            }],
        }
    }
}

#[async_trait]
impl RecognitionEngine for CloudVisionEngine {
    fn provider(&self) -> OcrProvider {
        OcrProvider::CloudVision
    }

    fn language(&self) -> &str {
        &self.language
    }

    #[instrument(skip(self, image, credentials), fields(lang = %self.language))]
    async fn recognize(
        &self,
        image: &GrayImage,
        credentials: &Credentials,
    ) -> RecognitionResult<RecognizedPage> {
        let api_key = credentials
            .vision_key()
            .ok_or_else(|| RecognitionError::EngineUnavailable {
                language: self.language.clone(),
                reason: "no API key configured".to_string(),
            })?;

        let png = encode_png(&DynamicImage::ImageLuma8(image.clone()))?;
        let request = self.build_request(&png);
        let start = Instant::now();

        let response = self
            .http_client
            .post(&self.endpoint)
            .query(&[("key", api_key)])
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RecognitionError::BadStatus {
                status: status.as_u16(),
                body,
            });
        }

        let data: AnnotateResponse = response.json().await?;
        let first = data
            .responses
            .into_iter()
            .next()
            .ok_or_else(|| RecognitionError::MalformedOutput("empty responses array".to_string()))?;

        if let Some(err) = first.error {
            return Err(RecognitionError::EngineFailed(err.message));
        }

        let page = first
            .full_text_annotation
            .map(page_from_annotation)
            .unwrap_or_default();

        debug!(
            "Vision: {} blocks in {:.2}ms",
            page.blocks.len(),
            start.elapsed().as_secs_f64() * 1000.0
        );
        Ok(page)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn word(text: &str, x: f32, conf: f32, brk: Option<&str>) -> serde_json::Value {
        let mut symbol = serde_json::json!({ "text": text });
        if let Some(kind) = brk {
            symbol["property"] = serde_json::json!({ "detectedBreak": { "type": kind } });
        }
        serde_json::json!({
            "boundingBox": { "vertices": [
                { "x": x, "y": 10 }, { "x": x + 20.0, "y": 10 },
                { "x": x + 20.0, "y": 30 }, { "x": x, "y": 30 }
            ]},
            "symbols": [symbol],
            "confidence": conf
        })
    }

    #[test]
    fn test_words_split_into_lines_on_breaks() {
        let json = serde_json::json!({
            "pages": [{ "blocks": [{
                "boundingBox": { "vertices": [{ "y": 5 }, { "x": 200, "y": 5 }, { "x": 200, "y": 80 }, { "y": 80 }] },
                "confidence": 0.9,
                "paragraphs": [{ "words": [
                    word("Hi", 0.0, 0.95, Some("SPACE")),
                    word("the", 30.0, 0.85, Some("HYPHEN")),
                    word("re", 0.0, 0.7, Some("LINE_BREAK")),
                ]}]
            }]}]
        });

        let annotation: TextAnnotation = serde_json::from_value(json).unwrap();
        let page = page_from_annotation(annotation);

        assert_eq!(page.blocks.len(), 1);
        let block = &page.blocks[0];
        assert!((block.confidence - 90.0).abs() < 1e-3);
        assert_eq!(block.bbox, BoundingBox::new(0.0, 5.0, 200.0, 80.0));
        assert_eq!(block.lines.len(), 2);
        assert_eq!(block.lines[0].words[1].text, "the-");
        assert!((block.lines[0].confidence - 90.0).abs() < 1e-3);
        assert_eq!(block.lines[1].words[0].text, "re");
    }

    #[test]
    fn test_request_carries_language_hint() {
        let engine = CloudVisionEngine::new("http://localhost/annotate", "ja").unwrap();
        let request = serde_json::to_value(engine.build_request(&[1, 2, 3])).unwrap();
        assert_eq!(
            request["requests"][0]["features"][0]["type"],
            "DOCUMENT_TEXT_DETECTION"
        );
        assert_eq!(request["requests"][0]["imageContext"]["languageHints"][0], "ja");

        let auto = CloudVisionEngine::new("http://localhost/annotate", "auto").unwrap();
        let request = serde_json::to_value(auto.build_request(&[1])).unwrap();
        assert!(request["requests"][0].get("imageContext").is_none());
    }

    #[tokio::test]
    async fn test_missing_key_is_unavailable() {
        let engine = CloudVisionEngine::new("http://localhost/annotate", "ja").unwrap();
        let result = engine
            .recognize(&GrayImage::new(4, 4), &Credentials::default())
            .await;
        assert!(matches!(result, Err(RecognitionError::EngineUnavailable { .. })));
    }
}
