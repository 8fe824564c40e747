// Region recognition stage
//
// Per detection: crop → upscale → greyscale → class-tuned cleanup → OCR
// (bounded by the recognition limiter) → confidence filtering → text
// normalization and font-size estimation. Failures never escape; they
// produce empty text with a geometric font-size estimate.

use image::{DynamicImage, GrayImage};
use std::sync::Arc;
use tracing::{debug, instrument, warn};

use crate::core::config::RecognitionConfig;
use crate::core::errors::{RecognitionError, RecognitionResult};
use crate::core::types::{BoundingBox, Detection, Settings};
use crate::middleware::ConcurrencyLimiter;
use crate::services::ocr::{RecognitionEnginePool, RecognizedPage};
use crate::utils::image_ops::{
    binarize_otsu, blur_edges_with_gradient, crop_to_box, soft_blur, to_grey, upscale,
};
use crate::utils::Metrics;

/// Preprocessing family for a region
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionKind {
    /// Text on a filled balloon; binarized hard
    Bubble,
    /// Text drawn over artwork; softened instead of binarized
    FreeText,
}

impl RegionKind {
    pub fn for_detection(detection: &Detection) -> Self {
        match detection.class_label.as_deref() {
            Some(label) if label.contains("free") => RegionKind::FreeText,
            _ => RegionKind::Bubble,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RecognitionParams {
    pub upscale_factor: u32,
    pub block_min_confidence: f32,
    pub line_min_confidence: f32,
    pub word_min_confidence: f32,
    pub blur_sigma: f32,
}

impl From<&RecognitionConfig> for RecognitionParams {
    fn from(config: &RecognitionConfig) -> Self {
        Self {
            upscale_factor: config.upscale_factor.max(1),
            block_min_confidence: config.block_min_confidence,
            line_min_confidence: config.line_min_confidence,
            word_min_confidence: config.word_min_confidence,
            blur_sigma: 1.0,
        }
    }
}

/// What the stage writes back into a detection
#[derive(Debug, Clone, PartialEq)]
pub struct RegionText {
    pub text: String,
    pub font_size: f32,
    /// Confident line boxes in source-image pixels
    pub line_boxes: Vec<BoundingBox>,
}

impl RegionText {
    fn empty(box_height: f32, line_count: usize) -> Self {
        Self {
            text: String::new(),
            font_size: box_height / line_count.max(1) as f32,
            line_boxes: Vec::new(),
        }
    }
}

/// Filtered text plus the geometry needed for font sizing
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AssembledText {
    pub text: String,
    /// Confident line boxes in the coordinates the engine saw
    pub confident_lines: Vec<BoundingBox>,
    /// Every line the engine reported
    pub total_lines: usize,
}

/// Scripts written without spaces between words
fn joins_without_spaces(language: &str) -> bool {
    let lang = language.trim().to_lowercase();
    lang.starts_with("ja") || lang.starts_with("zh") || lang.starts_with("jpn") || lang.starts_with("chi")
}

/// Keep confident blocks/lines/words and join them into normalized text
pub fn assemble_text(page: &RecognizedPage, params: &RecognitionParams, language: &str) -> AssembledText {
    let separator = if joins_without_spaces(language) { "" } else { " " };
    let mut lines_text: Vec<String> = Vec::new();
    let mut confident_lines = Vec::new();
    let mut total_lines = 0;

    for block in &page.blocks {
        total_lines += block.lines.len();
        if block.confidence < params.block_min_confidence {
            continue;
        }
        for line in &block.lines {
            if line.confidence < params.line_min_confidence {
                continue;
            }
            let words: Vec<&str> = line
                .words
                .iter()
                .filter(|w| w.confidence >= params.word_min_confidence)
                .map(|w| w.text.trim())
                .filter(|t| !t.is_empty())
                .collect();
            if words.is_empty() {
                continue;
            }
            lines_text.push(words.join(separator));
            confident_lines.push(line.bbox);
        }
    }

    AssembledText {
        text: normalize_text(&lines_text, separator),
        confident_lines,
        total_lines,
    }
}

/// Join lines, undo line-wrap hyphenation and collapse whitespace
pub fn normalize_text(lines: &[String], separator: &str) -> String {
    let mut out = String::new();

    for line in lines {
        let line = line.split_whitespace().collect::<Vec<_>>().join(" ");
        if line.is_empty() {
            continue;
        }
        if out.is_empty() {
            out.push_str(&line);
            continue;
        }

        let wrapped_word = out.ends_with('-')
            && out
                .chars()
                .rev()
                .nth(1)
                .map(|c| c.is_alphabetic())
                .unwrap_or(false)
            && line.chars().next().map(|c| c.is_alphabetic()).unwrap_or(false);

        if wrapped_word {
            out.pop();
        } else {
            out.push_str(separator);
        }
        out.push_str(&line);
    }

    out.trim().to_string()
}

/// Crop, enlarge and clean a region for OCR
pub fn preprocess_region(
    image: &DynamicImage,
    bbox: &BoundingBox,
    kind: RegionKind,
    params: &RecognitionParams,
) -> RecognitionResult<(GrayImage, (u32, u32))> {
    let (x, y, w, h) = bbox
        .pixel_rect(image.width(), image.height())
        .ok_or(RecognitionError::EmptyRegion {
            x: bbox.x1.max(0.0) as u32,
            y: bbox.y1.max(0.0) as u32,
            width: bbox.width() as u32,
            height: bbox.height() as u32,
        })?;

    let cropped = crop_to_box(image, bbox).ok_or(RecognitionError::EmptyRegion {
        x,
        y,
        width: w,
        height: h,
    })?;
    let grey = to_grey(&upscale(&cropped, params.upscale_factor));

    let processed = match kind {
        RegionKind::Bubble => binarize_otsu(&grey),
        RegionKind::FreeText => blur_edges_with_gradient(
            &soft_blur(&grey, params.blur_sigma),
            params.blur_sigma * params.upscale_factor as f32 * 3.0,
        ),
    };

    Ok((processed, (x, y)))
}

/// Font size and line boxes back in source-image pixels
fn finish(
    assembled: AssembledText,
    bbox: &BoundingBox,
    origin: (u32, u32),
    upscale_factor: u32,
) -> RegionText {
    let scale = upscale_factor.max(1) as f32;
    if assembled.text.is_empty() || assembled.confident_lines.is_empty() {
        return RegionText::empty(bbox.height(), assembled.total_lines);
    }

    let mean_height = assembled
        .confident_lines
        .iter()
        .map(|b| b.height())
        .sum::<f32>()
        / assembled.confident_lines.len() as f32;

    let (ox, oy) = (origin.0 as f32, origin.1 as f32);
    let line_boxes = assembled
        .confident_lines
        .iter()
        .map(|b| BoundingBox::new(b.x1 / scale + ox, b.y1 / scale + oy, b.x2 / scale + ox, b.y2 / scale + oy))
        .collect();

    RegionText {
        text: assembled.text,
        font_size: mean_height / scale,
        line_boxes,
    }
}

pub struct RegionRecognitionStage {
    pool: Arc<RecognitionEnginePool>,
    limiter: ConcurrencyLimiter,
    params: RecognitionParams,
    metrics: Metrics,
}

impl RegionRecognitionStage {
    pub fn new(
        pool: Arc<RecognitionEnginePool>,
        limiter: ConcurrencyLimiter,
        params: RecognitionParams,
        metrics: Metrics,
    ) -> Self {
        Self {
            pool,
            limiter,
            params,
            metrics,
        }
    }

    pub fn limiter(&self) -> &ConcurrencyLimiter {
        &self.limiter
    }

    pub fn pool(&self) -> &Arc<RecognitionEnginePool> {
        &self.pool
    }

    async fn run(
        &self,
        image: Arc<DynamicImage>,
        detection: &Detection,
        settings: &Settings,
    ) -> RecognitionResult<RegionText> {
        let bbox = detection.bbox;
        let kind = RegionKind::for_detection(detection);
        let params = self.params.clone();

        // The slot is taken before preprocessing so regions reach the engine
        // in submission order, whatever their size
        let (page, origin) = {
            let _slot = self.limiter.acquire().await;

            let (processed, origin) = tokio::task::spawn_blocking(move || {
                preprocess_region(&image, &bbox, kind, &params)
            })
            .await
            .map_err(|e| RecognitionError::TaskJoinFailed(e.to_string()))??;

            let engine = self
                .pool
                .acquire(settings.ocr_provider, &settings.source_language)
                .await?;
            (engine.recognize(&processed, &settings.credentials).await?, origin)
        };
        let language = settings.source_language.as_str();

        let assembled = assemble_text(&page, &self.params, language);
        Ok(finish(assembled, &bbox, origin, self.params.upscale_factor))
    }

    /// Recognize one region; never fails
    #[instrument(skip(self, image, detection, settings), fields(class = detection.class_index))]
    pub async fn recognize(
        &self,
        image: Arc<DynamicImage>,
        detection: &Detection,
        settings: &Settings,
    ) -> RegionText {
        match self.run(image, detection, settings).await {
            Ok(region) => {
                debug!("Recognized {} chars", region.text.chars().count());
                self.metrics.record_recognition(true, region.text.is_empty());
                region
            }
            Err(e) => {
                warn!("Recognition failed, continuing with empty text: {}", e);
                self.metrics.record_recognition(false, true);
                RegionText::empty(detection.bbox.height(), 1)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{Credentials, OcrProvider};
    use crate::services::ocr::{
        EngineFactory, RecognitionEngine, RecognizedBlock, RecognizedLine, RecognizedWord,
    };
    use async_trait::async_trait;
    use image::{Rgba, RgbaImage};

    fn params() -> RecognitionParams {
        RecognitionParams {
            upscale_factor: 3,
            block_min_confidence: 40.0,
            line_min_confidence: 60.0,
            word_min_confidence: 20.0,
            blur_sigma: 1.0,
        }
    }

    fn word(text: &str, confidence: f32) -> RecognizedWord {
        RecognizedWord {
            text: text.to_string(),
            confidence,
            bbox: BoundingBox::new(0.0, 0.0, 10.0, 10.0),
        }
    }

    fn line(confidence: f32, y: f32, height: f32, words: Vec<RecognizedWord>) -> RecognizedLine {
        RecognizedLine {
            confidence,
            bbox: BoundingBox::new(0.0, y, 90.0, y + height),
            words,
        }
    }

    fn page(lines: Vec<RecognizedLine>, block_confidence: f32) -> RecognizedPage {
        RecognizedPage {
            blocks: vec![RecognizedBlock {
                confidence: block_confidence,
                bbox: BoundingBox::new(0.0, 0.0, 90.0, 90.0),
                lines,
            }],
        }
    }

    #[test]
    fn test_confidence_cutoffs() {
        let p = page(
            vec![
                line(80.0, 0.0, 30.0, vec![word("keep", 90.0), word("noise", 10.0), word("me", 25.0)]),
                line(50.0, 30.0, 30.0, vec![word("dropped", 95.0)]),
            ],
            70.0,
        );
        let assembled = assemble_text(&p, &params(), "en");
        assert_eq!(assembled.text, "keep me");
        assert_eq!(assembled.confident_lines.len(), 1);
        assert_eq!(assembled.total_lines, 2);

        let weak_block = page(vec![line(99.0, 0.0, 30.0, vec![word("x", 99.0)])], 30.0);
        assert_eq!(assemble_text(&weak_block, &params(), "en").text, "");
    }

    #[test]
    fn test_hyphenation_and_whitespace() {
        let lines = vec![
            "Where  are you   go-".to_string(),
            "ing now?".to_string(),
            "Well -".to_string(),
            "fine".to_string(),
        ];
        assert_eq!(normalize_text(&lines, " "), "Where are you going now? Well - fine");
    }

    #[test]
    fn test_cjk_lines_join_without_spaces() {
        let p = page(
            vec![
                line(90.0, 0.0, 30.0, vec![word("何", 90.0), word("だ", 90.0)]),
                line(90.0, 30.0, 30.0, vec![word("と", 90.0)]),
            ],
            90.0,
        );
        assert_eq!(assemble_text(&p, &params(), "ja").text, "何だと");
    }

    #[test]
    fn test_no_confident_line_falls_back_to_box_geometry() {
        let p = page(
            vec![
                line(10.0, 0.0, 30.0, vec![word("a", 10.0)]),
                line(10.0, 30.0, 30.0, vec![word("b", 10.0)]),
            ],
            90.0,
        );
        let assembled = assemble_text(&p, &params(), "en");
        let bbox = BoundingBox::new(10.0, 10.0, 50.0, 70.0);
        let region = finish(assembled, &bbox, (10, 10), 3);

        assert_eq!(region.text, "");
        assert_eq!(region.font_size, 30.0);
        assert!(region.line_boxes.is_empty());

        let empty = finish(AssembledText::default(), &bbox, (10, 10), 3);
        assert_eq!(empty.font_size, 60.0);
    }

    #[test]
    fn test_font_size_and_line_boxes_in_source_space() {
        let p = page(
            vec![
                line(90.0, 0.0, 30.0, vec![word("a", 90.0)]),
                line(90.0, 30.0, 60.0, vec![word("b", 90.0)]),
            ],
            90.0,
        );
        let assembled = assemble_text(&p, &params(), "en");
        let region = finish(assembled, &BoundingBox::new(100.0, 200.0, 130.0, 230.0), (100, 200), 3);

        assert_eq!(region.font_size, 15.0);
        assert_eq!(region.line_boxes[1], BoundingBox::new(100.0, 210.0, 130.0, 230.0));
    }

    #[test]
    fn test_preprocess_bubble_is_binary_and_upscaled() {
        let img = DynamicImage::ImageRgba8(RgbaImage::from_fn(40, 40, |x, _| {
            if x < 20 {
                Rgba([20, 20, 20, 255])
            } else {
                Rgba([230, 230, 230, 255])
            }
        }));
        let bbox = BoundingBox::new(10.0, 10.0, 30.0, 20.0);

        let (grey, origin) = preprocess_region(&img, &bbox, RegionKind::Bubble, &params()).unwrap();
        assert_eq!(origin, (10, 10));
        assert_eq!(grey.dimensions(), (60, 30));
        assert!(grey.pixels().all(|p| p[0] == 0 || p[0] == 255));
    }

    struct FailingFactory;

    #[async_trait]
    impl EngineFactory for FailingFactory {
        async fn create(
            &self,
            _provider: OcrProvider,
            language: &str,
        ) -> RecognitionResult<Arc<dyn RecognitionEngine>> {
            Err(RecognitionError::EngineUnavailable {
                language: language.to_string(),
                reason: "missing".to_string(),
            })
        }
    }

    #[tokio::test]
    async fn test_engine_failure_yields_empty_text() {
        let stage = RegionRecognitionStage::new(
            Arc::new(RecognitionEnginePool::new(Arc::new(FailingFactory))),
            ConcurrencyLimiter::new("recognition", 1),
            params(),
            Metrics::new(),
        );
        let img = Arc::new(DynamicImage::ImageRgba8(RgbaImage::new(50, 50)));
        let detection = Detection::new(BoundingBox::new(0.0, 0.0, 20.0, 24.0), 0.9, 1);
        let settings = Settings {
            credentials: Credentials::default(),
            ..Settings::default()
        };

        let region = stage.recognize(img, &detection, &settings).await;
        assert_eq!(region.text, "");
        assert_eq!(region.font_size, 24.0);
        assert_eq!(stage.limiter().running(), 0);
    }

    /// Records the width of every image it is handed
    struct RecordingEngine {
        widths: Arc<parking_lot::Mutex<Vec<u32>>>,
    }

    #[async_trait]
    impl RecognitionEngine for RecordingEngine {
        fn provider(&self) -> OcrProvider {
            OcrProvider::LocalEngine
        }

        fn language(&self) -> &str {
            "jpn"
        }

        async fn recognize(
            &self,
            image: &GrayImage,
            _credentials: &Credentials,
        ) -> RecognitionResult<RecognizedPage> {
            self.widths.lock().push(image.width());
            Ok(RecognizedPage::default())
        }
    }

    struct RecordingFactory {
        widths: Arc<parking_lot::Mutex<Vec<u32>>>,
    }

    #[async_trait]
    impl EngineFactory for RecordingFactory {
        async fn create(
            &self,
            _provider: OcrProvider,
            _language: &str,
        ) -> RecognitionResult<Arc<dyn RecognitionEngine>> {
            Ok(Arc::new(RecordingEngine {
                widths: Arc::clone(&self.widths),
            }))
        }
    }

    #[tokio::test]
    async fn test_regions_reach_engine_in_submission_order() {
        let widths = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let stage = RegionRecognitionStage::new(
            Arc::new(RecognitionEnginePool::new(Arc::new(RecordingFactory {
                widths: Arc::clone(&widths),
            }))),
            ConcurrencyLimiter::new("recognition", 1),
            params(),
            Metrics::new(),
        );
        let img = Arc::new(DynamicImage::ImageRgba8(RgbaImage::new(1600, 100)));
        let large = Detection::new(BoundingBox::new(0.0, 0.0, 1500.0, 20.0), 0.9, 1);
        let small = Detection::new(BoundingBox::new(0.0, 0.0, 10.0, 10.0), 0.9, 1);
        let settings = Settings::default();

        futures::future::join_all([
            stage.recognize(Arc::clone(&img), &large, &settings),
            stage.recognize(Arc::clone(&img), &small, &settings),
        ])
        .await;

        assert_eq!(*widths.lock(), vec![4500, 30]);
    }
}
