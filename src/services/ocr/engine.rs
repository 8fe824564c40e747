use async_trait::async_trait;
use image::GrayImage;
use std::sync::Arc;

use crate::core::errors::RecognitionResult;
use crate::core::types::{BoundingBox, Credentials, OcrProvider};

/// One recognized word; confidences are on a 0-100 scale
#[derive(Debug, Clone, PartialEq)]
pub struct RecognizedWord {
    pub text: String,
    pub confidence: f32,
    pub bbox: BoundingBox,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecognizedLine {
    pub confidence: f32,
    /// In the coordinates of the image handed to the engine
    pub bbox: BoundingBox,
    pub words: Vec<RecognizedWord>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecognizedBlock {
    pub confidence: f32,
    pub bbox: BoundingBox,
    pub lines: Vec<RecognizedLine>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecognizedPage {
    pub blocks: Vec<RecognizedBlock>,
}

impl RecognizedPage {
    pub fn is_empty(&self) -> bool {
        self.blocks.iter().all(|b| b.lines.is_empty())
    }
}

/// "Recognize text in an image region, get text plus per-line boxes back"
#[async_trait]
pub trait RecognitionEngine: Send + Sync {
    fn provider(&self) -> OcrProvider;

    fn language(&self) -> &str;

    async fn recognize(
        &self,
        image: &GrayImage,
        credentials: &Credentials,
    ) -> RecognitionResult<RecognizedPage>;
}

/// Creates engines for the pool; construction may be slow
#[async_trait]
pub trait EngineFactory: Send + Sync {
    async fn create(
        &self,
        provider: OcrProvider,
        language: &str,
    ) -> RecognitionResult<Arc<dyn RecognitionEngine>>;
}

/// Mean of `values`, or None when empty
pub(crate) fn mean(values: impl IntoIterator<Item = f32>) -> Option<f32> {
    let (sum, count) = values
        .into_iter()
        .fold((0.0f32, 0usize), |(s, n), v| (s + v, n + 1));
    (count > 0).then(|| sum / count as f32)
}

/// Smallest box covering all of `boxes`
pub(crate) fn union_box<'a>(boxes: impl IntoIterator<Item = &'a BoundingBox>) -> Option<BoundingBox> {
    boxes.into_iter().fold(None, |acc, b| {
        Some(match acc {
            None => *b,
            Some(u) => BoundingBox::new(
                u.x1.min(b.x1),
                u.y1.min(b.y1),
                u.x2.max(b.x2),
                u.y2.max(b.y2),
            ),
        })
    })
}
