// Pipeline orchestrator: one detection request from pixels to translated regions
//
// Idle → ModelLoading → Preprocessing → Inferring → Decoding →
// [MaskReconstructing] → RecognizingPerDetection → TranslatingPerDetection →
// Complete. Only model loading and inference can fail a request; every
// per-detection problem is absorbed by its stage.

use futures::future::join_all;
use rayon::prelude::*;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::OnceCell;
use tracing::{debug, info, instrument, warn};

use crate::core::config::Config;
use crate::core::errors::{DetectionError, PipelineError, PipelineResult};
use crate::core::types::{Detection, DetectionRequest, DetectionResults, RequestId};
use crate::services::detection::{
    decode, non_max_suppression, preprocess, DecodeConfig, DecodedCandidate, DetectionModel,
    HeadOutput, ModelLoader, NmsScope, OnnxModelLoader,
};
use crate::services::ocr::{DefaultEngineFactory, RecognitionEnginePool};
use crate::services::recognition::{RecognitionParams, RegionRecognitionStage};
use crate::services::segmentation::{crop_mask_to_box, reconstruct_mask, MaskParams, MaskPolarity};
use crate::services::translation::TranslationStage;
use crate::middleware::ConcurrencyLimiter;
use crate::utils::Metrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    ModelLoading,
    Preprocessing,
    Inferring,
    Decoding,
    MaskReconstructing,
    RecognizingPerDetection,
    TranslatingPerDetection,
    Complete,
    Failed,
}

impl PipelineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineState::Idle => "idle",
            PipelineState::ModelLoading => "model_loading",
            PipelineState::Preprocessing => "preprocessing",
            PipelineState::Inferring => "inferring",
            PipelineState::Decoding => "decoding",
            PipelineState::MaskReconstructing => "mask_reconstructing",
            PipelineState::RecognizingPerDetection => "recognizing",
            PipelineState::TranslatingPerDetection => "translating",
            PipelineState::Complete => "complete",
            PipelineState::Failed => "failed",
        }
    }

    pub fn can_transition_to(&self, next: PipelineState) -> bool {
        use PipelineState::*;
        matches!(
            (self, next),
            (Idle, ModelLoading)
                | (ModelLoading, Preprocessing)
                | (ModelLoading, Failed)
                | (Preprocessing, Inferring)
                | (Inferring, Decoding)
                | (Inferring, Failed)
                | (Decoding, MaskReconstructing)
                | (Decoding, RecognizingPerDetection)
                | (MaskReconstructing, RecognizingPerDetection)
                | (RecognizingPerDetection, TranslatingPerDetection)
                | (TranslatingPerDetection, Complete)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, PipelineState::Complete | PipelineState::Failed)
    }
}

/// Records the path a request takes through the state machine
#[derive(Debug)]
pub struct StateTracker {
    request_id: RequestId,
    history: Vec<PipelineState>,
}

impl StateTracker {
    pub fn new(request_id: RequestId) -> Self {
        Self {
            request_id,
            history: vec![PipelineState::Idle],
        }
    }

    pub fn current(&self) -> PipelineState {
        self.history
            .last()
            .copied()
            .unwrap_or(PipelineState::Idle)
    }

    pub fn history(&self) -> &[PipelineState] {
        &self.history
    }

    fn advance(&mut self, next: PipelineState) {
        let current = self.current();
        if !current.can_transition_to(next) {
            warn!(
                "[{}] Unexpected transition {} → {}",
                self.request_id,
                current.as_str(),
                next.as_str()
            );
        }
        debug!("[{}] {} → {}", self.request_id, current.as_str(), next.as_str());
        self.history.push(next);
    }
}

/// Terminal result of one pipeline run
#[derive(Debug, Clone)]
pub enum PipelineOutcome {
    Complete { detections: Vec<Detection> },
    Failed { error: String },
}

impl PipelineOutcome {
    pub fn into_results(self, request_id: RequestId) -> DetectionResults {
        match self {
            PipelineOutcome::Complete { detections } => DetectionResults::success(
                request_id,
                detections.iter().map(Detection::to_wire).collect(),
            ),
            PipelineOutcome::Failed { error } => DetectionResults::failure(request_id, error),
        }
    }

    /// `into_results` on the blocking pool; masks are PNG-encoded here
    pub async fn into_results_async(self, request_id: RequestId) -> DetectionResults {
        let id = request_id.clone();
        tokio::task::spawn_blocking(move || self.into_results(id))
            .await
            .unwrap_or_else(|e| {
                DetectionResults::failure(request_id, format!("result encoding failed: {}", e))
            })
    }
}

/// Decoder, NMS and mask parameters
#[derive(Debug, Clone)]
pub struct PipelineParams {
    pub confidence_threshold: f32,
    pub iou_threshold: f32,
    pub nms_scope: NmsScope,
    pub class_labels: Vec<String>,
    /// None disables mask reconstruction
    pub mask: Option<MaskParams>,
}

impl From<&Config> for PipelineParams {
    fn from(config: &Config) -> Self {
        let mask = config.mask.enabled.then(|| MaskParams {
            threshold: config.mask.threshold,
            polarity: if config.mask.inverted {
                MaskPolarity::Inverted
            } else {
                MaskPolarity::Normal
            },
        });

        Self {
            confidence_threshold: config.detection.confidence_threshold,
            iou_threshold: config.detection.iou_threshold,
            nms_scope: if config.detection.nms_per_class {
                NmsScope::PerClass
            } else {
                NmsScope::ClassAgnostic
            },
            class_labels: config.detection.class_labels.clone(),
            mask,
        }
    }
}

pub struct PipelineOrchestrator {
    loader: Arc<dyn ModelLoader>,
    model: OnceCell<Arc<dyn DetectionModel>>,
    recognition: Arc<RegionRecognitionStage>,
    translation: Arc<TranslationStage>,
    params: PipelineParams,
    metrics: Metrics,
}

impl PipelineOrchestrator {
    pub fn new(
        loader: Arc<dyn ModelLoader>,
        recognition: Arc<RegionRecognitionStage>,
        translation: Arc<TranslationStage>,
        params: PipelineParams,
        metrics: Metrics,
    ) -> Self {
        Self {
            loader,
            model: OnceCell::new(),
            recognition,
            translation,
            params,
            metrics,
        }
    }

    /// Wire the production stages from configuration; the model loads lazily
    pub fn from_config(config: &Config, metrics: Metrics) -> anyhow::Result<Self> {
        let loader = Arc::new(OnnxModelLoader::new(
            config.detection.clone(),
            config.mask.enabled,
        ));

        let pool = Arc::new(RecognitionEnginePool::new(Arc::new(
            DefaultEngineFactory::new(&config.recognition),
        )));
        let recognition = Arc::new(RegionRecognitionStage::new(
            pool,
            ConcurrencyLimiter::new("recognition", config.recognition.max_concurrent),
            RecognitionParams::from(&config.recognition),
            metrics.clone(),
        ));
        let translation = Arc::new(TranslationStage::from_config(
            &config.translation,
            metrics.clone(),
        )?);

        info!(
            "Pipeline ready (model: {}, ocr slots: {}, translation slots: {})",
            config.detection.detector_model_path,
            config.recognition.max_concurrent,
            config.translation.max_concurrent
        );

        Ok(Self::new(
            loader,
            recognition,
            translation,
            PipelineParams::from(config),
            metrics,
        ))
    }

    pub fn recognition(&self) -> &Arc<RegionRecognitionStage> {
        &self.recognition
    }

    pub fn translation(&self) -> &Arc<TranslationStage> {
        &self.translation
    }

    pub fn model_loaded(&self) -> bool {
        self.model.initialized()
    }

    /// Load the model once; concurrent callers share the same load and a
    /// failure is retried by the next caller
    pub async fn model(&self) -> PipelineResult<Arc<dyn DetectionModel>> {
        let model = self
            .model
            .get_or_try_init(|| async {
                let start = Instant::now();
                let model = self.loader.load().await?;
                info!(
                    "✓ Detection model loaded in {:.2}ms",
                    start.elapsed().as_secs_f64() * 1000.0
                );
                Ok::<_, DetectionError>(model)
            })
            .await
            .map_err(PipelineError::ModelLoading)?;
        Ok(Arc::clone(model))
    }

    fn decode_config(&self, model: &dyn DetectionModel) -> DecodeConfig {
        let spec = model.spec();
        DecodeConfig {
            layout: spec.layout,
            box_format: spec.box_format,
            box_scale: spec.box_scale,
            confidence_threshold: self.params.confidence_threshold,
            class_labels: self.params.class_labels.clone(),
        }
    }

    /// Run one request to its terminal outcome and record metrics
    pub async fn run(&self, request: &DetectionRequest) -> PipelineOutcome {
        let start = Instant::now();
        let mut tracker = StateTracker::new(request.request_id.clone());

        match self.execute(request, &mut tracker).await {
            Ok(detections) => {
                self.metrics
                    .record_request(true, detections.len(), start.elapsed());
                PipelineOutcome::Complete { detections }
            }
            Err(e) => {
                self.metrics.record_request(false, 0, start.elapsed());
                warn!("[{}] Pipeline failed: {}", request.request_id, e);
                PipelineOutcome::Failed {
                    error: e.to_string(),
                }
            }
        }
    }

    /// Detect, recognize and translate every region in the request image
    pub async fn detect(&self, request: &DetectionRequest) -> PipelineResult<Vec<Detection>> {
        let mut tracker = StateTracker::new(request.request_id.clone());
        self.execute(request, &mut tracker).await
    }

    #[instrument(
        skip(self, request, tracker),
        fields(request_id = %request.request_id, width = request.image.width, height = request.image.height)
    )]
    pub async fn execute(
        &self,
        request: &DetectionRequest,
        tracker: &mut StateTracker,
    ) -> PipelineResult<Vec<Detection>> {
        let start = Instant::now();
        // Raw buffers are validated at construction; a mismatch here is a
        // rejected request, not a pipeline failure
        let image = Arc::new(request.image.to_dynamic()?);
        let (width, height) = (image.width(), image.height());

        tracker.advance(PipelineState::ModelLoading);
        let model = match self.model().await {
            Ok(model) => model,
            Err(e) => {
                tracker.advance(PipelineState::Failed);
                return Err(e);
            }
        };

        tracker.advance(PipelineState::Preprocessing);
        let tensor = {
            let image = Arc::clone(&image);
            let spec = model.spec().clone();
            tokio::task::spawn_blocking(move || preprocess(&image, &spec))
                .await
                .map_err(|e| DetectionError::PreprocessingFailed(e.to_string()))
        };

        // A lost preprocessing task or a head that does not decode counts as
        // an inference failure
        tracker.advance(PipelineState::Inferring);
        let decode_config = self.decode_config(model.as_ref());
        let inferred = match tensor {
            Ok(tensor) => match model.infer(tensor).await {
                Ok(output) => decode(&output, &decode_config, width, height).map(|c| (output, c)),
                Err(e) => Err(e),
            },
            Err(e) => Err(e),
        };
        let (output, candidates) = match inferred {
            Ok(inferred) => inferred,
            Err(e) => {
                tracker.advance(PipelineState::Failed);
                return Err(PipelineError::Inference(e));
            }
        };

        tracker.advance(PipelineState::Decoding);
        let decoded = candidates.len();
        let kept = non_max_suppression(candidates, self.params.iou_threshold, self.params.nms_scope);
        debug!("NMS kept {}/{} detections", kept.len(), decoded);

        let mut detections = match (&output, self.params.mask) {
            (
                HeadOutput::PackedWithMasks {
                    coefficients,
                    prototypes,
                    ..
                },
                Some(mask_params),
            ) => {
                tracker.advance(PipelineState::MaskReconstructing);
                attach_masks(kept, coefficients, prototypes, width, height, mask_params)
            }
            _ => kept.into_iter().map(|c| c.detection).collect(),
        };

        tracker.advance(PipelineState::RecognizingPerDetection);
        let settings = Arc::clone(&request.settings);
        let regions = join_all(
            detections
                .iter()
                .map(|d| self.recognition.recognize(Arc::clone(&image), d, &settings)),
        )
        .await;
        for (detection, region) in detections.iter_mut().zip(regions) {
            detection.recognized_text = region.text;
            detection.font_size = Some(region.font_size);
            detection.line_boxes = region.line_boxes;
        }

        tracker.advance(PipelineState::TranslatingPerDetection);
        let translations = join_all(detections.iter().map(|d| {
            self.translation.translate(
                &d.recognized_text,
                &settings.source_language,
                &settings.target_language,
                settings.translation_provider,
                &settings.credentials,
            )
        }))
        .await;
        for (detection, translated) in detections.iter_mut().zip(translations) {
            detection.translated_text = translated;
        }

        tracker.advance(PipelineState::Complete);
        info!(
            "✓ {} detections in {:.2}ms",
            detections.len(),
            start.elapsed().as_secs_f64() * 1000.0
        );
        Ok(detections)
    }
}

/// Reconstruct and crop a mask per detection; a failed mask is dropped, not fatal
fn attach_masks(
    kept: Vec<DecodedCandidate>,
    coefficients: &ndarray::Array2<f32>,
    prototypes: &ndarray::Array3<f32>,
    width: u32,
    height: u32,
    params: MaskParams,
) -> Vec<Detection> {
    // Masks are independent per detection; indexed collect keeps the NMS order
    kept.into_par_iter()
        .map(|candidate| {
            let mut detection = candidate.detection;
            if candidate.row >= coefficients.nrows() {
                warn!("No mask coefficients for candidate row {}", candidate.row);
                return detection;
            }

            match reconstruct_mask(
                coefficients.row(candidate.row),
                prototypes.view(),
                width,
                height,
                params,
            ) {
                Ok(full) => detection.mask = crop_mask_to_box(&full, &detection.bbox),
                Err(e) => warn!("Mask reconstruction failed, continuing without: {}", e),
            }
            detection
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::errors::{DetectionResult, RecognitionResult, TranslationResult};
    use crate::core::types::{BoundingBox, Credentials, OcrProvider, Settings, TranslationProviderKind};
    use crate::services::detection::{HeadLayout, ModelSpec};
    use crate::services::ocr::{
        EngineFactory, RecognitionEngine, RecognizedBlock, RecognizedLine, RecognizedPage,
        RecognizedWord,
    };
    use crate::services::translation::{TranslationCache, TranslationCall, TranslationProvider};
    use crate::core::config::DetectorHead;
    use async_trait::async_trait;
    use image::{DynamicImage, GrayImage, Rgba, RgbaImage};
    use ndarray::{array, Array2, Array3, Array4};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeModel {
        spec: ModelSpec,
        output: HeadOutput,
        fail: bool,
    }

    #[async_trait]
    impl DetectionModel for FakeModel {
        fn spec(&self) -> &ModelSpec {
            &self.spec
        }

        async fn infer(&self, input: Array4<f32>) -> DetectionResult<HeadOutput> {
            assert_eq!(input.shape(), &[1, 3, 100, 100]);
            if self.fail {
                return Err(DetectionError::MalformedOutput {
                    name: "output0".to_string(),
                    reason: "broken".to_string(),
                });
            }
            Ok(self.output.clone())
        }
    }

    struct FakeLoader {
        loads: AtomicUsize,
        fail_first: bool,
        model: Arc<FakeModel>,
    }

    #[async_trait]
    impl ModelLoader for FakeLoader {
        async fn load(&self) -> DetectionResult<Arc<dyn DetectionModel>> {
            let n = self.loads.fetch_add(1, Ordering::SeqCst);
            if self.fail_first && n == 0 {
                return Err(DetectionError::ModelLoadFailed("missing file".to_string()));
            }
            Ok(self.model.clone())
        }
    }

    /// Reads back one line whose text is the region's height in upscaled pixels
    struct FakeEngine;

    #[async_trait]
    impl RecognitionEngine for FakeEngine {
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
            let bbox = BoundingBox::new(0.0, 0.0, image.width() as f32, image.height() as f32);
            Ok(RecognizedPage {
                blocks: vec![RecognizedBlock {
                    confidence: 90.0,
                    bbox,
                    lines: vec![RecognizedLine {
                        confidence: 90.0,
                        bbox,
                        words: vec![RecognizedWord {
                            text: format!("h{}", image.height()),
                            confidence: 90.0,
                            bbox,
                        }],
                    }],
                }],
            })
        }
    }

    struct FakeFactory;

    #[async_trait]
    impl EngineFactory for FakeFactory {
        async fn create(
            &self,
            _provider: OcrProvider,
            _language: &str,
        ) -> RecognitionResult<Arc<dyn RecognitionEngine>> {
            Ok(Arc::new(FakeEngine))
        }
    }

    struct UpperProvider;

    #[async_trait]
    impl TranslationProvider for UpperProvider {
        fn kind(&self) -> TranslationProviderKind {
            TranslationProviderKind::Google
        }

        async fn translate(&self, call: TranslationCall<'_>) -> TranslationResult<String> {
            Ok(call.text.to_uppercase())
        }
    }

    fn packed_model(output: HeadOutput, fail: bool) -> Arc<FakeModel> {
        Arc::new(FakeModel {
            spec: ModelSpec::for_head(DetectorHead::Yolo, 100, 4),
            output,
            fail,
        })
    }

    fn orchestrator(model: Arc<FakeModel>, fail_first_load: bool, mask: Option<MaskParams>) -> (PipelineOrchestrator, Arc<FakeLoader>) {
        let metrics = Metrics::new();
        let loader = Arc::new(FakeLoader {
            loads: AtomicUsize::new(0),
            fail_first: fail_first_load,
            model,
        });
        let recognition = Arc::new(RegionRecognitionStage::new(
            Arc::new(RecognitionEnginePool::new(Arc::new(FakeFactory))),
            ConcurrencyLimiter::new("recognition", 2),
            RecognitionParams {
                upscale_factor: 1,
                block_min_confidence: 40.0,
                line_min_confidence: 60.0,
                word_min_confidence: 20.0,
                blur_sigma: 1.0,
            },
            metrics.clone(),
        ));
        let translation = Arc::new(TranslationStage::new(
            vec![Arc::new(UpperProvider) as Arc<dyn TranslationProvider>],
            TranslationCache::new(16, None),
            ConcurrencyLimiter::new("translation", 2),
            metrics.clone(),
        ));
        let params = PipelineParams {
            confidence_threshold: 0.5,
            iou_threshold: 0.5,
            nms_scope: NmsScope::ClassAgnostic,
            class_labels: ["background", "bubble", "text_bubble", "text_free"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            mask,
        };
        (
            PipelineOrchestrator::new(loader.clone(), recognition, translation, params, metrics),
            loader,
        )
    }

    fn request() -> DetectionRequest {
        let img = DynamicImage::ImageRgba8(RgbaImage::from_pixel(100, 100, Rgba([255, 255, 255, 255])));
        DetectionRequest {
            image: crate::core::types::RawImage::from_dynamic(&img),
            request_id: RequestId::new("req-test"),
            settings: Arc::new(Settings {
                source_language: "ja".to_string(),
                target_language: "en".to_string(),
                credentials: Credentials {
                    api_key: Some("key".to_string()),
                    deepl_key: None,
                },
                ..Settings::default()
            }),
        }
    }

    // Two overlapping boxes (the weaker is suppressed) and one separate box
    fn three_rows() -> Array2<f32> {
        array![
            [10.0, 10.0, 40.0, 30.0, 0.95, 0.0],
            [11.0, 10.0, 41.0, 30.0, 0.80, 0.0],
            [60.0, 50.0, 90.0, 90.0, 0.70, 2.0],
        ]
    }

    #[tokio::test]
    async fn test_full_run_fills_every_detection_in_order() {
        let (orchestrator, _) = orchestrator(
            packed_model(HeadOutput::Packed { rows: three_rows() }, false),
            false,
            None,
        );
        let mut tracker = StateTracker::new(RequestId::new("req-test"));
        let detections = orchestrator.execute(&request(), &mut tracker).await.unwrap();

        assert_eq!(detections.len(), 2);
        assert_eq!(detections[0].class_label.as_deref(), Some("bubble"));
        assert_eq!(detections[0].recognized_text, "h20");
        assert_eq!(detections[0].translated_text, "H20");
        assert_eq!(detections[0].font_size, Some(20.0));
        assert_eq!(detections[1].class_label.as_deref(), Some("text_free"));
        assert_eq!(detections[1].recognized_text, "h40");
        assert!(detections.iter().all(|d| d.mask.is_none()));

        assert_eq!(
            tracker.history(),
            &[
                PipelineState::Idle,
                PipelineState::ModelLoading,
                PipelineState::Preprocessing,
                PipelineState::Inferring,
                PipelineState::Decoding,
                PipelineState::RecognizingPerDetection,
                PipelineState::TranslatingPerDetection,
                PipelineState::Complete,
            ]
        );
    }

    #[tokio::test]
    async fn test_masks_are_cropped_to_each_box() {
        let rows = three_rows();
        let output = HeadOutput::PackedWithMasks {
            coefficients: Array2::from_elem((rows.nrows(), 2), 4.0),
            prototypes: Array3::from_elem((2, 8, 8), 1.0),
            rows,
        };
        let (orchestrator, _) = orchestrator(packed_model(output, false), false, Some(MaskParams::default()));

        let mut tracker = StateTracker::new(RequestId::new("req-mask"));
        let detections = orchestrator.execute(&request(), &mut tracker).await.unwrap();

        assert!(tracker.history().contains(&PipelineState::MaskReconstructing));
        let mask = detections[0].mask.as_ref().unwrap();
        assert_eq!(mask.dimensions(), (30, 20));
        assert!(mask.pixels().all(|p| p[0] == 255));

        let results = PipelineOutcome::Complete { detections }
            .into_results_async(RequestId::new("req-mask"))
            .await;
        let wire = results.results.unwrap();
        assert!(wire[0]
            .mask
            .as_deref()
            .is_some_and(|url| url.starts_with("data:image/png;base64,")));
    }

    #[tokio::test]
    async fn test_inference_failure_is_fatal() {
        let (orchestrator, _) = orchestrator(
            packed_model(HeadOutput::Packed { rows: three_rows() }, true),
            false,
            None,
        );
        let mut tracker = StateTracker::new(RequestId::new("req-fail"));
        let result = orchestrator.execute(&request(), &mut tracker).await;

        assert!(matches!(result, Err(PipelineError::Inference(_))));
        assert_eq!(tracker.current(), PipelineState::Failed);
        assert_eq!(tracker.history()[tracker.history().len() - 2], PipelineState::Inferring);

        let outcome = orchestrator.run(&request()).await;
        let results = outcome.into_results(RequestId::new("req-fail"));
        assert!(results.is_error());
        assert!(results.results.is_none());
    }

    #[tokio::test]
    async fn test_mismatched_head_counts_as_inference_failure() {
        let model = Arc::new(FakeModel {
            spec: ModelSpec {
                layout: HeadLayout::ClassScores {
                    num_classes: 4,
                    activation: crate::services::detection::ScoreActivation::Softmax,
                },
                ..ModelSpec::for_head(DetectorHead::Yolo, 100, 4)
            },
            output: HeadOutput::Packed { rows: three_rows() },
            fail: false,
        });
        let (orchestrator, _) = orchestrator(model, false, None);
        let result = orchestrator.detect(&request()).await;
        assert!(matches!(result, Err(PipelineError::Inference(_))));
    }

    #[tokio::test]
    async fn test_model_load_failure_is_not_memoized() {
        let (orchestrator, loader) = orchestrator(
            packed_model(HeadOutput::Packed { rows: three_rows() }, false),
            true,
            None,
        );

        let mut tracker = StateTracker::new(RequestId::new("req-load"));
        let first = orchestrator.execute(&request(), &mut tracker).await;
        assert!(matches!(first, Err(PipelineError::ModelLoading(_))));
        assert_eq!(tracker.history(), &[PipelineState::Idle, PipelineState::ModelLoading, PipelineState::Failed]);
        assert!(!orchestrator.model_loaded());

        assert!(orchestrator.detect(&request()).await.is_ok());
        assert!(orchestrator.detect(&request()).await.is_ok());
        assert_eq!(loader.loads.load(Ordering::SeqCst), 2);
        assert!(orchestrator.model_loaded());
    }

    #[tokio::test]
    async fn test_no_detections_completes_with_empty_list() {
        let (orchestrator, _) = orchestrator(
            packed_model(HeadOutput::Packed { rows: Array2::zeros((0, 6)) }, false),
            false,
            None,
        );
        match orchestrator.run(&request()).await {
            PipelineOutcome::Complete { detections } => assert!(detections.is_empty()),
            PipelineOutcome::Failed { error } => panic!("unexpected failure: {}", error),
        }
    }

    #[test]
    fn test_failed_only_follows_loading_or_inference() {
        use PipelineState::*;
        for state in [Idle, Preprocessing, Decoding, MaskReconstructing, RecognizingPerDetection, TranslatingPerDetection, Complete] {
            assert!(!state.can_transition_to(Failed), "{:?}", state);
        }
        assert!(ModelLoading.can_transition_to(Failed));
        assert!(Inferring.can_transition_to(Failed));
        assert!(Complete.is_terminal() && Failed.is_terminal());
    }
}
