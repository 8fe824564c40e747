use anyhow::Result;
use async_trait::async_trait;
use image::DynamicImage;
use ndarray::{s, Array2, Array3, Array4};
use ort::execution_providers::CPUExecutionProvider;

#[cfg(feature = "cuda")]
use ort::execution_providers::CUDAExecutionProvider;

#[cfg(feature = "tensorrt")]
use ort::execution_providers::TensorRTExecutionProvider;

#[cfg(feature = "openvino")]
use ort::execution_providers::OpenVINOExecutionProvider;

use ort::session::{builder::GraphOptimizationLevel, Session};
use ort::value::Value;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info, trace};

use super::decoder::{BoxFormat, BoxScale, HeadLayout, HeadOutput, ScoreActivation};
use crate::core::config::{DetectionConfig, DetectorHead};
use crate::core::errors::{DetectionError, DetectionResult};

/// Static description of a detector: input geometry and how its head is read
#[derive(Debug, Clone)]
pub struct ModelSpec {
    pub input_width: u32,
    pub input_height: u32,
    pub layout: HeadLayout,
    pub box_format: BoxFormat,
    pub box_scale: BoxScale,
}

impl ModelSpec {
    pub fn for_head(head: DetectorHead, target_size: u32, num_classes: usize) -> Self {
        match head {
            DetectorHead::Yolo => Self {
                input_width: target_size,
                input_height: target_size,
                layout: HeadLayout::Objectness,
                box_format: BoxFormat::Corners,
                box_scale: BoxScale::InputPixels {
                    input_width: target_size,
                    input_height: target_size,
                },
            },
            DetectorHead::Detr => Self {
                input_width: target_size,
                input_height: target_size,
                layout: HeadLayout::ClassScores {
                    num_classes,
                    activation: ScoreActivation::Softmax,
                },
                box_format: BoxFormat::CenterSize,
                box_scale: BoxScale::Normalized,
            },
        }
    }
}

/// "Run inference on a tensor, get tensors back"
#[async_trait]
pub trait DetectionModel: Send + Sync {
    fn spec(&self) -> &ModelSpec;

    async fn infer(&self, input: Array4<f32>) -> DetectionResult<HeadOutput>;
}

/// Builds the model on first use; the orchestrator memoizes the result
#[async_trait]
pub trait ModelLoader: Send + Sync {
    async fn load(&self) -> DetectionResult<Arc<dyn DetectionModel>>;
}

/// Resize to the model input and lay out as normalized NCHW RGB
pub fn preprocess(img: &DynamicImage, spec: &ModelSpec) -> Array4<f32> {
    trace!(
        "Preprocessing image: {}x{} → {}x{}",
        img.width(),
        img.height(),
        spec.input_width,
        spec.input_height
    );

    let resized = img.resize_exact(
        spec.input_width,
        spec.input_height,
        image::imageops::FilterType::Triangle,
    );
    let rgb = resized.to_rgb8();

    let (w, h) = (spec.input_width as usize, spec.input_height as usize);
    let mut array = Array4::<f32>::zeros((1, 3, h, w));

    for (x, y, pixel) in rgb.enumerate_pixels() {
        let (x, y) = (x as usize, y as usize);
        array[[0, 0, y, x]] = pixel[0] as f32 / 255.0;
        array[[0, 1, y, x]] = pixel[1] as f32 / 255.0;
        array[[0, 2, y, x]] = pixel[2] as f32 / 255.0;
    }

    array
}

/// Collapse a `[1, n, c]` or `[n, c]` tensor into rows
fn tensor_rows(name: &str, shape: &[i64], data: &[f32]) -> DetectionResult<Array2<f32>> {
    let dims: Vec<usize> = shape.iter().map(|&d| d.max(0) as usize).collect();
    let (rows, cols) = match dims.as_slice() {
        [1, n, c] | [n, c] => (*n, *c),
        other => {
            return Err(DetectionError::MalformedOutput {
                name: name.to_string(),
                reason: format!("expected [1, n, c] or [n, c], got {:?}", other),
            })
        }
    };
    Ok(Array2::from_shape_vec((rows, cols), data.to_vec())?)
}

/// Collapse a `[1, c, h, w]` prototype tensor
fn tensor_planes(name: &str, shape: &[i64], data: &[f32]) -> DetectionResult<Array3<f32>> {
    let dims: Vec<usize> = shape.iter().map(|&d| d.max(0) as usize).collect();
    let (c, h, w) = match dims.as_slice() {
        [1, c, h, w] | [c, h, w] => (*c, *h, *w),
        other => {
            return Err(DetectionError::MalformedOutput {
                name: name.to_string(),
                reason: format!("expected [1, c, h, w], got {:?}", other),
            })
        }
    };
    Ok(Array3::from_shape_vec((c, h, w), data.to_vec())?)
}

/// ONNX Runtime detector
pub struct OnnxDetectionModel {
    session: Arc<Mutex<Session>>,
    spec: ModelSpec,
    with_masks: bool,
    device_type: String,
}

impl OnnxDetectionModel {
    pub fn load(config: &DetectionConfig, with_masks: bool) -> Result<Self> {
        info!("Loading detector from {}...", config.detector_model_path);

        let (device_type, session) = Self::initialize_with_acceleration(config)?;
        let spec = ModelSpec::for_head(config.head, config.target_size, config.class_labels.len());

        info!("✓ Detection: {} ({:?} head)", device_type, config.head);

        Ok(Self {
            session: Arc::new(Mutex::new(session)),
            spec,
            with_masks,
            device_type,
        })
    }

    fn build_session(path: &str, backend: &str) -> Result<Session> {
        let builder = Session::builder()?;
        let builder = match backend {
            #[cfg(feature = "tensorrt")]
            "TENSORRT" => {
                builder.with_execution_providers([TensorRTExecutionProvider::default().build()])?
            }
            #[cfg(feature = "cuda")]
            "CUDA" => builder.with_execution_providers([CUDAExecutionProvider::default().build()])?,
            #[cfg(feature = "openvino")]
            "OPENVINO" => builder.with_execution_providers([OpenVINOExecutionProvider::default()
                .with_device_type("CPU")
                .build()])?,
            "CPU" => builder.with_execution_providers([CPUExecutionProvider::default().build()])?,
            other => anyhow::bail!(
                "Inference backend '{}' is not available in this build. \
                Valid options: TENSORRT, CUDA, OPENVINO (with the matching feature), CPU, AUTO",
                other
            ),
        };

        Ok(builder
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(num_cpus::get())?
            .commit_from_file(path)?)
    }

    fn initialize_with_acceleration(config: &DetectionConfig) -> Result<(String, Session)> {
        let path = config.detector_model_path.as_str();

        if let Some(backend) = config.inference_backend.as_deref() {
            if backend != "AUTO" {
                info!("INFERENCE_BACKEND={}, forcing specific backend", backend);
                let session = Self::build_session(path, backend)?;
                return Ok((format!("{} (forced)", backend), session));
            }
        }

        // Accelerators in order of preference; only compiled-in providers are tried
        let preferred: &[&str] = &[
            #[cfg(feature = "tensorrt")]
            "TENSORRT",
            #[cfg(feature = "cuda")]
            "CUDA",
            #[cfg(feature = "openvino")]
            "OPENVINO",
        ];

        for backend in preferred {
            match Self::build_session(path, backend) {
                Ok(session) => {
                    info!("✓ Using {} acceleration", backend);
                    return Ok((backend.to_string(), session));
                }
                Err(e) => debug!("{} unavailable: {}", backend, e),
            }
        }

        let session = Self::build_session(path, "CPU")?;
        info!("✓ Using CPU (no hardware acceleration)");
        Ok(("CPU".to_string(), session))
    }

    pub fn device_type(&self) -> &str {
        &self.device_type
    }

    fn run_blocking(
        session: &mut Session,
        input: Array4<f32>,
        layout: HeadLayout,
        with_masks: bool,
    ) -> DetectionResult<HeadOutput> {
        let images = Value::from_array(input)?;
        let outputs = session.run(ort::inputs!["images" => images])?;

        match layout {
            HeadLayout::Objectness => {
                let value = outputs
                    .get("output0")
                    .ok_or_else(|| DetectionError::MalformedOutput {
                        name: "output0".to_string(),
                        reason: "missing".to_string(),
                    })?;
                let (shape, data) = value.try_extract_tensor::<f32>()?;
                let packed = tensor_rows("output0", shape, data)?;

                let prototypes = match outputs.get("output1") {
                    Some(protos) if with_masks => {
                        let (shape, data) = protos.try_extract_tensor::<f32>()?;
                        Some(tensor_planes("output1", shape, data)?)
                    }
                    _ => None,
                };

                match prototypes {
                    Some(prototypes) if packed.ncols() > 6 => Ok(HeadOutput::PackedWithMasks {
                        rows: packed.slice(s![.., ..6]).to_owned(),
                        coefficients: packed.slice(s![.., 6..]).to_owned(),
                        prototypes,
                    }),
                    _ => Ok(HeadOutput::Packed { rows: packed }),
                }
            }
            HeadLayout::ClassScores { .. } => {
                let mut tensors = Vec::with_capacity(2);
                for name in ["logits", "pred_boxes"] {
                    let value = outputs
                        .get(name)
                        .ok_or_else(|| DetectionError::MalformedOutput {
                            name: name.to_string(),
                            reason: "missing".to_string(),
                        })?;
                    let (shape, data) = value.try_extract_tensor::<f32>()?;
                    tensors.push(tensor_rows(name, shape, data)?);
                }
                let boxes = tensors.pop().unwrap_or_default();
                let logits = tensors.pop().unwrap_or_default();
                Ok(HeadOutput::ClassScores { logits, boxes })
            }
        }
    }
}

#[async_trait]
impl DetectionModel for OnnxDetectionModel {
    fn spec(&self) -> &ModelSpec {
        &self.spec
    }

    async fn infer(&self, input: Array4<f32>) -> DetectionResult<HeadOutput> {
        let session = Arc::clone(&self.session);
        let layout = self.spec.layout;
        let with_masks = self.with_masks;
        let inference_start = std::time::Instant::now();

        let output = tokio::task::spawn_blocking(move || {
            let mut session = session.lock();
            Self::run_blocking(&mut session, input, layout, with_masks)
        })
        .await
        .map_err(|e| DetectionError::TaskJoinFailed(e.to_string()))??;

        debug!(
            "✓ Inference on {} completed in {:.2}ms ({} candidates)",
            self.device_type,
            inference_start.elapsed().as_secs_f64() * 1000.0,
            output.num_candidates()
        );
        Ok(output)
    }
}

/// Loads `OnnxDetectionModel` from the configured path
pub struct OnnxModelLoader {
    config: DetectionConfig,
    with_masks: bool,
}

impl OnnxModelLoader {
    pub fn new(config: DetectionConfig, with_masks: bool) -> Self {
        Self { config, with_masks }
    }
}

#[async_trait]
impl ModelLoader for OnnxModelLoader {
    async fn load(&self) -> DetectionResult<Arc<dyn DetectionModel>> {
        let config = self.config.clone();
        let with_masks = self.with_masks;

        let model = tokio::task::spawn_blocking(move || OnnxDetectionModel::load(&config, with_masks))
            .await
            .map_err(|e| DetectionError::TaskJoinFailed(e.to_string()))?
            .map_err(|e| DetectionError::ModelLoadFailed(format!("{:#}", e)))?;

        Ok(Arc::new(model))
    }
}
