// Geometric decoding of raw detector heads
//
// Turns per-candidate score/box arrays into source-space detections. Two
// head shapes are understood:
// - class scores: `[n, num_classes]` logits plus `[n, 4]` boxes (DETR family)
// - packed rows: `[n, 6]` of `[b0, b1, b2, b3, score, class]` (YOLO family)
//
// Everything here is pure and synchronous.

use ndarray::{Array2, ArrayView1};
use tracing::{debug, trace};

use crate::core::errors::{DetectionError, DetectionResult};
use crate::core::types::{BoundingBox, Detection};

/// How raw class scores are turned into probabilities
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScoreActivation {
    Identity,
    Softmax,
    Sigmoid,
}

/// Shape of the detector head
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeadLayout {
    ClassScores {
        num_classes: usize,
        activation: ScoreActivation,
    },
    /// Packed rows with a single confidence and a zero-based foreground class id
    Objectness,
}

/// Box tuple encoding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoxFormat {
    /// `(cx, cy, w, h)`
    CenterSize,
    /// `(x1, y1, x2, y2)`
    Corners,
}

/// Coordinate space of the box tuple
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BoxScale {
    /// Fractions of the image size
    Normalized,
    /// Pixels of the model input, rescaled per axis to the source image
    InputPixels { input_width: u32, input_height: u32 },
}

#[derive(Debug, Clone)]
pub struct DecodeConfig {
    pub layout: HeadLayout,
    pub box_format: BoxFormat,
    pub box_scale: BoxScale,
    pub confidence_threshold: f32,
    /// Indexed by class id; index 0 is the background sentinel
    pub class_labels: Vec<String>,
}

/// Raw tensors produced by one inference call
#[derive(Debug, Clone)]
pub enum HeadOutput {
    ClassScores {
        logits: Array2<f32>,
        boxes: Array2<f32>,
    },
    Packed {
        rows: Array2<f32>,
    },
    /// Packed rows plus per-row mask coefficients and the shared prototype planes
    PackedWithMasks {
        rows: Array2<f32>,
        coefficients: Array2<f32>,
        prototypes: ndarray::Array3<f32>,
    },
}

impl HeadOutput {
    pub fn num_candidates(&self) -> usize {
        match self {
            HeadOutput::ClassScores { logits, .. } => logits.nrows(),
            HeadOutput::Packed { rows } | HeadOutput::PackedWithMasks { rows, .. } => rows.nrows(),
        }
    }
}

/// A surviving candidate plus the row it came from (for mask coefficients)
#[derive(Debug, Clone)]
pub struct DecodedCandidate {
    pub detection: Detection,
    pub row: usize,
}

fn activate(scores: ArrayView1<f32>, activation: ScoreActivation) -> Vec<f32> {
    match activation {
        ScoreActivation::Identity => scores.to_vec(),
        ScoreActivation::Sigmoid => scores.iter().map(|&s| sigmoid(s)).collect(),
        ScoreActivation::Softmax => {
            let max = scores.iter().copied().fold(f32::NEG_INFINITY, f32::max);
            let exps: Vec<f32> = scores.iter().map(|&s| (s - max).exp()).collect();
            let sum: f32 = exps.iter().sum();
            if sum > 0.0 {
                exps.into_iter().map(|e| e / sum).collect()
            } else {
                exps
            }
        }
    }
}

pub fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// First index of the maximum; NaN scores never win
fn argmax(scores: &[f32]) -> Option<(usize, f32)> {
    scores
        .iter()
        .copied()
        .enumerate()
        .filter(|(_, s)| !s.is_nan())
        .fold(None, |best, (i, s)| match best {
            Some((_, b)) if b >= s => best,
            _ => Some((i, s)),
        })
}

fn to_source_box(
    raw: [f32; 4],
    format: BoxFormat,
    scale: BoxScale,
    image_width: u32,
    image_height: u32,
) -> BoundingBox {
    let (sx, sy) = match scale {
        BoxScale::Normalized => (image_width as f32, image_height as f32),
        BoxScale::InputPixels {
            input_width,
            input_height,
        } => (
            image_width as f32 / input_width.max(1) as f32,
            image_height as f32 / input_height.max(1) as f32,
        ),
    };

    let [a, b, c, d] = raw;
    let bbox = match format {
        BoxFormat::CenterSize => BoundingBox::from_center(a, b, c, d),
        BoxFormat::Corners => BoundingBox::new(a, b, c, d),
    };

    BoundingBox::new(bbox.x1 * sx, bbox.y1 * sy, bbox.x2 * sx, bbox.y2 * sy)
}

fn row_box(row: ArrayView1<f32>) -> [f32; 4] {
    [row[0], row[1], row[2], row[3]]
}

fn expect_columns(name: &str, array: &Array2<f32>, columns: usize) -> DetectionResult<()> {
    if array.ncols() < columns {
        return Err(DetectionError::MalformedOutput {
            name: name.to_string(),
            reason: format!("expected at least {} columns, got {}", columns, array.ncols()),
        });
    }
    Ok(())
}

/// Decode a head into source-space candidates, before NMS.
///
/// Candidates whose best class is the background (index 0), whose score is
/// below the threshold, or whose box has no area inside the image are dropped.
/// Output order follows the model's candidate order.
pub fn decode(
    output: &HeadOutput,
    config: &DecodeConfig,
    image_width: u32,
    image_height: u32,
) -> DetectionResult<Vec<DecodedCandidate>> {
    if image_width == 0 || image_height == 0 {
        return Err(DetectionError::InvalidImageSize {
            width: image_width,
            height: image_height,
        });
    }

    // (row, class index, score, raw box)
    let mut raw: Vec<(usize, usize, f32, [f32; 4])> = Vec::new();

    match (output, config.layout) {
        (HeadOutput::ClassScores { logits, boxes }, HeadLayout::ClassScores { num_classes, activation }) => {
            if logits.nrows() != boxes.nrows() {
                return Err(DetectionError::MalformedOutput {
                    name: "boxes".to_string(),
                    reason: format!(
                        "{} score rows but {} box rows",
                        logits.nrows(),
                        boxes.nrows()
                    ),
                });
            }
            expect_columns("logits", logits, num_classes)?;
            expect_columns("boxes", boxes, 4)?;

            for (row, (scores, bbox)) in logits.outer_iter().zip(boxes.outer_iter()).enumerate() {
                // Normalize over the whole row (trailing no-object column included),
                // then pick among the labelled classes
                let probabilities = activate(scores, activation);
                if let Some((class_index, score)) = argmax(&probabilities[..num_classes]) {
                    raw.push((row, class_index, score, row_box(bbox)));
                }
            }
        }
        (
            HeadOutput::Packed { rows } | HeadOutput::PackedWithMasks { rows, .. },
            HeadLayout::Objectness,
        ) => {
            expect_columns("output", rows, 6)?;
            for (row, values) in rows.outer_iter().enumerate() {
                let score = values[4];
                let class_id = values[5];
                if score.is_nan() || class_id.is_nan() || class_id < 0.0 {
                    continue;
                }
                // Shift foreground ids so that 0 stays the background sentinel
                let class_index = class_id.round() as usize + 1;
                raw.push((row, class_index, score, row_box(values)));
            }
        }
        _ => {
            return Err(DetectionError::MalformedOutput {
                name: "head".to_string(),
                reason: format!("output does not match head layout {:?}", config.layout),
            });
        }
    }

    let total = raw.len();
    let candidates: Vec<DecodedCandidate> = raw
        .into_iter()
        .filter(|(_, class_index, score, _)| {
            *class_index != 0 && *score >= config.confidence_threshold
        })
        .filter_map(|(row, class_index, score, raw_box)| {
            let bbox = to_source_box(
                raw_box,
                config.box_format,
                config.box_scale,
                image_width,
                image_height,
            )
            .clamp_to(image_width, image_height);

            if bbox.is_degenerate() {
                trace!("Dropping degenerate box from row {}", row);
                return None;
            }

            let mut detection = Detection::new(bbox, score.min(1.0), class_index);
            detection.class_label = config.class_labels.get(class_index).cloned();
            Some(DecodedCandidate { detection, row })
        })
        .collect();

    debug!(
        "Decoded {}/{} candidates above confidence {:.2}",
        candidates.len(),
        total,
        config.confidence_threshold
    );

    Ok(candidates)
}
