use std::cmp::Ordering;
use tracing::{debug, trace};

use crate::core::types::Detection;

/// Which candidates may suppress each other
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NmsScope {
    /// Overlapping boxes suppress each other regardless of class
    #[default]
    ClassAgnostic,
    /// Only boxes of the same class suppress each other
    PerClass,
}

/// Anything NMS can rank and compare
pub trait Suppressible {
    fn detection(&self) -> &Detection;
}

impl Suppressible for Detection {
    fn detection(&self) -> &Detection {
        self
    }
}

impl Suppressible for super::decoder::DecodedCandidate {
    fn detection(&self) -> &Detection {
        &self.detection
    }
}

/// Greedy non-maximum suppression.
///
/// Candidates are ranked by descending confidence (a stable sort, so ties
/// keep their input order). The best remaining candidate is kept and every
/// remaining candidate with `IoU >= iou_threshold` against it is dropped.
/// A threshold of 1.0 or more disables suppression.
pub fn non_max_suppression<T: Suppressible>(
    candidates: Vec<T>,
    iou_threshold: f32,
    scope: NmsScope,
) -> Vec<T> {
    if candidates.is_empty() {
        debug!("NMS: no candidates");
        return candidates;
    }

    let mut sorted = candidates;
    sorted.sort_by(|a, b| {
        b.detection()
            .confidence
            .partial_cmp(&a.detection().confidence)
            .unwrap_or(Ordering::Equal)
    });

    if iou_threshold >= 1.0 {
        return sorted;
    }

    let total = sorted.len();
    let mut suppressed = vec![false; total];

    for i in 0..total {
        if suppressed[i] {
            continue;
        }
        let best = sorted[i].detection();

        for j in (i + 1)..total {
            if suppressed[j] {
                continue;
            }
            let other = sorted[j].detection();
            if scope == NmsScope::PerClass && best.class_index != other.class_index {
                continue;
            }
            let iou = best.bbox.iou(&other.bbox);
            if iou >= iou_threshold {
                suppressed[j] = true;
                trace!("NMS: suppressed candidate {} (IoU={:.3} with {})", j, iou, i);
            }
        }
    }

    let keep: Vec<T> = sorted
        .into_iter()
        .zip(suppressed)
        .filter_map(|(candidate, dropped)| (!dropped).then_some(candidate))
        .collect();

    debug!("NMS: kept {}/{} candidates", keep.len(), total);
    keep
}
