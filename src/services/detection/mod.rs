// Detection: model seam, head decoding and non-maximum suppression

pub mod decoder;
pub mod model;
pub mod nms;

pub use decoder::{
    decode, BoxFormat, BoxScale, DecodeConfig, DecodedCandidate, HeadLayout, HeadOutput,
    ScoreActivation,
};
pub use model::{preprocess, DetectionModel, ModelLoader, ModelSpec, OnnxDetectionModel, OnnxModelLoader};
pub use nms::{non_max_suppression, NmsScope};
