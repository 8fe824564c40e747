pub mod image_ops;
pub mod metrics;

// Re-export commonly used items
pub use image_ops::{
    binarize_otsu, blur_edges_with_gradient, crop_to_box, encode_png, encode_png_data_url,
    soft_blur, to_grey, upscale,
};
pub use metrics::{Metrics, MetricsSnapshot};
