// Mask reconstruction from prototype planes
//
// A segmentation head emits one coefficient vector per detection plus a
// shared stack of prototype planes `[C, H, W]`. The mask for a detection is
// sigmoid(coeffs · protos), thresholded, then upscaled to the source image.

use image::{GrayImage, Luma};
use ndarray::{ArrayView1, ArrayView3};
use tracing::{debug, instrument};

use crate::core::errors::{MaskError, MaskResult};
use crate::core::types::BoundingBox;
use crate::services::detection::decoder::sigmoid;

/// Polarity of the produced mask
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MaskPolarity {
    /// Foreground is white (255)
    #[default]
    Normal,
    /// Foreground is black (0)
    Inverted,
}

#[derive(Debug, Clone, Copy)]
pub struct MaskParams {
    /// Sigmoid cutoff; pixels strictly above it are foreground
    pub threshold: f32,
    pub polarity: MaskPolarity,
}

impl Default for MaskParams {
    fn default() -> Self {
        Self {
            threshold: 0.5,
            polarity: MaskPolarity::Normal,
        }
    }
}

/// Build a full-resolution binary mask for one detection.
#[instrument(skip(coefficients, prototypes), fields(channels = coefficients.len()))]
pub fn reconstruct_mask(
    coefficients: ArrayView1<f32>,
    prototypes: ArrayView3<f32>,
    out_width: u32,
    out_height: u32,
    params: MaskParams,
) -> MaskResult<GrayImage> {
    if !(params.threshold > 0.0 && params.threshold < 1.0) {
        return Err(MaskError::InvalidThreshold(params.threshold));
    }

    let (channels, proto_h, proto_w) = prototypes.dim();
    if coefficients.len() != channels {
        return Err(MaskError::ChannelMismatch {
            coeffs: coefficients.len(),
            channels,
        });
    }
    if proto_h == 0 || proto_w == 0 {
        return Err(MaskError::EmptyPrototypes {
            height: proto_h,
            width: proto_w,
        });
    }

    // [C, H, W] → [C, H*W] so the whole plane is one 1×C · C×(H·W) product
    let proto_flat = prototypes
        .as_standard_layout()
        .into_owned()
        .into_shape_with_order((channels, proto_h * proto_w))?;
    let logits = coefficients.dot(&proto_flat);

    let (fg, bg) = match params.polarity {
        MaskPolarity::Normal => (255u8, 0u8),
        MaskPolarity::Inverted => (0u8, 255u8),
    };

    let low_res: Vec<u8> = logits
        .iter()
        .map(|&v| if sigmoid(v) > params.threshold { fg } else { bg })
        .collect();

    let low_res = GrayImage::from_raw(proto_w as u32, proto_h as u32, low_res).ok_or(
        MaskError::EmptyPrototypes {
            height: proto_h,
            width: proto_w,
        },
    )?;

    if out_width == proto_w as u32 && out_height == proto_h as u32 {
        return Ok(low_res);
    }

    // Smooth upscale, then snap back to two levels at mid grey
    let mut mask = image::imageops::resize(
        &low_res,
        out_width.max(1),
        out_height.max(1),
        image::imageops::FilterType::Triangle,
    );
    for Luma([v]) in mask.pixels_mut() {
        *v = if *v >= 128 { 255 } else { 0 };
    }

    debug!(
        "Mask {}x{} → {}x{}: {} foreground pixels",
        proto_w,
        proto_h,
        out_width,
        out_height,
        mask.pixels().filter(|p| p[0] == fg).count()
    );

    Ok(mask)
}

/// Cut a full-resolution mask down to a detection's box
pub fn crop_mask_to_box(mask: &GrayImage, bbox: &BoundingBox) -> Option<GrayImage> {
    let (x, y, w, h) = bbox.pixel_rect(mask.width(), mask.height())?;
    Some(image::imageops::crop_imm(mask, x, y, w, h).to_image())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array1, Array3};

    #[test]
    fn test_zero_coefficients_give_empty_mask() {
        let coeffs = Array1::<f32>::zeros(4);
        let protos = Array3::<f32>::from_elem((4, 8, 8), 3.0);

        let mask = reconstruct_mask(coeffs.view(), protos.view(), 32, 16, MaskParams::default())
            .unwrap();

        assert_eq!(mask.dimensions(), (32, 16));
        assert!(mask.pixels().all(|p| p[0] == 0));
    }

    #[test]
    fn test_left_half_foreground_upscales() {
        let coeffs = Array1::from(vec![1.0f32]);
        let protos = Array3::from_shape_fn((1, 4, 4), |(_, _, x)| if x < 2 { 10.0 } else { -10.0 });

        let mask = reconstruct_mask(coeffs.view(), protos.view(), 40, 40, MaskParams::default())
            .unwrap();

        assert_eq!(mask.get_pixel(2, 20)[0], 255);
        assert_eq!(mask.get_pixel(37, 20)[0], 0);
        assert!(mask.pixels().all(|p| p[0] == 0 || p[0] == 255));
    }

    #[test]
    fn test_inverted_polarity() {
        let coeffs = Array1::from(vec![1.0f32]);
        let protos = Array3::from_elem((1, 2, 2), 10.0f32);
        let params = MaskParams {
            threshold: 0.9,
            polarity: MaskPolarity::Inverted,
        };

        let mask = reconstruct_mask(coeffs.view(), protos.view(), 2, 2, params).unwrap();
        assert!(mask.pixels().all(|p| p[0] == 0));
    }

    #[test]
    fn test_rejects_mismatched_channels() {
        let coeffs = Array1::<f32>::zeros(3);
        let protos = Array3::<f32>::zeros((4, 2, 2));
        let result = reconstruct_mask(coeffs.view(), protos.view(), 2, 2, MaskParams::default());
        assert!(matches!(
            result,
            Err(MaskError::ChannelMismatch { coeffs: 3, channels: 4 })
        ));
    }

    #[test]
    fn test_crop_mask_to_box() {
        let mask = GrayImage::from_pixel(50, 50, Luma([255]));
        let cropped = crop_mask_to_box(&mask, &BoundingBox::new(10.0, 20.0, 30.0, 25.0)).unwrap();
        assert_eq!(cropped.dimensions(), (20, 5));
    }
}
