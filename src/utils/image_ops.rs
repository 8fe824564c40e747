use base64::{engine::general_purpose, Engine};
use image::imageops::FilterType;
use image::{DynamicImage, GrayImage, ImageFormat, Luma};
use imageproc::contrast::{otsu_level, threshold, ThresholdType};
use std::f32::consts::FRAC_PI_2;
use std::io::Cursor;

use crate::core::types::BoundingBox;

/// Crop `img` to `bbox`, clamped to the image bounds.
///
/// Returns `None` when nothing of the box lies inside the image.
pub fn crop_to_box(img: &DynamicImage, bbox: &BoundingBox) -> Option<DynamicImage> {
    let (x, y, w, h) = bbox.pixel_rect(img.width(), img.height())?;
    Some(img.crop_imm(x, y, w, h))
}

/// Enlarge by an integer factor with a smooth filter; small glyphs recognize poorly
pub fn upscale(img: &DynamicImage, factor: u32) -> DynamicImage {
    if factor <= 1 {
        return img.clone();
    }
    img.resize_exact(
        img.width().saturating_mul(factor),
        img.height().saturating_mul(factor),
        FilterType::CatmullRom,
    )
}

pub fn to_grey(img: &DynamicImage) -> GrayImage {
    img.to_luma8()
}

/// Binarize at the Otsu level: pixels above it become white, the rest black
pub fn binarize_otsu(img: &GrayImage) -> GrayImage {
    let level = otsu_level(img);
    threshold(img, level, ThresholdType::Binary)
}

pub fn soft_blur(img: &GrayImage, sigma: f32) -> GrayImage {
    if sigma <= 0.0 {
        return img.clone();
    }
    image::imageops::blur(img, sigma)
}

/// Blend a blurred copy into the borders of the image.
///
/// The weight of the sharp original falls off as cos² of the normalized
/// elliptical distance from the center, so the middle stays crisp while
/// stray strokes near the crop edges are smoothed away.
pub fn blur_edges_with_gradient(img: &GrayImage, sigma: f32) -> GrayImage {
    let (width, height) = img.dimensions();
    if width == 0 || height == 0 {
        return img.clone();
    }

    let blurred = soft_blur(img, sigma);
    let cx = (width / 2) as f32;
    let cy = (height / 2) as f32;
    let rx = width as f32;
    let ry = height as f32;

    GrayImage::from_fn(width, height, |x, y| {
        let dx = (x as f32 - cx) / rx;
        let dy = (y as f32 - cy) / ry;
        let distance = (dx * dx + dy * dy).sqrt();
        let weight = if distance <= 1.0 {
            (distance * FRAC_PI_2).cos().powi(2)
        } else {
            0.0
        };

        let sharp = img.get_pixel(x, y)[0] as f32;
        let soft = blurred.get_pixel(x, y)[0] as f32;
        Luma([(sharp * weight + soft * (1.0 - weight)).round().clamp(0.0, 255.0) as u8])
    })
}

pub fn encode_png(img: &DynamicImage) -> Result<Vec<u8>, image::ImageError> {
    let mut png_bytes = Vec::new();
    img.write_to(&mut Cursor::new(&mut png_bytes), ImageFormat::Png)?;
    Ok(png_bytes)
}

pub fn encode_png_data_url(img: &DynamicImage) -> Result<String, image::ImageError> {
    let png_bytes = encode_png(img)?;
    Ok(format!(
        "data:image/png;base64,{}",
        general_purpose::STANDARD.encode(png_bytes)
    ))
}
