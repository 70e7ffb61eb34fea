//! Raster helpers
//!
//! Images travel through the pipeline as `DynamicImage` restricted to two layouts:
//! `ImageLuma8` (single channel) and `ImageRgb8` (three channels).

use image::{DynamicImage, GenericImageView, GrayImage, Luma, RgbImage};

use super::VisionError;

/// Decode an encoded image (PNG, JPEG, ...) into a three-channel raster
pub fn decode(bytes: &[u8]) -> Result<DynamicImage, VisionError> {
    if bytes.is_empty() {
        return Err(VisionError::EmptyImage);
    }

    let image = image::load_from_memory(bytes)?;
    let (width, height) = image.dimensions();
    if width == 0 || height == 0 {
        return Err(VisionError::InvalidDimensions { width, height });
    }

    Ok(DynamicImage::ImageRgb8(image.to_rgb8()))
}

/// Number of channels of the current layout
pub fn channel_count(image: &DynamicImage) -> u8 {
    image.color().channel_count()
}

/// Coerce any layout into `ImageLuma8` or `ImageRgb8`
pub fn normalize(image: DynamicImage) -> DynamicImage {
    match image {
        DynamicImage::ImageLuma8(_) | DynamicImage::ImageRgb8(_) => image,
        DynamicImage::ImageLumaA8(_)
        | DynamicImage::ImageLuma16(_)
        | DynamicImage::ImageLumaA16(_) => DynamicImage::ImageLuma8(image.to_luma8()),
        other => DynamicImage::ImageRgb8(other.to_rgb8()),
    }
}

/// BT.601 luminance of an RGB image
pub fn luminance(image: &RgbImage) -> GrayImage {
    let (width, height) = image.dimensions();
    let mut gray = GrayImage::new(width, height);
    for (out, pixel) in gray.pixels_mut().zip(image.pixels()) {
        let [r, g, b] = pixel.0;
        let y = 0.299 * r as f32 + 0.587 * g as f32 + 0.114 * b as f32;
        *out = Luma([y.round().clamp(0.0, 255.0) as u8]);
    }
    gray
}

/// Single-channel view of any image
pub fn to_gray(image: &DynamicImage) -> GrayImage {
    match image {
        DynamicImage::ImageLuma8(gray) => gray.clone(),
        DynamicImage::ImageRgb8(rgb) => luminance(rgb),
        other => luminance(&other.to_rgb8()),
    }
}

/// Three-channel image, replicating gray into every channel
pub fn into_rgb(image: DynamicImage) -> RgbImage {
    match image {
        DynamicImage::ImageRgb8(rgb) => rgb,
        other => other.to_rgb8(),
    }
}
