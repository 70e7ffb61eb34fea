//! Image preprocessing before recognition
//!
//! The stage order is fixed: grayscale, denoise, adaptive threshold, deskew. Each stage
//! can be toggled independently. The result is always a three-channel image because the
//! recognizer only accepts colour input.

use image::{DynamicImage, GrayImage, Luma, RgbImage};
use imageproc::filter::box_filter;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::denoise::denoise;
use super::deskew::deskew;
use super::raster::{channel_count, into_rgb, normalize, to_gray};

/// Neighbourhood size of the adaptive threshold
pub const ADAPTIVE_BLOCK_SIZE: u32 = 11;

/// Subtracted from the local mean before comparing
pub const ADAPTIVE_OFFSET: i16 = 2;

/// Preprocessing toggles, each defaulted independently
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PreprocessConfig {
    /// Convert to single-channel luminance
    pub grayscale: bool,
    /// Non-local-means denoising
    pub denoise: bool,
    /// Local mean binarization (single-channel images only)
    pub adaptive_threshold: bool,
    /// Rotation correction
    pub deskew: bool,
}

impl Default for PreprocessConfig {
    fn default() -> Self {
        Self {
            grayscale: true,
            denoise: true,
            adaptive_threshold: true,
            deskew: false,
        }
    }
}

/// Run the preprocessing stages selected by `config`
pub fn preprocess(image: DynamicImage, config: &PreprocessConfig) -> RgbImage {
    debug!(
        "preprocess: grayscale={}, denoise={}, adaptive_threshold={}, deskew={}",
        config.grayscale, config.denoise, config.adaptive_threshold, config.deskew
    );

    let mut current = normalize(image);

    if config.grayscale && channel_count(&current) > 1 {
        current = DynamicImage::ImageLuma8(to_gray(&current));
    }

    if config.denoise {
        current = denoise(current);
    }

    if config.adaptive_threshold {
        if let DynamicImage::ImageLuma8(gray) = &current {
            current = DynamicImage::ImageLuma8(adaptive_threshold_mean(
                gray,
                ADAPTIVE_BLOCK_SIZE,
                ADAPTIVE_OFFSET,
            ));
        }
    }

    if config.deskew {
        current = deskew(current);
    }

    into_rgb(current)
}

/// Binarize against the mean of each pixel's `block_size` neighbourhood minus `offset`.
///
/// Borders replicate the edge pixels.
pub fn adaptive_threshold_mean(gray: &GrayImage, block_size: u32, offset: i16) -> GrayImage {
    let radius = block_size / 2;
    let mean = box_filter(gray, radius, radius);

    let (width, height) = gray.dimensions();
    let mut out = GrayImage::new(width, height);
    for ((dst, src), m) in out.pixels_mut().zip(gray.pixels()).zip(mean.pixels()) {
        let above = src[0] as i16 > m[0] as i16 - offset;
        *dst = Luma([if above { 255 } else { 0 }]);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GenericImageView, Rgb};

    fn all_off() -> PreprocessConfig {
        PreprocessConfig {
            grayscale: false,
            denoise: false,
            adaptive_threshold: false,
            deskew: false,
        }
    }

    #[test]
    fn test_defaults() {
        let config = PreprocessConfig::default();
        assert!(config.grayscale);
        assert!(config.denoise);
        assert!(config.adaptive_threshold);
        assert!(!config.deskew);
    }

    #[test]
    fn test_always_three_channels() {
        let gray = DynamicImage::ImageLuma8(GrayImage::from_pixel(12, 8, Luma([77])));
        let colour = DynamicImage::ImageRgb8(RgbImage::from_pixel(12, 8, Rgb([10, 200, 30])));

        let configs = [
            all_off(),
            PreprocessConfig::default(),
            PreprocessConfig {
                grayscale: false,
                ..PreprocessConfig::default()
            },
            PreprocessConfig {
                deskew: true,
                ..all_off()
            },
        ];

        for config in &configs {
            for input in [&gray, &colour] {
                let out = preprocess(input.clone(), config);
                assert_eq!(out.dimensions(), (12, 8));
                assert_eq!(DynamicImage::ImageRgb8(out).color().channel_count(), 3);
            }
        }
    }

    #[test]
    fn test_all_off_is_passthrough_for_colour() {
        let rgb = RgbImage::from_fn(4, 4, |x, y| Rgb([x as u8, y as u8, 5]));
        let out = preprocess(DynamicImage::ImageRgb8(rgb.clone()), &all_off());
        assert_eq!(out, rgb);
    }

    #[test]
    fn test_gray_only_replicates_luminance() {
        let rgb = RgbImage::from_pixel(3, 3, Rgb([255, 0, 0]));
        let config = PreprocessConfig {
            grayscale: true,
            ..all_off()
        };
        let out = preprocess(DynamicImage::ImageRgb8(rgb), &config);
        assert_eq!(out.get_pixel(1, 1), &Rgb([76, 76, 76]));
    }

    #[test]
    fn test_threshold_skipped_for_colour() {
        let rgb = RgbImage::from_pixel(6, 6, Rgb([120, 130, 140]));
        let config = PreprocessConfig {
            adaptive_threshold: true,
            ..all_off()
        };
        let out = preprocess(DynamicImage::ImageRgb8(rgb.clone()), &config);
        assert_eq!(out, rgb);
    }

    #[test]
    fn test_default_pipeline_binarizes() {
        let mut gray = GrayImage::from_pixel(40, 20, Luma([230]));
        for y in 8..12 {
            for x in 5..35 {
                gray.put_pixel(x, y, Luma([20]));
            }
        }
        let out = preprocess(DynamicImage::ImageLuma8(gray), &PreprocessConfig::default());
        assert!(out.pixels().all(|p| p[0] == 0 || p[0] == 255));
        assert_eq!(out.get_pixel(20, 10), &Rgb([0, 0, 0]));
        assert_eq!(out.get_pixel(20, 2), &Rgb([255, 255, 255]));
    }

    #[test]
    fn test_adaptive_threshold_uniform_is_white() {
        let gray = GrayImage::from_pixel(15, 15, Luma([50]));
        let out = adaptive_threshold_mean(&gray, ADAPTIVE_BLOCK_SIZE, ADAPTIVE_OFFSET);
        assert!(out.pixels().all(|p| p[0] == 255));
    }

    #[test]
    fn test_adaptive_threshold_dark_dot() {
        let mut gray = GrayImage::from_pixel(15, 15, Luma([200]));
        gray.put_pixel(7, 7, Luma([10]));
        let out = adaptive_threshold_mean(&gray, ADAPTIVE_BLOCK_SIZE, ADAPTIVE_OFFSET);
        assert_eq!(out.get_pixel(7, 7)[0], 0);
        assert_eq!(out.get_pixel(0, 0)[0], 255);
    }

    #[test]
    fn test_config_deserializes_partial_map() {
        let config: PreprocessConfig = toml::from_str("deskew = true").unwrap();
        assert!(config.deskew);
        assert!(config.grayscale);
    }
}
