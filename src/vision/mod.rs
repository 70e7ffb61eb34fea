//! Vision Layer
//!
//! Stateless image geometry and normalization applied before recognition:
//! - decoding of the captured image bytes
//! - region-of-interest extraction (rect, polygon, perspective)
//! - preprocessing (grayscale, denoise, adaptive threshold, deskew)

pub mod denoise;
pub mod deskew;
pub mod preprocess;
pub mod raster;
pub mod roi;

use thiserror::Error;

pub use preprocess::{preprocess, PreprocessConfig};
pub use raster::decode;
pub use roi::{crop, Roi};

/// Failures of the per-request image pipeline
#[derive(Debug, Error)]
pub enum VisionError {
    #[error("image data is empty")]
    EmptyImage,

    #[error("failed to decode image: {0}")]
    Decode(#[from] image::ImageError),

    #[error("invalid image dimensions: {width}x{height}")]
    InvalidDimensions { width: u32, height: u32 },

    #[error("invalid {roi_type} roi_params: {reason}")]
    InvalidRoi { roi_type: String, reason: String },

    #[error("invalid preprocess options: {0}")]
    InvalidPreprocess(String),

    #[error("perspective target {width}x{height} exceeds the {max_pixels} pixel limit")]
    RoiTooLarge {
        width: u32,
        height: u32,
        max_pixels: u64,
    },
}
