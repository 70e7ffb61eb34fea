//! Non-local-means denoising
//!
//! Each output pixel is a weighted average of the pixels in its search window, weighted
//! by how similar their surrounding patches are. Patch distances for one search offset
//! are computed for the whole image at once through an integral image, so the cost is
//! `O(search_window² · pixels)` independent of the patch size.

use image::{DynamicImage, GrayImage, RgbImage};

use super::raster::normalize;

/// Filter parameters
#[derive(Debug, Clone, Copy)]
pub struct NlmParams {
    /// Filter strength; larger values remove more noise and more detail
    pub h: f32,
    /// Half size of the comparison patch (3 => 7x7)
    pub template_radius: usize,
    /// Half size of the search window (10 => 21x21)
    pub search_radius: usize,
}

impl Default for NlmParams {
    fn default() -> Self {
        Self {
            h: 10.0,
            template_radius: 3,
            search_radius: 10,
        }
    }
}

/// Denoise a grayscale or colour image, keeping its layout
pub fn denoise(image: DynamicImage) -> DynamicImage {
    denoise_with(image, &NlmParams::default())
}

/// Denoise with explicit parameters
pub fn denoise_with(image: DynamicImage, params: &NlmParams) -> DynamicImage {
    match normalize(image) {
        DynamicImage::ImageLuma8(gray) => {
            let (width, height) = gray.dimensions();
            let data = non_local_means(gray.as_raw(), width as usize, height as usize, 1, params);
            GrayImage::from_raw(width, height, data)
                .map(DynamicImage::ImageLuma8)
                .unwrap_or(DynamicImage::ImageLuma8(gray))
        }
        DynamicImage::ImageRgb8(rgb) => {
            let (width, height) = rgb.dimensions();
            let data = non_local_means(rgb.as_raw(), width as usize, height as usize, 3, params);
            RgbImage::from_raw(width, height, data)
                .map(DynamicImage::ImageRgb8)
                .unwrap_or(DynamicImage::ImageRgb8(rgb))
        }
        other => other,
    }
}

/// Non-local means over an interleaved 8-bit buffer with replicated borders.
///
/// Colour images share one weight per neighbour, computed from the patch distance
/// averaged over all channels.
pub fn non_local_means(
    data: &[u8],
    width: usize,
    height: usize,
    channels: usize,
    params: &NlmParams,
) -> Vec<u8> {
    if width == 0 || height == 0 || channels == 0 || data.len() < width * height * channels {
        return data.to_vec();
    }

    let tr = params.template_radius;
    let sr = params.search_radius;
    let pad = tr + sr;

    // Padded copy with edge replication
    let pw = width + 2 * pad;
    let ph = height + 2 * pad;
    let mut padded = vec![0f32; pw * ph * channels];
    for py in 0..ph {
        let sy = py.saturating_sub(pad).min(height - 1);
        for px in 0..pw {
            let sx = px.saturating_sub(pad).min(width - 1);
            let src = (sy * width + sx) * channels;
            let dst = (py * pw + px) * channels;
            for c in 0..channels {
                padded[dst + c] = data[src + c] as f32;
            }
        }
    }

    // Region of patch centres plus the template margin, in padded coordinates starting at `sr`
    let rw = width + 2 * tr;
    let rh = height + 2 * tr;
    let patch = 2 * tr + 1;
    let norm =
        1.0 / ((patch * patch * channels) as f64 * (params.h as f64).powi(2)).max(f64::EPSILON);

    let mut integral = vec![0f64; (rw + 1) * (rh + 1)];
    let mut weight_sum = vec![0f64; width * height];
    let mut value_sum = vec![0f64; width * height * channels];

    let span = sr as isize;
    for dy in -span..=span {
        for dx in -span..=span {
            // Integral image of the squared difference for this offset
            for j in 0..rh {
                let mut row_acc = 0f64;
                let a_row = (sr + j) * pw;
                let b_row = ((sr + j) as isize + dy) as usize * pw;
                for i in 0..rw {
                    let a = (a_row + sr + i) * channels;
                    let b = (b_row + ((sr + i) as isize + dx) as usize) * channels;
                    let mut d = 0f32;
                    for c in 0..channels {
                        let diff = padded[a + c] - padded[b + c];
                        d += diff * diff;
                    }
                    row_acc += d as f64;
                    integral[(j + 1) * (rw + 1) + i + 1] = integral[j * (rw + 1) + i + 1] + row_acc;
                }
            }

            for y in 0..height {
                for x in 0..width {
                    let x1 = x + patch;
                    let y1 = y + patch;
                    let ssd = integral[y1 * (rw + 1) + x1] - integral[y * (rw + 1) + x1]
                        - integral[y1 * (rw + 1) + x]
                        + integral[y * (rw + 1) + x];
                    let weight = (-(ssd.max(0.0)) * norm).exp();

                    let out = y * width + x;
                    weight_sum[out] += weight;
                    let qy = ((pad + y) as isize + dy) as usize;
                    let qx = ((pad + x) as isize + dx) as usize;
                    let q = (qy * pw + qx) * channels;
                    for c in 0..channels {
                        value_sum[out * channels + c] += weight * padded[q + c] as f64;
                    }
                }
            }
        }
    }

    let mut result = vec![0u8; width * height * channels];
    for (i, out) in result.iter_mut().enumerate() {
        let w = weight_sum[i / channels];
        *out = if w > 0.0 {
            (value_sum[i] / w).round().clamp(0.0, 255.0) as u8
        } else {
            data[i]
        };
    }
    result
}
