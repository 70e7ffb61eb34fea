//! Region-of-interest extraction
//!
//! Three projection models are supported: an axis-aligned rectangle, a filled polygon
//! masked and cropped to its bounding box, and a four-corner perspective rectification.
//! Out-of-range coordinates are clamped; degenerate shapes fall back to the full frame.

use image::{DynamicImage, GenericImageView, GrayImage, ImageBuffer, Luma, Pixel, Rgb, RgbImage};
use imageproc::drawing::draw_polygon_mut;
use imageproc::geometric_transformations::{warp_into, Interpolation, Projection};
use imageproc::point::Point;
use tracing::debug;

use super::raster::normalize;
use super::VisionError;

/// Upper bound on the rectified perspective output
pub const MAX_WARP_PIXELS: u64 = 64 * 1024 * 1024;

/// Region of interest descriptor
#[derive(Debug, Clone, PartialEq)]
pub enum Roi {
    /// Axis-aligned rectangle. A missing width or height extends to the image edge.
    Rect {
        x: i64,
        y: i64,
        w: Option<i64>,
        h: Option<i64>,
    },
    /// Ordered polygon vertices
    Polygon { points: Vec<(i64, i64)> },
    /// Quadrilateral in winding order: top-left, top-right, bottom-right, bottom-left
    Perspective { corners: [(f32, f32); 4] },
    FullFrame,
}

/// Extract the region of interest from `image`
pub fn crop(image: DynamicImage, roi: &Roi) -> Result<DynamicImage, VisionError> {
    let (width, height) = image.dimensions();
    if width == 0 || height == 0 {
        return Ok(image);
    }

    match roi {
        Roi::Rect { x, y, w, h } => Ok(crop_rect(image, *x, *y, *w, *h)),
        Roi::Polygon { points } => Ok(crop_polygon(image, points)),
        Roi::Perspective { corners } => crop_perspective(image, corners),
        Roi::FullFrame => Ok(image),
    }
}

fn crop_rect(image: DynamicImage, x: i64, y: i64, w: Option<i64>, h: Option<i64>) -> DynamicImage {
    let (width, height) = image.dimensions();
    let (width, height) = (width as i64, height as i64);

    let x = x.clamp(0, width - 1);
    let y = y.clamp(0, height - 1);
    let w = w.unwrap_or(width - x).clamp(1, width - x);
    let h = h.unwrap_or(height - y).clamp(1, height - y);

    image.crop_imm(x as u32, y as u32, w as u32, h as u32)
}

fn crop_polygon(image: DynamicImage, points: &[(i64, i64)]) -> DynamicImage {
    if points.len() < 3 {
        return image;
    }

    let (width, height) = image.dimensions();
    let mut vertices: Vec<Point<i32>> = points
        .iter()
        .map(|&(x, y)| {
            Point::new(
                x.clamp(0, width as i64 - 1) as i32,
                y.clamp(0, height as i64 - 1) as i32,
            )
        })
        .collect();

    // The rasterizer rejects repeated consecutive vertices and an explicit closing point
    vertices.dedup();
    while vertices.len() > 1 && vertices.first() == vertices.last() {
        vertices.pop();
    }
    if vertices.len() < 3 {
        debug!("polygon collapsed to {} distinct vertices, using full frame", vertices.len());
        return image;
    }

    let mut mask = GrayImage::new(width, height);
    draw_polygon_mut(&mut mask, &vertices, Luma([255u8]));

    let min_x = vertices.iter().map(|p| p.x).min().unwrap_or(0) as u32;
    let min_y = vertices.iter().map(|p| p.y).min().unwrap_or(0) as u32;
    let max_x = vertices.iter().map(|p| p.x).max().unwrap_or(0) as u32;
    let max_y = vertices.iter().map(|p| p.y).max().unwrap_or(0) as u32;

    let masked = match normalize(image) {
        DynamicImage::ImageLuma8(mut gray) => {
            zero_outside(&mut gray, &mask);
            DynamicImage::ImageLuma8(gray)
        }
        DynamicImage::ImageRgb8(mut rgb) => {
            zero_outside(&mut rgb, &mask);
            DynamicImage::ImageRgb8(rgb)
        }
        other => other,
    };

    masked.crop_imm(min_x, min_y, max_x - min_x + 1, max_y - min_y + 1)
}

fn zero_outside<P>(image: &mut ImageBuffer<P, Vec<u8>>, mask: &GrayImage)
where
    P: Pixel<Subpixel = u8>,
{
    for (pixel, m) in image.pixels_mut().zip(mask.pixels()) {
        if m[0] == 0 {
            pixel.channels_mut().fill(0);
        }
    }
}

fn crop_perspective(
    image: DynamicImage,
    corners: &[(f32, f32); 4],
) -> Result<DynamicImage, VisionError> {
    let [c0, c1, c2, c3] = *corners;
    let target_w = distance(c0, c1).max(distance(c2, c3)).floor();
    let target_h = distance(c0, c3).max(distance(c1, c2)).floor();

    // Also rejects NaN
    if !(target_w >= 1.0 && target_h >= 1.0) {
        debug!("degenerate perspective quad ({}x{}), using full frame", target_w, target_h);
        return Ok(image);
    }

    let pixels = target_w as f64 * target_h as f64;
    if pixels > MAX_WARP_PIXELS as f64 {
        return Err(VisionError::RoiTooLarge {
            width: target_w.min(u32::MAX as f32) as u32,
            height: target_h.min(u32::MAX as f32) as u32,
            max_pixels: MAX_WARP_PIXELS,
        });
    }

    let (out_w, out_h) = (target_w as u32, target_h as u32);
    let right = out_w as f32 - 1.0;
    let bottom = out_h as f32 - 1.0;
    let destination = [(0.0, 0.0), (right, 0.0), (right, bottom), (0.0, bottom)];

    let Some(projection) = Projection::from_control_points(*corners, destination) else {
        debug!("perspective quad has no projective solution, using full frame");
        return Ok(image);
    };

    let warped = match normalize(image) {
        DynamicImage::ImageLuma8(gray) => {
            let mut out = GrayImage::new(out_w, out_h);
            warp_into(&gray, &projection, Interpolation::Bilinear, Luma([0]), &mut out);
            DynamicImage::ImageLuma8(out)
        }
        DynamicImage::ImageRgb8(rgb) => {
            let mut out = RgbImage::new(out_w, out_h);
            warp_into(&rgb, &projection, Interpolation::Bilinear, Rgb([0, 0, 0]), &mut out);
            DynamicImage::ImageRgb8(out)
        }
        other => other,
    };

    Ok(warped)
}

fn distance(a: (f32, f32), b: (f32, f32)) -> f32 {
    ((a.0 - b.0).powi(2) + (a.1 - b.1).powi(2)).sqrt()
}
