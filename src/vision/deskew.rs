//! Skew estimation and correction
//!
//! The skew angle is taken from the minimum-area rectangle around all foreground
//! pixels of an Otsu-binarized copy. Angles follow the screen convention:
//! positive is counter-clockwise as displayed.

use image::{DynamicImage, GrayImage, Pixel};
use imageproc::contrast::otsu_level;
use imageproc::geometry::min_area_rect;
use imageproc::point::Point;
use tracing::debug;

use super::raster::{normalize, to_gray};

/// Fewer foreground pixels than this carry no usable orientation
pub const MIN_FOREGROUND_PIXELS: usize = 10;

/// Corrections smaller than this (degrees) are skipped
pub const MIN_CORRECTION_DEGREES: f64 = 0.5;

/// Straighten `image`, or return it untouched when no reliable skew is found
pub fn deskew(image: DynamicImage) -> DynamicImage {
    let gray = to_gray(&image);
    let Some(angle) = estimate_skew(&gray) else {
        return image;
    };
    if angle.abs() < MIN_CORRECTION_DEGREES {
        return image;
    }

    debug!("deskew: rotating by {:.2} degrees", angle);
    rotate_replicate(image, angle)
}

/// Rotation (degrees) that would straighten `gray`.
///
/// `None` when the image is uniform or has fewer than [`MIN_FOREGROUND_PIXELS`]
/// foreground pixels.
pub fn estimate_skew(gray: &GrayImage) -> Option<f64> {
    let (lo, hi) = gray
        .pixels()
        .fold((u8::MAX, u8::MIN), |(lo, hi), p| (lo.min(p[0]), hi.max(p[0])));
    if lo >= hi {
        return None;
    }

    // Inverted binarization: dark pixels are the foreground
    let level = otsu_level(gray);
    let foreground: Vec<Point<i32>> = gray
        .enumerate_pixels()
        .filter(|(_, _, p)| p[0] <= level)
        .map(|(x, y, _)| Point::new(x as i32, y as i32))
        .collect();

    if foreground.len() < MIN_FOREGROUND_PIXELS {
        return None;
    }

    let theta = min_area_rect_angle(&foreground);
    Some(if theta < -45.0 { -(90.0 + theta) } else { -theta })
}

/// Corner coordinates of `min_area_rect` are integral; points are scaled up first so the
/// rounding stays well below a pixel.
const SUBPIXEL_SCALE: i32 = 16;

/// Angle in `[-90, 0)` of the minimum-area rectangle enclosing `points`
pub fn min_area_rect_angle(points: &[Point<i32>]) -> f64 {
    let scaled: Vec<Point<i32>> = points
        .iter()
        .map(|p| Point::new(p.x * SUBPIXEL_SCALE, p.y * SUBPIXEL_SCALE))
        .collect();
    if scaled.is_empty() {
        return -90.0;
    }

    let [a, b, c, _] = min_area_rect(&scaled);
    let top = ((b.x - a.x) as f64, (b.y - a.y) as f64);
    let side = ((c.x - b.x) as f64, (c.y - b.y) as f64);
    let (ex, ey) = if top.0.hypot(top.1) >= side.0.hypot(side.1) {
        top
    } else {
        side
    };
    edge_angle(ex, ey)
}

/// Screen-space direction of an edge (image y grows downward), folded into `[-90, 0)`
fn edge_angle(ex: f64, ey: f64) -> f64 {
    let degrees = (-ey).atan2(ex).to_degrees();
    degrees.rem_euclid(90.0) - 90.0
}

/// Rotate about the image centre, keeping the original size.
///
/// Bicubic interpolation; samples falling outside the image take the nearest edge pixel.
pub fn rotate_replicate(image: DynamicImage, degrees: f64) -> DynamicImage {
    match normalize(image) {
        DynamicImage::ImageLuma8(mut gray) => {
            rotate_buffer(&mut gray, degrees);
            DynamicImage::ImageLuma8(gray)
        }
        DynamicImage::ImageRgb8(mut rgb) => {
            rotate_buffer(&mut rgb, degrees);
            DynamicImage::ImageRgb8(rgb)
        }
        other => other,
    }
}

fn rotate_buffer<P>(image: &mut image::ImageBuffer<P, Vec<u8>>, degrees: f64)
where
    P: Pixel<Subpixel = u8>,
{
    let (width, height) = image.dimensions();
    if width == 0 || height == 0 {
        return;
    }
    let channels = P::CHANNEL_COUNT as usize;
    let (w, h) = (width as usize, height as usize);
    let source = image.as_raw().clone();

    let (sin, cos) = degrees.to_radians().sin_cos();
    let cx = (width as f64 - 1.0) / 2.0;
    let cy = (height as f64 - 1.0) / 2.0;

    let out: &mut [u8] = image;
    for y in 0..h {
        let ddy = y as f64 - cy;
        for x in 0..w {
            let ddx = x as f64 - cx;
            // Inverse mapping: where this output pixel came from in the source
            let sx = cx + ddx * cos - ddy * sin;
            let sy = cy + ddx * sin + ddy * cos;

            let x0 = sx.floor();
            let y0 = sy.floor();
            let wx = cubic_weights(sx - x0);
            let wy = cubic_weights(sy - y0);

            let base = (y * w + x) * channels;
            for c in 0..channels {
                let mut acc = 0.0;
                for (j, wyj) in wy.iter().enumerate() {
                    let yy = clamp_index(y0 as i64 + j as i64 - 1, h);
                    let mut row = 0.0;
                    for (i, wxi) in wx.iter().enumerate() {
                        let xx = clamp_index(x0 as i64 + i as i64 - 1, w);
                        row += wxi * source[(yy * w + xx) * channels + c] as f64;
                    }
                    acc += wyj * row;
                }
                out[base + c] = acc.round().clamp(0.0, 255.0) as u8;
            }
        }
    }
}

fn clamp_index(i: i64, len: usize) -> usize {
    i.clamp(0, len as i64 - 1) as usize
}

/// Cubic convolution weights (a = -0.75) for the four taps around a fractional offset
fn cubic_weights(t: f64) -> [f64; 4] {
    const A: f64 = -0.75;
    let kernel = |d: f64| {
        let d = d.abs();
        if d <= 1.0 {
            ((A + 2.0) * d - (A + 3.0)) * d * d + 1.0
        } else if d < 2.0 {
            ((A * d - 5.0 * A) * d + 8.0 * A) * d - 4.0 * A
        } else {
            0.0
        }
    };
    [kernel(1.0 + t), kernel(t), kernel(1.0 - t), kernel(2.0 - t)]
}

#[cfg(test)]
mod tests {
    use super::*;
    use imageproc::drawing::draw_polygon_mut;
    use image::{Luma, Rgb, RgbImage};

    fn white(width: u32, height: u32) -> GrayImage {
        GrayImage::from_pixel(width, height, Luma([255]))
    }

    /// Dark bar centred at (50, 50), tilted counter-clockwise by `degrees`
    fn tilted_bar(degrees: f64) -> GrayImage {
        let mut image = white(100, 100);
        let (sin, cos) = degrees.to_radians().sin_cos();
        let (ux, uy) = (cos, -sin);
        let (vx, vy) = (sin, cos);
        let corners: Vec<Point<i32>> = [(-30.0, -8.0), (30.0, -8.0), (30.0, 8.0), (-30.0, 8.0)]
            .iter()
            .map(|&(a, b)| {
                Point::new(
                    (50.0 + a * ux + b * vx).round() as i32,
                    (50.0 + a * uy + b * vy).round() as i32,
                )
            })
            .collect();
        draw_polygon_mut(&mut image, &corners, Luma([0]));
        image
    }

    #[test]
    fn test_sparse_foreground_is_unchanged() {
        let mut image = white(40, 40);
        for i in 0..5 {
            image.put_pixel(5 + i * 3, 7 + i * 5, Luma([0]));
        }
        assert!(estimate_skew(&image).is_none());

        let input = DynamicImage::ImageLuma8(image);
        assert_eq!(deskew(input.clone()), input);
    }

    #[test]
    fn test_uniform_image_is_unchanged() {
        let input = DynamicImage::ImageLuma8(white(30, 30));
        assert!(estimate_skew(&input.to_luma8()).is_none());
        assert_eq!(deskew(input.clone()), input);
    }

    #[test]
    fn test_aligned_content_is_unchanged() {
        let mut image = RgbImage::from_pixel(60, 40, Rgb([250, 250, 250]));
        for y in 15..25 {
            for x in 10..50 {
                image.put_pixel(x, y, Rgb([10, 10, 10]));
            }
        }
        let input = DynamicImage::ImageRgb8(image);
        let skew = estimate_skew(&to_gray(&input)).unwrap();
        assert!(skew.abs() < MIN_CORRECTION_DEGREES, "skew {}", skew);
        assert_eq!(deskew(input.clone()), input);
    }

    #[test]
    fn test_estimates_counter_clockwise_tilt() {
        let skew = estimate_skew(&tilted_bar(10.0)).unwrap();
        assert!((skew + 10.0).abs() < 1.0, "expected about -10, got {}", skew);
    }

    #[test]
    fn test_estimates_clockwise_tilt() {
        let skew = estimate_skew(&tilted_bar(-12.0)).unwrap();
        assert!((skew - 12.0).abs() < 1.0, "expected about 12, got {}", skew);
    }

    #[test]
    fn test_deskew_straightens_bar() {
        let input = DynamicImage::ImageLuma8(tilted_bar(10.0));
        let output = deskew(input.clone());
        assert_ne!(output, input);
        assert_eq!(output.to_luma8().dimensions(), (100, 100));

        let residual = estimate_skew(&output.to_luma8()).unwrap();
        assert!(residual.abs() < 2.0, "residual skew {}", residual);
    }

    #[test]
    fn test_min_area_rect_angle_of_axis_aligned_block() {
        let block: Vec<Point<i32>> = (0..20)
            .flat_map(|x| (0..5).map(move |y| Point::new(x, y)))
            .collect();
        let theta = min_area_rect_angle(&block);
        assert!(theta < -89.5 || theta > -0.5, "theta {}", theta);
    }

    #[test]
    fn test_edge_angle_convention() {
        assert_eq!(edge_angle(1.0, 0.0), -90.0);
        assert!((edge_angle(1.0, -1.0) + 45.0).abs() < 1e-9);
        assert!((edge_angle(0.0, 1.0) + 90.0).abs() < 1e-9);
    }

    #[test]
    fn test_rotate_by_zero_is_identity() {
        let image = RgbImage::from_fn(5, 4, |x, y| Rgb([(x * 40) as u8, (y * 60) as u8, 3]));
        let input = DynamicImage::ImageRgb8(image);
        assert_eq!(rotate_replicate(input.clone(), 0.0), input);
    }

    #[test]
    fn test_rotate_quarter_turn() {
        let mut image = GrayImage::from_pixel(3, 3, Luma([0]));
        // South of centre
        image.put_pixel(1, 2, Luma([200]));
        let rotated = rotate_replicate(DynamicImage::ImageLuma8(image), 90.0).to_luma8();
        // A counter-clockwise quarter turn moves south to east
        assert_eq!(rotated.get_pixel(2, 1)[0], 200);
        assert_eq!(rotated.get_pixel(1, 2)[0], 0);
    }

    #[test]
    fn test_cubic_weights_sum_to_one() {
        for t in [0.0, 0.25, 0.5, 0.9] {
            let sum: f64 = cubic_weights(t).iter().sum();
            assert!((sum - 1.0).abs() < 1e-9);
        }
    }
}
