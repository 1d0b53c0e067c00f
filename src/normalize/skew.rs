//! Skew estimation and refinement (spec §4.4 "Skew estimation").

use image::{DynamicImage, GenericImageView, GrayImage};

use crate::config::SkewRefinementMode;

const ANGLE_MIN: i32 = -90;
const ANGLE_MAX: i32 = 90;
const BUCKETS: usize = 181; // -90..=90 inclusive
const SMOOTH_RADIUS: i32 = 3;
const ANGLE_CLAMP: f64 = 8.0;

#[derive(Debug, Clone, Copy)]
pub struct SkewEstimate {
    pub angle_deg: f64,
    pub confidence: f64,
}

/// Builds a histogram over gradient-edge angles and returns the clamped,
/// smoothed peak angle with its confidence.
///
/// Each pixel's Sobel gradient contributes its magnitude to the bucket
/// nearest its edge-normal angle (the gradient direction rotated 90°, so
/// that horizontal text baselines vote for angle 0). The histogram is
/// smoothed with a ±3-bucket weighted average around the peak before
/// being read off, matching spec §4.4.
pub fn estimate_skew(gray: &GrayImage) -> SkewEstimate {
    let (w, h) = gray.dimensions();
    if w < 4 || h < 4 {
        return SkewEstimate { angle_deg: 0.0, confidence: 0.0 };
    }

    let mut histogram = [0.0f64; BUCKETS];

    for y in 1..h - 1 {
        for x in 1..w - 1 {
            let gx = gray.get_pixel(x + 1, y).0[0] as f64 - gray.get_pixel(x - 1, y).0[0] as f64;
            let gy = gray.get_pixel(x, y + 1).0[0] as f64 - gray.get_pixel(x, y - 1).0[0] as f64;
            let magnitude = (gx * gx + gy * gy).sqrt();
            if magnitude < 1.0 {
                continue;
            }
            // Edge-normal angle rotated 90 deg so that a horizontal line's
            // gradient (which points vertically) votes for angle 0.
            let angle_rad = gy.atan2(gx);
            let mut angle_deg = angle_rad.to_degrees() - 90.0;
            while angle_deg < -90.0 {
                angle_deg += 180.0;
            }
            while angle_deg > 90.0 {
                angle_deg -= 180.0;
            }
            let bucket = (angle_deg.round() as i32 - ANGLE_MIN).clamp(0, BUCKETS as i32 - 1) as usize;
            histogram[bucket] += magnitude;
        }
    }

    let (peak_idx, peak_mass) = histogram
        .iter()
        .enumerate()
        .fold((0usize, 0.0f64), |acc, (i, &m)| if m > acc.1 { (i, m) } else { acc });

    let mut weighted_sum = 0.0;
    let mut weight_total = 0.0;
    for offset in -SMOOTH_RADIUS..=SMOOTH_RADIUS {
        let idx = peak_idx as i32 + offset;
        if idx < 0 || idx as usize >= BUCKETS {
            continue;
        }
        let weight = histogram[idx as usize];
        weighted_sum += (idx + ANGLE_MIN) as f64 * weight;
        weight_total += weight;
    }
    let raw_angle = if weight_total > 0.0 { weighted_sum / weight_total } else { 0.0 };
    let angle_deg = raw_angle.clamp(-ANGLE_CLAMP, ANGLE_CLAMP);

    let confidence = (peak_mass / (w as f64 * h as f64 * 4.0)).min(1.0);

    SkewEstimate { angle_deg, confidence }
}

/// Rotates `image` by `angle_deg` around its center, filling uncovered
/// corners with white (matching a scanned page's typical background).
pub fn rotate(image: &DynamicImage, angle_deg: f64) -> DynamicImage {
    if angle_deg.abs() < 1e-6 {
        return image.clone();
    }
    let rgba = image.to_rgba8();
    let rotated = imageproc::geometric_transformations::rotate_about_center(
        &rgba,
        (angle_deg.to_radians()) as f32,
        imageproc::geometric_transformations::Interpolation::Bilinear,
        image::Rgba([255, 255, 255, 255]),
    );
    DynamicImage::ImageRgba8(rotated)
}

/// Decides whether to re-measure and re-rotate after the first pass, per
/// spec §4.4's refinement policy, and returns the final angle to apply.
pub fn refine(
    mode: SkewRefinementMode,
    initial: SkewEstimate,
    residual: SkewEstimate,
) -> Option<f64> {
    let should_refine = match mode {
        SkewRefinementMode::Forced => true,
        SkewRefinementMode::On => {
            (residual.confidence > 0.2 && residual.angle_deg.abs() > 0.1) || initial.confidence < 0.25
        }
        SkewRefinementMode::Off => false,
    };
    if should_refine {
        Some(initial.angle_deg + residual.angle_deg)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Luma, GrayImage};

    fn striped_image(width: u32, height: u32) -> GrayImage {
        let mut img = GrayImage::new(width, height);
        for y in 0..height {
            let value = if (y / 8) % 2 == 0 { 40 } else { 230 };
            for x in 0..width {
                img.put_pixel(x, y, Luma([value]));
            }
        }
        img
    }

    #[test]
    fn horizontal_stripes_estimate_near_zero_skew() {
        let img = striped_image(200, 200);
        let estimate = estimate_skew(&img);
        assert!(estimate.angle_deg.abs() < 2.0, "angle={}", estimate.angle_deg);
    }

    #[test]
    fn blank_image_has_zero_confidence() {
        let img = GrayImage::from_pixel(100, 100, Luma([255]));
        let estimate = estimate_skew(&img);
        assert_eq!(estimate.confidence, 0.0);
    }

    #[test]
    fn refine_forced_always_refines() {
        let initial = SkewEstimate { angle_deg: 1.0, confidence: 0.9 };
        let residual = SkewEstimate { angle_deg: 0.0, confidence: 0.0 };
        assert_eq!(refine(SkewRefinementMode::Forced, initial, residual), Some(1.0));
    }

    #[test]
    fn refine_off_never_refines() {
        let initial = SkewEstimate { angle_deg: 1.0, confidence: 0.1 };
        let residual = SkewEstimate { angle_deg: 0.5, confidence: 0.9 };
        assert_eq!(refine(SkewRefinementMode::Off, initial, residual), None);
    }

    #[test]
    fn refine_on_skips_when_residual_small_and_initial_confident() {
        let initial = SkewEstimate { angle_deg: 1.0, confidence: 0.9 };
        let residual = SkewEstimate { angle_deg: 0.05, confidence: 0.1 };
        assert_eq!(refine(SkewRefinementMode::On, initial, residual), None);
    }

    #[test]
    fn refine_on_refines_when_initial_confidence_low() {
        let initial = SkewEstimate { angle_deg: 1.0, confidence: 0.1 };
        let residual = SkewEstimate { angle_deg: 0.2, confidence: 0.05 };
        assert_eq!(refine(SkewRefinementMode::On, initial, residual), Some(1.2));
    }
}
