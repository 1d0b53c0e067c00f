//! Denoise / contrast / sharpen morphology pass (spec §4.4 "Morphology").

use image::{DynamicImage, GrayImage};
use imageproc::distance_transform::Norm;
use imageproc::filter::gaussian_blur_f32;
use imageproc::morphology::{dilate, erode};

/// Which morphology steps were applied to a page, decided from its
/// border noise, shadow presence, and mask coverage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MorphologyPlan {
    pub denoise: bool,
    pub contrast_boost: bool,
    pub sharpen: bool,
}

/// Decides which steps apply, per spec §4.4's thresholds:
/// denoise when the border is noisy or a binding shadow is present,
/// contrast boost when the content mask covers less than 60% of the
/// page, sharpen when it covers more than 70% and the border is clean.
pub fn plan_for(border_std: f64, shadow_present: bool, mask_coverage: f64) -> MorphologyPlan {
    MorphologyPlan {
        denoise: border_std > 18.0 || shadow_present,
        contrast_boost: mask_coverage < 0.6,
        sharpen: mask_coverage > 0.7 && border_std < 25.0,
    }
}

/// Open-then-close with a 1px structuring element, which removes
/// speckle noise from scanner dust without eroding stroke width
/// noticeably.
fn denoise_gray(gray: &GrayImage) -> GrayImage {
    let opened = dilate(&erode(gray, Norm::LInf, 1), Norm::LInf, 1);
    erode(&dilate(&opened, Norm::LInf, 1), Norm::LInf, 1)
}

/// Linear contrast stretch: `out = (in - 128) * gain + 128 + bias`.
fn apply_linear_contrast(rgba: &mut image::RgbaImage, gain: f64, bias: f64) {
    for pixel in rgba.pixels_mut() {
        for channel in 0..3 {
            let v = pixel.0[channel] as f64;
            let out = (v - 128.0) * gain + 128.0 + bias;
            pixel.0[channel] = out.round().clamp(0.0, 255.0) as u8;
        }
    }
}

/// Unsharp mask: `out = in + (in - blur(in, sigma))`.
fn apply_sharpen(rgba: &image::RgbaImage, sigma: f32) -> image::RgbaImage {
    let blurred = gaussian_blur_f32(rgba, sigma);
    let (w, h) = rgba.dimensions();
    let mut out = image::RgbaImage::new(w, h);
    for y in 0..h {
        for x in 0..w {
            let orig = rgba.get_pixel(x, y);
            let blur = blurred.get_pixel(x, y);
            let mut out_px = *orig;
            for c in 0..3 {
                let sharpened = orig.0[c] as f64 + (orig.0[c] as f64 - blur.0[c] as f64);
                out_px.0[c] = sharpened.round().clamp(0.0, 255.0) as u8;
            }
            out.put_pixel(x, y, out_px);
        }
    }
    out
}

/// Runs the selected steps over `image`, returning the corrected image.
pub fn apply(image: &DynamicImage, plan: MorphologyPlan) -> DynamicImage {
    let mut rgba = image.to_rgba8();

    if plan.denoise {
        let gray = DynamicImage::ImageRgba8(rgba.clone()).to_luma8();
        let denoised_gray = denoise_gray(&gray);
        // Blend the denoised luma back in as a gentle low-pass on each
        // channel, preserving color.
        for (x, y, px) in rgba.enumerate_pixels_mut() {
            let target = denoised_gray.get_pixel(x, y).0[0] as f64;
            let current_luma =
                0.299 * px.0[0] as f64 + 0.587 * px.0[1] as f64 + 0.114 * px.0[2] as f64;
            if current_luma.abs() > f64::EPSILON {
                let ratio = target / current_luma.max(1.0);
                for c in 0..3 {
                    px.0[c] = (px.0[c] as f64 * ratio).round().clamp(0.0, 255.0) as u8;
                }
            }
        }
    }

    if plan.contrast_boost {
        apply_linear_contrast(&mut rgba, 1.05, -2.0);
    }

    if plan.sharpen {
        rgba = apply_sharpen(&rgba, 0.6);
    }

    DynamicImage::ImageRgba8(rgba)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::GenericImageView;

    #[test]
    fn plan_enables_denoise_on_noisy_border() {
        let plan = plan_for(25.0, false, 0.8);
        assert!(plan.denoise);
        assert!(!plan.contrast_boost);
        assert!(plan.sharpen);
    }

    #[test]
    fn plan_enables_contrast_boost_on_low_coverage() {
        let plan = plan_for(5.0, false, 0.3);
        assert!(!plan.denoise);
        assert!(plan.contrast_boost);
        assert!(!plan.sharpen);
    }

    #[test]
    fn plan_is_empty_for_clean_midrange_page() {
        let plan = plan_for(10.0, false, 0.65);
        assert_eq!(plan, MorphologyPlan::default());
    }

    #[test]
    fn apply_with_empty_plan_is_identity_dimensions() {
        let img = DynamicImage::ImageRgb8(image::RgbImage::from_pixel(32, 32, image::Rgb([200, 200, 200])));
        let out = apply(&img, MorphologyPlan::default());
        assert_eq!(out.dimensions(), img.dimensions());
    }
}
