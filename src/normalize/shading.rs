//! Shading correction: low-frequency background field, spine-shadow
//! detection, and multiplicative gain correction in linear light (spec
//! §4.4 "Shading correction").

use image::{DynamicImage, GenericImageView, GrayImage, Rgba, RgbaImage};

use crate::config::ShadingConfig;
use crate::model::{ShadingModel, ShadowDescriptor, ShadowSide};

const EDGE_STRIP_FRACTION: f64 = 0.04;

fn clamp01(v: f64) -> f64 {
    v.clamp(0.0, 1.0)
}

/// A low-frequency illumination field sampled on a grid of at most 96×96
/// cells, each holding the mean intensity of the pixels it covers.
#[derive(Debug, Clone)]
pub struct BackgroundField {
    cols: usize,
    rows: usize,
    cells: Vec<f64>,
    image_w: u32,
    image_h: u32,
}

impl BackgroundField {
    /// Bilinearly samples the field at an arbitrary pixel coordinate.
    pub fn sample(&self, x: u32, y: u32) -> f64 {
        if self.cols == 0 || self.rows == 0 {
            return 255.0;
        }
        let fx = (x as f64 / self.image_w.max(1) as f64) * self.cols as f64 - 0.5;
        let fy = (y as f64 / self.image_h.max(1) as f64) * self.rows as f64 - 0.5;
        let x0 = fx.floor().clamp(0.0, (self.cols - 1) as f64) as usize;
        let y0 = fy.floor().clamp(0.0, (self.rows - 1) as f64) as usize;
        let x1 = (x0 + 1).min(self.cols - 1);
        let y1 = (y0 + 1).min(self.rows - 1);
        let tx = (fx - x0 as f64).clamp(0.0, 1.0);
        let ty = (fy - y0 as f64).clamp(0.0, 1.0);

        let v00 = self.cells[y0 * self.cols + x0];
        let v10 = self.cells[y0 * self.cols + x1];
        let v01 = self.cells[y1 * self.cols + x0];
        let v11 = self.cells[y1 * self.cols + x1];
        let top = v00 * (1.0 - tx) + v10 * tx;
        let bottom = v01 * (1.0 - tx) + v11 * tx;
        top * (1.0 - ty) + bottom * ty
    }
}

/// Builds the low-frequency background field by averaging the image into
/// a grid capped at 96×96 cells.
pub fn build_background_field(gray: &GrayImage) -> BackgroundField {
    let (w, h) = gray.dimensions();
    let cols = 96usize.min(w.max(1) as usize);
    let rows = 96usize.min(h.max(1) as usize);
    let mut sums = vec![0.0f64; cols * rows];
    let mut counts = vec![0u32; cols * rows];

    for y in 0..h {
        let cy = ((y as f64 / h.max(1) as f64) * rows as f64) as usize;
        let cy = cy.min(rows - 1);
        for x in 0..w {
            let cx = ((x as f64 / w.max(1) as f64) * cols as f64) as usize;
            let cx = cx.min(cols - 1);
            let idx = cy * cols + cx;
            sums[idx] += gray.get_pixel(x, y).0[0] as f64;
            counts[idx] += 1;
        }
    }

    let cells = sums
        .iter()
        .zip(counts.iter())
        .map(|(&s, &c)| if c > 0 { s / c as f64 } else { 255.0 })
        .collect();

    BackgroundField { cols, rows, cells, image_w: w, image_h: h }
}

fn mean_of_rect(gray: &GrayImage, x0: u32, y0: u32, w: u32, h: u32) -> f64 {
    if w == 0 || h == 0 {
        return 0.0;
    }
    let mut sum = 0.0;
    for y in y0..y0 + h {
        for x in x0..x0 + w {
            sum += gray.get_pixel(x, y).0[0] as f64;
        }
    }
    sum / (w as f64 * h as f64)
}

/// Estimates a spine/binding shadow from the 4%-wide left/right edge
/// strips (spec §4.4 "Estimate shadow").
pub fn estimate_shadow(gray: &GrayImage) -> ShadowDescriptor {
    let (w, h) = gray.dimensions();
    let strip_w = ((w as f64) * EDGE_STRIP_FRACTION).round().max(1.0) as u32;
    if strip_w * 2 >= w || h == 0 {
        return ShadowDescriptor::default();
    }

    let global_mean = mean_of_rect(gray, 0, 0, w, h);
    let left_mean = mean_of_rect(gray, 0, 0, strip_w, h);
    let right_mean = mean_of_rect(gray, w - strip_w, 0, strip_w, h);

    let left_darkness = global_mean - left_mean;
    let right_darkness = global_mean - right_mean;

    let (side, darkness, edge_mean) = if left_darkness >= right_darkness {
        (ShadowSide::Left, left_darkness, left_mean)
    } else {
        (ShadowSide::Right, right_darkness, right_mean)
    };

    if darkness <= 2.0 {
        return ShadowDescriptor::default();
    }

    // Widen inward from the strip while the running mean stays below the
    // midpoint between the edge and global mean, mirroring the spread
    // splitter's band-widening idiom.
    let ceiling = edge_mean + 0.5 * darkness;
    let mut width = strip_w;
    let max_width = (w as f64 * 0.25) as u32;
    while width < max_width {
        let probe = match side {
            ShadowSide::Left => mean_of_rect(gray, width, 0, strip_w.max(1), h),
            _ => mean_of_rect(gray, (w - width - strip_w).max(0), 0, strip_w.max(1), h),
        };
        if probe < ceiling {
            width += strip_w.max(1);
        } else {
            break;
        }
    }

    let confidence = clamp01(darkness / 40.0);

    ShadowDescriptor {
        present: confidence > 0.1,
        side,
        width_px: width as f64,
        confidence,
        darkness,
    }
}

/// Combines darkness, inner-vs-outer edge density, and edge continuity
/// into a single spine-shadow score in `[0,1]` (spec §4.4 "Compute
/// spine-shadow score").
pub fn spine_shadow_score(gray: &GrayImage, shadow: &ShadowDescriptor) -> f64 {
    if !shadow.present {
        return 0.0;
    }
    let (w, h) = gray.dimensions();
    let strip_w = (shadow.width_px.round() as u32).max(1).min(w / 2);

    let (outer, inner) = match shadow.side {
        ShadowSide::Left => (
            mean_of_rect(gray, 0, 0, strip_w.min(w), h),
            mean_of_rect(gray, strip_w.min(w.saturating_sub(1)), 0, strip_w.min(w - strip_w.min(w)), h),
        ),
        ShadowSide::Right => (
            mean_of_rect(gray, w.saturating_sub(strip_w), 0, strip_w.min(w), h),
            mean_of_rect(gray, w.saturating_sub(strip_w * 2).max(0), 0, strip_w.min(w), h),
        ),
        _ => (0.0, 0.0),
    };

    let density_term = clamp01((outer - inner).abs() / 40.0);

    // Continuity: fraction of rows whose darkest pixel within the strip
    // is meaningfully below the overall mean (a continuous shadow darkens
    // every row, not just a few).
    let global_mean = mean_of_rect(gray, 0, 0, w, h);
    let mut continuous_rows = 0u32;
    let x_range: Vec<u32> = match shadow.side {
        ShadowSide::Left => (0..strip_w.min(w)).collect(),
        ShadowSide::Right => (w.saturating_sub(strip_w)..w).collect(),
        _ => vec![],
    };
    for y in 0..h {
        let row_min = x_range
            .iter()
            .map(|&x| gray.get_pixel(x, y).0[0] as f64)
            .fold(255.0, f64::min);
        if global_mean - row_min > shadow.darkness * 0.3 {
            continuous_rows += 1;
        }
    }
    let continuity = if h > 0 { continuous_rows as f64 / h as f64 } else { 0.0 };

    clamp01(0.4 * clamp01(shadow.darkness / 40.0) + 0.3 * density_term + 0.3 * continuity)
}

/// Overall shading-correction confidence combining shadow confidence,
/// spine-shadow score, and border noise (spec §4.4).
pub fn shading_confidence(shadow_confidence: f64, spine_shadow: f64, border_std: f64) -> f64 {
    let noise_term = clamp01((border_std - 6.0) / 18.0);
    let bonus = if border_std < 10.0 { 0.05 } else { 0.0 };
    clamp01(0.35 * shadow_confidence + 0.3 * spine_shadow + 0.35 * noise_term + bonus)
}

/// Applies the multiplicative gain correction in linear light if
/// `confidence` clears `cfg.confidence_floor` and the enabled flag is
/// set; otherwise returns the original image with `applied: false`.
///
/// Returns the (possibly corrected) image alongside the [`ShadingModel`]
/// record.
pub fn apply(
    image: &DynamicImage,
    gray: &GrayImage,
    field: &BackgroundField,
    border_mean: f64,
    border_std: f64,
    shadow: &ShadowDescriptor,
    spine_shadow: f64,
    cfg: &ShadingConfig,
) -> (DynamicImage, ShadingModel) {
    let confidence = shading_confidence(shadow.confidence, spine_shadow, border_std);

    let params = serde_json::json!({
        "borderMean": border_mean,
        "borderStd": border_std,
        "maxHighlightShift": cfg.max_highlight_shift,
    });

    if !cfg.enabled || confidence < cfg.confidence_floor {
        return (
            image.clone(),
            ShadingModel {
                method: "multiplicative-gain".to_string(),
                background_model: "grid-mean-96".to_string(),
                spine_shadow_model: "darkness-density-continuity".to_string(),
                params,
                confidence,
                residual: 1.0,
                applied: false,
            },
        );
    }

    let rgba = image.to_rgba8();
    let (w, h) = rgba.dimensions();
    let mut out = RgbaImage::new(w, h);

    for y in 0..h {
        for x in 0..w {
            let bg = field.sample(x, y).max(1.0);
            let raw_gain = border_mean / bg;
            let gain = raw_gain.clamp(1.0 - cfg.max_highlight_shift, 1.0 + cfg.max_highlight_shift);
            let Rgba([r, g, b, a]) = *rgba.get_pixel(x, y);
            let apply_channel = |v: u8| -> u8 {
                let lin = (v as f64 / 255.0).powi(2);
                let corrected = (lin * gain).clamp(0.0, 1.0);
                (corrected.sqrt() * 255.0).round().clamp(0.0, 255.0) as u8
            };
            out.put_pixel(x, y, Rgba([apply_channel(r), apply_channel(g), apply_channel(b), a]));
        }
    }

    let corrected_gray = image::DynamicImage::ImageRgba8(out.clone()).to_luma8();
    let corrected_mean = mean_of_rect(&corrected_gray, 0, 0, w, h);
    let ring = (1u32).max((0.05 * w.min(h) as f64).round() as u32);
    let mut values = Vec::new();
    for y in 0..h {
        for x in 0..w {
            if x < ring || y < ring || x >= w.saturating_sub(ring) || y >= h.saturating_sub(ring) {
                values.push(corrected_gray.get_pixel(x, y).0[0] as f64);
            }
        }
    }
    let corrected_std = if values.is_empty() {
        border_std
    } else {
        let variance = values.iter().map(|v| (v - corrected_mean).powi(2)).sum::<f64>() / values.len() as f64;
        variance.sqrt()
    };
    let residual = if border_std > 0.0 { corrected_std / border_std } else { 1.0 };

    if residual > 1.0 + cfg.max_residual_increase {
        return (
            image.clone(),
            ShadingModel {
                method: "multiplicative-gain".to_string(),
                background_model: "grid-mean-96".to_string(),
                spine_shadow_model: "darkness-density-continuity".to_string(),
                params,
                confidence,
                residual,
                applied: false,
            },
        );
    }

    (
        DynamicImage::ImageRgba8(out),
        ShadingModel {
            method: "multiplicative-gain".to_string(),
            background_model: "grid-mean-96".to_string(),
            spine_shadow_model: "darkness-density-continuity".to_string(),
            params,
            confidence,
            residual,
            applied: true,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Luma, Rgb, RgbImage};

    #[test]
    fn background_field_samples_uniform_image_as_constant() {
        let gray = GrayImage::from_pixel(200, 200, Luma([128]));
        let field = build_background_field(&gray);
        assert!((field.sample(0, 0) - 128.0).abs() < 1e-6);
        assert!((field.sample(199, 199) - 128.0).abs() < 1e-6);
    }

    #[test]
    fn estimate_shadow_detects_darker_left_strip() {
        let mut img = GrayImage::from_pixel(400, 400, Luma([230]));
        for y in 0..400 {
            for x in 0..16 {
                img.put_pixel(x, y, Luma([180]));
            }
        }
        let shadow = estimate_shadow(&img);
        assert!(shadow.present);
        assert_eq!(shadow.side, ShadowSide::Left);
    }

    #[test]
    fn uniform_image_has_no_shadow() {
        let img = GrayImage::from_pixel(200, 200, Luma([200]));
        let shadow = estimate_shadow(&img);
        assert!(!shadow.present);
    }

    #[test]
    fn apply_skips_correction_below_confidence_floor() {
        let rgb = RgbImage::from_pixel(100, 100, Rgb([200, 200, 200]));
        let image = DynamicImage::ImageRgb8(rgb);
        let gray = image.to_luma8();
        let field = build_background_field(&gray);
        let shadow = ShadowDescriptor::default();
        let cfg = ShadingConfig { confidence_floor: 0.9, ..ShadingConfig::default() };
        let (_out, model) = apply(&image, &gray, &field, 200.0, 2.0, &shadow, 0.0, &cfg);
        assert!(!model.applied);
    }
}
