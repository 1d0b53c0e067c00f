//! Mask + edge crop, shadow-side trim, padding/aspect alignment, and
//! book-prior snap (spec §4.4 "Mask and edge crop" through "Book-prior
//! snap").

use image::{GenericImageView, GrayImage};
use imageproc::gradients::sobel_gradients;

use crate::model::{BookModel, Box4, ShadowDescriptor, ShadowSide};

/// Mean and standard deviation over the outermost `max(1, 5% * min(W,H))`
/// pixel border ring (spec §4.4 "Border stats").
pub fn border_stats(gray: &GrayImage) -> (f64, f64) {
    let (w, h) = gray.dimensions();
    let ring = (1u32).max((0.05 * w.min(h) as f64).round() as u32);
    let mut sum = 0.0f64;
    let mut count = 0.0f64;
    let mut values = Vec::new();
    for y in 0..h {
        for x in 0..w {
            let on_border = x < ring || y < ring || x >= w.saturating_sub(ring) || y >= h.saturating_sub(ring);
            if on_border {
                let v = gray.get_pixel(x, y).0[0] as f64;
                sum += v;
                count += 1.0;
                values.push(v);
            }
        }
    }
    if count == 0.0 {
        return (0.0, 0.0);
    }
    let mean = sum / count;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / count;
    (mean, variance.sqrt())
}

/// Ratio of a box's area to the full image area — the "coverage" used
/// during mask/edge-box tightening (distinct from the final
/// `NormalizationStats::mask_coverage`, which is a dark-pixel ratio).
pub fn box_area_ratio(box_: Box4, w: u32, h: u32) -> f64 {
    let [x0, y0, x1, y1] = box_;
    let area = ((x1 - x0 + 1).max(0) * (y1 - y0 + 1).max(0)) as f64;
    let total = (w as f64) * (h as f64);
    if total <= 0.0 {
        0.0
    } else {
        (area / total).clamp(0.0, 1.0)
    }
}

/// Tightens a box inward from `[0,0,w-1,h-1]` to the first row/column on
/// each side whose "below threshold" count exceeds the given per-axis
/// limit, following the projection-reduction shape spec §4.4 describes
/// for both the intensity mask and the edge box.
fn tighten_by_projection(
    below: &[bool],
    w: u32,
    h: u32,
    col_limit: u32,
    row_limit: u32,
) -> Box4 {
    let w_u = w as usize;
    let h_u = h as usize;
    let mut col_counts = vec![0u32; w_u];
    let mut row_counts = vec![0u32; h_u];
    for y in 0..h_u {
        for x in 0..w_u {
            if below[y * w_u + x] {
                col_counts[x] += 1;
                row_counts[y] += 1;
            }
        }
    }
    // A side with no column/row over the limit means there is no content to
    // tighten onto at all (e.g. a blank page): collapse to an empty box
    // rather than defaulting outward to the full image, which would read a
    // blank page as fully covered.
    let left = match col_counts.iter().position(|&c| c > col_limit) {
        Some(i) => i as i64,
        None => return [0, 0, -1, -1],
    };
    let right = (w_u - 1
        - match col_counts.iter().rev().position(|&c| c > col_limit) {
            Some(i) => i,
            None => return [0, 0, -1, -1],
        }) as i64;
    let top = match row_counts.iter().position(|&c| c > row_limit) {
        Some(i) => i as i64,
        None => return [0, 0, -1, -1],
    };
    let bottom = (h_u - 1
        - match row_counts.iter().rev().position(|&c| c > row_limit) {
            Some(i) => i,
            None => return [0, 0, -1, -1],
        }) as i64;
    [left, top, right.max(left), bottom.max(top)]
}

/// Intensity mask box: pixels below `min(borderMean - borderStd*(0.25 +
/// bias), borderMean - 3)` vote for content; tightened with 0.8% limits.
pub fn intensity_mask_box(gray: &GrayImage, border_mean: f64, border_std: f64, bias: f64) -> Box4 {
    let (w, h) = gray.dimensions();
    let threshold = (border_mean - border_std * (0.25 + bias)).min(border_mean - 3.0);
    let below: Vec<bool> = gray.pixels().map(|p| (p.0[0] as f64) < threshold).collect();
    let col_limit = (2u32).max((0.008 * w as f64).round() as u32);
    let row_limit = (2u32).max((0.008 * h as f64).round() as u32);
    tighten_by_projection(&below, w, h, col_limit, row_limit)
}

/// Edge box: Sobel-magnitude pixels above `max(8, mean + std*edgeScale)`
/// vote for content; tightened with 0.4% limits.
pub fn edge_box(gray: &GrayImage, edge_scale: f64) -> Box4 {
    let (w, h) = gray.dimensions();
    let magnitudes = sobel_gradients(gray);
    let values: Vec<f64> = magnitudes.pixels().map(|p| p.0[0] as f64).collect();
    let mean = values.iter().sum::<f64>() / values.len().max(1) as f64;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len().max(1) as f64;
    let std = variance.sqrt();
    let threshold = (mean + std * edge_scale).max(8.0);
    let below: Vec<bool> = values.iter().map(|&v| v > threshold).collect(); // "above threshold" counts as content here
    let col_limit = (2u32).max((0.004 * w as f64).round() as u32);
    let row_limit = (2u32).max((0.004 * h as f64).round() as u32);
    tighten_by_projection(&below, w, h, col_limit, row_limit)
}

pub fn union_box(a: Box4, b: Box4) -> Box4 {
    [a[0].min(b[0]), a[1].min(b[1]), a[2].max(b[2]), a[3].max(b[3])]
}

/// Flags set while unioning the intensity and edge boxes, mirroring
/// `CorrectionsRecord`'s mask-related fields.
#[derive(Debug, Clone, Copy, Default)]
pub struct MaskUnionFlags {
    pub edge_fallback_applied: bool,
    pub edge_anchor_applied: bool,
    pub content_bounds_clamped: bool,
}

/// Unions the intensity and edge boxes with the relax/anchor/clamp
/// fallback ladder from spec §4.4, returning the final combined box.
pub fn compute_combined_box(
    gray: &GrayImage,
    border_mean: f64,
    border_std: f64,
    bias: f64,
    edge_scale: f64,
    content_bounds: Box4,
) -> (Box4, MaskUnionFlags) {
    let (w, h) = gray.dimensions();
    let mut flags = MaskUnionFlags::default();

    let intensity = intensity_mask_box(gray, border_mean, border_std, bias);
    let intensity_coverage = box_area_ratio(intensity, w, h);
    let mut edge = edge_box(gray, edge_scale);
    let mut combined = union_box(intensity, edge);
    let mut combined_coverage = box_area_ratio(combined, w, h);

    if intensity_coverage < 0.6 || combined_coverage < 0.45 {
        flags.edge_fallback_applied = true;
        let relaxed_intensity = intensity_mask_box(gray, border_mean, border_std, bias - 0.2);
        edge = edge_box(gray, edge_scale * 0.85);
        combined = union_box(relaxed_intensity, edge);
        combined_coverage = box_area_ratio(combined, w, h);
    }

    if combined_coverage < 0.5 {
        flags.edge_anchor_applied = true;
        let anchor_edge = edge_box(gray, edge_scale * 0.6);
        combined = union_box(combined, anchor_edge);
        combined_coverage = box_area_ratio(combined, w, h);
    }

    if combined_coverage < 0.35 {
        flags.content_bounds_clamped = true;
        combined = content_bounds;
    }

    (combined, flags)
}

/// Trims `round(0.75 * shadowWidthPx * shadowTrimScale)` pixels inward on
/// the shadow side when the shadow is confidently present (spec §4.4
/// "Shadow-side trim").
pub fn trim_shadow_side(box_: Box4, shadow: &ShadowDescriptor, shadow_trim_scale: f64) -> Box4 {
    if !shadow.present || shadow.confidence <= 0.25 {
        return box_;
    }
    let trim = (0.75 * shadow.width_px * shadow_trim_scale).round() as i64;
    let [x0, y0, x1, y1] = box_;
    match shadow.side {
        ShadowSide::Left => [x0 + trim, y0, x1, y1],
        ShadowSide::Right => [x0, y0, x1 - trim, y1],
        ShadowSide::Top => [x0, y0 + trim, x1, y1],
        ShadowSide::Bottom => [x0, y0, x1, y1 - trim],
        ShadowSide::None => box_,
    }
}

/// Expands `box_` by the adaptive padding amount, then pads the short
/// side to bring the aspect ratio toward `target_aspect` if drift is
/// within tolerance (spec §4.4 "Padding and aspect alignment").
///
/// Returns the (possibly padded) box, whether aspect padding was
/// applied, and whether drift exceeded tolerance (the
/// `aspect-drift-too-high` reason).
pub fn pad_and_align(
    box_: Box4,
    image_w: u32,
    image_h: u32,
    min_w: u32,
    min_h: u32,
    bleed_px: f64,
    trim_px: f64,
    adaptive_padding_px: f64,
    target_aspect: f64,
    max_aspect_ratio_drift: f64,
) -> (Box4, bool, bool) {
    let padding = (12.0_f64)
        .max(0.004 * min_w.min(min_h) as f64 + adaptive_padding_px + 0.6 * bleed_px.max(trim_px));
    let pad = padding.round() as i64;
    let [x0, y0, x1, y1] = box_;
    let expanded = [
        (x0 - pad).max(0),
        (y0 - pad).max(0),
        (x1 + pad).min(image_w as i64 - 1),
        (y1 + pad).min(image_h as i64 - 1),
    ];

    let width = (expanded[2] - expanded[0] + 1) as f64;
    let height = (expanded[3] - expanded[1] + 1) as f64;
    if width <= 0.0 || height <= 0.0 {
        return (expanded, false, false);
    }
    let current_aspect = width / height;
    let drift = (current_aspect - target_aspect).abs() / target_aspect;

    if drift > max_aspect_ratio_drift {
        return (expanded, false, true);
    }

    let mut out = expanded;
    if current_aspect < target_aspect {
        // too tall/narrow: pad width
        let target_width = height * target_aspect;
        let add = ((target_width - width) / 2.0).round() as i64;
        out[0] = (out[0] - add).max(0);
        out[2] = (out[2] + add).min(image_w as i64 - 1);
    } else if current_aspect > target_aspect {
        // too wide/short: pad height
        let target_height = width / target_aspect;
        let add = ((target_height - height) / 2.0).round() as i64;
        out[1] = (out[1] - add).max(0);
        out[3] = (out[3] + add).min(image_h as i64 - 1);
    }
    (out, true, false)
}

/// Snaps `box_` toward the book-prior median trim box when within
/// tolerance and the resulting box still contains the combined mask
/// (spec §4.4 "Book-prior snap").
pub fn book_snap(box_: Box4, combined_mask: Box4, priors: &BookModel, max_trim_drift_px: f64) -> (Box4, bool) {
    let median = priors.trim_box_px;
    let chebyshev = box_
        .iter()
        .zip(median.iter())
        .map(|(a, b)| (a - b).abs())
        .max()
        .unwrap_or(i64::MAX);
    if (chebyshev as f64) > max_trim_drift_px {
        return (box_, false);
    }

    if contains(median, combined_mask) {
        return (median, true);
    }

    let box_cx = (box_[0] + box_[2]) / 2;
    let box_cy = (box_[1] + box_[3]) / 2;
    let median_cx = (median[0] + median[2]) / 2;
    let median_cy = (median[1] + median[3]) / 2;
    let dx = median_cx - box_cx;
    let dy = median_cy - box_cy;
    let translated = [box_[0] + dx, box_[1] + dy, box_[2] + dx, box_[3] + dy];

    if contains(translated, combined_mask) {
        (translated, true)
    } else {
        (box_, false)
    }
}

fn contains(outer: Box4, inner: Box4) -> bool {
    outer[0] <= inner[0] && outer[1] <= inner[1] && outer[2] >= inner[2] && outer[3] >= inner[3]
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    fn page_with_margin(w: u32, h: u32, margin: u32) -> GrayImage {
        let mut img = GrayImage::from_pixel(w, h, Luma([250]));
        for y in margin..h - margin {
            for x in margin..w - margin {
                img.put_pixel(x, y, Luma([20]));
            }
        }
        img
    }

    #[test]
    fn border_stats_reads_high_mean_on_white_margin() {
        let img = page_with_margin(200, 200, 20);
        let (mean, _std) = border_stats(&img);
        assert!(mean > 200.0, "mean={mean}");
    }

    #[test]
    fn intensity_mask_box_excludes_white_margin() {
        let img = page_with_margin(200, 200, 20);
        let (mean, std) = border_stats(&img);
        let box_ = intensity_mask_box(&img, mean, std, 0.0);
        assert!(box_[0] > 0 && box_[1] > 0);
        assert!(box_[2] < 199 && box_[3] < 199);
    }

    #[test]
    fn union_box_takes_outer_extent() {
        let a = [10, 10, 50, 50];
        let b = [5, 20, 60, 40];
        assert_eq!(union_box(a, b), [5, 10, 60, 50]);
    }

    #[test]
    fn trim_shadow_side_no_op_when_absent() {
        let shadow = ShadowDescriptor::default();
        let box_ = [0, 0, 99, 99];
        assert_eq!(trim_shadow_side(box_, &shadow, 1.0), box_);
    }

    #[test]
    fn trim_shadow_side_trims_left_edge() {
        let shadow = ShadowDescriptor {
            present: true,
            side: ShadowSide::Left,
            width_px: 40.0,
            confidence: 0.6,
            darkness: 30.0,
        };
        let box_ = [0, 0, 199, 199];
        let trimmed = trim_shadow_side(box_, &shadow, 1.0);
        assert_eq!(trimmed[0], 30); // round(0.75 * 40)
    }

    #[test]
    fn pad_and_align_pads_short_side_within_tolerance() {
        let (box_, padded, drift_too_high) =
            pad_and_align([10, 10, 109, 209], 400, 400, 400, 400, 10.0, 0.0, 0.0, 1.0, 0.1);
        assert!(!drift_too_high);
        assert!(padded);
        let w = (box_[2] - box_[0] + 1) as f64;
        let h = (box_[3] - box_[1] + 1) as f64;
        assert!((w / h - 1.0).abs() < 0.02, "aspect={}", w / h);
    }

    #[test]
    fn pad_and_align_flags_excessive_drift() {
        let (_box_, padded, drift_too_high) =
            pad_and_align([0, 0, 9, 990], 1000, 1000, 1000, 1000, 0.0, 0.0, 0.0, 3.0, 0.05);
        assert!(drift_too_high);
        assert!(!padded);
    }

    #[test]
    fn book_snap_uses_median_when_it_contains_mask() {
        let priors = BookModel {
            trim_box_px: [5, 5, 195, 195],
            trim_box_dispersion: [1.0; 4],
            content_box_px: [10, 10, 190, 190],
            content_box_dispersion: [1.0; 4],
            running_heads: vec![],
            folio: None,
            ornaments: vec![],
            baseline_grid: None,
        };
        let (snapped, did_snap) = book_snap([8, 8, 192, 192], [20, 20, 180, 180], &priors, 12.0);
        assert!(did_snap);
        assert_eq!(snapped, [5, 5, 195, 195]);
    }
}
