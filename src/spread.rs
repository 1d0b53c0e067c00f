//! Spread splitter: detects a dark central gutter column on wide pages
//! and splits the page into two children (spec §4.3).
//!
//! Shape grounded on the double-page-spread detector in the example
//! pack (`other_examples/…doublepage.rs.rs`): downscale → grayscale
//! column projection → smoothing/widening around the darkest column →
//! confidence-gated split, with this spec's own darkness/symmetry/
//! center-distance confidence formula substituted for that file's
//! valley-scoring formula.

use image::{imageops::FilterType, DynamicImage, GenericImageView, GrayImage};

use crate::model::{Page, SpreadSide, SpreadSplitRecord};

const MIN_ASPECT_RATIO: f64 = 1.25;
const PREVIEW_MAX_WIDTH: u32 = 320;
const MIN_DARKNESS: f64 = 10.0;
const BAND_START: f64 = 0.40;
const BAND_END: f64 = 0.60;

/// Measurements taken while looking for a gutter; `None` from [`measure`]
/// means "this page is not a spread candidate".
#[derive(Debug, Clone)]
pub struct SpreadMeasurement {
    pub start_col_ratio: f64,
    pub end_col_ratio: f64,
    pub darkness: f64,
    pub symmetry: f64,
    pub center_distance: f64,
    pub confidence: f64,
}

fn column_means(gray: &GrayImage) -> Vec<f64> {
    let (w, h) = gray.dimensions();
    let mut sums = vec![0.0f64; w as usize];
    for y in 0..h {
        for x in 0..w {
            sums[x as usize] += gray.get_pixel(x, y).0[0] as f64;
        }
    }
    let h = h as f64;
    sums.iter().map(|s| s / h).collect()
}

/// Evaluates whether `image` looks like a two-page spread with a dark
/// gutter, following spec §4.3's exact formulas.
pub fn measure(image: &DynamicImage) -> Option<SpreadMeasurement> {
    let (width, height) = image.dimensions();
    if width == 0 || height == 0 {
        return None;
    }
    let aspect_ratio = width as f64 / height as f64;
    if aspect_ratio < MIN_ASPECT_RATIO {
        return None;
    }

    let preview = if width > PREVIEW_MAX_WIDTH {
        image.resize(PREVIEW_MAX_WIDTH, u32::MAX, FilterType::Triangle)
    } else {
        image.clone()
    };
    let gray = preview.to_luma8();
    let (pw, _) = gray.dimensions();
    if pw < 8 {
        return None;
    }

    let means = column_means(&gray);
    let global_mean = means.iter().sum::<f64>() / means.len() as f64;

    let band_lo = ((pw as f64) * BAND_START).floor() as usize;
    let band_hi = ((pw as f64) * BAND_END).ceil() as usize;
    let band_hi = band_hi.min(means.len().saturating_sub(1)).max(band_lo);

    let (min_idx, min_mean) = (band_lo..=band_hi)
        .map(|i| (i, means[i]))
        .fold((band_lo, f64::MAX), |acc, (i, m)| if m < acc.1 { (i, m) } else { acc });

    let darkness = global_mean - min_mean;
    if darkness < MIN_DARKNESS {
        return None;
    }

    let widen_ceiling = min_mean + 0.5 * darkness;
    let mut start = min_idx;
    while start > 0 && means[start - 1] < widen_ceiling {
        start -= 1;
    }
    let mut end = min_idx;
    while end + 1 < means.len() && means[end + 1] < widen_ceiling {
        end += 1;
    }

    let left_density: f64 = {
        let slice = &means[0..start.max(1)];
        slice.iter().map(|m| (global_mean - m).max(0.0)).sum::<f64>() / slice.len() as f64
    };
    let right_density: f64 = {
        let slice = &means[(end + 1).min(means.len() - 1)..];
        if slice.is_empty() {
            0.0
        } else {
            slice.iter().map(|m| (global_mean - m).max(0.0)).sum::<f64>() / slice.len() as f64
        }
    };
    let symmetry = if global_mean.abs() < f64::EPSILON {
        0.0
    } else {
        1.0 - (left_density - right_density).abs() / global_mean
    };

    let gutter_center = (start + end) as f64 / 2.0;
    let midpoint = (means.len() - 1) as f64 / 2.0;
    let center_distance = if midpoint.abs() < f64::EPSILON {
        0.0
    } else {
        (gutter_center - midpoint).abs() / midpoint
    };

    let confidence =
        (0.6 * (darkness / 35.0) + 0.3 * symmetry + 0.1 * (1.0 - center_distance)).clamp(0.0, 1.0);

    Some(SpreadMeasurement {
        start_col_ratio: start as f64 / means.len() as f64,
        end_col_ratio: (end + 1) as f64 / means.len() as f64,
        darkness,
        symmetry,
        center_distance: center_distance.clamp(0.0, 1.0),
        confidence,
    })
}

/// Result of a confirmed spread split: two child pages and their cropped
/// rasters, plus the gutter ratios and per-page confidence recorded in
/// the sidecar / review queue.
pub struct SpreadSplitOutcome {
    pub left_page: Page,
    pub right_page: Page,
    pub left_image: DynamicImage,
    pub right_image: DynamicImage,
    pub left_record: SpreadSplitRecord,
    pub right_record: SpreadSplitRecord,
}

/// Crops `image` into left/right halves around the gutter band described
/// by `measurement`, with a margin of `max(8, 0.3 * gutterWidth)` pixels
/// outside the darkened band on the inner edge of each half.
pub fn split(page: &Page, image: &DynamicImage, measurement: &SpreadMeasurement) -> SpreadSplitOutcome {
    let (width, height) = image.dimensions();
    let start_px = (measurement.start_col_ratio * width as f64).round() as u32;
    let end_px = (measurement.end_col_ratio * width as f64).round().max(start_px as f64 + 1.0) as u32;
    let gutter_width = (end_px - start_px) as f64;
    let margin = (8.0_f64).max(0.3 * gutter_width).round() as u32;

    let left_end = start_px.saturating_sub(margin).min(width);
    let right_start = (end_px + margin).min(width);

    let left_image = image.crop_imm(0, 0, left_end.max(1), height);
    let right_image = image.crop_imm(right_start.min(width - 1), 0, width - right_start.min(width - 1), height);

    let left_page = page.split_child(SpreadSide::Left);
    let right_page = page.split_child(SpreadSide::Right);

    let left_record = SpreadSplitRecord {
        source_page_id: page.id.clone(),
        side: SpreadSide::Left,
        confidence: measurement.confidence,
        start_ratio: measurement.start_col_ratio,
        end_ratio: measurement.end_col_ratio,
    };
    let right_record = SpreadSplitRecord {
        source_page_id: page.id.clone(),
        side: SpreadSide::Right,
        confidence: measurement.confidence,
        start_ratio: measurement.start_col_ratio,
        end_ratio: measurement.end_col_ratio,
    };

    SpreadSplitOutcome {
        left_page,
        right_page,
        left_image,
        right_image,
        left_record,
        right_record,
    }
}

/// Convenience entry point: measures and, if confidence clears
/// `confidence_threshold`, splits. Returns `None` when the page is not a
/// spread or confidence is too low.
pub fn try_split(page: &Page, image: &DynamicImage, confidence_threshold: f64) -> Option<SpreadSplitOutcome> {
    let measurement = measure(image)?;
    if measurement.confidence < confidence_threshold {
        return None;
    }
    Some(split(page, image, &measurement))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    fn spread_fixture(width: u32, height: u32, gutter_center: u32, gutter_half_width: u32) -> DynamicImage {
        let mut img = RgbImage::new(width, height);
        for y in 0..height {
            for x in 0..width {
                let dist = (x as i64 - gutter_center as i64).unsigned_abs() as u32;
                let value = if dist < gutter_half_width { 30 } else { 230 };
                img.put_pixel(x, y, Rgb([value, value, value]));
            }
        }
        DynamicImage::ImageRgb8(img)
    }

    #[test]
    fn narrow_page_is_not_a_spread_candidate() {
        let img = spread_fixture(400, 400, 200, 10);
        assert!(measure(&img).is_none());
    }

    #[test]
    fn rejects_pages_with_insufficient_gutter_darkness() {
        let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(900, 600, Rgb([200, 200, 200])));
        assert!(measure(&img).is_none());
    }

    #[test]
    fn detects_a_strong_central_gutter() {
        let img = spread_fixture(1200, 800, 600, 30);
        let measurement = measure(&img).expect("should detect gutter");
        assert!(measurement.confidence > 0.5, "confidence={}", measurement.confidence);
        assert!(measurement.center_distance < 0.2);
    }

    #[test]
    fn split_produces_left_and_right_children_with_expected_ids() {
        let page = Page::new("spread1".into(), "spread1.png".into(), "/scans/spread1.png".into(), Some("abc".into()));
        let img = spread_fixture(1200, 800, 600, 30);
        let measurement = measure(&img).unwrap();
        let outcome = split(&page, &img, &measurement);

        assert_eq!(outcome.left_page.id, "spread1_L");
        assert_eq!(outcome.right_page.id, "spread1_R");
        assert_eq!(outcome.left_page.checksum.as_deref(), Some("abc:L"));
        assert_eq!(outcome.right_page.checksum.as_deref(), Some("abc:R"));
        assert!(outcome.left_image.width() > 0);
        assert!(outcome.right_image.width() > 0);
    }
}
