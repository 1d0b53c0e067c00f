//! Baseline and column metrics computed from row/column ink projections
//! (spec §4.4 "Baseline metrics", "Column metrics").

use image::GrayImage;

use crate::model::BaselineMetrics;

fn clamp01(v: f64) -> f64 {
    v.clamp(0.0, 1.0)
}

fn mean_std(values: &[f64]) -> (f64, f64) {
    if values.is_empty() {
        return (0.0, 0.0);
    }
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64;
    (mean, variance.sqrt())
}

fn median(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

fn mad(values: &[f64], center: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let deviations: Vec<f64> = values.iter().map(|v| (v - center).abs()).collect();
    median(&deviations)
}

/// Ink density per row, darker rows (more text) producing a higher value.
fn row_ink(gray: &GrayImage) -> Vec<f64> {
    let (w, h) = gray.dimensions();
    let mut out = Vec::with_capacity(h as usize);
    for y in 0..h {
        let mut sum = 0.0;
        for x in 0..w {
            sum += 255.0 - gray.get_pixel(x, y).0[0] as f64;
        }
        out.push(sum / w.max(1) as f64);
    }
    out
}

fn col_ink(gray: &GrayImage) -> Vec<f64> {
    let (w, h) = gray.dimensions();
    let mut out = Vec::with_capacity(w as usize);
    for x in 0..w {
        let mut sum = 0.0;
        for y in 0..h {
            sum += 255.0 - gray.get_pixel(x, y).0[0] as f64;
        }
        out.push(sum / h.max(1) as f64);
    }
    out
}

/// Finds indices whose value exceeds `mean + factor * std`, collapsing
/// runs of consecutive qualifying indices into their midpoint (a single
/// peak per text line / column gap).
fn find_peaks(profile: &[f64], factor: f64) -> Vec<u32> {
    let (mean, std) = mean_std(profile);
    let threshold = mean + factor * std;
    let mut peaks = Vec::new();
    let mut run_start: Option<usize> = None;
    for (i, &v) in profile.iter().enumerate() {
        if v > threshold {
            if run_start.is_none() {
                run_start = Some(i);
            }
        } else if let Some(start) = run_start.take() {
            peaks.push(((start + i - 1) / 2) as u32);
        }
    }
    if let Some(start) = run_start {
        peaks.push(((start + profile.len() - 1) / 2) as u32);
    }
    peaks
}

/// Computes baseline metrics from the row ink projection: peak rows above
/// `mean + 0.6*std`, their spacing (median + MAD), and a straightness
/// residual/confidence summary.
pub fn baseline_metrics(gray: &GrayImage) -> BaselineMetrics {
    let profile = row_ink(gray);
    if profile.len() < 4 {
        return BaselineMetrics {
            median_spacing_px: None,
            spacing_mad: None,
            line_straightness_residual: 0.0,
            confidence: 0.0,
            peaks_y: None,
        };
    }

    let peaks = find_peaks(&profile, 0.6);
    if peaks.len() < 2 {
        return BaselineMetrics {
            median_spacing_px: None,
            spacing_mad: None,
            line_straightness_residual: 0.0,
            confidence: 0.0,
            peaks_y: Some(peaks),
        };
    }

    let spacings: Vec<f64> = peaks.windows(2).map(|w| (w[1] - w[0]) as f64).collect();
    let median_spacing = median(&spacings);
    let spacing_mad = mad(&spacings, median_spacing);

    // Sharpness: how tall the peaks are relative to the surrounding
    // profile, a proxy for well-separated, straight text lines.
    let (mean, std) = mean_std(&profile);
    let peak_sharpness = if std > 0.0 {
        clamp01(
            peaks
                .iter()
                .map(|&p| (profile[p as usize] - mean) / (3.0 * std))
                .sum::<f64>()
                / peaks.len() as f64,
        )
    } else {
        0.0
    };

    let consistency = if median_spacing > 0.0 {
        clamp01(1.0 - spacing_mad / median_spacing)
    } else {
        0.0
    };

    // A handful of evenly spaced peaks is as informative as a page full of
    // them; ten peaks already saturates the term.
    let peak_count_score = clamp01(peaks.len() as f64 / 10.0);
    let confidence = clamp01(0.4 * consistency + 0.35 * peak_sharpness + 0.25 * peak_count_score);
    let line_straightness_residual = clamp01(1.0 - consistency);

    BaselineMetrics {
        median_spacing_px: Some(median_spacing),
        spacing_mad: Some(spacing_mad),
        line_straightness_residual,
        confidence,
        peaks_y: Some(peaks),
    }
}

/// Counts column gaps using the same peak-finding approach on the column
/// ink projection (threshold `mean + 0.7*std`), interpreted as
/// column-count minus one gap-peak per boundary.
pub fn column_count(gray: &GrayImage) -> u32 {
    let profile = col_ink(gray);
    if profile.len() < 4 {
        return 1;
    }
    let gaps = find_peaks(
        &profile.iter().map(|v| -v).collect::<Vec<_>>(),
        0.7,
    );
    (gaps.len() as u32 + 1).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    fn striped_rows(width: u32, height: u32, period: u32) -> GrayImage {
        let mut img = GrayImage::from_pixel(width, height, Luma([255]));
        let mut y = period / 2;
        while y < height {
            for x in 0..width {
                img.put_pixel(x, y, Luma([20]));
            }
            y += period;
        }
        img
    }

    #[test]
    fn detects_regular_line_spacing() {
        let img = striped_rows(200, 400, 20);
        let metrics = baseline_metrics(&img);
        let spacing = metrics.median_spacing_px.expect("should find spacing");
        assert!((spacing - 20.0).abs() < 4.0, "spacing={spacing}");
        assert!(metrics.confidence > 0.3);
    }

    #[test]
    fn blank_page_has_no_spacing() {
        let img = GrayImage::from_pixel(100, 100, Luma([255]));
        let metrics = baseline_metrics(&img);
        assert!(metrics.median_spacing_px.is_none());
        assert_eq!(metrics.confidence, 0.0);
    }

    #[test]
    fn single_column_page_reports_one_column() {
        let img = GrayImage::from_pixel(200, 200, Luma([200]));
        assert_eq!(column_count(&img), 1);
    }

    #[test]
    fn two_column_page_with_dark_gutter_reports_two_columns() {
        let mut img = GrayImage::from_pixel(200, 200, Luma([30]));
        for y in 0..200 {
            for x in 95..105 {
                img.put_pixel(x, y, Luma([250]));
            }
        }
        assert!(column_count(&img) >= 2);
    }
}
