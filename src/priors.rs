//! Book-priors builder: derives corpus-wide trim/content box priors and
//! recurring running-head / folio / ornament templates from a sample of
//! already-normalized pages (spec §4.5 "Book priors").

use image::{imageops::FilterType, DynamicImage, GenericImageView, GrayImage};

use crate::model::{
    BaselineGridSummary, BookModel, Box4, FolioModel, FolioPositionBand, NormalizationResult,
    OrnamentAnchor, RunningHeadTemplate, SpreadSide,
};

const RUNNING_HEAD_BAND: (f64, f64) = (0.02, 0.14);
const FOLIO_BAND: (f64, f64) = (0.86, 0.98);
const ORNAMENT_BAND: (f64, f64) = (0.14, 0.24);
const ORNAMENT_VARIANCE_FLOOR: f64 = 120.0;
const HAMMING_CLUSTER_RADIUS: u32 = 6;

fn median(values: &mut [f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        (values[mid - 1] + values[mid]) / 2.0
    } else {
        values[mid]
    }
}

fn mad(values: &[f64], center: f64) -> f64 {
    let mut deviations: Vec<f64> = values.iter().map(|v| (v - center).abs()).collect();
    median(&mut deviations)
}

/// Median and MAD of each of the four box coordinates across a sample.
fn median_mad_box(boxes: &[Box4]) -> (Box4, [f64; 4]) {
    let mut median_box = [0i64; 4];
    let mut dispersion = [0.0f64; 4];
    for axis in 0..4 {
        let mut values: Vec<f64> = boxes.iter().map(|b| b[axis] as f64).collect();
        let center = median(&mut values);
        median_box[axis] = center.round() as i64;
        dispersion[axis] = mad(&values, center);
    }
    (median_box, dispersion)
}

/// Band bounds in pixel rows for a fractional `[start, end)` of height.
fn band_rows(height: u32, band: (f64, f64)) -> (u32, u32) {
    let y0 = (height as f64 * band.0).floor() as u32;
    let y1 = ((height as f64 * band.1).ceil() as u32).max(y0 + 1).min(height);
    (y0, y1)
}

fn region_variance(gray: &GrayImage, x0: u32, y0: u32, x1: u32, y1: u32) -> f64 {
    if x1 <= x0 || y1 <= y0 {
        return 0.0;
    }
    let mut values = Vec::new();
    for y in y0..y1 {
        for x in x0..x1 {
            values.push(gray.get_pixel(x, y).0[0] as f64);
        }
    }
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64
}

/// A 9x8 grayscale difference hash: downsamples the region to 9x8,
/// compares each row's adjacent pixels, and packs the 64 comparisons into
/// a `u64`.
fn dhash_region(gray: &GrayImage, x0: u32, y0: u32, x1: u32, y1: u32) -> Option<u64> {
    if x1 <= x0 || y1 <= y0 {
        return None;
    }
    let cropped = image::imageops::crop_imm(gray, x0, y0, x1 - x0, y1 - y0).to_image();
    let small = image::imageops::resize(&cropped, 9, 8, FilterType::Triangle);

    let mut hash = 0u64;
    let mut bit = 0u32;
    for row in 0..8u32 {
        for col in 0..8u32 {
            let left = small.get_pixel(col, row).0[0];
            let right = small.get_pixel(col + 1, row).0[0];
            if left > right {
                hash |= 1u64 << bit;
            }
            bit += 1;
        }
    }
    Some(hash)
}

fn hamming(a: u64, b: u64) -> u32 {
    (a ^ b).count_ones()
}

struct HashCluster {
    representative: u64,
    bbox_sum: [i64; 4],
    count: usize,
}

/// Greedily clusters observed `(hash, bbox)` pairs by Hamming distance,
/// keeping only clusters that recur at least `threshold` times.
fn cluster_hashes(observations: &[(u64, Box4)], threshold: usize) -> Vec<(u64, Box4, usize)> {
    let mut clusters: Vec<HashCluster> = Vec::new();
    for &(hash, bbox) in observations {
        if let Some(cluster) = clusters
            .iter_mut()
            .find(|c| hamming(c.representative, hash) <= HAMMING_CLUSTER_RADIUS)
        {
            cluster.count += 1;
            for i in 0..4 {
                cluster.bbox_sum[i] += bbox[i];
            }
        } else {
            clusters.push(HashCluster {
                representative: hash,
                bbox_sum: bbox,
                count: 1,
            });
        }
    }

    clusters
        .into_iter()
        .filter(|c| c.count >= threshold)
        .map(|c| {
            let n = c.count as i64;
            let avg_bbox = [
                c.bbox_sum[0] / n,
                c.bbox_sum[1] / n,
                c.bbox_sum[2] / n,
                c.bbox_sum[3] / n,
            ];
            (c.representative, avg_bbox, c.count)
        })
        .collect()
}

/// One normalized sample page plus its raster, the unit the builder
/// consumes.
pub struct PriorSample<'a> {
    pub result: &'a NormalizationResult,
    pub image: &'a DynamicImage,
}

/// Builds corpus-wide book priors from a sample of normalized pages.
/// Returns `None` if fewer than two samples are given, since dispersion
/// and recurrence are meaningless on a single page.
pub fn build_book_model(samples: &[PriorSample<'_>]) -> Option<BookModel> {
    if samples.len() < 2 {
        return None;
    }
    let n = samples.len();
    let recurrence_threshold = (2usize).max((0.2 * n as f64).ceil() as usize);

    let trim_boxes: Vec<Box4> = samples.iter().map(|s| s.result.crop_box).collect();
    let content_boxes: Vec<Box4> = samples.iter().map(|s| s.result.mask_box).collect();
    let (trim_box_px, trim_box_dispersion) = median_mad_box(&trim_boxes);
    let (content_box_px, content_box_dispersion) = median_mad_box(&content_boxes);

    let mut running_head_obs = Vec::new();
    let mut folio_obs = Vec::new();
    let mut ornament_obs = Vec::new();

    for sample in samples {
        let gray = sample.image.to_luma8();
        let (w, h) = gray.dimensions();

        let (ry0, ry1) = band_rows(h, RUNNING_HEAD_BAND);
        if let Some(hash) = dhash_region(&gray, 0, ry0, w, ry1) {
            running_head_obs.push((hash, [0, ry0 as i64, w as i64 - 1, ry1 as i64 - 1]));
        }

        let (fy0, fy1) = band_rows(h, FOLIO_BAND);
        if let Some(hash) = dhash_region(&gray, 0, fy0, w, fy1) {
            folio_obs.push((hash, [0, fy0 as i64, w as i64 - 1, fy1 as i64 - 1]));
        }

        let (oy0, oy1) = band_rows(h, ORNAMENT_BAND);
        if region_variance(&gray, 0, oy0, w, oy1) > ORNAMENT_VARIANCE_FLOOR {
            if let Some(hash) = dhash_region(&gray, 0, oy0, w, oy1) {
                ornament_obs.push((hash, [0, oy0 as i64, w as i64 - 1, oy1 as i64 - 1]));
            }
        }
    }

    let running_heads: Vec<RunningHeadTemplate> = cluster_hashes(&running_head_obs, recurrence_threshold)
        .into_iter()
        .enumerate()
        .map(|(i, (hash, bbox, count))| RunningHeadTemplate {
            id: format!("running-head-{i}"),
            bbox,
            hash,
            confidence: (count as f64 / n as f64).clamp(0.0, 1.0),
        })
        .collect();

    let ornaments: Vec<OrnamentAnchor> = cluster_hashes(&ornament_obs, recurrence_threshold)
        .into_iter()
        .map(|(hash, bbox, count)| OrnamentAnchor {
            hash,
            bbox,
            confidence: (count as f64 / n as f64).clamp(0.0, 1.0),
        })
        .collect();

    let folio_clusters = cluster_hashes(&folio_obs, recurrence_threshold);
    let folio = if folio_clusters.is_empty() {
        None
    } else {
        let position_bands = folio_clusters
            .iter()
            .map(|(_, bbox, count)| {
                let center_x = (bbox[0] + bbox[2]) / 2;
                let side = if center_x * 2 < trim_box_px[2] {
                    SpreadSide::Left
                } else {
                    SpreadSide::Right
                };
                FolioPositionBand {
                    side,
                    band: [bbox[1], bbox[3]],
                    confidence: (*count as f64 / n as f64).clamp(0.0, 1.0),
                }
            })
            .collect();
        Some(FolioModel { position_bands })
    };

    let spacing_samples: Vec<f64> = samples
        .iter()
        .filter_map(|s| s.result.baseline.median_spacing_px)
        .collect();
    let baseline_grid = if spacing_samples.len() >= 2 {
        let mut values = spacing_samples.clone();
        let spacing_px = median(&mut values);
        let offset_px = samples
            .iter()
            .filter_map(|s| s.result.baseline.peaks_y.as_ref().and_then(|p| p.first()))
            .map(|&v| (v as f64) % spacing_px.max(1.0))
            .sum::<f64>()
            / samples.len().max(1) as f64;
        let confidence = samples.iter().map(|s| s.result.baseline.confidence).sum::<f64>()
            / samples.len() as f64;
        Some(BaselineGridSummary {
            spacing_px,
            offset_px,
            confidence,
        })
    } else {
        None
    };

    Some(BookModel {
        trim_box_px,
        trim_box_dispersion,
        content_box_px,
        content_box_dispersion,
        running_heads,
        folio,
        ornaments,
        baseline_grid,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        BaselineMetrics, CorrectionsRecord, DimensionSource, NormalizationStats, ShadowDescriptor,
        WarpDescriptor,
    };
    use image::{Luma, Rgb, RgbImage};
    use std::path::PathBuf;

    fn make_result(crop: Box4, mask: Box4) -> NormalizationResult {
        NormalizationResult {
            page_id: "p".into(),
            output_path: PathBuf::new(),
            crop_box: crop,
            mask_box: mask,
            dimensions_mm: (210.0, 297.0),
            dpi: 300.0,
            dpi_source: DimensionSource::Inferred,
            skew_angle: 0.0,
            skew_residual: 0.0,
            shadow: ShadowDescriptor::default(),
            shading: None,
            warp: WarpDescriptor::default(),
            corrections: CorrectionsRecord::default(),
            stats: NormalizationStats {
                border_mean: 240.0,
                border_std: 5.0,
                mask_coverage: 0.6,
                skew_confidence: 0.5,
                shadow_score: 0.0,
                baseline_consistency: 0.5,
                column_count: 1,
                illumination_residual: None,
            },
            baseline: BaselineMetrics {
                median_spacing_px: Some(24.0),
                spacing_mad: Some(1.0),
                line_straightness_residual: 0.1,
                confidence: 0.8,
                peaks_y: Some(vec![40, 64, 88]),
            },
            confidence_gate: None,
            preview_paths: vec![],
            spread_split: None,
            processing_ms: 5,
        }
    }

    fn blank_page() -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_pixel(400, 600, Rgb([240, 240, 240])))
    }

    #[test]
    fn returns_none_with_fewer_than_two_samples() {
        let result = make_result([0, 0, 399, 559], [10, 10, 389, 549]);
        let image = blank_page();
        let samples = vec![PriorSample { result: &result, image: &image }];
        assert!(build_book_model(&samples).is_none());
    }

    #[test]
    fn computes_median_trim_box_across_samples() {
        let r1 = make_result([0, 0, 399, 559], [10, 10, 389, 549]);
        let r2 = make_result([2, 2, 401, 561], [10, 10, 389, 549]);
        let r3 = make_result([4, 4, 403, 563], [10, 10, 389, 549]);
        let img = blank_page();
        let samples = vec![
            PriorSample { result: &r1, image: &img },
            PriorSample { result: &r2, image: &img },
            PriorSample { result: &r3, image: &img },
        ];
        let model = build_book_model(&samples).expect("should build a model");
        assert_eq!(model.trim_box_px, [2, 2, 401, 561]);
    }

    #[test]
    fn dhash_is_stable_for_identical_regions() {
        let gray = GrayImage::from_pixel(100, 100, Luma([128]));
        let a = dhash_region(&gray, 0, 0, 50, 50).unwrap();
        let b = dhash_region(&gray, 0, 0, 50, 50).unwrap();
        assert_eq!(a, b);
    }
}
