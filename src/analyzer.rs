//! Corpus analyzer: probes pixel dimensions, infers target physical size
//! and DPI with confidence scores, and produces per-page bounds estimates
//! (spec §4.2).

use std::path::Path;

use crate::config::PipelineConfig;
use crate::error::{Phase, PageError};
use crate::model::{CorpusSummary, DimensionSource, Page, PageBoundsEstimate};

const MM_PER_INCH: f64 = 25.4;

/// Probes one image file for pixel dimensions.
///
/// For JPEG, scans segments for a Start-Of-Frame marker rather than fully
/// decoding; for other formats, goes through the `image` crate's
/// metadata reader. On any failure, the caller substitutes the corpus's
/// target dimensions in pixels.
pub fn probe_dimensions(path: &Path) -> Option<(u32, u32)> {
    let bytes = std::fs::read(path).ok()?;
    if bytes.len() > 4 && bytes[0] == 0xFF && bytes[1] == 0xD8 {
        if let Some(dims) = probe_jpeg_sof(&bytes) {
            return Some(dims);
        }
    }
    image::ImageReader::open(path)
        .ok()?
        .with_guessed_format()
        .ok()?
        .into_dimensions()
        .ok()
}

/// Scans raw JPEG bytes for a Start-Of-Frame marker (SOF0..SOF15, except
/// the DHT/JPG extension markers) and reads width/height directly from
/// its segment, avoiding a full decode.
fn probe_jpeg_sof(bytes: &[u8]) -> Option<(u32, u32)> {
    let mut i = 2; // skip the SOI marker
    while i + 4 <= bytes.len() {
        if bytes[i] != 0xFF {
            i += 1;
            continue;
        }
        let marker = bytes[i + 1];
        // Markers with no length/payload.
        if marker == 0xD8 || marker == 0xD9 || (0xD0..=0xD7).contains(&marker) {
            i += 2;
            continue;
        }
        if i + 4 > bytes.len() {
            break;
        }
        let seg_len = u16::from_be_bytes([bytes[i + 2], bytes[i + 3]]) as usize;
        let is_sof = matches!(marker, 0xC0..=0xCF)
            && marker != 0xC4 // DHT
            && marker != 0xC8 // JPG extension
            && marker != 0xCC; // DAC
        if is_sof {
            if i + 9 > bytes.len() {
                return None;
            }
            let height = u16::from_be_bytes([bytes[i + 5], bytes[i + 6]]) as u32;
            let width = u16::from_be_bytes([bytes[i + 7], bytes[i + 8]]) as u32;
            if width > 0 && height > 0 {
                return Some((width, height));
            }
            return None;
        }
        if marker == 0xDA {
            break; // Start-Of-Scan; no SOF found before image data
        }
        i += 2 + seg_len;
    }
    None
}

fn coefficient_of_variation(samples: &[f64]) -> f64 {
    if samples.is_empty() {
        return 1.0;
    }
    let mean = samples.iter().sum::<f64>() / samples.len() as f64;
    if mean.abs() < f64::EPSILON {
        return 1.0;
    }
    let variance = samples.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / samples.len() as f64;
    variance.sqrt() / mean
}

fn clamp01(v: f64) -> f64 {
    v.clamp(0.0, 1.0)
}

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

/// Analyzes the full corpus: probes every page for pixel dimensions,
/// infers mm/DPI with confidence, and builds a [`PageBoundsEstimate`] for
/// each page.
pub fn analyze(pages: &[Page], config: &PipelineConfig) -> (CorpusSummary, Vec<PageError>) {
    let mut errors = Vec::new();
    let target_px = (
        (config.target_dimensions_mm.0 / MM_PER_INCH * config.target_dpi).round() as u32,
        (config.target_dimensions_mm.1 / MM_PER_INCH * config.target_dpi).round() as u32,
    );

    let mut widths_mm = Vec::new();
    let mut heights_mm = Vec::new();
    let mut dpis_w = Vec::new();
    let mut dpis_h = Vec::new();
    let mut probed = Vec::with_capacity(pages.len());

    for page in pages {
        match probe_dimensions(&page.original_path) {
            Some((w, h)) => {
                probed.push((page.id.clone(), Some((w, h))));
                let mm_w = w as f64 / config.target_dpi * MM_PER_INCH;
                let mm_h = h as f64 / config.target_dpi * MM_PER_INCH;
                widths_mm.push(mm_w);
                heights_mm.push(mm_h);
                dpis_w.push(w as f64 / config.target_dimensions_mm.0 * MM_PER_INCH);
                dpis_h.push(h as f64 / config.target_dimensions_mm.1 * MM_PER_INCH);
            }
            None => {
                probed.push((page.id.clone(), None));
                errors.push(PageError::for_page(
                    Phase::Analysis,
                    page.id.clone(),
                    "failed to probe pixel dimensions; falling back to target size",
                ));
            }
        }
    }

    let coverage = if pages.is_empty() {
        0.0
    } else {
        probed.iter().filter(|(_, d)| d.is_some()).count() as f64 / pages.len() as f64
    };

    let dim_stability = 1.0 - clamp01((coefficient_of_variation(&widths_mm) + coefficient_of_variation(&heights_mm)) / 2.0);
    let dpi_stability = 1.0 - clamp01((coefficient_of_variation(&dpis_w) + coefficient_of_variation(&dpis_h)) / 2.0);

    let dimensions_confidence = clamp01(coverage * dim_stability);
    let dpi_confidence = clamp01(coverage * dpi_stability);

    let mut widths_mm_sorted = widths_mm.clone();
    let mut heights_mm_sorted = heights_mm.clone();
    let inferred_dimensions_mm = if widths_mm.is_empty() {
        None
    } else {
        Some((median(&mut widths_mm_sorted), median(&mut heights_mm_sorted)))
    };
    let mut dpis_all: Vec<f64> = dpis_w.iter().chain(dpis_h.iter()).copied().collect();
    let inferred_dpi = if dpis_all.is_empty() {
        None
    } else {
        Some(median(&mut dpis_all))
    };

    let bleed_px = config.normalization.bleed_mm / MM_PER_INCH * config.target_dpi;
    let trim_px = 0.0_f64;
    let inset = bleed_px + trim_px;

    let estimates = probed
        .into_iter()
        .map(|(page_id, dims)| {
            let (width_px, height_px, source) = match dims {
                Some((w, h)) => (w, h, DimensionSource::Metadata),
                None => (target_px.0, target_px.1, DimensionSource::Fallback),
            };
            let page_bounds = [0_i64, 0, width_px as i64 - 1, height_px as i64 - 1];
            let inset_i = inset.round() as i64;
            let content_bounds = [
                inset_i.min(page_bounds[2]),
                inset_i.min(page_bounds[3]),
                (page_bounds[2] - inset_i).max(page_bounds[0]),
                (page_bounds[3] - inset_i).max(page_bounds[1]),
            ];
            PageBoundsEstimate {
                page_id,
                width_px,
                height_px,
                bleed_px,
                trim_px,
                page_bounds,
                content_bounds,
                dimension_source: source,
            }
        })
        .collect();

    let summary = CorpusSummary {
        project_id: config.project_id.clone(),
        target_dimensions_mm: config.target_dimensions_mm,
        target_size_px: target_px,
        estimates,
        inferred_dimensions_mm,
        inferred_dpi,
        dimensions_confidence,
        dpi_confidence,
    };

    (summary, errors)
}

/// A default summary used when analysis fails outright (spec §7: "the
/// orchestrator falls back to a default summary derived from target
/// dimensions"). Every page gets the target pixel size and zero
/// confidence.
pub fn fallback_summary(pages: &[Page], config: &PipelineConfig) -> CorpusSummary {
    let target_px = (
        (config.target_dimensions_mm.0 / MM_PER_INCH * config.target_dpi).round() as u32,
        (config.target_dimensions_mm.1 / MM_PER_INCH * config.target_dpi).round() as u32,
    );
    let bleed_px = config.normalization.bleed_mm / MM_PER_INCH * config.target_dpi;
    let inset_i = bleed_px.round() as i64;

    let estimates = pages
        .iter()
        .map(|page| {
            let page_bounds = [0_i64, 0, target_px.0 as i64 - 1, target_px.1 as i64 - 1];
            PageBoundsEstimate {
                page_id: page.id.clone(),
                width_px: target_px.0,
                height_px: target_px.1,
                bleed_px,
                trim_px: 0.0,
                page_bounds,
                content_bounds: [
                    inset_i.min(page_bounds[2]),
                    inset_i.min(page_bounds[3]),
                    (page_bounds[2] - inset_i).max(page_bounds[0]),
                    (page_bounds[3] - inset_i).max(page_bounds[1]),
                ],
                dimension_source: DimensionSource::Fallback,
            }
        })
        .collect();

    CorpusSummary {
        project_id: config.project_id.clone(),
        target_dimensions_mm: config.target_dimensions_mm,
        target_size_px: target_px,
        estimates,
        inferred_dimensions_mm: None,
        inferred_dpi: None,
        dimensions_confidence: 0.0,
        dpi_confidence: 0.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfigBuilder;

    #[test]
    fn jpeg_sof_probe_reads_width_height() {
        // Synthetic minimal JPEG: SOI, APP0, SOF0 (8x4), EOI.
        let mut bytes = vec![0xFF, 0xD8]; // SOI
        bytes.extend_from_slice(&[0xFF, 0xE0, 0x00, 0x10]); // APP0, length 16
        bytes.extend_from_slice(&[b'J', b'F', b'I', b'F', 0x00, 1, 1, 0, 0, 1, 0, 1, 0, 0]);
        bytes.extend_from_slice(&[0xFF, 0xC0, 0x00, 0x0B]); // SOF0, length 11
        bytes.push(8); // precision
        bytes.extend_from_slice(&4u16.to_be_bytes()); // height
        bytes.extend_from_slice(&8u16.to_be_bytes()); // width
        bytes.push(1); // component count
        bytes.extend_from_slice(&[1, 0x11, 0]);
        bytes.extend_from_slice(&[0xFF, 0xD9]); // EOI

        let dims = probe_jpeg_sof(&bytes);
        assert_eq!(dims, Some((8, 4)));
    }

    #[test]
    fn fallback_summary_uses_target_pixel_size_for_every_page() {
        let config = PipelineConfigBuilder::new("/scans", "/out")
            .target_dpi(300.0)
            .target_dimensions_mm(210.0, 297.0)
            .build()
            .unwrap();
        let pages = vec![Page::new("p1".into(), "p1.png".into(), "/scans/p1.png".into(), None)];
        let summary = fallback_summary(&pages, &config);
        assert_eq!(summary.estimates.len(), 1);
        assert_eq!(summary.dimensions_confidence, 0.0);
        assert!(summary.estimates[0].is_valid());
    }

    #[test]
    fn coefficient_of_variation_is_zero_for_identical_samples() {
        assert_eq!(coefficient_of_variation(&[10.0, 10.0, 10.0]), 0.0);
    }
}
