//! Per-page normalization kernel (spec §4.4): deskew, shading
//! correction, mask/edge crop, padding and book-prior snap, morphology,
//! and baseline/column metrics, composed into one `normalize_page` call.
//!
//! Submodules each own one stage's math; this module only sequences
//! them and assembles the [`NormalizationResult`] record.

pub mod mask;
pub mod metrics;
pub mod morphology;
pub mod shading;
pub mod size;
pub mod skew;

use std::path::PathBuf;
use std::time::Instant;

use image::{imageops::FilterType, DynamicImage, GenericImageView};

use crate::config::{
    BookPriorsToleranceConfig, ConfidenceGateConfig, PipelineConfig, ShadingConfig,
    SkewRefinementMode,
};
use crate::model::{
    BookModel, ConfidenceGateRecord, CorpusSummary, CorrectionsRecord, NormalizationResult,
    NormalizationStats, PageBoundsEstimate, WarpDescriptor,
};

/// Resolved tuning for one normalization attempt. Built once per pass via
/// [`NormalizeOptions::first_pass`] / [`NormalizeOptions::second_pass`]
/// rather than threading a dozen loose parameters through the kernel.
#[derive(Debug, Clone)]
pub struct NormalizeOptions {
    pub target_dpi: f64,
    pub target_dimensions_mm: (f64, f64),
    pub target_size_px: (u32, u32),
    pub skew_refinement: SkewRefinementMode,
    pub shading: ShadingConfig,
    pub confidence_gate: ConfidenceGateConfig,
    pub book_priors_tolerance: BookPriorsToleranceConfig,
    pub bleed_mm: f64,
    pub max_aspect_ratio_drift: f64,
    pub generate_previews: bool,
    pub adaptive_padding_px: f64,
    pub edge_scale: f64,
    pub intensity_bias: f64,
    pub shadow_trim_scale: f64,
    pub forced: bool,
}

impl NormalizeOptions {
    /// First-pass tuning, taken directly from the run's config.
    pub fn first_pass(cfg: &PipelineConfig, summary: &CorpusSummary) -> Self {
        Self {
            target_dpi: cfg.target_dpi,
            target_dimensions_mm: cfg.target_dimensions_mm,
            target_size_px: summary.target_size_px,
            skew_refinement: cfg.normalization.skew_refinement,
            shading: cfg.normalization.shading,
            confidence_gate: cfg.normalization.confidence_gate,
            book_priors_tolerance: cfg.normalization.book_priors,
            bleed_mm: cfg.normalization.bleed_mm,
            max_aspect_ratio_drift: cfg.normalization.max_aspect_ratio_drift,
            generate_previews: cfg.normalization.generate_previews,
            adaptive_padding_px: 0.0,
            edge_scale: 1.5,
            intensity_bias: 0.0,
            shadow_trim_scale: 1.0,
            forced: false,
        }
    }

    /// Relaxed second-pass tuning (spec §4.7): wider adaptive padding,
    /// a lower edge threshold, a more permissive intensity-mask bias, a
    /// wider aspect tolerance, forced skew refinement, and looser
    /// book-prior snap tolerances.
    pub fn second_pass(cfg: &PipelineConfig, summary: &CorpusSummary) -> Self {
        let mut opts = Self::first_pass(cfg, summary);
        opts.skew_refinement = SkewRefinementMode::Forced;
        opts.book_priors_tolerance = BookPriorsToleranceConfig::second_pass();
        opts.adaptive_padding_px += 6.0;
        opts.edge_scale = (opts.edge_scale * 0.85).max(0.7);
        opts.intensity_bias = (opts.intensity_bias - 0.15).max(-0.1);
        opts.max_aspect_ratio_drift = (opts.max_aspect_ratio_drift + 0.05).min(0.20);
        opts.forced = true;
        opts
    }
}

/// Runs the full per-page kernel and returns the processed raster
/// together with its [`NormalizationResult`] record.
///
/// `result.output_path` and `result.preview_paths` are left empty; the
/// orchestrator fills them in once it has written the file, since this
/// function does no I/O of its own.
pub fn normalize_page(
    image: &DynamicImage,
    raw_bytes: &[u8],
    page_id: &str,
    estimate: &PageBoundsEstimate,
    options: &NormalizeOptions,
    priors: Option<&BookModel>,
) -> (DynamicImage, NormalizationResult) {
    let start = Instant::now();
    let mut reasons: Vec<String> = Vec::new();

    let (source_w, source_h) = image.dimensions();
    let physical_size = size::infer_physical_size(
        source_w,
        source_h,
        raw_bytes,
        options.target_dimensions_mm.0,
        options.target_dimensions_mm.1,
        options.target_dpi,
        options.target_dpi,
    );

    let initial_gray = image.to_luma8();
    let initial_skew = skew::estimate_skew(&initial_gray);

    let deskew_skipped = options
        .confidence_gate
        .deskew_min
        .map_or(false, |min| initial_skew.confidence < min);

    let (rotated, applied_angle, refinement_applied, skew_residual_confidence, skew_residual_angle) =
        if deskew_skipped {
            reasons.push("deskew-low-confidence".to_string());
            (image.clone(), 0.0, false, 0.0, 0.0)
        } else {
            let first_rotation = skew::rotate(image, initial_skew.angle_deg);
            let residual = skew::estimate_skew(&first_rotation.to_luma8());
            match skew::refine(options.skew_refinement, initial_skew, residual) {
                Some(total_angle) => {
                    let refined = skew::rotate(image, total_angle);
                    let refined_residual = skew::estimate_skew(&refined.to_luma8());
                    (refined, total_angle, true, refined_residual.confidence, refined_residual.angle_deg)
                }
                None => (first_rotation, initial_skew.angle_deg, false, residual.confidence, residual.angle_deg),
            }
        };

    let gray_after_skew = rotated.to_luma8();
    let (border_mean, border_std) = mask::border_stats(&gray_after_skew);

    let shadow = shading::estimate_shadow(&gray_after_skew);
    let spine_shadow = shading::spine_shadow_score(&gray_after_skew, &shadow);
    let shading_conf = shading::shading_confidence(shadow.confidence, spine_shadow, border_std);

    let shading_skipped = options
        .confidence_gate
        .shading_min
        .map_or(false, |min| shading_conf < min);

    let (shaded, shading_model) = if shading_skipped {
        reasons.push("shading-confidence-below-gate".to_string());
        (rotated, None)
    } else {
        let field = shading::build_background_field(&gray_after_skew);
        let (img, model) = shading::apply(
            &rotated,
            &gray_after_skew,
            &field,
            border_mean,
            border_std,
            &shadow,
            spine_shadow,
            &options.shading,
        );
        (img, Some(model))
    };

    let mask_gray = shaded.to_luma8();
    let (mask_border_mean, mask_border_std) = mask::border_stats(&mask_gray);
    let (w, h) = shaded.dimensions();

    let (combined_box, mask_flags) = mask::compute_combined_box(
        &mask_gray,
        mask_border_mean,
        mask_border_std,
        options.intensity_bias,
        options.edge_scale,
        estimate.content_bounds,
    );
    if mask_flags.edge_fallback_applied {
        reasons.push("edge-fallback-applied".to_string());
    }
    if mask_flags.edge_anchor_applied {
        reasons.push("edge-anchor-applied".to_string());
    }
    if mask_flags.content_bounds_clamped {
        reasons.push("content-bounds-clamped".to_string());
    }

    let trimmed_box = mask::trim_shadow_side(combined_box, &shadow, options.shadow_trim_scale);

    let target_aspect = options.target_dimensions_mm.0 / options.target_dimensions_mm.1;
    let (padded_box, aspect_padded, aspect_drift_too_high) = mask::pad_and_align(
        trimmed_box,
        w,
        h,
        w,
        h,
        estimate.bleed_px,
        estimate.trim_px,
        options.adaptive_padding_px,
        target_aspect,
        options.max_aspect_ratio_drift,
    );
    if aspect_drift_too_high {
        reasons.push("aspect-drift-too-high".to_string());
    }

    let mut final_box = padded_box;
    let mut book_snap_applied = false;
    if let Some(book_model) = priors {
        let (snapped, did_snap) =
            mask::book_snap(final_box, trimmed_box, book_model, options.book_priors_tolerance.max_trim_drift_px);
        if did_snap {
            final_box = snapped;
            book_snap_applied = true;
            reasons.push("book-snap-applied".to_string());
        }
    }

    let [x0, y0, x1, y1] = final_box;
    let crop_x = x0.clamp(0, w as i64 - 1) as u32;
    let crop_y = y0.clamp(0, h as i64 - 1) as u32;
    let crop_w = ((x1 - x0 + 1).max(1) as u32).min(w - crop_x);
    let crop_h = ((y1 - y0 + 1).max(1) as u32).min(h - crop_y);
    let cropped = shaded.crop_imm(crop_x, crop_y, crop_w.max(1), crop_h.max(1));

    let (target_w, target_h) = options.target_size_px;
    let resized = if target_w > 0 && target_h > 0 {
        cropped.resize_exact(target_w, target_h, FilterType::Lanczos3)
    } else {
        cropped
    };

    let mask_coverage = mask::box_area_ratio(final_box, w, h);
    let morph_plan = morphology::plan_for(mask_border_std, shadow.present, mask_coverage);
    let processed = morphology::apply(&resized, morph_plan);

    let metrics_gray = processed.to_luma8();
    let baseline = metrics::baseline_metrics(&metrics_gray);
    let column_count = metrics::column_count(&metrics_gray);

    let confidence_gate = if deskew_skipped || shading_skipped {
        Some(ConfidenceGateRecord {
            deskew_skipped,
            shading_skipped,
        })
    } else {
        None
    };

    let illumination_residual = shading_model.as_ref().map(|m| m.residual);

    let corrections = CorrectionsRecord {
        deskew_applied: !deskew_skipped,
        refinement_applied,
        edge_fallback_applied: mask_flags.edge_fallback_applied,
        edge_anchor_applied: mask_flags.edge_anchor_applied,
        content_bounds_clamped: mask_flags.content_bounds_clamped,
        book_snap_applied,
        aspect_padded,
        reasons,
    };

    let stats = NormalizationStats {
        border_mean: mask_border_mean,
        border_std: mask_border_std,
        mask_coverage,
        skew_confidence: skew_residual_confidence.max(initial_skew.confidence),
        shadow_score: spine_shadow,
        baseline_consistency: baseline.confidence,
        column_count,
        illumination_residual,
    };

    let result = NormalizationResult {
        page_id: page_id.to_string(),
        output_path: PathBuf::new(),
        crop_box: final_box,
        mask_box: combined_box,
        dimensions_mm: (physical_size.width_mm, physical_size.height_mm),
        dpi: physical_size.dpi,
        dpi_source: physical_size.source,
        skew_angle: applied_angle,
        skew_residual: skew_residual_angle,
        shadow,
        shading: shading_model,
        warp: WarpDescriptor::default(),
        corrections,
        stats,
        baseline,
        confidence_gate,
        preview_paths: Vec::new(),
        spread_split: None,
        processing_ms: start.elapsed().as_millis() as u64,
    };

    (processed, result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfigBuilder;
    use crate::model::DimensionSource;
    use image::{Rgb, RgbImage};

    fn summary_fixture() -> CorpusSummary {
        CorpusSummary {
            project_id: "proj".into(),
            target_dimensions_mm: (210.0, 297.0),
            target_size_px: (200, 280),
            estimates: vec![],
            inferred_dimensions_mm: None,
            inferred_dpi: None,
            dimensions_confidence: 0.8,
            dpi_confidence: 0.8,
        }
    }

    fn estimate_fixture() -> PageBoundsEstimate {
        PageBoundsEstimate {
            page_id: "p001".into(),
            width_px: 400,
            height_px: 560,
            bleed_px: 4.0,
            trim_px: 2.0,
            page_bounds: [0, 0, 399, 559],
            content_bounds: [20, 20, 379, 539],
            dimension_source: DimensionSource::Inferred,
        }
    }

    fn page_image() -> DynamicImage {
        let mut img = RgbImage::from_pixel(400, 560, Rgb([245, 245, 245]));
        for y in 40..520 {
            for x in 40..360 {
                img.put_pixel(x, y, Rgb([30, 30, 30]));
            }
        }
        DynamicImage::ImageRgb8(img)
    }

    #[test]
    fn normalize_page_produces_target_sized_output() {
        let cfg = PipelineConfigBuilder::new("/scans", "/out").build().unwrap();
        let summary = summary_fixture();
        let options = NormalizeOptions::first_pass(&cfg, &summary);
        let estimate = estimate_fixture();
        let image = page_image();

        let (processed, result) = normalize_page(&image, &[], "p001", &estimate, &options, None);

        assert_eq!(processed.dimensions(), (200, 280));
        assert_eq!(result.page_id, "p001");
        assert!(result.stats.mask_coverage > 0.0);
    }

    #[test]
    fn second_pass_options_relax_tolerances_from_first_pass() {
        let cfg = PipelineConfigBuilder::new("/scans", "/out").build().unwrap();
        let summary = summary_fixture();
        let first = NormalizeOptions::first_pass(&cfg, &summary);
        let second = NormalizeOptions::second_pass(&cfg, &summary);

        assert!(second.adaptive_padding_px > first.adaptive_padding_px);
        assert!(second.edge_scale < first.edge_scale);
        assert!(second.intensity_bias < first.intensity_bias);
        assert_eq!(second.skew_refinement, SkewRefinementMode::Forced);
    }
}
