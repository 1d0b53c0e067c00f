//! Layout classification and the quality gate that decides whether a
//! normalized page needs human review (spec §4.6 "Layout classification
//! and quality gate").

use once_cell::sync::Lazy;
use regex::Regex;

use crate::model::{
    Box4, BookModel, LayoutElement, LayoutProfile, NormalizationResult, NormalizationStats,
    PreviewRef, QualityGateSummary, ReviewItem, ReviewReasonKind, ReviewSpreadInfo, SuggestedAction,
};

fn clamp01(v: f64) -> f64 {
    v.clamp(0.0, 1.0)
}

struct FilenameRule {
    pattern: Regex,
    profile: LayoutProfile,
}

/// Filename keyword cues, checked case-insensitively against the page's
/// source filename. Order matters: the first match wins.
static FILENAME_RULES: Lazy<Vec<FilenameRule>> = Lazy::new(|| {
    let rule = |pattern: &str, profile: LayoutProfile| FilenameRule {
        pattern: Regex::new(pattern).expect("static filename pattern is valid"),
        profile,
    };
    vec![
        rule(r"(?i)\bcover\b", LayoutProfile::Cover),
        rule(r"(?i)\b(title[-_ ]?page|frontispiece)\b", LayoutProfile::Title),
        rule(
            r"(?i)\b(toc|contents|preface|foreword|introduction|dedication)\b",
            LayoutProfile::FrontMatter,
        ),
        // Index is checked ahead of appendix/back-matter cues so a filename
        // containing "index" doesn't get shadowed by a broader rule.
        rule(r"(?i)\bindex\b", LayoutProfile::Index),
        rule(r"(?i)\bappendix\b", LayoutProfile::Appendix),
        rule(r"(?i)\b(plate|illustration|figure|fig)\b", LayoutProfile::Illustration),
        rule(r"(?i)\btable\b", LayoutProfile::Table),
        rule(r"(?i)\b(chapter|chap)\b", LayoutProfile::ChapterOpening),
        rule(r"(?i)\bblank\b", LayoutProfile::Blank),
    ]
});

/// Weight given to the structural signal versus the filename cue when
/// both are present, per spec §4.6's profile-dependent weight table:
/// text-heavy profiles lean on structure (0.55), visual-heavy profiles
/// lean on it less (0.35), everything else sits at 0.45.
fn structural_weight(profile: LayoutProfile) -> f64 {
    if profile.is_text_heavy() {
        0.55
    } else if profile.is_visual_heavy() {
        0.35
    } else {
        0.45
    }
}

/// The layout-confidence threshold below which a page's classification
/// routes it to the review queue for semantic confirmation, per profile.
pub fn semantic_confirmation_threshold(profile: LayoutProfile) -> f64 {
    match profile {
        LayoutProfile::Body => 0.88,
        LayoutProfile::ChapterOpening => 0.85,
        LayoutProfile::Cover | LayoutProfile::Title => 0.75,
        LayoutProfile::FrontMatter | LayoutProfile::BackMatter => 0.82,
        LayoutProfile::Appendix | LayoutProfile::Index | LayoutProfile::Table => 0.80,
        LayoutProfile::Illustration => 0.70,
        LayoutProfile::Blank => 0.65,
        LayoutProfile::Unknown => 0.95,
    }
}

fn filename_cue(filename: &str) -> Option<(LayoutProfile, String)> {
    FILENAME_RULES
        .iter()
        .find(|rule| rule.pattern.is_match(filename))
        .map(|rule| (rule.profile, format!("filename-cue:{:?}", rule.profile).to_lowercase()))
}

/// Infers a profile purely from structural signals: a near-empty mask
/// reads as a blank leaf, a very low column/line count with a tall,
/// balanced mask reads as an illustration plate, a high column count
/// with strong baseline regularity reads as a table, and otherwise the
/// page is ordinary running text.
fn structural_profile(stats: &NormalizationStats, elements: &[LayoutElement]) -> (LayoutProfile, f64) {
    if stats.mask_coverage < 0.05 {
        return (LayoutProfile::Blank, clamp01(1.0 - stats.mask_coverage * 4.0));
    }

    let has_title = elements.iter().any(|e| matches!(e.element_type, crate::model::ElementType::Title));
    if has_title && stats.baseline_consistency < 0.3 {
        return (LayoutProfile::ChapterOpening, 0.55);
    }

    if stats.column_count >= 3 && stats.baseline_consistency > 0.5 {
        return (LayoutProfile::Table, clamp01(0.4 + 0.2 * stats.baseline_consistency));
    }

    if stats.baseline_consistency < 0.15 && stats.mask_coverage > 0.4 {
        return (LayoutProfile::Illustration, clamp01(0.4 + 0.3 * stats.mask_coverage));
    }

    let body_confidence = clamp01(0.3 + 0.5 * stats.baseline_consistency + 0.2 * stats.mask_coverage.min(1.0));
    (LayoutProfile::Body, body_confidence)
}

/// Classifies a page's layout profile, combining the filename cue (if
/// any) with the structural signal using the profile's weight table, and
/// returning the accumulated reason codes for the sidecar's `reasons[]`.
pub fn classify(
    filename: &str,
    stats: &NormalizationStats,
    elements: &[LayoutElement],
) -> (LayoutProfile, f64, Vec<String>) {
    let mut reasons = Vec::new();
    let (structural_guess, structural_conf) = structural_profile(stats, elements);

    match filename_cue(filename) {
        Some((cue_profile, reason)) => {
            reasons.push(reason);
            let weight = structural_weight(cue_profile);
            // The filename cue and structural guess agree, or the
            // structural signal is too weak to override a strong
            // lexical cue: trust the filename's profile, blended with
            // the structural confidence.
            let confidence = if cue_profile == structural_guess {
                clamp01(weight * structural_conf + (1.0 - weight) * 1.0)
            } else {
                clamp01(weight * structural_conf + (1.0 - weight) * 0.75)
            };
            (cue_profile, confidence, reasons)
        }
        None => {
            reasons.push("structural-only".to_string());
            (structural_guess, structural_conf, reasons)
        }
    }
}

/// Confidence floor for a recurring running-head/folio/ornament template
/// to be worth checking for presence on a given page.
const BOOK_ELEMENT_CONFIDENCE_MIN: f64 = 0.6;

fn box_dims(b: Box4) -> (i64, i64) {
    ((b[2] - b[0] + 1).max(1), (b[3] - b[1] + 1).max(1))
}

/// Fraction of `element`'s own area that `mask` overlaps.
fn intersection_ratio(mask: Box4, element: Box4) -> f64 {
    let ix0 = mask[0].max(element[0]);
    let iy0 = mask[1].max(element[1]);
    let ix1 = mask[2].min(element[2]);
    let iy1 = mask[3].min(element[3]);
    if ix1 < ix0 || iy1 < iy0 {
        return 0.0;
    }
    let inter = ((ix1 - ix0 + 1) * (iy1 - iy0 + 1)) as f64;
    let (ew, eh) = box_dims(element);
    (inter / (ew * eh) as f64).clamp(0.0, 1.0)
}

/// Rescales the page's content mask box out of the pre-resize crop frame
/// it was measured in and into the canonical output raster's pixel space,
/// the frame `BookModel`'s running-head/folio/ornament templates are
/// defined against.
fn mask_box_in_output_space(result: &NormalizationResult, crop_size: (u32, u32), output_size: (u32, u32)) -> Box4 {
    let [cx0, cy0, ..] = result.crop_box;
    let [mx0, my0, mx1, my1] = result.mask_box;
    let translated: Box4 = [mx0 - cx0, my0 - cy0, mx1 - cx0, my1 - cy0];
    crate::overlay::rescale_bbox(translated, crop_size, output_size)
}

/// Mirrors spec §4.6's quality-gate checks against the page's measured
/// confidences: any failing check appends a reason code and fails the
/// gate outright.
pub fn evaluate_quality_gate(
    result: &NormalizationResult,
    profile: LayoutProfile,
    layout_confidence: f64,
    book_model: Option<&BookModel>,
    corpus_median_mask_coverage: f64,
    spread_split_confidence: Option<f64>,
    crop_size: (u32, u32),
    output_size: (u32, u32),
) -> QualityGateSummary {
    let mut reasons = Vec::new();

    if result.stats.mask_coverage < 0.65 {
        reasons.push("low-mask-coverage".to_string());
    }
    if corpus_median_mask_coverage > 0.0 && result.stats.mask_coverage < 0.7 * corpus_median_mask_coverage {
        reasons.push("mask-coverage-drop".to_string());
    }
    if result.stats.skew_confidence < 0.35 {
        reasons.push("low-skew-confidence".to_string());
    }
    if result.stats.shadow_score > 28.0 {
        reasons.push("shadow-heavy".to_string());
    }
    if result.stats.border_std > 32.0 {
        reasons.push("noisy-background".to_string());
    }
    if let Some(shading) = &result.shading {
        if shading.applied && shading.residual > 1.12 {
            reasons.push("shading-residual-worse".to_string());
        }
        if shading.confidence < 0.45 {
            reasons.push("low-shading-confidence".to_string());
        }
    }
    if result.corrections.content_bounds_clamped {
        reasons.push("content-bounds-clamped".to_string());
    }
    if layout_confidence < semantic_confirmation_threshold(profile) {
        reasons.push("layout-confidence-below-threshold".to_string());
    }

    if let Some(book) = book_model {
        let mask = mask_box_in_output_space(result, crop_size, output_size);
        let head_missing = book
            .running_heads
            .iter()
            .any(|h| h.confidence >= BOOK_ELEMENT_CONFIDENCE_MIN && intersection_ratio(mask, h.bbox) < 0.6);
        if head_missing {
            reasons.push("book-head-missing".to_string());
        }
        let ornament_missing = book
            .ornaments
            .iter()
            .any(|o| o.confidence >= BOOK_ELEMENT_CONFIDENCE_MIN && intersection_ratio(mask, o.bbox) < 0.6);
        if ornament_missing {
            reasons.push("book-ornament-missing".to_string());
        }
        if let Some(folio) = &book.folio {
            let folio_missing = folio.position_bands.iter().any(|band| {
                if band.confidence < BOOK_ELEMENT_CONFIDENCE_MIN {
                    return false;
                }
                let bbox: Box4 = [0, band.band[0], output_size.0 as i64 - 1, band.band[1]];
                intersection_ratio(mask, bbox) < 0.6
            });
            if folio_missing {
                reasons.push("book-folio-missing".to_string());
            }
        }
    }

    if profile.is_text_heavy() {
        if result.skew_residual.abs() > 0.15 {
            reasons.push(format!("residual-skew-{:.2}deg", result.skew_residual.abs()));
        }
        if result.stats.skew_confidence < 0.5 && result.stats.border_std > 20.0 {
            reasons.push("potential-baseline-misalignment".to_string());
        }
        if result.stats.baseline_consistency < 0.55 {
            reasons.push("low-baseline-consistency".to_string());
        }
    }

    if let Some(confidence) = spread_split_confidence {
        if confidence < 0.7 {
            reasons.push("spread-split-low-confidence".to_string());
        }
    }

    QualityGateSummary {
        accepted: reasons.is_empty(),
        reasons,
    }
}

/// Builds the review-queue entry for a page that failed the quality
/// gate or needs semantic confirmation. `reasons` containing a
/// structural failure (not just a confidence-threshold miss) suggests
/// `Adjust`; otherwise `Confirm` is enough.
pub fn build_review_item(
    result: &NormalizationResult,
    filename: &str,
    profile: LayoutProfile,
    layout_confidence: f64,
    quality_gate: QualityGateSummary,
    reason: ReviewReasonKind,
    previews: Vec<PreviewRef>,
    spread: Option<ReviewSpreadInfo>,
) -> ReviewItem {
    let needs_adjustment = quality_gate
        .reasons
        .iter()
        .any(|r| r != "layout-confidence-below-threshold");
    let suggested_action = if needs_adjustment {
        SuggestedAction::Adjust
    } else {
        SuggestedAction::Confirm
    };

    ReviewItem {
        page_id: result.page_id.clone(),
        filename: filename.to_string(),
        layout_profile: profile,
        layout_confidence,
        quality_gate,
        reason,
        previews,
        suggested_action,
        spread,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        ConfidenceGateRecord, CorrectionsRecord, DimensionSource, NormalizationStats, ShadowDescriptor,
        WarpDescriptor,
    };
    use std::path::PathBuf;

    fn stats_fixture(mask_coverage: f64, baseline_consistency: f64, column_count: u32) -> NormalizationStats {
        NormalizationStats {
            border_mean: 240.0,
            border_std: 5.0,
            mask_coverage,
            skew_confidence: 0.8,
            shadow_score: 0.0,
            baseline_consistency,
            column_count,
            illumination_residual: None,
        }
    }

    #[test]
    fn filename_cue_cover_wins_over_structural_guess() {
        let stats = stats_fixture(0.5, 0.4, 1);
        let (profile, confidence, reasons) = classify("cover_front.jpg", &stats, &[]);
        assert_eq!(profile, LayoutProfile::Cover);
        assert!(confidence > 0.0);
        assert!(reasons.iter().any(|r| r.contains("filename-cue")));
    }

    #[test]
    fn blank_mask_coverage_classifies_as_blank() {
        let stats = stats_fixture(0.01, 0.0, 1);
        let (profile, _confidence, _reasons) = classify("p010.jpg", &stats, &[]);
        assert_eq!(profile, LayoutProfile::Blank);
    }

    #[test]
    fn quality_gate_rejects_low_mask_coverage() {
        let result = result_fixture(stats_fixture(0.1, 0.8, 1));
        let gate = evaluate_quality_gate(&result, LayoutProfile::Body, 0.9, None, 0.0, None, (100, 100), (100, 100));
        assert!(!gate.accepted);
        assert!(gate.reasons.contains(&"low-mask-coverage".to_string()));
    }

    #[test]
    fn quality_gate_accepts_clean_body_page() {
        let result = result_fixture(stats_fixture(0.8, 0.9, 1));
        let gate = evaluate_quality_gate(&result, LayoutProfile::Body, 0.95, None, 0.0, None, (100, 100), (100, 100));
        assert!(gate.accepted);
    }

    #[test]
    fn quality_gate_flags_mask_coverage_drop_against_corpus_median() {
        let result = result_fixture(stats_fixture(0.68, 0.9, 1));
        let gate = evaluate_quality_gate(&result, LayoutProfile::Body, 0.95, None, 1.0, None, (100, 100), (100, 100));
        assert!(gate.reasons.contains(&"mask-coverage-drop".to_string()));
    }

    #[test]
    fn quality_gate_flags_spread_split_low_confidence() {
        let result = result_fixture(stats_fixture(0.8, 0.9, 1));
        let gate = evaluate_quality_gate(&result, LayoutProfile::Body, 0.95, None, 0.0, Some(0.4), (100, 100), (100, 100));
        assert!(gate.reasons.contains(&"spread-split-low-confidence".to_string()));
    }

    fn result_fixture(stats: NormalizationStats) -> NormalizationResult {
        NormalizationResult {
            page_id: "p001".into(),
            output_path: PathBuf::new(),
            crop_box: [0, 0, 99, 99],
            mask_box: [10, 10, 89, 89],
            dimensions_mm: (210.0, 297.0),
            dpi: 300.0,
            dpi_source: DimensionSource::Inferred,
            skew_angle: 0.0,
            skew_residual: 0.0,
            shadow: ShadowDescriptor::default(),
            shading: None,
            warp: WarpDescriptor::default(),
            corrections: CorrectionsRecord::default(),
            stats,
            baseline: crate::model::BaselineMetrics {
                median_spacing_px: None,
                spacing_mad: None,
                line_straightness_residual: 0.0,
                confidence: 0.0,
                peaks_y: None,
            },
            confidence_gate: None::<ConfidenceGateRecord>,
            preview_paths: vec![],
            spread_split: None,
            processing_ms: 1,
        }
    }
}
