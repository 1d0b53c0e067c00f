//! Data model shared across the pipeline: the entities described in
//! spec §3, plus the artifact shapes written to `runDir`.
//!
//! Every type here is plain data — no behavior beyond small accessors.
//! The modules that compute these values live elsewhere (`scanner`,
//! `analyzer`, `spread`, `normalize`, `priors`, `layout`).

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::PageError;

/// Inclusive pixel box `[x0, y0, x1, y1]`.
pub type Box4 = [i64; 4];

/// A unit of input, assigned a stable id by the scanner.
///
/// Never mutated after creation except by the spread splitter, which
/// replaces one `Page` with two child pages carrying ids `<id>_L` /
/// `<id>_R`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page {
    pub id: String,
    pub filename: String,
    #[serde(rename = "originalPath")]
    pub original_path: PathBuf,
    pub checksum: Option<String>,
    #[serde(rename = "confidenceScores", default)]
    pub confidence_scores: std::collections::BTreeMap<String, f64>,
}

impl Page {
    pub fn new(id: String, filename: String, original_path: PathBuf, checksum: Option<String>) -> Self {
        Self {
            id,
            filename,
            original_path,
            checksum,
            confidence_scores: std::collections::BTreeMap::new(),
        }
    }

    /// Splits this page into its left/right spread children, preserving
    /// the checksum with a `:L` / `:R` suffix per spec §8 boundaries.
    pub fn split_child(&self, side: SpreadSide) -> Page {
        let suffix = match side {
            SpreadSide::Left => "L",
            SpreadSide::Right => "R",
        };
        Page {
            id: format!("{}_{}", self.id, suffix),
            filename: self.filename.clone(),
            original_path: self.original_path.clone(),
            checksum: self.checksum.as_ref().map(|c| format!("{c}:{suffix}")),
            confidence_scores: self.confidence_scores.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpreadSide {
    Left,
    Right,
}

/// Source of a DPI / physical-size value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DimensionSource {
    Metadata,
    Inferred,
    Fallback,
}

/// Seeded geometry for one page, produced by the analyzer.
///
/// Invariant: `content_bounds ⊆ page_bounds ⊆ [0, 0, width_px - 1,
/// height_px - 1]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageBoundsEstimate {
    #[serde(rename = "pageId")]
    pub page_id: String,
    #[serde(rename = "widthPx")]
    pub width_px: u32,
    #[serde(rename = "heightPx")]
    pub height_px: u32,
    #[serde(rename = "bleedPx")]
    pub bleed_px: f64,
    #[serde(rename = "trimPx")]
    pub trim_px: f64,
    #[serde(rename = "pageBounds")]
    pub page_bounds: Box4,
    #[serde(rename = "contentBounds")]
    pub content_bounds: Box4,
    #[serde(rename = "dimensionSource")]
    pub dimension_source: DimensionSource,
}

impl PageBoundsEstimate {
    pub fn is_valid(&self) -> bool {
        let [cx0, cy0, cx1, cy1] = self.content_bounds;
        let [px0, py0, px1, py1] = self.page_bounds;
        let within_page = px0 <= cx0 && cy0 >= py0 && cx1 <= px1 && cy1 <= py1;
        let page_within_image =
            px0 >= 0 && py0 >= 0 && px1 <= self.width_px as i64 - 1 && py1 <= self.height_px as i64 - 1;
        within_page && page_within_image
    }
}

/// Aggregate over the whole corpus, produced by the analyzer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorpusSummary {
    #[serde(rename = "projectId")]
    pub project_id: String,
    #[serde(rename = "targetDimensionsMm")]
    pub target_dimensions_mm: (f64, f64),
    #[serde(rename = "targetSizePx")]
    pub target_size_px: (u32, u32),
    pub estimates: Vec<PageBoundsEstimate>,
    #[serde(rename = "inferredDimensionsMm", skip_serializing_if = "Option::is_none")]
    pub inferred_dimensions_mm: Option<(f64, f64)>,
    #[serde(rename = "inferredDpi", skip_serializing_if = "Option::is_none")]
    pub inferred_dpi: Option<f64>,
    #[serde(rename = "dimensionsConfidence")]
    pub dimensions_confidence: f64,
    #[serde(rename = "dpiConfidence")]
    pub dpi_confidence: f64,
}

impl CorpusSummary {
    pub fn estimate_for(&self, page_id: &str) -> Option<&PageBoundsEstimate> {
        self.estimates.iter().find(|e| e.page_id == page_id)
    }

    pub fn target_aspect_ratio(&self) -> f64 {
        self.target_dimensions_mm.0 / self.target_dimensions_mm.1
    }
}

/// A recurring running-head template, derived by the book-priors builder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunningHeadTemplate {
    pub id: String,
    pub bbox: Box4,
    pub hash: u64,
    pub confidence: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FolioPositionBand {
    pub side: SpreadSide,
    pub band: [i64; 2],
    pub confidence: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FolioModel {
    #[serde(rename = "positionBands")]
    pub position_bands: Vec<FolioPositionBand>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrnamentAnchor {
    pub hash: u64,
    pub bbox: Box4,
    pub confidence: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BaselineGridSummary {
    #[serde(rename = "spacingPx")]
    pub spacing_px: f64,
    #[serde(rename = "offsetPx")]
    pub offset_px: f64,
    pub confidence: f64,
}

/// Corpus-wide priors derived from a sample of normalized pages, used to
/// tighten the second pass. Produced by `priors::build_book_model`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookModel {
    #[serde(rename = "trimBoxPx")]
    pub trim_box_px: Box4,
    #[serde(rename = "trimBoxDispersion")]
    pub trim_box_dispersion: [f64; 4],
    #[serde(rename = "contentBoxPx")]
    pub content_box_px: Box4,
    #[serde(rename = "contentBoxDispersion")]
    pub content_box_dispersion: [f64; 4],
    #[serde(rename = "runningHeads")]
    pub running_heads: Vec<RunningHeadTemplate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub folio: Option<FolioModel>,
    pub ornaments: Vec<OrnamentAnchor>,
    #[serde(rename = "baselineGrid", skip_serializing_if = "Option::is_none")]
    pub baseline_grid: Option<BaselineGridSummary>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShadowSide {
    Left,
    Right,
    Top,
    Bottom,
    None,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ShadowDescriptor {
    pub present: bool,
    pub side: ShadowSide,
    #[serde(rename = "widthPx")]
    pub width_px: f64,
    pub confidence: f64,
    pub darkness: f64,
}

impl Default for ShadowDescriptor {
    fn default() -> Self {
        Self {
            present: false,
            side: ShadowSide::None,
            width_px: 0.0,
            confidence: 0.0,
            darkness: 0.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShadingModel {
    pub method: String,
    #[serde(rename = "backgroundModel")]
    pub background_model: String,
    #[serde(rename = "spineShadowModel")]
    pub spine_shadow_model: String,
    pub params: serde_json::Value,
    pub confidence: f64,
    pub residual: f64,
    pub applied: bool,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct WarpDescriptor {
    pub method: &'static str,
    pub residual: f64,
}

/// Flags and intermediate records produced while correcting one page.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CorrectionsRecord {
    #[serde(rename = "deskewApplied")]
    pub deskew_applied: bool,
    #[serde(rename = "refinementApplied")]
    pub refinement_applied: bool,
    #[serde(rename = "edgeFallbackApplied")]
    pub edge_fallback_applied: bool,
    #[serde(rename = "edgeAnchorApplied")]
    pub edge_anchor_applied: bool,
    #[serde(rename = "contentBoundsClamped")]
    pub content_bounds_clamped: bool,
    #[serde(rename = "bookSnapApplied")]
    pub book_snap_applied: bool,
    #[serde(rename = "aspectPadded")]
    pub aspect_padded: bool,
    pub reasons: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BaselineMetrics {
    #[serde(rename = "medianSpacingPx", skip_serializing_if = "Option::is_none")]
    pub median_spacing_px: Option<f64>,
    #[serde(rename = "spacingMAD", skip_serializing_if = "Option::is_none")]
    pub spacing_mad: Option<f64>,
    #[serde(rename = "lineStraightnessResidual")]
    pub line_straightness_residual: f64,
    pub confidence: f64,
    #[serde(rename = "peaksY", skip_serializing_if = "Option::is_none")]
    pub peaks_y: Option<Vec<u32>>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ColumnMetrics {
    #[serde(rename = "columnCount")]
    pub column_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizationStats {
    #[serde(rename = "borderMean")]
    pub border_mean: f64,
    #[serde(rename = "borderStd")]
    pub border_std: f64,
    #[serde(rename = "maskCoverage")]
    pub mask_coverage: f64,
    #[serde(rename = "skewConfidence")]
    pub skew_confidence: f64,
    #[serde(rename = "shadowScore")]
    pub shadow_score: f64,
    #[serde(rename = "baselineConsistency")]
    pub baseline_consistency: f64,
    #[serde(rename = "columnCount")]
    pub column_count: u32,
    #[serde(rename = "illuminationResidual", skip_serializing_if = "Option::is_none")]
    pub illumination_residual: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfidenceGateRecord {
    #[serde(rename = "deskewSkipped")]
    pub deskew_skipped: bool,
    #[serde(rename = "shadingSkipped")]
    pub shading_skipped: bool,
}

/// Output of one call to `normalize::normalize_page`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizationResult {
    #[serde(rename = "pageId")]
    pub page_id: String,
    #[serde(rename = "outputPath")]
    pub output_path: PathBuf,
    #[serde(rename = "cropBox")]
    pub crop_box: Box4,
    #[serde(rename = "maskBox")]
    pub mask_box: Box4,
    #[serde(rename = "dimensionsMm")]
    pub dimensions_mm: (f64, f64),
    pub dpi: f64,
    #[serde(rename = "dpiSource")]
    pub dpi_source: DimensionSource,
    #[serde(rename = "skewAngle")]
    pub skew_angle: f64,
    #[serde(rename = "skewResidual")]
    pub skew_residual: f64,
    pub shadow: ShadowDescriptor,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shading: Option<ShadingModel>,
    pub warp: WarpDescriptor,
    pub corrections: CorrectionsRecord,
    pub stats: NormalizationStats,
    pub baseline: BaselineMetrics,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence_gate: Option<ConfidenceGateRecord>,
    #[serde(rename = "previewPaths", default)]
    pub preview_paths: Vec<PathBuf>,
    #[serde(rename = "spreadSplit", skip_serializing_if = "Option::is_none")]
    pub spread_split: Option<SpreadSplitRecord>,
    #[serde(rename = "processingMs")]
    pub processing_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpreadSplitRecord {
    #[serde(rename = "sourcePageId")]
    pub source_page_id: String,
    pub side: SpreadSide,
    pub confidence: f64,
    #[serde(rename = "startRatio")]
    pub start_ratio: f64,
    #[serde(rename = "endRatio")]
    pub end_ratio: f64,
}

/// A rectangular region detected on a normalized page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ElementType {
    PageBounds,
    TextBlock,
    Title,
    RunningHead,
    Folio,
    Ornament,
    DropCap,
    Footnote,
    Marginalia,
}

impl ElementType {
    /// Fixed overlay color per spec §4.7 artifacts table, as `(r, g, b)`.
    pub fn overlay_color(self) -> (u8, u8, u8) {
        match self {
            ElementType::PageBounds => (0x3b, 0x82, 0xf6),
            ElementType::TextBlock => (0x22, 0xc5, 0x5e),
            ElementType::Title => (0xec, 0x48, 0x99),
            ElementType::RunningHead => (0xf9, 0x73, 0x16),
            ElementType::Folio => (0xa8, 0x55, 0xf7),
            ElementType::Ornament => (0x14, 0xb8, 0xa6),
            ElementType::DropCap => (0xfa, 0xcc, 0x15),
            ElementType::Footnote => (0x0e, 0xa5, 0xe9),
            ElementType::Marginalia => (0x94, 0xa3, 0xb8),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ElementSource {
    Local,
    NativeAccelerator,
    Remote,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayoutElement {
    pub id: String,
    #[serde(rename = "type")]
    pub element_type: ElementType,
    pub bbox: Box4,
    pub confidence: f64,
    pub source: ElementSource,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub flags: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

/// Layout profile assigned by the classifier. See spec §4.6.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LayoutProfile {
    Cover,
    Title,
    FrontMatter,
    BackMatter,
    Appendix,
    Index,
    Illustration,
    Table,
    ChapterOpening,
    Body,
    Blank,
    Unknown,
}

impl LayoutProfile {
    /// True for profiles the layout-confidence weighting table treats as
    /// "text-heavy" (weight 0.55 on the profile term).
    pub fn is_text_heavy(self) -> bool {
        matches!(self, LayoutProfile::Body | LayoutProfile::ChapterOpening)
    }

    /// True for profiles treated as "visual-heavy" (weight 0.35).
    pub fn is_visual_heavy(self) -> bool {
        matches!(self, LayoutProfile::Illustration | LayoutProfile::Blank)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReviewReasonKind {
    QualityGate,
    SemanticLayout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SuggestedAction {
    Confirm,
    Adjust,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PreviewKind {
    Source,
    Normalized,
    Overlay,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreviewRef {
    pub kind: PreviewKind,
    pub path: PathBuf,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewGutter {
    #[serde(rename = "startRatio")]
    pub start_ratio: f64,
    #[serde(rename = "endRatio")]
    pub end_ratio: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewSpreadInfo {
    #[serde(rename = "sourcePageId")]
    pub source_page_id: String,
    pub side: SpreadSide,
    pub gutter: ReviewGutter,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityGateSummary {
    pub accepted: bool,
    pub reasons: Vec<String>,
}

/// One entry in `review-queue.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewItem {
    #[serde(rename = "pageId")]
    pub page_id: String,
    pub filename: String,
    #[serde(rename = "layoutProfile")]
    pub layout_profile: LayoutProfile,
    #[serde(rename = "layoutConfidence")]
    pub layout_confidence: f64,
    #[serde(rename = "qualityGate")]
    pub quality_gate: QualityGateSummary,
    pub reason: ReviewReasonKind,
    pub previews: Vec<PreviewRef>,
    #[serde(rename = "suggestedAction")]
    pub suggested_action: SuggestedAction,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spread: Option<ReviewSpreadInfo>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Completed,
    Cancelled,
    Failed,
}

/// An entry in the process-wide `run-index.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    #[serde(rename = "runId")]
    pub run_id: String,
    #[serde(rename = "runDir")]
    pub run_dir: PathBuf,
    #[serde(rename = "projectId")]
    pub project_id: String,
    #[serde(rename = "generatedAt")]
    pub generated_at: String,
    pub status: RunStatus,
    #[serde(rename = "reviewCount")]
    pub review_count: usize,
    #[serde(rename = "reportPath")]
    pub report_path: PathBuf,
    #[serde(rename = "startedAt")]
    pub started_at: String,
    #[serde(rename = "updatedAt")]
    pub updated_at: String,
}

/// `source` block of a [`PageSidecar`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SidecarSource {
    pub path: PathBuf,
    pub checksum: Option<String>,
}

/// Physical page dimensions as persisted in the sidecar (always `"mm"`).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SidecarDimensions {
    pub width: f64,
    pub height: f64,
    pub unit: &'static str,
}

impl SidecarDimensions {
    pub fn mm(width: f64, height: f64) -> Self {
        Self { width, height, unit: "mm" }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SidecarShading {
    pub method: String,
    #[serde(rename = "backgroundModel")]
    pub background_model: String,
    #[serde(rename = "spineShadowModel")]
    pub spine_shadow_model: String,
    pub params: serde_json::Value,
    pub confidence: f64,
}

/// Baseline-grid guide, spec §6 `normalization.guides.baselineGrid`.
/// Open question (b) in spec §9 is resolved by keeping `spacing_mad`
/// (and this grid's spacing) in raw pixels, matching `medianSpacingPx`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BaselineGridGuide {
    #[serde(rename = "spacingPx")]
    pub spacing_px: f64,
    #[serde(rename = "offsetPx")]
    pub offset_px: f64,
    #[serde(rename = "angleDeg")]
    pub angle_deg: f64,
    pub confidence: f64,
    #[serde(rename = "snapToPeaks", skip_serializing_if = "Option::is_none")]
    pub snap_to_peaks: Option<bool>,
    #[serde(rename = "markCorrect", skip_serializing_if = "Option::is_none")]
    pub mark_correct: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SidecarGuides {
    #[serde(rename = "baselineGrid", skip_serializing_if = "Option::is_none")]
    pub baseline_grid: Option<BaselineGridGuide>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SidecarNormalization {
    #[serde(rename = "cropBox")]
    pub crop_box: Box4,
    #[serde(rename = "pageMask")]
    pub page_mask: Box4,
    #[serde(rename = "dpiSource")]
    pub dpi_source: DimensionSource,
    pub bleed: f64,
    pub trim: f64,
    pub scale: (f64, f64),
    #[serde(rename = "skewAngle")]
    pub skew_angle: f64,
    pub warp: WarpDescriptor,
    pub shadow: ShadowDescriptor,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shading: Option<SidecarShading>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub guides: Option<SidecarGuides>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SidecarMetrics {
    #[serde(rename = "processingMs")]
    pub processing_ms: u64,
    #[serde(rename = "deskewConfidence")]
    pub deskew_confidence: f64,
    #[serde(rename = "shadowScore")]
    pub shadow_score: f64,
    #[serde(rename = "maskCoverage")]
    pub mask_coverage: f64,
    #[serde(rename = "backgroundMean")]
    pub background_mean: f64,
    #[serde(rename = "backgroundStd")]
    pub background_std: f64,
    #[serde(rename = "illuminationResidual", skip_serializing_if = "Option::is_none")]
    pub illumination_residual: Option<f64>,
    #[serde(rename = "spineShadowScore", skip_serializing_if = "Option::is_none")]
    pub spine_shadow_score: Option<f64>,
    #[serde(rename = "layoutScore")]
    pub layout_score: f64,
    pub baseline: BaselineMetrics,
}

/// Persisted per-page record, `runs/<runId>/sidecars/<pageId>.json`
/// (spec §6 "Sidecar JSON").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageSidecar {
    pub version: u32,
    #[serde(rename = "pageId")]
    pub page_id: String,
    pub source: SidecarSource,
    pub dimensions: SidecarDimensions,
    pub dpi: f64,
    pub normalization: SidecarNormalization,
    pub elements: Vec<LayoutElement>,
    pub metrics: SidecarMetrics,
    #[serde(rename = "bookModel", skip_serializing_if = "Option::is_none")]
    pub book_model: Option<BookModel>,
}

/// One `manifest.json` entry per successfully normalized page (spec §3
/// "Ownership and lifecycle", §8 invariants 2–3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestEntry {
    #[serde(rename = "pageId")]
    pub page_id: String,
    pub checksum: Option<String>,
    #[serde(rename = "normalizedFile")]
    pub normalized_file: PathBuf,
    #[serde(rename = "previewFiles", default)]
    pub preview_files: Vec<PathBuf>,
    #[serde(rename = "layoutProfile")]
    pub layout_profile: LayoutProfile,
    #[serde(rename = "layoutConfidence")]
    pub layout_confidence: f64,
    #[serde(rename = "qualityGateAccepted")]
    pub quality_gate_accepted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub version: u32,
    #[serde(rename = "runId")]
    pub run_id: String,
    #[serde(rename = "projectId")]
    pub project_id: String,
    pub status: RunStatus,
    #[serde(rename = "generatedAt")]
    pub generated_at: String,
    pub pages: Vec<ManifestEntry>,
    pub errors: Vec<PageError>,
}

/// `report.json.determinism` (spec §4.7 "Determinism").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportDeterminism {
    #[serde(rename = "appVersion")]
    pub app_version: String,
    #[serde(rename = "configHash")]
    pub config_hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportNormalizationSummary {
    #[serde(rename = "firstPassCount")]
    pub first_pass_count: usize,
    #[serde(rename = "secondPassCount")]
    pub second_pass_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Report {
    pub version: u32,
    #[serde(rename = "runId")]
    pub run_id: String,
    #[serde(rename = "projectId")]
    pub project_id: String,
    pub status: RunStatus,
    #[serde(rename = "startedAt")]
    pub started_at: String,
    #[serde(rename = "updatedAt")]
    pub updated_at: String,
    #[serde(rename = "totalPages")]
    pub total_pages: usize,
    #[serde(rename = "succeededPages")]
    pub succeeded_pages: usize,
    #[serde(rename = "reviewCount")]
    pub review_count: usize,
    pub normalization: ReportNormalizationSummary,
    pub errors: Vec<PageError>,
    pub determinism: ReportDeterminism,
}

/// `review-queue.json` — a thin envelope around the review items, spec §3.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewQueueFile {
    pub version: u32,
    #[serde(rename = "runId")]
    pub run_id: String,
    pub items: Vec<ReviewItem>,
}

/// `run-index.json` at the output root: every run the output directory
/// has ever seen (spec §3 "RunRecord").
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunIndex {
    pub runs: Vec<RunRecord>,
}

/// Return value of `orchestrator::run_pipeline` (spec §6 `PipelineRunnerResult`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRunnerResult {
    #[serde(rename = "runId")]
    pub run_id: String,
    #[serde(rename = "runDir")]
    pub run_dir: PathBuf,
    pub status: RunStatus,
    pub manifest: Manifest,
    pub report: Report,
    #[serde(rename = "reviewQueue")]
    pub review_queue: ReviewQueueFile,
    pub errors: Vec<PageError>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounds_estimate_validates_containment() {
        let est = PageBoundsEstimate {
            page_id: "p1".into(),
            width_px: 1000,
            height_px: 1000,
            bleed_px: 10.0,
            trim_px: 0.0,
            page_bounds: [0, 0, 999, 999],
            content_bounds: [10, 10, 990, 990],
            dimension_source: DimensionSource::Inferred,
        };
        assert!(est.is_valid());
    }

    #[test]
    fn bounds_estimate_rejects_escaping_content_box() {
        let est = PageBoundsEstimate {
            page_id: "p1".into(),
            width_px: 1000,
            height_px: 1000,
            bleed_px: 10.0,
            trim_px: 0.0,
            page_bounds: [10, 10, 990, 990],
            content_bounds: [0, 0, 995, 995],
            dimension_source: DimensionSource::Inferred,
        };
        assert!(!est.is_valid());
    }

    #[test]
    fn split_child_suffixes_id_and_checksum() {
        let page = Page::new(
            "p001".into(),
            "p001.png".into(),
            PathBuf::from("/scans/p001.png"),
            Some("abc123".into()),
        );
        let left = page.split_child(SpreadSide::Left);
        assert_eq!(left.id, "p001_L");
        assert_eq!(left.checksum.as_deref(), Some("abc123:L"));
    }

    #[test]
    fn element_type_overlay_colors_match_spec() {
        assert_eq!(ElementType::PageBounds.overlay_color(), (0x3b, 0x82, 0xf6));
        assert_eq!(ElementType::Ornament.overlay_color(), (0x14, 0xb8, 0xa6));
    }
}
