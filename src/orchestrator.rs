//! Orchestrator: phase sequencing, the bounded worker pool, cancellation
//! and pause cooperation, and the top-level `run_pipeline` /
//! `evaluate_results` entry points (spec §4.7, §5, §6).
//!
//! The worker pool is grounded in the teacher's
//! `convert::process_concurrent_lazy` — a stream of per-item async work
//! fed through `buffer_unordered(concurrency)` — generalized from "one
//! VLM call per rendered page" to "one CPU-bound normalization kernel per
//! scanned page", with the blocking kernel itself run inside
//! `spawn_blocking` rather than awaited inline.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use image::{DynamicImage, GenericImageView, imageops::FilterType};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::analyzer;
use crate::config::PipelineConfig;
use crate::error::{PageError, Phase, PipelineError, PipelineResult};
use crate::layout;
use crate::model::{
    Box4, BookModel, CorpusSummary, ElementSource, ElementType, LayoutElement, LayoutProfile,
    Manifest, ManifestEntry, Page, PageBoundsEstimate, PageSidecar, PipelineRunnerResult,
    PreviewKind, PreviewRef, Report, ReportDeterminism, ReportNormalizationSummary, ReviewGutter,
    ReviewItem, ReviewQueueFile, ReviewReasonKind, ReviewSpreadInfo, RunRecord, RunStatus,
    SidecarDimensions, SidecarGuides, SidecarMetrics, SidecarNormalization, SidecarShading,
    SidecarSource, SpreadSide, SpreadSplitRecord, SuggestedAction,
};
use crate::normalize::{self, NormalizeOptions};
use crate::overlay;
use crate::priors::{self, PriorSample};
use crate::progress::{self, ProgressCallback};
use crate::remote;
use crate::scanner;
use crate::sidecar;
use crate::spread;

const APP_VERSION: &str = env!("CARGO_PKG_VERSION");
const PREVIEW_MAX_DIMENSION: u32 = 480;

/// Cooperative cancellation (spec §5 "Cancellation"): polled at phase
/// boundaries and before each page begins. Cheap to clone and share
/// across worker tasks.
#[derive(Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Cooperative pause gate (spec §5 "Suspension points"): workers await
/// this before starting each page and before each major phase.
#[derive(Default)]
pub struct PauseGate {
    paused: AtomicBool,
    notify: Notify,
}

impl PauseGate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub async fn wait_if_paused(&self) {
        while self.paused.load(Ordering::SeqCst) {
            self.notify.notified().await;
        }
    }
}

/// Everything `run_pipeline` needs beyond the resolved [`PipelineConfig`]:
/// the cancellation/pause cooperative primitives and a progress sink.
/// Mirrors spec §6's `signal?` / `waitIfPaused?` / `onProgress?`.
#[derive(Default)]
pub struct RunPipelineOptions {
    pub config_override: Option<PipelineConfig>,
    pub cancellation: Option<CancellationToken>,
    pub pause_gate: Option<Arc<PauseGate>>,
    pub on_progress: Option<ProgressCallback>,
}

struct PageWork {
    page: Page,
    image: DynamicImage,
    raw_bytes: Vec<u8>,
    estimate: PageBoundsEstimate,
    spread_record: Option<SpreadSplitRecord>,
    child_side: Option<SpreadSide>,
}

/// Everything produced for one page by one normalization attempt.
struct PageAttempt {
    page_id: String,
    filename: String,
    original_path: PathBuf,
    checksum: Option<String>,
    processed_image: DynamicImage,
    source_image_for_preview: DynamicImage,
    normalized_size: (u32, u32),
    crop_size: (u32, u32),
    elements: Vec<LayoutElement>,
    layout_profile: LayoutProfile,
    layout_confidence: f64,
    quality_gate: crate::model::QualityGateSummary,
    result: crate::model::NormalizationResult,
    spread_record: Option<SpreadSplitRecord>,
    child_side: Option<SpreadSide>,
}

fn rebase_estimate(base: &PageBoundsEstimate, page_id: &str, image: &DynamicImage) -> PageBoundsEstimate {
    let (w, h) = image.dimensions();
    let inset_i = (base.bleed_px + base.trim_px).round() as i64;
    let page_bounds: Box4 = [0, 0, w as i64 - 1, h as i64 - 1];
    let content_bounds: Box4 = [
        inset_i.min(page_bounds[2]),
        inset_i.min(page_bounds[3]),
        (page_bounds[2] - inset_i).max(page_bounds[0]),
        (page_bounds[3] - inset_i).max(page_bounds[1]),
    ];
    PageBoundsEstimate {
        page_id: page_id.to_string(),
        width_px: w,
        height_px: h,
        bleed_px: base.bleed_px,
        trim_px: base.trim_px,
        page_bounds,
        content_bounds,
        dimension_source: base.dimension_source,
    }
}

/// Builds the per-page work list: loads every scanned page's raster and,
/// if spread-splitting is enabled, replaces wide two-page spreads with
/// their `_L`/`_R` children (spec §4.3, §4.7 phase order).
fn build_page_work(
    pages: Vec<Page>,
    summary: &CorpusSummary,
    config: &PipelineConfig,
    errors: &mut Vec<PageError>,
) -> Vec<PageWork> {
    let mut work = Vec::with_capacity(pages.len());
    for page in pages {
        let raw_bytes = match std::fs::read(&page.original_path) {
            Ok(bytes) => bytes,
            Err(e) => {
                errors.push(PageError::for_page(
                    Phase::Normalization,
                    page.id.clone(),
                    format!("failed to read image file: {e}"),
                ));
                continue;
            }
        };
        let image = match image::load_from_memory(&raw_bytes) {
            Ok(img) => img,
            Err(e) => {
                errors.push(PageError::for_page(
                    Phase::Normalization,
                    page.id.clone(),
                    format!("failed to decode image: {e}"),
                ));
                continue;
            }
        };
        let estimate = summary
            .estimate_for(&page.id)
            .cloned()
            .unwrap_or_else(|| rebase_estimate(
                &PageBoundsEstimate {
                    page_id: page.id.clone(),
                    width_px: image.width(),
                    height_px: image.height(),
                    bleed_px: config.normalization.bleed_mm,
                    trim_px: 0.0,
                    page_bounds: [0, 0, image.width() as i64 - 1, image.height() as i64 - 1],
                    content_bounds: [0, 0, image.width() as i64 - 1, image.height() as i64 - 1],
                    dimension_source: crate::model::DimensionSource::Fallback,
                },
                &page.id,
                &image,
            ));

        if config.enable_spread_split {
            if let Some(outcome) = spread::try_split(&page, &image, config.spread_split_confidence) {
                let left_estimate = rebase_estimate(&estimate, &outcome.left_page.id, &outcome.left_image);
                let right_estimate = rebase_estimate(&estimate, &outcome.right_page.id, &outcome.right_image);
                work.push(PageWork {
                    page: outcome.left_page,
                    image: outcome.left_image,
                    raw_bytes: raw_bytes.clone(),
                    estimate: left_estimate,
                    spread_record: Some(outcome.left_record),
                    child_side: Some(SpreadSide::Left),
                });
                work.push(PageWork {
                    page: outcome.right_page,
                    image: outcome.right_image,
                    raw_bytes,
                    estimate: right_estimate,
                    spread_record: Some(outcome.right_record),
                    child_side: Some(SpreadSide::Right),
                });
                continue;
            }
        }

        work.push(PageWork {
            page,
            image,
            raw_bytes,
            estimate,
            spread_record: None,
            child_side: None,
        });
    }
    work
}

fn median_f64(values: &mut [f64]) -> f64 {
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

fn gutter_strip_for_child(side: SpreadSide, width: u32, height: u32) -> Box4 {
    let stripe = (width / 50).max(4) as i64;
    match side {
        SpreadSide::Left => [width as i64 - stripe, 0, width as i64 - 1, height as i64 - 1],
        SpreadSide::Right => [0, 0, stripe - 1, height as i64 - 1],
    }
}

fn downscale_preview(image: &DynamicImage) -> DynamicImage {
    let (w, h) = image.dimensions();
    if w <= PREVIEW_MAX_DIMENSION && h <= PREVIEW_MAX_DIMENSION {
        image.clone()
    } else {
        image.resize(PREVIEW_MAX_DIMENSION, PREVIEW_MAX_DIMENSION, FilterType::Triangle)
    }
}

/// Profiles that always route to the review queue for human confirmation
/// even when layout confidence clears the threshold — a cover or title
/// page's *identity* still wants a human's eyes (spec §8 scenario 4).
fn always_confirm(profile: LayoutProfile) -> bool {
    matches!(profile, LayoutProfile::Cover | LayoutProfile::Title)
}

/// Runs the normalization kernel for one page plus everything the
/// sidecar/overlay/review machinery needs around it: layout
/// classification, the quality gate, and (if configured) the remote
/// layout collaborator.
async fn normalize_one(
    work: PageWork,
    options: Arc<NormalizeOptions>,
    book_model: Arc<Option<BookModel>>,
    corpus_median_mask_coverage: f64,
    remote_config: Option<crate::config::RemoteLayoutConfig>,
) -> Result<PageAttempt, PageError> {
    let page_id = work.page.id.clone();
    let filename = work.page.filename.clone();
    let original_path = work.page.original_path.clone();
    let checksum = work.page.checksum.clone();
    let source_image_for_preview = work.image.clone();
    let estimate = work.estimate.clone();
    let spread_record = work.spread_record.clone();
    let child_side = work.child_side;
    let spread_split_confidence = spread_record.as_ref().map(|r| r.confidence);

    let kernel_page_id = page_id.clone();
    let kernel_book_model = Arc::clone(&book_model);
    let (processed_image, result) = tokio::task::spawn_blocking(move || {
        normalize::normalize_page(&work.image, &work.raw_bytes, &kernel_page_id, &estimate, &options, kernel_book_model.as_ref().as_ref())
    })
    .await
    .map_err(|e| PageError::for_page(Phase::Normalization, page_id.clone(), format!("normalization task panicked: {e}")))?;

    let crop_size = {
        let [x0, y0, x1, y1] = result.crop_box;
        (((x1 - x0 + 1).max(1)) as u32, ((y1 - y0 + 1).max(1)) as u32)
    };
    let normalized_size = processed_image.dimensions();

    let mut elements = vec![LayoutElement {
        id: format!("{page_id}-page-bounds"),
        element_type: ElementType::PageBounds,
        bbox: [0, 0, normalized_size.0 as i64 - 1, normalized_size.1 as i64 - 1],
        confidence: 1.0,
        source: ElementSource::Local,
        flags: vec![],
        text: None,
        notes: None,
    }];

    if let Some(remote_cfg) = remote_config {
        match remote::infer_layout(&page_id, &processed_image, &remote_cfg).await {
            Ok((remote_elements, upload_w, upload_h)) => {
                for element in remote_elements {
                    let bbox = overlay::rescale_bbox(element.bbox, (upload_w, upload_h), normalized_size);
                    elements.push(LayoutElement { bbox, ..element });
                }
            }
            Err(_) => {
                // Remote collaborator is optional; a failure here doesn't
                // fail the page, it just means no remote elements this run.
            }
        }
    }

    let (layout_profile, layout_confidence, _reasons) = layout::classify(&filename, &result.stats, &elements);
    let quality_gate = layout::evaluate_quality_gate(
        &result,
        layout_profile,
        layout_confidence,
        book_model.as_ref().as_ref(),
        corpus_median_mask_coverage,
        spread_split_confidence,
        crop_size,
        normalized_size,
    );

    Ok(PageAttempt {
        page_id,
        filename,
        original_path,
        checksum,
        processed_image,
        source_image_for_preview,
        normalized_size,
        crop_size,
        elements,
        layout_profile,
        layout_confidence,
        quality_gate,
        result,
        spread_record,
        child_side,
    })
}

/// Runs `work` through `normalize_one` under a bounded worker pool,
/// honoring cancellation and the pause gate before each page starts.
async fn run_pass(
    work: Vec<PageWork>,
    options: Arc<NormalizeOptions>,
    book_model: Arc<Option<BookModel>>,
    corpus_median_mask_coverage: f64,
    config: &PipelineConfig,
    cancellation: &CancellationToken,
    pause_gate: &Arc<PauseGate>,
    progress: &ProgressCallback,
    errors: &mut Vec<PageError>,
) -> Vec<PageAttempt> {
    let total = work.len();
    let concurrency = config.effective_concurrency(total);
    let remote_config = config.remote_layout.clone();

    let results: Vec<Option<PageAttempt>> = stream::iter(work.into_iter().enumerate())
        .map(|(index, item)| {
            let options = Arc::clone(&options);
            let book_model = Arc::clone(&book_model);
            let remote_config = remote_config.clone();
            let cancellation = cancellation.clone();
            let pause_gate = Arc::clone(pause_gate);
            let progress = Arc::clone(progress);
            let page_id = item.page.id.clone();
            async move {
                if cancellation.is_cancelled() {
                    return None;
                }
                pause_gate.wait_if_paused().await;
                progress.on_page_start(page_id.clone(), index, total);
                match normalize_one(item, options, book_model, corpus_median_mask_coverage, remote_config).await {
                    Ok(attempt) => {
                        progress.on_page_complete(attempt.page_id.clone(), index, total);
                        Some(Ok(attempt))
                    }
                    Err(err) => {
                        progress.on_page_error(page_id, index, total, err.message.clone());
                        Some(Err(err))
                    }
                }
            }
        })
        .buffer_unordered(concurrency)
        .collect::<Vec<Option<Result<PageAttempt, PageError>>>>()
        .await
        .into_iter()
        .map(|outcome| match outcome {
            None => None,
            Some(Ok(attempt)) => Some(attempt),
            Some(Err(err)) => {
                errors.push(err);
                None
            }
        })
        .collect();

    results.into_iter().flatten().collect()
}

fn build_sidecar(attempt: &PageAttempt, config: &PipelineConfig) -> PageSidecar {
    let result = &attempt.result;
    let scale = (
        attempt.normalized_size.0 as f64 / attempt.crop_size.0.max(1) as f64,
        attempt.normalized_size.1 as f64 / attempt.crop_size.1.max(1) as f64,
    );

    let guides = result.baseline.median_spacing_px.map(|spacing_px| SidecarGuides {
        baseline_grid: Some(crate::model::BaselineGridGuide {
            spacing_px,
            offset_px: result.baseline.peaks_y.as_ref().and_then(|p| p.first()).map(|v| *v as f64).unwrap_or(0.0),
            angle_deg: 0.0,
            confidence: result.baseline.confidence,
            snap_to_peaks: None,
            mark_correct: None,
            source: Some("baseline-metrics".to_string()),
        }),
    });

    PageSidecar {
        version: 1,
        page_id: attempt.page_id.clone(),
        source: SidecarSource {
            path: attempt.original_path.clone(),
            checksum: attempt.checksum.clone(),
        },
        dimensions: SidecarDimensions::mm(result.dimensions_mm.0, result.dimensions_mm.1),
        dpi: result.dpi,
        normalization: SidecarNormalization {
            crop_box: result.crop_box,
            page_mask: result.mask_box,
            dpi_source: result.dpi_source,
            bleed: config.normalization.bleed_mm,
            trim: 0.0,
            scale,
            skew_angle: result.skew_angle,
            warp: result.warp,
            shadow: result.shadow,
            shading: result.shading.as_ref().map(|s| SidecarShading {
                method: s.method.clone(),
                background_model: s.background_model.clone(),
                spine_shadow_model: s.spine_shadow_model.clone(),
                params: s.params.clone(),
                confidence: s.confidence,
            }),
            guides,
        },
        elements: attempt.elements.clone(),
        metrics: SidecarMetrics {
            processing_ms: result.processing_ms,
            deskew_confidence: result.stats.skew_confidence,
            shadow_score: result.stats.shadow_score,
            mask_coverage: result.stats.mask_coverage,
            background_mean: result.stats.border_mean,
            background_std: result.stats.border_std,
            illumination_residual: result.stats.illumination_residual,
            spine_shadow_score: Some(result.stats.shadow_score),
            layout_score: attempt.layout_confidence,
            baseline: result.baseline.clone(),
        },
        book_model: None,
    }
}

/// Reads the prior run's manifest (if any) and deletes normalized/preview
/// files for pages whose checksum changed or whose id vanished from the
/// current scan (spec §4.7 "Cleanup of stale outputs").
fn cleanup_stale_outputs(run_dir: &std::path::Path, current: &HashMap<String, Option<String>>) {
    let path = sidecar::manifest_path(run_dir);
    let Ok(raw) = std::fs::read_to_string(&path) else { return };
    let Ok(prior): Result<Manifest, _> = serde_json::from_str(&raw) else { return };

    for entry in prior.pages {
        let stale = match current.get(&entry.page_id) {
            None => true,
            Some(checksum) => checksum != &entry.checksum,
        };
        if stale {
            sidecar::remove_page_outputs(&entry.normalized_file, &entry.preview_files);
        }
    }
}

/// Top-level entry point (spec §6 `runPipeline`). Only a scan-phase
/// failure aborts the run; every other failure is collected into the
/// result's `errors[]` and the run proceeds (spec §7 "Propagation policy").
pub async fn run_pipeline(config: PipelineConfig, options: RunPipelineOptions) -> PipelineResult<PipelineRunnerResult> {
    let config = options.config_override.unwrap_or(config);
    let cancellation = options.cancellation.unwrap_or_default();
    let pause_gate = options.pause_gate.unwrap_or_else(PauseGate::new);
    let on_progress = options.on_progress.unwrap_or_else(progress::noop);

    let run_id = config.run_id.clone().unwrap_or_else(sidecar::generate_run_id);
    let run_dir = config.output_dir.join("runs").join(&run_id);
    let started_at = sidecar::now_iso8601();
    info!("starting run {} for project '{}'", run_id, config.project_id);

    let mut errors: Vec<PageError> = Vec::new();

    // ── Phase: Scan ───────────────────────────────────────────────────────
    on_progress.on_phase_start(Phase::Scan);
    let pages = scanner::scan(&config.project_root, config.include_checksums)?;
    on_progress.on_phase_complete(Phase::Scan);
    on_progress.on_run_start(pages.len());
    info!("scanned {} pages under '{}'", pages.len(), config.project_root.display());

    if cancellation.is_cancelled() {
        warn!("run {} cancelled before analysis started", run_id);
        return finalize_cancelled(&config, &run_id, &run_dir, &started_at, pages.len(), errors);
    }

    // ── Phase: Analysis ───────────────────────────────────────────────────
    on_progress.on_phase_start(Phase::Analysis);
    let summary = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| analyzer::analyze(&pages, &config)))
        .unwrap_or_else(|_| {
            warn!("corpus analyzer panicked; falling back to a conservative summary");
            errors.push(PageError::run_scoped(Phase::Analysis, "analyzer panicked; using fallback summary"));
            (analyzer::fallback_summary(&pages, &config), Vec::new())
        });
    let (summary, mut analysis_errors) = summary;
    errors.append(&mut analysis_errors);
    on_progress.on_phase_complete(Phase::Analysis);
    debug!("corpus target aspect ratio: {:.4}", summary.target_aspect_ratio());

    // ── Phase: SpreadSplit ────────────────────────────────────────────────
    on_progress.on_phase_start(Phase::SpreadSplit);
    let work = build_page_work(pages, &summary, &config, &mut errors);
    on_progress.on_phase_complete(Phase::SpreadSplit);
    debug!("{} page-work items after spread-splitting", work.len());

    let current_checksums: HashMap<String, Option<String>> =
        work.iter().map(|w| (w.page.id.clone(), w.page.checksum.clone())).collect();
    cleanup_stale_outputs(&run_dir, &current_checksums);

    let mut book_model: Option<BookModel> = None;
    let mut corpus_median_mask_coverage = 0.0;
    if config.enable_book_priors {
        on_progress.on_phase_start(Phase::BookPriors);
        let sample_count = config.book_priors_sample_count.min(work.len());
        debug!("book-priors sampling {} of {} pages", sample_count, work.len());
        let sample_work: Vec<PageWork> = work
            .iter()
            .take(sample_count)
            .map(|w| PageWork {
                page: w.page.clone(),
                image: w.image.clone(),
                raw_bytes: w.raw_bytes.clone(),
                estimate: w.estimate.clone(),
                spread_record: w.spread_record.clone(),
                child_side: w.child_side,
            })
            .collect();

        let sample_options = Arc::new(NormalizeOptions::first_pass(&config, &summary));
        let mut sample_errors = Vec::new();
        let sample_attempts = run_pass(
            sample_work,
            sample_options,
            Arc::new(None),
            0.0,
            &config,
            &cancellation,
            &pause_gate,
            &on_progress,
            &mut sample_errors,
        )
        .await;
        for err in sample_errors {
            errors.push(PageError { phase: Phase::BookPriors, ..err });
        }

        if sample_attempts.len() >= 2 {
            let samples: Vec<PriorSample> = sample_attempts
                .iter()
                .map(|a| PriorSample { result: &a.result, image: &a.processed_image })
                .collect();
            book_model = priors::build_book_model(&samples);
        }
        if book_model.is_none() {
            warn!("book-priors sample phase produced fewer than 2 usable pages; continuing without a book model");
            errors.push(PageError::run_scoped(
                Phase::BookPriors,
                "book-priors sample phase produced fewer than 2 usable pages; continuing without a book model",
            ));
        }
        if !sample_attempts.is_empty() {
            let mut coverages: Vec<f64> = sample_attempts.iter().map(|a| a.result.stats.mask_coverage).collect();
            corpus_median_mask_coverage = median_f64(&mut coverages);
        }
        on_progress.on_phase_complete(Phase::BookPriors);
    }
    let book_model = Arc::new(book_model);

    // ── Phase: Normalization (first pass) ────────────────────────────────
    on_progress.on_phase_start(Phase::Normalization);
    let first_pass_options = Arc::new(NormalizeOptions::first_pass(&config, &summary));
    let mut first_pass_errors = Vec::new();
    let total_pages = work.len();
    let mut attempts = run_pass(
        work,
        first_pass_options,
        Arc::clone(&book_model),
        corpus_median_mask_coverage,
        &config,
        &cancellation,
        &pause_gate,
        &on_progress,
        &mut first_pass_errors,
    )
    .await;
    errors.append(&mut first_pass_errors);

    let mut attempt_by_id: HashMap<String, PageAttempt> =
        attempts.drain(..).map(|a| (a.page_id.clone(), a)).collect();

    let failing_ids: Vec<String> = attempt_by_id
        .values()
        .filter(|a| !a.quality_gate.accepted)
        .map(|a| a.page_id.clone())
        .collect();
    let second_pass_count = failing_ids.len();

    if !failing_ids.is_empty() && !cancellation.is_cancelled() {
        info!("{} page(s) failed the quality gate; retrying with relaxed tolerances", failing_ids.len());
        // Re-derive work items for the failing pages from their original
        // rasters so the second pass re-runs the full kernel rather than
        // re-processing an already-normalized image.
        let retry_work: Vec<PageWork> = failing_ids
            .iter()
            .filter_map(|id| {
                let attempt = attempt_by_id.get(id)?;
                let raw_bytes = std::fs::read(&attempt.original_path).ok()?;
                let image = if attempt.spread_record.is_some() {
                    attempt.source_image_for_preview.clone()
                } else {
                    image::load_from_memory(&raw_bytes).ok()?
                };
                Some(PageWork {
                    page: Page::new(attempt.page_id.clone(), attempt.filename.clone(), attempt.original_path.clone(), attempt.checksum.clone()),
                    estimate: rebase_estimate(&summary.estimate_for(id).cloned().unwrap_or_else(|| {
                        PageBoundsEstimate {
                            page_id: id.clone(),
                            width_px: image.width(),
                            height_px: image.height(),
                            bleed_px: config.normalization.bleed_mm,
                            trim_px: 0.0,
                            page_bounds: [0, 0, image.width() as i64 - 1, image.height() as i64 - 1],
                            content_bounds: [0, 0, image.width() as i64 - 1, image.height() as i64 - 1],
                            dimension_source: crate::model::DimensionSource::Fallback,
                        }
                    }), id, &image),
                    image,
                    raw_bytes,
                    spread_record: attempt.spread_record.clone(),
                    child_side: attempt.child_side,
                })
            })
            .collect();

        let second_pass_options = Arc::new(NormalizeOptions::second_pass(&config, &summary));
        let mut second_pass_errors = Vec::new();
        let retried = run_pass(
            retry_work,
            second_pass_options,
            Arc::clone(&book_model),
            corpus_median_mask_coverage,
            &config,
            &cancellation,
            &pause_gate,
            &on_progress,
            &mut second_pass_errors,
        )
        .await;
        errors.append(&mut second_pass_errors);

        for attempt in retried {
            attempt_by_id.insert(attempt.page_id.clone(), attempt);
        }
    }
    on_progress.on_phase_complete(Phase::Normalization);

    on_progress.on_phase_start(Phase::Sidecar);
    let mut sorted_ids: Vec<String> = attempt_by_id.keys().cloned().collect();
    sorted_ids.sort();

    let mut manifest_entries = Vec::with_capacity(sorted_ids.len());
    let mut review_items = Vec::new();

    for page_id in &sorted_ids {
        let attempt = attempt_by_id.get(page_id).expect("key came from this map");

        let normalized_file = sidecar::normalized_path(&run_dir, page_id);
        if let Err(e) = sidecar::write_png_atomic(&normalized_file, &attempt.processed_image) {
            errors.push(PageError::for_page(Phase::Sidecar, page_id.clone(), format!("failed to write normalized png: {e}")));
            continue;
        }

        let mut preview_files = Vec::new();
        if config.normalization.generate_previews {
            let source_preview = downscale_preview(&attempt.source_image_for_preview);
            let normalized_preview = downscale_preview(&attempt.processed_image);
            let source_path = sidecar::preview_path(&run_dir, page_id, "source");
            let normalized_preview_path = sidecar::preview_path(&run_dir, page_id, "normalized");
            if sidecar::write_png_atomic(&source_path, &source_preview).is_ok() {
                preview_files.push(source_path);
            }
            if sidecar::write_png_atomic(&normalized_preview_path, &normalized_preview).is_ok() {
                preview_files.push(normalized_preview_path);
            }
        }

        on_progress.on_phase_start(Phase::Overlay);
        let gutter = attempt.child_side.map(|side| {
            (side, gutter_strip_for_child(side, attempt.normalized_size.0, attempt.normalized_size.1))
        });
        let overlay_image = overlay::build_overlay(&attempt.processed_image, &attempt.elements, gutter);
        let overlay_file = sidecar::overlay_path(&run_dir, page_id);
        if let Err(e) = sidecar::write_png_atomic(&overlay_file, &DynamicImage::ImageRgba8(overlay_image)) {
            errors.push(PageError::for_page(Phase::Overlay, page_id.clone(), format!("failed to write overlay png: {e}")));
        }
        on_progress.on_phase_complete(Phase::Overlay);

        let mut sidecar_record = build_sidecar(attempt, &config);
        sidecar_record.book_model = book_model.as_ref().clone();
        if let Err(e) = sidecar::write_sidecar(&run_dir, &sidecar_record) {
            errors.push(e);
            continue;
        }

        manifest_entries.push(ManifestEntry {
            page_id: page_id.clone(),
            checksum: attempt.checksum.clone(),
            normalized_file,
            preview_files: preview_files.clone(),
            layout_profile: attempt.layout_profile,
            layout_confidence: attempt.layout_confidence,
            quality_gate_accepted: attempt.quality_gate.accepted,
        });

        let needs_semantic_confirmation =
            attempt.quality_gate.accepted && always_confirm(attempt.layout_profile);

        if !attempt.quality_gate.accepted || needs_semantic_confirmation {
            let reason = if attempt.quality_gate.accepted {
                ReviewReasonKind::SemanticLayout
            } else {
                ReviewReasonKind::QualityGate
            };
            let previews = preview_files
                .iter()
                .map(|p| PreviewRef {
                    kind: if p.to_string_lossy().contains("-source") {
                        PreviewKind::Source
                    } else {
                        PreviewKind::Normalized
                    },
                    path: p.clone(),
                    width: PREVIEW_MAX_DIMENSION,
                    height: PREVIEW_MAX_DIMENSION,
                })
                .chain(std::iter::once(PreviewRef {
                    kind: PreviewKind::Overlay,
                    path: overlay_file.clone(),
                    width: attempt.normalized_size.0,
                    height: attempt.normalized_size.1,
                }))
                .collect();

            let spread_info = attempt.spread_record.as_ref().map(|record| ReviewSpreadInfo {
                source_page_id: record.source_page_id.clone(),
                side: record.side,
                gutter: ReviewGutter {
                    start_ratio: record.start_ratio,
                    end_ratio: record.end_ratio,
                },
            });

            review_items.push(layout::build_review_item(
                &attempt.result,
                &attempt.filename,
                attempt.layout_profile,
                attempt.layout_confidence,
                attempt.quality_gate.clone(),
                reason,
                previews,
                spread_info,
            ));
        }
    }
    on_progress.on_phase_complete(Phase::Sidecar);

    manifest_entries.sort_by(|a, b| a.page_id.cmp(&b.page_id));
    review_items.sort_by(|a, b| a.page_id.cmp(&b.page_id));

    let status = if cancellation.is_cancelled() { RunStatus::Cancelled } else { RunStatus::Completed };

    let updated_at = sidecar::now_iso8601();

    let manifest = Manifest {
        version: 1,
        run_id: run_id.clone(),
        project_id: config.project_id.clone(),
        status,
        generated_at: updated_at.clone(),
        pages: manifest_entries,
        errors: errors.clone(),
    };

    let report = Report {
        version: 1,
        run_id: run_id.clone(),
        project_id: config.project_id.clone(),
        status,
        started_at: started_at.clone(),
        updated_at: updated_at.clone(),
        total_pages,
        succeeded_pages: manifest.pages.len(),
        review_count: review_items.len(),
        normalization: ReportNormalizationSummary {
            first_pass_count: total_pages,
            second_pass_count,
        },
        errors: errors.clone(),
        determinism: ReportDeterminism {
            app_version: APP_VERSION.to_string(),
            config_hash: config.config_hash(),
        },
    };

    let review_queue = ReviewQueueFile {
        version: 1,
        run_id: run_id.clone(),
        items: review_items,
    };

    on_progress.on_phase_start(Phase::Manifest);
    sidecar::write_manifest(&run_dir, &manifest)?;
    sidecar::write_report(&run_dir, &report)?;
    on_progress.on_phase_complete(Phase::Manifest);

    on_progress.on_phase_start(Phase::ReviewQueue);
    sidecar::write_review_queue(&run_dir, &review_queue)?;
    on_progress.on_phase_complete(Phase::ReviewQueue);

    on_progress.on_phase_start(Phase::RunIndex);
    sidecar::upsert_run_index(
        &config.output_dir,
        RunRecord {
            run_id: run_id.clone(),
            run_dir: run_dir.clone(),
            project_id: config.project_id.clone(),
            generated_at: updated_at.clone(),
            status,
            review_count: review_queue.items.len(),
            report_path: sidecar::report_path(&run_dir),
            started_at: started_at.clone(),
            updated_at,
        },
    )?;
    on_progress.on_phase_complete(Phase::RunIndex);

    on_progress.on_run_complete(total_pages, manifest.pages.len());
    info!(
        "run {} complete: {}/{} pages succeeded, {} queued for review, {} error(s)",
        run_id,
        manifest.pages.len(),
        total_pages,
        review_queue.items.len(),
        errors.len(),
    );

    Ok(PipelineRunnerResult {
        run_id,
        run_dir,
        status,
        manifest,
        report,
        review_queue,
        errors,
    })
}

/// Writes a minimal but parseable cancelled manifest/report when
/// cancellation is observed before any page work starts (spec §8
/// invariant 6).
fn finalize_cancelled(
    config: &PipelineConfig,
    run_id: &str,
    run_dir: &std::path::Path,
    started_at: &str,
    total_pages: usize,
    errors: Vec<PageError>,
) -> PipelineResult<PipelineRunnerResult> {
    let updated_at = sidecar::now_iso8601();
    let manifest = Manifest {
        version: 1,
        run_id: run_id.to_string(),
        project_id: config.project_id.clone(),
        status: RunStatus::Cancelled,
        generated_at: updated_at.clone(),
        pages: vec![],
        errors: errors.clone(),
    };
    let report = Report {
        version: 1,
        run_id: run_id.to_string(),
        project_id: config.project_id.clone(),
        status: RunStatus::Cancelled,
        started_at: started_at.to_string(),
        updated_at: updated_at.clone(),
        total_pages,
        succeeded_pages: 0,
        review_count: 0,
        normalization: ReportNormalizationSummary { first_pass_count: 0, second_pass_count: 0 },
        errors: errors.clone(),
        determinism: ReportDeterminism {
            app_version: APP_VERSION.to_string(),
            config_hash: config.config_hash(),
        },
    };
    let review_queue = ReviewQueueFile { version: 1, run_id: run_id.to_string(), items: vec![] };

    sidecar::write_manifest(run_dir, &manifest)?;
    sidecar::write_report(run_dir, &report)?;
    sidecar::write_review_queue(run_dir, &review_queue)?;
    sidecar::upsert_run_index(
        &config.output_dir,
        RunRecord {
            run_id: run_id.to_string(),
            run_dir: run_dir.to_path_buf(),
            project_id: config.project_id.clone(),
            generated_at: updated_at.clone(),
            status: RunStatus::Cancelled,
            review_count: 0,
            report_path: sidecar::report_path(run_dir),
            started_at: started_at.to_string(),
            updated_at,
        },
    )?;

    Ok(PipelineRunnerResult {
        run_id: run_id.to_string(),
        run_dir: run_dir.to_path_buf(),
        status: RunStatus::Cancelled,
        manifest,
        report,
        review_queue,
        errors,
    })
}

/// Observations/metrics/recommendations derived from a finished run (spec
/// §6 `evaluateResults`).
#[derive(Debug, Clone, serde::Serialize)]
pub struct RunEvaluation {
    pub total_pages: usize,
    pub succeeded_pages: usize,
    pub review_count: usize,
    pub review_rate: f64,
    pub error_count: usize,
    pub second_pass_count: usize,
    pub recommendations: Vec<String>,
}

/// Summarizes a [`PipelineRunnerResult`] into a human-facing evaluation:
/// the headline counts plus a short list of natural-language
/// recommendations an outer tool can surface directly.
pub fn evaluate_results(result: &PipelineRunnerResult) -> RunEvaluation {
    let total_pages = result.report.total_pages;
    let succeeded_pages = result.report.succeeded_pages;
    let review_count = result.report.review_count;
    let review_rate = if total_pages == 0 { 0.0 } else { review_count as f64 / total_pages as f64 };

    let mut recommendations = Vec::new();
    if review_rate > 0.25 {
        recommendations.push("over a quarter of pages need review; consider relaxing bookPriorsTolerance or re-scanning low-confidence pages".to_string());
    }
    if result.report.normalization.second_pass_count > 0 {
        recommendations.push(format!(
            "{} page(s) required a second normalization pass",
            result.report.normalization.second_pass_count
        ));
    }
    if !result.errors.is_empty() {
        recommendations.push(format!("{} error(s) were recorded; inspect report.errors", result.errors.len()));
    }
    if result.status == RunStatus::Cancelled {
        recommendations.push("run was cancelled before completion".to_string());
    }

    RunEvaluation {
        total_pages,
        succeeded_pages,
        review_count,
        review_rate,
        error_count: result.errors.len(),
        second_pass_count: result.report.normalization.second_pass_count,
        recommendations,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfigBuilder;
    use image::{Rgb, RgbImage};
    use std::fs;

    fn write_png(path: &std::path::Path, width: u32, height: u32, value: u8) {
        let img = RgbImage::from_pixel(width, height, Rgb([value, value, value]));
        img.save(path).unwrap();
    }

    #[tokio::test]
    async fn run_pipeline_produces_manifest_and_sidecars_for_every_page() {
        let project = tempfile::tempdir().unwrap();
        let output = tempfile::tempdir().unwrap();

        write_png(&project.path().join("p001.png"), 400, 560, 30);
        write_png(&project.path().join("p002.png"), 400, 560, 200);

        let config = PipelineConfigBuilder::new(project.path(), output.path())
            .project_id("book-1")
            .target_dimensions_mm(148.0, 210.0)
            .target_dpi(150.0)
            .concurrency(2)
            .build()
            .unwrap();

        let result = run_pipeline(config, RunPipelineOptions::default()).await.unwrap();

        assert_eq!(result.status, RunStatus::Completed);
        assert_eq!(result.manifest.pages.len(), 2);
        for entry in &result.manifest.pages {
            assert!(entry.normalized_file.exists());
            let sidecar_path = sidecar::sidecar_path(&result.run_dir, &entry.page_id);
            assert!(sidecar_path.exists());
        }
        assert!(sidecar::run_index_path(output.path()).exists());
    }

    #[tokio::test]
    async fn cancelling_before_scan_completes_yields_cancelled_status_with_parseable_artifacts() {
        let project = tempfile::tempdir().unwrap();
        let output = tempfile::tempdir().unwrap();
        write_png(&project.path().join("p001.png"), 200, 280, 30);

        let config = PipelineConfigBuilder::new(project.path(), output.path()).build().unwrap();
        let token = CancellationToken::new();
        token.cancel();

        let options = RunPipelineOptions {
            cancellation: Some(token),
            ..RunPipelineOptions::default()
        };
        let result = run_pipeline(config, options).await.unwrap();

        assert_eq!(result.status, RunStatus::Cancelled);
        let raw = fs::read_to_string(sidecar::manifest_path(&result.run_dir)).unwrap();
        let _: Manifest = serde_json::from_str(&raw).expect("cancelled manifest must still parse as JSON");
    }

    #[tokio::test]
    async fn two_blank_pages_route_to_review_queue_with_blank_profile() {
        let project = tempfile::tempdir().unwrap();
        let output = tempfile::tempdir().unwrap();
        write_png(&project.path().join("a.png"), 100, 100, 250);
        write_png(&project.path().join("b.png"), 100, 100, 250);

        let config = PipelineConfigBuilder::new(project.path(), output.path())
            .target_dimensions_mm(100.0, 100.0)
            .build()
            .unwrap();
        let result = run_pipeline(config, RunPipelineOptions::default()).await.unwrap();

        assert_eq!(result.review_queue.items.len(), 2);
        for item in &result.review_queue.items {
            assert_eq!(item.layout_profile, LayoutProfile::Blank);
        }
    }
}
