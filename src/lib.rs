//! # asteria-normalize
//!
//! A deterministic page-normalization pipeline for scanned book
//! digitization: given a directory of raw scanned page images, it produces
//! normalized page rasters at a target resolution, per-page JSON sidecars
//! describing detected geometry and layout, a run manifest, and a human
//! review queue listing pages requiring intervention.
//!
//! ## Pipeline overview
//!
//! ```text
//! Scanner -> Analyzer -> [SpreadSplitter] -> BookPriorsBuilder -> Normalizer (1st pass)
//!      |                                                              |
//!                                          QualityGate -> Normalizer (2nd pass, failing pages)
//!                                                          |
//!                                ReviewQueue + Sidecars + Overlays + Manifest + RunIndex
//! ```
//!
//! - **[`scanner`]** discovers input images, assigns stable page ids, and
//!   computes content checksums.
//! - **[`analyzer`]** probes a subset of files for pixel dimensions and
//!   infers target physical size and DPI with confidence scores.
//! - **[`spread`]** (optional) detects two-page spreads by gutter-shadow
//!   analysis and splits them into child pages.
//! - **[`priors`]** (optional) derives trim/content box medians and
//!   perceptual hashes of running heads, folios, and ornaments from a
//!   sample of normalized pages.
//! - **[`normalize`]** is the per-page image processing kernel: deskew,
//!   shading correction, mask + edge crop, aspect alignment, book-prior
//!   snapping, morphology, and final resize.
//! - **[`layout`]** assigns a layout profile and computes a quality-gate
//!   accept/review decision.
//! - **[`orchestrator`]** drives the phases above with bounded
//!   concurrency, cancellation, pause/resume, second-pass scheduling, and
//!   artifact emission; [`orchestrator::run_pipeline`] is the top-level
//!   entry point.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use asteria_normalize::config::PipelineConfigBuilder;
//! use asteria_normalize::orchestrator::{run_pipeline, RunPipelineOptions};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = PipelineConfigBuilder::new("/scans/book-1", "/out")
//!         .project_id("book-1")
//!         .target_dpi(300.0)
//!         .target_dimensions_mm(184.15, 260.35)
//!         .build()?;
//!
//!     let result = run_pipeline(config, RunPipelineOptions::default()).await?;
//!     println!(
//!         "{} pages normalized, {} flagged for review",
//!         result.manifest.pages.len(),
//!         result.review_queue.items.len()
//!     );
//!     Ok(())
//! }
//! ```
//!
//! ## Environment variables
//!
//! | Variable | Effect |
//! |---|---|
//! | `ASTERIA_NORMALIZE_CONCURRENCY` | overrides [`config::PipelineConfig::concurrency`] |
//! | `ASTERIA_OUTPUT_DIR` | overrides [`config::PipelineConfig::output_dir`] |
//! | `ASTERIA_RUN_ID` | overrides [`config::PipelineConfig::run_id`] |
//! | `ASTERIA_REMOTE_LAYOUT_ENDPOINT` / `_TOKEN` / `_TIMEOUT_MS` / `_MAX_PAYLOAD_MB` / `_MAX_DIMENSION_PX` | configure the optional remote layout collaborator ([`remote`]) |
//!
//! `spec/pipeline_config.yaml` supplies defaults these may override; see
//! [`config::PipelineConfigBuilder::apply_yaml_defaults`].

// ── Modules ──────────────────────────────────────────────────────────────

pub mod analyzer;
pub mod config;
pub mod error;
pub mod layout;
pub mod model;
pub mod normalize;
pub mod orchestrator;
pub mod overlay;
pub mod priors;
pub mod progress;
pub mod remote;
pub mod scanner;
pub mod sidecar;
pub mod spread;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{PipelineConfig, PipelineConfigBuilder, PipelineConfigFile};
pub use error::{PageError, Phase, PipelineError, PipelineResult};
pub use orchestrator::{evaluate_results, run_pipeline, CancellationToken, PauseGate, RunEvaluation, RunPipelineOptions};
pub use progress::{noop, NoopProgressCallback, PipelineProgressCallback, ProgressCallback};
