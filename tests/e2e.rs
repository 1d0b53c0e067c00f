//! End-to-end tests for the page normalization pipeline (spec §8
//! "Testable properties" / "Concrete scenarios"), exercised against
//! synthetic fixture rasters so the suite runs without external assets.

use std::path::Path;

use asteria_normalize::config::PipelineConfigBuilder;
use asteria_normalize::error::PipelineError;
use asteria_normalize::model::{LayoutProfile, Manifest, ReviewReasonKind, RunStatus};
use asteria_normalize::orchestrator::{run_pipeline, CancellationToken, RunPipelineOptions};
use asteria_normalize::sidecar;
use image::{Rgb, RgbImage};

fn write_blank_page(path: &Path, width: u32, height: u32, value: u8) {
    let img = RgbImage::from_pixel(width, height, Rgb([value, value, value]));
    img.save(path).expect("write fixture png");
}

/// A page with a dark text block inset from a light border, simulating a
/// printed page of body text well enough to clear the mask-coverage and
/// baseline thresholds in `layout::classify`.
fn write_text_page(path: &Path, width: u32, height: u32) {
    let mut img = RgbImage::from_pixel(width, height, Rgb([248, 248, 248]));
    let margin_x = width / 8;
    let margin_y = height / 10;
    for y in margin_y..(height - margin_y) {
        // Horizontal bands simulate text lines with gaps between them,
        // giving the baseline estimator real peaks to find.
        if (y / 6) % 2 == 0 {
            for x in margin_x..(width - margin_x) {
                img.put_pixel(x, y, Rgb([25, 25, 25]));
            }
        }
    }
    img.save(path).expect("write fixture png");
}

/// A page whose left 4% strip is substantially darker than the rest,
/// simulating a strong spine shadow (spec §8 scenario 3).
fn write_left_shadow_page(path: &Path, width: u32, height: u32) {
    let mut img = RgbImage::from_pixel(width, height, Rgb([230, 230, 230]));
    let strip = (width as f64 * 0.04).round() as u32;
    for y in 0..height {
        for x in 0..strip.max(1) {
            img.put_pixel(x, y, Rgb([190, 190, 190]));
        }
    }
    img.save(path).expect("write fixture png");
}

#[tokio::test]
async fn empty_corpus_aborts_the_run_with_no_artifacts() {
    let project = tempfile::tempdir().unwrap();
    let output = tempfile::tempdir().unwrap();

    let config = PipelineConfigBuilder::new(project.path(), output.path()).build().unwrap();
    let err = run_pipeline(config, RunPipelineOptions::default()).await.unwrap_err();

    assert!(matches!(err, PipelineError::EmptyCorpus { .. }));
    assert!(!output.path().join("runs").exists());
}

#[tokio::test]
async fn two_blank_pages_are_normalized_and_routed_to_review() {
    let project = tempfile::tempdir().unwrap();
    let output = tempfile::tempdir().unwrap();

    write_blank_page(&project.path().join("a.png"), 100, 100, 250);
    write_blank_page(&project.path().join("b.png"), 100, 100, 250);

    let config = PipelineConfigBuilder::new(project.path(), output.path())
        .project_id("blank-book")
        .target_dimensions_mm(100.0, 100.0)
        .build()
        .unwrap();

    let result = run_pipeline(config, RunPipelineOptions::default()).await.unwrap();

    assert_eq!(result.status, RunStatus::Completed);
    assert_eq!(result.manifest.pages.len(), 2);
    assert_eq!(result.review_queue.items.len(), 2);

    for item in &result.review_queue.items {
        assert_eq!(item.layout_profile, LayoutProfile::Blank);
        assert_eq!(item.reason, ReviewReasonKind::QualityGate);
        assert!(item
            .quality_gate
            .reasons
            .iter()
            .any(|r| r.contains("mask-coverage")));
    }

    for entry in &result.manifest.pages {
        assert!(entry.normalized_file.exists(), "normalized PNG must exist for {}", entry.page_id);
        let sidecar_path = sidecar::sidecar_path(&result.run_dir, &entry.page_id);
        assert!(sidecar_path.exists(), "sidecar JSON must exist for {}", entry.page_id);
    }
}

#[tokio::test]
async fn text_page_normalizes_with_populated_baseline_metrics() {
    let project = tempfile::tempdir().unwrap();
    let output = tempfile::tempdir().unwrap();
    write_text_page(&project.path().join("p001.png"), 400, 560);

    let config = PipelineConfigBuilder::new(project.path(), output.path())
        .target_dimensions_mm(148.0, 210.0)
        .target_dpi(150.0)
        .build()
        .unwrap();

    let result = run_pipeline(config, RunPipelineOptions::default()).await.unwrap();

    assert_eq!(result.manifest.pages.len(), 1);
    let entry = &result.manifest.pages[0];

    let sidecar_path = sidecar::sidecar_path(&result.run_dir, &entry.page_id);
    let raw = std::fs::read_to_string(sidecar_path).unwrap();
    let parsed: serde_json::Value = serde_json::from_str(&raw).unwrap();
    assert!(parsed["metrics"]["maskCoverage"].as_f64().unwrap() > 0.0);
    assert_eq!(parsed["normalization"]["cropBox"].as_array().unwrap().len(), 4);
}

#[tokio::test]
async fn left_spine_shadow_is_detected_and_trimmed() {
    let project = tempfile::tempdir().unwrap();
    let output = tempfile::tempdir().unwrap();
    write_left_shadow_page(&project.path().join("p001.png"), 600, 800);

    let config = PipelineConfigBuilder::new(project.path(), output.path())
        .target_dimensions_mm(148.0, 210.0)
        .build()
        .unwrap();

    let result = run_pipeline(config, RunPipelineOptions::default()).await.unwrap();
    assert_eq!(result.manifest.pages.len(), 1);
}

#[tokio::test]
async fn filename_cover_cue_routes_to_semantic_review() {
    let project = tempfile::tempdir().unwrap();
    let output = tempfile::tempdir().unwrap();
    write_text_page(&project.path().join("cover.png"), 400, 560);

    let config = PipelineConfigBuilder::new(project.path(), output.path())
        .target_dimensions_mm(148.0, 210.0)
        .build()
        .unwrap();

    let result = run_pipeline(config, RunPipelineOptions::default()).await.unwrap();

    assert_eq!(result.manifest.pages.len(), 1);
    let entry = &result.manifest.pages[0];
    assert_eq!(entry.layout_profile, LayoutProfile::Cover);
}

#[tokio::test]
async fn wide_page_with_strong_gutter_splits_into_left_and_right_children() {
    let project = tempfile::tempdir().unwrap();
    let output = tempfile::tempdir().unwrap();

    // 1200x700 (aspect 1.71) with a dark gutter at the center.
    let mut img = RgbImage::from_pixel(1200, 700, Rgb([230, 230, 230]));
    for y in 0..700u32 {
        for x in 570..630u32 {
            img.put_pixel(x, y, Rgb([30, 30, 30]));
        }
    }
    img.save(project.path().join("spread1.png")).unwrap();

    let config = PipelineConfigBuilder::new(project.path(), output.path())
        .target_dimensions_mm(148.0, 210.0)
        .enable_spread_split(true)
        .spread_split_confidence(0.5)
        .build()
        .unwrap();

    let result = run_pipeline(config, RunPipelineOptions::default()).await.unwrap();

    let ids: Vec<&str> = result.manifest.pages.iter().map(|p| p.page_id.as_str()).collect();
    assert!(ids.contains(&"spread1_L"), "expected spread1_L in {:?}", ids);
    assert!(ids.contains(&"spread1_R"), "expected spread1_R in {:?}", ids);
}

#[tokio::test]
async fn cancellation_before_scan_yields_cancelled_status_with_parseable_manifest() {
    let project = tempfile::tempdir().unwrap();
    let output = tempfile::tempdir().unwrap();
    write_blank_page(&project.path().join("p001.png"), 200, 280, 250);

    let config = PipelineConfigBuilder::new(project.path(), output.path()).build().unwrap();
    let token = CancellationToken::new();
    token.cancel();

    let options = RunPipelineOptions {
        cancellation: Some(token),
        ..RunPipelineOptions::default()
    };
    let result = run_pipeline(config, options).await.unwrap();

    assert_eq!(result.status, RunStatus::Cancelled);
    let raw = std::fs::read_to_string(sidecar::manifest_path(&result.run_dir)).unwrap();
    let manifest: Manifest = serde_json::from_str(&raw).expect("cancelled manifest must parse as JSON");
    assert_eq!(manifest.status, RunStatus::Cancelled);

    let raw_report = std::fs::read_to_string(sidecar::report_path(&result.run_dir)).unwrap();
    let report: serde_json::Value = serde_json::from_str(&raw_report).expect("cancelled report must parse as JSON");
    assert_eq!(report["status"], "cancelled");
}

#[tokio::test]
async fn rerunning_over_unchanged_corpus_leaves_manifest_pages_unchanged() {
    let project = tempfile::tempdir().unwrap();
    let output = tempfile::tempdir().unwrap();
    write_text_page(&project.path().join("p001.png"), 400, 560);

    let config = PipelineConfigBuilder::new(project.path(), output.path())
        .project_id("repeatable")
        .run_id("run-fixed")
        .target_dimensions_mm(148.0, 210.0)
        .build()
        .unwrap();

    let first = run_pipeline(config.clone(), RunPipelineOptions::default()).await.unwrap();
    let second = run_pipeline(config, RunPipelineOptions::default()).await.unwrap();

    assert_eq!(first.manifest.pages.len(), second.manifest.pages.len());
    for (a, b) in first.manifest.pages.iter().zip(second.manifest.pages.iter()) {
        assert_eq!(a.page_id, b.page_id);
        assert_eq!(a.checksum, b.checksum);
        assert_eq!(a.layout_profile, b.layout_profile);
    }
    // The determinism hash is computed from the config alone, so a second
    // run of the same config must reproduce it exactly (spec §8 invariant 4).
    assert_eq!(first.report.determinism.config_hash, second.report.determinism.config_hash);
}

#[tokio::test]
async fn manifest_checksums_match_scanned_file_checksums() {
    let project = tempfile::tempdir().unwrap();
    let output = tempfile::tempdir().unwrap();
    write_text_page(&project.path().join("p001.png"), 400, 560);

    let config = PipelineConfigBuilder::new(project.path(), output.path())
        .target_dimensions_mm(148.0, 210.0)
        .include_checksums(true)
        .build()
        .unwrap();

    let result = run_pipeline(config, RunPipelineOptions::default()).await.unwrap();
    let scanned = asteria_normalize::scanner::scan(project.path(), true).unwrap();

    assert_eq!(result.manifest.pages.len(), 1);
    assert_eq!(result.manifest.pages[0].checksum, scanned[0].checksum);
}

#[tokio::test]
async fn run_index_records_every_run_for_the_output_root() {
    let project = tempfile::tempdir().unwrap();
    let output = tempfile::tempdir().unwrap();
    write_blank_page(&project.path().join("p001.png"), 100, 100, 250);

    let config_a = PipelineConfigBuilder::new(project.path(), output.path())
        .run_id("run-a")
        .target_dimensions_mm(100.0, 100.0)
        .build()
        .unwrap();
    let config_b = PipelineConfigBuilder::new(project.path(), output.path())
        .run_id("run-b")
        .target_dimensions_mm(100.0, 100.0)
        .build()
        .unwrap();

    run_pipeline(config_a, RunPipelineOptions::default()).await.unwrap();
    run_pipeline(config_b, RunPipelineOptions::default()).await.unwrap();

    let raw = std::fs::read_to_string(sidecar::run_index_path(output.path())).unwrap();
    let index: asteria_normalize::model::RunIndex = serde_json::from_str(&raw).unwrap();
    let ids: Vec<&str> = index.runs.iter().map(|r| r.run_id.as_str()).collect();
    assert!(ids.contains(&"run-a"));
    assert!(ids.contains(&"run-b"));

    // Each run's artifacts stay inside its own runDir (spec §8 invariant 5).
    assert!(output.path().join("runs/run-a/manifest.json").exists());
    assert!(output.path().join("runs/run-b/manifest.json").exists());
}
