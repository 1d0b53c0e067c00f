//! Pipeline configuration: a fixed schema (spec §9 "dynamic/duck-typed
//! configuration" design note — every recognized key is enumerated here,
//! unknown keys are rejected), a fluent builder with `.build()`
//! validation, YAML file loading, and environment variable overrides.
//!
//! Resolution order for any one setting, lowest to highest precedence:
//! `spec/pipeline_config.yaml` defaults → builder calls →
//! `ASTERIA_*` environment variables. This mirrors the teacher's
//! provider-resolution fallback chain in `resolve_provider`, generalized
//! from "which LLM provider" to "which pipeline knob".

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{PipelineError, PipelineResult};

/// How aggressively the normalizer re-measures and re-applies skew
/// correction after the first rotation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SkewRefinementMode {
    /// Never re-measure after the first rotation.
    Off,
    /// Re-measure and only re-rotate when the residual is large enough
    /// or the initial estimate was low-confidence (spec §4.4).
    On,
    /// Always re-measure and re-rotate.
    Forced,
}

impl Default for SkewRefinementMode {
    fn default() -> Self {
        SkewRefinementMode::On
    }
}

/// Shading-correction tuning (spec §4.4 "Shading correction").
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ShadingConfig {
    pub enabled: bool,
    #[serde(rename = "maxResidualIncrease")]
    pub max_residual_increase: f64,
    #[serde(rename = "maxHighlightShift")]
    pub max_highlight_shift: f64,
    #[serde(rename = "confidenceFloor")]
    pub confidence_floor: f64,
}

impl Default for ShadingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_residual_increase: 0.15,
            max_highlight_shift: 0.12,
            confidence_floor: 0.45,
        }
    }
}

/// Minimum confidences below which a correction is skipped outright
/// (spec §4.4 "Confidence gates").
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfidenceGateConfig {
    #[serde(rename = "deskewMin", skip_serializing_if = "Option::is_none")]
    pub deskew_min: Option<f64>,
    #[serde(rename = "shadingMin", skip_serializing_if = "Option::is_none")]
    pub shading_min: Option<f64>,
}

/// Book-prior snapping tuning (spec §4.4 "Book-prior snap").
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BookPriorsToleranceConfig {
    #[serde(rename = "maxTrimDriftPx")]
    pub max_trim_drift_px: f64,
    #[serde(rename = "maxContentDriftPx")]
    pub max_content_drift_px: f64,
    #[serde(rename = "minConfidence")]
    pub min_confidence: f64,
}

impl Default for BookPriorsToleranceConfig {
    fn default() -> Self {
        Self {
            max_trim_drift_px: 12.0,
            max_content_drift_px: 16.0,
            min_confidence: 0.5,
        }
    }
}

impl BookPriorsToleranceConfig {
    /// The relaxed tolerances applied during the second pass (spec §4.7).
    pub fn second_pass() -> Self {
        Self {
            max_trim_drift_px: 18.0,
            max_content_drift_px: 24.0,
            min_confidence: 0.6,
        }
    }
}

/// The optional remote layout-inference collaborator (spec §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RemoteLayoutConfig {
    pub endpoint: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(rename = "timeoutMs")]
    pub timeout_ms: u64,
    #[serde(rename = "maxPayloadMb")]
    pub max_payload_mb: f64,
    #[serde(rename = "maxDimensionPx")]
    pub max_dimension_px: u32,
}

impl Default for RemoteLayoutConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            token: None,
            timeout_ms: 5_000,
            max_payload_mb: 4.0,
            max_dimension_px: 2048,
        }
    }
}

impl RemoteLayoutConfig {
    /// Endpoint must be HTTPS, or plain HTTP restricted to localhost
    /// (spec §6: "Endpoint must be HTTPS or `http://localhost[:port]`").
    pub fn validate_endpoint(&self) -> Result<(), String> {
        let endpoint = self.endpoint.trim();
        if endpoint.is_empty() {
            return Err("remote layout endpoint is empty".to_string());
        }
        if endpoint.starts_with("https://") {
            return Ok(());
        }
        if let Some(rest) = endpoint.strip_prefix("http://") {
            let host = rest.split(['/', '?']).next().unwrap_or("");
            let host_only = host.split(':').next().unwrap_or("");
            if host_only == "localhost" || host_only == "127.0.0.1" || host_only == "::1" {
                return Ok(());
            }
            return Err(format!(
                "non-localhost http endpoint rejected: '{endpoint}' (must be https or http://localhost)"
            ));
        }
        Err(format!("unsupported endpoint scheme: '{endpoint}'"))
    }
}

/// Tuning knobs for the normalization kernel itself (spec §4.4).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NormalizationConfig {
    #[serde(rename = "skewRefinement")]
    pub skew_refinement: SkewRefinementMode,
    pub shading: ShadingConfig,
    #[serde(rename = "confidenceGate")]
    pub confidence_gate: ConfidenceGateConfig,
    #[serde(rename = "bookPriors")]
    pub book_priors: BookPriorsToleranceConfig,
    /// Default bleed in millimeters. Open question (a) in spec §9 is
    /// resolved by exposing this as configurable rather than a constant.
    #[serde(rename = "bleedMm")]
    pub bleed_mm: f64,
    #[serde(rename = "maxAspectRatioDrift")]
    pub max_aspect_ratio_drift: f64,
    #[serde(rename = "generatePreviews")]
    pub generate_previews: bool,
}

impl Default for NormalizationConfig {
    fn default() -> Self {
        Self {
            skew_refinement: SkewRefinementMode::default(),
            shading: ShadingConfig::default(),
            confidence_gate: ConfidenceGateConfig::default(),
            book_priors: BookPriorsToleranceConfig::default(),
            bleed_mm: 3.0,
            max_aspect_ratio_drift: 0.08,
            generate_previews: true,
        }
    }
}

/// Top-level pipeline configuration. Construct via [`PipelineConfigBuilder`].
///
/// Every field here corresponds to a key `spec.md` §6/§9 requires be
/// enumerated; there is deliberately no catch-all "extra options" bag.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(rename = "projectRoot")]
    pub project_root: PathBuf,
    #[serde(rename = "projectId")]
    pub project_id: String,
    #[serde(rename = "outputDir")]
    pub output_dir: PathBuf,
    #[serde(rename = "runId", skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    #[serde(rename = "targetDpi")]
    pub target_dpi: f64,
    #[serde(rename = "targetDimensionsMm")]
    pub target_dimensions_mm: (f64, f64),
    #[serde(rename = "sampleCount")]
    pub sample_count: usize,
    #[serde(rename = "includeChecksums")]
    pub include_checksums: bool,
    pub concurrency: usize,
    #[serde(rename = "enableSpreadSplit")]
    pub enable_spread_split: bool,
    #[serde(rename = "spreadSplitConfidence")]
    pub spread_split_confidence: f64,
    #[serde(rename = "enableBookPriors")]
    pub enable_book_priors: bool,
    #[serde(rename = "bookPriorsSampleCount")]
    pub book_priors_sample_count: usize,
    pub normalization: NormalizationConfig,
    #[serde(rename = "remoteLayout", skip_serializing_if = "Option::is_none")]
    pub remote_layout: Option<RemoteLayoutConfig>,
}

impl PipelineConfig {
    /// The worker-pool size actually used, clamped to `[1, pendingPages]`
    /// per spec §5 "Scheduling".
    pub fn effective_concurrency(&self, pending_pages: usize) -> usize {
        self.concurrency.max(1).min(pending_pages.max(1))
    }

    /// The book-priors sample pass uses a reduced pool (spec §5).
    pub fn book_priors_concurrency(&self) -> usize {
        self.concurrency.min(4).max(1)
    }

    /// A JSON value with recursively sorted keys, used for the
    /// determinism hash (`report.json.determinism.configHash`).
    pub fn canonical_json(&self) -> serde_json::Value {
        let value = serde_json::to_value(self).expect("PipelineConfig always serializes");
        canonicalize(value)
    }

    /// SHA-256 hex digest of `canonical_json()`, stable across runs with
    /// identical configuration regardless of struct field order (spec §8
    /// invariant 4: "`determinism.configHash` is stable").
    pub fn config_hash(&self) -> String {
        let canonical = self.canonical_json().to_string();
        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

fn canonicalize(value: serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(map) => {
            let mut sorted: std::collections::BTreeMap<String, serde_json::Value> =
                std::collections::BTreeMap::new();
            for (k, v) in map {
                sorted.insert(k, canonicalize(v));
            }
            serde_json::to_value(sorted).expect("BTreeMap of Values always serializes")
        }
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.into_iter().map(canonicalize).collect())
        }
        other => other,
    }
}

/// Fluent builder for [`PipelineConfig`]. Mirrors the teacher's
/// `ConversionConfigBuilder`: every setter takes `self` by value and
/// returns `Self`, validation happens once in `.build()`.
pub struct PipelineConfigBuilder {
    config: PipelineConfig,
}

impl PipelineConfigBuilder {
    pub fn new(project_root: impl Into<PathBuf>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            config: PipelineConfig {
                project_root: project_root.into(),
                project_id: "default".to_string(),
                output_dir: output_dir.into(),
                run_id: None,
                target_dpi: 300.0,
                target_dimensions_mm: (210.0, 297.0),
                sample_count: 40,
                include_checksums: true,
                concurrency: 6,
                enable_spread_split: false,
                spread_split_confidence: 0.7,
                enable_book_priors: false,
                book_priors_sample_count: 40,
                normalization: NormalizationConfig::default(),
                remote_layout: None,
            },
        }
    }

    pub fn project_id(mut self, project_id: impl Into<String>) -> Self {
        self.config.project_id = project_id.into();
        self
    }

    pub fn run_id(mut self, run_id: impl Into<String>) -> Self {
        self.config.run_id = Some(run_id.into());
        self
    }

    pub fn target_dpi(mut self, dpi: f64) -> Self {
        self.config.target_dpi = dpi;
        self
    }

    pub fn target_dimensions_mm(mut self, width_mm: f64, height_mm: f64) -> Self {
        self.config.target_dimensions_mm = (width_mm, height_mm);
        self
    }

    pub fn sample_count(mut self, n: usize) -> Self {
        self.config.sample_count = n;
        self
    }

    pub fn include_checksums(mut self, enabled: bool) -> Self {
        self.config.include_checksums = enabled;
        self
    }

    pub fn concurrency(mut self, n: usize) -> Self {
        self.config.concurrency = n;
        self
    }

    pub fn enable_spread_split(mut self, enabled: bool) -> Self {
        self.config.enable_spread_split = enabled;
        self
    }

    pub fn spread_split_confidence(mut self, threshold: f64) -> Self {
        self.config.spread_split_confidence = threshold;
        self
    }

    pub fn enable_book_priors(mut self, enabled: bool) -> Self {
        self.config.enable_book_priors = enabled;
        self
    }

    pub fn book_priors_sample_count(mut self, n: usize) -> Self {
        self.config.book_priors_sample_count = n;
        self
    }

    pub fn normalization(mut self, normalization: NormalizationConfig) -> Self {
        self.config.normalization = normalization;
        self
    }

    pub fn remote_layout(mut self, remote: RemoteLayoutConfig) -> Self {
        self.config.remote_layout = Some(remote);
        self
    }

    /// Applies YAML-file defaults loaded from `spec/pipeline_config.yaml`.
    /// Call this before any conflicting explicit setter — explicit
    /// builder calls take precedence, per the resolution order documented
    /// at the top of this module.
    pub fn apply_yaml_defaults(mut self, raw: &PipelineConfigFile) -> Self {
        if let Some(v) = raw.target_dpi {
            self.config.target_dpi = v;
        }
        if let Some((w, h)) = raw.target_dimensions_mm {
            self.config.target_dimensions_mm = (w, h);
        }
        if let Some(v) = raw.sample_count {
            self.config.sample_count = v;
        }
        if let Some(v) = raw.concurrency {
            self.config.concurrency = v;
        }
        if let Some(v) = raw.enable_spread_split {
            self.config.enable_spread_split = v;
        }
        if let Some(v) = raw.spread_split_confidence {
            self.config.spread_split_confidence = v;
        }
        if let Some(v) = raw.enable_book_priors {
            self.config.enable_book_priors = v;
        }
        if let Some(v) = raw.book_priors_sample_count {
            self.config.book_priors_sample_count = v;
        }
        if let Some(normalization) = raw.normalization.clone() {
            self.config.normalization = normalization;
        }
        if let Some(remote) = raw.remote_layout.clone() {
            self.config.remote_layout = Some(remote);
        }
        self
    }

    /// Applies `ASTERIA_*` environment variable overrides, the highest
    /// precedence tier (spec §6 "Environment").
    pub fn apply_env_overrides(mut self) -> Self {
        if let Ok(v) = std::env::var("ASTERIA_NORMALIZE_CONCURRENCY") {
            if let Ok(n) = v.parse::<usize>() {
                self.config.concurrency = n;
            }
        }
        if let Ok(v) = std::env::var("ASTERIA_OUTPUT_DIR") {
            self.config.output_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("ASTERIA_RUN_ID") {
            self.config.run_id = Some(v);
        }

        if let Ok(endpoint) = std::env::var("ASTERIA_REMOTE_LAYOUT_ENDPOINT") {
            let mut remote = self.config.remote_layout.take().unwrap_or_default();
            remote.endpoint = endpoint;
            if let Ok(token) = std::env::var("ASTERIA_REMOTE_LAYOUT_TOKEN") {
                remote.token = Some(token);
            }
            if let Ok(v) = std::env::var("ASTERIA_REMOTE_LAYOUT_TIMEOUT_MS") {
                if let Ok(n) = v.parse() {
                    remote.timeout_ms = n;
                }
            }
            if let Ok(v) = std::env::var("ASTERIA_REMOTE_LAYOUT_MAX_PAYLOAD_MB") {
                if let Ok(n) = v.parse() {
                    remote.max_payload_mb = n;
                }
            }
            if let Ok(v) = std::env::var("ASTERIA_REMOTE_LAYOUT_MAX_DIMENSION_PX") {
                if let Ok(n) = v.parse() {
                    remote.max_dimension_px = n;
                }
            }
            self.config.remote_layout = Some(remote);
        }
        self
    }

    /// Validates all cross-field constraints and returns the finished
    /// config, or a [`PipelineError::InvalidConfig`] describing the first
    /// violation found.
    pub fn build(self) -> PipelineResult<PipelineConfig> {
        let config = self.config;

        if config.project_id.trim().is_empty() {
            return Err(PipelineError::InvalidConfig("projectId must not be empty".into()));
        }
        if config.target_dpi <= 0.0 {
            return Err(PipelineError::InvalidConfig("targetDpi must be positive".into()));
        }
        if config.target_dimensions_mm.0 <= 0.0 || config.target_dimensions_mm.1 <= 0.0 {
            return Err(PipelineError::InvalidConfig(
                "targetDimensionsMm must both be positive".into(),
            ));
        }
        if config.sample_count == 0 {
            return Err(PipelineError::InvalidConfig("sampleCount must be >= 1".into()));
        }
        if config.concurrency == 0 {
            return Err(PipelineError::InvalidConfig("concurrency must be >= 1".into()));
        }
        if !(0.0..=1.0).contains(&config.spread_split_confidence) {
            return Err(PipelineError::InvalidConfig(
                "spreadSplitConfidence must be within [0, 1]".into(),
            ));
        }
        if config.book_priors_sample_count == 0 {
            return Err(PipelineError::InvalidConfig(
                "bookPriorsSampleCount must be >= 1".into(),
            ));
        }
        if config.normalization.bleed_mm < 0.0 {
            return Err(PipelineError::InvalidConfig("bleedMm must be >= 0".into()));
        }
        if !(0.0..=1.0).contains(&config.normalization.max_aspect_ratio_drift) {
            return Err(PipelineError::InvalidConfig(
                "maxAspectRatioDrift must be within [0, 1]".into(),
            ));
        }
        if let Some(remote) = &config.remote_layout {
            remote.validate_endpoint().map_err(PipelineError::InvalidConfig)?;
            if remote.max_payload_mb <= 0.0 {
                return Err(PipelineError::InvalidConfig(
                    "remoteLayout.maxPayloadMb must be positive".into(),
                ));
            }
            if remote.max_dimension_px == 0 {
                return Err(PipelineError::InvalidConfig(
                    "remoteLayout.maxDimensionPx must be positive".into(),
                ));
            }
        }

        Ok(config)
    }
}

/// The on-disk shape of `spec/pipeline_config.yaml`. Every field is
/// optional (a project may override as little or as much as it wants);
/// unknown keys are a hard error rather than silently ignored, per spec
/// §9's "unknown top-level keys are rejected by validation".
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PipelineConfigFile {
    pub target_dpi: Option<f64>,
    pub target_dimensions_mm: Option<(f64, f64)>,
    pub sample_count: Option<usize>,
    pub concurrency: Option<usize>,
    pub enable_spread_split: Option<bool>,
    pub spread_split_confidence: Option<f64>,
    pub enable_book_priors: Option<bool>,
    pub book_priors_sample_count: Option<usize>,
    pub normalization: Option<NormalizationConfig>,
    pub remote_layout: Option<RemoteLayoutConfig>,
}

/// Loads and parses a YAML config file (`spec/pipeline_config.yaml`),
/// rejecting unknown keys.
pub fn load_config_file(path: &Path) -> PipelineResult<PipelineConfigFile> {
    let raw = std::fs::read_to_string(path).map_err(|source| PipelineError::ConfigFileUnreadable {
        path: path.to_path_buf(),
        source,
    })?;
    serde_yaml::from_str(&raw).map_err(|source| PipelineError::ConfigFileInvalid {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_produces_sane_defaults() {
        let config = PipelineConfigBuilder::new("/scans/book", "/out").build().unwrap();
        assert_eq!(config.concurrency, 6);
        assert_eq!(config.target_dpi, 300.0);
    }

    #[test]
    fn builder_rejects_zero_concurrency() {
        let err = PipelineConfigBuilder::new("/scans/book", "/out")
            .concurrency(0)
            .build()
            .unwrap_err();
        assert!(matches!(err, PipelineError::InvalidConfig(_)));
    }

    #[test]
    fn effective_concurrency_clamps_to_pending_pages() {
        let config = PipelineConfigBuilder::new("/scans/book", "/out")
            .concurrency(6)
            .build()
            .unwrap();
        assert_eq!(config.effective_concurrency(2), 2);
        assert_eq!(config.effective_concurrency(0), 1);
        assert_eq!(config.effective_concurrency(100), 6);
    }

    #[test]
    fn config_hash_is_stable_across_identical_configs() {
        let a = PipelineConfigBuilder::new("/scans/book", "/out")
            .project_id("book-1")
            .build()
            .unwrap();
        let b = PipelineConfigBuilder::new("/scans/book", "/out")
            .project_id("book-1")
            .build()
            .unwrap();
        assert_eq!(a.config_hash(), b.config_hash());
    }

    #[test]
    fn config_hash_differs_when_a_setting_changes() {
        let a = PipelineConfigBuilder::new("/scans/book", "/out").build().unwrap();
        let b = PipelineConfigBuilder::new("/scans/book", "/out")
            .target_dpi(600.0)
            .build()
            .unwrap();
        assert_ne!(a.config_hash(), b.config_hash());
    }

    #[test]
    fn remote_endpoint_rejects_non_localhost_http() {
        let remote = RemoteLayoutConfig {
            endpoint: "http://example.com/infer".into(),
            ..RemoteLayoutConfig::default()
        };
        assert!(remote.validate_endpoint().is_err());
    }

    #[test]
    fn remote_endpoint_accepts_https_and_localhost() {
        let https = RemoteLayoutConfig {
            endpoint: "https://layout.example.com/infer".into(),
            ..RemoteLayoutConfig::default()
        };
        assert!(https.validate_endpoint().is_ok());

        let local = RemoteLayoutConfig {
            endpoint: "http://localhost:8080/infer".into(),
            ..RemoteLayoutConfig::default()
        };
        assert!(local.validate_endpoint().is_ok());
    }

    #[test]
    fn yaml_config_rejects_unknown_keys() {
        let yaml = "targetDpi: 300\nbogusKey: true\n";
        let err = serde_yaml::from_str::<PipelineConfigFile>(yaml).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("bogusKey") || message.contains("unknown field"));
    }
}
