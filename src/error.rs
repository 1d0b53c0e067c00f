//! Error types for the normalization pipeline.
//!
//! Two distinct error types reflect two distinct failure modes:
//!
//! * [`PipelineError`] — **Fatal**: the run cannot even begin (empty
//!   corpus, missing/non-directory root, unreadable config). Returned as
//!   `Err(PipelineError)` from [`crate::orchestrator::run_pipeline`] before
//!   any artifact is written.
//!
//! * [`PageError`] — **Non-fatal**: a single page (or a whole optional
//!   phase, e.g. book-priors sampling) failed but the run proceeds.
//!   Collected into `PipelineRunnerResult::errors` so callers can inspect
//!   partial success rather than losing the whole run to one bad page.
//!
//! The separation lets the orchestrator isolate per-page work: only a
//! scan-phase problem — the corpus can't even be read — aborts the run.

use std::path::PathBuf;
use thiserror::Error;

/// All fatal errors returned by the normalization pipeline.
///
/// Page-level and phase-level failures use [`PageError`] and are
/// collected into the run result rather than propagated here.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Project root does not exist.
    #[error("project root not found: '{path}'")]
    RootNotFound { path: PathBuf },

    /// Project root exists but is not a directory.
    #[error("project root is not a directory: '{path}'")]
    RootNotADirectory { path: PathBuf },

    /// No supported images were found under the root.
    #[error(
        "no supported images (.jpg .jpeg .png .tif .tiff) found under '{path}'"
    )]
    EmptyCorpus { path: PathBuf },

    /// A file the scanner needed to read could not be read.
    #[error("failed to read '{path}': {source}")]
    UnreadableFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Builder or YAML-file configuration validation failed.
    #[error("invalid pipeline configuration: {0}")]
    InvalidConfig(String),

    /// The YAML config file could not be read from disk.
    #[error("failed to read config file '{path}': {source}")]
    ConfigFileUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The YAML config file was read but failed to parse, or contained
    /// unknown keys.
    #[error("failed to parse config file '{path}': {source}")]
    ConfigFileInvalid {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    /// An output artifact could not be written.
    #[error("failed to write '{path}': {source}")]
    WriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The requested run directory is already owned by a run in progress.
    #[error("run directory is already owned by another run: '{path}'")]
    RunDirConflict { path: PathBuf },

    /// Unexpected I/O failure not covered by a more specific variant.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A page/phase-scoped artifact write failed while writing a
    /// manifest-level artifact (manifest, report, review queue, run
    /// index) that the run cannot proceed without.
    #[error("failed to write run artifact: {0}")]
    ArtifactWriteFailed(#[from] PageError),
}

/// A pipeline phase, used to tag non-fatal errors. Kept as an enum so call
/// sites can't typo a phase name; serializes to the kebab-case string the
/// sidecar/manifest/report JSON shapes expect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Phase {
    Scan,
    Analysis,
    SpreadSplit,
    BookPriors,
    Normalization,
    Remote,
    Overlay,
    Sidecar,
    Manifest,
    ReviewQueue,
    RunIndex,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Phase::Scan => "scan",
            Phase::Analysis => "analysis",
            Phase::SpreadSplit => "spread-split",
            Phase::BookPriors => "book-priors",
            Phase::Normalization => "normalization",
            Phase::Remote => "remote",
            Phase::Overlay => "overlay",
            Phase::Sidecar => "sidecar",
            Phase::Manifest => "manifest",
            Phase::ReviewQueue => "review-queue",
            Phase::RunIndex => "run-index",
        };
        f.write_str(s)
    }
}

/// A non-fatal error scoped to one phase and, usually, one page.
///
/// Serialized verbatim into `manifest.json` / `report.json`'s `errors[]`
/// arrays: `{phase, pageId, message}`.
#[derive(Debug, Clone, Error, serde::Serialize, serde::Deserialize)]
#[error("[{phase}] {page_id:?}: {message}")]
pub struct PageError {
    pub phase: Phase,
    #[serde(rename = "pageId")]
    pub page_id: Option<String>,
    pub message: String,
}

impl PageError {
    pub fn for_page(phase: Phase, page_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            phase,
            page_id: Some(page_id.into()),
            message: message.into(),
        }
    }

    pub fn run_scoped(phase: Phase, message: impl Into<String>) -> Self {
        Self {
            phase,
            page_id: None,
            message: message.into(),
        }
    }
}

pub type PipelineResult<T> = Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_serializes_kebab_case() {
        assert_eq!(Phase::SpreadSplit.to_string(), "spread-split");
        assert_eq!(Phase::BookPriors.to_string(), "book-priors");
        let json = serde_json::to_string(&Phase::RunIndex).unwrap();
        assert_eq!(json, "\"run-index\"");
    }

    #[test]
    fn page_error_round_trips_through_json() {
        let err = PageError::for_page(Phase::Normalization, "p001", "mask coverage collapsed");
        let json = serde_json::to_string(&err).unwrap();
        let back: PageError = serde_json::from_str(&json).unwrap();
        assert_eq!(back.page_id.as_deref(), Some("p001"));
        assert_eq!(back.phase, Phase::Normalization);
    }

    #[test]
    fn run_scoped_error_has_no_page_id() {
        let err = PageError::run_scoped(Phase::Analysis, "fell back to default summary");
        assert!(err.page_id.is_none());
    }
}
