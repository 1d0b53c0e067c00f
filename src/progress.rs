//! Progress-callback trait for pipeline phase and page events.
//!
//! Inject an `Arc<dyn PipelineProgressCallback>` into `runPipeline`'s
//! `onProgress` parameter to receive real-time events while the pipeline
//! runs.
//!
//! # Why callbacks instead of channels?
//!
//! The callback approach is the least-invasive integration point: callers
//! can forward events to a database record, a desktop UI, or a terminal —
//! without this library knowing anything about how the host application
//! communicates. The trait is `Send + Sync` so it works correctly when
//! pages are processed concurrently via `tokio::spawn`.

use std::sync::Arc;

use crate::error::Phase;

/// Called by the orchestrator as it drives phases and processes pages.
///
/// Implementations must be `Send + Sync` (pages are processed
/// concurrently via `tokio::spawn`). All methods have default no-op
/// implementations so callers only override what they care about.
///
/// Error-carrying methods take an owned `String`, not `&str` — a borrowed
/// argument would force a higher-ranked trait bound on the future
/// produced when a callback call is awaited inside `tokio::spawn`, which
/// breaks `Send`. See `on_page_error_is_send_when_used_in_spawn` below.
pub trait PipelineProgressCallback: Send + Sync {
    /// Called once before any phase begins, with the total number of
    /// pages the scanner found.
    fn on_run_start(&self, total_pages: usize) {
        let _ = total_pages;
    }

    /// Called when a phase (scan, analyze, spread-split, book-priors,
    /// normalize, second-pass, write, index) begins.
    fn on_phase_start(&self, phase: Phase) {
        let _ = phase;
    }

    /// Called when a phase completes.
    fn on_phase_complete(&self, phase: Phase) {
        let _ = phase;
    }

    /// Called just before a page begins normalization.
    fn on_page_start(&self, page_id: String, index: usize, total: usize) {
        let _ = (page_id, index, total);
    }

    /// Called when a page finishes normalization successfully.
    fn on_page_complete(&self, page_id: String, index: usize, total: usize) {
        let _ = (page_id, index, total);
    }

    /// Called when a page fails; `message` is human-readable.
    fn on_page_error(&self, page_id: String, index: usize, total: usize, message: String) {
        let _ = (page_id, index, total, message);
    }

    /// Called once after all phases complete (including cancellation).
    fn on_run_complete(&self, total_pages: usize, succeeded: usize) {
        let _ = (total_pages, succeeded);
    }
}

/// A no-op implementation for callers that don't need progress events.
/// The default when no callback is configured.
pub struct NoopProgressCallback;

impl PipelineProgressCallback for NoopProgressCallback {}

/// Convenience alias matching the type the orchestrator accepts.
pub type ProgressCallback = Arc<dyn PipelineProgressCallback>;

pub fn noop() -> ProgressCallback {
    Arc::new(NoopProgressCallback)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct TrackingCallback {
        starts: Arc<AtomicUsize>,
        completes: Arc<AtomicUsize>,
        errors: Arc<AtomicUsize>,
    }

    impl PipelineProgressCallback for TrackingCallback {
        fn on_page_start(&self, _page_id: String, _index: usize, _total: usize) {
            self.starts.fetch_add(1, Ordering::SeqCst);
        }

        fn on_page_complete(&self, _page_id: String, _index: usize, _total: usize) {
            self.completes.fetch_add(1, Ordering::SeqCst);
        }

        fn on_page_error(&self, _page_id: String, _index: usize, _total: usize, _message: String) {
            self.errors.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn noop_callback_does_not_panic() {
        let cb = NoopProgressCallback;
        cb.on_run_start(5);
        cb.on_phase_start(Phase::Scan);
        cb.on_page_start("p1".into(), 0, 5);
        cb.on_page_complete("p1".into(), 0, 5);
        cb.on_page_error("p2".into(), 1, 5, "boom".into());
        cb.on_phase_complete(Phase::Scan);
        cb.on_run_complete(5, 4);
    }

    #[test]
    fn tracking_callback_receives_events() {
        let tracker = TrackingCallback {
            starts: Arc::new(AtomicUsize::new(0)),
            completes: Arc::new(AtomicUsize::new(0)),
            errors: Arc::new(AtomicUsize::new(0)),
        };

        tracker.on_page_start("p1".into(), 0, 2);
        tracker.on_page_complete("p1".into(), 0, 2);
        tracker.on_page_start("p2".into(), 1, 2);
        tracker.on_page_error("p2".into(), 1, 2, "mask collapsed".into());

        assert_eq!(tracker.starts.load(Ordering::SeqCst), 2);
        assert_eq!(tracker.completes.load(Ordering::SeqCst), 1);
        assert_eq!(tracker.errors.load(Ordering::SeqCst), 1);
    }

    /// Regression test mirroring the teacher's HRTB/Send fix: proves
    /// `Arc<dyn PipelineProgressCallback>` can be moved into `tokio::spawn`,
    /// which requires every `&self` method argument to be owned/'static.
    #[tokio::test]
    async fn on_page_error_is_send_when_used_in_spawn() {
        use std::sync::Mutex;

        struct StringCollector {
            errors: Arc<Mutex<Vec<String>>>,
        }

        impl PipelineProgressCallback for StringCollector {
            fn on_page_error(&self, _page_id: String, _index: usize, _total: usize, message: String) {
                self.errors.lock().unwrap().push(message);
            }
        }

        let collector = Arc::new(StringCollector {
            errors: Arc::new(Mutex::new(Vec::new())),
        });

        let cb: ProgressCallback = Arc::clone(&collector) as ProgressCallback;

        tokio::spawn(async move {
            cb.on_page_error("p9".into(), 0, 1, "error from spawn".to_string());
        })
        .await
        .unwrap();

        let errors = collector.errors.lock().unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0], "error from spawn");
    }
}
