//! Progress-callback trait for per-page and per-document conversion events.
//!
//! Inject an [`Arc<dyn ConversionProgressCallback>`] via
//! [`crate::config::ConversionConfigBuilder::progress_callback`] to receive
//! events as the pipeline works through a document or a folder.
//!
//! # Why callbacks instead of channels?
//!
//! Callers can forward events to a terminal progress bar, a log, or a job
//! table without the library knowing how the host application communicates.
//! Internally the page pipeline already reports through a channel; the
//! supervisor draining it is the only caller of page-level events, and it
//! invokes them one at a time under a print lock.
//!
//! # Example
//!
//! ```rust
//! use edgequake_pdf2html::{ConversionProgressCallback, ConversionConfig, ProgressSnapshot};
//! use std::sync::Arc;
//!
//! struct EtaPrinter;
//!
//! impl ConversionProgressCallback for EtaPrinter {
//!     fn on_progress(&self, snapshot: &ProgressSnapshot) {
//!         eprintln!(
//!             "{}/{} done, {} failed, eta {:?}",
//!             snapshot.completed, snapshot.total, snapshot.failed, snapshot.eta
//!         );
//!     }
//! }
//!
//! let config = ConversionConfig::builder()
//!     .progress_callback(Arc::new(EtaPrinter) as Arc<dyn ConversionProgressCallback>)
//!     .build()
//!     .unwrap();
//! ```

use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Aggregate pipeline state after each finished page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressSnapshot {
    /// Pages persisted successfully (including reused artifacts).
    pub completed: usize,
    pub failed: usize,
    pub total: usize,
    /// Time since the pipeline started.
    pub elapsed: Duration,
    /// Mean elapsed time per finished page times the pages remaining.
    /// `None` until the first page finishes.
    pub eta: Option<Duration>,
}

impl ProgressSnapshot {
    pub fn new(completed: usize, failed: usize, total: usize, elapsed: Duration) -> Self {
        let done = completed + failed;
        let remaining = total.saturating_sub(done);
        let eta = if done == 0 {
            None
        } else {
            Some(elapsed.mul_f64(remaining as f64 / done as f64))
        };
        Self {
            completed,
            failed,
            total,
            elapsed,
            eta,
        }
    }

    pub fn finished(&self) -> usize {
        self.completed + self.failed
    }
}

/// Called by the conversion pipeline as it processes documents and pages.
///
/// Implementations must be `Send + Sync`. All methods have default no-op
/// implementations so callers only override what they care about.
///
/// # Thread safety
///
/// Page events are emitted by a single supervisor task, never concurrently.
/// Document events in a batch run are emitted sequentially too.
pub trait ConversionProgressCallback: Send + Sync {
    /// Called when a batch run moves to the next document.
    ///
    /// # Arguments
    /// * `name`  — file name of the document
    /// * `index` — 1-indexed position in the batch
    /// * `total` — documents in the batch
    fn on_document_start(&self, name: &str, index: usize, total: usize) {
        let _ = (name, index, total);
    }

    /// Called when a document fails as a whole and the batch moves on.
    fn on_document_error(&self, name: &str, error: &str) {
        let _ = (name, error);
    }

    /// Called once per document before any page is generated.
    ///
    /// # Arguments
    /// * `total_pages`  — pages in the document
    /// * `reused_pages` — pages whose persisted artifact is fresh and will
    ///   not be regenerated
    fn on_conversion_start(&self, total_pages: usize, reused_pages: usize) {
        let _ = (total_pages, reused_pages);
    }

    /// Called when a worker picks up a page.
    fn on_page_start(&self, page_num: usize, total_pages: usize) {
        let _ = (page_num, total_pages);
    }

    /// Called when a page is persisted.
    ///
    /// # Arguments
    /// * `html_len` — byte length of the page markup
    fn on_page_complete(&self, page_num: usize, total_pages: usize, html_len: usize) {
        let _ = (page_num, total_pages, html_len);
    }

    /// Called when a page fails. The page is not retried.
    fn on_page_error(&self, page_num: usize, total_pages: usize, error: &str) {
        let _ = (page_num, total_pages, error);
    }

    /// Called after every finished page with the running totals.
    fn on_progress(&self, snapshot: &ProgressSnapshot) {
        let _ = snapshot;
    }

    /// Called once after all pages of a document have been attempted.
    fn on_conversion_complete(&self, total_pages: usize, success_count: usize) {
        let _ = (total_pages, success_count);
    }
}

/// A no-op implementation for callers that don't need progress events.
///
/// This is the default when no callback is configured.
pub struct NoopProgressCallback;

impl ConversionProgressCallback for NoopProgressCallback {}

/// Convenience alias matching the type stored in [`crate::config::ConversionConfig`].
pub type ProgressCallback = Arc<dyn ConversionProgressCallback>;

/// Wraps a callback so that no two events are delivered at the same time.
///
/// The page pipeline reports from a single supervisor, but the document
/// driver also emits events; both go through this lock.
pub(crate) struct SerializedProgress {
    inner: Option<ProgressCallback>,
    print_lock: Mutex<()>,
}

impl SerializedProgress {
    pub(crate) fn new(inner: Option<ProgressCallback>) -> Self {
        Self {
            inner,
            print_lock: Mutex::new(()),
        }
    }

    /// Run `f` against the callback, if any, while holding the print lock.
    pub(crate) fn emit(&self, f: impl FnOnce(&dyn ConversionProgressCallback)) {
        if let Some(cb) = &self.inner {
            let _guard = self
                .print_lock
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            f(cb.as_ref());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct TrackingCallback {
        starts: AtomicUsize,
        completes: AtomicUsize,
        errors: AtomicUsize,
        last_finished: AtomicUsize,
    }

    impl ConversionProgressCallback for TrackingCallback {
        fn on_page_start(&self, _page_num: usize, _total_pages: usize) {
            self.starts.fetch_add(1, Ordering::SeqCst);
        }

        fn on_page_complete(&self, _page_num: usize, _total_pages: usize, _html_len: usize) {
            self.completes.fetch_add(1, Ordering::SeqCst);
        }

        fn on_page_error(&self, _page_num: usize, _total_pages: usize, _error: &str) {
            self.errors.fetch_add(1, Ordering::SeqCst);
        }

        fn on_progress(&self, snapshot: &ProgressSnapshot) {
            self.last_finished.store(snapshot.finished(), Ordering::SeqCst);
        }
    }

    #[test]
    fn noop_callback_does_not_panic() {
        let cb = NoopProgressCallback;
        cb.on_document_start("a.pdf", 1, 2);
        cb.on_conversion_start(5, 1);
        cb.on_page_start(1, 5);
        cb.on_page_complete(1, 5, 42);
        cb.on_page_error(2, 5, "some error");
        cb.on_progress(&ProgressSnapshot::new(1, 1, 5, Duration::from_secs(4)));
        cb.on_conversion_complete(5, 4);
    }

    #[test]
    fn serialized_progress_forwards_events() {
        let tracker = Arc::new(TrackingCallback::default());
        let progress = SerializedProgress::new(Some(tracker.clone() as ProgressCallback));

        progress.emit(|cb| cb.on_page_start(1, 3));
        progress.emit(|cb| cb.on_page_complete(1, 3, 100));
        progress.emit(|cb| cb.on_page_error(2, 3, "provider timeout"));
        progress.emit(|cb| {
            cb.on_progress(&ProgressSnapshot::new(1, 1, 3, Duration::from_secs(10)))
        });

        assert_eq!(tracker.starts.load(Ordering::SeqCst), 1);
        assert_eq!(tracker.completes.load(Ordering::SeqCst), 1);
        assert_eq!(tracker.errors.load(Ordering::SeqCst), 1);
        assert_eq!(tracker.last_finished.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn eta_extrapolates_mean_page_time() {
        let snap = ProgressSnapshot::new(3, 1, 10, Duration::from_secs(40));
        // 10 s per finished page, 6 pages left.
        assert_eq!(snap.eta, Some(Duration::from_secs(60)));
        assert_eq!(ProgressSnapshot::new(0, 0, 10, Duration::from_secs(5)).eta, None);
        assert_eq!(
            ProgressSnapshot::new(10, 0, 10, Duration::from_secs(5)).eta,
            Some(Duration::ZERO)
        );
    }
}
