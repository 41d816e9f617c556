//! Result types returned by the conversion entry points.
//!
//! Every type here is `Serialize` so callers (and the CLI's `--json` flag)
//! can emit a machine-readable report of a run.

use crate::config::OutputFormat;
use crate::error::PageError;
use crate::pipeline::lang::Direction;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Outcome for one page.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageResult {
    /// 1-indexed page number.
    pub page_num: usize,

    /// Sanitised, resolved page markup. Empty when the page failed.
    pub markup: String,

    /// Persisted page artifact, when one was written or reused.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_path: Option<PathBuf>,

    /// Language tag detected on the page.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lang: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub dir: Option<Direction>,

    /// Wall-clock time spent on this page (extraction to persistence).
    pub duration_ms: u64,

    /// Loaded from a fresh artifact instead of being regenerated.
    #[serde(default)]
    pub reused: bool,

    /// Set when the page failed; the document still assembles.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<PageError>,
}

impl PageResult {
    pub fn failed(page_num: usize, error: PageError, duration_ms: u64) -> Self {
        Self {
            page_num,
            markup: String::new(),
            output_path: None,
            lang: None,
            dir: None,
            duration_ms,
            reused: false,
            error: Some(error),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// How a document was generated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationMode {
    WholeDocument,
    PerPage,
}

/// Outcome of one derived-format conversion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FormatOutcome {
    pub format: OutputFormat,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Outcome for one document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentReport {
    /// Source PDF.
    pub source: PathBuf,
    pub stem: String,
    pub mode: GenerationMode,
    pub pages_total: usize,
    pub pages_succeeded: usize,
    pub pages_failed: usize,
    /// Pages loaded from fresh artifacts.
    pub pages_reused: usize,
    /// Images in the manifest, and how many ended up in the markup.
    pub images_total: usize,
    pub images_embedded: usize,
    /// Placeholder tokens left in the markup.
    pub unresolved_placeholders: usize,
    /// The assembled `{stem}.html`.
    pub output_path: PathBuf,
    #[serde(default)]
    pub formats: Vec<FormatOutcome>,
    pub elapsed_ms: u64,
    /// Per-page outcomes, ascending by page.
    #[serde(default)]
    pub pages: Vec<PageResult>,
}

impl DocumentReport {
    /// One-line summary logged after each document.
    pub fn summary_line(&self) -> String {
        format!(
            "{}: {}/{} pages ok, {} failed, {} reused, {:.1}s",
            self.stem,
            self.pages_succeeded,
            self.pages_total,
            self.pages_failed,
            self.pages_reused,
            self.elapsed_ms as f64 / 1000.0
        )
    }
}

/// A document the batch could not convert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkippedDocument {
    pub source: PathBuf,
    pub error: String,
}

/// Outcome of a folder run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchReport {
    pub documents: Vec<DocumentReport>,
    pub skipped: Vec<SkippedDocument>,
    pub elapsed_ms: u64,
}

impl BatchReport {
    pub fn pages_failed(&self) -> usize {
        self.documents.iter().map(|d| d.pages_failed).sum()
    }

    /// Whether every document converted and every page succeeded.
    pub fn is_clean(&self) -> bool {
        self.skipped.is_empty() && self.pages_failed() == 0
    }
}
