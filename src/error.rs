//! Error types for the edgequake-pdf2html library.
//!
//! Two distinct error types reflect two distinct blast radii:
//!
//! * [`Pdf2HtmlError`] — **Fatal for a document or a run**: the document
//!   cannot be opened by any reader backend, the provider is not configured,
//!   the configuration is invalid. Returned as `Err(Pdf2HtmlError)` from the
//!   `convert*` entry points. In a batch, document-level variants are recorded
//!   in the report and the next document is attempted.
//!
//! * [`PageError`] — **Non-fatal**: a single page failed (extraction glitch,
//!   provider error, timeout) while its siblings are fine. Stored inside
//!   [`crate::output::PageResult`] so the assembler can mark the page instead
//!   of losing the whole document to it.

use crate::pipeline::reader::BackendKind;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// All fatal errors returned by the edgequake-pdf2html library.
#[derive(Debug, Error)]
pub enum Pdf2HtmlError {
    // ── Input errors ──────────────────────────────────────────────────────
    /// Input path was not found.
    #[error("Input not found: '{path}'\nCheck the path exists and is readable.")]
    FileNotFound { path: PathBuf },

    /// Process does not have read permission on the path.
    #[error("Permission denied reading '{path}'\nTry: chmod +r {path:?}")]
    PermissionDenied { path: PathBuf },

    /// The input directory holds no `*.pdf` files.
    #[error("No PDF documents found in '{path}'")]
    NoDocumentsFound { path: PathBuf },

    // ── Document errors ───────────────────────────────────────────────────
    /// Every reader backend failed to open the document.
    #[error("Document '{path}' is unreadable: {}", format_attempts(.attempts))]
    DocumentUnreadable {
        path: PathBuf,
        attempts: Vec<BackendAttempt>,
    },

    /// The image manifest exists but could not be parsed.
    #[error("Manifest '{path}' is invalid: {detail}")]
    ManifestInvalid { path: PathBuf, detail: String },

    // ── LLM errors ────────────────────────────────────────────────────────
    /// The single whole-document generation call failed or timed out.
    #[error("Generation for '{path}' failed: {detail}")]
    GenerationFailed { path: PathBuf, detail: String },

    /// The configured provider is not initialised (missing API key etc.).
    #[error("LLM provider '{provider}' is not configured.\n{hint}")]
    ProviderNotConfigured { provider: String, hint: String },

    // ── Output errors ─────────────────────────────────────────────────────
    /// Could not create or write an output file.
    #[error("Failed to write output file '{path}': {source}")]
    OutputWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The external format converter returned failure.
    #[error("Conversion of '{input}' to {format} failed: {detail}")]
    FormatConversionFailed {
        input: PathBuf,
        format: String,
        detail: String,
    },

    /// The external format converter is not installed.
    #[error("'{tool}' was not found on PATH.\nInstall it (e.g. `apt install {tool}`) to produce DOCX/EPUB output.")]
    ConverterUnavailable { tool: String },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Pdf2HtmlError {
    /// Whether this error only affects the document it was raised for.
    ///
    /// Batch runs record these and move on; everything else aborts the run.
    pub fn is_document_scoped(&self) -> bool {
        matches!(
            self,
            Pdf2HtmlError::DocumentUnreadable { .. }
                | Pdf2HtmlError::GenerationFailed { .. }
                | Pdf2HtmlError::ManifestInvalid { .. }
                | Pdf2HtmlError::OutputWriteFailed { .. }
                | Pdf2HtmlError::FormatConversionFailed { .. }
                | Pdf2HtmlError::FileNotFound { .. }
                | Pdf2HtmlError::PermissionDenied { .. }
        )
    }
}

/// One failed reader attempt, kept for the `DocumentUnreadable` report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendAttempt {
    pub backend: BackendKind,
    pub reason: String,
}

fn format_attempts(attempts: &[BackendAttempt]) -> String {
    if attempts.is_empty() {
        return "no reader backends configured".to_string();
    }
    attempts
        .iter()
        .map(|a| format!("{} → {}", a.backend, a.reason))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Where in the per-page state machine a page stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PageStage {
    Pending,
    Extracting,
    RateLimited,
    Generating,
    Sanitizing,
    Resolving,
    Persisted,
}

impl fmt::Display for PageStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PageStage::Pending => "pending",
            PageStage::Extracting => "extracting",
            PageStage::RateLimited => "rate-limited",
            PageStage::Generating => "generating",
            PageStage::Sanitizing => "sanitizing",
            PageStage::Resolving => "resolving",
            PageStage::Persisted => "persisted",
        };
        f.write_str(s)
    }
}

/// A non-fatal error for a single page.
///
/// Stored in [`crate::output::PageResult::error`]. The document continues
/// with its remaining pages.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
pub enum PageError {
    /// Both the primary and the fallback extraction routine failed.
    #[error("Page {page}: extraction failed: {detail}")]
    ExtractionFailed { page: usize, detail: String },

    /// The generation backend returned an error. Never retried.
    #[error("Page {page}: generation failed: {detail}")]
    GenerationFailed { page: usize, detail: String },

    /// The generation call exceeded the configured timeout.
    #[error("Page {page}: generation timed out after {secs}s")]
    Timeout { page: usize, secs: u64 },

    /// The page markup could not be written to disk.
    #[error("Page {page}: could not persist '{path}': {detail}")]
    PersistFailed {
        page: usize,
        path: PathBuf,
        detail: String,
    },

    /// The worker holding the page ended without reporting it.
    #[error("Page {page}: worker ended before reporting ({detail})")]
    WorkerLost { page: usize, detail: String },
}

impl PageError {
    /// The 1-indexed page this error belongs to.
    pub fn page(&self) -> usize {
        match self {
            PageError::ExtractionFailed { page, .. }
            | PageError::GenerationFailed { page, .. }
            | PageError::Timeout { page, .. }
            | PageError::PersistFailed { page, .. }
            | PageError::WorkerLost { page, .. } => *page,
        }
    }

    /// The state the page was in when it failed.
    pub fn stage(&self) -> PageStage {
        match self {
            PageError::ExtractionFailed { .. } => PageStage::Extracting,
            PageError::GenerationFailed { .. } | PageError::Timeout { .. } => {
                PageStage::Generating
            }
            PageError::PersistFailed { .. } => PageStage::Persisted,
            PageError::WorkerLost { .. } => PageStage::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unreadable_lists_every_attempt() {
        let e = Pdf2HtmlError::DocumentUnreadable {
            path: PathBuf::from("broken.pdf"),
            attempts: vec![
                BackendAttempt {
                    backend: BackendKind::LenientStructural,
                    reason: "no xref".into(),
                },
                BackendAttempt {
                    backend: BackendKind::Rendering,
                    reason: "bad header".into(),
                },
            ],
        };
        let msg = e.to_string();
        assert!(msg.contains("broken.pdf"), "got: {msg}");
        assert!(msg.contains("no xref"), "got: {msg}");
        assert!(msg.contains("bad header"), "got: {msg}");
    }

    #[test]
    fn document_scoped_errors_do_not_abort_batches() {
        let e = Pdf2HtmlError::FormatConversionFailed {
            input: PathBuf::from("a.html"),
            format: "epub".into(),
            detail: "exit status 1".into(),
        };
        assert!(e.is_document_scoped());
        assert!(!Pdf2HtmlError::InvalidConfig("x".into()).is_document_scoped());
        assert!(!Pdf2HtmlError::NoDocumentsFound {
            path: PathBuf::from("in")
        }
        .is_document_scoped());
    }

    #[test]
    fn timeout_display() {
        let e = PageError::Timeout { page: 3, secs: 90 };
        assert!(e.to_string().contains("90s"));
        assert!(e.to_string().contains("Page 3"));
        assert_eq!(e.stage(), PageStage::Generating);
    }

    #[test]
    fn page_error_round_trips_through_json() {
        let e = PageError::ExtractionFailed {
            page: 7,
            detail: "lopdf: missing page".into(),
        };
        let json = serde_json::to_string(&e).unwrap();
        let back: PageError = serde_json::from_str(&json).unwrap();
        assert_eq!(back.page(), 7);
        assert_eq!(back.stage(), PageStage::Extracting);
    }
}
