//! # edgequake-pdf2html
//!
//! Convert PDF documents to page-faithful HTML using Vision Language Models
//! (VLMs), with optional DOCX and EPUB output through pandoc.
//!
//! ## Why this crate?
//!
//! Text extractors lose layout: right-to-left scripts come out reversed,
//! tables collapse into runs of words, and figures disappear. This crate hands
//! each page to a VLM and asks for HTML that mirrors the page, then swaps the
//! model's figure tokens for the images an upstream extractor already cut out
//! of the PDF. Long documents go page by page through a bounded worker pool
//! that shares one sliding-window rate limiter, so a provider quota is never
//! exceeded no matter how many workers run.
//!
//! ## Pipeline Overview
//!
//! ```text
//! PDF (file or folder)
//!  │
//!  ├─ 1. Input      resolve a file, or every *.pdf in a folder
//!  ├─ 2. Reader     lenient lopdf → pdfium → strict lopdf
//!  ├─ 3. Manifest   {stem}_manifest.json: extracted image regions per page
//!  ├─ 4. Generate   one call for the whole document, or one per page
//!  │                  (extract page → rate limit → VLM, N workers)
//!  ├─ 5. Clean      strip fences, chatter and hallucinated images
//!  ├─ 6. Resolve    [IMAGE_PLACEHOLDER: id] → <figure><img …></figure>
//!  ├─ 7. Assemble   page sections with per-page lang/dir → {stem}.html
//!  └─ 8. Formats    DOCX / EPUB via pandoc (RTL aware)
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use edgequake_pdf2html::{convert_document, ConversionConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Provider auto-detected from GEMINI_API_KEY / OPENAI_API_KEY / …
//!     let config = ConversionConfig::builder().output_dir("output_html").build()?;
//!     let report = convert_document("paper.pdf", &config).await?;
//!     println!("{}", report.summary_line());
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `pdf2html` binary (clap + anyhow + tracing-subscriber + indicatif) |
//!
//! Disable `cli` when using only the library:
//! ```toml
//! edgequake-pdf2html = { version = "0.1", default-features = false }
//! ```
//!
//! ## Artifacts
//!
//! | Path | Written when |
//! |------|--------------|
//! | `{output_dir}/{stem}_page_{n}.html` | per-page mode, one per successful page |
//! | `{output_dir}/{stem}.html` | always |
//! | `{output_dir}/{stem}.docx` / `.epub` | when requested in `formats` |
//!
//! Artifacts newer than their source PDF are reused unless `force` is set.

// ── Modules ──────────────────────────────────────────────────────────────

pub mod config;
pub mod convert;
pub mod error;
pub mod format;
pub mod manifest;
pub mod output;
pub mod pipeline;
pub mod progress;
pub mod prompts;
pub mod rate_limit;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{
    ConversionConfig, ConversionConfigBuilder, ConversionMode, EpubMath, FailedPagePolicy,
    FormatOptions, OutputFormat, PageSeparator,
};
pub use convert::{
    convert_document, convert_document_sync, convert_document_with, convert_folder,
    convert_folder_with, resolve_provider, ConversionContext,
};
pub use error::{BackendAttempt, PageError, PageStage, Pdf2HtmlError};
pub use format::{FormatConverter, FormatMetadata, PandocConverter};
pub use manifest::{ImageRegion, Manifest};
pub use output::{
    BatchReport, DocumentReport, FormatOutcome, GenerationMode, PageResult, SkippedDocument,
};
pub use pipeline::lang::{Direction, LanguageInfo};
pub use pipeline::llm::{GenerationBackend, GenerationError, GenerationRequest, VisionBackend};
pub use pipeline::reader::{BackendKind, DocumentReader, OpenedDocument, ReaderBackend};
pub use progress::{
    ConversionProgressCallback, NoopProgressCallback, ProgressCallback, ProgressSnapshot,
};
pub use rate_limit::RateLimiter;
