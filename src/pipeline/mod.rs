//! Pipeline stages for PDF-to-HTML conversion.
//!
//! Each submodule implements one step. Keeping stages separate makes each
//! independently testable and lets the page pipeline run them behind traits
//! ([`extract::PageExtractor`], [`llm::GenerationBackend`]) that tests can
//! replace.
//!
//! ## Data Flow
//!
//! ```text
//! input ──▶ reader ──▶ extract ──▶ llm ──▶ postprocess ──▶ placeholder ──▶ assemble
//! (paths)  (fallback)  (1-page PDF) (VLM)   (cleanup)      (figures)       (document)
//! ```
//!
//! 1. [`input`]  — resolve a file or a folder of PDFs
//! 2. [`reader`] — open the document through an ordered list of backends
//! 3. [`extract`] — write one page into a transient single-page PDF
//! 4. [`llm`]    — one generation call per page; the only stage with network
//!    I/O, and the only one behind the rate limiter
//! 5. [`postprocess`] — deterministic cleanup of model quirks
//! 6. [`placeholder`] — swap image tokens for manifest figures
//! 7. [`assemble`] — stitch page sections into one document
//!
//! [`worker`] drives steps 3–6 concurrently; [`render`] rasterises artifacts
//! for the vision backend; [`lang`] detects language and direction.

pub mod assemble;
pub mod extract;
pub mod input;
pub mod lang;
pub mod llm;
pub mod placeholder;
pub mod postprocess;
pub mod reader;
pub mod render;
pub mod worker;

#[cfg(test)]
pub(crate) mod fixtures;

use std::path::Path;

/// Write `contents` to `path` via a sibling temp file and a rename, so readers
/// never observe a half-written artifact.
pub(crate) async fn write_atomic(path: &Path, contents: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }
    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp_path = std::path::PathBuf::from(tmp_name);

    tokio::fs::write(&tmp_path, contents).await?;
    if let Err(e) = tokio::fs::rename(&tmp_path, path).await {
        let _ = tokio::fs::remove_file(&tmp_path).await;
        return Err(e);
    }
    Ok(())
}
