//! Resilient document reader: open a possibly-malformed PDF through an
//! ordered chain of parsing strategies.
//!
//! Scanned and re-saved academic PDFs are frequently broken in small ways:
//! garbage before the `%PDF-` header, trailing bytes after `%%EOF`, stale
//! cross-reference offsets. No single parser copes with all of them, so
//! [`DocumentReader`] tries a fixed list of [`ReaderBackend`]s and keeps the
//! first one that succeeds:
//!
//! | Order | Backend | Kind |
//! |-------|---------|------|
//! | 1 | lopdf over repaired bytes (trailing junk trimmed) | [`BackendKind::LenientStructural`] |
//! | 2 | pdfium, rendering-oriented and corruption tolerant | [`BackendKind::Rendering`] |
//! | 3 | lopdf over the raw file, every page validated | [`BackendKind::StrictStructural`] |
//!
//! The winning [`BackendKind`] travels with the [`OpenedDocument`] because
//! the two parser families extract pages through incompatible APIs
//! (see [`crate::pipeline::extract`]).
//!
//! All backends are blocking; call [`DocumentReader::open`] from
//! `spawn_blocking`.

use crate::error::{BackendAttempt, Pdf2HtmlError};
use crate::pipeline::render::bind_pdfium;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Which strategy opened a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    LenientStructural,
    Rendering,
    StrictStructural,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BackendKind::LenientStructural => "lenient-structural",
            BackendKind::Rendering => "rendering",
            BackendKind::StrictStructural => "strict-structural",
        };
        f.write_str(s)
    }
}

/// Parser-specific state kept for page extraction.
#[derive(Clone)]
pub(crate) enum DocumentHandle {
    /// Parsed object graph, shared read-only by all workers.
    Structural(Arc<lopdf::Document>),
    /// pdfium documents borrow their library binding, so they are reopened
    /// from the source path for each extraction.
    Rendering,
}

/// A successfully opened document.
#[derive(Clone)]
pub struct OpenedDocument {
    path: PathBuf,
    page_count: usize,
    backend: BackendKind,
    password: Option<String>,
    pub(crate) handle: DocumentHandle,
}

impl fmt::Debug for OpenedDocument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenedDocument")
            .field("path", &self.path)
            .field("page_count", &self.page_count)
            .field("backend", &self.backend)
            .finish()
    }
}

impl OpenedDocument {
    /// A document opened by one of the lopdf strategies.
    pub fn structural(path: impl Into<PathBuf>, backend: BackendKind, doc: lopdf::Document) -> Self {
        let page_count = doc.get_pages().len();
        Self {
            path: path.into(),
            page_count,
            backend,
            password: None,
            handle: DocumentHandle::Structural(Arc::new(doc)),
        }
    }

    /// A document opened by pdfium; pages are extracted from `path` on demand.
    pub fn rendering(path: impl Into<PathBuf>, page_count: usize, password: Option<String>) -> Self {
        Self {
            path: path.into(),
            page_count,
            backend: BackendKind::Rendering,
            password,
            handle: DocumentHandle::Rendering,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn page_count(&self) -> usize {
        self.page_count
    }

    pub fn backend(&self) -> BackendKind {
        self.backend
    }

    pub fn password(&self) -> Option<&str> {
        self.password.as_deref()
    }
}

/// One parsing strategy in the reader chain.
pub trait ReaderBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Try to open `path`. Errors are plain strings: they are logged and
    /// collected, never propagated on their own.
    fn open(&self, path: &Path, password: Option<&str>) -> Result<OpenedDocument, String>;
}

/// Ordered chain of [`ReaderBackend`]s.
pub struct DocumentReader {
    backends: Vec<Box<dyn ReaderBackend>>,
}

impl Default for DocumentReader {
    fn default() -> Self {
        Self::standard()
    }
}

impl DocumentReader {
    /// A reader trying `backends` in the given order.
    pub fn new(backends: Vec<Box<dyn ReaderBackend>>) -> Self {
        Self { backends }
    }

    /// lenient lopdf → pdfium → strict lopdf.
    pub fn standard() -> Self {
        Self::new(vec![
            Box::new(LenientStructuralBackend),
            Box::new(RenderingBackend),
            Box::new(StrictStructuralBackend),
        ])
    }

    /// Open `path` with the first backend that succeeds.
    ///
    /// # Errors
    /// [`Pdf2HtmlError::DocumentUnreadable`] carrying every attempt's reason
    /// when all backends fail.
    pub fn open(&self, path: &Path, password: Option<&str>) -> Result<OpenedDocument, Pdf2HtmlError> {
        let mut attempts = Vec::with_capacity(self.backends.len());

        for backend in &self.backends {
            let kind = backend.kind();
            debug!("Opening {} with {} backend", path.display(), kind);
            match backend.open(path, password) {
                Ok(doc) if doc.page_count() == 0 => {
                    warn!("{} backend opened {} but found no pages", kind, path.display());
                    attempts.push(BackendAttempt {
                        backend: kind,
                        reason: "document has no pages".into(),
                    });
                }
                Ok(doc) => {
                    info!(
                        "Opened {} ({} pages) with {} backend",
                        path.display(),
                        doc.page_count(),
                        kind
                    );
                    return Ok(doc);
                }
                Err(reason) => {
                    warn!("{} backend failed on {}: {}", kind, path.display(), reason);
                    attempts.push(BackendAttempt {
                        backend: kind,
                        reason,
                    });
                }
            }
        }

        Err(Pdf2HtmlError::DocumentUnreadable {
            path: path.to_path_buf(),
            attempts,
        })
    }
}

// ── Backend 1: lenient structural ────────────────────────────────────────

/// lopdf over bytes cut down to `%PDF-` .. last `%%EOF`.
///
/// lopdf skips leading junk on its own but only looks for `%%EOF` in the last
/// 512 bytes, so a file with a longer tail after the trailer (appended logs,
/// padding from a broken upload) fails to open unless the tail is trimmed.
pub struct LenientStructuralBackend;

impl ReaderBackend for LenientStructuralBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::LenientStructural
    }

    fn open(&self, path: &Path, _password: Option<&str>) -> Result<OpenedDocument, String> {
        let bytes = std::fs::read(path).map_err(|e| e.to_string())?;
        let repaired = trim_to_pdf_body(&bytes).ok_or("no %PDF- header found")?;
        if repaired.len() != bytes.len() {
            debug!(
                "Trimmed {} junk bytes from {}",
                bytes.len() - repaired.len(),
                path.display()
            );
        }
        let doc = lopdf::Document::load_mem(repaired).map_err(|e| e.to_string())?;
        if doc.is_encrypted() {
            return Err("document is encrypted".into());
        }
        Ok(OpenedDocument::structural(path, self.kind(), doc))
    }
}

/// Slice `bytes` from the first `%PDF-` up to the end of the last `%%EOF`
/// line. Returns `None` when there is no header at all.
fn trim_to_pdf_body(bytes: &[u8]) -> Option<&[u8]> {
    let start = find(bytes, b"%PDF-")?;
    let body = &bytes[start..];
    let end = match rfind(body, b"%%EOF") {
        Some(pos) => {
            let mut end = pos + b"%%EOF".len();
            while end < body.len() && matches!(body[end], b'\r' | b'\n') {
                end += 1;
            }
            end
        }
        None => body.len(),
    };
    Some(&body[..end])
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn rfind(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).rposition(|w| w == needle)
}

// ── Backend 2: rendering-oriented ────────────────────────────────────────

/// pdfium: slower to bind, far more forgiving of damaged files.
pub struct RenderingBackend;

impl ReaderBackend for RenderingBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Rendering
    }

    fn open(&self, path: &Path, password: Option<&str>) -> Result<OpenedDocument, String> {
        let pdfium = bind_pdfium()?;
        let document = pdfium
            .load_pdf_from_file(path, password)
            .map_err(|e| format!("{:?}", e))?;
        let page_count = document.pages().len() as usize;
        Ok(OpenedDocument::rendering(
            path,
            page_count,
            password.map(str::to_string),
        ))
    }
}

// ── Backend 3: strict structural ─────────────────────────────────────────

/// lopdf over the raw file with every page object validated.
pub struct StrictStructuralBackend;

impl ReaderBackend for StrictStructuralBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::StrictStructural
    }

    fn open(&self, path: &Path, _password: Option<&str>) -> Result<OpenedDocument, String> {
        let doc = lopdf::Document::load(path).map_err(|e| e.to_string())?;
        if doc.is_encrypted() {
            return Err("document is encrypted".into());
        }
        for (num, id) in doc.get_pages() {
            let dict = doc
                .get_dictionary(id)
                .map_err(|e| format!("page {num}: {e}"))?;
            let is_page = dict
                .get(b"Type")
                .and_then(|t| t.as_name())
                .map(|name| name == b"Page")
                .unwrap_or(false);
            if !is_page {
                return Err(format!("page {num}: object {:?} is not a /Page", id));
            }
        }
        Ok(OpenedDocument::structural(path, self.kind(), doc))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::fixtures::write_pdf;

    struct Failing(BackendKind);

    impl ReaderBackend for Failing {
        fn kind(&self) -> BackendKind {
            self.0
        }
        fn open(&self, _path: &Path, _password: Option<&str>) -> Result<OpenedDocument, String> {
            Err(format!("{} cannot parse this", self.0))
        }
    }

    struct Succeeding(usize);

    impl ReaderBackend for Succeeding {
        fn kind(&self) -> BackendKind {
            BackendKind::Rendering
        }
        fn open(&self, path: &Path, password: Option<&str>) -> Result<OpenedDocument, String> {
            Ok(OpenedDocument::rendering(path, self.0, password.map(String::from)))
        }
    }

    #[test]
    fn falls_through_to_secondary_backend() {
        let reader = DocumentReader::new(vec![
            Box::new(Failing(BackendKind::LenientStructural)),
            Box::new(Succeeding(12)),
            Box::new(Failing(BackendKind::StrictStructural)),
        ]);
        let doc = reader.open(Path::new("scan.pdf"), None).unwrap();
        assert_eq!(doc.backend(), BackendKind::Rendering);
        assert_eq!(doc.page_count(), 12);
    }

    #[test]
    fn all_failures_make_the_document_unreadable() {
        let reader = DocumentReader::new(vec![
            Box::new(Failing(BackendKind::LenientStructural)),
            Box::new(Failing(BackendKind::StrictStructural)),
        ]);
        match reader.open(Path::new("scan.pdf"), None) {
            Err(Pdf2HtmlError::DocumentUnreadable { attempts, .. }) => {
                assert_eq!(attempts.len(), 2);
                assert_eq!(attempts[0].backend, BackendKind::LenientStructural);
                assert_eq!(attempts[1].backend, BackendKind::StrictStructural);
            }
            other => panic!("expected DocumentUnreadable, got {other:?}"),
        }
    }

    #[test]
    fn zero_page_result_counts_as_failure() {
        let reader = DocumentReader::new(vec![Box::new(Succeeding(0))]);
        assert!(reader.open(Path::new("empty.pdf"), None).is_err());
    }

    #[test]
    fn lenient_backend_opens_a_clean_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clean.pdf");
        write_pdf(&path, 3);
        let doc = LenientStructuralBackend.open(&path, None).unwrap();
        assert_eq!(doc.page_count(), 3);
        assert_eq!(doc.backend(), BackendKind::LenientStructural);
    }

    #[test]
    fn lenient_backend_survives_trailing_junk_that_strict_rejects() {
        let dir = tempfile::tempdir().unwrap();
        let clean = dir.path().join("clean.pdf");
        write_pdf(&clean, 2);
        let mut bytes = b"GARBAGE FROM A BROKEN SCANNER\n".to_vec();
        bytes.extend(std::fs::read(&clean).unwrap());
        bytes.extend(std::iter::repeat_n(b'#', 2048));
        let dirty = dir.path().join("dirty.pdf");
        std::fs::write(&dirty, bytes).unwrap();

        let doc = LenientStructuralBackend.open(&dirty, None).unwrap();
        assert_eq!(doc.page_count(), 2);
        let err = StrictStructuralBackend.open(&dirty, None).unwrap_err();
        assert!(!err.is_empty());
    }

    #[test]
    fn trim_keeps_eof_line_ending() {
        let bytes = b"xx%PDF-1.5\nbody\n%%EOF\r\njunk";
        let trimmed = trim_to_pdf_body(bytes).unwrap();
        assert_eq!(trimmed, b"%PDF-1.5\nbody\n%%EOF\r\n");
        assert!(trim_to_pdf_body(b"not a pdf").is_none());
    }
}
