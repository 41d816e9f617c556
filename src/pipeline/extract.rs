//! Page extraction: materialise one page as a transient single-page PDF.
//!
//! The generation backend works on one page at a time, so each worker asks
//! the [`PageExtractor`] for its page and owns the resulting
//! [`PageArtifact`] exclusively. The artifact lives in scratch space as a
//! `tempfile::NamedTempFile` and is deleted when the worker drops it.
//!
//! ## Fallback
//!
//! Documents opened by the lenient lopdf backend are sometimes readable but
//! not re-writable (dangling references, damaged streams). When structural
//! extraction fails for such a document, the page is extracted once more with
//! pdfium straight from the original file. The retry is page-local: a page
//! that fails both ways is reported and its siblings carry on.

use crate::error::PageError;
use crate::pipeline::reader::{BackendKind, DocumentHandle, OpenedDocument};
use crate::pipeline::render::bind_pdfium;
use pdfium_render::prelude::PdfPageIndex;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

/// A transient page (or whole-document) PDF handed to the generator.
#[derive(Debug)]
pub struct PageArtifact {
    page_num: Option<usize>,
    file: ArtifactFile,
    backend: BackendKind,
}

#[derive(Debug)]
enum ArtifactFile {
    /// Owned scratch file, removed on drop.
    Scratch(NamedTempFile),
    /// The source document itself (whole-document mode); never removed.
    Source(PathBuf),
}

impl PageArtifact {
    /// Wrap an extracted scratch file.
    pub fn scratch(page_num: usize, file: NamedTempFile, backend: BackendKind) -> Self {
        Self {
            page_num: Some(page_num),
            file: ArtifactFile::Scratch(file),
            backend,
        }
    }

    /// Use the source document as-is for a single whole-document call.
    pub fn whole_document(source: impl Into<PathBuf>, backend: BackendKind) -> Self {
        Self {
            page_num: None,
            file: ArtifactFile::Source(source.into()),
            backend,
        }
    }

    pub fn path(&self) -> &Path {
        match &self.file {
            ArtifactFile::Scratch(f) => f.path(),
            ArtifactFile::Source(p) => p,
        }
    }

    /// 1-indexed page number; `None` for a whole-document artifact.
    pub fn page_num(&self) -> Option<usize> {
        self.page_num
    }

    /// Backend that produced the artifact bytes.
    pub fn backend(&self) -> BackendKind {
        self.backend
    }
}

/// Source of single-page artifacts for the page pipeline.
///
/// `extract` is blocking; the pipeline calls it from `spawn_blocking`.
pub trait PageExtractor: Send + Sync {
    fn page_count(&self) -> usize;

    /// Write page `page_num` (1-indexed) into `scratch_dir`.
    fn extract(&self, page_num: usize, scratch_dir: &Path) -> Result<PageArtifact, PageError>;
}

impl PageExtractor for OpenedDocument {
    fn page_count(&self) -> usize {
        OpenedDocument::page_count(self)
    }

    fn extract(&self, page_num: usize, scratch_dir: &Path) -> Result<PageArtifact, PageError> {
        extract_page(self, page_num, scratch_dir, &NativeCopier)
    }
}

/// The two ways of copying one page out of its source document.
pub(crate) trait PageCopier: Send + Sync {
    /// Clone the parsed object graph down to `page_num` and save it to `out`.
    fn structural(&self, doc: &lopdf::Document, page_num: usize, out: &Path) -> Result<(), String>;

    /// Copy `page_num` of `source` into a fresh document at `out` with pdfium.
    fn rendering(
        &self,
        source: &Path,
        password: Option<&str>,
        page_num: usize,
        out: &Path,
    ) -> Result<(), String>;
}

/// lopdf for structural documents, pdfium for everything else.
struct NativeCopier;

impl PageCopier for NativeCopier {
    fn structural(&self, doc: &lopdf::Document, page_num: usize, out: &Path) -> Result<(), String> {
        extract_structural(doc, page_num, out)
    }

    fn rendering(
        &self,
        source: &Path,
        password: Option<&str>,
        page_num: usize,
        out: &Path,
    ) -> Result<(), String> {
        extract_rendering(source, password, page_num, out)
    }
}

pub(crate) fn extract_page(
    doc: &OpenedDocument,
    page_num: usize,
    scratch_dir: &Path,
    copier: &dyn PageCopier,
) -> Result<PageArtifact, PageError> {
    let failed = |detail: String| PageError::ExtractionFailed {
        page: page_num,
        detail,
    };

    if page_num == 0 || page_num > doc.page_count() {
        return Err(failed(format!(
            "page out of range (document has {} pages)",
            doc.page_count()
        )));
    }

    let scratch = scratch_file(page_num, scratch_dir).map_err(|e| failed(e.to_string()))?;

    let primary = match &doc.handle {
        DocumentHandle::Structural(parsed) => copier.structural(parsed, page_num, scratch.path()),
        DocumentHandle::Rendering => {
            copier.rendering(doc.path(), doc.password(), page_num, scratch.path())
        }
    };

    match primary {
        Ok(()) => {
            debug!("Extracted page {} via {}", page_num, doc.backend());
            Ok(PageArtifact::scratch(page_num, scratch, doc.backend()))
        }
        Err(primary_err) if doc.backend() == BackendKind::LenientStructural => {
            warn!(
                "Page {}: structural extraction failed ({}); retrying with pdfium",
                page_num, primary_err
            );
            copier
                .rendering(doc.path(), doc.password(), page_num, scratch.path())
                .map(|()| PageArtifact::scratch(page_num, scratch, BackendKind::Rendering))
                .map_err(|fallback_err| {
                    failed(format!("{primary_err}; pdfium fallback: {fallback_err}"))
                })
        }
        Err(e) => Err(failed(e)),
    }
}

fn scratch_file(page_num: usize, scratch_dir: &Path) -> std::io::Result<NamedTempFile> {
    std::fs::create_dir_all(scratch_dir)?;
    tempfile::Builder::new()
        .prefix(&format!("page_{page_num}_"))
        .suffix(".pdf")
        .tempfile_in(scratch_dir)
}

/// Clone the object graph, drop every other page, and save.
fn extract_structural(doc: &lopdf::Document, page_num: usize, out: &Path) -> Result<(), String> {
    let mut single = doc.clone();
    let pages = single.get_pages();
    let target = u32::try_from(page_num).map_err(|_| format!("page {page_num} out of range"))?;
    if !pages.contains_key(&target) {
        return Err(format!("page {page_num} missing from page tree"));
    }
    let others: Vec<u32> = pages.keys().copied().filter(|&n| n != target).collect();
    single.delete_pages(&others);
    single.prune_objects();
    single.compress();
    single.save(out).map_err(|e| e.to_string())?;
    Ok(())
}

/// Copy one page into a fresh pdfium document, reading from `source`.
fn extract_rendering(
    source: &Path,
    password: Option<&str>,
    page_num: usize,
    out: &Path,
) -> Result<(), String> {
    let pdfium = bind_pdfium()?;
    let src = pdfium
        .load_pdf_from_file(source, password)
        .map_err(|e| format!("{:?}", e))?;
    let total = src.pages().len() as usize;
    if page_num > total {
        return Err(format!("page {page_num} beyond {total} pages"));
    }
    let index = pdfium_index(page_num)?;
    let mut single = pdfium.create_new_pdf().map_err(|e| format!("{:?}", e))?;
    single
        .pages_mut()
        .copy_page_from_document(&src, index, 0)
        .map_err(|e| format!("{:?}", e))?;
    single.save_to_file(out).map_err(|e| format!("{:?}", e))?;
    Ok(())
}

/// pdfium's 0-based page index for 1-based `page_num`.
fn pdfium_index(page_num: usize) -> Result<PdfPageIndex, String> {
    page_num
        .checked_sub(1)
        .and_then(|i| PdfPageIndex::try_from(i).ok())
        .ok_or_else(|| format!("page {page_num} is outside pdfium's page index range"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::fixtures::{build_pdf, write_pdf};
    use crate::pipeline::reader::{LenientStructuralBackend, ReaderBackend};

    #[test]
    fn extracts_one_page_into_scratch() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("doc.pdf");
        write_pdf(&src, 3);
        let doc = LenientStructuralBackend.open(&src, None).unwrap();

        let scratch = dir.path().join("scratch");
        let artifact = doc.extract(2, &scratch).unwrap();
        assert_eq!(artifact.page_num(), Some(2));
        assert_eq!(artifact.backend(), BackendKind::LenientStructural);

        let single = lopdf::Document::load(artifact.path()).unwrap();
        assert_eq!(single.get_pages().len(), 1);

        // The scratch file disappears with the artifact.
        let path = artifact.path().to_path_buf();
        drop(artifact);
        assert!(!path.exists());
    }

    #[test]
    fn out_of_range_page_is_a_page_error() {
        let dir = tempfile::tempdir().unwrap();
        let doc = OpenedDocument::structural(
            dir.path().join("doc.pdf"),
            BackendKind::StrictStructural,
            build_pdf(2),
        );
        let err = doc.extract(3, dir.path()).unwrap_err();
        assert_eq!(err.page(), 3);
        assert!(matches!(err, PageError::ExtractionFailed { .. }));
    }

    /// Copier with scripted outcomes that records which strategy ran.
    struct ScriptedCopier {
        structural: Result<(), String>,
        rendering: Result<(), String>,
        calls: std::sync::Mutex<Vec<&'static str>>,
    }

    impl ScriptedCopier {
        fn new(structural: Result<(), &str>, rendering: Result<(), &str>) -> Self {
            Self {
                structural: structural.map_err(String::from),
                rendering: rendering.map_err(String::from),
                calls: Default::default(),
            }
        }

        fn calls(&self) -> Vec<&'static str> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl PageCopier for ScriptedCopier {
        fn structural(
            &self,
            _doc: &lopdf::Document,
            _page: usize,
            _out: &Path,
        ) -> Result<(), String> {
            self.calls.lock().unwrap().push("structural");
            self.structural.clone()
        }

        fn rendering(
            &self,
            _source: &Path,
            _password: Option<&str>,
            _page: usize,
            _out: &Path,
        ) -> Result<(), String> {
            self.calls.lock().unwrap().push("rendering");
            self.rendering.clone()
        }
    }

    fn opened(dir: &Path, backend: BackendKind) -> OpenedDocument {
        OpenedDocument::structural(dir.join("doc.pdf"), backend, build_pdf(2))
    }

    #[test]
    fn lenient_document_retries_with_pdfium() {
        let dir = tempfile::tempdir().unwrap();
        let doc = opened(dir.path(), BackendKind::LenientStructural);
        let copier = ScriptedCopier::new(Err("dangling reference 12 0 R"), Ok(()));

        let artifact = extract_page(&doc, 2, dir.path(), &copier).unwrap();
        assert_eq!(artifact.backend(), BackendKind::Rendering);
        assert_eq!(artifact.page_num(), Some(2));
        assert_eq!(copier.calls(), vec!["structural", "rendering"]);
    }

    #[test]
    fn failed_retry_reports_both_reasons() {
        let dir = tempfile::tempdir().unwrap();
        let doc = opened(dir.path(), BackendKind::LenientStructural);
        let copier = ScriptedCopier::new(Err("dangling reference"), Err("pdfium not bound"));

        match extract_page(&doc, 1, dir.path(), &copier) {
            Err(PageError::ExtractionFailed { page, detail }) => {
                assert_eq!(page, 1);
                assert!(detail.contains("dangling reference"), "{detail}");
                assert!(detail.contains("pdfium fallback: pdfium not bound"), "{detail}");
            }
            other => panic!("expected ExtractionFailed, got {other:?}"),
        }
    }

    #[test]
    fn strict_document_does_not_retry() {
        let dir = tempfile::tempdir().unwrap();
        let doc = opened(dir.path(), BackendKind::StrictStructural);
        let copier = ScriptedCopier::new(Err("damaged stream"), Ok(()));

        let err = extract_page(&doc, 1, dir.path(), &copier).unwrap_err();
        assert!(matches!(err, PageError::ExtractionFailed { .. }));
        assert_eq!(copier.calls(), vec!["structural"]);
    }

    #[test]
    fn pdfium_index_is_checked() {
        assert_eq!(pdfium_index(1), Ok(0));
        assert_eq!(pdfium_index(65_536), Ok(65_535));
        assert!(pdfium_index(0).is_err());
        assert!(pdfium_index(70_000).is_err());
    }

    #[test]
    fn whole_document_artifact_points_at_source() {
        let a = PageArtifact::whole_document("/data/paper.pdf", BackendKind::Rendering);
        assert_eq!(a.path(), Path::new("/data/paper.pdf"));
        assert_eq!(a.page_num(), None);
    }
}
