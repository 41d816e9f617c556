//! Input resolution: turn a user-supplied path into the PDFs to convert.
//!
//! A path is either one PDF or a folder whose `*.pdf` entries form a batch.
//! Existence and read permission are checked up front so the caller gets a
//! meaningful error instead of a reader failure. Whether the bytes are a
//! usable PDF is left to [`crate::pipeline::reader`], which tolerates junk
//! before the `%PDF` header.

use crate::error::Pdf2HtmlError;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Resolve `input` to a sorted list of PDF paths.
///
/// A file resolves to itself; a directory to its `*.pdf` entries (not
/// recursive), sorted by file name.
pub fn resolve_inputs(input: &Path) -> Result<Vec<PathBuf>, Pdf2HtmlError> {
    if input.is_dir() {
        discover_documents(input)
    } else {
        resolve_document(input).map(|p| vec![p])
    }
}

/// Validate a single local document path.
pub fn resolve_document(path: &Path) -> Result<PathBuf, Pdf2HtmlError> {
    if !path.exists() {
        return Err(Pdf2HtmlError::FileNotFound {
            path: path.to_path_buf(),
        });
    }

    match std::fs::File::open(path) {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
            return Err(Pdf2HtmlError::PermissionDenied {
                path: path.to_path_buf(),
            });
        }
        Err(_) => {
            return Err(Pdf2HtmlError::FileNotFound {
                path: path.to_path_buf(),
            });
        }
    }

    debug!("Resolved local PDF: {}", path.display());
    Ok(path.to_path_buf())
}

/// List the `*.pdf` files (case-insensitive extension) directly in `dir`.
pub fn discover_documents(dir: &Path) -> Result<Vec<PathBuf>, Pdf2HtmlError> {
    let entries = std::fs::read_dir(dir).map_err(|e| match e.kind() {
        std::io::ErrorKind::PermissionDenied => Pdf2HtmlError::PermissionDenied {
            path: dir.to_path_buf(),
        },
        _ => Pdf2HtmlError::FileNotFound {
            path: dir.to_path_buf(),
        },
    })?;

    let mut docs: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|p| p.is_file() && is_pdf_name(p))
        .collect();
    docs.sort();

    if docs.is_empty() {
        return Err(Pdf2HtmlError::NoDocumentsFound {
            path: dir.to_path_buf(),
        });
    }
    debug!("Found {} PDF(s) in {}", docs.len(), dir.display());
    Ok(docs)
}

fn is_pdf_name(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("pdf"))
}

/// Artifact stem of a document: the file name without its extension.
pub fn document_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "document".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn folder_lists_pdfs_sorted() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["b.pdf", "a.PDF", "notes.txt", "c.pdf.bak"] {
            std::fs::write(dir.path().join(name), b"%PDF-1.4").unwrap();
        }
        std::fs::create_dir(dir.path().join("nested.pdf")).unwrap();

        let docs = resolve_inputs(dir.path()).unwrap();
        let names: Vec<_> = docs
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["a.PDF", "b.pdf"]);
    }

    #[test]
    fn empty_folder_is_no_documents() {
        let dir = tempfile::tempdir().unwrap();
        let err = resolve_inputs(dir.path()).unwrap_err();
        assert!(matches!(err, Pdf2HtmlError::NoDocumentsFound { .. }));
    }

    #[test]
    fn missing_file_is_not_found() {
        let err = resolve_inputs(Path::new("/definitely/not/here.pdf")).unwrap_err();
        assert!(matches!(err, Pdf2HtmlError::FileNotFound { .. }));
    }

    #[test]
    fn stem_drops_extension() {
        assert_eq!(document_stem(Path::new("in/Annual Report.pdf")), "Annual Report");
    }
}
