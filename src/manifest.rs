//! Image manifest: the out-of-band record of figures extracted from a PDF.
//!
//! An external figure-detection stage writes `{stem}_manifest.json` next to
//! the cropped images before (or independently of) page generation. This
//! module reads it into typed records and validates each entry. The pipeline
//! only ever reads a [`Manifest`]; it never writes one back.
//!
//! ## Validation
//!
//! Entries are parsed leniently (every field optional) and then checked.
//! Every repair and every drop is logged with `warn!`:
//!
//! - an image without `path` and without `filename` cannot be embedded and is
//!   dropped;
//! - a missing `path` is derived from `filename` relative to the manifest
//!   directory, a missing `filename` from `path`;
//! - a missing `id` is derived from the filename stem;
//! - a page without `page_num` is dropped.
//!
//! `description` is optional; an absent one is empty, not derived.
//!
//! A missing manifest file is not an error: it means "no images".

use crate::error::Pdf2HtmlError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// One extracted figure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageRegion {
    /// Stable identifier, unique within its page.
    pub id: String,
    pub filename: String,
    /// Location of the image bytes.
    pub path: PathBuf,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
    /// Page the region was cropped from (1-indexed).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coords_normalized: Option<[f32; 4]>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coords_pixels: Option<[u32; 4]>,
}

impl ImageRegion {
    /// File stem of the region's image (`doc_page_003_fig_1` for
    /// `doc_page_003_fig_1.png`).
    pub fn filename_stem(&self) -> Option<&str> {
        Path::new(&self.filename)
            .file_stem()
            .or_else(|| self.path.file_stem())
            .and_then(|s| s.to_str())
    }
}

/// Images belonging to one page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestPage {
    pub page_num: usize,
    pub images: Vec<ImageRegion>,
}

/// Validated manifest for one document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pdf_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pdf_stem: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_pages: Option<usize>,
    /// Pages in ascending `page_num` order.
    pub pages: Vec<ManifestPage>,
}

impl Manifest {
    /// A manifest with no images.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.iter().all(|p| p.images.is_empty())
    }

    pub fn total_images(&self) -> usize {
        self.pages.iter().map(|p| p.images.len()).sum()
    }

    /// Images of one page in manifest order; empty when the page has none.
    pub fn page_images(&self, page_num: usize) -> &[ImageRegion] {
        self.pages
            .iter()
            .find(|p| p.page_num == page_num)
            .map(|p| p.images.as_slice())
            .unwrap_or(&[])
    }

    /// Every image in page order, then manifest order within the page.
    pub fn all_images(&self) -> impl Iterator<Item = &ImageRegion> {
        self.pages.iter().flat_map(|p| p.images.iter())
    }

    /// Ids of one page, used to tell the generator what it may reference.
    pub fn page_ids(&self, page_num: usize) -> Vec<&str> {
        self.page_images(page_num)
            .iter()
            .map(|r| r.id.as_str())
            .collect()
    }

    /// Read and validate `path`.
    ///
    /// Returns `Ok(Manifest::empty())` when the file does not exist.
    pub fn load(path: &Path) -> Result<Self, Pdf2HtmlError> {
        let text = match std::fs::read_to_string(path) {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No manifest at {}; no images to embed", path.display());
                return Ok(Self::empty());
            }
            Err(e) => {
                return Err(Pdf2HtmlError::ManifestInvalid {
                    path: path.to_path_buf(),
                    detail: e.to_string(),
                })
            }
        };
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        Self::from_json(&text, base).map_err(|detail| Pdf2HtmlError::ManifestInvalid {
            path: path.to_path_buf(),
            detail,
        })
    }

    /// Parse manifest JSON; relative image paths are resolved against `base`.
    pub fn from_json(text: &str, base: &Path) -> Result<Self, String> {
        let (manifest, notes) = Self::parse(text, base)?;
        for note in &notes {
            warn!("Manifest: {}", note);
        }
        Ok(manifest)
    }

    /// Like [`Manifest::from_json`], returning the validation notes instead
    /// of logging them.
    fn parse(text: &str, base: &Path) -> Result<(Self, Vec<String>), String> {
        let raw: RawManifest = serde_json::from_str(text).map_err(|e| e.to_string())?;
        let mut notes = Vec::new();
        let manifest = raw.validate(base, &mut notes);
        Ok((manifest, notes))
    }
}

// ── Wire format ──────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct RawManifest {
    pdf_name: Option<String>,
    pdf_stem: Option<String>,
    num_pages: Option<usize>,
    #[serde(default)]
    pages: Vec<RawPage>,
}

#[derive(Debug, Deserialize)]
struct RawPage {
    page_num: Option<usize>,
    #[serde(default)]
    images: Vec<RawImage>,
}

#[derive(Debug, Deserialize)]
struct RawImage {
    id: Option<String>,
    filename: Option<String>,
    path: Option<PathBuf>,
    description: Option<String>,
    #[serde(rename = "type")]
    kind: Option<String>,
    confidence: Option<f32>,
    #[serde(alias = "coords")]
    coords_normalized: Option<[f32; 4]>,
    coords_pixels: Option<[u32; 4]>,
}

impl RawManifest {
    fn validate(self, base: &Path, notes: &mut Vec<String>) -> Manifest {
        let mut pages: Vec<ManifestPage> = Vec::with_capacity(self.pages.len());

        for (idx, raw_page) in self.pages.into_iter().enumerate() {
            let Some(page_num) = raw_page.page_num else {
                notes.push(format!("page entry #{} has no page_num; skipped", idx + 1));
                continue;
            };
            let images: Vec<ImageRegion> = raw_page
                .images
                .into_iter()
                .enumerate()
                .filter_map(|(i, img)| img.validate(page_num, i + 1, base, notes))
                .collect();

            match pages.iter_mut().find(|p| p.page_num == page_num) {
                Some(existing) => existing.images.extend(images),
                None => pages.push(ManifestPage { page_num, images }),
            }
        }

        pages.sort_by_key(|p| p.page_num);

        Manifest {
            pdf_name: self.pdf_name,
            pdf_stem: self.pdf_stem,
            num_pages: self.num_pages,
            pages,
        }
    }
}

impl RawImage {
    fn validate(
        self,
        page_num: usize,
        position: usize,
        base: &Path,
        notes: &mut Vec<String>,
    ) -> Option<ImageRegion> {
        let filename = self.filename.filter(|s| !s.trim().is_empty());
        let (filename, path) = match (filename, self.path) {
            (Some(f), Some(p)) => (f, p),
            (Some(f), None) => {
                let p = base.join(&f);
                notes.push(format!(
                    "image #{} on page {} has no path; using '{}'",
                    position,
                    page_num,
                    p.display()
                ));
                (f, p)
            }
            (None, Some(p)) => {
                let Some(f) = p.file_name().map(|n| n.to_string_lossy().into_owned()) else {
                    notes.push(format!(
                        "image #{} on page {} has no filename and path '{}' names none; skipped",
                        position,
                        page_num,
                        p.display()
                    ));
                    return None;
                };
                notes.push(format!(
                    "image #{} on page {} has no filename; using '{}'",
                    position, page_num, f
                ));
                (f, p)
            }
            (None, None) => {
                notes.push(format!(
                    "image #{} on page {} has neither path nor filename; skipped",
                    position, page_num
                ));
                return None;
            }
        };

        let id = match self.id.filter(|s| !s.trim().is_empty()) {
            Some(id) => id,
            None => {
                let derived = Path::new(&filename)
                    .file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_else(|| format!("img_{position}"));
                notes.push(format!(
                    "image #{} on page {} has no id; using '{}'",
                    position, page_num, derived
                ));
                derived
            }
        };

        Some(ImageRegion {
            id,
            filename,
            path,
            description: self.description.unwrap_or_default(),
            kind: self.kind,
            confidence: self.confidence,
            page: Some(page_num),
            coords_normalized: self.coords_normalized,
            coords_pixels: self.coords_pixels,
        })
    }
}
