//! Derived formats: DOCX and EPUB from the final HTML, via pandoc.
//!
//! ## Why stage into a temp directory?
//!
//! Pages reference figures by paths relative to the output directory, and
//! pandoc resolves resources relative to `--resource-path`. Copying the HTML
//! and every local image it references into one `TempDir` gives pandoc a
//! self-contained input, and the directory disappears when conversion ends.
//!
//! ## Right-to-left documents
//!
//! When the document is right-to-left (declared, or Arabic script detected),
//! the staged HTML gets `dir="rtl"` attributes and a small stylesheet, EPUB
//! output gets `page-progression-direction=rtl` plus an `rtl.css`, and DOCX
//! output picks up a `reference-rtl.docx` when one is found.

use crate::config::{EpubMath, FormatOptions, OutputFormat};
use crate::error::Pdf2HtmlError;
use crate::pipeline::lang::{self, Direction};
use futures::future::BoxFuture;
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use std::collections::HashMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Document metadata handed to a converter.
#[derive(Debug, Clone, Default)]
pub struct FormatMetadata {
    pub title: String,
    pub author: Option<String>,
    pub language: Option<String>,
    pub direction: Option<Direction>,
}

impl FormatMetadata {
    /// Whether the document reads right-to-left.
    pub fn is_rtl(&self) -> bool {
        self.direction == Some(Direction::Rtl)
            || self.language.as_deref().is_some_and(lang::is_rtl_lang)
    }
}

/// Produces a derived document format from HTML.
pub trait FormatConverter: Send + Sync {
    fn convert<'a>(
        &'a self,
        markup_path: &'a Path,
        output_path: &'a Path,
        format: OutputFormat,
        metadata: &'a FormatMetadata,
    ) -> BoxFuture<'a, Result<(), Pdf2HtmlError>>;
}

/// Shells out to `pandoc`.
#[derive(Debug, Clone)]
pub struct PandocConverter {
    program: PathBuf,
    options: FormatOptions,
}

impl PandocConverter {
    pub fn new(options: FormatOptions) -> Self {
        Self {
            program: PathBuf::from("pandoc"),
            options,
        }
    }

    /// Use a specific pandoc binary.
    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = program.into();
        self
    }

    async fn ensure_available(&self) -> Result<(), Pdf2HtmlError> {
        let unavailable = || Pdf2HtmlError::ConverterUnavailable {
            tool: self.program.display().to_string(),
        };
        let out = Command::new(&self.program)
            .arg("--version")
            .output()
            .await
            .map_err(|_| unavailable())?;
        if !out.status.success() {
            return Err(unavailable());
        }
        debug!(
            "Using {}",
            String::from_utf8_lossy(&out.stdout).lines().next().unwrap_or("pandoc")
        );
        Ok(())
    }

    async fn run(
        &self,
        markup_path: &Path,
        output_path: &Path,
        format: OutputFormat,
        metadata: &FormatMetadata,
    ) -> Result<(), Pdf2HtmlError> {
        let failed = |detail: String| Pdf2HtmlError::FormatConversionFailed {
            input: markup_path.to_path_buf(),
            format: format.to_string(),
            detail,
        };

        self.ensure_available().await?;

        let html = tokio::fs::read_to_string(markup_path)
            .await
            .map_err(|e| failed(format!("cannot read input: {e}")))?;

        let workdir = tempfile::Builder::new()
            .prefix("html_convert_")
            .tempdir()
            .map_err(|e| failed(format!("cannot create staging directory: {e}")))?;

        let base = markup_path.parent().unwrap_or_else(|| Path::new("."));
        let staged = stage_images(&html, base, workdir.path());
        let rtl = metadata.is_rtl() || (metadata.language.is_none() && lang::contains_arabic(&html));
        let prepared = prepare_html(&staged, rtl);

        let file_name = markup_path
            .file_name()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("document.html"));
        let staged_path = workdir.path().join(file_name);
        tokio::fs::write(&staged_path, prepared)
            .await
            .map_err(|e| failed(format!("cannot stage input: {e}")))?;

        let epub_css = if rtl && format == OutputFormat::Epub {
            let css = workdir.path().join("rtl.css");
            tokio::fs::write(&css, RTL_EPUB_CSS)
                .await
                .map_err(|e| failed(format!("cannot write stylesheet: {e}")))?;
            Some(css)
        } else {
            None
        };

        let reference_doc = match format {
            OutputFormat::Docx => self.reference_doc(base, rtl),
            OutputFormat::Epub => None,
        };

        let cover = self.options.cover.as_deref().filter(|c| {
            let exists = c.exists();
            if !exists && format == OutputFormat::Epub {
                warn!("Cover image {} not found; continuing without cover", c.display());
            }
            exists
        });

        if let Some(parent) = output_path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await.map_err(|e| {
                    Pdf2HtmlError::OutputWriteFailed {
                        path: output_path.to_path_buf(),
                        source: e,
                    }
                })?;
            }
        }

        let args = pandoc_args(&PandocInvocation {
            input: &staged_path,
            output: output_path,
            format,
            metadata,
            rtl,
            epub_math: self.options.epub_math,
            cover,
            epub_css: epub_css.as_deref(),
            reference_doc: reference_doc.as_deref(),
        });
        debug!("Running {} {:?}", self.program.display(), args);

        let out = Command::new(&self.program)
            .args(&args)
            .output()
            .await
            .map_err(|e| failed(e.to_string()))?;
        if !out.status.success() {
            return Err(failed(format!(
                "{}: {}",
                out.status,
                String::from_utf8_lossy(&out.stderr).trim()
            )));
        }

        info!("Wrote {}", output_path.display());
        Ok(())
    }

    /// The configured reference DOCX, else a `reference-rtl.docx` next to the
    /// input or in the working directory for right-to-left documents.
    fn reference_doc(&self, base: &Path, rtl: bool) -> Option<PathBuf> {
        if let Some(configured) = &self.options.reference_doc {
            if configured.exists() {
                return Some(configured.clone());
            }
            warn!("Reference document {} not found", configured.display());
        }
        if !rtl {
            return None;
        }
        [base.join("reference-rtl.docx"), PathBuf::from("reference-rtl.docx")]
            .into_iter()
            .find(|c| c.exists())
    }
}

impl FormatConverter for PandocConverter {
    fn convert<'a>(
        &'a self,
        markup_path: &'a Path,
        output_path: &'a Path,
        format: OutputFormat,
        metadata: &'a FormatMetadata,
    ) -> BoxFuture<'a, Result<(), Pdf2HtmlError>> {
        Box::pin(self.run(markup_path, output_path, format, metadata))
    }
}

// ── Staging ──────────────────────────────────────────────────────────────

static RE_IMG_SRC: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)(<img\b[^>]*?\bsrc\s*=\s*)(?:"([^"]*)"|'([^']*)')"#).unwrap()
});

/// Copy every local image `html` references into `workdir` and point the
/// `src` attributes at the copies. Missing files and remote or inline
/// sources are left as they are.
fn stage_images(html: &str, base: &Path, workdir: &Path) -> String {
    let mut copied: HashMap<String, String> = HashMap::new();

    RE_IMG_SRC
        .replace_all(html, |caps: &Captures<'_>| {
            let prefix = &caps[1];
            let src = caps
                .get(2)
                .or_else(|| caps.get(3))
                .map(|m| m.as_str())
                .unwrap_or("");
            let keep = || caps[0].to_string();

            if src.starts_with("data:") || src.contains("://") || src.is_empty() {
                return keep();
            }
            if let Some(name) = copied.get(src) {
                return format!("{prefix}\"{name}\"");
            }

            let decoded = src.replace("&amp;", "&");
            let source = if Path::new(&decoded).is_absolute() {
                PathBuf::from(&decoded)
            } else {
                base.join(&decoded)
            };
            if !source.is_file() {
                warn!("Referenced image not found: {}", src);
                return keep();
            }

            let dest = unique_dest(workdir, &source);
            match std::fs::copy(&source, &dest) {
                Ok(_) => {
                    let name = dest
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_default();
                    copied.insert(src.to_string(), name.clone());
                    format!("{prefix}\"{name}\"")
                }
                Err(e) => {
                    warn!("Could not stage image {}: {}", source.display(), e);
                    keep()
                }
            }
        })
        .into_owned()
}

fn unique_dest(workdir: &Path, source: &Path) -> PathBuf {
    let name = source
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "image".to_string());
    let mut dest = workdir.join(&name);
    let stem = Path::new(&name)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let ext = Path::new(&name)
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    let mut counter = 1;
    while dest.exists() {
        dest = workdir.join(format!("{stem}_{counter}{ext}"));
        counter += 1;
    }
    dest
}

const RTL_STYLE: &str = "<style>body{direction:rtl;unicode-bidi:embed;text-align:right;} img{max-width:100%;height:auto;}</style>";

const RTL_EPUB_CSS: &str = "html, body, p, div, li, span {direction: rtl !important; unicode-bidi: embed !important; text-align: right !important;}\nimg{max-width:100%;height:auto;}\n";

static RE_HEAD_OPEN: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)<head\b[^>]*>").unwrap());
static RE_HTML_OPEN: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)<html\b([^>]*)>").unwrap());
static RE_BODY_OPEN: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)<body\b([^>]*)>").unwrap());
static RE_DIR: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bdir\s*=").unwrap());
static RE_LANG: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\blang\s*=").unwrap());

/// Ensure a charset declaration and, for RTL documents, direction attributes
/// on `<html>`/`<body>` plus a small stylesheet.
fn prepare_html(html: &str, rtl: bool) -> String {
    let mut s = html.to_string();

    if !s.to_ascii_lowercase().contains("<meta charset") {
        s = match RE_HEAD_OPEN.find(&s) {
            Some(m) => format!("{}\n<meta charset=\"utf-8\">{}", &s[..m.end()], &s[m.end()..]),
            None => format!("<meta charset=\"utf-8\">\n{s}"),
        };
    }

    if !rtl {
        return s;
    }

    s = match RE_HTML_OPEN.captures(&s) {
        Some(c) if !RE_DIR.is_match(&c[1]) => {
            let attrs = &c[1];
            let lang = if RE_LANG.is_match(attrs) { "" } else { " lang=\"ar\"" };
            let range = c.get(0).map(|m| m.range()).unwrap_or(0..0);
            format!(
                "{}<html{attrs}{lang} dir=\"rtl\">{}",
                &s[..range.start],
                &s[range.end..]
            )
        }
        _ => s.clone(),
    };

    s = match RE_BODY_OPEN.captures(&s) {
        Some(c) if !RE_DIR.is_match(&c[1]) => {
            let attrs = &c[1];
            let range = c.get(0).map(|m| m.range()).unwrap_or(0..0);
            format!("{}<body{attrs} dir=\"rtl\">{}", &s[..range.start], &s[range.end..])
        }
        _ => s.clone(),
    };

    match RE_HEAD_OPEN.find(&s) {
        Some(m) => format!("{}\n{RTL_STYLE}{}", &s[..m.end()], &s[m.end()..]),
        None => format!("{RTL_STYLE}\n{s}"),
    }
}

// ── Arguments ────────────────────────────────────────────────────────────

struct PandocInvocation<'a> {
    input: &'a Path,
    output: &'a Path,
    format: OutputFormat,
    metadata: &'a FormatMetadata,
    rtl: bool,
    epub_math: EpubMath,
    cover: Option<&'a Path>,
    epub_css: Option<&'a Path>,
    reference_doc: Option<&'a Path>,
}

fn pandoc_args(inv: &PandocInvocation<'_>) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec![
        inv.input.into(),
        "-o".into(),
        inv.output.into(),
        "--from=html+tex_math_dollars".into(),
        "--resource-path".into(),
        inv.input.parent().unwrap_or_else(|| Path::new(".")).into(),
    ];
    let mut meta = |kv: String| {
        args.push("--metadata".into());
        args.push(kv.into());
    };

    if let Some(lang) = &inv.metadata.language {
        meta(format!("lang={lang}"));
    }
    if inv.rtl {
        meta("dir=rtl".to_string());
    }
    if !inv.metadata.title.is_empty() {
        meta(format!("title={}", inv.metadata.title));
    }
    if let Some(author) = &inv.metadata.author {
        meta(format!("author={author}"));
    }

    match inv.format {
        OutputFormat::Epub => {
            if let Some(cover) = inv.cover {
                args.push("--epub-cover-image".into());
                args.push(cover.into());
            }
            args.push("--toc".into());
            let math = match inv.epub_math {
                EpubMath::MathMl => "--mathml",
                EpubMath::Images => "--webtex",
                EpubMath::MathJax => "--mathjax",
            };
            args.push(math.into());
            args.push("--to=epub3".into());
            if inv.rtl {
                args.push("--metadata".into());
                args.push("page-progression-direction=rtl".into());
            }
            if let Some(css) = inv.epub_css {
                args.push("--css".into());
                args.push(css.into());
            }
        }
        OutputFormat::Docx => {
            args.push("--to=docx".into());
            if let Some(reference) = inv.reference_doc {
                args.push("--reference-doc".into());
                args.push(reference.into());
            }
        }
    }
    args
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(lang: Option<&str>) -> FormatMetadata {
        FormatMetadata {
            title: "Report".into(),
            author: Some("Team".into()),
            language: lang.map(str::to_string),
            direction: None,
        }
    }

    fn has_pair(args: &[OsString], flag: &str, value: &str) -> bool {
        args.windows(2).any(|w| w[0] == flag && w[1] == value)
    }

    #[test]
    fn epub_args_for_rtl_document() {
        let m = meta(Some("ar"));
        let args = pandoc_args(&PandocInvocation {
            input: Path::new("/tmp/w/doc.html"),
            output: Path::new("out/doc.epub"),
            format: OutputFormat::Epub,
            metadata: &m,
            rtl: m.is_rtl(),
            epub_math: EpubMath::MathMl,
            cover: None,
            epub_css: Some(Path::new("/tmp/w/rtl.css")),
            reference_doc: None,
        });
        assert!(args.iter().any(|a| a == "--from=html+tex_math_dollars"));
        assert!(has_pair(&args, "--resource-path", "/tmp/w"));
        assert!(has_pair(&args, "--metadata", "lang=ar"));
        assert!(has_pair(&args, "--metadata", "dir=rtl"));
        assert!(has_pair(&args, "--metadata", "page-progression-direction=rtl"));
        assert!(has_pair(&args, "--css", "/tmp/w/rtl.css"));
        assert!(args.iter().any(|a| a == "--mathml"));
        assert!(args.iter().any(|a| a == "--to=epub3"));
        assert!(args.iter().any(|a| a == "--toc"));
    }

    #[test]
    fn docx_args_for_ltr_document() {
        let m = meta(Some("en"));
        let args = pandoc_args(&PandocInvocation {
            input: Path::new("w/doc.html"),
            output: Path::new("out/doc.docx"),
            format: OutputFormat::Docx,
            metadata: &m,
            rtl: m.is_rtl(),
            epub_math: EpubMath::Images,
            cover: None,
            epub_css: None,
            reference_doc: Some(Path::new("ref.docx")),
        });
        assert!(!args.iter().any(|a| a == "dir=rtl"));
        assert!(!args.iter().any(|a| a == "--toc"));
        assert!(has_pair(&args, "--reference-doc", "ref.docx"));
        assert!(has_pair(&args, "--metadata", "title=Report"));
        assert!(has_pair(&args, "--metadata", "author=Team"));
    }

    #[test]
    fn prepare_adds_charset_and_rtl_attributes() {
        let out = prepare_html("<html><head><title>t</title></head><body><p>نص</p></body></html>", true);
        assert!(out.contains("<meta charset=\"utf-8\">"));
        assert!(out.contains("<html lang=\"ar\" dir=\"rtl\">"));
        assert!(out.contains("<body dir=\"rtl\">"));
        assert!(out.contains("direction:rtl"));
    }

    #[test]
    fn prepare_keeps_declared_direction() {
        let html = "<html lang=\"he\" dir=\"rtl\"><head><meta charset=\"utf-8\"></head><body dir=\"rtl\"></body></html>";
        let out = prepare_html(html, true);
        assert_eq!(out.matches("dir=\"rtl\"").count(), 2);
        assert!(!out.contains("lang=\"ar\""));
    }

    #[test]
    fn prepare_leaves_ltr_markup_alone() {
        let html = "<html><head><meta charset=\"utf-8\"></head><body></body></html>";
        assert_eq!(prepare_html(html, false), html);
    }

    #[test]
    fn staging_copies_local_images_and_rewrites_src() {
        let src_dir = tempfile::tempdir().unwrap();
        let work = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(src_dir.path().join("imgs/a")).unwrap();
        std::fs::create_dir_all(src_dir.path().join("imgs/b")).unwrap();
        std::fs::write(src_dir.path().join("imgs/a/fig.png"), b"png-a").unwrap();
        std::fs::write(src_dir.path().join("imgs/b/fig.png"), b"png-b").unwrap();

        let html = r#"<img src="imgs/a/fig.png"/><img src='imgs/b/fig.png'/><img src="https://x.org/y.png"/><img src="missing.png"/>"#;
        let out = stage_images(html, src_dir.path(), work.path());

        assert!(out.contains(r#"<img src="fig.png"/>"#), "got: {out}");
        assert!(out.contains(r#"<img src="fig_1.png"/>"#), "got: {out}");
        assert!(out.contains("https://x.org/y.png"));
        assert!(out.contains("missing.png"));
        assert_eq!(std::fs::read(work.path().join("fig_1.png")).unwrap(), b"png-b");
    }

    #[tokio::test]
    async fn missing_pandoc_is_reported_as_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let html = dir.path().join("doc.html");
        std::fs::write(&html, "<html></html>").unwrap();
        let converter =
            PandocConverter::new(FormatOptions::default()).with_program("/nonexistent/pandoc-bin");
        let err = converter
            .convert(&html, &dir.path().join("doc.docx"), OutputFormat::Docx, &meta(None))
            .await
            .unwrap_err();
        assert!(matches!(err, Pdf2HtmlError::ConverterUnavailable { .. }));
    }
}
