//! Configuration types for PDF-to-HTML conversion.
//!
//! All conversion behaviour is controlled through [`ConversionConfig`], built
//! via its [`ConversionConfigBuilder`]. The config is immutable once built and
//! is passed explicitly into every stage; nothing reads options from globals.

use crate::error::Pdf2HtmlError;
use crate::progress::ProgressCallback;
use edgequake_llm::LLMProvider;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Configuration for a PDF-to-HTML conversion.
///
/// # Example
/// ```rust
/// use edgequake_pdf2html::{ConversionConfig, ConversionMode};
///
/// let config = ConversionConfig::builder()
///     .output_dir("out")
///     .mode(ConversionMode::PerPage)
///     .max_workers(3)
///     .requests_per_window(10)
///     .build()
///     .unwrap();
/// ```
#[derive(Clone)]
pub struct ConversionConfig {
    /// Directory receiving page and document HTML. Default: `output_html`.
    pub output_dir: PathBuf,

    /// Root directory of extracted images and their `{stem}_manifest.json`.
    /// Default: `extracted_images`.
    pub images_dir: PathBuf,

    /// Where transient single-page PDFs are written. `None` uses the system
    /// temp directory.
    pub scratch_dir: Option<PathBuf>,

    /// Whole-document vs. per-page generation. Default: `Auto { page_threshold: 20 }`.
    pub mode: ConversionMode,

    /// Worker pool size for per-page mode. Default: 3.
    ///
    /// Workers spend most of their time parked on the rate limiter, so raising
    /// this beyond `requests_per_window` buys nothing.
    pub max_workers: usize,

    /// Generation calls admitted per rate window. Default: 10.
    pub requests_per_window: usize,

    /// Length of the sliding rate window in seconds. Default: 60.
    pub rate_window_secs: u64,

    /// Per-generation-call timeout in seconds. Default: 300.
    ///
    /// An expired call marks the page failed; the worker moves on.
    pub api_timeout_secs: u64,

    /// Regenerate artifacts even when they are newer than the source PDF.
    pub force: bool,

    /// How failed pages appear in the assembled document. Default: placeholder.
    pub failed_pages: FailedPagePolicy,

    /// Separator between pages in the assembled document. Default: none.
    pub page_separator: PageSeparator,

    /// Rendering DPI when rasterising a page artifact for the VLM. Range 72–400. Default: 150.
    pub dpi: u32,

    /// Maximum rendered image dimension in pixels. Default: 2000.
    pub max_rendered_pixels: u32,

    /// LLM model identifier. If None, uses provider default.
    pub model: Option<String>,

    /// LLM provider name (e.g. "openai", "gemini").
    pub provider_name: Option<String>,

    /// Pre-constructed LLM provider. Takes precedence over `provider_name`.
    pub provider: Option<Arc<dyn LLMProvider>>,

    /// Sampling temperature. Default: 0.1.
    pub temperature: f32,

    /// Maximum output tokens per generation call. Default: 8192.
    ///
    /// HTML is more verbose than Markdown; a dense page easily exceeds 4K.
    pub max_tokens: usize,

    /// Custom system prompt. If None, uses the built-in default.
    pub system_prompt: Option<String>,

    /// PDF user password for encrypted documents.
    pub password: Option<String>,

    /// Additional formats produced from the final HTML.
    pub formats: Vec<OutputFormat>,

    /// Metadata and pandoc knobs for [`Self::formats`].
    pub format_options: FormatOptions,

    /// Optional progress callback.
    pub progress_callback: Option<ProgressCallback>,
}

impl Default for ConversionConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("output_html"),
            images_dir: PathBuf::from("extracted_images"),
            scratch_dir: None,
            mode: ConversionMode::default(),
            max_workers: 3,
            requests_per_window: 10,
            rate_window_secs: 60,
            api_timeout_secs: 300,
            force: false,
            failed_pages: FailedPagePolicy::default(),
            page_separator: PageSeparator::default(),
            dpi: 150,
            max_rendered_pixels: 2000,
            model: None,
            provider_name: None,
            provider: None,
            temperature: 0.1,
            max_tokens: 8192,
            system_prompt: None,
            password: None,
            formats: Vec::new(),
            format_options: FormatOptions::default(),
            progress_callback: None,
        }
    }
}

impl fmt::Debug for ConversionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConversionConfig")
            .field("output_dir", &self.output_dir)
            .field("images_dir", &self.images_dir)
            .field("mode", &self.mode)
            .field("max_workers", &self.max_workers)
            .field("requests_per_window", &self.requests_per_window)
            .field("rate_window_secs", &self.rate_window_secs)
            .field("api_timeout_secs", &self.api_timeout_secs)
            .field("force", &self.force)
            .field("failed_pages", &self.failed_pages)
            .field("model", &self.model)
            .field("provider_name", &self.provider_name)
            .field("provider", &self.provider.as_ref().map(|_| "<dyn LLMProvider>"))
            .field("formats", &self.formats)
            .field(
                "progress_callback",
                &self.progress_callback.as_ref().map(|_| "<callback>"),
            )
            .finish()
    }
}

impl ConversionConfig {
    /// Create a new builder for `ConversionConfig`.
    pub fn builder() -> ConversionConfigBuilder {
        ConversionConfigBuilder {
            config: Self::default(),
        }
    }

    pub fn rate_window(&self) -> Duration {
        Duration::from_secs(self.rate_window_secs)
    }

    pub fn api_timeout(&self) -> Duration {
        Duration::from_secs(self.api_timeout_secs)
    }

    /// Where the manifest for `stem` is expected.
    pub fn manifest_path(&self, stem: &str) -> PathBuf {
        self.images_dir.join(format!("{stem}_manifest.json"))
    }

    /// Deterministic page artifact path: `{output_dir}/{stem}_page_{n}.html`.
    pub fn page_output_path(&self, stem: &str, page_num: usize) -> PathBuf {
        self.output_dir.join(format!("{stem}_page_{page_num}.html"))
    }

    /// Deterministic document artifact path: `{output_dir}/{stem}.html`.
    pub fn document_output_path(&self, stem: &str) -> PathBuf {
        self.output_dir.join(format!("{stem}.html"))
    }

    /// Scratch directory for transient page artifacts.
    pub fn scratch_root(&self) -> PathBuf {
        self.scratch_dir
            .clone()
            .unwrap_or_else(std::env::temp_dir)
    }
}

/// Builder for [`ConversionConfig`].
#[derive(Debug)]
pub struct ConversionConfigBuilder {
    config: ConversionConfig,
}

impl ConversionConfigBuilder {
    pub fn output_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.config.output_dir = dir.as_ref().to_path_buf();
        self
    }

    pub fn images_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.config.images_dir = dir.as_ref().to_path_buf();
        self
    }

    pub fn scratch_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.config.scratch_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    pub fn mode(mut self, mode: ConversionMode) -> Self {
        self.config.mode = mode;
        self
    }

    pub fn max_workers(mut self, n: usize) -> Self {
        self.config.max_workers = n.max(1);
        self
    }

    pub fn requests_per_window(mut self, n: usize) -> Self {
        self.config.requests_per_window = n.max(1);
        self
    }

    pub fn rate_window_secs(mut self, secs: u64) -> Self {
        self.config.rate_window_secs = secs;
        self
    }

    pub fn api_timeout_secs(mut self, secs: u64) -> Self {
        self.config.api_timeout_secs = secs;
        self
    }

    pub fn force(mut self, v: bool) -> Self {
        self.config.force = v;
        self
    }

    pub fn failed_pages(mut self, policy: FailedPagePolicy) -> Self {
        self.config.failed_pages = policy;
        self
    }

    pub fn page_separator(mut self, sep: PageSeparator) -> Self {
        self.config.page_separator = sep;
        self
    }

    pub fn dpi(mut self, dpi: u32) -> Self {
        self.config.dpi = dpi.clamp(72, 400);
        self
    }

    pub fn max_rendered_pixels(mut self, px: u32) -> Self {
        self.config.max_rendered_pixels = px.max(100);
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.model = Some(model.into());
        self
    }

    pub fn provider_name(mut self, name: impl Into<String>) -> Self {
        self.config.provider_name = Some(name.into());
        self
    }

    pub fn provider(mut self, provider: Arc<dyn LLMProvider>) -> Self {
        self.config.provider = Some(provider);
        self
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.config.temperature = t.clamp(0.0, 2.0);
        self
    }

    pub fn max_tokens(mut self, n: usize) -> Self {
        self.config.max_tokens = n;
        self
    }

    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.config.system_prompt = Some(prompt.into());
        self
    }

    pub fn password(mut self, pwd: impl Into<String>) -> Self {
        self.config.password = Some(pwd.into());
        self
    }

    pub fn formats(mut self, formats: Vec<OutputFormat>) -> Self {
        self.config.formats = formats;
        self
    }

    pub fn format_options(mut self, opts: FormatOptions) -> Self {
        self.config.format_options = opts;
        self
    }

    pub fn progress_callback(mut self, cb: ProgressCallback) -> Self {
        self.config.progress_callback = Some(cb);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<ConversionConfig, Pdf2HtmlError> {
        let c = &self.config;
        if c.max_workers == 0 {
            return Err(Pdf2HtmlError::InvalidConfig(
                "max_workers must be ≥ 1".into(),
            ));
        }
        if c.requests_per_window == 0 {
            return Err(Pdf2HtmlError::InvalidConfig(
                "requests_per_window must be ≥ 1".into(),
            ));
        }
        if c.rate_window_secs == 0 {
            return Err(Pdf2HtmlError::InvalidConfig(
                "rate_window_secs must be ≥ 1".into(),
            ));
        }
        if c.api_timeout_secs == 0 {
            return Err(Pdf2HtmlError::InvalidConfig(
                "api_timeout_secs must be ≥ 1".into(),
            ));
        }
        if let ConversionMode::Auto { page_threshold: 0 } = c.mode {
            return Err(Pdf2HtmlError::InvalidConfig(
                "page_threshold must be ≥ 1".into(),
            ));
        }
        if c.output_dir.as_os_str().is_empty() {
            return Err(Pdf2HtmlError::InvalidConfig(
                "output_dir must not be empty".into(),
            ));
        }
        Ok(self.config)
    }
}

// ── Enums ────────────────────────────────────────────────────────────────

/// Whether a document is generated in one call or page by page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConversionMode {
    /// One generation call covering the whole document.
    WholeDocument,
    /// One generation call per page through the worker pool.
    PerPage,
    /// Per-page when the document has more than `page_threshold` pages.
    Auto { page_threshold: usize },
}

impl Default for ConversionMode {
    fn default() -> Self {
        ConversionMode::Auto { page_threshold: 20 }
    }
}

impl ConversionMode {
    /// Whether a document of `page_count` pages runs through the page pipeline.
    pub fn is_per_page(&self, page_count: usize) -> bool {
        match self {
            ConversionMode::WholeDocument => false,
            ConversionMode::PerPage => true,
            ConversionMode::Auto { page_threshold } => page_count > *page_threshold,
        }
    }
}

/// How a failed page is represented in the assembled document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FailedPagePolicy {
    /// A visible error block where the page would have been. (default)
    #[default]
    Placeholder,
    /// Left out of the body; an HTML comment records the failure.
    Omit,
}

/// How to separate pages in the assembled HTML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub enum PageSeparator {
    /// Nothing between page sections. (default)
    #[default]
    None,
    /// `<hr/>` between pages.
    HorizontalRule,
    /// A print page break.
    PageBreak,
    /// HTML comment with the page number: `<!-- page N -->`.
    Comment,
    /// Custom markup inserted between pages.
    Custom(String),
}

impl PageSeparator {
    /// Render the separator placed before page `page_num` (1-indexed).
    pub fn render(&self, page_num: usize) -> String {
        match self {
            PageSeparator::None => "\n".to_string(),
            PageSeparator::HorizontalRule => "\n<hr/>\n".to_string(),
            PageSeparator::PageBreak => {
                "\n<div class=\"page-break\" style=\"page-break-after: always; break-after: page;\"></div>\n"
                    .to_string()
            }
            PageSeparator::Comment => format!("\n<!-- page {} -->\n", page_num),
            PageSeparator::Custom(s) => format!("\n{}\n", s),
        }
    }
}

/// Formats producible from the final HTML.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Docx,
    Epub,
}

impl OutputFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            OutputFormat::Docx => "docx",
            OutputFormat::Epub => "epub",
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

impl std::str::FromStr for OutputFormat {
    type Err = Pdf2HtmlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "docx" => Ok(OutputFormat::Docx),
            "epub" => Ok(OutputFormat::Epub),
            other => Err(Pdf2HtmlError::InvalidConfig(format!(
                "unknown output format '{other}' (expected docx or epub)"
            ))),
        }
    }
}

/// How math is carried into EPUB output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum EpubMath {
    /// Native MathML. (default)
    #[default]
    MathMl,
    /// Rendered images via pandoc's `--webtex`.
    Images,
    /// MathJax script references.
    MathJax,
}

/// Options for the DOCX/EPUB converter.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FormatOptions {
    /// Title metadata. Falls back to the document stem.
    pub title: Option<String>,
    pub author: Option<String>,
    pub epub_math: EpubMath,
    /// Cover image for EPUB output.
    pub cover: Option<PathBuf>,
    /// Reference DOCX carrying right-to-left styles.
    pub reference_doc: Option<PathBuf>,
}
