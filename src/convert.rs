//! Conversion entry points: one document, or a folder of documents.
//!
//! ## Document driver
//!
//! ```text
//! resolve path ─▶ open (reader chain) ─▶ load manifest ─▶ choose mode
//!      │
//!      ├─ whole document: one generation call ─▶ sanitise ─▶ resolve ─▶ {stem}.html
//!      │
//!      └─ per page: skip fresh pages ─▶ PagePipeline ─▶ assemble ─▶ {stem}.html
//!                                                                     │
//!                                                        DOCX / EPUB via pandoc
//! ```
//!
//! ## Why a ConversionContext?
//!
//! The provider, rate limiter, reader chain and format converter outlive a
//! single document: a batch shares one limiter so the provider quota holds
//! across documents. Tests inject a fake backend through the same seam.

use crate::config::{ConversionConfig, OutputFormat};
use crate::error::Pdf2HtmlError;
use crate::format::{FormatConverter, FormatMetadata, PandocConverter};
use crate::manifest::{ImageRegion, Manifest};
use crate::output::{
    BatchReport, DocumentReport, FormatOutcome, GenerationMode, PageResult, SkippedDocument,
};
use crate::pipeline::assemble::{assemble, AssemblyOptions};
use crate::pipeline::extract::{PageArtifact, PageExtractor};
use crate::pipeline::input::{document_stem, resolve_document, resolve_inputs};
use crate::pipeline::lang::{self, LanguageInfo};
use crate::pipeline::llm::{GenerationBackend, GenerationRequest, VisionBackend};
use crate::pipeline::placeholder::{unresolved_count, PlaceholderResolver};
use crate::pipeline::postprocess::clean_html;
use crate::pipeline::reader::{DocumentReader, OpenedDocument};
use crate::pipeline::render::RenderSettings;
use crate::pipeline::worker::{PageJob, PagePipeline};
use crate::pipeline::write_atomic;
use crate::progress::SerializedProgress;
use crate::prompts::{generation_instruction, DEFAULT_SYSTEM_PROMPT};
use crate::rate_limit::RateLimiter;
use edgequake_llm::{LLMProvider, ProviderFactory};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Instant, SystemTime};
use tracing::{debug, info, warn};

/// Long-lived collaborators shared by every document of a run.
#[derive(Clone)]
pub struct ConversionContext {
    backend: Arc<dyn GenerationBackend>,
    limiter: Arc<RateLimiter>,
    reader: Arc<DocumentReader>,
    converter: Arc<dyn FormatConverter>,
}

impl ConversionContext {
    /// Build the default context: the provider chosen by
    /// [`resolve_provider`], a vision backend over it, the standard reader
    /// chain and pandoc.
    pub async fn from_config(config: &ConversionConfig) -> Result<Self, Pdf2HtmlError> {
        let provider = resolve_provider(config).await?;
        info!(
            "Provider resolved (provider={}, model={})",
            config.provider_name.as_deref().unwrap_or("auto"),
            config.model.as_deref().unwrap_or("default")
        );
        let backend = VisionBackend::new(
            provider,
            config.temperature,
            config.max_tokens,
            RenderSettings {
                dpi: config.dpi,
                max_rendered_pixels: config.max_rendered_pixels,
            },
        );
        Ok(Self::new(Arc::new(backend), config))
    }

    /// A context around an explicit generation backend.
    pub fn new(backend: Arc<dyn GenerationBackend>, config: &ConversionConfig) -> Self {
        Self {
            backend,
            limiter: Arc::new(RateLimiter::new(
                config.requests_per_window,
                config.rate_window(),
            )),
            reader: Arc::new(DocumentReader::standard()),
            converter: Arc::new(PandocConverter::new(config.format_options.clone())),
        }
    }

    pub fn with_reader(mut self, reader: DocumentReader) -> Self {
        self.reader = Arc::new(reader);
        self
    }

    pub fn with_converter(mut self, converter: Arc<dyn FormatConverter>) -> Self {
        self.converter = converter;
        self
    }

    pub fn with_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.limiter = limiter;
        self
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }
}

/// Convert one PDF to HTML (and any configured derived formats).
///
/// # Returns
/// `Ok(DocumentReport)` even when some pages failed; check
/// `report.pages_failed`.
///
/// # Errors
/// Fatal errors only: unreadable document, unconfigured provider, a failed
/// whole-document generation, or an unwritable output directory.
pub async fn convert_document(
    path: impl AsRef<Path>,
    config: &ConversionConfig,
) -> Result<DocumentReport, Pdf2HtmlError> {
    let ctx = ConversionContext::from_config(config).await?;
    convert_document_with(path, config, &ctx).await
}

/// Convert every `*.pdf` in a folder (or a single file) in name order.
///
/// Documents that fail as a whole are recorded in
/// [`BatchReport::skipped`]; the batch only aborts on configuration-level
/// errors.
pub async fn convert_folder(
    input: impl AsRef<Path>,
    config: &ConversionConfig,
) -> Result<BatchReport, Pdf2HtmlError> {
    let docs = resolve_inputs(input.as_ref())?;
    let ctx = ConversionContext::from_config(config).await?;
    convert_documents_with(&docs, config, &ctx).await
}

/// Synchronous wrapper around [`convert_document`].
///
/// Creates a temporary tokio runtime internally.
pub fn convert_document_sync(
    path: impl AsRef<Path>,
    config: &ConversionConfig,
) -> Result<DocumentReport, Pdf2HtmlError> {
    tokio::runtime::Runtime::new()
        .map_err(|e| Pdf2HtmlError::Internal(format!("Failed to create tokio runtime: {}", e)))?
        .block_on(convert_document(path, config))
}

/// Batch driver over an explicit context.
pub async fn convert_folder_with(
    input: impl AsRef<Path>,
    config: &ConversionConfig,
    ctx: &ConversionContext,
) -> Result<BatchReport, Pdf2HtmlError> {
    let docs = resolve_inputs(input.as_ref())?;
    convert_documents_with(&docs, config, ctx).await
}

async fn convert_documents_with(
    docs: &[PathBuf],
    config: &ConversionConfig,
    ctx: &ConversionContext,
) -> Result<BatchReport, Pdf2HtmlError> {
    let started = Instant::now();
    let progress = SerializedProgress::new(config.progress_callback.clone());
    let mut batch = BatchReport::default();

    for (i, doc) in docs.iter().enumerate() {
        let name = doc
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        info!("[{}/{}] {}", i + 1, docs.len(), name);
        progress.emit(|cb| cb.on_document_start(&name, i + 1, docs.len()));

        match convert_document_with(doc, config, ctx).await {
            Ok(report) => batch.documents.push(report),
            Err(e) if e.is_document_scoped() => {
                warn!("Skipping {}: {}", doc.display(), e);
                let msg = e.to_string();
                progress.emit(|cb| cb.on_document_error(&name, &msg));
                batch.skipped.push(SkippedDocument {
                    source: doc.clone(),
                    error: msg,
                });
            }
            Err(e) => return Err(e),
        }
    }

    batch.elapsed_ms = started.elapsed().as_millis() as u64;
    info!(
        "Batch complete: {} converted, {} skipped, {} failed page(s), {:.1}s",
        batch.documents.len(),
        batch.skipped.len(),
        batch.pages_failed(),
        batch.elapsed_ms as f64 / 1000.0
    );
    Ok(batch)
}

/// Convert one document over an explicit context.
pub async fn convert_document_with(
    path: impl AsRef<Path>,
    config: &ConversionConfig,
    ctx: &ConversionContext,
) -> Result<DocumentReport, Pdf2HtmlError> {
    let started = Instant::now();
    let source = resolve_document(path.as_ref())?;
    let stem = document_stem(&source);
    info!("Starting conversion: {}", source.display());

    // ── Step 1: Open through the reader chain ────────────────────────────
    let opened = {
        let reader = Arc::clone(&ctx.reader);
        let src = source.clone();
        let password = config.password.clone();
        tokio::task::spawn_blocking(move || reader.open(&src, password.as_deref()))
            .await
            .map_err(|e| Pdf2HtmlError::Internal(format!("reader task panicked: {e}")))??
    };
    let page_count = opened.page_count();

    // ── Step 2: Manifest ─────────────────────────────────────────────────
    let manifest_path = config.manifest_path(&stem);
    let manifest = match Manifest::load(&manifest_path) {
        Ok(m) => m,
        Err(e) => {
            warn!("{}; continuing without images", e);
            Manifest::empty()
        }
    };
    debug!(
        "Manifest {}: {} image(s)",
        manifest_path.display(),
        manifest.total_images()
    );

    let progress = Arc::new(SerializedProgress::new(config.progress_callback.clone()));
    let source_mtime = modified(&source);
    let doc = DocumentRun {
        source: &source,
        stem: &stem,
        config,
        ctx,
        progress: &progress,
        source_mtime,
    };

    // ── Step 3: Generate ─────────────────────────────────────────────────
    let mut report = if config.mode.is_per_page(page_count) {
        doc.per_page(opened, manifest).await?
    } else {
        doc.whole_document(opened, manifest).await?
    };

    // ── Step 4: Derived formats ──────────────────────────────────────────
    if !config.formats.is_empty() {
        report.formats = derive_formats(ctx, config, &report.output_path, &stem).await;
    }

    report.elapsed_ms = started.elapsed().as_millis() as u64;
    info!("{}", report.summary_line());
    progress.emit(|cb| cb.on_conversion_complete(report.pages_total, report.pages_succeeded));
    Ok(report)
}

/// Convert the assembled HTML into every configured format.
///
/// An unreadable HTML file fails every format rather than feeding pandoc
/// empty metadata.
async fn derive_formats(
    ctx: &ConversionContext,
    config: &ConversionConfig,
    html_path: &Path,
    stem: &str,
) -> Vec<FormatOutcome> {
    let html = match tokio::fs::read_to_string(html_path).await {
        Ok(html) => html,
        Err(e) => {
            warn!(
                "Cannot read {} for format conversion: {}",
                html_path.display(),
                e
            );
            return config
                .formats
                .iter()
                .map(|&format| FormatOutcome {
                    format,
                    output_path: None,
                    error: Some(
                        Pdf2HtmlError::FormatConversionFailed {
                            input: html_path.to_path_buf(),
                            format: format.to_string(),
                            detail: format!("cannot read HTML: {e}"),
                        }
                        .to_string(),
                    ),
                })
                .collect();
        }
    };

    let detected = lang::detect(&html);
    let metadata = FormatMetadata {
        title: config
            .format_options
            .title
            .clone()
            .unwrap_or_else(|| stem.to_string()),
        author: config.format_options.author.clone(),
        language: detected.lang,
        direction: detected.dir,
    };
    let mut outcomes = Vec::with_capacity(config.formats.len());
    for &format in &config.formats {
        outcomes.push(run_format(ctx, config, html_path, stem, format, &metadata).await);
    }
    outcomes
}

async fn run_format(
    ctx: &ConversionContext,
    config: &ConversionConfig,
    html_path: &Path,
    stem: &str,
    format: OutputFormat,
    metadata: &FormatMetadata,
) -> FormatOutcome {
    let out = config
        .output_dir
        .join(format!("{stem}.{}", format.extension()));
    match ctx.converter.convert(html_path, &out, format, metadata).await {
        Ok(()) => FormatOutcome {
            format,
            output_path: Some(out),
            error: None,
        },
        Err(e) => {
            warn!("{}", e);
            FormatOutcome {
                format,
                output_path: None,
                error: Some(e.to_string()),
            }
        }
    }
}

/// Per-document state for the two generation modes.
struct DocumentRun<'a> {
    source: &'a Path,
    stem: &'a str,
    config: &'a ConversionConfig,
    ctx: &'a ConversionContext,
    progress: &'a Arc<SerializedProgress>,
    source_mtime: Option<SystemTime>,
}

impl DocumentRun<'_> {
    fn system_prompt(&self) -> String {
        self.config
            .system_prompt
            .clone()
            .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string())
    }

    fn is_fresh(&self, artifact: &Path) -> bool {
        !self.config.force
            && matches!(
                (modified(artifact), self.source_mtime),
                (Some(a), Some(s)) if a >= s
            )
    }

    async fn per_page(
        &self,
        opened: OpenedDocument,
        manifest: Manifest,
    ) -> Result<DocumentReport, Pdf2HtmlError> {
        let config = self.config;
        let page_count = opened.page_count();
        let resolver = PlaceholderResolver::new(&config.output_dir);
        info!("Per-page mode: {} pages", page_count);

        // ── Reuse fresh page artifacts ───────────────────────────────────
        let mut results: Vec<PageResult> = Vec::with_capacity(page_count);
        let mut pending: Vec<usize> = Vec::new();
        for page in 1..=page_count {
            let path = config.page_output_path(self.stem, page);
            if !self.is_fresh(&path) {
                pending.push(page);
                continue;
            }
            match tokio::fs::read_to_string(&path).await {
                Ok(markup) => {
                    let regions: Vec<&ImageRegion> = manifest.page_images(page).iter().collect();
                    let markup = resolver.resolve(&markup, &regions, Some(page)).markup;
                    let info = lang::detect(&markup);
                    debug!("Page {} is fresh; reusing {}", page, path.display());
                    results.push(PageResult {
                        page_num: page,
                        markup,
                        output_path: Some(path),
                        lang: info.lang,
                        dir: info.dir,
                        duration_ms: 0,
                        reused: true,
                        error: None,
                    });
                }
                Err(e) => {
                    warn!("Cannot reuse {}: {}; regenerating", path.display(), e);
                    pending.push(page);
                }
            }
        }
        let reused = results.len();
        if reused > 0 {
            info!("Reusing {} fresh page(s)", reused);
        }
        self.progress
            .emit(|cb| cb.on_conversion_start(page_count, reused));

        // ── Run the page pipeline ────────────────────────────────────────
        let manifest = Arc::new(manifest);
        let pipeline = PagePipeline::new(
            Arc::new(opened) as Arc<dyn PageExtractor>,
            Arc::clone(&self.ctx.backend),
            Arc::clone(&self.ctx.limiter),
            Arc::clone(&manifest),
            PageJob {
                stem: self.stem.to_string(),
                output_dir: config.output_dir.clone(),
                system_prompt: self.system_prompt(),
                password: config.password.clone(),
                api_timeout: config.api_timeout(),
                scratch_dir: config.scratch_root(),
                max_workers: config.max_workers,
            },
            Arc::clone(self.progress),
        );
        results.extend(pipeline.run(pending, page_count, reused).await);
        results.sort_by_key(|r| r.page_num);

        // ── Assemble ─────────────────────────────────────────────────────
        let assembled = assemble(
            &results,
            &AssemblyOptions {
                failed_pages: config.failed_pages,
                separator: config.page_separator.clone(),
                title: config
                    .format_options
                    .title
                    .clone()
                    .unwrap_or_else(|| self.stem.to_string()),
            },
        );
        let output_path = config.document_output_path(self.stem);
        write_atomic(&output_path, &assembled.html)
            .await
            .map_err(|e| Pdf2HtmlError::OutputWriteFailed {
                path: output_path.clone(),
                source: e,
            })?;
        info!("Wrote {}", output_path.display());

        let all: Vec<&ImageRegion> = manifest.all_images().collect();
        let succeeded = results.iter().filter(|r| r.is_success()).count();
        Ok(DocumentReport {
            source: self.source.to_path_buf(),
            stem: self.stem.to_string(),
            mode: GenerationMode::PerPage,
            pages_total: page_count,
            pages_succeeded: succeeded,
            pages_failed: results.len() - succeeded,
            pages_reused: reused,
            images_total: all.len(),
            images_embedded: resolver.embedded_count(&assembled.html, &all),
            unresolved_placeholders: unresolved_count(&assembled.html),
            output_path,
            formats: Vec::new(),
            elapsed_ms: 0,
            pages: results,
        })
    }

    async fn whole_document(
        &self,
        opened: OpenedDocument,
        manifest: Manifest,
    ) -> Result<DocumentReport, Pdf2HtmlError> {
        let config = self.config;
        let page_count = opened.page_count();
        let output_path = config.document_output_path(self.stem);
        let resolver = PlaceholderResolver::new(&config.output_dir);
        let all: Vec<&ImageRegion> = manifest.all_images().collect();
        info!("Whole-document mode: {} pages in one call", page_count);

        let (markup, reused) = if self.is_fresh(&output_path) {
            match tokio::fs::read_to_string(&output_path).await {
                Ok(markup) => {
                    info!("{} is fresh; skipping generation", output_path.display());
                    (markup, true)
                }
                Err(_) => (self.generate_whole(&opened, &all, &resolver).await?, false),
            }
        } else {
            self.progress.emit(|cb| cb.on_conversion_start(page_count, 0));
            (self.generate_whole(&opened, &all, &resolver).await?, false)
        };

        if !reused {
            write_atomic(&output_path, &markup)
                .await
                .map_err(|e| Pdf2HtmlError::OutputWriteFailed {
                    path: output_path.clone(),
                    source: e,
                })?;
            info!("Wrote {}", output_path.display());
        }

        let LanguageInfo { lang, dir } = lang::detect(&markup);
        Ok(DocumentReport {
            source: self.source.to_path_buf(),
            stem: self.stem.to_string(),
            mode: GenerationMode::WholeDocument,
            pages_total: page_count,
            pages_succeeded: page_count,
            pages_failed: 0,
            pages_reused: if reused { page_count } else { 0 },
            images_total: all.len(),
            images_embedded: resolver.embedded_count(&markup, &all),
            unresolved_placeholders: unresolved_count(&markup),
            output_path: output_path.clone(),
            formats: Vec::new(),
            elapsed_ms: 0,
            pages: vec![PageResult {
                page_num: 1,
                markup: String::new(),
                output_path: Some(output_path),
                lang,
                dir,
                duration_ms: 0,
                reused,
                error: None,
            }],
        })
    }

    async fn generate_whole(
        &self,
        opened: &OpenedDocument,
        all: &[&ImageRegion],
        resolver: &PlaceholderResolver,
    ) -> Result<String, Pdf2HtmlError> {
        let config = self.config;
        let failed = |detail: String| Pdf2HtmlError::GenerationFailed {
            path: self.source.to_path_buf(),
            detail,
        };

        let artifact = PageArtifact::whole_document(opened.path(), opened.backend());
        let request = GenerationRequest {
            page_num: None,
            prompt: self.system_prompt(),
            instruction: generation_instruction(None, all),
            artifact: artifact.path().to_path_buf(),
            password: config.password.clone(),
        };

        self.ctx.limiter.acquire().await;
        let raw = match tokio::time::timeout(config.api_timeout(), self.ctx.backend.generate(&request))
            .await
        {
            Err(_) => {
                return Err(failed(format!(
                    "timed out after {}s",
                    config.api_timeout_secs
                )))
            }
            Ok(Err(e)) => return Err(failed(e.to_string())),
            Ok(Ok(raw)) => raw,
        };

        let cleaned = clean_html(&raw);
        let resolution = resolver.resolve(&cleaned, all, None);
        if !resolution.unresolved.is_empty() {
            warn!(
                "{} placeholder(s) could not be matched to extracted images",
                resolution.unresolved.len()
            );
        }
        Ok(resolution.markup)
    }
}

fn modified(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

// ── Provider resolution ──────────────────────────────────────────────────

/// Instantiate a named provider with the given model.
fn create_vision_provider(
    provider_name: &str,
    model: &str,
) -> Result<Arc<dyn LLMProvider>, Pdf2HtmlError> {
    ProviderFactory::create_llm_provider(provider_name, model).map_err(|e| {
        Pdf2HtmlError::ProviderNotConfigured {
            provider: provider_name.to_string(),
            hint: format!("{e}"),
        }
    })
}

/// Resolve the LLM provider, from most-specific to least-specific.
///
/// 1. **Pre-built provider** (`config.provider`) — used as-is.
///
/// 2. **Named provider + model** (`config.provider_name`) — the factory reads
///    the matching API key (`OPENAI_API_KEY`, `GEMINI_API_KEY`, …).
///
/// 3. **Environment pair** (`EDGEQUAKE_LLM_PROVIDER` + `EDGEQUAKE_MODEL`) —
///    checked before auto-detection so the model choice is honoured even
///    when several API keys are present.
///
/// 4. **Single API key** (`GEMINI_API_KEY`, then `OPENAI_API_KEY`) with the
///    provider's default vision model.
///
/// 5. **Full auto-detection** (`ProviderFactory::from_env`).
pub async fn resolve_provider(
    config: &ConversionConfig,
) -> Result<Arc<dyn LLMProvider>, Pdf2HtmlError> {
    // 1) User-provided provider takes priority
    if let Some(ref provider) = config.provider {
        return Ok(Arc::clone(provider));
    }

    // 2) Provider name + model
    if let Some(ref name) = config.provider_name {
        let model = config.model.as_deref().unwrap_or("gpt-4.1-nano");
        return create_vision_provider(name, model);
    }

    // 3) EDGEQUAKE_LLM_PROVIDER + EDGEQUAKE_MODEL when both set
    if let (Ok(prov), Ok(model)) = (
        std::env::var("EDGEQUAKE_LLM_PROVIDER"),
        std::env::var("EDGEQUAKE_MODEL"),
    ) {
        if !prov.is_empty() && !model.is_empty() {
            return create_vision_provider(&prov, &model);
        }
    }

    // 4) Single API key: Gemini, then OpenAI
    if let Ok(key) = std::env::var("GEMINI_API_KEY") {
        if !key.is_empty() {
            let model = config.model.as_deref().unwrap_or("gemini-2.5-flash");
            return create_vision_provider("gemini", model);
        }
    }
    if let Ok(key) = std::env::var("OPENAI_API_KEY") {
        if !key.is_empty() {
            let model = config.model.as_deref().unwrap_or("gpt-4.1-nano");
            return create_vision_provider("openai", model);
        }
    }

    // 5) Full auto-detection
    let (llm_provider, _embedding) =
        ProviderFactory::from_env().map_err(|e| Pdf2HtmlError::ProviderNotConfigured {
            provider: "auto".to_string(),
            hint: format!(
                "No LLM provider could be auto-detected from environment.\n\
                Set GEMINI_API_KEY, OPENAI_API_KEY or ANTHROPIC_API_KEY, or configure a provider.\n\
                Error: {}",
                e
            ),
        })?;

    Ok(llm_provider)
}
