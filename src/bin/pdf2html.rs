//! CLI binary for edgequake-pdf2html.
//!
//! A thin shim over the library crate that maps CLI flags
//! to `ConversionConfig` and prints results.

use anyhow::{Context, Result};
use clap::Parser;
use edgequake_pdf2html::{
    convert_folder, BatchReport, ConversionConfig, ConversionMode, ConversionProgressCallback,
    EpubMath, FailedPagePolicy, FormatOptions, OutputFormat, PageSeparator, ProgressCallback,
    ProgressSnapshot,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}
fn cyan(s: &str) -> String {
    format!("\x1b[36m{s}\x1b[0m")
}

const TICKS: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"];

// ── CLI progress callback using indicatif ────────────────────────────────────

/// Terminal progress callback: one live bar per document plus per-page log
/// lines. Pages complete out of order when several workers run.
struct CliProgressCallback {
    bar: ProgressBar,
    start_times: Mutex<HashMap<usize, Instant>>,
    errors: AtomicUsize,
}

impl CliProgressCallback {
    fn new_dynamic() -> Arc<Self> {
        let bar = ProgressBar::new(0);
        bar.set_style(Self::spinner_style());
        bar.set_prefix("Preparing");
        bar.set_message("Opening PDF…");
        bar.enable_steady_tick(Duration::from_millis(80));

        Arc::new(Self {
            bar,
            start_times: Mutex::new(HashMap::new()),
            errors: AtomicUsize::new(0),
        })
    }

    fn spinner_style() -> ProgressStyle {
        ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(TICKS)
    }

    /// Switch to the full progress-bar style once we know `total`.
    fn activate_bar(&self, total: usize, done: usize) {
        let progress_style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  \
             [{bar:42.green/238}] {pos:>3}/{len} pages  \
             ⏱ {elapsed_precise}  {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(TICKS);

        self.bar.set_length(total as u64);
        self.bar.set_position(done as u64);
        self.bar.set_style(progress_style);
        self.bar.set_prefix("Converting");
        self.bar.reset_eta();
    }

    fn take_elapsed(&self, page_num: usize) -> f64 {
        self.start_times
            .lock()
            .ok()
            .and_then(|mut m| m.remove(&page_num))
            .map(|t| t.elapsed().as_secs_f64())
            .unwrap_or(0.0)
    }
}

impl ConversionProgressCallback for CliProgressCallback {
    fn on_document_start(&self, name: &str, index: usize, total: usize) {
        self.bar.set_style(Self::spinner_style());
        self.bar.set_prefix(format!("[{index}/{total}]"));
        self.bar.set_message(format!("Opening {name}…"));
        self.bar.println(format!(
            "{} {}",
            cyan("◆"),
            bold(&format!("[{index}/{total}] {name}"))
        ));
    }

    fn on_document_error(&self, name: &str, error: &str) {
        self.bar
            .println(format!("  {} {}  {}", red("✗"), name, red(error)));
    }

    fn on_conversion_start(&self, total_pages: usize, reused_pages: usize) {
        self.activate_bar(total_pages, reused_pages);
        let reused = if reused_pages > 0 {
            dim(&format!(" ({reused_pages} reused)"))
        } else {
            String::new()
        };
        self.bar
            .println(format!("  {} pages{}", bold(&total_pages.to_string()), reused));
    }

    fn on_page_start(&self, page_num: usize, _total: usize) {
        if let Ok(mut m) = self.start_times.lock() {
            m.insert(page_num, Instant::now());
        }
    }

    fn on_page_complete(&self, page_num: usize, total: usize, html_len: usize) {
        let secs = self.take_elapsed(page_num);
        self.bar.println(format!(
            "  {} Page {:>3}/{:<3}  {:<8}  {}",
            green("✓"),
            page_num,
            total,
            dim(&format!("{html_len:>6} bytes")),
            dim(&format!("{secs:.1}s")),
        ));
        self.bar.inc(1);
    }

    fn on_page_error(&self, page_num: usize, total: usize, error: &str) {
        let secs = self.take_elapsed(page_num);
        self.errors.fetch_add(1, Ordering::SeqCst);

        let msg: String = if error.chars().count() > 80 {
            error.chars().take(79).chain(std::iter::once('\u{2026}')).collect()
        } else {
            error.to_string()
        };

        self.bar.println(format!(
            "  {} Page {:>3}/{:<3}  {}  {}",
            red("✗"),
            page_num,
            total,
            red(&msg),
            dim(&format!("{secs:.1}s")),
        ));
        self.bar.inc(1);
    }

    fn on_progress(&self, snapshot: &ProgressSnapshot) {
        if let Some(eta) = snapshot.eta {
            self.bar.set_message(format!("ETA {}s", eta.as_secs()));
        }
    }

    fn on_conversion_complete(&self, total_pages: usize, success_count: usize) {
        let failed = total_pages.saturating_sub(success_count);
        self.bar.set_message("");
        if failed > 0 {
            self.bar.println(format!(
                "  {} {}/{} pages converted  ({} failed)",
                cyan("⚠"),
                bold(&success_count.to_string()),
                total_pages,
                red(&failed.to_string()),
            ));
        }
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Convert one document (pages > 20 go page by page)
  pdf2html paper.pdf

  # Convert every PDF in a folder, 3 workers, 10 requests per minute
  pdf2html --workers 3 --rpm 10 input_pdfs/

  # Force per-page mode and regenerate everything
  pdf2html --per-page --force book.pdf

  # Also produce DOCX and EPUB via pandoc
  pdf2html --formats docx,epub --title "Annual Report" --author "Finance" report.pdf

  # JSON report on stdout
  pdf2html --json input_pdfs/ > report.json

ARTIFACTS:
  {output-dir}/{stem}_page_{n}.html   per-page mode
  {output-dir}/{stem}.html            always
  {output-dir}/{stem}.docx|.epub      with --formats

  Extracted images are read from {images-dir}/{stem}_manifest.json.
  Artifacts newer than the source PDF are reused unless --force is given.

ENVIRONMENT VARIABLES:
  GEMINI_API_KEY          Google Gemini API key
  OPENAI_API_KEY          OpenAI API key
  ANTHROPIC_API_KEY       Anthropic API key
  EDGEQUAKE_LLM_PROVIDER  Override provider (gemini, openai, anthropic, ollama)
  EDGEQUAKE_MODEL         Override model ID
  PDFIUM_LIB_PATH         Path to libpdfium (file or directory)
  RUST_LOG                Tracing filter, overrides -v / -q
"#;

/// Convert PDF documents to HTML using Vision LLMs.
#[derive(Parser, Debug)]
#[command(
    name = "pdf2html",
    version,
    about = "Convert PDF documents to page-faithful HTML (and DOCX/EPUB) using Vision LLMs",
    long_about = "Convert a PDF, or every PDF in a folder, to HTML using Vision Language Models. \
Long documents are converted page by page through a worker pool that respects a shared \
requests-per-window budget. Images extracted upstream are embedded in place of the model's \
figure placeholders.",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// PDF file or directory of PDFs.
    input: PathBuf,

    /// Directory receiving page and document artifacts.
    #[arg(short, long, env = "PDF2HTML_OUTPUT_DIR", default_value = "output_html")]
    output_dir: PathBuf,

    /// Directory holding `{stem}_manifest.json` and extracted images.
    #[arg(long, env = "PDF2HTML_IMAGES_DIR", default_value = "extracted_images")]
    images_dir: PathBuf,

    /// Always convert page by page.
    #[arg(long, conflicts_with = "whole_document")]
    per_page: bool,

    /// Always convert in a single generation call.
    #[arg(long)]
    whole_document: bool,

    /// Page count above which documents are converted page by page.
    #[arg(long, env = "PDF2HTML_PAGE_THRESHOLD", default_value_t = 20)]
    page_threshold: usize,

    /// Worker pool size for per-page mode.
    #[arg(short, long, env = "PDF2HTML_WORKERS", default_value_t = 3)]
    workers: usize,

    /// Generation calls allowed per rate window.
    #[arg(long, env = "PDF2HTML_RPM", default_value_t = 10)]
    rpm: usize,

    /// Rate window length in seconds.
    #[arg(long, env = "PDF2HTML_RATE_WINDOW", default_value_t = 60)]
    rate_window: u64,

    /// Per-call generation timeout in seconds.
    #[arg(long, env = "PDF2HTML_API_TIMEOUT", default_value_t = 300)]
    api_timeout: u64,

    /// Regenerate artifacts even when they are newer than the source.
    #[arg(short, long, env = "PDF2HTML_FORCE")]
    force: bool,

    /// Leave failed pages out of the document (an HTML comment marks them).
    #[arg(long, env = "PDF2HTML_OMIT_FAILED")]
    omit_failed: bool,

    /// Page separator: none, hr, pagebreak, comment, or custom markup.
    #[arg(long, env = "PDF2HTML_SEPARATOR", default_value = "none")]
    separator: String,

    /// Extra output formats, comma separated: docx, epub.
    #[arg(long, env = "PDF2HTML_FORMATS", value_delimiter = ',')]
    formats: Vec<OutputFormat>,

    /// Title metadata for DOCX/EPUB (defaults to the file stem).
    #[arg(long)]
    title: Option<String>,

    /// Author metadata for DOCX/EPUB.
    #[arg(long)]
    author: Option<String>,

    /// How math is carried into EPUB output.
    #[arg(long, value_enum, default_value = "mathml")]
    epub_math: EpubMathArg,

    /// Cover image for EPUB output.
    #[arg(long)]
    cover: Option<PathBuf>,

    /// Reference DOCX with right-to-left styles.
    #[arg(long)]
    reference_doc: Option<PathBuf>,

    /// LLM model ID (e.g. gemini-2.5-flash, gpt-4.1-nano).
    #[arg(long, env = "EDGEQUAKE_MODEL")]
    model: Option<String>,

    /// LLM provider: gemini, openai, anthropic, ollama, azure.
    #[arg(long, env = "EDGEQUAKE_PROVIDER")]
    provider: Option<String>,

    /// Rendering DPI (72–400).
    #[arg(long, env = "PDF2HTML_DPI", default_value_t = 150,
          value_parser = clap::value_parser!(u32).range(72..=400))]
    dpi: u32,

    /// Max LLM output tokens per call.
    #[arg(long, env = "PDF2HTML_MAX_TOKENS", default_value_t = 8192)]
    max_tokens: usize,

    /// LLM temperature (0.0–2.0).
    #[arg(long, env = "PDF2HTML_TEMPERATURE", default_value_t = 0.1)]
    temperature: f32,

    /// Path to a text file containing a custom system prompt.
    #[arg(long, env = "PDF2HTML_SYSTEM_PROMPT")]
    system_prompt: Option<PathBuf>,

    /// PDF user password for encrypted documents.
    #[arg(long, env = "PDF2HTML_PASSWORD")]
    password: Option<String>,

    /// Print the batch report as JSON on stdout.
    #[arg(long, env = "PDF2HTML_JSON")]
    json: bool,

    /// Disable progress bar.
    #[arg(long, env = "PDF2HTML_NO_PROGRESS")]
    no_progress: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, env = "PDF2HTML_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, env = "PDF2HTML_QUIET")]
    quiet: bool,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum EpubMathArg {
    Mathml,
    Images,
    Mathjax,
}

impl From<EpubMathArg> for EpubMath {
    fn from(v: EpubMathArg) -> Self {
        match v {
            EpubMathArg::Mathml => EpubMath::MathMl,
            EpubMathArg::Images => EpubMath::Images,
            EpubMathArg::Mathjax => EpubMath::MathJax,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // The progress bar replaces INFO logs; --verbose always wins.
    let show_progress = !cli.quiet && !cli.no_progress && !cli.json;
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    // ── Build config ─────────────────────────────────────────────────────
    let progress_cb: Option<ProgressCallback> = if show_progress {
        let cb = CliProgressCallback::new_dynamic();
        Some(cb as Arc<dyn ConversionProgressCallback>)
    } else {
        None
    };

    let config = build_config(&cli, progress_cb).await?;

    // ── Run conversion ───────────────────────────────────────────────────
    let report = convert_folder(&cli.input, &config)
        .await
        .context("Conversion failed")?;

    if cli.json {
        let json = serde_json::to_string_pretty(&report).context("Failed to serialise report")?;
        println!("{json}");
    } else if !cli.quiet {
        print_summary(&report);
    }

    if !report.skipped.is_empty() {
        std::process::exit(1);
    }
    Ok(())
}

fn print_summary(report: &BatchReport) {
    for doc in &report.documents {
        let mark = if doc.pages_failed == 0 {
            green("✔")
        } else if doc.pages_succeeded == 0 {
            red("✘")
        } else {
            cyan("⚠")
        };
        eprintln!(
            "{}  {}  →  {}",
            mark,
            doc.summary_line(),
            bold(&doc.output_path.display().to_string())
        );
        if doc.images_total > 0 || doc.unresolved_placeholders > 0 {
            eprintln!(
                "   {}",
                dim(&format!(
                    "{}/{} images embedded, {} unresolved placeholder(s)",
                    doc.images_embedded, doc.images_total, doc.unresolved_placeholders
                ))
            );
        }
        for f in &doc.formats {
            match (&f.output_path, &f.error) {
                (Some(p), _) => eprintln!("   {} {}", green("✓"), p.display()),
                (None, Some(e)) => eprintln!("   {} {}: {}", red("✗"), f.format, red(e)),
                (None, None) => {}
            }
        }
    }
    for skipped in &report.skipped {
        eprintln!(
            "{}  {}  {}",
            red("✘"),
            skipped.source.display(),
            red(&skipped.error)
        );
    }
    if report.documents.len() + report.skipped.len() > 1 {
        eprintln!(
            "{}",
            dim(&format!(
                "{} converted, {} skipped, {:.1}s total",
                report.documents.len(),
                report.skipped.len(),
                report.elapsed_ms as f64 / 1000.0
            ))
        );
    }
}

/// Map CLI args to `ConversionConfig`.
async fn build_config(cli: &Cli, progress: Option<ProgressCallback>) -> Result<ConversionConfig> {
    let system_prompt = if let Some(ref path) = cli.system_prompt {
        Some(
            tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("Failed to read system prompt from {:?}", path))?,
        )
    } else {
        None
    };

    let mode = if cli.per_page {
        ConversionMode::PerPage
    } else if cli.whole_document {
        ConversionMode::WholeDocument
    } else {
        ConversionMode::Auto {
            page_threshold: cli.page_threshold,
        }
    };

    let failed_pages = if cli.omit_failed {
        FailedPagePolicy::Omit
    } else {
        FailedPagePolicy::Placeholder
    };

    let mut builder = ConversionConfig::builder()
        .output_dir(&cli.output_dir)
        .images_dir(&cli.images_dir)
        .mode(mode)
        .max_workers(cli.workers)
        .requests_per_window(cli.rpm)
        .rate_window_secs(cli.rate_window)
        .api_timeout_secs(cli.api_timeout)
        .force(cli.force)
        .failed_pages(failed_pages)
        .page_separator(parse_separator(&cli.separator))
        .dpi(cli.dpi)
        .max_tokens(cli.max_tokens)
        .temperature(cli.temperature)
        .formats(cli.formats.clone())
        .format_options(FormatOptions {
            title: cli.title.clone(),
            author: cli.author.clone(),
            epub_math: cli.epub_math.into(),
            cover: cli.cover.clone(),
            reference_doc: cli.reference_doc.clone(),
        });

    if let Some(cb) = progress {
        builder = builder.progress_callback(cb);
    }

    let mut config = builder.build().context("Invalid configuration")?;

    // Apply fields that need special handling
    config.model = cli.model.clone();
    config.provider_name = cli.provider.clone();
    config.password = cli.password.clone();
    config.system_prompt = system_prompt;

    Ok(config)
}

/// Parse `--separator` string into `PageSeparator`.
fn parse_separator(s: &str) -> PageSeparator {
    match s.to_lowercase().as_str() {
        "none" => PageSeparator::None,
        "hr" => PageSeparator::HorizontalRule,
        "pagebreak" | "page-break" => PageSeparator::PageBreak,
        "comment" => PageSeparator::Comment,
        _ => PageSeparator::Custom(s.to_string()),
    }
}
