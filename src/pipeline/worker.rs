//! The concurrent page pipeline.
//!
//! ```text
//!            ┌────────── shared work list (page numbers) ──────────┐
//!            ▼                        ▼                            ▼
//!        worker 1                 worker 2        …            worker N
//!   extract (blocking pool)
//!   acquire rate limiter      ← the only admission gate before the provider
//!   generate (with timeout)
//!   sanitise → resolve → persist
//!            │                        │                            │
//!            └──────────── mpsc channel of WorkerEvent ────────────┘
//!                                     ▼
//!                                supervisor
//!              progress under one print lock, ETA, order restored
//! ```
//!
//! Every page walks `Pending → Extracting → RateLimited → Generating →
//! Sanitizing → Resolving → Persisted` and can fail at any step. A failure is
//! recorded in the page's [`PageResult`]; the worker picks the next page.
//! Nothing is retried except the extractor's own single fallback.

use crate::error::{PageError, PageStage};
use crate::manifest::{ImageRegion, Manifest};
use crate::output::PageResult;
use crate::pipeline::extract::PageExtractor;
use crate::pipeline::lang;
use crate::pipeline::llm::{GenerationBackend, GenerationRequest};
use crate::pipeline::placeholder::PlaceholderResolver;
use crate::pipeline::postprocess::clean_html;
use crate::pipeline::write_atomic;
use crate::progress::{ProgressSnapshot, SerializedProgress};
use crate::prompts::generation_instruction;
use crate::rate_limit::RateLimiter;
use std::collections::{BTreeMap, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Per-document settings shared by all workers.
#[derive(Debug, Clone)]
pub struct PageJob {
    /// Document stem used in artifact names.
    pub stem: String,
    /// Directory receiving `{stem}_page_{n}.html`.
    pub output_dir: PathBuf,
    pub system_prompt: String,
    pub password: Option<String>,
    pub api_timeout: Duration,
    pub scratch_dir: PathBuf,
    pub max_workers: usize,
}

impl PageJob {
    pub fn page_output_path(&self, page_num: usize) -> PathBuf {
        self.output_dir
            .join(format!("{}_page_{}.html", self.stem, page_num))
    }
}

enum WorkerEvent {
    Started(usize),
    Finished(PageResult),
}

/// Runs a set of pages through a bounded worker pool.
pub struct PagePipeline {
    extractor: Arc<dyn PageExtractor>,
    backend: Arc<dyn GenerationBackend>,
    limiter: Arc<RateLimiter>,
    manifest: Arc<Manifest>,
    job: Arc<PageJob>,
    progress: Arc<SerializedProgress>,
}

impl PagePipeline {
    pub(crate) fn new(
        extractor: Arc<dyn PageExtractor>,
        backend: Arc<dyn GenerationBackend>,
        limiter: Arc<RateLimiter>,
        manifest: Arc<Manifest>,
        job: PageJob,
        progress: Arc<SerializedProgress>,
    ) -> Self {
        Self {
            extractor,
            backend,
            limiter,
            manifest,
            job: Arc::new(job),
            progress,
        }
    }

    /// Convert `pages` and return one result per page, ascending.
    ///
    /// `total_pages` and `already_done` (pages reused from disk) only feed the
    /// progress snapshots.
    pub async fn run(&self, pages: Vec<usize>, total_pages: usize, already_done: usize) -> Vec<PageResult> {
        if pages.is_empty() {
            return Vec::new();
        }

        let workers = self.job.max_workers.clamp(1, pages.len());
        info!(
            "Converting {} page(s) with {} worker(s), {} request(s) per {:?}",
            pages.len(),
            workers,
            self.limiter.max_requests(),
            self.limiter.window()
        );

        let queue = Arc::new(Mutex::new(pages.iter().copied().collect::<VecDeque<_>>()));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut set = JoinSet::new();

        for worker_id in 0..workers {
            let ctx = WorkerContext {
                extractor: Arc::clone(&self.extractor),
                backend: Arc::clone(&self.backend),
                limiter: Arc::clone(&self.limiter),
                manifest: Arc::clone(&self.manifest),
                job: Arc::clone(&self.job),
            };
            let queue = Arc::clone(&queue);
            let tx = tx.clone();
            set.spawn(async move {
                ctx.work(worker_id, queue, tx).await;
            });
        }
        drop(tx);

        // ── Supervisor ──────────────────────────────────────────────────
        let started = Instant::now();
        let mut results: BTreeMap<usize, PageResult> = BTreeMap::new();
        let mut completed = already_done;
        let mut failed = 0usize;

        while let Some(event) = rx.recv().await {
            match event {
                WorkerEvent::Started(page) => {
                    self.progress.emit(|cb| cb.on_page_start(page, total_pages));
                }
                WorkerEvent::Finished(result) => {
                    let page = result.page_num;
                    match &result.error {
                        None => {
                            completed += 1;
                            let len = result.markup.len();
                            self.progress
                                .emit(|cb| cb.on_page_complete(page, total_pages, len));
                        }
                        Some(e) => {
                            failed += 1;
                            let msg = e.to_string();
                            self.progress
                                .emit(|cb| cb.on_page_error(page, total_pages, &msg));
                        }
                    }
                    let snapshot = ProgressSnapshot::new(
                        completed - already_done,
                        failed,
                        pages.len(),
                        started.elapsed(),
                    );
                    debug!(
                        "Progress: {}/{} finished, eta {:?}",
                        snapshot.finished(),
                        snapshot.total,
                        snapshot.eta
                    );
                    let overall = ProgressSnapshot {
                        completed,
                        total: total_pages,
                        ..snapshot
                    };
                    self.progress.emit(|cb| cb.on_progress(&overall));
                    results.insert(page, result);
                }
            }
        }

        while let Some(joined) = set.join_next().await {
            if let Err(e) = joined {
                error!("Page worker ended abnormally: {}", e);
            }
        }

        // A page can only be missing if its worker died mid-flight.
        for &page in &pages {
            results.entry(page).or_insert_with(|| {
                warn!("Page {} was never reported", page);
                PageResult::failed(
                    page,
                    PageError::WorkerLost {
                        page,
                        detail: "worker task ended unexpectedly".into(),
                    },
                    0,
                )
            });
        }

        results.into_values().collect()
    }
}

struct WorkerContext {
    extractor: Arc<dyn PageExtractor>,
    backend: Arc<dyn GenerationBackend>,
    limiter: Arc<RateLimiter>,
    manifest: Arc<Manifest>,
    job: Arc<PageJob>,
}

impl WorkerContext {
    async fn work(
        &self,
        worker_id: usize,
        queue: Arc<Mutex<VecDeque<usize>>>,
        tx: mpsc::UnboundedSender<WorkerEvent>,
    ) {
        loop {
            let next = queue
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .pop_front();
            let Some(page) = next else { break };

            debug!("Worker {} took page {}", worker_id, page);
            if tx.send(WorkerEvent::Started(page)).is_err() {
                break;
            }
            let result = self.process_page(page).await;
            if tx.send(WorkerEvent::Finished(result)).is_err() {
                break;
            }
        }
        debug!("Worker {} drained the work list", worker_id);
    }

    async fn process_page(&self, page: usize) -> PageResult {
        let start = Instant::now();
        let elapsed_ms = |start: Instant| start.elapsed().as_millis() as u64;

        match self.run_stages(page).await {
            Ok(mut result) => {
                result.duration_ms = elapsed_ms(start);
                result
            }
            Err(e) => {
                warn!("{} (while {})", e, e.stage());
                PageResult::failed(page, e, elapsed_ms(start))
            }
        }
    }

    async fn run_stages(&self, page: usize) -> Result<PageResult, PageError> {
        trace_stage(page, PageStage::Extracting);
        let extractor = Arc::clone(&self.extractor);
        let scratch = self.job.scratch_dir.clone();
        let artifact = tokio::task::spawn_blocking(move || extractor.extract(page, &scratch))
            .await
            .map_err(|e| PageError::ExtractionFailed {
                page,
                detail: format!("extraction task panicked: {e}"),
            })??;

        trace_stage(page, PageStage::RateLimited);
        self.limiter.acquire().await;

        trace_stage(page, PageStage::Generating);
        let regions: Vec<&ImageRegion> = self.manifest.page_images(page).iter().collect();
        let request = GenerationRequest {
            page_num: Some(page),
            prompt: self.job.system_prompt.clone(),
            instruction: generation_instruction(Some(page), &regions),
            artifact: artifact.path().to_path_buf(),
            password: self.job.password.clone(),
        };
        let raw = match tokio::time::timeout(self.job.api_timeout, self.backend.generate(&request)).await {
            Err(_) => {
                return Err(PageError::Timeout {
                    page,
                    secs: self.job.api_timeout.as_secs(),
                })
            }
            Ok(Err(e)) => {
                return Err(PageError::GenerationFailed {
                    page,
                    detail: e.to_string(),
                })
            }
            Ok(Ok(raw)) => raw,
        };
        drop(artifact);

        trace_stage(page, PageStage::Sanitizing);
        let cleaned = clean_html(&raw);

        trace_stage(page, PageStage::Resolving);
        let resolved = PlaceholderResolver::new(&self.job.output_dir).resolve(&cleaned, &regions, Some(page));
        let info = lang::detect(&resolved.markup);

        trace_stage(page, PageStage::Persisted);
        let path = self.job.page_output_path(page);
        write_atomic(&path, &resolved.markup)
            .await
            .map_err(|e| PageError::PersistFailed {
                page,
                path: path.clone(),
                detail: e.to_string(),
            })?;

        Ok(PageResult {
            page_num: page,
            markup: resolved.markup,
            output_path: Some(path),
            lang: info.lang,
            dir: info.dir,
            duration_ms: 0,
            reused: false,
            error: None,
        })
    }
}

fn trace_stage(page: usize, stage: PageStage) {
    tracing::trace!("Page {} → {}", page, stage);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::extract::PageArtifact;
    use crate::pipeline::llm::GenerationError;
    use crate::pipeline::reader::BackendKind;
    use futures::future::BoxFuture;
    use std::path::Path;

    struct StubExtractor {
        pages: usize,
        broken: Option<usize>,
    }

    impl PageExtractor for StubExtractor {
        fn page_count(&self) -> usize {
            self.pages
        }

        fn extract(&self, page_num: usize, scratch_dir: &Path) -> Result<PageArtifact, PageError> {
            if Some(page_num) == self.broken {
                return Err(PageError::ExtractionFailed {
                    page: page_num,
                    detail: "damaged content stream".into(),
                });
            }
            std::fs::create_dir_all(scratch_dir).unwrap();
            let file = tempfile::NamedTempFile::new_in(scratch_dir).unwrap();
            Ok(PageArtifact::scratch(page_num, file, BackendKind::LenientStructural))
        }
    }

    /// Slower for low page numbers so completions arrive out of order.
    struct StubBackend {
        hang_on: Option<usize>,
    }

    impl GenerationBackend for StubBackend {
        fn generate<'a>(
            &'a self,
            request: &'a GenerationRequest,
        ) -> BoxFuture<'a, Result<String, GenerationError>> {
            Box::pin(async move {
                let page = request.page_num.unwrap_or(0);
                if Some(page) == self.hang_on {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                }
                tokio::time::sleep(Duration::from_millis((10 - page as u64 % 10) * 100)).await;
                Ok(format!(
                    "```html\n<html lang=\"en\"><body><p>Page {page}</p></body></html>\n```"
                ))
            })
        }
    }

    fn pipeline(dir: &Path, extractor: StubExtractor, backend: StubBackend) -> PagePipeline {
        PagePipeline::new(
            Arc::new(extractor),
            Arc::new(backend),
            Arc::new(RateLimiter::new(100, Duration::from_secs(60))),
            Arc::new(Manifest::empty()),
            PageJob {
                stem: "doc".into(),
                output_dir: dir.join("out"),
                system_prompt: "prompt".into(),
                password: None,
                api_timeout: Duration::from_secs(30),
                scratch_dir: dir.join("scratch"),
                max_workers: 3,
            },
            Arc::new(SerializedProgress::new(None)),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn results_come_back_in_page_order() {
        let dir = tempfile::tempdir().unwrap();
        let p = pipeline(
            dir.path(),
            StubExtractor { pages: 7, broken: None },
            StubBackend { hang_on: None },
        );
        let results = p.run((1..=7).collect(), 7, 0).await;

        let order: Vec<usize> = results.iter().map(|r| r.page_num).collect();
        assert_eq!(order, (1..=7).collect::<Vec<_>>());
        assert!(results.iter().all(|r| r.is_success()));
        let page3 = std::fs::read_to_string(dir.path().join("out/doc_page_3.html")).unwrap();
        assert_eq!(page3, "<html lang=\"en\"><body><p>Page 3</p></body></html>\n");
        assert_eq!(results[2].lang.as_deref(), Some("en"));
    }

    #[tokio::test(start_paused = true)]
    async fn failures_stay_on_their_page() {
        let dir = tempfile::tempdir().unwrap();
        let p = pipeline(
            dir.path(),
            StubExtractor { pages: 5, broken: Some(2) },
            StubBackend { hang_on: Some(4) },
        );
        let results = p.run((1..=5).collect(), 5, 0).await;

        assert_eq!(results.len(), 5);
        assert!(matches!(
            results[1].error,
            Some(PageError::ExtractionFailed { page: 2, .. })
        ));
        assert!(matches!(
            results[3].error,
            Some(PageError::Timeout { page: 4, secs: 30 })
        ));
        assert_eq!(results.iter().filter(|r| r.is_success()).count(), 3);
        assert!(!dir.path().join("out/doc_page_4.html").exists());
    }
}
