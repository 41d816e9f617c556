//! Shared helpers for the integration tests: real PDFs built with lopdf and a
//! scripted generation backend.

#![allow(dead_code)]

use edgequake_pdf2html::{GenerationBackend, GenerationError, GenerationRequest};
use futures::future::BoxFuture;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

// Same builder the unit tests use; it is crate-private, so it is compiled in
// here by path.
#[path = "../../src/pipeline/fixtures.rs"]
mod fixtures;

pub(crate) use fixtures::write_pdf;

/// Generation backend driven by a script instead of a model.
///
/// Page calls answer with a small HTML document for that page; whole-document
/// calls (no page number) answer with one document for everything.
#[derive(Default)]
pub struct ScriptedBackend {
    /// Simulated latency of every call.
    pub delay: Duration,
    /// Pages whose call returns a provider error.
    pub fail_pages: HashSet<usize>,
    /// Extra body markup per page (e.g. image placeholders).
    pub extra: HashMap<usize, String>,
    /// Extra body markup for whole-document calls.
    pub document_extra: String,
    /// `(page, start)` of every call in arrival order.
    pub calls: Mutex<Vec<(Option<usize>, Instant)>>,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn failing(mut self, page: usize) -> Self {
        self.fail_pages.insert(page);
        self
    }

    pub fn with_extra(mut self, page: usize, markup: &str) -> Self {
        self.extra.insert(page, markup.to_string());
        self
    }

    pub fn with_document_extra(mut self, markup: &str) -> Self {
        self.document_extra = markup.to_string();
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    /// Call start times, sorted.
    pub fn start_times(&self) -> Vec<Instant> {
        let mut starts: Vec<Instant> = self.calls.lock().unwrap().iter().map(|c| c.1).collect();
        starts.sort();
        starts
    }
}

impl GenerationBackend for ScriptedBackend {
    fn generate<'a>(
        &'a self,
        request: &'a GenerationRequest,
    ) -> BoxFuture<'a, Result<String, GenerationError>> {
        Box::pin(async move {
            self.calls
                .lock()
                .unwrap()
                .push((request.page_num, Instant::now()));
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }

            match request.page_num {
                Some(page) if self.fail_pages.contains(&page) => Err(GenerationError::Provider(
                    format!("429 quota exhausted on page {page}"),
                )),
                Some(page) => Ok(format!(
                    "```html\n<!DOCTYPE html>\n<html lang=\"en\" dir=\"ltr\">\n<head><meta charset=\"utf-8\"><title>Page {page}</title></head>\n<body>\n<p>Content of page {page}</p>\n{}\n</body>\n</html>\n```",
                    self.extra.get(&page).map(String::as_str).unwrap_or("")
                )),
                None => Ok(format!(
                    "<!DOCTYPE html>\n<html lang=\"ar\" dir=\"rtl\">\n<head><meta charset=\"utf-8\"><title>Document</title></head>\n<body>\n<p>مرحبا بالعالم</p>\n{}\n</body>\n</html>\n",
                    self.document_extra
                )),
            }
        })
    }
}
