//! Generation backend: turn a page artifact into HTML.
//!
//! The pipeline only knows the [`GenerationBackend`] trait: one request in,
//! one markup string (or one error) out. It calls it at most once per page
//! and never retries; retry policy against provider quotas is the rate
//! limiter's job, not this module's.
//!
//! [`VisionBackend`] is the production implementation. It rasterises the
//! artifact with pdfium, attaches the PNGs to a single vision message and
//! calls an `edgequake-llm` provider. All prompt text lives in
//! [`crate::prompts`].

use crate::pipeline::render::{render_artifact, RenderSettings};
use edgequake_llm::{ChatMessage, CompletionOptions, LLMProvider};
use futures::future::BoxFuture;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::debug;

/// Everything a backend needs for one call.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    /// 1-indexed page; `None` when the artifact is the whole document.
    pub page_num: Option<usize>,
    /// System prompt.
    pub prompt: String,
    /// Per-call instruction (image ids the page may reference, etc.).
    pub instruction: String,
    /// PDF file to convert.
    pub artifact: PathBuf,
    pub password: Option<String>,
}

/// Why a generation call produced no markup.
#[derive(Debug, Clone, Error)]
pub enum GenerationError {
    /// The artifact could not be turned into model input.
    #[error("could not prepare input: {0}")]
    Input(String),

    /// The provider rejected or failed the call (quota, network, auth).
    #[error("provider error: {0}")]
    Provider(String),

    /// The provider answered with nothing usable.
    #[error("empty response from provider")]
    EmptyResponse,
}

/// The opaque text/HTML generator.
pub trait GenerationBackend: Send + Sync {
    fn generate<'a>(
        &'a self,
        request: &'a GenerationRequest,
    ) -> BoxFuture<'a, Result<String, GenerationError>>;
}

/// Vision-LLM backend over an `edgequake-llm` provider.
pub struct VisionBackend {
    provider: Arc<dyn LLMProvider>,
    options: CompletionOptions,
    render: RenderSettings,
}

impl VisionBackend {
    pub fn new(
        provider: Arc<dyn LLMProvider>,
        temperature: f32,
        max_tokens: usize,
        render: RenderSettings,
    ) -> Self {
        Self {
            provider,
            options: build_options(temperature, max_tokens),
            render,
        }
    }
}

impl GenerationBackend for VisionBackend {
    fn generate<'a>(
        &'a self,
        request: &'a GenerationRequest,
    ) -> BoxFuture<'a, Result<String, GenerationError>> {
        Box::pin(async move {
            let start = Instant::now();
            let images = render_artifact(&request.artifact, request.password.as_deref(), self.render)
                .await
                .map_err(GenerationError::Input)?;
            if images.is_empty() {
                return Err(GenerationError::Input("artifact has no pages".into()));
            }

            let messages = vec![
                ChatMessage::system(&request.prompt),
                ChatMessage::user_with_images(&request.instruction, images),
            ];

            let response = self
                .provider
                .chat(&messages, Some(&self.options))
                .await
                .map_err(|e| GenerationError::Provider(e.to_string()))?;

            debug!(
                "{}: {} input tokens, {} output tokens, {:?}",
                request
                    .page_num
                    .map(|p| format!("Page {p}"))
                    .unwrap_or_else(|| "Document".to_string()),
                response.prompt_tokens,
                response.completion_tokens,
                start.elapsed()
            );

            if response.content.trim().is_empty() {
                return Err(GenerationError::EmptyResponse);
            }
            Ok(response.content)
        })
    }
}

fn build_options(temperature: f32, max_tokens: usize) -> CompletionOptions {
    CompletionOptions {
        temperature: Some(temperature),
        max_tokens: Some(max_tokens),
        ..Default::default()
    }
}
