//! VLM interaction: the backend seam.
//!
//! Everything above this module speaks [`VisionModel`]: "send these
//! instructions and this image, get text back". [`LlmVisionModel`] is the
//! one production implementation, translating a [`VisionRequest`] into an
//! `edgequake-llm` chat call. Validation and retry live in
//! [`crate::pipeline::extract`] and never see provider types, so swapping
//! the backend (or scripting one in tests) touches nothing else.
//!
//! ## Message Layout
//!
//! 1. **System message** — the response schema ([`crate::prompts::schema_system_prompt`])
//! 2. **User message** — task instruction with the worked example, then the
//!    caller's prompt, with the page image attached by URL
//! 3. **Re-ask message** *(retries after a validation failure only)* — what
//!    was wrong with the previous answer

use crate::config::RunConfig;
use crate::error::TablesError;
use async_trait::async_trait;
use edgequake_llm::{ChatMessage, CompletionOptions, ImageData, LLMProvider, ProviderFactory};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// One page-extraction request, independent of any backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VisionRequest {
    /// System instructions (the response schema).
    pub system: String,
    /// Task statement plus worked example.
    pub instruction: String,
    /// URL of the page image.
    pub image_url: String,
    /// Caller prompt followed by the fixed instruction block.
    pub prompt: String,
    /// Correction for the previous answer, if it failed validation.
    pub feedback: Option<String>,
}

/// Raw model output plus token accounting.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModelReply {
    pub content: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// A failed model call. Always treated as transient by the retry loop.
#[derive(Debug, Clone, Error)]
pub enum ModelError {
    /// The provider returned an error (HTTP 429/5xx, transport, auth…).
    #[error("model request failed: {0}")]
    Request(String),

    /// The provider answered with no text at all.
    #[error("model returned an empty response")]
    EmptyResponse,
}

/// "Send image + instructions, get text" capability.
#[async_trait]
pub trait VisionModel: Send + Sync {
    /// Model identifier for logs.
    fn name(&self) -> &str;

    async fn complete(&self, request: &VisionRequest) -> Result<ModelReply, ModelError>;
}

/// [`VisionModel`] backed by an `edgequake-llm` provider.
pub struct LlmVisionModel {
    provider: Arc<dyn LLMProvider>,
    model: String,
    temperature: f32,
    max_tokens: usize,
}

impl LlmVisionModel {
    pub fn new(provider: Arc<dyn LLMProvider>, config: &RunConfig) -> Self {
        Self {
            provider,
            model: config.model_or_default().to_string(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
        }
    }

    /// Resolve the provider from `config` and the environment.
    pub fn from_config(config: &RunConfig) -> Result<Self, TablesError> {
        let provider = resolve_provider(config)?;
        Ok(Self::new(provider, config))
    }

    fn options(&self) -> CompletionOptions {
        CompletionOptions {
            temperature: Some(self.temperature),
            max_tokens: Some(self.max_tokens),
            ..Default::default()
        }
    }
}

#[async_trait]
impl VisionModel for LlmVisionModel {
    fn name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, request: &VisionRequest) -> Result<ModelReply, ModelError> {
        let messages = build_messages(request);
        let response = self
            .provider
            .chat(&messages, Some(&self.options()))
            .await
            .map_err(|e| ModelError::Request(e.to_string()))?;

        debug!(
            "{}: {} input tokens, {} output tokens",
            self.model, response.prompt_tokens, response.completion_tokens
        );

        if response.content.trim().is_empty() {
            return Err(ModelError::EmptyResponse);
        }

        Ok(ModelReply {
            content: response.content,
            input_tokens: response.prompt_tokens as u64,
            output_tokens: response.completion_tokens as u64,
        })
    }
}

fn build_messages(request: &VisionRequest) -> Vec<ChatMessage> {
    let mut messages = vec![ChatMessage::system(request.system.as_str())];

    let text = format!("{}\n\n{}", request.instruction, request.prompt);
    messages.push(ChatMessage::user_with_images(
        text.as_str(),
        vec![ImageData::from_url(request.image_url.as_str()).with_detail("high")],
    ));

    if let Some(ref feedback) = request.feedback {
        messages.push(ChatMessage::user(feedback.as_str()));
    }

    messages
}

// ── Scripted model ───────────────────────────────────────────────────────

/// Deterministic [`VisionModel`] that replays canned answers without any
/// network calls.
///
/// Replies are served from per-URL routes first, then from the queue in
/// order, then from the fallback. Every request is recorded.
///
/// ```
/// use edgequake_tables::pipeline::llm::{ModelError, ScriptedModel};
///
/// let model = ScriptedModel::new([
///     Err(ModelError::Request("HTTP 503".into())),
///     Ok(r#"{"tables": []}"#.to_string()),
/// ]);
/// assert_eq!(model.call_count(), 0);
/// ```
#[derive(Default)]
pub struct ScriptedModel {
    queue: Mutex<VecDeque<Result<String, ModelError>>>,
    routes: HashMap<String, String>,
    fallback: Option<String>,
    delay: Option<Duration>,
    requests: Mutex<Vec<VisionRequest>>,
}

impl ScriptedModel {
    /// Serve `replies` in order.
    pub fn new(replies: impl IntoIterator<Item = Result<String, ModelError>>) -> Self {
        Self {
            queue: Mutex::new(replies.into_iter().collect()),
            ..Default::default()
        }
    }

    /// Answer every request with `reply`.
    pub fn always(reply: impl Into<String>) -> Self {
        Self {
            fallback: Some(reply.into()),
            ..Default::default()
        }
    }

    /// Answer requests for `image_url` with `reply`.
    pub fn with_route(mut self, image_url: impl Into<String>, reply: impl Into<String>) -> Self {
        self.routes.insert(image_url.into(), reply.into());
        self
    }

    /// Sleep before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Every request received so far, in arrival order.
    pub fn requests(&self) -> Vec<VisionRequest> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[async_trait]
impl VisionModel for ScriptedModel {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, request: &VisionRequest) -> Result<ModelReply, ModelError> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(request.clone());

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let content = if let Some(reply) = self.routes.get(&request.image_url) {
            Ok(reply.clone())
        } else {
            let queued = self
                .queue
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .pop_front();
            match (queued, &self.fallback) {
                (Some(reply), _) => reply,
                (None, Some(fallback)) => Ok(fallback.clone()),
                (None, None) => Err(ModelError::Request("script exhausted".into())),
            }
        }?;

        Ok(ModelReply {
            input_tokens: (request.instruction.len() + request.prompt.len()) as u64 / 4,
            output_tokens: content.len() as u64 / 4,
            content,
        })
    }
}

// ── Provider resolution ──────────────────────────────────────────────────

fn create_vision_provider(
    provider_name: &str,
    model: &str,
) -> Result<Arc<dyn LLMProvider>, TablesError> {
    ProviderFactory::create_llm_provider(provider_name, model).map_err(|e| {
        TablesError::ProviderNotConfigured {
            provider: provider_name.to_string(),
            hint: format!("{e}"),
        }
    })
}

/// Resolve the LLM provider, from most-specific to least-specific:
///
/// 1. **Pre-built provider** (`config.provider`), used as-is
/// 2. **Named provider** (`config.provider_name`) with `config.model`
/// 3. **Environment pair** `EDGEQUAKE_LLM_PROVIDER` + `EDGEQUAKE_MODEL`
/// 4. **OpenAI** when `OPENAI_API_KEY` is set
/// 5. **Full auto-detection** via `ProviderFactory::from_env`
pub fn resolve_provider(config: &RunConfig) -> Result<Arc<dyn LLMProvider>, TablesError> {
    if let Some(ref provider) = config.provider {
        return Ok(Arc::clone(provider));
    }

    if let Some(ref name) = config.provider_name {
        return create_vision_provider(name, config.model_or_default());
    }

    if let (Ok(prov), Ok(model)) = (
        std::env::var("EDGEQUAKE_LLM_PROVIDER"),
        std::env::var("EDGEQUAKE_MODEL"),
    ) {
        if !prov.is_empty() && !model.is_empty() {
            return create_vision_provider(&prov, &model);
        }
    }

    if let Ok(openai_key) = std::env::var("OPENAI_API_KEY") {
        if !openai_key.is_empty() {
            return create_vision_provider("openai", config.model_or_default());
        }
    }

    let (llm_provider, _embedding) =
        ProviderFactory::from_env().map_err(|e| TablesError::ProviderNotConfigured {
            provider: "auto".to_string(),
            hint: format!(
                "No LLM provider could be auto-detected from environment.\n\
                Set OPENAI_API_KEY, ANTHROPIC_API_KEY, or configure a provider.\n\
                Error: {}",
                e
            ),
        })?;

    Ok(llm_provider)
}
