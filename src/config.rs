//! Configuration types for table-extraction runs.
//!
//! Two layers, built at different times:
//!
//! * [`RunConfig`] — process-level settings (model, retry policy,
//!   concurrency, billing rate). Built once at startup via
//!   [`RunConfig::builder()`] and shared by every run.
//! * [`RunParams`] — what the user chose for this particular run (prompt,
//!   output format, page range). Deserialisable straight from the platform's
//!   JSON payload.
//!
//! Keeping them apart means the extraction code takes its inputs as plain
//! parameters instead of closing over per-run state.

use crate::error::TablesError;
use crate::progress::ProgressCallback;
use edgequake_llm::LLMProvider;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::RangeInclusive;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

/// Model used when neither the config nor the environment names one.
pub const DEFAULT_MODEL: &str = "gpt-4o";

/// Process-level configuration shared by every run.
///
/// # Example
/// ```rust
/// use edgequake_tables::RunConfig;
///
/// let config = RunConfig::builder()
///     .model("gpt-4o")
///     .concurrency(4)
///     .build()
///     .unwrap();
/// assert_eq!(config.retry.max_attempts, 6);
/// ```
#[derive(Clone)]
pub struct RunConfig {
    /// LLM model identifier. If None, uses [`DEFAULT_MODEL`] or `EDGEQUAKE_MODEL`.
    pub model: Option<String>,

    /// LLM provider name (e.g. "openai", "anthropic").
    /// If None along with `provider`, the provider is auto-detected from the environment.
    pub provider_name: Option<String>,

    /// Pre-constructed LLM provider. Takes precedence over `provider_name`.
    pub provider: Option<Arc<dyn LLMProvider>>,

    /// Sampling temperature. Default: 0.1.
    ///
    /// Transcribing numbers out of an image wants the model to be faithful,
    /// not creative.
    pub temperature: f32,

    /// Maximum tokens the model may generate per page. Default: 4000.
    pub max_tokens: usize,

    /// Retry policy for a single page. Default: 6 attempts, jittered
    /// exponential backoff between 1 s and 60 s.
    pub retry: RetryPolicy,

    /// Per-call timeout in seconds. Default: 0, no timeout; a call is bounded
    /// only by the provider. When set, a timeout counts as a failed attempt
    /// and is retried like any transient error.
    pub api_timeout_secs: u64,

    /// Pages of one document extracted concurrently. Default: 1.
    ///
    /// Results are always appended in page order regardless of this value.
    pub concurrency: usize,

    /// AI credits charged per effective page. Default: 7.
    pub credits_per_page: u64,

    /// File name of the uploaded archive. Default: `all_tables.zip`.
    pub archive_name: String,

    /// What happens to completed work when a page fails. Default: [`FailurePolicy::Abort`].
    pub failure_policy: FailurePolicy,

    /// Directory for per-document artifacts and the archive.
    /// If None, a temporary directory is created per run and removed afterwards.
    pub work_dir: Option<PathBuf>,

    /// Receives per-document and per-page events.
    pub progress_callback: Option<ProgressCallback>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            model: None,
            provider_name: None,
            provider: None,
            temperature: 0.1,
            max_tokens: 4000,
            retry: RetryPolicy::default(),
            api_timeout_secs: 0,
            concurrency: 1,
            credits_per_page: 7,
            archive_name: "all_tables.zip".to_string(),
            failure_policy: FailurePolicy::default(),
            work_dir: None,
            progress_callback: None,
        }
    }
}

impl fmt::Debug for RunConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunConfig")
            .field("model", &self.model)
            .field("provider_name", &self.provider_name)
            .field("provider", &self.provider.as_ref().map(|_| "<dyn LLMProvider>"))
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("retry", &self.retry)
            .field("api_timeout_secs", &self.api_timeout_secs)
            .field("concurrency", &self.concurrency)
            .field("credits_per_page", &self.credits_per_page)
            .field("archive_name", &self.archive_name)
            .field("failure_policy", &self.failure_policy)
            .field("work_dir", &self.work_dir)
            .finish()
    }
}

impl RunConfig {
    /// Create a new builder for `RunConfig`.
    pub fn builder() -> RunConfigBuilder {
        RunConfigBuilder {
            config: Self::default(),
        }
    }

    /// Model name after applying the default.
    pub fn model_or_default(&self) -> &str {
        self.model.as_deref().unwrap_or(DEFAULT_MODEL)
    }
}

/// Builder for [`RunConfig`].
#[derive(Debug)]
pub struct RunConfigBuilder {
    config: RunConfig,
}

impl RunConfigBuilder {
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

    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.config.retry = policy;
        self
    }

    pub fn max_attempts(mut self, n: u32) -> Self {
        self.config.retry.max_attempts = n;
        self
    }

    pub fn api_timeout_secs(mut self, secs: u64) -> Self {
        self.config.api_timeout_secs = secs;
        self
    }

    pub fn concurrency(mut self, n: usize) -> Self {
        self.config.concurrency = n;
        self
    }

    pub fn credits_per_page(mut self, credits: u64) -> Self {
        self.config.credits_per_page = credits;
        self
    }

    pub fn archive_name(mut self, name: impl Into<String>) -> Self {
        self.config.archive_name = name.into();
        self
    }

    pub fn failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.config.failure_policy = policy;
        self
    }

    pub fn work_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.work_dir = Some(dir.into());
        self
    }

    pub fn progress_callback(mut self, cb: ProgressCallback) -> Self {
        self.config.progress_callback = Some(cb);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<RunConfig, TablesError> {
        let c = &self.config;
        if c.concurrency == 0 {
            return Err(TablesError::InvalidConfig(
                "Concurrency must be ≥ 1".into(),
            ));
        }
        if c.retry.max_attempts == 0 {
            return Err(TablesError::InvalidConfig(
                "Retry policy needs at least one attempt".into(),
            ));
        }
        if c.retry.min_backoff_ms > c.retry.max_backoff_ms {
            return Err(TablesError::InvalidConfig(format!(
                "Backoff floor {}ms exceeds ceiling {}ms",
                c.retry.min_backoff_ms, c.retry.max_backoff_ms
            )));
        }
        if c.credits_per_page == 0 {
            return Err(TablesError::InvalidConfig(
                "Credits per page must be ≥ 1".into(),
            ));
        }
        if c.archive_name.trim().is_empty() {
            return Err(TablesError::InvalidConfig(
                "Archive name must not be empty".into(),
            ));
        }
        Ok(self.config)
    }
}

// ── Retry policy ─────────────────────────────────────────────────────────

/// Bounded retry with randomized exponential backoff.
///
/// After the n-th failed attempt the wait is drawn uniformly from
/// `[min, clamp(min · 2^(n-1), min, max)]`: 1 s, then up to 2 s, 4 s, 8 s, …
/// capped at 60 s. Jitter keeps concurrent pages from retrying in lockstep
/// against a rate-limited endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts per page, including the first. Default: 6.
    pub max_attempts: u32,
    /// Backoff floor and exponential base, in milliseconds. Default: 1000.
    pub min_backoff_ms: u64,
    /// Backoff ceiling in milliseconds. Default: 60000.
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 6,
            min_backoff_ms: 1_000,
            max_backoff_ms: 60_000,
        }
    }
}

impl RetryPolicy {
    /// A policy that retries without waiting. Useful in tests.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            min_backoff_ms: 0,
            max_backoff_ms: 0,
        }
    }

    /// Upper bound of the wait after `failed_attempts` failures (1-based).
    pub fn backoff_ceiling(&self, failed_attempts: u32) -> Duration {
        let exp = failed_attempts.saturating_sub(1).min(63);
        let ms = self
            .min_backoff_ms
            .saturating_mul(1u64 << exp)
            .clamp(self.min_backoff_ms, self.max_backoff_ms.max(self.min_backoff_ms));
        Duration::from_millis(ms)
    }

    /// Draw the jittered wait after `failed_attempts` failures.
    pub fn backoff<R: Rng + ?Sized>(&self, failed_attempts: u32, rng: &mut R) -> Duration {
        let high = self.backoff_ceiling(failed_attempts).as_millis() as u64;
        let low = self.min_backoff_ms.min(high);
        Duration::from_millis(rng.gen_range(low..=high))
    }
}

// ── Enums ────────────────────────────────────────────────────────────────

/// Serialisation used for per-document artifacts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Page markers, captions and raw cell rows; no header rows. (default)
    #[default]
    Csv,
    /// Page markers followed by column-major JSON arrays.
    Json,
}

impl OutputFormat {
    /// File extension without the dot.
    pub fn extension(self) -> &'static str {
        match self {
            OutputFormat::Csv => "csv",
            OutputFormat::Json => "json",
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

impl FromStr for OutputFormat {
    type Err = TablesError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "csv" => Ok(OutputFormat::Csv),
            "json" => Ok(OutputFormat::Json),
            other => Err(TablesError::InvalidConfig(format!(
                "Unknown output format '{other}' (expected csv or json)"
            ))),
        }
    }
}

/// What to do with completed work when a page fails after every retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Stop the run and upload nothing. (default)
    #[default]
    Abort,
    /// Drop the failed document's partial artifact, skip the remaining
    /// documents, and upload the documents that completed.
    UploadCompleted,
}

// ── Per-run parameters ───────────────────────────────────────────────────

/// Parameters chosen by the user for one run.
///
/// Field names match the platform's JSON payload, so
/// `serde_json::from_str::<RunParams>(payload)` works directly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunParams {
    /// Extra extraction instructions, placed before the fixed instruction block.
    pub prompt: String,
    pub output_format: OutputFormat,
    /// First page to extract (1-indexed). Default: 1.
    pub start_page: u32,
    /// Last page to extract (1-indexed, inclusive). Required.
    pub end_page: Option<u32>,
}

impl Default for RunParams {
    fn default() -> Self {
        Self {
            prompt: String::new(),
            output_format: OutputFormat::default(),
            start_page: 1,
            end_page: None,
        }
    }
}

impl RunParams {
    /// Check the page range and return it.
    pub fn page_range(&self) -> Result<PageRange, TablesError> {
        let end = self.end_page.ok_or(TablesError::MissingEndPage)?;
        PageRange::new(self.start_page, end)
    }
}

/// Requested inclusive page range, before clamping to a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRange {
    start: u32,
    end: u32,
}

impl PageRange {
    pub fn new(start: u32, end: u32) -> Result<Self, TablesError> {
        if end < start {
            return Err(TablesError::InvalidPageRange { start, end });
        }
        if start < 1 {
            return Err(TablesError::InvalidStartPage { start });
        }
        Ok(Self { start, end })
    }

    pub fn start(&self) -> u32 {
        self.start
    }

    pub fn end(&self) -> u32 {
        self.end
    }

    /// The effective range for a document with `page_count` pages.
    ///
    /// `end` is clamped to the last page. Returns `None` when the document
    /// ends before `start`.
    pub fn for_document(&self, page_count: u32) -> Option<RangeInclusive<u32>> {
        let last = self.end.min(page_count);
        (last >= self.start).then_some(self.start..=last)
    }

    /// Number of pages [`for_document`](Self::for_document) yields.
    pub fn effective_pages(&self, page_count: u32) -> u32 {
        self.for_document(page_count)
            .map_or(0, |r| r.end() - r.start() + 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn defaults() {
        let c = RunConfig::default();
        assert_eq!(c.retry, RetryPolicy::default());
        assert_eq!(c.retry.max_attempts, 6);
        assert_eq!(c.credits_per_page, 7);
        assert_eq!(c.archive_name, "all_tables.zip");
        assert_eq!(c.api_timeout_secs, 0);
        assert_eq!(c.model_or_default(), DEFAULT_MODEL);
    }

    #[test]
    fn build_rejects_zero_concurrency() {
        assert!(RunConfig::builder().concurrency(0).build().is_err());
    }

    #[test]
    fn build_rejects_inverted_backoff() {
        let policy = RetryPolicy {
            max_attempts: 3,
            min_backoff_ms: 5_000,
            max_backoff_ms: 1_000,
        };
        assert!(RunConfig::builder().retry(policy).build().is_err());
    }

    #[test]
    fn backoff_ceiling_doubles_then_caps() {
        let p = RetryPolicy::default();
        assert_eq!(p.backoff_ceiling(1), Duration::from_secs(1));
        assert_eq!(p.backoff_ceiling(2), Duration::from_secs(2));
        assert_eq!(p.backoff_ceiling(5), Duration::from_secs(16));
        assert_eq!(p.backoff_ceiling(7), Duration::from_secs(60));
        assert_eq!(p.backoff_ceiling(200), Duration::from_secs(60));
    }

    #[test]
    fn backoff_is_jittered_within_bounds() {
        let p = RetryPolicy::default();
        let mut rng = StdRng::seed_from_u64(7);
        let draws: Vec<Duration> = (0..50).map(|_| p.backoff(4, &mut rng)).collect();
        assert!(draws
            .iter()
            .all(|d| *d >= Duration::from_secs(1) && *d <= Duration::from_secs(8)));
        assert!(draws.iter().any(|d| *d != draws[0]), "expected jitter");
    }

    #[test]
    fn immediate_policy_never_waits() {
        let p = RetryPolicy::immediate(3);
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(p.backoff(3, &mut rng), Duration::ZERO);
    }

    #[test]
    fn params_from_platform_json() {
        let p: RunParams =
            serde_json::from_str(r#"{"prompt": "budgets", "output_format": "json", "end_page": 4}"#)
                .unwrap();
        assert_eq!(p.output_format, OutputFormat::Json);
        assert_eq!(p.start_page, 1);
        assert_eq!(p.page_range().unwrap().end(), 4);
    }

    #[test]
    fn params_require_end_page() {
        let p = RunParams::default();
        assert!(matches!(p.page_range(), Err(TablesError::MissingEndPage)));
    }

    #[test]
    fn range_rejects_end_before_start() {
        assert!(matches!(
            PageRange::new(5, 2),
            Err(TablesError::InvalidPageRange { start: 5, end: 2 })
        ));
        assert!(matches!(
            PageRange::new(0, 2),
            Err(TablesError::InvalidStartPage { start: 0 })
        ));
    }

    #[test]
    fn range_clamps_to_document() {
        let r = PageRange::new(2, 5).unwrap();
        assert_eq!(r.for_document(10), Some(2..=5));
        assert_eq!(r.for_document(3), Some(2..=3));
        assert_eq!(r.effective_pages(10), 4);
        assert_eq!(r.effective_pages(3), 2);
    }

    #[test]
    fn range_beyond_short_document_is_empty() {
        let r = PageRange::new(4, 9).unwrap();
        assert_eq!(r.for_document(3), None);
        assert_eq!(r.effective_pages(3), 0);
    }

    #[test]
    fn output_format_parses() {
        assert_eq!("CSV".parse::<OutputFormat>().unwrap(), OutputFormat::Csv);
        assert_eq!("json".parse::<OutputFormat>().unwrap().extension(), "json");
        assert!("xlsx".parse::<OutputFormat>().is_err());
    }
}
