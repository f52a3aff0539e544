//! Page extraction: one validated [`MultipleTables`] per page image.
//!
//! [`ExtractionClient`] owns the retry loop. Every attempt is a single
//! [`VisionModel`] round trip wrapped in a timeout; the raw text is run
//! through [`validate_response`]. Transport failures, empty answers,
//! timeouts and schema violations are all retried alike, with jittered
//! exponential backoff from [`RetryPolicy`].
//!
//! A schema violation additionally changes the next request: the validation
//! error is sent back as a corrective message so the model can fix its
//! answer instead of repeating it.
//!
//! Nothing is cached. Two pages with the same image URL cost two round trips.

use crate::config::{RetryPolicy, RunConfig};
use crate::pipeline::llm::{ModelError, ModelReply, VisionModel, VisionRequest};
use crate::progress::ProgressCallback;
use crate::prompts;
use crate::schema::{validate_response, MultipleTables, SchemaError, Table};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

/// Tables found on one page, plus what it took to get them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtractionResult {
    /// Zero or more tables, in the order the model emitted them.
    pub tables: Vec<Table>,
    /// Attempts used, including the successful one.
    pub attempts: u32,
    /// Tokens summed over every attempt.
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// Why one attempt failed. Every variant is retryable.
#[derive(Debug, Error)]
pub enum AttemptError {
    #[error(transparent)]
    Model(#[from] ModelError),

    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error("model call timed out after {secs}s")]
    Timeout { secs: u64 },
}

/// A page that could not be extracted within the retry budget.
#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("gave up after {attempts} attempts; last error: {last}")]
    Exhausted { attempts: u32, last: AttemptError },
}

impl ExtractionError {
    pub fn attempts(&self) -> u32 {
        match self {
            ExtractionError::Exhausted { attempts, .. } => *attempts,
        }
    }
}

/// Sends page images to a [`VisionModel`] and returns validated tables.
///
/// Built once per run; the prompt and instruction text are fixed at
/// construction.
pub struct ExtractionClient {
    model: Arc<dyn VisionModel>,
    system: String,
    instruction: String,
    prompt: String,
    retry: RetryPolicy,
    call_timeout: Option<Duration>,
    progress: Option<ProgressCallback>,
}

impl ExtractionClient {
    /// `user_prompt` is the caller's extraction prompt; the fixed instruction
    /// block is appended to it.
    pub fn new(model: Arc<dyn VisionModel>, user_prompt: &str, config: &RunConfig) -> Self {
        let call_timeout =
            (config.api_timeout_secs > 0).then(|| Duration::from_secs(config.api_timeout_secs));
        Self {
            model,
            system: prompts::schema_system_prompt(),
            instruction: prompts::task_instruction(),
            prompt: prompts::final_prompt(user_prompt),
            retry: config.retry,
            call_timeout,
            progress: config.progress_callback.clone(),
        }
    }

    /// Override the per-call timeout. `None` waits indefinitely.
    pub fn with_timeout(mut self, call_timeout: Option<Duration>) -> Self {
        self.call_timeout = call_timeout;
        self
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Extract the tables from one page image.
    pub async fn extract(&self, image_url: &str) -> Result<ExtractionResult, ExtractionError> {
        self.run_attempts(image_url, None).await
    }

    /// Like [`extract`](Self::extract), but retries are logged and reported
    /// against `document` / `page`.
    pub async fn extract_page(
        &self,
        document: &str,
        page: u32,
        image_url: &str,
    ) -> Result<ExtractionResult, ExtractionError> {
        self.run_attempts(image_url, Some((document, page))).await
    }

    fn request(&self, image_url: &str) -> VisionRequest {
        VisionRequest {
            system: self.system.clone(),
            instruction: self.instruction.clone(),
            image_url: image_url.to_string(),
            prompt: self.prompt.clone(),
            feedback: None,
        }
    }

    async fn run_attempts(
        &self,
        image_url: &str,
        label: Option<(&str, u32)>,
    ) -> Result<ExtractionResult, ExtractionError> {
        let max_attempts = self.retry.max_attempts.max(1);
        let mut request = self.request(image_url);
        let mut input_tokens = 0u64;
        let mut output_tokens = 0u64;
        let mut attempt = 0u32;

        loop {
            attempt += 1;

            let outcome = match self.call_model(&request).await {
                Ok(reply) => {
                    input_tokens += reply.input_tokens;
                    output_tokens += reply.output_tokens;
                    validate_response(&reply.content).map_err(AttemptError::from)
                }
                Err(e) => Err(e),
            };

            let err = match outcome {
                Ok(MultipleTables { tables }) => {
                    debug!(
                        "{}: {} tables after {} attempt(s)",
                        describe(label, image_url),
                        tables.len(),
                        attempt
                    );
                    return Ok(ExtractionResult {
                        tables,
                        attempts: attempt,
                        input_tokens,
                        output_tokens,
                    });
                }
                Err(e) => e,
            };

            if attempt >= max_attempts {
                warn!(
                    "{}: attempt {} failed, giving up: {}",
                    describe(label, image_url),
                    attempt,
                    err
                );
                return Err(ExtractionError::Exhausted {
                    attempts: attempt,
                    last: err,
                });
            }

            request.feedback = match err {
                AttemptError::Schema(ref schema_err) => {
                    Some(prompts::reask_message(&schema_err.to_string()))
                }
                _ => None,
            };

            let backoff = self.retry.backoff(attempt, &mut rand::thread_rng());
            warn!(
                "{}: attempt {}/{} failed ({}), retrying in {}ms",
                describe(label, image_url),
                attempt,
                max_attempts,
                err,
                backoff.as_millis()
            );
            if let (Some(cb), Some((document, page))) = (&self.progress, label) {
                cb.on_page_retry(document, page, attempt, &err.to_string());
            }
            sleep(backoff).await;
        }
    }

    async fn call_model(
        &self,
        request: &VisionRequest,
    ) -> Result<ModelReply, AttemptError> {
        match self.call_timeout {
            Some(limit) => match timeout(limit, self.model.complete(request)).await {
                Ok(reply) => reply.map_err(AttemptError::from),
                Err(_) => Err(AttemptError::Timeout {
                    secs: limit.as_secs(),
                }),
            },
            None => self.model.complete(request).await.map_err(AttemptError::from),
        }
    }
}

fn describe(label: Option<(&str, u32)>, image_url: &str) -> String {
    match label {
        Some((document, page)) => format!("Document {document} page {page}"),
        None => image_url.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::llm::ScriptedModel;
    use crate::progress::RunProgressCallback;
    use std::sync::atomic::{AtomicU32, Ordering};

    const ONE_TABLE: &str = r#"```json
{"tables": [{"caption": "Budget", "dataframe": "| Year | Amount |\n|---|---|\n| 2020 | 10 |"}]}
```"#;

    fn config(attempts: u32) -> RunConfig {
        RunConfig::builder()
            .retry(RetryPolicy::immediate(attempts))
            .build()
            .unwrap()
    }

    fn client(model: Arc<ScriptedModel>, attempts: u32) -> ExtractionClient {
        ExtractionClient::new(model, "Find the budget.", &config(attempts))
    }

    #[tokio::test]
    async fn first_attempt_success() {
        let model = Arc::new(ScriptedModel::always(ONE_TABLE));
        let result = client(model.clone(), 6).extract("https://img/p1").await.unwrap();

        assert_eq!(result.attempts, 1);
        assert_eq!(result.tables.len(), 1);
        assert_eq!(result.tables[0].caption, "Budget");
        assert_eq!(result.tables[0].dataframe.column("Amount"), Some(vec!["10"]));
        assert_eq!(model.call_count(), 1);
    }

    #[tokio::test]
    async fn request_carries_prompt_and_image() {
        let model = Arc::new(ScriptedModel::always(ONE_TABLE));
        client(model.clone(), 1).extract("https://img/p9").await.unwrap();

        let sent = &model.requests()[0];
        assert_eq!(sent.image_url, "https://img/p9");
        assert!(sent.prompt.starts_with("Find the budget.\n"));
        assert!(sent.instruction.contains("This is a caption"));
        assert!(sent.feedback.is_none());
    }

    #[tokio::test]
    async fn empty_table_list_is_success() {
        let model = Arc::new(ScriptedModel::always(r#"{"tables": []}"#));
        let result = client(model, 6).extract("https://img/p1").await.unwrap();
        assert!(result.tables.is_empty());
        assert_eq!(result.attempts, 1);
    }

    #[tokio::test]
    async fn schema_failure_is_reasked_with_feedback() {
        let model = Arc::new(ScriptedModel::new([
            Ok(r#"{"tables": [{"caption": "  ", "dataframe": "| a |\n|---|\n| 1 |"}]}"#.into()),
            Ok(ONE_TABLE.into()),
        ]));
        let result = client(model.clone(), 6).extract("https://img/p1").await.unwrap();

        assert_eq!(result.attempts, 2);
        let requests = model.requests();
        assert!(requests[0].feedback.is_none());
        let feedback = requests[1].feedback.as_deref().unwrap();
        assert!(feedback.contains("empty caption"), "got: {feedback}");
    }

    #[tokio::test]
    async fn transport_failure_retries_without_feedback() {
        let model = Arc::new(ScriptedModel::new([
            Err(ModelError::Request("HTTP 503".into())),
            Ok(ONE_TABLE.into()),
        ]));
        let result = client(model.clone(), 6).extract("https://img/p1").await.unwrap();

        assert_eq!(result.attempts, 2);
        assert!(model.requests()[1].feedback.is_none());
    }

    #[tokio::test]
    async fn sixth_attempt_may_still_succeed() {
        let mut script: Vec<Result<String, ModelError>> =
            (0..5).map(|_| Err(ModelError::EmptyResponse)).collect();
        script.push(Ok(ONE_TABLE.into()));
        let model = Arc::new(ScriptedModel::new(script));

        let result = client(model, 6).extract("https://img/p1").await.unwrap();
        assert_eq!(result.attempts, 6);
    }

    #[tokio::test]
    async fn exhausted_after_budget() {
        let model = Arc::new(ScriptedModel::always("I could not find any tables."));
        let err = client(model.clone(), 6)
            .extract("https://img/p1")
            .await
            .unwrap_err();

        assert_eq!(model.call_count(), 6);
        assert_eq!(err.attempts(), 6);
        let ExtractionError::Exhausted { last, .. } = err;
        assert!(matches!(last, AttemptError::Schema(SchemaError::NoJsonObject)));
    }

    #[tokio::test]
    async fn tokens_accumulate_across_attempts() {
        let model = Arc::new(ScriptedModel::new([
            Ok("not json".into()),
            Ok(ONE_TABLE.into()),
        ]));
        let result = client(model, 6).extract("https://img/p1").await.unwrap();
        assert!(result.output_tokens >= (ONE_TABLE.len() as u64) / 4);
        assert!(result.input_tokens > 0);
    }

    #[tokio::test]
    async fn slow_model_times_out() {
        let model = Arc::new(
            ScriptedModel::always(ONE_TABLE).with_delay(Duration::from_millis(200)),
        );
        let err = client(model.clone(), 2)
            .with_timeout(Some(Duration::from_millis(10)))
            .extract("https://img/p1")
            .await
            .unwrap_err();

        assert_eq!(model.call_count(), 2);
        let ExtractionError::Exhausted { last, .. } = err;
        assert!(matches!(last, AttemptError::Timeout { .. }));
    }

    #[tokio::test]
    async fn default_config_sets_no_call_timeout() {
        let model = Arc::new(
            ScriptedModel::always(ONE_TABLE).with_delay(Duration::from_millis(50)),
        );
        let client = client(model.clone(), 1);
        assert!(client.call_timeout.is_none());

        let result = client.extract("https://img/p1").await.unwrap();
        assert_eq!(result.attempts, 1);
        assert_eq!(model.call_count(), 1);
    }

    #[test]
    fn positive_api_timeout_becomes_call_timeout() {
        let config = RunConfig::builder().api_timeout_secs(30).build().unwrap();
        let client = ExtractionClient::new(Arc::new(ScriptedModel::always(ONE_TABLE)), "", &config);
        assert_eq!(client.call_timeout, Some(Duration::from_secs(30)));
    }

    #[derive(Default)]
    struct RetryCounter(AtomicU32);

    impl RunProgressCallback for RetryCounter {
        fn on_page_retry(&self, document: &str, page: u32, _attempt: u32, _error: &str) {
            assert_eq!((document, page), ("42", 3));
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn retries_are_reported_per_page() {
        let counter = Arc::new(RetryCounter::default());
        let config = RunConfig::builder()
            .retry(RetryPolicy::immediate(6))
            .progress_callback(counter.clone())
            .build()
            .unwrap();
        let model = Arc::new(ScriptedModel::new([
            Err(ModelError::EmptyResponse),
            Err(ModelError::EmptyResponse),
            Ok(ONE_TABLE.into()),
        ]));

        let client = ExtractionClient::new(model, "", &config);
        client.extract_page("42", 3, "https://img/p3").await.unwrap();
        assert_eq!(counter.0.load(Ordering::SeqCst), 2);
    }
}
