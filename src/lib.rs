//! # edgequake-tables
//!
//! Extract the tables shown in document page images with Vision Language
//! Models (VLMs), and deliver them as CSV or JSON.
//!
//! ## Why this crate?
//!
//! A VLM can read a scanned budget or a chart legend far better than any
//! layout heuristic, but what it returns is free text. This crate is the
//! contract layer that makes that text usable: it tells the model exactly
//! which JSON shape to answer with, validates every answer, turns each
//! markdown table into a typed [`DataFrame`], retries with jittered backoff
//! (re-asking with the validation error when the shape was wrong), and
//! appends the result page by page to one artifact per document.
//!
//! ## Pipeline Overview
//!
//! ```text
//! document ids
//!  │
//!  ├─ 1. Validate  documents, organization, page range
//!  ├─ 2. Charge    credits_per_page × effective pages
//!  ├─ 3. Extract   page image URL → VLM → validated tables (retry ≤ 6)
//!  ├─ 4. Append    tables-{id}.csv / tables-{id}.json, page by page
//!  ├─ 5. Package   all_tables.zip
//!  └─ 6. Upload    archive → platform, status message
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use edgequake_tables::{
//!     DocumentCloudClient, LlmVisionModel, Platform, RunConfig, RunOrchestrator, RunParams,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Provider auto-detected from OPENAI_API_KEY / ANTHROPIC_API_KEY / …
//!     let config = RunConfig::builder().build()?;
//!     let model = Arc::new(LlmVisionModel::from_config(&config)?);
//!
//!     let client = DocumentCloudClient::new(
//!         "https://api.www.documentcloud.org/api/",
//!         std::env::var("DC_TOKEN").ok(),
//!     )?
//!     .with_organization("1234");
//!
//!     let params = RunParams {
//!         prompt: "Extract the budget tables.".into(),
//!         end_page: Some(5),
//!         ..Default::default()
//!     };
//!     let orchestrator = RunOrchestrator::new(config, model, Platform::documentcloud(client));
//!     let summary = orchestrator.run(&["20059100".to_string()], &params).await?;
//!     eprintln!("{} tables from {} pages", summary.tables, summary.pages);
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `doctables` binary (clap + anyhow + tracing-subscriber + indicatif) |
//!
//! Disable `cli` when using only the library:
//! ```toml
//! edgequake-tables = { version = "0.1", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod config;
pub mod error;
pub mod pipeline;
pub mod platform;
pub mod progress;
pub mod prompts;
pub mod run;
pub mod schema;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{
    FailurePolicy, OutputFormat, PageRange, RetryPolicy, RunConfig, RunConfigBuilder, RunParams,
};
pub use error::{ErrorKind, PlatformError, TablesError};
pub use pipeline::extract::{AttemptError, ExtractionClient, ExtractionError, ExtractionResult};
pub use pipeline::llm::{LlmVisionModel, ScriptedModel, VisionModel, VisionRequest};
pub use pipeline::markdown::{parse_markdown_table, DataFrame, TableParseError};
pub use pipeline::writer::{CsvTableWriter, JsonTableWriter, ResultAccumulator, TabularWriter};
pub use platform::documentcloud::DocumentCloudClient;
pub use platform::{
    CreditLedger, DocumentSource, LocalUploader, LogReporter, RunReporter, SourceDocument,
    StaticDocument, Uploader,
};
pub use progress::{NoopProgressCallback, ProgressCallback, RunProgressCallback};
pub use run::{compute_cost, Platform, RunOrchestrator, RunSummary};
pub use schema::{validate_response, MultipleTables, SchemaError, Table};
