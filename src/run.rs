//! Run orchestration: validate → charge → extract/accumulate → package → upload.
//!
//! [`RunOrchestrator::run`] is the add-on entry point. It owns the run's
//! scratch directory and the per-document artifacts, and it is the only
//! place that talks to every collaborator.
//!
//! ## Failure handling
//!
//! Configuration and billing errors stop the run before any model call and
//! before anything is charged (configuration) or extracted (billing). A page
//! that still fails after the retry budget is handled per
//! [`FailurePolicy`]:
//!
//! * `Abort` — nothing is uploaded.
//! * `UploadCompleted` — the failed document's partial artifact is deleted,
//!   remaining documents are skipped, finished documents are uploaded, and
//!   the extraction error is still returned.
//!
//! Either way the error's message becomes the run's status message.

use crate::config::{FailurePolicy, PageRange, RunConfig, RunParams};
use crate::error::{PlatformError, TablesError};
use crate::pipeline::archive::build_archive;
use crate::pipeline::extract::ExtractionClient;
use crate::pipeline::llm::VisionModel;
use crate::pipeline::writer::ResultAccumulator;
use crate::platform::documentcloud::DocumentCloudClient;
use crate::platform::{CreditLedger, DocumentSource, RunReporter, SourceDocument, Uploader};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::collections::HashSet;
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tempfile::TempDir;
use tracing::{debug, info, warn};

/// The platform collaborators a run needs.
#[derive(Clone)]
pub struct Platform {
    pub documents: Arc<dyn DocumentSource>,
    pub ledger: Arc<dyn CreditLedger>,
    pub uploader: Arc<dyn Uploader>,
    pub reporter: Arc<dyn RunReporter>,
}

impl Platform {
    /// Every collaborator served by one DocumentCloud client.
    pub fn documentcloud(client: DocumentCloudClient) -> Self {
        let client = Arc::new(client);
        Self {
            documents: client.clone(),
            ledger: client.clone(),
            uploader: client.clone(),
            reporter: client,
        }
    }

    /// Replace the uploader, keeping everything else.
    pub fn with_uploader(mut self, uploader: Arc<dyn Uploader>) -> Self {
        self.uploader = uploader;
        self
    }
}

/// What a successful run did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    /// Documents with an artifact in the archive.
    pub documents: usize,
    /// Pages extracted.
    pub pages: u32,
    /// Tables found across all pages.
    pub tables: usize,
    /// Model attempts, retries included.
    pub attempts: u32,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub credits_charged: u64,
    /// File name of the uploaded archive.
    pub archive: String,
    pub uploaded: bool,
    pub duration_ms: u64,
}

/// Credits for a run: `credits_per_page` × effective pages over all documents.
///
/// ```
/// use edgequake_tables::{run::compute_cost, PageRange};
///
/// let range = PageRange::new(2, 5).unwrap();
/// assert_eq!(compute_cost([10, 3], &range, 7), 42);
/// ```
pub fn compute_cost(
    page_counts: impl IntoIterator<Item = u32>,
    range: &PageRange,
    credits_per_page: u64,
) -> u64 {
    page_counts
        .into_iter()
        .map(|count| u64::from(range.effective_pages(count)))
        .sum::<u64>()
        * credits_per_page
}

/// Drives one add-on run.
pub struct RunOrchestrator {
    config: RunConfig,
    model: Arc<dyn VisionModel>,
    platform: Platform,
}

impl RunOrchestrator {
    pub fn new(config: RunConfig, model: Arc<dyn VisionModel>, platform: Platform) -> Self {
        Self {
            config,
            model,
            platform,
        }
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Run the add-on over `document_ids`.
    ///
    /// The outcome, success or failure, is reported through the platform's
    /// [`RunReporter`] before returning.
    pub async fn run(
        &self,
        document_ids: &[String],
        params: &RunParams,
    ) -> Result<RunSummary, TablesError> {
        let start = Instant::now();
        match self.execute(document_ids, params).await {
            Ok(mut summary) => {
                summary.duration_ms = start.elapsed().as_millis() as u64;
                self.report(&format!(
                    "Extracted {} tables from {} pages across {} documents.",
                    summary.tables, summary.pages, summary.documents
                ))
                .await;
                Ok(summary)
            }
            Err(err) => {
                warn!("Run failed: {}", err);
                self.report(&err.to_string()).await;
                Err(err)
            }
        }
    }

    async fn report(&self, message: &str) {
        if let Err(e) = self.platform.reporter.set_message(message).await {
            warn!("Could not set run message: {}", e);
        }
    }

    async fn execute(
        &self,
        document_ids: &[String],
        params: &RunParams,
    ) -> Result<RunSummary, TablesError> {
        // ── Validate ─────────────────────────────────────────────────────
        if document_ids.is_empty() {
            return Err(TablesError::NoDocuments);
        }
        if !self.platform.ledger.has_organization() {
            return Err(TablesError::NoOrganization);
        }
        let range = params.page_range()?;
        let ids = unique_ids(document_ids);
        if ids.len() < document_ids.len() {
            info!(
                "Ignoring {} repeated document ids",
                document_ids.len() - ids.len()
            );
        }
        info!(
            "Starting run: {} documents, pages {}-{}, {} output",
            ids.len(),
            range.start(),
            range.end(),
            params.output_format
        );

        let documents = self.fetch_documents(&ids).await?;

        // ── Charge ───────────────────────────────────────────────────────
        let cost = compute_cost(
            documents.iter().map(|d| d.page_count()),
            &range,
            self.config.credits_per_page,
        );
        self.charge(cost).await?;

        let mut summary = RunSummary {
            credits_charged: cost,
            archive: self.config.archive_name.clone(),
            ..Default::default()
        };

        let planned: Vec<(Arc<dyn SourceDocument>, RangeInclusive<u32>)> = documents
            .into_iter()
            .filter_map(|doc| {
                let pages = range.for_document(doc.page_count());
                if pages.is_none() {
                    info!(
                        "Document {} has {} pages, skipping (start page {})",
                        doc.id(),
                        doc.page_count(),
                        range.start()
                    );
                }
                pages.map(|p| (doc, p))
            })
            .collect();

        if let Some(ref cb) = self.config.progress_callback {
            let total: u32 = planned.iter().map(|(_, p)| p.end() - p.start() + 1).sum();
            cb.on_run_start(planned.len(), total);
        }

        // ── Extract / accumulate ─────────────────────────────────────────
        let (_scratch, dir) = self.work_dir()?;
        let client = ExtractionClient::new(Arc::clone(&self.model), &params.prompt, &self.config);
        let mut artifacts: Vec<PathBuf> = Vec::new();
        let mut failure: Option<TablesError> = None;

        for (doc, pages) in &planned {
            let mut acc = ResultAccumulator::for_document(&dir, doc.id(), params.output_format);
            acc.reset()?;
            match self
                .process_document(&client, doc.as_ref(), pages.clone(), &mut acc, &mut summary)
                .await
            {
                Ok(()) => artifacts.push(acc.path().to_path_buf()),
                Err(err) => {
                    if let Err(e) = acc.discard() {
                        warn!("Could not delete partial artifact: {}", e);
                    }
                    match self.config.failure_policy {
                        FailurePolicy::Abort => return Err(err),
                        FailurePolicy::UploadCompleted => {
                            warn!(
                                "Skipping remaining documents; uploading {} completed",
                                artifacts.len()
                            );
                            failure = Some(err);
                            break;
                        }
                    }
                }
            }
        }

        if artifacts.is_empty() {
            if let Some(err) = failure.take() {
                return Err(err);
            }
        }

        // ── Package / upload ─────────────────────────────────────────────
        let archive = build_archive(&archive_path(&dir, &self.config), &artifacts)?;
        self.platform
            .uploader
            .upload(&archive)
            .await
            .map_err(|e| TablesError::UploadFailed {
                detail: e.to_string(),
            })?;
        summary.uploaded = true;
        summary.documents = artifacts.len();
        info!(
            "Uploaded {} ({} documents, {} pages, {} tables)",
            self.config.archive_name, summary.documents, summary.pages, summary.tables
        );

        if let Some(err) = failure {
            return Err(err);
        }

        if let Some(ref cb) = self.config.progress_callback {
            cb.on_run_complete(summary.documents, summary.pages);
        }
        Ok(summary)
    }

    async fn fetch_documents(
        &self,
        ids: &[String],
    ) -> Result<Vec<Arc<dyn SourceDocument>>, TablesError> {
        let mut documents = Vec::with_capacity(ids.len());
        for id in ids {
            let doc = self
                .platform
                .documents
                .fetch_document(id)
                .await
                .map_err(|e| TablesError::DocumentFetchFailed {
                    id: id.clone(),
                    detail: e.to_string(),
                })?;
            documents.push(doc);
        }
        Ok(documents)
    }

    async fn charge(&self, cost: u64) -> Result<(), TablesError> {
        if cost == 0 {
            info!("Nothing to extract, no credits charged");
            return Ok(());
        }
        info!("Charging {} AI credits", cost);
        self.platform
            .ledger
            .charge(cost)
            .await
            .map_err(|e| match e {
                PlatformError::InsufficientCredits => TablesError::InsufficientCredits { cost },
                other => TablesError::BillingFailed {
                    cost,
                    detail: other.to_string(),
                },
            })
    }

    /// Scratch directory for artifacts. The `TempDir` guard, when present,
    /// must outlive every artifact path.
    fn work_dir(&self) -> Result<(Option<TempDir>, PathBuf), TablesError> {
        match self.config.work_dir {
            Some(ref dir) => {
                std::fs::create_dir_all(dir).map_err(|source| TablesError::OutputWriteFailed {
                    path: dir.clone(),
                    source,
                })?;
                Ok((None, dir.clone()))
            }
            None => {
                let temp = TempDir::new().map_err(|e| {
                    TablesError::Internal(format!("cannot create scratch directory: {e}"))
                })?;
                let path = temp.path().to_path_buf();
                debug!("Scratch directory {}", path.display());
                Ok((Some(temp), path))
            }
        }
    }

    /// Extract every page of one document and append it, in page order.
    async fn process_document(
        &self,
        client: &ExtractionClient,
        doc: &dyn SourceDocument,
        pages: RangeInclusive<u32>,
        acc: &mut ResultAccumulator,
        summary: &mut RunSummary,
    ) -> Result<(), TablesError> {
        let id = doc.id();
        let count = pages.end() - pages.start() + 1;
        info!(
            "Document {}: extracting pages {}-{} of {}",
            id,
            pages.start(),
            pages.end(),
            doc.page_count()
        );
        let progress = self.config.progress_callback.as_ref();
        if let Some(cb) = progress {
            cb.on_document_start(id, count);
        }

        // Extraction may overlap; `buffered` yields in page order so the
        // artifact is always appended in ascending page order.
        let mut results = stream::iter(pages)
            .map(move |page| {
                let url = doc.large_image_url(page);
                async move {
                    if let Some(cb) = progress {
                        cb.on_page_start(id, page);
                    }
                    let outcome = client.extract_page(id, page, &url).await;
                    (page, outcome)
                }
            })
            .buffered(self.config.concurrency.max(1));

        while let Some((page, outcome)) = results.next().await {
            match outcome {
                Ok(result) => {
                    acc.push(&result.tables, page)?;
                    summary.pages += 1;
                    summary.tables += result.tables.len();
                    summary.attempts += result.attempts;
                    summary.input_tokens += result.input_tokens;
                    summary.output_tokens += result.output_tokens;
                    info!(
                        "Document {} page {}: {} tables",
                        id,
                        page,
                        result.tables.len()
                    );
                    if let Some(cb) = progress {
                        cb.on_page_complete(id, page, result.tables.len());
                    }
                }
                Err(source) => {
                    summary.attempts += source.attempts();
                    if let Some(cb) = progress {
                        cb.on_page_error(id, page, &source.to_string());
                    }
                    return Err(TablesError::Extraction {
                        document: id.to_string(),
                        page,
                        source,
                    });
                }
            }
        }

        if let Some(cb) = progress {
            cb.on_document_complete(id);
        }
        Ok(())
    }
}

/// `ids` without repeats, first occurrence wins.
///
/// Each document is billed, extracted and archived once per run.
pub fn unique_ids(ids: &[String]) -> Vec<String> {
    let mut seen: HashSet<&str> = HashSet::with_capacity(ids.len());
    let mut unique = Vec::with_capacity(ids.len());
    for id in ids {
        if seen.insert(id.as_str()) {
            unique.push(id.clone());
        }
    }
    unique
}

/// Archive path for a run rooted at `dir`.
pub fn archive_path(dir: &Path, config: &RunConfig) -> PathBuf {
    dir.join(&config.archive_name)
}
