//! Progress-callback trait for per-document and per-page run events.
//!
//! Inject an [`Arc<dyn RunProgressCallback>`] via
//! [`crate::config::RunConfigBuilder::progress_callback`] to receive events as
//! the orchestrator works through the run. The trait is `Send + Sync` because
//! pages of one document may be extracted concurrently.
//!
//! # Example
//!
//! ```rust
//! use edgequake_tables::{RunProgressCallback, RunConfig};
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//!
//! struct TableCounter {
//!     tables: AtomicUsize,
//! }
//!
//! impl RunProgressCallback for TableCounter {
//!     fn on_page_complete(&self, _document: &str, _page: u32, tables_found: usize) {
//!         self.tables.fetch_add(tables_found, Ordering::SeqCst);
//!     }
//! }
//!
//! let counter = Arc::new(TableCounter { tables: AtomicUsize::new(0) });
//!
//! let config = RunConfig::builder()
//!     .progress_callback(counter as Arc<dyn RunProgressCallback>)
//!     .build()
//!     .unwrap();
//! ```

use std::sync::Arc;

/// Called by the orchestrator as it processes a run.
///
/// All methods have default no-op implementations so callers only override
/// what they care about.
///
/// # Thread safety
///
/// With `concurrency > 1`, `on_page_start` and `on_page_retry` may be
/// called concurrently for pages of the same document. `on_page_complete`
/// and `on_page_error` are called one at a time, in page order.
pub trait RunProgressCallback: Send + Sync {
    /// Called once after billing succeeds, before any page is extracted.
    ///
    /// * `documents`   — documents with at least one effective page
    /// * `total_pages` — effective pages across all of them
    fn on_run_start(&self, documents: usize, total_pages: u32) {
        let _ = (documents, total_pages);
    }

    /// Called before the first page of a document.
    fn on_document_start(&self, document: &str, pages: u32) {
        let _ = (document, pages);
    }

    /// Called just before the first model request for a page.
    fn on_page_start(&self, document: &str, page: u32) {
        let _ = (document, page);
    }

    /// Called when an attempt fails and another will follow.
    ///
    /// * `attempt` — 1-based number of the attempt that failed
    /// * `error`   — human-readable failure description
    fn on_page_retry(&self, document: &str, page: u32, attempt: u32, error: &str) {
        let _ = (document, page, attempt, error);
    }

    /// Called once a page's tables have been appended to its artifact.
    fn on_page_complete(&self, document: &str, page: u32, tables_found: usize) {
        let _ = (document, page, tables_found);
    }

    /// Called when a page fails after every retry.
    fn on_page_error(&self, document: &str, page: u32, error: &str) {
        let _ = (document, page, error);
    }

    /// Called when every page of a document has been written.
    fn on_document_complete(&self, document: &str) {
        let _ = document;
    }

    /// Called once after the archive has been uploaded.
    fn on_run_complete(&self, documents: usize, pages: u32) {
        let _ = (documents, pages);
    }
}

/// A no-op implementation for callers that don't need progress events.
pub struct NoopProgressCallback;

impl RunProgressCallback for NoopProgressCallback {}

/// Convenience alias matching the type stored in [`crate::config::RunConfig`].
pub type ProgressCallback = Arc<dyn RunProgressCallback>;
