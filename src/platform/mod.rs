//! Collaborators at the document-platform boundary.
//!
//! The orchestrator only ever talks to these traits. [`documentcloud`]
//! implements all of them over the platform's REST API; tests and local runs
//! plug in their own.

pub mod documentcloud;

use crate::error::PlatformError;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

/// One document as seen by a run.
pub trait SourceDocument: Send + Sync {
    /// Stable identifier; also names the document's artifact.
    fn id(&self) -> &str;

    fn page_count(&self) -> u32;

    /// URL of the large rendering of `page` (1-based).
    fn large_image_url(&self, page: u32) -> String;
}

/// Looks documents up by id.
#[async_trait]
pub trait DocumentSource: Send + Sync {
    async fn fetch_document(&self, id: &str) -> Result<Arc<dyn SourceDocument>, PlatformError>;
}

/// Debits usage credits from the invoking organization.
#[async_trait]
pub trait CreditLedger: Send + Sync {
    /// Whether there is an organization to bill at all.
    fn has_organization(&self) -> bool {
        true
    }

    /// Debit `credits`. Fails with [`PlatformError::InsufficientCredits`]
    /// when the balance does not cover it.
    async fn charge(&self, credits: u64) -> Result<(), PlatformError>;
}

/// Receives the finished archive.
#[async_trait]
pub trait Uploader: Send + Sync {
    async fn upload(&self, archive: &Path) -> Result<(), PlatformError>;
}

/// The run's single user-visible status line.
#[async_trait]
pub trait RunReporter: Send + Sync {
    async fn set_message(&self, message: &str) -> Result<(), PlatformError>;
}

// ── Local implementations ────────────────────────────────────────────────

/// A document whose page images follow a fixed URL pattern.
///
/// `{page}` in the template is replaced by the page number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticDocument {
    pub id: String,
    pub page_count: u32,
    pub url_template: String,
}

impl StaticDocument {
    pub fn new(id: impl Into<String>, page_count: u32, url_template: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            page_count,
            url_template: url_template.into(),
        }
    }
}

impl SourceDocument for StaticDocument {
    fn id(&self) -> &str {
        &self.id
    }

    fn page_count(&self) -> u32 {
        self.page_count
    }

    fn large_image_url(&self, page: u32) -> String {
        self.url_template.replace("{page}", &page.to_string())
    }
}

/// Copies the archive into a local directory.
#[derive(Debug, Clone)]
pub struct LocalUploader {
    dir: PathBuf,
}

impl LocalUploader {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Where an archive named like `archive` ends up.
    pub fn destination(&self, archive: &Path) -> PathBuf {
        match archive.file_name() {
            Some(name) => self.dir.join(name),
            None => self.dir.join("all_tables.zip"),
        }
    }
}

#[async_trait]
impl Uploader for LocalUploader {
    async fn upload(&self, archive: &Path) -> Result<(), PlatformError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let dest = self.destination(archive);
        let bytes = tokio::fs::copy(archive, &dest).await?;
        info!("Saved {} ({} bytes)", dest.display(), bytes);
        Ok(())
    }
}

/// Reporter that only logs.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogReporter;

#[async_trait]
impl RunReporter for LogReporter {
    async fn set_message(&self, message: &str) -> Result<(), PlatformError> {
        info!("{}", message);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_document_urls() {
        let doc = StaticDocument::new("7", 3, "https://img.example.org/7/p{page}-large.gif");
        assert_eq!(doc.id(), "7");
        assert_eq!(doc.page_count(), 3);
        assert_eq!(
            doc.large_image_url(2),
            "https://img.example.org/7/p2-large.gif"
        );
    }

    #[tokio::test]
    async fn local_uploader_copies_archive() {
        let src = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let archive = src.path().join("all_tables.zip");
        std::fs::write(&archive, b"PK").unwrap();

        let uploader = LocalUploader::new(out.path().join("results"));
        uploader.upload(&archive).await.unwrap();

        let copied = out.path().join("results").join("all_tables.zip");
        assert_eq!(std::fs::read(copied).unwrap(), b"PK");
    }

    #[tokio::test]
    async fn log_reporter_never_fails() {
        let reporter: Arc<dyn RunReporter> = Arc::new(LogReporter);
        assert!(reporter.set_message("Extracted 3 tables.").await.is_ok());
    }

    #[tokio::test]
    async fn local_uploader_missing_archive_fails() {
        let out = tempfile::tempdir().unwrap();
        let uploader = LocalUploader::new(out.path());
        let err = uploader
            .upload(&out.path().join("missing.zip"))
            .await
            .unwrap_err();
        assert!(matches!(err, PlatformError::Io(_)));
    }
}
