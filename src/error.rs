//! Error types for the edgequake-tables library.
//!
//! * [`TablesError`] — **Fatal** for the run. Every failure the orchestrator
//!   cannot recover from ends up here: bad run parameters, billing refusal,
//!   a page that still fails after the retry budget, platform I/O. The
//!   message is what the user sees in the run's status field, so each variant
//!   reads as an actionable sentence.
//!
//! * [`PlatformError`] — returned by the collaborator traits in
//!   [`crate::platform`]. The orchestrator maps it into the matching
//!   [`TablesError`] variant with context (which document, how many credits).
//!
//! Page-level problems that *are* recoverable (a malformed answer, a 503)
//! never surface as errors at all: [`crate::pipeline::extract`] retries them.

use crate::pipeline::extract::ExtractionError;
use std::path::PathBuf;
use thiserror::Error;

/// Broad category of a [`TablesError`], in run order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Run parameters or process configuration are unusable. Nothing charged.
    Configuration,
    /// Credits could not be debited. Nothing extracted.
    Billing,
    /// A page could not be extracted within the retry budget.
    Extraction,
    /// The document platform failed (fetching documents, uploading).
    Platform,
    /// Local artifact or archive could not be written.
    Output,
    /// Bug or environment failure.
    Internal,
}

/// All fatal errors returned by the edgequake-tables library.
#[derive(Debug, Error)]
pub enum TablesError {
    // ── Configuration errors ──────────────────────────────────────────────
    /// The run was started without any documents.
    #[error(
        "It looks like no documents were selected. Search for some or select them and run again."
    )]
    NoDocuments,

    /// `end_page` was not provided.
    #[error("No end page provided. Please provide one and try again.")]
    MissingEndPage,

    /// `end_page` is smaller than `start_page`.
    #[error("The end page ({end}) is smaller than the start page ({start}). Try again.")]
    InvalidPageRange { start: u32, end: u32 },

    /// `start_page` is below 1.
    #[error("The start page ({start}) is less than 1. Pages are numbered from 1.")]
    InvalidStartPage { start: u32 },

    /// There is no organization to bill.
    #[error("No organization to charge.")]
    NoOrganization,

    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The configured LLM provider is not initialised (missing API key etc.).
    #[error("LLM provider '{provider}' is not configured.\n{hint}")]
    ProviderNotConfigured { provider: String, hint: String },

    // ── Billing errors ────────────────────────────────────────────────────
    /// The organization's balance does not cover the run.
    #[error(
        "You do not have sufficient AI credits to run this Add-On on this document set \
         ({cost} credits required)."
    )]
    InsufficientCredits { cost: u64 },

    /// The billing service itself failed.
    #[error("Charging {cost} AI credits failed: {detail}")]
    BillingFailed { cost: u64, detail: String },

    // ── Extraction errors ─────────────────────────────────────────────────
    /// A page still failed after every retry.
    #[error("Extraction failed for document {document}, page {page}: {source}")]
    Extraction {
        document: String,
        page: u32,
        #[source]
        source: ExtractionError,
    },

    // ── Platform errors ───────────────────────────────────────────────────
    /// A document could not be looked up.
    #[error("Failed to fetch document '{id}': {detail}")]
    DocumentFetchFailed { id: String, detail: String },

    /// The archive could not be uploaded.
    #[error("Failed to upload results: {detail}")]
    UploadFailed { detail: String },

    // ── Output errors ─────────────────────────────────────────────────────
    /// An artifact file could not be created or appended to.
    #[error("Failed to write output file '{path}': {source}")]
    OutputWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The results archive could not be built.
    #[error("Failed to build archive '{path}': {detail}")]
    Archive { path: PathBuf, detail: String },

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl TablesError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TablesError::NoDocuments
            | TablesError::MissingEndPage
            | TablesError::InvalidPageRange { .. }
            | TablesError::InvalidStartPage { .. }
            | TablesError::NoOrganization
            | TablesError::InvalidConfig(_)
            | TablesError::ProviderNotConfigured { .. } => ErrorKind::Configuration,
            TablesError::InsufficientCredits { .. } | TablesError::BillingFailed { .. } => {
                ErrorKind::Billing
            }
            TablesError::Extraction { .. } => ErrorKind::Extraction,
            TablesError::DocumentFetchFailed { .. } | TablesError::UploadFailed { .. } => {
                ErrorKind::Platform
            }
            TablesError::OutputWriteFailed { .. } | TablesError::Archive { .. } => {
                ErrorKind::Output
            }
            TablesError::Internal(_) => ErrorKind::Internal,
        }
    }
}

/// Failure reported by a platform collaborator.
#[derive(Debug, Error)]
pub enum PlatformError {
    /// The billing service refused the charge.
    #[error("insufficient credits")]
    InsufficientCredits,

    /// The requested resource does not exist.
    #[error("{resource} not found")]
    NotFound { resource: String },

    /// The API answered with an unexpected status.
    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    /// The request never got an answer.
    #[error("request failed: {0}")]
    Transport(String),

    /// The answer could not be decoded.
    #[error("unexpected response: {0}")]
    Decode(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<reqwest::Error> for PlatformError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            PlatformError::Decode(e.to_string())
        } else {
            PlatformError::Transport(e.to_string())
        }
    }
}
