//! Pipeline stages for page-image table extraction.
//!
//! Each submodule implements exactly one step. Only [`llm`] touches the
//! network; everything else is deterministic and tested offline.
//!
//! ## Data Flow
//!
//! ```text
//! image URL ──▶ llm ──▶ extract ──▶ markdown ──▶ writer ──▶ archive
//!               (VLM)   (retry +    (typed      (CSV/JSON   (zip)
//!                        schema)     tables)     append)
//! ```
//!
//! 1. [`llm`]      — the backend seam: "send image + instructions, get text"
//! 2. [`extract`]  — retry/backoff loop validating each answer against the
//!    table schema, re-asking with the validation error
//! 3. [`markdown`] — markdown pipe table → [`markdown::DataFrame`], the
//!    validated form of every `dataframe` field
//! 4. [`writer`]   — per-document CSV or JSON artifact, appended page by page
//! 5. [`archive`]  — bundles every artifact of a run into one zip

pub mod archive;
pub mod extract;
pub mod llm;
pub mod markdown;
pub mod writer;
