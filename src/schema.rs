//! Response contract: what a valid model answer looks like.
//!
//! The model is asked for a JSON object of the form
//!
//! ```json
//! { "tables": [ { "caption": "…", "dataframe": "| a | b |\n|---|---|\n| 1 | 2 |" } ] }
//! ```
//!
//! where each `dataframe` is a markdown pipe table. [`validate_response`]
//! takes the model's raw text and either returns typed [`MultipleTables`] or a
//! [`SchemaError`] explaining what was wrong. It knows nothing about which
//! backend produced the text, so the retry layer in
//! [`crate::pipeline::extract`] can treat every backend the same way.
//!
//! An empty `tables` list is a valid answer ("no tables on this page").

use crate::pipeline::markdown::DataFrame;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

/// One extracted table with its human-readable caption.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Table {
    pub caption: String,
    pub dataframe: DataFrame,
}

/// Every table the model found on one page, in the order it emitted them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultipleTables {
    pub tables: Vec<Table>,
}

/// Why a model response does not satisfy the contract.
#[derive(Debug, Error)]
pub enum SchemaError {
    /// No `{ … }` object anywhere in the response.
    #[error("response contains no JSON object")]
    NoJsonObject,

    /// The object did not deserialise (wrong shape, or a `dataframe` that is
    /// not a readable markdown table).
    #[error("response does not match the table schema: {0}")]
    Json(#[from] serde_json::Error),

    /// A table came back without a caption.
    #[error("table {index} has an empty caption")]
    EmptyCaption { index: usize },
}

impl MultipleTables {
    /// Trim captions and reject blank ones.
    fn validated(mut self) -> Result<Self, SchemaError> {
        for (index, table) in self.tables.iter_mut().enumerate() {
            let trimmed = table.caption.trim();
            if trimmed.is_empty() {
                return Err(SchemaError::EmptyCaption { index });
            }
            if trimmed.len() != table.caption.len() {
                table.caption = trimmed.to_string();
            }
        }
        Ok(self)
    }

    /// The worked example shown to the model: one table, three numeric
    /// columns, two rows.
    pub fn example() -> Self {
        let dataframe = DataFrame::new(
            vec!["Chart A".into(), "Chart B".into(), "Chart C".into()],
            vec![
                vec!["10".into(), "20".into(), "30".into()],
                vec!["40".into(), "50".into(), "60".into()],
            ],
        )
        .unwrap_or_default();

        Self {
            tables: vec![Table {
                caption: "This is a caption".into(),
                dataframe,
            }],
        }
    }
}

/// JSON Schema for [`MultipleTables`] as presented to the model.
///
/// `dataframe` is declared as a string because that is its wire form; the
/// typed value only exists after validation.
pub fn response_schema() -> Value {
    json!({
        "title": "MultipleTables",
        "description": "Every table found in the image",
        "type": "object",
        "properties": {
            "tables": {
                "type": "array",
                "items": { "$ref": "#/$defs/Table" }
            }
        },
        "required": ["tables"],
        "$defs": {
            "Table": {
                "title": "Table",
                "type": "object",
                "properties": {
                    "caption": {
                        "type": "string",
                        "description": "A descriptive title for the table"
                    },
                    "dataframe": {
                        "type": "string",
                        "description": "The markdown representation of the table, \
                            each one should be tidy, do not try to join tables \
                            that should be separate"
                    }
                },
                "required": ["caption", "dataframe"]
            }
        }
    })
}

static RE_JSON_FENCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)```[A-Za-z]*[ \t]*\r?\n(.*?)\r?\n[ \t]*```").unwrap());

/// Validate and coerce raw model text into [`MultipleTables`].
///
/// Accepts the object fenced in ```` ```json ```` or bare, with or without
/// surrounding prose.
pub fn validate_response(raw: &str) -> Result<MultipleTables, SchemaError> {
    let body = extract_json_object(raw).ok_or(SchemaError::NoJsonObject)?;
    let parsed: MultipleTables = serde_json::from_str(body)?;
    parsed.validated()
}

fn extract_json_object(raw: &str) -> Option<&str> {
    let inner = RE_JSON_FENCE
        .captures(raw)
        .and_then(|c| c.get(1))
        .map_or(raw, |m| m.as_str());
    let start = inner.find('{')?;
    let end = inner.rfind('}')?;
    (start < end).then(|| &inner[start..=end])
}
