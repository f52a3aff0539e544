//! Markdown table parsing: pipe-delimited text → [`DataFrame`].
//!
//! VLMs write tables as GFM pipe tables. This module turns that text into a
//! typed, column-ordered value the writers can rely on:
//!
//! 1. Keep only lines that contain an unescaped `|`
//! 2. The first such line is the header
//! 3. Separator rows (`| --- | :-: |`) are dropped wherever they appear
//! 4. Every header name and cell is trimmed
//! 5. Columns with no data in any row are dropped (this removes the empty
//!    edge columns produced by leading/trailing pipes)
//!
//! The parser is deliberately lenient about *shape* and strict only about
//! things that would corrupt the column set (rows wider than the header).
//! Whether the text was a table at all is decided by the schema layer in
//! [`crate::schema`], which turns a parse error into a retryable validation
//! failure.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::de::{self, Deserializer};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Why a string could not be read as a pipe table.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TableParseError {
    /// No line of the input contains a pipe delimiter.
    #[error("no pipe-delimited header line found")]
    NoHeader,

    /// A data row has more non-empty cells than the header has columns.
    #[error("row {line} has {found} cells but the header has {expected}")]
    RaggedRow {
        line: usize,
        expected: usize,
        found: usize,
    },
}

/// A tidy table: ordered column names plus row-major cell values.
///
/// Every row has exactly `columns().len()` cells, so each row is an ordered
/// mapping from column name to value (see [`DataFrame::row`]).
///
/// On the wire (model responses, re-serialised payloads) a `DataFrame` is a
/// markdown string. Deserialisation also accepts the structured
/// `{"columns": [...], "rows": [[...]]}` form and passes it through unchanged,
/// so feeding an already-parsed table back in is a no-op.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DataFrame {
    columns: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl DataFrame {
    /// Build a frame from parts, checking that every row matches the header width.
    pub fn new(columns: Vec<String>, rows: Vec<Vec<String>>) -> Result<Self, TableParseError> {
        if let Some((i, row)) = rows
            .iter()
            .enumerate()
            .find(|(_, r)| r.len() != columns.len())
        {
            return Err(TableParseError::RaggedRow {
                line: i + 1,
                expected: columns.len(),
                found: row.len(),
            });
        }
        Ok(Self { columns, rows })
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[Vec<String>] {
        &self.rows
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// `true` when the table has no data rows.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Row `index` (0-based) as `(column, value)` pairs in column order.
    pub fn row(&self, index: usize) -> Option<impl Iterator<Item = (&str, &str)> + '_> {
        let row = self.rows.get(index)?;
        Some(
            self.columns
                .iter()
                .map(String::as_str)
                .zip(row.iter().map(String::as_str)),
        )
    }

    /// All values of the named column, top to bottom.
    pub fn column(&self, name: &str) -> Option<Vec<&str>> {
        let idx = self.columns.iter().position(|c| c == name)?;
        Some(self.rows.iter().map(|r| r[idx].as_str()).collect())
    }

    /// Render as a GFM pipe table.
    ///
    /// Pipes inside cells are escaped and embedded newlines flattened to
    /// spaces, so [`parse_markdown_table`] reads the output back to an equal
    /// frame (up to whitespace).
    pub fn to_markdown(&self) -> String {
        if self.columns.is_empty() {
            return String::new();
        }
        let mut out = String::new();
        push_md_row(&mut out, self.columns.iter().map(String::as_str));
        push_md_row(&mut out, self.columns.iter().map(|_| "---"));
        for row in &self.rows {
            push_md_row(&mut out, row.iter().map(String::as_str));
        }
        out.pop();
        out
    }
}

fn push_md_row<'a>(out: &mut String, cells: impl Iterator<Item = &'a str>) {
    out.push('|');
    for cell in cells {
        out.push(' ');
        out.push_str(&cell.replace('|', "\\|").replace(['\r', '\n'], " "));
        out.push_str(" |");
    }
    out.push('\n');
}

// ── Parsing ──────────────────────────────────────────────────────────────────

static RE_SEPARATOR_CELL: Lazy<Regex> = Lazy::new(|| Regex::new(r"^:?-+:?$").unwrap());

// Body rows need three dashes: models write `-` for "no value".
static RE_BODY_SEPARATOR_CELL: Lazy<Regex> = Lazy::new(|| Regex::new(r"^:?-{3,}:?$").unwrap());

/// Parse a markdown pipe table.
///
/// Column order follows the header; row order follows the source lines.
pub fn parse_markdown_table(input: &str) -> Result<DataFrame, TableParseError> {
    let mut lines = input
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && has_unescaped_pipe(l))
        .map(split_cells);

    let raw_header = lines.next().ok_or(TableParseError::NoHeader)?;
    let width = raw_header.len();

    let mut raw_rows: Vec<Vec<String>> = Vec::new();
    for (i, mut cells) in lines.enumerate() {
        let separator = if i == 0 {
            &*RE_SEPARATOR_CELL
        } else {
            &*RE_BODY_SEPARATOR_CELL
        };
        if is_separator_row(&cells, separator) {
            continue;
        }
        if cells.len() > width {
            // Tolerate stray trailing pipes; anything else would shift columns.
            if cells[width..].iter().any(|c| !c.is_empty()) {
                return Err(TableParseError::RaggedRow {
                    line: i + 2,
                    expected: width,
                    found: cells.len(),
                });
            }
            cells.truncate(width);
        }
        cells.resize(width, String::new());
        raw_rows.push(cells);
    }

    let names = header_names(&raw_header);

    let keep: Vec<usize> = (0..width)
        .filter(|&c| {
            if raw_rows.is_empty() {
                !raw_header[c].is_empty()
            } else {
                raw_rows.iter().any(|r| !r[c].is_empty())
            }
        })
        .collect();

    let columns = keep.iter().map(|&c| names[c].clone()).collect();
    let rows = raw_rows
        .into_iter()
        .map(|r| keep.iter().map(|&c| r[c].clone()).collect())
        .collect();

    Ok(DataFrame { columns, rows })
}

fn has_unescaped_pipe(line: &str) -> bool {
    let mut escaped = false;
    for ch in line.chars() {
        match ch {
            '\\' if !escaped => escaped = true,
            '|' if !escaped => return true,
            _ => escaped = false,
        }
    }
    false
}

/// Split on unescaped pipes, unescape `\|`, and trim every cell.
fn split_cells(line: &str) -> Vec<String> {
    let mut cells = Vec::new();
    let mut current = String::new();
    let mut chars = line.chars().peekable();
    while let Some(ch) = chars.next() {
        match ch {
            '\\' if chars.peek() == Some(&'|') => {
                current.push('|');
                chars.next();
            }
            '|' => cells.push(std::mem::take(&mut current)),
            _ => current.push(ch),
        }
    }
    cells.push(current);
    cells.into_iter().map(|c| c.trim().to_string()).collect()
}

fn is_separator_row(cells: &[String], cell: &Regex) -> bool {
    cells.iter().any(|c| !c.is_empty())
        && cells
            .iter()
            .all(|c| c.is_empty() || cell.is_match(&c.replace(' ', "")))
}

/// Name blank headers `Unnamed: N` (N = raw position) and suffix duplicates
/// with `.1`, `.2`, … so column-major output never collides.
fn header_names(raw: &[String]) -> Vec<String> {
    let mut seen: HashMap<String, usize> = HashMap::new();
    raw.iter()
        .enumerate()
        .map(|(i, name)| {
            let base = if name.is_empty() {
                format!("Unnamed: {i}")
            } else {
                name.clone()
            };
            let count = seen.entry(base.clone()).or_insert(0);
            let unique = if *count == 0 {
                base
            } else {
                format!("{base}.{count}")
            };
            *count += 1;
            unique
        })
        .collect()
}

// ── Serde ────────────────────────────────────────────────────────────────────

impl Serialize for DataFrame {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_markdown())
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum WireFrame {
    Markdown(String),
    Typed {
        columns: Vec<String>,
        rows: Vec<Vec<String>>,
    },
}

impl<'de> Deserialize<'de> for DataFrame {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match WireFrame::deserialize(deserializer)? {
            WireFrame::Markdown(md) => parse_markdown_table(&md).map_err(de::Error::custom),
            WireFrame::Typed { columns, rows } => {
                DataFrame::new(columns, rows).map_err(de::Error::custom)
            }
        }
    }
}
