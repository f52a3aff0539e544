//! Per-document artifacts: CSV and JSON page blocks, appended page by page.
//!
//! The two layouts are deliberately different and are kept as independent
//! [`TabularWriter`]s:
//!
//! **CSV** (row-major, CRLF line endings, no header rows):
//!
//! ```text
//! Page Number: 3
//! Budget
//! 2020,10
//! 2021,12
//! <blank>
//! <blank>
//! ```
//!
//! **JSON** (column-major, 4-space indent, marker glued to the array):
//!
//! ```text
//! Page number: 3[
//!     {
//!         "caption": "Budget",
//!         "dataframe": {
//!             "Year": { "1": "2020", "2": "2021" },
//!             ...
//! ]
//! <blank>
//! <blank>
//! ```
//!
//! A page with no tables still gets its marker. Appending is not idempotent:
//! writing the same page twice duplicates it.

use crate::config::OutputFormat;
use crate::error::TablesError;
use crate::schema::Table;
use serde::ser::{SerializeMap, SerializeSeq, Serializer};
use serde::Serialize;
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Serialises one page's tables into a byte block.
pub trait TabularWriter: Send + Sync {
    fn format(&self) -> OutputFormat;

    fn write_page(&self, tables: &[Table], page: u32, out: &mut dyn Write) -> io::Result<()>;
}

/// Returns the writer for `format`.
pub fn writer_for(format: OutputFormat) -> &'static dyn TabularWriter {
    match format {
        OutputFormat::Csv => &CsvTableWriter,
        OutputFormat::Json => &JsonTableWriter,
    }
}

/// Artifact file name for a document: `tables-{id}.{csv|json}`.
pub fn artifact_name(document_id: &str, format: OutputFormat) -> String {
    format!("tables-{document_id}.{}", format.extension())
}

// ── CSV ──────────────────────────────────────────────────────────────────

/// Row-major CSV: page marker, then per table a caption row, its data rows
/// and two empty rows.
#[derive(Debug, Clone, Copy, Default)]
pub struct CsvTableWriter;

const CSV_BLANK_ROWS: &[u8] = b"\r\n\r\n";

fn csv_block<'a>(records: impl IntoIterator<Item = Vec<&'a str>>) -> io::Result<Vec<u8>> {
    let mut writer = csv::WriterBuilder::new()
        .flexible(true)
        .terminator(csv::Terminator::CRLF)
        .from_writer(Vec::new());
    for record in records {
        writer.write_record(record)?;
    }
    writer
        .into_inner()
        .map_err(|e| io::Error::other(e.to_string()))
}

impl TabularWriter for CsvTableWriter {
    fn format(&self) -> OutputFormat {
        OutputFormat::Csv
    }

    fn write_page(&self, tables: &[Table], page: u32, out: &mut dyn Write) -> io::Result<()> {
        let marker = format!("Page Number: {page}");
        let mut block = csv_block([vec![marker.as_str()]])?;

        for table in tables {
            let caption = std::iter::once(vec![table.caption.as_str()]);
            let rows = table
                .dataframe
                .rows()
                .iter()
                .map(|row| row.iter().map(String::as_str).collect());
            block.extend(csv_block(caption.chain(rows))?);
            block.extend_from_slice(CSV_BLANK_ROWS);
        }

        out.write_all(&block)
    }
}

// ── JSON ─────────────────────────────────────────────────────────────────

/// Column-major JSON: `"Page number: N"` immediately followed by an array of
/// `{caption, dataframe: {column: {row: value}}}`, then three newlines.
///
/// Row keys are 1-based data-row numbers.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonTableWriter;

struct ColumnMajor<'a>(&'a Table);

struct Column<'a> {
    table: &'a Table,
    index: usize,
}

impl Serialize for ColumnMajor<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(2))?;
        map.serialize_entry("caption", &self.0.caption)?;
        map.serialize_entry("dataframe", &Columns(self.0))?;
        map.end()
    }
}

struct Columns<'a>(&'a Table);

impl Serialize for Columns<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let columns = self.0.dataframe.columns();
        let mut map = serializer.serialize_map(Some(columns.len()))?;
        for (index, name) in columns.iter().enumerate() {
            map.serialize_entry(name.trim(), &Column { table: self.0, index })?;
        }
        map.end()
    }
}

impl Serialize for Column<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let rows = self.table.dataframe.rows();
        let mut map = serializer.serialize_map(Some(rows.len()))?;
        for (i, row) in rows.iter().enumerate() {
            let cell = row.get(self.index).map(|c| c.trim()).unwrap_or("");
            map.serialize_entry(&(i + 1).to_string(), cell)?;
        }
        map.end()
    }
}

struct Page<'a>(&'a [Table]);

impl Serialize for Page<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(self.0.len()))?;
        for table in self.0 {
            seq.serialize_element(&ColumnMajor(table))?;
        }
        seq.end()
    }
}

impl TabularWriter for JsonTableWriter {
    fn format(&self) -> OutputFormat {
        OutputFormat::Json
    }

    fn write_page(&self, tables: &[Table], page: u32, out: &mut dyn Write) -> io::Result<()> {
        let mut block = format!("Page number: {page}").into_bytes();
        let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
        let mut ser = serde_json::Serializer::with_formatter(&mut block, formatter);
        Page(tables).serialize(&mut ser).map_err(io::Error::from)?;
        block.extend_from_slice(b"\n\n\n");
        out.write_all(&block)
    }
}

// ── Accumulator ──────────────────────────────────────────────────────────

/// Appends page blocks to one artifact file per document.
///
/// The file is opened in append mode for every page, so a run that stops
/// early leaves every completed page on disk.
#[derive(Debug, Clone)]
pub struct ResultAccumulator {
    path: PathBuf,
    format: OutputFormat,
    pages: u32,
    tables: usize,
}

impl ResultAccumulator {
    /// Accumulator for `document_id` inside `dir`. Nothing is created until
    /// the first [`push`](Self::push).
    pub fn for_document(dir: &Path, document_id: &str, format: OutputFormat) -> Self {
        Self {
            path: dir.join(artifact_name(document_id, format)),
            format,
            pages: 0,
            tables: 0,
        }
    }

    /// Append one page block to `destination`.
    pub fn append(
        tables: &[Table],
        page: u32,
        destination: &Path,
        format: OutputFormat,
    ) -> Result<(), TablesError> {
        let write_err = |source| TablesError::OutputWriteFailed {
            path: destination.to_path_buf(),
            source,
        };

        let mut block = Vec::new();
        writer_for(format)
            .write_page(tables, page, &mut block)
            .map_err(write_err)?;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(destination)
            .map_err(write_err)?;
        file.write_all(&block).map_err(write_err)?;

        debug!(
            "Appended page {} ({} tables, {} bytes) to {}",
            page,
            tables.len(),
            block.len(),
            destination.display()
        );
        Ok(())
    }

    /// Append one page to this document's artifact.
    pub fn push(&mut self, tables: &[Table], page: u32) -> Result<(), TablesError> {
        Self::append(tables, page, &self.path, self.format)?;
        self.pages += 1;
        self.tables += tables.len();
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn pages_written(&self) -> u32 {
        self.pages
    }

    pub fn tables_written(&self) -> usize {
        self.tables
    }

    /// Remove a file left at this path by an earlier run, so the artifact
    /// holds only pages pushed from now on.
    pub fn reset(&mut self) -> Result<(), TablesError> {
        remove_if_present(&self.path)?;
        self.pages = 0;
        self.tables = 0;
        Ok(())
    }

    /// Delete the artifact. Used when a document fails part-way.
    pub fn discard(self) -> Result<(), TablesError> {
        remove_if_present(&self.path)
    }
}

fn remove_if_present(path: &Path) -> Result<(), TablesError> {
    match std::fs::remove_file(path) {
        Ok(()) => {
            debug!("Removed {}", path.display());
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(TablesError::OutputWriteFailed {
            path: path.to_path_buf(),
            source,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::markdown::parse_markdown_table;

    fn table(caption: &str, md: &str) -> Table {
        Table {
            caption: caption.into(),
            dataframe: parse_markdown_table(md).unwrap(),
        }
    }

    fn budget() -> Table {
        table(
            "Budget",
            "| Year | Amount |\n|---|---|\n| 2020 | 10 |\n| 2021 | 12 |",
        )
    }

    fn render(writer: &dyn TabularWriter, tables: &[Table], page: u32) -> String {
        let mut out = Vec::new();
        writer.write_page(tables, page, &mut out).unwrap();
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn csv_page_layout() {
        let out = render(&CsvTableWriter, &[budget()], 3);
        assert_eq!(
            out,
            "Page Number: 3\r\nBudget\r\n2020,10\r\n2021,12\r\n\r\n\r\n"
        );
    }

    #[test]
    fn csv_empty_page_is_marker_only() {
        assert_eq!(render(&CsvTableWriter, &[], 7), "Page Number: 7\r\n");
    }

    #[test]
    fn csv_quotes_commas_and_quotes() {
        let t = table(
            "Notes, misc",
            "| a | b |\n|---|---|\n| 1,000 | say \"hi\" |",
        );
        let out = render(&CsvTableWriter, &[t], 1);
        assert!(out.contains("\"Notes, misc\"\r\n"), "got: {out}");
        assert!(out.contains("\"1,000\",\"say \"\"hi\"\"\"\r\n"), "got: {out}");
    }

    #[test]
    fn csv_multiple_tables_in_order() {
        let second = table("Staff", "| Name |\n|---|\n| Ada |");
        let out = render(&CsvTableWriter, &[budget(), second], 1);
        let budget_at = out.find("Budget").unwrap();
        let staff_at = out.find("Staff").unwrap();
        assert!(budget_at < staff_at);
        assert!(out.ends_with("Staff\r\nAda\r\n\r\n\r\n"));
    }

    #[test]
    fn json_page_layout() {
        let out = render(&JsonTableWriter, &[budget()], 2);
        let expected = r#"Page number: 2[
    {
        "caption": "Budget",
        "dataframe": {
            "Year": {
                "1": "2020",
                "2": "2021"
            },
            "Amount": {
                "1": "10",
                "2": "12"
            }
        }
    }
]


"#;
        assert_eq!(out, expected);
    }

    #[test]
    fn json_empty_page() {
        assert_eq!(render(&JsonTableWriter, &[], 4), "Page number: 4[]\n\n\n");
    }

    #[test]
    fn json_preserves_column_order() {
        let t = table("Order", "| z | a | m |\n|---|---|---|\n| 1 | 2 | 3 |");
        let out = render(&JsonTableWriter, &[t], 1);
        let z = out.find("\"z\"").unwrap();
        let a = out.find("\"a\"").unwrap();
        let m = out.find("\"m\"").unwrap();
        assert!(z < a && a < m);
    }

    #[test]
    fn artifact_names() {
        assert_eq!(artifact_name("20001", OutputFormat::Csv), "tables-20001.csv");
        assert_eq!(artifact_name("20001", OutputFormat::Json), "tables-20001.json");
    }

    #[test]
    fn append_accumulates_pages() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tables-1.csv");

        ResultAccumulator::append(&[budget()], 1, &path, OutputFormat::Csv).unwrap();
        ResultAccumulator::append(&[], 2, &path, OutputFormat::Csv).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.starts_with("Page Number: 1\r\n"));
        assert!(content.ends_with("Page Number: 2\r\n"));
    }

    #[test]
    fn append_twice_duplicates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tables-1.json");

        ResultAccumulator::append(&[], 1, &path, OutputFormat::Json).unwrap();
        ResultAccumulator::append(&[], 1, &path, OutputFormat::Json).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.matches("Page number: 1").count(), 2);
    }

    #[test]
    fn accumulator_counts_and_discards() {
        let dir = tempfile::tempdir().unwrap();
        let mut acc = ResultAccumulator::for_document(dir.path(), "9", OutputFormat::Csv);
        assert!(!acc.path().exists());

        acc.push(&[budget(), budget()], 1).unwrap();
        acc.push(&[], 2).unwrap();
        assert_eq!(acc.pages_written(), 2);
        assert_eq!(acc.tables_written(), 2);

        let path = acc.path().to_path_buf();
        assert!(path.exists());
        acc.discard().unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn reset_clears_leftover_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let stale = dir.path().join("tables-5.csv");
        std::fs::write(&stale, "Page Number: 1\r\nPage Number: 2\r\n").unwrap();

        let mut acc = ResultAccumulator::for_document(dir.path(), "5", OutputFormat::Csv);
        acc.reset().unwrap();
        assert!(!stale.exists());

        acc.push(&[], 1).unwrap();
        assert_eq!(std::fs::read_to_string(&stale).unwrap(), "Page Number: 1\r\n");
        assert_eq!(acc.pages_written(), 1);
    }

    #[test]
    fn reset_without_leftover_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        let mut acc = ResultAccumulator::for_document(dir.path(), "6", OutputFormat::Json);
        assert!(acc.reset().is_ok());
        assert!(!acc.path().exists());
    }

    #[test]
    fn append_to_missing_directory_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("tables-1.csv");
        let err = ResultAccumulator::append(&[], 1, &path, OutputFormat::Csv).unwrap_err();
        assert!(matches!(err, TablesError::OutputWriteFailed { .. }));
    }
}
