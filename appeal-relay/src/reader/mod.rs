use std::collections::HashMap;
use std::fmt;
use std::path::Path;

use tracing::info;

use crate::error::{FileError, StructureError};
use crate::message::{RawRecord, REQUIRED_COLUMNS};

pub mod columnar;
pub mod delimited;
pub mod json;
pub mod spreadsheet;

/// A parsed file, held column by column. Every column has exactly `len()` values.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TabularBatch {
    columns: Vec<Column>,
    rows: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    pub values: Vec<Option<String>>,
}

impl TabularBatch {
    pub fn len(&self) -> usize {
        self.rows
    }

    pub fn is_empty(&self) -> bool {
        self.rows == 0
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|c| c.name.as_str())
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// The required fields of row `index`, or `None` past the end.
    pub fn record(&self, index: usize) -> Option<RawRecord> {
        if index >= self.rows {
            return None;
        }
        let value = |name: &str| {
            self.column(name)
                .and_then(|c| c.values[index].clone())
        };
        Some(RawRecord {
            text: value("text"),
            user_id: value("user_id"),
            external_id: value("external_id"),
            timestamp: value("timestamp"),
        })
    }

    pub fn records(&self) -> impl Iterator<Item = RawRecord> + '_ {
        (0..self.rows).filter_map(|i| self.record(i))
    }
}

/// Accumulates rows of named cells into a [`TabularBatch`]. Columns first seen on a
/// later row are back-filled with missing values, and short rows are padded.
#[derive(Default)]
pub struct BatchBuilder {
    columns: Vec<Column>,
    index: HashMap<String, usize>,
    rows: usize,
}

impl BatchBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a column up front, so it exists even if no row has a value for it.
    pub fn declare_column(&mut self, name: &str) -> usize {
        if let Some(idx) = self.index.get(name) {
            return *idx;
        }
        self.columns.push(Column {
            name: name.to_string(),
            values: vec![None; self.rows],
        });
        self.index.insert(name.to_string(), self.columns.len() - 1);
        self.columns.len() - 1
    }

    pub fn push_row<'a>(&mut self, cells: impl IntoIterator<Item = (&'a str, Option<String>)>) {
        for (name, value) in cells {
            let idx = self.declare_column(name);
            let column = &mut self.columns[idx];
            // A repeated header name keeps the last value
            if column.values.len() > self.rows {
                column.values[self.rows] = value;
            } else {
                column.values.push(value);
            }
        }
        self.rows += 1;
        for column in self.columns.iter_mut() {
            column.values.resize(self.rows, None);
        }
    }

    pub fn finish(self) -> TabularBatch {
        TabularBatch {
            columns: self.columns,
            rows: self.rows,
        }
    }
}

/// The capability every format adapter provides.
pub trait TableReader: Send + Sync {
    fn read(&self, path: &Path) -> Result<TabularBatch, FileError>;

    /// Checks that the required columns are present. Extra columns are logged and
    /// otherwise ignored.
    fn validate_structure(&self, batch: &TabularBatch) -> Result<(), StructureError> {
        validate_structure(batch)
    }
}

pub fn validate_structure(batch: &TabularBatch) -> Result<(), StructureError> {
    let missing: Vec<String> = REQUIRED_COLUMNS
        .iter()
        .filter(|required| batch.column(required).is_none())
        .map(|required| required.to_string())
        .collect();

    if !missing.is_empty() {
        return Err(StructureError { missing });
    }

    let extra: Vec<&str> = batch
        .column_names()
        .filter(|name| !REQUIRED_COLUMNS.contains(name))
        .collect();
    if !extra.is_empty() {
        info!(columns = ?extra, "ignoring extra columns");
    }

    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileFormat {
    Csv,
    Excel,
    Json,
    Parquet,
}

pub const SUPPORTED_EXTENSIONS: [(&str, FileFormat); 6] = [
    ("csv", FileFormat::Csv),
    ("xlsx", FileFormat::Excel),
    ("xls", FileFormat::Excel),
    ("json", FileFormat::Json),
    ("jsonl", FileFormat::Json),
    ("parquet", FileFormat::Parquet),
];

impl FileFormat {
    pub fn from_extension(extension: &str) -> Result<Self, FileError> {
        let extension = extension.trim_start_matches('.').to_lowercase();
        SUPPORTED_EXTENSIONS
            .iter()
            .find(|(ext, _)| *ext == extension)
            .map(|(_, format)| *format)
            .ok_or_else(|| FileError::UnsupportedFormat {
                extension,
                supported: supported_list(),
            })
    }

    pub fn from_path(path: &Path) -> Result<Self, FileError> {
        let extension = path
            .extension()
            .map(|e| e.to_string_lossy().to_string())
            .unwrap_or_default();
        Self::from_extension(&extension)
    }

    pub fn reader(&self) -> &'static dyn TableReader {
        match self {
            FileFormat::Csv => &delimited::CsvReader,
            FileFormat::Excel => &spreadsheet::ExcelReader,
            FileFormat::Json => &json::JsonReader,
            FileFormat::Parquet => &columnar::ParquetReader,
        }
    }
}

impl fmt::Display for FileFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FileFormat::Csv => "csv",
            FileFormat::Excel => "excel",
            FileFormat::Json => "json",
            FileFormat::Parquet => "parquet",
        };
        f.write_str(name)
    }
}

fn supported_list() -> String {
    SUPPORTED_EXTENSIONS
        .iter()
        .map(|(ext, _)| format!(".{ext}"))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Picks the adapter from the file extension and loads the whole file.
pub fn read_file(path: &Path) -> Result<TabularBatch, FileError> {
    let format = FileFormat::from_path(path)?;
    info!(path = %path.display(), %format, "reading file");
    format.reader().read(path)
}
