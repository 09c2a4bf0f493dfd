use std::path::Path;

use csv::ReaderBuilder;

use super::{BatchBuilder, TableReader, TabularBatch};
use crate::error::FileError;

/// Cell values that mean "no value" in exported CSVs.
const NULL_MARKERS: [&str; 4] = ["", "NULL", "null", "None"];

/// Comma separated text with a header row. Ragged rows are accepted and padded.
pub struct CsvReader;

impl TableReader for CsvReader {
    fn read(&self, path: &Path) -> Result<TabularBatch, FileError> {
        let mut reader = ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_path(path)
            .map_err(|e| FileError::read(path, e))?;

        let header: Vec<String> = reader
            .headers()
            .map_err(|e| FileError::read(path, e))?
            .iter()
            .map(|h| h.trim().to_string())
            .collect();

        let mut builder = BatchBuilder::new();
        for name in &header {
            builder.declare_column(name);
        }

        for record in reader.records() {
            let record = record.map_err(|e| FileError::read(path, e))?;
            builder.push_row(
                header
                    .iter()
                    .zip(record.iter())
                    .map(|(name, cell)| (name.as_str(), cell_value(cell))),
            );
        }

        Ok(builder.finish())
    }
}

fn cell_value(cell: &str) -> Option<String> {
    if NULL_MARKERS.contains(&cell.trim()) {
        None
    } else {
        Some(cell.to_string())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempfile::NamedTempFile;

    use super::*;

    fn csv_file(contents: &str) -> NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".csv").tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_reads_rows_and_nulls() {
        let file = csv_file(
            "text,user_id,external_id,timestamp\n\
             \"Refund, please\",u1,e1,2024-03-10T14:05:09Z\n\
             Second,NULL,,None\n",
        );
        let batch = CsvReader.read(file.path()).unwrap();

        assert_eq!(batch.len(), 2);
        let first = batch.record(0).unwrap();
        assert_eq!(first.text.as_deref(), Some("Refund, please"));
        assert_eq!(first.timestamp.as_deref(), Some("2024-03-10T14:05:09Z"));

        let second = batch.record(1).unwrap();
        assert_eq!(second.text.as_deref(), Some("Second"));
        assert_eq!(second.user_id, None);
        assert_eq!(second.external_id, None);
        assert_eq!(second.timestamp, None);
    }

    #[test]
    fn test_short_rows_are_padded() {
        let file = csv_file("text,user_id,external_id,timestamp\nonly text\n");
        let batch = CsvReader.read(file.path()).unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch.record(0).unwrap().text.as_deref(), Some("only text"));
        assert_eq!(batch.record(0).unwrap().user_id, None);
    }

    #[test]
    fn test_header_only_file_keeps_columns() {
        let file = csv_file("text,user_id,external_id,timestamp\n");
        let batch = CsvReader.read(file.path()).unwrap();
        assert!(batch.is_empty());
        assert!(CsvReader.validate_structure(&batch).is_ok());
    }

    #[test]
    fn test_invalid_utf8_is_a_file_error() {
        let mut file = tempfile::Builder::new().suffix(".csv").tempfile().unwrap();
        file.write_all(b"text,user_id,external_id,timestamp\n\xff\xfe,u,e,\n")
            .unwrap();
        assert!(matches!(
            CsvReader.read(file.path()),
            Err(FileError::Read { .. })
        ));
    }
}
