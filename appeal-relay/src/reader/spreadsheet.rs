use std::path::Path;

use calamine::{open_workbook_auto, Data, DataType, Reader};
use chrono::Timelike;

use super::{BatchBuilder, TableReader, TabularBatch};
use crate::error::FileError;

/// First worksheet of an xlsx/xls workbook; its first row is the header.
pub struct ExcelReader;

impl TableReader for ExcelReader {
    fn read(&self, path: &Path) -> Result<TabularBatch, FileError> {
        let mut workbook = open_workbook_auto(path).map_err(|e| FileError::read(path, e))?;
        let range = workbook
            .worksheet_range_at(0)
            .ok_or_else(|| FileError::read(path, "workbook has no worksheets"))?
            .map_err(|e| FileError::read(path, e))?;

        let mut rows = range.rows();
        let header: Vec<String> = match rows.next() {
            Some(cells) => cells
                .iter()
                .map(|c| cell_value(c).unwrap_or_default().trim().to_string())
                .collect(),
            None => return Ok(TabularBatch::default()),
        };

        let mut builder = BatchBuilder::new();
        for name in &header {
            builder.declare_column(name);
        }
        for cells in rows {
            builder.push_row(
                header
                    .iter()
                    .zip(cells.iter())
                    .map(|(name, cell)| (name.as_str(), cell_value(cell))),
            );
        }

        Ok(builder.finish())
    }
}

fn cell_value(cell: &Data) -> Option<String> {
    match cell {
        Data::Empty | Data::Error(_) => None,
        Data::String(s) => Some(s.clone()),
        Data::Int(i) => Some(i.to_string()),
        // Spreadsheets store every number as a float
        Data::Float(f) if f.fract() == 0.0 && f.abs() < 1e15 => Some(format!("{f:.0}")),
        Data::Float(f) => Some(f.to_string()),
        Data::Bool(b) => Some(b.to_string()),
        Data::DateTime(_) => cell.as_datetime().map(|dt| {
            if dt.nanosecond() == 0 {
                dt.format("%Y-%m-%dT%H:%M:%S").to_string()
            } else {
                dt.format("%Y-%m-%dT%H:%M:%S%.3f").to_string()
            }
        }),
        Data::DateTimeIso(s) | Data::DurationIso(s) => Some(s.clone()),
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use calamine::CellErrorType;

    use super::*;

    #[test]
    fn test_cell_rendering() {
        assert_eq!(cell_value(&Data::Empty), None);
        assert_eq!(cell_value(&Data::Error(CellErrorType::NA)), None);
        assert_eq!(cell_value(&Data::Float(12345.0)).as_deref(), Some("12345"));
        assert_eq!(cell_value(&Data::Float(1.5)).as_deref(), Some("1.5"));
        assert_eq!(cell_value(&Data::Int(7)).as_deref(), Some("7"));
        assert_eq!(cell_value(&Data::Bool(true)).as_deref(), Some("true"));
        assert_eq!(
            cell_value(&Data::String("hello".to_string())).as_deref(),
            Some("hello")
        );
    }

    #[test]
    fn test_reads_first_sheet_with_header_row() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/appeals.xlsx");
        let batch = ExcelReader.read(&path).unwrap();

        assert_eq!(
            batch.column_names().collect::<Vec<_>>(),
            vec!["text", "user_id", "external_id", "timestamp", "channel"]
        );
        assert_eq!(batch.len(), 2);

        let first = batch.record(0).unwrap();
        assert_eq!(first.text.as_deref(), Some("  my card was blocked "));
        assert_eq!(first.user_id.as_deref(), Some("12345"));
        assert_eq!(first.external_id.as_deref(), Some("987"));
        assert_eq!(first.timestamp.as_deref(), Some("2024-03-10T12:00:00"));

        let second = batch.record(1).unwrap();
        assert_eq!(second.user_id.as_deref(), Some("u-2"));
        assert_eq!(second.timestamp.as_deref(), Some("2024-03-11T09:30:00Z"));
        assert!(batch
            .records()
            .all(|r| r.text.as_deref() != Some("from the second sheet")));
    }

    #[test]
    fn test_corrupt_workbook_is_a_file_error() {
        let mut file = tempfile::Builder::new().suffix(".xlsx").tempfile().unwrap();
        file.write_all(b"definitely not a zip archive").unwrap();
        assert!(matches!(
            ExcelReader.read(file.path()),
            Err(FileError::Read { .. })
        ));
    }
}
