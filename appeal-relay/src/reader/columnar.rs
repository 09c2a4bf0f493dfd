use std::fs::File;
use std::path::Path;

use chrono::{DateTime, NaiveDate, TimeDelta, Utc};
use parquet::file::reader::{FileReader, SerializedFileReader};
use parquet::record::Field;

use super::{BatchBuilder, TableReader, TabularBatch};
use crate::error::FileError;
use crate::message::canonical_timestamp;

/// Parquet files, read row by row through the record API.
pub struct ParquetReader;

impl TableReader for ParquetReader {
    fn read(&self, path: &Path) -> Result<TabularBatch, FileError> {
        let file = File::open(path).map_err(|source| FileError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let reader = SerializedFileReader::new(file).map_err(|e| FileError::read(path, e))?;

        let mut builder = BatchBuilder::new();
        for field in reader.metadata().file_metadata().schema().get_fields() {
            builder.declare_column(field.name());
        }

        let rows = reader
            .get_row_iter(None)
            .map_err(|e| FileError::read(path, e))?;
        for (position, row) in rows.enumerate() {
            let row = row.map_err(|e| FileError::read(path, format!("row {position}: {e}")))?;
            builder.push_row(
                row.get_column_iter()
                    .map(|(name, field)| (name.as_str(), field_value(field))),
            );
        }

        Ok(builder.finish())
    }
}

fn field_value(field: &Field) -> Option<String> {
    match field {
        Field::Null => None,
        Field::Str(s) => Some(s.clone()),
        Field::TimestampMillis(ms) => from_micros(ms.checked_mul(1_000)?),
        Field::TimestampMicros(us) => from_micros(*us),
        Field::Date(days) => NaiveDate::from_ymd_opt(1970, 1, 1)?
            .checked_add_signed(TimeDelta::try_days(i64::from(*days))?)
            .map(|d| d.format("%Y-%m-%d").to_string()),
        other => Some(other.to_string()),
    }
}

fn from_micros(micros: i64) -> Option<String> {
    let secs = micros.div_euclid(1_000_000);
    let nanos = u32::try_from(micros.rem_euclid(1_000_000) * 1_000).ok()?;
    DateTime::<Utc>::from_timestamp(secs, nanos).map(|ts| canonical_timestamp(&ts))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use parquet::data_type::{ByteArray, ByteArrayType, Int64Type};
    use parquet::file::properties::WriterProperties;
    use parquet::file::writer::SerializedFileWriter;
    use parquet::schema::parser::parse_message_type;

    use super::*;

    fn write_fixture(path: &Path, rows: &[(&str, &str, i64)]) {
        let schema = Arc::new(
            parse_message_type(
                "message appeals {
                    REQUIRED BINARY text (UTF8);
                    REQUIRED BINARY user_id (UTF8);
                    OPTIONAL BINARY external_id (UTF8);
                    REQUIRED INT64 timestamp (TIMESTAMP_MILLIS);
                }",
            )
            .unwrap(),
        );
        let props = Arc::new(WriterProperties::builder().build());
        let file = File::create(path).unwrap();
        let mut writer = SerializedFileWriter::new(file, schema, props).unwrap();
        let mut row_group = writer.next_row_group().unwrap();

        for column in 0..2 {
            let mut col_writer = row_group.next_column().unwrap().unwrap();
            let values = rows
                .iter()
                .map(|row| ByteArray::from(if column == 0 { row.0 } else { row.1 }))
                .collect::<Vec<_>>();
            col_writer
                .typed::<ByteArrayType>()
                .write_batch(&values, None, None)
                .unwrap();
            col_writer.close().unwrap();
        }

        // external_id is null on every row
        let mut col_writer = row_group.next_column().unwrap().unwrap();
        let def_levels = vec![0i16; rows.len()];
        col_writer
            .typed::<ByteArrayType>()
            .write_batch(&[], Some(&def_levels), None)
            .unwrap();
        col_writer.close().unwrap();

        let mut col_writer = row_group.next_column().unwrap().unwrap();
        let millis = rows.iter().map(|row| row.2).collect::<Vec<_>>();
        col_writer
            .typed::<Int64Type>()
            .write_batch(&millis, None, None)
            .unwrap();
        col_writer.close().unwrap();

        row_group.close().unwrap();
        writer.close().unwrap();
    }

    #[test]
    fn test_reads_rows_and_timestamps() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("appeals.parquet");
        write_fixture(
            &path,
            &[
                ("blocked card", "u1", 1_710_079_509_000),
                ("late delivery", "u2", 1_710_079_509_250),
            ],
        );

        let batch = ParquetReader.read(&path).unwrap();
        assert!(ParquetReader.validate_structure(&batch).is_ok());
        assert_eq!(batch.len(), 2);

        let first = batch.record(0).unwrap();
        assert_eq!(first.text.as_deref(), Some("blocked card"));
        assert_eq!(first.user_id.as_deref(), Some("u1"));
        assert_eq!(first.external_id, None);
        assert_eq!(first.timestamp.as_deref(), Some("2024-03-10T14:05:09Z"));
        assert_eq!(
            batch.record(1).unwrap().timestamp.as_deref(),
            Some("2024-03-10T14:05:09.250Z")
        );
    }

    #[test]
    fn test_field_rendering() {
        assert_eq!(field_value(&Field::Null), None);
        assert_eq!(field_value(&Field::Long(42)).as_deref(), Some("42"));
        assert_eq!(field_value(&Field::Date(19792)).as_deref(), Some("2024-03-10"));
        assert_eq!(
            field_value(&Field::TimestampMicros(0)).as_deref(),
            Some("1970-01-01T00:00:00Z")
        );
    }

    #[test]
    fn test_not_parquet_is_a_file_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.parquet");
        std::fs::write(&path, b"PAR1 but not really").unwrap();
        assert!(matches!(ParquetReader.read(&path), Err(FileError::Read { .. })));
    }
}
