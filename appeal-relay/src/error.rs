use std::path::PathBuf;
use std::time::Duration;

use common_kafka::kafka_producer::KafkaProduceError;
use thiserror::Error;

/// A single field of a single record failed validation. Recoverable: the record is
/// skipped and the rest of its chunk carries on.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid field '{field}': {reason}. {hint}")]
pub struct ValidationError {
    pub field: &'static str,
    pub reason: String,
    pub hint: &'static str,
}

impl ValidationError {
    pub fn new(field: &'static str, reason: impl Into<String>, hint: &'static str) -> Self {
        Self {
            field,
            reason: reason.into(),
            hint,
        }
    }
}

/// The file parsed but lacks required columns. Fatal for the whole file.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid file structure, missing required columns: {}", .missing.join(", "))]
pub struct StructureError {
    pub missing: Vec<String>,
}

#[derive(Error, Debug)]
pub enum FileError {
    #[error("unsupported file format '{extension}', supported: {supported}")]
    UnsupportedFormat {
        extension: String,
        supported: String,
    },
    #[error("file {} is {size} bytes, the limit is {limit}", .path.display())]
    TooLarge { path: PathBuf, size: u64, limit: u64 },
    #[error("failed to read {}: {reason}", .path.display())]
    Read { path: PathBuf, reason: String },
    #[error("io error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl FileError {
    pub fn read(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        FileError::Read {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}

/// The broker could not take a chunk. Retrying the chunk is safe.
#[derive(Error, Debug)]
pub enum PublishError {
    #[error("failed to publish {failed} of {total} records to {topic}: {source}")]
    Produce {
        topic: String,
        failed: usize,
        total: usize,
        source: KafkaProduceError,
    },
    #[error("publish to {topic} gave up after {attempts} attempts: {last}")]
    RetriesExhausted {
        topic: String,
        attempts: u32,
        last: Box<PublishError>,
    },
    #[error("broker did not acknowledge within {0:?}")]
    Timeout(Duration),
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Everything that aborts the processing of one file.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    File(#[from] FileError),
    #[error(transparent)]
    Structure(#[from] StructureError),
    #[error("existing-hash lookup failed: {0}")]
    Store(#[from] StoreError),
    #[error(transparent)]
    Publish(#[from] PublishError),
    #[error("file reader task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Failures of the direct (API) ingestion path.
#[derive(Error, Debug)]
pub enum IngestError {
    #[error(transparent)]
    Invalid(#[from] ValidationError),
    #[error("batch of {size} records exceeds the limit of {limit}")]
    BatchTooLarge { size: usize, limit: usize },
    #[error("{} of the submitted records are invalid", .0.len())]
    InvalidRecords(Vec<crate::pipeline::RowError>),
    #[error(transparent)]
    Publish(#[from] PublishError),
}
