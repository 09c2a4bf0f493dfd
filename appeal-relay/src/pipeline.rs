use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde::Serialize;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::dedup::{filter_chunk, DedupState};
use crate::error::{IngestError, PipelineError, ValidationError};
use crate::message::{normalize_at, CanonicalMessage, RawRecord};
use crate::metrics_consts::{
    CHUNKS_SKIPPED, FILES_FAILED, FILES_PROCESSED, FILE_PROCESS_TIME, ROWS_INVALID, ROWS_READ,
};
use crate::publish::RelayPublisher;
use crate::store::MessageStore;
use crate::upload;

/// A record that failed validation, numbered from 1 in file or request order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RowError {
    pub row: usize,
    pub field: String,
    pub message: String,
}

impl RowError {
    fn new(row: usize, err: &ValidationError) -> Self {
        Self {
            row,
            field: err.field.to_string(),
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessReport {
    /// Records handed to the broker.
    pub record_count: usize,
    pub rows_read: usize,
    pub duplicates_skipped: usize,
    pub errors: Vec<RowError>,
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub topic: String,
    pub chunk_size: usize,
    pub max_upload_bytes: u64,
    pub max_batch_size: usize,
}

impl PipelineSettings {
    pub fn new(topic: &str) -> Self {
        Self {
            topic: topic.to_string(),
            chunk_size: 2000,
            max_upload_bytes: upload::DEFAULT_MAX_UPLOAD_BYTES,
            max_batch_size: 1000,
        }
    }
}

/// The two ingestion paths onto the relay topic: bulk files, deduplicated chunk by
/// chunk, and direct submissions, published as given.
#[derive(Clone)]
pub struct Pipeline {
    publisher: RelayPublisher,
    store: Arc<dyn MessageStore>,
    settings: PipelineSettings,
}

impl Pipeline {
    pub fn new(
        publisher: RelayPublisher,
        store: Arc<dyn MessageStore>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            publisher,
            store,
            settings,
        }
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    pub async fn process_file(&self, path: &Path) -> Result<ProcessReport, PipelineError> {
        let start = Instant::now();
        let result = self.process_file_inner(path).await;
        metrics::histogram!(FILE_PROCESS_TIME).record(start.elapsed().as_millis() as f64);

        match &result {
            Ok(report) => {
                metrics::counter!(FILES_PROCESSED).increment(1);
                info!(
                    path = %path.display(),
                    published = report.record_count,
                    rows = report.rows_read,
                    duplicates = report.duplicates_skipped,
                    invalid = report.errors.len(),
                    "processed file"
                );
            }
            Err(e) => {
                metrics::counter!(FILES_FAILED).increment(1);
                error!(path = %path.display(), "failed to process file: {}", e);
            }
        }
        result
    }

    async fn process_file_inner(&self, path: &Path) -> Result<ProcessReport, PipelineError> {
        let format = upload::admit(path, self.settings.max_upload_bytes).await?;

        let owned = path.to_path_buf();
        let batch = tokio::task::spawn_blocking(move || format.reader().read(&owned)).await??;
        format.reader().validate_structure(&batch)?;

        metrics::counter!(ROWS_READ).increment(batch.len() as u64);
        let mut report = ProcessReport {
            rows_read: batch.len(),
            ..Default::default()
        };

        // One ingestion instant per file, so undated duplicates within it hash alike
        let now = Utc::now();
        let chunk_size = self.settings.chunk_size.max(1);
        let mut state = DedupState::new();

        for chunk_start in (0..batch.len()).step_by(chunk_size) {
            let chunk_end = (chunk_start + chunk_size).min(batch.len());
            let mut chunk = Vec::with_capacity(chunk_end - chunk_start);

            for index in chunk_start..chunk_end {
                let Some(raw) = batch.record(index) else {
                    continue;
                };
                match normalize_at(raw, now) {
                    Ok(message) => chunk.push(message),
                    Err(e) => {
                        metrics::counter!(ROWS_INVALID).increment(1);
                        warn!(path = %path.display(), row = index + 1, "skipping row: {}", e);
                        report.errors.push(RowError::new(index + 1, &e));
                    }
                }
            }

            let outcome = filter_chunk(&mut state, chunk, self.store.as_ref()).await?;
            report.duplicates_skipped += outcome.dropped();
            if outcome.kept.is_empty() {
                metrics::counter!(CHUNKS_SKIPPED).increment(1);
                continue;
            }

            report.record_count += self
                .publisher
                .publish_batch(&self.settings.topic, &outcome.kept)
                .await?;
        }

        Ok(report)
    }

    /// Publishes one record straight to the relay topic, keyed by its user so a user's
    /// submissions stay ordered.
    pub async fn ingest_one(&self, raw: RawRecord) -> Result<CanonicalMessage, IngestError> {
        let message = normalize_at(raw, Utc::now())?;
        let key = message
            .user_id()
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::now_v7().to_string());

        self.publisher
            .publish_keyed(&self.settings.topic, &key, std::slice::from_ref(&message))
            .await?;
        Ok(message)
    }

    /// Validates the whole batch first; one invalid record rejects the request.
    pub async fn ingest_batch(&self, records: Vec<RawRecord>) -> Result<usize, IngestError> {
        if records.len() > self.settings.max_batch_size {
            return Err(IngestError::BatchTooLarge {
                size: records.len(),
                limit: self.settings.max_batch_size,
            });
        }

        let now = Utc::now();
        let mut messages = Vec::with_capacity(records.len());
        let mut errors = Vec::new();
        for (index, raw) in records.into_iter().enumerate() {
            match normalize_at(raw, now) {
                Ok(message) => messages.push(message),
                Err(e) => errors.push(RowError::new(index + 1, &e)),
            }
        }
        if !errors.is_empty() {
            return Err(IngestError::InvalidRecords(errors));
        }

        Ok(self
            .publisher
            .publish_batch(&self.settings.topic, &messages)
            .await?)
    }
}
