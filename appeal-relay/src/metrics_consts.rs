pub const FILES_PROCESSED: &str = "appeal_relay_files_processed";
pub const FILES_FAILED: &str = "appeal_relay_files_failed";
pub const ROWS_READ: &str = "appeal_relay_rows_read";
pub const ROWS_INVALID: &str = "appeal_relay_rows_invalid";
pub const DUPLICATES_IN_RUN: &str = "appeal_relay_duplicates_in_run";
pub const DUPLICATES_PERSISTED: &str = "appeal_relay_duplicates_persisted";
pub const CHUNKS_SKIPPED: &str = "appeal_relay_chunks_skipped";
pub const HASH_LOOKUP_TIME: &str = "appeal_relay_hash_lookup_time_ms";
pub const FILE_PROCESS_TIME: &str = "appeal_relay_file_process_time_ms";

pub const RECORDS_PUBLISHED: &str = "appeal_relay_records_published";
pub const PUBLISH_ATTEMPTS: &str = "appeal_relay_publish_attempts";
pub const PUBLISH_TIME: &str = "appeal_relay_publish_time_ms";

pub const MESSAGES_RECEIVED: &str = "appeal_relay_messages_received";
pub const MESSAGES_IGNORED: &str = "appeal_relay_messages_ignored";
pub const MESSAGES_PERSISTED: &str = "appeal_relay_messages_persisted";
pub const MESSAGES_ALREADY_STORED: &str = "appeal_relay_messages_already_stored";
pub const MESSAGES_DROPPED: &str = "appeal_relay_messages_dropped";
pub const MESSAGES_DEAD_LETTERED: &str = "appeal_relay_messages_dead_lettered";
pub const PERSIST_FAILURES: &str = "appeal_relay_persist_failures";
pub const COMMIT_FAILURES: &str = "appeal_relay_commit_failures";
pub const HASH_MISMATCHES: &str = "appeal_relay_hash_mismatches";
pub const RECV_ERRORS: &str = "appeal_relay_recv_errors";

pub const UPLOADS_QUEUED: &str = "appeal_relay_uploads_queued";
pub const UPLOADS_REJECTED: &str = "appeal_relay_uploads_rejected";
pub const UPLOADS_IN_FLIGHT: &str = "appeal_relay_uploads_in_flight";
