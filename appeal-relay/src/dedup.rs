use std::collections::HashSet;
use std::time::Instant;

use tracing::debug;

use crate::error::StoreError;
use crate::message::CanonicalMessage;
use crate::metrics_consts::{DUPLICATES_IN_RUN, DUPLICATES_PERSISTED, HASH_LOOKUP_TIME};
use crate::store::MessageStore;

/// Content hashes seen so far in one file-processing run. Owned by that run alone.
#[derive(Debug, Default)]
pub struct DedupState {
    seen: HashSet<String>,
}

impl DedupState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the hash, returning false if it was already seen in this run.
    pub fn observe(&mut self, hash: &str) -> bool {
        if self.seen.contains(hash) {
            return false;
        }
        self.seen.insert(hash.to_string())
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct DedupOutcome {
    pub kept: Vec<CanonicalMessage>,
    pub seen_in_run: usize,
    pub already_stored: usize,
}

impl DedupOutcome {
    pub fn dropped(&self) -> usize {
        self.seen_in_run + self.already_stored
    }
}

/// Filters one chunk: first occurrence wins within the run, then a single lookup drops
/// whatever the store already holds. Order of the survivors is preserved.
pub async fn filter_chunk(
    state: &mut DedupState,
    chunk: Vec<CanonicalMessage>,
    store: &dyn MessageStore,
) -> Result<DedupOutcome, StoreError> {
    let before = chunk.len();
    let fresh: Vec<CanonicalMessage> = chunk
        .into_iter()
        .filter(|msg| state.observe(msg.content_hash()))
        .collect();
    let seen_in_run = before - fresh.len();

    if fresh.is_empty() {
        return Ok(DedupOutcome {
            kept: fresh,
            seen_in_run,
            already_stored: 0,
        });
    }

    let hashes: HashSet<String> = fresh
        .iter()
        .map(|msg| msg.content_hash().to_string())
        .collect();

    let start = Instant::now();
    let existing = store.get_existing_hashes(&hashes).await?;
    metrics::histogram!(HASH_LOOKUP_TIME).record(start.elapsed().as_millis() as f64);

    let candidates = fresh.len();
    let kept: Vec<CanonicalMessage> = fresh
        .into_iter()
        .filter(|msg| !existing.contains(msg.content_hash()))
        .collect();
    let already_stored = candidates - kept.len();

    metrics::counter!(DUPLICATES_IN_RUN).increment(seen_in_run as u64);
    metrics::counter!(DUPLICATES_PERSISTED).increment(already_stored as u64);
    debug!(
        kept = kept.len(),
        seen_in_run, already_stored, "deduplicated chunk"
    );

    Ok(DedupOutcome {
        kept,
        seen_in_run,
        already_stored,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{normalize, RawRecord};
    use crate::store::StoredMessage;
    use crate::test_utils::MemoryStore;

    fn msg(text: &str, user: &str) -> CanonicalMessage {
        normalize(RawRecord {
            text: Some(text.to_string()),
            user_id: Some(user.to_string()),
            external_id: None,
            timestamp: Some("2024-03-10T14:05:09Z".to_string()),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_first_occurrence_wins() {
        let store = MemoryStore::default();
        let mut state = DedupState::new();

        let a = msg("A", "first");
        let a_prime = msg("A", "second");
        let b = msg("B", "third");

        let outcome = filter_chunk(&mut state, vec![a.clone(), a_prime, b.clone()], &store)
            .await
            .unwrap();

        assert_eq!(outcome.kept, vec![a.clone(), b]);
        assert_eq!(outcome.kept[0].user_id(), Some("first"));
        assert_eq!(outcome.seen_in_run, 1);
        assert_eq!(store.lookup_count(), 1);
    }

    #[tokio::test]
    async fn test_state_spans_chunks() {
        let store = MemoryStore::default();
        let mut state = DedupState::new();

        filter_chunk(&mut state, vec![msg("A", "u")], &store)
            .await
            .unwrap();
        let outcome = filter_chunk(&mut state, vec![msg("A", "u"), msg("C", "u")], &store)
            .await
            .unwrap();

        assert_eq!(outcome.kept, vec![msg("C", "u")]);
        assert_eq!(state.len(), 2);
    }

    #[tokio::test]
    async fn test_persisted_hashes_are_dropped() {
        let store = MemoryStore::default();
        store
            .create_message(&StoredMessage::from(msg("old", "u")))
            .await
            .unwrap();
        let mut state = DedupState::new();

        let outcome = filter_chunk(&mut state, vec![msg("old", "u"), msg("new", "u")], &store)
            .await
            .unwrap();
        assert_eq!(outcome.kept, vec![msg("new", "u")]);
        assert_eq!(outcome.already_stored, 1);
        assert_eq!(outcome.dropped(), 1);
    }

    #[tokio::test]
    async fn test_fully_seen_chunk_skips_lookup() {
        let store = MemoryStore::default();
        let mut state = DedupState::new();
        state.observe(msg("A", "u").content_hash());

        let outcome = filter_chunk(&mut state, vec![msg("A", "u")], &store)
            .await
            .unwrap();
        assert!(outcome.kept.is_empty());
        assert_eq!(store.lookup_count(), 0);
    }

    #[tokio::test]
    async fn test_lookup_failure_propagates() {
        let store = MemoryStore::default();
        store.fail_lookups(true);
        let mut state = DedupState::new();

        let result = filter_chunk(&mut state, vec![msg("A", "u")], &store).await;
        assert!(matches!(result, Err(StoreError::Unavailable(_))));
    }
}
