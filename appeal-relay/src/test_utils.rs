use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::consumer::{Acknowledge, Delivery, InboundMessage, InboundSource, SourceError};
use crate::error::{PublishError, StoreError};
use crate::message::CanonicalMessage;
use crate::publish::RelaySink;
use crate::store::{MessageStore, StoredMessage};

/// A store that keeps rows in insertion order and honours content-hash uniqueness.
#[derive(Default)]
pub struct MemoryStore {
    rows: Mutex<Vec<StoredMessage>>,
    lookups: AtomicUsize,
    fail_lookups: AtomicBool,
    failing_writes: AtomicUsize,
}

impl MemoryStore {
    pub fn messages(&self) -> Vec<StoredMessage> {
        self.rows.lock().unwrap().clone()
    }

    pub fn lookup_count(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }

    pub fn fail_lookups(&self, fail: bool) {
        self.fail_lookups.store(fail, Ordering::SeqCst);
    }

    pub fn fail_next_writes(&self, count: usize) {
        self.failing_writes.store(count, Ordering::SeqCst);
    }

    fn take_write_failure(&self) -> bool {
        self.failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn insert(rows: &mut Vec<StoredMessage>, message: &StoredMessage) -> bool {
        if rows.iter().any(|r| r.content_hash() == message.content_hash()) {
            return false;
        }
        rows.push(message.clone());
        true
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn get_existing_hashes(
        &self,
        hashes: &HashSet<String>,
    ) -> Result<HashSet<String>, StoreError> {
        if self.fail_lookups.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("lookups disabled".to_string()));
        }
        self.lookups.fetch_add(1, Ordering::SeqCst);
        let rows = self.rows.lock().unwrap();
        Ok(rows
            .iter()
            .map(|r| r.content_hash().to_string())
            .filter(|h| hashes.contains(h))
            .collect())
    }

    async fn create_message(&self, message: &StoredMessage) -> Result<Option<Uuid>, StoreError> {
        if self.take_write_failure() {
            return Err(StoreError::Unavailable("write failed".to_string()));
        }
        let mut rows = self.rows.lock().unwrap();
        Ok(Self::insert(&mut rows, message).then(Uuid::now_v7))
    }

    async fn create_messages_bulk(&self, messages: &[StoredMessage]) -> Result<u64, StoreError> {
        if self.take_write_failure() {
            return Err(StoreError::Unavailable("write failed".to_string()));
        }
        let mut rows = self.rows.lock().unwrap();
        Ok(messages
            .iter()
            .filter(|m| Self::insert(&mut rows, m))
            .count() as u64)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SentBatch {
    pub topic: String,
    pub key: String,
    pub messages: Vec<CanonicalMessage>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SentRaw {
    pub topic: String,
    pub payload: Vec<u8>,
    pub headers: Vec<(String, String)>,
}

/// Records what would have been produced. Optionally fails the next N sends.
#[derive(Default)]
pub struct MemorySink {
    batches: Mutex<Vec<SentBatch>>,
    raw: Mutex<Vec<SentRaw>>,
    calls: AtomicUsize,
    failing: AtomicUsize,
}

impl MemorySink {
    pub fn batches(&self) -> Vec<SentBatch> {
        self.batches.lock().unwrap().clone()
    }

    /// Every message of every acknowledged batch, in send order.
    pub fn published(&self) -> Vec<CanonicalMessage> {
        self.batches()
            .into_iter()
            .flat_map(|b| b.messages)
            .collect()
    }

    pub fn raw_messages(&self) -> Vec<SentRaw> {
        self.raw.lock().unwrap().clone()
    }

    pub fn send_calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn fail_next(&self, count: usize) {
        self.failing.store(count, Ordering::SeqCst);
    }

    fn check_failure(&self) -> Result<(), PublishError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let failed = self
            .failing
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        match failed {
            true => Err(PublishError::Timeout(Duration::from_millis(1))),
            false => Ok(()),
        }
    }
}

#[async_trait]
impl RelaySink for MemorySink {
    async fn send_batch(
        &self,
        topic: &str,
        key: &str,
        messages: &[CanonicalMessage],
    ) -> Result<(), PublishError> {
        self.check_failure()?;
        self.batches.lock().unwrap().push(SentBatch {
            topic: topic.to_string(),
            key: key.to_string(),
            messages: messages.to_vec(),
        });
        Ok(())
    }

    async fn send_raw(
        &self,
        topic: &str,
        payload: &[u8],
        headers: &[(&'static str, String)],
    ) -> Result<(), PublishError> {
        self.check_failure()?;
        self.raw.lock().unwrap().push(SentRaw {
            topic: topic.to_string(),
            payload: payload.to_vec(),
            headers: headers
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
        });
        Ok(())
    }
}

#[derive(Default)]
struct SourceState {
    queue: VecDeque<InboundMessage>,
    next_offset: HashMap<String, i64>,
    committed: Vec<(String, i32, i64)>,
    rewinds: usize,
}

/// A single-partition inbound source. Rewinding puts the message back at the head of
/// the queue, like a seek would.
#[derive(Default)]
pub struct MemorySource {
    state: Arc<Mutex<SourceState>>,
}

impl MemorySource {
    pub fn push(&self, topic: &str, payload: Vec<u8>) {
        self.push_at(topic, payload, None);
    }

    /// Enqueues a message carrying a broker timestamp.
    pub fn push_at(&self, topic: &str, payload: Vec<u8>, timestamp: Option<DateTime<Utc>>) {
        let mut state = self.state.lock().unwrap();
        let offset = state.next_offset.entry(topic.to_string()).or_insert(0);
        let message = InboundMessage {
            topic: topic.to_string(),
            partition: 0,
            offset: *offset,
            timestamp,
            payload: Some(payload),
        };
        *offset += 1;
        state.queue.push_back(message);
    }

    pub fn committed(&self) -> Vec<(String, i32, i64)> {
        self.state.lock().unwrap().committed.clone()
    }

    pub fn rewinds(&self) -> usize {
        self.state.lock().unwrap().rewinds
    }
}

struct MemoryAck {
    state: Arc<Mutex<SourceState>>,
    message: InboundMessage,
}

impl Acknowledge for MemoryAck {
    fn commit(self: Box<Self>) -> Result<(), SourceError> {
        let mut state = self.state.lock().unwrap();
        state.committed.push((
            self.message.topic.clone(),
            self.message.partition,
            self.message.offset,
        ));
        Ok(())
    }

    fn rewind(self: Box<Self>) -> Result<(), SourceError> {
        let MemoryAck { state, message } = *self;
        let mut state = state.lock().unwrap();
        state.rewinds += 1;
        state.queue.push_front(message);
        Ok(())
    }
}

#[async_trait]
impl InboundSource for MemorySource {
    async fn recv(&self, timeout: Duration) -> Result<Option<Delivery>, SourceError> {
        let next = self.state.lock().unwrap().queue.pop_front();
        match next {
            Some(message) => Ok(Some(Delivery::new(
                message.clone(),
                Box::new(MemoryAck {
                    state: self.state.clone(),
                    message,
                }),
            ))),
            None => {
                tokio::time::sleep(timeout.min(Duration::from_millis(5))).await;
                Ok(None)
            }
        }
    }
}
