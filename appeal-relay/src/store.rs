use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::{StoreError, ValidationError};
use crate::message::CanonicalMessage;

/// Classifier output that may travel alongside a relayed message. Every field is
/// optional; scores are probabilities.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Classification {
    pub source: Option<String>,
    #[serde(alias = "cleaned_text")]
    pub cleaned_text: Option<String>,
    #[serde(alias = "lang_code")]
    pub lang_code: Option<String>,
    #[serde(alias = "lang_score")]
    pub lang_score: Option<f64>,
    #[serde(alias = "sentiment_label")]
    pub sentiment_label: Option<String>,
    #[serde(alias = "sentiment_score")]
    pub sentiment_score: Option<f64>,
    #[serde(alias = "emotion_label")]
    pub emotion_label: Option<String>,
    #[serde(alias = "emotion_score")]
    pub emotion_score: Option<f64>,
    #[serde(rename = "categoryLevel1", alias = "category_level_1")]
    pub category_level_1: Option<String>,
    #[serde(rename = "categoryLevel2", alias = "category_level_2")]
    pub category_level_2: Option<Vec<String>>,
}

impl Classification {
    pub fn validate(&self) -> Result<(), ValidationError> {
        for (field, score) in [
            ("langScore", self.lang_score),
            ("sentimentScore", self.sentiment_score),
            ("emotionScore", self.emotion_score),
        ] {
            if let Some(score) = score {
                if !(0.0..=1.0).contains(&score) {
                    return Err(ValidationError::new(
                        field,
                        format!("{score} is outside [0, 1]"),
                        "Scores are probabilities between 0 and 1",
                    ));
                }
            }
        }
        Ok(())
    }
}

/// A row of the `messages` table, as written by the relay consumer.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredMessage {
    pub message: CanonicalMessage,
    pub classification: Classification,
}

impl StoredMessage {
    pub fn new(message: CanonicalMessage, classification: Classification) -> Self {
        Self {
            message,
            classification,
        }
    }

    pub fn content_hash(&self) -> &str {
        self.message.content_hash()
    }
}

impl From<CanonicalMessage> for StoredMessage {
    fn from(message: CanonicalMessage) -> Self {
        Self::new(message, Classification::default())
    }
}

#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Returns the subset of `hashes` that already have a stored row.
    async fn get_existing_hashes(
        &self,
        hashes: &HashSet<String>,
    ) -> Result<HashSet<String>, StoreError>;

    /// Inserts one message. `None` means a row with the same content hash already
    /// existed and nothing was written.
    async fn create_message(&self, message: &StoredMessage) -> Result<Option<Uuid>, StoreError>;

    /// Inserts many messages in one statement, skipping content hashes already stored.
    /// Returns the number of rows written.
    async fn create_messages_bulk(&self, messages: &[StoredMessage]) -> Result<u64, StoreError>;

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[derive(Clone)]
pub struct PgMessageStore {
    pool: PgPool,
}

impl PgMessageStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .connect(url)
            .await?;
        Ok(Self::new(pool))
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Unavailable(format!("migration failed: {e}")))
    }
}

#[async_trait]
impl MessageStore for PgMessageStore {
    async fn get_existing_hashes(
        &self,
        hashes: &HashSet<String>,
    ) -> Result<HashSet<String>, StoreError> {
        if hashes.is_empty() {
            return Ok(HashSet::new());
        }
        let hashes: Vec<&str> = hashes.iter().map(String::as_str).collect();

        let found: Vec<String> =
            sqlx::query_scalar("SELECT content_hash FROM messages WHERE content_hash = ANY($1)")
                .bind(&hashes)
                .fetch_all(&self.pool)
                .await?;

        Ok(found.into_iter().collect())
    }

    async fn create_message(&self, stored: &StoredMessage) -> Result<Option<Uuid>, StoreError> {
        let msg = &stored.message;
        let class = &stored.classification;

        let id: Option<Uuid> = sqlx::query_scalar(
            r#"
            INSERT INTO messages (
                id, external_id, user_id, text, event_date, content_hash,
                source, cleaned_text, lang_code, lang_score,
                sentiment_label, sentiment_score, emotion_label, emotion_score,
                category_level_1, category_level_2)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            ON CONFLICT (content_hash) DO NOTHING
            RETURNING id"#,
        )
        .bind(Uuid::now_v7())
        .bind(msg.external_id())
        .bind(msg.user_id())
        .bind(msg.text())
        .bind(msg.timestamp())
        .bind(msg.content_hash())
        .bind(&class.source)
        .bind(&class.cleaned_text)
        .bind(&class.lang_code)
        .bind(class.lang_score)
        .bind(&class.sentiment_label)
        .bind(class.sentiment_score)
        .bind(&class.emotion_label)
        .bind(class.emotion_score)
        .bind(&class.category_level_1)
        .bind(class.category_level_2.as_ref().map(|c| serde_json::json!(c)))
        .fetch_optional(&self.pool)
        .await?;

        Ok(id)
    }

    async fn create_messages_bulk(&self, messages: &[StoredMessage]) -> Result<u64, StoreError> {
        if messages.is_empty() {
            return Ok(0);
        }
        let columns = BulkColumns::from(messages);

        let result = sqlx::query(
            r#"
            INSERT INTO messages (
                id, external_id, user_id, text, event_date, content_hash,
                source, cleaned_text, lang_code, lang_score,
                sentiment_label, sentiment_score, emotion_label, emotion_score,
                category_level_1, category_level_2)
                (SELECT * FROM UNNEST(
                    $1::uuid[],
                    $2::text[],
                    $3::text[],
                    $4::text[],
                    $5::timestamptz[],
                    $6::varchar[],
                    $7::text[],
                    $8::text[],
                    $9::text[],
                    $10::float8[],
                    $11::text[],
                    $12::float8[],
                    $13::text[],
                    $14::float8[],
                    $15::text[],
                    $16::jsonb[]))
            ON CONFLICT (content_hash) DO NOTHING"#,
        )
        .bind(&columns.ids)
        .bind(&columns.external_ids)
        .bind(&columns.user_ids)
        .bind(&columns.texts)
        .bind(&columns.event_dates)
        .bind(&columns.content_hashes)
        .bind(&columns.sources)
        .bind(&columns.cleaned_texts)
        .bind(&columns.lang_codes)
        .bind(&columns.lang_scores)
        .bind(&columns.sentiment_labels)
        .bind(&columns.sentiment_scores)
        .bind(&columns.emotion_labels)
        .bind(&columns.emotion_scores)
        .bind(&columns.categories_1)
        .bind(&columns.categories_2)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[derive(Default)]
struct BulkColumns {
    ids: Vec<Uuid>,
    external_ids: Vec<Option<String>>,
    user_ids: Vec<Option<String>>,
    texts: Vec<String>,
    event_dates: Vec<DateTime<Utc>>,
    content_hashes: Vec<String>,
    sources: Vec<Option<String>>,
    cleaned_texts: Vec<Option<String>>,
    lang_codes: Vec<Option<String>>,
    lang_scores: Vec<Option<f64>>,
    sentiment_labels: Vec<Option<String>>,
    sentiment_scores: Vec<Option<f64>>,
    emotion_labels: Vec<Option<String>>,
    emotion_scores: Vec<Option<f64>>,
    categories_1: Vec<Option<String>>,
    categories_2: Vec<Option<serde_json::Value>>,
}

impl From<&[StoredMessage]> for BulkColumns {
    fn from(messages: &[StoredMessage]) -> Self {
        let mut cols = BulkColumns::default();
        for stored in messages {
            let msg = &stored.message;
            let class = stored.classification.clone();
            cols.ids.push(Uuid::now_v7());
            cols.external_ids.push(msg.external_id().map(str::to_string));
            cols.user_ids.push(msg.user_id().map(str::to_string));
            cols.texts.push(msg.text().to_string());
            cols.event_dates.push(msg.timestamp());
            cols.content_hashes.push(msg.content_hash().to_string());
            cols.sources.push(class.source);
            cols.cleaned_texts.push(class.cleaned_text);
            cols.lang_codes.push(class.lang_code);
            cols.lang_scores.push(class.lang_score);
            cols.sentiment_labels.push(class.sentiment_label);
            cols.sentiment_scores.push(class.sentiment_score);
            cols.emotion_labels.push(class.emotion_label);
            cols.emotion_scores.push(class.emotion_score);
            cols.categories_1.push(class.category_level_1);
            cols.categories_2
                .push(class.category_level_2.map(|c| serde_json::json!(c)));
        }
        cols
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::message::{normalize, RawRecord};

    fn stored(text: &str, ts: &str) -> StoredMessage {
        normalize(RawRecord {
            text: Some(text.to_string()),
            user_id: Some("u1".to_string()),
            external_id: Some("e1".to_string()),
            timestamp: Some(ts.to_string()),
        })
        .unwrap()
        .into()
    }

    #[test]
    fn test_classification_scores_must_be_probabilities() {
        let ok = Classification {
            sentiment_score: Some(0.0),
            emotion_score: Some(1.0),
            ..Default::default()
        };
        assert!(ok.validate().is_ok());

        let bad = Classification {
            lang_score: Some(1.2),
            ..Default::default()
        };
        assert_eq!(bad.validate().unwrap_err().field, "langScore");
    }

    #[test]
    fn test_classification_accepts_both_casings() {
        let camel: Classification = serde_json::from_value(json!({
            "sentimentLabel": "negative",
            "categoryLevel1": "billing",
            "categoryLevel2": ["refund", "card"]
        }))
        .unwrap();
        let snake: Classification = serde_json::from_value(json!({
            "sentiment_label": "negative",
            "category_level_1": "billing",
            "category_level_2": ["refund", "card"]
        }))
        .unwrap();
        assert_eq!(camel, snake);
        assert_eq!(camel.category_level_2.unwrap().len(), 2);
    }

    #[sqlx::test(migrations = "./migrations")]
    #[ignore = "requires a postgres database"]
    async fn test_insert_is_idempotent_on_content_hash(pool: PgPool) {
        let store = PgMessageStore::new(pool);
        let first = stored("where is my refund", "2024-03-10T14:05:09Z");

        assert!(store.create_message(&first).await.unwrap().is_some());
        assert!(store.create_message(&first).await.unwrap().is_none());

        let second = stored("card blocked", "2024-03-10T14:05:09Z");
        let written = store
            .create_messages_bulk(&[first.clone(), second.clone(), second.clone()])
            .await
            .unwrap();
        assert_eq!(written, 1);

        let probe: HashSet<String> = [
            first.content_hash().to_string(),
            second.content_hash().to_string(),
            "0".repeat(64),
        ]
        .into_iter()
        .collect();
        let existing = store.get_existing_hashes(&probe).await.unwrap();
        assert_eq!(existing.len(), 2);
        assert!(!existing.contains(&"0".repeat(64)));
    }
}
