use async_trait::async_trait;
use mongodb::bson::{doc, to_bson, DateTime};
use mongodb::{Collection, Database};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum::Display;

use crate::utils::error::AppError;

#[derive(Debug, Clone, Copy, Display, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum EventKind {
    QuizStarted,
    QuestionStarted,
    QuestionEnded,
    TimerUpdate,
    QuizEnded,
}

/// Read-optimized current-state view: exactly one row per quiz code holding
/// the most recent significant transition and its payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventProjection {
    #[serde(rename = "quizCode")]
    pub quiz_code: String,
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub data: Value,
    #[serde(rename = "lastUpdated")]
    pub last_updated: DateTime,
}

impl EventProjection {
    /// Question index carried by the payload, when the event has one.
    pub fn question_index(&self) -> Option<u32> {
        self.data
            .get("questionIndex")
            .and_then(Value::as_u64)
            .map(|i| i as u32)
    }

    pub fn time_remaining(&self) -> Option<u32> {
        self.data
            .get("timeRemaining")
            .and_then(Value::as_u64)
            .map(|i| i as u32)
    }
}

/// Derives the per-quiz projection from session mutations. `publish` replaces
/// the whole row; `refresh_timer` only touches the countdown number so a
/// frequent timer write can never mask an unseen significant transition.
#[async_trait]
pub trait EventStore: Send + Sync {
    async fn publish(&self, code: &str, kind: EventKind, data: Value) -> Result<(), AppError>;

    async fn refresh_timer(&self, code: &str, remaining_secs: u32) -> Result<(), AppError>;

    /// Snapshot for reconnect replay on the push channel.
    async fn latest(&self, code: &str) -> Result<Option<EventProjection>, AppError>;
}

pub struct MongoEventStore {
    collection: Collection<EventProjection>,
}

impl MongoEventStore {
    pub fn new(db: &Database) -> Self {
        Self {
            collection: db.collection::<EventProjection>("quizEvents"),
        }
    }

    pub fn collection(&self) -> Collection<EventProjection> {
        self.collection.clone()
    }
}

#[async_trait]
impl EventStore for MongoEventStore {
    async fn publish(&self, code: &str, kind: EventKind, data: Value) -> Result<(), AppError> {
        let data = to_bson(&data).map_err(|e| AppError::StoreUnavailable(e.to_string()))?;
        self.collection
            .update_one(
                doc! { "quizCode": code },
                doc! { "$set": {
                    "type": kind.to_string(),
                    "data": data,
                    "lastUpdated": DateTime::now(),
                } },
            )
            .upsert(true)
            .await?;
        Ok(())
    }

    async fn refresh_timer(&self, code: &str, remaining_secs: u32) -> Result<(), AppError> {
        // No upsert: a timer refresh must never create or replace a row.
        self.collection
            .update_one(
                doc! { "quizCode": code },
                doc! { "$set": {
                    "data.timeRemaining": remaining_secs,
                    "lastUpdated": DateTime::now(),
                } },
            )
            .await?;
        Ok(())
    }

    async fn latest(&self, code: &str) -> Result<Option<EventProjection>, AppError> {
        Ok(self.collection.find_one(doc! { "quizCode": code }).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::MemoryEventStore;
    use serde_json::json;

    #[tokio::test]
    async fn timer_refresh_preserves_the_last_significant_event() {
        let store = MemoryEventStore::default();
        store
            .publish(
                "AB3X9K",
                EventKind::QuestionStarted,
                json!({ "questionIndex": 0, "question": "q0", "timeRemaining": 30 }),
            )
            .await
            .unwrap();

        store.refresh_timer("AB3X9K", 12).await.unwrap();

        // Only the countdown number moved; a frequent timer write must never
        // mask the question row it rides on.
        let row = store.latest("AB3X9K").await.unwrap().unwrap();
        assert_eq!(row.kind, EventKind::QuestionStarted);
        assert_eq!(row.question_index(), Some(0));
        assert_eq!(row.data["question"], "q0");
        assert_eq!(row.time_remaining(), Some(12));
    }

    #[tokio::test]
    async fn timer_refresh_never_creates_a_row() {
        let store = MemoryEventStore::default();
        store.refresh_timer("NOPE42", 5).await.unwrap();
        assert!(store.latest("NOPE42").await.unwrap().is_none());
    }
}
