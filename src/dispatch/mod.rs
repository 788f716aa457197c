use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use mongodb::bson::{doc, DateTime};
use mongodb::change_stream::event::ChangeStreamEvent;
use mongodb::change_stream::ChangeStream;
use mongodb::options::FullDocumentType;
use mongodb::Collection;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::models::event::{EventKind, EventProjection};
use crate::models::session::Channel;
use crate::state::SharedState;
use crate::timer::now_ms;
use crate::utils::error::AppError;

/// What subscribers actually receive, on both transports.
#[derive(Debug, Clone, Serialize)]
pub struct WireEvent {
    #[serde(rename = "type")]
    pub kind: EventKind,
    #[serde(rename = "quizCode")]
    pub quiz_code: String,
    pub data: Value,
    pub timestamp: i64,
}

impl WireEvent {
    pub fn from_projection(projection: &EventProjection) -> Self {
        Self {
            kind: projection.kind,
            quiz_code: projection.quiz_code.clone(),
            data: projection.data.clone(),
            timestamp: projection.last_updated.timestamp_millis(),
        }
    }

    pub fn timer_update(quiz_code: &str, remaining_secs: u32) -> Self {
        Self {
            kind: EventKind::TimerUpdate,
            quiz_code: quiz_code.to_string(),
            data: json!({ "timeRemaining": remaining_secs }),
            timestamp: now_ms(),
        }
    }
}

/// Per-quiz broadcast channels backing the push transport. Fan-out is
/// decoupled from the timer loop: a slow SSE consumer only lags its own
/// receiver, never the countdown.
#[derive(Default)]
pub struct SubscriberHub {
    channels: Mutex<HashMap<String, broadcast::Sender<WireEvent>>>,
}

impl SubscriberHub {
    const CAPACITY: usize = 64;

    pub fn subscribe(&self, code: &str) -> broadcast::Receiver<WireEvent> {
        let mut channels = self.channels.lock().expect("hub poisoned");
        channels
            .entry(code.to_string())
            .or_insert_with(|| broadcast::channel(Self::CAPACITY).0)
            .subscribe()
    }

    /// Best-effort: delivery to a quiz nobody is watching is a no-op.
    pub fn publish(&self, code: &str, event: WireEvent) -> usize {
        let channels = self.channels.lock().expect("hub poisoned");
        match channels.get(code) {
            Some(sender) => sender.send(event).unwrap_or(0),
            None => 0,
        }
    }

    pub fn remove(&self, code: &str) {
        self.channels.lock().expect("hub poisoned").remove(code);
    }
}

/// "Detect that the projection changed" as one interface with two
/// implementations; the dispatcher does not care which is wired in.
#[async_trait]
pub trait ChangeWatcher: Send {
    /// Next observed projection state, or None when the feed is closed.
    async fn next_change(&mut self) -> Option<EventProjection>;
}

/// Native MongoDB change stream over the projection collection.
pub struct ChangeStreamWatcher {
    stream: ChangeStream<ChangeStreamEvent<EventProjection>>,
}

impl ChangeStreamWatcher {
    pub async fn open(collection: Collection<EventProjection>) -> Result<Self, AppError> {
        let stream = collection
            .watch()
            .full_document(FullDocumentType::UpdateLookup)
            .await?;
        Ok(Self { stream })
    }
}

#[async_trait]
impl ChangeWatcher for ChangeStreamWatcher {
    async fn next_change(&mut self) -> Option<EventProjection> {
        while let Some(item) = self.stream.next().await {
            match item {
                Ok(change) => {
                    if let Some(projection) = change.full_document {
                        return Some(projection);
                    }
                }
                Err(e) => warn!(error = %e, "change stream error"),
            }
        }
        None
    }
}

/// Fixed-interval re-read for deployments without change streams. Novelty is
/// detected by `lastUpdated`, never by the timer field.
pub struct PollWatcher {
    collection: Collection<EventProjection>,
    interval: Duration,
    last_seen: DateTime,
    pending: VecDeque<EventProjection>,
}

impl PollWatcher {
    pub fn new(collection: Collection<EventProjection>, interval: Duration) -> Self {
        Self {
            collection,
            interval,
            last_seen: DateTime::now(),
            pending: VecDeque::new(),
        }
    }
}

#[async_trait]
impl ChangeWatcher for PollWatcher {
    async fn next_change(&mut self) -> Option<EventProjection> {
        loop {
            if let Some(projection) = self.pending.pop_front() {
                return Some(projection);
            }
            tokio::time::sleep(self.interval).await;
            let filter = doc! { "lastUpdated": { "$gt": self.last_seen } };
            let cursor = match self.collection.find(filter).sort(doc! { "lastUpdated": 1 }).await
            {
                Ok(cursor) => cursor,
                Err(e) => {
                    warn!(error = %e, "poll watcher query failed; retrying next interval");
                    continue;
                }
            };
            match cursor.try_collect::<Vec<_>>().await {
                Ok(rows) => {
                    for row in rows {
                        if row.last_updated > self.last_seen {
                            self.last_seen = row.last_updated;
                        }
                        self.pending.push_back(row);
                    }
                }
                Err(e) => warn!(error = %e, "poll watcher cursor failed; retrying next interval"),
            }
        }
    }
}

/// Drains the watcher and fans each observed projection out to push
/// subscribers. Runs for the life of the process.
pub async fn run_dispatcher<W: ChangeWatcher>(state: SharedState, mut watcher: W) {
    info!("notification dispatcher running");
    while let Some(projection) = watcher.next_change().await {
        dispatch_projection(&state, &projection).await;
    }
    warn!("notification dispatcher stopped: change feed closed");
}

/// One dispatch pass. Question delivery is gated by a store-side watermark
/// CAS, so concurrent dispatcher instances deliver each question to the push
/// channel at most once; everything else is best-effort.
pub async fn dispatch_projection(state: &SharedState, projection: &EventProjection) {
    let code = projection.quiz_code.as_str();
    match projection.kind {
        EventKind::TimerUpdate | EventKind::QuizStarted | EventKind::QuestionEnded => {
            state.hub.publish(code, WireEvent::from_projection(projection));
        }
        EventKind::QuizEnded => {
            state.hub.publish(code, WireEvent::from_projection(projection));
            state.hub.remove(code);
        }
        EventKind::QuestionStarted => {
            let Some(index) = projection.question_index() else {
                state.hub.publish(code, WireEvent::from_projection(projection));
                return;
            };
            match state
                .sessions
                .try_advance_watermark(code, Channel::Push, index)
                .await
            {
                Ok(true) => {
                    state.hub.publish(code, WireEvent::from_projection(projection));
                }
                Ok(false) => {
                    // Already delivered: this observation is a countdown
                    // refresh riding on the question row.
                    if let Some(remaining) = projection.time_remaining() {
                        state.hub.publish(code, WireEvent::timer_update(code, remaining));
                    }
                }
                Err(e) => {
                    warn!(quiz_code = %code, error = %e, "watermark check failed; delivery skipped");
                }
            }
        }
    }
}
