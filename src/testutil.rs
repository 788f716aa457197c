use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use mongodb::bson::DateTime;
use serde_json::Value;

use crate::dispatch::SubscriberHub;
use crate::models::event::{EventKind, EventProjection, EventStore};
use crate::models::session::{
    answer_slot, AnswerRecord, Channel, QuestionResult, QuizSession, QuizStatus, SessionStore,
};
use crate::state::{AppState, SharedState};
use crate::timer::{TimerRegistry, TimerSettings};
use crate::utils::error::AppError;

/// In-memory `SessionStore` whose conditional operations mirror the Mongo
/// filters under one mutex, so CAS semantics hold under concurrent tasks.
#[derive(Default)]
pub struct MemorySessionStore {
    sessions: Mutex<HashMap<String, QuizSession>>,
    timeline: Mutex<Vec<(u32, u32)>>,
}

impl MemorySessionStore {
    /// Every (question index, remaining secs) write, in order.
    pub fn timeline(&self) -> Vec<(u32, u32)> {
        self.timeline.lock().expect("lock poisoned").clone()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn create(&self, session: &QuizSession) -> Result<(), AppError> {
        let mut sessions = self.sessions.lock().expect("lock poisoned");
        if sessions.contains_key(&session.quiz_code) {
            return Err(AppError::StateConflict("quiz code already in use".to_string()));
        }
        sessions.insert(session.quiz_code.clone(), session.clone());
        Ok(())
    }

    async fn load(&self, code: &str) -> Result<QuizSession, AppError> {
        self.sessions
            .lock()
            .expect("lock poisoned")
            .get(code)
            .cloned()
            .ok_or(AppError::NotFound)
    }

    async fn try_activate(&self, code: &str) -> Result<bool, AppError> {
        let mut sessions = self.sessions.lock().expect("lock poisoned");
        match sessions.get_mut(code) {
            Some(s) if s.status == QuizStatus::Waiting => {
                s.status = QuizStatus::Active;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn try_start_question(
        &self,
        code: &str,
        index: u32,
        started_at_ms: i64,
        duration_secs: u32,
    ) -> Result<bool, AppError> {
        let mut sessions = self.sessions.lock().expect("lock poisoned");
        match sessions.get_mut(code) {
            Some(s)
                if s.status == QuizStatus::Active && s.current_question_index == index =>
            {
                s.question_started_at = Some(started_at_ms);
                s.time_remaining = duration_secs;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn set_time_remaining(
        &self,
        code: &str,
        index: u32,
        secs: u32,
    ) -> Result<(), AppError> {
        let mut sessions = self.sessions.lock().expect("lock poisoned");
        if let Some(s) = sessions.get_mut(code) {
            if s.status == QuizStatus::Active && s.current_question_index == index {
                s.time_remaining = secs;
                self.timeline.lock().expect("lock poisoned").push((index, secs));
            }
        }
        Ok(())
    }

    async fn try_insert_answer(
        &self,
        code: &str,
        player_id: &str,
        index: u32,
        record: &AnswerRecord,
    ) -> Result<bool, AppError> {
        let mut sessions = self.sessions.lock().expect("lock poisoned");
        let Some(s) = sessions.get_mut(code) else {
            return Ok(false);
        };
        if s.status != QuizStatus::Active || s.current_question_index != index {
            return Ok(false);
        }
        let slot = answer_slot(index);
        let per_player = s.player_answers.entry(player_id.to_string()).or_default();
        if per_player.contains_key(&slot) {
            return Ok(false);
        }
        per_player.insert(slot, record.clone());
        Ok(true)
    }

    async fn push_question_result(
        &self,
        code: &str,
        result: &QuestionResult,
    ) -> Result<(), AppError> {
        let mut sessions = self.sessions.lock().expect("lock poisoned");
        if let Some(s) = sessions.get_mut(code) {
            s.question_results.push(result.clone());
            s.time_remaining = 0;
        }
        Ok(())
    }

    async fn try_advance_question(&self, code: &str, from_index: u32) -> Result<bool, AppError> {
        let mut sessions = self.sessions.lock().expect("lock poisoned");
        match sessions.get_mut(code) {
            Some(s)
                if s.status == QuizStatus::Active
                    && s.current_question_index == from_index =>
            {
                s.current_question_index += 1;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn try_finish(&self, code: &str) -> Result<bool, AppError> {
        let mut sessions = self.sessions.lock().expect("lock poisoned");
        match sessions.get_mut(code) {
            Some(s) if s.status != QuizStatus::Finished => {
                s.status = QuizStatus::Finished;
                s.finished_at = Some(DateTime::now());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn try_advance_watermark(
        &self,
        code: &str,
        channel: Channel,
        index: u32,
    ) -> Result<bool, AppError> {
        let mut sessions = self.sessions.lock().expect("lock poisoned");
        let Some(s) = sessions.get_mut(code) else {
            return Ok(false);
        };
        if s.current_question_index < index {
            return Ok(false);
        }
        let watermark = match channel {
            Channel::Push => &mut s.last_notified.push,
            Channel::Poll => &mut s.last_notified.poll,
        };
        if *watermark < index as i64 {
            *watermark = index as i64;
            Ok(true)
        } else {
            Ok(false)
        }
    }
}

#[derive(Default)]
pub struct MemoryEventStore {
    rows: Mutex<HashMap<String, EventProjection>>,
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn publish(&self, code: &str, kind: EventKind, data: Value) -> Result<(), AppError> {
        self.rows.lock().expect("lock poisoned").insert(
            code.to_string(),
            EventProjection {
                quiz_code: code.to_string(),
                kind,
                data,
                last_updated: DateTime::now(),
            },
        );
        Ok(())
    }

    async fn refresh_timer(&self, code: &str, remaining_secs: u32) -> Result<(), AppError> {
        let mut rows = self.rows.lock().expect("lock poisoned");
        if let Some(row) = rows.get_mut(code) {
            // Only the countdown number moves; kind and payload stay put.
            row.data["timeRemaining"] = remaining_secs.into();
            row.last_updated = DateTime::now();
        }
        Ok(())
    }

    async fn latest(&self, code: &str) -> Result<Option<EventProjection>, AppError> {
        Ok(self.rows.lock().expect("lock poisoned").get(code).cloned())
    }
}

pub fn test_state(tick: Duration, grace: Duration) -> (SharedState, Arc<MemorySessionStore>) {
    let sessions = Arc::new(MemorySessionStore::default());
    let state = Arc::new(AppState {
        sessions: sessions.clone(),
        events: Arc::new(MemoryEventStore::default()),
        hub: SubscriberHub::default(),
        timers: TimerRegistry::default(),
        timer_settings: TimerSettings { tick, grace },
    });
    (state, sessions)
}
