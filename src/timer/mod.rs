use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde_json::json;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::models::event::EventKind;
use crate::models::session::{QuizSession, QuizStatus};
use crate::state::SharedState;
use crate::utils::error::AppError;

/// Tick cadence and the pause between a question ending and the next one
/// starting. Tests shrink these; production uses the defaults.
#[derive(Debug, Clone, Copy)]
pub struct TimerSettings {
    pub tick: Duration,
    pub grace: Duration,
}

impl Default for TimerSettings {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(1),
            grace: Duration::from_secs(5),
        }
    }
}

pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Remaining whole seconds for a question, recomputed from its start
/// timestamp so a delayed or skipped tick self-corrects instead of drifting.
/// A start timestamp in the future clamps elapsed time to zero; the second
/// return value flags that anomaly for logging.
pub fn remaining_seconds(duration_secs: u32, started_at_ms: i64, now_ms: i64) -> (u32, bool) {
    let anomaly = now_ms < started_at_ms;
    let elapsed_ms = if anomaly { 0 } else { now_ms - started_at_ms };
    let duration_ms = duration_secs as i64 * 1000;
    let remaining_ms = (duration_ms - elapsed_ms).max(0);
    // Round up so the countdown shows the full final second.
    (((remaining_ms + 999) / 1000) as u32, anomaly)
}

/// One cancellation token per running quiz, keyed by quiz code. Owned by the
/// shared app state and torn down deterministically when a quiz ends.
#[derive(Default)]
pub struct TimerRegistry {
    inner: Mutex<HashMap<String, CancellationToken>>,
}

impl TimerRegistry {
    /// Registers a fresh token for `code`, cancelling any stale one left by a
    /// previous run of the same quiz.
    pub fn register(&self, code: &str) -> CancellationToken {
        let token = CancellationToken::new();
        let mut inner = self.inner.lock().expect("timer registry poisoned");
        if let Some(stale) = inner.insert(code.to_string(), token.clone()) {
            stale.cancel();
        }
        token
    }

    /// Cancels and removes the entry. Returns whether a task was running.
    pub fn cancel(&self, code: &str) -> bool {
        let mut inner = self.inner.lock().expect("timer registry poisoned");
        match inner.remove(code) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn remove(&self, code: &str) {
        self.inner
            .lock()
            .expect("timer registry poisoned")
            .remove(code);
    }

    pub fn is_running(&self, code: &str) -> bool {
        self.inner
            .lock()
            .expect("timer registry poisoned")
            .contains_key(code)
    }
}

pub fn question_started_payload(
    session: &QuizSession,
    index: u32,
    started_at_ms: i64,
) -> serde_json::Value {
    let question = session.question(index);
    json!({
        "questionIndex": index,
        "question": question.map(|q| q.question_text().to_owned()),
        "options": question.map(|q| q.options().clone()),
        "selectCount": question.map(|q| q.select_count()),
        "timeLimit": session.timer_duration,
        "timeRemaining": session.timer_duration,
        "questionStartedAt": started_at_ms,
        "totalQuestions": session.total_questions(),
    })
}

pub fn quiz_ended_payload(session: &QuizSession) -> serde_json::Value {
    json!({
        "finalResults": {
            "totalQuestions": session.total_questions(),
            "questionResults": session.question_results,
            "leaderboard": session.leaderboard(),
            "completedAt": now_ms(),
        }
    })
}

/// Per-quiz driver task: walks the question sequence, owns the countdown and
/// all question-advancement writes. Exactly one instance runs per quiz code;
/// every store write is still CAS-guarded in case another process races it.
pub async fn run_quiz(state: SharedState, code: String, token: CancellationToken) {
    match drive(&state, &code, &token).await {
        Ok(()) => info!(quiz_code = %code, "timer loop stopped"),
        // A permanently failing store is fatal to this session only.
        Err(e) => error!(quiz_code = %code, error = %e, "timer loop aborted"),
    }
    state.timers.remove(&code);
}

async fn drive(
    state: &SharedState,
    code: &str,
    token: &CancellationToken,
) -> Result<(), AppError> {
    let session = state.sessions.load(code).await?;
    let total = session.total_questions();
    let duration = session.timer_duration;
    let mut index = session.current_question_index;

    loop {
        if index >= total {
            break;
        }
        let started_at = now_ms();
        if !state
            .sessions
            .try_start_question(code, index, started_at, duration)
            .await?
        {
            // Another writer moved the session; resync or stop.
            let current = state.sessions.load(code).await?;
            if current.status != QuizStatus::Active {
                return Ok(());
            }
            index = current.current_question_index;
            continue;
        }

        let session = state.sessions.load(code).await?;
        state
            .events
            .publish(
                code,
                EventKind::QuestionStarted,
                question_started_payload(&session, index, started_at),
            )
            .await?;
        info!(quiz_code = %code, question = index + 1, total, "question started");

        run_countdown(state, code, token, index, duration, started_at).await?;
        if token.is_cancelled() {
            return Ok(());
        }

        // Countdown elapsed: tally and persist this question's results.
        let session = state.sessions.load(code).await?;
        if let Some(result) = session.tally(index) {
            state.sessions.push_question_result(code, &result).await?;
            state
                .events
                .publish(
                    code,
                    EventKind::QuestionEnded,
                    json!({ "questionIndex": index, "results": &result }),
                )
                .await?;
            info!(
                quiz_code = %code,
                question = index + 1,
                answers = result.total_answers,
                "question ended"
            );
        }

        if index + 1 >= total {
            break;
        }

        // Grace window before the next question, interruptible by end-quiz.
        tokio::select! {
            _ = token.cancelled() => return Ok(()),
            _ = tokio::time::sleep(state.timer_settings.grace) => {}
        }

        if state.sessions.try_advance_question(code, index).await? {
            index += 1;
        } else {
            let current = state.sessions.load(code).await?;
            if current.status != QuizStatus::Active {
                return Ok(());
            }
            index = current.current_question_index;
        }
    }

    finish_quiz(state, code).await
}

async fn run_countdown(
    state: &SharedState,
    code: &str,
    token: &CancellationToken,
    index: u32,
    duration: u32,
    started_at: i64,
) -> Result<(), AppError> {
    let mut ticker = tokio::time::interval(state.timer_settings.tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = token.cancelled() => return Ok(()),
            _ = ticker.tick() => {}
        }
        let (remaining, anomaly) = remaining_seconds(duration, started_at, now_ms());
        if anomaly {
            warn!(
                quiz_code = %code,
                question = index,
                started_at,
                "question start timestamp is in the future; clamping elapsed time to zero"
            );
        }
        // Tick writes are retried implicitly: the next tick recomputes from
        // the start timestamp, so a transient store failure only delays the
        // visible countdown.
        if let Err(e) = state.sessions.set_time_remaining(code, index, remaining).await {
            warn!(quiz_code = %code, error = %e, "countdown write failed; retrying next tick");
            continue;
        }
        if let Err(e) = state.events.refresh_timer(code, remaining).await {
            warn!(quiz_code = %code, error = %e, "projection refresh failed; retrying next tick");
        }
        if remaining == 0 {
            return Ok(());
        }
    }
}

/// Terminal transition plus the final broadcast. Loses gracefully when some
/// other caller (an explicit end-quiz) finished the session first.
pub async fn finish_quiz(state: &SharedState, code: &str) -> Result<(), AppError> {
    if state.sessions.try_finish(code).await? {
        let session = state.sessions.load(code).await?;
        state
            .events
            .publish(code, EventKind::QuizEnded, quiz_ended_payload(&session))
            .await?;
        info!(quiz_code = %code, "quiz finished");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::test_state;
    use crate::models::session::{QuestionSpec, SessionStore};
    use std::collections::BTreeMap;

    fn question(correct: &str) -> QuestionSpec {
        QuestionSpec::SingleChoice {
            question: "?".to_string(),
            options: BTreeMap::from([
                ("A".to_string(), "a".to_string()),
                ("B".to_string(), "b".to_string()),
            ]),
            correct: correct.to_string(),
            explanation: None,
            points: None,
        }
    }

    #[test]
    fn remaining_counts_down_from_full_duration() {
        assert_eq!(remaining_seconds(30, 0, 0), (30, false));
        assert_eq!(remaining_seconds(30, 0, 10_000), (20, false));
        assert_eq!(remaining_seconds(30, 0, 29_500), (1, false));
        assert_eq!(remaining_seconds(30, 0, 30_000), (0, false));
        assert_eq!(remaining_seconds(30, 0, 90_000), (0, false));
    }

    #[test]
    fn future_start_timestamp_is_clamped_not_negative() {
        // Start stored 500ms ahead of now: elapsed clamps to zero and the
        // countdown reads the full duration.
        let (remaining, anomaly) = remaining_seconds(30, 10_500, 10_000);
        assert_eq!(remaining, 30);
        assert!(anomaly);
    }

    #[test]
    fn registry_cancels_stale_token_on_reregister() {
        let registry = TimerRegistry::default();
        let first = registry.register("AB3X9K");
        let second = registry.register("AB3X9K");
        assert!(first.is_cancelled());
        assert!(!second.is_cancelled());
        assert!(registry.is_running("AB3X9K"));
        assert!(registry.cancel("AB3X9K"));
        assert!(second.is_cancelled());
        assert!(!registry.cancel("AB3X9K"));
    }

    #[tokio::test]
    async fn driver_walks_all_questions_and_finishes() {
        // Two questions, nobody answers: the quiz still ends with a
        // zero-answer result recorded for each question.
        let (state, _sessions) = test_state(Duration::from_millis(100), Duration::from_millis(50));
        let session = QuizSession::new(
            "AB3X9K".to_string(),
            vec![question("A"), question("B")],
            1,
        );
        state.sessions.create(&session).await.unwrap();
        assert!(state.sessions.try_activate("AB3X9K").await.unwrap());

        let token = state.timers.register("AB3X9K");
        run_quiz(state.clone(), "AB3X9K".to_string(), token).await;

        let session = state.sessions.load("AB3X9K").await.unwrap();
        assert_eq!(session.status, QuizStatus::Finished);
        assert!(session.finished_at.is_some());
        assert_eq!(session.current_question_index, 1);
        assert_eq!(session.question_results.len(), 2);
        assert!(session.question_results.iter().all(|r| r.total_answers == 0));
        assert!(!state.timers.is_running("AB3X9K"));

        let projection = state.events.latest("AB3X9K").await.unwrap().unwrap();
        assert_eq!(projection.kind, EventKind::QuizEnded);
    }

    #[tokio::test]
    async fn countdown_is_monotonic_within_a_question() {
        let (state, sessions) = test_state(Duration::from_millis(50), Duration::from_millis(20));
        let session = QuizSession::new("AB3X9K".to_string(), vec![question("A")], 1);
        state.sessions.create(&session).await.unwrap();
        state.sessions.try_activate("AB3X9K").await.unwrap();

        let token = state.timers.register("AB3X9K");
        run_quiz(state.clone(), "AB3X9K".to_string(), token).await;

        let timeline = sessions.timeline();
        assert!(!timeline.is_empty());
        for window in timeline.windows(2) {
            let ((prev_index, prev_remaining), (index, remaining)) = (window[0], window[1]);
            if prev_index == index {
                assert!(remaining <= prev_remaining, "countdown went up within a question");
            }
        }
    }

    #[tokio::test]
    async fn cancellation_stops_the_driver_mid_question() {
        let (state, _sessions) = test_state(Duration::from_millis(50), Duration::from_millis(50));
        let session = QuizSession::new("AB3X9K".to_string(), vec![question("A")], 60);
        state.sessions.create(&session).await.unwrap();
        state.sessions.try_activate("AB3X9K").await.unwrap();

        let token = state.timers.register("AB3X9K");
        let handle = tokio::spawn(run_quiz(
            state.clone(),
            "AB3X9K".to_string(),
            token.clone(),
        ));
        tokio::time::sleep(Duration::from_millis(120)).await;
        token.cancel();
        handle.await.unwrap();

        // The driver stops without finishing; the explicit end-quiz command
        // owns that transition.
        let session = state.sessions.load("AB3X9K").await.unwrap();
        assert_eq!(session.status, QuizStatus::Active);
    }
}
