use serde_json::json;
use tracing::info;

use crate::models::event::EventKind;
use crate::models::session::{QuestionSpec, QuizSession, QuizStatus};
use crate::state::SharedState;
use crate::timer::{finish_quiz, run_quiz};
use crate::utils::code::{generate_quiz_code, normalize_quiz_code};
use crate::utils::error::AppError;

const MIN_TIMER_SECS: u32 = 5;
const MAX_TIMER_SECS: u32 = 600;

#[derive(Debug, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    /// A retry of an already-running quiz: success, but nothing to do.
    AlreadyRunning,
}

#[derive(Debug, PartialEq, Eq)]
pub enum EndOutcome {
    Ended,
    AlreadyFinished,
}

/// Creates a waiting session from a finalized question list. The question
/// content is taken as-is and never re-read or mutated afterwards.
pub async fn create_session(
    state: &SharedState,
    requested_code: Option<String>,
    questions: Vec<QuestionSpec>,
    timer_duration: u32,
) -> Result<QuizSession, AppError> {
    if questions.is_empty() {
        return Err(AppError::BadRequest(
            "a quiz needs at least one question".to_string(),
        ));
    }
    if !(MIN_TIMER_SECS..=MAX_TIMER_SECS).contains(&timer_duration) {
        return Err(AppError::BadRequest(format!(
            "timer duration must be between {MIN_TIMER_SECS} and {MAX_TIMER_SECS} seconds"
        )));
    }
    let code = match requested_code {
        Some(raw) => {
            let code = normalize_quiz_code(&raw);
            if code.is_empty() || !code.chars().all(|c| c.is_ascii_alphanumeric()) {
                return Err(AppError::BadRequest("invalid quiz code".to_string()));
            }
            code
        }
        None => generate_quiz_code(),
    };

    let session = QuizSession::new(code, questions, timer_duration);
    state.sessions.create(&session).await?;
    info!(
        quiz_code = %session.quiz_code,
        questions = session.total_questions(),
        timer_duration,
        "session created"
    );
    Ok(session)
}

/// Idempotent start: exactly one caller wins the waiting -> active CAS and
/// spawns the timer driver; concurrent retries see a no-op success. Starting
/// a finished quiz is a conflict, never a silent restart.
pub async fn start_quiz(state: &SharedState, code: &str) -> Result<StartOutcome, AppError> {
    let session = state.sessions.load(code).await?;
    match session.status {
        QuizStatus::Finished => Err(AppError::StateConflict("quiz already ended".to_string())),
        QuizStatus::Active => Ok(StartOutcome::AlreadyRunning),
        QuizStatus::Waiting => {
            if state.sessions.try_activate(code).await? {
                state
                    .events
                    .publish(
                        code,
                        EventKind::QuizStarted,
                        json!({
                            "totalQuestions": session.total_questions(),
                            "timerDuration": session.timer_duration,
                        }),
                    )
                    .await?;
                let token = state.timers.register(code);
                tokio::spawn(run_quiz(state.clone(), code.to_string(), token));
                info!(quiz_code = %code, "quiz started");
                Ok(StartOutcome::Started)
            } else {
                // Lost the start race; report what actually happened.
                let current = state.sessions.load(code).await?;
                match current.status {
                    QuizStatus::Active => Ok(StartOutcome::AlreadyRunning),
                    QuizStatus::Finished => {
                        Err(AppError::StateConflict("quiz already ended".to_string()))
                    }
                    QuizStatus::Waiting => Err(AppError::StoreUnavailable(
                        "activation write did not apply".to_string(),
                    )),
                }
            }
        }
    }
}

/// Explicit termination: stops the timer loop for this quiz code and moves to
/// finished immediately, regardless of remaining countdown. Retrying against
/// an already-finished quiz is a success no-op.
pub async fn end_quiz(state: &SharedState, code: &str) -> Result<EndOutcome, AppError> {
    let session = state.sessions.load(code).await?;
    if session.status == QuizStatus::Finished {
        return Ok(EndOutcome::AlreadyFinished);
    }
    state.timers.cancel(code);
    finish_quiz(state, code).await?;
    info!(quiz_code = %code, "quiz ended by request");
    Ok(EndOutcome::Ended)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::session::SessionStore;
    use crate::testutil::test_state;
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn questions(n: usize) -> Vec<QuestionSpec> {
        (0..n)
            .map(|i| QuestionSpec::SingleChoice {
                question: format!("q{i}"),
                options: BTreeMap::from([
                    ("A".to_string(), "a".to_string()),
                    ("B".to_string(), "b".to_string()),
                ]),
                correct: "A".to_string(),
                explanation: None,
                points: None,
            })
            .collect()
    }

    #[tokio::test]
    async fn create_generates_a_normalized_code() {
        let (state, _) = test_state(Duration::from_secs(1), Duration::from_secs(1));
        let session = create_session(&state, None, questions(2), 30).await.unwrap();
        assert_eq!(session.quiz_code, normalize_quiz_code(&session.quiz_code));
        assert_eq!(session.status, QuizStatus::Waiting);
    }

    #[tokio::test]
    async fn create_rejects_empty_question_lists_and_bad_timers() {
        let (state, _) = test_state(Duration::from_secs(1), Duration::from_secs(1));
        assert!(matches!(
            create_session(&state, None, Vec::new(), 30).await.unwrap_err(),
            AppError::BadRequest(_)
        ));
        assert!(matches!(
            create_session(&state, None, questions(1), 0).await.unwrap_err(),
            AppError::BadRequest(_)
        ));
    }

    #[tokio::test]
    async fn create_rejects_duplicate_codes() {
        let (state, _) = test_state(Duration::from_secs(1), Duration::from_secs(1));
        create_session(&state, Some("AB3X9K".to_string()), questions(1), 30)
            .await
            .unwrap();
        let err = create_session(&state, Some("ab3x9k".to_string()), questions(1), 30)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::StateConflict(_)));
    }

    #[tokio::test]
    async fn start_is_idempotent_while_running() {
        let (state, _) = test_state(Duration::from_millis(100), Duration::from_millis(50));
        create_session(&state, Some("AB3X9K".to_string()), questions(1), 60)
            .await
            .unwrap();
        assert_eq!(
            start_quiz(&state, "AB3X9K").await.unwrap(),
            StartOutcome::Started
        );
        assert_eq!(
            start_quiz(&state, "AB3X9K").await.unwrap(),
            StartOutcome::AlreadyRunning
        );
        // Tidy up the spawned driver.
        state.timers.cancel("AB3X9K");
    }

    #[tokio::test]
    async fn start_after_finish_is_a_conflict() {
        let (state, _) = test_state(Duration::from_secs(1), Duration::from_secs(1));
        create_session(&state, Some("AB3X9K".to_string()), questions(1), 60)
            .await
            .unwrap();
        state.sessions.try_activate("AB3X9K").await.unwrap();
        state.sessions.try_finish("AB3X9K").await.unwrap();

        let err = start_quiz(&state, "AB3X9K").await.unwrap_err();
        assert!(matches!(err, AppError::StateConflict(_)));
    }

    #[tokio::test]
    async fn end_is_immediate_and_retry_safe() {
        let (state, _) = test_state(Duration::from_millis(100), Duration::from_millis(50));
        create_session(&state, Some("AB3X9K".to_string()), questions(3), 60)
            .await
            .unwrap();
        start_quiz(&state, "AB3X9K").await.unwrap();

        assert_eq!(end_quiz(&state, "AB3X9K").await.unwrap(), EndOutcome::Ended);
        let session = state.sessions.load("AB3X9K").await.unwrap();
        assert_eq!(session.status, QuizStatus::Finished);
        assert!(!state.timers.is_running("AB3X9K"));

        assert_eq!(
            end_quiz(&state, "AB3X9K").await.unwrap(),
            EndOutcome::AlreadyFinished
        );
    }

    #[tokio::test]
    async fn end_of_unknown_quiz_is_not_found() {
        let (state, _) = test_state(Duration::from_secs(1), Duration::from_secs(1));
        assert!(matches!(
            end_quiz(&state, "NOPE42").await.unwrap_err(),
            AppError::NotFound
        ));
    }
}
