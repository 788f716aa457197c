use mongodb::bson::DateTime;
use serde::Serialize;
use tracing::{info, warn};

use crate::models::session::{answer_slot, AnswerRecord, QuizStatus};
use crate::state::SharedState;
use crate::timer::{now_ms, remaining_seconds};
use crate::utils::error::AppError;
use crate::utils::score::calculate_score;

#[derive(Debug, Serialize)]
pub struct AnswerOutcome {
    #[serde(rename = "isCorrect")]
    pub is_correct: bool,
    pub score: u32,
    #[serde(rename = "correctAnswer")]
    pub correct_answer: String,
    pub explanation: Option<String>,
}

/// Validates and records one answer for (player, current question). The
/// record insert is a conditional store write, so concurrent duplicates from
/// the same player collapse to exactly one accepted submission.
pub async fn submit_answer(
    state: &SharedState,
    code: &str,
    player_id: &str,
    question_index: u32,
    answer: &str,
) -> Result<AnswerOutcome, AppError> {
    if player_id.is_empty() || player_id.contains(['.', '$']) {
        return Err(AppError::BadRequest("invalid player id".to_string()));
    }
    if answer.trim().is_empty() {
        return Err(AppError::BadRequest("answer must not be empty".to_string()));
    }

    let session = state.sessions.load(code).await?;
    if session.status != QuizStatus::Active {
        return Err(AppError::QuizNotActive);
    }
    if question_index != session.current_question_index {
        return Err(AppError::QuestionMismatch {
            submitted: question_index,
            current: session.current_question_index,
        });
    }
    let question = session
        .question(question_index)
        .ok_or(AppError::QuizNotActive)?;
    let started_at = session.question_started_at.ok_or(AppError::QuizNotActive)?;

    let now = now_ms();
    let (remaining, anomaly) = remaining_seconds(session.timer_duration, started_at, now);
    if anomaly {
        warn!(
            quiz_code = %code,
            question = question_index,
            started_at,
            "question start timestamp is in the future; treating question as just opened"
        );
    }
    if remaining == 0 {
        return Err(AppError::QuizNotActive);
    }

    let is_correct = question.evaluate(answer);
    let score = if is_correct {
        calculate_score(question.points(), remaining, session.timer_duration)
    } else {
        0
    };
    let record = AnswerRecord {
        player_id: player_id.to_string(),
        selected_answer: answer.to_string(),
        is_correct,
        // Server-side elapsed time; the client clock is not trusted.
        response_time_ms: (now - started_at).max(0),
        score,
        submitted_at: DateTime::now(),
    };

    if !state
        .sessions
        .try_insert_answer(code, player_id, question_index, &record)
        .await?
    {
        // The guarded insert also fails when the question advanced or the
        // quiz finished between the validation read and the write; re-read
        // to report which rejection actually applies.
        let current = state.sessions.load(code).await?;
        let slot = answer_slot(question_index);
        if current
            .player_answers
            .get(player_id)
            .is_some_and(|per_question| per_question.contains_key(&slot))
        {
            return Err(AppError::AlreadyAnswered);
        }
        if current.status == QuizStatus::Active
            && current.current_question_index != question_index
        {
            return Err(AppError::QuestionMismatch {
                submitted: question_index,
                current: current.current_question_index,
            });
        }
        return Err(AppError::QuizNotActive);
    }

    info!(
        quiz_code = %code,
        player_id = %player_id,
        question = question_index,
        is_correct,
        score,
        "answer recorded"
    );
    Ok(AnswerOutcome {
        is_correct,
        score,
        correct_answer: question.correct_label(),
        explanation: question.explanation().map(str::to_owned),
    })
}
