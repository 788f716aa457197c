use std::convert::Infallible;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::Json;
use futures::stream::{self, Stream, StreamExt};
use serde_json::json;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tracing::warn;

use super::schemas::{AckBody, CreateQuizBody, SessionSnapshot, SubmitAnswerBody};
use crate::dispatch::WireEvent;
use crate::models::session::{Channel, QuizStatus};
use crate::services::answers;
use crate::services::lifecycle::{self, EndOutcome, StartOutcome};
use crate::state::SharedState;
use crate::timer::quiz_ended_payload;
use crate::utils::code::normalize_quiz_code;
use crate::utils::error::AppError;

pub async fn create_quiz(
    State(state): State<SharedState>,
    Json(body): Json<CreateQuizBody>,
) -> Result<impl IntoResponse, AppError> {
    let session = lifecycle::create_session(
        &state,
        body.quiz_code,
        body.questions,
        body.timer_duration,
    )
    .await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({
            "quizCode": session.quiz_code,
            "status": session.status.to_string(),
            "questionCount": session.total_questions(),
            "timerDuration": session.timer_duration,
        })),
    ))
}

pub async fn start_quiz(
    Path(code): Path<String>,
    State(state): State<SharedState>,
) -> Result<impl IntoResponse, AppError> {
    let code = normalize_quiz_code(&code);
    let outcome = lifecycle::start_quiz(&state, &code).await?;
    Ok(Json(json!({
        "success": true,
        "started": outcome == StartOutcome::Started,
    })))
}

pub async fn submit_answer(
    Path(code): Path<String>,
    State(state): State<SharedState>,
    Json(body): Json<SubmitAnswerBody>,
) -> Result<impl IntoResponse, AppError> {
    let code = normalize_quiz_code(&code);
    let outcome = answers::submit_answer(
        &state,
        &code,
        &body.player_id,
        body.question_index,
        &body.answer,
    )
    .await?;
    Ok(Json(json!({
        "success": true,
        "isCorrect": outcome.is_correct,
        "score": outcome.score,
        "correctAnswer": outcome.correct_answer,
        "explanation": outcome.explanation,
    })))
}

pub async fn end_quiz(
    Path(code): Path<String>,
    State(state): State<SharedState>,
) -> Result<impl IntoResponse, AppError> {
    let code = normalize_quiz_code(&code);
    let outcome = lifecycle::end_quiz(&state, &code).await?;
    Ok(Json(json!({
        "success": true,
        "alreadyFinished": outcome == EndOutcome::AlreadyFinished,
    })))
}

/// Poll-channel snapshot; one read per client interval.
pub async fn get_session(
    Path(code): Path<String>,
    State(state): State<SharedState>,
) -> Result<impl IntoResponse, AppError> {
    let code = normalize_quiz_code(&code);
    let session = state.sessions.load(&code).await?;
    Ok(Json(SessionSnapshot::from_session(&session)))
}

/// Poll-channel delivery acknowledgment: advances the poll watermark via the
/// same CAS the push dispatcher uses, so each question is confirmed at most
/// once per channel.
pub async fn ack_session(
    Path(code): Path<String>,
    State(state): State<SharedState>,
    Json(body): Json<AckBody>,
) -> Result<impl IntoResponse, AppError> {
    let code = normalize_quiz_code(&code);
    // Surfaces NotFound before the watermark write can silently no-op.
    state.sessions.load(&code).await?;
    let delivered = state
        .sessions
        .try_advance_watermark(&code, Channel::Poll, body.question_index)
        .await?;
    Ok(Json(json!({
        "delivered": delivered,
        "questionIndex": body.question_index,
    })))
}

/// Push channel: replays the latest projection snapshot on connect, then
/// streams every subsequent state change for this quiz code.
pub async fn quiz_events(
    Path(code): Path<String>,
    State(state): State<SharedState>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, AppError> {
    let code = normalize_quiz_code(&code);
    state.sessions.load(&code).await?;
    // Subscribe before reading the snapshot so no update can fall between.
    let rx = state.hub.subscribe(&code);
    let snapshot = state
        .events
        .latest(&code)
        .await?
        .map(|projection| WireEvent::from_projection(&projection));

    let initial = stream::iter(snapshot.into_iter().map(|event| Ok(sse_event(&event))));
    let updates = BroadcastStream::new(rx).filter_map(|item| async move {
        match item {
            Ok(event) => Some(Ok(sse_event(&event))),
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                warn!(skipped, "push subscriber lagged; events dropped");
                None
            }
        }
    });
    Ok(Sse::new(initial.chain(updates)).keep_alive(KeepAlive::default()))
}

fn sse_event(event: &WireEvent) -> Event {
    match Event::default().json_data(event) {
        Ok(e) => e,
        Err(_) => Event::default().data("{}"),
    }
}

/// Read-only afterlife of a finished session.
pub async fn get_results(
    Path(code): Path<String>,
    State(state): State<SharedState>,
) -> Result<impl IntoResponse, AppError> {
    let code = normalize_quiz_code(&code);
    let session = state.sessions.load(&code).await?;
    if session.status != QuizStatus::Finished {
        return Err(AppError::StateConflict("quiz is still running".to_string()));
    }
    let mut results = quiz_ended_payload(&session);
    results["quizCode"] = json!(session.quiz_code);
    results["finishedAt"] = json!(session.finished_at.map(|t| t.timestamp_millis()));
    Ok(Json(results))
}
