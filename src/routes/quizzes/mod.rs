use axum::{
    routing::{get, post},
    Router,
};

use crate::state::SharedState;

mod handlers;
mod schemas;

pub fn quiz_router(state: SharedState) -> Router {
    Router::new()
        .route("/quizzes", post(handlers::create_quiz))
        .route("/quizzes/:code/start", post(handlers::start_quiz))
        .route("/quizzes/:code/answers", post(handlers::submit_answer))
        .route("/quizzes/:code/end", post(handlers::end_quiz))
        .route("/quizzes/:code/session", get(handlers::get_session))
        .route("/quizzes/:code/session/ack", post(handlers::ack_session))
        .route("/quizzes/:code/events", get(handlers::quiz_events))
        .route("/quizzes/:code/results", get(handlers::get_results))
        .with_state(state)
}
