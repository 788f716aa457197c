use axum::Router;
use quizzes::quiz_router;

use crate::state::SharedState;

pub mod quizzes;

pub fn router(state: SharedState) -> Router {
    Router::new().merge(quiz_router(state))
}
