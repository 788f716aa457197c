use axum::{http::StatusCode, response::IntoResponse, Json};
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("quiz not found")]
    NotFound,
    #[error("{0}")]
    StateConflict(String),
    #[error("quiz is not accepting answers for this question")]
    QuizNotActive,
    #[error("answer targets question {submitted}, current question is {current}")]
    QuestionMismatch { submitted: u32, current: u32 },
    #[error("answer already recorded for this question")]
    AlreadyAnswered,
    #[error("storage unavailable: {0}")]
    StoreUnavailable(String),
    #[error("{0}")]
    BadRequest(String),
}

impl AppError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::StateConflict(_) => "state_conflict",
            Self::QuizNotActive => "quiz_not_active",
            Self::QuestionMismatch { .. } => "question_mismatch",
            Self::AlreadyAnswered => "already_answered",
            Self::StoreUnavailable(_) => "store_unavailable",
            Self::BadRequest(_) => "bad_request",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::StateConflict(_)
            | Self::QuizNotActive
            | Self::QuestionMismatch { .. }
            | Self::AlreadyAnswered => StatusCode::CONFLICT,
            Self::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
        }
    }
}

impl From<mongodb::error::Error> for AppError {
    fn from(err: mongodb::error::Error) -> Self {
        Self::StoreUnavailable(err.to_string())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status();
        let body = json!({
            "status": status.as_u16(),
            "error": self.to_string(),
            "code": self.kind(),
        });
        (status, Json(body)).into_response()
    }
}
