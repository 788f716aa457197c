use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;

use crate::models::session::{QuestionSpec, QuizSession};

#[derive(Deserialize)]
pub struct CreateQuizBody {
    /// Optional host-chosen code; generated when absent.
    #[serde(rename = "quizCode")]
    pub quiz_code: Option<String>,
    pub questions: Vec<QuestionSpec>,
    #[serde(rename = "timerDuration")]
    pub timer_duration: u32,
}

/// A `clientTimestamp` field is accepted but ignored: scoring trusts the
/// server clock only.
#[derive(Deserialize)]
pub struct SubmitAnswerBody {
    #[serde(rename = "playerId")]
    pub player_id: String,
    #[serde(rename = "questionIndex")]
    pub question_index: u32,
    pub answer: String,
}

#[derive(Deserialize)]
pub struct AckBody {
    #[serde(rename = "questionIndex")]
    pub question_index: u32,
}

/// The question as players may see it: no correct-answer designator.
#[skip_serializing_none]
#[derive(Serialize)]
pub struct CurrentQuestion {
    #[serde(rename = "questionIndex")]
    pub question_index: u32,
    pub question: String,
    pub options: BTreeMap<String, String>,
    #[serde(rename = "selectCount")]
    pub select_count: usize,
}

/// Poll-channel snapshot; the client compares indices to detect novelty.
#[skip_serializing_none]
#[derive(Serialize)]
pub struct SessionSnapshot {
    pub status: String,
    #[serde(rename = "currentQuestionIndex")]
    pub current_question_index: u32,
    #[serde(rename = "lastNotifiedQuestionIndex")]
    pub last_notified_question_index: i64,
    #[serde(rename = "timeRemaining")]
    pub time_remaining: u32,
    #[serde(rename = "timerDuration")]
    pub timer_duration: u32,
    #[serde(rename = "totalQuestions")]
    pub total_questions: u32,
    pub question: Option<CurrentQuestion>,
}

impl SessionSnapshot {
    pub fn from_session(session: &QuizSession) -> Self {
        let index = session.current_question_index;
        let question = session.question(index).map(|q| CurrentQuestion {
            question_index: index,
            question: q.question_text().to_string(),
            options: q.options().clone(),
            select_count: q.select_count(),
        });
        Self {
            status: session.status.to_string(),
            current_question_index: index,
            last_notified_question_index: session.last_notified.poll,
            time_remaining: session.time_remaining,
            timer_duration: session.timer_duration,
            total_questions: session.total_questions(),
            question,
        }
    }
}
