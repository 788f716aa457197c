use std::collections::{BTreeMap, BTreeSet, HashMap};

use async_trait::async_trait;
use mongodb::bson::{doc, to_bson, DateTime};
use mongodb::error::{ErrorKind, WriteFailure};
use mongodb::options::IndexOptions;
use mongodb::{Collection, Database, IndexModel};
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use strum::Display;

use crate::utils::error::AppError;
use crate::utils::score::BASE_POINTS;

#[derive(Debug, Clone, Copy, Display, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum QuizStatus {
    Waiting,
    Active,
    Finished,
}

/// Delivery channel for question notifications. Each keeps its own watermark
/// so a push subscriber and a poll subscriber never interfere.
#[derive(Debug, Clone, Copy, Display, PartialEq, Eq)]
#[strum(serialize_all = "lowercase")]
pub enum Channel {
    Push,
    Poll,
}

/// Last question index already delivered per channel. -1 means nothing sent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChannelWatermarks {
    pub push: i64,
    pub poll: i64,
}

impl Default for ChannelWatermarks {
    fn default() -> Self {
        Self { push: -1, poll: -1 }
    }
}

/// Closed set of question shapes. Each variant knows how to judge a raw
/// selection string, so no call site branches on loosely-typed shape.
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QuestionSpec {
    SingleChoice {
        question: String,
        options: BTreeMap<String, String>,
        #[serde(rename = "correctAnswer")]
        correct: String,
        explanation: Option<String>,
        points: Option<u32>,
    },
    MultiSelect {
        question: String,
        options: BTreeMap<String, String>,
        #[serde(rename = "correctAnswers")]
        correct: Vec<String>,
        explanation: Option<String>,
        points: Option<u32>,
    },
    OrderedSteps {
        question: String,
        options: BTreeMap<String, String>,
        #[serde(rename = "correctOrder")]
        correct: Vec<String>,
        explanation: Option<String>,
        points: Option<u32>,
    },
}

impl QuestionSpec {
    pub fn question_text(&self) -> &str {
        match self {
            Self::SingleChoice { question, .. }
            | Self::MultiSelect { question, .. }
            | Self::OrderedSteps { question, .. } => question,
        }
    }

    pub fn options(&self) -> &BTreeMap<String, String> {
        match self {
            Self::SingleChoice { options, .. }
            | Self::MultiSelect { options, .. }
            | Self::OrderedSteps { options, .. } => options,
        }
    }

    pub fn explanation(&self) -> Option<&str> {
        match self {
            Self::SingleChoice { explanation, .. }
            | Self::MultiSelect { explanation, .. }
            | Self::OrderedSteps { explanation, .. } => explanation.as_deref(),
        }
    }

    pub fn points(&self) -> u32 {
        match self {
            Self::SingleChoice { points, .. }
            | Self::MultiSelect { points, .. }
            | Self::OrderedSteps { points, .. } => points.unwrap_or(BASE_POINTS),
        }
    }

    /// How many option labels a complete selection carries. Clients use this
    /// to render single- vs multi-pick inputs without seeing the answer key.
    pub fn select_count(&self) -> usize {
        match self {
            Self::SingleChoice { .. } => 1,
            Self::MultiSelect { correct, .. } => correct.len(),
            Self::OrderedSteps { correct, .. } => correct.len(),
        }
    }

    /// Display form of the correct designator, revealed in question results.
    pub fn correct_label(&self) -> String {
        match self {
            Self::SingleChoice { correct, .. } => correct.to_ascii_uppercase(),
            Self::MultiSelect { correct, .. } => {
                let mut labels: Vec<String> =
                    correct.iter().map(|l| l.to_ascii_uppercase()).collect();
                labels.sort();
                labels.join(",")
            }
            Self::OrderedSteps { correct, .. } => correct
                .iter()
                .map(|l| l.to_ascii_uppercase())
                .collect::<Vec<_>>()
                .join(","),
        }
    }

    /// Splits a raw selection like "B", "a,c" or "AC" into uppercase labels.
    pub fn normalize_selection(&self, selected: &str) -> Vec<String> {
        let mut labels: Vec<String> = selected
            .split(|c: char| !c.is_ascii_alphanumeric())
            .filter(|t| !t.is_empty())
            .map(|t| t.to_ascii_uppercase())
            .collect();
        // A compact multi-pick like "AC" arrives as one token; split it when
        // every character is itself an option label.
        if labels.len() == 1 && labels[0].len() > 1 {
            let chars: Vec<String> = labels[0].chars().map(|c| c.to_string()).collect();
            if chars.iter().all(|c| self.options().contains_key(c)) {
                labels = chars;
            }
        }
        labels
    }

    /// Judges a selection against the correct designator. Multi-select is
    /// order-independent set equality; ordered steps must match exactly.
    pub fn evaluate(&self, selected: &str) -> bool {
        let picked = self.normalize_selection(selected);
        match self {
            Self::SingleChoice { correct, .. } => {
                picked.len() == 1 && picked[0] == correct.to_ascii_uppercase()
            }
            Self::MultiSelect { correct, .. } => {
                let want: BTreeSet<String> =
                    correct.iter().map(|l| l.to_ascii_uppercase()).collect();
                let got: BTreeSet<String> = picked.into_iter().collect();
                !want.is_empty() && want == got
            }
            Self::OrderedSteps { correct, .. } => {
                let want: Vec<String> = correct.iter().map(|l| l.to_ascii_uppercase()).collect();
                !want.is_empty() && picked == want
            }
        }
    }
}

/// Immutable once written; duplicates are rejected by the store, not overwritten.
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnswerRecord {
    #[serde(rename = "playerId")]
    pub player_id: String,
    #[serde(rename = "answer")]
    pub selected_answer: String,
    #[serde(rename = "isCorrect")]
    pub is_correct: bool,
    #[serde(rename = "responseTimeMs")]
    pub response_time_ms: i64,
    pub score: u32,
    #[serde(rename = "submittedAt")]
    pub submitted_at: DateTime,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuestionResult {
    #[serde(rename = "questionIndex")]
    pub question_index: u32,
    #[serde(rename = "correctAnswer")]
    pub correct_answer: String,
    pub explanation: Option<String>,
    #[serde(rename = "answerBreakdown")]
    pub answer_breakdown: BTreeMap<String, u32>,
    #[serde(rename = "totalAnswers")]
    pub total_answers: u32,
    #[serde(rename = "correctCount")]
    pub correct_count: u32,
}

/// One document per quiz code; the single source of truth for a session.
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuizSession {
    #[serde(rename = "quizCode")]
    pub quiz_code: String,
    pub status: QuizStatus,
    pub questions: Vec<QuestionSpec>,
    #[serde(rename = "currentQuestionIndex")]
    pub current_question_index: u32,
    #[serde(rename = "questionStartedAt")]
    pub question_started_at: Option<i64>,
    #[serde(rename = "timerDuration")]
    pub timer_duration: u32,
    #[serde(rename = "timeRemaining")]
    pub time_remaining: u32,
    /// player id -> "q<index>" -> record. At most one record per slot.
    #[serde(rename = "playerAnswers", default)]
    pub player_answers: HashMap<String, HashMap<String, AnswerRecord>>,
    #[serde(rename = "questionResults", default)]
    pub question_results: Vec<QuestionResult>,
    #[serde(rename = "lastNotified", default)]
    pub last_notified: ChannelWatermarks,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime,
    #[serde(rename = "finishedAt")]
    pub finished_at: Option<DateTime>,
}

pub fn answer_slot(index: u32) -> String {
    format!("q{index}")
}

impl QuizSession {
    pub fn new(quiz_code: String, questions: Vec<QuestionSpec>, timer_duration: u32) -> Self {
        let time_remaining = timer_duration;
        Self {
            quiz_code,
            status: QuizStatus::Waiting,
            questions,
            current_question_index: 0,
            question_started_at: None,
            timer_duration,
            time_remaining,
            player_answers: HashMap::new(),
            question_results: Vec::new(),
            last_notified: ChannelWatermarks::default(),
            created_at: DateTime::now(),
            finished_at: None,
        }
    }

    pub fn total_questions(&self) -> u32 {
        self.questions.len() as u32
    }

    pub fn question(&self, index: u32) -> Option<&QuestionSpec> {
        self.questions.get(index as usize)
    }

    pub fn answers_for_question(&self, index: u32) -> Vec<&AnswerRecord> {
        let slot = answer_slot(index);
        self.player_answers
            .values()
            .filter_map(|per_question| per_question.get(&slot))
            .collect()
    }

    /// Per-question result tally: answer counts by option label plus how many
    /// players got it right. Computed once when a countdown elapses.
    pub fn tally(&self, index: u32) -> Option<QuestionResult> {
        let question = self.question(index)?;
        let mut breakdown: BTreeMap<String, u32> = question
            .options()
            .keys()
            .map(|label| (label.clone(), 0))
            .collect();
        let answers = self.answers_for_question(index);
        for record in &answers {
            for label in question.normalize_selection(&record.selected_answer) {
                if let Some(count) = breakdown.get_mut(&label) {
                    *count += 1;
                }
            }
        }
        Some(QuestionResult {
            question_index: index,
            correct_answer: question.correct_label(),
            explanation: question.explanation().map(str::to_owned),
            answer_breakdown: breakdown,
            total_answers: answers.len() as u32,
            correct_count: answers.iter().filter(|r| r.is_correct).count() as u32,
        })
    }

    /// Session-local leaderboard: total score and correct count per player,
    /// highest score first.
    pub fn leaderboard(&self) -> Vec<LeaderboardEntry> {
        let mut entries: Vec<LeaderboardEntry> = self
            .player_answers
            .iter()
            .map(|(player_id, per_question)| LeaderboardEntry {
                player_id: player_id.clone(),
                score: per_question.values().map(|r| r.score).sum(),
                correct_answers: per_question.values().filter(|r| r.is_correct).count() as u32,
            })
            .collect();
        entries.sort_by(|a, b| b.score.cmp(&a.score).then(a.player_id.cmp(&b.player_id)));
        entries
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LeaderboardEntry {
    #[serde(rename = "playerId")]
    pub player_id: String,
    pub score: u32,
    #[serde(rename = "correctAnswers")]
    pub correct_answers: u32,
}

/// Narrow, field-scoped conditional operations over the session document.
/// Every mutation is a guarded update so a stale in-memory copy can never
/// clobber a concurrent writer's field.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn create(&self, session: &QuizSession) -> Result<(), AppError>;

    async fn load(&self, code: &str) -> Result<QuizSession, AppError>;

    /// CAS waiting -> active. Returns whether this call made the transition.
    async fn try_activate(&self, code: &str) -> Result<bool, AppError>;

    /// Resets countdown fields, guarded on the session still sitting at
    /// `index` while active.
    async fn try_start_question(
        &self,
        code: &str,
        index: u32,
        started_at_ms: i64,
        duration_secs: u32,
    ) -> Result<bool, AppError>;

    /// Guarded on the current index so a stale tick never touches a later
    /// question. A non-matching guard is a silent no-op.
    async fn set_time_remaining(&self, code: &str, index: u32, secs: u32)
        -> Result<(), AppError>;

    /// Atomic conditional insert of one answer, guarded on the session still
    /// being active at `index`. Returns false when the (player, question)
    /// slot already holds a record or the session has moved on, so a stale
    /// submission can never land on an already-ended question.
    async fn try_insert_answer(
        &self,
        code: &str,
        player_id: &str,
        index: u32,
        record: &AnswerRecord,
    ) -> Result<bool, AppError>;

    async fn push_question_result(
        &self,
        code: &str,
        result: &QuestionResult,
    ) -> Result<(), AppError>;

    /// CAS `currentQuestionIndex: from -> from + 1`. Returns false when
    /// another writer advanced (or finished) first.
    async fn try_advance_question(&self, code: &str, from_index: u32) -> Result<bool, AppError>;

    /// CAS into the terminal state. Returns false when already finished.
    async fn try_finish(&self, code: &str) -> Result<bool, AppError>;

    /// CAS the channel watermark forward to `index`, never backward and never
    /// past `currentQuestionIndex`. Returns whether this call won delivery.
    async fn try_advance_watermark(
        &self,
        code: &str,
        channel: Channel,
        index: u32,
    ) -> Result<bool, AppError>;
}

pub struct MongoSessionStore {
    collection: Collection<QuizSession>,
}

impl MongoSessionStore {
    pub fn new(db: &Database) -> Self {
        Self {
            collection: db.collection::<QuizSession>("quizSessions"),
        }
    }

    /// The unique index backs duplicate-code rejection at insert time.
    pub async fn ensure_indexes(&self) -> Result<(), AppError> {
        let index = IndexModel::builder()
            .keys(doc! { "quizCode": 1 })
            .options(IndexOptions::builder().unique(true).build())
            .build();
        self.collection.create_index(index).await?;
        Ok(())
    }
}

fn is_duplicate_key(err: &mongodb::error::Error) -> bool {
    matches!(
        *err.kind,
        ErrorKind::Write(WriteFailure::WriteError(ref we)) if we.code == 11000
    )
}

#[async_trait]
impl SessionStore for MongoSessionStore {
    async fn create(&self, session: &QuizSession) -> Result<(), AppError> {
        match self.collection.insert_one(session).await {
            Ok(_) => Ok(()),
            Err(e) if is_duplicate_key(&e) => Err(AppError::StateConflict(
                "quiz code already in use".to_string(),
            )),
            Err(e) => Err(e.into()),
        }
    }

    async fn load(&self, code: &str) -> Result<QuizSession, AppError> {
        self.collection
            .find_one(doc! { "quizCode": code })
            .await?
            .ok_or(AppError::NotFound)
    }

    async fn try_activate(&self, code: &str) -> Result<bool, AppError> {
        let result = self
            .collection
            .update_one(
                doc! { "quizCode": code, "status": QuizStatus::Waiting.to_string() },
                doc! { "$set": { "status": QuizStatus::Active.to_string() } },
            )
            .await?;
        Ok(result.modified_count == 1)
    }

    async fn try_start_question(
        &self,
        code: &str,
        index: u32,
        started_at_ms: i64,
        duration_secs: u32,
    ) -> Result<bool, AppError> {
        let result = self
            .collection
            .update_one(
                doc! {
                    "quizCode": code,
                    "status": QuizStatus::Active.to_string(),
                    "currentQuestionIndex": index,
                },
                doc! { "$set": {
                    "questionStartedAt": started_at_ms,
                    "timeRemaining": duration_secs,
                } },
            )
            .await?;
        Ok(result.modified_count == 1)
    }

    async fn set_time_remaining(
        &self,
        code: &str,
        index: u32,
        secs: u32,
    ) -> Result<(), AppError> {
        self.collection
            .update_one(
                doc! {
                    "quizCode": code,
                    "status": QuizStatus::Active.to_string(),
                    "currentQuestionIndex": index,
                },
                doc! { "$set": { "timeRemaining": secs } },
            )
            .await?;
        Ok(())
    }

    async fn try_insert_answer(
        &self,
        code: &str,
        player_id: &str,
        index: u32,
        record: &AnswerRecord,
    ) -> Result<bool, AppError> {
        let slot = format!("playerAnswers.{}.{}", player_id, answer_slot(index));
        let record =
            to_bson(record).map_err(|e| AppError::StoreUnavailable(e.to_string()))?;
        let result = self
            .collection
            .update_one(
                doc! {
                    "quizCode": code,
                    "status": QuizStatus::Active.to_string(),
                    "currentQuestionIndex": index,
                    &slot: { "$exists": false },
                },
                doc! { "$set": { &slot: record } },
            )
            .await?;
        Ok(result.modified_count == 1)
    }

    async fn push_question_result(
        &self,
        code: &str,
        result: &QuestionResult,
    ) -> Result<(), AppError> {
        let result =
            to_bson(result).map_err(|e| AppError::StoreUnavailable(e.to_string()))?;
        self.collection
            .update_one(
                doc! { "quizCode": code },
                doc! {
                    "$push": { "questionResults": result },
                    "$set": { "timeRemaining": 0 },
                },
            )
            .await?;
        Ok(())
    }

    async fn try_advance_question(&self, code: &str, from_index: u32) -> Result<bool, AppError> {
        let result = self
            .collection
            .update_one(
                doc! {
                    "quizCode": code,
                    "status": QuizStatus::Active.to_string(),
                    "currentQuestionIndex": from_index,
                },
                doc! { "$inc": { "currentQuestionIndex": 1 } },
            )
            .await?;
        Ok(result.modified_count == 1)
    }

    async fn try_finish(&self, code: &str) -> Result<bool, AppError> {
        let result = self
            .collection
            .update_one(
                doc! {
                    "quizCode": code,
                    "status": { "$ne": QuizStatus::Finished.to_string() },
                },
                doc! { "$set": {
                    "status": QuizStatus::Finished.to_string(),
                    "finishedAt": DateTime::now(),
                } },
            )
            .await?;
        Ok(result.modified_count == 1)
    }

    async fn try_advance_watermark(
        &self,
        code: &str,
        channel: Channel,
        index: u32,
    ) -> Result<bool, AppError> {
        let field = format!("lastNotified.{channel}");
        let result = self
            .collection
            .update_one(
                doc! {
                    "quizCode": code,
                    &field: { "$lt": index as i64 },
                    "currentQuestionIndex": { "$gte": index as i64 },
                },
                doc! { "$set": { &field: index as i64 } },
            )
            .await?;
        Ok(result.modified_count == 1)
    }
}
