//! Boundary to the remote attempt backend.

mod http;
mod memory;

pub use http::HttpAttemptApi;
pub use memory::InMemoryAttemptApi;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use exam_core::model::{
    AnswerValue, AttemptParts, AttemptId, AttemptStatus, QuestionId, TestAttemptSession, TestId,
    UserId,
};

use crate::error::ApiError;

//
// ─── WIRE TYPES ────────────────────────────────────────────────────────────────
//

/// Attempt document as exchanged with the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub id: AttemptId,
    pub test_id: TestId,
    pub user_id: UserId,
    pub status: AttemptStatus,
    pub current_question_index: usize,
    pub question_ids: Vec<QuestionId>,
    #[serde(default)]
    pub answers: BTreeMap<QuestionId, AnswerValue>,
    #[serde(default)]
    pub flagged_questions: Vec<QuestionId>,
    pub time_remaining: u32,
    pub started_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

impl SessionRecord {
    #[must_use]
    pub fn from_session(session: &TestAttemptSession) -> Self {
        Self {
            id: session.id(),
            test_id: session.test_id(),
            user_id: session.user_id(),
            status: session.status(),
            current_question_index: session.current_question_index(),
            question_ids: session.question_ids().to_vec(),
            answers: session.answers().clone(),
            flagged_questions: session.flagged_questions().iter().copied().collect(),
            time_remaining: session.time_remaining(),
            started_at: session.started_at(),
            last_activity: session.last_activity(),
        }
    }

    /// # Errors
    ///
    /// Returns `ApiError::Decode` when the document violates attempt invariants.
    pub fn into_session(self) -> Result<TestAttemptSession, ApiError> {
        let session = TestAttemptSession::from_persisted(AttemptParts {
            id: self.id,
            test_id: self.test_id,
            user_id: self.user_id,
            status: self.status,
            current_question_index: self.current_question_index,
            question_ids: self.question_ids,
            answers: self.answers,
            flagged_questions: self.flagged_questions.into_iter().collect(),
            time_remaining: self.time_remaining,
            started_at: self.started_at,
            last_activity: self.last_activity,
        })?;
        Ok(session)
    }
}

/// Body of `PUT /attempts/{id}/state`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistRequest {
    pub attempt_id: AttemptId,
    pub answers: BTreeMap<QuestionId, AnswerValue>,
    pub flagged_questions: Vec<QuestionId>,
    pub current_question_index: usize,
    pub time_remaining: u32,
}

impl PersistRequest {
    #[must_use]
    pub fn from_session(session: &TestAttemptSession) -> Self {
        Self {
            attempt_id: session.id(),
            answers: session.answers().clone(),
            flagged_questions: session.flagged_questions().iter().copied().collect(),
            current_question_index: session.current_question_index(),
            time_remaining: session.time_remaining(),
        }
    }
}

/// Scored outcome of a submitted attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitResult {
    pub score: f64,
    pub max_score: f64,
    pub percentage: f64,
    pub correct: u32,
    pub incorrect: u32,
    pub unanswered: u32,
}

//
// ─── CONTRACT ──────────────────────────────────────────────────────────────────
//

/// Remote attempt persistence. The backend is authoritative for attempt
/// status; the client only proposes transitions.
#[async_trait]
pub trait AttemptApi: Send + Sync {
    /// # Errors
    ///
    /// Returns `ApiError` on transport or decoding failures.
    async fn list_sessions(
        &self,
        user_id: UserId,
        include_expired: bool,
    ) -> Result<Vec<SessionRecord>, ApiError>;

    /// # Errors
    ///
    /// Returns `ApiError::NotFound` for unknown attempts.
    async fn fetch_session(&self, attempt_id: AttemptId) -> Result<SessionRecord, ApiError>;

    /// Overwrite the attempt's mutable state. Last write wins.
    ///
    /// # Errors
    ///
    /// Returns `ApiError` when the state could not be stored.
    async fn persist(&self, request: &PersistRequest) -> Result<(), ApiError>;

    /// # Errors
    ///
    /// Returns `ApiError::Conflict` when the backend refuses the transition.
    async fn resume(&self, attempt_id: AttemptId) -> Result<AttemptStatus, ApiError>;

    /// # Errors
    ///
    /// Returns `ApiError::Conflict` when the backend refuses the transition.
    async fn pause(&self, attempt_id: AttemptId) -> Result<AttemptStatus, ApiError>;

    /// # Errors
    ///
    /// Returns `ApiError` when the attempt could not be discarded.
    async fn abandon(&self, attempt_id: AttemptId) -> Result<(), ApiError>;

    /// # Errors
    ///
    /// Returns `ApiError` when the submission was not accepted.
    async fn submit(
        &self,
        attempt_id: AttemptId,
        answers: &BTreeMap<QuestionId, AnswerValue>,
    ) -> Result<SubmitResult, ApiError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use exam_core::time::fixed_now;

    #[test]
    fn session_record_uses_camel_case_and_round_trips() {
        let now = fixed_now();
        let mut session = TestAttemptSession::start(
            AttemptId::random(),
            TestId::new(4),
            UserId::new(9),
            vec![QuestionId::new(10), QuestionId::new(11)],
            300,
            now,
        )
        .unwrap();
        session
            .set_answer(QuestionId::new(11), AnswerValue::text("42"), now)
            .unwrap();

        let record = SessionRecord::from_session(&session);
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["status"], "in_progress");
        assert_eq!(value["timeRemaining"], 300);
        assert_eq!(value["answers"]["11"], "42");

        let back: SessionRecord = serde_json::from_value(value).unwrap();
        assert_eq!(back.into_session().unwrap(), session);
    }

    #[test]
    fn invalid_record_is_a_decode_error() {
        let now = fixed_now();
        let record = SessionRecord {
            id: AttemptId::random(),
            test_id: TestId::new(1),
            user_id: UserId::new(1),
            status: AttemptStatus::InProgress,
            current_question_index: 5,
            question_ids: vec![QuestionId::new(1)],
            answers: BTreeMap::new(),
            flagged_questions: Vec::new(),
            time_remaining: 60,
            started_at: now,
            last_activity: now,
        };
        assert!(matches!(record.into_session(), Err(ApiError::Decode(_))));
    }
}
