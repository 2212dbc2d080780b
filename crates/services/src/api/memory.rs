use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use exam_core::Clock;
use exam_core::model::{AnswerValue, AttemptId, AttemptStatus, QuestionId, TestAttemptSession, UserId};

use super::{AttemptApi, PersistRequest, SessionRecord, SubmitResult};
use crate::error::ApiError;

#[derive(Default)]
struct Backend {
    records: HashMap<AttemptId, SessionRecord>,
    abandoned: HashSet<AttemptId>,
    answer_key: BTreeMap<QuestionId, AnswerValue>,
    persisted: Vec<PersistRequest>,
    submissions: u32,
    failing: bool,
}

/// In-process attempt backend for tests and offline demos.
///
/// `set_failing(true)` makes every call fail with `ApiError::Unavailable`,
/// which is how tests simulate losing the network.
#[derive(Clone)]
pub struct InMemoryAttemptApi {
    clock: Clock,
    backend: Arc<Mutex<Backend>>,
}

impl Default for InMemoryAttemptApi {
    fn default() -> Self {
        Self::new(Clock::default())
    }
}

impl InMemoryAttemptApi {
    #[must_use]
    pub fn new(clock: Clock) -> Self {
        Self {
            clock,
            backend: Arc::new(Mutex::new(Backend::default())),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Backend>, ApiError> {
        let guard = self
            .backend
            .lock()
            .map_err(|e| ApiError::Decode(e.to_string()))?;
        if guard.failing {
            return Err(ApiError::Unavailable);
        }
        Ok(guard)
    }

    fn lock_unchecked(&self) -> MutexGuard<'_, Backend> {
        self.backend
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Seed or replace an attempt.
    pub fn insert(&self, session: &TestAttemptSession) {
        let mut backend = self.lock_unchecked();
        backend.abandoned.remove(&session.id());
        backend
            .records
            .insert(session.id(), SessionRecord::from_session(session));
    }

    /// Answers counted as correct when scoring submissions.
    pub fn set_answer_key(&self, key: BTreeMap<QuestionId, AnswerValue>) {
        self.lock_unchecked().answer_key = key;
    }

    pub fn set_failing(&self, failing: bool) {
        self.lock_unchecked().failing = failing;
    }

    #[must_use]
    pub fn record(&self, attempt_id: AttemptId) -> Option<SessionRecord> {
        self.lock_unchecked().records.get(&attempt_id).cloned()
    }

    /// Every accepted persist call, oldest first.
    #[must_use]
    pub fn persisted(&self) -> Vec<PersistRequest> {
        self.lock_unchecked().persisted.clone()
    }

    #[must_use]
    pub fn submissions(&self) -> u32 {
        self.lock_unchecked().submissions
    }

    #[must_use]
    pub fn is_abandoned(&self, attempt_id: AttemptId) -> bool {
        self.lock_unchecked().abandoned.contains(&attempt_id)
    }

    fn transition(
        &self,
        attempt_id: AttemptId,
        from: AttemptStatus,
        to: AttemptStatus,
    ) -> Result<AttemptStatus, ApiError> {
        let now = self.clock.now();
        let mut backend = self.lock()?;
        let record = backend
            .records
            .get_mut(&attempt_id)
            .ok_or(ApiError::NotFound(attempt_id))?;
        if record.status == to {
            return Ok(to);
        }
        if record.status != from {
            return Err(ApiError::Conflict(format!(
                "cannot move from {} to {}",
                record.status, to
            )));
        }
        record.status = to;
        record.last_activity = record.last_activity.max(now);
        Ok(to)
    }
}

#[async_trait]
impl AttemptApi for InMemoryAttemptApi {
    async fn list_sessions(
        &self,
        user_id: UserId,
        include_expired: bool,
    ) -> Result<Vec<SessionRecord>, ApiError> {
        let backend = self.lock()?;
        Ok(backend
            .records
            .values()
            .filter(|record| record.user_id == user_id)
            .filter(|record| include_expired || record.status != AttemptStatus::Expired)
            .cloned()
            .collect())
    }

    async fn fetch_session(&self, attempt_id: AttemptId) -> Result<SessionRecord, ApiError> {
        let backend = self.lock()?;
        backend
            .records
            .get(&attempt_id)
            .cloned()
            .ok_or(ApiError::NotFound(attempt_id))
    }

    async fn persist(&self, request: &PersistRequest) -> Result<(), ApiError> {
        let now = self.clock.now();
        let mut backend = self.lock()?;
        let record = backend
            .records
            .get_mut(&request.attempt_id)
            .ok_or(ApiError::NotFound(request.attempt_id))?;
        if record.status.is_terminal() {
            return Err(ApiError::Conflict(format!(
                "attempt is {}",
                record.status
            )));
        }
        record.answers = request.answers.clone();
        record.flagged_questions = request.flagged_questions.clone();
        record.current_question_index = request.current_question_index;
        record.time_remaining = request.time_remaining;
        record.last_activity = record.last_activity.max(now);
        backend.persisted.push(request.clone());
        Ok(())
    }

    async fn resume(&self, attempt_id: AttemptId) -> Result<AttemptStatus, ApiError> {
        self.transition(attempt_id, AttemptStatus::Paused, AttemptStatus::InProgress)
    }

    async fn pause(&self, attempt_id: AttemptId) -> Result<AttemptStatus, ApiError> {
        self.transition(attempt_id, AttemptStatus::InProgress, AttemptStatus::Paused)
    }

    async fn abandon(&self, attempt_id: AttemptId) -> Result<(), ApiError> {
        let mut backend = self.lock()?;
        if backend.records.remove(&attempt_id).is_none() {
            return Err(ApiError::NotFound(attempt_id));
        }
        backend.abandoned.insert(attempt_id);
        Ok(())
    }

    async fn submit(
        &self,
        attempt_id: AttemptId,
        answers: &BTreeMap<QuestionId, AnswerValue>,
    ) -> Result<SubmitResult, ApiError> {
        let now = self.clock.now();
        let mut backend = self.lock()?;
        let key = backend.answer_key.clone();
        let record = backend
            .records
            .get_mut(&attempt_id)
            .ok_or(ApiError::NotFound(attempt_id))?;
        if record.status == AttemptStatus::Expired {
            return Err(ApiError::Conflict("attempt expired".into()));
        }

        let total = u32::try_from(record.question_ids.len()).unwrap_or(u32::MAX);
        let mut correct = 0_u32;
        let mut answered = 0_u32;
        for qid in &record.question_ids {
            let Some(given) = answers.get(qid).filter(|value| !value.is_blank()) else {
                continue;
            };
            answered += 1;
            if key.get(qid) == Some(given) {
                correct += 1;
            }
        }

        record.answers = answers.clone();
        record.status = AttemptStatus::Completed;
        record.last_activity = record.last_activity.max(now);
        backend.submissions += 1;

        let max_score = f64::from(total);
        let score = f64::from(correct);
        Ok(SubmitResult {
            score,
            max_score,
            percentage: if total == 0 { 0.0 } else { score * 100.0 / max_score },
            correct,
            incorrect: answered - correct,
            unanswered: total - answered,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use exam_core::model::TestId;
    use exam_core::time::{fixed_clock, fixed_now};

    fn seeded() -> (InMemoryAttemptApi, TestAttemptSession) {
        let api = InMemoryAttemptApi::new(fixed_clock());
        let session = TestAttemptSession::start(
            AttemptId::random(),
            TestId::new(1),
            UserId::new(5),
            (1..=4).map(QuestionId::new).collect(),
            600,
            fixed_now(),
        )
        .unwrap();
        api.insert(&session);
        (api, session)
    }

    #[tokio::test]
    async fn failing_backend_reports_unavailable() {
        let (api, session) = seeded();
        api.set_failing(true);
        let err = api.fetch_session(session.id()).await.unwrap_err();
        assert!(err.is_transient());

        api.set_failing(false);
        assert!(api.fetch_session(session.id()).await.is_ok());
    }

    #[tokio::test]
    async fn pause_resume_follow_backend_rules() {
        let (api, session) = seeded();
        assert_eq!(api.pause(session.id()).await.unwrap(), AttemptStatus::Paused);
        // repeated pause is accepted
        assert_eq!(api.pause(session.id()).await.unwrap(), AttemptStatus::Paused);
        assert_eq!(
            api.resume(session.id()).await.unwrap(),
            AttemptStatus::InProgress
        );

        api.abandon(session.id()).await.unwrap();
        assert!(api.is_abandoned(session.id()));
        assert!(matches!(
            api.resume(session.id()).await,
            Err(ApiError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn submit_scores_against_answer_key() {
        let (api, session) = seeded();
        api.set_answer_key(BTreeMap::from([
            (QuestionId::new(1), AnswerValue::Bool(true)),
            (QuestionId::new(2), AnswerValue::text("paris")),
        ]));
        let answers = BTreeMap::from([
            (QuestionId::new(1), AnswerValue::Bool(true)),
            (QuestionId::new(2), AnswerValue::text("lyon")),
            (QuestionId::new(3), AnswerValue::text("  ")),
        ]);

        let result = api.submit(session.id(), &answers).await.unwrap();
        assert_eq!(result.correct, 1);
        assert_eq!(result.incorrect, 1);
        assert_eq!(result.unanswered, 2);
        assert!((result.percentage - 25.0).abs() < f64::EPSILON);
        assert_eq!(
            api.record(session.id()).unwrap().status,
            AttemptStatus::Completed
        );
        assert!(matches!(
            api.persist(&PersistRequest::from_session(&session)).await,
            Err(ApiError::Conflict(_))
        ));
    }
}
