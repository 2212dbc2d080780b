use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use thiserror::Error;

use crate::model::answer::AnswerValue;
use crate::model::ids::{AttemptId, QuestionId, TestId, UserId};

//
// ─── ERRORS ────────────────────────────────────────────────────────────────────
//

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum AttemptError {
    #[error("attempt is {status}, not in progress")]
    NotActive { status: AttemptStatus },

    #[error("question index {index} is out of range (total {total})")]
    OutOfRange { index: usize, total: usize },

    #[error("question {0} is not part of this test")]
    UnknownQuestion(QuestionId),

    #[error("question {0} appears more than once")]
    DuplicateQuestion(QuestionId),

    #[error("an attempt needs at least one question")]
    NoQuestions,

    #[error("cannot move attempt from {from} to {to}")]
    InvalidTransition {
        from: AttemptStatus,
        to: AttemptStatus,
    },

    #[error("last activity is before the attempt started")]
    InvalidTimeRange,
}

//
// ─── STATUS ────────────────────────────────────────────────────────────────────
//

/// Lifecycle status of an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    InProgress,
    Paused,
    Completed,
    Expired,
}

impl AttemptStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            AttemptStatus::InProgress => "in_progress",
            AttemptStatus::Paused => "paused",
            AttemptStatus::Completed => "completed",
            AttemptStatus::Expired => "expired",
        }
    }

    /// Completed and expired attempts accept no further changes.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, AttemptStatus::Completed | AttemptStatus::Expired)
    }
}

impl fmt::Display for AttemptStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-question state shown in the navigation grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuestionNavStatus {
    Current,
    Answered,
    Marked,
    AnsweredMarked,
    Unanswered,
}

/// Result of charging elapsed time against the attempt clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeCharge {
    /// Time was deducted; the attempt is still running.
    Running { remaining: u32 },
    /// This charge took the clock to zero and completed the attempt.
    Exhausted,
    /// The attempt was not running, nothing changed.
    Ignored,
}

//
// ─── SESSION ───────────────────────────────────────────────────────────────────
//

/// Raw parts used to rehydrate an attempt from the backend or a cache.
#[derive(Debug, Clone)]
pub struct AttemptParts {
    pub id: AttemptId,
    pub test_id: TestId,
    pub user_id: UserId,
    pub status: AttemptStatus,
    pub current_question_index: usize,
    pub question_ids: Vec<QuestionId>,
    pub answers: BTreeMap<QuestionId, AnswerValue>,
    pub flagged_questions: BTreeSet<QuestionId>,
    pub time_remaining: u32,
    pub started_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

/// Mutable state of one in-progress test attempt.
///
/// Derived values (`progress_percentage`, `effective_status`, `can_resume`) are
/// computed on every read and never stored.
#[derive(Debug, Clone, PartialEq)]
pub struct TestAttemptSession {
    id: AttemptId,
    test_id: TestId,
    user_id: UserId,
    status: AttemptStatus,
    current_question_index: usize,
    question_ids: Vec<QuestionId>,
    answers: BTreeMap<QuestionId, AnswerValue>,
    flagged_questions: BTreeSet<QuestionId>,
    time_remaining: u32,
    started_at: DateTime<Utc>,
    last_activity: DateTime<Utc>,
}

impl TestAttemptSession {
    /// Start a fresh attempt positioned on the first question.
    ///
    /// # Errors
    ///
    /// Returns `AttemptError::NoQuestions` or `AttemptError::DuplicateQuestion`
    /// when the question list is unusable.
    pub fn start(
        id: AttemptId,
        test_id: TestId,
        user_id: UserId,
        question_ids: Vec<QuestionId>,
        time_limit_secs: u32,
        started_at: DateTime<Utc>,
    ) -> Result<Self, AttemptError> {
        Self::from_persisted(AttemptParts {
            id,
            test_id,
            user_id,
            status: AttemptStatus::InProgress,
            current_question_index: 0,
            question_ids,
            answers: BTreeMap::new(),
            flagged_questions: BTreeSet::new(),
            time_remaining: time_limit_secs,
            started_at,
            last_activity: started_at,
        })
    }

    /// Rehydrate an attempt, validating the invariants the rest of the system relies on.
    ///
    /// Blank answers are dropped and a zero clock on a running attempt is
    /// normalized to `Completed`.
    ///
    /// # Errors
    ///
    /// Returns `AttemptError` if the question list is empty or duplicated, an
    /// answer or flag refers to an unknown question, the index is out of range,
    /// or `last_activity` precedes `started_at`.
    pub fn from_persisted(parts: AttemptParts) -> Result<Self, AttemptError> {
        let AttemptParts {
            id,
            test_id,
            user_id,
            mut status,
            current_question_index,
            question_ids,
            mut answers,
            flagged_questions,
            time_remaining,
            started_at,
            last_activity,
        } = parts;

        if question_ids.is_empty() {
            return Err(AttemptError::NoQuestions);
        }
        let mut seen = BTreeSet::new();
        for qid in &question_ids {
            if !seen.insert(*qid) {
                return Err(AttemptError::DuplicateQuestion(*qid));
            }
        }
        if let Some(unknown) = answers
            .keys()
            .chain(flagged_questions.iter())
            .find(|qid| !seen.contains(*qid))
        {
            return Err(AttemptError::UnknownQuestion(*unknown));
        }
        if current_question_index >= question_ids.len() {
            return Err(AttemptError::OutOfRange {
                index: current_question_index,
                total: question_ids.len(),
            });
        }
        if last_activity < started_at {
            return Err(AttemptError::InvalidTimeRange);
        }

        answers.retain(|_, value| !value.is_blank());
        if time_remaining == 0 && status == AttemptStatus::InProgress {
            status = AttemptStatus::Completed;
        }

        Ok(Self {
            id,
            test_id,
            user_id,
            status,
            current_question_index,
            question_ids,
            answers,
            flagged_questions,
            time_remaining,
            started_at,
            last_activity,
        })
    }

    #[must_use]
    pub fn id(&self) -> AttemptId {
        self.id
    }

    #[must_use]
    pub fn test_id(&self) -> TestId {
        self.test_id
    }

    #[must_use]
    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    /// Stored status. Use [`Self::effective_status`] for staleness-aware reads.
    #[must_use]
    pub fn status(&self) -> AttemptStatus {
        self.status
    }

    #[must_use]
    pub fn current_question_index(&self) -> usize {
        self.current_question_index
    }

    #[must_use]
    pub fn current_question_id(&self) -> QuestionId {
        self.question_ids[self.current_question_index]
    }

    #[must_use]
    pub fn question_ids(&self) -> &[QuestionId] {
        &self.question_ids
    }

    #[must_use]
    pub fn answers(&self) -> &BTreeMap<QuestionId, AnswerValue> {
        &self.answers
    }

    #[must_use]
    pub fn answer(&self, question_id: QuestionId) -> Option<&AnswerValue> {
        self.answers.get(&question_id)
    }

    #[must_use]
    pub fn flagged_questions(&self) -> &BTreeSet<QuestionId> {
        &self.flagged_questions
    }

    #[must_use]
    pub fn time_remaining(&self) -> u32 {
        self.time_remaining
    }

    #[must_use]
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    #[must_use]
    pub fn last_activity(&self) -> DateTime<Utc> {
        self.last_activity
    }

    #[must_use]
    pub fn total_questions(&self) -> usize {
        self.question_ids.len()
    }

    #[must_use]
    pub fn answered_count(&self) -> usize {
        self.answers.len()
    }

    /// Share of answered questions in percent, recomputed from `answers` on every call.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn progress_percentage(&self) -> f64 {
        let total = self.total_questions();
        if total == 0 {
            return 0.0;
        }
        (self.answered_count() as f64 * 100.0) / total as f64
    }

    #[must_use]
    pub fn contains_question(&self, question_id: QuestionId) -> bool {
        self.question_ids.contains(&question_id)
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.status == AttemptStatus::InProgress
    }

    /// Status as seen at `now`: a running or paused attempt idle for longer
    /// than `staleness` reads as `Expired`, whatever the stored value says.
    #[must_use]
    pub fn effective_status(&self, now: DateTime<Utc>, staleness: Duration) -> AttemptStatus {
        match self.status {
            AttemptStatus::InProgress | AttemptStatus::Paused
                if now - self.last_activity > staleness =>
            {
                AttemptStatus::Expired
            }
            status => status,
        }
    }

    #[must_use]
    pub fn can_resume(&self, now: DateTime<Utc>, staleness: Duration) -> bool {
        matches!(
            self.effective_status(now, staleness),
            AttemptStatus::InProgress | AttemptStatus::Paused
        ) && self.time_remaining > 0
    }

    /// Navigation-grid status for the question at `index`.
    #[must_use]
    pub fn question_status(&self, index: usize) -> Option<QuestionNavStatus> {
        let qid = *self.question_ids.get(index)?;
        if index == self.current_question_index {
            return Some(QuestionNavStatus::Current);
        }
        let answered = self.answers.contains_key(&qid);
        let flagged = self.flagged_questions.contains(&qid);
        Some(match (answered, flagged) {
            (true, true) => QuestionNavStatus::AnsweredMarked,
            (true, false) => QuestionNavStatus::Answered,
            (false, true) => QuestionNavStatus::Marked,
            (false, false) => QuestionNavStatus::Unanswered,
        })
    }

    #[must_use]
    pub fn navigation_grid(&self) -> Vec<QuestionNavStatus> {
        (0..self.total_questions())
            .filter_map(|index| self.question_status(index))
            .collect()
    }

    // ─── Mutations ─────────────────────────────────────────────────────────────

    fn ensure_active(&self) -> Result<(), AttemptError> {
        if self.is_active() {
            Ok(())
        } else {
            Err(AttemptError::NotActive {
                status: self.status,
            })
        }
    }

    fn ensure_known(&self, question_id: QuestionId) -> Result<(), AttemptError> {
        if self.contains_question(question_id) {
            Ok(())
        } else {
            Err(AttemptError::UnknownQuestion(question_id))
        }
    }

    /// Insert or replace the answer for a question. A blank value clears it.
    ///
    /// # Errors
    ///
    /// Returns `AttemptError::NotActive` unless the attempt is in progress, or
    /// `AttemptError::UnknownQuestion` for ids outside the test.
    pub fn set_answer(
        &mut self,
        question_id: QuestionId,
        value: AnswerValue,
        now: DateTime<Utc>,
    ) -> Result<(), AttemptError> {
        self.ensure_active()?;
        self.ensure_known(question_id)?;
        if value.is_blank() {
            self.answers.remove(&question_id);
        } else {
            self.answers.insert(question_id, value);
        }
        self.touch(now);
        Ok(())
    }

    /// Remove the answer for a question. Returns whether an answer existed.
    ///
    /// # Errors
    ///
    /// Same as [`Self::set_answer`].
    pub fn clear_answer(
        &mut self,
        question_id: QuestionId,
        now: DateTime<Utc>,
    ) -> Result<bool, AttemptError> {
        self.ensure_active()?;
        self.ensure_known(question_id)?;
        let removed = self.answers.remove(&question_id).is_some();
        self.touch(now);
        Ok(removed)
    }

    /// Flip the review flag of a question. Returns true when it is now flagged.
    ///
    /// # Errors
    ///
    /// Same as [`Self::set_answer`].
    pub fn toggle_flag(
        &mut self,
        question_id: QuestionId,
        now: DateTime<Utc>,
    ) -> Result<bool, AttemptError> {
        self.ensure_active()?;
        self.ensure_known(question_id)?;
        let flagged = if self.flagged_questions.remove(&question_id) {
            false
        } else {
            self.flagged_questions.insert(question_id);
            true
        };
        self.touch(now);
        Ok(flagged)
    }

    /// Move to another question. Allowed while paused so the learner can look
    /// around before resuming.
    ///
    /// # Errors
    ///
    /// Returns `AttemptError::OutOfRange` for indexes outside `[0, total)`,
    /// leaving the position unchanged, or `AttemptError::NotActive` once the
    /// attempt is completed or expired.
    pub fn go_to(&mut self, index: usize, now: DateTime<Utc>) -> Result<(), AttemptError> {
        if self.status.is_terminal() {
            return Err(AttemptError::NotActive {
                status: self.status,
            });
        }
        let total = self.total_questions();
        if index >= total {
            return Err(AttemptError::OutOfRange { index, total });
        }
        self.current_question_index = index;
        self.touch(now);
        Ok(())
    }

    /// Deduct elapsed seconds from the clock, clamped at zero.
    ///
    /// Reaching zero completes the attempt. Only the charge that crosses zero
    /// reports `Exhausted`; later charges are `Ignored`.
    pub fn charge_time(&mut self, delta_secs: u32) -> TimeCharge {
        if !self.is_active() {
            return TimeCharge::Ignored;
        }
        self.time_remaining = self.time_remaining.saturating_sub(delta_secs);
        if self.time_remaining == 0 {
            self.status = AttemptStatus::Completed;
            TimeCharge::Exhausted
        } else {
            TimeCharge::Running {
                remaining: self.time_remaining,
            }
        }
    }

    /// # Errors
    ///
    /// Returns `AttemptError::InvalidTransition` unless the attempt is in progress.
    pub fn pause(&mut self, now: DateTime<Utc>) -> Result<(), AttemptError> {
        self.transition(AttemptStatus::InProgress, AttemptStatus::Paused, now)
    }

    /// # Errors
    ///
    /// Returns `AttemptError::InvalidTransition` unless the attempt is paused.
    pub fn resume(&mut self, now: DateTime<Utc>) -> Result<(), AttemptError> {
        self.transition(AttemptStatus::Paused, AttemptStatus::InProgress, now)
    }

    /// Mark the attempt as submitted.
    ///
    /// # Errors
    ///
    /// Returns `AttemptError::InvalidTransition` from `Expired`. Completing an
    /// already completed attempt is a no-op.
    pub fn complete(&mut self, now: DateTime<Utc>) -> Result<(), AttemptError> {
        match self.status {
            AttemptStatus::Completed => Ok(()),
            AttemptStatus::Expired => Err(AttemptError::InvalidTransition {
                from: self.status,
                to: AttemptStatus::Completed,
            }),
            AttemptStatus::InProgress | AttemptStatus::Paused => {
                self.status = AttemptStatus::Completed;
                self.touch(now);
                Ok(())
            }
        }
    }

    /// Replace the mutable parts with state recovered from a local cache.
    ///
    /// The clock only ever moves down: the smaller of the current and the
    /// restored remaining time wins.
    ///
    /// # Errors
    ///
    /// Returns `AttemptError` when the restored state references unknown
    /// questions or an out-of-range index; nothing is changed in that case.
    pub fn restore(
        &mut self,
        answers: BTreeMap<QuestionId, AnswerValue>,
        flagged_questions: BTreeSet<QuestionId>,
        current_question_index: usize,
        time_remaining: u32,
        now: DateTime<Utc>,
    ) -> Result<(), AttemptError> {
        let total = self.total_questions();
        if current_question_index >= total {
            return Err(AttemptError::OutOfRange {
                index: current_question_index,
                total,
            });
        }
        if let Some(unknown) = answers
            .keys()
            .chain(flagged_questions.iter())
            .find(|qid| !self.contains_question(**qid))
        {
            return Err(AttemptError::UnknownQuestion(*unknown));
        }

        self.answers = answers;
        self.answers.retain(|_, value| !value.is_blank());
        self.flagged_questions = flagged_questions;
        self.current_question_index = current_question_index;
        self.time_remaining = self.time_remaining.min(time_remaining);
        if self.time_remaining == 0 && self.is_active() {
            self.status = AttemptStatus::Completed;
        }
        self.touch(now);
        Ok(())
    }

    fn transition(
        &mut self,
        from: AttemptStatus,
        to: AttemptStatus,
        now: DateTime<Utc>,
    ) -> Result<(), AttemptError> {
        if self.status != from {
            return Err(AttemptError::InvalidTransition {
                from: self.status,
                to,
            });
        }
        self.status = to;
        self.touch(now);
        Ok(())
    }

    fn touch(&mut self, now: DateTime<Utc>) {
        if now > self.last_activity {
            self.last_activity = now;
        }
    }
}

//
// ─── TESTS ─────────────────────────────────────────────────────────────────────
//
