use chrono::{DateTime, Utc};

use exam_core::model::{AnswerValue, AttemptError, QuestionId, TestAttemptSession, TimeCharge};
use storage::repository::SnapshotRecord;

use crate::api::PersistRequest;

/// Result of feeding elapsed time into the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Running { remaining: u32 },
    /// The clock just reached zero. Reported once per attempt.
    ForcedSubmit,
    /// The attempt is not running; nothing was charged.
    Idle,
}

/// Owns the attempt state for the running session and tracks whether it is
/// ahead of the last state the backend confirmed.
///
/// Every user-driven mutation bumps `revision`. A flush captures the revision
/// it carried and `mark_saved` clears the dirty flag only if nothing changed
/// in the meantime. Clock ticks do not dirty the store; the remaining time
/// rides along with the next flush.
#[derive(Debug, Clone)]
pub struct SessionStore {
    session: TestAttemptSession,
    revision: u64,
    saved_revision: u64,
}

impl SessionStore {
    #[must_use]
    pub fn new(session: TestAttemptSession) -> Self {
        Self {
            session,
            revision: 0,
            saved_revision: 0,
        }
    }

    #[must_use]
    pub fn session(&self) -> &TestAttemptSession {
        &self.session
    }

    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.revision != self.saved_revision
    }

    #[must_use]
    pub fn revision(&self) -> u64 {
        self.revision
    }

    fn bump(&mut self) {
        self.revision += 1;
    }

    /// Record an answer. A blank value removes any stored answer.
    ///
    /// # Errors
    ///
    /// Returns `AttemptError` if the attempt is not running or the question is unknown.
    pub fn set_answer(
        &mut self,
        question_id: QuestionId,
        value: AnswerValue,
        now: DateTime<Utc>,
    ) -> Result<(), AttemptError> {
        self.session.set_answer(question_id, value, now)?;
        self.bump();
        Ok(())
    }

    /// Returns whether an answer was removed. Only a removal dirties the store.
    ///
    /// # Errors
    ///
    /// Returns `AttemptError` if the attempt is not running or the question is unknown.
    pub fn clear_answer(
        &mut self,
        question_id: QuestionId,
        now: DateTime<Utc>,
    ) -> Result<bool, AttemptError> {
        let removed = self.session.clear_answer(question_id, now)?;
        if removed {
            self.bump();
        }
        Ok(removed)
    }

    /// Returns the new flag state.
    ///
    /// # Errors
    ///
    /// Returns `AttemptError` if the attempt is not running or the question is unknown.
    pub fn toggle_flag(
        &mut self,
        question_id: QuestionId,
        now: DateTime<Utc>,
    ) -> Result<bool, AttemptError> {
        let flagged = self.session.toggle_flag(question_id, now)?;
        self.bump();
        Ok(flagged)
    }

    /// Move to `index`. Out-of-range indices leave the store untouched.
    ///
    /// # Errors
    ///
    /// Returns `AttemptError::OutOfRange`, or `AttemptError::NotActive` for a
    /// finished attempt.
    pub fn go_to(&mut self, index: usize, now: DateTime<Utc>) -> Result<(), AttemptError> {
        if index == self.session.current_question_index() && !self.session.status().is_terminal() {
            return Ok(());
        }
        self.session.go_to(index, now)?;
        self.bump();
        Ok(())
    }

    /// Charge `delta_secs` against the attempt clock.
    pub fn tick(&mut self, delta_secs: u32) -> TickOutcome {
        match self.session.charge_time(delta_secs) {
            TimeCharge::Running { remaining } => TickOutcome::Running { remaining },
            TimeCharge::Exhausted => {
                // status moved to completed; that must reach the backend
                self.bump();
                TickOutcome::ForcedSubmit
            }
            TimeCharge::Ignored => TickOutcome::Idle,
        }
    }

    /// # Errors
    ///
    /// Returns `AttemptError::InvalidTransition` unless the attempt is running.
    pub fn pause(&mut self, now: DateTime<Utc>) -> Result<(), AttemptError> {
        self.session.pause(now)?;
        self.bump();
        Ok(())
    }

    /// # Errors
    ///
    /// Returns `AttemptError::InvalidTransition` unless the attempt is paused.
    pub fn resume(&mut self, now: DateTime<Utc>) -> Result<(), AttemptError> {
        self.session.resume(now)?;
        self.bump();
        Ok(())
    }

    /// # Errors
    ///
    /// Returns `AttemptError::InvalidTransition` for an expired attempt.
    pub fn complete(&mut self, now: DateTime<Utc>) -> Result<(), AttemptError> {
        let was_completed = self.session.status().is_terminal();
        self.session.complete(now)?;
        if !was_completed {
            self.bump();
        }
        Ok(())
    }

    /// Apply locally cached work on top of the backend copy. The store is
    /// dirty afterwards so the recovered state is pushed on the next flush.
    ///
    /// # Errors
    ///
    /// Returns `AttemptError` if the snapshot does not fit the attempt.
    pub fn restore_local(
        &mut self,
        snapshot: &SnapshotRecord,
        now: DateTime<Utc>,
    ) -> Result<(), AttemptError> {
        snapshot.apply_to(&mut self.session, now)?;
        self.bump();
        Ok(())
    }

    /// Payload for the next flush together with the revision it carries.
    #[must_use]
    pub fn persist_request(&self) -> (PersistRequest, u64) {
        (PersistRequest::from_session(&self.session), self.revision)
    }

    #[must_use]
    pub fn snapshot(&self, saved_at: DateTime<Utc>) -> SnapshotRecord {
        SnapshotRecord::from_session(&self.session, saved_at)
    }

    /// Mark `revision` as confirmed by the backend.
    ///
    /// Returns whether the store is clean afterwards. Confirmations for an
    /// older revision than one already confirmed are ignored.
    pub fn mark_saved(&mut self, revision: u64) -> bool {
        if revision > self.saved_revision && revision <= self.revision {
            self.saved_revision = revision;
        }
        !self.is_dirty()
    }
}
