use chrono::{DateTime, Duration, Utc};

use exam_core::model::{AttemptId, AttemptStatus, QuestionNavStatus, TestAttemptSession, TestId};

use super::autosave::SaveStatus;

/// Presentation-agnostic row for the resumable-attempts list.
///
/// Not a UI view-model: no pre-formatted strings or localization. `status` is
/// the status as classified at read time.
#[derive(Debug, Clone, PartialEq)]
pub struct AttemptListItem {
    pub attempt_id: AttemptId,
    pub test_id: TestId,
    pub status: AttemptStatus,
    pub can_resume: bool,

    pub answered: usize,
    pub total_questions: usize,
    pub progress_percentage: f64,
    pub current_question_index: usize,
    pub time_remaining: u32,

    pub started_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

impl AttemptListItem {
    #[must_use]
    pub fn from_session(
        session: &TestAttemptSession,
        now: DateTime<Utc>,
        staleness: Duration,
    ) -> Self {
        Self {
            attempt_id: session.id(),
            test_id: session.test_id(),
            status: session.effective_status(now, staleness),
            can_resume: session.can_resume(now, staleness),
            answered: session.answered_count(),
            total_questions: session.total_questions(),
            progress_percentage: session.progress_percentage(),
            current_question_index: session.current_question_index(),
            time_remaining: session.time_remaining(),
            started_at: session.started_at(),
            last_activity: session.last_activity(),
        }
    }
}

/// Snapshot of the running attempt for whatever renders it.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionView {
    pub attempt_id: AttemptId,
    pub status: AttemptStatus,
    pub current_question_index: usize,
    pub total_questions: usize,
    pub answered: usize,
    pub progress_percentage: f64,
    pub time_remaining: u32,
    pub grid: Vec<QuestionNavStatus>,
    pub save_status: SaveStatus,
}

impl SessionView {
    #[must_use]
    pub fn new(session: &TestAttemptSession, save_status: SaveStatus) -> Self {
        Self {
            attempt_id: session.id(),
            status: session.status(),
            current_question_index: session.current_question_index(),
            total_questions: session.total_questions(),
            answered: session.answered_count(),
            progress_percentage: session.progress_percentage(),
            time_remaining: session.time_remaining(),
            grid: session.navigation_grid(),
            save_status,
        }
    }

    /// Number of grid cells carrying a review flag.
    #[must_use]
    pub fn flagged(&self) -> usize {
        self.grid
            .iter()
            .filter(|status| {
                matches!(
                    status,
                    QuestionNavStatus::Marked | QuestionNavStatus::AnsweredMarked
                )
            })
            .count()
    }
}
