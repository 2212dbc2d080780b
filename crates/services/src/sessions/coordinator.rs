use std::sync::Arc;

use chrono::Duration;
use tokio::sync::broadcast;

use exam_core::Clock;
use exam_core::model::{
    AnswerValue, AttemptError, AttemptStatus, QuestionId, SessionSettings, TestAttemptSession,
};
use storage::repository::SnapshotStore;

use super::autosave::{
    AutoSavePolicy, FlushApplied, FlushDecision, FlushTicket, SaveFailure, SaveStatus, SaveTrigger,
};
use super::store::SessionStore;
use super::timer::{TimeWarning, TimerController, TimerReport, TimerState};
use super::view::SessionView;
use crate::api::{AttemptApi, PersistRequest, SubmitResult};
use crate::error::CoordinatorError;

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Notifications published to whoever renders the attempt.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    StateChanged(SessionView),
    SaveStatusChanged(SaveStatus),
    TimeWarning(TimeWarning),
    ResumedFromBackground { charged_secs: u32 },
    /// The clock ran out; submission follows.
    ForcedSubmit,
    Submitted(SubmitResult),
}

/// Result of one flush request.
#[derive(Debug, Clone, PartialEq)]
pub enum FlushOutcome {
    Saved,
    Failed(SaveFailure),
    Queued,
    Skipped,
    Superseded,
}

/// Output of [`SessionCoordinator::prepare_flush`].
pub enum FlushPlan {
    Run(FlushJob),
    Queued,
    Skipped,
}

/// A persist call detached from the coordinator, so the caller does not hold
/// the coordinator across the network round trip.
pub struct FlushJob {
    ticket: FlushTicket,
    request: PersistRequest,
    api: Arc<dyn AttemptApi>,
}

/// Completed [`FlushJob`], to hand back to [`SessionCoordinator::finish_flush`].
#[derive(Debug, Clone)]
pub struct FlushReport {
    pub ticket: FlushTicket,
    pub result: Result<(), SaveFailure>,
}

impl FlushJob {
    pub async fn run(self) -> FlushReport {
        let result = self
            .api
            .persist(&self.request)
            .await
            .map_err(|err| SaveFailure {
                message: err.to_string(),
                transient: err.is_transient(),
            });
        FlushReport {
            ticket: self.ticket,
            result,
        }
    }
}

/// Single mutation surface for a running attempt.
///
/// Mutations apply to the store synchronously, then the auto-save policy is
/// consulted and a [`SessionEvent`] is published.
pub struct SessionCoordinator {
    clock: Clock,
    staleness: Duration,
    store: SessionStore,
    autosave: AutoSavePolicy,
    timer: TimerController,
    api: Arc<dyn AttemptApi>,
    snapshots: SnapshotStore,
    /// Store revision last written to the local cache.
    mirrored_revision: Option<u64>,
    events: broadcast::Sender<SessionEvent>,
    published_status: SaveStatus,
    result: Option<SubmitResult>,
}

impl SessionCoordinator {
    /// Take ownership of an attempt fetched from the backend.
    ///
    /// A local snapshot written at or after the backend's `last_activity` wins
    /// and leaves the session dirty so it is pushed on the next flush. Older
    /// or unreadable snapshots are discarded; the local cache never keeps an
    /// attempt from opening.
    pub async fn open(
        session: TestAttemptSession,
        api: Arc<dyn AttemptApi>,
        snapshots: SnapshotStore,
        settings: &SessionSettings,
        clock: Clock,
    ) -> Self {
        let now = clock.now();
        let attempt_id = session.id();
        let mut store = SessionStore::new(session);

        let cached = match snapshots.load(attempt_id).await {
            Ok(cached) => cached,
            Err(err) => {
                tracing::warn!(%attempt_id, error = %err, "unreadable local snapshot, using backend copy");
                if let Err(err) = snapshots.delete(attempt_id).await {
                    tracing::warn!(%attempt_id, error = %err, "failed to drop local snapshot");
                }
                None
            }
        };
        if let Some(snapshot) = cached {
            let usable = !store.session().status().is_terminal()
                && snapshot.last_saved >= store.session().last_activity();
            let applied = usable
                && match store.restore_local(&snapshot, now) {
                    Ok(()) => true,
                    Err(err) => {
                        tracing::warn!(%attempt_id, error = %err, "local snapshot does not fit attempt");
                        false
                    }
                };
            if applied {
                tracing::info!(%attempt_id, saved = %snapshot.last_saved, "restored local snapshot");
            } else if let Err(err) = snapshots.delete(attempt_id).await {
                tracing::warn!(%attempt_id, error = %err, "failed to drop local snapshot");
            }
        }

        let remaining = store.session().time_remaining();
        let timer = match store.session().status() {
            AttemptStatus::InProgress => TimerController::start(settings, remaining, now),
            AttemptStatus::Paused => TimerController::paused(settings, remaining, now),
            AttemptStatus::Completed | AttemptStatus::Expired => {
                TimerController::stopped(settings, now)
            }
        };
        let autosave = AutoSavePolicy::new(settings.autosave_interval(), now);
        let published_status = autosave.status(store.is_dirty());
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Self {
            clock,
            staleness: settings.staleness_threshold(),
            store,
            autosave,
            timer,
            api,
            snapshots,
            mirrored_revision: None,
            events,
            published_status,
            result: None,
        }
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    #[must_use]
    pub fn session(&self) -> &TestAttemptSession {
        self.store.session()
    }

    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.store.is_dirty()
    }

    #[must_use]
    pub fn save_status(&self) -> SaveStatus {
        self.autosave.status(self.store.is_dirty())
    }

    #[must_use]
    pub fn view(&self) -> SessionView {
        SessionView::new(self.store.session(), self.save_status())
    }

    #[must_use]
    pub fn timer_state(&self) -> TimerState {
        self.timer.state()
    }

    #[must_use]
    pub fn tick_interval(&self) -> std::time::Duration {
        self.timer.cadence()
    }

    #[must_use]
    pub fn result(&self) -> Option<&SubmitResult> {
        self.result.as_ref()
    }

    pub fn clock_mut(&mut self) -> &mut Clock {
        &mut self.clock
    }

    //
    // ─── EVENTS ────────────────────────────────────────────────────────────────
    //

    fn emit(&self, event: SessionEvent) {
        if self.events.send(event).is_err() {
            tracing::trace!("no subscribers for session event");
        }
    }

    fn publish_state(&mut self) {
        self.emit(SessionEvent::StateChanged(self.view()));
        self.publish_save_status();
    }

    fn publish_save_status(&mut self) {
        let status = self.save_status();
        if status != self.published_status {
            self.published_status = status.clone();
            self.emit(SessionEvent::SaveStatusChanged(status));
        }
    }

    //
    // ─── MUTATIONS ─────────────────────────────────────────────────────────────
    //

    /// Record an answer and mirror it to the local cache.
    ///
    /// # Errors
    ///
    /// Returns `CoordinatorError::Attempt` when the attempt is not running or
    /// the question is unknown. Nothing changes in that case.
    pub async fn answer(
        &mut self,
        question_id: QuestionId,
        value: AnswerValue,
    ) -> Result<(), CoordinatorError> {
        self.store.set_answer(question_id, value, self.clock.now())?;
        self.publish_state();
        self.mirror_local().await;
        Ok(())
    }

    /// # Errors
    ///
    /// Same as [`Self::answer`].
    pub async fn clear_answer(&mut self, question_id: QuestionId) -> Result<bool, CoordinatorError> {
        let removed = self.store.clear_answer(question_id, self.clock.now())?;
        if removed {
            self.publish_state();
            self.mirror_local().await;
        }
        Ok(removed)
    }

    /// # Errors
    ///
    /// Same as [`Self::answer`].
    pub async fn toggle_flag(&mut self, question_id: QuestionId) -> Result<bool, CoordinatorError> {
        let flagged = self.store.toggle_flag(question_id, self.clock.now())?;
        self.publish_state();
        self.mirror_local().await;
        Ok(flagged)
    }

    /// Move to `index` and flush if anything is pending.
    ///
    /// # Errors
    ///
    /// Returns `CoordinatorError::Attempt` with `AttemptError::OutOfRange` for
    /// an invalid index; the position is unchanged.
    pub async fn navigate(&mut self, index: usize) -> Result<FlushOutcome, CoordinatorError> {
        self.store.go_to(index, self.clock.now())?;
        self.publish_state();
        Ok(self.flush(SaveTrigger::Navigation).await)
    }

    pub async fn focus_lost(&mut self) -> FlushOutcome {
        self.flush(SaveTrigger::FocusLost).await
    }

    /// Flush now, even when nothing changed.
    pub async fn save_now(&mut self) -> FlushOutcome {
        self.flush(SaveTrigger::Manual).await
    }

    /// Report connectivity. Coming back online runs at most one flush.
    pub async fn set_online(&mut self, online: bool) -> FlushOutcome {
        let reconnected = self.autosave.set_online(online);
        self.publish_save_status();
        if reconnected {
            tracing::info!(attempt_id = %self.store.session().id(), "connectivity restored");
            self.flush(SaveTrigger::Reconnect).await
        } else {
            FlushOutcome::Skipped
        }
    }

    /// Advance the countdown. Call at the timer cadence.
    ///
    /// Also runs the interval auto-save, and submits when time runs out.
    ///
    /// # Errors
    ///
    /// Returns `CoordinatorError` only when a forced submission fails; the
    /// attempt stays completed locally and [`Self::submit`] can be retried.
    pub async fn on_timer(&mut self) -> Result<Option<TimerReport>, CoordinatorError> {
        if self.timer.state() == TimerState::Stopped {
            return Ok(None);
        }
        let now = self.clock.now();
        let Some(report) = self.timer.poll(&mut self.store, now)? else {
            return Ok(None);
        };

        let attempt_id = self.store.session().id();
        if report.resumed_from_background {
            tracing::warn!(%attempt_id, charged = report.charged_secs, "resumed from background");
            self.emit(SessionEvent::ResumedFromBackground {
                charged_secs: report.charged_secs,
            });
        }
        if let Some(warning) = report.warning {
            tracing::info!(%attempt_id, minutes = warning.minutes, "time warning");
            self.emit(SessionEvent::TimeWarning(warning));
        }
        self.publish_state();

        if report.forced_submit {
            tracing::info!(%attempt_id, "time is up, submitting");
            self.emit(SessionEvent::ForcedSubmit);
            self.finalize().await?;
        } else {
            self.flush(SaveTrigger::Interval).await;
        }
        Ok(Some(report))
    }

    /// Stop the clock and hand the attempt back to the backend as paused.
    ///
    /// # Errors
    ///
    /// Returns `CoordinatorError::Attempt` unless the attempt is running, or
    /// `CoordinatorError::Api` if the backend did not record the pause. The
    /// local clock stays stopped either way.
    pub async fn pause(&mut self) -> Result<(), CoordinatorError> {
        self.store.pause(self.clock.now())?;
        self.timer.pause()?;
        self.publish_state();
        self.flush(SaveTrigger::Manual).await;
        self.api.pause(self.store.session().id()).await?;
        tracing::info!(attempt_id = %self.store.session().id(), "attempt paused");
        Ok(())
    }

    /// # Errors
    ///
    /// Returns `CoordinatorError::Attempt` unless the attempt is paused,
    /// `CoordinatorError::NotResumable` once it has been idle past the
    /// staleness threshold, or `CoordinatorError::Api` if the backend
    /// refuses. The attempt stays paused in every case.
    pub async fn resume(&mut self) -> Result<(), CoordinatorError> {
        let session = self.store.session();
        let status = session.status();
        if status != AttemptStatus::Paused {
            return Err(AttemptError::InvalidTransition {
                from: status,
                to: AttemptStatus::InProgress,
            }
            .into());
        }
        let now = self.clock.now();
        if !session.can_resume(now, self.staleness) {
            let attempt_id = session.id();
            let status = session.effective_status(now, self.staleness);
            tracing::info!(%attempt_id, %status, "resume rejected");
            return Err(CoordinatorError::NotResumable { attempt_id, status });
        }
        self.api.resume(self.store.session().id()).await?;

        self.store.resume(now)?;
        self.timer.resume(now)?;
        self.publish_state();
        tracing::info!(attempt_id = %self.store.session().id(), "attempt resumed");
        Ok(())
    }

    /// Submit the attempt. Repeated calls return the first result.
    ///
    /// # Errors
    ///
    /// Returns `CoordinatorError::Attempt` for an expired attempt, or
    /// `CoordinatorError::Api` when the backend did not accept the
    /// submission; retrying is safe.
    pub async fn submit(&mut self) -> Result<SubmitResult, CoordinatorError> {
        if let Some(result) = &self.result {
            return Ok(result.clone());
        }
        self.store.complete(self.clock.now())?;
        self.timer.stop();
        self.publish_state();
        self.finalize().await
    }

    async fn finalize(&mut self) -> Result<SubmitResult, CoordinatorError> {
        let attempt_id = self.store.session().id();
        if let FlushOutcome::Failed(failure) = self.flush(SaveTrigger::Final).await {
            tracing::warn!(%attempt_id, error = %failure.message, "final flush failed, submitting anyway");
        }

        let result = self
            .api
            .submit(attempt_id, self.store.session().answers())
            .await?;
        self.store.mark_saved(self.store.revision());
        if let Err(err) = self.snapshots.delete(attempt_id).await {
            tracing::warn!(%attempt_id, error = %err, "failed to drop local snapshot");
        }

        tracing::info!(%attempt_id, score = result.score, max = result.max_score, "attempt submitted");
        self.result = Some(result.clone());
        self.emit(SessionEvent::Submitted(result.clone()));
        self.publish_state();
        Ok(result)
    }

    //
    // ─── FLUSHING ──────────────────────────────────────────────────────────────
    //

    /// Decide on `trigger` and, if a flush is due, detach it as a [`FlushJob`].
    pub fn prepare_flush(&mut self, trigger: SaveTrigger) -> FlushPlan {
        let now = self.clock.now();
        let dirty = self.store.is_dirty();
        match self.autosave.decide(trigger, dirty, now) {
            FlushDecision::Skip => FlushPlan::Skipped,
            FlushDecision::Queued => {
                tracing::debug!(trigger = trigger.as_str(), "offline, flush queued");
                self.publish_save_status();
                FlushPlan::Queued
            }
            FlushDecision::Flush => {
                let (request, revision) = self.store.persist_request();
                let ticket = self.autosave.begin(revision);
                tracing::debug!(trigger = trigger.as_str(), seq = ticket.seq, revision, "flushing");
                FlushPlan::Run(FlushJob {
                    ticket,
                    request,
                    api: Arc::clone(&self.api),
                })
            }
        }
    }

    /// Apply a finished [`FlushJob`]. Results of superseded jobs are ignored.
    pub fn finish_flush(&mut self, report: FlushReport) -> FlushOutcome {
        let now = self.clock.now();
        let outcome = match self.autosave.complete(report.ticket, report.result.clone(), now) {
            FlushApplied::Saved => {
                self.store.mark_saved(report.ticket.revision);
                FlushOutcome::Saved
            }
            FlushApplied::Failed => {
                let failure = report.result.err().unwrap_or_else(|| SaveFailure {
                    message: "unknown failure".into(),
                    transient: true,
                });
                tracing::warn!(
                    attempt_id = %self.store.session().id(),
                    error = %failure.message,
                    "flush failed"
                );
                FlushOutcome::Failed(failure)
            }
            FlushApplied::Superseded => {
                tracing::debug!(seq = report.ticket.seq, "ignoring superseded flush");
                FlushOutcome::Superseded
            }
        };
        self.publish_save_status();
        outcome
    }

    /// Mirror the current state into the local durable cache.
    ///
    /// Failures are logged and otherwise ignored: the backend copy is still
    /// authoritative.
    pub async fn write_local_snapshot(&mut self) {
        let attempt_id = self.store.session().id();
        let record = self.store.snapshot(self.clock.now());
        match self.snapshots.save(attempt_id, &record).await {
            Ok(()) => self.mirrored_revision = Some(self.store.revision()),
            Err(err) => {
                tracing::warn!(%attempt_id, error = %err, "failed to write local snapshot");
            }
        }
    }

    /// Write the local snapshot if the store moved since the last write.
    async fn mirror_local(&mut self) {
        if self.mirrored_revision != Some(self.store.revision()) {
            self.write_local_snapshot().await;
        }
    }

    async fn flush(&mut self, trigger: SaveTrigger) -> FlushOutcome {
        match self.prepare_flush(trigger) {
            FlushPlan::Skipped => FlushOutcome::Skipped,
            FlushPlan::Queued => {
                self.write_local_snapshot().await;
                FlushOutcome::Queued
            }
            FlushPlan::Run(job) => {
                self.write_local_snapshot().await;
                let report = job.run().await;
                self.finish_flush(report)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use exam_core::model::{AttemptId, TestId, UserId};
    use exam_core::time::{fixed_clock, fixed_now};
    use storage::repository::{KeyValueStore, Namespace, Storage, StoreKey};

    use crate::api::InMemoryAttemptApi;

    async fn open(limit: u32) -> (SessionCoordinator, InMemoryAttemptApi, SnapshotStore) {
        let api = InMemoryAttemptApi::new(fixed_clock());
        let snapshots = Storage::in_memory().snapshots();
        let session = TestAttemptSession::start(
            AttemptId::random(),
            TestId::new(1),
            UserId::new(1),
            (1..=4).map(QuestionId::new).collect(),
            limit,
            fixed_now(),
        )
        .unwrap();
        api.insert(&session);
        let coordinator = SessionCoordinator::open(
            session,
            Arc::new(api.clone()),
            snapshots.clone(),
            &SessionSettings::default(),
            fixed_clock(),
        )
        .await;
        (coordinator, api, snapshots)
    }

    #[tokio::test]
    async fn answer_publishes_state_with_progress() {
        let (mut coordinator, _, _) = open(600).await;
        let mut events = coordinator.subscribe();

        coordinator
            .answer(QuestionId::new(2), AnswerValue::text("x"))
            .await
            .unwrap();

        let SessionEvent::StateChanged(view) = events.try_recv().unwrap() else {
            panic!("expected state change");
        };
        assert!((view.progress_percentage - 25.0).abs() < f64::EPSILON);
        assert_eq!(view.answered, 1);
        assert!(matches!(
            events.try_recv().unwrap(),
            SessionEvent::SaveStatusChanged(SaveStatus::Unsaved { last_error: None })
        ));
    }

    #[tokio::test]
    async fn navigation_flushes_and_cleans() {
        let (mut coordinator, api, snapshots) = open(600).await;
        coordinator
            .answer(QuestionId::new(1), AnswerValue::Bool(true))
            .await
            .unwrap();

        assert_eq!(coordinator.navigate(1).await.unwrap(), FlushOutcome::Saved);
        assert!(!coordinator.is_dirty());
        assert_eq!(api.persisted().len(), 1);
        assert_eq!(api.persisted()[0].current_question_index, 1);
        // the local mirror was written with the flush
        let id = coordinator.session().id();
        assert!(snapshots.load(id).await.unwrap().is_some());

        assert!(matches!(
            coordinator.navigate(9).await,
            Err(CoordinatorError::Attempt(AttemptError::OutOfRange { index: 9, total: 4 }))
        ));
        assert_eq!(coordinator.session().current_question_index(), 1);
    }

    #[tokio::test]
    async fn superseded_flush_does_not_clean_newer_state() {
        let (mut coordinator, api, _) = open(600).await;
        coordinator
            .answer(QuestionId::new(1), AnswerValue::Bool(true))
            .await
            .unwrap();
        let FlushPlan::Run(first) = coordinator.prepare_flush(SaveTrigger::Manual) else {
            panic!("expected a flush");
        };

        coordinator.toggle_flag(QuestionId::new(3)).await.unwrap();
        let FlushPlan::Run(second) = coordinator.prepare_flush(SaveTrigger::Manual) else {
            panic!("expected a flush");
        };

        let second_report = second.run().await;
        let first_report = first.run().await;
        assert_eq!(coordinator.finish_flush(second_report), FlushOutcome::Saved);
        assert_eq!(
            coordinator.finish_flush(first_report),
            FlushOutcome::Superseded
        );
        assert!(!coordinator.is_dirty());
        assert_eq!(api.persisted().len(), 2);
    }

    #[tokio::test]
    async fn failed_flush_keeps_dirty_and_reports_error() {
        let (mut coordinator, api, _) = open(600).await;
        coordinator
            .toggle_flag(QuestionId::new(2))
            .await
            .unwrap();
        api.set_failing(true);

        let outcome = coordinator.focus_lost().await;
        assert!(matches!(outcome, FlushOutcome::Failed(SaveFailure { transient: true, .. })));
        assert!(coordinator.is_dirty());
        assert!(matches!(
            coordinator.save_status(),
            SaveStatus::Unsaved { last_error: Some(_) }
        ));

        api.set_failing(false);
        assert_eq!(coordinator.save_now().await, FlushOutcome::Saved);
        assert!(matches!(coordinator.save_status(), SaveStatus::Saved { at: Some(_) }));
    }

    #[tokio::test]
    async fn interval_flush_waits_for_period() {
        let (mut coordinator, api, _) = open(600).await;
        coordinator
            .answer(QuestionId::new(4), AnswerValue::choices([1, 2]))
            .await
            .unwrap();

        for _ in 0..29 {
            coordinator.clock_mut().advance(Duration::seconds(1));
            coordinator.on_timer().await.unwrap();
        }
        assert!(api.persisted().is_empty());

        coordinator.clock_mut().advance(Duration::seconds(1));
        coordinator.on_timer().await.unwrap();
        assert_eq!(api.persisted().len(), 1);
        assert_eq!(api.persisted()[0].time_remaining, 570);
    }

    #[tokio::test]
    async fn newer_local_snapshot_wins_on_open() {
        let api = InMemoryAttemptApi::new(fixed_clock());
        let snapshots = Storage::in_memory().snapshots();
        let now = fixed_now();
        let session = TestAttemptSession::start(
            AttemptId::random(),
            TestId::new(1),
            UserId::new(1),
            (1..=4).map(QuestionId::new).collect(),
            600,
            now,
        )
        .unwrap();
        api.insert(&session);

        let mut local = session.clone();
        local
            .set_answer(QuestionId::new(3), AnswerValue::text("draft"), now)
            .unwrap();
        local.charge_time(100);
        snapshots
            .save(
                session.id(),
                &storage::repository::SnapshotRecord::from_session(&local, now + Duration::seconds(5)),
            )
            .await
            .unwrap();

        let coordinator = SessionCoordinator::open(
            session,
            Arc::new(api),
            snapshots,
            &SessionSettings::default(),
            Clock::fixed(now + Duration::seconds(10)),
        )
        .await;
        assert!(coordinator.is_dirty());
        assert_eq!(
            coordinator.session().answer(QuestionId::new(3)),
            Some(&AnswerValue::text("draft"))
        );
        assert_eq!(coordinator.session().time_remaining(), 500);
    }

    #[tokio::test]
    async fn pause_stops_the_clock_until_resume() {
        let (mut coordinator, api, _) = open(600).await;
        coordinator.pause().await.unwrap();
        assert_eq!(coordinator.timer_state(), TimerState::Paused);
        assert_eq!(
            api.record(coordinator.session().id()).unwrap().status,
            AttemptStatus::Paused
        );

        coordinator.clock_mut().advance(Duration::minutes(10));
        assert_eq!(coordinator.on_timer().await.unwrap(), None);
        assert!(coordinator
            .answer(QuestionId::new(1), AnswerValue::Bool(true))
            .await
            .is_err());

        coordinator.resume().await.unwrap();
        coordinator.clock_mut().advance(Duration::seconds(1));
        coordinator.on_timer().await.unwrap();
        assert_eq!(coordinator.session().time_remaining(), 599);
    }

    #[tokio::test]
    async fn stale_paused_attempt_cannot_resume() {
        let (mut coordinator, api, _) = open(600).await;
        let attempt_id = coordinator.session().id();
        coordinator.pause().await.unwrap();

        coordinator.clock_mut().advance(Duration::hours(25));
        let err = coordinator.resume().await.unwrap_err();
        assert!(matches!(
            err,
            CoordinatorError::NotResumable {
                status: AttemptStatus::Expired,
                ..
            }
        ));
        assert_eq!(coordinator.session().status(), AttemptStatus::Paused);
        assert_eq!(coordinator.timer_state(), TimerState::Paused);
        assert_eq!(api.record(attempt_id).unwrap().status, AttemptStatus::Paused);
    }

    #[tokio::test]
    async fn unreadable_local_snapshot_is_dropped_on_open() {
        let api = InMemoryAttemptApi::new(fixed_clock());
        let storage = Storage::in_memory();
        let session = TestAttemptSession::start(
            AttemptId::random(),
            TestId::new(1),
            UserId::new(1),
            (1..=4).map(QuestionId::new).collect(),
            600,
            fixed_now(),
        )
        .unwrap();
        api.insert(&session);
        let key = StoreKey::new(Namespace::ATTEMPT_SNAPSHOT, session.id());
        storage.kv.put(&key, "{not json".into()).await.unwrap();

        let coordinator = SessionCoordinator::open(
            session.clone(),
            Arc::new(api),
            storage.snapshots(),
            &SessionSettings::default(),
            fixed_clock(),
        )
        .await;
        assert_eq!(coordinator.session(), &session);
        assert!(!coordinator.is_dirty());
        assert_eq!(storage.kv.get(&key).await.unwrap(), None);
    }

    #[tokio::test]
    async fn edits_survive_reload_before_any_flush() {
        let (mut coordinator, api, snapshots) = open(600).await;
        let attempt_id = coordinator.session().id();
        coordinator
            .answer(QuestionId::new(2), AnswerValue::text("draft"))
            .await
            .unwrap();
        coordinator
            .toggle_flag(QuestionId::new(4))
            .await
            .unwrap();
        for _ in 0..10 {
            coordinator.clock_mut().advance(Duration::seconds(1));
            coordinator.on_timer().await.unwrap();
        }
        assert!(api.persisted().is_empty());
        drop(coordinator);

        let backend_copy = api.record(attempt_id).unwrap().into_session().unwrap();
        let reopened = SessionCoordinator::open(
            backend_copy,
            Arc::new(api.clone()),
            snapshots,
            &SessionSettings::default(),
            Clock::fixed(fixed_now() + Duration::seconds(10)),
        )
        .await;
        assert_eq!(
            reopened.session().answer(QuestionId::new(2)),
            Some(&AnswerValue::text("draft"))
        );
        assert!(reopened.session().flagged_questions().contains(&QuestionId::new(4)));
        assert!(reopened.is_dirty());
    }
}
