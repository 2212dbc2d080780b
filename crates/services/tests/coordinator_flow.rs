use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Duration;
use exam_core::Clock;
use exam_core::model::{
    AnswerValue, AttemptId, AttemptStatus, QuestionId, SessionSettings, TestAttemptSession, TestId,
    UserId,
};
use exam_core::time::{fixed_clock, fixed_now};
use services::sessions::{FlushOutcome, SaveStatus, SessionEvent, TimerState};
use services::{AppServices, InMemoryAttemptApi, RegistryError, SessionCoordinator};
use storage::repository::Storage;
use tokio::sync::broadcast::error::TryRecvError;

fn attempt(user: u64, questions: u64, limit: u32) -> TestAttemptSession {
    TestAttemptSession::start(
        AttemptId::random(),
        TestId::new(77),
        UserId::new(user),
        (1..=questions).map(QuestionId::new).collect(),
        limit,
        fixed_now(),
    )
    .unwrap()
}

async fn coordinator_for(
    session: TestAttemptSession,
    api: &InMemoryAttemptApi,
    storage: &Storage,
) -> SessionCoordinator {
    api.insert(&session);
    SessionCoordinator::open(
        session,
        Arc::new(api.clone()),
        storage.snapshots(),
        &SessionSettings::default(),
        fixed_clock(),
    )
    .await
}

fn drain(events: &mut tokio::sync::broadcast::Receiver<SessionEvent>) -> Vec<SessionEvent> {
    let mut out = Vec::new();
    loop {
        match events.try_recv() {
            Ok(event) => out.push(event),
            Err(TryRecvError::Empty | TryRecvError::Closed) => return out,
            Err(TryRecvError::Lagged(_)) => {}
        }
    }
}

#[tokio::test]
async fn progress_tracks_answers_out_of_one_hundred() {
    let api = InMemoryAttemptApi::new(fixed_clock());
    let storage = Storage::in_memory();
    let mut coordinator = coordinator_for(attempt(1, 100, 3_600), &api, &storage).await;

    for qid in 1..=15 {
        coordinator
            .answer(QuestionId::new(qid), AnswerValue::Bool(true))
            .await
            .unwrap();
    }
    assert_eq!(coordinator.view().progress_percentage, 15.0);

    // a blank answer clears instead of counting
    coordinator
        .answer(QuestionId::new(15), AnswerValue::text("   "))
        .await
        .unwrap();
    assert_eq!(coordinator.view().progress_percentage, 14.0);
}

#[tokio::test]
async fn time_running_out_forces_one_submission() {
    let api = InMemoryAttemptApi::new(fixed_clock());
    api.set_answer_key(BTreeMap::from([(QuestionId::new(1), AnswerValue::Bool(true))]));
    let storage = Storage::in_memory();
    let mut coordinator = coordinator_for(attempt(1, 3, 1), &api, &storage).await;
    let attempt_id = coordinator.session().id();
    let mut events = coordinator.subscribe();

    coordinator
        .answer(QuestionId::new(1), AnswerValue::Bool(true))
        .await
        .unwrap();

    // one poll charges five seconds against a one second clock
    coordinator.clock_mut().advance(Duration::seconds(5));
    let report = coordinator.on_timer().await.unwrap().unwrap();
    assert!(report.forced_submit);
    assert_eq!(coordinator.session().time_remaining(), 0);
    assert_eq!(coordinator.session().status(), AttemptStatus::Completed);
    assert_eq!(coordinator.timer_state(), TimerState::Stopped);

    for _ in 0..3 {
        coordinator.clock_mut().advance(Duration::seconds(1));
        assert!(coordinator.on_timer().await.unwrap().is_none());
    }

    let events = drain(&mut events);
    let forced = events
        .iter()
        .filter(|event| matches!(event, SessionEvent::ForcedSubmit))
        .count();
    assert_eq!(forced, 1);
    assert!(events
        .iter()
        .any(|event| matches!(event, SessionEvent::Submitted(result) if result.correct == 1)));

    assert_eq!(api.submissions(), 1);
    // the final flush carried the answer before submission
    assert!(api
        .persisted()
        .last()
        .is_some_and(|request| request.answers.contains_key(&QuestionId::new(1))));
    assert!(storage.snapshots().load(attempt_id).await.unwrap().is_none());

    // submitting again returns the stored result without another call
    let again = coordinator.submit().await.unwrap();
    assert_eq!(again.correct, 1);
    assert_eq!(api.submissions(), 1);
    assert!(coordinator
        .answer(QuestionId::new(2), AnswerValue::Bool(false))
        .await
        .is_err());
}

#[tokio::test]
async fn offline_flush_is_queued_and_replayed_once() {
    let api = InMemoryAttemptApi::new(fixed_clock());
    let storage = Storage::in_memory();
    let mut coordinator = coordinator_for(attempt(1, 5, 900), &api, &storage).await;
    let attempt_id = coordinator.session().id();

    assert_eq!(coordinator.set_online(false).await, FlushOutcome::Skipped);
    assert_eq!(coordinator.save_status(), SaveStatus::Offline);

    coordinator
        .answer(QuestionId::new(2), AnswerValue::choices([3]))
        .await
        .unwrap();
    assert_eq!(coordinator.navigate(1).await.unwrap(), FlushOutcome::Queued);
    assert_eq!(coordinator.focus_lost().await, FlushOutcome::Queued);
    assert!(coordinator.is_dirty());
    assert!(api.persisted().is_empty());

    // local mirror holds the work while offline
    let local = storage.snapshots().load(attempt_id).await.unwrap().unwrap();
    assert_eq!(local.current_question_index, 1);

    assert_eq!(coordinator.set_online(true).await, FlushOutcome::Saved);
    assert_eq!(api.persisted().len(), 1);
    assert!(!coordinator.is_dirty());

    // already online: no second flush
    assert_eq!(coordinator.set_online(true).await, FlushOutcome::Skipped);
    assert_eq!(api.persisted().len(), 1);
}

#[tokio::test]
async fn registry_lists_newest_first_and_rejects_expired_resume() {
    let api = InMemoryAttemptApi::new(fixed_clock());
    let now = fixed_now();

    let older = TestAttemptSession::start(
        AttemptId::random(),
        TestId::new(1),
        UserId::new(4),
        vec![QuestionId::new(1), QuestionId::new(2)],
        600,
        now - Duration::seconds(3_600),
    )
    .unwrap();
    let newer = attempt(4, 2, 600);
    let stale = TestAttemptSession::start(
        AttemptId::random(),
        TestId::new(2),
        UserId::new(4),
        vec![QuestionId::new(1)],
        600,
        now - Duration::hours(48),
    )
    .unwrap();
    for session in [&older, &newer, &stale] {
        api.insert(session);
    }

    let services = AppServices::new(
        Clock::fixed(now),
        SessionSettings::default(),
        Storage::in_memory(),
        Arc::new(api.clone()),
    );
    let registry = services.registry();

    let listed: Vec<_> = registry
        .list(UserId::new(4), false)
        .await
        .unwrap()
        .into_iter()
        .map(|item| item.attempt_id)
        .collect();
    assert_eq!(listed, vec![newer.id(), older.id()]);

    let with_expired = registry.list(UserId::new(4), true).await.unwrap();
    assert_eq!(with_expired.len(), 3);
    assert_eq!(with_expired[2].status, AttemptStatus::Expired);

    assert!(matches!(
        registry.resume(stale.id()).await,
        Err(RegistryError::NotResumable {
            status: AttemptStatus::Expired,
            ..
        })
    ));
    assert_eq!(registry.list(UserId::new(4), true).await.unwrap(), with_expired);

    registry.abandon(older.id()).await.unwrap();
    let remaining: Vec<_> = registry
        .list(UserId::new(4), false)
        .await
        .unwrap()
        .into_iter()
        .map(|item| item.attempt_id)
        .collect();
    assert_eq!(remaining, vec![newer.id()]);
}
