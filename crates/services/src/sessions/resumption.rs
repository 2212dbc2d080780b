use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

use exam_core::Clock;
use exam_core::model::{AttemptId, AttemptStatus, SessionSettings, TestAttemptSession, TestId, UserId};
use storage::repository::SnapshotStore;

use super::cache::SessionListCache;
use super::view::AttemptListItem;
use crate::api::AttemptApi;
use crate::error::RegistryError;

/// Where the caller should navigate after a successful resume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResumeTarget {
    pub attempt_id: AttemptId,
    pub test_id: TestId,
    pub question_index: usize,
}

/// Lists a user's attempts across tests and gates resume/pause/abandon.
///
/// Staleness is computed on every read from `last_activity`; nothing derived
/// is written back.
pub struct ResumptionRegistry {
    clock: Clock,
    settings: SessionSettings,
    api: Arc<dyn AttemptApi>,
    snapshots: SnapshotStore,
    cache: SessionListCache,
    abandoned: Mutex<HashSet<AttemptId>>,
}

impl ResumptionRegistry {
    #[must_use]
    pub fn new(
        clock: Clock,
        settings: SessionSettings,
        api: Arc<dyn AttemptApi>,
        snapshots: SnapshotStore,
    ) -> Self {
        let cache = SessionListCache::new(settings.list_cache_ttl());
        Self {
            clock,
            settings,
            api,
            snapshots,
            cache,
            abandoned: Mutex::new(HashSet::new()),
        }
    }

    #[must_use]
    pub fn cache(&self) -> &SessionListCache {
        &self.cache
    }

    fn is_abandoned(&self, attempt_id: AttemptId) -> bool {
        self.abandoned
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&attempt_id)
    }

    /// Attempts for `user_id`, most recently active first.
    ///
    /// Expired attempts are dropped unless `include_expired` is set; their
    /// local snapshots are evicted either way.
    ///
    /// # Errors
    ///
    /// Returns `RegistryError::Api` when the list cannot be fetched.
    pub async fn list(
        &self,
        user_id: UserId,
        include_expired: bool,
    ) -> Result<Vec<AttemptListItem>, RegistryError> {
        let now = self.clock.now();
        let sessions = match self.cache.get(user_id, include_expired, now) {
            Some(sessions) => sessions,
            None => {
                let fetched = self.fetch_list(user_id, include_expired).await?;
                self.cache
                    .put(user_id, include_expired, fetched.clone(), now);
                fetched
            }
        };

        let staleness = self.settings.staleness_threshold();
        let mut items = Vec::with_capacity(sessions.len());
        for session in &sessions {
            if self.is_abandoned(session.id()) {
                continue;
            }
            let item = AttemptListItem::from_session(session, now, staleness);
            if item.status == AttemptStatus::Expired {
                self.evict_snapshot(session.id()).await;
                if !include_expired {
                    continue;
                }
            }
            items.push(item);
        }

        items.sort_by(|a, b| {
            b.last_activity
                .cmp(&a.last_activity)
                .then_with(|| a.attempt_id.cmp(&b.attempt_id))
        });
        Ok(items)
    }

    async fn fetch_list(
        &self,
        user_id: UserId,
        include_expired: bool,
    ) -> Result<Vec<TestAttemptSession>, RegistryError> {
        let records = self.api.list_sessions(user_id, include_expired).await?;
        let mut sessions = Vec::with_capacity(records.len());
        for record in records {
            let attempt_id = record.id;
            match record.into_session() {
                Ok(session) => sessions.push(session),
                Err(err) => {
                    tracing::warn!(%attempt_id, error = %err, "skipping malformed attempt");
                }
            }
        }
        Ok(sessions)
    }

    async fn evict_snapshot(&self, attempt_id: AttemptId) {
        if let Err(err) = self.snapshots.delete(attempt_id).await {
            tracing::warn!(%attempt_id, error = %err, "failed to evict local snapshot");
        }
    }

    /// Load an attempt with its status classified at the current time.
    ///
    /// # Errors
    ///
    /// Returns `RegistryError::Abandoned` for attempts abandoned from this
    /// client, or `RegistryError::Api` when the backend lookup fails.
    pub async fn fetch(
        &self,
        attempt_id: AttemptId,
    ) -> Result<(TestAttemptSession, AttemptStatus), RegistryError> {
        if self.is_abandoned(attempt_id) {
            return Err(RegistryError::Abandoned(attempt_id));
        }
        let session = self.api.fetch_session(attempt_id).await?.into_session()?;
        let status = session.effective_status(self.clock.now(), self.settings.staleness_threshold());
        Ok((session, status))
    }

    /// Reopen an attempt and return where to continue.
    ///
    /// # Errors
    ///
    /// Returns `RegistryError::NotResumable` when the attempt is expired,
    /// finished, or out of time. Nothing changes in that case.
    pub async fn resume(&self, attempt_id: AttemptId) -> Result<ResumeTarget, RegistryError> {
        let (session, status) = self.fetch(attempt_id).await?;
        if !session.can_resume(self.clock.now(), self.settings.staleness_threshold()) {
            tracing::info!(%attempt_id, %status, "resume rejected");
            return Err(RegistryError::NotResumable { attempt_id, status });
        }

        if session.status() == AttemptStatus::Paused {
            self.api.resume(attempt_id).await?;
        }
        self.cache.invalidate_user(session.user_id());
        tracing::info!(%attempt_id, index = session.current_question_index(), "attempt resumed");

        Ok(ResumeTarget {
            attempt_id,
            test_id: session.test_id(),
            question_index: session.current_question_index(),
        })
    }

    /// # Errors
    ///
    /// Returns `RegistryError::InvalidTransition` unless the attempt is
    /// currently in progress.
    pub async fn pause(&self, attempt_id: AttemptId) -> Result<AttemptStatus, RegistryError> {
        let (session, status) = self.fetch(attempt_id).await?;
        if status != AttemptStatus::InProgress {
            return Err(RegistryError::InvalidTransition {
                attempt_id,
                status,
                action: "pause",
            });
        }
        let updated = self.api.pause(attempt_id).await?;
        self.cache.invalidate_user(session.user_id());
        tracing::info!(%attempt_id, "attempt paused");
        Ok(updated)
    }

    /// Discard an attempt. Irreversible from this client.
    ///
    /// # Errors
    ///
    /// Returns `RegistryError::Api` when the backend refuses; local state is
    /// left untouched in that case.
    pub async fn abandon(&self, attempt_id: AttemptId) -> Result<(), RegistryError> {
        self.api.abandon(attempt_id).await?;
        self.abandoned
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(attempt_id);
        self.evict_snapshot(attempt_id).await;
        self.cache.invalidate_all();
        tracing::info!(%attempt_id, "attempt abandoned");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use exam_core::model::{AnswerValue, QuestionId};
    use exam_core::time::{fixed_clock, fixed_now};
    use storage::repository::{SnapshotRecord, Storage};

    use crate::api::InMemoryAttemptApi;

    struct Fixture {
        api: InMemoryAttemptApi,
        snapshots: SnapshotStore,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                api: InMemoryAttemptApi::new(fixed_clock()),
                snapshots: Storage::in_memory().snapshots(),
            }
        }

        fn registry_at(&self, clock: Clock) -> ResumptionRegistry {
            ResumptionRegistry::new(
                clock,
                SessionSettings::default(),
                Arc::new(self.api.clone()),
                self.snapshots.clone(),
            )
        }

        fn seed(&self, user: u64, started_secs_ago: i64) -> TestAttemptSession {
            let session = TestAttemptSession::start(
                AttemptId::random(),
                TestId::new(10),
                UserId::new(user),
                (1..=3).map(QuestionId::new).collect(),
                1_800,
                fixed_now() - Duration::seconds(started_secs_ago),
            )
            .unwrap();
            self.api.insert(&session);
            session
        }
    }

    #[tokio::test]
    async fn list_orders_by_last_activity_descending() {
        let fx = Fixture::new();
        let older = fx.seed(1, 3_600);
        let newer = fx.seed(1, 0);
        fx.seed(2, 0);

        let items = fx.registry_at(fixed_clock()).list(UserId::new(1), false).await.unwrap();
        let ids: Vec<_> = items.iter().map(|item| item.attempt_id).collect();
        assert_eq!(ids, vec![newer.id(), older.id()]);
    }

    #[tokio::test]
    async fn stale_attempt_reads_as_expired_and_loses_its_snapshot() {
        let fx = Fixture::new();
        let session = fx.seed(1, 0);
        fx.snapshots
            .save(session.id(), &SnapshotRecord::from_session(&session, fixed_now()))
            .await
            .unwrap();

        let later = Clock::fixed(fixed_now() + Duration::hours(25));
        let registry = fx.registry_at(later);
        assert!(registry.list(UserId::new(1), false).await.unwrap().is_empty());

        let items = registry.list(UserId::new(1), true).await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].status, AttemptStatus::Expired);
        // stored status was never rewritten
        assert_eq!(
            fx.api.record(session.id()).unwrap().status,
            AttemptStatus::InProgress
        );
        assert!(fx.snapshots.load(session.id()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn expired_resume_is_rejected_and_list_is_unchanged() {
        let fx = Fixture::new();
        let session = fx.seed(1, 0);
        let registry = fx.registry_at(Clock::fixed(fixed_now() + Duration::hours(30)));
        let before = registry.list(UserId::new(1), true).await.unwrap();

        let err = registry.resume(session.id()).await.unwrap_err();
        assert!(matches!(
            err,
            RegistryError::NotResumable {
                status: AttemptStatus::Expired,
                ..
            }
        ));
        assert_eq!(registry.list(UserId::new(1), true).await.unwrap(), before);
    }

    #[tokio::test]
    async fn resume_returns_saved_position_and_reopens_paused() {
        let fx = Fixture::new();
        let mut session = fx.seed(1, 0);
        let now = fixed_now();
        session
            .set_answer(QuestionId::new(1), AnswerValue::Bool(true), now)
            .unwrap();
        session.go_to(2, now).unwrap();
        session.pause(now).unwrap();
        fx.api.insert(&session);

        let target = fx.registry_at(fixed_clock()).resume(session.id()).await.unwrap();
        assert_eq!(
            target,
            ResumeTarget {
                attempt_id: session.id(),
                test_id: TestId::new(10),
                question_index: 2,
            }
        );
        assert_eq!(
            fx.api.record(session.id()).unwrap().status,
            AttemptStatus::InProgress
        );
    }

    #[tokio::test]
    async fn pause_only_from_in_progress() {
        let fx = Fixture::new();
        let session = fx.seed(1, 0);
        let registry = fx.registry_at(fixed_clock());

        assert_eq!(
            registry.pause(session.id()).await.unwrap(),
            AttemptStatus::Paused
        );
        let err = registry.pause(session.id()).await.unwrap_err();
        assert!(matches!(
            err,
            RegistryError::InvalidTransition {
                status: AttemptStatus::Paused,
                action: "pause",
                ..
            }
        ));
    }

    #[tokio::test]
    async fn abandoned_attempt_disappears_from_list() {
        let fx = Fixture::new();
        let keep = fx.seed(1, 60);
        let gone = fx.seed(1, 0);
        let registry = fx.registry_at(fixed_clock());
        // warm the cache so abandon has to invalidate it
        assert_eq!(registry.list(UserId::new(1), false).await.unwrap().len(), 2);

        registry.abandon(gone.id()).await.unwrap();
        let ids: Vec<_> = registry
            .list(UserId::new(1), false)
            .await
            .unwrap()
            .into_iter()
            .map(|item| item.attempt_id)
            .collect();
        assert_eq!(ids, vec![keep.id()]);
        assert!(matches!(
            registry.resume(gone.id()).await,
            Err(RegistryError::Abandoned(_))
        ));
    }

    #[tokio::test]
    async fn cached_list_is_reclassified_on_read() {
        let fx = Fixture::new();
        fx.seed(1, 0);
        let registry = fx.registry_at(fixed_clock());
        assert_eq!(registry.list(UserId::new(1), false).await.unwrap().len(), 1);

        // backend goes away; the cached copy still answers within the TTL
        fx.api.set_failing(true);
        assert_eq!(registry.list(UserId::new(1), false).await.unwrap().len(), 1);

        registry.cache().invalidate_user(UserId::new(1));
        assert!(matches!(
            registry.list(UserId::new(1), false).await,
            Err(RegistryError::Api(_))
        ));
    }
}
