use std::sync::Arc;

use exam_core::model::{AttemptId, SessionSettings};
use storage::repository::Storage;

use crate::api::{AttemptApi, HttpAttemptApi};
use crate::config::ApiConfig;
use crate::error::AppServicesError;
use crate::sessions::{ResumptionRegistry, SessionCoordinator};
use crate::Clock;

/// Assembles the attempt services around one storage backend and one API client.
#[derive(Clone)]
pub struct AppServices {
    clock: Clock,
    settings: SessionSettings,
    storage: Storage,
    api: Arc<dyn AttemptApi>,
    registry: Arc<ResumptionRegistry>,
}

impl AppServices {
    #[must_use]
    pub fn new(
        clock: Clock,
        settings: SessionSettings,
        storage: Storage,
        api: Arc<dyn AttemptApi>,
    ) -> Self {
        let registry = Arc::new(ResumptionRegistry::new(
            clock,
            settings.clone(),
            Arc::clone(&api),
            storage.snapshots(),
        ));
        Self {
            clock,
            settings,
            storage,
            api,
            registry,
        }
    }

    /// Build services backed by `SQLite` storage and the HTTP attempt API.
    ///
    /// # Errors
    ///
    /// Returns `AppServicesError` if storage initialization fails or the HTTP
    /// client cannot be built.
    pub async fn new_sqlite(
        db_url: &str,
        clock: Clock,
        settings: SessionSettings,
        api_config: ApiConfig,
    ) -> Result<Self, AppServicesError> {
        let storage = Storage::sqlite(db_url).await?;
        let api: Arc<dyn AttemptApi> = Arc::new(HttpAttemptApi::new(api_config)?);
        Ok(Self::new(clock, settings, storage, api))
    }

    #[must_use]
    pub fn registry(&self) -> Arc<ResumptionRegistry> {
        Arc::clone(&self.registry)
    }

    /// Resume `attempt_id` and hand back a coordinator positioned where the
    /// attempt left off.
    ///
    /// # Errors
    ///
    /// Returns `AppServicesError::Registry` when the attempt cannot be
    /// resumed or fetched.
    pub async fn open_attempt(
        &self,
        attempt_id: AttemptId,
    ) -> Result<SessionCoordinator, AppServicesError> {
        let target = self.registry.resume(attempt_id).await?;
        let (session, _) = self.registry.fetch(target.attempt_id).await?;
        let coordinator = SessionCoordinator::open(
            session,
            Arc::clone(&self.api),
            self.storage.snapshots(),
            &self.settings,
            self.clock,
        )
        .await;
        Ok(coordinator)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use exam_core::model::{AttemptStatus, QuestionId, TestAttemptSession, TestId, UserId};
    use exam_core::time::{fixed_clock, fixed_now};

    use crate::api::InMemoryAttemptApi;
    use crate::error::RegistryError;

    #[tokio::test]
    async fn open_attempt_reopens_paused_attempt_at_saved_position() {
        let api = InMemoryAttemptApi::new(fixed_clock());
        let now = fixed_now();
        let mut session = TestAttemptSession::start(
            AttemptId::random(),
            TestId::new(2),
            UserId::new(8),
            (1..=6).map(QuestionId::new).collect(),
            1_200,
            now,
        )
        .unwrap();
        session.go_to(4, now).unwrap();
        session.pause(now).unwrap();
        api.insert(&session);

        let services = AppServices::new(
            fixed_clock(),
            SessionSettings::default(),
            Storage::in_memory(),
            Arc::new(api.clone()),
        );
        let coordinator = services.open_attempt(session.id()).await.unwrap();
        assert_eq!(coordinator.session().status(), AttemptStatus::InProgress);
        assert_eq!(coordinator.session().current_question_index(), 4);
    }

    #[tokio::test]
    async fn open_attempt_rejects_completed_attempt() {
        let api = InMemoryAttemptApi::new(fixed_clock());
        let now = fixed_now();
        let mut session = TestAttemptSession::start(
            AttemptId::random(),
            TestId::new(2),
            UserId::new(8),
            vec![QuestionId::new(1)],
            60,
            now,
        )
        .unwrap();
        session.complete(now).unwrap();
        api.insert(&session);

        let services = AppServices::new(
            fixed_clock(),
            SessionSettings::default(),
            Storage::in_memory(),
            Arc::new(api),
        );
        assert!(matches!(
            services.open_attempt(session.id()).await,
            Err(AppServicesError::Registry(RegistryError::NotResumable {
                status: AttemptStatus::Completed,
                ..
            }))
        ));
    }
}
