use async_trait::async_trait;
use chrono::{DateTime, Utc};
use exam_core::model::{
    AnswerValue, AttemptError, AttemptId, QuestionId, TestAttemptSession,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex};
use thiserror::Error;

/// Errors surfaced by storage adapters.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StorageError {
    #[error("not found")]
    NotFound,

    #[error("connection error: {0}")]
    Connection(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

//
// ─── KEYS ──────────────────────────────────────────────────────────────────────
//

/// Logical partition of the key-value store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Namespace(&'static str);

impl Namespace {
    /// Local mirror of an attempt's mutable state.
    pub const ATTEMPT_SNAPSHOT: Namespace = Namespace("attempt_snapshot");

    #[must_use]
    pub const fn new(name: &'static str) -> Self {
        Self(name)
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        self.0
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

/// Typed key: one entry per `(namespace, attempt)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StoreKey {
    pub namespace: Namespace,
    pub attempt_id: AttemptId,
}

impl StoreKey {
    #[must_use]
    pub fn new(namespace: Namespace, attempt_id: AttemptId) -> Self {
        Self {
            namespace,
            attempt_id,
        }
    }
}

//
// ─── KEY-VALUE CONTRACT ────────────────────────────────────────────────────────
//

/// Durable local key-value store holding serialized documents.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Fetch the value stored under `key`, if any.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the backend cannot be read.
    async fn get(&self, key: &StoreKey) -> Result<Option<String>, StorageError>;

    /// Insert or overwrite the value under `key`. Last write wins.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the value cannot be stored.
    async fn put(&self, key: &StoreKey, value: String) -> Result<(), StorageError>;

    /// Delete the entry. Missing keys are not an error.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the backend cannot be written.
    async fn remove(&self, key: &StoreKey) -> Result<(), StorageError>;

    /// List attempt ids that have an entry in `namespace`.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` on backend or decoding failures.
    async fn keys(&self, namespace: Namespace) -> Result<Vec<AttemptId>, StorageError>;
}

/// Simple in-memory store for tests and prototyping.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    entries: Arc<Mutex<HashMap<StoreKey, String>>>,
}

impl InMemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStore for InMemoryStore {
    async fn get(&self, key: &StoreKey) -> Result<Option<String>, StorageError> {
        let guard = self
            .entries
            .lock()
            .map_err(|e| StorageError::Connection(e.to_string()))?;
        Ok(guard.get(key).cloned())
    }

    async fn put(&self, key: &StoreKey, value: String) -> Result<(), StorageError> {
        let mut guard = self
            .entries
            .lock()
            .map_err(|e| StorageError::Connection(e.to_string()))?;
        guard.insert(*key, value);
        Ok(())
    }

    async fn remove(&self, key: &StoreKey) -> Result<(), StorageError> {
        let mut guard = self
            .entries
            .lock()
            .map_err(|e| StorageError::Connection(e.to_string()))?;
        guard.remove(key);
        Ok(())
    }

    async fn keys(&self, namespace: Namespace) -> Result<Vec<AttemptId>, StorageError> {
        let guard = self
            .entries
            .lock()
            .map_err(|e| StorageError::Connection(e.to_string()))?;
        let mut ids: Vec<AttemptId> = guard
            .keys()
            .filter(|key| key.namespace == namespace)
            .map(|key| key.attempt_id)
            .collect();
        ids.sort();
        Ok(ids)
    }
}

//
// ─── SNAPSHOTS ─────────────────────────────────────────────────────────────────
//

/// Locally persisted shape of an attempt, written so a reload can recover work
/// that has not reached the backend yet.
///
/// JSON layout: `{answers, flaggedQuestions, currentQuestionIndex, timeRemaining, lastSaved}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotRecord {
    pub answers: BTreeMap<QuestionId, AnswerValue>,
    pub flagged_questions: Vec<QuestionId>,
    pub current_question_index: usize,
    pub time_remaining: u32,
    pub last_saved: DateTime<Utc>,
}

impl SnapshotRecord {
    #[must_use]
    pub fn from_session(session: &TestAttemptSession, saved_at: DateTime<Utc>) -> Self {
        Self {
            answers: session.answers().clone(),
            flagged_questions: session.flagged_questions().iter().copied().collect(),
            current_question_index: session.current_question_index(),
            time_remaining: session.time_remaining(),
            last_saved: saved_at,
        }
    }

    #[must_use]
    pub fn flagged_set(&self) -> BTreeSet<QuestionId> {
        self.flagged_questions.iter().copied().collect()
    }

    /// Apply the snapshot on top of a session fetched from the backend.
    ///
    /// # Errors
    ///
    /// Returns `AttemptError` if the snapshot does not fit the session's questions.
    pub fn apply_to(
        &self,
        session: &mut TestAttemptSession,
        now: DateTime<Utc>,
    ) -> Result<(), AttemptError> {
        session.restore(
            self.answers.clone(),
            self.flagged_set(),
            self.current_question_index,
            self.time_remaining,
            now,
        )
    }
}

/// Typed access to attempt snapshots on top of any [`KeyValueStore`].
#[derive(Clone)]
pub struct SnapshotStore {
    kv: Arc<dyn KeyValueStore>,
}

impl SnapshotStore {
    #[must_use]
    pub fn new(kv: Arc<dyn KeyValueStore>) -> Self {
        Self { kv }
    }

    fn key(attempt_id: AttemptId) -> StoreKey {
        StoreKey::new(Namespace::ATTEMPT_SNAPSHOT, attempt_id)
    }

    /// # Errors
    ///
    /// Returns `StorageError` on backend failures or a corrupt document.
    pub async fn load(&self, attempt_id: AttemptId) -> Result<Option<SnapshotRecord>, StorageError> {
        let Some(raw) = self.kv.get(&Self::key(attempt_id)).await? else {
            return Ok(None);
        };
        Ok(Some(serde_json::from_str(&raw)?))
    }

    /// # Errors
    ///
    /// Returns `StorageError` if the record cannot be encoded or stored.
    pub async fn save(
        &self,
        attempt_id: AttemptId,
        record: &SnapshotRecord,
    ) -> Result<(), StorageError> {
        let raw = serde_json::to_string(record)?;
        self.kv.put(&Self::key(attempt_id), raw).await
    }

    /// # Errors
    ///
    /// Returns `StorageError` if the backend cannot be written.
    pub async fn delete(&self, attempt_id: AttemptId) -> Result<(), StorageError> {
        self.kv.remove(&Self::key(attempt_id)).await
    }

    /// # Errors
    ///
    /// Returns `StorageError` on backend failures.
    pub async fn list_ids(&self) -> Result<Vec<AttemptId>, StorageError> {
        self.kv.keys(Namespace::ATTEMPT_SNAPSHOT).await
    }
}

/// Aggregates the local persistence boundary behind a trait object for easy backend swapping.
#[derive(Clone)]
pub struct Storage {
    pub kv: Arc<dyn KeyValueStore>,
}

impl Storage {
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            kv: Arc::new(InMemoryStore::new()),
        }
    }

    #[must_use]
    pub fn snapshots(&self) -> SnapshotStore {
        SnapshotStore::new(Arc::clone(&self.kv))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use exam_core::model::{TestId, UserId};
    use exam_core::time::fixed_now;

    fn build_session() -> TestAttemptSession {
        let qids = (1..=4).map(QuestionId::new).collect();
        TestAttemptSession::start(
            AttemptId::random(),
            TestId::new(1),
            UserId::new(1),
            qids,
            600,
            fixed_now(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn snapshot_round_trips_session_state() {
        let storage = Storage::in_memory();
        let snapshots = storage.snapshots();
        let now = fixed_now();

        let mut session = build_session();
        session
            .set_answer(QuestionId::new(1), AnswerValue::choices([2, 3]), now)
            .unwrap();
        session
            .set_answer(QuestionId::new(2), AnswerValue::text("mitochondria"), now)
            .unwrap();
        session.toggle_flag(QuestionId::new(4), now).unwrap();
        session.go_to(3, now).unwrap();
        session.charge_time(42);

        let record = SnapshotRecord::from_session(&session, now);
        snapshots.save(session.id(), &record).await.unwrap();
        let loaded = snapshots.load(session.id()).await.unwrap().unwrap();
        assert_eq!(loaded, record);

        let mut reloaded = build_session();
        loaded.apply_to(&mut reloaded, now).unwrap();
        assert_eq!(reloaded.answers(), session.answers());
        assert_eq!(reloaded.flagged_questions(), session.flagged_questions());
        assert_eq!(
            reloaded.current_question_index(),
            session.current_question_index()
        );
        assert_eq!(reloaded.time_remaining(), session.time_remaining());
    }

    #[test]
    fn snapshot_uses_camel_case_layout() {
        let session = build_session();
        let record = SnapshotRecord::from_session(&session, fixed_now());
        let value = serde_json::to_value(&record).unwrap();
        for field in [
            "answers",
            "flaggedQuestions",
            "currentQuestionIndex",
            "timeRemaining",
            "lastSaved",
        ] {
            assert!(value.get(field).is_some(), "missing {field}");
        }
        assert!(value["flaggedQuestions"].is_array());
    }

    #[tokio::test]
    async fn namespaces_do_not_collide() {
        let store = InMemoryStore::new();
        let id = AttemptId::random();
        let other = Namespace::new("other");
        store
            .put(&StoreKey::new(Namespace::ATTEMPT_SNAPSHOT, id), "a".into())
            .await
            .unwrap();
        store
            .put(&StoreKey::new(other, id), "b".into())
            .await
            .unwrap();

        assert_eq!(store.keys(other).await.unwrap(), vec![id]);
        store
            .remove(&StoreKey::new(other, id))
            .await
            .unwrap();
        assert_eq!(
            store
                .get(&StoreKey::new(Namespace::ATTEMPT_SNAPSHOT, id))
                .await
                .unwrap()
                .as_deref(),
            Some("a")
        );
        assert!(store.keys(other).await.unwrap().is_empty());
    }
}
