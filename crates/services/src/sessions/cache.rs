use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use exam_core::model::{TestAttemptSession, UserId};

#[derive(Debug, Clone)]
struct CachedList {
    fetched_at: DateTime<Utc>,
    sessions: Vec<TestAttemptSession>,
}

/// Short-lived cache of attempt lists keyed by `(user, include_expired)`.
///
/// Holds raw attempts only. Status classification happens on every read, so
/// a cached entry never hides an attempt that became stale while cached.
#[derive(Debug)]
pub struct SessionListCache {
    ttl: Duration,
    entries: Mutex<HashMap<(UserId, bool), CachedList>>,
}

impl SessionListCache {
    /// A zero `ttl` disables caching.
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<(UserId, bool), CachedList>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn get(
        &self,
        user_id: UserId,
        include_expired: bool,
        now: DateTime<Utc>,
    ) -> Option<Vec<TestAttemptSession>> {
        let mut entries = self.entries();
        let key = (user_id, include_expired);
        let fresh = entries
            .get(&key)
            .is_some_and(|cached| now - cached.fetched_at < self.ttl);
        if fresh {
            entries.get(&key).map(|cached| cached.sessions.clone())
        } else {
            entries.remove(&key);
            None
        }
    }

    pub fn put(
        &self,
        user_id: UserId,
        include_expired: bool,
        sessions: Vec<TestAttemptSession>,
        now: DateTime<Utc>,
    ) {
        if self.ttl <= Duration::zero() {
            return;
        }
        self.entries().insert(
            (user_id, include_expired),
            CachedList {
                fetched_at: now,
                sessions,
            },
        );
    }

    pub fn invalidate_user(&self, user_id: UserId) {
        self.entries().retain(|(user, _), _| *user != user_id);
    }

    pub fn invalidate_all(&self) {
        self.entries().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use exam_core::model::{AttemptId, QuestionId, TestId};
    use exam_core::time::fixed_now;

    fn attempt(user: u64) -> TestAttemptSession {
        TestAttemptSession::start(
            AttemptId::random(),
            TestId::new(1),
            UserId::new(user),
            vec![QuestionId::new(1)],
            60,
            fixed_now(),
        )
        .unwrap()
    }

    #[test]
    fn entries_expire_after_ttl() {
        let now = fixed_now();
        let cache = SessionListCache::new(Duration::seconds(60));
        cache.put(UserId::new(1), false, vec![attempt(1)], now);

        assert_eq!(
            cache
                .get(UserId::new(1), false, now + Duration::seconds(59))
                .map(|list| list.len()),
            Some(1)
        );
        assert!(cache.get(UserId::new(1), true, now).is_none());
        assert!(
            cache
                .get(UserId::new(1), false, now + Duration::seconds(60))
                .is_none()
        );
    }

    #[test]
    fn invalidation_is_scoped_to_user() {
        let now = fixed_now();
        let cache = SessionListCache::new(Duration::seconds(60));
        cache.put(UserId::new(1), false, vec![attempt(1)], now);
        cache.put(UserId::new(1), true, vec![attempt(1)], now);
        cache.put(UserId::new(2), false, vec![attempt(2)], now);

        cache.invalidate_user(UserId::new(1));
        assert!(cache.get(UserId::new(1), false, now).is_none());
        assert!(cache.get(UserId::new(1), true, now).is_none());
        assert!(cache.get(UserId::new(2), false, now).is_some());

        cache.invalidate_all();
        assert!(cache.get(UserId::new(2), false, now).is_none());
    }

    #[test]
    fn zero_ttl_never_caches() {
        let cache = SessionListCache::new(Duration::zero());
        cache.put(UserId::new(1), false, vec![attempt(1)], fixed_now());
        assert!(cache.get(UserId::new(1), false, fixed_now()).is_none());
    }
}
