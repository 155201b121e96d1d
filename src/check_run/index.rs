use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
    time::{Duration, Instant},
};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::debug;

use crate::{check_run::CheckRunState, events::GithubRepository};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CheckRunKey {
    /// Full name of the repository, e.g. "octocat/hello-world".
    pub repository: String,
    pub head_sha: String,
}

impl CheckRunKey {
    pub fn new(repo: &GithubRepository, head_sha: &str) -> Self {
        Self {
            repository: repo.full_name.clone(),
            head_sha: head_sha.to_owned(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackedCheckRun {
    pub id: i64,
    pub state: CheckRunState,
}

#[derive(Debug)]
struct Entry {
    run: TrackedCheckRun,
    updated_at: Instant,
}

impl Entry {
    // Queued and in progress runs are still driven by this process.
    fn is_expired(&self, now: Instant, retention: Duration) -> bool {
        self.run.state.is_completed() && now.duration_since(self.updated_at) >= retention
    }
}

/// Maps (repository, head SHA) to the check run currently tracked for it.
///
/// Writers for one key are expected to hold [`CheckRunIndex::lock`] across their GitHub calls.
/// `insert` itself is last-write-wins: two deliveries creating check runs for the same commit
/// both succeed and the later one is tracked.
#[derive(Debug)]
pub struct CheckRunIndex {
    entries: Mutex<HashMap<CheckRunKey, Entry>>,
    locks: AsyncMutex<HashMap<CheckRunKey, Arc<AsyncMutex<()>>>>,
    retention: Duration,
}

impl CheckRunIndex {
    /// Completed entries not touched for `retention` are forgotten. Lookups then fall back to GitHub.
    pub fn new(retention: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            locks: AsyncMutex::new(HashMap::new()),
            retention,
        }
    }

    pub async fn lock(&self, key: &CheckRunKey) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            // Nobody else holds or waits for these.
            locks.retain(|k, l| k == key || Arc::strong_count(l) > 1);
            Arc::clone(locks.entry(key.clone()).or_default())
        };
        lock.lock_owned().await
    }

    pub fn get(&self, key: &CheckRunKey) -> Option<TrackedCheckRun> {
        let now = Instant::now();
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries
            .get(key)
            .filter(|e| !e.is_expired(now, self.retention))
            .map(|e| e.run)
    }

    /// Track `run` for `key`, returning the run it replaced.
    pub fn insert(&self, key: CheckRunKey, run: TrackedCheckRun) -> Option<TrackedCheckRun> {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.retain(|_, e| !e.is_expired(now, self.retention));
        let prev = entries.insert(
            key.clone(),
            Entry {
                run,
                updated_at: now,
            },
        );
        let prev = prev.map(|e| e.run);
        if let Some(p) = prev.filter(|p| p.id != run.id) {
            debug!(
                repository = key.repository,
                head_sha = key.head_sha,
                replaced = p.id,
                tracked = run.id,
                "check run index entry replaced"
            );
        }
        prev
    }

    /// Record the new state of `run`, unless another run has been tracked for `key` since.
    pub fn update(&self, key: CheckRunKey, run: TrackedCheckRun) -> bool {
        match self.get(&key) {
            Some(current) if current.id != run.id => {
                debug!(
                    repository = key.repository,
                    head_sha = key.head_sha,
                    tracked = current.id,
                    updated = run.id,
                    "check run is no longer tracked, index left as is"
                );
                false
            }
            Some(_) | None => {
                self.insert(key, run);
                true
            }
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl Default for CheckRunIndex {
    fn default() -> Self {
        Self::new(Duration::from_secs(6 * 60 * 60))
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use tokio::time::timeout;

    use super::*;
    use crate::check_run::Conclusion;

    fn key(sha: &str) -> CheckRunKey {
        CheckRunKey {
            repository: "octocat/hello".to_owned(),
            head_sha: sha.to_owned(),
        }
    }

    fn run(id: i64, state: CheckRunState) -> TrackedCheckRun {
        TrackedCheckRun { id, state }
    }

    #[test]
    fn insert_and_get() {
        let index = CheckRunIndex::default();
        assert_eq!(index.get(&key("a")), None);
        assert_eq!(index.insert(key("a"), run(1, CheckRunState::Queued)), None);
        assert_eq!(index.get(&key("a")), Some(run(1, CheckRunState::Queued)));
        assert_eq!(index.get(&key("b")), None);
    }

    #[test]
    fn last_write_wins() {
        let index = CheckRunIndex::default();
        index.insert(key("a"), run(1, CheckRunState::InProgress));
        let prev = index.insert(key("a"), run(2, CheckRunState::Queued));
        assert_eq!(prev, Some(run(1, CheckRunState::InProgress)));
        assert_eq!(index.get(&key("a")), Some(run(2, CheckRunState::Queued)));
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn update_keeps_newer_run() {
        let index = CheckRunIndex::default();
        index.insert(key("a"), run(1, CheckRunState::InProgress));
        index.insert(key("a"), run(2, CheckRunState::Queued));

        let completed = run(1, CheckRunState::Completed(Conclusion::Success));
        assert!(!index.update(key("a"), completed));
        assert_eq!(index.get(&key("a")), Some(run(2, CheckRunState::Queued)));

        assert!(index.update(key("a"), run(2, CheckRunState::InProgress)));
        assert_eq!(index.get(&key("a")), Some(run(2, CheckRunState::InProgress)));

        assert!(index.update(key("b"), run(3, CheckRunState::InProgress)));
        assert_eq!(index.len(), 2);
    }

    #[test]
    fn keys_are_per_repository() {
        let index = CheckRunIndex::default();
        index.insert(key("a"), run(1, CheckRunState::Queued));
        let other = CheckRunKey {
            repository: "octocat/other".to_owned(),
            head_sha: "a".to_owned(),
        };
        assert_eq!(index.get(&other), None);
    }

    #[test]
    fn old_completed_entries_are_forgotten() {
        let index = CheckRunIndex::new(Duration::ZERO);
        index.insert(
            key("a"),
            run(1, CheckRunState::Completed(Conclusion::Success)),
        );
        assert_eq!(index.get(&key("a")), None);
        index.insert(key("b"), run(2, CheckRunState::Queued));
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn active_entries_outlive_retention() {
        let index = CheckRunIndex::new(Duration::ZERO);
        index.insert(key("a"), run(1, CheckRunState::Queued));
        index.insert(key("b"), run(2, CheckRunState::InProgress));
        index.insert(key("c"), run(3, CheckRunState::Queued));
        assert_eq!(index.len(), 3);
        assert_eq!(index.get(&key("a")), Some(run(1, CheckRunState::Queued)));
        assert_eq!(index.get(&key("b")), Some(run(2, CheckRunState::InProgress)));

        // Gone once completed.
        let completed = run(2, CheckRunState::Completed(Conclusion::Failure));
        assert!(index.update(key("b"), completed));
        assert_eq!(index.get(&key("b")), None);
        index.insert(key("d"), run(4, CheckRunState::Queued));
        assert_eq!(index.len(), 3);
    }

    #[tokio::test]
    async fn lock_serializes_same_key() {
        let index = CheckRunIndex::default();
        let guard = index.lock(&key("a")).await;

        // Other keys are independent.
        let other = timeout(Duration::from_millis(50), index.lock(&key("b"))).await;
        assert!(other.is_ok());

        let same = timeout(Duration::from_millis(50), index.lock(&key("a"))).await;
        assert!(same.is_err());

        drop(guard);
        let same = timeout(Duration::from_millis(50), index.lock(&key("a"))).await;
        assert!(same.is_ok());
    }
}
