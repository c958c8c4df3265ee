//! Watch service: debounced file-system events turned into indexing jobs.
//!
//! Each watched root owns one debouncer. A burst of changes to a file inside
//! the debounce window yields one job for that file, written under the
//! root's scope. A change that lands while a job for the same scope is in
//! flight marks the file dirty, and the file is queued again once that job
//! finishes. Unwatching drops the debouncer, discarding pending events.

mod filter;

pub use filter::PathFilter;

use chrono::{DateTime, Utc};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use notify_debouncer_mini::{new_debouncer, DebounceEventResult, Debouncer};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::jobs::{JobError, JobId, JobManager};

#[derive(Debug, thiserror::Error)]
pub enum WatchError {
    #[error("Watcher error: {0}")]
    Notify(#[from] notify::Error),

    #[error("Not a directory: {0}")]
    NotADirectory(PathBuf),

    #[error("Already watching: {0}")]
    AlreadyWatched(PathBuf),

    #[error("Not watching: {0}")]
    NotWatched(PathBuf),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

struct WatchEntry {
    _debouncer: Debouncer<RecommendedWatcher>,
    since: DateTime<Utc>,
}

type Registry = Arc<Mutex<HashMap<PathBuf, WatchEntry>>>;

/// Files waiting for an in-flight job to finish before they are queued.
type DirtySet = Arc<Mutex<HashSet<PathBuf>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// A watched root as reported by [`WatchService::list_watched`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchedRoot {
    pub root: PathBuf,
    pub since: DateTime<Utc>,
}

pub struct WatchService {
    jobs: JobManager,
    debounce: Duration,
    watched: Registry,
}

impl WatchService {
    pub fn new(jobs: JobManager, debounce: Duration) -> Self {
        Self {
            jobs,
            debounce,
            watched: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Start watching `root` recursively. Returns the canonical root.
    pub fn watch(&self, root: &Path) -> Result<PathBuf, WatchError> {
        if !root.is_dir() {
            return Err(WatchError::NotADirectory(root.to_path_buf()));
        }
        let root = root.canonicalize()?;
        if lock(&self.watched).contains_key(&root) {
            return Err(WatchError::AlreadyWatched(root));
        }

        let filter = PathFilter::new(&root);
        let jobs = self.jobs.clone();
        let registry = Arc::clone(&self.watched);
        let scope = root.clone();
        let dirty: DirtySet = Arc::default();
        let mut debouncer = new_debouncer(self.debounce, move |result: DebounceEventResult| {
            let events = match result {
                Ok(events) => events,
                Err(e) => {
                    warn!(root = %scope.display(), error = ?e, "watch error");
                    return;
                }
            };
            // An unwatch may race a debounce that already fired.
            if !lock(&registry).contains_key(&scope) {
                return;
            }
            let changed: BTreeSet<PathBuf> = events
                .into_iter()
                .map(|e| e.path)
                .filter(|p| !p.is_dir() && filter.accepts(p))
                .collect();
            for path in changed {
                match jobs.submit_scoped(&scope, &path) {
                    Ok(id) => debug!(job_id = %id, path = %path.display(), "change queued"),
                    Err(JobError::AlreadyInProgress { existing, .. }) => {
                        if lock(&dirty).insert(path.clone()) {
                            debug!(job_id = %existing, path = %path.display(), "change deferred until job finishes");
                            jobs.runtime().spawn(resubmit_after(
                                jobs.clone(),
                                Arc::clone(&registry),
                                Arc::clone(&dirty),
                                scope.clone(),
                                path,
                                existing,
                            ));
                        }
                    }
                    Err(e) => warn!(path = %path.display(), error = %e, "could not queue change"),
                }
            }
        })?;
        debouncer.watcher().watch(&root, RecursiveMode::Recursive)?;

        let mut watched = lock(&self.watched);
        if watched.contains_key(&root) {
            return Err(WatchError::AlreadyWatched(root));
        }
        watched.insert(
            root.clone(),
            WatchEntry {
                _debouncer: debouncer,
                since: Utc::now(),
            },
        );
        info!(root = %root.display(), debounce_ms = self.debounce.as_millis() as u64, "watching");
        Ok(root)
    }

    /// Stop watching `root`. Pending debounced events are dropped.
    pub fn unwatch(&self, root: &Path) -> Result<(), WatchError> {
        let key = root.canonicalize().unwrap_or_else(|_| root.to_path_buf());
        let entry = lock(&self.watched).remove(&key);
        match entry {
            Some(entry) => {
                drop(entry);
                info!(root = %key.display(), "stopped watching");
                Ok(())
            }
            None => Err(WatchError::NotWatched(key)),
        }
    }

    pub fn list_watched(&self) -> Vec<WatchedRoot> {
        let mut roots: Vec<WatchedRoot> = lock(&self.watched)
            .iter()
            .map(|(root, entry)| WatchedRoot {
                root: root.clone(),
                since: entry.since,
            })
            .collect();
        roots.sort_by(|a, b| a.root.cmp(&b.root));
        roots
    }

    pub fn is_watching(&self, root: &Path) -> bool {
        let key = root.canonicalize().unwrap_or_else(|_| root.to_path_buf());
        lock(&self.watched).contains_key(&key)
    }
}

/// Queue a dirty file once `blocking`, and any job that takes its place,
/// has finished. Gives up if the root is no longer watched.
async fn resubmit_after(
    jobs: JobManager,
    registry: Registry,
    dirty: DirtySet,
    scope: PathBuf,
    path: PathBuf,
    mut blocking: JobId,
) {
    loop {
        let _ = jobs.wait(blocking).await;
        // Cleared before submitting so a later change schedules another pass.
        lock(&dirty).remove(&path);
        if !lock(&registry).contains_key(&scope) {
            return;
        }
        match jobs.submit_scoped(&scope, &path) {
            Ok(id) => {
                debug!(job_id = %id, path = %path.display(), "deferred change queued");
                return;
            }
            Err(JobError::AlreadyInProgress { existing, .. }) => {
                // Another change already owns the retry.
                if !lock(&dirty).insert(path.clone()) {
                    return;
                }
                blocking = existing;
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "could not queue deferred change");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{MemoryBackend, RetryPolicy};
    use crate::builder::GraphBuilder;
    use crate::ir::{IndexBatch, Indexer, IndexerError, IndexerKind, StaticIndexer};
    use crate::jobs::JobState;
    use tempfile::tempdir;

    struct SlowIndexer(Duration);

    impl Indexer for SlowIndexer {
        fn kind(&self) -> IndexerKind {
            IndexerKind::Static
        }
        fn available(&self) -> bool {
            true
        }
        fn version(&self) -> String {
            "test".to_string()
        }
        fn index(&self, path: &Path) -> Result<IndexBatch, IndexerError> {
            std::thread::sleep(self.0);
            StaticIndexer::new(IndexBatch::new(IndexerKind::Static)).index(path)
        }
    }

    fn service_with(indexer: Arc<dyn Indexer>) -> WatchService {
        let builder = Arc::new(GraphBuilder::new(
            Arc::new(MemoryBackend::new()),
            RetryPolicy::none(),
        ));
        let jobs = JobManager::new(builder, indexer, 2).unwrap();
        WatchService::new(jobs, Duration::from_millis(50))
    }

    fn service() -> WatchService {
        service_with(Arc::new(StaticIndexer::new(IndexBatch::new(IndexerKind::Static))))
    }

    #[tokio::test]
    async fn test_watch_registry() {
        let dir = tempdir().unwrap();
        let svc = service();
        let root = svc.watch(dir.path()).unwrap();
        assert!(svc.is_watching(dir.path()));
        assert!(matches!(
            svc.watch(dir.path()),
            Err(WatchError::AlreadyWatched(_))
        ));
        assert_eq!(svc.list_watched()[0].root, root);

        svc.unwatch(dir.path()).unwrap();
        assert!(svc.list_watched().is_empty());
        assert!(matches!(
            svc.unwatch(dir.path()),
            Err(WatchError::NotWatched(_))
        ));
    }

    #[tokio::test]
    async fn test_watch_rejects_file() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("a.py");
        std::fs::write(&file, "x = 1\n").unwrap();
        assert!(matches!(
            service().watch(&file),
            Err(WatchError::NotADirectory(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_change_submits_file_job() {
        let dir = tempdir().unwrap();
        let svc = service();
        let root = svc.watch(dir.path()).unwrap();
        std::fs::write(root.join("main.py"), "def main(): pass\n").unwrap();
        std::fs::create_dir_all(root.join("node_modules")).unwrap();
        std::fs::write(root.join("node_modules").join("dep.js"), "x").unwrap();

        let mut jobs = Vec::new();
        for _ in 0..100 {
            jobs = svc.jobs.jobs();
            if !jobs.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(!jobs.is_empty(), "no job submitted for change");
        assert!(jobs.iter().all(|j| j.scope == root));
        assert!(jobs.iter().all(|j| !j.path.starts_with(root.join("node_modules"))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_change_during_running_job_is_indexed_after_it() {
        let dir = tempdir().unwrap();
        let svc = service_with(Arc::new(SlowIndexer(Duration::from_millis(600))));
        let root = svc.watch(dir.path()).unwrap();
        let file = root.join("main.py");
        std::fs::write(&file, "def main(): pass\n").unwrap();

        let mut running = false;
        for _ in 0..100 {
            running = svc.jobs.jobs().iter().any(|j| j.state == JobState::Running);
            if running {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(running, "first change never started a job");
        std::fs::write(&file, "def main(): return 1\n").unwrap();

        let mut finished = 0;
        for _ in 0..200 {
            let jobs = svc.jobs.jobs();
            finished = jobs
                .iter()
                .filter(|j| j.path == file && j.state == JobState::Completed)
                .count();
            if finished >= 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        assert!(finished >= 2, "second change was never indexed");
    }
}
