//! Job manager: asynchronous indexing jobs with scoped mutual exclusion.
//!
//! At most one pending or running job exists per path, and one per scope:
//! a submission whose scope matches an in-flight job, or whose path lies
//! above or below an in-flight job's path, is rejected and names the job
//! already holding it. Jobs run on the blocking pool, bounded by a worker
//! semaphore.

mod types;

pub use types::{FailureReason, JobId, JobRecord, JobState};

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::runtime::Handle;
use tokio::sync::{watch, Semaphore};
use tracing::{debug, info, warn};

use crate::builder::{BuildError, BuildReport, CancelFlag, GraphBuilder};
use crate::ir::{Indexer, IndexerError, IndexerKind};

/// Finished records kept when no limit is configured.
pub const DEFAULT_HISTORY: usize = 256;

#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Indexing already in progress for {path} (job {existing})")]
    AlreadyInProgress { path: PathBuf, existing: JobId },

    #[error("Job not found: {0}")]
    NotFound(JobId),

    #[error("Job {id} already {state}")]
    Terminal { id: JobId, state: JobState },

    #[error("Could not resolve the scope of {path}: {source}")]
    Scope {
        path: PathBuf,
        #[source]
        source: BuildError,
    },

    #[error("No async runtime available: {0}")]
    Runtime(String),
}

struct JobEntry {
    record: JobRecord,
    cancel: CancelFlag,
    done: watch::Sender<JobRecord>,
}

struct Registry {
    jobs: HashMap<JobId, JobEntry>,
    /// path -> job currently pending or running for it
    active: HashMap<PathBuf, JobId>,
    history: usize,
}

impl Registry {
    fn new(history: usize) -> Self {
        Self {
            jobs: HashMap::new(),
            active: HashMap::new(),
            history,
        }
    }

    /// In-flight job that a new job for `path` under `scope` would race.
    fn conflicting(&self, scope: &Path, path: &Path) -> Option<JobId> {
        if let Some(&id) = self.active.get(path) {
            return Some(id);
        }
        self.active.iter().find_map(|(active_path, id)| {
            let entry = self.jobs.get(id)?;
            let overlaps = active_path.starts_with(path) || path.starts_with(active_path);
            (overlaps || entry.record.scope == scope).then_some(*id)
        })
    }

    /// Move a job to `next`, releasing its path if the state is terminal.
    fn transition(&mut self, id: JobId, next: JobState, apply: impl FnOnce(&mut JobRecord)) -> bool {
        let Some(entry) = self.jobs.get_mut(&id) else {
            return false;
        };
        if !entry.record.state.can_transition_to(next) {
            return false;
        }
        entry.record.state = next;
        apply(&mut entry.record);
        if next.is_terminal() {
            entry.record.finished_at = Some(chrono::Utc::now());
            if self.active.get(&entry.record.path) == Some(&id) {
                self.active.remove(&entry.record.path);
            }
        }
        entry.done.send_replace(entry.record.clone());
        info!(job_id = %id, state = %next, path = %entry.record.path.display(), "job transition");
        if next.is_terminal() {
            self.evict_finished();
        }
        true
    }

    /// Drop the oldest finished records beyond the history limit.
    fn evict_finished(&mut self) {
        let mut finished: Vec<(JobId, Option<chrono::DateTime<chrono::Utc>>)> = self
            .jobs
            .iter()
            .filter(|(_, e)| e.record.state.is_terminal())
            .map(|(id, e)| (*id, e.record.finished_at))
            .collect();
        if finished.len() <= self.history {
            return;
        }
        finished.sort_by_key(|(_, at)| *at);
        let excess = finished.len() - self.history;
        for (id, _) in finished.into_iter().take(excess) {
            self.jobs.remove(&id);
            debug!(job_id = %id, "finished job evicted");
        }
    }
}

enum JobOutcome {
    Completed {
        indexer: IndexerKind,
        version: String,
        report: BuildReport,
    },
    IndexFailed(IndexerError),
    BuildFailed {
        indexer: IndexerKind,
        version: String,
        error: BuildError,
    },
}

struct Inner {
    runtime: Handle,
    builder: Arc<GraphBuilder>,
    indexer: Arc<dyn Indexer>,
    permits: Arc<Semaphore>,
    registry: Mutex<Registry>,
}

impl Inner {
    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn run(self: Arc<Self>, id: JobId) {
        let Ok(_permit) = self.permits.clone().acquire_owned().await else {
            self.registry().transition(id, JobState::Failed, |r| {
                r.failure = Some(FailureReason::Error("worker pool closed".to_string()));
            });
            return;
        };

        let (scope, path, cancel) = {
            let mut registry = self.registry();
            let Some(entry) = registry.jobs.get(&id) else {
                return;
            };
            // Cancelled while pending; already failed.
            if entry.record.state != JobState::Pending {
                return;
            }
            let job = (
                entry.record.scope.clone(),
                entry.record.path.clone(),
                entry.cancel.clone(),
            );
            registry.transition(id, JobState::Running, |r| {
                r.started_at = Some(chrono::Utc::now());
            });
            job
        };

        let indexer = self.indexer.clone();
        let builder = self.builder.clone();
        let joined = tokio::task::spawn_blocking(move || {
            let batch = match indexer.index(&path) {
                Ok(batch) => batch,
                Err(e) => return JobOutcome::IndexFailed(e),
            };
            let (kind, version) = (batch.indexer, batch.indexer_version.clone());
            match builder.apply_batch(&scope, &batch, &cancel) {
                Ok(report) => JobOutcome::Completed {
                    indexer: kind,
                    version,
                    report,
                },
                Err(error) => JobOutcome::BuildFailed {
                    indexer: kind,
                    version,
                    error,
                },
            }
        })
        .await;

        let mut registry = self.registry();
        match joined {
            Ok(JobOutcome::Completed {
                indexer,
                version,
                report,
            }) => {
                registry.transition(id, JobState::Completed, |r| {
                    r.files_indexed = report.files_indexed;
                    r.indexer = Some(indexer);
                    r.indexer_version = Some(version);
                    r.report = Some(report);
                });
            }
            Ok(JobOutcome::IndexFailed(e)) => {
                warn!(job_id = %id, error = %e, "indexer failed");
                registry.transition(id, JobState::Failed, |r| {
                    r.failure = Some(FailureReason::Error(e.to_string()));
                });
            }
            Ok(JobOutcome::BuildFailed {
                indexer,
                version,
                error,
            }) => {
                let reason = match &error {
                    BuildError::Cancelled { .. } => FailureReason::Cancelled,
                    other => {
                        warn!(job_id = %id, error = %other, "graph build failed");
                        FailureReason::Error(other.to_string())
                    }
                };
                registry.transition(id, JobState::Failed, |r| {
                    r.files_indexed = error.files_indexed();
                    r.indexer = Some(indexer);
                    r.indexer_version = Some(version);
                    r.failure = Some(reason);
                });
            }
            Err(e) => {
                warn!(job_id = %id, error = %e, "indexing worker aborted");
                registry.transition(id, JobState::Failed, |r| {
                    r.failure = Some(FailureReason::Error(format!("worker aborted: {}", e)));
                });
            }
        }
    }
}

/// Cheap to clone; clones share the same jobs.
#[derive(Clone)]
pub struct JobManager {
    inner: Arc<Inner>,
}

impl JobManager {
    /// Create a manager bound to the current tokio runtime.
    pub fn new(
        builder: Arc<GraphBuilder>,
        indexer: Arc<dyn Indexer>,
        workers: usize,
    ) -> Result<Self, JobError> {
        let runtime = Handle::try_current().map_err(|e| JobError::Runtime(e.to_string()))?;
        Ok(Self::with_handle(runtime, builder, indexer, workers))
    }

    pub fn with_handle(
        runtime: Handle,
        builder: Arc<GraphBuilder>,
        indexer: Arc<dyn Indexer>,
        workers: usize,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                runtime,
                builder,
                indexer,
                permits: Arc::new(Semaphore::new(workers.max(1))),
                registry: Mutex::new(Registry::new(DEFAULT_HISTORY)),
            }),
        }
    }

    pub fn builder(&self) -> &Arc<GraphBuilder> {
        &self.inner.builder
    }

    /// Keep at most `limit` finished job records.
    pub fn set_history(&self, limit: usize) {
        let mut registry = self.inner.registry();
        registry.history = limit;
        registry.evict_finished();
    }

    pub fn runtime(&self) -> &Handle {
        &self.inner.runtime
    }

    /// Index `path` under the indexed root that owns it, or as its own
    /// scope when nothing indexed contains it.
    pub fn submit(&self, path: &Path) -> Result<JobId, JobError> {
        let scope = self
            .inner
            .builder
            .owning_scope(path)
            .map_err(|source| JobError::Scope {
                path: path.to_path_buf(),
                source,
            })?;
        self.submit_scoped(&scope, path)
    }

    /// Index `path` (usually one file) and write the results under `scope`.
    pub fn submit_scoped(&self, scope: &Path, path: &Path) -> Result<JobId, JobError> {
        let id = {
            let mut registry = self.inner.registry();
            if let Some(existing) = registry.conflicting(scope, path) {
                return Err(JobError::AlreadyInProgress {
                    path: path.to_path_buf(),
                    existing,
                });
            }
            let id = JobId::new();
            let record = JobRecord::pending(id, scope.to_path_buf(), path.to_path_buf());
            let (done, _) = watch::channel(record.clone());
            registry.jobs.insert(
                id,
                JobEntry {
                    record,
                    cancel: CancelFlag::new(),
                    done,
                },
            );
            registry.active.insert(path.to_path_buf(), id);
            id
        };
        info!(job_id = %id, path = %path.display(), scope = %scope.display(), "job submitted");
        self.inner.runtime.spawn(self.inner.clone().run(id));
        Ok(id)
    }

    pub fn status(&self, id: JobId) -> Option<JobRecord> {
        self.inner
            .registry()
            .jobs
            .get(&id)
            .map(|e| e.record.clone())
    }

    /// Every job this manager has seen, oldest first.
    pub fn jobs(&self) -> Vec<JobRecord> {
        let mut jobs: Vec<JobRecord> = self
            .inner
            .registry()
            .jobs
            .values()
            .map(|e| e.record.clone())
            .collect();
        jobs.sort_by_key(|r| r.created_at);
        jobs
    }

    /// Request cancellation. A pending job fails at once; a running job
    /// stops at the next file boundary.
    pub fn cancel(&self, id: JobId) -> Result<(), JobError> {
        let mut registry = self.inner.registry();
        let entry = registry.jobs.get(&id).ok_or(JobError::NotFound(id))?;
        let state = entry.record.state;
        if state.is_terminal() {
            return Err(JobError::Terminal { id, state });
        }
        entry.cancel.cancel();
        if state == JobState::Pending {
            registry.transition(id, JobState::Failed, |r| {
                r.failure = Some(FailureReason::Cancelled);
            });
        }
        info!(job_id = %id, "cancellation requested");
        Ok(())
    }

    /// Wait for a job to finish and return its final record.
    pub async fn wait(&self, id: JobId) -> Result<JobRecord, JobError> {
        let mut rx = {
            let registry = self.inner.registry();
            let entry = registry.jobs.get(&id).ok_or(JobError::NotFound(id))?;
            entry.done.subscribe()
        };
        // The final record travels on the channel, so eviction cannot lose it.
        let _ = rx.wait_for(|record| record.state.is_terminal()).await;
        let record = rx.borrow().clone();
        Ok(record)
    }

    /// Job pending or running for exactly `path`, if any.
    pub fn active_job(&self, path: &Path) -> Option<JobId> {
        self.inner.registry().active.get(path).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{GraphBackend, MemoryBackend, RetryPolicy};
    use crate::ir::{IndexBatch, NodeKind, StaticIndexer, Symbol};
    use std::thread;
    use std::time::Duration;

    struct SlowIndexer {
        inner: StaticIndexer,
        delay: Duration,
    }

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
            thread::sleep(self.delay);
            self.inner.index(path)
        }
    }

    struct FailingIndexer;

    impl Indexer for FailingIndexer {
        fn kind(&self) -> IndexerKind {
            IndexerKind::Scip
        }
        fn available(&self) -> bool {
            true
        }
        fn version(&self) -> String {
            "0".to_string()
        }
        fn index(&self, _path: &Path) -> Result<IndexBatch, IndexerError> {
            Err(IndexerError::Unavailable("no toolchain".to_string()))
        }
    }

    fn batch() -> IndexBatch {
        let mut batch = IndexBatch::new(IndexerKind::Static);
        batch.symbols = vec![
            Symbol::new(NodeKind::Function, "main", "/repo/main.py", 1, 5),
            Symbol::new(NodeKind::Function, "lib.run", "/other/lib.py", 1, 5),
        ];
        batch
    }

    fn manager(indexer: Arc<dyn Indexer>, workers: usize) -> (JobManager, Arc<dyn GraphBackend>) {
        let backend: Arc<dyn GraphBackend> = Arc::new(MemoryBackend::new());
        let builder = Arc::new(GraphBuilder::new(backend.clone(), RetryPolicy::none()));
        (JobManager::new(builder, indexer, workers).unwrap(), backend)
    }

    fn slow(ms: u64) -> Arc<dyn Indexer> {
        Arc::new(SlowIndexer {
            inner: StaticIndexer::new(batch()),
            delay: Duration::from_millis(ms),
        })
    }

    #[test]
    fn test_state_machine() {
        assert!(JobState::Pending.can_transition_to(JobState::Running));
        assert!(JobState::Pending.can_transition_to(JobState::Failed));
        assert!(!JobState::Pending.can_transition_to(JobState::Completed));
        assert!(!JobState::Completed.can_transition_to(JobState::Running));
        assert!(!JobState::Failed.can_transition_to(JobState::Failed));
    }

    #[tokio::test]
    async fn test_job_completes_with_report() {
        let (jobs, backend) = manager(slow(0), 2);
        let id = jobs.submit(Path::new("/repo")).unwrap();
        let record = jobs.wait(id).await.unwrap();
        assert_eq!(record.state, JobState::Completed);
        assert_eq!(record.files_indexed, 1);
        assert_eq!(record.indexer, Some(IndexerKind::Static));
        assert!(record.started_at.is_some() && record.finished_at.is_some());
        assert_eq!(backend.stats(None).unwrap().total_nodes(), 1);
        assert_eq!(jobs.active_job(Path::new("/repo")), None);
    }

    #[tokio::test]
    async fn test_second_submit_rejected_while_active() {
        let (jobs, _) = manager(slow(100), 2);
        let first = jobs.submit(Path::new("/repo")).unwrap();
        match jobs.submit(Path::new("/repo")) {
            Err(JobError::AlreadyInProgress { existing, .. }) => assert_eq!(existing, first),
            other => panic!("expected rejection, got {:?}", other.map(|id| id.to_string())),
        }
        // A different path is independent.
        let other = jobs.submit(Path::new("/other")).unwrap();
        jobs.wait(first).await.unwrap();
        jobs.wait(other).await.unwrap();
        assert!(jobs.submit(Path::new("/repo")).is_ok());
    }

    #[tokio::test]
    async fn test_cancel_pending_job() {
        let (jobs, _) = manager(slow(100), 1);
        let first = jobs.submit(Path::new("/repo")).unwrap();
        let second = jobs.submit(Path::new("/other")).unwrap();
        jobs.cancel(second).unwrap();

        let record = jobs.wait(second).await.unwrap();
        assert_eq!(record.state, JobState::Failed);
        assert_eq!(record.failure, Some(FailureReason::Cancelled));
        assert_eq!(jobs.wait(first).await.unwrap().state, JobState::Completed);
        assert!(matches!(jobs.cancel(first), Err(JobError::Terminal { .. })));
        assert_eq!(jobs.jobs().len(), 2);
    }

    #[tokio::test]
    async fn test_overlapping_paths_and_shared_scope_conflict() {
        let (jobs, _) = manager(slow(100), 4);
        let root = jobs.submit(Path::new("/repo")).unwrap();
        assert!(matches!(
            jobs.submit(Path::new("/repo/main.py")),
            Err(JobError::AlreadyInProgress { existing, .. }) if existing == root
        ));
        assert!(matches!(
            jobs.submit_scoped(Path::new("/repo"), Path::new("/vendored/lib.py")),
            Err(JobError::AlreadyInProgress { existing, .. }) if existing == root
        ));
        // Shares a string prefix only.
        let sibling = jobs.submit(Path::new("/repository")).unwrap();
        jobs.wait(root).await.unwrap();
        jobs.wait(sibling).await.unwrap();
        assert!(jobs.submit(Path::new("/repo/main.py")).is_ok());
    }

    #[tokio::test]
    async fn test_file_job_runs_under_owning_root() {
        let (jobs, _) = manager(slow(0), 2);
        let first = jobs.submit(Path::new("/repo")).unwrap();
        jobs.wait(first).await.unwrap();

        let id = jobs.submit(Path::new("/repo/main.py")).unwrap();
        let record = jobs.wait(id).await.unwrap();
        assert_eq!(record.scope, Path::new("/repo"));
        assert_eq!(record.path, Path::new("/repo/main.py"));
    }

    #[tokio::test]
    async fn test_finished_jobs_evicted_beyond_history() {
        let (jobs, _) = manager(slow(0), 1);
        jobs.set_history(2);
        let mut ids = Vec::new();
        for _ in 0..4 {
            let id = jobs.submit(Path::new("/repo")).unwrap();
            assert_eq!(jobs.wait(id).await.unwrap().state, JobState::Completed);
            ids.push(id);
        }
        assert_eq!(jobs.jobs().len(), 2);
        assert!(jobs.status(ids[0]).is_none());
        assert!(jobs.status(ids[3]).is_some());
    }

    #[tokio::test]
    async fn test_indexer_failure_marks_job_failed() {
        let (jobs, _) = manager(Arc::new(FailingIndexer), 1);
        let id = jobs.submit(Path::new("/repo")).unwrap();
        let record = jobs.wait(id).await.unwrap();
        assert_eq!(record.state, JobState::Failed);
        assert!(matches!(record.failure, Some(FailureReason::Error(_))));
        assert_eq!(record.files_indexed, 0);
    }
}
