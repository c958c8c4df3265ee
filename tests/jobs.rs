/// Job manager behaviour end to end: submission, exclusion, scoping, cancellation.
use cgc::backend::{GraphBackend, MemoryBackend, SqliteBackend};
use cgc::builder::GraphBuilder;
use cgc::ir::{IndexBatch, Indexer, IndexerError, IndexerKind, NodeKind, StaticIndexer, Symbol};
use cgc::jobs::{FailureReason, JobError, JobManager, JobState};
use cgc::RetryPolicy;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Serves a fixed batch after a pause, long enough to overlap submissions.
struct PausingIndexer {
    inner: StaticIndexer,
    pause: Duration,
}

impl Indexer for PausingIndexer {
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
        thread::sleep(self.pause);
        self.inner.index(path)
    }
}

fn batch(files: usize) -> IndexBatch {
    let mut batch = IndexBatch::new(IndexerKind::Static);
    for i in 0..files {
        let file = format!("/svc/m{}.py", i);
        batch
            .symbols
            .push(Symbol::new(NodeKind::Function, format!("m{}.handler", i), &file, 1, 9));
    }
    batch
}

fn manager(backend: Arc<dyn GraphBackend>, pause: Duration) -> JobManager {
    let builder = Arc::new(GraphBuilder::new(backend, RetryPolicy::none()));
    let indexer = Arc::new(PausingIndexer {
        inner: StaticIndexer::new(batch(3)),
        pause,
    });
    JobManager::new(builder, indexer, 2).unwrap()
}

fn sqlite() -> Arc<dyn GraphBackend> {
    Arc::new(SqliteBackend::open_in_memory(1, Duration::from_secs(5)).unwrap())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_one_job_per_path() {
    for backend in [Arc::new(MemoryBackend::new()) as Arc<dyn GraphBackend>, sqlite()] {
        let jobs = manager(backend.clone(), Duration::from_millis(200));
        let first = jobs.submit(Path::new("/svc")).unwrap();
        match jobs.submit(Path::new("/svc")) {
            Err(JobError::AlreadyInProgress { existing, .. }) => assert_eq!(existing, first),
            other => panic!("expected AlreadyInProgress, got {:?}", other.map(|id| id.to_string())),
        }
        // A file under the running root shares its scope.
        assert!(matches!(
            jobs.submit(Path::new("/svc/m0.py")),
            Err(JobError::AlreadyInProgress { existing, .. }) if existing == first
        ));
        // A disjoint root is not blocked.
        let other = jobs.submit(Path::new("/tools")).unwrap();

        let done = jobs.wait(first).await.unwrap();
        assert_eq!(done.state, JobState::Completed);
        assert_eq!(done.files_indexed, 3);
        assert_eq!(done.indexer, Some(IndexerKind::Static));
        jobs.wait(other).await.unwrap();

        // The path is free again once the job is terminal.
        let again = jobs.submit(Path::new("/svc")).unwrap();
        assert_eq!(jobs.wait(again).await.unwrap().state, JobState::Completed);
        assert_eq!(backend.stats(None).unwrap().total_nodes(), 3);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancel_is_not_an_error() {
    let jobs = manager(Arc::new(MemoryBackend::new()), Duration::from_millis(200));
    let id = jobs.submit(Path::new("/svc")).unwrap();
    jobs.cancel(id).unwrap();

    let record = jobs.wait(id).await.unwrap();
    assert_eq!(record.state, JobState::Failed);
    assert_eq!(record.failure, Some(FailureReason::Cancelled));
    assert!(matches!(jobs.cancel(id), Err(JobError::Terminal { .. })));
    assert!(jobs.active_job(Path::new("/svc")).is_none());
}
