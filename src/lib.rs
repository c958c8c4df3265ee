//! # CodeGraphContext
//!
//! Code knowledge graph over interchangeable graph stores.
//!
//! Indexers turn source trees into an intermediate representation of
//! symbols and references. The [`builder`] writes that IR into a graph
//! through the [`backend`] abstraction, which hides the differences
//! between stores (one generic edge statement versus a sequence of typed
//! ones). On top sit background [`jobs`], file [`watch`]ing, and portable
//! [`bundle`]s that move a graph between backend instances.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use cgc::{CgcConfig, CodeGraph};
//! use cgc::ir::JsonIrIndexer;
//! use std::path::Path;
//!
//! let graph = CodeGraph::open(CgcConfig::default(), Path::new(".")).unwrap();
//! let indexer = JsonIrIndexer::new("ir.json");
//! let report = graph.index(Path::new("/repo"), &indexer).unwrap();
//! println!("{} files indexed", report.files_indexed);
//! ```

pub mod backend;
pub mod builder;
pub mod bundle;
pub mod cli;
pub mod config;
pub mod error;
pub mod ir;
pub mod jobs;
pub mod watch;

pub use backend::{GraphBackend, GraphStats, RetryPolicy};
pub use builder::{BuildReport, CancelFlag, GraphBuilder};
pub use config::CgcConfig;
pub use error::{CgcError, Result};
pub use ir::{EdgeKind, IdentityKey, IndexBatch, NodeKind};
pub use jobs::{JobId, JobManager, JobState};
pub use watch::WatchService;

use std::path::Path;
use std::sync::Arc;

use backend::{DeleteReport, MemoryBackend, PathEndpoint, Record};
use bundle::{ExportOptions, ExportReport, ImportOptions, ImportReport};
use ir::{path_string, Indexer};

/// An open graph and the services built over it.
pub struct CodeGraph {
    config: CgcConfig,
    backend: Arc<dyn GraphBackend>,
    builder: Arc<GraphBuilder>,
}

impl CodeGraph {
    /// Open the backend `config` selects. Relative paths resolve against `base`.
    pub fn open(config: CgcConfig, base: &Path) -> Result<Self> {
        let backend = backend::open_backend(&config.backend, base)?;
        Ok(Self::with_backend(config, backend))
    }

    /// Load `cgc.toml` (defaults if absent) and open its backend.
    pub fn from_config_file(path: &Path) -> Result<Self> {
        let config = CgcConfig::load(path);
        Self::open(config, &CgcConfig::base_dir(path))
    }

    /// A throwaway graph on the embedded backend.
    pub fn in_memory() -> Self {
        let mut config = CgcConfig::default();
        config.backend = config::BackendConfig::memory();
        Self::with_backend(config, Arc::new(MemoryBackend::new()))
    }

    pub fn with_backend(config: CgcConfig, backend: Arc<dyn GraphBackend>) -> Self {
        let builder = Arc::new(GraphBuilder::new(backend.clone(), config.retry));
        Self {
            config,
            backend,
            builder,
        }
    }

    pub fn config(&self) -> &CgcConfig {
        &self.config
    }

    pub fn backend(&self) -> &Arc<dyn GraphBackend> {
        &self.backend
    }

    pub fn builder(&self) -> &Arc<GraphBuilder> {
        &self.builder
    }

    /// Index `path` in the foreground. A path inside an indexed root is
    /// written under that root; anything else becomes its own scope.
    pub fn index(&self, path: &Path, indexer: &dyn Indexer) -> Result<BuildReport> {
        let scope = self.builder.owning_scope(path)?;
        let batch = indexer.index(path)?;
        Ok(self.builder.apply_batch(&scope, &batch, &CancelFlag::new())?)
    }

    /// Background job manager bound to the current tokio runtime.
    pub fn jobs(&self, indexer: Arc<dyn Indexer>) -> Result<JobManager> {
        let jobs = JobManager::new(self.builder.clone(), indexer, self.config.jobs.workers)?;
        jobs.set_history(self.config.jobs.history);
        Ok(jobs)
    }

    pub fn watcher(&self, jobs: JobManager) -> WatchService {
        WatchService::new(jobs, self.config.watch.debounce())
    }

    pub fn export(&self, out: &Path, scope: Option<&Path>) -> Result<ExportReport> {
        let options = ExportOptions {
            scope: scope.map(Path::to_path_buf),
            batch_size: self.config.bundle.batch_size,
            retry: self.config.retry,
            cancel: CancelFlag::new(),
        };
        Ok(bundle::export_bundle(self.backend.as_ref(), out, &options)?)
    }

    pub fn import(&self, bundle: &Path, clear: bool) -> Result<ImportReport> {
        let options = ImportOptions {
            clear,
            batch_size: self.config.bundle.batch_size,
            retry: self.config.retry,
            cancel: CancelFlag::new(),
        };
        Ok(bundle::import_bundle(self.backend.as_ref(), bundle, &options)?)
    }

    pub fn traverse(
        &self,
        anchor: &IdentityKey,
        kind: EdgeKind,
        min_depth: usize,
        max_depth: usize,
    ) -> Result<Vec<PathEndpoint>> {
        Ok(self
            .backend
            .traverse_paths(anchor, kind, min_depth, max_depth)?)
    }

    /// Read-only query text in the backend's native language.
    pub fn query(&self, text: &str) -> Result<Vec<Record>> {
        Ok(self.backend.run_read_query(text)?)
    }

    pub fn delete_scope(&self, scope: &Path) -> Result<DeleteReport> {
        Ok(self.builder.delete_scope(scope)?)
    }

    pub fn clean(&self) -> Result<usize> {
        Ok(self.builder.clean()?)
    }

    pub fn stats(&self, scope: Option<&Path>) -> Result<GraphStats> {
        let scope = scope.map(path_string);
        Ok(self.backend.stats(scope.as_deref())?)
    }

    pub fn close(&self) -> Result<()> {
        Ok(self.backend.close()?)
    }
}
