//! Graph builder: the only writer of indexed code into a backend.
//!
//! A batch is applied in two passes. The first discards and re-creates the
//! nodes of every covered file; the second merges references once every
//! node in the batch exists. Edges that other files hold into a re-indexed
//! file are captured before the discard and merged back as soon as that
//! file's nodes exist again, so a build that stops early never loses them.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::backend::{
    BackendError, DeleteReport, EdgeFilter, EdgeId, EdgeProps, EdgeRecord, GraphBackend,
    NodeProps, RetryPolicy,
};
use crate::ir::{path_string, IdentityKey, IndexBatch, NodeKind, Reference, Symbol};

/// Edges read per page when capturing edges for repair.
const SCAN_PAGE: usize = 512;

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("Cancelled after {files_indexed} files")]
    Cancelled { files_indexed: usize },

    #[error("Failed after {files_indexed} files: {source}")]
    Failed {
        files_indexed: usize,
        #[source]
        source: BackendError,
    },
}

impl BuildError {
    /// Files fully written before the build stopped.
    pub fn files_indexed(&self) -> usize {
        match self {
            BuildError::Backend(_) => 0,
            BuildError::Cancelled { files_indexed } | BuildError::Failed { files_indexed, .. } => {
                *files_indexed
            }
        }
    }
}

/// Shared cancellation flag, checked between files.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// What one `apply_batch` call did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildReport {
    pub files_indexed: usize,
    /// Covered files with no symbols whose data was discarded.
    pub files_removed: usize,
    pub nodes_upserted: usize,
    pub edges_created: usize,
    /// Merges that found the edge already present.
    pub edges_existing: usize,
    /// References dropped because an endpoint was out of scope or absent.
    pub skipped_references: usize,
    pub repaired_edges: usize,
    /// Captured edges whose target no longer exists after re-indexing.
    pub repairs_dropped: usize,
}

/// Where a reference endpoint was found.
enum Endpoint {
    /// Declared by the batch.
    Batch(IdentityKey),
    /// Inside the scope but not in the batch; may already be in the graph.
    Scope(IdentityKey),
    OutOfScope,
}

/// Symbols a batch declares, by exact key and by name within a file.
struct SymbolTable<'a> {
    keys: HashSet<IdentityKey>,
    kinds: HashMap<(&'a str, &'a str), Vec<NodeKind>>,
}

impl<'a> SymbolTable<'a> {
    fn new(batch: &'a IndexBatch) -> Self {
        let mut table = Self {
            keys: HashSet::new(),
            kinds: HashMap::new(),
        };
        for symbol in &batch.symbols {
            table.keys.insert(symbol.key());
            let kinds = table
                .kinds
                .entry((symbol.qualified_name.as_str(), symbol.file_path.as_str()))
                .or_default();
            if !kinds.contains(&symbol.kind) {
                kinds.push(symbol.kind);
            }
        }
        table
    }

    /// An exact key wins. Otherwise a name declared under exactly one kind
    /// in that file takes the declared kind.
    fn resolve(&self, key: &IdentityKey, scope: &Path) -> Endpoint {
        if self.keys.contains(key) {
            return Endpoint::Batch(key.clone());
        }
        match self
            .kinds
            .get(&(key.qualified_name.as_str(), key.file_path.as_str()))
            .map(Vec::as_slice)
        {
            Some(&[kind]) => Endpoint::Batch(IdentityKey {
                kind,
                ..key.clone()
            }),
            _ if key.is_under(scope) => Endpoint::Scope(key.clone()),
            _ => Endpoint::OutOfScope,
        }
    }
}

pub struct GraphBuilder {
    backend: Arc<dyn GraphBackend>,
    retry: RetryPolicy,
}

impl GraphBuilder {
    pub fn new(backend: Arc<dyn GraphBackend>, retry: RetryPolicy) -> Self {
        Self { backend, retry }
    }

    pub fn backend(&self) -> &Arc<dyn GraphBackend> {
        &self.backend
    }

    /// Write `batch` into the graph under `scope`.
    ///
    /// Re-applying the same batch leaves the graph unchanged. Cancellation is
    /// honoured between files and reports how many files were completed.
    pub fn apply_batch(
        &self,
        scope: &Path,
        batch: &IndexBatch,
        cancel: &CancelFlag,
    ) -> Result<BuildReport, BuildError> {
        let scope_str = path_string(scope);
        let mut report = BuildReport::default();
        let fail = |report: &BuildReport, source: BackendError| BuildError::Failed {
            files_indexed: report.files_indexed,
            source,
        };

        let symbols_by_file = batch.symbols_by_file();
        let references_by_file = batch.references_by_file();
        let covered: HashSet<&str> = symbols_by_file.keys().map(String::as_str).collect();
        let symbol_table = SymbolTable::new(batch);

        // Pass 1: discard and re-create nodes file by file.
        for (file, symbols) in &symbols_by_file {
            if cancel.is_cancelled() {
                return Err(BuildError::Cancelled {
                    files_indexed: report.files_indexed,
                });
            }
            let incoming: Vec<EdgeRecord> = self
                .incoming_edges(file)
                .map_err(|e| fail(&report, e))?
                .into_iter()
                .filter(|e| !covered.contains(e.from.file_path.as_str()))
                .collect();

            let removed = self
                .retry
                .run("delete_file", || self.backend.delete_file(file))
                .map_err(|e| fail(&report, e))?;
            debug!(file = %file, nodes = removed.nodes, edges = removed.edges, "discarded file data");

            if symbols.is_empty() {
                report.files_removed += 1;
            }
            let created = self.create_nodes(symbols, &scope_str, &mut report);
            // Restore even when re-creation stopped part way.
            let restored = self.restore_edges(&incoming, &mut report);
            created.and(restored).map_err(|e| fail(&report, e))?;
        }

        // Pass 2: merge references once every batch node exists.
        let files: BTreeSet<&str> = symbols_by_file
            .keys()
            .chain(references_by_file.keys())
            .map(String::as_str)
            .collect();
        for file in files {
            if cancel.is_cancelled() {
                return Err(BuildError::Cancelled {
                    files_indexed: report.files_indexed,
                });
            }
            for reference in references_by_file.get(file).into_iter().flatten() {
                self.merge_reference(reference, scope, &scope_str, &symbol_table, &mut report)
                    .map_err(|e| fail(&report, e))?;
            }
            if covered.contains(file) {
                report.files_indexed += 1;
            }
        }

        info!(
            scope = %scope_str,
            indexer = %batch.indexer,
            files = report.files_indexed,
            nodes = report.nodes_upserted,
            edges_created = report.edges_created,
            skipped = report.skipped_references,
            repaired = report.repaired_edges,
            "batch applied"
        );
        Ok(report)
    }

    fn create_nodes(
        &self,
        symbols: &[&Symbol],
        scope_str: &str,
        report: &mut BuildReport,
    ) -> Result<(), BackendError> {
        for symbol in symbols {
            let key = symbol.key();
            let props = NodeProps::from_symbol(symbol, scope_str);
            self.retry
                .run("upsert_node", || self.backend.upsert_node(&key, &props))?;
            report.nodes_upserted += 1;
        }
        Ok(())
    }

    /// Merge captured edges back. Every edge is attempted; the first error
    /// is returned after the rest have been tried.
    fn restore_edges(
        &self,
        edges: &[EdgeRecord],
        report: &mut BuildReport,
    ) -> Result<(), BackendError> {
        let mut first_err = None;
        for edge in edges {
            let merge = self.retry.run("merge_typed_edge", || {
                self.backend
                    .merge_typed_edge(&edge.from, &edge.to, edge.kind, &edge.props)
            });
            match merge {
                Ok(merge) if merge.matched => report.repaired_edges += 1,
                Ok(_) => {
                    debug!(from = %edge.from, to = %edge.to, "repair target vanished");
                    report.repairs_dropped += 1;
                }
                Err(e) => {
                    warn!(from = %edge.from, to = %edge.to, error = %e, "edge repair failed");
                    first_err.get_or_insert(e);
                }
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    fn merge_reference(
        &self,
        reference: &Reference,
        scope: &Path,
        scope_str: &str,
        symbol_table: &SymbolTable<'_>,
        report: &mut BuildReport,
    ) -> Result<(), BackendError> {
        let from = symbol_table.resolve(&reference.from_key, scope);
        let to = symbol_table.resolve(&reference.to_key, scope);
        let (from, to) = match (from, to) {
            (Endpoint::Batch(f) | Endpoint::Scope(f), Endpoint::Batch(t) | Endpoint::Scope(t)) => {
                (f, t)
            }
            _ => {
                debug!(
                    kind = %reference.kind,
                    from = %reference.from_key,
                    to = %reference.to_key,
                    "reference leaves scope, skipped"
                );
                report.skipped_references += 1;
                return Ok(());
            }
        };
        let props = EdgeProps {
            line_number: reference.line_number,
            scope: scope_str.to_string(),
            extra: Default::default(),
        };
        let merge = self.retry.run("merge_typed_edge", || {
            self.backend
                .merge_typed_edge(&from, &to, reference.kind, &props)
        })?;
        if merge.created {
            report.edges_created += 1;
        } else if merge.matched {
            report.edges_existing += 1;
        } else {
            debug!(from = %from, to = %to, "reference endpoint not in graph, skipped");
            report.skipped_references += 1;
        }
        Ok(())
    }

    fn incoming_edges(&self, file: &str) -> Result<Vec<EdgeRecord>, BackendError> {
        let filter = EdgeFilter::incoming_to_file(file);
        let mut edges = Vec::new();
        let mut cursor: Option<EdgeId> = None;
        loop {
            let page = self.retry.run("scan_edges", || {
                self.backend.scan_edges(&filter, cursor, SCAN_PAGE)
            })?;
            let done = page.len() < SCAN_PAGE;
            cursor = page.last().map(|e| e.id);
            edges.extend(page);
            if done {
                return Ok(edges);
            }
        }
    }

    /// Indexed root that owns `path`: the deepest existing scope containing
    /// it, or `path` itself when nothing indexed contains it.
    pub fn owning_scope(&self, path: &Path) -> Result<PathBuf, BuildError> {
        let scopes = self.retry.run("scopes", || self.backend.scopes())?;
        let owner = scopes
            .iter()
            .map(Path::new)
            .filter(|scope| path.starts_with(scope))
            .max_by_key(|scope| scope.components().count())
            .map_or_else(|| path.to_path_buf(), Path::to_path_buf);
        Ok(owner)
    }

    /// Drop a single file's nodes and their edges.
    pub fn remove_file(&self, file: &Path) -> Result<DeleteReport, BuildError> {
        let file = path_string(file);
        Ok(self
            .retry
            .run("delete_file", || self.backend.delete_file(&file))?)
    }

    /// Drop everything indexed under `scope`. Edges from other scopes into
    /// it may remain until [`GraphBuilder::clean`] runs.
    pub fn delete_scope(&self, scope: &Path) -> Result<DeleteReport, BuildError> {
        let scope = path_string(scope);
        let report = self
            .retry
            .run("delete_scope", || self.backend.delete_scope(&scope))?;
        info!(scope = %scope, nodes = report.nodes, edges = report.edges, "scope deleted");
        Ok(report)
    }

    /// Dead-reference pass: remove edges whose endpoints are gone.
    pub fn clean(&self) -> Result<usize, BuildError> {
        let removed = self
            .retry
            .run("prune_dangling_edges", || self.backend.prune_dangling_edges())?;
        info!(removed, "dangling edges pruned");
        Ok(removed)
    }
}
