//! Indexer boundary: anything that can turn a path into an [`IndexBatch`].
//!
//! Parsing itself happens outside this crate. The adapters here read IR
//! produced elsewhere (a JSON dump, an in-memory batch) or choose between
//! two indexers the way the hybrid strategy does.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};

use super::{IndexBatch, Reference, Symbol};

#[derive(Debug, thiserror::Error)]
pub enum IndexerError {
    #[error("Indexer unavailable: {0}")]
    Unavailable(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid IR document {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Which extractor produced a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IndexerKind {
    TreeSitter,
    Scip,
    Hybrid,
    JsonIr,
    Static,
}

impl fmt::Display for IndexerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            IndexerKind::TreeSitter => "tree-sitter",
            IndexerKind::Scip => "scip",
            IndexerKind::Hybrid => "hybrid",
            IndexerKind::JsonIr => "json-ir",
            IndexerKind::Static => "static",
        };
        f.write_str(name)
    }
}

/// A source of IR batches.
pub trait Indexer: Send + Sync {
    fn kind(&self) -> IndexerKind;

    /// Whether the indexer can run in this environment.
    fn available(&self) -> bool;

    fn version(&self) -> String;

    /// Produce the batch for `path` (a repository root or a single file).
    fn index(&self, path: &Path) -> Result<IndexBatch, IndexerError>;
}

/// On-disk IR document written by an external extractor.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IrDocument {
    #[serde(default)]
    generator: Option<String>,
    #[serde(default)]
    files: Vec<String>,
    #[serde(default)]
    symbols: Vec<Symbol>,
    #[serde(default)]
    references: Vec<Reference>,
}

/// Reads IR from a JSON document and serves the slice under each requested path.
///
/// The document is re-read on every call so a watch-triggered job always
/// sees what the extractor wrote last.
pub struct JsonIrIndexer {
    source: PathBuf,
}

impl JsonIrIndexer {
    pub fn new(source: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
        }
    }

    fn load(&self) -> Result<IrDocument, IndexerError> {
        let raw = fs::read_to_string(&self.source)?;
        serde_json::from_str(&raw).map_err(|source| IndexerError::Parse {
            path: self.source.clone(),
            source,
        })
    }
}

impl Indexer for JsonIrIndexer {
    fn kind(&self) -> IndexerKind {
        IndexerKind::JsonIr
    }

    fn available(&self) -> bool {
        self.source.is_file()
    }

    fn version(&self) -> String {
        self.load()
            .ok()
            .and_then(|doc| doc.generator)
            .unwrap_or_else(|| "unknown".to_string())
    }

    fn index(&self, path: &Path) -> Result<IndexBatch, IndexerError> {
        if !self.available() {
            return Err(IndexerError::Unavailable(format!(
                "IR document not found: {}",
                self.source.display()
            )));
        }
        let doc = self.load()?;
        let full = IndexBatch {
            indexer: IndexerKind::JsonIr,
            indexer_version: doc.generator.unwrap_or_else(|| "unknown".to_string()),
            files: doc.files,
            symbols: doc.symbols,
            references: doc.references,
        };
        let batch = full.scoped_to(path);
        debug!(
            path = %path.display(),
            symbols = batch.symbols.len(),
            references = batch.references.len(),
            "loaded IR slice"
        );
        Ok(batch)
    }
}

/// Serves a batch held in memory. Useful for embedding and tests.
pub struct StaticIndexer {
    batch: RwLock<IndexBatch>,
}

impl StaticIndexer {
    pub fn new(batch: IndexBatch) -> Self {
        Self {
            batch: RwLock::new(batch),
        }
    }

    /// Replace the served batch (simulates the extractor seeing new source).
    pub fn set_batch(&self, batch: IndexBatch) {
        let mut guard = self.batch.write().unwrap_or_else(|e| e.into_inner());
        *guard = batch;
    }
}

impl Indexer for StaticIndexer {
    fn kind(&self) -> IndexerKind {
        IndexerKind::Static
    }

    fn available(&self) -> bool {
        true
    }

    fn version(&self) -> String {
        env!("CARGO_PKG_VERSION").to_string()
    }

    fn index(&self, path: &Path) -> Result<IndexBatch, IndexerError> {
        let guard = self.batch.read().unwrap_or_else(|e| e.into_inner());
        let mut batch = guard.scoped_to(path);
        batch.indexer = IndexerKind::Static;
        Ok(batch)
    }
}

/// Uses the preferred indexer when it is available and succeeds, otherwise
/// falls back. The returned batch is tagged with the indexer that produced it.
pub struct HybridIndexer {
    preferred: Arc<dyn Indexer>,
    fallback: Arc<dyn Indexer>,
}

impl HybridIndexer {
    pub fn new(preferred: Arc<dyn Indexer>, fallback: Arc<dyn Indexer>) -> Self {
        Self {
            preferred,
            fallback,
        }
    }
}

impl Indexer for HybridIndexer {
    fn kind(&self) -> IndexerKind {
        IndexerKind::Hybrid
    }

    fn available(&self) -> bool {
        self.preferred.available() || self.fallback.available()
    }

    fn version(&self) -> String {
        let versions: Vec<String> = [&self.preferred, &self.fallback]
            .iter()
            .filter(|i| i.available())
            .map(|i| format!("{}: {}", i.kind(), i.version()))
            .collect();
        if versions.is_empty() {
            "unknown".to_string()
        } else {
            versions.join(" | ")
        }
    }

    fn index(&self, path: &Path) -> Result<IndexBatch, IndexerError> {
        if self.preferred.available() {
            match self.preferred.index(path) {
                Ok(batch) => {
                    info!(indexer = %self.preferred.kind(), symbols = batch.symbols.len(), "hybrid indexer used preferred");
                    return Ok(batch);
                }
                Err(e) => {
                    warn!(indexer = %self.preferred.kind(), error = %e, "preferred indexer failed, falling back");
                }
            }
        } else {
            debug!(indexer = %self.preferred.kind(), "preferred indexer unavailable");
        }
        self.fallback.index(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::NodeKind;
    use tempfile::tempdir;

    struct Broken;

    impl Indexer for Broken {
        fn kind(&self) -> IndexerKind {
            IndexerKind::Scip
        }
        fn available(&self) -> bool {
            true
        }
        fn version(&self) -> String {
            "0.3.0".to_string()
        }
        fn index(&self, _path: &Path) -> Result<IndexBatch, IndexerError> {
            Err(IndexerError::Unavailable("scip-python crashed".to_string()))
        }
    }

    fn sample_batch() -> IndexBatch {
        let mut batch = IndexBatch::new(IndexerKind::Static);
        batch
            .symbols
            .push(Symbol::new(NodeKind::Function, "main", "/repo/main.py", 1, 10));
        batch
    }

    #[test]
    fn test_json_ir_indexer_reads_document() {
        let dir = tempdir().unwrap();
        let ir_path = dir.path().join("ir.json");
        fs::write(
            &ir_path,
            r#"{"generator": "extractor 1.2", "symbols": [
                {"kind": "Class", "qualifiedName": "app.User", "name": "User",
                 "filePath": "/repo/app.py", "startLine": 1, "endLine": 30},
                {"kind": "Function", "qualifiedName": "lib.util", "name": "util",
                 "filePath": "/other/lib.py", "startLine": 1, "endLine": 3}
            ]}"#,
        )
        .unwrap();

        let indexer = JsonIrIndexer::new(&ir_path);
        assert!(indexer.available());
        assert_eq!(indexer.version(), "extractor 1.2");

        let batch = indexer.index(Path::new("/repo")).unwrap();
        assert_eq!(batch.indexer, IndexerKind::JsonIr);
        assert_eq!(batch.symbols.len(), 1);
        assert_eq!(batch.symbols[0].name, "User");
    }

    #[test]
    fn test_json_ir_indexer_missing_document() {
        let indexer = JsonIrIndexer::new("/nonexistent/ir.json");
        assert!(!indexer.available());
        assert!(matches!(
            indexer.index(Path::new("/repo")),
            Err(IndexerError::Unavailable(_))
        ));
    }

    #[test]
    fn test_hybrid_falls_back_on_failure() {
        let hybrid = HybridIndexer::new(
            Arc::new(Broken),
            Arc::new(StaticIndexer::new(sample_batch())),
        );
        let batch = hybrid.index(Path::new("/repo")).unwrap();
        assert_eq!(batch.indexer, IndexerKind::Static);
        assert_eq!(batch.symbols.len(), 1);
        assert!(hybrid.version().contains("scip: 0.3.0"));
    }
}
