//! Backend abstraction layer.
//!
//! Everything above this module talks to a graph store through
//! [`GraphBackend`]. Backends differ in how they create edges between
//! concrete node types and in whether raw query text is available; the
//! trait hides both behind one signature per operation.

pub mod memory;
pub mod query;
pub mod record;
pub mod retry;
pub mod sqlite;
pub mod types;

pub use memory::MemoryBackend;
pub use query::{DistinctQuery, Field, Predicate};
pub use record::Record;
pub use retry::RetryPolicy;
pub use sqlite::SqliteBackend;
pub use types::{
    DeleteReport, EdgeFilter, EdgeId, EdgeMerge, EdgeProps, EdgeRecord, GraphStats, NodeId,
    NodeProps, NodeRecord, PathEndpoint,
};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use tracing::info;

use crate::config::BackendConfig;
use crate::ir::{EdgeKind, IdentityKey};

/// Environment variables consulted (in order) to override the configured backend.
pub const BACKEND_ENV_VARS: [&str; 2] = ["CGC_RUNTIME_DB_TYPE", "DATABASE_TYPE"];

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// Store unreachable, locked or busy. Worth retrying.
    #[error("Backend unavailable: {0}")]
    Transport(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    #[error("{operation} is not supported by the {dialect} backend")]
    Unsupported {
        dialect: Dialect,
        operation: &'static str,
    },

    #[error("Query is not read-only: {0}")]
    ReadOnlyViolation(String),

    #[error("Backend is closed")]
    Closed,

    #[error("Unknown backend: {0}")]
    UnknownDialect(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl BackendError {
    pub fn is_transient(&self) -> bool {
        matches!(self, BackendError::Transport(_))
    }
}

/// Which store a backend talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    Memory,
    Sqlite,
}

/// How a dialect creates an edge between two concrete node types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeStrategy {
    /// One query matches both endpoints whatever their type.
    Polymorphic,
    /// The store needs the end types spelled out; a sequence of
    /// type-specific statements runs until one matches.
    TypedSequence,
}

impl Dialect {
    pub fn as_str(&self) -> &'static str {
        match self {
            Dialect::Memory => "memory",
            Dialect::Sqlite => "sqlite",
        }
    }

    pub fn edge_strategy(&self) -> EdgeStrategy {
        match self {
            Dialect::Memory => EdgeStrategy::Polymorphic,
            Dialect::Sqlite => EdgeStrategy::TypedSequence,
        }
    }

    pub fn supports_raw_queries(&self) -> bool {
        matches!(self, Dialect::Sqlite)
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Dialect {
    type Err = BackendError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" | "inmemory" | "in-memory" => Ok(Dialect::Memory),
            "sqlite" | "sqlite3" => Ok(Dialect::Sqlite),
            other => Err(BackendError::UnknownDialect(other.to_string())),
        }
    }
}

/// A graph store.
///
/// Implementations are synchronous and internally synchronized; callers on
/// an async runtime run them on the blocking pool.
pub trait GraphBackend: Send + Sync {
    fn dialect(&self) -> Dialect;

    /// Create or update the node identified by `key`. Repeated calls with
    /// the same key return the same id.
    fn upsert_node(&self, key: &IdentityKey, props: &NodeProps) -> Result<NodeId, BackendError>;

    /// Ensure at most one `kind` edge from `from` to `to`.
    ///
    /// The end types are the kinds carried by the two keys. A missing
    /// endpoint makes this a no-op reported through [`EdgeMerge::matched`].
    /// When the edge already exists its properties are left untouched.
    fn merge_typed_edge(
        &self,
        from: &IdentityKey,
        to: &IdentityKey,
        kind: EdgeKind,
        props: &EdgeProps,
    ) -> Result<EdgeMerge, BackendError>;

    /// Distinct projected rows, ordered by the query's alias.
    fn query_ordered_distinct(&self, query: &DistinctQuery) -> Result<Vec<Record>, BackendError>;

    /// Endpoints of simple paths of `kind` edges leaving `anchor` whose
    /// length lies in `min_depth..=max_depth`, each with its shortest depth.
    /// Sorted by depth, then key.
    fn traverse_paths(
        &self,
        anchor: &IdentityKey,
        kind: EdgeKind,
        min_depth: usize,
        max_depth: usize,
    ) -> Result<Vec<PathEndpoint>, BackendError>;

    /// Run read-only query text in the store's native language.
    fn run_read_query(&self, query: &str) -> Result<Vec<Record>, BackendError>;

    fn node_id(&self, key: &IdentityKey) -> Result<Option<NodeId>, BackendError>;

    fn get_node(&self, key: &IdentityKey) -> Result<Option<NodeRecord>, BackendError>;

    /// Remove every node owned by `file_path` and the edges touching them.
    fn delete_file(&self, file_path: &str) -> Result<DeleteReport, BackendError>;

    /// Remove every node and edge whose scope is `scope`.
    fn delete_scope(&self, scope: &str) -> Result<DeleteReport, BackendError>;

    /// Drop edges whose endpoints no longer exist. Returns the number removed.
    fn prune_dangling_edges(&self) -> Result<usize, BackendError>;

    /// Remove everything.
    fn clear(&self) -> Result<(), BackendError>;

    /// Nodes ordered by id, strictly after `after`, at most `limit`.
    fn scan_nodes(
        &self,
        scope: Option<&str>,
        after: Option<NodeId>,
        limit: usize,
    ) -> Result<Vec<NodeRecord>, BackendError>;

    /// Edges with both endpoints present, ordered by id, strictly after `after`.
    fn scan_edges(
        &self,
        filter: &EdgeFilter,
        after: Option<EdgeId>,
        limit: usize,
    ) -> Result<Vec<EdgeRecord>, BackendError>;

    fn stats(&self, scope: Option<&str>) -> Result<GraphStats, BackendError>;

    /// Distinct scopes that own at least one node, sorted.
    fn scopes(&self) -> Result<Vec<String>, BackendError>;

    /// Release the store. Later calls fail with [`BackendError::Closed`].
    fn close(&self) -> Result<(), BackendError>;
}

/// Pick the dialect: environment overrides first, then configuration.
pub fn resolve_dialect(config: &BackendConfig) -> Result<Dialect, BackendError> {
    for var in BACKEND_ENV_VARS {
        if let Ok(value) = std::env::var(var) {
            if !value.trim().is_empty() {
                return value.parse();
            }
        }
    }
    config.kind.parse()
}

/// Open the configured backend. Relative database paths resolve against `base`.
pub fn open_backend(
    config: &BackendConfig,
    base: &Path,
) -> Result<Arc<dyn GraphBackend>, BackendError> {
    let dialect = resolve_dialect(config)?;
    info!(dialect = %dialect, "opening graph backend");
    match dialect {
        Dialect::Memory => Ok(Arc::new(MemoryBackend::new())),
        Dialect::Sqlite => {
            let backend = match &config.path {
                Some(path) if path.as_os_str() != ":memory:" => {
                    let path = if path.is_absolute() {
                        path.clone()
                    } else {
                        base.join(path)
                    };
                    SqliteBackend::open(&path, config.pool_size, config.busy_timeout())?
                }
                _ => SqliteBackend::open_in_memory(config.pool_size, config.busy_timeout())?,
            };
            Ok(Arc::new(backend))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dialect_parsing() {
        assert_eq!("SQLite".parse::<Dialect>().unwrap(), Dialect::Sqlite);
        assert_eq!("in-memory".parse::<Dialect>().unwrap(), Dialect::Memory);
        assert!(matches!(
            "neo4j".parse::<Dialect>(),
            Err(BackendError::UnknownDialect(_))
        ));
    }

    #[test]
    fn test_dialect_capabilities() {
        assert_eq!(Dialect::Memory.edge_strategy(), EdgeStrategy::Polymorphic);
        assert_eq!(Dialect::Sqlite.edge_strategy(), EdgeStrategy::TypedSequence);
        assert!(!Dialect::Memory.supports_raw_queries());
    }

    #[test]
    fn test_only_transport_is_transient() {
        assert!(BackendError::Transport("locked".into()).is_transient());
        assert!(!BackendError::Query("bad".into()).is_transient());
        assert!(!BackendError::Closed.is_transient());
    }
}
