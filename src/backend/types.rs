//
//  types.rs
//  CodeGraphContext
//
//  Graph-resident data shapes shared by every backend.
//

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::ir::{EdgeKind, IdentityKey, NodeKind, Symbol};

/// Backend-assigned node id. Meaningless outside the instance that issued it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub i64);

/// Backend-assigned edge id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EdgeId(pub i64);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

/// Properties stored on a node besides its identity key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeProps {
    pub name: String,
    pub start_line: u32,
    pub end_line: u32,
    #[serde(default)]
    pub decorators: BTreeSet<String>,
    #[serde(default)]
    pub is_dependency: bool,
    /// Indexed root path owning this node.
    pub scope: String,
    /// Properties a backend or bundle carries that the core model does not name.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl NodeProps {
    pub fn from_symbol(symbol: &Symbol, scope: &str) -> Self {
        Self {
            name: symbol.name.clone(),
            start_line: symbol.start_line,
            end_line: symbol.end_line,
            decorators: symbol.decorators.clone(),
            is_dependency: symbol.is_dependency,
            scope: scope.to_string(),
            extra: BTreeMap::new(),
        }
    }
}

/// Properties stored on an edge.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EdgeProps {
    #[serde(default)]
    pub line_number: Option<u32>,
    /// Scope of the source node.
    pub scope: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// A node read back from a backend.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeRecord {
    pub id: NodeId,
    pub key: IdentityKey,
    pub props: NodeProps,
}

/// An edge read back from a backend, endpoints resolved to identity keys.
#[derive(Debug, Clone, PartialEq)]
pub struct EdgeRecord {
    pub id: EdgeId,
    pub kind: EdgeKind,
    pub from: IdentityKey,
    pub to: IdentityKey,
    pub props: EdgeProps,
}

/// Outcome of `merge_typed_edge`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EdgeMerge {
    /// A new edge was written.
    pub created: bool,
    /// Both endpoints exist. `false` means the call was a no-op.
    pub matched: bool,
}

impl EdgeMerge {
    pub const MISSING_ENDPOINT: EdgeMerge = EdgeMerge {
        created: false,
        matched: false,
    };
}

/// One endpoint reached by `traverse_paths`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathEndpoint {
    pub id: NodeId,
    pub key: IdentityKey,
    /// Length of the shortest path that ends here.
    pub depth: usize,
}

/// Which edges a scan returns.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EdgeFilter {
    pub scope: Option<String>,
    /// Only edges whose target lives in this file and whose source does not.
    pub incoming_to_file: Option<String>,
}

impl EdgeFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn scope(scope: impl Into<String>) -> Self {
        Self {
            scope: Some(scope.into()),
            incoming_to_file: None,
        }
    }

    pub fn incoming_to_file(file: impl Into<String>) -> Self {
        Self {
            scope: None,
            incoming_to_file: Some(file.into()),
        }
    }
}

/// What a deletion removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DeleteReport {
    pub nodes: usize,
    pub edges: usize,
}

/// Node and edge counts per kind.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphStats {
    pub nodes: BTreeMap<NodeKind, usize>,
    pub edges: BTreeMap<EdgeKind, usize>,
}

impl GraphStats {
    pub fn total_nodes(&self) -> usize {
        self.nodes.values().sum()
    }

    pub fn total_edges(&self) -> usize {
        self.edges.values().sum()
    }

    pub(crate) fn add_node(&mut self, kind: NodeKind) {
        *self.nodes.entry(kind).or_default() += 1;
    }

    pub(crate) fn add_edge(&mut self, kind: EdgeKind) {
        *self.edges.entry(kind).or_default() += 1;
    }
}
