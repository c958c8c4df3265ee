//! Embedded in-process backend on a petgraph `StableDiGraph`.
//!
//! Node and edge lookups go through hash indexes, so an edge between any two
//! node types is one generic lookup. Raw query text is not available.

use petgraph::stable_graph::{EdgeIndex, NodeIndex, StableDiGraph};
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::debug;

use super::query::{DistinctQuery, Field, Predicate};
use super::types::*;
use super::{BackendError, Dialect, GraphBackend, Record};
use crate::ir::{EdgeKind, IdentityKey};

#[derive(Debug, Clone)]
struct MemNode {
    id: NodeId,
    key: IdentityKey,
    props: NodeProps,
}

#[derive(Debug, Clone)]
struct MemEdge {
    id: EdgeId,
    kind: EdgeKind,
    props: EdgeProps,
}

#[derive(Default)]
struct MemoryGraph {
    graph: StableDiGraph<MemNode, MemEdge>,
    /// identity key -> node index
    key_index: HashMap<IdentityKey, NodeIndex>,
    /// file path -> nodes owned by the file
    file_index: HashMap<String, HashSet<NodeIndex>>,
    /// (from, to, kind) -> edge index; enforces one edge per triple
    edge_index: HashMap<(NodeIndex, NodeIndex, EdgeKind), EdgeIndex>,
    /// ids in issue order, for cursor scans
    node_ids: BTreeMap<NodeId, NodeIndex>,
    edge_ids: BTreeMap<EdgeId, EdgeIndex>,
    next_node: i64,
    next_edge: i64,
}

impl MemoryGraph {
    // ─── Node Operations ────────────────────────────────────────

    fn upsert(&mut self, key: &IdentityKey, props: &NodeProps) -> NodeId {
        if let Some(&idx) = self.key_index.get(key) {
            if let Some(node) = self.graph.node_weight_mut(idx) {
                node.props = props.clone();
                return node.id;
            }
        }
        self.next_node += 1;
        let id = NodeId(self.next_node);
        let idx = self.graph.add_node(MemNode {
            id,
            key: key.clone(),
            props: props.clone(),
        });
        self.key_index.insert(key.clone(), idx);
        self.file_index
            .entry(key.file_path.clone())
            .or_default()
            .insert(idx);
        self.node_ids.insert(id, idx);
        id
    }

    /// Remove a node and every incident edge, keeping the indexes in step.
    fn remove_node(&mut self, idx: NodeIndex) -> usize {
        let incident: Vec<EdgeIndex> = self
            .graph
            .edges_directed(idx, Direction::Outgoing)
            .chain(self.graph.edges_directed(idx, Direction::Incoming))
            .map(|e| e.id())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        let removed_edges = incident.len();
        for e in incident {
            self.remove_edge(e);
        }
        if let Some(node) = self.graph.remove_node(idx) {
            self.key_index.remove(&node.key);
            self.node_ids.remove(&node.id);
            if let Some(set) = self.file_index.get_mut(&node.key.file_path) {
                set.remove(&idx);
                if set.is_empty() {
                    self.file_index.remove(&node.key.file_path);
                }
            }
        }
        removed_edges
    }

    // ─── Edge Operations ────────────────────────────────────────

    fn remove_edge(&mut self, e: EdgeIndex) {
        if let Some((from, to)) = self.graph.edge_endpoints(e) {
            if let Some(edge) = self.graph.remove_edge(e) {
                self.edge_index.remove(&(from, to, edge.kind));
                self.edge_ids.remove(&edge.id);
            }
        }
    }

    fn merge_edge(
        &mut self,
        from: &IdentityKey,
        to: &IdentityKey,
        kind: EdgeKind,
        props: &EdgeProps,
    ) -> EdgeMerge {
        let (Some(&a), Some(&b)) = (self.key_index.get(from), self.key_index.get(to)) else {
            return EdgeMerge::MISSING_ENDPOINT;
        };
        if self.edge_index.contains_key(&(a, b, kind)) {
            return EdgeMerge {
                created: false,
                matched: true,
            };
        }
        self.next_edge += 1;
        let id = EdgeId(self.next_edge);
        let e = self.graph.add_edge(
            a,
            b,
            MemEdge {
                id,
                kind,
                props: props.clone(),
            },
        );
        self.edge_index.insert((a, b, kind), e);
        self.edge_ids.insert(id, e);
        EdgeMerge {
            created: true,
            matched: true,
        }
    }

    // ─── Internal Helpers ───────────────────────────────────────

    fn node_record(&self, idx: NodeIndex) -> Option<NodeRecord> {
        self.graph.node_weight(idx).map(|n| NodeRecord {
            id: n.id,
            key: n.key.clone(),
            props: n.props.clone(),
        })
    }

    fn edge_record(&self, e: EdgeIndex) -> Option<EdgeRecord> {
        let (a, b) = self.graph.edge_endpoints(e)?;
        let edge = self.graph.edge_weight(e)?;
        Some(EdgeRecord {
            id: edge.id,
            kind: edge.kind,
            from: self.graph.node_weight(a)?.key.clone(),
            to: self.graph.node_weight(b)?.key.clone(),
            props: edge.props.clone(),
        })
    }

    fn remove_nodes(&mut self, nodes: Vec<NodeIndex>) -> DeleteReport {
        let mut report = DeleteReport::default();
        for idx in nodes {
            report.edges += self.remove_node(idx);
            report.nodes += 1;
        }
        report
    }
}

fn field_value(node: &MemNode, field: Field) -> Value {
    match field {
        Field::Kind => Value::from(node.key.kind.as_str()),
        Field::QualifiedName => Value::from(node.key.qualified_name.as_str()),
        Field::Name => Value::from(node.props.name.as_str()),
        Field::FilePath => Value::from(node.key.file_path.as_str()),
        Field::StartLine => Value::from(node.props.start_line),
        Field::EndLine => Value::from(node.props.end_line),
        Field::Scope => Value::from(node.props.scope.as_str()),
        Field::IsDependency => Value::from(node.props.is_dependency),
    }
}

fn matches(node: &MemNode, predicate: &Predicate) -> bool {
    match predicate {
        Predicate::KindIn(kinds) => kinds.contains(&node.key.kind),
        Predicate::Eq(field, expected) => {
            let actual = field_value(node, *field);
            match (&actual, expected) {
                (Value::Bool(b), Value::Number(n)) => n.as_i64() == Some(i64::from(*b)),
                _ => &actual == expected,
            }
        }
        Predicate::PathPrefix(prefix) => node.key.file_path.starts_with(prefix.as_str()),
        Predicate::NameContains(part) => node.props.name.contains(part.as_str()),
    }
}

/// In-process graph store. Nothing survives the process.
pub struct MemoryBackend {
    state: RwLock<MemoryGraph>,
    closed: AtomicBool,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(MemoryGraph::default()),
            closed: AtomicBool::new(false),
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, MemoryGraph>, BackendError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BackendError::Closed);
        }
        Ok(self.state.read().unwrap_or_else(|e| e.into_inner()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, MemoryGraph>, BackendError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BackendError::Closed);
        }
        Ok(self.state.write().unwrap_or_else(|e| e.into_inner()))
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl GraphBackend for MemoryBackend {
    fn dialect(&self) -> Dialect {
        Dialect::Memory
    }

    fn upsert_node(&self, key: &IdentityKey, props: &NodeProps) -> Result<NodeId, BackendError> {
        Ok(self.write()?.upsert(key, props))
    }

    fn merge_typed_edge(
        &self,
        from: &IdentityKey,
        to: &IdentityKey,
        kind: EdgeKind,
        props: &EdgeProps,
    ) -> Result<EdgeMerge, BackendError> {
        Ok(self.write()?.merge_edge(from, to, kind, props))
    }

    fn query_ordered_distinct(&self, query: &DistinctQuery) -> Result<Vec<Record>, BackendError> {
        let state = self.read()?;
        let mut seen = HashSet::new();
        let mut rows = Vec::new();
        for node in state.graph.node_weights() {
            if !query.predicates().iter().all(|p| matches(node, p)) {
                continue;
            }
            let row: Vec<Value> = query
                .projections()
                .iter()
                .map(|p| field_value(node, p.field))
                .collect();
            if seen.insert(Value::Array(row.clone()).to_string()) {
                rows.push(row);
            }
        }
        query.sort_rows(&mut rows);
        let aliases = query.aliases();
        Ok(rows
            .into_iter()
            .map(|row| Record::new(aliases.clone(), row))
            .collect())
    }

    fn traverse_paths(
        &self,
        anchor: &IdentityKey,
        kind: EdgeKind,
        min_depth: usize,
        max_depth: usize,
    ) -> Result<Vec<PathEndpoint>, BackendError> {
        let state = self.read()?;
        let Some(&start) = state.key_index.get(anchor) else {
            return Ok(Vec::new());
        };

        // Enumerate simple paths depth-first; the terminal node is whatever
        // the path ends on, recorded with the shortest depth seen.
        let mut best: HashMap<NodeIndex, usize> = HashMap::new();
        let mut on_path: HashSet<NodeIndex> = HashSet::from([start]);
        let mut stack: Vec<(NodeIndex, Vec<NodeIndex>)> = vec![(start, next_hops(&state, start, kind))];
        if min_depth == 0 {
            best.insert(start, 0);
        }
        while let Some((_, frontier)) = stack.last_mut() {
            let Some(next) = frontier.pop() else {
                if let Some((done, _)) = stack.pop() {
                    on_path.remove(&done);
                }
                continue;
            };
            if on_path.contains(&next) {
                continue;
            }
            let depth = stack.len();
            if depth >= min_depth {
                let entry = best.entry(next).or_insert(depth);
                *entry = (*entry).min(depth);
            }
            if depth < max_depth {
                on_path.insert(next);
                stack.push((next, next_hops(&state, next, kind)));
            }
        }

        let mut endpoints: Vec<PathEndpoint> = best
            .into_iter()
            .filter_map(|(idx, depth)| {
                state.graph.node_weight(idx).map(|n| PathEndpoint {
                    id: n.id,
                    key: n.key.clone(),
                    depth,
                })
            })
            .collect();
        endpoints.sort_by(|a, b| a.depth.cmp(&b.depth).then_with(|| a.key.cmp(&b.key)));
        debug!(anchor = %anchor, endpoints = endpoints.len(), "memory traversal");
        Ok(endpoints)
    }

    fn run_read_query(&self, _query: &str) -> Result<Vec<Record>, BackendError> {
        self.read()?;
        Err(BackendError::Unsupported {
            dialect: Dialect::Memory,
            operation: "run_read_query",
        })
    }

    fn node_id(&self, key: &IdentityKey) -> Result<Option<NodeId>, BackendError> {
        let state = self.read()?;
        Ok(state
            .key_index
            .get(key)
            .and_then(|&idx| state.graph.node_weight(idx))
            .map(|n| n.id))
    }

    fn get_node(&self, key: &IdentityKey) -> Result<Option<NodeRecord>, BackendError> {
        let state = self.read()?;
        Ok(state
            .key_index
            .get(key)
            .and_then(|&idx| state.node_record(idx)))
    }

    fn delete_file(&self, file_path: &str) -> Result<DeleteReport, BackendError> {
        let mut state = self.write()?;
        let nodes: Vec<NodeIndex> = state
            .file_index
            .get(file_path)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();
        Ok(state.remove_nodes(nodes))
    }

    fn delete_scope(&self, scope: &str) -> Result<DeleteReport, BackendError> {
        let mut state = self.write()?;
        let scoped_edges: Vec<EdgeIndex> = state
            .graph
            .edge_indices()
            .filter(|&e| state.graph.edge_weight(e).is_some_and(|w| w.props.scope == scope))
            .collect();
        let mut report = DeleteReport {
            nodes: 0,
            edges: scoped_edges.len(),
        };
        for e in scoped_edges {
            state.remove_edge(e);
        }
        let nodes: Vec<NodeIndex> = state
            .graph
            .node_indices()
            .filter(|&idx| state.graph.node_weight(idx).is_some_and(|n| n.props.scope == scope))
            .collect();
        let removed = state.remove_nodes(nodes);
        report.nodes = removed.nodes;
        report.edges += removed.edges;
        Ok(report)
    }

    fn prune_dangling_edges(&self) -> Result<usize, BackendError> {
        // Removing a node removes its edges, so nothing can dangle here.
        self.read()?;
        Ok(0)
    }

    fn clear(&self) -> Result<(), BackendError> {
        *self.write()? = MemoryGraph::default();
        Ok(())
    }

    fn scan_nodes(
        &self,
        scope: Option<&str>,
        after: Option<NodeId>,
        limit: usize,
    ) -> Result<Vec<NodeRecord>, BackendError> {
        let state = self.read()?;
        let lower = after.map_or(Bound::Unbounded, Bound::Excluded);
        Ok(state
            .node_ids
            .range((lower, Bound::Unbounded))
            .filter_map(|(_, &idx)| state.node_record(idx))
            .filter(|n| scope.map_or(true, |s| n.props.scope == s))
            .take(limit)
            .collect())
    }

    fn scan_edges(
        &self,
        filter: &EdgeFilter,
        after: Option<EdgeId>,
        limit: usize,
    ) -> Result<Vec<EdgeRecord>, BackendError> {
        let state = self.read()?;
        let lower = after.map_or(Bound::Unbounded, Bound::Excluded);
        Ok(state
            .edge_ids
            .range((lower, Bound::Unbounded))
            .filter_map(|(_, &e)| state.edge_record(e))
            .filter(|e| filter.scope.as_deref().map_or(true, |s| e.props.scope == s))
            .filter(|e| {
                filter.incoming_to_file.as_deref().map_or(true, |f| {
                    e.to.file_path == f && e.from.file_path != f
                })
            })
            .take(limit)
            .collect())
    }

    fn stats(&self, scope: Option<&str>) -> Result<GraphStats, BackendError> {
        let state = self.read()?;
        let mut stats = GraphStats::default();
        for node in state.graph.node_weights() {
            if scope.map_or(true, |s| node.props.scope == s) {
                stats.add_node(node.key.kind);
            }
        }
        for edge in state.graph.edge_weights() {
            if scope.map_or(true, |s| edge.props.scope == s) {
                stats.add_edge(edge.kind);
            }
        }
        Ok(stats)
    }

    fn scopes(&self) -> Result<Vec<String>, BackendError> {
        let state = self.read()?;
        let scopes: BTreeSet<&str> = state
            .graph
            .node_weights()
            .map(|n| n.props.scope.as_str())
            .collect();
        Ok(scopes.into_iter().map(String::from).collect())
    }

    fn close(&self) -> Result<(), BackendError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

fn next_hops(state: &MemoryGraph, idx: NodeIndex, kind: EdgeKind) -> Vec<NodeIndex> {
    state
        .graph
        .edges_directed(idx, Direction::Outgoing)
        .filter(|e| e.weight().kind == kind)
        .map(|e| e.target())
        .collect()
}
