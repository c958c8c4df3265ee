/// Properties every graph backend must share.
///
/// Each test runs against the embedded graph and against SQLite on disk,
/// so the builder, traversal and bundle layers are checked over both the
/// generic and the typed-sequence edge strategies.
use cgc::backend::{
    DistinctQuery, EdgeFilter, EdgeProps, Field, GraphBackend, MemoryBackend, NodeId, NodeProps,
    SqliteBackend,
};
use cgc::builder::{CancelFlag, GraphBuilder};
use cgc::bundle::{export_bundle, import_bundle, ExportOptions, ImportOptions};
use cgc::ir::{
    EdgeKind, IdentityKey, IndexBatch, IndexerKind, NodeKind, Reference, StaticIndexer, Symbol,
};
use cgc::{CgcConfig, CodeGraph, RetryPolicy};
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::{tempdir, TempDir};

/// Both backends, keeping the SQLite directory alive for the test.
fn backends() -> (TempDir, Vec<(&'static str, Arc<dyn GraphBackend>)>) {
    let dir = tempdir().unwrap();
    let sqlite =
        SqliteBackend::open(&dir.path().join("graph.db"), 4, Duration::from_secs(5)).unwrap();
    (
        dir,
        vec![
            ("memory", Arc::new(MemoryBackend::new())),
            ("sqlite", Arc::new(sqlite)),
        ],
    )
}

fn node_props(name: &str, scope: &str) -> NodeProps {
    NodeProps {
        name: name.to_string(),
        start_line: 1,
        end_line: 1,
        decorators: BTreeSet::new(),
        is_dependency: false,
        scope: scope.to_string(),
        extra: BTreeMap::new(),
    }
}

fn edge_props(scope: &str) -> EdgeProps {
    EdgeProps {
        line_number: Some(1),
        scope: scope.to_string(),
        extra: BTreeMap::new(),
    }
}

fn all_keys(backend: &dyn GraphBackend) -> BTreeSet<IdentityKey> {
    backend
        .scan_nodes(None, None, usize::MAX >> 1)
        .unwrap()
        .into_iter()
        .map(|n| n.key)
        .collect()
}

fn all_edges(backend: &dyn GraphBackend) -> BTreeSet<(IdentityKey, EdgeKind, IdentityKey)> {
    backend
        .scan_edges(&EdgeFilter::all(), None, usize::MAX >> 1)
        .unwrap()
        .into_iter()
        .map(|e| (e.from, e.kind, e.to))
        .collect()
}

/// A small repository: three files, a class hierarchy, calls across files.
fn repo_batch() -> IndexBatch {
    let mut batch = IndexBatch::new(IndexerKind::Static);
    let a_file = Symbol::new(NodeKind::File, "a.py", "/repo/a.py", 1, 30);
    let main = Symbol::new(NodeKind::Function, "a.main", "/repo/a.py", 1, 10);
    let b_file = Symbol::new(NodeKind::File, "b.py", "/repo/b.py", 1, 40);
    let base = Symbol::new(NodeKind::Class, "b.Base", "/repo/b.py", 1, 15);
    let worker = Symbol::new(NodeKind::Class, "b.Worker", "/repo/b.py", 17, 40);
    let run = Symbol::new(NodeKind::Function, "b.Worker.run", "/repo/b.py", 20, 30);
    let c_file = Symbol::new(NodeKind::File, "c.py", "/repo/c.py", 1, 5);
    let helper = Symbol::new(NodeKind::Function, "c.helper", "/repo/c.py", 1, 5);

    batch.references = vec![
        Reference::new(EdgeKind::Contains, a_file.key(), main.key(), 1),
        Reference::new(EdgeKind::Contains, b_file.key(), base.key(), 1),
        Reference::new(EdgeKind::Contains, b_file.key(), worker.key(), 17),
        Reference::new(EdgeKind::Contains, worker.key(), run.key(), 20),
        Reference::new(EdgeKind::Contains, c_file.key(), helper.key(), 1),
        Reference::new(EdgeKind::Inherits, worker.key(), base.key(), 17),
        Reference::new(EdgeKind::Imports, a_file.key(), b_file.key(), 1),
        Reference::new(EdgeKind::Calls, main.key(), run.key(), 5),
        Reference::new(EdgeKind::Calls, run.key(), helper.key(), 25),
        Reference::new(EdgeKind::Calls, main.key(), worker.key(), 4),
    ];
    batch.symbols = vec![a_file, main, b_file, base, worker, run, c_file, helper];
    batch
}

#[test]
fn test_main_calls_run_scenario() {
    let (_dir, backends) = backends();
    for (name, backend) in backends {
        let mut batch = IndexBatch::new(IndexerKind::Static);
        let main = Symbol::new(NodeKind::Function, "main", "/proj/main.py", 1, 10);
        let run = Symbol::new(NodeKind::Function, "run", "/proj/main.py", 12, 20);
        batch
            .references
            .push(Reference::new(EdgeKind::Calls, main.key(), run.key(), 5));
        batch.symbols = vec![main.clone(), run.clone()];

        let builder = GraphBuilder::new(backend.clone(), RetryPolicy::none());
        let scope = Path::new("/proj");
        builder.apply_batch(scope, &batch, &CancelFlag::new()).unwrap();

        let reached = backend
            .traverse_paths(&main.key(), EdgeKind::Calls, 1, 1)
            .unwrap();
        let names: Vec<&str> = reached.iter().map(|e| e.key.qualified_name.as_str()).collect();
        assert_eq!(names, vec!["run"], "{}", name);

        builder.apply_batch(scope, &batch, &CancelFlag::new()).unwrap();
        let stats = backend.stats(None).unwrap();
        assert_eq!(stats.total_nodes(), 2, "{}", name);
        assert_eq!(stats.total_edges(), 1, "{}", name);
    }
}

#[test]
fn test_reindex_is_idempotent() {
    let (_dir, backends) = backends();
    let batch = repo_batch();
    for (name, backend) in backends {
        let builder = GraphBuilder::new(backend.clone(), RetryPolicy::none());
        let first = builder
            .apply_batch(Path::new("/repo"), &batch, &CancelFlag::new())
            .unwrap();
        assert_eq!(first.files_indexed, 3, "{}", name);
        assert_eq!(first.edges_created, 10, "{}", name);

        let stats = backend.stats(None).unwrap();
        let keys = all_keys(backend.as_ref());
        let edges = all_edges(backend.as_ref());

        let second = builder
            .apply_batch(Path::new("/repo"), &batch, &CancelFlag::new())
            .unwrap();
        assert_eq!(second.edges_created, 10, "{}: edges are re-merged after discard", name);
        assert_eq!(backend.stats(None).unwrap(), stats, "{}", name);
        assert_eq!(all_keys(backend.as_ref()), keys, "{}", name);
        assert_eq!(all_edges(backend.as_ref()), edges, "{}", name);
    }
}

#[test]
fn test_edges_between_every_kind_pair() {
    let kinds = [NodeKind::File, NodeKind::Function, NodeKind::Class];
    let (_dir, backends) = backends();
    for (name, backend) in backends {
        let key = |kind: NodeKind, side: &str| {
            IdentityKey::new(kind, format!("{}_{}", kind.as_str().to_lowercase(), side), "/p/x.py")
        };
        for kind in kinds {
            for side in ["src", "dst"] {
                backend
                    .upsert_node(&key(kind, side), &node_props(side, "/p"))
                    .unwrap();
            }
        }

        let mut expected = BTreeSet::new();
        for from_kind in kinds {
            for to_kind in kinds {
                for edge in EdgeKind::ALL {
                    let (from, to) = (key(from_kind, "src"), key(to_kind, "dst"));
                    let merge = backend
                        .merge_typed_edge(&from, &to, edge, &edge_props("/p"))
                        .unwrap();
                    assert!(merge.created && merge.matched, "{} {}->{} {}", name, from_kind, to_kind, edge);
                    let again = backend
                        .merge_typed_edge(&from, &to, edge, &edge_props("/p"))
                        .unwrap();
                    assert!(!again.created && again.matched, "{} duplicate {}", name, edge);
                    expected.insert((from, edge, to));
                }
            }
        }
        assert_eq!(all_edges(backend.as_ref()), expected, "{}", name);

        // A kind mismatch on an endpoint finds nothing to connect.
        let wrong = IdentityKey::new(NodeKind::Class, "function_dst", "/p/x.py");
        let miss = backend
            .merge_typed_edge(&key(NodeKind::File, "src"), &wrong, EdgeKind::Calls, &edge_props("/p"))
            .unwrap();
        assert!(!miss.matched, "{}", name);
    }
}

#[test]
fn test_single_file_reindex_keeps_other_ids() {
    let (_dir, backends) = backends();
    let batch = repo_batch();
    for (name, backend) in backends {
        let builder = GraphBuilder::new(backend.clone(), RetryPolicy::none());
        let scope = Path::new("/repo");
        builder.apply_batch(scope, &batch, &CancelFlag::new()).unwrap();

        let ids = |file: &str| -> BTreeMap<IdentityKey, NodeId> {
            backend
                .scan_nodes(Some("/repo"), None, 1000)
                .unwrap()
                .into_iter()
                .filter(|n| n.key.file_path != file)
                .map(|n| (n.key, n.id))
                .collect()
        };
        let before = ids("/repo/b.py");
        let edges_before = all_edges(backend.as_ref());

        let report = builder
            .apply_batch(scope, &batch.scoped_to(Path::new("/repo/b.py")), &CancelFlag::new())
            .unwrap();
        assert_eq!(report.files_indexed, 1, "{}", name);
        // a.py holds Imports, Calls x2 into b.py
        assert_eq!(report.repaired_edges, 3, "{}", name);

        assert_eq!(ids("/repo/b.py"), before, "{}", name);
        assert_eq!(all_edges(backend.as_ref()), edges_before, "{}", name);
    }
}

#[test]
fn test_bundle_round_trip_between_backends() {
    let dir = tempdir().unwrap();
    let (_db_dir, backends) = backends();
    let batch = repo_batch();
    let (memory, sqlite) = (backends[0].1.clone(), backends[1].1.clone());

    for (source, dest) in [(&memory, &sqlite), (&sqlite, &memory)] {
        source.clear().unwrap();
        GraphBuilder::new(source.clone(), RetryPolicy::none())
            .apply_batch(Path::new("/repo"), &batch, &CancelFlag::new())
            .unwrap();

        let path = dir.path().join(format!("{}.cgc", source.dialect()));
        let exported = export_bundle(source.as_ref(), &path, &ExportOptions::default()).unwrap();
        let options = ImportOptions {
            clear: true,
            batch_size: 3,
            ..ImportOptions::default()
        };
        let imported = import_bundle(dest.as_ref(), &path, &options).unwrap();

        assert_eq!(imported.nodes_imported, exported.stats.total_nodes());
        assert_eq!(imported.edges_imported, exported.stats.total_edges());
        assert!(imported.warnings.is_empty(), "{:?}", imported.warnings);
        assert_eq!(all_keys(dest.as_ref()), all_keys(source.as_ref()));
        assert_eq!(all_edges(dest.as_ref()), all_edges(source.as_ref()));
    }
}

/// Deterministic pseudo-random call graph with cycles and self-loops.
fn call_graph(backend: &dyn GraphBackend, nodes: usize, edges: usize) -> Vec<IdentityKey> {
    let keys: Vec<IdentityKey> = (0..nodes)
        .map(|i| IdentityKey::new(NodeKind::Function, format!("f{:02}", i), "/g/calls.py"))
        .collect();
    for key in &keys {
        backend
            .upsert_node(key, &node_props(&key.qualified_name, "/g"))
            .unwrap();
    }
    let mut state: u64 = 0x2545_f491_4f6c_dd1d;
    let mut next = |bound: usize| {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        (state % bound as u64) as usize
    };
    for _ in 0..edges {
        let (a, b) = (next(nodes), next(nodes));
        backend
            .merge_typed_edge(&keys[a], &keys[b], EdgeKind::Calls, &edge_props("/g"))
            .unwrap();
    }
    keys
}

/// Shortest hop count from `anchor` to every other node within `max` hops.
fn bfs(
    edges: &BTreeSet<(IdentityKey, EdgeKind, IdentityKey)>,
    anchor: &IdentityKey,
    max: usize,
) -> BTreeMap<IdentityKey, usize> {
    let mut out: HashMap<&IdentityKey, Vec<&IdentityKey>> = HashMap::new();
    for (from, _, to) in edges {
        out.entry(from).or_default().push(to);
    }
    let mut depth: BTreeMap<IdentityKey, usize> = BTreeMap::new();
    let mut queue = VecDeque::from([(anchor, 0usize)]);
    let mut seen = BTreeSet::from([anchor]);
    while let Some((node, d)) = queue.pop_front() {
        if d == max {
            continue;
        }
        for &next in out.get(node).into_iter().flatten() {
            if seen.insert(next) {
                depth.insert(next.clone(), d + 1);
                queue.push_back((next, d + 1));
            }
        }
    }
    depth
}

#[test]
fn test_traversal_matches_breadth_first_search() {
    let (_dir, backends) = backends();
    for (name, backend) in backends {
        let keys = call_graph(backend.as_ref(), 24, 50);
        let edges = all_edges(backend.as_ref());
        for anchor in keys.iter().step_by(5) {
            for max in 1..=5 {
                let expected = bfs(&edges, anchor, max);
                let actual: BTreeMap<IdentityKey, usize> = backend
                    .traverse_paths(anchor, EdgeKind::Calls, 1, max)
                    .unwrap()
                    .into_iter()
                    .map(|e| (e.key, e.depth))
                    .collect();
                assert_eq!(actual, expected, "{} from {} depth {}", name, anchor, max);
            }
        }
    }
}

#[test]
fn test_same_name_function_and_class_stay_distinct() {
    let (_dir, backends) = backends();
    for (name, backend) in backends {
        let func = Symbol::new(NodeKind::Function, "Widget", "/p/x.py", 1, 3);
        let class = Symbol::new(NodeKind::Class, "Widget", "/p/x.py", 5, 9);
        let mut batch = IndexBatch::new(IndexerKind::Static);
        batch
            .references
            .push(Reference::new(EdgeKind::Calls, func.key(), class.key(), 2));
        batch.symbols = vec![func.clone(), class.clone()];

        GraphBuilder::new(backend.clone(), RetryPolicy::none())
            .apply_batch(Path::new("/p"), &batch, &CancelFlag::new())
            .unwrap();
        assert_eq!(all_keys(backend.as_ref()).len(), 2, "{}", name);
        assert_eq!(
            all_edges(backend.as_ref()),
            BTreeSet::from([(func.key(), EdgeKind::Calls, class.key())]),
            "{}",
            name
        );
    }
}

#[test]
fn test_file_reindex_stays_in_owning_root() {
    let (_dir, backends) = backends();
    for (name, backend) in backends {
        let graph = CodeGraph::with_backend(CgcConfig::default(), backend.clone());
        let indexer = StaticIndexer::new(repo_batch());
        graph.index(Path::new("/repo"), &indexer).unwrap();
        let stats = graph.stats(Some(Path::new("/repo"))).unwrap();
        let edges = all_edges(backend.as_ref());

        let report = graph.index(Path::new("/repo/b.py"), &indexer).unwrap();
        assert_eq!(report.files_indexed, 1, "{}", name);
        assert_eq!(report.skipped_references, 0, "{}", name);
        assert_eq!(graph.stats(Some(Path::new("/repo"))).unwrap(), stats, "{}", name);
        assert_eq!(all_edges(backend.as_ref()), edges, "{}", name);
        let file_scope = graph.stats(Some(Path::new("/repo/b.py"))).unwrap();
        assert_eq!(file_scope.total_nodes(), 0, "{}", name);
    }
}

#[test]
fn test_keyword_aliases_agree_across_backends() {
    let (_dir, backends) = backends();
    let mut results = Vec::new();
    for (name, backend) in backends {
        GraphBuilder::new(backend.clone(), RetryPolicy::none())
            .apply_batch(Path::new("/repo"), &repo_batch(), &CancelFlag::new())
            .unwrap();
        let query = DistinctQuery::builder()
            .select(Field::Name, "order")
            .select(Field::FilePath, "group")
            .order_by("order")
            .descending()
            .limit(3)
            .build()
            .unwrap();
        let rows = backend.query_ordered_distinct(&query).unwrap();
        let rows: Vec<(serde_json::Value, serde_json::Value)> = rows
            .iter()
            .map(|r| (r["order"].clone(), r["group"].clone()))
            .collect();
        assert_eq!(rows.len(), 3, "{}", name);
        results.push(rows);
    }
    assert_eq!(results[0], results[1]);
    assert_eq!(
        results[0],
        vec![
            (json!("run"), json!("/repo/b.py")),
            (json!("py"), json!("/repo/a.py")),
            (json!("py"), json!("/repo/b.py")),
        ]
    );

    let clash = DistinctQuery::builder()
        .select(Field::Name, "name")
        .select(Field::QualifiedName, "NAME")
        .build();
    assert!(clash.is_err());
}
