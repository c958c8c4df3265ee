//
//  graph.rs
//  CodeGraphContext
//
//  Index and read commands: index, traverse, query, stats, delete, clean
//

use anyhow::{anyhow, Result};
use std::path::Path;
use std::sync::Arc;

use crate::backend::{DistinctQuery, Field, Predicate};
use crate::ir::{EdgeKind, IdentityKey, JsonIrIndexer, NodeKind};
use crate::jobs::JobState;
use crate::{CodeGraph, GraphStats};

/// Index `path` as a background job and wait for it.
pub async fn index(graph: &CodeGraph, path: &Path, ir: &Path) -> Result<()> {
    let jobs = graph.jobs(Arc::new(JsonIrIndexer::new(ir)))?;
    let id = jobs.submit(path)?;
    println!("Job {} submitted for {}", id, path.display());

    let record = jobs.wait(id).await?;
    match record.state {
        JobState::Completed => {
            let report = record.report.unwrap_or_default();
            println!(
                "✓ {} files, {} nodes, {} new edges ({} skipped references)",
                report.files_indexed,
                report.nodes_upserted,
                report.edges_created,
                report.skipped_references
            );
            Ok(())
        }
        _ => Err(anyhow!(
            "job {} {} after {} files: {}",
            id,
            record.state,
            record.files_indexed,
            record
                .failure
                .map(|f| f.to_string())
                .unwrap_or_else(|| "unknown".to_string())
        )),
    }
}

pub fn traverse(
    graph: &CodeGraph,
    name: &str,
    file: &str,
    kind: &str,
    edge: &str,
    min: usize,
    max: usize,
) -> Result<()> {
    let kind: NodeKind = kind.parse().map_err(|e: String| anyhow!(e))?;
    let edge: EdgeKind = edge.parse().map_err(|e: String| anyhow!(e))?;
    let anchor = IdentityKey::new(kind, name, file);
    let reached = graph.traverse(&anchor, edge, min, max)?;
    if reached.is_empty() {
        println!("Nothing reachable from {} over {}", anchor, edge);
        return Ok(());
    }
    // Compact format: depth Kind name file
    for endpoint in reached {
        println!(
            "{} {} {} {}",
            endpoint.depth, endpoint.key.kind, endpoint.key.qualified_name, endpoint.key.file_path
        );
    }
    Ok(())
}

/// Distinct symbols whose name contains `text`, ordered by name.
pub fn search(graph: &CodeGraph, text: &str, kind: Option<&str>, limit: usize) -> Result<()> {
    let mut query = DistinctQuery::builder()
        .select(Field::Name, "name")
        .select(Field::Kind, "kind")
        .select(Field::FilePath, "file")
        .select(Field::StartLine, "line")
        .order_by("name")
        .limit(limit);
    if !text.is_empty() {
        query = query.filter(Predicate::NameContains(text.to_string()));
    }
    if let Some(kind) = kind {
        let kind: NodeKind = kind.parse().map_err(|e: String| anyhow!(e))?;
        query = query.filter(Predicate::KindIn(vec![kind]));
    }
    let rows = graph.backend().query_ordered_distinct(&query.build()?)?;
    if rows.is_empty() {
        println!("No results for '{}'", text);
        return Ok(());
    }
    for row in rows {
        println!(
            "{} {} {}:{}",
            row.get_str("name").unwrap_or("?"),
            row.get_str("kind").unwrap_or("?"),
            row.get_str("file").unwrap_or("?"),
            row.get_i64("line").unwrap_or(0)
        );
    }
    Ok(())
}

pub fn raw_query(graph: &CodeGraph, text: &str) -> Result<()> {
    for record in graph.query(text)? {
        println!("{}", serde_json::Value::Object(record.into_map()));
    }
    Ok(())
}

pub fn stats(graph: &CodeGraph, scope: Option<&Path>) -> Result<()> {
    let stats = graph.stats(scope)?;
    println!("Graph Stats ({})", graph.backend().dialect());
    println!("─────────────────");
    print_stats(&stats);
    Ok(())
}

pub(crate) fn print_stats(stats: &GraphStats) {
    println!("Nodes: {}", stats.total_nodes());
    for (kind, count) in &stats.nodes {
        println!("  {:<10} {}", kind.as_str(), count);
    }
    println!("Edges: {}", stats.total_edges());
    for (kind, count) in &stats.edges {
        println!("  {:<10} {}", kind.as_str(), count);
    }
}

pub fn delete(graph: &CodeGraph, scope: &Path) -> Result<()> {
    let report = graph.delete_scope(scope)?;
    println!(
        "✓ Deleted {}: {} nodes, {} edges",
        scope.display(),
        report.nodes,
        report.edges
    );
    Ok(())
}

pub fn clean(graph: &CodeGraph) -> Result<()> {
    let removed = graph.clean()?;
    println!("✓ Removed {} dangling edges", removed);
    Ok(())
}
