//
//  export.rs
//  CodeGraphContext
//

use chrono::Utc;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::archive::{self, write_archive, EntryBody};
use super::{git_head, BundleError, BundleMetadata, BundleSchema, EdgeLine, NodeLine, FORMAT_VERSION};
use crate::backend::{EdgeFilter, EdgeId, GraphBackend, GraphStats, NodeId, RetryPolicy};
use crate::builder::CancelFlag;
use crate::ir::path_string;

#[derive(Debug, Clone)]
pub struct ExportOptions {
    /// Export only this indexed root; `None` exports everything.
    pub scope: Option<PathBuf>,
    pub batch_size: usize,
    pub retry: RetryPolicy,
    pub cancel: CancelFlag,
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self {
            scope: None,
            batch_size: 1000,
            retry: RetryPolicy::default(),
            cancel: CancelFlag::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExportReport {
    pub path: PathBuf,
    pub metadata: BundleMetadata,
    pub stats: GraphStats,
}

/// Write the graph (or one scope of it) to `out` as a `.cgc` bundle.
///
/// Nodes are read in id order, then edges, each spooled to a temporary
/// file rather than held in memory. An abort between pages leaves no file
/// behind.
pub fn export_bundle(
    backend: &dyn GraphBackend,
    out: &Path,
    options: &ExportOptions,
) -> Result<ExportReport, BundleError> {
    let scope = options.scope.as_deref().map(path_string);
    let batch_size = options.batch_size.max(1);
    let retry = &options.retry;

    let mut schema = BundleSchema::default();
    let mut stats = GraphStats::default();

    let mut nodes = BufWriter::new(tempfile::tempfile()?);
    let mut cursor: Option<NodeId> = None;
    loop {
        if options.cancel.is_cancelled() {
            return Err(aborted(&stats));
        }
        let page = retry.run("scan_nodes", || {
            backend.scan_nodes(scope.as_deref(), cursor, batch_size)
        })?;
        let done = page.len() < batch_size;
        cursor = page.last().map(|n| n.id);
        for node in page {
            let line = NodeLine {
                kind: node.key.kind,
                identity_key: node.key,
                properties: node.props,
            };
            schema.record_node(line.kind, &serde_json::to_value(&line.properties)?);
            stats.add_node(line.kind);
            serde_json::to_writer(&mut nodes, &line)?;
            nodes.write_all(b"\n")?;
        }
        debug!(nodes = stats.total_nodes(), "exported node page");
        if done {
            break;
        }
    }

    let filter = match &scope {
        Some(s) => EdgeFilter::scope(s.clone()),
        None => EdgeFilter::all(),
    };
    let mut edges = BufWriter::new(tempfile::tempfile()?);
    let mut cursor: Option<EdgeId> = None;
    loop {
        if options.cancel.is_cancelled() {
            return Err(aborted(&stats));
        }
        let page = retry.run("scan_edges", || backend.scan_edges(&filter, cursor, batch_size))?;
        let done = page.len() < batch_size;
        cursor = page.last().map(|e| e.id);
        for edge in page {
            let line = EdgeLine {
                from_kind: edge.from.kind,
                from_key: edge.from,
                to_kind: edge.to.kind,
                to_key: edge.to,
                edge_kind: edge.kind,
                properties: edge.props,
            };
            schema.record_edge(line.edge_kind, &serde_json::to_value(&line.properties)?);
            stats.add_edge(line.edge_kind);
            serde_json::to_writer(&mut edges, &line)?;
            edges.write_all(b"\n")?;
        }
        debug!(edges = stats.total_edges(), "exported edge page");
        if done {
            break;
        }
    }

    let metadata = BundleMetadata {
        format_version: FORMAT_VERSION.to_string(),
        exported_at: Utc::now(),
        source_version: options.scope.as_deref().and_then(git_head),
        scope_ref: scope,
        generator: Some(format!("cgc {}", env!("CARGO_PKG_VERSION"))),
    };
    let metadata_json = serde_json::to_vec_pretty(&metadata)?;
    let schema_json = serde_json::to_vec_pretty(&schema)?;
    let stats_json = serde_json::to_vec_pretty(&stats)?;
    let mut nodes = unspool(nodes)?;
    let mut edges = unspool(edges)?;
    write_archive(
        out,
        [
            (archive::METADATA, EntryBody::bytes(&metadata_json)),
            (archive::SCHEMA, EntryBody::bytes(&schema_json)),
            (archive::NODES, EntryBody::spool(&mut nodes)?),
            (archive::EDGES, EntryBody::spool(&mut edges)?),
            (archive::STATS, EntryBody::bytes(&stats_json)),
        ],
    )?;

    info!(
        path = %out.display(),
        scope = metadata.scope_ref.as_deref().unwrap_or("*"),
        nodes = stats.total_nodes(),
        edges = stats.total_edges(),
        "bundle exported"
    );
    Ok(ExportReport {
        path: out.to_path_buf(),
        metadata,
        stats,
    })
}

fn unspool(writer: BufWriter<File>) -> Result<File, BundleError> {
    Ok(writer.into_inner().map_err(std::io::Error::from)?)
}

fn aborted(stats: &GraphStats) -> BundleError {
    BundleError::Aborted {
        nodes: stats.total_nodes(),
        edges: stats.total_edges(),
    }
}
