//
//  import.rs
//  CodeGraphContext
//

use std::collections::HashMap;
use std::io::BufRead;
use std::path::Path;
use tracing::{debug, info, warn};

use super::archive::{self, BundleReader};
use super::{check_format_version, BundleError, BundleMetadata, EdgeLine, NodeLine};
use crate::backend::{GraphBackend, GraphStats, NodeId, RetryPolicy};
use crate::builder::CancelFlag;
use crate::ir::IdentityKey;

#[derive(Debug, Clone)]
pub struct ImportOptions {
    /// Empty the destination before writing.
    pub clear: bool,
    pub batch_size: usize,
    pub retry: RetryPolicy,
    pub cancel: CancelFlag,
}

impl Default for ImportOptions {
    fn default() -> Self {
        Self {
            clear: false,
            batch_size: 1000,
            retry: RetryPolicy::default(),
            cancel: CancelFlag::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ImportReport {
    pub metadata: Option<BundleMetadata>,
    pub nodes_imported: usize,
    pub edges_imported: usize,
    /// Edges whose endpoints were in neither the bundle nor the destination.
    pub edges_skipped: usize,
    pub warnings: Vec<String>,
}

/// Import state carried across entries. `seen` counts records per kind
/// for the stats check.
struct Importer<'a> {
    backend: &'a dyn GraphBackend,
    options: &'a ImportOptions,
    ids: HashMap<IdentityKey, NodeId>,
    seen: GraphStats,
    report: ImportReport,
}

impl<'a> Importer<'a> {
    fn checkpoint(&self) -> Result<(), BundleError> {
        if self.options.cancel.is_cancelled() {
            return Err(BundleError::Aborted {
                nodes: self.report.nodes_imported,
                edges: self.report.edges_imported,
            });
        }
        Ok(())
    }

    fn metadata(&mut self, metadata: BundleMetadata) -> Result<(), BundleError> {
        if let Some(warning) = check_format_version(&metadata.format_version)? {
            warn!(format = %metadata.format_version, "{}", warning);
            self.report.warnings.push(warning);
        }
        self.report.metadata = Some(metadata);
        Ok(())
    }

    fn nodes(&mut self, reader: &mut dyn BufRead) -> Result<(), BundleError> {
        if self.options.clear {
            self.options.retry.run("clear", || self.backend.clear())?;
            info!("destination cleared");
        }
        let batch_size = self.options.batch_size.max(1);
        let mut batch: Vec<NodeLine> = Vec::with_capacity(batch_size);
        for (number, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let node: NodeLine = parse_line(archive::NODES, number, &line)?;
            node.validate()?;
            batch.push(node);
            if batch.len() == batch_size {
                self.write_nodes(&mut batch)?;
            }
        }
        self.write_nodes(&mut batch)
    }

    fn write_nodes(&mut self, batch: &mut Vec<NodeLine>) -> Result<(), BundleError> {
        if batch.is_empty() {
            return Ok(());
        }
        self.checkpoint()?;
        for node in batch.drain(..) {
            let id = self.options.retry.run("upsert_node", || {
                self.backend.upsert_node(&node.identity_key, &node.properties)
            })?;
            self.seen.add_node(node.kind);
            self.ids.insert(node.identity_key, id);
            self.report.nodes_imported += 1;
        }
        debug!(nodes = self.report.nodes_imported, "imported node batch");
        Ok(())
    }

    fn edges(&mut self, reader: &mut dyn BufRead) -> Result<(), BundleError> {
        let batch_size = self.options.batch_size.max(1);
        let mut batch: Vec<EdgeLine> = Vec::with_capacity(batch_size);
        for (number, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let edge: EdgeLine = parse_line(archive::EDGES, number, &line)?;
            edge.validate()?;
            batch.push(edge);
            if batch.len() == batch_size {
                self.write_edges(&mut batch)?;
            }
        }
        self.write_edges(&mut batch)
    }

    fn resolves(&self, key: &IdentityKey) -> Result<bool, BundleError> {
        if self.ids.contains_key(key) {
            return Ok(true);
        }
        let id = self
            .options
            .retry
            .run("node_id", || self.backend.node_id(key))?;
        Ok(id.is_some())
    }

    fn write_edges(&mut self, batch: &mut Vec<EdgeLine>) -> Result<(), BundleError> {
        if batch.is_empty() {
            return Ok(());
        }
        self.checkpoint()?;
        for edge in batch.drain(..) {
            self.seen.add_edge(edge.edge_kind);
            if !self.resolves(&edge.from_key)? || !self.resolves(&edge.to_key)? {
                debug!(from = %edge.from_key, to = %edge.to_key, "edge endpoint absent, skipped");
                self.report.edges_skipped += 1;
                continue;
            }
            let merge = self.options.retry.run("merge_typed_edge", || {
                self.backend.merge_typed_edge(
                    &edge.from_key,
                    &edge.to_key,
                    edge.edge_kind,
                    &edge.properties,
                )
            })?;
            if merge.matched {
                self.report.edges_imported += 1;
            } else {
                self.report.edges_skipped += 1;
            }
        }
        debug!(edges = self.report.edges_imported, "imported edge batch");
        Ok(())
    }

    fn stats(&mut self, expected: GraphStats) {
        if expected != self.seen {
            let warning = format!(
                "bundle stats list {} nodes and {} edges, records hold {} and {}",
                expected.total_nodes(),
                expected.total_edges(),
                self.seen.total_nodes(),
                self.seen.total_edges()
            );
            warn!("{}", warning);
            self.report.warnings.push(warning);
        }
        if self.report.edges_skipped > 0 {
            self.report.warnings.push(format!(
                "{} edges skipped for missing endpoints",
                self.report.edges_skipped
            ));
        }
    }
}

fn parse_line<T: serde::de::DeserializeOwned>(
    entry: &str,
    number: usize,
    line: &str,
) -> Result<T, BundleError> {
    serde_json::from_str(line)
        .map_err(|e| BundleError::Format(format!("{} line {}: {}", entry, number + 1, e)))
}

/// Load a bundle into `backend`.
///
/// Without `clear` the import merges into what is there: nodes are upserted
/// by identity and edges merged, so importing the same bundle twice changes
/// nothing. An abort between batches keeps what was written so far.
pub fn import_bundle(
    backend: &dyn GraphBackend,
    bundle: &Path,
    options: &ImportOptions,
) -> Result<ImportReport, BundleError> {
    let mut importer = Importer {
        backend,
        options,
        ids: HashMap::new(),
        seen: GraphStats::default(),
        report: ImportReport::default(),
    };
    BundleReader::open(bundle)?.for_each_entry(|name, reader| match name {
        archive::METADATA => {
            let metadata = archive::read_json(name, reader)?;
            importer.metadata(metadata)
        }
        archive::SCHEMA => {
            let _: super::BundleSchema = archive::read_json(name, reader)?;
            Ok(())
        }
        archive::NODES => importer.nodes(reader),
        archive::EDGES => importer.edges(reader),
        archive::STATS => {
            let stats = archive::read_json(name, reader)?;
            importer.stats(stats);
            Ok(())
        }
        other => Err(BundleError::Format(format!("unexpected entry {}", other))),
    })?;

    let report = importer.report;
    info!(
        path = %bundle.display(),
        nodes = report.nodes_imported,
        edges = report.edges_imported,
        skipped = report.edges_skipped,
        "bundle imported"
    );
    Ok(report)
}
