//
//  bundle.rs
//  CodeGraphContext
//
//  Bundle commands: export, import, inspect
//

use anyhow::Result;
use std::path::Path;

use super::graph::print_stats;
use crate::CodeGraph;

pub fn export(graph: &CodeGraph, out: &Path, scope: Option<&Path>) -> Result<()> {
    let report = graph.export(out, scope)?;
    println!(
        "✓ Exported {} nodes, {} edges to {}",
        report.stats.total_nodes(),
        report.stats.total_edges(),
        report.path.display()
    );
    if let Some(commit) = &report.metadata.source_version {
        println!("  source version {}", commit);
    }
    Ok(())
}

pub fn import(graph: &CodeGraph, bundle: &Path, clear: bool) -> Result<()> {
    let report = graph.import(bundle, clear)?;
    for warning in &report.warnings {
        println!("! {}", warning);
    }
    println!(
        "✓ Imported {} nodes, {} edges ({} edges skipped)",
        report.nodes_imported, report.edges_imported, report.edges_skipped
    );
    Ok(())
}

pub fn inspect(bundle: &Path) -> Result<()> {
    let summary = crate::bundle::inspect(bundle)?;
    let meta = &summary.metadata;
    println!("Bundle {}", bundle.display());
    println!("─────────────────");
    println!("Format:   {}", meta.format_version);
    println!("Exported: {}", meta.exported_at.to_rfc3339());
    println!("Scope:    {}", meta.scope_ref.as_deref().unwrap_or("(whole graph)"));
    if let Some(version) = &meta.source_version {
        println!("Source:   {}", version);
    }
    if let Some(warning) = crate::bundle::check_format_version(&meta.format_version)? {
        println!("! {}", warning);
    }
    print_stats(&summary.stats);
    Ok(())
}
