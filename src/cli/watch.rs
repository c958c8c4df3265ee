//
//  watch.rs
//  CodeGraphContext
//
//  Watch command: keep roots indexed until Ctrl+C
//

use anyhow::Result;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::ir::JsonIrIndexer;
use crate::CodeGraph;

pub async fn watch(graph: &CodeGraph, roots: &[PathBuf], ir: &Path) -> Result<()> {
    let jobs = graph.jobs(Arc::new(JsonIrIndexer::new(ir)))?;
    let service = graph.watcher(jobs.clone());

    for root in roots {
        let root = service.watch(root)?;
        // Bring the root up to date before reacting to changes.
        let id = jobs.submit(&root)?;
        let record = jobs.wait(id).await?;
        println!(
            "Watching {} ({} files indexed, {})",
            root.display(),
            record.files_indexed,
            record.state
        );
    }

    println!("Watching (Ctrl+C to stop)...");
    tokio::signal::ctrl_c().await?;

    for watched in service.list_watched() {
        service.unwatch(&watched.root)?;
    }
    for record in jobs.jobs() {
        if !record.state.is_terminal() {
            jobs.wait(record.id).await?;
        }
    }
    println!("Stopped.");
    Ok(())
}
