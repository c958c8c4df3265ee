//! CLI module for cgc.
//!
//! Commands:
//! - Index: index, watch
//! - Read: traverse, query, stats
//! - Maintenance: delete, clean
//! - Bundles: export, import, inspect

pub mod bundle;
pub mod graph;
pub mod watch;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

use crate::CodeGraph;

#[derive(Parser)]
#[command(name = "cgc")]
#[command(about = "CodeGraphContext - code knowledge graph", long_about = None)]
pub struct Cli {
    /// Configuration file (default: ./cgc.toml)
    #[arg(short, long, default_value = "cgc.toml")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    // ─── Index ────────────────────────────────────────────────────
    /// Index a repository from an IR document
    Index {
        /// Repository root (or a single file inside an indexed root)
        path: PathBuf,

        /// IR document written by an external extractor
        #[arg(long)]
        ir: PathBuf,
    },

    /// Watch repositories and re-index changed files
    Watch {
        /// Repository roots
        #[arg(required = true)]
        paths: Vec<PathBuf>,

        /// IR document, re-read on every change
        #[arg(long)]
        ir: PathBuf,
    },

    // ─── Read ─────────────────────────────────────────────────────
    /// Nodes reachable from a symbol over one edge kind
    Traverse {
        /// Qualified name of the start symbol
        name: String,

        /// File owning the start symbol
        #[arg(short, long)]
        file: String,

        /// Node kind of the start symbol
        #[arg(short, long, default_value = "Function")]
        kind: String,

        /// Edge kind to follow (calls, contains, inherits, imports)
        #[arg(short, long, default_value = "calls")]
        edge: String,

        #[arg(long, default_value = "1")]
        min: usize,

        #[arg(long, default_value = "5")]
        max: usize,
    },

    /// Search symbols, or run raw read-only query text with --raw
    Query {
        /// Substring of the symbol name
        #[arg(default_value = "")]
        text: String,

        /// Restrict to a node kind
        #[arg(short, long)]
        kind: Option<String>,

        /// Treat TEXT as a native read-only query
        #[arg(long)]
        raw: bool,

        #[arg(short, long, default_value = "50")]
        limit: usize,
    },

    /// Show node and edge counts
    Stats {
        /// Only this indexed root
        #[arg(short, long)]
        scope: Option<PathBuf>,
    },

    // ─── Maintenance ──────────────────────────────────────────────
    /// Remove everything indexed under a root
    Delete { scope: PathBuf },

    /// Remove edges whose endpoints no longer exist
    Clean,

    // ─── Bundles ──────────────────────────────────────────────────
    /// Export the graph (or one root) to a .cgc bundle
    Export {
        out: PathBuf,

        #[arg(short, long)]
        scope: Option<PathBuf>,
    },

    /// Import a .cgc bundle
    Import {
        bundle: PathBuf,

        /// Empty the graph first
        #[arg(long)]
        clear: bool,
    },

    /// Show a bundle's metadata and counts without importing
    Inspect { bundle: PathBuf },
}

pub async fn run(cli: Cli) -> Result<()> {
    if let Commands::Inspect { bundle: path } = &cli.command {
        return bundle::inspect(path);
    }

    let code_graph = CodeGraph::from_config_file(&cli.config)
        .with_context(|| format!("opening graph from {}", cli.config.display()))?;
    let result = match cli.command {
        Commands::Index { path, ir } => graph::index(&code_graph, &canonical(&path)?, &ir).await,
        Commands::Watch { paths, ir } => watch::watch(&code_graph, &paths, &ir).await,
        Commands::Traverse {
            name,
            file,
            kind,
            edge,
            min,
            max,
        } => graph::traverse(&code_graph, &name, &file, &kind, &edge, min, max),
        Commands::Query {
            text,
            kind,
            raw,
            limit,
        } => {
            if raw {
                graph::raw_query(&code_graph, &text)
            } else {
                graph::search(&code_graph, &text, kind.as_deref(), limit)
            }
        }
        Commands::Stats { scope } => {
            let scope = scope.as_deref().map(canonical).transpose()?;
            graph::stats(&code_graph, scope.as_deref())
        }
        Commands::Delete { scope } => graph::delete(&code_graph, &canonical(&scope)?),
        Commands::Clean => graph::clean(&code_graph),
        Commands::Export { out, scope } => {
            let scope = scope.as_deref().map(canonical).transpose()?;
            bundle::export(&code_graph, &out, scope.as_deref())
        }
        Commands::Import { bundle: path, clear } => bundle::import(&code_graph, &path, clear),
        Commands::Inspect { .. } => Ok(()),
    };
    code_graph.close()?;
    result
}

/// Absolute form of a user-supplied path; scopes are stored absolute.
fn canonical(path: &Path) -> Result<PathBuf> {
    if path.exists() {
        return path
            .canonicalize()
            .with_context(|| format!("resolving {}", path.display()));
    }
    // A deleted file or root still names a scope.
    Ok(std::env::current_dir()?.join(path))
}
