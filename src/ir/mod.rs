//! Intermediate representation emitted by indexers.
//!
//! Every extractor (tree-sitter, SCIP, a JSON dump from an external tool)
//! produces the same shape: a batch of [`Symbol`]s and [`Reference`]s. The
//! graph builder consumes nothing else.

pub mod indexer;

pub use indexer::{HybridIndexer, Indexer, IndexerError, IndexerKind, JsonIrIndexer, StaticIndexer};

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

/// Kind of a code symbol (and of the node created for it).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum NodeKind {
    File,
    Function,
    Class,
    Variable,
    Module,
}

impl NodeKind {
    pub const ALL: [NodeKind; 5] = [
        NodeKind::File,
        NodeKind::Function,
        NodeKind::Class,
        NodeKind::Variable,
        NodeKind::Module,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            NodeKind::File => "File",
            NodeKind::Function => "Function",
            NodeKind::Class => "Class",
            NodeKind::Variable => "Variable",
            NodeKind::Module => "Module",
        }
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        NodeKind::ALL
            .into_iter()
            .find(|k| k.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown node kind: {}", s))
    }
}

/// Kind of a relationship between two symbols.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EdgeKind {
    Calls,
    Contains,
    Inherits,
    Imports,
}

impl EdgeKind {
    pub const ALL: [EdgeKind; 4] = [
        EdgeKind::Calls,
        EdgeKind::Contains,
        EdgeKind::Inherits,
        EdgeKind::Imports,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EdgeKind::Calls => "CALLS",
            EdgeKind::Contains => "CONTAINS",
            EdgeKind::Inherits => "INHERITS",
            EdgeKind::Imports => "IMPORTS",
        }
    }
}

impl fmt::Display for EdgeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EdgeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EdgeKind::ALL
            .into_iter()
            .find(|k| k.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown edge kind: {}", s))
    }
}

/// Stable identity of a symbol across re-indexing runs.
///
/// This is the join key everywhere outside a single backend instance;
/// backend-assigned ids never leave the backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityKey {
    pub kind: NodeKind,
    pub qualified_name: String,
    pub file_path: String,
}

impl IdentityKey {
    pub fn new(kind: NodeKind, qualified_name: impl Into<String>, file_path: impl AsRef<Path>) -> Self {
        Self {
            kind,
            qualified_name: qualified_name.into(),
            file_path: path_string(file_path.as_ref()),
        }
    }

    /// True if the owning file lives under `root` (or is `root`).
    pub fn is_under(&self, root: &Path) -> bool {
        Path::new(&self.file_path).starts_with(root)
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}#{}", self.kind, self.file_path, self.qualified_name)
    }
}

/// A code symbol as extracted by an indexer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Symbol {
    pub kind: NodeKind,
    pub qualified_name: String,
    pub name: String,
    pub file_path: String,
    pub start_line: u32,
    pub end_line: u32,
    #[serde(default)]
    pub decorators: BTreeSet<String>,
    #[serde(default)]
    pub is_dependency: bool,
}

impl Symbol {
    pub fn new(
        kind: NodeKind,
        qualified_name: impl Into<String>,
        file_path: impl AsRef<Path>,
        start_line: u32,
        end_line: u32,
    ) -> Self {
        let qualified_name = qualified_name.into();
        let name = qualified_name
            .rsplit(['.', ':'])
            .next()
            .unwrap_or(&qualified_name)
            .to_string();
        Self {
            kind,
            name,
            qualified_name,
            file_path: path_string(file_path.as_ref()),
            start_line,
            end_line,
            decorators: BTreeSet::new(),
            is_dependency: false,
        }
    }

    pub fn with_decorators<I, S>(mut self, decorators: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.decorators = decorators.into_iter().map(Into::into).collect();
        self
    }

    pub fn key(&self) -> IdentityKey {
        IdentityKey {
            kind: self.kind,
            qualified_name: self.qualified_name.clone(),
            file_path: self.file_path.clone(),
        }
    }
}

/// A relationship between two symbols, keyed by identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reference {
    pub kind: EdgeKind,
    pub from_key: IdentityKey,
    pub to_key: IdentityKey,
    #[serde(default)]
    pub line_number: Option<u32>,
}

impl Reference {
    pub fn new(kind: EdgeKind, from_key: IdentityKey, to_key: IdentityKey, line_number: u32) -> Self {
        Self {
            kind,
            from_key,
            to_key,
            line_number: Some(line_number),
        }
    }
}

/// One indexing run's output.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexBatch {
    pub indexer: IndexerKind,
    #[serde(default)]
    pub indexer_version: String,
    /// Files this batch is authoritative for. A listed file without symbols
    /// has been removed and its graph data is discarded.
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default)]
    pub symbols: Vec<Symbol>,
    #[serde(default)]
    pub references: Vec<Reference>,
}

impl IndexBatch {
    pub fn new(indexer: IndexerKind) -> Self {
        Self {
            indexer,
            indexer_version: String::new(),
            files: Vec::new(),
            symbols: Vec::new(),
            references: Vec::new(),
        }
    }

    /// Every file the batch covers, sorted: listed files plus symbol owners.
    pub fn covered_files(&self) -> Vec<String> {
        let mut files: BTreeSet<String> = self.files.iter().cloned().collect();
        files.extend(self.symbols.iter().map(|s| s.file_path.clone()));
        files.into_iter().collect()
    }

    /// Symbols grouped by owning file, in file order.
    pub fn symbols_by_file(&self) -> BTreeMap<String, Vec<&Symbol>> {
        let mut grouped: BTreeMap<String, Vec<&Symbol>> = self
            .covered_files()
            .into_iter()
            .map(|f| (f, Vec::new()))
            .collect();
        for symbol in &self.symbols {
            grouped.entry(symbol.file_path.clone()).or_default().push(symbol);
        }
        grouped
    }

    /// References grouped by the file of their source symbol.
    pub fn references_by_file(&self) -> BTreeMap<String, Vec<&Reference>> {
        let mut grouped: BTreeMap<String, Vec<&Reference>> = BTreeMap::new();
        for reference in &self.references {
            grouped
                .entry(reference.from_key.file_path.clone())
                .or_default()
                .push(reference);
        }
        grouped
    }

    /// Restrict the batch to files under `path`.
    ///
    /// A path that is not a directory and owns no symbols is listed as
    /// covered, so a deleted file yields an empty authoritative batch.
    pub fn scoped_to(&self, path: &Path) -> IndexBatch {
        let under = |file: &str| Path::new(file).starts_with(path);
        let symbols: Vec<Symbol> = self
            .symbols
            .iter()
            .filter(|s| under(&s.file_path))
            .cloned()
            .collect();
        let mut files: Vec<String> = self.files.iter().filter(|f| under(f)).cloned().collect();
        if !path.is_dir() && symbols.is_empty() {
            let own = path_string(path);
            if !files.contains(&own) {
                files.push(own);
            }
        }
        IndexBatch {
            indexer: self.indexer,
            indexer_version: self.indexer_version.clone(),
            files,
            symbols,
            references: self
                .references
                .iter()
                .filter(|r| under(&r.from_key.file_path))
                .cloned()
                .collect(),
        }
    }
}

pub(crate) fn path_string(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}
