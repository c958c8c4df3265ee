//! Portable graph bundles.
//!
//! A bundle carries nodes and edges keyed by identity, never by backend id,
//! so it can be exported from one backend instance and imported into any
//! other. See [`archive`] for the container layout.

pub mod archive;
mod export;
mod import;

pub use export::{export_bundle, ExportOptions, ExportReport};
pub use import::{import_bundle, ImportOptions, ImportReport};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

use crate::backend::{BackendError, EdgeProps, GraphStats, NodeProps};
use crate::ir::{EdgeKind, IdentityKey, NodeKind};

/// Format written by this build.
pub const FORMAT_VERSION: &str = "1.1";
const SUPPORTED_MAJOR: u32 = 1;
const SUPPORTED_MINOR: u32 = 1;

#[derive(Debug, thiserror::Error)]
pub enum BundleError {
    #[error("Unsupported bundle format: {0}")]
    Schema(String),

    #[error("Malformed bundle: {0}")]
    Format(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("Aborted after {nodes} nodes and {edges} edges")]
    Aborted { nodes: usize, edges: usize },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleMetadata {
    pub format_version: String,
    pub exported_at: DateTime<Utc>,
    /// Scope the bundle was cut from; `None` for a whole-graph export.
    #[serde(default)]
    pub scope_ref: Option<String>,
    /// Commit of the scope's work tree, when it is a git checkout.
    #[serde(default)]
    pub source_version: Option<String>,
    #[serde(default)]
    pub generator: Option<String>,
}

/// Node kinds, edge kinds and the property names present for each.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BundleSchema {
    pub node_kinds: BTreeMap<NodeKind, BTreeSet<String>>,
    pub edge_kinds: BTreeMap<EdgeKind, BTreeSet<String>>,
}

impl BundleSchema {
    pub(crate) fn record_node(&mut self, kind: NodeKind, props: &serde_json::Value) {
        let entry = self.node_kinds.entry(kind).or_default();
        if let Some(map) = props.as_object() {
            entry.extend(map.keys().cloned());
        }
    }

    pub(crate) fn record_edge(&mut self, kind: EdgeKind, props: &serde_json::Value) {
        let entry = self.edge_kinds.entry(kind).or_default();
        if let Some(map) = props.as_object() {
            entry.extend(map.keys().cloned());
        }
    }
}

/// One line of `nodes.jsonl`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeLine {
    pub identity_key: IdentityKey,
    pub kind: NodeKind,
    pub properties: NodeProps,
}

/// One line of `edges.jsonl`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EdgeLine {
    pub from_key: IdentityKey,
    pub from_kind: NodeKind,
    pub to_key: IdentityKey,
    pub to_kind: NodeKind,
    pub edge_kind: EdgeKind,
    pub properties: EdgeProps,
}

impl NodeLine {
    fn validate(&self) -> Result<(), BundleError> {
        if self.kind != self.identity_key.kind {
            return Err(BundleError::Format(format!(
                "node {} labelled {}",
                self.identity_key, self.kind
            )));
        }
        Ok(())
    }
}

impl EdgeLine {
    fn validate(&self) -> Result<(), BundleError> {
        if self.from_kind != self.from_key.kind || self.to_kind != self.to_key.kind {
            return Err(BundleError::Format(format!(
                "edge {} -> {} has mismatched end kinds",
                self.from_key, self.to_key
            )));
        }
        Ok(())
    }
}

/// Check a bundle's format version against what this build reads.
///
/// Only `major.minor` is compared; a patch part such as `1.1.0` is ignored.
/// Returns a warning for an older minor version, which stays readable.
pub fn check_format_version(version: &str) -> Result<Option<String>, BundleError> {
    let mut parts = version.trim().split('.');
    let (major, minor) = parts
        .next()
        .zip(parts.next())
        .and_then(|(a, b)| Some((a.parse::<u32>().ok()?, b.parse::<u32>().ok()?)))
        .ok_or_else(|| BundleError::Schema(format!("unparseable format version '{}'", version)))?;
    if major != SUPPORTED_MAJOR {
        return Err(BundleError::Schema(format!(
            "format {} has major version {}, this build reads {}.x",
            version, major, SUPPORTED_MAJOR
        )));
    }
    if minor > SUPPORTED_MINOR {
        return Err(BundleError::Schema(format!(
            "format {} is newer than supported {}",
            version, FORMAT_VERSION
        )));
    }
    if minor < SUPPORTED_MINOR {
        return Ok(Some(format!(
            "bundle format {} is older than {}; reading it in compatibility mode",
            version, FORMAT_VERSION
        )));
    }
    Ok(None)
}

/// Bundle header and counts, read without importing.
#[derive(Debug, Clone, PartialEq)]
pub struct BundleSummary {
    pub metadata: BundleMetadata,
    pub schema: BundleSchema,
    pub stats: GraphStats,
}

pub fn inspect(bundle: &Path) -> Result<BundleSummary, BundleError> {
    let mut metadata = None;
    let mut schema = None;
    let mut stats = None;
    archive::BundleReader::open(bundle)?.for_each_entry(|name, reader| {
        match name {
            archive::METADATA => metadata = Some(archive::read_json(name, reader)?),
            archive::SCHEMA => schema = Some(archive::read_json(name, reader)?),
            archive::STATS => stats = Some(archive::read_json(name, reader)?),
            _ => {}
        }
        Ok(())
    })?;
    match (metadata, schema, stats) {
        (Some(metadata), Some(schema), Some(stats)) => Ok(BundleSummary {
            metadata,
            schema,
            stats,
        }),
        _ => Err(BundleError::Format("incomplete bundle".to_string())),
    }
}

/// Commit checked out at `root`, read from `.git` without shelling out.
pub fn git_head(root: &Path) -> Option<String> {
    let git_dir = root.ancestors().map(|p| p.join(".git")).find(|p| p.is_dir())?;
    let head = fs::read_to_string(git_dir.join("HEAD")).ok()?;
    let head = head.trim();
    let Some(reference) = head.strip_prefix("ref: ") else {
        return Some(head.to_string());
    };
    if let Ok(commit) = fs::read_to_string(git_dir.join(reference)) {
        return Some(commit.trim().to_string());
    }
    let packed = fs::read_to_string(git_dir.join("packed-refs")).ok()?;
    packed.lines().find_map(|line| {
        let (commit, name) = line.split_once(' ')?;
        (name == reference).then(|| commit.to_string())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_version_policy() {
        assert_eq!(check_format_version(FORMAT_VERSION).unwrap(), None);
        assert!(check_format_version("1.0").unwrap().is_some());
        assert!(matches!(check_format_version("1.2"), Err(BundleError::Schema(_))));
        assert!(matches!(check_format_version("2.0"), Err(BundleError::Schema(_))));
        assert!(matches!(check_format_version("one"), Err(BundleError::Schema(_))));
        assert!(matches!(check_format_version("1"), Err(BundleError::Schema(_))));
        assert_eq!(check_format_version("1.1.0").unwrap(), None);
        assert!(check_format_version("1.0.7").unwrap().is_some());
        assert!(matches!(check_format_version("1.2.0"), Err(BundleError::Schema(_))));
    }

    #[test]
    fn test_git_head_follows_ref() {
        let dir = tempdir().unwrap();
        let git = dir.path().join(".git");
        std::fs::create_dir_all(git.join("refs/heads")).unwrap();
        std::fs::write(git.join("HEAD"), "ref: refs/heads/main\n").unwrap();
        std::fs::write(git.join("refs/heads/main"), "abc123\n").unwrap();
        let nested = dir.path().join("src");
        std::fs::create_dir_all(&nested).unwrap();
        assert_eq!(git_head(&nested).as_deref(), Some("abc123"));

        std::fs::remove_file(git.join("refs/heads/main")).unwrap();
        std::fs::write(git.join("packed-refs"), "# pack-refs\ndef456 refs/heads/main\n").unwrap();
        assert_eq!(git_head(dir.path()).as_deref(), Some("def456"));
    }

    #[test]
    fn test_git_head_absent() {
        let dir = tempdir().unwrap();
        assert_eq!(git_head(dir.path()), None);
    }
}
