//
//  config.rs
//  CodeGraphContext
//
//  `cgc.toml` configuration.
//

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

use crate::backend::RetryPolicy;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CgcConfig {
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub jobs: JobsConfig,
    #[serde(default)]
    pub watch: WatchConfig,
    #[serde(default)]
    pub bundle: BundleConfig,
}

/// Graph store selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// `sqlite` or `memory`. Overridden by `CGC_RUNTIME_DB_TYPE` / `DATABASE_TYPE`.
    #[serde(default = "default_kind")]
    pub kind: String,
    /// Database file for the sqlite backend, relative to the config directory.
    /// Absent or `:memory:` keeps the database in memory.
    #[serde(default = "default_db_path")]
    pub path: Option<PathBuf>,
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobsConfig {
    /// Indexing jobs allowed to run at once.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Finished job records kept for `status`; older ones are dropped.
    #[serde(default = "default_history")]
    pub history: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchConfig {
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundleConfig {
    /// Nodes or edges written per backend batch on import.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

fn default_kind() -> String {
    "sqlite".to_string()
}

fn default_db_path() -> Option<PathBuf> {
    Some(PathBuf::from(".cgc/graph.db"))
}

fn default_pool_size() -> u32 {
    4
}

fn default_busy_timeout_ms() -> u64 {
    5_000
}

fn default_workers() -> usize {
    4
}

fn default_history() -> usize {
    256
}

fn default_debounce_ms() -> u64 {
    500
}

fn default_batch_size() -> usize {
    1_000
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            kind: default_kind(),
            path: default_db_path(),
            pool_size: default_pool_size(),
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            history: default_history(),
        }
    }
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce_ms(),
        }
    }
}

impl Default for BundleConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
        }
    }
}

impl BackendConfig {
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    /// In-process backend, nothing persisted.
    pub fn memory() -> Self {
        Self {
            kind: "memory".to_string(),
            path: None,
            ..Self::default()
        }
    }
}

impl WatchConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

impl CgcConfig {
    /// Load config from a TOML file, falling back to defaults.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_else(|e| {
                warn!(path = %path.display(), error = %e, "invalid config, using defaults");
                Self::default()
            }),
            Err(_) => Self::default(),
        }
    }

    /// Directory relative paths in the config resolve against.
    pub fn base_dir(config_path: &Path) -> PathBuf {
        match config_path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_missing_file_uses_defaults() {
        let cfg = CgcConfig::load(Path::new("/nonexistent/cgc.toml"));
        assert_eq!(cfg.backend.kind, "sqlite");
        assert_eq!(cfg.jobs.workers, 4);
        assert_eq!(cfg.jobs.history, 256);
        assert_eq!(cfg.retry.max_attempts, 4);
        assert_eq!(cfg.bundle.batch_size, 1000);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cgc.toml");
        std::fs::write(
            &path,
            "[backend]\nkind = \"memory\"\n\n[watch]\ndebounce_ms = 50\n\n[retry]\nmax_attempts = 2\n",
        )
        .unwrap();
        let cfg = CgcConfig::load(&path);
        assert_eq!(cfg.backend.kind, "memory");
        assert_eq!(cfg.backend.pool_size, 4);
        assert_eq!(cfg.watch.debounce(), Duration::from_millis(50));
        assert_eq!(cfg.retry.max_attempts, 2);
        assert_eq!(cfg.retry.initial_backoff_ms, 50);
    }

    #[test]
    fn test_invalid_file_falls_back() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cgc.toml");
        std::fs::write(&path, "backend = 3").unwrap();
        assert_eq!(CgcConfig::load(&path).backend.kind, "sqlite");
    }
}
