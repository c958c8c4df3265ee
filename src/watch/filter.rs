//
//  filter.rs
//  CodeGraphContext
//

use ignore::gitignore::{Gitignore, GitignoreBuilder};
use std::path::{Component, Path, PathBuf};
use tracing::warn;

/// Directories whose changes never trigger indexing, even without .gitignore.
const BUILTIN_IGNORE: &[&str] = &[
    "node_modules",
    "vendor",
    "dist",
    "build",
    ".git",
    ".svn",
    ".hg",
    "__pycache__",
    ".tox",
    ".venv",
    "venv",
    ".mypy_cache",
    ".pytest_cache",
    "target",
    ".next",
    "coverage",
    ".cache",
    ".cgc",
];

fn is_builtin_ignored(relative: &Path) -> bool {
    relative.components().any(|c| match c {
        Component::Normal(name) => BUILTIN_IGNORE.contains(&name.to_str().unwrap_or("")),
        _ => false,
    })
}

/// Decides which changed paths under a root are worth re-indexing.
pub struct PathFilter {
    root: PathBuf,
    gitignore: Option<Gitignore>,
}

impl PathFilter {
    /// Reads `<root>/.gitignore` if present.
    pub fn new(root: &Path) -> Self {
        let mut builder = GitignoreBuilder::new(root);
        let gitignore_file = root.join(".gitignore");
        if gitignore_file.is_file() {
            if let Some(e) = builder.add(&gitignore_file) {
                warn!(path = %gitignore_file.display(), error = %e, "unreadable .gitignore");
            }
        }
        let gitignore = match builder.build() {
            Ok(gi) => Some(gi),
            Err(e) => {
                warn!(root = %root.display(), error = %e, "ignoring malformed .gitignore");
                None
            }
        };
        Self {
            root: root.to_path_buf(),
            gitignore,
        }
    }

    pub fn accepts(&self, path: &Path) -> bool {
        let Ok(relative) = path.strip_prefix(&self.root) else {
            return false;
        };
        if relative.as_os_str().is_empty() || is_builtin_ignored(relative) {
            return false;
        }
        match &self.gitignore {
            Some(gi) => !gi
                .matched_path_or_any_parents(path, path.is_dir())
                .is_ignore(),
            None => true,
        }
    }
}
