//
//  error.rs
//  CodeGraphContext
//
//  Crate-wide error type for callers that drive several subsystems at once.
//

use crate::backend::BackendError;
use crate::builder::BuildError;
use crate::bundle::BundleError;
use crate::ir::IndexerError;
use crate::jobs::JobError;
use crate::watch::WatchError;

#[derive(Debug, thiserror::Error)]
pub enum CgcError {
    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Build(#[from] BuildError),

    #[error(transparent)]
    Job(#[from] JobError),

    #[error(transparent)]
    Bundle(#[from] BundleError),

    #[error(transparent)]
    Watch(#[from] WatchError),

    #[error(transparent)]
    Indexer(#[from] IndexerError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CgcError {
    /// Whether retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            CgcError::Backend(e) => e.is_transient(),
            CgcError::Build(BuildError::Backend(e) | BuildError::Failed { source: e, .. }) => {
                e.is_transient()
            }
            CgcError::Bundle(BundleError::Backend(e)) => e.is_transient(),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, CgcError>;
