//
//  types.rs
//  CodeGraphContext
//

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use uuid::Uuid;

use crate::builder::BuildReport;
use crate::ir::IndexerKind;

/// Identifier of an indexing job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(Uuid);

impl JobId {
    pub(crate) fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Job lifecycle: `Pending -> Running -> Completed | Failed`.
/// A pending job may also fail directly when cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }

    pub fn can_transition_to(&self, next: JobState) -> bool {
        matches!(
            (self, next),
            (JobState::Pending, JobState::Running)
                | (JobState::Pending, JobState::Failed)
                | (JobState::Running, JobState::Completed)
                | (JobState::Running, JobState::Failed)
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobState::Pending => "pending",
            JobState::Running => "running",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "reason", content = "message")]
pub enum FailureReason {
    Cancelled,
    Error(String),
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::Cancelled => f.write_str("cancelled"),
            FailureReason::Error(msg) => write!(f, "error: {}", msg),
        }
    }
}

/// Snapshot of a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
    pub id: JobId,
    /// Path handed to the indexer (a root or a single file).
    pub path: PathBuf,
    /// Repository scope the results are written under.
    pub scope: PathBuf,
    pub state: JobState,
    #[serde(default)]
    pub failure: Option<FailureReason>,
    pub files_indexed: usize,
    #[serde(default)]
    pub report: Option<BuildReport>,
    #[serde(default)]
    pub indexer: Option<IndexerKind>,
    #[serde(default)]
    pub indexer_version: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

impl JobRecord {
    pub(crate) fn pending(id: JobId, scope: PathBuf, path: PathBuf) -> Self {
        Self {
            id,
            path,
            scope,
            state: JobState::Pending,
            failure: None,
            files_indexed: 0,
            report: None,
            indexer: None,
            indexer_version: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }
}
