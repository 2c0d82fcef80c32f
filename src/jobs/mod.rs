// src/jobs/mod.rs

//! Jobs
//!
//! Every change to the pool or to a repository is carried out by a job. Jobs
//! are persisted in the `jobs` table, claimed by workers and retired with a
//! status, a message and an optional result payload.
//!
//! Job kinds are either *sequential* (at most one runs at any time, across
//! all workers) or *parallel* (run on any free worker, alongside anything).

mod handlers;
pub mod store;
pub mod task;
pub mod worker;

pub use store::JobStore;
pub use task::Task;
pub use worker::WorkerPool;

use crate::diff::JobResult;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Job identifier (the `jobs` row id)
pub type JobId = i64;

/// Job lifecycle status
///
/// Transitions only go New -> Running -> {Completed, Failed}, New ->
/// Cancelled, and Running -> New during crash recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    New,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    /// Integer stored in the `status` column
    pub fn code(&self) -> i64 {
        match self {
            Self::New => 0,
            Self::Running => 1,
            Self::Completed => 2,
            Self::Failed => 3,
            Self::Cancelled => 4,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(Self::New),
            1 => Some(Self::Running),
            2 => Some(Self::Completed),
            3 => Some(Self::Failed),
            4 => Some(Self::Cancelled),
            _ => None,
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::New => "new",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{}", name)
    }
}

/// The closed set of job types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    CreateRepo,
    DeleteRepo,
    Import,
    Index,
    Delta,
    DeltaPackage,
    DeltaIndex,
    BulkAdd,
    CopySource,
    RemoveSource,
    CloneRepo,
    PullRepo,
    TrimPackages,
    TrimObsolete,
    TransitProcess,
    Check,
    Rescan,
    Compare,
    Sync,
    CherryPick,
    Freeze,
    Unfreeze,
    EnableInstantTransit,
    DisableInstantTransit,
}

impl JobKind {
    pub const ALL: [JobKind; 24] = [
        Self::CreateRepo,
        Self::DeleteRepo,
        Self::Import,
        Self::Index,
        Self::Delta,
        Self::DeltaPackage,
        Self::DeltaIndex,
        Self::BulkAdd,
        Self::CopySource,
        Self::RemoveSource,
        Self::CloneRepo,
        Self::PullRepo,
        Self::TrimPackages,
        Self::TrimObsolete,
        Self::TransitProcess,
        Self::Check,
        Self::Rescan,
        Self::Compare,
        Self::Sync,
        Self::CherryPick,
        Self::Freeze,
        Self::Unfreeze,
        Self::EnableInstantTransit,
        Self::DisableInstantTransit,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CreateRepo => "create_repo",
            Self::DeleteRepo => "delete_repo",
            Self::Import => "import",
            Self::Index => "index",
            Self::Delta => "delta",
            Self::DeltaPackage => "delta_package",
            Self::DeltaIndex => "delta_index",
            Self::BulkAdd => "bulk_add",
            Self::CopySource => "copy_source",
            Self::RemoveSource => "remove_source",
            Self::CloneRepo => "clone_repo",
            Self::PullRepo => "pull_repo",
            Self::TrimPackages => "trim_packages",
            Self::TrimObsolete => "trim_obsolete",
            Self::TransitProcess => "transit_process",
            Self::Check => "check",
            Self::Rescan => "rescan",
            Self::Compare => "compare",
            Self::Sync => "sync",
            Self::CherryPick => "cherry_pick",
            Self::Freeze => "freeze",
            Self::Unfreeze => "unfreeze",
            Self::EnableInstantTransit => "enable_instant_transit",
            Self::DisableInstantTransit => "disable_instant_transit",
        }
    }

    /// Parallel kinds only read repositories or add deltas; everything else is serialized
    pub fn is_sequential(&self) -> bool {
        !matches!(
            self,
            Self::Delta
                | Self::DeltaPackage
                | Self::DeltaIndex
                | Self::CopySource
                | Self::Check
                | Self::Compare
        )
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for JobKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| format!("Invalid job kind: {}", s))
    }
}

/// A job record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Assigned on push; 0 until then
    pub id: JobId,
    pub kind: JobKind,
    /// Repository read from, for two-repository jobs
    pub src_repo: Option<String>,
    /// Repository acted upon
    pub dst_repo: Option<String>,
    /// Package names, source names, file paths or a manifest path
    pub sources: Vec<String>,
    pub release: i64,
    pub max_keep: i64,
    pub created_at: Option<String>,
    pub claimed_at: Option<String>,
    pub started_at: Option<String>,
    pub finished_at: Option<String>,
    pub status: JobStatus,
    pub message: Option<String>,
    pub result: Option<JobResult>,
}

impl Job {
    /// A job of `kind` with no arguments
    pub fn new(kind: JobKind) -> Self {
        Self {
            id: 0,
            kind,
            src_repo: None,
            dst_repo: None,
            sources: Vec::new(),
            release: 0,
            max_keep: 0,
            created_at: None,
            claimed_at: None,
            started_at: None,
            finished_at: None,
            status: JobStatus::New,
            message: None,
            result: None,
        }
    }

    /// Single-repository job
    pub fn for_repo(kind: JobKind, repo: &str) -> Self {
        Self::new(kind).with_dst(repo)
    }

    /// Two-repository job reading `src` and writing `dst`
    pub fn between(kind: JobKind, src: &str, dst: &str) -> Self {
        Self::new(kind).with_src(src).with_dst(dst)
    }

    pub fn with_src(mut self, repo: &str) -> Self {
        self.src_repo = Some(repo.to_string());
        self
    }

    pub fn with_dst(mut self, repo: &str) -> Self {
        self.dst_repo = Some(repo.to_string());
        self
    }

    pub fn with_sources<I, S>(mut self, sources: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.sources = sources.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_release(mut self, release: i64) -> Self {
        self.release = release;
        self
    }

    pub fn with_max_keep(mut self, max_keep: i64) -> Self {
        self.max_keep = max_keep;
        self
    }
}
