// src/jobs/task.rs

//! Typed job dispatch
//!
//! [`Task::from_job`] turns a stored [`Job`] into a typed variant, rejecting
//! jobs whose arguments do not fit their kind. It runs once at push time and
//! again when a worker picks the job up.

use super::handlers::{deltas, packages, repos, transit};
use super::{Job, JobKind};
use crate::diff::JobResult;
use crate::error::{Error, Result};
use crate::manager::Context;
use std::path::PathBuf;

/// One variant per job kind, carrying the validated arguments
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Task {
    CreateRepo { repo: String },
    DeleteRepo { repo: String },
    Import { repo: String, dir: PathBuf },
    Index { repo: String },
    Delta { repo: String },
    DeltaPackage { repo: String, package: String },
    DeltaIndex { repo: String, packages: Vec<String> },
    BulkAdd { repo: String, files: Vec<PathBuf> },
    CopySource { from: String, to: String, source: String, release: i64 },
    RemoveSource { repo: String, source: String, release: i64 },
    CloneRepo { from: String, to: String, max_keep: i64 },
    PullRepo { from: String, to: String },
    TrimPackages { repo: String, max_keep: i64 },
    TrimObsolete { repo: String },
    TransitProcess { manifest: PathBuf },
    Check { repo: String },
    Rescan { repo: String },
    Compare { from: String, to: String },
    Sync { from: String, to: String },
    CherryPick { from: String, to: String, package: String },
    Freeze { repo: String },
    Unfreeze { repo: String },
    SetInstantTransit { repo: String, enabled: bool },
}

fn invalid(job: &Job, reason: &str) -> Error {
    Error::InvalidJob(format!("{}: {}", job.kind, reason))
}

fn dst(job: &Job) -> Result<String> {
    match job.dst_repo.as_deref() {
        Some(repo) if !repo.trim().is_empty() => Ok(repo.to_string()),
        _ => Err(invalid(job, "missing destination repository")),
    }
}

/// (src, dst) of a two-repository job; they must differ
fn pair(job: &Job) -> Result<(String, String)> {
    let src = match job.src_repo.as_deref() {
        Some(repo) if !repo.trim().is_empty() => repo.to_string(),
        _ => return Err(invalid(job, "missing source repository")),
    };
    let dst = dst(job)?;
    if src == dst {
        return Err(invalid(job, "source and destination repository are the same"));
    }
    Ok((src, dst))
}

fn one_source(job: &Job) -> Result<String> {
    match job.sources.as_slice() {
        [source] if !source.trim().is_empty() => Ok(source.clone()),
        [] => Err(invalid(job, "missing source argument")),
        _ => Err(invalid(job, "expected exactly one source argument")),
    }
}

fn some_sources(job: &Job) -> Result<Vec<String>> {
    let sources: Vec<String> = job
        .sources
        .iter()
        .filter(|s| !s.trim().is_empty())
        .cloned()
        .collect();
    if sources.is_empty() {
        return Err(invalid(job, "at least one source argument is required"));
    }
    Ok(sources)
}

fn release(job: &Job) -> Result<i64> {
    if job.release == 0 {
        return Err(invalid(job, "release number is required"));
    }
    Ok(job.release)
}

impl Task {
    /// Validate a job's arguments for its kind
    pub fn from_job(job: &Job) -> Result<Self> {
        let task = match job.kind {
            JobKind::CreateRepo => Self::CreateRepo { repo: dst(job)? },
            JobKind::DeleteRepo => Self::DeleteRepo { repo: dst(job)? },
            JobKind::Import => Self::Import {
                repo: dst(job)?,
                dir: PathBuf::from(one_source(job)?),
            },
            JobKind::Index => Self::Index { repo: dst(job)? },
            JobKind::Delta => Self::Delta { repo: dst(job)? },
            JobKind::DeltaPackage => Self::DeltaPackage {
                repo: dst(job)?,
                package: one_source(job)?,
            },
            JobKind::DeltaIndex => Self::DeltaIndex {
                repo: dst(job)?,
                packages: some_sources(job)?,
            },
            JobKind::BulkAdd => Self::BulkAdd {
                repo: dst(job)?,
                files: some_sources(job)?.into_iter().map(PathBuf::from).collect(),
            },
            JobKind::CopySource => {
                let (from, to) = pair(job)?;
                Self::CopySource {
                    from,
                    to,
                    source: one_source(job)?,
                    release: release(job)?,
                }
            }
            JobKind::RemoveSource => Self::RemoveSource {
                repo: dst(job)?,
                source: one_source(job)?,
                release: release(job)?,
            },
            JobKind::CloneRepo => {
                let (from, to) = pair(job)?;
                if job.max_keep < 0 {
                    return Err(invalid(job, "max_keep must not be negative"));
                }
                Self::CloneRepo {
                    from,
                    to,
                    max_keep: job.max_keep,
                }
            }
            JobKind::PullRepo => {
                let (from, to) = pair(job)?;
                Self::PullRepo { from, to }
            }
            JobKind::TrimPackages => {
                let repo = dst(job)?;
                if job.max_keep <= 0 {
                    return Err(invalid(job, "max_keep must be positive"));
                }
                Self::TrimPackages {
                    repo,
                    max_keep: job.max_keep,
                }
            }
            JobKind::TrimObsolete => Self::TrimObsolete { repo: dst(job)? },
            JobKind::TransitProcess => Self::TransitProcess {
                manifest: PathBuf::from(one_source(job)?),
            },
            JobKind::Check => Self::Check { repo: dst(job)? },
            JobKind::Rescan => Self::Rescan { repo: dst(job)? },
            JobKind::Compare => {
                let (from, to) = pair(job)?;
                Self::Compare { from, to }
            }
            JobKind::Sync => {
                let (from, to) = pair(job)?;
                Self::Sync { from, to }
            }
            JobKind::CherryPick => {
                let (from, to) = pair(job)?;
                Self::CherryPick {
                    from,
                    to,
                    package: one_source(job)?,
                }
            }
            JobKind::Freeze => Self::Freeze { repo: dst(job)? },
            JobKind::Unfreeze => Self::Unfreeze { repo: dst(job)? },
            JobKind::EnableInstantTransit => Self::SetInstantTransit {
                repo: dst(job)?,
                enabled: true,
            },
            JobKind::DisableInstantTransit => Self::SetInstantTransit {
                repo: dst(job)?,
                enabled: false,
            },
        };
        Ok(task)
    }

    /// Run the task to completion
    pub fn execute(&self, ctx: &Context) -> Result<Option<JobResult>> {
        match self {
            Self::CreateRepo { repo } => repos::create(ctx, repo),
            Self::DeleteRepo { repo } => repos::delete(ctx, repo),
            Self::Import { repo, dir } => packages::import(ctx, repo, dir),
            Self::Index { repo } => deltas::index(ctx, repo),
            Self::Delta { repo } => deltas::delta_repo(ctx, repo),
            Self::DeltaPackage { repo, package } => deltas::delta_package(ctx, repo, package),
            Self::DeltaIndex { repo, packages } => deltas::delta_index(ctx, repo, packages),
            Self::BulkAdd { repo, files } => packages::bulk_add(ctx, repo, files),
            Self::CopySource {
                from,
                to,
                source,
                release,
            } => packages::copy_source(ctx, from, to, source, *release),
            Self::RemoveSource {
                repo,
                source,
                release,
            } => packages::remove_source(ctx, repo, source, *release),
            Self::CloneRepo { from, to, max_keep } => repos::clone(ctx, from, to, *max_keep),
            Self::PullRepo { from, to } => repos::pull(ctx, from, to),
            Self::TrimPackages { repo, max_keep } => packages::trim_packages(ctx, repo, *max_keep),
            Self::TrimObsolete { repo } => packages::trim_obsolete(ctx, repo),
            Self::TransitProcess { manifest } => transit::process(ctx, manifest),
            Self::Check { repo } => packages::check(ctx, repo),
            Self::Rescan { repo } => packages::rescan(ctx, repo),
            Self::Compare { from, to } => repos::compare(ctx, from, to),
            Self::Sync { from, to } => repos::sync(ctx, from, to),
            Self::CherryPick { from, to, package } => repos::cherry_pick(ctx, from, to, package),
            Self::Freeze { repo } => repos::freeze(ctx, repo),
            Self::Unfreeze { repo } => repos::unfreeze(ctx, repo),
            Self::SetInstantTransit { repo, enabled } => {
                repos::set_instant_transit(ctx, repo, *enabled)
            }
        }
    }

    /// Human-readable one-liner for logs and listings
    pub fn describe(&self) -> String {
        match self {
            Self::CreateRepo { repo } => format!("Create repository '{}'", repo),
            Self::DeleteRepo { repo } => format!("Delete repository '{}'", repo),
            Self::Import { repo, dir } => {
                format!("Import '{}' into '{}'", dir.display(), repo)
            }
            Self::Index { repo } => format!("Index '{}'", repo),
            Self::Delta { repo } => format!("Produce deltas for '{}'", repo),
            Self::DeltaPackage { repo, package } => {
                format!("Produce deltas for '{}' in '{}'", package, repo)
            }
            Self::DeltaIndex { repo, packages } => format!(
                "Produce deltas for {} package(s) in '{}' then index",
                packages.len(),
                repo
            ),
            Self::BulkAdd { repo, files } => {
                format!("Add {} file(s) to '{}'", files.len(), repo)
            }
            Self::CopySource {
                from,
                to,
                source,
                release,
            } => format!("Copy '{}' release {} from '{}' to '{}'", source, release, from, to),
            Self::RemoveSource {
                repo,
                source,
                release,
            } => format!("Remove '{}' release {} from '{}'", source, release, repo),
            Self::CloneRepo { from, to, max_keep } => {
                if *max_keep == 0 {
                    format!("Clone '{}' into '{}' (all releases)", from, to)
                } else {
                    format!("Clone '{}' into '{}' (newest {})", from, to, max_keep)
                }
            }
            Self::PullRepo { from, to } => format!("Pull '{}' into '{}'", from, to),
            Self::TrimPackages { repo, max_keep } => {
                format!("Trim '{}' to {} release(s) per package", repo, max_keep)
            }
            Self::TrimObsolete { repo } => format!("Trim obsolete packages from '{}'", repo),
            Self::TransitProcess { manifest } => {
                format!("Process transit manifest '{}'", manifest.display())
            }
            Self::Check { repo } => format!("Check '{}'", repo),
            Self::Rescan { repo } => format!("Rescan '{}'", repo),
            Self::Compare { from, to } => format!("Compare '{}' with '{}'", from, to),
            Self::Sync { from, to } => format!("Sync '{}' into '{}'", from, to),
            Self::CherryPick { from, to, package } => {
                format!("Cherry-pick '{}' from '{}' into '{}'", package, from, to)
            }
            Self::Freeze { repo } => format!("Freeze '{}'", repo),
            Self::Unfreeze { repo } => format!("Unfreeze '{}'", repo),
            Self::SetInstantTransit { repo, enabled } => {
                let verb = if *enabled { "Enable" } else { "Disable" };
                format!("{} instant transit for '{}'", verb, repo)
            }
        }
    }
}
