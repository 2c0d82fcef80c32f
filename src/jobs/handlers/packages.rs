// src/jobs/handlers/packages.rs

//! Package-level jobs: adding, copying, removing, trimming and verifying archives

use super::reindex;
use crate::archive::Archive;
use crate::config::PACKAGE_EXTENSION;
use crate::diff::{Diff, DiffKind, JobResult};
use crate::error::{Error, Result};
use crate::hash;
use crate::manager::Context;
use crate::pool::PoolEntry;
use crate::repo::{self, Assets, Repository};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Inspect every file up front, outside of any transaction
fn inspect_all(ctx: &Context, files: &[PathBuf]) -> Result<Vec<(PathBuf, Archive)>> {
    files
        .iter()
        .map(|path| {
            if !path.to_string_lossy().ends_with(PACKAGE_EXTENSION) {
                return Err(Error::InvalidJob(format!(
                    "{} is not a {} archive",
                    path.display(),
                    PACKAGE_EXTENSION
                )));
            }
            let archive = ctx.inspector.inspect(path)?;
            Ok((path.clone(), archive))
        })
        .collect()
}

/// Ingest and link inspected archives into `repo`
fn add_archives(
    ctx: &Context,
    tx: &rusqlite::Transaction,
    repo: &Repository,
    archives: &[(PathBuf, Archive)],
) -> Result<Diff> {
    let mut entries = Vec::with_capacity(archives.len());
    let mut diff = Diff::default();
    for (path, archive) in archives {
        entries.push(ctx.pool.ingest(tx, path, archive)?);
        if !archive.is_delta() {
            diff.push(&archive.name, DiffKind::Added, Some(archive.release), None);
        }
    }
    ctx.pool.link(tx, repo, &entries)?;
    Ok(diff)
}

/// Add every archive found under `dir`, creating the repository if needed, then index
pub(crate) fn import(ctx: &Context, name: &str, dir: &Path) -> Result<Option<JobResult>> {
    repo::ensure_writable(&ctx.config, name)?;
    if !dir.is_dir() {
        return Err(Error::NotFound(format!("import directory {}", dir.display())));
    }

    let mut files = Vec::new();
    for entry in WalkDir::new(dir).follow_links(true).sort_by_file_name() {
        let entry = entry.map_err(|e| Error::IoError(e.to_string()))?;
        if entry.file_type().is_file()
            && entry.file_name().to_string_lossy().ends_with(PACKAGE_EXTENSION)
        {
            files.push(entry.into_path());
        }
    }
    if files.is_empty() {
        warn!("No archives found under {}", dir.display());
    }
    let archives = inspect_all(ctx, &files)?;

    let diff = ctx.db.transaction(|tx| {
        let repo = match Repository::find(tx, name)? {
            Some(repo) => repo,
            None => Repository::create(tx, &ctx.config, name)?,
        };
        add_archives(ctx, tx, &repo, &archives)
    })?;

    info!("Imported {} archives into {}", archives.len(), name);
    reindex(ctx, name)?;
    Ok(Some(JobResult::diff(diff)))
}

/// Add explicit files; the caller indexes later
pub(crate) fn bulk_add(ctx: &Context, name: &str, files: &[PathBuf]) -> Result<Option<JobResult>> {
    repo::ensure_writable(&ctx.config, name)?;
    let archives = inspect_all(ctx, files)?;
    let diff = ctx.db.transaction(|tx| {
        let repo = Repository::get(tx, name)?;
        add_archives(ctx, tx, &repo, &archives)
    })?;
    info!("Added {} archives to {}", archives.len(), name);
    Ok(Some(JobResult::diff(diff)))
}

/// Archives built from `source` at `release`, packages and the deltas into them
fn source_entries(entries: &[PoolEntry], source: &str, release: i64) -> Vec<PoolEntry> {
    entries
        .iter()
        .filter(|e| e.archive.source == source && e.archive.release == release)
        .cloned()
        .collect()
}

pub(crate) fn copy_source(
    ctx: &Context,
    from: &str,
    to: &str,
    source: &str,
    release: i64,
) -> Result<Option<JobResult>> {
    repo::ensure_writable(&ctx.config, to)?;
    let diff = ctx.db.transaction(|tx| {
        let src = Repository::get(tx, from)?;
        let dst = Repository::get(tx, to)?;
        let matched = source_entries(&ctx.pool.linked_entries(tx, src.id)?, source, release);
        if !matched.iter().any(|e| !e.archive.is_delta()) {
            return Err(Error::NotFound(format!(
                "source {} release {} in {}",
                source, release, from
            )));
        }

        ctx.pool.link(tx, &dst, &matched)?;
        let mut diff = Diff::default();
        for entry in matched.iter().filter(|e| !e.archive.is_delta()) {
            diff.push(&entry.archive.name, DiffKind::Added, Some(release), None);
        }
        Ok(diff)
    })?;
    info!("Copied {} release {} from {} to {}", source, release, from, to);
    Ok(Some(JobResult::diff(diff)))
}

pub(crate) fn remove_source(ctx: &Context, name: &str, source: &str, release: i64) -> Result<Option<JobResult>> {
    repo::ensure_writable(&ctx.config, name)?;
    let diff = ctx.db.transaction_with_removals(|tx, removals| {
        let repo = Repository::get(tx, name)?;
        let matched = source_entries(&ctx.pool.linked_entries(tx, repo.id)?, source, release);
        if matched.is_empty() {
            return Err(Error::NotFound(format!(
                "source {} release {} in {}",
                source, release, name
            )));
        }

        ctx.pool.unlink(tx, &repo, &matched, removals)?;
        let mut diff = Diff::default();
        for entry in matched.iter().filter(|e| !e.archive.is_delta()) {
            diff.push(&entry.archive.name, DiffKind::Removed, None, Some(release));
        }
        Ok(diff)
    })?;
    info!("Removed {} release {} from {}", source, release, name);
    Ok(Some(JobResult::diff(diff)))
}

/// Keep the newest `max_keep` releases of every package
pub(crate) fn trim_packages(ctx: &Context, name: &str, max_keep: i64) -> Result<Option<JobResult>> {
    repo::ensure_writable(&ctx.config, name)?;
    let diff = ctx.db.transaction_with_removals(|tx, removals| {
        let repo = Repository::get(tx, name)?;
        let entries = ctx.pool.linked_entries(tx, repo.id)?;

        let mut by_name: BTreeMap<&str, Vec<&PoolEntry>> = BTreeMap::new();
        for entry in entries.iter().filter(|e| !e.archive.is_delta()) {
            by_name.entry(entry.archive.name.as_str()).or_default().push(entry);
        }

        let mut kept: HashSet<(&str, i64)> = HashSet::new();
        let mut doomed: Vec<PoolEntry> = Vec::new();
        let mut diff = Diff::default();
        for (package, releases) in by_name.iter_mut() {
            releases.sort_by(|a, b| b.archive.release.cmp(&a.archive.release));
            for (i, entry) in releases.iter().enumerate() {
                if (i as i64) < max_keep {
                    kept.insert((*package, entry.archive.release));
                } else {
                    diff.push(*package, DiffKind::Removed, None, Some(entry.archive.release));
                    doomed.push((*entry).clone());
                }
            }
        }
        doomed.extend(
            entries
                .iter()
                .filter(|e| e.archive.is_delta())
                .filter(|e| !kept.contains(&(e.archive.name.as_str(), e.archive.release)))
                .cloned(),
        );

        ctx.pool.unlink(tx, &repo, &doomed, removals)?;
        Ok(diff)
    })?;

    info!("Trimmed {} releases from {}", diff.entries.len(), name);
    if !diff.entries.is_empty() {
        reindex(ctx, name)?;
    }
    Ok(Some(JobResult::diff(diff)))
}

/// Drop every package the distribution marks obsolete
pub(crate) fn trim_obsolete(ctx: &Context, name: &str) -> Result<Option<JobResult>> {
    repo::ensure_writable(&ctx.config, name)?;
    let assets = Assets::load(&ctx.config.assets_dir(name))?;

    let diff = ctx.db.transaction_with_removals(|tx, removals| {
        let repo = Repository::get(tx, name)?;
        let doomed: Vec<PoolEntry> = ctx
            .pool
            .linked_entries(tx, repo.id)?
            .into_iter()
            .filter(|e| assets.is_obsolete(&e.archive.name))
            .collect();

        let mut diff = Diff::default();
        for entry in doomed.iter().filter(|e| !e.archive.is_delta()) {
            diff.push(&entry.archive.name, DiffKind::Removed, None, Some(entry.archive.release));
        }
        ctx.pool.unlink(tx, &repo, &doomed, removals)?;
        Ok(diff)
    })?;

    info!("Removed {} obsolete releases from {}", diff.entries.len(), name);
    reindex(ctx, name)?;
    Ok(Some(JobResult::diff(diff)))
}

/// Verify every linked file against the recorded size and sha256
pub(crate) fn check(ctx: &Context, name: &str) -> Result<Option<JobResult>> {
    let entries = ctx.db.transaction(|tx| {
        let repo = Repository::get(tx, name)?;
        ctx.pool.linked_entries(tx, repo.id)
    })?;

    let mut diff = Diff::default();
    for entry in &entries {
        let path = ctx.pool.repo_path(name, &entry.archive);
        let release = Some(entry.archive.release);
        let kind = match hash::digest_file(&path) {
            Err(e) => {
                debug!("{} is unreadable: {}", path.display(), e);
                DiffKind::Removed
            }
            Ok(d) if d.size != entry.archive.size || d.sha256 != entry.archive.sha256 => {
                DiffKind::Modified
            }
            Ok(_) => DiffKind::Unchanged,
        };
        diff.push(entry.name(), kind, release, release);
    }

    let broken = diff.entries.len() - diff.count(DiffKind::Unchanged);
    if broken > 0 {
        warn!("{} of {} files in {} failed verification", broken, entries.len(), name);
    } else {
        info!("All {} files in {} verified", entries.len(), name);
    }
    Ok(Some(JobResult::diff(diff)))
}

/// Reconcile the repository tree and refcounts with the pool
pub(crate) fn rescan(ctx: &Context, name: &str) -> Result<Option<JobResult>> {
    repo::ensure_writable(&ctx.config, name)?;
    let diff = ctx.db.transaction_with_removals(|tx, removals| {
        let repo = Repository::get(tx, name)?;
        let mut diff = Diff::default();
        let mut lost = Vec::new();

        for entry in ctx.pool.linked_entries(tx, repo.id)? {
            let release = Some(entry.archive.release);
            if !ctx.pool.entry_path(&entry.archive).exists() {
                diff.push(entry.name(), DiffKind::Removed, None, release);
                lost.push(entry);
            } else if ctx.pool.restore(&repo, &entry.archive)? {
                diff.push(entry.name(), DiffKind::Modified, release, release);
            } else {
                diff.push(entry.name(), DiffKind::Unchanged, release, release);
            }
        }

        ctx.pool.unlink(tx, &repo, &lost, removals)?;
        let dropped = ctx.pool.recount(tx, removals)?;
        if dropped > 0 {
            info!("Dropped {} unreferenced pool entries", dropped);
        }
        Ok(diff)
    })?;

    reindex(ctx, name)?;
    Ok(Some(JobResult::diff(diff)))
}
