// src/jobs/handlers/repos.rs

//! Whole-repository jobs: lifecycle, cloning and repository-to-repository copies

use super::{deltas_into, reindex};
use crate::diff::{Diff, DiffKind, JobResult};
use crate::error::{Error, Result};
use crate::manager::Context;
use crate::pool::PoolEntry;
use crate::repo::{self, Repository};
use std::collections::{BTreeMap, HashSet};
use tracing::info;

pub(crate) fn create(ctx: &Context, name: &str) -> Result<Option<JobResult>> {
    ctx.db
        .transaction(|tx| Repository::create(tx, &ctx.config, name))?;
    Ok(None)
}

pub(crate) fn delete(ctx: &Context, name: &str) -> Result<Option<JobResult>> {
    repo::ensure_writable(&ctx.config, name)?;
    ctx.db.transaction_with_removals(|tx, removals| {
        let repo = Repository::get(tx, name)?;
        repo.delete(tx, &ctx.config, &ctx.pool, removals)
    })?;
    Ok(None)
}

/// Create `to` holding the newest `max_keep` releases of every package in `from`
pub(crate) fn clone(ctx: &Context, from: &str, to: &str, max_keep: i64) -> Result<Option<JobResult>> {
    repo::ensure_writable(&ctx.config, to)?;

    let diff = ctx.db.transaction(|tx| {
        let src = Repository::get(tx, from)?;
        let dst = Repository::create(tx, &ctx.config, to)?;
        let entries = ctx.pool.linked_entries(tx, src.id)?;

        let mut by_name: BTreeMap<&str, Vec<&PoolEntry>> = BTreeMap::new();
        for entry in entries.iter().filter(|e| !e.archive.is_delta()) {
            by_name.entry(entry.archive.name.as_str()).or_default().push(entry);
        }

        let mut kept: Vec<PoolEntry> = Vec::new();
        for releases in by_name.values_mut() {
            releases.sort_by(|a, b| b.archive.release.cmp(&a.archive.release));
            let keep = if max_keep == 0 {
                releases.len()
            } else {
                max_keep as usize
            };
            for entry in releases.iter().take(keep) {
                kept.push((*entry).clone());
                kept.extend(deltas_into(&entries, entry).cloned());
            }
        }

        ctx.pool.link(tx, &dst, &kept)?;
        let tips = src.tips(tx, &ctx.pool)?;
        Ok(Diff::between(&Diff::releases(tips.values()), &BTreeMap::new()))
    })?;

    info!("Cloned {} into {} ({} packages)", from, to, diff.entries.len());
    reindex(ctx, to)?;
    Ok(Some(JobResult::diff(diff)))
}

/// Bring `to` up to date with every newer tip in `from`
pub(crate) fn pull(ctx: &Context, from: &str, to: &str) -> Result<Option<JobResult>> {
    repo::ensure_writable(&ctx.config, to)?;

    let diff = ctx.db.transaction(|tx| {
        let src = Repository::get(tx, from)?;
        let dst = Repository::get(tx, to)?;
        let src_tips = src.tips(tx, &ctx.pool)?;
        let dst_tips = dst.tips(tx, &ctx.pool)?;
        let src_entries = ctx.pool.linked_entries(tx, src.id)?;

        let mut incoming = Vec::new();
        for (name, tip) in &src_tips {
            let newer = dst_tips
                .get(name)
                .is_none_or(|current| tip.archive.release > current.archive.release);
            if newer {
                incoming.push(tip.clone());
                incoming.extend(deltas_into(&src_entries, tip).cloned());
            }
        }
        ctx.pool.link(tx, &dst, &incoming)?;

        let mut diff = Diff::default();
        for (name, tip) in &src_tips {
            match dst_tips.get(name) {
                None => diff.push(name, DiffKind::Added, Some(tip.archive.release), None),
                Some(current) if tip.archive.release > current.archive.release => diff.push(
                    name,
                    DiffKind::Modified,
                    Some(tip.archive.release),
                    Some(current.archive.release),
                ),
                Some(current) => diff.push(
                    name,
                    DiffKind::Unchanged,
                    Some(tip.archive.release),
                    Some(current.archive.release),
                ),
            }
        }
        Ok(diff)
    })?;

    info!(
        "Pulled {} into {}: {} added, {} updated",
        from,
        to,
        diff.count(DiffKind::Added),
        diff.count(DiffKind::Modified)
    );
    reindex(ctx, to)?;
    Ok(Some(JobResult::diff(diff)))
}

/// Make the links of `to` identical to those of `from`
pub(crate) fn sync(ctx: &Context, from: &str, to: &str) -> Result<Option<JobResult>> {
    repo::ensure_writable(&ctx.config, to)?;

    let diff = ctx.db.transaction_with_removals(|tx, removals| {
        let src = Repository::get(tx, from)?;
        let dst = Repository::get(tx, to)?;
        let diff = Diff::between(
            &Diff::releases(src.tips(tx, &ctx.pool)?.values()),
            &Diff::releases(dst.tips(tx, &ctx.pool)?.values()),
        );

        let wanted = ctx.pool.linked_entries(tx, src.id)?;
        let present = ctx.pool.linked_entries(tx, dst.id)?;
        let wanted_ids: HashSet<i64> = wanted.iter().map(|e| e.id).collect();
        let stale: Vec<PoolEntry> = present
            .into_iter()
            .filter(|e| !wanted_ids.contains(&e.id))
            .collect();

        ctx.pool.link(tx, &dst, &wanted)?;
        ctx.pool.unlink(tx, &dst, &stale, removals)?;
        Ok(diff)
    })?;

    info!("Synced {} into {}", from, to);
    reindex(ctx, to)?;
    Ok(Some(JobResult::diff(diff)))
}

/// Name-level comparison of the two tips, `from` being the left side
pub(crate) fn compare(ctx: &Context, from: &str, to: &str) -> Result<Option<JobResult>> {
    let diff = ctx.db.transaction(|tx| {
        let src = Repository::get(tx, from)?;
        let dst = Repository::get(tx, to)?;
        Ok(Diff::between(
            &Diff::releases(src.tips(tx, &ctx.pool)?.values()),
            &Diff::releases(dst.tips(tx, &ctx.pool)?.values()),
        ))
    })?;
    Ok(Some(JobResult::diff(diff)))
}

/// Link the tip of one package from `from` into `to`
pub(crate) fn cherry_pick(ctx: &Context, from: &str, to: &str, package: &str) -> Result<Option<JobResult>> {
    repo::ensure_writable(&ctx.config, to)?;

    let diff = ctx.db.transaction(|tx| {
        let src = Repository::get(tx, from)?;
        let dst = Repository::get(tx, to)?;
        let src_entries = ctx.pool.linked_entries(tx, src.id)?;
        let tip = src
            .tips(tx, &ctx.pool)?
            .remove(package)
            .ok_or_else(|| Error::NotFound(format!("package {} in {}", package, from)))?;
        let current = dst.tips(tx, &ctx.pool)?.remove(package);

        let mut incoming = vec![tip.clone()];
        incoming.extend(deltas_into(&src_entries, &tip).cloned());
        ctx.pool.link(tx, &dst, &incoming)?;

        let mut diff = Diff::default();
        let left = Some(tip.archive.release);
        match current {
            None => diff.push(package, DiffKind::Added, left, None),
            Some(c) if c.archive.release == tip.archive.release => {
                diff.push(package, DiffKind::Unchanged, left, Some(c.archive.release))
            }
            Some(c) => diff.push(package, DiffKind::Modified, left, Some(c.archive.release)),
        }
        Ok(diff)
    })?;

    reindex(ctx, to)?;
    Ok(Some(JobResult::diff(diff)))
}

pub(crate) fn freeze(ctx: &Context, name: &str) -> Result<Option<JobResult>> {
    ctx.db.transaction(|tx| Repository::get(tx, name))?;
    repo::freeze(&ctx.config, name)?;
    Ok(None)
}

pub(crate) fn unfreeze(ctx: &Context, name: &str) -> Result<Option<JobResult>> {
    ctx.db.transaction(|tx| Repository::get(tx, name))?;
    repo::unfreeze(&ctx.config, name)?;
    Ok(None)
}

pub(crate) fn set_instant_transit(ctx: &Context, name: &str, enabled: bool) -> Result<Option<JobResult>> {
    repo::ensure_writable(&ctx.config, name)?;
    ctx.db.transaction(|tx| {
        let mut repo = Repository::get(tx, name)?;
        repo.set_instant_transit(tx, enabled)
    })?;
    Ok(None)
}
