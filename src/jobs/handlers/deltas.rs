// src/jobs/handlers/deltas.rs

//! Index and delta jobs

use super::{index_result, reindex};
use crate::delta::DeltaOutcome;
use crate::diff::{JobResult, ResultBody};
use crate::error::Result;
use crate::jobs::{Job, JobKind};
use crate::manager::Context;
use crate::repo::{self, Repository};
use tracing::info;

fn deltas_result(outcome: DeltaOutcome) -> JobResult {
    JobResult::new(ResultBody::Deltas {
        linked: outcome.linked,
        failed: outcome.failed,
    })
}

pub(crate) fn index(ctx: &Context, name: &str) -> Result<Option<JobResult>> {
    let summary = reindex(ctx, name)?;
    Ok(Some(index_result(&summary)))
}

/// Fan out one DeltaPackage job per package name
pub(crate) fn delta_repo(ctx: &Context, name: &str) -> Result<Option<JobResult>> {
    repo::ensure_writable(&ctx.config, name)?;
    let packages = ctx.db.transaction(|tx| {
        let repo = Repository::get(tx, name)?;
        repo.package_names(tx)
    })?;

    let ids = packages
        .iter()
        .map(|package| {
            ctx.jobs
                .push(Job::for_repo(JobKind::DeltaPackage, name).with_sources([package.as_str()]))
        })
        .collect::<Result<Vec<_>>>()?;

    info!("Queued delta jobs for {} packages in {}", ids.len(), name);
    Ok(Some(JobResult::new(ResultBody::Jobs { ids })))
}

pub(crate) fn delta_package(ctx: &Context, name: &str, package: &str) -> Result<Option<JobResult>> {
    let outcome = ctx.deltas.produce(&ctx.db, name, package)?;
    Ok(Some(deltas_result(outcome)))
}

/// Produce deltas for the listed packages, then queue an index if anything changed
pub(crate) fn delta_index(ctx: &Context, name: &str, packages: &[String]) -> Result<Option<JobResult>> {
    let mut outcome = DeltaOutcome::default();
    for package in packages {
        let produced = ctx.deltas.produce(&ctx.db, name, package)?;
        outcome.linked.extend(produced.linked);
        outcome.failed.extend(produced.failed);
    }

    if !outcome.linked.is_empty() {
        let id = ctx.jobs.push(Job::for_repo(JobKind::Index, name))?;
        info!(
            "Queued index job {} for {} after {} new deltas",
            id,
            name,
            outcome.linked.len()
        );
    }
    Ok(Some(deltas_result(outcome)))
}
