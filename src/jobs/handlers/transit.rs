// src/jobs/handlers/transit.rs

//! Processing of verified transit uploads

use super::reindex;
use crate::diff::{JobResult, ResultBody};
use crate::error::Result;
use crate::jobs::{Job, JobKind};
use crate::manager::Context;
use crate::repo::{self, Repository};
use crate::transit;
use std::collections::BTreeSet;
use std::fs;
use std::path::Path;
use tracing::{info, warn};

/// Ingest the payload of one manifest and publish it
///
/// The payload is linked into the manifest's target and into every other
/// repository with instant transit enabled. Frozen instant-transit
/// repositories are skipped; a frozen target fails the job.
pub(crate) fn process(ctx: &Context, manifest_path: &Path) -> Result<Option<JobResult>> {
    let manifest = transit::load_verified(manifest_path)?;
    let target = manifest.manifest.target.as_str();
    repo::ensure_writable(&ctx.config, target)?;

    let dir = manifest_path.parent().unwrap_or_else(|| Path::new("."));
    let payloads = manifest.payload_paths(dir);
    let archives = payloads
        .iter()
        .map(|path| ctx.inspector.inspect(path))
        .collect::<Result<Vec<_>>>()?;
    let packages: Vec<String> = archives
        .iter()
        .filter(|a| !a.is_delta())
        .map(|a| a.name.clone())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();

    let touched = ctx.db.transaction(|tx| {
        let mut repos = vec![Repository::get(tx, target)?];
        for extra in Repository::instant_transit(tx)? {
            if extra.name == target {
                continue;
            }
            if repo::is_frozen(&ctx.config, &extra.name) {
                warn!("Skipping frozen instant-transit repository {}", extra.name);
                continue;
            }
            repos.push(extra);
        }

        let entries = payloads
            .iter()
            .zip(&archives)
            .map(|(path, archive)| ctx.pool.ingest(tx, path, archive))
            .collect::<Result<Vec<_>>>()?;
        for repo in &repos {
            let linked = ctx.pool.link(tx, repo, &entries)?;
            info!("Linked {} transit archives into {}", linked, repo.name);
        }
        Ok(repos.into_iter().map(|r| r.name).collect::<Vec<_>>())
    })?;

    for name in &touched {
        reindex(ctx, name)?;
    }

    for path in payloads.iter().chain(std::iter::once(&manifest_path.to_path_buf())) {
        if let Err(e) = fs::remove_file(path) {
            warn!("Failed to remove transit file {}: {}", path.display(), e);
        }
    }

    let ids = if packages.is_empty() {
        Vec::new()
    } else {
        touched
            .iter()
            .map(|name| {
                ctx.jobs
                    .push(Job::for_repo(JobKind::DeltaIndex, name).with_sources(packages.iter()))
            })
            .collect::<Result<Vec<_>>>()?
    };

    info!(
        "Processed transit manifest {} for {} ({} repositories touched)",
        manifest_path.display(),
        target,
        touched.len()
    );
    Ok(Some(JobResult::new(ResultBody::Jobs { ids })))
}
