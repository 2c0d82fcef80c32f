// src/jobs/handlers/mod.rs

//! Per-kind job handlers

pub(crate) mod deltas;
pub(crate) mod packages;
pub(crate) mod repos;
pub(crate) mod transit;

use crate::diff::{JobResult, ResultBody};
use crate::error::Result;
use crate::manager::Context;
use crate::pool::PoolEntry;
use crate::repo::index::IndexSummary;

/// Publish the index of `repo` as part of a larger job
fn reindex(ctx: &Context, repo: &str) -> Result<IndexSummary> {
    ctx.indexer.emit(&ctx.db, repo)
}

fn index_result(summary: &IndexSummary) -> JobResult {
    JobResult::new(ResultBody::Index {
        packages: summary.packages,
        deltas: summary.deltas,
    })
}

/// Deltas among `entries` leading to `tip`
fn deltas_into<'a>(entries: &'a [PoolEntry], tip: &PoolEntry) -> impl Iterator<Item = &'a PoolEntry> + use<'a> {
    let name = tip.archive.name.clone();
    let release = tip.archive.release;
    entries
        .iter()
        .filter(move |e| e.archive.is_delta() && e.archive.name == name && e.archive.release == release)
}
