// src/manager.rs

//! Repository manager
//!
//! The [`Manager`] owns one instance of every component and is the entry
//! point for the router and CLI layers. Those callers only ever enqueue jobs
//! and read job state; the workers are the only actors that change the pool
//! or a repository.

use crate::archive::{ArchiveInspector, FilenameInspector};
use crate::config::Config;
use crate::db::Database;
use crate::delta::{DeltaBuilder, DeltaProducer, ZstdDeltaBuilder};
use crate::error::Result;
use crate::jobs::{Job, JobId, JobKind, JobStore, worker};
use crate::pool::Pool;
use crate::repo::{Indexer, Repository};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Everything a running job can reach
pub struct Context {
    pub config: Arc<Config>,
    pub db: Arc<Database>,
    pub pool: Pool,
    pub indexer: Indexer,
    pub deltas: DeltaProducer,
    pub jobs: JobStore,
    pub inspector: Arc<dyn ArchiveInspector>,
}

impl Context {
    pub fn new(
        config: Arc<Config>,
        db: Arc<Database>,
        inspector: Arc<dyn ArchiveInspector>,
        builder: Arc<dyn DeltaBuilder>,
    ) -> Self {
        let pool = Pool::new(&config);
        Self {
            indexer: Indexer::new(config.clone(), pool.clone()),
            deltas: DeltaProducer::new(config.clone(), pool.clone(), builder),
            jobs: JobStore::new(db.clone()),
            pool,
            config,
            db,
            inspector,
        }
    }
}

/// The collaborator interface of the daemon
#[derive(Clone)]
pub struct Manager {
    ctx: Arc<Context>,
}

impl Manager {
    /// Open the state under the configured base directory with the default collaborators
    pub fn open(config: Arc<Config>) -> Result<Self> {
        let builder = Arc::new(ZstdDeltaBuilder::new(
            config.delta.level,
            config.delta.max_ratio,
        ));
        Self::with_collaborators(config, Arc::new(FilenameInspector), builder)
    }

    /// Open with a custom archive inspector and delta builder
    pub fn with_collaborators(
        config: Arc<Config>,
        inspector: Arc<dyn ArchiveInspector>,
        builder: Arc<dyn DeltaBuilder>,
    ) -> Result<Self> {
        config.ensure_layout()?;
        let db = Arc::new(Database::open(config.db_path())?);
        let ctx = Arc::new(Context::new(config, db, inspector, builder));

        let requeued = ctx.jobs.unclaim_running()?;
        info!(
            "Manager ready at {} ({} interrupted jobs requeued)",
            ctx.config.base_dir().display(),
            requeued
        );
        Ok(Self { ctx })
    }

    pub fn context(&self) -> Arc<Context> {
        self.ctx.clone()
    }

    fn push(&self, job: Job) -> Result<JobId> {
        self.ctx.jobs.push(job)
    }

    pub fn create_repo(&self, name: &str) -> Result<JobId> {
        self.push(Job::for_repo(JobKind::CreateRepo, name))
    }

    pub fn delete_repo(&self, name: &str) -> Result<JobId> {
        self.push(Job::for_repo(JobKind::DeleteRepo, name))
    }

    /// Import every archive found under `dir`, creating the repository if needed
    pub fn import(&self, name: &str, dir: &Path) -> Result<JobId> {
        self.push(
            Job::for_repo(JobKind::Import, name).with_sources([dir.to_string_lossy().into_owned()]),
        )
    }

    pub fn index(&self, name: &str) -> Result<JobId> {
        self.push(Job::for_repo(JobKind::Index, name))
    }

    pub fn delta(&self, name: &str) -> Result<JobId> {
        self.push(Job::for_repo(JobKind::Delta, name))
    }

    pub fn rescan(&self, name: &str) -> Result<JobId> {
        self.push(Job::for_repo(JobKind::Rescan, name))
    }

    pub fn check(&self, name: &str) -> Result<JobId> {
        self.push(Job::for_repo(JobKind::Check, name))
    }

    pub fn trim_packages(&self, name: &str, max_keep: i64) -> Result<JobId> {
        self.push(Job::for_repo(JobKind::TrimPackages, name).with_max_keep(max_keep))
    }

    pub fn trim_obsolete(&self, name: &str) -> Result<JobId> {
        self.push(Job::for_repo(JobKind::TrimObsolete, name))
    }

    /// Clone `src` into a new repository `dst`; `max_keep` 0 keeps every release
    pub fn clone_repo(&self, src: &str, dst: &str, max_keep: i64) -> Result<JobId> {
        self.push(Job::between(JobKind::CloneRepo, src, dst).with_max_keep(max_keep))
    }

    pub fn pull_repo(&self, src: &str, dst: &str) -> Result<JobId> {
        self.push(Job::between(JobKind::PullRepo, src, dst))
    }

    pub fn sync(&self, src: &str, dst: &str) -> Result<JobId> {
        self.push(Job::between(JobKind::Sync, src, dst))
    }

    pub fn compare(&self, src: &str, dst: &str) -> Result<JobId> {
        self.push(Job::between(JobKind::Compare, src, dst))
    }

    pub fn cherry_pick(&self, src: &str, dst: &str, package: &str) -> Result<JobId> {
        self.push(Job::between(JobKind::CherryPick, src, dst).with_sources([package]))
    }

    pub fn bulk_add(&self, name: &str, files: &[&Path]) -> Result<JobId> {
        self.push(
            Job::for_repo(JobKind::BulkAdd, name)
                .with_sources(files.iter().map(|f| f.to_string_lossy().into_owned())),
        )
    }

    pub fn copy_source(&self, src: &str, dst: &str, source: &str, release: i64) -> Result<JobId> {
        self.push(
            Job::between(JobKind::CopySource, src, dst)
                .with_sources([source])
                .with_release(release),
        )
    }

    pub fn remove_source(&self, name: &str, source: &str, release: i64) -> Result<JobId> {
        self.push(
            Job::for_repo(JobKind::RemoveSource, name)
                .with_sources([source])
                .with_release(release),
        )
    }

    pub fn freeze(&self, name: &str) -> Result<JobId> {
        self.push(Job::for_repo(JobKind::Freeze, name))
    }

    pub fn unfreeze(&self, name: &str) -> Result<JobId> {
        self.push(Job::for_repo(JobKind::Unfreeze, name))
    }

    pub fn set_instant_transit(&self, name: &str, enabled: bool) -> Result<JobId> {
        let kind = if enabled {
            JobKind::EnableInstantTransit
        } else {
            JobKind::DisableInstantTransit
        };
        self.push(Job::for_repo(kind, name))
    }

    pub fn cancel_job(&self, id: JobId) -> Result<()> {
        self.ctx.jobs.cancel(id)
    }

    pub fn get_job(&self, id: JobId) -> Result<Job> {
        self.ctx.jobs.get(id)
    }

    pub fn active_jobs(&self) -> Result<Vec<Job>> {
        self.ctx.jobs.active()
    }

    pub fn completed_jobs(&self) -> Result<Vec<Job>> {
        self.ctx.jobs.completed()
    }

    pub fn failed_jobs(&self) -> Result<Vec<Job>> {
        self.ctx.jobs.failed()
    }

    pub fn reset_completed(&self) -> Result<usize> {
        self.ctx.jobs.reset_completed()
    }

    pub fn reset_failed(&self) -> Result<usize> {
        self.ctx.jobs.reset_failed()
    }

    pub fn reset_queued(&self) -> Result<usize> {
        self.ctx.jobs.reset_queued()
    }

    /// Known repositories
    pub fn repositories(&self) -> Result<Vec<Repository>> {
        self.ctx.db.transaction(|tx| Repository::list(tx))
    }

    /// Execute queued jobs on the calling thread until none is ready
    pub fn run_until_idle(&self) -> Result<usize> {
        worker::drain(&self.ctx)
    }
}
