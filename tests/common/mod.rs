// tests/common/mod.rs

//! Shared test utilities and helpers for integration tests.

#![allow(dead_code)]

use ferryd::archive::FilenameInspector;
use ferryd::delta::{DeltaBuilder, DeltaError, DeltaMetrics};
use ferryd::hash;
use ferryd::jobs::{Job, JobId, JobStatus};
use ferryd::pool::PoolEntry;
use ferryd::repo::Repository;
use ferryd::{Config, Manager};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tempfile::TempDir;

/// Delta builder that writes a small fixed delta, or fails as configured
pub struct CountingBuilder {
    failure: Option<DeltaError>,
    calls: AtomicUsize,
}

impl CountingBuilder {
    pub fn succeeding() -> Self {
        Self {
            failure: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing(error: DeltaError) -> Self {
        Self {
            failure: Some(error),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl DeltaBuilder for CountingBuilder {
    fn build(&self, old: &Path, new: &Path, output: &Path) -> Result<DeltaMetrics, DeltaError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = &self.failure {
            return Err(error.clone());
        }
        fs::create_dir_all(output.parent().unwrap())?;
        fs::write(output, format!("delta {} {}", old.display(), new.display()))?;
        Ok(DeltaMetrics::new(100, 100, 10))
    }
}

/// A manager rooted in a temporary directory
pub struct TestDaemon {
    pub temp: TempDir,
    pub config: Arc<Config>,
    pub manager: Manager,
    pub builder: Arc<CountingBuilder>,
}

impl TestDaemon {
    pub fn new() -> Self {
        Self::with_builder(CountingBuilder::succeeding())
    }

    pub fn with_builder(builder: CountingBuilder) -> Self {
        let temp = TempDir::new().unwrap();
        let mut config = Config::with_base_dir(temp.path().join("root"));
        config.workers.min_wait_ms = 10;
        config.workers.max_jitter_ms = 5;
        let config = Arc::new(config);
        let builder = Arc::new(builder);
        let manager =
            Manager::with_collaborators(config.clone(), Arc::new(FilenameInspector), builder.clone())
                .unwrap();
        Self {
            temp,
            config,
            manager,
            builder,
        }
    }

    /// Reopen the same base directory, as after a restart
    pub fn reopen(self) -> Self {
        let Self {
            temp,
            config,
            manager,
            builder,
        } = self;
        drop(manager);
        let manager =
            Manager::with_collaborators(config.clone(), Arc::new(FilenameInspector), builder.clone())
                .unwrap();
        Self {
            temp,
            config,
            manager,
            builder,
        }
    }

    /// Directory for archives waiting to be imported
    pub fn incoming(&self, name: &str) -> PathBuf {
        let dir = self.temp.path().join("incoming").join(name);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    pub fn run(&self) -> usize {
        self.manager.run_until_idle().unwrap()
    }

    /// Push a job through `submit`, drain the queue and return the job's final state
    pub fn run_job(&self, submit: impl FnOnce(&Manager) -> ferryd::Result<JobId>) -> Job {
        let id = submit(&self.manager).unwrap();
        self.run();
        self.manager.get_job(id).unwrap()
    }

    pub fn create_repo(&self, name: &str) {
        let job = self.run_job(|m| m.create_repo(name));
        assert_eq!(job.status, JobStatus::Completed, "{:?}", job.message);
    }

    /// Create `name` holding one archive per file name
    pub fn import(&self, name: &str, files: &[&str]) {
        let dir = self.incoming(name);
        for file in files {
            write_archive(&dir, file);
        }
        let job = self.run_job(|m| m.import(name, &dir));
        assert_eq!(job.status, JobStatus::Completed, "{:?}", job.message);
    }

    pub fn linked(&self, name: &str) -> Vec<PoolEntry> {
        let ctx = self.manager.context();
        ctx.db
            .transaction(|tx| {
                let repo = Repository::get(tx, name)?;
                ctx.pool.linked_entries(tx, repo.id)
            })
            .unwrap()
    }

    /// Linked entry names of `name`, sorted
    pub fn linked_names(&self, name: &str) -> Vec<String> {
        let mut names: Vec<String> = self.linked(name).iter().map(PoolEntry::name).collect();
        names.sort();
        names
    }

    pub fn entry(&self, name: &str) -> Option<PoolEntry> {
        let ctx = self.manager.context();
        ctx.db.transaction(|tx| ctx.pool.find_entry(tx, name)).unwrap()
    }

    pub fn repo_dir(&self, name: &str) -> PathBuf {
        self.config.repo_dir(name)
    }
}

/// Write an archive whose content is its own file name
pub fn write_archive(dir: &Path, file_name: &str) -> PathBuf {
    let path = dir.join(file_name);
    fs::write(&path, file_name).unwrap();
    path
}

/// Write a transit manifest listing `files` with the given digests
pub fn write_manifest(dir: &Path, manifest: &str, target: &str, files: &[(String, String)]) -> PathBuf {
    let mut content = format!("[manifest]\nversion = \"1.0\"\ntarget = \"{}\"\n", target);
    for (path, sha256) in files {
        content.push_str(&format!("\n[[file]]\npath = \"{}\"\nsha256 = \"{}\"\n", path, sha256));
    }
    let path = dir.join(manifest);
    fs::write(&path, content).unwrap();
    path
}

/// Drop an archive into `dir` and return its manifest line
pub fn stage_upload(dir: &Path, file_name: &str) -> (String, String) {
    let path = write_archive(dir, file_name);
    (file_name.to_string(), hash::sha256_file(&path).unwrap())
}

/// Read every published index artifact of a repository
pub fn published_index(repo_dir: &Path) -> Vec<(String, Vec<u8>)> {
    let mut files: Vec<(String, Vec<u8>)> = fs::read_dir(repo_dir)
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().starts_with("eopkg-index.xml"))
        .map(|e| {
            (
                e.file_name().to_string_lossy().into_owned(),
                fs::read(e.path()).unwrap(),
            )
        })
        .collect();
    files.sort();
    files
}
