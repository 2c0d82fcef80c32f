// src/delta/mod.rs

//! Delta production
//!
//! For one package inside a repository, every older linked release gets a
//! delta straight to the tip release. Pairs the builder reports as pointless
//! or mismatched are remembered in `delta_failures` and never attempted
//! again, in any repository.
//!
//! Database reads and writes happen in short transactions; the build itself
//! runs outside of any transaction so that other workers are not blocked.
//! Every build writes into its own scratch directory under
//! `deltas/<repo>/`, so two jobs racing on the same pair never share a file.

mod builder;
mod metrics;

pub use builder::{DeltaBuilder, DeltaError, ZstdDeltaBuilder, apply_delta};
pub use metrics::DeltaMetrics;

use crate::archive::{Archive, delta_id};
use crate::config::Config;
use crate::db::Database;
use crate::error::{Error, Result};
use crate::hash;
use crate::pool::{Pool, PoolEntry};
use crate::repo::{self, Repository};
use rusqlite::{OptionalExtension, Transaction, params};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Has this delta id been recorded as permanently infeasible?
pub fn is_failed(tx: &Transaction, id: &str) -> Result<bool> {
    let found = tx
        .query_row("SELECT 1 FROM delta_failures WHERE name = ?1", [id], |_| Ok(()))
        .optional()?;
    Ok(found.is_some())
}

/// Remember a permanently infeasible delta id
pub fn record_failure(tx: &Transaction, id: &str, reason: &str) -> Result<()> {
    tx.execute(
        "INSERT OR IGNORE INTO delta_failures (name, reason, recorded_at) VALUES (?1, ?2, ?3)",
        params![id, reason, chrono::Utc::now().to_rfc3339()],
    )?;
    Ok(())
}

/// Everything `DeltaProducer::produce` did for one package
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeltaOutcome {
    /// Delta ids newly linked into the repository
    pub linked: Vec<String>,
    /// Delta ids newly recorded as infeasible
    pub failed: Vec<String>,
}

/// What to do about one (old, tip) pair
enum Plan {
    Skip,
    Linked(String),
    Build(PoolEntry),
}

/// Computes and links missing deltas
pub struct DeltaProducer {
    config: Arc<Config>,
    pool: Pool,
    builder: Arc<dyn DeltaBuilder>,
}

impl DeltaProducer {
    pub fn new(config: Arc<Config>, pool: Pool, builder: Arc<dyn DeltaBuilder>) -> Self {
        Self {
            config,
            pool,
            builder,
        }
    }

    /// Ensure every older release of `package` in `repo_name` has a delta to the tip
    pub fn produce(&self, db: &Database, repo_name: &str, package: &str) -> Result<DeltaOutcome> {
        repo::ensure_writable(&self.config, repo_name)?;

        let releases = db.transaction(|tx| {
            let repo = Repository::get(tx, repo_name)?;
            self.pool.linked_releases(tx, repo.id, package)
        })?;

        let mut outcome = DeltaOutcome::default();
        let Some(tip) = releases.last() else {
            debug!("No releases of {} in {}", package, repo_name);
            return Ok(outcome);
        };

        for old in releases.iter().filter(|old| old.archive.release < tip.archive.release) {
            let id = delta_id(&old.archive, &tip.archive);

            let plan = db.transaction(|tx| {
                if is_failed(tx, &id)? {
                    return Ok(Plan::Skip);
                }
                let repo = Repository::get(tx, repo_name)?;
                let Some(entry) = self.pool.find_entry(tx, &id)? else {
                    return Ok(Plan::Build(old.clone()));
                };
                if self.pool.is_linked(tx, repo.id, entry.id)? {
                    return Ok(Plan::Skip);
                }
                self.pool.link(tx, &repo, &[entry])?;
                Ok(Plan::Linked(id.clone()))
            })?;

            match plan {
                Plan::Skip => debug!("Skipping delta {}", id),
                Plan::Linked(id) => {
                    debug!("Linked existing delta {} into {}", id, repo_name);
                    outcome.linked.push(id);
                }
                Plan::Build(old) => {
                    if let Some(id) = self.build(db, repo_name, &old, tip, &id, &mut outcome)? {
                        outcome.linked.push(id);
                    }
                }
            }
        }

        info!(
            "Deltas for {} in {}: {} linked, {} infeasible",
            package,
            repo_name,
            outcome.linked.len(),
            outcome.failed.len()
        );
        Ok(outcome)
    }

    fn build(
        &self,
        db: &Database,
        repo_name: &str,
        old: &PoolEntry,
        tip: &PoolEntry,
        id: &str,
        outcome: &mut DeltaOutcome,
    ) -> Result<Option<String>> {
        let delta_dir = self.config.delta_dir(repo_name);
        fs::create_dir_all(&delta_dir)?;
        // Removed with everything in it when dropped
        let workdir = tempfile::Builder::new()
            .prefix(&format!("{}.", id))
            .tempdir_in(&delta_dir)?;
        let scratch = workdir.path().join(id);

        let built = self.builder.build(
            &self.pool.entry_path(&old.archive),
            &self.pool.entry_path(&tip.archive),
            &scratch,
        );

        match built {
            Ok(metrics) => {
                debug!("Built {} ({} bytes)", id, metrics.delta_size);
            }
            Err(e) if e.is_permanent() => {
                warn!("Delta {} is not feasible: {}", id, e);
                db.transaction(|tx| record_failure(tx, id, &e.to_string()))?;
                outcome.failed.push(id.to_string());
                return Ok(None);
            }
            Err(e) => {
                return Err(Error::DeltaError(format!("{}: {}", id, e)));
            }
        }

        let linked = self.ingest_built(db, repo_name, old, tip, &scratch)?;
        if !linked {
            debug!("Another worker linked {} into {} first", id, repo_name);
        }
        Ok(linked.then(|| id.to_string()))
    }

    /// Store a freshly built delta and link it, tolerating a concurrent insertion
    fn ingest_built(
        &self,
        db: &Database,
        repo_name: &str,
        old: &PoolEntry,
        tip: &PoolEntry,
        scratch: &Path,
    ) -> Result<bool> {
        let digests = hash::digest_file(scratch)?;
        let archive = Archive::delta_of(&old.archive, &tip.archive, digests);

        db.transaction(|tx| {
            let repo = Repository::get(tx, repo_name)?;
            let entry = match self.pool.ingest(tx, scratch, &archive) {
                Ok(entry) => entry,
                Err(Error::PoolConflict { name, .. }) => {
                    debug!("Another worker stored {} first", name);
                    self.pool.get_entry(tx, &name)?
                }
                Err(e) => return Err(e),
            };
            Ok(self.pool.link(tx, &repo, &[entry])? > 0)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::{ArchiveInspector, FilenameInspector};
    use parking_lot::Mutex;
    use std::thread;
    use std::time::Duration;
    use tempfile::TempDir;

    /// Writes a fixed delta or fails the way it is told to, counting calls
    struct ScriptedBuilder {
        result: std::result::Result<(), DeltaError>,
        calls: Mutex<usize>,
    }

    impl DeltaBuilder for ScriptedBuilder {
        fn build(&self, _old: &Path, _new: &Path, output: &Path) -> std::result::Result<DeltaMetrics, DeltaError> {
            *self.calls.lock() += 1;
            self.result.clone()?;
            fs::create_dir_all(output.parent().unwrap())?;
            fs::write(output, b"delta")?;
            Ok(DeltaMetrics::new(10, 10, 5))
        }
    }

    /// Lingers after writing so that concurrent builds of one pair overlap
    struct SlowBuilder;

    impl DeltaBuilder for SlowBuilder {
        fn build(&self, _old: &Path, _new: &Path, output: &Path) -> std::result::Result<DeltaMetrics, DeltaError> {
            fs::write(output, b"delta")?;
            thread::sleep(Duration::from_millis(150));
            Ok(DeltaMetrics::new(10, 10, 5))
        }
    }

    fn setup(result: std::result::Result<(), DeltaError>) -> (TempDir, Arc<Config>, Database, Pool, Arc<ScriptedBuilder>) {
        let temp = TempDir::new().unwrap();
        let config = Arc::new(Config::with_base_dir(temp.path()));
        config.ensure_layout().unwrap();
        let db = Database::open_in_memory().unwrap();
        let pool = Pool::new(&config);
        let builder = Arc::new(ScriptedBuilder {
            result,
            calls: Mutex::new(0),
        });

        db.transaction(|tx| {
            let repo = Repository::create(tx, &config, "main")?;
            for file_name in ["nano-1.0-1-1-x86_64.eopkg", "nano-1.1-2-1-x86_64.eopkg", "nano-1.2-3-1-x86_64.eopkg"] {
                let path = temp.path().join(file_name);
                fs::write(&path, file_name).unwrap();
                let archive = FilenameInspector.inspect(&path)?;
                let entry = pool.ingest(tx, &path, &archive)?;
                pool.link(tx, &repo, &[entry])?;
            }
            Ok(())
        })
        .unwrap();

        (temp, config, db, pool, builder)
    }

    #[test]
    fn test_produces_deltas_to_tip() {
        let (_temp, config, db, pool, builder) = setup(Ok(()));
        let producer = DeltaProducer::new(config.clone(), pool.clone(), builder.clone());

        let outcome = producer.produce(&db, "main", "nano").unwrap();
        assert_eq!(
            outcome.linked,
            vec!["nano-1-3-1-x86_64.delta.eopkg", "nano-2-3-1-x86_64.delta.eopkg"]
        );
        assert_eq!(*builder.calls.lock(), 2);
        assert_eq!(fs::read_dir(config.delta_dir("main")).unwrap().count(), 0);

        // Everything already present: nothing is built or linked again
        let again = producer.produce(&db, "main", "nano").unwrap();
        assert!(again.linked.is_empty());
        assert_eq!(*builder.calls.lock(), 2);

        db.transaction(|tx| {
            let repo = Repository::get(tx, "main")?;
            assert_eq!(pool.linked_deltas(tx, repo.id, "nano")?.len(), 2);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_failures_are_memoized() {
        let pointless = DeltaError::Pointless {
            delta_size: 10,
            new_size: 10,
        };
        let (_temp, config, db, pool, builder) = setup(Err(pointless));
        let producer = DeltaProducer::new(config, pool, builder.clone());

        let outcome = producer.produce(&db, "main", "nano").unwrap();
        assert!(outcome.linked.is_empty());
        assert_eq!(outcome.failed.len(), 2);
        assert_eq!(*builder.calls.lock(), 2);

        producer.produce(&db, "main", "nano").unwrap();
        assert_eq!(*builder.calls.lock(), 2);

        let failed = db
            .transaction(|tx| is_failed(tx, "nano-1-3-1-x86_64.delta.eopkg"))
            .unwrap();
        assert!(failed);
    }

    #[test]
    fn test_build_error_fails_job() {
        let (_temp, config, db, pool, builder) = setup(Err(DeltaError::Failed("disk".into())));
        let producer = DeltaProducer::new(config, pool, builder);

        let result = producer.produce(&db, "main", "nano");
        assert!(matches!(result, Err(Error::DeltaError(_))));
        let failed = db
            .transaction(|tx| is_failed(tx, "nano-1-3-1-x86_64.delta.eopkg"))
            .unwrap();
        assert!(!failed);
    }

    #[test]
    fn test_concurrent_producers_share_the_work() {
        let (_temp, config, db, pool, _builder) = setup(Ok(()));
        let producer = DeltaProducer::new(config.clone(), pool.clone(), Arc::new(SlowBuilder));

        let (first, second) = thread::scope(|scope| {
            let first = scope.spawn(|| producer.produce(&db, "main", "nano"));
            thread::sleep(Duration::from_millis(50));
            let second = scope.spawn(|| producer.produce(&db, "main", "nano"));
            (first.join().unwrap(), second.join().unwrap())
        });
        let first = first.unwrap();
        let second = second.unwrap();

        let mut linked: Vec<String> = first.linked.into_iter().chain(second.linked).collect();
        linked.sort();
        assert_eq!(
            linked,
            vec!["nano-1-3-1-x86_64.delta.eopkg", "nano-2-3-1-x86_64.delta.eopkg"]
        );
        assert!(first.failed.is_empty() && second.failed.is_empty());
        assert_eq!(fs::read_dir(config.delta_dir("main")).unwrap().count(), 0);

        db.transaction(|tx| {
            let repo = Repository::get(tx, "main")?;
            let deltas = pool.linked_deltas(tx, repo.id, "nano")?;
            assert_eq!(deltas.len(), 2);
            assert!(deltas.iter().all(|d| d.refcount == 1));
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_unknown_package_is_a_no_op() {
        let (_temp, config, db, pool, builder) = setup(Ok(()));
        let producer = DeltaProducer::new(config, pool, builder.clone());
        assert_eq!(producer.produce(&db, "main", "vim").unwrap(), DeltaOutcome::default());
        assert_eq!(*builder.calls.lock(), 0);
    }
}
