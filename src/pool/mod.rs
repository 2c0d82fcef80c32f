// src/pool/mod.rs

//! Package pool
//!
//! Every archive is stored exactly once under `pool/<prefix>/<name>/<file>`
//! and tracked by a `pool_entries` row carrying the number of repositories
//! that link it. Repositories expose entries through hardlinks (or copies
//! across filesystems) at the same relative path under `repos/<name>/`.
//!
//! All operations take the caller's transaction so that the link rows and
//! refcounts commit together with whatever else the job changed. Files whose
//! rows are dropped are queued on the caller's [`Removals`] and only deleted
//! after that transaction commits.

use crate::archive::Archive;
use crate::config::Config;
use crate::db::Removals;
use crate::error::{Error, Result};
use crate::repo::Repository;
use rusqlite::{OptionalExtension, Row, Transaction, params};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const ENTRY_COLUMNS: &str = "id, name, package, source, version, release_number, dist_release,
     from_release, architecture, size, sha1, sha256, refcount";

/// A stored archive and its refcount
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolEntry {
    pub id: i64,
    pub archive: Archive,
    pub refcount: i64,
}

impl PoolEntry {
    /// Pool key, the canonical file name
    pub fn name(&self) -> String {
        self.archive.id()
    }

    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        let size: i64 = row.get(9)?;
        Ok(Self {
            id: row.get(0)?,
            archive: Archive {
                name: row.get(2)?,
                source: row.get(3)?,
                version: row.get(4)?,
                release: row.get(5)?,
                dist_release: row.get(6)?,
                from_release: row.get(7)?,
                architecture: row.get(8)?,
                size: size as u64,
                sha1: row.get(10)?,
                sha256: row.get(11)?,
            },
            refcount: row.get(12)?,
        })
    }
}

/// On-disk store of deduplicated archives
#[derive(Debug, Clone)]
pub struct Pool {
    pool_dir: PathBuf,
    repos_dir: PathBuf,
}

impl Pool {
    pub fn new(config: &Config) -> Self {
        Self {
            pool_dir: config.pool_dir(),
            repos_dir: config.repos_dir(),
        }
    }

    /// Location of an archive inside the pool
    pub fn entry_path(&self, archive: &Archive) -> PathBuf {
        self.pool_dir.join(archive.relative_path())
    }

    /// Location of an archive inside a repository tree
    pub fn repo_path(&self, repo: &str, archive: &Archive) -> PathBuf {
        self.repos_dir.join(repo).join(archive.relative_path())
    }

    /// Look up an entry by name, failing with `NotFound`
    pub fn get_entry(&self, tx: &Transaction, name: &str) -> Result<PoolEntry> {
        self.find_entry(tx, name)?
            .ok_or_else(|| Error::NotFound(format!("pool entry {}", name)))
    }

    pub fn find_entry(&self, tx: &Transaction, name: &str) -> Result<Option<PoolEntry>> {
        let sql = format!("SELECT {} FROM pool_entries WHERE name = ?1", ENTRY_COLUMNS);
        Ok(tx.query_row(&sql, [name], PoolEntry::from_row).optional()?)
    }

    /// Store the archive at `path` in the pool with refcount 0
    ///
    /// Ingesting an id that already exists returns the existing entry when the
    /// content matches and fails with `PoolConflict` otherwise.
    pub fn ingest(&self, tx: &Transaction, path: &Path, archive: &Archive) -> Result<PoolEntry> {
        let name = archive.id();
        if let Some(existing) = self.find_entry(tx, &name)? {
            if existing.archive.sha256 == archive.sha256 {
                debug!("Pool already holds {}", name);
                return Ok(existing);
            }
            return Err(Error::PoolConflict {
                name,
                expected: existing.archive.sha256,
                actual: archive.sha256.clone(),
            });
        }

        let target = self.entry_path(archive);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        let temp_path = target.with_extension("tmp");
        fs::copy(path, &temp_path)?;
        fs::rename(&temp_path, &target)?;

        let inserted = tx.execute(
            "INSERT INTO pool_entries (name, package, source, version, release_number, dist_release,
             from_release, architecture, size, sha1, sha256, refcount, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, 0, ?12)",
            params![
                name,
                archive.name,
                archive.source,
                archive.version,
                archive.release,
                archive.dist_release,
                archive.from_release,
                archive.architecture,
                archive.size as i64,
                archive.sha1,
                archive.sha256,
                chrono::Utc::now().to_rfc3339(),
            ],
        );
        if let Err(e) = inserted {
            let _ = fs::remove_file(&target);
            return Err(e.into());
        }

        info!("Ingested {} into the pool", name);
        self.get_entry(tx, &name)
    }

    /// Link entries into a repository, returning how many were newly linked
    pub fn link(&self, tx: &Transaction, repo: &Repository, entries: &[PoolEntry]) -> Result<usize> {
        let mut linked = 0;
        for entry in entries {
            if self.is_linked(tx, repo.id, entry.id)? {
                continue;
            }

            tx.execute(
                "INSERT INTO repo_entries (repo_id, entry_id, linked_at) VALUES (?1, ?2, ?3)",
                params![repo.id, entry.id, chrono::Utc::now().to_rfc3339()],
            )?;
            tx.execute(
                "UPDATE pool_entries SET refcount = refcount + 1 WHERE id = ?1",
                [entry.id],
            )?;

            self.place(repo, &entry.archive)?;
            debug!("Linked {} into {}", entry.name(), repo.name);
            linked += 1;
        }
        Ok(linked)
    }

    /// Drop entries from a repository; entries nobody links any more are deleted
    pub fn unlink(
        &self,
        tx: &Transaction,
        repo: &Repository,
        entries: &[PoolEntry],
        removals: &mut Removals,
    ) -> Result<usize> {
        let mut unlinked = 0;
        for entry in entries {
            let removed = tx.execute(
                "DELETE FROM repo_entries WHERE repo_id = ?1 AND entry_id = ?2",
                params![repo.id, entry.id],
            )?;
            if removed == 0 {
                continue;
            }

            removals.file(self.repo_path(&repo.name, &entry.archive));
            tx.execute(
                "UPDATE pool_entries SET refcount = refcount - 1 WHERE id = ?1",
                [entry.id],
            )?;

            let refcount: i64 = tx.query_row(
                "SELECT refcount FROM pool_entries WHERE id = ?1",
                [entry.id],
                |row| row.get(0),
            )?;
            if refcount == 0 {
                self.delete_entry(tx, entry, removals)?;
            }

            debug!("Unlinked {} from {}", entry.name(), repo.name);
            unlinked += 1;
        }
        Ok(unlinked)
    }

    pub fn is_linked(&self, tx: &Transaction, repo_id: i64, entry_id: i64) -> Result<bool> {
        let found = tx
            .query_row(
                "SELECT 1 FROM repo_entries WHERE repo_id = ?1 AND entry_id = ?2",
                params![repo_id, entry_id],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Every entry linked into a repository, packages and deltas, by id
    pub fn linked_entries(&self, tx: &Transaction, repo_id: i64) -> Result<Vec<PoolEntry>> {
        let sql = format!(
            "SELECT {} FROM pool_entries
             WHERE id IN (SELECT entry_id FROM repo_entries WHERE repo_id = ?1)
             ORDER BY id ASC",
            ENTRY_COLUMNS
        );
        let mut stmt = tx.prepare(&sql)?;
        let entries = stmt
            .query_map([repo_id], PoolEntry::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(entries)
    }

    /// Package releases of one name linked into a repository, oldest release first
    pub fn linked_releases(&self, tx: &Transaction, repo_id: i64, package: &str) -> Result<Vec<PoolEntry>> {
        let sql = format!(
            "SELECT {} FROM pool_entries
             WHERE package = ?2 AND from_release IS NULL
               AND id IN (SELECT entry_id FROM repo_entries WHERE repo_id = ?1)
             ORDER BY release_number ASC, id ASC",
            ENTRY_COLUMNS
        );
        let mut stmt = tx.prepare(&sql)?;
        let entries = stmt
            .query_map(params![repo_id, package], PoolEntry::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(entries)
    }

    /// Deltas of one name linked into a repository
    pub fn linked_deltas(&self, tx: &Transaction, repo_id: i64, package: &str) -> Result<Vec<PoolEntry>> {
        let sql = format!(
            "SELECT {} FROM pool_entries
             WHERE package = ?2 AND from_release IS NOT NULL
               AND id IN (SELECT entry_id FROM repo_entries WHERE repo_id = ?1)
             ORDER BY id ASC",
            ENTRY_COLUMNS
        );
        let mut stmt = tx.prepare(&sql)?;
        let entries = stmt
            .query_map(params![repo_id, package], PoolEntry::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(entries)
    }

    /// Recompute every refcount from the link rows, then drop unreferenced entries
    pub fn recount(&self, tx: &Transaction, removals: &mut Removals) -> Result<usize> {
        tx.execute(
            "UPDATE pool_entries SET refcount =
             (SELECT COUNT(*) FROM repo_entries WHERE entry_id = pool_entries.id)",
            [],
        )?;

        let sql = format!("SELECT {} FROM pool_entries WHERE refcount = 0", ENTRY_COLUMNS);
        let orphans = {
            let mut stmt = tx.prepare(&sql)?;
            stmt.query_map([], PoolEntry::from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?
        };
        for entry in &orphans {
            self.delete_entry(tx, entry, removals)?;
        }
        Ok(orphans.len())
    }

    /// Materialize an entry inside a repository tree if the file is missing
    pub fn restore(&self, repo: &Repository, archive: &Archive) -> Result<bool> {
        if self.repo_path(&repo.name, archive).exists() {
            return Ok(false);
        }
        self.place(repo, archive)?;
        Ok(true)
    }

    fn place(&self, repo: &Repository, archive: &Archive) -> Result<()> {
        let source = self.entry_path(archive);
        let target = self.repo_path(&repo.name, archive);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        remove_if_present(&target)?;

        match fs::hard_link(&source, &target) {
            Ok(()) => Ok(()),
            Err(e) => {
                debug!(
                    "Hardlink failed for {}, falling back to copy: {}",
                    source.display(),
                    e
                );
                fs::copy(&source, &target)?;
                Ok(())
            }
        }
    }

    fn delete_entry(&self, tx: &Transaction, entry: &PoolEntry, removals: &mut Removals) -> Result<()> {
        tx.execute("DELETE FROM pool_entries WHERE id = ?1", [entry.id])?;
        let path = self.entry_path(&entry.archive);
        removals.file(&path);
        if let Some(parent) = path.parent() {
            removals.empty_dir(parent);
        }
        info!("Removed {} from the pool", entry.name());
        Ok(())
    }
}

fn remove_if_present(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => {
            warn!("Failed to remove {}: {}", path.display(), e);
            Err(e.into())
        }
    }
}
