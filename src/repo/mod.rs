// src/repo/mod.rs

//! Repositories
//!
//! A repository is a named view over the pool: a `repositories` row, the
//! `repo_entries` links into the pool, and the published tree under
//! `repos/<name>/`. The frozen flag lives on disk as `repos/<name>/.frozen`
//! so that it survives independently of the database.

pub mod assets;
pub mod index;

use crate::config::Config;
use crate::db::Removals;
use crate::error::{Error, Result};
use crate::pool::{Pool, PoolEntry};
use rusqlite::{OptionalExtension, Row, Transaction, params};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::PathBuf;
use tracing::{info, warn};

pub use assets::Assets;
pub use index::Indexer;

/// Marker file whose presence freezes a repository
pub const FROZEN_MARKER: &str = ".frozen";

/// A repository record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Repository {
    pub id: i64,
    pub name: String,
    /// Transit uploads for any target are also linked here
    pub instant_transit: bool,
    pub created_at: String,
}

impl Repository {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            instant_transit: row.get::<_, i64>(2)? != 0,
            created_at: row.get(3)?,
        })
    }

    /// Create the record and its directories, failing with `RepoExists`
    pub fn create(tx: &Transaction, config: &Config, name: &str) -> Result<Self> {
        validate_name(name)?;
        if Self::find(tx, name)?.is_some() {
            return Err(Error::RepoExists(name.to_string()));
        }

        tx.execute(
            "INSERT INTO repositories (name, instant_transit, created_at) VALUES (?1, 0, ?2)",
            params![name, chrono::Utc::now().to_rfc3339()],
        )?;
        fs::create_dir_all(config.repo_dir(name))?;
        fs::create_dir_all(config.assets_dir(name))?;

        info!("Created repository {}", name);
        Self::get(tx, name)
    }

    /// Look up a repository, failing with `RepoNotFound`
    pub fn get(tx: &Transaction, name: &str) -> Result<Self> {
        Self::find(tx, name)?.ok_or_else(|| Error::RepoNotFound(name.to_string()))
    }

    pub fn find(tx: &Transaction, name: &str) -> Result<Option<Self>> {
        Ok(tx
            .query_row(
                "SELECT id, name, instant_transit, created_at FROM repositories WHERE name = ?1",
                [name],
                Self::from_row,
            )
            .optional()?)
    }

    /// All repositories by name
    pub fn list(tx: &Transaction) -> Result<Vec<Self>> {
        let mut stmt = tx.prepare(
            "SELECT id, name, instant_transit, created_at FROM repositories ORDER BY name ASC",
        )?;
        let repos = stmt
            .query_map([], Self::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(repos)
    }

    /// Repositories receiving every transit upload
    pub fn instant_transit(tx: &Transaction) -> Result<Vec<Self>> {
        Ok(Self::list(tx)?
            .into_iter()
            .filter(|r| r.instant_transit)
            .collect())
    }

    pub fn set_instant_transit(&mut self, tx: &Transaction, enabled: bool) -> Result<()> {
        tx.execute(
            "UPDATE repositories SET instant_transit = ?1 WHERE id = ?2",
            params![enabled as i64, self.id],
        )?;
        self.instant_transit = enabled;
        info!("Instant transit for {} is now {}", self.name, enabled);
        Ok(())
    }

    /// Drop every pool reference and the record, queueing the published tree
    ///
    /// Operator assets are kept.
    pub fn delete(self, tx: &Transaction, config: &Config, pool: &Pool, removals: &mut Removals) -> Result<()> {
        let entries = pool.linked_entries(tx, self.id)?;
        pool.unlink(tx, &self, &entries, removals)?;
        tx.execute("DELETE FROM repositories WHERE id = ?1", [self.id])?;

        removals.tree(config.repo_dir(&self.name));
        removals.tree(config.delta_dir(&self.name));

        info!("Deleted repository {} ({} links dropped)", self.name, entries.len());
        Ok(())
    }

    /// Distinct package names with at least one release linked
    pub fn package_names(&self, tx: &Transaction) -> Result<Vec<String>> {
        let mut stmt = tx.prepare(
            "SELECT DISTINCT p.package FROM pool_entries p
             JOIN repo_entries r ON r.entry_id = p.id
             WHERE r.repo_id = ?1 AND p.from_release IS NULL
             ORDER BY p.package ASC",
        )?;
        let names = stmt
            .query_map([self.id], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(names)
    }

    /// Newest linked release of every package name
    pub fn tips(&self, tx: &Transaction, pool: &Pool) -> Result<BTreeMap<String, PoolEntry>> {
        let mut tips: BTreeMap<String, PoolEntry> = BTreeMap::new();
        for entry in pool.linked_entries(tx, self.id)? {
            if entry.archive.is_delta() {
                continue;
            }
            let newer = tips
                .get(&entry.archive.name)
                .is_none_or(|tip| entry.archive.release > tip.archive.release);
            if newer {
                tips.insert(entry.archive.name.clone(), entry);
            }
        }
        Ok(tips)
    }
}

fn validate_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(Error::InvalidJob(format!("invalid repository name '{}'", name)))
    }
}

fn frozen_marker(config: &Config, name: &str) -> PathBuf {
    config.repo_dir(name).join(FROZEN_MARKER)
}

pub fn is_frozen(config: &Config, name: &str) -> bool {
    frozen_marker(config, name).exists()
}

/// Fail with `Frozen` when the repository rejects mutations
pub fn ensure_writable(config: &Config, name: &str) -> Result<()> {
    if is_frozen(config, name) {
        return Err(Error::Frozen(name.to_string()));
    }
    Ok(())
}

pub fn freeze(config: &Config, name: &str) -> Result<()> {
    let marker = frozen_marker(config, name);
    if let Some(parent) = marker.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(&marker, chrono::Utc::now().to_rfc3339())?;
    info!("Froze repository {}", name);
    Ok(())
}

pub fn unfreeze(config: &Config, name: &str) -> Result<()> {
    match fs::remove_file(frozen_marker(config, name)) {
        Ok(()) => info!("Unfroze repository {}", name),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            warn!("Repository {} was not frozen", name);
        }
        Err(e) => return Err(e.into()),
    }
    Ok(())
}
