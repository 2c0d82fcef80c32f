// src/db/mod.rs

//! Database access for ferryd
//!
//! The daemon keeps exactly one SQLite connection open. It lives behind a
//! writer mutex, and every unit of work runs as a `BEGIN IMMEDIATE`
//! transaction on it, which makes the transaction boundary the mutual
//! exclusion mechanism for all pool, repository and job state.
//!
//! Files are never deleted while a transaction is open. Code that drops rows
//! backing on-disk files queues the paths in a [`Removals`] list instead, and
//! [`Database::transaction_with_removals`] deletes them once the commit has
//! succeeded. A rolled back transaction leaves every file in place.

pub mod schema;

use crate::error::Result;
use parking_lot::Mutex;
use rusqlite::{Connection, Transaction, TransactionBehavior};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

/// The single shared database connection
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open (creating if needed) the database at `path` and apply migrations
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
        Self::configure(&conn)?;
        schema::migrate(&conn)?;
        debug!("Opened database at {:?}", path);

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open a private in-memory database (tests and tooling)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::configure(&conn)?;
        schema::migrate(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn configure(conn: &Connection) -> Result<()> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.busy_timeout(Duration::from_secs(30))?;
        Ok(())
    }

    /// Run `f` inside a write transaction, committing on `Ok` and rolling back on `Err`
    pub fn transaction<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T>,
    {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }

    /// Like [`Database::transaction`], deleting the queued files after a successful commit
    pub fn transaction_with_removals<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Transaction<'_>, &mut Removals) -> Result<T>,
    {
        let mut removals = Removals::default();
        let value = self.transaction(|tx| f(tx, &mut removals))?;
        removals.apply();
        Ok(value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Removal {
    File(PathBuf),
    /// Removed only when empty
    Dir(PathBuf),
    Tree(PathBuf),
}

/// Filesystem deletions waiting for the surrounding transaction to commit
#[derive(Debug, Default)]
pub struct Removals {
    pending: Vec<Removal>,
}

impl Removals {
    pub fn file(&mut self, path: impl Into<PathBuf>) {
        self.pending.push(Removal::File(path.into()));
    }

    /// Remove a directory if nothing is left in it
    pub fn empty_dir(&mut self, path: impl Into<PathBuf>) {
        self.pending.push(Removal::Dir(path.into()));
    }

    pub fn tree(&mut self, path: impl Into<PathBuf>) {
        self.pending.push(Removal::Tree(path.into()));
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Delete everything queued, in order
    ///
    /// The rows are already gone at this point, so failures are logged and
    /// left for a later rescan.
    pub fn apply(self) {
        for removal in self.pending {
            let (path, result) = match &removal {
                Removal::File(path) => (path, fs::remove_file(path)),
                Removal::Dir(path) => match fs::remove_dir(path) {
                    Err(e) if e.kind() == io::ErrorKind::DirectoryNotEmpty => {
                        debug!("Keeping non-empty directory {}", path.display());
                        continue;
                    }
                    result => (path, result),
                },
                Removal::Tree(path) => (path, fs::remove_dir_all(path)),
            };
            match result {
                Ok(()) => debug!("Removed {}", path.display()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!("Failed to remove {}: {}", path.display(), e),
            }
        }
    }
}
