// src/db/schema.rs

//! Database schema definitions and migrations for ferryd
//!
//! This module defines the SQLite schema for the job queue, the package pool
//! and repository links, and applies migrations in order to evolve it.

use crate::error::{Error, Result};
use rusqlite::Connection;
use tracing::{debug, info};

/// Current schema version
pub const SCHEMA_VERSION: i32 = 1;

/// Initialize the schema version tracking table
fn init_schema_version(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;
    Ok(())
}

/// Get the current schema version from the database
pub fn get_schema_version(conn: &Connection) -> Result<i32> {
    init_schema_version(conn)?;

    let version = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )?;

    Ok(version)
}

/// Set the schema version
fn set_schema_version(conn: &Connection, version: i32) -> Result<()> {
    conn.execute(
        "INSERT INTO schema_version (version) VALUES (?1)",
        [version],
    )?;
    Ok(())
}

/// Apply all pending migrations to bring the database up to date
pub fn migrate(conn: &Connection) -> Result<()> {
    let current_version = get_schema_version(conn)?;
    debug!("Current schema version: {}", current_version);

    if current_version >= SCHEMA_VERSION {
        return Ok(());
    }

    for version in (current_version + 1)..=SCHEMA_VERSION {
        info!("Applying migration to version {}", version);
        apply_migration(conn, version)?;
        set_schema_version(conn, version)?;
    }

    info!(
        "Schema migration complete. Now at version {}",
        SCHEMA_VERSION
    );
    Ok(())
}

/// Apply a specific migration version
fn apply_migration(conn: &Connection, version: i32) -> Result<()> {
    match version {
        1 => migrate_v1(conn),
        _ => Err(Error::Config(format!("Unknown migration version: {}", version))),
    }
}

/// Initial schema - Version 1
///
/// - jobs: durable work queue
/// - repositories: named views
/// - pool_entries: physical archives with their refcount
/// - repo_entries: links from repositories into the pool
/// - delta_failures: permanently infeasible delta ids
fn migrate_v1(conn: &Connection) -> Result<()> {
    debug!("Creating schema version 1");

    conn.execute_batch(
        "
        CREATE TABLE jobs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            kind TEXT NOT NULL,
            src_repo TEXT,
            dst_repo TEXT,
            sources TEXT NOT NULL DEFAULT '',
            release_number INTEGER NOT NULL DEFAULT 0,
            max_keep INTEGER NOT NULL DEFAULT 0,
            created_at TEXT,
            claimed_at TEXT,
            started_at TEXT,
            finished_at TEXT,
            status INTEGER NOT NULL DEFAULT 0,
            message TEXT,
            result BLOB
        );

        CREATE INDEX idx_jobs_status ON jobs(status);

        CREATE TABLE repositories (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE,
            instant_transit INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL
        );

        CREATE TABLE pool_entries (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE,
            package TEXT NOT NULL,
            source TEXT NOT NULL,
            version TEXT NOT NULL,
            release_number INTEGER NOT NULL,
            dist_release INTEGER NOT NULL,
            from_release INTEGER,
            architecture TEXT NOT NULL,
            size INTEGER NOT NULL,
            sha1 TEXT NOT NULL,
            sha256 TEXT NOT NULL,
            refcount INTEGER NOT NULL DEFAULT 0 CHECK(refcount >= 0),
            created_at TEXT NOT NULL,
            CHECK(from_release IS NULL OR from_release < release_number)
        );

        CREATE INDEX idx_pool_entries_package ON pool_entries(package);

        CREATE TABLE repo_entries (
            repo_id INTEGER NOT NULL,
            entry_id INTEGER NOT NULL,
            linked_at TEXT NOT NULL,
            PRIMARY KEY (repo_id, entry_id),
            FOREIGN KEY (repo_id) REFERENCES repositories(id),
            FOREIGN KEY (entry_id) REFERENCES pool_entries(id)
        );

        CREATE INDEX idx_repo_entries_entry ON repo_entries(entry_id);

        CREATE TABLE delta_failures (
            name TEXT PRIMARY KEY,
            reason TEXT NOT NULL,
            recorded_at TEXT NOT NULL
        );
        ",
    )?;

    Ok(())
}
