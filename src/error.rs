// src/error.rs

//! Error types for ferryd

use thiserror::Error;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the pool, repositories, jobs and the transit listener
#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("I/O error: {0}")]
    IoError(String),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Failed to parse TOML: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("XML error: {0}")]
    Xml(#[from] quick_xml::Error),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Invalid job: {0}")]
    InvalidJob(String),

    #[error("No job ready")]
    NoJobReady,

    #[error("Job {0} not found")]
    JobNotFound(i64),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Repository '{0}' does not exist")]
    RepoNotFound(String),

    #[error("Repository '{0}' already exists")]
    RepoExists(String),

    #[error("Repository '{0}' is frozen")]
    Frozen(String),

    #[error("Pool entry {name} conflicts with existing content (expected {expected}, got {actual})")]
    PoolConflict {
        name: String,
        expected: String,
        actual: String,
    },

    #[error("Checksum mismatch for {path}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        path: String,
        expected: String,
        actual: String,
    },

    #[error("Delta error: {0}")]
    DeltaError(String),

    #[error("Invalid transit manifest {path}: {reason}")]
    InvalidManifest { path: String, reason: String },

    #[error("Watch error: {0}")]
    Watch(#[from] notify::Error),

    #[error("Index publication failed: {0}")]
    IndexError(String),

    #[error("Lock file {path} is owned by running process {pid}")]
    OwnedLockFile { path: String, pid: i32 },

    #[error("Lock file {path} is unreadable or corrupt: {reason}")]
    DeadLockFile { path: String, reason: String },

    #[error("Configuration error: {0}")]
    Config(String),
}
