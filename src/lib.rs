// src/lib.rs

//! ferryd repository daemon
//!
//! Maintains package repositories for eopkg clients on top of a
//! deduplicating, refcounted archive pool.
//!
//! # Architecture
//!
//! - Database-first: jobs, repositories and pool entries live in SQLite
//! - Every mutation is a job, claimed by a worker from the job store
//! - Sequential jobs run one at a time; parallel jobs run alongside them
//! - Repository indexes are published atomically, with checksum sidecars
//! - Deltas between releases are built on demand; infeasible pairs are remembered

pub mod archive;
pub mod compression;
pub mod config;
pub mod db;
pub mod delta;
pub mod diff;
mod error;
pub mod hash;
pub mod jobs;
pub mod lock;
pub mod manager;
pub mod pool;
pub mod repo;
pub mod transit;

pub use config::Config;
pub use error::{Error, Result};
pub use jobs::{Job, JobId, JobKind, JobStatus};
pub use manager::Manager;
