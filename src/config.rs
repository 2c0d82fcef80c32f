// src/config.rs
//! Daemon configuration
//!
//! Loaded once at startup from a TOML file and shared read-only as
//! `Arc<Config>`. Supports the following sections:
//! - [paths] - Base directory for the database, pool, repositories and transit
//! - [workers] - Worker count and poll timing
//! - [delta] - Delta generation tuning

use crate::error::{Error, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Name of the published index document
pub const INDEX_NAME: &str = "eopkg-index.xml";

/// Suffix identifying transit manifests
pub const MANIFEST_SUFFIX: &str = ".tram";

/// Extension every uploaded or pooled archive must carry
pub const PACKAGE_EXTENSION: &str = ".eopkg";

/// Extension carried by delta archives
pub const DELTA_EXTENSION: &str = ".delta.eopkg";

/// TOML configuration file structure
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Filesystem locations
    #[serde(default)]
    pub paths: PathsSection,

    /// Worker pool settings
    #[serde(default)]
    pub workers: WorkersSection,

    /// Delta settings
    #[serde(default)]
    pub delta: DeltaSection,
}

/// Paths configuration section
#[derive(Debug, Clone, Deserialize)]
pub struct PathsSection {
    /// Root directory holding all daemon state
    #[serde(default = "default_base_dir")]
    pub base_dir: PathBuf,
}

impl Default for PathsSection {
    fn default() -> Self {
        Self {
            base_dir: default_base_dir(),
        }
    }
}

fn default_base_dir() -> PathBuf {
    PathBuf::from("/srv/ferryd/root")
}

/// Worker configuration section
#[derive(Debug, Clone, Deserialize)]
pub struct WorkersSection {
    /// Number of workers (0 = half the available CPUs)
    #[serde(default)]
    pub count: usize,

    /// Minimum delay between polls, in milliseconds
    #[serde(default = "default_min_wait_ms")]
    pub min_wait_ms: u64,

    /// Upper bound of the random delay added to each poll, in milliseconds
    #[serde(default = "default_max_jitter_ms")]
    pub max_jitter_ms: u64,
}

impl Default for WorkersSection {
    fn default() -> Self {
        Self {
            count: 0,
            min_wait_ms: default_min_wait_ms(),
            max_jitter_ms: default_max_jitter_ms(),
        }
    }
}

fn default_min_wait_ms() -> u64 {
    2000
}

fn default_max_jitter_ms() -> u64 {
    1000
}

/// Delta configuration section
#[derive(Debug, Clone, Deserialize)]
pub struct DeltaSection {
    /// Deltas at or above this fraction of the full archive are pointless
    #[serde(default = "default_max_delta_ratio")]
    pub max_ratio: f64,

    /// zstd level used by the default delta builder
    #[serde(default = "default_delta_level")]
    pub level: i32,
}

impl Default for DeltaSection {
    fn default() -> Self {
        Self {
            max_ratio: default_max_delta_ratio(),
            level: default_delta_level(),
        }
    }
}

fn default_max_delta_ratio() -> f64 {
    0.9
}

fn default_delta_level() -> i32 {
    19
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;
        Self::parse(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Configuration rooted at `base_dir` with every other setting defaulted
    pub fn with_base_dir<P: Into<PathBuf>>(base_dir: P) -> Self {
        Self {
            paths: PathsSection {
                base_dir: base_dir.into(),
            },
            ..Self::default()
        }
    }

    fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.delta.max_ratio) || self.delta.max_ratio == 0.0 {
            return Err(Error::Config(format!(
                "delta.max_ratio must be within (0, 1], got {}",
                self.delta.max_ratio
            )));
        }
        if self.paths.base_dir.as_os_str().is_empty() {
            return Err(Error::Config("paths.base_dir must not be empty".to_string()));
        }
        Ok(())
    }

    /// Number of workers to spawn
    pub fn worker_count(&self) -> usize {
        if self.workers.count > 0 {
            return self.workers.count;
        }
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(2);
        (cpus / 2).max(1)
    }

    pub fn min_wait(&self) -> Duration {
        Duration::from_millis(self.workers.min_wait_ms)
    }

    pub fn max_jitter(&self) -> Duration {
        Duration::from_millis(self.workers.max_jitter_ms)
    }

    pub fn base_dir(&self) -> &Path {
        &self.paths.base_dir
    }

    pub fn db_path(&self) -> PathBuf {
        self.paths.base_dir.join("ferryd.db")
    }

    pub fn lock_path(&self) -> PathBuf {
        self.paths.base_dir.join("ferryd.lock")
    }

    pub fn pool_dir(&self) -> PathBuf {
        self.paths.base_dir.join("pool")
    }

    pub fn repos_dir(&self) -> PathBuf {
        self.paths.base_dir.join("repos")
    }

    /// Published tree of one repository
    pub fn repo_dir(&self, name: &str) -> PathBuf {
        self.repos_dir().join(name)
    }

    /// Operator-provided distribution/components/groups files of one repository
    pub fn assets_dir(&self, name: &str) -> PathBuf {
        self.paths.base_dir.join("assets").join(name)
    }

    pub fn transit_dir(&self) -> PathBuf {
        self.paths.base_dir.join("transit")
    }

    /// Scratch area for in-progress delta builds of one repository
    pub fn delta_dir(&self, name: &str) -> PathBuf {
        self.paths.base_dir.join("deltas").join(name)
    }

    /// Create the top-level directory layout
    pub fn ensure_layout(&self) -> Result<()> {
        for dir in [
            self.base_dir().to_path_buf(),
            self.pool_dir(),
            self.repos_dir(),
            self.paths.base_dir.join("assets"),
            self.transit_dir(),
            self.paths.base_dir.join("deltas"),
        ] {
            std::fs::create_dir_all(&dir)?;
        }
        Ok(())
    }
}
