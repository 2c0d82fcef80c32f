// src/transit/mod.rs

//! Transit uploads
//!
//! Uploaders drop package archives into the incoming directory followed by a
//! `.tram` manifest naming the target repository and the sha256 of every
//! payload file:
//!
//! ```toml
//! [manifest]
//! version = "1.0"
//! target = "unstable"
//!
//! [[file]]
//! path = "nano-2.9.8-94-1-x86_64.eopkg"
//! sha256 = "..."
//! ```
//!
//! Payload paths are relative to the manifest's directory and may not leave it.

pub mod listener;

pub use listener::TransitListener;

use crate::config::{MANIFEST_SUFFIX, PACKAGE_EXTENSION};
use crate::hash;
use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};
use thiserror::Error;

/// Only manifests of this version are accepted
pub const MANIFEST_VERSION: &str = "1.0";

#[derive(Error, Debug)]
pub enum ManifestError {
    #[error("Failed to read manifest file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse manifest: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Unsupported manifest version {0}")]
    Version(String),

    #[error("Invalid payload path {0}")]
    BadPath(String),

    #[error("Checksum mismatch for {path}: expected {expected}, got {actual}")]
    Checksum {
        path: String,
        expected: String,
        actual: String,
    },
}

impl ManifestError {
    /// Attach the manifest location
    pub fn at(self, manifest: &Path) -> crate::Error {
        match self {
            Self::Checksum {
                path,
                expected,
                actual,
            } => crate::Error::ChecksumMismatch {
                path,
                expected,
                actual,
            },
            other => crate::Error::InvalidManifest {
                path: manifest.display().to_string(),
                reason: other.to_string(),
            },
        }
    }
}

/// The `[manifest]` header
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestHeader {
    pub version: String,
    pub target: String,
}

/// One `[[file]]` entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestFile {
    pub path: String,
    pub sha256: String,
}

/// A parsed `.tram` manifest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitManifest {
    pub manifest: ManifestHeader,
    #[serde(default, rename = "file")]
    pub files: Vec<ManifestFile>,
}

impl TransitManifest {
    /// Load manifest from a file path
    pub fn from_file(path: &Path) -> Result<Self, ManifestError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse manifest from a TOML string
    pub fn parse(content: &str) -> Result<Self, ManifestError> {
        let manifest: TransitManifest = toml::from_str(content)?;
        manifest.validate()?;
        Ok(manifest)
    }

    pub fn validate(&self) -> Result<(), ManifestError> {
        if self.manifest.version != MANIFEST_VERSION {
            return Err(ManifestError::Version(self.manifest.version.clone()));
        }
        if self.manifest.target.trim().is_empty() {
            return Err(ManifestError::MissingField("manifest.target".to_string()));
        }
        if self.files.is_empty() {
            return Err(ManifestError::MissingField("file".to_string()));
        }
        for file in &self.files {
            if file.sha256.trim().is_empty() {
                return Err(ManifestError::MissingField(format!("{}: sha256", file.path)));
            }
            let path = Path::new(&file.path);
            let contained = !file.path.is_empty()
                && path.components().all(|c| matches!(c, Component::Normal(_)));
            if !contained || !file.path.ends_with(PACKAGE_EXTENSION) {
                return Err(ManifestError::BadPath(file.path.clone()));
            }
        }
        Ok(())
    }

    /// Absolute payload paths for a manifest stored in `dir`
    pub fn payload_paths(&self, dir: &Path) -> Vec<PathBuf> {
        self.files.iter().map(|f| dir.join(&f.path)).collect()
    }

    /// Check every payload against its recorded sha256
    pub fn verify(&self, dir: &Path) -> Result<(), ManifestError> {
        for file in &self.files {
            let path = dir.join(&file.path);
            if let Err(actual) = hash::verify_file_sha256(&path, &file.sha256)? {
                return Err(ManifestError::Checksum {
                    path: path.display().to_string(),
                    expected: file.sha256.clone(),
                    actual,
                });
            }
        }
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }
}

pub fn is_manifest(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.ends_with(MANIFEST_SUFFIX) && !n.starts_with('.'))
}

/// Parse, validate and verify the manifest at `path`
pub fn load_verified(path: &Path) -> crate::Result<TransitManifest> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let manifest = TransitManifest::from_file(path).map_err(|e| e.at(path))?;
    manifest.verify(dir).map_err(|e| e.at(path))?;
    Ok(manifest)
}
