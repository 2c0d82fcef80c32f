// src/archive.rs

//! Archive identity
//!
//! An [`Archive`] describes one package release or one delta between two
//! releases of the same package. Its [`Archive::id`] is the canonical eopkg
//! file name and doubles as the pool key:
//!
//! - package: `name-version-release-distrelease-arch.eopkg`
//! - delta: `name-from-to-distrelease-arch.delta.eopkg`

use crate::config::{DELTA_EXTENSION, PACKAGE_EXTENSION};
use crate::error::{Error, Result};
use crate::hash::{self, FileDigests};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// One logical package release or delta
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Archive {
    /// Package name
    pub name: String,
    /// Source package it was built from
    pub source: String,
    /// Upstream version (empty for deltas identified by filename only)
    pub version: String,
    /// Release number; the to-release for deltas
    pub release: i64,
    /// Distribution release the archive targets
    pub dist_release: i64,
    /// Base release of a delta
    pub from_release: Option<i64>,
    pub architecture: String,
    pub size: u64,
    pub sha1: String,
    pub sha256: String,
}

impl Archive {
    pub fn is_delta(&self) -> bool {
        self.from_release.is_some()
    }

    /// Canonical file name, also the pool id
    pub fn id(&self) -> String {
        match self.from_release {
            Some(from) => format!(
                "{}-{}-{}-{}-{}{}",
                self.name, from, self.release, self.dist_release, self.architecture, DELTA_EXTENSION
            ),
            None => format!(
                "{}-{}-{}-{}-{}{}",
                self.name,
                self.version,
                self.release,
                self.dist_release,
                self.architecture,
                PACKAGE_EXTENSION
            ),
        }
    }

    /// Path of the archive relative to the pool or a repository root
    pub fn relative_path(&self) -> PathBuf {
        relative_path(&self.name, &self.id())
    }

    /// Describe the delta from `old` to `tip` once its file has been digested
    pub fn delta_of(old: &Archive, tip: &Archive, digests: FileDigests) -> Self {
        Self {
            name: tip.name.clone(),
            source: tip.source.clone(),
            version: tip.version.clone(),
            release: tip.release,
            dist_release: tip.dist_release,
            from_release: Some(old.release),
            architecture: tip.architecture.clone(),
            size: digests.size,
            sha1: digests.sha1,
            sha256: digests.sha256,
        }
    }
}

/// Identity of the delta from `old` to `tip`
pub fn delta_id(old: &Archive, tip: &Archive) -> String {
    format!(
        "{}-{}-{}-{}-{}{}",
        tip.name, old.release, tip.release, tip.dist_release, tip.architecture, DELTA_EXTENSION
    )
}

/// Pool shard for a package name: `libfoo` -> `libf`, `nano` -> `n`
pub fn pool_prefix(name: &str) -> String {
    let take = if name.starts_with("lib") && name.chars().count() > 3 {
        4
    } else {
        1
    };
    name.chars().take(take).collect()
}

/// `<prefix>/<name>/<file>`
pub fn relative_path(name: &str, file_name: &str) -> PathBuf {
    PathBuf::from(pool_prefix(name)).join(name).join(file_name)
}

/// Fields recovered from a canonical file name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedName {
    pub name: String,
    pub version: String,
    pub release: i64,
    pub dist_release: i64,
    pub from_release: Option<i64>,
    pub architecture: String,
}

/// Split a canonical package or delta file name from the right
pub fn parse_file_name(file_name: &str) -> Result<ParsedName> {
    let invalid = |reason: &str| Error::ParseError(format!("{}: {}", file_name, reason));

    let (stem, is_delta) = if let Some(stem) = file_name.strip_suffix(DELTA_EXTENSION) {
        (stem, true)
    } else if let Some(stem) = file_name.strip_suffix(PACKAGE_EXTENSION) {
        (stem, false)
    } else {
        return Err(invalid("not an eopkg archive"));
    };

    let parts: Vec<&str> = stem.rsplitn(5, '-').collect();
    if parts.len() != 5 || parts.iter().any(|p| p.is_empty()) {
        return Err(invalid("expected name-version-release-distrelease-arch"));
    }

    let number = |field: &str, what: &str| {
        field
            .parse::<i64>()
            .map_err(|_| invalid(&format!("{} '{}' is not a number", what, field)))
    };

    let architecture = parts[0].to_string();
    let dist_release = number(parts[1], "distribution release")?;
    let release = number(parts[2], "release")?;
    let name = parts[4].to_string();

    if is_delta {
        let from = number(parts[3], "from-release")?;
        if from >= release {
            return Err(invalid("delta must go from an older to a newer release"));
        }
        Ok(ParsedName {
            name,
            version: String::new(),
            release,
            dist_release,
            from_release: Some(from),
            architecture,
        })
    } else {
        Ok(ParsedName {
            name,
            version: parts[3].to_string(),
            release,
            dist_release,
            from_release: None,
            architecture,
        })
    }
}

/// Reads the metadata of an archive on disk
pub trait ArchiveInspector: Send + Sync {
    fn inspect(&self, path: &Path) -> Result<Archive>;
}

/// Identity from the canonical file name plus content digests
#[derive(Debug, Default, Clone, Copy)]
pub struct FilenameInspector;

impl ArchiveInspector for FilenameInspector {
    fn inspect(&self, path: &Path) -> Result<Archive> {
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| Error::ParseError(format!("{}: no file name", path.display())))?;
        let parsed = parse_file_name(file_name)?;
        let digests = hash::digest_file(path)?;

        Ok(Archive {
            source: parsed.name.clone(),
            name: parsed.name,
            version: parsed.version,
            release: parsed.release,
            dist_release: parsed.dist_release,
            from_release: parsed.from_release,
            architecture: parsed.architecture,
            size: digests.size,
            sha1: digests.sha1,
            sha256: digests.sha256,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_package_name() {
        let parsed = parse_file_name("nano-2.9.8-94-1-x86_64.eopkg").unwrap();
        assert_eq!(parsed.name, "nano");
        assert_eq!(parsed.version, "2.9.8");
        assert_eq!(parsed.release, 94);
        assert_eq!(parsed.dist_release, 1);
        assert_eq!(parsed.from_release, None);
        assert_eq!(parsed.architecture, "x86_64");
    }

    #[test]
    fn test_parse_hyphenated_delta_name() {
        let parsed = parse_file_name("font-util-devel-3-5-1-x86_64.delta.eopkg").unwrap();
        assert_eq!(parsed.name, "font-util-devel");
        assert_eq!(parsed.from_release, Some(3));
        assert_eq!(parsed.release, 5);
    }

    #[test]
    fn test_parse_rejects_bad_names() {
        assert!(parse_file_name("nano.tar.gz").is_err());
        assert!(parse_file_name("nano-1-x86_64.eopkg").is_err());
        assert!(parse_file_name("nano-2.0-a-1-x86_64.eopkg").is_err());
        assert!(parse_file_name("nano-5-3-1-x86_64.delta.eopkg").is_err());
    }

    #[test]
    fn test_pool_prefix() {
        assert_eq!(pool_prefix("nano"), "n");
        assert_eq!(pool_prefix("libpng"), "libp");
        assert_eq!(pool_prefix("lib"), "l");
        assert_eq!(
            relative_path("libpng", "x.eopkg"),
            PathBuf::from("libp/libpng/x.eopkg")
        );
    }

    #[test]
    fn test_inspector_and_delta_identity() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("nano-2.9.8-94-1-x86_64.eopkg");
        std::fs::write(&path, b"nano 94").unwrap();

        let tip = FilenameInspector.inspect(&path).unwrap();
        assert_eq!(tip.id(), "nano-2.9.8-94-1-x86_64.eopkg");
        assert_eq!(tip.source, "nano");
        assert_eq!(tip.size, 7);
        assert_eq!(tip.sha256, hash::sha256(b"nano 94"));

        let mut old = tip.clone();
        old.release = 90;
        assert_eq!(delta_id(&old, &tip), "nano-90-94-1-x86_64.delta.eopkg");

        let delta = Archive::delta_of(&old, &tip, hash::digest_reader(&mut &b"d"[..]).unwrap());
        assert!(delta.is_delta());
        assert_eq!(delta.id(), delta_id(&old, &tip));
        assert_eq!(
            delta.relative_path(),
            PathBuf::from("n/nano/nano-90-94-1-x86_64.delta.eopkg")
        );
    }
}
