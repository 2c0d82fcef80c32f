// src/hash.rs

//! Hashing for archive identity and index checksums
//!
//! Two algorithms are in use:
//! - **SHA-256**: archive integrity, transit manifest verification, `.sha256sum` sidecars
//! - **SHA-1**: the eopkg `PackageHash` field and `.sha1sum` sidecars

use sha1::Sha1;
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

/// Hash algorithm selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum HashAlgorithm {
    #[default]
    Sha256,
    Sha1,
}

impl HashAlgorithm {
    /// Get the algorithm name as a string
    #[inline]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Sha256 => "sha256",
            Self::Sha1 => "sha1",
        }
    }

    /// Suffix of the checksum sidecar written next to published files
    #[inline]
    pub const fn sidecar_suffix(&self) -> &'static str {
        match self {
            Self::Sha256 => ".sha256sum",
            Self::Sha1 => ".sha1sum",
        }
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Both digests of one file, computed in a single pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDigests {
    pub size: u64,
    pub sha1: String,
    pub sha256: String,
}

impl FileDigests {
    pub fn get(&self, algorithm: HashAlgorithm) -> &str {
        match algorithm {
            HashAlgorithm::Sha256 => &self.sha256,
            HashAlgorithm::Sha1 => &self.sha1,
        }
    }
}

/// Compute SHA-256 of a byte slice
#[inline]
pub fn sha256(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Compute SHA-1 of a byte slice
#[inline]
pub fn sha1(data: &[u8]) -> String {
    hex::encode(Sha1::digest(data))
}

/// Hash everything a reader yields with both algorithms
pub fn digest_reader<R: Read>(reader: &mut R) -> io::Result<FileDigests> {
    let mut sha1 = Sha1::new();
    let mut sha256 = Sha256::new();
    let mut buffer = [0u8; 64 * 1024];
    let mut size = 0u64;

    loop {
        let n = reader.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        sha1.update(&buffer[..n]);
        sha256.update(&buffer[..n]);
        size += n as u64;
    }

    Ok(FileDigests {
        size,
        sha1: hex::encode(sha1.finalize()),
        sha256: hex::encode(sha256.finalize()),
    })
}

/// Hash a file on disk, streaming its content
pub fn digest_file(path: &Path) -> io::Result<FileDigests> {
    let mut file = File::open(path)?;
    digest_reader(&mut file)
}

/// Compute the SHA-256 of a file on disk
pub fn sha256_file(path: &Path) -> io::Result<String> {
    Ok(digest_file(path)?.sha256)
}

/// Verify a file matches an expected SHA-256, returning the actual digest on mismatch
pub fn verify_file_sha256(path: &Path, expected: &str) -> io::Result<Result<(), String>> {
    let actual = sha256_file(path)?;
    if actual.eq_ignore_ascii_case(expected.trim()) {
        Ok(Ok(()))
    } else {
        Ok(Err(actual))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_known_digests() {
        assert_eq!(
            sha256(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
        assert_eq!(sha1(b"hello world"), "2aae6c35c94fcfb415dbe95f408b9ce91ee846ed");
    }

    #[test]
    fn test_digest_file_matches_slices() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"hello world").unwrap();

        let digests = digest_file(file.path()).unwrap();
        assert_eq!(digests.size, 11);
        assert_eq!(digests.sha1, sha1(b"hello world"));
        assert_eq!(digests.get(HashAlgorithm::Sha256), sha256(b"hello world"));
    }

    #[test]
    fn test_verify_file_sha256() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"payload").unwrap();

        let good = sha256(b"payload");
        assert!(verify_file_sha256(file.path(), &good.to_uppercase()).unwrap().is_ok());

        let bad = sha256(b"other");
        assert_eq!(
            verify_file_sha256(file.path(), &bad).unwrap().unwrap_err(),
            good
        );
    }
}
