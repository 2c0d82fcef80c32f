// src/delta/builder.rs

//! Delta builders
//!
//! The default builder compresses the new archive using the old archive as a
//! zstd dictionary, so clients holding the old release only download what
//! changed.

use super::DeltaMetrics;
use crate::archive::parse_file_name;
use std::fs;
use std::io::{Read, Write};
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info};

/// Why a delta could not be built
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DeltaError {
    /// The delta would not be meaningfully smaller than the full archive
    #[error("delta would be {delta_size} bytes for a {new_size} byte archive")]
    Pointless { delta_size: u64, new_size: u64 },

    /// The two archives are not releases of the same package
    #[error("archives do not match: {0}")]
    Mismatched(String),

    /// Anything else; not remembered, the job fails
    #[error("delta build failed: {0}")]
    Failed(String),
}

impl DeltaError {
    /// Failures that will never succeed for the same pair of archives
    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::Pointless { .. } | Self::Mismatched(_))
    }
}

impl From<std::io::Error> for DeltaError {
    fn from(e: std::io::Error) -> Self {
        Self::Failed(e.to_string())
    }
}

/// Builds the delta between two archives of one package
pub trait DeltaBuilder: Send + Sync {
    fn build(&self, old: &Path, new: &Path, output: &Path) -> Result<DeltaMetrics, DeltaError>;
}

/// zstd dictionary delta builder
#[derive(Debug, Clone)]
pub struct ZstdDeltaBuilder {
    level: i32,
    max_ratio: f64,
}

impl ZstdDeltaBuilder {
    pub fn new(level: i32, max_ratio: f64) -> Self {
        Self { level, max_ratio }
    }

    fn check_pair(old: &Path, new: &Path) -> Result<(), DeltaError> {
        let identity = |path: &Path| {
            let file_name = path
                .file_name()
                .and_then(|n| n.to_str())
                .ok_or_else(|| DeltaError::Failed(format!("{}: no file name", path.display())))?;
            parse_file_name(file_name)
                .map(|parsed| (parsed.name, parsed.architecture))
                .map_err(|e| DeltaError::Mismatched(e.to_string()))
        };

        let old_id = identity(old)?;
        let new_id = identity(new)?;
        if old_id != new_id {
            return Err(DeltaError::Mismatched(format!(
                "{}/{} vs {}/{}",
                old_id.0, old_id.1, new_id.0, new_id.1
            )));
        }
        Ok(())
    }

    fn compress_with_dictionary(&self, data: &[u8], dictionary: &[u8]) -> Result<Vec<u8>, DeltaError> {
        let encoder_dict = zstd::dict::EncoderDictionary::copy(dictionary, self.level);
        let mut encoder = zstd::Encoder::with_prepared_dictionary(Vec::new(), &encoder_dict)
            .map_err(|e| DeltaError::Failed(format!("Failed to create encoder: {}", e)))?;
        encoder
            .write_all(data)
            .map_err(|e| DeltaError::Failed(format!("Failed to write data: {}", e)))?;
        encoder
            .finish()
            .map_err(|e| DeltaError::Failed(format!("Failed to finish compression: {}", e)))
    }
}

impl Default for ZstdDeltaBuilder {
    fn default() -> Self {
        Self::new(19, 0.9)
    }
}

impl DeltaBuilder for ZstdDeltaBuilder {
    fn build(&self, old: &Path, new: &Path, output: &Path) -> Result<DeltaMetrics, DeltaError> {
        Self::check_pair(old, new)?;

        let old_content = fs::read(old)?;
        let new_content = fs::read(new)?;
        debug!(
            "Old version: {} bytes, New version: {} bytes",
            old_content.len(),
            new_content.len()
        );

        let delta = self.compress_with_dictionary(&new_content, &old_content)?;
        let metrics = DeltaMetrics::new(
            old_content.len() as u64,
            new_content.len() as u64,
            delta.len() as u64,
        );
        if !metrics.is_worthwhile(self.max_ratio) {
            return Err(DeltaError::Pointless {
                delta_size: metrics.delta_size,
                new_size: metrics.new_size,
            });
        }

        if let Some(parent) = output.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(output, &delta)?;

        info!(
            "Delta generated: {} bytes ({:.1}% of original, {:.1}% saved)",
            metrics.delta_size,
            metrics.compression_ratio * 100.0,
            metrics.savings_percentage()
        );
        Ok(metrics)
    }
}

/// Rebuild the new archive from the old one and a delta
pub fn apply_delta(old_content: &[u8], delta: &[u8]) -> Result<Vec<u8>, DeltaError> {
    let decoder_dict = zstd::dict::DecoderDictionary::copy(old_content);
    let mut decoder = zstd::Decoder::with_prepared_dictionary(delta, &decoder_dict)
        .map_err(|e| DeltaError::Failed(format!("Failed to create decoder: {}", e)))?;

    let mut decompressed = Vec::new();
    decoder
        .read_to_end(&mut decompressed)
        .map_err(|e| DeltaError::Failed(format!("Failed to read decompressed data: {}", e)))?;
    Ok(decompressed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn payload(seed: u8) -> Vec<u8> {
        (0..64 * 1024u32)
            .map(|i| ((i * 31 + (i >> 7) * 17) % 251) as u8)
            .chain(std::iter::repeat_n(seed, 512))
            .collect()
    }

    #[test]
    fn test_build_and_apply() {
        let temp = TempDir::new().unwrap();
        let old = temp.path().join("nano-1.0-1-1-x86_64.eopkg");
        let new = temp.path().join("nano-1.1-2-1-x86_64.eopkg");
        let out = temp.path().join("deltas/nano-1-2-1-x86_64.delta.eopkg");
        fs::write(&old, payload(1)).unwrap();
        fs::write(&new, payload(2)).unwrap();

        let metrics = ZstdDeltaBuilder::default().build(&old, &new, &out).unwrap();
        assert!(metrics.is_worthwhile(0.9));

        let delta = fs::read(&out).unwrap();
        assert_eq!(apply_delta(&payload(1), &delta).unwrap(), payload(2));
    }

    #[test]
    fn test_mismatched_packages() {
        let temp = TempDir::new().unwrap();
        let old = temp.path().join("nano-1.0-1-1-x86_64.eopkg");
        let new = temp.path().join("vim-1.1-2-1-x86_64.eopkg");
        fs::write(&old, b"a").unwrap();
        fs::write(&new, b"b").unwrap();

        let err = ZstdDeltaBuilder::default()
            .build(&old, &new, &temp.path().join("out"))
            .unwrap_err();
        assert!(matches!(err, DeltaError::Mismatched(_)));
        assert!(err.is_permanent());
    }

    #[test]
    fn test_pointless_delta() {
        let temp = TempDir::new().unwrap();
        let old = temp.path().join("nano-1.0-1-1-x86_64.eopkg");
        let new = temp.path().join("nano-1.1-2-1-x86_64.eopkg");
        let out = temp.path().join("out.delta.eopkg");
        fs::write(&old, b"x").unwrap();
        fs::write(&new, b"completely unrelated tiny").unwrap();

        let err = ZstdDeltaBuilder::default().build(&old, &new, &out).unwrap_err();
        assert!(matches!(err, DeltaError::Pointless { .. }));
        assert!(!out.exists());
        assert!(!DeltaError::Failed("io".into()).is_permanent());
    }
}
