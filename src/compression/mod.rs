// src/compression/mod.rs
//! Compression utilities for published index variants
//!
//! Every index is published uncompressed plus one copy per
//! [`CompressionFormat::PUBLISHED`] format.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;
use thiserror::Error;

/// Compression-related errors
#[derive(Error, Debug)]
pub enum CompressionError {
    #[error("Failed to create {format} encoder: {source}")]
    EncoderCreation {
        format: &'static str,
        source: io::Error,
    },

    #[error("Failed to compress {format} data: {source}")]
    Compression {
        format: &'static str,
        source: io::Error,
    },

    #[error("Failed to decompress {format} data: {source}")]
    Decompression {
        format: &'static str,
        source: io::Error,
    },
}

impl From<CompressionError> for crate::Error {
    fn from(e: CompressionError) -> Self {
        crate::Error::IoError(e.to_string())
    }
}

/// Supported compression formats
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionFormat {
    /// No compression (raw data)
    None,
    /// XZ/LZMA compression (.xz)
    Xz,
    /// Zstandard compression (.zst)
    Zstd,
}

impl CompressionFormat {
    /// Formats every index is additionally published in
    pub const PUBLISHED: [CompressionFormat; 2] = [CompressionFormat::Xz, CompressionFormat::Zstd];

    /// Detect compression format from magic bytes
    ///
    /// Magic bytes:
    /// - XZ: `fd 37 7a 58 5a 00` (FD + "7zXZ" + NUL)
    /// - Zstd: `28 b5 2f fd`
    pub fn from_magic_bytes(data: &[u8]) -> Self {
        if data.starts_with(&[0xfd, 0x37, 0x7a, 0x58, 0x5a, 0x00]) {
            Self::Xz
        } else if data.starts_with(&[0x28, 0xb5, 0x2f, 0xfd]) {
            Self::Zstd
        } else {
            Self::None
        }
    }

    /// Get the file extension for this format
    pub fn extension(&self) -> &'static str {
        match self {
            Self::None => "",
            Self::Xz => ".xz",
            Self::Zstd => ".zst",
        }
    }

    /// Get a human-readable name for this format
    pub fn name(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Xz => "xz",
            Self::Zstd => "zstd",
        }
    }
}

impl std::fmt::Display for CompressionFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Compress `input` into a new file at `output`
pub fn compress_file(
    input: &Path,
    output: &Path,
    format: CompressionFormat,
) -> Result<(), CompressionError> {
    let name = format.name();
    let wrap = |source: io::Error| CompressionError::Compression { format: name, source };

    let mut reader = BufReader::new(File::open(input).map_err(wrap)?);
    let writer = BufWriter::new(File::create(output).map_err(wrap)?);

    match format {
        CompressionFormat::None => {
            let mut writer = writer;
            io::copy(&mut reader, &mut writer).map_err(wrap)?;
            writer.flush().map_err(wrap)?;
        }
        CompressionFormat::Xz => {
            let mut encoder = xz2::write::XzEncoder::new(writer, 6);
            io::copy(&mut reader, &mut encoder).map_err(wrap)?;
            encoder.finish().map_err(wrap)?.flush().map_err(wrap)?;
        }
        CompressionFormat::Zstd => {
            let mut encoder = zstd::Encoder::new(writer, 19).map_err(|source| {
                CompressionError::EncoderCreation { format: name, source }
            })?;
            io::copy(&mut reader, &mut encoder).map_err(wrap)?;
            encoder.finish().map_err(wrap)?.flush().map_err(wrap)?;
        }
    }

    Ok(())
}

/// Decompress a byte slice using the specified format
pub fn decompress(data: &[u8], format: CompressionFormat) -> Result<Vec<u8>, CompressionError> {
    let wrap = |source: io::Error| CompressionError::Decompression {
        format: format.name(),
        source,
    };

    let mut output = Vec::new();
    match format {
        CompressionFormat::None => output.extend_from_slice(data),
        CompressionFormat::Xz => {
            xz2::read::XzDecoder::new(data)
                .read_to_end(&mut output)
                .map_err(wrap)?;
        }
        CompressionFormat::Zstd => {
            zstd::Decoder::new(data)
                .map_err(wrap)?
                .read_to_end(&mut output)
                .map_err(wrap)?;
        }
    }
    Ok(output)
}
