//! Compression of blobs at rest.

use cinder_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};

/// Compression algorithm.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    None,
    #[default]
    Zstd,
}

const ZSTD_LEVEL: i32 = 3;

/// Compress data using the specified algorithm.
pub fn compress(data: &[u8], algorithm: Compression) -> Result<Vec<u8>> {
    match algorithm {
        Compression::None => Ok(data.to_vec()),
        Compression::Zstd => compress_zstd(data),
    }
}

/// Decompress data using the specified algorithm.
pub fn decompress(data: &[u8], algorithm: Compression) -> Result<Vec<u8>> {
    match algorithm {
        Compression::None => Ok(data.to_vec()),
        Compression::Zstd => decompress_zstd(data),
    }
}

fn compress_zstd(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = zstd::Encoder::new(Vec::new(), ZSTD_LEVEL)
        .map_err(|e| Error::ArtifactStoreUnavailable(format!("zstd init failed: {}", e)))?;
    encoder
        .write_all(data)
        .map_err(|e| Error::ArtifactStoreUnavailable(format!("zstd write failed: {}", e)))?;
    encoder
        .finish()
        .map_err(|e| Error::ArtifactStoreUnavailable(format!("zstd finish failed: {}", e)))
}

fn decompress_zstd(data: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = zstd::Decoder::new(data)
        .map_err(|e| Error::ArtifactStoreUnavailable(format!("zstd init failed: {}", e)))?;
    let mut output = Vec::new();
    decoder
        .read_to_end(&mut output)
        .map_err(|e| Error::ArtifactStoreUnavailable(format!("zstd read failed: {}", e)))?;
    Ok(output)
}
