//! Hashing utilities for minicfg
//!
//! - BLAKE3 for config snapshot digests (stored next to each change record)
//! - Streaming hasher for large payloads

use blake3::Hasher;
use serde::Serialize;

use crate::common::Result;

/// Compute BLAKE3 hash of data, return hex string
pub fn blake3_hash(data: &[u8]) -> String {
    let hash = blake3::hash(data);
    format!("{}", hash)
}

/// CRC32 checksum for change log records
pub fn crc32(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}

/// Compute BLAKE3 hash incrementally (for streaming)
pub struct Blake3Hasher {
    hasher: Hasher,
}

impl Blake3Hasher {
    pub fn new() -> Self {
        Self {
            hasher: Hasher::new(),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
    }

    pub fn finalize(&self) -> String {
        let hash = self.hasher.finalize();
        format!("{}", hash)
    }
}

impl Default for Blake3Hasher {
    fn default() -> Self {
        Self::new()
    }
}

/// Digest of a config snapshot.
///
/// The snapshot is hashed through its JSON form, so two snapshots that
/// serialize identically share a hash. `None` (a prepare the applicator
/// refused) has no hash.
pub fn config_hash<T: Serialize>(config: Option<&T>) -> Result<Option<String>> {
    match config {
        Some(config) => {
            let mut hasher = Blake3Hasher::new();
            serde_json::to_writer(HashWriter(&mut hasher), config)?;
            Ok(Some(hasher.finalize()))
        }
        None => Ok(None),
    }
}

struct HashWriter<'a>(&'a mut Blake3Hasher);

impl std::io::Write for HashWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
