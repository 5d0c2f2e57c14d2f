//! On-disk bloom filter used as a prefilter for the junk word database.
//!
//! Fixed-size bit array with four hash positions derived from SHA-256 of
//! the token. The filter is rebuilt from scratch on retrain, so it never
//! needs resizing.

use std::path::Path;

use merel_common::{Error, Result};
use sha2::{Digest, Sha256};
use tokio::fs;

/// 2^23 bits, 1 MiB on disk.
const NBITS: u64 = 1 << 23;
const NHASHES: usize = 4;

pub struct Bloom {
    bits: Vec<u8>,
}

impl Bloom {
    pub fn new() -> Self {
        Self {
            bits: vec![0u8; (NBITS / 8) as usize],
        }
    }

    /// Load a filter from disk, or start empty when the file is absent.
    pub async fn load(path: &Path) -> Result<Self> {
        match fs::read(path).await {
            Ok(data) if data.len() == (NBITS / 8) as usize => Ok(Self { bits: data }),
            Ok(_) => Err(Error::Storage(format!(
                "bloom filter {} has unexpected size",
                path.display()
            ))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::new()),
            Err(e) => Err(Error::Storage(format!("reading {}: {}", path.display(), e))),
        }
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        fs::write(path, &self.bits)
            .await
            .map_err(|e| Error::Storage(format!("writing {}: {}", path.display(), e)))
    }

    pub fn add(&mut self, token: &str) {
        for pos in positions(token) {
            self.bits[(pos / 8) as usize] |= 1 << (pos % 8);
        }
    }

    pub fn contains(&self, token: &str) -> bool {
        positions(token)
            .into_iter()
            .all(|pos| self.bits[(pos / 8) as usize] & (1 << (pos % 8)) != 0)
    }
}

impl Default for Bloom {
    fn default() -> Self {
        Self::new()
    }
}

fn positions(token: &str) -> [u64; NHASHES] {
    let digest = Sha256::digest(token.as_bytes());
    let mut out = [0u64; NHASHES];
    for (i, chunk) in digest.chunks_exact(8).take(NHASHES).enumerate() {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(chunk);
        out[i] = u64::from_be_bytes(buf) % NBITS;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_add_contains() {
        let mut b = Bloom::new();
        assert!(!b.contains("viagra"));
        b.add("viagra");
        assert!(b.contains("viagra"));
        assert!(!b.contains("newsletter"));
    }

    #[tokio::test]
    async fn test_save_load_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("junkfilter.bloom");

        let mut b = Bloom::new();
        b.add("lottery");
        b.save(&path).await.unwrap();

        let loaded = Bloom::load(&path).await.unwrap();
        assert!(loaded.contains("lottery"));
        assert!(!loaded.contains("invoice"));
    }

    #[tokio::test]
    async fn test_load_missing_is_empty() {
        let dir = TempDir::new().unwrap();
        let b = Bloom::load(&dir.path().join("nope.bloom")).await.unwrap();
        assert!(!b.contains("anything"));
    }
}
