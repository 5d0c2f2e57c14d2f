//! Sharded immutable file storage.
//!
//! Message data files and queue blobs live under a base directory at
//! `<id/8192>/<id>`. Files are written once, fsynced together with their
//! directory, and never modified; removal happens only when the owning
//! database row goes away.

use std::path::{Path, PathBuf};

use merel_common::{Error, Result};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;

/// Number of files per shard directory.
const SHARD_SIZE: i64 = 8192;

/// A directory of immutable files addressed by integer id.
#[derive(Debug, Clone)]
pub struct ShardedFiles {
    base: PathBuf,
}

impl ShardedFiles {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Path for an id: `<base>/<id/8192>/<id>`.
    pub fn path(&self, id: i64) -> PathBuf {
        self.base.join((id / SHARD_SIZE).to_string()).join(id.to_string())
    }

    /// Move a file into place for the given id. Hard-links when possible so
    /// the source can double as a spool file; falls back to a copy across
    /// filesystems. With `sync`, the file and its shard directory are
    /// fsynced before returning.
    pub async fn store_file(&self, id: i64, src: &Path, sync: bool) -> Result<()> {
        let dst = self.path(id);
        let dir = dst.parent().ok_or_else(|| Error::Storage("invalid shard path".to_string()))?;
        fs::create_dir_all(dir)
            .await
            .map_err(|e| Error::Storage(format!("creating {}: {}", dir.display(), e)))?;

        if fs::hard_link(src, &dst).await.is_err() {
            fs::copy(src, &dst)
                .await
                .map_err(|e| Error::Storage(format!("storing {}: {}", dst.display(), e)))?;
        }
        if sync {
            self.sync(&dst, dir).await?;
        }
        debug!(id, path = %dst.display(), "stored file");
        Ok(())
    }

    /// Write bytes for the given id.
    pub async fn store_bytes(&self, id: i64, data: &[u8], sync: bool) -> Result<()> {
        let dst = self.path(id);
        let dir = dst.parent().ok_or_else(|| Error::Storage("invalid shard path".to_string()))?;
        fs::create_dir_all(dir)
            .await
            .map_err(|e| Error::Storage(format!("creating {}: {}", dir.display(), e)))?;

        let mut f = fs::File::create(&dst)
            .await
            .map_err(|e| Error::Storage(format!("creating {}: {}", dst.display(), e)))?;
        f.write_all(data)
            .await
            .map_err(|e| Error::Storage(format!("writing {}: {}", dst.display(), e)))?;
        if sync {
            f.sync_all()
                .await
                .map_err(|e| Error::Storage(format!("syncing {}: {}", dst.display(), e)))?;
            drop(f);
            self.sync_dir(dir).await?;
        }
        Ok(())
    }

    pub async fn read(&self, id: i64) -> Result<Vec<u8>> {
        let path = self.path(id);
        fs::read(&path)
            .await
            .map_err(|e| Error::Storage(format!("reading {}: {}", path.display(), e)))
    }

    pub async fn size(&self, id: i64) -> Result<u64> {
        let path = self.path(id);
        let meta = fs::metadata(&path)
            .await
            .map_err(|e| Error::Storage(format!("stat {}: {}", path.display(), e)))?;
        Ok(meta.len())
    }

    pub async fn exists(&self, id: i64) -> bool {
        fs::metadata(self.path(id)).await.is_ok()
    }

    pub async fn remove(&self, id: i64) -> Result<()> {
        let path = self.path(id);
        fs::remove_file(&path)
            .await
            .map_err(|e| Error::Storage(format!("removing {}: {}", path.display(), e)))?;
        debug!(id, path = %path.display(), "removed file");
        Ok(())
    }

    async fn sync(&self, file: &Path, dir: &Path) -> Result<()> {
        let f = fs::File::open(file)
            .await
            .map_err(|e| Error::Storage(format!("opening {}: {}", file.display(), e)))?;
        f.sync_all()
            .await
            .map_err(|e| Error::Storage(format!("syncing {}: {}", file.display(), e)))?;
        self.sync_dir(dir).await
    }

    async fn sync_dir(&self, dir: &Path) -> Result<()> {
        let d = fs::File::open(dir)
            .await
            .map_err(|e| Error::Storage(format!("opening {}: {}", dir.display(), e)))?;
        d.sync_all()
            .await
            .map_err(|e| Error::Storage(format!("syncing {}: {}", dir.display(), e)))
    }
}

/// The full message bytes: stored prefix followed by the data file.
pub async fn read_message(files: &ShardedFiles, id: i64, prefix: &[u8]) -> Result<Vec<u8>> {
    let mut data = Vec::with_capacity(prefix.len());
    data.extend_from_slice(prefix);
    data.extend_from_slice(&files.read(id).await?);
    Ok(data)
}
