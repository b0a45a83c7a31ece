//! Pluggable storage backend for the CAS.
//!
//! The reference backend is a local filesystem sharded by the first two hex
//! characters of the digest, writing to a temp name and renaming into place
//! so no partially written file is ever visible under its final name.

use crate::digest::Digest;
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;

/// A storage backend for raw (already chunked, already compressed) object
/// bytes addressed by digest. Implementors must provide atomic
/// write-then-rename semantics for `store`.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Persist `bytes` under `digest`, atomically.
    async fn store(&self, digest: &Digest, bytes: &[u8]) -> Result<()>;
    /// Read back the bytes stored under `digest`.
    async fn retrieve(&self, digest: &Digest) -> Result<Vec<u8>>;
    /// Remove the object stored under `digest`. Not an error if absent.
    async fn delete(&self, digest: &Digest) -> Result<()>;
    /// Whether an object exists under `digest`.
    async fn exists(&self, digest: &Digest) -> Result<bool>;
    /// The stored (physical, possibly compressed) size of the object.
    async fn size(&self, digest: &Digest) -> Result<u64>;
    /// List every digest currently stored.
    async fn list(&self) -> Result<Vec<Digest>>;
}

/// Filesystem backend sharded by the first two hex characters of the digest:
/// `<root>/<hash[0:2]>/<hash>`.
pub struct FsBackend {
    root: PathBuf,
}

impl FsBackend {
    /// Open (creating if needed) a filesystem-backed store rooted at `root`.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).await?;
        fs::create_dir_all(root.join("tmp")).await?;
        let backend = Self { root };
        backend.cleanup_temp_files().await?;
        Ok(backend)
    }

    fn object_path(&self, digest: &Digest) -> PathBuf {
        let hex = digest.to_hex();
        self.root.join(&hex[..2]).join(hex)
    }

    fn temp_path(&self, digest: &Digest) -> PathBuf {
        self.root
            .join("tmp")
            .join(format!("{}.{}", digest.to_hex(), uuid::Uuid::new_v4()))
    }

    /// Remove any leftover temp files from a prior crash mid-write, so a
    /// restart never surfaces a partially written object.
    async fn cleanup_temp_files(&self) -> Result<()> {
        let tmp_dir = self.root.join("tmp");
        let mut entries = fs::read_dir(&tmp_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let _ = fs::remove_file(entry.path()).await;
        }
        Ok(())
    }
}

#[async_trait]
impl Backend for FsBackend {
    async fn store(&self, digest: &Digest, bytes: &[u8]) -> Result<()> {
        let final_path = self.object_path(digest);
        if let Some(parent) = final_path.parent() {
            fs::create_dir_all(parent).await?;
        }
        // Another writer may have already produced this digest's bytes; at
        // most one physical write per chunk digest happens globally.
        if fs::metadata(&final_path).await.is_ok() {
            return Ok(());
        }

        let tmp_path = self.temp_path(digest);
        let mut file = fs::File::create(&tmp_path).await?;
        file.write_all(bytes).await?;
        file.sync_all().await?;
        drop(file);

        match fs::rename(&tmp_path, &final_path).await {
            Ok(()) => Ok(()),
            Err(e) => {
                let _ = fs::remove_file(&tmp_path).await;
                // A concurrent writer winning the race is not an error.
                if fs::metadata(&final_path).await.is_ok() {
                    Ok(())
                } else {
                    Err(Error::from(e))
                }
            }
        }
    }

    async fn retrieve(&self, digest: &Digest) -> Result<Vec<u8>> {
        let path = self.object_path(digest);
        fs::read(&path)
            .await
            .map_err(|e| map_not_found(e, digest))
    }

    async fn delete(&self, digest: &Digest) -> Result<()> {
        let path = self.object_path(digest);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::from(e)),
        }
    }

    async fn exists(&self, digest: &Digest) -> Result<bool> {
        Ok(fs::metadata(self.object_path(digest)).await.is_ok())
    }

    async fn size(&self, digest: &Digest) -> Result<u64> {
        let meta = fs::metadata(self.object_path(digest))
            .await
            .map_err(|e| map_not_found(e, digest))?;
        Ok(meta.len())
    }

    async fn list(&self) -> Result<Vec<Digest>> {
        let mut out = Vec::new();
        let mut shard_entries = fs::read_dir(&self.root).await?;
        while let Some(shard) = shard_entries.next_entry().await? {
            if shard.file_name() == "tmp" {
                continue;
            }
            if !shard.file_type().await?.is_dir() {
                continue;
            }
            let mut files = fs::read_dir(shard.path()).await?;
            while let Some(file) = files.next_entry().await? {
                if let Some(name) = file.file_name().to_str() {
                    if let Ok(digest) = Digest::from_hex(name) {
                        out.push(digest);
                    }
                }
            }
        }
        Ok(out)
    }
}

fn map_not_found(e: std::io::Error, digest: &Digest) -> Error {
    if e.kind() == std::io::ErrorKind::NotFound {
        Error::not_found(format!("object {digest} not found"))
    } else {
        Error::from(e)
    }
}

/// Helper used by callers that need the shard directory for a digest without
/// depending on `FsBackend` internals (e.g. pre-creating directories in
/// bulk-import tooling).
pub fn shard_dir(root: &Path, digest: &Digest) -> PathBuf {
    root.join(digest.shard_prefix())
}
