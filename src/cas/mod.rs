//! The content-addressed store: chunking, per-chunk compression, a
//! pluggable storage backend, the deduplicating blob index, and garbage
//! collection.

pub mod backend;
pub mod chunk;
pub mod compress;
pub mod gc;
pub mod store;

pub use backend::{Backend, FsBackend};
pub use compress::CompressError;
pub use gc::GcReport;
pub use store::{BlobEntry, ChunkEntry, ContentStore, PutMetadata};

use crate::config::CasConfig;
use crate::error::Result;
use std::sync::Arc;

/// Open a content store rooted at `config.root`, with its object and
/// metadata shards both living under that root. This is the constructor
/// `node::NodeHandle` uses; it only opens files and rebuilds the in-memory
/// index, it does not start any background task.
pub async fn open(config: CasConfig) -> Result<ContentStore> {
    let backend: Arc<dyn Backend> = Arc::new(FsBackend::open(config.root.join("objects")).await?);
    let meta: Arc<dyn Backend> = Arc::new(FsBackend::open(config.root.join("meta")).await?);
    ContentStore::open(config, backend, meta).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cas::store::PutMetadata;

    #[tokio::test]
    async fn open_wires_backend_and_meta_under_root() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = CasConfig::default();
        config.root = dir.path().to_path_buf();
        let store = open(config).await.unwrap();
        let digest = store.put(b"wired", PutMetadata::default()).await.unwrap();
        assert_eq!(store.get(&digest).await.unwrap(), b"wired");
        assert!(dir.path().join("objects").exists());
        assert!(dir.path().join("meta").exists());
    }
}
