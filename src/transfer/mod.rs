//! Transfer Layer: copies a blob from a source peer's CAS to this node's
//! CAS, chunk by chunk, resuming from whatever local chunks already exist.
//!
//! The protocol is a chunk-digest diff: ask the source for the blob's chunk
//! list, subtract what the local chunk index already holds, fetch the rest
//! under a bounded-concurrency window, verify every chunk against its
//! digest, and commit the source's chunk list as the blob entry.

use crate::cas::store::ContentStore;
use crate::config::TransferConfig;
use crate::digest::Digest;
use crate::error::{Error, ErrorKind};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, instrument, warn};

/// Errors specific to a chunk transfer, folded into the crate taxonomy via
/// [`TransferError::kind`].
#[derive(Debug, Error)]
pub enum TransferError {
    /// No source peer could supply the blob or a required chunk.
    #[error("source unavailable: {0}")]
    SourceUnavailable(String),
    /// A chunk failed digest verification after exhausting its retry.
    #[error("corrupted chunk {digest}: {reason}")]
    Corrupted {
        /// The chunk whose verification failed.
        digest: Digest,
        /// Why verification failed.
        reason: String,
    },
    /// Every candidate source failed for this transfer.
    #[error("exhausted all sources for blob {0}")]
    Exhausted(Digest),
    /// The local store rejected the assembled blob.
    #[error("local store error: {0}")]
    Store(#[from] Error),
}

impl TransferError {
    /// Fold into the crate-wide error taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            TransferError::SourceUnavailable(_) => ErrorKind::Unavailable,
            TransferError::Corrupted { .. } => ErrorKind::Corrupted,
            TransferError::Exhausted(_) => ErrorKind::Unavailable,
            TransferError::Store(e) => e.kind,
        }
    }
}

/// A read-only view of a peer's CAS, as seen over the peer API. Implemented
/// by the real HTTP client in `api::peer_api` and by in-process fakes in
/// tests.
#[async_trait]
pub trait ChunkSource: Send + Sync {
    /// The ordered list of chunk digests composing `blob_digest` on this
    /// source.
    async fn list_chunks(&self, blob_digest: &Digest) -> Result<Vec<Digest>, TransferError>;
    /// Fetch one chunk's plaintext bytes (already decompressed) by digest.
    async fn fetch_chunk(&self, digest: &Digest) -> Result<Vec<u8>, TransferError>;
}

/// Progress of one blob transfer, reported for diagnostics and the request
/// API's status endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferProgress {
    /// The blob being transferred.
    pub blob_digest: Digest,
    /// Total chunks composing the blob.
    pub total_chunks: usize,
    /// Chunks already present locally or freshly fetched.
    pub completed_chunks: usize,
}

/// Drives a single resumable blob transfer from `source` into `store`.
pub struct Transfer<'a> {
    store: &'a ContentStore,
    source: Arc<dyn ChunkSource>,
    config: TransferConfig,
}

impl<'a> Transfer<'a> {
    /// Build a transfer against `store`, pulling from `source`.
    pub fn new(store: &'a ContentStore, source: Arc<dyn ChunkSource>, config: TransferConfig) -> Self {
        Self { store, source, config }
    }

    /// Run the full protocol: diff, fetch missing chunks with bounded
    /// concurrency, verify each, and commit the blob. Already-fetched
    /// chunks from a prior interrupted attempt are detected via the local
    /// chunk index and never re-requested.
    #[instrument(skip(self), fields(blob = %blob_digest))]
    pub async fn run(&self, blob_digest: &Digest) -> Result<TransferProgress, TransferError> {
        if self.store.exists(blob_digest).await {
            let chunk_digests = self
                .store
                .blob_entry(blob_digest)
                .map(|e| e.chunk_digests.len())
                .unwrap_or(0);
            return Ok(TransferProgress {
                blob_digest: *blob_digest,
                total_chunks: chunk_digests,
                completed_chunks: chunk_digests,
            });
        }

        let remote_chunks = self.source.list_chunks(blob_digest).await?;
        if Digest::of_chunks(remote_chunks.iter()) != *blob_digest {
            return Err(TransferError::Corrupted {
                digest: *blob_digest,
                reason: "source's chunk list does not hash to the requested blob digest".to_string(),
            });
        }
        let total_chunks = remote_chunks.len();

        let local: HashSet<Digest> = remote_chunks
            .iter()
            .filter(|d| self.store.chunk_entry(d).is_some())
            .copied()
            .collect();
        let missing: Vec<Digest> = remote_chunks
            .iter()
            .filter(|d| !local.contains(d))
            .copied()
            .collect();

        debug!(total = total_chunks, missing = missing.len(), "starting chunk fetch");

        let semaphore = Arc::new(Semaphore::new(
            self.config.max_concurrent_chunks.min(self.config.window_size).max(1),
        ));
        let mut fetches = Vec::with_capacity(missing.len());
        for digest in missing {
            let semaphore = semaphore.clone();
            let source = self.source.clone();
            let retry_limit = self.config.chunk_retry_limit;
            let store = self.store;
            fetches.push(async move {
                let _permit = semaphore.acquire_owned().await.expect("semaphore not closed");
                let (digest, data) = fetch_with_retry(source.as_ref(), digest, retry_limit).await?;
                // Land the chunk immediately so an interrupted transfer
                // resumes from here instead of refetching.
                store.insert_loose_chunk(&data).await.map_err(TransferError::Store)?;
                Ok::<Digest, TransferError>(digest)
            });
        }

        futures::future::try_join_all(fetches).await?;

        // Commit the source's chunk list verbatim: the blob digest is a
        // function of its chunk boundaries, so re-chunking locally would
        // produce a different digest for the same bytes.
        let committed = self
            .store
            .commit_blob(remote_chunks)
            .await
            .map_err(TransferError::Store)?;
        debug_assert_eq!(committed, *blob_digest);

        Ok(TransferProgress {
            blob_digest: *blob_digest,
            total_chunks,
            completed_chunks: total_chunks,
        })
    }
}

async fn fetch_with_retry(
    source: &dyn ChunkSource,
    digest: Digest,
    retry_limit: u32,
) -> Result<(Digest, Vec<u8>), TransferError> {
    let mut attempts = 0u32;
    loop {
        let data = source.fetch_chunk(&digest).await?;
        if Digest::of(&data) == digest {
            return Ok((digest, data));
        }
        attempts += 1;
        warn!(%digest, attempts, "chunk failed verification");
        if attempts > retry_limit {
            return Err(TransferError::Corrupted {
                digest,
                reason: "recomputed digest mismatch after retry".to_string(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cas::store::PutMetadata;
    use crate::cas::FsBackend;
    use crate::config::CasConfig;
    use std::collections::HashMap;
    use tokio::sync::Mutex;

    struct FakeSource {
        chunks: HashMap<Digest, Vec<u8>>,
        order: Vec<Digest>,
        fail_once: Mutex<HashSet<Digest>>,
    }

    #[async_trait]
    impl ChunkSource for FakeSource {
        async fn list_chunks(&self, _blob_digest: &Digest) -> Result<Vec<Digest>, TransferError> {
            Ok(self.order.clone())
        }

        async fn fetch_chunk(&self, digest: &Digest) -> Result<Vec<u8>, TransferError> {
            let mut fail_once = self.fail_once.lock().await;
            if fail_once.remove(digest) {
                return Ok(b"corrupted-on-purpose".to_vec());
            }
            self.chunks
                .get(digest)
                .cloned()
                .ok_or_else(|| TransferError::SourceUnavailable(digest.to_hex()))
        }
    }

    async fn fresh_store() -> ContentStore {
        let dir = tempfile::tempdir().unwrap().into_path();
        let backend = Arc::new(FsBackend::open(dir.join("objects")).await.unwrap());
        let meta = Arc::new(FsBackend::open(dir.join("meta")).await.unwrap());
        ContentStore::open(CasConfig::default(), backend, meta).await.unwrap()
    }

    fn make_source(chunk_bytes: &[&[u8]]) -> (Arc<FakeSource>, Digest) {
        let mut chunks = HashMap::new();
        let mut order = Vec::new();
        for data in chunk_bytes {
            let digest = Digest::of(data);
            chunks.insert(digest, data.to_vec());
            order.push(digest);
        }
        let blob_digest = Digest::of_chunks(order.iter());
        (
            Arc::new(FakeSource {
                chunks,
                order,
                fail_once: Mutex::new(HashSet::new()),
            }),
            blob_digest,
        )
    }

    #[tokio::test]
    async fn transfers_a_full_blob_from_scratch() {
        let store = fresh_store().await;
        let (source, blob_digest) = make_source(&[b"chunk-one", b"chunk-two", b"chunk-three"]);
        let transfer = Transfer::new(&store, source, TransferConfig::default());
        let progress = transfer.run(&blob_digest).await.unwrap();
        assert_eq!(progress.completed_chunks, 3);
        assert!(store.exists(&blob_digest).await);
        let bytes = store.get(&blob_digest).await.unwrap();
        assert_eq!(bytes, b"chunk-onechunk-twochunk-three");
    }

    #[tokio::test]
    async fn already_present_blob_short_circuits() {
        let store = fresh_store().await;
        let data = b"already have this one";
        let digest = store.put(data, PutMetadata::default()).await.unwrap();
        let (source, _) = make_source(&[b"unused"]);
        let transfer = Transfer::new(&store, source, TransferConfig::default());
        let progress = transfer.run(&digest).await.unwrap();
        assert_eq!(progress.total_chunks, progress.completed_chunks);
    }

    #[tokio::test]
    async fn single_retry_then_fail_on_persistent_corruption() {
        let store = fresh_store().await;
        let (source, blob_digest) = make_source(&[b"a-chunk"]);
        {
            let mut fail_once = source.fail_once.lock().await;
            fail_once.insert(*source.order.first().unwrap());
        }
        // A retry budget of zero means even a single bad fetch fails the
        // transfer outright, without needing the fake source to corrupt
        // more than one attempt.
        let mut config = TransferConfig::default();
        config.chunk_retry_limit = 0;
        let transfer = Transfer::new(&store, source.clone(), config);
        let err = transfer.run(&blob_digest).await.unwrap_err();
        assert!(matches!(err, TransferError::Corrupted { .. }));
    }

    #[tokio::test]
    async fn resumes_after_partial_fetch_by_skipping_known_chunks() {
        let store = fresh_store().await;
        let (source, blob_digest) = make_source(&[b"alpha", b"beta"]);

        // Simulate a prior interrupted transfer that already landed the
        // first chunk directly into the store's chunk index.
        store.put(b"alpha", PutMetadata::default()).await.unwrap();

        let transfer = Transfer::new(&store, source, TransferConfig::default());
        let progress = transfer.run(&blob_digest).await.unwrap();
        assert_eq!(progress.completed_chunks, 2);
        assert_eq!(store.get(&blob_digest).await.unwrap(), b"alphabeta");
    }
}
