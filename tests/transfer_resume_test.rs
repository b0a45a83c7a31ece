//! Transfer resume after a destination restart: a transfer that already
//! has 600 of 1000 chunks locally fetches only the remaining 400 and still
//! commits the correct blob digest.

use async_trait::async_trait;
use meridian::cas;
use meridian::cas::store::PutMetadata;
use meridian::config::{CasConfig, ChunkMode, TransferConfig};
use meridian::digest::Digest;
use meridian::transfer::{ChunkSource, Transfer, TransferError};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Forwards chunk reads to a real source `ContentStore`, counting how many
/// chunks were actually fetched over the wire (as opposed to served from
/// the destination's own local index).
struct CountingSource {
    source: cas::ContentStore,
    fetch_count: AtomicUsize,
}

#[async_trait]
impl ChunkSource for CountingSource {
    async fn list_chunks(&self, blob_digest: &Digest) -> Result<Vec<Digest>, TransferError> {
        self.source
            .blob_entry(blob_digest)
            .map(|e| e.chunk_digests)
            .ok_or_else(|| TransferError::SourceUnavailable(format!("{blob_digest} not found at source")))
    }

    async fn fetch_chunk(&self, digest: &Digest) -> Result<Vec<u8>, TransferError> {
        self.fetch_count.fetch_add(1, Ordering::SeqCst);
        self.source
            .get_chunk_plaintext(digest)
            .await
            .map_err(|_| TransferError::Corrupted { digest: *digest, reason: "source read failed".to_string() })
    }
}

fn shared_cas_config(root: std::path::PathBuf) -> CasConfig {
    let mut config = CasConfig::default();
    config.root = root;
    config.chunk_mode = ChunkMode::Fixed;
    config.min_chunk_size = 1;
    config.avg_chunk_size = 64;
    config.max_chunk_size = 1024 * 1024;
    config
}

#[tokio::test]
async fn restart_resumes_from_locally_known_chunks_only() {
    let source_dir = tempfile::tempdir().unwrap();
    let dest_dir = tempfile::tempdir().unwrap();

    let source = cas::open(shared_cas_config(source_dir.path().to_path_buf())).await.unwrap();
    let destination = cas::open(shared_cas_config(dest_dir.path().to_path_buf())).await.unwrap();

    let chunk_size = 64usize;
    let total_chunks = 1000usize;
    let mut full_bytes = Vec::with_capacity(chunk_size * total_chunks);
    for i in 0..total_chunks {
        let mut block = vec![0u8; chunk_size];
        let tag = format!("chunk-{i:04}");
        block[..tag.len()].copy_from_slice(tag.as_bytes());
        full_bytes.extend_from_slice(&block);
    }

    let blob_digest = source.put(&full_bytes, PutMetadata::default()).await.unwrap();
    let remote_chunk_digests = source.blob_entry(&blob_digest).unwrap().chunk_digests;
    assert_eq!(remote_chunk_digests.len(), total_chunks);

    // Simulate a prior, interrupted attempt that already landed the first
    // 600 chunks locally before the destination process restarted.
    let already_fetched = 600;
    for digest in &remote_chunk_digests[..already_fetched] {
        let bytes = source.get_chunk_plaintext(digest).await.unwrap();
        destination.put(&bytes, PutMetadata::default()).await.unwrap();
    }
    assert!(!destination.exists(&blob_digest).await);
    for digest in &remote_chunk_digests[..already_fetched] {
        assert!(destination.chunk_entry(digest).is_some());
    }

    let counting_source = Arc::new(CountingSource { source, fetch_count: AtomicUsize::new(0) });
    let transfer = Transfer::new(&destination, counting_source.clone(), TransferConfig::default());
    let progress = transfer.run(&blob_digest).await.unwrap();

    assert_eq!(progress.total_chunks, total_chunks);
    assert_eq!(
        counting_source.fetch_count.load(Ordering::SeqCst),
        total_chunks - already_fetched,
        "only the missing 400 chunks should have been fetched"
    );

    assert!(destination.exists(&blob_digest).await);
    let assembled = destination.get(&blob_digest).await.unwrap();
    assert_eq!(assembled, full_bytes);
}
