//! `ContentStore`: the content-addressed, deduplicating, optionally
//! compressed blob store.
//!
//! A `DashMap`-backed concurrent index carries each blob's and chunk's
//! refcount and access statistics; the index is the authoritative in-memory
//! view and is mirrored to the metadata backend on every mutation so a
//! restart can rebuild it.

use crate::cas::backend::Backend;
use crate::cas::chunk::Chunker;
use crate::cas::compress;
use crate::config::{CasConfig, CompressionKind};
use crate::digest::Digest;
use crate::error::{Error, ErrorKind, Result};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// A blob's metadata entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlobEntry {
    /// The blob's digest.
    pub digest: Digest,
    /// Total logical (uncompressed, reassembled) size.
    pub logical_size: u64,
    /// Total stored (on-disk, possibly compressed) size across chunks.
    pub stored_size: u64,
    /// Ordered list of chunk digests composing this blob. Empty for a
    /// zero-length blob.
    pub chunk_digests: Vec<Digest>,
    /// Reference count.
    pub refcount: u32,
    /// Unix timestamp of creation.
    pub created_at: u64,
    /// Unix timestamp of last access.
    pub last_accessed: u64,
    /// Number of times this blob has been read.
    pub access_count: u64,
}

/// A chunk's metadata entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkEntry {
    /// The chunk's digest.
    pub digest: Digest,
    /// Logical (uncompressed) size.
    pub size: u64,
    /// On-disk (post-compression) size.
    pub stored_size: u64,
    /// Compression algorithm applied when this chunk was stored.
    pub compression: CompressionKind,
    /// Number of distinct blobs referencing this chunk.
    pub refcount: u32,
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Metadata a caller attaches to a `put`.
#[derive(Debug, Clone, Default)]
pub struct PutMetadata {
    /// Best-effort pre-hash of the full input, used to short-circuit
    /// chunking on an exact re-put.
    pub pre_hash: Option<Digest>,
}

/// The content-addressed store.
pub struct ContentStore {
    config: CasConfig,
    backend: Arc<dyn Backend>,
    meta: Arc<dyn Backend>,
    chunker: Chunker,
    blobs: DashMap<Digest, BlobEntry>,
    chunks: DashMap<Digest, ChunkEntry>,
    /// In-flight chunk writes, so concurrent puts of overlapping chunks
    /// perform at most one physical write per chunk digest globally.
    writing: DashMap<Digest, Arc<tokio::sync::Mutex<()>>>,
    total_stored_bytes: AtomicU64,
}

impl ContentStore {
    /// Open a content store, rebuilding its in-memory index from the
    /// metadata backend.
    pub async fn open(config: CasConfig, backend: Arc<dyn Backend>, meta: Arc<dyn Backend>) -> Result<Self> {
        let chunker = Chunker::from_config(&config);
        let store = Self {
            config,
            backend,
            meta,
            chunker,
            blobs: DashMap::new(),
            chunks: DashMap::new(),
            writing: DashMap::new(),
            total_stored_bytes: AtomicU64::new(0),
        };
        store.load_index().await?;
        Ok(store)
    }

    async fn load_index(&self) -> Result<()> {
        // Metadata files live under a derived key, not the entry's own
        // digest, so the entry body is the authoritative source of the
        // index key on rebuild.
        for key in self.meta.list().await? {
            let bytes = self.meta.retrieve(&key).await?;
            if let Ok(entry) = serde_json::from_slice::<BlobEntry>(&bytes) {
                self.blobs.insert(entry.digest, entry);
            } else if let Ok(entry) = serde_json::from_slice::<ChunkEntry>(&bytes) {
                self.total_stored_bytes.fetch_add(entry.stored_size, Ordering::Relaxed);
                self.chunks.insert(entry.digest, entry);
            }
        }
        Ok(())
    }

    async fn persist_blob(&self, entry: &BlobEntry) -> Result<()> {
        let bytes = serde_json::to_vec(entry).map_err(|e| Error::corrupted(e.to_string()))?;
        self.meta.store(&blob_meta_key(&entry.digest), &bytes).await
    }

    async fn persist_chunk(&self, entry: &ChunkEntry) -> Result<()> {
        let bytes = serde_json::to_vec(entry).map_err(|e| Error::corrupted(e.to_string()))?;
        self.meta.store(&chunk_meta_key(&entry.digest), &bytes).await
    }

    /// Store `bytes`, chunking, deduplicating, and compressing as
    /// configured. Idempotent: re-putting identical bytes returns the same
    /// digest and increments the blob's refcount rather than rewriting
    /// chunks.
    pub async fn put(&self, bytes: &[u8], metadata: PutMetadata) -> Result<Digest> {
        if let Some(pre_hash) = metadata.pre_hash {
            if let Some(mut entry) = self.blobs.get_mut(&pre_hash) {
                entry.refcount += 1;
                entry.last_accessed = now_secs();
                let snapshot = entry.clone();
                drop(entry);
                self.persist_blob(&snapshot).await?;
                return Ok(pre_hash);
            }
        }

        if bytes.is_empty() {
            return self.put_empty().await;
        }

        let raw_chunks = self.chunker.split(bytes);
        let chunk_digests: Vec<Digest> = raw_chunks.iter().map(|raw| Digest::of(&raw.data)).collect();
        let blob_digest = Digest::of_chunks(chunk_digests.iter());

        // Dedupe before any chunk write: a re-put of identical bytes only
        // bumps the blob's refcount, it never touches chunk refcounts (a
        // chunk's refcount counts distinct referring blobs, not puts).
        if let Some(mut entry) = self.blobs.get_mut(&blob_digest) {
            entry.refcount += 1;
            entry.last_accessed = now_secs();
            let snapshot = entry.clone();
            drop(entry);
            self.persist_blob(&snapshot).await?;
            return Ok(blob_digest);
        }

        let mut stored_size = 0u64;
        let mut seen = std::collections::HashSet::new();
        for (digest, raw) in chunk_digests.iter().zip(&raw_chunks) {
            if seen.insert(*digest) {
                stored_size += self.write_chunk_if_absent(*digest, &raw.data).await?;
            }
        }

        let entry = BlobEntry {
            digest: blob_digest,
            logical_size: bytes.len() as u64,
            stored_size,
            chunk_digests,
            refcount: 1,
            created_at: now_secs(),
            last_accessed: now_secs(),
            access_count: 0,
        };
        self.persist_blob(&entry).await?;
        self.blobs.insert(blob_digest, entry);

        Ok(blob_digest)
    }

    async fn put_empty(&self) -> Result<Digest> {
        let digest = Digest::empty();
        if let Some(mut entry) = self.blobs.get_mut(&digest) {
            entry.refcount += 1;
            let snapshot = entry.clone();
            drop(entry);
            self.persist_blob(&snapshot).await?;
            return Ok(digest);
        }
        let entry = BlobEntry {
            digest,
            logical_size: 0,
            stored_size: 0,
            chunk_digests: Vec::new(),
            refcount: 1,
            created_at: now_secs(),
            last_accessed: now_secs(),
            access_count: 0,
        };
        self.persist_blob(&entry).await?;
        self.blobs.insert(digest, entry);
        Ok(digest)
    }

    /// Write a chunk's bytes if no physical copy exists yet, bump its
    /// refcount either way, and return its stored (post-compression) size.
    async fn write_chunk_if_absent(&self, digest: Digest, data: &[u8]) -> Result<u64> {
        let lock = self
            .writing
            .entry(digest)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        if let Some(mut entry) = self.chunks.get_mut(&digest) {
            entry.refcount += 1;
            let snapshot = entry.clone();
            drop(entry);
            self.persist_chunk(&snapshot).await?;
            return Ok(snapshot.stored_size);
        }

        let entry = self.store_chunk_bytes(digest, data, 1).await?;
        Ok(entry.stored_size)
    }

    /// Compress and physically store one chunk, recording its entry with
    /// `refcount`. The caller holds (or doesn't need) the per-digest write
    /// lock.
    async fn store_chunk_bytes(&self, digest: Digest, data: &[u8], refcount: u32) -> Result<ChunkEntry> {
        let (kind, compressed) =
            compress::compress(data, self.config.compression, self.config.compression_threshold)
                .map_err(|e| Error::new(ErrorKind::Fatal, e.to_string()))?;
        self.backend.store(&digest, &compressed).await?;

        let entry = ChunkEntry {
            digest,
            size: data.len() as u64,
            stored_size: compressed.len() as u64,
            compression: kind,
            refcount,
        };
        self.persist_chunk(&entry).await?;
        self.total_stored_bytes.fetch_add(entry.stored_size, Ordering::Relaxed);
        self.chunks.insert(digest, entry.clone());
        Ok(entry)
    }

    /// Store one verified chunk without attaching it to any blob yet
    /// (refcount 0). Used by the transfer layer, which lands chunks as they
    /// arrive and only binds them to a blob entry at commit; a chunk left
    /// loose by an interrupted transfer stays reusable until GC reclaims it.
    pub async fn insert_loose_chunk(&self, data: &[u8]) -> Result<Digest> {
        let digest = Digest::of(data);
        let lock = self
            .writing
            .entry(digest)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        if self.chunks.contains_key(&digest) {
            return Ok(digest);
        }
        self.store_chunk_bytes(digest, data, 0).await?;
        Ok(digest)
    }

    /// Record a blob entry over chunks that are already present in the
    /// chunk index, bumping each distinct chunk's refcount. The blob digest
    /// is derived from the chunk list, so a transfer that commits a peer's
    /// chunk list reproduces the peer's blob digest exactly.
    pub async fn commit_blob(&self, chunk_digests: Vec<Digest>) -> Result<Digest> {
        if chunk_digests.is_empty() {
            return self.put_empty().await;
        }
        let blob_digest = Digest::of_chunks(chunk_digests.iter());

        if let Some(mut entry) = self.blobs.get_mut(&blob_digest) {
            entry.refcount += 1;
            entry.last_accessed = now_secs();
            let snapshot = entry.clone();
            drop(entry);
            self.persist_blob(&snapshot).await?;
            return Ok(blob_digest);
        }

        let mut logical_size = 0u64;
        let mut stored_size = 0u64;
        let mut seen = std::collections::HashSet::new();
        for digest in &chunk_digests {
            let chunk = self
                .chunks
                .get(digest)
                .map(|c| c.clone())
                .ok_or_else(|| Error::not_found(format!("chunk {digest} not present; cannot commit blob")))?;
            logical_size += chunk.size;
            if seen.insert(*digest) {
                stored_size += chunk.stored_size;
                let Some(mut entry) = self.chunks.get_mut(digest) else {
                    return Err(Error::not_found(format!("chunk {digest} vanished during commit")));
                };
                entry.refcount += 1;
                let snapshot = entry.clone();
                drop(entry);
                self.persist_chunk(&snapshot).await?;
            }
        }

        let entry = BlobEntry {
            digest: blob_digest,
            logical_size,
            stored_size,
            chunk_digests,
            refcount: 1,
            created_at: now_secs(),
            last_accessed: now_secs(),
            access_count: 0,
        };
        self.persist_blob(&entry).await?;
        self.blobs.insert(blob_digest, entry);
        Ok(blob_digest)
    }

    /// Retrieve a blob's bytes in order, transparently decompressing and
    /// verifying each chunk's digest.
    pub async fn get(&self, digest: &Digest) -> Result<Vec<u8>> {
        let mut entry = self
            .blobs
            .get_mut(digest)
            .ok_or_else(|| Error::not_found(format!("blob {digest} not found")))?;
        entry.access_count += 1;
        entry.last_accessed = now_secs();
        let snapshot = entry.clone();
        drop(entry);
        self.persist_blob(&snapshot).await?;

        if snapshot.chunk_digests.is_empty() {
            return Ok(Vec::new());
        }

        let mut out = Vec::with_capacity(snapshot.logical_size as usize);
        for chunk_digest in &snapshot.chunk_digests {
            let chunk_meta = self
                .chunks
                .get(chunk_digest)
                .ok_or_else(|| Error::corrupted(format!("missing chunk index for {chunk_digest}")))?
                .clone();
            let raw = self.backend.retrieve(chunk_digest).await?;
            let plain = compress::decompress(&raw, chunk_meta.compression)
                .map_err(|e| Error::corrupted(e.to_string()))?;
            if Digest::of(&plain) != *chunk_digest {
                return Err(Error::corrupted(format!(
                    "chunk {chunk_digest} failed digest verification"
                )));
            }
            out.extend_from_slice(&plain);
        }

        if Digest::of_chunks(snapshot.chunk_digests.iter()) != snapshot.digest {
            return Err(Error::corrupted(format!(
                "blob {digest} chunk list does not hash to its own digest"
            )));
        }

        Ok(out)
    }

    /// Whether a blob with this digest is known to the store.
    pub async fn exists(&self, digest: &Digest) -> bool {
        self.blobs.contains_key(digest)
    }

    /// A blob's logical size.
    pub async fn size(&self, digest: &Digest) -> Result<u64> {
        self.blobs
            .get(digest)
            .map(|e| e.logical_size)
            .ok_or_else(|| Error::not_found(format!("blob {digest} not found")))
    }

    /// Fetch and verify a single chunk's plaintext bytes by digest, without
    /// going through a blob. Used by the transfer layer when reassembling a
    /// blob whose chunks are partly already local and partly freshly
    /// fetched.
    pub async fn get_chunk_plaintext(&self, digest: &Digest) -> Result<Vec<u8>> {
        let chunk_meta = self
            .chunks
            .get(digest)
            .ok_or_else(|| Error::not_found(format!("chunk {digest} not found")))?
            .clone();
        let raw = self.backend.retrieve(digest).await?;
        let plain = compress::decompress(&raw, chunk_meta.compression)
            .map_err(|e| Error::corrupted(e.to_string()))?;
        if Digest::of(&plain) != *digest {
            return Err(Error::corrupted(format!("chunk {digest} failed digest verification")));
        }
        Ok(plain)
    }

    /// Bump a blob's refcount without re-supplying its bytes, used by
    /// higher layers (e.g. the placement index) that hold a logical
    /// reference to a model's manifest blob.
    pub async fn acquire(&self, digest: &Digest) -> Result<()> {
        let mut entry = self
            .blobs
            .get_mut(digest)
            .ok_or_else(|| Error::not_found(format!("blob {digest} not found")))?;
        entry.refcount += 1;
        let snapshot = entry.clone();
        drop(entry);
        self.persist_blob(&snapshot).await
    }

    /// Drop a previously acquired reference. Does not immediately delete
    /// bytes; physical removal happens during GC.
    pub async fn release(&self, digest: &Digest) -> Result<()> {
        let mut entry = self
            .blobs
            .get_mut(digest)
            .ok_or_else(|| Error::not_found(format!("blob {digest} not found")))?;
        entry.refcount = entry.refcount.saturating_sub(1);
        let snapshot = entry.clone();
        drop(entry);
        self.persist_blob(&snapshot).await
    }

    /// Every blob digest currently indexed.
    pub async fn list(&self) -> Vec<Digest> {
        self.blobs.iter().map(|e| *e.key()).collect()
    }

    /// Snapshot a blob's metadata, used by GC and diagnostics.
    pub fn blob_entry(&self, digest: &Digest) -> Option<BlobEntry> {
        self.blobs.get(digest).map(|e| e.clone())
    }

    /// Snapshot a chunk's metadata.
    pub fn chunk_entry(&self, digest: &Digest) -> Option<ChunkEntry> {
        self.chunks.get(digest).map(|e| e.clone())
    }

    /// Total physical bytes stored across all chunks, used for
    /// `max_total_size` enforcement and diagnostics.
    pub fn total_stored_bytes(&self) -> u64 {
        self.total_stored_bytes.load(Ordering::Relaxed)
    }

    /// Blobs read at least `min_access_count` times: the hot set, derived
    /// from the per-blob access counters. A backend that can tier media may
    /// use this to promote; the reference filesystem backend only reports
    /// it.
    pub fn hot_blobs(&self, min_access_count: u64) -> Vec<Digest> {
        self.blobs
            .iter()
            .filter(|e| e.access_count >= min_access_count)
            .map(|e| *e.key())
            .collect()
    }

    /// Remove a blob entry and release its chunk references, without
    /// touching chunk bytes on disk (physical chunk removal is GC's job).
    /// Used internally by `gc` once a blob has passed its age/refcount
    /// checks.
    pub(crate) async fn remove_blob_entry(&self, digest: &Digest) -> Result<Vec<Digest>> {
        let (_, entry) = self
            .blobs
            .remove(digest)
            .ok_or_else(|| Error::not_found(format!("blob {digest} not found")))?;
        self.meta.delete(&blob_meta_key(digest)).await?;

        // One decrement per distinct chunk: a blob that repeats a chunk
        // still only held one reference to it.
        let distinct: std::collections::HashSet<Digest> = entry.chunk_digests.iter().copied().collect();
        let mut freed_chunks = Vec::new();
        for chunk_digest in distinct {
            if let Some(mut chunk) = self.chunks.get_mut(&chunk_digest) {
                chunk.refcount = chunk.refcount.saturating_sub(1);
                if chunk.refcount == 0 {
                    freed_chunks.push(chunk_digest);
                } else {
                    let snapshot = chunk.clone();
                    drop(chunk);
                    self.persist_chunk(&snapshot).await?;
                }
            }
        }
        Ok(freed_chunks)
    }

    /// Physically delete a chunk with zero refcount. Called only by `gc`,
    /// either for chunks freed by a blob removal or for loose chunks a
    /// crashed transfer left behind. A second purge of the same digest is a
    /// no-op.
    pub(crate) async fn purge_chunk(&self, digest: &Digest) -> Result<()> {
        if let Some((_, entry)) = self.chunks.remove(digest) {
            self.total_stored_bytes.fetch_sub(entry.stored_size, Ordering::Relaxed);
        }
        self.meta.delete(&chunk_meta_key(digest)).await?;
        self.backend.delete(digest).await
    }

    /// Chunks currently held by no blob at all, eligible for GC.
    pub(crate) fn zero_refcount_chunks(&self) -> Vec<Digest> {
        self.chunks
            .iter()
            .filter(|c| c.refcount == 0)
            .map(|c| *c.key())
            .collect()
    }

    /// Direct access to the backend, used by the transfer layer to fetch
    /// individual chunks for a peer without going through blob reassembly.
    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }
}

fn blob_meta_key(digest: &Digest) -> Digest {
    Digest::of(format!("blob:{digest}").as_bytes())
}

fn chunk_meta_key(digest: &Digest) -> Digest {
    Digest::of(format!("chunk:{digest}").as_bytes())
}
