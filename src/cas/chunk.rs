//! Chunking strategies for blobs entering the content-addressed store.
//!
//! Two modes are supported, chosen store-wide by `config::ChunkMode`:
//! fixed-size chunking (simple, sufficient for cold data) and content-defined
//! chunking via a rolling hash (maximizes deduplication across model
//! versions that share prefixes). The chunker only decides where chunk
//! boundaries fall; hashing and storage happen in `cas::store`.

use crate::config::{ChunkMode, CasConfig};

/// A single chunk's raw bytes, produced by a chunker before hashing.
pub struct RawChunk {
    /// The chunk's bytes.
    pub data: Vec<u8>,
}

/// Splits a byte stream into chunks according to the store's configured
/// chunking mode.
pub struct Chunker {
    mode: ChunkMode,
    min_size: usize,
    avg_size: usize,
    max_size: usize,
}

impl Chunker {
    /// Build a chunker from the store's CAS configuration.
    pub fn from_config(config: &CasConfig) -> Self {
        Self {
            mode: config.chunk_mode,
            min_size: config.min_chunk_size,
            avg_size: config.avg_chunk_size,
            max_size: config.max_chunk_size,
        }
    }

    /// Split `bytes` into ordered chunks. An empty input yields zero chunks
    /// (the empty-blob boundary case is handled by the caller, which stores
    /// a zero-length blob whose digest is the empty-string hash).
    pub fn split(&self, bytes: &[u8]) -> Vec<RawChunk> {
        if bytes.is_empty() {
            return Vec::new();
        }
        match self.mode {
            ChunkMode::Fixed => self.split_fixed(bytes),
            ChunkMode::Variable => self.split_variable(bytes),
        }
    }

    fn split_fixed(&self, bytes: &[u8]) -> Vec<RawChunk> {
        bytes
            .chunks(self.avg_size)
            .map(|slice| RawChunk {
                data: slice.to_vec(),
            })
            .collect()
    }

    /// Content-defined chunking using a Gear-style rolling hash: a boundary
    /// is declared wherever the rolling hash's low bits match a mask, biased
    /// toward `avg_size` by the mask width, and always clamped to
    /// `[min_size, max_size]`.
    fn split_variable(&self, bytes: &[u8]) -> Vec<RawChunk> {
        let mask = boundary_mask(self.avg_size);
        let mut chunks = Vec::new();
        let mut start = 0usize;
        let mut hash: u64 = 0;

        let mut i = 0usize;
        while i < bytes.len() {
            let remaining_in_chunk = i - start;
            hash = (hash.wrapping_shl(1)).wrapping_add(GEAR[bytes[i] as usize]);
            i += 1;

            let at_boundary = remaining_in_chunk + 1 >= self.min_size
                && (hash & mask) == 0
                && remaining_in_chunk + 1 < self.max_size;
            let forced_boundary = remaining_in_chunk + 1 >= self.max_size;

            if at_boundary || forced_boundary || i == bytes.len() {
                chunks.push(RawChunk {
                    data: bytes[start..i].to_vec(),
                });
                start = i;
                hash = 0;
            }
        }

        chunks
    }
}

/// Derive a bitmask whose popcount targets an expected run length of
/// `avg_size` bytes between boundaries (`2^bits ~= avg_size`).
fn boundary_mask(avg_size: usize) -> u64 {
    let bits = (avg_size.max(2) as f64).log2().round() as u32;
    (1u64 << bits.min(63)) - 1
}

/// A precomputed table of pseudo-random 64-bit values indexed by byte value,
/// used by the Gear rolling hash. Fixed and deterministic so chunk
/// boundaries are reproducible across nodes and restarts.
static GEAR: [u64; 256] = gear_table();

const fn gear_table() -> [u64; 256] {
    let mut table = [0u64; 256];
    let mut i = 0usize;
    let mut state: u64 = 0x9E3779B97F4A7C15;
    while i < 256 {
        // splitmix64
        state = state.wrapping_add(0x9E3779B97F4A7C15);
        let mut z = state;
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58476D1CE4E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D049BB133111EB);
        z = z ^ (z >> 31);
        table[i] = z;
        i += 1;
    }
    table
}
