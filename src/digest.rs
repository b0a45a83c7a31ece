//! Content digests: the addressing scheme for blobs and chunks in the CAS.
//!
//! A `Digest` is a 32-byte SHA-256 hash, rendered as lower-hex for display,
//! logs, and on-disk paths. Hashing itself lives here so `cas` and `transfer`
//! share one definition of "the digest of these bytes".

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use std::fmt;

/// A 32-byte SHA-256 content digest.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Digest([u8; 32]);

impl Digest {
    /// Hash a single byte slice.
    pub fn of(bytes: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        Digest(hasher.finalize().into())
    }

    /// Hash the concatenation of ordered chunk digests, used for chunked
    /// blobs where `digest == H(concat(chunk_digests_ordered bytes))`.
    pub fn of_chunks<'a>(chunks: impl IntoIterator<Item = &'a Digest>) -> Self {
        let mut hasher = Sha256::new();
        for c in chunks {
            hasher.update(c.as_bytes());
        }
        Digest(hasher.finalize().into())
    }

    /// The digest of the empty byte string, used for the empty-blob boundary
    /// case.
    pub fn empty() -> Self {
        Self::of(&[])
    }

    /// Raw bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Render as lower-hex, the canonical string form used in paths and the
    /// wire protocol.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// The first two hex characters, used to shard the filesystem backend.
    pub fn shard_prefix(&self) -> String {
        hex::encode(&self.0[..1])
    }

    /// Parse from a lower-hex string.
    pub fn from_hex(s: &str) -> Result<Self, DigestParseError> {
        let bytes = hex::decode(s).map_err(|_| DigestParseError::InvalidHex)?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| DigestParseError::WrongLength)?;
        Ok(Digest(arr))
    }
}

/// Errors parsing a digest from its hex representation.
#[derive(Debug, thiserror::Error)]
pub enum DigestParseError {
    /// The string was not valid hex.
    #[error("invalid hex digest")]
    InvalidHex,
    /// The decoded bytes were not 32 bytes long.
    #[error("digest must be 32 bytes")]
    WrongLength,
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", self.to_hex())
    }
}

impl std::str::FromStr for Digest {
    type Err = DigestParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Digest::from_hex(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_digest_is_stable() {
        let a = Digest::empty();
        let b = Digest::of(&[]);
        assert_eq!(a, b);
    }

    #[test]
    fn hex_round_trip() {
        let d = Digest::of(b"hello world");
        let hex = d.to_hex();
        let parsed = Digest::from_hex(&hex).unwrap();
        assert_eq!(d, parsed);
    }

    #[test]
    fn chunk_digest_is_order_sensitive() {
        let a = Digest::of(b"a");
        let b = Digest::of(b"b");
        let forward = Digest::of_chunks([&a, &b]);
        let backward = Digest::of_chunks([&b, &a]);
        assert_ne!(forward, backward);
    }

    #[test]
    fn shard_prefix_is_two_hex_chars() {
        let d = Digest::of(b"shard me");
        assert_eq!(d.shard_prefix().len(), 2);
    }
}
