//! Node identity: an Ed25519 keypair whose public key doubles as the node's
//! stable identifier in gossip and the replicated log.
//!
//! Exactly what the cluster needs and no more: an identity peers can
//! verify, and a signature peers can check on votes and gossip digests.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A node's public identity, usable as a map key and wire-serializable.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeId(#[serde(with = "serde_verifying_key")] VerifyingKey);

impl NodeId {
    /// Render as lower-hex, the canonical string form used in logs and the
    /// wire protocol.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0.as_bytes())
    }

    /// Parse a node id from its lower-hex representation.
    pub fn from_hex(s: &str) -> Result<Self, IdentityError> {
        let bytes = hex::decode(s).map_err(|_| IdentityError::InvalidEncoding)?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| IdentityError::InvalidEncoding)?;
        let key = VerifyingKey::from_bytes(&arr).map_err(|_| IdentityError::InvalidEncoding)?;
        Ok(NodeId(key))
    }

    /// Verify a signature over `message` was produced by this node's key.
    pub fn verify(&self, message: &[u8], signature: &NodeSignature) -> bool {
        self.0.verify(message, &signature.0).is_ok()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.to_hex())
    }
}

/// A detached signature produced by a `NodeKeyPair`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSignature(#[serde(with = "serde_signature")] Signature);

/// Errors decoding an identity or signature from the wire.
#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    /// The hex or byte encoding was malformed.
    #[error("invalid identity encoding")]
    InvalidEncoding,
}

/// A node's private keypair. Never serialized; held only in process memory
/// for the lifetime of the node.
pub struct NodeKeyPair(SigningKey);

impl NodeKeyPair {
    /// Generate a fresh keypair, e.g. on first node bootstrap.
    pub fn generate() -> Self {
        NodeKeyPair(SigningKey::generate(&mut OsRng))
    }

    /// Reconstruct a keypair from its 32-byte secret seed, e.g. loaded from
    /// the node's data directory.
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        NodeKeyPair(SigningKey::from_bytes(seed))
    }

    /// The 32-byte secret seed, for persistence.
    pub fn seed(&self) -> [u8; 32] {
        self.0.to_bytes()
    }

    /// This node's public identity.
    pub fn node_id(&self) -> NodeId {
        NodeId(self.0.verifying_key())
    }

    /// Sign a message (a vote request, a gossip digest, a fencing token).
    pub fn sign(&self, message: &[u8]) -> NodeSignature {
        NodeSignature(self.0.sign(message))
    }
}

mod serde_verifying_key {
    use ed25519_dalek::VerifyingKey;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(key: &VerifyingKey, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_bytes(key.as_bytes())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<VerifyingKey, D::Error> {
        let bytes: Vec<u8> = Vec::deserialize(d)?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("verifying key must be 32 bytes"))?;
        VerifyingKey::from_bytes(&arr).map_err(serde::de::Error::custom)
    }
}

mod serde_signature {
    use ed25519_dalek::Signature;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(sig: &Signature, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_bytes(&sig.to_bytes())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Signature, D::Error> {
        let bytes: Vec<u8> = Vec::deserialize(d)?;
        let arr: [u8; 64] = bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("signature must be 64 bytes"))?;
        Ok(Signature::from_bytes(&arr))
    }
}
