//! Snapshotting: folding a prefix of the committed log into a single
//! state-machine image so the log doesn't grow without bound.
//!
//! The image is the `placement::PlacementIndex` plus the voting set — the
//! only derived state that must survive a restart without replaying the
//! whole log — serialized with `bincode`.

use crate::identity::NodeId;
use crate::placement::PlacementIndex;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Bookkeeping plus payload for one snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    /// Index of the last log entry folded into this snapshot.
    pub last_included_index: u64,
    /// Term of `last_included_index`.
    pub last_included_term: u64,
    /// Byte size of the encoded state, for diagnostics.
    pub size_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SnapshotFile {
    metadata: SnapshotMetadata,
    placement: PlacementIndex,
    /// The voting set as of `last_included_index`, so a restart (or a
    /// freshly caught-up follower) recovers membership changes folded into
    /// the truncated prefix.
    voters: Vec<NodeId>,
}

/// Captures and restores snapshots of the placement projection to/from
/// `<data_dir>/snapshots/snapshot.bin`, a sibling of the log's `segments/`
/// directory.
pub struct SnapshotStore {
    path: PathBuf,
}

impl SnapshotStore {
    /// Open the snapshot store rooted at `data_dir`.
    pub fn new(data_dir: &Path) -> Self {
        Self {
            path: data_dir.join("snapshots").join("snapshot.bin"),
        }
    }

    fn ensure_dir(&self) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(())
    }

    /// Capture the current placement projection as of `last_included_index`
    /// / `last_included_term`, writing it atomically.
    pub fn capture(
        &self,
        last_included_index: u64,
        last_included_term: u64,
        placement: &PlacementIndex,
        voters: &[NodeId],
    ) -> std::io::Result<SnapshotMetadata> {
        let encoded_placement =
            bincode::serialize(placement).expect("PlacementIndex is always serializable");
        let metadata = SnapshotMetadata {
            last_included_index,
            last_included_term,
            size_bytes: encoded_placement.len(),
        };
        let file = SnapshotFile {
            metadata: metadata.clone(),
            placement: placement.clone(),
            voters: voters.to_vec(),
        };
        let bytes = bincode::serialize(&file).expect("SnapshotFile is always serializable");
        self.ensure_dir()?;
        let tmp_path = self.path.with_extension("bin.tmp");
        let mut handle = std::fs::File::create(&tmp_path)?;
        handle.write_all(&bytes)?;
        handle.sync_all()?;
        std::fs::rename(&tmp_path, &self.path)?;
        Ok(metadata)
    }

    /// Load the most recent snapshot, if one exists.
    pub fn load(&self) -> std::io::Result<Option<(SnapshotMetadata, PlacementIndex, Vec<NodeId>)>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let bytes = std::fs::read(&self.path)?;
        let file: SnapshotFile = bincode::deserialize(&bytes)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        Ok(Some((file.metadata, file.placement, file.voters)))
    }

    /// Encode a snapshot for transmission to a lagging follower via
    /// `InstallSnapshot`.
    pub fn encode(metadata: &SnapshotMetadata, placement: &PlacementIndex, voters: &[NodeId]) -> Vec<u8> {
        let file = SnapshotFile {
            metadata: metadata.clone(),
            placement: placement.clone(),
            voters: voters.to_vec(),
        };
        bincode::serialize(&file).expect("SnapshotFile is always serializable")
    }

    /// Decode a snapshot received over `InstallSnapshot` and persist it as
    /// the new local snapshot.
    pub fn install(&self, data: &[u8]) -> std::io::Result<(SnapshotMetadata, PlacementIndex, Vec<NodeId>)> {
        let file: SnapshotFile = bincode::deserialize(data)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        self.ensure_dir()?;
        let tmp_path = self.path.with_extension("bin.tmp");
        std::fs::write(&tmp_path, data)?;
        std::fs::rename(&tmp_path, &self.path)?;
        Ok((file.metadata, file.placement, file.voters))
    }
}
