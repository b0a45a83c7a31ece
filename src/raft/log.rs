//! The replicated log's entry types and the append-only log itself.
//!
//! Payloads are a closed sum type: adding a new cluster-wide fact means
//! adding a variant and an apply rule, never a stringly-typed branch. On
//! disk the log is a directory of append-only segment files
//! (`segments/<first_index>.seg`, length-prefixed `bincode` records), with
//! term/vote/snapshot-boundary metadata in a small `meta.bin` rewritten
//! atomically on change. The per-entry offset index is rebuilt in memory on
//! open.

use crate::identity::NodeId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

/// The typed payloads a log entry can carry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EntryPayload {
    /// A node has joined the voting set or the cluster at large.
    NodeJoin {
        /// The joining node's identity.
        node_id: NodeId,
        /// Its peer-API address.
        addr: std::net::SocketAddr,
    },
    /// A node has left.
    NodeLeave {
        /// The departing node's identity.
        node_id: NodeId,
    },
    /// A model handle has been registered.
    ModelRegister {
        /// `family:tag` handle.
        name: String,
        /// The manifest blob's digest.
        manifest_digest: crate::digest::Digest,
        /// Declared total size of the model's artifacts, in bytes.
        declared_size: u64,
        /// Declared resource needs for serving this model.
        resources: ResourceNeeds,
    },
    /// A model handle has been removed.
    ModelUnregister {
        /// `family:tag` handle.
        name: String,
    },
    /// A desired placement has been added.
    PlacementAdd {
        /// The model.
        model_name: String,
        /// The node it should be placed on.
        node_id: NodeId,
    },
    /// A desired placement has been removed.
    PlacementRemove {
        /// The model.
        model_name: String,
        /// The node it should be removed from.
        node_id: NodeId,
    },
    /// A node's health has changed as observed by the leader.
    NodeHealth {
        /// The node.
        node_id: NodeId,
        /// Its new health state (joining/live/draining/suspect/dead).
        health: String,
    },
    /// An advisory scheduler rebalance proposal.
    SchedulerDirective {
        /// Human-readable description of the directive, e.g. which model
        /// should gain or lose a replica.
        description: String,
    },
}

/// A registered model's declared resource needs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceNeeds {
    /// Memory required to serve the model, in bytes.
    pub memory_bytes: u64,
    /// Accelerator class required, if any (e.g. `"gpu-24gb"`).
    pub accelerator_class: Option<String>,
}

/// One entry in the replicated log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Gap-free, 1-based position in the log.
    pub index: u64,
    /// The leader epoch that produced this entry.
    pub term: u64,
    /// The submitting client, for dedup on retry.
    pub client_id: uuid::Uuid,
    /// The submitting client's per-client sequence number, for dedup.
    pub client_seq: u64,
    /// The entry's payload.
    pub payload: EntryPayload,
}

/// Durable state beyond the entries themselves: the current term, who this
/// node voted for in it, and where the snapshotted prefix ends. Small, so
/// it is rewritten whole (write-to-temp, rename) on every change — losing a
/// term/vote write would let a node vote twice in one term.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct LogMeta {
    current_term: u64,
    voted_for: Option<NodeId>,
    /// Index of the last entry folded into a snapshot and dropped from the
    /// segments, 0 if none.
    snapshot_index: u64,
    /// Term of `snapshot_index`.
    snapshot_term: u64,
}

/// Entries per segment file before the log rolls to a new one.
const MAX_SEGMENT_ENTRIES: usize = 1024;

fn segment_file_name(first_index: u64) -> String {
    format!("{first_index:020}.seg")
}

/// The append-only replicated log plus its term/vote bookkeeping.
pub struct Log {
    meta: LogMeta,
    entries: Vec<LogEntry>,
    data_dir: PathBuf,
    /// First index and record count of the segment currently being appended
    /// to, `None` until the first append after open or rollover.
    active_segment: Option<(u64, usize)>,
    /// `(client_id, client_seq) -> index`, rebuilt from the entries on
    /// open. Lets a client that timed out waiting on a commit retry
    /// `propose` with the same pair and be handed back the original entry
    /// instead of appending a duplicate.
    dedup: HashMap<(uuid::Uuid, u64), u64>,
}

impl Log {
    /// Open (or initialize) the log at `data_dir`.
    pub fn open(data_dir: &Path) -> std::io::Result<Self> {
        let data_dir = data_dir.to_path_buf();
        std::fs::create_dir_all(data_dir.join("segments"))?;

        let meta_path = data_dir.join("meta.bin");
        let meta: LogMeta = if meta_path.exists() {
            let bytes = std::fs::read(&meta_path)?;
            bincode::deserialize(&bytes).unwrap_or_default()
        } else {
            LogMeta::default()
        };

        let mut segment_files: Vec<PathBuf> = std::fs::read_dir(data_dir.join("segments"))?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.extension().is_some_and(|ext| ext == "seg"))
            .collect();
        segment_files.sort();

        let mut entries: Vec<LogEntry> = Vec::new();
        let mut active_segment = None;
        for path in &segment_files {
            let records = read_segment(path)?;
            if let Some(first) = records.first() {
                active_segment = Some((first.index, records.len()));
            }
            entries.extend(records);
        }

        // Entries at or below the snapshot boundary are leftovers from a
        // truncation interrupted mid-rewrite; entries duplicated at one
        // index across old and new segment files resolve to the higher term
        // (the replacement a leader sent to fix a conflicting suffix).
        entries.retain(|e| e.index > meta.snapshot_index);
        entries.sort_by_key(|e| (e.index, std::cmp::Reverse(e.term)));
        entries.dedup_by_key(|e| e.index);

        let dedup = entries
            .iter()
            .map(|e| ((e.client_id, e.client_seq), e.index))
            .collect();

        Ok(Self {
            meta,
            entries,
            data_dir,
            active_segment,
            dedup,
        })
    }

    fn meta_path(&self) -> PathBuf {
        self.data_dir.join("meta.bin")
    }

    fn segments_dir(&self) -> PathBuf {
        self.data_dir.join("segments")
    }

    fn persist_meta(&self) -> std::io::Result<()> {
        let bytes = bincode::serialize(&self.meta).expect("LogMeta is always serializable");
        let tmp_path = self.meta_path().with_extension("bin.tmp");
        let mut file = std::fs::File::create(&tmp_path)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
        std::fs::rename(&tmp_path, self.meta_path())?;
        Ok(())
    }

    /// Append one entry's record to the active segment, rolling to a new
    /// segment file once the active one is full.
    fn append_record(&mut self, entry: &LogEntry) -> std::io::Result<()> {
        let first_index = match self.active_segment {
            Some((first, count)) if count < MAX_SEGMENT_ENTRIES => first,
            _ => {
                self.active_segment = Some((entry.index, 0));
                entry.index
            }
        };
        let path = self.segments_dir().join(segment_file_name(first_index));
        let body = bincode::serialize(entry).expect("LogEntry is always serializable");
        let mut file = std::fs::OpenOptions::new().create(true).append(true).open(path)?;
        file.write_all(&(body.len() as u32).to_be_bytes())?;
        file.write_all(&body)?;
        file.sync_all()?;
        if let Some((_, count)) = self.active_segment.as_mut() {
            *count += 1;
        }
        Ok(())
    }

    /// Rewrite every segment file from the in-memory entries. Used on the
    /// rare mutations that are not pure appends: a conflicting-suffix
    /// truncation from the leader, or a snapshot prefix truncation. New
    /// segments are written and renamed into place before stale files are
    /// removed, so a crash leaves a superset the open-time dedup resolves.
    fn rewrite_segments(&mut self) -> std::io::Result<()> {
        let dir = self.segments_dir();
        let mut keep = Vec::new();
        self.active_segment = None;
        for group in self.entries.chunks(MAX_SEGMENT_ENTRIES) {
            let first_index = group[0].index;
            let name = segment_file_name(first_index);
            let tmp_path = dir.join(format!("{name}.tmp"));
            let mut file = std::fs::File::create(&tmp_path)?;
            for entry in group {
                let body = bincode::serialize(entry).expect("LogEntry is always serializable");
                file.write_all(&(body.len() as u32).to_be_bytes())?;
                file.write_all(&body)?;
            }
            file.sync_all()?;
            std::fs::rename(&tmp_path, dir.join(&name))?;
            self.active_segment = Some((first_index, group.len()));
            keep.push(name);
        }
        for existing in std::fs::read_dir(&dir)? {
            let existing = existing?.path();
            let is_kept = existing
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| keep.iter().any(|k| k == n));
            if !is_kept {
                let _ = std::fs::remove_file(existing);
            }
        }
        Ok(())
    }

    /// The current term.
    pub fn current_term(&self) -> u64 {
        self.meta.current_term
    }

    /// Who this node voted for in the current term, if anyone.
    pub fn voted_for(&self) -> Option<NodeId> {
        self.meta.voted_for
    }

    /// Advance to a new term, clearing the vote. Persists immediately:
    /// losing this write would let a node vote twice in the same term.
    pub fn set_term(&mut self, term: u64, voted_for: Option<NodeId>) -> std::io::Result<()> {
        self.meta.current_term = term;
        self.meta.voted_for = voted_for;
        self.persist_meta()
    }

    /// Record a vote in the current term without changing it.
    pub fn record_vote(&mut self, candidate: NodeId) -> std::io::Result<()> {
        self.meta.voted_for = Some(candidate);
        self.persist_meta()
    }

    /// Index of the last entry in the log (including any snapshotted
    /// prefix), 0 if the log (and any prior snapshot) is empty.
    pub fn last_index(&self) -> u64 {
        self.entries
            .last()
            .map(|e| e.index)
            .unwrap_or(self.meta.snapshot_index)
    }

    /// Term of the last entry, 0 if empty.
    pub fn last_term(&self) -> u64 {
        self.entries
            .last()
            .map(|e| e.term)
            .unwrap_or(self.meta.snapshot_term)
    }

    /// Fetch an entry by index, if it hasn't been snapshotted away.
    pub fn get(&self, index: u64) -> Option<&LogEntry> {
        self.entries.iter().find(|e| e.index == index)
    }

    /// Term of the entry at `index`, consulting the snapshot boundary for
    /// indices at or before it.
    pub fn term_at(&self, index: u64) -> Option<u64> {
        if index == self.meta.snapshot_index {
            return Some(self.meta.snapshot_term);
        }
        self.get(index).map(|e| e.term)
    }

    /// Append a new entry authored at the given term by the leader. Used
    /// only by the leader; followers use `append_from_leader`.
    ///
    /// If `(client_id, client_seq)` already named an entry in this log, that
    /// entry is returned unchanged instead of appending a duplicate — this
    /// is the dedup a client's retried `propose` after a commit timeout
    /// relies on.
    pub fn append(&mut self, term: u64, client_id: uuid::Uuid, client_seq: u64, payload: EntryPayload) -> std::io::Result<LogEntry> {
        if let Some(&index) = self.dedup.get(&(client_id, client_seq)) {
            if let Some(existing) = self.get(index) {
                return Ok(existing.clone());
            }
        }
        let index = self.last_index() + 1;
        let entry = LogEntry {
            index,
            term,
            client_id,
            client_seq,
            payload,
        };
        self.entries.push(entry.clone());
        self.append_record(&entry)?;
        self.dedup.insert((client_id, client_seq), index);
        Ok(entry)
    }

    /// Apply a follower-side `AppendEntries`: truncate any conflicting
    /// suffix starting at the first new entry's index, then append.
    /// `prev_log_index`/`prev_log_term` must already have been checked by
    /// the caller. Pure appends go straight to the
    /// active segment; a conflicting suffix forces a segment rewrite.
    pub fn append_from_leader(&mut self, entries: Vec<LogEntry>) -> std::io::Result<()> {
        let mut conflicted = false;
        let mut appended = Vec::new();
        for entry in entries {
            if let Some(existing) = self.get(entry.index) {
                if existing.term == entry.term {
                    continue;
                }
            }
            if self.entries.last().is_some_and(|e| e.index >= entry.index) {
                conflicted = true;
                self.entries.retain(|e| e.index < entry.index);
                self.dedup.retain(|_, index| *index < entry.index);
            }
            self.dedup.insert((entry.client_id, entry.client_seq), entry.index);
            self.entries.push(entry.clone());
            appended.push(entry);
        }
        self.entries.sort_by_key(|e| e.index);
        if conflicted {
            self.rewrite_segments()
        } else {
            for entry in &appended {
                self.append_record(entry)?;
            }
            Ok(())
        }
    }

    /// Entries strictly after `after_index`, capped at `limit`.
    pub fn entries_after(&self, after_index: u64, limit: usize) -> Vec<LogEntry> {
        self.entries
            .iter()
            .filter(|e| e.index > after_index)
            .take(limit)
            .cloned()
            .collect()
    }

    /// Drop every entry at or before `up_to_index`, recording it as folded
    /// into a snapshot at `up_to_term`. Used after a successful snapshot
    /// capture.
    pub fn truncate_prefix(&mut self, up_to_index: u64, up_to_term: u64) -> std::io::Result<()> {
        self.entries.retain(|e| e.index > up_to_index);
        self.meta.snapshot_index = up_to_index;
        self.meta.snapshot_term = up_to_term;
        self.persist_meta()?;
        self.rewrite_segments()
    }

    /// Number of entries currently held (excluding the snapshotted prefix),
    /// compared against the snapshot threshold.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Index at which the log was last snapshotted (0 if never).
    pub fn snapshot_index(&self) -> u64 {
        self.meta.snapshot_index
    }
}

/// Read every complete record from one segment file. A short or undecodable
/// tail (a crash mid-append) ends the segment rather than failing the open.
fn read_segment(path: &Path) -> std::io::Result<Vec<LogEntry>> {
    let mut file = std::fs::File::open(path)?;
    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes)?;

    let mut records = Vec::new();
    let mut cursor = 0usize;
    while cursor + 4 <= bytes.len() {
        let len = u32::from_be_bytes(bytes[cursor..cursor + 4].try_into().expect("4-byte slice")) as usize;
        cursor += 4;
        if cursor + len > bytes.len() {
            break;
        }
        match bincode::deserialize::<LogEntry>(&bytes[cursor..cursor + len]) {
            Ok(entry) => records.push(entry),
            Err(_) => break,
        }
        cursor += len;
    }
    Ok(records)
}
