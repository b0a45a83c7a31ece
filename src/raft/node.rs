//! `RaftNode`: the leader-election and log-replication state machine.
//!
//! One leader per term; an entry is committed once a strict majority of the
//! voting set has replicated it, and a committed entry is never rewritten.
//! Elections route each peer's `RequestVote` through `tokio::spawn` and an
//! `mpsc` channel and only declare a winner once real responses reach
//! quorum or the randomized election timeout elapses.

use crate::identity::NodeId;
use crate::placement::PlacementIndex;
use crate::raft::log::{EntryPayload, Log, LogEntry};
use crate::raft::snapshot::SnapshotStore;
use crate::raft::transport::{RaftRequest, RaftResponse, RaftRpcHandler, RaftTransport};
use crate::config::RaftConfig;
use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::time::{sleep, Duration, Instant};
use tracing::{debug, info, instrument, warn};

/// Errors raised directly by `RaftNode` operations (as opposed to wire
/// errors, which live in `raft::transport::TransportError`).
#[derive(Debug, Error)]
pub enum RaftError {
    /// A write was proposed to a node that is not currently the leader.
    #[error("not the leader; current leader is {0:?}")]
    NotLeader(Option<NodeId>),
    /// The proposal did not reach a committed state before its deadline.
    #[error("proposal timed out before reaching commit")]
    ProposalTimeout,
    /// The leader could not confirm a quorum for a read-index check.
    #[error("lost contact with a quorum of the voting set")]
    QuorumLost,
    /// A voting-set change was proposed while an earlier one is still
    /// uncommitted.
    #[error("another voting-set change is still in flight")]
    MembershipChangeInFlight,
    /// Persisting the log or a snapshot failed.
    #[error("storage error: {0}")]
    Storage(#[from] std::io::Error),
}

impl RaftError {
    /// Fold into the crate-wide taxonomy.
    pub fn kind(&self) -> crate::error::ErrorKind {
        match self {
            RaftError::NotLeader(_) => crate::error::ErrorKind::Unavailable,
            RaftError::ProposalTimeout => crate::error::ErrorKind::Timeout,
            RaftError::QuorumLost => crate::error::ErrorKind::Unavailable,
            RaftError::MembershipChangeInFlight => crate::error::ErrorKind::Conflict,
            RaftError::Storage(_) => crate::error::ErrorKind::TransientIO,
        }
    }
}

/// Which role this node currently believes it holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

/// A leader's authority token: the term it was elected in plus its identity,
/// attached to work the leader farms out (inference dispatch) so a deposed
/// leader's stragglers are refused by executing nodes that have already
/// heard from a newer term. Carries election safety onto the data path.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FencingToken {
    /// The term the issuing leader was elected in.
    pub term: u64,
    /// The issuing leader.
    pub leader: NodeId,
}

struct LeaderState {
    next_index: HashMap<NodeId, u64>,
    match_index: HashMap<NodeId, u64>,
}

impl LeaderState {
    fn new(voters: &[NodeId], last_log_index: u64) -> Self {
        let mut next_index = HashMap::new();
        let mut match_index = HashMap::new();
        for voter in voters {
            next_index.insert(*voter, last_log_index + 1);
            match_index.insert(*voter, 0);
        }
        Self { next_index, match_index }
    }
}

/// The Raft control-plane state machine for one node.
pub struct RaftNode {
    local_id: NodeId,
    /// The voting set. Seeded from configuration (or a snapshot) and
    /// mutated only by applying committed `NodeJoin`/`NodeLeave` entries,
    /// one change at a time.
    voters: parking_lot::RwLock<Vec<NodeId>>,
    config: RaftConfig,
    transport: Arc<dyn RaftTransport>,
    log: Mutex<Log>,
    snapshots: SnapshotStore,
    role: RwLock<Role>,
    current_leader: RwLock<Option<NodeId>>,
    leader_state: RwLock<Option<LeaderState>>,
    commit_index: AtomicU64,
    last_applied: AtomicU64,
    placement: RwLock<PlacementIndex>,
    /// Bumped on every granted vote, heartbeat received, or valid
    /// AppendEntries, to reset the follower's election clock.
    last_contact: RwLock<Instant>,
    /// While leader: the last time a quorum of peers answered a heartbeat
    /// round. A leader that goes a full election timeout without quorum
    /// contact steps down rather than keep serving stale reads.
    last_quorum_contact: RwLock<Instant>,
}

impl RaftNode {
    /// Construct a node. Allocation only — the caller decides when the
    /// background election/heartbeat tasks start running.
    pub fn new(
        local_id: NodeId,
        mut voters: Vec<NodeId>,
        config: RaftConfig,
        transport: Arc<dyn RaftTransport>,
    ) -> std::io::Result<Self> {
        let log = Log::open(&config.data_dir)?;
        let snapshots = SnapshotStore::new(&config.data_dir);
        let (placement, last_applied) = match snapshots.load()? {
            Some((meta, placement, snapshot_voters)) => {
                // A snapshot's voting set reflects committed membership
                // changes and supersedes the bootstrap configuration.
                if !snapshot_voters.is_empty() {
                    voters = snapshot_voters;
                }
                (placement, meta.last_included_index)
            }
            None => (PlacementIndex::new(), 0),
        };
        Ok(Self {
            local_id,
            voters: parking_lot::RwLock::new(voters),
            config,
            transport,
            log: Mutex::new(log),
            snapshots,
            role: RwLock::new(Role::Follower),
            current_leader: RwLock::new(None),
            leader_state: RwLock::new(None),
            commit_index: AtomicU64::new(last_applied),
            last_applied: AtomicU64::new(last_applied),
            placement: RwLock::new(placement),
            last_contact: RwLock::new(Instant::now()),
            last_quorum_contact: RwLock::new(Instant::now()),
        })
    }

    /// This node's role, for diagnostics and the status endpoint.
    pub async fn role(&self) -> Role {
        *self.role.read().await
    }

    /// The node currently believed to be leader, if known.
    pub async fn current_leader(&self) -> Option<NodeId> {
        *self.current_leader.read().await
    }

    /// This node's own identity.
    pub fn local_id(&self) -> NodeId {
        self.local_id
    }

    /// The highest log index known committed, for the status endpoint.
    pub fn committed_index(&self) -> u64 {
        self.commit_index.load(Ordering::SeqCst)
    }

    /// The full voting set.
    pub fn voters(&self) -> Vec<NodeId> {
        self.voters.read().clone()
    }

    fn peers(&self) -> Vec<NodeId> {
        self.voters
            .read()
            .iter()
            .copied()
            .filter(|v| *v != self.local_id)
            .collect()
    }

    /// Strict-majority quorum size for the voting set, including self.
    fn quorum_size(&self) -> usize {
        self.voters.read().len() / 2 + 1
    }

    fn random_election_timeout(&self) -> Duration {
        let min = self.config.election_timeout_min.as_millis() as u64;
        let max = self.config.election_timeout_max.as_millis() as u64;
        let millis = rand::thread_rng().gen_range(min..=max.max(min + 1));
        Duration::from_millis(millis)
    }

    /// Run the election-timeout and heartbeat loops until `shutdown` fires.
    /// Spawned once by `node::NodeHandle::start`.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        loop {
            let role = self.role().await;
            let tick = match role {
                Role::Leader => self.config.heartbeat_interval,
                _ => {
                    let last_contact = *self.last_contact.read().await;
                    let timeout = self.random_election_timeout();
                    let elapsed = last_contact.elapsed();
                    if elapsed >= timeout {
                        Duration::from_millis(0)
                    } else {
                        timeout - elapsed
                    }
                }
            };

            tokio::select! {
                _ = sleep(tick) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
            }

            if *shutdown.borrow() {
                return;
            }

            match self.role().await {
                Role::Leader => {
                    let acks = self.send_heartbeats().await;
                    if acks + 1 >= self.quorum_size() {
                        *self.last_quorum_contact.write().await = Instant::now();
                    } else if self.last_quorum_contact.read().await.elapsed() >= self.config.election_timeout_max {
                        let term = self.log.lock().await.current_term();
                        warn!(term, "leader lost quorum contact, stepping down");
                        self.step_down(term).await;
                    }
                }
                _ => {
                    let last_contact = *self.last_contact.read().await;
                    if last_contact.elapsed() >= self.random_election_timeout() {
                        self.start_election().await;
                    }
                }
            }
        }
    }

    /// Log-consistent read barrier: confirm this node is still the
    /// quorum-acknowledged leader, then return the commit index a caller
    /// must be caught up to. Local (eventually consistent) reads skip this
    /// and go straight to `placement()`.
    pub async fn read_index(self: &Arc<Self>) -> Result<u64, RaftError> {
        if self.role().await != Role::Leader {
            return Err(RaftError::NotLeader(self.current_leader().await));
        }
        let acks = self.send_heartbeats().await;
        if acks + 1 < self.quorum_size() {
            return Err(RaftError::QuorumLost);
        }
        *self.last_quorum_contact.write().await = Instant::now();
        Ok(self.commit_index.load(Ordering::SeqCst))
    }

    #[instrument(skip(self))]
    async fn start_election(self: &Arc<Self>) {
        let (term, last_log_index, last_log_term) = {
            let mut log = self.log.lock().await;
            let new_term = log.current_term() + 1;
            log.set_term(new_term, Some(self.local_id)).ok();
            (new_term, log.last_index(), log.last_term())
        };
        *self.role.write().await = Role::Candidate;
        *self.current_leader.write().await = None;
        *self.last_contact.write().await = Instant::now();
        info!(term, "starting election");

        let peers = self.peers();
        if peers.is_empty() {
            // Single-node cluster: the self-vote alone is a quorum.
            self.become_leader(term).await;
            return;
        }

        let (tx, mut rx) = mpsc::channel::<RaftResponse>(peers.len().max(1));
        for peer in peers {
            let transport = self.transport.clone();
            let tx = tx.clone();
            let request = RaftRequest::RequestVote {
                term,
                candidate_id: self.local_id,
                last_log_index,
                last_log_term,
            };
            tokio::spawn(async move {
                if let Ok(response) = transport.call(peer, request).await {
                    let _ = tx.send(response).await;
                }
            });
        }
        drop(tx);

        let mut votes = 1usize; // self-vote
        let deadline = sleep(self.random_election_timeout());
        tokio::pin!(deadline);
        loop {
            if votes >= self.quorum_size() {
                self.become_leader(term).await;
                return;
            }
            tokio::select! {
                maybe_response = rx.recv() => {
                    match maybe_response {
                        Some(RaftResponse::Vote { term: resp_term, vote_granted }) => {
                            if resp_term > term {
                                self.step_down(resp_term).await;
                                return;
                            }
                            if vote_granted {
                                votes += 1;
                            }
                        }
                        Some(_) => {}
                        None => {
                            // Every RPC has completed or failed and all
                            // senders are gone; nothing left to arrive
                            // before quorum, so idle out the remaining
                            // deadline instead of busy-looping on a
                            // channel that will keep resolving instantly.
                            if votes < self.quorum_size() {
                                (&mut deadline).await;
                                debug!(votes, needed = self.quorum_size(), "election exhausted all peers without quorum");
                                return;
                            }
                        }
                    }
                }
                _ = &mut deadline => {
                    debug!(votes, needed = self.quorum_size(), "election timed out without quorum");
                    return;
                }
            }
            if self.role().await != Role::Candidate {
                // Stepped down mid-election (e.g. saw a higher-term AppendEntries).
                return;
            }
        }
    }

    async fn become_leader(self: &Arc<Self>, term: u64) {
        if self.log.lock().await.current_term() != term {
            return;
        }
        info!(term, "elected leader");
        *self.role.write().await = Role::Leader;
        *self.current_leader.write().await = Some(self.local_id);
        *self.last_quorum_contact.write().await = Instant::now();
        let last_log_index = self.log.lock().await.last_index();
        let voters = self.voters();
        *self.leader_state.write().await = Some(LeaderState::new(&voters, last_log_index));
        self.send_heartbeats().await;
    }

    async fn step_down(&self, new_term: u64) {
        let mut log = self.log.lock().await;
        if new_term > log.current_term() {
            log.set_term(new_term, None).ok();
        }
        drop(log);
        *self.role.write().await = Role::Follower;
        *self.leader_state.write().await = None;
        *self.last_contact.write().await = Instant::now();
    }

    /// One replication round to every peer. Returns how many peers answered
    /// at all, the leader's evidence that it can still reach a quorum.
    async fn send_heartbeats(self: &Arc<Self>) -> usize {
        let peers = self.peers();
        let mut acks = 0;
        for peer in peers {
            if self.replicate_to(peer).await {
                acks += 1;
            }
        }
        acks
    }

    /// Send whatever entries `peer` is missing (or a bare heartbeat if it is
    /// caught up), and advance `match_index`/`commit_index` on success.
    /// A peer that has fallen behind the snapshot boundary is caught up with
    /// `InstallSnapshot` instead. Returns whether the peer responded.
    async fn replicate_to(self: &Arc<Self>, peer: NodeId) -> bool {
        let next_index = {
            let leader_state = self.leader_state.read().await;
            match leader_state.as_ref() {
                Some(ls) => *ls.next_index.get(&peer).unwrap_or(&1),
                None => return false,
            }
        };

        let (term, snapshot_boundary) = {
            let log = self.log.lock().await;
            (log.current_term(), log.snapshot_index())
        };
        if snapshot_boundary > 0 && next_index <= snapshot_boundary {
            return self.install_snapshot_on(peer, term).await;
        }

        let (prev_log_index, prev_log_term, entries, leader_commit) = {
            let log = self.log.lock().await;
            let prev_log_index = next_index.saturating_sub(1);
            let prev_log_term = log.term_at(prev_log_index).unwrap_or(0);
            let entries = log.entries_after(prev_log_index, self.config.max_append_entries);
            (
                prev_log_index,
                prev_log_term,
                entries,
                self.commit_index.load(Ordering::SeqCst),
            )
        };

        let request = RaftRequest::AppendEntries {
            term,
            leader_id: self.local_id,
            prev_log_index,
            prev_log_term,
            entries,
            leader_commit,
        };

        let response = match self.transport.call(peer, request).await {
            Ok(r) => r,
            Err(_) => return false,
        };

        match response {
            RaftResponse::Append { term: resp_term, success, match_index } => {
                if resp_term > term {
                    self.step_down(resp_term).await;
                    return true;
                }
                let mut leader_state = self.leader_state.write().await;
                if let Some(ls) = leader_state.as_mut() {
                    if success {
                        ls.match_index.insert(peer, match_index);
                        ls.next_index.insert(peer, match_index + 1);
                    } else {
                        let retreated = ls.next_index.get(&peer).copied().unwrap_or(1).saturating_sub(1).max(1);
                        ls.next_index.insert(peer, retreated);
                    }
                }
                drop(leader_state);
                self.advance_commit_index().await;
                true
            }
            _ => true,
        }
    }

    /// Push the current snapshot to a follower whose `next_index` fell
    /// behind the truncated log prefix.
    async fn install_snapshot_on(self: &Arc<Self>, peer: NodeId, term: u64) -> bool {
        let Ok(Some((meta, placement, voters))) = self.snapshots.load() else {
            return false;
        };
        let request = RaftRequest::InstallSnapshot {
            term,
            leader_id: self.local_id,
            last_included_index: meta.last_included_index,
            last_included_term: meta.last_included_term,
            data: SnapshotStore::encode(&meta, &placement, &voters),
        };
        match self.transport.call(peer, request).await {
            Ok(RaftResponse::Snapshot { term: resp_term }) => {
                if resp_term > term {
                    self.step_down(resp_term).await;
                    return true;
                }
                let mut leader_state = self.leader_state.write().await;
                if let Some(ls) = leader_state.as_mut() {
                    ls.match_index.insert(peer, meta.last_included_index);
                    ls.next_index.insert(peer, meta.last_included_index + 1);
                }
                true
            }
            Ok(_) => true,
            Err(_) => false,
        }
    }

    async fn advance_commit_index(&self) {
        // `match_index` already carries the leader's own entry (kept in
        // sync by `propose`), so no extra value needs to be pushed here —
        // doing so would double-count the leader and let a write commit
        // before a real quorum of followers has replicated it. The guard is
        // dropped before taking the log lock; `apply_committed` acquires
        // locks in the opposite order.
        let voters = self.voters();
        let mut match_indices: Vec<u64> = {
            let leader_state = self.leader_state.read().await;
            let Some(ls) = leader_state.as_ref() else { return };
            // Only current voters count toward quorum: a node that left the
            // voting set may still ack replication, but its ack is not a vote.
            ls.match_index
                .iter()
                .filter(|(id, _)| voters.contains(id))
                .map(|(_, index)| *index)
                .collect()
        };
        match_indices.sort_unstable_by(|a, b| b.cmp(a));
        let quorum = self.quorum_size();
        if match_indices.len() < quorum {
            return;
        }
        let quorum_index = match_indices[quorum - 1];

        // Leader completeness: only commit entries from the current term by
        // counting replicas, never an earlier term's entry directly.
        if quorum_index > self.commit_index.load(Ordering::SeqCst) {
            let log = self.log.lock().await;
            if log.term_at(quorum_index) == Some(log.current_term()) {
                self.commit_index.store(quorum_index, Ordering::SeqCst);
            }
        }
        self.apply_committed().await;
    }

    async fn apply_committed(&self) {
        let commit_index = self.commit_index.load(Ordering::SeqCst);
        let mut last_applied = self.last_applied.load(Ordering::SeqCst);
        if commit_index <= last_applied {
            return;
        }
        let log = self.log.lock().await;
        let mut placement = self.placement.write().await;
        while last_applied < commit_index {
            last_applied += 1;
            let Some(entry) = log.get(last_applied).cloned() else {
                continue;
            };
            self.apply_membership_change(&entry.payload).await;
            placement.apply(last_applied, &entry.payload);
        }
        self.last_applied.store(last_applied, Ordering::SeqCst);

        if log.len() >= self.config.snapshot_threshold {
            let term = log.term_at(last_applied).unwrap_or(0);
            drop(log);
            let voters = self.voters();
            if let Err(e) = self.snapshots.capture(last_applied, term, &placement, &voters) {
                warn!(error = %e, "snapshot capture failed");
            } else {
                let mut log = self.log.lock().await;
                log.truncate_prefix(last_applied, term).ok();
            }
        }
    }

    /// Fold a committed `NodeJoin`/`NodeLeave` into the voting set. Other
    /// payloads pass through untouched.
    async fn apply_membership_change(&self, payload: &EntryPayload) {
        match payload {
            EntryPayload::NodeJoin { node_id, addr } => {
                let added = {
                    let mut voters = self.voters.write();
                    if voters.contains(node_id) {
                        false
                    } else {
                        voters.push(*node_id);
                        true
                    }
                };
                if added {
                    info!(node = %node_id, "voting set gained a member");
                    self.transport.register_peer(*node_id, *addr).await;
                    let mut leader_state = self.leader_state.write().await;
                    if let Some(ls) = leader_state.as_mut() {
                        ls.next_index.insert(*node_id, self.commit_index.load(Ordering::SeqCst) + 1);
                        ls.match_index.insert(*node_id, 0);
                    }
                }
            }
            EntryPayload::NodeLeave { node_id } => {
                let removed = {
                    let mut voters = self.voters.write();
                    let before = voters.len();
                    voters.retain(|v| v != node_id);
                    voters.len() != before
                };
                if removed {
                    info!(node = %node_id, "voting set lost a member");
                    let mut leader_state = self.leader_state.write().await;
                    if let Some(ls) = leader_state.as_mut() {
                        ls.next_index.remove(node_id);
                        ls.match_index.remove(node_id);
                    }
                }
            }
            _ => {}
        }
    }

    /// Propose a new entry. Only the leader can accept proposals; followers
    /// return `NotLeader` so the caller can redirect.
    #[instrument(skip(self, payload))]
    pub async fn propose(
        self: &Arc<Self>,
        client_id: uuid::Uuid,
        client_seq: u64,
        payload: EntryPayload,
    ) -> Result<LogEntry, RaftError> {
        if self.role().await != Role::Leader {
            return Err(RaftError::NotLeader(self.current_leader().await));
        }
        // Single-server membership changes: at most one uncommitted
        // `NodeJoin`/`NodeLeave` at a time, so two overlapping changes can
        // never produce disjoint quorums.
        if is_membership_change(&payload) {
            let log = self.log.lock().await;
            let commit = self.commit_index.load(Ordering::SeqCst);
            let pending = log
                .entries_after(commit, usize::MAX)
                .iter()
                .any(|e| is_membership_change(&e.payload));
            if pending {
                return Err(RaftError::MembershipChangeInFlight);
            }
        }
        let term = self.log.lock().await.current_term();
        let entry = self.log.lock().await.append(term, client_id, client_seq, payload)?;

        if let Some(ls) = self.leader_state.write().await.as_mut() {
            ls.match_index.insert(self.local_id, entry.index);
        }
        // A single-voter set commits on the leader's own match alone; with
        // peers this is a no-op until their acks arrive below.
        self.advance_commit_index().await;
        self.send_heartbeats().await;

        let deadline = Instant::now() + self.config.election_timeout_max * 4;
        loop {
            if self.commit_index.load(Ordering::SeqCst) >= entry.index {
                // One more round so followers learn the advanced commit
                // index now instead of on the next heartbeat tick.
                self.send_heartbeats().await;
                return Ok(entry);
            }
            if Instant::now() >= deadline {
                return Err(RaftError::ProposalTimeout);
            }
            sleep(Duration::from_millis(10)).await;
        }
    }

    /// A read-only snapshot of the placement projection as of the last
    /// applied entry.
    pub async fn placement(&self) -> PlacementIndex {
        self.placement.read().await.clone()
    }

    /// The current term, as persisted.
    pub async fn current_term(&self) -> u64 {
        self.log.lock().await.current_term()
    }

    /// Mint a fencing token for work this leader is about to farm out.
    /// `None` on a non-leader: nothing it dispatches carries authority.
    pub async fn fencing_token(&self) -> Option<FencingToken> {
        if self.role().await != Role::Leader {
            return None;
        }
        Some(FencingToken {
            term: self.log.lock().await.current_term(),
            leader: self.local_id,
        })
    }
}

fn is_membership_change(payload: &EntryPayload) -> bool {
    matches!(
        payload,
        EntryPayload::NodeJoin { .. } | EntryPayload::NodeLeave { .. }
    )
}

#[async_trait]
impl RaftRpcHandler for RaftNode {
    async fn handle(&self, _from: NodeId, request: RaftRequest) -> RaftResponse {
        match request {
            RaftRequest::RequestVote { term, candidate_id, last_log_index, last_log_term } => {
                self.handle_request_vote(term, candidate_id, last_log_index, last_log_term).await
            }
            RaftRequest::AppendEntries { term, leader_id, prev_log_index, prev_log_term, entries, leader_commit } => {
                self.handle_append_entries(term, leader_id, prev_log_index, prev_log_term, entries, leader_commit).await
            }
            RaftRequest::InstallSnapshot { term, leader_id: _, last_included_index, last_included_term, data } => {
                self.handle_install_snapshot(term, last_included_index, last_included_term, &data).await
            }
        }
    }
}

impl RaftNode {
    async fn handle_request_vote(
        &self,
        term: u64,
        candidate_id: NodeId,
        last_log_index: u64,
        last_log_term: u64,
    ) -> RaftResponse {
        let mut log = self.log.lock().await;
        if term < log.current_term() {
            return RaftResponse::Vote { term: log.current_term(), vote_granted: false };
        }
        if term > log.current_term() {
            log.set_term(term, None).ok();
            drop(log);
            self.step_down(term).await;
            log = self.log.lock().await;
        }

        let already_voted_other = matches!(log.voted_for(), Some(v) if v != candidate_id);
        let candidate_log_ok = last_log_term > log.last_term()
            || (last_log_term == log.last_term() && last_log_index >= log.last_index());

        if already_voted_other || !candidate_log_ok {
            return RaftResponse::Vote { term: log.current_term(), vote_granted: false };
        }

        log.record_vote(candidate_id).ok();
        drop(log);
        *self.last_contact.write().await = Instant::now();
        RaftResponse::Vote {
            term,
            vote_granted: true,
        }
    }

    async fn handle_append_entries(
        &self,
        term: u64,
        leader_id: NodeId,
        prev_log_index: u64,
        prev_log_term: u64,
        entries: Vec<LogEntry>,
        leader_commit: u64,
    ) -> RaftResponse {
        let mut log = self.log.lock().await;
        if term < log.current_term() {
            return RaftResponse::Append { term: log.current_term(), success: false, match_index: 0 };
        }
        if term >= log.current_term() {
            let voted_for = log.voted_for();
            log.set_term(term, voted_for).ok();
        }
        drop(log);
        *self.role.write().await = Role::Follower;
        *self.current_leader.write().await = Some(leader_id);
        *self.last_contact.write().await = Instant::now();

        let mut log = self.log.lock().await;
        let matches_prev = prev_log_index == 0 || log.term_at(prev_log_index) == Some(prev_log_term);
        if !matches_prev {
            return RaftResponse::Append { term, success: false, match_index: 0 };
        }

        let last_new_index = entries.last().map(|e| e.index).unwrap_or(prev_log_index);
        log.append_from_leader(entries).ok();
        drop(log);

        if leader_commit > self.commit_index.load(Ordering::SeqCst) {
            // fetch_max: a heartbeat whose prev sits behind our tail must
            // never walk an already-advanced commit index backwards.
            self.commit_index.fetch_max(leader_commit.min(last_new_index), Ordering::SeqCst);
            self.apply_committed().await;
        }

        RaftResponse::Append {
            term,
            success: true,
            match_index: last_new_index,
        }
    }

    async fn handle_install_snapshot(
        &self,
        term: u64,
        last_included_index: u64,
        last_included_term: u64,
        data: &[u8],
    ) -> RaftResponse {
        let current_term = self.log.lock().await.current_term();
        if term < current_term {
            return RaftResponse::Snapshot { term: current_term };
        }
        // A snapshot at or behind what this node already applied carries
        // nothing new; installing it would rewind the state machine.
        if last_included_index <= self.last_applied.load(Ordering::SeqCst) {
            return RaftResponse::Snapshot { term };
        }
        if let Ok((meta, placement, voters)) = self.snapshots.install(data) {
            let mut current = self.placement.write().await;
            *current = placement;
            if !voters.is_empty() {
                *self.voters.write() = voters;
            }
            self.last_applied.store(meta.last_included_index, Ordering::SeqCst);
            self.commit_index.fetch_max(meta.last_included_index, Ordering::SeqCst);
            let mut log = self.log.lock().await;
            log.truncate_prefix(last_included_index, last_included_term).ok();
        }
        *self.last_contact.write().await = Instant::now();
        RaftResponse::Snapshot { term }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::NodeKeyPair;
    use crate::raft::transport::TransportError;
    use std::collections::HashMap as StdHashMap;
    use std::sync::Mutex as StdMutex;

    /// An in-process transport routing calls directly between `RaftNode`s
    /// registered in a shared table, used instead of real TCP sockets.
    struct LoopbackTransport {
        nodes: StdMutex<StdHashMap<NodeId, Arc<RaftNode>>>,
    }

    impl LoopbackTransport {
        fn new() -> Arc<Self> {
            Arc::new(Self { nodes: StdMutex::new(StdHashMap::new()) })
        }

        fn register(&self, id: NodeId, node: Arc<RaftNode>) {
            self.nodes.lock().unwrap().insert(id, node);
        }
    }

    #[async_trait]
    impl RaftTransport for LoopbackTransport {
        async fn call(&self, peer: NodeId, request: RaftRequest) -> Result<RaftResponse, TransportError> {
            let node = self.nodes.lock().unwrap().get(&peer).cloned();
            match node {
                Some(node) => Ok(node.handle(peer, request).await),
                None => Err(TransportError::UnknownPeer(peer)),
            }
        }
    }

    fn test_config(data_dir: std::path::PathBuf) -> RaftConfig {
        RaftConfig {
            data_dir,
            voters: Default::default(),
            heartbeat_interval: Duration::from_millis(20),
            election_timeout_min: Duration::from_millis(60),
            election_timeout_max: Duration::from_millis(100),
            max_append_entries: 64,
            snapshot_threshold: 10_000,
        }
    }

    async fn build_cluster(n: usize) -> (Arc<LoopbackTransport>, Vec<Arc<RaftNode>>, Vec<NodeId>) {
        let transport = LoopbackTransport::new();
        let ids: Vec<NodeId> = (0..n).map(|_| NodeKeyPair::generate().node_id()).collect();
        let mut nodes = Vec::new();
        for id in &ids {
            let dir = tempfile::tempdir().unwrap();
            let node = Arc::new(
                RaftNode::new(*id, ids.clone(), test_config(dir.path().join("raft")), transport.clone()).unwrap(),
            );
            std::mem::forget(dir); // keep the tempdir alive for the test's duration
            transport.register(*id, node.clone());
            nodes.push(node);
        }
        (transport, nodes, ids)
    }

    #[tokio::test]
    async fn single_node_cluster_elects_itself_leader() {
        let (_transport, nodes, _ids) = build_cluster(1).await;
        nodes[0].start_election().await;
        assert_eq!(nodes[0].role().await, Role::Leader);
    }

    #[tokio::test]
    async fn three_node_cluster_elects_exactly_one_leader() {
        let (_transport, nodes, _ids) = build_cluster(3).await;
        nodes[0].start_election().await;
        assert_eq!(nodes[0].role().await, Role::Leader);
        for follower in &nodes[1..] {
            assert_eq!(follower.role().await, Role::Follower);
        }
    }

    #[tokio::test]
    async fn leader_propose_replicates_and_commits() {
        let (_transport, nodes, ids) = build_cluster(3).await;
        nodes[0].start_election().await;
        assert_eq!(nodes[0].role().await, Role::Leader);

        let entry = nodes[0]
            .propose(
                uuid::Uuid::new_v4(),
                0,
                EntryPayload::PlacementAdd {
                    model_name: "llama:7b".to_string(),
                    node_id: ids[1],
                },
            )
            .await
            .unwrap();
        assert_eq!(entry.index, 1);

        for follower in &nodes[1..] {
            assert!(follower.placement().await.desired_nodes("llama:7b").contains(&ids[1]));
        }
    }

    #[tokio::test]
    async fn follower_rejects_proposal_with_not_leader() {
        let (_transport, nodes, ids) = build_cluster(3).await;
        nodes[0].start_election().await;
        let err = nodes[1]
            .propose(
                uuid::Uuid::new_v4(),
                0,
                EntryPayload::PlacementAdd {
                    model_name: "m".to_string(),
                    node_id: ids[0],
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RaftError::NotLeader(_)));
    }

    #[tokio::test]
    async fn read_index_succeeds_on_leader_and_rejects_followers() {
        let (_transport, nodes, _ids) = build_cluster(3).await;
        nodes[0].start_election().await;

        let index = nodes[0].read_index().await.unwrap();
        assert_eq!(index, nodes[0].committed_index());

        let err = nodes[1].read_index().await.unwrap_err();
        assert!(matches!(err, RaftError::NotLeader(_)));
    }

    #[tokio::test]
    async fn single_voter_commits_without_any_peer() {
        let (_transport, nodes, ids) = build_cluster(1).await;
        nodes[0].start_election().await;
        let entry = nodes[0]
            .propose(
                uuid::Uuid::new_v4(),
                0,
                EntryPayload::PlacementAdd {
                    model_name: "m".to_string(),
                    node_id: ids[0],
                },
            )
            .await
            .unwrap();
        assert_eq!(nodes[0].committed_index(), entry.index);
        assert!(nodes[0].placement().await.desired_nodes("m").contains(&ids[0]));
    }

    #[tokio::test]
    async fn committed_node_join_extends_the_voting_set_everywhere() {
        let (_transport, nodes, _ids) = build_cluster(3).await;
        nodes[0].start_election().await;
        assert_eq!(nodes[0].role().await, Role::Leader);

        let newcomer = NodeKeyPair::generate().node_id();
        nodes[0]
            .propose(
                uuid::Uuid::new_v4(),
                0,
                EntryPayload::NodeJoin {
                    node_id: newcomer,
                    addr: "127.0.0.1:7777".parse().unwrap(),
                },
            )
            .await
            .unwrap();

        for node in &nodes {
            assert!(node.voters().contains(&newcomer), "every replica must apply the join");
        }
        assert_eq!(nodes[0].quorum_size(), 3, "four voters need a quorum of three");
    }

    #[tokio::test]
    async fn committed_node_leave_shrinks_the_voting_set() {
        let (_transport, nodes, ids) = build_cluster(3).await;
        nodes[0].start_election().await;

        nodes[0]
            .propose(uuid::Uuid::new_v4(), 0, EntryPayload::NodeLeave { node_id: ids[2] })
            .await
            .unwrap();

        assert!(!nodes[0].voters().contains(&ids[2]));
        assert_eq!(nodes[0].quorum_size(), 2);
    }

    /// Grants every vote but fails every replication call, so a leader can
    /// exist while nothing it appends ever commits.
    struct VoteOnlyTransport;

    #[async_trait]
    impl RaftTransport for VoteOnlyTransport {
        async fn call(&self, peer: NodeId, request: RaftRequest) -> Result<RaftResponse, TransportError> {
            match request {
                RaftRequest::RequestVote { term, .. } => Ok(RaftResponse::Vote { term, vote_granted: true }),
                _ => Err(TransportError::Unreachable(peer, "replication disabled".into())),
            }
        }
    }

    #[tokio::test]
    async fn second_membership_change_is_rejected_while_one_is_uncommitted() {
        let local = NodeKeyPair::generate().node_id();
        let peer = NodeKeyPair::generate().node_id();
        let dir = tempfile::tempdir().unwrap();
        let node = Arc::new(
            RaftNode::new(local, vec![local, peer], test_config(dir.path().join("raft")), Arc::new(VoteOnlyTransport))
                .unwrap(),
        );
        node.start_election().await;
        assert_eq!(node.role().await, Role::Leader);

        let newcomer = NodeKeyPair::generate().node_id();
        let first = node
            .propose(
                uuid::Uuid::new_v4(),
                0,
                EntryPayload::NodeJoin {
                    node_id: newcomer,
                    addr: "127.0.0.1:7778".parse().unwrap(),
                },
            )
            .await;
        assert!(matches!(first, Err(RaftError::ProposalTimeout)), "nothing commits without replication");

        let second = node
            .propose(uuid::Uuid::new_v4(), 1, EntryPayload::NodeLeave { node_id: peer })
            .await;
        assert!(matches!(second, Err(RaftError::MembershipChangeInFlight)));
    }

    #[tokio::test]
    async fn stale_term_vote_request_is_rejected() {
        let (_transport, nodes, _ids) = build_cluster(3).await;
        nodes[0].start_election().await; // term becomes 1
        let response = nodes[0]
            .handle_request_vote(0, nodes[1].local_id, 0, 0)
            .await;
        assert!(matches!(response, RaftResponse::Vote { vote_granted: false, .. }));
    }
}
