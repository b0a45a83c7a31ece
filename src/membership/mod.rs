//! Peer Membership: gossip-based, best-effort health and address
//! propagation. Authoritative voting membership lives in the replicated
//! log (`raft::NodeJoin`/`NodeLeave`); this module only tracks liveness
//! hints and network addresses for the scheduler and placement index.
//!
//! The protocol is pure digest exchange: each round, a node sends its whole
//! member table to a few random peers and merges whatever comes back,
//! newest incarnation (or worse health at equal incarnation) winning. No
//! ping/ack probing — timeouts alone drive the
//! `live -> suspect -> dead -> forgotten` walk, and any successful contact
//! snaps a member straight back to `live`.

use crate::identity::{NodeId, NodeKeyPair, NodeSignature};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::{debug, info, instrument};

pub use crate::config::MembershipConfig;
use crate::error::ErrorKind;

/// Membership-specific errors, folded into the crate error taxonomy.
#[derive(Debug, Error)]
pub enum MembershipError {
    /// No known address for a peer we tried to gossip with.
    #[error("unknown peer: {0}")]
    UnknownPeer(NodeId),
    /// The gossip transport failed to reach a peer.
    #[error("gossip exchange with {peer} failed: {reason}")]
    Unreachable {
        /// The peer that could not be reached.
        peer: NodeId,
        /// Transport-level failure detail.
        reason: String,
    },
}

impl MembershipError {
    /// Fold into the crate-wide error taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            MembershipError::UnknownPeer(_) => ErrorKind::NotFound,
            MembershipError::Unreachable { .. } => ErrorKind::Unavailable,
        }
    }
}

/// A node's gossip health state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Health {
    /// Just discovered; has not completed a gossip round yet.
    Joining,
    /// Reachable as of the last gossip round or direct contact.
    Live,
    /// No direct contact for `suspect_timeout`.
    Suspect,
    /// No contact for `suspect_timeout + dead_timeout`; entry lingers for
    /// `forget_timeout` before removal.
    Dead,
}

/// A peer's declared capacity hint, gossiped alongside health so the
/// scheduler can reason about nodes it hasn't dispatched to yet.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Capacity {
    /// Declared maximum concurrent inferences, 0 meaning unknown.
    pub max_concurrency: u32,
}

/// One member's gossiped state, the unit exchanged between peers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberSummary {
    /// The member's identity.
    pub node_id: NodeId,
    /// The member's current peer-API address.
    pub addr: SocketAddr,
    /// Gossiped health.
    pub health: Health,
    /// Gossiped capacity hint.
    pub capacity: Capacity,
    /// Unix timestamp of the last time this summary's source directly
    /// observed the member.
    pub last_seen: u64,
    /// Monotonically increasing per-member version, bumped on every local
    /// status change so staler gossip never overwrites newer state.
    pub incarnation: u64,
}

/// A gossip digest bound to its sender: the member list plus an Ed25519
/// signature over its serialized form, so a peer cannot gossip on behalf of
/// another node's identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedMemberDigest {
    /// The digest's author.
    pub from: NodeId,
    /// The author's view of the cluster.
    pub members: Vec<MemberSummary>,
    /// Signature over the serialized member list.
    pub signature: NodeSignature,
}

impl SignedMemberDigest {
    /// Sign `members` as `keypair`'s current view.
    pub fn sign(keypair: &NodeKeyPair, members: Vec<MemberSummary>) -> Self {
        let bytes = bincode::serialize(&members).expect("member summaries are always serializable");
        Self {
            from: keypair.node_id(),
            members,
            signature: keypair.sign(&bytes),
        }
    }

    /// Whether `signature` was produced by `from` over exactly `members`.
    pub fn verify(&self) -> bool {
        let bytes = bincode::serialize(&self.members).expect("member summaries are always serializable");
        self.from.verify(&bytes, &self.signature)
    }
}

/// A locally tracked member, `MemberSummary` plus the bookkeeping needed to
/// drive local timeouts.
#[derive(Debug, Clone)]
struct Member {
    summary: MemberSummary,
    /// When `summary.health` last changed, used to time the
    /// suspect -> dead and dead -> forgotten transitions.
    status_since: u64,
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Whether `candidate` should overwrite `current`: newer incarnation wins,
/// and at equal incarnation the worse health state wins.
fn should_overwrite(current: &MemberSummary, candidate: &MemberSummary) -> bool {
    candidate.incarnation > current.incarnation
        || (candidate.incarnation == current.incarnation && candidate.health > current.health)
}

/// Outbound gossip transport, implemented by the real HTTP client in
/// `api::peer_api` and by in-process fakes in tests.
#[async_trait::async_trait]
pub trait GossipTransport: Send + Sync {
    /// Exchange digests with `addr`: send `local_digest`, return the peer's
    /// view of the cluster.
    async fn exchange(
        &self,
        peer: &NodeId,
        addr: SocketAddr,
        local_digest: Vec<MemberSummary>,
    ) -> Result<Vec<MemberSummary>, MembershipError>;
}

/// Tracks peer membership via periodic gossip. Constructing a manager only
/// allocates; `run_periodic` must be spawned explicitly by the node's
/// `start()` to begin gossiping.
pub struct MembershipManager {
    local_id: NodeId,
    members: DashMap<NodeId, Member>,
    config: MembershipConfig,
    transport: Arc<dyn GossipTransport>,
}

impl MembershipManager {
    /// Create a manager seeded with only the local node, in `Joining`
    /// state until its first gossip round completes.
    pub fn new(
        local_id: NodeId,
        local_addr: SocketAddr,
        config: MembershipConfig,
        transport: Arc<dyn GossipTransport>,
    ) -> Self {
        let members = DashMap::new();
        let now = now_secs();
        members.insert(
            local_id,
            Member {
                summary: MemberSummary {
                    node_id: local_id,
                    addr: local_addr,
                    health: Health::Joining,
                    capacity: Capacity::default(),
                    last_seen: now,
                    incarnation: 0,
                },
                status_since: now,
            },
        );
        Self {
            local_id,
            members,
            config,
            transport,
        }
    }

    /// Seed the table with a known peer (e.g. from static configuration or
    /// a discovered voter), without waiting for gossip to discover it.
    pub fn seed(&self, node_id: NodeId, addr: SocketAddr) {
        self.members.entry(node_id).or_insert_with(|| Member {
            summary: MemberSummary {
                node_id,
                addr,
                health: Health::Joining,
                capacity: Capacity::default(),
                last_seen: now_secs(),
                incarnation: 0,
            },
            status_since: now_secs(),
        });
    }

    /// Declare this node's own capacity, bumping its incarnation so the
    /// update propagates on the next gossip round.
    pub fn set_local_capacity(&self, capacity: Capacity) {
        if let Some(mut member) = self.members.get_mut(&self.local_id) {
            member.summary.capacity = capacity;
            member.summary.incarnation += 1;
            member.summary.last_seen = now_secs();
        }
    }

    /// All tracked members, including this node.
    pub fn members(&self) -> Vec<MemberSummary> {
        self.members.iter().map(|m| m.summary.clone()).collect()
    }

    /// Members currently believed live.
    pub fn live_members(&self) -> Vec<MemberSummary> {
        self.members
            .iter()
            .filter(|m| m.summary.health == Health::Live)
            .map(|m| m.summary.clone())
            .collect()
    }

    /// Look up one member.
    pub fn get(&self, node_id: &NodeId) -> Option<MemberSummary> {
        self.members.get(node_id).map(|m| m.summary.clone())
    }

    /// Merge an incoming digest into the local table, per-member, keeping
    /// whichever summary is newer. Used for both outbound gossip responses
    /// and the inbound peer-API gossip handler. Returns the local digest
    /// (post-merge) to hand back to the caller.
    pub fn merge_digest(&self, remote: Vec<MemberSummary>) -> Vec<MemberSummary> {
        let now = now_secs();
        for candidate in remote {
            if candidate.node_id == self.local_id {
                continue;
            }
            match self.members.get_mut(&candidate.node_id) {
                Some(mut existing) => {
                    if should_overwrite(&existing.summary, &candidate) {
                        let status_changed = existing.summary.health != candidate.health;
                        existing.summary = candidate;
                        if status_changed {
                            existing.status_since = now;
                        }
                    }
                }
                None => {
                    self.members.insert(
                        candidate.node_id,
                        Member {
                            status_since: now,
                            summary: candidate,
                        },
                    );
                }
            }
        }
        self.members()
    }

    /// Record direct, successful contact with `node_id`: resets its liveness
    /// clock and transitions `suspect -> live` immediately.
    pub fn record_contact(&self, node_id: &NodeId) {
        let now = now_secs();
        if let Some(mut member) = self.members.get_mut(node_id) {
            member.summary.last_seen = now;
            if member.summary.health != Health::Live {
                member.summary.health = Health::Live;
                member.summary.incarnation += 1;
                member.status_since = now;
            }
        }
    }

    /// Run one gossip round: pick up to `gossip_fanout` live peers at
    /// random (excluding self), exchange digests, and merge the responses.
    #[instrument(skip(self))]
    pub async fn gossip_round(&self) {
        let candidates: Vec<MemberSummary> = self
            .members
            .iter()
            .filter(|m| m.summary.node_id != self.local_id && m.summary.health != Health::Dead)
            .map(|m| m.summary.clone())
            .collect();

        if candidates.is_empty() {
            return;
        }

        let targets = pick_random(&candidates, self.config.gossip_fanout);
        let local_digest = self.members();

        for target in targets {
            match self
                .transport
                .exchange(&target.node_id, target.addr, local_digest.clone())
                .await
            {
                Ok(remote_digest) => {
                    self.record_contact(&target.node_id);
                    self.merge_digest(remote_digest);
                    self.maybe_become_live();
                }
                Err(e) => {
                    debug!(peer = %target.node_id, error = %e, "gossip round failed");
                }
            }
        }
    }

    /// Once this node has completed at least one successful gossip round,
    /// it graduates from `Joining` to `Live`.
    fn maybe_become_live(&self) {
        if let Some(mut member) = self.members.get_mut(&self.local_id) {
            if member.summary.health == Health::Joining {
                member.summary.health = Health::Live;
                member.summary.incarnation += 1;
                member.status_since = now_secs();
            }
        }
    }

    /// Apply local timeouts: `live -> suspect`, `suspect -> dead`, and
    /// forget `dead` entries older than `forget_timeout`. Never applied to
    /// the local node.
    #[instrument(skip(self))]
    pub fn apply_timeouts(&self) {
        let now = now_secs();
        let mut to_forget = Vec::new();

        for mut entry in self.members.iter_mut() {
            if entry.summary.node_id == self.local_id {
                continue;
            }
            let since_contact = now.saturating_sub(entry.summary.last_seen);
            let since_status = now.saturating_sub(entry.status_since);

            match entry.summary.health {
                Health::Live if since_contact >= self.config.suspect_timeout.as_secs() => {
                    entry.summary.health = Health::Suspect;
                    entry.summary.incarnation += 1;
                    entry.status_since = now;
                    info!(node = %entry.summary.node_id, "member marked suspect");
                }
                Health::Suspect if since_status >= self.config.dead_timeout.as_secs() => {
                    entry.summary.health = Health::Dead;
                    entry.summary.incarnation += 1;
                    entry.status_since = now;
                    info!(node = %entry.summary.node_id, "member marked dead");
                }
                Health::Dead if since_status >= self.config.forget_timeout.as_secs() => {
                    to_forget.push(entry.summary.node_id);
                }
                _ => {}
            }
        }

        for node_id in to_forget {
            self.members.remove(&node_id);
            info!(node = %node_id, "forgot dead member");
        }
    }

    /// Run gossip rounds and timeout checks on `config.gossip_interval`
    /// until `shutdown` fires. Spawned only from `node::NodeHandle::start`.
    pub async fn run_periodic(self: Arc<Self>, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.gossip_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.gossip_round().await;
                    self.apply_timeouts();
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }
}

fn pick_random(candidates: &[MemberSummary], fanout: usize) -> Vec<MemberSummary> {
    use rand::seq::SliceRandom;
    let mut rng = rand::thread_rng();
    let mut shuffled: Vec<MemberSummary> = candidates.to_vec();
    shuffled.shuffle(&mut rng);
    shuffled.into_iter().take(fanout).collect()
}
