//! The dispatch loop and rebalance pass.
//!
//! The loop pops the best-ranked request, dispatches it to the
//! highest-scoring live candidate, and on failure either requeues (retries
//! remain) or marks the request `Failed`. A separate periodic pass proposes
//! `SchedulerDirective` log entries when a model's desired placement is
//! under-replicated: failure detection is local, but the remedial action is
//! a log entry rather than a direct mutation, so every node converges on
//! the same view of what was decided.

use crate::identity::NodeId;
use crate::membership::{MemberSummary, MembershipManager};
use crate::placement::PlacementIndex;
use crate::raft::{EntryPayload, FencingToken, RaftError, RaftNode};
use crate::scheduler::queue::RequestQueue;
use crate::scheduler::request::{Request, RequestStatus, TicketTable};
use crate::scheduler::select::{CandidateSelector, NodeStats};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{sleep, Duration};
use tracing::{debug, info, warn};

/// Implemented by whatever actually sends a request to a node and awaits
/// its result — the real implementation is an HTTP client in
/// `api::peer_api`; tests use in-process fakes.
#[async_trait::async_trait]
pub trait InferenceSink: Send + Sync {
    /// Dispatch `request` to `node` and report whether it succeeded.
    /// `fencing` carries the dispatching leader's authority token when this
    /// scheduler's node currently leads; executing nodes refuse tokens from
    /// terms older than one they have already seen.
    async fn dispatch(&self, node: NodeId, request: &Request, fencing: Option<FencingToken>) -> bool;
}

/// Owns the live per-node statistics the selector consults, updated after
/// every dispatch attempt.
#[derive(Default)]
pub struct StatsTable {
    stats: DashMap<NodeId, NodeStats>,
    affinity: DashMap<(NodeId, String), ()>,
}

impl StatsTable {
    /// A fresh, empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// A node's current stats, zeroed if it has never been dispatched to.
    pub fn get(&self, node_id: &NodeId) -> NodeStats {
        self.stats.get(node_id).map(|s| *s).unwrap_or_default()
    }

    /// Count an in-flight request against `node_id`.
    pub fn begin_dispatch(&self, node_id: NodeId) {
        let mut entry = self.stats.entry(node_id).or_default();
        entry.queue_depth += 1;
    }

    /// Release the in-flight slot taken by `begin_dispatch`.
    pub fn end_dispatch(&self, node_id: &NodeId) {
        if let Some(mut entry) = self.stats.get_mut(node_id) {
            entry.queue_depth = entry.queue_depth.saturating_sub(1);
        }
    }

    /// Fold a successful dispatch into the node's rolling latency and error
    /// rate, and record model affinity for future scoring.
    pub fn record_success(&self, node_id: NodeId, model_name: &str, latency_ms: f64) {
        let mut entry = self.stats.entry(node_id).or_default();
        entry.recent_latency_ms = entry.recent_latency_ms * 0.8 + latency_ms * 0.2;
        entry.recent_error_rate *= 0.9;
        drop(entry);
        self.affinity.insert((node_id, model_name.to_string()), ());
    }

    /// Fold a failed dispatch into the node's rolling error rate.
    pub fn record_failure(&self, node_id: NodeId) {
        let mut entry = self.stats.entry(node_id).or_default();
        entry.recent_error_rate = (entry.recent_error_rate * 0.9 + 0.1).min(1.0);
    }

    /// Whether `node_id` has previously served `model_name` successfully.
    pub fn has_affinity(&self, node_id: &NodeId, model_name: &str) -> bool {
        self.affinity.contains_key(&(*node_id, model_name.to_string()))
    }

    /// Mean rolling latency and error rate plus total in-flight depth across
    /// every node seen so far. The chaos harness's safety monitor samples
    /// this as its cluster-wide signal.
    pub fn aggregate(&self) -> NodeStats {
        let mut nodes = 0u32;
        let mut latency = 0.0;
        let mut error_rate = 0.0;
        let mut depth = 0u32;
        for entry in self.stats.iter() {
            nodes += 1;
            latency += entry.recent_latency_ms;
            error_rate += entry.recent_error_rate;
            depth += entry.queue_depth;
        }
        if nodes == 0 {
            return NodeStats::default();
        }
        NodeStats {
            recent_latency_ms: latency / nodes as f64,
            queue_depth: depth,
            recent_error_rate: error_rate / nodes as f64,
        }
    }
}

/// Drives admitted requests to completion and periodically proposes
/// rebalance directives for under-replicated models.
pub struct Dispatcher {
    queue: Arc<RequestQueue>,
    membership: Arc<MembershipManager>,
    raft: Arc<RaftNode>,
    sink: Arc<dyn InferenceSink>,
    stats: Arc<StatsTable>,
    tickets: Arc<TicketTable>,
    weights: crate::config::ScoringWeights,
    min_replicas_per_model: usize,
    poll_interval: Duration,
    rebalance_interval: Duration,
}

impl Dispatcher {
    /// Build a dispatcher. Allocation only; call `run_dispatch_loop` and
    /// `run_rebalance_loop` to start work.
    pub fn new(
        queue: Arc<RequestQueue>,
        membership: Arc<MembershipManager>,
        raft: Arc<RaftNode>,
        sink: Arc<dyn InferenceSink>,
        stats: Arc<StatsTable>,
        tickets: Arc<TicketTable>,
        scheduler_config: &crate::config::SchedulerConfig,
    ) -> Self {
        Self {
            queue,
            membership,
            raft,
            sink,
            stats,
            tickets,
            weights: scheduler_config.scoring_weights.clone(),
            min_replicas_per_model: scheduler_config.min_replicas_per_model,
            poll_interval: Duration::from_millis(5),
            rebalance_interval: scheduler_config.rebalance_interval,
        }
    }

    /// Pop and dispatch requests until `shutdown` fires, sleeping briefly
    /// when the queue is empty.
    pub async fn run_dispatch_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                return;
            }
            let Some(request) = self.queue.pop_best() else {
                tokio::select! {
                    _ = sleep(self.poll_interval) => {}
                    _ = shutdown.changed() => {}
                }
                continue;
            };
            self.dispatch_one(request).await;
        }
    }

    async fn dispatch_one(&self, mut request: Request) {
        if request.is_past_deadline() {
            self.expire(request);
            return;
        }

        let placement = self.raft.placement().await;
        let members = self.membership.live_members();
        let selector = CandidateSelector::new(&self.weights);
        let ranked = selector.rank_candidates(
            &request,
            &placement,
            &members,
            |node_id| self.stats.get(node_id),
            |node_id, model_name| self.stats.has_affinity(node_id, model_name),
        );

        let Some(node_id) = ranked.into_iter().next() else {
            self.handle_no_candidate(request, &members).await;
            return;
        };

        request.mark_dispatched(node_id);
        self.tickets.set(request.id, request.status);
        self.stats.begin_dispatch(node_id);
        let fencing = self.raft.fencing_token().await;
        let started = std::time::Instant::now();
        let succeeded = self.sink.dispatch(node_id, &request, fencing).await;
        let latency_ms = started.elapsed().as_secs_f64() * 1000.0;
        self.stats.end_dispatch(&node_id);

        if succeeded {
            self.stats.record_success(node_id, &request.model_name, latency_ms);
            request.mark_completed();
            debug!(request_id = %request.id, %node_id, "request completed");
            self.tickets.set(request.id, request.status);
        } else {
            self.stats.record_failure(node_id);
            request.mark_attempt_failed();
            self.tickets.set(request.id, request.status);
            self.requeue_or_drop(request);
        }
    }

    fn requeue_or_drop(&self, request: Request) {
        if matches!(request.status, RequestStatus::Queued | RequestStatus::NeedsPlacement) {
            if let Err((request, err)) = self.queue.requeue(request) {
                warn!(request_id = %request.id, error = %err, "failed to requeue request");
            }
        }
    }

    /// A request's deadline has passed. A request that was parked waiting
    /// on placement fails `Exhausted`, distinguishing "no candidate ever
    /// existed to try" from an ordinary dispatch `TimedOut`.
    fn expire(&self, mut request: Request) {
        if request.status == RequestStatus::NeedsPlacement {
            request.mark_exhausted();
        } else {
            request.mark_timed_out();
        }
        self.tickets.set(request.id, request.status);
    }

    /// No live, placed node exists for this request's model: mark it
    /// `needs_placement`, propose a `PlacementAdd` onto some live
    /// node with spare capacity so the next rebalance (or this same
    /// dispatch loop, once the entry commits) can pick it up, then park the
    /// request back on the queue until it is retried or its deadline
    /// expires it into `Exhausted`.
    async fn handle_no_candidate(&self, mut request: Request, members: &[MemberSummary]) {
        request.mark_needs_placement();
        self.tickets.set(request.id, request.status);

        match self.pick_placement_target(&request, members) {
            Some(node_id) => {
                info!(model = %request.model_name, %node_id, "proposing placement for unplaced model");
                let payload = EntryPayload::PlacementAdd { model_name: request.model_name.clone(), node_id };
                if let Err(e) = self.raft.propose(request.client_id, request.client_seq, payload).await {
                    self.log_propose_failure(e);
                }
            }
            None => {
                debug!(model = %request.model_name, "no live node with capacity to place model onto yet");
            }
        }

        self.requeue_or_drop(request);
    }

    /// The live, not-yet-excluded member with the lowest current queue
    /// depth, used as the target of a self-healing `PlacementAdd` when a
    /// request's model has no live candidate at all.
    fn pick_placement_target(&self, request: &Request, members: &[MemberSummary]) -> Option<NodeId> {
        members
            .iter()
            .filter(|m| m.health == crate::membership::Health::Live)
            .filter(|m| !request.excluded_nodes.contains(&m.node_id))
            .min_by_key(|m| self.stats.get(&m.node_id).queue_depth)
            .map(|m| m.node_id)
    }

    /// Periodically scan `placement::PlacementIndex` for under-replicated
    /// models and propose a `SchedulerDirective` entry for each, letting
    /// `raft` and an operator (or future automation) act on it.
    pub async fn run_rebalance_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = sleep(self.rebalance_interval) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
            }
            if *shutdown.borrow() {
                return;
            }
            if self.raft.role().await != crate::raft::Role::Leader {
                continue;
            }
            let placement = self.raft.placement().await;
            for model_name in placement.placed_models() {
                let desired_count = placement.desired_nodes(&model_name).len();
                if desired_count < self.min_replicas_per_model {
                    continue;
                }
                let under_replicated = placement.under_replicated(&model_name);
                if under_replicated.is_empty() {
                    continue;
                }
                let description = format!(
                    "model {model_name} has {}/{desired_count} replicas ready",
                    desired_count - under_replicated.len()
                );
                info!(%model_name, %description, "proposing rebalance directive");
                if let Err(e) = self
                    .raft
                    .propose(uuid::Uuid::new_v4(), 0, EntryPayload::SchedulerDirective { description })
                    .await
                {
                    self.log_propose_failure(e);
                }
            }
        }
    }

    fn log_propose_failure(&self, e: RaftError) {
        debug!(error = %e, "rebalance proposal did not commit (likely lost leadership)");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::request::Priority;

    struct AlwaysSucceeds;

    #[async_trait::async_trait]
    impl InferenceSink for AlwaysSucceeds {
        async fn dispatch(&self, _node: NodeId, _request: &Request, _fencing: Option<FencingToken>) -> bool {
            true
        }
    }

    struct AlwaysFails;

    #[async_trait::async_trait]
    impl InferenceSink for AlwaysFails {
        async fn dispatch(&self, _node: NodeId, _request: &Request, _fencing: Option<FencingToken>) -> bool {
            false
        }
    }

    #[test]
    fn stats_table_tracks_in_flight_depth() {
        let table = StatsTable::new();
        let node = crate::identity::NodeKeyPair::generate().node_id();
        table.begin_dispatch(node);
        table.begin_dispatch(node);
        assert_eq!(table.get(&node).queue_depth, 2);
        table.end_dispatch(&node);
        assert_eq!(table.get(&node).queue_depth, 1);
    }

    #[test]
    fn aggregate_averages_rolling_stats_across_nodes() {
        let table = StatsTable::new();
        let a = crate::identity::NodeKeyPair::generate().node_id();
        let b = crate::identity::NodeKeyPair::generate().node_id();
        table.record_success(a, "m", 10.0);
        table.record_success(b, "m", 30.0);

        let aggregate = table.aggregate();
        assert!((aggregate.recent_latency_ms - 4.0).abs() < 1e-9);
        assert_eq!(aggregate.queue_depth, 0);
    }

    #[test]
    fn stats_table_tracks_affinity_after_success() {
        let table = StatsTable::new();
        let node = crate::identity::NodeKeyPair::generate().node_id();
        assert!(!table.has_affinity(&node, "m"));
        table.record_success(node, "m", 12.0);
        assert!(table.has_affinity(&node, "m"));
    }

    #[test]
    fn requeue_or_drop_only_requeues_when_status_is_queued() {
        // A request exhausted on retries is left Failed, not resubmitted.
        let queue = Arc::new(RequestQueue::new(1, 16, 100, 1000.0));
        let mut request = Request::new("m", Priority::Normal, vec![], 1);
        request.mark_queued();
        request.mark_dispatched(crate::identity::NodeKeyPair::generate().node_id());
        request.mark_attempt_failed();
        assert_eq!(request.status, RequestStatus::Failed);
        assert_eq!(queue.len(), 0);
    }

    struct NoPeers;
    #[async_trait::async_trait]
    impl crate::raft::RaftTransport for NoPeers {
        async fn call(&self, peer: NodeId, _request: crate::raft::RaftRequest) -> Result<crate::raft::RaftResponse, crate::raft::TransportError> {
            Err(crate::raft::TransportError::UnknownPeer(peer))
        }
    }

    struct NoopGossip;
    #[async_trait::async_trait]
    impl crate::membership::GossipTransport for NoopGossip {
        async fn exchange(
            &self,
            peer: &NodeId,
            _addr: std::net::SocketAddr,
            _local_digest: Vec<crate::membership::MemberSummary>,
        ) -> Result<Vec<crate::membership::MemberSummary>, crate::membership::MembershipError> {
            Err(crate::membership::MembershipError::UnknownPeer(*peer))
        }
    }

    fn live_member(node_id: NodeId) -> MemberSummary {
        MemberSummary {
            node_id,
            addr: "127.0.0.1:9001".parse().unwrap(),
            health: crate::membership::Health::Live,
            capacity: crate::membership::Capacity { max_concurrency: 4 },
            last_seen: 0,
            incarnation: 1,
        }
    }

    fn fast_raft_config(data_dir: std::path::PathBuf) -> crate::config::RaftConfig {
        crate::config::RaftConfig {
            data_dir,
            heartbeat_interval: Duration::from_millis(20),
            election_timeout_min: Duration::from_millis(60),
            election_timeout_max: Duration::from_millis(100),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn parked_request_past_deadline_fails_exhausted_not_timed_out() {
        let self_id = crate::identity::NodeKeyPair::generate().node_id();
        let raft_dir = tempfile::tempdir().unwrap();
        let raft = Arc::new(
            RaftNode::new(self_id, vec![self_id], fast_raft_config(raft_dir.path().to_path_buf()), Arc::new(NoPeers)).unwrap(),
        );
        // No live members at all: pick_placement_target can never find a
        // target, so this never touches raft::propose.
        let membership = Arc::new(MembershipManager::new(
            self_id,
            "127.0.0.1:9100".parse().unwrap(),
            crate::config::MembershipConfig::default(),
            Arc::new(NoopGossip),
        ));
        let queue = Arc::new(RequestQueue::new(1, 16, 100, 1000.0));
        let tickets = Arc::new(TicketTable::new());
        let dispatcher = Dispatcher::new(
            queue.clone(),
            membership,
            raft,
            Arc::new(AlwaysSucceeds),
            Arc::new(StatsTable::new()),
            tickets.clone(),
            &crate::config::SchedulerConfig::default(),
        );

        let now_ms = std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap().as_millis() as u64;
        let request = Request::new("m", Priority::Normal, vec![], 3).with_deadline(now_ms + 20);
        let request_id = request.id;

        dispatcher.dispatch_one(request).await;
        assert_eq!(tickets.get(&request_id), Some(RequestStatus::NeedsPlacement));

        tokio::time::sleep(Duration::from_millis(30)).await;
        let parked = queue.pop_best().expect("the parked request should still be on the queue");
        dispatcher.dispatch_one(parked).await;
        assert_eq!(tickets.get(&request_id), Some(RequestStatus::Exhausted));
    }

    /// A fake second voter that always grants votes and acks replication,
    /// so a real `RaftNode` can reach `Leader` and commit an entry without
    /// a second actual state machine on the other end.
    struct AckingPeer;
    #[async_trait::async_trait]
    impl crate::raft::RaftTransport for AckingPeer {
        async fn call(
            &self,
            _peer: NodeId,
            request: crate::raft::RaftRequest,
        ) -> Result<crate::raft::RaftResponse, crate::raft::TransportError> {
            match request {
                crate::raft::RaftRequest::RequestVote { term, .. } => {
                    Ok(crate::raft::RaftResponse::Vote { term, vote_granted: true })
                }
                crate::raft::RaftRequest::AppendEntries { term, prev_log_index, entries, .. } => {
                    Ok(crate::raft::RaftResponse::Append {
                        term,
                        success: true,
                        match_index: prev_log_index + entries.len() as u64,
                    })
                }
                crate::raft::RaftRequest::InstallSnapshot { term, .. } => {
                    Ok(crate::raft::RaftResponse::Snapshot { term })
                }
            }
        }
    }

    #[tokio::test]
    async fn no_candidate_proposes_placement_which_then_unparks_the_request() {
        let self_id = crate::identity::NodeKeyPair::generate().node_id();
        let fake_peer = crate::identity::NodeKeyPair::generate().node_id();
        let raft_dir = tempfile::tempdir().unwrap();
        let raft = Arc::new(
            RaftNode::new(
                self_id,
                vec![self_id, fake_peer],
                fast_raft_config(raft_dir.path().to_path_buf()),
                Arc::new(AckingPeer),
            )
            .unwrap(),
        );
        let (raft_shutdown_tx, raft_shutdown_rx) = watch::channel(false);
        tokio::spawn(raft.clone().run(raft_shutdown_rx));
        let deadline = tokio::time::Instant::now() + Duration::from_millis(500);
        while raft.role().await != crate::raft::Role::Leader {
            assert!(tokio::time::Instant::now() < deadline, "single-voter cluster should self-elect quickly");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let target = crate::identity::NodeKeyPair::generate().node_id();
        let membership = Arc::new(MembershipManager::new(
            self_id,
            "127.0.0.1:9100".parse().unwrap(),
            crate::config::MembershipConfig::default(),
            Arc::new(NoopGossip),
        ));
        membership.merge_digest(vec![live_member(target)]);

        let queue = Arc::new(RequestQueue::new(1, 16, 100, 1000.0));
        let tickets = Arc::new(TicketTable::new());
        let dispatcher = Arc::new(Dispatcher::new(
            queue.clone(),
            membership,
            raft,
            Arc::new(AlwaysSucceeds),
            Arc::new(StatsTable::new()),
            tickets.clone(),
            &crate::config::SchedulerConfig::default(),
        ));

        // "m" starts with no desired placement, so the first attempt finds
        // no candidate and proposes one onto the only live member.
        let request = Request::new("m", Priority::Normal, vec![], 3);
        let request_id = request.id;
        dispatcher.dispatch_one(request).await;
        assert_eq!(tickets.get(&request_id), Some(RequestStatus::NeedsPlacement));

        let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
        loop {
            if let Some(parked) = queue.pop_best() {
                dispatcher.dispatch_one(parked).await;
            }
            if tickets.get(&request_id) == Some(RequestStatus::Completed) {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "placement should commit and the retry should dispatch");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let _ = raft_shutdown_tx.send(true);
    }
}
