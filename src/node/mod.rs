//! Node lifecycle: wires every subsystem together and owns their
//! background tasks. Constructors only allocate; `start` spawns one task
//! per background loop (CAS GC, gossip, raft, dispatch, rebalance, and
//! optionally continuous chaos) plus the two HTTP listeners, handing back
//! join handles and a shutdown switch.

use crate::api::peer_api::{peer_router, EchoExecutor, Executor, HttpChunkSource, HttpGossipTransport, HttpInferenceSink, PeerState};
use crate::api::request_api::{request_router, ChunkSourceFactory, RequestState};
use crate::cas::{self, ContentStore};
use crate::chaos::{ChaosHarness, Experiment, FaultInjector, MetricsSource};
use crate::config::Config;
use crate::identity::{NodeId, NodeKeyPair};
use crate::membership::MembershipManager;
use crate::raft::{RaftNode, RaftRpcHandler, TcpRaftTransport};
use crate::scheduler::{Dispatcher, InferenceSink, RequestQueue, StatsTable, TicketTable};
use crate::transfer::ChunkSource;
use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Builds `HttpChunkSource`s on demand for `pull_model`, the only place
/// outside `api::peer_api` that needs to dial an arbitrary peer's CAS.
struct HttpChunkSourceFactory;

impl ChunkSourceFactory for HttpChunkSourceFactory {
    fn build(&self, peer_addr: SocketAddr) -> Arc<dyn ChunkSource> {
        Arc::new(HttpChunkSource::new(peer_addr))
    }
}

/// Wraps `Dispatcher`'s real-network `InferenceSink` so it can resolve a
/// live peer's address through `MembershipManager` without depending on
/// its concrete type at construction time.
fn build_inference_sink(membership: Arc<MembershipManager>) -> Arc<dyn InferenceSink> {
    let addr_of = Arc::new(move |node_id: NodeId| membership.get(&node_id).map(|m| m.addr));
    Arc::new(HttpInferenceSink::new(addr_of))
}

/// Fault injection within the harness's contract: it never touches CAS or
/// dispatch state directly — the one real effect is marking each targeted
/// node `draining` through the replicated log, so every scheduler's
/// placement view converges on routing around it, and reversing that on
/// rollback. Proposals are advisory: a node that isn't currently leader
/// logs and moves on.
struct DrainMarkingInjector {
    raft: Arc<RaftNode>,
}

impl DrainMarkingInjector {
    fn targets(scenario: &crate::chaos::Scenario) -> Vec<NodeId> {
        match scenario {
            crate::chaos::Scenario::KillNode(node_id) => vec![*node_id],
            crate::chaos::Scenario::InjectLatency { node_id, .. } => vec![*node_id],
            crate::chaos::Scenario::Partition { group_a, group_b } => {
                group_a.iter().chain(group_b.iter()).copied().collect()
            }
        }
    }

    async fn mark(&self, scenario: &crate::chaos::Scenario, health: &str) {
        for node_id in Self::targets(scenario) {
            let payload = crate::raft::EntryPayload::NodeHealth {
                node_id,
                health: health.to_string(),
            };
            if let Err(e) = self.raft.propose(uuid::Uuid::new_v4(), 0, payload).await {
                warn!(error = %e, %node_id, health, "could not record chaos health mark in the log");
            }
        }
    }
}

#[async_trait::async_trait]
impl FaultInjector for DrainMarkingInjector {
    async fn inject(&self, scenario: &crate::chaos::Scenario) -> Result<(), crate::chaos::ChaosError> {
        self.mark(scenario, "draining").await;
        Ok(())
    }
    async fn rollback(&self, scenario: &crate::chaos::Scenario) {
        self.mark(scenario, "live").await;
    }
}

struct StatsBackedMetrics {
    stats: Arc<StatsTable>,
}

#[async_trait::async_trait]
impl MetricsSource for StatsBackedMetrics {
    async fn sample(&self) -> crate::chaos::Sample {
        let aggregate = self.stats.aggregate();
        crate::chaos::Sample {
            error_rate: aggregate.recent_error_rate,
            mean_latency_ms: aggregate.recent_latency_ms,
            // No request-rate clock exists here; a zero baseline disables
            // the throughput-drop check while latency and error rate are
            // monitored for real.
            throughput: 0.0,
        }
    }
}

/// Owns every subsystem for one cluster node and the `watch` channel that
/// tells their background loops to stop.
pub struct NodeHandle {
    pub config: Config,
    pub node_id: NodeId,
    pub store: Arc<ContentStore>,
    pub membership: Arc<MembershipManager>,
    pub raft: Arc<RaftNode>,
    pub raft_transport: Arc<TcpRaftTransport>,
    pub queue: Arc<RequestQueue>,
    pub tickets: Arc<TicketTable>,
    pub dispatcher: Arc<Dispatcher>,
    pub chaos: Arc<ChaosHarness>,
    pub peer_state: Arc<PeerState>,
    pub request_state: Arc<RequestState>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl NodeHandle {
    /// Build every subsystem. Allocation and, where a subsystem requires
    /// async setup (opening the CAS backend), that setup only — no
    /// background task is spawned here.
    pub async fn new(config: Config, keypair: NodeKeyPair) -> anyhow::Result<Self> {
        let keypair = Arc::new(keypair);
        let node_id = keypair.node_id();
        let store = Arc::new(cas::open(config.cas.clone()).await?);

        let gossip_transport = Arc::new(HttpGossipTransport::new(
            config.membership.gossip_interval,
            keypair.clone(),
        ));
        let membership = Arc::new(MembershipManager::new(
            node_id,
            config.peer_addr,
            config.membership.clone(),
            gossip_transport,
        ));

        let mut voters = Vec::with_capacity(config.raft.voters.len());
        let raft_transport = Arc::new(TcpRaftTransport::new(keypair.clone()));
        for (hex, addr) in &config.raft.voters {
            let voter_id = NodeId::from_hex(hex)?;
            if voter_id != node_id {
                raft_transport.set_peer_addr(voter_id, *addr).await;
                membership.seed(voter_id, *addr);
            }
            voters.push(voter_id);
        }
        if voters.is_empty() {
            voters.push(node_id);
        }
        let raft = Arc::new(RaftNode::new(node_id, voters, config.raft.clone(), raft_transport.clone())?);

        let queue = Arc::new(RequestQueue::new(
            config.scheduler.shard_count,
            config.scheduler.queue_size,
            config.scheduler.admission_burst,
            config.scheduler.admission_refill_per_sec,
        ));
        let tickets = Arc::new(TicketTable::new());
        let stats = Arc::new(StatsTable::new());
        let sink = build_inference_sink(membership.clone());
        let dispatcher = Arc::new(Dispatcher::new(
            queue.clone(),
            membership.clone(),
            raft.clone(),
            sink,
            stats.clone(),
            tickets.clone(),
            &config.scheduler,
        ));

        let chaos = Arc::new(ChaosHarness::new(
            Arc::new(DrainMarkingInjector { raft: raft.clone() }),
            Arc::new(StatsBackedMetrics { stats: stats.clone() }),
            &config.chaos,
        ));

        let peer_state = Arc::new(PeerState {
            store: store.clone(),
            executor: Arc::new(EchoExecutor) as Arc<dyn Executor>,
            membership: membership.clone(),
            raft: raft.clone(),
            keypair,
        });
        let request_state = Arc::new(RequestState {
            queue: queue.clone(),
            tickets: tickets.clone(),
            raft: raft.clone(),
            store: store.clone(),
            membership: membership.clone(),
            chunk_sources: Arc::new(HttpChunkSourceFactory),
            transfer_config: config.transfer.clone(),
            started_at: Instant::now(),
            default_retry_budget: config.scheduler.default_retry_budget,
        });

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Ok(Self {
            config,
            node_id,
            store,
            membership,
            raft,
            raft_transport,
            queue,
            tickets,
            dispatcher,
            chaos,
            peer_state,
            request_state,
            shutdown_tx,
            shutdown_rx,
        })
    }

    /// Spawn every background loop and both HTTP listeners, returning
    /// their join handles so the caller can await a clean shutdown.
    pub async fn start(self: &Arc<Self>) -> std::io::Result<Vec<JoinHandle<()>>> {
        let mut handles = Vec::new();

        let raft_listen_addr = self
            .config
            .raft
            .voters
            .get(&self.node_id.to_hex())
            .copied()
            .unwrap_or(self.config.peer_addr);
        let raft_handler: Arc<dyn RaftRpcHandler> = self.raft.clone();
        handles.push(tokio::spawn(async move {
            if let Err(e) = TcpRaftTransport::serve(raft_listen_addr, raft_handler).await {
                warn!(error = %e, "raft transport listener exited");
            }
        }));

        handles.push(tokio::spawn(self.raft.clone().run(self.shutdown_rx.clone())));
        handles.push(tokio::spawn(self.membership.clone().run_periodic(self.shutdown_rx.clone())));
        handles.push(tokio::spawn(cas::gc::run_periodic(
            self.store.clone(),
            self.config.cas.clone(),
            self.shutdown_rx.clone(),
        )));
        handles.push(tokio::spawn(self.dispatcher.clone().run_dispatch_loop(self.shutdown_rx.clone())));
        handles.push(tokio::spawn(self.dispatcher.clone().run_rebalance_loop(self.shutdown_rx.clone())));

        if self.config.chaos.continuous_enabled {
            let chaos = self.chaos.clone();
            let shutdown = self.shutdown_rx.clone();
            let voters = self.raft.voters();
            handles.push(tokio::spawn(async move {
                chaos
                    .run_continuous(shutdown, move || Experiment {
                        id: uuid::Uuid::new_v4(),
                        scenarios: vec![crate::chaos::Scenario::InjectLatency {
                            node_id: *voters.first().unwrap_or(&rand_voter()),
                            added_ms: 50,
                        }],
                        duration: std::time::Duration::from_secs(30),
                        hypothesis: Some(
                            "a single slow node does not push cluster latency past its safety bound".to_string(),
                        ),
                        thresholds: None,
                    })
                    .await;
            }));
        }

        let peer_listener = tokio::net::TcpListener::bind(self.config.peer_addr).await?;
        let peer_app = peer_router(self.peer_state.clone());
        let mut peer_shutdown = self.shutdown_rx.clone();
        handles.push(tokio::spawn(async move {
            let serve = axum::serve(peer_listener, peer_app);
            tokio::select! {
                result = serve.into_future() => {
                    if let Err(e) = result {
                        warn!(error = %e, "peer api listener exited");
                    }
                }
                _ = peer_shutdown.changed() => {}
            }
        }));

        let request_listener = tokio::net::TcpListener::bind(self.config.request_addr).await?;
        let request_app = request_router(self.request_state.clone());
        let mut request_shutdown = self.shutdown_rx.clone();
        handles.push(tokio::spawn(async move {
            let serve = axum::serve(request_listener, request_app);
            tokio::select! {
                result = serve.into_future() => {
                    if let Err(e) = result {
                        warn!(error = %e, "request api listener exited");
                    }
                }
                _ = request_shutdown.changed() => {}
            }
        }));

        info!(node_id = %self.node_id.to_hex(), peer_addr = %self.config.peer_addr, request_addr = %self.config.request_addr, "node started");
        Ok(handles)
    }

    /// Signal every background loop to stop. Does not itself await their
    /// completion — callers join the handles returned by `start`.
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

fn rand_voter() -> NodeId {
    NodeKeyPair::generate().node_id()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn node_handle_builds_with_no_configured_voters() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.cas.root = dir.path().join("cas");
        config.raft.data_dir = dir.path().join("raft");
        config.peer_addr = "127.0.0.1:0".parse().unwrap();
        config.request_addr = "127.0.0.1:0".parse().unwrap();

        let keypair = NodeKeyPair::generate();
        let node = NodeHandle::new(config, keypair).await.unwrap();
        assert_eq!(node.raft.voters(), &[node.node_id]);
    }
}
