//! Leader loss tolerates a minority: a 5-node voting set keeps committing
//! new entries after two nodes are killed, but stalls once a third goes
//! down, while entries committed before the stall remain locally readable.

use async_trait::async_trait;
use meridian::config::RaftConfig;
use meridian::identity::{NodeId, NodeKeyPair};
use meridian::raft::{EntryPayload, RaftError, RaftNode, RaftRequest, RaftResponse, RaftRpcHandler, RaftTransport, Role, TransportError};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;

/// Routes Raft RPCs directly between in-process `RaftNode`s. Removing a node
/// from the registry simulates killing it: calls to it fail as unreachable,
/// and calls it issues to others simply never happen once its own `run`
/// loop is stopped via its shutdown signal.
struct LoopbackTransport {
    nodes: Mutex<HashMap<NodeId, Arc<dyn RaftRpcHandler>>>,
}

impl LoopbackTransport {
    fn new() -> Arc<Self> {
        Arc::new(Self { nodes: Mutex::new(HashMap::new()) })
    }

    fn register(&self, id: NodeId, node: Arc<dyn RaftRpcHandler>) {
        self.nodes.lock().unwrap().insert(id, node);
    }

    fn kill(&self, id: &NodeId) {
        self.nodes.lock().unwrap().remove(id);
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

fn fast_raft_config(data_dir: std::path::PathBuf) -> RaftConfig {
    RaftConfig {
        data_dir,
        voters: HashMap::new(),
        heartbeat_interval: Duration::from_millis(20),
        election_timeout_min: Duration::from_millis(60),
        election_timeout_max: Duration::from_millis(100),
        max_append_entries: 64,
        snapshot_threshold: 10_000,
    }
}

struct Cluster {
    transport: Arc<LoopbackTransport>,
    nodes: Vec<Arc<RaftNode>>,
    ids: Vec<NodeId>,
    shutdowns: Vec<watch::Sender<bool>>,
    _dirs: Vec<tempfile::TempDir>,
}

impl Cluster {
    async fn build(n: usize) -> Self {
        let transport = LoopbackTransport::new();
        let ids: Vec<NodeId> = (0..n).map(|_| NodeKeyPair::generate().node_id()).collect();
        let mut nodes = Vec::new();
        let mut shutdowns = Vec::new();
        let mut dirs = Vec::new();
        for id in &ids {
            let dir = tempfile::tempdir().unwrap();
            let node = Arc::new(
                RaftNode::new(*id, ids.clone(), fast_raft_config(dir.path().join("raft")), transport.clone()).unwrap(),
            );
            transport.register(*id, node.clone());
            let (tx, rx) = watch::channel(false);
            tokio::spawn(node.clone().run(rx));
            nodes.push(node);
            shutdowns.push(tx);
            dirs.push(dir);
        }
        Self { transport, nodes, ids, shutdowns, _dirs: dirs }
    }

    fn kill(&self, index: usize) {
        self.transport.kill(&self.ids[index]);
        let _ = self.shutdowns[index].send(true);
    }

    async fn current_leader(&self, alive: &[usize]) -> Option<usize> {
        for &i in alive {
            if self.nodes[i].role().await == Role::Leader {
                return Some(i);
            }
        }
        None
    }

    async fn wait_for_leader(&self, alive: &[usize], timeout: Duration) -> Option<usize> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(i) = self.current_leader(alive).await {
                return Some(i);
            }
            if tokio::time::Instant::now() >= deadline {
                return None;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

#[tokio::test]
async fn minority_loss_keeps_committing_majority_loss_stalls() {
    let cluster = Cluster::build(5).await;
    let all: Vec<usize> = (0..5).collect();

    let leader = cluster
        .wait_for_leader(&all, Duration::from_millis(500))
        .await
        .expect("a 5-node cluster should elect a leader");

    // Kill two of the five nodes: the remaining three still form a
    // majority (quorum = 3).
    let mut killed = Vec::new();
    for &i in all.iter() {
        if i != leader && killed.len() < 2 {
            killed.push(i);
        }
    }
    for &i in &killed {
        cluster.kill(i);
    }
    let alive: Vec<usize> = all.iter().copied().filter(|i| !killed.contains(i)).collect();

    let leader_after_two_down = cluster
        .wait_for_leader(&alive, Duration::from_millis(500))
        .await
        .expect("three of five nodes should still elect/keep a leader");

    let first_entry = cluster.nodes[leader_after_two_down]
        .propose(
            uuid::Uuid::new_v4(),
            0,
            EntryPayload::PlacementAdd { model_name: "llama:7b".to_string(), node_id: cluster.ids[0] },
        )
        .await
        .expect("a surviving majority should still commit new entries");
    assert_eq!(first_entry.index, 1);

    for &i in &alive {
        assert!(cluster.nodes[i].placement().await.desired_nodes("llama:7b").contains(&cluster.ids[0]));
    }

    // Kill a third node: only two of five remain, below quorum.
    let third = alive.iter().copied().find(|&i| i != leader_after_two_down).unwrap();
    cluster.kill(third);
    let alive_after_three_down: Vec<usize> = alive.into_iter().filter(|&i| i != third).collect();
    assert_eq!(alive_after_three_down.len(), 2);

    let result = cluster.nodes[leader_after_two_down]
        .propose(
            uuid::Uuid::new_v4(),
            0,
            EntryPayload::PlacementAdd { model_name: "llama:7b".to_string(), node_id: cluster.ids[1] },
        )
        .await;
    assert!(
        matches!(result, Err(RaftError::ProposalTimeout) | Err(RaftError::NotLeader(_))),
        "a sub-quorum cluster must not be able to commit new entries"
    );

    // The entry committed before the stall remains readable locally on
    // every surviving node.
    for &i in &alive_after_three_down {
        assert!(cluster.nodes[i].placement().await.desired_nodes("llama:7b").contains(&cluster.ids[0]));
    }
}
