//! Wire transport for Raft RPCs: a small signed envelope type plus a
//! length-prefixed TCP transport with a per-peer connection pool.
//!
//! Framing is a 4-byte big-endian length prefix followed by a
//! `bincode`-encoded body; connections are pooled per peer and dropped
//! rather than returned when a call fails mid-stream. The RPC surface is
//! exactly the three Raft calls and their responses — gossip membership
//! has its own transport.

use crate::identity::{NodeId, NodeKeyPair, NodeSignature};
use crate::raft::log::LogEntry;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Errors moving a Raft RPC over the wire.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The connection could not be established or was reset mid-call.
    #[error("peer {0} unreachable: {1}")]
    Unreachable(NodeId, String),
    /// The peer is not known to this transport (no address on file).
    #[error("no address on file for peer {0}")]
    UnknownPeer(NodeId),
    /// The body failed to decode.
    #[error("malformed message: {0}")]
    Malformed(String),
}

/// A Raft RPC request, carried as the body of an [`Envelope`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RaftRequest {
    /// Candidate soliciting a vote.
    RequestVote {
        term: u64,
        candidate_id: NodeId,
        last_log_index: u64,
        last_log_term: u64,
    },
    /// Leader replicating entries or sending a bare heartbeat when
    /// `entries` is empty.
    AppendEntries {
        term: u64,
        leader_id: NodeId,
        prev_log_index: u64,
        prev_log_term: u64,
        entries: Vec<LogEntry>,
        leader_commit: u64,
    },
    /// Leader pushing a snapshot to a follower that has fallen too far
    /// behind for log replication to catch it up.
    InstallSnapshot {
        term: u64,
        leader_id: NodeId,
        last_included_index: u64,
        last_included_term: u64,
        data: Vec<u8>,
    },
}

/// The response to a [`RaftRequest`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RaftResponse {
    /// Response to `RequestVote`.
    Vote { term: u64, vote_granted: bool },
    /// Response to `AppendEntries`. `match_index` lets the leader advance
    /// `next_index`/`match_index` without guessing on success.
    Append {
        term: u64,
        success: bool,
        match_index: u64,
    },
    /// Response to `InstallSnapshot`.
    Snapshot { term: u64 },
}

/// A request plus its sender's identity and an Ed25519 signature over the
/// serialized request, so a peer cannot issue votes or appends on behalf of
/// another node id. The node id is itself the verifying key.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Envelope {
    from: NodeId,
    request: RaftRequest,
    signature: NodeSignature,
}

/// Implemented by whatever owns the Raft state machine, to turn an inbound
/// request from a peer into a response. Kept separate from [`RaftTransport`]
/// so the transport has no knowledge of `RaftNode` itself.
#[async_trait]
pub trait RaftRpcHandler: Send + Sync {
    /// Handle one inbound RPC from `from`.
    async fn handle(&self, from: NodeId, request: RaftRequest) -> RaftResponse;
}

/// Outbound RPC calls a `RaftNode` issues to its peers. Implemented by
/// [`TcpRaftTransport`] for real clusters and by in-process fakes in tests.
#[async_trait]
pub trait RaftTransport: Send + Sync {
    /// Send a request to `peer` and await its response.
    async fn call(&self, peer: NodeId, request: RaftRequest) -> Result<RaftResponse, TransportError>;

    /// Learn a peer's address from a committed `NodeJoin` entry. Transports
    /// that resolve peers some other way (in-process test loopbacks) ignore
    /// this.
    async fn register_peer(&self, _peer: NodeId, _addr: SocketAddr) {}
}

struct PooledConnection {
    stream: TcpStream,
}

/// A small pool of reusable TCP connections to one peer: a handful of
/// sockets reused across calls, with dead connections dropped rather than
/// returned to the pool.
struct ConnectionPool {
    addr: SocketAddr,
    idle: Mutex<Vec<PooledConnection>>,
    max_idle: usize,
}

impl ConnectionPool {
    fn new(addr: SocketAddr, max_idle: usize) -> Self {
        Self {
            addr,
            idle: Mutex::new(Vec::new()),
            max_idle,
        }
    }

    async fn acquire(&self) -> std::io::Result<PooledConnection> {
        if let Some(conn) = self.idle.lock().await.pop() {
            return Ok(conn);
        }
        let stream = TcpStream::connect(self.addr).await?;
        stream.set_nodelay(true).ok();
        Ok(PooledConnection { stream })
    }

    async fn release(&self, conn: PooledConnection) {
        let mut idle = self.idle.lock().await;
        if idle.len() < self.max_idle {
            idle.push(conn);
        }
    }
}

async fn write_framed(stream: &mut TcpStream, body: &[u8]) -> std::io::Result<()> {
    let len = body.len() as u32;
    stream.write_all(&len.to_be_bytes()).await?;
    stream.write_all(body).await?;
    stream.flush().await
}

async fn read_framed(stream: &mut TcpStream) -> std::io::Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).await?;
    Ok(body)
}

/// A length-prefixed-TCP `RaftTransport` with a per-peer connection pool and
/// a background listener dispatching inbound RPCs to a [`RaftRpcHandler`].
pub struct TcpRaftTransport {
    keypair: Arc<NodeKeyPair>,
    local_id: NodeId,
    pools: Mutex<HashMap<NodeId, Arc<ConnectionPool>>>,
    peer_addrs: Mutex<HashMap<NodeId, SocketAddr>>,
    max_idle_per_peer: usize,
}

impl TcpRaftTransport {
    /// Build a transport that signs every outbound call with `keypair` and
    /// identifies itself as that key's node id.
    pub fn new(keypair: Arc<NodeKeyPair>) -> Self {
        let local_id = keypair.node_id();
        Self {
            keypair,
            local_id,
            pools: Mutex::new(HashMap::new()),
            peer_addrs: Mutex::new(HashMap::new()),
            max_idle_per_peer: 4,
        }
    }

    /// Register (or update) a peer's address. Safe to call for peers not
    /// yet known; calls to an unregistered peer fail with `UnknownPeer`.
    pub async fn set_peer_addr(&self, peer: NodeId, addr: SocketAddr) {
        self.peer_addrs.lock().await.insert(peer, addr);
    }

    async fn pool_for(&self, peer: NodeId) -> Result<Arc<ConnectionPool>, TransportError> {
        if let Some(pool) = self.pools.lock().await.get(&peer) {
            return Ok(pool.clone());
        }
        let addr = *self
            .peer_addrs
            .lock()
            .await
            .get(&peer)
            .ok_or(TransportError::UnknownPeer(peer))?;
        let pool = Arc::new(ConnectionPool::new(addr, self.max_idle_per_peer));
        self.pools.lock().await.insert(peer, pool.clone());
        Ok(pool)
    }

    /// Bind `addr` and serve inbound RPCs, dispatching each to `handler`.
    /// Runs until the socket errors or the process exits; intended to be
    /// spawned as its own task by `node::NodeHandle::start`.
    pub async fn serve(addr: SocketAddr, handler: Arc<dyn RaftRpcHandler>) -> std::io::Result<()> {
        let listener = TcpListener::bind(addr).await?;
        loop {
            let (mut stream, peer_addr) = listener.accept().await?;
            let handler = handler.clone();
            tokio::spawn(async move {
                loop {
                    let body = match read_framed(&mut stream).await {
                        Ok(b) => b,
                        Err(_) => break,
                    };
                    let envelope: Envelope = match bincode::deserialize(&body) {
                        Ok(e) => e,
                        Err(e) => {
                            warn!(%peer_addr, error = %e, "malformed raft envelope");
                            break;
                        }
                    };
                    let request_bytes = bincode::serialize(&envelope.request)
                        .expect("RaftRequest is always serializable");
                    if !envelope.from.verify(&request_bytes, &envelope.signature) {
                        warn!(%peer_addr, from = %envelope.from, "raft envelope signature check failed");
                        break;
                    }
                    let response = handler.handle(envelope.from, envelope.request).await;
                    let encoded = bincode::serialize(&response).expect("RaftResponse is always serializable");
                    if write_framed(&mut stream, &encoded).await.is_err() {
                        break;
                    }
                }
                debug!(%peer_addr, "raft connection closed");
            });
        }
    }
}

#[async_trait]
impl RaftTransport for TcpRaftTransport {
    async fn call(&self, peer: NodeId, request: RaftRequest) -> Result<RaftResponse, TransportError> {
        let pool = self.pool_for(peer).await?;
        let request_bytes = bincode::serialize(&request).expect("RaftRequest is always serializable");
        let envelope = Envelope {
            from: self.local_id,
            signature: self.keypair.sign(&request_bytes),
            request,
        };
        let body = bincode::serialize(&envelope).expect("Envelope is always serializable");

        let mut conn = pool
            .acquire()
            .await
            .map_err(|e| TransportError::Unreachable(peer, e.to_string()))?;
        let result: Result<RaftResponse, TransportError> = async {
            write_framed(&mut conn.stream, &body)
                .await
                .map_err(|e| TransportError::Unreachable(peer, e.to_string()))?;
            let response_body = read_framed(&mut conn.stream)
                .await
                .map_err(|e| TransportError::Unreachable(peer, e.to_string()))?;
            bincode::deserialize(&response_body).map_err(|e| TransportError::Malformed(e.to_string()))
        }
        .await;

        if result.is_ok() {
            pool.release(conn).await;
        }
        result
    }

    async fn register_peer(&self, peer: NodeId, addr: SocketAddr) {
        self.set_peer_addr(peer, addr).await;
    }
}
