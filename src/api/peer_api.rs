//! Peer-facing HTTP boundary: the real, network-backed implementations of
//! the `ChunkSource`, `GossipTransport`, and `InferenceSink` seams that
//! `transfer`, `membership`, and `scheduler` define as traits and test
//! against in-process fakes. Raft traffic does not live here — it keeps its
//! own length-prefixed TCP protocol (`raft::transport::TcpRaftTransport`).

use crate::cas::ContentStore;
use crate::digest::Digest;
use crate::identity::{NodeId, NodeKeyPair};
use crate::membership::{MemberSummary, MembershipError, MembershipManager, SignedMemberDigest};
use crate::raft::{FencingToken, RaftNode};
use crate::scheduler::Request;
use crate::transfer::{ChunkSource, TransferError};
use async_trait::async_trait;
use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use super::responses::{ApiError, ApiResponse};

/// A local model executor: the narrow contract standing in for a real
/// inference engine. Given a model handle and a request payload, produce
/// output bytes (a token stream, opaque to the scheduler).
#[async_trait]
pub trait Executor: Send + Sync {
    /// Execute `payload` against `model_name`, returning the output bytes
    /// or an error indicating whether the caller should retry elsewhere.
    async fn execute(&self, model_name: &str, payload: &[u8]) -> Result<Vec<u8>, ExecutorError>;
}

/// Errors an `Executor` can return. `ModelNotLoaded` and `Busy` are
/// transient and worth retrying elsewhere; `BadInput` is deterministic and
/// never retried.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ExecutorError {
    #[error("model {0} is not loaded on this node")]
    ModelNotLoaded(String),
    #[error("executor at capacity")]
    Busy,
    #[error("malformed request payload")]
    BadInput,
}

/// An executor that has no model backend to run — it reports every model
/// loaded and echoes the payload back, standing in for the real inference
/// engine this system does not implement (see `Executor`'s doc comment).
pub struct EchoExecutor;

#[async_trait]
impl Executor for EchoExecutor {
    async fn execute(&self, _model_name: &str, payload: &[u8]) -> Result<Vec<u8>, ExecutorError> {
        Ok(payload.to_vec())
    }
}

/// Shared state for the peer-facing router.
pub struct PeerState {
    pub store: Arc<ContentStore>,
    pub executor: Arc<dyn Executor>,
    pub membership: Arc<MembershipManager>,
    pub raft: Arc<RaftNode>,
    pub keypair: Arc<NodeKeyPair>,
}

/// Build the peer router: chunk transfer, gossip exchange, inference
/// dispatch. Mounted on `Config::peer_addr`. Layered outermost-first with
/// request-id propagation, then access logging, then security headers.
pub fn peer_router(state: Arc<PeerState>) -> Router {
    Router::new()
        .route("/v1/peer/chunks/:blob_digest", get(list_chunks))
        .route("/v1/peer/chunks/:blob_digest/:chunk_digest", get(fetch_chunk))
        .route("/v1/peer/gossip", post(gossip_exchange))
        .route("/v1/peer/infer", post(infer))
        .with_state(state)
        .layer(axum::middleware::from_fn(super::middleware::security_headers_middleware))
        .layer(axum::middleware::from_fn(super::middleware::request_logging_middleware))
        .layer(axum::middleware::from_fn(super::middleware::request_id_middleware))
}

async fn list_chunks(
    State(state): State<Arc<PeerState>>,
    Path(blob_digest): Path<String>,
) -> Result<Json<Vec<String>>, ApiError> {
    let digest = Digest::from_hex(&blob_digest)
        .map_err(|_| ApiError::new(crate::error::ErrorKind::Corrupted, "malformed digest"))?;
    let entry = state
        .store
        .blob_entry(&digest)
        .ok_or_else(|| ApiError::new(crate::error::ErrorKind::NotFound, "blob not held by this node"))?;
    Ok(Json(entry.chunk_digests.iter().map(Digest::to_hex).collect()))
}

async fn fetch_chunk(
    State(state): State<Arc<PeerState>>,
    Path((_blob_digest, chunk_digest)): Path<(String, String)>,
) -> Result<Vec<u8>, ApiError> {
    let digest = Digest::from_hex(&chunk_digest)
        .map_err(|_| ApiError::new(crate::error::ErrorKind::Corrupted, "malformed digest"))?;
    state
        .store
        .get_chunk_plaintext(&digest)
        .await
        .map_err(ApiError::from)
}

async fn gossip_exchange(
    State(state): State<Arc<PeerState>>,
    Json(remote): Json<SignedMemberDigest>,
) -> Result<Json<SignedMemberDigest>, ApiError> {
    if !remote.verify() {
        return Err(ApiError::new(
            crate::error::ErrorKind::PermissionDenied,
            "gossip digest signature check failed",
        ));
    }
    let merged = state.membership.merge_digest(remote.members);
    Ok(Json(SignedMemberDigest::sign(&state.keypair, merged)))
}

async fn infer(
    State(state): State<Arc<PeerState>>,
    Json(req): Json<InferRequest>,
) -> Result<Json<ApiResponse<InferResponse>>, ApiError> {
    // A dispatch fenced with a term older than one this node has already
    // heard from came from a deposed leader; refuse it so two leaders can
    // never both look authoritative for the same placement decision.
    if let Some(token) = req.fencing {
        let current_term = state.raft.current_term().await;
        if token.term < current_term {
            return Err(ApiError::new(
                crate::error::ErrorKind::Unavailable,
                "dispatching leader's term is stale",
            ));
        }
    }
    let output = state
        .executor
        .execute(&req.model_name, &req.payload)
        .await
        .map_err(|e| {
            let kind = match e {
                ExecutorError::ModelNotLoaded(_) => crate::error::ErrorKind::NotFound,
                ExecutorError::Busy => crate::error::ErrorKind::Overloaded,
                ExecutorError::BadInput => crate::error::ErrorKind::Corrupted,
            };
            ApiError::new(kind, e.to_string())
        })?;
    Ok(Json(ApiResponse::ok(InferResponse { output })))
}

#[derive(Debug, Serialize, Deserialize)]
struct InferRequest {
    model_name: String,
    payload: Vec<u8>,
    /// The dispatching leader's fencing token, absent when the dispatcher
    /// was not (or no longer) the leader.
    #[serde(default)]
    fencing: Option<FencingToken>,
}

#[derive(Debug, Serialize)]
struct InferResponse {
    output: Vec<u8>,
}

/// HTTP client implementation of `ChunkSource`: fetches chunk plaintext
/// from a peer's `peer_router`, used as the `source` side of `transfer::Transfer`.
pub struct HttpChunkSource {
    client: reqwest::Client,
    base_url: String,
}

impl HttpChunkSource {
    /// Build a source pointed at `peer_addr`'s peer router.
    pub fn new(peer_addr: SocketAddr) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: format!("http://{peer_addr}"),
        }
    }
}

#[async_trait]
impl ChunkSource for HttpChunkSource {
    async fn list_chunks(&self, blob_digest: &Digest) -> Result<Vec<Digest>, TransferError> {
        let url = format!("{}/v1/peer/chunks/{}", self.base_url, blob_digest.to_hex());
        let hexes: Vec<String> = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| TransferError::SourceUnavailable(e.to_string()))?
            .json()
            .await
            .map_err(|e| TransferError::SourceUnavailable(e.to_string()))?;
        hexes
            .iter()
            .map(|h| Digest::from_hex(h).map_err(|_| TransferError::SourceUnavailable("malformed chunk digest from peer".into())))
            .collect()
    }

    async fn fetch_chunk(&self, digest: &Digest) -> Result<Vec<u8>, TransferError> {
        let url = format!("{}/v1/peer/chunks/_/{}", self.base_url, digest.to_hex());
        let bytes = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| TransferError::SourceUnavailable(e.to_string()))?
            .bytes()
            .await
            .map_err(|e| TransferError::SourceUnavailable(e.to_string()))?;
        Ok(bytes.to_vec())
    }
}

/// HTTP client implementation of `membership::GossipTransport`. Signs the
/// outbound digest and verifies the peer's signed reply.
pub struct HttpGossipTransport {
    client: reqwest::Client,
    keypair: Arc<NodeKeyPair>,
}

impl HttpGossipTransport {
    /// A transport with a bounded per-call timeout, matching the gossip
    /// round's tolerance for a slow/unreachable peer.
    pub fn new(timeout: Duration, keypair: Arc<NodeKeyPair>) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_default(),
            keypair,
        }
    }
}

#[async_trait]
impl crate::membership::GossipTransport for HttpGossipTransport {
    async fn exchange(
        &self,
        peer: &NodeId,
        addr: SocketAddr,
        local_digest: Vec<MemberSummary>,
    ) -> Result<Vec<MemberSummary>, MembershipError> {
        let url = format!("http://{addr}/v1/peer/gossip");
        let signed = SignedMemberDigest::sign(&self.keypair, local_digest);
        let reply: SignedMemberDigest = self
            .client
            .post(&url)
            .json(&signed)
            .send()
            .await
            .map_err(|e| MembershipError::Unreachable { peer: *peer, reason: e.to_string() })?
            .json()
            .await
            .map_err(|e| MembershipError::Unreachable { peer: *peer, reason: e.to_string() })?;
        if reply.from != *peer || !reply.verify() {
            return Err(MembershipError::Unreachable {
                peer: *peer,
                reason: "gossip reply failed signature verification".to_string(),
            });
        }
        Ok(reply.members)
    }
}

/// HTTP client implementation of `scheduler::InferenceSink`.
pub struct HttpInferenceSink {
    client: reqwest::Client,
    addr_of: Arc<dyn Fn(NodeId) -> Option<SocketAddr> + Send + Sync>,
}

impl HttpInferenceSink {
    /// Build a sink that resolves a node's peer address via `addr_of`
    /// (backed by `membership::MembershipManager::members` in production).
    pub fn new(addr_of: Arc<dyn Fn(NodeId) -> Option<SocketAddr> + Send + Sync>) -> Self {
        Self { client: reqwest::Client::new(), addr_of }
    }
}

#[async_trait]
impl crate::scheduler::InferenceSink for HttpInferenceSink {
    async fn dispatch(&self, node: NodeId, request: &Request, fencing: Option<FencingToken>) -> bool {
        let Some(addr) = (self.addr_of)(node) else {
            return false;
        };
        let url = format!("http://{addr}/v1/peer/infer");
        let body = InferRequest {
            model_name: request.model_name.clone(),
            payload: request.payload.clone(),
            fencing,
        };
        self.client.post(&url).json(&body).send().await.map(|r| r.status().is_success()).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::RaftRpcHandler;
    use axum::body::Body;
    use axum::http::Request as HttpRequest;
    use tower::ServiceExt;

    struct NoopGossipTransport;
    #[async_trait]
    impl crate::membership::GossipTransport for NoopGossipTransport {
        async fn exchange(
            &self,
            _peer: &NodeId,
            _addr: SocketAddr,
            _local_digest: Vec<MemberSummary>,
        ) -> Result<Vec<MemberSummary>, MembershipError> {
            Ok(vec![])
        }
    }

    struct NoopRaftTransport;
    #[async_trait]
    impl crate::raft::RaftTransport for NoopRaftTransport {
        async fn call(
            &self,
            peer: NodeId,
            _request: crate::raft::RaftRequest,
        ) -> Result<crate::raft::RaftResponse, crate::raft::TransportError> {
            Err(crate::raft::TransportError::UnknownPeer(peer))
        }
    }

    async fn test_state() -> (Arc<PeerState>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let mut config = crate::config::CasConfig::default();
        config.root = dir.path().join("cas");
        let store = Arc::new(crate::cas::open(config).await.unwrap());

        let keypair = Arc::new(NodeKeyPair::generate());
        let local_id = keypair.node_id();
        let membership = Arc::new(MembershipManager::new(
            local_id,
            "127.0.0.1:0".parse().unwrap(),
            crate::config::MembershipConfig::default(),
            Arc::new(NoopGossipTransport),
        ));
        let mut raft_config = crate::config::RaftConfig::default();
        raft_config.data_dir = dir.path().join("raft");
        let raft = Arc::new(
            RaftNode::new(local_id, vec![local_id], raft_config, Arc::new(NoopRaftTransport)).unwrap(),
        );

        let state = Arc::new(PeerState {
            store,
            executor: Arc::new(EchoExecutor),
            membership,
            raft,
            keypair,
        });
        (state, dir)
    }

    #[tokio::test]
    async fn infer_endpoint_echoes_payload_through_echo_executor() {
        let (state, _dir) = test_state().await;
        let app = peer_router(state);

        let body = serde_json::to_vec(&serde_json::json!({
            "model_name": "m",
            "payload": [1, 2, 3],
        }))
        .unwrap();
        let response = app
            .oneshot(
                HttpRequest::builder()
                    .method("POST")
                    .uri("/v1/peer/infer")
                    .header("content-type", "application/json")
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert!(response.status().is_success());
    }

    #[tokio::test]
    async fn stale_fencing_token_is_refused() {
        let (state, _dir) = test_state().await;

        // Raise this node's known term past the token's by handling a
        // higher-term vote request.
        let candidate = NodeKeyPair::generate().node_id();
        state
            .raft
            .handle(
                candidate,
                crate::raft::RaftRequest::RequestVote {
                    term: 5,
                    candidate_id: candidate,
                    last_log_index: 0,
                    last_log_term: 0,
                },
            )
            .await;

        let stale_leader = NodeKeyPair::generate().node_id();
        let app = peer_router(state);
        let body = serde_json::to_vec(&serde_json::json!({
            "model_name": "m",
            "payload": [1],
            "fencing": { "term": 2, "leader": stale_leader },
        }))
        .unwrap();
        let response = app
            .oneshot(
                HttpRequest::builder()
                    .method("POST")
                    .uri("/v1/peer/infer")
                    .header("content-type", "application/json")
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), axum::http::StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn gossip_rejects_a_forged_digest() {
        let (state, _dir) = test_state().await;
        let app = peer_router(state);

        let honest = NodeKeyPair::generate();
        let mut digest = SignedMemberDigest::sign(&honest, vec![]);
        // Claim another node's identity without its key.
        digest.from = NodeKeyPair::generate().node_id();

        let body = serde_json::to_vec(&digest).unwrap();
        let response = app
            .oneshot(
                HttpRequest::builder()
                    .method("POST")
                    .uri("/v1/peer/gossip")
                    .header("content-type", "application/json")
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), axum::http::StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn missing_blob_returns_not_found() {
        let (state, _dir) = test_state().await;
        let app = peer_router(state);

        let missing = Digest::of(b"never stored").to_hex();
        let response = app
            .oneshot(
                HttpRequest::builder()
                    .uri(format!("/v1/peer/chunks/{missing}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), axum::http::StatusCode::NOT_FOUND);
    }
}
