//! Client-facing HTTP boundary: submit/poll/cancel inference requests,
//! report health and cluster status, and manage model registration and
//! transfer. Mounted on `Config::request_addr`, separate from the
//! peer-to-peer boundary in `api::peer_api`, and built on the same
//! `State<Arc<_>>`-extractor-per-concern pattern.

use crate::cas::ContentStore;
use crate::config::TransferConfig;
use crate::digest::Digest;
use crate::membership::MembershipManager;
use crate::raft::{EntryPayload, RaftNode, Role};
use crate::scheduler::request::{Priority, Request, RequestStatus, TicketTable};
use crate::scheduler::queue::RequestQueue;
use crate::transfer::{ChunkSource, Transfer};
use axum::extract::{Path, Query, State};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use uuid::Uuid;

use super::responses::{ApiError, ApiResponse};

/// Builds an `HttpChunkSource` for a given peer address. Kept generic over
/// the concrete HTTP client so tests can substitute an in-process fake
/// without linking `reqwest`.
pub trait ChunkSourceFactory: Send + Sync {
    fn build(&self, peer_addr: SocketAddr) -> Arc<dyn ChunkSource>;
}

/// Shared state for the client-facing router.
pub struct RequestState {
    pub queue: Arc<RequestQueue>,
    pub tickets: Arc<TicketTable>,
    pub raft: Arc<RaftNode>,
    pub store: Arc<ContentStore>,
    pub membership: Arc<MembershipManager>,
    pub chunk_sources: Arc<dyn ChunkSourceFactory>,
    pub transfer_config: TransferConfig,
    pub started_at: Instant,
    pub default_retry_budget: u32,
}

/// Build the client-facing router. Layered outermost-first with request-id
/// propagation, then access logging, then security headers, then CORS
/// (clients are operator tooling, which may sit behind a browser console).
pub fn request_router(state: Arc<RequestState>) -> Router {
    Router::new()
        .route("/v1/requests", post(submit_inference))
        .route("/v1/requests/:ticket", get(poll))
        .route("/v1/requests/:ticket", delete(cancel))
        .route("/v1/health", get(health))
        .route("/v1/cluster/status", get(cluster_status))
        .route("/v1/models", post(register_model))
        .route("/v1/models/:name/:tag", delete(unregister_model))
        .route("/v1/models/:name/:tag/pull", post(pull_model))
        .with_state(state)
        .layer(super::middleware::cors_layer())
        .layer(axum::middleware::from_fn(super::middleware::security_headers_middleware))
        .layer(axum::middleware::from_fn(super::middleware::request_logging_middleware))
        .layer(axum::middleware::from_fn(super::middleware::request_id_middleware))
}

fn now_millis() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).expect("system clock before unix epoch").as_millis() as u64
}

#[derive(Debug, Deserialize)]
struct SubmitInferenceRequest {
    model_name: String,
    input: Vec<u8>,
    /// Epoch millis after which the request is no longer worth dispatching.
    /// Optional; omitted means no deadline.
    deadline_ms: Option<u64>,
    priority: Priority,
    /// Caller-supplied idempotency key. Omitted means the request gets a
    /// fresh, unique key and so can never be deduplicated against a
    /// retried submission.
    client_id: Option<Uuid>,
    /// Sequence number paired with `client_id`; ignored if `client_id` is
    /// absent.
    #[serde(default)]
    client_seq: u64,
}

#[derive(Debug, Serialize)]
struct SubmitInferenceResponse {
    ticket: Uuid,
    status: RequestStatus,
}

/// `submit_inference(model, input, deadline, priority) -> ticket`. A
/// request whose deadline has already passed is rejected before it ever
/// reaches admission control.
async fn submit_inference(
    State(state): State<Arc<RequestState>>,
    Json(req): Json<SubmitInferenceRequest>,
) -> Result<Json<ApiResponse<SubmitInferenceResponse>>, ApiError> {
    let mut request = Request::new(req.model_name, req.priority, req.input, state.default_retry_budget);
    if let Some(client_id) = req.client_id {
        request = request.with_client_key(client_id, req.client_seq);
    }
    let ticket = request.id;

    if let Some(deadline_ms) = req.deadline_ms {
        if deadline_ms <= now_millis() {
            request.mark_rejected();
            state.tickets.set(ticket, request.status);
            return Ok(Json(ApiResponse::ok(SubmitInferenceResponse { ticket, status: request.status })));
        }
        request = request.with_deadline(deadline_ms);
    }

    state.tickets.set(ticket, request.status);
    match state.queue.admit(request) {
        Ok(()) => {
            state.tickets.set(ticket, RequestStatus::Queued);
            Ok(Json(ApiResponse::ok(SubmitInferenceResponse { ticket, status: RequestStatus::Queued })))
        }
        Err((rejected, err)) => {
            state.tickets.set(ticket, rejected.status);
            Err(ApiError::new(err.kind(), err.to_string()))
        }
    }
}

#[derive(Debug, Serialize)]
struct PollResponse {
    status: RequestStatus,
}

/// `poll(ticket) -> status | result | error`. Result payloads are not
/// held here — they are delivered directly by the executing node over the
/// peer boundary; this endpoint only ever reports last-known status.
async fn poll(
    State(state): State<Arc<RequestState>>,
    Path(ticket): Path<Uuid>,
) -> Result<Json<ApiResponse<PollResponse>>, ApiError> {
    let status = state
        .tickets
        .get(&ticket)
        .ok_or_else(|| ApiError::new(crate::error::ErrorKind::NotFound, "no such ticket"))?;
    Ok(Json(ApiResponse::ok(PollResponse { status })))
}

/// `cancel(ticket)`: best-effort. A request still queued is marked
/// cancelled outright; a request already dispatched has no cancel signal to
/// forward (no such channel exists on the narrow `Executor` contract), so
/// the ticket is left as last reported and the caller should keep polling;
/// an already-terminal ticket is returned unchanged.
async fn cancel(
    State(state): State<Arc<RequestState>>,
    Path(ticket): Path<Uuid>,
) -> Result<Json<ApiResponse<PollResponse>>, ApiError> {
    let status = state
        .tickets
        .get(&ticket)
        .ok_or_else(|| ApiError::new(crate::error::ErrorKind::NotFound, "no such ticket"))?;
    if !status.is_terminal() && status != RequestStatus::Dispatched {
        state.tickets.set(ticket, RequestStatus::Cancelled);
        return Ok(Json(ApiResponse::ok(PollResponse { status: RequestStatus::Cancelled })));
    }
    Ok(Json(ApiResponse::ok(PollResponse { status })))
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: String,
    uptime_secs: u64,
    node_id: String,
}

/// `health() -> {status, uptime, node_id}`. `degraded` reports a
/// follower that has lost contact with a leader; `healthy` otherwise —
/// this node has no condition under which it reports `unhealthy` itself
/// (a node that cannot serve at all does not answer requests).
async fn health(State(state): State<Arc<RequestState>>) -> Json<ApiResponse<HealthResponse>> {
    let role = state.raft.role().await;
    let leader = state.raft.current_leader().await;
    let status = if role != Role::Leader && leader.is_none() { "degraded" } else { "healthy" };
    Json(ApiResponse::ok(HealthResponse {
        status: status.to_string(),
        uptime_secs: state.started_at.elapsed().as_secs(),
        node_id: state.raft.local_id().to_hex(),
    }))
}

#[derive(Debug, Serialize)]
struct ClusterStatusResponse {
    members: Vec<crate::membership::MemberSummary>,
    leader: Option<String>,
    committed_index: u64,
    placements: Vec<PlacementEntry>,
}

#[derive(Debug, Serialize)]
struct PlacementEntry {
    model_name: String,
    desired_nodes: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ClusterStatusQuery {
    /// When set, run the read through the leader's read-index barrier so the
    /// response is guaranteed to reflect every previously committed entry.
    /// The default is a local read off this node's own replica.
    #[serde(default)]
    consistent: bool,
}

/// `cluster_status() -> {members, leader, committed_index, placements}`.
async fn cluster_status(
    State(state): State<Arc<RequestState>>,
    Query(query): Query<ClusterStatusQuery>,
) -> Result<Json<ApiResponse<ClusterStatusResponse>>, ApiError> {
    if query.consistent {
        state
            .raft
            .read_index()
            .await
            .map_err(|e| ApiError::new(e.kind(), e.to_string()))?;
    }
    let placement = state.raft.placement().await;
    let placements = placement
        .placed_models()
        .into_iter()
        .map(|model_name| {
            let desired_nodes = placement.desired_nodes(&model_name).into_iter().map(|n| n.to_hex()).collect();
            PlacementEntry { model_name, desired_nodes }
        })
        .collect();
    Ok(Json(ApiResponse::ok(ClusterStatusResponse {
        members: state.membership.members(),
        leader: state.raft.current_leader().await.map(|n| n.to_hex()),
        committed_index: state.raft.committed_index(),
        placements,
    })))
}

#[derive(Debug, Deserialize)]
struct RegisterModelRequest {
    name: String,
    tag: String,
    manifest_digest: String,
    /// Declared total artifact size in bytes, 0 if the caller doesn't know.
    #[serde(default)]
    declared_size: u64,
    /// Memory the model needs to serve, in bytes.
    #[serde(default)]
    memory_bytes: u64,
    /// Accelerator class the model needs, if any.
    #[serde(default)]
    accelerator_class: Option<String>,
    /// Caller-supplied idempotency key; a retried registration with the
    /// same `(client_id, client_seq)` lands on the original log entry.
    client_id: Option<Uuid>,
    /// Sequence number paired with `client_id`.
    #[serde(default)]
    client_seq: u64,
}

/// `register_model(name, tag, manifest_digest)`: proposes a
/// `ModelRegister` entry. Returns `NotLeader` (folded to `Unavailable`,
/// retryable) if this node is not currently leading, so the client can
/// redirect.
async fn register_model(
    State(state): State<Arc<RequestState>>,
    Json(req): Json<RegisterModelRequest>,
) -> Result<Json<ApiResponse<()>>, ApiError> {
    let manifest_digest = Digest::from_hex(&req.manifest_digest)
        .map_err(|_| ApiError::new(crate::error::ErrorKind::Corrupted, "malformed manifest digest"))?;
    let name = format!("{}:{}", req.name, req.tag);
    let payload = EntryPayload::ModelRegister {
        name,
        manifest_digest,
        declared_size: req.declared_size,
        resources: crate::raft::log::ResourceNeeds {
            memory_bytes: req.memory_bytes,
            accelerator_class: req.accelerator_class,
        },
    };
    state
        .raft
        .propose(req.client_id.unwrap_or_else(Uuid::new_v4), req.client_seq, payload)
        .await
        .map_err(|e| ApiError::new(e.kind(), e.to_string()))?;
    Ok(Json(ApiResponse::ok(())))
}

/// Client-supplied idempotency key for mutating calls that carry no body
/// of their own. Absent, the call gets a fresh key and cannot be
/// deduplicated.
#[derive(Debug, Deserialize)]
struct ClientKeyQuery {
    client_id: Option<Uuid>,
    #[serde(default)]
    client_seq: u64,
}

/// `unregister_model(name, tag)`: proposes a `ModelUnregister` entry.
async fn unregister_model(
    State(state): State<Arc<RequestState>>,
    Path((name, tag)): Path<(String, String)>,
    Query(key): Query<ClientKeyQuery>,
) -> Result<Json<ApiResponse<()>>, ApiError> {
    let name = format!("{name}:{tag}");
    state
        .raft
        .propose(
            key.client_id.unwrap_or_else(Uuid::new_v4),
            key.client_seq,
            EntryPayload::ModelUnregister { name },
        )
        .await
        .map_err(|e| ApiError::new(e.kind(), e.to_string()))?;
    Ok(Json(ApiResponse::ok(())))
}

#[derive(Debug, Deserialize)]
struct PullModelRequest {
    manifest_digest: String,
}

/// `pull_model(name, tag)`: enqueues a background transfer of the
/// model's manifest blob from whichever live peer answers first. `name`
/// and `tag` identify the model for logging only — the manifest digest the
/// caller already holds (from `register_model`) is what drives the actual
/// transfer.
async fn pull_model(
    State(state): State<Arc<RequestState>>,
    Path((name, tag)): Path<(String, String)>,
    Json(req): Json<PullModelRequest>,
) -> Result<Json<ApiResponse<()>>, ApiError> {
    let blob_digest = Digest::from_hex(&req.manifest_digest)
        .map_err(|_| ApiError::new(crate::error::ErrorKind::Corrupted, "malformed manifest digest"))?;
    let local_id = state.raft.local_id();
    let candidates: Vec<SocketAddr> = state
        .membership
        .live_members()
        .into_iter()
        .filter(|m| m.node_id != local_id)
        .map(|m| m.addr)
        .collect();
    if candidates.is_empty() {
        return Err(ApiError::new(crate::error::ErrorKind::Unavailable, "no live peers to pull from"));
    }

    let store = state.store.clone();
    let transfer_config = state.transfer_config.clone();
    let chunk_sources = state.chunk_sources.clone();
    tokio::spawn(async move {
        for addr in candidates {
            let source = chunk_sources.build(addr);
            let transfer = Transfer::new(&store, source, transfer_config.clone());
            match transfer.run(&blob_digest).await {
                Ok(progress) => {
                    tracing::info!(%name, %tag, %addr, completed = progress.completed_chunks, "model pull completed");
                    return;
                }
                Err(e) => {
                    tracing::warn!(%name, %tag, %addr, error = %e, "model pull attempt failed, trying next peer");
                }
            }
        }
        tracing::warn!(%name, %tag, "model pull exhausted all known peers");
    });

    Ok(Json(ApiResponse::ok(())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::NodeKeyPair;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request as HttpRequest;
    use tower::ServiceExt;

    struct NoopTransport;
    #[async_trait]
    impl crate::membership::GossipTransport for NoopTransport {
        async fn exchange(
            &self,
            _peer: &crate::identity::NodeId,
            _addr: SocketAddr,
            _local_digest: Vec<crate::membership::MemberSummary>,
        ) -> Result<Vec<crate::membership::MemberSummary>, crate::membership::MembershipError> {
            Ok(vec![])
        }
    }

    struct NoopRaftTransport;
    #[async_trait]
    impl crate::raft::RaftTransport for NoopRaftTransport {
        async fn call(
            &self,
            peer: crate::identity::NodeId,
            _request: crate::raft::RaftRequest,
        ) -> Result<crate::raft::RaftResponse, crate::raft::TransportError> {
            Err(crate::raft::TransportError::Unreachable(peer, "no peers in this test".into()))
        }
    }

    struct NullChunkSourceFactory;
    impl ChunkSourceFactory for NullChunkSourceFactory {
        fn build(&self, _peer_addr: SocketAddr) -> Arc<dyn ChunkSource> {
            struct Empty;
            #[async_trait]
            impl ChunkSource for Empty {
                async fn list_chunks(&self, _blob_digest: &Digest) -> Result<Vec<Digest>, crate::transfer::TransferError> {
                    Ok(vec![])
                }
                async fn fetch_chunk(&self, _digest: &Digest) -> Result<Vec<u8>, crate::transfer::TransferError> {
                    Err(crate::transfer::TransferError::SourceUnavailable("test source has no chunks".into()))
                }
            }
            Arc::new(Empty)
        }
    }

    async fn test_state() -> (Arc<RequestState>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let mut cas_config = crate::config::CasConfig::default();
        cas_config.root = dir.path().to_path_buf();
        let store = Arc::new(crate::cas::open(cas_config).await.unwrap());

        let local_id = NodeKeyPair::generate().node_id();
        let membership = Arc::new(MembershipManager::new(
            local_id,
            "127.0.0.1:0".parse().unwrap(),
            crate::config::MembershipConfig::default(),
            Arc::new(NoopTransport),
        ));

        let mut raft_config = crate::config::RaftConfig::default();
        raft_config.data_dir = dir.path().join("raft");
        let raft = Arc::new(
            RaftNode::new(local_id, vec![local_id], raft_config, Arc::new(NoopRaftTransport)).unwrap(),
        );

        let state = Arc::new(RequestState {
            queue: Arc::new(RequestQueue::new(4, 16, 100, 1000.0)),
            tickets: Arc::new(TicketTable::new()),
            raft,
            store,
            membership,
            chunk_sources: Arc::new(NullChunkSourceFactory),
            transfer_config: crate::config::TransferConfig::default(),
            started_at: Instant::now(),
            default_retry_budget: 3,
        });
        (state, dir)
    }

    #[tokio::test]
    async fn submit_then_poll_reports_queued() {
        let (state, _dir) = test_state().await;
        let app = request_router(state);

        let body = serde_json::to_vec(&serde_json::json!({
            "model_name": "llama:7b",
            "input": [1, 2, 3],
            "deadline_ms": null,
            "priority": "Normal",
            "client_id": null,
        }))
        .unwrap();
        let response = app
            .clone()
            .oneshot(
                HttpRequest::builder()
                    .method("POST")
                    .uri("/v1/requests")
                    .header("content-type", "application/json")
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert!(response.status().is_success());
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        let ticket = parsed["data"]["ticket"].as_str().unwrap();
        assert_eq!(parsed["data"]["status"], "Queued");

        let response = app
            .oneshot(HttpRequest::builder().uri(format!("/v1/requests/{ticket}")).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert!(response.status().is_success());
    }

    #[tokio::test]
    async fn submit_persists_deadline_and_client_key_onto_the_admitted_request() {
        let (state, _dir) = test_state().await;
        let queue = state.queue.clone();
        let app = request_router(state);

        let client_id = Uuid::new_v4();
        let deadline_ms = now_millis() + 60_000;
        let body = serde_json::to_vec(&serde_json::json!({
            "model_name": "llama:7b",
            "input": [1, 2, 3],
            "deadline_ms": deadline_ms,
            "priority": "Normal",
            "client_id": client_id,
            "client_seq": 9,
        }))
        .unwrap();
        let response = app
            .oneshot(
                HttpRequest::builder()
                    .method("POST")
                    .uri("/v1/requests")
                    .header("content-type", "application/json")
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert!(response.status().is_success());

        let admitted = queue.pop_best().expect("the submitted request should be sitting in the queue");
        assert_eq!(admitted.deadline_ms, Some(deadline_ms));
        assert_eq!(admitted.client_id, client_id);
        assert_eq!(admitted.client_seq, 9);
    }

    #[tokio::test]
    async fn poll_unknown_ticket_is_not_found() {
        let (state, _dir) = test_state().await;
        let app = request_router(state);
        let response = app
            .oneshot(
                HttpRequest::builder()
                    .uri(format!("/v1/requests/{}", Uuid::new_v4()))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), axum::http::StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn health_reports_node_id_and_uptime() {
        let (state, _dir) = test_state().await;
        let app = request_router(state);
        let response = app.oneshot(HttpRequest::builder().uri("/v1/health").body(Body::empty()).unwrap()).await.unwrap();
        assert!(response.status().is_success());
    }

    #[tokio::test]
    async fn local_cluster_status_read_works_without_a_leader() {
        let (state, _dir) = test_state().await;
        let app = request_router(state);
        let response = app
            .oneshot(HttpRequest::builder().uri("/v1/cluster/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert!(response.status().is_success());
    }

    #[tokio::test]
    async fn consistent_cluster_status_on_non_leader_is_unavailable() {
        let (state, _dir) = test_state().await;
        let app = request_router(state);
        let response = app
            .oneshot(
                HttpRequest::builder()
                    .uri("/v1/cluster/status?consistent=true")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), axum::http::StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn register_model_on_non_leader_is_unavailable() {
        // A lone node with no peers never wins an election inside this
        // test's lifetime, so it proposes as a follower and is rejected.
        let (state, _dir) = test_state().await;
        let app = request_router(state);
        let body = serde_json::to_vec(&serde_json::json!({
            "name": "llama",
            "tag": "7b",
            "manifest_digest": crate::digest::Digest::of(b"manifest").to_hex(),
        }))
        .unwrap();
        let response = app
            .oneshot(
                HttpRequest::builder()
                    .method("POST")
                    .uri("/v1/models")
                    .header("content-type", "application/json")
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), axum::http::StatusCode::SERVICE_UNAVAILABLE);
    }
}
