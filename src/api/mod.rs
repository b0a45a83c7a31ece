//! HTTP boundary: two independent routers mounted on separate addresses,
//! one for operator/client traffic and one for peer-to-peer cluster
//! traffic. Raft's own RPC protocol is not an HTTP surface and lives in
//! `raft::transport` instead.
//!
//! - `request_api` — `Config::request_addr`: submit/poll/cancel inference,
//!   health, cluster status, model registration and pull.
//! - `peer_api` — `Config::peer_addr`: gossip exchange, chunk transfer,
//!   inference dispatch.
//!
//! One file per concern, with a shared `responses`/`middleware` layer
//! underneath both routers.

pub mod middleware;
pub mod peer_api;
pub mod request_api;
pub mod responses;

pub use peer_api::{peer_router, Executor, ExecutorError, PeerState};
pub use request_api::{request_router, ChunkSourceFactory, RequestState};
pub use responses::{ApiError, ApiResponse, ResponseMeta};
