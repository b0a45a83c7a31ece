//! Replicated Log: a Raft-style leader-elected, majority-replicated log
//! used as the control plane's single source of truth for membership,
//! model registration, and desired placement.
//!
//! See [`node::RaftNode`] for the state machine, [`log::Log`] for the
//! persisted entries, [`transport`] for the wire format, and [`snapshot`]
//! for folding a committed prefix into a restartable image.

pub mod log;
pub mod node;
pub mod snapshot;
pub mod transport;

pub use log::{EntryPayload, LogEntry, ResourceNeeds};
pub use node::{FencingToken, RaftError, RaftNode, Role};
pub use transport::{RaftRequest, RaftResponse, RaftRpcHandler, RaftTransport, TcpRaftTransport, TransportError};
