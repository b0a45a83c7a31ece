//! Crate-wide error taxonomy.
//!
//! Every subsystem keeps a local error enum (see `cas::CompressError`,
//! `raft::RaftError`, `transfer::TransferError`, `membership::MembershipError`,
//! `scheduler::QueueError`, `chaos::ChaosError`). Each local error folds into
//! this flat taxonomy via `kind()` plus a `From` impl below, so API responses
//! and the health endpoint can report a stable classification regardless of
//! which module raised it. `Error` is a flat struct rather than an enum, so
//! `#[from]` (which thiserror only generates for enum variants) doesn't apply
//! here — each `From` impl is hand-written instead, but does exactly what
//! `#[from]` would: `Error::new(e.kind(), e.to_string())`.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Stable error classification shared by every subsystem and surfaced to
/// clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Disk or network glitch; retryable by the caller.
    TransientIO,
    /// Targeted entity absent.
    NotFound,
    /// Digest mismatch or invalid metadata; never retry the same source.
    Corrupted,
    /// Admission control engaged.
    Overloaded,
    /// Deadline reached.
    Timeout,
    /// Caller not authorized at the boundary.
    PermissionDenied,
    /// A dependency (peer, leader) is not reachable.
    Unavailable,
    /// Optimistic-concurrency failure.
    Conflict,
    /// Storage backend has no space left.
    NoSpace,
    /// Invariant violated; the offending subsystem may self-disable.
    Fatal,
}

impl ErrorKind {
    /// Whether a client should retry an operation that failed with this kind.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::TransientIO | ErrorKind::Unavailable | ErrorKind::Timeout
        )
    }
}

/// Top-level crate error. Carries a classification kind, a human message, and
/// optional context used to build client-visible responses.
#[derive(Error, Debug)]
#[error("{kind:?}: {message}")]
pub struct Error {
    /// Stable classification for clients and the health endpoint.
    pub kind: ErrorKind,
    /// Human-readable description.
    pub message: String,
}

impl Error {
    /// Construct a new error of the given kind.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Shorthand constructors for the common kinds.
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    /// Shorthand for a corrupted-data error.
    pub fn corrupted(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Corrupted, message)
    }

    /// Shorthand for a transient IO error.
    pub fn transient_io(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::TransientIO, message)
    }

    /// Shorthand for an unavailable-dependency error.
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unavailable, message)
    }

    /// Whether this error's kind should be retried by the caller.
    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        use std::io::ErrorKind as IoKind;
        let kind = match e.kind() {
            IoKind::NotFound => ErrorKind::NotFound,
            IoKind::PermissionDenied => ErrorKind::PermissionDenied,
            IoKind::TimedOut => ErrorKind::Timeout,
            _ => ErrorKind::TransientIO,
        };
        Error::new(kind, e.to_string())
    }
}

impl From<crate::chaos::ChaosError> for Error {
    fn from(e: crate::chaos::ChaosError) -> Self {
        Error::new(e.kind(), e.to_string())
    }
}

impl From<crate::membership::MembershipError> for Error {
    fn from(e: crate::membership::MembershipError) -> Self {
        Error::new(e.kind(), e.to_string())
    }
}

impl From<crate::raft::RaftError> for Error {
    fn from(e: crate::raft::RaftError) -> Self {
        Error::new(e.kind(), e.to_string())
    }
}

impl From<crate::transfer::TransferError> for Error {
    fn from(e: crate::transfer::TransferError) -> Self {
        Error::new(e.kind(), e.to_string())
    }
}

impl From<crate::cas::CompressError> for Error {
    fn from(e: crate::cas::CompressError) -> Self {
        Error::new(e.kind(), e.to_string())
    }
}

impl From<crate::scheduler::QueueError> for Error {
    fn from(e: crate::scheduler::QueueError) -> Self {
        Error::new(e.kind(), e.to_string())
    }
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// A client-visible error body: kind, message, and a retry hint, matching the
/// "every client-visible error carries a kind, a human message, and (where
/// relevant) a retry hint" requirement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Error classification.
    pub kind: ErrorKind,
    /// Human-readable message.
    pub message: String,
    /// Whether the client should retry the operation.
    pub retryable: bool,
}

impl From<&Error> for ErrorBody {
    fn from(e: &Error) -> Self {
        ErrorBody {
            kind: e.kind,
            message: e.message.clone(),
            retryable: e.is_retryable(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_kinds() {
        assert!(ErrorKind::TransientIO.is_retryable());
        assert!(ErrorKind::Unavailable.is_retryable());
        assert!(ErrorKind::Timeout.is_retryable());
        assert!(!ErrorKind::Corrupted.is_retryable());
        assert!(!ErrorKind::PermissionDenied.is_retryable());
        assert!(!ErrorKind::Fatal.is_retryable());
    }

    #[test]
    fn io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: Error = io_err.into();
        assert_eq!(err.kind, ErrorKind::NotFound);
    }

    #[test]
    fn local_subsystem_errors_fold_into_the_top_level_kind() {
        let err: Error = crate::scheduler::QueueError::Full.into();
        assert_eq!(err.kind, ErrorKind::Overloaded);

        let err: Error = crate::cas::CompressError::Codec("bad stream".to_string()).into();
        assert_eq!(err.kind, ErrorKind::Fatal);

        let err: Error = crate::membership::MembershipError::UnknownPeer(
            crate::identity::NodeKeyPair::generate().node_id(),
        )
        .into();
        assert_eq!(err.kind, ErrorKind::NotFound);
    }

    #[test]
    fn error_body_carries_retry_hint() {
        let err = Error::unavailable("leader unreachable");
        let body: ErrorBody = (&err).into();
        assert!(body.retryable);
    }
}
