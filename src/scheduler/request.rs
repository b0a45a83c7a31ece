//! The inference `Request` type and its state machine: a request moves
//! `accepted -> queued -> dispatched -> {completed, failed, rejected}`,
//! never backward. The one reversible edge is `dispatched -> queued`, taken
//! only on a transient failure with retries remaining.

use crate::identity::NodeId;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Priority class, used both for queue admission and candidate scoring.
/// Ordered so `Critical` sorts highest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Priority {
    Low,
    Normal,
    High,
    Critical,
}

/// Where a request currently sits in its lifecycle. Transitions only move
/// forward; a terminal state is never revisited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestStatus {
    /// Accepted by the request API, not yet admitted to a queue shard.
    Accepted,
    /// Holding in a shard's bounded queue, awaiting dispatch.
    Queued,
    /// Sent to a candidate node and awaiting its response.
    Dispatched,
    /// No live candidate node exists for this model; a `PlacementAdd` has
    /// been proposed and the request is parked back on the queue awaiting
    /// its deadline or a retry once placement commits.
    NeedsPlacement,
    /// The candidate node returned a successful result.
    Completed,
    /// Every retry was exhausted without a successful dispatch.
    Failed,
    /// Parked in `NeedsPlacement` past its deadline with no candidate ever
    /// materializing. Distinct from `TimedOut`: nothing was ever tried.
    Exhausted,
    /// Any other in-flight request whose deadline passed.
    TimedOut,
    /// Admission control declined the request outright.
    Rejected,
    /// Cancelled by the client before completion. Best-effort: a request
    /// already executing runs to its own conclusion.
    Cancelled,
}

impl RequestStatus {
    /// Whether this status is terminal (no further transitions expected).
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RequestStatus::Completed
                | RequestStatus::Failed
                | RequestStatus::Exhausted
                | RequestStatus::TimedOut
                | RequestStatus::Rejected
                | RequestStatus::Cancelled
        )
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_millis() as u64
}

/// One inference request moving through the scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    /// Unique id assigned at acceptance.
    pub id: uuid::Uuid,
    /// The model handle this request targets, e.g. `"llama:7b"`.
    pub model_name: String,
    /// Request priority class.
    pub priority: Priority,
    /// Opaque request payload, forwarded to whichever node serves it.
    pub payload: Vec<u8>,
    /// Current lifecycle state.
    pub status: RequestStatus,
    /// Number of dispatch attempts made so far.
    pub attempt: u32,
    /// Maximum dispatch attempts before the request is marked `Failed`.
    pub retry_budget: u32,
    /// Epoch millis past which this request gives up, whatever its current
    /// state. `None` means no caller-supplied deadline.
    pub deadline_ms: Option<u64>,
    /// Client-supplied idempotency key, preserved across retries so the
    /// executor (and the Raft leader's own proposal log) can deduplicate a
    /// retried attempt instead of double-executing it.
    pub client_id: uuid::Uuid,
    /// Sequence number paired with `client_id`. Distinct submissions from
    /// the same client must use distinct sequence numbers; a retry of the
    /// same logical request reuses the same pair.
    pub client_seq: u64,
    /// Nodes already tried and rejected or failed, excluded from future
    /// candidate selection for this request.
    pub excluded_nodes: Vec<NodeId>,
    /// The node currently (or most recently) dispatched to, if any.
    pub dispatched_to: Option<NodeId>,
    /// Every node this request was dispatched to, in order, with whether
    /// that attempt succeeded.
    pub routing_history: Vec<(NodeId, bool)>,
    /// Epoch millis this request was accepted.
    pub accepted_at_ms: u64,
    /// Epoch millis of the last status transition.
    pub updated_at_ms: u64,
}

impl Request {
    /// Create a freshly accepted request with no deadline and a random
    /// client key (callers that need idempotent retries should supply
    /// their own via `with_client_key`).
    pub fn new(model_name: impl Into<String>, priority: Priority, payload: Vec<u8>, retry_budget: u32) -> Self {
        let now = now_millis();
        Self {
            id: uuid::Uuid::new_v4(),
            model_name: model_name.into(),
            priority,
            payload,
            status: RequestStatus::Accepted,
            attempt: 0,
            retry_budget,
            deadline_ms: None,
            client_id: uuid::Uuid::new_v4(),
            client_seq: 0,
            excluded_nodes: Vec::new(),
            dispatched_to: None,
            routing_history: Vec::new(),
            accepted_at_ms: now,
            updated_at_ms: now,
        }
    }

    /// Attach a deadline, past which dispatch gives up.
    pub fn with_deadline(mut self, deadline_ms: u64) -> Self {
        self.deadline_ms = Some(deadline_ms);
        self
    }

    /// Attach the caller-supplied idempotency key, overriding the random
    /// default `new` assigns.
    pub fn with_client_key(mut self, client_id: uuid::Uuid, client_seq: u64) -> Self {
        self.client_id = client_id;
        self.client_seq = client_seq;
        self
    }

    /// Whether `deadline_ms` has passed.
    pub fn is_past_deadline(&self) -> bool {
        self.deadline_ms.is_some_and(|deadline| now_millis() >= deadline)
    }

    /// Move to `Queued`.
    pub fn mark_queued(&mut self) {
        self.status = RequestStatus::Queued;
        self.updated_at_ms = now_millis();
    }

    /// Move to `Dispatched` against `node`, incrementing the attempt
    /// counter.
    pub fn mark_dispatched(&mut self, node: NodeId) {
        self.attempt += 1;
        self.dispatched_to = Some(node);
        self.status = RequestStatus::Dispatched;
        self.updated_at_ms = now_millis();
    }

    /// Move to `Completed`.
    pub fn mark_completed(&mut self) {
        if let Some(node) = self.dispatched_to {
            self.routing_history.push((node, true));
        }
        self.status = RequestStatus::Completed;
        self.updated_at_ms = now_millis();
    }

    /// Record a failed dispatch attempt. Excludes the failed node from
    /// future candidate selection and either re-queues the request (if
    /// retries remain) or marks it `Failed`.
    pub fn mark_attempt_failed(&mut self) {
        if let Some(node) = self.dispatched_to.take() {
            self.routing_history.push((node, false));
            self.excluded_nodes.push(node);
        }
        if self.attempt >= self.retry_budget {
            self.status = RequestStatus::Failed;
        } else {
            self.status = RequestStatus::Queued;
        }
        self.updated_at_ms = now_millis();
    }

    /// Move to `Rejected`, used when admission control declines the
    /// request before it ever reaches a queue.
    pub fn mark_rejected(&mut self) {
        self.status = RequestStatus::Rejected;
        self.updated_at_ms = now_millis();
    }

    /// Move to `NeedsPlacement`: no live candidate exists yet for this
    /// request's model.
    pub fn mark_needs_placement(&mut self) {
        self.status = RequestStatus::NeedsPlacement;
        self.updated_at_ms = now_millis();
    }

    /// Move to `Exhausted`: parked in `NeedsPlacement` past its deadline
    /// with no candidate ever materializing.
    pub fn mark_exhausted(&mut self) {
        self.status = RequestStatus::Exhausted;
        self.updated_at_ms = now_millis();
    }

    /// Move to `TimedOut`: an ordinary (non-`NeedsPlacement`) request whose
    /// deadline passed.
    pub fn mark_timed_out(&mut self) {
        self.status = RequestStatus::TimedOut;
        self.updated_at_ms = now_millis();
    }

    /// Whether this request still has at least one retry left.
    pub fn has_retries_remaining(&self) -> bool {
        self.attempt < self.retry_budget
    }
}

/// Tracks each request's last-known status for the `poll(ticket)` request-API
/// operation, since `Dispatcher` only ever holds a request on its own
/// stack between queue pop and completion. `Dispatcher` writes to this on
/// every transition; the request API only reads.
#[derive(Default)]
pub struct TicketTable {
    statuses: DashMap<uuid::Uuid, RequestStatus>,
}

impl TicketTable {
    /// An empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the current status of `id`.
    pub fn set(&self, id: uuid::Uuid, status: RequestStatus) {
        self.statuses.insert(id, status);
    }

    /// The last-known status of `id`, if this table has seen it.
    pub fn get(&self, id: &uuid::Uuid) -> Option<RequestStatus> {
        self.statuses.get(id).map(|s| *s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ticket_table_reports_last_recorded_status() {
        let table = TicketTable::new();
        let id = uuid::Uuid::new_v4();
        assert!(table.get(&id).is_none());
        table.set(id, RequestStatus::Queued);
        table.set(id, RequestStatus::Dispatched);
        assert_eq!(table.get(&id), Some(RequestStatus::Dispatched));
    }

    #[test]
    fn retry_then_exhaustion_reaches_failed() {
        let mut req = Request::new("llama:7b", Priority::Normal, vec![], 2);
        req.mark_queued();
        req.mark_dispatched(crate::identity::NodeKeyPair::generate().node_id());
        req.mark_attempt_failed();
        assert_eq!(req.status, RequestStatus::Queued);
        assert_eq!(req.excluded_nodes.len(), 1);

        req.mark_dispatched(crate::identity::NodeKeyPair::generate().node_id());
        req.mark_attempt_failed();
        assert_eq!(req.status, RequestStatus::Failed);
        assert!(req.status.is_terminal());
    }

    #[test]
    fn completion_is_terminal() {
        let mut req = Request::new("m", Priority::High, vec![], 1);
        req.mark_queued();
        req.mark_dispatched(crate::identity::NodeKeyPair::generate().node_id());
        req.mark_completed();
        assert!(req.status.is_terminal());
    }

    #[test]
    fn routing_history_records_every_attempt_in_order() {
        let mut req = Request::new("m", Priority::Normal, vec![], 2);
        req.mark_queued();
        let first = crate::identity::NodeKeyPair::generate().node_id();
        req.mark_dispatched(first);
        req.mark_attempt_failed();
        let second = crate::identity::NodeKeyPair::generate().node_id();
        req.mark_dispatched(second);
        req.mark_completed();
        assert_eq!(req.routing_history, vec![(first, false), (second, true)]);
    }

    #[test]
    fn deadline_and_client_key_are_persisted_by_builders() {
        let client_id = uuid::Uuid::new_v4();
        let req = Request::new("m", Priority::Normal, vec![], 1)
            .with_deadline(123)
            .with_client_key(client_id, 7);
        assert_eq!(req.deadline_ms, Some(123));
        assert_eq!(req.client_id, client_id);
        assert_eq!(req.client_seq, 7);
    }

    #[test]
    fn is_past_deadline_compares_against_now() {
        let past = Request::new("m", Priority::Normal, vec![], 1).with_deadline(1);
        assert!(past.is_past_deadline());

        let future = Request::new("m", Priority::Normal, vec![], 1).with_deadline(now_millis() + 60_000);
        assert!(!future.is_past_deadline());

        let none = Request::new("m", Priority::Normal, vec![], 1);
        assert!(!none.is_past_deadline());
    }

    #[test]
    fn needs_placement_and_exhausted_are_distinct_from_ordinary_failure() {
        let mut req = Request::new("m", Priority::Normal, vec![], 1);
        req.mark_needs_placement();
        assert_eq!(req.status, RequestStatus::NeedsPlacement);
        assert!(!req.status.is_terminal());

        req.mark_exhausted();
        assert_eq!(req.status, RequestStatus::Exhausted);
        assert!(req.status.is_terminal());

        let mut timed_out = Request::new("m", Priority::Normal, vec![], 1);
        timed_out.mark_queued();
        timed_out.mark_timed_out();
        assert_eq!(timed_out.status, RequestStatus::TimedOut);
        assert!(timed_out.status.is_terminal());
    }
}
