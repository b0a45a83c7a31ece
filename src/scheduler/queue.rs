//! Bounded, sharded admission queue: each shard is a priority queue gated
//! by a per-priority-class token bucket, so a burst of `Low` traffic can
//! never starve `Critical` admission. Shards are keyed by request id to
//! spread lock contention; the bucket is per priority class rather than per
//! client because admission protects overall capacity, it does not
//! rate-limit individual callers.

use crate::scheduler::request::{Priority, Request};
use parking_lot::Mutex;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Errors admitting or dequeuing a request.
#[derive(Debug, Error)]
pub enum QueueError {
    /// The target shard was at its bound.
    #[error("queue shard is full")]
    Full,
    /// The priority class's admission budget is exhausted.
    #[error("admission control rejected the request, retry after {retry_after_ms}ms")]
    AdmissionDenied {
        /// Milliseconds until the bucket is expected to have capacity again.
        retry_after_ms: u64,
    },
}

impl QueueError {
    /// Fold into the crate-wide error taxonomy; both variants are transient
    /// capacity pressure, not permanent rejections.
    pub fn kind(&self) -> crate::error::ErrorKind {
        crate::error::ErrorKind::Overloaded
    }
}

/// A lock-free token bucket, one per priority class, gating admission
/// before a request ever reaches a shard's queue.
struct TokenBucket {
    capacity: u64,
    tokens: AtomicU64,
    refill_per_sec: f64,
    last_refill_nanos: AtomicU64,
}

impl TokenBucket {
    fn new(capacity: u64, refill_per_sec: f64) -> Self {
        Self {
            capacity,
            tokens: AtomicU64::new(capacity),
            refill_per_sec,
            last_refill_nanos: AtomicU64::new(now_nanos()),
        }
    }

    fn refill(&self) {
        let now = now_nanos();
        let last = self.last_refill_nanos.load(Ordering::Acquire);
        let elapsed_secs = now.saturating_sub(last) as f64 / 1_000_000_000.0;
        let to_add = (elapsed_secs * self.refill_per_sec) as u64;
        if to_add == 0 {
            return;
        }
        if self
            .last_refill_nanos
            .compare_exchange(last, now, Ordering::Release, Ordering::Acquire)
            .is_ok()
        {
            loop {
                let current = self.tokens.load(Ordering::Acquire);
                let updated = (current + to_add).min(self.capacity);
                if self
                    .tokens
                    .compare_exchange(current, updated, Ordering::Release, Ordering::Acquire)
                    .is_ok()
                {
                    break;
                }
            }
        }
    }

    fn try_acquire(&self) -> Result<(), u64> {
        self.refill();
        loop {
            let current = self.tokens.load(Ordering::Acquire);
            if current == 0 {
                let millis_per_token = (1000.0 / self.refill_per_sec.max(0.001)) as u64;
                return Err(millis_per_token);
            }
            if self
                .tokens
                .compare_exchange(current, current - 1, Ordering::Release, Ordering::Acquire)
                .is_ok()
            {
                return Ok(());
            }
        }
    }
}

fn now_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_nanos() as u64
}

struct HeapEntry(Priority, u64, Request);

// Ordering is defined purely by (priority, sequence); `Request` carries no
// ordering of its own, so equality and comparison both ignore it.
impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0 && self.1 == other.1
    }
}

impl Eq for HeapEntry {}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Higher priority first; within a priority class, earlier sequence
        // number (FIFO) first.
        self.0.cmp(&other.0).then_with(|| other.1.cmp(&self.1))
    }
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

struct Shard {
    heap: BinaryHeap<HeapEntry>,
    bound: usize,
}

/// Admission-controlled, sharded priority queue for inbound requests.
pub struct RequestQueue {
    shards: Vec<Mutex<Shard>>,
    buckets: HashMap<Priority, TokenBucket>,
    sequence: AtomicU64,
}

impl RequestQueue {
    /// Build a queue with `shard_count` shards, each bounded at
    /// `shard_bound`, with one token bucket per priority class sharing
    /// `burst`/`refill_per_sec`.
    pub fn new(shard_count: usize, shard_bound: usize, burst: u64, refill_per_sec: f64) -> Self {
        let shards = (0..shard_count.max(1))
            .map(|_| {
                Mutex::new(Shard {
                    heap: BinaryHeap::new(),
                    bound: shard_bound,
                })
            })
            .collect();
        let mut buckets = HashMap::new();
        for priority in [Priority::Low, Priority::Normal, Priority::High, Priority::Critical] {
            buckets.insert(priority, TokenBucket::new(burst, refill_per_sec));
        }
        Self {
            shards,
            buckets,
            sequence: AtomicU64::new(0),
        }
    }

    fn shard_for(&self, request_id: uuid::Uuid) -> &Mutex<Shard> {
        let index = (request_id.as_u128() % self.shards.len() as u128) as usize;
        &self.shards[index]
    }

    /// Run admission control and, if admitted, enqueue the request into its
    /// shard. Mutates `request.status` to `Queued` on success.
    pub fn admit(&self, mut request: Request) -> Result<(), (Request, QueueError)> {
        let bucket = self
            .buckets
            .get(&request.priority)
            .expect("every Priority variant has a bucket");
        if let Err(retry_after_ms) = bucket.try_acquire() {
            request.mark_rejected();
            return Err((request, QueueError::AdmissionDenied { retry_after_ms }));
        }

        let shard = self.shard_for(request.id);
        let mut shard = shard.lock();
        if shard.heap.len() >= shard.bound {
            request.mark_rejected();
            return Err((request, QueueError::Full));
        }
        request.mark_queued();
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        shard.heap.push(HeapEntry(request.priority, sequence, request));
        Ok(())
    }

    /// Pop the highest-priority (then oldest) request from whichever shard
    /// currently holds the best candidate. `O(shard_count)`; fine at the
    /// shard counts configured for this cluster.
    pub fn pop_best(&self) -> Option<Request> {
        let mut best: Option<(usize, Priority, u64)> = None;
        for (index, shard) in self.shards.iter().enumerate() {
            if let Some(entry) = shard.lock().heap.peek() {
                let candidate = (index, entry.0, entry.1);
                if best.is_none() || candidate.1 > best.unwrap().1 || (candidate.1 == best.unwrap().1 && candidate.2 < best.unwrap().2) {
                    best = Some(candidate);
                }
            }
        }
        let (index, _, _) = best?;
        self.shards[index].lock().heap.pop().map(|entry| entry.2)
    }

    /// Re-admit a request that failed a dispatch attempt but still has
    /// retries, bypassing admission control (it was already admitted once).
    pub fn requeue(&self, request: Request) -> Result<(), (Request, QueueError)> {
        let shard = self.shard_for(request.id);
        let mut shard = shard.lock();
        if shard.heap.len() >= shard.bound {
            return Err((request, QueueError::Full));
        }
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        let priority = request.priority;
        shard.heap.push(HeapEntry(priority, sequence, request));
        Ok(())
    }

    /// Total queued requests across all shards, for diagnostics.
    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.lock().heap.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(priority: Priority) -> Request {
        Request::new("m", priority, vec![], 3)
    }

    #[test]
    fn higher_priority_pops_first() {
        let queue = RequestQueue::new(4, 16, 100, 1000.0);
        queue.admit(request(Priority::Low)).unwrap();
        queue.admit(request(Priority::Critical)).unwrap();
        queue.admit(request(Priority::Normal)).unwrap();

        let first = queue.pop_best().unwrap();
        assert_eq!(first.priority, Priority::Critical);
    }

    #[test]
    fn fifo_within_same_priority() {
        let queue = RequestQueue::new(1, 16, 100, 1000.0);
        let a = request(Priority::Normal);
        let a_id = a.id;
        queue.admit(a).unwrap();
        queue.admit(request(Priority::Normal)).unwrap();

        let first = queue.pop_best().unwrap();
        assert_eq!(first.id, a_id);
    }

    #[test]
    fn shard_bound_rejects_overflow() {
        let queue = RequestQueue::new(1, 1, 100, 1000.0);
        queue.admit(request(Priority::Normal)).unwrap();
        let (_, err) = queue.admit(request(Priority::Normal)).unwrap_err();
        assert!(matches!(err, QueueError::Full));
    }

    #[test]
    fn admission_control_denies_once_bucket_is_empty() {
        let queue = RequestQueue::new(1, 16, 1, 0.001);
        queue.admit(request(Priority::Low)).unwrap();
        let (_, err) = queue.admit(request(Priority::Low)).unwrap_err();
        assert!(matches!(err, QueueError::AdmissionDenied { .. }));
    }
}
