//! Candidate scoring: normalizes each signal into `[0, 1]` and combines
//! them under operator-tunable `ScoringWeights`, which live in `config.rs`
//! alongside the other per-concern config structs.

use crate::config::ScoringWeights;
use crate::identity::NodeId;
use crate::membership::MemberSummary;
use crate::placement::{ObservedState, PlacementIndex};
use crate::scheduler::request::Request;
use std::hash::{Hash, Hasher};

/// A node's per-model runtime signal, reported by the scheduler's dispatch
/// loop as responses land. Held separately from `membership::MemberSummary`
/// because it is inference-specific, not general node health.
#[derive(Debug, Clone, Copy, Default)]
pub struct NodeStats {
    /// Exponentially-weighted recent latency, in milliseconds.
    pub recent_latency_ms: f64,
    /// Current in-flight request count on this node.
    pub queue_depth: u32,
    /// Exponentially-weighted recent error rate, in `[0, 1]`.
    pub recent_error_rate: f64,
}

/// Scores and ranks candidate nodes for one request.
pub struct CandidateSelector<'a> {
    weights: &'a ScoringWeights,
}

impl<'a> CandidateSelector<'a> {
    /// Build a selector using `weights`.
    pub fn new(weights: &'a ScoringWeights) -> Self {
        Self { weights }
    }

    /// Score one candidate node. Higher is better. All inputs are
    /// normalized to `[0, 1]` before weighting so no single signal can
    /// dominate purely from its raw magnitude.
    fn score(&self, stats: &NodeStats, concurrency_limit: u32, has_affinity: bool) -> f64 {
        let latency_score = 1.0 / (1.0 + stats.recent_latency_ms.max(0.0) / 100.0);
        let depth_ratio = if concurrency_limit == 0 {
            1.0
        } else {
            (stats.queue_depth as f64 / concurrency_limit as f64).min(1.0)
        };
        let depth_score = 1.0 - depth_ratio;
        let error_score = 1.0 - stats.recent_error_rate.clamp(0.0, 1.0);
        let affinity_score = if has_affinity { 1.0 } else { 0.0 };

        self.weights.latency * latency_score
            + self.weights.queue_depth * depth_score
            + self.weights.error_rate * error_score
            + self.weights.affinity * affinity_score
    }

    /// Rank the nodes placement has designated for `request.model_name`,
    /// excluding any already tried for this request,
    /// and excluding any not currently `live` in membership. Returns nodes
    /// best-first.
    pub fn rank_candidates(
        &self,
        request: &Request,
        placement: &PlacementIndex,
        members: &[MemberSummary],
        stats_of: impl Fn(&NodeId) -> NodeStats,
        prior_success: impl Fn(&NodeId, &str) -> bool,
    ) -> Vec<NodeId> {
        let desired = placement.desired_nodes(&request.model_name);
        let member_by_id: std::collections::HashMap<NodeId, &MemberSummary> =
            members.iter().map(|m| (m.node_id, m)).collect();

        let mut scored: Vec<(NodeId, f64)> = desired
            .into_iter()
            .filter(|node_id| !request.excluded_nodes.contains(node_id))
            .filter_map(|node_id| {
                let member = member_by_id.get(&node_id)?;
                if member.health != crate::membership::Health::Live {
                    return None;
                }
                if placement.observed_state(&request.model_name, &node_id) == ObservedState::Failed {
                    return None;
                }
                let stats = stats_of(&node_id);
                let limit = member.capacity.max_concurrency;
                // Spare concurrency is a hard precondition, not a scoring
                // input: a saturated node is not a candidate at all.
                if limit > 0 && stats.queue_depth >= limit {
                    return None;
                }
                let has_affinity = prior_success(&node_id, &request.model_name);
                Some((node_id, self.score(&stats, limit, has_affinity)))
            })
            .collect();

        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| tie_break(&request.id, &a.0).cmp(&tie_break(&request.id, &b.0)))
        });
        scored.into_iter().map(|(id, _)| id).collect()
    }
}

/// Deterministic per-(request, node) tie-break so equal-scored candidates
/// spread across nodes instead of every scheduler herding onto the same one.
fn tie_break(request_id: &uuid::Uuid, node_id: &NodeId) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    request_id.hash(&mut hasher);
    node_id.hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::NodeKeyPair;
    use crate::membership::{Capacity, Health, MemberSummary};
    use crate::scheduler::request::Priority;

    fn member(node_id: NodeId, health: Health, max_concurrency: u32) -> MemberSummary {
        MemberSummary {
            node_id,
            addr: "127.0.0.1:9000".parse().unwrap(),
            health,
            capacity: Capacity { max_concurrency },
            last_seen: 0,
            incarnation: 0,
        }
    }

    #[test]
    fn dead_nodes_are_excluded_from_candidates() {
        let weights = ScoringWeights::default();
        let selector = CandidateSelector::new(&weights);
        let mut placement = PlacementIndex::new();
        let live = NodeKeyPair::generate().node_id();
        let dead = NodeKeyPair::generate().node_id();
        placement.apply(
            1,
            &crate::raft::EntryPayload::PlacementAdd {
                model_name: "m".to_string(),
                node_id: live,
            },
        );
        placement.apply(
            2,
            &crate::raft::EntryPayload::PlacementAdd {
                model_name: "m".to_string(),
                node_id: dead,
            },
        );
        let members = vec![member(live, Health::Live, 4), member(dead, Health::Dead, 4)];
        let request = Request::new("m", Priority::Normal, vec![], 3);

        let ranked = selector.rank_candidates(&request, &placement, &members, |_| NodeStats::default(), |_, _| false);
        assert_eq!(ranked, vec![live]);
    }

    #[test]
    fn saturated_node_is_not_a_candidate() {
        let weights = ScoringWeights::default();
        let selector = CandidateSelector::new(&weights);
        let mut placement = PlacementIndex::new();
        let full = NodeKeyPair::generate().node_id();
        placement.apply(1, &crate::raft::EntryPayload::PlacementAdd { model_name: "m".to_string(), node_id: full });
        let members = vec![member(full, Health::Live, 2)];
        let request = Request::new("m", Priority::Normal, vec![], 3);

        let ranked = selector.rank_candidates(
            &request,
            &placement,
            &members,
            |_| NodeStats { queue_depth: 2, ..Default::default() },
            |_, _| false,
        );
        assert!(ranked.is_empty());
    }

    #[test]
    fn node_with_failed_observed_placement_is_excluded() {
        let weights = ScoringWeights::default();
        let selector = CandidateSelector::new(&weights);
        let mut placement = PlacementIndex::new();
        let node = NodeKeyPair::generate().node_id();
        placement.apply(1, &crate::raft::EntryPayload::PlacementAdd { model_name: "m".to_string(), node_id: node });
        placement.apply(2, &crate::raft::EntryPayload::NodeHealth { node_id: node, health: "failed".to_string() });
        let members = vec![member(node, Health::Live, 4)];
        let request = Request::new("m", Priority::Normal, vec![], 3);

        let ranked = selector.rank_candidates(&request, &placement, &members, |_| NodeStats::default(), |_, _| false);
        assert!(ranked.is_empty());
    }

    #[test]
    fn equal_scores_break_ties_deterministically_per_request() {
        let weights = ScoringWeights::default();
        let selector = CandidateSelector::new(&weights);
        let mut placement = PlacementIndex::new();
        let a = NodeKeyPair::generate().node_id();
        let b = NodeKeyPair::generate().node_id();
        placement.apply(1, &crate::raft::EntryPayload::PlacementAdd { model_name: "m".to_string(), node_id: a });
        placement.apply(2, &crate::raft::EntryPayload::PlacementAdd { model_name: "m".to_string(), node_id: b });
        let members = vec![member(a, Health::Live, 4), member(b, Health::Live, 4)];
        let request = Request::new("m", Priority::Normal, vec![], 3);

        let first = selector.rank_candidates(&request, &placement, &members, |_| NodeStats::default(), |_, _| false);
        let second = selector.rank_candidates(&request, &placement, &members, |_| NodeStats::default(), |_, _| false);
        assert_eq!(first, second);
    }

    #[test]
    fn lower_queue_depth_ranks_higher() {
        let weights = ScoringWeights::default();
        let selector = CandidateSelector::new(&weights);
        let mut placement = PlacementIndex::new();
        let busy = NodeKeyPair::generate().node_id();
        let idle = NodeKeyPair::generate().node_id();
        placement.apply(1, &crate::raft::EntryPayload::PlacementAdd { model_name: "m".to_string(), node_id: busy });
        placement.apply(2, &crate::raft::EntryPayload::PlacementAdd { model_name: "m".to_string(), node_id: idle });
        let members = vec![member(busy, Health::Live, 10), member(idle, Health::Live, 10)];
        let request = Request::new("m", Priority::Normal, vec![], 3);

        let ranked = selector.rank_candidates(&request, &placement, &members, move |node_id| {
            if *node_id == busy {
                NodeStats { queue_depth: 9, ..Default::default() }
            } else {
                NodeStats { queue_depth: 0, ..Default::default() }
            }
        }, |_, _| false);
        assert_eq!(ranked.first(), Some(&idle));
    }
}
