//! Placement Index: a deterministic projection of "where should each model
//! run" and "where is each model actually running", derived solely from
//! committed `raft` log entries — never mutated directly.
//!
//! Desired placements come from committed `PlacementAdd`/`PlacementRemove`
//! entries; observed state comes from committed `NodeHealth` entries
//! cross-referenced against the desired set. Every node folding the same
//! committed prefix holds the same projection, so the scheduler's hot path
//! reads its local copy without touching consensus.

use crate::identity::NodeId;
use crate::raft::log::EntryPayload;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// The observed state of one (model, node) placement, as last reported by
/// the scheduler through a committed `NodeHealth` entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ObservedState {
    /// The model is not known to be loaded on this node yet.
    Pending,
    /// The model is loaded and serving on this node.
    Ready,
    /// The node reported the model unhealthy; a replacement should be
    /// scheduled elsewhere.
    Failed,
}

/// The deterministic projection of the committed log into a placement view.
/// Cloning is cheap relative to the log itself and is used to snapshot the
/// projection (`raft::snapshot`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlacementIndex {
    desired: HashMap<String, HashSet<NodeId>>,
    observed: HashMap<(String, NodeId), ObservedState>,
    /// The log index this projection reflects; entries at or below this
    /// index have already been folded in.
    applied_index: u64,
}

impl PlacementIndex {
    /// An empty projection, reflecting no applied entries.
    pub fn new() -> Self {
        Self::default()
    }

    /// The log index of the last entry folded into this projection.
    pub fn applied_index(&self) -> u64 {
        self.applied_index
    }

    /// Fold one committed entry into the projection. Entries at or below
    /// `applied_index` are ignored, making this safe to call twice for the
    /// same index (e.g. on a slow follower that re-delivers after a
    /// connection retry).
    pub fn apply(&mut self, index: u64, payload: &EntryPayload) {
        if index <= self.applied_index {
            return;
        }
        match payload {
            EntryPayload::PlacementAdd { model_name, node_id } => {
                self.desired.entry(model_name.clone()).or_default().insert(*node_id);
            }
            EntryPayload::PlacementRemove { model_name, node_id } => {
                if let Some(nodes) = self.desired.get_mut(model_name) {
                    nodes.remove(node_id);
                    if nodes.is_empty() {
                        self.desired.remove(model_name);
                    }
                }
                self.observed.remove(&(model_name.clone(), *node_id));
            }
            EntryPayload::ModelUnregister { name } => {
                self.desired.remove(name);
                self.observed.retain(|(model, _), _| model != name);
            }
            EntryPayload::NodeHealth { node_id, health } => {
                // `draining` folds into `Failed`: both mean "stop routing
                // new requests here", which is all the scheduler reads out
                // of the observed state.
                let state = match health.as_str() {
                    "ready" => ObservedState::Ready,
                    "failed" | "dead" | "draining" => ObservedState::Failed,
                    _ => ObservedState::Pending,
                };
                for (model_name, nodes) in &self.desired {
                    if nodes.contains(node_id) {
                        self.observed.insert((model_name.clone(), *node_id), state);
                    }
                }
            }
            EntryPayload::NodeLeave { node_id } => {
                for nodes in self.desired.values_mut() {
                    nodes.remove(node_id);
                }
                self.observed.retain(|(_, n), _| n != node_id);
            }
            EntryPayload::NodeJoin { .. }
            | EntryPayload::ModelRegister { .. }
            | EntryPayload::SchedulerDirective { .. } => {
                // These entries carry no placement-relevant state; they are
                // observed by `scheduler` and `node` directly off the log.
            }
        }
        self.applied_index = index;
    }

    /// Desired node set for `model_name`, empty if the model has no
    /// placements.
    pub fn desired_nodes(&self, model_name: &str) -> HashSet<NodeId> {
        self.desired.get(model_name).cloned().unwrap_or_default()
    }

    /// Every model with at least one desired placement.
    pub fn placed_models(&self) -> Vec<String> {
        self.desired.keys().cloned().collect()
    }

    /// Observed state of `model_name` on `node_id`, `Pending` if never
    /// reported.
    pub fn observed_state(&self, model_name: &str, node_id: &NodeId) -> ObservedState {
        self.observed
            .get(&(model_name.to_string(), *node_id))
            .copied()
            .unwrap_or(ObservedState::Pending)
    }

    /// Nodes where `model_name` is desired but not yet `Ready`: the
    /// candidate set the scheduler's rebalance pass should act on.
    pub fn under_replicated(&self, model_name: &str) -> Vec<NodeId> {
        self.desired_nodes(model_name)
            .into_iter()
            .filter(|node_id| self.observed_state(model_name, node_id) != ObservedState::Ready)
            .collect()
    }
}
