//! Child placement

use super::types::{ChildPlacement, PlacementPolicy};
use network::NodeId;
use std::collections::HashMap;

#[derive(Debug, Default)]
pub(crate) struct Placer {
    cursor: usize,
}

impl Placer {
    /// Pick the node for a child.
    ///
    /// `peers` are the connected nodes, `load` counts running children per
    /// node, and `avoid` is a node that just failed. A pinned child whose
    /// node is unreachable falls back to local-first.
    pub(crate) fn choose(
        &mut self,
        placement: &ChildPlacement,
        default: PlacementPolicy,
        local: &NodeId,
        peers: &[NodeId],
        load: &HashMap<NodeId, usize>,
        avoid: Option<&NodeId>,
    ) -> NodeId {
        let policy = match placement {
            ChildPlacement::Pinned(node) => {
                if Some(node) != avoid && (node == local || peers.contains(node)) {
                    return node.clone();
                }
                PlacementPolicy::LocalFirst
            }
            ChildPlacement::Policy(policy) => *policy,
            ChildPlacement::Inherit => default,
        };

        let mut candidates: Vec<&NodeId> = std::iter::once(local)
            .chain(peers.iter())
            .filter(|node| Some(*node) != avoid)
            .collect();
        candidates.sort();
        candidates.dedup();
        if candidates.is_empty() {
            return local.clone();
        }

        match policy {
            PlacementPolicy::LocalFirst => local.clone(),
            PlacementPolicy::RoundRobin => {
                let node = candidates[self.cursor % candidates.len()].clone();
                self.cursor = self.cursor.wrapping_add(1);
                node
            }
            PlacementPolicy::LeastLoaded => candidates
                .into_iter()
                .min_by_key(|node| {
                    let count = load.get(*node).copied().unwrap_or(0);
                    (count, *node != local, (*node).clone())
                })
                .cloned()
                .unwrap_or_else(|| local.clone()),
        }
    }
}
