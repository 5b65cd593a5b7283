//! Hierarchical entity graph: keyed arena, provisional roots, leaf selection
//!
//! Nodes are addressed by stable keys; parent references are key lookups,
//! never owning pointers, so missing parents and cycles cannot leak or
//! crash. Children whose declared parent does not resolve are provisional
//! roots: they stay selectable instead of being silently dropped.

use std::collections::{HashMap, HashSet};

use crate::core::types::Vec3;
use crate::world::index::ChunkKey;
use crate::world::record::{EntityRecord, NodeKey};

/// Detail rank flagging the orphan-high-detail tier. A parent at this
/// rank only accepts children at the same rank.
pub const ORPHAN_HD_RANK: u8 = 255;

/// A link is rejected (child promoted to root) when the parent's detail
/// rank is coarser than or equal to the child's; ranks grow with detail.
/// Nodes without a declared rank never reject.
fn link_allowed(parent_rank: Option<u8>, child_rank: Option<u8>) -> bool {
    match (parent_rank, child_rank) {
        (Some(p), Some(c)) => {
            if p == ORPHAN_HD_RANK || c == ORPHAN_HD_RANK {
                p == c
            } else {
                p > c
            }
        }
        _ => true,
    }
}

#[derive(Clone, Debug)]
struct EntityNode {
    declared_parent: Option<NodeKey>,
    attached_parent: Option<NodeKey>,
    expected_children: u32,
    children: Vec<NodeKey>,
    position: Vec3,
    /// Own selection threshold; absent on the wire means unbounded.
    lod_dist: f32,
    /// Expansion threshold toward children; absent means unbounded.
    child_lod_dist: f32,
    rank: Option<u8>,
    /// Backing record: owning chunk and index within its record list.
    source: (ChunkKey, usize),
}

/// Arena of hierarchy nodes with recursive leaf selection.
#[derive(Debug, Default)]
pub struct EntityGraph {
    nodes: HashMap<NodeKey, EntityNode>,
    /// Children waiting for a parent key to resolve; drained on insert.
    pending_children: HashMap<NodeKey, Vec<NodeKey>>,
    roots: HashSet<NodeKey>,
    by_chunk: HashMap<ChunkKey, Vec<NodeKey>>,
}

impl EntityGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn root_count(&self) -> usize {
        self.roots.len()
    }

    pub fn is_root(&self, key: NodeKey) -> bool {
        self.roots.contains(&key)
    }

    /// Insert every record of a chunk that carries a hierarchy identity.
    /// Records without one are not graph citizens and are ignored here.
    pub fn insert_chunk(&mut self, chunk: ChunkKey, records: &[EntityRecord]) {
        for (index, record) in records.iter().enumerate() {
            let Some(key) = record.node_key() else {
                continue;
            };
            if self.nodes.contains_key(&key) {
                log::warn!("entity graph: duplicate node key {:?}, replacing", key);
                self.remove_node(key);
            }

            let node = EntityNode {
                declared_parent: record.parent_key(),
                attached_parent: None,
                expected_children: record.num_children,
                children: Vec::new(),
                position: record.position(),
                lod_dist: record.lod_dist.unwrap_or(f32::INFINITY),
                child_lod_dist: record.child_lod_dist.unwrap_or(f32::INFINITY),
                rank: record.lod_level,
                source: (chunk, index),
            };
            self.nodes.insert(key, node);
            self.by_chunk.entry(chunk).or_default().push(key);
            self.roots.insert(key);

            self.try_attach_to_parent(key);
            self.drain_pending_for(key);
        }
    }

    /// Drop every node owned by a chunk; attached children of removed
    /// parents revert to provisional roots.
    pub fn remove_chunk(&mut self, chunk: ChunkKey) {
        let Some(keys) = self.by_chunk.remove(&chunk) else {
            return;
        };
        for key in keys {
            // A duplicate key may have been replaced by another chunk's
            // node; only remove what this chunk still owns.
            let owned = self
                .nodes
                .get(&key)
                .map(|n| n.source.0 == chunk)
                .unwrap_or(false);
            if owned {
                self.remove_node(key);
            }
        }
    }

    fn remove_node(&mut self, key: NodeKey) {
        let Some(node) = self.nodes.remove(&key) else {
            return;
        };
        self.roots.remove(&key);

        // Detach from an attached parent.
        if let Some(parent_key) = node.attached_parent {
            if let Some(parent) = self.nodes.get_mut(&parent_key) {
                parent.children.retain(|c| *c != key);
            }
        }
        // Un-register as a pending child.
        if let Some(declared) = node.declared_parent {
            if let Some(pending) = self.pending_children.get_mut(&declared) {
                pending.retain(|c| *c != key);
                if pending.is_empty() {
                    self.pending_children.remove(&declared);
                }
            }
        }
        // Orphan the attached children: provisional roots again, queued
        // for re-attachment should the parent key ever resolve anew.
        for child_key in node.children {
            if let Some(child) = self.nodes.get_mut(&child_key) {
                child.attached_parent = None;
                self.roots.insert(child_key);
                if let Some(declared) = child.declared_parent {
                    self.pending_children.entry(declared).or_default().push(child_key);
                }
            }
        }
    }

    /// Attach `key` under its declared parent when that parent exists and
    /// the rank rule allows it; otherwise the node stays a (provisional)
    /// root, registered in the pending index when the parent is missing.
    fn try_attach_to_parent(&mut self, key: NodeKey) {
        let (declared, child_rank) = {
            let node = &self.nodes[&key];
            (node.declared_parent, node.rank)
        };
        let Some(parent_key) = declared else {
            return; // declared root
        };

        match self.nodes.get(&parent_key) {
            Some(parent) => {
                if link_allowed(parent.rank, child_rank) {
                    if let Some(parent) = self.nodes.get_mut(&parent_key) {
                        parent.children.push(key);
                    }
                    if let Some(node) = self.nodes.get_mut(&key) {
                        node.attached_parent = Some(parent_key);
                    }
                    self.roots.remove(&key);
                } else {
                    log::trace!("entity graph: link rejected for {:?} (rank rule)", key);
                }
            }
            None => {
                self.pending_children.entry(parent_key).or_default().push(key);
            }
        }
    }

    /// Resolve children that declared `key` as their parent.
    fn drain_pending_for(&mut self, key: NodeKey) {
        let Some(children) = self.pending_children.remove(&key) else {
            return;
        };
        let parent_rank = self.nodes[&key].rank;
        for child_key in children {
            let Some(child) = self.nodes.get(&child_key) else {
                continue;
            };
            if link_allowed(parent_rank, child.rank) {
                if let Some(parent) = self.nodes.get_mut(&key) {
                    parent.children.push(child_key);
                }
                if let Some(child) = self.nodes.get_mut(&child_key) {
                    child.attached_parent = Some(key);
                }
                self.roots.remove(&child_key);
            }
            // Rejected links leave the child as a root permanently.
        }
    }

    /// Recursive leaf selection from every root.
    ///
    /// A node expands into its children only when all declared children
    /// are resolved and either the node is inside its child-distance
    /// threshold or at least one child is inside its own threshold.
    /// Otherwise the node is a candidate leaf, included when inside its
    /// own threshold.
    pub fn select_leaves(&self, camera: Vec3) -> Vec<(ChunkKey, usize)> {
        let mut out = Vec::new();
        let mut visited = HashSet::new();
        for &root in &self.roots {
            self.select_into(root, camera, &mut visited, &mut out);
        }
        out
    }

    fn select_into(
        &self,
        key: NodeKey,
        camera: Vec3,
        visited: &mut HashSet<NodeKey>,
        out: &mut Vec<(ChunkKey, usize)>,
    ) {
        if !visited.insert(key) {
            return; // cycle or diamond guard
        }
        let Some(node) = self.nodes.get(&key) else {
            return;
        };

        let distance = camera.distance(node.position);
        let all_resolved =
            node.expected_children > 0 && node.children.len() as u32 >= node.expected_children;
        let expand = all_resolved
            && (distance <= node.child_lod_dist
                || node.children.iter().any(|child_key| {
                    self.nodes
                        .get(child_key)
                        .map(|child| camera.distance(child.position) <= child.lod_dist)
                        .unwrap_or(false)
                }));

        if expand {
            for &child in &node.children {
                self.select_into(child, camera, visited, out);
            }
        } else if distance <= node.lod_dist {
            out.push(node.source);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(
        ymap: u32,
        index: u32,
        parent: i32,
        num_children: u32,
        pos: [f32; 3],
        lod_dist: f32,
        child_lod_dist: f32,
        lod_level: Option<u8>,
    ) -> EntityRecord {
        let mut json = format!(
            r#"{{"archetype": 1, "position": [{}, {}, {}], "ymap": {}, "ymap_entity_index": {}, "parent_index": {}, "num_children": {}"#,
            pos[0], pos[1], pos[2], ymap, index, parent, num_children
        );
        // Unbounded thresholds are simply absent on the wire.
        if lod_dist.is_finite() {
            json.push_str(&format!(r#", "lod_dist": {:.1}"#, lod_dist));
        }
        if child_lod_dist.is_finite() {
            json.push_str(&format!(r#", "child_lod_dist": {:.1}"#, child_lod_dist));
        }
        if let Some(level) = lod_level {
            json.push_str(&format!(r#", "lod_level": {}"#, level));
        }
        json.push('}');
        serde_json::from_str(&json).unwrap()
    }

    fn chunk() -> ChunkKey {
        ChunkKey::new(0, 0)
    }

    #[test]
    fn test_parent_and_child_resolve_in_any_order() {
        let mut graph = EntityGraph::new();
        // Child arrives before its parent.
        graph.insert_chunk(
            chunk(),
            &[record(1, 2, 1, 0, [0.0, 0.0, 0.0], 100.0, f32::INFINITY, None)],
        );
        assert_eq!(graph.root_count(), 1); // provisional root

        graph.insert_chunk(
            ChunkKey::new(1, 0),
            &[record(1, 1, -1, 1, [0.0, 0.0, 0.0], 500.0, 200.0, None)],
        );
        assert_eq!(graph.node_count(), 2);
        // Pending child drained: only the parent remains a root.
        assert_eq!(graph.root_count(), 1);
        assert!(graph.is_root(NodeKey::new(1, 1)));
        assert!(!graph.is_root(NodeKey::new(1, 2)));
    }

    #[test]
    fn test_unresolved_parent_leaves_provisional_root_selected_once() {
        // Scenario: the declared parent never resolves; the child appears
        // in the leaf set exactly once.
        let mut graph = EntityGraph::new();
        graph.insert_chunk(
            chunk(),
            &[record(1, 2, 99, 0, [0.0, 0.0, 0.0], 100.0, f32::INFINITY, None)],
        );

        let leaves = graph.select_leaves(Vec3::new(10.0, 0.0, 0.0));
        assert_eq!(leaves, vec![(chunk(), 0)]);
    }

    #[test]
    fn test_expansion_requires_all_children_resolved() {
        let mut graph = EntityGraph::new();
        // Parent declares two children but only one is present.
        graph.insert_chunk(
            chunk(),
            &[
                record(1, 0, -1, 2, [0.0, 0.0, 0.0], 1000.0, 50.0, None),
                record(1, 1, 0, 0, [10.0, 0.0, 0.0], 100.0, f32::INFINITY, None),
            ],
        );

        // Camera well inside child_lod_dist, but the parent cannot expand.
        let leaves = graph.select_leaves(Vec3::ZERO);
        assert_eq!(leaves, vec![(chunk(), 0)]); // the parent itself

        // Second child arrives: now the parent expands.
        graph.insert_chunk(
            ChunkKey::new(1, 0),
            &[record(1, 2, 0, 0, [20.0, 0.0, 0.0], 100.0, f32::INFINITY, None)],
        );
        let mut leaves = graph.select_leaves(Vec3::ZERO);
        leaves.sort();
        assert_eq!(leaves, vec![(chunk(), 1), (ChunkKey::new(1, 0), 0)]);
    }

    #[test]
    fn test_far_parent_stays_collapsed() {
        let mut graph = EntityGraph::new();
        graph.insert_chunk(
            chunk(),
            &[
                record(1, 0, -1, 1, [0.0, 0.0, 0.0], 1000.0, 50.0, None),
                record(1, 1, 0, 0, [0.0, 0.0, 0.0], 60.0, f32::INFINITY, None),
            ],
        );

        // Camera at 200: outside child_lod_dist (50) and outside the
        // child's own threshold (60) => the parent is the leaf.
        let leaves = graph.select_leaves(Vec3::new(200.0, 0.0, 0.0));
        assert_eq!(leaves, vec![(chunk(), 0)]);

        // Camera at 40: inside child_lod_dist => expand to the child.
        let leaves = graph.select_leaves(Vec3::new(40.0, 0.0, 0.0));
        assert_eq!(leaves, vec![(chunk(), 1)]);
    }

    #[test]
    fn test_child_within_own_threshold_forces_expansion() {
        let mut graph = EntityGraph::new();
        graph.insert_chunk(
            chunk(),
            &[
                record(1, 0, -1, 1, [0.0, 0.0, 0.0], 1000.0, 50.0, None),
                record(1, 1, 0, 0, [90.0, 0.0, 0.0], 60.0, f32::INFINITY, None),
            ],
        );

        // Camera at 80 from the parent (outside child_lod_dist 50) but
        // only 10 from the child (inside its threshold 60).
        let leaves = graph.select_leaves(Vec3::new(80.0, 0.0, 0.0));
        assert_eq!(leaves, vec![(chunk(), 1)]);
    }

    #[test]
    fn test_rank_rule_rejects_coarser_or_equal_parent() {
        let mut graph = EntityGraph::new();
        // Parent rank 1 (coarser), child rank 2 (finer): with ranks
        // growing by detail the parent is coarser => rejected.
        graph.insert_chunk(
            chunk(),
            &[
                record(1, 0, -1, 1, [0.0, 0.0, 0.0], 1000.0, 50.0, Some(1)),
                record(1, 1, 0, 0, [0.0, 0.0, 0.0], 100.0, f32::INFINITY, Some(2)),
            ],
        );
        // Child was promoted to root.
        assert!(graph.is_root(NodeKey::new(1, 1)));
        assert_eq!(graph.root_count(), 2);

        // Equal ranks are rejected the same way.
        let mut graph = EntityGraph::new();
        graph.insert_chunk(
            chunk(),
            &[
                record(2, 0, -1, 1, [0.0, 0.0, 0.0], 1000.0, 50.0, Some(3)),
                record(2, 1, 0, 0, [0.0, 0.0, 0.0], 100.0, f32::INFINITY, Some(3)),
            ],
        );
        assert!(graph.is_root(NodeKey::new(2, 1)));

        // Finer parent over coarser child is allowed.
        let mut graph = EntityGraph::new();
        graph.insert_chunk(
            chunk(),
            &[
                record(3, 0, -1, 1, [0.0, 0.0, 0.0], 1000.0, 50.0, Some(3)),
                record(3, 1, 0, 0, [0.0, 0.0, 0.0], 100.0, f32::INFINITY, Some(1)),
            ],
        );
        assert!(!graph.is_root(NodeKey::new(3, 1)));
    }

    #[test]
    fn test_orphan_hd_parent_only_accepts_matching_children() {
        let mut graph = EntityGraph::new();
        graph.insert_chunk(
            chunk(),
            &[
                record(1, 0, -1, 2, [0.0, 0.0, 0.0], 1000.0, 50.0, Some(ORPHAN_HD_RANK)),
                record(1, 1, 0, 0, [0.0, 0.0, 0.0], 100.0, f32::INFINITY, Some(2)),
                record(1, 2, 0, 0, [0.0, 0.0, 0.0], 100.0, f32::INFINITY, Some(ORPHAN_HD_RANK)),
            ],
        );
        // The non-matching child is invalidated, the matching one attaches.
        assert!(graph.is_root(NodeKey::new(1, 1)));
        assert!(!graph.is_root(NodeKey::new(1, 2)));
    }

    #[test]
    fn test_remove_chunk_promotes_children_and_reattaches() {
        let parent_chunk = ChunkKey::new(1, 0);
        let child_chunk = ChunkKey::new(0, 0);

        let mut graph = EntityGraph::new();
        graph.insert_chunk(
            child_chunk,
            &[record(1, 2, 1, 0, [0.0, 0.0, 0.0], 100.0, f32::INFINITY, None)],
        );
        graph.insert_chunk(
            parent_chunk,
            &[record(1, 1, -1, 1, [0.0, 0.0, 0.0], 500.0, 200.0, None)],
        );
        assert!(!graph.is_root(NodeKey::new(1, 2)));

        graph.remove_chunk(parent_chunk);
        assert_eq!(graph.node_count(), 1);
        assert!(graph.is_root(NodeKey::new(1, 2)));

        // Parent comes back (chunk reloaded): child re-attaches.
        graph.insert_chunk(
            parent_chunk,
            &[record(1, 1, -1, 1, [0.0, 0.0, 0.0], 500.0, 200.0, None)],
        );
        assert!(!graph.is_root(NodeKey::new(1, 2)));
    }
}
