//! The materialized tree: a pure function of the op set.
//!
//! The view is rebuilt from the canonically sorted log after every apply
//! batch, so any permutation of arrivals converges to the same tree. Nothing
//! in here mutates the log.
use crate::clock::VersionVector;
use crate::id::{Lamport, NodeId, OpId, ReplicaId};
use crate::op::{Op, OpKind};
use crate::opref::OpRef;
use crate::order_key::OrderKey;
use fnv::{FnvHashMap, FnvHashSet};
use std::collections::BTreeSet;

type Rank = (Lamport, ReplicaId, u64);

/// Derived per-node state.
#[derive(Clone, Debug, Default)]
pub struct NodeView {
    /// Live parent, or `None` while the node is only known from payload or
    /// delete traffic and its insert has not arrived yet.
    pub parent: Option<NodeId>,
    pub order_key: Option<OrderKey>,
    /// Soft-deleted or tombstoned.
    pub deleted: bool,
    /// Unconditionally dead; absorbing.
    pub tombstoned: bool,
    pub payload: Option<Vec<u8>>,
    pub payload_writer: Option<OpRef>,
    /// Cached number of live children.
    pub child_count: u64,
}

/// One page row of an ordered child listing.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ChildRow {
    pub node: NodeId,
    pub order_key: OrderKey,
}

/// One row of a full tree dump.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TreeRow {
    pub node: NodeId,
    pub parent: Option<NodeId>,
    pub order_key: Option<OrderKey>,
    pub tombstone: bool,
}

/// Result of a single parent-chain step, tri-valued for the scope evaluator.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ParentLink {
    Known(NodeId),
    /// The local tree lacks the information to decide.
    Unknown,
}

#[derive(Clone, Debug, Default)]
pub struct Tree {
    nodes: FnvHashMap<NodeId, NodeView>,
    /// Live children ordered by `(order_key, node_id)`.
    children: FnvHashMap<NodeId, BTreeSet<(OrderKey, NodeId)>>,
    /// Every attached child, dead or alive, for subtree traversal.
    children_all: FnvHashMap<NodeId, Vec<NodeId>>,
}

struct Edge {
    parent: NodeId,
    order_key: OrderKey,
    rank: Rank,
}

impl Tree {
    /// Rebuilds the view from an op iterator in canonical
    /// `(lamport, replica, counter)` order.
    pub fn build<'a>(doc_id: &str, ops: impl Iterator<Item = &'a Op> + Clone) -> Tree {
        let mut edges: FnvHashMap<NodeId, Edge> = Default::default();
        let mut tree = Tree::default();

        // Structural winners: the highest-ranked insert/move per node. The
        // iterator is sorted, so overwriting keeps the winner.
        for op in ops.clone() {
            if op.node().is_reserved() {
                continue;
            }
            match &op.kind {
                OpKind::Insert {
                    parent,
                    node,
                    order_key,
                    ..
                } => {
                    edges.insert(
                        *node,
                        Edge {
                            parent: *parent,
                            order_key: order_key.clone(),
                            rank: op.sort_key(),
                        },
                    );
                }
                OpKind::Move {
                    node,
                    new_parent,
                    order_key,
                } => {
                    edges.insert(
                        *node,
                        Edge {
                            parent: *new_parent,
                            order_key: order_key.clone(),
                            rank: op.sort_key(),
                        },
                    );
                }
                _ => {}
            }
        }

        break_cycles(&mut edges);

        for (node, edge) in &edges {
            let view = tree.nodes.entry(*node).or_default();
            view.parent = Some(edge.parent);
            view.order_key = Some(edge.order_key.clone());
            if !edge.parent.is_reserved() {
                tree.nodes.entry(edge.parent).or_default();
            }
        }
        for (node, edge) in &edges {
            tree.children_all.entry(edge.parent).or_default().push(*node);
        }
        for siblings in tree.children_all.values_mut() {
            siblings.sort();
        }

        // Last-writer-wins payload; insert with an initial payload counts as
        // a payload write.
        for op in ops.clone() {
            if op.node().is_reserved() {
                continue;
            }
            let (node, payload) = match &op.kind {
                OpKind::Insert {
                    node,
                    payload: Some(p),
                    ..
                } => (*node, Some(p.clone())),
                OpKind::Payload { node, payload } => (*node, payload.clone()),
                _ => continue,
            };
            let view = tree.nodes.entry(node).or_default();
            view.payload = payload;
            view.payload_writer = Some(OpRef::derive(doc_id, &op.replica(), op.counter()));
        }

        tree.apply_deletes(ops);

        // Live children index and cached counts.
        for (node, view) in &tree.nodes {
            if view.deleted {
                continue;
            }
            if let (Some(parent), Some(key)) = (view.parent, view.order_key.clone()) {
                if parent != NodeId::TRASH {
                    tree.children
                        .entry(parent)
                        .or_default()
                        .insert((key, *node));
                }
            }
        }
        let counts: Vec<(NodeId, u64)> = tree
            .children
            .iter()
            .map(|(p, c)| (*p, c.len() as u64))
            .collect();
        for (parent, count) in counts {
            if let Some(view) = tree.nodes.get_mut(&parent) {
                view.child_count = count;
            }
        }
        tree
    }

    /// Tombstones are absorbing; defensive deletes escalate to tombstones
    /// when the deleter missed a concurrent write to the subtree, otherwise
    /// they soft-delete and a later move reactivates the node.
    fn apply_deletes<'a>(&mut self, ops: impl Iterator<Item = &'a Op> + Clone) {
        let mut latest_delete: FnvHashMap<NodeId, (Rank, Option<VersionVector>)> =
            Default::default();
        let mut escalated: FnvHashSet<NodeId> = Default::default();
        let mut latest_move: FnvHashMap<NodeId, Rank> = Default::default();

        for op in ops.clone() {
            match &op.kind {
                OpKind::Tombstone { node } if !node.is_reserved() => {
                    escalated.insert(*node);
                }
                OpKind::Delete { node } if !node.is_reserved() => {
                    let known = op
                        .meta
                        .known_state
                        .as_deref()
                        .and_then(|ks| VersionVector::decode(ks).ok());
                    latest_delete.insert(*node, (op.sort_key(), known));
                }
                OpKind::Move { node, .. } if !node.is_reserved() => {
                    latest_move.insert(*node, op.sort_key());
                }
                _ => {}
            }
        }

        for (node, (rank, known)) in &latest_delete {
            if escalated.contains(node) {
                continue;
            }
            let subtree = self.subtree_set(*node);
            let covered = |id: &OpId| known.as_ref().map(|vv| vv.contains(id)).unwrap_or(false);
            let missed = ops.clone().any(|op| {
                op.sort_key() < *rank && op_writes_into(op, &subtree) && !covered(&op.meta.id)
            });
            if missed {
                escalated.insert(*node);
            }
        }

        for node in escalated {
            let view = self.nodes.entry(node).or_default();
            view.tombstoned = true;
            view.deleted = true;
        }
        for (node, (rank, _)) in latest_delete {
            let view = self.nodes.entry(node).or_default();
            if view.tombstoned {
                continue;
            }
            let reactivated = latest_move.get(&node).map(|m| *m > rank).unwrap_or(false);
            if !reactivated {
                view.deleted = true;
            }
        }
    }

    /// Ordered live children of `parent`.
    pub fn children(&self, parent: NodeId) -> Vec<NodeId> {
        self.children
            .get(&parent)
            .map(|c| c.iter().map(|(_, n)| *n).collect())
            .unwrap_or_default()
    }

    /// Keyset pagination: up to `limit` live children strictly greater than
    /// `cursor` under the `(order_key, node_id)` ordering.
    pub fn children_page(
        &self,
        parent: NodeId,
        cursor: Option<(OrderKey, NodeId)>,
        limit: usize,
    ) -> Vec<ChildRow> {
        let Some(children) = self.children.get(&parent) else {
            return Vec::new();
        };
        let iter: Box<dyn Iterator<Item = &(OrderKey, NodeId)>> = match cursor {
            Some(cursor) => Box::new(
                children
                    .range((std::ops::Bound::Excluded(cursor), std::ops::Bound::Unbounded)),
            ),
            None => Box::new(children.iter()),
        };
        iter.take(limit)
            .map(|(key, node)| ChildRow {
                node: *node,
                order_key: key.clone(),
            })
            .collect()
    }

    /// Every known node row, dead or alive, sorted by node id.
    pub fn dump(&self) -> Vec<TreeRow> {
        let mut rows: Vec<TreeRow> = self
            .nodes
            .iter()
            .map(|(node, view)| TreeRow {
                node: *node,
                parent: view.parent,
                order_key: view.order_key.clone(),
                tombstone: view.deleted,
            })
            .collect();
        rows.sort_by_key(|r| r.node);
        rows
    }

    /// Number of live attached nodes, reserved ids excluded.
    pub fn node_count(&self) -> u64 {
        self.nodes
            .values()
            .filter(|v| !v.deleted && matches!(v.parent, Some(p) if p != NodeId::TRASH))
            .count() as u64
    }

    pub fn node(&self, node: NodeId) -> Option<&NodeView> {
        self.nodes.get(&node)
    }

    /// Live parent of a node, if it is attached anywhere.
    pub fn parent(&self, node: NodeId) -> Option<NodeId> {
        self.nodes.get(&node).and_then(|v| v.parent)
    }

    pub fn payload(&self, node: NodeId) -> Option<&[u8]> {
        self.nodes.get(&node).and_then(|v| v.payload.as_deref())
    }

    pub fn payload_writer(&self, node: NodeId) -> Option<OpRef> {
        self.nodes.get(&node).and_then(|v| v.payload_writer)
    }

    /// One parent-chain step for the scope evaluator. Reserved ids are their
    /// own terminators.
    pub fn parent_link(&self, node: NodeId) -> ParentLink {
        if node.is_reserved() {
            return ParentLink::Known(node);
        }
        match self.nodes.get(&node) {
            Some(view) => match view.parent {
                Some(parent) => ParentLink::Known(parent),
                None => ParentLink::Unknown,
            },
            None => ParentLink::Unknown,
        }
    }

    /// The node and all its descendants, dead or alive.
    pub fn subtree_set(&self, root: NodeId) -> FnvHashSet<NodeId> {
        let mut set = FnvHashSet::default();
        let mut stack = vec![root];
        while let Some(node) = stack.pop() {
            if !set.insert(node) {
                continue;
            }
            if let Some(children) = self.children_all.get(&node) {
                stack.extend(children.iter().copied());
            }
        }
        set
    }

    /// Structural self-check: every live attached node is indexed under its
    /// parent exactly once, and no parent chain cycles. Used by tests and
    /// debug assertions; a violation is a bug in the build pass.
    pub fn validate(&self) -> anyhow::Result<()> {
        for (node, view) in &self.nodes {
            if node.is_reserved() {
                anyhow::bail!("reserved id {:?} has a node row", node);
            }
            if let Some(parent) = view.parent {
                if !view.deleted && parent != NodeId::TRASH {
                    let key = view
                        .order_key
                        .clone()
                        .ok_or_else(|| anyhow::anyhow!("attached {:?} has no order key", node))?;
                    let indexed = self
                        .children
                        .get(&parent)
                        .map(|c| c.contains(&(key, *node)))
                        .unwrap_or(false);
                    if !indexed {
                        anyhow::bail!("{:?} missing from children of {:?}", node, parent);
                    }
                }
                let mut seen = FnvHashSet::default();
                let mut cur = *node;
                while let Some(next) = self.parent(cur) {
                    if next.is_reserved() {
                        break;
                    }
                    if !seen.insert(next) {
                        anyhow::bail!("parent cycle through {:?}", next);
                    }
                    cur = next;
                }
            }
        }
        for (parent, children) in &self.children {
            for (_, child) in children {
                let attached = self.nodes.get(child).and_then(|v| v.parent) == Some(*parent);
                if !attached {
                    anyhow::bail!("stale child index entry {:?} under {:?}", child, parent);
                }
            }
        }
        Ok(())
    }

    /// Whether `node` lies in the subtree of `root` in the final view.
    pub fn in_subtree(&self, root: NodeId, node: NodeId) -> bool {
        if root == node {
            return true;
        }
        let mut seen = FnvHashSet::default();
        let mut cur = node;
        while seen.insert(cur) {
            match self.parent(cur) {
                Some(parent) if parent == root => return true,
                Some(parent) => cur = parent,
                None => return false,
            }
        }
        false
    }
}

/// Whether an op writes into the given subtree: it targets a member node or
/// attaches something under one.
pub(crate) fn op_writes_into(op: &Op, subtree: &FnvHashSet<NodeId>) -> bool {
    match &op.kind {
        OpKind::Insert { parent, node, .. } => subtree.contains(node) || subtree.contains(parent),
        OpKind::Move {
            node, new_parent, ..
        } => subtree.contains(node) || subtree.contains(new_parent),
        OpKind::Payload { node, .. } => subtree.contains(node),
        OpKind::Delete { .. } | OpKind::Tombstone { .. } => false,
    }
}

/// Breaks parent cycles deterministically: within each cycle the edge minted
/// by the lowest `(lamport, replica, counter)` loses and is redirected to
/// ROOT. The losing op stays in the log for reconciliation.
fn break_cycles(edges: &mut FnvHashMap<NodeId, Edge>) {
    loop {
        let mut nodes: Vec<NodeId> = edges.keys().copied().collect();
        nodes.sort();
        let mut fixed = false;
        let mut resolved: FnvHashSet<NodeId> = Default::default();
        for start in nodes {
            if resolved.contains(&start) {
                continue;
            }
            let mut path: Vec<NodeId> = Vec::new();
            let mut on_path: FnvHashSet<NodeId> = Default::default();
            let mut cur = start;
            loop {
                if cur.is_reserved() || resolved.contains(&cur) {
                    resolved.extend(path.iter().copied());
                    break;
                }
                if !on_path.insert(cur) {
                    // Found a cycle: everything from the first occurrence of
                    // `cur` onwards.
                    let at = path.iter().position(|n| *n == cur).unwrap_or(0);
                    let loser = path[at..]
                        .iter()
                        .min_by_key(|n| edges[*n].rank)
                        .copied()
                        .unwrap_or(cur);
                    if let Some(edge) = edges.get_mut(&loser) {
                        edge.parent = NodeId::ROOT;
                    }
                    fixed = true;
                    break;
                }
                path.push(cur);
                match edges.get(&cur) {
                    Some(edge) => cur = edge.parent,
                    None => {
                        resolved.extend(path.iter().copied());
                        break;
                    }
                }
            }
            if fixed {
                break;
            }
        }
        if !fixed {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::op::Op;
    use smallvec::smallvec;

    fn replica(b: u8) -> ReplicaId {
        ReplicaId::new([b; 32])
    }

    fn node(b: u8) -> NodeId {
        NodeId::new([b; 16])
    }

    fn key(d: u16) -> OrderKey {
        OrderKey::new(smallvec![d])
    }

    fn build(ops: &mut Vec<Op>) -> Tree {
        ops.sort_by_key(|op| op.sort_key());
        Tree::build("doc", ops.iter())
    }

    #[test]
    fn insert_orders_children() {
        let r = replica(1);
        let mut ops = vec![
            Op::insert(r, 1, 1, NodeId::ROOT, node(1), key(10), None),
            Op::insert(r, 2, 2, NodeId::ROOT, node(2), key(20), None),
            Op::insert(r, 3, 3, node(1), node(3), key(5), None),
        ];
        let tree = build(&mut ops);
        assert_eq!(tree.children(NodeId::ROOT), vec![node(1), node(2)]);
        assert_eq!(tree.children(node(1)), vec![node(3)]);
        assert_eq!(tree.parent(node(3)), Some(node(1)));
        assert_eq!(tree.node_count(), 3);
    }

    #[test]
    fn equal_keys_break_on_node_id() {
        let r = replica(1);
        let mut ops = vec![
            Op::insert(r, 1, 1, NodeId::ROOT, node(9), key(7), None),
            Op::insert(r, 2, 2, NodeId::ROOT, node(3), key(7), None),
        ];
        let tree = build(&mut ops);
        assert_eq!(tree.children(NodeId::ROOT), vec![node(3), node(9)]);
    }

    #[test]
    fn highest_rank_move_wins() {
        let r1 = replica(1);
        let r2 = replica(2);
        let mut ops = vec![
            Op::insert(r1, 1, 1, NodeId::ROOT, node(1), key(10), None),
            Op::insert(r1, 2, 2, NodeId::ROOT, node(2), key(20), None),
            Op::insert(r1, 3, 3, NodeId::ROOT, node(3), key(30), None),
            // Concurrent moves of node 3: same lamport, r2 wins the tie.
            Op::move_node(r1, 4, 4, node(3), node(1), key(1)),
            Op::move_node(r2, 1, 4, node(3), node(2), key(1)),
        ];
        let tree = build(&mut ops);
        assert_eq!(tree.parent(node(3)), Some(node(2)));
        assert_eq!(tree.children(node(1)), Vec::<NodeId>::new());
    }

    #[test]
    fn concurrent_moves_cannot_cycle() {
        let r1 = replica(1);
        let r2 = replica(2);
        let mut ops = vec![
            Op::insert(r1, 1, 1, NodeId::ROOT, node(1), key(10), None),
            Op::insert(r1, 2, 2, NodeId::ROOT, node(2), key(20), None),
            // a under b and b under a, concurrently.
            Op::move_node(r1, 3, 3, node(1), node(2), key(1)),
            Op::move_node(r2, 1, 3, node(2), node(1), key(1)),
        ];
        let tree = build(&mut ops);
        // r1's move has the lower rank and loses: node 1 falls back to ROOT.
        assert_eq!(tree.parent(node(1)), Some(NodeId::ROOT));
        assert_eq!(tree.parent(node(2)), Some(node(1)));
        assert!(tree.in_subtree(NodeId::ROOT, node(2)));
        tree.validate().unwrap();
    }

    #[test]
    fn payload_is_last_writer_wins() {
        let r1 = replica(1);
        let r2 = replica(2);
        let mut ops = vec![
            Op::insert(r1, 1, 1, NodeId::ROOT, node(1), key(10), Some(vec![1])),
            Op::payload(r1, 2, 2, node(1), Some(vec![0x61])),
            Op::payload(r2, 1, 2, node(1), Some(vec![0x62])),
        ];
        let tree = build(&mut ops);
        // Equal lamport: the bytewise larger replica id wins.
        assert_eq!(tree.payload(node(1)), Some(&[0x62][..]));
        assert_eq!(
            tree.payload_writer(node(1)),
            Some(OpRef::derive("doc", &r2, 1))
        );
    }

    #[test]
    fn payload_before_insert_is_retained() {
        let r = replica(1);
        let mut ops = vec![Op::payload(r, 5, 5, node(1), Some(vec![7]))];
        let tree = build(&mut ops);
        assert_eq!(tree.payload(node(1)), Some(&[7][..]));
        assert_eq!(tree.parent_link(node(1)), ParentLink::Unknown);
        assert_eq!(tree.node_count(), 0);
        // Once the insert arrives the node is attached and keeps the payload.
        let mut ops = vec![
            Op::payload(r, 5, 5, node(1), Some(vec![7])),
            Op::insert(r, 6, 6, NodeId::ROOT, node(1), key(10), None),
        ];
        let tree = build(&mut ops);
        assert_eq!(tree.parent(node(1)), Some(NodeId::ROOT));
        assert_eq!(tree.payload(node(1)), Some(&[7][..]));
        assert_eq!(tree.node_count(), 1);
    }

    #[test]
    fn tombstone_is_absorbing() {
        let r = replica(1);
        let mut ops = vec![
            Op::insert(r, 1, 1, NodeId::ROOT, node(1), key(10), None),
            Op::tombstone(r, 2, 2, node(1)),
            // A later move does not revive a tombstoned node.
            Op::move_node(r, 3, 3, node(1), NodeId::ROOT, key(5)),
        ];
        let tree = build(&mut ops);
        let view = tree.node(node(1)).unwrap();
        assert!(view.tombstoned && view.deleted);
        assert_eq!(tree.children(NodeId::ROOT), Vec::<NodeId>::new());
    }

    #[test]
    fn covered_delete_is_soft_and_move_reactivates() {
        let r = replica(1);
        let insert = Op::insert(r, 1, 1, NodeId::ROOT, node(1), key(10), None);
        let known = {
            let mut vv = VersionVector::new();
            vv.observe(r, 1);
            vv.encode()
        };
        let mut ops = vec![
            insert.clone(),
            Op::delete(r, 2, 2, node(1), Some(known.clone())),
        ];
        let tree = build(&mut ops);
        let view = tree.node(node(1)).unwrap();
        assert!(view.deleted && !view.tombstoned);

        let mut ops = vec![
            insert,
            Op::delete(r, 2, 2, node(1), Some(known)),
            Op::move_node(r, 3, 3, node(1), NodeId::ROOT, key(4)),
        ];
        let tree = build(&mut ops);
        let view = tree.node(node(1)).unwrap();
        assert!(!view.deleted);
        assert_eq!(tree.children(NodeId::ROOT), vec![node(1)]);
    }

    #[test]
    fn uncovered_concurrent_write_escalates_delete() {
        let r1 = replica(1);
        let r2 = replica(2);
        let insert = Op::insert(r1, 1, 1, NodeId::ROOT, node(1), key(10), None);
        let known = {
            let mut vv = VersionVector::new();
            vv.observe(r1, 1);
            vv.encode()
        };
        let mut ops = vec![
            insert,
            // r2 writes into the subtree concurrently, before the delete in
            // canonical order and not covered by its snapshot.
            Op::insert(r2, 1, 2, node(1), node(2), key(5), None),
            Op::delete(r1, 2, 3, node(1), Some(known)),
            // The later move would reactivate a soft delete; not a tombstone.
            Op::move_node(r1, 3, 4, node(1), NodeId::ROOT, key(4)),
        ];
        let tree = build(&mut ops);
        let view = tree.node(node(1)).unwrap();
        assert!(view.tombstoned && view.deleted);
        // The concurrently inserted child stays attached to the dead parent.
        assert_eq!(tree.parent(node(2)), Some(node(1)));
        assert!(!tree.node(node(2)).unwrap().deleted);
    }

    #[test]
    fn children_page_walks_cursor() {
        let r = replica(1);
        let mut ops: Vec<Op> = (0u8..5)
            .map(|i| {
                Op::insert(
                    r,
                    (i + 1) as u64,
                    (i + 1) as u64,
                    NodeId::ROOT,
                    node(i + 1),
                    key((i as u16 + 1) * 10),
                    None,
                )
            })
            .collect();
        let tree = build(&mut ops);
        let first = tree.children_page(NodeId::ROOT, None, 2);
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].node, node(1));
        let cursor = Some((first[1].order_key.clone(), first[1].node));
        let rest = tree.children_page(NodeId::ROOT, cursor, 10);
        assert_eq!(
            rest.iter().map(|r| r.node).collect::<Vec<_>>(),
            vec![node(3), node(4), node(5)]
        );
    }

    #[test]
    fn dump_includes_dead_rows() {
        let r = replica(1);
        let mut ops = vec![
            Op::insert(r, 1, 1, NodeId::ROOT, node(1), key(10), None),
            Op::tombstone(r, 2, 2, node(1)),
        ];
        let tree = build(&mut ops);
        let rows = tree.dump();
        assert_eq!(rows.len(), 1);
        assert!(rows[0].tombstone);
        assert_eq!(rows[0].parent, Some(NodeId::ROOT));
    }
}
