//! The per-document engine: log, materialized tree, pending sidecar and
//! authorization, behind one mutating surface.
//!
//! The engine is synchronous; callers serialize mutations through their own
//! apply queue (see the session layer). After every apply batch the tree is
//! recomputed from the sorted log, so readers always see a state that equals
//! the pure function of the op set.
use crate::acl::{Authorizer, Policy, Verdict};
use crate::clock::VersionVector;
use crate::crypto::{Keypair, Proof, SignedOp};
use crate::id::{Lamport, NodeId, ReplicaId};
use crate::op::{Op, OpKind};
use crate::opref::OpRef;
use crate::order_key::OrderKey;
use crate::store::{Filter, OpLog, PendingEntry, PendingStore};
use crate::token::TokenRef;
use crate::tree::{op_writes_into, ChildRow, Tree, TreeRow};
use anyhow::{anyhow, bail, Result};
use fnv::FnvHashMap;
use futures::channel::mpsc;
use std::collections::BTreeSet;

/// Where a local insert or move lands among its new siblings.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Placement {
    First,
    Last,
    After(NodeId),
}

#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub policy: Policy,
    pub max_payload_bytes: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            policy: Policy::Open,
            max_payload_bytes: 1024 * 1024,
        }
    }
}

/// Why an op was rejected.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ApplyErrorKind {
    Malformed,
    BadSignature,
    Denied,
}

/// Per-op failure inside an apply batch. One bad op does not stop the rest.
#[derive(Clone, Debug)]
pub struct ApplyError {
    pub opref: OpRef,
    pub kind: ApplyErrorKind,
    pub error: String,
}

/// What an apply batch did.
#[derive(Debug, Default)]
pub struct ApplyReport {
    pub applied: Vec<OpRef>,
    pub pending: Vec<OpRef>,
    pub errors: Vec<ApplyError>,
}

pub struct Engine {
    log: OpLog,
    tree: Tree,
    pending: PendingStore,
    authorizer: Authorizer,
    config: EngineConfig,
    listeners: Vec<mpsc::UnboundedSender<Vec<SignedOp>>>,
}

impl Engine {
    pub fn new(doc_id: impl Into<String>, config: EngineConfig) -> Self {
        let doc_id = doc_id.into();
        Self {
            log: OpLog::new(doc_id.clone()),
            tree: Tree::default(),
            pending: PendingStore::default(),
            authorizer: Authorizer::new(doc_id, config.policy.clone()),
            config,
            listeners: Vec::new(),
        }
    }

    pub fn doc_id(&self) -> &str {
        self.log.doc_id()
    }

    pub fn max_lamport(&self) -> Lamport {
        self.log.head_lamport()
    }

    pub fn head_lamport(&self) -> Lamport {
        self.log.head_lamport()
    }

    pub fn replica_max_counter(&self, replica: &ReplicaId) -> u64 {
        self.log.max_counter(replica)
    }

    pub fn max_payload_bytes(&self) -> usize {
        self.config.max_payload_bytes
    }

    /// Registers a capability token for this document.
    pub fn add_token(&mut self, bytes: &[u8]) -> Result<TokenRef> {
        self.authorizer.add_token(bytes)
    }

    /// Token envelopes to announce in a hello.
    pub fn token_bytes(&self) -> Vec<Vec<u8>> {
        self.authorizer.tokens().map(|t| t.bytes.clone()).collect()
    }

    /// Streams the signed ops of every future apply batch.
    pub fn subscribe_applies(&mut self) -> mpsc::UnboundedReceiver<Vec<SignedOp>> {
        let (tx, rx) = mpsc::unbounded();
        self.listeners.push(tx);
        rx
    }

    /// Set of oprefs matching a filter.
    ///
    /// The children filter covers every op whose effect touches that parent:
    /// inserts under it, moves in and out of it, payload/delete/tombstone
    /// ops on current children, and the parent's own latest payload writer.
    pub fn list_op_refs(&self, filter: &Filter) -> BTreeSet<OpRef> {
        match filter {
            Filter::All => self.log.refs().collect(),
            Filter::Children(parent) => {
                let mut refs = BTreeSet::new();
                let mut cur_parent: FnvHashMap<NodeId, NodeId> = Default::default();
                for signed in self.log.iter() {
                    let opref = self.log.opref(signed);
                    match &signed.op.kind {
                        OpKind::Insert { parent: p, node, .. } => {
                            if p == parent {
                                refs.insert(opref);
                            }
                            cur_parent.insert(*node, *p);
                        }
                        OpKind::Move {
                            node, new_parent, ..
                        } => {
                            if new_parent == parent
                                || cur_parent.get(node) == Some(parent)
                            {
                                refs.insert(opref);
                            }
                            cur_parent.insert(*node, *new_parent);
                        }
                        OpKind::Payload { node, .. }
                        | OpKind::Delete { node }
                        | OpKind::Tombstone { node } => {
                            if self.tree.parent(*node) == Some(*parent) {
                                refs.insert(opref);
                            }
                        }
                    }
                }
                // Lets a subtree-scoped peer render the scope root's label.
                if let Some(writer) = self.tree.payload_writer(*parent) {
                    if self.log.contains(&writer) {
                        refs.insert(writer);
                    }
                }
                refs
            }
        }
    }

    /// Ops in caller order; error on any unknown ref.
    pub fn get_ops_by_op_refs(&self, refs: &[OpRef]) -> Result<Vec<SignedOp>> {
        self.log.get_many(refs)
    }

    /// Ops with `lamport > since`, optionally restricted to a subtree, in
    /// canonical order.
    pub fn ops_since(&self, since: Lamport, root: Option<NodeId>) -> Vec<SignedOp> {
        self.log
            .iter()
            .filter(|signed| signed.op.lamport() > since)
            .filter(|signed| match root {
                Some(root) => self.tree.in_subtree(root, signed.op.node()),
                None => true,
            })
            .cloned()
            .collect()
    }

    /// Filter-scoped ops newer than `since`, in canonical order. Drives
    /// subscription flushes.
    pub fn ops_for_filter_since(&self, filter: &Filter, since: Lamport) -> Vec<SignedOp> {
        let refs = self.list_op_refs(filter);
        self.log
            .iter()
            .filter(|signed| signed.op.lamport() > since)
            .filter(|signed| refs.contains(&self.log.opref(signed)))
            .cloned()
            .collect()
    }

    pub fn tree_children(&self, parent: NodeId) -> Vec<NodeId> {
        self.tree.children(parent)
    }

    pub fn tree_children_page(
        &self,
        parent: NodeId,
        cursor: Option<(OrderKey, NodeId)>,
        limit: usize,
    ) -> Vec<ChildRow> {
        self.tree.children_page(parent, cursor, limit)
    }

    pub fn tree_dump(&self) -> Vec<TreeRow> {
        self.tree.dump()
    }

    pub fn tree_node_count(&self) -> u64 {
        self.tree.node_count()
    }

    pub fn tree(&self) -> &Tree {
        &self.tree
    }

    /// Applies a batch in any order. Idempotent; per-op failures do not stop
    /// the batch. The materialized view reflects the batch on return.
    pub fn apply_ops(&mut self, ops: Vec<SignedOp>) -> ApplyReport {
        let mut report = ApplyReport::default();
        let mut batch = ops;
        batch.sort_by_key(|signed| signed.op.sort_key());

        let mut applied: Vec<SignedOp> = Vec::new();
        for signed in batch {
            let opref = self.log.opref(&signed);
            if self.log.contains(&opref) {
                continue;
            }
            match self.admit(&signed, opref, &mut report) {
                Ok(true) => applied.push(signed),
                Ok(false) => {}
                Err(err) => report.errors.push(err),
            }
        }

        if !applied.is_empty() {
            self.rebuild();
            self.reprocess_pending(&mut report, &mut applied);
        }
        if !applied.is_empty() {
            self.notify(applied);
        }
        report
    }

    /// Validates, verifies and authorizes one op, then routes it to the log,
    /// the sidecar or the error list. `Ok(true)` means it reached the log.
    fn admit(
        &mut self,
        signed: &SignedOp,
        opref: OpRef,
        report: &mut ApplyReport,
    ) -> std::result::Result<bool, ApplyError> {
        if let Err(err) = signed.op.validate(self.config.max_payload_bytes) {
            return Err(ApplyError {
                opref,
                kind: ApplyErrorKind::Malformed,
                error: err.to_string(),
            });
        }
        if let Err(err) = signed.verify(self.doc_id()) {
            return Err(ApplyError {
                opref,
                kind: ApplyErrorKind::BadSignature,
                error: err.to_string(),
            });
        }
        self.authorizer.admit_proof(signed);
        match self.authorizer.authorize(&self.tree, signed) {
            Verdict::Allow => {
                self.log.append(signed.clone());
                self.pending.remove(&opref);
                report.applied.push(opref);
                Ok(true)
            }
            Verdict::Deny(reason) => {
                tracing::debug!("op {} denied: {}", opref, reason);
                Err(ApplyError {
                    opref,
                    kind: ApplyErrorKind::Denied,
                    error: reason,
                })
            }
            Verdict::Unknown(reason) => {
                tracing::debug!("op {} pending: {}", opref, reason);
                self.pending.upsert(
                    opref,
                    PendingEntry {
                        signed: signed.clone(),
                        reason,
                        message: None,
                    },
                );
                report.pending.push(opref);
                Ok(false)
            }
        }
    }

    /// Re-runs authorization for every parked op until a fixpoint: applied
    /// context can complete the parent chains pending ops are waiting on.
    fn reprocess_pending(&mut self, report: &mut ApplyReport, applied: &mut Vec<SignedOp>) {
        loop {
            let mut progressed = false;
            for opref in self.pending.refs() {
                let Some(entry) = self.pending.remove(&opref) else {
                    continue;
                };
                match self.authorizer.authorize(&self.tree, &entry.signed) {
                    Verdict::Allow => {
                        self.log.append(entry.signed.clone());
                        report.applied.push(opref);
                        report.pending.retain(|r| r != &opref);
                        applied.push(entry.signed);
                        progressed = true;
                    }
                    Verdict::Deny(reason) => {
                        report.pending.retain(|r| r != &opref);
                        report.errors.push(ApplyError {
                            opref,
                            kind: ApplyErrorKind::Denied,
                            error: reason,
                        });
                        progressed = true;
                    }
                    Verdict::Unknown(_) => {
                        self.pending.upsert(opref, entry);
                    }
                }
            }
            if !progressed {
                break;
            }
            self.rebuild();
        }
    }

    /// Parks ops whose authorization could not be decided yet.
    pub fn store_pending_ops(
        &mut self,
        ops: Vec<SignedOp>,
        reason: &str,
        message: Option<String>,
    ) {
        for signed in ops {
            let opref = self.log.opref(&signed);
            if self.log.contains(&opref) {
                continue;
            }
            self.pending.upsert(
                opref,
                PendingEntry {
                    signed,
                    reason: reason.into(),
                    message: message.clone(),
                },
            );
        }
    }

    pub fn list_pending_ops(&self) -> Vec<PendingEntry> {
        self.pending.list()
    }

    pub fn list_pending_op_refs(&self) -> Vec<OpRef> {
        self.pending.refs()
    }

    pub fn delete_pending_ops(&mut self, ops: &[SignedOp]) {
        for signed in ops {
            let opref = self.log.opref(signed);
            self.pending.remove(&opref);
        }
    }

    /// Mints, signs and applies a local insert.
    pub fn local_insert(
        &mut self,
        key: Keypair,
        parent: NodeId,
        node: NodeId,
        placement: Placement,
        payload: Option<Vec<u8>>,
    ) -> Result<SignedOp> {
        let (replica, counter, lamport) = self.mint_meta(key);
        let order_key = self.place(parent, placement, replica, counter)?;
        let op = Op::insert(replica, counter, lamport, parent, node, order_key, payload);
        self.commit_local(key, op)
    }

    /// Mints, signs and applies a local move.
    pub fn local_move(
        &mut self,
        key: Keypair,
        node: NodeId,
        new_parent: NodeId,
        placement: Placement,
    ) -> Result<SignedOp> {
        let (replica, counter, lamport) = self.mint_meta(key);
        let order_key = self.place(new_parent, placement, replica, counter)?;
        let op = Op::move_node(replica, counter, lamport, node, new_parent, order_key);
        self.commit_local(key, op)
    }

    /// Mints, signs and applies a local payload write.
    pub fn local_payload(
        &mut self,
        key: Keypair,
        node: NodeId,
        payload: Option<Vec<u8>>,
    ) -> Result<SignedOp> {
        let (replica, counter, lamport) = self.mint_meta(key);
        let op = Op::payload(replica, counter, lamport, node, payload);
        self.commit_local(key, op)
    }

    /// Mints, signs and applies a local defensive delete. The known-state
    /// snapshot covers every op currently touching the subtree.
    pub fn local_delete(&mut self, key: Keypair, node: NodeId) -> Result<SignedOp> {
        let (replica, counter, lamport) = self.mint_meta(key);
        let known_state = self.subtree_version(node).encode();
        let op = Op::delete(replica, counter, lamport, node, Some(known_state));
        self.commit_local(key, op)
    }

    /// Mints, signs and applies a local tombstone.
    pub fn local_tombstone(&mut self, key: Keypair, node: NodeId) -> Result<SignedOp> {
        let (replica, counter, lamport) = self.mint_meta(key);
        let op = Op::tombstone(replica, counter, lamport, node);
        self.commit_local(key, op)
    }

    fn mint_meta(&self, key: Keypair) -> (ReplicaId, u64, Lamport) {
        let replica = key.replica_id();
        let counter = self.log.max_counter(&replica) + 1;
        let lamport = self.log.head_lamport() + 1;
        (replica, counter, lamport)
    }

    fn commit_local(&mut self, key: Keypair, op: Op) -> Result<SignedOp> {
        let signed = SignedOp::sign(key, self.doc_id(), op, Proof::None)?;
        let opref = self.log.opref(&signed);
        let report = self.apply_ops(vec![signed.clone()]);
        if let Some(err) = report.errors.iter().find(|e| e.opref == opref) {
            bail!("local op rejected: {}", err.error);
        }
        if report.pending.contains(&opref) {
            bail!("local op lacks authorization context");
        }
        Ok(signed)
    }

    fn place(
        &self,
        parent: NodeId,
        placement: Placement,
        replica: ReplicaId,
        counter: u64,
    ) -> Result<OrderKey> {
        let siblings = self.tree.children_page(parent, None, usize::MAX);
        let (left, right) = match placement {
            Placement::First => (None, siblings.first()),
            Placement::Last => (siblings.last(), None),
            Placement::After(sibling) => {
                let at = siblings
                    .iter()
                    .position(|row| row.node == sibling)
                    .ok_or_else(|| {
                        anyhow!("{:?} is not a child of {:?}", sibling, parent)
                    })?;
                (siblings.get(at), siblings.get(at + 1))
            }
        };
        let mut seed = Vec::with_capacity(40);
        seed.extend_from_slice(replica.as_bytes());
        seed.extend_from_slice(&counter.to_be_bytes());
        OrderKey::allocate_between(
            left.map(|row| &row.order_key),
            right.map(|row| &row.order_key),
            &seed,
        )
    }

    /// Version vector over every op touching the subtree of `node`.
    fn subtree_version(&self, node: NodeId) -> VersionVector {
        let subtree = self.tree.subtree_set(node);
        let mut vv = VersionVector::new();
        for signed in self.log.iter() {
            let op = &signed.op;
            if subtree.contains(&op.node()) || op_writes_into(op, &subtree) {
                vv.observe(op.replica(), op.counter());
            }
        }
        vv
    }

    fn rebuild(&mut self) {
        let tree = Tree::build(self.doc_id(), self.log.iter().map(|s| &s.op));
        self.tree = tree;
    }

    fn notify(&mut self, applied: Vec<SignedOp>) {
        self.listeners
            .retain(|tx| tx.unbounded_send(applied.clone()).is_ok());
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("doc_id", &self.doc_id())
            .field("ops", &self.log.len())
            .field("pending", &self.pending.len())
            .field("nodes", &self.tree_node_count())
            .finish_non_exhaustive()
    }
}
