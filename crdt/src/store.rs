use crate::crypto::SignedOp;
use crate::id::{Lamport, NodeId, ReplicaId};
use crate::opref::OpRef;
use anyhow::{bail, Result};
use bytecheck::CheckBytes;
use rkyv::{Archive, Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// The unit of sync: the whole document, or the children of one parent.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Archive, Deserialize, Serialize)]
#[archive_attr(derive(CheckBytes))]
#[repr(C)]
pub enum Filter {
    All,
    Children(NodeId),
}

/// Append-only, deduplicated log of signed operations, indexed in canonical
/// `(lamport, replica, counter)` order.
#[derive(Debug)]
pub struct OpLog {
    doc_id: String,
    ops: BTreeMap<OpRef, SignedOp>,
    order: BTreeSet<(Lamport, ReplicaId, u64, OpRef)>,
    max_counter: BTreeMap<ReplicaId, u64>,
    head_lamport: Lamport,
}

impl OpLog {
    pub fn new(doc_id: impl Into<String>) -> Self {
        Self {
            doc_id: doc_id.into(),
            ops: Default::default(),
            order: Default::default(),
            max_counter: Default::default(),
            head_lamport: 0,
        }
    }

    pub fn doc_id(&self) -> &str {
        &self.doc_id
    }

    pub fn opref(&self, signed: &SignedOp) -> OpRef {
        OpRef::derive(&self.doc_id, &signed.op.replica(), signed.op.counter())
    }

    pub fn contains(&self, opref: &OpRef) -> bool {
        self.ops.contains_key(opref)
    }

    /// Inserts an op; duplicates collapse and are not an error.
    /// Returns the opref and whether the op was new.
    pub fn append(&mut self, signed: SignedOp) -> (OpRef, bool) {
        let opref = self.opref(&signed);
        if self.ops.contains_key(&opref) {
            return (opref, false);
        }
        let (lamport, replica, counter) = signed.op.sort_key();
        self.order.insert((lamport, replica, counter, opref));
        let max = self.max_counter.entry(replica).or_default();
        if counter > *max {
            *max = counter;
        }
        if lamport > self.head_lamport {
            self.head_lamport = lamport;
        }
        self.ops.insert(opref, signed);
        (opref, true)
    }

    pub fn get(&self, opref: &OpRef) -> Option<&SignedOp> {
        self.ops.get(opref)
    }

    /// Ops in caller order; fails on the first unknown ref.
    pub fn get_many(&self, refs: &[OpRef]) -> Result<Vec<SignedOp>> {
        let mut out = Vec::with_capacity(refs.len());
        for opref in refs {
            match self.ops.get(opref) {
                Some(signed) => out.push(signed.clone()),
                None => bail!("unknown opref {}", opref),
            }
        }
        Ok(out)
    }

    /// All ops in canonical order.
    pub fn iter(&self) -> impl Iterator<Item = &SignedOp> + Clone {
        self.order
            .iter()
            .filter_map(move |(.., opref)| self.ops.get(opref))
    }

    /// All oprefs in canonical order.
    pub fn refs(&self) -> impl Iterator<Item = OpRef> + '_ {
        self.order.iter().map(|(.., opref)| *opref)
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn head_lamport(&self) -> Lamport {
        self.head_lamport
    }

    pub fn max_counter(&self, replica: &ReplicaId) -> u64 {
        self.max_counter.get(replica).copied().unwrap_or_default()
    }
}

/// A deferred operation and why it is parked.
#[derive(Clone, Debug)]
pub struct PendingEntry {
    pub signed: SignedOp,
    pub reason: String,
    pub message: Option<String>,
}

/// Sidecar for ops whose authorization is currently `unknown`. Never
/// exposed through the tree view.
#[derive(Debug, Default)]
pub struct PendingStore {
    entries: BTreeMap<OpRef, PendingEntry>,
}

impl PendingStore {
    pub fn upsert(&mut self, opref: OpRef, entry: PendingEntry) {
        self.entries.insert(opref, entry);
    }

    pub fn remove(&mut self, opref: &OpRef) -> Option<PendingEntry> {
        self.entries.remove(opref)
    }

    pub fn list(&self) -> Vec<PendingEntry> {
        self.entries.values().cloned().collect()
    }

    pub fn refs(&self) -> Vec<OpRef> {
        self.entries.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Proof;
    use crate::id::{NodeId, OpId};
    use crate::op::Op;

    fn replica(b: u8) -> ReplicaId {
        ReplicaId::new([b; 32])
    }

    fn unsigned(op: Op) -> SignedOp {
        SignedOp {
            op,
            sig: [0; 64],
            proof: Proof::None,
        }
    }

    fn tombstone(r: ReplicaId, counter: u64, lamport: Lamport) -> SignedOp {
        unsigned(Op::tombstone(r, counter, lamport, NodeId::new([1; 16])))
    }

    #[test]
    fn append_deduplicates() {
        let mut log = OpLog::new("doc");
        let op = tombstone(replica(1), 1, 1);
        let (r1, fresh) = log.append(op.clone());
        assert!(fresh);
        let (r2, fresh) = log.append(op);
        assert!(!fresh);
        assert_eq!(r1, r2);
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn canonical_order_breaks_lamport_ties_on_replica() {
        let mut log = OpLog::new("doc");
        let z = replica(b'z');
        let a = replica(b'a');
        log.append(tombstone(z, 1, 5));
        log.append(tombstone(a, 2, 5));
        log.append(tombstone(a, 1, 5));
        let ids: Vec<OpId> = log.iter().map(|s| s.op.meta.id).collect();
        assert_eq!(
            ids,
            vec![OpId::new(a, 1), OpId::new(a, 2), OpId::new(z, 1)]
        );
    }

    #[test]
    fn get_many_preserves_order_and_fails_on_unknown() {
        let mut log = OpLog::new("doc");
        let (r1, _) = log.append(tombstone(replica(1), 1, 1));
        let (r2, _) = log.append(tombstone(replica(1), 2, 2));
        let got = log.get_many(&[r2, r1]).unwrap();
        assert_eq!(got[0].op.counter(), 2);
        assert_eq!(got[1].op.counter(), 1);
        assert!(log.get_many(&[OpRef::new([9; 16])]).is_err());
    }

    #[test]
    fn counters_and_head_lamport_track_appends() {
        let mut log = OpLog::new("doc");
        log.append(tombstone(replica(1), 3, 7));
        log.append(tombstone(replica(1), 1, 9));
        assert_eq!(log.head_lamport(), 9);
        assert_eq!(log.max_counter(&replica(1)), 3);
        assert_eq!(log.max_counter(&replica(2)), 0);
    }

    #[test]
    fn pending_store_upserts_by_ref() {
        let mut pending = PendingStore::default();
        let signed = tombstone(replica(1), 1, 1);
        let opref = OpRef::new([1; 16]);
        pending.upsert(
            opref,
            PendingEntry {
                signed: signed.clone(),
                reason: "missing_context".into(),
                message: None,
            },
        );
        pending.upsert(
            opref,
            PendingEntry {
                signed,
                reason: "missing_context".into(),
                message: Some("again".into()),
            },
        );
        assert_eq!(pending.len(), 1);
        assert_eq!(pending.refs(), vec![opref]);
        assert!(pending.remove(&opref).is_some());
        assert!(pending.is_empty());
    }
}
