use crate::id::{Lamport, NodeId, OpId, ReplicaId};
use crate::order_key::OrderKey;
use anyhow::{bail, Result};
use bytecheck::CheckBytes;
use rkyv::{Archive, Deserialize, Serialize};

const SIG_DOMAIN: &[u8] = b"treecrdt/op-sig/v1";
const SIG_VERSION: u8 = 0;

const TAG_INSERT: u8 = 1;
const TAG_MOVE: u8 = 2;
const TAG_DELETE: u8 = 3;
const TAG_TOMBSTONE: u8 = 4;
const TAG_PAYLOAD: u8 = 5;

/// Metadata that accompanies every operation.
///
/// `known_state` is an opaque version-vector snapshot (see
/// [`crate::VersionVector`] for the byte layout) and is only meaningful on
/// `Delete` operations.
#[derive(Clone, Debug, Eq, PartialEq, Archive, Deserialize, Serialize)]
#[archive_attr(derive(CheckBytes))]
#[repr(C)]
pub struct OpMeta {
    pub id: OpId,
    pub lamport: Lamport,
    pub known_state: Option<Vec<u8>>,
}

/// The tree mutations.
#[derive(Clone, Debug, Eq, PartialEq, Archive, Deserialize, Serialize)]
#[archive_attr(derive(CheckBytes))]
#[repr(C)]
pub enum OpKind {
    Insert {
        parent: NodeId,
        node: NodeId,
        order_key: OrderKey,
        payload: Option<Vec<u8>>,
    },
    Move {
        node: NodeId,
        new_parent: NodeId,
        order_key: OrderKey,
    },
    Payload {
        node: NodeId,
        payload: Option<Vec<u8>>,
    },
    Delete {
        node: NodeId,
    },
    Tombstone {
        node: NodeId,
    },
}

/// Full operation envelope.
#[derive(Clone, Debug, Eq, PartialEq, Archive, Deserialize, Serialize)]
#[archive_attr(derive(CheckBytes))]
#[repr(C)]
pub struct Op {
    pub meta: OpMeta,
    pub kind: OpKind,
}

impl Op {
    pub fn insert(
        replica: ReplicaId,
        counter: u64,
        lamport: Lamport,
        parent: NodeId,
        node: NodeId,
        order_key: OrderKey,
        payload: Option<Vec<u8>>,
    ) -> Self {
        Self {
            meta: OpMeta {
                id: OpId::new(replica, counter),
                lamport,
                known_state: None,
            },
            kind: OpKind::Insert {
                parent,
                node,
                order_key,
                payload,
            },
        }
    }

    pub fn move_node(
        replica: ReplicaId,
        counter: u64,
        lamport: Lamport,
        node: NodeId,
        new_parent: NodeId,
        order_key: OrderKey,
    ) -> Self {
        Self {
            meta: OpMeta {
                id: OpId::new(replica, counter),
                lamport,
                known_state: None,
            },
            kind: OpKind::Move {
                node,
                new_parent,
                order_key,
            },
        }
    }

    pub fn payload(
        replica: ReplicaId,
        counter: u64,
        lamport: Lamport,
        node: NodeId,
        payload: Option<Vec<u8>>,
    ) -> Self {
        Self {
            meta: OpMeta {
                id: OpId::new(replica, counter),
                lamport,
                known_state: None,
            },
            kind: OpKind::Payload { node, payload },
        }
    }

    pub fn delete(
        replica: ReplicaId,
        counter: u64,
        lamport: Lamport,
        node: NodeId,
        known_state: Option<Vec<u8>>,
    ) -> Self {
        Self {
            meta: OpMeta {
                id: OpId::new(replica, counter),
                lamport,
                known_state,
            },
            kind: OpKind::Delete { node },
        }
    }

    pub fn tombstone(replica: ReplicaId, counter: u64, lamport: Lamport, node: NodeId) -> Self {
        Self {
            meta: OpMeta {
                id: OpId::new(replica, counter),
                lamport,
                known_state: None,
            },
            kind: OpKind::Tombstone { node },
        }
    }

    /// The node this operation acts on.
    pub fn node(&self) -> NodeId {
        match &self.kind {
            OpKind::Insert { node, .. }
            | OpKind::Move { node, .. }
            | OpKind::Payload { node, .. }
            | OpKind::Delete { node }
            | OpKind::Tombstone { node } => *node,
        }
    }

    pub fn replica(&self) -> ReplicaId {
        self.meta.id.replica
    }

    pub fn counter(&self) -> u64 {
        self.meta.id.counter
    }

    pub fn lamport(&self) -> Lamport {
        self.meta.lamport
    }

    /// Canonical total order: `(lamport, replica, counter)` ascending,
    /// replica ties broken bytewise on the 32-byte key.
    pub fn sort_key(&self) -> (Lamport, ReplicaId, u64) {
        (self.meta.lamport, self.meta.id.replica, self.meta.id.counter)
    }

    fn kind_tag(&self) -> u8 {
        match &self.kind {
            OpKind::Insert { .. } => TAG_INSERT,
            OpKind::Move { .. } => TAG_MOVE,
            OpKind::Delete { .. } => TAG_DELETE,
            OpKind::Tombstone { .. } => TAG_TOMBSTONE,
            OpKind::Payload { .. } => TAG_PAYLOAD,
        }
    }

    /// Structural validity, independent of any tree state. Malformed
    /// operations are reported synchronously and never logged.
    pub fn validate(&self, max_payload: usize) -> Result<()> {
        if self.node().is_reserved() {
            bail!("op targets reserved node {:?}", self.node());
        }
        if !matches!(self.kind, OpKind::Delete { .. }) && self.meta.known_state.is_some() {
            bail!("known_state is only valid on delete");
        }
        match &self.kind {
            OpKind::Insert {
                parent,
                node,
                order_key,
                payload,
            } => {
                if parent == node {
                    bail!("insert under itself");
                }
                if *parent == NodeId::TRASH {
                    bail!("insert under TRASH");
                }
                if order_key.digits().is_empty() {
                    bail!("empty order key");
                }
                if let Some(p) = payload {
                    if p.len() > max_payload {
                        bail!("payload of {} bytes over limit {}", p.len(), max_payload);
                    }
                }
            }
            OpKind::Move {
                node,
                new_parent,
                order_key,
            } => {
                if new_parent == node {
                    bail!("move under itself");
                }
                if order_key.digits().is_empty() {
                    bail!("empty order key");
                }
            }
            OpKind::Payload { payload, .. } => {
                if let Some(p) = payload {
                    if p.len() > max_payload {
                        bail!("payload of {} bytes over limit {}", p.len(), max_payload);
                    }
                }
            }
            OpKind::Delete { .. } => {
                if let Some(ks) = &self.meta.known_state {
                    crate::clock::VersionVector::decode(ks)?;
                }
            }
            OpKind::Tombstone { .. } => {}
        }
        Ok(())
    }

    /// Canonical byte encoding used as the signed message. Bit-exact across
    /// implementations and stable across releases.
    pub fn signing_bytes(&self, doc_id: &str) -> Vec<u8> {
        let mut out = Vec::with_capacity(128);
        out.extend_from_slice(SIG_DOMAIN);
        out.push(SIG_VERSION);
        put_bytes(&mut out, doc_id.as_bytes());
        put_bytes(&mut out, self.meta.id.replica.as_bytes());
        out.extend_from_slice(&self.meta.id.counter.to_be_bytes());
        out.extend_from_slice(&self.meta.lamport.to_be_bytes());
        out.push(self.kind_tag());
        match &self.kind {
            OpKind::Insert {
                parent,
                node,
                order_key,
                payload,
            } => {
                out.extend_from_slice(parent.as_bytes());
                out.extend_from_slice(node.as_bytes());
                put_bytes(&mut out, &order_key.to_bytes());
                put_opt_bytes(&mut out, payload.as_deref());
            }
            OpKind::Move {
                node,
                new_parent,
                order_key,
            } => {
                out.extend_from_slice(node.as_bytes());
                out.extend_from_slice(new_parent.as_bytes());
                put_bytes(&mut out, &order_key.to_bytes());
            }
            OpKind::Delete { node } => {
                out.extend_from_slice(node.as_bytes());
                put_bytes(&mut out, self.meta.known_state.as_deref().unwrap_or(&[]));
            }
            OpKind::Tombstone { node } => {
                out.extend_from_slice(node.as_bytes());
            }
            OpKind::Payload { node, payload } => {
                out.extend_from_slice(node.as_bytes());
                put_opt_bytes(&mut out, payload.as_deref());
            }
        }
        out
    }

    /// Inverse of [`Op::signing_bytes`]; returns the doc id and the op.
    pub fn from_signing_bytes(bytes: &[u8]) -> Result<(String, Op)> {
        let mut r = Reader::new(bytes);
        let domain = r.take(SIG_DOMAIN.len())?;
        if domain != SIG_DOMAIN {
            bail!("bad signing domain");
        }
        let version = r.u8()?;
        if version != SIG_VERSION {
            bail!("unknown signing version {}", version);
        }
        let doc_id = String::from_utf8(r.bytes()?.to_vec())?;
        let replica = r.bytes()?;
        if replica.len() != 32 {
            bail!("bad replica length {}", replica.len());
        }
        let mut id = [0; 32];
        id.copy_from_slice(replica);
        let replica = ReplicaId::new(id);
        let counter = r.u64()?;
        let lamport = r.u64()?;
        let tag = r.u8()?;
        let op = match tag {
            TAG_INSERT => {
                let parent = r.node()?;
                let node = r.node()?;
                let order_key = OrderKey::from_bytes(r.bytes()?)?;
                let payload = r.opt_bytes()?;
                Op::insert(replica, counter, lamport, parent, node, order_key, payload)
            }
            TAG_MOVE => {
                let node = r.node()?;
                let new_parent = r.node()?;
                let order_key = OrderKey::from_bytes(r.bytes()?)?;
                Op::move_node(replica, counter, lamport, node, new_parent, order_key)
            }
            TAG_DELETE => {
                let node = r.node()?;
                let known_state = r.bytes()?;
                let known_state = if known_state.is_empty() {
                    None
                } else {
                    Some(known_state.to_vec())
                };
                Op::delete(replica, counter, lamport, node, known_state)
            }
            TAG_TOMBSTONE => Op::tombstone(replica, counter, lamport, r.node()?),
            TAG_PAYLOAD => {
                let node = r.node()?;
                let payload = r.opt_bytes()?;
                Op::payload(replica, counter, lamport, node, payload)
            }
            tag => bail!("unknown op kind tag {}", tag),
        };
        r.finish()?;
        Ok((doc_id, op))
    }
}

fn put_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
    out.extend_from_slice(bytes);
}

fn put_opt_bytes(out: &mut Vec<u8>, bytes: Option<&[u8]>) {
    match bytes {
        Some(bytes) => {
            out.push(1);
            put_bytes(out, bytes);
        }
        None => out.push(0),
    }
}

struct Reader<'a> {
    bytes: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.bytes.len() < n {
            bail!("truncated op encoding");
        }
        let (head, tail) = self.bytes.split_at(n);
        self.bytes = tail;
        Ok(head)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u64(&mut self) -> Result<u64> {
        let mut buf = [0; 8];
        buf.copy_from_slice(self.take(8)?);
        Ok(u64::from_be_bytes(buf))
    }

    fn bytes(&mut self) -> Result<&'a [u8]> {
        let mut len = [0; 4];
        len.copy_from_slice(self.take(4)?);
        self.take(u32::from_be_bytes(len) as usize)
    }

    fn opt_bytes(&mut self) -> Result<Option<Vec<u8>>> {
        match self.u8()? {
            0 => Ok(None),
            1 => Ok(Some(self.bytes()?.to_vec())),
            b => bail!("bad presence byte {}", b),
        }
    }

    fn node(&mut self) -> Result<NodeId> {
        let mut id = [0; 16];
        id.copy_from_slice(self.take(16)?);
        Ok(NodeId::new(id))
    }

    fn finish(&self) -> Result<()> {
        if !self.bytes.is_empty() {
            bail!("{} trailing bytes after op encoding", self.bytes.len());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn replica(b: u8) -> ReplicaId {
        ReplicaId::new([b; 32])
    }

    fn node(b: u8) -> NodeId {
        NodeId::new([b; 16])
    }

    fn key(digits: &[u16]) -> OrderKey {
        OrderKey::new(digits.into())
    }

    fn sample_ops() -> Vec<Op> {
        let ks = {
            let mut vv = crate::clock::VersionVector::new();
            vv.observe(replica(1), 3);
            vv.encode()
        };
        vec![
            Op::insert(replica(1), 1, 1, NodeId::ROOT, node(1), key(&[7]), None),
            Op::insert(
                replica(1),
                2,
                2,
                node(1),
                node(2),
                key(&[7, 12]),
                Some(vec![0x61, 0x62]),
            ),
            Op::move_node(replica(2), 1, 3, node(2), NodeId::ROOT, key(&[9])),
            Op::payload(replica(2), 2, 4, node(1), Some(vec![])),
            Op::payload(replica(2), 3, 5, node(1), None),
            Op::delete(replica(1), 3, 6, node(2), Some(ks)),
            Op::delete(replica(1), 4, 7, node(2), None),
            Op::tombstone(replica(2), 4, 8, node(1)),
        ]
    }

    #[test]
    fn signing_round_trip() {
        for op in sample_ops() {
            let bytes = op.signing_bytes("doc-1");
            let (doc, decoded) = Op::from_signing_bytes(&bytes).unwrap();
            assert_eq!(doc, "doc-1");
            assert_eq!(decoded, op);
            // Byte-for-byte stable re-encode.
            assert_eq!(decoded.signing_bytes("doc-1"), bytes);
        }
    }

    #[test]
    fn signing_prefix_is_stable() {
        let op = Op::tombstone(replica(0), 0, 0, node(1));
        let bytes = op.signing_bytes("d");
        assert!(bytes.starts_with(b"treecrdt/op-sig/v1\x00"));
        // domain ‖ version ‖ len ‖ "d" ‖ len ‖ replica ‖ counter ‖ lamport ‖ tag ‖ node
        assert_eq!(bytes.len(), 18 + 1 + 4 + 1 + 4 + 32 + 8 + 8 + 1 + 16);
    }

    #[test]
    fn decode_rejects_malformed() {
        let op = Op::tombstone(replica(0), 0, 0, node(1));
        let mut bytes = op.signing_bytes("d");
        assert!(Op::from_signing_bytes(&bytes[..bytes.len() - 1]).is_err());
        bytes.push(0);
        assert!(Op::from_signing_bytes(&bytes).is_err());
        let mut bad_tag = op.signing_bytes("d");
        let tag_at = 18 + 1 + 4 + 1 + 4 + 32 + 8 + 8;
        bad_tag[tag_at] = 9;
        assert!(Op::from_signing_bytes(&bad_tag).is_err());
    }

    #[test]
    fn validate_catches_malformed_ops() {
        let ok = Op::insert(replica(1), 1, 1, NodeId::ROOT, node(1), key(&[5]), None);
        assert!(ok.validate(64).is_ok());

        let reserved = Op::tombstone(replica(1), 1, 1, NodeId::ROOT);
        assert!(reserved.validate(64).is_err());

        let self_insert = Op::insert(replica(1), 1, 1, node(1), node(1), key(&[5]), None);
        assert!(self_insert.validate(64).is_err());

        let under_trash =
            Op::insert(replica(1), 1, 1, NodeId::TRASH, node(1), key(&[5]), None);
        assert!(under_trash.validate(64).is_err());

        let big = Op::payload(replica(1), 1, 1, node(1), Some(vec![0; 65]));
        assert!(big.validate(64).is_err());

        let stray_ks = Op {
            meta: OpMeta {
                id: OpId::new(replica(1), 1),
                lamport: 1,
                known_state: Some(vec![1, 2, 3]),
            },
            kind: OpKind::Tombstone { node: node(1) },
        };
        assert!(stray_ks.validate(64).is_err());
    }
}
