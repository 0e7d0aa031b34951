use bytecheck::CheckBytes;
use rkyv::{Archive, Deserialize, Serialize};

/// Lamport timestamp. Minted as `max(head, deps) + 1`, never reused.
pub type Lamport = u64;

/// Identity of a writing replica: an Ed25519 public key.
#[derive(
    Clone, Copy, Eq, Hash, Ord, PartialEq, PartialOrd, Archive, CheckBytes, Deserialize, Serialize,
)]
#[archive(as = "ReplicaId")]
#[repr(transparent)]
pub struct ReplicaId([u8; 32]);

impl ReplicaId {
    pub fn new(id: [u8; 32]) -> Self {
        Self(id)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl From<ReplicaId> for [u8; 32] {
    fn from(id: ReplicaId) -> Self {
        id.0
    }
}

impl AsRef<[u8; 32]> for ReplicaId {
    fn as_ref(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Debug for ReplicaId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", hex::encode(&self.0[0..2]))
    }
}

impl std::fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl std::str::FromStr for ReplicaId {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 64 {
            return Err(anyhow::anyhow!("invalid replica_id length {}", s.len()));
        }
        let mut id = [0; 32];
        hex::decode_to_slice(s, &mut id)?;
        Ok(Self(id))
    }
}

/// 128-bit node identifier. Canonically rendered as 32 lowercase hex chars.
///
/// Two values are reserved: [`NodeId::ROOT`] (all zero) and [`NodeId::TRASH`]
/// (all ones). They terminate every parent chain and are never tombstoned.
#[derive(
    Clone, Copy, Eq, Hash, Ord, PartialEq, PartialOrd, Archive, CheckBytes, Deserialize, Serialize,
)]
#[archive(as = "NodeId")]
#[repr(transparent)]
pub struct NodeId([u8; 16]);

impl NodeId {
    /// Root of the forest.
    pub const ROOT: NodeId = NodeId([0; 16]);
    /// Detached-node terminator.
    pub const TRASH: NodeId = NodeId([0xff; 16]);

    pub fn new(id: [u8; 16]) -> Self {
        Self(id)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// True for the two reserved chain terminators.
    pub fn is_reserved(&self) -> bool {
        *self == Self::ROOT || *self == Self::TRASH
    }
}

impl From<NodeId> for [u8; 16] {
    fn from(id: NodeId) -> Self {
        id.0
    }
}

impl AsRef<[u8; 16]> for NodeId {
    fn as_ref(&self) -> &[u8; 16] {
        &self.0
    }
}

impl std::fmt::Debug for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        if *self == Self::ROOT {
            write!(f, "ROOT")
        } else if *self == Self::TRASH {
            write!(f, "TRASH")
        } else {
            write!(f, "{}", hex::encode(&self.0[0..4]))
        }
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl std::str::FromStr for NodeId {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 32 {
            return Err(anyhow::anyhow!("invalid node_id length {}", s.len()));
        }
        let mut id = [0; 16];
        hex::decode_to_slice(s, &mut id)?;
        Ok(Self(id))
    }
}

/// Per-replica operation identity: `(replica, counter)` with a monotonically
/// increasing counter.
#[derive(
    Clone, Copy, Eq, Hash, Ord, PartialEq, PartialOrd, Archive, CheckBytes, Deserialize, Serialize,
)]
#[archive(as = "OpId")]
#[repr(C)]
pub struct OpId {
    pub replica: ReplicaId,
    pub counter: u64,
}

impl OpId {
    pub fn new(replica: ReplicaId, counter: u64) -> Self {
        Self { replica, counter }
    }
}

impl std::fmt::Debug for OpId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}:{}", self.replica, self.counter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn node_id_hex_round_trip() {
        let id = NodeId::new([0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15]);
        let s = id.to_string();
        assert_eq!(s, "000102030405060708090a0b0c0d0e0f");
        assert_eq!(NodeId::from_str(&s).unwrap(), id);
    }

    #[test]
    fn reserved_ids() {
        assert_eq!(NodeId::ROOT.to_string(), "0".repeat(32));
        assert_eq!(NodeId::TRASH.to_string(), "f".repeat(32));
        assert!(NodeId::ROOT.is_reserved());
        assert!(NodeId::TRASH.is_reserved());
        assert!(!NodeId::new([1; 16]).is_reserved());
    }

    #[test]
    fn op_id_order() {
        let a = OpId::new(ReplicaId::new([1; 32]), 7);
        let b = OpId::new(ReplicaId::new([1; 32]), 8);
        let c = OpId::new(ReplicaId::new([2; 32]), 1);
        assert!(a < b);
        assert!(b < c);
    }
}
