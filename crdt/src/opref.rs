use crate::id::ReplicaId;
use bytecheck::CheckBytes;
use rkyv::{Archive, Deserialize, Serialize};

const OPREF_DOMAIN: &[u8] = b"treecrdt/opref/v0";

/// 16-byte content identifier of an operation.
///
/// Derivable from `(doc_id, replica, counter)` alone, so both ends of a sync
/// connection can name operations without shipping them. This derivation is
/// the one cross-language compatibility anchor and must stay bit-exact.
#[derive(
    Clone, Copy, Eq, Hash, Ord, PartialEq, PartialOrd, Archive, CheckBytes, Deserialize, Serialize,
)]
#[archive(as = "OpRef")]
#[repr(transparent)]
pub struct OpRef([u8; 16]);

impl OpRef {
    pub fn new(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Derives the content identifier from operation metadata.
    pub fn derive(doc_id: &str, replica: &ReplicaId, counter: u64) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(OPREF_DOMAIN);
        hasher.update(doc_id.as_bytes());
        hasher.update(&(replica.as_bytes().len() as u32).to_be_bytes());
        hasher.update(replica.as_bytes());
        hasher.update(&counter.to_be_bytes());
        let mut bytes = [0; 16];
        bytes.copy_from_slice(&hasher.finalize().as_bytes()[..16]);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl From<OpRef> for [u8; 16] {
    fn from(r: OpRef) -> Self {
        r.0
    }
}

impl AsRef<[u8; 16]> for OpRef {
    fn as_ref(&self) -> &[u8; 16] {
        &self.0
    }
}

impl std::fmt::Debug for OpRef {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", hex::encode(&self.0[0..4]))
    }
}

impl std::fmt::Display for OpRef {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}
