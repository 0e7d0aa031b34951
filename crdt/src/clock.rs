//! Version vectors carried by defensive deletes.
use crate::id::{OpId, ReplicaId};
use anyhow::{bail, Result};
use std::collections::BTreeMap;

/// Per-replica high-water marks.
///
/// The wire layout is `u32be(n)` followed by `n` entries of
/// `replica(32B) ‖ u64be(counter)`, sorted by replica bytes ascending.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct VersionVector {
    clock: BTreeMap<ReplicaId, u64>,
}

impl VersionVector {
    /// Returns a new instance.
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the associated counter for this replica.
    /// All replicas not in the vector have an implied count of 0.
    pub fn get(&self, replica: &ReplicaId) -> u64 {
        self.clock.get(replica).copied().unwrap_or_default()
    }

    /// Raises the replica's high-water mark.
    pub fn observe(&mut self, replica: ReplicaId, counter: u64) {
        let entry = self.clock.entry(replica).or_default();
        if counter > *entry {
            *entry = counter;
        }
    }

    /// Checks if the op id is covered by the vector.
    pub fn contains(&self, id: &OpId) -> bool {
        self.get(&id.replica) >= id.counter
    }

    /// Merges with the other vector.
    pub fn union(&mut self, other: &VersionVector) {
        for (replica, counter) in &other.clock {
            self.observe(*replica, *counter);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.clock.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ReplicaId, &u64)> {
        self.clock.iter()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(4 + self.clock.len() * 40);
        bytes.extend_from_slice(&(self.clock.len() as u32).to_be_bytes());
        for (replica, counter) in &self.clock {
            bytes.extend_from_slice(replica.as_bytes());
            bytes.extend_from_slice(&counter.to_be_bytes());
        }
        bytes
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 4 {
            bail!("version vector truncated");
        }
        let n = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
        if bytes.len() != 4 + n * 40 {
            bail!("version vector length mismatch");
        }
        let mut clock = BTreeMap::new();
        let mut prev: Option<ReplicaId> = None;
        for entry in bytes[4..].chunks(40) {
            let mut id = [0; 32];
            id.copy_from_slice(&entry[..32]);
            let replica = ReplicaId::new(id);
            if let Some(prev) = prev {
                if prev >= replica {
                    bail!("version vector entries out of order");
                }
            }
            let mut counter = [0; 8];
            counter.copy_from_slice(&entry[32..]);
            clock.insert(replica, u64::from_be_bytes(counter));
            prev = Some(replica);
        }
        Ok(Self { clock })
    }
}

impl std::iter::FromIterator<OpId> for VersionVector {
    fn from_iter<I: IntoIterator<Item = OpId>>(iter: I) -> Self {
        let mut vv = VersionVector::new();
        for id in iter {
            vv.observe(id.replica, id.counter);
        }
        vv
    }
}
