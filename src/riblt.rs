//! Rateless set reconciliation over op references.
//!
//! The encoder turns its opref set into an endless stream of coded symbols;
//! the decoder subtracts its own set and peels singletons until the
//! symmetric difference is fully recovered. Both sides derive identical
//! index mappings from the opref alone, so no coordination is needed and
//! the stream can be cut off at any prefix.
use arbor_crdt::OpRef;
use bytecheck::CheckBytes;
use fnv::FnvHasher;
use rkyv::{Archive, Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap};
use std::hash::Hasher;

/// One coded symbol: a multiplicity, the XOR of the member opref hashes and
/// the XOR of the member opref bytes.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Archive, Deserialize, Serialize)]
#[archive_attr(derive(CheckBytes))]
#[repr(C)]
pub struct Codeword {
    pub count: i64,
    pub key_sum: u64,
    pub value_sum: [u8; 16],
}

impl Codeword {
    fn mix(&mut self, opref: &OpRef, sign: i64) {
        self.count += sign;
        self.key_sum ^= key_hash(opref);
        for (acc, byte) in self.value_sum.iter_mut().zip(opref.as_bytes()) {
            *acc ^= byte;
        }
    }

    fn is_zero(&self) -> bool {
        self.count == 0 && self.key_sum == 0 && self.value_sum == [0; 16]
    }

    /// A peelable cell holds exactly one symbol; the hash check rules out
    /// accidental `±1` mixtures.
    fn singleton(&self) -> Option<(OpRef, i64)> {
        if self.count != 1 && self.count != -1 {
            return None;
        }
        let opref = OpRef::new(self.value_sum);
        if key_hash(&opref) == self.key_sum {
            Some((opref, self.count))
        } else {
            None
        }
    }
}

/// 64-bit FNV-1a of the opref bytes; used for key sums and mapping seeds.
fn key_hash(opref: &OpRef) -> u64 {
    let mut hasher = FnvHasher::default();
    hasher.write(opref.as_bytes());
    hasher.finish()
}

/// Strictly increasing codeword index sequence for one symbol, with density
/// falling off as `1/sqrt(i)` so later codewords stay sparse.
#[derive(Clone, Debug)]
struct IndexMapping {
    prng: u64,
    last: u64,
}

impl IndexMapping {
    fn new(opref: &OpRef) -> Self {
        Self {
            prng: key_hash(opref) | 1,
            last: 0,
        }
    }

    fn next_index(&mut self) -> u64 {
        self.prng = self.prng.wrapping_mul(0xda942042e4dd58b5);
        // With r uniform over 32 bits, 65536/sqrt(r+1) is 1/sqrt(u) for
        // u uniform in (0,1], giving the 1/sqrt(i) participation density.
        let r = (self.prng >> 32) as f64;
        let step = (self.last as f64 + 1.5) * (65536.0 / (r + 1.0).sqrt() - 1.0);
        self.last = self.last.saturating_add(step.ceil().max(1.0) as u64);
        self.last
    }
}

#[derive(Clone)]
struct MappedSymbol {
    next: u64,
    opref: OpRef,
    mapping: IndexMapping,
}

impl PartialEq for MappedSymbol {
    fn eq(&self, other: &Self) -> bool {
        (self.next, self.opref) == (other.next, other.opref)
    }
}
impl Eq for MappedSymbol {}
impl PartialOrd for MappedSymbol {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for MappedSymbol {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.next, self.opref).cmp(&(other.next, other.opref))
    }
}

/// Emits the rateless codeword stream for a fixed symbol set.
pub struct Encoder {
    queue: BinaryHeap<Reverse<MappedSymbol>>,
    next_index: u64,
}

impl Encoder {
    pub fn new(symbols: impl IntoIterator<Item = OpRef>) -> Self {
        let queue = symbols
            .into_iter()
            .map(|opref| {
                Reverse(MappedSymbol {
                    next: 0,
                    mapping: IndexMapping::new(&opref),
                    opref,
                })
            })
            .collect();
        Self {
            queue,
            next_index: 0,
        }
    }

    /// Produces the next `n` codewords in stream order.
    pub fn emit(&mut self, n: usize) -> Vec<Codeword> {
        let mut out = Vec::with_capacity(n);
        for _ in 0..n {
            let index = self.next_index;
            self.next_index += 1;
            let mut cell = Codeword::default();
            while let Some(Reverse(head)) = self.queue.peek() {
                if head.next != index {
                    break;
                }
                let Some(Reverse(mut symbol)) = self.queue.pop() else {
                    break;
                };
                cell.mix(&symbol.opref, 1);
                symbol.next = symbol.mapping.next_index();
                self.queue.push(Reverse(symbol));
            }
            out.push(cell);
        }
        out
    }

    pub fn emitted(&self) -> u64 {
        self.next_index
    }
}

/// A symbol whose contribution is being streamed into the received cells:
/// the decoder's own set (negative) and peeled symbols being cancelled out.
struct TrackedSymbol {
    opref: OpRef,
    mapping: IndexMapping,
    next: u64,
    sign: i64,
}

/// Incremental decoder. Feed remote codewords in stream order; when
/// [`Decoder::decoded`] turns true the symmetric difference is complete.
pub struct Decoder {
    cells: Vec<Codeword>,
    tracked: Vec<TrackedSymbol>,
    remote_only: BTreeSet<OpRef>,
    local_only: BTreeSet<OpRef>,
    received: usize,
}

impl Decoder {
    pub fn new(local: impl IntoIterator<Item = OpRef>) -> Self {
        let tracked = local
            .into_iter()
            .map(|opref| TrackedSymbol {
                mapping: IndexMapping::new(&opref),
                next: 0,
                sign: -1,
                opref,
            })
            .collect();
        Self {
            cells: Vec::new(),
            tracked,
            remote_only: BTreeSet::new(),
            local_only: BTreeSet::new(),
            received: 0,
        }
    }

    /// Absorbs the next batch of remote codewords and peels as far as
    /// possible.
    pub fn absorb(&mut self, codewords: &[Codeword]) {
        self.cells.extend_from_slice(codewords);
        self.received += codewords.len();
        // Extend every tracked stream over the new cells.
        for symbol in &mut self.tracked {
            while (symbol.next as usize) < self.cells.len() {
                let at = symbol.next as usize;
                let (opref, sign) = (symbol.opref, symbol.sign);
                self.cells[at].mix(&opref, sign);
                symbol.next = symbol.mapping.next_index();
            }
        }
        self.peel();
    }

    fn peel(&mut self) {
        loop {
            let Some((opref, sign)) = self
                .cells
                .iter()
                .find_map(|cell| cell.singleton())
            else {
                return;
            };
            if sign > 0 {
                self.remote_only.insert(opref);
            } else {
                self.local_only.insert(opref);
            }
            // Cancel the symbol everywhere, past and future.
            let mut tracked = TrackedSymbol {
                mapping: IndexMapping::new(&opref),
                next: 0,
                sign: -sign,
                opref,
            };
            while (tracked.next as usize) < self.cells.len() {
                let at = tracked.next as usize;
                self.cells[at].mix(&opref, tracked.sign);
                tracked.next = tracked.mapping.next_index();
            }
            self.tracked.push(tracked);
        }
    }

    /// True once every received cell has cancelled to zero.
    pub fn decoded(&self) -> bool {
        self.received > 0 && self.cells.iter().all(Codeword::is_zero)
    }

    pub fn received(&self) -> usize {
        self.received
    }

    /// Oprefs the remote holds and we lack.
    pub fn remote_only(&self) -> &BTreeSet<OpRef> {
        &self.remote_only
    }

    /// Oprefs we hold and the remote lacks.
    pub fn local_only(&self) -> &BTreeSet<OpRef> {
        &self.local_only
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opref(i: u64) -> OpRef {
        let mut bytes = [0; 16];
        bytes[..8].copy_from_slice(&i.to_be_bytes());
        bytes[15] = 0x5a;
        OpRef::new(bytes)
    }

    fn reconcile(
        local: Vec<OpRef>,
        remote: Vec<OpRef>,
        batch: usize,
        budget: usize,
    ) -> (Decoder, usize) {
        let mut encoder = Encoder::new(remote);
        let mut decoder = Decoder::new(local);
        let mut used = 0;
        while !decoder.decoded() && used < budget {
            decoder.absorb(&encoder.emit(batch));
            used += batch;
        }
        (decoder, used)
    }

    #[test]
    fn equal_sets_decode_immediately() {
        let set: Vec<OpRef> = (0..50).map(opref).collect();
        let (decoder, _) = reconcile(set.clone(), set, 1, 16);
        assert!(decoder.decoded());
        assert!(decoder.remote_only().is_empty());
        assert!(decoder.local_only().is_empty());
    }

    #[test]
    fn small_delta_decodes_within_linear_codewords() {
        // Shared core plus a delta on each side.
        for delta in [1usize, 2, 4, 8, 16] {
            let shared: Vec<OpRef> = (0..200).map(opref).collect();
            let mut local = shared.clone();
            let mut remote = shared;
            for i in 0..delta as u64 {
                local.push(opref(1000 + i));
                remote.push(opref(2000 + i));
            }
            let (decoder, used) = reconcile(local, remote, 1, 40 * delta.max(1));
            assert!(decoder.decoded(), "delta {} failed to decode", delta);
            assert_eq!(decoder.remote_only().len(), delta);
            assert_eq!(decoder.local_only().len(), delta);
            // Rateless overhead stays a small multiple of the difference.
            assert!(
                used <= 8 * 2 * delta,
                "delta {} took {} codewords",
                delta,
                used
            );
        }
    }

    #[test]
    fn one_sided_difference() {
        let remote: Vec<OpRef> = (0..10).map(opref).collect();
        let (decoder, _) = reconcile(Vec::new(), remote.clone(), 4, 256);
        assert!(decoder.decoded());
        assert_eq!(decoder.remote_only().len(), remote.len());
        assert!(decoder.local_only().is_empty());
    }

    #[test]
    fn encoder_stream_is_deterministic() {
        let set: Vec<OpRef> = (0..32).map(opref).collect();
        let a = Encoder::new(set.clone()).emit(64);
        let b = Encoder::new(set).emit(64);
        assert_eq!(a, b);
    }

    #[test]
    fn mapping_indices_strictly_increase() {
        let mut mapping = IndexMapping::new(&opref(7));
        let mut last = 0;
        for _ in 0..64 {
            let next = mapping.next_index();
            assert!(next > last);
            last = next;
        }
    }

    mod props {
        use super::*;
        use proptest::prelude::*;
        use std::collections::BTreeSet;

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(64))]

            #[test]
            fn random_sets_reconcile(
                local in prop::collection::btree_set(0u64..64, 0..24),
                remote in prop::collection::btree_set(0u64..64, 0..24),
            ) {
                let local: BTreeSet<OpRef> = local.into_iter().map(opref).collect();
                let remote: BTreeSet<OpRef> = remote.into_iter().map(opref).collect();
                let delta = local.symmetric_difference(&remote).count();

                let mut encoder = Encoder::new(remote.iter().copied());
                let mut decoder = Decoder::new(local.iter().copied());
                let budget = 64 + 32 * delta;
                let mut used = 0;
                while !decoder.decoded() && used < budget {
                    decoder.absorb(&encoder.emit(8));
                    used += 8;
                }
                prop_assert!(decoder.decoded(), "delta {} undecoded after {}", delta, used);
                let remote_only: BTreeSet<OpRef> =
                    remote.difference(&local).copied().collect();
                let local_only: BTreeSet<OpRef> =
                    local.difference(&remote).copied().collect();
                prop_assert_eq!(decoder.remote_only(), &remote_only);
                prop_assert_eq!(decoder.local_only(), &local_only);
            }
        }
    }
}
