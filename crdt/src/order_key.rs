//! Sibling ordering keys. It's always possible to allocate a new key between
//! two existing neighbors without coordination:
//!
//! Given keys `l < r`, `allocate_between(Some(l), Some(r), seed)` yields `k`
//! with `l < k < r`; `None` stands for the open end on either side.
use anyhow::{bail, Result};
use bytecheck::CheckBytes;
use core::fmt;
use rkyv::{Archive, Deserialize, Serialize};
use smallvec::SmallVec;
use std::hash::Hasher;

const ORDER_KEY_DOMAIN: &[u8] = b"treecrdt/order_key/v0";

/// Width of the allocation window next to a frontier digit. Small enough to
/// keep keys compact under clustered inserts, large enough that concurrent
/// allocations rarely collide on the same digit.
const WINDOW: u64 = 10;

const LO: u16 = 0;
const HI: u16 = 0xffff;

/// A variable-length sequence of `u16` digits, compared lexicographically.
///
/// Allocated digits are always strictly inside the `(0, 0xffff)` boundary
/// window of their neighbors, so no allocated key is a prefix of another.
#[derive(Clone, Eq, Hash, Ord, PartialEq, PartialOrd, Archive, Deserialize, Serialize)]
#[archive_attr(derive(CheckBytes))]
#[repr(transparent)]
pub struct OrderKey(SmallVec<[u16; 8]>);

impl OrderKey {
    pub fn new(digits: SmallVec<[u16; 8]>) -> Self {
        Self(digits)
    }

    pub fn digits(&self) -> &[u16] {
        &self.0
    }

    /// Big-endian byte encoding; preserves the lexicographic digit order.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.0.len() * 2);
        for d in &self.0 {
            bytes.extend_from_slice(&d.to_be_bytes());
        }
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() % 2 != 0 {
            bail!("order key length {} is not a digit sequence", bytes.len());
        }
        let mut digits = SmallVec::with_capacity(bytes.len() / 2);
        for pair in bytes.chunks(2) {
            digits.push(u16::from_be_bytes([pair[0], pair[1]]));
        }
        Ok(Self(digits))
    }

    /// Allocates a key strictly between `left` and `right`.
    ///
    /// `None` acts as -inf / +inf. The same `(left, right, seed)` yields the
    /// same key on every replica; distinct seeds between the same neighbors
    /// yield distinct, totally ordered keys.
    pub fn allocate_between(
        left: Option<&OrderKey>,
        right: Option<&OrderKey>,
        seed: &[u8],
    ) -> Result<OrderKey> {
        if let (Some(l), Some(r)) = (left, right) {
            if l >= r {
                bail!("order key neighbors out of order: {:?} >= {:?}", l, r);
            }
        }
        let has_right = right.is_some();
        let left = left.map(|k| k.digits()).unwrap_or(&[]);
        let right = right.map(|k| k.digits()).unwrap_or(&[]);

        let mut digits: SmallVec<[u16; 8]> = SmallVec::new();
        // Once the emitted prefix drops strictly below the right neighbor the
        // upper bound no longer constrains deeper digits.
        let mut right_bounds = true;
        let mut depth = 0usize;
        loop {
            let ld = left.get(depth).copied().unwrap_or(LO);
            let rd = if !right_bounds {
                HI
            } else {
                match right.get(depth) {
                    Some(d) => *d,
                    // Allocated keys never end in a zero digit, so a bounding
                    // right neighbor only runs out on foreign input.
                    None if has_right => bail!("no key allocatable between neighbors"),
                    None => HI,
                }
            };
            if rd < ld {
                bail!("order key neighbors out of order at depth {}", depth);
            }
            let gap = (rd as u64).saturating_sub(ld as u64 + 1);
            if gap > 0 {
                let h = side_hash(seed, depth as u32);
                let window = WINDOW.min(gap);
                let offset = (h >> 1) % window;
                let digit = if h & 1 == 0 {
                    ld as u64 + 1 + offset
                } else {
                    rd as u64 - 1 - offset
                };
                digits.push(digit as u16);
                return Ok(OrderKey(digits));
            }
            digits.push(ld);
            if ld < rd {
                right_bounds = false;
            }
            depth += 1;
        }
    }
}

/// 64-bit FNV-1a over the domain tag, the seed and the depth.
fn side_hash(seed: &[u8], depth: u32) -> u64 {
    let mut hasher = fnv::FnvHasher::default();
    hasher.write(ORDER_KEY_DOMAIN);
    hasher.write(seed);
    hasher.write(&depth.to_be_bytes());
    hasher.finish()
}

impl fmt::Debug for OrderKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OrderKey[")?;
        for (i, d) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ".")?;
            }
            write!(f, "{:04x}", d)?;
        }
        write!(f, "]")
    }
}
