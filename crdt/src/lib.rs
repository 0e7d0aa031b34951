//! # The arbor tree crdt
//!
//! ## Op log
//! The workhorse of this crate is an append-only, deduplicated log of signed
//! operations. An operation is minted once, is immutable afterwards, and is
//! identified globally by a 16-byte content reference derived from
//! `(doc id, replica, counter)` alone. Because the reference is computable
//! from metadata, two replicas can discuss which operations the other is
//! missing without shipping the operations themselves.
//!
//! ## Materialized tree
//! The tree view (parent, sibling order, payload, tombstone) is not
//! authoritative state: it is recomputed from the canonically sorted log
//! after every apply batch. The canonical order is
//! `(lamport, replica, counter)` ascending with replica ties broken bytewise.
//! Any permutation of arrivals therefore converges to the same view:
//!
//! - the live parent of a node is the highest-ordered insert or move,
//! - payload is last-writer-wins under the same order,
//! - concurrent moves that would form a cycle are resolved by parking the
//!   lowest-ordered edge at the root; the losing op stays in the log,
//! - a tombstone is absorbing, while a defensive delete escalates to a
//!   tombstone only when the deleter provably missed a concurrent write to
//!   the subtree.
//!
//! ## Sibling order
//! Siblings are ordered by variable-length `u16` digit sequences compared
//! lexicographically. Allocating between two neighbors needs no
//! coordination: both sides of a gap derive the same key from the same seed,
//! and concurrent allocations with different seeds land on distinct, totally
//! ordered keys. Seeds are `replica ‖ counter`, so the allocation is as
//! deterministic as the op that carries it.
//!
//! ## Authorization
//! Every operation is signed by its author; the replica id is the public
//! key. Write authority is granted through capability tokens: COSE_Sign1
//! envelopes whose CWT claims bind a subject key to `action x subtree`
//! grants for one document. Scope checks walk the local parent chain and are
//! deliberately tri-valued: allow, deny, or unknown when the chain has gaps.
//! Unknown is not a failure. The op is parked in a pending sidecar and
//! reexamined whenever new context lands, which makes authorization
//! convergent in the same way the tree is.
mod acl;
mod clock;
mod crypto;
mod engine;
mod id;
mod op;
mod opref;
mod order_key;
#[cfg(test)]
mod props;
mod store;
mod token;
mod tree;

pub use crate::acl::{evaluate_scope, required_actions, Authorizer, Decision, Policy, Verdict};
pub use crate::clock::VersionVector;
pub use crate::crypto::{verify, Keypair, Proof, SignedOp};
pub use crate::engine::{
    ApplyError, ApplyErrorKind, ApplyReport, Engine, EngineConfig, Placement,
};
pub use crate::id::{Lamport, NodeId, OpId, ReplicaId};
pub use crate::op::{Op, OpKind, OpMeta};
pub use crate::opref::OpRef;
pub use crate::order_key::OrderKey;
pub use crate::store::{Filter, OpLog, PendingEntry, PendingStore};
pub use crate::token::{Action, Capability, CapabilityToken, Scope, TokenRef};
pub use crate::tree::{ChildRow, NodeView, ParentLink, Tree, TreeRow};
