//! Capability-scoped authorization.
//!
//! Scope checks are tri-valued: a node can be provably inside a grant,
//! provably outside, or undecidable because the local tree is missing part
//! of the parent chain. Undecidable ops are parked in the pending sidecar
//! instead of being dropped, and re-examined as context arrives.
use crate::crypto::{Proof, SignedOp};
use crate::id::{NodeId, ReplicaId};
use crate::op::{Op, OpKind};
use crate::token::{Action, CapabilityToken, Scope, TokenRef};
use crate::tree::{ParentLink, Tree};
use anyhow::{bail, Result};
use fnv::FnvHashSet;
use std::collections::{BTreeMap, BTreeSet};

/// Tri-valued scope decision.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Decision {
    Allow,
    Deny,
    Unknown,
}

/// Outcome of the full authorization pipeline for one op.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Verdict {
    Allow,
    Deny(String),
    /// Park in the pending sidecar and retry when new ops land.
    Unknown(String),
}

/// Authorization policy for a document.
#[derive(Clone, Debug)]
pub enum Policy {
    /// Any validly signed op is accepted. Used by trusted deployments and
    /// most tests.
    Open,
    /// Fail-closed capability checking.
    Capabilities {
        trusted_issuers: BTreeSet<ReplicaId>,
        /// Require ops to reference a token the verifier already holds
        /// instead of shipping tokens inline.
        require_proof_ref: bool,
    },
}

/// Per-op required actions: `(node to check, action)` pairs, combined with
/// AND.
pub fn required_actions(op: &Op) -> Vec<(NodeId, Action)> {
    match &op.kind {
        OpKind::Insert {
            parent, payload, ..
        } => {
            let mut req = vec![(*parent, Action::WriteStructure)];
            if payload.is_some() {
                req.push((*parent, Action::WritePayload));
            }
            req
        }
        OpKind::Move {
            node, new_parent, ..
        } => vec![
            (*node, Action::WriteStructure),
            (*new_parent, Action::WriteStructure),
        ],
        OpKind::Payload { node, .. } => vec![(*node, Action::WritePayload)],
        OpKind::Delete { node } => vec![(*node, Action::Delete)],
        OpKind::Tombstone { node } => vec![(*node, Action::Tombstone)],
    }
}

/// Walks the parent chain to decide whether `node` lies in `scope`.
pub fn evaluate_scope(tree: &Tree, node: NodeId, scope: &Scope) -> Decision {
    let mut seen = FnvHashSet::default();
    let mut depth = 0u32;
    let mut cur = node;
    loop {
        if scope.exclude.contains(&cur) {
            return Decision::Deny;
        }
        if cur == scope.root {
            return match scope.max_depth {
                Some(max) if depth > max => Decision::Deny,
                _ => Decision::Allow,
            };
        }
        if cur.is_reserved() {
            // Hit a chain terminator without passing the scope root.
            return Decision::Deny;
        }
        if !seen.insert(cur) {
            return Decision::Deny;
        }
        match tree.parent_link(cur) {
            ParentLink::Known(parent) => {
                cur = parent;
                depth += 1;
            }
            ParentLink::Unknown => return Decision::Unknown,
        }
    }
}

/// Holds verified tokens and applies the policy to signed ops.
pub struct Authorizer {
    doc_id: String,
    policy: Policy,
    tokens: BTreeMap<TokenRef, CapabilityToken>,
}

impl Authorizer {
    pub fn new(doc_id: impl Into<String>, policy: Policy) -> Self {
        Self {
            doc_id: doc_id.into(),
            policy,
            tokens: Default::default(),
        }
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    /// Verifies and stores a capability token received out of band (hello,
    /// or inline with an op). Rejects tokens for other documents and tokens
    /// from untrusted issuers.
    pub fn add_token(&mut self, bytes: &[u8]) -> Result<TokenRef> {
        let token = CapabilityToken::decode(bytes)?;
        if token.doc_id != self.doc_id {
            bail!("token audience {:?} is not this doc", token.doc_id);
        }
        if let Policy::Capabilities {
            trusted_issuers, ..
        } = &self.policy
        {
            if !trusted_issuers.contains(&token.issuer) {
                bail!("token issuer {:?} is not trusted", token.issuer);
            }
        }
        let token_ref = token.token_ref;
        self.tokens.insert(token_ref, token);
        Ok(token_ref)
    }

    /// Stores a token carried inline with an op, if any. Failures here are
    /// not fatal; the op will simply fail authorization.
    pub fn admit_proof(&mut self, signed: &SignedOp) {
        if let Proof::Token(bytes) = &signed.proof {
            if let Err(err) = self.add_token(bytes) {
                tracing::debug!("inline token rejected: {}", err);
            }
        }
    }

    pub fn tokens(&self) -> impl Iterator<Item = &CapabilityToken> {
        self.tokens.values()
    }

    /// Runs the required-actions table against the op's proof material.
    ///
    /// The signature must already have been checked.
    pub fn authorize(&self, tree: &Tree, signed: &SignedOp) -> Verdict {
        let Policy::Capabilities {
            require_proof_ref, ..
        } = &self.policy
        else {
            return Verdict::Allow;
        };

        let replica = signed.op.replica();
        let candidates: Vec<&CapabilityToken> = match &signed.proof {
            Proof::Ref(token_ref) => match self.tokens.get(token_ref) {
                Some(token) if token.subject == replica => vec![token],
                Some(_) => {
                    return Verdict::Deny("proof token bound to another subject".into())
                }
                None => return Verdict::Deny("unknown proof reference".into()),
            },
            Proof::Token(bytes) => {
                if *require_proof_ref {
                    return Verdict::Deny("proof reference required".into());
                }
                // `admit_proof` has stored it if it verified.
                match self.tokens.get(&TokenRef::derive(bytes)) {
                    Some(token) if token.subject == replica => vec![token],
                    _ => return Verdict::Deny("inline token did not verify".into()),
                }
            }
            Proof::None => {
                if *require_proof_ref {
                    return Verdict::Deny("proof reference required".into());
                }
                self.tokens
                    .values()
                    .filter(|t| t.subject == replica)
                    .collect()
            }
        };
        if candidates.is_empty() {
            return Verdict::Deny(format!("no capability for {:?}", replica));
        }

        let mut pending = false;
        for (node, action) in required_actions(&signed.op) {
            // OR across capabilities for one node, AND across nodes.
            let mut node_decision = Decision::Deny;
            for token in &candidates {
                for cap in &token.caps {
                    if !cap.grants(action) {
                        continue;
                    }
                    match evaluate_scope(tree, node, &cap.scope) {
                        Decision::Allow => {
                            node_decision = Decision::Allow;
                            break;
                        }
                        Decision::Unknown => {
                            if node_decision == Decision::Deny {
                                node_decision = Decision::Unknown;
                            }
                        }
                        Decision::Deny => {}
                    }
                }
                if node_decision == Decision::Allow {
                    break;
                }
            }
            match node_decision {
                Decision::Allow => {}
                Decision::Unknown => pending = true,
                Decision::Deny => {
                    return Verdict::Deny(format!(
                        "{} not granted at {:?}",
                        action.as_str(),
                        node
                    ))
                }
            }
        }
        if pending {
            Verdict::Unknown("missing_context".into())
        } else {
            Verdict::Allow
        }
    }
}

impl std::fmt::Debug for Authorizer {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Authorizer")
            .field("doc_id", &self.doc_id)
            .field("tokens", &self.tokens.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Keypair;
    use crate::op::Op;
    use crate::order_key::OrderKey;
    use crate::token::Capability;
    use smallvec::smallvec;

    fn node(b: u8) -> NodeId {
        NodeId::new([b; 16])
    }

    fn key(d: u16) -> OrderKey {
        OrderKey::new(smallvec![d])
    }

    fn tree_with(ops: &mut Vec<Op>) -> Tree {
        ops.sort_by_key(|op| op.sort_key());
        Tree::build("doc", ops.iter())
    }

    fn base_tree(writer: ReplicaId) -> Tree {
        // ROOT -> 1 -> 2 -> 3, plus ROOT -> 9.
        let mut ops = vec![
            Op::insert(writer, 1, 1, NodeId::ROOT, node(1), key(10), None),
            Op::insert(writer, 2, 2, node(1), node(2), key(10), None),
            Op::insert(writer, 3, 3, node(2), node(3), key(10), None),
            Op::insert(writer, 4, 4, NodeId::ROOT, node(9), key(20), None),
        ];
        tree_with(&mut ops)
    }

    #[test]
    fn scope_walks_the_chain() {
        let writer = Keypair::generate().replica_id();
        let tree = base_tree(writer);
        let scope = Scope::subtree("doc", node(1));
        assert_eq!(evaluate_scope(&tree, node(1), &scope), Decision::Allow);
        assert_eq!(evaluate_scope(&tree, node(3), &scope), Decision::Allow);
        assert_eq!(evaluate_scope(&tree, node(9), &scope), Decision::Deny);
        assert_eq!(evaluate_scope(&tree, NodeId::ROOT, &scope), Decision::Deny);
    }

    #[test]
    fn scope_depth_and_exclusions() {
        let writer = Keypair::generate().replica_id();
        let tree = base_tree(writer);
        let mut scope = Scope::subtree("doc", node(1));
        scope.max_depth = Some(1);
        assert_eq!(evaluate_scope(&tree, node(2), &scope), Decision::Allow);
        assert_eq!(evaluate_scope(&tree, node(3), &scope), Decision::Deny);
        let mut scope = Scope::subtree("doc", node(1));
        scope.exclude = vec![node(2)];
        assert_eq!(evaluate_scope(&tree, node(2), &scope), Decision::Deny);
        assert_eq!(evaluate_scope(&tree, node(3), &scope), Decision::Deny);
    }

    #[test]
    fn scope_is_unknown_without_the_chain() {
        let writer = Keypair::generate().replica_id();
        // Node 5 is only known from a payload op; no parent chain.
        let mut ops = vec![Op::payload(writer, 1, 1, node(5), Some(vec![1]))];
        let tree = tree_with(&mut ops);
        let scope = Scope::subtree("doc", node(1));
        assert_eq!(evaluate_scope(&tree, node(5), &scope), Decision::Unknown);
    }

    #[test]
    fn required_actions_table() {
        let writer = Keypair::generate().replica_id();
        let insert = Op::insert(writer, 1, 1, node(1), node(2), key(5), None);
        assert_eq!(
            required_actions(&insert),
            vec![(node(1), Action::WriteStructure)]
        );
        let insert_p = Op::insert(writer, 1, 1, node(1), node(2), key(5), Some(vec![1]));
        assert_eq!(
            required_actions(&insert_p),
            vec![
                (node(1), Action::WriteStructure),
                (node(1), Action::WritePayload)
            ]
        );
        let mv = Op::move_node(writer, 2, 2, node(2), node(3), key(5));
        assert_eq!(
            required_actions(&mv),
            vec![
                (node(2), Action::WriteStructure),
                (node(3), Action::WriteStructure)
            ]
        );
        let del = Op::delete(writer, 3, 3, node(2), None);
        assert_eq!(required_actions(&del), vec![(node(2), Action::Delete)]);
    }

    fn capability_setup(
        actions: &[Action],
        scope_root: NodeId,
    ) -> (Authorizer, Keypair, Tree) {
        let issuer = Keypair::generate();
        let subject = Keypair::generate();
        let tree = base_tree(subject.replica_id());
        let caps = vec![Capability::new(
            Scope::subtree("doc", scope_root),
            actions.iter().copied(),
        )];
        let bytes =
            CapabilityToken::issue(issuer, subject.replica_id(), "doc", &caps).unwrap();
        let mut auth = Authorizer::new(
            "doc",
            Policy::Capabilities {
                trusted_issuers: [issuer.replica_id()].into_iter().collect(),
                require_proof_ref: false,
            },
        );
        auth.add_token(&bytes).unwrap();
        (auth, subject, tree)
    }

    #[test]
    fn allows_scoped_writes() {
        let (auth, subject, tree) = capability_setup(
            &[Action::WriteStructure, Action::WritePayload],
            node(1),
        );
        let op = Op::insert(subject.replica_id(), 5, 5, node(2), node(7), key(3), None);
        let signed = SignedOp::sign(subject, "doc", op, Proof::None).unwrap();
        assert_eq!(auth.authorize(&tree, &signed), Verdict::Allow);
    }

    #[test]
    fn denies_out_of_scope_writes() {
        let (auth, subject, tree) =
            capability_setup(&[Action::WriteStructure], node(1));
        let op = Op::insert(subject.replica_id(), 5, 5, node(9), node(7), key(3), None);
        let signed = SignedOp::sign(subject, "doc", op, Proof::None).unwrap();
        assert!(matches!(auth.authorize(&tree, &signed), Verdict::Deny(_)));
    }

    #[test]
    fn denies_missing_action() {
        let (auth, subject, tree) =
            capability_setup(&[Action::WriteStructure], node(1));
        let op = Op::payload(subject.replica_id(), 5, 5, node(2), Some(vec![1]));
        let signed = SignedOp::sign(subject, "doc", op, Proof::None).unwrap();
        assert!(matches!(auth.authorize(&tree, &signed), Verdict::Deny(_)));
    }

    #[test]
    fn unknown_when_chain_is_missing() {
        let (auth, subject, _) =
            capability_setup(&[Action::WritePayload], node(1));
        // Target node is not in the local tree at all.
        let tree = Tree::default();
        let op = Op::payload(subject.replica_id(), 5, 5, node(42), Some(vec![1]));
        let signed = SignedOp::sign(subject, "doc", op, Proof::None).unwrap();
        assert!(matches!(auth.authorize(&tree, &signed), Verdict::Unknown(_)));
    }

    #[test]
    fn untrusted_issuer_rejected() {
        let issuer = Keypair::generate();
        let rogue = Keypair::generate();
        let subject = Keypair::generate();
        let caps = vec![Capability::new(
            Scope::subtree("doc", NodeId::ROOT),
            [Action::WriteStructure],
        )];
        let bytes = CapabilityToken::issue(rogue, subject.replica_id(), "doc", &caps).unwrap();
        let mut auth = Authorizer::new(
            "doc",
            Policy::Capabilities {
                trusted_issuers: [issuer.replica_id()].into_iter().collect(),
                require_proof_ref: false,
            },
        );
        assert!(auth.add_token(&bytes).is_err());
    }

    #[test]
    fn proof_ref_mode() {
        let issuer = Keypair::generate();
        let subject = Keypair::generate();
        let tree = base_tree(subject.replica_id());
        let caps = vec![Capability::new(
            Scope::subtree("doc", node(1)),
            [Action::WriteStructure],
        )];
        let bytes =
            CapabilityToken::issue(issuer, subject.replica_id(), "doc", &caps).unwrap();
        let mut auth = Authorizer::new(
            "doc",
            Policy::Capabilities {
                trusted_issuers: [issuer.replica_id()].into_iter().collect(),
                require_proof_ref: true,
            },
        );
        let token_ref = auth.add_token(&bytes).unwrap();

        let op = Op::insert(subject.replica_id(), 5, 5, node(2), node(7), key(3), None);
        // No proof reference: denied outright.
        let signed = SignedOp::sign(subject, "doc", op.clone(), Proof::None).unwrap();
        assert!(matches!(auth.authorize(&tree, &signed), Verdict::Deny(_)));
        // The known reference authorizes.
        let signed =
            SignedOp::sign(subject, "doc", op.clone(), Proof::Ref(token_ref)).unwrap();
        assert_eq!(auth.authorize(&tree, &signed), Verdict::Allow);
        // An unknown reference is a deny, not a pending op.
        let signed =
            SignedOp::sign(subject, "doc", op, Proof::Ref(TokenRef::new([9; 16]))).unwrap();
        assert!(matches!(auth.authorize(&tree, &signed), Verdict::Deny(_)));
    }
}
