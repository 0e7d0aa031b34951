//! Capability tokens: COSE_Sign1 envelopes over CWT claims.
//!
//! A token binds a subject public key to a list of `action x subtree` grants
//! for one document. The envelope is `[protected, unprotected, payload, sig]`
//! with the signature computed over the standard `Signature1` structure, so
//! verification never needs to re-canonicalize the claims.
use crate::crypto::{verify, Keypair};
use crate::id::{NodeId, ReplicaId};
use anyhow::{anyhow, bail, Result};
use bytecheck::CheckBytes;
use rkyv::{Archive, Deserialize, Serialize};
use serde_cbor::Value;
use std::collections::{BTreeMap, BTreeSet};

const TOKEN_ID_DOMAIN: &[u8] = b"treecrdt/tokenid/v1";

// CWT claim keys.
const CLAIM_AUD: i128 = 3;
const CLAIM_CNF: i128 = 8;
const CLAIM_CAPS: i128 = -70000;

// COSE header parameters.
const HDR_ALG: i128 = 1;
const HDR_KID: i128 = 4;
const ALG_EDDSA: i128 = -8;

/// 16-byte identifier of a capability token.
#[derive(
    Clone, Copy, Eq, Hash, Ord, PartialEq, PartialOrd, Archive, CheckBytes, Deserialize, Serialize,
)]
#[archive(as = "TokenRef")]
#[repr(transparent)]
pub struct TokenRef([u8; 16]);

impl TokenRef {
    pub fn new(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Derives the token id from the exact envelope bytes.
    pub fn derive(token_bytes: &[u8]) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(TOKEN_ID_DOMAIN);
        hasher.update(token_bytes);
        let mut bytes = [0; 16];
        bytes.copy_from_slice(&hasher.finalize().as_bytes()[..16]);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl std::fmt::Debug for TokenRef {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", hex::encode(&self.0[0..4]))
    }
}

/// Grantable actions.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Action {
    ReadStructure,
    ReadPayload,
    WriteStructure,
    WritePayload,
    Delete,
    Tombstone,
    Grant,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ReadStructure => "read_structure",
            Self::ReadPayload => "read_payload",
            Self::WriteStructure => "write_structure",
            Self::WritePayload => "write_payload",
            Self::Delete => "delete",
            Self::Tombstone => "tombstone",
            Self::Grant => "grant",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        Ok(match s {
            "read_structure" => Self::ReadStructure,
            "read_payload" => Self::ReadPayload,
            "write_structure" => Self::WriteStructure,
            "write_payload" => Self::WritePayload,
            "delete" => Self::Delete,
            "tombstone" => Self::Tombstone,
            "grant" => Self::Grant,
            other => bail!("unknown action {:?}", other),
        })
    }

    /// Subsumption: every write-ish action implies `read_structure`;
    /// `write_payload` additionally implies `read_payload`.
    pub fn grants(&self, required: Action) -> bool {
        if *self == required {
            return true;
        }
        match required {
            Action::ReadStructure => matches!(
                self,
                Self::WriteStructure | Self::WritePayload | Self::Delete | Self::Tombstone
            ),
            Action::ReadPayload => matches!(self, Self::WritePayload),
            _ => false,
        }
    }
}

/// A subtree of one document: `root`, optionally depth-bounded, with
/// excluded subtrees carved out.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Scope {
    pub doc_id: String,
    pub root: NodeId,
    pub max_depth: Option<u32>,
    pub exclude: Vec<NodeId>,
}

impl Scope {
    pub fn subtree(doc_id: impl Into<String>, root: NodeId) -> Self {
        Self {
            doc_id: doc_id.into(),
            root,
            max_depth: None,
            exclude: Vec::new(),
        }
    }
}

/// One `action x subtree` grant.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Capability {
    pub scope: Scope,
    pub actions: BTreeSet<Action>,
}

impl Capability {
    pub fn new(scope: Scope, actions: impl IntoIterator<Item = Action>) -> Self {
        Self {
            scope,
            actions: actions.into_iter().collect(),
        }
    }

    pub fn grants(&self, required: Action) -> bool {
        self.actions.iter().any(|a| a.grants(required))
    }
}

/// A parsed, signature-checked capability token.
///
/// Whether the issuer is *trusted* is the authorizer's decision, not this
/// type's.
#[derive(Clone, Debug)]
pub struct CapabilityToken {
    pub issuer: ReplicaId,
    pub subject: ReplicaId,
    pub doc_id: String,
    pub caps: Vec<Capability>,
    pub token_ref: TokenRef,
    pub bytes: Vec<u8>,
}

impl CapabilityToken {
    /// Issues a token for `subject` over `doc_id`, signed by `issuer`.
    pub fn issue(
        issuer: Keypair,
        subject: ReplicaId,
        doc_id: &str,
        caps: &[Capability],
    ) -> Result<Vec<u8>> {
        for cap in caps {
            if cap.scope.doc_id != doc_id {
                bail!("capability scope for foreign doc {:?}", cap.scope.doc_id);
            }
        }
        let mut claims = BTreeMap::new();
        claims.insert(Value::Integer(CLAIM_AUD), Value::Text(doc_id.into()));
        let mut cnf = BTreeMap::new();
        cnf.insert(
            Value::Text("pub".into()),
            Value::Bytes(subject.as_bytes().to_vec()),
        );
        claims.insert(Value::Integer(CLAIM_CNF), Value::Map(cnf));
        claims.insert(
            Value::Integer(CLAIM_CAPS),
            Value::Array(caps.iter().map(cap_to_value).collect()),
        );
        let payload = serde_cbor::to_vec(&Value::Map(claims))?;

        let mut protected = BTreeMap::new();
        protected.insert(Value::Integer(HDR_ALG), Value::Integer(ALG_EDDSA));
        let protected = serde_cbor::to_vec(&Value::Map(protected))?;

        let sig = issuer.sign(&sig_structure(&protected, &payload)?);

        let mut unprotected = BTreeMap::new();
        unprotected.insert(
            Value::Integer(HDR_KID),
            Value::Bytes(issuer.replica_id().as_bytes().to_vec()),
        );
        let envelope = Value::Array(vec![
            Value::Bytes(protected),
            Value::Map(unprotected),
            Value::Bytes(payload),
            Value::Bytes(sig.to_vec()),
        ]);
        Ok(serde_cbor::to_vec(&envelope)?)
    }

    /// Parses an envelope and checks its issuer signature.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let envelope: Value = serde_cbor::from_slice(bytes)?;
        let parts = as_array(&envelope, "COSE_Sign1")?;
        if parts.len() != 4 {
            bail!("COSE_Sign1 has {} elements", parts.len());
        }
        let protected = as_bytes(&parts[0], "protected header")?;
        let header: Value = serde_cbor::from_slice(protected)?;
        let alg = map_get(&header, HDR_ALG, "alg")?;
        if !matches!(alg, Value::Integer(a) if *a == ALG_EDDSA) {
            bail!("unsupported token algorithm");
        }
        let issuer = {
            let kid = map_get(&parts[1], HDR_KID, "kid")?;
            replica_from(as_bytes(kid, "kid")?)?
        };
        let payload = as_bytes(&parts[2], "claims payload")?;
        let sig = as_bytes(&parts[3], "signature")?;
        if sig.len() != 64 {
            bail!("token signature length {}", sig.len());
        }
        let mut sig_arr = [0; 64];
        sig_arr.copy_from_slice(sig);
        verify(&issuer, &sig_structure(protected, payload)?, &sig_arr)?;

        let claims: Value = serde_cbor::from_slice(payload)?;
        let doc_id = match map_get(&claims, CLAIM_AUD, "aud")? {
            Value::Text(t) => t.clone(),
            _ => bail!("aud claim is not text"),
        };
        let subject = {
            let cnf = map_get(&claims, CLAIM_CNF, "cnf")?;
            let map = as_map(cnf, "cnf")?;
            let key = map
                .get(&Value::Text("pub".into()))
                .ok_or_else(|| anyhow!("cnf missing pub key"))?;
            replica_from(as_bytes(key, "cnf pub")?)?
        };
        let caps = as_array(map_get(&claims, CLAIM_CAPS, "caps")?, "caps")?
            .iter()
            .map(|v| cap_from_value(v, &doc_id))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            issuer,
            subject,
            doc_id,
            caps,
            token_ref: TokenRef::derive(bytes),
            bytes: bytes.to_vec(),
        })
    }
}

fn sig_structure(protected: &[u8], payload: &[u8]) -> Result<Vec<u8>> {
    let v = Value::Array(vec![
        Value::Text("Signature1".into()),
        Value::Bytes(protected.to_vec()),
        Value::Bytes(Vec::new()),
        Value::Bytes(payload.to_vec()),
    ]);
    Ok(serde_cbor::to_vec(&v)?)
}

fn cap_to_value(cap: &Capability) -> Value {
    let mut res = BTreeMap::new();
    res.insert(
        Value::Text("doc_id".into()),
        Value::Text(cap.scope.doc_id.clone()),
    );
    res.insert(
        Value::Text("root".into()),
        Value::Bytes(cap.scope.root.as_bytes().to_vec()),
    );
    if let Some(depth) = cap.scope.max_depth {
        res.insert(Value::Text("max_depth".into()), Value::Integer(depth as i128));
    }
    if !cap.scope.exclude.is_empty() {
        res.insert(
            Value::Text("exclude".into()),
            Value::Array(
                cap.scope
                    .exclude
                    .iter()
                    .map(|n| Value::Bytes(n.as_bytes().to_vec()))
                    .collect(),
            ),
        );
    }
    let mut out = BTreeMap::new();
    out.insert(Value::Text("res".into()), Value::Map(res));
    out.insert(
        Value::Text("actions".into()),
        Value::Array(
            cap.actions
                .iter()
                .map(|a| Value::Text(a.as_str().into()))
                .collect(),
        ),
    );
    Value::Map(out)
}

fn cap_from_value(v: &Value, doc_id: &str) -> Result<Capability> {
    let map = as_map(v, "capability")?;
    let res = as_map(
        map.get(&Value::Text("res".into()))
            .ok_or_else(|| anyhow!("capability missing res"))?,
        "res",
    )?;
    let scope_doc = match res.get(&Value::Text("doc_id".into())) {
        Some(Value::Text(t)) => t.clone(),
        _ => bail!("capability res missing doc_id"),
    };
    if scope_doc != doc_id {
        bail!("capability doc {:?} does not match audience", scope_doc);
    }
    let root = node_from(as_bytes(
        res.get(&Value::Text("root".into()))
            .ok_or_else(|| anyhow!("capability res missing root"))?,
        "root",
    )?)?;
    let max_depth = match res.get(&Value::Text("max_depth".into())) {
        None => None,
        Some(Value::Integer(d)) if *d >= 0 && *d <= u32::MAX as i128 => Some(*d as u32),
        Some(_) => bail!("bad max_depth"),
    };
    let exclude = match res.get(&Value::Text("exclude".into())) {
        None => Vec::new(),
        Some(v) => as_array(v, "exclude")?
            .iter()
            .map(|n| node_from(as_bytes(n, "exclude entry")?))
            .collect::<Result<Vec<_>>>()?,
    };
    let actions = as_array(
        map.get(&Value::Text("actions".into()))
            .ok_or_else(|| anyhow!("capability missing actions"))?,
        "actions",
    )?
    .iter()
    .map(|a| match a {
        Value::Text(t) => Action::parse(t),
        _ => bail!("action is not text"),
    })
    .collect::<Result<BTreeSet<_>>>()?;
    if actions.is_empty() {
        bail!("capability grants no actions");
    }
    Ok(Capability {
        scope: Scope {
            doc_id: scope_doc,
            root,
            max_depth,
            exclude,
        },
        actions,
    })
}

fn map_get<'a>(v: &'a Value, key: i128, what: &str) -> Result<&'a Value> {
    as_map(v, what)?
        .get(&Value::Integer(key))
        .ok_or_else(|| anyhow!("missing {} ({})", what, key))
}

fn as_map<'a>(v: &'a Value, what: &str) -> Result<&'a BTreeMap<Value, Value>> {
    match v {
        Value::Map(m) => Ok(m),
        _ => bail!("{} is not a map", what),
    }
}

fn as_array<'a>(v: &'a Value, what: &str) -> Result<&'a Vec<Value>> {
    match v {
        Value::Array(a) => Ok(a),
        _ => bail!("{} is not an array", what),
    }
}

fn as_bytes<'a>(v: &'a Value, what: &str) -> Result<&'a [u8]> {
    match v {
        Value::Bytes(b) => Ok(b),
        _ => bail!("{} is not a byte string", what),
    }
}

fn replica_from(bytes: &[u8]) -> Result<ReplicaId> {
    if bytes.len() != 32 {
        bail!("replica key length {}", bytes.len());
    }
    let mut id = [0; 32];
    id.copy_from_slice(bytes);
    Ok(ReplicaId::new(id))
}

fn node_from(bytes: &[u8]) -> Result<NodeId> {
    if bytes.len() != 16 {
        bail!("node id length {}", bytes.len());
    }
    let mut id = [0; 16];
    id.copy_from_slice(bytes);
    Ok(NodeId::new(id))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subtree_cap(doc: &str, root: NodeId, actions: &[Action]) -> Capability {
        Capability::new(Scope::subtree(doc, root), actions.iter().copied())
    }

    #[test]
    fn issue_and_decode_round_trip() {
        let issuer = Keypair::generate();
        let subject = Keypair::generate().replica_id();
        let root = NodeId::new([3; 16]);
        let caps = vec![subtree_cap(
            "doc",
            root,
            &[Action::WriteStructure, Action::WritePayload],
        )];
        let bytes = CapabilityToken::issue(issuer, subject, "doc", &caps).unwrap();
        let token = CapabilityToken::decode(&bytes).unwrap();
        assert_eq!(token.issuer, issuer.replica_id());
        assert_eq!(token.subject, subject);
        assert_eq!(token.doc_id, "doc");
        assert_eq!(token.caps, caps);
        assert_eq!(token.token_ref, TokenRef::derive(&bytes));
    }

    #[test]
    fn scope_options_survive() {
        let issuer = Keypair::generate();
        let subject = Keypair::generate().replica_id();
        let mut scope = Scope::subtree("doc", NodeId::new([3; 16]));
        scope.max_depth = Some(2);
        scope.exclude = vec![NodeId::new([4; 16])];
        let caps = vec![Capability::new(scope, [Action::Delete])];
        let bytes = CapabilityToken::issue(issuer, subject, "doc", &caps).unwrap();
        assert_eq!(CapabilityToken::decode(&bytes).unwrap().caps, caps);
    }

    #[test]
    fn tampered_token_rejected() {
        let issuer = Keypair::generate();
        let subject = Keypair::generate().replica_id();
        let caps = vec![subtree_cap("doc", NodeId::ROOT, &[Action::WriteStructure])];
        let mut bytes = CapabilityToken::issue(issuer, subject, "doc", &caps).unwrap();
        let at = bytes.len() / 2;
        bytes[at] ^= 0xff;
        assert!(CapabilityToken::decode(&bytes).is_err());
    }

    #[test]
    fn foreign_scope_rejected_at_issue() {
        let issuer = Keypair::generate();
        let subject = Keypair::generate().replica_id();
        let caps = vec![subtree_cap("other", NodeId::ROOT, &[Action::Delete])];
        assert!(CapabilityToken::issue(issuer, subject, "doc", &caps).is_err());
    }

    #[test]
    fn action_subsumption() {
        assert!(Action::WriteStructure.grants(Action::ReadStructure));
        assert!(Action::WritePayload.grants(Action::ReadStructure));
        assert!(Action::WritePayload.grants(Action::ReadPayload));
        assert!(Action::Delete.grants(Action::ReadStructure));
        assert!(Action::Tombstone.grants(Action::ReadStructure));
        assert!(!Action::WriteStructure.grants(Action::ReadPayload));
        assert!(!Action::ReadStructure.grants(Action::WriteStructure));
        assert!(!Action::Grant.grants(Action::ReadStructure));
    }
}
