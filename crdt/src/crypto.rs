use crate::id::ReplicaId;
use crate::op::Op;
use crate::token::TokenRef;
use anyhow::{anyhow, bail, Result};
use bytecheck::CheckBytes;
use ed25519_dalek::{PublicKey, SecretKey, Signature, Signer, Verifier};
use rkyv::{Archive, Deserialize, Serialize};

#[derive(Clone, Copy, Archive, Serialize, Deserialize)]
#[archive(as = "Keypair")]
#[repr(transparent)]
pub struct Keypair([u8; 32]);

impl Keypair {
    pub fn generate() -> Self {
        let mut secret = [0; 32];
        getrandom::getrandom(&mut secret).expect("os rng");
        Self(secret)
    }

    pub fn new(secret: [u8; 32]) -> Self {
        Self(secret)
    }

    fn to_keypair(self) -> ed25519_dalek::Keypair {
        let secret = SecretKey::from_bytes(&self.0).expect("32 byte secret");
        let public = PublicKey::from(&secret);
        ed25519_dalek::Keypair { secret, public }
    }

    pub fn replica_id(self) -> ReplicaId {
        ReplicaId::new(self.to_keypair().public.to_bytes())
    }

    pub fn sign(self, msg: &[u8]) -> [u8; 64] {
        self.to_keypair().sign(msg).to_bytes()
    }
}

impl From<Keypair> for [u8; 32] {
    fn from(keypair: Keypair) -> Self {
        keypair.0
    }
}

impl AsRef<[u8]> for Keypair {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "Keypair({:?})", self.replica_id())
    }
}

/// Verifies `sig` over `msg` against the replica id, which doubles as the
/// signer's public key.
pub fn verify(replica: &ReplicaId, msg: &[u8], sig: &[u8; 64]) -> Result<()> {
    let public = PublicKey::from_bytes(replica.as_bytes())
        .map_err(|_| anyhow!("replica id {:?} is not a valid public key", replica))?;
    let sig = Signature::from(*sig);
    public
        .verify(msg, &sig)
        .map_err(|_| anyhow!("bad signature from {:?}", replica))?;
    Ok(())
}

/// Capability material accompanying a signed operation.
#[derive(Clone, Debug, Eq, PartialEq, Archive, Deserialize, Serialize)]
#[archive_attr(derive(CheckBytes))]
#[repr(C)]
pub enum Proof {
    /// Authorization is decided from tokens the verifier already holds.
    None,
    /// Reference to a token the verifier is expected to possess.
    Ref(TokenRef),
    /// The token itself, for verifiers that have not seen it yet.
    Token(Vec<u8>),
}

/// An operation together with its author signature over the canonical
/// encoding. Immutable once stored.
#[derive(Clone, Debug, Eq, PartialEq, Archive, Deserialize, Serialize)]
#[archive_attr(derive(CheckBytes))]
#[repr(C)]
pub struct SignedOp {
    pub op: Op,
    pub sig: [u8; 64],
    pub proof: Proof,
}

impl SignedOp {
    pub fn sign(keypair: Keypair, doc_id: &str, op: Op, proof: Proof) -> Result<Self> {
        if op.replica() != keypair.replica_id() {
            bail!("op author {:?} does not match signing key", op.replica());
        }
        let sig = keypair.sign(&op.signing_bytes(doc_id));
        Ok(Self { op, sig, proof })
    }

    /// Checks the signature; the claimed replica id must be the key that
    /// produced it.
    pub fn verify(&self, doc_id: &str) -> Result<()> {
        verify(
            &self.op.replica(),
            &self.op.signing_bytes(doc_id),
            &self.sig,
        )
    }
}
