//! # arbor
//!
//! Replication plumbing for the [`arbor_crdt`] tree engine: a wire codec,
//! rateless set reconciliation, per-connection sync peers and per-document
//! sessions.
//!
//! A connection attaches a [`Peer`] to a [`Session`] obtained from the
//! [`Registry`]. The initiating peer sends a hello naming the filters it
//! cares about; the responder answers with a rateless codeword stream per
//! filter. Once the initiator has peeled the symmetric difference out of
//! the stream, both sides exchange exactly the ops the other is missing,
//! and the initiator can stay subscribed for live updates. Transports are
//! intentionally out of scope: anything that moves ordered frames works,
//! and the in-memory [`transport::pair`] is what tests and same-process
//! replicas use.
pub mod codec;
pub mod riblt;
pub mod session;
pub mod sync;
pub mod transport;

pub use arbor_crdt;

pub use crate::codec::{BinCodec, Codec, ErrorCode, Payload, SyncMessage};
pub use crate::riblt::{Codeword, Decoder, Encoder};
pub use crate::session::{DocGuard, Registry, Session, SessionConfig};
pub use crate::sync::{sync_once, Peer, PeerStats, SyncConfig};
pub use crate::transport::{pair, FrameSink, FrameStream, MemTransport, Transport};
