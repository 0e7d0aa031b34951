//! Wire messages and the pluggable codec seam.
//!
//! Every frame is one encoded [`SyncMessage`]; `payload` discriminates the
//! variant. Fixed-width values flow as raw byte strings: replica ids are 32
//! bytes, node ids and oprefs 16.
use crate::riblt::Codeword;
use anyhow::{anyhow, Result};
use arbor_crdt::{Filter, OpRef, SignedOp};
use bytecheck::CheckBytes;
use rkyv::ser::serializers::AllocSerializer;
use rkyv::ser::Serializer;
use rkyv::validation::validators::check_archived_root;
use rkyv::{Archive, Deserialize, Serialize};

/// Wire protocol version.
pub const WIRE_VERSION: u8 = 0;

/// Error taxonomy surfaced in `error` messages and hello rejections.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Archive, CheckBytes, Deserialize, Serialize)]
#[archive(as = "ErrorCode")]
#[repr(u8)]
pub enum ErrorCode {
    UnknownMessage,
    VersionSkew,
    DuplicateSubscription,
    UnknownSubscription,
    UnsupportedFilter,
    MalformedFilter,
    RibltFailed,
    BadSignature,
    CapabilityDenied,
    BackendOpenFailed,
    MalformedOp,
    UnknownOpRef,
    PayloadTooLarge,
}

#[derive(Clone, Debug, Eq, PartialEq, Archive, Deserialize, Serialize)]
#[archive_attr(derive(CheckBytes))]
#[repr(C)]
pub struct Hello {
    /// Capability token envelopes this peer wants the other side to know.
    pub tokens: Vec<Vec<u8>>,
    /// Proposed filters with caller-chosen ids.
    pub filters: Vec<(u32, Filter)>,
    pub max_lamport: u64,
}

#[derive(Clone, Debug, Eq, PartialEq, Archive, Deserialize, Serialize)]
#[archive_attr(derive(CheckBytes))]
#[repr(C)]
pub struct HelloAck {
    pub accepted: Vec<u32>,
    pub rejected: Vec<(u32, ErrorCode)>,
    pub max_lamport: u64,
}

#[derive(Clone, Debug, Eq, PartialEq, Archive, Deserialize, Serialize)]
#[archive_attr(derive(CheckBytes))]
#[repr(C)]
pub struct RibltCodewords {
    pub filter_id: u32,
    pub codewords: Vec<Codeword>,
}

/// Decoder-side progress report for one filter.
#[derive(Clone, Debug, Eq, PartialEq, Archive, Deserialize, Serialize)]
#[archive_attr(derive(CheckBytes))]
#[repr(C)]
pub enum RibltOutcome {
    /// Keep the codewords coming.
    Continue,
    /// Difference recovered; `needs` lists the oprefs this side is missing.
    Decoded { needs: Vec<OpRef> },
    /// Budget exhausted; fall back to a full-set exchange for the filter.
    Failed { reason: String },
}

#[derive(Clone, Debug, Eq, PartialEq, Archive, Deserialize, Serialize)]
#[archive_attr(derive(CheckBytes))]
#[repr(C)]
pub struct RibltStatus {
    pub filter_id: u32,
    pub outcome: RibltOutcome,
}

#[derive(Clone, Debug, Eq, PartialEq, Archive, Deserialize, Serialize)]
#[archive_attr(derive(CheckBytes))]
#[repr(C)]
pub struct OpsBatch {
    pub filter_id: u32,
    pub ops: Vec<SignedOp>,
    /// Last batch for this filter in the current exchange.
    pub done: bool,
}

#[derive(Clone, Debug, Eq, PartialEq, Archive, Deserialize, Serialize)]
#[archive_attr(derive(CheckBytes))]
#[repr(C)]
pub struct Subscribe {
    pub sub_id: u32,
    pub filter_id: u32,
    /// Request an initial pass over everything currently matching.
    pub immediate: bool,
}

#[derive(Clone, Debug, Eq, PartialEq, Archive, Deserialize, Serialize)]
#[archive_attr(derive(CheckBytes))]
#[repr(C)]
pub struct SubscribeAck {
    pub sub_id: u32,
    /// Responder's lamport head at ack time; every later streamed op is
    /// newer than what the subscriber had observed.
    pub current_lamport: u64,
}

#[derive(Clone, Debug, Eq, PartialEq, Archive, Deserialize, Serialize)]
#[archive_attr(derive(CheckBytes))]
#[repr(C)]
pub struct Unsubscribe {
    pub sub_id: u32,
}

#[derive(Clone, Debug, Eq, PartialEq, Archive, Deserialize, Serialize)]
#[archive_attr(derive(CheckBytes))]
#[repr(C)]
pub struct ErrorMsg {
    pub code: ErrorCode,
    pub message: String,
    pub filter_id: Option<u32>,
}

#[derive(Clone, Debug, Eq, PartialEq, Archive, Deserialize, Serialize)]
#[archive_attr(derive(CheckBytes))]
#[repr(C)]
pub enum Payload {
    Hello(Hello),
    HelloAck(HelloAck),
    RibltCodewords(RibltCodewords),
    RibltStatus(RibltStatus),
    OpsBatch(OpsBatch),
    Subscribe(Subscribe),
    SubscribeAck(SubscribeAck),
    Unsubscribe(Unsubscribe),
    Error(ErrorMsg),
}

#[derive(Clone, Debug, Eq, PartialEq, Archive, Deserialize, Serialize)]
#[archive_attr(derive(CheckBytes))]
#[repr(C)]
pub struct SyncMessage {
    pub version: u8,
    pub doc_id: String,
    pub payload: Payload,
}

impl SyncMessage {
    pub fn new(doc_id: impl Into<String>, payload: Payload) -> Self {
        Self {
            version: WIRE_VERSION,
            doc_id: doc_id.into(),
            payload,
        }
    }
}

/// Pluggable message codec.
pub trait Codec: Send + Sync + 'static {
    fn encode(&self, msg: &SyncMessage) -> Result<Vec<u8>>;
    fn decode(&self, bytes: &[u8]) -> Result<SyncMessage>;
}

/// The canonical binary codec: validated archives.
#[derive(Clone, Copy, Debug, Default)]
pub struct BinCodec;

impl Codec for BinCodec {
    fn encode(&self, msg: &SyncMessage) -> Result<Vec<u8>> {
        let mut ser = AllocSerializer::<1024>::default();
        ser.serialize_value(msg)
            .map_err(|err| anyhow!("encode: {}", err))?;
        Ok(ser.into_serializer().into_inner().to_vec())
    }

    fn decode(&self, bytes: &[u8]) -> Result<SyncMessage> {
        let archived = check_archived_root::<SyncMessage>(bytes)
            .map_err(|err| anyhow!("decode: {}", err))?;
        let msg: SyncMessage = archived
            .deserialize(&mut rkyv::Infallible)
            .map_err(|err| anyhow!("decode: {:?}", err))?;
        Ok(msg)
    }
}
