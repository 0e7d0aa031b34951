//! The per-connection sync peer.
//!
//! A peer is a sans-IO state machine: [`Peer::handle`] consumes one inbound
//! message and yields the outbound replies, and a thin pump drives it
//! against a transport. Receives are serialized per peer; every send
//! suspends until the transport accepts the frame, which is the whole of the
//! backpressure story. At most one ops batch is in flight per filter, since
//! batches are only produced in response to the previous message for that
//! filter.
//!
//! The initiator proposes filters and decodes codewords; the responder
//! encodes. After reconciliation the initiator may subscribe, turning the
//! responder into a push stream gated on engine apply notifications.
use crate::codec::{
    BinCodec, Codec, ErrorCode, ErrorMsg, Hello, HelloAck, OpsBatch, Payload, RibltCodewords,
    RibltOutcome, RibltStatus, Subscribe, SubscribeAck, SyncMessage, Unsubscribe,
};
use crate::riblt::{Decoder, Encoder};
use crate::session::Session;
use crate::transport::{FrameSink, Transport};
use anyhow::{bail, Result};
use arbor_crdt::{ApplyErrorKind, Filter, Lamport, OpRef, SignedOp};
use fnv::FnvHashMap;
use futures::prelude::*;
use std::sync::Arc;

#[derive(Clone, Debug)]
pub struct SyncConfig {
    /// Codewords per `ribltCodewords` message.
    pub codewords_per_message: usize,
    /// Ops per `opsBatch` message.
    pub max_ops_per_batch: usize,
    /// Decoder budget before falling back to a full-set exchange.
    pub max_codewords: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            codewords_per_message: 64,
            max_ops_per_batch: 128,
            max_codewords: 4096,
        }
    }
}

/// Counters for tests and logs.
#[derive(Clone, Copy, Debug, Default)]
pub struct PeerStats {
    pub codewords_sent: u64,
    pub codewords_received: u64,
    pub ops_sent: u64,
    pub ops_received: u64,
    pub filters_synced: u64,
    pub filters_failed: u64,
}

enum Role {
    Initiator {
        filters: Vec<Filter>,
        subscribe: bool,
    },
    Responder,
}

/// Initiator-side filter progression.
enum InitFilter {
    WaitAck,
    Decoding(Decoder),
    /// Status and our ops are out; waiting for the remote's final batch.
    AwaitingOps,
    Done,
}

/// Responder-side filter progression.
enum RespFilter {
    Encoding(Encoder),
    Done,
}

struct SubOut {
    filter: Filter,
    filter_id: u32,
    last_sent: Lamport,
}

pub struct Peer {
    session: Session,
    doc_id: String,
    codec: Arc<dyn Codec>,
    config: SyncConfig,
    role: Role,
    init_filters: FnvHashMap<u32, (Filter, InitFilter)>,
    resp_filters: FnvHashMap<u32, (Filter, RespFilter)>,
    subs_out: FnvHashMap<u32, SubOut>,
    subs_in: FnvHashMap<u32, (u32, Option<Lamport>)>,
    next_sub_id: u32,
    subs_requested: bool,
    failed: Option<String>,
    stats: PeerStats,
}

impl Peer {
    /// A dialing peer that reconciles `filters` and optionally stays
    /// subscribed afterwards.
    pub fn initiator(session: Session, filters: Vec<Filter>, config: SyncConfig) -> Self {
        let doc_id = session.doc_id();
        Self::new(
            session,
            doc_id,
            config,
            Role::Initiator {
                filters,
                subscribe: false,
            },
        )
    }

    /// The accepting side of a connection.
    pub fn responder(session: Session, config: SyncConfig) -> Self {
        let doc_id = session.doc_id();
        Self::new(session, doc_id, config, Role::Responder)
    }

    fn new(session: Session, doc_id: String, config: SyncConfig, role: Role) -> Self {
        Self {
            session,
            doc_id,
            codec: Arc::new(BinCodec),
            config,
            role,
            init_filters: Default::default(),
            resp_filters: Default::default(),
            subs_out: Default::default(),
            subs_in: Default::default(),
            next_sub_id: 1,
            subs_requested: false,
            failed: None,
            stats: PeerStats::default(),
        }
    }

    /// Swaps the wire codec; the default is the binary codec.
    pub fn with_codec(mut self, codec: Arc<dyn Codec>) -> Self {
        self.codec = codec;
        self
    }

    /// Keep the connection open after reconciliation and stream matching
    /// ops as they land remotely.
    pub fn subscribing(mut self, subscribe: bool) -> Self {
        if let Role::Initiator { subscribe: s, .. } = &mut self.role {
            *s = subscribe;
        }
        self
    }

    pub fn stats(&self) -> PeerStats {
        self.stats
    }

    fn msg(&self, payload: Payload) -> SyncMessage {
        SyncMessage::new(self.doc_id.clone(), payload)
    }

    fn error_msg(&self, code: ErrorCode, message: impl Into<String>, filter_id: Option<u32>) -> SyncMessage {
        self.msg(Payload::Error(ErrorMsg {
            code,
            message: message.into(),
            filter_id,
        }))
    }

    /// Messages to send on attach, before anything is received.
    pub fn start(&mut self) -> Vec<SyncMessage> {
        match &self.role {
            Role::Initiator { filters, .. } => {
                let mut hello_filters = Vec::with_capacity(filters.len());
                for (i, filter) in filters.iter().enumerate() {
                    let id = i as u32 + 1;
                    hello_filters.push((id, *filter));
                    self.init_filters.insert(id, (*filter, InitFilter::WaitAck));
                }
                let (tokens, max_lamport) = self
                    .session
                    .with(|e| (e.token_bytes(), e.max_lamport()));
                vec![self.msg(Payload::Hello(Hello {
                    tokens,
                    filters: hello_filters,
                    max_lamport,
                }))]
            }
            Role::Responder => Vec::new(),
        }
    }

    /// True when a non-subscribing initiator has finished every filter.
    /// Consulted after each handled message, so the empty-filter case
    /// resolves right after the hello ack.
    pub fn finished(&self) -> bool {
        match &self.role {
            Role::Initiator { subscribe, .. } => {
                !*subscribe
                    && self
                        .init_filters
                        .values()
                        .all(|(_, state)| matches!(state, InitFilter::Done))
            }
            Role::Responder => false,
        }
    }

    pub fn failed(&self) -> Option<&str> {
        self.failed.as_deref()
    }

    /// Runs one inbound message through the state machine.
    pub async fn handle(&mut self, msg: SyncMessage) -> Result<Vec<SyncMessage>> {
        if msg.version != crate::codec::WIRE_VERSION {
            self.failed = Some(format!("wire version {}", msg.version));
            return Ok(vec![self.error_msg(
                ErrorCode::VersionSkew,
                format!("unsupported wire version {}", msg.version),
                None,
            )]);
        }
        if msg.doc_id != self.doc_id {
            self.failed = Some(format!("message for foreign doc {:?}", msg.doc_id));
            return Ok(vec![self.error_msg(
                ErrorCode::UnknownMessage,
                "message for a different doc",
                None,
            )]);
        }
        match msg.payload {
            Payload::Hello(hello) => self.on_hello(hello).await,
            Payload::HelloAck(ack) => self.on_hello_ack(ack),
            Payload::RibltCodewords(cw) => self.on_codewords(cw),
            Payload::RibltStatus(status) => self.on_status(status),
            Payload::OpsBatch(batch) => self.on_ops_batch(batch).await,
            Payload::Subscribe(sub) => self.on_subscribe(sub),
            Payload::SubscribeAck(ack) => self.on_subscribe_ack(ack),
            Payload::Unsubscribe(unsub) => self.on_unsubscribe(unsub),
            Payload::Error(err) => self.on_error(err),
        }
    }

    async fn on_hello(&mut self, hello: Hello) -> Result<Vec<SyncMessage>> {
        if !matches!(self.role, Role::Responder) {
            return Ok(self.protocol_failure("unexpected hello"));
        }
        tracing::debug!(
            "hello for {:?}: {} filters, head {}",
            self.doc_id,
            hello.filters.len(),
            hello.max_lamport
        );
        for token in &hello.tokens {
            if let Err(err) = self.session.with_mut(|e| e.add_token(token)) {
                tracing::debug!("hello token rejected: {}", err);
            }
        }
        let mut accepted = Vec::new();
        let mut rejected = Vec::new();
        for (id, filter) in hello.filters {
            if self.resp_filters.contains_key(&id) {
                rejected.push((id, ErrorCode::MalformedFilter));
                continue;
            }
            let refs = self.session.with(|e| e.list_op_refs(&filter));
            self.resp_filters
                .insert(id, (filter, RespFilter::Encoding(Encoder::new(refs))));
            accepted.push(id);
        }
        accepted.sort_unstable();
        let max_lamport = self.session.with(|e| e.max_lamport());
        let mut out = vec![self.msg(Payload::HelloAck(HelloAck {
            accepted: accepted.clone(),
            rejected,
            max_lamport,
        }))];
        for id in accepted {
            out.extend(self.emit_codewords(id));
        }
        Ok(out)
    }

    fn on_hello_ack(&mut self, ack: HelloAck) -> Result<Vec<SyncMessage>> {
        if !matches!(self.role, Role::Initiator { .. }) {
            return Ok(self.protocol_failure("unexpected helloAck"));
        }
        for (id, code) in &ack.rejected {
            tracing::error!("filter {} rejected: {:?}", id, code);
            if let Some((_, state)) = self.init_filters.get_mut(id) {
                *state = InitFilter::Done;
                self.stats.filters_failed += 1;
            }
        }
        for id in &ack.accepted {
            let Some((filter, state)) = self.init_filters.get_mut(id) else {
                return Ok(self.protocol_failure("ack for unknown filter"));
            };
            let refs = self.session.with(|e| e.list_op_refs(filter));
            *state = InitFilter::Decoding(Decoder::new(refs));
        }
        Ok(Vec::new())
    }

    /// Initiator: absorb a codeword batch and either ask for more, report
    /// the decoded difference, or give up and fall back to a full-set
    /// exchange.
    fn on_codewords(&mut self, cw: RibltCodewords) -> Result<Vec<SyncMessage>> {
        let filter_id = cw.filter_id;
        let Some((filter, state)) = self.init_filters.get_mut(&filter_id) else {
            return Ok(self.protocol_failure("codewords for unknown filter"));
        };
        let InitFilter::Decoding(decoder) = &mut *state else {
            // Stale batch after completion; nothing to do.
            return Ok(Vec::new());
        };
        self.stats.codewords_received += cw.codewords.len() as u64;
        decoder.absorb(&cw.codewords);

        if decoder.decoded() {
            let needs: Vec<OpRef> = decoder.remote_only().iter().copied().collect();
            let have: Vec<OpRef> = decoder.local_only().iter().copied().collect();
            tracing::debug!(
                "filter {} decoded after {} codewords: need {}, send {}",
                filter_id,
                decoder.received(),
                needs.len(),
                have.len()
            );
            *state = InitFilter::AwaitingOps;
            let mut out = vec![self.msg(Payload::RibltStatus(RibltStatus {
                filter_id,
                outcome: RibltOutcome::Decoded { needs },
            }))];
            out.extend(self.ops_batches(filter_id, &have)?);
            Ok(out)
        } else if decoder.received() >= self.config.max_codewords {
            tracing::error!(
                "filter {} failed to converge within {} codewords",
                filter_id,
                self.config.max_codewords
            );
            self.stats.filters_failed += 1;
            *state = InitFilter::AwaitingOps;
            let filter = *filter;
            let mut out = vec![
                self.error_msg(
                    ErrorCode::RibltFailed,
                    "codeword budget exhausted",
                    Some(filter_id),
                ),
                self.msg(Payload::RibltStatus(RibltStatus {
                    filter_id,
                    outcome: RibltOutcome::Failed {
                        reason: "codeword budget exhausted".into(),
                    },
                })),
            ];
            out.extend(self.full_set_batches(filter_id, &filter)?);
            Ok(out)
        } else {
            Ok(vec![self.msg(Payload::RibltStatus(RibltStatus {
                filter_id,
                outcome: RibltOutcome::Continue,
            }))])
        }
    }

    /// Responder: react to decoder progress.
    fn on_status(&mut self, status: RibltStatus) -> Result<Vec<SyncMessage>> {
        let filter_id = status.filter_id;
        if !self.resp_filters.contains_key(&filter_id) {
            return Ok(self.protocol_failure("status for unknown filter"));
        }
        match status.outcome {
            RibltOutcome::Continue => Ok(self.emit_codewords(filter_id)),
            RibltOutcome::Decoded { needs } => {
                if let Some((_, state)) = self.resp_filters.get_mut(&filter_id) {
                    *state = RespFilter::Done;
                }
                let out = self.ops_batches(filter_id, &needs)?;
                Ok(out)
            }
            RibltOutcome::Failed { reason } => {
                tracing::error!("filter {} reconciliation failed: {}", filter_id, reason);
                let filter = self.resp_filters[&filter_id].0;
                if let Some((_, state)) = self.resp_filters.get_mut(&filter_id) {
                    *state = RespFilter::Done;
                }
                self.full_set_batches(filter_id, &filter)
            }
        }
    }

    async fn on_ops_batch(&mut self, batch: OpsBatch) -> Result<Vec<SyncMessage>> {
        if batch.ops.len() > self.config.max_ops_per_batch {
            self.failed = Some("oversized ops batch".into());
            return Ok(vec![self.error_msg(
                ErrorCode::PayloadTooLarge,
                "oversized ops batch",
                Some(batch.filter_id),
            )]);
        }
        self.stats.ops_received += batch.ops.len() as u64;
        let report = self.session.apply_ops(batch.ops).await;
        let mut out = Vec::new();
        for err in &report.errors {
            // Per-op failures never stop the batch.
            tracing::debug!("op {} rejected: {}", err.opref, err.error);
            let code = match err.kind {
                ApplyErrorKind::Malformed => ErrorCode::MalformedOp,
                ApplyErrorKind::BadSignature => ErrorCode::BadSignature,
                ApplyErrorKind::Denied => ErrorCode::CapabilityDenied,
            };
            out.push(self.error_msg(code, err.error.clone(), Some(batch.filter_id)));
        }

        if batch.done {
            if let Some((_, state)) = self.init_filters.get_mut(&batch.filter_id) {
                if matches!(state, InitFilter::AwaitingOps) {
                    *state = InitFilter::Done;
                    self.stats.filters_synced += 1;
                }
            }
            out.extend(self.maybe_subscribe());
        }
        Ok(out)
    }

    /// Once every filter is reconciled, a subscribing initiator switches to
    /// live mode.
    fn maybe_subscribe(&mut self) -> Vec<SyncMessage> {
        let Role::Initiator { subscribe, .. } = &self.role else {
            return Vec::new();
        };
        if !*subscribe || self.subs_requested {
            return Vec::new();
        }
        let all_done = self
            .init_filters
            .values()
            .all(|(_, state)| matches!(state, InitFilter::Done));
        if !all_done {
            return Vec::new();
        }
        self.subs_requested = true;
        let filter_ids: Vec<u32> = {
            let mut ids: Vec<u32> = self.init_filters.keys().copied().collect();
            ids.sort_unstable();
            ids
        };
        let mut out = Vec::new();
        for filter_id in filter_ids {
            let sub_id = self.next_sub_id;
            self.next_sub_id += 1;
            self.subs_in.insert(sub_id, (filter_id, None));
            // An immediate pass closes the gap between the reconcile
            // finishing and the subscription being registered remotely.
            out.push(self.msg(Payload::Subscribe(Subscribe {
                sub_id,
                filter_id,
                immediate: true,
            })));
        }
        out
    }

    fn on_subscribe(&mut self, sub: Subscribe) -> Result<Vec<SyncMessage>> {
        if !matches!(self.role, Role::Responder) {
            return Ok(self.protocol_failure("unexpected subscribe"));
        }
        if self.subs_out.contains_key(&sub.sub_id) {
            return Ok(vec![self.error_msg(
                ErrorCode::DuplicateSubscription,
                format!("subscription {} already exists", sub.sub_id),
                Some(sub.filter_id),
            )]);
        }
        let Some((filter, _)) = self.resp_filters.get(&sub.filter_id) else {
            return Ok(vec![self.error_msg(
                ErrorCode::UnknownSubscription,
                format!("subscription for unknown filter {}", sub.filter_id),
                Some(sub.filter_id),
            )]);
        };
        let current_lamport = self.session.with(|e| e.max_lamport());
        let last_sent = if sub.immediate { 0 } else { current_lamport };
        self.subs_out.insert(
            sub.sub_id,
            SubOut {
                filter: *filter,
                filter_id: sub.filter_id,
                last_sent,
            },
        );
        // The ack is always observed before the first subscription batch.
        let mut out = vec![self.msg(Payload::SubscribeAck(SubscribeAck {
            sub_id: sub.sub_id,
            current_lamport,
        }))];
        if sub.immediate {
            out.extend(self.flush_subscriptions()?);
        }
        Ok(out)
    }

    fn on_subscribe_ack(&mut self, ack: SubscribeAck) -> Result<Vec<SyncMessage>> {
        match self.subs_in.get_mut(&ack.sub_id) {
            Some((_, lamport)) => {
                *lamport = Some(ack.current_lamport);
                Ok(Vec::new())
            }
            None => Ok(self.protocol_failure("ack for unknown subscription")),
        }
    }

    fn on_unsubscribe(&mut self, unsub: Unsubscribe) -> Result<Vec<SyncMessage>> {
        // Idempotent by design.
        self.subs_out.remove(&unsub.sub_id);
        Ok(Vec::new())
    }

    fn on_error(&mut self, err: ErrorMsg) -> Result<Vec<SyncMessage>> {
        tracing::error!(
            "peer error {:?} (filter {:?}): {}",
            err.code,
            err.filter_id,
            err.message
        );
        Ok(Vec::new())
    }

    /// Flushes matching new ops to every served subscription. Called after
    /// each local apply batch; the lamport watermark coalesces bursts.
    pub fn flush_subscriptions(&mut self) -> Result<Vec<SyncMessage>> {
        let mut out = Vec::new();
        let mut flushes: Vec<(u32, Vec<SignedOp>, Lamport)> = Vec::new();
        for sub in self.subs_out.values() {
            let ops = self
                .session
                .with(|e| e.ops_for_filter_since(&sub.filter, sub.last_sent));
            if ops.is_empty() {
                continue;
            }
            let newest = ops.iter().map(|s| s.op.lamport()).max().unwrap_or(0);
            flushes.push((sub.filter_id, ops, newest));
        }
        for (filter_id, ops, newest) in flushes {
            for sub in self.subs_out.values_mut() {
                if sub.filter_id == filter_id && newest > sub.last_sent {
                    sub.last_sent = newest;
                }
            }
            out.extend(self.chunk_ops(filter_id, ops));
        }
        Ok(out)
    }

    /// Ops batches for an explicit ref list; an unknown ref is a protocol
    /// violation by the remote.
    fn ops_batches(&mut self, filter_id: u32, refs: &[OpRef]) -> Result<Vec<SyncMessage>> {
        let ops = match self.session.with(|e| e.get_ops_by_op_refs(refs)) {
            Ok(ops) => ops,
            Err(err) => {
                self.failed = Some(err.to_string());
                return Ok(vec![self.error_msg(
                    ErrorCode::UnknownOpRef,
                    err.to_string(),
                    Some(filter_id),
                )]);
            }
        };
        Ok(self.chunk_ops(filter_id, ops))
    }

    /// Fallback exchange: ship everything matching the filter.
    fn full_set_batches(&mut self, filter_id: u32, filter: &Filter) -> Result<Vec<SyncMessage>> {
        let refs: Vec<OpRef> = self
            .session
            .with(|e| e.list_op_refs(filter))
            .into_iter()
            .collect();
        self.ops_batches(filter_id, &refs)
    }

    /// Splits ops into bounded batches in canonical order, flagging the
    /// last one.
    fn chunk_ops(&mut self, filter_id: u32, mut ops: Vec<SignedOp>) -> Vec<SyncMessage> {
        ops.sort_by_key(|signed| signed.op.sort_key());
        self.stats.ops_sent += ops.len() as u64;
        let mut out = Vec::new();
        if ops.is_empty() {
            out.push(self.msg(Payload::OpsBatch(OpsBatch {
                filter_id,
                ops: Vec::new(),
                done: true,
            })));
            return out;
        }
        let total = ops.len();
        let mut sent = 0;
        for chunk in ops.chunks(self.config.max_ops_per_batch) {
            sent += chunk.len();
            out.push(self.msg(Payload::OpsBatch(OpsBatch {
                filter_id,
                ops: chunk.to_vec(),
                done: sent == total,
            })));
        }
        out
    }

    /// Next codeword batch for a responder-side filter.
    fn emit_codewords(&mut self, filter_id: u32) -> Vec<SyncMessage> {
        let n = self.config.codewords_per_message;
        let Some((_, RespFilter::Encoding(encoder))) = self.resp_filters.get_mut(&filter_id)
        else {
            return Vec::new();
        };
        let codewords = encoder.emit(n);
        self.stats.codewords_sent += codewords.len() as u64;
        vec![self.msg(Payload::RibltCodewords(RibltCodewords {
            filter_id,
            codewords,
        }))]
    }

    /// Protocol violation: report and mark the peer failed.
    fn protocol_failure(&mut self, reason: &str) -> Vec<SyncMessage> {
        self.failed = Some(reason.to_string());
        vec![self.error_msg(ErrorCode::UnknownMessage, reason, None)]
    }

    /// Drives the peer against a transport until completion, remote close,
    /// or failure. Cleanup is idempotent; dropping the returned future
    /// cancels in-flight work at its next suspension point.
    pub async fn run<T: Transport>(mut self, transport: T) -> Result<PeerStats> {
        let (mut sink, stream) = transport.split();
        let mut stream = stream.fuse();
        let mut updates = self.session.subscribe_applies().fuse();

        let start = self.start();
        if self.send_all(&mut sink, start).await.is_err() {
            sink.close().await;
            return Ok(self.stats);
        }

        let result = loop {
            futures::select! {
                frame = stream.next() => {
                    let Some(bytes) = frame else {
                        break Ok(());
                    };
                    let out = match self.codec.decode(&bytes) {
                        Ok(msg) => self.handle(msg).await,
                        Err(err) => {
                            self.failed = Some(err.to_string());
                            Ok(vec![self.error_msg(
                                ErrorCode::UnknownMessage,
                                err.to_string(),
                                None,
                            )])
                        }
                    };
                    match out {
                        Ok(msgs) => {
                            if self.send_all(&mut sink, msgs).await.is_err() {
                                break Ok(());
                            }
                        }
                        Err(err) => break Err(err),
                    }
                    if let Some(reason) = &self.failed {
                        break Err(anyhow::anyhow!("peer failed: {}", reason));
                    }
                    if self.finished() {
                        break Ok(());
                    }
                }
                batch = updates.next() => {
                    if batch.is_none() {
                        break Ok(());
                    }
                    match self.flush_subscriptions() {
                        Ok(msgs) => {
                            if self.send_all(&mut sink, msgs).await.is_err() {
                                break Ok(());
                            }
                        }
                        Err(err) => break Err(err),
                    }
                }
            }
        };
        sink.close().await;
        result.map(|_| self.stats)
    }

    async fn send_all(
        &mut self,
        sink: &mut impl FrameSink,
        msgs: Vec<SyncMessage>,
    ) -> Result<()> {
        for msg in msgs {
            let bytes = self.codec.encode(&msg)?;
            if let Err(err) = sink.send(bytes).await {
                tracing::debug!("transport closed while sending: {}", err);
                bail!("transport closed");
            }
        }
        Ok(())
    }
}

/// Connects two sessions over an in-memory pair and reconciles the filters
/// once, returning both peers' stats.
pub async fn sync_once(
    a: &Session,
    b: &Session,
    filters: Vec<Filter>,
    config: SyncConfig,
) -> Result<(PeerStats, PeerStats)> {
    let (ta, tb) = crate::transport::pair(64);
    let initiator = Peer::initiator(a.clone(), filters, config.clone());
    let responder = Peer::responder(b.clone(), config);
    let (ra, rb) = futures::join!(initiator.run(ta), responder.run(tb));
    Ok((ra?, rb?))
}
