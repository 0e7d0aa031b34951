//! Per-document sessions.
//!
//! A [`Registry`] hands out reference-counted handles to a shared engine per
//! doc id. The engine itself is synchronous; the session serializes every
//! mutation through a FIFO apply queue so peer batches and local mints never
//! interleave with a materialization pass. Readers see the state between
//! batches.
use anyhow::{bail, Result};
use arbor_crdt::{
    ApplyReport, Engine, EngineConfig, Keypair, NodeId, Placement, SignedOp,
};
use futures::channel::mpsc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Shared handle to one document's engine.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    engine: Mutex<Engine>,
    apply_queue: futures::lock::Mutex<()>,
}

impl Session {
    pub fn new(engine: Engine) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                engine: Mutex::new(engine),
                apply_queue: futures::lock::Mutex::new(()),
            }),
        }
    }

    pub fn doc_id(&self) -> String {
        self.inner.engine.lock().doc_id().to_string()
    }

    /// Read access; the snapshot is consistent between apply batches.
    pub fn with<R>(&self, f: impl FnOnce(&Engine) -> R) -> R {
        f(&self.inner.engine.lock())
    }

    /// Mutating access outside the op path (token registration and the
    /// like). Op application goes through [`Session::apply_ops`].
    pub fn with_mut<R>(&self, f: impl FnOnce(&mut Engine) -> R) -> R {
        f(&mut self.inner.engine.lock())
    }

    /// Applies a batch through the FIFO apply queue.
    pub async fn apply_ops(&self, ops: Vec<SignedOp>) -> ApplyReport {
        let _serial = self.inner.apply_queue.lock().await;
        self.inner.engine.lock().apply_ops(ops)
    }

    /// Signed-op stream of every future apply batch; drives
    /// subscription flushes on attached peers.
    pub fn subscribe_applies(&self) -> mpsc::UnboundedReceiver<Vec<SignedOp>> {
        self.inner.engine.lock().subscribe_applies()
    }

    pub async fn local_insert(
        &self,
        key: Keypair,
        parent: NodeId,
        node: NodeId,
        placement: Placement,
        payload: Option<Vec<u8>>,
    ) -> Result<SignedOp> {
        let _serial = self.inner.apply_queue.lock().await;
        self.inner
            .engine
            .lock()
            .local_insert(key, parent, node, placement, payload)
    }

    pub async fn local_move(
        &self,
        key: Keypair,
        node: NodeId,
        new_parent: NodeId,
        placement: Placement,
    ) -> Result<SignedOp> {
        let _serial = self.inner.apply_queue.lock().await;
        self.inner
            .engine
            .lock()
            .local_move(key, node, new_parent, placement)
    }

    pub async fn local_payload(
        &self,
        key: Keypair,
        node: NodeId,
        payload: Option<Vec<u8>>,
    ) -> Result<SignedOp> {
        let _serial = self.inner.apply_queue.lock().await;
        self.inner.engine.lock().local_payload(key, node, payload)
    }

    pub async fn local_delete(&self, key: Keypair, node: NodeId) -> Result<SignedOp> {
        let _serial = self.inner.apply_queue.lock().await;
        self.inner.engine.lock().local_delete(key, node)
    }

    pub async fn local_tombstone(&self, key: Keypair, node: NodeId) -> Result<SignedOp> {
        let _serial = self.inner.apply_queue.lock().await;
        self.inner.engine.lock().local_tombstone(key, node)
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        self.inner.engine.lock().fmt(f)
    }
}

#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// How long a doc with zero connections stays open.
    pub idle_close: Duration,
    pub engine: EngineConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_close: Duration::from_secs(30),
            engine: EngineConfig::default(),
        }
    }
}

impl SessionConfig {
    /// Reads `ARBOR_IDLE_CLOSE_MS` and `ARBOR_MAX_PAYLOAD_BYTES`.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(ms) = env_u64("ARBOR_IDLE_CLOSE_MS") {
            config.idle_close = Duration::from_millis(ms);
        }
        if let Some(bytes) = env_u64("ARBOR_MAX_PAYLOAD_BYTES") {
            config.engine.max_payload_bytes = bytes as usize;
        }
        config
    }
}

fn env_u64(key: &str) -> Option<u64> {
    match std::env::var(key) {
        Ok(value) => match value.parse() {
            Ok(parsed) => Some(parsed),
            Err(_) => {
                tracing::error!("ignoring unparseable {}={:?}", key, value);
                None
            }
        },
        Err(_) => None,
    }
}

struct DocEntry {
    session: Session,
    refs: usize,
    /// Bumped on every open; lets a stale idle timer recognize that the doc
    /// was reopened in the meantime.
    epoch: u64,
}

/// Multiplexes connections onto per-doc engines with idle close.
#[derive(Clone)]
pub struct Registry {
    docs: Arc<Mutex<HashMap<String, DocEntry>>>,
    config: SessionConfig,
}

impl Registry {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            docs: Arc::new(Mutex::new(HashMap::new())),
            config,
        }
    }

    /// Attaches a connection to the doc's shared engine, creating it on
    /// first open. Concurrent opens coalesce onto the same engine.
    pub fn open(&self, doc_id: &str) -> Result<DocGuard> {
        if doc_id.is_empty() {
            bail!("failed to open doc: empty doc id");
        }
        let mut docs = self.docs.lock();
        let entry = docs.entry(doc_id.to_string()).or_insert_with(|| {
            tracing::debug!("opening engine for {:?}", doc_id);
            DocEntry {
                session: Session::new(Engine::new(doc_id, self.config.engine.clone())),
                refs: 0,
                epoch: 0,
            }
        });
        entry.refs += 1;
        entry.epoch += 1;
        Ok(DocGuard {
            registry: self.clone(),
            doc_id: doc_id.to_string(),
            session: entry.session.clone(),
        })
    }

    pub fn is_open(&self, doc_id: &str) -> bool {
        self.docs.lock().contains_key(doc_id)
    }

    pub fn connections(&self, doc_id: &str) -> usize {
        self.docs.lock().get(doc_id).map(|e| e.refs).unwrap_or(0)
    }

    fn release(&self, doc_id: &str) {
        let epoch = {
            let mut docs = self.docs.lock();
            let Some(entry) = docs.get_mut(doc_id) else {
                return;
            };
            entry.refs = entry.refs.saturating_sub(1);
            if entry.refs > 0 {
                return;
            }
            entry.epoch
        };
        let registry = self.clone();
        let doc_id = doc_id.to_string();
        let idle = self.config.idle_close;
        async_std::task::spawn(async move {
            async_std::task::sleep(idle).await;
            let mut docs = registry.docs.lock();
            if let Some(entry) = docs.get(&doc_id) {
                if entry.refs == 0 && entry.epoch == epoch {
                    tracing::debug!("idle close of {:?}", doc_id);
                    docs.remove(&doc_id);
                }
            }
        });
    }
}

/// A counted attachment to a doc session. Dropping it releases the
/// reference and arms the idle-close timer at zero.
pub struct DocGuard {
    registry: Registry,
    doc_id: String,
    session: Session,
}

impl DocGuard {
    pub fn session(&self) -> &Session {
        &self.session
    }
}

impl std::ops::Deref for DocGuard {
    type Target = Session;

    fn deref(&self) -> &Session {
        &self.session
    }
}

impl Drop for DocGuard {
    fn drop(&mut self) {
        self.registry.release(&self.doc_id);
    }
}
