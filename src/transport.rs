//! The transport seam.
//!
//! Concrete network transports (websocket, broadcast channel) live outside
//! this crate; peers only need a framed, ordered, backpressured byte pipe.
//! The in-memory pair below is the canonical implementation for tests and
//! same-process replicas: its bounded channel makes `send` suspend until the
//! receiver drains, which is exactly the cooperative flush contract the
//! sync peer relies on.
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures::channel::mpsc;
use futures::prelude::*;

/// Inbound frames as a stream; `None`/termination means the remote closed.
pub trait FrameStream: Stream<Item = Vec<u8>> + Unpin + Send + 'static {}
impl<T: Stream<Item = Vec<u8>> + Unpin + Send + 'static> FrameStream for T {}

/// Outbound half of a connection. `send` resolves once the frame has been
/// accepted by the transport, which is the peer's backpressure point.
#[async_trait]
pub trait FrameSink: Send + 'static {
    async fn send(&mut self, frame: Vec<u8>) -> Result<()>;
    async fn close(&mut self);
}

/// A connected, framed duplex pipe.
pub trait Transport: Send + 'static {
    type Sink: FrameSink;
    type Stream: FrameStream;

    fn split(self) -> (Self::Sink, Self::Stream);
}

pub struct MemSink(mpsc::Sender<Vec<u8>>);

#[async_trait]
impl FrameSink for MemSink {
    async fn send(&mut self, frame: Vec<u8>) -> Result<()> {
        self.0
            .send(frame)
            .await
            .map_err(|_| anyhow!("transport closed"))
    }

    async fn close(&mut self) {
        self.0.close_channel();
    }
}

/// In-memory duplex transport.
pub struct MemTransport {
    tx: mpsc::Sender<Vec<u8>>,
    rx: mpsc::Receiver<Vec<u8>>,
}

impl Transport for MemTransport {
    type Sink = MemSink;
    type Stream = mpsc::Receiver<Vec<u8>>;

    fn split(self) -> (Self::Sink, Self::Stream) {
        (MemSink(self.tx), self.rx)
    }
}

/// Two connected ends. `capacity` bounds the number of in-flight frames per
/// direction before senders suspend.
pub fn pair(capacity: usize) -> (MemTransport, MemTransport) {
    let (atx, brx) = mpsc::channel(capacity);
    let (btx, arx) = mpsc::channel(capacity);
    (
        MemTransport { tx: atx, rx: arx },
        MemTransport { tx: btx, rx: brx },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[async_std::test]
    async fn frames_flow_both_ways() {
        let (a, b) = pair(4);
        let (mut atx, mut arx) = a.split();
        let (mut btx, mut brx) = b.split();
        atx.send(vec![1]).await.unwrap();
        btx.send(vec![2]).await.unwrap();
        assert_eq!(brx.next().await, Some(vec![1]));
        assert_eq!(arx.next().await, Some(vec![2]));
        atx.close().await;
        assert_eq!(brx.next().await, None);
    }

    #[async_std::test]
    async fn send_fails_after_receiver_drops() {
        let (a, b) = pair(1);
        let (mut atx, _arx) = a.split();
        drop(b);
        assert!(atx.send(vec![1]).await.is_err());
    }
}
