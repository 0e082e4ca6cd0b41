//! In-process links for tests and embedding: frame pipes and a connector that
//! hands the server end of every dialed link to the caller.

use super::{Connector, FrameSource, Transport};
use crate::error::{ConnectionError, Error};
use crate::Result;
use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// Sending half of an in-memory pipe.
#[derive(Debug)]
pub struct MemoryTransport {
    tx: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&self, data: &[u8]) -> Result<()> {
        let tx = self.tx.lock().unwrap_or_else(|e| e.into_inner());
        tx.as_ref()
            .ok_or(Error::Connection(ConnectionError::Disconnected))?
            .send(data.to_vec())
            .map_err(|_| Error::Connection(ConnectionError::Disconnected))
    }

    async fn close(&self) -> Result<()> {
        self.tx.lock().unwrap_or_else(|e| e.into_inner()).take();
        Ok(())
    }
}

/// Receiving half of an in-memory pipe.
#[derive(Debug)]
pub struct MemoryFrameSource {
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
}

#[async_trait]
impl FrameSource for MemoryFrameSource {
    async fn next_frame(&mut self) -> Result<Vec<u8>> {
        self.rx
            .recv()
            .await
            .ok_or(Error::Connection(ConnectionError::Disconnected))
    }
}

/// One end of a bidirectional link.
pub struct MemoryEnd {
    pub transport: Arc<MemoryTransport>,
    pub frames: MemoryFrameSource,
}

fn half() -> (MemoryTransport, MemoryFrameSource) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        MemoryTransport {
            tx: Mutex::new(Some(tx)),
        },
        MemoryFrameSource { rx },
    )
}

/// Two connected ends: frames sent on one arrive on the other.
pub fn pipe() -> (MemoryEnd, MemoryEnd) {
    let (a_tx, b_rx) = half();
    let (b_tx, a_rx) = half();
    (
        MemoryEnd {
            transport: Arc::new(a_tx),
            frames: a_rx,
        },
        MemoryEnd {
            transport: Arc::new(b_tx),
            frames: b_rx,
        },
    )
}

/// Server side of a dialed link.
pub struct Accepted {
    pub url: String,
    pub end: MemoryEnd,
}

/// Connector whose links terminate in-process.
pub struct MemoryConnector {
    accepted: mpsc::UnboundedSender<Accepted>,
    refuse: AtomicU32,
    dials: AtomicU32,
}

impl MemoryConnector {
    /// The receiver yields the server end of every successful dial.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Accepted>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                accepted: tx,
                refuse: AtomicU32::new(0),
                dials: AtomicU32::new(0),
            },
            rx,
        )
    }

    /// Fail the next `n` dials with a transient connection error.
    pub fn refuse_next(&self, n: u32) {
        self.refuse.store(n, Ordering::SeqCst);
    }

    /// Total dial attempts, refused ones included.
    pub fn dial_count(&self) -> u32 {
        self.dials.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn dial(&self, url: &str) -> Result<(Arc<dyn Transport>, Box<dyn FrameSource>)> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        let refused = self
            .refuse
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(ConnectionError::WebSocket("connection refused".into()).into());
        }
        let (client, server) = pipe();
        self.accepted
            .send(Accepted {
                url: url.to_string(),
                end: server,
            })
            .map_err(|_| ConnectionError::WebSocket("no listener".into()))?;
        Ok((client.transport, Box::new(client.frames)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pipe_delivers_in_order_and_closes() {
        let (a, mut b) = pipe();
        a.transport.send(b"one").await.unwrap();
        a.transport.send(b"two").await.unwrap();
        assert_eq!(b.frames.next_frame().await.unwrap(), b"one");
        assert_eq!(b.frames.next_frame().await.unwrap(), b"two");
        a.transport.close().await.unwrap();
        assert!(matches!(
            b.frames.next_frame().await,
            Err(Error::Connection(ConnectionError::Disconnected))
        ));
        assert!(a.transport.send(b"late").await.is_err());
    }

    #[tokio::test]
    async fn connector_refuses_then_accepts() {
        let (connector, mut accepted) = MemoryConnector::new();
        connector.refuse_next(1);
        let err = connector.dial("mem://x").await.err().unwrap();
        assert!(err.is_transient());

        let (tx, _rx) = connector.dial("mem://x").await.unwrap();
        let mut server = accepted.recv().await.unwrap();
        assert_eq!(server.url, "mem://x");
        tx.send(b"hi").await.unwrap();
        assert_eq!(server.end.frames.next_frame().await.unwrap(), b"hi");
        assert_eq!(connector.dial_count(), 2);
    }
}
