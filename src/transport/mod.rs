//! Transport abstraction for the connection layer.
//!
//! A [`Connector`] dials a framed link and returns its two halves: a [`Transport`]
//! for sending and a [`FrameSource`] for receiving. The socket layer wraps both
//! halves in Noise; the client owns one receive task per connection that reads
//! frames and drives the protocol.

mod backoff;
pub mod memory;

pub use backoff::Backoff;

use crate::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

/// Async trait for a connection transport (e.g. WebSocket, Noise over WebSocket).
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one frame.
    async fn send(&self, data: &[u8]) -> Result<()>;

    /// Close the transport. The peer's frame source then ends with `Disconnected`.
    async fn close(&self) -> Result<()>;
}

/// Receiving half of a link.
#[async_trait]
pub trait FrameSource: Send {
    /// Next inbound frame. Fails with `ConnectionError::Disconnected` once the link is gone.
    async fn next_frame(&mut self) -> Result<Vec<u8>>;
}

/// Dials raw framed links.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn dial(&self, url: &str) -> Result<(Arc<dyn Transport>, Box<dyn FrameSource>)>;
}

/// Connection lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    /// Noise handshake in progress.
    Handshaking,
    /// The server accepted our static key.
    Authenticated,
    /// The server confirmed the session with `<success>`.
    LoggedIn,
    Closing,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Authenticated | Self::LoggedIn)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Handshaking => "handshaking",
            Self::Authenticated => "authenticated",
            Self::LoggedIn => "logged-in",
            Self::Closing => "closing",
        };
        f.write_str(s)
    }
}

/// Connection state cell. Only the connection supervisor writes it; everything
/// else reads through [`ConnectionStateCell::get`] or a subscription.
#[derive(Debug)]
pub struct ConnectionStateCell {
    tx: watch::Sender<ConnectionState>,
}

impl Default for ConnectionStateCell {
    fn default() -> Self {
        Self {
            tx: watch::channel(ConnectionState::Disconnected).0,
        }
    }
}

impl ConnectionStateCell {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> ConnectionState {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.tx.subscribe()
    }

    pub(crate) fn set(&self, next: ConnectionState) {
        let prev = self.tx.send_replace(next);
        if prev != next {
            debug!(from = %prev, to = %next, "connection state");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn state_cell_notifies_subscribers() {
        let cell = ConnectionStateCell::new();
        let mut rx = cell.subscribe();
        assert_eq!(cell.get(), ConnectionState::Disconnected);
        cell.set(ConnectionState::Connecting);
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), ConnectionState::Connecting);
        assert!(!cell.get().is_connected());
        cell.set(ConnectionState::LoggedIn);
        assert!(cell.get().is_connected());
    }
}
