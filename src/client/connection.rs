//! Connection supervisor: dial, handshake, receive loop, keepalive and reconnect.

use super::{iq_node, server_jid, Client, ConnHandle};
use crate::binary::Node;
use crate::error::{ConnectFailureReason, ConnectionError, Error};
use crate::events::Event;
use crate::socket::{client_payload, run_client_handshake, NoiseRecv};
use crate::transport::{Backoff, ConnectionState, FrameSource, Transport};
use crate::Result;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// Why a connection ended, and what the supervisor does next.
#[derive(Debug)]
pub(crate) enum Exit {
    /// The client was closed.
    Closed,
    /// Server asked for a fresh connection (stream error 515, after pairing).
    Reconnect,
    /// Transient failure: reconnect with backoff.
    Lost(Error),
    /// Device revoked: fail everything, no reconnect.
    Revoked {
        reason: Option<ConnectFailureReason>,
        on_connect: bool,
    },
    /// Another client took over the session.
    Replaced,
    /// Stop without reconnecting and emit this event.
    Stopped(Event),
}

/// The receiving half of one live connection.
pub(super) struct Connection {
    frames: NoiseRecv,
    control: mpsc::UnboundedReceiver<Exit>,
}

impl Client {
    /// Connect and start the supervisor. Returns once the Noise handshake completed;
    /// pairing or login continues in the background and is reported through events.
    pub async fn connect(&self) -> Result<()> {
        let mut supervisor = self.inner.supervisor.lock().await;
        if supervisor.as_ref().is_some_and(|h| !h.is_finished()) {
            return Ok(());
        }
        self.inner.dispatcher.start();
        self.inner.shutdown.send_replace(false);
        let mut shutdown = self.inner.shutdown.subscribe();

        let conn = self
            .open_until_shutdown(&mut shutdown)
            .await
            .ok_or(Error::Cancelled)??;
        let client = self.clone();
        *supervisor = Some(tokio::spawn(async move { client.supervise(conn).await }));
        Ok(())
    }

    /// Close the connection and stop reconnecting. Pending requests fail with `Cancelled`.
    pub async fn disconnect(&self) {
        self.inner.state.set(ConnectionState::Closing);
        self.inner.shutdown.send_replace(true);
        self.inner.pending.fail_all(|| Error::Cancelled);
        let handle = self.inner.supervisor.lock().await.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "connection supervisor ended abnormally");
            }
        }
        self.teardown_connection().await;
        self.inner.state.set(ConnectionState::Disconnected);
    }

    /// Ask the live connection to end with `exit`. Returns false if there is none.
    pub(super) fn end_connection(&self, exit: Exit) -> bool {
        self.conn_handle()
            .map(|h| h.control.send(exit).is_ok())
            .unwrap_or(false)
    }

    /// Open a connection unless `disconnect` is called first. `None` when it was.
    async fn open_until_shutdown(&self, shutdown: &mut watch::Receiver<bool>) -> Option<Result<Connection>> {
        if *shutdown.borrow_and_update() {
            return None;
        }
        tokio::select! {
            result = self.open_connection() => Some(result),
            _ = shutdown.changed() => {
                debug!("connect abandoned by disconnect");
                self.inner.state.set(ConnectionState::Disconnected);
                None
            }
        }
    }

    async fn open_connection(&self) -> Result<Connection> {
        let state = &self.inner.state;
        state.set(ConnectionState::Connecting);
        let limit = self.inner.config.connect_timeout;
        let attempt = async {
            let (tx, rx) = self.inner.connector.dial(&self.inner.config.ws_url).await?;
            state.set(ConnectionState::Handshaking);
            let (static_key, payload) = {
                let device = self.inner.device.read().await;
                (
                    device.noise_key.private,
                    client_payload(&device, &self.inner.config.device_props),
                )
            };
            run_client_handshake(tx, rx, &static_key, &payload).await
        };
        let result = match tokio::time::timeout(limit, attempt).await {
            Ok(result) => result,
            Err(_) => Err(ConnectionError::ConnectTimeout(limit).into()),
        };

        match result {
            Ok((transport, frames, _server_static)) => {
                let (control, control_rx) = mpsc::unbounded_channel();
                *self.inner.conn.lock().unwrap_or_else(|e| e.into_inner()) = Some(ConnHandle {
                    transport: Arc::new(transport),
                    control,
                });
                state.set(ConnectionState::Authenticated);
                Ok(Connection {
                    frames,
                    control: control_rx,
                })
            }
            Err(e) => {
                warn!(error = %e, url = %self.inner.config.ws_url, "connect failed");
                state.set(ConnectionState::Disconnected);
                Err(e)
            }
        }
    }

    async fn teardown_connection(&self) {
        let handle = self
            .inner
            .conn
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.transport.close().await {
                debug!(error = %e, "closing transport");
            }
        }
    }

    async fn supervise(self, mut conn: Connection) {
        let mut backoff = Backoff::new(self.inner.config.backoff.clone());
        let mut shutdown = self.inner.shutdown.subscribe();
        loop {
            let exit = self.run_connection(&mut conn, &mut shutdown).await;
            drop(conn);
            self.teardown_connection().await;

            let immediate = match exit {
                Exit::Closed => break,
                Exit::Reconnect => {
                    info!("server requested reconnect");
                    self.inner.pending.fail_all(|| ConnectionError::Disconnected.into());
                    true
                }
                Exit::Lost(err) => {
                    warn!(error = %err, "connection lost");
                    self.inner.pending.fail_all(|| ConnectionError::Disconnected.into());
                    self.emit(Event::Disconnected {
                        reason: err.to_string(),
                    });
                    if !self.inner.config.auto_reconnect {
                        break;
                    }
                    false
                }
                Exit::Revoked { reason, on_connect } => {
                    error!(?reason, "device was logged out");
                    self.inner.pending.fail_all(|| Error::AuthRevoked(reason));
                    self.set_pairing_state(crate::pairing::PairingState::Idle);
                    self.emit(Event::LoggedOut { on_connect, reason });
                    break;
                }
                Exit::Replaced => {
                    warn!("stream replaced by another client");
                    self.inner.pending.fail_all(|| ConnectionError::Disconnected.into());
                    self.emit(Event::StreamReplaced);
                    break;
                }
                Exit::Stopped(event) => {
                    self.inner.pending.fail_all(|| ConnectionError::Disconnected.into());
                    self.emit(event);
                    break;
                }
            };
            self.inner.state.set(ConnectionState::Disconnected);

            let mut delay = if immediate {
                Some(Duration::ZERO)
            } else {
                backoff.next_delay()
            };
            conn = loop {
                let Some(d) = delay else {
                    error!(attempts = backoff.attempt(), "giving up reconnecting");
                    self.emit(Event::Disconnected {
                        reason: "reconnect attempts exhausted".into(),
                    });
                    self.inner.state.set(ConnectionState::Disconnected);
                    return;
                };
                debug!(attempt = backoff.attempt(), delay_ms = d.as_millis() as u64, "reconnecting");
                tokio::select! {
                    _ = tokio::time::sleep(d) => {}
                    _ = shutdown.changed() => {
                        self.inner.state.set(ConnectionState::Disconnected);
                        return;
                    }
                }
                let Some(opened) = self.open_until_shutdown(&mut shutdown).await else {
                    return;
                };
                match opened {
                    Ok(c) => {
                        backoff.reset();
                        break c;
                    }
                    Err(e) if e.is_transient() => delay = backoff.next_delay(),
                    Err(e) => {
                        error!(error = %e, "reconnect failed permanently");
                        self.emit(Event::Disconnected {
                            reason: e.to_string(),
                        });
                        return;
                    }
                }
            };
        }
        self.inner.state.set(ConnectionState::Disconnected);
    }

    /// Read frames until the connection ends. Frame handlers never wait for responses,
    /// so a reply is always read by this loop.
    async fn run_connection(&self, conn: &mut Connection, shutdown: &mut watch::Receiver<bool>) -> Exit {
        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => return Exit::Closed,
                Some(exit) = conn.control.recv() => return exit,
                frame = conn.frames.next_frame() => {
                    let frame = match frame {
                        Ok(f) => f,
                        Err(e) => return Exit::Lost(e),
                    };
                    let node = match Node::decode(&frame) {
                        Ok(n) => n,
                        Err(e) => {
                            warn!(error = %e, "undecodable frame, resetting connection");
                            return Exit::Lost(Error::ProtocolViolation(e.to_string()));
                        }
                    };
                    if let Some(exit) = self.handle_node(node).await {
                        return exit;
                    }
                }
            }
        }
    }

    /// Ping the server every interval. Consecutive misses beyond the configured limit
    /// end the connection, which the supervisor then re-dials.
    pub(super) fn spawn_keepalive(&self) {
        let Some(handle) = self.conn_handle() else {
            return;
        };
        let client = self.clone();
        let cfg = self.inner.config.clone();
        tokio::spawn(async move {
            let mut failures = 0u32;
            let mut last_success: Option<SystemTime> = None;
            loop {
                tokio::time::sleep(cfg.keepalive_interval).await;
                if handle.control.is_closed() {
                    return;
                }
                let ping = iq_node("w:p", "get", &server_jid(), vec![Node::new("ping")]);
                match client.send_iq_with_timeout(ping, cfg.keepalive_timeout).await {
                    Ok(_) => {
                        if failures > 0 {
                            info!("keepalive restored");
                            client.emit(Event::KeepAliveRestored);
                        }
                        failures = 0;
                        last_success = Some(SystemTime::now());
                    }
                    Err(Error::Timeout) => {
                        failures += 1;
                        warn!(failures, "keepalive ping timed out");
                        client.emit(Event::KeepAliveTimeout {
                            error_count: failures,
                            last_success,
                        });
                        if failures >= cfg.keepalive_max_failures {
                            let _ = handle
                                .control
                                .send(Exit::Lost(ConnectionError::KeepAliveLost.into()));
                            return;
                        }
                    }
                    Err(e) => {
                        debug!(error = %e, "keepalive stopped");
                        return;
                    }
                }
            }
        });
    }
}
