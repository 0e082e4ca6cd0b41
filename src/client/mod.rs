//! Main client.
//!
//! A [`Client`] drives one account: it owns the connection supervisor (dial, Noise
//! handshake, receive loop, reconnect with backoff), correlates requests with
//! responses, runs the pairing flow, encrypts outgoing envelopes per device and turns
//! inbound frames into [`Event`]s.

mod connection;
mod handlers;
mod keys;
mod media;
mod pairing;
mod query;
mod request;
mod send;

pub use keys::{parse_prekey_bundle, prekey_bundle_node};
pub use query::{
    ChatPresence, ChatPresenceMedia, GroupInfo, GroupParticipant, IsOnWhatsAppResponse, UserInfo,
};
pub use send::SendResult;

use crate::binary::Node;
use crate::config::ClientConfig;
use crate::error::Error;
use crate::events::{Dispatcher, Event, EventKind, HandlerId};
use crate::media::{BlobTransport, MediaConn};
use crate::pairing::{LinkCodeSession, PairingState};
use crate::signal::SessionManager;
use crate::socket::NoiseTransport;
use crate::store::{Device, DeviceLease, DeviceLeases, Store};
use crate::transport::{ConnectionState, ConnectionStateCell, Connector, Transport};
use crate::types::{Jid, MessageId};
use crate::Result;
use connection::Exit;
use request::PendingRequests;
use sha2::Digest;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::JoinHandle;
use tracing::debug;

/// Send half of the live connection plus the channel that ends it.
#[derive(Clone)]
struct ConnHandle {
    transport: Arc<NoiseTransport>,
    control: mpsc::UnboundedSender<Exit>,
}

struct Inner {
    config: ClientConfig,
    store: Store,
    uuid: String,
    device: RwLock<Device>,
    sessions: SessionManager,
    identity_changes: Mutex<mpsc::UnboundedReceiver<Jid>>,
    connector: Arc<dyn Connector>,
    blobs: Option<Arc<dyn BlobTransport>>,
    state: ConnectionStateCell,
    pairing: Mutex<PairingState>,
    dispatcher: Arc<Dispatcher>,
    pending: PendingRequests,
    conn: Mutex<Option<ConnHandle>>,
    supervisor: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    shutdown: watch::Sender<bool>,
    device_cache: Mutex<HashMap<Jid, Vec<Jid>>>,
    media_conn: tokio::sync::Mutex<Option<MediaConn>>,
    link_code: Mutex<Option<LinkCodeSession>>,
    prekey_upload: tokio::sync::Mutex<()>,
    recent: Mutex<send::RecentMessages>,
    _lease: DeviceLease,
}

/// Client for the WhatsApp web multidevice API. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Client {
    inner: Arc<Inner>,
}

/// Builds a [`Client`] for one stored device.
pub struct ClientBuilder {
    store: Store,
    device: Device,
    config: ClientConfig,
    connector: Option<Arc<dyn Connector>>,
    blobs: Option<Arc<dyn BlobTransport>>,
    leases: Option<DeviceLeases>,
}

impl ClientBuilder {
    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    /// Link dialer. Defaults to the websocket connector with the `full` feature.
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Media host transport. Defaults to HTTPS with the `full` feature.
    pub fn blob_transport(mut self, blobs: Arc<dyn BlobTransport>) -> Self {
        self.blobs = Some(blobs);
        self
    }

    /// Lease table shared with other clients of the same store.
    pub fn leases(mut self, leases: DeviceLeases) -> Self {
        self.leases = Some(leases);
        self
    }

    pub fn build(self) -> Result<Client> {
        let lease = self.leases.unwrap_or_default().acquire(&self.device.uuid)?;

        #[cfg(feature = "full")]
        let connector = self
            .connector
            .unwrap_or_else(|| Arc::new(crate::socket::WsConnector) as Arc<dyn Connector>);
        #[cfg(not(feature = "full"))]
        let connector = self.connector.ok_or_else(|| {
            Error::Other(anyhow::anyhow!(
                "no connector configured; enable the `full` feature or supply one"
            ))
        })?;

        #[cfg(feature = "full")]
        let blobs = match self.blobs {
            Some(b) => Some(b),
            None => Some(Arc::new(crate::media::HttpBlobTransport::new(
                self.config.request_timeout,
            )?) as Arc<dyn BlobTransport>),
        };
        #[cfg(not(feature = "full"))]
        let blobs = self.blobs;

        let (identity_tx, identity_rx) = mpsc::unbounded_channel();
        let uuid = self.device.uuid.clone();
        let sessions = SessionManager::new(
            Arc::clone(&self.store),
            uuid.clone(),
            self.config.ratchet_skip_window,
        )
        .with_identity_listener(identity_tx);
        let pairing = if self.device.is_logged_in() {
            PairingState::LoggedIn
        } else {
            PairingState::Idle
        };

        Ok(Client {
            inner: Arc::new(Inner {
                config: self.config,
                store: self.store,
                uuid,
                device: RwLock::new(self.device),
                sessions,
                identity_changes: Mutex::new(identity_rx),
                connector,
                blobs,
                state: ConnectionStateCell::new(),
                pairing: Mutex::new(pairing),
                dispatcher: Arc::new(Dispatcher::new()),
                pending: PendingRequests::new(),
                conn: Mutex::new(None),
                supervisor: tokio::sync::Mutex::new(None),
                shutdown: watch::channel(false).0,
                device_cache: Mutex::new(HashMap::new()),
                media_conn: tokio::sync::Mutex::new(None),
                link_code: Mutex::new(None),
                prekey_upload: tokio::sync::Mutex::new(()),
                recent: Mutex::new(send::RecentMessages::default()),
                _lease: lease,
            }),
        })
    }
}

/// Server JID (`s.whatsapp.net`).
pub(crate) fn server_jid() -> Jid {
    Jid::default_server()
}

impl Client {
    pub fn builder(store: Store, device: Device) -> ClientBuilder {
        ClientBuilder {
            store,
            device,
            config: ClientConfig::default(),
            connector: None,
            blobs: None,
            leases: None,
        }
    }

    /// Account identifier the device is stored under.
    pub fn uuid(&self) -> &str {
        &self.inner.uuid
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn store(&self) -> &Store {
        &self.inner.store
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.inner.state.get()
    }

    pub fn subscribe_connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Wait until the connection reaches `target`. Fails with `Timeout`.
    pub async fn wait_for_state(&self, target: ConnectionState, timeout: Duration) -> Result<()> {
        let mut rx = self.inner.state.subscribe();
        tokio::time::timeout(timeout, rx.wait_for(|s| *s == target))
            .await
            .map_err(|_| Error::Timeout)?
            .map_err(|_| Error::Cancelled)?;
        Ok(())
    }

    pub fn pairing_state(&self) -> PairingState {
        *self.inner.pairing.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_pairing_state(&self, next: PairingState) {
        let mut state = self.inner.pairing.lock().unwrap_or_else(|e| e.into_inner());
        if *state != next {
            debug!(from = ?*state, to = ?next, "pairing state");
            *state = next;
        }
    }

    pub fn is_connected(&self) -> bool {
        self.inner.state.get().is_connected()
    }

    /// Whether the device has been paired.
    pub async fn is_logged_in(&self) -> bool {
        self.inner.device.read().await.is_logged_in()
    }

    /// Our JID if paired.
    pub async fn get_own_id(&self) -> Option<Jid> {
        self.inner.device.read().await.id.clone()
    }

    /// Snapshot of the device state.
    pub async fn device(&self) -> Device {
        self.inner.device.read().await.clone()
    }

    /// Apply `f` to the device and persist it. The in-memory device only changes if the
    /// save succeeded.
    async fn update_device<T>(&self, f: impl FnOnce(&mut Device) -> T) -> Result<T> {
        let mut device = self.inner.device.write().await;
        let mut next = device.clone();
        let out = f(&mut next);
        self.inner.store.save(&next).await?;
        *device = next;
        Ok(out)
    }

    /// Register a handler for one event kind. Handlers for the same kind run in order.
    pub fn add_event_handler<F>(&self, kind: EventKind, handler: F) -> HandlerId
    where
        F: Fn(&Event) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.inner.dispatcher.add_handler(kind, handler)
    }

    pub fn remove_event_handler(&self, id: HandlerId) -> bool {
        self.inner.dispatcher.remove_handler(id)
    }

    /// Every event, in order, on a channel.
    pub fn subscribe_events(&self) -> mpsc::UnboundedReceiver<Event> {
        self.inner.dispatcher.subscribe()
    }

    fn emit(&self, event: Event) {
        self.inner.dispatcher.emit(event);
    }

    /// Turn identity changes reported by the session layer into events.
    fn drain_identity_changes(&self) {
        let mut rx = self
            .inner
            .identity_changes
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        while let Ok(jid) = rx.try_recv() {
            self.emit(Event::IdentityChange {
                jid,
                timestamp: std::time::SystemTime::now(),
            });
        }
    }

    /// Generate a message ID (3EB0 + hex of hash).
    pub fn generate_message_id(&self) -> MessageId {
        let mut data = Vec::with_capacity(8 + 5 + 16);
        data.extend_from_slice(&crate::types::unix_now().to_be_bytes());
        data.extend_from_slice(b"@c.us");
        data.extend_from_slice(&rand::random::<[u8; 16]>());
        let hash = sha2::Sha256::digest(&data);
        format!("3EB0{}", hex::encode_upper(&hash[..9]))
    }

    fn conn_handle(&self) -> Option<ConnHandle> {
        self.inner
            .conn
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Encode and send one node on the live connection.
    pub(crate) async fn send_node(&self, node: &Node) -> Result<()> {
        let handle = self.conn_handle().ok_or(Error::NotConnected)?;
        debug!(tag = %node.tag, id = node.attr("id").unwrap_or_default(), "send node");
        handle.transport.send(&node.encode()?).await
    }

    /// Send a node with an `id` and wait for the reply carrying the same id
    /// (an `<iq>` result or an `<ack>`).
    async fn send_and_wait(&self, node: Node, timeout: Duration) -> Result<Node> {
        let id = node
            .attr("id")
            .map(str::to_string)
            .ok_or_else(|| Error::Binary("request without id".into()))?;
        let rx = self.inner.pending.register(&id);
        if let Err(e) = self.send_node(&node).await {
            self.inner.pending.remove(&id);
            return Err(e);
        }
        self.inner.pending.wait(&id, rx, timeout).await
    }

    /// Send an IQ and wait for its result. `type="error"` replies become `Error::Iq`.
    pub async fn send_iq(&self, iq: Node) -> Result<Node> {
        self.send_iq_with_timeout(iq, self.inner.config.request_timeout)
            .await
    }

    async fn send_iq_with_timeout(&self, mut iq: Node, timeout: Duration) -> Result<Node> {
        if iq.attr("id").is_none() {
            iq = iq.with_attr("id", self.inner.pending.next_id());
        }
        let resp = self.send_and_wait(iq, timeout).await?;
        if resp.attr("type") == Some("error") {
            let err = resp.get_child_by_tag("error");
            return Err(Error::Iq {
                code: err
                    .and_then(|e| e.attr_u64("code"))
                    .and_then(|c| u16::try_from(c).ok())
                    .unwrap_or(0),
                text: err
                    .and_then(|e| e.attr("text"))
                    .unwrap_or_default()
                    .to_string(),
            });
        }
        Ok(resp)
    }

    /// Generic query for collaborators: `<iq xmlns type to>` with the given children.
    pub async fn query(&self, xmlns: &str, iq_type: &str, to: &Jid, content: Vec<Node>) -> Result<Node> {
        self.send_iq(iq_node(xmlns, iq_type, to, content)).await
    }

    /// Like [`Client::query`], retried once on a transient transport error. Only for reads.
    pub async fn query_idempotent(
        &self,
        xmlns: &str,
        iq_type: &str,
        to: &Jid,
        content: Vec<Node>,
    ) -> Result<Node> {
        match self.query(xmlns, iq_type, to, content.clone()).await {
            Err(e) if e.is_transient() => {
                debug!(%xmlns, error = %e, "retrying idempotent query");
                self.wait_connected(self.inner.config.request_timeout).await;
                self.query(xmlns, iq_type, to, content).await
            }
            other => other,
        }
    }

    /// Wait until a live connection is installed again. False if none appeared in time.
    async fn wait_connected(&self, limit: Duration) -> bool {
        let mut rx = self.inner.state.subscribe();
        tokio::time::timeout(limit, async {
            loop {
                if rx.borrow_and_update().is_connected() && self.conn_handle().is_some() {
                    return true;
                }
                if rx.changed().await.is_err() {
                    return false;
                }
            }
        })
        .await
        .unwrap_or(false)
    }
}

/// `<iq xmlns type to>` with children.
pub(crate) fn iq_node(xmlns: &str, iq_type: &str, to: &Jid, content: Vec<Node>) -> Node {
    let node = Node::new("iq")
        .with_attr("xmlns", xmlns)
        .with_attr("type", iq_type)
        .with_attr("to", to);
    if content.is_empty() {
        node
    } else {
        node.with_children(content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::transport::memory::MemoryConnector;

    fn client() -> Client {
        let (connector, _accepted) = MemoryConnector::new();
        Client::builder(Arc::new(MemoryStore::new()), Device::new("t"))
            .connector(Arc::new(connector))
            .build()
            .unwrap()
    }

    #[test]
    fn generate_message_id_format() {
        let id = client().generate_message_id();
        assert!(id.starts_with("3EB0"));
        assert_eq!(id.len(), 4 + 18);
        assert!(id[4..].chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn one_client_per_device() {
        let leases = DeviceLeases::new();
        let store: Store = Arc::new(MemoryStore::new());
        let (connector, _rx) = MemoryConnector::new();
        let connector: Arc<dyn Connector> = Arc::new(connector);
        let first = Client::builder(Arc::clone(&store), Device::new("same"))
            .connector(Arc::clone(&connector))
            .leases(leases.clone())
            .build()
            .unwrap();
        let second = Client::builder(Arc::clone(&store), Device::new("same"))
            .connector(Arc::clone(&connector))
            .leases(leases.clone())
            .build();
        assert!(matches!(
            second.err(),
            Some(Error::Store(crate::error::StoreError::DeviceInUse(_)))
        ));
        drop(first);
        assert!(!leases.is_held("same"));
    }

    #[tokio::test]
    async fn calls_fail_fast_when_not_connected() {
        let client = client();
        assert_eq!(client.connection_state(), ConnectionState::Disconnected);
        assert_eq!(client.pairing_state(), PairingState::Idle);
        let err = client
            .query("w:p", "get", &server_jid(), vec![Node::new("ping")])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotConnected));
        assert!(!client.is_logged_in().await);
    }

    #[test]
    fn iq_node_shape() {
        let iq = iq_node("usync", "get", &server_jid(), vec![Node::new("usync")]);
        assert_eq!(iq.attr("to"), Some("s.whatsapp.net"));
        assert_eq!(iq.attr("xmlns"), Some("usync"));
        assert!(iq.get_child_by_tag("usync").is_some());
    }
}
