mod common;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::{init_tracing, wait_event, FakeServer, MEDIA_HOST, WAIT};
use whatsapp_engine::binary::Node;
use whatsapp_engine::events::Event;
use whatsapp_engine::media::MemoryBlobTransport;
use whatsapp_engine::pairing::{sign_companion_identity, verify_account};
use whatsapp_engine::signal::{
    pad_message, unpad_message, CipherEnvelope, EnvelopeKind, IdentityKeyPair, PreKeyBundle,
    PreKeyFetcher, SessionManager,
};
use whatsapp_engine::error::ConnectionError;
use whatsapp_engine::store::{Device, MemoryStore};
use whatsapp_engine::{
    BackoffConfig, Client, ClientConfig, ConnectionState, Error, Jid, MediaType, PairingState,
};

fn jid(s: &str) -> Jid {
    s.parse().unwrap()
}

fn server() -> Jid {
    Jid::default_server()
}

fn paired_device(uuid: &str, id: &str) -> Device {
    let mut device = Device::new(uuid);
    device.id = Some(jid(id));
    device.account = Some(b"signed-account".to_vec());
    device
}

fn quick_backoff() -> BackoffConfig {
    BackoffConfig {
        base: Duration::from_millis(20),
        max: Duration::from_millis(100),
        ..Default::default()
    }
}

/// A remote account with one device and a published bundle.
struct Peer {
    device: Device,
    phone: Jid,
    sessions: SessionManager,
}

fn add_peer(srv: &FakeServer, user: &str) -> Peer {
    let phone = jid(&format!("{}@s.whatsapp.net", user));
    let mut device = paired_device(user, &phone.to_string());
    let prekeys = device.generate_prekeys(1);
    let mut dir = srv.directory.lock().unwrap();
    dir.devices.insert(phone.clone(), vec![phone.clone()]);
    dir.bundles
        .insert(phone.clone(), device.prekey_bundle(prekeys.first()));
    Peer {
        device,
        phone,
        sessions: SessionManager::new(Arc::new(MemoryStore::new()), user, 2000),
    }
}

fn register_self(srv: &FakeServer, me: &Jid) {
    srv.directory
        .lock()
        .unwrap()
        .devices
        .insert(me.to_non_ad(), vec![me.clone()]);
}

/// The envelope addressed to `device` in an outgoing message.
fn envelope_for(message: &Node, device: &Jid) -> CipherEnvelope {
    let to = message
        .get_child_by_tag("participants")
        .unwrap()
        .get_children_by_tag("to")
        .find(|t| t.attr_jid("jid").as_ref() == Some(device))
        .unwrap();
    CipherEnvelope::from_node(to.get_child_by_tag("enc").unwrap()).unwrap()
}

async fn logged_in(srv: &mut FakeServer, client: &Client) -> common::Session {
    let mut events = client.subscribe_events();
    let (connected, session) = tokio::join!(client.connect(), srv.accept());
    connected.unwrap();
    session.send(Node::new("success").with_attr("t", 1_700_000_000u64)).await;
    wait_event(&mut events, |e| matches!(e, Event::Connected)).await;
    session
}

struct NoBundles;

#[async_trait]
impl PreKeyFetcher for NoBundles {
    async fn fetch_prekey_bundles(
        &self,
        _devices: &[Jid],
    ) -> whatsapp_engine::Result<std::collections::HashMap<Jid, PreKeyBundle>> {
        Ok(Default::default())
    }
}

#[tokio::test]
async fn timed_out_request_leaves_connection_usable() {
    init_tracing();
    let mut srv = FakeServer::new();
    let client = srv.client(
        Device::new("a"),
        ClientConfig::default().with_request_timeout(Duration::from_millis(300)),
    );
    let (connected, _session) = tokio::join!(client.connect(), srv.accept());
    connected.unwrap();

    let to = server();
    let (slow, ping) = tokio::join!(
        client.query("test:unanswered", "get", &to, vec![]),
        client.query("w:p", "get", &to, vec![Node::new("ping")]),
    );
    assert!(matches!(slow, Err(Error::Timeout)));
    assert_eq!(ping.unwrap().attr("type"), Some("result"));
    assert!(client.is_connected());

    // still answering after the timeout
    client
        .query("w:p", "get", &server(), vec![Node::new("ping")])
        .await
        .unwrap();
    client.disconnect().await;
    assert_eq!(client.connection_state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn revoked_session_fails_pending_and_stays_down() {
    init_tracing();
    let mut srv = FakeServer::new();
    let client = srv.client(paired_device("b", "111:2@s.whatsapp.net"), ClientConfig::default());
    let mut events = client.subscribe_events();
    let (connected, mut session) = tokio::join!(client.connect(), srv.accept());
    connected.unwrap();

    let pending = {
        let client = client.clone();
        tokio::spawn(async move { client.query("test:unanswered", "get", &server(), vec![]).await })
    };
    session.next_iq("test:unanswered").await;
    session
        .send(Node::new("stream:error").with_attr("code", "401"))
        .await;

    let result = tokio::time::timeout(WAIT, pending).await.unwrap().unwrap();
    assert!(matches!(result, Err(Error::AuthRevoked(_))));
    let logged_out = wait_event(&mut events, |e| matches!(e, Event::LoggedOut { .. })).await;
    assert!(matches!(logged_out, Event::LoggedOut { on_connect: false, .. }));
    client
        .wait_for_state(ConnectionState::Disconnected, WAIT)
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(srv.connector.dial_count(), 1);
    assert_eq!(client.pairing_state(), PairingState::Idle);
}

#[tokio::test]
async fn stream_restart_reconnects_immediately() {
    init_tracing();
    let mut srv = FakeServer::new();
    let client = srv.client(paired_device("c", "111:2@s.whatsapp.net"), ClientConfig::default());
    let (connected, session) = tokio::join!(client.connect(), srv.accept());
    connected.unwrap();

    session
        .send(Node::new("stream:error").with_attr("code", "515"))
        .await;
    let second = srv.accept().await;
    assert!(second.payload.is_login());
    assert_eq!(srv.connector.dial_count(), 2);
    client
        .wait_for_state(ConnectionState::Authenticated, WAIT)
        .await
        .unwrap();
    client.disconnect().await;
}

#[tokio::test]
async fn qr_pairing_stores_verified_account() {
    init_tracing();
    let mut srv = FakeServer::new();
    let client = srv.client(Device::new("d"), ClientConfig::default());
    let mut events = client.subscribe_events();
    let (connected, mut session) = tokio::join!(client.connect(), srv.accept());
    connected.unwrap();
    assert!(!session.payload.is_login());

    session
        .send(
            Node::new("iq")
                .with_attr("id", "pair-1")
                .with_attr("type", "set")
                .with_attr("from", "s.whatsapp.net")
                .with_attr("xmlns", "md")
                .with_children(vec![Node::new("pair-device").with_children(vec![
                    Node::new("ref").with_content(b"REF1".to_vec()),
                    Node::new("ref").with_content(b"REF2".to_vec()),
                ])]),
        )
        .await;
    let ack = session.next_tag("iq").await;
    assert_eq!(ack.attr("id"), Some("pair-1"));
    assert_eq!(ack.attr("type"), Some("result"));
    let Event::Qr { codes } = wait_event(&mut events, |e| matches!(e, Event::Qr { .. })).await else {
        unreachable!()
    };
    assert_eq!(codes.len(), 2);
    assert!(codes[0].starts_with("REF1,"));
    assert_eq!(client.pairing_state(), PairingState::AwaitingQrScan);

    let device = client.device().await;
    let primary = IdentityKeyPair::generate();
    let container =
        sign_companion_identity(&primary, &device.adv_secret_key, &device.identity.public(), 7)
            .unwrap();
    session
        .send(
            Node::new("iq")
                .with_attr("id", "pair-2")
                .with_attr("type", "set")
                .with_attr("from", "s.whatsapp.net")
                .with_attr("xmlns", "md")
                .with_children(vec![Node::new("pair-success").with_children(vec![
                    Node::new("device").with_attr("jid", "5511999:4@s.whatsapp.net"),
                    Node::new("platform").with_attr("name", "android"),
                    Node::new("device-identity").with_content(container),
                ])]),
        )
        .await;

    let reply = session.next_tag("iq").await;
    assert_eq!(reply.attr("id"), Some("pair-2"));
    assert_eq!(reply.attr("type"), Some("result"));
    let signed = reply
        .get_optional_child_by_path(&["pair-device-sign", "device-identity"])
        .unwrap();
    assert_eq!(signed.attr("key-index"), Some("7"));

    let success = wait_event(&mut events, |e| matches!(e, Event::PairSuccess { .. })).await;
    let Event::PairSuccess { id, platform, .. } = success else {
        unreachable!()
    };
    assert_eq!(id, jid("5511999:4@s.whatsapp.net"));
    assert_eq!(platform.as_deref(), Some("android"));
    let device = client.device().await;
    assert_eq!(device.id, Some(id));
    verify_account(&device).unwrap();
    assert!(client.is_logged_in().await);

    // the server restarts the stream; the next handshake is a login
    session
        .send(Node::new("stream:error").with_attr("code", "515"))
        .await;
    let login = srv.accept().await;
    assert!(login.payload.is_login());
    assert_eq!(login.payload.username, Some(5511999));
    assert_eq!(login.payload.device, Some(4));
    client.disconnect().await;
}

#[tokio::test]
async fn send_fans_out_and_receives_replies() {
    init_tracing();
    let mut srv = FakeServer::new();
    let me = jid("111:2@s.whatsapp.net");
    let peer_user = jid("222@s.whatsapp.net");
    let peer_phone = peer_user.with_device(0);
    let peer_laptop = peer_user.with_device(3);

    let mut peer = paired_device("peer", "222@s.whatsapp.net");
    let prekeys = peer.generate_prekeys(1);
    {
        let mut dir = srv.directory.lock().unwrap();
        dir.devices
            .insert(peer_user.clone(), vec![peer_phone.clone(), peer_laptop.clone()]);
        dir.devices.insert(me.to_non_ad(), vec![me.clone()]);
        dir.bundles
            .insert(peer_phone.clone(), peer.prekey_bundle(prekeys.first()));
    }

    let client = srv.client(paired_device("e", "111:2@s.whatsapp.net"), ClientConfig::default());
    let mut events = client.subscribe_events();
    let (connected, mut session) = tokio::join!(client.connect(), srv.accept());
    connected.unwrap();
    session.send(Node::new("success").with_attr("t", 1_700_000_000u64)).await;
    wait_event(&mut events, |e| matches!(e, Event::Connected)).await;

    let sent = client.send_envelope(&peer_user, b"hello").await.unwrap();
    assert_eq!(sent.failed.len(), 1);
    assert_eq!(sent.failed[0].device, peer_laptop);

    let message = session.next_tag("message").await;
    assert_eq!(message.attr("id"), Some(sent.id.as_str()));
    assert!(message.get_child_by_tag("device-identity").is_some());
    let to = message
        .get_child_by_tag("participants")
        .unwrap()
        .get_children_by_tag("to")
        .find(|t| t.attr_jid("jid") == Some(peer_phone.clone()))
        .unwrap();
    let env = CipherEnvelope::from_node(to.get_child_by_tag("enc").unwrap()).unwrap();
    assert_eq!(env.kind, EnvelopeKind::PreKey);

    let peer_sessions = SessionManager::new(Arc::new(MemoryStore::new()), "peer", 2000);
    let decrypted = peer_sessions.decrypt(&peer, &me, &env).await.unwrap();
    assert_eq!(unpad_message(&decrypted.plaintext).unwrap(), b"hello");
    assert_eq!(decrypted.consumed_prekey, prekeys.first().map(|k| k.id));
    peer.prekeys.clear();

    let reply = peer_sessions
        .encrypt_for(&peer, &me, &pad_message(b"hi back"), &NoBundles)
        .await
        .unwrap();
    assert_eq!(reply.kind, EnvelopeKind::Message);
    session
        .send(
            Node::new("message")
                .with_attr("from", &peer_phone)
                .with_attr("id", "PEER-1")
                .with_attr("type", "text")
                .with_attr("t", 1_700_000_100u64)
                .with_children(vec![reply.to_node()]),
        )
        .await;

    let Event::Message(msg) = wait_event(&mut events, |e| matches!(e, Event::Message(_))).await else {
        unreachable!()
    };
    assert_eq!(msg.payload, b"hi back");
    assert_eq!(msg.info.chat, peer_user);
    assert!(!msg.info.is_from_me);

    let receipt = session.next_tag("receipt").await;
    assert_eq!(receipt.attr("id"), Some("PEER-1"));
    let ack = session.next_tag("ack").await;
    assert_eq!(ack.attr("id"), Some("PEER-1"));
    assert_eq!(ack.attr("class"), Some("message"));
    client.disconnect().await;
}

#[tokio::test]
async fn media_round_trip_rejects_tampering() {
    init_tracing();
    let mut srv = FakeServer::new();
    let blobs = Arc::new(MemoryBlobTransport::new());
    let client = whatsapp_engine::Client::builder(
        Arc::new(MemoryStore::new()),
        paired_device("f", "111:2@s.whatsapp.net"),
    )
    .connector(srv.connector.clone())
    .blob_transport(blobs.clone())
    .build()
    .unwrap();
    let (connected, _session) = tokio::join!(client.connect(), srv.accept());
    connected.unwrap();

    let photo = vec![7u8; 4096];
    let reference = client
        .upload(&photo, MediaType::Image, "image/jpeg")
        .await
        .unwrap();
    assert_eq!(client.media_conn().await.unwrap().hosts, vec![MEDIA_HOST.to_string()]);
    assert_eq!(client.download(&reference).await.unwrap(), photo);

    assert!(blobs.tamper(&reference.direct_path, |data| data[0] ^= 1));
    assert!(matches!(
        client.download(&reference).await,
        Err(Error::Integrity(_))
    ));
    client.disconnect().await;
}

#[tokio::test]
async fn silent_server_times_out_connect() {
    init_tracing();
    let mut srv = FakeServer::new();
    let client = srv.client(
        Device::new("g"),
        ClientConfig::default().with_connect_timeout(Duration::from_millis(200)),
    );
    let (connected, _held) = tokio::join!(client.connect(), srv.accept_raw());
    let err = connected.unwrap_err();
    assert!(matches!(
        err,
        Error::Connection(ConnectionError::ConnectTimeout(_))
    ));
    assert!(err.is_transient());
    assert_eq!(client.connection_state(), ConnectionState::Disconnected);
    tokio::time::timeout(WAIT, client.disconnect()).await.unwrap();
}

#[tokio::test]
async fn disconnect_interrupts_stalled_reconnect() {
    init_tracing();
    let mut srv = FakeServer::new();
    let client = srv.client(
        paired_device("h", "111:2@s.whatsapp.net"),
        ClientConfig::default().with_connect_timeout(Duration::from_secs(60)),
    );
    let (connected, session) = tokio::join!(client.connect(), srv.accept());
    connected.unwrap();
    session
        .send(Node::new("stream:error").with_attr("code", "515"))
        .await;
    let _stalled = srv.accept_raw().await;

    tokio::time::timeout(Duration::from_secs(2), client.disconnect())
        .await
        .expect("disconnect waited on the stalled handshake");
    assert_eq!(client.connection_state(), ConnectionState::Disconnected);
    assert_eq!(srv.connector.dial_count(), 2);
}

#[tokio::test]
async fn disconnect_cancels_pending_requests() {
    init_tracing();
    let mut srv = FakeServer::new();
    let client = srv.client(Device::new("i"), ClientConfig::default());
    let (connected, mut session) = tokio::join!(client.connect(), srv.accept());
    connected.unwrap();

    let pending = {
        let client = client.clone();
        tokio::spawn(async move { client.query("test:unanswered", "get", &server(), vec![]).await })
    };
    session.next_iq("test:unanswered").await;
    client.disconnect().await;
    let result = tokio::time::timeout(WAIT, pending).await.unwrap().unwrap();
    assert!(matches!(result, Err(Error::Cancelled)));
    assert_eq!(srv.connector.dial_count(), 1);
}

#[tokio::test]
async fn missed_keepalives_force_redial() {
    init_tracing();
    let mut srv = FakeServer::new();
    srv.directory.lock().unwrap().ignore_pings = true;
    let client = srv.client(
        paired_device("j", "111:2@s.whatsapp.net"),
        ClientConfig::default()
            .with_keepalive(Duration::from_millis(100), Duration::from_millis(100))
            .with_backoff(quick_backoff()),
    );
    let mut events = client.subscribe_events();
    let _first = logged_in(&mut srv, &client).await;

    let Event::KeepAliveTimeout { error_count, .. } =
        wait_event(&mut events, |e| matches!(e, Event::KeepAliveTimeout { .. })).await
    else {
        unreachable!()
    };
    assert_eq!(error_count, 1);
    wait_event(&mut events, |e| matches!(e, Event::KeepAliveTimeout { error_count: 2, .. })).await;
    wait_event(&mut events, |e| matches!(e, Event::Disconnected { .. })).await;

    let second = srv.accept().await;
    assert!(second.payload.is_login());
    assert_eq!(srv.connector.dial_count(), 2);
    client.disconnect().await;
}

#[tokio::test]
async fn refused_dials_back_off_until_accepted() {
    init_tracing();
    let mut srv = FakeServer::new();
    let client = srv.client(
        paired_device("k", "111:2@s.whatsapp.net"),
        ClientConfig::default().with_backoff(quick_backoff()),
    );
    let (connected, session) = tokio::join!(client.connect(), srv.accept());
    connected.unwrap();

    srv.connector.refuse_next(2);
    session
        .send(Node::new("stream:error").with_attr("code", "503"))
        .await;
    let _second = srv.accept().await;
    assert_eq!(srv.connector.dial_count(), 4);
    client
        .wait_for_state(ConnectionState::Authenticated, WAIT)
        .await
        .unwrap();
    client.disconnect().await;
}

#[tokio::test]
async fn idempotent_query_retries_once_after_reconnect() {
    init_tracing();
    let mut srv = FakeServer::new();
    let client = srv.client(paired_device("l", "111:2@s.whatsapp.net"), ClientConfig::default());
    let (connected, mut first) = tokio::join!(client.connect(), srv.accept());
    connected.unwrap();

    let query = {
        let client = client.clone();
        tokio::spawn(async move {
            client
                .query_idempotent("test:lookup", "get", &server(), vec![Node::new("lookup")])
                .await
        })
    };
    first.next_iq("test:lookup").await;
    first
        .send(Node::new("stream:error").with_attr("code", "515"))
        .await;

    let mut second = srv.accept().await;
    let retried = second.next_iq("test:lookup").await;
    second
        .send(
            Node::new("iq")
                .with_attr("id", retried.attr("id").unwrap())
                .with_attr("type", "result")
                .with_attr("from", "s.whatsapp.net"),
        )
        .await;
    let result = tokio::time::timeout(WAIT, query).await.unwrap().unwrap();
    assert_eq!(result.unwrap().attr("type"), Some("result"));
    client.disconnect().await;
}

#[tokio::test]
async fn interrupted_send_is_not_repeated() {
    init_tracing();
    let mut srv = FakeServer::new();
    let me = jid("111:2@s.whatsapp.net");
    register_self(&srv, &me);
    let peer = add_peer(&srv, "222");
    srv.directory.lock().unwrap().hold_acks = true;

    let client = srv.client(paired_device("m", "111:2@s.whatsapp.net"), ClientConfig::default());
    let (connected, mut first) = tokio::join!(client.connect(), srv.accept());
    connected.unwrap();

    let send = {
        let client = client.clone();
        let to = peer.phone.clone();
        tokio::spawn(async move { client.send_envelope(&to, b"once").await })
    };
    first.next_tag("message").await;
    first
        .send(Node::new("stream:error").with_attr("code", "515"))
        .await;

    let result = tokio::time::timeout(WAIT, send).await.unwrap().unwrap();
    assert!(matches!(
        result,
        Err(Error::Connection(ConnectionError::Disconnected))
    ));
    let mut second = srv.accept().await;
    while let Some(node) = second.try_next(Duration::from_millis(300)).await {
        assert_ne!(node.tag, "message");
    }
    client.disconnect().await;
}

#[tokio::test]
async fn concurrent_sends_to_different_peers() {
    init_tracing();
    let mut srv = FakeServer::new();
    let me = jid("111:2@s.whatsapp.net");
    register_self(&srv, &me);
    let alice = add_peer(&srv, "222");
    let bob = add_peer(&srv, "333");

    let client = srv.client(paired_device("n", "111:2@s.whatsapp.net"), ClientConfig::default());
    let mut session = logged_in(&mut srv, &client).await;

    let (to_alice, to_bob) = tokio::join!(
        client.send_envelope(&alice.phone, b"for alice"),
        client.send_envelope(&bob.phone, b"for bob"),
    );
    let (to_alice, to_bob) = (to_alice.unwrap(), to_bob.unwrap());
    assert_ne!(to_alice.id, to_bob.id);

    for _ in 0..2 {
        let message = session.next_tag("message").await;
        let id = message.attr("id").unwrap();
        let (peer, expected) = if id == to_alice.id {
            (&alice, &b"for alice"[..])
        } else {
            assert_eq!(id, to_bob.id);
            (&bob, &b"for bob"[..])
        };
        let env = envelope_for(&message, &peer.phone);
        let decrypted = peer.sessions.decrypt(&peer.device, &me, &env).await.unwrap();
        assert_eq!(unpad_message(&decrypted.plaintext).unwrap(), expected);
    }
    client.disconnect().await;
}

#[tokio::test]
async fn session_mismatch_restarts_with_fresh_bundle() {
    init_tracing();
    let mut srv = FakeServer::new();
    let me = jid("111:2@s.whatsapp.net");
    register_self(&srv, &me);
    let mut peer = add_peer(&srv, "222");

    let client = srv.client(
        paired_device("o", "111:2@s.whatsapp.net"),
        ClientConfig::default().with_ratchet_skip_window(2),
    );
    let mut events = client.subscribe_events();
    let mut session = logged_in(&mut srv, &client).await;

    client.send_envelope(&peer.phone, b"one").await.unwrap();
    let env = envelope_for(&session.next_tag("message").await, &peer.phone);
    assert_eq!(env.kind, EnvelopeKind::PreKey);
    peer.sessions.decrypt(&peer.device, &me, &env).await.unwrap();
    peer.device.prekeys.clear();

    let mut replies = Vec::new();
    for i in 0..5 {
        replies.push(
            peer.sessions
                .encrypt_for(&peer.device, &me, &pad_message(format!("r{}", i).as_bytes()), &NoBundles)
                .await
                .unwrap(),
        );
    }
    let incoming = |id: &str, env: &CipherEnvelope| {
        Node::new("message")
            .with_attr("from", &peer.phone)
            .with_attr("id", id)
            .with_attr("type", "text")
            .with_attr("t", 1_700_000_100u64)
            .with_children(vec![env.to_node()])
    };
    session.send(incoming("R0", &replies[0])).await;
    wait_event(&mut events, |e| matches!(e, Event::Message(_))).await;

    // skips three keys with a window of two
    session.send(incoming("R4", &replies[4])).await;
    wait_event(&mut events, |e| matches!(e, Event::UndecryptableMessage { .. })).await;
    let retry = session.next_tag("receipt").await;
    let retry = if retry.attr("type") == Some("retry") {
        retry
    } else {
        session.next_tag("receipt").await
    };
    assert_eq!(retry.attr("id"), Some("R4"));

    srv.directory
        .lock()
        .unwrap()
        .bundles
        .insert(peer.phone.clone(), peer.device.prekey_bundle(None));
    client.send_envelope(&peer.phone, b"two").await.unwrap();
    let env = envelope_for(&session.next_tag("message").await, &peer.phone);
    assert_eq!(env.kind, EnvelopeKind::PreKey);
    let decrypted = peer.sessions.decrypt(&peer.device, &me, &env).await.unwrap();
    assert!(decrypted.new_session);
    assert_eq!(unpad_message(&decrypted.plaintext).unwrap(), b"two");
    client.disconnect().await;
}

#[tokio::test]
async fn retry_receipt_resends_to_requesting_device() {
    init_tracing();
    let mut srv = FakeServer::new();
    let me = jid("111:2@s.whatsapp.net");
    register_self(&srv, &me);
    let mut peer = add_peer(&srv, "222");
    let laptop = peer.phone.with_device(5);
    srv.directory
        .lock()
        .unwrap()
        .devices
        .insert(peer.phone.clone(), vec![peer.phone.clone(), laptop.clone()]);
    let laptop_device = paired_device("222-laptop", &laptop.to_string());
    srv.directory
        .lock()
        .unwrap()
        .bundles
        .insert(laptop.clone(), laptop_device.prekey_bundle(None));

    let client = srv.client(paired_device("p", "111:2@s.whatsapp.net"), ClientConfig::default());
    let mut session = logged_in(&mut srv, &client).await;

    let sent = client.send_envelope(&peer.phone, b"please resend").await.unwrap();
    assert!(sent.failed.is_empty());
    let original = session.next_tag("message").await;
    assert_eq!(
        original.get_child_by_tag("participants").unwrap().get_children().len(),
        2
    );
    let env = envelope_for(&original, &peer.phone);
    peer.sessions.decrypt(&peer.device, &me, &env).await.unwrap();
    peer.device.prekeys.clear();

    // the phone lost its session and asks again
    let fresh = SessionManager::new(Arc::new(MemoryStore::new()), "222-reset", 2000);
    srv.directory
        .lock()
        .unwrap()
        .bundles
        .insert(peer.phone.clone(), peer.device.prekey_bundle(None));
    session
        .send(
            Node::new("receipt")
                .with_attr("from", &peer.phone)
                .with_attr("id", sent.id.as_str())
                .with_attr("type", "retry")
                .with_attr("t", 1_700_000_200u64)
                .with_children(vec![Node::new("retry")
                    .with_attr("count", 1)
                    .with_attr("id", sent.id.as_str())]),
        )
        .await;

    let resent = session.next_tag("message").await;
    assert_eq!(resent.attr("id"), Some(sent.id.as_str()));
    let targets: Vec<Jid> = resent
        .get_child_by_tag("participants")
        .unwrap()
        .get_children_by_tag("to")
        .filter_map(|t| t.attr_jid("jid"))
        .collect();
    assert_eq!(targets, vec![peer.phone.clone()]);
    let env = envelope_for(&resent, &peer.phone);
    assert_eq!(env.kind, EnvelopeKind::PreKey);
    assert!(resent.get_child_by_tag("device-identity").is_some());
    let decrypted = fresh.decrypt(&peer.device, &me, &env).await.unwrap();
    assert_eq!(unpad_message(&decrypted.plaintext).unwrap(), b"please resend");
    client.disconnect().await;
}
