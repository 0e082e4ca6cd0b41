//! Scripted in-process server: answers the Noise handshake and the routine IQs, and
//! hands everything else to the test.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::time::timeout;
use whatsapp_engine::binary::Node;
use whatsapp_engine::client::prekey_bundle_node;
use whatsapp_engine::events::Event;
use whatsapp_engine::signal::{KeyPair, PreKeyBundle};
use whatsapp_engine::socket::{respond_handshake, ClientPayload, NoiseTransport};
use whatsapp_engine::store::{Device, MemoryStore};
use whatsapp_engine::transport::memory::{Accepted, MemoryConnector};
use whatsapp_engine::{Client, ClientConfig, Jid};

pub const WAIT: Duration = Duration::from_secs(5);
pub const MEDIA_HOST: &str = "media.test";

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// What the server knows about other accounts.
#[derive(Default)]
pub struct Directory {
    pub devices: HashMap<Jid, Vec<Jid>>,
    pub bundles: HashMap<Jid, PreKeyBundle>,
    /// Leave keepalive pings unanswered and hidden from the test.
    pub ignore_pings: bool,
    /// Forward messages without acking them.
    pub hold_acks: bool,
}

pub struct FakeServer {
    pub connector: Arc<MemoryConnector>,
    pub directory: Arc<Mutex<Directory>>,
    accepted: UnboundedReceiver<Accepted>,
    key: KeyPair,
}

/// One accepted connection.
pub struct Session {
    pub payload: ClientPayload,
    out: Arc<NoiseTransport>,
    inbox: UnboundedReceiver<Node>,
}

impl FakeServer {
    pub fn new() -> Self {
        let (connector, accepted) = MemoryConnector::new();
        Self {
            connector: Arc::new(connector),
            directory: Arc::new(Mutex::new(Directory::default())),
            accepted,
            key: KeyPair::generate(),
        }
    }

    pub fn client(&self, device: Device, config: ClientConfig) -> Client {
        Client::builder(Arc::new(MemoryStore::new()), device)
            .config(config)
            .connector(self.connector.clone())
            .build()
            .expect("client")
    }

    /// Take the next dial without answering it. Keep the value alive to leave the
    /// client waiting.
    pub async fn accept_raw(&mut self) -> Accepted {
        timeout(WAIT, self.accepted.recv())
            .await
            .expect("client never dialed")
            .expect("connector dropped")
    }

    /// Wait for the next dial and run the responder handshake on it.
    pub async fn accept(&mut self) -> Session {
        let accepted = self.accept_raw().await;
        let (out, mut frames, payload) = respond_handshake(
            accepted.end.transport,
            Box::new(accepted.end.frames),
            &self.key.private,
        )
        .await
        .expect("handshake");
        let out = Arc::new(out);
        let (inbox_tx, inbox) = mpsc::unbounded_channel();
        let directory = self.directory.clone();
        let replies = out.clone();
        tokio::spawn(async move {
            while let Ok(frame) = frames.next_decrypted_frame().await {
                let node = Node::decode(&frame).expect("client sent undecodable node");
                let (reply, forward) = auto_reply(&node, &directory);
                if let Some(reply) = reply {
                    let _ = replies.send_encrypted(&reply.encode().expect("encode")).await;
                }
                if forward && inbox_tx.send(node).is_err() {
                    break;
                }
            }
        });
        Session {
            payload,
            out,
            inbox,
        }
    }
}

impl Session {
    pub async fn send(&self, node: Node) {
        self.out
            .send_encrypted(&node.encode().expect("encode"))
            .await
            .expect("server send");
    }

    /// Next node the client sent that was not answered automatically.
    pub async fn next(&mut self) -> Node {
        timeout(WAIT, self.inbox.recv())
            .await
            .expect("nothing received")
            .expect("connection closed")
    }

    /// Next unanswered node if one arrives within `wait`.
    pub async fn try_next(&mut self, wait: Duration) -> Option<Node> {
        timeout(wait, self.inbox.recv()).await.ok().flatten()
    }

    pub async fn next_tag(&mut self, tag: &str) -> Node {
        loop {
            let node = self.next().await;
            if node.tag == tag {
                return node;
            }
        }
    }

    /// Next request with the given xmlns.
    pub async fn next_iq(&mut self, xmlns: &str) -> Node {
        loop {
            let node = self.next().await;
            if node.tag == "iq" && node.attr("xmlns") == Some(xmlns) {
                return node;
            }
        }
    }
}

/// Next event matching `pred`, skipping the rest.
pub async fn wait_event(events: &mut UnboundedReceiver<Event>, pred: impl Fn(&Event) -> bool) -> Event {
    timeout(WAIT, async {
        loop {
            let event = events.recv().await.expect("event stream closed");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("event not emitted")
}

fn result_for(iq: &Node, children: Vec<Node>) -> Node {
    let node = Node::new("iq")
        .with_attr("id", iq.attr("id").unwrap_or_default())
        .with_attr("type", "result")
        .with_attr("from", "s.whatsapp.net");
    if children.is_empty() {
        node
    } else {
        node.with_children(children)
    }
}

fn requested_users(iq: &Node, path: &[&str]) -> Vec<Jid> {
    iq.get_optional_child_by_path(path)
        .map(|list| {
            list.get_children_by_tag("user")
                .filter_map(|u| u.attr_jid("jid"))
                .collect()
        })
        .unwrap_or_default()
}

/// Reply for routine traffic, and whether the test should see the node.
fn auto_reply(node: &Node, directory: &Mutex<Directory>) -> (Option<Node>, bool) {
    match node.tag.as_str() {
        "message" if directory.lock().unwrap().hold_acks => (None, true),
        "message" => {
            let ack = Node::new("ack")
                .with_attr("class", "message")
                .with_attr("id", node.attr("id").unwrap_or_default())
                .with_attr("from", node.attr("to").unwrap_or_default())
                .with_attr("t", 1_700_000_000u64);
            (Some(ack), true)
        }
        "iq" if matches!(node.attr("type"), Some("get") | Some("set")) => {
            let dir = directory.lock().unwrap();
            match node.attr("xmlns") {
                Some("w:p") if dir.ignore_pings => (None, false),
                Some("w:p") => (Some(result_for(node, vec![])), false),
                Some("encrypt") if node.get_child_by_tag("count").is_some() => {
                    let count = Node::new("count").with_attr("value", 100);
                    (Some(result_for(node, vec![count])), false)
                }
                Some("encrypt") if node.get_child_by_tag("key").is_some() => {
                    let users = requested_users(node, &["key"])
                        .into_iter()
                        .map(|jid| match dir.bundles.get(&jid) {
                            Some(bundle) => prekey_bundle_node(&jid, bundle),
                            None => Node::new("user").with_attr("jid", &jid).with_children(vec![
                                Node::new("error").with_attr("code", 406).with_attr("text", "not-acceptable"),
                            ]),
                        })
                        .collect();
                    (
                        Some(result_for(node, vec![Node::new("list").with_children(users)])),
                        false,
                    )
                }
                Some("encrypt") => (Some(result_for(node, vec![])), true),
                Some("usync") => {
                    let users = requested_users(node, &["usync", "list"])
                        .into_iter()
                        .map(|jid| {
                            let devices = dir
                                .devices
                                .get(&jid.to_non_ad())
                                .map(|list| {
                                    list.iter()
                                        .map(|d| Node::new("device").with_attr("id", d.device))
                                        .collect()
                                })
                                .unwrap_or_default();
                            Node::new("user").with_attr("jid", &jid).with_children(vec![
                                Node::new("devices").with_children(vec![
                                    Node::new("device-list").with_children(devices),
                                ]),
                            ])
                        })
                        .collect();
                    let usync = Node::new("usync")
                        .with_children(vec![Node::new("list").with_children(users)]);
                    (Some(result_for(node, vec![usync])), false)
                }
                Some("w:m") => {
                    let conn = Node::new("media_conn")
                        .with_attr("auth", "token")
                        .with_attr("ttl", 300)
                        .with_children(vec![Node::new("host").with_attr("hostname", MEDIA_HOST)]);
                    (Some(result_for(node, vec![conn])), false)
                }
                _ => (None, true),
            }
        }
        _ => (None, true),
    }
}
