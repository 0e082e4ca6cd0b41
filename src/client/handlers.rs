//! Inbound frame routing. Handlers run on the receive loop in arrival order and only
//! ever send; anything that needs a response is spawned.

use super::connection::Exit;
use super::{server_jid, Client};
use crate::binary::Node;
use crate::error::{ConnectFailureReason, ConnectionError, Error};
use crate::events::{
    CallOfferEvent, Event, MessageEvent, MessageInfo, PresenceEvent, ReceiptEvent, ReceiptKind,
    TempBanReason,
};
use crate::pairing::PairingState;
use crate::signal::{unpad_message, CipherEnvelope};
use crate::transport::ConnectionState;
use crate::types::{from_unix, unix_now, Jid};
use crate::Result;
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};

fn timestamp(node: &Node) -> SystemTime {
    node.attr_u64("t").map(from_unix).unwrap_or_else(SystemTime::now)
}

impl Client {
    pub(super) async fn handle_node(&self, node: Node) -> Option<Exit> {
        debug!(tag = %node.tag, id = node.attr("id").unwrap_or_default(), "incoming node");
        let result = match node.tag.as_str() {
            "iq" => self.handle_iq(&node).await,
            "message" => self.handle_message(&node).await,
            "receipt" => self.handle_receipt(&node).await,
            "call" => self.handle_call(&node).await,
            "notification" => self.handle_notification(&node).await,
            "presence" => self.handle_presence(&node),
            "ack" => {
                if let Some(id) = node.attr("id") {
                    self.inner.pending.resolve(id, node.clone());
                }
                Ok(())
            }
            "success" => self.handle_success(&node).await,
            "failure" => return Some(self.handle_failure(&node)),
            "stream:error" => return Some(self.handle_stream_error(&node)),
            "xmlstreamend" => return Some(Exit::Lost(ConnectionError::Disconnected.into())),
            other => {
                debug!(tag = %other, "unhandled node");
                Ok(())
            }
        };
        match result {
            Ok(()) => None,
            Err(e @ Error::ProtocolViolation(_)) => {
                warn!(tag = %node.tag, error = %e, "malformed frame, resetting connection");
                Some(Exit::Lost(e))
            }
            Err(e) => {
                warn!(tag = %node.tag, error = %e, "failed to handle node");
                None
            }
        }
    }

    async fn handle_iq(&self, node: &Node) -> Result<()> {
        let id = node.require_attr("id")?;
        match node.attr("type") {
            Some("result") | Some("error") => {
                if !self.inner.pending.resolve(id, node.clone()) {
                    debug!(%id, "response without waiter");
                }
                Ok(())
            }
            Some("get") if node.attr("xmlns") == Some("urn:xmpp:ping") => {
                self.send_node(&iq_result(node)).await
            }
            Some("set") if node.get_child_by_tag("pair-device").is_some() => {
                self.handle_pair_device(node).await
            }
            Some("set") if node.get_child_by_tag("pair-success").is_some() => {
                self.handle_pair_success(node).await
            }
            _ => {
                debug!(%id, "unhandled iq");
                Ok(())
            }
        }
    }

    async fn handle_success(&self, node: &Node) -> Result<()> {
        info!("logged in");
        if let Some(lid) = node.attr_jid("lid") {
            let stored = self.inner.device.read().await.lid.clone();
            if stored.as_ref() != Some(&lid) {
                self.update_device(|d| d.lid = Some(lid)).await?;
            }
        }
        self.inner.state.set(ConnectionState::LoggedIn);
        self.set_pairing_state(PairingState::ActiveSession);
        self.emit(Event::Connected);
        self.spawn_keepalive();
        self.spawn_key_maintenance();
        Ok(())
    }

    fn handle_failure(&self, node: &Node) -> Exit {
        let code = node.attr_u64("reason").unwrap_or(0) as i32;
        let reason = ConnectFailureReason::from_code(code);
        warn!(code, ?reason, "connect failure");
        match reason {
            Some(r) if r.is_logged_out() => Exit::Revoked {
                reason,
                on_connect: true,
            },
            Some(ConnectFailureReason::TempBanned) => Exit::Stopped(Event::TemporaryBan {
                code: node
                    .attr_u64("code")
                    .and_then(|c| TempBanReason::from_code(c as i32)),
                expire: Duration::from_secs(node.attr_u64("expire").unwrap_or(0)),
            }),
            Some(
                r @ (ConnectFailureReason::Generic
                | ConnectFailureReason::InternalServerError
                | ConnectFailureReason::ServiceUnavailable),
            ) => Exit::Lost(ConnectionError::ConnectFailure(r).into()),
            Some(r) => Exit::Stopped(Event::Disconnected {
                reason: r.to_string(),
            }),
            None => Exit::Lost(Error::ProtocolViolation(format!(
                "unknown failure reason {}",
                code
            ))),
        }
    }

    fn handle_stream_error(&self, node: &Node) -> Exit {
        let code = node.attr("code").unwrap_or_default();
        let conflict = node
            .get_child_by_tag("conflict")
            .and_then(|c| c.attr("type"));
        warn!(%code, ?conflict, "stream error");
        match (code, conflict) {
            ("515", _) => Exit::Reconnect,
            (_, Some("replaced")) => Exit::Replaced,
            ("401", _) | (_, Some("device_removed")) => Exit::Revoked {
                reason: Some(ConnectFailureReason::LoggedOut),
                on_connect: false,
            },
            ("503", _) => Exit::Lost(
                ConnectionError::ConnectFailure(ConnectFailureReason::ServiceUnavailable).into(),
            ),
            _ => Exit::Lost(Error::ProtocolViolation(format!("stream error {}", code))),
        }
    }

    async fn handle_message(&self, node: &Node) -> Result<()> {
        let from = node.require_jid("from")?;
        let id = node.require_attr("id")?.to_string();
        let is_group = from.is_group();
        let sender = if is_group {
            node.require_jid("participant")?
        } else {
            from.clone()
        };
        let own = self.inner.device.read().await.id.clone();
        let info = MessageInfo {
            chat: if is_group { from.clone() } else { from.to_non_ad() },
            is_from_me: own.as_ref().is_some_and(|o| o.same_user(&sender)),
            sender: sender.clone(),
            id: id.clone(),
            timestamp: timestamp(node),
            is_group,
            push_name: node.attr("notify").map(str::to_string),
        };

        let result = match node.get_children_by_tag("enc").next() {
            Some(enc) => self.decrypt_envelope(&sender, enc).await,
            None => Err(Error::ProtocolViolation("<message> without <enc>".into())),
        };
        self.drain_identity_changes();

        match result {
            Ok(payload) => {
                self.emit(Event::Message(MessageEvent { info, payload }));
                self.send_node(&delivery_receipt(node, &from, &sender)).await?;
            }
            Err(e) => {
                warn!(%sender, %id, error = %e, "undecryptable message");
                if matches!(e, Error::SessionMismatch(_)) {
                    // the next send to this device starts a fresh session
                    self.inner.sessions.delete_session(&sender).await?;
                }
                self.emit(Event::UndecryptableMessage {
                    info,
                    error: e.to_string(),
                });
                let registration_id = self.inner.device.read().await.registration_id;
                self.send_node(&retry_receipt(node, &from, &sender, registration_id))
                    .await?;
            }
        }
        self.send_node(&ack(node, "message")).await
    }

    async fn decrypt_envelope(&self, sender: &Jid, enc: &Node) -> Result<Vec<u8>> {
        let env = CipherEnvelope::from_node(enc)
            .map_err(|e| Error::SessionMismatch(format!("bad envelope: {}", e)))?;
        let decrypted = {
            let device = self.inner.device.read().await;
            self.inner.sessions.decrypt(&device, sender, &env).await?
        };
        if let Some(prekey_id) = decrypted.consumed_prekey {
            let remaining = self
                .update_device(|d| {
                    d.prekeys.remove(&prekey_id);
                    d.prekeys.len()
                })
                .await?;
            debug!(prekey_id, remaining, "consumed one-time prekey");
        }
        Ok(unpad_message(&decrypted.plaintext)?.to_vec())
    }

    async fn handle_receipt(&self, node: &Node) -> Result<()> {
        let from = node.require_jid("from")?;
        let sender = node.attr_jid("participant").unwrap_or_else(|| from.clone());
        let mut ids = vec![node.require_attr("id")?.to_string()];
        if let Some(list) = node.get_child_by_tag("list") {
            ids.extend(
                list.get_children_by_tag("item")
                    .filter_map(|i| i.attr("id"))
                    .map(str::to_string),
            );
        }
        let kind = ReceiptKind::from_attr(node.attr("type"));
        if kind == ReceiptKind::Retry {
            info!(%sender, "retry receipt, resending on a new session");
            self.inner.sessions.delete_session(&sender).await?;
            for id in &ids {
                self.spawn_resend(id.clone(), sender.clone());
            }
        }
        self.emit(Event::Receipt(ReceiptEvent {
            chat: from,
            sender,
            ids,
            kind,
            timestamp: timestamp(node),
        }));
        self.send_node(&ack(node, "receipt")).await
    }

    async fn handle_call(&self, node: &Node) -> Result<()> {
        let from = node.require_jid("from")?;
        if let Some(offer) = node.get_child_by_tag("offer") {
            self.emit(Event::CallOffer(CallOfferEvent {
                from,
                call_id: offer.require_attr("call-id")?.to_string(),
                call_creator: offer.attr_jid("call-creator"),
                timestamp: timestamp(node),
            }));
        }
        self.send_node(&ack(node, "call")).await
    }

    fn handle_presence(&self, node: &Node) -> Result<()> {
        let from = node.require_jid("from")?;
        self.emit(Event::Presence(PresenceEvent {
            from,
            unavailable: node.attr("type") == Some("unavailable"),
            last_seen: node
                .attr("last")
                .and_then(|l| l.parse().ok())
                .map(from_unix),
        }));
        Ok(())
    }

    async fn handle_notification(&self, node: &Node) -> Result<()> {
        match node.attr("type") {
            Some("encrypt") => {
                if let Some(count) = node
                    .get_child_by_tag("count")
                    .and_then(|c| c.attr_u64("value"))
                {
                    debug!(count, "server prekey count");
                    if count < u64::from(self.inner.config.prekey_min_count) {
                        self.spawn_prekey_upload();
                    }
                }
                if node.get_child_by_tag("identity").is_some() {
                    if let Some(from) = node.attr_jid("from") {
                        info!(%from, "peer identity changed, dropping sessions");
                        self.inner.sessions.delete_user_sessions(&from).await?;
                        self.invalidate_devices(&from);
                    }
                }
            }
            Some("devices") => {
                if let Some(from) = node.attr_jid("from") {
                    self.invalidate_devices(&from);
                }
            }
            _ => {
                if let Some(reg) = node.get_child_by_tag("link_code_companion_reg") {
                    self.handle_link_code_notification(reg).await?;
                } else {
                    debug!(kind = node.attr("type").unwrap_or_default(), "unhandled notification");
                }
            }
        }
        self.send_node(&ack(node, "notification")).await
    }
}

/// `<iq type="result">` answering `iq`.
pub(super) fn iq_result(iq: &Node) -> Node {
    Node::new("iq")
        .with_attr("id", iq.attr("id").unwrap_or_default())
        .with_attr(
            "to",
            iq.attr("from")
                .map(str::to_string)
                .unwrap_or_else(|| server_jid().to_string()),
        )
        .with_attr("type", "result")
}

/// Acknowledge an inbound stanza.
fn ack(node: &Node, class: &str) -> Node {
    let mut ack = Node::new("ack")
        .with_attr("class", class)
        .with_attr("id", node.attr("id").unwrap_or_default())
        .with_attr("to", node.attr("from").unwrap_or_default());
    if let Some(p) = node.attr("participant") {
        ack = ack.with_attr("participant", p);
    }
    if class != "message" {
        if let Some(t) = node.attr("type") {
            ack = ack.with_attr("type", t);
        }
    }
    ack
}

fn receipt_base(node: &Node, chat: &Jid, sender: &Jid) -> Node {
    let mut receipt = Node::new("receipt")
        .with_attr("id", node.attr("id").unwrap_or_default())
        .with_attr("to", chat);
    if chat.is_group() {
        receipt = receipt.with_attr("participant", sender);
    }
    receipt
}

fn delivery_receipt(node: &Node, chat: &Jid, sender: &Jid) -> Node {
    receipt_base(node, chat, sender)
}

/// Ask the sender to re-encrypt the message.
fn retry_receipt(node: &Node, chat: &Jid, sender: &Jid, registration_id: u32) -> Node {
    receipt_base(node, chat, sender)
        .with_attr("type", "retry")
        .with_children(vec![
            Node::new("retry")
                .with_attr("count", 1)
                .with_attr("id", node.attr("id").unwrap_or_default())
                .with_attr("t", node.attr("t").map(str::to_string).unwrap_or_else(|| unix_now().to_string()))
                .with_attr("v", 1),
            Node::new("registration").with_content(registration_id.to_be_bytes().to_vec()),
        ])
}
