//! Outbound messaging: per-device fan-out, receipts and logout.

use super::{iq_node, server_jid, Client};
use crate::binary::Node;
use crate::error::{DeviceFailure, Error, SendError};
use crate::events::Event;
use crate::pairing::PairingState;
use crate::signal::{pad_message, EnvelopeKind};
use crate::store::Device;
use crate::types::{from_unix, unix_now, Jid, MessageId};
use crate::Result;
use std::collections::{HashMap, VecDeque};
use std::time::SystemTime;
use tracing::{debug, info, warn};

/// Sent messages remembered for answering retry receipts.
const RECENT_MESSAGES: usize = 256;
/// Resends per message before retry receipts for it are ignored.
const MAX_RESENDS: u8 = 5;

/// Outcome of a send that reached at least one device.
#[derive(Debug)]
pub struct SendResult {
    pub id: MessageId,
    /// Server timestamp from the ack.
    pub timestamp: SystemTime,
    /// Devices that could not be encrypted for. Retry them explicitly if needed.
    pub failed: Vec<DeviceFailure>,
}

struct RecentMessage {
    to: Jid,
    payload: Vec<u8>,
    resends: u8,
}

/// Bounded map of recently sent payloads by message id; the oldest entry goes first.
#[derive(Default)]
pub(super) struct RecentMessages {
    order: VecDeque<MessageId>,
    entries: HashMap<MessageId, RecentMessage>,
}

impl RecentMessages {
    pub(super) fn insert(&mut self, id: MessageId, to: Jid, payload: Vec<u8>) {
        if self.entries.contains_key(&id) {
            return;
        }
        while self.order.len() >= RECENT_MESSAGES {
            if let Some(old) = self.order.pop_front() {
                self.entries.remove(&old);
            }
        }
        self.order.push_back(id.clone());
        self.entries.insert(
            id,
            RecentMessage {
                to,
                payload,
                resends: 0,
            },
        );
    }

    /// Recipient and payload of `id` for one more resend, if it is known and under the limit.
    pub(super) fn take_resend(&mut self, id: &str) -> Option<(Jid, Vec<u8>)> {
        let entry = self.entries.get_mut(id)?;
        if entry.resends >= MAX_RESENDS {
            return None;
        }
        entry.resends += 1;
        Some((entry.to.clone(), entry.payload.clone()))
    }
}

impl Client {
    /// Encrypt `payload` for every device of `to` (and our other devices) and send it.
    ///
    /// Sends are never retried here; a duplicate message is worse than an error.
    pub async fn send_envelope(&self, to: &Jid, payload: &[u8]) -> Result<SendResult> {
        let device = self.inner.device.read().await.clone();
        let own = device.id.clone().ok_or(Error::NotLoggedIn)?;
        let id = self.generate_message_id();

        let mut users = if to.is_group() {
            self.get_group_info(to)
                .await?
                .participants
                .into_iter()
                .map(|p| p.jid.to_non_ad())
                .collect()
        } else {
            vec![to.to_non_ad()]
        };
        if !users.iter().any(|u| u.same_user(&own)) {
            users.push(own.to_non_ad());
        }
        let devices: Vec<Jid> = self
            .get_user_devices(&users)
            .await?
            .into_iter()
            .filter(|d| !(d.same_user(&own) && d.device == own.device))
            .collect();
        let reaches_recipient = to.is_group() || devices.iter().any(|d| d.same_user(to));
        if devices.is_empty() || !reaches_recipient {
            return Err(SendError::NoDevices(to.clone()).into());
        }
        debug!(%to, %id, devices = devices.len(), "sending envelope");

        let padded = pad_message(payload);
        let results = self
            .inner
            .sessions
            .encrypt_for_devices(&device, &devices, &padded, self)
            .await?;
        self.drain_identity_changes();

        let mut participants = Vec::new();
        let mut failed = Vec::new();
        let mut any_prekey = false;
        for (jid, result) in results {
            match result {
                Ok(env) => {
                    any_prekey |= env.kind == EnvelopeKind::PreKey;
                    participants.push(Node::new("to").with_attr("jid", &jid).with_children(vec![env.to_node()]));
                }
                Err(error) => failed.push(DeviceFailure { device: jid, error }),
            }
        }
        if participants.is_empty() {
            return Err(SendError::AllDevicesFailed(failed).into());
        }

        let message = message_node(&id, to, participants, any_prekey, &device);
        let ack = self
            .send_and_wait(message, self.inner.config.request_timeout)
            .await?;
        if let Some(err) = ack.attr("error") {
            warn!(%to, %id, error = %err, "server rejected message");
            return Err(SendError::Server(err.to_string()).into());
        }
        if !failed.is_empty() {
            warn!(%to, %id, failed = failed.len(), "message not delivered to every device");
        }
        self.inner
            .recent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id.clone(), to.clone(), payload.to_vec());
        Ok(SendResult {
            id,
            timestamp: ack
                .attr_u64("t")
                .map(from_unix)
                .unwrap_or_else(SystemTime::now),
            failed,
        })
    }

    /// Answer a retry receipt from `device` by re-encrypting message `id` for that device
    /// alone. Runs in the background; the session with `device` must already be dropped.
    pub(super) fn spawn_resend(&self, id: String, device: Jid) {
        let Some((to, payload)) = self
            .inner
            .recent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take_resend(&id)
        else {
            debug!(%id, %device, "retry receipt for unknown or exhausted message");
            return;
        };
        let client = self.clone();
        tokio::spawn(async move {
            match client.resend_to_device(&id, &to, &device, &payload).await {
                Ok(()) => info!(%id, %device, "message resent after retry receipt"),
                Err(e) => warn!(%id, %device, error = %e, "resend failed"),
            }
        });
    }

    async fn resend_to_device(&self, id: &str, to: &Jid, device_jid: &Jid, payload: &[u8]) -> Result<()> {
        let device = self.inner.device.read().await.clone();
        let env = self
            .inner
            .sessions
            .encrypt_for(&device, device_jid, &pad_message(payload), self)
            .await?;
        self.drain_identity_changes();
        let prekey = env.kind == EnvelopeKind::PreKey;
        let participants = vec![Node::new("to")
            .with_attr("jid", device_jid)
            .with_children(vec![env.to_node()])];
        let message = message_node(id, to, participants, prekey, &device);
        let ack = self
            .send_and_wait(message, self.inner.config.request_timeout)
            .await?;
        match ack.attr("error") {
            Some(err) => Err(SendError::Server(err.to_string()).into()),
            None => Ok(()),
        }
    }

    /// Mark messages from `sender` in `chat` as read. `sender` is required for groups.
    pub async fn mark_read(&self, chat: &Jid, sender: Option<&Jid>, ids: &[MessageId]) -> Result<()> {
        let Some((first, rest)) = ids.split_first() else {
            return Ok(());
        };
        let mut receipt = Node::new("receipt")
            .with_attr("id", first)
            .with_attr("to", chat)
            .with_attr("type", "read")
            .with_attr("t", unix_now());
        if let Some(sender) = sender {
            receipt = receipt.with_attr("participant", sender);
        }
        if !rest.is_empty() {
            receipt = receipt.with_children(vec![Node::new("list").with_children(
                rest.iter()
                    .map(|id| Node::new("item").with_attr("id", id))
                    .collect(),
            )]);
        }
        self.send_node(&receipt).await
    }

    /// Unlink this device from the account, close the connection and delete its state.
    /// The client is left with a fresh identity, ready to pair again.
    pub async fn logout(&self) -> Result<()> {
        let own = self.get_own_id().await.ok_or(Error::NotLoggedIn)?;
        self.send_iq(iq_node(
            "md",
            "set",
            &server_jid(),
            vec![Node::new("remove-companion-device")
                .with_attr("jid", &own)
                .with_attr("reason", "user_initiated")],
        ))
        .await?;
        self.disconnect().await;
        self.inner.store.delete(&self.inner.uuid).await?;
        *self.inner.device.write().await = Device::new(self.inner.uuid.clone());
        self.set_pairing_state(PairingState::Idle);
        info!(jid = %own, "logged out");
        self.emit(Event::LoggedOut {
            on_connect: false,
            reason: None,
        });
        Ok(())
    }
}

fn message_node(id: &str, to: &Jid, participants: Vec<Node>, any_prekey: bool, device: &Device) -> Node {
    let mut children = vec![Node::new("participants").with_children(participants)];
    if any_prekey {
        if let Some(account) = &device.account {
            children.push(Node::new("device-identity").with_content(account.clone()));
        }
    }
    Node::new("message")
        .with_attr("id", id)
        .with_attr("to", to)
        .with_attr("type", "text")
        .with_children(children)
}
