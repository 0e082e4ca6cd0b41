//! Pairing flows on the live connection: QR rotation, pair-success and phone link codes.

use super::connection::Exit;
use super::handlers::iq_result;
use super::{iq_node, server_jid, Client};
use crate::binary::Node;
use crate::error::{Error, PairingError};
use crate::events::Event;
use crate::pairing::{self, format_link_code, LinkCodeSession, PairingState};
use crate::types::Jid;
use crate::Result;
use tracing::{debug, info, warn};

impl Client {
    /// `<pair-device>`: the server handed us QR refs. Ack, then show them one at a time.
    pub(super) async fn handle_pair_device(&self, iq: &Node) -> Result<()> {
        self.send_node(&iq_result(iq)).await?;
        let pair = iq
            .get_child_by_tag("pair-device")
            .ok_or_else(|| Error::ProtocolViolation("missing <pair-device>".into()))?;
        let codes: Vec<String> = {
            let device = self.inner.device.read().await;
            pair.get_children_by_tag("ref")
                .filter_map(|r| r.bytes())
                .map(|r| pairing::make_qr_code(&String::from_utf8_lossy(r), &device))
                .collect()
        };
        if codes.is_empty() {
            return Err(Error::ProtocolViolation("<pair-device> without refs".into()));
        }
        info!(count = codes.len(), "received pairing refs");
        self.set_pairing_state(PairingState::AwaitingQrScan);
        self.emit(Event::Qr {
            codes: codes.clone(),
        });
        self.spawn_qr_rotation(codes);
        Ok(())
    }

    fn spawn_qr_rotation(&self, codes: Vec<String>) {
        let Some(handle) = self.conn_handle() else {
            return;
        };
        let client = self.clone();
        let first = self.inner.config.qr_first_timeout;
        let next = self.inner.config.qr_timeout;
        tokio::spawn(async move {
            for (i, code) in codes.into_iter().enumerate() {
                let timeout = if i == 0 { first } else { next };
                client.emit(Event::QrCode { code, timeout });
                tokio::time::sleep(timeout).await;
                if handle.control.is_closed()
                    || client.pairing_state() != PairingState::AwaitingQrScan
                {
                    return;
                }
            }
            warn!("no QR code was scanned in time");
            client.set_pairing_state(PairingState::Idle);
            let _ = handle.control.send(Exit::Stopped(Event::QrTimeout));
        });
    }

    /// `<pair-success>`: verify the primary's signature, persist the account and countersign.
    pub(super) async fn handle_pair_success(&self, iq: &Node) -> Result<()> {
        self.set_pairing_state(PairingState::AwaitingPairConfirmation);
        let id = iq.require_attr("id")?.to_string();
        let pair = iq
            .get_child_by_tag("pair-success")
            .ok_or_else(|| Error::ProtocolViolation("missing <pair-success>".into()))?;
        let jid = pair.get_child_by_tag("device").and_then(|d| d.attr_jid("jid"));
        let lid = pair.get_child_by_tag("device").and_then(|d| d.attr_jid("lid"));
        let platform = pair
            .get_child_by_tag("platform")
            .and_then(|p| p.attr("name"))
            .map(str::to_string);
        let business_name = pair
            .get_child_by_tag("biz")
            .and_then(|b| b.attr("name"))
            .map(str::to_string);

        let completed = self
            .complete_pairing(
                pair,
                jid.clone(),
                lid.clone(),
                platform.clone(),
                business_name.clone(),
            )
            .await;
        match completed {
            Ok(reply) => {
                self.send_node(&reply.with_attr("id", &id)).await?;
                self.set_pairing_state(PairingState::LoggedIn);
                info!(jid = ?jid, "paired successfully");
                if let Some(id) = jid {
                    self.emit(Event::PairSuccess {
                        id,
                        lid,
                        business_name,
                        platform,
                    });
                }
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "pairing failed");
                self.set_pairing_state(PairingState::Idle);
                let refusal = Node::new("iq")
                    .with_attr("to", server_jid())
                    .with_attr("type", "error")
                    .with_attr("id", &id)
                    .with_children(vec![Node::new("error")
                        .with_attr("code", 500)
                        .with_attr("text", "internal-error")]);
                self.send_node(&refusal).await?;
                self.emit(Event::PairError {
                    id: jid,
                    error: e.to_string(),
                });
                Ok(())
            }
        }
    }

    async fn complete_pairing(
        &self,
        pair: &Node,
        jid: Option<Jid>,
        lid: Option<Jid>,
        platform: Option<String>,
        business_name: Option<String>,
    ) -> Result<Node> {
        let jid = jid.ok_or_else(|| pairing_protocol("pair-success without device jid"))?;
        let container = pair
            .child_bytes("device-identity")
            .map_err(|_| pairing_protocol("pair-success without device identity"))?;
        let paired = {
            let device = self.inner.device.read().await;
            if device.is_logged_in() {
                return Err(PairingError::AlreadyPaired.into());
            }
            pairing::complete_device_identity(&device, container)?
        };
        let account = paired.account;
        self.update_device(move |d| {
            d.id = Some(jid);
            d.lid = lid;
            d.account = Some(account);
            d.platform = platform;
            d.business_name = business_name;
        })
        .await?;

        Ok(Node::new("iq")
            .with_attr("to", server_jid())
            .with_attr("type", "result")
            .with_children(vec![Node::new("pair-device-sign").with_children(vec![
                Node::new("device-identity")
                    .with_attr("key-index", paired.key_index)
                    .with_content(paired.reply),
            ])]))
    }

    /// Start phone number pairing. Returns the code (`XXXX-XXXX`) to type on the phone.
    pub async fn pair_phone(&self, phone: &str) -> Result<String> {
        if self.is_logged_in().await {
            return Err(PairingError::AlreadyPaired.into());
        }
        let mut session = LinkCodeSession::new(phone)?;
        let noise_public = self.inner.device.read().await.noise_key.public;
        let props = &self.inner.config.device_props;
        let reg = Node::new("link_code_companion_reg")
            .with_attr("jid", Jid::user(session.phone.as_str()))
            .with_attr("stage", "companion_hello")
            .with_attr("should_show_push_notification", "true")
            .with_children(vec![
                Node::new("link_code_pairing_wrapped_companion_ephemeral_pub")
                    .with_content(session.wrapped_ephemeral()?),
                Node::new("companion_server_auth_key_pub").with_content(noise_public.to_vec()),
                Node::new("companion_platform_id").with_content(b"1".to_vec()),
                Node::new("companion_platform_display")
                    .with_content(format!("{} ({})", props.platform, props.os).into_bytes()),
                Node::new("link_code_pairing_nonce").with_content(b"0".to_vec()),
            ]);
        let resp = self
            .send_iq(iq_node("md", "set", &server_jid(), vec![reg]))
            .await?;
        let pairing_ref = resp
            .get_optional_child_by_path(&["link_code_companion_reg", "link_code_pairing_ref"])
            .and_then(|n| n.bytes())
            .map(|b| String::from_utf8_lossy(b).into_owned())
            .ok_or_else(|| pairing_protocol("missing link code pairing ref"))?;
        debug!(%pairing_ref, "link code registered");
        session.pairing_ref = Some(pairing_ref);
        let code = format_link_code(&session.code);
        *self.inner.link_code.lock().unwrap_or_else(|e| e.into_inner()) = Some(session);
        self.set_pairing_state(PairingState::AwaitingPairConfirmation);
        Ok(code)
    }

    /// The primary accepted our code (`primary_hello`): derive the adv secret and finish.
    pub(super) async fn handle_link_code_notification(&self, reg: &Node) -> Result<()> {
        if reg.attr("stage") != Some("primary_hello") {
            debug!(stage = reg.attr("stage").unwrap_or_default(), "ignoring link code stage");
            return Ok(());
        }
        let session = self
            .inner
            .link_code
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or(PairingError::NoLinkCodePending)?;
        let pairing_ref = reg
            .child_bytes("link_code_pairing_ref")
            .map_err(|_| pairing_protocol("primary hello without ref"))?;
        if session.pairing_ref.as_deref().map(str::as_bytes) != Some(pairing_ref) {
            return Err(pairing_protocol("primary hello for another pairing ref"));
        }
        let wrapped = reg
            .child_bytes("link_code_pairing_wrapped_primary_ephemeral_pub")
            .map_err(|_| pairing_protocol("primary hello without ephemeral key"))?;
        let primary_identity: [u8; 32] = reg
            .child_bytes("primary_identity_pub")
            .ok()
            .and_then(|b| b.try_into().ok())
            .ok_or_else(|| pairing_protocol("primary hello without identity key"))?;

        let (bundle, adv_secret) = {
            let device = self.inner.device.read().await;
            session.finish(&device, wrapped, &primary_identity)?
        };
        let identity_public = self
            .update_device(|d| {
                d.adv_secret_key = adv_secret;
                d.identity.agreement.public
            })
            .await?;
        self.inner
            .link_code
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();

        let finish = Node::new("link_code_companion_reg")
            .with_attr("jid", Jid::user(session.phone.as_str()))
            .with_attr("stage", "companion_finish")
            .with_children(vec![
                Node::new("link_code_pairing_wrapped_key_bundle").with_content(bundle),
                Node::new("companion_identity_public").with_content(identity_public.to_vec()),
                Node::new("link_code_pairing_ref").with_content(pairing_ref.to_vec()),
            ]);
        let client = self.clone();
        tokio::spawn(async move {
            match client
                .send_iq(iq_node("md", "set", &server_jid(), vec![finish]))
                .await
            {
                Ok(_) => info!("link code pairing finished"),
                Err(e) => {
                    warn!(error = %e, "companion_finish failed");
                    client.emit(Event::PairError {
                        id: None,
                        error: e.to_string(),
                    });
                }
            }
        });
        Ok(())
    }
}

fn pairing_protocol(msg: &str) -> Error {
    PairingError::Protocol(msg.into()).into()
}
