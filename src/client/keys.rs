//! Prekey maintenance and bundle fetching over the `encrypt` namespace.

use super::{iq_node, server_jid, Client};
use crate::binary::Node;
use crate::error::Error;
use crate::signal::{
    IdentityKey, PreKey, PreKeyBundle, PreKeyFetcher, PreKeyPublic, SignedPreKey, DJB_TYPE,
};
use crate::store::Device;
use crate::types::{unix_now, Jid};
use crate::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use tracing::{debug, info, warn};

fn id_bytes(id: u32) -> Vec<u8> {
    id.to_be_bytes()[1..].to_vec()
}

fn parse_id(b: &[u8]) -> Result<u32> {
    if b.is_empty() || b.len() > 4 {
        return Err(Error::ProtocolViolation(format!("bad key id length {}", b.len())));
    }
    Ok(b.iter().fold(0u32, |acc, x| (acc << 8) | u32::from(*x)))
}

fn key32(b: &[u8], what: &str) -> Result<[u8; 32]> {
    b.try_into()
        .map_err(|_| Error::ProtocolViolation(format!("{} must be 32 bytes", what)))
}

fn prekey_node(id: u32, public: &[u8; 32]) -> Node {
    Node::new("key").with_children(vec![
        Node::new("id").with_content(id_bytes(id)),
        Node::new("value").with_content(public.to_vec()),
    ])
}

fn signed_prekey_node(id: u32, public: &[u8; 32], signature: &[u8]) -> Node {
    Node::new("skey").with_children(vec![
        Node::new("id").with_content(id_bytes(id)),
        Node::new("value").with_content(public.to_vec()),
        Node::new("signature").with_content(signature.to_vec()),
    ])
}

fn upload_node(device: &Device, keys: &[PreKey]) -> Node {
    let spk = &device.signed_prekey;
    iq_node(
        "encrypt",
        "set",
        &server_jid(),
        vec![
            Node::new("registration").with_content(device.registration_id.to_be_bytes().to_vec()),
            Node::new("type").with_content(vec![DJB_TYPE]),
            Node::new("identity").with_content(device.identity.public().to_bytes()),
            Node::new("list").with_children(
                keys.iter()
                    .map(|k| prekey_node(k.id, &k.key_pair.public))
                    .collect(),
            ),
            signed_prekey_node(spk.id, &spk.key_pair.public, &spk.signature),
        ],
    )
}

/// `<user jid>` element carrying a device's bundle, as returned by an `encrypt` key query.
pub fn prekey_bundle_node(jid: &Jid, bundle: &PreKeyBundle) -> Node {
    let mut children = vec![
        Node::new("registration").with_content(bundle.registration_id.to_be_bytes().to_vec()),
        Node::new("type").with_content(vec![DJB_TYPE]),
        Node::new("identity").with_content(bundle.identity.to_bytes()),
        signed_prekey_node(
            bundle.signed_prekey_id,
            &bundle.signed_prekey,
            &bundle.signed_prekey_signature,
        ),
    ];
    if let Some(pk) = &bundle.prekey {
        children.push(prekey_node(pk.id, &pk.public));
    }
    Node::new("user").with_attr("jid", jid).with_children(children)
}

/// Parse one `<user>` element of a key query response.
pub fn parse_prekey_bundle(user: &Node) -> Result<PreKeyBundle> {
    let registration_id = parse_id(user.child_bytes("registration")?)?;
    let identity = IdentityKey::from_bytes(user.child_bytes("identity")?)?;
    let skey = user
        .get_child_by_tag("skey")
        .ok_or_else(|| Error::ProtocolViolation("bundle without signed prekey".into()))?;
    let prekey = match user.get_child_by_tag("key") {
        Some(k) => Some(PreKeyPublic {
            id: parse_id(k.child_bytes("id")?)?,
            public: key32(k.child_bytes("value")?, "prekey")?,
        }),
        None => None,
    };
    Ok(PreKeyBundle {
        registration_id,
        identity,
        signed_prekey_id: parse_id(skey.child_bytes("id")?)?,
        signed_prekey: key32(skey.child_bytes("value")?, "signed prekey")?,
        signed_prekey_signature: skey.child_bytes("signature")?.to_vec(),
        prekey,
    })
}

impl Client {
    /// Number of our one-time prekeys the server still holds.
    pub async fn get_server_prekey_count(&self) -> Result<u64> {
        let resp = self
            .send_iq(iq_node("encrypt", "get", &server_jid(), vec![Node::new("count")]))
            .await?;
        resp.get_child_by_tag("count")
            .and_then(|c| c.attr_u64("value"))
            .ok_or_else(|| Error::ProtocolViolation("prekey count response without value".into()))
    }

    /// Top the server back up to the configured number of one-time prekeys. Keys are
    /// persisted before they are announced, so a message using one can always be opened.
    pub async fn upload_prekeys(&self) -> Result<usize> {
        let _guard = self.inner.prekey_upload.lock().await;
        let want = self.inner.config.prekey_upload_count;
        let (device, keys) = self
            .update_device(|d| {
                let mut keys = d.unuploaded_prekeys();
                let missing = want.saturating_sub(keys.len() as u32);
                keys.extend(d.generate_prekeys(missing));
                (d.clone(), keys)
            })
            .await?;
        self.send_iq(upload_node(&device, &keys)).await?;
        self.update_device(Device::mark_prekeys_uploaded).await?;
        info!(count = keys.len(), "uploaded prekeys");
        Ok(keys.len())
    }

    /// Replace the signed prekey. The old one is kept as previous so sessions being
    /// set up against it still work.
    pub async fn rotate_signed_prekey(&self) -> Result<()> {
        let next: SignedPreKey = {
            let mut scratch = self.inner.device.read().await.clone();
            scratch.rotate_signed_prekey().clone()
        };
        let rotate = Node::new("rotate").with_children(vec![signed_prekey_node(
            next.id,
            &next.key_pair.public,
            &next.signature,
        )]);
        self.send_iq(iq_node("encrypt", "set", &server_jid(), vec![rotate]))
            .await?;
        let id = next.id;
        self.update_device(move |d| {
            d.previous_signed_prekey = Some(std::mem::replace(&mut d.signed_prekey, next));
        })
        .await?;
        info!(id, "rotated signed prekey");
        Ok(())
    }

    async fn maintain_keys(&self) -> Result<()> {
        let count = self.get_server_prekey_count().await?;
        debug!(count, "server prekey count after login");
        if count < u64::from(self.inner.config.prekey_min_count) {
            self.upload_prekeys().await?;
        }
        let age = unix_now().saturating_sub(self.inner.device.read().await.signed_prekey.created_at);
        if age >= self.inner.config.signed_prekey_rotation.as_secs() {
            self.rotate_signed_prekey().await?;
        }
        Ok(())
    }

    /// Post-login key checks, off the receive loop.
    pub(super) fn spawn_key_maintenance(&self) {
        let client = self.clone();
        tokio::spawn(async move {
            if let Err(e) = client.maintain_keys().await {
                warn!(error = %e, "prekey maintenance failed");
            }
        });
    }

    pub(super) fn spawn_prekey_upload(&self) {
        let client = self.clone();
        tokio::spawn(async move {
            if let Err(e) = client.upload_prekeys().await {
                warn!(error = %e, "prekey upload failed");
            }
        });
    }
}

#[async_trait]
impl PreKeyFetcher for Client {
    async fn fetch_prekey_bundles(&self, devices: &[Jid]) -> Result<HashMap<Jid, PreKeyBundle>> {
        let users = devices
            .iter()
            .map(|j| Node::new("user").with_attr("jid", j))
            .collect();
        let resp = self
            .send_iq(iq_node(
                "encrypt",
                "get",
                &server_jid(),
                vec![Node::new("key").with_children(users)],
            ))
            .await?;
        let list = resp
            .get_child_by_tag("list")
            .ok_or_else(|| Error::ProtocolViolation("key response without list".into()))?;
        let mut bundles = HashMap::new();
        for user in list.get_children_by_tag("user") {
            let jid = user.require_jid("jid")?;
            if let Some(err) = user.get_child_by_tag("error") {
                warn!(%jid, code = err.attr("code").unwrap_or_default(), "no bundle for device");
                continue;
            }
            match parse_prekey_bundle(user) {
                Ok(bundle) => {
                    bundles.insert(jid, bundle);
                }
                Err(e) => warn!(%jid, error = %e, "malformed bundle"),
            }
        }
        Ok(bundles)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_ids_are_three_bytes() {
        assert_eq!(id_bytes(0x010203), vec![1, 2, 3]);
        assert_eq!(parse_id(&[1, 2, 3]).unwrap(), 0x010203);
        assert!(parse_id(&[]).is_err());
    }

    #[test]
    fn bundle_node_parses_back() {
        let mut peer = Device::new("peer");
        let keys = peer.generate_prekeys(1);
        let bundle = peer.prekey_bundle(keys.first());
        let jid: Jid = "555:3@s.whatsapp.net".parse().unwrap();

        let node = prekey_bundle_node(&jid, &bundle);
        assert_eq!(node.attr("jid"), Some("555:3@s.whatsapp.net"));
        let parsed = parse_prekey_bundle(&node).unwrap();
        assert_eq!(parsed.registration_id, bundle.registration_id);
        assert_eq!(parsed.identity, bundle.identity);
        assert_eq!(parsed.prekey, bundle.prekey);
        assert!(parsed.verify_signature());

        let without_prekey = prekey_bundle_node(&jid, &peer.prekey_bundle(None));
        assert!(parse_prekey_bundle(&without_prekey).unwrap().prekey.is_none());
    }

    #[test]
    fn upload_lists_keys_and_signed_prekey() {
        let mut device = Device::new("me");
        let keys = device.generate_prekeys(4);
        let iq = upload_node(&device, &keys);
        assert_eq!(iq.attr("xmlns"), Some("encrypt"));
        assert_eq!(iq.get_child_by_tag("list").unwrap().get_children().len(), 4);
        assert_eq!(iq.child_bytes("type").unwrap(), &[DJB_TYPE]);
        assert_eq!(iq.child_bytes("identity").unwrap().len(), 64);
        let skey = iq.get_child_by_tag("skey").unwrap();
        assert_eq!(parse_id(skey.child_bytes("id").unwrap()).unwrap(), device.signed_prekey.id);
    }
}
