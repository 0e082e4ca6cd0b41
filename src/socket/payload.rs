//! Client payload sent inside the final handshake message.

use crate::config::DeviceProps;
use crate::signal::DJB_TYPE;
use crate::store::Device;
use prost::Message;

#[derive(Clone, PartialEq, Message)]
pub struct UserAgent {
    #[prost(int32, optional, tag = "1")]
    pub platform: Option<i32>,
    #[prost(string, optional, tag = "5")]
    pub os_version: Option<String>,
    #[prost(string, optional, tag = "6")]
    pub manufacturer: Option<String>,
    #[prost(string, optional, tag = "7")]
    pub device: Option<String>,
}

#[derive(Clone, PartialEq, Message)]
pub struct WebInfo {
    #[prost(string, optional, tag = "1")]
    pub ref_token: Option<String>,
    #[prost(string, optional, tag = "2")]
    pub version: Option<String>,
}

#[derive(Clone, PartialEq, Message)]
pub struct DevicePairingRegistrationData {
    /// Registration id, 4 bytes big-endian.
    #[prost(bytes = "vec", optional, tag = "1")]
    pub e_regid: Option<Vec<u8>>,
    #[prost(bytes = "vec", optional, tag = "2")]
    pub e_keytype: Option<Vec<u8>>,
    #[prost(bytes = "vec", optional, tag = "3")]
    pub e_ident: Option<Vec<u8>>,
    /// Signed prekey id, 3 bytes big-endian.
    #[prost(bytes = "vec", optional, tag = "4")]
    pub e_skey_id: Option<Vec<u8>>,
    #[prost(bytes = "vec", optional, tag = "5")]
    pub e_skey_val: Option<Vec<u8>>,
    #[prost(bytes = "vec", optional, tag = "6")]
    pub e_skey_sig: Option<Vec<u8>>,
    #[prost(bytes = "vec", optional, tag = "8")]
    pub device_props: Option<Vec<u8>>,
}

#[derive(Clone, PartialEq, Message)]
pub struct ClientPayload {
    #[prost(uint64, optional, tag = "1")]
    pub username: Option<u64>,
    #[prost(bool, optional, tag = "3")]
    pub passive: Option<bool>,
    #[prost(message, optional, tag = "5")]
    pub user_agent: Option<UserAgent>,
    #[prost(message, optional, tag = "6")]
    pub web_info: Option<WebInfo>,
    #[prost(string, optional, tag = "7")]
    pub push_name: Option<String>,
    #[prost(uint32, optional, tag = "18")]
    pub device: Option<u32>,
    #[prost(message, optional, tag = "19")]
    pub device_pairing_data: Option<DevicePairingRegistrationData>,
}

impl ClientPayload {
    /// Whether this payload logs in an already paired device.
    pub fn is_login(&self) -> bool {
        self.username.is_some()
    }
}

/// Login payload for paired devices, registration payload otherwise.
pub fn client_payload(device: &Device, props: &DeviceProps) -> ClientPayload {
    let user_agent = UserAgent {
        platform: Some(0),
        os_version: Some(props.os.clone()),
        manufacturer: None,
        device: Some(props.platform.clone()),
    };
    let base = ClientPayload {
        user_agent: Some(user_agent),
        web_info: Some(WebInfo {
            ref_token: None,
            version: Some(env!("CARGO_PKG_VERSION").to_string()),
        }),
        ..Default::default()
    };

    match &device.id {
        Some(jid) => ClientPayload {
            username: Some(jid.user_int()),
            device: Some(u32::from(jid.device)),
            passive: Some(true),
            push_name: (!device.push_name.is_empty()).then(|| device.push_name.clone()),
            ..base
        },
        None => {
            let spk = &device.signed_prekey;
            let props_blob = serde_json::to_vec(props).unwrap_or_default();
            ClientPayload {
                passive: Some(false),
                device_pairing_data: Some(DevicePairingRegistrationData {
                    e_regid: Some(device.registration_id.to_be_bytes().to_vec()),
                    e_keytype: Some(vec![DJB_TYPE]),
                    e_ident: Some(device.identity.public().to_bytes()),
                    e_skey_id: Some(spk.id.to_be_bytes()[1..].to_vec()),
                    e_skey_val: Some(spk.key_pair.public.to_vec()),
                    e_skey_sig: Some(spk.signature.clone()),
                    device_props: Some(props_blob),
                }),
                ..base
            }
        }
    }
}

/// Decode a payload received by an in-process server.
pub(crate) fn decode_client_payload(data: &[u8]) -> crate::Result<ClientPayload> {
    ClientPayload::decode(data)
        .map_err(|e| crate::Error::ProtocolViolation(format!("client payload: {}", e)))
}
