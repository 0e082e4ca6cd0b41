//! # whatsapp-engine
//!
//! Protocol engine for the WhatsApp web multidevice API.
//!
//! ## Features
//!
//! - QR code and phone number pairing (multidevice)
//! - Noise XX transport with keepalive and reconnect with backoff
//! - End-to-end sessions (X3DH + double ratchet) with per-device fan-out
//! - Request/response correlation with per-call timeouts
//! - Typed event stream with ordered per-kind handlers
//! - Encrypted media upload and download
//! - Multi-account client manager over one shared store
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use whatsapp_engine::{ClientManager, ClientConfig, Event, EventKind, store::FileStore};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let store = Arc::new(FileStore::open("./accounts").await?);
//!     let manager = ClientManager::new(store, ClientConfig::default());
//!     let client = manager.new_client(Some("main"), None).await?;
//!     client.add_event_handler(EventKind::QrCode, |evt| {
//!         if let Event::QrCode { code, .. } = evt {
//!             println!("scan: {}", code);
//!         }
//!         Ok(())
//!     });
//!     client.connect().await?;
//!     Ok(())
//! }
//! ```

pub mod binary;
pub mod client;
pub mod config;
pub mod error;
pub mod events;
pub mod manager;
pub mod media;
pub mod pairing;
pub mod signal;
pub mod socket;
pub mod store;
pub mod transport;
pub mod types;

pub use client::{
    ChatPresence, ChatPresenceMedia, Client, ClientBuilder, GroupInfo, GroupParticipant,
    IsOnWhatsAppResponse, SendResult, UserInfo,
};
pub use config::{BackoffConfig, ClientConfig, DeviceProps};
pub use error::{Error, Result};
pub use events::{Event, EventKind, HandlerId};
pub use manager::ClientManager;
pub use media::{MediaReference, MediaType};
pub use pairing::PairingState;
pub use store::{Device, DeviceStore, Store};
pub use transport::{ConnectionState, Transport};
pub use types::{Jid, MessageId};
