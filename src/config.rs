use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default WebSocket URL for WhatsApp Web.
pub const DEFAULT_WS_URL: &str = "wss://web.whatsapp.com/ws/chat";

/// Reconnect policy for the transport.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackoffConfig {
    /// Delay before the first reconnect attempt.
    pub base: Duration,
    /// Upper bound for any single delay.
    pub max: Duration,
    pub multiplier: f64,
    /// Fraction of the delay randomized in both directions (0.2 = +/-20%).
    pub jitter: f64,
    /// Give up after this many consecutive failed attempts. `None` retries transient failures forever.
    pub max_attempts: Option<u32>,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max: Duration::from_secs(60),
            multiplier: 2.0,
            jitter: 0.2,
            max_attempts: None,
        }
    }
}

/// Properties announced to the primary device when pairing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeviceProps {
    pub os: String,
    pub platform: String,
}

impl Default for DeviceProps {
    fn default() -> Self {
        Self {
            os: "whatsapp-engine".into(),
            platform: "SAFARI".into(),
        }
    }
}

/// Client configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClientConfig {
    pub ws_url: String,
    /// Bound on dialing plus the Noise handshake.
    pub connect_timeout: Duration,
    /// Per-request timeout for IQ queries and message acks.
    pub request_timeout: Duration,
    pub keepalive_interval: Duration,
    pub keepalive_timeout: Duration,
    /// Consecutive missed keepalive acks that force a reconnect.
    pub keepalive_max_failures: u32,
    pub backoff: BackoffConfig,
    pub auto_reconnect: bool,
    /// How many message keys a receiving chain may skip ahead and keep cached.
    pub ratchet_skip_window: u32,
    /// One-time prekeys uploaded per batch.
    pub prekey_upload_count: u32,
    /// Server-side prekey count below which a new batch is uploaded.
    pub prekey_min_count: u32,
    pub signed_prekey_rotation: Duration,
    pub qr_first_timeout: Duration,
    pub qr_timeout: Duration,
    pub device_props: DeviceProps,
    /// Use this host instead of the ones announced by `media_conn`.
    pub media_host_override: Option<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            ws_url: DEFAULT_WS_URL.into(),
            connect_timeout: Duration::from_secs(20),
            request_timeout: Duration::from_secs(75),
            keepalive_interval: Duration::from_secs(25),
            keepalive_timeout: Duration::from_secs(20),
            keepalive_max_failures: 2,
            backoff: BackoffConfig::default(),
            auto_reconnect: true,
            ratchet_skip_window: 2000,
            prekey_upload_count: 50,
            prekey_min_count: 5,
            signed_prekey_rotation: Duration::from_secs(7 * 24 * 60 * 60),
            qr_first_timeout: Duration::from_secs(60),
            qr_timeout: Duration::from_secs(20),
            device_props: DeviceProps::default(),
            media_host_override: None,
        }
    }
}

impl ClientConfig {
    /// Override the websocket endpoint.
    pub fn with_ws_url(mut self, url: impl Into<String>) -> Self {
        self.ws_url = url.into();
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Override the per-request timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Override keepalive interval and ack timeout.
    pub fn with_keepalive(mut self, interval: Duration, timeout: Duration) -> Self {
        self.keepalive_interval = interval;
        self.keepalive_timeout = timeout;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_auto_reconnect(mut self, enabled: bool) -> Self {
        self.auto_reconnect = enabled;
        self
    }

    pub fn with_ratchet_skip_window(mut self, window: u32) -> Self {
        self.ratchet_skip_window = window;
        self
    }

    pub fn with_device_props(mut self, props: DeviceProps) -> Self {
        self.device_props = props;
        self
    }

    pub fn with_media_host(mut self, host: impl Into<String>) -> Self {
        self.media_host_override = Some(host.into());
        self
    }
}
