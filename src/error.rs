use crate::types::Jid;
use thiserror::Error;

/// Library result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur when using the engine.
#[derive(Error, Debug)]
pub enum Error {
    /// Transient network failure. Retryable.
    #[error("connection: {0}")]
    Connection(#[from] ConnectionError),

    /// The server revoked this device. Requires pairing again.
    #[error("authentication revoked{}", .0.map(|r| format!(": {}", r)).unwrap_or_default())]
    AuthRevoked(Option<ConnectFailureReason>),

    /// The peer crypto session is out of sync and must be rebuilt.
    #[error("session mismatch: {0}")]
    SessionMismatch(String),

    #[error("timed out waiting for response")]
    Timeout,

    #[error("integrity: {0}")]
    Integrity(#[from] IntegrityError),

    /// Malformed or unexpected data from the server.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// The client was closed while the call was in flight.
    #[error("cancelled")]
    Cancelled,

    #[error("pairing: {0}")]
    Pairing(#[from] PairingError),

    #[error("store: {0}")]
    Store(#[from] StoreError),

    #[error("send: {0}")]
    Send(#[from] SendError),

    #[error("server returned error {code}: {text}")]
    Iq { code: u16, text: String },

    #[error("binary protocol: {0}")]
    Binary(String),

    #[error("not connected")]
    NotConnected,

    #[error("not logged in")]
    NotLoggedIn,

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Whether the failure came from the network and the call may be repeated.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Connection(ConnectionError::ConnectFailure(reason)) => !reason.is_logged_out(),
            Self::Connection(_) => true,
            _ => false,
        }
    }

    /// Whether the failure forces a full reconnect or re-pair cycle rather than a local retry.
    pub fn forces_reset(&self) -> bool {
        matches!(self, Self::AuthRevoked(_) | Self::ProtocolViolation(_))
    }
}

/// Connection-related errors.
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("websocket: {0}")]
    WebSocket(String),

    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("disconnected")]
    Disconnected,

    /// Dial plus Noise handshake did not finish within the connect timeout.
    #[error("connect timed out after {0:?}")]
    ConnectTimeout(std::time::Duration),

    #[error("keepalive lost")]
    KeepAliveLost,

    #[error("connect failure: {0}")]
    ConnectFailure(ConnectFailureReason),

    /// Media host request failed.
    #[error("http: {0}")]
    Http(String),
}

/// Reason code for connection failures sent by the server in `<failure>` and `<stream:error>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ConnectFailureReason {
    Generic = 400,
    LoggedOut = 401,
    TempBanned = 402,
    MainDeviceGone = 403,
    ClientOutdated = 405,
    UnknownLogout = 406,
    BadUserAgent = 409,
    CATExpired = 413,
    CATInvalid = 414,
    NotFound = 415,
    ClientUnknown = 418,
    InternalServerError = 500,
    Experimental = 501,
    ServiceUnavailable = 503,
}

impl ConnectFailureReason {
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            400 => Some(Self::Generic),
            401 => Some(Self::LoggedOut),
            402 => Some(Self::TempBanned),
            403 => Some(Self::MainDeviceGone),
            405 => Some(Self::ClientOutdated),
            406 => Some(Self::UnknownLogout),
            409 => Some(Self::BadUserAgent),
            413 => Some(Self::CATExpired),
            414 => Some(Self::CATInvalid),
            415 => Some(Self::NotFound),
            418 => Some(Self::ClientUnknown),
            500 => Some(Self::InternalServerError),
            501 => Some(Self::Experimental),
            503 => Some(Self::ServiceUnavailable),
            _ => None,
        }
    }

    pub fn code(&self) -> i32 {
        *self as i32
    }

    /// The server no longer accepts this device's keys.
    pub fn is_logged_out(&self) -> bool {
        matches!(
            self,
            Self::LoggedOut | Self::MainDeviceGone | Self::UnknownLogout
        )
    }
}

impl std::fmt::Display for ConnectFailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let msg = match self {
            Self::LoggedOut => "logged out from another device",
            Self::TempBanned => "account temporarily banned",
            Self::MainDeviceGone => "primary device was logged out",
            Self::UnknownLogout => "logged out for unknown reason",
            Self::ClientOutdated => "client is out of date",
            Self::BadUserAgent => "client user agent was rejected",
            Self::CATExpired => "messenger crypto auth token has expired",
            Self::CATInvalid => "messenger crypto auth token is invalid",
            _ => "connection failure",
        };
        write!(f, "{} (code {})", msg, *self as i32)
    }
}

/// Pairing-related errors.
#[derive(Error, Debug)]
pub enum PairingError {
    #[error("invalid device identity HMAC")]
    InvalidDeviceIdentityHmac,

    #[error("invalid device signature")]
    InvalidDeviceSignature,

    #[error("already paired")]
    AlreadyPaired,

    #[error("invalid phone number")]
    InvalidPhoneNumber,

    #[error("no link code pairing in progress")]
    NoLinkCodePending,

    #[error("protocol: {0}")]
    Protocol(String),
}

/// Store (device/session) errors.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("device {0} not found")]
    NotFound(String),

    /// The persisted document could not be parsed. Identity is never reset silently.
    #[error("store is corrupt: {0}")]
    Corrupt(String),

    #[error("store schema version {found} does not match expected {expected}")]
    SchemaMismatch { found: u32, expected: u32 },

    #[error("device {0} is already in use by another client")]
    DeviceInUse(String),

    #[error("save failed: {0}")]
    Save(String),

    #[error("load failed: {0}")]
    Load(String),
}

/// Send message errors.
#[derive(Error, Debug)]
pub enum SendError {
    #[error("recipient {0} has no devices")]
    NoDevices(Jid),

    #[error("all {} recipient devices failed", .0.len())]
    AllDevicesFailed(Vec<DeviceFailure>),

    #[error("server rejected message: {0}")]
    Server(String),
}

/// A single device that could not be encrypted for or delivered to.
#[derive(Debug)]
pub struct DeviceFailure {
    pub device: Jid,
    pub error: Error,
}

/// Media integrity failures. Never retried automatically.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IntegrityError {
    #[error("encrypted file hash mismatch")]
    EncryptedHashMismatch,

    #[error("media MAC mismatch")]
    MacMismatch,

    #[error("media decryption failed")]
    DecryptFailed,

    #[error("plaintext file hash mismatch")]
    PlaintextHashMismatch,

    #[error("file length mismatch: expected {expected}, got {actual}")]
    LengthMismatch { expected: u64, actual: u64 },
}
