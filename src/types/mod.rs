mod jid;

pub use jid::{Jid, JidParseError, Server};

/// Message ID type (WhatsApp internal ID string).
pub type MessageId = String;

/// Seconds since the unix epoch, as carried in node `t` attributes.
pub(crate) fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Convert a `t` attribute into a SystemTime.
pub(crate) fn from_unix(secs: u64) -> std::time::SystemTime {
    std::time::UNIX_EPOCH + std::time::Duration::from_secs(secs)
}
