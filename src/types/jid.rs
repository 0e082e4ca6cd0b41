use std::fmt;
use std::str::FromStr;

/// Known JID servers on WhatsApp.
pub const DEFAULT_USER_SERVER: &str = "s.whatsapp.net";
pub const GROUP_SERVER: &str = "g.us";
pub const LEGACY_USER_SERVER: &str = "c.us";
pub const BROADCAST_SERVER: &str = "broadcast";
pub const HIDDEN_USER_SERVER: &str = "lid";
pub const NEWSLETTER_SERVER: &str = "newsletter";
pub const MESSENGER_SERVER: &str = "msgr";
pub const INTEROP_SERVER: &str = "interop";
pub const HOSTED_SERVER: &str = "hosted";
pub const CALL_SERVER: &str = "call";
pub const BOT_SERVER: &str = "bot";

/// The server domain part of a JID.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Server {
    DefaultUser,
    Group,
    LegacyUser,
    Broadcast,
    HiddenUser,
    Newsletter,
    Messenger,
    Interop,
    Hosted,
    Call,
    Bot,
}

impl Server {
    pub const ALL: [Server; 11] = [
        Server::DefaultUser,
        Server::Group,
        Server::LegacyUser,
        Server::Broadcast,
        Server::HiddenUser,
        Server::Newsletter,
        Server::Messenger,
        Server::Interop,
        Server::Hosted,
        Server::Call,
        Server::Bot,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DefaultUser => DEFAULT_USER_SERVER,
            Self::Group => GROUP_SERVER,
            Self::LegacyUser => LEGACY_USER_SERVER,
            Self::Broadcast => BROADCAST_SERVER,
            Self::HiddenUser => HIDDEN_USER_SERVER,
            Self::Newsletter => NEWSLETTER_SERVER,
            Self::Messenger => MESSENGER_SERVER,
            Self::Interop => INTEROP_SERVER,
            Self::Hosted => HOSTED_SERVER,
            Self::Call => CALL_SERVER,
            Self::Bot => BOT_SERVER,
        }
    }
}

impl FromStr for Server {
    type Err = JidParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|srv| srv.as_str() == s)
            .ok_or(JidParseError::UnknownServer)
    }
}

impl fmt::Display for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// JID represents a WhatsApp user/entity ID (user@server or AD-JID).
///
/// Immutable value type; equality is structural.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Jid {
    pub user: String,
    pub agent: u8,
    pub device: u16,
    pub server: Server,
}

impl Jid {
    /// New regular JID (user@server).
    pub fn new(user: impl Into<String>, server: Server) -> Self {
        Self {
            user: user.into(),
            agent: 0,
            device: 0,
            server,
        }
    }

    /// New AD-JID (user.agent:device@server) for device-specific addressing.
    pub fn new_ad(user: impl Into<String>, agent: u8, device: u16, server: Server) -> Self {
        Self {
            user: user.into(),
            agent,
            device,
            server,
        }
    }

    /// Phone-number user on the default server.
    pub fn user(user: impl Into<String>) -> Self {
        Self::new(user, Server::DefaultUser)
    }

    /// Server JID (no user).
    pub fn server(server: Server) -> Self {
        Self::new("", server)
    }

    pub fn default_server() -> Self {
        Self::server(Server::DefaultUser)
    }

    pub fn status_broadcast() -> Self {
        Self::new("status", Server::Broadcast)
    }

    /// User part as u64 (for normal user JIDs).
    pub fn user_int(&self) -> u64 {
        self.user.parse().unwrap_or(0)
    }

    /// JID without agent/device (regular user@server).
    pub fn to_non_ad(&self) -> Self {
        Self::new(self.user.clone(), self.server)
    }

    /// Same user addressed at a specific device.
    pub fn with_device(&self, device: u16) -> Self {
        Self {
            user: self.user.clone(),
            agent: self.agent,
            device,
            server: self.server,
        }
    }

    /// Whether both JIDs address the same account regardless of device.
    pub fn same_user(&self, other: &Jid) -> bool {
        self.user == other.user && self.server == other.server
    }

    pub fn is_group(&self) -> bool {
        self.server == Server::Group
    }

    pub fn is_newsletter(&self) -> bool {
        self.server == Server::Newsletter
    }

    pub fn is_broadcast_list(&self) -> bool {
        self.server == Server::Broadcast && self.user != "status"
    }

    pub fn is_server_jid(&self) -> bool {
        self.user.is_empty()
    }
}

impl FromStr for Jid {
    type Err = JidParseError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let Some((user_part, server)) = s.split_once('@') else {
            return Ok(Self::server(s.parse()?));
        };
        let server: Server = server.parse()?;

        let (user, agent, device) = if let Some((user, rest)) = user_part.split_once('.') {
            let (agent, device) = match rest.split_once(':') {
                Some((agent, device)) => (agent, Some(device)),
                None => (rest, None),
            };
            let agent = agent.parse().map_err(|_| JidParseError::Malformed)?;
            let device = match device {
                Some(d) => d.parse().map_err(|_| JidParseError::Malformed)?,
                None => 0,
            };
            (user, agent, device)
        } else if let Some((user, device)) = user_part.split_once(':') {
            let device = device.parse().map_err(|_| JidParseError::Malformed)?;
            (user, 0, device)
        } else {
            (user_part, 0, 0)
        };

        if user.contains([':', '.']) {
            return Err(JidParseError::Malformed);
        }
        Ok(Self::new_ad(user, agent, device, server))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JidParseError {
    Malformed,
    UnknownServer,
}

impl fmt::Display for JidParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Malformed => write!(f, "invalid JID format"),
            Self::UnknownServer => write!(f, "unknown JID server"),
        }
    }
}

impl std::error::Error for JidParseError {}

impl fmt::Display for Jid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.agent > 0 {
            write!(
                f,
                "{}.{}:{}@{}",
                self.user, self.agent, self.device, self.server
            )
        } else if self.device > 0 {
            write!(f, "{}:{}@{}", self.user, self.device, self.server)
        } else if !self.user.is_empty() {
            write!(f, "{}@{}", self.user, self.server)
        } else {
            write!(f, "{}", self.server)
        }
    }
}

impl serde::Serialize for Jid {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> serde::Deserialize<'de> for Jid {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Jid::from_str(&s).map_err(serde::de::Error::custom)
    }
}
