//! Constants for the WhatsApp binary protocol and connection.

/// Magic byte in the connection header.
pub const WA_MAGIC_VALUE: u8 = 6;

/// Dictionary version advertised to the server.
pub const DICT_VERSION: u8 = 3;

/// Connection header: "WA" + magic + dict version (4 bytes). Also the Noise prologue.
pub const WA_CONN_HEADER: [u8; 4] = [b'W', b'A', WA_MAGIC_VALUE, DICT_VERSION];
