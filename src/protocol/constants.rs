//! Wire protocol constants

/// Protocol version advertised in the hello message
pub const PROTOCOL_VERSION: i32 = 0x0001_0000;

/// Length of the negotiation preamble (length field + request code)
pub const NEGOTIATION_LEN: i32 = 8;

/// Negotiation request: client wants TLS
pub const TLS_REQUEST_CODE: i32 = 0x04D2_1630;

/// Negotiation request: client wants plaintext
pub const PLAINTEXT_REQUEST_CODE: i32 = 0x04D2_1631;

/// Maximum frame length (16 MiB)
///
/// Frames whose length field exceeds this value are rejected before allocation.
pub const MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;

/// Single-byte negotiation responses
pub mod negotiation {
    /// Server accepts TLS; the TLS handshake follows
    pub const ACCEPT_TLS: u8 = b'S';

    /// Server does not offer TLS
    pub const TLS_UNAVAILABLE: u8 = b'N';

    /// Server accepts plaintext
    pub const ACCEPT_PLAINTEXT: u8 = b'P';

    /// Server refuses plaintext; TLS is mandatory
    pub const TLS_REQUIRED: u8 = b'T';
}

/// Message type tags
pub mod tags {
    /// Client hello (metadata), answered with a status reply
    pub const HELLO: u8 = b'H';

    /// Status probe
    pub const STATUS: u8 = b'Q';

    /// Terminate
    pub const TERMINATE: u8 = b'X';

    /// Status reply
    pub const STATUS_REPLY: u8 = b'R';

    /// Error reply
    pub const ERROR_REPLY: u8 = b'E';
}
