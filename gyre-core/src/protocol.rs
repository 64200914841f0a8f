//! RFC 6455 protocol definitions
//!
//! Opcodes, frame header bits, and the constants the handshake and codec
//! share.

/// WebSocket opcodes as defined in RFC 6455 section 5.2
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    /// Continuation frame
    Continuation = 0x0,
    /// Text frame
    Text = 0x1,
    /// Binary frame
    Binary = 0x2,
    /// Close frame
    Close = 0x8,
    /// Ping frame
    Ping = 0x9,
    /// Pong frame
    Pong = 0xA,
}

impl Opcode {
    /// Decode the low nibble of the first header byte. Reserved values yield `None`.
    pub fn from(value: u8) -> Option<Self> {
        match value {
            0x0 => Some(Opcode::Continuation),
            0x1 => Some(Opcode::Text),
            0x2 => Some(Opcode::Binary),
            0x8 => Some(Opcode::Close),
            0x9 => Some(Opcode::Ping),
            0xA => Some(Opcode::Pong),
            _ => None,
        }
    }

    /// Numeric value of the opcode
    pub fn value(&self) -> u8 {
        *self as u8
    }

    /// Close, ping and pong
    pub fn is_control(&self) -> bool {
        matches!(self, Opcode::Close | Opcode::Ping | Opcode::Pong)
    }

    /// Text, binary and continuation
    pub fn is_data(&self) -> bool {
        !self.is_control()
    }
}

/// Protocol constants
pub mod constants {
    use std::time::Duration;

    /// The only protocol version this implementation speaks
    pub const WEBSOCKET_VERSION: &str = "13";

    /// GUID appended to the client key before hashing
    pub const WEBSOCKET_MAGIC: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

    /// Default per-frame payload limit
    pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

    /// Default reassembled message limit
    pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

    /// Default time a client gets to complete the upgrade
    pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

    /// Decoded length of a `Sec-WebSocket-Key`
    pub const WEBSOCKET_KEY_LEN: usize = 16;

    /// Upper bound on an HTTP request head
    pub const MAX_HEADER_SIZE: usize = 8192;

    /// Most headers a request head may carry
    pub const MAX_HEADERS: usize = 64;

    /// Largest payload a control frame may carry
    pub const MAX_CONTROL_PAYLOAD: usize = 125;

    /// Largest close reason (control payload minus the code)
    pub const MAX_CLOSE_REASON_SIZE: usize = 123;
}

/// Frame header bit positions and masks
pub mod frame {
    /// Final fragment, first byte
    pub const FIN_BIT: u8 = 0x80;
    /// Extension bit 1, first byte
    pub const RSV1_BIT: u8 = 0x40;
    /// Extension bit 2
    pub const RSV2_BIT: u8 = 0x20;
    /// Extension bit 3
    pub const RSV3_BIT: u8 = 0x10;
    /// Low nibble of the first byte
    pub const OPCODE_MASK: u8 = 0x0F;
    /// Payload is masked, second byte
    pub const MASK_BIT: u8 = 0x80;
    /// 7-bit length field of the second byte
    pub const PAYLOAD_LEN_MASK: u8 = 0x7F;
    /// Marker for a 16-bit extended length
    pub const PAYLOAD_LEN_16: u8 = 126;
    /// Marker for a 64-bit extended length
    pub const PAYLOAD_LEN_64: u8 = 127;
    /// Masking key follows the length
    pub const MASKING_KEY_LEN: usize = 4;
}

/// Header names used by the upgrade (lowercase)
pub mod http_header {
    /// Must contain `websocket`
    pub const UPGRADE: &str = "upgrade";
    /// Must contain the `upgrade` token
    pub const CONNECTION: &str = "connection";
    /// Client nonce, 16 bytes base64
    pub const SEC_WEBSOCKET_KEY: &str = "sec-websocket-key";
    /// Only 13 is accepted
    pub const SEC_WEBSOCKET_VERSION: &str = "sec-websocket-version";
    /// Subprotocols offered by the client
    pub const SEC_WEBSOCKET_PROTOCOL: &str = "sec-websocket-protocol";
    /// Derived from the client key
    pub const SEC_WEBSOCKET_ACCEPT: &str = "sec-websocket-accept";
}

/// Header values used by the upgrade
pub mod http_value {
    /// `Upgrade` header value
    pub const WEBSOCKET: &str = "websocket";
    /// `Connection` header value on a 101
    pub const UPGRADE: &str = "Upgrade";
    /// `Connection` header value on a rejection
    pub const CLOSE: &str = "close";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opcode_conversion() {
        assert_eq!(Opcode::from(0x1), Some(Opcode::Text));
        assert_eq!(Opcode::from(0x3), None);
        assert_eq!(Opcode::from(0xFF), None);
        assert_eq!(Opcode::Pong.value(), 0xA);
        assert!(Opcode::Ping.is_control());
        assert!(Opcode::Continuation.is_data());
    }
}
