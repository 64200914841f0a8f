//! Error types for the wire layer
//!
//! Everything that can go wrong while decoding frames, reassembling messages,
//! negotiating the upgrade handshake or moving bytes through a transport.

#![allow(missing_docs)]

use std::fmt;
use thiserror::Error;

/// Result type alias for wire-level operations
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level wire error
#[derive(Error, Debug)]
pub enum Error {
    /// Upgrade handshake errors
    #[error("bad upgrade request: {0}")]
    Protocol(#[from] ProtocolError),

    /// Frame decoding errors
    #[error("bad frame: {0}")]
    Frame(#[from] FrameError),

    /// Message reassembly errors
    #[error("bad message: {0}")]
    Message(#[from] MessageError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Malformed close frame payload
    #[error("bad close payload: {0}")]
    Close(#[from] CloseError),

    /// Transport-level connection errors
    #[error("transport: {0}")]
    Connection(String),
}

impl Error {
    /// Close code to send to the peer when this error ends a WebSocket session.
    pub fn close_code(&self) -> CloseCode {
        match self {
            Error::Frame(FrameError::TooLarge { .. }) | Error::Message(MessageError::TooLarge { .. }) => {
                CloseCode::TooBig
            }
            Error::Message(MessageError::InvalidUtf8) | Error::Close(CloseError::InvalidUtf8) => {
                CloseCode::InvalidPayload
            }
            Error::Io(_) | Error::Connection(_) => CloseCode::Abnormal,
            _ => CloseCode::ProtocolError,
        }
    }
}

/// Upgrade handshake errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("request head is not valid HTTP/1.1 ({0})")]
    MalformedRequest(String),

    #[error("request head is longer than {max} bytes")]
    HeadTooLarge { max: usize },

    #[error("upgrade must use GET, got {0}")]
    InvalidMethod(String),

    #[error("{0} header is missing")]
    MissingHeader(&'static str),

    #[error("{header} header has unexpected value {value:?}")]
    InvalidHeaderValue { header: &'static str, value: String },

    #[error("WebSocket version {0} is not 13")]
    UnsupportedVersion(String),
}

/// Frame decoding errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// More bytes are needed before the frame can be decoded
    #[error("{have} of {needed} bytes buffered")]
    InsufficientData { needed: usize, have: usize },

    #[error("{size}-byte payload over the {max}-byte frame limit")]
    TooLarge { size: usize, max: usize },

    #[error("opcode {0:#x} is not defined")]
    InvalidOpcode(u8),

    #[error("RSV bits set without a negotiated extension")]
    ReservedBitsSet,

    #[error("unmasked frame from a client")]
    UnmaskedClientFrame,

    #[error("fragmented control frame")]
    FragmentedControlFrame,

    #[error("{0}-byte control frame payload, limit is 125")]
    ControlFrameTooLarge(usize),
}

impl FrameError {
    /// True when the buffer simply holds an incomplete frame.
    pub fn is_incomplete(&self) -> bool {
        matches!(self, FrameError::InsufficientData { .. })
    }
}

/// Message reassembly errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MessageError {
    #[error("{size}-byte message over the {max}-byte limit")]
    TooLarge { size: usize, max: usize },

    #[error("continuation frame with no message in progress")]
    UnexpectedContinuation,

    #[error("data frame interrupts a fragmented message")]
    InterleavedMessage,

    #[error("text message is not UTF-8")]
    InvalidUtf8,
}

/// Close payload errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CloseError {
    #[error("close code {code} may not be sent")]
    InvalidCode { code: u16 },

    #[error("one-byte close payload")]
    Truncated,

    #[error("{len}-byte close reason, limit is {max}")]
    ReasonTooLong { len: usize, max: usize },

    #[error("close reason is not UTF-8")]
    InvalidUtf8,
}

/// WebSocket close codes as defined in RFC 6455 section 7.4
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloseCode {
    /// 1000
    Normal,
    /// 1001, endpoint going away
    Away,
    /// 1002
    ProtocolError,
    /// 1003, data type not accepted
    Unsupported,
    /// 1005, never sent on the wire
    NoStatus,
    /// 1006, never sent on the wire
    Abnormal,
    /// 1007, payload inconsistent with the message type
    InvalidPayload,
    /// 1008
    PolicyViolation,
    /// 1009
    TooBig,
    /// 1010
    MandatoryExtension,
    /// 1011
    Internal,
    /// 1015, never sent on the wire
    TlsHandshake,
    /// Codes 3000-4999
    Application(u16),
    /// Anything else seen on the wire
    Other(u16),
}

impl CloseCode {
    /// Classify a code read from a close payload
    pub fn from(code: u16) -> Self {
        match code {
            1000 => CloseCode::Normal,
            1001 => CloseCode::Away,
            1002 => CloseCode::ProtocolError,
            1003 => CloseCode::Unsupported,
            1005 => CloseCode::NoStatus,
            1006 => CloseCode::Abnormal,
            1007 => CloseCode::InvalidPayload,
            1008 => CloseCode::PolicyViolation,
            1009 => CloseCode::TooBig,
            1010 => CloseCode::MandatoryExtension,
            1011 => CloseCode::Internal,
            1015 => CloseCode::TlsHandshake,
            code if (3000..=4999).contains(&code) => CloseCode::Application(code),
            code => CloseCode::Other(code),
        }
    }

    /// Wire value
    pub fn code(&self) -> u16 {
        match self {
            CloseCode::Normal => 1000,
            CloseCode::Away => 1001,
            CloseCode::ProtocolError => 1002,
            CloseCode::Unsupported => 1003,
            CloseCode::NoStatus => 1005,
            CloseCode::Abnormal => 1006,
            CloseCode::InvalidPayload => 1007,
            CloseCode::PolicyViolation => 1008,
            CloseCode::TooBig => 1009,
            CloseCode::MandatoryExtension => 1010,
            CloseCode::Internal => 1011,
            CloseCode::TlsHandshake => 1015,
            CloseCode::Application(code) | CloseCode::Other(code) => *code,
        }
    }

    /// Codes that only exist locally and never go on the wire
    pub fn is_reserved(&self) -> bool {
        matches!(
            self,
            CloseCode::NoStatus | CloseCode::Abnormal | CloseCode::TlsHandshake
        )
    }

    /// Whether a peer may legitimately send this code
    pub fn is_sendable(&self) -> bool {
        match self {
            CloseCode::Other(_) => false,
            code => !code.is_reserved(),
        }
    }
}

impl fmt::Display for CloseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} ({})", self, self.code())
    }
}
