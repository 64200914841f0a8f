//! Complete WebSocket messages and fragment reassembly

use crate::error::{CloseCode, CloseError, MessageError, Result};
use crate::frame::Frame;
use crate::protocol::{constants, Opcode};
use bytes::{Bytes, BytesMut};
use std::fmt;

/// A complete WebSocket message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// UTF-8 text message
    Text(String),
    /// Binary message
    Binary(Bytes),
    /// Ping control message
    Ping(Bytes),
    /// Pong control message
    Pong(Bytes),
    /// Close control message, with the code and reason if the peer sent one
    Close(Option<CloseFrame>),
}

/// Code and reason carried by a close message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseFrame {
    /// Status code from the first two payload bytes
    pub code: CloseCode,
    /// UTF-8, at most 123 bytes
    pub reason: String,
}

impl Message {
    /// Text message
    pub fn text(text: impl Into<String>) -> Self {
        Message::Text(text.into())
    }

    /// Binary message
    pub fn binary(data: impl Into<Bytes>) -> Self {
        Message::Binary(data.into())
    }

    /// Close message carrying `code` and `reason`
    pub fn close(code: CloseCode, reason: impl Into<String>) -> Self {
        Message::Close(Some(CloseFrame {
            code,
            reason: reason.into(),
        }))
    }

    /// Ping, pong or close
    pub fn is_control(&self) -> bool {
        matches!(self, Message::Ping(_) | Message::Pong(_) | Message::Close(_))
    }

    /// The text of a text message
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Message::Text(text) => Some(text),
            _ => None,
        }
    }

    /// Raw payload bytes (close reason for close messages)
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Message::Text(text) => text.as_bytes(),
            Message::Binary(data) | Message::Ping(data) | Message::Pong(data) => data,
            Message::Close(Some(close)) => close.reason.as_bytes(),
            Message::Close(None) => &[],
        }
    }

    /// Opcode this message is sent with
    pub fn opcode(&self) -> Opcode {
        match self {
            Message::Text(_) => Opcode::Text,
            Message::Binary(_) => Opcode::Binary,
            Message::Ping(_) => Opcode::Ping,
            Message::Pong(_) => Opcode::Pong,
            Message::Close(_) => Opcode::Close,
        }
    }

    /// Single unmasked frame for server-to-client delivery
    pub fn to_frame(&self) -> Frame {
        match self {
            Message::Text(text) => Frame::text(Bytes::copy_from_slice(text.as_bytes())),
            Message::Binary(data) => Frame::binary(data.clone()),
            Message::Ping(data) => Frame::ping(data.clone()),
            Message::Pong(data) => Frame::pong(data.clone()),
            Message::Close(Some(close)) => Frame::close(Some(close.code.code()), &close.reason),
            Message::Close(None) => Frame::close(None, ""),
        }
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Message::Text(text) => write!(f, "Text({})", text),
            Message::Binary(data) => write!(f, "Binary({} bytes)", data.len()),
            Message::Ping(data) => write!(f, "Ping({} bytes)", data.len()),
            Message::Pong(data) => write!(f, "Pong({} bytes)", data.len()),
            Message::Close(Some(close)) => write!(f, "Close({}, {:?})", close.code, close.reason),
            Message::Close(None) => write!(f, "Close"),
        }
    }
}

/// Decode and validate a close frame payload
pub fn parse_close_payload(payload: &[u8]) -> Result<Option<CloseFrame>> {
    match payload.len() {
        0 => Ok(None),
        1 => Err(CloseError::Truncated.into()),
        len => {
            let code = CloseCode::from(u16::from_be_bytes([payload[0], payload[1]]));
            if !code.is_sendable() {
                return Err(CloseError::InvalidCode { code: code.code() }.into());
            }
            if len - 2 > constants::MAX_CLOSE_REASON_SIZE {
                return Err(CloseError::ReasonTooLong {
                    len: len - 2,
                    max: constants::MAX_CLOSE_REASON_SIZE,
                }
                .into());
            }
            let reason = std::str::from_utf8(&payload[2..])
                .map_err(|_| CloseError::InvalidUtf8)?
                .to_string();
            Ok(Some(CloseFrame { code, reason }))
        }
    }
}

/// Reassembles fragmented data frames into whole messages.
///
/// Control frames may be interleaved with the fragments of a data message and
/// are returned immediately.
#[derive(Debug)]
pub struct MessageAssembler {
    buffer: BytesMut,
    opcode: Option<Opcode>,
    max_message_size: usize,
}

impl Default for MessageAssembler {
    fn default() -> Self {
        Self::new(constants::DEFAULT_MAX_MESSAGE_SIZE)
    }
}

impl MessageAssembler {
    /// Assembler rejecting messages over `max_message_size` bytes
    pub fn new(max_message_size: usize) -> Self {
        Self {
            buffer: BytesMut::new(),
            opcode: None,
            max_message_size,
        }
    }

    /// Feed one decoded frame. Returns a message once the final fragment arrives.
    pub fn push(&mut self, frame: Frame) -> Result<Option<Message>> {
        match frame.opcode {
            Opcode::Ping => return Ok(Some(Message::Ping(frame.payload))),
            Opcode::Pong => return Ok(Some(Message::Pong(frame.payload))),
            Opcode::Close => return Ok(Some(Message::Close(parse_close_payload(&frame.payload)?))),
            Opcode::Continuation => {
                if self.opcode.is_none() {
                    return Err(MessageError::UnexpectedContinuation.into());
                }
            }
            Opcode::Text | Opcode::Binary => {
                if self.opcode.is_some() {
                    return Err(MessageError::InterleavedMessage.into());
                }
                self.opcode = Some(frame.opcode);
            }
        }

        let size = self.buffer.len() + frame.payload.len();
        if size > self.max_message_size {
            self.reset();
            return Err(MessageError::TooLarge {
                size,
                max: self.max_message_size,
            }
            .into());
        }
        self.buffer.extend_from_slice(&frame.payload);

        if !frame.fin {
            return Ok(None);
        }

        let opcode = self.opcode.take();
        let data = self.buffer.split().freeze();
        match opcode {
            Some(Opcode::Text) => {
                let text = String::from_utf8(data.to_vec()).map_err(|_| MessageError::InvalidUtf8)?;
                Ok(Some(Message::Text(text)))
            }
            _ => Ok(Some(Message::Binary(data))),
        }
    }

    /// A fragmented message is in progress
    pub fn is_assembling(&self) -> bool {
        self.opcode.is_some()
    }

    /// Payload bytes of the message in progress
    pub fn buffered_bytes(&self) -> usize {
        self.buffer.len()
    }

    fn reset(&mut self) {
        self.buffer.clear();
        self.opcode = None;
    }
}
