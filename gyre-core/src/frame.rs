//! WebSocket frame encoding and decoding
//!
//! [`Frame::parse`] decodes one frame from the front of a buffer and leaves the
//! buffer untouched when the frame is not complete yet. [`FrameParser`] wraps it
//! for streaming input: bytes go in as they arrive from the socket and whole
//! frames come out.

use crate::{
    error::{Error, FrameError, Result},
    protocol::{constants, frame::*, Opcode},
};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// A single RFC 6455 frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Final fragment of a message
    pub fin: bool,
    /// RSV1, RSV2, RSV3
    pub rsv: [bool; 3],
    /// Frame opcode
    pub opcode: Opcode,
    /// Masking key, present on client-to-server frames
    pub mask: Option<[u8; 4]>,
    /// Payload, always stored unmasked
    pub payload: Bytes,
}

/// Limits applied while decoding peer frames
#[derive(Debug, Clone, Copy)]
pub struct DecodeLimits {
    /// Largest accepted payload of a single frame
    pub max_frame_size: usize,
    /// Reject frames that arrive without a masking key
    pub require_mask: bool,
}

impl Default for DecodeLimits {
    fn default() -> Self {
        Self {
            max_frame_size: constants::DEFAULT_MAX_FRAME_SIZE,
            require_mask: true,
        }
    }
}

impl Frame {
    /// Final, unmasked frame with the given opcode
    pub fn new(opcode: Opcode, payload: impl Into<Bytes>) -> Self {
        Self {
            fin: true,
            rsv: [false; 3],
            opcode,
            mask: None,
            payload: payload.into(),
        }
    }

    /// Continuation of a fragmented message
    pub fn continuation(payload: impl Into<Bytes>) -> Self {
        Self::new(Opcode::Continuation, payload)
    }

    /// Text frame; the payload should be UTF-8
    pub fn text(payload: impl Into<Bytes>) -> Self {
        Self::new(Opcode::Text, payload)
    }

    /// Binary frame
    pub fn binary(payload: impl Into<Bytes>) -> Self {
        Self::new(Opcode::Binary, payload)
    }

    /// Ping frame
    pub fn ping(payload: impl Into<Bytes>) -> Self {
        Self::new(Opcode::Ping, payload)
    }

    /// Pong frame, normally echoing a ping's payload
    pub fn pong(payload: impl Into<Bytes>) -> Self {
        Self::new(Opcode::Pong, payload)
    }

    /// Close frame. The reason is truncated to fit a control payload.
    pub fn close(code: Option<u16>, reason: &str) -> Self {
        let mut payload = BytesMut::new();
        if let Some(code) = code {
            payload.put_u16(code);
            let mut end = reason.len().min(constants::MAX_CLOSE_REASON_SIZE);
            while !reason.is_char_boundary(end) {
                end -= 1;
            }
            payload.put_slice(&reason.as_bytes()[..end]);
        }
        Self::new(Opcode::Close, payload.freeze())
    }

    /// Set the FIN bit
    pub fn fin(mut self, fin: bool) -> Self {
        self.fin = fin;
        self
    }

    /// Attach a masking key. Encoding applies it to the payload.
    pub fn masked_with(mut self, key: [u8; 4]) -> Self {
        self.mask = Some(key);
        self
    }

    /// Attach a random masking key, as a client would.
    pub fn masked(self) -> Self {
        self.masked_with(rand::random())
    }

    /// Encode into a fresh buffer
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.payload.len() + 14);
        self.write_to(&mut buf);
        buf.freeze()
    }

    /// Encode onto the end of `buf`
    pub fn write_to(&self, buf: &mut BytesMut) {
        let first_byte = ((self.fin as u8) << 7)
            | ((self.rsv[0] as u8) << 6)
            | ((self.rsv[1] as u8) << 5)
            | ((self.rsv[2] as u8) << 4)
            | self.opcode.value();
        buf.put_u8(first_byte);

        let payload_len = self.payload.len();
        let mask_bit = if self.mask.is_some() { MASK_BIT } else { 0 };

        if payload_len < PAYLOAD_LEN_16 as usize {
            buf.put_u8(mask_bit | payload_len as u8);
        } else if payload_len <= u16::MAX as usize {
            buf.put_u8(mask_bit | PAYLOAD_LEN_16);
            buf.put_u16(payload_len as u16);
        } else {
            buf.put_u8(mask_bit | PAYLOAD_LEN_64);
            buf.put_u64(payload_len as u64);
        }

        match self.mask {
            Some(mask) => {
                buf.put_slice(&mask);
                let start = buf.len();
                buf.put_slice(&self.payload);
                apply_mask(&mut buf[start..], mask);
            }
            None => buf.put_slice(&self.payload),
        }
    }

    /// Decode one frame from the front of `buf`.
    ///
    /// Returns [`FrameError::InsufficientData`] without consuming anything when
    /// the buffer holds only part of a frame. Size and masking violations are
    /// reported as soon as the header is readable.
    pub fn parse(buf: &mut BytesMut, limits: &DecodeLimits) -> Result<Self> {
        let have = buf.len();
        if have < 2 {
            return Err(FrameError::InsufficientData { needed: 2, have }.into());
        }

        let first_byte = buf[0];
        let second_byte = buf[1];

        let fin = first_byte & FIN_BIT != 0;
        let rsv = [
            first_byte & RSV1_BIT != 0,
            first_byte & RSV2_BIT != 0,
            first_byte & RSV3_BIT != 0,
        ];
        let opcode = Opcode::from(first_byte & OPCODE_MASK)
            .ok_or(FrameError::InvalidOpcode(first_byte & OPCODE_MASK))?;

        // No extensions are negotiated, so any RSV bit is a violation.
        if rsv.iter().any(|bit| *bit) {
            return Err(FrameError::ReservedBitsSet.into());
        }

        let masked = second_byte & MASK_BIT != 0;
        if limits.require_mask && !masked {
            return Err(FrameError::UnmaskedClientFrame.into());
        }

        let (payload_len, mut offset) = match second_byte & PAYLOAD_LEN_MASK {
            PAYLOAD_LEN_16 => {
                if have < 4 {
                    return Err(FrameError::InsufficientData { needed: 4, have }.into());
                }
                (u16::from_be_bytes([buf[2], buf[3]]) as u64, 4)
            }
            PAYLOAD_LEN_64 => {
                if have < 10 {
                    return Err(FrameError::InsufficientData { needed: 10, have }.into());
                }
                let mut len = [0u8; 8];
                len.copy_from_slice(&buf[2..10]);
                (u64::from_be_bytes(len), 10)
            }
            len => (len as u64, 2),
        };

        if opcode.is_control() {
            if !fin {
                return Err(FrameError::FragmentedControlFrame.into());
            }
            if payload_len > constants::MAX_CONTROL_PAYLOAD as u64 {
                return Err(FrameError::ControlFrameTooLarge(payload_len as usize).into());
            }
        }

        if payload_len > limits.max_frame_size as u64 {
            return Err(FrameError::TooLarge {
                size: usize::try_from(payload_len).unwrap_or(usize::MAX),
                max: limits.max_frame_size,
            }
            .into());
        }
        let payload_len = payload_len as usize;

        let header_len = if masked { offset + MASKING_KEY_LEN } else { offset };
        let needed = header_len
            .checked_add(payload_len)
            .ok_or(FrameError::TooLarge {
                size: payload_len,
                max: limits.max_frame_size,
            })?;

        let mask = if masked {
            if have < header_len {
                return Err(FrameError::InsufficientData { needed, have }.into());
            }
            let mut key = [0u8; 4];
            key.copy_from_slice(&buf[offset..header_len]);
            offset = header_len;
            Some(key)
        } else {
            None
        };

        if have < needed {
            return Err(FrameError::InsufficientData { needed, have }.into());
        }

        buf.advance(offset);
        let mut payload = buf.split_to(payload_len);
        if let Some(key) = mask {
            apply_mask(&mut payload, key);
        }

        Ok(Frame {
            fin,
            rsv,
            opcode,
            mask,
            payload: payload.freeze(),
        })
    }

    /// Close, ping or pong
    pub fn is_control(&self) -> bool {
        self.opcode.is_control()
    }

    /// Text, binary or continuation
    pub fn is_data(&self) -> bool {
        self.opcode.is_data()
    }
}

/// XOR `data` in place with the repeating four-byte key.
pub fn apply_mask(data: &mut [u8], key: [u8; 4]) {
    for (i, byte) in data.iter_mut().enumerate() {
        *byte ^= key[i & 3];
    }
}

/// Incremental decoder for one connection's inbound byte stream
#[derive(Debug)]
pub struct FrameParser {
    buffer: BytesMut,
    limits: DecodeLimits,
}

impl Default for FrameParser {
    fn default() -> Self {
        Self::new(DecodeLimits::default())
    }
}

impl FrameParser {
    /// Empty parser enforcing `limits`
    pub fn new(limits: DecodeLimits) -> Self {
        Self {
            buffer: BytesMut::new(),
            limits,
        }
    }

    /// Append bytes read from the socket
    pub fn feed(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Next complete frame, or `None` when more input is required.
    ///
    /// A decode error leaves the stream unusable; the buffer is discarded.
    pub fn next_frame(&mut self) -> Result<Option<Frame>> {
        match Frame::parse(&mut self.buffer, &self.limits) {
            Ok(frame) => Ok(Some(frame)),
            Err(Error::Frame(e)) if e.is_incomplete() => Ok(None),
            Err(e) => {
                self.buffer.clear();
                Err(e)
            }
        }
    }

    /// Drain every complete frame currently buffered.
    pub fn drain(&mut self) -> Result<Vec<Frame>> {
        let mut frames = Vec::new();
        while let Some(frame) = self.next_frame()? {
            frames.push(frame);
        }
        Ok(frames)
    }

    /// Bytes held back waiting for the rest of a frame
    pub fn buffered_bytes(&self) -> usize {
        self.buffer.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server_limits() -> DecodeLimits {
        DecodeLimits {
            max_frame_size: 1024,
            require_mask: false,
        }
    }

    #[test]
    fn test_text_frame_wire_layout() {
        let bytes = Frame::text("hello").to_bytes();

        assert_eq!(bytes[0], 0x81);
        assert_eq!(bytes[1], 0x05);
        assert_eq!(&bytes[2..], b"hello");
    }

    #[test]
    fn test_masked_frame_wire_format() {
        let bytes = Frame::text("Hello").masked_with([0x37, 0xfa, 0x21, 0x3d]).to_bytes();

        // RFC 6455 section 5.7, single-frame masked text message
        assert_eq!(
            &bytes[..],
            &[0x81, 0x85, 0x37, 0xfa, 0x21, 0x3d, 0x7f, 0x9f, 0x4d, 0x51, 0x58]
        );
    }

    #[test]
    fn test_masked_frame_decodes_to_plain_payload() {
        let bytes = Frame::binary(vec![1u8, 2, 3, 4, 5]).masked().to_bytes();
        let mut buf = BytesMut::from(&bytes[..]);

        let frame = Frame::parse(&mut buf, &DecodeLimits::default()).unwrap();
        assert_eq!(frame.opcode, Opcode::Binary);
        assert_eq!(&frame.payload[..], &[1, 2, 3, 4, 5]);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_length_encodings() {
        let small = Frame::binary(vec![0u8; 125]).to_bytes();
        assert_eq!(small[1], 125);

        let medium = Frame::binary(vec![0u8; 126]).to_bytes();
        assert_eq!(medium[1], 126);
        assert_eq!(&medium[2..4], &126u16.to_be_bytes());

        let large = Frame::binary(vec![0u8; 65536]).to_bytes();
        assert_eq!(large[1], 127);
        assert_eq!(&large[2..10], &65536u64.to_be_bytes());

        let mut buf = BytesMut::from(&large[..]);
        let limits = DecodeLimits {
            max_frame_size: 1 << 20,
            require_mask: false,
        };
        let parsed = Frame::parse(&mut buf, &limits).unwrap();
        assert_eq!(parsed.payload.len(), 65536);
    }

    #[test]
    fn test_close_frame() {
        let bytes = Frame::close(Some(1000), "Goodbye").to_bytes();

        assert_eq!(bytes[0], 0x88);
        assert_eq!(bytes[1], 9);
        assert_eq!(&bytes[2..4], &1000u16.to_be_bytes());
        assert_eq!(&bytes[4..], b"Goodbye");
    }

    #[test]
    fn test_close_reason_truncated_on_char_boundary() {
        let reason = "é".repeat(100);
        let frame = Frame::close(Some(1000), &reason);
        assert!(frame.payload.len() <= constants::MAX_CONTROL_PAYLOAD);
        assert!(std::str::from_utf8(&frame.payload[2..]).is_ok());
    }

    #[test]
    fn test_partial_frame_not_consumed() {
        let bytes = Frame::text("partial").masked().to_bytes();
        let mut buf = BytesMut::from(&bytes[..bytes.len() - 1]);

        let err = Frame::parse(&mut buf, &DecodeLimits::default()).unwrap_err();
        assert!(matches!(err, Error::Frame(FrameError::InsufficientData { .. })));
        assert_eq!(buf.len(), bytes.len() - 1);
    }

    #[test]
    fn test_unmasked_client_frame_rejected() {
        let bytes = Frame::text("plain").to_bytes();
        let mut buf = BytesMut::from(&bytes[..]);

        let err = Frame::parse(&mut buf, &DecodeLimits::default()).unwrap_err();
        assert!(matches!(err, Error::Frame(FrameError::UnmaskedClientFrame)));
    }

    #[test]
    fn test_oversized_frame_rejected_from_header() {
        // Header claims 64 KiB, no payload bytes present yet.
        let mut buf = BytesMut::from(&[0x82u8, 0x7f, 0, 0, 0, 0, 0, 1, 0, 0][..]);
        let err = Frame::parse(&mut buf, &server_limits()).unwrap_err();
        assert!(matches!(err, Error::Frame(FrameError::TooLarge { size: 65536, max: 1024 })));
    }

    #[test]
    fn test_length_overflow_is_too_large() {
        let limits = DecodeLimits {
            max_frame_size: usize::MAX,
            require_mask: true,
        };
        let mut buf = BytesMut::from(&[0x82u8, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff][..]);
        let err = Frame::parse(&mut buf, &limits).unwrap_err();
        assert!(matches!(err, Error::Frame(FrameError::TooLarge { .. })));
        assert_eq!(buf.len(), 10);
    }

    #[test]
    fn test_invalid_frames() {
        let mut reserved_opcode = BytesMut::from(&[0x83u8, 0x00][..]);
        assert!(matches!(
            Frame::parse(&mut reserved_opcode, &server_limits()),
            Err(Error::Frame(FrameError::InvalidOpcode(3)))
        ));

        let mut rsv = BytesMut::from(&[0xC1u8, 0x00][..]);
        assert!(matches!(
            Frame::parse(&mut rsv, &server_limits()),
            Err(Error::Frame(FrameError::ReservedBitsSet))
        ));

        let mut fragmented_ping = BytesMut::from(&[0x09u8, 0x00][..]);
        assert!(matches!(
            Frame::parse(&mut fragmented_ping, &server_limits()),
            Err(Error::Frame(FrameError::FragmentedControlFrame))
        ));
    }

    #[test]
    fn test_frame_parser() {
        let mut parser = FrameParser::default();

        let bytes1 = Frame::text("frame1").masked().to_bytes();
        let bytes2 = Frame::ping("ping").masked().to_bytes();

        parser.feed(&bytes1[..5]);
        assert!(parser.next_frame().unwrap().is_none());

        parser.feed(&bytes1[5..]);
        parser.feed(&bytes2);
        let frames = parser.drain().unwrap();
        assert_eq!(frames.len(), 2);
        assert!(frames[0].is_data());
        assert!(frames[1].is_control());
        assert_eq!(parser.buffered_bytes(), 0);
    }

    #[test]
    fn test_parser_discards_buffer_on_error() {
        let mut parser = FrameParser::default();
        parser.feed(&Frame::text("unmasked").to_bytes());
        assert!(parser.next_frame().is_err());
        assert_eq!(parser.buffered_bytes(), 0);
    }
}
