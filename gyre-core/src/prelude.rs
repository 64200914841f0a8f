//! Commonly used types, re-exported for glob import.

pub use crate::error::{CloseCode, Error, Result};
pub use crate::frame::{Frame, FrameParser};
pub use crate::handshake::{HandshakeRequest, HandshakeResponse};
pub use crate::message::{Message, MessageAssembler};
pub use crate::protocol::Opcode;
pub use crate::transport::{BoxedStream, DatagramSocket, Listener, Transport, TransportStream};

pub use bytes::{Bytes, BytesMut};
pub use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
