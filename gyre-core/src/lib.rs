//! # Gyre Core
//!
//! Wire-level building blocks shared by the Gyre server crates:
//!
//! - Error types and RFC 6455 close codes
//! - WebSocket frame encoding and incremental decoding
//! - Message reassembly across fragmented frames
//! - The HTTP/1.1 upgrade handshake
//! - Transport traits the server binds through, plus an in-memory mock

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(missing_docs, missing_debug_implementations, rust_2018_idioms)]

pub mod error;
pub mod frame;
pub mod handshake;
pub mod message;
pub mod protocol;
pub mod transport;

pub mod prelude;

pub use error::{CloseCode, Error, Result};
pub use frame::{Frame, FrameParser};
pub use handshake::{HandshakeRequest, HandshakeResponse};
pub use message::{Message, MessageAssembler};
pub use protocol::Opcode;
pub use transport::{BoxedStream, DatagramSocket, Listener, Transport, TransportStream};
