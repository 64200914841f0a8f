//! Network transport for Gyre
//!
//! Binds real sockets through tokio: TCP listeners for stream servers and UDP
//! sockets for datagram servers.

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(missing_docs, missing_debug_implementations, rust_2018_idioms)]

pub mod tcp;
pub mod udp;

pub use tcp::{NetTransport, TcpListener};
pub use udp::UdpSocket;

/// Prelude module
pub mod prelude {
    pub use crate::tcp::{NetTransport, TcpListener};
    pub use crate::udp::UdpSocket;
    pub use gyre_core::transport::{DatagramSocket, Listener, Transport};
}
