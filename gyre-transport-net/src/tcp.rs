//! TCP listener and the socket-backed [`Transport`]

use crate::udp::UdpSocket;
use async_trait::async_trait;
use gyre_core::transport::{BoxedStream, DatagramSocket, Listener, Transport};
use gyre_core::{Error, Result};
use std::net::SocketAddr;

/// Transport over the host network stack
#[derive(Debug, Clone, Copy, Default)]
pub struct NetTransport {
    nodelay: bool,
}

impl NetTransport {
    /// Create a transport with Nagle's algorithm enabled
    pub fn new() -> Self {
        Self::default()
    }

    /// Disable Nagle's algorithm on accepted streams
    pub fn with_nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }
}

#[async_trait]
impl Transport for NetTransport {
    async fn bind_stream(&self, addr: SocketAddr) -> Result<Box<dyn Listener>> {
        let listener = TcpListener::bind(addr, self.nodelay).await?;
        Ok(Box::new(listener))
    }

    async fn bind_datagram(&self, addr: SocketAddr) -> Result<Box<dyn DatagramSocket>> {
        let socket = UdpSocket::bind(addr).await?;
        Ok(Box::new(socket))
    }
}

/// Bound TCP listener
#[derive(Debug)]
pub struct TcpListener {
    inner: tokio::net::TcpListener,
    local_addr: SocketAddr,
    nodelay: bool,
}

impl TcpListener {
    /// Bind to `addr`; port 0 picks an ephemeral port
    pub async fn bind(addr: SocketAddr, nodelay: bool) -> Result<Self> {
        let inner = tokio::net::TcpListener::bind(addr).await.map_err(Error::Io)?;
        let local_addr = inner.local_addr().map_err(Error::Io)?;
        Ok(Self {
            inner,
            local_addr,
            nodelay,
        })
    }
}

#[async_trait]
impl Listener for TcpListener {
    async fn accept(&self) -> Result<(BoxedStream, SocketAddr)> {
        let (stream, peer) = self.inner.accept().await.map_err(Error::Io)?;
        if self.nodelay {
            stream.set_nodelay(true).map_err(Error::Io)?;
        }
        Ok((Box::new(stream), peer))
    }

    fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.local_addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_tcp_accept_and_echo() {
        let transport = NetTransport::new().with_nodelay(true);
        let listener = transport
            .bind_stream("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();
        assert_ne!(addr.port(), 0);

        let client = tokio::spawn(async move {
            let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
            stream.write_all(b"ping").await.unwrap();
            let mut reply = [0u8; 4];
            stream.read_exact(&mut reply).await.unwrap();
            reply
        });

        let (mut stream, _peer) = listener.accept().await.unwrap();
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();
        stream.write_all(b"pong").await.unwrap();

        assert_eq!(&buf, b"ping");
        assert_eq!(&client.await.unwrap(), b"pong");
    }
}
