//! UDP datagram socket

use async_trait::async_trait;
use gyre_core::transport::DatagramSocket;
use gyre_core::{Error, Result};
use std::net::SocketAddr;

/// Bound UDP socket
#[derive(Debug)]
pub struct UdpSocket {
    inner: tokio::net::UdpSocket,
    local_addr: SocketAddr,
}

impl UdpSocket {
    /// Bind to `addr`; port 0 picks an ephemeral port
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let inner = tokio::net::UdpSocket::bind(addr).await.map_err(Error::Io)?;
        let local_addr = inner.local_addr().map_err(Error::Io)?;
        Ok(Self { inner, local_addr })
    }
}

#[async_trait]
impl DatagramSocket for UdpSocket {
    async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr)> {
        self.inner.recv_from(buf).await.map_err(Error::Io)
    }

    async fn send_to(&self, buf: &[u8], target: SocketAddr) -> Result<usize> {
        self.inner.send_to(buf, target).await.map_err(Error::Io)
    }

    fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.local_addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_udp_send_and_receive() {
        let server = UdpSocket::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let client = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();

        client
            .send_to(b"datagram", server.local_addr().unwrap())
            .await
            .unwrap();

        let mut buf = [0u8; 32];
        let (len, from) = server.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..len], b"datagram");
        assert_eq!(from, client.local_addr().unwrap());
    }
}
