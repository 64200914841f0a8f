//! Transport layer abstraction
//!
//! The server never touches sockets directly. It binds through a
//! [`Transport`], which hands back stream [`Listener`]s and
//! [`DatagramSocket`]s. `gyre-transport-net` provides the tokio-backed
//! implementation; [`mock`] provides an in-memory one.

use crate::error::Result;
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncWrite};

/// A connected byte stream
pub trait TransportStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> TransportStream for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// Owned, type-erased stream
pub type BoxedStream = Box<dyn TransportStream>;

/// A bound stream listener
#[async_trait::async_trait]
pub trait Listener: Send + Sync + 'static {
    /// Wait for the next inbound connection and its peer address
    async fn accept(&self) -> Result<(BoxedStream, SocketAddr)>;

    /// Address actually bound (resolves port 0)
    fn local_addr(&self) -> Result<SocketAddr>;
}

/// A bound datagram socket
#[async_trait::async_trait]
pub trait DatagramSocket: Send + Sync + 'static {
    /// Receive one datagram into `buf`; returns its length and sender
    async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr)>;

    /// Send `buf` as one datagram
    async fn send_to(&self, buf: &[u8], target: SocketAddr) -> Result<usize>;

    /// Address actually bound
    fn local_addr(&self) -> Result<SocketAddr>;
}

/// Factory for listeners and datagram sockets
#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Bind a stream listener on `addr`
    async fn bind_stream(&self, addr: SocketAddr) -> Result<Box<dyn Listener>>;

    /// Bind a datagram socket on `addr`
    async fn bind_datagram(&self, addr: SocketAddr) -> Result<Box<dyn DatagramSocket>>;
}

/// In-memory transport built on `tokio::io::duplex`
#[cfg(any(test, feature = "mock"))]
pub mod mock {
    use super::*;
    use crate::error::Error;
    use std::collections::HashMap;
    use std::io;
    use std::sync::{Arc, Mutex};
    use tokio::io::DuplexStream;
    use tokio::sync::mpsc;

    const DUPLEX_CAPACITY: usize = 64 * 1024;
    const FIRST_EPHEMERAL_PORT: u16 = 40000;

    type Datagram = (Vec<u8>, SocketAddr);

    #[derive(Debug, Default)]
    struct Registry {
        next_port: u16,
        streams: HashMap<SocketAddr, mpsc::UnboundedSender<(BoxedStream, SocketAddr)>>,
        datagrams: HashMap<SocketAddr, mpsc::UnboundedSender<Datagram>>,
    }

    impl Registry {
        fn resolve(&mut self, mut addr: SocketAddr) -> SocketAddr {
            if addr.port() == 0 {
                if self.next_port < FIRST_EPHEMERAL_PORT {
                    self.next_port = FIRST_EPHEMERAL_PORT;
                }
                addr.set_port(self.next_port);
                self.next_port += 1;
            }
            addr
        }

        fn in_use(&self, addr: &SocketAddr) -> bool {
            self.streams.contains_key(addr) || self.datagrams.contains_key(addr)
        }
    }

    /// Shared in-memory network. Clones see the same bindings.
    #[derive(Debug, Clone, Default)]
    pub struct MockTransport {
        registry: Arc<Mutex<Registry>>,
    }

    impl MockTransport {
        /// Network with nothing bound
        pub fn new() -> Self {
            Self::default()
        }

        /// Open a client connection to a bound listener.
        pub fn connect(&self, addr: SocketAddr) -> Result<DuplexStream> {
            let mut registry = self.lock()?;
            let peer = registry.resolve(SocketAddr::new(addr.ip(), 0));
            let sender = registry
                .streams
                .get(&addr)
                .cloned()
                .ok_or_else(|| refused(addr))?;
            drop(registry);

            let (client, server) = tokio::io::duplex(DUPLEX_CAPACITY);
            sender
                .send((Box::new(server), peer))
                .map_err(|_| refused(addr))?;
            Ok(client)
        }

        /// Bind a client-side datagram socket on an ephemeral port.
        pub fn datagram_client(&self) -> Result<MockDatagram> {
            let mut registry = self.lock()?;
            let addr = registry.resolve(SocketAddr::from(([127, 0, 0, 1], 0)));
            Ok(self.register_datagram(&mut registry, addr))
        }

        fn register_datagram(&self, registry: &mut Registry, addr: SocketAddr) -> MockDatagram {
            let (tx, rx) = mpsc::unbounded_channel();
            registry.datagrams.insert(addr, tx);
            MockDatagram {
                addr,
                inbox: tokio::sync::Mutex::new(rx),
                registry: Arc::clone(&self.registry),
            }
        }

        fn lock(&self) -> Result<std::sync::MutexGuard<'_, Registry>> {
            self.registry
                .lock()
                .map_err(|_| Error::Connection("mock registry poisoned".into()))
        }
    }

    fn refused(addr: SocketAddr) -> Error {
        Error::Io(io::Error::new(
            io::ErrorKind::ConnectionRefused,
            format!("nothing listening on {addr}"),
        ))
    }

    #[async_trait::async_trait]
    impl Transport for MockTransport {
        async fn bind_stream(&self, addr: SocketAddr) -> Result<Box<dyn Listener>> {
            let mut registry = self.lock()?;
            let addr = registry.resolve(addr);
            if registry.in_use(&addr) {
                return Err(Error::Io(io::Error::from(io::ErrorKind::AddrInUse)));
            }
            let (tx, rx) = mpsc::unbounded_channel();
            registry.streams.insert(addr, tx);
            Ok(Box::new(MockListener {
                addr,
                incoming: tokio::sync::Mutex::new(rx),
                registry: Arc::clone(&self.registry),
            }))
        }

        async fn bind_datagram(&self, addr: SocketAddr) -> Result<Box<dyn DatagramSocket>> {
            let mut registry = self.lock()?;
            let addr = registry.resolve(addr);
            if registry.in_use(&addr) {
                return Err(Error::Io(io::Error::from(io::ErrorKind::AddrInUse)));
            }
            Ok(Box::new(self.register_datagram(&mut registry, addr)))
        }
    }

    /// Listener half of the mock network
    #[derive(Debug)]
    pub struct MockListener {
        addr: SocketAddr,
        incoming: tokio::sync::Mutex<mpsc::UnboundedReceiver<(BoxedStream, SocketAddr)>>,
        registry: Arc<Mutex<Registry>>,
    }

    #[async_trait::async_trait]
    impl Listener for MockListener {
        async fn accept(&self) -> Result<(BoxedStream, SocketAddr)> {
            self.incoming
                .lock()
                .await
                .recv()
                .await
                .ok_or_else(|| Error::Connection("mock listener closed".into()))
        }

        fn local_addr(&self) -> Result<SocketAddr> {
            Ok(self.addr)
        }
    }

    impl Drop for MockListener {
        fn drop(&mut self) {
            if let Ok(mut registry) = self.registry.lock() {
                registry.streams.remove(&self.addr);
            }
        }
    }

    /// Datagram endpoint on the mock network
    #[derive(Debug)]
    pub struct MockDatagram {
        addr: SocketAddr,
        inbox: tokio::sync::Mutex<mpsc::UnboundedReceiver<Datagram>>,
        registry: Arc<Mutex<Registry>>,
    }

    #[async_trait::async_trait]
    impl DatagramSocket for MockDatagram {
        async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr)> {
            let (data, from) = self
                .inbox
                .lock()
                .await
                .recv()
                .await
                .ok_or_else(|| Error::Connection("mock socket closed".into()))?;
            let len = data.len().min(buf.len());
            buf[..len].copy_from_slice(&data[..len]);
            Ok((len, from))
        }

        async fn send_to(&self, buf: &[u8], target: SocketAddr) -> Result<usize> {
            let sender = self
                .registry
                .lock()
                .map_err(|_| Error::Connection("mock registry poisoned".into()))?
                .datagrams
                .get(&target)
                .cloned();
            // Datagrams to nowhere vanish, as they would on a real network.
            if let Some(sender) = sender {
                let _ = sender.send((buf.to_vec(), self.addr));
            }
            Ok(buf.len())
        }

        fn local_addr(&self) -> Result<SocketAddr> {
            Ok(self.addr)
        }
    }

    impl Drop for MockDatagram {
        fn drop(&mut self) {
            if let Ok(mut registry) = self.registry.lock() {
                registry.datagrams.remove(&self.addr);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::*;
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_mock_stream_roundtrip() {
        let transport = MockTransport::new();
        let listener = transport
            .bind_stream("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();
        assert_ne!(addr.port(), 0);

        let mut client = transport.connect(addr).unwrap();
        let (mut server, peer) = listener.accept().await.unwrap();
        assert_eq!(peer.ip(), addr.ip());

        client.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[tokio::test]
    async fn test_mock_connect_refused_after_drop() {
        let transport = MockTransport::new();
        let listener = transport
            .bind_stream("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        assert!(transport.connect(addr).is_err());
    }

    #[tokio::test]
    async fn test_mock_datagrams() {
        let transport = MockTransport::new();
        let server = transport
            .bind_datagram("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let client = transport.datagram_client().unwrap();

        client
            .send_to(b"ping", server.local_addr().unwrap())
            .await
            .unwrap();
        let mut buf = [0u8; 16];
        let (len, from) = server.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..len], b"ping");
        assert_eq!(from, client.local_addr().unwrap());
    }
}
