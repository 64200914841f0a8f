//! Helpers shared by the integration tests: an in-memory server, a minimal
//! WebSocket client and channel-backed event recorders.

#![allow(dead_code)]

use bytes::BytesMut;
use gyre_core::frame::{DecodeLimits, Frame, FrameParser};
use gyre_core::transport::mock::MockTransport;
use gyre_server::{Result, Server, ServerBuilder};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub const TIMEOUT: Duration = Duration::from_secs(5);

/// RFC 6455 section 1.3 sample key and its accept value
pub const SAMPLE_KEY: &str = "dGhlIHNhbXBsZSBub25jZQ==";
pub const SAMPLE_ACCEPT: &str = "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=";

pub fn builder(transport: &MockTransport) -> ServerBuilder {
    Server::builder()
        .host("127.0.0.1")
        .port(0)
        .worker_num(2)
        .transport(Arc::new(transport.clone()))
}

/// Spawn `listen` and wait until the listeners are bound
pub async fn start(server: &Server) -> (JoinHandle<Result<()>>, Vec<SocketAddr>) {
    let runner = server.clone();
    let task = tokio::spawn(async move { runner.listen().await });
    let addrs = tokio::time::timeout(TIMEOUT, server.handle().ready())
        .await
        .expect("server did not start")
        .expect("server failed to start");
    (task, addrs)
}

/// Stop the server and wait for `listen` to return
pub async fn shutdown(server: &Server, task: JoinHandle<Result<()>>) {
    tokio::time::timeout(TIMEOUT, server.stop())
        .await
        .expect("stop timed out")
        .expect("stop failed");
    task.await.expect("listen panicked").expect("listen failed");
}

/// Receive the next recorded value or fail the test
pub async fn next<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
    tokio::time::timeout(TIMEOUT, rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("recorder dropped")
}

/// True when nothing more arrives within `wait`
pub async fn quiet<T>(rx: &mut mpsc::UnboundedReceiver<T>, wait: Duration) -> bool {
    tokio::time::timeout(wait, rx.recv()).await.is_err()
}

pub fn upgrade_request(path: &str, key: &str) -> String {
    format!(
        "GET {path} HTTP/1.1\r\n\
         Host: localhost\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Key: {key}\r\n\
         Sec-WebSocket-Version: 13\r\n\r\n"
    )
}

/// Client side of a mock WebSocket connection
pub struct WsClient {
    pub stream: DuplexStream,
    parser: FrameParser,
}

impl WsClient {
    /// Connect and upgrade; returns the client and the response head
    pub async fn connect(transport: &MockTransport, addr: SocketAddr, path: &str) -> (Self, String) {
        let mut stream = transport.connect(addr).expect("connect");
        stream
            .write_all(upgrade_request(path, SAMPLE_KEY).as_bytes())
            .await
            .unwrap();
        let (head, rest) = read_head(&mut stream).await;
        let mut parser = FrameParser::new(DecodeLimits {
            max_frame_size: 1 << 20,
            require_mask: false,
        });
        parser.feed(&rest);
        (Self { stream, parser }, head)
    }

    pub async fn send(&mut self, frame: Frame) {
        self.stream
            .write_all(&frame.masked().to_bytes())
            .await
            .unwrap();
    }

    /// Next frame from the server, `None` once the server hangs up
    pub async fn recv(&mut self) -> Option<Frame> {
        let mut buf = [0u8; 4096];
        loop {
            if let Some(frame) = self.parser.next_frame().expect("server sent a bad frame") {
                return Some(frame);
            }
            let n = tokio::time::timeout(TIMEOUT, self.stream.read(&mut buf))
                .await
                .expect("timed out waiting for frame")
                .unwrap();
            if n == 0 {
                return None;
            }
            self.parser.feed(&buf[..n]);
        }
    }
}

/// Read an HTTP response head; returns it and any bytes after it
pub async fn read_head(stream: &mut DuplexStream) -> (String, BytesMut) {
    let mut buf = BytesMut::new();
    let mut chunk = [0u8; 1024];
    loop {
        if let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            let head = buf.split_to(end + 4);
            return (String::from_utf8_lossy(&head).into_owned(), buf);
        }
        let n = tokio::time::timeout(TIMEOUT, stream.read(&mut chunk))
            .await
            .expect("timed out waiting for response")
            .unwrap();
        assert!(n > 0, "connection closed before the response head");
        buf.extend_from_slice(&chunk[..n]);
    }
}

/// Read until the server closes the stream
pub async fn read_to_close(stream: &mut DuplexStream) -> Vec<u8> {
    let mut out = Vec::new();
    tokio::time::timeout(TIMEOUT, stream.read_to_end(&mut out))
        .await
        .expect("server did not close the connection")
        .unwrap();
    out
}
