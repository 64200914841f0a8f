//! Connections owned by one event worker
//!
//! Each accepted stream is split into a reader task, which forwards inbound
//! bytes to the owning worker, and a writer task, which drains the
//! connection's outbound queue. The worker itself only keeps protocol state
//! in a [`ConnectionTable`] and never awaits on a socket.

use crate::error::ConnectionError;
use crate::event::{CloseReason, ConnectionInfo, WebSocketRequest};
use crate::reactor::{WorkerInput, WorkerSender};
use crate::server::Shared;
use bytes::{Bytes, BytesMut};
use gyre_core::error::CloseCode;
use gyre_core::frame::{DecodeLimits, Frame, FrameParser};
use gyre_core::message::{Message, MessageAssembler};
use gyre_core::transport::BoxedStream;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, watch};
use tokio::task::AbortHandle;

/// Server-wide connection identifier, unique for the server's lifetime
pub type ConnectionId = u64;

/// Protocol state of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Bytes go to Receive handlers as they arrive
    RawTcp,
    /// Waiting for the upgrade request on a WebSocket listener
    Handshaking,
    /// Upgrade completed; bytes are decoded as frames
    WebSocketOpen,
    /// Close scheduled; further input is ignored
    Closing,
    Closed,
}

/// Queued write for a connection's writer task
#[derive(Debug)]
pub(crate) enum Outbound {
    Data(Bytes),
    /// Flush, then shut down the write side
    Close,
}

/// Counts toward `max_connections` until dropped
#[derive(Debug)]
pub(crate) struct ConnectionPermit {
    live: Arc<AtomicUsize>,
}

impl ConnectionPermit {
    /// Take a slot unless `max` are already live
    pub(crate) fn acquire(live: &Arc<AtomicUsize>, max: usize) -> Result<Self, ConnectionError> {
        live.fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
            (current < max).then_some(current + 1)
        })
        .map_err(|current| ConnectionError::LimitExceeded { current, max })?;
        Ok(Self {
            live: Arc::clone(live),
        })
    }
}

impl Drop for ConnectionPermit {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::AcqRel);
    }
}

/// A stream handed from an acceptor to an event worker
pub(crate) struct Incoming {
    pub(crate) id: ConnectionId,
    pub(crate) stream: BoxedStream,
    pub(crate) remote_addr: SocketAddr,
    /// Index into the server's listeners; 0 is the main server
    pub(crate) listener: usize,
    pub(crate) permit: ConnectionPermit,
}

impl std::fmt::Debug for Incoming {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Incoming")
            .field("id", &self.id)
            .field("remote_addr", &self.remote_addr)
            .field("listener", &self.listener)
            .finish()
    }
}

/// A live connection
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    remote_addr: SocketAddr,
    listener: usize,
    server_port: u16,
    state: ConnectionState,
    outbound: mpsc::UnboundedSender<Outbound>,
    pub(crate) parser: FrameParser,
    pub(crate) assembler: MessageAssembler,
    pub(crate) handshake_buf: BytesMut,
    pub(crate) request: Option<Arc<WebSocketRequest>>,
    route: watch::Sender<WorkerSender>,
    reader: AbortHandle,
    handshake_timer: Option<AbortHandle>,
    _permit: ConnectionPermit,
}

impl Connection {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Local port the connection arrived on
    pub fn server_port(&self) -> u16 {
        self.server_port
    }

    /// Listener index; 0 is the main server, sub-servers follow in order
    pub fn listener(&self) -> usize {
        self.listener
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_websocket(&self) -> bool {
        self.state == ConnectionState::WebSocketOpen
    }

    /// Upgrade request, once the handshake completed
    pub fn request(&self) -> Option<&WebSocketRequest> {
        self.request.as_deref()
    }

    pub(crate) fn set_state(&mut self, state: ConnectionState) {
        self.state = state;
        if state != ConnectionState::Handshaking {
            self.cancel_handshake_timer();
        }
    }

    pub(crate) fn set_handshake_timer(&mut self, timer: AbortHandle) {
        self.handshake_timer = Some(timer);
    }

    fn cancel_handshake_timer(&mut self) {
        if let Some(timer) = self.handshake_timer.take() {
            timer.abort();
        }
    }

    /// Point the reader task at another worker
    pub(crate) fn reroute(&self, worker: WorkerSender) {
        self.route.send_replace(worker);
    }

    pub(crate) fn write(&self, data: Bytes) -> Result<(), ConnectionError> {
        if matches!(self.state, ConnectionState::Closing | ConnectionState::Closed) {
            return Err(ConnectionError::Closing { id: self.id });
        }
        self.outbound
            .send(Outbound::Data(data))
            .map_err(|_| ConnectionError::Closing { id: self.id })
    }

    /// Encode and queue a server frame
    pub(crate) fn write_message(&self, message: &Message) -> Result<(), ConnectionError> {
        if self.state != ConnectionState::WebSocketOpen {
            return Err(ConnectionError::NotWebSocket { id: self.id });
        }
        self.write(message.to_frame().to_bytes())
    }

    /// Queue a close frame, bypassing the closing check
    pub(crate) fn write_close_frame(&self, code: CloseCode, reason: &str) {
        let frame = Frame::close(Some(code.code()), reason);
        let _ = self.outbound.send(Outbound::Data(frame.to_bytes()));
    }

    /// Queue raw bytes regardless of state; used for handshake responses
    pub(crate) fn write_raw(&self, data: Bytes) {
        let _ = self.outbound.send(Outbound::Data(data));
    }

    fn shutdown(&mut self) {
        self.cancel_handshake_timer();
        self.reader.abort();
        let _ = self.outbound.send(Outbound::Close);
        self.state = ConnectionState::Closed;
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if self.state != ConnectionState::Closed {
            self.shutdown();
        }
    }
}

/// Connections owned by one event worker
#[derive(Debug)]
pub struct ConnectionTable {
    worker_id: usize,
    reply: WorkerSender,
    connections: BTreeMap<ConnectionId, Connection>,
    pending_closes: Vec<(ConnectionId, CloseReason)>,
}

impl ConnectionTable {
    pub(crate) fn new(worker_id: usize, reply: WorkerSender) -> Self {
        Self {
            worker_id,
            reply,
            connections: BTreeMap::new(),
            pending_closes: Vec::new(),
        }
    }

    /// Sender for the owning worker's input queue
    pub(crate) fn reply_sender(&self) -> &WorkerSender {
        &self.reply
    }

    /// Register an accepted stream and start its reader and writer.
    pub(crate) fn accept(&mut self, incoming: Incoming, shared: &Shared) -> ConnectionInfo {
        let Incoming {
            id,
            stream,
            remote_addr,
            listener,
            permit,
        } = incoming;
        let runtime = shared.listener(listener);
        let server_port = runtime.map_or(0, |l| l.local_addr.port());
        let websocket = runtime.map_or(false, |l| l.config.sock_type == crate::config::SockType::WebSocket);

        let (read_half, write_half) = tokio::io::split(stream);
        let (route_tx, route_rx) = watch::channel(self.reply.clone());
        let (out_tx, out_rx) = mpsc::unbounded_channel();

        let reader = tokio::spawn(read_loop(
            id,
            read_half,
            route_rx.clone(),
            shared.config.read_buffer_size,
        ))
        .abort_handle();
        tokio::spawn(write_loop(id, write_half, out_rx, route_rx));

        let limits = DecodeLimits {
            max_frame_size: shared.config.max_frame_size,
            require_mask: true,
        };
        let connection = Connection {
            id,
            remote_addr,
            listener,
            server_port,
            state: if websocket {
                ConnectionState::Handshaking
            } else {
                ConnectionState::RawTcp
            },
            outbound: out_tx,
            parser: FrameParser::new(limits),
            assembler: MessageAssembler::new(shared.config.max_message_size),
            handshake_buf: BytesMut::new(),
            request: None,
            route: route_tx,
            reader,
            handshake_timer: None,
            _permit: permit,
        };
        let info = self.info_of(&connection);
        self.connections.insert(id, connection);
        info
    }

    /// Take over a connection from a retiring worker
    pub(crate) fn adopt(&mut self, connection: Connection) -> ConnectionInfo {
        connection.reroute(self.reply.clone());
        let info = self.info_of(&connection);
        self.connections.insert(connection.id, connection);
        info
    }

    fn info_of(&self, connection: &Connection) -> ConnectionInfo {
        ConnectionInfo {
            connection_id: connection.id,
            reactor_id: self.worker_id,
            server_port: connection.server_port,
            remote_addr: connection.remote_addr,
        }
    }

    pub fn info(&self, id: ConnectionId) -> Option<ConnectionInfo> {
        self.connections.get(&id).map(|c| self.info_of(c))
    }

    pub fn get(&self, id: ConnectionId) -> Option<&Connection> {
        self.connections.get(&id)
    }

    pub(crate) fn get_mut(&mut self, id: ConnectionId) -> Option<&mut Connection> {
        self.connections.get_mut(&id)
    }

    pub fn lookup(&self, id: ConnectionId) -> Result<&Connection, ConnectionError> {
        self.get(id).ok_or(ConnectionError::NotFound { id })
    }

    pub fn ids(&self) -> Vec<ConnectionId> {
        self.connections.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub(crate) fn send(&self, id: ConnectionId, data: Bytes) -> Result<(), ConnectionError> {
        self.lookup(id)?.write(data)
    }

    pub(crate) fn push(&self, id: ConnectionId, message: &Message) -> Result<(), ConnectionError> {
        self.lookup(id)?.write_message(message)
    }

    /// Mark a connection closing. It is removed and its Close event published
    /// after the current event finishes.
    pub(crate) fn close(&mut self, id: ConnectionId, reason: CloseReason) -> Result<(), ConnectionError> {
        let connection = self
            .connections
            .get_mut(&id)
            .ok_or(ConnectionError::NotFound { id })?;
        if connection.state != ConnectionState::Closing {
            connection.set_state(ConnectionState::Closing);
            self.pending_closes.push((id, reason));
        }
        Ok(())
    }

    pub(crate) fn has_pending_closes(&self) -> bool {
        !self.pending_closes.is_empty()
    }

    pub(crate) fn take_pending_closes(&mut self) -> Vec<(ConnectionId, CloseReason)> {
        std::mem::take(&mut self.pending_closes)
    }

    /// Remove a connection, shutting down its tasks
    pub(crate) fn remove(&mut self, id: ConnectionId) -> Option<(ConnectionInfo, Connection)> {
        let mut connection = self.connections.remove(&id)?;
        let info = self.info_of(&connection);
        connection.shutdown();
        Some((info, connection))
    }

    /// Remove a connection without shutting it down, for hand-off
    pub(crate) fn detach(&mut self, id: ConnectionId) -> Option<Connection> {
        self.connections.remove(&id)
    }

    /// Write `payload` to every matching connection that is not closing.
    ///
    /// Open WebSocket connections receive a binary message, all others the
    /// raw bytes. A failed write is logged and closes that connection only.
    pub(crate) fn broadcast<P>(&mut self, predicate: P, payload: Bytes) -> usize
    where
        P: Fn(&Connection) -> bool,
    {
        let mut delivered = 0;
        let mut failed = Vec::new();
        let framed = Message::Binary(payload.clone());
        for connection in self.connections.values() {
            if matches!(
                connection.state,
                ConnectionState::Closing | ConnectionState::Closed | ConnectionState::Handshaking
            ) || !predicate(connection)
            {
                continue;
            }
            let result = if connection.is_websocket() {
                connection.write_message(&framed)
            } else {
                connection.write(payload.clone())
            };
            match result {
                Ok(()) => delivered += 1,
                Err(e) => {
                    crate::log_warn!("broadcast to connection {} failed: {}", connection.id, e);
                    failed.push(connection.id);
                }
            }
        }
        for id in failed {
            let _ = self.close(id, CloseReason::WriteFailed);
        }
        delivered
    }
}

/// Deliver to whichever worker currently owns the connection. A worker that
/// retired before the new owner rerouted us is waited out.
async fn deliver(route: &mut watch::Receiver<WorkerSender>, mut input: WorkerInput) -> bool {
    loop {
        let target = route.borrow_and_update().clone();
        match target.send(input) {
            Ok(()) => return true,
            Err(mpsc::error::SendError(returned)) => {
                input = returned;
                if route.changed().await.is_err() {
                    return false;
                }
            }
        }
    }
}

async fn read_loop(
    id: ConnectionId,
    mut reader: ReadHalf<BoxedStream>,
    mut route: watch::Receiver<WorkerSender>,
    buffer_size: usize,
) {
    let mut buf = BytesMut::with_capacity(buffer_size);
    loop {
        buf.reserve(buffer_size);
        let input = match reader.read_buf(&mut buf).await {
            Ok(0) => WorkerInput::Closed { id, error: None },
            Ok(_) => WorkerInput::Data {
                id,
                data: buf.split().freeze(),
            },
            Err(e) => WorkerInput::Closed {
                id,
                error: Some(e.to_string()),
            },
        };
        let last = matches!(input, WorkerInput::Closed { .. });
        if !deliver(&mut route, input).await || last {
            break;
        }
    }
}

async fn write_loop(
    id: ConnectionId,
    mut writer: WriteHalf<BoxedStream>,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    mut route: watch::Receiver<WorkerSender>,
) {
    while let Some(item) = outbound.recv().await {
        match item {
            Outbound::Data(data) => {
                if let Err(e) = writer.write_all(&data).await {
                    let failed = WorkerInput::WriteFailed {
                        id,
                        error: e.to_string(),
                    };
                    deliver(&mut route, failed).await;
                    return;
                }
            }
            Outbound::Close => break,
        }
    }
    let _ = writer.flush().await;
    let _ = writer.shutdown().await;
}
