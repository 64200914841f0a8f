//! Event kinds and their payloads
//!
//! Every event the runtime raises has a [`EventKind`] and a payload struct.
//! Fields shared by several kinds live in [`WorkerInfo`] and
//! [`ConnectionInfo`] and are embedded by value. Handlers subscribe to a
//! payload type (see [`crate::EventBus::subscribe`]) and receive it mutably:
//! they may stop propagation and, where the payload allows, edit it.

use crate::connection::ConnectionId;
use crate::task::TaskId;
use bytes::Bytes;
use gyre_core::error::CloseCode;
use gyre_core::handshake::{HandshakeRequest, HandshakeResponse};
use gyre_core::message::Message;
use gyre_core::protocol::Opcode;
use gyre_core::transport::DatagramSocket;
use http::{HeaderMap, Method, Uri};
use serde_json::Value;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

/// Implemented by every event payload
pub trait ServerEvent: Send + 'static {
    /// Kind this payload is published under
    const KIND: EventKind;

    /// Borrow the payload out of an [`Event`] of the matching kind
    fn from_event_mut(event: &mut Event) -> Option<&mut Self>;

    /// Wrap the payload
    fn into_event(self) -> Event;

    /// Skip the handlers registered after the current one
    fn stop_propagation(&mut self);

    fn is_propagation_stopped(&self) -> bool;
}

macro_rules! events {
    ($( $(#[$doc:meta])* $kind:ident => $payload:ident ),+ $(,)?) => {
        /// Enumerated event kinds
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub enum EventKind {
            $( $(#[$doc])* $kind, )+
        }

        impl EventKind {
            /// Every kind, in declaration order
            pub const ALL: &'static [EventKind] = &[$(EventKind::$kind),+];

            pub fn name(&self) -> &'static str {
                match self {
                    $(EventKind::$kind => stringify!($kind),)+
                }
            }
        }

        /// An event with its payload
        #[derive(Debug)]
        pub enum Event {
            $( $kind($payload), )+
        }

        impl Event {
            pub fn kind(&self) -> EventKind {
                match self {
                    $(Event::$kind(_) => EventKind::$kind,)+
                }
            }

            pub fn is_propagation_stopped(&self) -> bool {
                match self {
                    $(Event::$kind(payload) => payload.stopped,)+
                }
            }
        }

        $(
            impl ServerEvent for $payload {
                const KIND: EventKind = EventKind::$kind;

                fn from_event_mut(event: &mut Event) -> Option<&mut Self> {
                    match event {
                        Event::$kind(payload) => Some(payload),
                        #[allow(unreachable_patterns)]
                        _ => None,
                    }
                }

                fn into_event(self) -> Event {
                    Event::$kind(self)
                }

                fn stop_propagation(&mut self) {
                    self.stopped = true;
                }

                fn is_propagation_stopped(&self) -> bool {
                    self.stopped
                }
            }

            impl From<$payload> for Event {
                fn from(payload: $payload) -> Self {
                    Event::$kind(payload)
                }
            }
        )+
    };
}

events! {
    /// Listeners bound and workers running
    Start => StartEvent,
    /// Shutdown requested; workers still running
    BeforeShutdown => BeforeShutdownEvent,
    /// Everything stopped
    Shutdown => ShutdownEvent,
    /// Worker (event or task) entered its loop
    WorkerStart => WorkerStartEvent,
    /// Worker left its loop normally
    WorkerStop => WorkerStopEvent,
    /// Worker was asked to stop and is draining
    WorkerExit => WorkerExitEvent,
    /// Stream connection accepted
    Connect => ConnectEvent,
    /// Bytes arrived on a raw TCP connection
    Receive => ReceiveEvent,
    /// Datagram arrived on a UDP listener
    Packet => PacketEvent,
    /// Connection removed from its worker's table
    Close => CloseEvent,
    /// Task started on a task worker
    Task => TaskEvent,
    /// Task result delivered to the worker that dispatched it
    Finish => FinishEvent,
    /// Message from another worker
    PipeMessage => PipeMessageEvent,
    /// Worker exited abnormally
    WorkerError => WorkerErrorEvent,
    /// Supervisor started
    ManagerStart => ManagerStartEvent,
    /// Supervisor stopped
    ManagerStop => ManagerStopEvent,
    /// Reload about to replace the workers
    BeforeReload => BeforeReloadEvent,
    /// Reload finished
    AfterReload => AfterReloadEvent,
    /// Complete WebSocket message
    Message => MessageEvent,
    /// WebSocket upgrade completed
    Open => OpenEvent,
    /// Upgrade response built and not yet written
    BeforeHandshakeResponse => BeforeHandshakeResponseEvent,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl EventKind {
    /// Kinds raised for a single connection or datagram, routed to the
    /// listener's own handlers first
    pub fn is_connection_scoped(&self) -> bool {
        matches!(
            self,
            EventKind::Connect
                | EventKind::Receive
                | EventKind::Packet
                | EventKind::Close
                | EventKind::Message
                | EventKind::Open
                | EventKind::BeforeHandshakeResponse
        )
    }
}

/// Identity of the worker an event concerns
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerInfo {
    pub worker_id: usize,
    pub task_worker: bool,
}

/// Identity of the connection an event concerns
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub connection_id: ConnectionId,
    /// Event worker that owns the connection
    pub reactor_id: usize,
    /// Local port the connection arrived on
    pub server_port: u16,
    pub remote_addr: SocketAddr,
}

/// Why a connection was closed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Peer closed the stream or sent a close frame
    Peer,
    /// A handler closed it
    Server,
    /// A handler failed while processing it
    HandlerError,
    /// Peer violated the WebSocket protocol
    Protocol(CloseCode),
    /// Upgrade request rejected
    HandshakeFailed,
    /// Upgrade not completed in time
    HandshakeTimeout,
    /// Writing to the peer failed
    WriteFailed,
    /// Owning worker stopped
    WorkerStopping,
    /// Owning worker retired by a reload
    Reload,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::Peer => "peer",
            CloseReason::Server => "server",
            CloseReason::HandlerError => "handler error",
            CloseReason::Protocol(_) => "protocol error",
            CloseReason::HandshakeFailed => "handshake failed",
            CloseReason::HandshakeTimeout => "handshake timeout",
            CloseReason::WriteFailed => "write failed",
            CloseReason::WorkerStopping => "worker stopping",
            CloseReason::Reload => "reload",
        }
    }
}

/// Request view derived from a connection's upgrade request
#[derive(Debug, Clone)]
pub struct WebSocketRequest {
    pub connection_id: ConnectionId,
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub remote_addr: SocketAddr,
}

impl WebSocketRequest {
    pub(crate) fn from_handshake(
        connection_id: ConnectionId,
        request: &HandshakeRequest,
        remote_addr: SocketAddr,
    ) -> Self {
        Self {
            connection_id,
            method: request.method.clone(),
            uri: request.uri.clone(),
            headers: request.headers.clone(),
            remote_addr,
        }
    }

    pub fn path(&self) -> &str {
        self.uri.path()
    }

    pub fn query(&self) -> Option<&str> {
        self.uri.query()
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

/// A decoded WebSocket message as seen by handlers
#[derive(Debug, Clone)]
pub struct WebSocketFrame {
    pub connection_id: ConnectionId,
    pub message: Message,
    /// Always true: fragments are reassembled before publishing
    pub finish: bool,
}

impl WebSocketFrame {
    pub fn opcode(&self) -> Opcode {
        self.message.opcode()
    }

    pub fn data(&self) -> &[u8] {
        self.message.as_bytes()
    }
}

#[derive(Debug)]
pub struct StartEvent {
    /// Bound address of every listener, main first
    pub listeners: Vec<SocketAddr>,
    pub master_pid: u32,
    stopped: bool,
}

impl StartEvent {
    pub(crate) fn new(listeners: Vec<SocketAddr>) -> Self {
        Self {
            listeners,
            master_pid: std::process::id(),
            stopped: false,
        }
    }
}

macro_rules! marker_events {
    ($($payload:ident),+ $(,)?) => {
        $(
            #[derive(Debug, Default)]
            pub struct $payload {
                stopped: bool,
            }

            impl $payload {
                pub(crate) fn new() -> Self {
                    Self::default()
                }
            }
        )+
    };
}

marker_events!(
    BeforeShutdownEvent,
    ShutdownEvent,
    ManagerStartEvent,
    ManagerStopEvent,
    BeforeReloadEvent,
    AfterReloadEvent,
);

macro_rules! worker_events {
    ($($payload:ident),+ $(,)?) => {
        $(
            #[derive(Debug)]
            pub struct $payload {
                pub worker: WorkerInfo,
                stopped: bool,
            }

            impl $payload {
                pub(crate) fn new(worker: WorkerInfo) -> Self {
                    Self { worker, stopped: false }
                }
            }
        )+
    };
}

worker_events!(WorkerStartEvent, WorkerStopEvent, WorkerExitEvent);

#[derive(Debug)]
pub struct WorkerErrorEvent {
    pub worker: WorkerInfo,
    pub exit_code: i32,
    pub signal: i32,
    stopped: bool,
}

impl WorkerErrorEvent {
    pub(crate) fn new(worker: WorkerInfo, exit_code: i32, signal: i32) -> Self {
        Self {
            worker,
            exit_code,
            signal,
            stopped: false,
        }
    }
}

#[derive(Debug)]
pub struct ConnectEvent {
    pub conn: ConnectionInfo,
    stopped: bool,
}

impl ConnectEvent {
    pub(crate) fn new(conn: ConnectionInfo) -> Self {
        Self { conn, stopped: false }
    }
}

#[derive(Debug)]
pub struct ReceiveEvent {
    pub conn: ConnectionInfo,
    pub data: Bytes,
    stopped: bool,
}

impl ReceiveEvent {
    pub(crate) fn new(conn: ConnectionInfo, data: Bytes) -> Self {
        Self {
            conn,
            data,
            stopped: false,
        }
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.conn.connection_id
    }

    pub fn worker_id(&self) -> usize {
        self.conn.reactor_id
    }
}

/// Sends replies from the socket a datagram arrived on
#[derive(Clone)]
pub struct PacketReply {
    socket: Arc<dyn DatagramSocket>,
}

impl PacketReply {
    pub(crate) fn new(socket: Arc<dyn DatagramSocket>) -> Self {
        Self { socket }
    }

    /// Queue a datagram to `target`. Delivery is best effort.
    pub fn send_to(&self, target: SocketAddr, data: impl Into<Bytes>) {
        let socket = Arc::clone(&self.socket);
        let data = data.into();
        tokio::spawn(async move {
            if let Err(e) = socket.send_to(&data, target).await {
                crate::log_warn!("datagram to {} failed: {}", target, e);
            }
        });
    }
}

impl fmt::Debug for PacketReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PacketReply")
            .field("local_addr", &self.socket.local_addr().ok())
            .finish()
    }
}

#[derive(Debug)]
pub struct PacketEvent {
    pub worker: WorkerInfo,
    pub server_port: u16,
    pub client: SocketAddr,
    pub data: Bytes,
    reply: PacketReply,
    stopped: bool,
}

impl PacketEvent {
    pub(crate) fn new(
        worker: WorkerInfo,
        server_port: u16,
        client: SocketAddr,
        data: Bytes,
        reply: PacketReply,
    ) -> Self {
        Self {
            worker,
            server_port,
            client,
            data,
            reply,
            stopped: false,
        }
    }

    /// Answer the client that sent this datagram
    pub fn reply(&self, data: impl Into<Bytes>) {
        self.reply.send_to(self.client, data);
    }

    /// Reply handle that outlives the event
    pub fn replier(&self) -> PacketReply {
        self.reply.clone()
    }
}

#[derive(Debug)]
pub struct CloseEvent {
    pub conn: ConnectionInfo,
    pub reason: CloseReason,
    stopped: bool,
}

impl CloseEvent {
    pub(crate) fn new(conn: ConnectionInfo, reason: CloseReason) -> Self {
        Self {
            conn,
            reason,
            stopped: false,
        }
    }
}

/// Task started on a task worker. Call [`TaskEvent::finish`] to send a result
/// back to the dispatching worker.
#[derive(Debug)]
pub struct TaskEvent {
    pub worker: WorkerInfo,
    pub task_id: TaskId,
    pub src_worker_id: usize,
    pub data: Value,
    result: Option<Value>,
    stopped: bool,
}

impl TaskEvent {
    pub(crate) fn new(worker: WorkerInfo, task_id: TaskId, src_worker_id: usize, data: Value) -> Self {
        Self {
            worker,
            task_id,
            src_worker_id,
            data,
            result: None,
            stopped: false,
        }
    }

    /// Set the result delivered as the Finish event. A later call replaces it.
    pub fn finish(&mut self, result: impl Into<Value>) {
        self.result = Some(result.into());
    }

    pub fn result(&self) -> Option<&Value> {
        self.result.as_ref()
    }

    pub(crate) fn take_result(&mut self) -> Option<Value> {
        self.result.take()
    }
}

#[derive(Debug)]
pub struct FinishEvent {
    pub worker: WorkerInfo,
    pub task_id: TaskId,
    pub data: Value,
    stopped: bool,
}

impl FinishEvent {
    pub(crate) fn new(worker: WorkerInfo, task_id: TaskId, data: Value) -> Self {
        Self {
            worker,
            task_id,
            data,
            stopped: false,
        }
    }
}

#[derive(Debug)]
pub struct PipeMessageEvent {
    pub worker: WorkerInfo,
    pub src_worker_id: usize,
    pub message: Value,
    stopped: bool,
}

impl PipeMessageEvent {
    pub(crate) fn new(worker: WorkerInfo, src_worker_id: usize, message: Value) -> Self {
        Self {
            worker,
            src_worker_id,
            message,
            stopped: false,
        }
    }
}

#[derive(Debug)]
pub struct MessageEvent {
    pub conn: ConnectionInfo,
    pub frame: WebSocketFrame,
    pub request: Arc<WebSocketRequest>,
    stopped: bool,
}

impl MessageEvent {
    pub(crate) fn new(conn: ConnectionInfo, message: Message, request: Arc<WebSocketRequest>) -> Self {
        Self {
            frame: WebSocketFrame {
                connection_id: conn.connection_id,
                message,
                finish: true,
            },
            conn,
            request,
            stopped: false,
        }
    }
}

#[derive(Debug)]
pub struct OpenEvent {
    pub conn: ConnectionInfo,
    pub request: Arc<WebSocketRequest>,
    stopped: bool,
}

impl OpenEvent {
    pub(crate) fn new(conn: ConnectionInfo, request: Arc<WebSocketRequest>) -> Self {
        Self {
            conn,
            request,
            stopped: false,
        }
    }
}

/// Handlers may edit `response`; a status other than 101 rejects the upgrade.
#[derive(Debug)]
pub struct BeforeHandshakeResponseEvent {
    pub conn: ConnectionInfo,
    pub request: Arc<WebSocketRequest>,
    pub response: HandshakeResponse,
    stopped: bool,
}

impl BeforeHandshakeResponseEvent {
    pub(crate) fn new(
        conn: ConnectionInfo,
        request: Arc<WebSocketRequest>,
        response: HandshakeResponse,
    ) -> Self {
        Self {
            conn,
            request,
            response,
            stopped: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn() -> ConnectionInfo {
        ConnectionInfo {
            connection_id: 1,
            reactor_id: 0,
            server_port: 9501,
            remote_addr: "127.0.0.1:5000".parse().unwrap(),
        }
    }

    #[test]
    fn test_kind_roundtrip() {
        let mut event = ReceiveEvent::new(conn(), Bytes::from_static(b"x")).into_event();
        assert_eq!(event.kind(), EventKind::Receive);
        assert!(ReceiveEvent::from_event_mut(&mut event).is_some());
        assert!(CloseEvent::from_event_mut(&mut event).is_none());
    }

    #[test]
    fn test_stop_propagation_visible_through_event() {
        let mut event: Event = ConnectEvent::new(conn()).into();
        assert!(!event.is_propagation_stopped());
        if let Some(payload) = ConnectEvent::from_event_mut(&mut event) {
            payload.stop_propagation();
        }
        assert!(event.is_propagation_stopped());
    }

    #[test]
    fn test_connection_scoped_kinds() {
        assert!(EventKind::Receive.is_connection_scoped());
        assert!(EventKind::BeforeHandshakeResponse.is_connection_scoped());
        assert!(!EventKind::Finish.is_connection_scoped());
        assert!(!EventKind::WorkerError.is_connection_scoped());
        assert_eq!(EventKind::ALL.len(), 21);
        assert_eq!(EventKind::PipeMessage.to_string(), "PipeMessage");
    }

    #[test]
    fn test_task_finish_sets_result() {
        let worker = WorkerInfo {
            worker_id: 2,
            task_worker: true,
        };
        let mut task = TaskEvent::new(worker, 9, 0, serde_json::json!({"op": "noop"}));
        assert!(task.result().is_none());
        task.finish(serde_json::json!({"ok": true}));
        assert_eq!(task.take_result(), Some(serde_json::json!({"ok": true})));
    }
}
