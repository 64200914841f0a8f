//! Per-worker event loop
//!
//! A [`Reactor`] owns one event worker's connections. Everything that
//! happens to the worker arrives as a [`WorkerInput`] on its queue: accepted
//! streams from the acceptors, bytes and hang-ups from connection reader
//! tasks, datagrams, task results, pipe messages and stop requests. Inputs
//! are processed one at a time and handlers run to completion before the
//! next input is taken, so a worker never dispatches two events at once.

use crate::bus::Buses;
use crate::connection::{Connection, ConnectionId, ConnectionState, ConnectionTable, Incoming};
use crate::error::{
    logging, ContextError, ErrorContext, FrameDecodeError, HandlerError, HandshakeError, ServerError,
};
use crate::event::{
    BeforeHandshakeResponseEvent, CloseEvent, CloseReason, ConnectEvent, ConnectionInfo, Event,
    FinishEvent, MessageEvent, OpenEvent, PacketEvent, PacketReply, PipeMessageEvent, ReceiveEvent,
    ServerEvent, WebSocketRequest, WorkerExitEvent, WorkerInfo, WorkerStartEvent, WorkerStopEvent,
};
use crate::handler::{Context, HandlerResult};
use crate::server::Shared;
use crate::task::{TaskId, TaskLedger};
use bytes::Bytes;
use gyre_core::error::{CloseCode, Error as CoreError};
use gyre_core::handshake::{HandshakeRequest, HandshakeResponse};
use gyre_core::message::Message;
use http::StatusCode;
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Queue feeding one event worker
pub(crate) type WorkerSender = mpsc::UnboundedSender<WorkerInput>;

/// Everything an event worker reacts to
#[derive(Debug)]
pub(crate) enum WorkerInput {
    /// New stream from an acceptor
    Accept(Incoming),
    /// Connection handed over by a retiring worker
    Adopt(Box<Connection>),
    Data {
        id: ConnectionId,
        data: Bytes,
    },
    /// Peer hung up, or reading failed
    Closed {
        id: ConnectionId,
        error: Option<String>,
    },
    WriteFailed {
        id: ConnectionId,
        error: String,
    },
    HandshakeExpired {
        id: ConnectionId,
    },
    Packet {
        listener: usize,
        client: SocketAddr,
        data: Bytes,
    },
    /// Outcome of a task this worker dispatched; `None` when no result was set
    TaskFinished {
        task_id: TaskId,
        data: Option<Value>,
    },
    PipeMessage {
        src_worker_id: usize,
        message: Value,
    },
    /// Close every connection and exit once idle
    Stop,
    /// Hand raw TCP connections to `successor`, close the rest, exit once idle
    Retire {
        successor: WorkerSender,
    },
}

enum Drain {
    Stop,
    Retire(WorkerSender),
}

/// One event worker's loop and state
pub(crate) struct Reactor {
    id: usize,
    shared: Arc<Shared>,
    buses: Buses,
    table: ConnectionTable,
    ledger: TaskLedger,
    inbox: mpsc::UnboundedReceiver<WorkerInput>,
    drain: Option<Drain>,
    /// Exits after its connections are gone (process-per-connection mode)
    ephemeral: bool,
    served: bool,
}

impl Reactor {
    pub(crate) fn new(
        id: usize,
        shared: Arc<Shared>,
        buses: Buses,
        sender: WorkerSender,
        inbox: mpsc::UnboundedReceiver<WorkerInput>,
        ephemeral: bool,
    ) -> Self {
        Self {
            id,
            shared,
            buses,
            table: ConnectionTable::new(id, sender),
            ledger: TaskLedger::new(),
            inbox,
            drain: None,
            ephemeral,
            served: false,
        }
    }

    fn worker_info(&self) -> WorkerInfo {
        WorkerInfo {
            worker_id: self.id,
            task_worker: false,
        }
    }

    /// Run until stopped. An `Err` means a handler asked the worker to exit.
    pub(crate) async fn run(mut self) -> Result<(), ServerError> {
        logging::log_worker_started(self.id, false);
        let mut start = WorkerStartEvent::new(self.worker_info()).into_event();
        self.dispatch(0, &mut start, None)?;

        while let Some(input) = self.inbox.recv().await {
            self.handle(input)?;
            self.flush_closes()?;
            if self.is_done() {
                break;
            }
        }

        self.inbox.close();
        if let Some(Drain::Retire(successor)) = &self.drain {
            // inputs that raced the hand-off belong to the successor now
            while let Ok(input) = self.inbox.try_recv() {
                if !matches!(input, WorkerInput::Stop | WorkerInput::Retire { .. }) {
                    let _ = successor.send(input);
                }
            }
        }

        let mut stop = WorkerStopEvent::new(self.worker_info()).into_event();
        self.dispatch(0, &mut stop, None)?;
        Ok(())
    }

    fn is_done(&self) -> bool {
        let idle = self.table.is_empty() && self.ledger.is_empty();
        match self.drain {
            Some(_) => idle,
            None => self.ephemeral && self.served && idle,
        }
    }

    /// Run the handlers for `event`, choosing the listener's bus for
    /// connection-scoped kinds.
    fn publish(&mut self, listener: usize, event: &mut Event) -> HandlerResult {
        let kind = event.kind();
        let buses = &self.buses;
        let bus = if kind.is_connection_scoped() {
            buses.for_listener(listener, kind)
        } else {
            buses.main()
        };
        let mut ctx = Context::worker(
            self.id,
            &self.shared,
            buses,
            &mut self.table,
            &mut self.ledger,
        );
        bus.publish(event, &mut ctx)
    }

    /// Publish behind the error boundary: a failing handler is logged and
    /// closes only the connection the event was about.
    fn dispatch(
        &mut self,
        listener: usize,
        event: &mut Event,
        connection: Option<ConnectionId>,
    ) -> Result<(), ServerError> {
        match self.publish(listener, event) {
            Ok(()) => Ok(()),
            Err(err) => self.handler_failed(event.kind(), connection, err),
        }
    }

    fn handler_failed(
        &mut self,
        kind: crate::event::EventKind,
        connection: Option<ConnectionId>,
        err: HandlerError,
    ) -> Result<(), ServerError> {
        let fatal = err.is_fatal();
        let mut context = ErrorContext::new().with_event(kind).with_worker_id(self.id);
        if let Some(id) = connection {
            context = context.with_connection_id(id);
            if let Some(conn) = self.table.get(id) {
                context = context.with_remote_addr(conn.remote_addr());
            }
        }
        logging::log_error(&ContextError::new(err, context));

        #[cfg(feature = "metrics")]
        metrics::counter!("gyre_handler_errors_total").increment(1);

        if fatal {
            return Err(HandlerError::Fatal(format!("worker {} terminated by handler", self.id)).into());
        }
        if let Some(id) = connection {
            if let Some(conn) = self.table.get(id) {
                if conn.is_websocket() {
                    conn.write_close_frame(CloseCode::Internal, "");
                }
            }
            let _ = self.table.close(id, CloseReason::HandlerError);
        }
        Ok(())
    }

    fn info(&self, id: ConnectionId) -> Option<(usize, ConnectionInfo)> {
        let conn = self.table.get(id)?;
        Some((conn.listener(), self.table.info(id)?))
    }

    /// Retiring workers pass inputs for connections they no longer own on
    fn forward(&self, input: WorkerInput) {
        if let Some(Drain::Retire(successor)) = &self.drain {
            let _ = successor.send(input);
        }
    }

    fn handle(&mut self, input: WorkerInput) -> Result<(), ServerError> {
        match input {
            WorkerInput::Accept(incoming) => self.on_accept(incoming),
            WorkerInput::Adopt(connection) => self.on_adopt(*connection),
            WorkerInput::Data { id, data } => self.on_data(id, data),
            WorkerInput::Closed { id, error } => {
                if self.table.get(id).is_none() {
                    self.forward(WorkerInput::Closed { id, error });
                    return Ok(());
                }
                if let Some(error) = error {
                    crate::log_debug!("connection {} read failed: {}", id, error);
                }
                let _ = self.table.close(id, CloseReason::Peer);
                Ok(())
            }
            WorkerInput::WriteFailed { id, error } => {
                if self.table.get(id).is_none() {
                    self.forward(WorkerInput::WriteFailed { id, error });
                    return Ok(());
                }
                crate::log_warn!("connection {} write failed: {}", id, error);
                let _ = self.table.close(id, CloseReason::WriteFailed);
                Ok(())
            }
            WorkerInput::HandshakeExpired { id } => {
                self.on_handshake_expired(id);
                Ok(())
            }
            WorkerInput::Packet {
                listener,
                client,
                data,
            } => self.on_packet(listener, client, data),
            WorkerInput::TaskFinished { task_id, data } => self.on_task_finished(task_id, data),
            WorkerInput::PipeMessage {
                src_worker_id,
                message,
            } => {
                if self.drain.is_some() {
                    self.forward(WorkerInput::PipeMessage {
                        src_worker_id,
                        message,
                    });
                    return Ok(());
                }
                let mut event =
                    PipeMessageEvent::new(self.worker_info(), src_worker_id, message).into_event();
                self.dispatch(0, &mut event, None)
            }
            WorkerInput::Stop => self.begin_drain(Drain::Stop),
            WorkerInput::Retire { successor } => self.begin_drain(Drain::Retire(successor)),
        }
    }

    fn on_accept(&mut self, incoming: Incoming) -> Result<(), ServerError> {
        match &self.drain {
            Some(Drain::Retire(successor)) => {
                let _ = successor.send(WorkerInput::Accept(incoming));
                return Ok(());
            }
            Some(Drain::Stop) => {
                crate::log_debug!("worker {} stopping; refused connection {}", self.id, incoming.id);
                return Ok(());
            }
            None => {}
        }

        self.served = true;
        let listener = incoming.listener;
        let info = self.table.accept(incoming, &self.shared);
        let id = info.connection_id;
        logging::log_connection_established(id, info.remote_addr, self.id);

        #[cfg(feature = "metrics")]
        metrics::counter!("gyre_connections_accepted_total").increment(1);

        if self.table.get(id).map(Connection::state) == Some(ConnectionState::Handshaking) {
            let timeout = self.shared.config.handshake_timeout();
            let worker = self.table.reply_sender().clone();
            let timer = tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                let _ = worker.send(WorkerInput::HandshakeExpired { id });
            })
            .abort_handle();
            if let Some(conn) = self.table.get_mut(id) {
                conn.set_handshake_timer(timer);
            }
        }

        let mut event = ConnectEvent::new(info).into_event();
        self.dispatch(listener, &mut event, Some(id))
    }

    fn on_adopt(&mut self, connection: Connection) -> Result<(), ServerError> {
        if self.drain.is_some() {
            // pass it along; dropped if this worker is stopping for good
            crate::log_debug!("worker {} draining; passing on connection {}", self.id, connection.id());
            self.forward(WorkerInput::Adopt(Box::new(connection)));
            return Ok(());
        }
        self.served = true;
        let info = self.table.adopt(connection);
        crate::log_debug!(
            "worker {} adopted connection {} from {}",
            self.id,
            info.connection_id,
            info.remote_addr
        );
        Ok(())
    }

    fn on_data(&mut self, id: ConnectionId, data: Bytes) -> Result<(), ServerError> {
        let Some(state) = self.table.get(id).map(Connection::state) else {
            self.forward(WorkerInput::Data { id, data });
            return Ok(());
        };
        match state {
            ConnectionState::RawTcp => self.publish_receive(id, data),
            ConnectionState::Handshaking => self.on_handshake_data(id, data),
            ConnectionState::WebSocketOpen => self.on_frame_data(id, data),
            ConnectionState::Closing | ConnectionState::Closed => Ok(()),
        }
    }

    fn publish_receive(&mut self, id: ConnectionId, data: Bytes) -> Result<(), ServerError> {
        let Some((listener, info)) = self.info(id) else {
            return Ok(());
        };
        let mut event = ReceiveEvent::new(info, data).into_event();
        self.dispatch(listener, &mut event, Some(id))
    }

    fn on_handshake_data(&mut self, id: ConnectionId, data: Bytes) -> Result<(), ServerError> {
        let Some(conn) = self.table.get_mut(id) else {
            return Ok(());
        };
        conn.handshake_buf.extend_from_slice(&data);
        let (request, consumed) = match HandshakeRequest::parse(&conn.handshake_buf) {
            Ok(None) => return Ok(()),
            Ok(Some(parsed)) => parsed,
            Err(e) => {
                self.reject_handshake(id, StatusCode::BAD_REQUEST, HandshakeError::InvalidRequest(e));
                return Ok(());
            }
        };

        if !request.is_upgrade() {
            // no upgrade asked for: the connection stays raw TCP
            conn.set_state(ConnectionState::RawTcp);
            let buffered = conn.handshake_buf.split().freeze();
            return self.publish_receive(id, buffered);
        }

        let response = match request.validate().and_then(HandshakeResponse::accept) {
            Ok(response) => response,
            Err(e) => {
                self.reject_handshake(id, StatusCode::BAD_REQUEST, HandshakeError::InvalidRequest(e));
                return Ok(());
            }
        };

        let _head = conn.handshake_buf.split_to(consumed);
        let leftover = conn.handshake_buf.split().freeze();
        let ws_request = Arc::new(WebSocketRequest::from_handshake(
            id,
            &request,
            conn.remote_addr(),
        ));
        conn.request = Some(Arc::clone(&ws_request));

        let Some((listener, info)) = self.info(id) else {
            return Ok(());
        };
        let mut event =
            BeforeHandshakeResponseEvent::new(info, Arc::clone(&ws_request), response).into_event();
        if let Err(err) = self.publish(listener, &mut event) {
            if let Some(conn) = self.table.get(id) {
                conn.write_raw(
                    HandshakeResponse::reject(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error")
                        .to_bytes(),
                );
            }
            return self.handler_failed(event.kind(), Some(id), err);
        }
        let Event::BeforeHandshakeResponse(BeforeHandshakeResponseEvent { response, .. }) = event else {
            return Ok(());
        };

        let Some(conn) = self.table.get_mut(id) else {
            return Ok(());
        };
        if conn.state() != ConnectionState::Handshaking {
            // a handler closed it
            return Ok(());
        }
        conn.write_raw(response.to_bytes());
        if !response.is_switching() {
            let err = HandshakeError::Rejected {
                status: response.status,
            };
            self.log_connection_warning(id, &err.to_string());
            let _ = self.table.close(id, CloseReason::HandshakeFailed);
            return Ok(());
        }
        conn.set_state(ConnectionState::WebSocketOpen);

        let mut open = OpenEvent::new(info, ws_request).into_event();
        self.dispatch(listener, &mut open, Some(id))?;

        if !leftover.is_empty() {
            return self.on_frame_data(id, leftover);
        }
        Ok(())
    }

    fn reject_handshake(&mut self, id: ConnectionId, status: StatusCode, err: HandshakeError) {
        self.log_connection_warning(id, &err.to_string());
        if let Some(conn) = self.table.get(id) {
            let reason = status.canonical_reason().unwrap_or("Bad Request");
            conn.write_raw(HandshakeResponse::reject(status, reason).to_bytes());
        }
        let reason = if status == StatusCode::REQUEST_TIMEOUT {
            CloseReason::HandshakeTimeout
        } else {
            CloseReason::HandshakeFailed
        };
        let _ = self.table.close(id, reason);
    }

    fn on_handshake_expired(&mut self, id: ConnectionId) {
        if self.table.get(id).map(Connection::state) == Some(ConnectionState::Handshaking) {
            let timeout = self.shared.config.handshake_timeout();
            self.reject_handshake(id, StatusCode::REQUEST_TIMEOUT, HandshakeError::Timeout { timeout });
        }
    }

    fn log_connection_warning(&self, id: ConnectionId, message: &str) {
        let mut context = ErrorContext::new()
            .with_connection_id(id)
            .with_worker_id(self.id);
        if let Some(conn) = self.table.get(id) {
            context = context.with_remote_addr(conn.remote_addr());
        }
        logging::log_warning(message, &context);
    }

    fn on_frame_data(&mut self, id: ConnectionId, data: Bytes) -> Result<(), ServerError> {
        let Some(conn) = self.table.get_mut(id) else {
            return Ok(());
        };
        conn.parser.feed(&data);

        loop {
            let Some(conn) = self.table.get_mut(id) else {
                break;
            };
            if conn.state() != ConnectionState::WebSocketOpen {
                break;
            }
            let frame = match conn.parser.next_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(e) => {
                    self.protocol_error(id, e);
                    break;
                }
            };
            let message = match conn.assembler.push(frame) {
                Ok(Some(message)) => message,
                Ok(None) => continue,
                Err(e) => {
                    self.protocol_error(id, e);
                    break;
                }
            };

            match message {
                Message::Ping(payload) => {
                    let _ = conn.write_message(&Message::Pong(payload));
                }
                Message::Pong(_) => {}
                Message::Close(close) => {
                    let code = match close {
                        Some(close) if close.code.is_sendable() => close.code,
                        Some(_) => CloseCode::ProtocolError,
                        None => CloseCode::Normal,
                    };
                    conn.write_close_frame(code, "");
                    let _ = self.table.close(id, CloseReason::Peer);
                    break;
                }
                message => {
                    let request = conn.request.clone();
                    let Some((listener, info)) = self.info(id) else {
                        break;
                    };
                    let Some(request) = request else {
                        break;
                    };
                    let mut event = MessageEvent::new(info, message, request).into_event();
                    self.dispatch(listener, &mut event, Some(id))?;
                }
            }
        }
        Ok(())
    }

    /// Close a connection whose peer sent undecodable frames
    fn protocol_error(&mut self, id: ConnectionId, source: CoreError) {
        let code = source.close_code();
        let err = FrameDecodeError {
            connection_id: id,
            source,
        };
        self.log_connection_warning(id, &err.to_string());
        if let Some(conn) = self.table.get(id) {
            conn.write_close_frame(code, "");
        }
        let _ = self.table.close(id, CloseReason::Protocol(code));
    }

    fn on_packet(&mut self, listener: usize, client: SocketAddr, data: Bytes) -> Result<(), ServerError> {
        let Some(runtime) = self.shared.listener(listener) else {
            return Ok(());
        };
        let Some(socket) = runtime.datagram.clone() else {
            return Ok(());
        };
        let port = runtime.local_addr.port();
        let mut event = PacketEvent::new(
            self.worker_info(),
            port,
            client,
            data,
            PacketReply::new(socket),
        )
        .into_event();
        self.dispatch(listener, &mut event, None)
    }

    fn on_task_finished(&mut self, task_id: TaskId, data: Option<Value>) -> Result<(), ServerError> {
        if !self.ledger.complete(task_id) {
            crate::log_debug!("worker {} ignored completion of unknown task {}", self.id, task_id);
            return Ok(());
        }
        let Some(data) = data else {
            return Ok(());
        };

        #[cfg(feature = "metrics")]
        metrics::counter!("gyre_tasks_finished_total").increment(1);

        let mut event = FinishEvent::new(self.worker_info(), task_id, data).into_event();
        self.dispatch(0, &mut event, None)
    }

    fn begin_drain(&mut self, drain: Drain) -> Result<(), ServerError> {
        if self.drain.is_some() {
            return Ok(());
        }
        let mut exit = WorkerExitEvent::new(self.worker_info()).into_event();
        self.dispatch(0, &mut exit, None)?;

        for id in self.table.ids() {
            let Some(state) = self.table.get(id).map(Connection::state) else {
                continue;
            };
            match (&drain, state) {
                (Drain::Retire(successor), ConnectionState::RawTcp) => {
                    if let Some(conn) = self.table.detach(id) {
                        // on failure the connection is dropped with the message
                        let _ = successor.send(WorkerInput::Adopt(Box::new(conn)));
                    }
                }
                (_, ConnectionState::Closing | ConnectionState::Closed) => {}
                (drain, state) => {
                    let (code, reason) = match drain {
                        Drain::Stop => (CloseCode::Away, CloseReason::WorkerStopping),
                        Drain::Retire(_) => (CloseCode::Away, CloseReason::Reload),
                    };
                    if state == ConnectionState::WebSocketOpen {
                        if let Some(conn) = self.table.get(id) {
                            conn.write_close_frame(code, "server going away");
                        }
                    }
                    let _ = self.table.close(id, reason);
                }
            }
        }
        self.drain = Some(drain);
        Ok(())
    }

    /// Remove connections closed during the last input and publish Close
    fn flush_closes(&mut self) -> Result<(), ServerError> {
        while self.table.has_pending_closes() {
            for (id, reason) in self.table.take_pending_closes() {
                let Some((info, connection)) = self.table.remove(id) else {
                    continue;
                };
                let listener = connection.listener();
                drop(connection);
                logging::log_connection_closed(id, reason.as_str());

                #[cfg(feature = "metrics")]
                metrics::counter!("gyre_connections_closed_total").increment(1);

                let mut event = CloseEvent::new(info, reason).into_event();
                self.dispatch(listener, &mut event, None)?;
            }
        }
        Ok(())
    }
}
