//! Error handling for the server runtime
//!
//! [`ServerError`] is the single error type surfaced by the public API. Each
//! failure class has its own sub-enum so callers can match on what went wrong
//! without parsing messages.

use crate::event::EventKind;
use crate::task::TaskId;
use gyre_core::error::Error as CoreError;
use std::fmt;
use std::io;
use std::net::SocketAddr;

/// Result type for server operations
pub type Result<T> = std::result::Result<T, ServerError>;

/// Everything the server API can fail with
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// Invalid or late configuration
    #[error("config: {0}")]
    Config(#[from] ConfigError),

    /// Connection lookup and write errors
    #[error("connection: {0}")]
    Connection(#[from] ConnectionError),

    /// Malformed upgrade request
    #[error("handshake: {0}")]
    Handshake(#[from] HandshakeError),

    /// Corrupt or oversized frame
    #[error("frame: {0}")]
    Frame(#[from] FrameDecodeError),

    /// Failure inside a subscribed handler
    #[error("handler: {0}")]
    Handler(#[from] HandlerError),

    /// Worker supervision errors, including crashes
    #[error("worker: {0}")]
    Worker(#[from] WorkerError),

    /// Task dispatch and delivery errors
    #[error("task: {0}")]
    Task(#[from] TaskError),

    /// Binding and accepting
    #[error("transport: {0}")]
    Transport(#[from] TransportError),

    /// I/O error
    #[error(transparent)]
    Io(#[from] io::Error),

    /// Wire-level error
    #[error(transparent)]
    Core(#[from] CoreError),
}

/// Configuration errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// Configuration or subscriptions changed after `listen`
    #[error("server already listening, configuration is frozen")]
    AlreadyStarted,

    /// Option name not known
    #[error("unknown option `{0}`")]
    UnknownOption(String),

    /// Option value rejected
    #[error("bad value for `{field}`: {reason}")]
    InvalidValue { field: String, reason: String },

    /// `configure` expects a flat object
    #[error("options must be a flat JSON object")]
    NotAnObject,

    /// Config could not be converted for merging
    #[error("cannot merge options: {0}")]
    Serialization(String),
}

/// Connection errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectionError {
    #[error("no connection {id}")]
    NotFound { id: u64 },

    #[error("connection {id} is closing")]
    Closing { id: u64 },

    #[error("connection {id} is not an open websocket")]
    NotWebSocket { id: u64 },

    #[error("at connection limit ({current} of {max})")]
    LimitExceeded { current: usize, max: usize },

    /// Connection operations need an event worker context
    #[error("no connection table outside an event worker")]
    NoConnectionTable,
}

/// Handshake errors
#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("bad upgrade request: {0}")]
    InvalidRequest(#[source] CoreError),

    #[error("no upgrade within {timeout:?}")]
    Timeout { timeout: std::time::Duration },

    #[error("upgrade refused with {status}")]
    Rejected { status: http::StatusCode },
}

/// Frame decoding errors
#[derive(Debug, thiserror::Error)]
#[error("on connection {connection_id}: {source}")]
pub struct FrameDecodeError {
    pub connection_id: u64,
    #[source]
    pub source: CoreError,
}

/// Handler errors
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    /// Handler returned an error
    #[error("{0}")]
    ReturnedError(String),

    /// Handler panicked; the panic was contained
    #[error("panic in handler: {0}")]
    Panicked(String),

    /// Handler asked for its worker to terminate
    #[error("fatal, worker exits: {0}")]
    Fatal(String),

    /// A server operation called from the handler failed
    #[error("{0}")]
    Server(Box<ServerError>),
}

impl HandlerError {
    /// Shorthand for returning an application error from a handler
    pub fn msg(message: impl fmt::Display) -> Self {
        HandlerError::ReturnedError(message.to_string())
    }

    /// Whether the error should terminate the worker
    pub fn is_fatal(&self) -> bool {
        matches!(self, HandlerError::Fatal(_))
    }
}

impl From<ServerError> for HandlerError {
    fn from(err: ServerError) -> Self {
        HandlerError::Server(Box::new(err))
    }
}

impl From<ConnectionError> for HandlerError {
    fn from(err: ConnectionError) -> Self {
        ServerError::from(err).into()
    }
}

impl From<TaskError> for HandlerError {
    fn from(err: TaskError) -> Self {
        ServerError::from(err).into()
    }
}

/// Worker supervision errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WorkerError {
    /// A worker exited abnormally
    #[error("worker {worker_id} died (code {exit_code}, signal {signal})")]
    Crashed {
        worker_id: usize,
        exit_code: i32,
        signal: i32,
    },

    #[error("no event worker {0}")]
    NotFound(usize),

    #[error("reload already running")]
    ReloadInProgress,

    #[error("server not running")]
    NotRunning,

    /// The supervisor went away before replying
    #[error("supervisor is gone")]
    SupervisorGone,
}

/// Task errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskError {
    /// The originating worker was gone when the result arrived
    #[error("task {task_id} result dropped, worker {worker_id} gone")]
    DeliveryMiss { task_id: TaskId, worker_id: usize },

    #[error("task_worker_num is 0")]
    NoTaskWorkers,

    #[error("task queue full at {capacity}")]
    QueueFull { capacity: usize },

    #[error("task pool closed")]
    PoolClosed,

    /// Tasks can only be dispatched from event workers
    #[error("task dispatched outside an event worker")]
    NotAnEventWorker,
}

/// Transport errors
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("bind {addr}: {source}")]
    BindFailed {
        addr: SocketAddr,
        #[source]
        source: CoreError,
    },

    #[error("accept on {addr}: {source}")]
    AcceptFailed {
        addr: SocketAddr,
        #[source]
        source: CoreError,
    },

    /// No transport compiled in and none supplied
    #[error("no transport, enable `net` or pass one to the builder")]
    Unavailable,
}

/// Where an error happened, for logging at the dispatch boundary
#[derive(Debug, Clone, Default)]
pub struct ErrorContext {
    pub event: Option<EventKind>,
    pub connection_id: Option<u64>,
    pub worker_id: Option<usize>,
    pub remote_addr: Option<SocketAddr>,
}

impl ErrorContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_event(mut self, kind: EventKind) -> Self {
        self.event = Some(kind);
        self
    }

    pub fn with_connection_id(mut self, id: u64) -> Self {
        self.connection_id = Some(id);
        self
    }

    pub fn with_worker_id(mut self, id: usize) -> Self {
        self.worker_id = Some(id);
        self
    }

    pub fn with_remote_addr(mut self, addr: SocketAddr) -> Self {
        self.remote_addr = Some(addr);
        self
    }
}

/// A [`ServerError`] tagged with where it happened
#[derive(Debug)]
pub struct ContextError {
    pub error: ServerError,
    pub context: ErrorContext,
}

impl ContextError {
    pub fn new(error: impl Into<ServerError>, context: ErrorContext) -> Self {
        Self {
            error: error.into(),
            context,
        }
    }
}

impl fmt::Display for ContextError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.error)?;
        if let Some(kind) = self.context.event {
            write!(f, " (event: {:?})", kind)?;
        }
        if let Some(id) = self.context.connection_id {
            write!(f, " (connection: {})", id)?;
        }
        if let Some(id) = self.context.worker_id {
            write!(f, " (worker: {})", id)?;
        }
        if let Some(addr) = self.context.remote_addr {
            write!(f, " (remote: {})", addr)?;
        }
        Ok(())
    }
}

impl std::error::Error for ContextError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

/// Structured log records for the runtime's notable events
#[cfg(feature = "logging")]
pub mod logging {
    use super::*;
    use tracing::{debug, error, info, warn};

    pub fn log_server_start(addrs: &[SocketAddr], workers: usize, task_workers: usize) {
        info!(
            listeners = ?addrs,
            workers = workers,
            task_workers = task_workers,
            "listening"
        );
    }

    pub fn log_server_shutdown() {
        info!("shut down");
    }

    pub fn log_worker_started(worker_id: usize, task_worker: bool) {
        debug!(worker_id = worker_id, task_worker = task_worker, "worker up");
    }

    pub fn log_worker_exit(worker_id: usize, exit_code: i32, signal: i32) {
        if exit_code == 0 && signal == 0 {
            debug!(worker_id = worker_id, "worker exited");
        } else {
            error!(
                worker_id = worker_id,
                exit_code = exit_code,
                signal = signal,
                "worker died"
            );
        }
    }

    pub fn log_worker_terminated(worker_id: usize, grace: std::time::Duration) {
        warn!(
            worker_id = worker_id,
            grace = ?grace,
            "Worker still busy after grace period; terminated, in-flight work is lost"
        );
    }

    pub fn log_connection_established(id: u64, remote_addr: SocketAddr, worker_id: usize) {
        debug!(
            connection_id = id,
            remote_addr = %remote_addr,
            worker_id = worker_id,
            "connection accepted"
        );
    }

    pub fn log_connection_closed(id: u64, reason: &str) {
        debug!(connection_id = id, reason = reason, "connection closed");
    }

    pub fn log_error(error: &ContextError) {
        error!(
            error = %error.error,
            event = ?error.context.event,
            connection_id = ?error.context.connection_id,
            worker_id = ?error.context.worker_id,
            remote_addr = ?error.context.remote_addr,
            "handler failed"
        );
    }

    pub fn log_warning(message: &str, context: &ErrorContext) {
        warn!(
            message = message,
            event = ?context.event,
            connection_id = ?context.connection_id,
            worker_id = ?context.worker_id,
            remote_addr = ?context.remote_addr,
            "runtime warning"
        );
    }

    pub fn log_task_delivery_miss(task_id: TaskId, worker_id: usize) {
        warn!(
            task_id = task_id,
            worker_id = worker_id,
            "Task result discarded: originating worker is gone"
        );
    }
}

/// Fallback through the `log` facade when the `logging` feature is disabled
#[cfg(not(feature = "logging"))]
pub mod logging {
    use super::*;

    pub fn log_server_start(addrs: &[SocketAddr], workers: usize, task_workers: usize) {
        log::info!("listening on {addrs:?} ({workers} workers, {task_workers} task workers)");
    }

    pub fn log_server_shutdown() {
        log::info!("shut down");
    }

    pub fn log_worker_started(worker_id: usize, task_worker: bool) {
        log::debug!("Worker {worker_id} started (task worker: {task_worker})");
    }

    pub fn log_worker_exit(worker_id: usize, exit_code: i32, signal: i32) {
        if exit_code == 0 && signal == 0 {
            log::debug!("Worker {worker_id} exited");
        } else {
            log::error!("Worker {worker_id} exited abnormally (exit code {exit_code}, signal {signal})");
        }
    }

    pub fn log_worker_terminated(worker_id: usize, grace: std::time::Duration) {
        log::warn!("Worker {worker_id} still busy after {grace:?}; terminated, in-flight work is lost");
    }

    pub fn log_connection_established(id: u64, remote_addr: SocketAddr, worker_id: usize) {
        log::debug!("Connection {id} from {remote_addr} on worker {worker_id}");
    }

    pub fn log_connection_closed(id: u64, reason: &str) {
        log::debug!("Connection {id} closed: {reason}");
    }

    pub fn log_error(error: &ContextError) {
        log::error!("{error}");
    }

    pub fn log_warning(message: &str, context: &ErrorContext) {
        log::warn!("{message} {context:?}");
    }

    pub fn log_task_delivery_miss(task_id: TaskId, worker_id: usize) {
        log::warn!("Task {task_id} result discarded: worker {worker_id} is gone");
    }
}
