//! Gyre Server
//!
//! Event-driven server runtime. Handlers subscribe to typed lifecycle,
//! connection and task events; the server runs them on a pool of event
//! workers, offloads blocking work to task workers, upgrades WebSocket
//! connections and supervises every worker.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use gyre_server::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> gyre_server::Result<()> {
//!     let server = Server::builder()
//!         .port(9501)
//!         .sock_type(SockType::WebSocket)
//!         .worker_num(4)
//!         .build()?;
//!
//!     server.on(|event: &mut MessageEvent, ctx: &mut Context<'_>| {
//!         let id = event.conn.connection_id;
//!         ctx.push(id, event.frame.message.clone())?;
//!         Ok(())
//!     })?;
//!
//!     server.listen().await
//! }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(missing_debug_implementations, rust_2018_idioms)]

pub mod bus;
pub mod config;
pub mod connection;
pub mod error;
pub mod event;
pub mod handler;
pub mod logging;
pub mod server;
pub mod task;

mod manager;
mod reactor;
mod signals;

pub mod prelude;

pub use bus::{EventBus, SubscriptionId};
pub use config::{DispatchMode, ListenerConfig, RespawnPolicy, ServerConfig, ServerMode, SockType};
pub use connection::{Connection, ConnectionId, ConnectionState};
pub use error::{
    ConfigError, ConnectionError, ContextError, ErrorContext, FrameDecodeError, HandlerError,
    HandshakeError, Result, ServerError, TaskError, TransportError, WorkerError,
};
pub use event::{CloseReason, Event, EventKind, ServerEvent};
pub use handler::{from_fn, Context, FnHandler, Handler, HandlerResult, Role};
pub use logging::{init_logging, LogFormat};
pub use server::{Server, ServerBuilder, ServerHandle, ServerInfo, SubServer};
pub use task::{TaskId, TaskLedger};
