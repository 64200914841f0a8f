//! Prelude module with common imports

pub use crate::config::{DispatchMode, ListenerConfig, RespawnPolicy, ServerConfig, ServerMode, SockType};
pub use crate::error::{HandlerError, Result, ServerError};
pub use crate::event::{
    AfterReloadEvent, BeforeHandshakeResponseEvent, BeforeReloadEvent, BeforeShutdownEvent,
    CloseEvent, CloseReason, ConnectEvent, ConnectionInfo, Event, EventKind, FinishEvent,
    ManagerStartEvent, ManagerStopEvent, MessageEvent, OpenEvent, PacketEvent, PipeMessageEvent,
    ReceiveEvent, ServerEvent, ShutdownEvent, StartEvent, TaskEvent, WebSocketFrame,
    WebSocketRequest, WorkerErrorEvent, WorkerExitEvent, WorkerInfo, WorkerStartEvent,
    WorkerStopEvent,
};
pub use crate::handler::{from_fn, Context, Handler, HandlerResult, Role};
pub use crate::server::{Server, ServerBuilder, ServerHandle, SubServer};
pub use crate::task::TaskId;

pub use gyre_core::prelude::*;
