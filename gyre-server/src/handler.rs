//! Event handlers and the context they run in
//!
//! A handler receives the event payload and a [`Context`] describing where it
//! runs. Event workers get access to their own connections and may dispatch
//! tasks; task workers and the supervisor get a narrower context.

use crate::bus::{Buses, SubscriptionId};
use crate::config::ServerConfig;
use crate::connection::{Connection, ConnectionId, ConnectionTable};
use crate::error::{ConnectionError, HandlerError, ServerError, TaskError, WorkerError};
use crate::event::{Event, ServerEvent};
use crate::reactor::WorkerInput;
use crate::server::{ServerHandle, Shared};
use crate::task::{TaskId, TaskLedger};
use bytes::Bytes;
use gyre_core::message::Message;
use serde_json::Value;
use std::fmt;
use std::marker::PhantomData;

/// Result returned by every handler
pub type HandlerResult = Result<(), HandlerError>;

/// Trait for event handlers
pub trait Handler: Send + Sync + 'static {
    /// Handle an event. Events of other kinds are ignored.
    fn handle(&self, event: &mut Event, ctx: &mut Context<'_>) -> HandlerResult;
}

/// Handler built from a closure over one payload type
pub struct FnHandler<E, F> {
    f: F,
    _event: PhantomData<fn(E)>,
}

impl<E, F> FnHandler<E, F>
where
    E: ServerEvent,
    F: Fn(&mut E, &mut Context<'_>) -> HandlerResult + Send + Sync + 'static,
{
    pub fn new(f: F) -> Self {
        Self {
            f,
            _event: PhantomData,
        }
    }
}

impl<E, F> Handler for FnHandler<E, F>
where
    E: ServerEvent,
    F: Fn(&mut E, &mut Context<'_>) -> HandlerResult + Send + Sync + 'static,
{
    fn handle(&self, event: &mut Event, ctx: &mut Context<'_>) -> HandlerResult {
        match E::from_event_mut(event) {
            Some(payload) => (self.f)(payload, ctx),
            None => Ok(()),
        }
    }
}

impl<E, F> fmt::Debug for FnHandler<E, F>
where
    E: ServerEvent,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnHandler").field("kind", &E::KIND).finish()
    }
}

/// Create a handler from a closure
pub fn from_fn<E, F>(f: F) -> FnHandler<E, F>
where
    E: ServerEvent,
    F: Fn(&mut E, &mut Context<'_>) -> HandlerResult + Send + Sync + 'static,
{
    FnHandler::new(f)
}

/// Execution unit a handler runs in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// The task that called `listen`
    Master,
    /// The worker supervisor
    Manager,
    /// Event worker with the given id
    Worker(usize),
    /// Task worker with the given id
    TaskWorker(usize),
}

/// What a handler can reach from where it runs
pub struct Context<'a> {
    role: Role,
    shared: &'a Shared,
    buses: Option<&'a Buses>,
    table: Option<&'a mut ConnectionTable>,
    tasks: Option<&'a mut TaskLedger>,
}

impl<'a> Context<'a> {
    pub(crate) fn master(shared: &'a Shared) -> Self {
        Self {
            role: Role::Master,
            shared,
            buses: None,
            table: None,
            tasks: None,
        }
    }

    pub(crate) fn manager(shared: &'a Shared, buses: &'a Buses) -> Self {
        Self {
            role: Role::Manager,
            shared,
            buses: Some(buses),
            table: None,
            tasks: None,
        }
    }

    pub(crate) fn worker(
        worker_id: usize,
        shared: &'a Shared,
        buses: &'a Buses,
        table: &'a mut ConnectionTable,
        tasks: &'a mut TaskLedger,
    ) -> Self {
        Self {
            role: Role::Worker(worker_id),
            shared,
            buses: Some(buses),
            table: Some(table),
            tasks: Some(tasks),
        }
    }

    pub(crate) fn task_worker(worker_id: usize, shared: &'a Shared, buses: &'a Buses) -> Self {
        Self {
            role: Role::TaskWorker(worker_id),
            shared,
            buses: Some(buses),
            table: None,
            tasks: None,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Id of the worker running the handler, event or task
    pub fn worker_id(&self) -> Option<usize> {
        match self.role {
            Role::Worker(id) | Role::TaskWorker(id) => Some(id),
            Role::Master | Role::Manager => None,
        }
    }

    pub fn is_task_worker(&self) -> bool {
        matches!(self.role, Role::TaskWorker(_))
    }

    pub fn config(&self) -> &ServerConfig {
        &self.shared.config
    }

    /// Handle for stopping or reloading the server
    pub fn server(&self) -> ServerHandle {
        self.shared.handle.clone()
    }

    fn table(&self) -> Result<&ConnectionTable, ConnectionError> {
        self.table.as_deref().ok_or(ConnectionError::NoConnectionTable)
    }

    fn table_mut(&mut self) -> Result<&mut ConnectionTable, ConnectionError> {
        self.table
            .as_deref_mut()
            .ok_or(ConnectionError::NoConnectionTable)
    }

    /// Connection owned by this worker
    pub fn connection(&self, id: ConnectionId) -> Option<&Connection> {
        self.table.as_deref().and_then(|table| table.get(id))
    }

    pub fn exists(&self, id: ConnectionId) -> bool {
        self.connection(id).is_some()
    }

    /// Ids of every connection owned by this worker
    pub fn connections(&self) -> Vec<ConnectionId> {
        self.table
            .as_deref()
            .map(ConnectionTable::ids)
            .unwrap_or_default()
    }

    /// Write raw bytes to a connection of this worker
    pub fn send(&mut self, id: ConnectionId, data: impl Into<Bytes>) -> Result<(), ServerError> {
        self.table_mut()?.send(id, data.into())?;
        Ok(())
    }

    /// Send a WebSocket message to an open WebSocket connection of this worker
    pub fn push(&mut self, id: ConnectionId, message: Message) -> Result<(), ServerError> {
        self.table_mut()?.push(id, &message)?;
        Ok(())
    }

    /// Close a connection once the current handler returns
    pub fn close(&mut self, id: ConnectionId) -> Result<(), ServerError> {
        self.table_mut()?.close(id, crate::event::CloseReason::Server)?;
        Ok(())
    }

    /// Deliver `payload` to every connection of this worker matching
    /// `predicate`. Open WebSocket connections get it as a binary message.
    /// Returns how many connections were written to.
    pub fn broadcast<P>(&mut self, predicate: P, payload: impl Into<Bytes>) -> Result<usize, ServerError>
    where
        P: Fn(&Connection) -> bool,
    {
        Ok(self.table_mut()?.broadcast(predicate, payload.into()))
    }

    /// Offload `data` to the task pool. The result comes back to this worker
    /// as a Finish event.
    pub fn task(&mut self, data: Value) -> Result<TaskId, ServerError> {
        let Role::Worker(worker_id) = self.role else {
            return Err(TaskError::NotAnEventWorker.into());
        };
        let reply = self.table()?.reply_sender().clone();
        let queue = self.shared.tasks.as_ref().ok_or(TaskError::NoTaskWorkers)?;
        let ledger = self.tasks.as_deref_mut().ok_or(TaskError::NotAnEventWorker)?;
        let task_id = queue.dispatch(worker_id, data, reply)?;
        ledger.register(task_id);
        Ok(task_id)
    }

    /// Send a PipeMessage event to another event worker
    pub fn send_message(&self, dst_worker_id: usize, message: Value) -> Result<(), ServerError> {
        let src_worker_id = self.worker_id().ok_or(WorkerError::NotFound(dst_worker_id))?;
        let target = self
            .shared
            .router
            .get(dst_worker_id)
            .ok_or(WorkerError::NotFound(dst_worker_id))?;
        target
            .send(WorkerInput::PipeMessage {
                src_worker_id,
                message,
            })
            .map_err(|_| WorkerError::NotFound(dst_worker_id))?;
        Ok(())
    }

    /// Remove a subscription from this worker's copy of the handlers
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.buses.map_or(false, |buses| buses.unsubscribe(id))
    }
}

impl fmt::Debug for Context<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("role", &self.role)
            .field("connections", &self.table.as_ref().map(|t| t.len()))
            .field("pending_tasks", &self.tasks.as_ref().map(|t| t.len()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{FinishEvent, ReceiveEvent, WorkerInfo};

    #[test]
    fn test_fn_handler_ignores_other_kinds() {
        let handler = from_fn(|_: &mut ReceiveEvent, _: &mut Context<'_>| Err(HandlerError::msg("called")));
        let worker = WorkerInfo {
            worker_id: 0,
            task_worker: false,
        };
        let mut event = FinishEvent::new(worker, 1, Value::Null).into_event();
        let shared = Shared::detached();
        let mut ctx = Context::master(&shared);
        assert!(handler.handle(&mut event, &mut ctx).is_ok());
    }

    #[test]
    fn test_master_context_has_no_connections() {
        let shared = Shared::detached();
        let mut ctx = Context::master(&shared);
        assert_eq!(ctx.worker_id(), None);
        assert!(ctx.connections().is_empty());
        let err = ctx.send(1, "x").unwrap_err();
        assert!(matches!(
            err,
            ServerError::Connection(ConnectionError::NoConnectionTable)
        ));
        let err = ctx.task(Value::Null).unwrap_err();
        assert!(matches!(err, ServerError::Task(TaskError::NotAnEventWorker)));
    }

    #[test]
    fn test_task_worker_cannot_dispatch() {
        let shared = Shared::detached();
        let buses = Buses::default();
        let mut ctx = Context::task_worker(3, &shared, &buses);
        assert!(ctx.is_task_worker());
        assert_eq!(ctx.worker_id(), Some(3));
        assert!(matches!(
            ctx.task(Value::Null),
            Err(ServerError::Task(TaskError::NotAnEventWorker))
        ));
        assert!(matches!(
            ctx.send_message(0, Value::Null),
            Err(ServerError::Worker(WorkerError::NotFound(0)))
        ));
    }
}
