//! Task offloading
//!
//! Event workers hand work to a pool of task workers through a bounded queue.
//! Task workers are OS threads so blocking work never stalls a reactor. Every
//! envelope carries the sender of the worker that dispatched it and the
//! result goes back only there; if that worker is gone the result is dropped
//! and logged.

use crate::bus::Buses;
use crate::error::{logging, ContextError, ErrorContext, HandlerError, TaskError};
use crate::event::{EventKind, ServerEvent, TaskEvent, WorkerInfo, WorkerStartEvent, WorkerStopEvent};
use crate::handler::Context;
use crate::manager::ExitNotice;
use crate::reactor::{WorkerInput, WorkerSender};
use crate::server::Shared;
use serde_json::Value;
use std::collections::HashSet;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc::UnboundedSender;

/// Server-wide task identifier
pub type TaskId = u64;

/// A unit of offloaded work in flight
pub(crate) struct TaskEnvelope {
    pub(crate) task_id: TaskId,
    pub(crate) src_worker_id: usize,
    pub(crate) data: Value,
    pub(crate) reply: WorkerSender,
}

/// Tasks an event worker dispatched and has not seen finish.
///
/// Completion is accepted once per id; a repeated or unknown completion is
/// rejected so each task produces at most one Finish event.
#[derive(Debug, Default)]
pub struct TaskLedger {
    pending: HashSet<TaskId>,
}

impl TaskLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn register(&mut self, task_id: TaskId) {
        self.pending.insert(task_id);
    }

    /// Returns true the first time a pending task completes
    pub(crate) fn complete(&mut self, task_id: TaskId) -> bool {
        self.pending.remove(&task_id)
    }

    pub fn is_pending(&self, task_id: TaskId) -> bool {
        self.pending.contains(&task_id)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Dispatch side of the task pool
#[derive(Debug)]
pub(crate) struct TaskQueue {
    sender: Mutex<Option<SyncSender<TaskEnvelope>>>,
    capacity: usize,
    next_id: AtomicU64,
}

impl TaskQueue {
    /// Queue `data` without blocking. Fails when the queue is full or closed.
    pub(crate) fn dispatch(
        &self,
        src_worker_id: usize,
        data: Value,
        reply: WorkerSender,
    ) -> Result<TaskId, TaskError> {
        let guard = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
        let sender = guard.as_ref().ok_or(TaskError::PoolClosed)?;
        let task_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        sender
            .try_send(TaskEnvelope {
                task_id,
                src_worker_id,
                data,
                reply,
            })
            .map_err(|e| match e {
                TrySendError::Full(_) => TaskError::QueueFull {
                    capacity: self.capacity,
                },
                TrySendError::Disconnected(_) => TaskError::PoolClosed,
            })?;

        #[cfg(feature = "metrics")]
        metrics::counter!("gyre_tasks_dispatched_total").increment(1);

        Ok(task_id)
    }

    /// Stop accepting tasks. Workers exit once the queue is drained.
    pub(crate) fn close(&self) {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

/// Worker side of the task pool
#[derive(Debug, Clone)]
pub(crate) struct TaskPool {
    receiver: Arc<Mutex<Receiver<TaskEnvelope>>>,
}

/// Create a connected queue and pool
pub(crate) fn channel(capacity: usize) -> (TaskQueue, TaskPool) {
    let (sender, receiver) = mpsc::sync_channel(capacity);
    (
        TaskQueue {
            sender: Mutex::new(Some(sender)),
            capacity,
            next_id: AtomicU64::new(1),
        },
        TaskPool {
            receiver: Arc::new(Mutex::new(receiver)),
        },
    )
}

impl TaskPool {
    /// Start a task worker thread. Its exit is reported on `exits`.
    pub(crate) fn spawn(
        &self,
        worker_id: usize,
        instance: u64,
        shared: Arc<Shared>,
        buses: Buses,
        exits: UnboundedSender<ExitNotice>,
    ) -> io::Result<()> {
        let receiver = Arc::clone(&self.receiver);
        std::thread::Builder::new()
            .name(format!("gyre-task-{worker_id}"))
            .spawn(move || {
                let (exit_code, signal) = run_task_worker(worker_id, &shared, &buses, &receiver);
                let _ = exits.send(ExitNotice {
                    worker_id,
                    instance,
                    task_worker: true,
                    exit_code,
                    signal,
                });
            })?;
        Ok(())
    }
}

fn run_task_worker(
    worker_id: usize,
    shared: &Shared,
    buses: &Buses,
    receiver: &Mutex<Receiver<TaskEnvelope>>,
) -> (i32, i32) {
    let worker = WorkerInfo {
        worker_id,
        task_worker: true,
    };
    let publish = |event: &mut crate::event::Event| {
        let mut ctx = Context::task_worker(worker_id, shared, buses);
        buses.main().publish(event, &mut ctx)
    };

    logging::log_worker_started(worker_id, true);
    if let Err(err) = publish(&mut WorkerStartEvent::new(worker).into_event()) {
        if let Some(exit) = exit_status(worker_id, EventKind::WorkerStart, err) {
            return exit;
        }
    }

    loop {
        let next = receiver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .recv();
        let Ok(envelope) = next else {
            break;
        };
        let TaskEnvelope {
            task_id,
            src_worker_id,
            data,
            reply,
        } = envelope;

        let mut event = TaskEvent::new(worker, task_id, src_worker_id, data).into_event();
        let outcome = publish(&mut event);
        let result = TaskEvent::from_event_mut(&mut event).and_then(TaskEvent::take_result);
        deliver(task_id, src_worker_id, result, &reply);

        if let Err(err) = outcome {
            if let Some(exit) = exit_status(worker_id, EventKind::Task, err) {
                return exit;
            }
        }
    }

    if let Err(err) = publish(&mut WorkerStopEvent::new(worker).into_event()) {
        if let Some(exit) = exit_status(worker_id, EventKind::WorkerStop, err) {
            return exit;
        }
    }
    (0, 0)
}

/// Log a handler failure; returns the exit status if it ends the worker
fn exit_status(worker_id: usize, kind: EventKind, err: HandlerError) -> Option<(i32, i32)> {
    let exit = match &err {
        HandlerError::Panicked(_) => Some((255, 6)),
        HandlerError::Fatal(_) => Some((1, 0)),
        _ => None,
    };
    logging::log_error(&ContextError::new(
        err,
        ErrorContext::new().with_event(kind).with_worker_id(worker_id),
    ));
    exit
}

/// Send a task's outcome back to the worker that dispatched it
fn deliver(task_id: TaskId, src_worker_id: usize, data: Option<Value>, reply: &WorkerSender) {
    if reply
        .send(WorkerInput::TaskFinished { task_id, data })
        .is_err()
    {
        logging::log_task_delivery_miss(task_id, src_worker_id);

        #[cfg(feature = "metrics")]
        metrics::counter!("gyre_task_delivery_misses_total").increment(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::unbounded_channel;

    #[test]
    fn test_ledger_completes_once() {
        let mut ledger = TaskLedger::new();
        ledger.register(4);
        assert!(ledger.is_pending(4));
        assert!(ledger.complete(4));
        assert!(!ledger.complete(4));
        assert!(!ledger.complete(5));
        assert!(ledger.is_empty());
    }

    #[test]
    fn test_queue_full_and_closed() {
        let (queue, _pool) = channel(1);
        let (reply, _rx) = unbounded_channel();
        let first = queue.dispatch(0, Value::Null, reply.clone()).unwrap();
        assert_eq!(first, 1);
        assert_eq!(
            queue.dispatch(0, Value::Null, reply.clone()),
            Err(TaskError::QueueFull { capacity: 1 })
        );
        queue.close();
        assert_eq!(queue.dispatch(0, Value::Null, reply), Err(TaskError::PoolClosed));
    }

    #[cfg_attr(feature = "logging", tracing_test::traced_test)]
    #[test]
    fn test_delivery_to_dropped_worker_is_a_miss() {
        let (reply, rx) = unbounded_channel();
        drop(rx);
        deliver(1, 0, Some(Value::Bool(true)), &reply);
        #[cfg(feature = "logging")]
        assert!(logs_contain("originating worker is gone"));
    }

    #[test]
    fn test_delivery_reaches_origin() {
        let (reply, mut rx) = unbounded_channel();
        deliver(9, 2, Some(serde_json::json!({"ok": 1})), &reply);
        match rx.try_recv() {
            Ok(WorkerInput::TaskFinished { task_id, data }) => {
                assert_eq!(task_id, 9);
                assert_eq!(data, Some(serde_json::json!({"ok": 1})));
            }
            other => panic!("unexpected input: {:?}", other.map(|_| ())),
        }
    }
}
