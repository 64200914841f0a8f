//! Worker supervision
//!
//! The [`Supervisor`] starts event workers and task workers, routes accepted
//! connections to event workers, and reacts to their exits: abnormal exits
//! are published as WorkerError events and the worker is respawned when the
//! configured policy allows. It also carries out targeted stops, reloads and
//! the final shutdown of all workers.

use crate::bus::Buses;
use crate::config::DispatchMode;
use crate::connection::Incoming;
use crate::error::{logging, WorkerError};
use crate::event::{
    AfterReloadEvent, BeforeReloadEvent, Event, ManagerStartEvent, ManagerStopEvent, ServerEvent,
    WorkerErrorEvent, WorkerInfo,
};
use crate::handler::Context;
use crate::reactor::{Reactor, WorkerInput, WorkerSender};
use crate::server::Shared;
use crate::task::TaskPool;
use futures_util::FutureExt;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::io;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;

/// Reply channel for stop and reload requests
pub(crate) type Reply = oneshot::Sender<Result<(), WorkerError>>;

/// Exit status used for a worker that was terminated after its grace period
const TERMINATED: (i32, i32) = (0, 9);

/// Event worker senders by worker id
#[derive(Debug)]
pub(crate) struct Router {
    workers: RwLock<BTreeMap<usize, WorkerSender>>,
    next: AtomicUsize,
    mode: DispatchMode,
}

impl Router {
    pub(crate) fn new(mode: DispatchMode) -> Self {
        Self {
            workers: RwLock::new(BTreeMap::new()),
            next: AtomicUsize::new(0),
            mode,
        }
    }

    /// Choose the worker for a new connection or datagram
    pub(crate) fn pick(&self, key: u64) -> Option<WorkerSender> {
        let workers = self.workers.read().unwrap_or_else(PoisonError::into_inner);
        if workers.is_empty() {
            return None;
        }
        let index = match self.mode {
            DispatchMode::RoundRobin => self.next.fetch_add(1, Ordering::Relaxed) % workers.len(),
            DispatchMode::Modulo => (key % workers.len() as u64) as usize,
        };
        workers.values().nth(index).cloned()
    }

    pub(crate) fn get(&self, worker_id: usize) -> Option<WorkerSender> {
        self.workers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&worker_id)
            .cloned()
    }

    pub(crate) fn insert(&self, worker_id: usize, sender: WorkerSender) {
        self.workers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(worker_id, sender);
    }

    pub(crate) fn remove(&self, worker_id: usize) -> Option<WorkerSender> {
        self.workers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&worker_id)
    }

    /// Swap in a new set of workers, returning the old one
    pub(crate) fn replace(&self, workers: BTreeMap<usize, WorkerSender>) -> BTreeMap<usize, WorkerSender> {
        std::mem::replace(
            &mut *self.workers.write().unwrap_or_else(PoisonError::into_inner),
            workers,
        )
    }
}

/// Requests handled by the supervisor
#[derive(Debug)]
pub(crate) enum ControlMsg {
    /// Stop one event worker
    Stop {
        worker_id: usize,
        wait: bool,
        reply: Option<Reply>,
    },
    /// Stop every worker, then the task pool
    StopAll {
        wait: bool,
        reply: oneshot::Sender<()>,
    },
    Reload {
        reply: Option<Reply>,
    },
    /// Start a worker dedicated to one connection
    SpawnEphemeral(Incoming),
    GraceExpired {
        instance: u64,
    },
    ReloadGraceExpired {
        generation: u64,
    },
    TaskGraceExpired,
}

/// Sent by a worker when it exits
#[derive(Debug)]
pub(crate) struct ExitNotice {
    pub(crate) worker_id: usize,
    /// Identifies the spawn, so notices from replaced workers are ignored
    pub(crate) instance: u64,
    pub(crate) task_worker: bool,
    pub(crate) exit_code: i32,
    pub(crate) signal: i32,
}

#[derive(Debug)]
struct WorkerSlot {
    worker_id: usize,
    generation: u64,
    sender: WorkerSender,
    abort: AbortHandle,
    ephemeral: bool,
    stopping: bool,
    retiring: bool,
    waiters: Vec<Reply>,
}

#[derive(Debug)]
struct ReloadState {
    generation: u64,
    outstanding: HashSet<u64>,
    reply: Option<Reply>,
}

#[derive(Debug)]
struct ShutdownState {
    reply: Option<oneshot::Sender<()>>,
    tasks_closed: bool,
}

/// Owns every worker of a running server
pub(crate) struct Supervisor {
    shared: Arc<Shared>,
    buses: Buses,
    control_tx: mpsc::UnboundedSender<ControlMsg>,
    control: mpsc::UnboundedReceiver<ControlMsg>,
    exits_tx: mpsc::UnboundedSender<ExitNotice>,
    exits: mpsc::UnboundedReceiver<ExitNotice>,
    workers: HashMap<u64, WorkerSlot>,
    /// Live task worker instance by worker id
    task_workers: HashMap<usize, u64>,
    task_pool: Option<TaskPool>,
    worker_num: usize,
    generation: u64,
    next_instance: u64,
    next_ephemeral_id: usize,
    reload: Option<ReloadState>,
    shutdown: Option<ShutdownState>,
}

impl Supervisor {
    pub(crate) fn new(
        shared: Arc<Shared>,
        buses: Buses,
        control_tx: mpsc::UnboundedSender<ControlMsg>,
        control: mpsc::UnboundedReceiver<ControlMsg>,
        task_pool: Option<TaskPool>,
    ) -> Self {
        let (exits_tx, exits) = mpsc::unbounded_channel();
        let worker_num = shared.config.effective_worker_num();
        let next_ephemeral_id = worker_num + shared.config.task_worker_num;
        Self {
            shared,
            buses,
            control_tx,
            control,
            exits_tx,
            exits,
            workers: HashMap::new(),
            task_workers: HashMap::new(),
            task_pool,
            worker_num,
            generation: 0,
            next_instance: 0,
            next_ephemeral_id,
            reload: None,
            shutdown: None,
        }
    }

    fn publish(&self, event: &mut Event) {
        let mut ctx = Context::manager(&self.shared, &self.buses);
        if let Err(err) = self.buses.main().publish(event, &mut ctx) {
            crate::log_error!("{} handler failed: {}", event.kind(), err);
        }
    }

    /// Publish ManagerStart and start every worker.
    pub(crate) fn start(&mut self) -> io::Result<()> {
        self.publish(&mut ManagerStartEvent::new().into_event());

        let task_worker_num = self.shared.config.task_worker_num;
        for offset in 0..task_worker_num {
            self.spawn_task_worker(self.worker_num + offset)?;
        }
        for worker_id in 0..self.worker_num {
            let sender = self.spawn_worker(worker_id, false, None);
            self.shared.router.insert(worker_id, sender);
        }
        Ok(())
    }

    fn spawn_worker(&mut self, worker_id: usize, ephemeral: bool, first: Option<Incoming>) -> WorkerSender {
        let (sender, inbox) = mpsc::unbounded_channel();
        if let Some(incoming) = first {
            let _ = sender.send(WorkerInput::Accept(incoming));
        }
        let reactor = Reactor::new(
            worker_id,
            Arc::clone(&self.shared),
            self.buses.fork(),
            sender.clone(),
            inbox,
            ephemeral,
        );

        self.next_instance += 1;
        let instance = self.next_instance;
        let exits = self.exits_tx.clone();
        let task = tokio::spawn(async move {
            let (exit_code, signal) = match AssertUnwindSafe(reactor.run()).catch_unwind().await {
                Ok(Ok(())) => (0, 0),
                Ok(Err(_)) => (1, 0),
                Err(_) => (255, 6),
            };
            let _ = exits.send(ExitNotice {
                worker_id,
                instance,
                task_worker: false,
                exit_code,
                signal,
            });
        });

        self.workers.insert(
            instance,
            WorkerSlot {
                worker_id,
                generation: self.generation,
                sender: sender.clone(),
                abort: task.abort_handle(),
                ephemeral,
                stopping: false,
                retiring: false,
                waiters: Vec::new(),
            },
        );
        sender
    }

    fn spawn_task_worker(&mut self, worker_id: usize) -> io::Result<()> {
        self.next_instance += 1;
        let instance = self.next_instance;
        let Some(pool) = self.task_pool.as_ref() else {
            return Ok(());
        };
        pool.spawn(
            worker_id,
            instance,
            Arc::clone(&self.shared),
            self.buses.fork(),
            self.exits_tx.clone(),
        )?;
        self.task_workers.insert(worker_id, instance);
        Ok(())
    }

    /// Handle requests and exits until every worker is gone after a StopAll
    pub(crate) async fn run(mut self) {
        loop {
            tokio::select! {
                Some(msg) = self.control.recv() => self.on_control(msg),
                Some(exit) = self.exits.recv() => self.on_exit(exit),
                else => break,
            }
            if self.shutdown_complete() {
                break;
            }
        }

        self.publish(&mut ManagerStopEvent::new().into_event());
        if let Some(reply) = self.shutdown.as_mut().and_then(|s| s.reply.take()) {
            let _ = reply.send(());
        }
    }

    fn schedule(&self, delay: Duration, msg: ControlMsg) {
        let control = self.control_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = control.send(msg);
        });
    }

    fn on_control(&mut self, msg: ControlMsg) {
        match msg {
            ControlMsg::Stop {
                worker_id,
                wait,
                reply,
            } => self.stop_worker(worker_id, wait, reply),
            ControlMsg::StopAll { wait, reply } => self.stop_all(wait, reply),
            ControlMsg::Reload { reply } => self.begin_reload(reply),
            ControlMsg::SpawnEphemeral(incoming) => {
                if self.shutdown.is_some() {
                    return;
                }
                let worker_id = self.next_ephemeral_id;
                self.next_ephemeral_id += 1;
                let sender = self.spawn_worker(worker_id, true, Some(incoming));
                self.shared.router.insert(worker_id, sender);
            }
            ControlMsg::GraceExpired { instance } => self.terminate(instance),
            ControlMsg::ReloadGraceExpired { generation } => {
                let Some(reload) = self.reload.as_ref() else {
                    return;
                };
                if reload.generation != generation {
                    return;
                }
                let outstanding: Vec<u64> = reload.outstanding.iter().copied().collect();
                for instance in outstanding {
                    self.terminate(instance);
                }
                self.finish_reload();
            }
            ControlMsg::TaskGraceExpired => {
                if self.shutdown.is_none() {
                    return;
                }
                let grace = self.shared.config.stop_grace();
                for worker_id in self.task_workers.keys() {
                    logging::log_worker_terminated(*worker_id, grace);
                }
                // threads cannot be cancelled; they are detached
                self.task_workers.clear();
            }
        }
    }

    fn stop_worker(&mut self, worker_id: usize, wait: bool, reply: Option<Reply>) {
        let found = self
            .workers
            .iter_mut()
            .find(|(_, slot)| slot.worker_id == worker_id && !slot.retiring);
        let Some((&instance, slot)) = found else {
            if let Some(reply) = reply {
                let _ = reply.send(Err(WorkerError::NotFound(worker_id)));
            }
            return;
        };
        if let Some(reply) = reply {
            slot.waiters.push(reply);
        }
        if slot.stopping {
            return;
        }
        slot.stopping = true;
        let _ = slot.sender.send(WorkerInput::Stop);
        self.shared.router.remove(worker_id);
        if !wait {
            self.schedule(self.shared.config.stop_grace(), ControlMsg::GraceExpired { instance });
        }
    }

    fn stop_all(&mut self, wait: bool, reply: oneshot::Sender<()>) {
        self.shutdown = Some(ShutdownState {
            reply: Some(reply),
            tasks_closed: false,
        });
        self.shared.router.replace(BTreeMap::new());

        let grace = self.shared.config.stop_grace();
        let mut deadlines = Vec::new();
        for (instance, slot) in self.workers.iter_mut() {
            if !slot.stopping && !slot.retiring {
                slot.stopping = true;
                let _ = slot.sender.send(WorkerInput::Stop);
            }
            if !wait {
                deadlines.push(*instance);
            }
        }
        for instance in deadlines {
            self.schedule(grace, ControlMsg::GraceExpired { instance });
        }
    }

    fn begin_reload(&mut self, reply: Option<Reply>) {
        let refuse = if self.shutdown.is_some() {
            Some(WorkerError::NotRunning)
        } else if self.reload.is_some() {
            Some(WorkerError::ReloadInProgress)
        } else {
            None
        };
        if let Some(err) = refuse {
            if let Some(reply) = reply {
                let _ = reply.send(Err(err));
            }
            return;
        }

        self.publish(&mut BeforeReloadEvent::new().into_event());
        crate::log_info!("reloading {} event workers", self.worker_num);

        let retiring: Vec<(u64, usize, WorkerSender)> = self
            .workers
            .iter()
            .filter(|(_, slot)| !slot.ephemeral && !slot.stopping && !slot.retiring)
            .map(|(instance, slot)| (*instance, slot.worker_id, slot.sender.clone()))
            .collect();

        self.generation += 1;
        let mut fresh = BTreeMap::new();
        for worker_id in 0..self.worker_num {
            fresh.insert(worker_id, self.spawn_worker(worker_id, false, None));
        }
        self.shared.router.replace(fresh.clone());

        let mut outstanding = HashSet::new();
        for (instance, worker_id, sender) in retiring {
            let successor = fresh.get(&worker_id).or_else(|| fresh.values().next()).cloned();
            let input = match successor {
                Some(successor) => WorkerInput::Retire { successor },
                None => WorkerInput::Stop,
            };
            if let Some(slot) = self.workers.get_mut(&instance) {
                slot.retiring = true;
            }
            let _ = sender.send(input);
            outstanding.insert(instance);
        }

        self.reload = Some(ReloadState {
            generation: self.generation,
            outstanding,
            reply,
        });
        if self.reload.as_ref().map_or(true, |r| r.outstanding.is_empty()) {
            self.finish_reload();
        } else {
            self.schedule(
                self.shared.config.reload_grace(),
                ControlMsg::ReloadGraceExpired {
                    generation: self.generation,
                },
            );
        }
    }

    fn finish_reload(&mut self) {
        let Some(reload) = self.reload.take() else {
            return;
        };
        self.publish(&mut AfterReloadEvent::new().into_event());
        crate::log_info!("reload complete");
        if let Some(reply) = reload.reply {
            let _ = reply.send(Ok(()));
        }
    }

    /// Forcibly end a worker whose grace period ran out
    fn terminate(&mut self, instance: u64) {
        let Some(slot) = self.workers.get(&instance) else {
            return;
        };
        slot.abort.abort();
        let worker_id = slot.worker_id;
        logging::log_worker_terminated(worker_id, self.shared.config.stop_grace());
        let (exit_code, signal) = TERMINATED;
        self.on_exit(ExitNotice {
            worker_id,
            instance,
            task_worker: false,
            exit_code,
            signal,
        });
    }

    fn on_exit(&mut self, notice: ExitNotice) {
        let ExitNotice {
            worker_id,
            instance,
            task_worker,
            exit_code,
            signal,
        } = notice;

        if task_worker {
            if self.task_workers.get(&worker_id) != Some(&instance) {
                return;
            }
            self.task_workers.remove(&worker_id);
            logging::log_worker_exit(worker_id, exit_code, signal);
            if self.shutdown.is_some() {
                return;
            }
            if exit_code != 0 || signal != 0 {
                self.report_crash(worker_id, true, exit_code, signal);
            }
            if self.shared.config.respawn.should_respawn(exit_code, signal) {
                if let Err(e) = self.spawn_task_worker(worker_id) {
                    crate::log_error!("failed to respawn task worker {}: {}", worker_id, e);
                }
            }
            return;
        }

        let Some(slot) = self.workers.remove(&instance) else {
            return;
        };
        logging::log_worker_exit(worker_id, exit_code, signal);
        let terminated = (exit_code, signal) == TERMINATED;
        if (exit_code != 0 || signal != 0) && !terminated {
            self.report_crash(worker_id, false, exit_code, signal);
        }
        for waiter in slot.waiters {
            let _ = waiter.send(Ok(()));
        }

        if slot.retiring {
            let finished = match self.reload.as_mut() {
                Some(reload) => {
                    reload.outstanding.remove(&instance);
                    reload.outstanding.is_empty()
                }
                None => false,
            };
            if finished {
                self.finish_reload();
            }
            return;
        }
        if slot.ephemeral {
            self.shared.router.remove(worker_id);
            return;
        }
        if self.shutdown.is_some() || slot.generation != self.generation {
            return;
        }
        if self.shared.config.respawn.should_respawn(exit_code, signal) {
            let sender = self.spawn_worker(worker_id, false, None);
            self.shared.router.insert(worker_id, sender);
        } else {
            self.shared.router.remove(worker_id);
        }
    }

    fn report_crash(&self, worker_id: usize, task_worker: bool, exit_code: i32, signal: i32) {
        #[cfg(feature = "metrics")]
        metrics::counter!("gyre_worker_crashes_total").increment(1);

        let worker = WorkerInfo {
            worker_id,
            task_worker,
        };
        self.publish(&mut WorkerErrorEvent::new(worker, exit_code, signal).into_event());
    }

    /// True once a StopAll has seen every worker exit
    fn shutdown_complete(&mut self) -> bool {
        let Some(shutdown) = self.shutdown.as_mut() else {
            return false;
        };
        if !self.workers.is_empty() {
            return false;
        }
        if !shutdown.tasks_closed {
            shutdown.tasks_closed = true;
            if let Some(queue) = self.shared.tasks.as_ref() {
                queue.close();
            }
            if !self.task_workers.is_empty() {
                let control = self.control_tx.clone();
                let grace = self.shared.config.stop_grace();
                tokio::spawn(async move {
                    tokio::time::sleep(grace).await;
                    let _ = control.send(ControlMsg::TaskGraceExpired);
                });
            }
        }
        self.task_workers.is_empty()
    }
}
