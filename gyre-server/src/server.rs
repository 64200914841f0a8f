//! Server facade
//!
//! [`Server`] collects configuration and subscriptions, then `listen` binds
//! every listener, starts the supervisor and runs the accept loops until the
//! server is stopped through a [`ServerHandle`].

use crate::bus::{Buses, EventBus, SubscriptionId};
use crate::config::{ListenerConfig, ServerConfig, ServerMode, SockType};
use crate::connection::{ConnectionId, ConnectionPermit, Incoming};
use crate::error::{
    logging, ConfigError, ContextError, ErrorContext, Result, TransportError, WorkerError,
};
use crate::event::{BeforeShutdownEvent, Event, ServerEvent, ShutdownEvent, StartEvent};
use crate::handler::{Context, HandlerResult};
use crate::manager::{ControlMsg, Reply, Router, Supervisor};
use crate::reactor::WorkerInput;
use crate::task::{self, TaskQueue};
use bytes::Bytes;
use gyre_core::transport::{DatagramSocket, Listener, Transport};
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

/// Pause after a failed accept before trying again
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// Largest datagram read from a UDP listener
const MAX_DATAGRAM: usize = 65_535;

/// Attempts to hand an input to a live worker before dropping it
const ROUTE_ATTEMPTS: usize = 3;

/// A bound listener as seen by the workers
pub(crate) struct ListenerRuntime {
    pub(crate) config: ListenerConfig,
    pub(crate) local_addr: SocketAddr,
    pub(crate) datagram: Option<Arc<dyn DatagramSocket>>,
}

impl fmt::Debug for ListenerRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerRuntime")
            .field("config", &self.config)
            .field("local_addr", &self.local_addr)
            .finish()
    }
}

/// State shared by the acceptors, the supervisor and every worker
#[derive(Debug)]
pub(crate) struct Shared {
    pub(crate) config: ServerConfig,
    /// Main listener first, then sub-servers in registration order
    pub(crate) listeners: Vec<ListenerRuntime>,
    pub(crate) router: Router,
    pub(crate) tasks: Option<TaskQueue>,
    pub(crate) connection_ids: AtomicU64,
    pub(crate) live_connections: Arc<AtomicUsize>,
    pub(crate) control: mpsc::UnboundedSender<ControlMsg>,
    pub(crate) handle: ServerHandle,
}

impl Shared {
    pub(crate) fn listener(&self, index: usize) -> Option<&ListenerRuntime> {
        self.listeners.get(index)
    }

    fn next_connection_id(&self) -> ConnectionId {
        self.connection_ids.fetch_add(1, Ordering::Relaxed)
    }

    /// Shared state with no listeners and nothing running behind it
    #[cfg(test)]
    pub(crate) fn detached() -> Shared {
        let (control, _) = mpsc::unbounded_channel();
        let (requests, _) = mpsc::unbounded_channel();
        let (_, phase) = watch::channel(Phase::Idle);
        let config = ServerConfig::default();
        Shared {
            router: Router::new(config.dispatch_mode),
            config,
            listeners: Vec::new(),
            tasks: None,
            connection_ids: AtomicU64::new(1),
            live_connections: Arc::new(AtomicUsize::new(0)),
            control,
            handle: ServerHandle::new(requests, phase),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Phase {
    Idle,
    Running(Vec<SocketAddr>),
    Stopped,
}

#[derive(Debug)]
enum Request {
    /// Stop one worker, or the whole server when `worker_id` is `None`
    Stop {
        worker_id: Option<usize>,
        wait: bool,
        reply: Option<Reply>,
    },
    Reload {
        reply: Option<Reply>,
    },
}

#[derive(Debug)]
struct HandleInner {
    requests: mpsc::UnboundedSender<Request>,
    phase: watch::Receiver<Phase>,
}

/// Cloneable control surface of a server.
///
/// Available from [`Server::handle`] and, inside handlers, from
/// [`Context::server`]. The `request_*` methods do not wait and are safe to
/// call from handlers; the async methods wait for the outcome.
#[derive(Debug, Clone)]
pub struct ServerHandle {
    inner: Arc<HandleInner>,
}

impl ServerHandle {
    fn new(requests: mpsc::UnboundedSender<Request>, phase: watch::Receiver<Phase>) -> Self {
        Self {
            inner: Arc::new(HandleInner { requests, phase }),
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(*self.inner.phase.borrow(), Phase::Running(_))
    }

    /// Wait until the server is listening; returns the bound addresses,
    /// main listener first.
    pub async fn ready(&self) -> Result<Vec<SocketAddr>> {
        let mut phase = self.inner.phase.clone();
        let phase = phase
            .wait_for(|phase| *phase != Phase::Idle)
            .await
            .map_err(|_| WorkerError::NotRunning)?;
        match &*phase {
            Phase::Running(addrs) => Ok(addrs.clone()),
            _ => Err(WorkerError::NotRunning.into()),
        }
    }

    fn submit(&self, request: Request) -> Result<()> {
        if !self.is_running() {
            return Err(WorkerError::NotRunning.into());
        }
        self.inner
            .requests
            .send(request)
            .map_err(|_| WorkerError::NotRunning.into())
    }

    /// Stop one event worker, or the whole server when `worker_id` is
    /// `None`.
    ///
    /// With `wait` the stop lets in-flight work finish however long it
    /// takes; without it, workers still running after the stop grace period
    /// are terminated. Returns once the stop is complete.
    pub async fn stop(&self, worker_id: Option<usize>, wait: bool) -> Result<()> {
        let (reply, done) = oneshot::channel();
        self.submit(Request::Stop {
            worker_id,
            wait,
            reply: Some(reply),
        })?;
        done.await.map_err(|_| WorkerError::SupervisorGone)??;
        Ok(())
    }

    /// Ask the server to shut down without waiting for it
    pub fn request_stop(&self) -> Result<()> {
        self.submit(Request::Stop {
            worker_id: None,
            wait: true,
            reply: None,
        })
    }

    /// Ask one event worker to stop without waiting for it
    pub fn request_stop_worker(&self, worker_id: usize, wait: bool) -> Result<()> {
        self.submit(Request::Stop {
            worker_id: Some(worker_id),
            wait,
            reply: None,
        })
    }

    /// Replace every event worker and wait for the old ones to finish
    pub async fn reload(&self) -> Result<()> {
        let (reply, done) = oneshot::channel();
        self.submit(Request::Reload { reply: Some(reply) })?;
        done.await.map_err(|_| WorkerError::SupervisorGone)??;
        Ok(())
    }

    pub fn request_reload(&self) -> Result<()> {
        self.submit(Request::Reload { reply: None })
    }
}

/// Description of one listener, as reported by [`Server::servers_info`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerInfo {
    pub host: String,
    pub port: u16,
    pub sock_type: SockType,
    pub mode: ServerMode,
    /// False for the main server
    pub sub_server: bool,
    /// Bound address once listening
    pub local_addr: Option<SocketAddr>,
}

struct SubServerSetup {
    config: ListenerConfig,
    bus: EventBus,
}

struct Setup {
    config: ServerConfig,
    main: EventBus,
    sub_servers: Vec<SubServerSetup>,
    started: bool,
}

impl Setup {
    fn check_open(&self) -> Result<()> {
        if self.started {
            return Err(ConfigError::AlreadyStarted.into());
        }
        Ok(())
    }
}

struct ServerInner {
    setup: Mutex<Setup>,
    transport: Arc<dyn Transport>,
    handle: ServerHandle,
    requests: Mutex<Option<mpsc::UnboundedReceiver<Request>>>,
    phase: watch::Sender<Phase>,
}

impl ServerInner {
    fn setup(&self) -> MutexGuard<'_, Setup> {
        self.setup.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// An event-driven server.
///
/// Configure it and subscribe handlers, then call [`Server::listen`], which
/// runs until the server is stopped. Configuration and subscriptions are
/// frozen once `listen` has been called.
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let setup = self.inner.setup();
        f.debug_struct("Server")
            .field("config", &setup.config)
            .field("sub_servers", &setup.sub_servers.len())
            .field("started", &setup.started)
            .finish()
    }
}

impl Server {
    /// Create a server on the network transport
    pub fn new(config: ServerConfig) -> Result<Self> {
        #[cfg(feature = "net")]
        {
            Ok(Self::with_transport(
                config,
                Arc::new(gyre_transport_net::NetTransport::new()),
            ))
        }
        #[cfg(not(feature = "net"))]
        {
            let _ = config;
            Err(TransportError::Unavailable.into())
        }
    }

    /// Create a server that binds through `transport`
    pub fn with_transport(config: ServerConfig, transport: Arc<dyn Transport>) -> Self {
        let (requests_tx, requests) = mpsc::unbounded_channel();
        let (phase, phase_rx) = watch::channel(Phase::Idle);
        Self {
            inner: Arc::new(ServerInner {
                setup: Mutex::new(Setup {
                    config,
                    main: EventBus::new(),
                    sub_servers: Vec::new(),
                    started: false,
                }),
                transport,
                handle: ServerHandle::new(requests_tx, phase_rx),
                requests: Mutex::new(Some(requests)),
                phase,
            }),
        }
    }

    pub fn builder() -> ServerBuilder {
        ServerBuilder::new()
    }

    /// Merge a JSON object of options into the configuration
    pub fn configure(&self, options: &serde_json::Value) -> Result<()> {
        let mut setup = self.inner.setup();
        setup.check_open()?;
        setup.config.apply(options)?;
        Ok(())
    }

    /// Current configuration
    pub fn config(&self) -> ServerConfig {
        self.inner.setup().config.clone()
    }

    /// Subscribe a handler on the main server
    pub fn on<E, F>(&self, f: F) -> Result<SubscriptionId>
    where
        E: ServerEvent,
        F: Fn(&mut E, &mut Context<'_>) -> HandlerResult + Send + Sync + 'static,
    {
        let setup = self.inner.setup();
        setup.check_open()?;
        Ok(setup.main.subscribe(f))
    }

    /// Remove a subscription made before `listen`
    pub fn off(&self, id: SubscriptionId) -> Result<bool> {
        let setup = self.inner.setup();
        setup.check_open()?;
        let mut removed = setup.main.unsubscribe(id);
        for sub in &setup.sub_servers {
            removed |= sub.bus.unsubscribe(id);
        }
        Ok(removed)
    }

    /// Add a listener that shares the workers. Its connections use the
    /// sub-server's handlers, falling back to the main server's for kinds
    /// it does not handle.
    pub fn add_sub_server(&self, config: ListenerConfig) -> Result<SubServer> {
        let mut setup = self.inner.setup();
        setup.check_open()?;
        config.bind_addr()?;
        setup.sub_servers.push(SubServerSetup {
            config,
            bus: EventBus::new(),
        });
        Ok(SubServer {
            inner: Arc::clone(&self.inner),
            index: setup.sub_servers.len() - 1,
        })
    }

    /// Every listener, main server first
    pub fn servers_info(&self) -> Vec<ServerInfo> {
        let bound = match &*self.inner.phase.borrow() {
            Phase::Running(addrs) => addrs.clone(),
            _ => Vec::new(),
        };
        let setup = self.inner.setup();
        let main = ListenerConfig::new(setup.config.host.clone(), setup.config.port, setup.config.sock_type);
        std::iter::once(main)
            .chain(setup.sub_servers.iter().map(|sub| sub.config.clone()))
            .enumerate()
            .map(|(index, listener)| ServerInfo {
                host: listener.host,
                port: listener.port,
                sock_type: listener.sock_type,
                mode: setup.config.mode,
                sub_server: index > 0,
                local_addr: bound.get(index).copied(),
            })
            .collect()
    }

    pub fn handle(&self) -> ServerHandle {
        self.inner.handle.clone()
    }

    /// Stop the server, letting in-flight work finish
    pub async fn stop(&self) -> Result<()> {
        self.inner.handle.stop(None, true).await
    }

    /// Bind every listener and serve until stopped.
    ///
    /// Fails with [`ConfigError::AlreadyStarted`] when called twice. A bind
    /// failure ends the server; it cannot be listened on again.
    pub async fn listen(&self) -> Result<()> {
        let (config, buses, bindings) = {
            let mut setup = self.inner.setup();
            setup.check_open()?;
            setup.started = true;
            let buses = Buses::new(
                setup.main.fork(),
                setup.sub_servers.iter().map(|sub| sub.bus.fork()).collect(),
            );
            let main = ListenerConfig::new(setup.config.host.clone(), setup.config.port, setup.config.sock_type);
            let bindings: Vec<ListenerConfig> = std::iter::once(main)
                .chain(setup.sub_servers.iter().map(|sub| sub.config.clone()))
                .collect();
            (setup.config.clone(), buses, bindings)
        };
        let requests = self
            .inner
            .requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(ConfigError::AlreadyStarted)?;

        match self.serve(config, buses, bindings, requests).await {
            Ok(()) => Ok(()),
            Err(err) => {
                self.inner.phase.send_replace(Phase::Stopped);
                Err(err)
            }
        }
    }

    async fn serve(
        &self,
        config: ServerConfig,
        buses: Buses,
        bindings: Vec<ListenerConfig>,
        mut requests: mpsc::UnboundedReceiver<Request>,
    ) -> Result<()> {
        config.validate()?;
        if config.mode == ServerMode::PerConnection && bindings.iter().any(|s| !s.sock_type.is_stream()) {
            return Err(ConfigError::InvalidValue {
                field: "sock_type".to_string(),
                reason: "udp listeners need persistent workers".to_string(),
            }
            .into());
        }

        let mut runtimes = Vec::with_capacity(bindings.len());
        let mut streams = Vec::new();
        for (index, binding) in bindings.into_iter().enumerate() {
            let addr = binding.bind_addr()?;
            if binding.sock_type.is_stream() {
                let listener = self
                    .inner
                    .transport
                    .bind_stream(addr)
                    .await
                    .map_err(|source| TransportError::BindFailed { addr, source })?;
                let local_addr = listener.local_addr()?;
                runtimes.push(ListenerRuntime {
                    config: binding,
                    local_addr,
                    datagram: None,
                });
                streams.push((index, local_addr, listener));
            } else {
                let socket: Arc<dyn DatagramSocket> = Arc::from(
                    self.inner
                        .transport
                        .bind_datagram(addr)
                        .await
                        .map_err(|source| TransportError::BindFailed { addr, source })?,
                );
                let local_addr = socket.local_addr()?;
                runtimes.push(ListenerRuntime {
                    config: binding,
                    local_addr,
                    datagram: Some(socket),
                });
            }
        }
        let addrs: Vec<SocketAddr> = runtimes.iter().map(|l| l.local_addr).collect();

        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (tasks, pool) = if config.task_worker_num > 0 {
            let (queue, pool) = task::channel(config.task_queue_capacity);
            (Some(queue), Some(pool))
        } else {
            (None, None)
        };
        let shared = Arc::new(Shared {
            router: Router::new(config.dispatch_mode),
            config,
            listeners: runtimes,
            tasks,
            connection_ids: AtomicU64::new(1),
            live_connections: Arc::new(AtomicUsize::new(0)),
            control: control_tx.clone(),
            handle: self.inner.handle.clone(),
        });

        publish(&shared, &buses, &mut StartEvent::new(addrs.clone()).into_event());

        let mut supervisor = Supervisor::new(Arc::clone(&shared), buses.fork(), control_tx, control_rx, pool);
        if let Err(err) = supervisor.start() {
            if let Some(queue) = shared.tasks.as_ref() {
                queue.close();
            }
            return Err(err.into());
        }
        let supervisor = tokio::spawn(supervisor.run());

        let mut loops: Vec<JoinHandle<()>> = Vec::new();
        for (index, local_addr, listener) in streams {
            loops.push(tokio::spawn(accept_loop(index, local_addr, listener, Arc::clone(&shared))));
        }
        for (index, runtime) in shared.listeners.iter().enumerate() {
            if let Some(socket) = runtime.datagram.clone() {
                loops.push(tokio::spawn(datagram_loop(index, socket, Arc::clone(&shared))));
            }
        }
        let signals = shared
            .config
            .handle_signals
            .then(|| crate::signals::install(self.inner.handle.clone()));

        logging::log_server_start(
            &addrs,
            shared.config.effective_worker_num(),
            shared.config.task_worker_num,
        );
        self.inner.phase.send_replace(Phase::Running(addrs));

        let (wait, reply) = loop {
            match requests.recv().await {
                Some(Request::Stop {
                    worker_id: Some(worker_id),
                    wait,
                    reply,
                }) => {
                    let _ = shared.control.send(ControlMsg::Stop {
                        worker_id,
                        wait,
                        reply,
                    });
                }
                Some(Request::Reload { reply }) => {
                    let _ = shared.control.send(ControlMsg::Reload { reply });
                }
                Some(Request::Stop {
                    worker_id: None,
                    wait,
                    reply,
                }) => break (wait, reply),
                None => break (true, None),
            }
        };

        publish(&shared, &buses, &mut BeforeShutdownEvent::new().into_event());
        for task in loops.iter().chain(signals.iter()) {
            task.abort();
        }
        let (stopped, all_stopped) = oneshot::channel();
        if shared
            .control
            .send(ControlMsg::StopAll {
                wait,
                reply: stopped,
            })
            .is_ok()
        {
            let _ = all_stopped.await;
        }
        if let Err(err) = supervisor.await {
            crate::log_error!("supervisor ended abnormally: {}", err);
        }
        publish(&shared, &buses, &mut ShutdownEvent::new().into_event());

        self.inner.phase.send_replace(Phase::Stopped);
        // leftover requests get a definite answer
        requests.close();
        while let Ok(request) = requests.try_recv() {
            let reply = match request {
                Request::Stop { reply, .. } | Request::Reload { reply } => reply,
            };
            if let Some(reply) = reply {
                let _ = reply.send(Err(WorkerError::NotRunning));
            }
        }
        logging::log_server_shutdown();
        if let Some(reply) = reply {
            let _ = reply.send(Ok(()));
        }
        Ok(())
    }
}

fn publish(shared: &Shared, buses: &Buses, event: &mut Event) {
    let mut ctx = Context::master(shared);
    if let Err(err) = buses.main().publish(event, &mut ctx) {
        logging::log_error(&ContextError::new(err, ErrorContext::new().with_event(event.kind())));
    }
}

/// Hand `input` to a live event worker, retrying if the picked worker has
/// just exited. Retries under modulo dispatch move on to the next worker.
/// Gives the input back when no worker takes it.
fn route(shared: &Shared, key: u64, mut input: WorkerInput) -> std::result::Result<(), WorkerInput> {
    for attempt in 0..ROUTE_ATTEMPTS {
        let Some(worker) = shared.router.pick(key.wrapping_add(attempt as u64)) else {
            break;
        };
        match worker.send(input) {
            Ok(()) => return Ok(()),
            Err(mpsc::error::SendError(returned)) => input = returned,
        }
    }
    Err(input)
}

async fn accept_loop(index: usize, local_addr: SocketAddr, listener: Box<dyn Listener>, shared: Arc<Shared>) {
    let max = shared.config.max_connections;
    loop {
        let (stream, remote_addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(source) => {
                logging::log_error(&ContextError::new(
                    TransportError::AcceptFailed {
                        addr: local_addr,
                        source,
                    },
                    ErrorContext::new(),
                ));
                tokio::time::sleep(ACCEPT_BACKOFF).await;
                continue;
            }
        };

        let permit = match ConnectionPermit::acquire(&shared.live_connections, max) {
            Ok(permit) => permit,
            Err(err) => {
                logging::log_warning(
                    &format!("refusing connection: {err}"),
                    &ErrorContext::new().with_remote_addr(remote_addr),
                );
                #[cfg(feature = "metrics")]
                metrics::counter!("gyre_connections_refused_total").increment(1);
                continue;
            }
        };

        let id = shared.next_connection_id();
        let incoming = Incoming {
            id,
            stream,
            remote_addr,
            listener: index,
            permit,
        };
        if shared.config.mode == ServerMode::PerConnection {
            if shared.control.send(ControlMsg::SpawnEphemeral(incoming)).is_err() {
                break;
            }
            continue;
        }
        if route(&shared, id, WorkerInput::Accept(incoming)).is_err() {
            crate::log_warn!("no event worker for connection {} from {}", id, remote_addr);
        }
    }
}

async fn datagram_loop(index: usize, socket: Arc<dyn DatagramSocket>, shared: Arc<Shared>) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        match socket.recv_from(&mut buf).await {
            Ok((len, client)) => {
                let input = WorkerInput::Packet {
                    listener: index,
                    client,
                    data: Bytes::copy_from_slice(&buf[..len]),
                };
                // one client keeps its worker under modulo dispatch
                if route(&shared, u64::from(client.port()), input).is_err() {
                    crate::log_debug!("dropped datagram from {}: no event worker", client);
                }
            }
            Err(err) => {
                crate::log_error!("receive failed on listener {}: {}", index, err);
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }
}

/// Handle for subscribing handlers to one sub-server
#[derive(Clone)]
pub struct SubServer {
    inner: Arc<ServerInner>,
    index: usize,
}

impl fmt::Debug for SubServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubServer").field("index", &self.index).finish()
    }
}

impl SubServer {
    /// Subscribe a handler for connections on this listener
    pub fn on<E, F>(&self, f: F) -> Result<SubscriptionId>
    where
        E: ServerEvent,
        F: Fn(&mut E, &mut Context<'_>) -> HandlerResult + Send + Sync + 'static,
    {
        let setup = self.inner.setup();
        setup.check_open()?;
        let sub = setup
            .sub_servers
            .get(self.index)
            .ok_or_else(|| ConfigError::UnknownOption(format!("sub-server {}", self.index)))?;
        Ok(sub.bus.subscribe(f))
    }

    pub fn config(&self) -> Option<ListenerConfig> {
        self.inner
            .setup()
            .sub_servers
            .get(self.index)
            .map(|sub| sub.config.clone())
    }

    /// Bound address once the server is listening
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match &*self.inner.phase.borrow() {
            Phase::Running(addrs) => addrs.get(self.index + 1).copied(),
            _ => None,
        }
    }
}

/// Server builder
#[derive(Clone)]
pub struct ServerBuilder {
    config: ServerConfig,
    transport: Option<Arc<dyn Transport>>,
}

impl fmt::Debug for ServerBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerBuilder")
            .field("config", &self.config)
            .field("custom_transport", &self.transport.is_some())
            .finish()
    }
}

impl ServerBuilder {
    pub fn new() -> Self {
        Self {
            config: ServerConfig::default(),
            transport: None,
        }
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.config.host = host.into();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    pub fn mode(mut self, mode: ServerMode) -> Self {
        self.config.mode = mode;
        self
    }

    pub fn sock_type(mut self, sock_type: SockType) -> Self {
        self.config.sock_type = sock_type;
        self
    }

    pub fn worker_num(mut self, n: usize) -> Self {
        self.config.worker_num = n;
        self
    }

    pub fn task_worker_num(mut self, n: usize) -> Self {
        self.config.task_worker_num = n;
        self
    }

    pub fn max_connections(mut self, max: usize) -> Self {
        self.config.max_connections = max;
        self
    }

    pub fn max_frame_size(mut self, size: usize) -> Self {
        self.config.max_frame_size = size;
        self
    }

    pub fn max_message_size(mut self, size: usize) -> Self {
        self.config.max_message_size = size;
        self
    }

    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.config.handshake_timeout_ms = crate::config::millis(timeout);
        self
    }

    pub fn stop_grace(mut self, grace: Duration) -> Self {
        self.config.stop_grace_ms = crate::config::millis(grace);
        self
    }

    pub fn reload_grace(mut self, grace: Duration) -> Self {
        self.config.reload_grace_ms = crate::config::millis(grace);
        self
    }

    pub fn respawn(mut self, policy: crate::config::RespawnPolicy) -> Self {
        self.config.respawn = policy;
        self
    }

    pub fn dispatch_mode(mut self, mode: crate::config::DispatchMode) -> Self {
        self.config.dispatch_mode = mode;
        self
    }

    pub fn task_queue_capacity(mut self, capacity: usize) -> Self {
        self.config.task_queue_capacity = capacity;
        self
    }

    pub fn handle_signals(mut self, enabled: bool) -> Self {
        self.config.handle_signals = enabled;
        self
    }

    /// Bind through `transport` instead of the network
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Build the server
    pub fn build(self) -> Result<Server> {
        self.config.validate()?;
        match self.transport {
            Some(transport) => Ok(Server::with_transport(self.config, transport)),
            None => Server::new(self.config),
        }
    }
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}
