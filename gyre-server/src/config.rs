//! Server configuration
//!
//! [`ServerConfig`] is a flat set of named options. It can be built in code,
//! through [`crate::ServerBuilder`], or merged from a JSON object with
//! [`ServerConfig::apply`]; the latter is what `Server::configure` uses.

use crate::error::ConfigError;
use gyre_core::protocol::constants;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

/// How connections are spread over execution units
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerMode {
    /// One event worker handles every connection cooperatively
    Base,
    /// `worker_num` event workers share the listeners
    Process,
    /// A dedicated worker is spawned for each accepted connection
    PerConnection,
}

/// Framing for a listener
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SockType {
    /// Raw TCP; handlers receive bytes as they arrive
    Tcp,
    /// UDP; handlers receive one packet per datagram
    Udp,
    /// TCP with an HTTP/1.1 upgrade to RFC 6455 framing
    #[serde(rename = "websocket")]
    WebSocket,
}

impl SockType {
    /// Stream listeners accept connections; UDP does not
    pub fn is_stream(&self) -> bool {
        !matches!(self, SockType::Udp)
    }
}

/// What the supervisor does when a worker exits on its own
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RespawnPolicy {
    /// Replace every worker that exits
    Always,
    /// Replace workers that exit with a non-zero code or by signal
    OnFailure,
    /// Never replace workers
    Never,
}

impl RespawnPolicy {
    /// Whether a worker that exited with `exit_code`/`signal` is replaced
    pub fn should_respawn(&self, exit_code: i32, signal: i32) -> bool {
        match self {
            RespawnPolicy::Always => true,
            RespawnPolicy::OnFailure => exit_code != 0 || signal != 0,
            RespawnPolicy::Never => false,
        }
    }
}

/// How accepted connections are assigned to event workers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchMode {
    /// Rotate through live workers
    RoundRobin,
    /// Connection id modulo the number of live workers
    Modulo,
}

/// Server configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    /// Bind host, an IP literal or `localhost`
    pub host: String,
    /// Bind port, 0 for an ephemeral port
    pub port: u16,
    /// Execution model
    pub mode: ServerMode,
    /// Framing of the main listener
    pub sock_type: SockType,
    /// Event workers; 0 means one per CPU
    pub worker_num: usize,
    /// Task workers; 0 disables task dispatch
    pub task_worker_num: usize,
    /// Live connections across all workers
    pub max_connections: usize,
    /// Largest accepted WebSocket frame payload
    pub max_frame_size: usize,
    /// Largest reassembled WebSocket message
    pub max_message_size: usize,
    /// Time a client gets to finish the WebSocket upgrade
    pub handshake_timeout_ms: u64,
    /// Bound on `stop` without waiting
    pub stop_grace_ms: u64,
    /// Bound on old workers during reload
    pub reload_grace_ms: u64,
    /// Worker replacement policy
    pub respawn: RespawnPolicy,
    /// Connection distribution
    pub dispatch_mode: DispatchMode,
    /// Read buffer per connection
    pub read_buffer_size: usize,
    /// Queued tasks before `task` starts failing
    pub task_queue_capacity: usize,
    /// Map SIGTERM/SIGINT to stop and SIGUSR1 to reload
    pub handle_signals: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 9501,
            mode: ServerMode::Process,
            sock_type: SockType::Tcp,
            worker_num: 0,
            task_worker_num: 0,
            max_connections: 10_000,
            max_frame_size: constants::DEFAULT_MAX_FRAME_SIZE,
            max_message_size: constants::DEFAULT_MAX_MESSAGE_SIZE,
            handshake_timeout_ms: millis(constants::DEFAULT_HANDSHAKE_TIMEOUT),
            stop_grace_ms: 3_000,
            reload_grace_ms: 3_000,
            respawn: RespawnPolicy::Always,
            dispatch_mode: DispatchMode::RoundRobin,
            read_buffer_size: 8 * 1024,
            task_queue_capacity: 1024,
            handle_signals: false,
        }
    }
}

impl ServerConfig {
    /// Merge a flat JSON object of option names to values into this config.
    ///
    /// Unknown names and ill-typed values are rejected and leave `self`
    /// untouched. The merged result is validated.
    pub fn apply(&mut self, options: &serde_json::Value) -> Result<(), ConfigError> {
        let options = options.as_object().ok_or(ConfigError::NotAnObject)?;

        let mut merged = serde_json::to_value(&*self)
            .map_err(|e| ConfigError::Serialization(e.to_string()))?;
        let fields = merged
            .as_object_mut()
            .ok_or(ConfigError::NotAnObject)?;

        for (name, value) in options {
            if !fields.contains_key(name) {
                return Err(ConfigError::UnknownOption(name.clone()));
            }
            fields.insert(name.clone(), value.clone());
        }

        let candidate: ServerConfig = serde_json::from_value(merged)
            .map_err(|e| ConfigError::InvalidValue {
                field: "options".to_string(),
                reason: e.to_string(),
            })?;
        candidate.validate()?;
        *self = candidate;
        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        resolve_addr(&self.host, self.port)?;

        if self.max_connections == 0 {
            return Err(invalid("max_connections", "must be greater than 0"));
        }
        if self.max_frame_size == 0 {
            return Err(invalid("max_frame_size", "must be greater than 0"));
        }
        if self.max_message_size < self.max_frame_size {
            return Err(invalid(
                "max_message_size",
                "must be greater than or equal to max_frame_size",
            ));
        }
        if self.read_buffer_size == 0 {
            return Err(invalid("read_buffer_size", "must be greater than 0"));
        }
        if self.handshake_timeout_ms == 0 {
            return Err(invalid("handshake_timeout_ms", "must be greater than 0"));
        }
        if self.task_worker_num > 0 && self.task_queue_capacity == 0 {
            return Err(invalid(
                "task_queue_capacity",
                "must be greater than 0 when task workers are enabled",
            ));
        }
        if self.mode == ServerMode::Base && self.worker_num > 1 {
            return Err(invalid("worker_num", "base mode runs exactly one event worker"));
        }
        if self.mode == ServerMode::PerConnection && self.sock_type == SockType::Udp {
            return Err(invalid("sock_type", "udp has no connections to give a worker each"));
        }

        Ok(())
    }

    /// Address of the main listener
    pub fn bind_addr(&self) -> Result<SocketAddr, ConfigError> {
        resolve_addr(&self.host, self.port)
    }

    /// Number of persistent event workers the supervisor keeps alive
    pub fn effective_worker_num(&self) -> usize {
        match self.mode {
            ServerMode::Base => 1,
            ServerMode::PerConnection => 0,
            ServerMode::Process if self.worker_num == 0 => num_cpus::get().max(1),
            ServerMode::Process => self.worker_num,
        }
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    pub fn reload_grace(&self) -> Duration {
        Duration::from_millis(self.reload_grace_ms)
    }
}

/// Whole milliseconds in `duration`, saturating at `u64::MAX`
pub(crate) fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Binding of one additional listener
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenerConfig {
    pub host: String,
    pub port: u16,
    pub sock_type: SockType,
}

impl ListenerConfig {
    pub fn new(host: impl Into<String>, port: u16, sock_type: SockType) -> Self {
        Self {
            host: host.into(),
            port,
            sock_type,
        }
    }

    pub fn bind_addr(&self) -> Result<SocketAddr, ConfigError> {
        resolve_addr(&self.host, self.port)
    }
}

fn resolve_addr(host: &str, port: u16) -> Result<SocketAddr, ConfigError> {
    let ip = if host.eq_ignore_ascii_case("localhost") {
        IpAddr::V4(Ipv4Addr::LOCALHOST)
    } else {
        host.parse::<IpAddr>()
            .map_err(|_| invalid("host", &format!("{host:?} is not an IP address")))?
    };
    Ok(SocketAddr::new(ip, port))
}

fn invalid(field: &str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        reason: reason.to_string(),
    }
}
