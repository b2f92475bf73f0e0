//! Centralized default values for proxy servers.

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;
use tracing::warn;

/// Centralized default values for proxy servers.
///
/// Anything a [`ServerSpec`](super::ServerSpec) leaves unset falls back to
/// these, and the timing knobs that are not per-server live only here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyDefaults {
    /// How long a graceful `stop` waits for connections to end on their own.
    pub drain_timeout: Duration,

    /// Interval between connection-count checks while draining.
    pub drain_poll_interval: Duration,

    /// Bound on waiting for the accept loop to exit during `stop`.
    pub accept_join_timeout: Duration,

    /// How long to wait for a killed subprocess to be reaped.
    pub kill_wait: Duration,

    /// Listen backlog for TCP and WebSocket listeners.
    pub listen_backlog: u32,

    /// Read buffer size of each byte pump.
    pub pump_buffer_size: usize,

    /// Bind address when a server does not name one.
    pub listen_interface: IpAddr,
}

impl Default for ProxyDefaults {
    fn default() -> Self {
        Self {
            drain_timeout: Duration::from_secs(30),
            drain_poll_interval: Duration::from_millis(100),
            accept_join_timeout: Duration::from_secs(5),
            kill_wait: Duration::from_secs(2),
            listen_backlog: 128,
            pump_buffer_size: 4096,
            listen_interface: IpAddr::V4(Ipv4Addr::LOCALHOST),
        }
    }
}

impl ProxyDefaults {
    /// Create defaults from environment variables.
    ///
    /// # Environment Variables
    /// - `SHELLGATE_DRAIN_TIMEOUT_SECS`
    /// - `SHELLGATE_DRAIN_POLL_MS`
    /// - `SHELLGATE_KILL_WAIT_MS`
    /// - `SHELLGATE_LISTEN_BACKLOG`
    /// - `SHELLGATE_PUMP_BUFFER_BYTES`
    pub fn from_env() -> Self {
        let default = Self::default();

        Self {
            drain_timeout: Duration::from_secs(parse_env_warn(
                "SHELLGATE_DRAIN_TIMEOUT_SECS",
                default.drain_timeout.as_secs(),
            )),

            drain_poll_interval: Duration::from_millis(parse_env_warn(
                "SHELLGATE_DRAIN_POLL_MS",
                default.drain_poll_interval.as_millis() as u64,
            )),

            kill_wait: Duration::from_millis(parse_env_warn(
                "SHELLGATE_KILL_WAIT_MS",
                default.kill_wait.as_millis() as u64,
            )),

            listen_backlog: parse_env_warn("SHELLGATE_LISTEN_BACKLOG", default.listen_backlog),

            pump_buffer_size: parse_env_warn(
                "SHELLGATE_PUMP_BUFFER_BYTES",
                default.pump_buffer_size,
            ),

            // Not typically overridden via env var
            accept_join_timeout: default.accept_join_timeout,
            listen_interface: default.listen_interface,
        }
    }

    /// Validate the defaults satisfy invariants.
    ///
    /// # Invariants
    /// 1. `drain_poll_interval` is non-zero
    /// 2. `pump_buffer_size` is non-zero
    /// 3. `listen_backlog` is non-zero
    pub fn validate(&self) -> Result<(), String> {
        if self.drain_poll_interval.is_zero() {
            return Err("drain_poll_interval must be greater than zero".to_string());
        }

        if self.pump_buffer_size == 0 {
            return Err("pump_buffer_size must be greater than zero".to_string());
        }

        if self.listen_backlog == 0 {
            return Err("listen_backlog must be greater than zero".to_string());
        }

        Ok(())
    }
}

/// Parse an environment variable with a warning on invalid values.
fn parse_env_warn<T: std::str::FromStr + std::fmt::Display>(name: &str, default: T) -> T {
    match std::env::var(name) {
        Ok(val) => match val.parse::<T>() {
            Ok(parsed) => parsed,
            Err(_) => {
                warn!(
                    env_var = name,
                    value = %val,
                    default = %default,
                    "Invalid value for environment variable, using default"
                );
                default
            }
        },
        Err(_) => default,
    }
}
