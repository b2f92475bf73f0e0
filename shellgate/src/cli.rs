//! CLI argument types for `shellgate serve` and `shellgate listen`.
//!
//! These types are defined separately from `main.rs` so that integration tests
//! can parse them directly.

use std::net::IpAddr;
use std::path::PathBuf;

use clap::{Args, ValueEnum};
use shellgate_core::transport::TlsFiles;
use shellgate_core::{ServerSpec, ShellPreference, StderrMode, TransportKind};

// ─────────────────────────────────────────────────────────────────────────────
// Shared Args
// ─────────────────────────────────────────────────────────────────────────────

/// Logging flags accepted by every subcommand.
#[derive(Args, Debug, Clone, Default)]
pub struct LogArgs {
    /// Enable debug logging.
    #[arg(long, short)]
    pub verbose: bool,

    /// Emit logs as JSON lines.
    #[arg(long)]
    pub log_json: bool,
}

// ─────────────────────────────────────────────────────────────────────────────
// Serve Subcommand Args
// ─────────────────────────────────────────────────────────────────────────────

/// Arguments for `shellgate serve`.
///
/// Starts every server listed in a servers file and runs until signalled.
#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Servers file. Falls back to `SHELLGATE_CONFIG`, then `./shellgate.yaml`.
    #[arg(long, short)]
    pub config: Option<PathBuf>,

    /// Kill open connections on shutdown instead of draining them.
    #[arg(long)]
    pub force_stop: bool,

    #[command(flatten)]
    pub log: LogArgs,
}

// ─────────────────────────────────────────────────────────────────────────────
// Listen Subcommand Args
// ─────────────────────────────────────────────────────────────────────────────

/// Arguments for `shellgate listen`.
///
/// Starts a single server described entirely by flags.
#[derive(Args, Debug)]
pub struct ListenArgs {
    /// Transport to listen on.
    #[arg(long, short, value_enum)]
    pub transport: CliTransport,

    /// Server name (defaults to `<transport>-<address>`).
    #[arg(long)]
    pub name: Option<String>,

    /// Port for tcp/websocket (0 = OS-assigned, tcp only).
    #[arg(long, short, default_value_t = 0)]
    pub port: u16,

    /// Pipe name for named-pipe (generated when omitted).
    #[arg(long)]
    pub pipe_name: Option<String>,

    /// Bind address for tcp/websocket.
    #[arg(long)]
    pub interface: Option<IpAddr>,

    /// WebSocket request path.
    #[arg(long)]
    pub path: Option<String>,

    /// Maximum concurrent connections (0 = unbounded).
    #[arg(long, default_value_t = 0)]
    pub max_connections: usize,

    /// Seconds to wait for connections to end on shutdown.
    #[arg(long)]
    pub drain_timeout_secs: Option<u64>,

    /// Serve WebSocket connections over TLS.
    #[arg(long, requires_all = ["tls_cert", "tls_key"])]
    pub secure: bool,

    /// PEM certificate chain for --secure.
    #[arg(long)]
    pub tls_cert: Option<PathBuf>,

    /// PEM private key for --secure.
    #[arg(long)]
    pub tls_key: Option<PathBuf>,

    /// Shell executable (searched on PATH when omitted).
    #[arg(long, env = "SHELLGATE_SHELL")]
    pub shell: Option<PathBuf>,

    /// Log shell stderr lines at debug level instead of discarding them.
    #[arg(long)]
    pub log_stderr: bool,

    /// Kill open connections on shutdown instead of draining them.
    #[arg(long)]
    pub force_stop: bool,

    #[command(flatten)]
    pub log: LogArgs,
}

impl ListenArgs {
    /// The server spec these flags describe. Validation happens at start.
    #[must_use]
    pub fn to_spec(&self) -> ServerSpec {
        let tls = match (&self.tls_cert, &self.tls_key) {
            (Some(cert), Some(key)) => Some(TlsFiles {
                cert_path: cert.clone(),
                key_path: key.clone(),
            }),
            _ => None,
        };

        ServerSpec {
            name: self.name.clone(),
            port: self.port,
            pipe_name: self.pipe_name.clone(),
            listen_interface: self.interface,
            path: self.path.clone(),
            max_connections: self.max_connections,
            drain_timeout_secs: self.drain_timeout_secs,
            secure: self.secure,
            tls,
            shell: ShellPreference {
                executable: self.shell.clone(),
            },
            stderr: if self.log_stderr {
                StderrMode::Log
            } else {
                StderrMode::Discard
            },
            ..ServerSpec::new(self.transport.clone().into())
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Value Enums (clap-compatible)
// ─────────────────────────────────────────────────────────────────────────────

/// CLI-level transport selection.
///
/// Maps 1:1 to `shellgate_core::TransportKind`.
#[derive(Clone, Debug, ValueEnum)]
pub enum CliTransport {
    /// Plain TCP stream socket.
    Tcp,
    /// WebSocket, optionally over TLS.
    Websocket,
    /// Local named pipe (Unix domain socket on Unix).
    NamedPipe,
}

// ─────────────────────────────────────────────────────────────────────────────
// Conversions
// ─────────────────────────────────────────────────────────────────────────────

impl From<CliTransport> for TransportKind {
    fn from(t: CliTransport) -> Self {
        match t {
            CliTransport::Tcp => TransportKind::Tcp,
            CliTransport::Websocket => TransportKind::WebSocket,
            CliTransport::NamedPipe => TransportKind::NamedPipe,
        }
    }
}
