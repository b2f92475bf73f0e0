//! Listener transports.
//!
//! Each transport binds an endpoint and hands out accepted connections as
//! [`Accepted`] values. The duplex channel of an accepted connection is
//! produced by a future so that per-connection handshakes (TLS, WebSocket
//! upgrade) run on the connection's own task rather than in the accept loop.

pub mod named_pipe;
pub mod tcp;
pub mod tls;
pub mod websocket;

use std::fmt;
use std::io;
use std::net::{IpAddr, SocketAddr};

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::ProxyError;

// ─────────────────────────────────────────────────────────────────────────────
// Addresses
// ─────────────────────────────────────────────────────────────────────────────

/// Transport kinds a server can listen on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    Tcp,
    #[serde(rename = "websocket")]
    WebSocket,
    NamedPipe,
}

impl TransportKind {
    /// Stable lowercase name, also used in default server names.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::WebSocket => "websocket",
            Self::NamedPipe => "named_pipe",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Registry key for a transport address.
///
/// Ports and pipe names are separate key spaces: a TCP server on port 5985
/// and a pipe named `5985` never collide. TCP and WebSocket share the port
/// key space.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum AddressKey {
    Port(u16),
    Pipe(String),
}

impl fmt::Display for AddressKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Port(port) => write!(f, "port {port}"),
            Self::Pipe(name) => write!(f, "pipe '{name}'"),
        }
    }
}

/// The address a listener actually bound, after any automatic assignment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BoundAddress {
    Socket(SocketAddr),
    Pipe(String),
}

impl BoundAddress {
    /// Registry key for this address.
    #[must_use]
    pub fn key(&self) -> AddressKey {
        match self {
            Self::Socket(addr) => AddressKey::Port(addr.port()),
            Self::Pipe(name) => AddressKey::Pipe(name.clone()),
        }
    }

    /// Bound port, for socket transports.
    #[must_use]
    pub fn port(&self) -> Option<u16> {
        match self {
            Self::Socket(addr) => Some(addr.port()),
            Self::Pipe(_) => None,
        }
    }
}

impl fmt::Display for BoundAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Socket(addr) => write!(f, "{addr}"),
            Self::Pipe(name) => f.write_str(name),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Endpoints
// ─────────────────────────────────────────────────────────────────────────────

/// IP endpoint shared by TCP and WebSocket listeners.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketEndpoint {
    pub interface: IpAddr,
    /// 0 requests an automatically assigned port.
    pub port: u16,
    pub backlog: u32,
}

impl SocketEndpoint {
    #[must_use]
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.interface, self.port)
    }
}

/// PEM files for the WebSocket secure channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TlsFiles {
    pub cert_path: std::path::PathBuf,
    pub key_path: std::path::PathBuf,
}

/// A validated, bindable endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Tcp(SocketEndpoint),
    WebSocket {
        socket: SocketEndpoint,
        /// Request path clients must upgrade on, always starting with `/`.
        path: String,
        tls: Option<TlsFiles>,
    },
    NamedPipe {
        /// `None` requests an automatically generated name.
        name: Option<String>,
    },
}

impl Endpoint {
    #[must_use]
    pub fn kind(&self) -> TransportKind {
        match self {
            Self::Tcp(_) => TransportKind::Tcp,
            Self::WebSocket { .. } => TransportKind::WebSocket,
            Self::NamedPipe { .. } => TransportKind::NamedPipe,
        }
    }

    /// Registry key known before binding; `None` when the address will be
    /// assigned automatically.
    #[must_use]
    pub fn requested_key(&self) -> Option<AddressKey> {
        match self {
            Self::Tcp(socket) | Self::WebSocket { socket, .. } => {
                (socket.port != 0).then_some(AddressKey::Port(socket.port))
            }
            Self::NamedPipe { name } => name.clone().map(AddressKey::Pipe),
        }
    }

    /// Human-readable form of the requested address, for errors and logs.
    #[must_use]
    pub fn describe(&self) -> String {
        match self {
            Self::Tcp(socket) => socket.socket_addr().to_string(),
            Self::WebSocket { socket, path, tls } => {
                let scheme = if tls.is_some() { "wss" } else { "ws" };
                format!("{scheme}://{}{path}", socket.socket_addr())
            }
            Self::NamedPipe { name } => name.clone().unwrap_or_else(|| "<auto>".to_string()),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Listener contract
// ─────────────────────────────────────────────────────────────────────────────

/// Any bidirectional byte stream a connection can be proxied over.
pub trait DuplexStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> DuplexStream for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// Boxed duplex byte channel handed to the proxy routine.
pub type DuplexChannel = Box<dyn DuplexStream>;

/// Future that completes the transport-level handshake of an accepted
/// connection.
pub type PendingChannel = BoxFuture<'static, io::Result<DuplexChannel>>;

/// One accepted connection.
pub struct Accepted {
    /// Human-readable peer identity.
    pub peer: String,
    pub channel: PendingChannel,
}

/// A bound listener.
#[async_trait]
pub trait Listener: Send {
    /// The address actually bound.
    fn local_address(&self) -> BoundAddress;

    /// Wait for the next inbound connection.
    ///
    /// Must be cancel-safe: the accept loop drops this future when the
    /// server stops.
    async fn accept(&mut self) -> io::Result<Accepted>;

    /// Stop listening and release OS resources.
    fn close(self: Box<Self>) {}
}

/// Bind the listener for `endpoint`.
pub(crate) async fn bind(endpoint: &Endpoint) -> Result<Box<dyn Listener>, ProxyError> {
    let bind_err = |source: io::Error| ProxyError::Bind {
        address: endpoint.describe(),
        source,
    };

    match endpoint {
        Endpoint::Tcp(socket) => {
            let listener = tcp::TcpTransport::bind(socket).map_err(bind_err)?;
            Ok(Box::new(listener))
        }
        Endpoint::WebSocket { socket, path, tls } => {
            let acceptor = match tls {
                Some(files) => Some(tls::build_acceptor(files)?),
                None => None,
            };
            let listener = websocket::WebSocketTransport::bind(socket, path.clone(), acceptor)
                .map_err(bind_err)?;
            Ok(Box::new(listener))
        }
        Endpoint::NamedPipe { name } => {
            let listener = named_pipe::NamedPipeTransport::bind(name.clone()).map_err(bind_err)?;
            Ok(Box::new(listener))
        }
    }
}
