//! Shellgate core: a multi-transport connection proxy for remote shells.
//!
//! Servers listen on TCP, WebSocket or a local named pipe. Every accepted
//! connection gets its own shell subprocess started in stdio server mode,
//! and raw bytes are copied between the connection and the shell's standard
//! streams until either side closes. The protocol spoken over the pipe is
//! never inspected.
//!
//! Servers are tracked in a [`ServerRegistry`] that keeps names and
//! addresses unique within the process. The usual entry points are in
//! [`manager`]:
//!
//! ```no_run
//! # async fn demo() -> Result<(), shellgate_core::ProxyError> {
//! use std::sync::Arc;
//! use shellgate_core::{ProxyDefaults, ServerRegistry, ServerSpec, SystemShellLocator, TransportKind};
//! use shellgate_core::manager::{ServerSelector, start_server, stop_server};
//!
//! let registry = Arc::new(ServerRegistry::new());
//! let mut spec = ServerSpec::new(TransportKind::Tcp);
//! spec.port = 5985;
//!
//! let server = start_server(&registry, &spec, &ProxyDefaults::default(), Arc::new(SystemShellLocator)).await?;
//! println!("listening on {:?}", server.port());
//!
//! stop_server(&registry, &ServerSelector::Name(server.name().to_string()), false).await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod connection;
pub mod error;
pub mod lifecycle;
pub mod manager;
pub mod proxy;
pub mod registry;
pub mod server;
pub mod transport;

pub use config::{ConfigError, ProxyDefaults, ServerConfig, ServerSpec, ServersFile, StderrMode};
pub use connection::{ConnectionId, ConnectionRecord};
pub use error::{ConnectionError, ProxyError};
pub use lifecycle::ServerState;
pub use proxy::spawn::{ShellLocator, ShellPreference, SystemShellLocator};
pub use registry::ServerRegistry;
pub use server::{ProxyServer, ServerInfo};
pub use transport::{AddressKey, BoundAddress, TransportKind};
