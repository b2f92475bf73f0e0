//! Server entries from the servers file and their validation.
//!
//! A [`ServerSpec`] is what callers and config files provide; it is loosely
//! typed so that YAML and CLI flags map onto it directly. [`ServerSpec::validate`]
//! turns it into a [`ServerConfig`], rejecting every configuration error
//! before any server state exists.

use std::net::IpAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::defaults::ProxyDefaults;
use crate::error::ProxyError;
use crate::proxy::spawn::ShellPreference;
use crate::transport::{Endpoint, SocketEndpoint, TlsFiles, TransportKind};

/// Root of a servers file.
///
/// # Example
/// ```yaml
/// schema: 1
///
/// servers:
///   - name: local-shell
///     transport: tcp
///     port: 5985
///   - transport: websocket
///     port: 8443
///     path: /shell
///     secure: true
///     tls:
///       cert_path: /etc/shellgate/cert.pem
///       key_path: /etc/shellgate/key.pem
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ServersFile {
    /// Schema version (must be 1).
    pub schema: u32,

    /// Servers to start.
    #[serde(default)]
    pub servers: Vec<ServerSpec>,
}

/// Where a subprocess's standard error ends up.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StderrMode {
    /// Read and drop every line.
    #[default]
    Discard,
    /// Emit every line as a `debug` event.
    Log,
}

/// Caller-supplied description of one server.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ServerSpec {
    /// Process-unique name. Defaulted from transport and address when unset.
    #[serde(default)]
    pub name: Option<String>,

    pub transport: TransportKind,

    /// Port for TCP/WebSocket. 0 asks the OS to pick one (TCP only).
    #[serde(default)]
    pub port: u16,

    /// Pipe name for the named-pipe transport. Unset generates one.
    #[serde(default)]
    pub pipe_name: Option<String>,

    /// Bind address for TCP/WebSocket.
    #[serde(default)]
    pub listen_interface: Option<IpAddr>,

    /// WebSocket request path. Defaults to `/`.
    #[serde(default)]
    pub path: Option<String>,

    /// Admission cap. 0 means unbounded.
    #[serde(default)]
    pub max_connections: usize,

    #[serde(default)]
    pub drain_timeout_secs: Option<u64>,

    /// Wrap WebSocket connections in TLS.
    #[serde(default)]
    pub secure: bool,

    #[serde(default)]
    pub tls: Option<TlsFiles>,

    #[serde(default)]
    pub shell: ShellPreference,

    #[serde(default)]
    pub listen_backlog: Option<u32>,

    #[serde(default)]
    pub stderr: StderrMode,
}

impl ServerSpec {
    /// A spec for `transport` with every optional field unset.
    #[must_use]
    pub fn new(transport: TransportKind) -> Self {
        Self {
            name: None,
            transport,
            port: 0,
            pipe_name: None,
            listen_interface: None,
            path: None,
            max_connections: 0,
            drain_timeout_secs: None,
            secure: false,
            tls: None,
            shell: ShellPreference::default(),
            listen_backlog: None,
            stderr: StderrMode::Discard,
        }
    }

    /// Check this entry and resolve defaults.
    ///
    /// # Errors
    ///
    /// `SpecificPortRequired` for a WebSocket on port 0, `InvalidConfig` for
    /// everything else that cannot be bound as written.
    pub fn validate(&self, defaults: &ProxyDefaults) -> Result<ServerConfig, ProxyError> {
        if self.name.as_deref().is_some_and(|n| n.trim().is_empty()) {
            return Err(ProxyError::invalid("server name must not be empty"));
        }

        let socket = || SocketEndpoint {
            interface: self.listen_interface.unwrap_or(defaults.listen_interface),
            port: self.port,
            backlog: self.listen_backlog.unwrap_or(defaults.listen_backlog),
        };

        if self.listen_backlog == Some(0) {
            return Err(ProxyError::invalid("listen_backlog must be greater than zero"));
        }
        if self.secure && self.transport != TransportKind::WebSocket {
            return Err(ProxyError::invalid(format!(
                "secure is only supported on websocket servers, not {}",
                self.transport
            )));
        }
        if self.transport != TransportKind::NamedPipe && self.pipe_name.is_some() {
            return Err(ProxyError::invalid(format!(
                "pipe_name is only valid for named_pipe servers, not {}",
                self.transport
            )));
        }
        if self.transport != TransportKind::WebSocket && self.path.is_some() {
            return Err(ProxyError::invalid(format!(
                "path is only valid for websocket servers, not {}",
                self.transport
            )));
        }

        let endpoint = match self.transport {
            TransportKind::Tcp => Endpoint::Tcp(socket()),
            TransportKind::WebSocket => {
                if self.port == 0 {
                    return Err(ProxyError::SpecificPortRequired {
                        transport: TransportKind::WebSocket.as_str(),
                    });
                }
                let path = self.path.clone().unwrap_or_else(|| "/".to_string());
                if !path.starts_with('/') {
                    return Err(ProxyError::invalid(format!(
                        "websocket path '{path}' must start with '/'"
                    )));
                }
                let tls = match (self.secure, &self.tls) {
                    (true, Some(files)) => Some(files.clone()),
                    (true, None) => {
                        return Err(ProxyError::invalid(
                            "secure websocket servers need tls.cert_path and tls.key_path",
                        ));
                    }
                    (false, _) => None,
                };
                Endpoint::WebSocket {
                    socket: socket(),
                    path,
                    tls,
                }
            }
            TransportKind::NamedPipe => {
                if self.port != 0 || self.listen_interface.is_some() {
                    return Err(ProxyError::invalid(
                        "named_pipe servers take a pipe_name, not a port or listen_interface",
                    ));
                }
                if let Some(name) = &self.pipe_name {
                    validate_pipe_name(name)?;
                }
                Endpoint::NamedPipe {
                    name: self.pipe_name.clone(),
                }
            }
        };

        let name = self
            .name
            .clone()
            .unwrap_or_else(|| default_server_name(&endpoint));

        Ok(ServerConfig {
            name,
            endpoint,
            max_connections: self.max_connections,
            drain_timeout: self
                .drain_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.drain_timeout),
            shell: self.shell.clone(),
            stderr: self.stderr,
            drain_poll_interval: defaults.drain_poll_interval,
            accept_join_timeout: defaults.accept_join_timeout,
            kill_wait: defaults.kill_wait,
            pump_buffer_size: defaults.pump_buffer_size,
        })
    }
}

fn validate_pipe_name(name: &str) -> Result<(), ProxyError> {
    if name.is_empty() {
        return Err(ProxyError::invalid("pipe_name must not be empty"));
    }
    if name.contains('\0') || name.contains('\\') {
        return Err(ProxyError::invalid(format!(
            "pipe_name '{}' contains an invalid character",
            name.escape_default()
        )));
    }
    Ok(())
}

/// `{transport}-{address}` when the address is known up front, otherwise
/// `{transport}-{8 hex digits}`.
fn default_server_name(endpoint: &Endpoint) -> String {
    let kind = endpoint.kind();
    match endpoint {
        Endpoint::Tcp(socket) | Endpoint::WebSocket { socket, .. } if socket.port != 0 => {
            format!("{kind}-{}", socket.port)
        }
        Endpoint::NamedPipe { name: Some(name) } => format!("{kind}-{name}"),
        _ => {
            let id = uuid::Uuid::new_v4().simple().to_string();
            format!("{kind}-{}", &id[..8])
        }
    }
}

/// A validated server configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub name: String,
    pub endpoint: Endpoint,
    /// 0 means unbounded.
    pub max_connections: usize,
    pub drain_timeout: Duration,
    pub shell: ShellPreference,
    pub stderr: StderrMode,
    pub drain_poll_interval: Duration,
    pub accept_join_timeout: Duration,
    pub kill_wait: Duration,
    pub pump_buffer_size: usize,
}

impl ServerConfig {
    #[must_use]
    pub fn transport(&self) -> TransportKind {
        self.endpoint.kind()
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;

    fn validate(spec: &ServerSpec) -> Result<ServerConfig, ProxyError> {
        spec.validate(&ProxyDefaults::default())
    }

    #[test]
    fn test_tcp_defaults() {
        let config = validate(&ServerSpec::new(TransportKind::Tcp)).unwrap();
        let Endpoint::Tcp(socket) = &config.endpoint else {
            panic!("expected tcp endpoint");
        };
        assert_eq!(socket.interface, IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_eq!(socket.port, 0);
        assert_eq!(socket.backlog, 128);
        assert_eq!(config.drain_timeout, Duration::from_secs(30));
        assert_eq!(config.stderr, StderrMode::Discard);
        assert!(config.name.starts_with("tcp-"));
        assert_eq!(config.name.len(), "tcp-".len() + 8);
    }

    #[test]
    fn test_default_name_uses_specific_address() {
        let mut spec = ServerSpec::new(TransportKind::Tcp);
        spec.port = 5985;
        assert_eq!(validate(&spec).unwrap().name, "tcp-5985");

        let mut spec = ServerSpec::new(TransportKind::NamedPipe);
        spec.pipe_name = Some("shell".to_string());
        assert_eq!(validate(&spec).unwrap().name, "named_pipe-shell");
    }

    #[test]
    fn test_explicit_name_kept() {
        let mut spec = ServerSpec::new(TransportKind::Tcp);
        spec.name = Some("Main".to_string());
        assert_eq!(validate(&spec).unwrap().name, "Main");
    }

    #[test]
    fn test_blank_name_rejected() {
        let mut spec = ServerSpec::new(TransportKind::Tcp);
        spec.name = Some("  ".to_string());
        assert_eq!(
            validate(&spec).unwrap_err().error_id(),
            "InvalidServerConfiguration"
        );
    }

    #[test]
    fn test_websocket_requires_port() {
        let spec = ServerSpec::new(TransportKind::WebSocket);
        assert!(matches!(
            validate(&spec),
            Err(ProxyError::SpecificPortRequired {
                transport: "websocket"
            })
        ));
    }

    #[test]
    fn test_websocket_path_must_be_absolute() {
        let mut spec = ServerSpec::new(TransportKind::WebSocket);
        spec.port = 9000;
        spec.path = Some("shell".to_string());
        assert!(matches!(validate(&spec), Err(ProxyError::InvalidConfig { .. })));

        spec.path = None;
        let config = validate(&spec).unwrap();
        assert!(matches!(config.endpoint, Endpoint::WebSocket { ref path, .. } if path == "/"));
    }

    #[test]
    fn test_secure_requires_tls_files() {
        let mut spec = ServerSpec::new(TransportKind::WebSocket);
        spec.port = 9443;
        spec.secure = true;
        assert!(matches!(validate(&spec), Err(ProxyError::InvalidConfig { .. })));

        spec.tls = Some(TlsFiles {
            cert_path: "cert.pem".into(),
            key_path: "key.pem".into(),
        });
        let config = validate(&spec).unwrap();
        assert!(matches!(
            config.endpoint,
            Endpoint::WebSocket { tls: Some(_), .. }
        ));
    }

    #[test]
    fn test_secure_rejected_on_tcp() {
        let mut spec = ServerSpec::new(TransportKind::Tcp);
        spec.secure = true;
        assert!(matches!(validate(&spec), Err(ProxyError::InvalidConfig { .. })));
    }

    #[test]
    fn test_named_pipe_rejects_port() {
        let mut spec = ServerSpec::new(TransportKind::NamedPipe);
        spec.port = 80;
        assert!(matches!(validate(&spec), Err(ProxyError::InvalidConfig { .. })));
    }

    #[test]
    fn test_pipe_name_rejected_elsewhere() {
        let mut spec = ServerSpec::new(TransportKind::Tcp);
        spec.pipe_name = Some("p".to_string());
        assert!(matches!(validate(&spec), Err(ProxyError::InvalidConfig { .. })));
    }

    #[test]
    fn test_overrides_win_over_defaults() {
        let mut spec = ServerSpec::new(TransportKind::Tcp);
        spec.drain_timeout_secs = Some(0);
        spec.listen_backlog = Some(4);
        spec.listen_interface = Some(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        let config = validate(&spec).unwrap();
        assert_eq!(config.drain_timeout, Duration::ZERO);
        let Endpoint::Tcp(socket) = config.endpoint else {
            panic!("expected tcp endpoint");
        };
        assert_eq!(socket.backlog, 4);
        assert_eq!(socket.interface, IpAddr::V4(Ipv4Addr::UNSPECIFIED));
    }

    #[test]
    fn test_spec_from_yaml() {
        let yaml = r#"
name: ws
transport: websocket
port: 8080
path: /pwsh
max_connections: 4
stderr: log
shell:
  executable: /usr/bin/pwsh
"#;
        let spec: ServerSpec = serde_saphyr::from_str(yaml).unwrap();
        assert_eq!(spec.transport, TransportKind::WebSocket);
        assert_eq!(spec.max_connections, 4);
        assert_eq!(spec.stderr, StderrMode::Log);
        assert_eq!(
            spec.shell.executable.as_deref(),
            Some(std::path::Path::new("/usr/bin/pwsh"))
        );
    }

    #[test]
    fn test_unknown_fields_rejected() {
        let yaml = "transport: tcp\nprot: 80\n";
        assert!(serde_saphyr::from_str::<ServerSpec>(yaml).is_err());
    }
}
