//! Error types for server lifecycle and per-connection proxying.
//!
//! `ProxyError` is what callers of the start/stop/lookup operations see. Every
//! variant carries a stable identifier (see [`ProxyError::error_id`]) so that
//! front ends can report conditions without matching on message text.
//!
//! `ConnectionError` covers failures confined to a single proxied connection.
//! Those are logged and cleaned up by the connection supervisor and never
//! change the owning server's state.

use std::path::PathBuf;

use crate::lifecycle::ServerState;
use crate::transport::AddressKey;

// ─────────────────────────────────────────────────────────────────────────────
// Server-level Errors
// ─────────────────────────────────────────────────────────────────────────────

/// Errors returned by server lifecycle and registry operations.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    /// Another live server is already registered under this name.
    #[error("a server named '{name}' already exists")]
    NameConflict {
        /// The conflicting server name.
        name: String,
    },

    /// Another live server is already listening on this address.
    #[error("a server is already listening on {address}")]
    AddressConflict {
        /// The conflicting transport address.
        address: AddressKey,
    },

    /// No server is registered under the given name.
    #[error("no server named '{name}' was found")]
    NotFoundByName {
        /// The name that was looked up.
        name: String,
    },

    /// No server is registered on the given address.
    #[error("no server listening on {address} was found")]
    NotFoundByAddress {
        /// The address that was looked up.
        address: AddressKey,
    },

    /// The transport refuses an automatically assigned port.
    #[error("{transport} servers require a specific, non-zero port")]
    SpecificPortRequired {
        /// Transport kind that rejected port 0.
        transport: &'static str,
    },

    /// The server configuration is invalid.
    #[error("invalid server configuration: {reason}")]
    InvalidConfig {
        /// Human-readable description of the problem.
        reason: String,
    },

    /// `start` was called while the server is already starting or running.
    #[error("server '{name}' is already {state}")]
    AlreadyInState {
        /// The server name.
        name: String,
        /// The state the server was found in.
        state: ServerState,
    },

    /// The OS refused to bind the listener.
    #[error("failed to bind {address}: {source}")]
    Bind {
        /// Human-readable form of the address that failed to bind.
        address: String,
        /// Underlying OS error.
        source: std::io::Error,
    },

    /// The TLS acceptor could not be built from the configured files.
    #[error("failed to set up secure channel: {reason}")]
    SecureChannel {
        /// Human-readable description of the failure.
        reason: String,
    },

    /// Teardown did not complete cleanly.
    #[error("failed to stop server '{name}': {reason}")]
    Stop {
        /// The server name.
        name: String,
        /// Human-readable description of the failure.
        reason: String,
    },
}

impl ProxyError {
    /// Stable identifier for this error condition.
    ///
    /// These strings are part of the public surface: front ends print them
    /// next to the message and scripts may match on them.
    #[must_use]
    pub fn error_id(&self) -> &'static str {
        match self {
            Self::NameConflict { .. } => "ServerNameAlreadyExists",
            Self::AddressConflict { .. } => "ServerAddressInUse",
            Self::NotFoundByName { .. } | Self::NotFoundByAddress { .. } => "ServerNotFound",
            Self::SpecificPortRequired { .. } => "SpecificPortRequired",
            Self::InvalidConfig { .. } => "InvalidServerConfiguration",
            Self::AlreadyInState { .. } => "ServerAlreadyInState",
            Self::Bind { .. } => "ServerBindFailed",
            Self::SecureChannel { .. } => "SecureChannelSetupFailed",
            Self::Stop { .. } => "ServerStopFailed",
        }
    }

    /// Shorthand for [`ProxyError::InvalidConfig`].
    pub(crate) fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Per-connection Errors
// ─────────────────────────────────────────────────────────────────────────────

/// Failures contained to a single proxied connection.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    /// The shell executable could not be located.
    #[error("shell executable not found: {reason}")]
    ShellNotFound {
        /// Why the locator gave up.
        reason: String,
    },

    /// The located executable path does not exist on disk.
    #[error("shell executable {} does not exist", path.display())]
    ShellMissing {
        /// The path returned by the locator.
        path: PathBuf,
    },

    /// The subprocess could not be started.
    #[error("failed to spawn {}: {source}", path.display())]
    Spawn {
        /// The executable that failed to start.
        path: PathBuf,
        /// Underlying OS error.
        source: std::io::Error,
    },

    /// A standard stream of the subprocess was not captured.
    #[error("subprocess {stream} was not captured")]
    StreamNotCaptured {
        /// Which stream is missing.
        stream: &'static str,
    },

    /// The accepted stream could not be turned into a duplex channel
    /// (TLS or WebSocket handshake failure).
    #[error("channel handshake failed: {0}")]
    Handshake(std::io::Error),

    /// An I/O error in one of the byte pumps.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
