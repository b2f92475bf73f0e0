//! Error type for the `shellgate` command-line front end.

use shellgate_core::{ConfigError, ProxyError};

/// Failures that end a `serve` or `listen` run.
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    /// The servers file could not be found, read, or validated.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Environment overrides produced unusable defaults.
    #[error("Invalid defaults: {0}")]
    Defaults(String),

    /// A server failed to start. Servers started before it have been stopped.
    #[error("Server '{name}' failed to start: {source}")]
    Start {
        /// Configured or derived server name (empty if validation failed first).
        name: String,
        /// The underlying proxy error.
        source: ProxyError,
    },

    /// One or more servers reported errors while shutting down.
    #[error("{count} server(s) failed to stop cleanly")]
    Shutdown {
        /// Number of servers whose stop failed.
        count: usize,
    },

    /// Writing status lines to stdout failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
