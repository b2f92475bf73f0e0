//! Server lifecycle state machine and connection draining.
//!
//! ## Lifecycle States
//!
//! ```text
//! Stopped → Starting → Running → Stopping → Stopped
//!     \_________\__________\__________\______→ Failed
//! ```
//!
//! - **Stopped**: No listener; `start` may be called
//! - **Starting**: Binding the listener
//! - **Running**: Accept loop active
//! - **Stopping**: Accept loop cancelled, draining or killing connections
//! - **Failed**: Unrecoverable error; `last_error` is populated, `start` may
//!   be called again

use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{info, warn};

use crate::connection::ConnectionTable;

// ============================================================================
// Server State
// ============================================================================

/// Lifecycle state of a single proxy server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerState {
    /// Not listening
    Stopped,
    /// Bind in progress
    Starting,
    /// Accepting connections
    Running,
    /// Teardown in progress
    Stopping,
    /// Unrecoverable error
    Failed,
}

impl ServerState {
    /// Returns true if `start` must be refused in this state.
    #[must_use]
    pub fn is_active(self) -> bool {
        matches!(self, Self::Starting | Self::Running | Self::Stopping)
    }
}

impl std::fmt::Display for ServerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stopped => write!(f, "stopped"),
            Self::Starting => write!(f, "starting"),
            Self::Running => write!(f, "running"),
            Self::Stopping => write!(f, "stopping"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

// ============================================================================
// Drain
// ============================================================================

/// Result of waiting for connections to finish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainResult {
    /// All connections ended before the deadline
    Complete,
    /// Deadline reached with connections still open
    Timeout {
        /// Number of connections still active
        remaining: usize,
    },
}

/// Wait for the connection table to empty, polling every `poll_interval`.
///
/// Polling keeps the wait identical across transports; `poll_interval` bounds
/// how late shutdown notices the last connection ending.
pub async fn drain_connections(
    server: &str,
    connections: &ConnectionTable,
    timeout: Duration,
    poll_interval: Duration,
) -> DrainResult {
    let deadline = Instant::now() + timeout;
    let mut last_log = Instant::now();

    loop {
        let active = connections.len();

        if active == 0 {
            return DrainResult::Complete;
        }

        if Instant::now() >= deadline {
            warn!(
                server,
                active_connections = active,
                "Drain timeout exceeded, killing remaining connections"
            );
            return DrainResult::Timeout { remaining: active };
        }

        // Log every 5 seconds
        if last_log.elapsed() >= Duration::from_secs(5) {
            info!(server, active_connections = active, "Draining connections...");
            last_log = Instant::now();
        }

        tokio::time::sleep(poll_interval).await;
    }
}

// ============================================================================
// Tests
// ============================================================================
