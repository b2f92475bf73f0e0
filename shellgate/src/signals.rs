//! Process signal handling for the long-running subcommands.

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// How the process was asked to shut down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownKind {
    /// SIGINT or SIGTERM: drain connections unless `--force-stop` was given.
    Graceful,
    /// SIGQUIT: kill connections without draining.
    Immediate,
}

/// Tokens cancelled by the signal tasks.
#[derive(Debug, Clone, Default)]
pub struct ShutdownSignals {
    graceful: CancellationToken,
    immediate: CancellationToken,
}

impl ShutdownSignals {
    /// Install SIGINT/SIGTERM/SIGQUIT listeners. Must run inside a runtime.
    pub fn install() -> Self {
        let signals = Self::default();

        let graceful = signals.graceful.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    info!("Received SIGINT (Ctrl+C), stopping servers");
                    graceful.cancel();
                }
                Err(e) => error!(error = %e, "Failed to listen for SIGINT"),
            }
        });

        #[cfg(unix)]
        {
            use tokio::signal::unix::{SignalKind, signal};

            let graceful = signals.graceful.clone();
            tokio::spawn(async move {
                match signal(SignalKind::terminate()) {
                    Ok(mut sigterm) => {
                        sigterm.recv().await;
                        info!("Received SIGTERM, stopping servers");
                        graceful.cancel();
                    }
                    Err(e) => error!(error = %e, "Failed to listen for SIGTERM"),
                }
            });

            let immediate = signals.immediate.clone();
            tokio::spawn(async move {
                match signal(SignalKind::quit()) {
                    Ok(mut sigquit) => {
                        sigquit.recv().await;
                        warn!("Received SIGQUIT, stopping servers without drain");
                        immediate.cancel();
                    }
                    Err(e) => error!(error = %e, "Failed to listen for SIGQUIT"),
                }
            });
        }

        signals
    }

    /// Wait for the first shutdown request.
    pub async fn wait(&self) -> ShutdownKind {
        tokio::select! {
            biased;
            () = self.immediate.cancelled() => ShutdownKind::Immediate,
            () = self.graceful.cancelled() => ShutdownKind::Graceful,
        }
    }

    /// Request a graceful shutdown without a signal.
    pub fn trigger(&self) {
        self.graceful.cancel();
    }
}
