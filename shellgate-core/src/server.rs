//! The proxy server: one listener plus the lifecycle shared by all transports.
//!
//! ```text
//! start:  Stopped|Failed → Starting → bind → register → spawn accept loop → Running
//! stop:   Running → Stopping → cancel accept loop → drain (unless forced)
//!                 → kill remaining shells → unregister → Stopped
//! ```
//!
//! Runtime state (lifecycle state, bound address, listener handle) sits in
//! one mutex so that transitions are check-and-set. The lock is never held
//! across an await.

use std::sync::{Arc, Weak};

use arc_swap::ArcSwapOption;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::connection::{ConnectionRecord, ConnectionTable};
use crate::error::ProxyError;
use crate::lifecycle::{DrainResult, ServerState, drain_connections};
use crate::proxy::spawn::{ShellLocator, SubprocessSpawner};
use crate::proxy::{ConnectionContext, serve_connection};
use crate::registry::ServerRegistry;
use crate::transport::{self, AddressKey, BoundAddress, Listener, TransportKind};

/// Handle on a running accept loop.
struct ListenerHandle {
    cancel: CancellationToken,
    accept_task: JoinHandle<()>,
}

struct Runtime {
    state: ServerState,
    bound: Option<BoundAddress>,
    listener: Option<ListenerHandle>,
}

/// Serializable snapshot of a server.
#[derive(Debug, Clone, Serialize)]
pub struct ServerInfo {
    pub name: String,
    pub transport: TransportKind,
    /// Resolved address once bound, otherwise the requested one.
    pub address: String,
    pub state: ServerState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub max_connections: usize,
    pub connection_count: usize,
    pub connections: Vec<ConnectionRecord>,
}

/// A single listener and the connections it proxies.
pub struct ProxyServer {
    config: ServerConfig,
    registry: Weak<ServerRegistry>,
    context: Arc<ConnectionContext>,
    runtime: Mutex<Runtime>,
    last_error: ArcSwapOption<String>,
}

impl ProxyServer {
    /// Create a stopped server. Nothing is bound or registered until
    /// [`ProxyServer::start`].
    pub fn new(
        config: ServerConfig,
        registry: &Arc<ServerRegistry>,
        locator: Arc<dyn ShellLocator>,
    ) -> Arc<Self> {
        let context = Arc::new(ConnectionContext {
            server: config.name.clone(),
            connections: Arc::new(ConnectionTable::new()),
            spawner: SubprocessSpawner::new(locator, config.shell.clone()),
            stderr: config.stderr,
            buffer_size: config.pump_buffer_size,
            kill_wait: config.kill_wait,
        });
        Arc::new(Self {
            config,
            registry: Arc::downgrade(registry),
            context,
            runtime: Mutex::new(Runtime {
                state: ServerState::Stopped,
                bound: None,
                listener: None,
            }),
            last_error: ArcSwapOption::empty(),
        })
    }

    // ─────────────────────────────────────────────────────────────────────
    // Accessors
    // ─────────────────────────────────────────────────────────────────────

    #[must_use]
    pub fn name(&self) -> &str {
        &self.config.name
    }

    #[must_use]
    pub fn transport(&self) -> TransportKind {
        self.config.transport()
    }

    #[must_use]
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    #[must_use]
    pub fn state(&self) -> ServerState {
        self.runtime.lock().state
    }

    #[must_use]
    pub fn last_error(&self) -> Option<String> {
        self.last_error.load_full().map(|e| e.as_ref().clone())
    }

    /// Address the listener bound, kept after stop for reporting.
    #[must_use]
    pub fn bound_address(&self) -> Option<BoundAddress> {
        self.runtime.lock().bound.clone()
    }

    /// Resolved port, for TCP and WebSocket servers that have bound.
    #[must_use]
    pub fn port(&self) -> Option<u16> {
        self.bound_address().and_then(|a| a.port())
    }

    /// Registry key: the bound address if any, otherwise the requested one.
    #[must_use]
    pub fn address_key(&self) -> Option<AddressKey> {
        match self.bound_address() {
            Some(bound) => Some(bound.key()),
            None => self.config.endpoint.requested_key(),
        }
    }

    #[must_use]
    pub fn connections(&self) -> &ConnectionTable {
        &self.context.connections
    }

    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.context.connections.len()
    }

    #[must_use]
    pub fn info(&self) -> ServerInfo {
        let address = match self.bound_address() {
            Some(bound) => bound.to_string(),
            None => self.config.endpoint.describe(),
        };
        let connections = self.context.connections.records();
        ServerInfo {
            name: self.config.name.clone(),
            transport: self.transport(),
            address,
            state: self.state(),
            last_error: self.last_error(),
            max_connections: self.config.max_connections,
            connection_count: connections.len(),
            connections,
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Start
    // ─────────────────────────────────────────────────────────────────────

    /// Bind, register and begin accepting connections.
    ///
    /// # Errors
    ///
    /// `AlreadyInState` if the server is starting, running or stopping.
    /// Bind, secure-channel and registry conflicts leave the server `Failed`
    /// and unregistered.
    pub async fn start(self: &Arc<Self>) -> Result<(), ProxyError> {
        self.start_with(transport::bind(&self.config.endpoint)).await
    }

    /// `start` with the listener supplied by `bind`.
    async fn start_with<F>(self: &Arc<Self>, bind: F) -> Result<(), ProxyError>
    where
        F: Future<Output = Result<Box<dyn Listener>, ProxyError>>,
    {
        let previous = {
            let mut rt = self.runtime.lock();
            if rt.state.is_active() {
                return Err(ProxyError::AlreadyInState {
                    name: self.config.name.clone(),
                    state: rt.state,
                });
            }
            let previous = rt.state;
            rt.state = ServerState::Starting;
            rt.bound = None;
            previous
        };

        // Connections left by an accept-loop failure hold permits of the old
        // semaphore and must not count against the new one.
        if previous == ServerState::Failed {
            let killed = self.kill_remaining().await;
            if killed > 0 {
                info!(server = %self.config.name, killed, "Reaped connections from failed run");
            }
        }
        self.last_error.store(None);
        self.context.connections.unseal();

        info!(
            server = %self.config.name,
            transport = %self.transport(),
            address = %self.config.endpoint.describe(),
            "Starting server"
        );

        match self.bind_and_launch(bind).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.fail(&e.to_string());
                Err(e)
            }
        }
    }

    async fn bind_and_launch<F>(self: &Arc<Self>, bind: F) -> Result<(), ProxyError>
    where
        F: Future<Output = Result<Box<dyn Listener>, ProxyError>>,
    {
        let registry = self
            .registry
            .upgrade()
            .ok_or_else(|| ProxyError::invalid("server registry no longer exists"))?;

        let listener = bind.await?;
        let bound = listener.local_address();
        self.runtime.lock().bound = Some(bound.clone());

        if !registry.register(self) {
            listener.close();
            let key = bound.key();
            return Err(match registry.lookup_by_name(&self.config.name) {
                Some(other) if !Arc::ptr_eq(&other, self) => ProxyError::NameConflict {
                    name: self.config.name.clone(),
                },
                _ => ProxyError::AddressConflict { address: key },
            });
        }

        let capacity =
            (self.config.max_connections > 0).then(|| Arc::new(Semaphore::new(self.config.max_connections)));
        let cancel = CancellationToken::new();

        let mut rt = self.runtime.lock();
        let accept_task = tokio::spawn(Arc::clone(self).accept_loop(listener, cancel.clone(), capacity));
        rt.listener = Some(ListenerHandle {
            cancel,
            accept_task,
        });
        rt.state = ServerState::Running;
        drop(rt);

        info!(server = %self.config.name, address = %bound, "Server running");
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────
    // Accept loop
    // ─────────────────────────────────────────────────────────────────────

    async fn accept_loop(
        self: Arc<Self>,
        mut listener: Box<dyn Listener>,
        cancel: CancellationToken,
        capacity: Option<Arc<Semaphore>>,
    ) {
        let server = self.config.name.as_str();

        loop {
            // Admission: take a slot before accepting so excess clients wait
            // in the transport backlog.
            let permit = match &capacity {
                Some(slots) => tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    permit = Arc::clone(slots).acquire_owned() => match permit {
                        Ok(permit) => Some(permit),
                        Err(_) => break,
                    },
                },
                None => None,
            };

            let accepted = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok(accepted) => {
                    debug!(server, peer = %accepted.peer, "accepted connection");
                    tokio::spawn(serve_connection(
                        Arc::clone(&self.context),
                        accepted,
                        permit,
                    ));
                }
                Err(_) if cancel.is_cancelled() => break,
                Err(e) => {
                    error!(server, error = %e, "accept failed, server is no longer listening");
                    listener.close();
                    self.fail_running(&format!("accept failed: {e}"));
                    return;
                }
            }
        }

        listener.close();
        debug!(server, "accept loop stopped");
    }

    /// Accept-loop failure: only a `Running` server transitions, a concurrent
    /// `stop` owns the state otherwise.
    fn fail_running(&self, reason: &str) {
        let mut rt = self.runtime.lock();
        if rt.state != ServerState::Running {
            return;
        }
        rt.state = ServerState::Failed;
        // The accept task is the caller; dropping its handle detaches it.
        rt.listener = None;
        self.last_error.store(Some(Arc::new(reason.to_string())));
    }

    fn fail(&self, reason: &str) {
        let mut rt = self.runtime.lock();
        rt.state = ServerState::Failed;
        if let Some(handle) = rt.listener.take() {
            handle.cancel.cancel();
        }
        drop(rt);
        self.last_error.store(Some(Arc::new(reason.to_string())));
        error!(server = %self.config.name, error = reason, "Server failed");
    }

    // ─────────────────────────────────────────────────────────────────────
    // Stop
    // ─────────────────────────────────────────────────────────────────────

    /// Stop accepting, drain or kill connections, and unregister.
    ///
    /// A `Stopped` server is left untouched. A `Failed` server stays
    /// `Failed` but its leftover connections are killed and it is
    /// unregistered.
    ///
    /// # Errors
    ///
    /// `Stop` if the server is still starting or if the accept loop could
    /// not be joined. The server is `Failed` afterwards, with every
    /// connection killed and the registry entry removed.
    pub async fn stop(&self, force: bool) -> Result<(), ProxyError> {
        let handle = {
            let mut rt = self.runtime.lock();
            match rt.state {
                ServerState::Stopped | ServerState::Stopping => return Ok(()),
                ServerState::Starting => {
                    return Err(ProxyError::Stop {
                        name: self.config.name.clone(),
                        reason: "server is still starting".to_string(),
                    });
                }
                ServerState::Failed => None,
                ServerState::Running => {
                    rt.state = ServerState::Stopping;
                    rt.listener.take()
                }
            }
        };

        let Some(handle) = handle else {
            // Failed: reap whatever the failure left behind.
            let killed = self.kill_remaining().await;
            self.unregister();
            info!(server = %self.config.name, killed, "Cleaned up failed server");
            return Ok(());
        };

        info!(
            server = %self.config.name,
            force,
            active_connections = self.connection_count(),
            "Stopping server"
        );

        let joined = self.join_accept_loop(handle).await;

        if !force && !self.context.connections.is_empty() {
            let result = drain_connections(
                &self.config.name,
                &self.context.connections,
                self.config.drain_timeout,
                self.config.drain_poll_interval,
            )
            .await;
            if result == DrainResult::Complete {
                info!(server = %self.config.name, "All connections drained");
            }
        }

        let killed = self.kill_remaining().await;
        self.unregister();

        match joined {
            Ok(()) => {
                self.runtime.lock().state = ServerState::Stopped;
                info!(server = %self.config.name, killed, "Server stopped");
                Ok(())
            }
            Err(reason) => {
                self.fail(&reason);
                Err(ProxyError::Stop {
                    name: self.config.name.clone(),
                    reason,
                })
            }
        }
    }

    async fn join_accept_loop(&self, handle: ListenerHandle) -> Result<(), String> {
        let ListenerHandle {
            cancel,
            mut accept_task,
        } = handle;
        cancel.cancel();

        match tokio::time::timeout(self.config.accept_join_timeout, &mut accept_task).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) if e.is_panic() => Err(format!("accept loop panicked: {e}")),
            Ok(Err(_)) => Ok(()),
            Err(_) => {
                accept_task.abort();
                warn!(
                    server = %self.config.name,
                    timeout_ms = self.config.accept_join_timeout.as_millis() as u64,
                    "accept loop did not exit in time, aborted"
                );
                Ok(())
            }
        }
    }

    /// Seal the table and kill every connection still in it.
    async fn kill_remaining(&self) -> usize {
        let connections = &self.context.connections;
        connections.seal();
        let entries = connections.take_all();
        let count = entries.len();
        if count > 0 {
            warn!(server = %self.config.name, count, "Killing remaining connections");
        }
        futures_util::future::join_all(
            entries
                .into_iter()
                .map(|entry| entry.terminate(self.config.kill_wait)),
        )
        .await;
        count
    }

    fn unregister(&self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.unregister(self);
        }
    }
}

impl std::fmt::Debug for ProxyServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyServer")
            .field("name", &self.config.name)
            .field("transport", &self.transport())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
