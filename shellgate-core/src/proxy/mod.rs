//! Per-connection spawn-and-proxy routine.
//!
//! For every accepted connection the server spawns one supervisor task
//! running [`serve_connection`]. The supervisor completes the channel
//! handshake, starts a shell, records the connection, and then runs three
//! tasks until either pump finishes:
//!
//! ```text
//! client ──► input pump ──► shell stdin
//! client ◄── output pump ◄── shell stdout
//!            stderr drain ◄── shell stderr   (discarded or logged)
//! ```
//!
//! Failures here are contained to the connection: they are logged and the
//! server keeps running.

pub mod pump;
pub mod spawn;

use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::sync::OwnedSemaphorePermit;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::StderrMode;
use crate::connection::{ConnectionId, ConnectionRecord, ConnectionTable};
use crate::error::ConnectionError;
use crate::transport::Accepted;

use self::pump::{drain_stderr, pump};
use self::spawn::{ProcessOutcome, SubprocessSpawner};

/// Everything a connection supervisor needs from its server.
pub(crate) struct ConnectionContext {
    pub(crate) server: String,
    pub(crate) connections: Arc<ConnectionTable>,
    pub(crate) spawner: SubprocessSpawner,
    pub(crate) stderr: StderrMode,
    pub(crate) buffer_size: usize,
    pub(crate) kill_wait: Duration,
}

/// Which side ended the connection.
#[derive(Debug)]
enum Ended {
    ClientClosed(std::io::Result<u64>),
    ShellClosed(std::io::Result<u64>),
    Cancelled,
}

/// Proxy one accepted connection until either side closes.
///
/// `permit` is the admission slot taken by the accept loop; it is released
/// when this function returns.
pub(crate) async fn serve_connection(
    ctx: Arc<ConnectionContext>,
    accepted: Accepted,
    permit: Option<OwnedSemaphorePermit>,
) {
    let _permit = permit;
    let Accepted { peer, channel } = accepted;
    let server = ctx.server.as_str();

    let mut channel = match channel.await {
        Ok(channel) => channel,
        Err(e) => {
            let err = ConnectionError::Handshake(e);
            warn!(server, %peer, error = %err, "dropping connection");
            return;
        }
    };

    if ctx.connections.is_sealed() {
        debug!(server, %peer, "server stopping, dropping connection");
        return;
    }

    let spawned = ctx
        .spawner
        .resolve()
        .and_then(|path| ctx.spawner.spawn(&path));
    let shell = match spawned {
        Ok(shell) => shell,
        Err(e) => {
            warn!(server, %peer, error = %e, "cannot start shell, closing connection");
            if let Err(e) = channel.shutdown().await {
                debug!(server, %peer, error = %e, "channel shutdown failed");
            }
            return;
        }
    };

    let connection_id = ConnectionId::generate();
    let pid = shell.subprocess.pid();
    let cancel = CancellationToken::new();
    let record = ConnectionRecord {
        connection_id: connection_id.clone(),
        remote_description: peer.clone(),
        subprocess_id: pid,
    };

    if !ctx
        .connections
        .insert(record, Arc::clone(&shell.subprocess), cancel.clone())
    {
        // The server reaped its table while this connection was being set up.
        debug!(server, %peer, pid, "server stopping, discarding new connection");
        if let Some(entry) = ctx.connections.remove(&connection_id) {
            entry.terminate(ctx.kill_wait).await;
        }
        return;
    }

    info!(
        server,
        connection_id = %connection_id,
        %peer,
        pid,
        shell = %shell.subprocess.path().display(),
        "connection opened"
    );

    let (client_read, client_write) = tokio::io::split(channel);
    let buffer_size = ctx.buffer_size;
    let mut input = tokio::spawn(pump(client_read, shell.stdin, buffer_size));
    let mut output = tokio::spawn(pump(shell.stdout, client_write, buffer_size));
    let mut stderr_task = {
        let ctx = Arc::clone(&ctx);
        let connection_id = connection_id.clone();
        let stderr = shell.stderr;
        tokio::spawn(async move {
            drain_stderr(stderr, ctx.stderr, &ctx.server, &connection_id).await
        })
    };

    let ended = tokio::select! {
        result = &mut input => Ended::ClientClosed(flatten(result)),
        result = &mut output => Ended::ShellClosed(flatten(result)),
        _ = cancel.cancelled() => Ended::Cancelled,
    };
    input.abort();
    output.abort();

    match &ended {
        Ended::ClientClosed(Ok(bytes)) => {
            debug!(server, connection_id = %connection_id, bytes, "client closed the channel")
        }
        Ended::ShellClosed(Ok(bytes)) => {
            debug!(server, connection_id = %connection_id, bytes, "shell closed its output")
        }
        Ended::ClientClosed(Err(e)) | Ended::ShellClosed(Err(e)) => {
            debug!(server, connection_id = %connection_id, error = %e, "pump failed")
        }
        Ended::Cancelled => debug!(server, connection_id = %connection_id, "connection cancelled"),
    }

    // Whoever removes the entry owns the kill; `stop` may have beaten us to it.
    if let Some(entry) = ctx.connections.remove(&connection_id) {
        let outcome = entry.terminate(ctx.kill_wait).await;
        log_outcome(server, &connection_id, outcome);
    }
    // The shell is gone, so its stderr reaches EOF; bound the wait anyway.
    let stderr_lines = match tokio::time::timeout(ctx.kill_wait, &mut stderr_task).await {
        Ok(Ok(lines)) => Some(lines),
        Ok(Err(_)) => None,
        Err(_) => {
            stderr_task.abort();
            None
        }
    };

    info!(server, connection_id = %connection_id, pid, ?stderr_lines, "connection closed");
}

fn flatten(result: Result<std::io::Result<u64>, tokio::task::JoinError>) -> std::io::Result<u64> {
    result.unwrap_or_else(|e| Err(std::io::Error::other(e)))
}

fn log_outcome(server: &str, connection_id: &ConnectionId, outcome: Option<ProcessOutcome>) {
    match outcome {
        Some(ProcessOutcome::StillRunning) => {
            warn!(server, connection_id = %connection_id, "shell still running after kill")
        }
        Some(ProcessOutcome::WaitFailed { reason }) => {
            warn!(server, connection_id = %connection_id, reason = %reason, "failed to reap shell")
        }
        Some(outcome) => debug!(server, connection_id = %connection_id, ?outcome, "shell reaped"),
        None => {}
    }
}
