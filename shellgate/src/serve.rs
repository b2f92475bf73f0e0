//! `serve` and `listen` subcommands.
//!
//! Both start one or more servers in the process-wide registry, print a JSON
//! status line per server to stdout, then block until a shutdown signal and
//! stop everything.

use std::io::Write;
use std::sync::{Arc, LazyLock};

use serde_json::json;
use shellgate_core::config::{find_config_file, load_and_validate};
use shellgate_core::manager::{list_servers, start_server, stop_all};
use shellgate_core::{
    ProxyDefaults, ProxyServer, ServerRegistry, ServerSpec, ShellLocator, SystemShellLocator,
};
use tracing::{debug, info, warn};

use crate::cli::{ListenArgs, ServeArgs};
use crate::error::CliError;
use crate::signals::{ShutdownKind, ShutdownSignals};

static REGISTRY: LazyLock<Arc<ServerRegistry>> = LazyLock::new(|| Arc::new(ServerRegistry::new()));

/// The registry shared by every server this process starts.
pub fn process_registry() -> Arc<ServerRegistry> {
    Arc::clone(&REGISTRY)
}

/// Run `shellgate serve`.
pub async fn run_serve(args: ServeArgs) -> Result<(), CliError> {
    let path = find_config_file(args.config.as_deref())?;
    let file = load_and_validate(&path)?;
    info!(path = %path.display(), servers = file.servers.len(), "Loaded servers file");

    let defaults = load_defaults()?;
    let signals = ShutdownSignals::install();
    run_servers(
        &process_registry(),
        &file.servers,
        &defaults,
        Arc::new(SystemShellLocator),
        args.force_stop,
        &signals,
        &mut std::io::stdout(),
    )
    .await
}

/// Run `shellgate listen`.
pub async fn run_listen(args: ListenArgs) -> Result<(), CliError> {
    let spec = args.to_spec();
    let defaults = load_defaults()?;
    let signals = ShutdownSignals::install();
    run_servers(
        &process_registry(),
        std::slice::from_ref(&spec),
        &defaults,
        Arc::new(SystemShellLocator),
        args.force_stop,
        &signals,
        &mut std::io::stdout(),
    )
    .await
}

fn load_defaults() -> Result<ProxyDefaults, CliError> {
    let defaults = ProxyDefaults::from_env();
    defaults.validate().map_err(CliError::Defaults)?;
    Ok(defaults)
}

/// Start every spec, report, wait for `signals`, then stop all servers.
///
/// Start is all-or-nothing: if one server fails, those already started are
/// force-stopped before the error is returned.
pub async fn run_servers<W: Write>(
    registry: &Arc<ServerRegistry>,
    specs: &[ServerSpec],
    defaults: &ProxyDefaults,
    locator: Arc<dyn ShellLocator>,
    force_stop: bool,
    signals: &ShutdownSignals,
    out: &mut W,
) -> Result<(), CliError> {
    for (index, spec) in specs.iter().enumerate() {
        match start_server(registry, spec, defaults, Arc::clone(&locator)).await {
            Ok(server) => {
                let config = server.config();
                debug!(
                    server = server.name(),
                    max_connections = config.max_connections,
                    drain_timeout_secs = config.drain_timeout.as_secs(),
                    stderr = ?config.stderr,
                    "Server configuration"
                );
                report(out, "started", &server)?;
            }
            Err(source) => {
                let name = spec
                    .name
                    .clone()
                    .unwrap_or_else(|| format!("{} server #{}", spec.transport, index + 1));
                warn!(server = %name, error = %source, error_id = source.error_id(), "Server failed to start");
                stop_all(registry, true).await;
                return Err(CliError::Start { name, source });
            }
        }
    }

    let kind = signals.wait().await;
    let force = force_stop || kind == ShutdownKind::Immediate;
    info!(force, "Stopping servers");

    let servers = list_servers(registry);
    let failures = stop_all(registry, force).await;
    for server in &servers {
        report(out, "stopped", server)?;
    }

    if failures.is_empty() {
        Ok(())
    } else {
        Err(CliError::Shutdown {
            count: failures.len(),
        })
    }
}

fn report<W: Write>(out: &mut W, event: &str, server: &ProxyServer) -> Result<(), CliError> {
    let line = json!({ "event": event, "server": server.info() });
    writeln!(out, "{line}")?;
    out.flush()?;
    Ok(())
}
