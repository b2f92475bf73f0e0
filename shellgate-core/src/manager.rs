//! Entry points used by front ends to start, stop and find servers.

use std::sync::Arc;

use tracing::warn;

use crate::config::{ProxyDefaults, ServerSpec};
use crate::error::ProxyError;
use crate::proxy::spawn::ShellLocator;
use crate::registry::ServerRegistry;
use crate::server::ProxyServer;
use crate::transport::AddressKey;

/// How a caller identifies a server.
#[derive(Debug, Clone)]
pub enum ServerSelector {
    Name(String),
    Address(AddressKey),
    /// A server object the caller already holds, registered or not.
    Instance(Arc<ProxyServer>),
}

/// Validate `spec`, create the server and start it.
///
/// Configuration errors and name/address conflicts known up front are
/// reported before anything is bound.
pub async fn start_server(
    registry: &Arc<ServerRegistry>,
    spec: &ServerSpec,
    defaults: &ProxyDefaults,
    locator: Arc<dyn ShellLocator>,
) -> Result<Arc<ProxyServer>, ProxyError> {
    let config = spec.validate(defaults)?;
    registry.check_available(&config.name, config.endpoint.requested_key().as_ref())?;

    let server = ProxyServer::new(config, registry, locator);
    server.start().await?;
    Ok(server)
}

/// Resolve a selector to a server.
pub fn get_server(
    registry: &ServerRegistry,
    selector: &ServerSelector,
) -> Result<Arc<ProxyServer>, ProxyError> {
    match selector {
        ServerSelector::Name(name) => {
            registry
                .lookup_by_name(name)
                .ok_or_else(|| ProxyError::NotFoundByName { name: name.clone() })
        }
        ServerSelector::Address(address) => {
            registry
                .lookup_by_address(address)
                .ok_or_else(|| ProxyError::NotFoundByAddress {
                    address: address.clone(),
                })
        }
        ServerSelector::Instance(server) => Ok(Arc::clone(server)),
    }
}

/// Snapshot of every registered server, sorted by name.
pub fn list_servers(registry: &ServerRegistry) -> Vec<Arc<ProxyServer>> {
    registry.list_all()
}

/// Stop the selected server. `force` skips the drain wait.
pub async fn stop_server(
    registry: &ServerRegistry,
    selector: &ServerSelector,
    force: bool,
) -> Result<(), ProxyError> {
    let server = get_server(registry, selector)?;
    server.stop(force).await
}

/// Stop every registered server concurrently. Returns the failures.
pub async fn stop_all(registry: &ServerRegistry, force: bool) -> Vec<(String, ProxyError)> {
    let servers = registry.list_all();
    let results = futures_util::future::join_all(servers.iter().map(|s| s.stop(force))).await;

    servers
        .iter()
        .zip(results)
        .filter_map(|(server, result)| {
            result.err().map(|e| {
                warn!(server = server.name(), error = %e, "failed to stop server");
                (server.name().to_string(), e)
            })
        })
        .collect()
}
