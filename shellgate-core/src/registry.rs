//! Process-wide index of live servers.
//!
//! Two indices over one server set: by name (case-sensitive) and by
//! [`AddressKey`]. Both live behind a single lock so a registration checks
//! and claims its name and address atomically.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::ProxyError;
use crate::server::ProxyServer;
use crate::transport::AddressKey;

#[derive(Default)]
struct Indices {
    by_name: HashMap<String, Arc<ProxyServer>>,
    by_address: HashMap<AddressKey, Arc<ProxyServer>>,
}

/// Thread-safe registry of running servers.
#[derive(Default)]
pub struct ServerRegistry {
    inner: RwLock<Indices>,
}

impl ServerRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `server`'s name and (if known) address.
    ///
    /// Returns false if either key already maps to a different instance.
    /// Registering the same instance again succeeds without change.
    pub fn register(&self, server: &Arc<ProxyServer>) -> bool {
        let key = server.address_key();
        let mut idx = self.inner.write();

        let taken_by_other =
            |existing: Option<&Arc<ProxyServer>>| existing.is_some_and(|e| !Arc::ptr_eq(e, server));

        if taken_by_other(idx.by_name.get(server.name())) {
            return false;
        }
        if key
            .as_ref()
            .is_some_and(|key| taken_by_other(idx.by_address.get(key)))
        {
            return false;
        }

        idx.by_name
            .insert(server.name().to_string(), Arc::clone(server));
        if let Some(key) = key {
            idx.by_address.insert(key, Arc::clone(server));
        }
        true
    }

    /// Remove every entry pointing at `server`. Entries that now point at a
    /// different instance are left alone. Returns true if anything was
    /// removed.
    pub fn unregister(&self, server: &ProxyServer) -> bool {
        let is_this = |candidate: &Arc<ProxyServer>| std::ptr::eq(Arc::as_ptr(candidate), server);
        let mut idx = self.inner.write();

        let before = idx.by_name.len() + idx.by_address.len();
        if idx.by_name.get(server.name()).is_some_and(is_this) {
            idx.by_name.remove(server.name());
        }
        idx.by_address.retain(|_, candidate| !is_this(candidate));
        before != idx.by_name.len() + idx.by_address.len()
    }

    /// Fail early if `name` or `address` is already claimed.
    pub fn check_available(&self, name: &str, address: Option<&AddressKey>) -> Result<(), ProxyError> {
        let idx = self.inner.read();
        if idx.by_name.contains_key(name) {
            return Err(ProxyError::NameConflict {
                name: name.to_string(),
            });
        }
        match address {
            Some(address) if idx.by_address.contains_key(address) => {
                Err(ProxyError::AddressConflict {
                    address: address.clone(),
                })
            }
            _ => Ok(()),
        }
    }

    #[must_use]
    pub fn lookup_by_name(&self, name: &str) -> Option<Arc<ProxyServer>> {
        self.inner.read().by_name.get(name).cloned()
    }

    #[must_use]
    pub fn lookup_by_address(&self, address: &AddressKey) -> Option<Arc<ProxyServer>> {
        self.inner.read().by_address.get(address).cloned()
    }

    /// Snapshot of all registered servers, sorted by name.
    #[must_use]
    pub fn list_all(&self) -> Vec<Arc<ProxyServer>> {
        let mut servers: Vec<_> = self.inner.read().by_name.values().cloned().collect();
        servers.sort_by(|a, b| a.name().cmp(b.name()));
        servers
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().by_name.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.read().by_name.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::config::{ProxyDefaults, ServerSpec};
    use crate::error::ConnectionError;
    use crate::proxy::spawn::ShellPreference;
    use crate::transport::TransportKind;

    fn no_shell(_: &ShellPreference) -> Result<PathBuf, ConnectionError> {
        Err(ConnectionError::ShellNotFound {
            reason: "unit test".to_string(),
        })
    }

    fn server(registry: &Arc<ServerRegistry>, name: &str, port: u16) -> Arc<ProxyServer> {
        let mut spec = ServerSpec::new(TransportKind::Tcp);
        spec.name = Some(name.to_string());
        spec.port = port;
        let config = spec.validate(&ProxyDefaults::default()).unwrap();
        ProxyServer::new(config, registry, Arc::new(no_shell))
    }

    fn pipe_server(registry: &Arc<ServerRegistry>, name: &str, pipe: &str) -> Arc<ProxyServer> {
        let mut spec = ServerSpec::new(TransportKind::NamedPipe);
        spec.name = Some(name.to_string());
        spec.pipe_name = Some(pipe.to_string());
        let config = spec.validate(&ProxyDefaults::default()).unwrap();
        ProxyServer::new(config, registry, Arc::new(no_shell))
    }

    #[test]
    fn test_register_and_lookup() {
        let registry = Arc::new(ServerRegistry::new());
        let a = server(&registry, "a", 7001);
        assert!(registry.register(&a));

        let by_name = registry.lookup_by_name("a").unwrap();
        assert!(Arc::ptr_eq(&by_name, &a));
        let by_addr = registry.lookup_by_address(&AddressKey::Port(7001)).unwrap();
        assert!(Arc::ptr_eq(&by_addr, &a));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_reregister_same_instance_is_noop() {
        let registry = Arc::new(ServerRegistry::new());
        let a = server(&registry, "a", 7001);
        assert!(registry.register(&a));
        assert!(registry.register(&a));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_name_conflict() {
        let registry = Arc::new(ServerRegistry::new());
        let a = server(&registry, "main", 7001);
        let b = server(&registry, "main", 7002);
        assert!(registry.register(&a));
        assert!(!registry.register(&b));
        assert!(registry.lookup_by_address(&AddressKey::Port(7002)).is_none());
    }

    #[test]
    fn test_names_are_case_sensitive() {
        let registry = Arc::new(ServerRegistry::new());
        assert!(registry.register(&server(&registry, "main", 7001)));
        assert!(registry.register(&server(&registry, "Main", 7002)));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_address_conflict() {
        let registry = Arc::new(ServerRegistry::new());
        let a = server(&registry, "a", 7001);
        let b = server(&registry, "b", 7001);
        assert!(registry.register(&a));
        assert!(!registry.register(&b));
        assert!(registry.lookup_by_name("b").is_none());
    }

    #[test]
    fn test_port_and_pipe_keys_are_separate() {
        let registry = Arc::new(ServerRegistry::new());
        assert!(registry.register(&server(&registry, "tcp", 7001)));
        assert!(registry.register(&pipe_server(&registry, "pipe", "7001")));
    }

    #[test]
    fn test_unregister_only_removes_own_entries() {
        let registry = Arc::new(ServerRegistry::new());
        let a = server(&registry, "a", 7001);
        let impostor = server(&registry, "a", 7001);
        assert!(registry.register(&a));

        assert!(!registry.unregister(&impostor));
        assert!(registry.lookup_by_name("a").is_some());

        assert!(registry.unregister(&a));
        assert!(!registry.unregister(&a));
        assert!(registry.is_empty());
        assert!(registry.lookup_by_address(&AddressKey::Port(7001)).is_none());
    }

    #[test]
    fn test_check_available() {
        let registry = Arc::new(ServerRegistry::new());
        assert!(registry.register(&server(&registry, "a", 7001)));

        assert!(matches!(
            registry.check_available("a", None),
            Err(ProxyError::NameConflict { .. })
        ));
        assert!(matches!(
            registry.check_available("b", Some(&AddressKey::Port(7001))),
            Err(ProxyError::AddressConflict { .. })
        ));
        assert!(registry.check_available("b", Some(&AddressKey::Port(7002))).is_ok());
    }

    #[test]
    fn test_list_all_is_sorted_snapshot() {
        let registry = Arc::new(ServerRegistry::new());
        let c = server(&registry, "c", 7003);
        registry.register(&c);
        registry.register(&server(&registry, "a", 7001));
        registry.register(&server(&registry, "b", 7002));

        let snapshot = registry.list_all();
        registry.unregister(&c);

        let names: Vec<_> = snapshot.iter().map(|s| s.name().to_string()).collect();
        assert_eq!(names, ["a", "b", "c"]);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_concurrent_registration_admits_one() {
        let registry = Arc::new(ServerRegistry::new());
        let candidates: Vec<_> = (0..16).map(|_| server(&registry, "race", 7100)).collect();

        let winners: usize = std::thread::scope(|scope| {
            let handles: Vec<_> = candidates
                .iter()
                .map(|candidate| {
                    let registry = &registry;
                    scope.spawn(move || registry.register(candidate))
                })
                .collect();
            handles
                .into_iter()
                .map(|h| usize::from(h.join().unwrap()))
                .sum()
        });

        assert_eq!(winners, 1);
        assert_eq!(registry.len(), 1);
    }
}
