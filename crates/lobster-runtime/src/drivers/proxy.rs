use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use lobster_core::error::Result;

/// One tenant route as the proxy sees it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    /// Tenant name, doubles as the route id inside the proxy config.
    pub name: String,
    /// Public hostname, `<name>.<domain>`.
    pub host: String,
    /// Loopback port of the tenant's in-VM gateway.
    pub upstream_port: u16,
}

/// Reverse-proxy backend contract.
///
/// This process is the single writer of the proxy's tenant routes; the
/// reconciler re-runs these, so `remove_route` tolerates absence and
/// `add_route` replaces an existing route for the same name.
#[async_trait]
pub trait ProxyDriver: Send + Sync {
    /// Install (or replace) the route for a tenant.
    async fn add_route(&self, name: &str, host: &str, upstream_port: u16) -> Result<()>;

    /// Remove a tenant's route. Removing a missing route is success.
    async fn remove_route(&self, name: &str) -> Result<()>;

    /// All tenant routes currently installed.
    async fn list_routes(&self) -> Result<Vec<Route>>;

    /// Load the base proxy config (server skeleton the routes live in).
    async fn write_base_config(&self) -> Result<()>;

    /// Whether the proxy is up and answering.
    async fn healthy(&self) -> bool;
}

#[cfg(any(test, feature = "testing"))]
pub mod testing {
    //! In-memory driver for lifecycle, reconciler, and watchdog tests.

    use super::*;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct MemProxy {
        pub routes: Mutex<BTreeMap<String, Route>>,
    }

    #[async_trait]
    impl ProxyDriver for MemProxy {
        async fn add_route(&self, name: &str, host: &str, upstream_port: u16) -> Result<()> {
            self.routes.lock().unwrap().insert(
                name.to_string(),
                Route {
                    name: name.to_string(),
                    host: host.to_string(),
                    upstream_port,
                },
            );
            Ok(())
        }

        async fn remove_route(&self, name: &str) -> Result<()> {
            self.routes.lock().unwrap().remove(name);
            Ok(())
        }

        async fn list_routes(&self) -> Result<Vec<Route>> {
            Ok(self.routes.lock().unwrap().values().cloned().collect())
        }

        async fn write_base_config(&self) -> Result<()> {
            Ok(())
        }

        async fn healthy(&self) -> bool {
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::MemProxy;
    use super::*;

    #[tokio::test]
    async fn test_mem_proxy_add_list_remove() {
        let p = MemProxy::default();
        p.add_route("alice", "alice.lobster.local", 9000).await.unwrap();
        assert_eq!(p.list_routes().await.unwrap().len(), 1);
        p.remove_route("alice").await.unwrap();
        p.remove_route("alice").await.unwrap(); // idempotent
        assert!(p.list_routes().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_mem_proxy_add_replaces() {
        let p = MemProxy::default();
        p.add_route("alice", "alice.lobster.local", 9000).await.unwrap();
        p.add_route("alice", "alice.lobster.local", 9005).await.unwrap();
        let routes = p.list_routes().await.unwrap();
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].upstream_port, 9005);
    }
}
