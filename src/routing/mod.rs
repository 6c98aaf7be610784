//! Proxy-IP routing: the pool of allocations and the listener bindings.

/// Per-proxy-IP listener set management.
pub mod listeners;

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use uuid::Uuid;

use crate::core::errors::GatewayError;
use crate::store::{Backend, SqliteStore};

pub use listeners::{ConnHandler, ListenerSet, SuspendHandle};

/// How long a cached routing snapshot may serve before re-reading the
/// store. Writer commits invalidate eagerly; the TTL is the backstop for
/// bindings changed by another process (the CLI).
const CACHE_TTL: Duration = Duration::from_secs(5);

#[derive(Debug, Default)]
struct Cache {
    routes: HashMap<IpAddr, Backend>,
    refreshed_at: Option<Instant>,
}

/// The proxy-IP → backend routing table.
///
/// `resolve` is an O(1) in-memory lookup over the active allocation set;
/// `bind` and `release` write through the store and swap the cache
/// atomically.
pub struct RoutingTable {
    store: Arc<SqliteStore>,
    cache: RwLock<Cache>,
}

impl std::fmt::Debug for RoutingTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoutingTable").finish_non_exhaustive()
    }
}

impl RoutingTable {
    /// Create a table over the store. The first `resolve` populates the
    /// cache.
    #[must_use]
    pub fn new(store: Arc<SqliteStore>) -> Self {
        Self {
            store,
            cache: RwLock::new(Cache::default()),
        }
    }

    /// Resolve a proxy IP to its backend, or `None` when unbound.
    ///
    /// # Errors
    ///
    /// Propagates store errors, including the invariant violation raised
    /// when two active allocations are observed for one IP.
    pub async fn resolve(&self, proxy_ip: IpAddr) -> Result<Option<Backend>, GatewayError> {
        {
            let cache = self.cache.read().await;
            if cache
                .refreshed_at
                .is_some_and(|at| at.elapsed() < CACHE_TTL)
            {
                return Ok(cache.routes.get(&proxy_ip).cloned());
            }
        }

        self.refresh().await?;
        Ok(self.cache.read().await.routes.get(&proxy_ip).cloned())
    }

    /// Every proxy IP with an active allocation, for the listener set.
    ///
    /// # Errors
    ///
    /// Propagates store errors.
    pub async fn proxy_ips(&self) -> Result<Vec<IpAddr>, GatewayError> {
        {
            let cache = self.cache.read().await;
            if cache
                .refreshed_at
                .is_some_and(|at| at.elapsed() < CACHE_TTL)
            {
                return Ok(cache.routes.keys().copied().collect());
            }
        }

        self.refresh().await?;
        Ok(self.cache.read().await.routes.keys().copied().collect())
    }

    /// Bind a proxy IP to a backend and refresh the cache.
    ///
    /// # Errors
    ///
    /// [`GatewayError::Conflict`] if the IP is already bound.
    pub async fn bind(
        &self,
        proxy_ip: IpAddr,
        backend_id: Uuid,
        actor: &str,
    ) -> Result<(), GatewayError> {
        self.store.allocations().bind(proxy_ip, backend_id, actor).await?;
        self.refresh().await
    }

    /// Release a proxy IP binding and refresh the cache.
    ///
    /// # Errors
    ///
    /// [`GatewayError::Conflict`] while stays are active on the IP.
    pub async fn release(&self, proxy_ip: IpAddr, actor: &str) -> Result<(), GatewayError> {
        self.store.allocations().release(proxy_ip, actor).await?;
        self.refresh().await
    }

    /// Drop the cached snapshot; the next read goes to the store.
    pub async fn invalidate(&self) {
        self.cache.write().await.refreshed_at = None;
    }

    async fn refresh(&self) -> Result<(), GatewayError> {
        let allocations = self.store.allocations().active().await?;

        let mut routes = HashMap::with_capacity(allocations.len());
        for allocation in allocations {
            if routes.contains_key(&allocation.proxy_ip) {
                return Err(GatewayError::InvariantViolation {
                    proxy_ip: Some(allocation.proxy_ip),
                    detail: "two active allocations for one proxy IP".to_owned(),
                });
            }
            let Some(backend) = self
                .store
                .directory()
                .backend_by_id(allocation.backend_id)
                .await?
            else {
                return Err(GatewayError::InvariantViolation {
                    proxy_ip: Some(allocation.proxy_ip),
                    detail: format!("allocation references missing backend {}", allocation.backend_id),
                });
            };
            routes.insert(allocation.proxy_ip, backend);
        }

        let mut cache = self.cache.write().await;
        cache.routes = routes;
        cache.refreshed_at = Some(Instant::now());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn fixture() -> (Arc<SqliteStore>, RoutingTable, TempDir) {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let store = Arc::new(
            SqliteStore::new(&dir.path().join("test.db"))
                .await
                .expect("Failed to create store"),
        );
        let table = RoutingTable::new(Arc::clone(&store));
        (store, table, dir)
    }

    #[tokio::test]
    async fn resolve_follows_bind_and_release() {
        let (store, table, _dir) = fixture().await;
        let backend = store
            .directory()
            .create_backend("db-01", "192.0.2.10", None, true, false)
            .await
            .unwrap();

        let ip: IpAddr = "10.0.160.129".parse().unwrap();
        assert!(table.resolve(ip).await.unwrap().is_none());

        table.bind(ip, backend.id, "ops").await.unwrap();
        let routed = table.resolve(ip).await.unwrap().unwrap();
        assert_eq!(routed.id, backend.id);

        table.release(ip, "ops").await.unwrap();
        assert!(table.resolve(ip).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn out_of_band_writes_visible_after_invalidate() {
        let (store, table, _dir) = fixture().await;
        let backend = store
            .directory()
            .create_backend("db-01", "192.0.2.10", None, true, false)
            .await
            .unwrap();
        let ip: IpAddr = "10.0.160.129".parse().unwrap();

        // Populate the cache with the empty table.
        assert!(table.resolve(ip).await.unwrap().is_none());

        // Another process binds directly through the store.
        store.allocations().bind(ip, backend.id, "cli").await.unwrap();

        table.invalidate().await;
        assert!(table.resolve(ip).await.unwrap().is_some());
    }
}
