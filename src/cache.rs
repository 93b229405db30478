//! Process-wide cache of per-tenant connection pools.
//!
//! One lazily created `PgPool` per tenant id for the process lifetime. Pools
//! are constructed with `connect_lazy_with`, which is synchronous, so the map
//! lock is never held across an await and concurrent first access for the same
//! tenant cannot create two pools.

use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;
use uuid::Uuid;

pub struct ConnectionCache {
    pools: RwLock<HashMap<Uuid, PgPool>>,
    pool_size: u32,
    acquire_timeout: Duration,
}

impl ConnectionCache {
    pub fn new(pool_size: u32, acquire_timeout: Duration) -> Self {
        ConnectionCache {
            pools: RwLock::new(HashMap::new()),
            pool_size,
            acquire_timeout,
        }
    }

    /// Cached pool for the tenant, or a new lazy pool built from `options`.
    /// First writer wins under concurrent first access; every caller gets a
    /// clone of the same pool.
    pub fn get_or_create(&self, tenant_id: Uuid, options: PgConnectOptions) -> PgPool {
        if let Some(pool) = read_lock(&self.pools).get(&tenant_id) {
            return pool.clone();
        }
        let mut pools = write_lock(&self.pools);
        if let Some(pool) = pools.get(&tenant_id) {
            return pool.clone();
        }
        let pool = PgPoolOptions::new()
            .max_connections(self.pool_size)
            .acquire_timeout(self.acquire_timeout)
            .connect_lazy_with(options);
        pools.insert(tenant_id, pool.clone());
        tracing::debug!(%tenant_id, "created tenant connection pool");
        pool
    }

    pub fn get(&self, tenant_id: Uuid) -> Option<PgPool> {
        read_lock(&self.pools).get(&tenant_id).cloned()
    }

    /// Evict and close the tenant's pool, if cached. Used on tenant teardown.
    pub async fn remove(&self, tenant_id: Uuid) {
        let pool = write_lock(&self.pools).remove(&tenant_id);
        if let Some(pool) = pool {
            pool.close().await;
            tracing::debug!(%tenant_id, "closed tenant connection pool");
        }
    }

    /// Close every cached pool and clear the map. Graceful shutdown only.
    pub async fn disconnect_all(&self) {
        let pools: Vec<(Uuid, PgPool)> = write_lock(&self.pools).drain().collect();
        for (tenant_id, pool) in pools {
            pool.close().await;
            tracing::debug!(%tenant_id, "closed tenant connection pool");
        }
    }

    pub fn len(&self) -> usize {
        read_lock(&self.pools).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn read_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|e| e.into_inner())
}

fn write_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;
    use std::sync::Arc;

    fn options() -> PgConnectOptions {
        PgConnectOptions::from_str("postgres://user_t:pw@localhost:5432/client_t_db")
            .expect("static url")
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn concurrent_first_access_creates_one_pool() {
        let cache = Arc::new(ConnectionCache::new(5, Duration::from_secs(5)));
        let tenant_id = Uuid::new_v4();
        let barrier = Arc::new(tokio::sync::Barrier::new(16));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let cache = cache.clone();
            let barrier = barrier.clone();
            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                cache.get_or_create(tenant_id, options());
            }));
        }
        for h in handles {
            h.await.expect("task");
        }
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn pools_are_keyed_by_tenant() {
        let cache = ConnectionCache::new(5, Duration::from_secs(5));
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        cache.get_or_create(a, options());
        cache.get_or_create(a, options());
        cache.get_or_create(b, options());
        assert_eq!(cache.len(), 2);
        assert!(cache.get(a).is_some());
        assert!(cache.get(Uuid::new_v4()).is_none());
    }

    #[tokio::test]
    async fn remove_and_disconnect_all_clear_entries() {
        let cache = ConnectionCache::new(5, Duration::from_secs(5));
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        cache.get_or_create(a, options());
        cache.get_or_create(b, options());
        cache.remove(a).await;
        assert_eq!(cache.len(), 1);
        cache.disconnect_all().await;
        assert!(cache.is_empty());
    }
}
