//! Shared application state: master pool, connection cache, and the tenant
//! services built over them.

use crate::cache::ConnectionCache;
use crate::config::Settings;
use crate::context::TenantResolver;
use crate::credentials::CredentialStore;
use crate::error::AppError;
use crate::lifecycle::TenantService;
use crate::provision::{Provisioner, SchemaStrategy};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub master: PgPool,
    pub settings: Settings,
    pub cache: Arc<ConnectionCache>,
    pub credentials: CredentialStore,
    pub resolver: Arc<TenantResolver>,
    pub tenants: Arc<TenantService>,
}

impl AppState {
    /// Connect to the master database and wire up the tenant services.
    /// Initializes the control-plane credential table.
    pub async fn new(settings: Settings) -> Result<Self, AppError> {
        let master = PgPoolOptions::new()
            .max_connections(settings.tenant_pool_size.max(5))
            .acquire_timeout(settings.connect_timeout)
            .connect(&settings.master_database_url)
            .await?;
        Self::with_pool(master, settings).await
    }

    /// Wire up services over an existing master pool.
    pub async fn with_pool(master: PgPool, settings: Settings) -> Result<Self, AppError> {
        let cache = Arc::new(ConnectionCache::new(
            settings.tenant_pool_size,
            settings.connect_timeout,
        ));
        let credentials = CredentialStore::new(master.clone(), settings.control_schema.clone());
        credentials.ensure_initialized().await?;

        let provisioner = Provisioner::new(
            master.clone(),
            credentials.clone(),
            cache.clone(),
            SchemaStrategy::from_settings(&settings),
            settings.clone(),
        );
        let tenants = Arc::new(TenantService::new(
            master.clone(),
            provisioner,
            credentials.clone(),
        ));
        let resolver = Arc::new(TenantResolver::new(
            master.clone(),
            credentials.clone(),
            cache.clone(),
            settings.master_database_url.clone(),
        ));

        Ok(AppState {
            master,
            settings,
            cache,
            credentials,
            resolver,
            tenants,
        })
    }

    /// Close every tenant pool and the master pool. Call once at process exit.
    pub async fn shutdown(&self) {
        self.cache.disconnect_all().await;
        self.master.close().await;
        tracing::info!("database pools closed");
    }
}
