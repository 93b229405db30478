//! Per-request routing between the control-plane and tenant databases.
//!
//! The decision is re-derived on every call; nothing here is cached across
//! requests, since caller identity varies per request.

use crate::cache::ConnectionCache;
use crate::credentials::CredentialStore;
use crate::error::AppError;
use crate::ident::{compose_database_url, redact_url};
use serde::Serialize;
use sqlx::postgres::PgConnectOptions;
use sqlx::PgPool;
use std::str::FromStr;
use std::sync::Arc;
use uuid::Uuid;

/// Already-resolved caller identity, handed in by the auth layer. The core
/// never parses tokens or sessions.
#[derive(Clone, Debug)]
pub struct CallerIdentity {
    pub user_id: Uuid,
    pub tenant_id: Uuid,
    pub role: String,
}

/// Ephemeral per-request inputs to the routing decision.
#[derive(Clone, Debug, Default)]
pub struct RequestContext {
    pub caller: Option<CallerIdentity>,
    pub force_control_plane: bool,
    pub path: String,
}

/// Path prefixes that always use the control plane: tenant administration,
/// auth, health, and API docs.
pub const RESERVED_PREFIXES: &[&str] = &[
    "/api/tenants",
    "/api/auth",
    "/health",
    "/ready",
    "/version",
    "/docs",
];

fn path_is_reserved(path: &str) -> bool {
    RESERVED_PREFIXES.iter().any(|p| {
        path == *p || path.starts_with(&format!("{}/", p))
    })
}

impl RequestContext {
    /// Decision rule, in priority order: reserved path, explicit force flag,
    /// then absence of an authenticated caller. Anything else routes to the
    /// caller's tenant database.
    pub fn uses_control_plane(&self) -> bool {
        path_is_reserved(&self.path) || self.force_control_plane || self.caller.is_none()
    }

    pub fn tenant_id(&self) -> Option<Uuid> {
        self.caller.as_ref().map(|c| c.tenant_id)
    }
}

/// Resolved routing decision for diagnostics. Never carries credentials.
#[derive(Clone, Debug, Serialize)]
pub struct RoutingInfo {
    pub tenant_id: Option<Uuid>,
    pub using_control_plane: bool,
}

/// Resolves a request context to a database handle.
#[derive(Clone)]
pub struct TenantResolver {
    master: PgPool,
    credentials: CredentialStore,
    cache: Arc<ConnectionCache>,
    master_url: String,
}

impl TenantResolver {
    pub fn new(
        master: PgPool,
        credentials: CredentialStore,
        cache: Arc<ConnectionCache>,
        master_url: impl Into<String>,
    ) -> Self {
        TenantResolver {
            master,
            credentials,
            cache,
            master_url: master_url.into(),
        }
    }

    /// Database handle for this request. Tenant routing failures (missing
    /// credentials, unreadable store, malformed URL) fall back to the control
    /// plane with a warning; a request is never blocked on tenant lookup.
    pub async fn connection(&self, ctx: &RequestContext) -> PgPool {
        if ctx.uses_control_plane() {
            return self.master.clone();
        }
        // uses_control_plane() is false, so a caller is present.
        let Some(tenant_id) = ctx.tenant_id() else {
            return self.master.clone();
        };
        match self.tenant_options(tenant_id).await {
            Ok(Some(options)) => self.cache.get_or_create(tenant_id, options),
            Ok(None) => {
                tracing::warn!(%tenant_id, "no stored credentials for tenant, using control plane");
                self.master.clone()
            }
            Err(e) => {
                tracing::warn!(%tenant_id, error = %e, "tenant resolution failed, using control plane");
                self.master.clone()
            }
        }
    }

    /// The routing decision without materializing a pool.
    pub fn info(&self, ctx: &RequestContext) -> RoutingInfo {
        let using_control_plane = ctx.uses_control_plane();
        RoutingInfo {
            tenant_id: ctx.tenant_id().filter(|_| !using_control_plane),
            using_control_plane,
        }
    }

    async fn tenant_options(
        &self,
        tenant_id: Uuid,
    ) -> Result<Option<PgConnectOptions>, AppError> {
        let Some(cred) = self.credentials.get(tenant_id).await? else {
            return Ok(None);
        };
        let url = compose_database_url(
            &self.master_url,
            &cred.database_name,
            &cred.username,
            &cred.password,
        )?;
        tracing::debug!(%tenant_id, url = %redact_url(&url), "routing request to tenant database");
        Ok(Some(PgConnectOptions::from_str(&url).map_err(|e| {
            AppError::BadRequest(format!("invalid tenant database URL: {}", e))
        })?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caller(tenant_id: Uuid) -> CallerIdentity {
        CallerIdentity {
            user_id: Uuid::new_v4(),
            tenant_id,
            role: "admin".into(),
        }
    }

    #[test]
    fn reserved_paths_use_control_plane() {
        for path in [
            "/api/tenants",
            "/api/tenants/123/status",
            "/api/auth/login",
            "/health",
            "/docs/openapi.json",
        ] {
            let ctx = RequestContext {
                caller: Some(caller(Uuid::new_v4())),
                force_control_plane: false,
                path: path.into(),
            };
            assert!(ctx.uses_control_plane(), "{path} should be control-plane");
        }
    }

    #[test]
    fn prefix_match_is_segment_aware() {
        let ctx = RequestContext {
            caller: Some(caller(Uuid::new_v4())),
            force_control_plane: false,
            path: "/api/tenantsummary".into(),
        };
        assert!(!ctx.uses_control_plane());
    }

    #[test]
    fn force_flag_wins_over_tenant_caller() {
        let ctx = RequestContext {
            caller: Some(caller(Uuid::new_v4())),
            force_control_plane: true,
            path: "/api/sales".into(),
        };
        assert!(ctx.uses_control_plane());
    }

    #[test]
    fn anonymous_requests_use_control_plane() {
        let ctx = RequestContext {
            caller: None,
            force_control_plane: false,
            path: "/api/sales".into(),
        };
        assert!(ctx.uses_control_plane());
    }

    #[test]
    fn authenticated_non_reserved_path_uses_tenant() {
        let tenant_id = Uuid::new_v4();
        let ctx = RequestContext {
            caller: Some(caller(tenant_id)),
            force_control_plane: false,
            path: "/api/sales".into(),
        };
        assert!(!ctx.uses_control_plane());
        assert_eq!(ctx.tenant_id(), Some(tenant_id));
    }
}
