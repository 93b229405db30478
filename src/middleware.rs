//! Request plumbing: caller-identity headers, the control-plane forcing
//! marker, and the tenant database extractor.
//!
//! The auth layer upstream resolves tokens/sessions and hands identity in as
//! headers; this module only reads them.

use crate::context::{CallerIdentity, RequestContext};
use crate::error::AppError;
use crate::state::AppState;
use async_trait::async_trait;
use axum::{extract::FromRequestParts, http::request::Parts, Extension};
use sqlx::PgPool;
use uuid::Uuid;

pub const USER_ID_HEADER: &str = "X-User-Id";
pub const TENANT_ID_HEADER: &str = "X-Tenant-Id";
pub const USER_ROLE_HEADER: &str = "X-User-Role";

/// Extractor for the optional, already-resolved caller identity. Absent
/// headers mean an anonymous call; present-but-malformed ids are rejected.
#[derive(Clone, Debug)]
pub struct Caller(pub Option<CallerIdentity>);

fn header<'a>(parts: &'a Parts, name: &str) -> Option<&'a str> {
    parts
        .headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

fn parse_uuid_header(parts: &Parts, name: &str) -> Result<Option<Uuid>, AppError> {
    header(parts, name)
        .map(|s| {
            Uuid::parse_str(s)
                .map_err(|_| AppError::BadRequest(format!("{} must be a UUID", name)))
        })
        .transpose()
}

#[async_trait]
impl<S> FromRequestParts<S> for Caller
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let user_id = parse_uuid_header(parts, USER_ID_HEADER)?;
        let tenant_id = parse_uuid_header(parts, TENANT_ID_HEADER)?;
        let caller = match (user_id, tenant_id) {
            (Some(user_id), Some(tenant_id)) => Some(CallerIdentity {
                user_id,
                tenant_id,
                role: header(parts, USER_ROLE_HEADER).unwrap_or("user").to_string(),
            }),
            _ => None,
        };
        Ok(Caller(caller))
    }
}

/// Route-level marker: requests through routes carrying this extension always
/// use the control-plane database, whatever the caller's tenant.
#[derive(Clone, Copy, Debug, Default)]
pub struct ForceControlPlane;

/// Layer to attach to tenant-management/auth/health routers:
/// `router.route_layer(force_control_plane())`.
pub fn force_control_plane() -> Extension<ForceControlPlane> {
    Extension(ForceControlPlane)
}

/// Build the per-request routing context from extracted parts.
fn request_context(parts: &Parts, caller: Option<CallerIdentity>) -> RequestContext {
    RequestContext {
        caller,
        force_control_plane: parts.extensions.get::<ForceControlPlane>().is_some(),
        path: parts.uri.path().to_string(),
    }
}

/// The exposed contract: "give me a database handle appropriate for this
/// request". Resolves to the caller's tenant pool or the control plane.
pub struct TenantDb(pub PgPool);

#[async_trait]
impl FromRequestParts<AppState> for TenantDb {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let Caller(caller) = Caller::from_request_parts(parts, state).await?;
        let ctx = request_context(parts, caller);
        Ok(TenantDb(state.resolver.connection(&ctx).await))
    }
}

/// Diagnostic extractor exposing the routing decision without credentials.
pub struct Routing(pub crate::context::RoutingInfo);

#[async_trait]
impl FromRequestParts<AppState> for Routing {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let Caller(caller) = Caller::from_request_parts(parts, state).await?;
        let ctx = request_context(parts, caller);
        Ok(Routing(state.resolver.info(&ctx)))
    }
}
