//! Tenant administration routes: onboarding, inspection, and deletion.

use crate::error::AppError;
use crate::lifecycle::{NewTenant, SafeDeleteOptions, SafeDeleteOutcome, TenantStatus};
use crate::response::{success_many, success_one, success_one_ok};
use crate::state::AppState;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::get,
    routing::post,
    Json, Router,
};
use serde::Deserialize;
use uuid::Uuid;

pub async fn create(
    State(state): State<AppState>,
    Json(body): Json<NewTenant>,
) -> Result<impl axum::response::IntoResponse, AppError> {
    let record = state.tenants.create_tenant(body).await?;
    Ok(success_one(record))
}

pub async fn list(
    State(state): State<AppState>,
) -> Result<impl axum::response::IntoResponse, AppError> {
    let records = state.tenants.list_tenants().await?;
    Ok(success_many(records))
}

pub async fn get_one(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl axum::response::IntoResponse, AppError> {
    let record = state.tenants.get_tenant(id).await?;
    Ok(success_one_ok(record))
}

pub async fn status(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl axum::response::IntoResponse, AppError> {
    let report = state.tenants.get_tenant_status(id).await?;
    Ok(success_one_ok(report))
}

#[derive(Deserialize)]
pub struct UpdateStatusBody {
    pub status: TenantStatus,
}

pub async fn update_status(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<UpdateStatusBody>,
) -> Result<impl axum::response::IntoResponse, AppError> {
    let users_updated = state.tenants.update_tenant_status(id, body.status).await?;
    Ok(success_one_ok(serde_json::json!({
        "status": body.status,
        "users_updated": users_updated
    })))
}

pub async fn delete(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(opts): Query<SafeDeleteOptions>,
) -> Result<impl axum::response::IntoResponse, AppError> {
    let outcome = state.tenants.delete_tenant_safe(id, opts).await?;
    let code = match &outcome {
        SafeDeleteOutcome::Refused { .. } => StatusCode::CONFLICT,
        _ => StatusCode::OK,
    };
    Ok((code, Json(outcome)))
}

pub async fn preview(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl axum::response::IntoResponse, AppError> {
    let report = state.tenants.preview_tenant_deletion(id).await?;
    Ok(success_one_ok(report))
}

pub async fn schema(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl axum::response::IntoResponse, AppError> {
    let report = state.tenants.verify_tenant_schema(id).await?;
    Ok(success_one_ok(report))
}

pub async fn init_schema(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl axum::response::IntoResponse, AppError> {
    state.tenants.initialize_tenant_schema(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn connection(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl axum::response::IntoResponse, AppError> {
    let details = state.tenants.get_tenant_connection_details(id).await?;
    Ok(success_one_ok(details))
}

pub async fn permissions(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl axum::response::IntoResponse, AppError> {
    let report = state.tenants.test_tenant_permissions(id).await?;
    Ok(success_one_ok(report))
}

/// Tenant administration router. Every route is control-plane-forced; the
/// `/api/tenants` prefix is also on the resolver's reserved list.
pub fn tenant_routes(state: AppState) -> Router {
    Router::new()
        .route("/tenants", post(create).get(list))
        .route("/tenants/:id", get(get_one).delete(delete))
        .route("/tenants/:id/status", get(status).put(update_status))
        .route("/tenants/:id/schema", get(schema).post(init_schema))
        .route("/tenants/:id/deletion-preview", get(preview))
        .route("/tenants/:id/connection", get(connection))
        .route("/tenants/:id/permissions", get(permissions))
        .route_layer(crate::middleware::force_control_plane())
        .with_state(state)
}
