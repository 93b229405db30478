//! Demo server: provisions the control plane, mounts common and tenant-admin
//! routes, and routes business requests to tenant databases via `TenantDb`.

use axum::{routing::get, Json, Router};
use pgtenant::middleware::Routing;
use pgtenant::{
    bootstrap_master_schema, common_routes, ensure_database_exists, tenant_routes, AppState,
    Settings, TenantDb,
};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("pgtenant=info".parse()?))
        .init();

    let settings = Settings::from_env()?;
    ensure_database_exists(&settings.master_database_url).await?;
    let state = AppState::new(settings).await?;
    bootstrap_master_schema(&state.master).await?;

    let api = Router::new()
        .merge(common_routes(state.clone()))
        .nest("/api", tenant_routes(state.clone()))
        .route("/api/sales", get(list_sales).with_state(state.clone()))
        .route("/api/routing", get(routing_info).with_state(state.clone()))
        .layer(tower_http::trace::TraceLayer::new_for_http());

    let listener = TcpListener::bind("0.0.0.0:3000").await?;
    tracing::info!("listening on {}", listener.local_addr()?);
    axum::serve(listener, api).await?;

    state.shutdown().await;
    Ok(())
}

/// Example business handler: the extractor hands back the caller's tenant
/// pool (or the control plane for anonymous callers).
async fn list_sales(TenantDb(pool): TenantDb) -> Result<Json<serde_json::Value>, pgtenant::AppError> {
    let count: (i64,) = sqlx::query_as("SELECT count(*) FROM sales")
        .fetch_one(&pool)
        .await?;
    Ok(Json(serde_json::json!({ "sales": count.0 })))
}

/// Where would this request be routed? Diagnostics only, no credentials.
async fn routing_info(Routing(info): Routing) -> Json<pgtenant::context::RoutingInfo> {
    Json(info)
}
