//! Integration tests against a live PostgreSQL server.
//!
//! Set `PGTENANT_TEST_DATABASE_URL` to a URL whose role may CREATE DATABASE
//! and CREATE ROLE (e.g. the default `postgres` superuser of a disposable
//! server). Every test is skipped when the variable is unset, so plain
//! `cargo test` passes without infrastructure.

use pgtenant::error::AppError;
use pgtenant::lifecycle::{NewTenant, SafeDeleteOptions, SafeDeleteOutcome, TenantStatus};
use pgtenant::{bootstrap_master_schema, AppState, Settings};
use uuid::Uuid;

async fn test_state() -> Option<AppState> {
    let url = match std::env::var("PGTENANT_TEST_DATABASE_URL") {
        Ok(url) => url,
        Err(_) => {
            eprintln!("PGTENANT_TEST_DATABASE_URL not set, skipping live test");
            return None;
        }
    };
    let state = AppState::new(Settings::with_master_url(url))
        .await
        .expect("connect to test database");
    bootstrap_master_schema(&state.master)
        .await
        .expect("bootstrap master schema");
    Some(state)
}

fn unique_email(tag: &str) -> String {
    format!("{}+{}@pgtenant.test", tag, Uuid::new_v4().simple())
}

fn new_tenant(name: &str, tag: &str) -> NewTenant {
    NewTenant {
        name: name.to_string(),
        email: unique_email(tag),
        phone: None,
        admin_user: None,
    }
}

async fn insert_control_plane_user(state: &AppState, tenant_id: Uuid) -> Uuid {
    let user_id = Uuid::new_v4();
    sqlx::query("INSERT INTO users (id, client_id, email, name) VALUES ($1, $2, $3, $4)")
        .bind(user_id)
        .bind(tenant_id)
        .bind(unique_email("user"))
        .bind("Test User")
        .execute(&state.master)
        .await
        .expect("insert user");
    user_id
}

#[tokio::test]
async fn credential_store_initialization_is_idempotent() {
    let Some(state) = test_state().await else { return };
    let store = state.credentials.clone();
    let (a, b) = tokio::join!(store.ensure_initialized(), store.ensure_initialized());
    a.expect("first init");
    b.expect("concurrent init");

    let tenant_id = Uuid::new_v4();
    assert!(store.get(tenant_id).await.expect("get").is_none());
    // remove of an absent row is not an error
    store.remove(tenant_id).await.expect("remove absent");
    state.shutdown().await;
}

#[tokio::test]
async fn end_to_end_tenant_lifecycle() {
    let Some(state) = test_state().await else { return };

    let record = state
        .tenants
        .create_tenant(new_tenant("Acme", "acme"))
        .await
        .expect("create tenant");
    assert_eq!(record.status, TenantStatus::Active);
    let database_name = record.database_name.clone().expect("database name set");
    assert!(database_name.starts_with("client_"));

    let schema = state
        .tenants
        .verify_tenant_schema(record.id)
        .await
        .expect("verify schema");
    assert!(schema.has_schema);
    assert!(schema.table_count > 0);
    assert!(schema.tables.iter().any(|t| t == "clients"));

    let status = state.tenants.get_tenant_status(record.id).await.expect("status");
    assert_eq!(status.database.status, "connected");

    let permissions = state
        .tenants
        .test_tenant_permissions(record.id)
        .await
        .expect("permissions");
    assert!(permissions.can_create_tables);
    assert!(permissions.schema_privileges.contains(&"USAGE".to_string()));

    state.tenants.delete_tenant(record.id).await.expect("delete tenant");

    let err = state.tenants.get_tenant(record.id).await.expect_err("tenant gone");
    assert!(matches!(err, AppError::NotFound(_)));
    let after = state.tenants.get_tenant_status(record.id).await;
    assert!(after.is_err(), "status lookup for a deleted tenant is NotFound");

    let exists: (bool,) =
        sqlx::query_as("SELECT EXISTS(SELECT 1 FROM pg_database WHERE datname = $1)")
            .bind(&database_name)
            .fetch_one(&state.master)
            .await
            .expect("pg_database check");
    assert!(!exists.0, "tenant database still exists after delete");
    state.shutdown().await;
}

#[tokio::test]
async fn safe_delete_refuses_without_force_and_deletes_nothing() {
    let Some(state) = test_state().await else { return };

    let record = state
        .tenants
        .create_tenant(new_tenant("Guarded", "guarded"))
        .await
        .expect("create tenant");
    let user_id = insert_control_plane_user(&state, record.id).await;

    let outcome = state
        .tenants
        .delete_tenant_safe(record.id, SafeDeleteOptions::default())
        .await
        .expect("safe delete");
    match outcome {
        SafeDeleteOutcome::Refused { users, stores, products } => {
            assert_eq!(users, 1);
            assert_eq!(stores, 0);
            assert_eq!(products, 0);
        }
        other => panic!("expected refusal, got {:?}", other),
    }

    // Nothing was deleted: the user row and the tenant are still there.
    let still_there: (bool,) = sqlx::query_as("SELECT EXISTS(SELECT 1 FROM users WHERE id = $1)")
        .bind(user_id)
        .fetch_one(&state.master)
        .await
        .expect("user check");
    assert!(still_there.0);
    state.tenants.get_tenant(record.id).await.expect("tenant still present");

    let forced = state
        .tenants
        .delete_tenant_safe(
            record.id,
            SafeDeleteOptions {
                force: true,
                soft_delete: false,
            },
        )
        .await
        .expect("forced delete");
    assert!(matches!(forced, SafeDeleteOutcome::Deleted));
    state.shutdown().await;
}

#[tokio::test]
async fn status_update_cascades_to_every_user() {
    let Some(state) = test_state().await else { return };

    let record = state
        .tenants
        .create_tenant(new_tenant("Cascade", "cascade"))
        .await
        .expect("create tenant");
    for _ in 0..3 {
        insert_control_plane_user(&state, record.id).await;
    }

    let touched = state
        .tenants
        .update_tenant_status(record.id, TenantStatus::Inactive)
        .await
        .expect("status cascade");
    assert_eq!(touched, 3);

    let tenant = state.tenants.get_tenant(record.id).await.expect("get tenant");
    assert_eq!(tenant.status, TenantStatus::Inactive);
    let inactive: (i64,) = sqlx::query_as(
        "SELECT count(*) FROM users WHERE client_id = $1 AND status = 'inactive'",
    )
    .bind(record.id)
    .fetch_one(&state.master)
    .await
    .expect("count inactive");
    assert_eq!(inactive.0, 3);

    let soft = state
        .tenants
        .delete_tenant_safe(
            record.id,
            SafeDeleteOptions {
                soft_delete: true,
                force: false,
            },
        )
        .await
        .expect("soft delete");
    assert!(matches!(soft, SafeDeleteOutcome::SoftDeleted { users_deactivated: 3 }));

    state
        .tenants
        .delete_tenant_safe(
            record.id,
            SafeDeleteOptions {
                force: true,
                soft_delete: false,
            },
        )
        .await
        .expect("cleanup");
    state.shutdown().await;
}

#[tokio::test]
async fn cascading_delete_leaves_no_referencing_rows() {
    let Some(state) = test_state().await else { return };

    let record = state
        .tenants
        .create_tenant(new_tenant("Purge", "purge"))
        .await
        .expect("create tenant");
    let tenant_id = record.id;
    let user_id = insert_control_plane_user(&state, tenant_id).await;

    let store_id = Uuid::new_v4();
    sqlx::query("INSERT INTO stores (id, client_id, name) VALUES ($1, $2, 'Main')")
        .bind(store_id)
        .bind(tenant_id)
        .execute(&state.master)
        .await
        .expect("insert store");
    let sale_id = Uuid::new_v4();
    sqlx::query("INSERT INTO sales (id, store_id, user_id, total) VALUES ($1, $2, $3, 42)")
        .bind(sale_id)
        .bind(store_id)
        .bind(user_id)
        .execute(&state.master)
        .await
        .expect("insert sale");
    sqlx::query("INSERT INTO audit_logs (id, user_id, action) VALUES ($1, $2, 'login')")
        .bind(Uuid::new_v4())
        .bind(user_id)
        .execute(&state.master)
        .await
        .expect("insert audit log");

    let preview = state
        .tenants
        .preview_tenant_deletion(tenant_id)
        .await
        .expect("preview");
    assert!(preview.can_delete);
    assert!(preview
        .data_to_delete
        .iter()
        .any(|c| c.table == "sales" && c.rows == 1));

    state.tenants.delete_tenant(tenant_id).await.expect("delete tenant");

    for (table, column) in [
        ("users", "client_id"),
        ("stores", "client_id"),
        ("clients", "id"),
    ] {
        let count: (i64,) =
            sqlx::query_as(&format!("SELECT count(*) FROM {} WHERE {} = $1", table, column))
                .bind(tenant_id)
                .fetch_one(&state.master)
                .await
                .expect("residual count");
        assert_eq!(count.0, 0, "{} still references the tenant", table);
    }
    for (table, id) in [("sales", sale_id), ("audit_logs", user_id)] {
        let sql = if table == "sales" {
            "SELECT count(*) FROM sales WHERE id = $1".to_string()
        } else {
            "SELECT count(*) FROM audit_logs WHERE user_id = $1".to_string()
        };
        let count: (i64,) = sqlx::query_as(&sql)
            .bind(id)
            .fetch_one(&state.master)
            .await
            .expect("residual count");
        assert_eq!(count.0, 0, "{} rows survived the cascade", table);
    }
    state.shutdown().await;
}
