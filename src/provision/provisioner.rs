//! Tenant database creation, teardown, and introspection.

use crate::cache::ConnectionCache;
use crate::config::Settings;
use crate::credentials::{CredentialStore, TenantCredential};
use crate::error::AppError;
use crate::ident::{
    compose_database_url, escape_literal, generate_password, quote_ident, swap_database,
    tenant_database_name, tenant_role_name, validate_identifier, validate_role_name, PASSWORD_LEN,
};
use crate::provision::SchemaStrategy;
use serde::Serialize;
use sqlx::postgres::PgConnectOptions;
use sqlx::{ConnectOptions, Connection, Executor, PgConnection, PgPool};
use std::str::FromStr;
use std::sync::Arc;
use uuid::Uuid;

/// Mirror "self" client record written into the tenant database.
#[derive(Clone, Debug, serde::Deserialize)]
pub struct ClientSeed {
    pub id: Uuid,
    pub name: String,
    pub email: String,
    pub phone: Option<String>,
}

impl ClientSeed {
    pub fn validate(&self) -> Result<(), AppError> {
        if self.name.trim().is_empty() || self.email.trim().is_empty() {
            return Err(AppError::Validation(
                "client seed requires name and email".into(),
            ));
        }
        Ok(())
    }
}

/// Mirror user record written into the tenant database.
#[derive(Clone, Debug, serde::Deserialize)]
pub struct UserSeed {
    pub id: Uuid,
    pub email: String,
    pub name: String,
    pub role: Option<String>,
    pub password_hash: Option<String>,
}

impl UserSeed {
    pub fn validate(&self) -> Result<(), AppError> {
        if self.name.trim().is_empty() || self.email.trim().is_empty() {
            return Err(AppError::Validation(
                "user seed requires name and email".into(),
            ));
        }
        Ok(())
    }
}

/// Outcome of a connectivity/size check. Failures are reported here, never
/// thrown, so health surfaces stay functional for degraded tenants.
#[derive(Clone, Debug, Serialize)]
pub struct DatabaseStatus {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database_size: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection_count: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl DatabaseStatus {
    fn connected(database_size: i64, connection_count: i64) -> Self {
        DatabaseStatus {
            status: "connected".into(),
            database_size: Some(database_size),
            connection_count: Some(connection_count),
            message: None,
        }
    }

    fn error(message: impl Into<String>) -> Self {
        DatabaseStatus {
            status: "error".into(),
            database_size: None,
            connection_count: None,
            message: Some(message.into()),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct SchemaReport {
    pub has_schema: bool,
    pub table_count: i64,
    pub tables: Vec<String>,
}

#[derive(Clone, Debug, Serialize)]
pub struct PermissionReport {
    pub can_create_tables: bool,
    pub can_create_enums: bool,
    pub schema_privileges: Vec<String>,
}

/// Creates and destroys physical tenant databases and roles, and answers
/// introspection queries about them. All DDL identifiers are derived from the
/// tenant id and allow-list validated before interpolation.
pub struct Provisioner {
    master: PgPool,
    credentials: CredentialStore,
    cache: Arc<ConnectionCache>,
    schema: SchemaStrategy,
    settings: Settings,
}

impl Provisioner {
    pub fn new(
        master: PgPool,
        credentials: CredentialStore,
        cache: Arc<ConnectionCache>,
        schema: SchemaStrategy,
        settings: Settings,
    ) -> Self {
        Provisioner {
            master,
            credentials,
            cache,
            schema,
            settings,
        }
    }

    /// Create the tenant's database and role, grant privileges, persist
    /// credentials, apply the application schema, and seed mirror records.
    /// Returns the database name.
    ///
    /// Failures up to credential persistence roll back whatever was created;
    /// schema application and seeding failures are logged and left for
    /// `initialize_schema` / `ensure_*_record_exists` to repair.
    pub async fn create_tenant_database(
        &self,
        tenant_id: Uuid,
        client_seed: Option<&ClientSeed>,
        user_seed: Option<&UserSeed>,
    ) -> Result<String, AppError> {
        if let Some(seed) = client_seed {
            seed.validate()?;
        }
        if let Some(seed) = user_seed {
            seed.validate()?;
        }
        let database_name = tenant_database_name(tenant_id);
        let role_name = tenant_role_name(tenant_id);
        validate_identifier(&database_name)?;
        validate_role_name(&role_name)?;
        let password = generate_password(PASSWORD_LEN);
        let tenant_url = compose_database_url(
            &self.settings.master_database_url,
            &database_name,
            &role_name,
            &password,
        )?;

        let mut db_created = false;
        let mut role_created = false;
        if let Err(e) = self
            .setup_physical(&database_name, &role_name, &password, &mut db_created, &mut role_created)
            .await
        {
            self.cleanup_partial(tenant_id, &database_name, &role_name, db_created, role_created, false)
                .await;
            return Err(e);
        }

        let cred = TenantCredential {
            tenant_id,
            database_name: database_name.clone(),
            username: role_name.clone(),
            password,
        };
        if let Err(e) = self.credentials.save(&cred).await {
            self.cleanup_partial(tenant_id, &database_name, &role_name, db_created, role_created, false)
                .await;
            return Err(e);
        }

        if let Err(e) = self.schema.apply(&tenant_url).await {
            tracing::error!(%tenant_id, error = %e,
                "schema application failed; tenant database left partially initialized");
        }
        if client_seed.is_some() || user_seed.is_some() {
            if let Err(e) = self
                .seed_mirror_records(&tenant_url, tenant_id, client_seed, user_seed)
                .await
            {
                tracing::error!(%tenant_id, error = %e, "mirror record seeding failed");
            }
        }

        tracing::info!(%tenant_id, database = %database_name, "tenant database provisioned");
        Ok(database_name)
    }

    /// Drop the tenant's database and role and forget its credentials.
    /// Idempotent with respect to already-absent objects.
    pub async fn delete_tenant_database(&self, tenant_id: Uuid) -> Result<(), AppError> {
        let database_name = tenant_database_name(tenant_id);
        let role_name = tenant_role_name(tenant_id);
        validate_identifier(&database_name)?;

        self.cache.remove(tenant_id).await;
        self.terminate_connections(&database_name).await?;
        sqlx::query(&format!("DROP DATABASE IF EXISTS {}", quote_ident(&database_name)))
            .execute(&self.master)
            .await?;
        sqlx::query(&format!("DROP ROLE IF EXISTS {}", quote_ident(&role_name)))
            .execute(&self.master)
            .await?;
        self.credentials.remove(tenant_id).await?;
        tracing::info!(%tenant_id, database = %database_name, "tenant database dropped");
        Ok(())
    }

    /// Connectivity, size, and active-connection count. Connection failures
    /// come back as `status: "error"`.
    pub async fn check_tenant_database_status(&self, tenant_id: Uuid) -> DatabaseStatus {
        let pool = match self.tenant_pool(tenant_id).await {
            Ok(pool) => pool,
            Err(e) => return DatabaseStatus::error(e.to_string()),
        };
        let row: Result<(i64, i64), sqlx::Error> = sqlx::query_as(
            "SELECT pg_database_size(current_database()),
                    (SELECT count(*) FROM pg_stat_activity WHERE datname = current_database())",
        )
        .fetch_one(&pool)
        .await;
        match row {
            Ok((size, connections)) => DatabaseStatus::connected(size, connections),
            Err(e) => DatabaseStatus::error(e.to_string()),
        }
    }

    /// Base-table inventory of the tenant database.
    pub async fn verify_tenant_schema(&self, tenant_id: Uuid) -> Result<SchemaReport, AppError> {
        let pool = self.tenant_pool(tenant_id).await?;
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT table_name FROM information_schema.tables
             WHERE table_schema = 'public' AND table_type = 'BASE TABLE'
             ORDER BY table_name",
        )
        .fetch_all(&pool)
        .await?;
        let tables: Vec<String> = rows.into_iter().map(|(name,)| name).collect();
        Ok(SchemaReport {
            has_schema: !tables.is_empty(),
            table_count: tables.len() as i64,
            tables,
        })
    }

    /// Best-effort capability probe as the tenant role. Probe failures become
    /// `false`, never errors.
    pub async fn test_tenant_permissions(&self, tenant_id: Uuid) -> Result<PermissionReport, AppError> {
        let pool = self.tenant_pool(tenant_id).await?;
        let can_create_tables = probe(
            &pool,
            "CREATE TABLE _pgtenant_probe (id INT)",
            "DROP TABLE IF EXISTS _pgtenant_probe",
        )
        .await;
        let can_create_enums = probe(
            &pool,
            "CREATE TYPE _pgtenant_probe_t AS ENUM ('a')",
            "DROP TYPE IF EXISTS _pgtenant_probe_t",
        )
        .await;
        let mut schema_privileges = Vec::new();
        for privilege in ["USAGE", "CREATE"] {
            let granted: Result<(bool,), sqlx::Error> =
                sqlx::query_as("SELECT has_schema_privilege(current_user, 'public', $1)")
                    .bind(privilege)
                    .fetch_one(&pool)
                    .await;
            if matches!(granted, Ok((true,))) {
                schema_privileges.push(privilege.to_string());
            }
        }
        Ok(PermissionReport {
            can_create_tables,
            can_create_enums,
            schema_privileges,
        })
    }

    /// Re-run schema application for an existing tenant (repair path for a
    /// partially initialized database).
    pub async fn initialize_schema(&self, tenant_id: Uuid) -> Result<(), AppError> {
        let url = self.tenant_url(tenant_id).await?;
        self.schema.apply(&url).await
    }

    /// Insert the tenant's mirror client record if it is missing. Returns
    /// whether a row was written.
    pub async fn ensure_client_record_exists(
        &self,
        tenant_id: Uuid,
        seed: &ClientSeed,
    ) -> Result<bool, AppError> {
        seed.validate()?;
        let pool = self.tenant_pool(tenant_id).await?;
        let mut conn = pool.acquire().await?;
        if !table_exists(&mut conn, "clients").await? {
            tracing::warn!(%tenant_id, "clients table missing in tenant database, skipping mirror repair");
            return Ok(false);
        }
        let exists: (bool,) = sqlx::query_as("SELECT EXISTS(SELECT 1 FROM clients WHERE id = $1)")
            .bind(seed.id)
            .fetch_one(&mut *conn)
            .await?;
        if exists.0 {
            return Ok(false);
        }
        insert_client_record(&mut conn, seed, &tenant_database_name(tenant_id)).await?;
        Ok(true)
    }

    /// Insert the tenant's mirror user record if it is missing. Returns
    /// whether a row was written.
    pub async fn ensure_user_record_exists(
        &self,
        tenant_id: Uuid,
        seed: &UserSeed,
    ) -> Result<bool, AppError> {
        seed.validate()?;
        let pool = self.tenant_pool(tenant_id).await?;
        let mut conn = pool.acquire().await?;
        if !table_exists(&mut conn, "users").await? {
            tracing::warn!(%tenant_id, "users table missing in tenant database, skipping mirror repair");
            return Ok(false);
        }
        let exists: (bool,) = sqlx::query_as("SELECT EXISTS(SELECT 1 FROM users WHERE id = $1)")
            .bind(seed.id)
            .fetch_one(&mut *conn)
            .await?;
        if exists.0 {
            return Ok(false);
        }
        insert_user_record(&mut conn, seed, tenant_id).await?;
        Ok(true)
    }

    /// Pooled connection to the tenant database using its stored credentials.
    pub(crate) async fn tenant_pool(&self, tenant_id: Uuid) -> Result<PgPool, AppError> {
        let url = self.tenant_url(tenant_id).await?;
        let options = PgConnectOptions::from_str(&url)
            .map_err(|e| AppError::BadRequest(format!("invalid tenant database URL: {}", e)))?;
        Ok(self.cache.get_or_create(tenant_id, options))
    }

    async fn tenant_url(&self, tenant_id: Uuid) -> Result<String, AppError> {
        let cred = self.credentials.get(tenant_id).await?.ok_or_else(|| {
            AppError::NotFound(format!("no stored credentials for tenant {}", tenant_id))
        })?;
        compose_database_url(
            &self.settings.master_database_url,
            &cred.database_name,
            &cred.username,
            &cred.password,
        )
    }

    async fn setup_physical(
        &self,
        database_name: &str,
        role_name: &str,
        password: &str,
        db_created: &mut bool,
        role_created: &mut bool,
    ) -> Result<(), AppError> {
        if self.database_exists(database_name).await? {
            tracing::warn!(database = %database_name, "tenant database already exists, reusing");
        } else {
            sqlx::query(&format!("CREATE DATABASE {}", quote_ident(database_name)))
                .execute(&self.master)
                .await?;
            *db_created = true;
        }

        let role_ddl = if self.role_exists(role_name).await? {
            format!(
                "ALTER ROLE {} WITH LOGIN PASSWORD '{}'",
                quote_ident(role_name),
                escape_literal(password)
            )
        } else {
            *role_created = true;
            format!(
                "CREATE ROLE {} WITH LOGIN PASSWORD '{}'",
                quote_ident(role_name),
                escape_literal(password)
            )
        };
        sqlx::query(&role_ddl).execute(&self.master).await?;

        sqlx::query(&format!(
            "GRANT ALL PRIVILEGES ON DATABASE {} TO {}",
            quote_ident(database_name),
            quote_ident(role_name)
        ))
        .execute(&self.master)
        .await?;

        // Schema-level grants must be issued while connected to the new
        // database, so open a separate admin connection to it.
        let admin_url = swap_database(&self.settings.master_database_url, database_name)?;
        let mut conn = self.admin_connect(&admin_url).await?;
        let role = quote_ident(role_name);
        for sql in [
            format!("GRANT USAGE ON SCHEMA public TO {}", role),
            format!("GRANT CREATE ON SCHEMA public TO {}", role),
            format!("GRANT ALL PRIVILEGES ON ALL TABLES IN SCHEMA public TO {}", role),
            format!("GRANT ALL PRIVILEGES ON ALL SEQUENCES IN SCHEMA public TO {}", role),
            format!("GRANT ALL PRIVILEGES ON ALL FUNCTIONS IN SCHEMA public TO {}", role),
            format!("ALTER DEFAULT PRIVILEGES IN SCHEMA public GRANT ALL ON TABLES TO {}", role),
            format!("ALTER DEFAULT PRIVILEGES IN SCHEMA public GRANT ALL ON SEQUENCES TO {}", role),
            format!("ALTER DEFAULT PRIVILEGES IN SCHEMA public GRANT ALL ON FUNCTIONS TO {}", role),
        ] {
            conn.execute(sql.as_str()).await?;
        }
        let _ = conn.close().await;
        Ok(())
    }

    async fn seed_mirror_records(
        &self,
        tenant_url: &str,
        tenant_id: Uuid,
        client_seed: Option<&ClientSeed>,
        user_seed: Option<&UserSeed>,
    ) -> Result<(), AppError> {
        let mut conn = self.admin_connect(tenant_url).await?;
        if let Some(seed) = client_seed {
            if table_exists(&mut conn, "clients").await? {
                insert_client_record(&mut conn, seed, &tenant_database_name(tenant_id)).await?;
            } else {
                tracing::warn!(%tenant_id, "clients table missing, skipping mirror client record");
            }
        }
        if let Some(seed) = user_seed {
            if table_exists(&mut conn, "users").await? {
                insert_user_record(&mut conn, seed, tenant_id).await?;
            } else {
                tracing::warn!(%tenant_id, "users table missing, skipping mirror user record");
            }
        }
        let _ = conn.close().await;
        Ok(())
    }

    async fn cleanup_partial(
        &self,
        tenant_id: Uuid,
        database_name: &str,
        role_name: &str,
        db_created: bool,
        role_created: bool,
        cred_saved: bool,
    ) {
        tracing::warn!(%tenant_id, "provisioning failed, rolling back partially created objects");
        if db_created {
            if let Err(e) = self.terminate_connections(database_name).await {
                tracing::warn!(error = %e, "cleanup: failed to terminate connections");
            }
            if let Err(e) = sqlx::query(&format!(
                "DROP DATABASE IF EXISTS {}",
                quote_ident(database_name)
            ))
            .execute(&self.master)
            .await
            {
                tracing::warn!(error = %e, database = %database_name, "cleanup: failed to drop database");
            }
        }
        if role_created {
            if let Err(e) = sqlx::query(&format!("DROP ROLE IF EXISTS {}", quote_ident(role_name)))
                .execute(&self.master)
                .await
            {
                tracing::warn!(error = %e, role = %role_name, "cleanup: failed to drop role");
            }
        }
        if cred_saved {
            if let Err(e) = self.credentials.remove(tenant_id).await {
                tracing::warn!(error = %e, "cleanup: failed to remove credential row");
            }
        }
    }

    async fn terminate_connections(&self, database_name: &str) -> Result<(), AppError> {
        sqlx::query(
            "SELECT pg_terminate_backend(pid) FROM pg_stat_activity
             WHERE datname = $1 AND pid <> pg_backend_pid()",
        )
        .bind(database_name)
        .execute(&self.master)
        .await?;
        Ok(())
    }

    async fn database_exists(&self, name: &str) -> Result<bool, AppError> {
        let row: (bool,) =
            sqlx::query_as("SELECT EXISTS(SELECT 1 FROM pg_database WHERE datname = $1)")
                .bind(name)
                .fetch_one(&self.master)
                .await?;
        Ok(row.0)
    }

    async fn role_exists(&self, name: &str) -> Result<bool, AppError> {
        let row: (bool,) =
            sqlx::query_as("SELECT EXISTS(SELECT 1 FROM pg_roles WHERE rolname = $1)")
                .bind(name)
                .fetch_one(&self.master)
                .await?;
        Ok(row.0)
    }

    async fn admin_connect(&self, url: &str) -> Result<PgConnection, AppError> {
        let opts = PgConnectOptions::from_str(url)
            .map_err(|e| AppError::BadRequest(format!("invalid database URL: {}", e)))?;
        tokio::time::timeout(self.settings.connect_timeout, opts.connect())
            .await
            .map_err(|_| {
                AppError::Provisioning(format!(
                    "connect timed out after {}s",
                    self.settings.connect_timeout.as_secs()
                ))
            })?
            .map_err(AppError::Db)
    }
}

async fn probe(pool: &PgPool, create_sql: &str, drop_sql: &str) -> bool {
    let created = match sqlx::query(create_sql).execute(pool).await {
        Ok(_) => true,
        Err(e) => {
            tracing::debug!(error = %e, "permission probe failed");
            false
        }
    };
    if let Err(e) = sqlx::query(drop_sql).execute(pool).await {
        tracing::debug!(error = %e, "permission probe cleanup failed");
    }
    created
}

async fn table_exists(conn: &mut PgConnection, table: &str) -> Result<bool, AppError> {
    let row: (bool,) = sqlx::query_as(
        "SELECT EXISTS(SELECT 1 FROM information_schema.tables
         WHERE table_schema = 'public' AND table_name = $1)",
    )
    .bind(table)
    .fetch_one(conn)
    .await?;
    Ok(row.0)
}

async fn insert_client_record(
    conn: &mut PgConnection,
    seed: &ClientSeed,
    database_name: &str,
) -> Result<(), AppError> {
    sqlx::query(
        "INSERT INTO clients (id, name, email, phone, database_name, status)
         VALUES ($1, $2, $3, $4, $5, 'active')
         ON CONFLICT (id) DO UPDATE SET
             name = EXCLUDED.name,
             email = EXCLUDED.email,
             phone = EXCLUDED.phone,
             database_name = EXCLUDED.database_name,
             updated_at = NOW()",
    )
    .bind(seed.id)
    .bind(&seed.name)
    .bind(&seed.email)
    .bind(&seed.phone)
    .bind(database_name)
    .execute(conn)
    .await?;
    Ok(())
}

async fn insert_user_record(
    conn: &mut PgConnection,
    seed: &UserSeed,
    client_id: Uuid,
) -> Result<(), AppError> {
    sqlx::query(
        "INSERT INTO users (id, client_id, email, name, role, password_hash, status)
         VALUES ($1, $2, $3, $4, COALESCE($5, 'admin'), $6, 'active')
         ON CONFLICT (id) DO UPDATE SET
             email = EXCLUDED.email,
             name = EXCLUDED.name,
             updated_at = NOW()",
    )
    .bind(seed.id)
    .bind(client_id)
    .bind(&seed.email)
    .bind(&seed.name)
    .bind(&seed.role)
    .bind(&seed.password_hash)
    .execute(conn)
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seeds_require_name_and_email() {
        let ok = ClientSeed {
            id: Uuid::new_v4(),
            name: "Acme".into(),
            email: "a@acme.test".into(),
            phone: None,
        };
        assert!(ok.validate().is_ok());

        let bad = ClientSeed {
            id: Uuid::new_v4(),
            name: "  ".into(),
            email: "a@acme.test".into(),
            phone: None,
        };
        assert!(bad.validate().is_err());

        let bad_user = UserSeed {
            id: Uuid::new_v4(),
            email: String::new(),
            name: "Ada".into(),
            role: None,
            password_hash: None,
        };
        assert!(bad_user.validate().is_err());
    }

    #[test]
    fn error_status_carries_message() {
        let status = DatabaseStatus::error("connection refused");
        assert_eq!(status.status, "error");
        assert!(status.database_size.is_none());
        assert_eq!(status.message.as_deref(), Some("connection refused"));
    }
}
