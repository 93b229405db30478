//! Per-tenant database credential persistence in the control plane.

use crate::error::AppError;
use crate::store::qualified_control_table;
use sqlx::PgPool;
use std::fmt;
use uuid::Uuid;

const CREDENTIALS_TABLE: &str = "_sys_tenant_credentials";

/// Stored credentials for one tenant database. 1:1 with the tenant record.
///
/// The password is plaintext at rest (known gap, see DESIGN.md); it is kept
/// out of `Debug` output so credentials never leak through logging.
#[derive(Clone)]
pub struct TenantCredential {
    pub tenant_id: Uuid,
    pub database_name: String,
    pub username: String,
    pub password: String,
}

impl fmt::Debug for TenantCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TenantCredential")
            .field("tenant_id", &self.tenant_id)
            .field("database_name", &self.database_name)
            .field("username", &self.username)
            .field("password", &"****")
            .finish()
    }
}

/// Control-plane store for tenant database credentials. Creates its own table
/// on first use.
#[derive(Clone)]
pub struct CredentialStore {
    pool: PgPool,
    schema: String,
}

impl CredentialStore {
    pub fn new(pool: PgPool, schema: impl Into<String>) -> Self {
        CredentialStore {
            pool,
            schema: schema.into(),
        }
    }

    fn table(&self) -> String {
        qualified_control_table(&self.schema, CREDENTIALS_TABLE)
    }

    /// Idempotently create the credentials table. Safe to call repeatedly and
    /// concurrently; a loser of the create race re-checks existence.
    pub async fn ensure_initialized(&self) -> Result<(), AppError> {
        crate::store::ensure_control_schema(&self.pool, &self.schema).await?;
        let ddl = format!(
            r#"
            CREATE TABLE IF NOT EXISTS {} (
                tenant_id UUID PRIMARY KEY,
                database_name TEXT NOT NULL,
                username TEXT NOT NULL,
                password TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
            self.table()
        );
        if let Err(e) = sqlx::query(&ddl).execute(&self.pool).await {
            let exists: (bool,) = sqlx::query_as(
                "SELECT EXISTS(SELECT 1 FROM information_schema.tables
                 WHERE table_schema = $1 AND table_name = $2)",
            )
            .bind(&self.schema)
            .bind(CREDENTIALS_TABLE)
            .fetch_one(&self.pool)
            .await?;
            if !exists.0 {
                return Err(AppError::Db(e));
            }
        }
        Ok(())
    }

    /// Upsert: insert a new credential row, or overwrite database name,
    /// username and password for an existing tenant id.
    pub async fn save(&self, cred: &TenantCredential) -> Result<(), AppError> {
        let sql = format!(
            "INSERT INTO {} (tenant_id, database_name, username, password)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (tenant_id) DO UPDATE SET
                 database_name = EXCLUDED.database_name,
                 username = EXCLUDED.username,
                 password = EXCLUDED.password,
                 updated_at = NOW()",
            self.table()
        );
        sqlx::query(&sql)
            .bind(cred.tenant_id)
            .bind(&cred.database_name)
            .bind(&cred.username)
            .bind(&cred.password)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Lookup by tenant id. Absent credentials are `None`, not an error, so
    /// callers can decide their own fallback.
    pub async fn get(&self, tenant_id: Uuid) -> Result<Option<TenantCredential>, AppError> {
        let sql = format!(
            "SELECT tenant_id, database_name, username, password FROM {} WHERE tenant_id = $1",
            self.table()
        );
        let row: Option<(Uuid, String, String, String)> = sqlx::query_as(&sql)
            .bind(tenant_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|(tenant_id, database_name, username, password)| TenantCredential {
            tenant_id,
            database_name,
            username,
            password,
        }))
    }

    /// Delete the credential row. No error if absent.
    pub async fn remove(&self, tenant_id: Uuid) -> Result<(), AppError> {
        let sql = format!("DELETE FROM {} WHERE tenant_id = $1", self.table());
        sqlx::query(&sql).bind(tenant_id).execute(&self.pool).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_output_redacts_password() {
        let cred = TenantCredential {
            tenant_id: Uuid::new_v4(),
            database_name: "client_x_db".into(),
            username: "user_x".into(),
            password: "supersecret".into(),
        };
        let dbg = format!("{:?}", cred);
        assert!(!dbg.contains("supersecret"));
        assert!(dbg.contains("****"));
        assert!(dbg.contains("client_x_db"));
    }
}
