//! Control-plane bootstrap: `_sys_*` table naming, master-database creation,
//! and application-schema bootstrap. All `_sys_*` tables live in a schema named
//! from `PGTENANT_CONTROL_SCHEMA` (default `pgtenant`).

use crate::error::AppError;
use crate::ident::quote_ident;
use crate::provision::SqlSchemaApplier;
use sqlx::ConnectOptions;
use sqlx::PgPool;
use std::str::FromStr;

/// Default schema for `_sys_*` tables; overridden via `PGTENANT_CONTROL_SCHEMA`.
pub const DEFAULT_CONTROL_SCHEMA: &str = "pgtenant";

/// Returns the schema-qualified name for a `_sys_*` table
/// (e.g. `pgtenant._sys_tenant_credentials`).
pub fn qualified_control_table(schema: &str, table: &str) -> String {
    format!("{}.{}", quote_ident(schema), table)
}

/// Idempotently create the control schema. Concurrent callers can both pass
/// the IF NOT EXISTS check; the loser's error is benign and tolerated after a
/// second existence check.
pub async fn ensure_control_schema(pool: &PgPool, schema: &str) -> Result<(), AppError> {
    let ddl = format!("CREATE SCHEMA IF NOT EXISTS {}", quote_ident(schema));
    if let Err(e) = sqlx::query(&ddl).execute(pool).await {
        let exists: (bool,) = sqlx::query_as(
            "SELECT EXISTS(SELECT 1 FROM information_schema.schemata WHERE schema_name = $1)",
        )
        .bind(schema)
        .fetch_one(pool)
        .await?;
        if !exists.0 {
            return Err(AppError::Db(e));
        }
    }
    Ok(())
}

/// Ensure the database in `database_url` exists; create it if not. Connects to
/// the default `postgres` database to run CREATE DATABASE. Call before creating
/// the master pool.
pub async fn ensure_database_exists(database_url: &str) -> Result<(), AppError> {
    let (admin_url, db_name) = parse_db_name_from_url(database_url)?;
    if db_name.is_empty() || db_name == "postgres" {
        return Ok(());
    }
    let opts = sqlx::postgres::PgConnectOptions::from_str(&admin_url)
        .map_err(|e| AppError::BadRequest(format!("invalid DATABASE_URL: {}", e)))?;
    let mut conn: sqlx::PgConnection = opts.connect().await.map_err(AppError::Db)?;
    let exists: (bool,) =
        sqlx::query_as("SELECT EXISTS(SELECT 1 FROM pg_database WHERE datname = $1)")
            .bind(&db_name)
            .fetch_one(&mut conn)
            .await
            .map_err(AppError::Db)?;
    if !exists.0 {
        let quoted = quote_ident(&db_name);
        sqlx::query(&format!("CREATE DATABASE {}", quoted))
            .execute(&mut conn)
            .await
            .map_err(AppError::Db)?;
    }
    Ok(())
}

/// Apply the embedded application schema to the master database. The control
/// plane holds the same application tables as each tenant database (plus the
/// `_sys_*` tables), so tenant rows can be mirrored and cascade-deleted here.
pub async fn bootstrap_master_schema(pool: &PgPool) -> Result<(), AppError> {
    SqlSchemaApplier::embedded().apply_to_pool(pool).await
}

fn parse_db_name_from_url(url: &str) -> Result<(String, String), AppError> {
    let path_start = url
        .rfind('/')
        .ok_or_else(|| AppError::BadRequest("DATABASE_URL: no path".into()))?
        + 1;
    let path_and_query = url.get(path_start..).unwrap_or("");
    let db_name = path_and_query.split('?').next().unwrap_or("").trim();
    let base = url.get(..path_start).unwrap_or(url);
    let admin_url = format!("{}postgres", base);
    Ok((admin_url, db_name.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qualified_names_are_schema_prefixed() {
        assert_eq!(
            qualified_control_table("pgtenant", "_sys_tenant_credentials"),
            "\"pgtenant\"._sys_tenant_credentials"
        );
    }

    #[test]
    fn admin_url_swaps_to_postgres() {
        let (admin, db) = parse_db_name_from_url("postgres://u:p@h:5432/appdb?sslmode=disable").unwrap();
        assert_eq!(admin, "postgres://u:p@h:5432/postgres");
        assert_eq!(db, "appdb");
    }
}
