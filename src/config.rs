//! Environment-driven settings for the control plane and tenant provisioning.

use crate::error::AppError;
use crate::ident;
use std::time::Duration;

/// Runtime settings. Every knob has an env var and a default; only
/// `DATABASE_URL` is required.
#[derive(Clone, Debug)]
pub struct Settings {
    /// Connection URL of the control-plane ("master") database. The admin
    /// credentials in this URL are also used for CREATE DATABASE / CREATE ROLE.
    pub master_database_url: String,
    /// Schema holding the `_sys_*` control tables. From `PGTENANT_CONTROL_SCHEMA`,
    /// default `pgtenant`.
    pub control_schema: String,
    /// External schema-push command (e.g. a migration CLI). The tenant URL is
    /// passed via the `DATABASE_URL` env var. Unset means direct-SQL only.
    pub schema_tool: Option<String>,
    /// Hard timeout for one schema-tool invocation.
    pub schema_tool_timeout: Duration,
    /// Connect timeout for admin and tenant connections. Kept short so one
    /// unreachable tenant database cannot stall a request.
    pub connect_timeout: Duration,
    /// Pool size for each lazily created tenant pool.
    pub tenant_pool_size: u32,
}

impl Settings {
    /// Read settings from the environment. Fails only when `DATABASE_URL` is
    /// missing or the control schema is not a valid identifier.
    pub fn from_env() -> Result<Self, AppError> {
        let master_database_url = std::env::var("DATABASE_URL")
            .map_err(|_| AppError::Validation("DATABASE_URL must be set".into()))?;
        let control_schema = std::env::var("PGTENANT_CONTROL_SCHEMA")
            .unwrap_or_else(|_| crate::store::DEFAULT_CONTROL_SCHEMA.into());
        ident::validate_identifier(&control_schema)?;

        let schema_tool = std::env::var("PGTENANT_SCHEMA_TOOL")
            .ok()
            .filter(|s| !s.trim().is_empty());
        let schema_tool_timeout = Duration::from_secs(env_u64("PGTENANT_SCHEMA_TOOL_TIMEOUT_SECS", 45));
        let connect_timeout = Duration::from_secs(env_u64("PGTENANT_CONNECT_TIMEOUT_SECS", 5));
        let tenant_pool_size = env_u64("PGTENANT_TENANT_POOL_SIZE", 5) as u32;

        Ok(Settings {
            master_database_url,
            control_schema,
            schema_tool,
            schema_tool_timeout,
            connect_timeout,
            tenant_pool_size,
        })
    }

    /// Settings for tests and embedding: given URL, defaults for the rest.
    pub fn with_master_url(url: impl Into<String>) -> Self {
        Settings {
            master_database_url: url.into(),
            control_schema: crate::store::DEFAULT_CONTROL_SCHEMA.into(),
            schema_tool: None,
            schema_tool_timeout: Duration::from_secs(45),
            connect_timeout: Duration::from_secs(5),
            tenant_pool_size: 5,
        }
    }
}

fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn with_master_url_defaults() {
        let s = Settings::with_master_url("postgres://localhost/master");
        assert_eq!(s.control_schema, "pgtenant");
        assert!(s.schema_tool.is_none());
        assert_eq!(s.connect_timeout, Duration::from_secs(5));
    }

    #[test]
    fn env_u64_falls_back_on_garbage() {
        std::env::set_var("PGTENANT_TEST_GARBAGE", "not-a-number");
        assert_eq!(env_u64("PGTENANT_TEST_GARBAGE", 7), 7);
        std::env::remove_var("PGTENANT_TEST_GARBAGE");
    }
}
