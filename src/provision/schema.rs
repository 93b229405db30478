//! Schema application strategies: external tool first, direct SQL fallback.

use crate::config::Settings;
use crate::error::AppError;
use crate::ident::redact_url;
use async_trait::async_trait;
use sqlx::ConnectOptions;
use sqlx::{Connection, Executor, PgConnection};
use std::str::FromStr;
use std::time::Duration;

/// Application schema shipped with the crate. Applied to the control plane at
/// bootstrap and to each tenant database by the SQL fallback path.
pub const APP_SCHEMA_SQL: &str = include_str!("../schema/app_schema.sql");

/// A way of bringing a database up to the application schema.
#[async_trait]
pub trait SchemaApplier: Send + Sync {
    async fn apply(&self, database_url: &str) -> Result<(), AppError>;
}

/// Invokes an external schema-push command (an ORM/migration CLI) with the
/// target URL in `DATABASE_URL`, bounded by a hard timeout.
pub struct ToolSchemaApplier {
    command: String,
    timeout: Duration,
}

impl ToolSchemaApplier {
    pub fn new(command: impl Into<String>, timeout: Duration) -> Self {
        ToolSchemaApplier {
            command: command.into(),
            timeout,
        }
    }
}

#[async_trait]
impl SchemaApplier for ToolSchemaApplier {
    async fn apply(&self, database_url: &str) -> Result<(), AppError> {
        let mut parts = self.command.split_whitespace();
        let program = parts.next().ok_or_else(|| {
            AppError::Provisioning("schema tool command is empty".into())
        })?;
        let mut cmd = tokio::process::Command::new(program);
        cmd.args(parts)
            .env("DATABASE_URL", database_url)
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped());

        tracing::info!(tool = %program, url = %redact_url(database_url), "applying schema via tool");
        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| {
                AppError::Provisioning(format!(
                    "schema tool timed out after {}s",
                    self.timeout.as_secs()
                ))
            })?
            .map_err(|e| AppError::Provisioning(format!("schema tool failed to start: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(AppError::Provisioning(format!(
                "schema tool exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }
        Ok(())
    }
}

/// Executes schema statements one at a time directly against the target
/// database. Individual statement failures (e.g. "already exists" on a rerun)
/// are logged and tolerated; only a connection failure aborts.
pub struct SqlSchemaApplier {
    statements: Vec<String>,
}

impl SqlSchemaApplier {
    pub fn from_sql(sql: &str) -> Self {
        SqlSchemaApplier {
            statements: split_statements(sql),
        }
    }

    /// Applier over the embedded application schema.
    pub fn embedded() -> Self {
        Self::from_sql(APP_SCHEMA_SQL)
    }

    pub async fn apply_to_pool(&self, pool: &sqlx::PgPool) -> Result<(), AppError> {
        let mut conn = pool.acquire().await?;
        self.run(&mut conn).await
    }

    async fn run(&self, conn: &mut PgConnection) -> Result<(), AppError> {
        for (i, stmt) in self.statements.iter().enumerate() {
            if let Err(e) = conn.execute(stmt.as_str()).await {
                tracing::warn!(statement = i + 1, error = %e, "schema statement failed, continuing");
            }
        }
        Ok(())
    }
}

#[async_trait]
impl SchemaApplier for SqlSchemaApplier {
    async fn apply(&self, database_url: &str) -> Result<(), AppError> {
        let opts = sqlx::postgres::PgConnectOptions::from_str(database_url)
            .map_err(|e| AppError::BadRequest(format!("invalid database URL: {}", e)))?;
        let mut conn: PgConnection = opts.connect().await?;
        tracing::info!(url = %redact_url(database_url), statements = self.statements.len(), "applying schema via direct SQL");
        let result = self.run(&mut conn).await;
        let _ = conn.close().await;
        result
    }
}

/// Primary/fallback selection: try the tool when configured, fall through to
/// direct SQL on any tool failure.
pub struct SchemaStrategy {
    tool: Option<ToolSchemaApplier>,
    fallback: SqlSchemaApplier,
}

impl SchemaStrategy {
    pub fn new(tool: Option<ToolSchemaApplier>, fallback: SqlSchemaApplier) -> Self {
        SchemaStrategy { tool, fallback }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        let tool = settings
            .schema_tool
            .as_ref()
            .map(|cmd| ToolSchemaApplier::new(cmd.clone(), settings.schema_tool_timeout));
        SchemaStrategy {
            tool,
            fallback: SqlSchemaApplier::embedded(),
        }
    }

    pub async fn apply(&self, database_url: &str) -> Result<(), AppError> {
        if let Some(tool) = &self.tool {
            match tool.apply(database_url).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    tracing::warn!(error = %e, "schema tool failed, falling back to direct SQL");
                }
            }
        }
        self.fallback.apply(database_url).await
    }
}

/// Split a SQL script into executable statements: strip `--` comments, split
/// on trailing semicolons. The embedded schema avoids `$$` bodies so this
/// stays a line-level split.
pub fn split_statements(sql: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut current = String::new();
    for line in sql.lines() {
        let line = match line.find("--") {
            Some(idx) => &line[..idx],
            None => line,
        };
        if line.trim().is_empty() {
            continue;
        }
        current.push_str(line);
        current.push('\n');
        if line.trim_end().ends_with(';') {
            let stmt = current.trim().trim_end_matches(';').trim().to_string();
            if !stmt.is_empty() {
                statements.push(stmt);
            }
            current.clear();
        }
    }
    let tail = current.trim();
    if !tail.is_empty() {
        statements.push(tail.trim_end_matches(';').trim().to_string());
    }
    statements
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_on_trailing_semicolons() {
        let sql = "CREATE TABLE a (\n  id INT\n);\n\n-- comment only\nCREATE INDEX i ON a (id);\n";
        let stmts = split_statements(sql);
        assert_eq!(stmts.len(), 2);
        assert!(stmts[0].starts_with("CREATE TABLE a"));
        assert!(stmts[1].starts_with("CREATE INDEX i"));
        assert!(!stmts[0].contains(';'));
    }

    #[test]
    fn strips_inline_comments_and_blank_lines() {
        let sql = "CREATE TABLE b (id INT); -- trailing note\n\n";
        let stmts = split_statements(sql);
        assert_eq!(stmts, vec!["CREATE TABLE b (id INT)"]);
    }

    #[test]
    fn embedded_schema_parses_to_statements() {
        let stmts = split_statements(APP_SCHEMA_SQL);
        assert!(stmts.len() > 20, "expected the full application schema");
        assert!(stmts
            .iter()
            .all(|s| s.to_uppercase().starts_with("CREATE")));
        assert!(stmts.iter().any(|s| s.contains("CREATE TABLE IF NOT EXISTS clients")));
    }
}
