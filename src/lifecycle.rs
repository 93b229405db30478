//! Tenant lifecycle orchestration: onboarding, guarded deletion, status
//! cascade, and the foreign-key-ordered control-plane purge.

use crate::credentials::CredentialStore;
use crate::error::AppError;
use crate::provision::{
    ClientSeed, DatabaseStatus, PermissionReport, Provisioner, SchemaReport, UserSeed,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use uuid::Uuid;

/// Tenant lifecycle status, cascaded to the tenant's users on change.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TenantStatus {
    Active,
    Inactive,
    Suspended,
    Provisioning,
}

impl TenantStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TenantStatus::Active => "active",
            TenantStatus::Inactive => "inactive",
            TenantStatus::Suspended => "suspended",
            TenantStatus::Provisioning => "provisioning",
        }
    }
}

impl std::str::FromStr for TenantStatus {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "active" => Ok(TenantStatus::Active),
            "inactive" => Ok(TenantStatus::Inactive),
            "suspended" => Ok(TenantStatus::Suspended),
            "provisioning" => Ok(TenantStatus::Provisioning),
            _ => Err(AppError::BadRequest(format!(
                "invalid tenant status: {} (expected active, inactive, suspended or provisioning)",
                s
            ))),
        }
    }
}

/// Control-plane tenant record.
#[derive(Clone, Debug, Serialize)]
pub struct TenantRecord {
    pub id: Uuid,
    pub name: String,
    pub email: String,
    pub phone: Option<String>,
    pub database_name: Option<String>,
    pub status: TenantStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Onboarding request for a new tenant.
#[derive(Clone, Debug, Deserialize)]
pub struct NewTenant {
    pub name: String,
    pub email: String,
    pub phone: Option<String>,
    /// Optional first admin user, mirrored into the tenant database.
    pub admin_user: Option<UserSeed>,
}

#[derive(Clone, Copy, Debug, Default, Deserialize)]
pub struct SafeDeleteOptions {
    #[serde(default)]
    pub soft_delete: bool,
    #[serde(default)]
    pub force: bool,
}

#[derive(Clone, Debug, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SafeDeleteOutcome {
    /// Live data exists and `force` was not set; nothing was deleted.
    Refused { users: i64, stores: i64, products: i64 },
    SoftDeleted { users_deactivated: u64 },
    Deleted,
}

#[derive(Clone, Debug, Serialize)]
pub struct TableCount {
    pub table: String,
    pub rows: i64,
}

#[derive(Clone, Debug, Serialize)]
pub struct DeletionPreview {
    pub data_to_delete: Vec<TableCount>,
    pub warnings: Vec<String>,
    pub can_delete: bool,
}

#[derive(Clone, Debug, Serialize)]
pub struct TenantStatusReport {
    pub tenant: TenantRecord,
    pub database: DatabaseStatus,
}

/// Stored connection details for operator use. Transmits the plaintext
/// password, matching the reference design's documented gap (DESIGN.md).
#[derive(Clone, Serialize)]
pub struct ConnectionDetails {
    pub database_name: String,
    pub username: String,
    pub password: String,
}

/// How each control-plane table's rows are scoped to one tenant. Every
/// generated statement binds the tenant id; there are no table-wide deletes.
#[derive(Clone, Copy, Debug)]
pub(crate) enum Scope {
    /// Column holds the tenant id directly.
    Client(&'static str),
    /// Column references a user belonging to the tenant.
    User(&'static str),
    /// Two columns, both referencing tenant users.
    Users(&'static str, &'static str),
    /// Column references a store belonging to the tenant.
    Store(&'static str),
    /// One user column, one store column.
    UserOrStore(&'static str, &'static str),
    /// Column references a sale made in a tenant store or by a tenant user.
    Sale(&'static str),
    /// Column references a file upload by a tenant user.
    Upload(&'static str),
}

const TENANT_USERS: &str = "SELECT id FROM users WHERE client_id = $1";
const TENANT_STORES: &str = "SELECT id FROM stores WHERE client_id = $1";

impl Scope {
    fn predicate(self) -> String {
        match self {
            Scope::Client(col) => format!("{} = $1", col),
            Scope::User(col) => format!("{} IN ({})", col, TENANT_USERS),
            Scope::Users(a, b) => format!(
                "{} IN ({}) OR {} IN ({})",
                a, TENANT_USERS, b, TENANT_USERS
            ),
            Scope::Store(col) => format!("{} IN ({})", col, TENANT_STORES),
            Scope::UserOrStore(u, s) => format!(
                "{} IN ({}) OR {} IN ({})",
                u, TENANT_USERS, s, TENANT_STORES
            ),
            Scope::Sale(col) => format!(
                "{} IN (SELECT id FROM sales WHERE store_id IN ({}) OR user_id IN ({}))",
                col, TENANT_STORES, TENANT_USERS
            ),
            Scope::Upload(col) => format!(
                "{} IN (SELECT id FROM file_uploads WHERE user_id IN ({}))",
                col, TENANT_USERS
            ),
        }
    }

    fn delete_sql(self, table: &str) -> String {
        format!("DELETE FROM {} WHERE {}", table, self.predicate())
    }

    fn count_sql(self, table: &str) -> String {
        format!("SELECT count(*) FROM {} WHERE {}", table, self.predicate())
    }
}

/// Control-plane purge order. Leaf tables referencing users/stores come
/// first, then users, stores, products; the client row itself is deleted
/// after the loop. The order must stay consistent with the foreign keys in
/// `schema/app_schema.sql`; the tests below check the structural invariants.
pub(crate) const CASCADE_DELETES: &[(&str, Scope)] = &[
    ("audit_logs", Scope::User("user_id")),
    ("notifications", Scope::User("user_id")),
    ("api_tokens", Scope::User("user_id")),
    ("invite_links", Scope::User("created_by")),
    ("password_resets", Scope::User("user_id")),
    ("permission_grants", Scope::Users("user_id", "granted_by")),
    ("role_assignments", Scope::Users("user_id", "assigned_by")),
    ("role_templates", Scope::User("created_by")),
    ("user_stores", Scope::UserOrStore("user_id", "store_id")),
    ("sale_adjustments", Scope::Sale("sale_id")),
    ("sale_returns", Scope::Sale("sale_id")),
    ("sales", Scope::UserOrStore("user_id", "store_id")),
    ("purchase_orders", Scope::UserOrStore("user_id", "store_id")),
    ("expenses", Scope::UserOrStore("user_id", "store_id")),
    ("order_processing", Scope::UserOrStore("user_id", "store_id")),
    ("store_settings", Scope::Store("store_id")),
    ("suppliers", Scope::Store("store_id")),
    ("customers", Scope::Store("store_id")),
    ("reports", Scope::UserOrStore("user_id", "store_id")),
    ("file_upload_errors", Scope::Upload("upload_id")),
    ("file_uploads", Scope::User("user_id")),
    ("businesses", Scope::Client("client_id")),
    ("packs", Scope::Client("client_id")),
    ("users", Scope::Client("client_id")),
    ("stores", Scope::Client("client_id")),
    ("products", Scope::Client("client_id")),
];

/// Orchestrates tenant creation, inspection, and deletion over the control
/// plane and the provisioner.
pub struct TenantService {
    master: PgPool,
    provisioner: Provisioner,
    credentials: CredentialStore,
}

impl TenantService {
    pub fn new(master: PgPool, provisioner: Provisioner, credentials: CredentialStore) -> Self {
        TenantService {
            master,
            provisioner,
            credentials,
        }
    }

    /// Onboard a tenant: control-plane record, physical database, schema,
    /// mirror records. On provisioning failure the control-plane record and
    /// any partially created objects are torn down best-effort before the
    /// error is re-raised.
    pub async fn create_tenant(&self, new: NewTenant) -> Result<TenantRecord, AppError> {
        if new.name.trim().is_empty() || new.email.trim().is_empty() {
            return Err(AppError::Validation("tenant requires name and email".into()));
        }
        let taken: (bool,) = sqlx::query_as("SELECT EXISTS(SELECT 1 FROM clients WHERE email = $1)")
            .bind(&new.email)
            .fetch_one(&self.master)
            .await?;
        if taken.0 {
            return Err(AppError::Conflict(format!(
                "email already registered: {}",
                new.email
            )));
        }

        let tenant_id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO clients (id, name, email, phone, status) VALUES ($1, $2, $3, $4, 'provisioning')",
        )
        .bind(tenant_id)
        .bind(&new.name)
        .bind(&new.email)
        .bind(&new.phone)
        .execute(&self.master)
        .await?;

        let client_seed = ClientSeed {
            id: tenant_id,
            name: new.name.clone(),
            email: new.email.clone(),
            phone: new.phone.clone(),
        };
        match self
            .provisioner
            .create_tenant_database(tenant_id, Some(&client_seed), new.admin_user.as_ref())
            .await
        {
            Ok(database_name) => {
                sqlx::query(
                    "UPDATE clients SET database_name = $2, status = 'active', updated_at = NOW() WHERE id = $1",
                )
                .bind(tenant_id)
                .bind(&database_name)
                .execute(&self.master)
                .await?;
                self.get_tenant(tenant_id).await
            }
            Err(e) => {
                tracing::warn!(%tenant_id, error = %e,
                    "tenant provisioning failed, removing control-plane record");
                if let Err(te) = self.provisioner.delete_tenant_database(tenant_id).await {
                    tracing::warn!(%tenant_id, error = %te, "teardown after failed provisioning also failed");
                }
                if let Err(de) = sqlx::query("DELETE FROM clients WHERE id = $1")
                    .bind(tenant_id)
                    .execute(&self.master)
                    .await
                {
                    tracing::warn!(%tenant_id, error = %de, "failed to remove control-plane record");
                }
                Err(e)
            }
        }
    }

    pub async fn get_tenant(&self, tenant_id: Uuid) -> Result<TenantRecord, AppError> {
        let row: Option<TenantRow> = sqlx::query_as(
            "SELECT id, name, email, phone, database_name, status, created_at, updated_at
             FROM clients WHERE id = $1",
        )
        .bind(tenant_id)
        .fetch_optional(&self.master)
        .await?;
        row.map(row_to_record).transpose()?.ok_or_else(|| {
            AppError::NotFound(format!("tenant {} does not exist", tenant_id))
        })
    }

    pub async fn list_tenants(&self) -> Result<Vec<TenantRecord>, AppError> {
        let rows: Vec<TenantRow> = sqlx::query_as(
            "SELECT id, name, email, phone, database_name, status, created_at, updated_at
             FROM clients ORDER BY created_at",
        )
        .fetch_all(&self.master)
        .await?;
        rows.into_iter().map(row_to_record).collect()
    }

    /// Full deletion: drop the physical database and role first, then purge
    /// every control-plane row referencing the tenant in one transaction,
    /// in foreign-key dependency order.
    ///
    /// A control-plane failure after the physical drop leaves the two sides
    /// inconsistent; that is the one case that demands an operator, so it is
    /// logged at error severity and re-raised, never swallowed.
    pub async fn delete_tenant(&self, tenant_id: Uuid) -> Result<(), AppError> {
        self.get_tenant(tenant_id).await?;
        self.provisioner.delete_tenant_database(tenant_id).await?;
        if let Err(e) = self.cascade_control_plane_delete(tenant_id).await {
            tracing::error!(%tenant_id, error = %e,
                "control-plane cleanup failed after the tenant database was dropped; manual reconciliation required");
            return Err(e);
        }
        tracing::info!(%tenant_id, "tenant deleted");
        Ok(())
    }

    /// Guarded deletion. Refuses (with counts) when live data exists and
    /// `force` is unset; `soft_delete` only flips status to inactive.
    pub async fn delete_tenant_safe(
        &self,
        tenant_id: Uuid,
        opts: SafeDeleteOptions,
    ) -> Result<SafeDeleteOutcome, AppError> {
        self.get_tenant(tenant_id).await?;
        if opts.soft_delete {
            let users_deactivated = self
                .update_tenant_status(tenant_id, TenantStatus::Inactive)
                .await?;
            return Ok(SafeDeleteOutcome::SoftDeleted { users_deactivated });
        }
        let (users, stores, products) = self.dependent_counts(tenant_id).await?;
        if (users > 0 || stores > 0 || products > 0) && !opts.force {
            return Ok(SafeDeleteOutcome::Refused {
                users,
                stores,
                products,
            });
        }
        self.delete_tenant(tenant_id).await?;
        Ok(SafeDeleteOutcome::Deleted)
    }

    /// Set the tenant's status and cascade it to every user of the tenant in
    /// one transaction. Returns the number of users touched.
    pub async fn update_tenant_status(
        &self,
        tenant_id: Uuid,
        status: TenantStatus,
    ) -> Result<u64, AppError> {
        let mut tx = self.master.begin().await?;
        let tenant = sqlx::query("UPDATE clients SET status = $2, updated_at = NOW() WHERE id = $1")
            .bind(tenant_id)
            .bind(status.as_str())
            .execute(&mut *tx)
            .await?;
        if tenant.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("tenant {} does not exist", tenant_id)));
        }
        let users = sqlx::query("UPDATE users SET status = $2, updated_at = NOW() WHERE client_id = $1")
            .bind(tenant_id)
            .bind(status.as_str())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        tracing::info!(%tenant_id, status = status.as_str(), users = users.rows_affected(),
            "tenant status updated");
        Ok(users.rows_affected())
    }

    /// Dry-run report of what `delete_tenant` would remove.
    pub async fn preview_tenant_deletion(
        &self,
        tenant_id: Uuid,
    ) -> Result<DeletionPreview, AppError> {
        self.get_tenant(tenant_id).await?;
        let mut data_to_delete = Vec::new();
        for (table, scope) in CASCADE_DELETES {
            let (rows,): (i64,) = sqlx::query_as(&scope.count_sql(table))
                .bind(tenant_id)
                .fetch_one(&self.master)
                .await?;
            if rows > 0 {
                data_to_delete.push(TableCount {
                    table: (*table).to_string(),
                    rows,
                });
            }
        }
        let mut warnings = Vec::new();
        let mut can_delete = true;
        let database = self.provisioner.check_tenant_database_status(tenant_id).await;
        if database.status != "connected" {
            warnings.push(format!(
                "tenant database unreachable, physical deletion cannot be confirmed: {}",
                database.message.unwrap_or_default()
            ));
            can_delete = false;
        }
        Ok(DeletionPreview {
            data_to_delete,
            warnings,
            can_delete,
        })
    }

    pub async fn get_tenant_status(&self, tenant_id: Uuid) -> Result<TenantStatusReport, AppError> {
        let tenant = self.get_tenant(tenant_id).await?;
        let database = self.provisioner.check_tenant_database_status(tenant_id).await;
        Ok(TenantStatusReport { tenant, database })
    }

    pub async fn verify_tenant_schema(&self, tenant_id: Uuid) -> Result<SchemaReport, AppError> {
        self.get_tenant(tenant_id).await?;
        self.provisioner.verify_tenant_schema(tenant_id).await
    }

    pub async fn initialize_tenant_schema(&self, tenant_id: Uuid) -> Result<(), AppError> {
        self.get_tenant(tenant_id).await?;
        self.provisioner.initialize_schema(tenant_id).await
    }

    pub async fn get_tenant_connection_details(
        &self,
        tenant_id: Uuid,
    ) -> Result<ConnectionDetails, AppError> {
        self.get_tenant(tenant_id).await?;
        let cred = self.credentials.get(tenant_id).await?.ok_or_else(|| {
            AppError::NotFound(format!("no stored credentials for tenant {}", tenant_id))
        })?;
        Ok(ConnectionDetails {
            database_name: cred.database_name,
            username: cred.username,
            password: cred.password,
        })
    }

    pub async fn test_tenant_permissions(
        &self,
        tenant_id: Uuid,
    ) -> Result<PermissionReport, AppError> {
        self.get_tenant(tenant_id).await?;
        self.provisioner.test_tenant_permissions(tenant_id).await
    }

    async fn cascade_control_plane_delete(&self, tenant_id: Uuid) -> Result<(), AppError> {
        let mut tx = self.master.begin().await?;
        for (table, scope) in CASCADE_DELETES {
            sqlx::query(&scope.delete_sql(table))
                .bind(tenant_id)
                .execute(&mut *tx)
                .await?;
        }
        sqlx::query("DELETE FROM clients WHERE id = $1")
            .bind(tenant_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn dependent_counts(&self, tenant_id: Uuid) -> Result<(i64, i64, i64), AppError> {
        let counts: (i64, i64, i64) = sqlx::query_as(
            "SELECT (SELECT count(*) FROM users WHERE client_id = $1),
                    (SELECT count(*) FROM stores WHERE client_id = $1),
                    (SELECT count(*) FROM products WHERE client_id = $1)",
        )
        .bind(tenant_id)
        .fetch_one(&self.master)
        .await?;
        Ok(counts)
    }
}

type TenantRow = (
    Uuid,
    String,
    String,
    Option<String>,
    Option<String>,
    String,
    DateTime<Utc>,
    DateTime<Utc>,
);

fn row_to_record(row: TenantRow) -> Result<TenantRecord, AppError> {
    let (id, name, email, phone, database_name, status, created_at, updated_at) = row;
    Ok(TenantRecord {
        id,
        name,
        email,
        phone,
        database_name,
        status: status.parse()?,
        created_at,
        updated_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provision::APP_SCHEMA_SQL;

    fn position(table: &str) -> usize {
        CASCADE_DELETES
            .iter()
            .position(|(t, _)| *t == table)
            .unwrap_or_else(|| panic!("{} missing from cascade list", table))
    }

    #[test]
    fn leaf_tables_precede_their_parents() {
        for (table, _) in CASCADE_DELETES {
            if !matches!(*table, "users" | "stores" | "products") {
                assert!(position(table) < position("users"), "{} must precede users", table);
            }
        }
        assert!(position("sale_adjustments") < position("sales"));
        assert!(position("sale_returns") < position("sales"));
        assert!(position("role_assignments") < position("role_templates"));
        assert!(position("file_upload_errors") < position("file_uploads"));
        assert!(position("purchase_orders") < position("suppliers"));
        assert!(position("packs") < position("products"));
        assert!(position("user_stores") < position("stores"));
        assert!(position("sales") < position("stores"));
    }

    #[test]
    fn every_delete_is_tenant_scoped() {
        for (table, scope) in CASCADE_DELETES {
            let sql = scope.delete_sql(table);
            assert!(sql.contains("$1"), "{} delete is not tenant-scoped: {}", table, sql);
            assert!(sql.starts_with(&format!("DELETE FROM {} WHERE ", table)));
        }
    }

    #[test]
    fn cascade_list_matches_embedded_schema() {
        for (table, _) in CASCADE_DELETES {
            assert!(
                APP_SCHEMA_SQL.contains(&format!("CREATE TABLE IF NOT EXISTS {} ", table)),
                "{} not present in app_schema.sql",
                table
            );
        }
    }

    #[test]
    fn status_round_trips() {
        for status in [
            TenantStatus::Active,
            TenantStatus::Inactive,
            TenantStatus::Suspended,
            TenantStatus::Provisioning,
        ] {
            assert_eq!(status.as_str().parse::<TenantStatus>().unwrap(), status);
        }
        assert!("deleted".parse::<TenantStatus>().is_err());
    }

    #[test]
    fn count_sql_mirrors_delete_predicate() {
        for (table, scope) in CASCADE_DELETES {
            let delete = scope.delete_sql(table);
            let count = scope.count_sql(table);
            let delete_pred = delete.split(" WHERE ").nth(1).unwrap();
            let count_pred = count.split(" WHERE ").nth(1).unwrap();
            assert_eq!(delete_pred, count_pred, "{} preview diverges from delete", table);
        }
    }
}
