//! pgtenant: database-per-tenant provisioning and routing for PostgreSQL backends.

pub mod cache;
pub mod config;
pub mod context;
pub mod credentials;
pub mod error;
pub mod ident;
pub mod lifecycle;
pub mod middleware;
pub mod provision;
pub mod response;
pub mod routes;
pub mod state;
pub mod store;

pub use cache::ConnectionCache;
pub use config::Settings;
pub use context::{CallerIdentity, RequestContext, TenantResolver};
pub use credentials::{CredentialStore, TenantCredential};
pub use error::AppError;
pub use lifecycle::{NewTenant, SafeDeleteOptions, SafeDeleteOutcome, TenantRecord, TenantService, TenantStatus};
pub use middleware::{force_control_plane, Caller, TenantDb};
pub use provision::{ClientSeed, Provisioner, SchemaStrategy, UserSeed};
pub use routes::{common_routes, tenant_routes};
pub use state::AppState;
pub use store::{bootstrap_master_schema, ensure_database_exists};
