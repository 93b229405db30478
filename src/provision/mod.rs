//! Physical tenant database provisioning: schema application strategies and
//! the provisioner that creates/destroys tenant databases and roles.

mod provisioner;
mod schema;

pub use provisioner::{
    ClientSeed, DatabaseStatus, PermissionReport, Provisioner, SchemaReport, UserSeed,
};
pub use schema::{SchemaApplier, SchemaStrategy, SqlSchemaApplier, ToolSchemaApplier, APP_SCHEMA_SQL};
