//! HTTP routers: common health/version routes and tenant administration.

pub mod common;
pub mod tenants;

pub use common::common_routes;
pub use tenants::tenant_routes;
