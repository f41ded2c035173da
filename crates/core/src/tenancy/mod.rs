//! Tenant isolation layer
//!
//! Three pieces, composed explicitly (no ambient context, no globals):
//!
//! - [`registry`] resolves tenant ids to tenant metadata (isolation mode,
//!   datasource locator, status).
//! - [`store`] defines the narrow data-access port (read-one, read-many,
//!   write, delete) plus its Postgres and in-memory implementations.
//! - [`guard`] decorates any store with per-operation tenant scoping:
//!   injected tenant ids on writes, recursive cross-tenant reference checks
//!   on relational payloads, and tenant-scoped rewrites of point lookups.
//! - [`lease_cache`] keeps bounded, TTL'd pools for tenants with dedicated
//!   datastores.

pub mod guard;
pub mod lease_cache;
pub mod registry;
pub mod store;

pub use guard::{TenantGuard, TenantScope};
pub use lease_cache::{CacheStats, ConnectionLeaseCache, EvictionReason};
pub use registry::{IsolationMode, Tenant, TenantRegistry, TenantStatus};
pub use store::{
    DataStore, DeleteOp, EntityKind, Filter, MemDataStore, PgDataStore, ReadMany, ReadOne, Record,
    Relation, WriteOp,
};
