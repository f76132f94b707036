//! Department-scoped RBAC: graph administration, permission aggregation,
//! the active department pointer and post-commit cache invalidation.

pub mod active_department;
pub mod admin;
pub mod aggregator;
pub mod invalidation;

pub use active_department::ActiveDepartmentResolver;
pub use admin::{RbacAdmin, RolePermissionPatch, UserPermissionPatch};
pub use aggregator::PermissionAggregator;
pub use invalidation::{CacheInvalidator, InvalidationTarget};
