//! Domain models.
//!
//! These are internal domain types; the API layer serializes them inside the
//! result envelope as-is (camelCase).

pub mod rbac;
pub mod token;
pub mod user;

pub use rbac::{
    Department, DepartmentGrants, Permission, PermissionGrants, Role, RolePermission,
    UserPermission, UserRole, UserRoleInDepartment,
};
pub use token::{
    AccessClaims, ActiveDepartmentEntry, AuthUser, BlacklistEntry, MirroredRefreshToken,
    RefreshToken, RefreshTokenMirror, TokenBundle, TokenType,
};
pub use user::{ProfileDetails, User, UserProfile};
