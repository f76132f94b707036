//! Typed commands accepted at the boundary.
//!
//! Commands are tagged by `op` (snake_case) and carry camelCase fields:
//!
//! ```json
//! {"op": "assign_role_permission", "roleId": "...", "permissionId": "...", "departmentId": "..."}
//! ```

use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum Command {
    // -- credentials ---------------------------------------------------------
    Register {
        full_name: String,
        email: String,
        password: String,
        phone: String,
        #[serde(default)]
        bio: Option<String>,
        #[serde(default)]
        location: Option<String>,
        #[serde(default)]
        picture_url: Option<String>,
    },
    ChangePassword {
        current_password: String,
        new_password: String,
        confirm_password: String,
    },
    UpdateProfile {
        full_name: String,
        phone: String,
        #[serde(default)]
        bio: Option<String>,
        #[serde(default)]
        location: Option<String>,
        #[serde(default)]
        picture_url: Option<String>,
    },
    ChangeEmail {
        new_email: String,
    },
    GetMyProfile,

    // -- tokens --------------------------------------------------------------
    Login {
        email: String,
        password: String,
    },
    Refresh {
        refresh_token: String,
    },
    Logout,
    BlockToken {
        token: String,
        #[serde(default)]
        reason: Option<String>,
    },
    BlockAllUserTokens {
        user_id: Uuid,
        #[serde(default)]
        reason: Option<String>,
    },

    // -- active department ---------------------------------------------------
    GetActiveDepartment,
    SetActiveDepartment {
        department_id: Uuid,
    },
    RemoveActiveDepartment,
    HasActiveDepartment,

    // -- permission queries --------------------------------------------------
    GetMyPermissions {
        #[serde(default)]
        department_id: Option<Uuid>,
    },
    GetMyRolePermissions {
        #[serde(default)]
        department_id: Option<Uuid>,
    },
    GetDepartmentPermissions {
        department_id: Uuid,
    },

    // -- departments ---------------------------------------------------------
    CreateDepartment {
        name: String,
    },
    RenameDepartment {
        id: Uuid,
        name: String,
    },
    DeleteDepartment {
        id: Uuid,
    },
    GetDepartment {
        id: Uuid,
    },
    ListDepartments,

    // -- roles ---------------------------------------------------------------
    CreateRole {
        name: String,
        #[serde(default)]
        description: Option<String>,
    },
    UpdateRole {
        id: Uuid,
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        description: Option<String>,
    },
    DeleteRole {
        id: Uuid,
    },
    GetRole {
        id: Uuid,
    },
    ListRoles,

    // -- permissions ---------------------------------------------------------
    CreatePermission {
        name: String,
        #[serde(default)]
        description: Option<String>,
    },
    UpdatePermission {
        id: Uuid,
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        description: Option<String>,
    },
    DeletePermission {
        id: Uuid,
    },
    GetPermission {
        id: Uuid,
    },
    ListPermissions,

    // -- role membership -----------------------------------------------------
    AssignRole {
        user_id: Uuid,
        role_id: Uuid,
    },
    RevokeRole {
        user_id: Uuid,
        role_id: Uuid,
    },
    ListUserRoles {
        user_id: Uuid,
    },
    ScopeUserRole {
        user_role_id: Uuid,
        department_id: Uuid,
    },
    UnscopeUserRole {
        id: Uuid,
    },
    GetUserRolesInDepartment {
        user_id: Uuid,
        department_id: Uuid,
    },

    // -- grants --------------------------------------------------------------
    AssignRolePermission {
        role_id: Uuid,
        permission_id: Uuid,
        department_id: Uuid,
    },
    UpdateRolePermission {
        id: Uuid,
        #[serde(default)]
        role_id: Option<Uuid>,
        #[serde(default)]
        permission_id: Option<Uuid>,
        #[serde(default)]
        department_id: Option<Uuid>,
    },
    RevokeRolePermission {
        id: Uuid,
    },
    AssignUserPermission {
        user_id: Uuid,
        permission_id: Uuid,
        department_id: Uuid,
    },
    UpdateUserPermission {
        id: Uuid,
        #[serde(default)]
        user_id: Option<Uuid>,
        #[serde(default)]
        permission_id: Option<Uuid>,
        #[serde(default)]
        department_id: Option<Uuid>,
    },
    RevokeUserPermission {
        id: Uuid,
    },
}
