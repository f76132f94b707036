//! Routes each [`Command`] to the core service that owns it.

use serde::Serialize;
use serde_json::{Value, json};
use tracing::instrument;
use warden_core::auth::{ProfileUpdate, Registration};
use warden_core::rbac::{RolePermissionPatch, UserPermissionPatch};
use warden_core::{CallerContext, CoreError, CoreResult, Services};

use crate::commands::Command;
use crate::envelope::Envelope;

#[derive(Clone)]
pub struct Dispatcher {
    services: Services,
}

/// Serialize a successful payload into the envelope.
fn reply<T: Serialize>(result: CoreResult<T>, message: impl Into<String>) -> Envelope<Value> {
    let result = result.and_then(|data| {
        serde_json::to_value(data)
            .map_err(|e| CoreError::Internal(format!("serialize response: {e}")))
    });
    Envelope::from_result(result, message)
}

impl Dispatcher {
    pub fn new(services: Services) -> Self {
        Self { services }
    }

    pub fn services(&self) -> &Services {
        &self.services
    }

    #[instrument(skip_all)]
    pub async fn dispatch(&self, caller: &CallerContext, command: Command) -> Envelope<Value> {
        let s = &self.services;
        match command {
            // -- credentials -------------------------------------------------
            Command::Register {
                full_name,
                email,
                password,
                phone,
                bio,
                location,
                picture_url,
            } => {
                let input = Registration {
                    full_name,
                    email,
                    password,
                    phone,
                    bio,
                    location,
                    picture_url,
                };
                reply(s.credentials.register(input).await, "User registered")
            }
            Command::ChangePassword {
                current_password,
                new_password,
                confirm_password,
            } => {
                let result = async {
                    let user_id = caller.require_user()?;
                    s.credentials
                        .change_password(user_id, &current_password, &new_password, &confirm_password)
                        .await
                }
                .await;
                reply(result, "Password changed")
            }
            Command::UpdateProfile {
                full_name,
                phone,
                bio,
                location,
                picture_url,
            } => {
                let result = async {
                    let user_id = caller.require_user()?;
                    let update = ProfileUpdate {
                        full_name,
                        phone,
                        bio,
                        location,
                        picture_url,
                    };
                    s.credentials.update_profile(user_id, update).await
                }
                .await;
                reply(result, "Profile updated")
            }
            Command::ChangeEmail { new_email } => {
                let result = async {
                    let user_id = caller.require_user()?;
                    s.credentials.change_email(user_id, &new_email).await
                }
                .await;
                reply(result, "Email changed")
            }
            Command::GetMyProfile => {
                let result = async { s.credentials.profile(caller.require_user()?).await }.await;
                reply(result, "Profile retrieved")
            }

            // -- tokens ------------------------------------------------------
            Command::Login { email, password } => {
                reply(s.tokens.login(&email, &password).await, "Login successful")
            }
            Command::Refresh { refresh_token } => {
                reply(s.tokens.refresh(&refresh_token).await, "Token refreshed")
            }
            Command::Logout => reply(s.tokens.logout(caller).await, "Logged out"),
            Command::BlockToken { token, reason } => reply(
                s.tokens.block_token(&token, reason.as_deref()).await,
                "Token blocked",
            ),
            Command::BlockAllUserTokens { user_id, reason } => {
                match s.tokens.block_all_user_tokens(user_id, reason.as_deref()).await {
                    Ok(0) => Envelope::ok(json!({ "count": 0 }), "No active tokens"),
                    Ok(count) => Envelope::ok(json!({ "count": count }), format!("{count} tokens blocked")),
                    Err(err) => Envelope::failure(&err),
                }
            }

            // -- active department -------------------------------------------
            Command::GetActiveDepartment => {
                let result = async {
                    let user_id = caller.require_user()?;
                    s.active_departments.get(user_id).await
                }
                .await;
                reply(result, "Active department retrieved")
            }
            Command::SetActiveDepartment { department_id } => {
                let result = async {
                    let user_id = caller.require_user()?;
                    s.admin.get_department(department_id).await?;
                    s.active_departments.set(user_id, department_id).await
                }
                .await;
                reply(result, "Active department set")
            }
            Command::RemoveActiveDepartment => {
                let result = async {
                    let user_id = caller.require_user()?;
                    s.active_departments.remove(user_id).await
                }
                .await;
                reply(result, "Active department removed")
            }
            Command::HasActiveDepartment => {
                let result = async {
                    let user_id = caller.require_user()?;
                    s.active_departments.has_active(user_id).await
                }
                .await;
                reply(result, "Active department checked")
            }

            // -- permission queries ------------------------------------------
            Command::GetMyPermissions { department_id } => {
                let result = async {
                    let user_id = caller.require_user()?;
                    s.permissions.my_permissions(user_id, department_id).await
                }
                .await;
                reply(result, "Permissions retrieved")
            }
            Command::GetMyRolePermissions { department_id } => {
                let result = async {
                    let user_id = caller.require_user()?;
                    s.permissions.my_role_permissions(user_id, department_id).await
                }
                .await;
                reply(result, "Role permissions retrieved")
            }
            Command::GetDepartmentPermissions { department_id } => reply(
                s.permissions.department_grants(department_id).await,
                "Department permissions retrieved",
            ),

            // -- departments -------------------------------------------------
            Command::CreateDepartment { name } => {
                reply(s.admin.create_department(&name).await, "Department created")
            }
            Command::RenameDepartment { id, name } => {
                reply(s.admin.rename_department(id, &name).await, "Department updated")
            }
            Command::DeleteDepartment { id } => {
                reply(s.admin.delete_department(id).await, "Department deleted")
            }
            Command::GetDepartment { id } => {
                reply(s.admin.get_department(id).await, "Department retrieved")
            }
            Command::ListDepartments => {
                reply(s.admin.list_departments().await, "Departments retrieved")
            }

            // -- roles -------------------------------------------------------
            Command::CreateRole { name, description } => reply(
                s.admin.create_role(&name, description.as_deref()).await,
                "Role created",
            ),
            Command::UpdateRole {
                id,
                name,
                description,
            } => reply(
                s.admin
                    .update_role(id, name.as_deref(), description.as_deref())
                    .await,
                "Role updated",
            ),
            Command::DeleteRole { id } => reply(s.admin.delete_role(id).await, "Role deleted"),
            Command::GetRole { id } => reply(s.admin.get_role(id).await, "Role retrieved"),
            Command::ListRoles => reply(s.admin.list_roles().await, "Roles retrieved"),

            // -- permissions -------------------------------------------------
            Command::CreatePermission { name, description } => reply(
                s.admin
                    .create_permission(&name, description.as_deref())
                    .await,
                "Permission created",
            ),
            Command::UpdatePermission {
                id,
                name,
                description,
            } => reply(
                s.admin
                    .update_permission(id, name.as_deref(), description.as_deref())
                    .await,
                "Permission updated",
            ),
            Command::DeletePermission { id } => {
                reply(s.admin.delete_permission(id).await, "Permission deleted")
            }
            Command::GetPermission { id } => {
                reply(s.admin.get_permission(id).await, "Permission retrieved")
            }
            Command::ListPermissions => {
                reply(s.admin.list_permissions().await, "Permissions retrieved")
            }

            // -- role membership ---------------------------------------------
            Command::AssignRole { user_id, role_id } => {
                reply(s.admin.assign_role(user_id, role_id).await, "Role assigned")
            }
            Command::RevokeRole { user_id, role_id } => {
                reply(s.admin.revoke_role(user_id, role_id).await, "Role revoked")
            }
            Command::ListUserRoles { user_id } => {
                reply(s.admin.list_user_roles(user_id).await, "User roles retrieved")
            }
            Command::ScopeUserRole {
                user_role_id,
                department_id,
            } => reply(
                s.admin.scope_user_role(user_role_id, department_id).await,
                "Role scoped to department",
            ),
            Command::UnscopeUserRole { id } => reply(
                s.admin.unscope_user_role(id).await,
                "Role removed from department",
            ),
            Command::GetUserRolesInDepartment {
                user_id,
                department_id,
            } => reply(
                s.admin.user_roles_in_department(user_id, department_id).await,
                "User roles retrieved",
            ),

            // -- grants ------------------------------------------------------
            Command::AssignRolePermission {
                role_id,
                permission_id,
                department_id,
            } => reply(
                s.admin
                    .assign_role_permission(role_id, permission_id, department_id)
                    .await,
                "Permission assigned to role",
            ),
            Command::UpdateRolePermission {
                id,
                role_id,
                permission_id,
                department_id,
            } => {
                let patch = RolePermissionPatch {
                    role_id,
                    permission_id,
                    department_id,
                };
                reply(
                    s.admin.update_role_permission(id, patch).await,
                    "Role permission updated",
                )
            }
            Command::RevokeRolePermission { id } => reply(
                s.admin.revoke_role_permission(id).await,
                "Role permission revoked",
            ),
            Command::AssignUserPermission {
                user_id,
                permission_id,
                department_id,
            } => reply(
                s.admin
                    .assign_user_permission(user_id, permission_id, department_id)
                    .await,
                "Permission assigned to user",
            ),
            Command::UpdateUserPermission {
                id,
                user_id,
                permission_id,
                department_id,
            } => {
                let patch = UserPermissionPatch {
                    user_id,
                    permission_id,
                    department_id,
                };
                reply(
                    s.admin.update_user_permission(id, patch).await,
                    "User permission updated",
                )
            }
            Command::RevokeUserPermission { id } => reply(
                s.admin.revoke_user_permission(id).await,
                "User permission revoked",
            ),
        }
    }
}
