//! PostgreSQL store backed by `sqlx`.
//!
//! Value-object columns are re-validated when rows are loaded; a row that no
//! longer parses is reported as [`StoreError::Corrupt`] instead of being
//! silently coerced.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::error::ErrorKind as DbErrorKind;
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use super::{
    Mutation, RbacStore, StoreError, StoreResult, TokenStore, Transactional, UnitOfWork,
    UserStore,
};
use crate::auth::password::HashedPassword;
use crate::models::{
    Department, DepartmentGrants, Permission, PermissionGrants, ProfileDetails, RefreshToken,
    Role, RolePermission, User, UserPermission, UserRole, UserRoleInDepartment,
};
use crate::values::{Email, EntityName, InvalidValue, PersonName, Phone};

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db) = &err {
            let constraint = db.constraint().unwrap_or_default().to_string();
            match db.kind() {
                DbErrorKind::UniqueViolation => return StoreError::UniqueViolation(constraint),
                DbErrorKind::ForeignKeyViolation => {
                    return StoreError::ForeignKeyViolation(constraint);
                }
                _ => {}
            }
        }
        StoreError::Backend(err.to_string())
    }
}

fn corrupt(err: InvalidValue) -> StoreError {
    StoreError::Corrupt(err.to_string())
}

// =============================================================================
// Rows
// =============================================================================

#[derive(Debug, sqlx::FromRow)]
struct UserRow {
    id: Uuid,
    full_name: String,
    email: String,
    password_hash: String,
    password_salt: String,
    phone: String,
    bio: Option<String>,
    location: Option<String>,
    picture_url: Option<String>,
    active_department_id: Option<Uuid>,
    created_at: DateTime<Utc>,
}

impl TryFrom<UserRow> for User {
    type Error = StoreError;

    fn try_from(row: UserRow) -> Result<Self, Self::Error> {
        Ok(User {
            id: row.id,
            full_name: PersonName::parse(&row.full_name).map_err(corrupt)?,
            email: Email::parse(&row.email).map_err(corrupt)?,
            password: HashedPassword::from_stored(row.password_hash, row.password_salt),
            phone: Phone::parse(&row.phone).map_err(corrupt)?,
            profile: ProfileDetails {
                bio: row.bio,
                location: row.location,
                picture_url: row.picture_url,
            },
            active_department_id: row.active_department_id,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct DepartmentRow {
    id: Uuid,
    name: String,
    created_at: DateTime<Utc>,
}

impl TryFrom<DepartmentRow> for Department {
    type Error = StoreError;

    fn try_from(row: DepartmentRow) -> Result<Self, Self::Error> {
        Ok(Department {
            id: row.id,
            name: EntityName::parse(&row.name).map_err(corrupt)?,
            created_at: row.created_at,
        })
    }
}

/// Shared shape of `roles` and `permissions`.
#[derive(Debug, sqlx::FromRow)]
struct NamedRow {
    id: Uuid,
    name: String,
    description: Option<String>,
}

impl TryFrom<NamedRow> for Role {
    type Error = StoreError;

    fn try_from(row: NamedRow) -> Result<Self, Self::Error> {
        Ok(Role {
            id: row.id,
            name: EntityName::parse(&row.name).map_err(corrupt)?,
            description: row.description,
        })
    }
}

impl TryFrom<NamedRow> for Permission {
    type Error = StoreError;

    fn try_from(row: NamedRow) -> Result<Self, Self::Error> {
        Ok(Permission {
            id: row.id,
            name: EntityName::parse(&row.name).map_err(corrupt)?,
            description: row.description,
        })
    }
}

fn convert_all<R, T>(rows: Vec<R>) -> StoreResult<Vec<T>>
where
    T: TryFrom<R, Error = StoreError>,
{
    rows.into_iter().map(T::try_from).collect()
}

const USER_COLUMNS: &str = "id, full_name, email, password_hash, password_salt, phone, bio, \
                            location, picture_url, active_department_id, created_at";

// =============================================================================
// Store
// =============================================================================

/// Postgres-backed [`Store`](super::Store).
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run the embedded migrations from `warden_core/migrations/`.
    pub async fn migrate(&self) -> Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("./migrations").run(&self.pool).await
    }
}

fn expect_row(affected: u64, table: &str, id: Uuid) -> StoreResult<()> {
    if affected == 0 {
        return Err(StoreError::RowNotFound(format!("{table}:{id}")));
    }
    Ok(())
}

async fn apply(tx: &mut Transaction<'_, Postgres>, mutation: Mutation) -> StoreResult<()> {
    match mutation {
        Mutation::InsertUser(user) => {
            sqlx::query(
                "INSERT INTO users (id, full_name, email, password_hash, password_salt, phone, \
                 bio, location, picture_url, active_department_id, created_at) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
            )
            .bind(user.id)
            .bind(user.full_name.as_str())
            .bind(user.email.as_str())
            .bind(user.password.hash())
            .bind(user.password.salt())
            .bind(user.phone.as_str())
            .bind(&user.profile.bio)
            .bind(&user.profile.location)
            .bind(&user.profile.picture_url)
            .bind(user.active_department_id)
            .bind(user.created_at)
            .execute(&mut **tx)
            .await?;
        }
        Mutation::UpdateUser(user) => {
            let res = sqlx::query(
                "UPDATE users SET full_name = $2, email = $3, password_hash = $4, \
                 password_salt = $5, phone = $6, bio = $7, location = $8, picture_url = $9, \
                 active_department_id = $10 WHERE id = $1",
            )
            .bind(user.id)
            .bind(user.full_name.as_str())
            .bind(user.email.as_str())
            .bind(user.password.hash())
            .bind(user.password.salt())
            .bind(user.phone.as_str())
            .bind(&user.profile.bio)
            .bind(&user.profile.location)
            .bind(&user.profile.picture_url)
            .bind(user.active_department_id)
            .execute(&mut **tx)
            .await?;
            expect_row(res.rows_affected(), "users", user.id)?;
        }
        Mutation::SetActiveDepartment {
            user_id,
            department_id,
        } => {
            let res = sqlx::query("UPDATE users SET active_department_id = $2 WHERE id = $1")
                .bind(user_id)
                .bind(department_id)
                .execute(&mut **tx)
                .await?;
            expect_row(res.rows_affected(), "users", user_id)?;
        }

        Mutation::InsertDepartment(dept) => {
            sqlx::query("INSERT INTO departments (id, name, created_at) VALUES ($1, $2, $3)")
                .bind(dept.id)
                .bind(dept.name.as_str())
                .bind(dept.created_at)
                .execute(&mut **tx)
                .await?;
        }
        Mutation::UpdateDepartment(dept) => {
            let res = sqlx::query("UPDATE departments SET name = $2 WHERE id = $1")
                .bind(dept.id)
                .bind(dept.name.as_str())
                .execute(&mut **tx)
                .await?;
            expect_row(res.rows_affected(), "departments", dept.id)?;
        }
        Mutation::DeleteDepartment(id) => {
            let res = sqlx::query("DELETE FROM departments WHERE id = $1")
                .bind(id)
                .execute(&mut **tx)
                .await?;
            expect_row(res.rows_affected(), "departments", id)?;
        }

        Mutation::InsertRole(role) => {
            sqlx::query("INSERT INTO roles (id, name, description) VALUES ($1, $2, $3)")
                .bind(role.id)
                .bind(role.name.as_str())
                .bind(&role.description)
                .execute(&mut **tx)
                .await?;
        }
        Mutation::UpdateRole(role) => {
            let res = sqlx::query("UPDATE roles SET name = $2, description = $3 WHERE id = $1")
                .bind(role.id)
                .bind(role.name.as_str())
                .bind(&role.description)
                .execute(&mut **tx)
                .await?;
            expect_row(res.rows_affected(), "roles", role.id)?;
        }
        Mutation::DeleteRole(id) => {
            let res = sqlx::query("DELETE FROM roles WHERE id = $1")
                .bind(id)
                .execute(&mut **tx)
                .await?;
            expect_row(res.rows_affected(), "roles", id)?;
        }

        Mutation::InsertPermission(perm) => {
            sqlx::query("INSERT INTO permissions (id, name, description) VALUES ($1, $2, $3)")
                .bind(perm.id)
                .bind(perm.name.as_str())
                .bind(&perm.description)
                .execute(&mut **tx)
                .await?;
        }
        Mutation::UpdatePermission(perm) => {
            let res =
                sqlx::query("UPDATE permissions SET name = $2, description = $3 WHERE id = $1")
                    .bind(perm.id)
                    .bind(perm.name.as_str())
                    .bind(&perm.description)
                    .execute(&mut **tx)
                    .await?;
            expect_row(res.rows_affected(), "permissions", perm.id)?;
        }
        Mutation::DeletePermission(id) => {
            let res = sqlx::query("DELETE FROM permissions WHERE id = $1")
                .bind(id)
                .execute(&mut **tx)
                .await?;
            expect_row(res.rows_affected(), "permissions", id)?;
        }

        Mutation::InsertUserRole(row) => {
            sqlx::query("INSERT INTO user_roles (id, user_id, role_id) VALUES ($1, $2, $3)")
                .bind(row.id)
                .bind(row.user_id)
                .bind(row.role_id)
                .execute(&mut **tx)
                .await?;
        }
        Mutation::DeleteUserRole(id) => {
            let res = sqlx::query("DELETE FROM user_roles WHERE id = $1")
                .bind(id)
                .execute(&mut **tx)
                .await?;
            expect_row(res.rows_affected(), "user_roles", id)?;
        }
        Mutation::InsertUserRoleDepartment(row) => {
            sqlx::query(
                "INSERT INTO user_role_departments (id, user_role_id, department_id) \
                 VALUES ($1, $2, $3)",
            )
            .bind(row.id)
            .bind(row.user_role_id)
            .bind(row.department_id)
            .execute(&mut **tx)
            .await?;
        }
        Mutation::DeleteUserRoleDepartment(id) => {
            let res = sqlx::query("DELETE FROM user_role_departments WHERE id = $1")
                .bind(id)
                .execute(&mut **tx)
                .await?;
            expect_row(res.rows_affected(), "user_role_departments", id)?;
        }

        Mutation::InsertRolePermission(row) => {
            sqlx::query(
                "INSERT INTO role_permissions (id, role_id, permission_id, department_id) \
                 VALUES ($1, $2, $3, $4)",
            )
            .bind(row.id)
            .bind(row.role_id)
            .bind(row.permission_id)
            .bind(row.department_id)
            .execute(&mut **tx)
            .await?;
        }
        Mutation::UpdateRolePermission(row) => {
            let res = sqlx::query(
                "UPDATE role_permissions SET role_id = $2, permission_id = $3, \
                 department_id = $4 WHERE id = $1",
            )
            .bind(row.id)
            .bind(row.role_id)
            .bind(row.permission_id)
            .bind(row.department_id)
            .execute(&mut **tx)
            .await?;
            expect_row(res.rows_affected(), "role_permissions", row.id)?;
        }
        Mutation::DeleteRolePermission(id) => {
            let res = sqlx::query("DELETE FROM role_permissions WHERE id = $1")
                .bind(id)
                .execute(&mut **tx)
                .await?;
            expect_row(res.rows_affected(), "role_permissions", id)?;
        }
        Mutation::InsertUserPermission(row) => {
            sqlx::query(
                "INSERT INTO user_permissions (id, user_id, permission_id, department_id) \
                 VALUES ($1, $2, $3, $4)",
            )
            .bind(row.id)
            .bind(row.user_id)
            .bind(row.permission_id)
            .bind(row.department_id)
            .execute(&mut **tx)
            .await?;
        }
        Mutation::UpdateUserPermission(row) => {
            let res = sqlx::query(
                "UPDATE user_permissions SET user_id = $2, permission_id = $3, \
                 department_id = $4 WHERE id = $1",
            )
            .bind(row.id)
            .bind(row.user_id)
            .bind(row.permission_id)
            .bind(row.department_id)
            .execute(&mut **tx)
            .await?;
            expect_row(res.rows_affected(), "user_permissions", row.id)?;
        }
        Mutation::DeleteUserPermission(id) => {
            let res = sqlx::query("DELETE FROM user_permissions WHERE id = $1")
                .bind(id)
                .execute(&mut **tx)
                .await?;
            expect_row(res.rows_affected(), "user_permissions", id)?;
        }

        Mutation::InsertRefreshToken(token) => {
            sqlx::query(
                "INSERT INTO refresh_tokens (id, user_id, token_hash, created_at, expires_at, \
                 revoked_at, revoked_by) VALUES ($1, $2, $3, $4, $5, $6, $7)",
            )
            .bind(token.id)
            .bind(token.user_id)
            .bind(&token.token_hash)
            .bind(token.created_at)
            .bind(token.expires_at)
            .bind(token.revoked_at)
            .bind(&token.revoked_by)
            .execute(&mut **tx)
            .await?;
        }
        Mutation::RevokeRefreshToken {
            id,
            revoked_at,
            reason,
        } => {
            let res = sqlx::query(
                "UPDATE refresh_tokens SET revoked_at = $2, revoked_by = $3 WHERE id = $1",
            )
            .bind(id)
            .bind(revoked_at)
            .bind(reason)
            .execute(&mut **tx)
            .await?;
            expect_row(res.rows_affected(), "refresh_tokens", id)?;
        }
    }
    Ok(())
}

#[async_trait]
impl Transactional for PgStore {
    async fn commit(&self, work: UnitOfWork) -> StoreResult<()> {
        if work.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for mutation in work.into_mutations() {
            // Dropping `tx` on error rolls the transaction back.
            apply(&mut tx, mutation).await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl UserStore for PgStore {
    async fn find_user(&self, id: Uuid) -> StoreResult<Option<User>> {
        let row = sqlx::query_as::<_, UserRow>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(User::try_from).transpose()
    }

    async fn find_user_by_email(&self, email: &Email) -> StoreResult<Option<User>> {
        let row = sqlx::query_as::<_, UserRow>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE email = $1"
        ))
        .bind(email.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.map(User::try_from).transpose()
    }

    async fn email_exists(&self, email: &Email) -> StoreResult<bool> {
        let exists =
            sqlx::query_scalar::<_, bool>("SELECT EXISTS(SELECT 1 FROM users WHERE email = $1)")
                .bind(email.as_str())
                .fetch_one(&self.pool)
                .await?;
        Ok(exists)
    }

    async fn users_with_active_department(&self, department_id: Uuid) -> StoreResult<Vec<User>> {
        let rows = sqlx::query_as::<_, UserRow>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE active_department_id = $1 ORDER BY id"
        ))
        .bind(department_id)
        .fetch_all(&self.pool)
        .await?;
        convert_all(rows)
    }
}

#[async_trait]
impl RbacStore for PgStore {
    async fn find_department(&self, id: Uuid) -> StoreResult<Option<Department>> {
        let row = sqlx::query_as::<_, DepartmentRow>(
            "SELECT id, name, created_at FROM departments WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Department::try_from).transpose()
    }

    async fn list_departments(&self) -> StoreResult<Vec<Department>> {
        let rows = sqlx::query_as::<_, DepartmentRow>(
            "SELECT id, name, created_at FROM departments ORDER BY name, id",
        )
        .fetch_all(&self.pool)
        .await?;
        convert_all(rows)
    }

    async fn find_role(&self, id: Uuid) -> StoreResult<Option<Role>> {
        let row =
            sqlx::query_as::<_, NamedRow>("SELECT id, name, description FROM roles WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        row.map(Role::try_from).transpose()
    }

    async fn list_roles(&self) -> StoreResult<Vec<Role>> {
        let rows = sqlx::query_as::<_, NamedRow>(
            "SELECT id, name, description FROM roles ORDER BY name, id",
        )
        .fetch_all(&self.pool)
        .await?;
        convert_all(rows)
    }

    async fn find_permission(&self, id: Uuid) -> StoreResult<Option<Permission>> {
        let row = sqlx::query_as::<_, NamedRow>(
            "SELECT id, name, description FROM permissions WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Permission::try_from).transpose()
    }

    async fn list_permissions(&self) -> StoreResult<Vec<Permission>> {
        let rows = sqlx::query_as::<_, NamedRow>(
            "SELECT id, name, description FROM permissions ORDER BY name, id",
        )
        .fetch_all(&self.pool)
        .await?;
        convert_all(rows)
    }

    async fn permission_name_exists(
        &self,
        name: &str,
        excluding: Option<Uuid>,
    ) -> StoreResult<bool> {
        let exists = sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS(SELECT 1 FROM permissions \
             WHERE name = $1 AND ($2::uuid IS NULL OR id <> $2))",
        )
        .bind(name)
        .bind(excluding)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    async fn find_user_role(&self, id: Uuid) -> StoreResult<Option<UserRole>> {
        let row = sqlx::query_as::<_, UserRole>(
            "SELECT id, user_id, role_id FROM user_roles WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn find_user_role_by_pair(
        &self,
        user_id: Uuid,
        role_id: Uuid,
    ) -> StoreResult<Option<UserRole>> {
        let row = sqlx::query_as::<_, UserRole>(
            "SELECT id, user_id, role_id FROM user_roles WHERE user_id = $1 AND role_id = $2",
        )
        .bind(user_id)
        .bind(role_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn user_roles_for_user(&self, user_id: Uuid) -> StoreResult<Vec<UserRole>> {
        let rows = sqlx::query_as::<_, UserRole>(
            "SELECT id, user_id, role_id FROM user_roles WHERE user_id = $1 ORDER BY id",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn find_user_role_department(
        &self,
        id: Uuid,
    ) -> StoreResult<Option<UserRoleInDepartment>> {
        let row = sqlx::query_as::<_, UserRoleInDepartment>(
            "SELECT id, user_role_id, department_id FROM user_role_departments WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn user_role_department_exists(
        &self,
        user_role_id: Uuid,
        department_id: Uuid,
    ) -> StoreResult<bool> {
        let exists = sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS(SELECT 1 FROM user_role_departments \
             WHERE user_role_id = $1 AND department_id = $2)",
        )
        .bind(user_role_id)
        .bind(department_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    async fn user_role_departments(
        &self,
        user_role_id: Uuid,
    ) -> StoreResult<Vec<UserRoleInDepartment>> {
        let rows = sqlx::query_as::<_, UserRoleInDepartment>(
            "SELECT id, user_role_id, department_id FROM user_role_departments \
             WHERE user_role_id = $1 ORDER BY id",
        )
        .bind(user_role_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn roles_in_department(
        &self,
        user_id: Uuid,
        department_id: Uuid,
    ) -> StoreResult<Vec<Role>> {
        let rows = sqlx::query_as::<_, NamedRow>(
            "SELECT DISTINCT r.id, r.name, r.description \
             FROM roles r \
             JOIN user_roles ur ON ur.role_id = r.id \
             JOIN user_role_departments urd ON urd.user_role_id = ur.id \
             WHERE ur.user_id = $1 AND urd.department_id = $2 \
             ORDER BY r.name, r.id",
        )
        .bind(user_id)
        .bind(department_id)
        .fetch_all(&self.pool)
        .await?;
        convert_all(rows)
    }

    async fn departments_for_user(&self, user_id: Uuid) -> StoreResult<Vec<Department>> {
        let rows = sqlx::query_as::<_, DepartmentRow>(
            "SELECT DISTINCT d.id, d.name, d.created_at \
             FROM departments d \
             JOIN user_role_departments urd ON urd.department_id = d.id \
             JOIN user_roles ur ON ur.id = urd.user_role_id \
             WHERE ur.user_id = $1 \
             ORDER BY d.name, d.id",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        convert_all(rows)
    }

    async fn find_role_permission(&self, id: Uuid) -> StoreResult<Option<RolePermission>> {
        let row = sqlx::query_as::<_, RolePermission>(
            "SELECT id, role_id, permission_id, department_id FROM role_permissions WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn role_permission_exists(
        &self,
        role_id: Uuid,
        permission_id: Uuid,
        department_id: Uuid,
        excluding: Option<Uuid>,
    ) -> StoreResult<bool> {
        let exists = sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS(SELECT 1 FROM role_permissions \
             WHERE role_id = $1 AND permission_id = $2 AND department_id = $3 \
             AND ($4::uuid IS NULL OR id <> $4))",
        )
        .bind(role_id)
        .bind(permission_id)
        .bind(department_id)
        .bind(excluding)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    async fn permissions_for_role(
        &self,
        role_id: Uuid,
        department_id: Uuid,
    ) -> StoreResult<Vec<Permission>> {
        let rows = sqlx::query_as::<_, NamedRow>(
            "SELECT p.id, p.name, p.description \
             FROM permissions p \
             JOIN role_permissions rp ON rp.permission_id = p.id \
             WHERE rp.role_id = $1 AND rp.department_id = $2 \
             ORDER BY p.name, p.id",
        )
        .bind(role_id)
        .bind(department_id)
        .fetch_all(&self.pool)
        .await?;
        convert_all(rows)
    }

    async fn find_user_permission(&self, id: Uuid) -> StoreResult<Option<UserPermission>> {
        let row = sqlx::query_as::<_, UserPermission>(
            "SELECT id, user_id, permission_id, department_id FROM user_permissions WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn user_permission_exists(
        &self,
        user_id: Uuid,
        permission_id: Uuid,
        department_id: Uuid,
        excluding: Option<Uuid>,
    ) -> StoreResult<bool> {
        let exists = sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS(SELECT 1 FROM user_permissions \
             WHERE user_id = $1 AND permission_id = $2 AND department_id = $3 \
             AND ($4::uuid IS NULL OR id <> $4))",
        )
        .bind(user_id)
        .bind(permission_id)
        .bind(department_id)
        .bind(excluding)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    async fn permissions_for_user(
        &self,
        user_id: Uuid,
        department_id: Uuid,
    ) -> StoreResult<Vec<Permission>> {
        let rows = sqlx::query_as::<_, NamedRow>(
            "SELECT p.id, p.name, p.description \
             FROM permissions p \
             JOIN user_permissions up ON up.permission_id = p.id \
             WHERE up.user_id = $1 AND up.department_id = $2 \
             ORDER BY p.name, p.id",
        )
        .bind(user_id)
        .bind(department_id)
        .fetch_all(&self.pool)
        .await?;
        convert_all(rows)
    }

    async fn department_grants(&self, department_id: Uuid) -> StoreResult<DepartmentGrants> {
        let role_permissions = sqlx::query_as::<_, RolePermission>(
            "SELECT id, role_id, permission_id, department_id FROM role_permissions \
             WHERE department_id = $1 ORDER BY id",
        )
        .bind(department_id)
        .fetch_all(&self.pool)
        .await?;
        let user_permissions = sqlx::query_as::<_, UserPermission>(
            "SELECT id, user_id, permission_id, department_id FROM user_permissions \
             WHERE department_id = $1 ORDER BY id",
        )
        .bind(department_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(DepartmentGrants {
            department_id,
            role_permissions,
            user_permissions,
        })
    }

    async fn grants_for_permission(&self, permission_id: Uuid) -> StoreResult<PermissionGrants> {
        let role_permissions = sqlx::query_as::<_, RolePermission>(
            "SELECT id, role_id, permission_id, department_id FROM role_permissions \
             WHERE permission_id = $1 ORDER BY id",
        )
        .bind(permission_id)
        .fetch_all(&self.pool)
        .await?;
        let user_permissions = sqlx::query_as::<_, UserPermission>(
            "SELECT id, user_id, permission_id, department_id FROM user_permissions \
             WHERE permission_id = $1 ORDER BY id",
        )
        .bind(permission_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(PermissionGrants {
            role_permissions,
            user_permissions,
        })
    }

    async fn permission_in_use(&self, permission_id: Uuid) -> StoreResult<bool> {
        let in_use = sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS(SELECT 1 FROM role_permissions WHERE permission_id = $1) \
             OR EXISTS(SELECT 1 FROM user_permissions WHERE permission_id = $1)",
        )
        .bind(permission_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(in_use)
    }

    async fn role_in_use(&self, role_id: Uuid) -> StoreResult<bool> {
        let in_use = sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS(SELECT 1 FROM user_roles WHERE role_id = $1) \
             OR EXISTS(SELECT 1 FROM role_permissions WHERE role_id = $1)",
        )
        .bind(role_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(in_use)
    }

    async fn department_in_use(&self, department_id: Uuid) -> StoreResult<bool> {
        let in_use = sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS(SELECT 1 FROM user_role_departments WHERE department_id = $1) \
             OR EXISTS(SELECT 1 FROM role_permissions WHERE department_id = $1) \
             OR EXISTS(SELECT 1 FROM user_permissions WHERE department_id = $1)",
        )
        .bind(department_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(in_use)
    }
}

const TOKEN_COLUMNS: &str = "id, user_id, token_hash, created_at, expires_at, revoked_at, revoked_by";

#[async_trait]
impl TokenStore for PgStore {
    async fn find_refresh_token(&self, token_hash: &str) -> StoreResult<Option<RefreshToken>> {
        let row = sqlx::query_as::<_, RefreshToken>(&format!(
            "SELECT {TOKEN_COLUMNS} FROM refresh_tokens WHERE token_hash = $1"
        ))
        .bind(token_hash)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn active_refresh_tokens(
        &self,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> StoreResult<Vec<RefreshToken>> {
        let rows = sqlx::query_as::<_, RefreshToken>(&format!(
            "SELECT {TOKEN_COLUMNS} FROM refresh_tokens \
             WHERE user_id = $1 AND revoked_at IS NULL AND expires_at > $2 \
             ORDER BY created_at"
        ))
        .bind(user_id)
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn refresh_tokens_for_user(&self, user_id: Uuid) -> StoreResult<Vec<RefreshToken>> {
        let rows = sqlx::query_as::<_, RefreshToken>(&format!(
            "SELECT {TOKEN_COLUMNS} FROM refresh_tokens WHERE user_id = $1 ORDER BY created_at"
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn delete_reapable_refresh_tokens(&self, now: DateTime<Utc>) -> StoreResult<u64> {
        let result = sqlx::query(
            "DELETE FROM refresh_tokens WHERE revoked_at IS NOT NULL AND expires_at < $1",
        )
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}
