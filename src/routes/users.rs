use std::collections::HashMap;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use chrono::{NaiveDateTime, Utc};
use diesel::{pg::upsert::excluded, prelude::*};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::info;
use uuid::Uuid;

use super::auth::revoke_all_refresh_tokens;
use crate::{
    audit::{self, AuditEvent, ClientInfo, RESOURCE_ROLE, RESOURCE_USER},
    auth::{
        password::{hash_password, validate_password_strength},
        permissions::{effective_level, require_admin, PermissionLevel},
        AuthenticatedUser,
    },
    error::{AppError, AppResult},
    models::{NewRole, NewUser, NewUserRole, Role, User},
    schema::{roles, user_roles, users},
    state::AppState,
    utils::json::required_if_present,
};

#[derive(Debug, Serialize)]
pub struct UserResponse {
    pub id: Uuid,
    pub username: String,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub full_name: String,
    pub is_active: bool,
    pub is_superuser: bool,
    pub last_login: Option<NaiveDateTime>,
    pub created_at: NaiveDateTime,
    pub permission_level: PermissionLevel,
    pub roles: Vec<String>,
}

fn to_user_response(user: User, granted: &[(String, PermissionLevel)]) -> UserResponse {
    let levels: Vec<PermissionLevel> = granted.iter().map(|(_, level)| *level).collect();
    UserResponse {
        full_name: user.full_name(),
        permission_level: effective_level(user.is_superuser, &levels),
        roles: granted.iter().map(|(name, _)| name.clone()).collect(),
        id: user.id,
        username: user.username,
        email: user.email,
        first_name: user.first_name,
        last_name: user.last_name,
        is_active: user.is_active,
        is_superuser: user.is_superuser,
        last_login: user.last_login,
        created_at: user.created_at,
    }
}

/// Active role grants for each of `user_ids`.
fn grants_by_user(
    conn: &mut PgConnection,
    user_ids: &[Uuid],
) -> AppResult<HashMap<Uuid, Vec<(String, PermissionLevel)>>> {
    let rows: Vec<(Uuid, String, String)> = user_roles::table
        .inner_join(roles::table)
        .filter(user_roles::user_id.eq_any(user_ids))
        .filter(user_roles::is_active.eq(true))
        .filter(roles::is_active.eq(true))
        .select((user_roles::user_id, roles::name, roles::permission_level))
        .order(roles::name.asc())
        .load(conn)?;

    let mut grants: HashMap<Uuid, Vec<(String, PermissionLevel)>> = HashMap::new();
    for (user_id, name, level) in rows {
        if let Ok(level) = level.parse() {
            grants.entry(user_id).or_default().push((name, level));
        }
    }
    Ok(grants)
}

fn load_user_response(conn: &mut PgConnection, user_id: Uuid) -> AppResult<UserResponse> {
    let user: User = users::table.find(user_id).first(conn)?;
    let grants = grants_by_user(conn, &[user_id])?;
    Ok(to_user_response(
        user,
        grants.get(&user_id).map(Vec::as_slice).unwrap_or_default(),
    ))
}

fn audit_view(user: &UserResponse) -> Value {
    json!({
        "username": user.username,
        "email": user.email,
        "first_name": user.first_name,
        "last_name": user.last_name,
        "is_active": user.is_active,
        "is_superuser": user.is_superuser,
        "roles": user.roles,
    })
}

pub async fn list_users(
    State(state): State<AppState>,
    user: AuthenticatedUser,
) -> AppResult<Json<Vec<UserResponse>>> {
    let mut conn = state.db()?;
    require_admin(&mut conn, &user)?;

    let records: Vec<User> = users::table.order(users::username.asc()).load(&mut conn)?;
    let ids: Vec<Uuid> = records.iter().map(|record| record.id).collect();
    let grants = grants_by_user(&mut conn, &ids)?;

    Ok(Json(
        records
            .into_iter()
            .map(|record| {
                let granted = grants.get(&record.id).map(Vec::as_slice).unwrap_or_default();
                to_user_response(record, granted)
            })
            .collect(),
    ))
}

pub async fn get_user(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
    user: AuthenticatedUser,
) -> AppResult<Json<UserResponse>> {
    let mut conn = state.db()?;
    if user.user_id != user_id {
        require_admin(&mut conn, &user)?;
    }
    Ok(Json(load_user_response(&mut conn, user_id)?))
}

#[derive(Deserialize)]
pub struct CreateUserRequest {
    pub username: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    pub password: String,
    #[serde(default)]
    pub is_superuser: bool,
}

pub async fn create_user(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    client: ClientInfo,
    Json(payload): Json<CreateUserRequest>,
) -> AppResult<(StatusCode, Json<UserResponse>)> {
    let mut conn = state.db()?;
    require_admin(&mut conn, &user)?;

    let username = payload.username.trim().to_string();
    if username.is_empty() {
        return Err(AppError::bad_request("username is required"));
    }
    validate_password_strength(&payload.password).map_err(AppError::bad_request)?;
    let password_hash = hash_password(&payload.password)?;

    let taken: bool = diesel::select(diesel::dsl::exists(
        users::table.filter(users::username.eq(&username)),
    ))
    .get_result(&mut conn)?;
    if taken {
        return Err(AppError::conflict(format!("username '{username}' is already taken")));
    }

    let created = conn.transaction::<_, AppError, _>(|conn| {
        let record: User = diesel::insert_into(users::table)
            .values(NewUser {
                id: Uuid::new_v4(),
                username,
                email: payload.email.trim().to_string(),
                first_name: payload.first_name.trim().to_string(),
                last_name: payload.last_name.trim().to_string(),
                password_hash,
                is_superuser: payload.is_superuser,
            })
            .get_result(conn)?;
        let response = to_user_response(record, &[]);

        audit::record(
            conn,
            AuditEvent::new(
                Some(user.user_id),
                "user.create",
                RESOURCE_USER,
                response.id,
                format!("Created user {}", response.username),
            )
            .new_values(audit_view(&response)),
            &client,
        )?;
        Ok(response)
    })?;

    info!(user_id = %created.id, username = %created.username, "user created");
    Ok((StatusCode::CREATED, Json(created)))
}

pub async fn update_user(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
    user: AuthenticatedUser,
    client: ClientInfo,
    Json(payload): Json<Value>,
) -> AppResult<Json<UserResponse>> {
    let mut conn = state.db()?;
    require_admin(&mut conn, &user)?;

    let email: Option<String> =
        required_if_present(&payload, "email").map_err(AppError::bad_request)?;
    let first_name: Option<String> =
        required_if_present(&payload, "first_name").map_err(AppError::bad_request)?;
    let last_name: Option<String> =
        required_if_present(&payload, "last_name").map_err(AppError::bad_request)?;
    let is_active: Option<bool> =
        required_if_present(&payload, "is_active").map_err(AppError::bad_request)?;

    if email.is_none() && first_name.is_none() && last_name.is_none() && is_active.is_none() {
        return Err(AppError::bad_request("no changes provided"));
    }
    if is_active == Some(false) && user_id == user.user_id {
        return Err(AppError::bad_request("you cannot deactivate your own account"));
    }

    let before = load_user_response(&mut conn, user_id)?;
    let updated = conn.transaction::<_, AppError, _>(|conn| {
        let current: User = users::table.find(user_id).for_update().first(conn)?;
        diesel::update(users::table.find(user_id))
            .set((
                users::email.eq(email.map(|v| v.trim().to_string()).unwrap_or(current.email)),
                users::first_name
                    .eq(first_name.map(|v| v.trim().to_string()).unwrap_or(current.first_name)),
                users::last_name
                    .eq(last_name.map(|v| v.trim().to_string()).unwrap_or(current.last_name)),
                users::is_active.eq(is_active.unwrap_or(current.is_active)),
                users::updated_at.eq(Utc::now().naive_utc()),
            ))
            .execute(conn)?;

        if is_active == Some(false) {
            revoke_all_refresh_tokens(conn, user_id)?;
        }

        let after = load_user_response(conn, user_id)?;
        audit::record(
            conn,
            AuditEvent::new(
                Some(user.user_id),
                "user.update",
                RESOURCE_USER,
                user_id,
                format!("Updated user {}", after.username),
            )
            .old(audit_view(&before))
            .new_values(audit_view(&after)),
            &client,
        )?;
        Ok(after)
    })?;

    Ok(Json(updated))
}

#[derive(Deserialize)]
pub struct ResetPasswordRequest {
    pub new_password: String,
}

pub async fn reset_password(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
    user: AuthenticatedUser,
    client: ClientInfo,
    Json(payload): Json<ResetPasswordRequest>,
) -> AppResult<StatusCode> {
    let mut conn = state.db()?;
    require_admin(&mut conn, &user)?;
    validate_password_strength(&payload.new_password).map_err(AppError::bad_request)?;
    let password_hash = hash_password(&payload.new_password)?;

    conn.transaction::<_, AppError, _>(|conn| {
        let target: User = users::table.find(user_id).for_update().first(conn)?;
        diesel::update(users::table.find(user_id))
            .set((
                users::password_hash.eq(password_hash),
                users::updated_at.eq(Utc::now().naive_utc()),
            ))
            .execute(conn)?;
        revoke_all_refresh_tokens(conn, user_id)?;
        audit::record(
            conn,
            AuditEvent::new(
                Some(user.user_id),
                "user.reset_password",
                RESOURCE_USER,
                user_id,
                format!("Reset password for {}", target.username),
            )
            .new_values(json!({ "password_reset": true })),
            &client,
        )?;
        Ok(())
    })?;

    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
pub struct AssignableQuery {
    pub level: Option<String>,
}

#[derive(Serialize)]
pub struct AssignableUser {
    pub id: Uuid,
    pub username: String,
    pub full_name: String,
    pub permission_level: PermissionLevel,
}

pub async fn assignable_users(
    State(state): State<AppState>,
    Query(query): Query<AssignableQuery>,
    _user: AuthenticatedUser,
) -> AppResult<Json<Vec<AssignableUser>>> {
    let level: PermissionLevel = match query.level.as_deref() {
        Some(value) => value.parse().map_err(AppError::bad_request)?,
        None => PermissionLevel::Review,
    };

    let mut conn = state.db()?;
    let records: Vec<User> = users::table
        .filter(users::is_active.eq(true))
        .order(users::username.asc())
        .load(&mut conn)?;
    let ids: Vec<Uuid> = records.iter().map(|record| record.id).collect();
    let grants = grants_by_user(&mut conn, &ids)?;

    let assignable = records
        .into_iter()
        .filter_map(|record| {
            let levels: Vec<PermissionLevel> = grants
                .get(&record.id)
                .map(|granted| granted.iter().map(|(_, level)| *level).collect())
                .unwrap_or_default();
            let effective = effective_level(record.is_superuser, &levels);
            (effective >= level).then(|| AssignableUser {
                id: record.id,
                full_name: record.full_name(),
                username: record.username,
                permission_level: effective,
            })
        })
        .collect();

    Ok(Json(assignable))
}

pub async fn list_roles(
    State(state): State<AppState>,
    _user: AuthenticatedUser,
) -> AppResult<Json<Vec<Role>>> {
    let mut conn = state.db()?;
    let records = roles::table
        .order((roles::module.asc(), roles::name.asc()))
        .load(&mut conn)?;
    Ok(Json(records))
}

#[derive(Deserialize)]
pub struct CreateRoleRequest {
    pub name: String,
    pub module: String,
    pub permission_level: String,
    #[serde(default)]
    pub description: String,
}

pub async fn create_role(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    client: ClientInfo,
    Json(payload): Json<CreateRoleRequest>,
) -> AppResult<(StatusCode, Json<Role>)> {
    let mut conn = state.db()?;
    require_admin(&mut conn, &user)?;

    let name = payload.name.trim().to_string();
    let module = payload.module.trim().to_string();
    if name.is_empty() || module.is_empty() {
        return Err(AppError::bad_request("name and module are required"));
    }
    let level: PermissionLevel = payload
        .permission_level
        .parse()
        .map_err(AppError::bad_request)?;

    let role = conn.transaction::<_, AppError, _>(|conn| {
        let role: Role = diesel::insert_into(roles::table)
            .values(NewRole {
                id: Uuid::new_v4(),
                name,
                module,
                permission_level: level.as_str().to_string(),
                description: payload.description.trim().to_string(),
            })
            .get_result(conn)?;
        audit::record(
            conn,
            AuditEvent::new(
                Some(user.user_id),
                "role.create",
                RESOURCE_ROLE,
                role.id,
                format!("Created role {}", role.name),
            )
            .new_values(json!({
                "name": role.name,
                "module": role.module,
                "permission_level": role.permission_level,
            })),
            &client,
        )?;
        Ok(role)
    })?;

    Ok((StatusCode::CREATED, Json(role)))
}

#[derive(Deserialize)]
pub struct AssignRoleRequest {
    pub role_id: Uuid,
}

pub async fn assign_role(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
    user: AuthenticatedUser,
    client: ClientInfo,
    Json(payload): Json<AssignRoleRequest>,
) -> AppResult<Json<UserResponse>> {
    let mut conn = state.db()?;
    require_admin(&mut conn, &user)?;

    let updated = conn.transaction::<_, AppError, _>(|conn| {
        let target: User = users::table.find(user_id).first(conn)?;
        let role: Role = roles::table
            .find(payload.role_id)
            .first(conn)
            .optional()?
            .ok_or_else(|| AppError::bad_request("unknown role"))?;
        if !role.is_active {
            return Err(AppError::bad_request("role is inactive"));
        }

        diesel::insert_into(user_roles::table)
            .values(NewUserRole {
                id: Uuid::new_v4(),
                user_id,
                role_id: role.id,
                assigned_by: Some(user.user_id),
            })
            .on_conflict((user_roles::user_id, user_roles::role_id))
            .do_update()
            .set((
                user_roles::is_active.eq(true),
                user_roles::assigned_by.eq(excluded(user_roles::assigned_by)),
                user_roles::assigned_at.eq(Utc::now().naive_utc()),
            ))
            .execute(conn)?;

        audit::record(
            conn,
            AuditEvent::new(
                Some(user.user_id),
                "user.assign_role",
                RESOURCE_USER,
                user_id,
                format!("Assigned role {} to {}", role.name, target.username),
            )
            .new_values(json!({ "role_id": role.id, "role": role.name })),
            &client,
        )?;
        load_user_response(conn, user_id)
    })?;

    Ok(Json(updated))
}

pub async fn revoke_role(
    State(state): State<AppState>,
    Path((user_id, role_id)): Path<(Uuid, Uuid)>,
    user: AuthenticatedUser,
    client: ClientInfo,
) -> AppResult<Json<UserResponse>> {
    let mut conn = state.db()?;
    require_admin(&mut conn, &user)?;

    let updated = conn.transaction::<_, AppError, _>(|conn| {
        let changed = diesel::update(
            user_roles::table
                .filter(user_roles::user_id.eq(user_id))
                .filter(user_roles::role_id.eq(role_id))
                .filter(user_roles::is_active.eq(true)),
        )
        .set(user_roles::is_active.eq(false))
        .execute(conn)?;
        if changed == 0 {
            return Err(AppError::not_found());
        }

        audit::record(
            conn,
            AuditEvent::new(
                Some(user.user_id),
                "user.revoke_role",
                RESOURCE_USER,
                user_id,
                "Role assignment deactivated",
            )
            .old(json!({ "role_id": role_id, "is_active": true }))
            .new_values(json!({ "role_id": role_id, "is_active": false })),
            &client,
        )?;
        load_user_response(conn, user_id)
    })?;

    Ok(Json(updated))
}
